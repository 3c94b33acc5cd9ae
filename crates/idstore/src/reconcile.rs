//! Collection Reconciliation
//!
//! Computes the minimal insert/delete sets that turn a persisted child
//! collection into the in-memory target. Children are immutable by
//! replacement: a matched element is left untouched, never updated.
//!
//! The comparison key may differ from the storage key. Claims compare by
//! (type, value) while rows are deleted by their generated id; the caller
//! picks the key per collection.

/// Outcome of reconciling one child collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation<T> {
    pub to_delete: Vec<T>,
    pub to_insert: Vec<T>,
}

impl<T> Reconciliation<T> {
    pub fn is_unchanged(&self) -> bool {
        self.to_delete.is_empty() && self.to_insert.is_empty()
    }
}

/// Diff `prior` against `current` under the comparison key.
///
/// `prior == None` means the aggregate is brand new: nothing to delete and
/// no reason to have queried prior state, so the whole current set is
/// inserted.
pub fn reconcile<'a, T, K, F>(
    prior: Option<&'a [T]>,
    current: &'a [T],
    key: F,
) -> Reconciliation<T>
where
    T: Clone,
    K: PartialEq,
    F: Fn(&'a T) -> K,
{
    let Some(prior) = prior else {
        return Reconciliation {
            to_delete: Vec::new(),
            to_insert: current.to_vec(),
        };
    };

    let prior_keys: Vec<K> = prior.iter().map(&key).collect();
    let current_keys: Vec<K> = current.iter().map(&key).collect();

    let to_delete = prior
        .iter()
        .enumerate()
        .filter(|(i, _)| !current_keys.contains(&prior_keys[*i]))
        .map(|(_, item)| item.clone())
        .collect();

    let to_insert = current
        .iter()
        .enumerate()
        .filter(|(i, _)| !prior_keys.contains(&current_keys[*i]))
        .map(|(_, item)| item.clone())
        .collect();

    Reconciliation {
        to_delete,
        to_insert,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Claim {
        id: &'static str,
        claim_type: &'static str,
        claim_value: &'static str,
    }

    fn claim(id: &'static str, t: &'static str, v: &'static str) -> Claim {
        Claim {
            id,
            claim_type: t,
            claim_value: v,
        }
    }

    fn by_type_value(c: &Claim) -> (&str, &str) {
        (c.claim_type, c.claim_value)
    }

    #[test]
    fn identical_sets_are_a_no_op() {
        let current = vec![claim("1", "role", "admin"), claim("2", "org", "acme")];
        let outcome = reconcile(Some(&current), &current, by_type_value);
        assert!(outcome.is_unchanged());
    }

    #[test]
    fn missing_prior_inserts_everything() {
        let current = vec![claim("1", "role", "admin")];
        let outcome = reconcile(None, &current, by_type_value);
        assert!(outcome.to_delete.is_empty());
        assert_eq!(outcome.to_insert, current);
    }

    #[test]
    fn symmetric_difference() {
        let prior = vec![claim("1", "role", "admin"), claim("2", "org", "acme")];
        let current = vec![claim("", "org", "acme"), claim("", "scope", "read")];

        let outcome = reconcile(Some(&prior), &current, by_type_value);
        assert_eq!(outcome.to_delete, vec![claim("1", "role", "admin")]);
        assert_eq!(outcome.to_insert, vec![claim("", "scope", "read")]);
    }

    #[test]
    fn matching_ignores_the_storage_key() {
        // Same (type, value) on both sides but different row ids: matched,
        // so neither a delete nor an insert is produced.
        let prior = vec![claim("db-id", "role", "admin")];
        let current = vec![claim("other-id", "role", "admin")];
        let outcome = reconcile(Some(&prior), &current, by_type_value);
        assert!(outcome.is_unchanged());
    }

    #[test]
    fn applying_the_diff_reproduces_the_target_set() {
        let prior = vec![
            claim("1", "role", "admin"),
            claim("2", "org", "acme"),
            claim("3", "scope", "read"),
        ];
        let current = vec![
            claim("", "org", "acme"),
            claim("", "scope", "write"),
            claim("", "env", "prod"),
        ];

        let outcome = reconcile(Some(&prior), &current, by_type_value);

        // prior \ to_delete ∪ to_insert == current, compared by key.
        let mut result: Vec<(&str, &str)> = prior
            .iter()
            .filter(|c| !outcome.to_delete.contains(c))
            .chain(outcome.to_insert.iter())
            .map(by_type_value)
            .collect();
        let mut wanted: Vec<(&str, &str)> = current.iter().map(by_type_value).collect();
        result.sort_unstable();
        wanted.sort_unstable();
        assert_eq!(result, wanted);
    }

    #[test]
    fn duplicate_keys_on_one_side_do_not_invent_work() {
        let prior = vec![claim("1", "role", "admin")];
        let current = vec![claim("", "role", "admin"), claim("", "role", "admin")];
        let outcome = reconcile(Some(&prior), &current, by_type_value);
        assert!(outcome.is_unchanged());
    }
}
