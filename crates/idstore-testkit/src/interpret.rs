//! Statement Interpreter
//!
//! A deliberately small interpreter for the statement surface the stores
//! issue: single-table INSERT/UPDATE/DELETE/SELECT with explicit column
//! lists, positional `?` binds, and WHERE clauses that are conjunctions of
//! equality tests. Anything else is rejected, which keeps accidental SQL
//! drift in the stores visible in tests.

use std::collections::HashMap;

use idstore_context::{Result, Row, StoreError, Value};

pub type TableRow = HashMap<String, Value>;
pub type Tables = HashMap<String, Vec<TableRow>>;

/// Statement shape, used both for dispatch and for test assertions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Insert,
    Update,
    Delete,
    Select,
}

#[derive(Debug, Clone)]
pub struct Parsed {
    pub kind: StatementKind,
    pub table: String,
    detail: Detail,
}

#[derive(Debug, Clone)]
enum Detail {
    Insert { columns: Vec<String> },
    Update { sets: Vec<String>, wheres: Vec<String> },
    Delete { wheres: Vec<String> },
    Select { columns: Vec<String>, wheres: Vec<String> },
}

fn unsupported(sql: &str) -> StoreError {
    StoreError::backend(format!("unsupported statement: {sql}"))
}

pub fn parse(sql: &str) -> Result<Parsed> {
    let trimmed = sql.trim();
    if let Some(rest) = trimmed.strip_prefix("INSERT INTO ") {
        parse_insert(trimmed, rest)
    } else if let Some(rest) = trimmed.strip_prefix("UPDATE ") {
        parse_update(trimmed, rest)
    } else if let Some(rest) = trimmed.strip_prefix("DELETE FROM ") {
        parse_delete(trimmed, rest)
    } else if let Some(rest) = trimmed.strip_prefix("SELECT ") {
        parse_select(trimmed, rest)
    } else {
        Err(unsupported(trimmed))
    }
}

fn parse_insert(sql: &str, rest: &str) -> Result<Parsed> {
    // table (c1, c2, ...) VALUES (?, ?, ...)
    let open = rest.find('(').ok_or_else(|| unsupported(sql))?;
    let table = rest[..open].trim().to_string();
    let close = rest[open..].find(')').ok_or_else(|| unsupported(sql))? + open;
    let columns = split_list(&rest[open + 1..close]);
    if columns.is_empty() || !rest[close..].contains("VALUES") {
        return Err(unsupported(sql));
    }
    Ok(Parsed {
        kind: StatementKind::Insert,
        table,
        detail: Detail::Insert { columns },
    })
}

fn parse_update(sql: &str, rest: &str) -> Result<Parsed> {
    // table SET c1 = ?, c2 = ? WHERE k1 = ? AND k2 = ?
    let set_at = rest.find(" SET ").ok_or_else(|| unsupported(sql))?;
    let table = rest[..set_at].trim().to_string();
    let after_set = &rest[set_at + 5..];
    let (set_part, where_part) = match after_set.find(" WHERE ") {
        Some(idx) => (&after_set[..idx], Some(&after_set[idx + 7..])),
        None => (after_set, None),
    };
    let sets = split_assignments(sql, set_part, ", ")?;
    let wheres = match where_part {
        Some(clause) => split_assignments(sql, clause, " AND ")?,
        None => Vec::new(),
    };
    Ok(Parsed {
        kind: StatementKind::Update,
        table,
        detail: Detail::Update { sets, wheres },
    })
}

fn parse_delete(sql: &str, rest: &str) -> Result<Parsed> {
    let (table, wheres) = parse_table_and_where(sql, rest)?;
    Ok(Parsed {
        kind: StatementKind::Delete,
        table,
        detail: Detail::Delete { wheres },
    })
}

fn parse_select(sql: &str, rest: &str) -> Result<Parsed> {
    // c1, c2 FROM table WHERE k1 = ? AND k2 = ?
    let from_at = rest.find(" FROM ").ok_or_else(|| unsupported(sql))?;
    let columns = split_list(&rest[..from_at]);
    if columns.iter().any(|c| c == "*") {
        return Err(unsupported(sql));
    }
    let (table, wheres) = parse_table_and_where(sql, &rest[from_at + 6..])?;
    Ok(Parsed {
        kind: StatementKind::Select,
        table,
        detail: Detail::Select { columns, wheres },
    })
}

fn parse_table_and_where(sql: &str, rest: &str) -> Result<(String, Vec<String>)> {
    match rest.find(" WHERE ") {
        Some(idx) => {
            let table = rest[..idx].trim().to_string();
            let wheres = split_assignments(sql, &rest[idx + 7..], " AND ")?;
            Ok((table, wheres))
        }
        None => Ok((rest.trim().to_string(), Vec::new())),
    }
}

fn split_list(part: &str) -> Vec<String> {
    part.split(',')
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .collect()
}

/// Split `col = ?` pairs joined by `separator`, returning the column names.
fn split_assignments(sql: &str, part: &str, separator: &str) -> Result<Vec<String>> {
    part.split(separator)
        .map(|pair| {
            pair.trim()
                .strip_suffix("= ?")
                .map(|col| col.trim().to_string())
                .ok_or_else(|| unsupported(sql))
        })
        .collect()
}

fn matches(row: &TableRow, wheres: &[String], values: &[Value]) -> bool {
    wheres
        .iter()
        .zip(values)
        .all(|(column, value)| row.get(column) == Some(value))
}

fn check_params(sql_kind: &str, wanted: usize, got: usize) -> Result<()> {
    if wanted != got {
        return Err(StoreError::backend(format!(
            "{sql_kind} expects {wanted} parameters, got {got}"
        )));
    }
    Ok(())
}

/// Apply a mutating statement, returning the affected-row count.
pub fn execute(tables: &mut Tables, parsed: &Parsed, params: &[Value]) -> Result<u64> {
    match &parsed.detail {
        Detail::Insert { columns } => {
            check_params("insert", columns.len(), params.len())?;
            let row: TableRow = columns
                .iter()
                .cloned()
                .zip(params.iter().cloned())
                .collect();
            tables.entry(parsed.table.clone()).or_default().push(row);
            Ok(1)
        }
        Detail::Update { sets, wheres } => {
            check_params("update", sets.len() + wheres.len(), params.len())?;
            let (set_values, where_values) = params.split_at(sets.len());
            let rows = tables.entry(parsed.table.clone()).or_default();
            let mut affected = 0;
            for row in rows.iter_mut() {
                if matches(row, wheres, where_values) {
                    for (column, value) in sets.iter().zip(set_values) {
                        row.insert(column.clone(), value.clone());
                    }
                    affected += 1;
                }
            }
            Ok(affected)
        }
        Detail::Delete { wheres } => {
            check_params("delete", wheres.len(), params.len())?;
            let rows = tables.entry(parsed.table.clone()).or_default();
            let before = rows.len();
            rows.retain(|row| !matches(row, wheres, params));
            Ok((before - rows.len()) as u64)
        }
        Detail::Select { .. } => Err(StoreError::backend(
            "select statements must go through query",
        )),
    }
}

/// Run a select, materializing the requested columns in order.
pub fn query(tables: &Tables, parsed: &Parsed, params: &[Value]) -> Result<Vec<Row>> {
    let Detail::Select { columns, wheres } = &parsed.detail else {
        return Err(StoreError::backend("only select statements can be queried"));
    };
    check_params("select", wheres.len(), params.len())?;

    let Some(rows) = tables.get(&parsed.table) else {
        return Ok(Vec::new());
    };

    Ok(rows
        .iter()
        .filter(|row| matches(row, wheres, params))
        .map(|row| {
            columns
                .iter()
                .map(|column| {
                    (
                        column.clone(),
                        row.get(column).cloned().unwrap_or(Value::Null),
                    )
                })
                .collect::<Row>()
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(v: &str) -> Value {
        Value::Text(v.to_string())
    }

    #[test]
    fn insert_then_select_round_trips() {
        let mut tables = Tables::new();
        let insert = parse("INSERT INTO roles (id, name) VALUES (?, ?)").unwrap();
        assert_eq!(insert.kind, StatementKind::Insert);
        execute(&mut tables, &insert, &[text("r-1"), text("admin")]).unwrap();

        let select = parse("SELECT id, name FROM roles WHERE name = ?").unwrap();
        let rows = query(&tables, &select, &[text("admin")]).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].text("id").unwrap(), "r-1");
    }

    #[test]
    fn update_reports_affected_rows() {
        let mut tables = Tables::new();
        let insert = parse("INSERT INTO roles (id, name) VALUES (?, ?)").unwrap();
        execute(&mut tables, &insert, &[text("r-1"), text("admin")]).unwrap();

        let update = parse("UPDATE roles SET name = ? WHERE id = ?").unwrap();
        let affected =
            execute(&mut tables, &update, &[text("operator"), text("r-1")]).unwrap();
        assert_eq!(affected, 1);

        let missed =
            execute(&mut tables, &update, &[text("x"), text("r-404")]).unwrap();
        assert_eq!(missed, 0);
    }

    #[test]
    fn delete_with_conjunction() {
        let mut tables = Tables::new();
        let insert =
            parse("INSERT INTO principal_roles (principal_id, role_id) VALUES (?, ?)")
                .unwrap();
        execute(&mut tables, &insert, &[text("p-1"), text("r-1")]).unwrap();
        execute(&mut tables, &insert, &[text("p-1"), text("r-2")]).unwrap();

        let delete = parse(
            "DELETE FROM principal_roles WHERE principal_id = ? AND role_id = ?",
        )
        .unwrap();
        let affected = execute(&mut tables, &delete, &[text("p-1"), text("r-1")]).unwrap();
        assert_eq!(affected, 1);
        assert_eq!(tables["principal_roles"].len(), 1);
    }

    #[test]
    fn rejects_what_it_does_not_understand() {
        assert!(parse("SELECT * FROM roles").is_err());
        assert!(parse("CREATE TABLE roles (id)").is_err());
        assert!(parse("SELECT id FROM roles WHERE name LIKE ?").is_err());
    }

    #[test]
    fn parameter_count_is_checked() {
        let mut tables = Tables::new();
        let insert = parse("INSERT INTO roles (id, name) VALUES (?, ?)").unwrap();
        assert!(execute(&mut tables, &insert, &[text("r-1")]).is_err());
    }
}
