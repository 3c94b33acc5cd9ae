//! Role Entity

use serde::{Deserialize, Serialize};

/// A role, unique by case-insensitive name (stored lowercase).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Role {
    /// Opaque identifier; generated on first save when blank.
    #[serde(default)]
    pub id: String,

    pub name: String,
}

impl Role {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            name: name.into(),
        }
    }
}
