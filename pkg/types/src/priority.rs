use serde::{Deserialize, Serialize};

/// Named priority level referenced by pods. A pod naming a class that does
/// not exist resolves to priority 0.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriorityClass {
    pub name: String,
    pub value: i64,
    #[serde(default)]
    pub global_default: bool,
}
