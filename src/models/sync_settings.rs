use serde::{Deserialize, Serialize};

/// Per-device synchronization state
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncSettings {
    pub id: i64,
    pub enabled: bool,
    pub device_id: Option<String>,
    pub last_sync: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl SyncSettings {
    pub fn new() -> Self {
        Self {
            id: 0,
            enabled: true,
            device_id: None,
            last_sync: None,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self::new()
    }
}
