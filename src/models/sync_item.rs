use rusqlite::Row;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SyncOp {
    Create,
    Update,
    Delete,
}

impl SyncOp {
    pub fn as_str(&self) -> &str {
        match self {
            SyncOp::Create => "create",
            SyncOp::Update => "update",
            SyncOp::Delete => "delete",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "create" => SyncOp::Create,
            "delete" => SyncOp::Delete,
            _ => SyncOp::Update,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Visual,
    Attachment,
}

impl EntityType {
    pub fn as_str(&self) -> &str {
        match self {
            EntityType::Visual => "visual",
            EntityType::Attachment => "attachment",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "attachment" => EntityType::Attachment,
            _ => EntityType::Visual,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    InFlight,
    /// Failed at least once, waiting for `next_attempt_at`
    Failed,
    Done,
    /// Out of retries, needs user action
    Dead,
}

impl ItemStatus {
    pub fn as_str(&self) -> &str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::InFlight => "in_flight",
            ItemStatus::Failed => "failed",
            ItemStatus::Done => "done",
            ItemStatus::Dead => "dead",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "in_flight" => ItemStatus::InFlight,
            "failed" => ItemStatus::Failed,
            "done" => ItemStatus::Done,
            "dead" => ItemStatus::Dead,
            _ => ItemStatus::Pending,
        }
    }

    /// Still waiting to reach the backend
    pub fn is_open(&self) -> bool {
        matches!(
            self,
            ItemStatus::Pending | ItemStatus::InFlight | ItemStatus::Failed
        )
    }
}

/// One outbox entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncItem {
    /// Submission order
    pub seq: i64,
    /// ULID
    pub item_id: String,
    pub op: SyncOp,
    pub entity_type: EntityType,
    /// Record id the operation applies to (temporary, confirmed or local image id)
    pub target: String,
    /// Owner id that must be confirmed before this item can run
    pub depends_on: Option<String>,
    /// Temporary id minted by a create
    pub temp_id: Option<String>,
    pub payload: serde_json::Value,
    pub status: ItemStatus,
    pub retry_count: u32,
    pub next_attempt_at: i64,
    pub last_error: Option<String>,
    pub created_at: i64,
}

pub(crate) const ITEM_COLUMNS: &str = "seq, item_id, op, entity_type, target, depends_on, temp_id,
     payload, status, retry_count, next_attempt_at, last_error, created_at";

impl<'r> TryFrom<&Row<'r>> for SyncItem {
    type Error = rusqlite::Error;

    fn try_from(row: &Row<'r>) -> Result<Self, Self::Error> {
        let op: String = row.get(2)?;
        let entity_type: String = row.get(3)?;
        let payload: String = row.get(7)?;
        let status: String = row.get(8)?;

        Ok(SyncItem {
            seq: row.get(0)?,
            item_id: row.get(1)?,
            op: SyncOp::from_str(&op),
            entity_type: EntityType::from_str(&entity_type),
            target: row.get(4)?,
            depends_on: row.get(5)?,
            temp_id: row.get(6)?,
            payload: serde_json::from_str(&payload).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(7, rusqlite::types::Type::Text, Box::new(e))
            })?,
            status: ItemStatus::from_str(&status),
            retry_count: row.get(9)?,
            next_attempt_at: row.get(10)?,
            last_error: row.get(11)?,
            created_at: row.get(12)?,
        })
    }
}
