use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Upload state of a local image
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ImageSyncStatus {
    Queued,
    Uploading,
    Verified,
    Failed,
}

impl ImageSyncStatus {
    pub fn as_str(&self) -> &str {
        match self {
            ImageSyncStatus::Queued => "queued",
            ImageSyncStatus::Uploading => "uploading",
            ImageSyncStatus::Verified => "verified",
            ImageSyncStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "uploading" => ImageSyncStatus::Uploading,
            "verified" => ImageSyncStatus::Verified,
            "failed" => ImageSyncStatus::Failed,
            _ => ImageSyncStatus::Queued,
        }
    }
}

/// One captured or picked photo
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LocalImage {
    /// Client-generated, never reassigned
    pub image_id: Uuid,
    pub entity_type: String,
    /// Owner id at capture time (temporary or confirmed)
    pub entity_id: String,
    pub service_id: String,
    /// Blob location relative to the storage path
    pub blob_path: String,
    pub content_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_ref: Option<String>,
    pub caption: Option<String>,
    /// Serialized annotation data from the drawing editor
    pub drawings: Option<String>,
    pub sync_status: ImageSyncStatus,
    pub sync_error: Option<String>,
    pub created_at: i64,
}

/// Input for a capture
#[derive(Debug, Clone, PartialEq)]
pub struct NewImage {
    pub bytes: Vec<u8>,
    pub extension: String,
    pub entity_type: String,
    pub entity_id: String,
    pub service_id: String,
    pub caption: Option<String>,
    pub drawings: Option<String>,
}

impl NewImage {
    pub fn new(
        bytes: Vec<u8>,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        service_id: impl Into<String>,
    ) -> Self {
        Self {
            bytes,
            extension: "jpg".to_string(),
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            service_id: service_id.into(),
            caption: None,
            drawings: None,
        }
    }
}

/// Configuration for the image store
#[derive(Debug, Clone)]
pub struct LocalImageConfig {
    /// Base directory for blob storage
    pub storage_path: String,
}

impl Default for LocalImageConfig {
    fn default() -> Self {
        Self {
            storage_path: String::new(),
        }
    }
}
