//! Remote backend seam
//!
//! The sync worker only talks to the server through [`Backend`]. The REST
//! client in [`rest`] is the production implementation; tests script a mock.

pub mod rest;

use serde_json::Value;
use std::future::Future;

pub use rest::RestBackend;

/// Error type for backend calls
#[derive(Debug, Clone, PartialEq)]
pub enum BackendError {
    /// No connection; the call can be repeated without spending a retry
    Offline(String),
    /// Timeout, 5xx, throttling
    Transient(String),
    /// The server refused the request (4xx); retrying will not help
    Rejected { status: u16, message: String },
}

impl std::fmt::Display for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendError::Offline(msg) => write!(f, "Offline: {}", msg),
            BackendError::Transient(msg) => write!(f, "Temporary failure: {}", msg),
            BackendError::Rejected { status, message } => {
                write!(f, "Rejected ({}): {}", status, message)
            }
        }
    }
}

impl std::error::Error for BackendError {}

impl BackendError {
    pub fn is_offline(&self) -> bool {
        matches!(self, BackendError::Offline(_))
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, BackendError::Rejected { .. })
    }

    /// Classifies an HTTP status that is not a success
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            408 | 429 | 500..=599 => BackendError::Transient(format!("{}: {}", status, message)),
            _ => BackendError::Rejected { status, message },
        }
    }
}

/// File plus metadata for one attachment record
#[derive(Debug, Clone, PartialEq)]
pub struct AttachmentUpload {
    /// Confirmed id of the owning visual
    pub owner_id: String,
    pub file_name: String,
    pub bytes: Vec<u8>,
    pub content_hash: String,
    pub caption: Option<String>,
    pub drawings: Option<String>,
    /// Local image id, echoed back by the server
    pub client_ref: String,
}

/// Server side of a finished upload
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteAttachment {
    pub record_id: String,
    /// Storage key or URL of the file
    pub file_key: String,
}

pub trait Backend: Send + Sync + 'static {
    /// Creates a visual and returns its server id
    fn create_visual(
        &self,
        payload: &Value,
    ) -> impl Future<Output = Result<String, BackendError>> + Send;

    fn update_visual(
        &self,
        visual_id: &str,
        payload: &Value,
    ) -> impl Future<Output = Result<(), BackendError>> + Send;

    fn delete_visual(&self, visual_id: &str)
        -> impl Future<Output = Result<(), BackendError>> + Send;

    fn upload_attachment(
        &self,
        upload: &AttachmentUpload,
    ) -> impl Future<Output = Result<RemoteAttachment, BackendError>> + Send;

    fn update_attachment(
        &self,
        record_id: &str,
        payload: &Value,
    ) -> impl Future<Output = Result<(), BackendError>> + Send;

    fn delete_attachment(
        &self,
        record_id: &str,
    ) -> impl Future<Output = Result<(), BackendError>> + Send;

    /// Visual records of one service, as raw server JSON
    fn list_visuals(
        &self,
        service_id: &str,
    ) -> impl Future<Output = Result<Vec<Value>, BackendError>> + Send;

    /// The visual created with client reference `client_ref`, if the server has one
    fn find_visual_by_client_ref(
        &self,
        client_ref: &str,
    ) -> impl Future<Output = Result<Option<Value>, BackendError>> + Send;

    /// Displayable URL for an uploaded file
    fn photo_url(&self, file_key: &str)
        -> impl Future<Output = Result<String, BackendError>> + Send;
}
