//! Fixtures shared by unit tests

use crate::backend::{AttachmentUpload, Backend, BackendError, RemoteAttachment};
use crate::config::AppConfig;
use crate::store::LocalStore;
use local_images::{LocalImageConfig, LocalImageService};
use serde_json::Value;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

pub fn temp_dir(label: &str) -> PathBuf {
    std::env::temp_dir().join(format!("lbw-inspect-{}-{}", label, uuid::Uuid::new_v4()))
}

pub fn temp_images() -> LocalImageService {
    LocalImageService::new(LocalImageConfig {
        storage_path: temp_dir("images").to_string_lossy().to_string(),
    })
}

pub fn test_config(cooldown: Duration) -> AppConfig {
    let mut config = AppConfig::default();
    config.storage_path = temp_dir("store").to_string_lossy().to_string();
    config.live.cooldown_ms = cooldown.as_millis() as u64;
    config
}

pub fn test_store(cooldown: Duration) -> LocalStore {
    LocalStore::open_in_memory(test_config(cooldown)).unwrap()
}

/// One recorded backend call
#[derive(Debug, Clone, PartialEq)]
pub enum MockCall {
    CreateVisual(Value),
    UpdateVisual(String, Value),
    DeleteVisual(String),
    Upload { owner_id: String, client_ref: String },
    UpdateAttachment(String, Value),
    DeleteAttachment(String),
    ListVisuals(String),
    FindVisual(String),
}

#[derive(Default)]
struct MockState {
    next_id: u64,
    failures: VecDeque<BackendError>,
    calls: Vec<MockCall>,
    remote_visuals: Vec<Value>,
    /// Creates that are stored but answered with an error
    lost_creates: usize,
}

/// Scripted backend: ids count up from `first_id`, queued failures are
/// returned by the next calls in order
pub struct MockBackend {
    state: Mutex<MockState>,
}

impl MockBackend {
    pub fn new(first_id: u64) -> Self {
        Self {
            state: Mutex::new(MockState {
                next_id: first_id,
                ..MockState::default()
            }),
        }
    }

    pub fn fail_next(&self, error: BackendError) {
        self.state.lock().unwrap().failures.push_back(error);
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.state.lock().unwrap().calls.clone()
    }

    /// The next create lands on the server but its response is lost
    pub fn lose_next_create_response(&self) {
        self.state.lock().unwrap().lost_creates += 1;
    }

    pub fn set_remote_visuals(&self, records: Vec<Value>) {
        self.state.lock().unwrap().remote_visuals = records;
    }

    fn record(&self, call: MockCall) -> Result<(), BackendError> {
        let mut state = self.state.lock().unwrap();
        if let Some(error) = state.failures.pop_front() {
            return Err(error);
        }
        state.calls.push(call);
        Ok(())
    }

    fn next_id(&self) -> String {
        let mut state = self.state.lock().unwrap();
        let id = state.next_id;
        state.next_id += 1;
        id.to_string()
    }
}

impl Backend for MockBackend {
    async fn create_visual(&self, payload: &Value) -> Result<String, BackendError> {
        self.record(MockCall::CreateVisual(payload.clone()))?;
        let id = self.next_id();

        let mut state = self.state.lock().unwrap();
        let mut stored = payload.clone();
        stored["LBWID"] = Value::String(id.clone());
        state.remote_visuals.push(stored);
        if state.lost_creates > 0 {
            state.lost_creates -= 1;
            return Err(BackendError::Transient("response timed out".to_string()));
        }
        Ok(id)
    }

    async fn update_visual(&self, visual_id: &str, payload: &Value) -> Result<(), BackendError> {
        self.record(MockCall::UpdateVisual(visual_id.to_string(), payload.clone()))
    }

    async fn delete_visual(&self, visual_id: &str) -> Result<(), BackendError> {
        self.record(MockCall::DeleteVisual(visual_id.to_string()))
    }

    async fn upload_attachment(
        &self,
        upload: &AttachmentUpload,
    ) -> Result<RemoteAttachment, BackendError> {
        self.record(MockCall::Upload {
            owner_id: upload.owner_id.clone(),
            client_ref: upload.client_ref.clone(),
        })?;
        let record_id = self.next_id();
        Ok(RemoteAttachment {
            file_key: format!("/{}/{}", record_id, upload.file_name),
            record_id,
        })
    }

    async fn update_attachment(&self, record_id: &str, payload: &Value) -> Result<(), BackendError> {
        self.record(MockCall::UpdateAttachment(record_id.to_string(), payload.clone()))
    }

    async fn delete_attachment(&self, record_id: &str) -> Result<(), BackendError> {
        self.record(MockCall::DeleteAttachment(record_id.to_string()))
    }

    async fn list_visuals(&self, service_id: &str) -> Result<Vec<Value>, BackendError> {
        self.record(MockCall::ListVisuals(service_id.to_string()))?;
        Ok(self.state.lock().unwrap().remote_visuals.clone())
    }

    async fn find_visual_by_client_ref(&self, client_ref: &str) -> Result<Option<Value>, BackendError> {
        self.record(MockCall::FindVisual(client_ref.to_string()))?;
        let state = self.state.lock().unwrap();
        Ok(state
            .remote_visuals
            .iter()
            .find(|r| r["ClientRef"].as_str() == Some(client_ref))
            .cloned())
    }

    async fn photo_url(&self, file_key: &str) -> Result<String, BackendError> {
        Ok(format!("https://files.example.test{}", file_key))
    }
}
