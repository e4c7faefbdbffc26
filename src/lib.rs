//! Offline-first record store for field inspection checklists
//!
//! Edits land in a local SQLite database first and are queued in an outbox.
//! [`SyncEngine`] drains the outbox against the backend when a connection is
//! available, swapping temporary ids for server ids as creates confirm.

pub mod backend;
pub mod config;
pub mod database;
pub mod error;
pub mod models;
pub mod reactive;
pub mod services;
pub mod store;

#[cfg(test)]
mod testing;

pub use backend::{Backend, BackendError, RestBackend};
pub use config::AppConfig;
pub use error::AppError;
pub use models::{AnswerType, FieldKey, FieldKind, FieldUpdate, SyncItem, VisualField};
pub use reactive::{CaptureGuard, CaptureState, ChangeEvent, LiveQuery};
pub use services::background_sync::{SyncEngine, SyncStats, SyncStatus};
pub use services::resolver::{PhotoResolution, ResolutionTier};
pub use store::{LocalStore, PhotoCapture};
