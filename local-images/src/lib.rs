//! # Local Images
//!
//! Local photo records for offline field capture.
//!
//! This crate provides the storage side of photo handling:
//! - Blob storage on disk, named by a stable image UUID
//! - SHA-256 content hashes for upload verification
//! - Database integration with SQLite (`local_images` table)
//! - Owner bookkeeping: every image points at the entity it was captured for
//!
//! The owner id is a snapshot taken at capture time. Rewriting it after the
//! owner received a server id is the caller's job (see
//! [`LocalImageService::rewrite_entity_id`]).
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use local_images::{LocalImageConfig, LocalImageService, NewImage};
//!
//! let service = LocalImageService::new(LocalImageConfig {
//!     storage_path: "/path/to/photos".to_string(),
//! });
//! let image = service.capture(&conn, NewImage::new(bytes, "visual", "temp_lbw_1", "svc-7"))?;
//! ```

pub mod blob;
pub mod models;
pub mod schema;
pub mod service;

pub use blob::{content_hash, BlobError};
pub use models::{ImageSyncStatus, LocalImage, LocalImageConfig, NewImage};
pub use schema::init_image_schema;
pub use service::{LocalImageError, LocalImageService};
