use crate::blob::{self, BlobError};
use crate::models::{ImageSyncStatus, LocalImage, LocalImageConfig, NewImage};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

/// Error type for local image operations
#[derive(Debug)]
pub enum LocalImageError {
    DatabaseError(rusqlite::Error),
    BlobError(BlobError),
    NotFound(String),
    InvalidInput(String),
}

impl std::fmt::Display for LocalImageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LocalImageError::DatabaseError(e) => write!(f, "Database error: {}", e),
            LocalImageError::BlobError(e) => write!(f, "Blob error: {}", e),
            LocalImageError::NotFound(msg) => write!(f, "Not found: {}", msg),
            LocalImageError::InvalidInput(msg) => write!(f, "Invalid input: {}", msg),
        }
    }
}

impl std::error::Error for LocalImageError {}

impl From<rusqlite::Error> for LocalImageError {
    fn from(err: rusqlite::Error) -> Self {
        LocalImageError::DatabaseError(err)
    }
}

impl From<BlobError> for LocalImageError {
    fn from(err: BlobError) -> Self {
        LocalImageError::BlobError(err)
    }
}

const IMAGE_COLUMNS: &str = "image_id, entity_type, entity_id, service_id, blob_path, content_hash,
     remote_ref, caption, drawings, sync_status, sync_error, created_at";

impl<'r> TryFrom<&Row<'r>> for LocalImage {
    type Error = rusqlite::Error;

    fn try_from(row: &Row<'r>) -> Result<Self, Self::Error> {
        let id_str: String = row.get(0)?;
        let status: String = row.get(9)?;

        Ok(LocalImage {
            image_id: Uuid::parse_str(&id_str).map_err(|_| rusqlite::Error::InvalidQuery)?,
            entity_type: row.get(1)?,
            entity_id: row.get(2)?,
            service_id: row.get(3)?,
            blob_path: row.get(4)?,
            content_hash: row.get(5)?,
            remote_ref: row.get(6)?,
            caption: row.get(7)?,
            drawings: row.get(8)?,
            sync_status: ImageSyncStatus::from_str(&status),
            sync_error: row.get(10)?,
            created_at: row.get(11)?,
        })
    }
}

/// Local image service
pub struct LocalImageService {
    config: LocalImageConfig,
}

impl LocalImageService {
    pub fn new(config: LocalImageConfig) -> Self {
        Self { config }
    }

    pub fn storage_path(&self) -> &str {
        &self.config.storage_path
    }

    /// Returns the absolute path to a blob (for UI display)
    pub fn get_absolute_path(&self, relative_path: &str) -> String {
        blob::absolute_path(&self.config.storage_path, relative_path)
            .to_string_lossy()
            .to_string()
    }

    /// Stores the blob and inserts the image row with status `queued`
    ///
    /// The blob is removed again if the row cannot be inserted.
    pub fn capture(
        &self,
        conn: &Connection,
        image: NewImage,
    ) -> Result<LocalImage, LocalImageError> {
        if image.entity_id.trim().is_empty() {
            return Err(LocalImageError::InvalidInput(
                "Image owner id must not be empty".to_string(),
            ));
        }

        let image_id = Uuid::new_v4();
        let (blob_path, content_hash) = blob::write_blob(
            &self.config.storage_path,
            &image_id,
            &image.extension,
            &image.bytes,
        )?;
        let created_at = chrono::Utc::now().timestamp_millis();

        let inserted = conn.execute(
            "INSERT INTO local_images (image_id, entity_type, entity_id, service_id, blob_path,
                 content_hash, caption, drawings, sync_status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'queued', ?9)",
            params![
                image_id.to_string(),
                &image.entity_type,
                &image.entity_id,
                &image.service_id,
                &blob_path,
                &content_hash,
                &image.caption,
                &image.drawings,
                created_at,
            ],
        );

        if let Err(e) = inserted {
            if let Err(cleanup) = blob::remove_blob(&self.config.storage_path, &blob_path) {
                log::warn!("Could not remove orphaned blob {}: {}", blob_path, cleanup);
            }
            return Err(e.into());
        }

        log::info!(
            "Captured image {} for {} {}",
            image_id,
            image.entity_type,
            image.entity_id
        );

        Ok(LocalImage {
            image_id,
            entity_type: image.entity_type,
            entity_id: image.entity_id,
            service_id: image.service_id,
            blob_path,
            content_hash,
            remote_ref: None,
            caption: image.caption,
            drawings: image.drawings,
            sync_status: ImageSyncStatus::Queued,
            sync_error: None,
            created_at,
        })
    }

    pub fn get(
        &self,
        conn: &Connection,
        image_id: &Uuid,
    ) -> Result<Option<LocalImage>, LocalImageError> {
        let sql = format!(
            "SELECT {} FROM local_images WHERE image_id = ?1 AND deleted = 0",
            IMAGE_COLUMNS
        );
        let image = conn
            .query_row(&sql, params![image_id.to_string()], |row| {
                LocalImage::try_from(row)
            })
            .optional()?;
        Ok(image)
    }

    /// Exact owner match, oldest first
    pub fn list_for_entity(
        &self,
        conn: &Connection,
        entity_id: &str,
    ) -> Result<Vec<LocalImage>, LocalImageError> {
        let sql = format!(
            "SELECT {} FROM local_images
             WHERE entity_id = ?1 AND deleted = 0
             ORDER BY created_at, image_id",
            IMAGE_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![entity_id], |row| LocalImage::try_from(row))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn list_for_service(
        &self,
        conn: &Connection,
        service_id: &str,
    ) -> Result<Vec<LocalImage>, LocalImageError> {
        let sql = format!(
            "SELECT {} FROM local_images
             WHERE service_id = ?1 AND deleted = 0
             ORDER BY created_at, image_id",
            IMAGE_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![service_id], |row| LocalImage::try_from(row))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn count_for_entity(
        &self,
        conn: &Connection,
        entity_id: &str,
    ) -> Result<usize, LocalImageError> {
        let count: usize = conn.query_row(
            "SELECT COUNT(*) FROM local_images WHERE entity_id = ?1 AND deleted = 0",
            params![entity_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Points every image owned by `from` at `to`, including soft-deleted ones
    ///
    /// Returns the number of rewritten rows.
    pub fn rewrite_entity_id(
        &self,
        conn: &Connection,
        from: &str,
        to: &str,
    ) -> Result<usize, LocalImageError> {
        let rows = conn.execute(
            "UPDATE local_images SET entity_id = ?1 WHERE entity_id = ?2",
            params![to, from],
        )?;
        if rows > 0 {
            log::debug!("Rewrote {} image owner ids {} -> {}", rows, from, to);
        }
        Ok(rows)
    }

    pub fn set_sync_status(
        &self,
        conn: &Connection,
        image_id: &Uuid,
        status: ImageSyncStatus,
        error: Option<&str>,
    ) -> Result<(), LocalImageError> {
        let rows = conn.execute(
            "UPDATE local_images SET sync_status = ?1, sync_error = ?2 WHERE image_id = ?3",
            params![status.as_str(), error, image_id.to_string()],
        )?;
        if rows == 0 {
            return Err(LocalImageError::NotFound(format!("Image {}", image_id)));
        }
        Ok(())
    }

    /// Records the remote reference of a finished upload
    pub fn mark_verified(
        &self,
        conn: &Connection,
        image_id: &Uuid,
        remote_ref: &str,
    ) -> Result<(), LocalImageError> {
        let rows = conn.execute(
            "UPDATE local_images SET sync_status = 'verified', sync_error = NULL, remote_ref = ?1
             WHERE image_id = ?2",
            params![remote_ref, image_id.to_string()],
        )?;
        if rows == 0 {
            return Err(LocalImageError::NotFound(format!("Image {}", image_id)));
        }
        Ok(())
    }

    pub fn update_annotation(
        &self,
        conn: &Connection,
        image_id: &Uuid,
        caption: Option<&str>,
        drawings: Option<&str>,
    ) -> Result<(), LocalImageError> {
        let rows = conn.execute(
            "UPDATE local_images SET caption = ?1, drawings = ?2 WHERE image_id = ?3 AND deleted = 0",
            params![caption, drawings, image_id.to_string()],
        )?;
        if rows == 0 {
            return Err(LocalImageError::NotFound(format!("Image {}", image_id)));
        }
        Ok(())
    }

    /// Soft delete; the blob is removed, the row stays for sync bookkeeping
    pub fn mark_deleted(
        &self,
        conn: &Connection,
        image_id: &Uuid,
    ) -> Result<LocalImage, LocalImageError> {
        let image = self
            .get(conn, image_id)?
            .ok_or_else(|| LocalImageError::NotFound(format!("Image {}", image_id)))?;

        conn.execute(
            "UPDATE local_images SET deleted = 1 WHERE image_id = ?1",
            params![image_id.to_string()],
        )?;

        if let Err(e) = blob::remove_blob(&self.config.storage_path, &image.blob_path) {
            log::warn!("Failed to remove blob for image {}: {}", image_id, e);
        }

        Ok(image)
    }

    pub fn read_blob(&self, image: &LocalImage) -> Result<Vec<u8>, LocalImageError> {
        Ok(blob::read_blob(&self.config.storage_path, &image.blob_path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::init_image_schema;

    fn setup() -> (Connection, LocalImageService, std::path::PathBuf) {
        let conn = Connection::open_in_memory().unwrap();
        init_image_schema(&conn).unwrap();
        let dir = std::env::temp_dir().join(format!("local-images-svc-{}", Uuid::new_v4()));
        let service = LocalImageService::new(LocalImageConfig {
            storage_path: dir.to_string_lossy().to_string(),
        });
        (conn, service, dir)
    }

    #[test]
    fn test_capture_and_list() {
        let (conn, service, dir) = setup();
        let mut new = NewImage::new(b"jpeg-bytes".to_vec(), "visual", "temp_lbw_1", "svc-1");
        new.caption = Some("Crack at sill".to_string());

        let image = service.capture(&conn, new).unwrap();
        assert_eq!(image.sync_status, ImageSyncStatus::Queued);
        assert_eq!(image.content_hash, blob::content_hash(b"jpeg-bytes"));

        let listed = service.list_for_entity(&conn, "temp_lbw_1").unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0], image);
        assert_eq!(service.read_blob(&image).unwrap(), b"jpeg-bytes".to_vec());

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_capture_requires_owner() {
        let (conn, service, dir) = setup();
        let new = NewImage::new(b"x".to_vec(), "visual", "  ", "svc-1");
        assert!(matches!(
            service.capture(&conn, new),
            Err(LocalImageError::InvalidInput(_))
        ));
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_rewrite_entity_id() {
        let (conn, service, dir) = setup();
        for _ in 0..2 {
            service
                .capture(&conn, NewImage::new(b"x".to_vec(), "visual", "temp_a", "svc-1"))
                .unwrap();
        }
        service
            .capture(&conn, NewImage::new(b"y".to_vec(), "visual", "temp_b", "svc-1"))
            .unwrap();

        assert_eq!(service.rewrite_entity_id(&conn, "temp_a", "900").unwrap(), 2);
        assert_eq!(service.count_for_entity(&conn, "900").unwrap(), 2);
        assert_eq!(service.count_for_entity(&conn, "temp_a").unwrap(), 0);
        assert_eq!(service.count_for_entity(&conn, "temp_b").unwrap(), 1);

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_status_transitions() {
        let (conn, service, dir) = setup();
        let image = service
            .capture(&conn, NewImage::new(b"x".to_vec(), "visual", "12", "svc-1"))
            .unwrap();

        service
            .set_sync_status(&conn, &image.image_id, ImageSyncStatus::Uploading, None)
            .unwrap();
        service
            .mark_verified(&conn, &image.image_id, "/photos/abc.jpg")
            .unwrap();

        let loaded = service.get(&conn, &image.image_id).unwrap().unwrap();
        assert_eq!(loaded.sync_status, ImageSyncStatus::Verified);
        assert_eq!(loaded.remote_ref.as_deref(), Some("/photos/abc.jpg"));

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_mark_deleted_hides_image() {
        let (conn, service, dir) = setup();
        let image = service
            .capture(&conn, NewImage::new(b"x".to_vec(), "visual", "12", "svc-1"))
            .unwrap();

        service.mark_deleted(&conn, &image.image_id).unwrap();
        assert!(service.get(&conn, &image.image_id).unwrap().is_none());
        assert_eq!(service.count_for_entity(&conn, "12").unwrap(), 0);
        assert!(service.read_blob(&image).is_err());

        let _ = std::fs::remove_dir_all(dir);
    }
}
