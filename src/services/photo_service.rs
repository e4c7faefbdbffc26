use crate::error::AppError;
use crate::models::EntityType;
use crate::services::{id_map_service, normalize, queue_service};
use local_images::{blob, LocalImage, LocalImageError, LocalImageService, NewImage};
use rusqlite::Connection;
use serde_json::json;
use uuid::Uuid;

/// Entity type recorded on images owned by a visual field
pub const VISUAL_OWNER: &str = "visual";

/// Adapter function to convert LocalImageError to AppError
pub(crate) fn convert_error(e: LocalImageError) -> AppError {
    match e {
        LocalImageError::DatabaseError(e) => AppError::Database(e),
        LocalImageError::NotFound(msg) => AppError::NotFound(msg),
        LocalImageError::InvalidInput(msg) => AppError::Validation(msg),
        LocalImageError::BlobError(blob::BlobError::IoError(e)) => AppError::Filesystem(e),
        LocalImageError::BlobError(e) => AppError::Other(format!("Blob error: {}", e)),
    }
}

/// Stores a photo for its owner and queues the upload
///
/// The owner id is snapshotted as whatever is current: the confirmed id when
/// the id map already knows it, the temporary one otherwise. Run inside the
/// caller's transaction so the image row and its queue item commit together.
pub fn capture_image(
    conn: &Connection,
    images: &LocalImageService,
    mut image: NewImage,
    temp_prefix: &str,
) -> Result<LocalImage, AppError> {
    image.entity_id = id_map_service::resolve_current(conn, &image.entity_id)?;
    let owner_is_temporary = id_map_service::is_temporary(&image.entity_id, temp_prefix);

    let stored = images.capture(conn, image).map_err(convert_error)?;

    let queued = queue_service::enqueue_attachment_create(
        conn,
        &stored.image_id.to_string(),
        &stored.entity_id,
        owner_is_temporary,
        normalize::attachment_payload(&stored),
    );
    if let Err(e) = queued {
        discard_blob(images, &stored);
        return Err(e);
    }

    log::debug!(
        "Queued upload of image {} for {}",
        stored.image_id,
        stored.entity_id
    );
    Ok(stored)
}

/// Removes the file of an image whose row did not commit
pub fn discard_blob(images: &LocalImageService, image: &LocalImage) {
    if let Err(e) = blob::remove_blob(images.storage_path(), &image.blob_path) {
        log::warn!("Could not remove blob {}: {}", image.blob_path, e);
    }
}

pub fn update_image_annotation(
    conn: &Connection,
    images: &LocalImageService,
    image_id: &Uuid,
    caption: Option<&str>,
    drawings: Option<&str>,
) -> Result<LocalImage, AppError> {
    images
        .update_annotation(conn, image_id, caption, drawings)
        .map_err(convert_error)?;
    let image = images
        .get(conn, image_id)
        .map_err(convert_error)?
        .ok_or_else(|| AppError::NotFound(format!("Image {}", image_id)))?;

    queue_service::enqueue_update(
        conn,
        EntityType::Attachment,
        &image_id.to_string(),
        normalize::attachment_payload(&image),
    )?;
    Ok(image)
}

/// Soft-deletes a photo; an upload that never happened is cancelled instead
pub fn delete_image(
    conn: &Connection,
    images: &LocalImageService,
    image_id: &Uuid,
) -> Result<LocalImage, AppError> {
    let image = images.mark_deleted(conn, image_id).map_err(convert_error)?;
    let queued = queue_service::enqueue_delete(
        conn,
        EntityType::Attachment,
        &image_id.to_string(),
        json!({ "remote_ref": image.remote_ref }),
    )?;

    if queued.is_none() {
        log::info!("Image {} was never uploaded, nothing to delete remotely", image_id);
    }
    Ok(image)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SyncOp;
    use crate::testing::temp_images;

    const PREFIX: &str = "temp_lbw_";

    #[test]
    fn test_capture_queues_dependent_upload() {
        let conn = crate::database::init_in_memory().unwrap();
        let images = temp_images();

        let image = capture_image(
            &conn,
            &images,
            NewImage::new(vec![1, 2, 3], VISUAL_OWNER, "temp_lbw_abc", "svc-1"),
            PREFIX,
        )
        .unwrap();

        let open = queue_service::list_open(&conn).unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].target, image.image_id.to_string());
        assert_eq!(open[0].depends_on.as_deref(), Some("temp_lbw_abc"));
        assert_eq!(open[0].op, SyncOp::Create);
    }

    #[test]
    fn test_capture_after_confirmation_uses_confirmed_owner() {
        let conn = crate::database::init_in_memory().unwrap();
        let images = temp_images();
        id_map_service::record_mapping(&conn, "temp_lbw_abc", "4821", EntityType::Visual).unwrap();

        let image = capture_image(
            &conn,
            &images,
            NewImage::new(vec![1, 2, 3], VISUAL_OWNER, "temp_lbw_abc", "svc-1"),
            PREFIX,
        )
        .unwrap();
        assert_eq!(image.entity_id, "4821");
        let open = queue_service::list_open(&conn).unwrap();
        assert!(open[0].depends_on.is_none());
    }

    #[test]
    fn test_annotation_folds_into_pending_upload() {
        let conn = crate::database::init_in_memory().unwrap();
        let images = temp_images();
        let image = capture_image(
            &conn,
            &images,
            NewImage::new(vec![7; 16], VISUAL_OWNER, "4821", "svc-1"),
            PREFIX,
        )
        .unwrap();

        let updated = update_image_annotation(
            &conn,
            &images,
            &image.image_id,
            Some("North wall"),
            Some("[]"),
        )
        .unwrap();
        assert_eq!(updated.caption.as_deref(), Some("North wall"));

        let open = queue_service::list_open(&conn).unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].payload["Caption"], "North wall");
    }

    #[test]
    fn test_delete_before_upload_cancels() {
        let conn = crate::database::init_in_memory().unwrap();
        let images = temp_images();
        let image = capture_image(
            &conn,
            &images,
            NewImage::new(vec![7; 16], VISUAL_OWNER, "4821", "svc-1"),
            PREFIX,
        )
        .unwrap();

        delete_image(&conn, &images, &image.image_id).unwrap();
        assert!(images.get(&conn, &image.image_id).unwrap().is_none());
        assert_eq!(
            queue_service::counts(&conn).unwrap(),
            queue_service::QueueCounts::default()
        );
    }
}
