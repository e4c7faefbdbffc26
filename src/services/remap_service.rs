use crate::error::AppError;
use crate::models::{SyncItem, VisualField};
use crate::services::photo_service::convert_error;
use crate::services::{field_service, id_map_service, queue_service};
use local_images::LocalImageService;
use rusqlite::Connection;
use serde_json::Value;

/// Result of promoting a temporary id
#[derive(Debug, Clone, PartialEq)]
pub struct RemapReport {
    pub temp_id: String,
    pub confirmed_id: String,
    pub field: Option<VisualField>,
    pub images_rewritten: usize,
    /// Photo owners were left on the temporary id; the resolver still finds them
    pub image_rewrite_failed: bool,
}

/// Applies a confirmed create in one transaction
///
/// Records the id map entry, stores the confirmed id on the field, repoints
/// photo owners and marks the queue item done. A failure while repointing
/// photos only rolls back that step; everything else still commits.
pub fn complete_create(
    conn: &Connection,
    images: &LocalImageService,
    item: &SyncItem,
    confirmed_id: &str,
) -> Result<RemapReport, AppError> {
    complete_create_with(conn, images, item, confirmed_id, None)
}

/// Like [`complete_create`] for a create the server holds in an older state
///
/// `unsent` (the local edits the server record lacks) is queued as an
/// update of the confirmed id in the same transaction, so the row stays
/// dirty until that update is sent.
pub fn complete_create_with(
    conn: &Connection,
    images: &LocalImageService,
    item: &SyncItem,
    confirmed_id: &str,
    unsent: Option<Value>,
) -> Result<RemapReport, AppError> {
    let temp_id = item
        .temp_id
        .clone()
        .unwrap_or_else(|| item.target.clone());

    let mut tx = conn.unchecked_transaction()?;

    id_map_service::record_mapping(&tx, &temp_id, confirmed_id, item.entity_type)?;
    let field = field_service::set_confirmed_id(&tx, &temp_id, confirmed_id)?;

    let (images_rewritten, image_rewrite_failed) = {
        let sp = tx.savepoint()?;
        match images.rewrite_entity_id(&sp, &temp_id, confirmed_id) {
            Ok(n) => {
                sp.commit()?;
                (n, false)
            }
            Err(e) => {
                log::warn!(
                    "Photos of {} stay filed under the temporary id: {}",
                    temp_id,
                    convert_error(e)
                );
                // dropping the savepoint rolls it back
                (0, true)
            }
        }
    };

    queue_service::mark_done(&tx, &item.item_id)?;
    if let Some(changes) = unsent {
        log::info!("Queueing local edits of {} the server does not have yet", temp_id);
        queue_service::enqueue_update(&tx, item.entity_type, confirmed_id, changes)?;
    }
    field_service::clear_dirty_if_settled(&tx, &temp_id)?;
    tx.commit()?;

    log::info!(
        "Remapped {} -> {} ({} photos)",
        temp_id,
        confirmed_id,
        images_rewritten
    );

    let field = match field {
        Some(f) => field_service::get_field(conn, &f.key())?,
        None => None,
    };

    Ok(RemapReport {
        temp_id,
        confirmed_id: confirmed_id.to_string(),
        field,
        images_rewritten,
        image_rewrite_failed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EntityType, FieldKey, FieldUpdate, ItemStatus};
    use crate::services::resolver::{self, FieldIds, ResolutionTier};
    use crate::testing::temp_images;
    use local_images::NewImage;
    use serde_json::json;

    fn setup() -> (Connection, LocalImageService, SyncItem, FieldKey) {
        let conn = crate::database::init_in_memory().unwrap();
        let images = temp_images();
        let key = FieldKey::new("svc-1", "Foundations", "tpl-beam");
        let item = queue_service::enqueue_create(&conn, EntityType::Visual, "temp_lbw_", json!({})).unwrap();
        field_service::set_field(
            &conn,
            &key,
            &FieldUpdate::new()
                .selected(true)
                .temp_visual_id(item.target.clone()),
            "dev",
        )
        .unwrap();
        (conn, images, item, key)
    }

    #[test]
    fn test_remap_is_complete() {
        let (conn, images, item, key) = setup();
        images
            .capture(&conn, NewImage::new(vec![1], "visual", item.target.clone(), "svc-1"))
            .unwrap();
        images
            .capture(&conn, NewImage::new(vec![2], "visual", item.target.clone(), "svc-1"))
            .unwrap();

        let report = complete_create(&conn, &images, &item, "4821").unwrap();
        assert_eq!(report.images_rewritten, 2);
        assert!(!report.image_rewrite_failed);

        assert_eq!(
            id_map_service::confirmed_for(&conn, &item.target).unwrap().as_deref(),
            Some("4821")
        );
        let field = field_service::get_field(&conn, &key).unwrap().unwrap();
        assert_eq!(field.visual_id.as_deref(), Some("4821"));
        assert!(!field.dirty);
        assert_eq!(images.count_for_entity(&conn, &item.target).unwrap(), 0);
        assert_eq!(images.count_for_entity(&conn, "4821").unwrap(), 2);
        assert_eq!(
            queue_service::get_item(&conn, &item.item_id).unwrap().unwrap().status,
            ItemStatus::Done
        );
    }

    #[test]
    fn test_photo_rewrite_failure_keeps_the_rest() {
        let (conn, images, item, key) = setup();
        images
            .capture(&conn, NewImage::new(vec![1], "visual", item.target.clone(), "svc-1"))
            .unwrap();
        conn.execute_batch(
            "CREATE TRIGGER block_owner_rewrite BEFORE UPDATE OF entity_id ON local_images
             BEGIN SELECT RAISE(ABORT, 'owner rewrite blocked'); END;",
        )
        .unwrap();

        let report = complete_create(&conn, &images, &item, "4821").unwrap();
        assert!(report.image_rewrite_failed);

        let field = field_service::get_field(&conn, &key).unwrap().unwrap();
        assert_eq!(field.visual_id.as_deref(), Some("4821"));
        assert_eq!(images.count_for_entity(&conn, &item.target).unwrap(), 1);

        let res = resolver::resolve_photos(&conn, &images, FieldIds::from(&field)).unwrap();
        assert_eq!(res.tier, Some(ResolutionTier::Temporary));
        assert_eq!(res.images.len(), 1);

        let by_confirmed = resolver::resolve_for_id(&conn, &images, "4821", "temp_lbw_").unwrap();
        assert_eq!(by_confirmed.tier, Some(ResolutionTier::MappedFromConfirmed));
    }
}
