use crate::config::AppConfig;
use crate::database;
use crate::error::AppError;
use crate::models::{EntityType, FieldKey, FieldUpdate, SyncItem, SyncOp, VisualField};
use crate::reactive::live_query::spawn_live_query;
use crate::reactive::{
    CaptureGuard, ChangeBus, ChangeEvent, ChangeOrigin, ChangeTable, LiveQuery, Scope, SettleGate,
};
use crate::services::photo_service::convert_error;
use crate::services::queue_service::QueueCounts;
use crate::services::resolver::{FieldIds, PhotoResolution};
use crate::services::{
    field_service, id_map_service, normalize, photo_service, queue_service, resolver,
    sync_service,
};
use local_images::{ImageSyncStatus, LocalImage, LocalImageConfig, LocalImageService, NewImage};
use rusqlite::Connection;
use serde_json::json;
use std::path::Path;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// A photo handed over by the camera or picker
#[derive(Debug, Clone, PartialEq)]
pub struct PhotoCapture {
    pub bytes: Vec<u8>,
    pub extension: String,
    pub caption: Option<String>,
    pub drawings: Option<String>,
}

impl PhotoCapture {
    pub fn jpeg(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            extension: "jpg".to_string(),
            caption: None,
            drawings: None,
        }
    }
}

/// Local store for one device
///
/// All reads and writes go through here. Writes commit locally, queue their
/// backend operation in the same transaction and publish a change event.
pub struct LocalStore {
    conn: Mutex<Connection>,
    images: LocalImageService,
    bus: ChangeBus,
    gate: Arc<SettleGate>,
    config: AppConfig,
    device_id: String,
}

impl LocalStore {
    pub fn open(config: AppConfig) -> Result<Self, AppError> {
        let conn = database::init_database(Path::new(&config.database_path))?;
        Self::with_connection(conn, config)
    }

    pub fn open_in_memory(config: AppConfig) -> Result<Self, AppError> {
        let conn = database::init_in_memory()?;
        Self::with_connection(conn, config)
    }

    fn with_connection(conn: Connection, config: AppConfig) -> Result<Self, AppError> {
        let device_id = sync_service::get_device_id(&conn)?;
        let images = LocalImageService::new(LocalImageConfig {
            storage_path: config.storage_path.clone(),
        });
        log::info!("Local store ready (device {})", device_id);

        Ok(Self {
            conn: Mutex::new(conn),
            images,
            bus: ChangeBus::default(),
            gate: Arc::new(SettleGate::new(config.live.cooldown())),
            config,
            device_id,
        })
    }

    /// Runs `f` with exclusive access to the connection
    pub fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, AppError>,
    ) -> Result<T, AppError> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| AppError::Other("Database lock poisoned".to_string()))?;
        f(&conn)
    }

    /// Like [`Self::with_conn`], inside one transaction
    pub fn in_transaction<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, AppError>,
    ) -> Result<T, AppError> {
        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let value = f(&tx)?;
            tx.commit()?;
            Ok(value)
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn images(&self) -> &LocalImageService {
        &self.images
    }

    pub fn gate(&self) -> &Arc<SettleGate> {
        &self.gate
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn subscribe_changes(&self) -> tokio::sync::broadcast::Receiver<ChangeEvent> {
        self.bus.subscribe()
    }

    pub(crate) fn publish(
        &self,
        service_id: &str,
        category: Option<&str>,
        table: ChangeTable,
        origin: ChangeOrigin,
    ) {
        if origin == ChangeOrigin::User {
            self.gate.note_user_mutation(service_id);
        }
        self.bus.publish(ChangeEvent::new(
            service_id,
            category.map(String::from),
            table,
            origin,
        ));
    }

    fn user_changed(&self, field: &VisualField, table: ChangeTable) {
        self.publish(
            &field.service_id,
            Some(&field.category),
            table,
            ChangeOrigin::User,
        );
    }

    // Visual fields

    /// Upsert of a row as given, queued for the backend like any edit
    ///
    /// A row that ends up selected without an id gets its create minted
    /// here. Rows that never had an id and stay unselected are local only
    /// and are not left dirty.
    pub fn set_field(&self, key: &FieldKey, update: FieldUpdate) -> Result<VisualField, AppError> {
        let prefix = self.config.temp_id_prefix.as_str();

        let out = self.in_transaction(|conn| {
            let existing = field_service::get_field(conn, key)?;
            let has_id = existing.as_ref().and_then(|f| f.current_id()).is_some()
                || update.visual_id.is_some()
                || update.temp_visual_id.is_some();
            let selected = update
                .selected
                .unwrap_or_else(|| existing.as_ref().is_some_and(|f| f.selected));
            let hidden = update
                .hidden
                .unwrap_or_else(|| existing.as_ref().is_some_and(|f| f.hidden));

            let mut update = update;
            if !has_id && selected && !hidden {
                let create = queue_service::enqueue_create(conn, EntityType::Visual, prefix, json!({}))?;
                update = update.temp_visual_id(create.target);
            }

            let mut out = field_service::set_field(conn, key, &update, &self.device_id)?;
            if out.changed {
                match out.field.current_id() {
                    Some(id) => {
                        queue_service::enqueue_update(
                            conn,
                            EntityType::Visual,
                            id,
                            normalize::visual_payload(&out.field),
                        )?;
                    }
                    None => {
                        field_service::clear_dirty(conn, key)?;
                        out.field.dirty = false;
                    }
                }
            }
            Ok(out)
        })?;

        if out.changed {
            self.user_changed(&out.field, ChangeTable::Fields);
        }
        Ok(out.field)
    }

    pub fn get_field(&self, key: &FieldKey) -> Result<Option<VisualField>, AppError> {
        self.with_conn(|conn| field_service::get_field(conn, key))
    }

    pub fn get_field_by_identifier(&self, id: &str) -> Result<Option<VisualField>, AppError> {
        self.with_conn(|conn| field_service::get_field_by_identifier(conn, id))
    }

    pub fn get_fields_for_category(
        &self,
        service_id: &str,
        category: &str,
    ) -> Result<Vec<VisualField>, AppError> {
        self.with_conn(|conn| field_service::get_fields_for_category(conn, service_id, category))
    }

    /// Applies a user edit to a selected item and queues it for the backend
    ///
    /// The first edit mints the temporary id and queues the create; later
    /// edits fold into it until it has been sent.
    fn edit(&self, key: &FieldKey, update: FieldUpdate) -> Result<VisualField, AppError> {
        self.set_field(key, update.selected(true).hidden(false))
    }

    /// Selects a checklist item; `template` carries its name, text and kind
    pub fn select_item(&self, key: &FieldKey, template: FieldUpdate) -> Result<VisualField, AppError> {
        self.edit(key, template)
    }

    pub fn answer(&self, key: &FieldKey, answer: Option<String>) -> Result<VisualField, AppError> {
        self.edit(key, FieldUpdate::new().answer(answer))
    }

    pub fn set_other_value(
        &self,
        key: &FieldKey,
        other: Option<String>,
    ) -> Result<VisualField, AppError> {
        self.edit(key, FieldUpdate::new().other_value(other))
    }

    pub fn edit_text(
        &self,
        key: &FieldKey,
        name: impl Into<String>,
        text: impl Into<String>,
    ) -> Result<VisualField, AppError> {
        self.edit(key, FieldUpdate::new().template(name, text))
    }

    /// Hides an item; the row, its ids and its photos stay
    pub fn unselect_item(&self, key: &FieldKey) -> Result<Option<VisualField>, AppError> {
        let out = self.in_transaction(|conn| {
            let existing = match field_service::get_field(conn, key)? {
                Some(f) => f,
                None => return Ok(None),
            };
            let out = field_service::set_field(
                conn,
                key,
                &FieldUpdate::new().hidden(true),
                &self.device_id,
            )?;
            if out.changed {
                if let Some(id) = existing.current_id() {
                    queue_service::enqueue_update(
                        conn,
                        EntityType::Visual,
                        id,
                        normalize::visual_payload(&out.field),
                    )?;
                }
            }
            Ok(Some(out))
        })?;

        Ok(out.map(|out| {
            if out.changed {
                self.user_changed(&out.field, ChangeTable::Fields);
            }
            out.field
        }))
    }

    /// Adds a dropdown option of this device
    pub fn add_custom_option(&self, key: &FieldKey, option: &str) -> Result<VisualField, AppError> {
        let out = self.with_conn(|conn| {
            field_service::add_custom_option(conn, key, option, &self.device_id)
        })?;
        if out.changed {
            self.user_changed(&out.field, ChangeTable::Fields);
        }
        Ok(out.field)
    }

    /// Removes an item and its photos, locally and on the server
    pub fn delete_item(&self, key: &FieldKey) -> Result<(), AppError> {
        let field = self.in_transaction(|conn| {
            let field = field_service::get_field(conn, key)?
                .ok_or_else(|| AppError::NotFound("Checklist item".to_string()))?;

            let photos = resolver::all_photos(conn, &self.images, FieldIds::from(&field))?;
            for image in &photos {
                photo_service::delete_image(conn, &self.images, &image.image_id)?;
            }
            if let Some(id) = field.current_id() {
                queue_service::enqueue_delete(conn, EntityType::Visual, id, json!({}))?;
            }
            field_service::delete_field(conn, key)?;
            Ok(field)
        })?;

        self.user_changed(&field, ChangeTable::Fields);
        self.user_changed(&field, ChangeTable::Images);
        Ok(())
    }

    // Photos

    /// Marks a capture as running for a service
    pub fn begin_capture(&self, service_id: &str) -> Result<CaptureGuard, AppError> {
        self.gate.begin_capture(service_id)
    }

    /// Stores a photo for the item known by `owner_id` (temporary or confirmed)
    pub fn capture_image(
        &self,
        guard: &CaptureGuard,
        owner_id: &str,
        photo: PhotoCapture,
    ) -> Result<LocalImage, AppError> {
        let prefix = self.config.temp_id_prefix.as_str();

        let (field, image) = self.with_conn(|conn| {
            let field = field_service::get_field_by_identifier(conn, owner_id)?
                .ok_or_else(|| AppError::NotFound(format!("Checklist item {}", owner_id)))?;
            if field.service_id != guard.service_id() {
                return Err(AppError::Validation(
                    "Capture was started for another service".to_string(),
                ));
            }

            let mut request = NewImage::new(
                photo.bytes,
                photo_service::VISUAL_OWNER,
                owner_id,
                field.service_id.clone(),
            );
            request.extension = photo.extension;
            request.caption = photo.caption;
            request.drawings = photo.drawings;

            let tx = conn.unchecked_transaction()?;
            let image = photo_service::capture_image(&tx, &self.images, request, prefix)?;
            if let Err(e) = tx.commit() {
                photo_service::discard_blob(&self.images, &image);
                return Err(e.into());
            }
            Ok((field, image))
        })?;

        self.user_changed(&field, ChangeTable::Images);
        Ok(image)
    }

    /// Begin, capture and finish in one call
    pub fn capture_now(&self, owner_id: &str, photo: PhotoCapture) -> Result<LocalImage, AppError> {
        let service_id = self
            .get_field_by_identifier(owner_id)?
            .map(|f| f.service_id)
            .ok_or_else(|| AppError::NotFound(format!("Checklist item {}", owner_id)))?;
        let guard = self.begin_capture(&service_id)?;
        self.capture_image(&guard, owner_id, photo)
    }

    pub fn update_image_annotation(
        &self,
        image_id: &Uuid,
        caption: Option<&str>,
        drawings: Option<&str>,
    ) -> Result<LocalImage, AppError> {
        let image = self.in_transaction(|conn| {
            photo_service::update_image_annotation(conn, &self.images, image_id, caption, drawings)
        })?;
        self.publish(&image.service_id, None, ChangeTable::Images, ChangeOrigin::User);
        Ok(image)
    }

    pub fn delete_image(&self, image_id: &Uuid) -> Result<LocalImage, AppError> {
        let image = self
            .in_transaction(|conn| photo_service::delete_image(conn, &self.images, image_id))?;
        self.publish(&image.service_id, None, ChangeTable::Images, ChangeOrigin::User);
        Ok(image)
    }

    pub fn photos_for_field(&self, key: &FieldKey) -> Result<PhotoResolution, AppError> {
        self.with_conn(|conn| {
            let ids = field_service::get_field(conn, key)?;
            let ids = ids.as_ref().map(FieldIds::from).unwrap_or_default();
            resolver::resolve_photos(conn, &self.images, ids)
        })
    }

    pub fn photos_for_id(&self, id: &str) -> Result<PhotoResolution, AppError> {
        self.with_conn(|conn| {
            resolver::resolve_for_id(conn, &self.images, id, &self.config.temp_id_prefix)
        })
    }

    /// Absolute blob path of an image, for display
    pub fn image_path(&self, image: &LocalImage) -> String {
        self.images.get_absolute_path(&image.blob_path)
    }

    // Live queries

    /// Items of a service (or one category of it), settled after edits
    pub fn watch_fields(
        self: &Arc<Self>,
        service_id: &str,
        category: Option<&str>,
    ) -> Result<LiveQuery<Vec<VisualField>>, AppError> {
        let scope = Scope {
            service_id: service_id.to_string(),
            category: category.map(String::from),
            table: ChangeTable::Fields,
        };
        let store = Arc::clone(self);
        let (service, category) = (scope.service_id.clone(), scope.category.clone());

        spawn_live_query(self.bus.subscribe(), self.gate.clone(), scope, move || {
            match &category {
                Some(category) => store.get_fields_for_category(&service, category),
                None => store.with_conn(|conn| field_service::get_fields_for_service(conn, &service)),
            }
        })
    }

    /// Photos of one item, resolved through every id it has had
    pub fn watch_photos(
        self: &Arc<Self>,
        key: &FieldKey,
    ) -> Result<LiveQuery<Vec<LocalImage>>, AppError> {
        let scope = Scope {
            service_id: key.service_id.clone(),
            category: Some(key.category.clone()),
            table: ChangeTable::Images,
        };
        let store = Arc::clone(self);
        let key = key.clone();

        spawn_live_query(self.bus.subscribe(), self.gate.clone(), scope, move || {
            Ok(store.photos_for_field(&key)?.images)
        })
    }

    // Queue

    pub fn queue_counts(&self) -> Result<QueueCounts, AppError> {
        self.with_conn(queue_service::counts)
    }

    /// Items that exhausted their retries, for the user to inspect
    pub fn dead_letters(&self) -> Result<Vec<SyncItem>, AppError> {
        self.with_conn(queue_service::dead_letters)
    }

    /// Puts a dead item (and the photo uploads that died with it) back in line
    pub fn retry_dead(&self, item_id: &str) -> Result<SyncItem, AppError> {
        self.in_transaction(|conn| {
            let item = queue_service::retry_dead(conn, item_id)?;
            for open in queue_service::list_open(conn)? {
                if open.entity_type != EntityType::Attachment || open.op != SyncOp::Create {
                    continue;
                }
                let Ok(image_id) = Uuid::parse_str(&open.target) else {
                    continue;
                };
                if let Some(image) = self.images.get(conn, &image_id).map_err(convert_error)? {
                    if image.sync_status == ImageSyncStatus::Failed {
                        self.images
                            .set_sync_status(conn, &image_id, ImageSyncStatus::Queued, None)
                            .map_err(convert_error)?;
                    }
                }
            }
            Ok(item)
        })
    }

    pub fn confirmed_id(&self, temp_id: &str) -> Result<Option<String>, AppError> {
        self.with_conn(|conn| id_map_service::confirmed_for(conn, temp_id))
    }

    pub fn set_sync_enabled(&self, enabled: bool) -> Result<(), AppError> {
        self.with_conn(|conn| sync_service::set_sync_enabled(conn, enabled))
    }
}
