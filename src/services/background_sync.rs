use crate::backend::{AttachmentUpload, Backend, BackendError, RemoteAttachment};
use crate::error::AppError;
use crate::models::{EntityType, ItemStatus, SyncItem, SyncOp};
use crate::reactive::{ChangeOrigin, ChangeTable};
use crate::services::field_service::{self, MergeOutcome};
use crate::services::photo_service::convert_error;
use crate::services::queue_service::{self, QueueCounts, RetryPolicy};
use crate::services::{id_map_service, normalize, remap_service, sync_service};
use crate::store::LocalStore;
use chrono::Utc;
use local_images::{ImageSyncStatus, LocalImage};
use rusqlite::Connection;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Items fetched per round
const DRAIN_BATCH: usize = 50;
/// Rounds per drain; each round moves every ready record one step
const MAX_ROUNDS: usize = 32;
const SYNC_LOG_CAP: usize = 500;

/// Snapshot for the sync indicator
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncStatus {
    pub online: bool,
    pub running: bool,
    pub draining: bool,
    pub counts: QueueCounts,
    pub last_error: Option<String>,
    pub last_drain_at: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub succeeded: usize,
    pub deferred: usize,
    pub failed: usize,
    pub dead_lettered: usize,
    /// The pass stopped because the backend was unreachable
    pub offline: bool,
}

/// In-memory session log entry, lost on restart
#[derive(Debug, Clone, PartialEq)]
pub struct SyncLogEntry {
    pub ts_ms: i64,
    pub stats: SyncStats,
}

/// A queue item resolved into a concrete backend call
#[derive(Debug, Clone, PartialEq)]
enum Dispatch {
    CreateVisual { payload: Value },
    UpdateVisual { id: String, payload: Value },
    DeleteVisual { id: String },
    UploadAttachment { image_id: Uuid, upload: AttachmentUpload },
    UpdateAttachment { record_id: String, payload: Value },
    DeleteAttachment { record_id: String },
}

enum Prepared {
    Ready(Dispatch),
    /// Waits for an owner create; no retry is spent
    Deferred(String),
    /// Can never run (owner gone, blob unreadable)
    Orphaned(String),
    /// Nothing left to do
    Obsolete(String),
}

enum Outcome {
    /// Confirmed id, plus local edits the server record is missing
    Created { id: String, unsent: Option<Value> },
    Uploaded(RemoteAttachment),
    Done,
}

enum Step {
    Succeeded,
    Deferred,
    Failed,
    DeadLettered(usize),
    Offline,
    /// Finished or claimed elsewhere since it was listed
    Skipped,
}

/// Drains the outbox against a backend
///
/// One drain runs at a time. Items go out in submission order per record;
/// failures back off, exhausted items are dead-lettered for the user.
pub struct SyncEngine<B: Backend> {
    store: Arc<LocalStore>,
    backend: Arc<B>,
    policy: RetryPolicy,
    running: AtomicBool,
    drain_lock: tokio::sync::Mutex<()>,
    online: watch::Sender<bool>,
    status: watch::Sender<SyncStatus>,
    kick: Notify,
    next_sync_at: AtomicU64,
    log: Mutex<Vec<SyncLogEntry>>,
}

impl<B: Backend> SyncEngine<B> {
    pub fn new(store: Arc<LocalStore>, backend: Arc<B>) -> Self {
        let policy = RetryPolicy::from(&store.config().sync);
        let (online, _) = watch::channel(true);
        let (status, _) = watch::channel(SyncStatus {
            online: true,
            ..SyncStatus::default()
        });

        Self {
            store,
            backend,
            policy,
            running: AtomicBool::new(false),
            drain_lock: tokio::sync::Mutex::new(()),
            online,
            status,
            kick: Notify::new(),
            next_sync_at: AtomicU64::new(0),
            log: Mutex::new(Vec::new()),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    /// Connectivity signal from the platform; going online triggers a drain
    pub fn set_online(&self, online: bool) {
        let was = self.online.send_replace(online);
        if was != online {
            log::info!("Connectivity changed: {}", if online { "online" } else { "offline" });
            self.status.send_modify(|s| s.online = online);
            if online {
                self.kick();
            }
        }
    }

    pub fn is_online(&self) -> bool {
        *self.online.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    /// Requests a drain as soon as possible
    pub fn kick(&self) {
        self.kick.notify_one();
    }

    /// Puts items left in flight by a crash back in line
    pub fn recover(&self) -> Result<usize, AppError> {
        let recovered = self.store.with_conn(queue_service::recover_in_flight)?;
        self.refresh_status(None)?;
        Ok(recovered)
    }

    pub fn get_sync_log(&self) -> Vec<SyncLogEntry> {
        match self.log.lock() {
            Ok(guard) => guard.clone(),
            Err(_) => Vec::new(),
        }
    }

    fn append_log(&self, entry: SyncLogEntry) {
        if let Ok(mut guard) = self.log.lock() {
            guard.push(entry);
            let len = guard.len();
            if len > SYNC_LOG_CAP {
                guard.drain(0..len - SYNC_LOG_CAP);
            }
        }
    }

    pub fn next_sync_eta_seconds(&self) -> Option<u64> {
        if !self.running.load(Ordering::SeqCst) {
            return None;
        }
        let now_ms = Utc::now().timestamp_millis().max(0) as u64;
        let target = self.next_sync_at.load(Ordering::SeqCst);
        if target == 0 || target <= now_ms {
            Some(0)
        } else {
            Some((target - now_ms) / 1000)
        }
    }

    fn refresh_status(&self, last_error: Option<String>) -> Result<(), AppError> {
        let counts = self.store.queue_counts()?;
        self.status.send_modify(|s| {
            s.counts = counts;
            s.online = *self.online.borrow();
            s.running = self.running.load(Ordering::SeqCst);
            if last_error.is_some() {
                s.last_error = last_error;
            }
        });
        Ok(())
    }

    /// Starts the background loop
    ///
    /// Drains every `sync.interval_secs`, on [`Self::kick`] and when
    /// connectivity comes back. Call [`Self::stop`] to end it.
    pub fn start(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if self.running.swap(true, Ordering::SeqCst) {
            log::warn!("Background sync already running");
            return None;
        }

        let interval = self.store.config().sync.interval();
        log::info!("Starting background sync with {:?} interval", interval);

        let engine = Arc::clone(self);
        let mut online_rx = self.online.subscribe();
        Some(tokio::spawn(async move {
            while engine.running.load(Ordering::SeqCst) {
                match engine.drain_once().await {
                    Ok(stats) if stats != SyncStats::default() => {
                        log::info!("Background sync completed: {:?}", stats);
                    }
                    Ok(_) => {}
                    Err(e) => log::error!("Background sync error: {}", e),
                }

                let next = Utc::now().timestamp_millis().max(0) as u64 + interval.as_millis() as u64;
                engine.next_sync_at.store(next, Ordering::SeqCst);

                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = engine.kick.notified() => {}
                    changed = online_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
            log::info!("Background sync stopped");
        }))
    }

    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            log::info!("Stopping background sync");
            self.kick();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Runs one pass over the outbox
    ///
    /// Returns immediately when another drain is in progress, the device is
    /// offline or sync is disabled in the settings.
    pub async fn drain_once(&self) -> Result<SyncStats, AppError> {
        let _guard = match self.drain_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                log::debug!("Drain already in progress");
                return Ok(SyncStats::default());
            }
        };

        let mut stats = SyncStats::default();
        if !self.is_online() {
            stats.offline = true;
            return Ok(stats);
        }
        if !self.store.with_conn(sync_service::is_sync_enabled)? {
            log::debug!("Sync disabled, skipping drain");
            return Ok(stats);
        }

        self.status.send_modify(|s| s.draining = true);
        let result = self.drain_rounds(&mut stats).await;
        self.status.send_modify(|s| {
            s.draining = false;
            s.last_drain_at = Some(Utc::now().timestamp_millis());
        });

        let last_error = match &result {
            Err(e) => Some(e.to_string()),
            Ok(()) if stats.offline => Some("Backend unreachable".to_string()),
            Ok(()) => None,
        };
        result?;

        if stats.failed == 0 && !stats.offline {
            self.store.with_conn(sync_service::update_last_sync)?;
        }
        self.append_log(SyncLogEntry {
            ts_ms: Utc::now().timestamp_millis(),
            stats: stats.clone(),
        });
        self.refresh_status(last_error)?;
        if stats.dead_lettered > 0 {
            log::warn!(
                "{} queue items need attention (dead-lettered)",
                stats.dead_lettered
            );
        }
        Ok(stats)
    }

    async fn drain_rounds(&self, stats: &mut SyncStats) -> Result<(), AppError> {
        let mut deferred: HashSet<String> = HashSet::new();
        // One attempt per item and pass, even when its backoff is zero
        let mut failed: HashSet<String> = HashSet::new();

        for _ in 0..MAX_ROUNDS {
            let now = Utc::now().timestamp_millis();
            let items = self
                .store
                .with_conn(|conn| queue_service::ready_items(conn, now, DRAIN_BATCH))?;
            if items.is_empty() {
                break;
            }

            let mut progressed = false;
            for item in items {
                if failed.contains(&item.item_id) {
                    continue;
                }
                match self.process(&item).await? {
                    Step::Succeeded => {
                        stats.succeeded += 1;
                        progressed = true;
                    }
                    Step::Deferred => {
                        deferred.insert(item.item_id.clone());
                    }
                    Step::Failed => {
                        stats.failed += 1;
                        failed.insert(item.item_id.clone());
                    }
                    Step::DeadLettered(n) => {
                        stats.dead_lettered += n;
                        progressed = true;
                    }
                    Step::Offline => {
                        stats.offline = true;
                        stats.deferred = deferred.len();
                        return Ok(());
                    }
                    Step::Skipped => {}
                }
            }
            if !progressed {
                break;
            }
        }

        stats.deferred = deferred.len();
        Ok(())
    }

    async fn process(&self, listed: &SyncItem) -> Result<Step, AppError> {
        // The payload is read and the item claimed under one lock, so an edit
        // folded in after listing is either sent now or left for the next pass
        let claimed = self.store.with_conn(|conn| {
            let item = match queue_service::get_item(conn, &listed.item_id)? {
                Some(item) if matches!(item.status, ItemStatus::Pending | ItemStatus::Failed) => item,
                _ => return Ok(None),
            };
            let prepared = self.prepare(conn, &item)?;
            if let Prepared::Ready(dispatch) = &prepared {
                queue_service::mark_in_flight(conn, &item.item_id)?;
                if let Dispatch::UploadAttachment { image_id, .. } = dispatch {
                    self.store
                        .images()
                        .set_sync_status(conn, image_id, ImageSyncStatus::Uploading, None)
                        .map_err(convert_error)?;
                }
            }
            Ok(Some((item, prepared)))
        })?;

        let (current, prepared) = match claimed {
            Some(claimed) => claimed,
            None => {
                log::debug!("Queue item {} changed hands, skipping", listed.item_id);
                return Ok(Step::Skipped);
            }
        };
        let item = &current;
        let dispatch = match prepared {
            Prepared::Ready(dispatch) => dispatch,
            Prepared::Deferred(reason) => {
                log::debug!("Deferring {}: {}", item.target, reason);
                return Ok(Step::Deferred);
            }
            Prepared::Obsolete(reason) => {
                log::info!("Dropping queue item for {}: {}", item.target, reason);
                self.store
                    .with_conn(|conn| queue_service::mark_done(conn, &item.item_id))?;
                return Ok(Step::Succeeded);
            }
            Prepared::Orphaned(reason) => return self.fail(item, &reason, true),
        };

        match self.call(item, &dispatch).await {
            Ok(outcome) => {
                self.complete(item, &dispatch, outcome)?;
                Ok(Step::Succeeded)
            }
            Err(e) if e.is_offline() => {
                log::info!("Backend unreachable, pausing drain: {}", e);
                self.store.with_conn(|conn| {
                    queue_service::release(conn, &item.item_id, Some(&e.to_string()))?;
                    self.set_image_status(conn, item, ImageSyncStatus::Queued, None)
                })?;
                Ok(Step::Offline)
            }
            Err(e) => self.fail(item, &e.to_string(), e.is_permanent()),
        }
    }

    fn prepare(&self, conn: &Connection, item: &SyncItem) -> Result<Prepared, AppError> {
        let prefix = self.store.config().temp_id_prefix.as_str();

        // Waits for the owner's create, or gives up if there is none left
        let unconfirmed = |id: &str| -> Result<Prepared, AppError> {
            if queue_service::has_open_create_for(conn, id)? {
                Ok(Prepared::Deferred(format!("{} is not confirmed yet", id)))
            } else {
                Ok(Prepared::Orphaned(format!("{} was never created", id)))
            }
        };

        match (item.entity_type, item.op) {
            (EntityType::Visual, SyncOp::Create) => {
                let temp = item.temp_id.as_deref().unwrap_or(&item.target);
                if let Some(confirmed) = id_map_service::confirmed_for(conn, temp)? {
                    return Ok(Prepared::Obsolete(format!(
                        "already confirmed as {}",
                        confirmed
                    )));
                }
                Ok(Prepared::Ready(Dispatch::CreateVisual {
                    payload: item.payload.clone(),
                }))
            }
            (EntityType::Visual, op) => {
                let id = id_map_service::resolve_current(conn, &item.target)?;
                if id_map_service::is_temporary(&id, prefix) {
                    return unconfirmed(&id);
                }
                Ok(Prepared::Ready(match op {
                    SyncOp::Delete => Dispatch::DeleteVisual { id },
                    _ => Dispatch::UpdateVisual {
                        id,
                        payload: item.payload.clone(),
                    },
                }))
            }
            (EntityType::Attachment, SyncOp::Create) => {
                let image_id = match Uuid::parse_str(&item.target) {
                    Ok(id) => id,
                    Err(_) => return Ok(Prepared::Orphaned("invalid image id".to_string())),
                };
                let image = match self
                    .store
                    .images()
                    .get(conn, &image_id)
                    .map_err(convert_error)?
                {
                    Some(image) => image,
                    None => return Ok(Prepared::Obsolete("image deleted before upload".to_string())),
                };

                let owner_id = id_map_service::resolve_current(conn, &image.entity_id)?;
                if id_map_service::is_temporary(&owner_id, prefix) {
                    return unconfirmed(&owner_id);
                }

                let bytes = match self.store.images().read_blob(&image) {
                    Ok(bytes) => bytes,
                    Err(e) => return Ok(Prepared::Orphaned(format!("photo file unreadable: {}", e))),
                };

                Ok(Prepared::Ready(Dispatch::UploadAttachment {
                    image_id,
                    upload: upload_for(&image, owner_id, bytes),
                }))
            }
            (EntityType::Attachment, op) => {
                match id_map_service::confirmed_for(conn, &item.target)? {
                    Some(record_id) => Ok(Prepared::Ready(match op {
                        SyncOp::Delete => Dispatch::DeleteAttachment { record_id },
                        _ => Dispatch::UpdateAttachment {
                            record_id,
                            payload: item.payload.clone(),
                        },
                    })),
                    None if op == SyncOp::Delete
                        && !queue_service::has_open_create_for(conn, &item.target)? =>
                    {
                        Ok(Prepared::Obsolete("photo was never uploaded".to_string()))
                    }
                    None => unconfirmed(&item.target),
                }
            }
        }
    }

    async fn call(&self, item: &SyncItem, dispatch: &Dispatch) -> Result<Outcome, BackendError> {
        match dispatch {
            Dispatch::CreateVisual { payload } => {
                if item.retry_count > 0 {
                    if let Some(outcome) = self.find_landed_create(payload).await? {
                        return Ok(outcome);
                    }
                }
                let id = self.backend.create_visual(payload).await?;
                Ok(Outcome::Created { id, unsent: None })
            }
            Dispatch::UpdateVisual { id, payload } => self
                .backend
                .update_visual(id, payload)
                .await
                .map(|_| Outcome::Done),
            Dispatch::DeleteVisual { id } => {
                self.backend.delete_visual(id).await.map(|_| Outcome::Done)
            }
            Dispatch::UploadAttachment { upload, .. } => self
                .backend
                .upload_attachment(upload)
                .await
                .map(Outcome::Uploaded),
            Dispatch::UpdateAttachment { record_id, payload } => self
                .backend
                .update_attachment(record_id, payload)
                .await
                .map(|_| Outcome::Done),
            Dispatch::DeleteAttachment { record_id } => self
                .backend
                .delete_attachment(record_id)
                .await
                .map(|_| Outcome::Done),
        }
    }

    /// A failed create may still have reached the server; its ClientRef finds it
    async fn find_landed_create(&self, payload: &Value) -> Result<Option<Outcome>, BackendError> {
        let client_ref = match payload.get("ClientRef").and_then(Value::as_str) {
            Some(client_ref) => client_ref,
            None => return Ok(None),
        };
        let record = match self.backend.find_visual_by_client_ref(client_ref).await? {
            Some(record) => record,
            None => return Ok(None),
        };
        let server = normalize::normalize_visual(&record)
            .map_err(|e| BackendError::Transient(format!("unreadable record for {}: {}", client_ref, e)))?;

        log::info!(
            "Create of {} already landed as {}, not sending it again",
            client_ref,
            server.visual_id
        );
        Ok(Some(Outcome::Created {
            unsent: normalize::unsent_changes(payload, &server),
            id: server.visual_id,
        }))
    }

    fn complete(&self, item: &SyncItem, dispatch: &Dispatch, outcome: Outcome) -> Result<(), AppError> {
        match (dispatch, outcome) {
            (Dispatch::CreateVisual { .. }, Outcome::Created { id, unsent }) => {
                let report = self.store.with_conn(|conn| {
                    remap_service::complete_create_with(conn, self.store.images(), item, &id, unsent)
                })?;
                if let Some(field) = &report.field {
                    let category = Some(field.category.as_str());
                    self.store
                        .publish(&field.service_id, category, ChangeTable::Fields, ChangeOrigin::Sync);
                    self.store
                        .publish(&field.service_id, category, ChangeTable::Images, ChangeOrigin::Sync);
                }
            }
            (Dispatch::UploadAttachment { image_id, upload }, Outcome::Uploaded(remote)) => {
                let service_id = self.store.in_transaction(|conn| {
                    id_map_service::record_mapping(
                        conn,
                        &upload.client_ref,
                        &remote.record_id,
                        EntityType::Attachment,
                    )?;
                    self.store
                        .images()
                        .mark_verified(conn, image_id, &remote.file_key)
                        .map_err(convert_error)?;
                    queue_service::mark_done(conn, &item.item_id)?;
                    image_service_id(conn, image_id)
                })?;
                log::info!("Uploaded image {} as {}", image_id, remote.record_id);
                if let Some(service_id) = service_id {
                    self.store
                        .publish(&service_id, None, ChangeTable::Images, ChangeOrigin::Sync);
                }
            }
            (Dispatch::UpdateVisual { id, .. } | Dispatch::DeleteVisual { id }, _) => {
                let settled = self.store.with_conn(|conn| {
                    queue_service::mark_done(conn, &item.item_id)?;
                    field_service::clear_dirty_if_settled(conn, id)?;
                    field_service::get_field_by_identifier(conn, id)
                })?;
                if let Some(field) = settled {
                    self.store.publish(
                        &field.service_id,
                        Some(&field.category),
                        ChangeTable::Fields,
                        ChangeOrigin::Sync,
                    );
                }
            }
            _ => {
                self.store
                    .with_conn(|conn| queue_service::mark_done(conn, &item.item_id))?;
            }
        }
        Ok(())
    }

    fn fail(&self, item: &SyncItem, error: &str, permanent: bool) -> Result<Step, AppError> {
        let (outcome, service_id) = self.store.in_transaction(|conn| {
            let outcome = queue_service::record_failure(conn, item, error, permanent, &self.policy)?;
            let dead = outcome.status == ItemStatus::Dead;

            let status = if dead {
                ImageSyncStatus::Failed
            } else {
                ImageSyncStatus::Queued
            };
            self.set_image_status(conn, item, status, Some(error))?;
            for cascaded in &outcome.cascaded {
                self.set_image_status(conn, cascaded, ImageSyncStatus::Failed, cascaded.last_error.as_deref())?;
            }

            let service_id = match item.entity_type {
                EntityType::Visual => field_service::get_field_by_identifier(conn, &item.target)?
                    .map(|f| f.service_id),
                EntityType::Attachment => match Uuid::parse_str(&item.target) {
                    Ok(id) => image_service_id(conn, &id)?,
                    Err(_) => None,
                },
            };
            Ok((outcome, service_id))
        })?;

        if let Some(service_id) = service_id {
            self.store
                .publish(&service_id, None, ChangeTable::Queue, ChangeOrigin::Sync);
            if !outcome.cascaded.is_empty() || item.entity_type == EntityType::Attachment {
                self.store
                    .publish(&service_id, None, ChangeTable::Images, ChangeOrigin::Sync);
            }
        }

        if outcome.status == ItemStatus::Dead {
            Ok(Step::DeadLettered(1 + outcome.cascaded.len()))
        } else {
            Ok(Step::Failed)
        }
    }

    /// Upload state follows the attachment create item
    fn set_image_status(
        &self,
        conn: &Connection,
        item: &SyncItem,
        status: ImageSyncStatus,
        error: Option<&str>,
    ) -> Result<(), AppError> {
        if item.entity_type != EntityType::Attachment || item.op != SyncOp::Create {
            return Ok(());
        }
        let image_id = match Uuid::parse_str(&item.target) {
            Ok(id) => id,
            Err(_) => return Ok(()),
        };
        match self
            .store
            .images()
            .set_sync_status(conn, &image_id, status, error)
        {
            Ok(()) | Err(local_images::LocalImageError::NotFound(_)) => Ok(()),
            Err(e) => Err(convert_error(e)),
        }
    }

    /// Merges the server's visuals of one service into the local store
    ///
    /// A server record echoing the temporary id of a create that is still
    /// queued confirms that create (its response was lost) instead of being
    /// sent a second time. Edits folded into the create after it was sent
    /// are queued again as an update of the confirmed id.
    pub async fn pull_service(&self, service_id: &str) -> Result<usize, AppError> {
        let records = self.backend.list_visuals(service_id).await?;

        let changed = self.store.with_conn(|conn| {
            let mut changed = 0;
            for record in &records {
                let server = match normalize::normalize_visual(record) {
                    Ok(server) => server,
                    Err(e) => {
                        log::warn!("Skipping server record: {}", e);
                        continue;
                    }
                };

                if let Some(temp) = &server.client_ref {
                    if id_map_service::confirmed_for(conn, temp)?.is_none() {
                        if let Some(create) = queue_service::open_create_for(conn, temp)? {
                            if create.status != ItemStatus::InFlight {
                                let unsent = normalize::unsent_changes(&create.payload, &server);
                                remap_service::complete_create_with(
                                    conn,
                                    self.store.images(),
                                    &create,
                                    &server.visual_id,
                                    unsent,
                                )?;
                                changed += 1;
                            }
                        }
                    }
                }

                let (outcome, _) = field_service::merge_server_visual(conn, &server)?;
                if matches!(outcome, MergeOutcome::Inserted | MergeOutcome::ServerApplied) {
                    changed += 1;
                }
            }
            Ok(changed)
        })?;

        if changed > 0 {
            log::info!("Pulled {} changes for service {}", changed, service_id);
            self.store
                .publish(service_id, None, ChangeTable::Fields, ChangeOrigin::Server);
            self.store
                .publish(service_id, None, ChangeTable::Images, ChangeOrigin::Server);
        }
        self.refresh_status(None)?;
        Ok(changed)
    }

    /// Displayable URL of an uploaded photo; `None` until it is verified
    pub async fn photo_url(&self, image: &LocalImage) -> Result<Option<String>, AppError> {
        match &image.remote_ref {
            Some(key) => Ok(Some(self.backend.photo_url(key).await?)),
            None => Ok(None),
        }
    }
}

fn upload_for(image: &LocalImage, owner_id: String, bytes: Vec<u8>) -> AttachmentUpload {
    let file_name = std::path::Path::new(&image.blob_path)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| format!("{}.jpg", image.image_id));

    AttachmentUpload {
        owner_id,
        file_name,
        bytes,
        content_hash: image.content_hash.clone(),
        caption: image.caption.clone(),
        drawings: image.drawings.clone(),
        client_ref: image.image_id.to_string(),
    }
}

/// Service of an image row, deleted or not
fn image_service_id(conn: &Connection, image_id: &Uuid) -> Result<Option<String>, AppError> {
    use rusqlite::OptionalExtension;
    let service_id = conn
        .query_row(
            "SELECT service_id FROM local_images WHERE image_id = ?1",
            [image_id.to_string()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(service_id)
}
