use crate::config::SyncConfig;
use crate::error::AppError;
use crate::models::sync_item::ITEM_COLUMNS;
use crate::models::{EntityType, ItemStatus, SyncItem, SyncOp};
use crate::services::id_map_service;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

const OPEN_STATUSES: &str = "('pending', 'in_flight', 'failed')";

/// Retry limits and exponential backoff with full jitter
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&SyncConfig::default())
    }
}

impl From<&SyncConfig> for RetryPolicy {
    fn from(config: &SyncConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_secs(config.backoff_base_secs),
            max_delay: Duration::from_secs(config.backoff_max_secs),
        }
    }
}

impl RetryPolicy {
    /// Upper bound of the delay after the n-th failure
    pub fn ceiling(&self, retry_count: u32) -> Duration {
        let exp = retry_count.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }

    /// Random delay in `0..=ceiling`
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let ceiling = self.ceiling(retry_count).as_millis() as u64;
        Duration::from_millis(rand::random::<u64>() % (ceiling + 1))
    }
}

/// What happened to an item after a failed dispatch
#[derive(Debug, Clone, PartialEq)]
pub struct FailureOutcome {
    pub status: ItemStatus,
    /// Items dead-lettered because they depended on this one
    pub cascaded: Vec<SyncItem>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueCounts {
    pub pending: usize,
    pub in_flight: usize,
    pub failed: usize,
    pub dead: usize,
}

impl QueueCounts {
    pub fn open(&self) -> usize {
        self.pending + self.in_flight + self.failed
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn insert_item(
    conn: &Connection,
    op: SyncOp,
    entity_type: EntityType,
    target: &str,
    depends_on: Option<&str>,
    temp_id: Option<&str>,
    payload: &Value,
) -> Result<SyncItem, AppError> {
    let item_id = ulid::Ulid::new().to_string();
    conn.execute(
        "INSERT INTO sync_queue (item_id, op, entity_type, target, depends_on, temp_id, payload,
             status, retry_count, next_attempt_at, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending', 0, 0, ?8)",
        params![
            &item_id,
            op.as_str(),
            entity_type.as_str(),
            target,
            depends_on,
            temp_id,
            serde_json::to_string(payload)?,
            now_ms()
        ],
    )?;
    log::debug!(
        "Queued {} {} for {}",
        op.as_str(),
        entity_type.as_str(),
        target
    );
    get_item(conn, &item_id)?.ok_or_else(|| AppError::NotFound("Queue item".to_string()))
}

pub fn get_item(conn: &Connection, item_id: &str) -> Result<Option<SyncItem>, AppError> {
    let sql = format!("SELECT {} FROM sync_queue WHERE item_id = ?1", ITEM_COLUMNS);
    let item = conn
        .query_row(&sql, params![item_id], |row| SyncItem::try_from(row))
        .optional()?;
    Ok(item)
}

/// Queues a create and mints the temporary id the record is known by
pub fn enqueue_create(
    conn: &Connection,
    entity_type: EntityType,
    temp_prefix: &str,
    payload: Value,
) -> Result<SyncItem, AppError> {
    let temp_id = id_map_service::new_temp_id(temp_prefix);
    insert_item(
        conn,
        SyncOp::Create,
        entity_type,
        &temp_id,
        None,
        Some(&temp_id),
        &payload,
    )
}

/// Queues an attachment upload for a local image owned by `owner_id`
///
/// A temporary owner becomes a dependency: the upload waits until the
/// owner's create is confirmed.
pub fn enqueue_attachment_create(
    conn: &Connection,
    image_id: &str,
    owner_id: &str,
    owner_is_temporary: bool,
    payload: Value,
) -> Result<SyncItem, AppError> {
    let depends_on = owner_is_temporary.then_some(owner_id);
    insert_item(
        conn,
        SyncOp::Create,
        EntityType::Attachment,
        image_id,
        depends_on,
        None,
        &payload,
    )
}

/// Queues an update, folding it into a not yet sent create or update
pub fn enqueue_update(
    conn: &Connection,
    entity_type: EntityType,
    target: &str,
    payload: Value,
) -> Result<SyncItem, AppError> {
    let ids = related_ids(conn, target)?;
    if let Some(mut last) = last_open_item(conn, entity_type, &ids)? {
        let foldable = matches!(last.op, SyncOp::Create | SyncOp::Update)
            && matches!(last.status, ItemStatus::Pending | ItemStatus::Failed);
        if foldable {
            merge_payload(&mut last.payload, payload);
            conn.execute(
                "UPDATE sync_queue SET payload = ?1 WHERE item_id = ?2",
                params![serde_json::to_string(&last.payload)?, &last.item_id],
            )?;
            log::debug!("Folded update for {} into {}", target, last.item_id);
            return Ok(last);
        }
    }

    insert_item(
        conn,
        SyncOp::Update,
        entity_type,
        target,
        None,
        None,
        &payload,
    )
}

/// Queues a delete
///
/// When the record's create has not been sent yet, it is cancelled together
/// with everything queued after it and `None` is returned: the backend
/// never learns about the record.
pub fn enqueue_delete(
    conn: &Connection,
    entity_type: EntityType,
    target: &str,
    payload: Value,
) -> Result<Option<SyncItem>, AppError> {
    let ids = related_ids(conn, target)?;
    let open = open_items_for(conn, entity_type, &ids)?;

    let unsent_create = open
        .iter()
        .any(|i| i.op == SyncOp::Create && i.status == ItemStatus::Pending);
    if unsent_create {
        let cancelled = close_items(conn, &ids, "cancelled")?;
        log::info!(
            "Cancelled {} queued operations for never synced {}",
            cancelled,
            target
        );
        return Ok(None);
    }

    // Pending updates are pointless once the record goes away
    for item in open
        .iter()
        .filter(|i| i.op == SyncOp::Update && i.status != ItemStatus::InFlight)
    {
        set_closed(conn, &item.item_id, ItemStatus::Done, "superseded")?;
    }

    insert_item(
        conn,
        SyncOp::Delete,
        entity_type,
        target,
        None,
        None,
        &payload,
    )
    .map(Some)
}

/// Items that may be dispatched now, in submission order
///
/// An item is held back while an earlier open item touches the same record
/// (under either of its ids), or while its own backoff has not elapsed.
pub fn ready_items(conn: &Connection, now: i64, limit: usize) -> Result<Vec<SyncItem>, AppError> {
    let open = all_open_items(conn)?;
    let mut blocked: HashSet<String> = HashSet::new();
    let mut aliases: HashMap<String, Vec<String>> = HashMap::new();
    let mut ready = Vec::new();

    for item in open {
        let mut keys = Vec::new();
        for id in item_ids(&item) {
            if !aliases.contains_key(id) {
                aliases.insert(id.to_string(), related_ids(conn, id)?);
            }
            if let Some(related) = aliases.get(id) {
                keys.extend(related.iter().cloned());
            }
        }

        let held = keys.iter().any(|k| blocked.contains(k))
            || item.status == ItemStatus::InFlight
            || item.next_attempt_at > now;

        blocked.extend(keys);
        if held {
            continue;
        }

        ready.push(item);
        if ready.len() >= limit {
            break;
        }
    }

    Ok(ready)
}

pub fn mark_in_flight(conn: &Connection, item_id: &str) -> Result<(), AppError> {
    conn.execute(
        "UPDATE sync_queue SET status = 'in_flight' WHERE item_id = ?1",
        params![item_id],
    )?;
    Ok(())
}

pub fn mark_done(conn: &Connection, item_id: &str) -> Result<(), AppError> {
    conn.execute(
        "UPDATE sync_queue SET status = 'done', last_error = NULL WHERE item_id = ?1",
        params![item_id],
    )?;
    Ok(())
}

/// Back to pending without spending a retry (offline, unresolved dependency)
pub fn release(conn: &Connection, item_id: &str, reason: Option<&str>) -> Result<(), AppError> {
    conn.execute(
        "UPDATE sync_queue SET status = 'pending', last_error = COALESCE(?2, last_error)
         WHERE item_id = ?1",
        params![item_id, reason],
    )?;
    Ok(())
}

/// Records a failed dispatch
///
/// Permanent failures and failures past the retry limit dead-letter the
/// item and everything that depends on it.
pub fn record_failure(
    conn: &Connection,
    item: &SyncItem,
    error: &str,
    permanent: bool,
    policy: &RetryPolicy,
) -> Result<FailureOutcome, AppError> {
    let retry_count = item.retry_count + 1;

    if permanent || retry_count > policy.max_retries {
        conn.execute(
            "UPDATE sync_queue SET status = 'dead', retry_count = ?1, last_error = ?2
             WHERE item_id = ?3",
            params![retry_count, error, &item.item_id],
        )?;
        log::error!(
            "Giving up on {} {} for {} after {} attempts: {}",
            item.op.as_str(),
            item.entity_type.as_str(),
            item.target,
            retry_count,
            error
        );
        let cascaded = cascade_dead(conn, item)?;
        return Ok(FailureOutcome {
            status: ItemStatus::Dead,
            cascaded,
        });
    }

    let delay = policy.backoff(retry_count);
    let next = now_ms() + delay.as_millis() as i64;
    conn.execute(
        "UPDATE sync_queue SET status = 'failed', retry_count = ?1, last_error = ?2,
             next_attempt_at = ?3
         WHERE item_id = ?4",
        params![retry_count, error, next, &item.item_id],
    )?;
    log::warn!(
        "Attempt {} for {} failed, retrying in {:?}: {}",
        retry_count,
        item.target,
        delay,
        error
    );
    Ok(FailureOutcome {
        status: ItemStatus::Failed,
        cascaded: Vec::new(),
    })
}

fn cascade_dead(conn: &Connection, item: &SyncItem) -> Result<Vec<SyncItem>, AppError> {
    // Only a failed create leaves dependents without an owner
    if item.op != SyncOp::Create {
        return Ok(Vec::new());
    }
    let owner = item.temp_id.as_deref().unwrap_or(&item.target);

    let sql = format!(
        "SELECT {} FROM sync_queue
         WHERE status IN {} AND item_id != ?2 AND (target = ?1 OR depends_on = ?1)
         ORDER BY seq",
        ITEM_COLUMNS, OPEN_STATUSES
    );
    let mut stmt = conn.prepare(&sql)?;
    let dependents = stmt
        .query_map(params![owner, &item.item_id], |row| SyncItem::try_from(row))?
        .collect::<Result<Vec<_>, _>>()?;

    let reason = cascade_reason(owner);
    for dependent in &dependents {
        conn.execute(
            "UPDATE sync_queue SET status = 'dead', last_error = ?1 WHERE item_id = ?2",
            params![&reason, &dependent.item_id],
        )?;
    }

    let mut all = dependents.clone();
    for dependent in &dependents {
        all.extend(cascade_dead(conn, dependent)?);
    }
    Ok(all)
}

/// In-flight items left over from a crash go back to pending
pub fn recover_in_flight(conn: &Connection) -> Result<usize, AppError> {
    let rows = conn.execute(
        "UPDATE sync_queue SET status = 'pending' WHERE status = 'in_flight'",
        [],
    )?;
    if rows > 0 {
        log::info!("Recovered {} interrupted queue items", rows);
    }
    Ok(rows)
}

pub fn dead_letters(conn: &Connection) -> Result<Vec<SyncItem>, AppError> {
    let sql = format!(
        "SELECT {} FROM sync_queue WHERE status = 'dead' ORDER BY seq",
        ITEM_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let items = stmt
        .query_map([], |row| SyncItem::try_from(row))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(items)
}

/// Puts a dead item back in line with a fresh retry budget
pub fn retry_dead(conn: &Connection, item_id: &str) -> Result<SyncItem, AppError> {
    let rows = conn.execute(
        "UPDATE sync_queue SET status = 'pending', retry_count = 0, next_attempt_at = 0
         WHERE item_id = ?1 AND status = 'dead'",
        params![item_id],
    )?;
    if rows == 0 {
        return Err(AppError::NotFound("Dead queue item".to_string()));
    }
    let item = get_item(conn, item_id)?.ok_or_else(|| AppError::NotFound("Queue item".to_string()))?;

    // Dependents that died with this create come back with it
    if item.op == SyncOp::Create {
        let owner = item.temp_id.as_deref().unwrap_or(&item.target);
        let revived = conn.execute(
            "UPDATE sync_queue SET status = 'pending', retry_count = 0, next_attempt_at = 0
             WHERE status = 'dead' AND item_id != ?2 AND (target = ?1 OR depends_on = ?1)
               AND last_error = ?3",
            params![owner, item_id, cascade_reason(owner)],
        )?;
        if revived > 0 {
            log::info!("Revived {} dependents of {}", revived, owner);
        }
    }
    Ok(item)
}

fn cascade_reason(owner: &str) -> String {
    format!("Owner {} could not be created", owner)
}

pub fn counts(conn: &Connection) -> Result<QueueCounts, AppError> {
    let mut stmt =
        conn.prepare("SELECT status, COUNT(*) FROM sync_queue GROUP BY status")?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
    })?;

    let mut counts = QueueCounts::default();
    for row in rows {
        let (status, n) = row?;
        let n = n as usize;
        match ItemStatus::from_str(&status) {
            ItemStatus::Pending => counts.pending = n,
            ItemStatus::InFlight => counts.in_flight = n,
            ItemStatus::Failed => counts.failed = n,
            ItemStatus::Dead => counts.dead = n,
            ItemStatus::Done => {}
        }
    }
    Ok(counts)
}

/// Any open item targeting or depending on one of `ids`
pub fn has_open_items_for(conn: &Connection, ids: &[&str]) -> Result<bool, AppError> {
    for id in ids {
        let sql = format!(
            "SELECT COUNT(*) FROM sync_queue
             WHERE status IN {} AND (target = ?1 OR depends_on = ?1 OR temp_id = ?1)",
            OPEN_STATUSES
        );
        let n: i64 = conn.query_row(&sql, params![id], |row| row.get(0))?;
        if n > 0 {
            return Ok(true);
        }
    }
    Ok(false)
}

/// The open create that will confirm `id` (a temp id or a local image id)
pub fn open_create_for(conn: &Connection, id: &str) -> Result<Option<SyncItem>, AppError> {
    let sql = format!(
        "SELECT {} FROM sync_queue
         WHERE status IN {} AND op = 'create' AND (temp_id = ?1 OR target = ?1)
         ORDER BY seq LIMIT 1",
        ITEM_COLUMNS, OPEN_STATUSES
    );
    let item = conn
        .query_row(&sql, params![id], |row| SyncItem::try_from(row))
        .optional()?;
    Ok(item)
}

pub fn has_open_create_for(conn: &Connection, id: &str) -> Result<bool, AppError> {
    Ok(open_create_for(conn, id)?.is_some())
}

/// Closes open visual updates made obsolete by newer server state
pub fn supersede_open_updates(conn: &Connection, ids: &[&str]) -> Result<usize, AppError> {
    let mut total = 0;
    for id in ids {
        total += conn.execute(
            "UPDATE sync_queue SET status = 'done', last_error = 'superseded'
             WHERE op = 'update' AND entity_type = 'visual'
               AND status IN ('pending', 'failed') AND target = ?1",
            params![id],
        )?;
    }
    Ok(total)
}

pub fn list_open(conn: &Connection) -> Result<Vec<SyncItem>, AppError> {
    all_open_items(conn)
}

fn all_open_items(conn: &Connection) -> Result<Vec<SyncItem>, AppError> {
    let sql = format!(
        "SELECT {} FROM sync_queue WHERE status IN {} ORDER BY seq",
        ITEM_COLUMNS, OPEN_STATUSES
    );
    let mut stmt = conn.prepare(&sql)?;
    let items = stmt
        .query_map([], |row| SyncItem::try_from(row))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(items)
}

fn open_items_for(
    conn: &Connection,
    entity_type: EntityType,
    ids: &[String],
) -> Result<Vec<SyncItem>, AppError> {
    Ok(all_open_items(conn)?
        .into_iter()
        .filter(|i| i.entity_type == entity_type && ids.contains(&i.target))
        .collect())
}

fn last_open_item(
    conn: &Connection,
    entity_type: EntityType,
    ids: &[String],
) -> Result<Option<SyncItem>, AppError> {
    Ok(open_items_for(conn, entity_type, ids)?.pop())
}

/// Closes every open item touching `ids`, including dependents
fn close_items(conn: &Connection, ids: &[String], reason: &str) -> Result<usize, AppError> {
    let mut total = 0;
    for item in all_open_items(conn)? {
        let touches = item_ids(&item).any(|id| ids.iter().any(|i| i == id));
        if touches {
            set_closed(conn, &item.item_id, ItemStatus::Done, reason)?;
            total += 1;
        }
    }
    Ok(total)
}

fn set_closed(
    conn: &Connection,
    item_id: &str,
    status: ItemStatus,
    reason: &str,
) -> Result<(), AppError> {
    conn.execute(
        "UPDATE sync_queue SET status = ?1, last_error = ?2 WHERE item_id = ?3",
        params![status.as_str(), reason, item_id],
    )?;
    Ok(())
}

fn item_ids(item: &SyncItem) -> impl Iterator<Item = &str> {
    std::iter::once(item.target.as_str())
        .chain(item.depends_on.as_deref())
        .chain(item.temp_id.as_deref())
}

/// The id itself plus its counterpart in the id map
fn related_ids(conn: &Connection, id: &str) -> Result<Vec<String>, AppError> {
    let mut ids = vec![id.to_string()];
    if let Some(confirmed) = id_map_service::confirmed_for(conn, id)? {
        ids.push(confirmed);
    }
    if let Some(temp) = id_map_service::temp_for(conn, id)? {
        ids.push(temp);
    }
    Ok(ids)
}

fn merge_payload(into: &mut Value, from: Value) {
    match (into, from) {
        (Value::Object(target), Value::Object(source)) => {
            for (k, v) in source {
                target.insert(k, v);
            }
        }
        (into, from) => *into = from,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const PREFIX: &str = "temp_lbw_";

    fn setup_test_db() -> Connection {
        crate::database::init_in_memory().unwrap()
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 2,
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(300),
        }
    }

    #[test]
    fn test_backoff_ceiling() {
        let p = RetryPolicy::default();
        assert_eq!(p.ceiling(1), Duration::from_secs(60));
        assert_eq!(p.ceiling(2), Duration::from_secs(120));
        assert_eq!(p.ceiling(3), Duration::from_secs(240));
        assert_eq!(p.ceiling(4), Duration::from_secs(300));
        assert_eq!(p.ceiling(40), Duration::from_secs(300));
        for n in 1..8 {
            assert!(p.backoff(n) <= p.ceiling(n));
        }
    }

    #[test]
    fn test_create_mints_temp_id() {
        let conn = setup_test_db();
        let item = enqueue_create(&conn, EntityType::Visual, PREFIX, json!({})).unwrap();
        let temp = item.temp_id.clone().unwrap();
        assert!(temp.starts_with(PREFIX));
        assert_eq!(item.target, temp);
        assert_eq!(item.status, ItemStatus::Pending);
    }

    #[test]
    fn test_updates_fold_into_unsent_create() {
        let conn = setup_test_db();
        let create = enqueue_create(&conn, EntityType::Visual, PREFIX, json!({"Name": "Beam"})).unwrap();
        let temp = create.target.clone();

        let folded = enqueue_update(&conn, EntityType::Visual, &temp, json!({"Answers": "Yes"})).unwrap();
        assert_eq!(folded.item_id, create.item_id);
        assert_eq!(folded.payload, json!({"Name": "Beam", "Answers": "Yes"}));
        assert_eq!(list_open(&conn).unwrap().len(), 1);
    }

    #[test]
    fn test_update_after_in_flight_create_is_queued_separately() {
        let conn = setup_test_db();
        let create = enqueue_create(&conn, EntityType::Visual, PREFIX, json!({})).unwrap();
        mark_in_flight(&conn, &create.item_id).unwrap();

        let update = enqueue_update(&conn, EntityType::Visual, &create.target, json!({"Answers": "No"})).unwrap();
        assert_ne!(update.item_id, create.item_id);
        assert_eq!(update.op, SyncOp::Update);
    }

    #[test]
    fn test_fifo_per_target() {
        let conn = setup_test_db();
        let a = enqueue_create(&conn, EntityType::Visual, PREFIX, json!({})).unwrap();
        mark_in_flight(&conn, &a.item_id).unwrap();
        let a_update = enqueue_update(&conn, EntityType::Visual, &a.target, json!({"x": 1})).unwrap();
        let b = enqueue_create(&conn, EntityType::Visual, PREFIX, json!({})).unwrap();

        let ready = ready_items(&conn, now_ms(), 10).unwrap();
        let ids: Vec<_> = ready.iter().map(|i| i.item_id.as_str()).collect();
        assert_eq!(ids, vec![b.item_id.as_str()]);

        mark_done(&conn, &a.item_id).unwrap();
        let ready = ready_items(&conn, now_ms(), 10).unwrap();
        assert_eq!(ready[0].item_id, a_update.item_id);
    }

    #[test]
    fn test_ordering_spans_temp_and_confirmed_ids() {
        let conn = setup_test_db();
        let create = enqueue_create(&conn, EntityType::Visual, PREFIX, json!({})).unwrap();
        mark_in_flight(&conn, &create.item_id).unwrap();
        let first = enqueue_update(&conn, EntityType::Visual, &create.target, json!({"a": 1})).unwrap();
        id_map_service::record_mapping(&conn, &create.target, "4821", EntityType::Visual).unwrap();
        mark_done(&conn, &create.item_id).unwrap();
        let second = enqueue_update(&conn, EntityType::Visual, "4821", json!({"b": 2})).unwrap();

        // Folded into the first update, which is addressed by the temp id
        assert_eq!(second.item_id, first.item_id);
        let ready = ready_items(&conn, now_ms(), 10).unwrap();
        assert_eq!(ready.len(), 1);
    }

    #[test]
    fn test_attachment_waits_for_owner_create() {
        let conn = setup_test_db();
        let create = enqueue_create(&conn, EntityType::Visual, PREFIX, json!({})).unwrap();
        let upload = enqueue_attachment_create(&conn, "img-1", &create.target, true, json!({})).unwrap();

        let ready = ready_items(&conn, now_ms(), 10).unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].item_id, create.item_id);

        mark_done(&conn, &create.item_id).unwrap();
        let ready = ready_items(&conn, now_ms(), 10).unwrap();
        assert_eq!(ready[0].item_id, upload.item_id);
    }

    #[test]
    fn test_delete_cancels_unsent_create() {
        let conn = setup_test_db();
        let create = enqueue_create(&conn, EntityType::Visual, PREFIX, json!({})).unwrap();
        enqueue_attachment_create(&conn, "img-1", &create.target, true, json!({})).unwrap();

        let result = enqueue_delete(&conn, EntityType::Visual, &create.target, json!({})).unwrap();
        assert!(result.is_none());
        assert_eq!(counts(&conn).unwrap().open(), 0);
    }

    #[test]
    fn test_delete_after_confirmation_is_queued() {
        let conn = setup_test_db();
        enqueue_update(&conn, EntityType::Visual, "4821", json!({"a": 1})).unwrap();
        let delete = enqueue_delete(&conn, EntityType::Visual, "4821", json!({})).unwrap().unwrap();

        let open = list_open(&conn).unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].item_id, delete.item_id);
    }

    #[test]
    fn test_failures_back_off_then_dead_letter() {
        let conn = setup_test_db();
        let item = enqueue_create(&conn, EntityType::Visual, PREFIX, json!({})).unwrap();

        let out = record_failure(&conn, &item, "timeout", false, &policy()).unwrap();
        assert_eq!(out.status, ItemStatus::Failed);
        let item = get_item(&conn, &item.item_id).unwrap().unwrap();
        assert_eq!(item.retry_count, 1);
        assert!(item.next_attempt_at >= item.created_at);

        let out = record_failure(&conn, &item, "timeout", false, &policy()).unwrap();
        assert_eq!(out.status, ItemStatus::Failed);
        let item = get_item(&conn, &item.item_id).unwrap().unwrap();

        let out = record_failure(&conn, &item, "timeout", false, &policy()).unwrap();
        assert_eq!(out.status, ItemStatus::Dead);
        assert_eq!(dead_letters(&conn).unwrap().len(), 1);
    }

    #[test]
    fn test_dead_create_cascades_to_dependents() {
        let conn = setup_test_db();
        let create = enqueue_create(&conn, EntityType::Visual, PREFIX, json!({})).unwrap();
        let upload = enqueue_attachment_create(&conn, "img-1", &create.target, true, json!({})).unwrap();

        let out = record_failure(&conn, &create, "400 bad request", true, &policy()).unwrap();
        assert_eq!(out.status, ItemStatus::Dead);
        assert_eq!(out.cascaded.len(), 1);
        assert_eq!(out.cascaded[0].item_id, upload.item_id);
        assert_eq!(counts(&conn).unwrap().dead, 2);

        let revived = retry_dead(&conn, &create.item_id).unwrap();
        assert_eq!(revived.status, ItemStatus::Pending);
        assert_eq!(revived.retry_count, 0);
    }

    #[test]
    fn test_recover_in_flight() {
        let conn = setup_test_db();
        let item = enqueue_create(&conn, EntityType::Visual, PREFIX, json!({})).unwrap();
        mark_in_flight(&conn, &item.item_id).unwrap();

        assert_eq!(recover_in_flight(&conn).unwrap(), 1);
        let item = get_item(&conn, &item.item_id).unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::Pending);
        assert_eq!(item.retry_count, 0);
    }
}
