use crate::error::AppError;
use crate::models::visual_field::FIELD_COLUMNS;
use crate::models::{FieldKey, FieldUpdate, VisualField};
use crate::services::clock_service::{self, next_local_clock, HybridLogicalClock};
use crate::services::normalize::ServerVisual;
use crate::services::queue_service;
use rusqlite::{params, Connection, OptionalExtension};

/// Result of an upsert
#[derive(Debug, Clone, PartialEq)]
pub struct SetOutcome {
    pub field: VisualField,
    /// False when the merged row equals the stored one (nothing written)
    pub changed: bool,
}

/// What a server record did to the local row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted,
    ServerApplied,
    LocalKept,
    Unchanged,
}

/// Loads the row for a composite key
pub fn get_field(conn: &Connection, key: &FieldKey) -> Result<Option<VisualField>, AppError> {
    let sql = format!(
        "SELECT {} FROM visual_fields
         WHERE service_id = ?1 AND category = ?2 AND template_id = ?3",
        FIELD_COLUMNS
    );
    let field = conn
        .query_row(
            &sql,
            params![&key.service_id, &key.category, &key.template_id],
            |row| VisualField::try_from(row),
        )
        .optional()?;
    Ok(field)
}

/// Row whose temporary or confirmed id equals `id`
pub fn get_field_by_identifier(
    conn: &Connection,
    id: &str,
) -> Result<Option<VisualField>, AppError> {
    let sql = format!(
        "SELECT {} FROM visual_fields
         WHERE temp_visual_id = ?1 OR visual_id = ?1
         ORDER BY id LIMIT 1",
        FIELD_COLUMNS
    );
    let field = conn
        .query_row(&sql, params![id], |row| VisualField::try_from(row))
        .optional()?;
    Ok(field)
}

/// All rows of one checklist category, in creation order
pub fn get_fields_for_category(
    conn: &Connection,
    service_id: &str,
    category: &str,
) -> Result<Vec<VisualField>, AppError> {
    let sql = format!(
        "SELECT {} FROM visual_fields
         WHERE service_id = ?1 AND category = ?2
         ORDER BY id",
        FIELD_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let fields = stmt
        .query_map(params![service_id, category], |row| VisualField::try_from(row))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(fields)
}

pub fn get_fields_for_service(
    conn: &Connection,
    service_id: &str,
) -> Result<Vec<VisualField>, AppError> {
    let sql = format!(
        "SELECT {} FROM visual_fields WHERE service_id = ?1 ORDER BY category, id",
        FIELD_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let fields = stmt
        .query_map(params![service_id], |row| VisualField::try_from(row))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(fields)
}

/// Merges `update` onto the row for `key`, creating it if needed
///
/// Writing the same update twice leaves the row untouched the second time:
/// no revision bump, no new clock, `changed == false`.
pub fn set_field(
    conn: &Connection,
    key: &FieldKey,
    update: &FieldUpdate,
    device_id: &str,
) -> Result<SetOutcome, AppError> {
    let existing = get_field(conn, key)?;

    if let Some(expected) = update.expected_rev {
        let actual = existing.as_ref().map(|f| f.rev).unwrap_or(0);
        if expected != actual {
            return Err(AppError::Conflict { expected, actual });
        }
    }

    let mut merged = existing.clone().unwrap_or_else(|| VisualField::new(key));
    update.apply_to(&mut merged);
    merged.validate()?;

    if let Some(current) = existing {
        if current.same_content(&merged) {
            return Ok(SetOutcome {
                field: current,
                changed: false,
            });
        }
    }

    merged.rev += 1;
    merged.clock = Some(next_local_clock(merged.clock.as_ref(), device_id));
    merged.dirty = true;
    merged.updated_at = chrono::Utc::now().timestamp_millis();

    let field = write_row(conn, &merged)?;
    log::debug!(
        "set_field {}/{}/{} rev {}",
        key.service_id,
        key.category,
        key.template_id,
        field.rev
    );

    Ok(SetOutcome {
        field,
        changed: true,
    })
}

/// Adds a locally created dropdown option (no duplicates)
pub fn add_custom_option(
    conn: &Connection,
    key: &FieldKey,
    option: &str,
    device_id: &str,
) -> Result<SetOutcome, AppError> {
    let option = option.trim();
    if option.is_empty() {
        return Err(AppError::Validation("Option must not be empty".to_string()));
    }

    let mut options = get_field(conn, key)?
        .map(|f| f.custom_options)
        .unwrap_or_default();
    if !options.iter().any(|o| o == option) {
        options.push(option.to_string());
    }

    set_field(
        conn,
        key,
        &FieldUpdate::new().custom_options(options),
        device_id,
    )
}

/// Stores the server id next to the temporary one (which stays in place)
pub fn set_confirmed_id(
    conn: &Connection,
    temp_id: &str,
    confirmed_id: &str,
) -> Result<Option<VisualField>, AppError> {
    let rows = conn.execute(
        "UPDATE visual_fields SET visual_id = ?1 WHERE temp_visual_id = ?2",
        params![confirmed_id, temp_id],
    )?;
    if rows == 0 {
        log::warn!("No visual field carries temporary id {}", temp_id);
        return Ok(None);
    }
    get_field_by_identifier(conn, temp_id)
}

/// Clears the dirty flag once no queue item for the row is open
pub fn clear_dirty_if_settled(conn: &Connection, id: &str) -> Result<bool, AppError> {
    let field = match get_field_by_identifier(conn, id)? {
        Some(f) => f,
        None => return Ok(false),
    };
    let ids: Vec<&str> = [field.temp_visual_id.as_deref(), field.visual_id.as_deref()]
        .into_iter()
        .flatten()
        .collect();

    if queue_service::has_open_items_for(conn, &ids)? {
        return Ok(false);
    }

    conn.execute(
        "UPDATE visual_fields SET dirty = 0 WHERE id = ?1",
        params![field.id],
    )?;
    Ok(true)
}

/// Marks a row without any server counterpart as clean
pub fn clear_dirty(conn: &Connection, key: &FieldKey) -> Result<(), AppError> {
    conn.execute(
        "UPDATE visual_fields SET dirty = 0 WHERE service_id = ?1 AND category = ?2 AND template_id = ?3",
        params![&key.service_id, &key.category, &key.template_id],
    )?;
    Ok(())
}

/// Removes the row entirely (explicit delete, not unselect)
pub fn delete_field(conn: &Connection, key: &FieldKey) -> Result<(), AppError> {
    let rows = conn.execute(
        "DELETE FROM visual_fields WHERE service_id = ?1 AND category = ?2 AND template_id = ?3",
        params![&key.service_id, &key.category, &key.template_id],
    )?;
    if rows == 0 {
        return Err(AppError::NotFound("Checklist item".to_string()));
    }
    Ok(())
}

/// Merges one normalized server record into the local store
///
/// Clean rows take the server state. Dirty rows keep their local edit
/// unless the server record is newer than the edit's clock; when the
/// server wins, open updates for the row are superseded.
pub fn merge_server_visual(
    conn: &Connection,
    server: &ServerVisual,
) -> Result<(MergeOutcome, VisualField), AppError> {
    let existing = match get_field_by_identifier(conn, &server.visual_id)? {
        Some(f) => Some(f),
        None => match &server.client_ref {
            Some(temp) => get_field_by_identifier(conn, temp)?,
            None => None,
        },
    };
    let existing = match existing {
        Some(f) => Some(f),
        None => get_field(conn, &server.key())?,
    };

    let server_clock = HybridLogicalClock::from_server(server.modified_at.unwrap_or(0));

    let local = match existing {
        Some(local) => local,
        None => {
            let mut field = VisualField::new(&server.key());
            apply_server(&mut field, server);
            field.rev = 1;
            field.clock = Some(server_clock);
            field.dirty = false;
            field.updated_at = chrono::Utc::now().timestamp_millis();
            let field = write_row(conn, &field)?;
            log::info!("Inserted server visual {}", server.visual_id);
            return Ok((MergeOutcome::Inserted, field));
        }
    };

    let mut candidate = local.clone();
    apply_server(&mut candidate, server);

    if candidate.same_content(&local) {
        return Ok((MergeOutcome::Unchanged, local));
    }

    if local.dirty {
        let local_clock = clock_service::row_clock(local.clock.as_ref(), local.updated_at);
        if !clock_service::server_wins(&local_clock, &server_clock) {
            log::debug!(
                "Keeping local edit of {} over older server state",
                server.visual_id
            );
            // The server id is still worth keeping
            if local.visual_id.is_none() {
                conn.execute(
                    "UPDATE visual_fields SET visual_id = ?1 WHERE id = ?2",
                    params![&server.visual_id, local.id],
                )?;
            }
            let field = get_field_by_identifier(conn, &server.visual_id)?.unwrap_or(local);
            return Ok((MergeOutcome::LocalKept, field));
        }

        let ids: Vec<&str> = [local.temp_visual_id.as_deref(), Some(server.visual_id.as_str())]
            .into_iter()
            .flatten()
            .collect();
        let superseded = queue_service::supersede_open_updates(conn, &ids)?;
        log::info!(
            "Server state of {} is newer; superseded {} local updates",
            server.visual_id,
            superseded
        );
    }

    candidate.rev = local.rev + 1;
    candidate.clock = Some(clock_service::latest(local.clock, server_clock));
    candidate.dirty = false;
    candidate.updated_at = chrono::Utc::now().timestamp_millis();
    let field = write_row(conn, &candidate)?;

    Ok((MergeOutcome::ServerApplied, field))
}

fn apply_server(field: &mut VisualField, server: &ServerVisual) {
    field.visual_id = Some(server.visual_id.clone());
    field.selected = true;
    field.hidden = server.hidden;
    if let Some(name) = &server.name {
        field.template_name = name.clone();
    }
    if let Some(text) = &server.text {
        field.template_text = text.clone();
    }
    if let Some(kind) = server.kind {
        field.kind = kind;
    }
    if let Some(answer_type) = server.answer_type {
        field.answer_type = answer_type;
    }
    field.answer = server.answer.clone();
    field.other_value = server.other_value.clone();
}

/// Upsert by composite key, returns the stored row
fn write_row(conn: &Connection, field: &VisualField) -> Result<VisualField, AppError> {
    let options = serde_json::to_string(&field.custom_options)?;
    let clock = field
        .clock
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    conn.execute(
        "INSERT INTO visual_fields (service_id, category, template_id, template_name, template_text,
             kind, answer_type, answer, other_value, selected, hidden, temp_visual_id, visual_id,
             custom_options, rev, clock, dirty, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)
         ON CONFLICT(service_id, category, template_id) DO UPDATE SET
             template_name = excluded.template_name,
             template_text = excluded.template_text,
             kind = excluded.kind,
             answer_type = excluded.answer_type,
             answer = excluded.answer,
             other_value = excluded.other_value,
             selected = excluded.selected,
             hidden = excluded.hidden,
             temp_visual_id = excluded.temp_visual_id,
             visual_id = excluded.visual_id,
             custom_options = excluded.custom_options,
             rev = excluded.rev,
             clock = excluded.clock,
             dirty = excluded.dirty,
             updated_at = excluded.updated_at",
        params![
            &field.service_id,
            &field.category,
            &field.template_id,
            &field.template_name,
            &field.template_text,
            field.kind.as_str(),
            field.answer_type.as_str(),
            &field.answer,
            &field.other_value,
            field.selected,
            field.hidden,
            &field.temp_visual_id,
            &field.visual_id,
            options,
            field.rev,
            clock,
            field.dirty,
            field.updated_at,
        ],
    )?;

    get_field(conn, &field.key())?
        .ok_or_else(|| AppError::Other("Upserted row vanished".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FieldKind;

    const DEVICE: &str = "device-test";

    fn setup_test_db() -> Connection {
        crate::database::init_in_memory().unwrap()
    }

    fn key() -> FieldKey {
        FieldKey::new("svc-1", "Foundations", "tpl-cracked-beam")
    }

    #[test]
    fn test_set_field_twice_is_idempotent() {
        let conn = setup_test_db();
        let update = FieldUpdate::new()
            .selected(true)
            .temp_visual_id("temp_lbw_1")
            .kind(FieldKind::Deficiency)
            .template("Cracked beam", "Beam shows visible cracking");

        let first = set_field(&conn, &key(), &update, DEVICE).unwrap();
        assert!(first.changed);
        let second = set_field(&conn, &key(), &update, DEVICE).unwrap();
        assert!(!second.changed);
        assert_eq!(first.field, second.field);

        let rows = get_fields_for_category(&conn, "svc-1", "Foundations").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0], first.field);
    }

    #[test]
    fn test_set_field_merges_partial_updates() {
        let conn = setup_test_db();
        set_field(
            &conn,
            &key(),
            &FieldUpdate::new().selected(true).temp_visual_id("temp_lbw_1"),
            DEVICE,
        )
        .unwrap();
        let out = set_field(
            &conn,
            &key(),
            &FieldUpdate::new().answer(Some("Yes".to_string())),
            DEVICE,
        )
        .unwrap();

        assert!(out.field.selected);
        assert_eq!(out.field.temp_visual_id.as_deref(), Some("temp_lbw_1"));
        assert_eq!(out.field.answer.as_deref(), Some("Yes"));
        assert_eq!(out.field.rev, 2);
        assert!(out.field.dirty);
    }

    #[test]
    fn test_expected_rev_conflict() {
        let conn = setup_test_db();
        set_field(&conn, &key(), &FieldUpdate::new().answer(Some("a".into())), DEVICE).unwrap();

        let stale = FieldUpdate::new().answer(Some("b".into())).expect_rev(0);
        match set_field(&conn, &key(), &stale, DEVICE) {
            Err(AppError::Conflict { expected, actual }) => {
                assert_eq!(expected, 0);
                assert_eq!(actual, 1);
            }
            other => panic!("expected conflict, got {:?}", other),
        }

        let fresh = FieldUpdate::new().answer(Some("b".into())).expect_rev(1);
        assert_eq!(set_field(&conn, &key(), &fresh, DEVICE).unwrap().field.rev, 2);
    }

    #[test]
    fn test_selected_without_id_rejected() {
        let conn = setup_test_db();
        let result = set_field(&conn, &key(), &FieldUpdate::new().selected(true), DEVICE);
        assert!(matches!(result, Err(AppError::Validation(_))));
        assert!(get_field(&conn, &key()).unwrap().is_none());
    }

    #[test]
    fn test_custom_options_are_a_set() {
        let conn = setup_test_db();
        add_custom_option(&conn, &key(), "Steel", DEVICE).unwrap();
        add_custom_option(&conn, &key(), "Timber", DEVICE).unwrap();
        let out = add_custom_option(&conn, &key(), "Steel", DEVICE).unwrap();
        assert!(!out.changed);
        assert_eq!(out.field.custom_options, vec!["Steel", "Timber"]);
    }

    #[test]
    fn test_confirmed_id_keeps_temporary() {
        let conn = setup_test_db();
        set_field(
            &conn,
            &key(),
            &FieldUpdate::new().selected(true).temp_visual_id("temp_lbw_1"),
            DEVICE,
        )
        .unwrap();

        let field = set_confirmed_id(&conn, "temp_lbw_1", "4821").unwrap().unwrap();
        assert_eq!(field.visual_id.as_deref(), Some("4821"));
        assert_eq!(field.temp_visual_id.as_deref(), Some("temp_lbw_1"));
        assert_eq!(
            get_field_by_identifier(&conn, "4821").unwrap().unwrap().id,
            field.id
        );
    }

    fn server_visual(id: &str, answer: &str, modified_at: i64) -> ServerVisual {
        ServerVisual {
            visual_id: id.to_string(),
            service_id: "svc-1".to_string(),
            category: "Foundations".to_string(),
            template_id: "tpl-cracked-beam".to_string(),
            name: Some("Cracked beam".to_string()),
            text: None,
            kind: Some(FieldKind::Deficiency),
            answer_type: None,
            answer: Some(answer.to_string()),
            other_value: None,
            hidden: false,
            modified_at: Some(modified_at),
            client_ref: None,
        }
    }

    #[test]
    fn test_merge_inserts_unknown_record() {
        let conn = setup_test_db();
        let (outcome, field) = merge_server_visual(&conn, &server_visual("77", "No", 1000)).unwrap();
        assert_eq!(outcome, MergeOutcome::Inserted);
        assert_eq!(field.visual_id.as_deref(), Some("77"));
        assert!(field.selected);
        assert!(!field.dirty);

        let (again, _) = merge_server_visual(&conn, &server_visual("77", "No", 1000)).unwrap();
        assert_eq!(again, MergeOutcome::Unchanged);
    }

    #[test]
    fn test_merge_keeps_newer_local_edit() {
        let conn = setup_test_db();
        merge_server_visual(&conn, &server_visual("77", "No", 1000)).unwrap();
        set_field(&conn, &key(), &FieldUpdate::new().answer(Some("Yes".into())), DEVICE).unwrap();

        // Server copy older than the local edit
        let (outcome, field) = merge_server_visual(&conn, &server_visual("77", "Maybe", 2000)).unwrap();
        assert_eq!(outcome, MergeOutcome::LocalKept);
        assert_eq!(field.answer.as_deref(), Some("Yes"));
        assert!(field.dirty);
    }

    #[test]
    fn test_merge_newer_server_supersedes_local() {
        let conn = setup_test_db();
        merge_server_visual(&conn, &server_visual("77", "No", 1000)).unwrap();
        set_field(&conn, &key(), &FieldUpdate::new().answer(Some("Yes".into())), DEVICE).unwrap();
        queue_service::enqueue_update(
            &conn,
            crate::models::EntityType::Visual,
            "77",
            serde_json::json!({"Answers": "Yes"}),
        )
        .unwrap();

        let future = chrono::Utc::now().timestamp_millis() + 60_000;
        let (outcome, field) = merge_server_visual(&conn, &server_visual("77", "Maybe", future)).unwrap();
        assert_eq!(outcome, MergeOutcome::ServerApplied);
        assert_eq!(field.answer.as_deref(), Some("Maybe"));
        assert!(!field.dirty);
        assert!(!queue_service::has_open_items_for(&conn, &["77"]).unwrap());
    }
}
