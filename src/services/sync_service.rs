use crate::error::AppError;
use crate::models::SyncSettings;
use rusqlite::{params, Connection, Result};

/// Loads the synchronization settings from the database
pub fn load_sync_settings(conn: &Connection) -> Result<Option<SyncSettings>, AppError> {
    let mut stmt = conn.prepare(
        "SELECT id, enabled, device_id, last_sync, created_at, updated_at
         FROM sync_settings
         ORDER BY id DESC
         LIMIT 1",
    )?;

    let result = stmt.query_row([], |row| {
        Ok(SyncSettings {
            id: row.get(0)?,
            enabled: row.get(1)?,
            device_id: row.get(2)?,
            last_sync: row.get(3)?,
            created_at: row.get(4)?,
            updated_at: row.get(5)?,
        })
    });

    match result {
        Ok(settings) => Ok(Some(settings)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(AppError::Database(e)),
    }
}

/// Saves or updates the synchronization settings
pub fn save_sync_settings(conn: &Connection, settings: &SyncSettings) -> Result<i64, AppError> {
    let existing = load_sync_settings(conn)?;

    if let Some(existing) = existing {
        conn.execute(
            "UPDATE sync_settings SET enabled = ?1, device_id = ?2, last_sync = ?3 WHERE id = ?4",
            params![
                settings.enabled,
                &settings.device_id,
                &settings.last_sync,
                existing.id
            ],
        )?;
        Ok(existing.id)
    } else {
        conn.execute(
            "INSERT INTO sync_settings (enabled, device_id, last_sync) VALUES (?1, ?2, ?3)",
            params![settings.enabled, &settings.device_id, &settings.last_sync],
        )?;
        Ok(conn.last_insert_rowid())
    }
}

/// Stable device id (created and stored if missing)
pub fn get_device_id(conn: &Connection) -> Result<String, AppError> {
    let mut settings = load_sync_settings(conn)?.unwrap_or_default();
    if let Some(id) = &settings.device_id {
        return Ok(id.clone());
    }
    let new_id = uuid::Uuid::new_v4().to_string();
    settings.device_id = Some(new_id.clone());
    save_sync_settings(conn, &settings)?;
    log::info!("Generated device id {}", new_id);
    Ok(new_id)
}

pub fn is_sync_enabled(conn: &Connection) -> Result<bool, AppError> {
    Ok(load_sync_settings(conn)?.map(|s| s.enabled).unwrap_or(true))
}

pub fn set_sync_enabled(conn: &Connection, enabled: bool) -> Result<(), AppError> {
    let mut settings = load_sync_settings(conn)?.unwrap_or_default();
    settings.enabled = enabled;
    save_sync_settings(conn, &settings)?;
    Ok(())
}

/// Records the time of the last successful drain
pub fn update_last_sync(conn: &Connection) -> Result<(), AppError> {
    let mut settings = load_sync_settings(conn)?.unwrap_or_default();
    settings.last_sync = Some(chrono::Utc::now().to_rfc3339());
    save_sync_settings(conn, &settings)?;
    Ok(())
}
