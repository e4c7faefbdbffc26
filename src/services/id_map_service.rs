use crate::error::AppError;
use crate::models::EntityType;
use rusqlite::{params, Connection, OptionalExtension};

/// Result of recording a temporary -> confirmed pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MapInsert {
    Inserted,
    /// Same pair recorded before
    AlreadyPresent,
}

/// Generates a temporary id: configured prefix plus a lowercase ULID
pub fn new_temp_id(prefix: &str) -> String {
    format!("{}{}", prefix, ulid::Ulid::new().to_string().to_lowercase())
}

pub fn is_temporary(id: &str, prefix: &str) -> bool {
    !prefix.is_empty() && id.starts_with(prefix)
}

/// Records that `temp_id` became `confirmed_id`
///
/// Entries are never overwritten. Recording the same pair twice is a
/// no-op; pointing an existing temp id at a different confirmed id is
/// refused.
pub fn record_mapping(
    conn: &Connection,
    temp_id: &str,
    confirmed_id: &str,
    entity_type: EntityType,
) -> Result<MapInsert, AppError> {
    if temp_id.is_empty() || confirmed_id.is_empty() {
        return Err(AppError::Validation(
            "Identifier mapping needs both ids".to_string(),
        ));
    }

    if let Some(existing) = confirmed_for(conn, temp_id)? {
        if existing == confirmed_id {
            return Ok(MapInsert::AlreadyPresent);
        }
        return Err(AppError::Validation(format!(
            "Temporary id {} is already mapped to {}",
            temp_id, existing
        )));
    }

    conn.execute(
        "INSERT INTO id_map (temp_id, confirmed_id, entity_type, created_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            temp_id,
            confirmed_id,
            entity_type.as_str(),
            chrono::Utc::now().timestamp_millis()
        ],
    )?;
    log::info!("Mapped {} -> {}", temp_id, confirmed_id);
    Ok(MapInsert::Inserted)
}

pub fn confirmed_for(conn: &Connection, temp_id: &str) -> Result<Option<String>, AppError> {
    let id = conn
        .query_row(
            "SELECT confirmed_id FROM id_map WHERE temp_id = ?1",
            params![temp_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(id)
}

/// Reverse lookup; the oldest temp id wins if several point at one record
pub fn temp_for(conn: &Connection, confirmed_id: &str) -> Result<Option<String>, AppError> {
    let id = conn
        .query_row(
            "SELECT temp_id FROM id_map WHERE confirmed_id = ?1
             ORDER BY created_at, temp_id LIMIT 1",
            params![confirmed_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(id)
}

/// The id to use against the backend: confirmed when known
pub fn resolve_current(conn: &Connection, id: &str) -> Result<String, AppError> {
    Ok(confirmed_for(conn, id)?.unwrap_or_else(|| id.to_string()))
}

pub fn count_mappings(conn: &Connection) -> Result<i64, AppError> {
    let count = conn.query_row("SELECT COUNT(*) FROM id_map", [], |row| row.get(0))?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup_test_db() -> Connection {
        crate::database::init_in_memory().unwrap()
    }

    #[test]
    fn test_temp_id_format() {
        let id = new_temp_id("temp_lbw_");
        assert!(id.starts_with("temp_lbw_"));
        assert_eq!(id.len(), "temp_lbw_".len() + 26);
        assert_eq!(id, id.to_lowercase());
        assert_ne!(id, new_temp_id("temp_lbw_"));
        assert!(is_temporary(&id, "temp_lbw_"));
        assert!(!is_temporary("4821", "temp_lbw_"));
    }

    #[test]
    fn test_mapping_is_append_only() {
        let conn = setup_test_db();
        assert_eq!(
            record_mapping(&conn, "temp_lbw_a", "4821", EntityType::Visual).unwrap(),
            MapInsert::Inserted
        );
        assert_eq!(
            record_mapping(&conn, "temp_lbw_a", "4821", EntityType::Visual).unwrap(),
            MapInsert::AlreadyPresent
        );
        assert!(record_mapping(&conn, "temp_lbw_a", "9999", EntityType::Visual).is_err());

        assert_eq!(confirmed_for(&conn, "temp_lbw_a").unwrap().as_deref(), Some("4821"));
        assert_eq!(count_mappings(&conn).unwrap(), 1);
    }

    #[test]
    fn test_lookups_both_directions() {
        let conn = setup_test_db();
        record_mapping(&conn, "temp_lbw_a", "4821", EntityType::Visual).unwrap();

        assert_eq!(temp_for(&conn, "4821").unwrap().as_deref(), Some("temp_lbw_a"));
        assert_eq!(resolve_current(&conn, "temp_lbw_a").unwrap(), "4821");
        assert_eq!(resolve_current(&conn, "temp_lbw_b").unwrap(), "temp_lbw_b");
        assert!(temp_for(&conn, "1").unwrap().is_none());
    }
}
