use rusqlite::{Connection, Result};

/// Initialize the schema for visual fields, identifier map and sync queue
pub fn init_schema(conn: &Connection) -> Result<()> {
    // Schema version table for future migrations
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    let current_version: i32 = conn
        .query_row(
            "SELECT version FROM schema_version ORDER BY version DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current_version < 1 {
        create_schema(conn)?;
        conn.execute("INSERT INTO schema_version (version) VALUES (1)", [])?;
    }

    Ok(())
}

/// Create the complete schema (version 1)
fn create_schema(conn: &Connection) -> Result<()> {
    // Table: visual_fields (one row per service/category/template)
    conn.execute(
        "CREATE TABLE IF NOT EXISTS visual_fields (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            service_id TEXT NOT NULL,
            category TEXT NOT NULL,
            template_id TEXT NOT NULL,
            template_name TEXT NOT NULL DEFAULT '',
            template_text TEXT NOT NULL DEFAULT '',
            kind TEXT CHECK(kind IN ('comment', 'limitation', 'deficiency')) NOT NULL DEFAULT 'comment',
            answer_type TEXT CHECK(answer_type IN ('text', 'boolean', 'multi_select')) NOT NULL DEFAULT 'text',
            answer TEXT,
            other_value TEXT,
            selected INTEGER NOT NULL DEFAULT 0 CHECK(selected IN (0,1)),
            hidden INTEGER NOT NULL DEFAULT 0 CHECK(hidden IN (0,1)),
            temp_visual_id TEXT UNIQUE,
            visual_id TEXT,
            custom_options TEXT NOT NULL DEFAULT '[]',
            rev INTEGER NOT NULL DEFAULT 0,
            clock TEXT,
            dirty INTEGER NOT NULL DEFAULT 0 CHECK(dirty IN (0,1)),
            updated_at INTEGER NOT NULL,
            UNIQUE(service_id, category, template_id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_visual_fields_scope ON visual_fields(service_id, category)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_visual_fields_visual_id ON visual_fields(visual_id)",
        [],
    )?;

    // Table: id_map (append-only temporary -> confirmed identifiers)
    conn.execute(
        "CREATE TABLE IF NOT EXISTS id_map (
            temp_id TEXT PRIMARY KEY,
            confirmed_id TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_id_map_confirmed ON id_map(confirmed_id)",
        [],
    )?;

    // Table: sync_queue (outbox of pending backend operations)
    conn.execute(
        "CREATE TABLE IF NOT EXISTS sync_queue (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            item_id TEXT NOT NULL UNIQUE,
            op TEXT CHECK(op IN ('create', 'update', 'delete')) NOT NULL,
            entity_type TEXT CHECK(entity_type IN ('visual', 'attachment')) NOT NULL,
            target TEXT NOT NULL,
            depends_on TEXT,
            temp_id TEXT,
            payload TEXT NOT NULL DEFAULT '{}',
            status TEXT CHECK(status IN ('pending', 'in_flight', 'failed', 'done', 'dead')) NOT NULL DEFAULT 'pending',
            retry_count INTEGER NOT NULL DEFAULT 0,
            next_attempt_at INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            created_at INTEGER NOT NULL,
            updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_sync_queue_status ON sync_queue(status)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_sync_queue_target ON sync_queue(target)",
        [],
    )?;

    // Trigger for updated_at in sync_queue
    conn.execute(
        "CREATE TRIGGER IF NOT EXISTS update_sync_queue_timestamp
         AFTER UPDATE ON sync_queue
         BEGIN
            UPDATE sync_queue SET updated_at = CURRENT_TIMESTAMP WHERE seq = NEW.seq;
         END",
        [],
    )?;

    // Table: sync_settings (per-device synchronization state)
    conn.execute(
        "CREATE TABLE IF NOT EXISTS sync_settings (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            enabled INTEGER NOT NULL DEFAULT 1 CHECK(enabled IN (0,1)),
            device_id TEXT,
            last_sync TEXT,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    conn.execute(
        "CREATE TRIGGER IF NOT EXISTS update_sync_settings_timestamp
         AFTER UPDATE ON sync_settings
         BEGIN
            UPDATE sync_settings SET updated_at = CURRENT_TIMESTAMP WHERE id = NEW.id;
         END",
        [],
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_tables_exist() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        init_schema(&conn).unwrap();

        let count: i32 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table'
                 AND name IN ('visual_fields', 'id_map', 'sync_queue', 'sync_settings')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 4);
    }
}
