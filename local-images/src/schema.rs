use rusqlite::{Connection, Result};

/// Initialize local image database schema
pub fn init_image_schema(conn: &Connection) -> Result<()> {
    // Schema version table for the image store
    conn.execute(
        "CREATE TABLE IF NOT EXISTS image_schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    let current_version: i32 = conn
        .query_row(
            "SELECT version FROM image_schema_version ORDER BY version DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current_version < 1 {
        create_image_schema_v1(conn)?;
        conn.execute("INSERT INTO image_schema_version (version) VALUES (1)", [])?;
    }

    Ok(())
}

/// Create image schema version 1
fn create_image_schema_v1(conn: &Connection) -> Result<()> {
    // Table: local_images - one row per captured photo
    conn.execute(
        "CREATE TABLE IF NOT EXISTS local_images (
            image_id TEXT PRIMARY KEY,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            service_id TEXT NOT NULL,
            blob_path TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            remote_ref TEXT,
            caption TEXT,
            drawings TEXT,
            sync_status TEXT NOT NULL DEFAULT 'queued' CHECK(sync_status IN ('queued', 'uploading', 'verified', 'failed')),
            sync_error TEXT,
            deleted INTEGER NOT NULL DEFAULT 0 CHECK(deleted IN (0,1)),
            created_at INTEGER NOT NULL,
            updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    // Owner lookups drive photo association
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_local_images_entity ON local_images(entity_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_local_images_service ON local_images(service_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_local_images_sync_status ON local_images(sync_status)",
        [],
    )?;

    // Trigger for updated_at in local_images
    conn.execute(
        "CREATE TRIGGER IF NOT EXISTS update_local_images_timestamp
         AFTER UPDATE ON local_images
         BEGIN
            UPDATE local_images SET updated_at = CURRENT_TIMESTAMP WHERE image_id = NEW.image_id;
         END",
        [],
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_repeatable() {
        let conn = Connection::open_in_memory().unwrap();
        init_image_schema(&conn).unwrap();
        init_image_schema(&conn).unwrap();

        let versions: i32 = conn
            .query_row("SELECT COUNT(*) FROM image_schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(versions, 1);
    }
}
