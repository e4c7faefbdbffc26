pub mod schema;

use crate::error::AppError;
use rusqlite::Connection;
use std::path::Path;

/// Opens (or creates) the database file with the complete schema
pub fn init_database(db_path: &Path) -> Result<Connection, AppError> {
    // Make sure the parent directory exists
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let conn = Connection::open(db_path)?;
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
    prepare(&conn)?;
    log::info!("Database ready at {:?}", db_path);
    Ok(conn)
}

/// In-memory database with the complete schema
pub fn init_in_memory() -> Result<Connection, AppError> {
    let conn = Connection::open_in_memory()?;
    prepare(&conn)?;
    Ok(conn)
}

fn prepare(conn: &Connection) -> Result<(), AppError> {
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    schema::init_schema(conn)?;
    local_images::init_image_schema(conn)?;
    Ok(())
}
