use rusqlite::{Connection, Result};

/// Initialize photo store database schema
pub fn init_photo_schema(conn: &Connection) -> Result<()> {
    // Schema version table for the photo store
    conn.execute(
        "CREATE TABLE IF NOT EXISTS photo_schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    // Check current photo schema version
    let current_version: i32 = conn
        .query_row(
            "SELECT version FROM photo_schema_version ORDER BY version DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current_version < 1 {
        create_photo_schema_v1(conn)?;
        conn.execute("INSERT INTO photo_schema_version (version) VALUES (1)", [])?;
    }

    Ok(())
}

/// Create photo store schema version 1
fn create_photo_schema_v1(conn: &Connection) -> Result<()> {
    // Table: photos - processed image payload, thumbnail and sync state
    conn.execute(
        "CREATE TABLE IF NOT EXISTS photos (
            id TEXT PRIMARY KEY,
            owner_user_id TEXT NOT NULL,
            product_id TEXT,
            category TEXT NOT NULL,
            bytes BLOB NOT NULL,
            thumbnail_bytes BLOB NOT NULL,
            size INTEGER NOT NULL,
            width INTEGER NOT NULL,
            height INTEGER NOT NULL,
            format TEXT NOT NULL CHECK(format IN ('jpeg', 'png', 'webp')),
            quality REAL NOT NULL,
            timestamp INTEGER NOT NULL,
            sync_status TEXT NOT NULL DEFAULT 'pending' CHECK(sync_status IN ('pending', 'syncing', 'synced', 'failed')),
            upload_key TEXT,
            upload_url TEXT,
            retry_count INTEGER NOT NULL DEFAULT 0,
            sync_error TEXT,
            last_sync_attempt INTEGER,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    // Secondary indexes: by owner, sync status, product and capture time
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_photos_owner ON photos(owner_user_id, timestamp)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_photos_sync_status ON photos(sync_status)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_photos_product ON photos(product_id, timestamp)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_photos_timestamp ON photos(timestamp)",
        [],
    )?;

    // Trigger for updated_at in photos
    conn.execute(
        "CREATE TRIGGER IF NOT EXISTS update_photos_timestamp
         AFTER UPDATE ON photos
         BEGIN
            UPDATE photos SET updated_at = CURRENT_TIMESTAMP WHERE id = NEW.id;
         END",
        [],
    )?;

    // Table: sync_metadata - small key/value pairs such as the last sync time
    conn.execute(
        "CREATE TABLE IF NOT EXISTS sync_metadata (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    Ok(())
}
