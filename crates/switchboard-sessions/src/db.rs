use rusqlite::Connection;

use crate::error::Result;
use crate::registry::SessionRecord;

/// Initialise the registry table.
///
/// Safe to call on every startup - uses `IF NOT EXISTS` throughout.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS sessions (
            session_key TEXT PRIMARY KEY,
            uuid        TEXT NOT NULL,
            identity    TEXT,
            last_used   INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_sessions_identity
            ON sessions(identity);",
    )?;
    Ok(())
}

/// Upsert one registry row.
pub fn upsert_row(conn: &Connection, key: &str, record: &SessionRecord) -> Result<()> {
    conn.execute(
        "INSERT INTO sessions (session_key, uuid, identity, last_used)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(session_key) DO UPDATE SET
            uuid = excluded.uuid,
            identity = excluded.identity,
            last_used = excluded.last_used",
        rusqlite::params![key, record.uuid, record.identity, record.last_used],
    )?;
    Ok(())
}

/// Delete one registry row. Missing rows are not an error.
pub fn delete_row(conn: &Connection, key: &str) -> Result<()> {
    conn.execute(
        "DELETE FROM sessions WHERE session_key = ?1",
        rusqlite::params![key],
    )?;
    Ok(())
}

/// Load every persisted row, oldest first.
pub fn load_all(conn: &Connection) -> Result<Vec<(String, SessionRecord)>> {
    let mut stmt =
        conn.prepare("SELECT session_key, uuid, identity, last_used FROM sessions ORDER BY last_used")?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            SessionRecord {
                uuid: row.get(1)?,
                identity: row.get(2)?,
                last_used: row.get(3)?,
            },
        ))
    })?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}
