use rusqlite::Connection;

use crate::error::Result;

pub const SCHEMA_VERSION: i64 = 1;

pub fn initialize(conn: &Connection) -> Result<()> {
    conn.execute_batch("PRAGMA journal_mode = WAL;")?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.pragma_update(None, "busy_timeout", 5000)?;
    conn.pragma_update(None, "wal_autocheckpoint", 100)?;

    // In-memory and freshly created databases legitimately fail this.
    if conn
        .execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")
        .is_ok()
    {
        tracing::info!("startup WAL checkpoint complete");
    }

    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS metadata (
            key   TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS epochs (
            epoch                INTEGER PRIMARY KEY,
            number_of_top_topics INTEGER NOT NULL,
            committed_at         TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS usage_history (
            id    INTEGER PRIMARY KEY AUTOINCREMENT,
            epoch INTEGER NOT NULL,
            app   TEXT NOT NULL,
            sdk   TEXT NOT NULL DEFAULT '',
            UNIQUE (epoch, app, sdk)
        );

        CREATE TABLE IF NOT EXISTS app_usage_history (
            id    INTEGER PRIMARY KEY AUTOINCREMENT,
            epoch INTEGER NOT NULL,
            app   TEXT NOT NULL,
            UNIQUE (epoch, app)
        );

        CREATE TABLE IF NOT EXISTS app_classification_topics (
            epoch            INTEGER NOT NULL,
            app              TEXT NOT NULL,
            position         INTEGER NOT NULL,
            topic            INTEGER,
            taxonomy_version INTEGER,
            model_version    INTEGER,
            PRIMARY KEY (epoch, app, position)
        );

        CREATE TABLE IF NOT EXISTS caller_can_learn_topics (
            epoch            INTEGER NOT NULL,
            topic            INTEGER NOT NULL,
            taxonomy_version INTEGER NOT NULL,
            model_version    INTEGER NOT NULL,
            caller           TEXT NOT NULL,
            PRIMARY KEY (epoch, topic, taxonomy_version, model_version, caller)
        );

        CREATE TABLE IF NOT EXISTS top_topics (
            epoch            INTEGER NOT NULL REFERENCES epochs(epoch) ON DELETE CASCADE,
            slot             INTEGER NOT NULL,
            topic            INTEGER NOT NULL,
            taxonomy_version INTEGER NOT NULL,
            model_version    INTEGER NOT NULL,
            is_padding       INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (epoch, slot)
        );

        CREATE TABLE IF NOT EXISTS returned_topics (
            epoch            INTEGER NOT NULL,
            app              TEXT NOT NULL,
            sdk              TEXT NOT NULL DEFAULT '',
            topic            INTEGER NOT NULL,
            taxonomy_version INTEGER NOT NULL,
            model_version    INTEGER NOT NULL,
            PRIMARY KEY (epoch, app, sdk)
        );

        CREATE INDEX IF NOT EXISTS idx_usage_epoch ON usage_history(epoch);
        CREATE INDEX IF NOT EXISTS idx_app_usage_app ON app_usage_history(app);
        CREATE INDEX IF NOT EXISTS idx_class_app ON app_classification_topics(app);
        CREATE INDEX IF NOT EXISTS idx_learn_caller ON caller_can_learn_topics(caller);
        CREATE INDEX IF NOT EXISTS idx_returned_app ON returned_topics(app);
        ",
    )?;

    conn.execute(
        "INSERT OR REPLACE INTO metadata (key, value) VALUES ('schema_version', ?1)",
        [SCHEMA_VERSION.to_string()],
    )?;

    Ok(())
}

pub fn get_schema_version(conn: &Connection) -> Result<Option<i64>> {
    let mut stmt = conn.prepare("SELECT value FROM metadata WHERE key = 'schema_version'")?;
    let version = stmt
        .query_row([], |row| {
            let v: String = row.get(0)?;
            Ok(v.parse::<i64>().unwrap_or(0))
        })
        .ok();
    Ok(version)
}
