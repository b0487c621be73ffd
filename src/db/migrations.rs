//! Stepped schema migrations. The stamped version lives in `sync_state`;
//! each missing step is applied in order and stamps the version it
//! produced, so a database can sit out releases and catch up in one open.

use rusqlite::{params, Connection, OptionalExtension};

use super::{schema, DbError};

const VERSION_KEY: &str = "schema_version";

struct Step {
    version: u32,
    apply: fn(&Connection) -> Result<(), rusqlite::Error>,
}

/// Append-only version history. New schema work gets a new step; existing
/// steps never change once shipped.
const STEPS: &[Step] = &[
    Step {
        version: 1,
        apply: schema::create_mail_store,
    },
    Step {
        version: 2,
        apply: schema::create_dispatch_tables,
    },
];

pub fn migrate(conn: &Connection) -> Result<(), DbError> {
    ensure_version_table(conn)?;

    let stamped = stamped_version(conn)?;
    let latest = STEPS.last().map(|step| step.version).unwrap_or(0);
    if stamped > latest {
        return Err(DbError::Config(format!(
            "database is at schema version {stamped}, this build supports up to {latest}"
        )));
    }

    for step in STEPS.iter().filter(|step| step.version > stamped) {
        (step.apply)(conn)?;
        stamp_version(conn, step.version)?;
    }
    Ok(())
}

/// The version bookkeeping must exist before anything else can be judged
/// present or missing.
fn ensure_version_table(conn: &Connection) -> Result<(), DbError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS sync_state (
            key TEXT PRIMARY KEY,
            value TEXT,
            updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
        );
        "#,
    )?;
    Ok(())
}

pub fn stamped_version(conn: &Connection) -> Result<u32, DbError> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value FROM sync_state WHERE key = ?",
            params![VERSION_KEY],
            |row| row.get(0),
        )
        .optional()?;

    match raw {
        None => Ok(0),
        Some(value) => value
            .parse()
            .map_err(|_| DbError::Config(format!("unreadable schema version '{value}'"))),
    }
}

fn stamp_version(conn: &Connection, version: u32) -> Result<(), DbError> {
    conn.execute(
        r#"
        INSERT INTO sync_state (key, value, updated_at)
        VALUES (?, ?, strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
        ON CONFLICT(key) DO UPDATE SET
            value = excluded.value,
            updated_at = excluded.updated_at
        "#,
        params![VERSION_KEY, version.to_string()],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use rusqlite::Connection;
    use uuid::Uuid;

    use super::{migrate, stamped_version, STEPS};

    fn temp_db_path() -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("esync-migrations-{}.db", Uuid::new_v4()));
        path
    }

    fn table_exists(conn: &Connection, name: &str) -> bool {
        conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
            [name],
            |row| row.get::<_, i64>(0),
        )
        .expect("query sqlite_master")
            > 0
    }

    #[test]
    fn fresh_database_replays_every_step() {
        let db_path = temp_db_path();
        let conn = Connection::open(&db_path).expect("open");

        migrate(&conn).expect("migrate");

        let latest = STEPS.last().expect("history is non-empty").version;
        assert_eq!(stamped_version(&conn).expect("version"), latest);
        assert!(table_exists(&conn, "emails"));
        assert!(table_exists(&conn, "queue_messages"));

        migrate(&conn).expect("second migrate is a no-op");
        assert_eq!(stamped_version(&conn).expect("version"), latest);
        let _ = std::fs::remove_file(db_path);
    }

    #[test]
    fn partially_migrated_database_catches_up() {
        let db_path = temp_db_path();
        let conn = Connection::open(&db_path).expect("open");

        // A database last opened before the dispatch tables existed.
        super::ensure_version_table(&conn).expect("bootstrap");
        (STEPS[0].apply)(&conn).expect("apply v1");
        super::stamp_version(&conn, STEPS[0].version).expect("stamp v1");
        assert!(!table_exists(&conn, "queue_messages"));

        migrate(&conn).expect("migrate");

        assert!(table_exists(&conn, "queue_messages"));
        assert_eq!(
            stamped_version(&conn).expect("version"),
            STEPS.last().expect("history").version
        );
        let _ = std::fs::remove_file(db_path);
    }

    #[test]
    fn refuses_a_database_from_the_future() {
        let db_path = temp_db_path();
        let conn = Connection::open(&db_path).expect("open");

        super::ensure_version_table(&conn).expect("bootstrap");
        super::stamp_version(&conn, 99).expect("stamp");

        let err = migrate(&conn).expect_err("future schema rejected");
        assert!(err.to_string().contains("schema version 99"));
        let _ = std::fs::remove_file(db_path);
    }
}
