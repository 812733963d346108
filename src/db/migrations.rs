use rusqlite::{params, Connection, OptionalExtension};

use crate::db::{column_exists, ensure_column, table_exists, HISTORY_TABLE};
use crate::errors::{BridgeError, Result};

pub const CURRENT_VERSION: i64 = 5;

struct Migration {
    version: i64,
    name: &'static str,
    apply: fn(&Connection) -> rusqlite::Result<()>,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "create_history",
        apply: create_history,
    },
    Migration {
        version: 2,
        name: "client_type",
        apply: add_client_type,
    },
    Migration {
        version: 3,
        name: "status_tracking",
        apply: add_status_tracking,
    },
    Migration {
        version: 4,
        name: "transfer_stats",
        apply: add_transfer_stats,
    },
    Migration {
        version: 5,
        name: "category",
        apply: add_category,
    },
];

fn create_history(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS download_history (
            hash TEXT PRIMARY KEY,
            filename TEXT NOT NULL,
            size INTEGER,
            started_at TEXT NOT NULL,
            completed_at TEXT,
            deleted_at TEXT,
            username TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_history_started_at ON download_history(started_at);",
    )
}

fn add_client_type(conn: &Connection) -> rusqlite::Result<()> {
    ensure_column(
        conn,
        HISTORY_TABLE,
        "client_type",
        "TEXT NOT NULL DEFAULT 'amule'",
    )?;
    Ok(())
}

fn add_status_tracking(conn: &Connection) -> rusqlite::Result<()> {
    let added = ensure_column(
        conn,
        HISTORY_TABLE,
        "status",
        "TEXT NOT NULL DEFAULT 'downloading'",
    )?;
    ensure_column(conn, HISTORY_TABLE, "last_seen_at", "TEXT")?;
    if added {
        // Rows written before status existed carry their state in the timestamps.
        conn.execute(
            "UPDATE download_history SET status = CASE
                WHEN deleted_at IS NOT NULL THEN 'deleted'
                WHEN completed_at IS NOT NULL THEN 'completed'
                ELSE 'downloading'
             END",
            [],
        )?;
    }
    conn.execute_batch(
        "CREATE INDEX IF NOT EXISTS idx_history_status ON download_history(status);",
    )
}

fn add_transfer_stats(conn: &Connection) -> rusqlite::Result<()> {
    ensure_column(conn, HISTORY_TABLE, "downloaded", "INTEGER NOT NULL DEFAULT 0")?;
    ensure_column(conn, HISTORY_TABLE, "uploaded", "INTEGER NOT NULL DEFAULT 0")?;
    ensure_column(conn, HISTORY_TABLE, "ratio", "REAL NOT NULL DEFAULT 0")?;
    ensure_column(conn, HISTORY_TABLE, "tracker_domain", "TEXT")?;
    Ok(())
}

fn add_category(conn: &Connection) -> rusqlite::Result<()> {
    ensure_column(conn, HISTORY_TABLE, "category", "TEXT")?;
    conn.execute_batch(
        "CREATE INDEX IF NOT EXISTS idx_history_completed_at ON download_history(completed_at);",
    )
}

fn ensure_version_table(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            version INTEGER NOT NULL,
            updated_at TEXT NOT NULL
        );",
    )
}

fn stored_version(conn: &Connection) -> rusqlite::Result<Option<i64>> {
    conn.query_row("SELECT version FROM schema_version WHERE id = 1", [], |row| {
        row.get(0)
    })
    .optional()
}

fn write_version(conn: &Connection, version: i64) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO schema_version (id, version, updated_at) VALUES (1, ?1, ?2)
         ON CONFLICT(id) DO UPDATE SET version = excluded.version, updated_at = excluded.updated_at",
        params![version, chrono::Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

/// Guesses the applied version of a store created before version tracking
/// existed, from which tables and columns are present.
fn infer_version(conn: &Connection) -> rusqlite::Result<i64> {
    if !table_exists(conn, HISTORY_TABLE)? {
        return Ok(0);
    }
    let probes = [
        (5, "category"),
        (4, "tracker_domain"),
        (3, "status"),
        (2, "client_type"),
    ];
    for (version, column) in probes {
        if column_exists(conn, HISTORY_TABLE, column)? {
            return Ok(version);
        }
    }
    Ok(1)
}

pub fn current_version(conn: &Connection) -> Result<Option<i64>> {
    if !table_exists(conn, "schema_version")? {
        return Ok(None);
    }
    Ok(stored_version(conn)?)
}

pub(crate) fn migrate(conn: &mut Connection) -> Result<i64> {
    ensure_version_table(conn).map_err(|source| BridgeError::Migration { version: 0, source })?;

    let mut version = match stored_version(conn)? {
        Some(version) => version,
        None => {
            let inferred =
                infer_version(conn).map_err(|source| BridgeError::Migration { version: 0, source })?;
            if inferred > 0 {
                tracing::info!("inferred legacy history schema version={}", inferred);
            }
            write_version(conn, inferred)
                .map_err(|source| BridgeError::Migration { version: inferred, source })?;
            inferred
        }
    };

    if version > CURRENT_VERSION {
        return Err(BridgeError::Config(format!(
            "history schema version {} is newer than supported {}",
            version, CURRENT_VERSION
        )));
    }

    let from = version;
    for migration in MIGRATIONS.iter().filter(|m| m.version > from) {
        let step = |conn: &mut Connection| -> rusqlite::Result<()> {
            let tx = conn.transaction()?;
            (migration.apply)(&tx)?;
            write_version(&tx, migration.version)?;
            tx.commit()
        };
        step(conn).map_err(|source| {
            tracing::error!(
                "history migration failed version={} name={} error={}",
                migration.version,
                migration.name,
                source
            );
            BridgeError::Migration {
                version: migration.version,
                source,
            }
        })?;
        tracing::info!(
            "applied history migration version={} name={}",
            migration.version,
            migration.name
        );
        version = migration.version;
    }

    Ok(version)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    fn column_names(conn: &Connection) -> Vec<String> {
        let mut stmt = conn
            .prepare("PRAGMA table_info(download_history)")
            .expect("prepare table_info");
        let names = stmt
            .query_map([], |row| row.get::<_, String>(1))
            .expect("query table_info")
            .collect::<rusqlite::Result<Vec<_>>>()
            .expect("collect columns");
        names
    }

    #[test]
    fn fresh_store_reaches_current_version() {
        let db = Database::open_in_memory().expect("open db");
        let version = db.run_migrations().expect("migrate");
        assert_eq!(version, CURRENT_VERSION);

        let conn = db.connection().expect("conn");
        assert_eq!(current_version(&conn).expect("version"), Some(CURRENT_VERSION));
        let columns = column_names(&conn);
        for expected in [
            "hash",
            "filename",
            "size",
            "started_at",
            "completed_at",
            "deleted_at",
            "username",
            "client_type",
            "status",
            "last_seen_at",
            "downloaded",
            "uploaded",
            "ratio",
            "tracker_domain",
            "category",
        ] {
            assert!(columns.iter().any(|c| c == expected), "missing column {expected}");
        }
    }

    #[test]
    fn second_initialization_leaves_version_and_rows_unchanged() {
        let db = Database::open_in_memory().expect("open db");
        db.run_migrations().expect("first migrate");
        {
            let conn = db.connection().expect("conn");
            conn.execute(
                "INSERT INTO download_history (hash, filename, size, started_at, status, downloaded)
                 VALUES ('abc', 'a.iso', 4096, '2026-01-01T00:00:00.000Z', 'missing', 77)",
                [],
            )
            .expect("seed row");
        }

        let version = db.run_migrations().expect("second migrate");
        assert_eq!(version, CURRENT_VERSION);

        let conn = db.connection().expect("conn");
        let (status, downloaded, filename): (String, i64, String) = conn
            .query_row(
                "SELECT status, downloaded, filename FROM download_history WHERE hash = 'abc'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .expect("row survives");
        assert_eq!(status, "missing");
        assert_eq!(downloaded, 77);
        assert_eq!(filename, "a.iso");
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_version", [], |row| row.get(0))
            .expect("count versions");
        assert_eq!(count, 1);
    }

    #[test]
    fn legacy_store_without_version_row_is_inferred_and_upgraded() {
        let db = Database::open_in_memory().expect("open db");
        {
            let conn = db.connection().expect("conn");
            conn.execute_batch(
                "CREATE TABLE download_history (
                    hash TEXT PRIMARY KEY,
                    filename TEXT NOT NULL,
                    size INTEGER,
                    started_at TEXT NOT NULL,
                    completed_at TEXT,
                    deleted_at TEXT,
                    username TEXT,
                    client_type TEXT NOT NULL DEFAULT 'amule'
                );
                INSERT INTO download_history (hash, filename, started_at, completed_at)
                    VALUES ('done', 'done.bin', '2026-01-01T00:00:00.000Z', '2026-01-02T00:00:00.000Z');
                INSERT INTO download_history (hash, filename, started_at, deleted_at)
                    VALUES ('gone', 'gone.bin', '2026-01-01T00:00:00.000Z', '2026-01-03T00:00:00.000Z');
                INSERT INTO download_history (hash, filename, started_at)
                    VALUES ('live', 'live.bin', '2026-01-01T00:00:00.000Z');",
            )
            .expect("seed legacy schema");
            assert_eq!(infer_version(&conn).expect("infer"), 2);
        }

        assert_eq!(db.run_migrations().expect("migrate"), CURRENT_VERSION);

        let conn = db.connection().expect("conn");
        let status_of = |hash: &str| -> String {
            conn.query_row(
                "SELECT status FROM download_history WHERE hash = ?1",
                [hash],
                |row| row.get(0),
            )
            .expect("status")
        };
        assert_eq!(status_of("done"), "completed");
        assert_eq!(status_of("gone"), "deleted");
        assert_eq!(status_of("live"), "downloading");
    }

    #[test]
    fn failed_step_aborts_with_migration_error() {
        let db = Database::open_in_memory().expect("open db");
        {
            let conn = db.connection().expect("conn");
            ensure_version_table(&conn).expect("version table");
            // Claims version 1 although the history table was never created.
            write_version(&conn, 1).expect("write version");
        }

        match db.run_migrations() {
            Err(BridgeError::Migration { version, .. }) => assert_eq!(version, 2),
            other => panic!("expected migration error, got {:?}", other.map(|_| ())),
        }

        let conn = db.connection().expect("conn");
        assert_eq!(current_version(&conn).expect("version"), Some(1));
    }

    #[test]
    fn newer_schema_is_rejected() {
        let db = Database::open_in_memory().expect("open db");
        {
            let conn = db.connection().expect("conn");
            ensure_version_table(&conn).expect("version table");
            write_version(&conn, CURRENT_VERSION + 1).expect("write version");
        }
        assert!(matches!(db.run_migrations(), Err(BridgeError::Config(_))));
    }
}
