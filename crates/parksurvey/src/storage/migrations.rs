//! Schema versioning for the local store.
//!
//! The base tables come from [`SCHEMA_STATEMENTS`]; later changes are listed
//! in [`MIGRATIONS`] and applied in order, each in its own transaction, with
//! the reached version recorded in the `metadata` table.

use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, info};

use crate::error::{Error, Result};

use super::schema::SCHEMA_STATEMENTS;

/// Key of the schema version row in `metadata`.
const VERSION_KEY: &str = "schema_version";

/// One step in the schema history.
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    /// Version the database reaches after this step.
    pub version: i32,
    /// Short human-readable description, logged when applied.
    pub description: &'static str,
    /// Statements run inside the step's transaction.
    pub statements: &'static [&'static str],
}

/// Every migration, in ascending version order.
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "base schema",
        statements: &[],
    },
    Migration {
        version: 2,
        description: "drop pending marks of records that no longer exist",
        statements: &["DELETE FROM pending_appends WHERE id NOT IN (SELECT id FROM records)"],
    },
];

/// The version a fully migrated database carries.
#[must_use]
pub fn current_version() -> i32 {
    MIGRATIONS.last().map_or(0, |m| m.version)
}

/// Create the base tables and bring the schema up to [`current_version`].
///
/// # Errors
///
/// Returns [`Error::DatabaseMigration`] if the stored version is unreadable
/// or newer than this build knows, and a storage error if any statement
/// fails.
pub fn initialize_schema(conn: &mut Connection) -> Result<()> {
    for statement in SCHEMA_STATEMENTS {
        conn.execute_batch(statement)?;
    }

    let stored = stored_version(conn)?;
    let target = current_version();
    if stored > target {
        return Err(Error::DatabaseMigration {
            message: format!("database schema v{stored} is newer than supported v{target}"),
        });
    }

    for migration in MIGRATIONS.iter().filter(|m| m.version > stored) {
        apply(conn, migration)?;
    }
    debug!(version = target, "Local store schema ready");
    Ok(())
}

fn apply(conn: &mut Connection, migration: &Migration) -> Result<()> {
    let tx = conn.transaction()?;
    for statement in migration.statements {
        tx.execute_batch(statement)
            .map_err(|e| Error::DatabaseMigration {
                message: format!("v{} ({}): {e}", migration.version, migration.description),
            })?;
    }
    write_version(&tx, migration.version)?;
    tx.commit()?;
    info!(
        version = migration.version,
        "Applied migration: {}", migration.description
    );
    Ok(())
}

/// The recorded schema version; 0 for a fresh database.
fn stored_version(conn: &Connection) -> Result<i32> {
    let value: Option<String> = conn
        .query_row(
            "SELECT value FROM metadata WHERE key = ?1",
            [VERSION_KEY],
            |row| row.get(0),
        )
        .optional()?;

    value.map_or(Ok(0), |v| {
        v.parse().map_err(|_| Error::DatabaseMigration {
            message: format!("invalid schema version: {v}"),
        })
    })
}

fn write_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute(
        "INSERT INTO metadata (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        (VERSION_KEY, version.to_string()),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory() -> Connection {
        Connection::open_in_memory().unwrap()
    }

    fn table_exists(conn: &Connection, table: &str) -> bool {
        conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
            [table],
            |row| row.get::<_, i32>(0),
        )
        .unwrap()
            == 1
    }

    #[test]
    fn test_fresh_database_gets_every_table() {
        let mut conn = memory();
        initialize_schema(&mut conn).unwrap();

        for table in ["records", "pending_appends", "preferences", "metadata"] {
            assert!(table_exists(&conn, table), "missing table {table}");
        }
        assert_eq!(stored_version(&conn).unwrap(), current_version());
    }

    #[test]
    fn test_reinitializing_is_harmless() {
        let mut conn = memory();
        initialize_schema(&mut conn).unwrap();
        conn.execute(
            "INSERT INTO pending_appends (id) VALUES ('kept-until-migration')",
            [],
        )
        .unwrap();

        initialize_schema(&mut conn).unwrap();

        // Already at the current version, so the cleanup step must not rerun.
        let pending: i32 = conn
            .query_row("SELECT COUNT(*) FROM pending_appends", [], |row| row.get(0))
            .unwrap();
        assert_eq!(pending, 1);
    }

    #[test]
    fn test_migrations_are_ascending() {
        assert!(MIGRATIONS.windows(2).all(|w| w[0].version < w[1].version));
        assert_eq!(MIGRATIONS[0].version, 1);
    }

    #[test]
    fn test_v1_database_drops_orphaned_pending_marks() {
        let mut conn = memory();
        for statement in SCHEMA_STATEMENTS {
            conn.execute_batch(statement).unwrap();
        }
        write_version(&conn, 1).unwrap();
        conn.execute("INSERT INTO pending_appends (id) VALUES ('ghost')", [])
            .unwrap();

        initialize_schema(&mut conn).unwrap();

        let pending: i32 = conn
            .query_row("SELECT COUNT(*) FROM pending_appends", [], |row| row.get(0))
            .unwrap();
        assert_eq!(pending, 0);
        assert_eq!(stored_version(&conn).unwrap(), 2);
    }

    #[test]
    fn test_newer_database_is_refused() {
        let mut conn = memory();
        initialize_schema(&mut conn).unwrap();
        write_version(&conn, current_version() + 1).unwrap();

        let err = initialize_schema(&mut conn).unwrap_err();
        assert!(err.to_string().contains("newer than supported"));
    }

    #[test]
    fn test_garbage_version_is_reported() {
        let mut conn = memory();
        initialize_schema(&mut conn).unwrap();
        conn.execute(
            "UPDATE metadata SET value = 'two' WHERE key = ?1",
            [VERSION_KEY],
        )
        .unwrap();

        let err = initialize_schema(&mut conn).unwrap_err();
        assert!(err.to_string().contains("invalid schema version: two"));
    }

    #[test]
    fn test_interview_time_index_created() {
        let mut conn = memory();
        initialize_schema(&mut conn).unwrap();

        let index: Option<String> = conn
            .query_row(
                "SELECT name FROM sqlite_master WHERE type='index' AND name LIKE '%interview_time%'",
                [],
                |row| row.get(0),
            )
            .optional()
            .unwrap();
        assert!(index.is_some());
    }
}
