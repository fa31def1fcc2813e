//! Local store for parksurvey.
//!
//! This module provides `SQLite`-based durable storage for the interview
//! dataset on the current device, together with the persisted session
//! preferences and the list of records not yet mirrored to a shared store.

pub mod migrations;
pub mod schema;

use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Statement};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::record::Record;

const INSERT_RECORD: &str = r"
INSERT INTO records (
    id, location, previous_travel_mode, previous_payment_type,
    previous_weekly_cost, uses_park_and_ride, interview_date_time
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
";

const UPSERT_RECORD: &str = r"
INSERT OR REPLACE INTO records (
    id, location, previous_travel_mode, previous_payment_type,
    previous_weekly_cost, uses_park_and_ride, interview_date_time
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
";

const SELECT_RECORD_COLUMNS: &str = r"
SELECT id, location, previous_travel_mode, previous_payment_type,
       previous_weekly_cost, uses_park_and_ride, interview_date_time
FROM records
";

/// A persisted session preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Preference {
    /// The session mode chosen last (`local` or `shared`).
    SessionMode,
    /// The capability URL of the joined shared store.
    RemoteUrl,
    /// The freshness token of the last remote state seen.
    ETag,
    /// Set when a clear or bulk replace has not reached the shared store.
    PendingOverwrite,
}

impl Preference {
    /// The key this preference is stored under.
    #[must_use]
    pub fn key(self) -> &'static str {
        match self {
            Self::SessionMode => "session_mode",
            Self::RemoteUrl => "remote_url",
            Self::ETag => "etag",
            Self::PendingOverwrite => "pending_overwrite",
        }
    }
}

/// Durable, keyed storage for the dataset.
///
/// Records are keyed by their id. Reads return records in no particular
/// order; callers sort.
#[derive(Debug)]
pub struct LocalStore {
    /// Path to the database file.
    path: PathBuf,
    /// Database connection.
    conn: Connection,
}

impl LocalStore {
    /// Open or create a store at the given path.
    ///
    /// Creates the parent directories and database file if they don't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or schema initialization fails.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|source| Error::DirectoryCreate {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }

        debug!("Opening local store at {}", path.display());
        let mut conn = Connection::open(&path).map_err(|source| Error::DatabaseOpen {
            path: path.clone(),
            source,
        })?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        migrations::initialize_schema(&mut conn)?;

        info!("Local store opened at {}", path.display());
        Ok(Self { path, conn })
    }

    /// Create an in-memory store for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the in-memory database cannot be created.
    pub fn open_in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory().map_err(|source| Error::DatabaseOpen {
            path: PathBuf::from(":memory:"),
            source,
        })?;

        migrations::initialize_schema(&mut conn)?;

        Ok(Self {
            path: PathBuf::from(":memory:"),
            conn,
        })
    }

    /// Get the path to the database file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Insert one record keyed by its id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateKey`] if a record with the same id exists,
    /// or a storage error if the database operation fails.
    pub fn add(&self, record: &Record) -> Result<()> {
        let mut stmt = self.conn.prepare_cached(INSERT_RECORD)?;
        match insert_record(&mut stmt, record) {
            Ok(()) => {
                debug!("Stored record {}", record.id);
                Ok(())
            }
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == ErrorCode::ConstraintViolation =>
            {
                Err(Error::DuplicateKey {
                    id: record.id.clone(),
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Get a record by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn get(&self, id: &str) -> Result<Option<Record>> {
        let sql = format!("{SELECT_RECORD_COLUMNS} WHERE id = ?1");
        let record = self
            .conn
            .query_row(&sql, [id], row_to_record)
            .optional()?;
        Ok(record)
    }

    /// Get every stored record, in no particular order.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails or a stored row
    /// cannot be decoded.
    pub fn get_all(&self) -> Result<Vec<Record>> {
        let mut stmt = self.conn.prepare(SELECT_RECORD_COLUMNS)?;
        let records = stmt
            .query_map([], row_to_record)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Count stored records.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn count(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    /// Remove every record.
    ///
    /// Returns the number of records removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn clear(&self) -> Result<usize> {
        let tx = self.conn.unchecked_transaction()?;
        let removed = tx.execute("DELETE FROM records", [])?;
        tx.execute("DELETE FROM pending_appends", [])?;
        tx.commit()?;

        info!("Cleared {} records from local store", removed);
        Ok(removed)
    }

    /// Replace the whole dataset with `records`.
    ///
    /// The clear always takes effect. A repeated id keeps the last record
    /// written; individual inserts that fail are logged and skipped.
    /// Returns the number of records stored afterwards.
    ///
    /// # Errors
    ///
    /// Returns an error if the clear or the commit fails.
    pub fn replace_all(&self, records: &[Record]) -> Result<usize> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute("DELETE FROM records", [])?;
        tx.execute("DELETE FROM pending_appends", [])?;

        {
            let mut stmt = tx.prepare(UPSERT_RECORD)?;
            for record in records {
                if let Err(e) = insert_record(&mut stmt, record) {
                    warn!("Skipping record {} during bulk load: {}", record.id, e);
                }
            }
        }
        tx.commit()?;

        let stored = self.count()?;
        info!(
            "Replaced local dataset: {} of {} records stored",
            stored,
            records.len()
        );
        Ok(stored)
    }

    /// Mark a stored record as not yet mirrored to the shared store.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn mark_pending(&self, id: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO pending_appends (id) VALUES (?1)",
            [id],
        )?;
        Ok(())
    }

    /// Clear the not-yet-mirrored mark of a record.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn clear_pending(&self, id: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM pending_appends WHERE id = ?1", [id])?;
        Ok(())
    }

    /// Clear every not-yet-mirrored mark.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn clear_all_pending(&self) -> Result<()> {
        self.conn.execute("DELETE FROM pending_appends", [])?;
        Ok(())
    }

    /// Get the records still waiting to be mirrored, oldest mark first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn pending_records(&self) -> Result<Vec<Record>> {
        let mut stmt = self.conn.prepare(
            r"
            SELECT r.id, r.location, r.previous_travel_mode, r.previous_payment_type,
                   r.previous_weekly_cost, r.uses_park_and_ride, r.interview_date_time
            FROM pending_appends p JOIN records r ON r.id = p.id
            ORDER BY p.queued_at ASC, p.rowid ASC
            ",
        )?;
        let records = stmt
            .query_map([], row_to_record)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Read a persisted preference.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn preference(&self, pref: Preference) -> Result<Option<String>> {
        let value = self
            .conn
            .query_row(
                "SELECT value FROM preferences WHERE key = ?1",
                [pref.key()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    /// Persist a preference.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn set_preference(&self, pref: Preference, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO preferences (key, value) VALUES (?1, ?2)",
            (pref.key(), value),
        )?;
        Ok(())
    }

    /// Remove a persisted preference.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn remove_preference(&self, pref: Preference) -> Result<()> {
        self.conn
            .execute("DELETE FROM preferences WHERE key = ?1", [pref.key()])?;
        Ok(())
    }
}

fn insert_record(stmt: &mut Statement<'_>, record: &Record) -> rusqlite::Result<()> {
    stmt.execute(params![
        record.id,
        record.location.as_str(),
        record.previous_travel_mode.as_str(),
        record.previous_payment_type.as_str(),
        record.previous_weekly_cost,
        record.uses_park_and_ride,
        record
            .interview_date_time
            .to_rfc3339_opts(SecondsFormat::AutoSi, true),
    ])?;
    Ok(())
}

fn parse_column<T>(idx: usize, value: &str) -> rusqlite::Result<T>
where
    T: FromStr<Err = Error>,
{
    value
        .parse()
        .map_err(|e: Error| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Convert a database row to a Record.
fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<Record> {
    let location: String = row.get(1)?;
    let travel_mode: String = row.get(2)?;
    let payment_type: String = row.get(3)?;
    let when: String = row.get(6)?;

    let interview_date_time = DateTime::parse_from_rfc3339(&when)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(6, Type::Text, Box::new(e)))?;

    Ok(Record {
        id: row.get(0)?,
        location: parse_column(1, &location)?,
        previous_travel_mode: parse_column(2, &travel_mode)?,
        previous_payment_type: parse_column(3, &payment_type)?,
        previous_weekly_cost: row.get(4)?,
        uses_park_and_ride: row.get(5)?,
        interview_date_time,
    })
}
