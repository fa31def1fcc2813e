//! `SQLite` schema definitions for parksurvey.
//!
//! This module contains the SQL statements for creating and managing
//! the local store schema.

/// SQL statement to create the records table.
pub const CREATE_RECORDS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS records (
    id TEXT PRIMARY KEY NOT NULL,
    location TEXT NOT NULL,
    previous_travel_mode TEXT NOT NULL,
    previous_payment_type TEXT NOT NULL,
    previous_weekly_cost REAL NOT NULL,
    uses_park_and_ride INTEGER NOT NULL,
    interview_date_time TEXT NOT NULL
)
";

/// SQL statement to create an index on interview time for ordered reads.
pub const CREATE_INTERVIEW_TIME_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_records_interview_time ON records(interview_date_time DESC)
";

/// SQL statement to create the table of records not yet mirrored remotely.
pub const CREATE_PENDING_APPENDS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS pending_appends (
    id TEXT PRIMARY KEY NOT NULL,
    queued_at TEXT NOT NULL DEFAULT (datetime('now'))
)
";

/// SQL statement to create the persisted preferences table.
pub const CREATE_PREFERENCES_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS preferences (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
";

/// SQL statement to create the metadata table for storing key-value pairs.
pub const CREATE_METADATA_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS metadata (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
";

/// All schema creation statements in order.
pub const SCHEMA_STATEMENTS: &[&str] = &[
    CREATE_RECORDS_TABLE,
    CREATE_INTERVIEW_TIME_INDEX,
    CREATE_PENDING_APPENDS_TABLE,
    CREATE_PREFERENCES_TABLE,
    CREATE_METADATA_TABLE,
];
