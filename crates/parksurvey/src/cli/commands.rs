//! CLI command definitions.
//!
//! This module defines the structure of all CLI subcommands.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use clap::{Args, Subcommand};

use crate::record::{CostPeriod, DateRange, Location, PaymentType, TravelMode};

/// Status command arguments.
#[derive(Debug, Args)]
pub struct StatusCommand {
    /// Output as JSON
    #[arg(short, long)]
    pub json: bool,
}

/// Shared store commands.
#[derive(Debug, Subcommand)]
pub enum ShareCommand {
    /// Create a new shared store seeded with the local records
    Create,

    /// Join an existing shared store, replacing local records
    Join {
        /// Capability URL of the shared store
        url: String,

        /// Replace local records without asking
        #[arg(short, long)]
        yes: bool,
    },
}

/// Add command arguments.
#[derive(Debug, Args)]
pub struct AddCommand {
    /// Where the interview took place
    #[arg(short, long)]
    pub location: Location,

    /// Previous travel mode (e.g. auto, public_transport, none)
    #[arg(short = 'm', long)]
    pub travel_mode: TravelMode,

    /// Previous payment type (e.g. ticket, monthly_pass, none)
    #[arg(short, long)]
    pub payment: PaymentType,

    /// Previous parking cost for the given period
    #[arg(long, default_value = "0")]
    pub cost: f64,

    /// Period the cost refers to
    #[arg(long, default_value = "weekly")]
    pub period: CostPeriod,

    /// The respondent now uses park-and-ride
    #[arg(long)]
    pub park_and_ride: bool,

    /// Interview time (RFC 3339 or YYYY-MM-DD); defaults to now
    #[arg(long, value_parser = parse_since)]
    pub at: Option<DateTime<Utc>>,
}

/// Interview-time window arguments.
#[derive(Debug, Args)]
pub struct RangeArgs {
    /// Only interviews at or after this time (RFC 3339 or YYYY-MM-DD)
    #[arg(long, value_parser = parse_since)]
    pub since: Option<DateTime<Utc>>,

    /// Only interviews at or before this time (a bare date includes the whole day)
    #[arg(long, value_parser = parse_until)]
    pub until: Option<DateTime<Utc>>,
}

impl RangeArgs {
    /// The selected window.
    #[must_use]
    pub fn range(&self) -> DateRange {
        DateRange::new(self.since, self.until)
    }
}

/// List command arguments.
#[derive(Debug, Args)]
pub struct ListCommand {
    /// Interview-time window
    #[command(flatten)]
    pub range: RangeArgs,

    /// Output as JSON
    #[arg(short, long)]
    pub json: bool,
}

/// Summary command arguments.
#[derive(Debug, Args)]
pub struct SummaryCommand {
    /// Interview-time window
    #[command(flatten)]
    pub range: RangeArgs,

    /// Output as JSON
    #[arg(short, long)]
    pub json: bool,
}

/// Configuration commands.
#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Show configuration file path
    Path,

    /// Validate configuration file
    Validate,
}

fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()
}

fn parse_instant(s: &str, day_time: NaiveTime) -> Result<DateTime<Utc>, String> {
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Ok(t.with_timezone(&Utc));
    }
    parse_date(s)
        .map(|d| d.and_time(day_time).and_utc())
        .ok_or_else(|| format!("expected RFC 3339 time or YYYY-MM-DD, got '{s}'"))
}

/// Parse a lower time bound; a bare date means its first instant.
///
/// # Errors
///
/// Returns a message if the text is neither RFC 3339 nor a date.
pub fn parse_since(s: &str) -> Result<DateTime<Utc>, String> {
    parse_instant(s, NaiveTime::MIN)
}

/// Parse an upper time bound; a bare date means its last second.
///
/// # Errors
///
/// Returns a message if the text is neither RFC 3339 nor a date.
pub fn parse_until(s: &str) -> Result<DateTime<Utc>, String> {
    let end_of_day = NaiveTime::from_hms_opt(23, 59, 59).unwrap_or(NaiveTime::MIN);
    parse_instant(s, end_of_day)
}
