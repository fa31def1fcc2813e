//! Core record types for parksurvey.
//!
//! This module defines the interview record, its closed enumerations, and the
//! dataset ordering and filtering helpers shared by every other layer.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Physical site where an interview took place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Location {
    /// The Darmipark garage.
    Darmipark,
    /// Central station car park.
    Hauptbahnhof,
    /// City centre surface parking.
    Stadtmitte,
    /// Exhibition grounds car park.
    Messe,
}

impl Location {
    /// Every location, in display order.
    pub const ALL: [Self; 4] = [
        Self::Darmipark,
        Self::Hauptbahnhof,
        Self::Stadtmitte,
        Self::Messe,
    ];

    /// The wire name of this location.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Darmipark => "Darmipark",
            Self::Hauptbahnhof => "Hauptbahnhof",
            Self::Stadtmitte => "Stadtmitte",
            Self::Messe => "Messe",
        }
    }
}

/// How the respondent travelled before the parking change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TravelMode {
    /// Private car.
    Auto,
    /// Bus, tram or train.
    PublicTransport,
    /// Bicycle.
    Bicycle,
    /// On foot.
    Walking,
    /// Motorcycle or scooter.
    Motorcycle,
    /// Did not make this trip before.
    None,
}

impl TravelMode {
    /// Every travel mode, in display order.
    pub const ALL: [Self; 6] = [
        Self::Auto,
        Self::PublicTransport,
        Self::Bicycle,
        Self::Walking,
        Self::Motorcycle,
        Self::None,
    ];

    /// The wire name of this travel mode.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "AUTO",
            Self::PublicTransport => "PUBLIC_TRANSPORT",
            Self::Bicycle => "BICYCLE",
            Self::Walking => "WALKING",
            Self::Motorcycle => "MOTORCYCLE",
            Self::None => "NONE",
        }
    }
}

/// How the respondent paid for parking before the change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentType {
    /// Single tickets.
    Ticket,
    /// Monthly season pass.
    MonthlyPass,
    /// Paid by the employer.
    Employer,
    /// Resident parking permit.
    ResidentPermit,
    /// Parked for free.
    Free,
    /// Did not park before.
    None,
}

impl PaymentType {
    /// Every payment type, in display order.
    pub const ALL: [Self; 6] = [
        Self::Ticket,
        Self::MonthlyPass,
        Self::Employer,
        Self::ResidentPermit,
        Self::Free,
        Self::None,
    ];

    /// The wire name of this payment type.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ticket => "TICKET",
            Self::MonthlyPass => "MONTHLY_PASS",
            Self::Employer => "EMPLOYER",
            Self::ResidentPermit => "RESIDENT_PERMIT",
            Self::Free => "FREE",
            Self::None => "NONE",
        }
    }
}

/// The period a reported cost refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostPeriod {
    /// Cost per working day.
    Daily,
    /// Cost per week.
    #[default]
    Weekly,
    /// Cost per month.
    Monthly,
}

impl CostPeriod {
    /// Every cost period.
    pub const ALL: [Self; 3] = [Self::Daily, Self::Weekly, Self::Monthly];

    /// The name of this period.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
        }
    }

    /// Normalize an amount reported for this period to a weekly figure.
    ///
    /// Daily amounts cover a five-day working week; monthly amounts are
    /// spread over the year (`x 12 / 52`).
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRecord`] if the amount is negative or not finite.
    pub fn to_weekly(self, amount: f64) -> Result<f64> {
        if !amount.is_finite() || amount < 0.0 {
            return Err(Error::invalid_record(format!(
                "cost must be a non-negative number, got {amount}"
            )));
        }
        Ok(match self {
            Self::Daily => amount * 5.0,
            Self::Weekly => amount,
            Self::Monthly => amount * 12.0 / 52.0,
        })
    }
}

macro_rules! impl_text_conversions {
    ($($ty:ident => $what:literal),* $(,)?) => {$(
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                let wanted = s.trim().replace(['-', ' '], "_");
                $ty::ALL
                    .into_iter()
                    .find(|v| v.as_str().eq_ignore_ascii_case(&wanted))
                    .ok_or_else(|| Error::parse(format!("unknown {}: {s}", $what)))
            }
        }
    )*};
}

impl_text_conversions!(
    Location => "location",
    TravelMode => "travel mode",
    PaymentType => "payment type",
    CostPeriod => "cost period",
);

/// One interview response.
///
/// Records are immutable once created; the only way to change one is to
/// replace the whole dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    /// Unique identifier within a dataset.
    pub id: String,
    /// Where the interview took place.
    pub location: Location,
    /// Travel mode before the change.
    pub previous_travel_mode: TravelMode,
    /// Payment type before the change.
    pub previous_payment_type: PaymentType,
    /// Previous parking cost, normalized to a weekly figure.
    pub previous_weekly_cost: f64,
    /// Whether the respondent now uses park-and-ride.
    pub uses_park_and_ride: bool,
    /// When the interview was captured.
    pub interview_date_time: DateTime<Utc>,
}

impl Record {
    /// Create a record with a freshly generated id.
    ///
    /// `cost` is reported for `period` and normalized to a weekly amount.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRecord`] if the cost is negative or not finite.
    pub fn new(
        location: Location,
        previous_travel_mode: TravelMode,
        previous_payment_type: PaymentType,
        cost: f64,
        period: CostPeriod,
        uses_park_and_ride: bool,
        interview_date_time: DateTime<Utc>,
    ) -> Result<Self> {
        Ok(Self {
            id: Self::generate_id(interview_date_time),
            location,
            previous_travel_mode,
            previous_payment_type,
            previous_weekly_cost: period.to_weekly(cost)?,
            uses_park_and_ride,
            interview_date_time,
        })
    }

    /// Generate a unique record id.
    ///
    /// Mixes the interview time, the wall clock and a process-local counter
    /// through BLAKE3 and keeps the first 16 hex digits.
    #[must_use]
    pub fn generate_id(interview_date_time: DateTime<Utc>) -> String {
        static COUNTER: AtomicU64 = AtomicU64::new(0);

        let mut hasher = blake3::Hasher::new();
        hasher.update(interview_date_time.to_rfc3339().as_bytes());
        hasher.update(
            &Utc::now()
                .timestamp_nanos_opt()
                .unwrap_or_default()
                .to_le_bytes(),
        );
        hasher.update(&COUNTER.fetch_add(1, Ordering::Relaxed).to_le_bytes());
        hasher.update(&std::process::id().to_le_bytes());
        hasher.finalize().to_hex().as_str()[..16].to_string()
    }

    /// Check the record's invariants.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRecord`] for an empty id or a negative or
    /// non-finite weekly cost.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::invalid_record("id must not be empty"));
        }
        if !self.previous_weekly_cost.is_finite() || self.previous_weekly_cost < 0.0 {
            return Err(Error::invalid_record(format!(
                "weekly cost must be non-negative, got {}",
                self.previous_weekly_cost
            )));
        }
        Ok(())
    }
}

/// Sort a dataset by interview time, newest first.
///
/// The sort is stable, so applying it twice changes nothing.
pub fn sort_dataset(records: &mut [Record]) {
    records.sort_by(|a, b| b.interview_date_time.cmp(&a.interview_date_time));
}

/// An inclusive interview-time window; either bound may be open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DateRange {
    /// Earliest interview time to include.
    pub since: Option<DateTime<Utc>>,
    /// Latest interview time to include.
    pub until: Option<DateTime<Utc>>,
}

impl DateRange {
    /// A range that includes everything.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Create a range from optional bounds.
    #[must_use]
    pub fn new(since: Option<DateTime<Utc>>, until: Option<DateTime<Utc>>) -> Self {
        Self { since, until }
    }

    /// Check whether a record falls within the range.
    #[must_use]
    pub fn contains(&self, record: &Record) -> bool {
        let at = record.interview_date_time;
        self.since.map_or(true, |since| at >= since) && self.until.map_or(true, |until| at <= until)
    }

    /// Keep only the records inside the range, preserving order.
    #[must_use]
    pub fn filter<'a>(&self, records: &'a [Record]) -> Vec<&'a Record> {
        records.iter().filter(|r| self.contains(r)).collect()
    }
}
