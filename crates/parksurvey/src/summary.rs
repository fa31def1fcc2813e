//! Aggregates over the dataset for reporting.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::record::{DateRange, Location, PaymentType, Record, TravelMode};

/// Aggregated figures for a filtered dataset.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    /// Number of interviews in range.
    pub total: usize,
    /// Interviews per location, every location listed.
    pub by_location: BTreeMap<Location, usize>,
    /// Interviews per previous travel mode.
    pub by_travel_mode: BTreeMap<TravelMode, usize>,
    /// Interviews per previous payment type.
    pub by_payment_type: BTreeMap<PaymentType, usize>,
    /// Respondents now using park-and-ride.
    pub park_and_ride: usize,
    /// Share of park-and-ride users, 0 for an empty dataset.
    pub park_and_ride_share: f64,
    /// Sum of previous weekly costs.
    pub total_weekly_cost: f64,
    /// Mean previous weekly cost, if there is at least one interview.
    pub average_weekly_cost: Option<f64>,
    /// Earliest interview in range.
    pub first_interview: Option<DateTime<Utc>>,
    /// Latest interview in range.
    pub last_interview: Option<DateTime<Utc>>,
}

fn zeroed<K: Ord + Copy>(keys: &[K]) -> BTreeMap<K, usize> {
    keys.iter().map(|k| (*k, 0)).collect()
}

impl Summary {
    /// Aggregate the records that fall inside `range`.
    #[must_use]
    pub fn from_records(records: &[Record], range: DateRange) -> Self {
        let mut summary = Self {
            total: 0,
            by_location: zeroed(&Location::ALL),
            by_travel_mode: zeroed(&TravelMode::ALL),
            by_payment_type: zeroed(&PaymentType::ALL),
            park_and_ride: 0,
            park_and_ride_share: 0.0,
            total_weekly_cost: 0.0,
            average_weekly_cost: None,
            first_interview: None,
            last_interview: None,
        };

        for record in range.filter(records) {
            summary.total += 1;
            *summary.by_location.entry(record.location).or_default() += 1;
            *summary
                .by_travel_mode
                .entry(record.previous_travel_mode)
                .or_default() += 1;
            *summary
                .by_payment_type
                .entry(record.previous_payment_type)
                .or_default() += 1;
            if record.uses_park_and_ride {
                summary.park_and_ride += 1;
            }
            summary.total_weekly_cost += record.previous_weekly_cost;

            let at = record.interview_date_time;
            summary.first_interview = Some(summary.first_interview.map_or(at, |t| t.min(at)));
            summary.last_interview = Some(summary.last_interview.map_or(at, |t| t.max(at)));
        }

        if summary.total > 0 {
            #[allow(clippy::cast_precision_loss)]
            let total = summary.total as f64;
            #[allow(clippy::cast_precision_loss)]
            let park_and_ride = summary.park_and_ride as f64;
            summary.park_and_ride_share = park_and_ride / total;
            summary.average_weekly_cost = Some(summary.total_weekly_cost / total);
        }

        summary
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Interviews: {}", self.total)?;
        if let (Some(first), Some(last)) = (self.first_interview, self.last_interview) {
            writeln!(
                f,
                "Period:     {} .. {}",
                first.format("%Y-%m-%d %H:%M"),
                last.format("%Y-%m-%d %H:%M")
            )?;
        }
        writeln!(
            f,
            "Park+Ride:  {} ({:.1}%)",
            self.park_and_ride,
            self.park_and_ride_share * 100.0
        )?;
        match self.average_weekly_cost {
            Some(avg) => writeln!(
                f,
                "Weekly cost: {:.2} average, {:.2} total",
                avg, self.total_weekly_cost
            )?,
            None => writeln!(f, "Weekly cost: -")?,
        }

        writeln!(f, "\nBy location:")?;
        for (location, count) in &self.by_location {
            writeln!(f, "  {location:<16} {count}")?;
        }
        writeln!(f, "\nBy previous travel mode:")?;
        for (mode, count) in &self.by_travel_mode {
            writeln!(f, "  {mode:<16} {count}")?;
        }
        writeln!(f, "\nBy previous payment type:")?;
        for (payment, count) in &self.by_payment_type {
            writeln!(f, "  {payment:<16} {count}")?;
        }
        Ok(())
    }
}
