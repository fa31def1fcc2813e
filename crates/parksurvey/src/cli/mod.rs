//! Command-line interface for parksurvey.
//!
//! This module provides the CLI structure for the `parksurvey` binary.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub use commands::{
    parse_since, parse_until, AddCommand, ConfigCommand, ListCommand, RangeArgs, ShareCommand,
    StatusCommand, SummaryCommand,
};

use crate::logging::Verbosity;

/// parksurvey - Record parking-impact interviews
///
/// Captures interview responses on this device and optionally shares the
/// dataset with other devices through a public JSON blob store.
#[derive(Debug, Parser)]
#[command(name = "parksurvey")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to custom configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Increase verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// The command to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Show the session mode, sync status and record count
    Status(StatusCommand),

    /// Keep records on this device only
    Local,

    /// Create or join a shared store
    #[command(subcommand)]
    Share(ShareCommand),

    /// Leave the current session (local records are kept)
    Disconnect,

    /// Record one interview
    Add(AddCommand),

    /// List recorded interviews, newest first
    List(ListCommand),

    /// Aggregate recorded interviews
    Summary(SummaryCommand),

    /// Delete every record (also from the shared store)
    Clear,

    /// Replace all records with a JSON array from a file
    Import {
        /// File to read
        file: PathBuf,
    },

    /// Write all records as a JSON array to a file
    Export {
        /// File to write
        file: PathBuf,
    },

    /// Reconcile with the shared store now
    Sync,

    /// Poll the shared store and print changes until interrupted
    Watch,

    /// View or check configuration
    #[command(subcommand)]
    Config(ConfigCommand),
}

impl Cli {
    /// Get the verbosity level based on flags.
    #[must_use]
    pub fn verbosity(&self) -> Verbosity {
        Verbosity::from_flags(self.verbose, self.quiet)
    }
}
