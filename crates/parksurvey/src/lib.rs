//! `parksurvey` - record parking-impact interviews and share them across devices
//!
//! Interview records are kept in a local `SQLite` store and can optionally be
//! mirrored to a shared JSON blob addressed by a capability URL. The
//! [`Session`] controller keeps the in-memory dataset, the local store and
//! the shared store converging.

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

pub mod cli;
pub mod config;
pub mod error;
pub mod logging;
pub mod record;
pub mod remote;
pub mod session;
pub mod storage;
pub mod summary;

pub use config::Config;
pub use error::{Error, Result};
pub use logging::init_logging;
pub use record::{CostPeriod, DateRange, Location, PaymentType, Record, TravelMode};
pub use remote::{EndpointPolicy, HttpMirror, RemoteMirror};
pub use session::{Session, SessionMode, SyncDescriptor, SyncStatus};
pub use storage::LocalStore;
pub use summary::Summary;
