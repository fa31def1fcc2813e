//! Remote mirror of the dataset.
//!
//! A shared dataset lives as a single JSON array behind a capability URL on
//! a public key-value blob store. Knowing the URL is the only credential.
//! This module defines the [`RemoteMirror`] seam the session controller
//! talks to, the endpoint policy every URL is checked against, and the
//! HTTP implementation.

mod http;

#[cfg(test)]
pub(crate) mod fake;

use std::fmt;

use regex::Regex;

use crate::error::{Error, Result};
use crate::record::Record;

pub use http::HttpMirror;

/// Opaque freshness token (an HTTP entity tag) for a remote state.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FreshnessToken(String);

impl FreshnessToken {
    /// Wrap a raw entity tag.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The raw entity tag.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FreshnessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The full remote dataset together with its freshness token.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    /// Records as stored remotely, in remote order.
    pub records: Vec<Record>,
    /// Entity tag of this state, if the store sent one.
    pub etag: Option<FreshnessToken>,
}

/// Result of a conditional fetch.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    /// The remote state still matches the token (HTTP 304).
    Unchanged,
    /// The remote state changed.
    Changed(Snapshot),
}

/// A freshly allocated shared dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedBin {
    /// The capability URL of the new dataset.
    pub url: String,
    /// Entity tag of the initial state, if the store sent one.
    pub etag: Option<FreshnessToken>,
}

/// Which URLs are acceptable as bin-creation endpoint and capability URLs.
///
/// A capability URL is the configured prefix followed by a non-empty
/// identifier made of ASCII letters, digits, `_` and `-`.
#[derive(Debug, Clone)]
pub struct EndpointPolicy {
    create_url: String,
    prefix: String,
    pattern: Regex,
}

impl EndpointPolicy {
    /// Build a policy from the bin-creation URL and the capability prefix.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigValidation`] if either URL is not http(s).
    pub fn new(create_url: impl Into<String>, prefix: impl Into<String>) -> Result<Self> {
        let create_url = create_url.into();
        let prefix = prefix.into();

        for (name, value) in [("create_url", &create_url), ("capability_prefix", &prefix)] {
            if !(value.starts_with("https://") || value.starts_with("http://")) {
                return Err(Error::ConfigValidation {
                    message: format!("{name} must be an http(s) URL, got '{value}'"),
                });
            }
        }

        let pattern = Regex::new(&format!("^{}[A-Za-z0-9_-]+$", regex::escape(&prefix)))
            .map_err(|e| Error::ConfigValidation {
                message: format!("invalid capability prefix '{prefix}': {e}"),
            })?;

        Ok(Self {
            create_url,
            prefix,
            pattern,
        })
    }

    /// The URL new shared datasets are created at.
    #[must_use]
    pub fn create_url(&self) -> &str {
        &self.create_url
    }

    /// The prefix every capability URL starts with.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Check whether a URL is an acceptable capability URL.
    #[must_use]
    pub fn is_capability(&self, url: &str) -> bool {
        self.pattern.is_match(url)
    }

    /// Reject a URL that is not an acceptable capability URL.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidEndpoint`] if the URL does not match.
    pub fn validate(&self, url: &str) -> Result<()> {
        if self.is_capability(url) {
            Ok(())
        } else {
            Err(Error::invalid_endpoint(url))
        }
    }
}

/// A versioned JSON-array resource shared between devices.
///
/// Every method taking a URL rejects it with [`Error::InvalidEndpoint`]
/// before any network traffic if it is not a capability URL.
#[async_trait::async_trait]
pub trait RemoteMirror: Send + Sync {
    /// Check a capability URL without touching the network.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidEndpoint`] if the URL is not acceptable.
    fn validate_endpoint(&self, url: &str) -> Result<()>;

    /// Allocate a new shared dataset seeded with `initial`.
    ///
    /// # Errors
    ///
    /// Returns a remote error on a non-success status or transport failure,
    /// or [`Error::Parse`] if the store's answer carries no usable URL.
    async fn create_bin(&self, initial: &[Record]) -> Result<CreatedBin>;

    /// Download the whole shared dataset.
    ///
    /// # Errors
    ///
    /// Returns a remote error on a non-success status or transport failure,
    /// or [`Error::Parse`] if the payload is not an array of records.
    async fn fetch_all(&self, url: &str) -> Result<Snapshot>;

    /// Download the shared dataset unless it still matches `token`.
    ///
    /// Without a token this behaves like [`RemoteMirror::fetch_all`].
    ///
    /// # Errors
    ///
    /// As [`RemoteMirror::fetch_all`].
    async fn fetch_if_changed(
        &self,
        url: &str,
        token: Option<&FreshnessToken>,
    ) -> Result<FetchOutcome>;

    /// Append one record to the end of the shared array.
    ///
    /// # Errors
    ///
    /// Returns a remote error on a non-success status or transport failure.
    async fn append_one(&self, url: &str, record: &Record) -> Result<Option<FreshnessToken>>;

    /// Replace the whole shared array.
    ///
    /// # Errors
    ///
    /// Returns a remote error on a non-success status or transport failure.
    async fn overwrite_all(&self, url: &str, records: &[Record]) -> Result<Option<FreshnessToken>>;
}

/// Decode a remote payload into records.
pub(crate) fn parse_records(body: &[u8]) -> Result<Vec<Record>> {
    let value: serde_json::Value = serde_json::from_slice(body)
        .map_err(|e| Error::parse(format!("payload is not JSON: {e}")))?;
    if !value.is_array() {
        return Err(Error::parse("expected a JSON array"));
    }
    serde_json::from_value(value).map_err(|e| Error::parse(format!("malformed record: {e}")))
}
