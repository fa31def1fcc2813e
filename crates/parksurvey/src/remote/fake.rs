//! In-memory remote mirror for tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tokio::sync::Notify;

use super::{CreatedBin, EndpointPolicy, FetchOutcome, FreshnessToken, RemoteMirror, Snapshot};
use crate::error::{Error, Result};
use crate::record::Record;

pub(crate) const CREATE_URL: &str = "https://blob.test/api/jsonBlob";
pub(crate) const PREFIX: &str = "https://blob.test/api/jsonBlob/";

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Calls {
    pub create: usize,
    pub fetch: usize,
    pub append: usize,
    pub overwrite: usize,
}

#[derive(Debug, Default)]
struct Bin {
    records: Vec<Record>,
    version: u64,
}

impl Bin {
    fn etag(&self) -> FreshnessToken {
        FreshnessToken::new(format!("\"v{}\"", self.version))
    }
}

#[derive(Debug, Default)]
struct State {
    bins: HashMap<String, Bin>,
    next_id: u64,
    calls: Calls,
}

/// Versioned JSON-array store kept in memory.
#[derive(Debug)]
pub(crate) struct FakeMirror {
    policy: EndpointPolicy,
    state: Mutex<State>,
    offline: AtomicBool,
    hold_fetch: AtomicBool,
    pub entered: Notify,
    pub release: Notify,
}

impl FakeMirror {
    pub fn new() -> Self {
        Self {
            policy: EndpointPolicy::new(CREATE_URL, PREFIX).unwrap(),
            state: Mutex::new(State::default()),
            offline: AtomicBool::new(false),
            hold_fetch: AtomicBool::new(false),
            entered: Notify::new(),
            release: Notify::new(),
        }
    }

    /// Make every network call fail with HTTP 503.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Park fetches until `release` is notified, signalling `entered` first.
    pub fn hold_fetches(&self, hold: bool) {
        self.hold_fetch.store(hold, Ordering::SeqCst);
    }

    /// Contents of a bin, as a peer reading it would see them.
    pub fn bin(&self, url: &str) -> Option<Vec<Record>> {
        self.state
            .lock()
            .unwrap()
            .bins
            .get(url)
            .map(|b| b.records.clone())
    }

    /// Write a bin directly, as another device would.
    pub fn put_bin(&self, url: &str, records: Vec<Record>) {
        let mut state = self.state.lock().unwrap();
        let bin = state.bins.entry(url.to_string()).or_default();
        bin.records = records;
        bin.version += 1;
    }

    /// Allocate a bin without going through the trait.
    pub fn seed_bin(&self, records: Vec<Record>) -> String {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let url = format!("{PREFIX}bin{}", state.next_id);
        state.bins.insert(url.clone(), Bin { records, version: 1 });
        url
    }

    pub fn calls(&self) -> Calls {
        self.state.lock().unwrap().calls
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(Error::RemoteStatus { status: 503 })
        } else {
            Ok(())
        }
    }

    async fn maybe_hold(&self) {
        if self.hold_fetch.load(Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
        }
    }

    fn snapshot(&self, url: &str) -> Result<Snapshot> {
        let state = self.state.lock().unwrap();
        let bin = state
            .bins
            .get(url)
            .ok_or(Error::RemoteStatus { status: 404 })?;
        Ok(Snapshot {
            records: bin.records.clone(),
            etag: Some(bin.etag()),
        })
    }
}

#[async_trait::async_trait]
impl RemoteMirror for FakeMirror {
    fn validate_endpoint(&self, url: &str) -> Result<()> {
        self.policy.validate(url)
    }

    async fn create_bin(&self, initial: &[Record]) -> Result<CreatedBin> {
        self.state.lock().unwrap().calls.create += 1;
        self.check_online()?;
        let url = self.seed_bin(initial.to_vec());
        let etag = Some(FreshnessToken::new("\"v1\""));
        Ok(CreatedBin { url, etag })
    }

    async fn fetch_all(&self, url: &str) -> Result<Snapshot> {
        self.policy.validate(url)?;
        self.state.lock().unwrap().calls.fetch += 1;
        self.maybe_hold().await;
        self.check_online()?;
        self.snapshot(url)
    }

    async fn fetch_if_changed(
        &self,
        url: &str,
        token: Option<&FreshnessToken>,
    ) -> Result<FetchOutcome> {
        let snapshot = self.fetch_all(url).await?;
        if token.is_some() && token == snapshot.etag.as_ref() {
            Ok(FetchOutcome::Unchanged)
        } else {
            Ok(FetchOutcome::Changed(snapshot))
        }
    }

    async fn append_one(&self, url: &str, record: &Record) -> Result<Option<FreshnessToken>> {
        self.policy.validate(url)?;
        self.state.lock().unwrap().calls.append += 1;
        self.check_online()?;
        let mut state = self.state.lock().unwrap();
        let bin = state
            .bins
            .get_mut(url)
            .ok_or(Error::RemoteStatus { status: 404 })?;
        bin.records.push(record.clone());
        bin.version += 1;
        Ok(Some(bin.etag()))
    }

    async fn overwrite_all(&self, url: &str, records: &[Record]) -> Result<Option<FreshnessToken>> {
        self.policy.validate(url)?;
        self.state.lock().unwrap().calls.overwrite += 1;
        self.check_online()?;
        let mut state = self.state.lock().unwrap();
        let bin = state
            .bins
            .get_mut(url)
            .ok_or(Error::RemoteStatus { status: 404 })?;
        bin.records = records.to_vec();
        bin.version += 1;
        Ok(Some(bin.etag()))
    }
}
