//! Session control.
//!
//! A [`Session`] decides whether the dataset is kept on this device only or
//! mirrored to a shared remote store, keeps the in-memory dataset, the
//! local store and the remote mirror converging, and is the only surface
//! producers and consumers of records talk to.
//!
//! Shared state sits behind one lock that is held only between suspension
//! points. Remote calls run unlocked, so a poll and a manual operation can
//! interleave at their I/O boundaries. Every remote result is applied only
//! if the session still has the mode epoch and endpoint it had when the
//! call started.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::record::{sort_dataset, Record};
use crate::remote::{FetchOutcome, FreshnessToken, RemoteMirror, Snapshot};
use crate::storage::{LocalStore, Preference};

/// Which kind of session is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionMode {
    /// No session chosen yet.
    Disconnected,
    /// Records are kept on this device only.
    Local,
    /// Records are mirrored to a shared remote store.
    Shared,
}

impl SessionMode {
    /// The persisted name of this mode.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Local => "local",
            Self::Shared => "shared",
        }
    }
}

impl fmt::Display for SessionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "disconnected" => Ok(Self::Disconnected),
            "local" => Ok(Self::Local),
            "shared" => Ok(Self::Shared),
            other => Err(Error::parse(format!("unknown session mode '{other}'"))),
        }
    }
}

/// Connectivity of the session.
///
/// `Idle`, `Connected` and `Error` are rest states; `Connecting` and
/// `Syncing` only last while a remote call is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncStatus {
    /// Nothing in flight, not connected.
    Idle,
    /// Creating or joining a shared store.
    Connecting,
    /// Connected to a shared store.
    Connected,
    /// A write or reconciliation is in flight.
    Syncing,
    /// The last remote operation failed.
    Error,
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Syncing => "syncing",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

/// Snapshot of the session for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncDescriptor {
    /// Active mode.
    pub mode: SessionMode,
    /// Capability URL of the shared store, when shared.
    pub endpoint: Option<String>,
    /// Connectivity status.
    pub status: SyncStatus,
    /// Freshness token of the last remote state seen.
    pub etag: Option<FreshnessToken>,
    /// Human-readable reason for the last failure.
    pub error: Option<String>,
}

impl SyncDescriptor {
    fn disconnected() -> Self {
        Self {
            mode: SessionMode::Disconnected,
            endpoint: None,
            status: SyncStatus::Idle,
            etag: None,
            error: None,
        }
    }

    fn local() -> Self {
        Self {
            mode: SessionMode::Local,
            ..Self::disconnected()
        }
    }

    fn fail(&mut self, message: String) {
        self.status = SyncStatus::Error;
        self.error = Some(message);
    }
}

/// What a join would replace, shown to the user before confirming.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinPreview {
    /// The capability URL being joined.
    pub url: String,
    /// Number of records in the shared store.
    pub incoming: usize,
    /// Number of records that would be replaced on this device.
    pub local: usize,
}

/// Result of one reconciliation round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncOutcome {
    /// Records pushed to the shared store before fetching.
    pub pushed: usize,
    /// Whether the shared store had changed and replaced local data.
    pub changed: bool,
}

#[derive(Debug)]
struct SessionState {
    store: LocalStore,
    descriptor: SyncDescriptor,
    dataset: Vec<Record>,
    epoch: u64,
}

/// Identity of the shared session a remote call was started for.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Ticket {
    epoch: u64,
    endpoint: String,
}

impl Ticket {
    fn is_current(&self, state: &SessionState) -> bool {
        state.epoch == self.epoch
            && state.descriptor.mode == SessionMode::Shared
            && state.descriptor.endpoint.as_deref() == Some(self.endpoint.as_str())
    }
}

/// Handle to a background poller.
///
/// Signalling stop ends the task at its next tick.
#[derive(Debug)]
pub struct PollerHandle {
    stop_signal: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl PollerHandle {
    /// Signal the poller to stop.
    pub fn stop(&self) {
        self.stop_signal.store(true, Ordering::SeqCst);
    }

    /// Check if the stop signal has been sent.
    #[must_use]
    pub fn should_stop(&self) -> bool {
        self.stop_signal.load(Ordering::SeqCst)
    }

    /// Stop the poller and wait for its task to finish.
    pub async fn shutdown(self) {
        self.stop();
        if let Err(e) = self.task.await {
            warn!("Poller task ended abnormally: {}", e);
        }
    }
}

/// The session controller.
///
/// Cloning is cheap; clones share the same session.
pub struct Session<M> {
    state: Arc<Mutex<SessionState>>,
    mirror: Arc<M>,
    changes: Arc<watch::Sender<u64>>,
}

impl<M> Clone for Session<M> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            mirror: Arc::clone(&self.mirror),
            changes: Arc::clone(&self.changes),
        }
    }
}

impl<M> fmt::Debug for Session<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("descriptor", &self.descriptor())
            .field("records", &self.lock().dataset.len())
            .finish_non_exhaustive()
    }
}

impl<M> Session<M> {
    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self) {
        self.changes.send_modify(|revision| *revision += 1);
    }

    /// The current dataset, newest interview first.
    #[must_use]
    pub fn records(&self) -> Vec<Record> {
        self.lock().dataset.clone()
    }

    /// The current sync descriptor.
    #[must_use]
    pub fn descriptor(&self) -> SyncDescriptor {
        self.lock().descriptor.clone()
    }

    /// Subscribe to changes of the dataset or the descriptor.
    ///
    /// The value is a revision counter bumped on every change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    /// Read the dataset as stored on this device, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the local store cannot be read.
    pub fn stored_records(&self) -> Result<Vec<Record>> {
        let mut records = self.lock().store.get_all()?;
        sort_dataset(&mut records);
        Ok(records)
    }

    /// Number of records and bulk writes not yet mirrored to the shared store.
    ///
    /// # Errors
    ///
    /// Returns an error if the local store cannot be read.
    pub fn pending_count(&self) -> Result<usize> {
        let state = self.lock();
        let appends = state.store.pending_records()?.len();
        let overwrite = state.store.preference(Preference::PendingOverwrite)?;
        Ok(appends + usize::from(overwrite.is_some()))
    }

    /// Switch to a local-only session.
    ///
    /// Loads the dataset from the local store and drops any shared
    /// association. No network access.
    ///
    /// # Errors
    ///
    /// Returns an error if the local store cannot be read or written.
    pub fn start_local(&self) -> Result<()> {
        {
            let mut state = self.lock();
            enter_local(&mut state, true)?;
        }
        self.notify();
        info!("Started local session");
        Ok(())
    }

    /// Leave the current session.
    ///
    /// Forgets the shared association and empties the in-memory dataset.
    /// Records stay in the local store.
    ///
    /// # Errors
    ///
    /// Returns an error if the persisted preferences cannot be cleared.
    pub fn disconnect(&self) -> Result<()> {
        let result = {
            let mut state = self.lock();
            state.epoch += 1;
            state.dataset.clear();
            state.descriptor = SyncDescriptor::disconnected();
            forget_association(&state.store)
        };
        self.notify();
        info!("Disconnected session");
        result
    }
}

impl<M: RemoteMirror> Session<M> {
    /// Create a disconnected session over a local store and a remote mirror.
    pub fn new(store: LocalStore, mirror: impl Into<Arc<M>>) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            state: Arc::new(Mutex::new(SessionState {
                store,
                descriptor: SyncDescriptor::disconnected(),
                dataset: Vec::new(),
                epoch: 0,
            })),
            mirror: mirror.into(),
            changes: Arc::new(changes),
        }
    }

    /// Restore the session chosen in a previous run.
    ///
    /// A shared session is rejoined without confirmation. If the shared
    /// store cannot be reached the session falls back to local mode, keeps
    /// the persisted association for the next run and records the reason
    /// in the descriptor's error field.
    ///
    /// # Errors
    ///
    /// Returns an error only if the local store fails.
    pub async fn resume(&self) -> Result<()> {
        let (mode, url) = {
            let state = self.lock();
            (
                state.store.preference(Preference::SessionMode)?,
                state.store.preference(Preference::RemoteUrl)?,
            )
        };

        match mode.as_deref().map(str::parse::<SessionMode>) {
            Some(Ok(SessionMode::Shared)) => {
                let Some(url) = url else {
                    return self.fall_back_local("no shared store recorded".to_string());
                };
                match self.rejoin(&url).await {
                    Ok(_) => Ok(()),
                    Err(e) => {
                        warn!("Could not rejoin shared store {}: {}", url, e);
                        self.fall_back_local(format!("shared store unavailable ({e}); working locally"))
                    }
                }
            }
            Some(Ok(SessionMode::Local)) => self.start_local(),
            Some(Err(e)) => {
                warn!("Ignoring persisted session mode: {}", e);
                Ok(())
            }
            Some(Ok(SessionMode::Disconnected)) | None => Ok(()),
        }
    }

    async fn rejoin(&self, url: &str) -> Result<SyncOutcome> {
        self.mirror.validate_endpoint(url)?;

        let ticket = {
            let mut state = self.lock();
            let mut records = state.store.get_all()?;
            sort_dataset(&mut records);
            state.epoch += 1;
            state.dataset = records;
            state.descriptor = SyncDescriptor {
                mode: SessionMode::Shared,
                endpoint: Some(url.to_string()),
                status: SyncStatus::Connecting,
                etag: None,
                error: None,
            };
            Ticket {
                epoch: state.epoch,
                endpoint: url.to_string(),
            }
        };
        self.notify();
        info!("Rejoining shared store {}", url);

        self.reconcile(&ticket, true).await
    }

    fn fall_back_local(&self, reason: String) -> Result<()> {
        {
            let mut state = self.lock();
            enter_local(&mut state, false)?;
            state.descriptor.fail(reason);
        }
        self.notify();
        info!("Fell back to a local session");
        Ok(())
    }

    /// Create a new shared store seeded with the current dataset.
    ///
    /// Returns the capability URL of the new store.
    ///
    /// # Errors
    ///
    /// Returns the remote error if the store cannot be created; the
    /// persisted association is left unchanged and the status is `Error`.
    /// Returns [`Error::Superseded`] if the session changed meanwhile.
    pub async fn create_shared(&self) -> Result<String> {
        let (seed, epoch) = {
            let mut state = self.lock();
            if state.descriptor.mode == SessionMode::Disconnected {
                // Seed from the device's records so the next rejoin cannot wipe them.
                enter_local(&mut state, false)?;
            }
            state.epoch += 1;
            state.descriptor.status = SyncStatus::Connecting;
            state.descriptor.error = None;
            (state.dataset.clone(), state.epoch)
        };
        self.notify();
        info!("Creating shared store with {} records", seed.len());

        let result = self.mirror.create_bin(&seed).await;

        let outcome = {
            let mut state = self.lock();
            if state.epoch != epoch {
                debug!("Discarding stale create result");
                return Err(Error::Superseded);
            }
            match result {
                Err(e) => {
                    state.descriptor.fail(e.to_string());
                    Err(e)
                }
                Ok(created) => {
                    let seeded: HashSet<&str> = seed.iter().map(|r| r.id.as_str()).collect();
                    let persisted = persist_association(
                        &state.store,
                        &created.url,
                        created.etag.as_ref(),
                    )
                    .and_then(|()| {
                        state.store.clear_all_pending()?;
                        for record in &state.dataset {
                            if !seeded.contains(record.id.as_str()) {
                                state.store.mark_pending(&record.id)?;
                            }
                        }
                        Ok(())
                    });
                    match persisted {
                        Ok(()) => {
                            state.descriptor = SyncDescriptor {
                                mode: SessionMode::Shared,
                                endpoint: Some(created.url.clone()),
                                status: SyncStatus::Connected,
                                etag: created.etag,
                                error: None,
                            };
                            Ok(created.url)
                        }
                        Err(e) => {
                            state.descriptor.fail(e.to_string());
                            Err(e)
                        }
                    }
                }
            }
        };
        self.notify();

        if let Ok(url) = &outcome {
            info!("Sharing dataset at {}", url);
        }
        outcome
    }

    /// Join an existing shared store, replacing local data with its content.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidEndpoint`] before any change if the URL is
    /// not a capability URL, the remote error if the store cannot be read
    /// (status `Error`, association not persisted), or
    /// [`Error::Superseded`] if the session changed meanwhile.
    pub async fn join_shared(&self, url: &str) -> Result<()> {
        self.join_inner(url, None::<fn(&JoinPreview) -> bool>).await
    }

    /// Join an existing shared store after asking `confirm` whether local
    /// data may be replaced.
    ///
    /// # Errors
    ///
    /// As [`Session::join_shared`], plus [`Error::UserDeclined`] if `confirm`
    /// returns false. Declining changes nothing and leaves status `Idle`.
    pub async fn join_shared_confirmed<F>(&self, url: &str, confirm: F) -> Result<()>
    where
        F: FnOnce(&JoinPreview) -> bool,
    {
        self.join_inner(url, Some(confirm)).await
    }

    async fn join_inner<F>(&self, url: &str, confirm: Option<F>) -> Result<()>
    where
        F: FnOnce(&JoinPreview) -> bool,
    {
        self.mirror.validate_endpoint(url)?;

        let epoch = {
            let mut state = self.lock();
            state.epoch += 1;
            state.descriptor.status = SyncStatus::Connecting;
            state.descriptor.error = None;
            state.epoch
        };
        self.notify();
        info!("Joining shared store {}", url);

        let result = self.mirror.fetch_all(url).await;

        let snapshot = {
            let mut state = self.lock();
            if state.epoch != epoch {
                debug!("Discarding stale join result for {}", url);
                return Err(Error::Superseded);
            }
            match result {
                Ok(snapshot) => Ok((snapshot, state.dataset.len())),
                Err(e) => {
                    state.descriptor.fail(e.to_string());
                    Err(e)
                }
            }
        };
        let (snapshot, local) = match snapshot {
            Ok(ok) => ok,
            Err(e) => {
                self.notify();
                return Err(e);
            }
        };

        if let Some(confirm) = confirm {
            let preview = JoinPreview {
                url: url.to_string(),
                incoming: snapshot.records.len(),
                local,
            };
            if !confirm(&preview) {
                {
                    let mut state = self.lock();
                    if state.epoch == epoch {
                        state.descriptor.status = SyncStatus::Idle;
                    }
                }
                self.notify();
                info!("Join of {} declined", url);
                return Err(Error::UserDeclined);
            }
        }

        let applied = {
            let mut state = self.lock();
            if state.epoch != epoch {
                return Err(Error::Superseded);
            }
            let mut records = snapshot.records;
            sort_dataset(&mut records);
            let written = state
                .store
                .replace_all(&records)
                .and_then(|_| persist_association(&state.store, url, snapshot.etag.as_ref()));
            match written {
                Ok(()) => {
                    state.dataset = records;
                    state.descriptor = SyncDescriptor {
                        mode: SessionMode::Shared,
                        endpoint: Some(url.to_string()),
                        status: SyncStatus::Connected,
                        etag: snapshot.etag,
                        error: None,
                    };
                    Ok(state.dataset.len())
                }
                Err(e) => {
                    state.descriptor.fail(e.to_string());
                    Err(e)
                }
            }
        };
        self.notify();

        let count = applied?;
        info!("Joined shared store {} with {} records", url, count);
        Ok(())
    }

    /// Add one record.
    ///
    /// The record shows up in the dataset immediately and is written to the
    /// local store before anything else. In a shared session it is then
    /// appended to the shared store; until that succeeds it stays marked as
    /// not yet mirrored and the next reconciliation pushes it again.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRecord`] before any change if the record is
    /// invalid. Returns the remote error if the append fails (the record is
    /// kept locally, status `Error`), otherwise the local store error if
    /// the local write failed.
    pub async fn add_record(&self, record: Record) -> Result<()> {
        record.validate()?;

        let (local, ticket) = {
            let mut state = self.lock();
            state.dataset.push(record.clone());
            sort_dataset(&mut state.dataset);

            let local = state.store.add(&record);
            if let Err(e) = &local {
                warn!("Could not store record {} locally: {}", record.id, e);
            }

            let ticket = match (state.descriptor.mode, state.descriptor.endpoint.clone()) {
                (SessionMode::Shared, Some(endpoint)) => {
                    if local.is_ok() {
                        if let Err(e) = state.store.mark_pending(&record.id) {
                            warn!("Could not mark record {} as pending: {}", record.id, e);
                        }
                    }
                    state.descriptor.status = SyncStatus::Syncing;
                    Some(Ticket {
                        epoch: state.epoch,
                        endpoint,
                    })
                }
                _ => None,
            };
            (local, ticket)
        };
        self.notify();

        let Some(ticket) = ticket else {
            debug!("Added record {} locally", record.id);
            return local;
        };

        match self.mirror.append_one(&ticket.endpoint, &record).await {
            Ok(etag) => {
                self.apply_if_current(&ticket, |state| {
                    if let Err(e) = state.store.clear_pending(&record.id) {
                        warn!("Could not clear pending mark of {}: {}", record.id, e);
                    }
                    adopt_etag(state, etag);
                    state.descriptor.status = SyncStatus::Connected;
                    state.descriptor.error = None;
                });
                debug!("Added record {} to shared store", record.id);
                local
            }
            Err(e) => {
                warn!("Record {} saved locally only: {}", record.id, e);
                self.apply_if_current(&ticket, |state| {
                    state.descriptor.fail(format!("saved locally only: {e}"));
                });
                Err(e)
            }
        }
    }

    /// Remove every record.
    ///
    /// The dataset and the local store are always cleared. In a shared
    /// session the shared store is then overwritten with an empty array; if
    /// that fails the overwrite is retried by the next reconciliation.
    ///
    /// # Errors
    ///
    /// Returns the remote error if the shared store could not be cleared,
    /// otherwise the local store error if the local clear failed.
    pub async fn clear_all(&self) -> Result<()> {
        let (local, ticket) = {
            let mut state = self.lock();
            state.dataset.clear();
            let local = state.store.clear().map(|_| ());
            if let Err(e) = &local {
                warn!("Could not clear local store: {}", e);
            }
            let ticket = begin_overwrite(&mut state);
            (local, ticket)
        };
        self.notify();
        info!("Cleared dataset");

        match ticket {
            Some(ticket) => self.push_overwrite(&ticket, &[]).await.and(local),
            None => local,
        }
    }

    /// Replace the whole dataset, e.g. from an import.
    ///
    /// The records are validated, deduplicated by id (the last one wins)
    /// and sorted. The dataset and the local store are replaced first; in a
    /// shared session the shared store is then overwritten.
    ///
    /// Returns the number of records in the new dataset.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRecord`] before any change if a record is
    /// invalid. Otherwise as [`Session::clear_all`].
    pub async fn replace_all(&self, records: Vec<Record>) -> Result<usize> {
        for record in &records {
            record.validate()?;
        }
        let mut records = dedupe_last_wins(records);
        sort_dataset(&mut records);

        let (local, ticket) = {
            let mut state = self.lock();
            state.dataset.clone_from(&records);
            let local = state.store.replace_all(&records).map(|_| ());
            if let Err(e) = &local {
                warn!("Could not replace local store: {}", e);
            }
            let ticket = begin_overwrite(&mut state);
            (local, ticket)
        };
        self.notify();
        info!("Replaced dataset with {} records", records.len());

        match ticket {
            Some(ticket) => self.push_overwrite(&ticket, &records).await.and(local)?,
            None => local?,
        }
        Ok(records.len())
    }

    /// Reconcile with the shared store now.
    ///
    /// Pushes records and bulk writes not yet mirrored, then fetches the
    /// shared store; if it changed, its content replaces local data.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotShared`] outside a shared session, the remote
    /// error on failure (status `Error`), or [`Error::Superseded`] if the
    /// session changed meanwhile.
    pub async fn sync_now(&self) -> Result<SyncOutcome> {
        let ticket = {
            let mut state = self.lock();
            let Some(ticket) = begin_sync(&mut state) else {
                return Err(Error::NotShared);
            };
            ticket
        };
        self.notify();
        debug!("Manual sync with {}", ticket.endpoint);

        self.reconcile(&ticket, false).await
    }

    /// Run one polling round.
    ///
    /// Skipped (returns `None`) unless the session is shared and connected.
    ///
    /// # Errors
    ///
    /// As [`Session::sync_now`].
    pub async fn poll_once(&self) -> Result<Option<SyncOutcome>> {
        let ticket = {
            let mut state = self.lock();
            if state.descriptor.status != SyncStatus::Connected {
                return Ok(None);
            }
            begin_sync(&mut state)
        };
        let Some(ticket) = ticket else {
            return Ok(None);
        };
        self.notify();

        self.reconcile(&ticket, false).await.map(Some)
    }

    async fn push_overwrite(&self, ticket: &Ticket, records: &[Record]) -> Result<()> {
        match self.mirror.overwrite_all(&ticket.endpoint, records).await {
            Ok(etag) => {
                self.apply_if_current(ticket, |state| {
                    if let Err(e) = state.store.remove_preference(Preference::PendingOverwrite) {
                        warn!("Could not clear pending overwrite: {}", e);
                    }
                    adopt_etag(state, etag);
                    state.descriptor.status = SyncStatus::Connected;
                    state.descriptor.error = None;
                });
                debug!("Overwrote shared store with {} records", records.len());
                Ok(())
            }
            Err(e) => {
                warn!("Shared store not updated: {}", e);
                self.apply_if_current(ticket, |state| {
                    state
                        .descriptor
                        .fail(format!("changed locally only: {e}"));
                });
                Err(e)
            }
        }
    }

    /// Push unmirrored local writes, then apply remote changes.
    ///
    /// With `force` the fetch ignores the stored freshness token.
    async fn reconcile(&self, ticket: &Ticket, force: bool) -> Result<SyncOutcome> {
        let result = self.reconcile_inner(ticket, force).await;
        if let Err(e) = &result {
            if !matches!(e, Error::Superseded) {
                warn!("Sync with {} failed: {}", ticket.endpoint, e);
                self.apply_if_current(ticket, |state| state.descriptor.fail(e.to_string()));
            }
        }
        result
    }

    async fn reconcile_inner(&self, ticket: &Ticket, force: bool) -> Result<SyncOutcome> {
        let (overwrite, pending, dataset) = {
            let state = self.lock();
            let overwrite = state
                .store
                .preference(Preference::PendingOverwrite)?
                .is_some();
            (overwrite, state.store.pending_records()?, state.dataset.clone())
        };

        let mut pushed = 0;
        if overwrite {
            let etag = self.mirror.overwrite_all(&ticket.endpoint, &dataset).await?;
            self.apply_if_current(ticket, |state| -> Result<()> {
                state.store.remove_preference(Preference::PendingOverwrite)?;
                for record in &dataset {
                    state.store.clear_pending(&record.id)?;
                }
                adopt_etag(state, etag);
                Ok(())
            })
            .ok_or(Error::Superseded)??;
            pushed = dataset.len();
            info!("Pushed pending overwrite of {} records", pushed);
        } else {
            for record in &pending {
                let etag = self.mirror.append_one(&ticket.endpoint, record).await?;
                self.apply_if_current(ticket, |state| -> Result<()> {
                    state.store.clear_pending(&record.id)?;
                    adopt_etag(state, etag);
                    Ok(())
                })
                .ok_or(Error::Superseded)??;
                pushed += 1;
            }
            if pushed > 0 {
                info!("Pushed {} pending records", pushed);
            }
        }

        let token = if force || pushed > 0 {
            None
        } else {
            self.lock().descriptor.etag.clone()
        };
        let outcome = self
            .mirror
            .fetch_if_changed(&ticket.endpoint, token.as_ref())
            .await?;

        let changed = self
            .apply_if_current(ticket, |state| -> Result<bool> {
                let changed = match outcome {
                    FetchOutcome::Unchanged => false,
                    FetchOutcome::Changed(snapshot) => apply_remote(state, snapshot)?,
                };
                state.descriptor.status = SyncStatus::Connected;
                state.descriptor.error = None;
                Ok(changed)
            })
            .ok_or(Error::Superseded)??;

        if changed {
            debug!("Applied remote changes from {}", ticket.endpoint);
        }
        Ok(SyncOutcome { pushed, changed })
    }

    fn apply_if_current<T>(
        &self,
        ticket: &Ticket,
        f: impl FnOnce(&mut SessionState) -> T,
    ) -> Option<T> {
        let out = {
            let mut state = self.lock();
            if !ticket.is_current(&state) {
                debug!("Discarding late result for {}", ticket.endpoint);
                return None;
            }
            f(&mut state)
        };
        self.notify();
        Some(out)
    }
}

impl<M: RemoteMirror + 'static> Session<M> {
    /// Poll the shared store in the background every `period`.
    ///
    /// Ticks missed while a round is still running are skipped.
    #[must_use]
    pub fn spawn_poller(&self, period: Duration) -> PollerHandle {
        let stop_signal = Arc::new(AtomicBool::new(false));
        let signal = Arc::clone(&stop_signal);
        let session = self.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if signal.load(Ordering::SeqCst) {
                    break;
                }
                match session.poll_once().await {
                    Ok(Some(outcome)) if outcome.changed || outcome.pushed > 0 => {
                        info!(
                            "Poll pushed {} records, remote changed: {}",
                            outcome.pushed, outcome.changed
                        );
                    }
                    Ok(_) => {}
                    Err(e) => warn!("Poll failed: {}", e),
                }
            }
            debug!("Poller stopped");
        });

        PollerHandle { stop_signal, task }
    }
}

fn begin_sync(state: &mut SessionState) -> Option<Ticket> {
    let endpoint = match (state.descriptor.mode, &state.descriptor.endpoint) {
        (SessionMode::Shared, Some(endpoint)) => endpoint.clone(),
        _ => return None,
    };
    state.descriptor.status = SyncStatus::Syncing;
    Some(Ticket {
        epoch: state.epoch,
        endpoint,
    })
}

fn begin_overwrite(state: &mut SessionState) -> Option<Ticket> {
    let ticket = begin_sync(state)?;
    if let Err(e) = state.store.set_preference(Preference::PendingOverwrite, "1") {
        warn!("Could not record pending overwrite: {}", e);
    }
    Some(ticket)
}

fn enter_local(state: &mut SessionState, persist: bool) -> Result<()> {
    let mut records = state.store.get_all()?;
    sort_dataset(&mut records);
    if persist {
        forget_association(&state.store)?;
        state
            .store
            .set_preference(Preference::SessionMode, SessionMode::Local.as_str())?;
    }
    state.epoch += 1;
    state.dataset = records;
    state.descriptor = SyncDescriptor::local();
    Ok(())
}

fn forget_association(store: &LocalStore) -> Result<()> {
    store.remove_preference(Preference::SessionMode)?;
    store.remove_preference(Preference::RemoteUrl)?;
    store.remove_preference(Preference::ETag)?;
    store.remove_preference(Preference::PendingOverwrite)?;
    store.clear_all_pending()
}

fn persist_association(
    store: &LocalStore,
    url: &str,
    etag: Option<&FreshnessToken>,
) -> Result<()> {
    store.set_preference(Preference::SessionMode, SessionMode::Shared.as_str())?;
    store.set_preference(Preference::RemoteUrl, url)?;
    store.remove_preference(Preference::PendingOverwrite)?;
    persist_etag(store, etag)
}

fn persist_etag(store: &LocalStore, etag: Option<&FreshnessToken>) -> Result<()> {
    match etag {
        Some(token) => store.set_preference(Preference::ETag, token.as_str()),
        None => store.remove_preference(Preference::ETag),
    }
}

fn adopt_etag(state: &mut SessionState, etag: Option<FreshnessToken>) {
    if let Err(e) = persist_etag(&state.store, etag.as_ref()) {
        warn!("Could not persist freshness token: {}", e);
    }
    state.descriptor.etag = etag;
}

/// Replace local data with a remote snapshot, keeping unmirrored writes.
///
/// Returns false if a local bulk write is still waiting to be pushed, in
/// which case the snapshot is stale by construction and ignored.
fn apply_remote(state: &mut SessionState, snapshot: Snapshot) -> Result<bool> {
    if state
        .store
        .preference(Preference::PendingOverwrite)?
        .is_some()
    {
        return Ok(false);
    }

    let pending = state.store.pending_records()?;
    let mut records = snapshot.records;
    let remote_ids: HashSet<String> = records.iter().map(|r| r.id.clone()).collect();
    records.extend(
        pending
            .iter()
            .filter(|r| !remote_ids.contains(&r.id))
            .cloned(),
    );
    let mut records = dedupe_last_wins(records);
    sort_dataset(&mut records);

    state.store.replace_all(&records)?;
    for record in &pending {
        if !remote_ids.contains(&record.id) {
            state.store.mark_pending(&record.id)?;
        }
    }
    persist_etag(&state.store, snapshot.etag.as_ref())?;

    state.dataset = records;
    state.descriptor.etag = snapshot.etag;
    Ok(true)
}

fn dedupe_last_wins(records: Vec<Record>) -> Vec<Record> {
    let mut seen = HashSet::new();
    let mut kept: Vec<Record> = records
        .into_iter()
        .rev()
        .filter(|r| seen.insert(r.id.clone()))
        .collect();
    kept.reverse();
    kept
}
