//! Consistency-set coordinator: the gate between the acquisition pipeline
//! and foreground readers.
//!
//! The pipeline commits one bundle per accepted acquisition; the foreground
//! opens a scope with [`access_data`](crate::TekHsiConnect::access_data) and
//! reads any number of symbols from it. While a scope is open the committed
//! bundle is pinned, so every read inside the scope observes the same
//! acquisition. The producer parks in its commit call until the pin is
//! released; a slow consumer therefore sees skips, never a queue.

use crate::error::{Result, TekHsiError};
use crate::grpc::WaveformHeader;
use crate::waveform::Waveform;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::watch;
use tracing::debug;

/// Criterion for accepting an acquisition when entering a data-access scope.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum AcqWaitOn {
    /// Proceed if the committed acquisition has not been read yet, otherwise
    /// wait for the next commit.
    #[default]
    NewData,
    /// Always wait for an acquisition committed after this call.
    NextAcq,
    /// Sleep for the given duration, then wait as [`AcqWaitOn::NextAcq`].
    Time(Duration),
    /// Proceed with whatever is committed; waits only before the first
    /// commit of the session.
    AnyAcq,
}

/// One symbol of a committed acquisition.
#[derive(Debug, Clone)]
pub struct SymbolData {
    /// The acquisition header the record was assembled from.
    pub header: WaveformHeader,
    /// The assembled record.
    pub waveform: Waveform,
}

/// A consistent set: every selected symbol of one acquisition.
#[derive(Debug, Clone)]
pub struct AcquisitionBundle {
    trans_id: u64,
    received_at: Instant,
    timestamp: SystemTime,
    entries: HashMap<String, SymbolData>,
}

impl AcquisitionBundle {
    pub(crate) fn new(trans_id: u64, entries: HashMap<String, SymbolData>) -> Self {
        Self {
            trans_id,
            received_at: Instant::now(),
            timestamp: SystemTime::now(),
            entries,
        }
    }

    /// Monotonic acquisition identifier shared by every entry.
    pub fn trans_id(&self) -> u64 {
        self.trans_id
    }

    /// Monotonic arrival time of the bundle.
    pub fn received_at(&self) -> Instant {
        self.received_at
    }

    /// Wall-clock arrival time of the bundle.
    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }

    /// Lowercased symbol names present in the bundle.
    pub fn symbols(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Entry for `name`, matched case-insensitively.
    pub fn get(&self, name: &str) -> Option<&SymbolData> {
        self.entries.get(&name.to_lowercase())
    }

    /// Waveform for `name`, matched case-insensitively.
    pub fn waveform(&self, name: &str) -> Option<&Waveform> {
        self.get(name).map(|entry| &entry.waveform)
    }

    /// Number of symbols in the bundle.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the acquisition carried none of the selected symbols.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Called from the pipeline worker with each newly committed bundle.
pub type DataCallback = Arc<dyn Fn(&AcquisitionBundle) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionState {
    Connected,
    Broken,
    Closed,
}

struct GateState {
    committed: Option<Arc<AcquisitionBundle>>,
    commit_seq: u64,
    observed: bool,
    pinned: bool,
    scope_open: bool,
    session: SessionState,
}

/// The access gate shared by the pipeline and all foreground consumers.
///
/// The mutex is the only hot-path lock; it is never held across an await
/// point, an RPC, or the user callback. Commits, scope releases, and session
/// transitions bump the watch channel to wake whoever is blocked.
pub(crate) struct Coordinator {
    state: Mutex<GateState>,
    wakeup: watch::Sender<u64>,
}

impl Coordinator {
    pub(crate) fn new() -> Arc<Self> {
        let (wakeup, _) = watch::channel(0);
        Arc::new(Self {
            state: Mutex::new(GateState {
                committed: None,
                commit_seq: 0,
                observed: false,
                pinned: false,
                scope_open: false,
                session: SessionState::Connected,
            }),
            wakeup,
        })
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self) {
        self.wakeup.send_modify(|generation| *generation += 1);
    }

    pub(crate) fn session(&self) -> SessionState {
        self.lock().session
    }

    /// Block until the wait criterion holds and no other scope is open, then
    /// pin the committed bundle and return it.
    pub(crate) async fn wait_for_data(
        &self,
        on: AcqWaitOn,
        timeout: Option<Duration>,
    ) -> Result<Arc<AcquisitionBundle>> {
        if let AcqWaitOn::Time(after) = on {
            tokio::time::sleep(after).await;
        }
        let mut rx = self.wakeup.subscribe();
        let entry_seq = self.lock().commit_seq;
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);

        loop {
            {
                let mut st = self.lock();
                match st.session {
                    SessionState::Closed => return Err(TekHsiError::SessionClosed),
                    SessionState::Broken => return Err(TekHsiError::SessionBroken),
                    SessionState::Connected => {}
                }
                let ready = match on {
                    AcqWaitOn::AnyAcq => st.committed.is_some(),
                    AcqWaitOn::NewData => st.committed.is_some() && !st.observed,
                    AcqWaitOn::NextAcq | AcqWaitOn::Time(_) => st.commit_seq > entry_seq,
                };
                if ready && !st.pinned {
                    if let Some(bundle) = st.committed.clone() {
                        st.pinned = true;
                        st.scope_open = true;
                        debug!(trans_id = bundle.trans_id(), "data-access scope opened");
                        return Ok(bundle);
                    }
                }
            }
            wait_changed(&mut rx, deadline).await?;
        }
    }

    /// Release the foreground pin. Always called on scope exit.
    pub(crate) fn release_scope(&self) {
        {
            let mut st = self.lock();
            st.pinned = false;
            st.scope_open = false;
        }
        debug!("data-access scope released");
        self.notify();
    }

    pub(crate) fn mark_observed(&self) {
        self.lock().observed = true;
    }

    /// Waveform lookup for the convenience `get_data` surface. Requires an
    /// open foreground scope; the pin guarantees the committed bundle is the
    /// one that scope observes.
    pub(crate) fn scope_waveform(&self, name: &str) -> Result<Waveform> {
        let bundle = {
            let st = self.lock();
            if !st.scope_open {
                return Err(TekHsiError::NoAccessScope);
            }
            st.committed.clone().ok_or(TekHsiError::NoAccessScope)?
        };
        match bundle.get(name) {
            Some(entry) => {
                self.mark_observed();
                Ok(entry.waveform.clone())
            }
            None => Err(TekHsiError::UnknownSymbol(name.to_string())),
        }
    }

    /// Publish an accepted bundle as the committed acquisition.
    ///
    /// Parks while a foreground scope holds the pin; the in-flight bundle is
    /// the single pending acquisition during that time. On return the pin is
    /// held by the producer so the data callback sees a stable bundle;
    /// [`finish_commit`](Self::finish_commit) releases it.
    pub(crate) async fn commit(&self, bundle: AcquisitionBundle) -> Result<Arc<AcquisitionBundle>> {
        let mut rx = self.wakeup.subscribe();
        loop {
            {
                let mut st = self.lock();
                match st.session {
                    SessionState::Closed => return Err(TekHsiError::SessionClosed),
                    SessionState::Broken => return Err(TekHsiError::SessionBroken),
                    SessionState::Connected => {}
                }
                if !st.pinned {
                    let bundle = Arc::new(bundle);
                    st.committed = Some(bundle.clone());
                    st.commit_seq += 1;
                    st.observed = false;
                    st.pinned = true;
                    drop(st);
                    debug!(trans_id = bundle.trans_id(), "acquisition committed");
                    self.notify();
                    return Ok(bundle);
                }
            }
            rx.changed()
                .await
                .map_err(|_| TekHsiError::SessionClosed)?;
        }
    }

    /// Release the producer's post-commit pin after callback dispatch.
    pub(crate) fn finish_commit(&self) {
        self.lock().pinned = false;
        self.notify();
    }

    pub(crate) fn mark_broken(&self) {
        {
            let mut st = self.lock();
            if st.session != SessionState::Closed {
                st.session = SessionState::Broken;
            }
        }
        self.notify();
    }

    pub(crate) fn mark_closed(&self) {
        self.lock().session = SessionState::Closed;
        self.notify();
    }
}

async fn wait_changed(
    rx: &mut watch::Receiver<u64>,
    deadline: Option<tokio::time::Instant>,
) -> Result<()> {
    match deadline {
        None => rx.changed().await.map_err(|_| TekHsiError::SessionClosed),
        Some(deadline) => match tokio::time::timeout_at(deadline, rx.changed()).await {
            Err(_) => Err(TekHsiError::Timeout),
            Ok(changed) => changed.map_err(|_| TekHsiError::SessionClosed),
        },
    }
}

/// An open data-access scope.
///
/// While the scope is alive the committed acquisition is pinned: every
/// [`get_data`](Self::get_data) call observes the same `trans_id`. Dropping
/// the scope releases the pin on every exit path.
pub struct DataAccess {
    coordinator: Arc<Coordinator>,
    bundle: Arc<AcquisitionBundle>,
}

impl DataAccess {
    pub(crate) fn new(coordinator: Arc<Coordinator>, bundle: Arc<AcquisitionBundle>) -> Self {
        Self {
            coordinator,
            bundle,
        }
    }

    /// The waveform for `name` (case-insensitive) from the pinned
    /// acquisition.
    pub fn get_data(&self, name: &str) -> Result<&Waveform> {
        match self.bundle.get(name) {
            Some(entry) => {
                self.coordinator.mark_observed();
                Ok(&entry.waveform)
            }
            None => Err(TekHsiError::UnknownSymbol(name.to_string())),
        }
    }

    /// Header for `name` (case-insensitive) from the pinned acquisition.
    pub fn get_header(&self, name: &str) -> Result<&WaveformHeader> {
        self.bundle
            .get(name)
            .map(|entry| &entry.header)
            .ok_or_else(|| TekHsiError::UnknownSymbol(name.to_string()))
    }

    /// The pinned acquisition bundle.
    pub fn bundle(&self) -> &AcquisitionBundle {
        &self.bundle
    }

    /// Acquisition identifier of the pinned bundle.
    pub fn trans_id(&self) -> u64 {
        self.bundle.trans_id()
    }
}

impl Drop for DataAccess {
    fn drop(&mut self) {
        self.coordinator.release_scope();
    }
}
