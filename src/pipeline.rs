//! Acquisition pipeline: the background producer.
//!
//! One iteration polls the advertised symbol set, fetches every active
//! symbol, verifies that all headers belong to the same acquisition, offers
//! the candidate to the acceptance filter, and commits it through the
//! coordinator. The server's streaming rate is the only throttle; the
//! committed slot is overwritten on each acceptance.

use crate::access::{AcquisitionBundle, Coordinator, DataCallback, SessionState, SymbolData};
use crate::config::ClientConfig;
use crate::error::{Result, TekHsiError};
use crate::fetch::{self, SymbolFetch};
use crate::filters::{self, AcqFilter, HeaderMap};
use crate::grpc::{ConnectClient, WaveformDataClient, WfmReplyStatus};
use crate::session;
use crate::symbols::SymbolSelection;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tonic::transport::Channel;
use tracing::{debug, error, warn};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Hooks and snapshots shared between the client surface and the worker.
pub(crate) struct SharedState {
    selection: Mutex<SymbolSelection>,
    available: Mutex<Vec<String>>,
    filter: Mutex<Option<AcqFilter>>,
    callback: Mutex<Option<DataCallback>>,
}

impl SharedState {
    pub(crate) fn new(
        selection: SymbolSelection,
        filter: Option<AcqFilter>,
        callback: Option<DataCallback>,
    ) -> Arc<Self> {
        Arc::new(Self {
            selection: Mutex::new(selection),
            available: Mutex::new(Vec::new()),
            filter: Mutex::new(filter),
            callback: Mutex::new(callback),
        })
    }

    pub(crate) fn set_selection(&self, selection: SymbolSelection) {
        *lock(&self.selection) = selection;
    }

    pub(crate) fn set_filter(&self, filter: AcqFilter) {
        *lock(&self.filter) = Some(filter);
    }

    pub(crate) fn set_callback(&self, callback: DataCallback) {
        *lock(&self.callback) = Some(callback);
    }

    pub(crate) fn available(&self) -> Vec<String> {
        lock(&self.available).clone()
    }

    /// The selection applied to the last-known advertised set.
    pub(crate) fn active_symbols(&self) -> Vec<String> {
        let available = self.available();
        lock(&self.selection).effective(&available)
    }

    pub(crate) fn set_available(&self, names: Vec<String>) {
        *lock(&self.available) = names;
    }
}

pub(crate) struct Pipeline {
    connect: ConnectClient<Channel>,
    data: WaveformDataClient<Channel>,
    channel: Channel,
    client_name: String,
    config: ClientConfig,
    coordinator: Arc<Coordinator>,
    shared: Arc<SharedState>,
    shutdown: watch::Receiver<bool>,
}

impl Pipeline {
    pub(crate) fn new(
        channel: Channel,
        client_name: String,
        config: ClientConfig,
        coordinator: Arc<Coordinator>,
        shared: Arc<SharedState>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            connect: ConnectClient::new(channel.clone()),
            data: WaveformDataClient::new(channel.clone()),
            channel,
            client_name,
            config,
            coordinator,
            shared,
            shutdown,
        }
    }

    pub(crate) fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        debug!("acquisition pipeline started");
        let mut previous_headers: Option<HeaderMap> = None;
        let mut last_trans_id: Option<u64> = None;

        loop {
            if self.should_stop() {
                break;
            }
            match self
                .iteration(&mut previous_headers, &mut last_trans_id)
                .await
            {
                Ok(()) => {}
                Err(TekHsiError::SessionBroken | TekHsiError::SessionClosed) => break,
                Err(err) => {
                    debug!(%err, "acquisition iteration failed; retrying");
                    self.idle().await;
                }
            }
        }
        debug!("acquisition pipeline exited");
    }

    fn shutdown_requested(&self) -> bool {
        // a dropped sender means the client went away without close()
        self.shutdown.has_changed().is_err() || *self.shutdown.borrow()
    }

    fn should_stop(&self) -> bool {
        self.shutdown_requested() || self.coordinator.session() != SessionState::Connected
    }

    async fn idle(&mut self) {
        tokio::select! {
            _ = tokio::time::sleep(self.config.idle_poll) => {}
            _ = self.shutdown.changed() => {}
        }
    }

    async fn iteration(
        &mut self,
        previous_headers: &mut Option<HeaderMap>,
        last_trans_id: &mut Option<u64>,
    ) -> Result<()> {
        let available = session::available_names(&mut self.connect, &self.client_name).await?;
        self.shared.set_available(available.clone());

        let active = lock(&self.shared.selection).effective(&available);
        if active.is_empty() {
            self.idle().await;
            return Ok(());
        }

        let fetch_started = Instant::now();
        let Some(fetches) = self.coherent_fetch(&active).await? else {
            // acquisition kept changing under us; try again next iteration
            self.idle().await;
            return Ok(());
        };
        if fetches.is_empty() {
            self.idle().await;
            return Ok(());
        }

        let trans_id = fetches[0].header.transid;
        if *last_trans_id == Some(trans_id) {
            // the instrument is still serving the acquisition we already offered
            self.idle().await;
            return Ok(());
        }
        *last_trans_id = Some(trans_id);

        let headers: HeaderMap = fetches
            .iter()
            .map(|f| (f.header.sourcename.to_lowercase(), f.header.clone()))
            .collect();
        let accepted = match lock(&self.shared.filter).clone() {
            None => true,
            Some(filter) => filters::run_filter(&filter, previous_headers.as_ref(), &headers),
        };
        // rejected candidates still become the comparison baseline
        *previous_headers = Some(headers);
        if !accepted {
            debug!(trans_id, "candidate rejected by acquisition filter");
            return Ok(());
        }

        let transfer_bytes: usize = fetches.iter().map(|f| f.header.expected_byte_len()).sum();
        let entries: HashMap<String, SymbolData> = fetches
            .into_iter()
            .map(|f| {
                (
                    f.header.sourcename.to_lowercase(),
                    SymbolData {
                        header: f.header,
                        waveform: f.waveform,
                    },
                )
            })
            .collect();

        let committed = self
            .coordinator
            .commit(AcquisitionBundle::new(trans_id, entries))
            .await?;
        if let Some(callback) = lock(&self.shared.callback).clone() {
            // a panicking callback must not strand the post-commit pin
            if catch_unwind(AssertUnwindSafe(|| callback(&committed))).is_err() {
                error!(trans_id, "data callback panicked");
            }
        }
        self.coordinator.finish_commit();

        debug!(
            trans_id,
            symbols = committed.len(),
            transfer_bytes,
            transfer_ms = fetch_started.elapsed().as_millis() as u64,
            "acquisition published"
        );
        Ok(())
    }

    /// Fetch the active set until every header reports the same acquisition.
    /// Returns `None` when the retry budget is exhausted.
    async fn coherent_fetch(&mut self, active: &[String]) -> Result<Option<Vec<SymbolFetch>>> {
        let mut attempt = 0;
        loop {
            if self.shutdown_requested() {
                return Err(TekHsiError::SessionClosed);
            }
            let fetches = self.fetch_set(active).await?;
            let coherent = fetches
                .windows(2)
                .all(|pair| pair[0].header.transid == pair[1].header.transid);
            if coherent {
                return Ok(Some(fetches));
            }
            attempt += 1;
            if attempt > self.config.coherence_retries {
                warn!(
                    attempts = attempt,
                    "acquisition changed mid-fetch; skipping iteration"
                );
                return Ok(None);
            }
            debug!(attempt, "headers disagree on acquisition id; refetching");
        }
    }

    async fn fetch_set(&mut self, active: &[String]) -> Result<Vec<SymbolFetch>> {
        let parallel = &self.config.parallel;
        if parallel.enabled && active.len() >= parallel.threshold {
            self.fetch_parallel(active).await
        } else {
            self.fetch_sequential(active).await
        }
    }

    async fn fetch_sequential(&mut self, active: &[String]) -> Result<Vec<SymbolFetch>> {
        let mut fetched = Vec::with_capacity(active.len());
        for symbol in active {
            match fetch::fetch_symbol(
                &mut self.data,
                symbol,
                self.config.chunk_size,
                self.config.encoding,
            )
            .await
            {
                Ok(f) => fetched.push(f),
                // the symbol disappeared between discovery and fetch
                Err(TekHsiError::Stream {
                    status: WfmReplyStatus::Sourcenamemissing,
                    ..
                }) => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(fetched)
    }

    /// Experimental: dispatch the fetches across a bounded set of tasks,
    /// each with its own stub on the shared channel. Results keep the
    /// request order.
    async fn fetch_parallel(&self, active: &[String]) -> Result<Vec<SymbolFetch>> {
        let limit = Arc::new(Semaphore::new(self.config.parallel.workers));
        let mut tasks = JoinSet::new();
        for (index, symbol) in active.iter().enumerate() {
            let limit = limit.clone();
            let channel = self.channel.clone();
            let symbol = symbol.clone();
            let chunk_size = self.config.chunk_size;
            let encoding = self.config.encoding;
            tasks.spawn(async move {
                let _permit = limit.acquire_owned().await.ok();
                let mut client = WaveformDataClient::new(channel);
                (
                    index,
                    fetch::fetch_symbol(&mut client, &symbol, chunk_size, encoding).await,
                )
            });
        }

        let mut slots: Vec<Option<SymbolFetch>> = (0..active.len()).map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            let (index, result) = joined
                .map_err(|err| TekHsiError::Protocol(format!("fetch task failed: {err}")))?;
            match result {
                Ok(f) => slots[index] = Some(f),
                Err(TekHsiError::Stream {
                    status: WfmReplyStatus::Sourcenamemissing,
                    ..
                }) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(slots.into_iter().flatten().collect())
    }
}
