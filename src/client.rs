//! High-level client for the Tektronix High-Speed Interface.

use crate::access::{AcqWaitOn, AcquisitionBundle, Coordinator, DataAccess, DataCallback};
use crate::config::ClientConfig;
use crate::error::Result;
use crate::filters::HeaderMap;
use crate::grpc::ConnectClient;
use crate::pipeline::{Pipeline, SharedState};
use crate::session;
use crate::symbols::SymbolSelection;
use crate::waveform::Waveform;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tonic::transport::Channel;
use tracing::{debug, info, warn};
use uuid::Uuid;

fn normalize_url(url: &str) -> String {
    if url.starts_with("http") {
        url.to_string()
    } else {
        format!("http://{url}")
    }
}

/// Options for opening a TekHSI session.
pub struct ConnectBuilder {
    url: String,
    active_symbols: Option<Vec<String>>,
    filter: Option<crate::filters::AcqFilter>,
    callback: Option<DataCallback>,
    config: ClientConfig,
}

impl ConnectBuilder {
    fn new(url: String) -> Self {
        Self {
            url,
            active_symbols: None,
            filter: None,
            callback: None,
            config: ClientConfig::default(),
        }
    }

    /// Restrict transfers to these symbols (case-insensitive). Without this,
    /// every advertised symbol is transferred.
    pub fn active_symbols<I, S>(mut self, symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.active_symbols = Some(symbols.into_iter().map(Into::into).collect());
        self
    }

    /// Install an acquisition acceptance filter.
    pub fn acq_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(Option<&HeaderMap>, &HeaderMap) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }

    /// Install a callback invoked with each committed acquisition. See
    /// [`TekHsiConnect::set_callback`] for the threading contract.
    pub fn callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&AcquisitionBundle) + Send + Sync + 'static,
    {
        self.callback = Some(Arc::new(callback));
        self
    }

    /// Override the default tuning parameters.
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Open the session and start the acquisition pipeline.
    pub async fn connect(self) -> Result<TekHsiConnect> {
        TekHsiConnect::connect_with(self).await
    }
}

/// A connected TekHSI session.
///
/// Holds the gRPC channel, a background acquisition pipeline that buffers
/// the latest accepted acquisition, and a keep-alive ticker. Data is read
/// through a scoped gate so that everything read within one scope belongs
/// to a single acquisition:
///
/// ```no_run
/// use tekhsi::{AcqWaitOn, TekHsiConnect};
///
/// # async fn demo() -> tekhsi::Result<()> {
/// let mut scope = TekHsiConnect::connect("192.168.0.1:5000").await?;
/// {
///     let access = scope.access_data(AcqWaitOn::NewData).await?;
///     let ch1 = access.get_data("ch1")?;
///     let ch3 = access.get_data("ch3")?;
///     println!("{} + {} samples", ch1.record_length(), ch3.record_length());
/// }
/// scope.close().await?;
/// # Ok(())
/// # }
/// ```
pub struct TekHsiConnect {
    connect: ConnectClient<Channel>,
    client_name: String,
    coordinator: Arc<Coordinator>,
    shared: Arc<SharedState>,
    shutdown: watch::Sender<bool>,
    pipeline: Option<JoinHandle<()>>,
    keepalive: Option<JoinHandle<()>>,
    closed: bool,
}

impl TekHsiConnect {
    /// Connect with default options, transferring every advertised symbol.
    pub async fn connect(url: impl Into<String>) -> Result<Self> {
        Self::builder(url).connect().await
    }

    /// Start building a session with custom options.
    pub fn builder(url: impl Into<String>) -> ConnectBuilder {
        ConnectBuilder::new(url.into())
    }

    async fn connect_with(builder: ConnectBuilder) -> Result<Self> {
        let url = normalize_url(&builder.url);
        info!(%url, "connecting to instrument");

        let channel = Channel::from_shared(url)?.connect().await?;
        let mut connect = ConnectClient::new(channel.clone());
        let client_name = Uuid::new_v4().to_string();
        session::register(&mut connect, &client_name).await?;

        let coordinator = Coordinator::new();
        let shared = SharedState::new(
            SymbolSelection::new(builder.active_symbols),
            builder.filter,
            builder.callback,
        );
        shared.set_available(session::available_names(&mut connect, &client_name).await?);

        let (shutdown, shutdown_rx) = watch::channel(false);
        let pipeline = Pipeline::new(
            channel.clone(),
            client_name.clone(),
            builder.config.clone(),
            coordinator.clone(),
            shared.clone(),
            shutdown_rx.clone(),
        )
        .spawn();
        let keepalive = tokio::spawn(session::keepalive_loop(
            ConnectClient::new(channel),
            client_name.clone(),
            builder.config.keepalive_interval,
            builder.config.keepalive_failure_limit,
            coordinator.clone(),
            shutdown_rx,
        ));

        Ok(Self {
            connect,
            client_name,
            coordinator,
            shared,
            shutdown,
            pipeline: Some(pipeline),
            keepalive: Some(keepalive),
            closed: false,
        })
    }

    /// Symbols the instrument advertised on the most recent poll. The set
    /// changes as the operator toggles channels.
    pub fn available_symbols(&self) -> Vec<String> {
        self.shared.available()
    }

    /// The symbols the pipeline currently transfers: the user selection
    /// applied to the last-known advertised set.
    pub fn active_symbols(&self) -> Vec<String> {
        self.shared.active_symbols()
    }

    /// Replace the symbol selection. `None` selects every advertised
    /// symbol. Takes effect on the next acquisition iteration.
    pub fn set_active_symbols(&self, symbols: Option<Vec<String>>) {
        self.shared.set_selection(SymbolSelection::new(symbols));
    }

    /// Replace the acquisition acceptance filter. Takes effect from the
    /// next candidate acquisition.
    pub fn set_acq_filter<F>(&self, filter: F)
    where
        F: Fn(Option<&HeaderMap>, &HeaderMap) -> bool + Send + Sync + 'static,
    {
        self.shared.set_filter(Arc::new(filter));
    }

    /// Replace the data callback.
    ///
    /// The callback runs on the pipeline worker with the committed bundle
    /// pinned, so it always sees a stable acquisition; a long-running
    /// callback therefore delays the next commit. Do not call
    /// [`access_data`](Self::access_data) from inside it — the pin is
    /// already held and the call would deadlock. The bundle argument gives
    /// the callback everything a scope would.
    pub fn set_callback<F>(&self, callback: F)
    where
        F: Fn(&AcquisitionBundle) + Send + Sync + 'static,
    {
        self.shared.set_callback(Arc::new(callback));
    }

    /// Open a data-access scope once `on`'s criterion is met.
    ///
    /// Every [`get_data`](DataAccess::get_data) call made through the
    /// returned scope observes the same acquisition; the pipeline cannot
    /// replace it until the scope is dropped. Keep the scope short: get the
    /// data, drop the scope, then process.
    pub async fn access_data(&self, on: AcqWaitOn) -> Result<DataAccess> {
        let bundle = self.coordinator.wait_for_data(on, None).await?;
        Ok(DataAccess::new(self.coordinator.clone(), bundle))
    }

    /// [`access_data`](Self::access_data) with a bound on the wait.
    pub async fn access_data_timeout(&self, on: AcqWaitOn, timeout: Duration) -> Result<DataAccess> {
        let bundle = self.coordinator.wait_for_data(on, Some(timeout)).await?;
        Ok(DataAccess::new(self.coordinator.clone(), bundle))
    }

    /// Waveform for `name` (case-insensitive) from the acquisition pinned
    /// by the currently open scope.
    ///
    /// Fails with [`NoAccessScope`](crate::TekHsiError::NoAccessScope)
    /// outside a scope. Prefer [`DataAccess::get_data`], which borrows
    /// instead of cloning.
    pub fn get_data(&self, name: &str) -> Result<Waveform> {
        self.coordinator.scope_waveform(name)
    }

    /// Ask a stopped instrument to publish its current acquisition.
    /// Without this, a single-sequence instrument only produces data on its
    /// next trigger.
    pub async fn force_sequence(&self) -> Result<()> {
        let mut connect = self.connect.clone();
        session::request_new_sequence(&mut connect, &self.client_name).await
    }

    /// Shut the session down: stop the pipeline and keep-alive, then
    /// disconnect from the instrument. Idempotent. Scopes that are already
    /// open keep their pinned bundle; new scope entries fail with
    /// [`SessionClosed`](crate::TekHsiError::SessionClosed).
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        debug!(client = %self.client_name, "closing session");

        // nudge a stopped instrument so a producer parked mid-stream sees
        // end-of-acquisition and can observe the shutdown flag
        if let Err(err) = self.force_sequence().await {
            debug!(%err, "force_sequence during close failed");
        }

        self.coordinator.mark_closed();
        let _ = self.shutdown.send(true);
        if let Some(handle) = self.pipeline.take() {
            let _ = handle.await;
        }
        if let Some(handle) = self.keepalive.take() {
            let _ = handle.await;
        }

        let mut connect = self.connect.clone();
        if let Err(err) = session::unregister(&mut connect, &self.client_name).await {
            warn!(%err, "disconnect failed during close");
        }
        Ok(())
    }
}
