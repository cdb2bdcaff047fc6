//! Session lifecycle: registration, liveness, and the Connect-service RPCs.
//!
//! A session moves `Disconnected → Connecting → Connected` inside
//! [`TekHsiConnect::connect`](crate::TekHsiConnect), then either to
//! `Disconnected` again via a clean close or to `Broken` when the keep-alive
//! ticker exhausts its failure budget.

use crate::access::Coordinator;
use crate::error::{Result, TekHsiError};
use crate::grpc::{ConnectClient, ConnectRequest, ConnectStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tonic::transport::Channel;
use tracing::{debug, warn};

fn request(name: &str) -> ConnectRequest {
    ConnectRequest {
        name: name.to_string(),
    }
}

/// Map a Connect-service reply status onto the error channel.
pub(crate) fn check(status: ConnectStatus) -> Result<()> {
    match status {
        ConnectStatus::Success => Ok(()),
        other => Err(TekHsiError::Connection(other)),
    }
}

/// Register this client with the instrument.
pub(crate) async fn register(client: &mut ConnectClient<Channel>, name: &str) -> Result<()> {
    debug!(client = name, "connect");
    let reply = client.connect(request(name)).await?.into_inner();
    check(reply.status())
}

/// Unregister this client.
pub(crate) async fn unregister(client: &mut ConnectClient<Channel>, name: &str) -> Result<()> {
    debug!(client = name, "disconnect");
    let reply = client.disconnect(request(name)).await?.into_inner();
    check(reply.status())
}

/// One liveness notification.
pub(crate) async fn keep_alive_once(client: &mut ConnectClient<Channel>, name: &str) -> Result<()> {
    let reply = client.keep_alive(request(name)).await?.into_inner();
    check(reply.status())
}

/// Ask a stopped instrument to publish its current acquisition.
pub(crate) async fn request_new_sequence(
    client: &mut ConnectClient<Channel>,
    name: &str,
) -> Result<()> {
    debug!(client = name, "request new sequence");
    let reply = client.request_new_sequence(request(name)).await?.into_inner();
    check(reply.status())
}

/// Symbol names the instrument currently advertises.
pub(crate) async fn available_names(
    client: &mut ConnectClient<Channel>,
    name: &str,
) -> Result<Vec<String>> {
    let reply = client.available_names(request(name)).await?.into_inner();
    check(reply.status())?;
    Ok(reply.symbolnames)
}

/// Periodic liveness ticker. Marks the session broken after
/// `failure_limit` consecutive failed notifications, which wakes every
/// blocked foreground waiter and stops the pipeline at its next checkpoint.
pub(crate) async fn keepalive_loop(
    mut client: ConnectClient<Channel>,
    client_name: String,
    interval: Duration,
    failure_limit: u32,
    coordinator: Arc<Coordinator>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut failures = 0u32;

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                match keep_alive_once(&mut client, &client_name).await {
                    Ok(()) => failures = 0,
                    Err(err) => {
                        failures += 1;
                        warn!(%err, failures, "keep-alive failed");
                        if failures >= failure_limit {
                            warn!("keep-alive failure limit reached; session is broken");
                            coordinator.mark_broken();
                            break;
                        }
                    }
                }
            }
        }
    }
    debug!("keep-alive ticker exited");
}
