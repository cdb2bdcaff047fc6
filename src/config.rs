//! Client tuning knobs and the experimental parallel-read switches.

use std::time::Duration;

/// Sample-stream encoding requested from the instrument.
///
/// Raw is the default: the instrument ships its native byte layout without
/// per-sample conversion, which keeps transfer cost low. Normalized moves
/// every sample as a 4-byte float already scaled to vertical units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    /// Native byte layout (`GetRawWaveform`).
    #[default]
    Raw,
    /// Vertical-unit floats (`GetWaveform`).
    Normalized,
}

/// Tuning parameters for a [`TekHsiConnect`](crate::TekHsiConnect) session.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Chunk size requested for waveform streams, in bytes.
    pub chunk_size: u32,
    /// Sample-stream encoding.
    pub encoding: Encoding,
    /// Interval between liveness notifications.
    pub keepalive_interval: Duration,
    /// Consecutive keep-alive failures tolerated before the session is
    /// declared broken.
    pub keepalive_failure_limit: u32,
    /// Sleep between pipeline polls when no symbols are available or the
    /// instrument is still serving the previous acquisition.
    pub idle_poll: Duration,
    /// Refetch attempts when headers of one iteration disagree on the
    /// acquisition id.
    pub coherence_retries: u32,
    /// Experimental parallel-read settings.
    pub parallel: ParallelReads,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            chunk_size: 80_000,
            encoding: Encoding::Raw,
            keepalive_interval: Duration::from_secs(5),
            keepalive_failure_limit: 3,
            idle_poll: Duration::from_millis(50),
            coherence_retries: 3,
            parallel: ParallelReads::from_env(),
        }
    }
}

/// Settings for the experimental parallel-read path.
///
/// Disabled unless `TEKHSI_USE_PARALLEL_READS` is set to `1`/`true`/`yes`;
/// `TEKHSI_DISABLE_PARALLEL_READS` wins over everything.
#[derive(Debug, Clone)]
pub struct ParallelReads {
    /// Dispatch fetches concurrently when enabled and the active set is
    /// large enough.
    pub enabled: bool,
    /// Minimum number of symbols before fetches are parallelized.
    pub threshold: usize,
    /// Concurrent fetch limit.
    pub workers: usize,
}

impl ParallelReads {
    /// Read the `TEKHSI_*` environment switches.
    pub fn from_env() -> Self {
        let enabled = env_truthy("TEKHSI_USE_PARALLEL_READS")
            && !env_truthy("TEKHSI_DISABLE_PARALLEL_READS");
        Self {
            enabled,
            threshold: env_usize("TEKHSI_PARALLEL_THRESHOLD", 2),
            workers: env_usize("TEKHSI_PARALLEL_WORKERS", 4),
        }
    }

    /// Parallel reads disabled regardless of the environment.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            threshold: 2,
            workers: 4,
        }
    }
}

impl Default for ParallelReads {
    fn default() -> Self {
        Self::from_env()
    }
}

fn env_truthy(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

fn env_usize(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .filter(|&n| n > 0)
        .unwrap_or(default)
}
