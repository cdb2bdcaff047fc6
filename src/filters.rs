//! Acquisition acceptance filters.
//!
//! A filter decides whether a candidate acquisition differs from the
//! previous one in a way the consumer cares about. The pipeline offers every
//! coherent candidate to the installed filter before committing it; rejected
//! candidates are discarded, but their headers still become the comparison
//! baseline for the next candidate.

use crate::grpc::WaveformHeader;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::warn;

/// Per-symbol headers of one acquisition, keyed by lowercased symbol name.
pub type HeaderMap = HashMap<String, WaveformHeader>;

/// Acceptance predicate over the previous and candidate header sets.
///
/// `previous` is `None` before the first candidate of a session.
pub type AcqFilter = Arc<dyn Fn(Option<&HeaderMap>, &HeaderMap) -> bool + Send + Sync>;

/// Accepts every acquisition.
pub fn any_acq(_previous: Option<&HeaderMap>, _current: &HeaderMap) -> bool {
    true
}

/// Accepts acquisitions whose vertical settings changed for some symbol, or
/// whose symbol set changed. The first candidate of a session only primes
/// the baseline.
pub fn any_vertical_change(previous: Option<&HeaderMap>, current: &HeaderMap) -> bool {
    let Some(previous) = previous else {
        return false;
    };
    if previous.len() != current.len() {
        return true;
    }
    current.iter().any(|(name, cur)| match previous.get(name) {
        None => true,
        Some(prev) => {
            prev.verticalspacing != cur.verticalspacing || prev.verticaloffset != cur.verticaloffset
        }
    })
}

/// Accepts acquisitions whose horizontal settings changed for some symbol,
/// or whose symbol set changed. The first candidate of a session only
/// primes the baseline.
pub fn any_horizontal_change(previous: Option<&HeaderMap>, current: &HeaderMap) -> bool {
    let Some(previous) = previous else {
        return false;
    };
    if previous.len() != current.len() {
        return true;
    }
    current.iter().any(|(name, cur)| match previous.get(name) {
        None => true,
        Some(prev) => {
            prev.noofsamples != cur.noofsamples
                || prev.horizontalspacing != cur.horizontalspacing
                || prev.horizontalzeroindex != cur.horizontalzeroindex
        }
    })
}

/// Run a user filter, treating a panic as rejection.
pub(crate) fn run_filter(
    filter: &AcqFilter,
    previous: Option<&HeaderMap>,
    current: &HeaderMap,
) -> bool {
    catch_unwind(AssertUnwindSafe(|| filter(previous, current))).unwrap_or_else(|_| {
        warn!("acquisition filter panicked; rejecting candidate");
        false
    })
}
