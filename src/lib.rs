//! High-speed waveform streaming client for Tektronix oscilloscopes.
//!
//! This crate pulls acquisitions from an instrument over its gRPC data
//! interface and exposes them as consistent, typed waveform sets. A
//! background pipeline transfers the header and sample chunks of every
//! active symbol, assembles them into [`Waveform`] values, and buffers the
//! latest accepted acquisition; foreground code reads it through the scoped
//! [`access_data`](TekHsiConnect::access_data) gate, which guarantees that
//! all data read within one scope belongs to a single acquisition.
//!
//! ## Module map
//!
//! - **`client`**: the [`TekHsiConnect`] surface — session setup, symbol
//!   selection, filter/callback hooks, the access gate, teardown.
//! - **`access`**: the consistency-set coordinator and the [`DataAccess`]
//!   scope guard.
//! - **`fetch`** (internal): the streaming fetcher that assembles chunked
//!   sample streams into typed waveforms.
//! - **`waveform`**: the analog / I/Q / digital value objects.
//! - **`filters`**: acquisition acceptance filters, built-in and custom.
//! - **`config`**: tuning knobs and the experimental parallel-read
//!   switches.
//! - **`grpc`**: generated protocol types and header helpers.
//! - **`error`**: the [`TekHsiError`] taxonomy.

pub mod access;
pub mod client;
pub mod config;
pub mod error;
pub mod filters;
pub mod grpc;
pub mod waveform;

mod fetch;
mod pipeline;
mod session;
mod symbols;

pub use access::{AcqWaitOn, AcquisitionBundle, DataAccess, DataCallback, SymbolData};
pub use client::{ConnectBuilder, TekHsiConnect};
pub use config::{ClientConfig, Encoding, ParallelReads};
pub use error::{Result, TekHsiError};
pub use filters::{any_acq, any_horizontal_change, any_vertical_change, AcqFilter, HeaderMap};
pub use grpc::{ConnectStatus, WaveformHeader, WfmPairType, WfmReplyStatus, WfmType};
pub use waveform::{
    AnalogSamples, AnalogWaveform, DigitalSamples, DigitalWaveform, HorizontalScale, IqMeta,
    IqSamples, IqWaveform, Waveform,
};
