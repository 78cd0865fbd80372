//! # autobundle - automatic diagnostic profile bundles
//!
//! Assembles a self-contained zip archive (a "profile bundle") describing
//! the running process: process metadata, an expvar-style variable snapshot,
//! point-in-time profiles, custom data sources, and duration-bounded CPU
//! profile and execution trace captures. Bundles suit processes that cannot
//! host an interactive diagnostics endpoint, or that want captures produced
//! on a schedule and shipped somewhere for later inspection.
//!
//! ```text
//! PeriodicCollector ──▶ Collector ──▶ ArchiveWriter ──▶ LinkedBuffer ──▶ store callback
//!                          │
//!             ┌────────────┼──────────────┐
//!        static sources   capture engine  │
//!        (meta, expvar,   (pipe + pump +  │
//!         pprof/*,         SoftLimitWriter)
//!         custom/*)
//! ```
//!
//! Capture mechanisms are injected through the [`Recorder`] trait. A
//! mechanism that is already recording — say, for a concurrent interactive
//! request — is skipped rather than disturbed, and the bundle simply omits
//! that entry.
//!
//! ## Entry points
//!
//! - [`Collector`]: one bundle into any `Write` sink.
//! - [`bundle_router`]: an axum route that collects on demand, streaming the
//!   archive as the response body.
//! - [`PeriodicCollector`]: a jittered collection loop handing finished
//!   bundles to a storage callback.
//!
//! The library logs through the `log` facade and never installs a logger.

pub mod archive;
pub mod capture;
pub mod collector;
pub mod error;
pub mod handler;
pub mod limit;
pub mod llbuf;
pub mod meta;
pub mod periodic;
mod pipe;
pub mod source;

pub use archive::ArchiveWriter;
pub use capture::{AlreadyActive, Recorder, Unavailable};
pub use collector::{BundleOptions, BundleSources, Collector};
pub use error::{BundleError, PeriodicError};
pub use handler::{bundle_router, parse_wait_duration, HandlerState};
pub use limit::SoftLimitWriter;
pub use llbuf::LinkedBuffer;
pub use meta::{BundleMeta, ProcessMeta};
pub use periodic::{PeriodicCollector, DEFAULT_PROFILE_INTERVAL};
pub use source::{proc_status_source, DataSource, EnvVars, VarsProvider};
