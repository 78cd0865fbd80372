//! Structured error types for bundle collection.
//!
//! A capture mechanism that is merely busy is not an error; see
//! [`AlreadyActive`](crate::capture::AlreadyActive).

use thiserror::Error;

/// Errors that abort a single bundle run.
///
/// A failure in one static source skips the remaining static sources and is
/// surfaced after the static phase; the archive container itself stays
/// structurally valid up to the failed entry, but the caller is told the
/// bundle is incomplete.
#[derive(Debug, Error)]
pub enum BundleError {
    /// A static or custom data source failed to produce its bytes.
    #[error("bundle entry {name:?}: {source}")]
    Source {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    /// The archive sink rejected a write.
    #[error(transparent)]
    Archive(#[from] std::io::Error),

    /// A capture's copy or teardown failed.
    #[error("capture {name:?}: {source}")]
    Capture {
        name: String,
        #[source]
        source: std::io::Error,
    },

    /// A capture's pump task terminated without reporting a result.
    #[error("capture pump for {name:?} terminated abnormally")]
    Pump { name: String },
}

/// Errors that end the periodic scheduling loop. The scheduler performs no
/// internal retry; backoff policy belongs to the caller.
#[derive(Debug, Error)]
pub enum PeriodicError {
    /// Seeding the jitter RNG from the operating system failed.
    #[error("seeding scheduler rng: {0}")]
    Entropy(#[source] getrandom::Error),

    /// The external cancellation signal fired during the delay.
    #[error("bundle collection cancelled")]
    Cancelled,

    #[error(transparent)]
    Bundle(#[from] BundleError),

    /// Draining the collection buffer failed.
    #[error("draining bundle buffer: {0}")]
    Drain(#[source] std::io::Error),

    /// The storage callback rejected a finished bundle.
    #[error("storing bundle: {0}")]
    Store(#[source] anyhow::Error),
}
