//! Periodic bundle collection.
//!
//! A [`PeriodicCollector`] runs the assembler at jittered intervals, thins
//! out the expensive execution-trace captures, and hands each finished
//! bundle to a storage callback. The loop ends on cancellation or the first
//! fatal error; retry and backoff policy belong to the caller.

use std::io::Read;
use std::time::Duration;

use log::debug;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio_util::sync::CancellationToken;

use crate::collector::{BundleOptions, BundleSources, Collector};
use crate::error::PeriodicError;
use crate::llbuf::LinkedBuffer;
use crate::meta::{BundleMeta, ProcessMeta};

/// Upper bound on the interval between bundles, from the end of one to the
/// start of the next. Jitter shortens each wait, so bundles are slightly
/// more frequent on average.
pub const DEFAULT_PROFILE_INTERVAL: Duration = Duration::from_secs(120);

const CPU_PROFILE_DURATION: Duration = Duration::from_secs(5);
const CPU_PROFILE_BYTE_TARGET: u64 = 1_000_000;
const EXEC_TRACE_DURATION: Duration = Duration::from_secs(1);
const EXEC_TRACE_BYTE_TARGET: u64 = 10_000_000;
/// Execution traces are large and hard to analyze in aggregate; keep at
/// most one per this many iterations on average.
const EXEC_TRACE_MAX_PERIOD: u64 = 100;

type StoreFn = dyn FnMut(&BundleMeta, Vec<u8>) -> anyhow::Result<()> + Send;

/// Periodically builds a profile bundle and hands it to a storage callback.
pub struct PeriodicCollector {
    meta: ProcessMeta,
    sources: BundleSources,
    store: Box<StoreFn>,
    interval: Duration,
}

impl PeriodicCollector {
    pub fn new(
        meta: ProcessMeta,
        sources: BundleSources,
        store: impl FnMut(&BundleMeta, Vec<u8>) -> anyhow::Result<()> + Send + 'static,
    ) -> Self {
        Self {
            meta,
            sources,
            store: Box::new(store),
            interval: DEFAULT_PROFILE_INTERVAL,
        }
    }

    /// Overrides the baseline collection interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Runs until cancellation or a fatal error; no internal retry.
    ///
    /// Cancellation interrupts the inter-bundle delay and is checked before
    /// each new bundle, but a bundle already in progress always completes or
    /// fails cleanly.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), PeriodicError> {
        let mut rng = StdRng::try_from_os_rng().map_err(PeriodicError::Entropy)?;
        let mut next_exec_trace: u64 = 0;

        let mut i: u64 = 0;
        loop {
            let wait = jittered_delay(&mut rng, self.interval, i);
            tokio::select! {
                () = tokio::time::sleep(wait) => {}
                () = cancel.cancelled() => {}
            }
            if cancel.is_cancelled() {
                return Err(PeriodicError::Cancelled);
            }

            let mut options = options(&mut rng, &mut next_exec_trace, i);
            self.store_bundle(&mut options, &cancel).await?;
            i += 1;
        }
    }

    async fn store_bundle(
        &mut self,
        options: &mut BundleOptions,
        cancel: &CancellationToken,
    ) -> Result<(), PeriodicError> {
        let meta = self.meta.stamp();

        // Latency-sensitive profile types (notably the execution tracer)
        // lose data when a write stalls, so collect into the linked buffer
        // rather than a reallocating contiguous one.
        let buffer = LinkedBuffer::new();
        let collector = Collector::new(buffer, &meta, options, &mut self.sources);
        let mut buffer = collector.run(cancel).await?;

        // The latency-sensitive portion is over; flatten for storage.
        let mut bytes = Vec::with_capacity(buffer.len());
        buffer
            .read_to_end(&mut bytes)
            .map_err(PeriodicError::Drain)?;

        debug!("collected profile bundle, {} bytes", bytes.len());
        (self.store)(&meta, bytes).map_err(PeriodicError::Store)?;
        Ok(())
    }
}

/// Capture options for iteration `i`.
///
/// The first iteration skips both variable-duration captures so a
/// short-lived process still yields a bundle of static snapshots.
fn options(rng: &mut StdRng, next_exec_trace: &mut u64, i: u64) -> BundleOptions {
    let mut options = BundleOptions {
        cpu_profile_duration: CPU_PROFILE_DURATION,
        cpu_profile_byte_target: Some(CPU_PROFILE_BYTE_TARGET),
        execution_trace_byte_target: Some(EXEC_TRACE_BYTE_TARGET),
        ..BundleOptions::default()
    };

    if *next_exec_trace == i {
        *next_exec_trace = i + 1 + rng.random_range(0..EXEC_TRACE_MAX_PERIOD);
        options.execution_trace_duration = EXEC_TRACE_DURATION;
    }

    if i == 0 {
        options.cpu_profile_duration = Duration::ZERO;
        options.execution_trace_duration = Duration::ZERO;
    }

    options
}

/// Baseline interval minus a uniform random trim: up to the whole interval
/// on the first iteration, up to one fifth afterwards.
fn jittered_delay(rng: &mut StdRng, interval: Duration, i: u64) -> Duration {
    let max = u64::try_from(interval.as_nanos()).unwrap_or(u64::MAX);
    let max_trim = if i > 0 { max / 5 } else { max };
    if max_trim == 0 {
        return interval;
    }
    let trim = rng.random_range(0..max_trim);
    Duration::from_nanos(max - trim)
}
