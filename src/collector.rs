//! Bundle assembly: sequences data sources and captures into one archive.

use std::collections::BTreeMap;
use std::io::Write;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use crate::archive::{escape_entry_name, ArchiveWriter};
use crate::capture::{run_capture, Recorder, TraceWithProfile, Unavailable};
use crate::error::BundleError;
use crate::meta::BundleMeta;
use crate::source::{write_vars, DataSource, EnvVars, VarsProvider};

/// Per-run capture configuration.
#[derive(Default)]
pub struct BundleOptions {
    /// Requested CPU profile duration; zero disables CPU profiling.
    pub cpu_profile_duration: Duration,
    /// Optional soft limit on the CPU profile size. The capture is stopped
    /// as soon as possible after the target is reached.
    pub cpu_profile_byte_target: Option<u64>,

    /// Requested execution trace duration; zero disables tracing.
    pub execution_trace_duration: Duration,
    /// Optional soft limit on the execution trace size.
    pub execution_trace_byte_target: Option<u64>,

    /// Additional user-specified data sources. Entries land in the `custom/`
    /// directory under their path-escaped names, in lexicographic order.
    pub custom_sources: BTreeMap<String, DataSource>,
}

/// The collaborators one bundle draws from.
pub struct BundleSources {
    /// Expvar-style key/value snapshot provider for the `expvar` entry.
    pub vars: Box<dyn VarsProvider>,
    /// Point-in-time snapshot sources in registration order. A source named
    /// `heap` always lands first, keeping its position consistent across
    /// bundles for comparison.
    pub snapshots: Vec<(String, DataSource)>,
    /// CPU profile mechanism.
    pub cpu: Box<dyn Recorder>,
    /// Execution trace mechanism.
    pub trace: Box<dyn Recorder>,
}

impl Default for BundleSources {
    fn default() -> Self {
        Self {
            vars: Box::new(EnvVars),
            snapshots: Vec::new(),
            cpu: Box::new(Unavailable),
            trace: Box::new(Unavailable),
        }
    }
}

/// Assembles and writes out a profile bundle. It cannot be reused.
pub struct Collector<'a, W> {
    sink: W,
    meta: &'a BundleMeta,
    options: &'a mut BundleOptions,
    sources: &'a mut BundleSources,
}

impl<'a, W: Write + Send + 'static> Collector<'a, W> {
    pub fn new(
        sink: W,
        meta: &'a BundleMeta,
        options: &'a mut BundleOptions,
        sources: &'a mut BundleSources,
    ) -> Self {
        Self {
            sink,
            meta,
            options,
            sources,
        }
    }

    /// Collects the bundle, streaming entries to the sink as they are
    /// produced, and returns the sink after finalizing the archive.
    ///
    /// The first static-source failure skips the remaining static sources
    /// and is returned once they have been skipped through; capture failures
    /// abort immediately. A capture whose mechanism is already active is
    /// omitted, which is not an error.
    pub async fn run(self, cancel: &CancellationToken) -> Result<W, BundleError> {
        let Collector {
            sink,
            meta,
            options,
            sources,
        } = self;
        let mut archive = ArchiveWriter::new(sink);
        let mut first_err = None;

        add(&mut archive, &mut first_err, "meta", &mut |w| {
            serde_json::to_writer(&mut *w, meta).context("serialize bundle metadata")?;
            Ok(())
        });
        add(&mut archive, &mut first_err, "expvar", &mut |w| {
            write_vars(sources.vars.as_mut(), w)
        });

        // Heap first, so it holds a consistent position across bundles.
        if let Some((_, source)) = sources
            .snapshots
            .iter_mut()
            .find(|(name, _)| name.as_str() == "heap")
        {
            add(&mut archive, &mut first_err, "pprof/heap", &mut |w| {
                source.write_to(w)
            });
        }
        for (name, source) in sources
            .snapshots
            .iter_mut()
            .filter(|(name, _)| name.as_str() != "heap")
        {
            let entry = format!("pprof/{}", escape_entry_name(name));
            add(&mut archive, &mut first_err, &entry, &mut |w| {
                source.write_to(w)
            });
        }

        for (name, source) in options.custom_sources.iter_mut() {
            let entry = format!("custom/{}", escape_entry_name(name));
            add(&mut archive, &mut first_err, &entry, &mut |w| {
                source.write_to(w)
            });
        }

        if let Some(err) = first_err {
            return Err(err);
        }

        if options.cpu_profile_duration > Duration::ZERO {
            archive = run_capture(
                archive,
                "pprof/profile",
                options.cpu_profile_duration,
                options.cpu_profile_byte_target,
                sources.cpu.as_mut(),
                cancel,
            )
            .await?;
        }

        if options.execution_trace_duration > Duration::ZERO {
            archive = add_execution_trace(archive, options, sources, cancel).await?;
        }

        archive.finish().map_err(BundleError::Archive)
    }
}

/// Adds one static entry. After the first failure every later source is
/// skipped; the error surfaces once the static phase ends.
fn add<W: Write>(
    archive: &mut ArchiveWriter<W>,
    first_err: &mut Option<BundleError>,
    name: &str,
    source: &mut dyn FnMut(&mut dyn Write) -> anyhow::Result<()>,
) {
    if first_err.is_some() {
        return;
    }
    if let Err(err) = archive.begin_entry(name) {
        *first_err = Some(BundleError::Archive(err));
        return;
    }
    if let Err(err) = source(archive) {
        *first_err = Some(BundleError::Source {
            name: name.to_string(),
            source: err,
        });
    }
}

async fn add_execution_trace<W>(
    mut archive: ArchiveWriter<W>,
    options: &mut BundleOptions,
    sources: &mut BundleSources,
    cancel: &CancellationToken,
) -> Result<ArchiveWriter<W>, BundleError>
where
    W: Write + Send + 'static,
{
    if options.cpu_profile_duration == Duration::ZERO {
        return run_capture(
            archive,
            "pprof/trace",
            options.execution_trace_duration,
            options.execution_trace_byte_target,
            sources.trace.as_mut(),
            cancel,
        )
        .await;
    }

    // CPU profiling is enabled for this bundle: run a second profile that
    // wholly encompasses the trace window, so CPU samples appear in the
    // execution trace.
    let mut recorder = TraceWithProfile::new(sources.trace.as_mut(), sources.cpu.as_mut());
    archive = run_capture(
        archive,
        "pprof/trace",
        options.execution_trace_duration,
        options.execution_trace_byte_target,
        &mut recorder,
        cancel,
    )
    .await?;

    if let Some(profile) = recorder.take_profile() {
        // The trace held its archive entry open until the pump finished;
        // only now can the enclosing profile be added.
        archive.begin_entry("pprof/profile-during-trace")?;
        archive.write_all(&profile)?;
    }
    Ok(archive)
}
