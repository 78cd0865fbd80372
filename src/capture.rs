//! Time-bounded capture engine.
//!
//! A capture mechanism (CPU profiler, execution tracer) is driven through
//! the [`Recorder`] trait: it is started against the write end of an
//! in-process pipe, a pump task copies pipe bytes into the open archive
//! entry, and the capture ends when its deadline elapses or the soft byte
//! limit fires — whichever comes first. A mechanism that is already
//! recording elsewhere is skipped, never disturbed.

use std::io::Write;
use std::mem;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::archive::ArchiveWriter;
use crate::error::BundleError;
use crate::limit::SoftLimitWriter;
use crate::pipe;

/// Skip condition: the capture mechanism is busy with a recording this
/// bundle did not initiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("capture mechanism is already active")]
pub struct AlreadyActive;

/// A duration-bounded capture mechanism.
///
/// `start` hands the mechanism a sink it feeds from its own context until
/// `stop` is called; `stop` must block until every byte the mechanism
/// intends to emit has reached the sink. A mechanism that is already
/// recording reports [`AlreadyActive`] and must be left untouched.
pub trait Recorder: Send {
    fn start(&mut self, sink: Box<dyn Write + Send>) -> Result<(), AlreadyActive>;
    fn stop(&mut self);
}

/// Recorder for deployments without a given capture mechanism; always
/// reports the skip condition.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unavailable;

impl Recorder for Unavailable {
    fn start(&mut self, _sink: Box<dyn Write + Send>) -> Result<(), AlreadyActive> {
        Err(AlreadyActive)
    }

    fn stop(&mut self) {}
}

/// Runs one capture into the named archive entry.
///
/// On [`AlreadyActive`] the entry is omitted and the run still succeeds. The
/// deadline and the soft byte limit race through one `select!`, so the
/// stop/close sequence runs exactly once; the losing signal is a no-op. The
/// reported error is the pump's copy error if any, else the pipe-close
/// error.
pub(crate) async fn run_capture<W>(
    mut archive: ArchiveWriter<W>,
    name: &str,
    duration: Duration,
    byte_target: Option<u64>,
    recorder: &mut dyn Recorder,
    cancel: &CancellationToken,
) -> Result<ArchiveWriter<W>, BundleError>
where
    W: Write + Send + 'static,
{
    let (writer, closer, mut reader) = pipe::pipe();

    if recorder.start(Box::new(writer)).is_err() {
        // Already recording elsewhere, e.g. for a concurrent interactive
        // request. Skip this part of the bundle.
        return Ok(archive);
    }

    if let Err(err) = archive.begin_entry(name) {
        // Don't leak the capture this call just started.
        recorder.stop();
        let _ = closer.close();
        return Err(BundleError::Archive(err));
    }

    let session = cancel.child_token();
    let trigger = session.clone();
    let mut entry = SoftLimitWriter::new(archive, byte_target, move || trigger.cancel());

    let pump = tokio::spawn(async move {
        let mut copy_err = None;
        while let Some(chunk) = reader.recv().await {
            if copy_err.is_none() {
                if let Err(err) = entry.write_all(&chunk) {
                    copy_err = Some(err);
                }
            }
            // After a write error keep draining, so the close handshake
            // never stalls behind buffered frames.
        }
        (entry.into_inner(), copy_err)
    });

    tokio::select! {
        () = tokio::time::sleep(duration) => {}
        () = session.cancelled() => {}
    }

    recorder.stop();
    let close_err = closer.close().err();

    let (archive, copy_err) = match pump.await {
        Ok(done) => done,
        Err(_) => {
            return Err(BundleError::Pump {
                name: name.to_string(),
            })
        }
    };
    if let Some(err) = copy_err.or(close_err) {
        return Err(BundleError::Capture {
            name: name.to_string(),
            source: err,
        });
    }
    Ok(archive)
}

/// Wraps the execution-trace mechanism so a CPU profile strictly encloses
/// the trace window, giving trace-embedded CPU samples full context.
///
/// The CPU mechanism only emits bytes atomically at stop time, so it records
/// into an in-memory accumulator rather than the pipe; the caller writes the
/// accumulated profile as its own entry once the trace entry is complete.
pub(crate) struct TraceWithProfile<'a> {
    trace: &'a mut dyn Recorder,
    cpu: &'a mut dyn Recorder,
    profile: Arc<Mutex<Vec<u8>>>,
    profile_started: bool,
}

impl<'a> TraceWithProfile<'a> {
    pub(crate) fn new(trace: &'a mut dyn Recorder, cpu: &'a mut dyn Recorder) -> Self {
        Self {
            trace,
            cpu,
            profile: Arc::new(Mutex::new(Vec::new())),
            profile_started: false,
        }
    }

    /// Accumulated CPU profile bytes, if the wrapping profile ran.
    pub(crate) fn take_profile(&mut self) -> Option<Vec<u8>> {
        if !self.profile_started {
            return None;
        }
        let mut buf = self.profile.lock().unwrap_or_else(PoisonError::into_inner);
        Some(mem::take(&mut *buf))
    }
}

impl Recorder for TraceWithProfile<'_> {
    fn start(&mut self, sink: Box<dyn Write + Send>) -> Result<(), AlreadyActive> {
        // The CPU profile starts first so its window encloses the trace's.
        // Busy just means a concurrent caller owns the profiler; the trace
        // is still worth capturing.
        if self
            .cpu
            .start(Box::new(ProfileSink(Arc::clone(&self.profile))))
            .is_ok()
        {
            self.profile_started = true;
        }

        match self.trace.start(sink) {
            Ok(()) => Ok(()),
            Err(busy) => {
                // The trace is what this capture is for; without it, don't
                // leave the wrapping profile running.
                if self.profile_started {
                    self.cpu.stop();
                    self.profile_started = false;
                    self.profile
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .clear();
                }
                Err(busy)
            }
        }
    }

    fn stop(&mut self) {
        self.trace.stop();
        // The CPU profile stops after the trace, completing the enclosure.
        if self.profile_started {
            self.cpu.stop();
        }
    }
}

struct ProfileSink(Arc<Mutex<Vec<u8>>>);

impl Write for ProfileSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
