//! Scheduler behavior under virtual time: first-iteration options, the store
//! path, and fatal error handling.

use std::io::{Cursor, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use autobundle::{
    AlreadyActive, BundleSources, PeriodicCollector, PeriodicError, ProcessMeta, Recorder,
};
use tokio_util::sync::CancellationToken;

/// Capture mechanism that emits its payload synchronously at start; no
/// threads, so the tests can run entirely on tokio's paused clock.
struct InstantRecorder {
    payload: &'static str,
    active: Arc<AtomicBool>,
}

impl InstantRecorder {
    fn new(payload: &'static str) -> Self {
        Self {
            payload,
            active: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl Recorder for InstantRecorder {
    fn start(&mut self, mut sink: Box<dyn Write + Send>) -> Result<(), AlreadyActive> {
        if self.active.swap(true, Ordering::SeqCst) {
            return Err(AlreadyActive);
        }
        let _ = sink.write_all(self.payload.as_bytes());
        Ok(())
    }

    fn stop(&mut self) {
        self.active.store(false, Ordering::SeqCst);
    }
}

fn sources() -> BundleSources {
    BundleSources {
        cpu: Box::new(InstantRecorder::new("cpu")),
        trace: Box::new(InstantRecorder::new("trace")),
        ..BundleSources::default()
    }
}

#[tokio::test(start_paused = true)]
async fn test_first_bundle_is_static_only() {
    let bundles: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    let collected = Arc::clone(&bundles);
    let cancel = CancellationToken::new();
    let stop = cancel.clone();

    let periodic = PeriodicCollector::new(
        ProcessMeta::init("sched-app", "rev0"),
        sources(),
        move |_meta, bytes| {
            let mut guard = collected.lock().unwrap();
            guard.push(bytes);
            if guard.len() == 2 {
                stop.cancel();
            }
            Ok(())
        },
    )
    .with_interval(Duration::from_millis(20));

    let err = periodic
        .run(cancel)
        .await
        .expect_err("cancellation ends the loop");
    assert!(matches!(err, PeriodicError::Cancelled));

    let bundles = bundles.lock().unwrap();
    assert_eq!(bundles.len(), 2);

    // Iteration 0 forces zero-duration captures so a short-lived process
    // still gets its static snapshots.
    let mut first = zip::ZipArchive::new(Cursor::new(bundles[0].clone())).unwrap();
    assert!(first.by_name("meta").is_ok());
    assert!(first.by_name("expvar").is_ok());
    assert!(first.by_name("pprof/profile").is_err());

    // Iteration 1 runs the fixed CPU profile.
    let mut second = zip::ZipArchive::new(Cursor::new(bundles[1].clone())).unwrap();
    assert!(second.by_name("pprof/profile").is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_store_error_ends_the_loop() {
    let periodic = PeriodicCollector::new(
        ProcessMeta::init("sched-app", "rev0"),
        sources(),
        |_meta, _bytes| anyhow::bail!("bucket unavailable"),
    )
    .with_interval(Duration::from_millis(20));

    let err = periodic
        .run(CancellationToken::new())
        .await
        .expect_err("storage failure is fatal");
    assert!(matches!(err, PeriodicError::Store(_)));
}

#[tokio::test(start_paused = true)]
async fn test_stored_bundles_are_zip_files_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().to_path_buf();
    let cancel = CancellationToken::new();
    let stop = cancel.clone();

    let periodic = PeriodicCollector::new(
        ProcessMeta::init("sched-app", "rev0"),
        sources(),
        move |meta, bytes| {
            std::fs::write(path.join(format!("{}.zip", meta.capture_time)), bytes)?;
            stop.cancel();
            Ok(())
        },
    )
    .with_interval(Duration::from_millis(20));

    let err = periodic.run(cancel).await.expect_err("cancelled after one");
    assert!(matches!(err, PeriodicError::Cancelled));

    let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
    assert_eq!(entries.len(), 1);
    let bytes = std::fs::read(entries[0].as_ref().unwrap().path()).unwrap();
    assert!(bytes.starts_with(b"PK\x03\x04"));
    zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
}
