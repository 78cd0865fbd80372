//! End-to-end bundle collection against fake capture mechanisms, verified by
//! reading the produced archives back with the `zip` crate.

use std::collections::BTreeMap;
use std::io::{Cursor, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use autobundle::{
    AlreadyActive, BundleMeta, BundleOptions, BundleSources, Collector, DataSource, ProcessMeta,
    Recorder,
};
use tokio_util::sync::CancellationToken;

const PROFILE_NAME: &str = "pprof/profile";
const TRACE_NAME: &str = "pprof/trace";
const PROFILE_DURING_TRACE_NAME: &str = "pprof/profile-during-trace";

const CAPTURE_WINDOW: Duration = Duration::from_millis(50);

/// Fake capture mechanism: writes its payload from a worker thread until
/// stopped, tracking active state the way the real runtime hooks do.
struct FakeRecorder {
    payload: &'static str,
    active: Arc<AtomicBool>,
    starts: Arc<AtomicUsize>,
    stop: Option<Arc<AtomicBool>>,
    worker: Option<std::thread::JoinHandle<()>>,
}

impl FakeRecorder {
    fn new(payload: &'static str) -> Self {
        Self {
            payload,
            active: Arc::new(AtomicBool::new(false)),
            starts: Arc::new(AtomicUsize::new(0)),
            stop: None,
            worker: None,
        }
    }

    fn active_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.active)
    }

    fn start_count(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.starts)
    }
}

impl Recorder for FakeRecorder {
    fn start(&mut self, mut sink: Box<dyn Write + Send>) -> Result<(), AlreadyActive> {
        if self.active.swap(true, Ordering::SeqCst) {
            return Err(AlreadyActive);
        }
        self.starts.fetch_add(1, Ordering::SeqCst);

        let stop = Arc::new(AtomicBool::new(false));
        let worker_stop = Arc::clone(&stop);
        let payload = self.payload;
        self.worker = Some(std::thread::spawn(move || {
            while !worker_stop.load(Ordering::SeqCst) {
                if sink.write_all(payload.as_bytes()).is_err() {
                    return;
                }
                std::thread::sleep(Duration::from_millis(1));
            }
            // Final flush at stop time, like the real mechanisms.
            let _ = sink.write_all(b"END");
        }));
        self.stop = Some(stop);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            stop.store(true, Ordering::SeqCst);
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        self.active.store(false, Ordering::SeqCst);
    }
}

fn meta() -> BundleMeta {
    ProcessMeta::init("test-app", "deadbeef").stamp()
}

fn sources_with(cpu: FakeRecorder, trace: FakeRecorder) -> BundleSources {
    BundleSources {
        cpu: Box::new(cpu),
        trace: Box::new(trace),
        ..BundleSources::default()
    }
}

async fn collect(
    meta: &BundleMeta,
    options: &mut BundleOptions,
    sources: &mut BundleSources,
) -> anyhow::Result<zip::ZipArchive<Cursor<Vec<u8>>>> {
    let collector = Collector::new(Vec::new(), meta, options, sources);
    let bytes = collector.run(&CancellationToken::new()).await?;
    Ok(zip::ZipArchive::new(Cursor::new(bytes))?)
}

fn names_in_order(archive: &mut zip::ZipArchive<Cursor<Vec<u8>>>) -> Vec<String> {
    (0..archive.len())
        .map(|i| archive.by_index(i).unwrap().name().to_string())
        .collect()
}

fn entry_string(archive: &mut zip::ZipArchive<Cursor<Vec<u8>>>, name: &str) -> String {
    let mut content = String::new();
    archive
        .by_name(name)
        .unwrap()
        .read_to_string(&mut content)
        .unwrap();
    content
}

#[tokio::test]
async fn test_basic_bundle_has_meta_and_no_captures() {
    let mut sources = BundleSources::default();
    let mut options = BundleOptions::default();
    let mut archive = collect(&meta(), &mut options, &mut sources).await.unwrap();

    let names = names_in_order(&mut archive);
    assert_eq!(names[0], "meta");
    assert_eq!(names[1], "expvar");
    assert!(!names.iter().any(|n| n == PROFILE_NAME));
    assert!(!names.iter().any(|n| n == TRACE_NAME));

    let meta_entry = entry_string(&mut archive, "meta");
    let parsed: BundleMeta = serde_json::from_str(&meta_entry).unwrap();
    assert_eq!(parsed.main, "test-app");
    assert!(!parsed.capture_time.is_empty());
}

#[tokio::test]
async fn test_profile_only() {
    let cpu = FakeRecorder::new("cpu");
    let trace = FakeRecorder::new("trace");
    let cpu_active = cpu.active_flag();
    assert!(!cpu_active.load(Ordering::SeqCst));

    let mut sources = sources_with(cpu, trace);
    let mut options = BundleOptions {
        cpu_profile_duration: CAPTURE_WINDOW,
        ..BundleOptions::default()
    };
    let mut archive = collect(&meta(), &mut options, &mut sources).await.unwrap();

    let names = names_in_order(&mut archive);
    assert!(names.iter().any(|n| n == PROFILE_NAME));
    assert!(!names.iter().any(|n| n == TRACE_NAME));
    assert!(!names.iter().any(|n| n == PROFILE_DURING_TRACE_NAME));

    let profile = entry_string(&mut archive, PROFILE_NAME);
    assert!(profile.contains("cpu"));
    assert!(profile.ends_with("END"), "stop-time bytes are flushed");

    assert!(!cpu_active.load(Ordering::SeqCst), "no capture left running");
}

#[tokio::test]
async fn test_trace_only() {
    let cpu = FakeRecorder::new("cpu");
    let trace = FakeRecorder::new("trace");
    let trace_active = trace.active_flag();

    let mut sources = sources_with(cpu, trace);
    let mut options = BundleOptions {
        execution_trace_duration: CAPTURE_WINDOW,
        ..BundleOptions::default()
    };
    let mut archive = collect(&meta(), &mut options, &mut sources).await.unwrap();

    let names = names_in_order(&mut archive);
    assert!(!names.iter().any(|n| n == PROFILE_NAME));
    assert!(names.iter().any(|n| n == TRACE_NAME));
    assert!(!names.iter().any(|n| n == PROFILE_DURING_TRACE_NAME));

    assert!(!trace_active.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_profile_and_trace() {
    let cpu = FakeRecorder::new("cpu");
    let trace = FakeRecorder::new("trace");
    let cpu_active = cpu.active_flag();
    let trace_active = trace.active_flag();

    let mut sources = sources_with(cpu, trace);
    let mut options = BundleOptions {
        cpu_profile_duration: CAPTURE_WINDOW,
        execution_trace_duration: CAPTURE_WINDOW,
        ..BundleOptions::default()
    };
    let mut archive = collect(&meta(), &mut options, &mut sources).await.unwrap();

    let names = names_in_order(&mut archive);
    assert!(names.iter().any(|n| n == PROFILE_NAME));
    assert!(names.iter().any(|n| n == TRACE_NAME));
    assert!(names.iter().any(|n| n == PROFILE_DURING_TRACE_NAME));

    // The wrapping profile accumulated bytes over the whole trace window.
    let during = entry_string(&mut archive, PROFILE_DURING_TRACE_NAME);
    assert!(during.contains("cpu"));
    assert!(during.ends_with("END"));

    assert!(!cpu_active.load(Ordering::SeqCst));
    assert!(!trace_active.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_trace_but_profile_already_running() {
    let cpu = FakeRecorder::new("cpu");
    let trace = FakeRecorder::new("trace");
    let cpu_active = cpu.active_flag();
    let cpu_starts = cpu.start_count();

    // Some other caller owns the CPU profiler for the whole bundle.
    cpu_active.store(true, Ordering::SeqCst);

    let mut sources = sources_with(cpu, trace);
    let mut options = BundleOptions {
        cpu_profile_duration: CAPTURE_WINDOW,
        execution_trace_duration: CAPTURE_WINDOW,
        ..BundleOptions::default()
    };
    let mut archive = collect(&meta(), &mut options, &mut sources).await.unwrap();

    let names = names_in_order(&mut archive);
    assert!(!names.iter().any(|n| n == PROFILE_NAME));
    assert!(names.iter().any(|n| n == TRACE_NAME));
    assert!(!names.iter().any(|n| n == PROFILE_DURING_TRACE_NAME));

    // The pre-existing capture was never touched.
    assert!(cpu_active.load(Ordering::SeqCst));
    assert_eq!(cpu_starts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_trace_already_running() {
    let cpu = FakeRecorder::new("cpu");
    let trace = FakeRecorder::new("trace");
    let trace_active = trace.active_flag();
    let trace_starts = trace.start_count();

    trace_active.store(true, Ordering::SeqCst);

    let mut sources = sources_with(cpu, trace);
    let mut options = BundleOptions {
        execution_trace_duration: CAPTURE_WINDOW,
        ..BundleOptions::default()
    };
    let mut archive = collect(&meta(), &mut options, &mut sources).await.unwrap();

    let names = names_in_order(&mut archive);
    assert!(!names.iter().any(|n| n == PROFILE_NAME));
    assert!(!names.iter().any(|n| n == TRACE_NAME));
    assert!(!names.iter().any(|n| n == PROFILE_DURING_TRACE_NAME));

    assert!(trace_active.load(Ordering::SeqCst));
    assert_eq!(trace_starts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_entry_ordering_and_escaping() {
    let cpu = FakeRecorder::new("cpu");
    let trace = FakeRecorder::new("trace");

    let mut sources = sources_with(cpu, trace);
    sources.snapshots = vec![
        ("allocs".to_string(), static_source(b"allocs-data")),
        ("heap".to_string(), static_source(b"heap-data")),
        ("mutex".to_string(), static_source(b"mutex-data")),
    ];

    let mut custom = BTreeMap::new();
    custom.insert("b/2".to_string(), static_source(b"second"));
    custom.insert("a 1".to_string(), static_source(b"first"));

    let mut options = BundleOptions {
        cpu_profile_duration: CAPTURE_WINDOW,
        execution_trace_duration: CAPTURE_WINDOW,
        custom_sources: custom,
        ..BundleOptions::default()
    };
    let mut archive = collect(&meta(), &mut options, &mut sources).await.unwrap();

    assert_eq!(
        names_in_order(&mut archive),
        [
            "meta",
            "expvar",
            "pprof/heap",
            "pprof/allocs",
            "pprof/mutex",
            "custom/a%201",
            "custom/b%2F2",
            PROFILE_NAME,
            TRACE_NAME,
            PROFILE_DURING_TRACE_NAME,
        ]
    );
    assert_eq!(entry_string(&mut archive, "custom/a%201"), "first");
    assert_eq!(entry_string(&mut archive, "pprof/heap"), "heap-data");
}

#[tokio::test]
async fn test_static_failure_short_circuits() {
    let cpu = FakeRecorder::new("cpu");
    let trace = FakeRecorder::new("trace");
    let cpu_starts = cpu.start_count();

    let invoked = Arc::new(AtomicBool::new(false));
    let invoked_flag = Arc::clone(&invoked);

    let mut custom = BTreeMap::new();
    custom.insert(
        "aa".to_string(),
        DataSource::new(|_w| anyhow::bail!("source exploded")),
    );
    custom.insert(
        "bb".to_string(),
        DataSource::new(move |w| {
            invoked_flag.store(true, Ordering::SeqCst);
            w.write_all(b"never reached")?;
            Ok(())
        }),
    );

    let mut sources = sources_with(cpu, trace);
    let mut options = BundleOptions {
        cpu_profile_duration: CAPTURE_WINDOW,
        custom_sources: custom,
        ..BundleOptions::default()
    };

    let err = collect(&meta(), &mut options, &mut sources)
        .await
        .expect_err("failing source aborts the bundle");
    assert!(err.to_string().contains("custom/aa"));

    // Later static sources were skipped, and no capture was attempted.
    assert!(!invoked.load(Ordering::SeqCst));
    assert_eq!(cpu_starts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_expvar_snapshot_is_valid_json() {
    std::env::set_var("AUTOBUNDLE_BUNDLE_TEST", "42");
    let mut sources = BundleSources::default();
    let mut options = BundleOptions::default();
    let mut archive = collect(&meta(), &mut options, &mut sources).await.unwrap();

    let expvar = entry_string(&mut archive, "expvar");
    let parsed: serde_json::Value = serde_json::from_str(&expvar).unwrap();
    assert_eq!(parsed["AUTOBUNDLE_BUNDLE_TEST"], "42");
}

fn static_source(content: &'static [u8]) -> DataSource {
    DataSource::new(move |w| {
        w.write_all(content)?;
        Ok(())
    })
}
