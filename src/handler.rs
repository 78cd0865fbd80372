//! On-demand bundle collection over HTTP.
//!
//! Mount [`bundle_router`] where the process serves diagnostics, typically
//! under `/debug/profiles`. The `profile` and `trace` query parameters give
//! the desired capture durations in seconds as a positive floating point
//! number with an `s` suffix, matching the text encoding of
//! `google.protobuf.Duration`.

use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use log::warn;
use serde::Deserialize;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::archive::escape_entry_name;
use crate::collector::{BundleOptions, BundleSources, Collector};
use crate::meta::{BundleMeta, ProcessMeta};

/// Shared state behind the bundle endpoint. Concurrent requests serialize on
/// the sources; the capture mechanisms themselves refuse to double-start
/// anyway.
pub struct HandlerState {
    meta: ProcessMeta,
    sources: Mutex<BundleSources>,
}

impl HandlerState {
    pub fn new(meta: ProcessMeta, sources: BundleSources) -> Self {
        Self {
            meta,
            sources: Mutex::new(sources),
        }
    }
}

/// Router serving profile bundles at its root path.
pub fn bundle_router(state: Arc<HandlerState>) -> Router {
    Router::new().route("/", get(serve_bundle)).with_state(state)
}

#[derive(Debug, Default, Deserialize)]
struct BundleParams {
    #[serde(default)]
    profile: String,
    #[serde(default)]
    trace: String,
}

async fn serve_bundle(
    State(state): State<Arc<HandlerState>>,
    Query(params): Query<BundleParams>,
) -> Response {
    let meta = state.meta.stamp();
    let mut options = BundleOptions {
        cpu_profile_duration: parse_wait_duration(&params.profile),
        execution_trace_duration: parse_wait_duration(&params.trace),
        ..BundleOptions::default()
    };

    let filename = download_file_name(&meta);
    let (tx, rx) = mpsc::unbounded_channel::<Vec<u8>>();

    tokio::spawn(async move {
        let mut sources = state.sources.lock().await;
        let collector = Collector::new(ChannelWriter(tx), &meta, &mut options, &mut sources);
        if let Err(err) = collector.run(&CancellationToken::new()).await {
            // Bytes already flushed to the client cannot be unsent; the
            // truncated archive and this log line are all that signal the
            // failure.
            warn!("profile bundle collection failed: {err}");
        }
    });

    let body = Body::from_stream(futures::stream::unfold(rx, |mut rx| async move {
        rx.recv()
            .await
            .map(|chunk| (Ok::<_, std::convert::Infallible>(chunk), rx))
    }));

    (
        [
            (header::CONTENT_TYPE, "application/zip".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename={filename:?}"),
            ),
        ],
        body,
    )
        .into_response()
}

/// Forwards archive bytes into the response body channel; a send failure
/// means the client went away.
struct ChannelWriter(UnboundedSender<Vec<u8>>);

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.0
            .send(buf.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "response body closed"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn download_file_name(meta: &BundleMeta) -> String {
    let base = meta.main.rsplit('/').next().unwrap_or("");
    format!(
        "profile_{}_{}_{}.zip",
        escape_entry_name(base),
        escape_entry_name(&meta.proc_id),
        escape_entry_name(&meta.capture_time)
    )
}

/// Parses a non-negative duration expressed as a floating point number of
/// seconds followed by an `s`, e.g. `2.5s`.
///
/// Malformed, negative, multi-token, or unit-less input yields zero, which
/// disables the capture rather than failing the request.
pub fn parse_wait_duration(s: &str) -> Duration {
    let Some(seconds) = s.strip_suffix('s') else {
        return Duration::ZERO;
    };
    match seconds.parse::<f64>() {
        Ok(v) if v >= 0.0 && v.is_finite() => Duration::from_secs_f64(v),
        _ => Duration::ZERO,
    }
}
