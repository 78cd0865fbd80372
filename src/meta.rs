//! Process identity and bundle metadata.

use chrono::{DateTime, SecondsFormat, Utc};
use log::warn;
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// rustc version recorded at build time, reported as `runtime_version`.
const RUSTC_VERSION: &str = env!("AUTOBUNDLE_RUSTC_VERSION");

/// Immutable identity of the running process.
///
/// Compute this once at startup and pass it to whatever constructs the
/// scheduler or handler; every bundle stamps a copy with its own capture
/// time via [`ProcessMeta::stamp`].
#[derive(Debug, Clone)]
pub struct ProcessMeta {
    main: String,
    revision: String,
    hostname: String,
    proc_id: String,
    init_time: String,
}

impl ProcessMeta {
    /// One-time initialization. `main` and `revision` identify the embedding
    /// application, e.g. `env!("CARGO_PKG_NAME")` and a VCS revision.
    ///
    /// A hostname lookup failure is tolerated: the field stays empty and a
    /// warning is logged, since the rest of the bundle is still useful.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn init(main: impl Into<String>, revision: impl Into<String>) -> Self {
        let init_time = Utc::now();
        let hostname = match read_hostname() {
            Ok(name) => name,
            Err(err) => {
                warn!("hostname lookup failed: {err}");
                String::new()
            }
        };

        let mut noise = [0u8; 12];
        rand::rng().fill_bytes(&mut noise);
        let proc_id = format!(
            "1-{:08x}-{}-{}",
            init_time.timestamp() as u32,
            hex(&noise),
            std::process::id()
        );

        Self {
            main: main.into(),
            revision: revision.into(),
            hostname,
            proc_id,
            init_time: rfc3339_millis(init_time),
        }
    }

    /// Metadata for a bundle scheduled to start immediately.
    pub fn stamp(&self) -> BundleMeta {
        BundleMeta {
            main: self.main.clone(),
            revision: self.revision.clone(),
            runtime_version: RUSTC_VERSION.to_string(),
            hostname: self.hostname.clone(),
            proc_id: self.proc_id.clone(),
            init_time: self.init_time.clone(),
            capture_time: rfc3339_millis(Utc::now()),
        }
    }
}

/// Metadata about one profile bundle; JSON-encoded as the bundle's first
/// entry, named `meta`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleMeta {
    pub main: String,
    pub revision: String,
    pub runtime_version: String,
    pub hostname: String,
    pub proc_id: String,
    pub init_time: String,
    pub capture_time: String,
}

fn rfc3339_millis(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn read_hostname() -> std::io::Result<String> {
    Ok(std::fs::read_to_string("/etc/hostname")?.trim().to_string())
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
