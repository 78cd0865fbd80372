//! Data sources for bundle entries.

use std::io::{self, Write};

use anyhow::Context;

/// Produces the bytes of one bundle entry.
///
/// Sources are invoked at most once per bundle, directly against the archive
/// entry writer.
pub struct DataSource(Box<dyn FnMut(&mut dyn Write) -> anyhow::Result<()> + Send>);

impl DataSource {
    pub fn new(write_to: impl FnMut(&mut dyn Write) -> anyhow::Result<()> + Send + 'static) -> Self {
        Self(Box::new(write_to))
    }

    pub fn write_to(&mut self, w: &mut dyn Write) -> anyhow::Result<()> {
        (self.0)(w)
    }
}

/// Enumerates expvar-style key/value pairs for the `expvar` entry.
///
/// Values must already be valid JSON; keys are emitted in enumeration order,
/// which is preserved in the output.
pub trait VarsProvider: Send {
    fn visit(&mut self, emit: &mut dyn FnMut(&str, &str));
}

/// Default provider: a snapshot of the process environment, values encoded
/// as JSON strings.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvVars;

impl VarsProvider for EnvVars {
    fn visit(&mut self, emit: &mut dyn FnMut(&str, &str)) {
        for (key, value) in std::env::vars() {
            if let Ok(encoded) = serde_json::to_string(&value) {
                emit(&key, &encoded);
            }
        }
    }
}

/// Writes the `expvar` entry: a hand-rolled JSON object, one key per line,
/// in provider-enumeration order.
pub(crate) fn write_vars(provider: &mut dyn VarsProvider, w: &mut dyn Write) -> anyhow::Result<()> {
    let mut result: io::Result<()> = Ok(());
    let mut prefix = "";
    w.write_all(b"{\n")?;
    provider.visit(&mut |key, value| {
        if result.is_err() {
            return;
        }
        let quoted = match serde_json::to_string(key) {
            Ok(quoted) => quoted,
            Err(err) => {
                result = Err(io::Error::other(err));
                return;
            }
        };
        result = write!(w, "{prefix}{quoted}: {value}");
        prefix = ",\n";
    });
    result?;
    w.write_all(b"\n}\n")?;
    Ok(())
}

/// Point-in-time snapshot of `/proc/self/status`, usable as a default
/// snapshot source on Linux.
pub fn proc_status_source() -> (String, DataSource) {
    (
        "status".to_string(),
        DataSource::new(|w| {
            let status =
                std::fs::read("/proc/self/status").context("read /proc/self/status")?;
            w.write_all(&status)?;
            Ok(())
        }),
    )
}
