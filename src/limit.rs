//! Soft byte-limit trigger for capture output.

use std::io::{self, Write};

/// Writer decorator that invokes a callback once a cumulative byte watermark
/// is crossed.
///
/// Every write is forwarded unmodified: the watermark is a stop signal for
/// the producer, not a cutoff, because capture mechanisms cannot halt
/// instantaneously and truncating already-flushed data would corrupt the
/// entry. The callback fires at most once; with no budget configured the
/// decorator is write-through.
pub struct SoftLimitWriter<W> {
    inner: W,
    remaining: Option<u64>,
    on_limit: Option<Box<dyn FnOnce() + Send>>,
}

impl<W: Write> SoftLimitWriter<W> {
    pub fn new(inner: W, limit: Option<u64>, on_limit: impl FnOnce() + Send + 'static) -> Self {
        Self {
            inner,
            remaining: limit,
            on_limit: Some(Box::new(on_limit)),
        }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for SoftLimitWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining = remaining.saturating_sub(n as u64);
            if *remaining == 0 {
                if let Some(on_limit) = self.on_limit.take() {
                    on_limit();
                }
            }
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
