//! In-process byte pipe connecting a capture mechanism to its pump task.
//!
//! The write end is a blocking `std::io::Write` usable from any thread; the
//! read end is awaited by the pump. Writes never wait on the consumer, so a
//! latency-sensitive producer is insulated from archive I/O.

use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

enum Frame {
    Data(Vec<u8>),
    Eof,
}

/// Creates a connected (writer, closer, reader) triple.
pub(crate) fn pipe() -> (PipeWriter, PipeCloser, PipeReader) {
    let (tx, rx) = mpsc::unbounded_channel();
    let closed = Arc::new(AtomicBool::new(false));
    (
        PipeWriter {
            tx: tx.clone(),
            closed: Arc::clone(&closed),
        },
        PipeCloser { tx, closed },
        PipeReader { rx },
    )
}

/// Write end handed to the capture mechanism.
pub(crate) struct PipeWriter {
    tx: UnboundedSender<Frame>,
    closed: Arc<AtomicBool>,
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.closed.load(Ordering::Acquire) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed"));
        }
        if buf.is_empty() {
            return Ok(0);
        }
        self.tx
            .send(Frame::Data(buf.to_vec()))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "pipe reader gone"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Close handle retained by the capture engine. Closing fails writes issued
/// afterwards and wakes the pump once every buffered frame has drained.
pub(crate) struct PipeCloser {
    tx: UnboundedSender<Frame>,
    closed: Arc<AtomicBool>,
}

impl PipeCloser {
    pub(crate) fn close(self) -> io::Result<()> {
        self.closed.store(true, Ordering::Release);
        self.tx
            .send(Frame::Eof)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "pipe reader gone"))
    }
}

/// Read end owned by the pump task.
pub(crate) struct PipeReader {
    rx: UnboundedReceiver<Frame>,
}

impl PipeReader {
    /// Next chunk, or `None` once the pipe is closed.
    pub(crate) async fn recv(&mut self) -> Option<Vec<u8>> {
        match self.rx.recv().await {
            Some(Frame::Data(chunk)) => Some(chunk),
            Some(Frame::Eof) | None => None,
        }
    }
}
