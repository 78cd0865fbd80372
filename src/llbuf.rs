//! Low-latency FIFO byte buffer.
//!
//! Some profile types are sensitive to latency when writing out their data;
//! the execution tracer in particular can drop whole sections of a capture
//! if a write stalls. A contiguous growable buffer stalls its writer whenever
//! it reallocates and copies the entire contents. `LinkedBuffer` instead
//! chains fixed-capacity chunks, bounding any single write to one chunk-sized
//! copy plus at most one allocation.

use std::collections::VecDeque;
use std::io::{self, Read, Write};

const DEFAULT_CHUNK_SIZE: usize = 16 << 10;

/// FIFO byte queue backed by a chain of fixed-capacity chunks.
///
/// The intended discipline is one producer phase written to completion,
/// followed by one consumer phase read to exhaustion; this is not a
/// synchronized queue.
#[derive(Debug, Default)]
pub struct LinkedBuffer {
    /// Chunk capacity; zero selects [`DEFAULT_CHUNK_SIZE`].
    chunk_size: usize,
    // invariant: every chunk in the chain has non-zero capacity, and only
    // the head chunk may be partially consumed.
    chunks: VecDeque<Chunk>,
}

#[derive(Debug)]
struct Chunk {
    buf: Vec<u8>,
    /// Read offset into `buf`; everything before it is already consumed.
    pos: usize,
}

impl LinkedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// A buffer with the given chunk capacity; zero selects the default.
    pub fn with_chunk_size(chunk_size: usize) -> Self {
        Self {
            chunk_size,
            chunks: VecDeque::new(),
        }
    }

    fn effective_chunk_size(&self) -> usize {
        if self.chunk_size == 0 {
            DEFAULT_CHUNK_SIZE
        } else {
            self.chunk_size
        }
    }

    /// Bytes written but not yet read.
    pub fn len(&self) -> usize {
        self.chunks.iter().map(|c| c.buf.len() - c.pos).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

impl Write for LinkedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut rest = buf;
        while !rest.is_empty() {
            let n = match self.chunks.back_mut() {
                Some(tail) if tail.buf.len() < tail.buf.capacity() => {
                    let free = tail.buf.capacity() - tail.buf.len();
                    let n = free.min(rest.len());
                    tail.buf.extend_from_slice(&rest[..n]);
                    n
                }
                _ => {
                    let cap = self.effective_chunk_size();
                    let mut chunk = Vec::with_capacity(cap);
                    let n = cap.min(rest.len());
                    chunk.extend_from_slice(&rest[..n]);
                    self.chunks.push_back(Chunk { buf: chunk, pos: 0 });
                    n
                }
            };
            rest = &rest[n..];
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Read for LinkedBuffer {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let Some(head) = self.chunks.front_mut() else {
            return Ok(0);
        };
        let avail = &head.buf[head.pos..];
        let n = avail.len().min(buf.len());
        buf[..n].copy_from_slice(&avail[..n]);
        head.pos += n;
        if head.pos == head.buf.len() {
            self.chunks.pop_front();
        }
        Ok(n)
    }
}
