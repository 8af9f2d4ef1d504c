//! Fixed-size SPSC byte rings between the socket tasks and their
//! consumers.
//!
//! Data moves in whole chunks. A semaphore permit is added per committed
//! chunk, so the consumer can wait with a timeout instead of spinning.
//! When the producer finds the ring full it drops that chunk and the next
//! `skip_window` chunks, which gives the consumer room to catch up.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::time::timeout;

/// EP6 payload carried per frame (two sub-buffers).
pub const RX_CHUNK_LEN: usize = 1024;
pub const RX_RING_CHUNKS: usize = 384;
pub const RX_SKIP_WINDOW: usize = 256;

/// TX samples per frame: 2 × 63 groups of 8 bytes.
pub const TX_CHUNK_LEN: usize = 1008;
pub const TX_RING_CHUNKS: usize = 32;
pub const TX_SKIP_WINDOW: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Push {
    Queued,
    /// Dropped inside a skip window.
    Skipped,
    /// Ring was full; a skip window has started.
    Overflow,
}

pub struct RingProducer {
    tx: rtrb::Producer<u8>,
    chunk_len: usize,
    skip_window: usize,
    skip_left: usize,
    available: Arc<Semaphore>,
}

pub struct RingConsumer {
    rx: rtrb::Consumer<u8>,
    chunk_len: usize,
    available: Arc<Semaphore>,
}

/// Create a ring holding `chunks` chunks of `chunk_len` bytes.
pub fn byte_ring(chunk_len: usize, chunks: usize, skip_window: usize) -> (RingProducer, RingConsumer) {
    let (tx, rx) = rtrb::RingBuffer::new(chunk_len * chunks);
    let available = Arc::new(Semaphore::new(0));
    (
        RingProducer {
            tx,
            chunk_len,
            skip_window,
            skip_left: 0,
            available: available.clone(),
        },
        RingConsumer {
            rx,
            chunk_len,
            available,
        },
    )
}

impl RingProducer {
    pub fn chunk_len(&self) -> usize {
        self.chunk_len
    }

    pub fn is_skipping(&self) -> bool {
        self.skip_left > 0
    }

    /// Queue one chunk. `data` must be exactly one chunk long.
    pub fn push_chunk(&mut self, data: &[u8]) -> Push {
        debug_assert_eq!(data.len(), self.chunk_len);
        if self.skip_left > 0 {
            self.skip_left -= 1;
            return Push::Skipped;
        }
        let mut chunk = match self.tx.write_chunk(self.chunk_len) {
            Ok(chunk) => chunk,
            Err(_) => {
                self.skip_left = self.skip_window;
                return Push::Overflow;
            }
        };
        let (first, second) = chunk.as_mut_slices();
        let split = first.len();
        first.copy_from_slice(&data[..split]);
        second.copy_from_slice(&data[split..]);
        chunk.commit_all();
        self.available.add_permits(1);
        Push::Queued
    }
}

impl RingConsumer {
    pub fn chunk_len(&self) -> usize {
        self.chunk_len
    }

    /// Chunks ready to be read.
    pub fn queued(&self) -> usize {
        self.available.available_permits()
    }

    /// Wait up to `wait` for the next chunk and copy it into `out`.
    /// Returns false on timeout.
    pub async fn next_chunk(&mut self, out: &mut [u8], wait: Duration) -> bool {
        match timeout(wait, self.available.acquire()).await {
            Ok(Ok(permit)) => permit.forget(),
            _ => return false,
        }
        self.read_into(out)
    }

    /// Copy the next chunk into `out` if one is ready.
    pub fn try_next_chunk(&mut self, out: &mut [u8]) -> bool {
        match self.available.try_acquire() {
            Ok(permit) => permit.forget(),
            Err(_) => return false,
        }
        self.read_into(out)
    }

    /// Drop everything queued. Returns the number of chunks dropped.
    pub fn discard_all(&mut self) -> usize {
        let mut dropped = 0;
        while let Ok(permit) = self.available.try_acquire() {
            permit.forget();
            if let Ok(chunk) = self.rx.read_chunk(self.chunk_len) {
                chunk.commit_all();
                dropped += 1;
            }
        }
        dropped
    }

    fn read_into(&mut self, out: &mut [u8]) -> bool {
        debug_assert_eq!(out.len(), self.chunk_len);
        let Ok(chunk) = self.rx.read_chunk(self.chunk_len) else {
            return false;
        };
        let (first, second) = chunk.as_slices();
        out[..first.len()].copy_from_slice(first);
        out[first.len()..].copy_from_slice(second);
        chunk.commit_all();
        true
    }
}
