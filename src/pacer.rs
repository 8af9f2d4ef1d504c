//! Host-to-radio sample path: the producer handle the DSP engine writes
//! into and the FIFO model the pacer task sleeps by.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::radio::i16_be;
use crate::ring::{Push, RingProducer, TX_CHUNK_LEN};
use crate::settings::PacerTuning;
use crate::state::SessionState;

/// Samples carried by one TX chunk.
pub const TX_CHUNK_SAMPLES: usize = TX_CHUNK_LEN / 8;

/// Silence pushed through the TX path right after a start command.
pub const PRIME_SAMPLES: usize = 500;

/// Leaky-bucket estimate of the radio's TX FIFO fill level.
#[derive(Debug)]
pub struct FifoEstimator {
    fifo: f64,
    last: Instant,
    tuning: PacerTuning,
}

impl FifoEstimator {
    pub fn new(tuning: PacerTuning) -> Self {
        Self::starting_at(tuning, Instant::now())
    }

    pub fn starting_at(tuning: PacerTuning, now: Instant) -> Self {
        Self {
            fifo: 0.0,
            last: now,
            tuning,
        }
    }

    pub fn set_tuning(&mut self, tuning: PacerTuning) {
        self.tuning = tuning;
    }

    pub fn level(&self) -> f64 {
        self.fifo
    }

    /// Drain the model up to `now` and return how long to wait before the
    /// next send.
    pub fn delay(&mut self, now: Instant) -> Option<Duration> {
        let elapsed = now.saturating_duration_since(self.last).as_secs_f64();
        self.last = now;
        self.fifo = (self.fifo - elapsed * self.tuning.sample_rate).max(0.0);
        if self.fifo > self.tuning.fifo_high {
            Some(Duration::from_micros(self.tuning.sleep_long_us))
        } else if self.fifo > self.tuning.fifo_low {
            Some(Duration::from_micros(self.tuning.sleep_short_us))
        } else {
            None
        }
    }

    pub fn sent(&mut self, samples: usize) {
        self.fifo += samples as f64;
    }

    pub fn reset(&mut self, now: Instant) {
        self.fifo = 0.0;
        self.last = now;
    }
}

struct TxStage {
    producer: RingProducer,
    chunk: [u8; TX_CHUNK_LEN],
    fill: usize,
}

impl TxStage {
    fn push(&mut self, session: &SessionState, group: [[u8; 2]; 4]) {
        for (k, word) in group.iter().enumerate() {
            self.chunk[self.fill + 2 * k..self.fill + 2 * k + 2].copy_from_slice(word);
        }
        self.fill += 8;
        if self.fill < TX_CHUNK_LEN {
            return;
        }
        self.fill = 0;
        match self.producer.push_chunk(&self.chunk) {
            Push::Queued => {}
            Push::Skipped => SessionState::bump(&session.tx_discarded),
            Push::Overflow => {
                SessionState::bump(&session.tx_overflows);
                log::warn!("P1 TX ring full, skipping");
            }
        }
    }
}

/// Handle through which the DSP engine feeds the transmitter.
///
/// Clones share one staging buffer; call sites are expected to come from a
/// single DSP thread at a time.
#[derive(Clone)]
pub struct TxStream {
    stage: Arc<Mutex<TxStage>>,
    session: Arc<SessionState>,
}

impl TxStream {
    pub fn new(producer: RingProducer, session: Arc<SessionState>) -> Self {
        Self {
            stage: Arc::new(Mutex::new(TxStage {
                producer,
                chunk: [0; TX_CHUNK_LEN],
                fill: 0,
            })),
            session,
        }
    }

    fn push(&self, group: [[u8; 2]; 4]) {
        if self.session.draining() {
            return;
        }
        if let Ok(mut stage) = self.stage.lock() {
            stage.push(&self.session, group);
        }
    }

    /// RX audio for the radio's headphone/speaker codec. Ignored while
    /// transmitting.
    pub fn audio_samples(&self, left: f64, right: f64) {
        if self.session.mox() {
            return;
        }
        self.push([i16_be(left), i16_be(right), [0; 2], [0; 2]]);
    }

    /// TX I/Q plus sidetone on both audio channels. Ignored while
    /// receiving.
    pub fn iq_samples(&self, i: f64, q: f64, sidetone: f64) {
        if !self.session.mox() {
            return;
        }
        let side = i16_be(sidetone);
        self.push([side, side, i16_be(i), i16_be(q)]);
    }

    /// Queue `samples` of silence regardless of the TX state.
    pub fn prime(&self, samples: usize) {
        if let Ok(mut stage) = self.stage.lock() {
            for _ in 0..samples {
                stage.push(&self.session, [[0; 2]; 4]);
            }
        }
    }

    /// Drop a partly staged chunk.
    pub fn clear(&self) {
        if let Ok(mut stage) = self.stage.lock() {
            stage.fill = 0;
        }
    }
}
