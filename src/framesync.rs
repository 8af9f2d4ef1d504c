//! Byte-at-a-time decoder for the radio-to-host sample stream.
//!
//! The decoder is fed the 1024-byte payload of each EP6 frame (or any
//! other slicing of the same byte stream) and emits one control block per
//! sub-buffer followed by the I/Q and mic samples of every group in it.

use num_complex::Complex;

use crate::frame::{ControlBlock, OZY_PAYLOAD_LEN, SYNC};
use crate::radio::{i24_from_be, IQ_SCALE, MIC_SCALE};

/// Consumer of decoded events.
pub trait FrameHandler {
    /// A control block has been read. Returns the number of DDCs the
    /// following sample groups carry.
    fn on_control(&mut self, block: ControlBlock) -> usize;

    fn on_iq(&mut self, ddc: usize, iq: Complex<f64>);

    fn on_mic(&mut self, sample: f64);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Sync0,
    Sync1,
    Sync2,
    Control(usize),
    LeftHi,
    LeftMid,
    LeftLow,
    RightHi,
    RightMid,
    RightLow,
    MicHi,
    MicLow,
}

/// Sample groups that fit into one sub-buffer for `ddcs` receivers.
pub fn groups_per_buffer(ddcs: usize) -> usize {
    OZY_PAYLOAD_LEN / (6 * ddcs.max(1) + 2)
}

#[derive(Debug)]
pub struct FrameSync {
    state: State,
    /// Set while looking for a sync sequence after start-up or a lost lock.
    hunting: bool,
    control: [u8; 5],
    ddcs: usize,
    ddc: usize,
    groups_left: usize,
    /// Unused tail bytes of the current sub-buffer still to be skipped.
    pad_left: usize,
    sample: [u8; 3],
    i: f64,
    mic_hi: u8,
    sync_errors: u64,
}

impl Default for FrameSync {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameSync {
    pub fn new() -> Self {
        Self {
            state: State::Sync0,
            hunting: true,
            control: [0; 5],
            ddcs: 1,
            ddc: 0,
            groups_left: 0,
            pad_left: 0,
            sample: [0; 3],
            i: 0.0,
            mic_hi: 0,
            sync_errors: 0,
        }
    }

    /// Number of times an established lock was lost.
    pub fn sync_errors(&self) -> u64 {
        self.sync_errors
    }

    pub fn is_locked(&self) -> bool {
        !self.hunting
    }

    pub fn reset(&mut self) {
        let errors = self.sync_errors;
        *self = Self::new();
        self.sync_errors = errors;
    }

    pub fn feed<H: FrameHandler>(&mut self, bytes: &[u8], handler: &mut H) {
        for &b in bytes {
            self.step(b, handler);
        }
    }

    fn drop_lock(&mut self, byte: u8) {
        if !self.hunting {
            self.sync_errors += 1;
            log::warn!("P1 lost sync (got {:#04x} in {:?})", byte, self.state);
            self.hunting = true;
        }
    }

    fn lose_sync(&mut self, byte: u8) {
        self.drop_lock(byte);
        self.state = State::Sync0;
    }

    fn step<H: FrameHandler>(&mut self, b: u8, handler: &mut H) {
        match self.state {
            State::Sync0 => {
                if self.pad_left > 0 {
                    self.pad_left -= 1;
                } else if b == SYNC {
                    self.state = State::Sync1;
                } else {
                    self.lose_sync(b);
                }
            }
            State::Sync1 => {
                if b == SYNC {
                    self.state = State::Sync2;
                } else {
                    self.lose_sync(b);
                }
            }
            State::Sync2 => {
                if b == SYNC {
                    self.state = State::Control(0);
                } else {
                    self.lose_sync(b);
                }
            }
            // Surplus sync bytes in front of a genuine marker. No radio
            // sends 0x7F as C0, so the marker started late.
            State::Control(0) if b == SYNC => self.drop_lock(b),
            State::Control(n) => {
                self.control[n] = b;
                if n < 4 {
                    self.state = State::Control(n + 1);
                } else {
                    self.hunting = false;
                    self.ddcs = handler.on_control(ControlBlock(self.control)).max(1);
                    let group_len = 6 * self.ddcs + 2;
                    self.groups_left = groups_per_buffer(self.ddcs);
                    self.pad_left = OZY_PAYLOAD_LEN - self.groups_left * group_len;
                    self.ddc = 0;
                    self.state = if self.groups_left > 0 {
                        State::LeftHi
                    } else {
                        State::Sync0
                    };
                }
            }
            State::LeftHi => {
                self.sample[0] = b;
                self.state = State::LeftMid;
            }
            State::LeftMid => {
                self.sample[1] = b;
                self.state = State::LeftLow;
            }
            State::LeftLow => {
                self.i = i24_from_be(self.sample[0], self.sample[1], b) as f64 / IQ_SCALE;
                self.state = State::RightHi;
            }
            State::RightHi => {
                self.sample[0] = b;
                self.state = State::RightMid;
            }
            State::RightMid => {
                self.sample[1] = b;
                self.state = State::RightLow;
            }
            State::RightLow => {
                let q = i24_from_be(self.sample[0], self.sample[1], b) as f64 / IQ_SCALE;
                handler.on_iq(self.ddc, Complex::new(self.i, q));
                self.ddc += 1;
                self.state = if self.ddc < self.ddcs {
                    State::LeftHi
                } else {
                    State::MicHi
                };
            }
            State::MicHi => {
                self.mic_hi = b;
                self.state = State::MicLow;
            }
            State::MicLow => {
                let mic = i16::from_be_bytes([self.mic_hi, b]) as f64 / MIC_SCALE;
                handler.on_mic(mic);
                self.groups_left -= 1;
                self.ddc = 0;
                self.state = if self.groups_left == 0 {
                    State::Sync0
                } else {
                    State::LeftHi
                };
            }
        }
    }
}
