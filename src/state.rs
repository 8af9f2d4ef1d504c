//! Process-wide session flags, counters and radio telemetry.
//!
//! Every field is written by a single owner and read by the others, so
//! plain atomics are enough. Counters only ever grow; the application
//! shows them to the user and may clear the sticky indicators.

use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, AtomicU8, Ordering};

use crate::frame::ControlBlock;
use crate::radio::DeviceType;

/// 7-bit I2C bus address the HL2 gateway answers on (C0 = addr << 1).
pub const HL2_I2C_BUS: u8 = 0x3D;
pub const HL2_I2C_WRITE: u8 = 0x06;
pub const HL2_I2C_READ: u8 = 0x07;
/// I2C address of the HL2 I/O board.
pub const HL2_IO_BOARD_ADDR: u8 = 0x1D;
pub const HL2_IO_REG_VERSION: u8 = 0;

#[derive(Debug, Default)]
pub struct RadioStatus {
    pub ptt: AtomicBool,
    pub dot: AtomicBool,
    pub dash: AtomicBool,
    pub adc_overload: AtomicBool,
    pub adc_overload_count: AtomicU64,
    pub mercury_version: AtomicU8,
    pub penelope_version: AtomicU8,
    pub ozy_version: AtomicU8,
    pub exciter_power: AtomicU16,
    pub forward_power: AtomicU16,
    pub reverse_power: AtomicU16,
    pub ain3: AtomicU16,
    pub ain4: AtomicU16,
    pub supply_volts: AtomicU16,
    pub tx_fifo_count: AtomicU8,
    pub tx_fifo_errors: AtomicU64,
    pub io_board_detected: AtomicBool,
    pub io_board_version: AtomicU8,
}

impl RadioStatus {
    /// Decode one C&C block returned by the radio.
    pub fn update(&self, cb: &ControlBlock, device: DeviceType) {
        let [c0, c1, c2, c3, c4] = cb.0;

        if device.is_hermes_lite() && c0 & 0x80 != 0 && (c0 >> 1) & 0x3F == HL2_I2C_BUS {
            // Replies echo the request in C1..C3. Only the answer to the
            // board id read counts; write ACKs say nothing about the board.
            if [c1, c2, c3] == [HL2_I2C_READ, HL2_IO_BOARD_ADDR, HL2_IO_REG_VERSION] {
                if !self.io_board_detected.swap(true, Ordering::Relaxed) {
                    log::info!("HL2 I/O board detected (version {})", c4);
                }
                self.io_board_version.store(c4, Ordering::Relaxed);
            } else {
                log::trace!("HL2 I2C reply {:02x?}", cb.0);
            }
            return;
        }

        self.ptt.store(c0 & 0x01 != 0, Ordering::Relaxed);
        self.dot.store(c0 & 0x02 != 0, Ordering::Relaxed);
        self.dash.store(c0 & 0x04 != 0, Ordering::Relaxed);

        match (c0 & 0x7F) >> 3 {
            0 => {
                self.set_overload(c1 & 0x01 != 0);
                if device.is_hermes_lite() {
                    if c3 & 0x80 != 0 {
                        self.tx_fifo_errors.fetch_add(1, Ordering::Relaxed);
                    }
                    self.tx_fifo_count.store(c3 & 0x7F, Ordering::Relaxed);
                    self.ozy_version.store(c4, Ordering::Relaxed);
                } else {
                    self.mercury_version.store(c2, Ordering::Relaxed);
                    self.penelope_version.store(c3, Ordering::Relaxed);
                    self.ozy_version.store(c4, Ordering::Relaxed);
                }
            }
            1 => {
                self.exciter_power.store(u16::from_be_bytes([c1, c2]), Ordering::Relaxed);
                self.forward_power.store(u16::from_be_bytes([c3, c4]), Ordering::Relaxed);
            }
            2 => {
                self.reverse_power.store(u16::from_be_bytes([c1, c2]), Ordering::Relaxed);
                self.ain3.store(u16::from_be_bytes([c3, c4]), Ordering::Relaxed);
            }
            3 => {
                self.ain4.store(u16::from_be_bytes([c1, c2]), Ordering::Relaxed);
                self.supply_volts.store(u16::from_be_bytes([c3, c4]), Ordering::Relaxed);
            }
            4 => {
                self.set_overload((c1 | c2 | c3) & 0x01 != 0);
            }
            _ => {}
        }
    }

    fn set_overload(&self, overload: bool) {
        if overload {
            self.adc_overload.store(true, Ordering::Relaxed);
            self.adc_overload_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn radio_ptt(&self) -> bool {
        self.ptt.load(Ordering::Relaxed)
    }

    /// Clear the sticky overload indicator.
    pub fn clear_overload(&self) {
        self.adc_overload.store(false, Ordering::Relaxed);
    }
}

#[derive(Debug, Default)]
pub struct SessionState {
    running: AtomicBool,
    mox: AtomicBool,
    drain: AtomicBool,
    pub status: RadioStatus,
    pub sequence_errors: AtomicU64,
    pub sync_errors: AtomicU64,
    pub bad_frames: AtomicU64,
    pub rx_overflows: AtomicU64,
    pub tx_overflows: AtomicU64,
    pub short_writes: AtomicU64,
    pub tx_discarded: AtomicU64,
    pub frames_received: AtomicU64,
    pub frames_sent: AtomicU64,
}

/// Point-in-time copy of the counters for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStats {
    pub frames_received: u64,
    pub frames_sent: u64,
    pub sequence_errors: u64,
    pub sync_errors: u64,
    pub bad_frames: u64,
    pub rx_overflows: u64,
    pub tx_overflows: u64,
    pub short_writes: u64,
    pub tx_discarded: u64,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub(crate) fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    /// Software TX state (MOX/TUNE/VOX as decided by the application).
    pub fn mox(&self) -> bool {
        self.mox.load(Ordering::Acquire)
    }

    pub(crate) fn set_mox(&self, mox: bool) {
        self.mox.store(mox, Ordering::Release);
    }

    pub fn draining(&self) -> bool {
        self.drain.load(Ordering::Acquire)
    }

    pub(crate) fn set_drain(&self, drain: bool) {
        self.drain.store(drain, Ordering::Release);
    }

    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> SessionStats {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        SessionStats {
            frames_received: get(&self.frames_received),
            frames_sent: get(&self.frames_sent),
            sequence_errors: get(&self.sequence_errors),
            sync_errors: get(&self.sync_errors),
            bad_frames: get(&self.bad_frames),
            rx_overflows: get(&self.rx_overflows),
            tx_overflows: get(&self.tx_overflows),
            short_writes: get(&self.short_writes),
            tx_discarded: get(&self.tx_discarded),
        }
    }
}
