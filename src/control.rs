//! Host-to-radio C&C encoding.
//!
//! Every frame carries two control blocks: a status block (C0 = 0x00)
//! and the next entry of a cyclic command list. The list is rebuilt from
//! the current settings each time it wraps, so its length follows the
//! receiver count and the HL2 I/O board state.

use std::time::Instant;

use crate::frame::ControlBlock;
use crate::radio::{sample_rate_to_code, DeviceType};
use crate::settings::RadioSettings;
use crate::state::{
    HL2_I2C_BUS, HL2_I2C_READ as I2C_READ, HL2_I2C_WRITE as I2C_WRITE,
    HL2_IO_BOARD_ADDR as IO_BOARD_ADDR, HL2_IO_REG_VERSION as IO_REG_VERSION,
};

// -- C0 addresses -------------------------------------------------------------

pub const ADDR_STATUS: u8 = 0x00;
pub const ADDR_TX_FREQ: u8 = 0x02;
pub const ADDR_RX_FREQ: u8 = 0x04;
pub const ADDR_DRIVE: u8 = 0x12;
pub const ADDR_PREAMP: u8 = 0x14;
pub const ADDR_ATT_KEYER: u8 = 0x16;
pub const ADDR_ADC_ASSIGN: u8 = 0x1C;
pub const ADDR_CW: u8 = 0x1E;
pub const ADDR_CW_TIMING: u8 = 0x20;
pub const ADDR_EER: u8 = 0x22;
pub const ADDR_ORION2: u8 = 0x24;
pub const ADDR_HL2_LATENCY: u8 = 0x2E;
pub const ADDR_HL2_I2C: u8 = HL2_I2C_BUS << 1;

const C0_MOX: u8 = 0x01;

// -- Status block bits --------------------------------------------------------

const C1_CONFIG_BOTH: u8 = 0x60;
const C1_MIC_PENELOPE: u8 = 0x80;
const C1_CLOCK_122_MERCURY: u8 = 0x10;
const C2_CLASS_E: u8 = 0x01;
const C3_PREAMP: u8 = 0x04;
const C3_DITHER: u8 = 0x08;
const C3_RANDOM: u8 = 0x10;
const C4_DUPLEX: u8 = 0x04;

// -- Command bits -------------------------------------------------------------

const DRIVE_C2_MIC_BOOST: u8 = 0x01;
const DRIVE_C2_LINE_IN: u8 = 0x02;
const DRIVE_C2_HL2_PA: u8 = 0x08;
const DRIVE_C3_6M_PREAMP: u8 = 0x40;
const DRIVE_C3_TR_DISABLE: u8 = 0x80;
const PREAMP_C1_TIP_RING: u8 = 0x10;
const PREAMP_C1_MIC_BIAS: u8 = 0x20;
const PREAMP_C1_PTT_DISABLE: u8 = 0x40;
const PREAMP_C2_PURESIGNAL: u8 = 0x40;
const ATT_ENABLE: u8 = 0x20;
const HL2_LNA_ENABLE: u8 = 0x40;
const KEYER_C2_REVERSED: u8 = 0x40;
const KEYER_C4_SPACING: u8 = 0x80;
const ORION2_C1_XVTR: u8 = 0x20;
const ORION2_C1_RX2_GROUND: u8 = 0x80;

// -- HL2 I/O board ------------------------------------------------------------

const IO_REG_FREQ: u8 = 9;
const IO_REG_RF_INPUT: u8 = 13;
/// Cycles between board id queries while no board has answered.
const IO_QUERY_INTERVAL: u64 = 16;

/// One step of the HL2 I/O board sub-sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoStep {
    QueryId,
    /// Byte `n` (0 = MSB) of the TX frequency.
    Frequency(u8),
    RfInput,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    TxFrequency,
    RxFrequency(u8),
    Drive,
    Preamp,
    AttenuatorKeyer,
    AdcAssign,
    CwConfig,
    CwTiming,
    Eer,
    OrionII,
    Hl2Latency,
    Hl2Io(IoStep),
}

impl Command {
    /// C0 address without the MOX bit.
    pub fn address(self) -> u8 {
        match self {
            Self::TxFrequency => ADDR_TX_FREQ,
            Self::RxFrequency(ddc) => ADDR_RX_FREQ + 2 * ddc,
            Self::Drive => ADDR_DRIVE,
            Self::Preamp => ADDR_PREAMP,
            Self::AttenuatorKeyer => ADDR_ATT_KEYER,
            Self::AdcAssign => ADDR_ADC_ASSIGN,
            Self::CwConfig => ADDR_CW,
            Self::CwTiming => ADDR_CW_TIMING,
            Self::Eer => ADDR_EER,
            Self::OrionII => ADDR_ORION2,
            Self::Hl2Latency => ADDR_HL2_LATENCY,
            Self::Hl2Io(_) => ADDR_HL2_I2C,
        }
    }
}

/// Everything the encoder reads for one block.
#[derive(Debug, Clone, Copy)]
pub struct EncodeContext<'a> {
    pub settings: &'a RadioSettings,
    /// Software TX state.
    pub mox: bool,
    /// PTT reported by the radio in its last control block.
    pub radio_ptt: bool,
    pub io_board_detected: bool,
    pub now: Instant,
}

/// Command list for one cycle.
pub fn command_cycle(ctx: &EncodeContext<'_>, cycle_number: u64) -> Vec<Command> {
    let s = ctx.settings;
    let mut cycle = vec![Command::TxFrequency];
    cycle.extend((0..s.ddc_count()).map(Command::RxFrequency));
    cycle.extend([
        Command::Drive,
        Command::Preamp,
        Command::AttenuatorKeyer,
        Command::AdcAssign,
        Command::CwConfig,
        Command::CwTiming,
        Command::Eer,
        Command::OrionII,
    ]);
    if s.device == DeviceType::HermesLite2 {
        cycle.push(Command::Hl2Latency);
        if s.hermes_lite.io_board {
            if ctx.io_board_detected {
                cycle.extend((0..4).map(|n| Command::Hl2Io(IoStep::Frequency(n))));
                cycle.push(Command::Hl2Io(IoStep::RfInput));
            } else if cycle_number % IO_QUERY_INTERVAL == 0 {
                cycle.push(Command::Hl2Io(IoStep::QueryId));
            }
        }
    }
    cycle
}

fn transmitting_path(ctx: &EncodeContext<'_>) -> bool {
    ctx.mox || ctx.radio_ptt
}

fn out_of_band(s: &RadioSettings) -> bool {
    !s.tx_out_of_band && !s.band.contains(s.tx_frequency)
}

/// RX antenna selection for the Alex RX input bits in C3.
///
/// Antennas 0..2 are ANT1..ANT3 and only move the TX relay; the rest map
/// onto the RX-only inputs. Some board variants lack an input and fall
/// back to the nearest one that exists.
fn rx_input_bits(s: &RadioSettings, antenna: u8) -> u8 {
    let mut key = antenna as u32;
    if s.device == DeviceType::OrionMkII {
        key += 100;
    } else if s.new_pa_board {
        key += 1000;
    }
    match key {
        // EXT1
        3 | 1003 => 0xC0,
        // EXT2
        4 | 1004 => 0xA0,
        // no EXT2 on Orion-II, use EXT1
        103 | 104 => 0xC0,
        // XVTR
        5 | 105 => 0xE0,
        // no XVTR input on the new PA board, use EXT1
        1005 => 0xC0,
        // RX bypass
        6 | 106 | 1006 => 0x80,
        _ => 0x00,
    }
}

fn status_block(ctx: &EncodeContext<'_>, oc: u8) -> ControlBlock {
    let s = ctx.settings;
    let nddc = s.ddc_count();

    let mut c1 = sample_rate_to_code(s.sample_rate) & 0x03;
    c1 |= (s.atlas.clock_10mhz & 0x03) << 2;
    if s.atlas.clock_122mhz_mercury {
        c1 |= C1_CLOCK_122_MERCURY;
    }
    c1 |= C1_CONFIG_BOTH;
    if s.atlas.penelope_mic {
        c1 |= C1_MIC_PENELOPE;
    }

    let mut c2 = (oc & 0x7F) << 1;
    if s.eer.enabled {
        c2 |= C2_CLASS_E;
    }

    let rx_adc = &s.adc[(s.receiver[0].adc as usize).min(2)];
    let mut c3 = rx_adc.alex_attenuation & 0x03;
    let active_adcs = s.receiver[..s.receivers.clamp(1, 2) as usize]
        .iter()
        .map(|r| &s.adc[(r.adc as usize).min(2)]);
    for adc in active_adcs {
        if adc.preamp {
            c3 |= C3_PREAMP;
        }
        if adc.dither {
            c3 |= C3_DITHER;
        }
        if adc.random {
            c3 |= C3_RANDOM;
        }
    }
    c3 |= rx_input_bits(s, rx_adc.antenna);

    // The relay follows the radio's PTT line before our own MOX catches up.
    let relay = if transmitting_path(ctx) || rx_adc.antenna > 2 {
        s.tx_antenna
    } else {
        rx_adc.antenna
    };
    let c4 = (relay.min(2) & 0x03) | C4_DUPLEX | ((nddc.saturating_sub(1) & 0x07) << 3);

    ControlBlock::new(ADDR_STATUS, c1, c2, c3, c4)
}

fn rx_frequency(s: &RadioSettings, ddc: u8) -> u64 {
    if s.puresignal_active() {
        let fb = s.device.rx_feedback_channel();
        if fb.is_some_and(|r| ddc >= r) {
            return s.tx_frequency;
        }
    }
    if s.diversity.enabled && ddc == 1 {
        return s.receiver[0].frequency;
    }
    match ddc {
        0 => s.receiver[0].frequency,
        1 if s.receivers > 1 => s.receiver[1].frequency,
        _ => s.receiver[0].frequency,
    }
}

fn ddc_adc(s: &RadioSettings, ddc: u8) -> u8 {
    match ddc {
        0 => s.receiver[0].adc,
        1 if s.receivers > 1 || s.diversity.enabled => s.receiver[1].adc,
        _ => 0,
    }
}

fn frequency_block(addr: u8, hz: u64) -> ControlBlock {
    let [c1, c2, c3, c4] = (hz.min(u32::MAX as u64) as u32).to_be_bytes();
    ControlBlock::new(addr, c1, c2, c3, c4)
}

fn io_write(register: u8, data: u8) -> ControlBlock {
    ControlBlock::new(ADDR_HL2_I2C, I2C_WRITE, IO_BOARD_ADDR, register, data)
}

/// Encode one command from the current settings.
pub fn encode_command(cmd: Command, ctx: &EncodeContext<'_>) -> ControlBlock {
    let s = ctx.settings;
    let addr = cmd.address();
    match cmd {
        Command::TxFrequency => frequency_block(addr, s.tx_frequency),
        Command::RxFrequency(ddc) => frequency_block(addr, rx_frequency(s, ddc)),
        Command::Drive => {
            let drive = if out_of_band(s) { 0 } else { s.drive };
            let mut c2 = 0;
            if s.mic_boost {
                c2 |= DRIVE_C2_MIC_BOOST;
            }
            if s.line_in {
                c2 |= DRIVE_C2_LINE_IN;
            }
            if s.device.is_hermes_lite() && s.hermes_lite.pa_enable {
                c2 |= DRIVE_C2_HL2_PA;
            }
            let mut c3 = s.alex_hpf & 0x3F;
            if s.alex_6m_preamp {
                c3 |= DRIVE_C3_6M_PREAMP;
            }
            if s.alex_tr_relay_disable {
                c3 |= DRIVE_C3_TR_DISABLE;
            }
            ControlBlock::new(addr, drive, c2, c3, s.alex_lpf & 0x7F)
        }
        Command::Preamp => {
            let mut c1 = 0;
            for (n, adc) in s.adc.iter().enumerate() {
                if adc.preamp {
                    c1 |= 1 << n;
                }
            }
            if s.mic_tip_ring {
                c1 |= PREAMP_C1_TIP_RING;
            }
            if s.mic_bias {
                c1 |= PREAMP_C1_MIC_BIAS;
            }
            if s.mic_ptt_disable {
                c1 |= PREAMP_C1_PTT_DISABLE;
            }
            let mut c2 = s.line_in_gain & 0x1F;
            if s.puresignal_active() {
                c2 |= PREAMP_C2_PURESIGNAL;
            }
            let c4 = if s.device.is_hermes_lite() {
                HL2_LNA_ENABLE | ((s.hermes_lite.lna_gain as i16 + 12) as u8 & 0x3F)
            } else if ctx.mox && s.puresignal_active() {
                ATT_ENABLE | (s.tx_attenuation & 0x1F)
            } else {
                ATT_ENABLE | (s.adc[0].attenuation & 0x1F)
            };
            ControlBlock::new(addr, c1, c2, s.user_outputs & 0x0F, c4)
        }
        Command::AttenuatorKeyer => {
            let c1 = ATT_ENABLE | (s.adc[1].attenuation & 0x1F);
            let mut c2 = ATT_ENABLE | (s.adc[2].attenuation & 0x1F);
            if s.cw.reversed {
                c2 |= KEYER_C2_REVERSED;
            }
            let c3 = (s.cw.speed & 0x3F) | ((s.cw.mode & 0x03) << 6);
            let mut c4 = s.cw.weight & 0x7F;
            if s.cw.spacing {
                c4 |= KEYER_C4_SPACING;
            }
            ControlBlock::new(addr, c1, c2, c3, c4)
        }
        Command::AdcAssign => {
            let mut c1 = 0;
            let mut c2 = 0;
            for ddc in 0..s.ddc_count() {
                let adc = ddc_adc(s, ddc) & 0x03;
                if ddc < 4 {
                    c1 |= adc << (2 * ddc);
                } else {
                    c2 |= adc << (2 * (ddc - 4));
                }
            }
            ControlBlock::new(addr, c1, c2, s.tx_attenuation & 0x1F, 0)
        }
        Command::CwConfig => {
            let internal = u8::from(s.cw_mode && s.cw.internal);
            // Longer RF delays upset the iambic keyer of some firmware.
            let max_delay = 900 / s.cw.speed.max(1) as u16;
            let delay = (s.cw.ptt_delay as u16).min(max_delay) as u8;
            ControlBlock::new(addr, internal, s.cw.sidetone_volume, delay, 0)
        }
        Command::CwTiming => {
            let hang = s.cw.hang_time.min(1023);
            let tone = s.cw.sidetone_frequency.min(4095);
            ControlBlock::new(
                addr,
                (hang >> 2) as u8,
                (hang & 0x03) as u8,
                (tone >> 4) as u8,
                (tone & 0x0F) as u8,
            )
        }
        Command::Eer => {
            let min = s.eer.pwm_min.min(1023);
            let max = s.eer.pwm_max.min(1023);
            ControlBlock::new(
                addr,
                (min >> 2) as u8,
                (min & 0x03) as u8,
                (max >> 2) as u8,
                (max & 0x03) as u8,
            )
        }
        Command::OrionII => {
            let mut c1 = 0;
            if s.device == DeviceType::OrionMkII {
                if s.orion2.xvtr_enable {
                    c1 |= ORION2_C1_XVTR;
                }
                if s.orion2.rx2_ground_on_tx {
                    c1 |= ORION2_C1_RX2_GROUND;
                }
            }
            ControlBlock::new(addr, c1, 0, 0, 0)
        }
        Command::Hl2Latency => ControlBlock::new(
            addr,
            0,
            0,
            s.hermes_lite.ptt_hang & 0x1F,
            s.hermes_lite.tx_latency & 0x7F,
        ),
        Command::Hl2Io(IoStep::QueryId) => {
            ControlBlock::new(ADDR_HL2_I2C, I2C_READ, IO_BOARD_ADDR, IO_REG_VERSION, 0)
        }
        Command::Hl2Io(IoStep::Frequency(n)) => {
            let bytes = (s.tx_frequency.min(u32::MAX as u64) as u32).to_be_bytes();
            io_write(IO_REG_FREQ + n, bytes[(n as usize).min(3)])
        }
        Command::Hl2Io(IoStep::RfInput) => {
            let mode = if s.puresignal_active() {
                2
            } else {
                match s.adc[0].antenna {
                    3 | 4 => 1,
                    _ => 0,
                }
            };
            io_write(IO_REG_RF_INPUT, mode)
        }
    }
}

/// Produces the alternating status/command block stream.
#[derive(Debug)]
pub struct ControlEncoder {
    cycle: Vec<Command>,
    index: usize,
    cycles_completed: u64,
    status_next: bool,
    tune_started: Option<Instant>,
}

impl Default for ControlEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlEncoder {
    pub fn new() -> Self {
        Self {
            cycle: Vec::new(),
            index: 0,
            cycles_completed: 0,
            status_next: true,
            tune_started: None,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Number of complete command cycles emitted so far.
    pub fn cycles_completed(&self) -> u64 {
        self.cycles_completed
    }

    /// Blocks for the two sub-buffers of the next frame.
    pub fn frame_blocks(&mut self, ctx: &EncodeContext<'_>) -> [ControlBlock; 2] {
        [self.next_block(ctx), self.next_block(ctx)]
    }

    pub fn next_block(&mut self, ctx: &EncodeContext<'_>) -> ControlBlock {
        self.track_tune(ctx);
        let status = self.status_next;
        self.status_next = !status;
        let mut block = if status {
            status_block(ctx, self.oc_outputs(ctx))
        } else {
            self.next_command(ctx)
        };
        if ctx.mox {
            block.0[0] |= C0_MOX;
        }
        block
    }

    fn next_command(&mut self, ctx: &EncodeContext<'_>) -> ControlBlock {
        if self.index >= self.cycle.len() {
            self.cycle = command_cycle(ctx, self.cycles_completed);
            self.index = 0;
        }
        let cmd = self.cycle[self.index];
        self.index += 1;
        if self.index == self.cycle.len() {
            self.cycles_completed += 1;
        }
        log::trace!("P1 command {:?}", cmd);
        encode_command(cmd, ctx)
    }

    fn track_tune(&mut self, ctx: &EncodeContext<'_>) {
        match (ctx.settings.tune && ctx.mox, self.tune_started) {
            (true, None) => self.tune_started = Some(ctx.now),
            (false, Some(_)) => self.tune_started = None,
            _ => {}
        }
    }

    fn oc_outputs(&self, ctx: &EncodeContext<'_>) -> u8 {
        let oc = &ctx.settings.oc;
        if !transmitting_path(ctx) {
            return oc.rx;
        }
        let in_tune_window = self.tune_started.is_some_and(|start| {
            oc.memory_tune_ms == 0
                || ctx.now.saturating_duration_since(start).as_millis() < oc.memory_tune_ms as u128
        });
        if in_tune_window {
            oc.tune
        } else {
            oc.tx
        }
    }
}
