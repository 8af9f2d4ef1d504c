use std::fmt;

use num_complex::Complex;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Device type
// ---------------------------------------------------------------------------

/// HPSDR board families spoken to over Protocol 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Metis,
    Hermes,
    HermesII,
    Angelia,
    Orion,
    OrionMkII,
    HermesLite,
    HermesLite2,
}

/// RX frequency registers in the C&C address map (0x04..=0x10).
pub const MAX_P1_DDCS: u8 = 7;

impl DeviceType {
    /// Board id as reported in byte 10 of a discovery reply.
    pub fn code(self) -> u8 {
        match self {
            Self::Metis => 0x00,
            Self::Hermes => 0x01,
            Self::HermesII => 0x02,
            Self::Angelia => 0x04,
            Self::Orion => 0x05,
            Self::HermesLite | Self::HermesLite2 => 0x06,
            Self::OrionMkII => 0x0A,
        }
    }

    /// Map a discovery board id (and firmware version, which separates
    /// HL1 from HL2) back to a device type.
    pub fn from_code(code: u8, firmware: u8) -> Option<Self> {
        match code {
            0x00 => Some(Self::Metis),
            0x01 => Some(Self::Hermes),
            0x02 => Some(Self::HermesII),
            0x04 => Some(Self::Angelia),
            0x05 => Some(Self::Orion),
            0x06 if firmware >= 40 => Some(Self::HermesLite2),
            0x06 => Some(Self::HermesLite),
            0x0A => Some(Self::OrionMkII),
            _ => None,
        }
    }

    /// Maximum number of DDCs the firmware streams in Protocol 1. Never
    /// above [`MAX_P1_DDCS`]: Protocol 1 has no frequency register for
    /// an eighth DDC.
    pub fn max_ddcs(self) -> u8 {
        match self {
            Self::Metis => 4,
            Self::Hermes => 4,
            Self::HermesII => 4,
            Self::Angelia => 5,
            Self::Orion => 5,
            Self::OrionMkII => 7,
            Self::HermesLite => 2,
            Self::HermesLite2 => 4,
        }
    }

    /// DDC that carries the PureSignal reference (attenuated TX) signal.
    pub fn rx_feedback_channel(self) -> Option<u8> {
        match self {
            Self::Hermes | Self::HermesII | Self::HermesLite2 => Some(2),
            Self::Angelia | Self::Orion | Self::OrionMkII => Some(3),
            Self::Metis | Self::HermesLite => None,
        }
    }

    /// DDC that carries the PureSignal feedback (PA output) signal.
    pub fn tx_feedback_channel(self) -> Option<u8> {
        self.rx_feedback_channel().map(|c| c + 1)
    }

    pub fn supports_puresignal(self) -> bool {
        self.rx_feedback_channel().is_some()
    }

    pub fn is_hermes_lite(self) -> bool {
        matches!(self, Self::HermesLite | Self::HermesLite2)
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "metis" => Some(Self::Metis),
            "hermes" => Some(Self::Hermes),
            "hermesii" => Some(Self::HermesII),
            "angelia" => Some(Self::Angelia),
            "orion" => Some(Self::Orion),
            "orionmkii" => Some(Self::OrionMkII),
            "hermeslite" => Some(Self::HermesLite),
            "hermeslite2" => Some(Self::HermesLite2),
            _ => None,
        }
    }

    pub fn all_names() -> &'static [&'static str] {
        &[
            "metis",
            "hermes",
            "hermesii",
            "angelia",
            "orion",
            "orionmkii",
            "hermeslite",
            "hermeslite2",
        ]
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Metis => "METIS",
            Self::Hermes => "HERMES",
            Self::HermesII => "HERMESII",
            Self::Angelia => "ANGELIA",
            Self::Orion => "ORION",
            Self::OrionMkII => "ORIONMKII",
            Self::HermesLite => "HERMESLITE",
            Self::HermesLite2 => "HERMESLITE2",
        };
        write!(f, "{}", name)
    }
}

// ---------------------------------------------------------------------------
// Sample rates
// ---------------------------------------------------------------------------

/// Rates selectable in C1 bits 0..1 of the status block.
pub const RX_SAMPLE_RATES: [u32; 4] = [48_000, 96_000, 192_000, 384_000];

/// Rate code for C1. Unknown rates fall back to 48 kHz.
pub fn sample_rate_to_code(rate: u32) -> u8 {
    RX_SAMPLE_RATES
        .iter()
        .position(|&r| r == rate)
        .map_or(0, |code| code as u8)
}

pub fn code_to_sample_rate(code: u8) -> Option<u32> {
    RX_SAMPLE_RATES.get(code as usize).copied()
}

// ---------------------------------------------------------------------------
// Sample packing / unpacking
// ---------------------------------------------------------------------------

/// Full-scale value of a signed 24-bit sample.
pub const IQ_SCALE: f64 = 8_388_607.0;
/// Full-scale value of a signed 16-bit microphone sample.
pub const MIC_SCALE: f64 = 32_768.0;

/// Sign-extend a big-endian 24-bit value.
#[inline]
pub fn i24_from_be(hi: u8, mid: u8, lo: u8) -> i32 {
    (u32::from_be_bytes([hi, mid, lo, 0]) as i32) >> 8
}

/// Write `sample` as two big-endian 24-bit words at `offset`, the layout of
/// an EP6 receiver slot. Returns the offset past it.
#[inline]
pub fn pack_iq_24bit_into(buf: &mut [u8], offset: usize, sample: Complex<f64>) -> usize {
    let iv = (sample.re.clamp(-1.0, 1.0) * IQ_SCALE) as i32;
    let qv = (sample.im.clamp(-1.0, 1.0) * IQ_SCALE) as i32;
    buf[offset..offset + 3].copy_from_slice(&iv.to_be_bytes()[1..]);
    buf[offset + 3..offset + 6].copy_from_slice(&qv.to_be_bytes()[1..]);
    offset + 6
}

/// Convert a float in [-1, 1] to a big-endian 16-bit sample.
#[inline]
pub fn i16_be(value: f64) -> [u8; 2] {
    ((value.clamp(-1.0, 1.0) * 32767.0) as i16).to_be_bytes()
}

/// Decode a host-to-radio payload into `(L + jR, I + jQ)` per 8-byte
/// group.
pub fn unpack_tx_16bit(data: &[u8]) -> Vec<(Complex<f64>, Complex<f64>)> {
    let word = |b: &[u8], k: usize| i16::from_be_bytes([b[2 * k], b[2 * k + 1]]) as f64 / MIC_SCALE;
    data.chunks_exact(8)
        .map(|g| {
            (
                Complex::new(word(g, 0), word(g, 1)),
                Complex::new(word(g, 2), word(g, 3)),
            )
        })
        .collect()
}
