//! Radio settings read by the protocol engine.
//!
//! The surrounding application owns one [`RadioSettings`] behind an
//! `Arc<Mutex<_>>` and mutates it from its event handlers. The encoder and
//! the decoder only ever take short snapshots of it.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::radio::DeviceType;

pub type SharedSettings = Arc<Mutex<RadioSettings>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Udp,
    Tcp,
}

/// Per-ADC front end settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdcSettings {
    /// 0..2 = ANT1..ANT3, 3 = EXT1, 4 = EXT2, 5 = XVTR, 6 = RX bypass.
    pub antenna: u8,
    /// Step attenuator in dB (0..31).
    pub attenuation: u8,
    /// Alex attenuator code: 0 = 0 dB, 1 = 10 dB, 2 = 20 dB, 3 = 30 dB.
    pub alex_attenuation: u8,
    pub preamp: bool,
    pub dither: bool,
    pub random: bool,
}

impl Default for AdcSettings {
    fn default() -> Self {
        Self {
            antenna: 0,
            attenuation: 0,
            alex_attenuation: 0,
            preamp: false,
            dither: false,
            random: false,
        }
    }
}

/// One logical receiver as seen by the DSP engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiverSettings {
    /// Frequency in Hz with CTUN/RIT offsets already applied.
    pub frequency: u64,
    /// ADC feeding this receiver's DDC.
    pub adc: u8,
}

impl Default for ReceiverSettings {
    fn default() -> Self {
        Self {
            frequency: 14_200_000,
            adc: 0,
        }
    }
}

/// Regulatory edges of the band the transmitter is currently in.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BandLimits {
    pub min: u64,
    pub max: u64,
}

impl BandLimits {
    pub fn contains(&self, frequency: u64) -> bool {
        frequency >= self.min && frequency <= self.max
    }
}

impl Default for BandLimits {
    fn default() -> Self {
        Self {
            min: 14_000_000,
            max: 14_350_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CwKeyer {
    /// Use the firmware keyer instead of host-side keying.
    pub internal: bool,
    /// Keyer speed in WPM (1..60).
    pub speed: u8,
    /// 0 = straight, 1 = iambic A, 2 = iambic B.
    pub mode: u8,
    pub weight: u8,
    pub spacing: bool,
    pub reversed: bool,
    pub sidetone_volume: u8,
    pub sidetone_frequency: u16,
    /// Break-in hang time in ms.
    pub hang_time: u16,
    /// PTT to RF delay in ms.
    pub ptt_delay: u8,
}

impl Default for CwKeyer {
    fn default() -> Self {
        Self {
            internal: true,
            speed: 20,
            mode: 1,
            weight: 50,
            spacing: false,
            reversed: false,
            sidetone_volume: 16,
            sidetone_frequency: 650,
            hang_time: 300,
            ptt_delay: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Diversity {
    pub enabled: bool,
    pub gain: f64,
    /// Phase of the auxiliary signal in degrees.
    pub phase: f64,
}

impl Default for Diversity {
    fn default() -> Self {
        Self {
            enabled: false,
            gain: 1.0,
            phase: 0.0,
        }
    }
}

/// Open collector outputs for the current band (bits 0..6).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OcOutputs {
    pub rx: u8,
    pub tx: u8,
    pub tune: u8,
    /// Length of the "memory tune" window in ms, 0 = for the whole tune.
    pub memory_tune_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EerLimits {
    pub enabled: bool,
    pub pwm_min: u16,
    pub pwm_max: u16,
}

impl Default for EerLimits {
    fn default() -> Self {
        Self {
            enabled: false,
            pwm_min: 100,
            pwm_max: 800,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrionIISettings {
    pub rx2_ground_on_tx: bool,
    pub xvtr_enable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HermesLiteSettings {
    /// LNA gain in dB (-12..48).
    pub lna_gain: i8,
    pub pa_enable: bool,
    pub ptt_hang: u8,
    pub tx_latency: u8,
    /// Probe for the auxiliary I/O board on the I2C bus.
    pub io_board: bool,
}

impl Default for HermesLiteSettings {
    fn default() -> Self {
        Self {
            lna_gain: 20,
            pa_enable: true,
            ptt_hang: 4,
            tx_latency: 40,
            io_board: true,
        }
    }
}

/// Adaptive sleep thresholds of the TX pacer, tuned against observed
/// hardware FIFO depths.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PacerTuning {
    /// Nominal TX sample rate used by the FIFO model.
    pub sample_rate: f64,
    pub fifo_high: f64,
    pub fifo_low: f64,
    pub sleep_long_us: u64,
    pub sleep_short_us: u64,
}

impl Default for PacerTuning {
    fn default() -> Self {
        Self {
            sample_rate: 48_000.0,
            fifo_high: 1500.0,
            fifo_low: 300.0,
            sleep_long_us: 2000,
            sleep_short_us: 500,
        }
    }
}

/// Atlas/Metis backplane options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AtlasSettings {
    /// Mic input on Penelope instead of Janus.
    pub penelope_mic: bool,
    /// 10 MHz reference: 0 = Atlas, 1 = Penelope, 2 = Mercury.
    pub clock_10mhz: u8,
    /// 122.88 MHz clock from Mercury instead of Penelope.
    pub clock_122mhz_mercury: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RadioSettings {
    pub device: DeviceType,
    pub transport: TransportKind,
    /// Logical receivers exposed to the DSP engine (1 or 2).
    pub receivers: u8,
    pub sample_rate: u32,
    pub wideband: bool,
    pub adc: [AdcSettings; 3],
    pub receiver: [ReceiverSettings; 2],
    /// TX frequency in Hz with XIT/split already applied.
    pub tx_frequency: u64,
    pub tx_antenna: u8,
    pub band: BandLimits,
    pub tx_out_of_band: bool,
    pub drive: u8,
    pub tune: bool,
    pub cw_mode: bool,
    pub cw: CwKeyer,
    pub puresignal: bool,
    /// Step attenuation applied to the feedback ADC while transmitting.
    pub tx_attenuation: u8,
    pub diversity: Diversity,
    pub oc: OcOutputs,
    pub eer: EerLimits,
    pub alex_hpf: u8,
    pub alex_lpf: u8,
    pub alex_6m_preamp: bool,
    pub alex_tr_relay_disable: bool,
    pub new_pa_board: bool,
    pub mic_boost: bool,
    pub line_in: bool,
    pub line_in_gain: u8,
    pub mic_ptt_disable: bool,
    pub mic_bias: bool,
    pub mic_tip_ring: bool,
    pub user_outputs: u8,
    pub atlas: AtlasSettings,
    pub orion2: OrionIISettings,
    pub hermes_lite: HermesLiteSettings,
    pub pacer: PacerTuning,
}

impl Default for RadioSettings {
    fn default() -> Self {
        Self {
            device: DeviceType::Hermes,
            transport: TransportKind::Udp,
            receivers: 1,
            sample_rate: 48000,
            wideband: false,
            adc: Default::default(),
            receiver: Default::default(),
            tx_frequency: 14_200_000,
            tx_antenna: 0,
            band: BandLimits::default(),
            tx_out_of_band: false,
            drive: 0,
            tune: false,
            cw_mode: false,
            cw: CwKeyer::default(),
            puresignal: false,
            tx_attenuation: 31,
            diversity: Diversity::default(),
            oc: OcOutputs::default(),
            eer: EerLimits::default(),
            alex_hpf: 0,
            alex_lpf: 0,
            alex_6m_preamp: false,
            alex_tr_relay_disable: false,
            new_pa_board: false,
            mic_boost: false,
            line_in: false,
            line_in_gain: 0,
            mic_ptt_disable: false,
            mic_bias: false,
            mic_tip_ring: false,
            user_outputs: 0,
            atlas: AtlasSettings::default(),
            orion2: OrionIISettings::default(),
            hermes_lite: HermesLiteSettings::default(),
            pacer: PacerTuning::default(),
        }
    }
}

impl RadioSettings {
    pub fn from_toml_str(text: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| Error::Config(path.to_path_buf(), e.to_string()))?;
        Self::from_toml_str(&text).map_err(|e| Error::Config(path.to_path_buf(), e.to_string()))
    }

    pub fn into_shared(self) -> SharedSettings {
        Arc::new(Mutex::new(self))
    }

    pub fn puresignal_active(&self) -> bool {
        self.puresignal && self.device.supports_puresignal()
    }

    /// Number of DDCs the radio must stream for the current feature set.
    pub fn ddc_count(&self) -> u8 {
        let mut n = self.receivers.clamp(1, 2);
        if self.diversity.enabled {
            n = 2;
        }
        if self.puresignal_active() {
            if let Some(tx_fb) = self.device.tx_feedback_channel() {
                n = n.max(tx_fb + 1);
            }
        }
        n.min(self.device.max_ddcs())
    }

    /// Microphone samples arrive at the RX sample rate; only every Nth is
    /// forwarded so the DSP engine sees 48 kHz.
    pub fn mic_sample_divisor(&self) -> u32 {
        (self.sample_rate / 48000).max(1)
    }

    pub fn validate(&self) -> Result<()> {
        let max = self.device.max_ddcs();
        if self.receivers == 0 || self.receivers > 2 || self.receivers > max {
            return Err(Error::UnsupportedReceivers {
                device: self.device,
                requested: self.receivers,
                max,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ddc_count_follows_features() {
        let mut s = RadioSettings::default();
        assert_eq!(s.ddc_count(), 1);
        s.diversity.enabled = true;
        assert_eq!(s.ddc_count(), 2);
        s.puresignal = true;
        assert_eq!(s.ddc_count(), 4);
        s.device = DeviceType::Orion;
        assert_eq!(s.ddc_count(), 5);
        s.device = DeviceType::HermesLite;
        assert_eq!(s.ddc_count(), 2);
    }

    #[test]
    fn mic_divisor_from_sample_rate() {
        let mut s = RadioSettings::default();
        assert_eq!(s.mic_sample_divisor(), 1);
        s.sample_rate = 384000;
        assert_eq!(s.mic_sample_divisor(), 8);
    }

    #[test]
    fn loads_partial_toml() {
        let s = RadioSettings::from_toml_str(
            r#"
            device = "orion"
            transport = "tcp"
            receivers = 2
            sample_rate = 192000

            [band]
            min = 7000000
            max = 7300000

            [cw]
            speed = 30
            "#,
        )
        .unwrap();
        assert_eq!(s.device, DeviceType::Orion);
        assert_eq!(s.transport, TransportKind::Tcp);
        assert_eq!(s.cw.speed, 30);
        assert_eq!(s.cw.mode, 1);
        assert!(s.band.contains(7_100_000));
        assert!(!s.band.contains(7_300_001));
    }

    #[test]
    fn rejects_too_many_receivers() {
        let mut s = RadioSettings::default();
        s.receivers = 3;
        assert!(matches!(
            s.validate(),
            Err(Error::UnsupportedReceivers { requested: 3, .. })
        ));
    }
}
