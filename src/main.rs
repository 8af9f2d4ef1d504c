use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use clap::Parser;
use num_complex::Complex;

use hpsdr_link::discovery::{broadcast_target, discover};
use hpsdr_link::pacer::TxStream;
use hpsdr_link::protocol1::Protocol1Session;
use hpsdr_link::radio::DeviceType;
use hpsdr_link::settings::{RadioSettings, TransportKind};
use hpsdr_link::sink::{diversity_combine, DspSink};
use hpsdr_link::transport::RADIO_PORT;

#[derive(Parser)]
#[command(name = "hpsdr-link", about = "HPSDR Protocol 1 host link (Rust)")]
struct Cli {
    /// Radio address (ip or ip:port). Discovered if omitted.
    #[arg(long)]
    radio: Option<String>,

    /// List radios on the local network and exit
    #[arg(long)]
    discover: bool,

    /// Radio hardware type, overrides discovery and settings
    #[arg(long, value_parser = parse_device)]
    device: Option<DeviceType>,

    /// Use the TCP data connection instead of UDP
    #[arg(long)]
    tcp: bool,

    /// Number of receivers (1 or 2)
    #[arg(long)]
    receivers: Option<u8>,

    /// RX sample rate in Hz (48000, 96000, 192000 or 384000)
    #[arg(long)]
    sample_rate: Option<u32>,

    /// TOML settings file
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Seconds between statistics lines
    #[arg(long, default_value = "5")]
    stats_interval: u64,

    /// SoapySDR device arguments; streams from SoapySDR instead of Protocol 1
    #[cfg(feature = "soapysdr")]
    #[arg(long)]
    soapy: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn parse_device(s: &str) -> Result<DeviceType, String> {
    DeviceType::from_name(s).ok_or_else(|| {
        format!(
            "unknown device '{}'. Valid: {}",
            s,
            DeviceType::all_names().join(", ")
        )
    })
}

fn parse_address(s: &str) -> Result<SocketAddr, String> {
    if let Ok(addr) = s.parse::<SocketAddr>() {
        return Ok(addr);
    }
    s.parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, RADIO_PORT))
        .map_err(|e| format!("bad radio address '{}': {}", s, e))
}

// -- Sample meter ------------------------------------------------------------

#[derive(Default)]
struct Meter {
    iq: [AtomicU64; 2],
    mic: AtomicU64,
    ps: AtomicU64,
    /// Peak magnitude of receiver 0 since the last report, as f64 bits.
    peak: AtomicU64,
}

impl Meter {
    fn take_peak(&self) -> f64 {
        f64::from_bits(self.peak.swap(0, Ordering::Relaxed))
    }
}

/// Stand-in for a DSP engine: counts what arrives and answers every
/// 48 kHz mic tick with one silent audio sample, so the TX path runs at
/// the radio's codec rate.
struct MeterSink {
    meter: Arc<Meter>,
    tx: Arc<OnceLock<TxStream>>,
    diversity_gain: f64,
    diversity_phase: f64,
}

impl DspSink for MeterSink {
    fn add_iq_samples(&mut self, rx: usize, iq: Complex<f64>) {
        if let Some(count) = self.meter.iq.get(rx) {
            count.fetch_add(1, Ordering::Relaxed);
        }
        if rx == 0 {
            let level = iq.norm();
            let _ = self
                .meter
                .peak
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                    (level > f64::from_bits(bits)).then(|| level.to_bits())
                });
        }
    }

    fn add_mic_sample(&mut self, _sample: f64) {
        self.meter.mic.fetch_add(1, Ordering::Relaxed);
        if let Some(tx) = self.tx.get() {
            tx.audio_samples(0.0, 0.0);
        }
    }

    fn add_ps_iq_samples(&mut self, _reference: Complex<f64>, _feedback: Complex<f64>) {
        self.meter.ps.fetch_add(1, Ordering::Relaxed);
    }

    fn add_diversity_samples(&mut self, main: Complex<f64>, aux: Complex<f64>) {
        let combined = diversity_combine(main, aux, self.diversity_gain, self.diversity_phase);
        self.add_iq_samples(0, combined);
    }
}

#[cfg(feature = "soapysdr")]
async fn run_soapy(args: &str, cli: &Cli, settings: &RadioSettings) {
    use hpsdr_link::soapy::device::SoapySdrDevice;
    use hpsdr_link::soapy::{SoapyAdapter, SoapyConfig};

    let config = SoapyConfig {
        args: args.to_string(),
        sample_rate: cli.sample_rate.unwrap_or(settings.sample_rate),
        ..Default::default()
    };
    // Without a configured device there is nothing to stream.
    let device = match SoapySdrDevice::open(&config) {
        Ok(device) => device,
        Err(e) => {
            log::error!("{}", e);
            std::process::exit(1);
        }
    };
    let meter = Arc::new(Meter::default());
    let sink = MeterSink {
        meter: meter.clone(),
        tx: Arc::new(OnceLock::new()),
        diversity_gain: settings.diversity.gain,
        diversity_phase: settings.diversity.phase,
    };
    let mut adapter = SoapyAdapter::new(device, config, Box::new(sink), None);
    if let Err(e) = adapter.set_rx_frequency(settings.receiver[0].frequency as f64) {
        log::warn!("{}", e);
    }
    if let Err(e) = adapter.start() {
        eprintln!("{}", e);
        std::process::exit(1);
    }

    let mut ticker = tokio::time::interval(Duration::from_secs(cli.stats_interval.max(1)));
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                log::info!(
                    "iq {}, peak {:.3}",
                    meter.iq[0].load(Ordering::Relaxed),
                    meter.take_peak(),
                );
            }
            _ = tokio::signal::ctrl_c() => {
                log::info!("Shutting down...");
                break;
            }
        }
    }
    if let Err(e) = adapter.stop() {
        log::warn!("{}", e);
    }
}

// -- Main ------------------------------------------------------------------

async fn list_radios() -> Vec<hpsdr_link::discovery::Device> {
    match discover(broadcast_target(), Duration::from_secs(1)).await {
        Ok(found) => found,
        Err(e) => {
            log::error!("Discovery failed: {}", e);
            Vec::new()
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Init logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp_secs()
        .init();

    let mut settings = match &cli.settings {
        Some(path) => match RadioSettings::load(path) {
            Ok(s) => s,
            Err(e) => {
                eprintln!("{}", e);
                std::process::exit(1);
            }
        },
        None => RadioSettings::default(),
    };

    if cli.discover {
        for dev in list_radios().await {
            println!(
                "{}  {}  fw {}  {}",
                dev.address,
                dev.mac.iter().map(|b| format!("{:02x}", b)).collect::<Vec<_>>().join(":"),
                dev.firmware,
                match dev.device {
                    Some(d) => d.to_string(),
                    None => format!("board {}", dev.board),
                }
            );
        }
        return;
    }

    #[cfg(feature = "soapysdr")]
    if let Some(args) = &cli.soapy {
        run_soapy(args, &cli, &settings).await;
        return;
    }

    let radio = match &cli.radio {
        Some(s) => match parse_address(s) {
            Ok(addr) => addr,
            Err(e) => {
                eprintln!("{}", e);
                std::process::exit(1);
            }
        },
        None => {
            let Some(dev) = list_radios().await.into_iter().find(|d| !d.busy) else {
                eprintln!("No idle radio found; use --radio");
                std::process::exit(1);
            };
            if let Some(device) = dev.device {
                settings.device = device;
            }
            dev.address
        }
    };

    if let Some(device) = cli.device {
        settings.device = device;
    }
    if cli.tcp {
        settings.transport = TransportKind::Tcp;
    }
    if let Some(n) = cli.receivers {
        settings.receivers = n;
    }
    if let Some(rate) = cli.sample_rate {
        settings.sample_rate = rate;
    }

    log::info!(
        "Connecting to {} at {}: {} receiver(s) @ {} Hz over {:?}",
        settings.device,
        radio,
        settings.receivers,
        settings.sample_rate,
        settings.transport,
    );

    let meter = Arc::new(Meter::default());
    let tx_slot = Arc::new(OnceLock::new());
    let sink = MeterSink {
        meter: meter.clone(),
        tx: tx_slot.clone(),
        diversity_gain: settings.diversity.gain,
        diversity_phase: settings.diversity.phase,
    };
    let mut session = Protocol1Session::new(radio, settings.into_shared(), Box::new(sink), None);
    let _ = tx_slot.set(session.tx_stream());

    if let Err(e) = session.start().await {
        eprintln!("{}", e);
        std::process::exit(1);
    }

    let state = session.state();
    let mut ticker = tokio::time::interval(Duration::from_secs(cli.stats_interval.max(1)));
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let s = state.stats();
                log::info!(
                    "rx {} frames, tx {} frames, iq {}/{}, mic {}, peak {:.3}, seq err {}, sync err {}, overflows {}/{}",
                    s.frames_received,
                    s.frames_sent,
                    meter.iq[0].load(Ordering::Relaxed),
                    meter.iq[1].load(Ordering::Relaxed),
                    meter.mic.load(Ordering::Relaxed),
                    meter.take_peak(),
                    s.sequence_errors,
                    s.sync_errors,
                    s.rx_overflows,
                    s.tx_overflows,
                );
                if state.status.adc_overload.load(Ordering::Relaxed) {
                    log::warn!("ADC overload");
                    state.status.clear_overload();
                }
            }
            _ = tokio::signal::ctrl_c() => {
                log::info!("Shutting down...");
                break;
            }
        }
    }

    if let Err(e) = session.stop().await {
        log::warn!("{}", e);
    }
}
