//! Streaming adapter for radios driven through SoapySDR.
//!
//! The wire-protocol layers are bypassed: a receive thread pulls blocks
//! of interleaved I/Q from the vendor stream and feeds the same
//! [`DspSink`] the Protocol 1 path uses, and [`SoapyTransmitter`] groups
//! outgoing samples into fixed blocks for the vendor write call.
//!
//! The vendor library is reached through the [`SoapyDevice`],
//! [`RxBlockStream`] and [`TxBlockStream`] traits. The implementation over
//! the `soapysdr` crate lives in [`device`] behind the `soapysdr` feature.

#[cfg(feature = "soapysdr")]
pub mod device;
mod resample;

pub use resample::Resampler;

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use num_complex::Complex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::routing::MicDecimator;
use crate::sink::{DspSink, LocalMicrophone};

/// Read/write timeout for every vendor stream call.
pub const STREAM_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamError {
    Timeout,
    Overflow,
    Other(i32),
}

/// Receive half of a vendor stream.
pub trait RxBlockStream: Send {
    /// Largest block the stream hands out in one read.
    fn mtu(&self) -> usize;
    /// Read up to `buf.len()` samples. Returns the number read.
    fn read(&mut self, buf: &mut [Complex<f32>], timeout: Duration) -> std::result::Result<usize, StreamError>;
}

/// Transmit half of a vendor stream.
pub trait TxBlockStream: Send {
    fn write(&mut self, buf: &[Complex<f32>], timeout: Duration) -> std::result::Result<usize, StreamError>;
}

/// Control surface of a vendor device. Setters are passed straight
/// through; nothing is queued.
pub trait SoapyDevice {
    fn rx_stream(&mut self, channel: usize) -> Result<Box<dyn RxBlockStream>>;
    fn tx_stream(&mut self, channel: usize) -> Result<Box<dyn TxBlockStream>>;
    fn set_rx_frequency(&mut self, channel: usize, hz: f64) -> Result<()>;
    fn set_tx_frequency(&mut self, hz: f64) -> Result<()>;
    fn set_rx_gain(&mut self, channel: usize, db: f64) -> Result<()>;
    fn set_tx_gain(&mut self, db: f64) -> Result<()>;
    fn set_rx_antenna(&mut self, channel: usize, name: &str) -> Result<()>;
    fn set_tx_antenna(&mut self, name: &str) -> Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SoapyConfig {
    /// SoapySDR device arguments, e.g. `driver=lime`.
    pub args: String,
    /// Rate the hardware streams at.
    pub hardware_rate: u32,
    /// Rate the DSP engine expects.
    pub sample_rate: u32,
    pub fft_size: usize,
    pub max_tx_samples: usize,
    pub rx_channel: usize,
    /// DSP receiver the samples are delivered to.
    pub receiver: usize,
}

impl Default for SoapyConfig {
    fn default() -> Self {
        Self {
            args: String::new(),
            hardware_rate: 768_000,
            sample_rate: 48_000,
            fft_size: 2048,
            max_tx_samples: 1024,
            rx_channel: 0,
            receiver: 0,
        }
    }
}

fn mic_divisor(sample_rate: u32) -> u32 {
    (sample_rate / 48_000).max(1)
}

type Parked = (Box<dyn DspSink>, Option<Box<dyn LocalMicrophone>>);

struct RxWorker {
    stream: Box<dyn RxBlockStream>,
    sink: Box<dyn DspSink>,
    local_mic: Option<Box<dyn LocalMicrophone>>,
    running: Arc<AtomicBool>,
    sample_rate: Arc<AtomicU32>,
    hardware_rate: u32,
    receiver: usize,
    block_len: usize,
}

impl RxWorker {
    fn run(mut self) -> Parked {
        let mut raw = vec![Complex::new(0.0f32, 0.0); self.block_len];
        let mut block = Vec::with_capacity(self.block_len);
        let mut converted = Vec::with_capacity(self.block_len);
        let mut resampler: Option<Resampler> = None;
        let mut rate = 0;
        let mut mic = MicDecimator::new(1);
        let mut failing = false;

        while self.running.load(Ordering::Acquire) {
            let n = match self.stream.read(&mut raw, STREAM_TIMEOUT) {
                Ok(n) => {
                    failing = false;
                    n
                }
                Err(StreamError::Timeout) => continue,
                Err(e) => {
                    if !failing {
                        log::warn!("soapy read failed: {:?}", e);
                        failing = true;
                    }
                    continue;
                }
            };

            let wanted = self.sample_rate.load(Ordering::Relaxed);
            if wanted != rate {
                rate = wanted;
                resampler = (rate != self.hardware_rate).then(|| Resampler::new(self.hardware_rate, rate));
                mic.set_divisor(mic_divisor(rate));
                log::info!("soapy RX {} Hz -> {} Hz", self.hardware_rate, rate);
            }

            block.clear();
            block.extend(raw[..n].iter().map(|s| Complex::new(s.re as f64, s.im as f64)));
            let samples = match resampler.as_mut() {
                Some(r) => {
                    converted.clear();
                    r.process(&block, &mut converted);
                    &converted
                }
                None => &block,
            };
            for &iq in samples {
                self.sink.add_iq_samples(self.receiver, iq);
                if let Some(sample) = mic.push(0.0, self.local_mic.as_deref_mut(), false) {
                    self.sink.add_mic_sample(sample);
                }
            }
        }
        log::debug!("soapy RX thread done");
        (self.sink, self.local_mic)
    }
}

/// Receive side of a SoapySDR radio plus the setter pass-through.
pub struct SoapyAdapter<D: SoapyDevice> {
    device: D,
    config: SoapyConfig,
    running: Arc<AtomicBool>,
    sample_rate: Arc<AtomicU32>,
    parked: Option<Parked>,
    worker: Option<JoinHandle<Parked>>,
}

impl<D: SoapyDevice> SoapyAdapter<D> {
    pub fn new(
        device: D,
        config: SoapyConfig,
        sink: Box<dyn DspSink>,
        local_mic: Option<Box<dyn LocalMicrophone>>,
    ) -> Self {
        Self {
            device,
            sample_rate: Arc::new(AtomicU32::new(config.sample_rate)),
            config,
            running: Arc::new(AtomicBool::new(false)),
            parked: Some((sink, local_mic)),
            worker: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    pub fn start(&mut self) -> Result<()> {
        if self.worker.is_some() {
            return Err(Error::AlreadyRunning);
        }
        let stream = self.device.rx_stream(self.config.rx_channel)?;
        let block_len = stream.mtu().min(2 * self.config.fft_size).max(1);
        let Some((sink, local_mic)) = self.parked.take() else {
            return Err(Error::AlreadyRunning);
        };
        self.running.store(true, Ordering::Release);
        let worker = RxWorker {
            stream,
            sink,
            local_mic,
            running: self.running.clone(),
            sample_rate: self.sample_rate.clone(),
            hardware_rate: self.config.hardware_rate,
            receiver: self.config.receiver,
            block_len,
        };
        let handle = thread::Builder::new()
            .name("soapy-rx".into())
            .spawn(move || worker.run())?;
        self.worker = Some(handle);
        log::info!("soapy RX started, {} samples per read", block_len);
        Ok(())
    }

    /// Stop the receive thread. Returns within one read timeout.
    pub fn stop(&mut self) -> Result<()> {
        let Some(handle) = self.worker.take() else {
            return Err(Error::NotRunning);
        };
        self.running.store(false, Ordering::Release);
        match handle.join() {
            Ok(parked) => self.parked = Some(parked),
            Err(panic) => std::panic::resume_unwind(panic),
        }
        log::info!("soapy RX stopped");
        Ok(())
    }

    /// Change the rate delivered to the DSP engine. The resampler is
    /// rebuilt before the next block.
    pub fn set_sample_rate(&self, rate: u32) {
        self.sample_rate.store(rate, Ordering::Relaxed);
    }

    pub fn transmitter(&mut self) -> Result<SoapyTransmitter> {
        let stream = self.device.tx_stream(0)?;
        Ok(SoapyTransmitter::new(stream, self.config.max_tx_samples))
    }

    pub fn set_rx_frequency(&mut self, hz: f64) -> Result<()> {
        self.device.set_rx_frequency(self.config.rx_channel, hz)
    }

    pub fn set_tx_frequency(&mut self, hz: f64) -> Result<()> {
        self.device.set_tx_frequency(hz)
    }

    pub fn set_rx_gain(&mut self, db: f64) -> Result<()> {
        self.device.set_rx_gain(self.config.rx_channel, db)
    }

    pub fn set_tx_gain(&mut self, db: f64) -> Result<()> {
        self.device.set_tx_gain(db)
    }

    pub fn set_rx_antenna(&mut self, name: &str) -> Result<()> {
        self.device.set_rx_antenna(self.config.rx_channel, name)
    }

    pub fn set_tx_antenna(&mut self, name: &str) -> Result<()> {
        self.device.set_tx_antenna(name)
    }
}

impl<D: SoapyDevice> Drop for SoapyAdapter<D> {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

/// Collects TX I/Q into blocks of `max_tx_samples` and writes each full
/// block once. Short writes are logged, not retried.
pub struct SoapyTransmitter {
    stream: Box<dyn TxBlockStream>,
    block: Vec<Complex<f32>>,
    block_len: usize,
    short_writes: u64,
}

impl SoapyTransmitter {
    pub fn new(stream: Box<dyn TxBlockStream>, max_tx_samples: usize) -> Self {
        let block_len = max_tx_samples.max(1);
        Self {
            stream,
            block: Vec::with_capacity(block_len),
            block_len,
            short_writes: 0,
        }
    }

    pub fn short_writes(&self) -> u64 {
        self.short_writes
    }

    pub fn iq_sample(&mut self, i: f64, q: f64) {
        self.block.push(Complex::new(i as f32, q as f32));
        if self.block.len() < self.block_len {
            return;
        }
        match self.stream.write(&self.block, STREAM_TIMEOUT) {
            Ok(n) if n == self.block.len() => {}
            Ok(n) => {
                self.short_writes += 1;
                log::warn!("soapy TX short write: {} of {}", n, self.block.len());
            }
            Err(e) => {
                self.short_writes += 1;
                log::warn!("soapy TX write failed: {:?}", e);
            }
        }
        self.block.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::tests::{Event, SharedSink};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct MockRx {
        mtu: usize,
        blocks: VecDeque<Vec<Complex<f32>>>,
        reads: Arc<Mutex<Vec<usize>>>,
    }

    impl RxBlockStream for MockRx {
        fn mtu(&self) -> usize {
            self.mtu
        }

        fn read(&mut self, buf: &mut [Complex<f32>], timeout: Duration) -> std::result::Result<usize, StreamError> {
            self.reads.lock().unwrap().push(buf.len());
            match self.blocks.pop_front() {
                Some(block) => {
                    buf[..block.len()].copy_from_slice(&block);
                    Ok(block.len())
                }
                None => {
                    thread::sleep(timeout.min(Duration::from_millis(5)));
                    Err(StreamError::Timeout)
                }
            }
        }
    }

    struct MockTx {
        written: Arc<Mutex<Vec<Vec<Complex<f32>>>>>,
        accept: usize,
    }

    impl TxBlockStream for MockTx {
        fn write(&mut self, buf: &[Complex<f32>], _timeout: Duration) -> std::result::Result<usize, StreamError> {
            self.written.lock().unwrap().push(buf.to_vec());
            Ok(buf.len().min(self.accept))
        }
    }

    #[derive(Default)]
    struct MockDevice {
        rx_blocks: Vec<Vec<Complex<f32>>>,
        reads: Arc<Mutex<Vec<usize>>>,
        written: Arc<Mutex<Vec<Vec<Complex<f32>>>>>,
        calls: Vec<String>,
    }

    impl SoapyDevice for MockDevice {
        fn rx_stream(&mut self, _channel: usize) -> Result<Box<dyn RxBlockStream>> {
            Ok(Box::new(MockRx {
                mtu: 4096,
                blocks: self.rx_blocks.drain(..).collect(),
                reads: self.reads.clone(),
            }))
        }
        fn tx_stream(&mut self, _channel: usize) -> Result<Box<dyn TxBlockStream>> {
            Ok(Box::new(MockTx {
                written: self.written.clone(),
                accept: 3,
            }))
        }
        fn set_rx_frequency(&mut self, channel: usize, hz: f64) -> Result<()> {
            self.calls.push(format!("rx{} {}", channel, hz));
            Ok(())
        }
        fn set_tx_frequency(&mut self, hz: f64) -> Result<()> {
            self.calls.push(format!("tx {}", hz));
            Ok(())
        }
        fn set_rx_gain(&mut self, _channel: usize, _db: f64) -> Result<()> {
            Ok(())
        }
        fn set_tx_gain(&mut self, _db: f64) -> Result<()> {
            Ok(())
        }
        fn set_rx_antenna(&mut self, _channel: usize, name: &str) -> Result<()> {
            self.calls.push(format!("ant {}", name));
            Ok(())
        }
        fn set_tx_antenna(&mut self, _name: &str) -> Result<()> {
            Ok(())
        }
    }

    fn wait_for(sink: &SharedSink, iq: usize) {
        for _ in 0..200 {
            let n = sink.0.lock().unwrap().iter().filter(|e| matches!(e, Event::Iq(..))).count();
            if n >= iq {
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("timed out waiting for {} samples", iq);
    }

    #[test]
    fn receives_at_hardware_rate() {
        let block: Vec<Complex<f32>> = (0..96).map(|k| Complex::new(k as f32 / 100.0, 0.5)).collect();
        let device = MockDevice {
            rx_blocks: vec![block],
            ..Default::default()
        };
        let reads = device.reads.clone();
        let sink = SharedSink::default();
        let config = SoapyConfig {
            hardware_rate: 96_000,
            sample_rate: 96_000,
            fft_size: 1024,
            receiver: 1,
            ..Default::default()
        };
        let mut adapter = SoapyAdapter::new(device, config, Box::new(sink.clone()), None);
        adapter.start().unwrap();
        wait_for(&sink, 96);
        adapter.stop().unwrap();
        assert!(matches!(adapter.stop(), Err(Error::NotRunning)));

        // Block length capped at twice the FFT size.
        assert_eq!(reads.lock().unwrap()[0], 2048);
        let events = sink.0.lock().unwrap();
        assert_eq!(events[0], Event::Iq(1, Complex::new(0.0, 0.5)));
        let mics = events.iter().filter(|e| matches!(e, Event::Mic(_))).count();
        assert_eq!(mics, 48);
    }

    #[test]
    fn resamples_to_dsp_rate() {
        let block = vec![Complex::new(0.25f32, -0.25); 400];
        let device = MockDevice {
            rx_blocks: vec![block.clone(), block],
            ..Default::default()
        };
        let sink = SharedSink::default();
        let config = SoapyConfig {
            hardware_rate: 192_000,
            sample_rate: 48_000,
            ..Default::default()
        };
        let mut adapter = SoapyAdapter::new(device, config, Box::new(sink.clone()), None);
        adapter.start().unwrap();
        wait_for(&sink, 200);
        adapter.stop().unwrap();

        let events = sink.0.lock().unwrap();
        let iq: Vec<_> = events.iter().filter(|e| matches!(e, Event::Iq(..))).collect();
        assert_eq!(iq.len(), 200);
        assert_eq!(*iq[0], Event::Iq(0, Complex::new(0.25, -0.25)));
    }

    #[test]
    fn adapter_restarts_with_same_sink() {
        let mut adapter = SoapyAdapter::new(
            MockDevice::default(),
            SoapyConfig::default(),
            Box::new(SharedSink::default()),
            None,
        );
        adapter.start().unwrap();
        assert!(matches!(adapter.start(), Err(Error::AlreadyRunning)));
        adapter.stop().unwrap();
        adapter.start().unwrap();
        assert!(adapter.is_running());
        adapter.stop().unwrap();
    }

    #[test]
    fn transmitter_writes_full_blocks() {
        let mut device = MockDevice::default();
        let written = device.written.clone();
        let stream = device.tx_stream(0).unwrap();
        let mut tx = SoapyTransmitter::new(stream, 4);
        for k in 0..10 {
            tx.iq_sample(k as f64 / 10.0, 0.0);
        }
        let written = written.lock().unwrap();
        assert_eq!(written.len(), 2);
        assert!(written.iter().all(|b| b.len() == 4));
        assert!((written[1][0].re - 0.4).abs() < 1e-6);
        // Mock accepts three samples per write.
        assert_eq!(tx.short_writes(), 2);
    }

    #[test]
    fn setters_pass_through() {
        let mut adapter = SoapyAdapter::new(
            MockDevice::default(),
            SoapyConfig::default(),
            Box::new(SharedSink::default()),
            None,
        );
        adapter.set_rx_frequency(7_100_000.0).unwrap();
        adapter.set_tx_frequency(7_100_000.0).unwrap();
        adapter.set_rx_antenna("LNAW").unwrap();
        assert_eq!(adapter.device.calls, vec!["rx0 7100000", "tx 7100000", "ant LNAW"]);
    }
}
