//! [`SoapyDevice`] over the `soapysdr` crate.

use std::time::Duration;

use num_complex::Complex;
use soapysdr::{Device, Direction, ErrorCode, RxStream, TxStream};

use super::{RxBlockStream, SoapyConfig, SoapyDevice, StreamError, TxBlockStream};
use crate::error::{Error, Result};

fn soapy_err(context: &str, e: soapysdr::Error) -> Error {
    Error::Soapy(format!("{}: {}", context, e))
}

fn stream_err(e: soapysdr::Error) -> StreamError {
    match e.code {
        ErrorCode::Timeout => StreamError::Timeout,
        ErrorCode::Overflow => StreamError::Overflow,
        code => StreamError::Other(code as i32),
    }
}

fn timeout_us(timeout: Duration) -> i64 {
    timeout.as_micros() as i64
}

pub struct SoapySdrDevice {
    device: Device,
}

impl SoapySdrDevice {
    /// Open the device and configure both directions for `config`. Setup
    /// failures come back as [`Error::Soapy`].
    pub fn open(config: &SoapyConfig) -> Result<Self> {
        log::info!("soapy opening '{}'", config.args);
        let device = Device::new(config.args.as_str()).map_err(|e| soapy_err("open", e))?;
        let rate = config.hardware_rate as f64;
        device
            .set_sample_rate(Direction::Rx, config.rx_channel, rate)
            .map_err(|e| soapy_err("RX sample rate", e))?;
        if let Err(e) = device.set_sample_rate(Direction::Tx, 0, rate) {
            log::warn!("soapy TX sample rate: {}", e);
        }
        let actual = device
            .sample_rate(Direction::Rx, config.rx_channel)
            .unwrap_or(rate);
        log::info!("soapy RX rate {} Hz (actual {} Hz)", rate, actual);
        Ok(Self { device })
    }
}

struct SdrRx(RxStream<Complex<f32>>);

impl RxBlockStream for SdrRx {
    fn mtu(&self) -> usize {
        self.0.mtu().unwrap_or(1024)
    }

    fn read(&mut self, buf: &mut [Complex<f32>], timeout: Duration) -> std::result::Result<usize, StreamError> {
        self.0.read(&mut [buf], timeout_us(timeout)).map_err(stream_err)
    }
}

struct SdrTx(TxStream<Complex<f32>>);

impl TxBlockStream for SdrTx {
    fn write(&mut self, buf: &[Complex<f32>], timeout: Duration) -> std::result::Result<usize, StreamError> {
        self.0
            .write(&[buf], None, false, timeout_us(timeout))
            .map_err(stream_err)
    }
}

impl SoapyDevice for SoapySdrDevice {
    fn rx_stream(&mut self, channel: usize) -> Result<Box<dyn RxBlockStream>> {
        let mut stream = self
            .device
            .rx_stream::<Complex<f32>>(&[channel])
            .map_err(|e| soapy_err("RX stream", e))?;
        stream.activate(None).map_err(|e| soapy_err("RX activate", e))?;
        Ok(Box::new(SdrRx(stream)))
    }

    fn tx_stream(&mut self, channel: usize) -> Result<Box<dyn TxBlockStream>> {
        let mut stream = self
            .device
            .tx_stream::<Complex<f32>>(&[channel])
            .map_err(|e| soapy_err("TX stream", e))?;
        stream.activate(None).map_err(|e| soapy_err("TX activate", e))?;
        Ok(Box::new(SdrTx(stream)))
    }

    fn set_rx_frequency(&mut self, channel: usize, hz: f64) -> Result<()> {
        self.device
            .set_frequency(Direction::Rx, channel, hz, ())
            .map_err(|e| soapy_err("RX frequency", e))
    }

    fn set_tx_frequency(&mut self, hz: f64) -> Result<()> {
        self.device
            .set_frequency(Direction::Tx, 0, hz, ())
            .map_err(|e| soapy_err("TX frequency", e))
    }

    fn set_rx_gain(&mut self, channel: usize, db: f64) -> Result<()> {
        self.device
            .set_gain(Direction::Rx, channel, db)
            .map_err(|e| soapy_err("RX gain", e))
    }

    fn set_tx_gain(&mut self, db: f64) -> Result<()> {
        self.device
            .set_gain(Direction::Tx, 0, db)
            .map_err(|e| soapy_err("TX gain", e))
    }

    fn set_rx_antenna(&mut self, channel: usize, name: &str) -> Result<()> {
        self.device
            .set_antenna(Direction::Rx, channel, name)
            .map_err(|e| soapy_err("RX antenna", e))
    }

    fn set_tx_antenna(&mut self, name: &str) -> Result<()> {
        self.device
            .set_antenna(Direction::Tx, 0, name)
            .map_err(|e| soapy_err("TX antenna", e))
    }
}
