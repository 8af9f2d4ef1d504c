//! Host side of the HPSDR Protocol 1 (Metis) link.
//!
//! [`protocol1::Protocol1Session`] runs one streaming session against a
//! radio over UDP or TCP: it decodes the EP6 receive stream into a
//! [`sink::DspSink`] and sends the host's audio and TX I/Q together with
//! the round-robin C&C settings. [`soapy`] offers the same sample
//! interfaces for SoapySDR devices.

pub mod control;
pub mod discovery;
pub mod error;
pub mod frame;
pub mod framesync;
pub mod pacer;
pub mod protocol1;
pub mod radio;
pub mod ring;
pub mod routing;
pub mod settings;
pub mod sink;
pub mod soapy;
pub mod state;
pub mod transport;

pub use error::{Error, Result};
