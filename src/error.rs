use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to bind local socket: {0}")]
    Bind(io::Error),

    #[error("failed to connect to radio at {0}: {1}")]
    Connect(SocketAddr, io::Error),

    #[error("protocol session is not running")]
    NotRunning,

    #[error("protocol session is already running")]
    AlreadyRunning,

    #[error("{device} cannot stream {requested} receivers (max {max})")]
    UnsupportedReceivers {
        device: crate::radio::DeviceType,
        requested: u8,
        max: u8,
    },

    #[error("SoapySDR: {0}")]
    Soapy(String),

    #[error("failed to load settings from {0}: {1}")]
    Config(PathBuf, String),
}
