//! Protocol 1 discovery: broadcast `EF FE 02` and collect replies.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use nix::sys::socket::setsockopt;
use nix::sys::socket::sockopt::ReuseAddr;
use tokio::net::UdpSocket;
use tokio::time::{timeout_at, Instant};

use crate::error::{Error, Result};
use crate::frame::{METIS_SYNC, TYPE_DISCOVERY, TYPE_DISCOVERY_BUSY};
use crate::radio::DeviceType;
use crate::transport::RADIO_PORT;

pub const DISCOVERY_REQUEST_LEN: usize = 63;
pub const DISCOVERY_REPLY_LEN: usize = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Device {
    pub address: SocketAddr,
    pub mac: [u8; 6],
    pub firmware: u8,
    pub board: u8,
    pub device: Option<DeviceType>,
    /// Already streaming to another host.
    pub busy: bool,
}

impl Device {
    /// Receivers the firmware can stream, as far as the reply tells.
    pub fn max_receivers(&self) -> u8 {
        self.device.map(DeviceType::max_ddcs).unwrap_or(1)
    }
}

pub fn discovery_request() -> [u8; DISCOVERY_REQUEST_LEN] {
    let mut buf = [0u8; DISCOVERY_REQUEST_LEN];
    buf[0..2].copy_from_slice(&METIS_SYNC);
    buf[2] = TYPE_DISCOVERY;
    buf
}

/// Parse a discovery reply received from `address`.
pub fn parse_reply(data: &[u8], address: SocketAddr) -> Option<Device> {
    if data.len() < DISCOVERY_REPLY_LEN || data[0..2] != METIS_SYNC {
        return None;
    }
    let busy = match data[2] {
        TYPE_DISCOVERY => false,
        TYPE_DISCOVERY_BUSY => true,
        _ => return None,
    };
    let mut mac = [0u8; 6];
    mac.copy_from_slice(&data[3..9]);
    let firmware = data[9];
    let board = data[10];
    Some(Device {
        address,
        mac,
        firmware,
        board,
        device: DeviceType::from_code(board, firmware),
        busy,
    })
}

/// Broadcast a discovery request to `target` and collect replies for `wait`.
pub async fn discover(target: SocketAddr, wait: Duration) -> Result<Vec<Device>> {
    let socket = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).map_err(Error::Bind)?;
    if let Err(e) = setsockopt(&socket, ReuseAddr, &true) {
        log::warn!("discovery SO_REUSEADDR: {}", e);
    }
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    let socket = UdpSocket::from_std(socket)?;

    socket.send_to(&discovery_request(), target).await?;
    log::info!("P1 discovery sent to {}", target);

    let deadline = Instant::now() + wait;
    let mut devices: Vec<Device> = Vec::new();
    let mut buf = [0u8; 1500];
    loop {
        let (len, from) = match timeout_at(deadline, socket.recv_from(&mut buf)).await {
            Ok(result) => result?,
            Err(_) => break,
        };
        match parse_reply(&buf[..len], from) {
            Some(dev) if !devices.iter().any(|d| d.mac == dev.mac) => {
                log::info!(
                    "P1 found {} at {} (fw {}.{}){}",
                    dev.device.map(|d| d.to_string()).unwrap_or_else(|| format!("board {}", dev.board)),
                    from,
                    dev.firmware / 10,
                    dev.firmware % 10,
                    if dev.busy { " busy" } else { "" }
                );
                devices.push(dev);
            }
            Some(_) => {}
            None => log::debug!("P1 discovery: ignoring {} bytes from {}", len, from),
        }
    }
    Ok(devices)
}

/// Default broadcast target.
pub fn broadcast_target() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::BROADCAST, RADIO_PORT))
}
