//! UDP and TCP carriers for Metis frames.
//!
//! UDP keeps datagram boundaries. TCP is a byte stream, so reads are
//! accumulated until a whole 1032-byte frame is in.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::socket::setsockopt;
use nix::sys::socket::sockopt::{RcvBuf, ReuseAddr, SndBuf};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;

use crate::error::{Error, Result};
use crate::frame::METIS_FRAME_LEN;
use crate::settings::TransportKind;

pub const RADIO_PORT: u16 = 1024;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const SOCKET_BUFFER_LEN: usize = 0x40000;

pub enum FrameReader {
    Udp {
        socket: Arc<UdpSocket>,
        radio: SocketAddr,
    },
    Tcp {
        stream: OwnedReadHalf,
        assembler: Box<FrameAssembler>,
    },
}

pub enum FrameWriter {
    Udp {
        socket: Arc<UdpSocket>,
        radio: SocketAddr,
    },
    Tcp(OwnedWriteHalf),
}

/// Collects stream bytes into whole frames.
///
/// Partial progress lives in the assembler, not in the future, so a read
/// cancelled by a timeout loses nothing.
pub struct FrameAssembler {
    pending: [u8; METIS_FRAME_LEN],
    filled: usize,
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self {
            pending: [0; METIS_FRAME_LEN],
            filled: 0,
        }
    }
}

impl FrameAssembler {
    pub async fn read_frame<R: AsyncRead + Unpin>(
        &mut self,
        reader: &mut R,
        out: &mut [u8; METIS_FRAME_LEN],
    ) -> io::Result<()> {
        while self.filled < METIS_FRAME_LEN {
            let n = reader.read(&mut self.pending[self.filled..]).await?;
            if n == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
            self.filled += n;
        }
        out.copy_from_slice(&self.pending);
        self.filled = 0;
        Ok(())
    }
}

fn udp_socket() -> Result<UdpSocket> {
    let socket = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).map_err(Error::Bind)?;
    if let Err(e) = setsockopt(&socket, ReuseAddr, &true) {
        log::warn!("P1 SO_REUSEADDR: {}", e);
    }
    for (name, result) in [
        ("SO_RCVBUF", setsockopt(&socket, RcvBuf, &SOCKET_BUFFER_LEN)),
        ("SO_SNDBUF", setsockopt(&socket, SndBuf, &SOCKET_BUFFER_LEN)),
    ] {
        if let Err(e) = result {
            log::warn!("P1 {}: {}", name, e);
        }
    }
    socket.set_nonblocking(true)?;
    Ok(UdpSocket::from_std(socket)?)
}

/// Open the data connection to a radio.
pub async fn open(radio: SocketAddr, kind: TransportKind) -> Result<(FrameReader, FrameWriter)> {
    match kind {
        TransportKind::Udp => {
            let socket = Arc::new(udp_socket()?);
            log::info!(
                "P1 UDP {} -> {}",
                socket.local_addr().map_err(Error::Bind)?,
                radio
            );
            Ok((
                FrameReader::Udp {
                    socket: socket.clone(),
                    radio,
                },
                FrameWriter::Udp { socket, radio },
            ))
        }
        TransportKind::Tcp => {
            let stream = match timeout(CONNECT_TIMEOUT, TcpStream::connect(radio)).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => return Err(Error::Connect(radio, e)),
                Err(_) => {
                    return Err(Error::Connect(
                        radio,
                        io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
                    ))
                }
            };
            stream.set_nodelay(true)?;
            log::info!("P1 TCP connected to {}", radio);
            let (rd, wr) = stream.into_split();
            Ok((
                FrameReader::Tcp {
                    stream: rd,
                    assembler: Box::default(),
                },
                FrameWriter::Tcp(wr),
            ))
        }
    }
}

impl FrameReader {
    /// Receive the next frame into `buf`. Returns the number of bytes
    /// received; UDP datagrams from other hosts are skipped.
    pub async fn recv(&mut self, buf: &mut [u8; METIS_FRAME_LEN]) -> io::Result<usize> {
        match self {
            Self::Udp { socket, radio } => loop {
                let (len, from) = socket.recv_from(buf).await?;
                if from.ip() == radio.ip() {
                    return Ok(len);
                }
                log::debug!("P1 ignoring {} bytes from {}", len, from);
            },
            Self::Tcp { stream, assembler } => {
                assembler.read_frame(stream, buf).await?;
                Ok(METIS_FRAME_LEN)
            }
        }
    }

    pub fn is_tcp(&self) -> bool {
        matches!(self, Self::Tcp { .. })
    }
}

impl FrameWriter {
    /// Send one packet. Returns the number of bytes accepted by the socket.
    pub async fn send(&mut self, data: &[u8]) -> io::Result<usize> {
        match self {
            Self::Udp { socket, radio } => socket.send_to(data, *radio).await,
            Self::Tcp(wr) => {
                wr.write_all(data).await?;
                Ok(data.len())
            }
        }
    }

    pub fn is_tcp(&self) -> bool {
        matches!(self, Self::Tcp(_))
    }
}
