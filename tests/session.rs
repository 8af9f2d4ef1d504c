//! Full sessions against a fake radio on loopback.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use num_complex::Complex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::time::timeout;

use hpsdr_link::frame::{
    build_data_frame, ControlBlock, MetisHeader, EP_HOST_DATA, EP_RX_DATA, METIS_FRAME_LEN,
    METIS_HEADER_LEN, OZY_BUFFER_LEN, OZY_PAYLOAD_LEN, START_IQ, START_STOP_LEN, STOP,
    TYPE_START_STOP,
};
use hpsdr_link::protocol1::Protocol1Session;
use hpsdr_link::radio::{pack_iq_24bit_into, unpack_tx_16bit};
use hpsdr_link::settings::{RadioSettings, TransportKind};
use hpsdr_link::sink::DspSink;

const WAIT: Duration = Duration::from_secs(2);

#[derive(Default, Clone)]
struct Collected {
    iq: Arc<Mutex<Vec<(usize, Complex<f64>)>>>,
    mic: Arc<Mutex<Vec<f64>>>,
}

impl Collected {
    fn iq_count(&self) -> usize {
        self.iq.lock().unwrap().len()
    }

    async fn wait_for_iq(&self, n: usize) {
        for _ in 0..200 {
            if self.iq_count() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("got {} I/Q samples, wanted {}", self.iq_count(), n);
    }
}

impl DspSink for Collected {
    fn add_iq_samples(&mut self, rx: usize, iq: Complex<f64>) {
        self.iq.lock().unwrap().push((rx, iq));
    }
    fn add_mic_sample(&mut self, sample: f64) {
        self.mic.lock().unwrap().push(sample);
    }
    fn add_ps_iq_samples(&mut self, _reference: Complex<f64>, _feedback: Complex<f64>) {}
    fn add_diversity_samples(&mut self, _main: Complex<f64>, _aux: Complex<f64>) {}
}

/// EP6 frame for one receiver with every sample set to `value`.
fn rx_frame(sequence: u32, value: f64, mic: i16) -> [u8; METIS_FRAME_LEN] {
    let mut payload = [0u8; OZY_PAYLOAD_LEN];
    let mut off = 0;
    for _ in 0..OZY_PAYLOAD_LEN / 8 {
        off = pack_iq_24bit_into(&mut payload, off, Complex::new(value, -value));
        payload[off..off + 2].copy_from_slice(&mic.to_be_bytes());
        off += 2;
    }
    build_data_frame(
        sequence,
        EP_RX_DATA,
        [&ControlBlock::new(0x00, 0, 0, 0, 0), &ControlBlock::new(0x08, 0, 0, 0, 0)],
        [&payload, &payload],
    )
}

/// TX samples of both sub-buffers of a host frame.
fn tx_samples(frame: &[u8]) -> Vec<(Complex<f64>, Complex<f64>)> {
    let mut out = Vec::new();
    for half in 0..2 {
        let start = METIS_HEADER_LEN + half * OZY_BUFFER_LEN + 8;
        out.extend(unpack_tx_16bit(&frame[start..start + OZY_PAYLOAD_LEN]));
    }
    out
}

fn approx(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-4
}

/// Receive host packets until the start command. Returns the data frames
/// seen before it and the host address.
async fn read_until_start(radio: &UdpSocket) -> (Vec<MetisHeader>, std::net::SocketAddr) {
    let mut buf = [0u8; 2048];
    let mut headers = Vec::new();
    loop {
        let (n, host) = timeout(WAIT, radio.recv_from(&mut buf)).await.unwrap().unwrap();
        let header = MetisHeader::parse(&buf[..n]).unwrap();
        if header.kind == TYPE_START_STOP {
            assert_eq!(n, START_STOP_LEN);
            assert_eq!(header.endpoint, START_IQ);
            return (headers, host);
        }
        headers.push(header);
    }
}

#[tokio::test]
async fn udp_session_streams_both_ways() {
    let radio = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let sink = Collected::default();
    let settings = RadioSettings::default().into_shared();
    let mut session = Protocol1Session::new(
        radio.local_addr().unwrap(),
        settings,
        Box::new(sink.clone()),
        None,
    );
    session.start().await.unwrap();

    let (headers, host) = read_until_start(&radio).await;
    assert!(headers.len() >= 2);
    for (n, h) in headers.iter().enumerate() {
        assert_eq!(h.endpoint, EP_HOST_DATA);
        assert_eq!(h.sequence, n as u32);
    }

    // Priming: at least three frames of silence follow the start command,
    // continuing the sequence.
    let mut buf = [0u8; 2048];
    for n in 0..3 {
        let (len, _) = timeout(WAIT, radio.recv_from(&mut buf)).await.unwrap().unwrap();
        assert_eq!(len, METIS_FRAME_LEN);
        let h = MetisHeader::parse(&buf[..len]).unwrap();
        assert_eq!(h.sequence, (headers.len() + n) as u32);
        assert!(tx_samples(&buf[..len]).iter().all(|(a, iq)| a.norm() == 0.0 && iq.norm() == 0.0));
    }

    // RX: two frames, one receiver, 126 groups each.
    for seq in 0..2 {
        radio.send_to(&rx_frame(seq, 0.5, 1000), host).await.unwrap();
    }
    sink.wait_for_iq(2 * 126).await;
    {
        let iq = sink.iq.lock().unwrap();
        assert!(iq.iter().all(|&(rx, s)| rx == 0 && approx(s.re, 0.5) && approx(s.im, -0.5)));
        let mic = sink.mic.lock().unwrap();
        assert!(mic.iter().all(|&m| approx(m, 1000.0 / 32768.0)));
    }

    // A skipped sequence number is counted.
    radio.send_to(&rx_frame(5, 0.25, 0), host).await.unwrap();
    sink.wait_for_iq(3 * 126).await;
    let state = session.state();
    assert_eq!(state.stats().sequence_errors, 1);

    // TX: I/Q goes out only with MOX set.
    session.set_mox(true).await;
    let tx = session.tx_stream();
    for _ in 0..126 * 2 {
        tx.iq_samples(0.5, -0.25, 0.0);
    }
    let mut found = false;
    for _ in 0..20 {
        let (len, _) = timeout(WAIT, radio.recv_from(&mut buf)).await.unwrap().unwrap();
        let samples = tx_samples(&buf[..len]);
        if samples.iter().any(|(_, iq)| iq.norm() > 0.0) {
            assert!(samples.iter().all(|(_, iq)| approx(iq.re, 0.5) && iq.im < -0.24));
            // MOX bit in C0 of both sub-buffers.
            assert_eq!(buf[METIS_HEADER_LEN + 3] & 1, 1);
            assert_eq!(buf[METIS_HEADER_LEN + OZY_BUFFER_LEN + 3] & 1, 1);
            found = true;
            break;
        }
    }
    assert!(found);

    session.stop().await.unwrap();
    loop {
        let (len, _) = timeout(WAIT, radio.recv_from(&mut buf)).await.unwrap().unwrap();
        if len == START_STOP_LEN {
            assert_eq!(&buf[..4], &[0xEF, 0xFE, TYPE_START_STOP, STOP]);
            break;
        }
    }
    assert!(state.stats().frames_received >= 3);
    assert!(state.stats().frames_sent >= 3);
}

/// Read one packet from the TCP stream; start/stop packets are 64 bytes,
/// data frames 1032.
async fn read_tcp_packet(stream: &mut TcpStream) -> Vec<u8> {
    let mut head = [0u8; 4];
    timeout(WAIT, stream.read_exact(&mut head)).await.unwrap().unwrap();
    let len = if head[2] == TYPE_START_STOP {
        START_STOP_LEN
    } else {
        METIS_FRAME_LEN
    };
    let mut packet = head.to_vec();
    packet.resize(len, 0);
    timeout(WAIT, stream.read_exact(&mut packet[4..])).await.unwrap().unwrap();
    packet
}

async fn tcp_until_start(stream: &mut TcpStream) -> Vec<MetisHeader> {
    let mut headers = Vec::new();
    loop {
        let packet = read_tcp_packet(stream).await;
        let header = MetisHeader::parse(&packet).unwrap();
        if header.kind == TYPE_START_STOP {
            assert_eq!(header.endpoint, START_IQ);
            return headers;
        }
        headers.push(header);
    }
}

#[tokio::test]
async fn tcp_session_survives_restart() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let sink = Collected::default();
    let mut settings = RadioSettings::default();
    settings.transport = TransportKind::Tcp;
    let mut session = Protocol1Session::new(
        listener.local_addr().unwrap(),
        settings.into_shared(),
        Box::new(sink.clone()),
        None,
    );

    let accept = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        (listener, stream)
    });
    session.start().await.unwrap();
    let (listener, mut stream) = accept.await.unwrap();
    let headers = tcp_until_start(&mut stream).await;
    assert_eq!(headers[0].sequence, 0);

    // Frames split across writes are reassembled.
    let frame = rx_frame(0, 0.125, 0);
    for part in [&frame[..100], &frame[100..600], &frame[600..]] {
        stream.write_all(part).await.unwrap();
        stream.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    sink.wait_for_iq(126).await;

    // Restart: stop on the old connection, then a fresh connection that
    // starts from sequence 0 again.
    let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });
    session.restart().await.unwrap();
    let mut fresh = accept.await.unwrap();
    loop {
        let packet = read_tcp_packet(&mut stream).await;
        if packet.len() == START_STOP_LEN {
            assert_eq!(packet[3], STOP);
            break;
        }
    }
    let headers = tcp_until_start(&mut fresh).await;
    assert_eq!(headers[0].sequence, 0);
    drop(stream);

    fresh.write_all(&rx_frame(0, -0.25, 0)).await.unwrap();
    sink.wait_for_iq(2 * 126).await;
    {
        let iq = sink.iq.lock().unwrap();
        assert!(approx(iq[126].1.re, -0.25));
    }

    session.stop().await.unwrap();
    assert!(!session.is_running());
}

#[tokio::test]
async fn start_fails_without_listener() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    let mut settings = RadioSettings::default();
    settings.transport = TransportKind::Tcp;
    let mut session = Protocol1Session::new(
        addr,
        settings.into_shared(),
        Box::new(Collected::default()),
        None,
    );
    assert!(session.start().await.is_err());
    assert!(!session.is_running());
}

#[tokio::test]
async fn start_rejects_bad_receiver_count() {
    let mut settings = RadioSettings::default();
    settings.receivers = 3;
    let mut session = Protocol1Session::new(
        "127.0.0.1:1024".parse().unwrap(),
        settings.into_shared(),
        Box::new(Collected::default()),
        None,
    );
    assert!(matches!(
        session.start().await,
        Err(hpsdr_link::Error::UnsupportedReceivers { requested: 3, .. })
    ));
}
