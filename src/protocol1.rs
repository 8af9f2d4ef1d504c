//! Protocol 1 session: socket tasks, ring plumbing and the start/stop
//! handshake.
//!
//! Three tasks run while a session is up:
//!
//! * receive: socket -> RX ring, with header and sequence checks
//! * process: RX ring -> [`FrameSync`] -> [`SampleRouter`] -> DSP sink
//! * pacer: TX ring -> control encoder -> socket
//!
//! Every wait is bounded by [`POLL_TIMEOUT`], so a stop is seen by all of
//! them within that time. The tasks own their ring halves and hand them
//! back when they finish, which lets the same session be started again.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

use crate::control::{ControlEncoder, EncodeContext};
use crate::error::{Error, Result};
use crate::frame::{
    build_data_frame, start_stop_packet, MetisHeader, SequenceTracker, EP_HOST_DATA, EP_RX_DATA,
    EP_WIDEBAND, METIS_FRAME_LEN, METIS_HEADER_LEN, OZY_PAYLOAD_LEN, START_IQ, START_IQ_WIDEBAND,
    STOP, TYPE_DATA,
};
use crate::framesync::FrameSync;
use crate::pacer::{FifoEstimator, TxStream, PRIME_SAMPLES, TX_CHUNK_SAMPLES};
use crate::ring::{
    byte_ring, Push, RingConsumer, RingProducer, RX_CHUNK_LEN, RX_RING_CHUNKS, RX_SKIP_WINDOW,
    TX_CHUNK_LEN, TX_RING_CHUNKS, TX_SKIP_WINDOW,
};
use crate::routing::{RouteConfig, SampleRouter};
use crate::settings::{RadioSettings, SharedSettings, TransportKind};
use crate::sink::{DspSink, LocalMicrophone};
use crate::state::SessionState;
use crate::transport::{open, FrameReader, FrameWriter};

/// Upper bound on every blocking wait inside the session tasks.
pub const POLL_TIMEOUT: Duration = Duration::from_millis(100);
/// How long TX producers are muted around a MOX change.
pub const DRAIN_WAIT: Duration = Duration::from_millis(5);
/// Command cycles sent before the start command.
const PRESTART_CYCLES: u64 = 2;
/// Grace period for the radio to drop its end of a TCP connection.
const TCP_REOPEN_DELAY: Duration = Duration::from_millis(50);

// ---------------------------------------------------------------------------
// Send path
// ---------------------------------------------------------------------------

/// Socket writer, control encoder and outgoing sequence counter. Locked
/// as a unit so a restart cannot interleave with a frame in flight.
struct Link {
    writer: FrameWriter,
    encoder: ControlEncoder,
    sequence: u32,
}

fn encode_context<'a>(settings: &'a RadioSettings, state: &SessionState) -> EncodeContext<'a> {
    EncodeContext {
        settings,
        mox: state.mox(),
        radio_ptt: state.status.radio_ptt(),
        io_board_detected: state.status.io_board_detected.load(Ordering::Relaxed),
        now: Instant::now(),
    }
}

impl Link {
    /// Frame one TX chunk with the next two control blocks and send it.
    async fn send_frame(
        &mut self,
        samples: &[u8; TX_CHUNK_LEN],
        ctx: &EncodeContext<'_>,
    ) -> std::io::Result<usize> {
        let [first, second] = self.encoder.frame_blocks(ctx);
        let frame = build_data_frame(
            self.sequence,
            EP_HOST_DATA,
            [&first, &second],
            [&samples[..OZY_PAYLOAD_LEN], &samples[OZY_PAYLOAD_LEN..]],
        );
        self.sequence = self.sequence.wrapping_add(1);
        self.writer.send(&frame).await
    }

    async fn send_start_stop(&mut self, command: u8) -> std::io::Result<()> {
        self.writer.send(&start_stop_packet(command)).await.map(|_| ())
    }

    /// Reset the counter, push the full command set twice and start the
    /// stream.
    async fn begin_streaming(&mut self, settings: &SharedSettings, state: &SessionState) -> Result<()> {
        let snapshot = settings.lock().await.clone();
        self.sequence = 0;
        self.encoder.reset();
        let silence = [0u8; TX_CHUNK_LEN];
        while self.encoder.cycles_completed() < PRESTART_CYCLES {
            let ctx = encode_context(&snapshot, state);
            self.send_frame(&silence, &ctx).await?;
        }
        let command = if snapshot.wideband {
            START_IQ_WIDEBAND
        } else {
            START_IQ
        };
        self.send_start_stop(command).await?;
        log::info!(
            "P1 started {} ({} DDCs @ {} Hz)",
            snapshot.device,
            snapshot.ddc_count(),
            snapshot.sample_rate
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

struct Parked {
    rx_producer: RingProducer,
    rx_consumer: RingConsumer,
    tx_consumer: RingConsumer,
    router: SampleRouter,
}

struct Tasks {
    receive: JoinHandle<RingProducer>,
    process: JoinHandle<(RingConsumer, SampleRouter)>,
    pacer: JoinHandle<RingConsumer>,
}

fn handle_frame(
    data: &[u8],
    ring: &mut RingProducer,
    sequence: &mut SequenceTracker,
    state: &SessionState,
) {
    let Some(header) = MetisHeader::parse(data) else {
        SessionState::bump(&state.bad_frames);
        log::warn!("P1 dropping {} bytes without Metis header", data.len());
        return;
    };
    if header.kind != TYPE_DATA {
        log::debug!("P1 ignoring packet type {:#04x}", header.kind);
        return;
    }
    match header.endpoint {
        EP_RX_DATA => {
            if data.len() < METIS_FRAME_LEN {
                SessionState::bump(&state.bad_frames);
                log::warn!("P1 short EP6 frame ({} bytes)", data.len());
                return;
            }
            if sequence.observe(header.sequence) {
                SessionState::bump(&state.sequence_errors);
                log::warn!("P1 sequence gap at {}", header.sequence);
            }
            SessionState::bump(&state.frames_received);
            match ring.push_chunk(&data[METIS_HEADER_LEN..METIS_FRAME_LEN]) {
                Push::Queued | Push::Skipped => {}
                Push::Overflow => {
                    SessionState::bump(&state.rx_overflows);
                    log::warn!("P1 RX ring full, skipping {} frames", RX_SKIP_WINDOW);
                }
            }
        }
        EP_WIDEBAND => log::trace!("P1 wideband frame {}", header.sequence),
        ep => {
            SessionState::bump(&state.bad_frames);
            log::warn!("P1 unknown endpoint {}", ep);
        }
    }
}

async fn receive_task(
    mut reader: FrameReader,
    mut ring: RingProducer,
    handover: Arc<Mutex<Option<FrameReader>>>,
    state: Arc<SessionState>,
) -> RingProducer {
    let mut frame = [0u8; METIS_FRAME_LEN];
    let mut sequence = SequenceTracker::new();
    let mut failing = false;

    while state.is_running() {
        if let Ok(mut slot) = handover.try_lock() {
            if let Some(fresh) = slot.take() {
                reader = fresh;
                sequence.reset();
                failing = false;
            }
        }
        match timeout(POLL_TIMEOUT, reader.recv(&mut frame)).await {
            Err(_) => {}
            Ok(Ok(len)) => {
                failing = false;
                handle_frame(&frame[..len], &mut ring, &mut sequence, &state);
            }
            Ok(Err(e)) => {
                if !failing {
                    log::error!("P1 receive error: {}", e);
                    failing = true;
                }
                sleep(POLL_TIMEOUT).await;
            }
        }
    }
    log::debug!("P1 receive task done");
    ring
}

async fn process_task(
    mut ring: RingConsumer,
    mut router: SampleRouter,
    settings: SharedSettings,
    state: Arc<SessionState>,
) -> (RingConsumer, SampleRouter) {
    let mut sync = FrameSync::new();
    let mut chunk = [0u8; RX_CHUNK_LEN];
    let mut reported = 0;

    while state.is_running() {
        if !ring.next_chunk(&mut chunk, POLL_TIMEOUT).await {
            continue;
        }
        let config = RouteConfig::from(&*settings.lock().await);
        router.configure(config);
        sync.feed(&chunk, &mut router);
        let errors = sync.sync_errors();
        if errors != reported {
            state.sync_errors.fetch_add(errors - reported, Ordering::Relaxed);
            reported = errors;
        }
    }
    log::debug!("P1 process task done");
    (ring, router)
}

async fn pacer_task(
    mut ring: RingConsumer,
    link: Arc<Mutex<Link>>,
    settings: SharedSettings,
    state: Arc<SessionState>,
) -> RingConsumer {
    let mut estimator = FifoEstimator::new(settings.lock().await.pacer.clone());
    let mut chunk = [0u8; TX_CHUNK_LEN];

    while state.is_running() {
        if !ring.next_chunk(&mut chunk, POLL_TIMEOUT).await {
            continue;
        }
        if state.draining() {
            SessionState::bump(&state.tx_discarded);
            continue;
        }
        let snapshot = settings.lock().await.clone();
        estimator.set_tuning(snapshot.pacer.clone());
        if let Some(delay) = estimator.delay(Instant::now()) {
            sleep(delay).await;
            // MOX may have flipped while sleeping.
            if state.draining() {
                SessionState::bump(&state.tx_discarded);
                continue;
            }
        }

        // A restart holds the link; never wait for it here.
        let Ok(mut link) = link.try_lock() else {
            SessionState::bump(&state.tx_discarded);
            log::debug!("P1 link busy, dropping TX chunk");
            continue;
        };
        let ctx = encode_context(&snapshot, &state);
        match link.send_frame(&chunk, &ctx).await {
            Ok(n) if n == METIS_FRAME_LEN => {
                SessionState::bump(&state.frames_sent);
                estimator.sent(TX_CHUNK_SAMPLES);
            }
            Ok(n) => {
                SessionState::bump(&state.short_writes);
                log::warn!("P1 short send: {} of {} bytes", n, METIS_FRAME_LEN);
            }
            Err(e) => {
                SessionState::bump(&state.short_writes);
                log::error!("P1 send error: {}", e);
            }
        }
    }
    log::debug!("P1 pacer task done");
    ring
}

fn join_result<T>(result: std::result::Result<T, tokio::task::JoinError>) -> T {
    match result {
        Ok(value) => value,
        Err(e) => std::panic::resume_unwind(e.into_panic()),
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

pub struct Protocol1Session {
    radio: SocketAddr,
    settings: SharedSettings,
    state: Arc<SessionState>,
    tx: TxStream,
    parked: Option<Parked>,
    link: Option<Arc<Mutex<Link>>>,
    handover: Arc<Mutex<Option<FrameReader>>>,
    tasks: Option<Tasks>,
}

impl Protocol1Session {
    pub fn new(
        radio: SocketAddr,
        settings: SharedSettings,
        sink: Box<dyn DspSink>,
        local_mic: Option<Box<dyn LocalMicrophone>>,
    ) -> Self {
        let state = Arc::new(SessionState::new());
        let (rx_producer, rx_consumer) = byte_ring(RX_CHUNK_LEN, RX_RING_CHUNKS, RX_SKIP_WINDOW);
        let (tx_producer, tx_consumer) = byte_ring(TX_CHUNK_LEN, TX_RING_CHUNKS, TX_SKIP_WINDOW);
        let router = SampleRouter::new(sink, local_mic, state.clone(), RouteConfig::default());
        Self {
            radio,
            settings,
            tx: TxStream::new(tx_producer, state.clone()),
            state,
            parked: Some(Parked {
                rx_producer,
                rx_consumer,
                tx_consumer,
                router,
            }),
            link: None,
            handover: Arc::new(Mutex::new(None)),
            tasks: None,
        }
    }

    pub fn radio(&self) -> SocketAddr {
        self.radio
    }

    pub fn state(&self) -> Arc<SessionState> {
        self.state.clone()
    }

    /// Producer handle for TX I/Q and RX audio.
    pub fn tx_stream(&self) -> TxStream {
        self.tx.clone()
    }

    pub fn is_running(&self) -> bool {
        self.tasks.is_some()
    }

    /// Open the transport, spawn the session tasks and start streaming.
    pub async fn start(&mut self) -> Result<()> {
        if self.tasks.is_some() {
            return Err(Error::AlreadyRunning);
        }
        let (kind, config) = {
            let s = self.settings.lock().await;
            s.validate()?;
            (s.transport, RouteConfig::from(&*s))
        };

        let (reader, writer) = match open(self.radio, kind).await {
            Ok(pair) => pair,
            Err(e) => {
                log::error!("P1 cannot open {:?} link to {}: {}", kind, self.radio, e);
                return Err(e);
            }
        };
        let Some(mut parked) = self.parked.take() else {
            return Err(Error::AlreadyRunning);
        };
        parked.rx_consumer.discard_all();
        parked.tx_consumer.discard_all();
        parked.router.configure(config);
        self.tx.clear();
        *self.handover.lock().await = None;

        let link = Arc::new(Mutex::new(Link {
            writer,
            encoder: ControlEncoder::new(),
            sequence: 0,
        }));
        self.state.set_running(true);
        self.tasks = Some(Tasks {
            receive: tokio::spawn(receive_task(
                reader,
                parked.rx_producer,
                self.handover.clone(),
                self.state.clone(),
            )),
            process: tokio::spawn(process_task(
                parked.rx_consumer,
                parked.router,
                self.settings.clone(),
                self.state.clone(),
            )),
            pacer: tokio::spawn(pacer_task(
                parked.tx_consumer,
                link.clone(),
                self.settings.clone(),
                self.state.clone(),
            )),
        });
        self.link = Some(link.clone());

        let started = link.lock().await.begin_streaming(&self.settings, &self.state).await;
        if let Err(e) = started {
            log::error!("P1 start failed: {}", e);
            self.shutdown().await;
            return Err(e);
        }
        self.tx.prime(PRIME_SAMPLES);
        Ok(())
    }

    /// Send the stop command and wait for the session tasks to finish.
    pub async fn stop(&mut self) -> Result<()> {
        if self.tasks.is_none() {
            return Err(Error::NotRunning);
        }
        if let Some(link) = &self.link {
            if let Err(e) = link.lock().await.send_start_stop(STOP).await {
                log::warn!("P1 stop command failed: {}", e);
            }
        }
        self.shutdown().await;
        log::info!("P1 stopped");
        Ok(())
    }

    async fn shutdown(&mut self) {
        self.state.set_running(false);
        self.link = None;
        if let Some(tasks) = self.tasks.take() {
            let rx_producer = join_result(tasks.receive.await);
            let (rx_consumer, router) = join_result(tasks.process.await);
            let tx_consumer = join_result(tasks.pacer.await);
            self.parked = Some(Parked {
                rx_producer,
                rx_consumer,
                tx_consumer,
                router,
            });
        }
    }

    /// Stop and restart streaming without tearing down the tasks. A TCP
    /// connection is re-opened, since radios close it on stop.
    pub async fn restart(&self) -> Result<()> {
        let Some(link) = &self.link else {
            return Err(Error::NotRunning);
        };
        let mut link = link.lock().await;
        if let Err(e) = link.send_start_stop(STOP).await {
            log::warn!("P1 stop command failed: {}", e);
        }
        if link.writer.is_tcp() {
            sleep(TCP_REOPEN_DELAY).await;
            let (reader, writer) = open(self.radio, TransportKind::Tcp).await?;
            link.writer = writer;
            *self.handover.lock().await = Some(reader);
        }
        link.begin_streaming(&self.settings, &self.state).await?;
        drop(link);
        self.tx.prime(PRIME_SAMPLES);
        log::info!("P1 restarted");
        Ok(())
    }

    /// Switch between receive and transmit. TX producers are muted for a
    /// few milliseconds so no stale samples cross the transition.
    pub async fn set_mox(&self, mox: bool) {
        if self.state.mox() == mox {
            return;
        }
        self.state.set_drain(true);
        self.tx.clear();
        self.state.set_mox(mox);
        sleep(DRAIN_WAIT).await;
        self.state.set_drain(false);
        log::debug!("P1 MOX -> {}", mox);
    }
}

impl Drop for Protocol1Session {
    fn drop(&mut self) {
        self.state.set_running(false);
    }
}
