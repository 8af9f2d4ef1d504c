//! Delivery of decoded DDC samples to the DSP engine.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use num_complex::Complex;

use crate::frame::ControlBlock;
use crate::framesync::FrameHandler;
use crate::radio::DeviceType;
use crate::settings::RadioSettings;
use crate::sink::{DspSink, LocalMicrophone};
use crate::state::SessionState;

/// Largest DDC count any Protocol 1 firmware streams, plus headroom for
/// test streams.
pub const MAX_DDCS: usize = 8;

/// Where one DDC's samples go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Receiver(usize),
    PsReference,
    PsFeedback,
    DiversityMain,
    DiversityAux,
    Discard,
}

/// The subset of [`RadioSettings`] the decoder needs, copied once per
/// chunk so the settings lock is never held while samples flow.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RouteConfig {
    pub device: DeviceType,
    pub receivers: usize,
    pub ddcs: usize,
    pub diversity: bool,
    pub puresignal: bool,
    pub mic_divisor: u32,
}

impl From<&RadioSettings> for RouteConfig {
    fn from(s: &RadioSettings) -> Self {
        Self {
            device: s.device,
            receivers: s.receivers.clamp(1, 2) as usize,
            ddcs: s.ddc_count() as usize,
            diversity: s.diversity.enabled,
            puresignal: s.puresignal_active(),
            mic_divisor: s.mic_sample_divisor(),
        }
    }
}

impl Default for RouteConfig {
    fn default() -> Self {
        Self::from(&RadioSettings::default())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelMap {
    routes: [Route; MAX_DDCS],
    ddcs: usize,
    puresignal: bool,
}

impl ChannelMap {
    pub fn new(cfg: &RouteConfig, transmitting: bool) -> Self {
        let ddcs = cfg.ddcs.clamp(1, MAX_DDCS);
        let mut routes = [Route::Discard; MAX_DDCS];
        let ps_pair = cfg
            .device
            .rx_feedback_channel()
            .zip(cfg.device.tx_feedback_channel())
            .map(|(r, t)| (r as usize, t as usize));

        let puresignal = match ps_pair {
            Some((reference, feedback)) if cfg.puresignal && transmitting && feedback < ddcs => {
                routes[reference] = Route::PsReference;
                routes[feedback] = Route::PsFeedback;
                true
            }
            _ => {
                if cfg.diversity && ddcs >= 2 {
                    routes[0] = Route::DiversityMain;
                    routes[1] = Route::DiversityAux;
                } else {
                    routes[0] = Route::Receiver(0);
                    if cfg.receivers > 1 && ddcs > 1 {
                        routes[1] = Route::Receiver(1);
                    }
                }
                false
            }
        };

        Self {
            routes,
            ddcs,
            puresignal,
        }
    }

    pub fn route(&self, ddc: usize) -> Route {
        self.routes.get(ddc).copied().unwrap_or(Route::Discard)
    }

    pub fn ddc_count(&self) -> usize {
        self.ddcs
    }

    pub fn puresignal(&self) -> bool {
        self.puresignal
    }
}

/// Reduces the per-group mic stream to 48 kHz and merges in a host
/// microphone when one is capturing.
#[derive(Debug)]
pub struct MicDecimator {
    divisor: u32,
    count: u32,
}

impl MicDecimator {
    pub fn new(divisor: u32) -> Self {
        Self {
            divisor: divisor.max(1),
            count: 0,
        }
    }

    pub fn set_divisor(&mut self, divisor: u32) {
        let divisor = divisor.max(1);
        if divisor != self.divisor {
            self.divisor = divisor;
            self.count = 0;
        }
    }

    /// Feed one radio mic sample. Returns the sample to forward on every
    /// `divisor`th call.
    pub fn push<M: LocalMicrophone + ?Sized>(
        &mut self,
        radio: f64,
        local: Option<&mut M>,
        radio_ptt: bool,
    ) -> Option<f64> {
        self.count += 1;
        if self.count < self.divisor {
            return None;
        }
        self.count = 0;
        Some(match local {
            Some(mic) if mic.is_active() => {
                let host = mic.next_sample().unwrap_or(0.0);
                if radio_ptt {
                    radio + host
                } else {
                    host
                }
            }
            _ => radio,
        })
    }
}

/// [`FrameHandler`] that routes decoded samples into a [`DspSink`] and
/// keeps the radio telemetry current.
pub struct SampleRouter {
    sink: Box<dyn DspSink>,
    local_mic: Option<Box<dyn LocalMicrophone>>,
    session: Arc<SessionState>,
    config: RouteConfig,
    map: ChannelMap,
    mic: MicDecimator,
    ps_reference: Complex<f64>,
    ps_feedback: Complex<f64>,
    diversity_main: Complex<f64>,
}

impl SampleRouter {
    pub fn new(
        sink: Box<dyn DspSink>,
        local_mic: Option<Box<dyn LocalMicrophone>>,
        session: Arc<SessionState>,
        config: RouteConfig,
    ) -> Self {
        let map = ChannelMap::new(&config, false);
        Self {
            sink,
            local_mic,
            session,
            mic: MicDecimator::new(config.mic_divisor),
            config,
            map,
            ps_reference: Complex::new(0.0, 0.0),
            ps_feedback: Complex::new(0.0, 0.0),
            diversity_main: Complex::new(0.0, 0.0),
        }
    }

    /// Adopt new settings; the channel map is rebuilt at the next control block.
    pub fn configure(&mut self, config: RouteConfig) {
        self.mic.set_divisor(config.mic_divisor);
        self.config = config;
    }

    pub fn channel_map(&self) -> &ChannelMap {
        &self.map
    }
}

impl FrameHandler for SampleRouter {
    fn on_control(&mut self, block: ControlBlock) -> usize {
        self.session.status.update(&block, self.config.device);
        self.map = ChannelMap::new(&self.config, self.session.mox());
        self.map.ddc_count()
    }

    fn on_iq(&mut self, ddc: usize, iq: Complex<f64>) {
        match self.map.route(ddc) {
            Route::Receiver(rx) => self.sink.add_iq_samples(rx, iq),
            Route::PsReference => self.ps_reference = iq,
            Route::PsFeedback => self.ps_feedback = iq,
            Route::DiversityMain => self.diversity_main = iq,
            Route::DiversityAux => {
                self.sink.add_diversity_samples(self.diversity_main, iq);
                if self.config.receivers > 1 {
                    self.sink.add_iq_samples(1, iq);
                }
            }
            Route::Discard => {}
        }
        if self.map.puresignal() && ddc + 1 == self.map.ddc_count() {
            self.sink
                .add_ps_iq_samples(self.ps_reference, self.ps_feedback);
        }
    }

    fn on_mic(&mut self, sample: f64) {
        let ptt = self.session.status.ptt.load(Ordering::Relaxed);
        let local = self.local_mic.as_deref_mut();
        if let Some(out) = self.mic.push(sample, local, ptt) {
            self.sink.add_mic_sample(out);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    pub(crate) enum Event {
        Iq(usize, Complex<f64>),
        Mic(f64),
        Ps(Complex<f64>, Complex<f64>),
        Diversity(Complex<f64>, Complex<f64>),
    }

    #[derive(Clone, Default)]
    pub(crate) struct SharedSink(pub Arc<Mutex<Vec<Event>>>);

    impl DspSink for SharedSink {
        fn add_iq_samples(&mut self, rx: usize, iq: Complex<f64>) {
            self.0.lock().unwrap().push(Event::Iq(rx, iq));
        }
        fn add_mic_sample(&mut self, sample: f64) {
            self.0.lock().unwrap().push(Event::Mic(sample));
        }
        fn add_ps_iq_samples(&mut self, reference: Complex<f64>, feedback: Complex<f64>) {
            self.0.lock().unwrap().push(Event::Ps(reference, feedback));
        }
        fn add_diversity_samples(&mut self, main: Complex<f64>, aux: Complex<f64>) {
            self.0.lock().unwrap().push(Event::Diversity(main, aux));
        }
    }

    struct ConstMic(f64);

    impl LocalMicrophone for ConstMic {
        fn is_active(&self) -> bool {
            true
        }
        fn next_sample(&mut self) -> Option<f64> {
            Some(self.0)
        }
    }

    fn c(v: f64) -> Complex<f64> {
        Complex::new(v, -v)
    }

    fn config(device: DeviceType) -> RouteConfig {
        RouteConfig {
            device,
            ..Default::default()
        }
    }

    #[test]
    fn default_map_discards_extra_ddcs() {
        let mut cfg = config(DeviceType::Hermes);
        cfg.ddcs = 4;
        let map = ChannelMap::new(&cfg, false);
        assert_eq!(map.route(0), Route::Receiver(0));
        assert_eq!(map.route(1), Route::Discard);
        cfg.receivers = 2;
        let map = ChannelMap::new(&cfg, false);
        assert_eq!(map.route(1), Route::Receiver(1));
        assert_eq!(map.route(3), Route::Discard);
    }

    #[test]
    fn puresignal_only_while_transmitting() {
        let mut cfg = config(DeviceType::Orion);
        cfg.puresignal = true;
        cfg.ddcs = 5;
        let rx = ChannelMap::new(&cfg, false);
        assert!(!rx.puresignal());
        assert_eq!(rx.route(3), Route::Discard);
        let tx = ChannelMap::new(&cfg, true);
        assert_eq!(tx.route(3), Route::PsReference);
        assert_eq!(tx.route(4), Route::PsFeedback);
        assert_eq!(tx.route(0), Route::Discard);
    }

    #[test]
    fn router_forwards_ps_pair_after_last_ddc() {
        let sink = SharedSink::default();
        let session = Arc::new(SessionState::new());
        let mut cfg = config(DeviceType::Hermes);
        cfg.puresignal = true;
        cfg.ddcs = 4;
        let mut router = SampleRouter::new(Box::new(sink.clone()), None, session.clone(), cfg);
        session.set_mox(true);
        assert_eq!(router.on_control(ControlBlock::default()), 4);
        for ddc in 0..4 {
            router.on_iq(ddc, c(ddc as f64));
        }
        assert_eq!(*sink.0.lock().unwrap(), vec![Event::Ps(c(2.0), c(3.0))]);
    }

    #[test]
    fn diversity_pairs_and_feeds_second_receiver() {
        let sink = SharedSink::default();
        let session = Arc::new(SessionState::new());
        let mut cfg = config(DeviceType::Angelia);
        cfg.diversity = true;
        cfg.receivers = 2;
        cfg.ddcs = 2;
        let mut router = SampleRouter::new(Box::new(sink.clone()), None, session, cfg);
        router.on_control(ControlBlock::default());
        router.on_iq(0, c(0.1));
        router.on_iq(1, c(0.2));
        assert_eq!(
            *sink.0.lock().unwrap(),
            vec![Event::Diversity(c(0.1), c(0.2)), Event::Iq(1, c(0.2))]
        );
    }

    #[test]
    fn mic_is_decimated() {
        let sink = SharedSink::default();
        let session = Arc::new(SessionState::new());
        let mut cfg = config(DeviceType::Hermes);
        cfg.mic_divisor = 4;
        let mut router = SampleRouter::new(Box::new(sink.clone()), None, session, cfg);
        for i in 0..8 {
            router.on_mic(i as f64);
        }
        assert_eq!(*sink.0.lock().unwrap(), vec![Event::Mic(3.0), Event::Mic(7.0)]);
    }

    #[test]
    fn local_mic_mixes_only_with_radio_ptt() {
        let mut dec = MicDecimator::new(1);
        let mut mic = ConstMic(0.25);
        assert_eq!(dec.push(0.5, Some(&mut mic), false), Some(0.25));
        assert_eq!(dec.push(0.5, Some(&mut mic), true), Some(0.75));
        assert_eq!(dec.push(0.5, None::<&mut ConstMic>, true), Some(0.5));
    }
}
