//! Metis envelope and Ozy sub-buffer layout.
//!
//! ```text
//! [EF FE][type][endpoint][seq:4 BE][512-byte sub-buffer][512-byte sub-buffer]
//! sub-buffer: [7F 7F 7F][C0 C1 C2 C3 C4][504 bytes payload]
//! ```

pub const METIS_SYNC: [u8; 2] = [0xEF, 0xFE];
pub const METIS_HEADER_LEN: usize = 8;
pub const OZY_BUFFER_LEN: usize = 512;
pub const METIS_FRAME_LEN: usize = METIS_HEADER_LEN + 2 * OZY_BUFFER_LEN;
/// Payload bytes after the sync and control block of one sub-buffer.
pub const OZY_PAYLOAD_LEN: usize = OZY_BUFFER_LEN - 8;
pub const SYNC: u8 = 0x7F;
pub const START_STOP_LEN: usize = 64;

pub const TYPE_DATA: u8 = 0x01;
pub const TYPE_DISCOVERY: u8 = 0x02;
pub const TYPE_DISCOVERY_BUSY: u8 = 0x03;
pub const TYPE_START_STOP: u8 = 0x04;

/// Host to radio: TX I/Q and audio.
pub const EP_HOST_DATA: u8 = 0x02;
/// Radio to host: wideband ADC samples.
pub const EP_WIDEBAND: u8 = 0x04;
/// Radio to host: RX I/Q and mic.
pub const EP_RX_DATA: u8 = 0x06;

pub const START_IQ: u8 = 0x01;
pub const START_IQ_WIDEBAND: u8 = 0x03;
pub const STOP: u8 = 0x00;

/// The 5-byte C&C field of one sub-buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ControlBlock(pub [u8; 5]);

impl ControlBlock {
    pub fn new(c0: u8, c1: u8, c2: u8, c3: u8, c4: u8) -> Self {
        Self([c0, c1, c2, c3, c4])
    }

    pub fn c0(&self) -> u8 {
        self.0[0]
    }

    /// Command address, C0 with the MOX bit masked off.
    pub fn address(&self) -> u8 {
        self.0[0] & 0xFE
    }

    pub fn mox(&self) -> bool {
        self.0[0] & 0x01 != 0
    }

    pub fn payload(&self) -> u32 {
        u32::from_be_bytes([self.0[1], self.0[2], self.0[3], self.0[4]])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetisHeader {
    pub kind: u8,
    pub endpoint: u8,
    pub sequence: u32,
}

impl MetisHeader {
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < METIS_HEADER_LEN || data[0..2] != METIS_SYNC {
            return None;
        }
        Some(Self {
            kind: data[2],
            endpoint: data[3],
            sequence: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
        })
    }

    pub fn write(&self, buf: &mut [u8]) {
        buf[0..2].copy_from_slice(&METIS_SYNC);
        buf[2] = self.kind;
        buf[3] = self.endpoint;
        buf[4..8].copy_from_slice(&self.sequence.to_be_bytes());
    }
}

/// Write `[7F 7F 7F][C0..C4][payload]` into a 512-byte sub-buffer.
pub fn write_ozy_buffer(buf: &mut [u8], control: &ControlBlock, payload: &[u8]) {
    buf[0..3].fill(SYNC);
    buf[3..8].copy_from_slice(&control.0);
    let n = payload.len().min(OZY_PAYLOAD_LEN);
    buf[8..8 + n].copy_from_slice(&payload[..n]);
    buf[8 + n..OZY_BUFFER_LEN].fill(0);
}

/// Build a complete host data frame from two control blocks and two
/// 504-byte payloads.
pub fn build_data_frame(
    sequence: u32,
    endpoint: u8,
    blocks: [&ControlBlock; 2],
    payloads: [&[u8]; 2],
) -> [u8; METIS_FRAME_LEN] {
    let mut frame = [0u8; METIS_FRAME_LEN];
    MetisHeader {
        kind: TYPE_DATA,
        endpoint,
        sequence,
    }
    .write(&mut frame);
    for half in 0..2 {
        let off = METIS_HEADER_LEN + half * OZY_BUFFER_LEN;
        write_ozy_buffer(
            &mut frame[off..off + OZY_BUFFER_LEN],
            blocks[half],
            payloads[half],
        );
    }
    frame
}

pub fn start_stop_packet(command: u8) -> [u8; START_STOP_LEN] {
    let mut buf = [0u8; START_STOP_LEN];
    buf[0..2].copy_from_slice(&METIS_SYNC);
    buf[2] = TYPE_START_STOP;
    buf[3] = command;
    buf
}

/// Dropped-packet detection on the incoming sequence counter.
///
/// A value of 0 is a restart from the radio and never counts as a gap.
#[derive(Debug, Default)]
pub struct SequenceTracker {
    last: Option<u32>,
    errors: u64,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a sequence number. Returns true when it was a gap.
    pub fn observe(&mut self, sequence: u32) -> bool {
        let gap = match self.last {
            _ if sequence == 0 => false,
            Some(last) => sequence != last.wrapping_add(1),
            None => false,
        };
        if gap {
            self.errors += 1;
        }
        self.last = Some(sequence);
        gap
    }

    pub fn errors(&self) -> u64 {
        self.errors
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let mut buf = [0u8; 8];
        MetisHeader {
            kind: TYPE_DATA,
            endpoint: EP_RX_DATA,
            sequence: 0x0102_0304,
        }
        .write(&mut buf);
        assert_eq!(buf, [0xEF, 0xFE, 0x01, 0x06, 0x01, 0x02, 0x03, 0x04]);
        assert_eq!(MetisHeader::parse(&buf).unwrap().sequence, 0x0102_0304);
        assert!(MetisHeader::parse(&[0xEF, 0xFF, 1, 6, 0, 0, 0, 0]).is_none());
    }

    #[test]
    fn data_frame_layout() {
        let a = ControlBlock::new(0x00, 1, 2, 3, 4);
        let b = ControlBlock::new(0x03, 5, 6, 7, 8);
        let p = [0xAAu8; OZY_PAYLOAD_LEN];
        let frame = build_data_frame(7, EP_HOST_DATA, [&a, &b], [&p, &p]);
        assert_eq!(frame.len(), 1032);
        assert_eq!(&frame[0..8], &[0xEF, 0xFE, 0x01, 0x02, 0, 0, 0, 7]);
        assert_eq!(&frame[8..16], &[0x7F, 0x7F, 0x7F, 0x00, 1, 2, 3, 4]);
        assert_eq!(&frame[520..528], &[0x7F, 0x7F, 0x7F, 0x03, 5, 6, 7, 8]);
        assert_eq!(frame[1031], 0xAA);
    }

    #[test]
    fn start_stop_is_padded() {
        let start = start_stop_packet(START_IQ);
        assert_eq!(start.len(), 64);
        assert_eq!(&start[0..4], &[0xEF, 0xFE, 0x04, 0x01]);
        assert!(start[4..].iter().all(|&b| b == 0));
        assert_eq!(start_stop_packet(STOP)[3], 0);
    }

    #[test]
    fn sequence_gaps_counted_once_per_discontinuity() {
        let mut t = SequenceTracker::new();
        for s in [5, 6, 7, 9, 10, 0, 1, 2, 4, 5] {
            t.observe(s);
        }
        // 7 -> 9 and 2 -> 4; the 0 is a restart.
        assert_eq!(t.errors(), 2);
    }

    #[test]
    fn restart_after_any_value_is_benign() {
        let mut t = SequenceTracker::new();
        assert!(!t.observe(1000));
        assert!(!t.observe(0));
        assert!(!t.observe(1));
        assert!(!t.observe(0));
        assert!(!t.observe(0));
        assert_eq!(t.errors(), 0);
    }

    #[test]
    fn sequence_wraps() {
        let mut t = SequenceTracker::new();
        t.observe(u32::MAX);
        assert!(!t.observe(0));
        t.observe(u32::MAX - 1);
        assert!(t.observe(1));
    }

    #[test]
    fn random_gap_sequences() {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        for _ in 0..50 {
            let mut t = SequenceTracker::new();
            let mut expected = 0;
            let mut seq: u32 = rng.gen_range(1..1000);
            t.observe(seq);
            for _ in 0..200 {
                let step = rng.gen_range(0..4u32);
                let next = match step {
                    0 => 0,
                    1 => seq + rng.gen_range(2..5),
                    _ => seq + 1,
                };
                if next != 0 && next != seq + 1 {
                    expected += 1;
                }
                t.observe(next);
                seq = next;
            }
            assert_eq!(t.errors(), expected);
        }
    }
}
