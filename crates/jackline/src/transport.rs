//! Transport state, positions and the lock-free transport handle
//!
//! The server publishes one [`TransportPosition`] per cycle. Readers on any
//! thread take snapshots through a [`PositionCell`], a sequence lock built
//! from atomics: the writer bumps `unique_1` before touching the payload and
//! sets `unique_2` to the same value afterwards. A snapshot whose two stamps
//! differ was torn by a concurrent write and is retried.
//!
//! ```text
//!  writer:  unique_1 = n ─► payload ─► unique_2 = n
//!  reader:  unique_2 ─► payload ─► unique_1   (equal ⇒ consistent)
//! ```
//!
//! Nothing here takes a lock or allocates, so [`Transport`] may be used from
//! the process callback.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::sync::atomic::{fence, AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result, EINVAL};
use crate::types::{Frames, Time};

/// Attempts before a snapshot read gives up with [`Error::TornRead`]
pub const MAX_READ_ATTEMPTS: usize = 64;

/// Transport state machine
///
/// `Starting` means a start was requested and slow-sync clients are being
/// polled; `Stopped` with a fresh position means a relocation is being
/// synchronized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TransportState {
    #[default]
    Stopped,
    Rolling,
    Starting,
    /// Waiting for network peers; only reported by native servers
    NetStarting,
}

impl TransportState {
    /// Server numeric code
    pub fn code(self) -> u32 {
        match self {
            TransportState::Stopped => 0,
            TransportState::Rolling => 1,
            TransportState::Starting => 3,
            TransportState::NetStarting => 4,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(TransportState::Stopped),
            1 => Some(TransportState::Rolling),
            3 => Some(TransportState::Starting),
            4 => Some(TransportState::NetStarting),
            _ => None,
        }
    }
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransportState::Stopped => "stopped",
            TransportState::Rolling => "rolling",
            TransportState::Starting => "starting",
            TransportState::NetStarting => "net-starting",
        })
    }
}

/// Which optional field groups of a [`TransportPosition`] are valid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PositionBits(u32);

impl PositionBits {
    /// bar, beat, tick, bar_start_tick and the tempo/meter fields
    pub const BBT: PositionBits = PositionBits(0x10);
    /// frame_time, next_time
    pub const TIMECODE: PositionBits = PositionBits(0x20);
    pub const BBT_FRAME_OFFSET: PositionBits = PositionBits(0x40);
    pub const AUDIO_VIDEO_RATIO: PositionBits = PositionBits(0x80);
    pub const VIDEO_FRAME_OFFSET: PositionBits = PositionBits(0x100);
    /// tick_double
    pub const TICK_DOUBLE: PositionBits = PositionBits(0x200);

    const ALL: u32 = 0x10 | 0x20 | 0x40 | 0x80 | 0x100 | 0x200;

    pub const fn empty() -> Self {
        PositionBits(0)
    }

    pub const fn from_bits(bits: u32) -> Self {
        PositionBits(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: PositionBits) -> bool {
        self.0 & other.0 == other.0
    }

    /// True if only known bits are set
    pub const fn is_known(self) -> bool {
        self.0 & !Self::ALL == 0
    }

    pub fn remove(&mut self, other: PositionBits) {
        self.0 &= !other.0;
    }
}

impl BitOr for PositionBits {
    type Output = PositionBits;

    fn bitor(self, rhs: PositionBits) -> PositionBits {
        PositionBits(self.0 | rhs.0)
    }
}

impl BitOrAssign for PositionBits {
    fn bitor_assign(&mut self, rhs: PositionBits) {
        self.0 |= rhs.0;
    }
}

/// Bar/beat/tick musical position plus tempo and meter
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Bbt {
    /// 1-based bar number
    pub bar: i32,
    /// 1-based beat within the bar
    pub beat: i32,
    /// 0-based tick within the beat
    pub tick: i32,
    pub bar_start_tick: f64,
    pub beats_per_bar: f32,
    pub beat_type: f32,
    pub ticks_per_beat: f64,
    pub beats_per_minute: f64,
}

/// Snapshot of the transport position
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TransportPosition {
    pub unique_1: u64,
    /// Monotonic microsecond time at the start of the cycle
    pub usecs: Time,
    pub frame_rate: Frames,
    pub frame: Frames,
    pub valid: PositionBits,

    pub bar: i32,
    pub beat: i32,
    pub tick: i32,
    pub bar_start_tick: f64,
    pub beats_per_bar: f32,
    pub beat_type: f32,
    pub ticks_per_beat: f64,
    pub beats_per_minute: f64,

    pub frame_time: f64,
    pub next_time: f64,

    pub bbt_offset: Frames,
    pub audio_frames_per_video_frame: f32,
    pub video_offset: Frames,
    /// Fractional tick carried between cycles
    pub tick_double: f64,

    pub unique_2: u64,
}

impl TransportPosition {
    /// Position at `frame` with no optional fields
    pub fn at_frame(frame: Frames) -> Self {
        TransportPosition {
            frame,
            ..Default::default()
        }
    }

    /// True when the snapshot was not torn by a concurrent write
    pub fn is_consistent(&self) -> bool {
        self.unique_1 == self.unique_2
    }

    pub fn bbt(&self) -> Option<Bbt> {
        if !self.valid.contains(PositionBits::BBT) {
            return None;
        }
        Some(Bbt {
            bar: self.bar,
            beat: self.beat,
            tick: self.tick,
            bar_start_tick: self.bar_start_tick,
            beats_per_bar: self.beats_per_bar,
            beat_type: self.beat_type,
            ticks_per_beat: self.ticks_per_beat,
            beats_per_minute: self.beats_per_minute,
        })
    }

    /// `(frame_time, next_time)` in seconds, if timecode is valid
    pub fn timecode(&self) -> Option<(f64, f64)> {
        self.valid
            .contains(PositionBits::TIMECODE)
            .then_some((self.frame_time, self.next_time))
    }

    pub fn bbt_offset(&self) -> Option<Frames> {
        self.valid
            .contains(PositionBits::BBT_FRAME_OFFSET)
            .then_some(self.bbt_offset)
    }

    pub fn audio_frames_per_video_frame(&self) -> Option<f32> {
        self.valid
            .contains(PositionBits::AUDIO_VIDEO_RATIO)
            .then_some(self.audio_frames_per_video_frame)
    }

    pub fn video_offset(&self) -> Option<Frames> {
        self.valid
            .contains(PositionBits::VIDEO_FRAME_OFFSET)
            .then_some(self.video_offset)
    }

    /// Store musical position fields and mark them valid
    pub fn set_bbt(&mut self, bbt: Bbt) {
        self.bar = bbt.bar;
        self.beat = bbt.beat;
        self.tick = bbt.tick;
        self.bar_start_tick = bbt.bar_start_tick;
        self.beats_per_bar = bbt.beats_per_bar;
        self.beat_type = bbt.beat_type;
        self.ticks_per_beat = bbt.ticks_per_beat;
        self.beats_per_minute = bbt.beats_per_minute;
        self.valid |= PositionBits::BBT;
    }

    /// Invalidate every optional field group
    pub fn clear_extended(&mut self) {
        self.valid = PositionBits::empty();
    }

    /// Copy every optional field (and the validity bits) from `other`
    pub fn copy_extended_from(&mut self, other: &TransportPosition) {
        let (frame, usecs, frame_rate) = (self.frame, self.usecs, self.frame_rate);
        let (u1, u2) = (self.unique_1, self.unique_2);
        *self = *other;
        self.frame = frame;
        self.usecs = usecs;
        self.frame_rate = frame_rate;
        self.unique_1 = u1;
        self.unique_2 = u2;
    }

    fn encode(&self) -> [u64; WORDS] {
        [
            self.usecs,
            self.frame_rate as u64,
            self.frame as u64,
            self.valid.bits() as u64,
            self.bar as u32 as u64,
            self.beat as u32 as u64,
            self.tick as u32 as u64,
            self.bar_start_tick.to_bits(),
            self.beats_per_bar.to_bits() as u64,
            self.beat_type.to_bits() as u64,
            self.ticks_per_beat.to_bits(),
            self.beats_per_minute.to_bits(),
            self.frame_time.to_bits(),
            self.next_time.to_bits(),
            self.bbt_offset as u64,
            self.audio_frames_per_video_frame.to_bits() as u64,
            self.video_offset as u64,
            self.tick_double.to_bits(),
        ]
    }

    fn decode(words: &[u64; WORDS], unique_1: u64, unique_2: u64) -> Self {
        TransportPosition {
            unique_1,
            usecs: words[0],
            frame_rate: words[1] as Frames,
            frame: words[2] as Frames,
            valid: PositionBits::from_bits(words[3] as u32),
            bar: words[4] as u32 as i32,
            beat: words[5] as u32 as i32,
            tick: words[6] as u32 as i32,
            bar_start_tick: f64::from_bits(words[7]),
            beats_per_bar: f32::from_bits(words[8] as u32),
            beat_type: f32::from_bits(words[9] as u32),
            ticks_per_beat: f64::from_bits(words[10]),
            beats_per_minute: f64::from_bits(words[11]),
            frame_time: f64::from_bits(words[12]),
            next_time: f64::from_bits(words[13]),
            bbt_offset: words[14] as Frames,
            audio_frames_per_video_frame: f32::from_bits(words[15] as u32),
            video_offset: words[16] as Frames,
            tick_double: f64::from_bits(words[17]),
            unique_2,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Sequence-locked position cell
// ═══════════════════════════════════════════════════════════════════════════════

const WORDS: usize = 18;

/// Single-writer, multi-reader storage for a [`TransportPosition`]
pub struct PositionCell {
    unique_1: AtomicU64,
    words: [AtomicU64; WORDS],
    unique_2: AtomicU64,
}

impl PositionCell {
    pub fn new(position: TransportPosition) -> Self {
        let cell = PositionCell {
            unique_1: AtomicU64::new(0),
            words: std::array::from_fn(|_| AtomicU64::new(0)),
            unique_2: AtomicU64::new(0),
        };
        cell.store(&position);
        cell
    }

    /// Publish a new position. Only one thread may store at a time.
    pub fn store(&self, position: &TransportPosition) {
        let stamp = self.unique_1.load(Ordering::Relaxed).wrapping_add(1);
        self.unique_1.store(stamp, Ordering::Relaxed);
        fence(Ordering::Release);
        for (slot, word) in self.words.iter().zip(position.encode()) {
            slot.store(word, Ordering::Relaxed);
        }
        self.unique_2.store(stamp, Ordering::Release);
    }

    /// One read attempt; the result may be torn (check `is_consistent`)
    pub fn snapshot(&self) -> TransportPosition {
        let unique_2 = self.unique_2.load(Ordering::Acquire);
        let mut words = [0u64; WORDS];
        for (word, slot) in words.iter_mut().zip(self.words.iter()) {
            *word = slot.load(Ordering::Relaxed);
        }
        fence(Ordering::Acquire);
        let unique_1 = self.unique_1.load(Ordering::Relaxed);
        TransportPosition::decode(&words, unique_1, unique_2)
    }

    /// Read a consistent snapshot, retrying torn reads a bounded number of times
    pub fn load(&self) -> Result<TransportPosition> {
        for _ in 0..MAX_READ_ATTEMPTS {
            let position = self.snapshot();
            if position.is_consistent() {
                return Ok(position);
            }
            std::hint::spin_loop();
        }
        Err(Error::TornRead)
    }
}

impl fmt::Debug for PositionCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PositionCell")
            .field("position", &self.snapshot())
            .finish()
    }
}

/// Reject reposition requests carrying unknown validity bits
pub(crate) fn validate_request(position: &TransportPosition) -> Result<()> {
    if position.valid.is_known() {
        Ok(())
    } else {
        Err(Error::Operation {
            op: "transport reposition",
            code: EINVAL,
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Transport handle
// ═══════════════════════════════════════════════════════════════════════════════

/// Backend side of transport control; every method must be lock-free
pub trait TransportControl: Send + Sync {
    fn start(&self);
    fn stop(&self);
    /// Request a new position; takes effect within two cycles
    fn reposition(&self, position: &TransportPosition) -> Result<()>;
    fn query(&self) -> Result<(TransportState, TransportPosition)>;
    /// Estimated current frame, interpolated inside the cycle when rolling
    fn current_frame(&self) -> Frames;
}

/// Cloneable transport handle, usable from any thread including callbacks
#[derive(Clone)]
pub struct Transport {
    control: Arc<dyn TransportControl>,
}

impl Transport {
    pub(crate) fn new(control: Arc<dyn TransportControl>) -> Self {
        Transport { control }
    }

    pub fn start(&self) {
        self.control.start();
    }

    pub fn stop(&self) {
        self.control.stop();
    }

    /// Relocate to `frame`, dropping any musical position
    pub fn locate(&self, frame: Frames) -> Result<()> {
        self.control.reposition(&TransportPosition::at_frame(frame))
    }

    /// Relocate with a full position; only `frame` and the fields flagged
    /// in `valid` are used
    pub fn reposition(&self, position: &TransportPosition) -> Result<()> {
        validate_request(position)?;
        self.control.reposition(position)
    }

    pub fn query(&self) -> Result<(TransportState, TransportPosition)> {
        self.control.query()
    }

    pub fn state(&self) -> Result<TransportState> {
        self.control.query().map(|(state, _)| state)
    }

    pub fn position(&self) -> Result<TransportPosition> {
        self.control.query().map(|(_, position)| position)
    }

    pub fn current_frame(&self) -> Frames {
        self.control.current_frame()
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    fn sample_position(frame: Frames) -> TransportPosition {
        let mut position = TransportPosition::at_frame(frame);
        position.frame_rate = 48_000;
        position.usecs = frame as u64 * 10;
        position.set_bbt(Bbt {
            bar: 3,
            beat: 2,
            tick: 17,
            bar_start_tick: 15_360.0,
            beats_per_bar: 4.0,
            beat_type: 4.0,
            ticks_per_beat: 1920.0,
            beats_per_minute: 120.0,
        });
        position
    }

    #[test]
    fn test_state_codes() {
        for state in [
            TransportState::Stopped,
            TransportState::Rolling,
            TransportState::Starting,
            TransportState::NetStarting,
        ] {
            assert_eq!(TransportState::from_code(state.code()), Some(state));
        }
        assert_eq!(TransportState::from_code(2), None);
    }

    #[test]
    fn test_cell_preserves_fields() {
        let cell = PositionCell::new(TransportPosition::default());
        let position = sample_position(4096);
        cell.store(&position);

        let loaded = cell.load().unwrap();
        assert!(loaded.is_consistent());
        assert_eq!(loaded.frame, 4096);
        assert_eq!(loaded.bbt(), position.bbt());
        assert_eq!(loaded.usecs, 40_960);
    }

    #[test]
    fn test_torn_snapshot_detected() {
        let cell = PositionCell::new(sample_position(0));
        // Simulate a writer that bumped the opening stamp and stalled
        cell.unique_1.fetch_add(1, Ordering::Relaxed);
        assert!(!cell.snapshot().is_consistent());
        assert!(matches!(cell.load(), Err(Error::TornRead)));
    }

    #[test]
    fn test_concurrent_reads_never_torn() {
        let cell = Arc::new(PositionCell::new(sample_position(0)));
        let done = Arc::new(AtomicBool::new(false));

        let reader = {
            let cell = cell.clone();
            let done = done.clone();
            std::thread::spawn(move || {
                let mut checked = 0usize;
                while !done.load(Ordering::Acquire) || checked == 0 {
                    if let Ok(position) = cell.load() {
                        // Every published position keeps usecs == frame * 10
                        assert_eq!(position.usecs, position.frame as u64 * 10);
                        checked += 1;
                    }
                }
                checked
            })
        };

        for frame in 0..20_000 {
            cell.store(&sample_position(frame));
        }
        done.store(true, Ordering::Release);
        assert!(reader.join().unwrap() > 0);
    }

    #[test]
    fn test_request_validation() {
        let mut position = TransportPosition::at_frame(10);
        assert!(validate_request(&position).is_ok());
        position.valid = PositionBits::from_bits(0x1);
        assert!(validate_request(&position).is_err());
    }

    #[test]
    fn test_copy_extended_keeps_frame() {
        let mut target = TransportPosition::at_frame(100);
        target.copy_extended_from(&sample_position(7));
        assert_eq!(target.frame, 100);
        assert_eq!(target.bar, 3);
        assert!(target.valid.contains(PositionBits::BBT));
    }

    #[test]
    fn test_optional_groups_follow_valid_bits() {
        let mut position = TransportPosition::at_frame(0);
        position.frame_time = 1.5;
        position.video_offset = 12;
        assert_eq!(position.timecode(), None);
        assert_eq!(position.video_offset(), None);

        position.valid |= PositionBits::TIMECODE | PositionBits::VIDEO_FRAME_OFFSET;
        assert_eq!(position.timecode(), Some((1.5, 0.0)));
        assert_eq!(position.video_offset(), Some(12));
        assert_eq!(position.bbt_offset(), None);
    }
}
