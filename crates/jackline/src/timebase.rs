//! Musical time computation for timebase masters
//!
//! A timebase master fills the bar/beat/tick fields of the position the
//! server is about to publish. [`TimebaseMaster`] implements the usual
//! strategy: compute the musical position from the frame whenever the
//! server signals a new position, otherwise advance the previous position
//! by one cycle.
//!
//! Ticks are truncated when stored in `tick`. The fractional remainder is
//! carried in `tick_double` so the incremental path does not drift away from
//! the absolute one.

use crate::transport::{Bbt, PositionBits, TransportPosition, TransportState};
use crate::types::Frames;

/// Tempo and meter used to derive bar/beat/tick from frames
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimebaseMaster {
    pub beats_per_minute: f64,
    pub beats_per_bar: f32,
    pub beat_type: f32,
    pub ticks_per_beat: f64,
}

impl Default for TimebaseMaster {
    fn default() -> Self {
        TimebaseMaster {
            beats_per_minute: 120.0,
            beats_per_bar: 4.0,
            beat_type: 4.0,
            ticks_per_beat: 1920.0,
        }
    }
}

impl TimebaseMaster {
    pub fn new(beats_per_minute: f64, beats_per_bar: f32, beat_type: f32, ticks_per_beat: f64) -> Self {
        TimebaseMaster {
            beats_per_minute,
            beats_per_bar,
            beat_type,
            ticks_per_beat,
        }
    }

    fn beats_in_bar(&self) -> i64 {
        (self.beats_per_bar.round() as i64).max(1)
    }

    fn ticks_for_frames(&self, frames: f64, frame_rate: Frames) -> f64 {
        frames * self.ticks_per_beat * self.beats_per_minute / (frame_rate as f64 * 60.0)
    }

    fn bbt(&self, bar: i32, beat: i32, tick: i32, bar_start_tick: f64) -> Bbt {
        Bbt {
            bar,
            beat,
            tick,
            bar_start_tick,
            beats_per_bar: self.beats_per_bar,
            beat_type: self.beat_type,
            ticks_per_beat: self.ticks_per_beat,
            beats_per_minute: self.beats_per_minute,
        }
    }

    /// Musical position of `frame`, plus the fractional tick
    pub fn absolute(&self, frame: Frames, frame_rate: Frames) -> (Bbt, f64) {
        let exact = self.ticks_for_frames(frame as f64, frame_rate);
        let whole = exact.floor();
        let total_ticks = whole as i64;
        let ticks_per_beat = (self.ticks_per_beat as i64).max(1);
        let beats = total_ticks / ticks_per_beat;
        let tick = total_ticks % ticks_per_beat;
        let bar = beats / self.beats_in_bar();
        let beat = beats % self.beats_in_bar();
        let bar_start_tick = bar as f64 * self.beats_in_bar() as f64 * self.ticks_per_beat;
        (
            self.bbt(bar as i32 + 1, beat as i32 + 1, tick as i32, bar_start_tick),
            exact - whole,
        )
    }

    /// Advance `previous` by `nframes`, carrying tick → beat → bar
    pub fn advance(&self, previous: &Bbt, fraction: f64, nframes: Frames, frame_rate: Frames) -> (Bbt, f64) {
        let mut tick = previous.tick as f64 + fraction + self.ticks_for_frames(nframes as f64, frame_rate);
        let mut beat = previous.beat;
        let mut bar = previous.bar;
        let mut bar_start_tick = previous.bar_start_tick;
        let beats_in_bar = self.beats_in_bar() as i32;

        while tick >= self.ticks_per_beat {
            tick -= self.ticks_per_beat;
            beat += 1;
            if beat > beats_in_bar {
                beat = 1;
                bar += 1;
                bar_start_tick += beats_in_bar as f64 * self.ticks_per_beat;
            }
        }

        let whole = tick.floor();
        (self.bbt(bar, beat, whole as i32, bar_start_tick), tick - whole)
    }

    /// Timebase callback body: fill `position` for the upcoming cycle
    pub fn update(&mut self, _state: TransportState, nframes: Frames, position: &mut TransportPosition, new_position: bool) {
        let previous = position.bbt();
        let (bbt, fraction) = match previous {
            Some(previous) if !new_position => {
                let fraction = if position.valid.contains(PositionBits::TICK_DOUBLE) {
                    position.tick_double - position.tick as f64
                } else {
                    0.0
                };
                self.advance(&previous, fraction, nframes, position.frame_rate)
            }
            _ => self.absolute(position.frame, position.frame_rate),
        };
        position.set_bbt(bbt);
        position.tick_double = bbt.tick as f64 + fraction;
        position.valid |= PositionBits::TICK_DOUBLE;
    }
}
