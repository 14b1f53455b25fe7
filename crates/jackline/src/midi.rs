//! Per-cycle MIDI event buffers
//!
//! A [`MidiBuffer`] holds the time-stamped events of one port for one process
//! cycle. Storage is allocated once for a fixed byte capacity; reading and
//! writing during a cycle never allocates.
//!
//! ```text
//!  capacity (bytes) = nframes * 4
//!  ┌──────────────────────────────────────────────┐
//!  │ ev0 hdr │ ev0 data │ ev1 hdr │ ev1 data │ ...│  each event costs
//!  └──────────────────────────────────────────────┘  EVENT_HEADER_SIZE + len
//! ```
//!
//! Output buffers follow the server's write contract: clear first in every
//! cycle, timestamps strictly inside the cycle and non-decreasing, one
//! normalized message per event.

use std::cell::RefMut;

use crate::error::{Error, Result, ViolationKind};
use crate::types::Frames;

/// Bookkeeping bytes charged against the capacity for every stored event
pub const EVENT_HEADER_SIZE: usize = 8;

/// Capacity in bytes of a MIDI port buffer for the given cycle length
pub fn buffer_capacity(nframes: Frames) -> usize {
    nframes as usize * 4
}

/// One MIDI event as seen by a process callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawMidi<'a> {
    /// Frame offset inside the current cycle
    pub time: Frames,
    pub bytes: &'a [u8],
}

#[derive(Debug, Clone, Copy)]
struct EventSlot {
    time: Frames,
    start: usize,
    len: usize,
}

/// True if `bytes` is exactly one MIDI message in normalized form
///
/// The first byte must be a status byte. Outside system-exclusive messages
/// no later byte may be a status byte (no running status, no embedded
/// realtime bytes).
pub fn is_normalized(bytes: &[u8]) -> bool {
    match bytes.split_first() {
        None => false,
        Some((&status, rest)) => {
            status >= 0x80 && (status == 0xF0 || rest.iter().all(|&b| b < 0x80))
        }
    }
}

/// Fixed-capacity, time-ordered MIDI event store for one port and cycle
#[derive(Debug, Default)]
pub struct MidiBuffer {
    data: Vec<u8>,
    events: Vec<EventSlot>,
    capacity: usize,
    lost: u32,
    cleared: bool,
}

impl MidiBuffer {
    /// Allocate a buffer able to hold `capacity` bytes of events
    pub fn with_capacity(capacity: usize) -> Self {
        MidiBuffer {
            data: Vec::with_capacity(capacity),
            events: Vec::with_capacity(capacity / (EVENT_HEADER_SIZE + 1) + 1),
            capacity,
            lost: 0,
            cleared: false,
        }
    }

    pub fn for_frames(nframes: Frames) -> Self {
        Self::with_capacity(buffer_capacity(nframes))
    }

    /// Change the capacity (allocates; never call from the process thread)
    pub fn resize(&mut self, capacity: usize) {
        *self = Self::with_capacity(capacity);
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Remove all events and reset the lost-event counter
    pub fn clear(&mut self) {
        self.data.clear();
        self.events.clear();
        self.lost = 0;
        self.cleared = true;
    }

    /// Start a new cycle; writing requires another [`clear`](Self::clear)
    pub(crate) fn begin_cycle(&mut self) {
        self.cleared = false;
    }

    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Events that could not be stored since the last clear
    pub fn lost_events(&self) -> u32 {
        self.lost
    }

    fn used(&self) -> usize {
        self.data.len() + self.events.len() * EVENT_HEADER_SIZE
    }

    /// Largest event payload that still fits
    pub fn max_event_size(&self) -> usize {
        self.capacity
            .saturating_sub(self.used())
            .saturating_sub(EVENT_HEADER_SIZE)
    }

    pub fn get(&self, index: usize) -> Option<RawMidi<'_>> {
        self.events.get(index).map(|slot| RawMidi {
            time: slot.time,
            bytes: &self.data[slot.start..slot.start + slot.len],
        })
    }

    pub fn iter(&self) -> MidiIter<'_> {
        MidiIter {
            buffer: self,
            index: 0,
        }
    }

    /// Reserve `size` bytes for an event at `time`; the caller fills them in
    pub fn reserve(&mut self, time: Frames, size: usize, nframes: Frames) -> Result<&mut [u8]> {
        if !self.cleared {
            return Err(ViolationKind::MidiNotCleared.into());
        }
        if size == 0 {
            return Err(ViolationKind::EmptyMidiEvent.into());
        }
        if time >= nframes {
            return Err(ViolationKind::MidiTimeOutOfRange { time, nframes }.into());
        }
        if let Some(last) = self.events.last() {
            if time < last.time {
                return Err(ViolationKind::MidiOutOfOrder {
                    time,
                    last: last.time,
                }
                .into());
            }
        }
        let available = self.max_event_size();
        if size > available {
            self.lost = self.lost.saturating_add(1);
            return Err(Error::MidiBufferFull {
                requested: size,
                available,
            });
        }

        let start = self.data.len();
        // Within the preallocated capacity, so no reallocation happens here
        self.data.resize(start + size, 0);
        self.events.push(EventSlot {
            time,
            start,
            len: size,
        });
        Ok(&mut self.data[start..start + size])
    }

    /// Copy one normalized event into the buffer
    pub fn write(&mut self, time: Frames, bytes: &[u8], nframes: Frames) -> Result<()> {
        if !bytes.is_empty() && !is_normalized(bytes) {
            return Err(ViolationKind::MidiNotNormalized.into());
        }
        self.reserve(time, bytes.len(), nframes)?
            .copy_from_slice(bytes);
        Ok(())
    }

    /// Replace the contents with the time-ordered merge of `sources`
    ///
    /// Events with equal timestamps keep source order. Events that do not
    /// fit are counted as lost.
    #[cfg(test)]
    pub(crate) fn merge_from<'a, I>(&mut self, sources: I)
    where
        I: IntoIterator<Item = &'a MidiBuffer>,
    {
        self.clear();
        for source in sources {
            self.append(source);
        }
        self.sort_by_time();
    }

    /// Append every event of `source` without ordering checks
    pub(crate) fn append(&mut self, source: &MidiBuffer) {
        for event in source.iter() {
            let needed = event.bytes.len() + EVENT_HEADER_SIZE;
            if self.used() + needed > self.capacity {
                self.lost = self.lost.saturating_add(1);
                continue;
            }
            let start = self.data.len();
            self.data.extend_from_slice(event.bytes);
            self.events.push(EventSlot {
                time: event.time,
                start,
                len: event.bytes.len(),
            });
        }
    }

    pub(crate) fn sort_by_time(&mut self) {
        // Data offsets grow with insertion order, so (time, start) is unique
        self.events
            .sort_unstable_by_key(|slot| (slot.time, slot.start));
    }

    /// Load events received from a native port buffer
    #[cfg_attr(not(feature = "jack-backend"), allow(dead_code))]
    pub(crate) fn load<'a, I>(&mut self, events: I, nframes: Frames)
    where
        I: IntoIterator<Item = RawMidi<'a>>,
    {
        self.clear();
        for event in events {
            if self.reserve(event.time, event.bytes.len(), nframes)
                .map(|slot| slot.copy_from_slice(event.bytes))
                .is_err()
            {
                log::debug!("dropping incoming MIDI event at frame {}", event.time);
            }
        }
    }
}

/// Iterator over the events of a [`MidiBuffer`]
pub struct MidiIter<'a> {
    buffer: &'a MidiBuffer,
    index: usize,
}

impl<'a> Iterator for MidiIter<'a> {
    type Item = RawMidi<'a>;

    fn next(&mut self) -> Option<RawMidi<'a>> {
        let event = self.buffer.get(self.index)?;
        self.index += 1;
        Some(event)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.buffer.event_count() - self.index;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for MidiIter<'_> {}

// ═══════════════════════════════════════════════════════════════════════════════
// Output writer handed to process callbacks
// ═══════════════════════════════════════════════════════════════════════════════

/// Write access to an owned MIDI output port for the current cycle
pub struct MidiWriter<'a> {
    buffer: RefMut<'a, MidiBuffer>,
    n_frames: Frames,
}

impl<'a> MidiWriter<'a> {
    pub(crate) fn new(buffer: RefMut<'a, MidiBuffer>, n_frames: Frames) -> Self {
        MidiWriter { buffer, n_frames }
    }

    /// Must be called once per cycle before any write
    pub fn clear_buffer(&mut self) {
        self.buffer.clear();
    }

    pub fn write_midi_event(&mut self, time: Frames, bytes: &[u8]) -> Result<()> {
        self.buffer.write(time, bytes, self.n_frames)
    }

    /// Reserve space for an event of `size` bytes and return it for filling
    pub fn reserve_midi_event(&mut self, time: Frames, size: usize) -> Result<&mut [u8]> {
        self.buffer.reserve(time, size, self.n_frames)
    }

    pub fn max_event_size(&self) -> usize {
        self.buffer.max_event_size()
    }

    pub fn lost_midi_events(&self) -> u32 {
        self.buffer.lost_events()
    }

    pub fn event_count(&self) -> usize {
        self.buffer.event_count()
    }
}
