//! The realtime process path
//!
//! Each cycle the backend hands the process callback a [`ProcessScope`]. The
//! scope gives access to the buffers of the client's own ports and is only
//! valid for the duration of the callback, so buffers can never be held
//! across cycles.
//!
//! ```text
//!  backend cycle
//!  ┌────────────────────────────────────────────────────────────┐
//!  │ fill input buffers ─► process(&scope) ─► publish outputs   │
//!  └────────────────────────────────────────────────────────────┘
//!                             │
//!               scope.audio_in / audio_out / midi_out
//!                             ▼
//!                   PortBuffer (preallocated)
//! ```
//!
//! Inputs are immutable during the cycle and borrowed directly. Outputs sit
//! behind a `RefCell`, so asking for the same output twice at once is
//! reported as a violation instead of aliasing.

use std::cell::{RefCell, RefMut};

use crate::error::{Result, ViolationKind};
use crate::midi::{MidiBuffer, MidiIter, MidiWriter};
use crate::port::Port;
use crate::types::{Direction, Frames, PortId, PortKind};

/// Storage behind one port for one client
#[derive(Debug)]
pub enum PortData {
    AudioIn(Vec<f32>),
    AudioOut(RefCell<Vec<f32>>),
    MidiIn(MidiBuffer),
    MidiOut(RefCell<MidiBuffer>),
}

/// Preallocated buffer of an owned port
#[derive(Debug)]
pub struct PortBuffer {
    id: PortId,
    data: PortData,
}

impl PortBuffer {
    pub fn new(id: PortId, kind: PortKind, direction: Direction, nframes: Frames) -> Self {
        let data = match (kind, direction) {
            (PortKind::Audio, Direction::Input) => PortData::AudioIn(vec![0.0; nframes as usize]),
            (PortKind::Audio, Direction::Output) => {
                PortData::AudioOut(RefCell::new(vec![0.0; nframes as usize]))
            }
            (PortKind::Midi, Direction::Input) => PortData::MidiIn(MidiBuffer::for_frames(nframes)),
            (PortKind::Midi, Direction::Output) => {
                PortData::MidiOut(RefCell::new(MidiBuffer::for_frames(nframes)))
            }
        };
        PortBuffer { id, data }
    }

    pub fn id(&self) -> PortId {
        self.id
    }

    pub fn data(&self) -> &PortData {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut PortData {
        &mut self.data
    }

    /// Reallocate for a new cycle length (never from the process thread)
    pub fn resize(&mut self, nframes: Frames) {
        let frames = nframes as usize;
        match &mut self.data {
            PortData::AudioIn(samples) => samples.resize(frames, 0.0),
            PortData::AudioOut(samples) => samples.get_mut().resize(frames, 0.0),
            PortData::MidiIn(events) => events.resize(crate::midi::buffer_capacity(nframes)),
            PortData::MidiOut(events) => events
                .get_mut()
                .resize(crate::midi::buffer_capacity(nframes)),
        }
    }

    /// Prepare output buffers for a new cycle
    pub(crate) fn begin_cycle(&mut self) {
        if let PortData::MidiOut(events) = &mut self.data {
            events.get_mut().begin_cycle();
        }
    }
}

/// Lookup of a client's port buffers for the current cycle
pub trait BufferSource {
    fn port_buffer(&self, id: PortId) -> Option<&PortBuffer>;
}

impl BufferSource for Vec<PortBuffer> {
    fn port_buffer(&self, id: PortId) -> Option<&PortBuffer> {
        self.iter().find(|buffer| buffer.id == id)
    }
}

/// Per-cycle view handed to the process callback
pub struct ProcessScope<'a> {
    n_frames: Frames,
    last_frame_time: Frames,
    buffers: &'a dyn BufferSource,
}

impl<'a> ProcessScope<'a> {
    pub(crate) fn new(n_frames: Frames, last_frame_time: Frames, buffers: &'a dyn BufferSource) -> Self {
        ProcessScope {
            n_frames,
            last_frame_time,
            buffers,
        }
    }

    /// Frames to process in this cycle
    pub fn n_frames(&self) -> Frames {
        self.n_frames
    }

    /// Frame time at the start of this cycle
    pub fn last_frame_time(&self) -> Frames {
        self.last_frame_time
    }

    fn buffer(&self, port: &Port, kind: PortKind, direction: Direction) -> Result<&'a PortBuffer> {
        if !port.is_owned() {
            return Err(ViolationKind::NotOwned.into());
        }
        if port.kind() != kind {
            return Err(ViolationKind::WrongKind { expected: kind }.into());
        }
        if port.direction() != direction {
            return Err(ViolationKind::WrongDirection {
                expected: direction,
            }
            .into());
        }
        self.buffers
            .port_buffer(port.id())
            .ok_or_else(|| ViolationKind::NotOwned.into())
    }

    /// Samples arriving at an owned audio input
    pub fn audio_in(&self, port: &Port) -> Result<&'a [f32]> {
        let n = self.n_frames as usize;
        match self.buffer(port, PortKind::Audio, Direction::Input)?.data() {
            PortData::AudioIn(samples) => Ok(&samples[..n.min(samples.len())]),
            _ => Err(ViolationKind::WrongKind {
                expected: PortKind::Audio,
            }
            .into()),
        }
    }

    /// Writable samples of an owned audio output
    ///
    /// The buffer keeps whatever it held before until overwritten; a callback
    /// that produces nothing should fill it with silence.
    pub fn audio_out(&self, port: &Port) -> Result<RefMut<'a, [f32]>> {
        let n = self.n_frames as usize;
        match self.buffer(port, PortKind::Audio, Direction::Output)?.data() {
            PortData::AudioOut(samples) => {
                let samples = samples
                    .try_borrow_mut()
                    .map_err(|_| ViolationKind::BufferBorrowed)?;
                Ok(RefMut::map(samples, |s| {
                    let n = n.min(s.len());
                    &mut s[..n]
                }))
            }
            _ => Err(ViolationKind::WrongKind {
                expected: PortKind::Audio,
            }
            .into()),
        }
    }

    /// Events arriving at an owned MIDI input, in time order
    pub fn incoming_midi_events(&self, port: &Port) -> Result<MidiIter<'a>> {
        match self.buffer(port, PortKind::Midi, Direction::Input)?.data() {
            PortData::MidiIn(events) => Ok(events.iter()),
            _ => Err(ViolationKind::WrongKind {
                expected: PortKind::Midi,
            }
            .into()),
        }
    }

    /// Writer for an owned MIDI output
    pub fn midi_out(&self, port: &Port) -> Result<MidiWriter<'a>> {
        match self.buffer(port, PortKind::Midi, Direction::Output)?.data() {
            PortData::MidiOut(events) => {
                let events = events
                    .try_borrow_mut()
                    .map_err(|_| ViolationKind::BufferBorrowed)?;
                Ok(MidiWriter::new(events, self.n_frames))
            }
            _ => Err(ViolationKind::WrongKind {
                expected: PortKind::Midi,
            }
            .into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::Ownership;
    use crate::types::{PortFlags, Uuid};

    fn owned(id: u32, kind: PortKind, direction: Direction) -> Port {
        Port::new(
            PortId(id),
            format!("test:p{}", id),
            kind,
            direction.flag(),
            Uuid(id as u64),
            Ownership::Owned,
        )
    }

    fn buffers() -> Vec<PortBuffer> {
        vec![
            PortBuffer::new(PortId(1), PortKind::Audio, Direction::Input, 8),
            PortBuffer::new(PortId(2), PortKind::Audio, Direction::Output, 8),
            PortBuffer::new(PortId(3), PortKind::Midi, Direction::Input, 8),
            PortBuffer::new(PortId(4), PortKind::Midi, Direction::Output, 8),
        ]
    }

    #[test]
    fn test_audio_passthrough() {
        let mut buffers = buffers();
        if let PortData::AudioIn(samples) = buffers[0].data_mut() {
            samples.iter_mut().enumerate().for_each(|(i, s)| *s = i as f32);
        }
        let scope = ProcessScope::new(8, 0, &buffers);
        let input = owned(1, PortKind::Audio, Direction::Input);
        let output = owned(2, PortKind::Audio, Direction::Output);

        let samples = scope.audio_in(&input).unwrap();
        scope.audio_out(&output).unwrap().copy_from_slice(samples);

        match buffers[1].data() {
            PortData::AudioOut(out) => assert_eq!(out.borrow()[7], 7.0),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_double_output_borrow_is_violation() {
        let buffers = buffers();
        let scope = ProcessScope::new(8, 0, &buffers);
        let output = owned(2, PortKind::Audio, Direction::Output);
        let _first = scope.audio_out(&output).unwrap();
        let err = scope.audio_out(&output).unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Violation(ViolationKind::BufferBorrowed)
        ));
    }

    #[test]
    fn test_external_and_mismatched_ports_rejected() {
        let buffers = buffers();
        let scope = ProcessScope::new(8, 0, &buffers);

        let external = owned(1, PortKind::Audio, Direction::Input).with_ownership(Ownership::External);
        assert!(scope.audio_in(&external).is_err());

        let midi_in = owned(3, PortKind::Midi, Direction::Input);
        assert!(scope.audio_in(&midi_in).is_err());
        assert!(scope.midi_out(&midi_in).is_err());

        let unknown = Port::new(
            PortId(99),
            "test:ghost".into(),
            PortKind::Audio,
            PortFlags::IS_INPUT,
            Uuid(99),
            Ownership::Owned,
        );
        assert!(scope.audio_in(&unknown).is_err());
    }

    #[test]
    fn test_midi_output_cycle() {
        let mut buffers = buffers();
        buffers[3].begin_cycle();
        let scope = ProcessScope::new(8, 0, &buffers);
        let midi_out = owned(4, PortKind::Midi, Direction::Output);

        let mut writer = scope.midi_out(&midi_out).unwrap();
        assert!(writer.write_midi_event(0, &[0x90, 60, 100]).is_err());
        writer.clear_buffer();
        writer.write_midi_event(0, &[0x90, 60, 100]).unwrap();
        assert_eq!(writer.event_count(), 1);
        drop(writer);

        let midi_in = owned(3, PortKind::Midi, Direction::Input);
        assert_eq!(scope.incoming_midi_events(&midi_in).unwrap().count(), 0);
    }

    #[test]
    fn test_resize() {
        let mut buffer = PortBuffer::new(PortId(1), PortKind::Audio, Direction::Input, 8);
        buffer.resize(32);
        match buffer.data() {
            PortData::AudioIn(samples) => assert_eq!(samples.len(), 32),
            _ => unreachable!(),
        }
    }
}
