//! Transport engine of the loopback server
//!
//! Runs once per cycle on the process thread:
//!
//! ```text
//!  begin_cycle:  apply reposition ─► apply start/stop ─► poll sync callbacks
//!                ─► publish state + position
//!  (process callbacks; the timebase master fills the next position)
//!  end_cycle:    advance frame ─► merge master's fields ─► publish
//! ```
//!
//! Requests from clients arrive through [`TransportShared`] without locks,
//! so [`Transport`](crate::Transport) stays usable from any thread.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use super::state::{ClientId, ClientRecord};
use crate::callbacks::RealtimeHandlers;
use crate::error::Result;
use crate::transport::{PositionBits, PositionCell, TransportControl, TransportPosition, TransportState};
use crate::types::{Frames, Time};

const NO_COMMAND: u8 = 0;
const START: u8 = 1;
const STOP: u8 = 2;

/// Lock-free state shared between the server and transport handles
pub(crate) struct TransportShared {
    command: AtomicU8,
    request_lock: AtomicBool,
    request_pending: AtomicBool,
    request: PositionCell,
    current: PositionCell,
    state: AtomicU32,
    // Cycle clock
    epoch: Instant,
    cycle_start_usecs: AtomicU64,
    last_frame_time: AtomicU32,
    sample_rate: AtomicU32,
    buffer_size: AtomicU32,
}

impl TransportShared {
    pub(crate) fn new(sample_rate: Frames, buffer_size: Frames) -> Self {
        let mut initial = TransportPosition::default();
        initial.frame_rate = sample_rate;
        TransportShared {
            command: AtomicU8::new(NO_COMMAND),
            request_lock: AtomicBool::new(false),
            request_pending: AtomicBool::new(false),
            request: PositionCell::new(TransportPosition::default()),
            current: PositionCell::new(initial),
            state: AtomicU32::new(TransportState::Stopped.code()),
            epoch: Instant::now(),
            cycle_start_usecs: AtomicU64::new(0),
            last_frame_time: AtomicU32::new(0),
            sample_rate: AtomicU32::new(sample_rate),
            buffer_size: AtomicU32::new(buffer_size),
        }
    }

    fn take_command(&self) -> u8 {
        self.command.swap(NO_COMMAND, Ordering::AcqRel)
    }

    fn take_request(&self) -> Option<TransportPosition> {
        if !self.request_pending.swap(false, Ordering::AcqRel) {
            return None;
        }
        match self.request.load() {
            Ok(position) => Some(position),
            Err(_) => {
                // Writer still busy; pick it up next cycle
                self.request_pending.store(true, Ordering::Release);
                None
            }
        }
    }

    fn publish(&self, state: TransportState, position: &TransportPosition) {
        self.current.store(position);
        self.state.store(state.code(), Ordering::Release);
    }

    pub(crate) fn mark_cycle_start(&self, frame_time: Frames) {
        let now = self.epoch.elapsed().as_micros() as u64;
        self.cycle_start_usecs.store(now, Ordering::Release);
        self.last_frame_time.store(frame_time, Ordering::Release);
    }

    pub(crate) fn set_rates(&self, sample_rate: Frames, buffer_size: Frames) {
        self.sample_rate.store(sample_rate, Ordering::Release);
        self.buffer_size.store(buffer_size, Ordering::Release);
    }

    pub(crate) fn last_frame_time(&self) -> Frames {
        self.last_frame_time.load(Ordering::Acquire)
    }

    /// Frames elapsed since the current cycle began, capped at one cycle
    pub(crate) fn frames_since_cycle_start(&self) -> Frames {
        let start = self.cycle_start_usecs.load(Ordering::Acquire);
        let now = self.epoch.elapsed().as_micros() as u64;
        let rate = self.sample_rate.load(Ordering::Acquire) as u64;
        let frames = now.saturating_sub(start) * rate / 1_000_000;
        frames.min(self.buffer_size.load(Ordering::Acquire) as u64) as Frames
    }

    pub(crate) fn frame_time(&self) -> Frames {
        self.last_frame_time()
            .wrapping_add(self.frames_since_cycle_start())
    }
}

/// [`TransportControl`] implementation handed to loopback clients
pub(crate) struct LoopbackTransport {
    shared: Arc<TransportShared>,
}

impl LoopbackTransport {
    pub(crate) fn new(shared: Arc<TransportShared>) -> Self {
        LoopbackTransport { shared }
    }
}

impl TransportControl for LoopbackTransport {
    fn start(&self) {
        self.shared.command.store(START, Ordering::Release);
    }

    fn stop(&self) {
        self.shared.command.store(STOP, Ordering::Release);
    }

    fn reposition(&self, position: &TransportPosition) -> Result<()> {
        let shared = &self.shared;
        while shared
            .request_lock
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
        shared.request.store(position);
        shared.request_pending.store(true, Ordering::Release);
        shared.request_lock.store(false, Ordering::Release);
        Ok(())
    }

    fn query(&self) -> Result<(TransportState, TransportPosition)> {
        let position = self.shared.current.load()?;
        let state = TransportState::from_code(self.shared.state.load(Ordering::Acquire))
            .unwrap_or_default();
        Ok((state, position))
    }

    fn current_frame(&self) -> Frames {
        match self.query() {
            Ok((TransportState::Rolling, position)) => position
                .frame
                .wrapping_add(self.shared.frames_since_cycle_start()),
            Ok((_, position)) => position.frame,
            Err(_) => 0,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Cycle-side engine
// ═══════════════════════════════════════════════════════════════════════════════

pub(crate) struct TransportEngine {
    pub(crate) shared: Arc<TransportShared>,
    state: TransportState,
    position: TransportPosition,
    /// Fields produced by the timebase master for the next cycle
    next_fields: Option<TransportPosition>,
    master: Option<ClientId>,
    new_position: bool,
    sync_timeout: Time,
    sync_time_left: i64,
    usecs: Time,
}

impl TransportEngine {
    pub(crate) fn new(shared: Arc<TransportShared>, sample_rate: Frames, sync_timeout: Time) -> Self {
        let mut position = TransportPosition::default();
        position.frame_rate = sample_rate;
        TransportEngine {
            shared,
            state: TransportState::Stopped,
            position,
            next_fields: None,
            master: None,
            new_position: false,
            sync_timeout,
            sync_time_left: sync_timeout as i64,
            usecs: 0,
        }
    }

    pub(crate) fn state(&self) -> TransportState {
        self.state
    }

    pub(crate) fn master(&self) -> Option<ClientId> {
        self.master
    }

    pub(crate) fn set_sync_timeout(&mut self, usecs: Time) {
        self.sync_timeout = usecs;
    }

    pub(crate) fn set_frame_rate(&mut self, rate: Frames) {
        self.position.frame_rate = rate;
    }

    /// Claim the timebase role; conditional claims fail if it is taken
    pub(crate) fn acquire_timebase(&mut self, client: ClientId, conditional: bool) -> bool {
        match self.master {
            Some(current) if current == client => true,
            Some(current) if conditional => {
                log::debug!("timebase already held by client {}", current);
                false
            }
            _ => {
                self.master = Some(client);
                self.new_position = true;
                true
            }
        }
    }

    /// Returns false if `client` was not the master
    pub(crate) fn release_timebase(&mut self, client: ClientId) -> bool {
        if self.master == Some(client) {
            self.master = None;
            self.next_fields = None;
            true
        } else {
            false
        }
    }

    /// Master (re)activated: its next callback sees a new position
    pub(crate) fn client_activated(&mut self, client: ClientId) {
        if self.master == Some(client) {
            self.new_position = true;
        }
    }

    fn restart_sync_timeout(&mut self) {
        self.sync_time_left = self.sync_timeout as i64;
    }

    /// Apply pending requests and poll slow-sync clients
    pub(crate) fn begin_cycle(
        &mut self,
        clients: &mut BTreeMap<ClientId, ClientRecord>,
        order: &[ClientId],
        cycle_usecs: Time,
    ) {
        let any_slow_sync = clients.values().any(|c| c.active && c.slow_sync);

        if let Some(request) = self.shared.take_request() {
            let frame = request.frame;
            self.position.copy_extended_from(&request);
            self.position.frame = frame;
            self.new_position = true;
            for client in clients.values_mut().filter(|c| c.active && c.slow_sync) {
                client.sync_poll = true;
            }
            if any_slow_sync && self.state != TransportState::Stopped {
                self.state = TransportState::Starting;
                self.restart_sync_timeout();
            }
            log::debug!("transport relocated to frame {}", frame);
        }

        match self.shared.take_command() {
            START if self.state == TransportState::Stopped => {
                if any_slow_sync {
                    for client in clients.values_mut().filter(|c| c.active && c.slow_sync) {
                        client.sync_poll = true;
                    }
                    self.state = TransportState::Starting;
                    self.restart_sync_timeout();
                } else {
                    self.state = TransportState::Rolling;
                }
            }
            STOP => self.state = TransportState::Stopped,
            _ => {}
        }

        let poll_state = self.state;
        for id in order {
            let Some(client) = clients.get_mut(id) else {
                continue;
            };
            if !(client.active && client.slow_sync && client.sync_poll) {
                continue;
            }
            if let Some(realtime) = client.realtime.as_mut() {
                if realtime.sync(poll_state, &self.position) {
                    client.sync_poll = false;
                }
            }
        }

        if self.state == TransportState::Starting {
            let waiting = clients
                .values()
                .filter(|c| c.active && c.slow_sync && c.sync_poll)
                .count();
            if waiting == 0 {
                self.state = TransportState::Rolling;
            } else {
                self.sync_time_left -= cycle_usecs as i64;
                if self.sync_time_left <= 0 {
                    // Laggards keep being polled, now with Rolling, until ready
                    log::warn!("transport sync timed out; rolling without {} client(s)", waiting);
                    self.state = TransportState::Rolling;
                }
            }
        }

        self.position.usecs = self.usecs;
        self.shared.publish(self.state, &self.position);
    }

    /// Let the timebase master fill in the position of the next cycle
    pub(crate) fn run_timebase(&mut self, realtime: &mut RealtimeHandlers, nframes: Frames) {
        if !(self.state == TransportState::Rolling || self.new_position) {
            return;
        }
        let mut next = self.position;
        if self.state == TransportState::Rolling {
            next.frame = next.frame.wrapping_add(nframes);
        }
        let frame = next.frame;
        if realtime.timebase(self.state, nframes, &mut next, self.new_position) {
            if next.frame != frame {
                log::warn!("timebase callback changed the frame; keeping {}", frame);
                next.frame = frame;
            }
            self.next_fields = Some(next);
            self.new_position = false;
        }
    }

    /// Advance to the next cycle and publish it
    pub(crate) fn end_cycle(&mut self, nframes: Frames, cycle_usecs: Time) {
        if self.state == TransportState::Rolling {
            self.position.frame = self.position.frame.wrapping_add(nframes);
        }
        match self.next_fields.take() {
            Some(fields) => self.position.copy_extended_from(&fields),
            None if self.master.is_none() => {
                self.position.valid.remove(PositionBits::BBT);
                self.position.clear_extended();
            }
            None => {}
        }
        self.usecs += cycle_usecs;
        self.position.usecs = self.usecs;
        self.shared.publish(self.state, &self.position);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Bbt;

    fn engine() -> (TransportEngine, LoopbackTransport) {
        let shared = Arc::new(TransportShared::new(48_000, 256));
        let engine = TransportEngine::new(shared.clone(), 48_000, 2_000_000);
        (engine, LoopbackTransport::new(shared))
    }

    fn cycle(engine: &mut TransportEngine) {
        let mut clients = BTreeMap::new();
        engine.begin_cycle(&mut clients, &[], 5_333);
        engine.end_cycle(256, 5_333);
    }

    #[test]
    fn test_start_rolls_without_slow_sync() {
        let (mut engine, control) = engine();
        control.start();
        cycle(&mut engine);
        assert_eq!(engine.state(), TransportState::Rolling);
        cycle(&mut engine);
        let (state, position) = control.query().unwrap();
        assert_eq!(state, TransportState::Rolling);
        assert_eq!(position.frame, 512);
        assert_eq!(position.frame_rate, 48_000);
    }

    #[test]
    fn test_stop_keeps_frame() {
        let (mut engine, control) = engine();
        control.start();
        cycle(&mut engine);
        control.stop();
        cycle(&mut engine);
        cycle(&mut engine);
        let (state, position) = control.query().unwrap();
        assert_eq!(state, TransportState::Stopped);
        assert_eq!(position.frame, 256);
    }

    #[test]
    fn test_timebase_role() {
        let (mut engine, _) = engine();
        assert!(engine.acquire_timebase(1, true));
        assert!(engine.acquire_timebase(1, true));
        assert!(!engine.acquire_timebase(2, true));
        assert!(!engine.release_timebase(2));
        assert!(engine.acquire_timebase(2, false));
        assert_eq!(engine.master(), Some(2));
        assert!(engine.release_timebase(2));
        assert_eq!(engine.master(), None);
    }

    #[test]
    fn test_musical_fields_need_a_master() {
        let (mut engine, control) = engine();
        let mut position = TransportPosition::at_frame(1_000);
        position.set_bbt(Bbt {
            bar: 2,
            beat: 1,
            tick: 0,
            bar_start_tick: 1_920.0,
            beats_per_bar: 4.0,
            beat_type: 4.0,
            ticks_per_beat: 480.0,
            beats_per_minute: 90.0,
        });
        control.reposition(&position).unwrap();

        let mut clients = BTreeMap::new();
        engine.begin_cycle(&mut clients, &[], 5_333);
        let (_, during) = control.query().unwrap();
        assert_eq!(during.frame, 1_000);
        assert!(during.bbt().is_some());

        engine.end_cycle(256, 5_333);
        let (_, after) = control.query().unwrap();
        assert!(after.bbt().is_none());
    }
}
