//! Native server backend through the `jack` crate
//!
//! ```text
//!  ┌──────────────┐  PortCommand (lock-free SPSC)  ┌─────────────────────┐
//!  │ JackSession  │───────────────────────────────►│ JackProcessor       │
//!  │ client thread│◄───────────────────────────────│ server RT thread    │
//!  └──────┬───────┘   returned NativePort          │ native ⇄ PortBuffer │
//!         │                                        └──────────┬──────────┘
//!         │ Arc<RealtimeSlot>                                 │ try_lock
//!         └──────────────────────► RealtimeHandlers ◄─────────┤
//!                                         ▲                   │
//!                    sync_trampoline ─────┤ jack_sys callbacks│
//!                timebase_trampoline ─────┘ (same RT thread)  │
//! ```
//!
//! Each cycle the processor copies native input buffers into the client's
//! preallocated [`PortBuffer`]s, runs the process callback through a
//! [`ProcessScope`], then copies the outputs back. Ports registered while
//! active are handed to the processor over the command queue; unregistering
//! one waits for the processor to hand it back first.
//!
//! Slow-sync and timebase callbacks are not wrapped by the `jack` crate, so
//! they are registered through `jack::jack_sys` with the session's
//! [`RealtimeSlot`] as the callback argument. The server runs them on the
//! process thread, one after another with the process callback, so the
//! slot's mutex is never contended while active.
//!
//! Transport control goes through [`jack::Transport`], metadata through the
//! crate's `metadata` feature. Property change notifications are not
//! forwarded.

use std::collections::BTreeMap;
use std::ffi::{c_int, c_void, CString};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, TryLockError};
use std::time::{Duration, Instant};

use jack::jack_sys as j;
use rtrb::{Consumer, Producer, RingBuffer};

use super::{ActivationError, Backend, Connector};
use crate::callbacks::{Handlers, NotificationHandlers, RealtimeHandlers};
use crate::client::ClientOptions;
use crate::error::{Error, Result, Status, ViolationKind, EBUSY, EINVAL};
use crate::metadata::{Description, Property};
use crate::midi::RawMidi;
use crate::port::{Ownership, Port, PortFilter};
use crate::process::{BufferSource, PortBuffer, PortData, ProcessScope};
use crate::transport::{Bbt, PositionBits, TransportControl, TransportPosition, TransportState};
use crate::types::{Direction, Frames, PortFlags, PortId, PortKind, Time, Uuid};

/// Capacity of the port command queues
const PORT_QUEUE_SIZE: usize = 64;

/// Ports the processor can hold without reallocating
const MAX_ACTIVE_PORTS: usize = 256;

/// How long unregistering waits for the process thread to release a port
const RECLAIM_TIMEOUT: Duration = Duration::from_millis(500);

fn native_error(op: &'static str, error: jack::Error) -> Error {
    log::warn!("jack {} failed: {}", op, error);
    Error::Operation { op, code: -1 }
}

/// Map a raw return code of a `jack_sys` call
fn check(op: &'static str, code: c_int) -> Result<()> {
    if code == 0 {
        Ok(())
    } else {
        log::warn!("jack {} failed with code {}", op, code);
        Err(Error::Operation { op, code })
    }
}

/// Strings handed to the server must not contain NUL
fn c_string(op: &'static str, text: &str) -> Result<CString> {
    CString::new(text).map_err(|_| Error::Operation { op, code: EINVAL })
}

// ═══════════════════════════════════════════════════════════════════════════════
// Port identity
// ═══════════════════════════════════════════════════════════════════════════════

/// Stable ids for port names, shared by the session and its notifier
#[derive(Default)]
struct PortIds {
    by_name: BTreeMap<String, PortId>,
    next: u32,
}

impl PortIds {
    fn intern(&mut self, name: &str) -> PortId {
        if let Some(id) = self.by_name.get(name) {
            return *id;
        }
        self.next += 1;
        let id = PortId(self.next);
        self.by_name.insert(name.to_string(), id);
        id
    }

    fn rename(&mut self, old: &str, new: &str) {
        if let Some(id) = self.by_name.remove(old) {
            self.by_name.insert(new.to_string(), id);
        }
    }
}

type SharedIds = Arc<Mutex<PortIds>>;

fn lock_ids(ids: &SharedIds) -> std::sync::MutexGuard<'_, PortIds> {
    ids.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn port_uuid<PS: jack::PortSpec>(port: &jack::Port<PS>) -> Uuid {
    // SAFETY: the port handle is valid while `port` is borrowed
    Uuid(unsafe { j::jack_port_uuid(port.raw()) })
}

/// Describe a native port as a [`Port`]
fn describe<PS: jack::PortSpec>(port: &jack::Port<PS>, ids: &SharedIds, ownership: Ownership) -> Option<Port> {
    let name = port.name().ok()?;
    let kind = PortKind::from_type_tag(&port.port_type().ok()?)?;
    let flags = PortFlags::from_bits(port.flags().bits() as u32);
    let id = lock_ids(ids).intern(&name);
    Some(Port::new(id, name, kind, flags, port_uuid(port), ownership))
}

/// An owned native port with the buffer the process callback sees
struct NativePort {
    buffer: PortBuffer,
    handle: NativeHandle,
}

enum NativeHandle {
    AudioIn(jack::Port<jack::AudioIn>),
    AudioOut(jack::Port<jack::AudioOut>),
    MidiIn(jack::Port<jack::MidiIn>),
    MidiOut(jack::Port<jack::MidiOut>),
}

impl NativeHandle {
    fn uuid(&self) -> Uuid {
        match self {
            NativeHandle::AudioIn(port) => port_uuid(port),
            NativeHandle::AudioOut(port) => port_uuid(port),
            NativeHandle::MidiIn(port) => port_uuid(port),
            NativeHandle::MidiOut(port) => port_uuid(port),
        }
    }
}

impl NativePort {
    fn id(&self) -> PortId {
        self.buffer.id()
    }

    /// Copy native input into the port buffer and prepare outputs
    fn fill(&mut self, ps: &jack::ProcessScope) {
        let nframes = ps.n_frames();
        match (&self.handle, self.buffer.data_mut()) {
            (NativeHandle::AudioIn(port), PortData::AudioIn(samples)) => {
                let native = port.as_slice(ps);
                let n = native.len().min(samples.len());
                samples[..n].copy_from_slice(&native[..n]);
            }
            (NativeHandle::MidiIn(port), PortData::MidiIn(events)) => {
                let incoming = port.iter(ps).map(|event| RawMidi {
                    time: event.time,
                    bytes: event.bytes,
                });
                events.load(incoming, nframes);
            }
            _ => {}
        }
        self.buffer.begin_cycle();
    }

    /// Copy the port buffer to the native output
    fn publish(&mut self, ps: &jack::ProcessScope) {
        match (&mut self.handle, self.buffer.data_mut()) {
            (NativeHandle::AudioOut(port), PortData::AudioOut(samples)) => {
                let native = port.as_mut_slice(ps);
                let samples = samples.get_mut();
                let n = native.len().min(samples.len());
                native[..n].copy_from_slice(&samples[..n]);
            }
            (NativeHandle::MidiOut(port), PortData::MidiOut(events)) => {
                let mut writer = port.writer(ps);
                for event in events.get_mut().iter() {
                    let raw = jack::RawMidi {
                        time: event.time,
                        bytes: event.bytes,
                    };
                    if let Err(e) = writer.write(&raw) {
                        log::debug!("native MIDI write at frame {} failed: {}", event.time, e);
                    }
                }
            }
            _ => {}
        }
    }

    fn unregister(self, client: &jack::Client) -> Result<()> {
        let result = match self.handle {
            NativeHandle::AudioIn(port) => client.unregister_port(port),
            NativeHandle::AudioOut(port) => client.unregister_port(port),
            NativeHandle::MidiIn(port) => client.unregister_port(port),
            NativeHandle::MidiOut(port) => client.unregister_port(port),
        };
        result.map_err(|e| native_error("unregister port", e))
    }
}

struct NativePorts(Vec<NativePort>);

impl BufferSource for NativePorts {
    fn port_buffer(&self, id: PortId) -> Option<&PortBuffer> {
        self.0.iter().find(|port| port.id() == id).map(|port| &port.buffer)
    }
}

enum PortCommand {
    Add(NativePort),
    Remove(PortId),
}

// ═══════════════════════════════════════════════════════════════════════════════
// Transport positions
// ═══════════════════════════════════════════════════════════════════════════════

/// Field groups that exist in the native position struct
const NATIVE_BITS: u32 = PositionBits::BBT.bits()
    | PositionBits::TIMECODE.bits()
    | PositionBits::BBT_FRAME_OFFSET.bits()
    | PositionBits::AUDIO_VIDEO_RATIO.bits()
    | PositionBits::VIDEO_FRAME_OFFSET.bits();

fn transport_state(code: j::jack_transport_state_t) -> TransportState {
    // Looping (2) is obsolete; servers that still send it are rolling
    TransportState::from_code(code).unwrap_or(TransportState::Rolling)
}

fn position_from_raw(raw: &j::jack_position_t) -> TransportPosition {
    TransportPosition {
        unique_1: raw.unique_1,
        usecs: raw.usecs,
        frame_rate: raw.frame_rate,
        frame: raw.frame,
        valid: PositionBits::from_bits(raw.valid & NATIVE_BITS),
        bar: raw.bar,
        beat: raw.beat,
        tick: raw.tick,
        bar_start_tick: raw.bar_start_tick,
        beats_per_bar: raw.beats_per_bar,
        beat_type: raw.beat_type,
        ticks_per_beat: raw.ticks_per_beat,
        beats_per_minute: raw.beats_per_minute,
        frame_time: raw.frame_time,
        next_time: raw.next_time,
        bbt_offset: raw.bbt_offset,
        audio_frames_per_video_frame: raw.audio_frames_per_video_frame,
        video_offset: raw.video_offset,
        tick_double: 0.0,
        unique_2: raw.unique_2,
    }
}

/// Copy what a timebase master may set; frame, rate and stamps stay the server's
fn write_extended(position: &TransportPosition, raw: &mut j::jack_position_t) {
    raw.valid = position.valid.bits() & NATIVE_BITS;
    raw.bar = position.bar;
    raw.beat = position.beat;
    raw.tick = position.tick;
    raw.bar_start_tick = position.bar_start_tick;
    raw.beats_per_bar = position.beats_per_bar;
    raw.beat_type = position.beat_type;
    raw.ticks_per_beat = position.ticks_per_beat;
    raw.beats_per_minute = position.beats_per_minute;
    raw.frame_time = position.frame_time;
    raw.next_time = position.next_time;
    raw.bbt_offset = position.bbt_offset;
    raw.audio_frames_per_video_frame = position.audio_frames_per_video_frame;
    raw.video_offset = position.video_offset;
}

fn position_from_native(native: &jack::TransportPosition) -> TransportPosition {
    let mut position = TransportPosition::at_frame(native.frame());
    position.frame_rate = native.frame_rate().unwrap_or(0);
    position.usecs = native.usecs().unwrap_or(0);
    if let Some(bbt) = native.bbt() {
        position.set_bbt(Bbt {
            bar: bbt.bar as i32,
            beat: bbt.beat as i32,
            tick: bbt.tick as i32,
            bar_start_tick: bbt.bar_start_tick,
            beats_per_bar: bbt.sig_num,
            beat_type: bbt.sig_denom,
            ticks_per_beat: bbt.ticks_per_beat,
            beats_per_minute: bbt.bpm,
        });
    }
    if let Some(offset) = native.bbt_offset() {
        position.bbt_offset = offset;
        position.valid |= PositionBits::BBT_FRAME_OFFSET;
    }
    position
}

/// Position request for [`jack::Transport::reposition`]
///
/// Only the frame, bar/beat/tick and BBT offset groups can be requested
/// through the crate; the server rejects musical positions it cannot
/// validate.
fn native_position(position: &TransportPosition) -> Result<jack::TransportPosition> {
    let invalid = Error::Operation {
        op: "transport reposition",
        code: EINVAL,
    };
    let mut native = jack::TransportPosition::default();
    native.set_frame(position.frame);
    if let Some(bbt) = position.bbt() {
        let (Ok(bar), Ok(beat), Ok(tick)) = (
            usize::try_from(bbt.bar),
            usize::try_from(bbt.beat),
            usize::try_from(bbt.tick),
        ) else {
            return Err(invalid);
        };
        let requested = jack::TransportBBT {
            bar,
            beat,
            tick,
            sig_num: bbt.beats_per_bar,
            sig_denom: bbt.beat_type,
            ticks_per_beat: bbt.ticks_per_beat,
            bpm: bbt.beats_per_minute,
            bar_start_tick: bbt.bar_start_tick,
        };
        if let Err(e) = native.set_bbt(Some(requested)) {
            log::debug!("rejected musical position: {}", e);
            return Err(invalid);
        }
    }
    if let Some(offset) = position.bbt_offset() {
        // Setting the offset cannot fail
        let _ = native.set_bbt_offset(Some(offset));
    }
    Ok(native)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Realtime handlers and transport trampolines
// ═══════════════════════════════════════════════════════════════════════════════

/// Realtime handlers shared by the processor and the transport trampolines
///
/// Filled on activation and emptied on deactivation by the client thread;
/// everything in between happens on the server's process thread.
#[derive(Default)]
struct RealtimeSlot {
    handlers: Mutex<Option<RealtimeHandlers>>,
}

impl RealtimeSlot {
    /// Run `f` on the installed handlers without blocking
    fn with<R>(&self, f: impl FnOnce(&mut RealtimeHandlers) -> R) -> Option<R> {
        let mut guard = match self.handlers.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return None,
        };
        guard.as_mut().map(f)
    }

    fn install(&self, handlers: RealtimeHandlers) {
        *self.handlers.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handlers);
    }

    fn take(&self) -> Option<RealtimeHandlers> {
        self.handlers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    /// Callback argument for the `jack_sys` registrations
    fn as_arg(self: &Arc<Self>) -> *mut c_void {
        Arc::as_ptr(self) as *mut c_void
    }
}

/// Slow-sync callback registered with `jack_set_sync_callback`
///
/// # Safety
///
/// `arg` must come from [`RealtimeSlot::as_arg`] on a slot that outlives the
/// registration, and `pos` must point to a valid position.
unsafe extern "C" fn sync_trampoline(
    state: j::jack_transport_state_t,
    pos: *mut j::jack_position_t,
    arg: *mut c_void,
) -> c_int {
    let ready = panic::catch_unwind(AssertUnwindSafe(|| {
        let slot = unsafe { &*(arg as *const RealtimeSlot) };
        let position = position_from_raw(unsafe { &*pos });
        slot.with(|handlers| {
            handlers.apply_pending();
            handlers.sync(transport_state(state), &position)
        })
        // Not active yet: nothing to wait for
        .unwrap_or(true)
    }));
    c_int::from(ready.unwrap_or(false))
}

/// Timebase callback registered with `jack_set_timebase_callback`
///
/// # Safety
///
/// Same contract as [`sync_trampoline`].
unsafe extern "C" fn timebase_trampoline(
    state: j::jack_transport_state_t,
    nframes: j::jack_nframes_t,
    pos: *mut j::jack_position_t,
    new_pos: c_int,
    arg: *mut c_void,
) {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        let slot = unsafe { &*(arg as *const RealtimeSlot) };
        let raw = unsafe { &mut *pos };
        let mut position = position_from_raw(raw);
        let filled = slot.with(|handlers| {
            handlers.apply_pending();
            handlers.timebase(transport_state(state), nframes, &mut position, new_pos != 0)
        });
        if filled == Some(true) {
            write_extended(&position, raw);
        }
    }));
    if outcome.is_err() {
        log::error!("timebase callback bridge panicked; position left unchanged");
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Server-thread handlers
// ═══════════════════════════════════════════════════════════════════════════════

struct JackProcessor {
    realtime: Arc<RealtimeSlot>,
    ports: NativePorts,
    commands: Consumer<PortCommand>,
    returned: Producer<NativePort>,
}

impl JackProcessor {
    fn apply_commands(&mut self) {
        while let Ok(command) = self.commands.pop() {
            match command {
                PortCommand::Add(port) => self.ports.0.push(port),
                PortCommand::Remove(id) => {
                    if let Some(index) = self.ports.0.iter().position(|port| port.id() == id) {
                        let port = self.ports.0.swap_remove(index);
                        // Queue full: the client side times out and reports it
                        let _ = self.returned.push(port);
                    }
                }
            }
        }
    }
}

impl jack::ProcessHandler for JackProcessor {
    fn process(&mut self, _client: &jack::Client, ps: &jack::ProcessScope) -> jack::Control {
        self.apply_commands();

        for port in self.ports.0.iter_mut() {
            port.fill(ps);
        }
        let ports = &self.ports;
        self.realtime.with(|handlers| {
            handlers.apply_pending();
            if handlers.has_process() {
                let scope = ProcessScope::new(ps.n_frames(), ps.last_frame_time(), ports);
                handlers.process(&scope);
            }
        });
        for port in self.ports.0.iter_mut() {
            port.publish(ps);
        }
        jack::Control::Continue
    }

    fn buffer_size(&mut self, _client: &jack::Client, size: jack::Frames) -> jack::Control {
        for port in self.ports.0.iter_mut() {
            port.buffer.resize(size);
        }
        self.realtime.with(|handlers| handlers.buffer_size(size));
        jack::Control::Continue
    }
}

struct JackNotifier {
    handlers: Mutex<NotificationHandlers>,
    ids: SharedIds,
    owner: String,
}

impl JackNotifier {
    fn handlers(&mut self) -> &mut NotificationHandlers {
        self.handlers
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn resolve(&self, client: &jack::Client, id: jack::PortId) -> Option<Port> {
        let port = client.port_by_id(id)?;
        let name = port.name().ok()?;
        let ownership = if name.starts_with(&format!("{}:", self.owner)) {
            Ownership::Owned
        } else {
            Ownership::External
        };
        describe(&port, &self.ids, ownership)
    }
}

impl jack::NotificationHandler for JackNotifier {
    unsafe fn shutdown(&mut self, status: jack::ClientStatus, reason: &str) {
        let status = Status::from_bits(status.bits() as u32);
        log::warn!("jack server shut down client '{}': {}", self.owner, reason);
        self.handlers().shutdown(status, reason);
    }

    fn freewheel(&mut self, _client: &jack::Client, is_enabled: bool) {
        self.handlers().freewheel(is_enabled);
    }

    fn sample_rate(&mut self, _client: &jack::Client, srate: jack::Frames) -> jack::Control {
        self.handlers().sample_rate(srate);
        jack::Control::Continue
    }

    fn client_registration(&mut self, _client: &jack::Client, name: &str, is_registered: bool) {
        self.handlers().client_registration(name, is_registered);
    }

    fn port_registration(&mut self, client: &jack::Client, port_id: jack::PortId, is_registered: bool) {
        let port = self.resolve(client, port_id);
        self.handlers().port_registration(port, is_registered);
    }

    fn port_rename(
        &mut self,
        client: &jack::Client,
        port_id: jack::PortId,
        old_name: &str,
        new_name: &str,
    ) -> jack::Control {
        lock_ids(&self.ids).rename(old_name, new_name);
        let port = self.resolve(client, port_id);
        self.handlers().port_rename(port, old_name, new_name);
        jack::Control::Continue
    }

    fn ports_connected(
        &mut self,
        client: &jack::Client,
        port_id_a: jack::PortId,
        port_id_b: jack::PortId,
        are_connected: bool,
    ) {
        let a = self.resolve(client, port_id_a);
        let b = self.resolve(client, port_id_b);
        self.handlers().port_connect(a, b, are_connected);
    }

    fn graph_reorder(&mut self, _client: &jack::Client) -> jack::Control {
        self.handlers().graph_order();
        jack::Control::Continue
    }

    fn xrun(&mut self, client: &jack::Client) -> jack::Control {
        // SAFETY: the client handle is valid for the duration of the callback
        let delayed_usecs = unsafe { j::jack_get_xrun_delayed_usecs(client.raw()) };
        self.handlers().xrun(delayed_usecs);
        jack::Control::Continue
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Connector and session
// ═══════════════════════════════════════════════════════════════════════════════

/// Opens clients on the native server
#[derive(Debug, Clone, Copy, Default)]
pub struct JackConnector;

impl Connector for JackConnector {
    fn open(&self, name: &str, options: &ClientOptions) -> std::result::Result<(Box<dyn Backend>, Status), Status> {
        if options.server_name.is_some() {
            log::warn!("jack backend cannot select a server by name");
            return Err(Status::FAILURE | Status::INVALID_OPTION);
        }
        let mut native_options = jack::ClientOptions::empty();
        if options.no_start_server {
            native_options |= jack::ClientOptions::NO_START_SERVER;
        }
        if options.use_exact_name {
            native_options |= jack::ClientOptions::USE_EXACT_NAME;
        }
        let (client, status) = jack::Client::new(name, native_options).map_err(|e| {
            log::warn!("jack open '{}' failed: {}", name, e);
            Status::FAILURE | Status::SERVER_FAILED
        })?;
        let status = Status::from_bits(status.bits() as u32);
        log::info!(
            "jack client '{}' opened: {} Hz, {} frames",
            client.name(),
            client.sample_rate(),
            client.buffer_size()
        );
        Ok((Box::new(JackSession::new(client)), status))
    }
}

enum Connection {
    Inactive(jack::Client),
    Active(jack::AsyncClient<JackNotifier, JackProcessor>),
    Closed,
}

/// Queue ends used while the processor owns the ports
struct ActiveQueues {
    commands: Producer<PortCommand>,
    returned: Consumer<NativePort>,
}

// The connection is dropped before the slot its callbacks point into
struct JackSession {
    name: String,
    connection: Connection,
    ports: Vec<NativePort>,
    queues: Option<ActiveQueues>,
    ids: SharedIds,
    realtime: Arc<RealtimeSlot>,
    transport: Arc<JackTransport>,
}

impl JackSession {
    fn new(client: jack::Client) -> Self {
        let transport = Arc::new(JackTransport {
            native: client.transport(),
        });
        JackSession {
            name: client.name().to_string(),
            connection: Connection::Inactive(client),
            ports: Vec::new(),
            queues: None,
            ids: Arc::new(Mutex::new(PortIds::default())),
            realtime: Arc::new(RealtimeSlot::default()),
            transport,
        }
    }

    fn client(&self) -> Result<&jack::Client> {
        match &self.connection {
            Connection::Inactive(client) => Ok(client),
            Connection::Active(active) => Ok(active.as_client()),
            Connection::Closed => Err(ViolationKind::ClientClosed.into()),
        }
    }

    fn ownership(&self, name: &str) -> Ownership {
        if name.starts_with(&format!("{}:", self.name)) {
            Ownership::Owned
        } else {
            Ownership::External
        }
    }

    fn lookup(&self, name: &str) -> Result<jack::Port<jack::Unowned>> {
        self.client()?
            .port_by_name(name)
            .ok_or_else(|| Error::PortNotFound(name.to_string()))
    }

    /// Get an owned port back from the processor, or from the local list
    fn reclaim(&mut self, id: PortId) -> Result<NativePort> {
        if let Some(index) = self.ports.iter().position(|port| port.id() == id) {
            return Ok(self.ports.swap_remove(index));
        }
        let Some(queues) = self.queues.as_mut() else {
            return Err(Error::PortNotFound(id.to_string()));
        };
        queues
            .commands
            .push(PortCommand::Remove(id))
            .map_err(|_| Error::CommandQueueFull)?;
        let deadline = Instant::now() + RECLAIM_TIMEOUT;
        while Instant::now() < deadline {
            match queues.returned.pop() {
                Ok(port) if port.id() == id => return Ok(port),
                Ok(other) => self.ports.push(other),
                Err(_) => std::thread::sleep(Duration::from_millis(1)),
            }
        }
        log::warn!("process thread did not release port {}", id);
        Err(Error::Operation {
            op: "unregister port",
            code: -1,
        })
    }

    fn register_native(&self, client: &jack::Client, short_name: &str, kind: PortKind, flags: PortFlags) -> Result<NativeHandle> {
        let direction = flags.direction().unwrap_or(Direction::Output);
        let handle = match (kind, direction) {
            (PortKind::Audio, Direction::Input) => client
                .register_port(short_name, jack::AudioIn::default())
                .map(NativeHandle::AudioIn),
            (PortKind::Audio, Direction::Output) => client
                .register_port(short_name, jack::AudioOut::default())
                .map(NativeHandle::AudioOut),
            (PortKind::Midi, Direction::Input) => client
                .register_port(short_name, jack::MidiIn::default())
                .map(NativeHandle::MidiIn),
            (PortKind::Midi, Direction::Output) => client
                .register_port(short_name, jack::MidiOut::default())
                .map(NativeHandle::MidiOut),
        };
        handle.map_err(|e| native_error("register port", e))
    }
}

impl Backend for JackSession {
    fn name(&self) -> &str {
        &self.name
    }

    fn uuid(&self) -> Result<Uuid> {
        Ok(Uuid(self.client()?.uuid()))
    }

    fn sample_rate(&self) -> Frames {
        self.client().map(|c| c.sample_rate() as Frames).unwrap_or(0)
    }

    fn buffer_size(&self) -> Frames {
        self.client().map(|c| c.buffer_size()).unwrap_or(0)
    }

    fn set_buffer_size(&mut self, nframes: Frames) -> Result<()> {
        self.client()?
            .set_buffer_size(nframes)
            .map_err(|e| native_error("set buffer size", e))
    }

    fn is_realtime(&self) -> bool {
        // SAFETY: the client handle is valid while borrowed
        self.client()
            .map(|c| unsafe { j::jack_is_realtime(c.raw()) } != 0)
            .unwrap_or(false)
    }

    fn cpu_load(&self) -> f32 {
        self.client().map(|c| c.cpu_load()).unwrap_or(0.0)
    }

    fn frame_time(&self) -> Frames {
        self.client().map(|c| c.frame_time()).unwrap_or(0)
    }

    fn frames_since_cycle_start(&self) -> Frames {
        self.client().map(|c| c.frames_since_cycle_start()).unwrap_or(0)
    }

    fn last_frame_time(&self) -> Frames {
        self.client().map(|c| c.last_frame_time()).unwrap_or(0)
    }

    fn activate(&mut self, handlers: Handlers) -> std::result::Result<(), ActivationError> {
        let client = match std::mem::replace(&mut self.connection, Connection::Closed) {
            Connection::Inactive(client) => client,
            other => {
                self.connection = other;
                return Err(ActivationError {
                    error: Error::Operation { op: "activate", code: -1 },
                    handlers,
                });
            }
        };
        let Handlers {
            realtime,
            notifications,
        } = handlers;

        let (commands, command_rx) = RingBuffer::new(PORT_QUEUE_SIZE);
        let (returned_tx, returned) = RingBuffer::new(PORT_QUEUE_SIZE);
        let mut ports = Vec::with_capacity(MAX_ACTIVE_PORTS.max(self.ports.len()));
        ports.append(&mut self.ports);

        self.realtime.install(realtime);
        let processor = JackProcessor {
            realtime: self.realtime.clone(),
            ports: NativePorts(ports),
            commands: command_rx,
            returned: returned_tx,
        };
        let notifier = JackNotifier {
            handlers: Mutex::new(notifications),
            ids: self.ids.clone(),
            owner: self.name.clone(),
        };
        // On failure the jack crate drops the client and both handlers; the
        // connection stays closed and the callbacks have to be set again
        match client.activate_async(notifier, processor) {
            Ok(active) => {
                self.connection = Connection::Active(active);
                self.queues = Some(ActiveQueues { commands, returned });
                log::info!("jack client '{}' activated", self.name);
                Ok(())
            }
            Err(e) => {
                self.realtime.take();
                Err(ActivationError {
                    error: native_error("activate", e),
                    handlers: Handlers::detached(),
                })
            }
        }
    }

    fn deactivate(&mut self) -> Result<Handlers> {
        let active = match std::mem::replace(&mut self.connection, Connection::Closed) {
            Connection::Active(active) => active,
            other => {
                self.connection = other;
                return Err(ViolationKind::NotActive.into());
            }
        };
        let (client, notifier, mut processor) = active
            .deactivate()
            .map_err(|e| native_error("deactivate", e))?;
        self.queues = None;
        processor.apply_commands();
        self.ports.append(&mut processor.ports.0);
        let notifications = notifier
            .handlers
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let realtime = self
            .realtime
            .take()
            .unwrap_or_else(|| Handlers::detached().realtime);
        self.connection = Connection::Inactive(client);
        log::info!("jack client '{}' deactivated", self.name);
        Ok(Handlers {
            realtime,
            notifications,
        })
    }

    fn close(&mut self) -> Result<()> {
        if let Connection::Inactive(client) = &self.connection {
            for port in std::mem::take(&mut self.ports) {
                port.unregister(client)?;
            }
        }
        self.connection = Connection::Closed;
        Ok(())
    }

    fn register_port(&mut self, short_name: &str, kind: PortKind, flags: PortFlags) -> Result<Port> {
        let client = self.client()?;
        let handle = self.register_native(client, short_name, kind, flags)?;
        let uuid = handle.uuid();
        let full_name = format!("{}:{}", self.name, short_name);
        let id = lock_ids(&self.ids).intern(&full_name);
        let direction = flags.direction().unwrap_or(Direction::Output);
        let port = NativePort {
            buffer: PortBuffer::new(id, kind, direction, client.buffer_size()),
            handle,
        };
        match self.queues.as_mut() {
            Some(queues) => {
                if queues.commands.push(PortCommand::Add(port)).is_err() {
                    return Err(Error::CommandQueueFull);
                }
            }
            None => self.ports.push(port),
        }
        Ok(Port::new(id, full_name, kind, flags, uuid, Ownership::Owned))
    }

    fn unregister_port(&mut self, port: &Port) -> Result<()> {
        let native = self.reclaim(port.id())?;
        native.unregister(self.client()?)
    }

    fn rename_port(&mut self, port: &Port, short_name: &str) -> Result<String> {
        let mut native = self.lookup(port.name())?;
        native
            .set_name(short_name)
            .map_err(|e| native_error("rename port", e))?;
        let full_name = format!("{}:{}", self.name, short_name);
        lock_ids(&self.ids).rename(port.name(), &full_name);
        Ok(full_name)
    }

    fn port_aliases(&self, port: &Port) -> Result<Vec<String>> {
        self.lookup(port.name())?
            .aliases()
            .map_err(|e| native_error("port aliases", e))
    }

    fn set_port_alias(&mut self, port: &Port, alias: &str) -> Result<()> {
        self.lookup(port.name())?
            .set_alias(alias)
            .map_err(|e| native_error("set port alias", e))
    }

    fn unset_port_alias(&mut self, port: &Port, alias: &str) -> Result<()> {
        self.lookup(port.name())?
            .unset_alias(alias)
            .map_err(|e| native_error("unset port alias", e))
    }

    fn request_monitor(&mut self, port: &Port, on: bool) -> Result<()> {
        self.lookup(port.name())?
            .request_monitor(on)
            .map_err(|e| native_error("request monitor", e))
    }

    fn monitoring(&self, port: &Port) -> Result<bool> {
        self.lookup(port.name())?
            .is_monitoring_input()
            .map_err(|e| native_error("monitoring", e))
    }

    fn port_by_name(&self, name: &str) -> Option<Port> {
        let native = self.lookup(name).ok()?;
        let full_name = native.name().ok()?;
        describe(&native, &self.ids, self.ownership(&full_name))
    }

    fn ports(&self, filter: &PortFilter) -> Result<Vec<Port>> {
        let matcher = filter.compile()?;
        let client = self.client()?;
        let names = client.ports(None, None, jack::PortFlags::empty());
        Ok(names
            .iter()
            .filter_map(|name| self.port_by_name(name))
            .filter(|port| matcher.matches(port.name(), port.kind(), port.flags()))
            .collect())
    }

    fn connect(&mut self, source: &str, destination: &str) -> Result<()> {
        self.client()?
            .connect_ports_by_name(source, destination)
            .map_err(|e| native_error("connect", e))
    }

    fn disconnect(&mut self, source: &str, destination: &str) -> Result<()> {
        self.client()?
            .disconnect_ports_by_name(source, destination)
            .map_err(|e| native_error("disconnect", e))
    }

    fn disconnect_all(&mut self, port: &Port) -> Result<()> {
        for other in self.connections(port)? {
            let (source, destination) = match port.direction() {
                Direction::Output => (port.name(), other.as_str()),
                Direction::Input => (other.as_str(), port.name()),
            };
            self.disconnect(source, destination)?;
        }
        Ok(())
    }

    fn connections(&self, port: &Port) -> Result<Vec<String>> {
        let native = self.lookup(port.name())?;
        let client = self.client()?;
        Ok(client
            .ports(None, None, jack::PortFlags::empty())
            .into_iter()
            .filter(|name| native.is_connected_to(name).unwrap_or(false))
            .collect())
    }

    fn set_freewheel(&mut self, on: bool) -> Result<()> {
        let client = self.client()?;
        // SAFETY: the client handle is valid while borrowed
        check("set freewheel", unsafe { j::jack_set_freewheel(client.raw(), c_int::from(on)) })
    }

    fn set_sync_timeout(&mut self, usecs: Time) -> Result<()> {
        let client = self.client()?;
        // SAFETY: the client handle is valid while borrowed
        check("set sync timeout", unsafe { j::jack_set_sync_timeout(client.raw(), usecs) })
    }

    fn set_slow_sync(&mut self, enabled: bool) -> Result<()> {
        let client = self.client()?;
        let (callback, arg): (j::JackSyncCallback, *mut c_void) = if enabled {
            (Some(sync_trampoline), self.realtime.as_arg())
        } else {
            (None, std::ptr::null_mut())
        };
        // SAFETY: `arg` points into `self.realtime`, which outlives the client
        check("set sync callback", unsafe {
            j::jack_set_sync_callback(client.raw(), callback, arg)
        })
    }

    fn acquire_timebase(&mut self, conditional: bool) -> Result<bool> {
        let client = self.client()?;
        // SAFETY: as for the sync callback
        let code = unsafe {
            j::jack_set_timebase_callback(
                client.raw(),
                c_int::from(conditional),
                Some(timebase_trampoline),
                self.realtime.as_arg(),
            )
        };
        match code {
            0 => Ok(true),
            EBUSY if conditional => Ok(false),
            code => check("set timebase callback", code).map(|_| false),
        }
    }

    fn release_timebase(&mut self) -> Result<()> {
        let client = self.client()?;
        // SAFETY: the client handle is valid while borrowed
        match unsafe { j::jack_release_timebase(client.raw()) } {
            0 => Ok(()),
            EINVAL => Err(Error::NotTimebaseMaster),
            code => check("release timebase", code),
        }
    }

    fn transport(&self) -> Arc<dyn TransportControl> {
        self.transport.clone()
    }

    fn uuid_for_client_name(&self, name: &str) -> Result<Uuid> {
        c_string("client uuid", name)?;
        self.client()?
            .uuid_of_client_by_name(name)
            .map(Uuid)
            .ok_or_else(|| Error::ClientNotFound(name.to_string()))
    }

    fn client_name_by_uuid(&self, uuid: Uuid) -> Result<String> {
        self.client()?
            .name_by_uuid(uuid.0)
            .ok_or_else(|| Error::ClientNotFound(uuid.to_string()))
    }

    fn client_pid(&self, name: &str) -> Option<u32> {
        let name = CString::new(name).ok()?;
        // Older servers lack the symbol
        // SAFETY: `name` is a valid C string for the duration of the call
        let pid = unsafe { j::jack_get_client_pid(name.as_ptr()) }?;
        u32::try_from(pid).ok().filter(|pid| *pid > 0)
    }

    fn set_property(&mut self, subject: Uuid, key: &str, property: Property) -> Result<()> {
        c_string("set property", key)?;
        let value = String::from_utf8(property.value).map_err(|_| Error::Operation {
            op: "set property",
            code: EINVAL,
        })?;
        c_string("set property", &value)?;
        c_string("set property", &property.mime_type)?;
        let typ = (!property.mime_type.is_empty()).then_some(property.mime_type);
        self.client()?
            .property_set(subject.0, key, &jack::Property::new(value, typ))
            .map_err(|e| native_error("set property", e))
    }

    fn property(&self, subject: Uuid, key: &str) -> Result<Option<Property>> {
        c_string("get property", key)?;
        Ok(self.client()?.property_get(subject.0, key).map(property_from_native))
    }

    fn properties(&self, subject: Uuid) -> Result<Description> {
        let map = self.client()?.property_get_subject(subject.0).unwrap_or_default();
        Ok(map
            .into_iter()
            .map(|(key, property)| (key, property_from_native(property)))
            .collect())
    }

    fn all_properties(&self) -> Result<BTreeMap<Uuid, Description>> {
        Ok(self
            .client()?
            .property_get_all()
            .into_iter()
            .map(|(subject, map)| {
                let description = map
                    .into_iter()
                    .map(|(key, property)| (key, property_from_native(property)))
                    .collect();
                (Uuid(subject), description)
            })
            .collect())
    }

    fn remove_property(&mut self, subject: Uuid, key: &str) -> Result<()> {
        c_string("remove property", key)?;
        self.client()?
            .property_remove(subject.0, key)
            .map_err(|e| native_error("remove property", e))
    }

    fn remove_properties(&mut self, subject: Uuid) -> Result<usize> {
        let client = self.client()?;
        let count = client.property_get_subject(subject.0).map_or(0, |map| map.len());
        client
            .property_remove_subject(subject.0)
            .map_err(|e| native_error("remove properties", e))?;
        Ok(count)
    }

    fn remove_all_properties(&mut self) -> Result<()> {
        self.client()?
            .property_remove_all()
            .map_err(|e| native_error("remove all properties", e))
    }
}

fn property_from_native(property: jack::Property) -> Property {
    Property {
        value: property.value().as_bytes().to_vec(),
        mime_type: property.typ().unwrap_or_default().to_string(),
    }
}

/// Transport control through the client's [`jack::Transport`]
struct JackTransport {
    native: jack::Transport,
}

impl TransportControl for JackTransport {
    fn start(&self) {
        if let Err(e) = self.native.start() {
            log::warn!("jack transport start failed: {}", e);
        }
    }

    fn stop(&self) {
        if let Err(e) = self.native.stop() {
            log::warn!("jack transport stop failed: {}", e);
        }
    }

    fn reposition(&self, position: &TransportPosition) -> Result<()> {
        let result = if position.valid.bits() & NATIVE_BITS == 0 {
            self.native.locate(position.frame)
        } else {
            self.native.reposition(&native_position(position)?)
        };
        result.map_err(|e| native_error("transport reposition", e))
    }

    fn query(&self) -> Result<(TransportState, TransportPosition)> {
        let queried = self
            .native
            .query()
            .map_err(|e| native_error("transport query", e))?;
        let state = match queried.state {
            jack::TransportState::Stopped => TransportState::Stopped,
            jack::TransportState::Rolling => TransportState::Rolling,
            jack::TransportState::Starting => TransportState::Starting,
        };
        Ok((state, position_from_native(&queried.pos)))
    }

    fn current_frame(&self) -> Frames {
        let Ok((state, position)) = self.query() else {
            return 0;
        };
        if state != TransportState::Rolling || position.usecs == 0 {
            return position.frame;
        }
        let elapsed = jack::get_time().saturating_sub(position.usecs);
        let advanced = elapsed * position.frame_rate as Time / 1_000_000;
        position.frame.wrapping_add(advanced as Frames)
    }
}
