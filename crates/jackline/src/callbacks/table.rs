use std::sync::{Arc, Mutex};

use rtrb::{Consumer, Producer, RingBuffer};

use super::bridge::invoke;
use super::{
    BufferSizeFn, CallbackKind, ClientRegistrationFn, Control, FreewheelFn, GraphOrderFn,
    PortAvailability, PortConnectFn, PortRegistrationFn, PortRenameFn, ProcessFn,
    PropertyChangeFn, SampleRateFn, ShutdownFn, SyncFn, TimebaseFn, XrunFn,
};
use crate::error::{Error, Result, Status, ViolationKind};
use crate::metadata::PropertyChange;
use crate::port::Port;
use crate::process::ProcessScope;
use crate::transport::{TransportPosition, TransportState};
use crate::types::{Frames, Uuid};

/// Capacity of the realtime command and retire queues
const COMMAND_QUEUE_SIZE: usize = 16;

/// A callback that can disable itself by returning [`Control::Stop`]
struct Slot<F> {
    callback: Option<F>,
    stopped: bool,
}

impl<F> Default for Slot<F> {
    fn default() -> Self {
        Slot {
            callback: None,
            stopped: false,
        }
    }
}

impl<F> Slot<F> {
    fn replace(&mut self, callback: Option<F>) -> Option<F> {
        self.stopped = false;
        std::mem::replace(&mut self.callback, callback)
    }

    fn live(&mut self) -> Option<&mut F> {
        if self.stopped {
            None
        } else {
            self.callback.as_mut()
        }
    }

    fn is_set(&self) -> bool {
        self.callback.is_some()
    }
}

/// Invoke a self-disabling callback; a panic counts as `Continue`
fn invoke_slot<F>(kind: CallbackKind, slot: &mut Slot<F>, call: impl FnOnce(&mut F) -> Control) -> Control {
    let Some(callback) = slot.live() else {
        return Control::Continue;
    };
    let control = invoke(kind, Control::Continue, || call(callback));
    if control.is_stop() {
        log::debug!("{} callback asked to stop", kind);
        slot.stopped = true;
    }
    control
}

/// Replacement of a realtime slot, applied by the process thread
pub(crate) enum RealtimeCommand {
    Process(Option<ProcessFn>),
    Sync(Option<SyncFn>),
    Timebase(Option<TimebaseFn>),
}

// ═══════════════════════════════════════════════════════════════════════════════
// Process-thread half
// ═══════════════════════════════════════════════════════════════════════════════

/// Callbacks owned by the process thread while the client is active
pub struct RealtimeHandlers {
    process: Slot<ProcessFn>,
    buffer_size: Slot<BufferSizeFn>,
    sync: Option<SyncFn>,
    timebase: Option<TimebaseFn>,
    commands: Consumer<RealtimeCommand>,
    retired: Producer<RealtimeCommand>,
}

impl RealtimeHandlers {
    /// Apply slot replacements queued by the client thread
    ///
    /// Lock-free and allocation-free. Replaced closures are sent back for
    /// dropping on the client thread.
    pub fn apply_pending(&mut self) {
        while let Ok(command) = self.commands.pop() {
            let old = match command {
                RealtimeCommand::Process(callback) => {
                    RealtimeCommand::Process(self.process.replace(callback))
                }
                RealtimeCommand::Sync(callback) => {
                    RealtimeCommand::Sync(std::mem::replace(&mut self.sync, callback))
                }
                RealtimeCommand::Timebase(callback) => {
                    RealtimeCommand::Timebase(std::mem::replace(&mut self.timebase, callback))
                }
            };
            // Retire queue full: the closure is dropped here instead
            let _ = self.retired.push(old);
        }
    }

    pub fn has_process(&self) -> bool {
        self.process.is_set()
    }

    /// Run the process callback for one cycle
    pub fn process(&mut self, scope: &ProcessScope) -> Control {
        invoke_slot(CallbackKind::Process, &mut self.process, |callback| callback(scope))
    }

    pub fn buffer_size(&mut self, nframes: Frames) -> Control {
        invoke_slot(CallbackKind::BufferSize, &mut self.buffer_size, |callback| {
            callback(nframes)
        })
    }

    pub fn has_sync(&self) -> bool {
        self.sync.is_some()
    }

    /// Poll the sync callback; a client without one is always ready
    pub fn sync(&mut self, state: TransportState, position: &TransportPosition) -> bool {
        match self.sync.as_mut() {
            Some(callback) => invoke(CallbackKind::Sync, false, || callback(state, position)),
            None => true,
        }
    }

    pub fn has_timebase(&self) -> bool {
        self.timebase.is_some()
    }

    /// Run the timebase callback; false if none is installed
    pub fn timebase(
        &mut self,
        state: TransportState,
        nframes: Frames,
        position: &mut TransportPosition,
        new_position: bool,
    ) -> bool {
        match self.timebase.as_mut() {
            Some(callback) => {
                invoke(CallbackKind::Timebase, (), || {
                    callback(state, nframes, position, new_position)
                });
                true
            }
            None => false,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Notification-thread half
// ═══════════════════════════════════════════════════════════════════════════════

type SharedShutdown = Arc<Mutex<Option<ShutdownFn>>>;

/// Callbacks owned by the notification thread while the client is active
#[derive(Default)]
pub struct NotificationHandlers {
    shutdown: SharedShutdown,
    sample_rate: Slot<SampleRateFn>,
    client_registration: Option<ClientRegistrationFn>,
    port_registration: Option<(PortRegistrationFn, PortAvailability)>,
    port_connect: Option<(PortConnectFn, PortAvailability)>,
    port_rename: Slot<(PortRenameFn, PortAvailability)>,
    graph_order: Slot<GraphOrderFn>,
    xrun: Slot<XrunFn>,
    freewheel: Option<FreewheelFn>,
    property_change: Option<PropertyChangeFn>,
}

impl NotificationHandlers {
    /// Server shut down or dropped the client; invoked at most once per install
    pub fn shutdown(&mut self, status: Status, reason: &str) {
        let callback = self
            .shutdown
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(mut callback) = callback {
            invoke(CallbackKind::Shutdown, (), || callback(status, reason));
        }
    }

    pub fn sample_rate(&mut self, rate: Frames) -> Control {
        invoke_slot(CallbackKind::SampleRate, &mut self.sample_rate, |callback| {
            callback(rate)
        })
    }

    pub fn client_registration(&mut self, name: &str, registered: bool) {
        if let Some(callback) = self.client_registration.as_mut() {
            invoke(CallbackKind::ClientRegistration, (), || {
                callback(name, registered)
            });
        }
    }

    pub fn port_registration(&mut self, port: Option<Port>, registered: bool) {
        let Some((callback, policy)) = self.port_registration.as_mut() else {
            return;
        };
        if port.is_none() && *policy == PortAvailability::OnlyAvailable {
            return;
        }
        invoke(CallbackKind::PortRegistration, (), || callback(port, registered));
    }

    pub fn port_connect(&mut self, a: Option<Port>, b: Option<Port>, connected: bool) {
        let Some((callback, policy)) = self.port_connect.as_mut() else {
            return;
        };
        if (a.is_none() || b.is_none()) && *policy == PortAvailability::OnlyAvailable {
            return;
        }
        invoke(CallbackKind::PortConnect, (), || callback(a, b, connected));
    }

    pub fn port_rename(&mut self, port: Option<Port>, old_name: &str, new_name: &str) -> Control {
        let skip = match self.port_rename.live() {
            Some((_, policy)) => port.is_none() && *policy == PortAvailability::OnlyAvailable,
            None => true,
        };
        if skip {
            return Control::Continue;
        }
        invoke_slot(CallbackKind::PortRename, &mut self.port_rename, |(callback, _)| {
            callback(port, old_name, new_name)
        })
    }

    pub fn graph_order(&mut self) -> Control {
        invoke_slot(CallbackKind::GraphOrder, &mut self.graph_order, |callback| callback())
    }

    pub fn xrun(&mut self, delayed_usecs: f32) -> Control {
        invoke_slot(CallbackKind::Xrun, &mut self.xrun, |callback| callback(delayed_usecs))
    }

    pub fn freewheel(&mut self, starting: bool) {
        if let Some(callback) = self.freewheel.as_mut() {
            invoke(CallbackKind::Freewheel, (), || callback(starting));
        }
    }

    pub fn property_change(&mut self, subject: Uuid, key: &str, change: PropertyChange) {
        if let Some(callback) = self.property_change.as_mut() {
            invoke(CallbackKind::PropertyChange, (), || {
                callback(subject, key, change)
            });
        }
    }
}

/// Both handler halves, as handed to a backend at activation
pub struct Handlers {
    pub realtime: RealtimeHandlers,
    pub notifications: NotificationHandlers,
}

impl Handlers {
    fn with_queues(
        commands: Consumer<RealtimeCommand>,
        retired: Producer<RealtimeCommand>,
        shutdown: SharedShutdown,
    ) -> Self {
        Handlers {
            realtime: RealtimeHandlers {
                process: Slot::default(),
                buffer_size: Slot::default(),
                sync: None,
                timebase: None,
                commands,
                retired,
            },
            notifications: NotificationHandlers {
                shutdown,
                ..Default::default()
            },
        }
    }

    /// Empty handlers not tied to any client's callback table
    pub(crate) fn detached() -> Self {
        let (_, commands) = RingBuffer::new(1);
        let (retired, _) = RingBuffer::new(1);
        Handlers::with_queues(commands, retired, Arc::new(Mutex::new(None)))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Client-side table
// ═══════════════════════════════════════════════════════════════════════════════

/// Callback registrations of one client
///
/// Holds the handlers while the client is inactive. After activation the
/// handlers live in the backend and only the queue ends stay here.
pub struct CallbackTable {
    handlers: Option<Handlers>,
    commands: Producer<RealtimeCommand>,
    retired: Consumer<RealtimeCommand>,
    shutdown: SharedShutdown,
}

impl Default for CallbackTable {
    fn default() -> Self {
        Self::new()
    }
}

impl CallbackTable {
    pub fn new() -> Self {
        let (commands, command_rx) = RingBuffer::new(COMMAND_QUEUE_SIZE);
        let (retire_tx, retired) = RingBuffer::new(COMMAND_QUEUE_SIZE);
        let shutdown: SharedShutdown = Arc::new(Mutex::new(None));
        let handlers = Handlers::with_queues(command_rx, retire_tx, shutdown.clone());
        CallbackTable {
            handlers: Some(handlers),
            commands,
            retired,
            shutdown,
        }
    }

    /// True while the handlers are checked out to a backend
    pub fn is_checked_out(&self) -> bool {
        self.handlers.is_none()
    }

    fn inactive(&mut self, kind: CallbackKind) -> Result<&mut Handlers> {
        self.handlers
            .as_mut()
            .ok_or(Error::Violation(ViolationKind::RegisteredWhileActive(kind)))
    }

    fn send(&mut self, command: RealtimeCommand) -> Result<()> {
        self.collect_retired();
        self.commands
            .push(command)
            .map_err(|_| Error::CommandQueueFull)
    }

    pub fn set_process(&mut self, callback: ProcessFn) -> Result<()> {
        match self.handlers.as_mut() {
            Some(handlers) => {
                handlers.realtime.process.replace(Some(callback));
                Ok(())
            }
            None => self.send(RealtimeCommand::Process(Some(callback))),
        }
    }

    pub fn set_sync(&mut self, callback: Option<SyncFn>) -> Result<()> {
        match self.handlers.as_mut() {
            Some(handlers) => {
                handlers.realtime.sync = callback;
                Ok(())
            }
            None => self.send(RealtimeCommand::Sync(callback)),
        }
    }

    pub fn set_timebase(&mut self, callback: Option<TimebaseFn>) -> Result<()> {
        match self.handlers.as_mut() {
            Some(handlers) => {
                handlers.realtime.timebase = callback;
                Ok(())
            }
            None => self.send(RealtimeCommand::Timebase(callback)),
        }
    }

    /// Allowed at any time; takes effect for the next shutdown event
    pub fn set_shutdown(&mut self, callback: ShutdownFn) {
        *self
            .shutdown
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(callback);
    }

    pub fn set_buffer_size(&mut self, callback: BufferSizeFn) -> Result<()> {
        self.inactive(CallbackKind::BufferSize)?
            .realtime
            .buffer_size
            .replace(Some(callback));
        Ok(())
    }

    pub fn set_sample_rate(&mut self, callback: SampleRateFn) -> Result<()> {
        self.inactive(CallbackKind::SampleRate)?
            .notifications
            .sample_rate
            .replace(Some(callback));
        Ok(())
    }

    pub fn set_client_registration(&mut self, callback: ClientRegistrationFn) -> Result<()> {
        self.inactive(CallbackKind::ClientRegistration)?
            .notifications
            .client_registration = Some(callback);
        Ok(())
    }

    pub fn set_port_registration(&mut self, callback: PortRegistrationFn, policy: PortAvailability) -> Result<()> {
        self.inactive(CallbackKind::PortRegistration)?
            .notifications
            .port_registration = Some((callback, policy));
        Ok(())
    }

    pub fn set_port_connect(&mut self, callback: PortConnectFn, policy: PortAvailability) -> Result<()> {
        self.inactive(CallbackKind::PortConnect)?
            .notifications
            .port_connect = Some((callback, policy));
        Ok(())
    }

    pub fn set_port_rename(&mut self, callback: PortRenameFn, policy: PortAvailability) -> Result<()> {
        self.inactive(CallbackKind::PortRename)?
            .notifications
            .port_rename
            .replace(Some((callback, policy)));
        Ok(())
    }

    pub fn set_graph_order(&mut self, callback: GraphOrderFn) -> Result<()> {
        self.inactive(CallbackKind::GraphOrder)?
            .notifications
            .graph_order
            .replace(Some(callback));
        Ok(())
    }

    pub fn set_xrun(&mut self, callback: XrunFn) -> Result<()> {
        self.inactive(CallbackKind::Xrun)?
            .notifications
            .xrun
            .replace(Some(callback));
        Ok(())
    }

    pub fn set_freewheel(&mut self, callback: FreewheelFn) -> Result<()> {
        self.inactive(CallbackKind::Freewheel)?
            .notifications
            .freewheel = Some(callback);
        Ok(())
    }

    pub fn set_property_change(&mut self, callback: PropertyChangeFn) -> Result<()> {
        self.inactive(CallbackKind::PropertyChange)?
            .notifications
            .property_change = Some(callback);
        Ok(())
    }

    /// Hand the handlers to a backend for activation
    pub(crate) fn check_out(&mut self) -> Option<Handlers> {
        self.handlers.take()
    }

    /// Take the handlers back after deactivation
    pub(crate) fn check_in(&mut self, mut handlers: Handlers) {
        handlers.realtime.apply_pending();
        self.handlers = Some(handlers);
        self.collect_retired();
    }

    /// Drop closures the process thread has replaced; returns how many
    pub fn collect_retired(&mut self) -> usize {
        let mut count = 0;
        while self.retired.pop().is_ok() {
            count += 1;
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        (count.clone(), count)
    }

    #[test]
    fn test_inactive_registration_allowed() {
        let mut table = CallbackTable::new();
        table.set_xrun(Box::new(|_| Control::Continue)).unwrap();
        table.set_graph_order(Box::new(|| Control::Continue)).unwrap();
        table
            .set_port_registration(Box::new(|_, _| {}), PortAvailability::OnlyAvailable)
            .unwrap();
    }

    #[test]
    fn test_active_registration_rules() {
        let mut table = CallbackTable::new();
        let handlers = table.check_out().unwrap();

        let err = table.set_xrun(Box::new(|_| Control::Continue)).unwrap_err();
        assert!(matches!(
            err,
            Error::Violation(ViolationKind::RegisteredWhileActive(CallbackKind::Xrun))
        ));
        assert!(table.set_sample_rate(Box::new(|_| Control::Continue)).is_err());

        table.set_process(Box::new(|_| Control::Continue)).unwrap();
        table.set_sync(Some(Box::new(|_, _| true))).unwrap();
        table.set_timebase(None).unwrap();
        table.set_shutdown(Box::new(|_, _| {}));

        table.check_in(handlers);
        let handlers = table.handlers.as_ref().unwrap();
        assert!(handlers.realtime.has_process());
        assert!(handlers.realtime.has_sync());
    }

    #[test]
    fn test_replaced_closures_are_retired() {
        let mut table = CallbackTable::new();
        table.set_process(Box::new(|_| Control::Continue)).unwrap();
        let mut handlers = table.check_out().unwrap();

        table.set_process(Box::new(|_| Control::Stop)).unwrap();
        handlers.realtime.apply_pending();
        assert_eq!(table.collect_retired(), 1);
        table.check_in(handlers);
    }

    #[test]
    fn test_stop_disables_slot() {
        let (calls, seen) = counter();
        let mut table = CallbackTable::new();
        table
            .set_xrun(Box::new(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                Control::Stop
            }))
            .unwrap();
        let mut handlers = table.check_out().unwrap();
        assert_eq!(handlers.notifications.xrun(10.0), Control::Stop);
        assert_eq!(handlers.notifications.xrun(10.0), Control::Continue);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_callback_is_contained() {
        let mut table = CallbackTable::new();
        table
            .set_graph_order(Box::new(|| panic!("graph order failure")))
            .unwrap();
        table.set_sync(Some(Box::new(|_, _| panic!("sync failure")))).unwrap();
        let mut handlers = table.check_out().unwrap();

        assert_eq!(handlers.notifications.graph_order(), Control::Continue);
        // A panicking sync callback reports "not ready"
        let position = TransportPosition::default();
        assert!(!handlers.realtime.sync(TransportState::Starting, &position));
    }

    #[test]
    fn test_vanished_port_policy() {
        let (calls, seen) = counter();
        let (vanished_calls, vanished_seen) = counter();
        let mut table = CallbackTable::new();
        table
            .set_port_registration(
                Box::new(move |_, _| {
                    calls.fetch_add(1, Ordering::SeqCst);
                }),
                PortAvailability::OnlyAvailable,
            )
            .unwrap();
        table
            .set_port_connect(
                Box::new(move |a, _, _| {
                    assert!(a.is_none());
                    vanished_calls.fetch_add(1, Ordering::SeqCst);
                }),
                PortAvailability::IncludeVanished,
            )
            .unwrap();
        let mut handlers = table.check_out().unwrap();

        handlers.notifications.port_registration(None, false);
        handlers.notifications.port_connect(None, None, false);
        assert_eq!(seen.load(Ordering::SeqCst), 0);
        assert_eq!(vanished_seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_shutdown_settable_while_checked_out() {
        let (calls, seen) = counter();
        let mut table = CallbackTable::new();
        let mut handlers = table.check_out().unwrap();
        table.set_shutdown(Box::new(move |status, reason| {
            assert!(status.failure());
            assert_eq!(reason, "gone");
            calls.fetch_add(1, Ordering::SeqCst);
        }));
        handlers.notifications.shutdown(Status::FAILURE, "gone");
        handlers.notifications.shutdown(Status::FAILURE, "again");
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
