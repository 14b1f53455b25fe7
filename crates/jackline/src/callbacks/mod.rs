//! User callbacks and the bridge that invokes them
//!
//! Callbacks are boxed closures. Each one belongs to a slot identified by a
//! [`CallbackKind`]. At activation the slots are split by the thread that
//! runs them:
//!
//! ```text
//!                   CallbackTable (client thread)
//!                  ┌───────────────┴────────────────┐
//!                  ▼                                ▼
//!        RealtimeHandlers                  NotificationHandlers
//!   process, sync, timebase,        shutdown, sample rate, xrun, graph
//!   buffer size                     order, client/port registration,
//!   (process thread)                port connect/rename, freewheel,
//!                                   property change (notification thread)
//! ```
//!
//! While the client is active, only the process, sync, timebase and shutdown
//! slots may be replaced. Realtime slots are swapped through a lock-free
//! command queue that the process thread drains at the start of a cycle.
//! Replaced closures travel back on a second queue so they are dropped on the
//! client thread, not the realtime one.
//!
//! Every invocation goes through [`bridge`]: a panic inside a callback is
//! caught, reported, and turned into the slot's neutral result instead of
//! unwinding into the server.

pub(crate) mod bridge;
mod table;

use std::fmt;

use crate::context::CallbackRole;
use crate::error::Status;
use crate::metadata::PropertyChange;
use crate::port::Port;
use crate::process::ProcessScope;
use crate::transport::{TransportPosition, TransportState};
use crate::types::{Frames, Uuid};

pub use table::{CallbackTable, Handlers, NotificationHandlers, RealtimeHandlers};
pub(crate) use table::RealtimeCommand;

/// Return value of callbacks that may ask never to be called again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Control {
    #[default]
    Continue,
    /// Disable this callback permanently
    Stop,
}

impl Control {
    pub fn is_stop(self) -> bool {
        self == Control::Stop
    }
}

/// Identifies a callback slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallbackKind {
    Process,
    Shutdown,
    BufferSize,
    SampleRate,
    ClientRegistration,
    PortRegistration,
    PortConnect,
    PortRename,
    GraphOrder,
    Xrun,
    Freewheel,
    Sync,
    Timebase,
    PropertyChange,
}

impl CallbackKind {
    pub const ALL: [CallbackKind; 14] = [
        CallbackKind::Process,
        CallbackKind::Shutdown,
        CallbackKind::BufferSize,
        CallbackKind::SampleRate,
        CallbackKind::ClientRegistration,
        CallbackKind::PortRegistration,
        CallbackKind::PortConnect,
        CallbackKind::PortRename,
        CallbackKind::GraphOrder,
        CallbackKind::Xrun,
        CallbackKind::Freewheel,
        CallbackKind::Sync,
        CallbackKind::Timebase,
        CallbackKind::PropertyChange,
    ];

    pub fn name(self) -> &'static str {
        match self {
            CallbackKind::Process => "process",
            CallbackKind::Shutdown => "shutdown",
            CallbackKind::BufferSize => "buffer size",
            CallbackKind::SampleRate => "sample rate",
            CallbackKind::ClientRegistration => "client registration",
            CallbackKind::PortRegistration => "port registration",
            CallbackKind::PortConnect => "port connect",
            CallbackKind::PortRename => "port rename",
            CallbackKind::GraphOrder => "graph order",
            CallbackKind::Xrun => "xrun",
            CallbackKind::Freewheel => "freewheel",
            CallbackKind::Sync => "sync",
            CallbackKind::Timebase => "timebase",
            CallbackKind::PropertyChange => "property change",
        }
    }

    /// Slots that can still be replaced after activation
    pub fn settable_while_active(self) -> bool {
        matches!(
            self,
            CallbackKind::Process
                | CallbackKind::Shutdown
                | CallbackKind::Sync
                | CallbackKind::Timebase
        )
    }

    /// Slots invoked on the process thread
    pub fn is_realtime(self) -> bool {
        matches!(
            self,
            CallbackKind::Process
                | CallbackKind::BufferSize
                | CallbackKind::Sync
                | CallbackKind::Timebase
        )
    }

    /// Restriction applied while the callback runs
    ///
    /// Shutdown counts as realtime: it may fire from a signal-like context
    /// with the server side locked.
    pub fn role(self) -> CallbackRole {
        if self.is_realtime() || self == CallbackKind::Shutdown {
            CallbackRole::Realtime
        } else {
            CallbackRole::Notification
        }
    }
}

impl fmt::Display for CallbackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Delivery policy for port notifications whose port vanished first
///
/// A port can be unregistered between the moment the server queues a
/// notification and the moment it is delivered. With `OnlyAvailable` such
/// notifications are skipped; with `IncludeVanished` the callback receives
/// `None` for the missing port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PortAvailability {
    #[default]
    OnlyAvailable,
    IncludeVanished,
}

pub type ProcessFn = Box<dyn FnMut(&ProcessScope) -> Control + Send>;
pub type ShutdownFn = Box<dyn FnMut(Status, &str) + Send>;
pub type BufferSizeFn = Box<dyn FnMut(Frames) -> Control + Send>;
pub type SampleRateFn = Box<dyn FnMut(Frames) -> Control + Send>;
pub type ClientRegistrationFn = Box<dyn FnMut(&str, bool) + Send>;
pub type PortRegistrationFn = Box<dyn FnMut(Option<Port>, bool) + Send>;
pub type PortConnectFn = Box<dyn FnMut(Option<Port>, Option<Port>, bool) + Send>;
pub type PortRenameFn = Box<dyn FnMut(Option<Port>, &str, &str) -> Control + Send>;
pub type GraphOrderFn = Box<dyn FnMut() -> Control + Send>;
/// Receives the delay in microseconds reported for the overrun
pub type XrunFn = Box<dyn FnMut(f32) -> Control + Send>;
pub type FreewheelFn = Box<dyn FnMut(bool) + Send>;
/// Returns true when the client is ready to roll at the given position
pub type SyncFn = Box<dyn FnMut(TransportState, &TransportPosition) -> bool + Send>;
/// Receives state, cycle length, the position to fill in and whether it is new
pub type TimebaseFn = Box<dyn FnMut(TransportState, Frames, &mut TransportPosition, bool) + Send>;
pub type PropertyChangeFn = Box<dyn FnMut(Uuid, &str, PropertyChange) + Send>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_settable_slots() {
        let settable: Vec<_> = CallbackKind::ALL
            .iter()
            .filter(|kind| kind.settable_while_active())
            .collect();
        assert_eq!(
            settable,
            vec![
                &CallbackKind::Process,
                &CallbackKind::Shutdown,
                &CallbackKind::Sync,
                &CallbackKind::Timebase
            ]
        );
    }

    #[test]
    fn test_roles() {
        assert_eq!(CallbackKind::Process.role(), CallbackRole::Realtime);
        assert_eq!(CallbackKind::Shutdown.role(), CallbackRole::Realtime);
        assert_eq!(CallbackKind::GraphOrder.role(), CallbackRole::Notification);
        assert_eq!(CallbackKind::PortRename.role(), CallbackRole::Notification);
    }

    #[test]
    fn test_names_unique() {
        let mut names: Vec<_> = CallbackKind::ALL.iter().map(|k| k.name()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), CallbackKind::ALL.len());
    }
}
