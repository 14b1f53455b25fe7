//! Queued server notifications and their delivery
//!
//! The server queues notifications with bare port ids. They are resolved to
//! [`Port`] values only when the notification thread delivers them, so a
//! port that was unregistered in the meantime comes out as `None`, exactly
//! the race a remote server exhibits.

use crate::callbacks::NotificationHandlers;
use crate::metadata::PropertyChange;
use crate::port::Port;
use crate::types::{Frames, PortId, Uuid};

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Notification {
    ClientRegistration { name: String, registered: bool },
    PortRegistration { port: PortId, registered: bool },
    PortConnect { a: PortId, b: PortId, connected: bool },
    PortRename { port: PortId, old: String, new: String },
    GraphOrder,
    Xrun { delayed_usecs: f32 },
    Freewheel { starting: bool },
    SampleRate { rate: Frames },
    PropertyChange { subject: Uuid, key: String, change: PropertyChange },
}

/// A notification with its ports resolved for one client
#[derive(Debug)]
pub(crate) enum Event {
    ClientRegistration { name: String, registered: bool },
    PortRegistration { port: Option<Port>, registered: bool },
    PortConnect { a: Option<Port>, b: Option<Port>, connected: bool },
    PortRename { port: Option<Port>, old: String, new: String },
    GraphOrder,
    Xrun { delayed_usecs: f32 },
    Freewheel { starting: bool },
    SampleRate { rate: Frames },
    PropertyChange { subject: Uuid, key: String, change: PropertyChange },
}

impl Notification {
    /// Resolve port ids through `lookup`
    pub(crate) fn resolve(self, mut lookup: impl FnMut(PortId) -> Option<Port>) -> Event {
        match self {
            Notification::ClientRegistration { name, registered } => {
                Event::ClientRegistration { name, registered }
            }
            Notification::PortRegistration { port, registered } => Event::PortRegistration {
                port: lookup(port),
                registered,
            },
            Notification::PortConnect { a, b, connected } => Event::PortConnect {
                a: lookup(a),
                b: lookup(b),
                connected,
            },
            Notification::PortRename { port, old, new } => Event::PortRename {
                port: lookup(port),
                old,
                new,
            },
            Notification::GraphOrder => Event::GraphOrder,
            Notification::Xrun { delayed_usecs } => Event::Xrun { delayed_usecs },
            Notification::Freewheel { starting } => Event::Freewheel { starting },
            Notification::SampleRate { rate } => Event::SampleRate { rate },
            Notification::PropertyChange {
                subject,
                key,
                change,
            } => Event::PropertyChange {
                subject,
                key,
                change,
            },
        }
    }
}

impl Event {
    pub(crate) fn deliver(self, handlers: &mut NotificationHandlers) {
        match self {
            Event::ClientRegistration { name, registered } => {
                handlers.client_registration(&name, registered)
            }
            Event::PortRegistration { port, registered } => {
                handlers.port_registration(port, registered)
            }
            Event::PortConnect { a, b, connected } => handlers.port_connect(a, b, connected),
            Event::PortRename { port, old, new } => {
                handlers.port_rename(port, &old, &new);
            }
            Event::GraphOrder => {
                handlers.graph_order();
            }
            Event::Xrun { delayed_usecs } => {
                handlers.xrun(delayed_usecs);
            }
            Event::Freewheel { starting } => handlers.freewheel(starting),
            Event::SampleRate { rate } => {
                handlers.sample_rate(rate);
            }
            Event::PropertyChange {
                subject,
                key,
                change,
            } => handlers.property_change(subject, &key, change),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vanished_port_resolves_to_none() {
        let note = Notification::PortConnect {
            a: PortId(1),
            b: PortId(2),
            connected: false,
        };
        let event = note.resolve(|_| None);
        assert!(matches!(
            event,
            Event::PortConnect {
                a: None,
                b: None,
                connected: false
            }
        ));
    }
}
