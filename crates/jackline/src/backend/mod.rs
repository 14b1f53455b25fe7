//! Server backends
//!
//! [`Client`](crate::Client) talks to a server only through the [`Backend`]
//! trait. Two implementations exist:
//!
//! - **loopback**: an in-process server with a deterministic cycle driver,
//!   used for tests and for hosting several clients inside one program
//! - **jack** (feature `jack-backend`): a native server connection through
//!   the `jack` crate
//!
//! A [`Connector`] opens one client connection and returns the backend for
//! it, together with the open status the server reported.

pub mod loopback;

#[cfg(feature = "jack-backend")]
pub mod jack;

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::callbacks::Handlers;
use crate::client::ClientOptions;
use crate::error::{Error, Result, Status};
use crate::metadata::{Description, Property};
use crate::port::{Port, PortFilter};
use crate::transport::TransportControl;
use crate::types::{Frames, PortFlags, PortKind, Time, Uuid};

/// Opens client connections to a server
pub trait Connector {
    /// Open a client; on failure the status describes why
    fn open(&self, name: &str, options: &ClientOptions) -> std::result::Result<(Box<dyn Backend>, Status), Status>;
}

/// Activation failed; the handlers are returned untouched
pub struct ActivationError {
    pub error: Error,
    pub handlers: Handlers,
}

impl std::fmt::Debug for ActivationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivationError")
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

/// One open client connection
///
/// Every method except those on the transport handle is a server
/// administrative call and may block.
pub trait Backend: Send {
    /// Actual client name (may differ from the requested one)
    fn name(&self) -> &str;
    fn uuid(&self) -> Result<Uuid>;

    fn sample_rate(&self) -> Frames;
    fn buffer_size(&self) -> Frames;
    fn set_buffer_size(&mut self, nframes: Frames) -> Result<()>;
    fn is_realtime(&self) -> bool;
    /// DSP load in percent
    fn cpu_load(&self) -> f32;
    fn frame_time(&self) -> Frames;
    fn frames_since_cycle_start(&self) -> Frames;
    fn last_frame_time(&self) -> Frames;

    fn activate(&mut self, handlers: Handlers) -> std::result::Result<(), ActivationError>;
    /// Stop processing and give the handlers back
    fn deactivate(&mut self) -> Result<Handlers>;
    /// Release the connection; the backend must be inactive
    fn close(&mut self) -> Result<()>;

    fn register_port(&mut self, short_name: &str, kind: PortKind, flags: PortFlags) -> Result<Port>;
    fn unregister_port(&mut self, port: &Port) -> Result<()>;
    /// Returns the new full name
    fn rename_port(&mut self, port: &Port, short_name: &str) -> Result<String>;
    fn port_aliases(&self, port: &Port) -> Result<Vec<String>>;
    fn set_port_alias(&mut self, port: &Port, alias: &str) -> Result<()>;
    fn unset_port_alias(&mut self, port: &Port, alias: &str) -> Result<()>;
    fn request_monitor(&mut self, port: &Port, on: bool) -> Result<()>;
    /// True while at least one monitor request is outstanding
    fn monitoring(&self, port: &Port) -> Result<bool>;
    fn port_by_name(&self, name: &str) -> Option<Port>;
    fn ports(&self, filter: &PortFilter) -> Result<Vec<Port>>;

    fn connect(&mut self, source: &str, destination: &str) -> Result<()>;
    fn disconnect(&mut self, source: &str, destination: &str) -> Result<()>;
    fn disconnect_all(&mut self, port: &Port) -> Result<()>;
    /// Full names of the ports connected to `port`
    fn connections(&self, port: &Port) -> Result<Vec<String>>;

    fn set_freewheel(&mut self, on: bool) -> Result<()>;
    fn set_sync_timeout(&mut self, usecs: Time) -> Result<()>;
    /// Declare whether this client takes part in slow-sync
    fn set_slow_sync(&mut self, enabled: bool) -> Result<()>;
    /// Become timebase master; `Ok(false)` if conditional and another client holds the role
    fn acquire_timebase(&mut self, conditional: bool) -> Result<bool>;
    fn release_timebase(&mut self) -> Result<()>;
    fn transport(&self) -> Arc<dyn TransportControl>;

    fn uuid_for_client_name(&self, name: &str) -> Result<Uuid>;
    fn client_name_by_uuid(&self, uuid: Uuid) -> Result<String>;
    fn client_pid(&self, name: &str) -> Option<u32>;

    fn set_property(&mut self, subject: Uuid, key: &str, property: Property) -> Result<()>;
    fn property(&self, subject: Uuid, key: &str) -> Result<Option<Property>>;
    fn properties(&self, subject: Uuid) -> Result<Description>;
    fn all_properties(&self) -> Result<BTreeMap<Uuid, Description>>;
    fn remove_property(&mut self, subject: Uuid, key: &str) -> Result<()>;
    fn remove_properties(&mut self, subject: Uuid) -> Result<usize>;
    fn remove_all_properties(&mut self) -> Result<()>;
}
