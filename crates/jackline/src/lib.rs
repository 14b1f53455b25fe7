//! Jackline - client-side binding for a JACK-style audio server
//!
//! ```text
//!  ┌──────────────────────────── Client ────────────────────────────┐
//!  │ ports (PortRegistry)   callbacks (CallbackTable)   Transport   │
//!  └───────────────┬────────────────────────────────────────────────┘
//!                  │ Backend trait
//!       ┌──────────┴──────────┐
//!       ▼                     ▼
//!  LoopbackServer        JackConnector (feature "jack-backend")
//!  in-process server     native server via the jack crate
//! ```
//!
//! A [`Client`] registers [`Port`]s, installs callbacks and is then
//! activated. The process callback runs once per cycle on the realtime
//! thread and reaches its port buffers through a [`ProcessScope`]; all
//! other notifications arrive on a separate notification thread.
//!
//! The [`LoopbackServer`] hosts any number of clients inside one process and
//! drives cycles on demand, so complete graphs can be exercised without an
//! audio device.

pub mod backend;
pub mod callbacks;
pub mod client;
pub mod config;
pub mod context;
pub mod diagnostics;
pub mod error;
pub mod metadata;
pub mod midi;
pub mod port;
pub mod process;
pub mod ringbuffer;
pub mod timebase;
pub mod transport;
pub mod types;

pub use backend::loopback::{CycleReport, LoopbackDriver, LoopbackServer};
pub use backend::{Backend, Connector};
pub use callbacks::{Control, PortAvailability};
pub use client::{Client, ClientOptions};
pub use config::{ClientConfig, LoopbackConfig};
pub use error::{Error, Result, Status, ViolationKind};
pub use metadata::{Property, PropertyChange};
pub use midi::{MidiBuffer, MidiWriter, RawMidi};
pub use port::{Port, PortFilter};
pub use process::ProcessScope;
pub use ringbuffer::{RingBuffer, RingReader, RingWriter};
pub use timebase::TimebaseMaster;
pub use transport::{Bbt, PositionBits, Transport, TransportPosition, TransportState};
pub use types::*;
