//! Error and status types

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use thiserror::Error;

use crate::callbacks::CallbackKind;
use crate::types::{Direction, Frames, PortKind};

/// errno value the server reports for a connection that already exists
pub const EEXIST: i32 = 17;

/// errno value the server reports for a busy resource (e.g. timebase role)
pub const EBUSY: i32 = 16;

/// errno value for invalid arguments
pub const EINVAL: i32 = 22;

// ═══════════════════════════════════════════════════════════════════════════════
// Open status
// ═══════════════════════════════════════════════════════════════════════════════

/// Bit set describing the outcome of opening a client
///
/// Values match the server's status word so they can be passed through
/// from a native connection unchanged. A status may be non-empty on success
/// (e.g. [`Status::NAME_NOT_UNIQUE`] when the server picked a new name).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Status(u32);

impl Status {
    pub const FAILURE: Status = Status(0x01);
    pub const INVALID_OPTION: Status = Status(0x02);
    pub const NAME_NOT_UNIQUE: Status = Status(0x04);
    pub const SERVER_STARTED: Status = Status(0x08);
    pub const SERVER_FAILED: Status = Status(0x10);
    pub const SERVER_ERROR: Status = Status(0x20);
    pub const NO_SUCH_CLIENT: Status = Status(0x40);
    pub const LOAD_FAILURE: Status = Status(0x80);
    pub const INIT_FAILURE: Status = Status(0x100);
    pub const SHM_FAILURE: Status = Status(0x200);
    pub const VERSION_ERROR: Status = Status(0x400);
    pub const BACKEND_ERROR: Status = Status(0x800);
    pub const CLIENT_ZOMBIE: Status = Status(0x1000);

    const NAMES: [(Status, &'static str); 13] = [
        (Status::FAILURE, "failure"),
        (Status::INVALID_OPTION, "invalid option"),
        (Status::NAME_NOT_UNIQUE, "name not unique"),
        (Status::SERVER_STARTED, "server started"),
        (Status::SERVER_FAILED, "server failed"),
        (Status::SERVER_ERROR, "server error"),
        (Status::NO_SUCH_CLIENT, "no such client"),
        (Status::LOAD_FAILURE, "load failure"),
        (Status::INIT_FAILURE, "init failure"),
        (Status::SHM_FAILURE, "shm failure"),
        (Status::VERSION_ERROR, "version error"),
        (Status::BACKEND_ERROR, "backend error"),
        (Status::CLIENT_ZOMBIE, "client zombie"),
    ];

    pub const fn empty() -> Self {
        Status(0)
    }

    pub const fn from_bits(bits: u32) -> Self {
        Status(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Status) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn failure(self) -> bool {
        self.contains(Self::FAILURE)
    }

    pub fn invalid_option(self) -> bool {
        self.contains(Self::INVALID_OPTION)
    }

    pub fn name_not_unique(self) -> bool {
        self.contains(Self::NAME_NOT_UNIQUE)
    }

    pub fn server_started(self) -> bool {
        self.contains(Self::SERVER_STARTED)
    }

    pub fn server_failed(self) -> bool {
        self.contains(Self::SERVER_FAILED)
    }

    pub fn server_error(self) -> bool {
        self.contains(Self::SERVER_ERROR)
    }

    pub fn no_such_client(self) -> bool {
        self.contains(Self::NO_SUCH_CLIENT)
    }

    pub fn load_failure(self) -> bool {
        self.contains(Self::LOAD_FAILURE)
    }

    pub fn init_failure(self) -> bool {
        self.contains(Self::INIT_FAILURE)
    }

    pub fn shm_failure(self) -> bool {
        self.contains(Self::SHM_FAILURE)
    }

    pub fn version_error(self) -> bool {
        self.contains(Self::VERSION_ERROR)
    }

    pub fn backend_error(self) -> bool {
        self.contains(Self::BACKEND_ERROR)
    }

    pub fn client_zombie(self) -> bool {
        self.contains(Self::CLIENT_ZOMBIE)
    }

    /// Human-readable names of every set condition, in bit order
    pub fn conditions(self) -> impl Iterator<Item = &'static str> {
        Self::NAMES
            .into_iter()
            .filter(move |(flag, _)| self.contains(*flag))
            .map(|(_, name)| name)
    }
}

impl BitOr for Status {
    type Output = Status;

    fn bitor(self, rhs: Status) -> Status {
        Status(self.0 | rhs.0)
    }
}

impl BitOrAssign for Status {
    fn bitor_assign(&mut self, rhs: Status) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)?;
        let mut first = true;
        for name in self.conditions() {
            f.write_str(if first { ": " } else { ", " })?;
            f.write_str(name)?;
            first = false;
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Usage violations
// ═══════════════════════════════════════════════════════════════════════════════

/// Misuse of the API that is detected at runtime
///
/// All variants are allocation-free so they can be raised on the realtime
/// thread.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationKind {
    #[error("{0} callback cannot be set while the client is active")]
    RegisteredWhileActive(CallbackKind),

    #[error("server-administrative call made from inside a callback")]
    CallbackContext,

    #[error("client is closed")]
    ClientClosed,

    #[error("client is not active")]
    NotActive,

    #[error("port does not belong to this client")]
    NotOwned,

    #[error("expected a {expected} port")]
    WrongKind { expected: PortKind },

    #[error("expected an {expected} port")]
    WrongDirection { expected: Direction },

    #[error("port buffer is already borrowed in this cycle")]
    BufferBorrowed,

    #[error("MIDI output buffer must be cleared before writing in each cycle")]
    MidiNotCleared,

    #[error("MIDI event at frame {time} is earlier than the previous event at {last}")]
    MidiOutOfOrder { time: Frames, last: Frames },

    #[error("MIDI event at frame {time} is outside the {nframes}-frame cycle")]
    MidiTimeOutOfRange { time: Frames, nframes: Frames },

    #[error("MIDI event is not a normalized message")]
    MidiNotNormalized,

    #[error("MIDI event is empty")]
    EmptyMidiEvent,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error
// ═══════════════════════════════════════════════════════════════════════════════

/// Errors raised by client, port, transport and metadata operations
#[derive(Error, Debug)]
pub enum Error {
    /// The server refused to open the client
    #[error("cannot open client '{name}': {status}")]
    Open { name: String, status: Status },

    /// A server call failed with a numeric code
    #[error("{op} failed with error code {code}")]
    Operation { op: &'static str, code: i32 },

    #[error("connection {output} -> {input} already exists")]
    AlreadyExists { output: String, input: String },

    #[error("{output} is not connected to {input}")]
    NoSuchConnection { output: String, input: String },

    /// Ports exist but cannot be connected (type, direction or activity)
    #[error("cannot connect {output} -> {input}: {reason}")]
    InvalidConnection {
        output: String,
        input: String,
        reason: &'static str,
    },

    #[error("port not found: {0}")]
    PortNotFound(String),

    #[error("client not found: {0}")]
    ClientNotFound(String),

    #[error("name '{name}' exceeds the maximum length of {max}")]
    NameTooLong { name: String, max: usize },

    #[error("port name already in use: {0}")]
    DuplicatePortName(String),

    #[error("client is not the timebase master")]
    NotTimebaseMaster,

    /// Recoverable: the event may be written again in a later cycle
    #[error("MIDI buffer full: {requested} bytes requested, {available} available")]
    MidiBufferFull { requested: usize, available: usize },

    #[error("transport position snapshot kept changing during read")]
    TornRead,

    #[error("callback command queue is full")]
    CommandQueueFull,

    #[error("invalid UUID: {0}")]
    InvalidUuid(String),

    #[error("invalid port name pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    #[error(transparent)]
    Violation(#[from] ViolationKind),

    #[error("configuration error: {0}")]
    Config(#[from] anyhow::Error),
}

impl Error {
    /// Numeric server code associated with this error, when there is one
    pub fn code(&self) -> Option<i32> {
        match self {
            Error::Operation { code, .. } => Some(*code),
            Error::AlreadyExists { .. } => Some(EEXIST),
            Error::InvalidConnection { .. } => Some(EINVAL),
            Error::NotTimebaseMaster => Some(EINVAL),
            _ => None,
        }
    }

    /// True for failures that may succeed when retried later
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::MidiBufferFull { .. } | Error::CommandQueueFull)
    }

    pub fn is_violation(&self) -> bool {
        matches!(self, Error::Violation(_))
    }
}

/// Result type for client operations
pub type Result<T> = std::result::Result<T, Error>;
