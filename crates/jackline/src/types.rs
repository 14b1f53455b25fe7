//! Core value types shared across the client, backends and the process path

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};
use std::str::FromStr;

use crate::error::Error;

/// Frame count or frame position (sample-accurate time)
pub type Frames = u32;

/// Microsecond timestamp on the server's monotonic clock
pub type Time = u64;

/// Type tag the server uses for 32-bit float mono audio ports
pub const AUDIO_TYPE: &str = "32 bit float mono audio";

/// Type tag the server uses for raw MIDI ports
pub const MIDI_TYPE: &str = "8 bit raw midi";

/// Maximum client name size, including the terminating NUL of the C API
pub const CLIENT_NAME_SIZE: usize = 64;

/// Maximum full port name size ("client:port"), including the terminating NUL
pub const PORT_NAME_SIZE: usize = 256;

/// Maximum number of aliases a port can carry
pub const MAX_PORT_ALIASES: usize = 2;

/// Longest usable client name
pub fn client_name_size() -> usize {
    CLIENT_NAME_SIZE - 1
}

/// Longest usable full port name
pub fn port_name_size() -> usize {
    PORT_NAME_SIZE - 1
}

// ═══════════════════════════════════════════════════════════════════════════════
// Identifiers
// ═══════════════════════════════════════════════════════════════════════════════

/// 64-bit server-unique identifier of a client or port
///
/// Printed and parsed as an unsigned decimal, which is the textual form
/// metadata tools exchange. Zero is the "empty" UUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Uuid(pub u64);

impl Uuid {
    pub const EMPTY: Uuid = Uuid(0);

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Uuid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u64>()
            .map(Uuid)
            .map_err(|_| Error::InvalidUuid(s.to_string()))
    }
}

/// Server-side port handle, stable for the lifetime of the port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortId(pub u32);

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Port classification
// ═══════════════════════════════════════════════════════════════════════════════

/// Data carried by a port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortKind {
    /// One channel of 32-bit float samples
    Audio,
    /// Time-stamped raw MIDI events
    Midi,
}

impl PortKind {
    /// Server type tag for this kind
    pub fn type_tag(self) -> &'static str {
        match self {
            PortKind::Audio => AUDIO_TYPE,
            PortKind::Midi => MIDI_TYPE,
        }
    }

    /// Map a server type tag back to a kind; unknown tags yield `None`
    pub fn from_type_tag(tag: &str) -> Option<Self> {
        match tag {
            AUDIO_TYPE => Some(PortKind::Audio),
            MIDI_TYPE => Some(PortKind::Midi),
            _ => None,
        }
    }
}

impl fmt::Display for PortKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PortKind::Audio => "audio",
            PortKind::Midi => "midi",
        })
    }
}

/// Data flow direction of a port, from the owning client's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Receives data (a connection destination)
    Input,
    /// Produces data (a connection source)
    Output,
}

impl Direction {
    pub fn flag(self) -> PortFlags {
        match self {
            Direction::Input => PortFlags::IS_INPUT,
            Direction::Output => PortFlags::IS_OUTPUT,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Direction::Input => "input",
            Direction::Output => "output",
        })
    }
}

/// Port flag bits, numerically identical to the server's
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PortFlags(u32);

impl PortFlags {
    pub const IS_INPUT: PortFlags = PortFlags(0x1);
    pub const IS_OUTPUT: PortFlags = PortFlags(0x2);
    pub const IS_PHYSICAL: PortFlags = PortFlags(0x4);
    pub const CAN_MONITOR: PortFlags = PortFlags(0x8);
    pub const IS_TERMINAL: PortFlags = PortFlags(0x10);

    pub const fn empty() -> Self {
        PortFlags(0)
    }

    pub const fn from_bits(bits: u32) -> Self {
        PortFlags(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    /// True when every bit of `other` is set in `self`
    pub const fn contains(self, other: PortFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Direction encoded in the flags, if exactly one of input/output is set
    pub fn direction(self) -> Option<Direction> {
        match (self.contains(Self::IS_INPUT), self.contains(Self::IS_OUTPUT)) {
            (true, false) => Some(Direction::Input),
            (false, true) => Some(Direction::Output),
            _ => None,
        }
    }
}

impl BitOr for PortFlags {
    type Output = PortFlags;

    fn bitor(self, rhs: PortFlags) -> PortFlags {
        PortFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for PortFlags {
    fn bitor_assign(&mut self, rhs: PortFlags) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for PortFlags {
    type Output = PortFlags;

    fn bitand(self, rhs: PortFlags) -> PortFlags {
        PortFlags(self.0 & rhs.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_tags() {
        assert_eq!(PortKind::from_type_tag(AUDIO_TYPE), Some(PortKind::Audio));
        assert_eq!(PortKind::from_type_tag("8 bit raw midi"), Some(PortKind::Midi));
        assert_eq!(PortKind::from_type_tag("video"), None);
    }

    #[test]
    fn test_flag_direction() {
        let flags = PortFlags::IS_OUTPUT | PortFlags::IS_PHYSICAL;
        assert_eq!(flags.direction(), Some(Direction::Output));
        assert!(flags.contains(PortFlags::IS_PHYSICAL));
        assert!(!flags.contains(PortFlags::IS_TERMINAL));
        assert_eq!((PortFlags::IS_INPUT | PortFlags::IS_OUTPUT).direction(), None);
        assert_eq!(PortFlags::empty().direction(), None);
    }

    #[test]
    fn test_uuid_text_form() {
        let uuid: Uuid = "4294967301".parse().unwrap();
        assert_eq!(uuid, Uuid(4294967301));
        assert_eq!(uuid.to_string(), "4294967301");
        assert!("not-a-uuid".parse::<Uuid>().is_err());
        assert!(Uuid::EMPTY.is_empty());
    }

    #[test]
    fn test_name_sizes_exclude_nul() {
        assert_eq!(client_name_size(), 63);
        assert_eq!(port_name_size(), 255);
    }
}
