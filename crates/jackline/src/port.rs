//! Port descriptors, the per-client port registry and port queries
//!
//! A [`Port`] is a plain value: name, kind, flags and whether the client
//! that holds it owns it. Only owned ports can be read or written in the
//! process callback; external ports are for connecting and inspection.

use std::fmt;

use regex::Regex;

use crate::types::{Direction, PortFlags, PortId, PortKind, Uuid};

/// Whether a [`Port`] belongs to the client holding it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Ownership {
    Owned,
    External,
}

/// Snapshot of a port's identity and attributes
#[derive(Debug, Clone)]
pub struct Port {
    id: PortId,
    name: String,
    kind: PortKind,
    flags: PortFlags,
    uuid: Uuid,
    ownership: Ownership,
}

impl Port {
    pub(crate) fn new(
        id: PortId,
        name: String,
        kind: PortKind,
        flags: PortFlags,
        uuid: Uuid,
        ownership: Ownership,
    ) -> Self {
        Port {
            id,
            name,
            kind,
            flags,
            uuid,
            ownership,
        }
    }

    pub fn id(&self) -> PortId {
        self.id
    }

    /// Full name, "client:port"
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name without the client prefix
    pub fn short_name(&self) -> &str {
        self.name
            .split_once(':')
            .map_or(self.name.as_str(), |(_, short)| short)
    }

    pub fn client_name(&self) -> &str {
        self.name
            .split_once(':')
            .map_or("", |(client, _)| client)
    }

    pub fn kind(&self) -> PortKind {
        self.kind
    }

    pub fn type_tag(&self) -> &'static str {
        self.kind.type_tag()
    }

    pub fn is_audio(&self) -> bool {
        self.kind == PortKind::Audio
    }

    pub fn is_midi(&self) -> bool {
        self.kind == PortKind::Midi
    }

    pub fn flags(&self) -> PortFlags {
        self.flags
    }

    /// Inputs and outputs always have exactly one direction flag
    pub fn direction(&self) -> Direction {
        self.flags.direction().unwrap_or(Direction::Input)
    }

    pub fn is_input(&self) -> bool {
        self.flags.contains(PortFlags::IS_INPUT)
    }

    pub fn is_output(&self) -> bool {
        self.flags.contains(PortFlags::IS_OUTPUT)
    }

    pub fn is_physical(&self) -> bool {
        self.flags.contains(PortFlags::IS_PHYSICAL)
    }

    pub fn can_monitor(&self) -> bool {
        self.flags.contains(PortFlags::CAN_MONITOR)
    }

    pub fn is_terminal(&self) -> bool {
        self.flags.contains(PortFlags::IS_TERMINAL)
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn ownership(&self) -> Ownership {
        self.ownership
    }

    pub fn is_owned(&self) -> bool {
        self.ownership == Ownership::Owned
    }

    pub(crate) fn set_name(&mut self, name: String) {
        self.name = name;
    }

    pub(crate) fn with_ownership(mut self, ownership: Ownership) -> Self {
        self.ownership = ownership;
        self
    }
}

/// Ports are the same port when the server handle matches
impl PartialEq for Port {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Port {}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Registry of owned ports
// ═══════════════════════════════════════════════════════════════════════════════

/// The ports a client has registered, kept in four lists by kind and direction
#[derive(Debug, Default)]
pub struct PortRegistry {
    audio_in: Vec<Port>,
    audio_out: Vec<Port>,
    midi_in: Vec<Port>,
    midi_out: Vec<Port>,
}

impl PortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn list(&self, kind: PortKind, direction: Direction) -> &[Port] {
        match (kind, direction) {
            (PortKind::Audio, Direction::Input) => &self.audio_in,
            (PortKind::Audio, Direction::Output) => &self.audio_out,
            (PortKind::Midi, Direction::Input) => &self.midi_in,
            (PortKind::Midi, Direction::Output) => &self.midi_out,
        }
    }

    fn list_mut(&mut self, kind: PortKind, direction: Direction) -> &mut Vec<Port> {
        match (kind, direction) {
            (PortKind::Audio, Direction::Input) => &mut self.audio_in,
            (PortKind::Audio, Direction::Output) => &mut self.audio_out,
            (PortKind::Midi, Direction::Input) => &mut self.midi_in,
            (PortKind::Midi, Direction::Output) => &mut self.midi_out,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Port> {
        self.audio_in
            .iter()
            .chain(&self.audio_out)
            .chain(&self.midi_in)
            .chain(&self.midi_out)
    }

    pub fn len(&self) -> usize {
        self.audio_in.len() + self.audio_out.len() + self.midi_in.len() + self.midi_out.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True if any owned port already uses this short name
    pub fn contains_short_name(&self, short_name: &str) -> bool {
        self.iter().any(|port| port.short_name() == short_name)
    }

    pub fn find(&self, id: PortId) -> Option<&Port> {
        self.iter().find(|port| port.id() == id)
    }

    pub fn find_by_name(&self, name: &str) -> Option<&Port> {
        self.iter()
            .find(|port| port.name() == name || port.short_name() == name)
    }

    pub fn contains(&self, port: &Port) -> bool {
        self.find(port.id()).is_some()
    }

    pub(crate) fn insert(&mut self, port: Port) {
        self.list_mut(port.kind(), port.direction()).push(port);
    }

    /// Remove `port` from the list matching its kind and direction
    pub(crate) fn remove(&mut self, port: &Port) -> Option<Port> {
        let list = self.list_mut(port.kind(), port.direction());
        let index = list.iter().position(|p| p.id() == port.id())?;
        Some(list.remove(index))
    }

    pub(crate) fn rename(&mut self, id: PortId, full_name: &str) {
        for list in [
            &mut self.audio_in,
            &mut self.audio_out,
            &mut self.midi_in,
            &mut self.midi_out,
        ] {
            if let Some(port) = list.iter_mut().find(|p| p.id() == id) {
                port.set_name(full_name.to_string());
            }
        }
    }

    pub(crate) fn drain(&mut self) -> Vec<Port> {
        let mut all = Vec::with_capacity(self.len());
        all.append(&mut self.audio_in);
        all.append(&mut self.audio_out);
        all.append(&mut self.midi_in);
        all.append(&mut self.midi_out);
        all
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Port queries
// ═══════════════════════════════════════════════════════════════════════════════

/// Filter for [`Client::ports`](crate::Client::ports)
///
/// The name pattern is a regular expression searched anywhere in the full
/// port name. Every requested flag must be present on a matching port.
#[derive(Debug, Clone, Default)]
pub struct PortFilter {
    name_pattern: Option<String>,
    kind: Option<PortKind>,
    flags: PortFlags,
}

impl PortFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.name_pattern = Some(pattern.into());
        self
    }

    pub fn kind(mut self, kind: PortKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn audio(self) -> Self {
        self.kind(PortKind::Audio)
    }

    pub fn midi(self) -> Self {
        self.kind(PortKind::Midi)
    }

    pub fn flags(mut self, flags: PortFlags) -> Self {
        self.flags |= flags;
        self
    }

    pub fn inputs(self) -> Self {
        self.flags(PortFlags::IS_INPUT)
    }

    pub fn outputs(self) -> Self {
        self.flags(PortFlags::IS_OUTPUT)
    }

    pub fn physical(self) -> Self {
        self.flags(PortFlags::IS_PHYSICAL)
    }

    pub fn pattern(&self) -> Option<&str> {
        self.name_pattern.as_deref()
    }

    pub fn port_kind(&self) -> Option<PortKind> {
        self.kind
    }

    pub fn required_flags(&self) -> PortFlags {
        self.flags
    }

    /// Compile into a matcher; fails on an invalid pattern
    pub fn compile(&self) -> Result<PortMatcher, regex::Error> {
        let pattern = match self.name_pattern.as_deref() {
            Some(p) if !p.is_empty() => Some(Regex::new(p)?),
            _ => None,
        };
        Ok(PortMatcher {
            pattern,
            kind: self.kind,
            flags: self.flags,
        })
    }
}

/// Compiled form of a [`PortFilter`]
#[derive(Debug, Clone)]
pub struct PortMatcher {
    pattern: Option<Regex>,
    kind: Option<PortKind>,
    flags: PortFlags,
}

impl PortMatcher {
    pub fn matches(&self, name: &str, kind: PortKind, flags: PortFlags) -> bool {
        self.kind.map_or(true, |k| k == kind)
            && flags.contains(self.flags)
            && self.pattern.as_ref().map_or(true, |re| re.is_match(name))
    }
}
