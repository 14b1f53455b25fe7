//! Key/value metadata attached to client and port UUIDs
//!
//! Keys are URIs. The well-known keys below are understood by patchbays and
//! session managers; applications may use any URI of their own.

use std::collections::BTreeMap;

use crate::types::Uuid;

pub const PRETTY_NAME: &str = "http://jackaudio.org/metadata/pretty-name";
pub const HARDWARE: &str = "http://jackaudio.org/metadata/hardware";
pub const CONNECTED: &str = "http://jackaudio.org/metadata/connected";
pub const EVENT_TYPES: &str = "http://jackaudio.org/metadata/event-types";
pub const ICON_LARGE: &str = "http://jackaudio.org/metadata/icon-large";
pub const ICON_SMALL: &str = "http://jackaudio.org/metadata/icon-small";
pub const ICON_NAME: &str = "http://jackaudio.org/metadata/icon-name";
pub const ORDER: &str = "http://jackaudio.org/metadata/order";
pub const PORT_GROUP: &str = "http://jackaudio.org/metadata/port-group";
pub const SIGNAL_TYPE: &str = "http://jackaudio.org/metadata/signal-type";

/// What happened to a property
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropertyChange {
    Created,
    Changed,
    Deleted,
}

impl PropertyChange {
    pub fn code(self) -> u32 {
        match self {
            PropertyChange::Created => 0,
            PropertyChange::Changed => 1,
            PropertyChange::Deleted => 2,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(PropertyChange::Created),
            1 => Some(PropertyChange::Changed),
            2 => Some(PropertyChange::Deleted),
            _ => None,
        }
    }
}

/// Property value with its MIME type (empty type means UTF-8 text)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Property {
    pub value: Vec<u8>,
    pub mime_type: String,
}

impl Property {
    pub fn text(value: &str) -> Self {
        Property {
            value: value.as_bytes().to_vec(),
            mime_type: String::new(),
        }
    }

    /// Value as text, if it is plain text and valid UTF-8
    pub fn as_text(&self) -> Option<&str> {
        if self.mime_type.is_empty() || self.mime_type.starts_with("text/") {
            std::str::from_utf8(&self.value).ok()
        } else {
            None
        }
    }
}

/// All properties of one subject, keyed by URI
pub type Description = BTreeMap<String, Property>;

/// In-memory property database
#[derive(Debug, Default)]
pub struct PropertyStore {
    subjects: BTreeMap<Uuid, Description>,
}

impl PropertyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a property and report which of the two happened
    pub fn set(&mut self, subject: Uuid, key: &str, property: Property) -> PropertyChange {
        match self
            .subjects
            .entry(subject)
            .or_default()
            .insert(key.to_string(), property)
        {
            Some(_) => PropertyChange::Changed,
            None => PropertyChange::Created,
        }
    }

    pub fn get(&self, subject: Uuid, key: &str) -> Option<&Property> {
        self.subjects.get(&subject).and_then(|props| props.get(key))
    }

    pub fn description(&self, subject: Uuid) -> Description {
        self.subjects.get(&subject).cloned().unwrap_or_default()
    }

    pub fn all(&self) -> BTreeMap<Uuid, Description> {
        self.subjects.clone()
    }

    /// Remove one property; false if it did not exist
    pub fn remove(&mut self, subject: Uuid, key: &str) -> bool {
        let Some(props) = self.subjects.get_mut(&subject) else {
            return false;
        };
        let removed = props.remove(key).is_some();
        if props.is_empty() {
            self.subjects.remove(&subject);
        }
        removed
    }

    /// Remove every property of `subject`; returns how many were removed
    pub fn remove_subject(&mut self, subject: Uuid) -> usize {
        self.subjects
            .remove(&subject)
            .map_or(0, |props| props.len())
    }

    pub fn clear(&mut self) {
        self.subjects.clear();
    }
}
