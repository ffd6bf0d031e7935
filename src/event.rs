//! The trace event model (C1): a tagged union over the six PM event
//! kinds, with validation and a stable bug-identity hash.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::color::strip_color;

/// One frame of a captured call stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackFrame {
    pub function: String,
    pub file: String,
    pub line: u32,
}

impl StackFrame {
    fn strip_colors(&mut self) {
        self.function = strip_color(&self.function).into_owned();
        self.file = strip_color(&self.file).into_owned();
    }
}

/// The symbolic kind of an event, used both as the bug-identity
/// discriminant and as the wire tag in the serialized document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    Store,
    Flush,
    Fence,
    AssertPersisted,
    AssertOrdered,
    RequiredFlush,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Store => "STORE",
            Self::Flush => "FLUSH",
            Self::Fence => "FENCE",
            Self::AssertPersisted => "ASSERT_PERSISTED",
            Self::AssertOrdered => "ASSERT_ORDERED",
            Self::RequiredFlush => "REQUIRED_FLUSH",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "STORE" => Some(Self::Store),
            "FLUSH" => Some(Self::Flush),
            "FENCE" => Some(Self::Fence),
            "ASSERT_PERSISTED" => Some(Self::AssertPersisted),
            "ASSERT_ORDERED" => Some(Self::AssertOrdered),
            "REQUIRED_FLUSH" => Some(Self::RequiredFlush),
            _ => None,
        }
    }

    /// The three analyzer-reported kinds are bugs; store/flush/fence
    /// are plain memory traffic.
    pub fn is_bug_kind(self) -> bool {
        matches!(self, Self::AssertPersisted | Self::AssertOrdered | Self::RequiredFlush)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fields common to every event kind (shared part of I1's "common
/// fields" list).
#[derive(Debug, Clone, PartialEq)]
pub struct EventHeader {
    pub timestamp: u64,
    pub function: String,
    pub file: String,
    pub line: u32,
    pub stack: Vec<StackFrame>,
}

impl EventHeader {
    fn strip_colors(&mut self) {
        self.function = strip_color(&self.function).into_owned();
        self.file = strip_color(&self.file).into_owned();
        for frame in &mut self.stack {
            frame.strip_colors();
        }
    }
}

/// A validated trace event. Each variant carries only the fields I1
/// names for its kind; `is_bug` is never stored explicitly because
/// it's fully determined by the kind (see [`EventKind::is_bug_kind`]).
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Store { header: EventHeader, addr: u64, len: u64 },
    Flush { header: EventHeader, addr: u64, len: u64 },
    Fence { header: EventHeader },
    AssertPersisted { header: EventHeader, addr: u64, len: u64 },
    AssertOrdered { header: EventHeader, addr_a: u64, len_a: u64, addr_b: u64, len_b: u64 },
    RequiredFlush { header: EventHeader, addr: u64, len: u64 },
}

/// Failure constructing an [`Event`] from raw, possibly-untrusted
/// field data (I1/I2).
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("unknown event kind `{0}`")]
    UnknownKind(String),
    #[error("event kind {kind} requires field `{field}`")]
    MissingField { kind: &'static str, field: &'static str },
    #[error("range length must be >= 1 for event kind {kind}, got {len}")]
    ZeroLength { kind: &'static str, len: u64 },
    #[error("is_bug={is_bug} is inconsistent with event kind {kind}")]
    InconsistentIsBug { kind: &'static str, is_bug: bool },
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Store { .. } => EventKind::Store,
            Self::Flush { .. } => EventKind::Flush,
            Self::Fence { .. } => EventKind::Fence,
            Self::AssertPersisted { .. } => EventKind::AssertPersisted,
            Self::AssertOrdered { .. } => EventKind::AssertOrdered,
            Self::RequiredFlush { .. } => EventKind::RequiredFlush,
        }
    }

    pub fn header(&self) -> &EventHeader {
        match self {
            Self::Store { header, .. }
            | Self::Flush { header, .. }
            | Self::Fence { header }
            | Self::AssertPersisted { header, .. }
            | Self::AssertOrdered { header, .. }
            | Self::RequiredFlush { header, .. } => header,
        }
    }

    fn header_mut(&mut self) -> &mut EventHeader {
        match self {
            Self::Store { header, .. }
            | Self::Flush { header, .. }
            | Self::Fence { header }
            | Self::AssertPersisted { header, .. }
            | Self::AssertOrdered { header, .. }
            | Self::RequiredFlush { header, .. } => header,
        }
    }

    pub fn timestamp(&self) -> u64 {
        self.header().timestamp
    }

    pub fn stack(&self) -> &[StackFrame] {
        &self.header().stack
    }

    pub fn is_bug(&self) -> bool {
        self.kind().is_bug_kind()
    }

    /// Strip ANSI color escapes from every string field of this event
    /// (DESIGN NOTES: applied at ingestion, not at serialization time).
    pub(crate) fn strip_colors(mut self) -> Self {
        self.header_mut().strip_colors();
        self
    }

    /// The byte range(s) a `Store` or `Flush` touches, or a bug
    /// reports against. `Fence` has none; `AssertOrdered` has two.
    pub fn ranges(&self) -> Vec<(u64, u64)> {
        match self {
            Self::Store { addr, len, .. }
            | Self::Flush { addr, len, .. }
            | Self::AssertPersisted { addr, len, .. }
            | Self::RequiredFlush { addr, len, .. } => vec![(*addr, addr + len)],
            Self::AssertOrdered { addr_a, len_a, addr_b, len_b, .. } => {
                vec![(*addr_a, addr_a + len_a), (*addr_b, addr_b + len_b)]
            }
            Self::Fence { .. } => vec![],
        }
    }

    /// The single range a `Store` or `Flush` covers, for the passes
    /// that index producers by range. `None` for every other kind.
    pub fn producer_range(&self) -> Option<(u64, u64)> {
        match self {
            Self::Store { addr, len, .. } | Self::Flush { addr, len, .. } => {
                Some((*addr, addr + len))
            }
            _ => None,
        }
    }

    /// A stable (process- and version-independent) digest of this
    /// event's stack, used as half of the bug-identity key (I4).
    pub fn stack_digest(&self) -> u64 {
        stack_digest(self.stack())
    }

    pub fn store(header: EventHeader, addr: u64, len: u64) -> Result<Self, ValidationError> {
        check_len("STORE", len)?;
        Ok(Self::Store { header: header.strip_colors_owned(), addr, len })
    }

    pub fn flush(header: EventHeader, addr: u64, len: u64) -> Result<Self, ValidationError> {
        check_len("FLUSH", len)?;
        Ok(Self::Flush { header: header.strip_colors_owned(), addr, len })
    }

    pub fn fence(header: EventHeader) -> Result<Self, ValidationError> {
        Ok(Self::Fence { header: header.strip_colors_owned() })
    }

    pub fn assert_persisted(header: EventHeader, addr: u64, len: u64) -> Result<Self, ValidationError> {
        check_len("ASSERT_PERSISTED", len)?;
        Ok(Self::AssertPersisted { header: header.strip_colors_owned(), addr, len })
    }

    pub fn assert_ordered(
        header: EventHeader,
        addr_a: u64,
        len_a: u64,
        addr_b: u64,
        len_b: u64,
    ) -> Result<Self, ValidationError> {
        check_len("ASSERT_ORDERED", len_a)?;
        check_len("ASSERT_ORDERED", len_b)?;
        Ok(Self::AssertOrdered { header: header.strip_colors_owned(), addr_a, len_a, addr_b, len_b })
    }

    pub fn required_flush(header: EventHeader, addr: u64, len: u64) -> Result<Self, ValidationError> {
        check_len("REQUIRED_FLUSH", len)?;
        Ok(Self::RequiredFlush { header: header.strip_colors_owned(), addr, len })
    }
}

impl EventHeader {
    fn strip_colors_owned(mut self) -> Self {
        self.strip_colors();
        self
    }
}

fn check_len(kind: &'static str, len: u64) -> Result<(), ValidationError> {
    if len < 1 {
        Err(ValidationError::ZeroLength { kind, len })
    } else {
        Ok(())
    }
}

/// A stable hash over an ordered stack of frames, computed with
/// `xxh3` rather than `std::hash::Hash` because bug identity must be
/// reproducible across process runs (testable property 6).
pub fn stack_digest(stack: &[StackFrame]) -> u64 {
    let mut buf = Vec::with_capacity(stack.len() * 32);
    for frame in stack {
        buf.extend_from_slice(frame.function.as_bytes());
        buf.push(0);
        buf.extend_from_slice(frame.file.as_bytes());
        buf.push(0);
        buf.extend_from_slice(&frame.line.to_le_bytes());
        buf.push(0xff); // frame separator, distinct from the field separator
    }
    xxhash_rust::xxh3::xxh3_64(&buf)
}

/// The `(kind, stack)` pair I4 defines as a bug's (or, during P1, a
/// producer's) deduplication identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BugKey {
    pub kind: EventKind,
    pub stack_digest: u64,
}

impl Event {
    pub fn bug_key(&self) -> BugKey {
        BugKey { kind: self.kind(), stack_digest: self.stack_digest() }
    }
}

/// The flat, kind-tagged wire shape every event is mapped through on
/// the way in and out of JSON (§6's input contract). Fields that don't
/// apply to a given `kind` are simply absent (`None`) rather than
/// forcing every variant to carry every field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawEvent {
    pub kind: String,
    pub timestamp: u64,
    pub function: String,
    pub file: String,
    pub line: u32,
    #[serde(default)]
    pub stack: Vec<StackFrame>,
    #[serde(default)]
    pub is_bug: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub addr: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub len: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub addr_a: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub len_a: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub addr_b: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub len_b: Option<u64>,
}

impl TryFrom<RawEvent> for Event {
    type Error = ValidationError;

    fn try_from(raw: RawEvent) -> Result<Self, ValidationError> {
        let kind = EventKind::from_str(&raw.kind)
            .ok_or_else(|| ValidationError::UnknownKind(raw.kind.clone()))?;

        if raw.is_bug != kind.is_bug_kind() {
            return Err(ValidationError::InconsistentIsBug { kind: kind.as_str(), is_bug: raw.is_bug });
        }

        let header = EventHeader {
            timestamp: raw.timestamp,
            function: raw.function,
            file: raw.file,
            line: raw.line,
            stack: raw.stack,
        };

        let field = |name: &'static str, v: Option<u64>| {
            v.ok_or(ValidationError::MissingField { kind: kind.as_str(), field: name })
        };

        match kind {
            EventKind::Store => Event::store(header, field("addr", raw.addr)?, field("len", raw.len)?),
            EventKind::Flush => Event::flush(header, field("addr", raw.addr)?, field("len", raw.len)?),
            EventKind::Fence => Event::fence(header),
            EventKind::AssertPersisted => {
                Event::assert_persisted(header, field("addr", raw.addr)?, field("len", raw.len)?)
            }
            EventKind::RequiredFlush => {
                Event::required_flush(header, field("addr", raw.addr)?, field("len", raw.len)?)
            }
            EventKind::AssertOrdered => Event::assert_ordered(
                header,
                field("addr_a", raw.addr_a)?,
                field("len_a", raw.len_a)?,
                field("addr_b", raw.addr_b)?,
                field("len_b", raw.len_b)?,
            ),
        }
    }
}

impl From<&Event> for RawEvent {
    fn from(ev: &Event) -> Self {
        let kind = ev.kind();
        let header = ev.header().clone();
        let mut raw = RawEvent {
            kind: kind.as_str().to_string(),
            timestamp: header.timestamp,
            function: header.function,
            file: header.file,
            line: header.line,
            stack: header.stack,
            is_bug: ev.is_bug(),
            addr: None,
            len: None,
            addr_a: None,
            len_a: None,
            addr_b: None,
            len_b: None,
        };
        match ev {
            Event::Store { addr, len, .. }
            | Event::Flush { addr, len, .. }
            | Event::AssertPersisted { addr, len, .. }
            | Event::RequiredFlush { addr, len, .. } => {
                raw.addr = Some(*addr);
                raw.len = Some(*len);
            }
            Event::AssertOrdered { addr_a, len_a, addr_b, len_b, .. } => {
                raw.addr_a = Some(*addr_a);
                raw.len_a = Some(*len_a);
                raw.addr_b = Some(*addr_b);
                raw.len_b = Some(*len_b);
            }
            Event::Fence { .. } => {}
        }
        raw
    }
}

impl Serialize for Event {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        RawEvent::from(self).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Event {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = RawEvent::deserialize(deserializer)?;
        Event::try_from(raw).map_err(serde::de::Error::custom)
    }
}
