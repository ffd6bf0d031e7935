//! The in-memory trace container (C3): accumulates validated events,
//! tracks the source analyzer they came from, and drives optimization
//! and serialization on `dump`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::event::Event;
use crate::optimizer;
use crate::serializer::{self, Document};

/// Which analyzer produced a trace. `from_str`/`as_str` round-trip
/// through the metadata's `source` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceSource {
    Generic,
    Pmtest,
}

impl TraceSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Generic => "GENERIC",
            Self::Pmtest => "PMTEST",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "GENERIC" => Some(Self::Generic),
            "PMTEST" => Some(Self::Pmtest),
            _ => None,
        }
    }
}

impl Serialize for TraceSource {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for TraceSource {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_str(&s).ok_or_else(|| serde::de::Error::custom(format!("unknown trace source `{s}`")))
    }
}

/// Document-level metadata written alongside the optimized events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    pub source: TraceSource,
    pub event_count: usize,
    pub bug_count: usize,
}

/// Failure to set metadata required before a dump (I3: a trace can't
/// be dumped without a known source).
#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("trace source was never set; call set_source before dump")]
    SourceNotSet,
}

/// Failure writing the dumped document to disk.
#[derive(Debug, thiserror::Error)]
pub enum IoError {
    #[error("failed to write trace to {path}: {source}")]
    Write { path: PathBuf, #[source] source: std::io::Error },
    #[error("failed to serialize trace: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Every way a [`Trace::dump`] can fail.
#[derive(Debug, thiserror::Error)]
pub enum DumpError {
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    #[error(transparent)]
    Io(#[from] IoError),
}

/// An accumulating, not-yet-optimized collection of trace events plus
/// the output path they'll eventually be dumped to.
#[derive(Debug, Clone)]
pub struct Trace {
    output_path: PathBuf,
    events: Vec<Event>,
    source: Option<TraceSource>,
}

impl Trace {
    pub fn new(output_path: impl Into<PathBuf>) -> Self {
        Self { output_path: output_path.into(), events: Vec::new(), source: None }
    }

    pub fn set_source(&mut self, source: TraceSource) {
        self.source = Some(source);
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Record an event. Color stripping already happened in the
    /// `Event` constructors; this just tracks and logs the addition.
    pub fn add_event(&mut self, event: Event) {
        tracing::trace!(kind = %event.kind(), timestamp = event.timestamp(), is_bug = event.is_bug(), "event recorded");
        self.events.push(event);
    }

    /// Run the optimizer pipeline over the accumulated events and
    /// write the resulting document to `output_path`.
    pub fn dump(&self) -> Result<(), DumpError> {
        let source = self.source.ok_or(MetadataError::SourceNotSet)?;

        let optimized = optimizer::optimize(self.events.clone());
        let bug_count = optimized.iter().filter(|e| e.is_bug()).count();

        let doc = Document {
            metadata: Metadata { source, event_count: optimized.len(), bug_count },
            trace: optimized,
        };

        serializer::write_to_path(&doc, &self.output_path)?;
        tracing::info!(path = %self.output_path.display(), events = doc.trace.len(), bugs = bug_count, "trace dumped");
        Ok(())
    }
}
