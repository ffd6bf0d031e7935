//! A library for optimizing persistent-memory bug traces.
//!
//! A dynamic analyzer watches a program's stores, cache-line flushes,
//! and fences against persistent memory, and reports violations of the
//! durability model it's checking (a store that's never flushed, a
//! flush that's never ordered behind the fence it needs, ...) as
//! assertion events interleaved with the raw memory traffic that
//! produced them. Left alone, such a trace tends to be both noisy
//! (the same root cause reported dozens of times) and bulky (most of
//! the memory traffic has nothing to do with any reported bug).
//!
//! This crate takes that raw, validated event stream and runs it
//! through [`optimizer::optimize`] — a four-pass pipeline that
//! attributes and deduplicates bugs, prunes irrelevant memory traffic,
//! coalesces superseded stores, and collapses redundant fences — then
//! serializes the result as a compact, deterministic JSON document via
//! [`trace::Trace::dump`].

pub mod color;
pub mod event;
pub mod optimizer;
pub mod range_index;
pub mod serializer;
pub mod trace;

pub use event::{BugKey, Event, EventHeader, EventKind, StackFrame, ValidationError};
pub use optimizer::optimize;
pub use serializer::Document;
pub use trace::{DumpError, IoError, Metadata, MetadataError, Trace, TraceSource};
