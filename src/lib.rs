//! In-process tracing with the Web Tracing Framework wire format.
//!
//! This library records high-frequency, typed events (instants and nested
//! scopes) from many concurrent producer threads and serializes the
//! aggregate stream into WTF's chunked binary file layout, which the
//! offline viewer reads to visualize per-zone timelines.
//!
//! Each producer owns a chunked ring of 32-bit slots with single-producer /
//! single-consumer handoff: the hot path writes only thread-owned memory
//! plus one release store, and a save snapshots every buffer without
//! stopping producers. Event sites construct a typed [`Event`] once and
//! invoke it many times; a process-wide registry assigns stable wire ids
//! and the save pipeline emits self-describing definition records.
//!
//! ```
//! use std::sync::LazyLock;
//! use wtf_trace::{Ascii, Event, Runtime, SaveOptions};
//!
//! static FRAME_EVENT: LazyLock<Event<(u32, Ascii)>> =
//!     LazyLock::new(|| Event::new("Renderer::frame: number, pass"));
//!
//! Runtime::global().enable_current_thread("renderer", "", "");
//! FRAME_EVENT.invoke((1, "shadow"));
//!
//! let mut out = Vec::new();
//! Runtime::global().save(&mut out, SaveOptions::new()).unwrap();
//! ```

#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

#[macro_use]
extern crate tracing;

pub mod args;
pub mod buffer;
pub mod event;
pub mod output;
pub mod platform;
pub mod runtime;
pub mod string_table;
pub mod zone;

#[cfg(test)]
mod test;

pub use args::{Ascii, EventArgument, EventArguments};
pub use buffer::{EventBuffer, DEFAULT_CHUNK_SIZE_BYTES, MAX_ADD_SLOTS, MIN_CHUNK_SLOTS};
pub use event::{
    standard, Event, EventClass, EventDefinition, EventFlags, EventRegistry, ScopeGuard,
    ScopedEvent, DEFINE_EVENT_WIRE_ID, SCOPE_LEAVE_WIRE_ID,
};
pub use output::{ChunkHeader, OutputSink, PartHeader, WriteError};
pub use runtime::{Runtime, SaveCheckpoint, SaveOptions, ScopedTask};
pub use string_table::StringTable;
pub use zone::{ZoneDefinition, ZoneRegistry};
