//! The process-wide runtime: producer registration, the task buffer pool,
//! and the snapshot/serialize pipeline that writes WTF files.
//!
//! Producers log without involving the runtime; it only participates in
//! heavy-weight operations. A save copies the buffer list under the runtime
//! mutex, then runs lock free against each buffer's published data, so
//! writers are never blocked for more than that enumeration.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, LazyLock};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use snafu::ResultExt;

use crate::buffer::{BufferState, EventBuffer};
use crate::event::{standard, EventRegistry};
use crate::output::{
    ChunkHeader, IoSnafu, OutputSink, PartHeader, WriteError, CHUNK_TYPE_EVENTS,
    CHUNK_TYPE_FILE_HEADER, PART_TYPE_FILE_HEADER,
};
use crate::platform;
use crate::zone::{ZoneRegistry, ZONE_TYPE_TASK};

/// Magic number opening every trace file.
pub const FILE_MAGIC: u32 = 0xdead_beef;
/// WTF format tag.
pub const FORMAT_TAG: u32 = 0xe821_4400;
/// WTF format version.
pub const FORMAT_VERSION: u32 = 0x0000_000a;

const FILE_HEADER_CHUNK_ID: u32 = 1;
const FIRST_EVENT_CHUNK_ID: u32 = 2;

/// Record of what a prior save already wrote, enabling subsequent saves to
/// append only deltas: no repeated file header, and only event and zone
/// definitions registered since.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SaveCheckpoint {
    needs_file_header: bool,
    event_definition_from_index: usize,
    zone_definition_from_index: usize,
    next_chunk_id: u32,
}

impl Default for SaveCheckpoint {
    fn default() -> Self {
        Self {
            needs_file_header: true,
            event_definition_from_index: 0,
            zone_definition_from_index: 0,
            next_chunk_id: FIRST_EVENT_CHUNK_ID,
        }
    }
}

impl SaveCheckpoint {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Options controlling a save.
#[derive(Debug, Default)]
pub struct SaveOptions<'a> {
    /// Clear saved thread data as it is serialized. Shared data (string
    /// tables, registries) is never cleared.
    pub clear_thread_data: bool,

    /// Open the target file in append mode (`save_to_file` only).
    pub append: bool,

    /// Checkpoint from prior saves of the same stream. Advanced only when
    /// the save succeeds.
    pub checkpoint: Option<&'a mut SaveCheckpoint>,
}

impl<'a> SaveOptions<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Options that clear thread data as it is saved.
    pub fn clearing() -> Self {
        Self {
            clear_thread_data: true,
            ..Self::default()
        }
    }

    /// Options for streaming increments of one trace into a single file:
    /// append mode, clearing, checkpointed.
    pub fn streaming_file(checkpoint: &'a mut SaveCheckpoint) -> Self {
        Self {
            clear_thread_data: true,
            append: true,
            checkpoint: Some(checkpoint),
        }
    }
}

#[derive(Serialize)]
struct ContextInfo<'a> {
    #[serde(rename = "contextType")]
    context_type: &'a str,
    title: &'a str,
}

#[derive(Serialize)]
struct FileHeaderBlob<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    timebase: u64,
    flags: &'a [&'a str],
    #[serde(rename = "contextInfo")]
    context_info: ContextInfo<'a>,
}

#[derive(Default)]
struct TaskState {
    next_instance_id: u32,
    /// Idle buffers, most recently pushed first.
    idle_event_buffers: Vec<EventBuffer>,
}

#[derive(Default)]
struct RuntimeInner {
    /// Every buffer this runtime has created, thread and task alike.
    /// Buffers are never removed: their data stays saveable after the
    /// producer is gone.
    thread_event_buffers: Vec<Arc<BufferState>>,
    tasks: HashMap<String, TaskState>,
    uniquifier: u32,
}

/// Singleton entry point tying registries, buffers, and sinks together.
pub struct Runtime {
    inner: Mutex<RuntimeInner>,
    /// Serializes saves: the reader side of every buffer assumes at most
    /// one walker at a time.
    save_lock: Mutex<()>,
}

static RUNTIME: LazyLock<Runtime> = LazyLock::new(Runtime::new);

impl Runtime {
    fn new() -> Self {
        platform::initialize_timebase();
        // Register the builtin events up front so the first save's
        // definition chunk is complete and the fixed wire ids are claimed
        // before any user event registers.
        standard::register_all();
        Self {
            inner: Mutex::new(RuntimeInner::default()),
            save_lock: Mutex::new(()),
        }
    }

    pub fn global() -> &'static Runtime {
        &RUNTIME
    }

    /// Enables the current thread for trace collection. No-ops if the
    /// thread already has a buffer installed.
    pub fn enable_current_thread(&self, name: &str, zone_type: &str, location: &str) {
        if platform::has_thread_event_buffer() {
            return;
        }
        let buffer = self.register_external_thread(name, zone_type, location);
        platform::set_thread_event_buffer(Some(buffer));
    }

    /// Enables the current thread under its own name.
    pub fn auto_enable_current_thread(&self) {
        let name = platform::thread_name();
        self.enable_current_thread(&name, "", "");
    }

    /// Creates and registers a buffer for a producer that manages its own
    /// handoff instead of using the thread-local slot.
    ///
    /// The zone name carries a process-unique prefix so two producers with
    /// the same name stay distinguishable in the trace.
    pub fn register_external_thread(
        &self,
        name: &str,
        zone_type: &str,
        location: &str,
    ) -> EventBuffer {
        let (mut buffer, unique_id) = {
            let mut inner = self.inner.lock();
            inner.uniquifier += 1;
            (create_event_buffer(&mut inner), inner.uniquifier)
        };
        let unique_name = format!("{unique_id}:{name}");
        let zone_id = ZoneRegistry::global().create_zone(&unique_name, zone_type, location);
        standard::set_zone(&mut buffer, zone_id);
        buffer.freeze_prefix_slots();
        buffer
    }

    /// Disables trace collection for the current thread. Collected data
    /// remains owned by the runtime and is still saved.
    pub fn disable_current_thread(&self) {
        drop(platform::set_thread_event_buffer(None));
    }

    /// Takes an idle buffer for the named task, creating one (with a fresh
    /// `"{name}:{instance}"` task zone stamped and frozen) if the pool is
    /// empty.
    pub fn pop_task_event_buffer(&self, name: &str) -> EventBuffer {
        let (mut created, unique_id) = {
            let mut inner = self.inner.lock();
            let task = inner.tasks.entry(name.to_string()).or_default();
            if let Some(existing) = task.idle_event_buffers.pop() {
                return existing;
            }
            let unique_id = task.next_instance_id;
            task.next_instance_id += 1;
            (create_event_buffer(&mut inner), unique_id)
        };
        let unique_name = format!("{name}:{unique_id}");
        let zone_id = ZoneRegistry::global().create_zone(&unique_name, ZONE_TYPE_TASK, "");
        standard::set_zone(&mut created, zone_id);
        created.freeze_prefix_slots();
        created
    }

    /// Returns a task buffer to the pool for reuse.
    pub fn push_task_event_buffer(&self, name: &str, buffer: EventBuffer) {
        let mut inner = self.inner.lock();
        inner
            .tasks
            .entry(name.to_string())
            .or_default()
            .idle_event_buffers
            .push(buffer);
    }

    /// Serializes the trace into `out`.
    ///
    /// Mostly non-disruptive to concurrent producers: the only
    /// synchronization against them is the buffer-list copy under the
    /// runtime mutex and the brief string-table locks.
    pub fn save<W: Write>(&self, out: &mut W, options: SaveOptions<'_>) -> Result<(), WriteError> {
        let _reader_exclusive = self.save_lock.lock();
        let SaveOptions {
            clear_thread_data,
            checkpoint,
            ..
        } = options;

        let needs_file_header = checkpoint.as_ref().map_or(true, |cp| cp.needs_file_header);
        let event_definition_from_index = checkpoint
            .as_ref()
            .map_or(0, |cp| cp.event_definition_from_index);
        let zone_definition_from_index = checkpoint
            .as_ref()
            .map_or(0, |cp| cp.zone_definition_from_index);
        let mut next_chunk_id = checkpoint
            .as_ref()
            .map_or(FIRST_EVENT_CHUNK_ID, |cp| cp.next_chunk_id);

        // Copy the buffer list in a lock; the rest runs lock free.
        let local_buffers: Vec<Arc<BufferState>> =
            self.inner.lock().thread_event_buffers.clone();

        let mut sink = OutputSink::new(out);
        if needs_file_header {
            write_file_header_chunk(&mut sink)?;
        }

        // Snapshot each buffer's parts. The event part is frozen first so
        // the string table snapshot covers every id it references.
        let mut snapshots = Vec::with_capacity(local_buffers.len());
        for state in &local_buffers {
            let mut event_header = PartHeader::default();
            state.populate_header(&mut event_header);
            let mut string_header = PartHeader::default();
            state.string_table().populate_header(&mut string_header);
            snapshots.push((Arc::clone(state), string_header, event_header));
        }

        // Build the definitions buffer after all buffers are snapshotted so
        // it covers every event those snapshots may reference.
        let mut definitions = EventBuffer::new();
        let event_definitions =
            EventRegistry::global().definitions_from(event_definition_from_index);
        for definition in &event_definitions {
            standard::define_event(
                &mut definitions,
                definition.wire_id(),
                definition.class(),
                definition.flags(),
                &definition.name(),
                &definition.arguments(),
            );
        }
        let zone_definition_end =
            ZoneRegistry::global().emit_zones(&mut definitions, zone_definition_from_index);

        let mut definitions_event_header = PartHeader::default();
        definitions.populate_header(&mut definitions_event_header);
        let mut definitions_string_header = PartHeader::default();
        definitions
            .string_table()
            .populate_header(&mut definitions_string_header);

        write_event_chunk(
            &mut sink,
            definitions.shared(),
            definitions_string_header,
            definitions_event_header,
            false,
            next_chunk_id,
        )?;
        next_chunk_id += 1;

        for (state, string_header, event_header) in snapshots {
            write_event_chunk(
                &mut sink,
                &state,
                string_header,
                event_header,
                clear_thread_data,
                next_chunk_id,
            )?;
            next_chunk_id += 1;
        }

        trace!(
            buffers = local_buffers.len(),
            new_event_definitions = event_definitions.len(),
            bytes = sink.written(),
            "Trace saved."
        );

        // Advance the checkpoint only on success, so a failed save is
        // retried from the same state.
        if let Some(cp) = checkpoint {
            cp.needs_file_header = false;
            cp.event_definition_from_index =
                event_definition_from_index + event_definitions.len();
            cp.zone_definition_from_index = zone_definition_end;
            cp.next_chunk_id = next_chunk_id;
        }
        Ok(())
    }

    /// Saves the trace to a file, truncating by default or appending for
    /// streaming. When appending to a file that turned out empty (deleted
    /// or truncated between saves), the checkpoint is reset so the stream
    /// restarts with a file header.
    pub fn save_to_file<P: AsRef<Path>>(
        &self,
        path: P,
        mut options: SaveOptions<'_>,
    ) -> Result<(), WriteError> {
        let file = if options.append {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path.as_ref())
        } else {
            File::create(path.as_ref())
        }
        .context(IoSnafu)?;

        if options.append {
            let length = file.metadata().context(IoSnafu)?.len();
            if length == 0 {
                if let Some(cp) = options.checkpoint.as_deref_mut() {
                    *cp = SaveCheckpoint::default();
                }
            }
        }

        let mut writer = BufWriter::new(file);
        let result = self.save(&mut writer, options);
        if result.is_err() {
            error!(path = %path.as_ref().display(), "Failed to save trace file.");
        }
        result?;
        writer.flush().context(IoSnafu)?;
        Ok(())
    }

    /// Drops all currently-saved thread data without emitting it anywhere.
    ///
    /// Walks every buffer exactly as a clearing save does, just into a
    /// discarding sink.
    pub fn clear_thread_data(&self) {
        let _reader_exclusive = self.save_lock.lock();
        let local_buffers: Vec<Arc<BufferState>> =
            self.inner.lock().thread_event_buffers.clone();
        for state in local_buffers {
            let mut header = PartHeader::default();
            state.populate_header(&mut header);
            let mut sink = OutputSink::new(io::sink());
            if let Err(error) = state.write_to(&header, &mut sink, true) {
                error!(%error, "Failed to clear event buffer.");
            }
        }
    }

    /// Clears the runtime's buffer list and task pool. Only meaningful for
    /// tests, and only when no producers are running.
    pub fn reset_for_testing(&self) {
        let mut inner = self.inner.lock();
        inner.thread_event_buffers.clear();
        inner.tasks.clear();
    }
}

/// Allocates a buffer and records its shared state in the runtime's list.
fn create_event_buffer(inner: &mut RuntimeInner) -> EventBuffer {
    let buffer = EventBuffer::new();
    inner.thread_event_buffers.push(Arc::clone(buffer.shared()));
    buffer
}

fn write_file_header_chunk<W: Write>(sink: &mut OutputSink<W>) -> Result<(), WriteError> {
    sink.append_u32(FILE_MAGIC)?;
    sink.append_u32(FORMAT_TAG)?;
    sink.append_u32(FORMAT_VERSION)?;

    let blob = FileHeaderBlob {
        kind: "file_header",
        // The platform resets to a zero time base.
        timebase: 0,
        flags: &["has_high_resolution_times"],
        context_info: ContextInfo {
            context_type: "script",
            title: "Rust Trace",
        },
    };
    let json = serde_json::to_vec(&blob).expect("file header serialization is infallible");

    let mut part = PartHeader {
        part_type: PART_TYPE_FILE_HEADER,
        offset: 0,
        length: json.len() as u32,
    };
    sink.start_chunk(
        ChunkHeader {
            id: FILE_HEADER_CHUNK_ID,
            chunk_type: CHUNK_TYPE_FILE_HEADER,
            start_time: 0xffff_ffff,
            end_time: 0xffff_ffff,
        },
        std::slice::from_mut(&mut part),
    )?;
    sink.append(&json)?;
    sink.align()
}

/// Writes one events chunk: string table part, then event data part.
fn write_event_chunk<W: Write>(
    sink: &mut OutputSink<W>,
    state: &BufferState,
    string_header: PartHeader,
    event_header: PartHeader,
    clear_written_data: bool,
    chunk_id: u32,
) -> Result<(), WriteError> {
    let mut parts = [string_header, event_header];
    sink.start_chunk(
        ChunkHeader {
            id: chunk_id,
            chunk_type: CHUNK_TYPE_EVENTS,
            start_time: 0,
            end_time: platform::timestamp_micros(),
        },
        &mut parts,
    )?;
    state.string_table().write_to(&parts[0], sink)?;
    state.write_to(&parts[1], sink, clear_written_data)
}

/// RAII task attribution: pops a buffer for the named task, installs it as
/// the current thread's buffer, and on drop returns it to the pool and
/// restores whatever was installed before.
///
/// Ideal for worker pools where events should land in a per-task zone
/// rather than the physical thread's zone.
pub struct ScopedTask {
    name: String,
    previous: Option<EventBuffer>,
}

impl ScopedTask {
    pub fn new(name: &str) -> Self {
        let buffer = Runtime::global().pop_task_event_buffer(name);
        let previous = platform::set_thread_event_buffer(Some(buffer));
        Self {
            name: name.to_string(),
            previous,
        }
    }
}

impl Drop for ScopedTask {
    fn drop(&mut self) {
        let buffer = platform::set_thread_event_buffer(self.previous.take());
        if let Some(buffer) = buffer {
            Runtime::global().push_task_event_buffer(&self.name, buffer);
        }
    }
}
