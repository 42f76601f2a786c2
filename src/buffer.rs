//! Per-producer event buffer: a chunked ring of 32-bit slots with lock-free
//! handoff between the owning writer and an out-of-thread reader.
//!
//! The buffer is split the same way the disk buffer splits reader and writer
//! around a shared ledger: [`EventBuffer`] is the single-writer handle owning
//! the write cursor, and the shared [`BufferState`] carries the chunk chain,
//! the frozen prefix, and the per-buffer string table. The hot path
//! (`add_slots` + slot writes + `flush`) touches only writer-owned memory
//! plus one release store; the reader synchronizes exclusively through the
//! acquire/release pairs on each chunk's `published` counter and `next` link.
//!
//! Chunk lifecycle: a chunk is *open* while `next` is unset (the writer may
//! still advance its size), *closed* once `next` is set (its published size
//! is final), and *drained* once the reader has serialized and skipped every
//! published slot, at which point a closed head chunk is unlinked and freed.

use std::{
    cell::UnsafeCell,
    fmt,
    io::Write,
    slice,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, OnceLock,
    },
};

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;

use crate::output::{OutputSink, PartHeader, WriteError, PART_TYPE_EVENT_DATA};
use crate::string_table::StringTable;

/// Default chunk capacity in bytes (4096 slots).
pub const DEFAULT_CHUNK_SIZE_BYTES: usize = 16 * 1024;

/// Smallest allowed chunk capacity in slots. Also the hard upper bound on a
/// single `add_slots` call, which guarantees any one event record fits
/// wholly inside one chunk.
pub const MIN_CHUNK_SLOTS: usize = 256;

/// Hard upper bound on the slot count of a single `add_slots` call.
pub const MAX_ADD_SLOTS: usize = MIN_CHUNK_SLOTS;

/// One fixed-capacity slot array in a buffer's chain.
pub(crate) struct Chunk {
    /// Slot capacity, fixed at allocation.
    limit: usize,

    /// Writer's promise that slots `[0, published)` are fully initialized.
    /// Store-release by the writer, load-acquire by the reader.
    published: CachePadded<AtomicUsize>,

    /// Slots `[0, skip)` have already been serialized. Reader-owned; only
    /// mutated while holding the buffer's reader lock.
    skip: AtomicUsize,

    /// Link to the successor chunk. Set exactly once, by the writer, after
    /// which `published` is final for this chunk.
    next: OnceLock<Arc<Chunk>>,

    slots: Box<[UnsafeCell<u32>]>,
}

// SAFETY: the slot array uses `UnsafeCell` under a single-producer /
// single-consumer protocol. The lone writer handle writes only at indices at
// or above `published` and hands visibility to readers with a release store
// of the new `published`; the reader (serialized by the buffer's reader
// lock) reads only below an acquire-loaded `published`. The release/acquire
// pair makes every slot write happen-before any read of the same index, so
// no slot is ever accessed concurrently from both sides.
unsafe impl Send for Chunk {}
unsafe impl Sync for Chunk {}

impl Chunk {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            published: CachePadded::new(AtomicUsize::new(0)),
            skip: AtomicUsize::new(0),
            next: OnceLock::new(),
            slots: (0..limit).map(|_| UnsafeCell::new(0)).collect(),
        }
    }

    /// Carves out a writable view of `len` slots starting at `start`.
    ///
    /// SAFETY: the caller must be the buffer's single writer, and the range
    /// must lie at or above the chunk's published size so no reader can
    /// observe it until the next release of `published`.
    unsafe fn writer_slots(&self, start: usize, len: usize) -> &mut [u32] {
        debug_assert!(start + len <= self.limit);
        let base = self.slots.as_ptr().add(start) as *mut u32;
        slice::from_raw_parts_mut(base, len)
    }

    /// Reads the slot at `index`.
    ///
    /// SAFETY: `index` must be below an acquire-loaded `published`.
    unsafe fn read_slot(&self, index: usize) -> u32 {
        *self.slots[index].get()
    }
}

struct ReaderCursor {
    head: Arc<Chunk>,
}

/// State shared between the writer handle and out-of-thread readers.
pub(crate) struct BufferState {
    chunk_limit: usize,
    string_table: StringTable,
    /// Head of the chunk chain. The lock also serializes readers: at most
    /// one snapshot/serialize walk happens at a time.
    reader: Mutex<ReaderCursor>,
    /// Immutable slots prepended to every serialization of this buffer,
    /// typically the `wtf.zone#set` record naming the producer.
    frozen_prefix: Mutex<Vec<u32>>,
    out_of_scope: AtomicBool,
}

impl BufferState {
    pub(crate) fn string_table(&self) -> &StringTable {
        &self.string_table
    }

    pub(crate) fn mark_out_of_scope(&self) {
        self.out_of_scope.store(true, Ordering::Release);
    }

    pub(crate) fn is_out_of_scope(&self) -> bool {
        self.out_of_scope.load(Ordering::Acquire)
    }

    /// Snapshots the serialized size of the buffer into `header`.
    ///
    /// Walks the chunk chain loading each chunk's `next` link *before* its
    /// published size: once a successor is linked the predecessor's
    /// published size is final, and when there is no successor whatever we
    /// read is a valid intermediate snapshot. Loading in the other order
    /// would race a writer finishing a publish-and-link.
    pub(crate) fn populate_header(&self, header: &mut PartHeader) {
        let reader = self.reader.lock();
        let mut slot_count = self.frozen_prefix.lock().len();

        let mut chunk = Arc::clone(&reader.head);
        loop {
            let next = chunk.next.get().cloned();
            let published = chunk.published.load(Ordering::Acquire);
            let skip = chunk.skip.load(Ordering::Relaxed);
            slot_count += published - skip;
            match next {
                Some(successor) => chunk = successor,
                None => break,
            }
        }

        header.part_type = PART_TYPE_EVENT_DATA;
        header.offset = 0;
        header.length = (slot_count * 4) as u32;
    }

    /// Writes the buffer payload bounded by a previously-populated `header`:
    /// the frozen prefix first, then published-but-unskipped slots in chain
    /// order. The buffer may have grown since the snapshot; only the
    /// recorded amount is written.
    ///
    /// With `clear_written_data`, serialized slots are skipped for all
    /// future walks and drained head chunks are unlinked and freed.
    ///
    /// Fails with [`WriteError::EventDataSizeMismatch`] if the buffer holds
    /// fewer slots than the header recorded.
    pub(crate) fn write_to<W: Write>(
        &self,
        header: &PartHeader,
        sink: &mut OutputSink<W>,
        clear_written_data: bool,
    ) -> Result<(), WriteError> {
        let mut reader = self.reader.lock();
        let mut remaining = header.length as usize / 4;

        {
            let prefix = self.frozen_prefix.lock();
            let take = remaining.min(prefix.len());
            for slot in &prefix[..take] {
                sink.append_u32(*slot)?;
            }
            remaining -= take;
        }

        let mut chunk = Arc::clone(&reader.head);
        while remaining > 0 {
            // Same load order as `populate_header`: `next` before
            // `published`.
            let next = chunk.next.get().cloned();
            let published = chunk.published.load(Ordering::Acquire);
            let skip = chunk.skip.load(Ordering::Relaxed);

            let take = (published - skip).min(remaining);
            for index in skip..skip + take {
                // SAFETY: `index < published`, loaded with acquire above.
                sink.append_u32(unsafe { chunk.read_slot(index) })?;
            }
            remaining -= take;

            if clear_written_data {
                chunk.skip.store(skip + take, Ordering::Relaxed);
                if let Some(successor) = &next {
                    if skip + take == published && Arc::ptr_eq(&chunk, &reader.head) {
                        // Drained head: unlink it so it can be freed.
                        reader.head = Arc::clone(successor);
                    }
                }
            }

            match next {
                Some(successor) if remaining > 0 => chunk = successor,
                _ => break,
            }
        }

        if remaining > 0 {
            return Err(WriteError::EventDataSizeMismatch {
                expected: header.length,
            });
        }
        Ok(())
    }
}

/// Single-writer handle to an event buffer.
///
/// Not `Sync`: all producer-side methods take `&mut self`, which is what
/// enforces the single-producer half of the buffer's contract. The handle
/// may move between threads (task buffers do), but only one thread writes
/// at a time. Dropping the handle marks the shared state out of scope so
/// the runtime knows the producer is gone.
pub struct EventBuffer {
    shared: Arc<BufferState>,
    current: Arc<Chunk>,
    size: usize,
}

impl Default for EventBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBuffer {
    /// Creates a buffer with the default chunk capacity.
    pub fn new() -> Self {
        Self::with_chunk_size(DEFAULT_CHUNK_SIZE_BYTES)
    }

    /// Creates a buffer whose chunks hold `chunk_size_bytes` of slots,
    /// clamped up to [`MIN_CHUNK_SLOTS`].
    pub fn with_chunk_size(chunk_size_bytes: usize) -> Self {
        let chunk_limit = (chunk_size_bytes / 4).max(MIN_CHUNK_SLOTS);
        let chunk = Arc::new(Chunk::new(chunk_limit));
        let shared = Arc::new(BufferState {
            chunk_limit,
            string_table: StringTable::new(),
            reader: Mutex::new(ReaderCursor {
                head: Arc::clone(&chunk),
            }),
            frozen_prefix: Mutex::new(Vec::new()),
            out_of_scope: AtomicBool::new(false),
        });
        Self {
            shared,
            current: chunk,
            size: 0,
        }
    }

    /// The string table event arguments of this buffer intern through.
    pub fn string_table(&self) -> &StringTable {
        self.shared.string_table()
    }

    pub(crate) fn shared(&self) -> &Arc<BufferState> {
        &self.shared
    }

    /// Reserves `n` slots, returning the start index within `current`.
    #[inline]
    fn reserve_slots(&mut self, n: usize) -> usize {
        assert!(
            n <= MAX_ADD_SLOTS,
            "add_slots({n}) exceeds the per-record limit of {MAX_ADD_SLOTS} slots"
        );
        if self.size + n <= self.current.limit {
            let start = self.size;
            self.size += n;
            start
        } else {
            self.expand(n);
            0
        }
    }

    /// Overflow path: publishes the current chunk's final size, allocates a
    /// successor, links it (the release store of `next` is the signal that
    /// the previous chunk is closed), and rotates the write cursor.
    #[cold]
    fn expand(&mut self, n: usize) {
        self.flush();
        let fresh = Arc::new(Chunk::new(self.shared.chunk_limit));
        if self.current.next.set(Arc::clone(&fresh)).is_err() {
            unreachable!("event buffer chunk linked twice");
        }
        self.current = fresh;
        self.size = n;
    }

    /// Returns `n` consecutive writable slots and advances the write cursor.
    ///
    /// The slots are not visible to readers until [`EventBuffer::flush`].
    /// `n` must not exceed [`MAX_ADD_SLOTS`]; violating this is a
    /// programmer error and panics.
    #[inline]
    pub fn add_slots(&mut self, n: usize) -> &mut [u32] {
        let start = self.reserve_slots(n);
        // SAFETY: this handle is the single writer, and `[start, start+n)`
        // sits at or above the chunk's published size until the next flush.
        unsafe { self.current.writer_slots(start, n) }
    }

    /// Reserves `n` slots and also hands back the string table, so argument
    /// emission can intern strings while the slot borrow is live.
    #[inline]
    pub(crate) fn add_record_slots(&mut self, n: usize) -> (&StringTable, &mut [u32]) {
        let start = self.reserve_slots(n);
        // SAFETY: as in `add_slots`.
        let slots = unsafe { self.current.writer_slots(start, n) };
        (self.shared.string_table(), slots)
    }

    /// Publishes every slot written so far to readers.
    ///
    /// Must be called before the writer relinquishes control of the handle
    /// or before anything that may hand the buffer to a reader.
    #[inline]
    pub fn flush(&mut self) {
        self.current.published.store(self.size, Ordering::Release);
    }

    /// Moves the slots written to the current chunk into the buffer's
    /// immutable prefix, which is re-emitted at the start of every
    /// serialization, and resets the chunk. A no-op on an empty buffer.
    ///
    /// Intended to be called once, right after stamping the producer's
    /// identity and before the buffer sees concurrent readers.
    pub fn freeze_prefix_slots(&mut self) {
        if self.size == 0 {
            return;
        }
        let mut prefix = self.shared.frozen_prefix.lock();
        for index in 0..self.size {
            // SAFETY: indices below `size` were written by this handle.
            prefix.push(unsafe { self.current.read_slot(index) });
        }
        drop(prefix);
        self.size = 0;
        self.current.published.store(0, Ordering::Release);
    }

    /// Snapshots the serialized size of the buffer into `header`. Reader
    /// side; safe to call while the writer is active.
    pub fn populate_header(&self, header: &mut PartHeader) {
        self.shared.populate_header(header);
    }

    /// Writes the buffer payload bounded by a previously-populated
    /// `header`. Reader side; see [`BufferState::write_to`].
    pub fn write_to<W: Write>(
        &self,
        header: &PartHeader,
        sink: &mut OutputSink<W>,
        clear_written_data: bool,
    ) -> Result<(), WriteError> {
        self.shared.write_to(header, sink, clear_written_data)
    }
}

impl Drop for EventBuffer {
    fn drop(&mut self) {
        self.flush();
        self.shared.mark_out_of_scope();
    }
}

impl fmt::Debug for EventBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBuffer")
            .field("chunk_limit", &self.shared.chunk_limit)
            .field("current_size", &self.size)
            .field("out_of_scope", &self.shared.is_out_of_scope())
            .finish()
    }
}
