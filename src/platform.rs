//! Platform interface: the monotonic timestamp source and the thread-local
//! slot holding the current thread's event buffer.
//!
//! Timestamps are microseconds since library initialization, truncated to 32
//! bits; they wrap after about 71 minutes and consumers interpret them
//! modulo 2^32.

use std::cell::RefCell;
use std::sync::LazyLock;
use std::time::Instant;

use crate::buffer::EventBuffer;

static TIMEBASE: LazyLock<Instant> = LazyLock::new(Instant::now);

/// Pins the timestamp base to now. Called once by the runtime; harmless to
/// call again.
pub(crate) fn initialize_timebase() {
    LazyLock::force(&TIMEBASE);
}

/// Monotonic microseconds since library initialization, wrapping at 2^32.
#[inline]
pub fn timestamp_micros() -> u32 {
    TIMEBASE.elapsed().as_micros() as u32
}

thread_local! {
    static THREAD_EVENT_BUFFER: RefCell<Option<EventBuffer>> = const { RefCell::new(None) };
}

/// Whether the current thread has an event buffer installed.
pub fn has_thread_event_buffer() -> bool {
    THREAD_EVENT_BUFFER.with(|slot| slot.borrow().is_some())
}

/// Runs `f` with the current thread's event buffer, or `None` if the thread
/// has not been enabled for tracing.
///
/// Must not be called from thread-local destructors; the slot itself may
/// already be gone by then.
#[inline]
pub fn with_thread_event_buffer<R>(f: impl FnOnce(Option<&mut EventBuffer>) -> R) -> R {
    THREAD_EVENT_BUFFER.with(|slot| f(slot.borrow_mut().as_mut()))
}

/// Installs `buffer` as the current thread's event buffer, returning the
/// previously installed one.
///
/// Handles left installed at thread exit are dropped by the thread-local
/// destructor, which marks their shared state out of scope.
pub fn set_thread_event_buffer(buffer: Option<EventBuffer>) -> Option<EventBuffer> {
    THREAD_EVENT_BUFFER.with(|slot| slot.replace(buffer))
}

/// Best-effort name for the current thread, used to derive a default zone
/// name.
pub fn thread_name() -> String {
    let current = std::thread::current();
    match current.name() {
        Some(name) => name.to_string(),
        None => format!("thread-{:?}", current.id()),
    }
}
