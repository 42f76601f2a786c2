//! Typed event descriptors, the process-wide registry, and the standard
//! built-in events.
//!
//! An event site constructs an [`Event`] (or [`ScopedEvent`]) once from a
//! name spec; construction registers an immutable [`EventDefinition`] and
//! claims a wire id. Emission then writes fixed-layout records into a
//! buffer: `slot[0]` is the wire id, `slot[1]` the timestamp, and the
//! remaining slots hold the arguments in declaration order.
//!
//! The name spec syntax is `"Namespace::Class#Method: arg1, arg2"`: the part
//! before the first single `:` is the event name (with `::` rewritten to
//! WTF's `#` separator), and the comma-separated suffix names the arguments.
//! Missing argument names are generated as `a{index}`.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::LazyLock;

use parking_lot::Mutex;

use crate::args::{Ascii, EventArguments};
use crate::buffer::EventBuffer;
use crate::platform;

/// Class of an event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum EventClass {
    /// One-shot event.
    Instant = 0,
    /// Event with enter/leave semantics; the leave is the fixed
    /// [`SCOPE_LEAVE_WIRE_ID`] record.
    Scoped = 1,
}

/// Bit set of event behavior flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EventFlags(u32);

impl EventFlags {
    pub const NONE: Self = Self(0);
    pub const HIGH_FREQUENCY: Self = Self(1 << 1);
    pub const SYSTEM_TIME: Self = Self(1 << 2);
    pub const INTERNAL: Self = Self(1 << 3);
    pub const APPEND_SCOPE_DATA: Self = Self(1 << 4);
    pub const BUILTIN: Self = Self(1 << 5);
    pub const APPEND_FLOW_DATA: Self = Self(1 << 6);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for EventFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Wire id permanently reserved for the scope-leave record.
pub const SCOPE_LEAVE_WIRE_ID: u16 = 2;

/// Wire id of the primordial `wtf.event#define` event.
pub const DEFINE_EVENT_WIRE_ID: u16 = 1;

// Wire ids 1 and 2 are reserved; allocation starts past them.
static NEXT_EVENT_ID: AtomicU32 = AtomicU32::new(SCOPE_LEAVE_WIRE_ID as u32 + 1);

/// Claims the next unallocated wire id.
///
/// Used internally on event construction, but also available for bridging
/// third-party event data into the stream.
pub fn next_event_id() -> u16 {
    NEXT_EVENT_ID.fetch_add(1, Ordering::Relaxed) as u16
}

/// Claims a contiguous block of `count` wire ids, returning the first.
pub fn next_event_ids(count: u16) -> u16 {
    NEXT_EVENT_ID.fetch_add(u32::from(count), Ordering::Relaxed) as u16
}

/// Immutable descriptor of a registered event.
///
/// Carries everything the save pipeline needs to emit a
/// `wtf.event#define` record: the wire id, class, flags, and the name spec
/// zipped against the argument type names.
#[derive(Clone, Copy, Debug)]
pub struct EventDefinition {
    wire_id: u16,
    class: EventClass,
    flags: EventFlags,
    name_spec: &'static str,
    type_names: &'static [&'static str],
}

impl EventDefinition {
    /// Creates a definition for the argument list `A`.
    pub fn new<A: EventArguments>(
        wire_id: u16,
        class: EventClass,
        flags: EventFlags,
        name_spec: &'static str,
    ) -> Self {
        Self {
            wire_id,
            class,
            flags,
            name_spec,
            type_names: A::TYPE_NAMES,
        }
    }

    pub fn wire_id(&self) -> u16 {
        self.wire_id
    }

    pub fn class(&self) -> EventClass {
        self.class
    }

    pub fn flags(&self) -> EventFlags {
        self.flags
    }

    /// The event name: the name spec up to its first single `:`, with `::`
    /// rewritten to `#`.
    ///
    /// Colons are separators in WTF's binary format and cannot appear in
    /// identifiers, but `::` is pervasive in source-derived names; `#` is
    /// WTF's class/namespace separator.
    pub fn name(&self) -> String {
        let mut output = String::new();
        let mut rest = self.name_spec;
        while let Some(colon) = rest.find(':') {
            output.push_str(&rest[..colon]);
            let after = &rest[colon + 1..];
            match after.strip_prefix(':') {
                Some(stripped) => {
                    output.push('#');
                    rest = stripped;
                }
                // A single colon ends the name.
                None => return output,
            }
        }
        output.push_str(rest);
        output
    }

    /// The WTF argument signature: type names zipped with the argument
    /// names from the name spec, e.g. `"int32 arg1, ascii a1"`.
    pub fn arguments(&self) -> String {
        let mut output = String::new();
        let mut names = arg_names_suffix(self.name_spec)
            .unwrap_or("")
            .split(is_separator)
            .filter(|name| !name.is_empty());
        for (index, type_name) in self.type_names.iter().enumerate() {
            if !output.is_empty() {
                output.push_str(", ");
            }
            output.push_str(type_name);
            output.push(' ');
            match names.next() {
                Some(name) => output.push_str(name),
                None => {
                    output.push('a');
                    output.push_str(&index.to_string());
                }
            }
        }
        output
    }
}

fn is_separator(c: char) -> bool {
    c <= ' ' || c == ','
}

/// Finds the argument-name suffix of a name spec: everything after the
/// first `:` that is not part of a `::` separator.
fn arg_names_suffix(name_spec: &str) -> Option<&str> {
    let mut rest = name_spec;
    while let Some(colon) = rest.find(':') {
        let after = &rest[colon + 1..];
        match after.strip_prefix(':') {
            Some(stripped) => rest = stripped,
            None => return Some(after),
        }
    }
    None
}

/// Process-wide, append-only registry of event definitions.
pub struct EventRegistry {
    definitions: Mutex<Vec<EventDefinition>>,
}

static EVENT_REGISTRY: LazyLock<EventRegistry> = LazyLock::new(|| EventRegistry {
    definitions: Mutex::new(Vec::new()),
});

impl EventRegistry {
    pub fn global() -> &'static EventRegistry {
        &EVENT_REGISTRY
    }

    /// Appends a definition. Definitions are never removed.
    pub fn add(definition: EventDefinition) {
        Self::global().definitions.lock().push(definition);
    }

    /// Copies the definitions at indices `[from_index, len)`. A copy keeps
    /// callers free of the lock while they emit define records.
    pub fn definitions_from(&self, from_index: usize) -> Vec<EventDefinition> {
        let definitions = self.definitions.lock();
        if from_index >= definitions.len() {
            return Vec::new();
        }
        definitions[from_index..].to_vec()
    }
}

/// An event that can be invoked with a fixed, typed argument list.
///
/// Constructing an event registers its definition and claims a wire id, so
/// sites should construct once (typically in a `LazyLock` static) and invoke
/// many times.
pub struct Event<A: EventArguments> {
    wire_id: u16,
    _args: PhantomData<fn(A)>,
}

impl<A: EventArguments> Event<A> {
    /// Creates a standard instant event.
    pub fn new(name_spec: &'static str) -> Self {
        Self::with_class(EventClass::Instant, EventFlags::NONE, name_spec)
    }

    /// Creates an event whose arguments are appended to the currently
    /// active scope instead of standing alone on the timeline.
    pub fn append_scope(name_spec: &'static str) -> Self {
        Self::with_class(
            EventClass::Instant,
            EventFlags::INTERNAL | EventFlags::APPEND_SCOPE_DATA,
            name_spec,
        )
    }

    /// Creates an event with an auto-assigned wire id.
    pub fn with_class(class: EventClass, flags: EventFlags, name_spec: &'static str) -> Self {
        Self::with_wire_id(next_event_id(), class, flags, name_spec)
    }

    /// Most general constructor, for events of known wire id. In practice
    /// only the primordial define and scope-leave events use this.
    pub fn with_wire_id(
        wire_id: u16,
        class: EventClass,
        flags: EventFlags,
        name_spec: &'static str,
    ) -> Self {
        EventRegistry::add(EventDefinition::new::<A>(wire_id, class, flags, name_spec));
        Self {
            wire_id,
            _args: PhantomData,
        }
    }

    pub fn wire_id(&self) -> u16 {
        self.wire_id
    }

    /// Writes one record of this event into a specific buffer.
    #[inline]
    pub fn invoke_specific(&self, buffer: &mut EventBuffer, values: A::Values<'_>) {
        let (string_table, slots) = buffer.add_record_slots(2 + A::SLOT_COUNT);
        slots[0] = u32::from(self.wire_id);
        slots[1] = platform::timestamp_micros();
        A::emit(values, string_table, &mut slots[2..]);
        buffer.flush();
    }

    /// Invokes the event against the current thread's buffer, if the thread
    /// has been enabled for tracing.
    #[inline]
    pub fn invoke(&self, values: A::Values<'_>) {
        platform::with_thread_event_buffer(|buffer| {
            if let Some(buffer) = buffer {
                self.invoke_specific(buffer, values);
            }
        });
    }
}

/// An event with enter/leave semantics.
///
/// The enter record is an ordinary typed record; the leave is the fixed
/// wire-id-2 record, written directly without a descriptor lookup.
pub struct ScopedEvent<A: EventArguments> {
    event: Event<A>,
}

impl<A: EventArguments> ScopedEvent<A> {
    pub fn new(name_spec: &'static str) -> Self {
        Self {
            event: Event::with_class(EventClass::Scoped, EventFlags::NONE, name_spec),
        }
    }

    pub fn wire_id(&self) -> u16 {
        self.event.wire_id()
    }

    /// Emits the enter record into a specific buffer.
    pub fn enter_specific(&self, buffer: &mut EventBuffer, values: A::Values<'_>) {
        self.event.invoke_specific(buffer, values);
    }

    /// Emits the leave record into a specific buffer.
    pub fn leave_specific(&self, buffer: &mut EventBuffer) {
        let slots = buffer.add_slots(2);
        slots[0] = u32::from(SCOPE_LEAVE_WIRE_ID);
        slots[1] = platform::timestamp_micros();
        buffer.flush();
    }

    /// Emits the enter record against the current thread's buffer, if
    /// enabled.
    pub fn enter(&self, values: A::Values<'_>) {
        platform::with_thread_event_buffer(|buffer| {
            if let Some(buffer) = buffer {
                self.enter_specific(buffer, values);
            }
        });
    }

    /// Emits the leave record against the current thread's buffer, if
    /// enabled.
    pub fn leave(&self) {
        platform::with_thread_event_buffer(|buffer| {
            if let Some(buffer) = buffer {
                self.leave_specific(buffer);
            }
        });
    }

    /// Emits the enter record now and the leave record when the returned
    /// guard drops. A no-op guard is returned when the thread is not
    /// enabled.
    pub fn scope(&self, values: A::Values<'_>) -> ScopeGuard<'_, A> {
        let entered = platform::with_thread_event_buffer(|buffer| match buffer {
            Some(buffer) => {
                self.enter_specific(buffer, values);
                true
            }
            None => false,
        });
        ScopeGuard {
            event: self,
            entered,
        }
    }
}

/// RAII guard pairing a scoped event's enter with its leave.
#[must_use = "dropping the guard immediately closes the scope"]
pub struct ScopeGuard<'a, A: EventArguments> {
    event: &'a ScopedEvent<A>,
    entered: bool,
}

impl<A: EventArguments> Drop for ScopeGuard<'_, A> {
    fn drop(&mut self) {
        if self.entered {
            self.event.leave();
        }
    }
}

/// The standard built-in events every stream carries.
pub mod standard {
    use super::*;

    static DEFINE_EVENT: LazyLock<Event<(u16, u16, u32, Ascii, Ascii)>> = LazyLock::new(|| {
        Event::with_wire_id(
            DEFINE_EVENT_WIRE_ID,
            EventClass::Instant,
            EventFlags::BUILTIN | EventFlags::INTERNAL,
            "wtf.event#define:wireId,eventClass,flags,name,args",
        )
    });

    static SCOPE_LEAVE: LazyLock<Event<()>> = LazyLock::new(|| {
        Event::with_wire_id(
            SCOPE_LEAVE_WIRE_ID,
            EventClass::Instant,
            EventFlags::BUILTIN | EventFlags::INTERNAL,
            "wtf.scope#leave",
        )
    });

    static CREATE_ZONE: LazyLock<Event<(u16, Ascii, Ascii, Ascii)>> = LazyLock::new(|| {
        Event::with_class(
            EventClass::Instant,
            EventFlags::BUILTIN | EventFlags::INTERNAL,
            "wtf.zone#create:zoneId,name,type,location",
        )
    });

    static SET_ZONE: LazyLock<Event<(u16,)>> = LazyLock::new(|| {
        Event::with_class(
            EventClass::Instant,
            EventFlags::BUILTIN | EventFlags::INTERNAL,
            "wtf.zone#set:zoneId",
        )
    });

    static FRAME_START: LazyLock<Event<(u32,)>> = LazyLock::new(|| {
        Event::with_class(
            EventClass::Instant,
            EventFlags::INTERNAL,
            "wtf.timing#frameStart:number",
        )
    });

    static FRAME_END: LazyLock<Event<(u32,)>> = LazyLock::new(|| {
        Event::with_class(
            EventClass::Instant,
            EventFlags::INTERNAL,
            "wtf.timing#frameEnd:number",
        )
    });

    /// Forces registration of every standard event. The runtime calls this
    /// at construction so the first save's definition chunk is complete and
    /// the builtin wire ids are claimed before any user event.
    pub(crate) fn register_all() {
        LazyLock::force(&DEFINE_EVENT);
        LazyLock::force(&SCOPE_LEAVE);
        LazyLock::force(&CREATE_ZONE);
        LazyLock::force(&SET_ZONE);
        LazyLock::force(&FRAME_START);
        LazyLock::force(&FRAME_END);
    }

    /// Writes a `wtf.event#define` record describing another event.
    pub fn define_event(
        buffer: &mut EventBuffer,
        wire_id: u16,
        class: EventClass,
        flags: EventFlags,
        name: &str,
        args: &str,
    ) {
        DEFINE_EVENT.invoke_specific(buffer, (wire_id, class as u16, flags.bits(), name, args));
    }

    /// Writes a scope-leave record.
    pub fn scope_leave(buffer: &mut EventBuffer) {
        SCOPE_LEAVE.invoke_specific(buffer, ());
    }

    /// Writes a `wtf.zone#create` record for an already-allocated zone id.
    pub fn create_zone(
        buffer: &mut EventBuffer,
        zone_id: u16,
        name: &str,
        zone_type: &str,
        location: &str,
    ) {
        CREATE_ZONE.invoke_specific(buffer, (zone_id, name, zone_type, location));
    }

    /// Writes a `wtf.zone#set` record switching the buffer's active zone.
    pub fn set_zone(buffer: &mut EventBuffer, zone_id: u16) {
        SET_ZONE.invoke_specific(buffer, (zone_id,));
    }

    /// Notes the start of a frame.
    pub fn frame_start(buffer: &mut EventBuffer, number: u32) {
        FRAME_START.invoke_specific(buffer, (number,));
    }

    /// Notes the end of a frame.
    pub fn frame_end(buffer: &mut EventBuffer, number: u32) {
        FRAME_END.invoke_specific(buffer, (number,));
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::output::{OutputSink, PartHeader};
    use crate::test::extract_slots;

    fn definition<A: EventArguments>(name_spec: &'static str) -> EventDefinition {
        EventDefinition::new::<A>(0, EventClass::Instant, EventFlags::NONE, name_spec)
    }

    #[test]
    fn name_rewrites_namespace_separators() {
        let def = definition::<(i32, Ascii)>("MyNamespace::MyClass::MyFunc: arg1, arg2");
        assert_eq!(def.name(), "MyNamespace#MyClass#MyFunc");
        assert_eq!(def.arguments(), "int32 arg1, ascii arg2");
    }

    #[test]
    fn missing_argument_names_are_generated() {
        let def = definition::<(i32, Ascii)>("MyFunc3: arg1");
        assert_eq!(def.name(), "MyFunc3");
        assert_eq!(def.arguments(), "int32 arg1, ascii a1");
    }

    #[test]
    fn name_without_arguments_passes_through() {
        let def = definition::<()>("wtf.scope#leave");
        assert_eq!(def.name(), "wtf.scope#leave");
        assert_eq!(def.arguments(), "");
    }

    #[test]
    fn argument_names_skip_separator_runs() {
        let def = definition::<(u32, u32, u32)>("f:  a ,,  b\t, c ");
        assert_eq!(def.arguments(), "uint32 a, uint32 b, uint32 c");
    }

    #[test]
    fn all_names_generated_when_list_is_empty() {
        let def = definition::<(u32, bool)>("Class::method");
        assert_eq!(def.name(), "Class#method");
        assert_eq!(def.arguments(), "uint32 a0, bool a1");
    }

    #[test]
    fn event_ids_allocate_past_reserved_range() {
        let first = next_event_id();
        assert!(first > SCOPE_LEAVE_WIRE_ID);
        let block = next_event_ids(4);
        assert!(block > first);
        // Other tests may be allocating concurrently; the block is only
        // guaranteed to be reserved, not to be the latest allocation.
        assert!(next_event_id() >= block + 4);
    }

    #[test]
    fn registry_snapshots_from_index() {
        let before = EventRegistry::global().definitions_from(0).len();
        let event = Event::<(u32,)>::new("RegistrySnapshot::probe:value");
        let all = EventRegistry::global().definitions_from(before);
        assert!(all.iter().any(|def| def.wire_id() == event.wire_id()));

        let none = EventRegistry::global().definitions_from(usize::MAX);
        assert!(none.is_empty());
    }

    #[test]
    fn invoke_specific_writes_one_record() {
        let event = Event::<(i32, Ascii)>::new("InvokeTest::event: i, s");
        let mut buffer = EventBuffer::new();
        event.invoke_specific(&mut buffer, (-5, "payload"));

        let mut header = PartHeader::default();
        buffer.populate_header(&mut header);
        assert_eq!(header.length, 4 * 4);

        let mut sink = OutputSink::new(Vec::new());
        buffer.write_to(&header, &mut sink, false).unwrap();
        let slots = extract_slots(&sink.into_inner());
        assert_eq!(slots[0], u32::from(event.wire_id()));
        assert_eq!(slots[2], (-5i32) as u32);
        assert_eq!(slots[3], 0); // first interned string
        assert_eq!(buffer.string_table().get_string_id("payload"), 0);
    }

    #[test]
    fn scoped_event_pairs_enter_with_fixed_leave() {
        let event = ScopedEvent::<(u32,)>::new("ScopeTest::section: n");
        let mut buffer = EventBuffer::new();
        event.enter_specific(&mut buffer, (9,));
        event.leave_specific(&mut buffer);

        let mut header = PartHeader::default();
        buffer.populate_header(&mut header);
        assert_eq!(header.length, (3 + 2) * 4);

        let mut sink = OutputSink::new(Vec::new());
        buffer.write_to(&header, &mut sink, false).unwrap();
        let slots = extract_slots(&sink.into_inner());
        assert_eq!(slots[0], u32::from(event.wire_id()));
        assert_eq!(slots[2], 9);
        assert_eq!(slots[3], u32::from(SCOPE_LEAVE_WIRE_ID));
    }

    #[test]
    fn invoke_without_enabled_thread_is_a_noop() {
        // No thread-local buffer installed in this test thread.
        let event = Event::<(u32,)>::new("NoopTest::event: n");
        event.invoke((1,));
    }

    #[test]
    fn scope_guard_emits_leave_on_drop() {
        std::thread::spawn(|| {
            let event = ScopedEvent::<(u32,)>::new("GuardTest::section: n");
            crate::platform::set_thread_event_buffer(Some(EventBuffer::new()));
            {
                let _guard = event.scope((3,));
            }
            let buffer = crate::platform::set_thread_event_buffer(None).unwrap();

            let mut header = PartHeader::default();
            buffer.populate_header(&mut header);
            assert_eq!(header.length, (3 + 2) * 4);

            let mut sink = OutputSink::new(Vec::new());
            buffer.write_to(&header, &mut sink, false).unwrap();
            let slots = extract_slots(&sink.into_inner());
            assert_eq!(slots[0], u32::from(event.wire_id()));
            assert_eq!(slots[2], 3);
            assert_eq!(slots[3], u32::from(SCOPE_LEAVE_WIRE_ID));
        })
        .join()
        .unwrap();
    }

    #[test]
    fn standard_frame_events_write_numbers() {
        let mut buffer = EventBuffer::new();
        standard::frame_start(&mut buffer, 42);
        standard::frame_end(&mut buffer, 43);

        let mut header = PartHeader::default();
        buffer.populate_header(&mut header);
        assert_eq!(header.length, 6 * 4);

        let mut sink = OutputSink::new(Vec::new());
        buffer.write_to(&header, &mut sink, false).unwrap();
        let slots = extract_slots(&sink.into_inner());
        assert_eq!(slots[2], 42);
        assert_eq!(slots[5], 43);
        // Start and end are distinct registered events.
        assert_ne!(slots[0], slots[3]);
    }

    #[test]
    fn append_scope_events_carry_the_append_flag() {
        let event = Event::<(u32,)>::append_scope("AppendTest::extra: n");
        let definitions = EventRegistry::global().definitions_from(0);
        let definition = definitions
            .iter()
            .find(|def| def.wire_id() == event.wire_id())
            .expect("registered definition");
        assert!(definition.flags().contains(EventFlags::APPEND_SCOPE_DATA));
        assert!(definition.flags().contains(EventFlags::INTERNAL));
    }

    #[test]
    fn flags_combine() {
        let flags = EventFlags::BUILTIN | EventFlags::INTERNAL;
        assert!(flags.contains(EventFlags::BUILTIN));
        assert!(flags.contains(EventFlags::INTERNAL));
        assert!(!flags.contains(EventFlags::APPEND_SCOPE_DATA));
        assert_eq!(flags.bits(), (1 << 5) | (1 << 3));
    }
}
