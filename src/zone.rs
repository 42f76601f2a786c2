//! Zones: the logical producers of a trace (threads, tasks, external
//! entities), and the process-wide registry that names them.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::LazyLock;

use parking_lot::Mutex;

use crate::buffer::EventBuffer;
use crate::event::standard;

/// Zone type used for pooled task buffers.
pub const ZONE_TYPE_TASK: &str = "TASK";

/// A named producer in the trace.
#[derive(Clone, Debug)]
pub struct ZoneDefinition {
    pub id: u16,
    pub name: String,
    pub zone_type: String,
    pub location: String,
}

/// Process-wide, append-only registry of zones. Zone ids start at 1.
pub struct ZoneRegistry {
    next_zone_id: AtomicU16,
    definitions: Mutex<Vec<ZoneDefinition>>,
}

static ZONE_REGISTRY: LazyLock<ZoneRegistry> = LazyLock::new(|| ZoneRegistry {
    next_zone_id: AtomicU16::new(1),
    definitions: Mutex::new(Vec::new()),
});

impl ZoneRegistry {
    pub fn global() -> &'static ZoneRegistry {
        &ZONE_REGISTRY
    }

    /// Registers a new zone and returns its id.
    pub fn create_zone(&self, name: &str, zone_type: &str, location: &str) -> u16 {
        let mut definitions = self.definitions.lock();
        let id = self.next_zone_id.fetch_add(1, Ordering::Relaxed);
        definitions.push(ZoneDefinition {
            id,
            name: name.to_string(),
            zone_type: zone_type.to_string(),
            location: location.to_string(),
        });
        id
    }

    /// Writes a `wtf.zone#create` record into `buffer` for every zone at
    /// indices `[from_index, len)`. Returns the new end index, to be fed
    /// back in on the next incremental emission.
    pub fn emit_zones(&self, buffer: &mut EventBuffer, from_index: usize) -> usize {
        let definitions = self.definitions.lock();
        for definition in definitions.iter().skip(from_index) {
            standard::create_zone(
                buffer,
                definition.id,
                &definition.name,
                &definition.zone_type,
                &definition.location,
            );
        }
        definitions.len()
    }
}
