//! Shared table of canonical strings.
//!
//! Event arguments never carry inline strings: every string flows through a
//! table and is referenced by its dense id. Ids are the zero-based insertion
//! index and are stable for the lifetime of the table. The table is keyed on
//! raw bytes because the wire payload is a run of NUL-terminated byte
//! strings, with no encoding requirement.

use std::collections::HashMap;
use std::io::Write;

use parking_lot::Mutex;

use crate::output::{OutputSink, PartHeader, WriteError, PART_TYPE_STRING_TABLE};

#[derive(Default)]
struct Inner {
    strings: Vec<Box<[u8]>>,
    ids: HashMap<Box<[u8]>, i32>,
}

/// Deduplicating, id-allocating string table.
///
/// Thread safe; one mutex guards all operations. The table only grows, which
/// is what allows [`StringTable::write_to`] to serialize exactly the amount a
/// prior [`StringTable::populate_header`] recorded while writers keep
/// interning: strings added in between are picked up by the next snapshot.
#[derive(Default)]
pub struct StringTable {
    inner: Mutex<Inner>,
}

impl StringTable {
    /// Id reserved for the empty string, which is never stored.
    pub const EMPTY_STRING_ID: i32 = -1;

    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the id for `s`, interning it on first sight.
    ///
    /// The empty string is filtered here and always maps to
    /// [`Self::EMPTY_STRING_ID`] without touching the table.
    pub fn get_string_id(&self, s: impl AsRef<[u8]>) -> i32 {
        let s = s.as_ref();
        if s.is_empty() {
            return Self::EMPTY_STRING_ID;
        }

        let mut inner = self.inner.lock();
        if let Some(id) = inner.ids.get(s) {
            return *id;
        }
        let id = inner.strings.len() as i32;
        inner.strings.push(s.into());
        inner.ids.insert(s.into(), id);
        id
    }

    /// Snapshots the serialized size of the table into `header`.
    ///
    /// Call this *after* anything that may have contributed strings, so the
    /// snapshot covers at least every id already referenced.
    pub fn populate_header(&self, header: &mut PartHeader) {
        let inner = self.inner.lock();
        let raw_length: usize = inner.strings.iter().map(|s| s.len() + 1).sum();
        header.part_type = PART_TYPE_STRING_TABLE;
        header.offset = 0;
        header.length = raw_length as u32;
    }

    /// Writes the table payload bounded by a previously-populated `header`.
    ///
    /// Each stored string is written with its NUL terminator, in insertion
    /// order, stopping once the recorded length is reached; the table may
    /// have grown since the snapshot. Ends with sink alignment. Fails with
    /// [`WriteError::StringTableSizeMismatch`] if the stored bytes fall
    /// short of the recorded length.
    pub fn write_to<W: Write>(
        &self,
        header: &PartHeader,
        sink: &mut OutputSink<W>,
    ) -> Result<(), WriteError> {
        let inner = self.inner.lock();
        let expected_raw_length = header.length as usize;
        let mut raw_length = 0;
        for s in &inner.strings {
            if raw_length == expected_raw_length {
                break;
            }
            raw_length += s.len() + 1;
            if raw_length > expected_raw_length {
                return Err(WriteError::StringTableSizeMismatch {
                    expected: header.length,
                });
            }
            sink.append(s)?;
            sink.append(&[0])?;
        }
        if raw_length < expected_raw_length {
            return Err(WriteError::StringTableSizeMismatch {
                expected: header.length,
            });
        }
        sink.align()
    }
}

impl std::fmt::Debug for StringTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StringTable")
            .field("len", &self.inner.lock().strings.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    use super::*;
    use crate::output::{ChunkHeader, PART_TYPE_STRING_TABLE};
    use crate::test::extract_slots;

    const DEFAULT_CHUNK_HEADER: ChunkHeader = ChunkHeader {
        id: 1,
        chunk_type: 2,
        start_time: 3,
        end_time: 4,
    };

    #[test]
    fn dedups_and_allocates_in_insertion_order() {
        let table = StringTable::new();
        let id1 = table.get_string_id("Hello");
        let id2 = table.get_string_id("Goodbye");
        let id3 = table.get_string_id("Hello");
        assert_eq!(id1, 0);
        assert_eq!(id3, id1);
        assert_eq!(id2, id1 + 1);
    }

    #[test]
    fn empty_string_is_filtered() {
        let table = StringTable::new();
        assert_eq!(table.get_string_id(""), StringTable::EMPTY_STRING_ID);

        // Nothing was stored: the table still serializes to zero bytes and
        // the next real string gets id 0.
        let mut header = PartHeader::default();
        table.populate_header(&mut header);
        assert_eq!(header.length, 0);
        assert_eq!(table.get_string_id("a"), 0);
    }

    #[test]
    fn serialize_empty_table() {
        let table = StringTable::new();
        assert_eq!(table.get_string_id(""), StringTable::EMPTY_STRING_ID);

        let mut header = PartHeader::default();
        table.populate_header(&mut header);

        let mut sink = OutputSink::new(Vec::new());
        sink.start_chunk(DEFAULT_CHUNK_HEADER, std::slice::from_mut(&mut header))
            .unwrap();
        table.write_to(&header, &mut sink).unwrap();

        let out = sink.into_inner();
        assert_eq!(out.len() % 4, 0);
        assert_eq!(
            extract_slots(&out),
            vec![1, 2, 36, 3, 4, 1, PART_TYPE_STRING_TABLE, 0, 0]
        );
    }

    #[test]
    fn serialize_one_byte_string() {
        let table = StringTable::new();
        assert_eq!(table.get_string_id(b"\xee"), 0);

        let mut header = PartHeader::default();
        table.populate_header(&mut header);

        let mut sink = OutputSink::new(Vec::new());
        sink.start_chunk(DEFAULT_CHUNK_HEADER, std::slice::from_mut(&mut header))
            .unwrap();
        table.write_to(&header, &mut sink).unwrap();

        let out = sink.into_inner();
        assert_eq!(out.len() % 4, 0);
        assert_eq!(
            extract_slots(&out),
            vec![
                1,
                2,
                40,
                3,
                4,
                1,
                PART_TYPE_STRING_TABLE,
                0,
                2,      // "\xee" plus NUL terminator
                0x00ee, // payload, padded out with alignment zeros
            ]
        );
    }

    #[test]
    fn write_is_bounded_by_snapshot() {
        let table = StringTable::new();
        table.get_string_id("one");

        let mut header = PartHeader::default();
        table.populate_header(&mut header);

        // Grow the table after the snapshot; only the snapshotted amount is
        // serialized.
        table.get_string_id("two");

        let mut sink = OutputSink::new(Vec::new());
        table.write_to(&header, &mut sink).unwrap();
        assert_eq!(sink.into_inner(), b"one\0");
    }

    #[test]
    fn oversized_header_is_a_size_mismatch() {
        let table = StringTable::new();
        table.get_string_id("one");

        let mut header = PartHeader::default();
        table.populate_header(&mut header);
        header.length += 1;

        let mut sink = OutputSink::new(Vec::new());
        let result = table.write_to(&header, &mut sink);
        assert!(matches!(
            result,
            Err(WriteError::StringTableSizeMismatch { .. })
        ));
    }

    #[test]
    fn concurrent_interning_yields_stable_ids() {
        let table = Arc::new(StringTable::new());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let table = Arc::clone(&table);
            handles.push(thread::spawn(move || {
                (0..100)
                    .map(|i| (i, table.get_string_id(format!("string-{i}"))))
                    .collect::<Vec<_>>()
            }));
        }
        let ids: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        // Every thread resolved every string to the same id.
        for per_thread in &ids[1..] {
            for ((i, id), (j, expected)) in per_thread.iter().zip(ids[0].iter()) {
                assert_eq!(i, j);
                assert_eq!(id, expected);
            }
        }
    }

    proptest! {
        #[test]
        fn ids_are_dense_and_stable(strings in proptest::collection::vec("[a-z]{1,12}", 1..64)) {
            let table = StringTable::new();
            let first_pass: Vec<i32> = strings.iter().map(|s| table.get_string_id(s)).collect();
            let second_pass: Vec<i32> = strings.iter().map(|s| table.get_string_id(s)).collect();
            prop_assert_eq!(&first_pass, &second_pass);

            let mut unique = first_pass.clone();
            unique.sort_unstable();
            unique.dedup();
            // Dense: ids cover 0..N for N distinct strings.
            prop_assert_eq!(unique, (0..unique_count(&strings) as i32).collect::<Vec<_>>());
        }
    }

    fn unique_count(strings: &[String]) -> usize {
        let mut sorted: Vec<_> = strings.to_vec();
        sorted.sort();
        sorted.dedup();
        sorted.len()
    }
}
