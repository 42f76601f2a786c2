//! Shared helpers for unit tests: slot extraction and a decoder for the
//! chunked wire format, so tests can assert on what a consumer would see.

use crate::runtime::{FILE_MAGIC, FORMAT_TAG, FORMAT_VERSION};

/// Reinterprets serialized output as little-endian 32-bit slots.
pub fn extract_slots(bytes: &[u8]) -> Vec<u32> {
    assert_eq!(bytes.len() % 4, 0, "output must be 4-byte aligned");
    bytes
        .chunks_exact(4)
        .map(|word| u32::from_le_bytes(word.try_into().unwrap()))
        .collect()
}

#[derive(Debug)]
pub struct DecodedPart {
    pub part_type: u32,
    /// Unpadded payload, exactly `length` bytes.
    pub payload: Vec<u8>,
}

impl DecodedPart {
    pub fn slots(&self) -> Vec<u32> {
        extract_slots(&self.payload)
    }

    /// Splits a string-table payload into its stored strings.
    pub fn strings(&self) -> Vec<String> {
        self.payload
            .split(|byte| *byte == 0)
            .filter(|s| !s.is_empty())
            .map(|s| String::from_utf8_lossy(s).into_owned())
            .collect()
    }
}

#[derive(Debug)]
pub struct DecodedChunk {
    pub id: u32,
    pub chunk_type: u32,
    pub start_time: u32,
    pub end_time: u32,
    pub parts: Vec<DecodedPart>,
}

impl DecodedChunk {
    pub fn part(&self, part_type: u32) -> &DecodedPart {
        self.parts
            .iter()
            .find(|part| part.part_type == part_type)
            .unwrap_or_else(|| panic!("chunk {} has no part of type {part_type:#x}", self.id))
    }
}

/// Decoded view of a serialized stream: whether it opened with the file
/// prefix, and every chunk in order.
#[derive(Debug)]
pub struct DecodedStream {
    pub has_file_prefix: bool,
    pub chunks: Vec<DecodedChunk>,
}

impl DecodedStream {
    /// Events chunks in stream order.
    pub fn event_chunks(&self) -> Vec<&DecodedChunk> {
        self.chunks
            .iter()
            .filter(|chunk| chunk.chunk_type == crate::output::CHUNK_TYPE_EVENTS)
            .collect()
    }
}

fn read_u32(bytes: &[u8], pos: usize) -> u32 {
    u32::from_le_bytes(bytes[pos..pos + 4].try_into().unwrap())
}

/// Decodes a serialized stream, validating the file prefix (when present),
/// chunk lengths, and part layout along the way.
pub fn decode_stream(bytes: &[u8]) -> DecodedStream {
    let mut pos = 0;
    let has_file_prefix = bytes.len() >= 12 && read_u32(bytes, 0) == FILE_MAGIC;
    if has_file_prefix {
        assert_eq!(read_u32(bytes, 4), FORMAT_TAG);
        assert_eq!(read_u32(bytes, 8), FORMAT_VERSION);
        pos = 12;
    }

    let mut chunks = Vec::new();
    while pos < bytes.len() {
        let chunk_start = pos;
        let id = read_u32(bytes, pos);
        let chunk_type = read_u32(bytes, pos + 4);
        let chunk_length = read_u32(bytes, pos + 8) as usize;
        let start_time = read_u32(bytes, pos + 12);
        let end_time = read_u32(bytes, pos + 16);
        let part_count = read_u32(bytes, pos + 20) as usize;
        pos += 24;

        let mut descriptors = Vec::with_capacity(part_count);
        for _ in 0..part_count {
            descriptors.push((
                read_u32(bytes, pos),
                read_u32(bytes, pos + 4),
                read_u32(bytes, pos + 8),
            ));
            pos += 12;
        }

        // Part offsets are relative to the end of the descriptor array.
        let payload_base = pos;
        let mut parts = Vec::with_capacity(part_count);
        for (part_type, offset, length) in descriptors {
            let start = payload_base + offset as usize;
            parts.push(DecodedPart {
                part_type,
                payload: bytes[start..start + length as usize].to_vec(),
            });
        }

        assert!(
            chunk_start + chunk_length <= bytes.len(),
            "chunk length overruns the stream"
        );
        pos = chunk_start + chunk_length;

        chunks.push(DecodedChunk {
            id,
            chunk_type,
            start_time,
            end_time,
            parts,
        });
    }

    DecodedStream {
        has_file_prefix,
        chunks,
    }
}
