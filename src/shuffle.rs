//! Intermediate record codec and key partitioner.
//!
//! Each intermediate partition blob is a sequence of length-prefixed
//! (key, value) records: `u32-le key_len, key bytes, u32-le value_len,
//! value bytes`, both UTF-8. Readers depend on this layout (spec'd wire
//! contract), so it lives here rather than behind a serde codec.

use crate::error::{MapredError, Result};

/// Append one (key, value) record to `buf`.
pub fn encode_record(buf: &mut Vec<u8>, key: &str, value: &str) {
    buf.extend_from_slice(&(key.len() as u32).to_le_bytes());
    buf.extend_from_slice(key.as_bytes());
    buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
    buf.extend_from_slice(value.as_bytes());
}

/// Decode all records in a partition blob.
pub fn decode_records(data: &[u8]) -> Result<Vec<(String, String)>> {
    let mut records = Vec::new();
    let mut offset = 0usize;
    while offset < data.len() {
        let key = read_chunk(data, &mut offset)?;
        let value = read_chunk(data, &mut offset)?;
        records.push((key, value));
    }
    Ok(records)
}

fn read_chunk(data: &[u8], offset: &mut usize) -> Result<String> {
    let header_end = *offset + 4;
    if header_end > data.len() {
        return Err(MapredError::Internal(
            "truncated intermediate record header".to_string(),
        ));
    }
    let len = u32::from_le_bytes(data[*offset..header_end].try_into().unwrap()) as usize;
    let body_end = header_end + len;
    if body_end > data.len() {
        return Err(MapredError::Internal(
            "truncated intermediate record body".to_string(),
        ));
    }
    let chunk = std::str::from_utf8(&data[header_end..body_end])
        .map_err(|e| MapredError::Internal(format!("non-UTF-8 intermediate record: {e}")))?
        .to_string();
    *offset = body_end;
    Ok(chunk)
}

/// Reduce partition for a key: `fnv1a(key) mod num_reduces`.
///
/// FNV-1a with fixed constants, so every worker process partitions a key
/// identically. `std`'s default hasher is seeded per process and would
/// scatter one key across reducers.
pub fn partition_for_key(key: &str, num_reduces: u32) -> u32 {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

    let mut hash = FNV_OFFSET;
    for byte in key.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    (hash % u64::from(num_reduces.max(1))) as u32
}
