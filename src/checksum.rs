//! Deterministic payload checksums for conflict detection.
//!
//! Two payloads that differ only in key order or in volatile fields
//! (timestamps, version counters) must hash identically, so the canonical
//! form visits object keys in sorted order and skips the configured volatile
//! names at every nesting level. Scalars are tagged and strings
//! length-prefixed so distinct shapes can never collide structurally.

use std::collections::BTreeMap;

use serde_json::Value;

pub const CHECKSUM_LEN: usize = 32;

pub type Checksum = [u8; CHECKSUM_LEN];

/// Blake3 over the canonical serialization of `value`, excluding any object
/// field whose name appears in `volatile_fields`.
pub fn payload_checksum(value: &Value, volatile_fields: &[String]) -> Checksum {
    let mut bytes = Vec::new();
    canonicalize(value, volatile_fields, &mut bytes);
    *blake3::hash(&bytes).as_bytes()
}

pub fn checksums_match(a: &Checksum, b: &Checksum) -> bool {
    a == b
}

pub fn to_hex(checksum: &Checksum) -> String {
    hex::encode(checksum)
}

fn canonicalize(value: &Value, volatile: &[String], out: &mut Vec<u8>) {
    match value {
        Value::Null => out.push(b'z'),
        Value::Bool(b) => {
            out.push(b'b');
            out.push(u8::from(*b));
        }
        Value::Number(n) => {
            out.push(b'n');
            let repr = n.to_string();
            out.extend_from_slice(&(repr.len() as u64).to_le_bytes());
            out.extend_from_slice(repr.as_bytes());
        }
        Value::String(s) => {
            out.push(b's');
            out.extend_from_slice(&(s.len() as u64).to_le_bytes());
            out.extend_from_slice(s.as_bytes());
        }
        Value::Array(items) => {
            out.push(b'a');
            out.extend_from_slice(&(items.len() as u64).to_le_bytes());
            for item in items {
                canonicalize(item, volatile, out);
            }
        }
        Value::Object(map) => {
            // BTreeMap gives the sorted key order regardless of insertion.
            let sorted: BTreeMap<&String, &Value> = map
                .iter()
                .filter(|(key, _)| !volatile.iter().any(|v| v == *key))
                .collect();
            out.push(b'o');
            out.extend_from_slice(&(sorted.len() as u64).to_le_bytes());
            for (key, item) in sorted {
                out.push(b'k');
                out.extend_from_slice(&(key.len() as u64).to_le_bytes());
                out.extend_from_slice(key.as_bytes());
                canonicalize(item, volatile, out);
            }
        }
    }
}
