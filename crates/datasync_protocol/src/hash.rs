//! Deterministic hashing of records and dataset state.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Computes record hashes and dataset-wide global hashes.
///
/// Hashes identify record versions: the server compares the hash of its
/// current copy of a record with the base hash a client submitted to
/// decide whether the record changed underneath the client. Implementations
/// must be deterministic across processes and restarts.
pub trait HashProvider: Send + Sync {
    /// Hash of a single record's content.
    fn record_hash(&self, dataset_id: &str, record: &Value) -> String;

    /// Hash summarizing a dataset state from its record hashes.
    ///
    /// Must not depend on the order of `record_hashes`.
    fn global_hash(&self, dataset_id: &str, record_hashes: &[String]) -> String;
}

/// SHA-256 over the canonical JSON encoding, hex encoded.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256HashProvider;

impl Sha256HashProvider {
    /// Hex-encoded SHA-256 of a string.
    pub fn digest(input: &str) -> String {
        hex::encode(Sha256::digest(input.as_bytes()))
    }
}

impl HashProvider for Sha256HashProvider {
    fn record_hash(&self, _dataset_id: &str, record: &Value) -> String {
        Self::digest(&canonical_json(record))
    }

    fn global_hash(&self, _dataset_id: &str, record_hashes: &[String]) -> String {
        let mut sorted: Vec<&str> = record_hashes.iter().map(String::as_str).collect();
        sorted.sort_unstable();
        Self::digest(&sorted.join(""))
    }
}

/// Encodes a JSON value with object keys sorted and no whitespace.
///
/// Two values that are equal as JSON always produce the same string,
/// regardless of key insertion order.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                if let Some(v) = map.get(key) {
                    write_canonical(v, out);
                }
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}
