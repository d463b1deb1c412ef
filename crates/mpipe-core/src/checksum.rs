//! Content digests used to suppress redundant writes to a target.

use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};

use crate::Document;

/// Top-level keys that change on every rebuild without reflecting new content.
pub const VOLATILE_KEYS: &[&str] = &[
    "ctime",
    "mtime",
    "modtime",
    "indexstamp",
    "update_timestamp",
    "metadata_mtime",
    "nonbib_mtime",
    "fulltext_mtime",
    "orcid_mtime",
    "metrics_mtime",
];

/// 32-bit digest of a document, formatted as `0x` + 8 lowercase hex digits.
///
/// Volatile keys are dropped and the remainder is serialized with sorted keys at
/// every depth, so two documents that differ only in key order or timestamps
/// produce the same digest.
pub fn digest(document: &Document) -> String {
    let mut canonical = String::new();
    canonical.push('{');
    let mut first = true;
    let mut keys = document
        .keys()
        .filter(|k| !VOLATILE_KEYS.contains(&k.as_str()))
        .collect::<Vec<_>>();
    keys.sort();
    for key in keys {
        if !first {
            canonical.push(',');
        }
        first = false;
        write_key(key, &mut canonical);
        write_canonical(&document[key.as_str()], &mut canonical);
    }
    canonical.push('}');

    let hash = Sha256::digest(canonical.as_bytes());
    format!("0x{}", hex::encode(&hash[..4]))
}

/// True when the stored checksum proves the target already holds this content.
pub fn unchanged(stored: Option<&str>, candidate: &str) -> bool {
    stored.is_some_and(|s| s == candidate)
}

fn write_key(key: &str, out: &mut String) {
    out.push_str(&JsonValue::String(key.to_string()).to_string());
    out.push(':');
}

fn write_canonical(value: &JsonValue, out: &mut String) {
    match value {
        JsonValue::Object(map) => {
            out.push('{');
            let mut keys = map.keys().collect::<Vec<_>>();
            keys.sort();
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_key(key, out);
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        JsonValue::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
