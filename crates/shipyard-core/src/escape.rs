//! Storage-safe escaping for map keys.
//!
//! Event types such as `sh.keptn.event.deployment.finished` are used as map keys
//! inside persisted documents. Document stores address nested fields with
//! dot-separated paths, so a literal `.` inside a key must never reach storage.
//!
//! The scheme escapes the escape character first and the dot second:
//!
//! | Raw | Stored |
//! |-----|--------|
//! | `~` | `~t`   |
//! | `.` | `~p`   |
//!
//! Every `~` in an encoded key starts an escape, which makes decoding a single
//! left-to-right pass and the mapping lossless.

use std::collections::BTreeMap;

const ESCAPE: char = '~';
const ESCAPED_ESCAPE: char = 't';
const ESCAPED_DOT: char = 'p';

/// Encodes a key for storage.
#[must_use]
pub fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for c in key.chars() {
        match c {
            ESCAPE => {
                out.push(ESCAPE);
                out.push(ESCAPED_ESCAPE);
            }
            '.' => {
                out.push(ESCAPE);
                out.push(ESCAPED_DOT);
            }
            other => out.push(other),
        }
    }
    out
}

/// Decodes a key previously produced by [`encode_key`].
///
/// Unknown escape sequences are passed through verbatim.
#[must_use]
pub fn decode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    let mut chars = key.chars();
    while let Some(c) = chars.next() {
        if c != ESCAPE {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some(ESCAPED_ESCAPE) => out.push(ESCAPE),
            Some(ESCAPED_DOT) => out.push('.'),
            Some(other) => {
                out.push(ESCAPE);
                out.push(other);
            }
            None => out.push(ESCAPE),
        }
    }
    out
}

/// Serde adapter that escapes the keys of a string-keyed map.
///
/// Use with `#[serde(with = "shipyard_core::escape::escaped_keys")]`.
pub mod escaped_keys {
    use super::{BTreeMap, decode_key, encode_key};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    /// Serializes the map with encoded keys.
    pub fn serialize<V, S>(map: &BTreeMap<String, V>, serializer: S) -> Result<S::Ok, S::Error>
    where
        V: Serialize,
        S: Serializer,
    {
        let encoded: BTreeMap<String, &V> = map.iter().map(|(k, v)| (encode_key(k), v)).collect();
        encoded.serialize(serializer)
    }

    /// Deserializes the map, decoding every key.
    pub fn deserialize<'de, V, D>(deserializer: D) -> Result<BTreeMap<String, V>, D::Error>
    where
        V: Deserialize<'de>,
        D: Deserializer<'de>,
    {
        let raw = BTreeMap::<String, V>::deserialize(deserializer)?;
        Ok(raw.into_iter().map(|(k, v)| (decode_key(&k), v)).collect())
    }
}
