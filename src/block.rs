//! Hash-identified blocks and their canonical digest

use crate::crypto::sha256_hex;
use crate::error::{ChainSyncError, IntegrityError, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Previous-hash sentinel carried by every genesis block
pub const GENESIS_PREVIOUS_HASH: &str = "0";

/// Block content: string keys in insertion order, arbitrary JSON values
pub type Payload = IndexMap<String, Value>;

/// An immutable record in the hash chain.
///
/// Fields are only readable through accessors so a block cannot change after
/// construction. `Block::seal` is the producer path and derives the hash;
/// `Block::new` and deserialization take the hash as claimed, to be checked
/// with [`Block::validate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    index: u64,
    previous_hash: String,
    timestamp: u64,
    payload: Payload,
    hash: String,
}

impl Block {
    /// Store the five fields verbatim without hashing or verifying anything
    pub fn new(
        index: u64,
        previous_hash: impl Into<String>,
        timestamp: u64,
        payload: Payload,
        hash: impl Into<String>,
    ) -> Self {
        Self {
            index,
            previous_hash: previous_hash.into(),
            timestamp,
            payload,
            hash: hash.into(),
        }
    }

    /// Build a block whose hash is derived from its content
    pub fn seal(
        index: u64,
        previous_hash: impl Into<String>,
        timestamp: u64,
        payload: Payload,
    ) -> Self {
        let previous_hash = previous_hash.into();
        let hash = Self::calculate_hash(index, &previous_hash, timestamp, &payload);
        Self::new(index, previous_hash, timestamp, payload, hash)
    }

    /// Create the index-0 block stamped with the current time
    pub fn genesis() -> Self {
        Self::seal(0, GENESIS_PREVIOUS_HASH, now_millis(), Payload::new())
    }

    /// Digest of the four content fields.
    ///
    /// The fields are hashed as one RFC 8785 (JCS) canonical JSON array of
    /// the decimal index, the previous hash, the decimal timestamp and the
    /// payload. Keys are sorted at every depth, so two producers that build
    /// the same mapping in a different order agree, and the array framing
    /// keeps adjacent fields from running into each other.
    pub fn calculate_hash(
        index: u64,
        previous_hash: &str,
        timestamp: u64,
        payload: &Payload,
    ) -> String {
        sha256_hex(&hash_preimage(index, previous_hash, timestamp, payload))
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn previous_hash(&self) -> &str {
        &self.previous_hash
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn is_genesis(&self) -> bool {
        self.index == 0 && self.previous_hash == GENESIS_PREVIOUS_HASH
    }

    /// Recompute the hash from the stored content fields
    pub fn compute_hash(&self) -> String {
        Self::calculate_hash(self.index, &self.previous_hash, self.timestamp, &self.payload)
    }

    /// Check the stored hash against the content
    pub fn verify_hash(&self) -> bool {
        self.hash == self.compute_hash()
    }

    /// Like [`Block::verify_hash`] but reports the mismatch
    pub fn validate(&self) -> std::result::Result<(), IntegrityError> {
        let computed = self.compute_hash();
        if computed == self.hash {
            Ok(())
        } else {
            Err(IntegrityError::HashMismatch {
                index: self.index,
                stored: self.hash.clone(),
                computed,
            })
        }
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize from JSON. The hash is not checked.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let short = self.hash.get(..12).unwrap_or(&self.hash);
        write!(f, "#{} {}", self.index, short)
    }
}

/// Turn a JSON object into a payload, rejecting any other JSON shape
pub fn payload_from_value(value: Value) -> Result<Payload> {
    match value {
        Value::Object(map) => Ok(map.into_iter().collect()),
        other => Err(ChainSyncError::invalid_message(format!(
            "payload must be a JSON object, got {}",
            json_kind(&other)
        ))),
    }
}

/// RFC 8785 encoding of a payload
pub fn canonical_payload(payload: &Payload) -> String {
    // String-keyed JSON values always serialize
    serde_json_canonicalizer::to_string(payload).unwrap_or_default()
}

fn hash_preimage(index: u64, previous_hash: &str, timestamp: u64, payload: &Payload) -> Vec<u8> {
    // Integers go in as strings; JCS numbers are doubles and would lose
    // precision past 2^53
    let fields = (index.to_string(), previous_hash, timestamp.to_string(), payload);
    serde_json_canonicalizer::to_vec(&fields).unwrap_or_default()
}

pub(crate) fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Milliseconds since the Unix epoch
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}
