//! Update records stored inside log frames.

use serde::{Deserialize, Serialize};

/// One immutable mutation in an instance's update stream.
///
/// `seq` is strictly increasing and gap-free per (stream, instance), starting
/// at 1. `clock` is the writer's Lamport clock and orders LWW writes;
/// `timestamp` is wall-clock milliseconds and only informational.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord<Op> {
    pub instance: String,
    pub seq: u64,
    pub clock: u64,
    pub timestamp: i64,
    pub op: Op,
}

impl<Op> LogRecord<Op> {
    /// Build a record stamped with the current wall-clock time.
    pub fn new(instance: impl Into<String>, seq: u64, clock: u64, op: Op) -> Self {
        Self {
            instance: instance.into(),
            seq,
            clock,
            timestamp: chrono::Utc::now().timestamp_millis(),
            op,
        }
    }
}

/// Serde adapter storing binary payloads (yrs updates) as base64 strings.
pub(crate) mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        use serde::de::Error;
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded.as_bytes()).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Blob {
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    }

    #[test]
    fn test_binary_payload_is_base64_in_json() {
        let record = LogRecord::new("inst", 1, 1, Blob { data: vec![0, 1, 2, 255] });
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"AAEC/w==\""));
        let parsed: LogRecord<Blob> = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, record);
    }
}
