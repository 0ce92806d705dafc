//! Pluggable payload serialization.

use std::fmt;
use std::io::{Read, Write};
use std::marker::PhantomData;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::EncodingError;

/// Encodes and decodes the opaque application payload of a frame.
pub trait Serializer<E>: Send + Sync {
    fn serialize(&self, out: &mut dyn Write, payload: &E) -> Result<(), EncodingError>;

    /// Decode one payload. `input` yields exactly the payload bytes of a
    /// single frame.
    fn deserialize(&self, input: &mut dyn Read) -> Result<E, EncodingError>;
}

/// JSON payloads through `serde_json`.
pub struct JsonSerializer<E> {
    _marker: PhantomData<fn() -> E>,
}

impl<E> JsonSerializer<E> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<E> Default for JsonSerializer<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> fmt::Debug for JsonSerializer<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("JsonSerializer")
    }
}

impl<E> Serializer<E> for JsonSerializer<E>
where
    E: Serialize + DeserializeOwned,
{
    fn serialize(&self, out: &mut dyn Write, payload: &E) -> Result<(), EncodingError> {
        serde_json::to_writer(out, payload).map_err(|e| EncodingError::Serialization(e.to_string()))
    }

    fn deserialize(&self, input: &mut dyn Read) -> Result<E, EncodingError> {
        serde_json::from_reader(input).map_err(|e| EncodingError::Serialization(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Heartbeat {
        node: String,
        seq: u64,
    }

    #[test]
    fn test_json_serializer_writes_plain_json() {
        let serializer = JsonSerializer::<Heartbeat>::new();
        let mut out = Vec::new();
        serializer
            .serialize(
                &mut out,
                &Heartbeat {
                    node: "a".into(),
                    seq: 3,
                },
            )
            .unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), r#"{"node":"a","seq":3}"#);
    }

    #[test]
    fn test_json_serializer_reads_payload() {
        let serializer = JsonSerializer::<Heartbeat>::new();
        let mut input: &[u8] = br#"{"node":"b","seq":9}"#;
        let decoded = serializer.deserialize(&mut input).unwrap();
        assert_eq!(
            decoded,
            Heartbeat {
                node: "b".into(),
                seq: 9
            }
        );
    }

    #[test]
    fn test_json_serializer_rejects_garbage() {
        let serializer = JsonSerializer::<Heartbeat>::new();
        let mut input: &[u8] = b"not json";
        let err = serializer.deserialize(&mut input).unwrap_err();
        assert!(matches!(err, EncodingError::Serialization(_)));
    }
}
