//! Opaque argument and result payloads.
//!
//! The interface glue decides what goes inside a payload; the protocol only
//! moves it. On the wire the bytes travel as a base64 string so that frames
//! stay valid JSON.

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde::Serializer;
use serde::de::DeserializeOwned;

use crate::error::Result;

#[derive(Clone, Default, PartialEq, Eq)]
pub struct Payload(Vec<u8>);

impl Payload {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Encodes a value with the default codec.
    pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        Ok(Self(serde_json::to_vec(value)?))
    }

    /// Decodes the payload into a value with the default codec.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.0)?)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Payload({} bytes)", self.0.len())
    }
}

impl Serialize for Payload {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for Payload {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD
            .decode(text.as_bytes())
            .map(Self)
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_travels_as_base64_string() {
        let payload = Payload::from_bytes(vec![0, 1, 2, 255]);
        let json = serde_json::to_string(&payload).unwrap();

        assert_eq!(json, "\"AAEC/w==\"");
    }

    #[test]
    fn test_payload_rejects_invalid_base64() {
        let result: std::result::Result<Payload, _> = serde_json::from_str("\"not base64!\"");
        assert!(result.is_err());
    }

    #[test]
    fn test_tuple_arguments_decode() {
        let payload = Payload::encode(&(42u64, "answer")).unwrap();
        let (n, s): (u64, String) = payload.decode().unwrap();

        assert_eq!(n, 42);
        assert_eq!(s, "answer");
    }

    #[test]
    fn test_decode_wrong_shape_is_codec_error() {
        let payload = Payload::encode(&"text").unwrap();
        let result = payload.decode::<u64>();

        assert!(matches!(result, Err(crate::RpcError::Codec(_))));
    }
}
