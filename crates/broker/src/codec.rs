//! Named serialization strategies for message bodies.
//!
//! A codec is selected once per broker, by name, and applied by the typed
//! publish, subscribe and request operations. Raw passthrough is not a
//! codec: the `*_raw` operations bypass encoding entirely.

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Errors produced when resolving a codec or transforming message bodies.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The name given at configuration time matches no known codec.
    #[error("unknown codec: {0}")]
    UnknownName(String),

    /// Serialization failed.
    #[error("marshal failed: {0}")]
    Marshal(String),

    /// Deserialization failed.
    #[error("unmarshal failed: {0}")]
    Unmarshal(String),
}

/// A named serialization strategy.
///
/// `Json` is the default applied when no broker option overrides it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Codec {
    /// JSON via `serde_json`.
    #[default]
    Json,

    /// CBOR via `ciborium`.
    Cbor,
}

impl Codec {
    /// Resolves a codec from its configuration name.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::UnknownName`] for unregistered names.
    pub fn from_name(name: &str) -> Result<Self, CodecError> {
        match name {
            "json" => Ok(Self::Json),
            "cbor" => Ok(Self::Cbor),
            other => Err(CodecError::UnknownName(other.to_string())),
        }
    }

    /// The configuration name of this codec.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Cbor => "cbor",
        }
    }

    /// Serializes `value` into a payload.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Marshal`] when serialization fails.
    pub fn marshal<T: Serialize>(self, value: &T) -> Result<Bytes, CodecError> {
        match self {
            Self::Json => serde_json::to_vec(value)
                .map(Bytes::from)
                .map_err(|e| CodecError::Marshal(e.to_string())),
            Self::Cbor => {
                let mut buf = Vec::new();
                ciborium::into_writer(value, &mut buf)
                    .map_err(|e| CodecError::Marshal(e.to_string()))?;
                Ok(Bytes::from(buf))
            }
        }
    }

    /// Deserializes a payload into `T`.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Unmarshal`] when the payload is not valid for
    /// this codec or does not match `T`.
    pub fn unmarshal<T: DeserializeOwned>(self, payload: &[u8]) -> Result<T, CodecError> {
        match self {
            Self::Json => serde_json::from_slice(payload)
                .map_err(|e| CodecError::Unmarshal(e.to_string())),
            Self::Cbor => {
                ciborium::from_reader(payload).map_err(|e| CodecError::Unmarshal(e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq, Serialize)]
    struct Order {
        id: u64,
        item: String,
    }

    #[test]
    fn default_codec_is_json() {
        assert_eq!(Codec::default(), Codec::Json);
    }

    #[test]
    fn resolves_codecs_by_name() {
        assert_eq!(Codec::from_name("json").unwrap(), Codec::Json);
        assert_eq!(Codec::from_name("cbor").unwrap(), Codec::Cbor);

        let err = Codec::from_name("protobuf").unwrap_err();
        assert!(matches!(err, CodecError::UnknownName(name) if name == "protobuf"));
    }

    #[test]
    fn json_round_trip() {
        let order = Order {
            id: 7,
            item: "wrench".to_string(),
        };

        let payload = Codec::Json.marshal(&order).unwrap();
        let decoded: Order = Codec::Json.unmarshal(&payload).unwrap();

        assert_eq!(decoded, order);
    }

    #[test]
    fn cbor_round_trip() {
        let order = Order {
            id: 7,
            item: "wrench".to_string(),
        };

        let payload = Codec::Cbor.marshal(&order).unwrap();
        let decoded: Order = Codec::Cbor.unmarshal(&payload).unwrap();

        assert_eq!(decoded, order);
    }

    #[test]
    fn unmarshal_rejects_mismatched_payload() {
        let err = Codec::Json.unmarshal::<Order>(b"not json").unwrap_err();
        assert!(matches!(err, CodecError::Unmarshal(_)));
    }
}
