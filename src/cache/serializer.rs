//! Envelope serializer
//!
//! Every stored value is wrapped in a JSON envelope that records the type it
//! was written as:
//!
//! ```text
//! {"type":"alloc::string::String","payload":"hello"}
//! {"type":"my_app::Product","payload":null}        <- known-absent marker
//! ```
//!
//! Readers that know the type get it back directly; readers that don't can
//! still inspect the tag and the raw payload via [`CachedValue`].
//!
//! Tags come from `std::any::type_name`, which is not stable across compiler
//! versions or crate paths. Peers sharing L2 may therefore write tags this
//! process does not recognise; [`EnvelopeSerializer::decode`] reports those
//! as [`Decoded::Foreign`] so the cache can treat them as a miss.

use bytes::Bytes;
use serde::de::{DeserializeOwned, Error as _};
use serde::{Deserialize, Serialize};

use crate::error::{CacheError, Result};

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    #[serde(rename = "type")]
    type_name: String,
    #[serde(default)]
    payload: serde_json::Value,
}

/// Untyped view of a stored envelope
#[derive(Debug, Clone, PartialEq)]
pub struct CachedValue {
    pub type_name: String,
    pub payload: serde_json::Value,
}

impl CachedValue {
    /// Whether this is a known-absent marker
    pub fn is_absent(&self) -> bool {
        self.payload.is_null()
    }
}

/// Outcome of a typed, tag-aware decode
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded<T> {
    Value(T),
    /// Known-absent marker written for this type
    Absent,
    /// Well-formed envelope written under another type tag
    Foreign { type_name: String },
}

/// JSON envelope serializer
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvelopeSerializer;

impl EnvelopeSerializer {
    pub fn new() -> Self {
        Self
    }

    /// Serialize `value` tagged with its type name
    pub fn serialize<T: Serialize>(&self, value: &T) -> Result<Bytes> {
        let type_name = std::any::type_name::<T>();
        let payload = serde_json::to_value(value).map_err(|e| CacheError::Serialization {
            type_name: type_name.to_string(),
            source: e.into(),
        })?;
        self.encode(type_name, payload)
    }

    /// Known-absent marker for `T`: type tag with a null payload
    pub fn serialize_absent<T>(&self) -> Result<Bytes> {
        self.encode(std::any::type_name::<T>(), serde_json::Value::Null)
    }

    fn encode(&self, type_name: &str, payload: serde_json::Value) -> Result<Bytes> {
        let envelope = Envelope {
            type_name: type_name.to_string(),
            payload,
        };
        serde_json::to_vec(&envelope)
            .map(Bytes::from)
            .map_err(|e| CacheError::Serialization {
                type_name: type_name.to_string(),
                source: e.into(),
            })
    }

    /// Decode the envelope without committing to a type
    pub fn deserialize_value(&self, data: &[u8]) -> Result<CachedValue> {
        let envelope: Envelope =
            serde_json::from_slice(data).map_err(|e| CacheError::Deserialization {
                type_name: "<envelope>".to_string(),
                source: e.into(),
            })?;
        Ok(CachedValue {
            type_name: envelope.type_name,
            payload: envelope.payload,
        })
    }

    /// Decode into `T`. A null payload is only accepted if `T` accepts null.
    pub fn deserialize<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T> {
        let value = self.checked::<T>(data)?;
        from_payload(value.payload)
    }

    /// Decode into `T`, mapping a known-absent marker to `None`
    pub fn deserialize_optional<T: DeserializeOwned>(&self, data: &[u8]) -> Result<Option<T>> {
        let value = self.checked::<T>(data)?;
        if value.is_absent() {
            return Ok(None);
        }
        from_payload(value.payload).map(Some)
    }

    /// Decode into `T` without failing on a foreign tag. Only malformed
    /// envelopes or payloads that do not fit `T` are errors.
    pub fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<Decoded<T>> {
        let value = self.deserialize_value(data)?;
        if value.type_name != std::any::type_name::<T>() {
            return Ok(Decoded::Foreign {
                type_name: value.type_name,
            });
        }
        if value.is_absent() {
            return Ok(Decoded::Absent);
        }
        from_payload(value.payload).map(Decoded::Value)
    }

    /// `T` built from a null payload, for types that can represent absence
    pub fn absent_value<T: DeserializeOwned>(&self) -> Option<T> {
        serde_json::from_value(serde_json::Value::Null).ok()
    }

    fn checked<T>(&self, data: &[u8]) -> Result<CachedValue> {
        let value = self.deserialize_value(data)?;
        let expected = std::any::type_name::<T>();
        if value.type_name != expected {
            return Err(CacheError::Deserialization {
                type_name: expected.to_string(),
                source: serde_json::Error::custom(format!(
                    "stored value has type '{}'",
                    value.type_name
                ))
                .into(),
            });
        }
        Ok(value)
    }
}

fn from_payload<T: DeserializeOwned>(payload: serde_json::Value) -> Result<T> {
    serde_json::from_value(payload).map_err(|e| CacheError::Deserialization {
        type_name: std::any::type_name::<T>().to_string(),
        source: e.into(),
    })
}
