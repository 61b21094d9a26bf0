//! The wire unit exchanged over the bus.
//!
//! An envelope serializes as a flat JSON object:
//!
//! ```text
//! { "id": "<uuid>", "msg": <payload>, "_re": "<request id>", ...other meta }
//! ```
//!
//! Metadata fields are merged at the top level next to `id` and `msg`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{Result, RoverError};

/// Metadata key carrying the id of the request a response answers.
pub const CORRELATION_FIELD: &str = "_re";

const RESERVED_FIELDS: [&str; 2] = ["id", "msg"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    id: String,
    #[serde(rename = "msg", default)]
    payload: Value,
    #[serde(flatten)]
    meta: Map<String, Value>,
}

impl Envelope {
    /// Wrap a payload under a freshly generated id.
    pub fn new(payload: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            payload,
            meta: Map::new(),
        }
    }

    /// Serialize `payload` and wrap it under a fresh id.
    pub fn encode<T: Serialize + ?Sized>(payload: &T) -> Result<Self> {
        Ok(Self::new(serde_json::to_value(payload)?))
    }

    /// Attach one metadata field. `id` and `msg` are rejected.
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<Value>) -> Result<Self> {
        let key = key.into();
        if RESERVED_FIELDS.contains(&key.as_str()) {
            return Err(RoverError::invalid(format!(
                "metadata key `{}` is reserved",
                key
            )));
        }
        self.meta.insert(key, value.into());
        Ok(self)
    }

    /// Attach every field of `meta`.
    pub fn with_meta_map(self, meta: Map<String, Value>) -> Result<Self> {
        meta.into_iter()
            .try_fold(self, |env, (key, value)| env.with_meta(key, value))
    }

    /// Mark this envelope as the answer to `request_id`.
    pub fn correlated(self, request_id: &str) -> Result<Self> {
        self.with_meta(CORRELATION_FIELD, request_id)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn into_payload(self) -> Value {
        self.payload
    }

    /// Deserialize the payload into a typed value.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    pub fn meta(&self) -> &Map<String, Value> {
        &self.meta
    }

    /// Id of the request this envelope answers, if any.
    pub fn correlates_to(&self) -> Option<&str> {
        self.meta.get(CORRELATION_FIELD).and_then(Value::as_str)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse raw bus bytes. Anything but a JSON object with a string `id`
    /// is rejected.
    pub fn from_bytes(raw: &[u8]) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_slice(raw)
    }
}
