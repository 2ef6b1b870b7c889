//! The value stored under a cache key.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::http::Headers;

/// A cached upstream response: its body and a snapshot of its headers.
///
/// Encoded as JSON. The body is base64 encoded so binary payloads survive;
/// headers are kept as lowercased name → ordered list of values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    #[serde(with = "base64_body")]
    pub body: Bytes,
    pub headers: BTreeMap<String, Vec<String>>,
}

impl CacheEntry {
    pub fn new(body: Bytes, headers: &Headers) -> Self {
        Self {
            body,
            headers: headers.to_multimap(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(raw: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(raw)
    }

    pub fn headers(&self) -> Headers {
        Headers::from(self.headers.clone())
    }
}

mod base64_body {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(body: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(D::Error::custom)
    }
}
