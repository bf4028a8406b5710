//! Normalized result shape handed to callers.

use std::collections::BTreeMap;

use base64::Engine;
use bytes::Bytes;
use serde::{Serialize, Serializer};

use crate::error::FetchError;
use crate::transport::TransportResponse;

/// Response payload, decoded as far as it cleanly goes.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Body {
    Empty,
    Json(serde_json::Value),
    Text(String),
    Raw(#[serde(serialize_with = "serialize_base64")] Bytes),
}

impl Body {
    /// JSON first, then UTF-8 text, then raw bytes.
    pub fn decode(bytes: Bytes) -> Self {
        if bytes.is_empty() {
            return Self::Empty;
        }
        if let Ok(value) = serde_json::from_slice::<serde_json::Value>(&bytes) {
            return Self::Json(value);
        }
        match String::from_utf8(bytes.to_vec()) {
            Ok(text) => Self::Text(text),
            Err(_) => Self::Raw(bytes),
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Json(value) => Some(value),
            _ => None,
        }
    }

    /// Text view of the payload (JSON is re-serialized).
    pub fn text(&self) -> Option<String> {
        match self {
            Self::Empty => Some(String::new()),
            Self::Json(value) => Some(value.to_string()),
            Self::Text(text) => Some(text.clone()),
            Self::Raw(bytes) => std::str::from_utf8(bytes).ok().map(str::to_string),
        }
    }
}

fn serialize_base64<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponseEnvelope {
    pub status: u16,
    pub body: Body,
    /// Lowercase header names; repeated headers are joined with `", "`.
    pub headers: BTreeMap<String, String>,
    /// `200 <= status < 300`.
    pub success: bool,
    /// URL the body was actually served from, after redirects.
    pub final_url: String,
    /// Transport attempts spent on this response (1 = first try).
    pub attempts: u32,
}

impl ResponseEnvelope {
    /// Wrap a completed transport response. Never fails.
    pub fn build(response: TransportResponse, attempts: u32) -> Self {
        let mut headers: BTreeMap<String, String> = BTreeMap::new();
        for (name, value) in response.headers {
            headers
                .entry(name.to_ascii_lowercase())
                .and_modify(|existing| {
                    existing.push_str(", ");
                    existing.push_str(&value);
                })
                .or_insert(value);
        }

        Self {
            status: response.status,
            success: (200..300).contains(&response.status),
            body: Body::decode(response.body),
            headers,
            final_url: response.final_url,
            attempts,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Turn a non-2xx envelope into [`FetchError::Status`].
    pub fn error_for_status(self) -> Result<Self, FetchError> {
        if self.success {
            Ok(self)
        } else {
            Err(FetchError::Status(Box::new(self)))
        }
    }
}
