//! Sub-request and sub-response value types.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::JobError;

/// HTTP verb of a sub-request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verb {
    Get,
    Head,
    Post,
    Put,
    Patch,
    Delete,
}

impl Verb {
    /// GET and HEAD never modify rows.
    pub fn is_read_only(self) -> bool {
        matches!(self, Verb::Get | Verb::Head)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Verb::Get => "GET",
            Verb::Head => "HEAD",
            Verb::Post => "POST",
            Verb::Put => "PUT",
            Verb::Patch => "PATCH",
            Verb::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown verb.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported verb: {0}")]
pub struct UnknownVerb(pub String);

impl FromStr for Verb {
    type Err = UnknownVerb;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Verb::Get),
            "HEAD" => Ok(Verb::Head),
            "POST" => Ok(Verb::Post),
            "PUT" => Ok(Verb::Put),
            "PATCH" => Ok(Verb::Patch),
            "DELETE" => Ok(Verb::Delete),
            _ => Err(UnknownVerb(s.to_string())),
        }
    }
}

fn default_verb() -> Verb {
    Verb::Get
}

/// One element of a batch body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubRequest {
    pub href: String,
    #[serde(default = "default_verb", deserialize_with = "deserialize_verb")]
    pub verb: Verb,
    #[serde(default)]
    pub body: Value,
}

impl SubRequest {
    pub fn new(verb: Verb, href: impl Into<String>, body: Value) -> Self {
        Self {
            href: href.into(),
            verb,
            body,
        }
    }
}

fn deserialize_verb<'de, D>(deserializer: D) -> Result<Verb, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    raw.parse().map_err(serde::de::Error::custom)
}

/// Result of one sub-request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubResponse {
    pub status: u16,
    #[serde(default)]
    pub body: Value,
}

impl SubResponse {
    pub fn new(status: u16, body: Value) -> Self {
        Self { status, body }
    }

    pub fn ok(body: Value) -> Self {
        Self::new(200, body)
    }

    pub fn from_error(err: &JobError) -> Self {
        let message = match err {
            JobError::Domain(domain) => domain.message.clone(),
            other => other.to_string(),
        };
        Self::new(
            err.status(),
            json!({ "code": err.code(), "message": message }),
        )
    }
}
