//! Request and response wire schema.
//!
//! Both sides of a session exchange YAML documents: a request file carries a
//! [`Request`], a response file a [`Response`]. Field names on the wire are
//! the camelCase names the message files are written with; unknown fields are
//! ignored on decode and missing optional fields take their zero values.

use serde::{Deserialize, Serialize};

use crate::error::{GenieError, Result};

/// How a request expects to be answered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    /// One request, one response.
    #[default]
    Unary,
    /// Reserved. Decodes fine but is rejected before execution.
    Stream,
}

/// Execution constraints the client attaches to a request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    /// Maximum time the request is allowed to take, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

/// A command invocation, addressed to a session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    #[serde(rename = "sessionID", default)]
    pub session_id: String,

    /// Unique identifier of the request within the session.
    #[serde(default)]
    pub id: u64,

    #[serde(rename = "type", default)]
    pub call_type: CallType,

    /// Logical command name, resolved against the server's allow-list.
    #[serde(default)]
    pub cmd: String,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub context: RequestContext,
}

/// The outcome of a request, paired to it by `request_id`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    #[serde(rename = "requestID", default)]
    pub request_id: u64,

    /// Position within a stream; always 0 for unary responses.
    #[serde(rename = "sequenceID", default)]
    pub sequence_id: u64,

    /// Exit code of the command. -1 is reserved for genie-internal failures.
    #[serde(rename = "exitCode", default)]
    pub exit_code: i32,

    /// Combined stdout and stderr of the command.
    #[serde(default)]
    pub output: String,
}

impl Request {
    pub fn encode(&self) -> Result<Vec<u8>> {
        encode(self)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        decode(data)
    }
}

impl Response {
    /// Build the error response the server publishes for rejected requests.
    pub fn rejection(request_id: u64, message: &str) -> Self {
        Self {
            request_id,
            sequence_id: 0,
            exit_code: -1,
            output: format!("error: {message}"),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        encode(self)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        decode(data)
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let doc = serde_yaml::to_string(value)?;
    Ok(doc.into_bytes())
}

fn decode<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T> {
    serde_yaml::from_slice(data).map_err(|e| GenieError::Decode {
        message: format!("malformed message payload: {e}"),
        source: Some(e),
    })
}
