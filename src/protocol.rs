//! Wire format spoken with the exchange.
//!
//! Every frame is a JSON text message.
//!
//! - **Outbound** [`Envelope`]: the worker identity, the current advertisable
//!   capacity (`memory`), an optional job result (`output`) and, on replies to
//!   commands, the `forwarding_token` copied from the request.
//! - **Inbound** [`InboundCommand`]: `{token, command, file_name?, file_content?}`
//!   where `file_content` is base64.
//!
//! Telemetry and job results share one connection and arrive in no particular
//! order relative to each other; the exchange tells them apart by the presence
//! of `forwarding_token`.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::config::SUPPORTED_EXTENSION;
use crate::error::{Result, WorkerError};

/// The only command the worker acts on.
pub const RUN_FILE_COMMAND: &str = "run-file";

/// Outcome of a job, sent back as the envelope `output`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JobResult {
    Completed {
        stdout: String,
        stderr: String,
        returncode: i32,
    },
    Failed {
        error: String,
    },
}

impl JobResult {
    pub fn error(message: impl Into<String>) -> Self {
        JobResult::Failed {
            error: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, JobResult::Failed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub identity_token: Uuid,
    pub memory: Option<u64>,
    pub output: Option<JobResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forwarding_token: Option<Value>,
}

impl Envelope {
    /// Capacity report. Never carries a correlation token.
    pub fn telemetry(identity_token: Uuid, memory: u64) -> Self {
        Self {
            identity_token,
            memory: Some(memory),
            output: None,
            forwarding_token: None,
        }
    }

    /// Reply to an inbound command. The token is copied verbatim; a command
    /// without one is answered with an explicit `null`.
    pub fn response(
        identity_token: Uuid,
        memory: Option<u64>,
        result: JobResult,
        forwarding_token: Option<Value>,
    ) -> Self {
        Self {
            identity_token,
            memory,
            output: Some(result),
            forwarding_token: Some(forwarding_token.unwrap_or(Value::Null)),
        }
    }

    pub fn is_response(&self) -> bool {
        self.forwarding_token.is_some()
    }
}

/// A parsed inbound frame. Every field is optional at this layer; what a
/// command needs is checked by the handler for that command.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct InboundCommand {
    #[serde(default)]
    pub token: Option<Value>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub file_content: Option<String>,
}

impl InboundCommand {
    pub fn is_run_file(&self) -> bool {
        self.command.as_deref() == Some(RUN_FILE_COMMAND)
    }

    /// Check that a `run-file` command names a supported source file and
    /// carries its content. Returns `(file_name, file_content)`.
    pub fn job_fields(&self) -> std::result::Result<(&str, &str), String> {
        let missing: Vec<&str> = [
            ("file_name", self.file_name.is_none()),
            ("file_content", self.file_content.is_none()),
        ]
        .into_iter()
        .filter_map(|(field, absent)| absent.then_some(field))
        .collect();

        match (self.file_name.as_deref(), self.file_content.as_deref()) {
            (Some(name), Some(content)) => {
                if name.ends_with(SUPPORTED_EXTENSION) {
                    Ok((name, content))
                } else {
                    Err(format!(
                        "malformed run-file request: unsupported file type `{}`, expected a {} file",
                        name, SUPPORTED_EXTENSION
                    ))
                }
            }
            _ => Err(format!(
                "malformed run-file request: missing {}; please include file_name and file_content",
                missing.join(", ")
            )),
        }
    }
}

pub fn encode_envelope(envelope: &Envelope) -> Result<String> {
    serde_json::to_string(envelope).map_err(|e| WorkerError::MalformedEnvelope(e.to_string()))
}

pub fn decode_command(frame: &[u8]) -> Result<InboundCommand> {
    serde_json::from_slice(frame).map_err(|e| WorkerError::MalformedEnvelope(e.to_string()))
}

pub fn encode_file_content(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decode a `file_content` body. Line breaks and other ASCII whitespace, as
/// produced by MIME-style encoders that wrap at 76 columns, are ignored.
pub fn decode_file_content(encoded: &str) -> std::result::Result<Vec<u8>, base64::DecodeError> {
    let compact: Vec<u8> = encoded
        .bytes()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    STANDARD.decode(compact)
}
