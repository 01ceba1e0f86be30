//! Request and runtime data types

use std::collections::HashMap;

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

/// Rejections produced while validating an exec or attach request
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("missing required container_id")]
    MissingContainerId,

    #[error("tty and stderr cannot both be true")]
    TtyWithStderr,

    #[error("one of stdin, stdout, or stderr must be set")]
    NoStreams,
}

/// Streams the client intends to use for one request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamOptions {
    pub stdin: bool,
    pub stdout: bool,
    pub stderr: bool,
    pub tty: bool,
}

impl StreamOptions {
    /// Check the stream combination is one the protocol can serve
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.tty && self.stderr {
            // TTY merges stderr into stdout
            return Err(ValidationError::TtyWithStderr);
        }
        if !self.stdin && !self.stdout && !self.stderr {
            return Err(ValidationError::NoStreams);
        }
        Ok(())
    }
}

/// Accepts `1`/`0` form flags as well as JSON booleans
fn flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Text(String),
    }

    Ok(match Flag::deserialize(deserializer)? {
        Flag::Bool(b) => b,
        Flag::Text(s) => s == "1",
    })
}

/// Exec request as carried in the query string of the exec endpoint
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecRequest {
    #[serde(rename = "containerId", default)]
    pub container_id: String,
    #[serde(rename = "command", default)]
    pub cmd: Vec<String>,
    #[serde(default)]
    pub user: String,
    #[serde(rename = "workDir", default)]
    pub working_dir: String,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default, deserialize_with = "flag")]
    pub privileged: bool,
    #[serde(rename = "input", default, deserialize_with = "flag")]
    pub stdin: bool,
    #[serde(rename = "output", default, deserialize_with = "flag")]
    pub stdout: bool,
    #[serde(rename = "error", default, deserialize_with = "flag")]
    pub stderr: bool,
    #[serde(default, deserialize_with = "flag")]
    pub tty: bool,
}

impl ExecRequest {
    pub fn stream_options(&self) -> StreamOptions {
        StreamOptions {
            stdin: self.stdin,
            stdout: self.stdout,
            stderr: self.stderr,
            tty: self.tty,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.container_id.is_empty() {
            return Err(ValidationError::MissingContainerId);
        }
        self.stream_options().validate()
    }

    /// Build the exec settings handed to the runtime
    pub fn exec_config(&self) -> ExecConfig {
        ExecConfig {
            user: self.user.clone(),
            privileged: self.privileged,
            tty: self.tty,
            attach_stdin: self.stdin,
            attach_stdout: self.stdout,
            attach_stderr: self.stderr,
            env: self.env.clone(),
            working_dir: self.working_dir.clone(),
            cmd: self.cmd.clone(),
        }
    }
}

/// Attach request as carried in the query string of the attach endpoint
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AttachRequest {
    #[serde(rename = "containerId", default)]
    pub container_id: String,
    #[serde(rename = "input", default, deserialize_with = "flag")]
    pub stdin: bool,
    #[serde(rename = "output", default, deserialize_with = "flag")]
    pub stdout: bool,
    #[serde(rename = "error", default, deserialize_with = "flag")]
    pub stderr: bool,
    #[serde(default, deserialize_with = "flag")]
    pub tty: bool,
}

impl AttachRequest {
    pub fn stream_options(&self) -> StreamOptions {
        StreamOptions {
            stdin: self.stdin,
            stdout: self.stdout,
            stderr: self.stderr,
            tty: self.tty,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.container_id.is_empty() {
            return Err(ValidationError::MissingContainerId);
        }
        self.stream_options().validate()
    }
}

/// Exec settings passed to the runtime
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecConfig {
    pub user: String,
    pub privileged: bool,
    pub tty: bool,
    pub attach_stdin: bool,
    pub attach_stdout: bool,
    pub attach_stderr: bool,
    pub env: Vec<String>,
    pub working_dir: String,
    pub cmd: Vec<String>,
}

/// Terminal dimensions sent by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSize {
    #[serde(rename = "Width", alias = "width")]
    pub width: u16,
    #[serde(rename = "Height", alias = "height")]
    pub height: u16,
}

impl TerminalSize {
    /// Sizes with a zero dimension are never forwarded to the runtime
    pub fn is_valid(&self) -> bool {
        self.width >= 1 && self.height >= 1
    }
}

/// Inspection result of an exec session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecInspect {
    pub exit_code: i64,
    pub running: bool,
}

/// Container as reported by the runtime's list call
#[derive(Debug, Clone, Default)]
pub struct ContainerSummary {
    pub id: String,
    pub image: String,
    pub state: String,
    pub labels: HashMap<String, String>,
}
