//! Envelope used by the legacy ssh websocket

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::types::TerminalSize;

pub const RESIZE_TYPE: i32 = 2;
pub const START_COMMAND_TYPE: i32 = 3;
pub const END_COMMAND_TYPE: i32 = 4;
pub const RAW_INPUT_TYPE: i32 = 5;

/// Wire envelope `{messageType, data}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "messageType")]
    pub message_type: i32,
    #[serde(default)]
    pub data: Value,
}

/// Command to start inside the pod's business container
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecMessage {
    #[serde(default)]
    pub pod_name: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub privileged: bool,
    #[serde(default)]
    pub tty: bool,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub cmd: Vec<String>,
    #[serde(default)]
    pub working_dir: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ResizeMessage {
    pub width: i32,
    pub height: i32,
}

/// Decoded form of an inbound envelope
#[derive(Debug, Clone)]
pub enum Command {
    Resize(TerminalSize),
    Start(ExecMessage),
    End,
    RawInput(String),
}

impl Message {
    pub fn end_command() -> Self {
        Self {
            message_type: END_COMMAND_TYPE,
            data: Value::Null,
        }
    }

    pub fn raw_input(text: impl Into<String>) -> Self {
        Self {
            message_type: RAW_INPUT_TYPE,
            data: Value::String(text.into()),
        }
    }

    /// Interpret the payload according to the message type
    pub fn into_command(self) -> Result<Command, String> {
        match self.message_type {
            RESIZE_TYPE => {
                let resize: ResizeMessage =
                    serde_json::from_value(self.data).map_err(|e| e.to_string())?;
                // Out of range sizes end up as zero and get filtered downstream
                Ok(Command::Resize(TerminalSize {
                    width: u16::try_from(resize.width).unwrap_or(0),
                    height: u16::try_from(resize.height).unwrap_or(0),
                }))
            }
            START_COMMAND_TYPE => serde_json::from_value(self.data)
                .map(Command::Start)
                .map_err(|e| e.to_string()),
            END_COMMAND_TYPE => Ok(Command::End),
            RAW_INPUT_TYPE => match self.data {
                Value::String(s) => Ok(Command::RawInput(s)),
                other => Err(format!("raw input must be a string, got {}", other)),
            },
            other => Err(format!("illegal message type={}", other)),
        }
    }
}

impl ExecMessage {
    pub fn validate(&self) -> Result<(), String> {
        if self.pod_name.is_empty() {
            return Err("pod name is empty".to_string());
        }
        if self.cmd.is_empty() {
            return Err("command line is empty".to_string());
        }
        Ok(())
    }
}

/// JSON result returned by the legacy common exec endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResult {
    pub code: i32,
    pub message: String,
    pub data: Value,
}

impl AgentResult {
    pub fn success(data: impl Into<Value>) -> Self {
        Self {
            code: 0,
            message: "success".to_string(),
            data: data.into(),
        }
    }

    pub fn error(err: impl std::fmt::Display) -> Self {
        Self {
            code: -1,
            message: err.to_string(),
            data: Value::Null,
        }
    }
}
