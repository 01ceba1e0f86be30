//! Status objects written on the error channel when a command finishes

use serde::{Deserialize, Serialize};

pub const STATUS_SUCCESS: &str = "Success";
pub const STATUS_FAILURE: &str = "Failure";

pub const REASON_NON_ZERO_EXIT_CODE: &str = "NonZeroExitCode";
pub const REASON_INTERNAL_ERROR: &str = "InternalError";
pub const CAUSE_EXIT_CODE: &str = "ExitCode";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListMeta {}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCause {
    #[serde(rename = "reason", default, skip_serializing_if = "String::is_empty")]
    pub cause_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub field: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusDetails {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub causes: Vec<StatusCause>,
}

/// Outcome of a remote command, shaped like a Kubernetes `Status`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    #[serde(default)]
    pub metadata: ListMeta,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub status: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<StatusDetails>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub code: i32,
}

fn is_zero(code: &i32) -> bool {
    *code == 0
}

impl Status {
    pub fn success() -> Self {
        Self {
            status: STATUS_SUCCESS.to_string(),
            ..Default::default()
        }
    }

    /// The remote process ran and exited with a non-zero code
    pub fn non_zero_exit(cmd: &[String], exit_code: i64) -> Self {
        Self {
            status: STATUS_FAILURE.to_string(),
            message: format!(
                "command terminated with non-zero exit code: command '{}' exited with {}",
                cmd.join(" "),
                exit_code
            ),
            reason: REASON_NON_ZERO_EXIT_CODE.to_string(),
            details: Some(StatusDetails {
                causes: vec![StatusCause {
                    cause_type: CAUSE_EXIT_CODE.to_string(),
                    message: exit_code.to_string(),
                    field: String::new(),
                }],
            }),
            ..Default::default()
        }
    }

    /// The command could not be run at all
    pub fn internal_error(err: impl std::fmt::Display) -> Self {
        Self::internal(format!("error executing command in container: {}", err))
    }

    /// Attaching to the container's primary process failed
    pub fn attach_error(err: impl std::fmt::Display) -> Self {
        Self::internal(format!("error attaching to container: {}", err))
    }

    fn internal(err: String) -> Self {
        Self {
            status: STATUS_FAILURE.to_string(),
            message: format!("Internal error occurred: {}", err),
            reason: REASON_INTERNAL_ERROR.to_string(),
            details: Some(StatusDetails {
                causes: vec![StatusCause {
                    message: err,
                    ..Default::default()
                }],
            }),
            code: 500,
            ..Default::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == STATUS_SUCCESS
    }

    /// Exit code carried in the causes of a non-zero exit status
    pub fn exit_code(&self) -> Option<i64> {
        self.details
            .as_ref()?
            .causes
            .iter()
            .find(|c| c.cause_type == CAUSE_EXIT_CODE)
            .and_then(|c| c.message.parse().ok())
    }
}
