//! Domain types

pub mod message;
pub mod status;
pub mod types;

pub use status::Status;
pub use types::{
    AttachRequest, ContainerSummary, ExecConfig, ExecInspect, ExecRequest, StreamOptions,
    TerminalSize, ValidationError,
};
