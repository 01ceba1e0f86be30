//! Container runtime capability consumed by the streaming layer

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use tokio::io::AsyncWrite;

use crate::domain::{ContainerSummary, ExecConfig, ExecInspect, TerminalSize};
use crate::error::Result;

/// One chunk of process output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeOutput {
    Stdout(Bytes),
    Stderr(Bytes),
}

pub type OutputStream = BoxStream<'static, Result<RuntimeOutput>>;
pub type InputSink = Pin<Box<dyn AsyncWrite + Send>>;

/// Live I/O of a started exec session or an attached container
pub struct AttachedStreams {
    pub output: OutputStream,
    pub input: InputSink,
}

/// Session a terminal resize applies to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResizeTarget {
    Exec(String),
    Container(String),
}

/// Streams requested when attaching to a running container
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AttachOptions {
    pub stdin: bool,
    pub stdout: bool,
    pub stderr: bool,
    pub tty: bool,
}

/// Narrow view of the container engine used by exec, attach and the container index
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Runtime: Send + Sync {
    /// Create an exec session and return its runtime-assigned id
    async fn create_exec(&self, container_id: &str, config: &ExecConfig) -> Result<String>;

    /// Start a created exec session with its streams attached
    async fn start_exec(&self, exec_id: &str, tty: bool) -> Result<AttachedStreams>;

    async fn inspect_exec(&self, exec_id: &str) -> Result<ExecInspect>;

    async fn resize(&self, target: &ResizeTarget, size: TerminalSize) -> Result<()>;

    /// Attach to the primary process of a running container
    async fn attach(&self, container_id: &str, options: AttachOptions) -> Result<AttachedStreams>;

    async fn list_containers(&self) -> Result<Vec<ContainerSummary>>;
}
