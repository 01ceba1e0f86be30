//! Docker implementation of the runtime capability

use async_trait::async_trait;
use bollard::{
    container::{
        AttachContainerOptions, AttachContainerResults, ListContainersOptions, LogOutput,
        ResizeContainerTtyOptions,
    },
    exec::{CreateExecOptions, ResizeExecOptions, StartExecOptions, StartExecResults},
    Docker,
};
use futures::StreamExt;
use rand::Rng;
use tracing::{debug, info, warn};

use super::runtime::{
    AttachOptions, AttachedStreams, OutputStream, ResizeTarget, Runtime, RuntimeOutput,
};
use crate::domain::{ContainerSummary, ExecConfig, ExecInspect, TerminalSize};
use crate::error::{Error, Result};

/// Docker runtime backed by a small pool of API clients
pub struct DockerRuntime {
    clients: Vec<Docker>,
}

impl DockerRuntime {
    /// Connect `pool_size` clients to the daemon socket
    pub fn new(socket_path: &str, pool_size: usize) -> Result<Self> {
        let mut clients = Vec::with_capacity(pool_size.max(1));
        for _ in 0..pool_size.max(1) {
            match Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION) {
                Ok(client) => clients.push(client),
                Err(e) => warn!("create docker client err={}", e),
            }
        }
        if clients.is_empty() {
            return Err(Error::DockerError(format!(
                "no docker client could connect to {}",
                socket_path
            )));
        }

        info!("Created {} docker clients on {}", clients.len(), socket_path);
        Ok(Self { clients })
    }

    /// Pick a client at random
    fn client(&self) -> &Docker {
        let idx = rand::thread_rng().gen_range(0..self.clients.len());
        &self.clients[idx]
    }

    /// Check if Docker daemon is accessible
    pub async fn ping(&self) -> Result<()> {
        self.client()
            .ping()
            .await
            .map_err(|e| Error::DockerError(format!("Docker ping failed: {}", e)))?;
        Ok(())
    }
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

fn map_output<S>(output: S) -> OutputStream
where
    S: futures::Stream<Item = std::result::Result<LogOutput, bollard::errors::Error>>
        + Send
        + 'static,
{
    output
        .map(|item| {
            item.map_err(Error::from).map(|log| match log {
                LogOutput::StdErr { message } => RuntimeOutput::Stderr(message),
                LogOutput::StdOut { message }
                | LogOutput::Console { message }
                | LogOutput::StdIn { message } => RuntimeOutput::Stdout(message),
            })
        })
        .boxed()
}

#[async_trait]
impl Runtime for DockerRuntime {
    async fn create_exec(&self, container_id: &str, config: &ExecConfig) -> Result<String> {
        let options = CreateExecOptions {
            attach_stdin: Some(config.attach_stdin),
            attach_stdout: Some(config.attach_stdout),
            attach_stderr: Some(config.attach_stderr),
            tty: Some(config.tty),
            privileged: Some(config.privileged),
            env: if config.env.is_empty() {
                None
            } else {
                Some(config.env.clone())
            },
            cmd: Some(config.cmd.clone()),
            user: non_empty(&config.user),
            working_dir: non_empty(&config.working_dir),
            ..Default::default()
        };

        let created = self.client().create_exec(container_id, options).await?;
        debug!("Created exec {} in container {}", created.id, container_id);
        Ok(created.id)
    }

    async fn start_exec(&self, exec_id: &str, tty: bool) -> Result<AttachedStreams> {
        let options = StartExecOptions {
            detach: false,
            tty,
            output_capacity: None,
        };

        match self.client().start_exec(exec_id, Some(options)).await? {
            StartExecResults::Attached { output, input } => Ok(AttachedStreams {
                output: map_output(output),
                input,
            }),
            StartExecResults::Detached => Err(Error::ExecFailed(format!(
                "exec {} started detached",
                exec_id
            ))),
        }
    }

    async fn inspect_exec(&self, exec_id: &str) -> Result<ExecInspect> {
        let inspect = self.client().inspect_exec(exec_id).await?;
        Ok(ExecInspect {
            exit_code: inspect.exit_code.unwrap_or(0),
            running: inspect.running.unwrap_or(false),
        })
    }

    async fn resize(&self, target: &ResizeTarget, size: TerminalSize) -> Result<()> {
        match target {
            ResizeTarget::Exec(id) => {
                self.client()
                    .resize_exec(
                        id,
                        ResizeExecOptions {
                            height: size.height,
                            width: size.width,
                        },
                    )
                    .await?
            }
            ResizeTarget::Container(id) => {
                self.client()
                    .resize_container_tty(
                        id,
                        ResizeContainerTtyOptions {
                            width: size.width,
                            height: size.height,
                        },
                    )
                    .await?
            }
        }
        Ok(())
    }

    async fn attach(&self, container_id: &str, options: AttachOptions) -> Result<AttachedStreams> {
        let options = AttachContainerOptions::<String> {
            stdin: Some(options.stdin),
            stdout: Some(options.stdout),
            stderr: Some(options.stderr),
            stream: Some(true),
            logs: Some(false),
            detach_keys: None,
        };

        let AttachContainerResults { output, input } = self
            .client()
            .attach_container(container_id, Some(options))
            .await?;
        Ok(AttachedStreams {
            output: map_output(output),
            input,
        })
    }

    async fn list_containers(&self) -> Result<Vec<ContainerSummary>> {
        let options = ListContainersOptions::<String> {
            all: false,
            ..Default::default()
        };

        let containers = self.client().list_containers(Some(options)).await?;
        Ok(containers
            .into_iter()
            .map(|c| ContainerSummary {
                id: c.id.unwrap_or_default(),
                image: c.image.unwrap_or_default(),
                state: c.state.unwrap_or_default(),
                labels: c.labels.unwrap_or_default(),
            })
            .collect())
    }
}
