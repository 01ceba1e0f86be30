//! Drives exec and attach sessions against the runtime

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{Config, EarlyResize};
use crate::domain::{ExecConfig, ExecInspect, TerminalSize};
use crate::error::Result;
use crate::infra::runtime::{AttachOptions, AttachedStreams, ResizeTarget, Runtime, RuntimeOutput};

pub type BoxReader = Pin<Box<dyn AsyncRead + Send>>;
pub type BoxWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// Client side of a session's standard streams
#[derive(Default)]
pub struct IoStreams {
    pub stdin: Option<BoxReader>,
    pub stdout: Option<BoxWriter>,
    pub stderr: Option<BoxWriter>,
}

pub struct RuntimeAdapter {
    runtime: Arc<dyn Runtime>,
    poll_attempts: u32,
    poll_interval: Duration,
    early_resize: EarlyResize,
}

impl RuntimeAdapter {
    pub fn new(runtime: Arc<dyn Runtime>, config: &Config) -> Self {
        Self {
            runtime,
            poll_attempts: config.exec_poll_attempts.max(1),
            poll_interval: config.poll_interval(),
            early_resize: config.early_resize,
        }
    }

    /// Run `config` in `container_id` with `io` attached and return once the
    /// process is gone, or once it is still reported running after the last poll
    pub async fn exec(
        &self,
        container_id: &str,
        config: &ExecConfig,
        io: IoStreams,
        resize: Option<mpsc::Receiver<TerminalSize>>,
    ) -> Result<ExecInspect> {
        // Resize needs the exec id, so events are held or dropped until the session is running
        let gate = resize.map(|rx| ResizeGate::new(rx, self.early_resize));

        let exec_id = self.runtime.create_exec(container_id, config).await?;
        let attached = self.runtime.start_exec(&exec_id, config.tty).await?;
        info!("exec {} started in container {}", exec_id, container_id);

        let forwarder = match gate {
            Some(gate) => gate.open().await.map(|rx| {
                spawn_resize_forwarder(self.runtime.clone(), ResizeTarget::Exec(exec_id.clone()), rx)
            }),
            None => None,
        };

        pump(attached, io, config.tty).await;
        if let Some(task) = forwarder {
            task.abort();
        }

        self.wait_for_exit(&exec_id).await
    }

    /// Attach `io` to the primary process of `container_id` until its output ends
    pub async fn attach(
        &self,
        container_id: &str,
        io: IoStreams,
        tty: bool,
        resize: Option<mpsc::Receiver<TerminalSize>>,
    ) -> Result<()> {
        // The container exists already, resize can be applied right away
        let forwarder = resize.map(|rx| {
            spawn_resize_forwarder(
                self.runtime.clone(),
                ResizeTarget::Container(container_id.to_string()),
                rx,
            )
        });

        let options = AttachOptions {
            stdin: io.stdin.is_some(),
            stdout: io.stdout.is_some(),
            stderr: io.stderr.is_some(),
            tty,
        };
        let attached = match self.runtime.attach(container_id, options).await {
            Ok(attached) => attached,
            Err(e) => {
                if let Some(task) = forwarder {
                    task.abort();
                }
                return Err(e);
            }
        };

        pump(attached, io, tty).await;
        if let Some(task) = forwarder {
            task.abort();
        }
        Ok(())
    }

    async fn wait_for_exit(&self, exec_id: &str) -> Result<ExecInspect> {
        let mut attempts = 0;
        loop {
            let inspect = self.runtime.inspect_exec(exec_id).await?;
            if !inspect.running {
                return Ok(inspect);
            }
            attempts += 1;
            if attempts >= self.poll_attempts {
                warn!(
                    "exec {} still running after {} inspections, giving up on its exit code",
                    exec_id, attempts
                );
                return Ok(inspect);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

/// Holds resize events until the exec session has started
enum ResizeGate {
    Held(mpsc::Receiver<TerminalSize>),
    Draining {
        started: oneshot::Sender<()>,
        task: JoinHandle<mpsc::Receiver<TerminalSize>>,
    },
}

impl ResizeGate {
    fn new(rx: mpsc::Receiver<TerminalSize>, policy: EarlyResize) -> Self {
        match policy {
            // The bounded channel keeps the pump waiting until the gate opens
            EarlyResize::Defer => ResizeGate::Held(rx),
            EarlyResize::Drop => {
                let (started, mut started_rx) = oneshot::channel();
                let task = tokio::spawn(async move {
                    let mut rx = rx;
                    loop {
                        tokio::select! {
                            biased;
                            event = rx.recv() => match event {
                                Some(size) => debug!("dropping early resize event {:?}", size),
                                None => break,
                            },
                            _ = &mut started_rx => break,
                        }
                    }
                    rx
                });
                ResizeGate::Draining { started, task }
            }
        }
    }

    async fn open(self) -> Option<mpsc::Receiver<TerminalSize>> {
        match self {
            ResizeGate::Held(rx) => Some(rx),
            ResizeGate::Draining { started, task } => {
                let _ = started.send(());
                task.await.ok()
            }
        }
    }
}

/// Apply every valid size to `target` in arrival order
fn spawn_resize_forwarder(
    runtime: Arc<dyn Runtime>,
    target: ResizeTarget,
    mut rx: mpsc::Receiver<TerminalSize>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(size) = rx.recv().await {
            if !size.is_valid() {
                debug!("ignoring invalid terminal size {:?}", size);
                continue;
            }
            if let Err(e) = runtime.resize(&target, size).await {
                warn!("resize {:?} to {:?} failed, err={}", target, size, e);
            }
        }
    })
}

/// Copy stdin into the session and its output back to the client until the output ends
async fn pump(attached: AttachedStreams, io: IoStreams, tty: bool) {
    let AttachedStreams { mut output, mut input } = attached;
    let IoStreams {
        stdin,
        mut stdout,
        mut stderr,
    } = io;

    let stdin_task = stdin.map(|mut reader| {
        tokio::spawn(async move {
            match tokio::io::copy(&mut reader, &mut input).await {
                Ok(n) => debug!("stdin closed after {} bytes", n),
                Err(e) => debug!("stdin copy stopped, err={}", e),
            }
            let _ = input.shutdown().await;
        })
    });

    while let Some(chunk) = output.next().await {
        match chunk {
            Ok(RuntimeOutput::Stdout(data)) => forward(&mut stdout, &data, "stdout").await,
            // A terminal has a single output stream
            Ok(RuntimeOutput::Stderr(data)) if tty => forward(&mut stdout, &data, "stdout").await,
            Ok(RuntimeOutput::Stderr(data)) => forward(&mut stderr, &data, "stderr").await,
            Err(e) => {
                warn!("reading session output failed, err={}", e);
                break;
            }
        }
    }

    for writer in [stdout.as_mut(), stderr.as_mut()].into_iter().flatten() {
        let _ = writer.shutdown().await;
    }
    if let Some(task) = stdin_task {
        task.abort();
    }
}

async fn forward(writer: &mut Option<BoxWriter>, data: &[u8], name: &str) {
    let Some(w) = writer.as_mut() else {
        return;
    };
    if let Err(e) = w.write_all(data).await {
        debug!("{} write failed, discarding further output, err={}", name, e);
        *writer = None;
    }
}
