//! Pod-addressed exec used by the operations server: a buffered one-shot
//! command and an interactive session speaking the `{messageType, data}` envelope

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::Message as WsMessage;
use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tracing::{debug, info, warn};

use super::exec::{IoStreams, RuntimeAdapter};
use crate::domain::message::{Command, ExecMessage, Message};
use crate::domain::{ExecConfig, Status, TerminalSize};
use crate::error::{Error, Result};
use crate::infra::pipe::{pipe, FrameWriter};
use crate::infra::ContainerIndex;

/// Interval between keepalive pings on the ssh socket
pub const PING_PERIOD: Duration = Duration::from_secs(54);

const OUTGOING_CAPACITY: usize = 1024;

pub struct LegacyExecService {
    adapter: Arc<RuntimeAdapter>,
    index: Arc<ContainerIndex>,
}

/// A command started by `StartCommand` and not finished yet
struct RunningCommand {
    stdin: Option<mpsc::Sender<Bytes>>,
    resize: Option<mpsc::Sender<TerminalSize>>,
    task: JoinHandle<()>,
}

impl RunningCommand {
    /// Forward client input or a resize event to the running command
    async fn deliver(&mut self, command: Command, uid: &str) {
        match command {
            Command::RawInput(text) => {
                if let Some(stdin) = &self.stdin {
                    if stdin.send(Bytes::from(text)).await.is_err() {
                        self.stdin = None;
                    }
                }
            }
            Command::Resize(size) => {
                if let Some(resize) = &self.resize {
                    if resize.send(size).await.is_err() {
                        debug!("resize channel closed, dropping {:?}, uid={}", size, uid);
                        self.resize = None;
                    }
                }
            }
            // Ending the command closes its stdin
            Command::End => self.stdin = None,
            Command::Start(_) => {}
        }
    }
}

fn exec_config(msg: &ExecMessage, attach_stdin: bool) -> ExecConfig {
    ExecConfig {
        user: msg.user.clone(),
        privileged: msg.privileged,
        tty: msg.tty,
        attach_stdin,
        attach_stdout: true,
        attach_stderr: true,
        env: msg.env.clone(),
        working_dir: msg.working_dir.clone(),
        cmd: msg.cmd.clone(),
    }
}

impl LegacyExecService {
    pub fn new(adapter: Arc<RuntimeAdapter>, index: Arc<ContainerIndex>) -> Self {
        Self { adapter, index }
    }

    /// Run a command to completion and return what it wrote to stdout
    pub async fn run_common(&self, msg: ExecMessage, uid: &str) -> Result<String> {
        msg.validate().map_err(Error::InvalidParameter)?;
        let container_id = self.index.container_id(&msg.pod_name)?;
        let config = ExecConfig {
            tty: false,
            ..exec_config(&msg, false)
        };

        let (stdout_tx, mut stdout) = pipe();
        let (stderr_tx, mut stderr) = pipe();
        let io = IoStreams {
            stdin: None,
            stdout: Some(Box::pin(FrameWriter::new(stdout_tx, |data| data))),
            stderr: Some(Box::pin(FrameWriter::new(stderr_tx, |data| data))),
        };

        let mut out = Vec::new();
        let mut err = Vec::new();
        let (result, _, _) = tokio::join!(
            self.adapter.exec(&container_id, &config, io, None),
            stdout.read_to_end(&mut out),
            stderr.read_to_end(&mut err),
        );

        let inspect = result?;
        if inspect.exit_code != 0 {
            warn!(
                "common exec exited with {}, stderr={}, uid={}",
                inspect.exit_code,
                String::from_utf8_lossy(&err),
                uid
            );
            return Err(Error::ExecFailed(
                Status::non_zero_exit(&config.cmd, inspect.exit_code).message,
            ));
        }
        Ok(String::from_utf8_lossy(&out).into_owned())
    }

    /// Serve an interactive session until the client goes away
    pub async fn serve_ssh<Tx, Rx, E>(self: Arc<Self>, sink: Tx, mut stream: Rx, uid: String)
    where
        Tx: Sink<WsMessage> + Send + Unpin + 'static,
        Tx::Error: std::fmt::Display,
        Rx: Stream<Item = std::result::Result<WsMessage, E>> + Unpin,
        E: std::fmt::Display,
    {
        let (out_tx, out_rx) = mpsc::channel(OUTGOING_CAPACITY);
        let writer = tokio::spawn(write_loop(sink, out_rx, uid.clone()));
        let mut running: Option<RunningCommand> = None;

        while let Some(frame) = stream.next().await {
            let payload = match frame {
                Ok(WsMessage::Text(text)) => Bytes::copy_from_slice(text.as_str().as_bytes()),
                Ok(WsMessage::Binary(data)) => data,
                Ok(WsMessage::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => {
                    info!("ssh socket read ended, err={}, uid={}", e, uid);
                    break;
                }
            };
            let envelope: Message = match serde_json::from_slice(&payload) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!("undecodable ssh message, err={}, uid={}", e, uid);
                    continue;
                }
            };
            let command = match envelope.into_command() {
                Ok(command) => command,
                Err(e) => {
                    warn!("{}, uid={}", e, uid);
                    continue;
                }
            };

            if running.as_ref().is_some_and(|r| r.task.is_finished()) {
                running = None;
            }

            let command = match command {
                Command::Start(msg) => {
                    if running.is_some() {
                        warn!("a command is already running, ignoring start, uid={}", uid);
                    } else {
                        running = self.start_command(msg, out_tx.clone(), &uid).await;
                    }
                    continue;
                }
                other => other,
            };
            let Some(cmd) = running.as_mut() else {
                warn!("no command running, dropping {:?}, uid={}", command, uid);
                continue;
            };
            cmd.deliver(command, &uid).await;
        }

        if let Some(cmd) = running {
            cmd.task.abort();
        }
        drop(out_tx);
        let _ = writer.await;
        info!("ssh session closed, uid={}", uid);
    }

    async fn start_command(
        &self,
        msg: ExecMessage,
        out: mpsc::Sender<Message>,
        uid: &str,
    ) -> Option<RunningCommand> {
        let container_id = match msg
            .validate()
            .map_err(Error::InvalidParameter)
            .and_then(|_| self.index.container_id(&msg.pod_name))
        {
            Ok(id) => id,
            Err(e) => {
                warn!("cannot start ssh command, err={}, uid={}", e, uid);
                let _ = out.send(Message::raw_input(format!("{}\r\n", e))).await;
                let _ = out.send(Message::end_command()).await;
                return None;
            }
        };

        let config = exec_config(&msg, true);
        let (stdin_tx, stdin) = pipe();
        let (resize_tx, resize_rx) = mpsc::channel(1);
        let to_envelope = |data: Bytes| Message::raw_input(String::from_utf8_lossy(&data));
        let io = IoStreams {
            stdin: Some(Box::pin(stdin)),
            stdout: Some(Box::pin(FrameWriter::new(out.clone(), to_envelope))),
            stderr: Some(Box::pin(FrameWriter::new(out.clone(), to_envelope))),
        };

        let adapter = self.adapter.clone();
        let uid = uid.to_string();
        info!("send interactive command to container {}, uid={}", container_id, uid);
        let task = tokio::spawn(async move {
            match adapter.exec(&container_id, &config, io, Some(resize_rx)).await {
                Ok(inspect) => info!(
                    "ssh command finished, exitCode={}, uid={}",
                    inspect.exit_code, uid
                ),
                Err(e) => warn!("failed exec ssh command, err={}, uid={}", e, uid),
            }
            let _ = out.send(Message::end_command()).await;
        });

        Some(RunningCommand {
            stdin: Some(stdin_tx),
            resize: Some(resize_tx),
            task,
        })
    }
}

async fn write_loop<Tx>(mut sink: Tx, mut rx: mpsc::Receiver<Message>, uid: String)
where
    Tx: Sink<WsMessage> + Unpin,
    Tx::Error: std::fmt::Display,
{
    let mut ping = interval_at(Instant::now() + PING_PERIOD, PING_PERIOD);
    loop {
        tokio::select! {
            next = rx.recv() => {
                let Some(envelope) = next else {
                    let _ = sink.send(WsMessage::Close(None)).await;
                    break;
                };
                let text = match serde_json::to_string(&envelope) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("encode ssh message failed, err={}, uid={}", e, uid);
                        continue;
                    }
                };
                if let Err(e) = sink.send(WsMessage::Text(text.into())).await {
                    debug!("ssh socket write failed, err={}, uid={}", e, uid);
                    break;
                }
            }
            _ = ping.tick() => {
                if sink.send(WsMessage::Ping(Bytes::new())).await.is_err() {
                    break;
                }
            }
        }
    }
    let _ = sink.close().await;
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::convert::Infallible;

    use futures::channel::mpsc as fmpsc;
    use serde_json::Value;
    use tokio_stream::wrappers::ReceiverStream;

    use super::*;
    use crate::config::Config;
    use crate::domain::message::{END_COMMAND_TYPE, RAW_INPUT_TYPE};
    use crate::domain::{ContainerSummary, ExecInspect};
    use crate::infra::container_index::{POD_CONTAINER_LABEL, POD_NAME_LABEL};
    use crate::infra::runtime::{AttachedStreams, MockRuntime, RuntimeOutput};

    fn index_with(pod: &str, container: &str) -> Arc<ContainerIndex> {
        let index = ContainerIndex::new();
        index.update(&[ContainerSummary {
            id: container.to_string(),
            image: "app:latest".to_string(),
            state: "running".to_string(),
            labels: HashMap::from([
                (POD_NAME_LABEL.to_string(), pod.to_string()),
                (POD_CONTAINER_LABEL.to_string(), "app".to_string()),
            ]),
        }]);
        Arc::new(index)
    }

    fn service(runtime: MockRuntime) -> LegacyExecService {
        let config = Config {
            exec_poll_interval: 1,
            ..Default::default()
        };
        LegacyExecService::new(
            Arc::new(RuntimeAdapter::new(Arc::new(runtime), &config)),
            index_with("web-0", "c1"),
        )
    }

    fn exec_message(pod: &str) -> ExecMessage {
        ExecMessage {
            pod_name: pod.to_string(),
            cmd: vec!["cat".to_string()],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_common_exec_returns_stdout() {
        let mut runtime = MockRuntime::new();
        runtime
            .expect_create_exec()
            .withf(|id, config| id.to_string() == "c1" && !config.tty && config.attach_stdout)
            .returning(|_, _| Ok("exec-1".to_string()));
        runtime.expect_start_exec().return_once(|_, _| {
            Ok(AttachedStreams {
                output: futures::stream::iter(vec![
                    Ok(RuntimeOutput::Stdout(Bytes::from_static(b"hello\n"))),
                    Ok(RuntimeOutput::Stderr(Bytes::from_static(b"noise\n"))),
                ])
                .boxed(),
                input: Box::pin(tokio::io::sink()),
            })
        });
        runtime
            .expect_inspect_exec()
            .returning(|_| Ok(ExecInspect::default()));

        let out = service(runtime)
            .run_common(exec_message("web-0"), "uid")
            .await
            .expect("Failed to run common exec");
        assert_eq!(out, "hello\n");
    }

    #[tokio::test]
    async fn test_common_exec_unknown_pod() {
        let result = service(MockRuntime::new())
            .run_common(exec_message("nope"), "uid")
            .await;
        assert!(matches!(result, Err(Error::ContainerNotFound(_))));
    }

    #[tokio::test]
    async fn test_common_exec_non_zero_exit_is_error() {
        let mut runtime = MockRuntime::new();
        runtime
            .expect_create_exec()
            .returning(|_, _| Ok("exec-1".to_string()));
        runtime.expect_start_exec().return_once(|_, _| {
            Ok(AttachedStreams {
                output: futures::stream::empty().boxed(),
                input: Box::pin(tokio::io::sink()),
            })
        });
        runtime.expect_inspect_exec().returning(|_| {
            Ok(ExecInspect {
                exit_code: 2,
                running: false,
            })
        });

        let result = service(runtime)
            .run_common(exec_message("web-0"), "uid")
            .await;
        assert!(matches!(result, Err(Error::ExecFailed(msg)) if msg.contains("exited with 2")));
    }

    #[tokio::test]
    async fn test_closed_resize_channel_is_dropped() {
        let (stdin_tx, mut stdin_rx) = mpsc::channel(1);
        let (resize_tx, resize_rx) = mpsc::channel(1);
        drop(resize_rx);
        let mut cmd = RunningCommand {
            stdin: Some(stdin_tx),
            resize: Some(resize_tx),
            task: tokio::spawn(async {}),
        };

        let size = TerminalSize {
            width: 80,
            height: 24,
        };
        cmd.deliver(Command::Resize(size), "uid").await;
        assert!(cmd.resize.is_none());
        cmd.deliver(Command::Resize(size), "uid").await;

        cmd.deliver(Command::RawInput("ls\n".to_string()), "uid").await;
        assert_eq!(stdin_rx.recv().await.unwrap(), Bytes::from_static(b"ls\n"));

        cmd.deliver(Command::End, "uid").await;
        assert!(cmd.stdin.is_none());
    }

    fn envelope(text: &str) -> std::result::Result<WsMessage, Infallible> {
        Ok(WsMessage::Text(text.into()))
    }

    fn decode(msg: WsMessage) -> Message {
        match msg {
            WsMessage::Text(text) => serde_json::from_str(text.as_str()).unwrap(),
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_ssh_session_runs_command_and_sends_end() {
        let (out_tx, out_rx) = mpsc::channel::<Result<RuntimeOutput>>(4);
        let (input_w, mut input_r) = tokio::io::duplex(1024);

        let mut runtime = MockRuntime::new();
        runtime
            .expect_create_exec()
            .withf(|_, config| config.attach_stdin && config.cmd == vec!["cat"])
            .returning(|_, _| Ok("exec-1".to_string()));
        runtime.expect_start_exec().return_once(move |_, _| {
            Ok(AttachedStreams {
                output: ReceiverStream::new(out_rx).boxed(),
                input: Box::pin(input_w),
            })
        });
        runtime
            .expect_inspect_exec()
            .returning(|_| Ok(ExecInspect::default()));

        let (client_tx, server_rx) = fmpsc::unbounded();
        let (server_tx, mut client_rx) = fmpsc::unbounded::<WsMessage>();
        let session = tokio::spawn(Arc::new(service(runtime)).serve_ssh(
            server_tx,
            server_rx,
            "uid".to_string(),
        ));

        client_tx
            .unbounded_send(envelope(r#"{"messageType":3,"data":{"podName":"web-0","cmd":["cat"]}}"#))
            .unwrap();
        client_tx
            .unbounded_send(envelope(r#"{"messageType":5,"data":"ping\n"}"#))
            .unwrap();

        let mut typed = [0u8; 5];
        input_r.read_exact(&mut typed).await.unwrap();
        assert_eq!(&typed, b"ping\n");

        out_tx
            .send(Ok(RuntimeOutput::Stdout(Bytes::from_static(b"pong\n"))))
            .await
            .unwrap();
        let first = decode(client_rx.next().await.unwrap());
        assert_eq!(first.message_type, RAW_INPUT_TYPE);
        assert_eq!(first.data, Value::String("pong\n".to_string()));

        drop(out_tx);
        let end = decode(client_rx.next().await.unwrap());
        assert_eq!(end.message_type, END_COMMAND_TYPE);

        drop(client_tx);
        session.await.unwrap();
    }

    #[tokio::test]
    async fn test_ssh_start_for_unknown_pod_ends_immediately() {
        let (client_tx, server_rx) = fmpsc::unbounded();
        let (server_tx, mut client_rx) = fmpsc::unbounded::<WsMessage>();
        let session = tokio::spawn(Arc::new(service(MockRuntime::new())).serve_ssh(
            server_tx,
            server_rx,
            "uid".to_string(),
        ));

        client_tx
            .unbounded_send(envelope(r#"{"messageType":3,"data":{"podName":"ghost","cmd":["sh"]}}"#))
            .unwrap();

        let error = decode(client_rx.next().await.unwrap());
        assert_eq!(error.message_type, RAW_INPUT_TYPE);
        assert!(error.data.as_str().unwrap().contains("ghost"));
        let end = decode(client_rx.next().await.unwrap());
        assert_eq!(end.message_type, END_COMMAND_TYPE);

        drop(client_tx);
        session.await.unwrap();
    }
}
