//! Run exec and attach sessions over a negotiated stream bundle and report the outcome

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::StreamBundle;
use crate::domain::{ExecConfig, ExecInspect, Status};
use crate::error::Result;
use crate::service::exec::{IoStreams, RuntimeAdapter};

/// Map an exec outcome to the status reported on the error stream
pub fn exec_status(cmd: &[String], result: &Result<ExecInspect>) -> Status {
    match result {
        Ok(inspect) if inspect.exit_code != 0 => Status::non_zero_exit(cmd, inspect.exit_code),
        Ok(_) => Status::success(),
        Err(e) => Status::internal_error(e),
    }
}

pub async fn serve_exec(
    bundle: StreamBundle,
    adapter: Arc<RuntimeAdapter>,
    container_id: String,
    config: ExecConfig,
    uid: String,
) {
    let StreamBundle {
        stdin,
        stdout,
        stderr,
        resize,
        mut status,
        conn,
        ..
    } = bundle;
    let io = IoStreams {
        stdin,
        stdout,
        stderr,
    };

    let result = tokio::select! {
        result = adapter.exec(&container_id, &config, io, resize) => result,
        _ = conn.closed() => {
            info!("client went away before exec finished, uid={}", uid);
            conn.close().await;
            return;
        }
    };

    match &result {
        Ok(inspect) => info!(
            "exec finished, exitCode={}, running={}, uid={}",
            inspect.exit_code, inspect.running, uid
        ),
        Err(e) => warn!("exec in container {} failed, err={}, uid={}", container_id, e, uid),
    }

    if let Err(e) = status.write(&exec_status(&config.cmd, &result)).await {
        debug!("write exec status failed, err={}, uid={}", e, uid);
    }
    conn.close().await;
}

pub async fn serve_attach(
    bundle: StreamBundle,
    adapter: Arc<RuntimeAdapter>,
    container_id: String,
    uid: String,
) {
    let StreamBundle {
        stdin,
        stdout,
        stderr,
        resize,
        tty,
        mut status,
        conn,
    } = bundle;
    let io = IoStreams {
        stdin,
        stdout,
        stderr,
    };

    let result = tokio::select! {
        result = adapter.attach(&container_id, io, tty, resize) => result,
        _ = conn.closed() => {
            info!("client went away while attached, uid={}", uid);
            conn.close().await;
            return;
        }
    };

    let outcome = match result {
        Ok(()) => Status::success(),
        Err(e) => {
            warn!("attach to container {} failed, err={}, uid={}", container_id, e, uid);
            Status::attach_error(e)
        }
    };
    if let Err(e) = status.write(&outcome).await {
        debug!("write attach status failed, err={}, uid={}", e, uid);
    }
    conn.close().await;
}
