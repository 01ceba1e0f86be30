//! Streaming server: serves exec and attach requests directly or through
//! single-use tokens handed out by the prepare endpoints

use std::sync::Arc;

use axum::{extract::Request, response::Response};
use tracing::info;

use super::exec::RuntimeAdapter;
use super::remotecommand::{self, create_streams, StreamSettings};
use super::request_cache::RequestCache;
use crate::config::Config;
use crate::domain::{AttachRequest, ExecRequest};
use crate::error::{Error, Result};

/// Request stored between prepare and serve
#[derive(Debug, Clone)]
pub enum PreparedRequest {
    Exec(ExecRequest),
    Attach(AttachRequest),
}

pub struct StreamingServer {
    adapter: Arc<RuntimeAdapter>,
    settings: StreamSettings,
    cache: RequestCache<PreparedRequest>,
    base_path: String,
}

impl StreamingServer {
    pub fn new(adapter: Arc<RuntimeAdapter>, config: &Config, base_path: impl Into<String>) -> Self {
        Self {
            adapter,
            settings: StreamSettings::from_config(config),
            cache: RequestCache::new(
                config.cache_ttl(),
                config.request_cache_max_in_flight,
                config.request_cache_token_len,
            ),
            base_path: base_path.into(),
        }
    }

    /// Cache a validated exec request and return the URL that serves it
    pub fn prepare_exec(&self, req: ExecRequest) -> Result<String> {
        req.validate()
            .map_err(|e| Error::InvalidParameter(e.to_string()))?;
        let token = self.cache.insert(PreparedRequest::Exec(req))?;
        Ok(format!("{}/exec/{}", self.base_path, token))
    }

    /// Cache a validated attach request and return the URL that serves it
    pub fn prepare_attach(&self, req: AttachRequest) -> Result<String> {
        req.validate()
            .map_err(|e| Error::InvalidParameter(e.to_string()))?;
        let token = self.cache.insert(PreparedRequest::Attach(req))?;
        Ok(format!("{}/attach/{}", self.base_path, token))
    }

    /// Take the exec request behind `token`; a token of another kind is gone as well
    pub fn consume_exec(&self, token: &str) -> Result<ExecRequest> {
        match self.cache.consume(token)? {
            PreparedRequest::Exec(req) => Ok(req),
            PreparedRequest::Attach(_) => Err(Error::TokenNotFound),
        }
    }

    pub fn consume_attach(&self, token: &str) -> Result<AttachRequest> {
        match self.cache.consume(token)? {
            PreparedRequest::Attach(req) => Ok(req),
            PreparedRequest::Exec(_) => Err(Error::TokenNotFound),
        }
    }

    /// Negotiate streams for a validated exec request and run it
    pub async fn serve_exec(&self, request: Request, exec: ExecRequest, uid: String) -> Response {
        info!(
            "serve exec, containerId={}, cmd={:?}, uid={}",
            exec.container_id, exec.cmd, uid
        );
        let adapter = self.adapter.clone();
        let opts = exec.stream_options();
        let config = exec.exec_config();
        let container_id = exec.container_id;
        let session_uid = uid.clone();

        create_streams(request, opts, &self.settings, uid, move |bundle| {
            remotecommand::serve_exec(bundle, adapter, container_id, config, session_uid)
        })
        .await
    }

    /// Negotiate streams for a validated attach request and run it
    pub async fn serve_attach(
        &self,
        request: Request,
        attach: AttachRequest,
        uid: String,
    ) -> Response {
        info!("serve attach, containerId={}, uid={}", attach.container_id, uid);
        let adapter = self.adapter.clone();
        let opts = attach.stream_options();
        let container_id = attach.container_id;
        let session_uid = uid.clone();

        create_streams(request, opts, &self.settings, uid, move |bundle| {
            remotecommand::serve_attach(bundle, adapter, container_id, session_uid)
        })
        .await
    }
}
