//! Node exec agent
//!
//! Serves container exec and attach over WebSocket channel framing and
//! SPDY/3.1 remote-command streams, plus the pod-addressed legacy endpoints.

use std::sync::Arc;

pub mod api;
pub mod config;
pub mod domain;
pub mod error;
pub mod infra;
pub mod service;

pub use config::Config;
pub use error::{Error, Result};

use infra::{ContainerIndex, Runtime};
use service::{AccessTokenValidator, LegacyExecService, RuntimeAdapter, StreamingServer};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub streaming: Arc<StreamingServer>,
    pub legacy: Arc<LegacyExecService>,
    pub auth: Arc<AccessTokenValidator>,
    pub index: Arc<ContainerIndex>,
}

impl AppState {
    /// Wire every service on top of a runtime and a container index
    pub fn new(config: Arc<Config>, runtime: Arc<dyn Runtime>, index: Arc<ContainerIndex>) -> Self {
        let adapter = Arc::new(RuntimeAdapter::new(runtime, &config));
        let streaming = Arc::new(StreamingServer::new(
            adapter.clone(),
            &config,
            api::http::BASE_PATH,
        ));
        let legacy = Arc::new(LegacyExecService::new(adapter, index.clone()));
        let auth = Arc::new(AccessTokenValidator::from_config(&config));

        Self {
            config,
            streaming,
            legacy,
            auth,
            index,
        }
    }
}
