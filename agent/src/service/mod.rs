//! Service layer: request validation, stream negotiation and exec orchestration

pub mod auth;
pub mod exec;
pub mod legacy;
pub mod remotecommand;
pub mod request_cache;
pub mod streaming;

pub use auth::AccessTokenValidator;
pub use exec::RuntimeAdapter;
pub use legacy::LegacyExecService;
pub use streaming::StreamingServer;
