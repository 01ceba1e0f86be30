//! Infrastructure: container runtime access and the streaming transports

pub mod container_index;
pub mod docker;
pub mod idle;
pub mod pipe;
pub mod runtime;
pub mod spdy;
pub mod wsstream;

pub use container_index::ContainerIndex;
pub use docker::DockerRuntime;
pub use idle::IdleTimer;
pub use runtime::{AttachOptions, AttachedStreams, ResizeTarget, Runtime, RuntimeOutput};
