//! Pod name to container id index, refreshed from the runtime's container list

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::runtime::Runtime;
use crate::domain::ContainerSummary;
use crate::error::{Error, Result};

pub const POD_NAME_LABEL: &str = "io.kubernetes.pod.name";
pub const POD_CONTAINER_LABEL: &str = "io.kubernetes.container.name";
pub const POD_UID_LABEL: &str = "io.kubernetes.pod.uid";

/// Business containers of the pods running on this node
#[derive(Default)]
pub struct ContainerIndex {
    container_by_pod: DashMap<String, String>,
    pod_by_uid: DashMap<String, String>,
}

impl ContainerIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve the business container of a pod, given its name or its uid
    pub fn container_id(&self, pod: &str) -> Result<String> {
        if let Some(id) = self.container_by_pod.get(pod) {
            return Ok(id.value().clone());
        }
        self.pod_name_by_uid(pod)
            .and_then(|name| self.container_by_pod.get(&name).map(|id| id.value().clone()))
            .ok_or_else(|| Error::ContainerNotFound(pod.to_string()))
    }

    fn pod_name_by_uid(&self, pod_uid: &str) -> Option<String> {
        self.pod_by_uid.get(pod_uid).map(|name| name.value().clone())
    }

    pub fn len(&self) -> usize {
        self.container_by_pod.len()
    }

    pub fn is_empty(&self) -> bool {
        self.container_by_pod.is_empty()
    }

    /// Merge a container listing into the index
    pub fn update(&self, containers: &[ContainerSummary]) {
        for c in containers {
            if c.image.to_lowercase().contains("pause") {
                continue;
            }
            if !c.state.to_lowercase().contains("running") {
                continue;
            }
            match c.labels.get(POD_CONTAINER_LABEL) {
                Some(name) if !name.to_lowercase().contains("init-") => {}
                _ => {
                    debug!("no containerName label or init container for id={}", c.id);
                    continue;
                }
            }
            let Some(pod_name) = c.labels.get(POD_NAME_LABEL) else {
                warn!("no podName label exist for id={}", c.id);
                continue;
            };

            if let Some(existing) = self.container_by_pod.get(pod_name) {
                if existing.value() != &c.id {
                    info!(
                        "pod name={} updated, container id from={} to={}",
                        pod_name,
                        existing.value(),
                        c.id
                    );
                }
            }
            self.container_by_pod.insert(pod_name.clone(), c.id.clone());

            match c.labels.get(POD_UID_LABEL) {
                Some(uid) => {
                    self.pod_by_uid.insert(uid.clone(), pod_name.clone());
                }
                None => warn!("no podUid label exist for id={}", c.id),
            }
        }
    }

    /// Fetch the container list once and merge it
    pub async fn refresh(&self, runtime: &dyn Runtime) -> Result<()> {
        let containers = runtime.list_containers().await?;
        self.update(&containers);
        Ok(())
    }

    /// Refresh on a fixed interval until `shutdown` fires
    pub fn spawn_refresh(
        self: Arc<Self>,
        runtime: Arc<dyn Runtime>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Start container index refresh every {:?}", interval);
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.refresh(runtime.as_ref()).await {
                            warn!("get container list failed, err={}", e);
                        }
                    }
                    _ = shutdown.cancelled() => {
                        info!("Stop container index refresh");
                        break;
                    }
                }
            }
        })
    }
}
