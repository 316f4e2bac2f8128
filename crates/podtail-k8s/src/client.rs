//! Cluster access through the `kube` client.

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ContainerState as K8sContainerState, ContainerStatus, Pod};
use kube::Api;
use kube::api::LogParams;
use kube::config::{KubeConfigOptions, Kubeconfig};

use podtail_engine::{Cluster, ClusterError, LogStream, LogStreamOptions};
use podtail_types::{ContainerRef, ContainerState, ObservedContainer, PodId, PodSnapshot};

/// [`Cluster`] implementation backed by a real API server.
pub struct KubeCluster {
    client: kube::Client,
    context_namespace: Option<String>,
}

impl KubeCluster {
    /// Connect using the kubeconfig's current context.
    pub async fn connect() -> Result<Self> {
        let kubeconfig =
            Kubeconfig::read().context("Failed to read kubeconfig. Is kubectl configured?")?;
        let current_context = kubeconfig.current_context.clone();
        let context_namespace = context_namespace(&kubeconfig, current_context.as_deref());

        let config = kube::Config::from_custom_kubeconfig(
            kubeconfig,
            &KubeConfigOptions {
                context: current_context,
                ..Default::default()
            },
        )
        .await
        .context("Failed to create config from kubeconfig")?;

        let client = kube::Client::try_from(config).context("Failed to create cluster client")?;

        Ok(Self {
            client,
            context_namespace,
        })
    }

    /// The namespace the current kubeconfig context names, if any.
    #[must_use]
    pub fn context_namespace(&self) -> Option<&str> {
        self.context_namespace.as_deref()
    }

    /// A client handle for spawning watchers against the same cluster.
    #[must_use]
    pub fn client(&self) -> kube::Client {
        self.client.clone()
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl Cluster for KubeCluster {
    async fn get_pod(&self, id: &PodId) -> Result<PodSnapshot, ClusterError> {
        let pod = self
            .pods(&id.namespace)
            .get(&id.name)
            .await
            .map_err(classify)?;
        Ok(snapshot(id, pod))
    }

    async fn open_log_stream(
        &self,
        target: &ContainerRef,
        options: &LogStreamOptions,
    ) -> Result<LogStream, ClusterError> {
        let params = LogParams {
            container: Some(target.container.clone()),
            follow: options.follow,
            since_seconds: options.since_seconds,
            tail_lines: options.tail_lines,
            timestamps: options.timestamps,
            ..Default::default()
        };
        let stream = self
            .pods(&target.pod.namespace)
            .log_stream(&target.pod.name, &params)
            .await
            .map_err(classify)?;
        Ok(Box::pin(stream))
    }
}

/// Map a `kube` failure onto the engine's error taxonomy.
///
/// 404 means the pod or container is gone. The kubelet answers 400 while a
/// container is still creating, so 400 is retried like any transient fault.
fn classify(error: kube::Error) -> ClusterError {
    match error {
        kube::Error::Api(response) if response.code == 404 => ClusterError::NotFound,
        kube::Error::Api(response) if response.code == 400 => {
            ClusterError::Transient(response.message)
        }
        other => ClusterError::Api(Box::new(other)),
    }
}

/// The namespace `context` names in the kubeconfig, if both exist.
fn context_namespace(kubeconfig: &Kubeconfig, context: Option<&str>) -> Option<String> {
    let name = context?;
    kubeconfig
        .contexts
        .iter()
        .find(|ctx| ctx.name == name)
        .and_then(|ctx| ctx.context.as_ref())
        .and_then(|ctx| ctx.namespace.clone())
}

/// Observed containers in spec order, init containers first.
fn snapshot(id: &PodId, pod: Pod) -> PodSnapshot {
    let mut containers = Vec::new();
    if let Some(status) = pod.status {
        for observed in status.init_container_statuses.unwrap_or_default() {
            containers.push(observe(observed, true));
        }
        for observed in status.container_statuses.unwrap_or_default() {
            containers.push(observe(observed, false));
        }
    }
    PodSnapshot::with_containers(id.clone(), containers)
}

fn observe(status: ContainerStatus, init: bool) -> ObservedContainer {
    let state = status.state.as_ref().and_then(runtime_state);
    ObservedContainer::new(status.name, init, state)
}

fn runtime_state(state: &K8sContainerState) -> Option<ContainerState> {
    if state.running.is_some() {
        Some(ContainerState::Running)
    } else if state.waiting.is_some() {
        Some(ContainerState::Waiting)
    } else if state.terminated.is_some() {
        Some(ContainerState::Terminated)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::{
        ContainerStateRunning, ContainerStateTerminated, ContainerStateWaiting, PodStatus,
    };
    use kube::core::ErrorResponse;

    use super::*;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: format!("status {code}"),
            reason: String::new(),
            code,
        })
    }

    fn with_state(name: &str, state: K8sContainerState) -> ContainerStatus {
        ContainerStatus {
            name: name.to_string(),
            state: Some(state),
            ..Default::default()
        }
    }

    #[test]
    fn test_classify_404_is_not_found() {
        assert!(classify(api_error(404)).is_not_found());
    }

    #[test]
    fn test_classify_400_is_transient() {
        assert!(classify(api_error(400)).is_transient());
    }

    #[test]
    fn test_classify_other_errors_surface_as_api() {
        let error = classify(api_error(500));
        assert!(!error.is_not_found());
        assert!(!error.is_transient());
    }

    #[test]
    fn test_snapshot_orders_init_containers_first() {
        let id = PodId::new("default", "web-1");
        let pod = Pod {
            status: Some(PodStatus {
                init_container_statuses: Some(vec![with_state(
                    "init-db",
                    K8sContainerState {
                        terminated: Some(ContainerStateTerminated::default()),
                        ..Default::default()
                    },
                )]),
                container_statuses: Some(vec![
                    with_state(
                        "app",
                        K8sContainerState {
                            running: Some(ContainerStateRunning::default()),
                            ..Default::default()
                        },
                    ),
                    with_state(
                        "lazy",
                        K8sContainerState {
                            waiting: Some(ContainerStateWaiting::default()),
                            ..Default::default()
                        },
                    ),
                ]),
                ..Default::default()
            }),
            ..Default::default()
        };

        let snapshot = snapshot(&id, pod);
        assert_eq!(snapshot.id, id);
        assert_eq!(
            snapshot.containers,
            vec![
                ObservedContainer::new("init-db", true, Some(ContainerState::Terminated)),
                ObservedContainer::new("app", false, Some(ContainerState::Running)),
                ObservedContainer::new("lazy", false, Some(ContainerState::Waiting)),
            ]
        );
    }

    #[test]
    fn test_snapshot_without_status_has_no_containers() {
        let id = PodId::new("default", "web-1");
        let snapshot = snapshot(&id, Pod::default());
        assert!(snapshot.containers.is_empty());
    }

    #[test]
    fn test_statusless_container_has_no_state() {
        let id = PodId::new("default", "web-1");
        let pod = Pod {
            status: Some(PodStatus {
                container_statuses: Some(vec![ContainerStatus {
                    name: "app".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };

        let snapshot = snapshot(&id, pod);
        assert_eq!(snapshot.containers[0].state, None);
    }

    #[test]
    fn test_context_namespace_follows_named_context() {
        let kubeconfig: Kubeconfig = serde_json::from_value(serde_json::json!({
            "apiVersion": "v1",
            "kind": "Config",
            "current-context": "dev",
            "contexts": [
                {"name": "dev", "context": {"cluster": "dev", "namespace": "team-a"}},
                {"name": "prod", "context": {"cluster": "prod"}},
            ],
            "clusters": [],
            "users": [],
        }))
        .unwrap();

        assert_eq!(
            context_namespace(&kubeconfig, Some("dev")),
            Some("team-a".to_string())
        );
        assert_eq!(context_namespace(&kubeconfig, Some("prod")), None);
        assert_eq!(context_namespace(&kubeconfig, Some("missing")), None);
        assert_eq!(context_namespace(&kubeconfig, None), None);
    }
}
