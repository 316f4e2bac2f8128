//! Watch-to-notification bridge.
//!
//! One watcher task per watched namespace turns pod watch events into
//! [`Notification`]s on the engine's channel. Delivery is at-least-once
//! and carries identity only; the reconciler re-fetches pod state and the
//! dedup cache absorbs redelivery.

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::Api;
use kube::runtime::watcher::{self, watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use podtail_engine::Query;
use podtail_types::{NamespaceScope, Notification, NotificationKind, PodId};

/// The namespaces a scope expands to. Cluster-wide scope is one empty
/// entry, matching the API convention for "all namespaces".
#[must_use]
pub fn resolve_namespaces(scope: &NamespaceScope, context_namespace: Option<&str>) -> Vec<String> {
    match scope {
        NamespaceScope::All => vec![String::new()],
        NamespaceScope::List(namespaces) => namespaces.clone(),
        NamespaceScope::Current => vec![context_namespace.unwrap_or("default").to_string()],
    }
}

/// Spawn a watcher forwarding pod changes in `namespace` (empty for the
/// whole cluster) until `cancel` fires or the channel closes.
///
/// Only pods within the query's scope are forwarded; per-container
/// decisions stay with the reconciler. Watch errors are logged and the
/// watcher restarts itself.
pub fn spawn_pod_watcher(
    client: kube::Client,
    namespace: String,
    selector: Option<String>,
    query: Arc<Query>,
    tx: mpsc::Sender<Notification>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let api: Api<Pod> = if namespace.is_empty() {
            Api::all(client)
        } else {
            Api::namespaced(client, &namespace)
        };
        let mut config = watcher::Config::default();
        if let Some(selector) = &selector {
            config = config.labels(selector);
        }

        let stream = watcher(api, config);
        futures::pin_mut!(stream);

        loop {
            let item = tokio::select! {
                () = cancel.cancelled() => {
                    debug!(namespace = %scope_label(&namespace), "pod watch cancelled");
                    return;
                }
                item = stream.next() => item,
            };
            let Some(event) = item else {
                warn!(namespace = %scope_label(&namespace), "pod watch stream ended");
                return;
            };
            match event {
                Ok(watcher::Event::Apply(pod) | watcher::Event::InitApply(pod)) => {
                    if !forward(&query, &tx, &pod, NotificationKind::Upsert).await {
                        return;
                    }
                }
                Ok(watcher::Event::Delete(pod)) => {
                    if !forward(&query, &tx, &pod, NotificationKind::Delete).await {
                        return;
                    }
                }
                Ok(watcher::Event::Init) => {
                    debug!(namespace = %scope_label(&namespace), "pod watch initialized");
                }
                Ok(watcher::Event::InitDone) => {
                    debug!(namespace = %scope_label(&namespace), "initial pod sync complete");
                }
                Err(error) => {
                    warn!(%error, namespace = %scope_label(&namespace), "pod watch error, retrying");
                }
            }
        }
    })
}

/// Send one notification; returns false once the engine side is gone.
async fn forward(
    query: &Query,
    tx: &mpsc::Sender<Notification>,
    pod: &Pod,
    kind: NotificationKind,
) -> bool {
    let Some(id) = pod_id(pod) else {
        return true;
    };
    if !query.pod_in_scope(&id) {
        return true;
    }
    if tx.send(Notification { id, kind }).await.is_err() {
        debug!("notification channel closed, stopping pod watch");
        return false;
    }
    true
}

/// Identity from watch metadata; a pod missing either name is
/// unaddressable and skipped.
fn pod_id(pod: &Pod) -> Option<PodId> {
    let name = pod.metadata.name.clone()?;
    let namespace = pod.metadata.namespace.clone()?;
    Some(PodId::new(namespace, name))
}

fn scope_label(namespace: &str) -> &str {
    if namespace.is_empty() { "*" } else { namespace }
}
