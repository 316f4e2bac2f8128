//! Top-level reconciliation state machine.
//!
//! The reconciler consumes pod-change notifications, fetches current pod
//! state, asks the [`PodFilter`] which container streams should exist, and
//! drives the dedup cache, the active index, and the stream pool to make
//! reality match. Notifications are processed with bounded concurrency,
//! separate from the pool's bound on open streams.
//!
//! It never invents its own retry loop for pod fetches: a failed fetch
//! drops the notification and relies on the watch provider's redelivery.

use std::sync::Arc;

use podtail_types::{ContainerRef, Notification, NotificationKind, PodId, PodSnapshot, TailState};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::cluster::{Cluster, LogStreamOptions};
use crate::color::ColorPalette;
use crate::config::EngineConfig;
use crate::dedup::DedupCache;
use crate::format::LogFormatter;
use crate::pool::StreamPool;
use crate::predicate::PodFilter;
use crate::query::Query;
use crate::reader::{ActiveIndex, StreamContext, StreamTask};
use crate::sink::OutputSink;

/// Drives container streams from pod-change notifications.
pub struct Reconciler {
    cluster: Arc<dyn Cluster>,
    filter: PodFilter,
    palette: Arc<ColorPalette>,
    dedup: Arc<DedupCache>,
    active: Arc<ActiveIndex>,
    pool: StreamPool,
    concurrency: usize,
}

impl Reconciler {
    /// Wire up a full engine: dedup cache, active index, stream pool, and
    /// the reconciler on top. Streams and workers are cancelled when
    /// `parent` is.
    pub fn new(
        cluster: Arc<dyn Cluster>,
        query: Arc<Query>,
        formatter: Arc<LogFormatter>,
        sink: Arc<OutputSink>,
        config: &EngineConfig,
        use_color: bool,
        parent: &CancellationToken,
    ) -> Arc<Self> {
        let palette = Arc::new(ColorPalette::new());
        let dedup = Arc::new(DedupCache::new(config.dedup_capacity));
        let active = Arc::new(ActiveIndex::new());
        let ctx = Arc::new(StreamContext {
            cluster: Arc::clone(&cluster),
            query: Arc::clone(&query),
            formatter,
            sink: Arc::clone(&sink),
            dedup: Arc::clone(&dedup),
            active: Arc::clone(&active),
            options: LogStreamOptions::from_config(config),
            namespaced: config.namespaced,
        });
        let pool = StreamPool::new(ctx, config, parent);
        let filter = PodFilter::new(
            Arc::clone(&query),
            Arc::clone(&palette),
            sink,
            config.namespaced,
            use_color,
        );
        Arc::new(Self {
            cluster,
            filter,
            palette,
            dedup,
            active,
            pool,
            concurrency: config.concurrency,
        })
    }

    /// Consume notifications until `cancel` fires or the channel closes,
    /// then drain in-flight reconciliations and stop every stream.
    pub async fn run(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<Notification>,
        cancel: CancellationToken,
    ) {
        let mut inflight: JoinSet<()> = JoinSet::new();
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                Some(result) = inflight.join_next(), if !inflight.is_empty() => {
                    if let Err(join_error) = result {
                        if join_error.is_panic() {
                            error!(%join_error, "reconciliation panicked");
                        }
                    }
                }
                maybe = rx.recv(), if inflight.len() < self.concurrency => match maybe {
                    Some(notification) => {
                        let this = Arc::clone(&self);
                        inflight.spawn(async move { this.reconcile(notification).await });
                    }
                    None => break,
                },
            }
        }
        while inflight.join_next().await.is_some() {}
        self.pool.shutdown().await;
    }

    async fn reconcile(&self, notification: Notification) {
        match notification.kind {
            NotificationKind::Upsert => self.upsert(notification.id).await,
            NotificationKind::Delete => self.remove(&notification.id),
        }
    }

    async fn upsert(&self, id: PodId) {
        let snapshot = match self.cluster.get_pod(&id).await {
            Ok(snapshot) => snapshot,
            Err(error) if error.is_not_found() => {
                debug!(pod = %id, "pod gone before reconciliation");
                self.remove(&id);
                return;
            }
            Err(error) => {
                warn!(%error, pod = %id, "failed to fetch pod, dropping notification");
                return;
            }
        };
        self.apply(&snapshot);
    }

    /// Reconcile one observed pod state: start what should stream, stop
    /// what should not.
    fn apply(&self, snapshot: &PodSnapshot) {
        let start = self.filter.on_apply(snapshot);
        for target in &start {
            self.start_stream(target);
        }

        let mut stop: Vec<ContainerRef> = self
            .filter
            .on_delete(snapshot)
            .into_iter()
            .filter(|t| !start.contains(t))
            .collect();
        // Running tasks whose container vanished from the status list stop
        // too; the predicate cannot see those.
        for target in self.active.refs_for_pod(&snapshot.id) {
            if !start.contains(&target) && !stop.contains(&target) {
                stop.push(target);
            }
        }
        for target in &stop {
            self.stop_stream(target);
        }
    }

    fn start_stream(&self, target: &ContainerRef) {
        let transition = self.dedup.check_and_mark(target, TailState::Streaming);
        if !transition.changed {
            return;
        }
        if self.active.contains(target) {
            // A task for this container is still winding down, or its
            // cache entry was evicted while the task ran. Restore the
            // previous state and wait for a redelivery once the slot is
            // free; never run two streams for one container.
            self.dedup.restore(target, transition.previous);
            debug!(container = %target, "stream still active, suppressing restart");
            return;
        }
        if transition.previous != Some(TailState::Announced) {
            self.filter.announce_started(target);
        }

        let cancel = self.pool.stream_token();
        let id = self.active.insert(target, cancel.clone());
        let task = StreamTask {
            target: target.clone(),
            colors: self.palette.pair_for(&target.pod.name),
            cancel,
            id,
        };
        if let Err(error) = self.pool.submit(task) {
            warn!(%error, container = %target, "stream rejected, waiting for redelivery");
            self.active.remove_task(target, id);
            // Keep the announcement on the books so the retry after
            // redelivery does not announce a second time.
            self.dedup.check_and_mark(target, TailState::Announced);
        }
    }

    fn stop_stream(&self, target: &ContainerRef) {
        let transition = self.dedup.check_and_mark(target, TailState::Stopped);
        if transition.previous.is_none() && !self.active.contains(target) {
            // Nothing ever started for this container, so there is nothing
            // to stop or announce. Common for containers that were already
            // terminated when the session began.
            self.dedup.restore(target, None);
            return;
        }
        if transition.changed {
            self.filter.announce_stopped(target);
        }
        self.active.cancel(target);
    }

    /// Delete handling: stop everything the pod still runs, then let go of
    /// its cache entries.
    fn remove(&self, pod: &PodId) {
        for target in self.active.refs_for_pod(pod) {
            self.stop_stream(&target);
        }
        self.dedup.forget_pod(pod);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use podtail_types::{ContainerState, ObservedContainer};
    use tokio::task::JoinHandle;

    use super::*;
    use crate::cluster::ClusterError;
    use crate::cluster::mock::{MockCluster, StreamScript};
    use crate::format::OutputFormat;
    use crate::sink::CapturedOutput;

    struct Rig {
        cluster: Arc<MockCluster>,
        reconciler: Arc<Reconciler>,
        tx: mpsc::Sender<Notification>,
        cancel: CancellationToken,
        capture: CapturedOutput,
        handle: JoinHandle<()>,
    }

    impl Rig {
        fn new(query: Query, config: EngineConfig) -> Self {
            let cluster = Arc::new(MockCluster::new());
            let (sink, capture) = OutputSink::memory();
            let formatter =
                LogFormatter::from_options(None, OutputFormat::Default, false).unwrap();
            let cancel = CancellationToken::new();
            let reconciler = Reconciler::new(
                Arc::clone(&cluster) as Arc<dyn Cluster>,
                Arc::new(query),
                Arc::new(formatter),
                Arc::new(sink),
                &config,
                false,
                &cancel,
            );
            let (tx, rx) = mpsc::channel(256);
            let handle = tokio::spawn(Arc::clone(&reconciler).run(rx, cancel.clone()));
            Self {
                cluster,
                reconciler,
                tx,
                cancel,
                capture,
                handle,
            }
        }

        fn with_defaults() -> Self {
            Self::new(Query::new(".*", ".*").unwrap(), EngineConfig::default())
        }

        fn running_pod(&self, name: &str, containers: &[&str]) -> PodId {
            let id = PodId::new("prod", name);
            let observed = containers
                .iter()
                .map(|c| ObservedContainer::new(*c, false, Some(ContainerState::Running)))
                .collect();
            self.cluster
                .put_pod(PodSnapshot::with_containers(id.clone(), observed));
            id
        }

        async fn notify_upsert(&self, id: &PodId) {
            self.tx.send(Notification::upsert(id.clone())).await.unwrap();
        }

        async fn notify_delete(&self, id: &PodId) {
            self.tx.send(Notification::delete(id.clone())).await.unwrap();
        }

        fn count_line(&self, needle: &str) -> usize {
            self.capture
                .lines()
                .iter()
                .filter(|l| l.as_str() == needle)
                .count()
        }

        async fn finish(self) {
            self.cancel.cancel();
            tokio::time::timeout(Duration::from_secs(5), self.handle)
                .await
                .unwrap()
                .unwrap();
        }
    }

    async fn wait_until(timeout_ms: u64, mut cond: impl FnMut() -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
        while tokio::time::Instant::now() < deadline {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cond()
    }

    fn target(pod: &str, container: &str) -> ContainerRef {
        ContainerRef::new(PodId::new("prod", pod), container, false)
    }

    #[tokio::test]
    async fn test_upsert_announces_then_streams() {
        let rig = Rig::with_defaults();
        let id = rig.running_pod("web-1", &["app"]);
        rig.cluster.script_stream(
            &target("web-1", "app"),
            StreamScript::Lines(vec!["hello".to_string()]),
        );

        rig.notify_upsert(&id).await;
        assert!(
            wait_until(5_000, || {
                rig.count_line("+ web-1 » app") == 1 && rig.count_line("web-1 app hello") == 1
            })
            .await
        );
        // The announcement must precede the first log line.
        let lines = rig.capture.lines();
        let plus = lines.iter().position(|l| l == "+ web-1 » app").unwrap();
        let log = lines.iter().position(|l| l == "web-1 app hello").unwrap();
        assert!(plus < log);

        rig.finish().await;
    }

    #[tokio::test]
    async fn test_redelivered_upsert_starts_one_stream_and_one_announcement() {
        let rig = Rig::with_defaults();
        let id = rig.running_pod("web-1", &["app"]);
        rig.cluster
            .script_stream(&target("web-1", "app"), StreamScript::Pending);

        rig.notify_upsert(&id).await;
        rig.notify_upsert(&id).await;
        rig.notify_upsert(&id).await;

        assert!(wait_until(5_000, || rig.cluster.open_streams() == 1).await);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(rig.cluster.open_streams(), 1);
        assert_eq!(rig.cluster.max_open_streams(), 1);
        assert_eq!(rig.count_line("+ web-1 » app"), 1);

        rig.finish().await;
    }

    #[tokio::test]
    async fn test_multi_container_pod_fans_out() {
        let rig = Rig::with_defaults();
        let id = rig.running_pod("web-1", &["app", "sidecar"]);
        rig.cluster.script_stream(
            &target("web-1", "app"),
            StreamScript::Lines(vec!["from app".to_string()]),
        );
        rig.cluster.script_stream(
            &target("web-1", "sidecar"),
            StreamScript::Lines(vec!["from sidecar".to_string()]),
        );

        rig.notify_upsert(&id).await;
        assert!(
            wait_until(5_000, || {
                rig.count_line("web-1 app from app") == 1
                    && rig.count_line("web-1 sidecar from sidecar") == 1
            })
            .await
        );
        assert_eq!(rig.count_line("+ web-1 » app"), 1);
        assert_eq!(rig.count_line("+ web-1 » sidecar"), 1);

        rig.finish().await;
    }

    #[tokio::test]
    async fn test_excluded_container_never_produces_a_task() {
        let query = Query::new(".*", ".*")
            .unwrap()
            .with_exclude_container("sidecar")
            .unwrap();
        let rig = Rig::new(query, EngineConfig::default());
        let id = rig.running_pod("web-1", &["app", "sidecar"]);
        rig.cluster.script_stream(
            &target("web-1", "app"),
            StreamScript::Lines(vec!["only app".to_string()]),
        );
        rig.cluster.script_stream(
            &target("web-1", "sidecar"),
            StreamScript::Lines(vec!["never seen".to_string()]),
        );

        rig.notify_upsert(&id).await;
        assert!(wait_until(5_000, || rig.count_line("web-1 app only app") == 1).await);
        assert_eq!(rig.count_line("+ web-1 » sidecar"), 0);
        assert_eq!(rig.reconciler.dedup.state_of(&target("web-1", "sidecar")), None);
        assert!(rig.capture.lines().iter().all(|l| !l.contains("never seen")));

        rig.finish().await;
    }

    #[tokio::test]
    async fn test_rapid_notifications_respect_worker_bound() {
        let config = EngineConfig {
            workers: 4,
            ..Default::default()
        };
        let rig = Rig::new(Query::new(".*", ".*").unwrap(), config);
        let ids: Vec<_> = (0..10)
            .map(|n| {
                let id = rig.running_pod(&format!("web-{n}"), &["app"]);
                rig.cluster.script_stream(
                    &target(&format!("web-{n}"), "app"),
                    StreamScript::Pending,
                );
                id
            })
            .collect();

        for _ in 0..100 {
            for id in &ids {
                rig.notify_upsert(id).await;
            }
        }

        assert!(wait_until(5_000, || rig.cluster.open_streams() == 4).await);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(rig.cluster.max_open_streams(), 4);

        rig.finish().await;
    }

    #[tokio::test]
    async fn test_short_streams_are_not_starved() {
        let config = EngineConfig {
            workers: 2,
            ..Default::default()
        };
        let rig = Rig::new(Query::new(".*", ".*").unwrap(), config);
        let ids: Vec<_> = (0..10)
            .map(|n| {
                let name = format!("web-{n}");
                let id = rig.running_pod(&name, &["app"]);
                rig.cluster.script_stream(
                    &target(&name, "app"),
                    StreamScript::Lines(vec![format!("done {name}")]),
                );
                id
            })
            .collect();

        for id in &ids {
            rig.notify_upsert(id).await;
        }

        // Two workers, ten pods: everything still gets its turn.
        assert!(
            wait_until(5_000, || {
                (0..10).all(|n| rig.count_line(&format!("web-{n} app done web-{n}")) == 1)
            })
            .await
        );

        rig.finish().await;
    }

    #[tokio::test]
    async fn test_transient_open_retries_without_second_announcement() {
        let rig = Rig::with_defaults();
        let id = rig.running_pod("web-1", &["app"]);
        rig.cluster.script_stream(
            &target("web-1", "app"),
            StreamScript::Fail(ClusterError::Transient("log endpoint not ready".to_string())),
        );
        rig.cluster.script_stream(
            &target("web-1", "app"),
            StreamScript::Lines(vec!["finally".to_string()]),
        );

        rig.notify_upsert(&id).await;
        assert!(wait_until(5_000, || rig.count_line("web-1 app finally") == 1).await);
        assert_eq!(rig.count_line("+ web-1 » app"), 1);
        assert_eq!(rig.cluster.max_open_streams(), 1);

        rig.finish().await;
    }

    #[tokio::test]
    async fn test_delete_mid_stream_cancels_and_announces_stop() {
        let rig = Rig::with_defaults();
        let id = rig.running_pod("web-1", &["app"]);
        rig.cluster
            .script_stream(&target("web-1", "app"), StreamScript::Pending);

        rig.notify_upsert(&id).await;
        assert!(wait_until(5_000, || rig.cluster.open_streams() == 1).await);

        rig.cluster.remove_pod(&id);
        rig.notify_delete(&id).await;
        assert!(
            wait_until(5_000, || {
                rig.cluster.open_streams() == 0 && rig.count_line("- web-1 » app") == 1
            })
            .await
        );
        // Cache entries for the pod are gone, not just stopped.
        assert!(
            wait_until(5_000, || {
                rig.reconciler.dedup.state_of(&target("web-1", "app")).is_none()
            })
            .await
        );

        rig.finish().await;
    }

    #[tokio::test]
    async fn test_container_leaving_queried_state_stops_its_stream() {
        let rig = Rig::with_defaults();
        let id = rig.running_pod("web-1", &["app"]);
        rig.cluster
            .script_stream(&target("web-1", "app"), StreamScript::Pending);

        rig.notify_upsert(&id).await;
        assert!(wait_until(5_000, || rig.cluster.open_streams() == 1).await);

        rig.cluster.put_pod(PodSnapshot::with_containers(
            id.clone(),
            vec![ObservedContainer::new(
                "app",
                false,
                Some(ContainerState::Terminated),
            )],
        ));
        rig.notify_upsert(&id).await;
        rig.notify_upsert(&id).await;

        assert!(
            wait_until(5_000, || {
                rig.cluster.open_streams() == 0 && rig.count_line("- web-1 » app") == 1
            })
            .await
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        // The redelivered terminated snapshot must not announce again.
        assert_eq!(rig.count_line("- web-1 » app"), 1);

        rig.finish().await;
    }

    #[tokio::test]
    async fn test_already_terminated_container_is_not_announced() {
        let rig = Rig::with_defaults();
        let id = PodId::new("prod", "web-1");
        rig.cluster.put_pod(PodSnapshot::with_containers(
            id.clone(),
            vec![
                ObservedContainer::new("init-db", true, Some(ContainerState::Terminated)),
                ObservedContainer::new("app", false, Some(ContainerState::Running)),
            ],
        ));
        rig.cluster.script_stream(
            &target("web-1", "app"),
            StreamScript::Lines(vec!["up".to_string()]),
        );

        rig.notify_upsert(&id).await;
        assert!(wait_until(5_000, || rig.count_line("web-1 app up") == 1).await);
        // The long-finished init container never streamed, so it gets no
        // stop line and no cache entry.
        assert_eq!(rig.count_line("- web-1 » init-db"), 0);
        let init = ContainerRef::new(id.clone(), "init-db", true);
        assert_eq!(rig.reconciler.dedup.state_of(&init), None);

        rig.finish().await;
    }

    #[tokio::test]
    async fn test_not_found_fetch_is_treated_as_delete() {
        let rig = Rig::with_defaults();
        let ghost = PodId::new("prod", "ghost");

        rig.notify_upsert(&ghost).await;

        // The reconciler keeps serving afterwards.
        let id = rig.running_pod("web-1", &["app"]);
        rig.cluster.script_stream(
            &target("web-1", "app"),
            StreamScript::Lines(vec!["alive".to_string()]),
        );
        rig.notify_upsert(&id).await;
        assert!(wait_until(5_000, || rig.count_line("web-1 app alive") == 1).await);
        assert_eq!(rig.count_line("+ ghost » app"), 0);

        rig.finish().await;
    }

    #[tokio::test]
    async fn test_fetch_error_drops_notification_until_redelivery() {
        let rig = Rig::with_defaults();
        let id = rig.running_pod("web-1", &["app"]);
        rig.cluster
            .fail_next_get(&id, ClusterError::Transient("apiserver busy".to_string()));
        rig.cluster.script_stream(
            &target("web-1", "app"),
            StreamScript::Lines(vec!["second try".to_string()]),
        );

        rig.notify_upsert(&id).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(rig.count_line("+ web-1 » app"), 0);

        rig.notify_upsert(&id).await;
        assert!(wait_until(5_000, || rig.count_line("web-1 app second try") == 1).await);
        assert_eq!(rig.count_line("+ web-1 » app"), 1);

        rig.finish().await;
    }

    #[tokio::test]
    async fn test_saturated_queue_announces_once_and_recovers_on_redelivery() {
        let config = EngineConfig {
            workers: 1,
            queue_depth: 1,
            ..Default::default()
        };
        let rig = Rig::new(Query::new(".*", ".*").unwrap(), config);

        let busy = rig.running_pod("busy", &["app"]);
        rig.cluster
            .script_stream(&target("busy", "app"), StreamScript::Pending);
        rig.notify_upsert(&busy).await;
        assert!(wait_until(5_000, || rig.cluster.open_streams() == 1).await);

        // Fill the queue, then push one more over the top.
        let queued = rig.running_pod("queued", &["app"]);
        rig.cluster.script_stream(
            &target("queued", "app"),
            StreamScript::Lines(vec!["queued ran".to_string()]),
        );
        rig.notify_upsert(&queued).await;
        assert!(
            wait_until(5_000, || {
                rig.reconciler.active.contains(&target("queued", "app"))
            })
            .await
        );

        let refused = rig.running_pod("refused", &["app"]);
        rig.cluster.script_stream(
            &target("refused", "app"),
            StreamScript::Lines(vec!["refused ran".to_string()]),
        );
        rig.notify_upsert(&refused).await;

        assert!(
            wait_until(5_000, || {
                rig.reconciler.dedup.state_of(&target("refused", "app"))
                    == Some(TailState::Announced)
            })
            .await
        );
        assert_eq!(rig.count_line("+ refused » app"), 1);

        // Free the worker; the queued task drains, then redelivery gets
        // the refused one through without a second announcement.
        rig.cluster.remove_pod(&busy);
        rig.notify_delete(&busy).await;
        assert!(wait_until(5_000, || rig.count_line("queued app queued ran") == 1).await);

        rig.notify_upsert(&refused).await;
        assert!(wait_until(5_000, || rig.count_line("refused app refused ran") == 1).await);
        assert_eq!(rig.count_line("+ refused » app"), 1);

        rig.finish().await;
    }

    #[tokio::test]
    async fn test_run_exits_when_channel_closes() {
        let rig = Rig::with_defaults();
        let Rig {
            tx,
            handle,
            cluster,
            ..
        } = rig;
        drop(tx);
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cluster.open_streams(), 0);
    }
}
