mod cli;
mod shutdown;

use std::io::IsTerminal;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tracing::debug;

use podtail_engine::{
    Cluster, ColorMode, EngineConfig, LogFormatter, OutputFormat, OutputSink, Query, Reconciler,
};
use podtail_k8s::{KubeCluster, resolve_namespaces, spawn_pod_watcher};
use podtail_types::{ContainerState, Notification};

use crate::cli::Args;
use crate::shutdown::Shutdown;

/// Capacity of the notification channel between the watchers and the
/// reconciler.
const NOTIFICATION_BUFFER: usize = 128;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let result = run_app(args).await;

    if let Err(e) = &result {
        eprintln!("Error: {:#}", e);
    }

    result
}

async fn run_app(args: Args) -> Result<()> {
    let query = Arc::new(build_query(&args)?);
    let scope = args.namespace_scope();

    let mut config = EngineConfig {
        workers: args.workers,
        concurrency: args.concurrency,
        timestamps: args.timestamps,
        tail_lines: args.tail,
        namespaced: scope.is_namespaced(),
        ..EngineConfig::default()
    };
    let since = cli::parse_since(&args.since)?;
    config.since_seconds = (since > 0).then_some(since);
    config.validate()?;

    let color_mode = ColorMode::parse(&args.color)?;
    let use_color = color_mode.enabled(std::io::stdout().is_terminal());
    let output = OutputFormat::parse(&args.output)?;
    let formatter = Arc::new(LogFormatter::from_options(
        args.format.as_deref(),
        output,
        use_color,
    )?);
    let sink = Arc::new(OutputSink::stdout());

    let cluster = Arc::new(KubeCluster::connect().await?);
    let namespaces = resolve_namespaces(&scope, cluster.context_namespace());

    let shutdown = Shutdown::new();
    let (tx, rx) = mpsc::channel::<Notification>(NOTIFICATION_BUFFER);

    let reconciler = Reconciler::new(
        Arc::clone(&cluster) as Arc<dyn Cluster>,
        Arc::clone(&query),
        formatter,
        sink,
        &config,
        use_color,
        &shutdown.token(),
    );

    let watchers: Vec<_> = namespaces
        .into_iter()
        .map(|namespace| {
            spawn_pod_watcher(
                cluster.client(),
                namespace,
                args.selector.clone(),
                Arc::clone(&query),
                tx.clone(),
                shutdown.token(),
            )
        })
        .collect();
    drop(tx);

    let mut engine = tokio::spawn(reconciler.run(rx, shutdown.token()));

    let engine_done = tokio::select! {
        reason = shutdown::wait_ctrl_c(&shutdown) => {
            debug!(reason = ?reason, "shutting down");
            false
        }
        reason = shutdown::wait_sigterm(&shutdown) => {
            debug!(reason = ?reason, "shutting down");
            false
        }
        result = &mut engine => {
            result.context("Reconciler task failed")?;
            true
        }
    };
    if !engine_done {
        engine.await.context("Reconciler task failed")?;
    }

    shutdown.cancel();
    for watcher in watchers {
        let _ = watcher.await;
    }

    Ok(())
}

fn build_query(args: &Args) -> Result<Query> {
    let state = ContainerState::parse(&args.container_state)
        .with_context(|| format!("Unknown container state '{}'", args.container_state))?;

    let mut query = Query::new(&args.pod_query, &args.container)?
        .with_exclude_pods(&args.exclude_pod)?
        .with_include_lines(&args.include)?
        .with_exclude_lines(&args.exclude)?
        .with_container_state(state);
    if let Some(pattern) = &args.exclude_container {
        query = query.with_exclude_container(pattern)?;
    }
    Ok(query)
}
