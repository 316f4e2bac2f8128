//! Start and stop decisions for observed pods.
//!
//! [`PodFilter`] turns a pod snapshot into the set of containers whose
//! streams should be running, and prints the `+`/`-` lifecycle
//! announcements. It decides from state alone; whether an announcement is
//! actually due is the dedup cache's call, made by the reconciler.

use std::sync::Arc;

use owo_colors::Style;
use podtail_types::{ContainerRef, ContainerState, PodSnapshot};
use tracing::debug;

use crate::color::{ColorPalette, paint};
use crate::query::Query;
use crate::sink::OutputSink;

const START_MARK: &str = "+";
const STOP_MARK: &str = "-";
const NAMESPACE_SEPARATOR: &str = "/";

/// Pod-level decision function plus announcement printer.
pub struct PodFilter {
    query: Arc<Query>,
    palette: Arc<ColorPalette>,
    sink: Arc<OutputSink>,
    /// Prefix announcements with the namespace (multi-namespace sessions).
    namespaced: bool,
    use_color: bool,
}

impl PodFilter {
    pub fn new(
        query: Arc<Query>,
        palette: Arc<ColorPalette>,
        sink: Arc<OutputSink>,
        namespaced: bool,
        use_color: bool,
    ) -> Self {
        Self {
            query,
            palette,
            sink,
            namespaced,
            use_color,
        }
    }

    /// Containers of `snapshot` that should have a stream running.
    ///
    /// A container with no reported state yet is skipped, not an error; it
    /// will come back around on the next watch event once it starts.
    #[must_use]
    pub fn on_apply(&self, snapshot: &PodSnapshot) -> Vec<ContainerRef> {
        if !self.query.pod_in_scope(&snapshot.id) {
            return Vec::new();
        }
        snapshot
            .containers
            .iter()
            .filter(|c| self.query.container_selected(&c.name))
            .filter(|c| self.query.state_matches(c.state))
            .map(|c| snapshot.container_ref(c))
            .collect()
    }

    /// Containers of `snapshot` whose streams should stop: terminated, or
    /// no longer in the queried state.
    #[must_use]
    pub fn on_delete(&self, snapshot: &PodSnapshot) -> Vec<ContainerRef> {
        if !self.query.pod_in_scope(&snapshot.id) {
            return Vec::new();
        }
        snapshot
            .containers
            .iter()
            .filter(|c| self.query.container_selected(&c.name))
            .filter(|c| {
                matches!(c.state, Some(s) if s == ContainerState::Terminated
                    || s != self.query.container_state())
            })
            .map(|c| snapshot.container_ref(c))
            .collect()
    }

    /// Print the `+` line for a container whose stream is starting.
    pub fn announce_started(&self, target: &ContainerRef) {
        let colors = self.palette.pair_for(&target.pod.name);
        let marker = paint(
            START_MARK,
            Style::new().bright_green().bold(),
            self.use_color,
        );
        self.announce(target, &marker, colors.primary, colors.secondary);
    }

    /// Print the `-` line for a container whose stream has stopped. Names
    /// stay unstyled so stop lines read as muted next to start lines.
    pub fn announce_stopped(&self, target: &ContainerRef) {
        let marker = paint(STOP_MARK, Style::new().bright_red().bold(), self.use_color);
        self.announce(target, &marker, Style::new(), Style::new());
    }

    fn announce(&self, target: &ContainerRef, marker: &str, primary: Style, secondary: Style) {
        let pod = paint(&target.pod.name, primary, self.use_color);
        let container = paint(&target.container, secondary, self.use_color);
        let line = if self.namespaced {
            let namespace = paint(
                &format!("{}{NAMESPACE_SEPARATOR}", target.pod.namespace),
                primary,
                self.use_color,
            );
            format!("{marker} {namespace}{pod} » {container}")
        } else {
            format!("{marker} {pod} » {container}")
        };
        if let Err(error) = self.sink.write_line(&line) {
            debug!(%error, container = %target, "failed to write lifecycle announcement");
        }
    }
}
