//! Pod, container, and line selection.
//!
//! A [`Query`] captures every filter a tail session applies: which pods are
//! in scope, which of their containers get streamed, and which log lines
//! survive into the output. All filters are ANDed, except the exclusion
//! patterns where any single match rejects.

use podtail_types::{ContainerState, PodId};
use regex::Regex;

use crate::error::Result;

/// Compiled filter set for one tail session.
#[derive(Debug, Clone)]
pub struct Query {
    pod_pattern: Regex,
    container_pattern: Regex,
    exclude_container: Option<Regex>,
    exclude_pods: Vec<Regex>,
    container_state: ContainerState,
    include_lines: Vec<Regex>,
    exclude_lines: Vec<Regex>,
}

impl Query {
    /// Build a query from the pod and container name patterns.
    ///
    /// # Errors
    ///
    /// Returns an error if either pattern is not a valid regex.
    pub fn new(pod_pattern: &str, container_pattern: &str) -> Result<Self> {
        Ok(Self {
            pod_pattern: Regex::new(pod_pattern)?,
            container_pattern: Regex::new(container_pattern)?,
            exclude_container: None,
            exclude_pods: Vec::new(),
            container_state: ContainerState::Running,
            include_lines: Vec::new(),
            exclude_lines: Vec::new(),
        })
    }

    /// Reject containers whose name matches `pattern`.
    pub fn with_exclude_container(mut self, pattern: &str) -> Result<Self> {
        self.exclude_container = Some(Regex::new(pattern)?);
        Ok(self)
    }

    /// Reject pods whose name matches any of `patterns`.
    pub fn with_exclude_pods(mut self, patterns: &[String]) -> Result<Self> {
        self.exclude_pods = compile_all(patterns)?;
        Ok(self)
    }

    /// Keep only log lines matching at least one of `patterns`.
    pub fn with_include_lines(mut self, patterns: &[String]) -> Result<Self> {
        self.include_lines = compile_all(patterns)?;
        Ok(self)
    }

    /// Drop log lines matching any of `patterns`.
    pub fn with_exclude_lines(mut self, patterns: &[String]) -> Result<Self> {
        self.exclude_lines = compile_all(patterns)?;
        Ok(self)
    }

    /// Select containers in this state rather than the default `running`.
    #[must_use]
    pub fn with_container_state(mut self, state: ContainerState) -> Self {
        self.container_state = state;
        self
    }

    #[must_use]
    pub fn container_state(&self) -> ContainerState {
        self.container_state
    }

    /// Whether a pod identity belongs to this session at all.
    ///
    /// Pods out of scope are dropped before reconciliation so churn in
    /// unrelated workloads never reaches the scheduler.
    #[must_use]
    pub fn pod_in_scope(&self, id: &PodId) -> bool {
        self.pod_pattern.is_match(&id.name)
            && !self.exclude_pods.iter().any(|re| re.is_match(&id.name))
    }

    /// Whether a container name passes the name filters.
    #[must_use]
    pub fn container_selected(&self, name: &str) -> bool {
        if !self.container_pattern.is_match(name) {
            return false;
        }
        match &self.exclude_container {
            Some(re) => !re.is_match(name),
            None => true,
        }
    }

    /// Whether an observed state matches the queried state.
    ///
    /// A container with no reported state yet is never a match.
    #[must_use]
    pub fn state_matches(&self, state: Option<ContainerState>) -> bool {
        matches!(state, Some(s) if s == self.container_state)
    }

    /// Whether a log line survives the line-level filters.
    ///
    /// Exclusions run first; when include patterns are present, a line must
    /// match at least one of them.
    #[must_use]
    pub fn line_passes(&self, line: &str) -> bool {
        if self.exclude_lines.iter().any(|re| re.is_match(line)) {
            return false;
        }
        if self.include_lines.is_empty() {
            return true;
        }
        self.include_lines.iter().any(|re| re.is_match(line))
    }
}

fn compile_all(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| Regex::new(p).map_err(Into::into))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_pattern_is_rejected() {
        assert!(Query::new("(unclosed", ".*").is_err());
        assert!(Query::new(".*", "[bad").is_err());
    }

    #[test]
    fn test_pod_scope_with_exclusions() {
        let query = Query::new("web-.*", ".*")
            .unwrap()
            .with_exclude_pods(&["web-canary.*".to_string()])
            .unwrap();

        assert!(query.pod_in_scope(&PodId::new("default", "web-1")));
        assert!(!query.pod_in_scope(&PodId::new("default", "api-1")));
        assert!(!query.pod_in_scope(&PodId::new("default", "web-canary-2")));
    }

    #[test]
    fn test_container_selection() {
        let query = Query::new(".*", "app|worker")
            .unwrap()
            .with_exclude_container("worker")
            .unwrap();

        assert!(query.container_selected("app"));
        assert!(!query.container_selected("worker"));
        assert!(!query.container_selected("sidecar"));
    }

    #[test]
    fn test_unset_state_never_matches() {
        let query = Query::new(".*", ".*").unwrap();
        assert!(query.state_matches(Some(ContainerState::Running)));
        assert!(!query.state_matches(Some(ContainerState::Waiting)));
        assert!(!query.state_matches(None));
    }

    #[test]
    fn test_line_filters_exclude_wins() {
        let query = Query::new(".*", ".*")
            .unwrap()
            .with_include_lines(&["ERROR".to_string(), "WARN".to_string()])
            .unwrap()
            .with_exclude_lines(&["healthz".to_string()])
            .unwrap();

        assert!(query.line_passes("ERROR something broke"));
        assert!(query.line_passes("WARN disk pressure"));
        assert!(!query.line_passes("INFO all good"));
        assert!(!query.line_passes("ERROR GET /healthz failed"));
    }

    #[test]
    fn test_no_line_filters_pass_everything() {
        let query = Query::new(".*", ".*").unwrap();
        assert!(query.line_passes("anything at all"));
        assert!(query.line_passes(""));
    }
}
