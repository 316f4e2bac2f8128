//! Command line definition and parsing helpers.

use anyhow::{Result, bail};
use clap::Parser;

use podtail_types::NamespaceScope;

/// Tail logs from many Kubernetes pods and containers at once
#[derive(Parser, Debug)]
#[command(name = "podtail")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Regex selecting pods by name
    #[arg(value_name = "POD_QUERY", default_value = ".*")]
    pub pod_query: String,

    /// Regex selecting containers by name
    #[arg(short = 'c', long, default_value = ".*")]
    pub container: String,

    /// Regex of container names to skip
    #[arg(short = 'E', long, value_name = "REGEX")]
    pub exclude_container: Option<String>,

    /// Regex of pod names to skip (repeatable)
    #[arg(long, value_name = "REGEX")]
    pub exclude_pod: Vec<String>,

    /// Tail containers in this state: running, waiting or terminated
    #[arg(long, value_name = "STATE", default_value = "running")]
    pub container_state: String,

    /// Drop log lines matching this regex (repeatable)
    #[arg(short = 'e', long, value_name = "REGEX")]
    pub exclude: Vec<String>,

    /// Keep only log lines matching this regex (repeatable)
    #[arg(short = 'i', long, value_name = "REGEX")]
    pub include: Vec<String>,

    /// Namespace to watch (repeatable)
    #[arg(short = 'n', long = "namespace")]
    pub namespaces: Vec<String>,

    /// Watch every namespace in the cluster
    #[arg(short = 'A', long)]
    pub all_namespaces: bool,

    /// Label selector narrowing the pod watch, e.g. app=web
    #[arg(short = 'l', long)]
    pub selector: Option<String>,

    /// Prefix each line with its cluster timestamp
    #[arg(short = 't', long)]
    pub timestamps: bool,

    /// Return logs newer than this, e.g. 90s, 15m, 48h (0s for everything)
    #[arg(short = 's', long, default_value = "48h")]
    pub since: String,

    /// Lines of recent history to show per container
    #[arg(long, value_name = "LINES")]
    pub tail: Option<i64>,

    /// Output style: default, raw or json
    #[arg(short = 'o', long, default_value = "default")]
    pub output: String,

    /// Custom line template with {pod}, {container}, {namespace},
    /// {timestamp} and {message} placeholders
    #[arg(long, value_name = "TEMPLATE")]
    pub format: Option<String>,

    /// When to colorize output: auto, always or never
    #[arg(long, default_value = "auto")]
    pub color: String,

    /// Pod notifications reconciled at once
    #[arg(long, default_value_t = 10)]
    pub concurrency: usize,

    /// Concurrently open log streams
    #[arg(long, default_value_t = 8)]
    pub workers: usize,

    /// Log internals to stderr at debug level
    #[arg(short = 'v', long)]
    pub verbose: bool,
}

impl Args {
    /// Namespace scope, with `--all-namespaces` winning over explicit
    /// `--namespace` values.
    #[must_use]
    pub fn namespace_scope(&self) -> NamespaceScope {
        if self.all_namespaces {
            NamespaceScope::All
        } else if self.namespaces.is_empty() {
            NamespaceScope::Current
        } else {
            NamespaceScope::List(self.namespaces.clone())
        }
    }
}

/// Parse a duration like `90s`, `15m`, `48h`, `2d` or `1h30m` into seconds.
pub fn parse_since(value: &str) -> Result<i64> {
    if value.is_empty() {
        bail!("Invalid duration: empty");
    }
    let mut total: i64 = 0;
    let mut digits = String::new();
    for ch in value.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            continue;
        }
        if digits.is_empty() {
            bail!("Invalid duration '{value}': expected a number before '{ch}'");
        }
        let amount: i64 = digits.parse()?;
        digits.clear();
        let unit = match ch {
            's' => 1,
            'm' => 60,
            'h' => 3_600,
            'd' => 86_400,
            other => bail!("Invalid duration '{value}': unknown unit '{other}'"),
        };
        total = total.saturating_add(amount.saturating_mul(unit));
    }
    if !digits.is_empty() {
        bail!("Invalid duration '{value}': missing unit after '{digits}'");
    }
    Ok(total)
}
