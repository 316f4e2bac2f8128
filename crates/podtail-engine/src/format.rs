//! Log line rendering.
//!
//! Three built-in output shapes plus a user template. The default shape is
//! `[timestamp] [namespace] pod container message` with the pod's color
//! pair applied to the name fields; `raw` drops everything but the message
//! and `json` serializes the whole event.

use chrono::{DateTime, SecondsFormat, Utc};
use owo_colors::Style;
use podtail_types::LogEvent;

use crate::color::{ColorPair, paint};
use crate::error::{EngineError, Result};

/// Built-in output shape selected with `--output`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Default,
    Raw,
    Json,
}

impl OutputFormat {
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "default" => Ok(Self::Default),
            "raw" => Ok(Self::Raw),
            "json" => Ok(Self::Json),
            other => Err(EngineError::InvalidOutput(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Pod,
    Container,
    Namespace,
    Timestamp,
    Message,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Field(Field),
}

enum RenderMode {
    Builtin(OutputFormat),
    Custom(Vec<Segment>),
}

/// Renders [`LogEvent`]s into output lines.
pub struct LogFormatter {
    mode: RenderMode,
    use_color: bool,
}

impl LogFormatter {
    /// Build a formatter from the session options.
    ///
    /// A custom `template` always wins over the `output` selection and is
    /// rendered without color.
    pub fn from_options(
        template: Option<&str>,
        output: OutputFormat,
        use_color: bool,
    ) -> Result<Self> {
        let mode = match template {
            Some(t) => RenderMode::Custom(parse_template(t)?),
            None => RenderMode::Builtin(output),
        };
        Ok(Self { mode, use_color })
    }

    /// Render one event as a single output line, without the trailing
    /// newline.
    pub fn render(&self, event: &LogEvent, colors: ColorPair) -> Result<String> {
        match &self.mode {
            RenderMode::Builtin(OutputFormat::Default) => {
                let mut out = String::new();
                if let Some(ts) = &event.timestamp {
                    out.push_str(&format_timestamp(ts));
                    out.push(' ');
                }
                if let Some(ns) = &event.namespace {
                    out.push_str(&self.paint(ns, colors.primary));
                    out.push(' ');
                }
                out.push_str(&self.paint(&event.pod_name, colors.primary));
                out.push(' ');
                out.push_str(&self.paint(&event.container_name, colors.secondary));
                out.push(' ');
                out.push_str(&event.message);
                Ok(out)
            }
            RenderMode::Builtin(OutputFormat::Raw) => match &event.timestamp {
                Some(ts) => Ok(format!("{} {}", format_timestamp(ts), event.message)),
                None => Ok(event.message.clone()),
            },
            RenderMode::Builtin(OutputFormat::Json) => Ok(serde_json::to_string(event)?),
            RenderMode::Custom(segments) => {
                let mut out = String::new();
                for segment in segments {
                    match segment {
                        Segment::Literal(text) => out.push_str(text),
                        Segment::Field(Field::Pod) => out.push_str(&event.pod_name),
                        Segment::Field(Field::Container) => out.push_str(&event.container_name),
                        Segment::Field(Field::Namespace) => {
                            if let Some(ns) = &event.namespace {
                                out.push_str(ns);
                            }
                        }
                        Segment::Field(Field::Timestamp) => {
                            if let Some(ts) = &event.timestamp {
                                out.push_str(&format_timestamp(ts));
                            }
                        }
                        Segment::Field(Field::Message) => out.push_str(&event.message),
                    }
                }
                Ok(out)
            }
        }
    }

    fn paint(&self, text: &str, style: Style) -> String {
        paint(text, style, self.use_color)
    }
}

fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a `{field}` template. `{{` and `}}` escape literal braces.
fn parse_template(input: &str) -> Result<Vec<Segment>> {
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                literal.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                literal.push('}');
            }
            '{' => {
                let mut name = String::new();
                let mut closed = false;
                for c in chars.by_ref() {
                    if c == '}' {
                        closed = true;
                        break;
                    }
                    name.push(c);
                }
                if !closed {
                    return Err(EngineError::InvalidTemplate(format!(
                        "unterminated field in {input:?}"
                    )));
                }
                let field = match name.as_str() {
                    "pod" => Field::Pod,
                    "container" => Field::Container,
                    "namespace" => Field::Namespace,
                    "timestamp" => Field::Timestamp,
                    "message" => Field::Message,
                    other => {
                        return Err(EngineError::InvalidTemplate(format!(
                            "unknown field {other:?}"
                        )));
                    }
                };
                if !literal.is_empty() {
                    segments.push(Segment::Literal(std::mem::take(&mut literal)));
                }
                segments.push(Segment::Field(field));
            }
            '}' => {
                return Err(EngineError::InvalidTemplate(format!(
                    "unmatched '}}' in {input:?}"
                )));
            }
            c => literal.push(c),
        }
    }
    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }
    Ok(segments)
}
