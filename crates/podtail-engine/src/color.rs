//! Terminal color assignment for pods.
//!
//! Every pod is hashed onto a fixed palette entry so the same pod name gets
//! the same color pair in every session, on every run, with no shared
//! assignment state between streams.

use std::hash::{DefaultHasher, Hash, Hasher};

use owo_colors::Style;

use crate::error::{EngineError, Result};

/// When to emit ANSI color codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ColorMode {
    /// Color only when stdout is a terminal.
    #[default]
    Auto,
    Always,
    Never,
}

impl ColorMode {
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "auto" => Ok(Self::Auto),
            "always" => Ok(Self::Always),
            "never" => Ok(Self::Never),
            other => Err(EngineError::InvalidColorMode(other.to_string())),
        }
    }

    /// Resolve the mode against the actual output target.
    #[must_use]
    pub fn enabled(self, stdout_is_tty: bool) -> bool {
        match self {
            Self::Auto => stdout_is_tty,
            Self::Always => true,
            Self::Never => false,
        }
    }
}

/// A pod's display colors: `primary` for the pod name, `secondary` for its
/// container names.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColorPair {
    pub primary: Style,
    pub secondary: Style,
}

/// Fixed 12-entry palette of pod color pairs.
pub struct ColorPalette {
    pairs: [ColorPair; 12],
}

impl ColorPalette {
    #[must_use]
    pub fn new() -> Self {
        let pair = |primary: Style, secondary: Style| ColorPair { primary, secondary };
        Self {
            pairs: [
                pair(Style::new().bright_cyan(), Style::new().cyan()),
                pair(Style::new().bright_green(), Style::new().green()),
                pair(Style::new().bright_magenta(), Style::new().magenta()),
                pair(Style::new().bright_yellow(), Style::new().yellow()),
                pair(Style::new().bright_blue(), Style::new().blue()),
                pair(Style::new().bright_red(), Style::new().red()),
                pair(Style::new().cyan(), Style::new().cyan().dimmed()),
                pair(Style::new().green(), Style::new().green().dimmed()),
                pair(Style::new().magenta(), Style::new().magenta().dimmed()),
                pair(Style::new().yellow(), Style::new().yellow().dimmed()),
                pair(Style::new().blue(), Style::new().blue().dimmed()),
                pair(Style::new().red(), Style::new().red().dimmed()),
            ],
        }
    }

    /// Pick the pair for a pod name.
    ///
    /// Uses an unkeyed [`DefaultHasher`] so the mapping is a pure function
    /// of the name rather than of announcement order.
    #[must_use]
    pub fn pair_for(&self, pod_name: &str) -> ColorPair {
        let mut hasher = DefaultHasher::new();
        pod_name.hash(&mut hasher);
        let index = (hasher.finish() % self.pairs.len() as u64) as usize;
        self.pairs[index]
    }
}

impl Default for ColorPalette {
    fn default() -> Self {
        Self::new()
    }
}

/// Apply `style` to `text` when color is enabled, else pass it through.
pub(crate) fn paint(text: &str, style: Style, enabled: bool) -> String {
    use owo_colors::OwoColorize;

    if enabled {
        text.style(style).to_string()
    } else {
        text.to_string()
    }
}
