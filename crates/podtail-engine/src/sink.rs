//! Synchronized output sink.
//!
//! Every formatted log line and every lifecycle announcement goes through
//! one [`OutputSink`]. The writer sits behind a mutex so lines from
//! concurrently active streams never interleave mid-line.

use std::io::{self, Write};

use parking_lot::Mutex;

/// Shared, line-atomic writer for the session's output.
pub struct OutputSink {
    writer: Mutex<Box<dyn Write + Send>>,
}

impl OutputSink {
    /// Sink writing to the process stdout.
    #[must_use]
    pub fn stdout() -> Self {
        Self {
            writer: Mutex::new(Box::new(io::stdout())),
        }
    }

    /// Sink writing into an in-memory buffer, returned alongside for
    /// inspection.
    #[cfg(any(test, feature = "test-utils"))]
    #[must_use]
    pub fn memory() -> (Self, CapturedOutput) {
        let capture = CapturedOutput::default();
        let sink = Self {
            writer: Mutex::new(Box::new(capture.clone())),
        };
        (sink, capture)
    }

    /// Write one line plus the trailing newline as a single unit.
    pub fn write_line(&self, line: &str) -> io::Result<()> {
        let mut writer = self.writer.lock();
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()
    }
}

/// Cloneable handle onto the bytes a [`OutputSink::memory`] sink received.
#[cfg(any(test, feature = "test-utils"))]
#[derive(Clone, Default)]
pub struct CapturedOutput {
    buf: std::sync::Arc<Mutex<Vec<u8>>>,
}

#[cfg(any(test, feature = "test-utils"))]
impl CapturedOutput {
    #[must_use]
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.buf.lock()).into_owned()
    }

    #[must_use]
    pub fn lines(&self) -> Vec<String> {
        self.contents().lines().map(str::to_string).collect()
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl Write for CapturedOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
