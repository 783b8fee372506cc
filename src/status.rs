//! Operator-facing progress lines (`Connected.`, `Found device ...`).
//!
//! These never share a writer with the sample bus: the default sink is
//! stderr, so a bus on stdout stays pure JSON lines.

use std::fmt;
use std::io::Write;
use std::sync::{Arc, Mutex, PoisonError};

use log::debug;

/// Cloneable handle on the status writer.
#[derive(Clone)]
pub struct Status {
    out: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl Status {
    pub fn new(writer: impl Write + Send + 'static) -> Self {
        Self {
            out: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }

    pub fn stderr() -> Self {
        Self::new(std::io::stderr())
    }

    /// Write `message` followed by a newline. A failed write is logged only.
    pub fn line(&self, message: impl fmt::Display) {
        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = writeln!(out, "{message}").and_then(|()| out.flush()) {
            debug!("status line lost: {e}");
        }
    }
}

impl Default for Status {
    fn default() -> Self {
        Self::stderr()
    }
}

impl fmt::Debug for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Status")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl Write for Capture {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn clones_share_one_writer() {
        let capture = Capture::default();
        let status = Status::new(capture.clone());
        status.line("Connected.");
        status.clone().line(format_args!("Found device {}", "Muse-1234"));
        let text = String::from_utf8(capture.0.lock().unwrap().clone()).unwrap();
        assert_eq!(text, "Connected.\nFound device Muse-1234\n");
    }
}
