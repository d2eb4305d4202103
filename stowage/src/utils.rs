//! Small shared helpers: version strings, terminal-safe text and the console.

use parking_lot::Mutex;
use regex::Regex;
use std::io::{self, Write};
use std::sync::{Arc, OnceLock};

/// Version of this binary.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Client identifier, `stowage/<version>`.
#[must_use]
pub fn client_name() -> String {
    format!("stowage/{VERSION}")
}

/// User agent sent to remote services, `stowage/<version> (<os>/<arch>)`.
#[must_use]
pub fn user_agent() -> String {
    format!(
        "{} ({}/{})",
        client_name(),
        std::env::consts::OS,
        std::env::consts::ARCH
    )
}

fn escape_sequences() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        // CSI and OSC sequences, then any remaining lone ESC.
        #[allow(clippy::unwrap_used)]
        Regex::new(r"\x1b\[[0-?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b").unwrap()
    })
}

/// Strips terminal escape sequences and control characters (except newline and tab).
#[must_use]
pub fn sanitize_text(input: &str) -> String {
    escape_sequences()
        .replace_all(input, "")
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect()
}

/// Formats a duration the way `-time` prints it.
#[must_use]
pub fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs_f64();
    if secs >= 1.0 {
        format!("{secs:.3}s")
    } else {
        format!("{:.3}ms", secs * 1000.0)
    }
}

type Sink = Mutex<Box<dyn Write + Send>>;

/// User-facing output streams.
///
/// Notices the user must see (confirmations, warnings, `time:`) go through
/// the console rather than the log, so they survive `-quiet`.
pub struct Console {
    out: Sink,
    err: Sink,
}

impl Console {
    /// Process standard output and error.
    #[must_use]
    pub fn stdio() -> Self {
        Self {
            out: Mutex::new(Box::new(io::stdout())),
            err: Mutex::new(Box::new(io::stderr())),
        }
    }

    /// In-memory console; returns the captured `(stdout, stderr)` buffers.
    #[must_use]
    pub fn captured() -> (Self, CapturedOutput, CapturedOutput) {
        let out = CapturedOutput::default();
        let err = CapturedOutput::default();
        let console = Self {
            out: Mutex::new(Box::new(out.clone())),
            err: Mutex::new(Box::new(err.clone())),
        };
        (console, out, err)
    }

    /// Writes a line to standard output.
    pub fn println(&self, line: impl AsRef<str>) {
        let mut out = self.out.lock();
        let _ = writeln!(out, "{}", line.as_ref());
        let _ = out.flush();
    }

    /// Writes a line to standard error.
    pub fn eprintln(&self, line: impl AsRef<str>) {
        let mut err = self.err.lock();
        let _ = writeln!(err, "{}", line.as_ref());
        let _ = err.flush();
    }
}

impl Default for Console {
    fn default() -> Self {
        Self::stdio()
    }
}

impl std::fmt::Debug for Console {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Console").finish_non_exhaustive()
    }
}

/// Shared buffer behind a captured console stream.
#[derive(Debug, Clone, Default)]
pub struct CapturedOutput(Arc<Mutex<Vec<u8>>>);

impl CapturedOutput {
    /// Everything written so far.
    #[must_use]
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl Write for CapturedOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
