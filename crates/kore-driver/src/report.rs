//! Fatal error reporting.
//!
//! Every driver failure in a run is unrecoverable: the binary prints one
//! diagnostic line and exits with the driver status as the exit code.

use std::io::{self, Write};

use crate::error::DriverError;

/// Formats driver errors as `Driver Error: <description> <file> <line>`.
pub struct ErrorReporter<W: Write> {
    out: W,
}

impl ErrorReporter<io::Stderr> {
    /// Reporter writing to standard error.
    pub fn stderr() -> Self {
        Self { out: io::stderr() }
    }
}

impl<W: Write> ErrorReporter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    /// Write the diagnostic line for `err`.
    pub fn report(&mut self, err: &DriverError) -> io::Result<()> {
        writeln!(self.out, "{}", diagnostic(err))?;
        self.out.flush()
    }

    /// Report `err` and terminate the process with its exit code.
    ///
    /// The code is the raw driver status, which the OS truncates to its low
    /// 8 bits on Unix: `CUDA_ERROR_FILE_NOT_FOUND` (301) is seen by the shell
    /// as 45. The full status is always in the printed diagnostic.
    ///
    /// Callers must drop every resource guard before calling this:
    /// `process::exit` does not run destructors.
    pub fn fatal(mut self, err: &DriverError) -> ! {
        tracing::error!(kind = ?err.kind(), "{}", err);
        let _ = self.report(err);
        std::process::exit(err.exit_code())
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

/// The single diagnostic line for `err`.
pub fn diagnostic(err: &DriverError) -> String {
    match err.location() {
        Some(loc) => format!("Driver Error: {} {} {}", err.description(), loc.file(), loc.line()),
        None => format!("Driver Error: {}", err.description()),
    }
}
