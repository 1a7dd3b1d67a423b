//! Prints the snapshots.

use std::fmt::Write as _;
use std::io::{self, Write};
use std::time::SystemTime;

use palantiri::{
    Observer, Snapshot,
    observer::{NotifyError, NotifyRetry},
};

/// Writes one line per snapshot: the timestamp, followed by `alias=value` pairs.
pub struct ConsoleObserver<W: Write + Send> {
    out: W,
}

impl ConsoleObserver<io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write + Send> ConsoleObserver<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write + Send> Observer for ConsoleObserver<W> {
    fn notify(&mut self, snapshot: &Snapshot) -> Result<(), NotifyError> {
        let timestamp = SystemTime::from(snapshot.timestamp());
        let mut line = humantime::format_rfc3339_millis(timestamp).to_string();
        for (alias, value) in snapshot.iter() {
            write!(line, " {alias}={}", value.value)?;
        }
        writeln!(self.out, "{line}").retry_notify()?;
        self.out.flush().retry_notify()?;
        Ok(())
    }
}
