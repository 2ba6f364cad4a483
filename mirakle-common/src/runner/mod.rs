//! Process execution seam.
//!
//! Every external process (rsync, ssh, the local build entrypoint) is started
//! through a [`ProcessRunner`]. [`SystemRunner`] spawns real processes with
//! `tokio::process`; [`MockRunner`] replays scripted results for tests.

mod mock;
mod system;

pub use mock::{MockCall, MockResponse, MockRule, MockRunner};
pub use system::SystemRunner;

use crate::command::CommandSpec;
use std::future::Future;
use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;

/// How a process finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessExit {
    /// Exited on its own (signals map to `128 + signal`).
    Code(i32),
    /// Killed after exceeding its timeout.
    TimedOut,
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        matches!(self, Self::Code(0))
    }

    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Code(code) => Some(*code),
            Self::TimedOut => None,
        }
    }
}

/// Destinations for a child's stdout and stderr.
pub struct OutputSinks {
    pub stdout: Box<dyn Write + Send>,
    pub stderr: Box<dyn Write + Send>,
}

impl OutputSinks {
    /// Forward to this process's own stdout/stderr.
    pub fn inherit() -> Self {
        Self {
            stdout: Box::new(io::stdout()),
            stderr: Box::new(io::stderr()),
        }
    }

    pub fn new(stdout: impl Write + Send + 'static, stderr: impl Write + Send + 'static) -> Self {
        Self {
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
        }
    }
}

/// Produces fresh sinks for each process that writes to the console.
pub type SinkFactory = Arc<dyn Fn() -> OutputSinks + Send + Sync>;

/// Sinks forwarding to this process's stdout/stderr.
pub fn inherit_sinks() -> SinkFactory {
    Arc::new(OutputSinks::inherit)
}

impl std::fmt::Debug for OutputSinks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputSinks").finish_non_exhaustive()
    }
}

/// Starts external processes and waits for them.
pub trait ProcessRunner: Send + Sync + 'static {
    /// Run `cmd` to completion, streaming its output into `sinks`.
    ///
    /// With a `timeout`, the process is killed once it elapses and
    /// [`ProcessExit::TimedOut`] is returned. Spawn failures are `Err`.
    fn run(
        &self,
        cmd: &CommandSpec,
        sinks: OutputSinks,
        timeout: Option<Duration>,
    ) -> impl Future<Output = io::Result<ProcessExit>> + Send;
}
