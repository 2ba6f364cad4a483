//! Speculative download while the remote build runs.
//!
//! The supervisor repeatedly pulls the remote project back so artifacts show
//! up locally before the build finishes. It runs on its own tokio task and
//! stops once the watched node (Execute) reaches a terminal state: a
//! [`StopOnTerminal`] listener fires the one-shot stop signal and
//! deregisters itself. Dropping that listener also stops the loop.
//!
//! A transfer already in flight when the stop arrives is allowed to finish,
//! so the final download never overlaps a speculative one.

use crate::command::CommandSpec;
use crate::graph::{ListenerControl, NodeKind, NodeRecord, TaskListener};
use crate::runner::{ProcessRunner, SinkFactory};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Self-contained description of the polling loop.
#[derive(Debug)]
pub struct SpeculativeTransferJob {
    pub command: CommandSpec,
    pub interval: Duration,
    stop: oneshot::Receiver<()>,
}

impl SpeculativeTransferJob {
    /// Create a job and the sender that stops it.
    pub fn new(command: CommandSpec, interval: Duration) -> (Self, oneshot::Sender<()>) {
        let (stop_tx, stop_rx) = oneshot::channel();
        (
            Self {
                command,
                interval,
                stop: stop_rx,
            },
            stop_tx,
        )
    }
}

/// What the loop did before it stopped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SupervisorSummary {
    pub attempts: usize,
    pub failures: usize,
}

/// Listener that stops the supervisor when `watched` becomes terminal.
#[derive(Debug)]
pub struct StopOnTerminal {
    watched: NodeKind,
    stop: Option<oneshot::Sender<()>>,
}

impl StopOnTerminal {
    pub fn new(watched: NodeKind, stop: oneshot::Sender<()>) -> Self {
        Self {
            watched,
            stop: Some(stop),
        }
    }
}

impl TaskListener for StopOnTerminal {
    fn after_execute(&mut self, node: NodeKind, _record: &NodeRecord) -> ListenerControl {
        if node != self.watched {
            return ListenerControl::Keep;
        }
        if let Some(stop) = self.stop.take() {
            debug!(node = %node, "Stopping speculative download");
            let _ = stop.send(());
        }
        ListenerControl::Remove
    }
}

/// Handle to a running supervisor task.
#[derive(Debug)]
pub struct SupervisorHandle {
    task: Option<JoinHandle<SupervisorSummary>>,
}

impl SupervisorHandle {
    /// Wait for the loop to exit.
    pub async fn join(mut self) -> SupervisorSummary {
        match self.task.take() {
            Some(task) => task.await.unwrap_or_else(|err| {
                warn!("Speculative download task ended abnormally: {}", err);
                SupervisorSummary::default()
            }),
            None => SupervisorSummary::default(),
        }
    }
}

impl Drop for SupervisorHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Start `job` on a background task.
pub fn launch<R: ProcessRunner>(
    runner: Arc<R>,
    job: SpeculativeTransferJob,
    sinks: SinkFactory,
) -> SupervisorHandle {
    info!(
        interval = ?job.interval,
        "Downloading from remote in parallel with the remote build"
    );
    let task = tokio::spawn(run_loop(runner, job, sinks));
    SupervisorHandle { task: Some(task) }
}

async fn run_loop<R: ProcessRunner>(
    runner: Arc<R>,
    mut job: SpeculativeTransferJob,
    sinks: SinkFactory,
) -> SupervisorSummary {
    let mut summary = SupervisorSummary::default();
    loop {
        tokio::select! {
            biased;
            _ = &mut job.stop => break,
            _ = tokio::time::sleep(job.interval) => {}
        }
        // The stop may have landed while the timer fired.
        if !matches!(job.stop.try_recv(), Err(TryRecvError::Empty)) {
            break;
        }

        summary.attempts += 1;
        match runner.run(&job.command, sinks(), None).await {
            Ok(exit) if exit.success() => {
                debug!(attempt = summary.attempts, "Speculative download finished");
            }
            Ok(exit) => {
                summary.failures += 1;
                warn!(
                    attempt = summary.attempts,
                    ?exit,
                    "Speculative download failed, will retry"
                );
            }
            Err(err) => {
                summary.failures += 1;
                warn!(
                    attempt = summary.attempts,
                    "Speculative download could not start: {}", err
                );
            }
        }
    }
    debug!(?summary, "Speculative download loop exited");
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::NodeStatus;
    use crate::runner::{MockResponse, MockRule, MockRunner, OutputSinks};
    use std::io;

    fn quiet() -> SinkFactory {
        Arc::new(|| OutputSinks::new(io::sink(), io::sink()))
    }

    fn record() -> NodeRecord {
        NodeRecord {
            status: NodeStatus::Succeeded,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_stop_before_first_tick_runs_nothing() {
        let runner = Arc::new(MockRunner::new());
        let (job, stop) =
            SpeculativeTransferJob::new(CommandSpec::new("rsync"), Duration::from_secs(60));
        let handle = launch(Arc::clone(&runner), job, quiet());
        stop.send(()).unwrap();
        let summary = handle.join().await;
        assert_eq!(summary.attempts, 0);
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_dropping_sender_stops_loop() {
        let runner = Arc::new(MockRunner::new());
        let (job, stop) =
            SpeculativeTransferJob::new(CommandSpec::new("rsync"), Duration::from_secs(60));
        let handle = launch(runner, job, quiet());
        drop(stop);
        assert_eq!(handle.join().await, SupervisorSummary::default());
    }

    #[tokio::test]
    async fn test_failures_are_not_fatal() {
        let runner = Arc::new(MockRunner::new());
        runner.on(MockRule::program("rsync"), MockResponse::exit(23));
        let (job, stop) =
            SpeculativeTransferJob::new(CommandSpec::new("rsync"), Duration::from_millis(5));
        let handle = launch(Arc::clone(&runner), job, quiet());

        while runner.calls().len() < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        stop.send(()).unwrap();
        let summary = handle.join().await;
        assert!(summary.attempts >= 3);
        assert_eq!(summary.attempts, summary.failures);
    }

    #[tokio::test]
    async fn test_in_flight_transfer_completes_before_exit() {
        let runner = Arc::new(MockRunner::new());
        runner.on(
            MockRule::program("rsync"),
            MockResponse::exit(0).delay(Duration::from_millis(50)),
        );
        let (job, stop) =
            SpeculativeTransferJob::new(CommandSpec::new("rsync"), Duration::from_millis(1));
        let handle = launch(Arc::clone(&runner), job, quiet());

        while runner.calls().is_empty() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        stop.send(()).unwrap();
        handle.join().await;
        assert!(runner.calls().iter().all(|call| call.finished.is_some()));
    }

    #[tokio::test]
    async fn test_no_transfer_starts_after_watched_node_finishes() {
        let runner = Arc::new(MockRunner::new());
        let (job, stop) =
            SpeculativeTransferJob::new(CommandSpec::new("rsync"), Duration::from_millis(1));
        let handle = launch(Arc::clone(&runner), job, quiet());
        let mut listener = StopOnTerminal::new(NodeKind::Execute, stop);

        while runner.calls().len() < 2 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(
            listener.after_execute(NodeKind::Execute, &record()),
            ListenerControl::Remove
        );
        let started = runner.calls().len();

        let summary = handle.join().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(runner.calls().len(), started);
        assert_eq!(summary.attempts, started);
    }

    #[test]
    fn test_listener_fires_once_for_watched_node() {
        let (tx, mut rx) = oneshot::channel();
        let mut listener = StopOnTerminal::new(NodeKind::Execute, tx);

        assert_eq!(
            listener.after_execute(NodeKind::Upload, &record()),
            ListenerControl::Keep
        );
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

        assert_eq!(
            listener.after_execute(NodeKind::Execute, &record()),
            ListenerControl::Remove
        );
        assert!(rx.try_recv().is_ok());
    }
}
