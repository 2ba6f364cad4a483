//! Task graph for a remote build.
//!
//! Nodes are typed ([`NodeKind`]) and connected by three kinds of edges:
//! - `depends_on`: the dependency is pulled into the run and must be
//!   terminal first
//! - `must_run_after`: ordering only, applied when both nodes run
//! - `finalized_by`: the finalizer is pulled into the run and runs after the
//!   node, even when the node failed
//!
//! Each node may carry gating predicates evaluated just before it would
//! start. [`Executor`] runs the selected nodes in a deterministic topological
//! order (ties broken by declaration order) and notifies [`TaskListener`]s
//! whenever a node becomes terminal.

use crate::command::CommandSpec;
use crate::errors::{EXIT_TIMED_OUT, MirakleError, Result};
use crate::rewrite::RewritingWriter;
use crate::runner::{OutputSinks, ProcessExit, ProcessRunner, SinkFactory, inherit_sinks};
use crate::supervisor::{self, SpeculativeTransferJob, StopOnTerminal, SupervisorHandle};
use serde::Serialize;
use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// The nodes a remote build is made of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Upload,
    Execute,
    Download,
    Fallback,
    ParallelDownload,
    Root,
}

impl NodeKind {
    /// Task name shown in logs and plans.
    pub const fn task_name(&self) -> &'static str {
        match self {
            Self::Upload => "uploadToRemote",
            Self::Execute => "executeOnRemote",
            Self::Download => "downloadFromRemote",
            Self::Fallback => "fallback",
            Self::ParallelDownload => "downloadInParallel",
            Self::Root => "mirakle",
        }
    }
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.task_name())
    }
}

/// Completion status of a node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }

    /// Whether the node actually ran.
    pub fn did_work(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// Runtime record of one node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeRecord {
    pub status: NodeStatus,
    pub exit: Option<ProcessExit>,
    pub duration: Option<Duration>,
}

/// Runtime state of every node, visible to gating predicates.
#[derive(Debug, Clone, Default)]
pub struct GraphState {
    records: BTreeMap<NodeKind, NodeRecord>,
}

impl GraphState {
    pub fn record(&self, kind: NodeKind) -> NodeRecord {
        self.records.get(&kind).cloned().unwrap_or_default()
    }

    pub fn status(&self, kind: NodeKind) -> NodeStatus {
        self.records
            .get(&kind)
            .map(|record| record.status)
            .unwrap_or_default()
    }

    pub fn exit(&self, kind: NodeKind) -> Option<ProcessExit> {
        self.records.get(&kind).and_then(|record| record.exit)
    }

    /// Exit code of a node that ran to completion.
    pub fn exit_code(&self, kind: NodeKind) -> Option<i32> {
        self.exit(kind).and_then(|exit| exit.code())
    }

    pub fn is_terminal(&self, kind: NodeKind) -> bool {
        self.status(kind).is_terminal()
    }

    /// Overwrite the record of `kind`.
    pub fn insert(&mut self, kind: NodeKind, record: NodeRecord) {
        self.records.insert(kind, record);
    }

    fn entry(&mut self, kind: NodeKind) -> &mut NodeRecord {
        self.records.entry(kind).or_default()
    }
}

/// Gate evaluated right before a node would start.
pub type Predicate = Arc<dyn Fn(&GraphState) -> bool + Send + Sync>;

/// Body of a node that inspects the graph and yields the build exit code.
pub type OutcomeFn = Arc<dyn Fn(&GraphState) -> Result<i32> + Send + Sync>;

/// Where a command node's output goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputMode {
    Inherit,
    /// Rewrite `/…/<remote_dir>` prefixes to `local_dir` on both streams.
    RewritePaths { remote_dir: String, local_dir: String },
}

/// What a node does when it runs.
#[derive(Clone)]
pub enum NodeAction {
    /// Run an external process.
    Command {
        command: CommandSpec,
        output: OutputMode,
        timeout: Option<Duration>,
    },
    /// Start the speculative download supervisor in the background. The node
    /// stays running until the supervisor exits, which happens once `watch`
    /// is terminal.
    SpeculativeDownload {
        command: CommandSpec,
        interval: Duration,
        watch: NodeKind,
    },
    /// Evaluate the build result.
    Outcome(OutcomeFn),
}

impl std::fmt::Debug for NodeAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Command {
                command,
                output,
                timeout,
            } => f
                .debug_struct("Command")
                .field("command", command)
                .field("output", output)
                .field("timeout", timeout)
                .finish(),
            Self::SpeculativeDownload {
                command,
                interval,
                watch,
            } => f
                .debug_struct("SpeculativeDownload")
                .field("command", command)
                .field("interval", interval)
                .field("watch", watch)
                .finish(),
            Self::Outcome(_) => f.write_str("Outcome"),
        }
    }
}

/// A node with its edges and gates.
#[derive(Clone)]
pub struct Node {
    pub kind: NodeKind,
    pub action: NodeAction,
    depends_on: Vec<NodeKind>,
    must_run_after: Vec<NodeKind>,
    finalized_by: Vec<NodeKind>,
    only_if: Vec<Predicate>,
    ignore_exit_value: bool,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("kind", &self.kind)
            .field("action", &self.action)
            .field("depends_on", &self.depends_on)
            .field("must_run_after", &self.must_run_after)
            .field("finalized_by", &self.finalized_by)
            .field("gates", &self.only_if.len())
            .field("ignore_exit_value", &self.ignore_exit_value)
            .finish()
    }
}

impl Node {
    pub fn new(kind: NodeKind, action: NodeAction) -> Self {
        Self {
            kind,
            action,
            depends_on: Vec::new(),
            must_run_after: Vec::new(),
            finalized_by: Vec::new(),
            only_if: Vec::new(),
            ignore_exit_value: false,
        }
    }

    /// Command node with inherited output and no timeout.
    pub fn command(kind: NodeKind, command: CommandSpec) -> Self {
        Self::new(
            kind,
            NodeAction::Command {
                command,
                output: OutputMode::Inherit,
                timeout: None,
            },
        )
    }

    pub fn depends_on(&mut self, kinds: impl IntoIterator<Item = NodeKind>) -> &mut Self {
        extend_unique(&mut self.depends_on, kinds);
        self
    }

    pub fn must_run_after(&mut self, kinds: impl IntoIterator<Item = NodeKind>) -> &mut Self {
        extend_unique(&mut self.must_run_after, kinds);
        self
    }

    pub fn finalized_by(&mut self, kinds: impl IntoIterator<Item = NodeKind>) -> &mut Self {
        extend_unique(&mut self.finalized_by, kinds);
        self
    }

    /// Add a gate. All gates must hold for the node to run.
    pub fn only_if(
        &mut self,
        predicate: impl Fn(&GraphState) -> bool + Send + Sync + 'static,
    ) -> &mut Self {
        self.only_if.push(Arc::new(predicate));
        self
    }

    /// A non-zero exit no longer fails the node; the code is still recorded.
    pub fn ignore_exit_value(&mut self, ignore: bool) -> &mut Self {
        self.ignore_exit_value = ignore;
        self
    }

    /// Route a command node's output.
    pub fn output(&mut self, mode: OutputMode) -> &mut Self {
        if let NodeAction::Command { output, .. } = &mut self.action {
            *output = mode;
        }
        self
    }

    /// Kill a command node's process after `limit`.
    pub fn timeout(&mut self, limit: Option<Duration>) -> &mut Self {
        if let NodeAction::Command { timeout, .. } = &mut self.action {
            *timeout = limit;
        }
        self
    }

    pub fn dependencies(&self) -> &[NodeKind] {
        &self.depends_on
    }

    pub fn ordering(&self) -> &[NodeKind] {
        &self.must_run_after
    }

    pub fn finalizers(&self) -> &[NodeKind] {
        &self.finalized_by
    }

    pub fn is_gated(&self) -> bool {
        !self.only_if.is_empty()
    }

    pub fn ignores_exit_value(&self) -> bool {
        self.ignore_exit_value
    }

    /// Whether every gate holds.
    pub fn should_run(&self, state: &GraphState) -> bool {
        self.only_if.iter().all(|gate| gate(state))
    }

    fn must_follow(&self, other: NodeKind) -> bool {
        self.depends_on.contains(&other) || self.must_run_after.contains(&other)
    }
}

fn extend_unique(target: &mut Vec<NodeKind>, kinds: impl IntoIterator<Item = NodeKind>) {
    for kind in kinds {
        if !target.contains(&kind) {
            target.push(kind);
        }
    }
}

/// One entry of a dry-run plan.
#[derive(Debug, Clone, Serialize)]
pub struct PlannedNode {
    pub kind: NodeKind,
    pub name: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<CommandSpec>,
    pub depends_on: Vec<NodeKind>,
    pub must_run_after: Vec<NodeKind>,
    pub finalized_by: Vec<NodeKind>,
    pub gated: bool,
    pub ignore_exit_value: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub background: bool,
}

/// Declared nodes plus the selection to run.
#[derive(Debug, Clone, Default)]
pub struct TaskGraph {
    nodes: Vec<Node>,
    selected: Vec<NodeKind>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a node, replacing an earlier one of the same kind. Declaration
    /// order breaks ordering ties.
    pub fn add(&mut self, node: Node) -> &mut Node {
        let index = match self.nodes.iter().position(|n| n.kind == node.kind) {
            Some(index) => {
                self.nodes[index] = node;
                index
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        };
        &mut self.nodes[index]
    }

    pub fn node(&self, kind: NodeKind) -> Option<&Node> {
        self.nodes.iter().find(|n| n.kind == kind)
    }

    pub fn node_mut(&mut self, kind: NodeKind) -> Option<&mut Node> {
        self.nodes.iter_mut().find(|n| n.kind == kind)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    /// Replace the selection of nodes to run.
    pub fn select(&mut self, kinds: impl IntoIterator<Item = NodeKind>) {
        self.selected = kinds.into_iter().collect();
    }

    pub fn selected(&self) -> &[NodeKind] {
        &self.selected
    }

    fn index_of(&self, kind: NodeKind) -> Result<usize> {
        self.nodes
            .iter()
            .position(|n| n.kind == kind)
            .ok_or_else(|| MirakleError::InvalidGraph(format!("task {kind} is not declared")))
    }

    /// Nodes that will run, in execution order.
    ///
    /// The selection is closed over `depends_on` and `finalized_by`; ordering
    /// then honours dependencies, `must_run_after` and finalizers, picking
    /// the earliest-declared ready node at each step.
    pub fn execution_order(&self) -> Result<Vec<NodeKind>> {
        let count = self.nodes.len();
        let mut included = vec![false; count];
        let mut stack = Vec::new();
        for kind in &self.selected {
            stack.push(self.index_of(*kind)?);
        }
        while let Some(index) = stack.pop() {
            if included[index] {
                continue;
            }
            included[index] = true;
            let node = &self.nodes[index];
            for kind in node.depends_on.iter().chain(&node.finalized_by) {
                stack.push(self.index_of(*kind)?);
            }
        }

        let mut preds = vec![Vec::new(); count];
        for (index, node) in self.nodes.iter().enumerate() {
            if !included[index] {
                continue;
            }
            for kind in node.depends_on.iter().chain(&node.must_run_after) {
                if let Some(before) = self.nodes.iter().position(|n| n.kind == *kind)
                    && included[before]
                {
                    preds[index].push(before);
                }
            }
            for kind in &node.finalized_by {
                let after = self.index_of(*kind)?;
                preds[after].push(index);
            }
        }

        let mut order = Vec::new();
        let mut done = vec![false; count];
        loop {
            let next = (0..count).find(|&i| {
                included[i] && !done[i] && preds[i].iter().all(|&before| done[before])
            });
            match next {
                Some(index) => {
                    done[index] = true;
                    order.push(self.nodes[index].kind);
                }
                None => break,
            }
        }

        if order.len() != included.iter().filter(|i| **i).count() {
            let stuck: Vec<String> = (0..count)
                .filter(|&i| included[i] && !done[i])
                .map(|i| self.nodes[i].kind.to_string())
                .collect();
            return Err(MirakleError::InvalidGraph(format!(
                "cycle between {}",
                stuck.join(", ")
            )));
        }
        Ok(order)
    }

    /// Ordered description of what would run.
    pub fn plan(&self) -> Result<Vec<PlannedNode>> {
        let order = self.execution_order()?;
        Ok(order
            .into_iter()
            .filter_map(|kind| self.node(kind))
            .map(|node| {
                let (command, background) = match &node.action {
                    NodeAction::Command { command, .. } => (Some(command.clone()), false),
                    NodeAction::SpeculativeDownload { command, .. } => {
                        (Some(command.clone()), true)
                    }
                    NodeAction::Outcome(_) => (None, false),
                };
                PlannedNode {
                    kind: node.kind,
                    name: node.kind.task_name(),
                    command,
                    depends_on: node.depends_on.clone(),
                    must_run_after: node.must_run_after.clone(),
                    finalized_by: node.finalized_by.clone(),
                    gated: node.is_gated(),
                    ignore_exit_value: node.ignore_exit_value,
                    background,
                }
            })
            .collect())
    }
}

/// Whether a listener stays registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerControl {
    Keep,
    Remove,
}

/// Observer of node lifecycle events.
pub trait TaskListener: Send {
    /// Called once when `node` becomes terminal (including skipped).
    fn after_execute(&mut self, node: NodeKind, record: &NodeRecord) -> ListenerControl;
}

/// Result of running a graph.
#[derive(Debug)]
pub struct ExecutionReport {
    pub order: Vec<NodeKind>,
    pub state: GraphState,
    /// Exit code of the last outcome node (0 when none ran), or the failure
    /// that stopped the run.
    pub outcome: Result<i32>,
}

struct Background {
    kind: NodeKind,
    handle: SupervisorHandle,
    started: Instant,
}

/// Drives a [`TaskGraph`] to completion.
pub struct Executor<R: ProcessRunner> {
    graph: TaskGraph,
    runner: Arc<R>,
    sinks: SinkFactory,
    listeners: Vec<Box<dyn TaskListener>>,
}

impl<R: ProcessRunner> Executor<R> {
    pub fn new(graph: TaskGraph, runner: Arc<R>) -> Self {
        Self {
            graph,
            runner,
            sinks: inherit_sinks(),
            listeners: Vec::new(),
        }
    }

    /// Send process output somewhere other than this process's stdio.
    pub fn with_sinks(mut self, sinks: SinkFactory) -> Self {
        self.sinks = sinks;
        self
    }

    pub fn add_listener(&mut self, listener: impl TaskListener + 'static) {
        self.listeners.push(Box::new(listener));
    }

    /// Run the selected nodes.
    ///
    /// A failing node stops the run: later nodes stay pending, except
    /// finalizers of the failed node, which still run.
    pub async fn run(mut self) -> ExecutionReport {
        let mut state = GraphState::default();
        let order = match self.graph.execution_order() {
            Ok(order) => order,
            Err(err) => {
                return ExecutionReport {
                    order: Vec::new(),
                    state,
                    outcome: Err(err),
                };
            }
        };
        debug!(order = ?order, "Task graph resolved");

        let mut background: Vec<Background> = Vec::new();
        let mut failure: Option<(NodeKind, MirakleError)> = None;
        let mut exit_code = 0;

        for &kind in &order {
            let Some(node) = self.graph.node(kind).cloned() else {
                continue;
            };

            if let Some((failed, _)) = &failure {
                let is_finalizer = self
                    .graph
                    .node(*failed)
                    .is_some_and(|f| f.finalized_by.contains(&kind));
                if !is_finalizer {
                    continue;
                }
            }

            let pending: Vec<NodeKind> = background
                .iter()
                .map(|bg| bg.kind)
                .filter(|bg| node.must_follow(*bg))
                .collect();
            for bg in pending {
                self.settle(&mut background, bg, &mut state).await;
            }

            if !node.should_run(&state) {
                info!(task = %kind, "Task skipped");
                state.entry(kind).status = NodeStatus::Skipped;
                self.notify(kind, &state);
                continue;
            }

            debug!(task = %kind, "Task started");
            state.entry(kind).status = NodeStatus::Running;
            let started = Instant::now();

            let (status, exit, error) = match &node.action {
                NodeAction::Command {
                    command,
                    output,
                    timeout,
                } => {
                    let result = match self.sinks_for(output) {
                        Ok(sinks) => self.runner.run(command, sinks, *timeout).await,
                        Err(err) => Err(err),
                    };
                    command_result(&node, result)
                }
                NodeAction::SpeculativeDownload {
                    command,
                    interval,
                    watch,
                } => {
                    let (job, stop) = SpeculativeTransferJob::new(command.clone(), *interval);
                    let handle =
                        supervisor::launch(Arc::clone(&self.runner), job, Arc::clone(&self.sinks));
                    self.listeners
                        .push(Box::new(StopOnTerminal::new(*watch, stop)));
                    background.push(Background {
                        kind,
                        handle,
                        started,
                    });
                    continue;
                }
                NodeAction::Outcome(outcome) => match outcome(&state) {
                    Ok(code) => {
                        exit_code = code;
                        (NodeStatus::Succeeded, Some(ProcessExit::Code(code)), None)
                    }
                    Err(err) => (NodeStatus::Failed, None, Some(err)),
                },
            };

            let record = state.entry(kind);
            record.status = status;
            record.exit = exit;
            record.duration = Some(started.elapsed());
            debug!(task = %kind, status = ?status, exit = ?exit, "Task finished");
            self.notify(kind, &state);

            if let Some(err) = error
                && failure.is_none()
            {
                failure = Some((kind, err));
            }
        }

        // Anything still in the background was never told to stop.
        self.listeners.clear();
        let remaining: Vec<NodeKind> = background.iter().map(|bg| bg.kind).collect();
        for bg in remaining {
            self.settle(&mut background, bg, &mut state).await;
        }

        ExecutionReport {
            order,
            state,
            outcome: match failure {
                Some((_, err)) => Err(err),
                None => Ok(exit_code),
            },
        }
    }

    fn sinks_for(&self, output: &OutputMode) -> io::Result<OutputSinks> {
        let base = (self.sinks)();
        match output {
            OutputMode::Inherit => Ok(base),
            OutputMode::RewritePaths {
                remote_dir,
                local_dir,
            } => Ok(OutputSinks {
                stdout: Box::new(
                    RewritingWriter::new(base.stdout, remote_dir, local_dir)
                        .map_err(io::Error::other)?,
                ),
                stderr: Box::new(
                    RewritingWriter::new(base.stderr, remote_dir, local_dir)
                        .map_err(io::Error::other)?,
                ),
            }),
        }
    }

    /// Wait for a background node to finish and mark it terminal.
    async fn settle(
        &mut self,
        background: &mut Vec<Background>,
        kind: NodeKind,
        state: &mut GraphState,
    ) {
        let Some(index) = background.iter().position(|bg| bg.kind == kind) else {
            return;
        };
        let bg = background.remove(index);
        let summary = bg.handle.join().await;
        debug!(task = %kind, attempts = summary.attempts, failures = summary.failures, "Background task finished");

        let record = state.entry(kind);
        record.status = NodeStatus::Succeeded;
        record.duration = Some(bg.started.elapsed());
        self.notify(kind, state);
    }

    fn notify(&mut self, kind: NodeKind, state: &GraphState) {
        let record = state.record(kind);
        self.listeners
            .retain_mut(|listener| listener.after_execute(kind, &record) == ListenerControl::Keep);
    }
}

type CommandResult = (NodeStatus, Option<ProcessExit>, Option<MirakleError>);

fn command_result(node: &Node, result: io::Result<ProcessExit>) -> CommandResult {
    let kind = node.kind;
    match result {
        Ok(exit @ ProcessExit::Code(0)) => (NodeStatus::Succeeded, Some(exit), None),
        Ok(exit @ ProcessExit::Code(code)) if node.ignore_exit_value => {
            debug!(task = %kind, code, "Ignoring non-zero exit value");
            (NodeStatus::Succeeded, Some(exit), None)
        }
        Ok(exit @ ProcessExit::Code(code)) => (
            NodeStatus::Failed,
            Some(exit),
            Some(MirakleError::NodeFailed {
                node: kind,
                exit_code: code,
            }),
        ),
        Ok(exit @ ProcessExit::TimedOut) if node.ignore_exit_value => {
            (NodeStatus::Failed, Some(exit), None)
        }
        Ok(exit @ ProcessExit::TimedOut) => (
            NodeStatus::Failed,
            Some(exit),
            Some(MirakleError::NodeFailed {
                node: kind,
                exit_code: EXIT_TIMED_OUT,
            }),
        ),
        Err(source) if node.ignore_exit_value => {
            tracing::warn!(task = %kind, "Failed to start: {}", source);
            (NodeStatus::Failed, None, None)
        }
        Err(source) => (
            NodeStatus::Failed,
            None,
            Some(MirakleError::Spawn { node: kind, source }),
        ),
    }
}
