//! Remote build orchestration.
//!
//! [`Orchestrator::run`] decides whether an invocation is offloaded. If it
//! is not, the build runs locally unchanged. If it is, the configuration is
//! resolved, the upload/execute/download graph is built and executed, and
//! the exit code of the remote (or fallback) build is returned.

use crate::command::{self, CommandSpec, ProjectLayout};
use crate::config::{ConfigLoader, ConfigSource, DEFAULT_ENTRYPOINT, PROJECT_CONFIG_FILE, SessionConfig};
use crate::errors::{MirakleError, Result};
use crate::graph::{
    Executor, GraphState, ListenerControl, Node, NodeAction, NodeKind, NodeRecord, NodeStatus,
    OutputMode, PlannedNode, TaskGraph, TaskListener,
};
use crate::invocation::{BUILD_ON_REMOTE, FALLBACK, InvocationDescriptor, MIRAKLE_TASK, strip_opt_out};
use crate::runner::{ProcessExit, ProcessRunner, SinkFactory, inherit_sinks};
use crate::translate;
use crate::util::pretty_time;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Placeholder build definition used when the project has no `mirakle.toml`.
pub const BUILD_SCRIPT_STUB: &str = "mirakle_build_file_stub";

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Why an invocation is not offloaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NoTasks,
    RunningOnRemote,
    RunningFallback,
    OptedOut,
    DryRun,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::NoTasks => "no tasks requested",
            Self::RunningOnRemote => "already running on the remote machine",
            Self::RunningFallback => "already running as a local fallback",
            Self::OptedOut => "excluded with -x mirakle",
            Self::DryRun => "dry run",
        };
        f.write_str(text)
    }
}

/// Activation gate. `None` means the invocation is offloaded.
pub fn skip_reason(descriptor: &InvocationDescriptor) -> Option<SkipReason> {
    if descriptor.task_names.is_empty() {
        Some(SkipReason::NoTasks)
    } else if descriptor.has_project_property(BUILD_ON_REMOTE) {
        Some(SkipReason::RunningOnRemote)
    } else if descriptor.has_project_property(FALLBACK) {
        Some(SkipReason::RunningFallback)
    } else if descriptor.excludes(MIRAKLE_TASK) {
        Some(SkipReason::OptedOut)
    } else if descriptor.dry_run {
        Some(SkipReason::DryRun)
    } else {
        None
    }
}

/// Reject invocations the remote build cannot reproduce.
pub fn check_supported(descriptor: &InvocationDescriptor) -> Result<()> {
    if descriptor.continuous {
        return Err(MirakleError::ContinuousUnsupported);
    }
    if !descriptor.included_builds.is_empty() {
        return Err(MirakleError::IncludedBuildsUnsupported);
    }
    // The uploaded tree is the CLI's project root, never a build argument.
    if descriptor.project_dir.is_some() {
        return Err(MirakleError::ProjectDirUnsupported);
    }
    Ok(())
}

/// The build definition for this run: `mirakle.toml` when the project has
/// one, otherwise an empty stub that is deleted when the guard drops.
#[derive(Debug)]
pub struct BuildScript {
    path: PathBuf,
    stub: bool,
}

impl BuildScript {
    pub fn prepare(project_root: &Path) -> Result<Self> {
        let script = project_root.join(PROJECT_CONFIG_FILE);
        if script.exists() {
            return Ok(Self {
                path: script,
                stub: false,
            });
        }
        let path = project_root.join(BUILD_SCRIPT_STUB);
        std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|source| MirakleError::BuildScript {
                path: path.clone(),
                source,
            })?;
        debug!(path = %path.display(), "Created build script stub");
        Ok(Self { path, stub: true })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_stub(&self) -> bool {
        self.stub
    }
}

impl Drop for BuildScript {
    fn drop(&mut self) {
        if self.stub
            && let Err(err) = std::fs::remove_file(&self.path)
        {
            debug!(path = %self.path.display(), "Failed to remove build script stub: {}", err);
        }
    }
}

/// Build the task graph for an offloaded invocation.
///
/// Validates the download interval before any node is created.
pub fn build_graph(
    config: &SessionConfig,
    layout: &ProjectLayout,
    original: &InvocationDescriptor,
) -> Result<TaskGraph> {
    let interval = if config.download_in_parallel {
        Some(config.download_interval()?)
    } else {
        None
    };
    let args = translate::to_args(original);
    let mut graph = TaskGraph::new();

    graph.add(Node::command(NodeKind::Upload, command::upload(config, layout)));

    if config.fallback {
        graph
            .add(Node::command(
                NodeKind::Fallback,
                command::fallback(config, layout, &args),
            ))
            .only_if(|state| !upload_succeeded(state));
        if let Some(upload) = graph.node_mut(NodeKind::Upload) {
            upload
                .ignore_exit_value(true)
                .finalized_by([NodeKind::Fallback]);
        }
    }

    if let Some(interval) = interval {
        graph
            .add(Node::new(
                NodeKind::ParallelDownload,
                NodeAction::SpeculativeDownload {
                    command: command::download(config, layout),
                    interval,
                    watch: NodeKind::Execute,
                },
            ))
            .must_run_after([NodeKind::Upload])
            .only_if(|state| upload_succeeded(state) && !state.is_terminal(NodeKind::Execute));
    }

    let execute = graph
        .add(Node::command(
            NodeKind::Execute,
            command::execute(config, layout, &args),
        ))
        .must_run_after([NodeKind::Upload])
        .ignore_exit_value(true)
        .timeout(config.execute_timeout)
        .output(OutputMode::RewritePaths {
            remote_dir: rewrite_source(&layout.remote_dir(config)),
            local_dir: layout.root.display().to_string(),
        });
    if config.fallback {
        execute.only_if(upload_succeeded);
    }

    let download = graph
        .add(Node::command(
            NodeKind::Download,
            command::download(config, layout),
        ))
        .must_run_after([NodeKind::Execute]);
    if interval.is_some() {
        download.must_run_after([NodeKind::ParallelDownload]);
    }
    if config.fallback {
        download.only_if(upload_succeeded);
    }

    let timeout = config.execute_timeout;
    graph
        .add(Node::new(
            NodeKind::Root,
            NodeAction::Outcome(Arc::new(move |state: &GraphState| {
                build_result(state, timeout)
            })),
        ))
        .depends_on([NodeKind::Upload, NodeKind::Execute, NodeKind::Download]);

    if interval.is_some() {
        graph.select([NodeKind::ParallelDownload, NodeKind::Root]);
    } else {
        graph.select([NodeKind::Root]);
    }
    Ok(graph)
}

fn upload_succeeded(state: &GraphState) -> bool {
    state.exit(NodeKind::Upload) == Some(ProcessExit::Code(0))
}

/// Remote paths are printed expanded, so `~/` cannot appear in them.
fn rewrite_source(remote_dir: &str) -> String {
    remote_dir.trim_start_matches("~/").to_string()
}

/// Root assertion: the fallback's result when it ran, else the remote
/// build's.
fn build_result(state: &GraphState, timeout: Option<Duration>) -> Result<i32> {
    if state.status(NodeKind::Fallback) == NodeStatus::Succeeded {
        return Ok(0);
    }
    execute_failure(state, timeout).map_or(Ok(0), Err)
}

fn execute_failure(state: &GraphState, timeout: Option<Duration>) -> Option<MirakleError> {
    match state.exit(NodeKind::Execute) {
        Some(ProcessExit::Code(0)) => None,
        Some(ProcessExit::Code(exit_code)) => Some(MirakleError::RemoteBuildFailed { exit_code }),
        Some(ProcessExit::TimedOut) => Some(MirakleError::ExecuteTimedOut {
            timeout: timeout.unwrap_or_default(),
        }),
        None => Some(MirakleError::NotStarted {
            node: NodeKind::Execute,
        }),
    }
}

/// Logs per-task timings and the fallback notice.
#[derive(Debug)]
struct BuildProgress {
    fallback: bool,
}

impl TaskListener for BuildProgress {
    fn after_execute(&mut self, node: NodeKind, record: &NodeRecord) -> ListenerControl {
        if node == NodeKind::Upload
            && self.fallback
            && record.exit != Some(ProcessExit::Code(0))
        {
            info!("Upload to remote failed. Continuing with fallback.");
        }
        if node != NodeKind::Root
            && record.status.did_work()
            && let Some(duration) = record.duration
        {
            info!("Task {} took: {}", node, pretty_time(duration));
        }
        ListenerControl::Keep
    }
}

/// How an invocation was handled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RunMode {
    Local { reason: SkipReason },
    Remote { source: ConfigSource },
}

/// Result of a finished build.
#[derive(Debug)]
pub struct RunSummary {
    pub mode: RunMode,
    pub exit_code: i32,
    pub state: Option<GraphState>,
}

/// What `run` would do, without doing it.
#[derive(Debug, Clone, Serialize)]
pub struct BuildPlan {
    #[serde(flatten)]
    pub mode: RunMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<PlannedNode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local: Option<CommandSpec>,
}

/// Entry point for offloading a build.
pub struct Orchestrator<R: ProcessRunner> {
    runner: Arc<R>,
    loader: ConfigLoader,
    sinks: SinkFactory,
}

impl<R: ProcessRunner> Orchestrator<R> {
    pub fn new(runner: Arc<R>, loader: ConfigLoader) -> Self {
        Self {
            runner,
            loader,
            sinks: inherit_sinks(),
        }
    }

    /// Send process output somewhere other than this process's stdio.
    pub fn with_sinks(mut self, sinks: SinkFactory) -> Self {
        self.sinks = sinks;
        self
    }

    pub fn project_root(&self) -> &Path {
        self.loader.project_root()
    }

    /// Run the build described by `args`.
    pub async fn run(&self, args: &[String]) -> Result<RunSummary> {
        let started = Instant::now();
        let descriptor = InvocationDescriptor::parse(args);

        if let Some(reason) = skip_reason(&descriptor) {
            return self.run_locally(args, reason).await;
        }
        check_supported(&descriptor)?;

        debug!(root = %self.project_root().display(), "Configuring remote build");
        let resolved = {
            let _script = BuildScript::prepare(self.project_root())?;
            self.loader.resolve()?
        };
        let config = &resolved.config;
        info!(
            "Here's Mirakle {}. All tasks will be executed on {}.",
            VERSION, config.host
        );

        let layout = ProjectLayout::from_root(self.project_root());
        let graph = build_graph(config, &layout, &descriptor)?;

        let mut executor =
            Executor::new(graph, Arc::clone(&self.runner)).with_sinks(Arc::clone(&self.sinks));
        executor.add_listener(BuildProgress {
            fallback: config.fallback,
        });
        let report = executor.run().await;
        info!("Total time : {}", pretty_time(started.elapsed()));

        let exit_code = match report.outcome {
            Ok(code) => code,
            Err(err) => return Err(prefer_execute_failure(err, &report.state, config)),
        };
        Ok(RunSummary {
            mode: RunMode::Remote {
                source: resolved.source,
            },
            exit_code,
            state: Some(report.state),
        })
    }

    /// Describe what `run` would do.
    pub fn plan(&self, args: &[String]) -> Result<BuildPlan> {
        let descriptor = InvocationDescriptor::parse(args);
        if let Some(reason) = skip_reason(&descriptor) {
            return Ok(BuildPlan {
                mode: RunMode::Local { reason },
                host: None,
                nodes: Vec::new(),
                local: Some(self.local_command(args)),
            });
        }
        check_supported(&descriptor)?;

        let resolved = self.loader.resolve()?;
        let layout = ProjectLayout::from_root(self.project_root());
        let graph = build_graph(&resolved.config, &layout, &descriptor)?;
        Ok(BuildPlan {
            host: Some(resolved.config.host.clone()),
            mode: RunMode::Remote {
                source: resolved.source,
            },
            nodes: graph.plan()?,
            local: None,
        })
    }

    async fn run_locally(&self, args: &[String], reason: SkipReason) -> Result<RunSummary> {
        info!("Building locally: {}", reason);
        let cmd = self.local_command(args);
        let exit = self
            .runner
            .run(&cmd, (self.sinks)(), None)
            .await
            .map_err(|source| MirakleError::LocalBuild {
                program: cmd.program.clone(),
                source,
            })?;
        Ok(RunSummary {
            mode: RunMode::Local { reason },
            exit_code: exit.code().unwrap_or(1),
            state: None,
        })
    }

    fn local_command(&self, args: &[String]) -> CommandSpec {
        // The entrypoint is configurable, but a local build must not fail
        // just because no remote host is set up.
        let entrypoint = self
            .loader
            .resolve()
            .map(|resolved| resolved.config.entrypoint)
            .unwrap_or_else(|_| DEFAULT_ENTRYPOINT.to_string());
        command::passthrough(self.project_root(), &entrypoint, &strip_opt_out(args))
    }
}

/// A download failure after a failed remote build is reported as the remote
/// build failure.
fn prefer_execute_failure(
    err: MirakleError,
    state: &GraphState,
    config: &SessionConfig,
) -> MirakleError {
    let download_failed = matches!(
        err,
        MirakleError::NodeFailed {
            node: NodeKind::Download,
            ..
        } | MirakleError::Spawn {
            node: NodeKind::Download,
            ..
        }
    );
    if !download_failed || state.status(NodeKind::Execute) == NodeStatus::Pending {
        return err;
    }
    match execute_failure(state, config.execute_timeout) {
        Some(execute_err) => {
            warn!("Download after the failed remote build also failed: {}", err);
            execute_err
        }
        None => err,
    }
}
