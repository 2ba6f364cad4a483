//! Mirakle core library.
//!
//! Runs a build on a remote machine: the project is uploaded with rsync, the
//! build entrypoint is executed over ssh and the results are downloaded back,
//! optionally falling back to a local build when the upload fails.

pub mod command;
pub mod config;
pub mod errors;
pub mod graph;
pub mod invocation;
pub mod logging;
pub mod orchestrator;
pub mod rewrite;
pub mod runner;
pub mod supervisor;
pub mod translate;
pub mod util;

pub use command::{CommandSpec, ProjectLayout};
pub use config::{ConfigLoader, ConfigSource, ResolvedConfig, SessionConfig};
pub use errors::{ErrorCategory, MirakleError, Result};
pub use graph::{Executor, GraphState, NodeKind, NodeStatus, TaskGraph};
pub use invocation::InvocationDescriptor;
pub use logging::{LogConfig, LogFormat, init_logging};
pub use orchestrator::{BuildPlan, Orchestrator, RunMode, RunSummary, SkipReason};
pub use rewrite::{PathRewriter, RewritingWriter};
pub use runner::{MockRunner, ProcessExit, ProcessRunner, SystemRunner};
