//! Error definitions for Mirakle.
//!
//! Every failure the orchestrator can surface is a variant of [`MirakleError`].
//! Variants are grouped by [`ErrorCategory`]:
//!
//! | Category    | Description                                          |
//! |-------------|------------------------------------------------------|
//! | Config      | Missing host, bad interval, unreadable config files  |
//! | Unsupported | Invocation features the remote path cannot reproduce |
//! | Transfer    | Upload/download/fallback processes                   |
//! | Remote      | The build executed on the remote host                |

use crate::config::EnvError;
use crate::graph::NodeKind;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Exit code used when the remote execution exceeded its timeout.
pub const EXIT_TIMED_OUT: i32 = 124;

/// Exit code used for configuration and unsupported-feature errors.
pub const EXIT_CONFIG: i32 = 1;

/// Coarse grouping of errors, used for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Configuration could not be resolved.
    Config,
    /// The invocation requests something the remote path does not support.
    Unsupported,
    /// rsync or the local fallback build failed.
    Transfer,
    /// The remote build failed.
    Remote,
}

impl ErrorCategory {
    /// Returns a human-readable name for the category.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Config => "Configuration",
            Self::Unsupported => "Unsupported",
            Self::Transfer => "Transfer",
            Self::Remote => "Remote build",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Errors surfaced by the orchestrator.
#[derive(Debug, Error)]
pub enum MirakleError {
    #[error("Mirakle host is not defined.")]
    HostNotDefined,

    #[error("downloadInterval must be >0")]
    InvalidDownloadInterval,

    #[error("Mainframer folder is detected but config is missed.")]
    LegacyConfigMissing { dir: PathBuf },

    #[error("Failed to read config {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid execute_timeout '{value}': {source}")]
    InvalidTimeout {
        value: String,
        #[source]
        source: humantime::DurationError,
    },

    #[error("Invalid environment configuration: {}", format_env_errors(.0))]
    Env(Vec<EnvError>),

    #[error("--continuous is not supported yet")]
    ContinuousUnsupported,

    #[error("Included builds is not supported yet")]
    IncludedBuildsUnsupported,

    #[error("--project-dir is not supported as a build argument")]
    ProjectDirUnsupported,

    #[error("Failed to prepare build script stub {path}: {source}")]
    BuildScript {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid task graph: {0}")]
    InvalidGraph(String),

    #[error("Failed to start {node}: {source}")]
    Spawn {
        node: NodeKind,
        #[source]
        source: std::io::Error,
    },

    #[error("Task {node} could not be started")]
    NotStarted { node: NodeKind },

    #[error("Failed to start local build {program}: {source}")]
    LocalBuild {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Task {node} failed with exit code {exit_code}")]
    NodeFailed { node: NodeKind, exit_code: i32 },

    #[error("Remote build finished with non-zero exit value {exit_code}")]
    RemoteBuildFailed { exit_code: i32 },

    #[error("Remote build did not finish within {}", humantime::format_duration(*.timeout))]
    ExecuteTimedOut { timeout: Duration },
}

fn format_env_errors(errors: &[EnvError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl MirakleError {
    /// Category this error belongs to.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::HostNotDefined
            | Self::InvalidDownloadInterval
            | Self::LegacyConfigMissing { .. }
            | Self::ConfigRead { .. }
            | Self::ConfigParse { .. }
            | Self::InvalidTimeout { .. }
            | Self::Env(_)
            | Self::BuildScript { .. }
            | Self::InvalidGraph(_) => ErrorCategory::Config,
            Self::ContinuousUnsupported
            | Self::IncludedBuildsUnsupported
            | Self::ProjectDirUnsupported => ErrorCategory::Unsupported,
            Self::Spawn { .. }
            | Self::NotStarted { .. }
            | Self::LocalBuild { .. }
            | Self::NodeFailed { .. } => ErrorCategory::Transfer,
            Self::RemoteBuildFailed { .. } | Self::ExecuteTimedOut { .. } => ErrorCategory::Remote,
        }
    }

    /// Process exit code the CLI should terminate with.
    ///
    /// Build failures mirror the failing process; everything else is 1.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::NodeFailed { exit_code, .. } | Self::RemoteBuildFailed { exit_code } => {
                if *exit_code == 0 { EXIT_CONFIG } else { *exit_code }
            }
            Self::ExecuteTimedOut { .. } => EXIT_TIMED_OUT,
            _ => EXIT_CONFIG,
        }
    }

    /// Short remediation hint for configuration problems.
    #[must_use]
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::HostNotDefined => Some(
                "Set `host` in mirakle.toml, in ~/.config/mirakle/config.toml or via MIRAKLE_HOST",
            ),
            Self::InvalidDownloadInterval => {
                Some("Set `download_interval` to a positive number of milliseconds")
            }
            Self::LegacyConfigMissing { .. } => {
                Some("Add a `config` file to .mainframer/ or remove the directory")
            }
            Self::ContinuousUnsupported | Self::IncludedBuildsUnsupported => {
                Some("Exclude the mirakle task (-x mirakle) to build locally")
            }
            Self::ProjectDirUnsupported => {
                Some("Select the project with `mirakle --project-dir <dir>` instead")
            }
            _ => None,
        }
    }
}

/// Convenience result alias.
pub type Result<T, E = MirakleError> = std::result::Result<T, E>;
