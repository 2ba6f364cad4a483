//! Remote session configuration.
//!
//! A session is configured from exactly one of two sources:
//! - the native configuration, layered from the user config file, the
//!   project's `mirakle.toml` (or an explicit `--config` file) and `MIRAKLE_*`
//!   environment variables
//! - a legacy `.mainframer/` directory in the project root, which replaces
//!   the native configuration entirely when present

pub mod env;
pub mod legacy;
pub mod native;

pub use env::{EnvError, EnvParser};
pub use native::{PartialConfig, PROJECT_CONFIG_FILE};

use crate::errors::{MirakleError, Result};
use crate::util::push_unique;
use serde::{Serialize, Serializer};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Default remote folder, relative to the remote user's home.
pub const DEFAULT_REMOTE_FOLDER: &str = "mirakle";

/// Default build entrypoint, relative to the project root.
pub const DEFAULT_ENTRYPOINT: &str = "gradlew";

/// Default speculative download poll interval in milliseconds.
pub const DEFAULT_DOWNLOAD_INTERVAL_MS: i64 = 2000;

/// Patterns excluded only when uploading.
pub fn default_exclude_local() -> Vec<String> {
    vec!["**/build".to_string()]
}

/// Patterns excluded only when downloading.
pub fn default_exclude_remote() -> Vec<String> {
    vec!["**/src/".to_string()]
}

/// Patterns excluded in both directions.
pub fn default_exclude_common() -> Vec<String> {
    [".gradle", ".idea", "**/.git/", "**/local.properties"]
        .into_iter()
        .map(String::from)
        .collect()
}

/// Base rsync arguments for either direction.
pub fn default_rsync_args() -> Vec<String> {
    vec!["--archive".to_string(), "--delete".to_string()]
}

/// Where the effective configuration came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConfigSource {
    /// Layered native configuration; `files` lists the files that were read,
    /// lowest precedence first.
    Native {
        files: Vec<PathBuf>,
        env_overrides: Vec<String>,
    },
    /// Legacy `.mainframer/` directory.
    Legacy { dir: PathBuf },
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Native { files, .. } if files.is_empty() => write!(f, "native (defaults)"),
            Self::Native { files, .. } => {
                let files: Vec<String> = files.iter().map(|p| p.display().to_string()).collect();
                write!(f, "native ({})", files.join(", "))
            }
            Self::Legacy { dir } => write!(f, "legacy ({})", dir.display()),
        }
    }
}

/// Fully resolved remote session settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionConfig {
    pub host: String,
    pub remote_folder: String,
    pub exclude_local: Vec<String>,
    pub exclude_remote: Vec<String>,
    pub exclude_common: Vec<String>,
    /// Base arguments for the upload, before derived excludes.
    pub rsync_to_remote_base: Vec<String>,
    /// Base arguments for the download, before derived excludes.
    pub rsync_from_remote_base: Vec<String>,
    pub ssh_args: Vec<String>,
    pub fallback: bool,
    pub download_in_parallel: bool,
    /// Poll interval in milliseconds. Validated when the parallel download
    /// is actually set up.
    pub download_interval: i64,
    pub entrypoint: String,
    #[serde(serialize_with = "serialize_timeout")]
    pub execute_timeout: Option<Duration>,
}

fn serialize_timeout<S: Serializer>(
    timeout: &Option<Duration>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match timeout {
        Some(timeout) => {
            serializer.serialize_some(&humantime::format_duration(*timeout).to_string())
        }
        None => serializer.serialize_none(),
    }
}

impl SessionConfig {
    /// Defaults for everything but the host.
    pub fn with_host(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            remote_folder: DEFAULT_REMOTE_FOLDER.to_string(),
            exclude_local: default_exclude_local(),
            exclude_remote: default_exclude_remote(),
            exclude_common: default_exclude_common(),
            rsync_to_remote_base: default_rsync_args(),
            rsync_from_remote_base: default_rsync_args(),
            ssh_args: Vec::new(),
            fallback: false,
            download_in_parallel: false,
            download_interval: DEFAULT_DOWNLOAD_INTERVAL_MS,
            entrypoint: DEFAULT_ENTRYPOINT.to_string(),
            execute_timeout: None,
        }
    }

    /// Upload arguments: base args plus `--exclude=` for local and common
    /// patterns.
    pub fn rsync_to_remote_args(&self) -> Vec<String> {
        with_excludes(
            &self.rsync_to_remote_base,
            self.exclude_local.iter().chain(&self.exclude_common),
        )
    }

    /// Download arguments: base args plus `--exclude=` for remote and common
    /// patterns.
    pub fn rsync_from_remote_args(&self) -> Vec<String> {
        with_excludes(
            &self.rsync_from_remote_base,
            self.exclude_remote.iter().chain(&self.exclude_common),
        )
    }

    /// Validated speculative download poll interval.
    pub fn download_interval(&self) -> Result<Duration> {
        u64::try_from(self.download_interval)
            .ok()
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .ok_or(MirakleError::InvalidDownloadInterval)
    }
}

fn with_excludes<'a>(base: &[String], patterns: impl Iterator<Item = &'a String>) -> Vec<String> {
    let mut args = base.to_vec();
    for pattern in patterns {
        push_unique(&mut args, format!("--exclude={pattern}"));
    }
    args
}

/// A configuration together with the source it was read from.
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedConfig {
    pub source: ConfigSource,
    pub config: SessionConfig,
}

/// Resolves the session configuration for a project.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    project_root: PathBuf,
    user_config: Option<PathBuf>,
    explicit: Option<PathBuf>,
    read_env: bool,
}

impl ConfigLoader {
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self {
            project_root: project_root.into(),
            user_config: user_config_path(),
            explicit: None,
            read_env: true,
        }
    }

    /// Use `path` instead of `~/.config/mirakle/config.toml`; `None` skips the
    /// user layer.
    pub fn with_user_config(mut self, path: Option<PathBuf>) -> Self {
        self.user_config = path;
        self
    }

    /// Read `path` instead of the project's `mirakle.toml`.
    pub fn with_explicit_config(mut self, path: Option<PathBuf>) -> Self {
        self.explicit = path;
        self
    }

    /// Whether `MIRAKLE_*` environment overrides apply.
    pub fn with_env(mut self, read_env: bool) -> Self {
        self.read_env = read_env;
        self
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    /// Path of the project-level config file that would be read.
    pub fn project_config_path(&self) -> PathBuf {
        self.explicit
            .clone()
            .unwrap_or_else(|| self.project_root.join(PROJECT_CONFIG_FILE))
    }

    /// Resolve the effective configuration.
    ///
    /// A `.mainframer/` directory takes precedence over every native layer.
    pub fn resolve(&self) -> Result<ResolvedConfig> {
        if let Some(config) = legacy::load(&self.project_root)? {
            info!("Mainframer config is applied, Mirakle config is ignored.");
            return Ok(ResolvedConfig {
                source: ConfigSource::Legacy {
                    dir: self.project_root.join(legacy::LEGACY_DIR),
                },
                config,
            });
        }

        let mut merged = PartialConfig::default();
        let mut files = Vec::new();

        let layers = [self.user_config.clone(), Some(self.project_config_path())];
        for path in layers.into_iter().flatten() {
            if let Some(layer) = native::load_file(&path)? {
                debug!(path = %path.display(), "Loaded config layer");
                merged = merged.overlay(layer);
                files.push(path);
            }
        }

        let mut env_overrides = Vec::new();
        if self.read_env {
            let (layer, names) = native::from_env()?;
            merged = merged.overlay(layer);
            env_overrides = names;
        }

        let config = merged.into_session()?;
        Ok(ResolvedConfig {
            source: ConfigSource::Native {
                files,
                env_overrides,
            },
            config,
        })
    }
}

/// `~/.config/mirakle/config.toml` (platform config dir).
pub fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("mirakle").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_rsync_args_derive_excludes() {
        let config = SessionConfig::with_host("builder");
        assert_eq!(
            config.rsync_to_remote_args(),
            vec![
                "--archive",
                "--delete",
                "--exclude=**/build",
                "--exclude=.gradle",
                "--exclude=.idea",
                "--exclude=**/.git/",
                "--exclude=**/local.properties",
            ]
        );
        assert_eq!(
            config.rsync_from_remote_args(),
            vec![
                "--archive",
                "--delete",
                "--exclude=**/src/",
                "--exclude=.gradle",
                "--exclude=.idea",
                "--exclude=**/.git/",
                "--exclude=**/local.properties",
            ]
        );
    }

    #[test]
    fn test_duplicate_excludes_collapse() {
        let mut config = SessionConfig::with_host("builder");
        config.exclude_local.push(".idea".to_string());
        let args = config.rsync_to_remote_args();
        assert_eq!(args.iter().filter(|a| *a == "--exclude=.idea").count(), 1);
    }

    #[test]
    fn test_download_interval_validation() {
        let mut config = SessionConfig::with_host("builder");
        assert_eq!(config.download_interval().unwrap(), Duration::from_secs(2));

        config.download_interval = 0;
        assert!(matches!(
            config.download_interval(),
            Err(MirakleError::InvalidDownloadInterval)
        ));

        config.download_interval = -5;
        assert!(config.download_interval().is_err());
    }

    #[test]
    fn test_source_display() {
        let legacy = ConfigSource::Legacy {
            dir: PathBuf::from("/p/.mainframer"),
        };
        assert_eq!(legacy.to_string(), "legacy (/p/.mainframer)");
        let native = ConfigSource::Native {
            files: vec![],
            env_overrides: vec![],
        };
        assert_eq!(native.to_string(), "native (defaults)");
    }

    #[test]
    fn test_timeout_serializes_as_humantime() {
        let mut config = SessionConfig::with_host("builder");
        config.execute_timeout = Some(Duration::from_secs(45 * 60));
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["execute_timeout"], "45m");
    }
}
