//! Native TOML configuration layers.

use super::{EnvParser, SessionConfig};
use crate::errors::{MirakleError, Result};
use serde::Deserialize;
use std::path::Path;

/// Project-level configuration file. Never uploaded to the remote.
pub const PROJECT_CONFIG_FILE: &str = "mirakle.toml";

/// One configuration layer. Unset fields fall through to the layer below.
///
/// ```toml
/// host = "builder@build-box"
/// remote_folder = "mirakle"
/// ssh_args = ["-p", "2222"]
/// fallback = true
/// download_in_parallel = true
/// download_interval = 3000
/// execute_timeout = "45m"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PartialConfig {
    pub host: Option<String>,
    pub remote_folder: Option<String>,
    pub exclude_local: Option<Vec<String>>,
    pub exclude_remote: Option<Vec<String>>,
    pub exclude_common: Option<Vec<String>>,
    pub rsync_to_remote_args: Option<Vec<String>>,
    pub rsync_from_remote_args: Option<Vec<String>>,
    pub ssh_args: Option<Vec<String>>,
    pub fallback: Option<bool>,
    pub download_in_parallel: Option<bool>,
    pub download_interval: Option<i64>,
    pub entrypoint: Option<String>,
    pub execute_timeout: Option<String>,
}

impl PartialConfig {
    /// Apply `upper` on top of `self`.
    pub fn overlay(self, upper: PartialConfig) -> PartialConfig {
        PartialConfig {
            host: upper.host.or(self.host),
            remote_folder: upper.remote_folder.or(self.remote_folder),
            exclude_local: upper.exclude_local.or(self.exclude_local),
            exclude_remote: upper.exclude_remote.or(self.exclude_remote),
            exclude_common: upper.exclude_common.or(self.exclude_common),
            rsync_to_remote_args: upper.rsync_to_remote_args.or(self.rsync_to_remote_args),
            rsync_from_remote_args: upper.rsync_from_remote_args.or(self.rsync_from_remote_args),
            ssh_args: upper.ssh_args.or(self.ssh_args),
            fallback: upper.fallback.or(self.fallback),
            download_in_parallel: upper.download_in_parallel.or(self.download_in_parallel),
            download_interval: upper.download_interval.or(self.download_interval),
            entrypoint: upper.entrypoint.or(self.entrypoint),
            execute_timeout: upper.execute_timeout.or(self.execute_timeout),
        }
    }

    /// Fill defaults and validate. Fails when no layer set a host.
    pub fn into_session(self) -> Result<SessionConfig> {
        let host = self
            .host
            .filter(|host| !host.trim().is_empty())
            .ok_or(MirakleError::HostNotDefined)?;

        let execute_timeout = self
            .execute_timeout
            .map(|value| {
                humantime::parse_duration(&value)
                    .map_err(|source| MirakleError::InvalidTimeout { value, source })
            })
            .transpose()?;

        let mut config = SessionConfig::with_host(host);
        if let Some(remote_folder) = self.remote_folder {
            config.remote_folder = remote_folder;
        }
        if let Some(patterns) = self.exclude_local {
            config.exclude_local = patterns;
        }
        if let Some(patterns) = self.exclude_remote {
            config.exclude_remote = patterns;
        }
        if let Some(patterns) = self.exclude_common {
            config.exclude_common = patterns;
        }
        if let Some(args) = self.rsync_to_remote_args {
            config.rsync_to_remote_base = args;
        }
        if let Some(args) = self.rsync_from_remote_args {
            config.rsync_from_remote_base = args;
        }
        if let Some(args) = self.ssh_args {
            config.ssh_args = args;
        }
        if let Some(entrypoint) = self.entrypoint {
            config.entrypoint = entrypoint;
        }
        config.fallback = self.fallback.unwrap_or(config.fallback);
        config.download_in_parallel = self
            .download_in_parallel
            .unwrap_or(config.download_in_parallel);
        config.download_interval = self.download_interval.unwrap_or(config.download_interval);
        config.execute_timeout = execute_timeout;
        Ok(config)
    }
}

/// Read one TOML layer. A missing file is not an error.
pub fn load_file(path: &Path) -> Result<Option<PartialConfig>> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(MirakleError::ConfigRead {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    toml::from_str(&contents)
        .map(Some)
        .map_err(|source| MirakleError::ConfigParse {
            path: path.to_path_buf(),
            source,
        })
}

/// Read the `MIRAKLE_*` overrides. Returns the layer and the names of the
/// variables that were applied.
pub fn from_env() -> Result<(PartialConfig, Vec<String>)> {
    let mut parser = EnvParser::new();
    let layer = PartialConfig {
        host: parser.get_optional_string("HOST"),
        remote_folder: parser.get_optional_string("REMOTE_FOLDER"),
        fallback: parser.get_optional_bool("FALLBACK"),
        download_in_parallel: parser.get_optional_bool("DOWNLOAD_IN_PARALLEL"),
        download_interval: parser
            .get_optional_u64_range("DOWNLOAD_INTERVAL", 0, i64::MAX as u64)
            .and_then(|ms| i64::try_from(ms).ok()),
        ..Default::default()
    };
    if parser.has_errors() {
        return Err(MirakleError::Env(parser.take_errors()));
    }

    let mut applied = Vec::new();
    let flags = [
        ("MIRAKLE_HOST", layer.host.is_some()),
        ("MIRAKLE_REMOTE_FOLDER", layer.remote_folder.is_some()),
        ("MIRAKLE_FALLBACK", layer.fallback.is_some()),
        ("MIRAKLE_DOWNLOAD_IN_PARALLEL", layer.download_in_parallel.is_some()),
        ("MIRAKLE_DOWNLOAD_INTERVAL", layer.download_interval.is_some()),
    ];
    for (name, set) in flags {
        if set {
            applied.push(name.to_string());
        }
    }
    Ok((layer, applied))
}
