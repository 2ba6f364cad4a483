//! Legacy `.mainframer/` configuration directory.
//!
//! Layout:
//! - `config`: properties file with `remote_machine`,
//!   `local_compression_level` and `remote_compression_level`
//! - `ignore`: rsync exclude file for both directions
//! - `localignore`: upload-only exclude file
//! - `remoteignore`: download-only exclude file

use super::{SessionConfig, default_rsync_args};
use crate::errors::{MirakleError, Result};
use crate::util::push_unique;
use std::collections::HashMap;
use std::path::Path;

pub const LEGACY_DIR: &str = ".mainframer";

/// Remote folder used by every legacy configuration.
pub const LEGACY_REMOTE_FOLDER: &str = "~/mainframer";

const DEFAULT_COMPRESSION_LEVEL: &str = "1";

/// Load `<project_root>/.mainframer`, or `None` when the directory is absent.
pub fn load(project_root: &Path) -> Result<Option<SessionConfig>> {
    let dir = project_root.join(LEGACY_DIR);
    if !dir.exists() {
        return Ok(None);
    }

    let config_path = dir.join("config");
    if !config_path.is_file() {
        return Err(MirakleError::LegacyConfigMissing { dir });
    }
    let contents =
        std::fs::read_to_string(&config_path).map_err(|source| MirakleError::ConfigRead {
            path: config_path.clone(),
            source,
        })?;
    let properties = parse_properties(&contents);

    let host = properties
        .get("remote_machine")
        .filter(|host| !host.is_empty())
        .cloned()
        .ok_or(MirakleError::HostNotDefined)?;

    let mut config = SessionConfig::with_host(host);
    config.remote_folder = LEGACY_REMOTE_FOLDER.to_string();
    config.exclude_local.clear();
    config.exclude_remote.clear();
    config.exclude_common.clear();

    let level = |key: &str| {
        properties
            .get(key)
            .map_or(DEFAULT_COMPRESSION_LEVEL, String::as_str)
            .to_string()
    };
    let mut to_remote = default_rsync_args();
    let mut from_remote = default_rsync_args();
    push_unique(
        &mut to_remote,
        format!("--compress-level={}", level("local_compression_level")),
    );
    push_unique(
        &mut from_remote,
        format!("--compress-level={}", level("remote_compression_level")),
    );

    let exclude_from = |name: &str| {
        let path = dir.join(name);
        path.is_file()
            .then(|| format!("--exclude-from={}", path.display()))
    };
    if let Some(arg) = exclude_from("ignore") {
        push_unique(&mut to_remote, arg.clone());
        push_unique(&mut from_remote, arg);
    }
    if let Some(arg) = exclude_from("localignore") {
        push_unique(&mut to_remote, arg);
    }
    if let Some(arg) = exclude_from("remoteignore") {
        push_unique(&mut from_remote, arg);
    }

    config.rsync_to_remote_base = to_remote;
    config.rsync_from_remote_base = from_remote;
    Ok(Some(config))
}

/// Parse `key=value` / `key: value` lines. `#` and `!` start comments.
fn parse_properties(contents: &str) -> HashMap<String, String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#') && !line.starts_with('!'))
        .filter_map(|line| {
            let split = line.find(['=', ':'])?;
            let key = line[..split].trim();
            let value = line[split + 1..].trim();
            (!key.is_empty()).then(|| (key.to_string(), value.to_string()))
        })
        .collect()
}
