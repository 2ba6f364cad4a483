//! Command lines for the remote build phases.
//!
//! Upload and download shell out to `rsync` over `ssh`; execution is a
//! plain `ssh` invocation of the project's build entrypoint in the remote
//! copy. Local commands (fallback, passthrough) run the entrypoint from the
//! project root.

use crate::config::{PROJECT_CONFIG_FILE, SessionConfig};
use crate::invocation::{BUILD_ON_REMOTE, FALLBACK};
use crate::util::fix_dir_for_rsync;
use serde::Serialize;
use std::borrow::Cow;
use std::path::{Path, PathBuf};

/// A program with its ordered arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_dir: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            current_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Copy-pasteable rendering for logs and `plan` output.
    pub fn display(&self) -> String {
        std::iter::once(&self.program)
            .chain(&self.args)
            .map(|token| shell_escape::escape(Cow::Borrowed(token.as_str())).into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl std::fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.display())
    }
}

/// The local project and its remote counterpart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectLayout {
    pub root: PathBuf,
    pub name: String,
}

impl ProjectLayout {
    /// The project name is the root directory's name.
    pub fn from_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let name = root
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self { root, name }
    }

    /// `<remoteFolder>/<projectName>`.
    pub fn remote_dir(&self, config: &SessionConfig) -> String {
        format!("{}/{}", config.remote_folder, self.name)
    }

    fn rsync_root(&self) -> String {
        fix_dir_for_rsync(&self.root.display().to_string())
    }
}

/// Escape a token for the remote shell, leaving a leading `~/` unquoted so
/// the remote shell still expands it.
pub fn escape_remote(token: &str) -> String {
    match token.strip_prefix("~/") {
        Some(rest) if !rest.is_empty() => {
            format!("~/{}", shell_escape::unix::escape(Cow::Borrowed(rest)))
        }
        _ => shell_escape::unix::escape(Cow::Borrowed(token)).into_owned(),
    }
}

fn rsh(config: &SessionConfig) -> String {
    std::iter::once("ssh")
        .chain(config.ssh_args.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(" ")
}

/// `rsync <to-remote-args> --rsh "ssh <sshArgs>" --exclude=mirakle.toml
/// <projectRoot> <host>:<remoteFolder>`
pub fn upload(config: &SessionConfig, layout: &ProjectLayout) -> CommandSpec {
    CommandSpec::new("rsync")
        .args(config.rsync_to_remote_args())
        .arg("--rsh")
        .arg(rsh(config))
        .arg(format!("--exclude={PROJECT_CONFIG_FILE}"))
        .arg(layout.rsync_root())
        .arg(format!("{}:{}", config.host, config.remote_folder))
}

/// `ssh <sshArgs> <host> <remoteDir>/<entrypoint> -Pmirakle.build.on.remote=true
/// -p <remoteDir> <args...>`, remote tokens escaped for the remote shell.
pub fn execute(config: &SessionConfig, layout: &ProjectLayout, args: &[String]) -> CommandSpec {
    let remote_dir = layout.remote_dir(config);
    CommandSpec::new("ssh")
        .args(config.ssh_args.iter().cloned())
        .arg(config.host.clone())
        .arg(escape_remote(&format!("{remote_dir}/{}", config.entrypoint)))
        .arg(escape_remote(&format!("-P{BUILD_ON_REMOTE}=true")))
        .arg("-p")
        .arg(escape_remote(&remote_dir))
        .args(args.iter().map(|arg| escape_remote(arg)))
}

/// `rsync <from-remote-args> --rsh "ssh <sshArgs>" --exclude=mirakle.toml
/// <host>:<remoteDir>/ <projectRoot>/`
pub fn download(config: &SessionConfig, layout: &ProjectLayout) -> CommandSpec {
    CommandSpec::new("rsync")
        .args(config.rsync_from_remote_args())
        .arg("--rsh")
        .arg(rsh(config))
        .arg(format!("--exclude={PROJECT_CONFIG_FILE}"))
        .arg(format!("{}:{}/", config.host, layout.remote_dir(config)))
        .arg(format!("{}/", layout.rsync_root()))
}

/// Local re-run of the original invocation, marked so it is not offloaded
/// again.
pub fn fallback(config: &SessionConfig, layout: &ProjectLayout, args: &[String]) -> CommandSpec {
    local_build(&layout.root, &config.entrypoint, args).arg(format!("-P{FALLBACK}=true"))
}

/// Unmodified local build.
pub fn passthrough(root: &Path, entrypoint: &str, args: &[String]) -> CommandSpec {
    local_build(root, entrypoint, args)
}

fn local_build(root: &Path, entrypoint: &str, args: &[String]) -> CommandSpec {
    CommandSpec::new(root.join(entrypoint).display().to_string())
        .args(args.iter().cloned())
        .current_dir(root)
}
