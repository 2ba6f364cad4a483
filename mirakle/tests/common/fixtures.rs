use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

/// A project directory named `app` plus an isolated config home.
pub struct TestProject {
    pub dir: TempDir,
    pub root: PathBuf,
}

impl TestProject {
    pub fn new() -> Self {
        crate::test_log!("FIXTURE: Creating test project");

        let dir = TempDir::new().expect("Failed to create temp dir");
        let root = dir.path().join("app");
        fs::create_dir_all(&root).expect("Failed to create project root");
        fs::create_dir_all(dir.path().join("config-home")).expect("Failed to create config home");
        Self { dir, root }
    }

    pub fn with_config(config: &str) -> Self {
        let project = Self::new();
        fs::write(project.root.join("mirakle.toml"), config).expect("Failed to write mirakle.toml");
        project
    }

    /// Write an executable build entrypoint that exits with `code`.
    #[cfg(unix)]
    pub fn with_entrypoint(&self, code: i32) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = self.root.join("gradlew");
        fs::write(&path, format!("#!/bin/sh\necho \"local $@\"\nexit {code}\n"))
            .expect("Failed to write entrypoint");
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755))
            .expect("Failed to make entrypoint executable");
        path
    }

    /// `mirakle` with the project as root and no ambient configuration.
    pub fn mirakle(&self) -> Command {
        let mut command = Command::new(env!("CARGO_BIN_EXE_mirakle"));
        command
            .arg("--project-dir")
            .arg(&self.root)
            .env("XDG_CONFIG_HOME", self.dir.path().join("config-home"))
            .env("HOME", self.dir.path())
            .env_remove("MIRAKLE_LOG")
            .env_remove("MIRAKLE_CONFIG");
        for var in [
            "MIRAKLE_HOST",
            "MIRAKLE_REMOTE_FOLDER",
            "MIRAKLE_FALLBACK",
            "MIRAKLE_DOWNLOAD_IN_PARALLEL",
            "MIRAKLE_DOWNLOAD_INTERVAL",
        ] {
            command.env_remove(var);
        }
        command
    }

    pub fn path(&self) -> &Path {
        &self.root
    }
}

pub fn run(command: &mut Command) -> Output {
    command.output().expect("Failed to run mirakle")
}
