use mirakle_common::runner::{MockRunner, OutputSinks, SinkFactory};
use mirakle_common::{ConfigLoader, Orchestrator};
use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use tempfile::TempDir;

/// A project directory named `app` inside a temp dir.
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
        Self { dir, root }
    }

    /// Project with a `mirakle.toml` holding `config`.
    pub fn with_config(config: &str) -> Self {
        let project = Self::new();
        project.write("mirakle.toml", config);
        project
    }

    pub fn write(&self, relative: &str, contents: &str) -> PathBuf {
        let path = self.root.join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("Failed to create parent dir");
        }
        fs::write(&path, contents).expect("Failed to write fixture file");
        path
    }

    /// Loader isolated from the user config and the environment.
    pub fn loader(&self) -> ConfigLoader {
        ConfigLoader::new(&self.root)
            .with_user_config(None)
            .with_env(false)
    }

    pub fn orchestrator(&self, runner: &MockRunner) -> Orchestrator<MockRunner> {
        Orchestrator::new(Arc::new(runner.clone()), self.loader()).with_sinks(quiet_sinks())
    }

    /// Remote source argument of the final download.
    pub fn download_source(&self, host: &str, remote_folder: &str) -> String {
        format!("{host}:{remote_folder}/app/")
    }
}

pub fn quiet_sinks() -> SinkFactory {
    Arc::new(|| OutputSinks::new(io::sink(), io::sink()))
}

/// Cloneable in-memory writer.
#[derive(Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap_or_else(PoisonError::into_inner)).into_owned()
    }

    /// Sink factory writing stdout and stderr into this buffer.
    pub fn sinks(&self) -> SinkFactory {
        let buffer = self.clone();
        Arc::new(move || OutputSinks::new(buffer.clone(), buffer.clone()))
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
