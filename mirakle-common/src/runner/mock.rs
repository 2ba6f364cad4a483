//! Scripted process runner for tests.
//!
//! Responses are chosen by the first [`MockRule`] that matches a command;
//! unmatched commands exit 0 with no output. Every call is recorded together
//! with its start and finish order so tests can assert sequencing.

use super::{OutputSinks, ProcessExit, ProcessRunner};
use crate::command::CommandSpec;
use std::io::{self, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Upper bound on how long a blocked response waits for its condition.
const BLOCK_LIMIT: Duration = Duration::from_secs(10);
const POLL: Duration = Duration::from_millis(5);

/// Selects commands by program and, optionally, an exact argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockRule {
    program: String,
    arg: Option<String>,
}

impl MockRule {
    pub fn program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            arg: None,
        }
    }

    /// Also require `arg` to be one of the command's arguments.
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.arg = Some(arg.into());
        self
    }

    pub fn matches(&self, cmd: &CommandSpec) -> bool {
        let program_matches = cmd.program == self.program
            || std::path::Path::new(&cmd.program)
                .file_name()
                .is_some_and(|name| name.to_string_lossy() == self.program);
        program_matches
            && self
                .arg
                .as_ref()
                .is_none_or(|arg| cmd.args.iter().any(|a| a == arg))
    }
}

/// What a matched command does.
#[derive(Debug, Clone, Default)]
pub struct MockResponse {
    exit_code: i32,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    delay: Duration,
    spawn_error: bool,
    block_until: Option<(MockRule, usize)>,
}

impl MockResponse {
    pub fn exit(code: i32) -> Self {
        Self {
            exit_code: code,
            ..Default::default()
        }
    }

    /// Fail as if the program could not be started.
    pub fn spawn_error() -> Self {
        Self {
            spawn_error: true,
            ..Default::default()
        }
    }

    pub fn stdout(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.stdout = bytes.into();
        self
    }

    pub fn stderr(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.stderr = bytes.into();
        self
    }

    /// Take `delay` before exiting.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Do not exit until `count` calls matching `rule` have been started.
    pub fn block_until(mut self, rule: MockRule, count: usize) -> Self {
        self.block_until = Some((rule, count));
        self
    }
}

/// A recorded invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCall {
    pub command: CommandSpec,
    pub timeout: Option<Duration>,
    /// Position in the global start/finish sequence when the call started.
    pub started: usize,
    /// Position when it finished; `None` while still running.
    pub finished: Option<usize>,
}

#[derive(Debug, Default)]
struct MockState {
    rules: Mutex<Vec<(MockRule, MockResponse)>>,
    calls: Mutex<Vec<MockCall>>,
    sequence: AtomicUsize,
}

/// Deterministic [`ProcessRunner`] that records every call.
#[derive(Debug, Clone, Default)]
pub struct MockRunner {
    state: Arc<MockState>,
}

impl MockRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the response for commands matching `rule`. Earlier rules win.
    pub fn on(&self, rule: MockRule, response: MockResponse) -> &Self {
        self.state
            .rules
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((rule, response));
        self
    }

    /// Snapshot of all calls received so far, in start order.
    #[must_use]
    pub fn calls(&self) -> Vec<MockCall> {
        self.state
            .calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Calls matching `rule`.
    #[must_use]
    pub fn calls_matching(&self, rule: &MockRule) -> Vec<MockCall> {
        self.calls()
            .into_iter()
            .filter(|call| rule.matches(&call.command))
            .collect()
    }

    fn response_for(&self, cmd: &CommandSpec) -> MockResponse {
        self.state
            .rules
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|(rule, _)| rule.matches(cmd))
            .map(|(_, response)| response.clone())
            .unwrap_or_default()
    }

    fn record_start(&self, cmd: &CommandSpec, timeout: Option<Duration>) -> usize {
        let mut calls = self
            .state
            .calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        calls.push(MockCall {
            command: cmd.clone(),
            timeout,
            started: self.state.sequence.fetch_add(1, Ordering::SeqCst),
            finished: None,
        });
        calls.len() - 1
    }

    fn record_finish(&self, index: usize) {
        let mut calls = self
            .state
            .calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(call) = calls.get_mut(index) {
            call.finished = Some(self.state.sequence.fetch_add(1, Ordering::SeqCst));
        }
    }

    async fn wait_for(&self, rule: &MockRule, count: usize) {
        let deadline = tokio::time::Instant::now() + BLOCK_LIMIT;
        while self.calls_matching(rule).len() < count {
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(POLL).await;
        }
    }
}

impl ProcessRunner for MockRunner {
    async fn run(
        &self,
        cmd: &CommandSpec,
        mut sinks: OutputSinks,
        timeout: Option<Duration>,
    ) -> io::Result<ProcessExit> {
        let response = self.response_for(cmd);
        let index = self.record_start(cmd, timeout);

        if response.spawn_error {
            self.record_finish(index);
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("mock: cannot start {}", cmd.program),
            ));
        }

        sinks.stdout.write_all(&response.stdout)?;
        sinks.stderr.write_all(&response.stderr)?;

        let work = async {
            if let Some((rule, count)) = &response.block_until {
                self.wait_for(rule, *count).await;
            }
            tokio::time::sleep(response.delay).await;
        };
        let exit = match timeout {
            Some(limit) => match tokio::time::timeout(limit, work).await {
                Ok(()) => ProcessExit::Code(response.exit_code),
                Err(_) => ProcessExit::TimedOut,
            },
            None => {
                work.await;
                ProcessExit::Code(response.exit_code)
            }
        };

        sinks.stdout.flush()?;
        sinks.stderr.flush()?;
        drop(sinks);
        self.record_finish(index);
        Ok(exit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unscripted_commands_succeed() {
        let runner = MockRunner::new();
        let exit = runner
            .run(
                &CommandSpec::new("rsync"),
                OutputSinks::new(io::sink(), io::sink()),
                None,
            )
            .await
            .unwrap();
        assert_eq!(exit, ProcessExit::Code(0));
        let calls = runner.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].started, 0);
        assert_eq!(calls[0].finished, Some(1));
    }

    #[tokio::test]
    async fn test_first_matching_rule_wins() {
        let runner = MockRunner::new();
        runner
            .on(MockRule::program("ssh").with_arg("box"), MockResponse::exit(4))
            .on(MockRule::program("ssh"), MockResponse::exit(9));
        let cmd = CommandSpec::new("ssh").arg("box");
        let exit = runner
            .run(&cmd, OutputSinks::new(io::sink(), io::sink()), None)
            .await
            .unwrap();
        assert_eq!(exit, ProcessExit::Code(4));
    }

    #[tokio::test]
    async fn test_rule_matches_program_file_name() {
        let rule = MockRule::program("gradlew");
        assert!(rule.matches(&CommandSpec::new("/p/app/gradlew")));
        assert!(!rule.matches(&CommandSpec::new("/p/app/gradlew.bat")));
    }

    #[tokio::test]
    async fn test_timeout_applies_to_delay() {
        let runner = MockRunner::new();
        runner.on(
            MockRule::program("ssh"),
            MockResponse::exit(0).delay(Duration::from_secs(5)),
        );
        let exit = runner
            .run(
                &CommandSpec::new("ssh"),
                OutputSinks::new(io::sink(), io::sink()),
                Some(Duration::from_millis(20)),
            )
            .await
            .unwrap();
        assert_eq!(exit, ProcessExit::TimedOut);
    }

    #[tokio::test]
    async fn test_spawn_error() {
        let runner = MockRunner::new();
        runner.on(MockRule::program("rsync"), MockResponse::spawn_error());
        let result = runner
            .run(
                &CommandSpec::new("rsync"),
                OutputSinks::new(io::sink(), io::sink()),
                None,
            )
            .await;
        assert!(result.is_err());
    }
}
