use super::{OutputSinks, ProcessExit, ProcessRunner};
use crate::command::CommandSpec;
use std::io::{self, Write};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, warn};

const PUMP_BUFFER: usize = 8 * 1024;

/// Runs commands as real child processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl ProcessRunner for SystemRunner {
    async fn run(
        &self,
        cmd: &CommandSpec,
        sinks: OutputSinks,
        timeout: Option<Duration>,
    ) -> io::Result<ProcessExit> {
        let mut command = Command::new(&cmd.program);
        command
            .args(&cmd.args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &cmd.current_dir {
            command.current_dir(dir);
        }

        debug!(command = %cmd, "Spawning process");
        let mut child = command.spawn()?;

        let stdout_pump = tokio::spawn(pump(child.stdout.take(), sinks.stdout));
        let stderr_pump = tokio::spawn(pump(child.stderr.take(), sinks.stderr));

        let exit = match timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                Ok(status) => ProcessExit::Code(exit_code(status?)),
                Err(_) => {
                    warn!(program = %cmd.program, ?limit, "Process exceeded its timeout, killing it");
                    child.kill().await?;
                    ProcessExit::TimedOut
                }
            },
            None => ProcessExit::Code(exit_code(child.wait().await?)),
        };

        for pump in [stdout_pump, stderr_pump] {
            pump.await.map_err(io::Error::other)??;
        }
        Ok(exit)
    }
}

/// Copy a child stream into a sink chunk by chunk.
async fn pump<R>(reader: Option<R>, mut sink: Box<dyn Write + Send>) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return Ok(());
    };
    let mut buf = vec![0u8; PUMP_BUFFER];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        sink.write_all(&buf[..n])?;
        sink.flush()?;
    }
    Ok(())
}

#[cfg(unix)]
fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(1)
}

#[cfg(not(unix))]
fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(1)
}
