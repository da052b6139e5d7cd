//! Subprocess runner that streams merged stdout/stderr lines over a channel.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::engine::pool::BufferPool;
use crate::{BackhaulError, Result};

/// Lines buffered between the reader and the consumer
pub const LINE_CHANNEL_CAPACITY: usize = 50;

/// What to run
#[derive(Debug, Clone, Default)]
pub struct CommandOptions {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Added on top of the current process environment
    pub envs: HashMap<String, String>,
}

impl CommandOptions {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>, envs: HashMap<String, String>) -> Self {
        Self {
            program: program.into(),
            args,
            envs,
        }
    }

    /// Program and arguments joined for diagnostics. Never includes the environment.
    pub fn command_line(&self) -> String {
        let mut line = self.program.display().to_string();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// How a finished command ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The process exited successfully
    Exited,
    /// The cancellation scope fired and the process was killed
    Cancelled,
}

/// A command bound to a cancellation scope, ready to start
pub struct Command {
    options: CommandOptions,
    cancel: CancellationToken,
    pool: Arc<BufferPool>,
}

impl Command {
    /// The command's scope is a child of `parent`: cancelling either stops it
    pub fn new(options: CommandOptions, parent: &CancellationToken) -> Self {
        Self {
            options,
            cancel: parent.child_token(),
            pool: BufferPool::shared(),
        }
    }

    pub fn with_buffer_pool(mut self, pool: Arc<BufferPool>) -> Self {
        self.pool = pool;
        self
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Launch the process and start streaming its output.
    ///
    /// The environment is copied at this point; later changes to the caller's
    /// credential state do not reach a running process.
    pub fn start(self) -> Result<RunningCommand> {
        let command_line = self.options.command_line();
        info!(command = %command_line, "Running engine command");

        // One pipe behind both stdout and stderr keeps the engine's output in
        // the order it was written.
        let (reader, writer) = std::io::pipe()
            .map_err(|e| BackhaulError::process(&command_line, format!("failed to create pipe: {e}")))?;
        let stderr_writer = writer
            .try_clone()
            .map_err(|e| BackhaulError::process(&command_line, format!("failed to create pipe: {e}")))?;

        let mut cmd = tokio::process::Command::new(&self.options.program);
        cmd.args(&self.options.args)
            .envs(&self.options.envs)
            .stdin(Stdio::null())
            .stdout(writer)
            .stderr(stderr_writer)
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| BackhaulError::process(&command_line, format!("failed to start: {e}")))?;
        // Our copies of the write end must go, or the reader never sees EOF.
        drop(cmd);

        let output = merged_output(reader)
            .map_err(|e| BackhaulError::process(&command_line, format!("failed to read output: {e}")))?;
        let (tx, rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);
        let reader = tokio::spawn(forward_lines(
            output,
            tx,
            self.cancel.clone(),
            Arc::clone(&self.pool),
        ));

        let cancel = self.cancel.clone();
        let task = tokio::spawn(async move {
            let status = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                status = child.wait() => Some(status),
            };
            let status = match status {
                Some(status) => status,
                None => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    reader.abort();
                    return Ok(Completion::Cancelled);
                }
            };
            let _ = reader.await;
            status.map(Completion::Exited)
        });

        Ok(RunningCommand {
            lines: rx,
            cancel: self.cancel,
            command_line,
            pool: self.pool,
            task,
        })
    }
}

enum Completion {
    Exited(ExitStatus),
    Cancelled,
}

/// A started command: a finite, non-restartable stream of output lines
pub struct RunningCommand {
    lines: mpsc::Receiver<Vec<u8>>,
    cancel: CancellationToken,
    command_line: String,
    pool: Arc<BufferPool>,
    task: JoinHandle<std::io::Result<Completion>>,
}

impl RunningCommand {
    /// Next output line without its terminator; `None` once the output closed
    /// or the scope was cancelled.
    pub async fn next_line(&mut self) -> Option<Vec<u8>> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            line = self.lines.recv() => line,
        }
    }

    /// Hand a consumed line back to the buffer pool
    pub fn recycle(&self, line: Vec<u8>) {
        self.pool.release(line);
    }

    /// Cancel the command's scope, which stops reading and kills the process
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn command_line(&self) -> &str {
        &self.command_line
    }

    /// Wait for the process to finish. Remaining output is discarded.
    pub async fn wait(self) -> Result<RunOutcome> {
        let RunningCommand {
            lines,
            command_line,
            task,
            ..
        } = self;
        drop(lines);

        let completion = task
            .await
            .map_err(|e| BackhaulError::process(&command_line, format!("runner task failed: {e}")))?
            .map_err(|e| BackhaulError::process(&command_line, format!("wait failed: {e}")))?;

        match completion {
            Completion::Cancelled => {
                debug!(command = %command_line, "Engine command cancelled");
                Ok(RunOutcome::Cancelled)
            }
            Completion::Exited(status) if status.success() => Ok(RunOutcome::Exited),
            Completion::Exited(status) => Err(BackhaulError::process(
                &command_line,
                format!("exited with {status}"),
            )),
        }
    }
}

#[cfg(unix)]
fn merged_output(reader: std::io::PipeReader) -> std::io::Result<tokio::net::unix::pipe::Receiver> {
    tokio::net::unix::pipe::Receiver::from_owned_fd(std::os::fd::OwnedFd::from(reader))
}

#[cfg(not(unix))]
fn merged_output(reader: std::io::PipeReader) -> std::io::Result<tokio::fs::File> {
    let handle = std::os::windows::io::OwnedHandle::from(reader);
    Ok(tokio::fs::File::from_std(std::fs::File::from(handle)))
}

async fn forward_lines<R>(
    reader: R,
    tx: mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
    pool: Arc<BufferPool>,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    // Once the consumer hangs up we keep draining so the process never
    // blocks on a full pipe.
    let mut forwarding = true;

    loop {
        let mut line = pool.acquire();
        let read = tokio::select! {
            read = reader.read_until(b'\n', &mut line) => read,
            _ = cancel.cancelled() => return,
        };
        match read {
            Ok(0) | Err(_) => {
                pool.release(line);
                return;
            }
            Ok(_) => {}
        }

        while matches!(line.last(), Some(b'\n' | b'\r')) {
            line.pop();
        }

        if !forwarding {
            pool.release(line);
            continue;
        }

        tokio::select! {
            sent = tx.send(line) => {
                if let Err(mpsc::error::SendError(line)) = sent {
                    pool.release(line);
                    forwarding = false;
                }
            }
            _ = cancel.cancelled() => return,
        }
    }
}

/// Locate an executable on `PATH`
pub fn find_executable(name: &str) -> Result<PathBuf> {
    let candidate = Path::new(name);
    if candidate.components().count() > 1 {
        return if is_executable(candidate) {
            Ok(candidate.to_path_buf())
        } else {
            Err(BackhaulError::validation(format!(
                "engine binary not found: {name}"
            )))
        };
    }

    std::env::var_os("PATH")
        .and_then(|paths| {
            std::env::split_paths(&paths)
                .map(|dir| dir.join(name))
                .find(|path| is_executable(path))
        })
        .ok_or_else(|| {
            BackhaulError::validation(format!("engine binary '{name}' not found on PATH"))
        })
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
