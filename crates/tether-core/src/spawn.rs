//! Tool process spawning and output streaming.
//!
//! This module provides the process plumbing for the AI tool:
//! - Spawning the tool (directly or in a login shell) in its own process group
//! - Feeding an optional input text on stdin
//! - Streaming stdout/stderr as raw text chunks, in arrival order
//! - Terminating with SIGTERM and escalating to SIGKILL after a grace period
//!
//! Output is delivered over a channel so the orchestrator can forward it
//! without buffering delay.

use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

use crate::shell::{build_tool_command, ShellMode};

const READ_CHUNK: usize = 8 * 1024;

/// Exit status of a tool process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolExit {
    /// Exit code, or -1 when the process was killed by a signal
    pub code: i32,
    pub signal: Option<i32>,
}

impl ToolExit {
    pub fn success(&self) -> bool {
        self.code == 0 && self.signal.is_none()
    }
}

impl From<ExitStatus> for ToolExit {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code().unwrap_or(-1),
            signal,
        }
    }
}

/// Events emitted by a tool process.
///
/// `Exit` is always the last event of a run.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutput {
    /// A chunk read from stdout
    Stdout(String),
    /// A chunk read from stderr
    Stderr(String),
    /// The process exited
    Exit(ToolExit),
}

/// Configuration for spawning a tool process.
#[derive(Debug, Clone)]
pub struct SpawnConfig {
    pub binary_path: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub shell: ShellMode,
    /// Written to stdin, which is then closed; `None` attaches `/dev/null`
    pub stdin: Option<String>,
}

impl SpawnConfig {
    pub fn new(binary_path: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            binary_path: binary_path.into(),
            args,
            working_dir: None,
            shell: ShellMode::Direct,
            stdin: None,
        }
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn shell(mut self, shell: ShellMode) -> Self {
        self.shell = shell;
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }
}

/// A running tool process.
pub struct ToolProcess {
    child: Child,
    pid: Option<u32>,
    output: mpsc::UnboundedReceiver<ToolOutput>,
}

impl ToolProcess {
    /// Spawn the process and start streaming its output.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(config: SpawnConfig) -> io::Result<Self> {
        #[allow(unused_mut)]
        let mut std_cmd = build_tool_command(
            &config.binary_path,
            &config.args,
            config.working_dir.as_deref(),
            &config.shell,
        )
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        // Own process group, so cancellation reaches grandchildren spawned by a shell.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            std_cmd.process_group(0);
        }

        let mut cmd = Command::from(std_cmd);
        let stdin = if config.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        };
        cmd.stdin(stdin)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("Failed to capture stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| io::Error::other("Failed to capture stderr"))?;

        if let Some(input) = config.stdin {
            let mut pipe = child
                .stdin
                .take()
                .ok_or_else(|| io::Error::other("Failed to capture stdin"))?;
            tokio::spawn(async move {
                // A tool that exits without reading its input breaks the pipe.
                if let Err(e) = pipe.write_all(input.as_bytes()).await {
                    log::debug!("Tool stdin closed early: {}", e);
                }
            });
        }

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(pump(stdout, tx.clone(), ToolOutput::Stdout));
        tokio::spawn(pump(stderr, tx, ToolOutput::Stderr));

        Ok(Self {
            pid: child.id(),
            child,
            output: rx,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Next stdout/stderr chunk, or `None` once both streams are closed.
    pub async fn next_output(&mut self) -> Option<ToolOutput> {
        self.output.recv().await
    }

    /// Wait for the process to exit.
    pub async fn wait(&mut self) -> io::Result<ToolExit> {
        Ok(self.child.wait().await?.into())
    }

    /// Send SIGTERM to the process group; SIGKILL it if still alive after `grace`.
    pub async fn terminate(&mut self, grace: Duration) -> io::Result<ToolExit> {
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            signal_group(pid, libc::SIGTERM);
            match tokio::time::timeout(grace, self.child.wait()).await {
                Ok(status) => return Ok(status?.into()),
                Err(_) => {
                    log::warn!("Tool process {} ignored SIGTERM, killing", pid);
                    signal_group(pid, libc::SIGKILL);
                }
            }
        }

        #[cfg(not(unix))]
        let _ = grace;

        // Already-exited children report an error here, which is fine.
        let _ = self.child.start_kill();
        self.wait().await
    }
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: i32) {
    let Ok(pid) = i32::try_from(pid) else {
        return;
    };
    // SAFETY: kill(2) has no memory-safety preconditions; a negative pid
    // addresses the process group created in `spawn`.
    unsafe {
        libc::kill(-pid, signal);
    }
}

async fn pump<R>(
    mut reader: R,
    tx: mpsc::UnboundedSender<ToolOutput>,
    wrap: fn(String) -> ToolOutput,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK];
    let mut pending = Vec::new();
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                pending.extend_from_slice(&buf[..n]);
                let text = take_utf8(&mut pending);
                if !text.is_empty() && tx.send(wrap(text)).is_err() {
                    return;
                }
            }
        }
    }
    if !pending.is_empty() {
        let _ = tx.send(wrap(String::from_utf8_lossy(&pending).into_owned()));
    }
}

/// Drain the decodable prefix of `pending`.
///
/// An incomplete multi-byte sequence at the end stays buffered for the next
/// read; invalid bytes are replaced.
pub(crate) fn take_utf8(pending: &mut Vec<u8>) -> String {
    match std::str::from_utf8(pending) {
        Ok(text) => {
            let text = text.to_string();
            pending.clear();
            text
        }
        Err(e) if e.error_len().is_none() => {
            let tail = pending.split_off(e.valid_up_to());
            let text = String::from_utf8_lossy(pending).into_owned();
            *pending = tail;
            text
        }
        Err(_) => {
            let text = String::from_utf8_lossy(pending).into_owned();
            pending.clear();
            text
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
