//! Process Orchestrator: runs the AI tool against a target's working copy.
//!
//! # Overview
//!
//! Each target moves through `Idle -> Running -> Idle`. A run:
//!
//! 1. Composes the prompt from the target's conversation history
//! 2. Appends the user turn (before the tool starts)
//! 3. Spawns the tool in the target's directory with the composed prompt on
//!    stdin and forwards every stdout/stderr chunk, in arrival order,
//!    finishing with [`ToolOutput::Exit`]
//! 4. Appends the assistant turn only if the tool exited 0 with output on
//!    either stream
//!
//! # Concurrency
//!
//! State is kept per target in a record created on first reference. A second
//! `execute` on a running target is rejected with [`OrchestratorError::Busy`];
//! different targets run concurrently. [`Orchestrator::cancel`] only touches
//! the process of the named target.
//!
//! # Example
//!
//! ```ignore
//! let orchestrator = Orchestrator::new(ToolConfig::default(), workspace);
//! let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
//! let result = orchestrator.execute(&target, "add a README", tx).await?;
//! ```

pub mod history;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, LazyLock, Mutex, MutexGuard};
use std::time::Duration;

use regex::RegexSet;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::logging::{log_line, open_log_file, transcript_id};
use crate::shell::{build_tool_command, ShellMode};
use crate::spawn::{SpawnConfig, ToolProcess};
use crate::target::{Target, Workspace};

pub use crate::spawn::{ToolExit, ToolOutput};
pub use history::{compose_prompt, Role, Turn};

/// Informational lines the tool prints that are not worth echoing to the log.
static NOISE: LazyLock<RegexSet> = LazyLock::new(|| {
    RegexSet::new([
        r"^\s*$",
        r"no stdin data received",
        r"ExperimentalWarning",
        r"^\(node:\d+\)",
        r"Use `node --trace-warnings",
    ])
    .unwrap()
});

// ============================================================================
// CONFIGURATION
// ============================================================================

/// How the AI tool is invoked.
#[derive(Debug, Clone)]
pub struct ToolConfig {
    /// Binary name or path
    pub binary_path: String,
    /// Arguments passed to the tool
    pub args: Vec<String>,
    /// Flag telling the tool to read its prompt from stdin, appended after `args`
    pub prompt_flag: Option<String>,
    pub shell: ShellMode,
    /// Directory for per-target transcript files
    pub log_dir: Option<PathBuf>,
    /// Time between SIGTERM and SIGKILL on cancel
    pub cancel_grace: Duration,
    /// Upper bound for the `--version` check
    pub version_timeout: Duration,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            binary_path: "claude".to_string(),
            args: vec!["--permission-mode".to_string(), "acceptEdits".to_string()],
            prompt_flag: Some("-p".to_string()),
            shell: ShellMode::default(),
            log_dir: None,
            cancel_grace: Duration::from_secs(3),
            version_timeout: Duration::from_secs(2),
        }
    }
}

impl ToolConfig {
    pub fn binary_path(mut self, binary_path: impl Into<String>) -> Self {
        self.binary_path = binary_path.into();
        self
    }

    pub fn args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn prompt_flag(mut self, flag: Option<&str>) -> Self {
        self.prompt_flag = flag.map(str::to_string);
        self
    }

    pub fn shell(mut self, shell: ShellMode) -> Self {
        self.shell = shell;
        self
    }

    pub fn log_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.log_dir = dir;
        self
    }

    pub fn cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    /// The prompt itself goes to stdin; argv is bounded by the OS.
    fn command_args(&self) -> Vec<String> {
        let mut args = self.args.clone();
        args.extend(self.prompt_flag.clone());
        args
    }
}

// ============================================================================
// RESULT AND ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("A command is already running for {0}")]
    Busy(String),

    #[error("Repository {0} has not been cloned")]
    NotCloned(String),

    #[error("Failed to start {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Tool process error: {0}")]
    Io(#[from] std::io::Error),
}

/// Outcome of a tool run that started.
///
/// A non-zero exit is reported here as data, not as an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteResult {
    pub success: bool,
    /// Everything the tool wrote to stdout
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub exit_code: i32,
    pub cancelled: bool,
}

// ============================================================================
// PER-TARGET STATE
// ============================================================================

#[derive(Default)]
struct TargetSlot {
    history: Mutex<Vec<Turn>>,
    run: Mutex<RunState>,
}

#[derive(Default)]
struct RunState {
    running: bool,
    cancel: Option<oneshot::Sender<()>>,
}

impl TargetSlot {
    /// Mark the target as running, or `None` if it already is.
    fn begin(self: &Arc<Self>, cancel: oneshot::Sender<()>) -> Option<RunGuard> {
        let mut run = lock(&self.run);
        if run.running {
            return None;
        }
        run.running = true;
        run.cancel = Some(cancel);
        Some(RunGuard(Arc::clone(self)))
    }
}

/// Returns the target to idle when the run ends, however it ends.
struct RunGuard(Arc<TargetSlot>);

impl Drop for RunGuard {
    fn drop(&mut self) {
        let mut run = lock(&self.0.run);
        run.running = false;
        run.cancel = None;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

// ============================================================================
// ORCHESTRATOR
// ============================================================================

/// Runs the AI tool per target and keeps each target's conversation.
pub struct Orchestrator {
    config: ToolConfig,
    workspace: Workspace,
    targets: Mutex<HashMap<Target, Arc<TargetSlot>>>,
}

impl Orchestrator {
    pub fn new(config: ToolConfig, workspace: Workspace) -> Self {
        Self {
            config,
            workspace,
            targets: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ToolConfig {
        &self.config
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    fn slot(&self, target: &Target) -> Arc<TargetSlot> {
        let mut targets = lock(&self.targets);
        Arc::clone(targets.entry(target.clone()).or_default())
    }

    /// Run the tool for `target` with `prompt`.
    ///
    /// Output chunks are sent to `output` as they arrive; the last event is
    /// always [`ToolOutput::Exit`]. A dropped receiver does not stop the run.
    pub async fn execute(
        &self,
        target: &Target,
        prompt: &str,
        output: mpsc::UnboundedSender<ToolOutput>,
    ) -> Result<ExecuteResult, OrchestratorError> {
        let dir = self.workspace.resolve(target);
        if !dir.is_dir() {
            return Err(OrchestratorError::NotCloned(target.id()));
        }

        let slot = self.slot(target);
        let (cancel_tx, mut cancel_rx) = oneshot::channel();
        let _running = slot
            .begin(cancel_tx)
            .ok_or_else(|| OrchestratorError::Busy(target.id()))?;

        let full_prompt = {
            let mut history = lock(&slot.history);
            let composed = compose_prompt(&history, prompt);
            history.push(Turn::user(prompt));
            composed
        };

        let log = open_log_file(self.config.log_dir.as_deref(), &transcript_id(target));
        log_line(&log, "PROMPT", prompt);

        let spawn_config = SpawnConfig::new(self.config.binary_path.clone(), self.config.command_args())
            .working_dir(&dir)
            .shell(self.config.shell.clone())
            .stdin(full_prompt);

        let mut process = ToolProcess::spawn(spawn_config).map_err(|source| {
            log_line(&log, "SPAWN_ERROR", &source.to_string());
            log::error!("Failed to start {} for {}: {}", self.config.binary_path, target, source);
            OrchestratorError::Spawn {
                binary: self.config.binary_path.clone(),
                source,
            }
        })?;
        log::info!("Running {} for {} (pid {:?})", self.config.binary_path, target, process.pid());

        let mut stdout = String::new();
        let mut stderr = String::new();
        // Both streams in arrival order
        let mut combined = String::new();
        let mut cancel_armed = true;
        let mut cancelled = false;

        loop {
            tokio::select! {
                event = process.next_output() => match event {
                    Some(ToolOutput::Stdout(text)) => {
                        echo(target, "stdout", &text);
                        log_line(&log, "STDOUT", &text);
                        stdout.push_str(&text);
                        combined.push_str(&text);
                        let _ = output.send(ToolOutput::Stdout(text));
                    }
                    Some(ToolOutput::Stderr(text)) => {
                        echo(target, "stderr", &text);
                        log_line(&log, "STDERR", &text);
                        stderr.push_str(&text);
                        combined.push_str(&text);
                        let _ = output.send(ToolOutput::Stderr(text));
                    }
                    Some(ToolOutput::Exit(_)) => {}
                    None => break,
                },
                signal = &mut cancel_rx, if cancel_armed => {
                    cancel_armed = false;
                    if signal.is_ok() {
                        cancelled = true;
                        log::info!("Cancelling tool run for {}", target);
                        log_line(&log, "CANCEL", "requested");
                        process.terminate(self.config.cancel_grace).await?;
                    }
                }
            }
        }

        // Streams are closed; a cancel from here on has nothing to stop.
        lock(&slot.run).cancel = None;
        drop(cancel_rx);

        let exit = process.wait().await?;
        log_line(&log, "EXIT", &exit.code.to_string());
        log::info!("Tool for {} exited with code {} (signal {:?})", target, exit.code, exit.signal);

        let success = exit.success() && !cancelled;
        let _ = output.send(ToolOutput::Exit(exit.clone()));

        let reply = combined.trim();
        if success && !reply.is_empty() {
            lock(&slot.history).push(Turn::assistant(reply));
        }

        let error = if !stderr.trim().is_empty() {
            Some(stderr)
        } else if cancelled {
            Some("Cancelled".to_string())
        } else {
            None
        };

        Ok(ExecuteResult {
            success,
            output: stdout,
            error: error.filter(|_| !success),
            exit_code: exit.code,
            cancelled,
        })
    }

    /// Stop the running tool for `target`.
    ///
    /// Returns `true` if a running process was signalled, `false` when the
    /// target is idle, a cancel is already in progress, or the tool has
    /// closed its output and is only being reaped.
    pub fn cancel(&self, target: &Target) -> bool {
        let Some(slot) = lock(&self.targets).get(target).cloned() else {
            return false;
        };
        let sender = {
            let mut run = lock(&slot.run);
            if !run.running {
                return false;
            }
            run.cancel.take()
        };
        sender.is_some_and(|tx| tx.send(()).is_ok())
    }

    /// Whether `<tool> --version` succeeds within `version_timeout`.
    pub async fn is_available(&self) -> bool {
        let Ok(cmd) = build_tool_command(
            &self.config.binary_path,
            &["--version".to_string()],
            None,
            &self.config.shell,
        ) else {
            return false;
        };

        let mut cmd = tokio::process::Command::from(cmd);
        cmd.stdin(std::process::Stdio::null()).kill_on_drop(true);

        match tokio::time::timeout(self.config.version_timeout, cmd.output()).await {
            Ok(Ok(output)) => output.status.success(),
            Ok(Err(e)) => {
                log::debug!("{} --version failed: {}", self.config.binary_path, e);
                false
            }
            Err(_) => {
                log::debug!("{} --version timed out", self.config.binary_path);
                false
            }
        }
    }

    /// Snapshot of a target's conversation.
    pub fn history(&self, target: &Target) -> Vec<Turn> {
        lock(&self.targets)
            .get(target)
            .map(|slot| lock(&slot.history).clone())
            .unwrap_or_default()
    }

    pub fn clear_history(&self, target: &Target) {
        if let Some(slot) = lock(&self.targets).get(target) {
            lock(&slot.history).clear();
        }
    }

    pub fn is_running(&self, target: &Target) -> bool {
        lock(&self.targets)
            .get(target)
            .is_some_and(|slot| lock(&slot.run).running)
    }

    /// Targets with a tool run in progress, sorted.
    pub fn running_targets(&self) -> Vec<Target> {
        let mut running: Vec<Target> = lock(&self.targets)
            .iter()
            .filter(|(_, slot)| lock(&slot.run).running)
            .map(|(target, _)| target.clone())
            .collect();
        running.sort();
        running
    }
}

/// Echo tool output to the operator log, skipping noise lines.
fn echo(target: &Target, stream: &str, text: &str) {
    if !log::log_enabled!(log::Level::Debug) {
        return;
    }
    for line in text.lines().filter(|line| !NOISE.is_match(line)) {
        log::debug!("[{}] {}: {}", target, stream, line);
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Orchestrator whose "tool" is `sh -c <script>`; the prompt arrives on stdin.
    fn fixture(script: &str) -> (TempDir, Orchestrator, Target) {
        let root = tempfile::tempdir().unwrap();
        let target = Target::new("acme", "widgets").unwrap();
        let workspace = Workspace::new(root.path());
        std::fs::create_dir_all(workspace.resolve(&target)).unwrap();

        let config = ToolConfig::default()
            .binary_path("sh")
            .args(vec!["-c".to_string(), script.to_string()])
            .prompt_flag(None)
            .shell(ShellMode::Direct);
        (root, Orchestrator::new(config, workspace), target)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ToolOutput>) -> Vec<ToolOutput> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    async fn wait_until_running(orchestrator: &Orchestrator, target: &Target) {
        for _ in 0..250 {
            if orchestrator.is_running(target) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("tool never started");
    }

    #[test]
    fn command_args_end_with_prompt_flag() {
        let config = ToolConfig::default();
        assert_eq!(
            config.command_args(),
            ["--permission-mode", "acceptEdits", "-p"]
        );

        let bare = config.prompt_flag(None).args(Vec::new());
        assert!(bare.command_args().is_empty());
    }

    #[test]
    fn noise_lines_are_recognised() {
        assert!(NOISE.is_match("   "));
        assert!(NOISE.is_match("Warning: no stdin data received in 3s"));
        assert!(!NOISE.is_match("Created README.md"));
    }

    #[tokio::test]
    async fn successful_run_records_both_turns() {
        let (_root, orchestrator, target) = fixture("cat > last_prompt.txt; printf 'OK\\n'");
        let (tx, mut rx) = mpsc::unbounded_channel();

        let result = orchestrator.execute(&target, "add README", tx.clone()).await.unwrap();
        assert!(result.success);
        assert_eq!(result.output, "OK\n");
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.error, None);
        assert!(!result.cancelled);
        assert_eq!(
            orchestrator.history(&target),
            vec![Turn::user("add README"), Turn::assistant("OK")]
        );

        let events = drain(&mut rx);
        assert_eq!(events.first(), Some(&ToolOutput::Stdout("OK\n".to_string())));
        assert!(matches!(events.last(), Some(ToolOutput::Exit(exit)) if exit.code == 0));

        // Second run carries the first exchange as context
        orchestrator.execute(&target, "add LICENSE", tx).await.unwrap();
        let dir = orchestrator.workspace().resolve(&target);
        let prompt = std::fs::read_to_string(dir.join("last_prompt.txt")).unwrap();
        assert!(prompt.starts_with("Previous messages in this conversation:"));
        assert!(prompt.contains("User: add README"));
        assert!(prompt.contains("Assistant: OK"));
        assert!(prompt.ends_with("Current request:\nadd LICENSE"));
        assert_eq!(orchestrator.history(&target).len(), 4);
    }

    #[tokio::test]
    async fn failed_run_keeps_only_user_turn() {
        let (_root, orchestrator, target) = fixture("printf partial; printf bad >&2; exit 3");
        let (tx, mut rx) = mpsc::unbounded_channel();

        let result = orchestrator.execute(&target, "break it", tx).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.exit_code, 3);
        assert_eq!(result.output, "partial");
        assert_eq!(result.error.as_deref(), Some("bad"));
        assert_eq!(orchestrator.history(&target), vec![Turn::user("break it")]);

        let events = drain(&mut rx);
        assert!(events.contains(&ToolOutput::Stderr("bad".to_string())));
        assert!(matches!(events.last(), Some(ToolOutput::Exit(exit)) if exit.code == 3));
    }

    #[tokio::test]
    async fn stderr_only_reply_becomes_assistant_turn() {
        let (_root, orchestrator, target) = fixture("printf 'Created README.md' >&2; exit 0");
        let (tx, _rx) = mpsc::unbounded_channel();

        let result = orchestrator.execute(&target, "add README", tx).await.unwrap();
        assert!(result.success);
        assert_eq!(result.output, "");
        assert_eq!(result.error, None);
        assert_eq!(
            orchestrator.history(&target),
            vec![Turn::user("add README"), Turn::assistant("Created README.md")]
        );
    }

    #[tokio::test]
    async fn history_larger_than_argv_limit_still_runs() {
        // 140 KB reply; replayed context then exceeds the 128 KiB argv string limit
        let (_root, orchestrator, target) =
            fixture("cat > last_prompt.txt; head -c 140000 /dev/zero | tr '\\0' a");
        let (tx, _rx) = mpsc::unbounded_channel();

        for prompt in ["first", "second", "third"] {
            let result = orchestrator.execute(&target, prompt, tx.clone()).await.unwrap();
            assert!(result.success, "{prompt}: {:?}", result.error);
        }

        let dir = orchestrator.workspace().resolve(&target);
        let prompt = std::fs::read_to_string(dir.join("last_prompt.txt")).unwrap();
        assert!(prompt.len() > 280_000);
        assert!(prompt.ends_with("Current request:\nthird"));
        assert_eq!(orchestrator.history(&target).len(), 6);
    }

    #[tokio::test]
    async fn empty_output_adds_no_assistant_turn() {
        let (_root, orchestrator, target) = fixture("exit 0");
        let (tx, _rx) = mpsc::unbounded_channel();

        let result = orchestrator.execute(&target, "noop", tx).await.unwrap();
        assert!(result.success);
        assert_eq!(orchestrator.history(&target), vec![Turn::user("noop")]);
    }

    #[tokio::test]
    async fn uncloned_target_is_rejected_before_history() {
        let (_root, orchestrator, _) = fixture("exit 0");
        let missing = Target::new("acme", "missing").unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();

        let err = orchestrator.execute(&missing, "hi", tx).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::NotCloned(_)));
        assert!(orchestrator.history(&missing).is_empty());
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let (_root, orchestrator, target) = fixture("exit 0");
        let orchestrator = Orchestrator::new(
            orchestrator.config().clone().binary_path("/definitely/not/a/tool"),
            orchestrator.workspace().clone(),
        );
        let (tx, _rx) = mpsc::unbounded_channel();

        let err = orchestrator.execute(&target, "hi", tx).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Spawn { .. }));
        assert!(!orchestrator.is_running(&target));
    }

    #[tokio::test]
    async fn concurrent_execute_is_rejected_and_cancel_stops_run() {
        let (_root, orchestrator, target) = fixture("sleep 30");
        let orchestrator = Arc::new(orchestrator);

        let first = {
            let orchestrator = Arc::clone(&orchestrator);
            let target = target.clone();
            tokio::spawn(async move {
                let (tx, _rx) = mpsc::unbounded_channel();
                orchestrator.execute(&target, "long task", tx).await
            })
        };
        wait_until_running(&orchestrator, &target).await;
        assert_eq!(orchestrator.running_targets(), vec![target.clone()]);

        let (tx, _rx) = mpsc::unbounded_channel();
        let busy = orchestrator.execute(&target, "second", tx).await.unwrap_err();
        assert!(matches!(busy, OrchestratorError::Busy(_)));

        assert!(orchestrator.cancel(&target));
        let result = first.await.unwrap().unwrap();
        assert!(!result.success);
        assert!(result.cancelled);
        assert!(result.error.is_some());

        assert!(!orchestrator.is_running(&target));
        assert_eq!(orchestrator.history(&target), vec![Turn::user("long task")]);
    }

    #[tokio::test]
    async fn cancel_after_streams_close_reports_nothing_to_stop() {
        let (_root, orchestrator, target) = fixture("exec >/dev/null 2>&1; sleep 1");
        let orchestrator = Arc::new(orchestrator);

        let run = {
            let orchestrator = Arc::clone(&orchestrator);
            let target = target.clone();
            tokio::spawn(async move {
                let (tx, _rx) = mpsc::unbounded_channel();
                orchestrator.execute(&target, "quiet", tx).await
            })
        };
        wait_until_running(&orchestrator, &target).await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(orchestrator.is_running(&target));
        assert!(!orchestrator.cancel(&target));

        let result = run.await.unwrap().unwrap();
        assert!(result.success);
        assert!(!result.cancelled);
    }

    #[tokio::test]
    async fn cancel_on_idle_target_returns_false() {
        let (_root, orchestrator, target) = fixture("exit 0");
        assert!(!orchestrator.cancel(&target));
        assert!(!orchestrator.cancel(&target));

        let (tx, _rx) = mpsc::unbounded_channel();
        orchestrator.execute(&target, "hi", tx).await.unwrap();
        assert!(!orchestrator.cancel(&target));
    }

    #[tokio::test]
    async fn transcript_is_written_when_log_dir_set() {
        let (root, orchestrator, target) = fixture("printf OK");
        let log_dir = root.path().join("logs");
        let orchestrator = Orchestrator::new(
            orchestrator.config().clone().log_dir(Some(log_dir.clone())),
            orchestrator.workspace().clone(),
        );
        let (tx, _rx) = mpsc::unbounded_channel();
        orchestrator.execute(&target, "hi", tx).await.unwrap();

        let transcript = std::fs::read_to_string(log_dir.join("acme__widgets.log")).unwrap();
        assert!(transcript.contains("PROMPT: hi"));
        assert!(transcript.contains("STDOUT: OK"));
        assert!(transcript.contains("EXIT: 0"));
    }

    #[tokio::test]
    async fn clear_history_forgets_turns() {
        let (_root, orchestrator, target) = fixture("printf OK");
        let (tx, _rx) = mpsc::unbounded_channel();
        orchestrator.execute(&target, "hi", tx).await.unwrap();
        assert_eq!(orchestrator.history(&target).len(), 2);

        orchestrator.clear_history(&target);
        assert!(orchestrator.history(&target).is_empty());
    }

    #[tokio::test]
    async fn availability_follows_version_check() {
        let (_root, orchestrator, _) = fixture("exit 0");
        let git = Orchestrator::new(
            orchestrator.config().clone().binary_path("git"),
            orchestrator.workspace().clone(),
        );
        assert!(git.is_available().await);

        let missing = Orchestrator::new(
            orchestrator.config().clone().binary_path("/definitely/not/a/tool"),
            orchestrator.workspace().clone(),
        );
        assert!(!missing.is_available().await);
    }
}
