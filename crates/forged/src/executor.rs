//! Parallel execution of coding-assistant sessions.
//!
//! Bounded-concurrency scheduler: at most `max_concurrent` assistant
//! processes run at once, overflow queues FIFO and drains as slots free.
//! Each execution streams progress records over a channel that closes
//! after the terminal `completed` or `failed` record; drained queue items
//! publish to the executor's broadcast stream instead.
//!
//! The active map and pending queue share one mutex, held only across
//! small critical sections and never across I/O.

use std::borrow::Cow;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use forge_core::completion::{parse_completion, CompletionReport, COMPLETION_TOKEN};
use forge_core::prompt::build_implementation_prompt;
use forge_core::types::now_rfc3339;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::worktree::{WorktreeError, WorktreeManager};

/// Default cap on concurrently running assistant processes.
pub const DEFAULT_MAX_CONCURRENT: usize = 5;

/// Per-execution state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    CreatingWorkspace,
    Running,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::CreatingWorkspace => "creating_workspace",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// One progress record: a state transition or a line of child output.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionProgress {
    pub feature_id: String,
    pub status: ExecutionStatus,
    pub message: String,
    pub output_chunk: Option<String>,
    pub timestamp: String,
}

impl ExecutionProgress {
    fn new(feature_id: &str, status: ExecutionStatus, message: impl Into<String>) -> Self {
        Self {
            feature_id: feature_id.to_string(),
            status,
            message: message.into(),
            output_chunk: None,
            timestamp: now_rfc3339(),
        }
    }
}

/// Final result of a feature execution.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub feature_id: String,
    pub success: bool,
    pub files_changed: Vec<String>,
    pub summary: String,
    pub error: Option<String>,
}

/// Everything needed to run one feature in one project.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub feature_id: String,
    pub spec: String,
    pub project_name: String,
    pub project_root: PathBuf,
    pub worktree_base: String,
    pub main_branch: String,
}

/// Executor configuration.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub max_concurrent: usize,
    /// Assistant binary and fixed flags, from project config.
    pub claude_command: String,
    pub claude_flags: Vec<String>,
    /// When set, spawns are wrapped in `ssh user@host 'cd … && …'`.
    pub ssh: Option<SshTarget>,
}

#[derive(Debug, Clone)]
pub struct SshTarget {
    pub user: String,
    pub host: String,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            claude_command: "claude".to_string(),
            claude_flags: vec!["--dangerously-skip-permissions".to_string()],
            ssh: None,
        }
    }
}

/// Snapshot of the executor's occupancy.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutorStatus {
    pub active_count: usize,
    pub max_concurrent: usize,
    pub queue_length: usize,
    pub active_features: Vec<String>,
}

struct ActiveExecution {
    cancel: CancellationToken,
}

struct ExecutorState {
    active: HashMap<String, ActiveExecution>,
    queue: VecDeque<ExecutionRequest>,
}

/// Bounded-concurrency scheduler for assistant executions.
pub struct ParallelExecutor {
    config: ExecutorConfig,
    state: Mutex<ExecutorState>,
    /// Every progress record is mirrored here; drained queue items have no
    /// per-call channel and are observable only through this stream.
    events: broadcast::Sender<ExecutionProgress>,
}

impl std::fmt::Debug for ParallelExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParallelExecutor")
            .field("max_concurrent", &self.config.max_concurrent)
            .finish_non_exhaustive()
    }
}

impl ParallelExecutor {
    pub fn new(config: ExecutorConfig) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            config,
            state: Mutex::new(ExecutorState {
                active: HashMap::new(),
                queue: VecDeque::new(),
            }),
            events,
        })
    }

    pub fn with_defaults() -> Arc<Self> {
        Self::new(ExecutorConfig::default())
    }

    /// Subscribe to the merged progress stream of all executions.
    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionProgress> {
        self.events.subscribe()
    }

    pub async fn status(&self) -> ExecutorStatus {
        let state = self.state.lock().await;
        ExecutorStatus {
            active_count: state.active.len(),
            max_concurrent: self.config.max_concurrent,
            queue_length: state.queue.len(),
            active_features: state.active.keys().cloned().collect(),
        }
    }

    /// Start (or enqueue) a feature execution.
    ///
    /// Returns a receiver of progress records. When no slot is available
    /// the request joins the FIFO queue and the receiver yields exactly
    /// one `pending` record before closing; the queued request runs later
    /// and reports through the broadcast stream.
    pub async fn execute_feature(
        self: &Arc<Self>,
        request: ExecutionRequest,
    ) -> mpsc::Receiver<ExecutionProgress> {
        let (tx, rx) = mpsc::channel(64);

        let cancel = {
            let mut state = self.state.lock().await;

            if state.active.contains_key(&request.feature_id) {
                let progress = ExecutionProgress::new(
                    &request.feature_id,
                    ExecutionStatus::Failed,
                    "Feature is already executing",
                );
                let _ = tx.try_send(progress);
                return rx;
            }

            if state.active.len() >= self.config.max_concurrent {
                state.queue.push_back(request.clone());
                let position = state.queue.len();
                drop(state);

                let progress = ExecutionProgress::new(
                    &request.feature_id,
                    ExecutionStatus::Pending,
                    format!("Queued (position {position})"),
                );
                let _ = self.events.send(progress.clone());
                let _ = tx.try_send(progress);
                return rx;
            }

            let cancel = CancellationToken::new();
            state.active.insert(
                request.feature_id.clone(),
                ActiveExecution {
                    cancel: cancel.clone(),
                },
            );
            cancel
        };

        let executor = Arc::clone(self);
        tokio::spawn(async move {
            executor.run_execution(request, Some(tx), cancel).await;
        });

        rx
    }

    /// Kill a running execution by feature id. Returns false when the
    /// feature is not active.
    pub async fn kill(&self, feature_id: &str) -> bool {
        let state = self.state.lock().await;
        match state.active.get(feature_id) {
            Some(active) => {
                active.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Remove a queued request before it starts. Returns false when the
    /// feature is not queued.
    pub async fn cancel_queued(&self, feature_id: &str) -> bool {
        let mut state = self.state.lock().await;
        let before = state.queue.len();
        state.queue.retain(|r| r.feature_id != feature_id);
        state.queue.len() != before
    }

    /// Drive one execution through its state machine, then release the
    /// slot and drain the queue.
    async fn run_execution(
        self: Arc<Self>,
        request: ExecutionRequest,
        tx: Option<mpsc::Sender<ExecutionProgress>>,
        cancel: CancellationToken,
    ) {
        let mut request = request;
        let mut tx = tx;
        let mut cancel = cancel;
        loop {
            let result = self.drive_child(&request, tx.as_ref(), &cancel).await;

            match &result {
                Ok(report) if report.success => {
                    self.emit(
                        tx.as_ref(),
                        ExecutionProgress::new(
                            &request.feature_id,
                            ExecutionStatus::Completed,
                            format!(
                                "Implementation complete, {} file(s) changed",
                                report.files_changed.len()
                            ),
                        ),
                    )
                    .await;
                }
                Ok(_) => {
                    self.emit(
                        tx.as_ref(),
                        ExecutionProgress::new(
                            &request.feature_id,
                            ExecutionStatus::Failed,
                            "Execution finished without a completion report",
                        ),
                    )
                    .await;
                }
                Err(message) => {
                    self.emit(
                        tx.as_ref(),
                        ExecutionProgress::new(
                            &request.feature_id,
                            ExecutionStatus::Failed,
                            message,
                        ),
                    )
                    .await;
                }
            }

            // Release the slot, then drain one queued request if present.
            let next = {
                let mut state = self.state.lock().await;
                state.active.remove(&request.feature_id);
                if state.active.len() < self.config.max_concurrent {
                    state.queue.pop_front().map(|next| {
                        let cancel = CancellationToken::new();
                        state.active.insert(
                            next.feature_id.clone(),
                            ActiveExecution {
                                cancel: cancel.clone(),
                            },
                        );
                        (next, cancel)
                    })
                } else {
                    None
                }
            };

            match next {
                Some((next, next_cancel)) => {
                    info!(feature_id = %next.feature_id, "draining queued execution");
                    request = next;
                    tx = None;
                    cancel = next_cancel;
                }
                None => break,
            }
        }
    }

    /// Create the workspace, spawn the assistant, and stream its output.
    async fn drive_child(
        &self,
        request: &ExecutionRequest,
        tx: Option<&mpsc::Sender<ExecutionProgress>>,
        cancel: &CancellationToken,
    ) -> Result<CompletionReport, String> {
        self.emit(
            tx,
            ExecutionProgress::new(
                &request.feature_id,
                ExecutionStatus::CreatingWorkspace,
                "Creating isolated workspace...",
            ),
        )
        .await;

        let manager = WorktreeManager::new(
            &request.project_root,
            &request.worktree_base,
            request.main_branch.clone(),
        );
        let worktree_path = match manager.create(&request.feature_id, &request.main_branch) {
            Ok(path) => path,
            // Re-running a feature reuses its existing workspace.
            Err(WorktreeError::AlreadyExists(path)) => path,
            Err(e) => return Err(format!("Failed to create workspace: {e}")),
        };

        let prompt = build_implementation_prompt(&request.project_name, &request.spec);
        let mut child = self
            .spawn_assistant(&worktree_path, &prompt)
            .map_err(|e| format!("Failed to spawn assistant: {e}"))?;

        self.emit(
            tx,
            ExecutionProgress::new(
                &request.feature_id,
                ExecutionStatus::Running,
                "Assistant is implementing the feature...",
            ),
        )
        .await;

        // Merge stdout and stderr into one line stream.
        let (line_tx, mut line_rx) = mpsc::channel::<String>(64);
        if let Some(stdout) = child.stdout.take() {
            let line_tx = line_tx.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if line_tx.send(line).await.is_err() {
                        break;
                    }
                }
            });
        }
        match child.stderr.take() {
            Some(stderr) => {
                tokio::spawn(async move {
                    let mut lines = BufReader::new(stderr).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        if line_tx.send(line).await.is_err() {
                            break;
                        }
                    }
                });
            }
            // All senders must drop for the stream to close.
            None => drop(line_tx),
        }

        // One progress record per line until the sentinel appears; after
        // that the stream keeps draining silently so the completion
        // report is parsed from full output and the child never blocks
        // on a full pipe.
        let mut output = String::new();
        let mut sentinel_seen = false;
        loop {
            tokio::select! {
                maybe_line = line_rx.recv() => {
                    let Some(line) = maybe_line else { break };
                    output.push_str(&line);
                    output.push('\n');

                    if !sentinel_seen {
                        let mut progress = ExecutionProgress::new(
                            &request.feature_id,
                            ExecutionStatus::Running,
                            "Implementing...",
                        );
                        progress.output_chunk = Some(line.clone());
                        self.emit(tx, progress).await;
                    }

                    if line.contains(COMPLETION_TOKEN) {
                        sentinel_seen = true;
                    }
                }
                () = cancel.cancelled() => {
                    warn!(feature_id = %request.feature_id, "execution killed");
                    let _ = child.kill().await;
                    return Err("Execution cancelled".to_string());
                }
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| format!("Failed to wait for assistant: {e}"))?;

        Ok(parse_completion(&output, status.success()))
    }

    /// Spawn the assistant process, locally or wrapped in ssh.
    fn spawn_assistant(
        &self,
        worktree_path: &std::path::Path,
        prompt: &str,
    ) -> std::io::Result<tokio::process::Child> {
        let mut cmd = match &self.config.ssh {
            Some(target) => {
                // Working directory is set by the remote shell; every
                // user-supplied token is quoted before concatenation.
                let quote = |s: &str| shell_escape::escape(Cow::Borrowed(s)).into_owned();
                let mut assistant = vec![quote(&self.config.claude_command)];
                assistant.extend(self.config.claude_flags.iter().map(|f| quote(f)));
                assistant.push("-p".to_string());
                assistant.push(quote(prompt));

                let script = format!(
                    "cd {} && {}",
                    quote(&worktree_path.to_string_lossy()),
                    assistant.join(" ")
                );
                let mut cmd = Command::new("ssh");
                cmd.arg(format!("{}@{}", target.user, target.host))
                    .arg(script);
                cmd
            }
            None => {
                let mut cmd = Command::new(&self.config.claude_command);
                cmd.args(&self.config.claude_flags)
                    .arg("-p")
                    .arg(prompt)
                    .current_dir(worktree_path);
                cmd
            }
        };

        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
    }

    async fn emit(
        &self,
        tx: Option<&mpsc::Sender<ExecutionProgress>>,
        progress: ExecutionProgress,
    ) {
        let _ = self.events.send(progress.clone());
        if let Some(tx) = tx {
            let _ = tx.send(progress).await;
        }
    }
}

/// Build an [`ExecutionResult`] from a terminal completion report.
pub fn result_from_report(feature_id: &str, report: &CompletionReport) -> ExecutionResult {
    ExecutionResult {
        feature_id: feature_id.to_string(),
        success: report.success,
        files_changed: report.files_changed.clone(),
        summary: report.summary.clone(),
        error: if report.success {
            None
        } else {
            Some("Execution failed or incomplete".to_string())
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::process::Command as StdCommand;
    use tempfile::TempDir;

    fn git(dir: &Path, args: &[&str]) {
        let output = StdCommand::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .unwrap();
        assert!(output.status.success(), "git {args:?} failed");
    }

    fn setup_repo() -> TempDir {
        let dir = TempDir::new().unwrap();
        git(dir.path(), &["init", "-b", "main"]);
        git(dir.path(), &["config", "user.email", "test@test.com"]);
        git(dir.path(), &["config", "user.name", "Test"]);
        std::fs::write(dir.path().join("README.md"), "# Test").unwrap();
        git(dir.path(), &["add", "."]);
        git(dir.path(), &["commit", "-m", "Initial commit"]);
        dir
    }

    /// Executor whose "assistant" is `sh -c <script>`; the trailing
    /// `-p <prompt>` arguments land in `$0`/`$1` and are ignored.
    fn sh_executor(max_concurrent: usize, script: &str) -> Arc<ParallelExecutor> {
        ParallelExecutor::new(ExecutorConfig {
            max_concurrent,
            claude_command: "sh".to_string(),
            claude_flags: vec!["-c".to_string(), script.to_string()],
            ssh: None,
        })
    }

    fn request(dir: &TempDir, feature_id: &str) -> ExecutionRequest {
        ExecutionRequest {
            feature_id: feature_id.to_string(),
            spec: "FEATURE: test".to_string(),
            project_name: "TestProject".to_string(),
            project_root: dir.path().to_path_buf(),
            worktree_base: ".flowforge-worktrees".to_string(),
            main_branch: "main".to_string(),
        }
    }

    async fn collect(mut rx: mpsc::Receiver<ExecutionProgress>) -> Vec<ExecutionProgress> {
        let mut records = Vec::new();
        while let Some(p) = rx.recv().await {
            records.push(p);
        }
        records
    }

    #[tokio::test]
    async fn successful_execution_emits_state_transitions() {
        let dir = setup_repo();
        let executor = sh_executor(
            2,
            "printf 'working\\nIMPLEMENTATION_COMPLETE\\nFiles changed:\\n- src/a.rs\\n'",
        );

        let rx = executor.execute_feature(request(&dir, "dark-mode")).await;
        let records = collect(rx).await;

        let statuses: Vec<ExecutionStatus> = records.iter().map(|r| r.status).collect();
        assert_eq!(statuses.first(), Some(&ExecutionStatus::CreatingWorkspace));
        assert!(statuses.contains(&ExecutionStatus::Running));
        assert_eq!(statuses.last(), Some(&ExecutionStatus::Completed));

        // One record per output line, with the chunk attached.
        let chunks: Vec<&str> = records
            .iter()
            .filter_map(|r| r.output_chunk.as_deref())
            .collect();
        assert!(chunks.contains(&"working"));

        // Workspace was created.
        assert!(dir
            .path()
            .join(".flowforge-worktrees/dark-mode/README.md")
            .exists());
    }

    #[tokio::test]
    async fn missing_sentinel_fails() {
        let dir = setup_repo();
        let executor = sh_executor(2, "echo done without marker");

        let records = collect(executor.execute_feature(request(&dir, "no-marker")).await).await;
        assert_eq!(
            records.last().map(|r| r.status),
            Some(ExecutionStatus::Failed)
        );
    }

    #[tokio::test]
    async fn nonzero_exit_fails_even_with_sentinel() {
        let dir = setup_repo();
        let executor = sh_executor(2, "echo IMPLEMENTATION_COMPLETE; exit 3");

        let records = collect(executor.execute_feature(request(&dir, "bad-exit")).await).await;
        assert_eq!(
            records.last().map(|r| r.status),
            Some(ExecutionStatus::Failed)
        );
    }

    #[tokio::test]
    async fn overflow_is_queued_with_single_pending_record() {
        let dir = setup_repo();
        let executor = sh_executor(1, "sleep 0.4; echo IMPLEMENTATION_COMPLETE");

        let first = executor.execute_feature(request(&dir, "first")).await;
        // Give the first execution time to claim its slot.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let second = collect(executor.execute_feature(request(&dir, "second")).await).await;
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].status, ExecutionStatus::Pending);
        assert!(second[0].message.contains("position 1"));

        let status = executor.status().await;
        assert_eq!(status.active_count, 1);
        assert_eq!(status.queue_length, 1);

        drop(first);
    }

    #[tokio::test]
    async fn queued_request_drains_when_slot_frees() {
        let dir = setup_repo();
        let executor = sh_executor(1, "sleep 0.2; echo IMPLEMENTATION_COMPLETE");
        let mut events = executor.subscribe();

        let first = executor.execute_feature(request(&dir, "first")).await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let _second = collect(executor.execute_feature(request(&dir, "second")).await).await;

        // Wait for both to finish via the broadcast stream.
        let mut completed = Vec::new();
        while completed.len() < 2 {
            let progress = tokio::time::timeout(std::time::Duration::from_secs(10), events.recv())
                .await
                .expect("timed out waiting for executions")
                .expect("broadcast closed");
            if progress.status == ExecutionStatus::Completed {
                completed.push(progress.feature_id);
            }
        }
        assert!(completed.contains(&"first".to_string()));
        assert!(completed.contains(&"second".to_string()));

        let status = executor.status().await;
        assert_eq!(status.active_count, 0);
        assert_eq!(status.queue_length, 0);

        drop(first);
    }

    #[tokio::test]
    async fn kill_terminates_running_child() {
        let dir = setup_repo();
        let executor = sh_executor(1, "sleep 30; echo IMPLEMENTATION_COMPLETE");

        let rx = executor.execute_feature(request(&dir, "long-runner")).await;
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        assert!(executor.kill("long-runner").await);
        let records = collect(rx).await;
        assert_eq!(
            records.last().map(|r| r.status),
            Some(ExecutionStatus::Failed)
        );
        assert!(records.last().unwrap().message.contains("cancelled"));

        // Slot was released.
        assert_eq!(executor.status().await.active_count, 0);
    }

    #[tokio::test]
    async fn kill_unknown_feature_returns_false() {
        let executor = sh_executor(1, "true");
        assert!(!executor.kill("ghost").await);
    }

    #[tokio::test]
    async fn cancel_queued_removes_request() {
        let dir = setup_repo();
        let executor = sh_executor(1, "sleep 0.5; echo IMPLEMENTATION_COMPLETE");

        let first = executor.execute_feature(request(&dir, "first")).await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let _ = collect(executor.execute_feature(request(&dir, "second")).await).await;

        assert!(executor.cancel_queued("second").await);
        assert!(!executor.cancel_queued("second").await);
        assert_eq!(executor.status().await.queue_length, 0);

        drop(first);
    }

    #[tokio::test]
    async fn duplicate_execution_is_rejected() {
        let dir = setup_repo();
        let executor = sh_executor(2, "sleep 0.3; echo IMPLEMENTATION_COMPLETE");

        let first = executor.execute_feature(request(&dir, "dupe")).await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let records = collect(executor.execute_feature(request(&dir, "dupe")).await).await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, ExecutionStatus::Failed);
        assert!(records[0].message.contains("already executing"));

        drop(first);
    }

    #[test]
    fn result_from_report_maps_fields() {
        let report = CompletionReport {
            success: true,
            token_found: true,
            files_changed: vec!["a.rs".to_string()],
            summary: "Did the thing".to_string(),
        };
        let result = result_from_report("x", &report);
        assert!(result.success);
        assert_eq!(result.files_changed, vec!["a.rs"]);
        assert!(result.error.is_none());
    }
}
