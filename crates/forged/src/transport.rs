//! Remote execution over SSH.
//!
//! A stateless wrapper around the `ssh` client. Git repositories live on
//! the workstation; the daemon may run elsewhere and reaches them through
//! this transport. All user-supplied strings pass through shell quoting
//! before they are concatenated into a remote command line; binary or
//! multi-line payloads are base64-encoded first so they only traverse the
//! quoting layer once.
//!
//! Failures never surface as errors here: timeouts and spawn failures
//! come back as a result with `return_code = -1` and a descriptive
//! stderr. Retry policy belongs to the sync engine, not the transport.

use std::borrow::Cow;
use std::path::PathBuf;
use std::time::Duration;

use base64::Engine;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

/// Default per-call timeout.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(120);
/// SSH connection timeout passed as `-o ConnectTimeout`.
const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Result of a remote command execution.
#[derive(Debug, Clone)]
pub struct RemoteResult {
    pub return_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl RemoteResult {
    pub fn success(&self) -> bool {
        self.return_code == 0
    }

    fn failure(stderr: impl Into<String>) -> Self {
        Self {
            return_code: -1,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

/// Kind of filesystem entry for remote existence tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteFileKind {
    File,
    Directory,
}

/// A project directory discovered on the workstation.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RemoteProject {
    pub name: String,
    pub path: String,
}

/// Executes commands on the workstation via SSH.
#[derive(Debug, Clone)]
pub struct SshTransport {
    host: String,
    user: String,
    ssh_key: Option<PathBuf>,
    /// Client binary; swapped for a stub in tests.
    ssh_program: String,
}

fn quote(arg: &str) -> String {
    shell_escape::escape(Cow::Borrowed(arg)).into_owned()
}

impl SshTransport {
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            user: user.into(),
            ssh_key: None,
            ssh_program: "ssh".to_string(),
        }
    }

    pub fn with_key(mut self, key: PathBuf) -> Self {
        self.ssh_key = Some(key);
        self
    }

    #[cfg(test)]
    pub(crate) fn with_program(mut self, program: impl Into<String>) -> Self {
        self.ssh_program = program.into();
        self
    }

    /// Base ssh invocation: no password prompts, auto-accept new hosts.
    fn build_ssh_args(&self) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            format!("ConnectTimeout={CONNECT_TIMEOUT_SECS}"),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
        ];
        if let Some(key) = &self.ssh_key {
            args.push("-i".to_string());
            args.push(key.display().to_string());
        }
        args.push(format!("{}@{}", self.user, self.host));
        args
    }

    /// Assemble the remote command string.
    ///
    /// Without cwd or env the argv is quoted verbatim. Otherwise the
    /// command is wrapped in `bash -c 'cd … && export … && …'` with every
    /// component quoted.
    fn assemble_remote_command(
        argv: &[String],
        cwd: Option<&str>,
        env: Option<&[(String, String)]>,
    ) -> String {
        let quoted_argv = argv.iter().map(|a| quote(a)).collect::<Vec<_>>().join(" ");

        if cwd.is_none() && env.is_none_or(<[_]>::is_empty) {
            return quoted_argv;
        }

        let mut parts = Vec::new();
        if let Some(dir) = cwd {
            parts.push(format!("cd {}", quote(dir)));
        }
        if let Some(env) = env {
            for (key, value) in env {
                parts.push(format!("export {key}={}", quote(value)));
            }
        }
        parts.push(quoted_argv);

        format!("bash -c {}", quote(&parts.join(" && ")))
    }

    /// Execute a command on the workstation.
    pub async fn run(
        &self,
        argv: &[String],
        cwd: Option<&str>,
        env: Option<&[(String, String)]>,
        limit: Duration,
    ) -> RemoteResult {
        let remote_cmd = Self::assemble_remote_command(argv, cwd, env);
        let mut ssh_args = self.build_ssh_args();
        ssh_args.push(remote_cmd);

        debug!(host = %self.host, argv = ?argv, "remote exec");

        let mut cmd = Command::new(&self.ssh_program);
        cmd.args(&ssh_args).kill_on_drop(true);

        let output = match timeout(limit, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return RemoteResult::failure(format!("ssh execution failed: {e}"));
            }
            Err(_) => {
                return RemoteResult::failure(format!(
                    "command timed out after {} seconds",
                    limit.as_secs()
                ));
            }
        };

        RemoteResult {
            return_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
    }

    /// `run` with the default timeout and no cwd/env.
    pub async fn run_simple(&self, argv: &[&str]) -> RemoteResult {
        let argv: Vec<String> = argv.iter().map(ToString::to_string).collect();
        self.run(&argv, None, None, DEFAULT_COMMAND_TIMEOUT).await
    }

    /// Read a file from the workstation. Returns `None` when unreadable.
    pub async fn read_file(&self, path: &str) -> Option<String> {
        let argv = vec!["cat".to_string(), path.to_string()];
        let result = self.run(&argv, None, None, Duration::from_secs(10)).await;
        if result.success() {
            Some(result.stdout)
        } else {
            None
        }
    }

    /// Write content to a file on the workstation.
    ///
    /// The payload is base64-encoded locally and decoded remotely, which
    /// keeps arbitrary content from traversing the quoting layer twice.
    /// The parent directory is created first.
    pub async fn write_file(&self, path: &str, content: &[u8]) -> RemoteResult {
        if let Some(parent) = std::path::Path::new(path).parent() {
            let mkdir = vec![
                "mkdir".to_string(),
                "-p".to_string(),
                parent.display().to_string(),
            ];
            self.run(&mkdir, None, None, Duration::from_secs(10)).await;
        }

        let encoded = base64::engine::general_purpose::STANDARD.encode(content);
        let script = format!("echo {} | base64 -d > {}", quote(&encoded), quote(path));
        let argv = vec!["bash".to_string(), "-c".to_string(), script];
        self.run(&argv, None, None, Duration::from_secs(30)).await
    }

    /// Remote file-test (`test -f` / `test -d`).
    pub async fn exists(&self, path: &str, kind: RemoteFileKind) -> bool {
        let flag = match kind {
            RemoteFileKind::File => "-f",
            RemoteFileKind::Directory => "-d",
        };
        let argv = vec!["test".to_string(), flag.to_string(), path.to_string()];
        self.run(&argv, None, None, Duration::from_secs(5))
            .await
            .success()
    }

    /// Quick connectivity check.
    pub async fn test_connection(&self) -> (bool, String) {
        let result = self
            .run_simple(&["echo", "flowforge connection test"])
            .await;
        if result.success() {
            (true, format!("Connected to {}@{}", self.user, self.host))
        } else {
            (false, format!("Connection failed: {}", result.stderr))
        }
    }

    /// List FlowForge-initialized projects under a base directory: every
    /// directory containing a `.flowforge` marker.
    pub async fn get_projects(&self, projects_base: &str) -> Vec<RemoteProject> {
        let argv = vec![
            "find".to_string(),
            projects_base.to_string(),
            "-maxdepth".to_string(),
            "2".to_string(),
            "-name".to_string(),
            ".flowforge".to_string(),
            "-type".to_string(),
            "d".to_string(),
        ];
        let result = self.run(&argv, None, None, Duration::from_secs(30)).await;
        if !result.success() {
            return Vec::new();
        }

        result
            .stdout
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| {
                let project_path = std::path::Path::new(line.trim()).parent()?;
                Some(RemoteProject {
                    name: project_path.file_name()?.to_str()?.to_string(),
                    path: project_path.display().to_string(),
                })
            })
            .collect()
    }

    // --- Git helpers for worktree management ---

    /// Run a git subcommand inside a repository on the workstation.
    pub async fn run_git(
        &self,
        project_path: &str,
        git_args: &[&str],
        limit: Duration,
    ) -> RemoteResult {
        let mut argv = vec!["git".to_string()];
        argv.extend(git_args.iter().map(ToString::to_string));
        self.run(&argv, Some(project_path), None, limit).await
    }

    /// `git worktree add`, optionally creating the branch.
    pub async fn add_worktree(
        &self,
        project_path: &str,
        worktree_path: &str,
        branch: &str,
        create_branch: bool,
    ) -> RemoteResult {
        let mut args = vec!["worktree", "add"];
        if create_branch {
            args.push("-b");
            args.push(branch);
        }
        args.push(worktree_path);
        if !create_branch {
            args.push(branch);
        }
        self.run_git(project_path, &args, Duration::from_secs(60))
            .await
    }

    /// `git worktree remove`, with optional force.
    pub async fn remove_worktree(
        &self,
        project_path: &str,
        worktree_path: &str,
        force: bool,
    ) -> RemoteResult {
        let mut args = vec!["worktree", "remove"];
        if force {
            args.push("--force");
        }
        args.push(worktree_path);
        self.run_git(project_path, &args, Duration::from_secs(60))
            .await
    }

    /// `git worktree list --porcelain`.
    pub async fn list_worktrees(&self, project_path: &str) -> RemoteResult {
        self.run_git(
            project_path,
            &["worktree", "list", "--porcelain"],
            Duration::from_secs(30),
        )
        .await
    }

    /// Branches merged into the given trunk.
    pub async fn merged_branches(&self, project_path: &str, trunk: &str) -> RemoteResult {
        self.run_git(
            project_path,
            &["branch", "--merged", trunk],
            Duration::from_secs(30),
        )
        .await
    }

    /// Dry-run merge probe: attempt a no-commit merge, then always abort,
    /// even when the merge would have succeeded.
    pub async fn probe_merge(&self, project_path: &str, branch: &str) -> RemoteResult {
        let result = self
            .run_git(
                project_path,
                &["merge", "--no-commit", "--no-ff", branch],
                Duration::from_secs(60),
            )
            .await;

        self.run_git(project_path, &["merge", "--abort"], Duration::from_secs(10))
            .await;

        result
    }
}
