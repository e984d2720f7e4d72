//! Git plumbing for per-task worktrees.
//!
//! Worktrees share the object store of the project repository but have
//! independent working directories, which is what isolates concurrent agent
//! runs from each other. Git does not support concurrent worktree mutations
//! on one repository (it locks the shared object store), so all mutating
//! operations serialize through an internal mutex.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};

use thiserror::Error;

/// Errors from git worktree operations.
#[derive(Debug, Error)]
pub enum WorktreeError {
    /// The project path is not a git repository.
    #[error("not a git repository: {0}")]
    NotAGitRepo(PathBuf),

    /// A git command failed to execute at all.
    #[error("git command failed: {message}")]
    GitCommand {
        message: String,
        #[source]
        source: std::io::Error,
    },

    /// A git command exited non-zero.
    #[error("git {command} failed (exit {code}): {stderr}")]
    GitExit {
        command: String,
        code: i32,
        stderr: String,
    },

    /// A worktree exists at the path but carries a different branch.
    #[error("worktree path exists with unexpected branch: expected {expected}, found {found}")]
    BranchMismatch { expected: String, found: String },

    /// Unparseable output from a porcelain command.
    #[error("failed to parse git output: {0}")]
    ParseError(String),
}

/// Outcome of merging a worktree branch into its base.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Merged,
    Conflict { details: String },
}

/// One entry from `git worktree list --porcelain`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeEntry {
    pub path: PathBuf,
    pub branch: Option<String>,
    pub head_commit: String,
}

/// A single changed file in a branch diff.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct DiffFile {
    pub path: String,
    pub status: String,
    pub additions: u32,
    pub deletions: u32,
}

/// Aggregate diff of a worktree branch against its base.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct DiffSummary {
    pub files: Vec<DiffFile>,
    pub files_changed: u32,
    pub total_additions: u32,
    pub total_deletions: u32,
}

/// Git worktree operations scoped to one project repository.
#[derive(Debug)]
pub struct GitWorktrees {
    repo_path: PathBuf,
    git_lock: Arc<Mutex<()>>,
}

impl Clone for GitWorktrees {
    fn clone(&self) -> Self {
        Self {
            repo_path: self.repo_path.clone(),
            git_lock: Arc::clone(&self.git_lock),
        }
    }
}

impl GitWorktrees {
    /// Open the repository at `repo_path`.
    pub fn new(repo_path: impl Into<PathBuf>) -> Result<Self, WorktreeError> {
        let repo_path = repo_path.into();

        let output = Command::new("git")
            .args(["rev-parse", "--git-dir"])
            .current_dir(&repo_path)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git rev-parse".into(),
                source: e,
            })?;

        if !output.status.success() {
            return Err(WorktreeError::NotAGitRepo(repo_path));
        }

        Ok(Self {
            repo_path,
            git_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    fn run(&self, args: &[&str], dir: &Path) -> Result<std::process::Output, WorktreeError> {
        Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: format!("failed to run git {}", args.join(" ")),
                source: e,
            })
    }

    fn run_checked(&self, args: &[&str], dir: &Path) -> Result<String, WorktreeError> {
        let output = self.run(args, dir)?;
        if !output.status.success() {
            return Err(WorktreeError::GitExit {
                command: args.join(" "),
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Create a worktree at `path` on `branch`, branching from `base` when
    /// the branch does not exist yet.
    ///
    /// Idempotent: an existing worktree at the path with the expected
    /// branch is returned as-is.
    pub fn create(
        &self,
        branch: &str,
        base: &str,
        path: &Path,
    ) -> Result<WorktreeEntry, WorktreeError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(existing) = self.find_by_path(path)? {
            match existing.branch.as_deref() {
                Some(found) if found == branch => {
                    tracing::info!(
                        path = %path.display(),
                        branch,
                        "worktree already exists, reusing"
                    );
                    return Ok(existing);
                }
                Some(found) => {
                    return Err(WorktreeError::BranchMismatch {
                        expected: branch.to_string(),
                        found: found.to_string(),
                    });
                }
                None => return Ok(existing),
            }
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| WorktreeError::GitCommand {
                message: format!("failed to create worktree parent {}", parent.display()),
                source: e,
            })?;
        }

        let path_str = path.to_string_lossy();
        let result = if self.branch_exists(branch)? {
            self.run_checked(&["worktree", "add", &path_str, branch], &self.repo_path)
        } else {
            self.run_checked(
                &["worktree", "add", "-b", branch, &path_str, base],
                &self.repo_path,
            )
        };

        if let Err(e) = result {
            self.cleanup_partial(path);
            return Err(e);
        }

        self.find_by_path(path)?.ok_or_else(|| {
            WorktreeError::ParseError(format!(
                "worktree missing after creation: {}",
                path.display()
            ))
        })
    }

    /// Remove a worktree by path. No-op if it does not exist.
    pub fn remove(&self, path: &Path) -> Result<(), WorktreeError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());

        if self.find_by_path(path)?.is_none() {
            if path.exists() {
                tracing::warn!(
                    path = %path.display(),
                    "directory exists but is not a registered worktree, removing"
                );
                let _ = std::fs::remove_dir_all(path);
            }
            return Ok(());
        }

        let path_str = path.to_string_lossy();
        match self.run_checked(&["worktree", "remove", "--force", &path_str], &self.repo_path) {
            Ok(_) => Ok(()),
            Err(WorktreeError::GitExit { stderr, .. })
                if stderr.contains("is not a working tree") =>
            {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Drop stale worktree registrations whose directories are gone.
    pub fn prune(&self) -> Result<(), WorktreeError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.run_checked(&["worktree", "prune"], &self.repo_path)?;
        Ok(())
    }

    /// List registered worktrees.
    pub fn list(&self) -> Result<Vec<WorktreeEntry>, WorktreeError> {
        let stdout = self.run_checked(&["worktree", "list", "--porcelain"], &self.repo_path)?;
        parse_porcelain(&stdout)
    }

    /// Whether a local branch exists.
    pub fn branch_exists(&self, branch: &str) -> Result<bool, WorktreeError> {
        let output = self.run(
            &["rev-parse", "--verify", &format!("refs/heads/{branch}")],
            &self.repo_path,
        )?;
        Ok(output.status.success())
    }

    /// Stage and commit everything in a worktree.
    ///
    /// Returns whether a commit was created (`false` when the tree is
    /// clean).
    pub fn commit_all(&self, worktree_path: &Path, message: &str) -> Result<bool, WorktreeError> {
        // Ensure an identity exists for the commit.
        let _ = self.run(&["config", "user.email", "corral@localhost"], worktree_path);
        let _ = self.run(&["config", "user.name", "corral"], worktree_path);

        self.run_checked(&["add", "-A"], worktree_path)?;

        let status = self.run_checked(&["status", "--porcelain"], worktree_path)?;
        if status.trim().is_empty() {
            return Ok(false);
        }

        self.run_checked(&["commit", "-m", message], worktree_path)?;
        Ok(true)
    }

    /// Diff a worktree's branch against its base branch.
    ///
    /// Compares `base...HEAD` (changes since the merge-base), so the diff
    /// reflects exactly what the branch adds.
    pub fn diff(&self, worktree_path: &Path, base: &str) -> Result<DiffSummary, WorktreeError> {
        let range = format!("{base}...HEAD");
        let numstat = self.run_checked(&["diff", "--numstat", &range], worktree_path)?;
        let name_status = self.run_checked(&["diff", "--name-status", &range], worktree_path)?;
        Ok(build_diff_summary(&numstat, &name_status))
    }

    /// Merge a worktree branch into its base.
    ///
    /// When the main repository has `base` checked out, this performs a
    /// `--no-ff` merge; otherwise it falls back to a fast-forward-only ref
    /// update so the checked-out tree is never touched.
    pub fn merge(
        &self,
        branch: &str,
        base: &str,
        message: Option<&str>,
    ) -> Result<MergeOutcome, WorktreeError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());

        let current = self
            .run_checked(&["branch", "--show-current"], &self.repo_path)?
            .trim()
            .to_string();

        if current == base {
            let mut args = vec!["merge", "--no-ff"];
            let message_owned;
            if let Some(message) = message {
                message_owned = message.to_string();
                args.push("-m");
                args.push(&message_owned);
            }
            args.push(branch);

            let output = self.run(&args, &self.repo_path)?;
            if output.status.success() {
                return Ok(MergeOutcome::Merged);
            }

            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
            if stderr.contains("CONFLICT")
                || stdout.contains("CONFLICT")
                || stderr.contains("Automatic merge failed")
                || stdout.contains("Automatic merge failed")
            {
                let _ = self.run(&["merge", "--abort"], &self.repo_path);
                return Ok(MergeOutcome::Conflict {
                    details: format!("{stdout}\n{stderr}").trim().to_string(),
                });
            }

            return Err(WorktreeError::GitExit {
                command: "merge".into(),
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        // Base is not checked out: fast-forward the ref in place.
        let refspec = format!("{branch}:{base}");
        match self.run_checked(&["fetch", ".", &refspec], &self.repo_path) {
            Ok(_) => Ok(MergeOutcome::Merged),
            Err(WorktreeError::GitExit { stderr, .. })
                if stderr.contains("non-fast-forward") || stderr.contains("rejected") =>
            {
                Ok(MergeOutcome::Conflict {
                    details: format!(
                        "{base} has diverged from {branch}; fast-forward not possible"
                    ),
                })
            }
            Err(e) => Err(e),
        }
    }

    fn find_by_path(&self, path: &Path) -> Result<Option<WorktreeEntry>, WorktreeError> {
        let entries = self.list()?;
        let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        Ok(entries.into_iter().find(|entry| {
            entry
                .path
                .canonicalize()
                .unwrap_or_else(|_| entry.path.clone())
                == canonical
        }))
    }

    fn cleanup_partial(&self, path: &Path) {
        if path.exists() {
            tracing::warn!(path = %path.display(), "cleaning up partial worktree directory");
            let _ = std::fs::remove_dir_all(path);
        }
        let _ = self.run(&["worktree", "prune"], &self.repo_path);
    }
}

/// Parse `git worktree list --porcelain` output.
fn parse_porcelain(output: &str) -> Result<Vec<WorktreeEntry>, WorktreeError> {
    let mut entries = Vec::new();
    let mut path: Option<PathBuf> = None;
    let mut head: Option<String> = None;
    let mut branch: Option<String> = None;

    for line in output.lines() {
        if line.is_empty() {
            if let (Some(p), Some(h)) = (path.take(), head.take()) {
                entries.push(WorktreeEntry {
                    path: p,
                    branch: branch.take(),
                    head_commit: h,
                });
            } else {
                path = None;
                head = None;
                branch = None;
            }
            continue;
        }

        if let Some(rest) = line.strip_prefix("worktree ") {
            path = Some(PathBuf::from(rest));
        } else if let Some(rest) = line.strip_prefix("HEAD ") {
            head = Some(rest.to_string());
        } else if let Some(rest) = line.strip_prefix("branch ") {
            branch = Some(
                rest.strip_prefix("refs/heads/")
                    .unwrap_or(rest)
                    .to_string(),
            );
        }
        // `bare`, `detached`, `prunable` etc. are ignored.
    }

    if let (Some(p), Some(h)) = (path, head) {
        entries.push(WorktreeEntry {
            path: p,
            branch,
            head_commit: h,
        });
    }

    Ok(entries)
}

/// Combine `--numstat` and `--name-status` output into a [`DiffSummary`].
fn build_diff_summary(numstat: &str, name_status: &str) -> DiffSummary {
    // Status letter per path. Renames ("R100\told\tnew") key on the new path.
    let mut statuses: std::collections::HashMap<String, String> =
        std::collections::HashMap::new();
    for line in name_status.lines() {
        let mut parts = line.split('\t');
        let Some(code) = parts.next() else { continue };
        let status = match code.chars().next() {
            Some('A') => "added",
            Some('M') => "modified",
            Some('D') => "deleted",
            Some('R') => "renamed",
            Some('C') => "copied",
            _ => "changed",
        };
        if let Some(path) = parts.last() {
            statuses.insert(path.to_string(), status.to_string());
        }
    }

    let mut summary = DiffSummary::default();
    for line in numstat.lines() {
        let mut parts = line.split('\t');
        let (Some(add), Some(del)) = (parts.next(), parts.next()) else {
            continue;
        };
        let Some(path) = parts.last() else { continue };
        // Binary files report "-" for both counts.
        let additions: u32 = add.parse().unwrap_or(0);
        let deletions: u32 = del.parse().unwrap_or(0);

        summary.total_additions += additions;
        summary.total_deletions += deletions;
        summary.files.push(DiffFile {
            path: path.to_string(),
            status: statuses
                .get(path)
                .cloned()
                .unwrap_or_else(|| "changed".to_string()),
            additions,
            deletions,
        });
    }
    summary.files_changed = summary.files.len() as u32;
    summary
}
