//! Local git working trees.
//!
//! Reads (ref resolution, ancestry, file contents) go through `git2`; every
//! mutation runs the git CLI so that attributes, pathspec magic and index
//! semantics match what a developer would get on the command line. CLI
//! invocations share a semaphore so a burst of flows cannot start more git
//! processes than the configured limit.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use git2::{BranchType, ObjectType, Repository};
use sha2::{Digest, Sha256};
use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::CodeflowConfig;
use crate::errors::GitError;

const DEFAULT_GIT_PROCESSES: usize = 8;

/// Captured result of a git invocation.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }

    /// Turn a non-zero exit into [`GitError::CommandFailed`].
    pub fn ensure_success(self, args: &[&str]) -> Result<Self, GitError> {
        if self.succeeded() {
            return Ok(self);
        }
        warn!(exit_code = self.exit_code, stderr = %self.stderr.trim(), "git command failed");
        Err(GitError::CommandFailed {
            command: args.join(" "),
            exit_code: self.exit_code,
            stderr: self.stderr.trim().to_string(),
        })
    }
}

/// Author and committer identity for commits made by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitIdentity {
    pub name: String,
    pub email: String,
}

/// What a ref resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GitObjectType {
    Commit,
    Tree,
    Blob,
    Tag,
    /// Only known as `refs/remotes/<remote>/<ref>`.
    RemoteRef,
    Unknown,
}

/// Side of a conflicted merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictSide {
    /// The branch being merged into (HEAD).
    Ours,
    /// The branch being merged in.
    Theirs,
}

impl ConflictSide {
    pub fn opposite(self) -> Self {
        match self {
            Self::Ours => Self::Theirs,
            Self::Theirs => Self::Ours,
        }
    }

    fn stage(self) -> u8 {
        match self {
            Self::Ours => 2,
            Self::Theirs => 3,
        }
    }

    fn flag(self) -> &'static str {
        match self {
            Self::Ours => "--ours",
            Self::Theirs => "--theirs",
        }
    }
}

/// A git working tree on local disk.
#[derive(Debug, Clone)]
pub struct LocalGitRepo {
    path: PathBuf,
    identity: Option<GitIdentity>,
    limiter: Arc<Semaphore>,
    cancel: CancellationToken,
}

impl LocalGitRepo {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            identity: None,
            limiter: Arc::new(Semaphore::new(DEFAULT_GIT_PROCESSES)),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_identity(mut self, identity: GitIdentity) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn with_limiter(mut self, limiter: Arc<Semaphore>) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the directory holds a git repository.
    pub fn exists(&self) -> bool {
        self.path.join(".git").exists()
    }

    pub(crate) fn open(&self) -> Result<Repository, GitError> {
        Repository::open(&self.path)
            .map_err(|_| GitError::RepositoryNotFound(self.path.display().to_string()))
    }

    // -----------------------------------------------------------------------
    // Raw commands
    // -----------------------------------------------------------------------

    /// Run git in the working tree root. Only spawn failures are errors.
    pub async fn run_git(&self, args: &[&str]) -> Result<ProcessOutput, GitError> {
        self.run_git_in(&self.path, args).await
    }

    /// Run git in `dir`, which may be a subdirectory of the working tree.
    pub async fn run_git_in(&self, dir: &Path, args: &[&str]) -> Result<ProcessOutput, GitError> {
        if self.cancel.is_cancelled() {
            return Err(GitError::Cancelled);
        }
        let _permit = self
            .limiter
            .acquire()
            .await
            .map_err(|_| GitError::Cancelled)?;

        let mut cmd = Command::new("git");
        cmd.current_dir(dir)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(cmd = ?format!("git {}", args.join(" ")), dir = %dir.display(), "running git command");
        let output = cmd.output().await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                GitError::BinaryNotFound("git".into())
            } else {
                GitError::IoError(e)
            }
        })?;

        Ok(ProcessOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    /// Run git and fail on a non-zero exit code, returning stdout.
    pub async fn git(&self, args: &[&str]) -> Result<String, GitError> {
        Ok(self.run_git(args).await?.ensure_success(args)?.stdout)
    }

    pub async fn git_in(&self, dir: &Path, args: &[&str]) -> Result<String, GitError> {
        Ok(self.run_git_in(dir, args).await?.ensure_success(args)?.stdout)
    }

    // -----------------------------------------------------------------------
    // Branches and checkouts
    // -----------------------------------------------------------------------

    #[instrument(skip(self), fields(repo = %self.path.display()))]
    pub async fn checkout(&self, reference: &str) -> Result<(), GitError> {
        self.git(&["checkout", "-q", reference]).await?;
        Ok(())
    }

    /// Checkout discarding local modifications.
    pub async fn force_checkout(&self, reference: &str) -> Result<(), GitError> {
        self.git(&["checkout", "-q", "-f", reference]).await?;
        Ok(())
    }

    /// Create `name` at `start` and check it out. `overwrite` resets an
    /// existing branch of the same name.
    #[instrument(skip(self), fields(repo = %self.path.display()))]
    pub async fn create_branch(&self, name: &str, start: &str, overwrite: bool) -> Result<(), GitError> {
        let flag = if overwrite { "-B" } else { "-b" };
        self.git(&["checkout", "-q", flag, name, start]).await?;
        info!(branch = name, start, "created branch");
        Ok(())
    }

    pub async fn delete_branch(&self, name: &str) -> Result<(), GitError> {
        self.git(&["branch", "-D", name]).await?;
        debug!(branch = name, "deleted branch");
        Ok(())
    }

    pub fn branch_exists(&self, name: &str) -> Result<bool, GitError> {
        let repo = self.open()?;
        let exists = repo.find_branch(name, BranchType::Local).is_ok();
        Ok(exists)
    }

    /// Name of the checked out branch, `None` when HEAD is detached.
    pub fn current_branch(&self) -> Result<Option<String>, GitError> {
        let repo = self.open()?;
        let head = repo.head()?;
        if head.is_branch() {
            Ok(head.shorthand().map(str::to_string))
        } else {
            Ok(None)
        }
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub fn head_sha(&self) -> Result<String, GitError> {
        let repo = self.open()?;
        let commit = repo.head()?.peel_to_commit()?;
        Ok(commit.id().to_string())
    }

    /// Full SHA of the commit `reference` points to.
    pub fn resolve_commit(&self, reference: &str) -> Result<String, GitError> {
        let repo = self.open()?;
        let object = repo
            .revparse_single(reference)
            .map_err(|_| GitError::RefNotFound(reference.to_string()))?;
        let commit = object
            .peel_to_commit()
            .map_err(|_| GitError::RefNotFound(reference.to_string()))?;
        Ok(commit.id().to_string())
    }

    pub fn object_type(&self, reference: &str) -> Result<GitObjectType, GitError> {
        let repo = self.open()?;
        if let Ok(object) = repo.revparse_single(reference) {
            return Ok(match object.kind() {
                Some(ObjectType::Commit) => GitObjectType::Commit,
                Some(ObjectType::Tree) => GitObjectType::Tree,
                Some(ObjectType::Blob) => GitObjectType::Blob,
                Some(ObjectType::Tag) => GitObjectType::Tag,
                _ => GitObjectType::Unknown,
            });
        }

        for remote in repo.remotes()?.iter().flatten() {
            let name = format!("refs/remotes/{remote}/{reference}");
            if repo.find_reference(&name).is_ok() {
                return Ok(GitObjectType::RemoteRef);
            }
        }
        Ok(GitObjectType::Unknown)
    }

    /// Whether `ancestor` is reachable from `descendant`. A commit is its own
    /// ancestor.
    pub fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool, GitError> {
        let repo = self.open()?;
        let ancestor = repo
            .revparse_single(ancestor)
            .and_then(|o| o.peel_to_commit())
            .map_err(|_| GitError::RefNotFound(ancestor.to_string()))?
            .id();
        let descendant = repo
            .revparse_single(descendant)
            .and_then(|o| o.peel_to_commit())
            .map_err(|_| GitError::RefNotFound(descendant.to_string()))?
            .id();
        if ancestor == descendant {
            return Ok(true);
        }
        Ok(repo.graph_descendant_of(descendant, ancestor)?)
    }

    /// Content of `path` at `reference`, `None` if the file does not exist there.
    pub fn file_at_ref(&self, path: &str, reference: &str) -> Result<Option<String>, GitError> {
        let repo = self.open()?;
        let commit = repo
            .revparse_single(reference)
            .and_then(|o| o.peel_to_commit())
            .map_err(|_| GitError::RefNotFound(reference.to_string()))?;
        let tree = commit.tree()?;
        let entry = match tree.get_path(Path::new(path)) {
            Ok(entry) => entry,
            Err(e) if e.code() == git2::ErrorCode::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let object = entry.to_object(&repo)?;
        match object.as_blob() {
            Some(blob) => Ok(Some(String::from_utf8_lossy(blob.content()).to_string())),
            None => Ok(None),
        }
    }

    /// Write every file under `dir` at `reference` into `destination`.
    /// Returns the number of files written; a missing directory writes none.
    pub fn export_directory(&self, reference: &str, dir: &str, destination: &Path) -> Result<usize, GitError> {
        let repo = self.open()?;
        let commit = repo
            .revparse_single(reference)
            .and_then(|o| o.peel_to_commit())
            .map_err(|_| GitError::RefNotFound(reference.to_string()))?;
        let entry = match commit.tree()?.get_path(Path::new(dir)) {
            Ok(entry) => entry,
            Err(e) if e.code() == git2::ErrorCode::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let tree = entry.to_object(&repo)?.peel_to_tree()?;

        let mut written = 0;
        let mut failure: Option<GitError> = None;
        let walked = tree.walk(git2::TreeWalkMode::PreOrder, |root, item| {
            if item.kind() != Some(ObjectType::Blob) {
                return git2::TreeWalkResult::Ok;
            }
            let Some(name) = item.name() else {
                return git2::TreeWalkResult::Ok;
            };
            let target = destination.join(root).join(name);
            let result = item
                .to_object(&repo)
                .and_then(|o| o.peel_to_blob())
                .map_err(GitError::from)
                .and_then(|blob| {
                    if let Some(parent) = target.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    std::fs::write(&target, blob.content())?;
                    Ok(())
                });
            match result {
                Ok(()) => {
                    written += 1;
                    git2::TreeWalkResult::Ok
                }
                Err(e) => {
                    failure = Some(e);
                    git2::TreeWalkResult::Abort
                }
            }
        });
        if let Some(e) = failure {
            return Err(e);
        }
        walked?;
        debug!(dir, reference, files = written, "exported directory");
        Ok(written)
    }

    /// Content of a conflicted file as recorded on one side of the merge.
    pub async fn conflict_version(&self, path: &str, side: ConflictSide) -> Result<Option<String>, GitError> {
        let spec = format!(":{}:{}", side.stage(), path);
        let output = self.run_git(&["show", &spec]).await?;
        Ok(output.succeeded().then_some(output.stdout))
    }

    /// Resolve a conflicted file by taking one side.
    pub async fn checkout_conflict_side(&self, path: &str, side: ConflictSide) -> Result<ProcessOutput, GitError> {
        self.run_git(&["checkout", side.flag(), "--", path]).await
    }

    /// Attribute the first line of `path` matching `predicate` to the commit
    /// that introduced it, following first parents only.
    ///
    /// With `at` set, both the content and the blame are taken from that
    /// revision; otherwise from the working tree.
    #[instrument(skip(self, predicate), fields(repo = %self.path.display()))]
    pub async fn blame_line<F>(&self, path: &str, predicate: F, at: Option<&str>) -> Result<String, GitError>
    where
        F: Fn(&str) -> bool,
    {
        let content = match at {
            Some(reference) => self.file_at_ref(path, reference)?.ok_or_else(|| GitError::BlameFailed {
                path: path.to_string(),
                detail: format!("file does not exist at {reference}"),
            })?,
            None => std::fs::read_to_string(self.path.join(path))?,
        };

        let line_number = content
            .lines()
            .position(|line| predicate(line))
            .map(|index| index + 1)
            .ok_or_else(|| GitError::BlameFailed {
                path: path.to_string(),
                detail: "no line matches".into(),
            })?;

        let range = format!("{line_number},{line_number}");
        let mut args = vec!["blame", "--root", "--first-parent", "-s", "-l", "-L", range.as_str()];
        if let Some(reference) = at {
            args.push(reference);
        }
        args.push("--");
        args.push(path);

        let stdout = self.git(&args).await?;
        let token = stdout
            .split_whitespace()
            .next()
            .map(|t| t.trim_start_matches('^'))
            .ok_or_else(|| GitError::BlameFailed {
                path: path.to_string(),
                detail: "empty blame output".into(),
            })?;

        // Boundary commits lose a character to the `^` marker.
        let sha = if token.len() < 40 {
            self.resolve_commit(token)?
        } else {
            token.to_string()
        };
        debug!(path, line = line_number, sha = %sha, "blamed line");
        Ok(sha)
    }

    // -----------------------------------------------------------------------
    // Index and commits
    // -----------------------------------------------------------------------

    /// Stage additions, modifications and deletions under `paths`.
    pub async fn stage(&self, paths: &[&str]) -> Result<(), GitError> {
        let mut args = vec!["add", "-A", "--"];
        args.extend_from_slice(paths);
        self.git(&args).await?;
        Ok(())
    }

    /// Commit the index and return the new HEAD SHA.
    #[instrument(skip(self, message), fields(repo = %self.path.display()))]
    pub async fn commit(&self, message: &str, allow_empty: bool) -> Result<String, GitError> {
        let identity_args = self.identity.as_ref().map(|identity| {
            [
                format!("user.name={}", identity.name),
                format!("user.email={}", identity.email),
            ]
        });

        let mut args: Vec<&str> = Vec::new();
        if let Some([name, email]) = identity_args.as_ref() {
            args.extend(["-c", name.as_str(), "-c", email.as_str()]);
        }
        args.extend(["commit", "-q", "--no-verify", "-m", message]);
        if allow_empty {
            args.push("--allow-empty");
        }
        self.git(&args).await?;

        let sha = self.head_sha()?;
        info!(sha = %sha, "created commit");
        Ok(sha)
    }

    /// Whether the index differs from HEAD.
    pub async fn has_staged_changes(&self) -> Result<bool, GitError> {
        let args = ["diff", "--cached", "--quiet"];
        let output = self.run_git(&args).await?;
        match output.exit_code {
            0 => Ok(false),
            1 => Ok(true),
            exit_code => Err(GitError::CommandFailed {
                command: args.join(" "),
                exit_code,
                stderr: output.stderr.trim().to_string(),
            }),
        }
    }

    /// Whether the working tree has uncommitted or untracked changes.
    pub async fn has_working_tree_changes(&self) -> Result<bool, GitError> {
        let stdout = self.git(&["status", "--porcelain"]).await?;
        Ok(!stdout.trim().is_empty())
    }

    /// Paths with unresolved conflicts, relative to the working tree root.
    pub async fn conflicted_files(&self) -> Result<Vec<String>, GitError> {
        let stdout = self
            .git(&["diff", "--name-only", "--diff-filter=U", "--relative"])
            .await?;
        Ok(lines(&stdout))
    }

    /// Discard every uncommitted change and untracked file.
    pub async fn reset_working_tree(&self) -> Result<(), GitError> {
        self.git(&["reset", "-q", "--hard"]).await?;
        self.git(&["clean", "-fdq"]).await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Remotes
    // -----------------------------------------------------------------------

    /// `(name, url)` of every configured remote.
    pub fn remotes(&self) -> Result<Vec<(String, String)>, GitError> {
        let repo = self.open()?;
        let mut remotes = Vec::new();
        for name in repo.remotes()?.iter().flatten() {
            let remote = repo.find_remote(name)?;
            remotes.push((name.to_string(), remote.url().unwrap_or_default().to_string()));
        }
        Ok(remotes)
    }

    /// Add a remote for `uri` unless one exists, returning its name.
    pub async fn add_remote_if_missing(&self, uri: &str) -> Result<String, GitError> {
        if let Some((name, _)) = self.remotes()?.into_iter().find(|(_, url)| url == uri) {
            return Ok(name);
        }
        let name = remote_name(uri);
        self.git(&["remote", "add", &name, uri]).await?;
        info!(remote = %name, uri, "added remote");
        Ok(name)
    }

    pub async fn fetch_remote(&self, name: &str) -> Result<(), GitError> {
        self.git(&["remote", "update", name]).await?;
        Ok(())
    }

    /// Upstream (`remote/branch`) configured for a local branch.
    pub async fn upstream_of(&self, branch: &str) -> Result<Option<String>, GitError> {
        let refname = format!("refs/heads/{branch}");
        let stdout = self
            .git(&["for-each-ref", "--format=%(upstream:short)", &refname])
            .await?;
        let upstream = stdout.trim();
        Ok((!upstream.is_empty()).then(|| upstream.to_string()))
    }
}

/// Stable remote name derived from its URI.
pub fn remote_name(uri: &str) -> String {
    let digest = Sha256::digest(uri.as_bytes());
    hex::encode(digest)[..16].to_string()
}

fn lines(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Creates repositories that share one process limiter, committer identity
/// and cancellation token.
#[derive(Debug, Clone)]
pub struct RepoFactory {
    identity: Option<GitIdentity>,
    limiter: Arc<Semaphore>,
    cancel: CancellationToken,
}

impl RepoFactory {
    pub fn new(max_processes: usize) -> Self {
        Self {
            identity: None,
            limiter: Arc::new(Semaphore::new(max_processes.max(1))),
            cancel: CancellationToken::new(),
        }
    }

    pub fn from_config(config: &CodeflowConfig) -> Self {
        let mut factory = Self::new(config.codeflow.max_git_processes);
        factory.identity = Some(GitIdentity {
            name: config.codeflow.committer_name.clone(),
            email: config.codeflow.committer_email.clone(),
        });
        factory
    }

    /// Same limiter and identity, different cancellation token.
    pub fn with_cancellation(&self, cancel: CancellationToken) -> Self {
        Self {
            identity: self.identity.clone(),
            limiter: Arc::clone(&self.limiter),
            cancel,
        }
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn create(&self, path: impl Into<PathBuf>) -> LocalGitRepo {
        let repo = LocalGitRepo::new(path)
            .with_limiter(Arc::clone(&self.limiter))
            .with_cancellation(self.cancel.clone());
        match &self.identity {
            Some(identity) => repo.with_identity(identity.clone()),
            None => repo,
        }
    }
}
