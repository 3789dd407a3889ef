//! Error types for the code flow engine.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`CoreError`] enum unifies them all for callers that want a
//! single error type.

use thiserror::Error;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    Clone(#[from] CloneError),

    #[error(transparent)]
    Patch(#[from] PatchError),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    VersionFile(#[from] VersionFileError),

    #[error(transparent)]
    Conflict(#[from] ConflictError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Codeflow(#[from] CodeflowError),
}

// ---------------------------------------------------------------------------
// Git errors
// ---------------------------------------------------------------------------

/// Errors from the local git facade (git2 reads and git CLI invocations).
#[derive(Debug, Error)]
pub enum GitError {
    /// The `git` binary was not found on `$PATH`.
    #[error("git binary not found: {0}")]
    BinaryNotFound(String),

    /// A `git` command exited with a non-zero status.
    #[error("git {command} failed (exit {exit_code}): {stderr}")]
    CommandFailed {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    /// The repository does not exist at the expected path.
    #[error("git repository not found at '{0}'")]
    RepositoryNotFound(String),

    /// A ref, branch or commit could not be resolved.
    #[error("git ref not found: {0}")]
    RefNotFound(String),

    /// Blame could not attribute the requested line.
    #[error("failed to blame '{path}': {detail}")]
    BlameFailed { path: String, detail: String },

    /// `.gitmodules` content that could not be understood.
    #[error("invalid .gitmodules at {commit}: {detail}")]
    InvalidSubmodules { commit: String, detail: String },

    /// The operation was cancelled before the command was started.
    #[error("git operation cancelled")]
    Cancelled,

    /// Low-level libgit2 error.
    #[error("libgit2 error: {0}")]
    Git2Error(#[from] git2::Error),

    /// Underlying I/O error.
    #[error("git I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Clone manager errors
// ---------------------------------------------------------------------------

/// Errors raised while preparing working clones.
#[derive(Debug, Error)]
pub enum CloneError {
    /// No candidate remote was supplied.
    #[error("no remote URIs supplied for clone '{0}'")]
    NoRemotes(String),

    /// None of the candidate remotes contained every required ref.
    #[error("failed to find refs [{refs}] in any of the remotes [{remotes}]")]
    RefsNotFound { refs: String, remotes: String },

    #[error(transparent)]
    Git(#[from] GitError),

    /// Underlying I/O error.
    #[error("clone I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Patch errors
// ---------------------------------------------------------------------------

/// Errors from creating or applying patches.
#[derive(Debug, Error)]
pub enum PatchError {
    /// `git apply` rejected the patch.
    #[error("failed to apply patch {patch} (reverse: {reverse}): {output}")]
    ApplicationFailed {
        patch: String,
        output: String,
        reverse: bool,
    },

    /// A single file produces a patch larger than the configured ceiling.
    #[error("patch for '{path}' is {size} bytes which exceeds the limit of {limit} bytes")]
    TooLarge { path: String, size: u64, limit: u64 },

    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    Clone(#[from] CloneError),

    /// Underlying I/O error.
    #[error("patch I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl PatchError {
    /// Files `git apply` reported as not applying, in report order.
    pub fn rejected_files(&self) -> Vec<String> {
        let PatchError::ApplicationFailed { output, .. } = self else {
            return Vec::new();
        };
        let mut files: Vec<String> = Vec::new();
        for line in output.lines() {
            let file = if let Some(rest) = line.strip_prefix("error: patch failed: ") {
                rest.rsplit_once(':').map_or(rest, |(file, _)| file)
            } else if let Some(rest) = line.strip_prefix("error: ") {
                match rest
                    .strip_suffix(": patch does not apply")
                    .or_else(|| rest.strip_suffix(": does not exist in index"))
                    .or_else(|| rest.strip_suffix(": already exists in index"))
                {
                    Some(file) => file,
                    None => continue,
                }
            } else {
                continue;
            };
            if !files.iter().any(|f| f == file) {
                files.push(file.to_string());
            }
        }
        files
    }
}

// ---------------------------------------------------------------------------
// Manifest errors
// ---------------------------------------------------------------------------

/// Errors reading the source manifest or the source mappings file.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// No manifest or mapping entry exists for the requested mapping.
    #[error("mapping '{0}' not found")]
    MappingNotFound(String),

    /// A mapping definition is unusable.
    #[error("invalid mapping '{name}': {detail}")]
    InvalidMapping { name: String, detail: String },

    /// Malformed JSON.
    #[error("manifest JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Underlying I/O error.
    #[error("manifest I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Version file errors
// ---------------------------------------------------------------------------

/// Errors from parsing, diffing and merging dependency version files.
#[derive(Debug, Error)]
pub enum VersionFileError {
    /// The XML dependency file is not well formed.
    #[error("failed to parse XML in {file}: {detail}")]
    XmlParse { file: String, detail: String },

    /// An attribute holds a value of the wrong shape.
    #[error("invalid value '{value}' for attribute {attribute} of <{element}>")]
    InvalidAttribute {
        element: String,
        attribute: String,
        value: String,
    },

    /// A required attribute is absent.
    #[error("<{element}> is missing the {attribute} attribute")]
    MissingAttribute { element: String, attribute: String },

    /// A JSON value that cannot be flattened (null, nested arrays, ...).
    #[error("unsupported JSON value at '{path}' in {file}")]
    UnsupportedJsonValue { file: String, path: String },

    /// The same dependency was removed on one side and added on the other.
    #[error("conflicting updates of dependency '{name}': repository {repo_change}, VMR {vmr_change}")]
    ConflictingDependencyUpdate {
        name: String,
        repo_change: String,
        vmr_change: String,
    },

    /// Malformed JSON.
    #[error("version file JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Git(#[from] GitError),

    /// Underlying I/O error.
    #[error("version file I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Conflict errors
// ---------------------------------------------------------------------------

/// Errors from merging branches and healing conflicts.
#[derive(Debug, Error)]
pub enum ConflictError {
    /// Listing the conflicted files failed, the merge was aborted.
    #[error("failed to list conflicted files after merging {branch}: {stderr}")]
    ListConflictsFailed { branch: String, stderr: String },

    /// `git merge --abort` itself failed.
    #[error("failed to abort the merge of {branch}: {stderr}")]
    AbortFailed { branch: String, stderr: String },

    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    Patch(#[from] PatchError),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    /// Underlying I/O error.
    #[error("conflict resolution I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Lock errors
// ---------------------------------------------------------------------------

/// Errors from the distributed lock and cache collaborators.
#[derive(Debug, Error)]
pub enum LockError {
    /// Another flow currently holds the lock.
    #[error("lock '{key}' is held by another flow")]
    Held { key: String },

    /// The lock or cache backend failed.
    #[error("lock backend error: {0}")]
    Backend(String),
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue { field: String, detail: String },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Code flow errors
// ---------------------------------------------------------------------------

/// Errors surfaced by the code flow orchestrator.
#[derive(Debug, Error)]
pub enum CodeflowError {
    /// The commit being flowed does not descend from the last flown commit.
    #[error("non-linear code flow: {current_sha} is not a descendant of the last flown commit {last_sha}")]
    NonLinearCodeflow {
        last_sha: String,
        current_sha: String,
    },

    /// The recorded flows cannot be ordered.
    #[error("invalid synchronization state: {0}")]
    InvalidSynchronization(String),

    /// Conflicts that no rule could heal on `branch`. A flow whose changes
    /// still did not apply after recreation carries the rejected patch as
    /// `source`.
    #[error("unresolvable conflicts on branch '{branch}': {}", .files.join(", "))]
    UnresolvableConflict {
        branch: String,
        files: Vec<String>,
        #[source]
        source: Option<Box<PatchError>>,
    },

    /// Neither the head nor the target branch exist.
    #[error("target branch '{branch}' not found in {repo}")]
    TargetBranchNotFound { branch: String, repo: String },

    /// The flow was cancelled at a suspension point.
    #[error("code flow cancelled")]
    Cancelled,

    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    Clone(#[from] CloneError),

    #[error(transparent)]
    Patch(#[from] PatchError),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    VersionFile(#[from] VersionFileError),

    #[error(transparent)]
    Conflict(#[from] ConflictError),

    #[error(transparent)]
    Lock(#[from] LockError),
}

impl CodeflowError {
    /// Whether the error came from a cancelled token rather than a failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            CodeflowError::Cancelled
                | CodeflowError::Git(GitError::Cancelled)
                | CodeflowError::Patch(PatchError::Git(GitError::Cancelled))
                | CodeflowError::Conflict(ConflictError::Git(GitError::Cancelled))
        )
    }
}
