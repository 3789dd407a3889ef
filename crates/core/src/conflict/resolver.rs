//! Merging branches during a flow.
//!
//! [`ConflictResolver::try_merge`] runs a `--no-ff --no-commit` merge and,
//! when it stops on conflicts, walks the conflicted paths through the rules
//! below. The first rule that claims a path decides it:
//!
//! 1. source manifest: the other side's manifest with the flowed mapping's
//!    entries taken from the flow side
//! 2. git-info files: the flow side
//! 3. dependency files: a configured side, re-merged by the version file
//!    mergers afterwards
//! 4. `eng/common`: the flow side
//! 5. crossing flow: the file is re-derived by patching it from the
//!    crossing flow's source commit to the current one
//!
//! Everything else is unresolved and aborts the merge.

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::config::CodeflowConfig;
use crate::errors::ConflictError;
use crate::git::{ConflictSide, LocalGitRepo};
use crate::mapping::SourceMapping;
use crate::models::{short_sha, Codeflow};
use crate::patch::{ApplyOptions, PatchFilters, PatchHandler, PatchRequest};
use crate::version_files::{DEPENDENCY_FILES, ENG_COMMON_DIR};

use super::manifest::resolve_manifest_conflict;

/// One merge of `branch` into the checked out `head_branch`.
#[derive(Debug, Clone, Copy)]
pub struct MergeRequest<'a> {
    /// Repository receiving the flow, checked out on `head_branch`.
    pub repo: &'a LocalGitRepo,
    /// Repository the flow originates from. Crossing flow patches are
    /// computed in it.
    pub source_repo: &'a LocalGitRepo,
    pub mapping: &'a SourceMapping,
    pub head_branch: &'a str,
    pub branch: &'a str,
    /// Which side of the merge carries the flow being made.
    pub flow_side: ConflictSide,
    /// Which side dependency files resolve to.
    pub version_files_side: ConflictSide,
    pub current_flow: &'a Codeflow,
    pub crossing_flow: Option<&'a Codeflow>,
}

impl MergeRequest<'_> {
    fn target_is_vmr(&self) -> bool {
        self.current_flow.is_forward()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Files no rule could resolve. The merge was aborted when non-empty.
    pub conflicted_files: Vec<String>,
    pub auto_resolved: Vec<String>,
    /// Merge commit, if one was made.
    pub commit: Option<String>,
}

impl MergeOutcome {
    pub fn is_success(&self) -> bool {
        self.conflicted_files.is_empty()
    }
}

pub struct ConflictResolver {
    config: Arc<CodeflowConfig>,
    patches: Arc<PatchHandler>,
}

impl ConflictResolver {
    pub fn new(config: Arc<CodeflowConfig>, patches: Arc<PatchHandler>) -> Self {
        Self { config, patches }
    }

    /// Merge `request.branch` into the checked out head branch, healing the
    /// known conflicts. A clean or healed merge is committed.
    #[instrument(skip(self, request), fields(branch = request.branch, head = request.head_branch))]
    pub async fn try_merge(&self, request: MergeRequest<'_>) -> Result<MergeOutcome, ConflictError> {
        let repo = request.repo;
        if repo.is_ancestor(request.branch, "HEAD")? {
            debug!("branch is already merged");
            return Ok(MergeOutcome::default());
        }

        info!("merging {} into {}", request.branch, request.head_branch);
        let message = format!("Merge {} into {}", request.branch, request.head_branch);
        let output = repo
            .run_git(&["merge", "--no-commit", "--no-ff", request.branch])
            .await?;
        if output.succeeded() {
            let commit = repo.commit(&message, true).await?;
            return Ok(MergeOutcome {
                commit: Some(commit),
                ..MergeOutcome::default()
            });
        }

        let conflicts = match repo.conflicted_files().await {
            Ok(files) => files,
            Err(e) => {
                self.abort(repo, request.branch).await?;
                return Err(ConflictError::ListConflictsFailed {
                    branch: request.branch.to_string(),
                    stderr: e.to_string(),
                });
            }
        };
        if conflicts.is_empty() {
            self.abort(repo, request.branch).await?;
            return Err(ConflictError::ListConflictsFailed {
                branch: request.branch.to_string(),
                stderr: output.stderr.trim().to_string(),
            });
        }

        info!(count = conflicts.len(), "merge stopped on conflicts, trying to resolve them");
        let mut unresolved = Vec::new();
        let mut resolved = Vec::new();
        for file in conflicts {
            if self.try_resolve(&request, &file).await? {
                resolved.push(file);
            } else {
                warn!(file = %file, "conflict cannot be resolved automatically");
                unresolved.push(file);
            }
        }

        if !unresolved.is_empty() {
            self.abort(repo, request.branch).await?;
            return Ok(MergeOutcome {
                conflicted_files: unresolved,
                ..MergeOutcome::default()
            });
        }

        let body = resolved
            .iter()
            .map(|f| format!("  - {f}"))
            .collect::<Vec<_>>()
            .join("\n");
        let commit = repo
            .commit(&format!("{message}\n\nAuto-resolved conflicts:\n{body}"), true)
            .await?;
        info!(count = resolved.len(), "auto-resolved all conflicts");
        Ok(MergeOutcome {
            conflicted_files: Vec::new(),
            auto_resolved: resolved,
            commit: Some(commit),
        })
    }

    async fn try_resolve(&self, request: &MergeRequest<'_>, file: &str) -> Result<bool, ConflictError> {
        let repo = request.repo;
        let mapping = request.mapping.name.as_str();
        let vmr = &self.config.vmr;

        if request.target_is_vmr() && file == vmr.source_manifest {
            resolve_manifest_conflict(repo, file, mapping, request.flow_side).await?;
            return Ok(true);
        }

        if request.target_is_vmr() && self.is_git_info_file(file) {
            return self.take_side(repo, file, request.flow_side).await;
        }

        let mapping_prefix = if request.target_is_vmr() {
            format!("{}/", vmr.mapping_dir(mapping))
        } else {
            String::new()
        };
        let Some(relative) = file.strip_prefix(&mapping_prefix) else {
            return Ok(false);
        };

        if DEPENDENCY_FILES.contains(&relative) {
            return self.take_side(repo, file, request.version_files_side).await;
        }

        if relative.starts_with(&format!("{ENG_COMMON_DIR}/")) {
            return self.take_side(repo, file, request.flow_side).await;
        }

        if let Some(crossing) = request.crossing_flow {
            return self.resolve_crossing(request, crossing, file, relative).await;
        }
        Ok(false)
    }

    fn is_git_info_file(&self, file: &str) -> bool {
        let dir = self.config.vmr.git_info_dir.trim_end_matches('/');
        !dir.is_empty()
            && file
                .strip_prefix(dir)
                .is_some_and(|rest| rest.starts_with('/'))
    }

    async fn take_side(&self, repo: &LocalGitRepo, file: &str, side: ConflictSide) -> Result<bool, ConflictError> {
        let output = repo.checkout_conflict_side(file, side).await?;
        if !output.succeeded() {
            // The side deleted the file.
            repo.run_git(&["rm", "-q", "--", file]).await?.ensure_success(&["rm", file])?;
        } else {
            repo.stage(&[file]).await?;
        }
        debug!(file, ?side, "took one side of the conflict");
        Ok(true)
    }

    /// Re-derive a file both flows touched by replaying the source-side
    /// changes made since the crossing flow on top of the flow side.
    async fn resolve_crossing(
        &self,
        request: &MergeRequest<'_>,
        crossing: &Codeflow,
        file: &str,
        relative: &str,
    ) -> Result<bool, ConflictError> {
        let repo = request.repo;
        let current = request.current_flow;
        let name = format!(
            "{}-{}-{}-crossing.patch",
            request.mapping.name,
            short_sha(crossing.source_sha()),
            short_sha(current.source_sha())
        );
        let patch_name = self.patches.patch_path(&name)?;

        let patch_request = if request.target_is_vmr() {
            PatchRequest {
                patch_name,
                sha1: crossing.repo_sha.clone(),
                sha2: current.repo_sha.clone(),
                path: Some(relative.to_string()),
                filters: PatchFilters::default(),
                relative: false,
                working_dir: request.source_repo.path().to_path_buf(),
                application_path: Some(self.config.vmr.mapping_dir(&request.mapping.name)),
            }
        } else {
            PatchRequest {
                patch_name,
                sha1: crossing.vmr_sha.clone(),
                sha2: current.vmr_sha.clone(),
                path: Some(relative.to_string()),
                filters: PatchFilters::default(),
                relative: true,
                working_dir: request
                    .source_repo
                    .path()
                    .join(self.config.vmr.mapping_dir(&request.mapping.name)),
                application_path: None,
            }
        };
        let patch = self
            .patches
            .create_patch(request.source_repo, &patch_request)
            .await?;

        let output = repo.checkout_conflict_side(file, request.flow_side).await?;
        if !output.succeeded() {
            debug!(file, stderr = %output.stderr.trim(), "flow side has no version of the file");
            self.patches.cleanup(std::slice::from_ref(&patch));
            return Ok(false);
        }

        let empty = std::fs::metadata(&patch.path).map(|m| m.len() == 0).unwrap_or(true);
        if empty {
            repo.stage(&[file]).await?;
            self.patches.cleanup(std::slice::from_ref(&patch));
            info!(file, "file has not changed since the crossing flow, keeping the flow side");
            return Ok(true);
        }

        let options = ApplyOptions {
            keep_conflicts: true,
            ..ApplyOptions::default()
        };
        let applied = self.patches.apply_patch(&patch, repo, options).await;
        self.patches.cleanup(std::slice::from_ref(&patch));
        match applied {
            Ok(conflicts) if conflicts.is_empty() => {
                repo.stage(&[file]).await?;
                info!(file, "resolved conflict caused by a crossing flow");
                Ok(true)
            }
            result => {
                if let Err(e) = &result {
                    debug!(file, error = %e, "crossing flow patch does not apply");
                }
                repo.run_git(&["checkout", "--conflict=merge", "--", file]).await?;
                Ok(false)
            }
        }
    }

    async fn abort(&self, repo: &LocalGitRepo, branch: &str) -> Result<(), ConflictError> {
        let output = repo.run_git(&["merge", "--abort"]).await?;
        if !output.succeeded() {
            return Err(ConflictError::AbortFailed {
                branch: branch.to_string(),
                stderr: output.stderr.trim().to_string(),
            });
        }
        debug!(branch, "merge aborted");
        Ok(())
    }
}
