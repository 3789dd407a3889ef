//! The direction-specific half of a flow.
//!
//! The orchestrator only decides *what kind* of flow to make; a
//! [`FlowStrategy`] knows how to make it in its direction.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::PatchConfig;
use crate::conflict::{ConflictResolver, MergeRequest};
use crate::errors::CodeflowError;
use crate::git::{ConflictSide, LocalGitRepo};
use crate::mapping::SourceMapping;
use crate::models::{Build, Codeflow, FlowDirection, LastFlows};
use crate::patch::PatchFilters;

/// Everything a strategy needs to know about the flow being made.
#[derive(Debug, Clone, Copy)]
pub struct FlowContext<'a> {
    pub mapping: &'a SourceMapping,
    pub vmr: &'a LocalGitRepo,
    /// Clone of the component repository.
    pub repo: &'a LocalGitRepo,
    pub build: &'a Build,
    pub current_flow: &'a Codeflow,
    pub target_branch: &'a str,
    pub head_branch: &'a str,
    pub cancel: &'a CancellationToken,
}

impl FlowContext<'_> {
    /// Repository the flow lands in.
    pub fn target_repo(&self) -> &LocalGitRepo {
        match self.current_flow.direction {
            FlowDirection::Forward => self.vmr,
            FlowDirection::Backflow => self.repo,
        }
    }

    /// Repository the flow originates from.
    pub fn source_repo(&self) -> &LocalGitRepo {
        match self.current_flow.direction {
            FlowDirection::Forward => self.repo,
            FlowDirection::Backflow => self.vmr,
        }
    }

    pub fn ensure_not_cancelled(&self) -> Result<(), CodeflowError> {
        if self.cancel.is_cancelled() {
            return Err(CodeflowError::Cancelled);
        }
        Ok(())
    }
}

#[async_trait]
pub trait FlowStrategy: Send + Sync {
    fn direction(&self) -> FlowDirection;

    fn target_is_vmr(&self) -> bool {
        self.direction() == FlowDirection::Forward
    }

    /// The last flow of this direction when the last flows of both
    /// directions crossed each other.
    async fn detect_crossing_flow(
        &self,
        ctx: &FlowContext<'_>,
        last_flow: &Codeflow,
        last_backflow: Option<&Codeflow>,
        last_forward_flow: &Codeflow,
    ) -> Result<Option<Codeflow>, CodeflowError>;

    /// Refuse to flow a commit that does not descend from the one flowed
    /// last in this direction.
    async fn ensure_linearity(&self, ctx: &FlowContext<'_>, last_flows: &LastFlows) -> Result<(), CodeflowError>;

    /// Flow the changes made since the last flow, which went in this same
    /// direction. With `recreate`, the last flow is replayed from its own
    /// base and the head branch is reset onto the result.
    async fn same_direction_flow(
        &self,
        ctx: &FlowContext<'_>,
        last_flows: &LastFlows,
        recreate: bool,
    ) -> Result<bool, CodeflowError>;

    /// Resynchronize the whole tree after a flow in the other direction.
    async fn opposite_direction_flow(&self, ctx: &FlowContext<'_>, last_flows: &LastFlows) -> Result<bool, CodeflowError>;

    /// The flows as they were before the last flow of this direction, or
    /// `None` when there is no earlier flow to go back to.
    async fn unwind_previous_flow(
        &self,
        ctx: &FlowContext<'_>,
        last_flows: &LastFlows,
    ) -> Result<Option<LastFlows>, CodeflowError>;
}

/// Pathspecs selecting every flowed file of a tree for removal. `root` is
/// the directory the mapping lives in, `None` for the repository root.
pub(crate) fn removal_pathspecs(filters: &PatchFilters, root: Option<&str>, config: &PatchConfig) -> Vec<String> {
    let mut specs = Vec::new();
    if filters.includes.is_empty() {
        specs.push(match root {
            Some(root) => format!(":(top){root}"),
            None => ":/".to_string(),
        });
    }
    specs.extend(filters.pathspecs(config, true));
    specs
}

/// Bring the work branch into the head branch. A head branch the work
/// branch descends from is fast-forwarded; anything else goes through the
/// conflict resolver. The work branch is deleted once merged.
pub(crate) async fn merge_work_branch(
    ctx: &FlowContext<'_>,
    resolver: &ConflictResolver,
    work_branch: &str,
) -> Result<(), CodeflowError> {
    let target = ctx.target_repo();
    target.checkout(ctx.head_branch).await?;

    if target.is_ancestor(ctx.head_branch, work_branch)? {
        debug!(work_branch, head = ctx.head_branch, "fast-forwarding head branch");
        target.git(&["merge", "-q", "--ff-only", work_branch]).await?;
    } else {
        let outcome = resolver
            .try_merge(MergeRequest {
                repo: target,
                source_repo: ctx.source_repo(),
                mapping: ctx.mapping,
                head_branch: ctx.head_branch,
                branch: work_branch,
                flow_side: ConflictSide::Theirs,
                version_files_side: ConflictSide::Ours,
                current_flow: ctx.current_flow,
                crossing_flow: None,
            })
            .await?;
        if !outcome.is_success() {
            info!(work_branch, "work branch left for manual resolution");
            return Err(CodeflowError::UnresolvableConflict {
                branch: work_branch.to_string(),
                files: outcome.conflicted_files,
                source: None,
            });
        }
    }

    target.delete_branch(work_branch).await?;
    Ok(())
}

/// Put the head branch where the recreated flow left the work branch.
pub(crate) async fn reset_head_to_work_branch(ctx: &FlowContext<'_>, work_branch: &str) -> Result<(), CodeflowError> {
    let target = ctx.target_repo();
    info!(head = ctx.head_branch, work_branch, "resetting head branch onto the recreated flow");
    target.create_branch(ctx.head_branch, work_branch, true).await?;
    target.delete_branch(work_branch).await?;
    Ok(())
}

/// Return the target repository to the head branch after a failed flow.
pub(crate) async fn discard_work_branch(ctx: &FlowContext<'_>, work_branch: &str) -> Result<(), CodeflowError> {
    let target = ctx.target_repo();
    target.reset_working_tree().await?;
    target.force_checkout(ctx.head_branch).await?;
    target.delete_branch(work_branch).await?;
    Ok(())
}
