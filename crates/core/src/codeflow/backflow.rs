//! Backflows: from the VMR back into a component repository.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use super::last_flows::LastFlowResolver;
use super::strategy::{
    discard_work_branch, merge_work_branch, removal_pathspecs, reset_head_to_work_branch, FlowContext, FlowStrategy,
};
use crate::config::CodeflowConfig;
use crate::conflict::ConflictResolver;
use crate::errors::CodeflowError;
use crate::git::GitObjectType;
use crate::models::{short_sha, Codeflow, FlowDirection, LastFlows, EMPTY_TREE_SHA};
use crate::patch::{ApplyOptions, PatchFilters, PatchHandler, PatchRequest};
use crate::version_files::CODEFLOW_DEPENDENCY_FILES;

pub struct BackflowStrategy {
    config: Arc<CodeflowConfig>,
    patches: Arc<PatchHandler>,
    resolver: Arc<ConflictResolver>,
    last_flows: Arc<LastFlowResolver>,
}

impl BackflowStrategy {
    pub fn new(
        config: Arc<CodeflowConfig>,
        patches: Arc<PatchHandler>,
        resolver: Arc<ConflictResolver>,
        last_flows: Arc<LastFlowResolver>,
    ) -> Self {
        Self {
            config,
            patches,
            resolver,
            last_flows,
        }
    }

    /// Filters relative to the repository root. Besides the dependency
    /// files, the repository's own submodules are never written by a
    /// backflow.
    fn repo_filters(ctx: &FlowContext<'_>) -> Result<PatchFilters, CodeflowError> {
        let submodules = ctx.repo.submodules_at("HEAD")?;
        Ok(PatchFilters::for_mapping(ctx.mapping)
            .with_hard_excludes(CODEFLOW_DEPENDENCY_FILES.iter().copied())
            .with_hard_excludes(submodules.into_iter().map(|s| s.path)))
    }

    /// Diff the mapping's directory of the VMR between `from` and the
    /// current flow, apply it on the checked-out work branch and commit.
    /// Returns whether anything was committed.
    async fn flow_vmr_changes(
        &self,
        ctx: &FlowContext<'_>,
        work_branch: &str,
        filters: &PatchFilters,
        from: &str,
    ) -> Result<bool, CodeflowError> {
        let name = ctx.mapping.name.as_str();
        let mapping_dir = self.config.vmr.mapping_dir(name);
        let to = ctx.current_flow.vmr_sha.as_str();

        let request = PatchRequest {
            patch_name: self
                .patches
                .patch_path(&format!("{name}-backflow-{}-{}.patch", short_sha(from), short_sha(to)))?,
            sha1: from.to_string(),
            sha2: to.to_string(),
            path: None,
            filters: filters.prefixed(&mapping_dir),
            relative: true,
            working_dir: ctx.vmr.path().join(&mapping_dir),
            application_path: None,
        };

        let patches = match self.patches.create_split_patches(ctx.vmr, request).await {
            Ok(patches) => patches,
            Err(e) => {
                discard_work_branch(ctx, work_branch).await?;
                return Err(e.into());
            }
        };
        let applied = self
            .patches
            .apply_patches(&patches, ctx.repo, ApplyOptions::cached(), ctx.cancel)
            .await;
        self.patches.cleanup(&patches);
        if let Err(e) = applied {
            warn!(work_branch, error = %e, "failed to apply backflow patches");
            discard_work_branch(ctx, work_branch).await?;
            return Err(e.into());
        }

        ctx.ensure_not_cancelled()?;
        if !ctx.repo.has_staged_changes().await? {
            debug!("backflow brought no changes");
            return Ok(false);
        }

        let range = if from == EMPTY_TREE_SHA {
            short_sha(to).to_string()
        } else {
            format!("{}..{}", short_sha(from), short_sha(to))
        };
        let sha = ctx
            .repo
            .commit(&format!("[VMR] Code backflow {range}\n\nFrom VMR build {}", ctx.build.build_number), false)
            .await?;
        info!(sha = short_sha(&sha), "committed backflow");
        Ok(true)
    }

    /// Finish a flow whose work branch may carry no commits.
    async fn land_work_branch(
        &self,
        ctx: &FlowContext<'_>,
        work_branch: &str,
        committed: bool,
        recreate: bool,
    ) -> Result<(), CodeflowError> {
        if recreate {
            reset_head_to_work_branch(ctx, work_branch).await
        } else if committed {
            merge_work_branch(ctx, &self.resolver, work_branch).await
        } else {
            discard_work_branch(ctx, work_branch).await
        }
    }
}

#[async_trait]
impl FlowStrategy for BackflowStrategy {
    fn direction(&self) -> FlowDirection {
        FlowDirection::Backflow
    }

    async fn detect_crossing_flow(
        &self,
        ctx: &FlowContext<'_>,
        last_flow: &Codeflow,
        last_backflow: Option<&Codeflow>,
        _last_forward_flow: &Codeflow,
    ) -> Result<Option<Codeflow>, CodeflowError> {
        let Some(last_backflow) = last_backflow else {
            return Ok(None);
        };
        if !last_flow.is_forward() {
            return Ok(None);
        }
        // The last forward flow was made from a repository commit that
        // already held the last backflow.
        if ctx.repo.is_ancestor(&last_flow.repo_sha, &last_backflow.repo_sha)? {
            Ok(Some(last_backflow.clone()))
        } else {
            Ok(None)
        }
    }

    async fn ensure_linearity(&self, ctx: &FlowContext<'_>, last_flows: &LastFlows) -> Result<(), CodeflowError> {
        let Some(last_backflow) = &last_flows.last_backflow else {
            return Ok(());
        };
        let current_sha = &ctx.current_flow.vmr_sha;
        if !ctx.vmr.is_ancestor(&last_backflow.vmr_sha, current_sha)? {
            return Err(CodeflowError::NonLinearCodeflow {
                last_sha: last_backflow.vmr_sha.clone(),
                current_sha: current_sha.clone(),
            });
        }
        Ok(())
    }

    #[instrument(skip_all, fields(mapping = %ctx.mapping.name, recreate))]
    async fn same_direction_flow(
        &self,
        ctx: &FlowContext<'_>,
        last_flows: &LastFlows,
        recreate: bool,
    ) -> Result<bool, CodeflowError> {
        let last = &last_flows.last_flow;
        let work_branch = ctx.current_flow.work_branch_name();
        let base = if recreate { last.repo_sha.as_str() } else { ctx.head_branch };
        info!(
            from = short_sha(&last.vmr_sha),
            to = short_sha(&ctx.current_flow.vmr_sha),
            base,
            "flowing VMR changes back into the repository"
        );

        ctx.repo.create_branch(&work_branch, base, true).await?;
        let filters = Self::repo_filters(ctx)?;
        let committed = self.flow_vmr_changes(ctx, &work_branch, &filters, &last.vmr_sha).await?;
        self.land_work_branch(ctx, &work_branch, committed, recreate).await?;
        Ok(committed)
    }

    #[instrument(skip_all, fields(mapping = %ctx.mapping.name))]
    async fn opposite_direction_flow(&self, ctx: &FlowContext<'_>, last_flows: &LastFlows) -> Result<bool, CodeflowError> {
        let last = &last_flows.last_flow;
        let work_branch = ctx.current_flow.work_branch_name();
        info!(
            base = short_sha(&last.repo_sha),
            to = short_sha(&ctx.current_flow.vmr_sha),
            "resynchronizing the repository after a forward flow"
        );

        ctx.repo.create_branch(&work_branch, &last.repo_sha, true).await?;
        let filters = Self::repo_filters(ctx)?;

        // Everything the VMR owns is rebuilt from the VMR's tree.
        let specs = removal_pathspecs(&filters, None, &self.config.patches);
        let mut args = vec!["rm", "-r", "-q", "-f", "--ignore-unmatch", "--"];
        args.extend(specs.iter().map(String::as_str));
        ctx.repo.git(&args).await?;

        let committed = self.flow_vmr_changes(ctx, &work_branch, &filters, EMPTY_TREE_SHA).await?;
        self.land_work_branch(ctx, &work_branch, committed, false).await?;
        Ok(committed)
    }

    async fn unwind_previous_flow(
        &self,
        ctx: &FlowContext<'_>,
        last_flows: &LastFlows,
    ) -> Result<Option<LastFlows>, CodeflowError> {
        let Some(last_backflow) = &last_flows.last_backflow else {
            return Ok(None);
        };
        let parent = format!("{}^", last_backflow.repo_sha);
        if ctx.repo.object_type(&parent)? != GitObjectType::Commit {
            debug!("last backflow has no parent commit");
            return Ok(None);
        }

        let Some(previous) = self.last_flows.last_backflow(ctx.repo, &parent).await? else {
            return Ok(None);
        };
        info!(previous = %previous, "unwound last backflow");
        Ok(Some(LastFlows {
            last_flow: previous.clone(),
            last_backflow: Some(previous),
            last_forward_flow: last_flows.last_forward_flow.clone(),
            crossing_flow: None,
        }))
    }
}
