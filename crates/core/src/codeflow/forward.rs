//! Forward flows: from a component repository into the VMR.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use super::last_flows::LastFlowResolver;
use super::strategy::{
    discard_work_branch, merge_work_branch, removal_pathspecs, reset_head_to_work_branch, FlowContext, FlowStrategy,
};
use crate::config::CodeflowConfig;
use crate::conflict::ConflictResolver;
use crate::errors::{CodeflowError, GitError};
use crate::git::GitObjectType;
use crate::manifest::{RepositoryRecord, SourceManifest};
use crate::models::{short_sha, Build, Codeflow, FlowDirection, LastFlows, EMPTY_OBJECT_SHA};
use crate::patch::{ApplyOptions, PatchFilters, PatchHandler, PatchSet};
use crate::version_files::CODEFLOW_DEPENDENCY_FILES;

pub struct ForwardStrategy {
    config: Arc<CodeflowConfig>,
    patches: Arc<PatchHandler>,
    resolver: Arc<ConflictResolver>,
    last_flows: Arc<LastFlowResolver>,
}

impl ForwardStrategy {
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

    /// Filters of the mapping as seen from the repository root. Dependency
    /// files are merged separately and never patched.
    fn repo_filters(ctx: &FlowContext<'_>) -> PatchFilters {
        PatchFilters::for_mapping(ctx.mapping).with_hard_excludes(CODEFLOW_DEPENDENCY_FILES.iter().copied())
    }

    /// Apply the patch set on the checked-out work branch, record the flow
    /// in the manifest and commit. The work branch is discarded when a
    /// patch does not apply.
    async fn commit_flow(
        &self,
        ctx: &FlowContext<'_>,
        work_branch: &str,
        set: &PatchSet,
        replace_submodules: bool,
        from_sha: &str,
    ) -> Result<(), CodeflowError> {
        let applied = self
            .patches
            .apply_patches(&set.patches, ctx.vmr, ApplyOptions::cached(), ctx.cancel)
            .await;
        self.patches.cleanup(&set.patches);
        if let Err(e) = applied {
            warn!(work_branch, error = %e, "failed to apply forward flow patches");
            discard_work_branch(ctx, work_branch).await?;
            return Err(e.into());
        }

        self.update_manifest(ctx, set, replace_submodules).await?;
        self.update_git_info(ctx).await?;
        ctx.ensure_not_cancelled()?;

        let sha = ctx
            .vmr
            .commit(&commit_message(ctx.mapping.name.as_str(), from_sha, ctx.current_flow, ctx.build), false)
            .await?;
        info!(sha = short_sha(&sha), "committed forward flow");
        Ok(())
    }

    async fn update_manifest(
        &self,
        ctx: &FlowContext<'_>,
        set: &PatchSet,
        replace_submodules: bool,
    ) -> Result<(), CodeflowError> {
        let name = ctx.mapping.name.as_str();
        let relative = self.config.vmr.source_manifest.as_str();
        let path = ctx.vmr.path().join(relative);
        let mut manifest = SourceManifest::load(&path)?;

        if replace_submodules {
            manifest.submodules.retain(|s| !s.belongs_to(name));
        }
        let remote_uri = if ctx.build.repository.is_empty() {
            ctx.mapping.default_remote.clone()
        } else {
            ctx.build.repository.clone()
        };
        manifest.update_repository(RepositoryRecord {
            path: name.to_string(),
            remote_uri,
            commit_sha: ctx.current_flow.repo_sha.clone(),
            package_version: ctx.build.package_version.clone(),
            bar_id: Some(ctx.build.id),
        });
        for submodule in &set.submodules {
            if submodule.commit_sha == EMPTY_OBJECT_SHA {
                manifest.remove_submodule(&submodule.path);
            } else {
                manifest.update_submodule(submodule.clone());
            }
        }

        manifest.save(&path)?;
        ctx.vmr.stage(&[relative]).await?;
        debug!(mapping = name, "source manifest updated");
        Ok(())
    }

    async fn update_git_info(&self, ctx: &FlowContext<'_>) -> Result<(), CodeflowError> {
        let Some(relative) = self.config.vmr.git_info_file(&ctx.mapping.name) else {
            return Ok(());
        };
        let path = ctx.vmr.path().join(&relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(GitError::from)?;
        }
        std::fs::write(&path, git_info_props(&ctx.current_flow.repo_sha, ctx.build))
            .map_err(GitError::from)?;
        ctx.vmr.stage(&[relative.as_str()]).await?;
        Ok(())
    }
}

#[async_trait]
impl FlowStrategy for ForwardStrategy {
    fn direction(&self) -> FlowDirection {
        FlowDirection::Forward
    }

    async fn detect_crossing_flow(
        &self,
        ctx: &FlowContext<'_>,
        last_flow: &Codeflow,
        _last_backflow: Option<&Codeflow>,
        last_forward_flow: &Codeflow,
    ) -> Result<Option<Codeflow>, CodeflowError> {
        if last_flow.is_forward() {
            return Ok(None);
        }
        // The last backflow was made from a VMR commit that already held the
        // last forward flow.
        if ctx.vmr.is_ancestor(&last_flow.vmr_sha, &last_forward_flow.vmr_sha)? {
            Ok(Some(last_forward_flow.clone()))
        } else {
            Ok(None)
        }
    }

    async fn ensure_linearity(&self, ctx: &FlowContext<'_>, last_flows: &LastFlows) -> Result<(), CodeflowError> {
        let last_sha = &last_flows.last_forward_flow.repo_sha;
        let current_sha = &ctx.current_flow.repo_sha;
        if !ctx.repo.is_ancestor(last_sha, current_sha)? {
            return Err(CodeflowError::NonLinearCodeflow {
                last_sha: last_sha.clone(),
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
        let base = if recreate { last.vmr_sha.as_str() } else { ctx.head_branch };
        info!(
            from = short_sha(&last.repo_sha),
            to = short_sha(&ctx.current_flow.repo_sha),
            base,
            "flowing repository changes into the VMR"
        );

        ctx.vmr.create_branch(&work_branch, base, true).await?;

        let set = match self
            .patches
            .create_patches(
                ctx.mapping,
                ctx.repo,
                &last.repo_sha,
                &ctx.current_flow.repo_sha,
                &Self::repo_filters(ctx),
                ctx.cancel,
            )
            .await
        {
            Ok(set) => set,
            Err(e) => {
                discard_work_branch(ctx, &work_branch).await?;
                return Err(e.into());
            }
        };

        self.commit_flow(ctx, &work_branch, &set, false, &last.repo_sha).await?;

        if recreate {
            reset_head_to_work_branch(ctx, &work_branch).await?;
        } else {
            merge_work_branch(ctx, &self.resolver, &work_branch).await?;
        }
        Ok(true)
    }

    #[instrument(skip_all, fields(mapping = %ctx.mapping.name))]
    async fn opposite_direction_flow(&self, ctx: &FlowContext<'_>, last_flows: &LastFlows) -> Result<bool, CodeflowError> {
        let last = &last_flows.last_flow;
        let work_branch = ctx.current_flow.work_branch_name();
        let mapping_dir = self.config.vmr.mapping_dir(&ctx.mapping.name);
        info!(
            base = short_sha(&last.vmr_sha),
            to = short_sha(&ctx.current_flow.repo_sha),
            "resynchronizing the mapping after a backflow"
        );

        ctx.vmr.create_branch(&work_branch, &last.vmr_sha, true).await?;

        // The mapping is rebuilt from scratch; everything flowed before goes.
        let filters = Self::repo_filters(ctx).prefixed(&mapping_dir);
        let specs = removal_pathspecs(&filters, Some(&mapping_dir), &self.config.patches);
        let mut args = vec!["rm", "-r", "-q", "-f", "--ignore-unmatch", "--"];
        args.extend(specs.iter().map(String::as_str));
        ctx.vmr.git(&args).await?;

        let set = match self
            .patches
            .create_patches(
                ctx.mapping,
                ctx.repo,
                EMPTY_OBJECT_SHA,
                &ctx.current_flow.repo_sha,
                &Self::repo_filters(ctx),
                ctx.cancel,
            )
            .await
        {
            Ok(set) => set,
            Err(e) => {
                discard_work_branch(ctx, &work_branch).await?;
                return Err(e.into());
            }
        };

        self.commit_flow(ctx, &work_branch, &set, true, EMPTY_OBJECT_SHA).await?;
        merge_work_branch(ctx, &self.resolver, &work_branch).await?;
        Ok(true)
    }

    async fn unwind_previous_flow(
        &self,
        ctx: &FlowContext<'_>,
        last_flows: &LastFlows,
    ) -> Result<Option<LastFlows>, CodeflowError> {
        let parent = format!("{}^", last_flows.last_forward_flow.vmr_sha);
        if ctx.vmr.object_type(&parent)? != GitObjectType::Commit {
            debug!("last forward flow has no parent commit");
            return Ok(None);
        }

        let Some(previous) = self
            .last_flows
            .last_forward_flow(ctx.vmr, &parent, &ctx.mapping.name)
            .await?
        else {
            return Ok(None);
        };
        info!(previous = %previous, "unwound last forward flow");
        Ok(Some(LastFlows {
            last_flow: previous.clone(),
            last_backflow: last_flows.last_backflow.clone(),
            last_forward_flow: previous,
            crossing_flow: None,
        }))
    }
}

fn commit_message(mapping: &str, from_sha: &str, flow: &Codeflow, build: &Build) -> String {
    let range = if from_sha == EMPTY_OBJECT_SHA {
        short_sha(&flow.repo_sha).to_string()
    } else {
        format!("{}..{}", short_sha(from_sha), short_sha(&flow.repo_sha))
    };
    let mut message = format!("[{mapping}] Source update {range}\n\n");
    if !build.repository.is_empty() {
        message.push_str(&format!("From: {}/commit/{}\n", build.repository, flow.repo_sha));
    }
    message.push_str(&format!("Build: {} ({})\n", build.build_number, build.id));
    message
}

/// MSBuild properties describing the flowed commit.
pub fn git_info_props(repo_sha: &str, build: &Build) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"utf-8\"?>\n\
         <Project>\n  \
           <PropertyGroup>\n    \
             <GitCommitHash>{repo_sha}</GitCommitHash>\n    \
             <OfficialBuildId>{}</OfficialBuildId>\n    \
             <OutputPackageVersion>{}</OutputPackageVersion>\n  \
           </PropertyGroup>\n\
         </Project>\n",
        build.build_number,
        build.package_version.as_deref().unwrap_or_default(),
    )
}
