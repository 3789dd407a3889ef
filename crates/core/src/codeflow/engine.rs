//! The entry point of the crate: one call per flow.
//!
//! [`CodeflowEngine`] prepares the repositories, works out the last flows,
//! runs the orchestrator with the strategy of the requested direction and
//! finishes with the target branch merge and the dependency file updates.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, instrument, warn, Instrument};
use uuid::Uuid;

use super::backflow::BackflowStrategy;
use super::forward::ForwardStrategy;
use super::last_flows::LastFlowResolver;
use super::orchestrator::{flow_code, FlowOutcome};
use super::strategy::{FlowContext, FlowStrategy};
use crate::clone_manager::CloneManager;
use crate::comments::{Comment, CommentCollector};
use crate::config::CodeflowConfig;
use crate::conflict::{ConflictResolver, MergeRequest};
use crate::errors::{CodeflowError, GitError, ManifestError};
use crate::git::{ConflictSide, GitObjectType, LocalGitRepo, RepoFactory};
use crate::lock::{execute_with_lock, DistributedLock, FlowCache, NoopCache, NoopLock};
use crate::mapping::{SourceMapping, SourceMappings};
use crate::models::{short_sha, Build, Codeflow, FlowDirection, LastFlows};
use crate::patch::PatchHandler;
use crate::version_files::{
    BackflowDependencyUpdater, BackflowUpdateRequest, DependencyUpdate, FileRevisions, JsonFileMerger,
    VersionDetailsMerger, JSON_VERSION_FILES, VERSION_DETAILS_XML,
};

/// A flow to make.
#[derive(Debug, Clone)]
pub struct FlowRequest {
    pub mapping: String,
    /// Build of the commit being flowed. For a forward flow it was built
    /// from the repository, for a backflow from the VMR.
    pub build: Build,
    pub target_branch: String,
    /// Branch the flow is made on. Created from the target branch when it
    /// does not exist yet.
    pub head_branch: String,
    /// Assets whose dependencies a backflow leaves alone.
    pub excluded_assets: Vec<String>,
    /// Local clone of the component repository. The mapping's default
    /// remote is cloned when absent.
    pub repo_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CodeflowResult {
    /// Identifies the run in logs.
    pub flow_id: String,
    pub had_updates: bool,
    /// Files left conflicted by the merge of the target branch. The merge
    /// was aborted and the flow's commits stay on the head branch.
    pub conflicted_files: Vec<String>,
    pub recreated_previous_flows: bool,
    pub dependency_updates: Vec<DependencyUpdate>,
    pub comments: Vec<Comment>,
    pub head_branch: String,
}

pub struct CodeflowEngine {
    config: Arc<CodeflowConfig>,
    factory: RepoFactory,
    clones: Arc<CloneManager>,
    patches: Arc<PatchHandler>,
    resolver: Arc<ConflictResolver>,
    last_flows: Arc<LastFlowResolver>,
    lock: Arc<dyn DistributedLock>,
    cache: Arc<dyn FlowCache>,
}

impl CodeflowEngine {
    pub fn new(config: CodeflowConfig) -> Self {
        let config = Arc::new(config);
        let factory = RepoFactory::from_config(&config);
        let clones = Arc::new(CloneManager::new(config.vmr.tmp_path.clone(), factory.clone()));
        let patches = Arc::new(PatchHandler::new(config.clone(), clones.clone()));
        let resolver = Arc::new(ConflictResolver::new(config.clone(), patches.clone()));
        let last_flows = Arc::new(LastFlowResolver::new(config.clone()));
        Self {
            config,
            factory,
            clones,
            patches,
            resolver,
            last_flows,
            lock: Arc::new(NoopLock),
            cache: Arc::new(NoopCache),
        }
    }

    pub fn with_lock(mut self, lock: Arc<dyn DistributedLock>) -> Self {
        self.lock = lock;
        self
    }

    pub fn with_cache(mut self, cache: Arc<dyn FlowCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn config(&self) -> &CodeflowConfig {
        &self.config
    }

    pub fn clones(&self) -> &CloneManager {
        &self.clones
    }

    fn lock_key(request: &FlowRequest) -> String {
        format!("codeflow:{}:{}", request.mapping, request.head_branch)
    }

    fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.config.codeflow.lock_ttl_secs)
    }

    /// Flow a commit of the component repository into the VMR.
    pub async fn flow_forward(
        &self,
        request: &FlowRequest,
        cancel: &CancellationToken,
    ) -> Result<CodeflowResult, CodeflowError> {
        let flow_id = Uuid::new_v4().to_string();
        let span = info_span!("flow", flow_id = %flow_id);
        let mut result = execute_with_lock(self.lock.as_ref(), &Self::lock_key(request), self.lock_ttl(), || {
            self.run_forward(request, cancel).instrument(span)
        })
        .await?;
        result.flow_id = flow_id;
        Ok(result)
    }

    /// Flow a commit of the VMR back into the component repository.
    pub async fn flow_back(
        &self,
        request: &FlowRequest,
        cancel: &CancellationToken,
    ) -> Result<CodeflowResult, CodeflowError> {
        let flow_id = Uuid::new_v4().to_string();
        let span = info_span!("flow", flow_id = %flow_id);
        let mut result = execute_with_lock(self.lock.as_ref(), &Self::lock_key(request), self.lock_ttl(), || {
            self.run_backflow(request, cancel).instrument(span)
        })
        .await?;
        result.flow_id = flow_id;
        Ok(result)
    }

    /// The last flows between the checked out VMR and a local clone of
    /// the mapping's repository, as a flow in `direction` would see them.
    pub async fn inspect_last_flows(
        &self,
        mapping: &str,
        repo_path: &Path,
        direction: FlowDirection,
    ) -> Result<LastFlows, CodeflowError> {
        let vmr = self.open_vmr(&self.factory)?;
        let repo = self.clones.register_clone(repo_path)?;
        let current = match direction {
            FlowDirection::Forward => Codeflow::forward(repo.head_sha()?, vmr.head_sha()?),
            FlowDirection::Backflow => Codeflow::backflow(vmr.head_sha()?, repo.head_sha()?),
        };
        let flows = self
            .cached_last_flows(mapping, &vmr, "HEAD", &repo, "HEAD", &current)
            .await?;
        Ok(flows)
    }

    // -----------------------------------------------------------------------
    // Forward flow
    // -----------------------------------------------------------------------

    #[instrument(skip_all, fields(mapping = %request.mapping, build = request.build.id, head = %request.head_branch))]
    async fn run_forward(
        &self,
        request: &FlowRequest,
        cancel: &CancellationToken,
    ) -> Result<CodeflowResult, CodeflowError> {
        let comments = CommentCollector::new();
        let factory = self.factory.with_cancellation(cancel.clone());
        let vmr = self.open_vmr(&factory)?;

        let head_existed = prepare_head_branch(&vmr, &request.head_branch, &request.target_branch).await?;
        let mapping = self.load_mapping(&vmr, "HEAD", &request.mapping)?;
        if mapping.disable_synchronization {
            return Ok(disabled_result(&mapping, request, &comments));
        }

        let repo = match &request.repo_path {
            Some(path) => self.clones.register_clone(path)?,
            None => {
                self.clones
                    .prepare_clone(
                        &mapping.name,
                        &[mapping.default_remote.clone()],
                        &[request.build.commit.clone()],
                        &request.build.commit,
                        false,
                        cancel,
                    )
                    .await?
            }
        };
        let repo_sha = repo.resolve_commit(&request.build.commit)?;
        let current = Codeflow::forward(repo_sha, vmr.head_sha()?);
        info!(flow = %current, "starting forward flow");

        let last_flows = self
            .cached_last_flows(&mapping.name, &vmr, "HEAD", &repo, &current.repo_sha, &current)
            .await?;

        let strategy = ForwardStrategy::new(
            self.config.clone(),
            self.patches.clone(),
            self.resolver.clone(),
            self.last_flows.clone(),
        );
        let ctx = FlowContext {
            mapping: &mapping,
            vmr: &vmr,
            repo: &repo,
            build: &request.build,
            current_flow: &current,
            target_branch: &request.target_branch,
            head_branch: &request.head_branch,
            cancel,
        };
        let outcome = self.run_strategy(&strategy, &ctx, last_flows).await?;
        let mut result = CodeflowResult {
            had_updates: outcome.had_changes,
            recreated_previous_flows: outcome.recreated_previous_flows,
            head_branch: request.head_branch.clone(),
            ..CodeflowResult::default()
        };
        if !outcome.had_changes {
            result.comments = comments.take();
            return Ok(result);
        }

        result.conflicted_files = self.merge_target_branch(&ctx, head_existed, &outcome, &comments).await?;
        if result.conflicted_files.is_empty() {
            result.dependency_updates = self.merge_forward_version_files(&ctx, &outcome.last_flows, &comments).await?;
        }
        result.comments = comments.take();
        info!(
            recreated = result.recreated_previous_flows,
            conflicts = result.conflicted_files.len(),
            "forward flow finished"
        );
        Ok(result)
    }

    /// Merge the version files of the repository into their copies under
    /// the mapping's directory of the VMR.
    async fn merge_forward_version_files(
        &self,
        ctx: &FlowContext<'_>,
        last_flows: &LastFlows,
        comments: &CommentCollector,
    ) -> Result<Vec<DependencyUpdate>, CodeflowError> {
        let last = &last_flows.last_flow;
        let mapping_dir = self.config.vmr.mapping_dir(&ctx.mapping.name);

        let json = JsonFileMerger::new(comments.clone()).preferring_source();
        for file in JSON_VERSION_FILES {
            let vmr_path = format!("{mapping_dir}/{file}");
            json.merge(
                FileRevisions {
                    repo: ctx.vmr,
                    path: &vmr_path,
                    previous: &last.vmr_sha,
                    current: ctx.target_branch,
                },
                FileRevisions {
                    repo: ctx.repo,
                    path: file,
                    previous: &last.repo_sha,
                    current: &ctx.current_flow.repo_sha,
                },
            )
            .await?;
        }

        let vmr_path = format!("{mapping_dir}/{VERSION_DETAILS_XML}");
        let updates = VersionDetailsMerger::new(comments.clone())
            .merge(
                FileRevisions {
                    repo: ctx.vmr,
                    path: &vmr_path,
                    previous: &last.vmr_sha,
                    current: ctx.target_branch,
                },
                FileRevisions {
                    repo: ctx.repo,
                    path: VERSION_DETAILS_XML,
                    previous: &last.repo_sha,
                    current: &ctx.current_flow.repo_sha,
                },
            )
            .await?;

        if ctx.vmr.has_staged_changes().await? {
            ctx.ensure_not_cancelled()?;
            let mut message = format!(
                "[{}] Update dependencies from {}\n",
                ctx.mapping.name,
                short_sha(&ctx.current_flow.repo_sha)
            );
            if !updates.is_empty() {
                message.push('\n');
                for update in &updates {
                    message.push_str(&format!("- {}\n", update.describe()));
                }
            }
            let sha = ctx.vmr.commit(&message, false).await?;
            info!(sha = short_sha(&sha), updates = updates.len(), "committed version file merge");
        }
        Ok(updates)
    }

    // -----------------------------------------------------------------------
    // Backflow
    // -----------------------------------------------------------------------

    #[instrument(skip_all, fields(mapping = %request.mapping, build = request.build.id, head = %request.head_branch))]
    async fn run_backflow(
        &self,
        request: &FlowRequest,
        cancel: &CancellationToken,
    ) -> Result<CodeflowResult, CodeflowError> {
        let comments = CommentCollector::new();
        let factory = self.factory.with_cancellation(cancel.clone());
        let vmr = self.open_vmr(&factory)?;

        let vmr_sha = vmr.resolve_commit(&request.build.commit)?;
        let mapping = self.load_mapping(&vmr, &vmr_sha, &request.mapping)?;
        if mapping.disable_synchronization {
            return Ok(disabled_result(&mapping, request, &comments));
        }

        let repo = self.prepare_backflow_clone(&mapping, request, cancel).await?;
        let head_existed = prepare_head_branch(&repo, &request.head_branch, &request.target_branch).await?;
        let current = Codeflow::backflow(vmr_sha, repo.head_sha()?);
        info!(flow = %current, "starting backflow");

        let last_flows = self
            .cached_last_flows(&mapping.name, &vmr, &current.vmr_sha, &repo, "HEAD", &current)
            .await?;

        let strategy = BackflowStrategy::new(
            self.config.clone(),
            self.patches.clone(),
            self.resolver.clone(),
            self.last_flows.clone(),
        );
        let ctx = FlowContext {
            mapping: &mapping,
            vmr: &vmr,
            repo: &repo,
            build: &request.build,
            current_flow: &current,
            target_branch: &request.target_branch,
            head_branch: &request.head_branch,
            cancel,
        };
        let outcome = self.run_strategy(&strategy, &ctx, last_flows).await?;
        let mut result = CodeflowResult {
            had_updates: outcome.had_changes,
            recreated_previous_flows: outcome.recreated_previous_flows,
            head_branch: request.head_branch.clone(),
            ..CodeflowResult::default()
        };

        if outcome.had_changes {
            result.conflicted_files = self.merge_target_branch(&ctx, head_existed, &outcome, &comments).await?;
            if !result.conflicted_files.is_empty() {
                result.comments = comments.take();
                return Ok(result);
            }
        }

        self.merge_backflow_json_files(&ctx, &outcome.last_flows, &comments).await?;
        let updater = BackflowDependencyUpdater::new(self.config.clone(), comments.clone());
        result.dependency_updates = updater
            .update(BackflowUpdateRequest {
                mapping: &mapping.name,
                repo: &repo,
                vmr: &vmr,
                target_branch: &request.target_branch,
                build: &request.build,
                excluded_assets: &request.excluded_assets,
                last_flow: &outcome.last_flows.last_flow,
                current_flow: &current,
            })
            .await?;

        // JSON merges the updater did not commit.
        if repo.has_staged_changes().await? {
            ctx.ensure_not_cancelled()?;
            repo.commit(
                &format!("Update version files from {}", short_sha(&current.vmr_sha)),
                false,
            )
            .await?;
        }

        result.had_updates |= !result.dependency_updates.is_empty();
        result.comments = comments.take();
        info!(
            had_updates = result.had_updates,
            dependency_updates = result.dependency_updates.len(),
            "backflow finished"
        );
        Ok(result)
    }

    async fn prepare_backflow_clone(
        &self,
        mapping: &SourceMapping,
        request: &FlowRequest,
        cancel: &CancellationToken,
    ) -> Result<LocalGitRepo, CodeflowError> {
        if let Some(path) = &request.repo_path {
            return Ok(self.clones.register_clone(path)?);
        }

        let remotes = [mapping.default_remote.clone()];
        let repo = self
            .clones
            .prepare_clone(
                &mapping.name,
                &remotes,
                &[request.target_branch.clone()],
                &request.target_branch,
                true,
                cancel,
            )
            .await?;
        // An existing head branch only known remotely is tracked locally.
        if !repo.branch_exists(&request.head_branch)?
            && repo.object_type(&request.head_branch)? == GitObjectType::RemoteRef
        {
            return Ok(self
                .clones
                .prepare_clone(&mapping.name, &remotes, &[], &request.head_branch, true, cancel)
                .await?);
        }
        Ok(repo)
    }

    /// Merge the JSON version files of the mapping's VMR directory into the
    /// repository. Changes are staged for the dependency commit.
    async fn merge_backflow_json_files(
        &self,
        ctx: &FlowContext<'_>,
        last_flows: &LastFlows,
        comments: &CommentCollector,
    ) -> Result<(), CodeflowError> {
        let last = &last_flows.last_flow;
        let mapping_dir = self.config.vmr.mapping_dir(&ctx.mapping.name);
        let json = JsonFileMerger::new(comments.clone());
        for file in JSON_VERSION_FILES {
            let vmr_path = format!("{mapping_dir}/{file}");
            let changed = json
                .merge(
                    FileRevisions {
                        repo: ctx.repo,
                        path: file,
                        previous: &last.repo_sha,
                        current: ctx.target_branch,
                    },
                    FileRevisions {
                        repo: ctx.vmr,
                        path: &vmr_path,
                        previous: &last.vmr_sha,
                        current: &ctx.current_flow.vmr_sha,
                    },
                )
                .await?;
            if changed {
                debug!(file, "merged version file");
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Shared steps
    // -----------------------------------------------------------------------

    fn open_vmr(&self, factory: &RepoFactory) -> Result<LocalGitRepo, CodeflowError> {
        let vmr = factory.create(&self.config.vmr.path);
        if !vmr.exists() {
            return Err(GitError::RepositoryNotFound(self.config.vmr.path.display().to_string()).into());
        }
        Ok(vmr)
    }

    /// The mapping as defined in the VMR at `reference`.
    fn load_mapping(&self, vmr: &LocalGitRepo, reference: &str, name: &str) -> Result<SourceMapping, CodeflowError> {
        let path = self.config.vmr.source_mappings.as_str();
        let content = vmr
            .file_at_ref(path, reference)?
            .ok_or_else(|| ManifestError::MappingNotFound(name.to_string()))?;
        Ok(SourceMappings::parse(&content)?.get(name)?.clone())
    }

    async fn run_strategy(
        &self,
        strategy: &dyn FlowStrategy,
        ctx: &FlowContext<'_>,
        last_flows: LastFlows,
    ) -> Result<FlowOutcome, CodeflowError> {
        let crossing_flow = strategy
            .detect_crossing_flow(
                ctx,
                &last_flows.last_flow,
                last_flows.last_backflow.as_ref(),
                &last_flows.last_forward_flow,
            )
            .await?;
        if let Some(crossing) = &crossing_flow {
            info!(crossing = %crossing, "flows crossed each other");
        }
        let last_flows = LastFlows {
            crossing_flow,
            ..last_flows
        };
        flow_code(strategy, ctx, &last_flows, self.config.codeflow.max_recreation_depth).await
    }

    /// Merge the target branch into the head branch after a flow. Returns
    /// the files no rule could resolve.
    async fn merge_target_branch(
        &self,
        ctx: &FlowContext<'_>,
        head_existed: bool,
        outcome: &FlowOutcome,
        comments: &CommentCollector,
    ) -> Result<Vec<String>, CodeflowError> {
        if ctx.head_branch == ctx.target_branch {
            return Ok(Vec::new());
        }

        let flows = &outcome.last_flows;
        let crossing_flow = match (&flows.crossing_flow, ctx.current_flow.direction) {
            (Some(crossing), _) => Some(crossing.clone()),
            (None, _) if !outcome.recreated_previous_flows => None,
            (None, FlowDirection::Forward) => Some(flows.last_forward_flow.clone()),
            (None, FlowDirection::Backflow) => flows.last_backflow.clone(),
        };

        let target = ctx.target_repo();
        target.checkout(ctx.head_branch).await?;
        let merge = self
            .resolver
            .try_merge(MergeRequest {
                repo: target,
                source_repo: ctx.source_repo(),
                mapping: ctx.mapping,
                head_branch: ctx.head_branch,
                branch: ctx.target_branch,
                flow_side: ConflictSide::Ours,
                version_files_side: if head_existed { ConflictSide::Ours } else { ConflictSide::Theirs },
                current_flow: ctx.current_flow,
                crossing_flow: crossing_flow.as_ref(),
            })
            .await?;

        if !merge.is_success() {
            warn!(files = ?merge.conflicted_files, "target branch conflicts with the flow");
            comments.warning(format!(
                "There were conflicts when merging {} into {}: {}. The merge was aborted and needs manual resolution.",
                ctx.target_branch,
                ctx.head_branch,
                merge.conflicted_files.join(", ")
            ));
        } else if !merge.auto_resolved.is_empty() {
            comments.information(format!(
                "Conflicts with {} were resolved automatically in: {}",
                ctx.target_branch,
                merge.auto_resolved.join(", ")
            ));
        }
        Ok(merge.conflicted_files)
    }

    /// Last flows, served from the cache when both heads are unchanged.
    async fn cached_last_flows(
        &self,
        mapping: &str,
        vmr: &LocalGitRepo,
        vmr_ref: &str,
        repo: &LocalGitRepo,
        repo_ref: &str,
        current: &Codeflow,
    ) -> Result<LastFlows, CodeflowError> {
        let key = format!(
            "last-flows:{}:{mapping}:{}:{}",
            current.direction,
            vmr.resolve_commit(vmr_ref)?,
            repo.resolve_commit(repo_ref)?
        );

        match self.cache.get(&key).await {
            Ok(Some(cached)) => match serde_json::from_str::<LastFlows>(&cached) {
                Ok(flows) => {
                    debug!(key = %key, "last flows served from cache");
                    return Ok(flows);
                }
                Err(e) => warn!(key = %key, error = %e, "ignoring unreadable cached last flows"),
            },
            Ok(None) => {}
            Err(e) => warn!(key = %key, error = %e, "last flow cache unavailable"),
        }

        let flows = self
            .last_flows
            .get_last_flows(mapping, vmr, vmr_ref, repo, repo_ref, current)
            .await?;

        match serde_json::to_string(&flows) {
            Ok(json) => {
                let ttl = Duration::from_secs(self.config.codeflow.cache_ttl_secs);
                if let Err(e) = self.cache.set(&key, json, ttl).await {
                    warn!(key = %key, error = %e, "failed to cache last flows");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize last flows"),
        }
        Ok(flows)
    }
}

/// Check out the head branch, creating it from the target branch when it
/// does not exist. Returns whether it existed.
async fn prepare_head_branch(repo: &LocalGitRepo, head: &str, target: &str) -> Result<bool, CodeflowError> {
    if repo.branch_exists(head)? {
        repo.checkout(head).await?;
        return Ok(true);
    }
    if repo.object_type(target)? != GitObjectType::Commit {
        return Err(CodeflowError::TargetBranchNotFound {
            branch: target.to_string(),
            repo: repo.path().display().to_string(),
        });
    }
    info!(head, target, "creating head branch");
    repo.create_branch(head, target, false).await?;
    Ok(false)
}

fn disabled_result(mapping: &SourceMapping, request: &FlowRequest, comments: &CommentCollector) -> CodeflowResult {
    info!(mapping = %mapping.name, "synchronization is disabled for the mapping");
    comments.information(format!(
        "Code flow is disabled for {}; nothing was flown.",
        mapping.name
    ));
    CodeflowResult {
        head_branch: request.head_branch.clone(),
        comments: comments.take(),
        ..CodeflowResult::default()
    }
}
