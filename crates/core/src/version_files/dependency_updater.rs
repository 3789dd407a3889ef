//! Dependency updates carried by a backflow.
//!
//! The repository's `Version.Details.xml` is reconciled with the copy kept
//! in the VMR: assets produced by the flowed build always win, the rest is
//! decided by comparing what changed on each side since the last flow.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use super::details::{DependencyDetail, DependencyUpdate, SourceDependency, VersionDetails};
use super::merger::parse_optional;
use super::{ENG_COMMON_DIR, VERSION_DETAILS_XML};
use crate::comments::CommentCollector;
use crate::config::CodeflowConfig;
use crate::errors::VersionFileError;
use crate::git::{GitObjectType, LocalGitRepo};
use crate::models::{Build, Codeflow};

/// Inputs of one backflow dependency update.
#[derive(Debug, Clone, Copy)]
pub struct BackflowUpdateRequest<'a> {
    pub mapping: &'a str,
    /// Component repository, checked out on the branch receiving the flow.
    pub repo: &'a LocalGitRepo,
    pub vmr: &'a LocalGitRepo,
    pub target_branch: &'a str,
    pub build: &'a Build,
    pub excluded_assets: &'a [String],
    pub last_flow: &'a Codeflow,
    pub current_flow: &'a Codeflow,
}

pub struct BackflowDependencyUpdater {
    config: Arc<CodeflowConfig>,
    comments: CommentCollector,
}

/// Pair dependencies by name and keep the ones whose version, commit or
/// repository changed. Pinned and excluded dependencies are ignored.
pub fn compute_changes(before: &VersionDetails, after: &VersionDetails, excluded: &[String]) -> Vec<DependencyUpdate> {
    let before = before.to_map(excluded, false);
    let after = after.to_map(excluded, false);

    let mut changes = Vec::new();
    for (name, old) in &before {
        match after.get(name) {
            Some(new) if !old.differs_from(new) => {}
            new => changes.push(DependencyUpdate {
                from: Some(old.clone()),
                to: new.cloned(),
            }),
        }
    }
    for (name, new) in &after {
        if !before.contains_key(name) {
            changes.push(DependencyUpdate {
                from: None,
                to: Some(new.clone()),
            });
        }
    }
    changes
}

fn newer<'d>(a: &'d DependencyDetail, b: &'d DependencyDetail) -> Option<&'d DependencyDetail> {
    match (semver::Version::parse(&a.version), semver::Version::parse(&b.version)) {
        (Ok(av), Ok(bv)) => Some(if av > bv { a } else { b }),
        _ => None,
    }
}

/// What to do with the repository's dependencies.
#[derive(Debug, Default)]
struct Plan {
    /// Asset versions produced by the build.
    build_updates: Vec<(String, String)>,
    version_updates: Vec<DependencyDetail>,
    additions: Vec<DependencyDetail>,
    removals: BTreeSet<String>,
}

impl BackflowDependencyUpdater {
    pub fn new(config: Arc<CodeflowConfig>, comments: CommentCollector) -> Self {
        Self { config, comments }
    }

    /// Update the repository's dependency files and commit them. Returns
    /// the updates relative to the head branch, empty when nothing changed.
    #[instrument(skip(self, request), fields(mapping = %request.mapping))]
    pub async fn update(&self, request: BackflowUpdateRequest<'_>) -> Result<Vec<DependencyUpdate>, VersionFileError> {
        let repo = request.repo;
        let vmr_file = format!("{}/{VERSION_DETAILS_XML}", self.config.vmr.mapping_dir(request.mapping));
        info!(
            vmr_from = %request.last_flow.vmr_sha,
            vmr_to = %request.current_flow.vmr_sha,
            repo_from = %request.last_flow.repo_sha,
            repo_to = request.target_branch,
            "resolving backflow dependency updates"
        );

        let head_path = repo.path().join(VERSION_DETAILS_XML);
        let head_content = match std::fs::read_to_string(&head_path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("repository has no {VERSION_DETAILS_XML}, skipping dependency updates");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };
        let head = VersionDetails::parse(&head_content, VERSION_DETAILS_XML)?;

        let previous_repo = self.read(repo, VERSION_DETAILS_XML, &request.last_flow.repo_sha)?;
        let current_repo = self.read(repo, VERSION_DETAILS_XML, request.target_branch)?;
        let previous_vmr = if request.last_flow.is_forward() {
            previous_repo.clone()
        } else {
            self.read(request.vmr, &vmr_file, &request.last_flow.vmr_sha)?
        };
        let current_vmr = self.read(request.vmr, &vmr_file, &request.current_flow.vmr_sha)?;

        let repo_changes = compute_changes(&previous_repo, &current_repo, request.excluded_assets);
        let vmr_changes = compute_changes(&previous_vmr, &current_vmr, request.excluded_assets);
        let plan = self.plan(&head, &repo_changes, &vmr_changes, &request)?;

        let mut details = head.clone();
        for name in &plan.removals {
            details.remove(name);
        }
        for addition in &plan.additions {
            details.upsert(addition.clone());
        }

        let mut updates: Vec<DependencyDetail> = Vec::new();
        for (name, version) in &plan.build_updates {
            let Some(existing) = details.dependency(name) else {
                continue;
            };
            let updated = DependencyDetail {
                version: version.clone(),
                commit: request.build.commit.clone(),
                repo_uri: request.build.repository.clone(),
                ..existing.clone()
            };
            if existing.differs_from(&updated) {
                updates.push(updated);
            }
        }
        for update in &plan.version_updates {
            if details.dependency(&update.name).is_some_and(|e| e.differs_from(update)) {
                updates.push(update.clone());
            }
        }
        for update in &updates {
            details.upsert(update.clone());
        }

        details.source = Some(SourceDependency {
            uri: self.config.vmr.uri.clone(),
            mapping: request.mapping.to_string(),
            sha: request.current_flow.vmr_sha.clone(),
            bar_id: Some(request.build.id),
        });
        if details != head {
            std::fs::write(&head_path, details.write_over(&head_content, VERSION_DETAILS_XML)?)?;
        }

        let arcade = &self.config.codeflow.arcade_sdk_package;
        if updates.iter().any(|u| u.name.eq_ignore_ascii_case(arcade)) {
            self.refresh_eng_common(&request)?;
        }

        if !repo.has_working_tree_changes().await? {
            info!("no changes to dependencies in this backflow");
            return Ok(Vec::new());
        }
        repo.stage(&["."]).await?;
        repo.commit(&commit_message(request.build, &plan, &updates), false).await?;

        let mut result: Vec<DependencyUpdate> = plan
            .additions
            .iter()
            .filter(|a| head.dependency(&a.name).is_none())
            .map(|a| DependencyUpdate {
                from: None,
                to: Some(a.clone()),
            })
            .collect();
        result.extend(plan.removals.iter().filter_map(|name| {
            head.dependency(name).map(|existing| DependencyUpdate {
                from: Some(existing.clone()),
                to: None,
            })
        }));
        result.extend(updates.into_iter().map(|update| DependencyUpdate {
            from: head
                .dependency(&update.name)
                .or_else(|| plan.additions.iter().find(|a| a.name.eq_ignore_ascii_case(&update.name)))
                .cloned(),
            to: Some(update),
        }));
        info!(count = result.len(), "updated dependencies");
        Ok(result)
    }

    fn read(&self, repo: &LocalGitRepo, path: &str, reference: &str) -> Result<VersionDetails, VersionFileError> {
        parse_optional(repo.file_at_ref(path, reference)?.as_deref(), path)
    }

    fn plan(
        &self,
        head: &VersionDetails,
        repo_changes: &[DependencyUpdate],
        vmr_changes: &[DependencyUpdate],
        request: &BackflowUpdateRequest<'_>,
    ) -> Result<Plan, VersionFileError> {
        let excluded = |name: &str| {
            request
                .excluded_assets
                .iter()
                .any(|e| e.eq_ignore_ascii_case(name))
        };

        let mut names: Vec<&str> = Vec::new();
        for name in head
            .dependencies
            .iter()
            .map(|d| d.name.as_str())
            .chain(vmr_changes.iter().map(DependencyUpdate::name))
            .chain(repo_changes.iter().map(DependencyUpdate::name))
        {
            if !excluded(name) && !names.contains(&name) {
                names.push(name);
            }
        }

        let mut plan = Plan::default();
        for name in names {
            let repo_change = repo_changes.iter().find(|c| c.name() == name);
            let vmr_change = vmr_changes.iter().find(|c| c.name() == name);
            let repo_version = repo_change.and_then(|c| c.to.as_ref());
            let vmr_version = vmr_change.and_then(|c| c.to.as_ref());

            if let Some(asset) = request.build.asset(name).filter(|a| !excluded(&a.name)) {
                debug!(asset = name, version = %asset.version, "asset is part of the build");
                plan.build_updates.push((name.to_string(), asset.version.clone()));
                continue;
            }

            match (repo_change, vmr_change) {
                (Some(r), Some(v)) if r.is_update() && v.is_update() => {
                    let (Some(rv), Some(vv)) = (repo_version, vmr_version) else {
                        continue;
                    };
                    plan.version_updates.push(self.pick_newer(rv, vv).clone());
                }
                (Some(r), v) if r.is_removal() => {
                    if let Some(v) = v.filter(|v| v.is_addition()) {
                        return Err(conflicting(name, r, v));
                    }
                    debug!(asset = name, "removed in the repository");
                }
                (r, Some(v)) if v.is_removal() => {
                    if let Some(r) = r.filter(|r| r.is_addition()) {
                        return Err(conflicting(name, r, v));
                    }
                    info!(asset = name, "removed in the VMR, removing from the repository");
                    plan.removals.insert(name.to_string());
                }
                (Some(r), Some(v)) if r.is_addition() && v.is_addition() => {
                    let (Some(rv), Some(vv)) = (repo_version, vmr_version) else {
                        continue;
                    };
                    plan.additions.push(self.pick_newer(rv, vv).clone());
                }
                (Some(r), _) if r.is_addition() => {
                    if let Some(rv) = repo_version {
                        plan.additions.push(rv.clone());
                    }
                }
                (_, Some(v)) if v.is_addition() => {
                    if let Some(vv) = vmr_version {
                        info!(asset = name, version = %vv.version, "added in the VMR, adding to the repository");
                        plan.additions.push(vv.clone());
                    }
                }
                (Some(r), _) if r.is_update() => {
                    debug!(asset = name, "already updated in the repository");
                }
                (_, Some(v)) if v.is_update() => {
                    if let Some(vv) = vmr_version {
                        info!(asset = name, version = %vv.version, "updated in the VMR, updating the repository");
                        plan.version_updates.push(vv.clone());
                    }
                }
                _ => {}
            }
        }
        Ok(plan)
    }

    /// The newer of the repository and VMR versions of a dependency. When
    /// the versions do not compare, the repository keeps its version and
    /// the flow asks for a manual review.
    fn pick_newer<'d>(&self, repo: &'d DependencyDetail, vmr: &'d DependencyDetail) -> &'d DependencyDetail {
        match newer(repo, vmr) {
            Some(chosen) => chosen,
            None => {
                self.comments.warning(format!(
                    "Could not compare versions `{}` (repository) and `{}` (VMR) of `{}`. \
                     The repository version was kept, please review it manually.",
                    repo.version, vmr.version, repo.name
                ));
                repo
            }
        }
    }

    /// Replace the repository's shared build scripts with the VMR's copy.
    fn refresh_eng_common(&self, request: &BackflowUpdateRequest<'_>) -> Result<(), VersionFileError> {
        let source = format!(
            "{}/{ENG_COMMON_DIR}",
            self.config.vmr.mapping_dir(&self.config.codeflow.eng_common_mapping)
        );
        let destination = request.repo.path().join(ENG_COMMON_DIR);

        let spec = format!("{}:{source}", request.current_flow.vmr_sha);
        if request.vmr.object_type(&spec)? != GitObjectType::Tree {
            warn!(path = %source, "VMR does not contain the shared scripts");
            self.comments
                .warning(format!("The VMR does not contain `{source}`, shared scripts were not updated."));
            return Ok(());
        }
        if destination.exists() {
            std::fs::remove_dir_all(&destination)?;
        }
        let files = request
            .vmr
            .export_directory(&request.current_flow.vmr_sha, &source, &destination)?;
        info!(path = %source, files, "updated shared scripts");
        Ok(())
    }
}

fn conflicting(name: &str, repo_change: &DependencyUpdate, vmr_change: &DependencyUpdate) -> VersionFileError {
    VersionFileError::ConflictingDependencyUpdate {
        name: name.to_string(),
        repo_change: repo_change.describe(),
        vmr_change: vmr_change.describe(),
    }
}

fn commit_message(build: &Build, plan: &Plan, updates: &[DependencyDetail]) -> String {
    let mut message = format!("Update dependencies from {}", build.repository);
    let mut lines: Vec<String> = Vec::new();
    for update in updates {
        lines.push(format!("Updated {} to {}", update.name, update.version));
    }
    for addition in &plan.additions {
        lines.push(format!("Added {} {}", addition.name, addition.version));
    }
    for removal in &plan.removals {
        lines.push(format!("Removed {removal}"));
    }
    if !lines.is_empty() {
        message.push_str("\n\n");
        message.push_str(&lines.join("\n"));
    }
    message
}
