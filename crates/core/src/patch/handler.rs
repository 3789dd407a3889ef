//! Creating and applying the patches that carry a flow's changes.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use regex_lite::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::filters::PatchFilters;
use crate::clone_manager::CloneManager;
use crate::config::CodeflowConfig;
use crate::errors::{GitError, PatchError};
use crate::git::{GitSubmodule, LocalGitRepo};
use crate::manifest::SubmoduleRecord;
use crate::mapping::SourceMapping;
use crate::models::{short_sha, VmrIngestionPatch, EMPTY_OBJECT_SHA, EMPTY_TREE_SHA};

type PatchFuture<'a> = Pin<Box<dyn Future<Output = Result<PatchSet, PatchError>> + Send + 'a>>;
type SplitFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Vec<VmrIngestionPatch>, PatchError>> + Send + 'a>>;

/// Patches of a mapping plus the submodule pointers they move.
#[derive(Debug, Clone, Default)]
pub struct PatchSet {
    pub patches: Vec<VmrIngestionPatch>,
    /// Manifest records of changed submodules. A removed submodule has the
    /// all-zero commit.
    pub submodules: Vec<SubmoduleRecord>,
}

/// How one submodule moved between two commits of its parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmoduleChange {
    pub name: String,
    pub path: String,
    pub url: String,
    pub before: String,
    pub after: String,
}

/// Pair the submodules of two commits. Additions and removals use the
/// all-zero commit for the missing side; a URL change is a removal followed
/// by an addition.
pub fn submodule_changes(before: &[GitSubmodule], after: &[GitSubmodule]) -> Vec<SubmoduleChange> {
    let mut paths: Vec<&str> = Vec::new();
    for s in before.iter().chain(after) {
        if !paths.contains(&s.path.as_str()) {
            paths.push(&s.path);
        }
    }

    let mut changes = Vec::new();
    for path in paths {
        let old = before.iter().find(|s| s.path == path);
        let new = after.iter().find(|s| s.path == path);
        let change = |s: &GitSubmodule, before: &str, after: &str| SubmoduleChange {
            name: s.name.clone(),
            path: path.to_string(),
            url: s.url.clone(),
            before: before.to_string(),
            after: after.to_string(),
        };
        match (old, new) {
            (None, Some(a)) => changes.push(change(a, EMPTY_OBJECT_SHA, &a.commit)),
            (Some(b), None) => changes.push(change(b, &b.commit, EMPTY_OBJECT_SHA)),
            (Some(b), Some(a)) if b.url != a.url => {
                changes.push(change(b, &b.commit, EMPTY_OBJECT_SHA));
                changes.push(change(a, EMPTY_OBJECT_SHA, &a.commit));
            }
            (Some(b), Some(a)) => changes.push(change(a, &b.commit, &a.commit)),
            (None, None) => {}
        }
    }
    changes
}

/// One `git diff` invocation.
#[derive(Debug, Clone)]
pub struct PatchRequest {
    pub patch_name: PathBuf,
    pub sha1: String,
    pub sha2: String,
    /// Single path to diff, relative to `working_dir`.
    pub path: Option<String>,
    pub filters: PatchFilters,
    /// Whether paths in the patch are relative to `working_dir`.
    pub relative: bool,
    pub working_dir: PathBuf,
    /// Where in the destination tree the patch applies.
    pub application_path: Option<String>,
}

/// Options for [`PatchHandler::apply_patch`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ApplyOptions {
    pub reverse: bool,
    /// Three-way apply into index and working tree, leaving conflict markers.
    pub keep_conflicts: bool,
    /// Sync the working tree with the index after a cached apply.
    pub reset_working_tree: bool,
}

impl ApplyOptions {
    pub fn cached() -> Self {
        Self {
            reset_working_tree: true,
            ..Self::default()
        }
    }
}

pub struct PatchHandler {
    config: Arc<CodeflowConfig>,
    clones: Arc<CloneManager>,
}

impl PatchHandler {
    pub fn new(config: Arc<CodeflowConfig>, clones: Arc<CloneManager>) -> Self {
        Self { config, clones }
    }

    fn max_patch_size(&self) -> u64 {
        self.config.patches.max_patch_size
    }

    /// Absolute path of a patch file in the scratch directory.
    pub fn patch_path(&self, name: &str) -> Result<PathBuf, PatchError> {
        let dir = &self.config.vmr.tmp_path;
        let dir = if dir.is_absolute() {
            dir.clone()
        } else {
            std::env::current_dir()?.join(dir)
        };
        std::fs::create_dir_all(&dir)?;
        Ok(dir.join(name))
    }

    // -----------------------------------------------------------------------
    // Creation
    // -----------------------------------------------------------------------

    /// Patches bringing `mapping`'s sources in the VMR from `sha1` to `sha2`
    /// of `repo`, including the content of its submodules.
    #[instrument(skip(self, mapping, repo, filters, cancel), fields(mapping = %mapping.name))]
    pub async fn create_patches(
        &self,
        mapping: &SourceMapping,
        repo: &LocalGitRepo,
        sha1: &str,
        sha2: &str,
        filters: &PatchFilters,
        cancel: &CancellationToken,
    ) -> Result<PatchSet, PatchError> {
        info!(from = short_sha(sha1), to = short_sha(sha2), "creating patches");
        let set = self
            .create_patches_recursive(
                mapping.name.clone(),
                repo.clone(),
                tree_ish(sha1).to_string(),
                tree_ish(sha2).to_string(),
                filters.clone(),
                mapping.name.clone(),
                cancel.clone(),
            )
            .await?;
        info!(count = set.patches.len(), "patches created");
        Ok(set)
    }

    #[allow(clippy::too_many_arguments)]
    fn create_patches_recursive<'a>(
        &'a self,
        name: String,
        repo: LocalGitRepo,
        sha1: String,
        sha2: String,
        filters: PatchFilters,
        relative_path: String,
        cancel: CancellationToken,
    ) -> PatchFuture<'a> {
        Box::pin(async move {
            let changes = submodule_changes(
                &submodules_at(&repo, &sha1)?,
                &submodules_at(&repo, &sha2)?,
            );

            let mut set = PatchSet {
                submodules: changes
                    .iter()
                    .map(|c| SubmoduleRecord {
                        path: format!("{relative_path}/{}", c.path),
                        remote_uri: c.url.clone(),
                        commit_sha: c.after.clone(),
                    })
                    .collect(),
                ..PatchSet::default()
            };

            let mut hard_excludes: Vec<String> = Vec::new();
            for change in &changes {
                if !hard_excludes.contains(&change.path) {
                    hard_excludes.push(change.path.clone());
                }
            }
            let request = PatchRequest {
                patch_name: self.patch_path(&format!(
                    "{name}-{}-{}.patch",
                    short_sha(&sha1),
                    short_sha(&sha2)
                ))?,
                sha1: sha1.clone(),
                sha2: sha2.clone(),
                path: None,
                filters: filters.clone().with_hard_excludes(hard_excludes),
                relative: false,
                working_dir: repo.path().to_path_buf(),
                application_path: Some(self.config.vmr.mapping_dir(&relative_path)),
            };
            set.patches.extend(self.create_split_patches(&repo, request).await?);

            for change in changes {
                if change.before == change.after {
                    debug!(submodule = %change.name, "submodule unchanged");
                    continue;
                }
                if change.before == EMPTY_OBJECT_SHA {
                    info!(submodule = %change.name, path = %change.path, sha = short_sha(&change.after), "submodule added");
                } else if change.after == EMPTY_OBJECT_SHA {
                    info!(submodule = %change.name, path = %change.path, "submodule removed");
                } else {
                    info!(
                        submodule = %change.name,
                        from = short_sha(&change.before),
                        to = short_sha(&change.after),
                        "submodule changed"
                    );
                }

                let checkout = if change.before == EMPTY_OBJECT_SHA {
                    &change.after
                } else {
                    &change.before
                };
                let clone = self
                    .clones
                    .prepare_clone_for_uri(
                        &change.url,
                        &[change.before.clone(), change.after.clone()],
                        checkout,
                        &cancel,
                    )
                    .await?;

                let nested = self
                    .create_patches_recursive(
                        submodule_mapping_name(&change.name),
                        clone,
                        tree_ish(&change.before).to_string(),
                        tree_ish(&change.after).to_string(),
                        filters.for_submodule(&change.path),
                        format!("{relative_path}/{}", change.path),
                        cancel.clone(),
                    )
                    .await?;
                set.patches.extend(nested.patches);
                set.submodules.extend(nested.submodules);
            }
            Ok(set)
        })
    }

    /// Run `request`, splitting the diff per directory and then per file
    /// while it exceeds the patch size limit.
    pub fn create_split_patches<'a>(
        &'a self,
        repo: &'a LocalGitRepo,
        request: PatchRequest,
    ) -> SplitFuture<'a> {
        Box::pin(async move {
            let patch = self.create_patch(repo, &request).await?;
            let size = std::fs::metadata(&patch.path)?.len();
            if size <= self.max_patch_size() {
                return Ok(vec![patch]);
            }

            warn!(
                patch = %request.patch_name.display(),
                size,
                limit = self.max_patch_size(),
                "patch is too large, splitting it into smaller patches"
            );
            std::fs::remove_file(&patch.path)?;

            let dir = relative_dir(repo, &request.working_dir);
            let entries = directory_entries(repo, &dir, &[&request.sha1, &request.sha2])?;
            let (dirs, files): (Vec<_>, Vec<_>) = entries.into_iter().partition(|(_, is_dir)| *is_dir);

            let mut patches = Vec::new();
            let mut index = 0;
            for (name, _) in dirs {
                if name == ".git" {
                    continue;
                }
                index += 1;
                let child = PatchRequest {
                    patch_name: suffixed(&request.patch_name, index),
                    path: None,
                    relative: true,
                    working_dir: request.working_dir.join(&name),
                    application_path: Some(match &request.application_path {
                        Some(parent) => format!("{parent}/{name}"),
                        None => name.clone(),
                    }),
                    ..request.clone()
                };
                patches.extend(self.create_split_patches(repo, child).await?);
            }

            for (name, _) in files {
                index += 1;
                let root_relative = join_rel(&dir, &name);
                if !request.filters.includes_path(&root_relative) {
                    debug!(file = %root_relative, "file is not included, skipping");
                    continue;
                }
                let child = PatchRequest {
                    patch_name: suffixed(&request.patch_name, index),
                    path: Some(name),
                    relative: true,
                    ..request.clone()
                };
                let patch = self.create_patch_with(repo, &child, false).await?;
                let size = std::fs::metadata(&patch.path)?.len();
                if size > self.max_patch_size() {
                    return Err(PatchError::TooLarge {
                        path: root_relative,
                        size,
                        limit: self.max_patch_size(),
                    });
                }
                patches.push(patch);
            }
            Ok(patches)
        })
    }

    /// Write a single diff to `request.patch_name`.
    pub async fn create_patch(&self, repo: &LocalGitRepo, request: &PatchRequest) -> Result<VmrIngestionPatch, PatchError> {
        self.create_patch_with(repo, request, true).await
    }

    async fn create_patch_with(
        &self,
        repo: &LocalGitRepo,
        request: &PatchRequest,
        include_rules: bool,
    ) -> Result<VmrIngestionPatch, PatchError> {
        let output = request.patch_name.display().to_string();
        let mut args: Vec<String> = vec![
            "diff".into(),
            "--patch".into(),
            "--binary".into(),
            "--no-color".into(),
            "--no-ext-diff".into(),
            "--output".into(),
            output,
        ];
        if request.relative {
            args.push("--relative".into());
        }
        args.push(tree_ish(&request.sha1).to_string());
        args.push(tree_ish(&request.sha2).to_string());
        args.push("--".into());
        if let Some(path) = &request.path {
            args.push(path.clone());
        }
        args.extend(request.filters.pathspecs(&self.config.patches, include_rules));

        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        repo.git_in(&request.working_dir, &args).await?;
        debug!(patch = %request.patch_name.display(), "patch created");

        Ok(VmrIngestionPatch::new(
            request.patch_name.clone(),
            request.application_path.clone(),
        ))
    }

    // -----------------------------------------------------------------------
    // Application
    // -----------------------------------------------------------------------

    /// Apply `patch` to `repo`, returning the files left conflicted when
    /// `keep_conflicts` is set.
    #[instrument(skip(self, patch, repo), fields(patch = %patch.path.display()))]
    pub async fn apply_patch(
        &self,
        patch: &VmrIngestionPatch,
        repo: &LocalGitRepo,
        options: ApplyOptions,
    ) -> Result<Vec<String>, PatchError> {
        let size = match std::fs::metadata(&patch.path) {
            Ok(meta) => meta.len(),
            Err(_) => {
                warn!("patch file is missing, skipping");
                return Ok(Vec::new());
            }
        };
        if size == 0 {
            debug!("patch is empty, skipping");
            return Ok(Vec::new());
        }

        info!(
            target_path = patch.application_path.as_deref().unwrap_or("."),
            reverse = options.reverse,
            "applying patch"
        );

        let patch_file = patch.path.display().to_string();
        let mut args = vec!["apply", "--ignore-space-change"];
        args.push(if options.keep_conflicts { "--3way" } else { "--cached" });
        if options.reverse {
            args.push("--reverse");
        }
        if let Some(dir) = &patch.application_path {
            std::fs::create_dir_all(repo.path().join(dir))?;
            args.extend(["--directory", dir.as_str()]);
        }
        args.push(&patch_file);

        let output = repo.run_git(&args).await?;

        if options.keep_conflicts {
            let conflicts = repo.conflicted_files().await?;
            if !output.succeeded() && conflicts.is_empty() {
                return Err(application_failed(patch, &output.stderr, options.reverse));
            }
            if !conflicts.is_empty() {
                warn!(files = ?conflicts, "patch applied with conflicts");
            }
            return Ok(conflicts);
        }

        if !output.succeeded() {
            return Err(application_failed(patch, &output.stderr, options.reverse));
        }
        if options.reset_working_tree {
            reset_working_tree_directory(repo, patch.application_path.as_deref().unwrap_or(".")).await?;
        }
        Ok(Vec::new())
    }

    /// Apply patches in order, stopping at the first failure. Cancellation is
    /// checked between patches.
    pub async fn apply_patches(
        &self,
        patches: &[VmrIngestionPatch],
        repo: &LocalGitRepo,
        options: ApplyOptions,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, PatchError> {
        let mut conflicts = Vec::new();
        for patch in patches {
            if cancel.is_cancelled() {
                return Err(GitError::Cancelled.into());
            }
            conflicts.extend(self.apply_patch(patch, repo, options).await?);
        }
        Ok(conflicts)
    }

    /// Files a patch touches, as written in the patch.
    pub async fn patched_files(&self, patch: &Path, repo: &LocalGitRepo) -> Result<Vec<String>, PatchError> {
        if std::fs::metadata(patch).map(|m| m.len()).unwrap_or(0) == 0 {
            return Ok(Vec::new());
        }
        let patch_file = patch.display().to_string();
        let stdout = repo.git(&["apply", "--numstat", &patch_file]).await?;

        let Ok(summary) = Regex::new(r"^[\-0-9]+\s+[\-0-9]+\s+(?P<file>.+)$") else {
            return Ok(Vec::new());
        };
        Ok(stdout
            .lines()
            .filter_map(|line| summary.captures(line.trim_end()))
            .map(|caps| caps["file"].to_string())
            .collect())
    }

    /// Delete patch files once they are no longer needed.
    pub fn cleanup(&self, patches: &[VmrIngestionPatch]) {
        for patch in patches {
            if let Err(e) = std::fs::remove_file(&patch.path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(patch = %patch.path.display(), error = %e, "failed to delete patch");
                }
            }
        }
    }
}

fn application_failed(patch: &VmrIngestionPatch, stderr: &str, reverse: bool) -> PatchError {
    PatchError::ApplicationFailed {
        patch: patch
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| patch.path.display().to_string()),
        output: stderr.trim().to_string(),
        reverse,
    }
}

/// Make the working tree under `path` match the index.
async fn reset_working_tree_directory(repo: &LocalGitRepo, path: &str) -> Result<(), PatchError> {
    let output = repo.run_git(&["checkout", "--", path]).await?;
    if !output.succeeded() {
        if output.stderr.contains("did not match any file(s) known to git") {
            info!(path, "directory left the index, removing it");
            let full = repo.path().join(path);
            if full.exists() {
                std::fs::remove_dir_all(full)?;
            }
        } else {
            output.ensure_success(&["checkout", "--", path])?;
        }
    }
    if repo.path().join(path).exists() {
        repo.git(&["clean", "-fdq", "--", path]).await?;
    }
    Ok(())
}

/// Map the all-zero commit onto the empty tree so git can diff against it.
fn tree_ish(sha: &str) -> &str {
    if sha == EMPTY_OBJECT_SHA {
        EMPTY_TREE_SHA
    } else {
        sha
    }
}

fn submodules_at(repo: &LocalGitRepo, sha: &str) -> Result<Vec<GitSubmodule>, GitError> {
    if sha == EMPTY_TREE_SHA || sha == EMPTY_OBJECT_SHA {
        return Ok(Vec::new());
    }
    repo.submodules_at(sha)
}

/// Last path segment of a submodule name without a `.git` suffix.
fn submodule_mapping_name(name: &str) -> String {
    let last = name
        .rsplit(['/', '\\'])
        .find(|s| !s.is_empty())
        .unwrap_or(name);
    last.strip_suffix(".git").unwrap_or(last).to_string()
}

fn suffixed(patch_name: &Path, index: usize) -> PathBuf {
    let mut name = patch_name.as_os_str().to_owned();
    name.push(format!(".{index}"));
    PathBuf::from(name)
}

/// Directory of `working_dir` relative to the repository root, "" for the root.
fn relative_dir(repo: &LocalGitRepo, working_dir: &Path) -> String {
    working_dir
        .strip_prefix(repo.path())
        .map(|p| p.to_string_lossy().replace('\\', "/"))
        .unwrap_or_default()
}

fn join_rel(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{dir}/{name}")
    }
}

/// Names of the entries of `dir` in any of the given commits, with whether
/// each one is a directory. Gitlinks are left out.
fn directory_entries(repo: &LocalGitRepo, dir: &str, shas: &[&str]) -> Result<Vec<(String, bool)>, GitError> {
    let git = repo.open()?;
    let mut entries: Vec<(String, bool)> = Vec::new();
    for sha in shas {
        if *sha == EMPTY_TREE_SHA || *sha == EMPTY_OBJECT_SHA {
            continue;
        }
        let root = git
            .revparse_single(sha)
            .and_then(|o| o.peel_to_tree())
            .map_err(|_| GitError::RefNotFound(sha.to_string()))?;
        let tree = if dir.is_empty() {
            root
        } else {
            match root.get_path(Path::new(dir)) {
                Ok(entry) => match entry.to_object(&git)?.into_tree() {
                    Ok(tree) => tree,
                    Err(_) => continue,
                },
                Err(_) => continue,
            }
        };
        for entry in tree.iter() {
            let Some(name) = entry.name() else { continue };
            let is_dir = match entry.kind() {
                Some(git2::ObjectType::Tree) => true,
                Some(git2::ObjectType::Blob) => false,
                _ => continue,
            };
            if !entries.iter().any(|(n, _)| n == name) {
                entries.push((name.to_string(), is_dir));
            }
        }
    }
    entries.sort();
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::test_support::{commit_all, commit_file, git, git_available, init_repo, write_file};
    use crate::git::RepoFactory;

    fn handler(dir: &Path, max_patch_size: u64) -> PatchHandler {
        let mut config = CodeflowConfig::for_vmr(dir.join("vmr"));
        config.vmr.tmp_path = dir.join("tmp");
        config.patches.max_patch_size = max_patch_size;
        let clones = CloneManager::new(dir.join("tmp"), RepoFactory::new(4));
        PatchHandler::new(Arc::new(config), Arc::new(clones))
    }

    fn submodule(path: &str, url: &str, commit: &str) -> GitSubmodule {
        GitSubmodule {
            name: path.into(),
            path: path.into(),
            url: url.into(),
            commit: commit.into(),
        }
    }

    #[test]
    fn test_submodule_changes() {
        let before = vec![
            submodule("a", "https://x/a", "1"),
            submodule("b", "https://x/b", "2"),
            submodule("c", "https://x/c", "3"),
        ];
        let after = vec![
            submodule("a", "https://x/a", "4"),
            submodule("c", "https://y/c", "5"),
            submodule("d", "https://x/d", "6"),
        ];
        let changes = submodule_changes(&before, &after);
        let summary: Vec<(&str, &str, &str)> = changes
            .iter()
            .map(|c| (c.path.as_str(), c.before.as_str(), c.after.as_str()))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("a", "1", "4"),
                ("b", "2", EMPTY_OBJECT_SHA),
                ("c", "3", EMPTY_OBJECT_SHA),
                ("c", EMPTY_OBJECT_SHA, "5"),
                ("d", EMPTY_OBJECT_SHA, "6"),
            ]
        );
        assert_eq!(changes[3].url, "https://y/c");
    }

    #[test]
    fn test_submodule_mapping_name() {
        assert_eq!(submodule_mapping_name("src/external/zlib.git"), "zlib");
        assert_eq!(submodule_mapping_name("docs"), "docs");
    }

    #[tokio::test]
    async fn test_create_and_apply_patches() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let repo = init_repo(&dir.path().join("repo"));
        let first = commit_file(&repo, "a.txt", "one\n", "first");
        write_file(repo.path(), "a.txt", "two\n");
        write_file(repo.path(), "docs/b.md", "b\n");
        write_file(repo.path(), "bin/tool.dll", "binary\n");
        let second = commit_all(&repo, "second");

        let vmr = init_repo(&dir.path().join("vmr"));
        commit_file(&vmr, "src/repo/a.txt", "one\n", "seed");

        let handler = handler(dir.path(), 1_000_000);
        let mut mapping = SourceMapping::new("repo", repo.path().display().to_string());
        mapping.exclude.push("**/*.dll".into());
        let set = handler
            .create_patches(
                &mapping,
                &repo,
                &first,
                &second,
                &PatchFilters::for_mapping(&mapping),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(set.patches.len(), 1);
        assert!(set.submodules.is_empty());
        assert_eq!(set.patches[0].application_path.as_deref(), Some("src/repo"));

        let files = handler.patched_files(&set.patches[0].path, &vmr).await.unwrap();
        assert_eq!(files, vec!["a.txt", "docs/b.md"]);

        handler
            .apply_patches(&set.patches, &vmr, ApplyOptions::cached(), &CancellationToken::new())
            .await
            .unwrap();
        let root = vmr.path().join("src/repo");
        assert_eq!(std::fs::read_to_string(root.join("a.txt")).unwrap(), "two\n");
        assert_eq!(std::fs::read_to_string(root.join("docs/b.md")).unwrap(), "b\n");
        assert!(!root.join("bin/tool.dll").exists());

        handler.cleanup(&set.patches);
        assert!(!set.patches[0].path.exists());
    }

    #[tokio::test]
    async fn test_split_patches_reproduce_tree() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let repo = init_repo(&dir.path().join("repo"));
        let base = commit_file(&repo, "README.md", "readme\n", "base");
        for d in ["alpha", "beta/gamma"] {
            for f in 0..3 {
                write_file(repo.path(), &format!("{d}/file{f}.txt"), &"x".repeat(200));
            }
        }
        write_file(repo.path(), "top.txt", &"t".repeat(200));
        let head = commit_all(&repo, "content");

        let vmr = init_repo(&dir.path().join("vmr"));
        commit_file(&vmr, "src/repo/README.md", "readme\n", "seed");

        let handler = handler(dir.path(), 700);
        let mapping = SourceMapping::new("repo", repo.path().display().to_string());
        let set = handler
            .create_patches(
                &mapping,
                &repo,
                &base,
                &head,
                &PatchFilters::for_mapping(&mapping),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(set.patches.len() > 1);
        for patch in &set.patches {
            assert!(std::fs::metadata(&patch.path).unwrap().len() <= 700);
        }

        handler
            .apply_patches(&set.patches, &vmr, ApplyOptions::cached(), &CancellationToken::new())
            .await
            .unwrap();
        for d in ["alpha", "beta/gamma"] {
            for f in 0..3 {
                let path = vmr.path().join(format!("src/repo/{d}/file{f}.txt"));
                assert_eq!(std::fs::read_to_string(path).unwrap(), "x".repeat(200));
            }
        }
        assert!(vmr.path().join("src/repo/top.txt").exists());
    }

    #[tokio::test]
    async fn test_patch_at_the_size_limit_is_kept_whole() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let repo = init_repo(&dir.path().join("repo"));
        let base = commit_file(&repo, "README.md", "readme\n", "base");
        write_file(repo.path(), "alpha/one.txt", &"a".repeat(300));
        write_file(repo.path(), "beta/two.txt", &"b".repeat(300));
        let head = commit_all(&repo, "content");
        let mapping = SourceMapping::new("repo", repo.path().display().to_string());
        let filters = PatchFilters::for_mapping(&mapping);
        let cancel = CancellationToken::new();

        let whole = handler(dir.path(), 1_000_000)
            .create_patches(&mapping, &repo, &base, &head, &filters, &cancel)
            .await
            .unwrap();
        assert_eq!(whole.patches.len(), 1);
        let size = std::fs::metadata(&whole.patches[0].path).unwrap().len();

        let at_limit = handler(dir.path(), size)
            .create_patches(&mapping, &repo, &base, &head, &filters, &cancel)
            .await
            .unwrap();
        assert_eq!(at_limit.patches.len(), 1);

        let below_limit = handler(dir.path(), size - 1)
            .create_patches(&mapping, &repo, &base, &head, &filters, &cancel)
            .await
            .unwrap();
        assert!(below_limit.patches.len() > 1);
    }

    #[tokio::test]
    async fn test_single_large_file_is_rejected() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let repo = init_repo(&dir.path().join("repo"));
        let base = commit_file(&repo, "small.txt", "s\n", "base");
        let head = commit_file(&repo, "big.txt", &"b".repeat(4000), "big");

        let handler = handler(dir.path(), 1000);
        let mapping = SourceMapping::new("repo", repo.path().display().to_string());
        let result = handler
            .create_patches(
                &mapping,
                &repo,
                &base,
                &head,
                &PatchFilters::for_mapping(&mapping),
                &CancellationToken::new(),
            )
            .await;
        match result {
            Err(PatchError::TooLarge { path, .. }) => assert_eq!(path, "big.txt"),
            other => panic!("expected TooLarge, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_failed_application_reports_direction() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let repo = init_repo(&dir.path().join("repo"));
        let first = commit_file(&repo, "a.txt", "one\n", "first");
        let second = commit_file(&repo, "a.txt", "two\n", "second");

        let vmr = init_repo(&dir.path().join("vmr"));
        commit_file(&vmr, "src/repo/a.txt", "something else\n", "seed");

        let handler = handler(dir.path(), 1_000_000);
        let mapping = SourceMapping::new("repo", repo.path().display().to_string());
        let set = handler
            .create_patches(
                &mapping,
                &repo,
                &first,
                &second,
                &PatchFilters::for_mapping(&mapping),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let options = ApplyOptions {
            reverse: true,
            ..ApplyOptions::cached()
        };
        let err = handler
            .apply_patch(&set.patches[0], &vmr, options)
            .await
            .unwrap_err();
        assert!(matches!(err, PatchError::ApplicationFailed { reverse: true, .. }));
        assert_eq!(git(vmr.path(), &["status", "--porcelain"]), "");
    }
}
