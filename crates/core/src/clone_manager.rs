//! Working clones of component repositories and submodules.
//!
//! A clone lives in the scratch directory under a caller-chosen name. Every
//! remote that was cloned or fetched during the run is remembered so later
//! requests reuse the clone without touching the network again. Each remote
//! URI has its own async lock so two flows never clone or fetch the same
//! remote at the same time.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::errors::{CloneError, GitError};
use crate::git::{GitObjectType, LocalGitRepo, RepoFactory};
use crate::models::{EMPTY_OBJECT_SHA, EMPTY_TREE_SHA};

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct CacheState {
    clones: HashMap<String, PathBuf>,
    up_to_date: HashSet<String>,
}

/// Clone locations per remote URI and the remotes fetched during this run.
#[derive(Debug, Default)]
pub struct CloneCache {
    state: Mutex<CacheState>,
}

impl CloneCache {
    fn with_state<T>(&self, f: impl FnOnce(&mut CacheState) -> T) -> T {
        // The state stays consistent even if a holder panicked.
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut state)
    }

    /// Clone path for `uri` if it is known and its directory still exists.
    pub fn clone_path(&self, uri: &str) -> Option<PathBuf> {
        self.with_state(|state| {
            let path = state.clones.get(uri)?.clone();
            if path.join(".git").exists() {
                Some(path)
            } else {
                state.clones.remove(uri);
                state.up_to_date.remove(uri);
                None
            }
        })
    }

    pub fn is_up_to_date(&self, uri: &str) -> bool {
        self.with_state(|state| state.up_to_date.contains(uri))
    }

    pub fn record(&self, uri: &str, path: &Path, up_to_date: bool) {
        self.with_state(|state| {
            state.clones.insert(uri.to_string(), path.to_path_buf());
            if up_to_date {
                state.up_to_date.insert(uri.to_string());
            }
        });
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

pub struct CloneManager {
    tmp_path: PathBuf,
    factory: RepoFactory,
    cache: CloneCache,
    remote_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl CloneManager {
    pub fn new(tmp_path: impl Into<PathBuf>, factory: RepoFactory) -> Self {
        Self {
            tmp_path: tmp_path.into(),
            factory,
            cache: CloneCache::default(),
            remote_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn cache(&self) -> &CloneCache {
        &self.cache
    }

    fn remote_lock(&self, uri: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.remote_locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(uri.to_string()).or_default())
    }

    /// Make an existing local clone available under its path and every
    /// remote URI it has configured.
    #[instrument(skip(self, path), fields(path = %path.display()))]
    pub fn register_clone(&self, path: &Path) -> Result<LocalGitRepo, CloneError> {
        let repo = self.factory.create(path);
        if !repo.exists() {
            return Err(GitError::RepositoryNotFound(path.display().to_string()).into());
        }

        self.cache.record(&path.display().to_string(), path, true);
        for (name, url) in repo.remotes()? {
            debug!(remote = %name, url = %url, "registering remote of local clone");
            self.cache.record(&url, path, false);
        }
        info!("registered local clone");
        Ok(repo)
    }

    /// Prepare a clone named `dir_name` in which every ref of `required_refs`
    /// resolves, trying `remote_uris` in order, and check out `checkout_ref`.
    #[instrument(skip(self, remote_uris, required_refs, cancel))]
    pub async fn prepare_clone(
        &self,
        dir_name: &str,
        remote_uris: &[String],
        required_refs: &[String],
        checkout_ref: &str,
        reset_to_remote: bool,
        cancel: &CancellationToken,
    ) -> Result<LocalGitRepo, CloneError> {
        if remote_uris.is_empty() {
            return Err(CloneError::NoRemotes(dir_name.to_string()));
        }

        let mut missing: Vec<String> = Vec::new();
        for r in required_refs {
            if r != EMPTY_OBJECT_SHA && r != EMPTY_TREE_SHA && !missing.contains(r) {
                missing.push(r.clone());
            }
        }

        let factory = self.factory.with_cancellation(cancel.clone());
        let mut clone_path: Option<PathBuf> = None;

        for uri in remote_uris {
            let target_dir = clone_path
                .clone()
                .unwrap_or_else(|| self.tmp_path.join(dir_name));
            let path = self.prepare_remote(&factory, uri, &target_dir).await?;
            let repo = factory.create(&path);
            clone_path.get_or_insert(path);

            let mut still_missing = Vec::new();
            for r in missing {
                match repo.object_type(&r)? {
                    GitObjectType::Commit | GitObjectType::RemoteRef => {}
                    _ => still_missing.push(r),
                }
            }
            missing = still_missing;
            if missing.is_empty() {
                break;
            }
            debug!(uri = %uri, missing = ?missing, "refs not found, trying the next remote");
        }

        if !missing.is_empty() {
            return Err(CloneError::RefsNotFound {
                refs: missing.join(", "),
                remotes: remote_uris.join(", "),
            });
        }

        let path = clone_path.ok_or_else(|| CloneError::NoRemotes(dir_name.to_string()))?;
        let repo = factory.create(&path);
        checkout_in_clone(&repo, checkout_ref).await?;

        if reset_to_remote {
            if let Some(upstream) = repo.upstream_of(checkout_ref).await? {
                debug!(upstream = %upstream, "resetting clone to its upstream");
                repo.git(&["reset", "-q", "--hard", &upstream]).await?;
                repo.git(&["clean", "-fdq"]).await?;
            }
        }
        Ok(repo)
    }

    /// Clone of a single remote, used for submodules.
    pub async fn prepare_clone_for_uri(
        &self,
        uri: &str,
        required_refs: &[String],
        checkout_ref: &str,
        cancel: &CancellationToken,
    ) -> Result<LocalGitRepo, CloneError> {
        let dir_name = clone_dir_name(uri);
        self.prepare_clone(
            &dir_name,
            &[uri.to_string()],
            required_refs,
            checkout_ref,
            false,
            cancel,
        )
        .await
    }

    /// Ensure the objects of `uri` are present in a clone, cloning into
    /// `target_dir` or fetching into an existing clone as needed.
    async fn prepare_remote(
        &self,
        factory: &RepoFactory,
        uri: &str,
        target_dir: &Path,
    ) -> Result<PathBuf, CloneError> {
        let lock = self.remote_lock(uri);
        let _guard = lock.lock().await;

        if let Some(path) = self.cache.clone_path(uri) {
            if self.cache.is_up_to_date(uri) {
                debug!(uri, path = %path.display(), "clone is up to date");
                return Ok(path);
            }
            let repo = factory.create(&path);
            let remote = repo.add_remote_if_missing(uri).await?;
            repo.fetch_remote(&remote).await?;
            self.cache.record(uri, &path, true);
            return Ok(path);
        }

        let repo = factory.create(target_dir);
        if repo.exists() {
            let remote = repo.add_remote_if_missing(uri).await?;
            info!(uri, path = %target_dir.display(), "fetching into existing clone");
            repo.fetch_remote(&remote).await?;
        } else {
            if target_dir.exists() {
                warn!(path = %target_dir.display(), "removing leftover directory without a repository");
                std::fs::remove_dir_all(target_dir)?;
            }
            std::fs::create_dir_all(&self.tmp_path)?;
            info!(uri, path = %target_dir.display(), "cloning");
            let target = target_dir.display().to_string();
            factory
                .create(&self.tmp_path)
                .git_in(&self.tmp_path, &["clone", "-q", uri, &target])
                .await?;
        }

        self.cache.record(uri, target_dir, true);
        Ok(target_dir.to_path_buf())
    }
}

/// Check out `reference`, creating a tracking branch for remote-only refs.
async fn checkout_in_clone(repo: &LocalGitRepo, reference: &str) -> Result<(), CloneError> {
    if repo.object_type(reference)? == GitObjectType::RemoteRef {
        for (remote, _) in repo.remotes()? {
            let tracked = format!("{remote}/{reference}");
            if repo.resolve_commit(&tracked).is_ok() {
                repo.git(&["checkout", "-q", "-B", reference, "--track", &tracked])
                    .await?;
                return Ok(());
            }
        }
    }

    let output = repo.run_git(&["checkout", "-q", reference]).await?;
    if output.succeeded() {
        return Ok(());
    }
    if output.stderr.contains("would be overwritten") {
        warn!(reference, "local changes block the checkout, cleaning the clone");
        repo.git(&["clean", "-fdqx"]).await?;
        repo.force_checkout(reference).await?;
        return Ok(());
    }
    output.ensure_success(&["checkout", "-q", reference])?;
    Ok(())
}

/// Directory name for a clone of `uri`.
pub fn clone_dir_name(uri: &str) -> String {
    let last = uri
        .trim_end_matches('/')
        .rsplit(['/', '\\', ':'])
        .next()
        .unwrap_or(uri)
        .trim_end_matches(".git");
    let sanitized: String = last
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
        .collect();
    if sanitized.is_empty() {
        crate::git::repo::remote_name(uri)
    } else {
        sanitized
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::test_support::{commit_file, git, git_available, init_repo};

    #[test]
    fn test_clone_dir_name() {
        assert_eq!(clone_dir_name("https://github.com/dotnet/runtime.git"), "runtime");
        assert_eq!(clone_dir_name("https://github.com/dotnet/runtime/"), "runtime");
        assert_eq!(clone_dir_name("/home/me/src/my repo"), "my_repo");
        assert_eq!(clone_dir_name("git@github.com:acme/tool.git"), "tool");
    }

    #[tokio::test]
    async fn test_prepare_clone_and_reuse() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let origin = init_repo(&dir.path().join("origin"));
        let sha = commit_file(&origin, "a.txt", "a\n", "first");
        let uri = origin.path().display().to_string();

        let manager = CloneManager::new(dir.path().join("tmp"), RepoFactory::new(2));
        let cancel = CancellationToken::new();
        let clone = manager
            .prepare_clone("origin", &[uri.clone()], &[sha.clone()], "main", false, &cancel)
            .await
            .unwrap();
        assert_eq!(clone.head_sha().unwrap(), sha);
        assert!(manager.cache().is_up_to_date(&uri));

        // A commit made after the clone is not fetched again within the run.
        let newer = commit_file(&origin, "a.txt", "b\n", "second");
        let again = manager
            .prepare_clone("origin", &[uri.clone()], &[sha.clone()], "main", false, &cancel)
            .await
            .unwrap();
        assert_eq!(again.path(), clone.path());
        let missing = manager
            .prepare_clone("origin", &[uri.clone()], &[newer], "main", false, &cancel)
            .await;
        assert!(matches!(missing, Err(CloneError::RefsNotFound { .. })));
    }

    #[tokio::test]
    async fn test_vanished_clone_is_recloned() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let origin = init_repo(&dir.path().join("origin"));
        let sha = commit_file(&origin, "a.txt", "a\n", "first");
        let uri = origin.path().display().to_string();

        let manager = CloneManager::new(dir.path().join("tmp"), RepoFactory::new(2));
        let cancel = CancellationToken::new();
        let clone = manager
            .prepare_clone("origin", &[uri.clone()], &[sha.clone()], &sha, false, &cancel)
            .await
            .unwrap();
        std::fs::remove_dir_all(clone.path()).unwrap();

        let newer = commit_file(&origin, "a.txt", "b\n", "second");
        let fresh = manager
            .prepare_clone("origin", &[uri], &[newer.clone()], &newer, false, &cancel)
            .await
            .unwrap();
        assert_eq!(fresh.head_sha().unwrap(), newer);
    }

    #[tokio::test]
    async fn test_second_remote_supplies_missing_ref() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let primary = init_repo(&dir.path().join("primary"));
        let base = commit_file(&primary, "a.txt", "a\n", "base");
        git(dir.path(), &["clone", "-q", "primary", "mirror"]);
        let mirror = init_repo(&dir.path().join("mirror"));
        let extra = commit_file(&mirror, "b.txt", "b\n", "only in mirror");

        let manager = CloneManager::new(dir.path().join("tmp"), RepoFactory::new(2));
        let remotes = vec![
            primary.path().display().to_string(),
            mirror.path().display().to_string(),
        ];
        let clone = manager
            .prepare_clone("repo", &remotes, &[base, extra.clone()], &extra, false, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(clone.head_sha().unwrap(), extra);
    }

    #[tokio::test]
    async fn test_registered_clone_is_used_directly() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let local = init_repo(&dir.path().join("local"));
        let sha = commit_file(&local, "a.txt", "a\n", "first");

        let manager = CloneManager::new(dir.path().join("tmp"), RepoFactory::new(2));
        manager.register_clone(local.path()).unwrap();
        let clone = manager
            .prepare_clone(
                "local",
                &[local.path().display().to_string()],
                &[sha, EMPTY_OBJECT_SHA.to_string()],
                "main",
                false,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(clone.path(), local.path());
        assert!(!dir.path().join("tmp").join("local").exists());
    }

    #[tokio::test]
    async fn test_no_remotes() {
        let manager = CloneManager::new("/tmp/unused", RepoFactory::new(1));
        let result = manager
            .prepare_clone("x", &[], &[], "main", false, &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(CloneError::NoRemotes(_))));
    }
}
