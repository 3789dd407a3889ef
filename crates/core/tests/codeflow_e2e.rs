//! End-to-end tests driving whole code flows with the real engine.
//!
//! Every test starts from a component repository and a VMR that already
//! holds the repository's first commit under `src/runtime`, recorded in the
//! source manifest. No network I/O: the mapping's remote is the local
//! repository path.
//!
//! Tests skip gracefully if `git` is not installed.

use std::path::{Path, PathBuf};
use std::process::Command;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use codeflow_core::manifest::{RepositoryRecord, SourceManifest};
use codeflow_core::models::Build;
use codeflow_core::version_files::{DependencyDetail, DependencyType, VersionDetails};
use codeflow_core::{CodeflowConfig, CodeflowEngine, CodeflowError, FlowRequest};

// ===========================================================================
// Helpers
// ===========================================================================

fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .current_dir(dir)
        .args(args)
        .output()
        .expect("failed to run git");
    assert!(
        output.status.success(),
        "git {} failed: {}",
        args.join(" "),
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

fn init_repo(dir: &Path) {
    std::fs::create_dir_all(dir).unwrap();
    git(dir, &["init", "-q", "-b", "main"]);
    git(dir, &["config", "user.name", "Test"]);
    git(dir, &["config", "user.email", "test@example.com"]);
    git(dir, &["config", "commit.gpgsign", "false"]);
}

fn write(root: &Path, path: &str, content: &str) {
    let full = root.join(path);
    std::fs::create_dir_all(full.parent().unwrap()).unwrap();
    std::fs::write(full, content).unwrap();
}

fn commit(dir: &Path, message: &str) -> String {
    git(dir, &["add", "-A"]);
    git(dir, &["commit", "-q", "-m", message]);
    git(dir, &["rev-parse", "HEAD"])
}

fn read(root: &Path, path: &str) -> String {
    std::fs::read_to_string(root.join(path)).unwrap()
}

fn version_details(deps: &[(&str, &str)]) -> String {
    VersionDetails {
        dependencies: deps
            .iter()
            .map(|(name, version)| DependencyDetail {
                name: name.to_string(),
                version: version.to_string(),
                repo_uri: "https://github.com/dotnet/arcade".into(),
                commit: format!("commit-{version}"),
                pinned: false,
                skip_property: false,
                coherent_parent_dependency: None,
                dependency_type: DependencyType::Product,
            })
            .collect(),
        source: None,
    }
    .to_xml()
    .unwrap()
}

const GLOBAL_JSON: &str = "{\n  \"sdk\": {\n    \"version\": \"9.0.100\"\n  }\n}\n";
const VDX: &str = "eng/Version.Details.xml";
const MANIFEST: &str = "src/source-manifest.json";

struct TestEnv {
    _dir: TempDir,
    vmr: PathBuf,
    repo: PathBuf,
    tmp: PathBuf,
    first_sha: String,
}

impl TestEnv {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let vmr = dir.path().join("vmr");
        let repo = dir.path().join("runtime");
        let tmp = dir.path().join("tmp");

        init_repo(&repo);
        write(&repo, "src/a.txt", "hello\n");
        write(&repo, VDX, &version_details(&[("Foo", "1.0.0")]));
        write(&repo, "global.json", GLOBAL_JSON);
        let first_sha = commit(&repo, "initial");

        init_repo(&vmr);
        let mappings = format!(
            "{{\n  \"mappings\": [\n    {{ \"name\": \"runtime\", \"defaultRemote\": \"{}\" }}\n  ]\n}}\n",
            repo.display()
        );
        write(&vmr, "src/source-mappings.json", &mappings);
        write(&vmr, "src/runtime/src/a.txt", "hello\n");
        write(&vmr, &format!("src/runtime/{VDX}"), &version_details(&[("Foo", "1.0.0")]));
        write(&vmr, "src/runtime/global.json", GLOBAL_JSON);
        let manifest = SourceManifest {
            repositories: vec![RepositoryRecord {
                path: "runtime".into(),
                remote_uri: repo.display().to_string(),
                commit_sha: first_sha.clone(),
                package_version: None,
                bar_id: None,
            }],
            submodules: Vec::new(),
        };
        write(&vmr, MANIFEST, &manifest.to_json().unwrap());
        commit(&vmr, "Initial VMR");

        Self {
            _dir: dir,
            vmr,
            repo,
            tmp,
            first_sha,
        }
    }

    fn engine(&self) -> CodeflowEngine {
        self.engine_with(|_| {})
    }

    fn engine_with(&self, configure: impl FnOnce(&mut CodeflowConfig)) -> CodeflowEngine {
        let mut config = CodeflowConfig::for_vmr(&self.vmr);
        config.vmr.tmp_path = self.tmp.clone();
        config.vmr.uri = "https://github.com/dotnet/dotnet".into();
        configure(&mut config);
        CodeflowEngine::new(config)
    }

    fn request(&self, commit: &str, head_branch: &str, build_id: u64) -> FlowRequest {
        FlowRequest {
            mapping: "runtime".into(),
            build: Build {
                id: build_id,
                commit: commit.to_string(),
                repository: self.repo.display().to_string(),
                build_number: format!("20261018.{build_id}"),
                package_version: None,
                assets: Vec::new(),
            },
            target_branch: "main".into(),
            head_branch: head_branch.into(),
            excluded_assets: Vec::new(),
            repo_path: Some(self.repo.clone()),
        }
    }

    /// A backflow of a VMR commit, built from the VMR.
    fn backflow_request(&self, vmr_sha: &str, head_branch: &str, build_id: u64) -> FlowRequest {
        let mut request = self.request(vmr_sha, head_branch, build_id);
        request.build.repository = "https://github.com/dotnet/dotnet".into();
        request
    }

    fn manifest(&self) -> SourceManifest {
        SourceManifest::parse(&read(&self.vmr, MANIFEST)).unwrap()
    }

    fn manifest_sha(&self) -> String {
        self.manifest().repository("runtime").unwrap().commit_sha.clone()
    }
}

// ===========================================================================
// Forward flow
// ===========================================================================

#[tokio::test]
async fn test_forward_flow_carries_repository_changes() {
    if !git_available() {
        return;
    }
    let env = TestEnv::new();
    write(&env.repo, "src/a.txt", "hello world\n");
    write(&env.repo, "src/b.txt", "new file\n");
    let sha = commit(&env.repo, "change sources");

    let result = env
        .engine()
        .flow_forward(&env.request(&sha, "codeflow/runtime", 1), &CancellationToken::new())
        .await
        .unwrap();

    assert!(result.had_updates);
    assert!(result.conflicted_files.is_empty());
    assert!(!result.recreated_previous_flows);
    assert!(!result.flow_id.is_empty());

    assert_eq!(git(&env.vmr, &["rev-parse", "--abbrev-ref", "HEAD"]), "codeflow/runtime");
    assert_eq!(read(&env.vmr, "src/runtime/src/a.txt"), "hello world\n");
    assert_eq!(read(&env.vmr, "src/runtime/src/b.txt"), "new file\n");
    assert_eq!(env.manifest_sha(), sha);

    let props = read(&env.vmr, "prereqs/git-info/runtime.props");
    assert!(props.contains(&format!("<GitCommitHash>{sha}</GitCommitHash>")));

    // The work branch is gone once merged.
    let branches = git(&env.vmr, &["branch", "--list", "codeflow/forward/*"]);
    assert!(branches.is_empty());
    // The target branch is untouched.
    assert_eq!(git(&env.vmr, &["show", "main:src/runtime/src/a.txt"]), "hello");
}

#[tokio::test]
async fn test_forward_flow_is_idempotent() {
    if !git_available() {
        return;
    }
    let env = TestEnv::new();
    write(&env.repo, "src/a.txt", "second\n");
    let sha = commit(&env.repo, "change");
    let engine = env.engine();
    let request = env.request(&sha, "main", 1);

    let first = engine.flow_forward(&request, &CancellationToken::new()).await.unwrap();
    assert!(first.had_updates);
    let head = git(&env.vmr, &["rev-parse", "HEAD"]);

    let second = engine.flow_forward(&request, &CancellationToken::new()).await.unwrap();
    assert!(!second.had_updates);
    assert_eq!(git(&env.vmr, &["rev-parse", "HEAD"]), head);
}

#[tokio::test]
async fn test_non_linear_forward_flow_is_refused() {
    if !git_available() {
        return;
    }
    let env = TestEnv::new();
    write(&env.repo, "src/a.txt", "on main\n");
    let main_sha = commit(&env.repo, "main change");
    let engine = env.engine();
    engine
        .flow_forward(&env.request(&main_sha, "main", 1), &CancellationToken::new())
        .await
        .unwrap();

    git(&env.repo, &["checkout", "-q", "-b", "side", &env.first_sha]);
    write(&env.repo, "src/a.txt", "on a side branch\n");
    let side_sha = commit(&env.repo, "side change");

    let err = engine
        .flow_forward(&env.request(&side_sha, "main", 2), &CancellationToken::new())
        .await
        .unwrap_err();
    match err {
        CodeflowError::NonLinearCodeflow { last_sha, current_sha } => {
            assert_eq!(last_sha, main_sha);
            assert_eq!(current_sha, side_sha);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(read(&env.vmr, "src/runtime/src/a.txt"), "on main\n");
}

#[tokio::test]
async fn test_forward_flow_merges_dependency_changes() {
    if !git_available() {
        return;
    }
    let env = TestEnv::new();
    write(&env.repo, VDX, &version_details(&[("Foo", "2.0.0"), ("Bar", "1.0.0")]));
    let sha = commit(&env.repo, "update dependencies");

    let result = env
        .engine()
        .flow_forward(&env.request(&sha, "main", 1), &CancellationToken::new())
        .await
        .unwrap();

    assert!(result.had_updates);
    assert_eq!(result.dependency_updates.len(), 2);
    assert!(result.dependency_updates.iter().any(|u| u.is_update() && u.name() == "Foo"));
    assert!(result.dependency_updates.iter().any(|u| u.is_addition() && u.name() == "Bar"));

    let path = format!("src/runtime/{VDX}");
    let merged = VersionDetails::parse(&read(&env.vmr, &path), &path).unwrap();
    assert_eq!(merged.dependency("Foo").unwrap().version, "2.0.0");
    assert_eq!(merged.dependency("Bar").unwrap().version, "1.0.0");
    // Everything is committed.
    assert!(git(&env.vmr, &["status", "--porcelain"]).is_empty());
}

#[tokio::test]
async fn test_forward_flow_recreates_the_previous_flow_when_changes_do_not_apply() {
    if !git_available() {
        return;
    }
    let env = TestEnv::new();
    let engine = env.engine();
    write(&env.repo, "src/a.txt", "one\n");
    let first = commit(&env.repo, "first change");
    engine
        .flow_forward(&env.request(&first, "codeflow/runtime", 1), &CancellationToken::new())
        .await
        .unwrap();

    // Someone fixed the file up right in the pull request.
    write(&env.vmr, "src/runtime/src/a.txt", "edited in the PR\n");
    commit(&env.vmr, "Fix up the PR");

    write(&env.repo, "src/a.txt", "two\n");
    let second = commit(&env.repo, "second change");
    let result = engine
        .flow_forward(&env.request(&second, "codeflow/runtime", 2), &CancellationToken::new())
        .await
        .unwrap();

    assert!(result.had_updates);
    assert!(result.recreated_previous_flows);
    assert!(result.conflicted_files.is_empty());
    assert_eq!(git(&env.vmr, &["rev-parse", "--abbrev-ref", "HEAD"]), "codeflow/runtime");
    assert_eq!(read(&env.vmr, "src/runtime/src/a.txt"), "two\n");
    assert_eq!(env.manifest_sha(), second);
    // The head branch was rebuilt from the target branch, dropping the fix-up.
    let log = git(&env.vmr, &["log", "--format=%s", "main..codeflow/runtime"]);
    assert!(!log.contains("Fix up the PR"));
    assert!(git(&env.vmr, &["branch", "--list", "codeflow/forward/*"]).is_empty());
    assert!(git(&env.vmr, &["status", "--porcelain"]).is_empty());
}

#[tokio::test]
async fn test_changes_that_do_not_apply_without_recreation_are_a_conflict() {
    if !git_available() {
        return;
    }
    let env = TestEnv::new();
    let engine = env.engine_with(|config| config.codeflow.max_recreation_depth = 0);
    write(&env.repo, "src/a.txt", "one\n");
    let first = commit(&env.repo, "first change");
    engine
        .flow_forward(&env.request(&first, "codeflow/runtime", 1), &CancellationToken::new())
        .await
        .unwrap();
    write(&env.vmr, "src/runtime/src/a.txt", "edited in the PR\n");
    let fixup = commit(&env.vmr, "Fix up the PR");

    write(&env.repo, "src/a.txt", "two\n");
    let second = commit(&env.repo, "second change");
    let err = engine
        .flow_forward(&env.request(&second, "codeflow/runtime", 2), &CancellationToken::new())
        .await
        .unwrap_err();

    match err {
        CodeflowError::UnresolvableConflict { files, source, .. } => {
            assert!(files.iter().any(|f| f.ends_with("src/a.txt")), "{files:?}");
            assert!(source.is_some());
        }
        other => panic!("unexpected error: {other}"),
    }
    // The head branch is left as it was.
    assert_eq!(git(&env.vmr, &["rev-parse", "codeflow/runtime"]), fixup);
    assert_eq!(read(&env.vmr, "src/runtime/src/a.txt"), "edited in the PR\n");
    assert!(git(&env.vmr, &["status", "--porcelain"]).is_empty());
}

// ===========================================================================
// Backflow
// ===========================================================================

#[tokio::test]
async fn test_backflow_after_forward_flow() {
    if !git_available() {
        return;
    }
    let env = TestEnv::new();
    write(&env.repo, "src/a.txt", "forward\n");
    let repo_sha = commit(&env.repo, "repo change");
    let engine = env.engine();
    engine
        .flow_forward(&env.request(&repo_sha, "main", 1), &CancellationToken::new())
        .await
        .unwrap();

    write(&env.vmr, "src/runtime/src/a.txt", "changed in the VMR\n");
    write(&env.vmr, "src/runtime/src/c.txt", "VMR only\n");
    let vmr_sha = commit(&env.vmr, "VMR change");

    let request = env.backflow_request(&vmr_sha, "backflow/runtime", 2);
    let result = engine.flow_back(&request, &CancellationToken::new()).await.unwrap();

    assert!(result.had_updates);
    assert!(result.conflicted_files.is_empty());
    assert_eq!(git(&env.repo, &["rev-parse", "--abbrev-ref", "HEAD"]), "backflow/runtime");
    assert_eq!(read(&env.repo, "src/a.txt"), "changed in the VMR\n");
    assert_eq!(read(&env.repo, "src/c.txt"), "VMR only\n");

    let details = VersionDetails::parse(&read(&env.repo, VDX), VDX).unwrap();
    let source = details.source.unwrap();
    assert_eq!(source.sha, vmr_sha);
    assert_eq!(source.mapping, "runtime");
    assert_eq!(source.bar_id, Some(2));
    assert!(git(&env.repo, &["status", "--porcelain"]).is_empty());

    // The flow is now recorded on both sides and a new forward flow sees it.
    let flows = engine
        .inspect_last_flows("runtime", &env.repo, codeflow_core::FlowDirection::Forward)
        .await
        .unwrap();
    assert_eq!(flows.last_backflow.unwrap().vmr_sha, vmr_sha);
}

// ===========================================================================
// Crossing flows
// ===========================================================================

/// A backflow lands in the repository while a forward flow pull request
/// made from an older repository commit is still open. The next forward
/// flow into that pull request rebuilds the mapping and heals the manifest
/// conflicts on the way.
#[tokio::test]
async fn test_forward_flow_after_a_crossing_backflow() {
    if !git_available() {
        return;
    }
    let env = TestEnv::new();
    let engine = env.engine();

    write(&env.vmr, "src/runtime/src/c.txt", "from the VMR\n");
    let vmr_change = commit(&env.vmr, "VMR change");

    // Forward flow pull request, opened on top of the VMR change.
    write(&env.repo, "src/a.txt", "forward\n");
    let forward_sha = commit(&env.repo, "repo change");
    engine
        .flow_forward(&env.request(&forward_sha, "codeflow/runtime", 1), &CancellationToken::new())
        .await
        .unwrap();

    // Meanwhile the VMR change flows back and is merged into the repository.
    let backflow = engine
        .flow_back(&env.backflow_request(&vmr_change, "main", 2), &CancellationToken::new())
        .await
        .unwrap();
    assert!(backflow.had_updates);
    assert_eq!(read(&env.repo, "src/a.txt"), "forward\n");
    assert_eq!(read(&env.repo, "src/c.txt"), "from the VMR\n");

    // Another mapping is flown into the VMR's main branch.
    git(&env.vmr, &["checkout", "-q", "main"]);
    let mut manifest = env.manifest();
    manifest.update_repository(RepositoryRecord {
        path: "sdk".into(),
        remote_uri: "https://github.com/dotnet/sdk".into(),
        commit_sha: "5".repeat(40),
        package_version: None,
        bar_id: None,
    });
    write(&env.vmr, MANIFEST, &manifest.to_json().unwrap());
    commit(&env.vmr, "[sdk] Source update");

    let flows = engine
        .inspect_last_flows("runtime", &env.repo, codeflow_core::FlowDirection::Forward)
        .await
        .unwrap();
    assert_eq!(flows.last_backflow.unwrap().vmr_sha, vmr_change);

    write(&env.repo, "src/d.txt", "after the backflow\n");
    let latest = commit(&env.repo, "another repo change");
    let result = engine
        .flow_forward(&env.request(&latest, "codeflow/runtime", 3), &CancellationToken::new())
        .await
        .unwrap();

    assert!(result.had_updates);
    assert!(result.conflicted_files.is_empty(), "{:?}", result.conflicted_files);
    assert!(!result.recreated_previous_flows);
    assert!(result
        .comments
        .iter()
        .any(|c| c.text.contains("resolved automatically") && c.text.contains(MANIFEST)));

    assert_eq!(git(&env.vmr, &["rev-parse", "--abbrev-ref", "HEAD"]), "codeflow/runtime");
    let manifest = env.manifest();
    assert_eq!(manifest.repository("runtime").unwrap().commit_sha, latest);
    assert_eq!(manifest.repository("runtime").unwrap().bar_id, Some(3));
    assert_eq!(manifest.repository("sdk").unwrap().commit_sha, "5".repeat(40));
    assert_eq!(read(&env.vmr, "src/runtime/src/a.txt"), "forward\n");
    assert_eq!(read(&env.vmr, "src/runtime/src/c.txt"), "from the VMR\n");
    assert_eq!(read(&env.vmr, "src/runtime/src/d.txt"), "after the backflow\n");
    let props = read(&env.vmr, "prereqs/git-info/runtime.props");
    assert!(props.contains(&format!("<GitCommitHash>{latest}</GitCommitHash>")));
    assert!(git(&env.vmr, &["status", "--porcelain"]).is_empty());
    // The target branch is fully merged into the pull request.
    assert!(git(&env.vmr, &["log", "--format=%H", "codeflow/runtime..main"]).is_empty());
}
