//! Domain model types shared by the flow engine.
//!
//! A [`Codeflow`] is one synchronization event between the VMR and a
//! component repository. Flows are never persisted; they are rebuilt from
//! the source manifest and the repository's dependency file on demand.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Git's well-known empty tree object.
pub const EMPTY_TREE_SHA: &str = "4b825dc642cb6eb9a060e54bf8d69288fbee4904";

/// All-zero object id git prints for an absent side of a change.
pub const EMPTY_OBJECT_SHA: &str = "0000000000000000000000000000000000000000";

/// First seven characters of a commit SHA.
pub fn short_sha(sha: &str) -> &str {
    sha.get(..7).unwrap_or(sha)
}

// ---------------------------------------------------------------------------
// Flows
// ---------------------------------------------------------------------------

/// Direction of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowDirection {
    /// Component repository into the VMR.
    Forward,
    /// VMR into a component repository.
    Backflow,
}

impl std::fmt::Display for FlowDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Forward => write!(f, "forward"),
            Self::Backflow => write!(f, "backflow"),
        }
    }
}

/// A single synchronization event.
///
/// Both SHAs are always stored; which one is the origin depends on the
/// direction. Use [`Codeflow::source_sha`] and [`Codeflow::target_sha`] when
/// the direction should not matter to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Codeflow {
    pub direction: FlowDirection,
    /// Commit in the component repository.
    pub repo_sha: String,
    /// Commit in the VMR.
    pub vmr_sha: String,
}

impl Codeflow {
    /// A flow of repository commit `repo_sha` into VMR commit `vmr_sha`.
    pub fn forward(repo_sha: impl Into<String>, vmr_sha: impl Into<String>) -> Self {
        Self {
            direction: FlowDirection::Forward,
            repo_sha: repo_sha.into(),
            vmr_sha: vmr_sha.into(),
        }
    }

    /// A flow of VMR commit `vmr_sha` into repository commit `repo_sha`.
    pub fn backflow(vmr_sha: impl Into<String>, repo_sha: impl Into<String>) -> Self {
        Self {
            direction: FlowDirection::Backflow,
            repo_sha: repo_sha.into(),
            vmr_sha: vmr_sha.into(),
        }
    }

    pub fn is_forward(&self) -> bool {
        self.direction == FlowDirection::Forward
    }

    /// Commit on the side the flow originates from.
    pub fn source_sha(&self) -> &str {
        match self.direction {
            FlowDirection::Forward => &self.repo_sha,
            FlowDirection::Backflow => &self.vmr_sha,
        }
    }

    /// Commit on the side the flow lands in.
    pub fn target_sha(&self) -> &str {
        match self.direction {
            FlowDirection::Forward => &self.vmr_sha,
            FlowDirection::Backflow => &self.repo_sha,
        }
    }

    /// Name of the disposable branch the flow is prepared on.
    pub fn work_branch_name(&self) -> String {
        format!(
            "codeflow/{}/{}-{}",
            self.direction,
            short_sha(self.source_sha()),
            short_sha(self.target_sha())
        )
    }
}

impl std::fmt::Display for Codeflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} -> {}",
            self.direction,
            short_sha(self.source_sha()),
            short_sha(self.target_sha())
        )
    }
}

/// The most recent flows of a mapping, computed at the start of every run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastFlows {
    /// Whichever of the two recorded flows happened last.
    pub last_flow: Codeflow,
    pub last_backflow: Option<Codeflow>,
    pub last_forward_flow: Codeflow,
    /// Set when the last flows of both directions crossed each other.
    pub crossing_flow: Option<Codeflow>,
}

// ---------------------------------------------------------------------------
// Builds
// ---------------------------------------------------------------------------

/// An asset produced by a build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildAsset {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub non_shipping: bool,
}

/// Build metadata for the commit being flowed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Build {
    pub id: u64,
    /// Commit the build was produced from.
    pub commit: String,
    /// Remote URI of the repository that was built.
    pub repository: String,
    #[serde(default)]
    pub build_number: String,
    #[serde(default)]
    pub package_version: Option<String>,
    #[serde(default)]
    pub assets: Vec<BuildAsset>,
}

impl Build {
    /// Asset of the given name, compared case-insensitively.
    pub fn asset(&self, name: &str) -> Option<&BuildAsset> {
        self.assets
            .iter()
            .find(|a| a.name.eq_ignore_ascii_case(name))
    }
}

// ---------------------------------------------------------------------------
// Patches
// ---------------------------------------------------------------------------

/// A patch file and the directory of the destination tree it applies under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmrIngestionPatch {
    pub path: PathBuf,
    /// Destination subdirectory, `None` for the repository root.
    pub application_path: Option<String>,
}

impl VmrIngestionPatch {
    pub fn new(path: impl Into<PathBuf>, application_path: Option<String>) -> Self {
        Self {
            path: path.into(),
            application_path,
        }
    }
}
