//! Dependency version files and the merges that keep them consistent on
//! both sides of a flow.

use crate::errors::GitError;
use crate::git::LocalGitRepo;

pub mod changes;
pub mod dependency_updater;
pub mod details;
pub mod json;
pub mod merger;

pub use changes::{diff_maps, merge_changes, VersionFileChanges};
pub use dependency_updater::{BackflowDependencyUpdater, BackflowUpdateRequest};
pub use details::{DependencyDetail, DependencyType, DependencyUpdate, SourceDependency, VersionDetails};
pub use json::{JsonFileMerger, JsonPath, JsonValue};
pub use merger::VersionDetailsMerger;

pub const VERSION_DETAILS_XML: &str = "eng/Version.Details.xml";
pub const VERSIONS_PROPS: &str = "eng/Versions.props";
pub const GLOBAL_JSON: &str = "global.json";
pub const DOTNET_TOOLS_JSON: &str = ".config/dotnet-tools.json";

/// Directory of the shared build scripts copied from the tooling mapping.
pub const ENG_COMMON_DIR: &str = "eng/common";

/// Every file that declares dependency versions.
pub const DEPENDENCY_FILES: &[&str] = &[VERSION_DETAILS_XML, VERSIONS_PROPS, GLOBAL_JSON, DOTNET_TOOLS_JSON];

/// Files owned by the version file mergers. They never travel in patches.
pub const CODEFLOW_DEPENDENCY_FILES: &[&str] = &[VERSION_DETAILS_XML, GLOBAL_JSON, DOTNET_TOOLS_JSON];

/// JSON files merged property by property.
pub const JSON_VERSION_FILES: &[&str] = &[GLOBAL_JSON, DOTNET_TOOLS_JSON];

/// A version file of one repository at the two commits of a four-point
/// merge.
#[derive(Debug, Clone, Copy)]
pub struct FileRevisions<'a> {
    pub repo: &'a LocalGitRepo,
    pub path: &'a str,
    pub previous: &'a str,
    pub current: &'a str,
}

impl FileRevisions<'_> {
    pub fn read_previous(&self) -> Result<Option<String>, GitError> {
        self.repo.file_at_ref(self.path, self.previous)
    }

    pub fn read_current(&self) -> Result<Option<String>, GitError> {
        self.repo.file_at_ref(self.path, self.current)
    }
}
