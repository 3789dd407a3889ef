//! The source manifest: the VMR's record of which commit of every mapping
//! (and of every inlined submodule) is currently embedded.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::ManifestError;

/// Manifest entry of a component repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryRecord {
    /// Mapping name, also the directory under the sources dir.
    pub path: String,
    pub remote_uri: String,
    pub commit_sha: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bar_id: Option<u64>,
}

/// Manifest entry of a submodule inlined into a mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmoduleRecord {
    /// `<mapping>/<path inside the repository>`.
    pub path: String,
    pub remote_uri: String,
    pub commit_sha: String,
}

impl SubmoduleRecord {
    /// Whether the submodule is nested under `mapping`.
    pub fn belongs_to(&self, mapping: &str) -> bool {
        self.path
            .strip_prefix(mapping)
            .is_some_and(|rest| rest.starts_with('/'))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceManifest {
    #[serde(default)]
    pub repositories: Vec<RepositoryRecord>,
    #[serde(default)]
    pub submodules: Vec<SubmoduleRecord>,
}

impl SourceManifest {
    pub fn parse(contents: &str) -> Result<Self, ManifestError> {
        Ok(serde_json::from_str(contents)?)
    }

    /// Load the manifest, treating a missing file as an empty manifest.
    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        if !path.exists() {
            debug!(path = %path.display(), "no source manifest yet");
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    pub fn to_json(&self) -> Result<String, ManifestError> {
        let mut json = serde_json::to_string_pretty(self)?;
        json.push('\n');
        Ok(json)
    }

    pub fn save(&self, path: &Path) -> Result<(), ManifestError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    pub fn repository(&self, mapping: &str) -> Option<&RepositoryRecord> {
        self.repositories.iter().find(|r| r.path == mapping)
    }

    pub fn update_repository(&mut self, record: RepositoryRecord) {
        match self.repositories.iter_mut().find(|r| r.path == record.path) {
            Some(existing) => *existing = record,
            None => {
                self.repositories.push(record);
                self.repositories.sort_by(|a, b| a.path.cmp(&b.path));
            }
        }
    }

    /// Remove a repository together with the submodules nested under it.
    pub fn remove_repository(&mut self, mapping: &str) {
        self.repositories.retain(|r| r.path != mapping);
        self.submodules.retain(|s| !s.belongs_to(mapping));
    }

    pub fn update_submodule(&mut self, record: SubmoduleRecord) {
        match self.submodules.iter_mut().find(|s| s.path == record.path) {
            Some(existing) => *existing = record,
            None => {
                self.submodules.push(record);
                self.submodules.sort_by(|a, b| a.path.cmp(&b.path));
            }
        }
    }

    pub fn remove_submodule(&mut self, path: &str) {
        self.submodules.retain(|s| s.path != path);
    }

    pub fn submodules_of<'a>(
        &'a self,
        mapping: &'a str,
    ) -> impl Iterator<Item = &'a SubmoduleRecord> + 'a {
        self.submodules.iter().filter(move |s| s.belongs_to(mapping))
    }

    /// Replace every entry belonging to `mapping` with the ones in `source`.
    ///
    /// Entries of other mappings are left untouched.
    pub fn take_mapping_from(&mut self, source: &SourceManifest, mapping: &str) {
        match source.repository(mapping) {
            Some(record) => {
                self.update_repository(record.clone());
                self.submodules.retain(|s| !s.belongs_to(mapping));
            }
            None => self.remove_repository(mapping),
        }
        for submodule in source.submodules_of(mapping) {
            self.update_submodule(submodule.clone());
        }
    }
}
