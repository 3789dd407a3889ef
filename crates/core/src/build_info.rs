//! Build metadata providers.
//!
//! The engine only needs to look a build up by id; where builds come from is
//! up to the embedding application.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use crate::errors::ManifestError;
use crate::models::Build;

#[async_trait]
pub trait BuildMetadataProvider: Send + Sync {
    async fn get_build(&self, build_id: u64) -> Result<Option<Build>, ManifestError>;
}

/// Provider over a fixed set of builds.
#[derive(Debug, Default, Clone)]
pub struct StaticBuildProvider {
    builds: HashMap<u64, Build>,
}

impl StaticBuildProvider {
    pub fn new(builds: impl IntoIterator<Item = Build>) -> Self {
        Self {
            builds: builds.into_iter().map(|b| (b.id, b)).collect(),
        }
    }
}

#[async_trait]
impl BuildMetadataProvider for StaticBuildProvider {
    async fn get_build(&self, build_id: u64) -> Result<Option<Build>, ManifestError> {
        Ok(self.builds.get(&build_id).cloned())
    }
}

/// Provider reading a JSON array of builds from disk on every lookup.
#[derive(Debug, Clone)]
pub struct JsonFileBuildProvider {
    path: PathBuf,
}

impl JsonFileBuildProvider {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl BuildMetadataProvider for JsonFileBuildProvider {
    async fn get_build(&self, build_id: u64) -> Result<Option<Build>, ManifestError> {
        debug!(path = %self.path.display(), build_id, "reading build metadata");
        let contents = tokio::fs::read_to_string(&self.path).await?;
        let builds: Vec<Build> = serde_json::from_str(&contents)?;
        Ok(builds.into_iter().find(|b| b.id == build_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(id: u64) -> Build {
        Build {
            id,
            commit: format!("sha{id}"),
            repository: "https://github.com/acme/repo".into(),
            build_number: format!("20240101.{id}"),
            package_version: None,
            assets: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_static_provider() {
        let provider = StaticBuildProvider::new(vec![build(1), build(2)]);
        assert_eq!(provider.get_build(2).await.unwrap().unwrap().commit, "sha2");
        assert!(provider.get_build(3).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_json_file_provider() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("builds.json");
        std::fs::write(&path, serde_json::to_string(&vec![build(5)]).unwrap()).unwrap();

        let provider = JsonFileBuildProvider::new(&path);
        let found = provider.get_build(5).await.unwrap().unwrap();
        assert_eq!(found.build_number, "20240101.5");
        assert!(provider.get_build(6).await.unwrap().is_none());
    }
}
