//! Submodules recorded in `.gitmodules` at a given commit.

use std::path::Path;

use git2::ObjectType;
use regex_lite::Regex;
use tracing::warn;

use super::repo::LocalGitRepo;
use crate::errors::GitError;

/// A submodule and the commit its gitlink points to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitSubmodule {
    pub name: String,
    pub path: String,
    pub url: String,
    pub commit: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct GitModulesEntry {
    name: String,
    path: Option<String>,
    url: Option<String>,
}

fn parse_gitmodules(content: &str) -> Vec<GitModulesEntry> {
    let section = Regex::new(r#"^\[submodule\s+"(?P<name>[^"]+)"\]$"#).ok();
    let key_value = Regex::new(r"^(?P<key>path|url)\s*=\s*(?P<value>.+)$").ok();
    let (Some(section), Some(key_value)) = (section, key_value) else {
        return Vec::new();
    };

    let mut entries: Vec<GitModulesEntry> = Vec::new();
    for line in content.lines().map(str::trim) {
        if let Some(caps) = section.captures(line) {
            entries.push(GitModulesEntry {
                name: caps["name"].to_string(),
                path: None,
                url: None,
            });
            continue;
        }
        let (Some(caps), Some(current)) = (key_value.captures(line), entries.last_mut()) else {
            continue;
        };
        let value = caps["value"].trim().to_string();
        match &caps["key"] {
            "path" => current.path = Some(value),
            _ => current.url = Some(value),
        }
    }
    entries
}

impl LocalGitRepo {
    /// Submodules declared at `commit`, with their gitlink SHAs.
    ///
    /// Declarations whose gitlink is missing from the tree are skipped.
    pub fn submodules_at(&self, commit: &str) -> Result<Vec<GitSubmodule>, GitError> {
        let Some(content) = self.file_at_ref(".gitmodules", commit)? else {
            return Ok(Vec::new());
        };

        let repo = self.open()?;
        let tree = repo
            .revparse_single(commit)
            .and_then(|o| o.peel_to_commit())
            .map_err(|_| GitError::RefNotFound(commit.to_string()))?
            .tree()?;

        let mut submodules = Vec::new();
        for entry in parse_gitmodules(&content) {
            let (Some(path), Some(url)) = (entry.path, entry.url) else {
                return Err(GitError::InvalidSubmodules {
                    commit: commit.to_string(),
                    detail: format!("submodule '{}' lacks a path or url", entry.name),
                });
            };
            let gitlink = match tree.get_path(Path::new(&path)) {
                Ok(tree_entry) if tree_entry.kind() == Some(ObjectType::Commit) => tree_entry.id(),
                _ => {
                    warn!(submodule = %entry.name, path = %path, commit, "submodule has no gitlink");
                    continue;
                }
            };
            submodules.push(GitSubmodule {
                name: entry.name,
                path,
                url,
                commit: gitlink.to_string(),
            });
        }
        Ok(submodules)
    }
}
