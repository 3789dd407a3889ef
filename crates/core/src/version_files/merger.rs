//! Four-point merge of `Version.Details.xml` for forward flows.

use tracing::{debug, info, instrument};

use super::changes::{diff_maps, merge_changes, VersionFileChanges};
use super::details::{DependencyDetail, DependencyUpdate, VersionDetails};
use super::FileRevisions;
use crate::comments::CommentCollector;
use crate::errors::VersionFileError;

pub type DependencyChanges = VersionFileChanges<String, DependencyDetail>;

/// Dependency changes between two states of a file. Missing states count as
/// a file without dependencies.
pub fn dependency_changes(
    previous: Option<&str>,
    current: Option<&str>,
    file: &str,
    excluded: &[String],
    include_pinned: bool,
) -> Result<DependencyChanges, VersionFileError> {
    let before = parse_optional(previous, file)?.to_map(excluded, include_pinned);
    let after = parse_optional(current, file)?.to_map(excluded, include_pinned);
    Ok(diff_maps(&before, &after, |a, b| a.differs_from(b)))
}

pub(crate) fn parse_optional(content: Option<&str>, file: &str) -> Result<VersionDetails, VersionFileError> {
    match content {
        Some(content) if !content.trim().is_empty() => VersionDetails::parse(content, file),
        _ => Ok(VersionDetails::default()),
    }
}

/// The dependency with the greater semantic version. Incomparable versions
/// keep the source one, the repository's in a forward flow, and leave a
/// warning.
pub fn select_newer(
    target: &DependencyDetail,
    source: &DependencyDetail,
    comments: &CommentCollector,
) -> DependencyDetail {
    match (
        semver::Version::parse(&target.version),
        semver::Version::parse(&source.version),
    ) {
        (Ok(t), Ok(s)) if s > t => source.clone(),
        (Ok(_), Ok(_)) => target.clone(),
        _ => {
            comments.warning(format!(
                "A conflict was detected when merging dependency files. The dependency {} has conflicting \
                 incomparable version values `{}` and `{}`. Please verify and/or update the dependency version manually.",
                target.name, target.version, source.version
            ));
            source.clone()
        }
    }
}

/// Merges the dependency changes of a component repository into the copy
/// of its `Version.Details.xml` kept in the VMR.
#[derive(Debug, Clone)]
pub struct VersionDetailsMerger {
    comments: CommentCollector,
}

impl VersionDetailsMerger {
    pub fn new(comments: CommentCollector) -> Self {
        Self { comments }
    }

    /// Merge both sides' changes into the target's working tree file and
    /// stage it. Returns the updates that were applied.
    #[instrument(skip(self, target, source), fields(file = %target.path))]
    pub async fn merge(
        &self,
        target: FileRevisions<'_>,
        source: FileRevisions<'_>,
    ) -> Result<Vec<DependencyUpdate>, VersionFileError> {
        info!(
            source_from = source.previous,
            source_to = source.current,
            target_from = target.previous,
            target_to = target.current,
            "resolving dependency updates"
        );

        let target_changes = dependency_changes(
            target.read_previous()?.as_deref(),
            target.read_current()?.as_deref(),
            target.path,
            &[],
            true,
        )?;
        let source_changes = dependency_changes(
            source.read_previous()?.as_deref(),
            source.read_current()?.as_deref(),
            source.path,
            &[],
            true,
        )?;

        let merged = merge_changes(
            &target_changes,
            &source_changes,
            |_, t, s| select_newer(t, s, &self.comments),
            target.path,
            &self.comments,
        );
        if !merged.has_changes() {
            debug!("no dependency changes to merge");
            return Ok(Vec::new());
        }

        let full_path = target.repo.path().join(target.path);
        let content = match std::fs::read_to_string(&full_path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("target has no dependency file, skipping");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };
        let mut details = VersionDetails::parse(&content, target.path)?;
        let updates = apply_changes(&mut details, &merged);
        if updates.is_empty() {
            return Ok(updates);
        }

        std::fs::write(&full_path, details.write_over(&content, target.path)?)?;
        target.repo.stage(&[target.path]).await?;
        info!(count = updates.len(), "merged dependency updates");
        Ok(updates)
    }
}

/// Apply merged changes to a parsed file and describe what changed.
pub fn apply_changes(details: &mut VersionDetails, changes: &DependencyChanges) -> Vec<DependencyUpdate> {
    let mut updates = Vec::new();
    for name in &changes.removals {
        if let Some(existing) = details.dependency(name).cloned() {
            details.remove(name);
            updates.push(DependencyUpdate {
                from: Some(existing),
                to: None,
            });
        }
    }
    for (name, dependency) in changes.values() {
        let existing = details.dependency(name).cloned();
        if existing.as_ref().is_some_and(|e| !e.differs_from(dependency)) {
            continue;
        }
        details.upsert(dependency.clone());
        updates.push(DependencyUpdate {
            from: existing,
            to: Some(dependency.clone()),
        });
    }
    updates
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comments::CommentKind;
    use crate::git::test_support::{commit_file, git_available, init_repo};
    use crate::version_files::details::DependencyType;

    fn details(deps: &[(&str, &str)]) -> String {
        VersionDetails {
            dependencies: deps
                .iter()
                .map(|(name, version)| DependencyDetail {
                    name: name.to_string(),
                    version: version.to_string(),
                    repo_uri: "https://github.com/dotnet/runtime".into(),
                    commit: format!("sha-{version}"),
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

    #[test]
    fn test_select_newer() {
        let comments = CommentCollector::new();
        let make = |v: &str| DependencyDetail {
            name: "P".into(),
            version: v.into(),
            repo_uri: String::new(),
            commit: String::new(),
            pinned: false,
            skip_property: false,
            coherent_parent_dependency: None,
            dependency_type: DependencyType::Product,
        };
        assert_eq!(select_newer(&make("2.0.0"), &make("1.9.0"), &comments).version, "2.0.0");
        assert_eq!(select_newer(&make("1.9.0"), &make("2.0.0"), &comments).version, "2.0.0");
        assert!(!comments.has_warnings());

        assert_eq!(select_newer(&make("2.0.0"), &make("1.0"), &comments).version, "1.0");
        let warnings = comments.comments();
        assert_eq!(warnings[0].kind, CommentKind::Warning);
        assert!(warnings[0].text.contains("conflicting incomparable version values"));
    }

    #[test]
    fn test_changes_ignore_unchanged_dependencies() {
        let before = details(&[("A", "1.0.0"), ("B", "1.0.0")]);
        let after = details(&[("A", "1.0.0"), ("B", "1.1.0"), ("C", "1.0.0")]);
        let changes = dependency_changes(Some(&before), Some(&after), "f", &[], true).unwrap();
        assert!(changes.updates.contains_key("B"));
        assert!(changes.additions.contains_key("C"));
        assert!(!changes.updates.contains_key("A"));

        let excluded = dependency_changes(Some(&before), Some(&after), "f", &["B".to_string()], true).unwrap();
        assert!(!excluded.updates.contains_key("B"));
    }

    #[tokio::test]
    async fn test_merge_picks_newer_version() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let vmr = init_repo(&dir.path().join("vmr"));
        let repo = init_repo(&dir.path().join("repo"));
        let path = "src/runtime/eng/Version.Details.xml";

        let base = details(&[("P", "1.0.0"), ("Q", "1.0.0"), ("R", "1.0.0")]);
        let t1 = commit_file(&vmr, path, &base, "t1");
        let t2 = commit_file(&vmr, path, &details(&[("P", "2.0.0"), ("Q", "1.0.0"), ("R", "1.0.0")]), "t2");
        let s1 = commit_file(&repo, "eng/Version.Details.xml", &base, "s1");
        let s2 = commit_file(
            &repo,
            "eng/Version.Details.xml",
            &details(&[("P", "1.9.0"), ("R", "1.0.0"), ("S", "3.0.0")]),
            "s2",
        );

        let merger = VersionDetailsMerger::new(CommentCollector::new());
        let updates = merger
            .merge(
                FileRevisions { repo: &vmr, path, previous: &t1, current: &t2 },
                FileRevisions { repo: &repo, path: "eng/Version.Details.xml", previous: &s1, current: &s2 },
            )
            .await
            .unwrap();

        let merged = VersionDetails::parse(&std::fs::read_to_string(vmr.path().join(path)).unwrap(), path).unwrap();
        assert_eq!(merged.dependency("P").unwrap().version, "2.0.0");
        assert!(merged.dependency("Q").is_none());
        assert_eq!(merged.dependency("S").unwrap().version, "3.0.0");
        assert!(updates.iter().any(|u| u.is_removal() && u.name() == "Q"));
        assert!(updates.iter().any(|u| u.is_addition() && u.name() == "S"));
        // P already carries the winning version on the target side.
        assert!(!updates.iter().any(|u| u.name() == "P"));
    }
}
