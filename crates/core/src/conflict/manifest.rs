//! Source manifest conflicts.

use tracing::info;

use crate::errors::ConflictError;
use crate::git::{ConflictSide, LocalGitRepo};
use crate::manifest::SourceManifest;

/// The manifest of the other side with every entry of `mapping` taken from
/// the side carrying the flow. Entries of other mappings are never touched
/// by a flow, so the result keeps both sides' changes.
pub fn merge_manifests(flow: &SourceManifest, other: &SourceManifest, mapping: &str) -> SourceManifest {
    let mut merged = other.clone();
    merged.take_mapping_from(flow, mapping);
    merged
}

/// Resolve a conflicted manifest at `path` and stage it.
pub async fn resolve_manifest_conflict(
    repo: &LocalGitRepo,
    path: &str,
    mapping: &str,
    flow_side: ConflictSide,
) -> Result<(), ConflictError> {
    let flow = read_side(repo, path, flow_side).await?;
    let other = read_side(repo, path, flow_side.opposite()).await?;
    let merged = merge_manifests(&flow, &other, mapping);

    merged.save(&repo.path().join(path))?;
    repo.stage(&[path]).await?;
    info!(path, mapping, "resolved source manifest conflict");
    Ok(())
}

async fn read_side(repo: &LocalGitRepo, path: &str, side: ConflictSide) -> Result<SourceManifest, ConflictError> {
    match repo.conflict_version(path, side).await? {
        Some(content) => Ok(SourceManifest::parse(&content)?),
        None => Ok(SourceManifest::default()),
    }
}
