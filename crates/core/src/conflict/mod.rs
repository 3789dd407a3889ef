//! Merging a branch into the head branch of a flow and healing the
//! conflicts a flow is known to produce.
//!
//! Conflicts on the source manifest, git-info files, dependency files and
//! the shared `eng/common` scripts always resolve. Files conflicted because
//! a forward flow and a backflow crossed are re-derived from the crossing
//! flow. Anything else aborts the merge and is reported to the caller.

pub mod manifest;
pub mod resolver;

pub use manifest::{merge_manifests, resolve_manifest_conflict};
pub use resolver::{ConflictResolver, MergeOutcome, MergeRequest};
