//! Patch engine: cloaked diffs between two commits of a tree, submodule
//! inlining, size-driven splitting and application to another tree.

pub mod filters;
pub mod handler;

pub use filters::PatchFilters;
pub use handler::{submodule_changes, ApplyOptions, PatchHandler, PatchRequest, PatchSet, SubmoduleChange};
