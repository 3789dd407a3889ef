//! Git access for the flow engine.

pub mod repo;
pub mod submodules;

pub use repo::{ConflictSide, GitIdentity, GitObjectType, LocalGitRepo, ProcessOutput, RepoFactory};
pub use submodules::GitSubmodule;
