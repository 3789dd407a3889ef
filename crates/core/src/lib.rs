//! Code flow core library.
//!
//! This crate keeps a virtual monorepo (VMR) and its component repositories
//! in sync: forward flows carry repository changes into the VMR, backflows
//! carry VMR changes back out. It provides configuration, the git facade,
//! patch creation and application, last-flow resolution, conflict
//! resolution, version file merging and the flow engine tying them together.

pub mod build_info;
pub mod clone_manager;
pub mod codeflow;
pub mod comments;
pub mod config;
pub mod conflict;
pub mod errors;
pub mod git;
pub mod lock;
pub mod manifest;
pub mod mapping;
pub mod models;
pub mod patch;
pub mod version_files;

// Re-exports for convenience.
pub use codeflow::{CodeflowEngine, CodeflowResult, FlowRequest};
pub use config::CodeflowConfig;
pub use errors::{CodeflowError, CoreError};
pub use models::{Build, Codeflow, FlowDirection, LastFlows};
