//! TOML-based configuration for the code flow engine.
//!
//! Every section is optional except `[vmr]`, whose `path` must point at the
//! working tree of the virtual monorepo.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::ConfigError;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level engine configuration loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeflowConfig {
    /// Location and layout of the VMR.
    pub vmr: VmrConfig,

    /// Patch creation and application settings.
    #[serde(default)]
    pub patches: PatchConfig,

    /// Flow behaviour settings.
    #[serde(default)]
    pub codeflow: FlowConfig,

    /// Logging settings (consumed by the binary).
    #[serde(default)]
    pub logging: LoggingConfig,
}

// ---------------------------------------------------------------------------
// VMR
// ---------------------------------------------------------------------------

/// Where the VMR lives and how it is laid out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmrConfig {
    /// Working tree of the VMR.
    pub path: PathBuf,

    /// Remote URI of the VMR, recorded in backflow `Source` elements.
    #[serde(default = "default_vmr_uri")]
    pub uri: String,

    /// Scratch directory for clones and patch files.
    #[serde(default = "default_tmp_path")]
    pub tmp_path: PathBuf,

    /// Directory inside the VMR holding one subdirectory per mapping.
    #[serde(default = "default_sources_dir")]
    pub sources_dir: String,

    /// VMR-relative path of the source manifest.
    #[serde(default = "default_source_manifest")]
    pub source_manifest: String,

    /// VMR-relative path of the source mappings definition.
    #[serde(default = "default_source_mappings")]
    pub source_mappings: String,

    /// VMR-relative directory for per-mapping git-info files. Empty disables them.
    #[serde(default = "default_git_info_dir")]
    pub git_info_dir: String,
}

fn default_vmr_uri() -> String {
    "https://github.com/dotnet/dotnet".into()
}
fn default_tmp_path() -> PathBuf {
    std::env::temp_dir().join("codeflow")
}
fn default_sources_dir() -> String {
    "src".into()
}
fn default_source_manifest() -> String {
    "src/source-manifest.json".into()
}
fn default_source_mappings() -> String {
    "src/source-mappings.json".into()
}
fn default_git_info_dir() -> String {
    "prereqs/git-info".into()
}

impl VmrConfig {
    /// Config for a VMR at `path` with every other field defaulted.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            uri: default_vmr_uri(),
            tmp_path: default_tmp_path(),
            sources_dir: default_sources_dir(),
            source_manifest: default_source_manifest(),
            source_mappings: default_source_mappings(),
            git_info_dir: default_git_info_dir(),
        }
    }

    /// VMR-relative directory holding the sources of `mapping`.
    pub fn mapping_dir(&self, mapping: &str) -> String {
        format!("{}/{}", self.sources_dir.trim_end_matches('/'), mapping)
    }

    /// VMR-relative path of the git-info file for `mapping`, if enabled.
    pub fn git_info_file(&self, mapping: &str) -> Option<String> {
        if self.git_info_dir.is_empty() {
            None
        } else {
            Some(format!(
                "{}/{}.props",
                self.git_info_dir.trim_end_matches('/'),
                mapping
            ))
        }
    }
}

// ---------------------------------------------------------------------------
// Patches
// ---------------------------------------------------------------------------

/// Patch creation limits and cloaking attributes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchConfig {
    /// Largest patch file (bytes) before the diff is split per directory.
    #[serde(default = "default_max_patch_size")]
    pub max_patch_size: u64,

    /// Git attribute exempting a file from exclusion rules.
    #[serde(default = "default_keep_attribute")]
    pub keep_attribute: String,

    /// Git attribute exempting a file from inclusion rules.
    #[serde(default = "default_ignore_attribute")]
    pub ignore_attribute: String,
}

fn default_max_patch_size() -> u64 {
    1_000_000_000
}
fn default_keep_attribute() -> String {
    "vmr-preserve".into()
}
fn default_ignore_attribute() -> String {
    "vmr-ignore".into()
}

impl Default for PatchConfig {
    fn default() -> Self {
        Self {
            max_patch_size: default_max_patch_size(),
            keep_attribute: default_keep_attribute(),
            ignore_attribute: default_ignore_attribute(),
        }
    }
}

// ---------------------------------------------------------------------------
// Code flow
// ---------------------------------------------------------------------------

/// Settings for the orchestrator and its collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowConfig {
    /// Mapping whose `eng/common` is shared with every repository.
    #[serde(default = "default_eng_common_mapping")]
    pub eng_common_mapping: String,

    /// Package whose update triggers an `eng/common` refresh in backflow.
    #[serde(default = "default_arcade_sdk_package")]
    pub arcade_sdk_package: String,

    /// How many earlier flows may be rebuilt when a patch fails to apply.
    #[serde(default = "default_max_recreation_depth")]
    pub max_recreation_depth: usize,

    /// Upper bound on concurrently running git processes.
    #[serde(default = "default_max_git_processes")]
    pub max_git_processes: usize,

    /// Lifetime of cached last-flow results.
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,

    /// Lifetime of a flow lock.
    #[serde(default = "default_lock_ttl")]
    pub lock_ttl_secs: u64,

    /// Name used for commits created by the engine.
    #[serde(default = "default_committer_name")]
    pub committer_name: String,

    /// Email used for commits created by the engine.
    #[serde(default = "default_committer_email")]
    pub committer_email: String,
}

fn default_eng_common_mapping() -> String {
    "arcade".into()
}
fn default_arcade_sdk_package() -> String {
    "Microsoft.DotNet.Arcade.Sdk".into()
}
fn default_max_recreation_depth() -> usize {
    1
}
fn default_max_git_processes() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}
fn default_cache_ttl() -> u64 {
    3600
}
fn default_lock_ttl() -> u64 {
    3600
}
fn default_committer_name() -> String {
    "codeflow-bot".into()
}
fn default_committer_email() -> String {
    "codeflow-bot@users.noreply.github.com".into()
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            eng_common_mapping: default_eng_common_mapping(),
            arcade_sdk_package: default_arcade_sdk_package(),
            max_recreation_depth: default_max_recreation_depth(),
            max_git_processes: default_max_git_processes(),
            cache_ttl_secs: default_cache_ttl(),
            lock_ttl_secs: default_lock_ttl(),
            committer_name: default_committer_name(),
            committer_email: default_committer_email(),
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Minimum tracing level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// ---------------------------------------------------------------------------
// Loading and validation
// ---------------------------------------------------------------------------

impl CodeflowConfig {
    /// Config for a VMR at `path` with every other setting defaulted.
    pub fn for_vmr(path: impl Into<PathBuf>) -> Self {
        Self {
            vmr: VmrConfig::at(path),
            patches: PatchConfig::default(),
            codeflow: FlowConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Load configuration from a TOML file at `path`.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config = Self::parse(&contents)?;
        debug!("configuration parsed successfully");
        Ok(config)
    }

    /// Parse configuration from TOML text.
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.vmr.path.as_os_str().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "vmr.path".into(),
                detail: "VMR path must not be empty".into(),
            });
        }
        if self.vmr.sources_dir.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "vmr.sources_dir".into(),
                detail: "sources directory must not be empty".into(),
            });
        }
        if self.patches.max_patch_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "patches.max_patch_size".into(),
                detail: "must be greater than 0".into(),
            });
        }
        if self.patches.keep_attribute.is_empty() || self.patches.ignore_attribute.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "patches".into(),
                detail: "cloaking attributes must not be empty".into(),
            });
        }
        if self.codeflow.max_git_processes == 0 {
            return Err(ConfigError::InvalidValue {
                field: "codeflow.max_git_processes".into(),
                detail: "must be greater than 0".into(),
            });
        }
        if self.codeflow.committer_email.is_empty() || !self.codeflow.committer_email.contains('@')
        {
            return Err(ConfigError::InvalidValue {
                field: "codeflow.committer_email".into(),
                detail: "must be a valid email address".into(),
            });
        }
        Ok(())
    }
}
