//! Source mappings: which repositories live in the VMR and which of their
//! files are flowed.
//!
//! The definition file is JSON with a `defaults` block whose excludes are
//! prepended to every mapping's own excludes unless it sets `ignoreDefaults`.

use std::path::Path;

use serde::Deserialize;
use tracing::debug;

use crate::errors::ManifestError;

/// Glob matching everything, used when a mapping has no includes.
pub const INCLUDE_ALL: &str = "**/*";

/// Identity and cloaking rules of one component repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceMapping {
    pub name: String,
    pub default_remote: String,
    pub default_ref: String,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub disable_synchronization: bool,
}

impl SourceMapping {
    /// A mapping that flows everything from `remote`.
    pub fn new(name: impl Into<String>, remote: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default_remote: remote.into(),
            default_ref: "main".into(),
            include: vec![INCLUDE_ALL.into()],
            exclude: Vec::new(),
            disable_synchronization: false,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MappingsFile {
    #[serde(default)]
    defaults: MappingDefaults,
    #[serde(default)]
    mappings: Vec<MappingEntry>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MappingDefaults {
    #[serde(default)]
    default_ref: Option<String>,
    #[serde(default)]
    include: Vec<String>,
    #[serde(default)]
    exclude: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MappingEntry {
    name: String,
    default_remote: String,
    #[serde(default)]
    default_ref: Option<String>,
    #[serde(default)]
    include: Vec<String>,
    #[serde(default)]
    exclude: Vec<String>,
    #[serde(default)]
    disable_synchronization: bool,
    #[serde(default)]
    ignore_defaults: bool,
}

/// Parsed contents of the source mappings file.
#[derive(Debug, Clone, Default)]
pub struct SourceMappings {
    mappings: Vec<SourceMapping>,
}

impl SourceMappings {
    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        debug!(path = %path.display(), "loading source mappings");
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self, ManifestError> {
        let file: MappingsFile = serde_json::from_str(contents)?;
        let default_ref = file
            .defaults
            .default_ref
            .clone()
            .unwrap_or_else(|| "main".to_string());

        let mut mappings = Vec::with_capacity(file.mappings.len());
        for entry in file.mappings {
            if entry.name.trim().is_empty() {
                return Err(ManifestError::InvalidMapping {
                    name: entry.name,
                    detail: "name must not be empty".into(),
                });
            }
            if entry.name.contains('/') || entry.name.contains('\\') {
                return Err(ManifestError::InvalidMapping {
                    name: entry.name,
                    detail: "name must not contain path separators".into(),
                });
            }
            if mappings.iter().any(|m: &SourceMapping| m.name == entry.name) {
                return Err(ManifestError::InvalidMapping {
                    name: entry.name,
                    detail: "mapping is defined more than once".into(),
                });
            }

            let mut include = if entry.ignore_defaults {
                Vec::new()
            } else {
                file.defaults.include.clone()
            };
            include.extend(entry.include);
            if include.is_empty() {
                include.push(INCLUDE_ALL.to_string());
            }

            let mut exclude = if entry.ignore_defaults {
                Vec::new()
            } else {
                file.defaults.exclude.clone()
            };
            exclude.extend(entry.exclude);

            mappings.push(SourceMapping {
                name: entry.name,
                default_remote: entry.default_remote,
                default_ref: entry.default_ref.unwrap_or_else(|| default_ref.clone()),
                include,
                exclude,
                disable_synchronization: entry.disable_synchronization,
            });
        }

        Ok(Self { mappings })
    }

    pub fn from_mappings(mappings: Vec<SourceMapping>) -> Self {
        Self { mappings }
    }

    pub fn get(&self, name: &str) -> Result<&SourceMapping, ManifestError> {
        self.mappings
            .iter()
            .find(|m| m.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| ManifestError::MappingNotFound(name.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &SourceMapping> {
        self.mappings.iter()
    }
}
