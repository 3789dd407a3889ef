//! Cloaking filters expressed as git pathspecs.
//!
//! Every pathspec carries the `top` magic so it is anchored at the root of
//! the repository no matter which subdirectory git runs in.
//!
//! | rule          | pathspec                                  | per-file escape          |
//! |---------------|-------------------------------------------|--------------------------|
//! | include       | `:(top,glob,attr:!<ignore>)<glob>`         | `<ignore>` attribute     |
//! | exclude       | `:(top,exclude,glob,attr:!<keep>)<glob>`   | `<keep>` attribute       |
//! | hard exclude  | `:(top,exclude)<path>`                     | none                     |

use glob_match::glob_match;

use crate::config::PatchConfig;
use crate::mapping::{SourceMapping, INCLUDE_ALL};

/// Which files of a tree take part in a flow.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchFilters {
    /// Root-relative globs; empty means everything.
    pub includes: Vec<String>,
    /// Root-relative globs that never flow unless the file carries the keep attribute.
    pub excludes: Vec<String>,
    /// Root-relative paths that never flow (submodules, version files).
    pub hard_excludes: Vec<String>,
}

impl PatchFilters {
    pub fn for_mapping(mapping: &SourceMapping) -> Self {
        Self {
            includes: mapping.include.clone(),
            excludes: mapping.exclude.clone(),
            hard_excludes: Vec::new(),
        }
    }

    pub fn with_hard_excludes<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.hard_excludes.extend(paths.into_iter().map(Into::into));
        self
    }

    /// The same filters for a tree mounted under `prefix`.
    pub fn prefixed(&self, prefix: &str) -> Self {
        let prefix = prefix.trim_end_matches('/');
        let join = |p: &String| format!("{prefix}/{p}");
        Self {
            includes: self.includes.iter().map(join).collect(),
            excludes: self.excludes.iter().map(join).collect(),
            hard_excludes: self.hard_excludes.iter().map(join).collect(),
        }
    }

    /// Filters for the submodule at `path`: rules under it, re-rooted.
    pub fn for_submodule(&self, path: &str) -> Self {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let strip = |rules: &[String]| -> Vec<String> {
            rules
                .iter()
                .filter_map(|r| r.strip_prefix(&prefix))
                .map(str::to_string)
                .collect()
        };
        let mut includes = strip(&self.includes);
        if includes.is_empty() {
            includes.push(INCLUDE_ALL.to_string());
        }
        Self {
            includes,
            excludes: strip(&self.excludes),
            hard_excludes: strip(&self.hard_excludes),
        }
    }

    fn include_everything(&self) -> bool {
        self.includes.is_empty() || self.includes.iter().any(|i| i == INCLUDE_ALL)
    }

    /// Whether a root-relative path passes the include globs.
    pub fn includes_path(&self, path: &str) -> bool {
        self.include_everything() || self.includes.iter().any(|glob| glob_match(glob, path))
    }

    /// Pathspecs for `git diff` / `git rm`. Without `positive` only the
    /// exclusions are emitted, for callers that name paths themselves.
    pub fn pathspecs(&self, config: &PatchConfig, positive: bool) -> Vec<String> {
        let mut specs = Vec::new();
        if positive {
            specs.extend(
                self.includes
                    .iter()
                    .map(|glob| format!(":(top,glob,attr:!{}){}", config.ignore_attribute, glob)),
            );
        }
        specs.extend(
            self.excludes
                .iter()
                .map(|glob| format!(":(top,exclude,glob,attr:!{}){}", config.keep_attribute, glob)),
        );
        specs.extend(
            self.hard_excludes
                .iter()
                .map(|path| format!(":(top,exclude){path}")),
        );
        specs
    }
}
