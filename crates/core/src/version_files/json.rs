//! Property-level merge of flat JSON tool version files such as
//! `global.json` and `.config/dotnet-tools.json`.
//!
//! Documents are flattened into `path -> value` maps where only booleans,
//! numbers, strings and arrays of strings may appear as leaves. Both sides
//! are diffed against their own previous state and the two change sets are
//! merged on top of the target's current document.

use std::collections::BTreeMap;
use std::fmt;

use serde_json::{Map, Value};
use tracing::{debug, info, instrument};

use super::changes::{diff_maps, merge_changes, VersionFileChanges};
use super::FileRevisions;
use crate::comments::CommentCollector;
use crate::errors::VersionFileError;

/// Path of a property inside a JSON document. Segments may contain dots.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JsonPath(Vec<String>);

impl JsonPath {
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    fn child(&self, segment: &str) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment.to_string());
        Self(segments)
    }
}

impl fmt::Display for JsonPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("."))
    }
}

/// A leaf of a flattened document.
#[derive(Debug, Clone, PartialEq)]
pub enum JsonValue {
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    StringArray(Vec<String>),
}

impl JsonValue {
    fn to_value(&self) -> Value {
        match self {
            Self::Bool(b) => Value::Bool(*b),
            Self::Number(n) => Value::Number(n.clone()),
            Self::String(s) => Value::String(s.clone()),
            Self::StringArray(items) => Value::Array(items.iter().cloned().map(Value::String).collect()),
        }
    }
}

impl fmt::Display for JsonValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s}"),
            Self::StringArray(items) => write!(f, "[{}]", items.join(", ")),
        }
    }
}

pub type JsonChanges = VersionFileChanges<JsonPath, JsonValue>;

/// Flatten a document into its leaves. Empty objects contribute nothing.
pub fn flatten(document: &Value, file: &str) -> Result<BTreeMap<JsonPath, JsonValue>, VersionFileError> {
    let mut leaves = BTreeMap::new();
    match document {
        Value::Object(map) => flatten_object(map, &JsonPath::default(), file, &mut leaves)?,
        _ => {
            return Err(VersionFileError::UnsupportedJsonValue {
                file: file.to_string(),
                path: String::new(),
            })
        }
    }
    Ok(leaves)
}

fn flatten_object(
    map: &Map<String, Value>,
    prefix: &JsonPath,
    file: &str,
    leaves: &mut BTreeMap<JsonPath, JsonValue>,
) -> Result<(), VersionFileError> {
    for (key, value) in map {
        let path = prefix.child(key);
        let leaf = match value {
            Value::Object(inner) => {
                flatten_object(inner, &path, file, leaves)?;
                continue;
            }
            Value::Bool(b) => JsonValue::Bool(*b),
            Value::Number(n) => JsonValue::Number(n.clone()),
            Value::String(s) => JsonValue::String(s.clone()),
            Value::Array(items) => {
                let strings: Option<Vec<String>> = items
                    .iter()
                    .map(|item| item.as_str().map(str::to_string))
                    .collect();
                match strings {
                    Some(strings) => JsonValue::StringArray(strings),
                    None => return Err(unsupported(file, &path)),
                }
            }
            Value::Null => return Err(unsupported(file, &path)),
        };
        leaves.insert(path, leaf);
    }
    Ok(())
}

fn unsupported(file: &str, path: &JsonPath) -> VersionFileError {
    VersionFileError::UnsupportedJsonValue {
        file: file.to_string(),
        path: path.to_string(),
    }
}

fn parse(content: Option<&str>, file: &str) -> Result<BTreeMap<JsonPath, JsonValue>, VersionFileError> {
    match content {
        Some(content) if !content.trim().is_empty() => flatten(&serde_json::from_str(content)?, file),
        _ => Ok(BTreeMap::new()),
    }
}

/// Changes between two states of a document. Missing states count as `{}`.
pub fn diff(previous: Option<&str>, current: Option<&str>, file: &str) -> Result<JsonChanges, VersionFileError> {
    let before = parse(previous, file)?;
    let after = parse(current, file)?;
    Ok(diff_maps(&before, &after, |a, b| a != b))
}

/// Decide a property changed differently on both sides.
///
/// Versions take the greater semantic version and numbers the larger value.
/// String arrays are unioned in target order. Anything else keeps the
/// repository value and leaves a warning for manual review. The repository
/// is the target of a backflow and the source of a forward flow, which is
/// what `prefer_source` selects.
pub fn pick_winner(
    path: &JsonPath,
    target: &JsonValue,
    source: &JsonValue,
    prefer_source: bool,
    file: &str,
    comments: &CommentCollector,
) -> JsonValue {
    match (target, source) {
        (JsonValue::String(t), JsonValue::String(s)) => {
            match (semver::Version::parse(t), semver::Version::parse(s)) {
                (Ok(tv), Ok(sv)) => {
                    if sv > tv {
                        source.clone()
                    } else {
                        target.clone()
                    }
                }
                _ => conflict(path, target, source, prefer_source, file, comments),
            }
        }
        (JsonValue::Number(t), JsonValue::Number(s)) => match (t.as_f64(), s.as_f64()) {
            (Some(tv), Some(sv)) if sv > tv => source.clone(),
            (Some(_), Some(_)) => target.clone(),
            _ => conflict(path, target, source, prefer_source, file, comments),
        },
        (JsonValue::StringArray(t), JsonValue::StringArray(s)) => {
            let mut union = t.clone();
            for item in s {
                if !union.contains(item) {
                    union.push(item.clone());
                }
            }
            JsonValue::StringArray(union)
        }
        _ => conflict(path, target, source, prefer_source, file, comments),
    }
}

fn conflict(
    path: &JsonPath,
    target: &JsonValue,
    source: &JsonValue,
    prefer_source: bool,
    file: &str,
    comments: &CommentCollector,
) -> JsonValue {
    let kept = if prefer_source { source } else { target };
    comments.warning(format!(
        "There was a conflicting value for `{path}` in {file}: `{target}` in the target and `{source}` in the source. \
         Keeping `{kept}`, please review it manually."
    ));
    kept.clone()
}

/// Apply `changes` to `document`: removals first, pruning parents they
/// leave empty, then additions and updates, creating parent objects as
/// needed.
pub fn apply_changes(document: &mut Value, changes: &JsonChanges) {
    if !document.is_object() {
        *document = Value::Object(Map::new());
    }
    for path in &changes.removals {
        remove_path(document, path.segments());
    }
    for (path, value) in changes.values() {
        set_path(document, path.segments(), value.to_value());
    }
}

fn remove_path(node: &mut Value, segments: &[String]) -> bool {
    let Some((first, rest)) = segments.split_first() else {
        return false;
    };
    let Some(map) = node.as_object_mut() else {
        return false;
    };
    if rest.is_empty() {
        return map.shift_remove(first).is_some();
    }
    let Some(child) = map.get_mut(first) else {
        return false;
    };
    let removed = remove_path(child, rest);
    if removed && child.as_object().is_some_and(Map::is_empty) {
        map.shift_remove(first);
    }
    removed
}

fn set_path(node: &mut Value, segments: &[String], value: Value) {
    let Some((first, rest)) = segments.split_first() else {
        return;
    };
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    let Some(map) = node.as_object_mut() else {
        return;
    };
    if rest.is_empty() {
        map.insert(first.clone(), value);
        return;
    }
    let child = map
        .entry(first.clone())
        .or_insert_with(|| Value::Object(Map::new()));
    set_path(child, rest, value);
}

/// Four-point merge of JSON documents, returning the merged document text.
///
/// `base` is the document the changes are applied to, usually the target
/// file as it currently exists on the head branch.
#[allow(clippy::too_many_arguments)]
pub fn merge_documents(
    target_previous: Option<&str>,
    target_current: Option<&str>,
    source_previous: Option<&str>,
    source_current: Option<&str>,
    base: &str,
    prefer_source: bool,
    file: &str,
    comments: &CommentCollector,
) -> Result<String, VersionFileError> {
    let target_changes = diff(target_previous, target_current, file)?;
    let source_changes = diff(source_previous, source_current, file)?;
    let merged = merge_changes(
        &target_changes,
        &source_changes,
        |path, t, s| pick_winner(path, t, s, prefer_source, file, comments),
        file,
        comments,
    );
    debug!(
        file,
        removals = merged.removals.len(),
        additions = merged.additions.len(),
        updates = merged.updates.len(),
        "merged JSON changes"
    );

    let mut document: Value = if base.trim().is_empty() {
        Value::Object(Map::new())
    } else {
        serde_json::from_str(base)?
    };
    apply_changes(&mut document, &merged);
    Ok(serde_json::to_string_pretty(&document)? + "\n")
}

/// Merges a JSON version file of the target repository with the changes
/// made to its counterpart in the source repository.
#[derive(Debug, Clone)]
pub struct JsonFileMerger {
    comments: CommentCollector,
    prefer_source: bool,
}

impl JsonFileMerger {
    pub fn new(comments: CommentCollector) -> Self {
        Self { comments, prefer_source: false }
    }

    /// Keep the source value of properties that conflict. Used when the
    /// source is the repository, i.e. for forward flows.
    pub fn preferring_source(mut self) -> Self {
        self.prefer_source = true;
        self
    }

    /// Merge and stage the target file. Returns whether the file changed.
    #[instrument(skip(self, target, source), fields(file = %target.path))]
    pub async fn merge(&self, target: FileRevisions<'_>, source: FileRevisions<'_>) -> Result<bool, VersionFileError> {
        let target_previous = target.read_previous()?;
        let target_current = target.read_current()?;
        let source_previous = source.read_previous()?;
        let source_current = source.read_current()?;
        let full_path = target.repo.path().join(target.path);

        if target_current.is_none() && target_previous.is_some() {
            info!("file was deleted in the target branch, leaving it deleted");
            return Ok(false);
        }

        if source_current.is_none() {
            if source_previous.is_some() && full_path.exists() {
                info!("file was deleted in the source, deleting it in the target");
                std::fs::remove_file(&full_path)?;
                target.repo.stage(&[target.path]).await?;
                return Ok(true);
            }
            if target_current.is_none() {
                return Ok(false);
            }
        }

        let base = match std::fs::read_to_string(&full_path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => target_current.clone().unwrap_or_default(),
            Err(e) => return Err(e.into()),
        };

        let merged = merge_documents(
            target_previous.as_deref(),
            target_current.as_deref(),
            source_previous.as_deref(),
            source_current.as_deref(),
            &base,
            self.prefer_source,
            target.path,
            &self.comments,
        )?;

        if full_path.exists() && normalized(&merged) == normalized(&base) {
            debug!("no changes to merge");
            return Ok(false);
        }

        if let Some(parent) = full_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&full_path, merged)?;
        target.repo.stage(&[target.path]).await?;
        info!("merged JSON file");
        Ok(true)
    }
}

fn normalized(content: &str) -> String {
    content.replace("\r\n", "\n").trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comments::CommentKind;
    use crate::git::test_support::{commit_file, git, git_available, init_repo};

    const TARGET_PREVIOUS: &str = r#"{
  "sdk": {
    "version": "8.0.303",
    "rollForward": "minor"
  },
  "tools": {
    "dotnet": "8.0.303",
    "runtimes": {
      "dotnet": [
        "6.0.29"
      ],
      "aspnetcore": [
        "6.0.29"
      ]
    }
  },
  "msbuild-sdks": {
    "Microsoft.DotNet.Arcade.Sdk": "8.0.0-beta.25310.3"
  }
}
"#;

    const TARGET_CURRENT: &str = r#"{
  "sdk": {
    "version": "8.0.304"
  },
  "tools": {
    "dotnet": "8.0.303",
    "runtimes": {
      "dotnet": [
        "6.0.29",
        "8.0.0"
      ],
      "aspnetcore": [
        "6.0.29"
      ]
    }
  },
  "msbuild-sdks": {
    "Microsoft.DotNet.Arcade.Sdk": "8.0.0-beta.25310.3",
    "new.sdk": "1.0.0"
  }
}
"#;

    const SOURCE_CURRENT: &str = r#"{
  "sdk": {
    "version": "8.0.305",
    "rollForward": "minor"
  },
  "tools": {
    "dotnet": "8.0.307",
    "runtimes": {
      "dotnet": [
        "6.0.29"
      ],
      "aspnetcore": [
        "6.0.29"
      ]
    }
  },
  "msbuild-sdks": {
  },
  "new.something": [
    "1.0.0"
  ]
}
"#;

    const EXPECTED: &str = r#"{
  "sdk": {
    "version": "8.0.305"
  },
  "tools": {
    "dotnet": "8.0.307",
    "runtimes": {
      "dotnet": [
        "6.0.29",
        "8.0.0"
      ],
      "aspnetcore": [
        "6.0.29"
      ]
    }
  },
  "msbuild-sdks": {
    "new.sdk": "1.0.0"
  },
  "new.something": [
    "1.0.0"
  ]
}
"#;

    #[test]
    fn test_flatten() {
        let doc: Value = serde_json::from_str(TARGET_CURRENT).unwrap();
        let leaves = flatten(&doc, "global.json").unwrap();
        assert_eq!(
            leaves.get(&JsonPath::new(["msbuild-sdks", "new.sdk"])),
            Some(&JsonValue::String("1.0.0".into()))
        );
        assert_eq!(
            leaves.get(&JsonPath::new(["tools", "runtimes", "dotnet"])),
            Some(&JsonValue::StringArray(vec!["6.0.29".into(), "8.0.0".into()]))
        );
        assert_eq!(
            JsonPath::new(["msbuild-sdks", "new.sdk"]).to_string(),
            "msbuild-sdks.new.sdk"
        );
    }

    #[test]
    fn test_unsupported_values() {
        let doc: Value = serde_json::from_str(r#"{"a": {"b": null}}"#).unwrap();
        let err = flatten(&doc, "global.json").unwrap_err();
        assert!(matches!(err, VersionFileError::UnsupportedJsonValue { ref path, .. } if path == "a.b"));

        let doc: Value = serde_json::from_str(r#"{"a": [1, 2]}"#).unwrap();
        assert!(flatten(&doc, "global.json").is_err());
    }

    #[test]
    fn test_four_point_merge() {
        let comments = CommentCollector::new();
        let merged = merge_documents(
            Some(TARGET_PREVIOUS),
            Some(TARGET_CURRENT),
            Some(TARGET_PREVIOUS),
            Some(SOURCE_CURRENT),
            TARGET_CURRENT,
            false,
            "global.json",
            &comments,
        )
        .unwrap();
        assert_eq!(merged, EXPECTED);
        assert!(!comments.has_warnings());
    }

    #[test]
    fn test_missing_previous_states_count_as_empty() {
        let comments = CommentCollector::new();
        let merged = merge_documents(
            None,
            Some(r#"{"sdk": {"version": "9.0.100"}}"#),
            None,
            Some(r#"{"tools": {"dotnet": "9.0.100"}}"#),
            r#"{"sdk": {"version": "9.0.100"}}"#,
            false,
            "global.json",
            &comments,
        )
        .unwrap();
        let doc: Value = serde_json::from_str(&merged).unwrap();
        assert_eq!(doc["sdk"]["version"], "9.0.100");
        assert_eq!(doc["tools"]["dotnet"], "9.0.100");
    }

    #[test]
    fn test_conflicting_values() {
        let previous = r#"{"name": "a", "flag": true, "count": 1}"#;
        let target = r#"{"name": "target", "flag": false, "count": 3}"#;
        let source = r#"{"name": "source", "flag": true, "count": 5}"#;
        let comments = CommentCollector::new();
        let merged = merge_documents(
            Some(previous),
            Some(target),
            Some(previous),
            Some(source),
            target,
            false,
            "dotnet-tools.json",
            &comments,
        )
        .unwrap();

        let doc: Value = serde_json::from_str(&merged).unwrap();
        assert_eq!(doc["name"], "target");
        assert_eq!(doc["count"], 5);

        let warnings: Vec<_> = comments
            .comments()
            .into_iter()
            .filter(|c| c.kind == CommentKind::Warning)
            .collect();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].text.contains("`name`"));
        assert!(warnings[0].text.contains("conflicting value"));
        // Source reverted the flag to its previous value so only the target changed it.
        assert_eq!(doc["flag"], false);
    }

    #[test]
    fn test_conflicting_flag_keeps_the_repository_value() {
        let target_previous = r#"{"allowPrerelease": true, "rollForward": "minor"}"#;
        let target_current = r#"{"allowPrerelease": false, "rollForward": "major"}"#;
        let source_previous = r#"{"allowPrerelease": false, "rollForward": "minor"}"#;
        let source_current = r#"{"allowPrerelease": true, "rollForward": "latestPatch"}"#;
        let merge = |prefer_source: bool, comments: &CommentCollector| {
            let merged = merge_documents(
                Some(target_previous),
                Some(target_current),
                Some(source_previous),
                Some(source_current),
                target_current,
                prefer_source,
                "global.json",
                comments,
            )
            .unwrap();
            serde_json::from_str::<Value>(&merged).unwrap()
        };

        // Forward flow: the repository is the source.
        let comments = CommentCollector::new();
        let doc = merge(true, &comments);
        assert_eq!(doc["allowPrerelease"], true);
        assert_eq!(doc["rollForward"], "latestPatch");
        let warnings = comments.comments();
        assert_eq!(warnings.len(), 2);
        assert!(warnings.iter().all(|c| c.kind == CommentKind::Warning));
        assert!(warnings[0].text.contains("`allowPrerelease`"));
        assert!(warnings[0].text.contains("Keeping `true`"));

        // Backflow: the repository is the target.
        let comments = CommentCollector::new();
        let doc = merge(false, &comments);
        assert_eq!(doc["allowPrerelease"], false);
        assert_eq!(doc["rollForward"], "major");
        assert_eq!(comments.comments().len(), 2);
    }

    #[test]
    fn test_scalar_parent_is_replaced_by_object() {
        let mut doc: Value = serde_json::from_str(r#"{"tools": "none"}"#).unwrap();
        let mut changes = JsonChanges::default();
        changes.additions.insert(
            JsonPath::new(["tools", "dotnet"]),
            JsonValue::String("9.0.100".into()),
        );
        apply_changes(&mut doc, &changes);
        assert_eq!(doc["tools"]["dotnet"], "9.0.100");
    }

    #[test]
    fn test_removal_prunes_empty_parents() {
        let mut doc: Value =
            serde_json::from_str(r#"{"a": {"b": {"c": "1"}}, "d": {}}"#).unwrap();
        let mut changes = JsonChanges::default();
        changes.removals.insert(JsonPath::new(["a", "b", "c"]));
        apply_changes(&mut doc, &changes);
        assert_eq!(doc, serde_json::json!({"d": {}}));
    }

    #[tokio::test]
    async fn test_merge_files_in_repositories() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let target = init_repo(&dir.path().join("target"));
        let source = init_repo(&dir.path().join("source"));

        let t1 = commit_file(&target, "global.json", TARGET_PREVIOUS, "t1");
        let t2 = commit_file(&target, "global.json", TARGET_CURRENT, "t2");
        let s1 = commit_file(&source, "global.json", TARGET_PREVIOUS, "s1");
        let s2 = commit_file(&source, "global.json", SOURCE_CURRENT, "s2");

        let merger = JsonFileMerger::new(CommentCollector::new());
        let changed = merger
            .merge(
                FileRevisions { repo: &target, path: "global.json", previous: &t1, current: &t2 },
                FileRevisions { repo: &source, path: "global.json", previous: &s1, current: &s2 },
            )
            .await
            .unwrap();
        assert!(changed);
        let content = std::fs::read_to_string(target.path().join("global.json")).unwrap();
        assert_eq!(content, EXPECTED);
        assert_eq!(git(target.path(), &["diff", "--cached", "--name-only"]), "global.json");

        // Nothing new on either side.
        let changed = merger
            .merge(
                FileRevisions { repo: &source, path: "global.json", previous: &s2, current: &s2 },
                FileRevisions { repo: &source, path: "global.json", previous: &s2, current: &s2 },
            )
            .await
            .unwrap();
        assert!(!changed);
    }

    #[tokio::test]
    async fn test_file_deleted_on_one_side() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let target = init_repo(&dir.path().join("target"));
        let source = init_repo(&dir.path().join("source"));

        let t1 = commit_file(&target, "global.json", TARGET_PREVIOUS, "t1");
        git(target.path(), &["rm", "-q", "global.json"]);
        git(target.path(), &["commit", "-q", "-m", "delete"]);
        let t2 = git(target.path(), &["rev-parse", "HEAD"]);
        let s1 = commit_file(&source, "global.json", TARGET_PREVIOUS, "s1");
        let s2 = commit_file(&source, "global.json", SOURCE_CURRENT, "s2");

        let merger = JsonFileMerger::new(CommentCollector::new());
        let changed = merger
            .merge(
                FileRevisions { repo: &target, path: "global.json", previous: &t1, current: &t2 },
                FileRevisions { repo: &source, path: "global.json", previous: &s1, current: &s2 },
            )
            .await
            .unwrap();
        assert!(!changed);
        assert!(!target.path().join("global.json").exists());

        // Deleted in the source, present in the target.
        let t3 = commit_file(&target, "global.json", TARGET_CURRENT, "t3");
        git(source.path(), &["rm", "-q", "global.json"]);
        git(source.path(), &["commit", "-q", "-m", "delete"]);
        let s3 = git(source.path(), &["rev-parse", "HEAD"]);
        let changed = merger
            .merge(
                FileRevisions { repo: &target, path: "global.json", previous: &t3, current: &t3 },
                FileRevisions { repo: &source, path: "global.json", previous: &s2, current: &s3 },
            )
            .await
            .unwrap();
        assert!(changed);
        assert!(!target.path().join("global.json").exists());
    }
}
