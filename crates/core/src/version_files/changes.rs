//! Change sets between two states of a version file and the merge of two
//! independently produced change sets.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Display;

use tracing::debug;

use crate::comments::CommentCollector;

/// Properties removed, added and updated between two states of a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionFileChanges<K: Ord, V> {
    pub removals: BTreeSet<K>,
    pub additions: BTreeMap<K, V>,
    pub updates: BTreeMap<K, V>,
}

impl<K: Ord, V> Default for VersionFileChanges<K, V> {
    fn default() -> Self {
        Self {
            removals: BTreeSet::new(),
            additions: BTreeMap::new(),
            updates: BTreeMap::new(),
        }
    }
}

impl<K: Ord, V> VersionFileChanges<K, V> {
    pub fn has_changes(&self) -> bool {
        !self.removals.is_empty() || !self.additions.is_empty() || !self.updates.is_empty()
    }

    /// New value of `key`, whether it was added or updated.
    pub fn value(&self, key: &K) -> Option<&V> {
        self.additions.get(key).or_else(|| self.updates.get(key))
    }

    /// Additions followed by updates.
    pub fn values(&self) -> impl Iterator<Item = (&K, &V)> {
        self.additions.iter().chain(self.updates.iter())
    }
}

/// Diff two flattened states. `is_changed` decides whether a property
/// present on both sides counts as updated.
pub fn diff_maps<K, V, F>(before: &BTreeMap<K, V>, after: &BTreeMap<K, V>, is_changed: F) -> VersionFileChanges<K, V>
where
    K: Ord + Clone,
    V: Clone,
    F: Fn(&V, &V) -> bool,
{
    let mut changes = VersionFileChanges::default();
    for (key, old) in before {
        match after.get(key) {
            None => {
                changes.removals.insert(key.clone());
            }
            Some(new) if is_changed(old, new) => {
                changes.updates.insert(key.clone(), new.clone());
            }
            Some(_) => {}
        }
    }
    for (key, new) in after {
        if !before.contains_key(key) {
            changes.additions.insert(key.clone(), new.clone());
        }
    }
    changes
}

/// Merge the changes made in the target with the changes made in the source.
///
/// A removal on either side beats any change on the other. Properties
/// changed on both sides go through `pick_winner(key, target, source)`
/// unless both sides agree.
pub fn merge_changes<K, V, F>(
    target: &VersionFileChanges<K, V>,
    source: &VersionFileChanges<K, V>,
    mut pick_winner: F,
    file: &str,
    comments: &CommentCollector,
) -> VersionFileChanges<K, V>
where
    K: Ord + Clone + Display,
    V: Clone + PartialEq,
    F: FnMut(&K, &V, &V) -> V,
{
    let mut merged = VersionFileChanges::default();

    for key in target.removals.iter().chain(&source.removals) {
        if !merged.removals.insert(key.clone()) {
            continue;
        }
        let removed_in_target = target.removals.contains(key);
        let removed_in_source = source.removals.contains(key);
        if removed_in_target && source.value(key).is_some() {
            comments.information(format!(
                "`{key}` in {file} was removed in the target branch but changed in the source, keeping it removed"
            ));
        } else if removed_in_source && target.value(key).is_some() {
            comments.information(format!(
                "`{key}` in {file} was removed in the source but changed in the target branch, keeping it removed"
            ));
        }
    }

    let keys: BTreeSet<&K> = target
        .values()
        .chain(source.values())
        .map(|(k, _)| k)
        .filter(|k| !merged.removals.contains(*k))
        .collect();

    for key in keys {
        let value = match (target.value(key), source.value(key)) {
            (Some(t), Some(s)) if t == s => t.clone(),
            (Some(t), Some(s)) => {
                debug!(property = %key, file, "property changed on both sides");
                pick_winner(key, t, s)
            }
            (Some(t), None) => t.clone(),
            (None, Some(s)) => s.clone(),
            (None, None) => continue,
        };
        if target.additions.contains_key(key) || source.additions.contains_key(key) {
            merged.additions.insert(key.clone(), value);
        } else {
            merged.updates.insert(key.clone(), value);
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn newer(_: &String, a: &String, b: &String) -> String {
        if a >= b { a.clone() } else { b.clone() }
    }

    #[test]
    fn test_diff_maps() {
        let before = map(&[("a", "1"), ("b", "1"), ("c", "1")]);
        let after = map(&[("a", "1"), ("b", "2"), ("d", "1")]);
        let changes = diff_maps(&before, &after, |x, y| x != y);

        assert_eq!(changes.removals.iter().collect::<Vec<_>>(), vec!["c"]);
        assert_eq!(changes.updates.get("b").map(String::as_str), Some("2"));
        assert_eq!(changes.additions.get("d").map(String::as_str), Some("1"));
        assert!(changes.has_changes());
        assert!(!diff_maps(&before, &before, |x, y| x != y).has_changes());
    }

    #[test]
    fn test_merge_with_itself_is_identity() {
        let changes = diff_maps(
            &map(&[("a", "1"), ("b", "1")]),
            &map(&[("b", "2"), ("c", "3")]),
            |x, y| x != y,
        );
        let comments = CommentCollector::new();
        let mut calls = 0;
        let merged = merge_changes(
            &changes,
            &changes,
            |k, a, b| {
                calls += 1;
                newer(k, a, b)
            },
            "global.json",
            &comments,
        );
        assert_eq!(merged, changes);
        assert_eq!(calls, 0);
        assert!(comments.comments().is_empty());
    }

    #[test]
    fn test_removal_wins_over_change() {
        let mut target = VersionFileChanges::default();
        target.removals.insert("tools.dotnet".to_string());
        let mut source = VersionFileChanges::default();
        source.additions.insert("tools.dotnet".to_string(), "9.0.100".to_string());
        source.updates.insert("sdk.version".to_string(), "9.0.101".to_string());

        let comments = CommentCollector::new();
        let merged = merge_changes(&target, &source, newer, "global.json", &comments);
        assert!(merged.removals.contains("tools.dotnet"));
        assert!(!merged.additions.contains_key("tools.dotnet"));
        assert_eq!(merged.updates.get("sdk.version").map(String::as_str), Some("9.0.101"));

        let notes = comments.comments();
        assert_eq!(notes.len(), 1);
        assert!(notes[0].text.contains("tools.dotnet"));
        assert!(!comments.has_warnings());

        let merged = merge_changes(&source, &target, newer, "global.json", &comments);
        assert!(merged.removals.contains("tools.dotnet"));
        assert_eq!(comments.comments().len(), 2);
    }

    #[test]
    fn test_conflicting_values_use_pick_winner() {
        let mut target = VersionFileChanges::default();
        target.updates.insert("p".to_string(), "2.0.0".to_string());
        target.additions.insert("q".to_string(), "1.0.0".to_string());
        let mut source = VersionFileChanges::default();
        source.updates.insert("p".to_string(), "1.9.0".to_string());
        source.additions.insert("q".to_string(), "1.1.0".to_string());

        let merged = merge_changes(&target, &source, newer, "f", &CommentCollector::new());
        assert_eq!(merged.updates.get("p").map(String::as_str), Some("2.0.0"));
        assert_eq!(merged.additions.get("q").map(String::as_str), Some("1.1.0"));
    }
}
