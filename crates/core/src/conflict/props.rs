//! Three-way property merge.
//!
//! The incoming change set is the difference between the old and new
//! pristine properties. Each change is applied to the working ("actual")
//! properties; it applies cleanly when the working value still equals the
//! old pristine one, is already merged when the working value equals the new
//! one, and conflicts otherwise.

use std::collections::BTreeMap;

use tracing::debug;

use crate::conflict::descriptor::PropConflictValues;
use crate::models::Props;
use crate::notify::NotifyState;

/// Properties whose change affects how the working file is translated.
const MAGIC_PROPS: &[&str] = &[
    "svn:executable",
    "svn:keywords",
    "svn:eol-style",
    "svn:special",
    "svn:needs-lock",
];

/// One incoming property change; `value` is `None` for a deletion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropChange {
    pub name: String,
    pub value: Option<String>,
}

/// Result of merging a change set into working properties.
#[derive(Debug, Clone, PartialEq)]
pub struct PropMergeOutcome {
    pub state: NotifyState,
    /// The new working properties.
    pub actual: Props,
    /// Conflicted properties, keyed by name.
    pub conflicts: BTreeMap<String, PropConflictValues>,
}

/// Changes that turn `old` into `new`, ordered by name.
pub fn diff_props(old: &Props, new: &Props) -> Vec<PropChange> {
    let mut changes = Vec::new();
    for (name, value) in new {
        if old.get(name) != Some(value) {
            changes.push(PropChange {
                name: name.clone(),
                value: Some(value.clone()),
            });
        }
    }
    for name in old.keys() {
        if !new.contains_key(name) {
            changes.push(PropChange {
                name: name.clone(),
                value: None,
            });
        }
    }
    changes.sort_by(|a, b| a.name.cmp(&b.name));
    changes
}

pub fn has_magic_property(changes: &[PropChange]) -> bool {
    changes.iter().any(|c| MAGIC_PROPS.contains(&c.name.as_str()))
}

/// Merge `changes` (made against `base`) into `actual`.
pub fn merge_props(base: &Props, actual: &Props, changes: &[PropChange]) -> PropMergeOutcome {
    let mut merged = actual.clone();
    let mut conflicts = BTreeMap::new();
    let mut any_changed = false;
    let mut any_merged = false;

    for change in changes {
        let base_val = base.get(&change.name);
        let mine = actual.get(&change.name);
        let theirs = change.value.as_ref();

        if mine == theirs {
            // Already what the change asks for.
            any_merged = true;
        } else if mine == base_val {
            match theirs {
                Some(value) => merged.insert(change.name.clone(), value.clone()),
                None => merged.remove(&change.name),
            };
            any_changed = true;
        } else {
            debug!(name = %change.name, "property conflict");
            conflicts.insert(
                change.name.clone(),
                PropConflictValues {
                    base: base_val.cloned(),
                    mine: mine.cloned(),
                    theirs: theirs.cloned(),
                },
            );
        }
    }

    let state = if !conflicts.is_empty() {
        NotifyState::Conflicted
    } else if any_merged {
        NotifyState::Merged
    } else if any_changed {
        NotifyState::Changed
    } else {
        NotifyState::Unchanged
    };

    PropMergeOutcome {
        state,
        actual: merged,
        conflicts,
    }
}

/// Text of a property reject file describing `conflicts`.
pub fn reject_text(conflicts: &BTreeMap<String, PropConflictValues>) -> String {
    let mut out = String::new();
    for (name, values) in conflicts {
        let headline = match (&values.base, &values.theirs) {
            (None, Some(_)) => format!("Trying to add new property '{name}'"),
            (Some(_), None) => format!("Trying to delete property '{name}'"),
            _ => format!("Trying to change property '{name}'"),
        };
        out.push_str(&headline);
        out.push('\n');
        out.push_str("but the local property value conflicts with the incoming change.\n");
        out.push_str("<<<<<<< (local property value)\n");
        push_value(&mut out, values.mine.as_deref());
        out.push_str("||||||| (incoming 'changed from' value)\n");
        push_value(&mut out, values.base.as_deref());
        out.push_str("=======\n");
        push_value(&mut out, values.theirs.as_deref());
        out.push_str(">>>>>>> (incoming 'changed to' value)\n\n");
    }
    out
}

fn push_value(out: &mut String, value: Option<&str>) {
    if let Some(value) = value {
        out.push_str(value);
        if !value.ends_with('\n') {
            out.push('\n');
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(pairs: &[(&str, &str)]) -> Props {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_diff_props() {
        let old = props(&[("a", "1"), ("b", "2")]);
        let new = props(&[("a", "1"), ("b", "3"), ("c", "4")]);
        let changes = diff_props(&old, &new);
        assert_eq!(
            changes,
            vec![
                PropChange { name: "b".into(), value: Some("3".into()) },
                PropChange { name: "c".into(), value: Some("4".into()) },
            ]
        );
        let removed = diff_props(&new, &old);
        assert!(removed.contains(&PropChange { name: "c".into(), value: None }));
    }

    #[test]
    fn test_clean_change_applies() {
        let base = props(&[("p", "1")]);
        let changes = diff_props(&base, &props(&[("p", "2")]));
        let outcome = merge_props(&base, &base, &changes);
        assert_eq!(outcome.state, NotifyState::Changed);
        assert_eq!(outcome.actual["p"], "2");
        assert!(outcome.conflicts.is_empty());
    }

    #[test]
    fn test_same_local_change_is_merged() {
        let base = props(&[("p", "1")]);
        let new = props(&[("p", "2")]);
        let outcome = merge_props(&base, &new, &diff_props(&base, &new));
        assert_eq!(outcome.state, NotifyState::Merged);
        assert_eq!(outcome.actual, new);
    }

    #[test]
    fn test_local_change_conflicts() {
        let base = props(&[("p", "1")]);
        let mine = props(&[("p", "3"), ("local", "x")]);
        let changes = diff_props(&base, &props(&[("p", "2")]));
        let outcome = merge_props(&base, &mine, &changes);
        assert_eq!(outcome.state, NotifyState::Conflicted);
        assert_eq!(outcome.actual["p"], "3");
        assert_eq!(outcome.actual["local"], "x");
        let values = &outcome.conflicts["p"];
        assert_eq!(values.theirs.as_deref(), Some("2"));

        let text = reject_text(&outcome.conflicts);
        assert!(text.starts_with("Trying to change property 'p'"));
        assert!(text.contains("<<<<<<< (local property value)\n3\n"));
    }

    #[test]
    fn test_delete_of_locally_deleted_prop() {
        let base = props(&[("p", "1")]);
        let outcome = merge_props(&base, &Props::new(), &diff_props(&base, &Props::new()));
        assert_eq!(outcome.state, NotifyState::Merged);
        assert!(outcome.actual.is_empty());
    }

    #[test]
    fn test_magic_property() {
        let changes = vec![PropChange {
            name: "svn:eol-style".into(),
            value: Some("native".into()),
        }];
        assert!(has_magic_property(&changes));
        assert!(!has_magic_property(&[]));
    }
}
