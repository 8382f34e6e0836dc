//! Structural Diff
//!
//! Deltas are computed over the JSON form of the game state. Each change
//! names a JSON Pointer (RFC 6901) and either sets the value there or
//! removes it. Objects are diffed key by key; arrays element by element
//! when their length is unchanged, otherwise replaced whole.

use serde::{Serialize, Deserialize};
use serde_json::Value;
use thiserror::Error;

/// Kind of change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOp {
    /// Insert or replace the value at `path`.
    Set,
    /// Remove the object key at `path`.
    Remove,
}

/// One `{path, value}` change.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Change {
    /// Operation.
    pub op: ChangeOp,
    /// JSON Pointer to the changed location. Empty means the whole document.
    pub path: String,
    /// New value (`null` for removals).
    #[serde(default)]
    pub value: Value,
}

impl Change {
    fn set(path: String, value: Value) -> Self {
        Self { op: ChangeOp::Set, path, value }
    }

    fn remove(path: String) -> Self {
        Self { op: ChangeOp::Remove, path, value: Value::Null }
    }
}

/// Patch application failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatchError {
    /// The parent of a change's path does not exist.
    #[error("no parent for path {0}")]
    MissingParent(String),
    /// The path addresses something that cannot hold children.
    #[error("invalid path {0}")]
    InvalidPath(String),
}

/// Compute the changes turning `old` into `new`.
pub fn diff(old: &Value, new: &Value) -> Vec<Change> {
    let mut changes = Vec::new();
    diff_into(String::new(), old, new, &mut changes);
    changes
}

fn diff_into(path: String, old: &Value, new: &Value, out: &mut Vec<Change>) {
    if old == new {
        return;
    }

    match (old, new) {
        (Value::Object(a), Value::Object(b)) => {
            for (key, old_value) in a {
                let child = child_path(&path, key);
                match b.get(key) {
                    Some(new_value) => diff_into(child, old_value, new_value, out),
                    None => out.push(Change::remove(child)),
                }
            }
            for (key, new_value) in b {
                if !a.contains_key(key) {
                    out.push(Change::set(child_path(&path, key), new_value.clone()));
                }
            }
        }
        (Value::Array(a), Value::Array(b)) if a.len() == b.len() => {
            for (index, (old_value, new_value)) in a.iter().zip(b).enumerate() {
                diff_into(child_path(&path, &index.to_string()), old_value, new_value, out);
            }
        }
        _ => out.push(Change::set(path, new.clone())),
    }
}

/// Apply changes in order.
pub fn apply(target: &mut Value, changes: &[Change]) -> Result<(), PatchError> {
    for change in changes {
        apply_one(target, change)?;
    }
    Ok(())
}

fn apply_one(target: &mut Value, change: &Change) -> Result<(), PatchError> {
    if change.path.is_empty() {
        return match change.op {
            ChangeOp::Set => {
                *target = change.value.clone();
                Ok(())
            }
            ChangeOp::Remove => Err(PatchError::InvalidPath(change.path.clone())),
        };
    }

    let split = change
        .path
        .rfind('/')
        .ok_or_else(|| PatchError::InvalidPath(change.path.clone()))?;
    let (parent_path, token) = change.path.split_at(split);
    let key = unescape(&token[1..]);

    let parent = target
        .pointer_mut(parent_path)
        .ok_or_else(|| PatchError::MissingParent(change.path.clone()))?;

    match (parent, change.op) {
        (Value::Object(map), ChangeOp::Set) => {
            map.insert(key, change.value.clone());
            Ok(())
        }
        (Value::Object(map), ChangeOp::Remove) => {
            map.remove(&key);
            Ok(())
        }
        (Value::Array(items), ChangeOp::Set) => {
            let index: usize = key
                .parse()
                .map_err(|_| PatchError::InvalidPath(change.path.clone()))?;
            let slot = items
                .get_mut(index)
                .ok_or_else(|| PatchError::InvalidPath(change.path.clone()))?;
            *slot = change.value.clone();
            Ok(())
        }
        _ => Err(PatchError::InvalidPath(change.path.clone())),
    }
}

fn child_path(parent: &str, key: &str) -> String {
    let mut path = String::with_capacity(parent.len() + key.len() + 1);
    path.push_str(parent);
    path.push('/');
    path.push_str(&key.replace('~', "~0").replace('/', "~1"));
    path
}

fn unescape(token: &str) -> String {
    token.replace("~1", "/").replace("~0", "~")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_nested_field_change() {
        let old = json!({"units": {"1": {"hp": 10, "name": "a"}}});
        let new = json!({"units": {"1": {"hp": 7, "name": "a"}}});

        let changes = diff(&old, &new);
        assert_eq!(changes, vec![Change::set("/units/1/hp".into(), json!(7))]);
    }

    #[test]
    fn test_added_and_removed_keys() {
        let old = json!({"loot": {"1": {"q": 1}, "2": {"q": 2}}});
        let new = json!({"loot": {"2": {"q": 2}, "3": {"q": 5}}});

        let changes = diff(&old, &new);
        assert!(changes.contains(&Change::remove("/loot/1".into())));
        assert!(changes.contains(&Change::set("/loot/3".into(), json!({"q": 5}))));

        let mut patched = old.clone();
        apply(&mut patched, &changes).unwrap();
        assert_eq!(patched, new);
    }

    #[test]
    fn test_array_length_change_replaces_array() {
        let old = json!({"order": [1, 2, 3]});
        let new = json!({"order": [1, 3]});

        let changes = diff(&old, &new);
        assert_eq!(changes, vec![Change::set("/order".into(), json!([1, 3]))]);
    }

    #[test]
    fn test_array_element_change() {
        let old = json!({"order": [{"roll": 1}, {"roll": 2}]});
        let new = json!({"order": [{"roll": 1}, {"roll": 9}]});

        let changes = diff(&old, &new);
        assert_eq!(changes, vec![Change::set("/order/1/roll".into(), json!(9))]);

        let mut patched = old.clone();
        apply(&mut patched, &changes).unwrap();
        assert_eq!(patched, new);
    }

    #[test]
    fn test_null_value_is_not_removal() {
        let old = json!({"turn": {"unitId": 1}});
        let new = json!({"turn": null});

        let mut patched = old.clone();
        apply(&mut patched, &diff(&old, &new)).unwrap();
        assert_eq!(patched, new);
    }

    #[test]
    fn test_escaped_keys() {
        let old = json!({"inv": {}});
        let new = json!({"inv": {"a/b~c": 1}});

        let changes = diff(&old, &new);
        assert_eq!(changes[0].path, "/inv/a~1b~0c");

        let mut patched = old.clone();
        apply(&mut patched, &changes).unwrap();
        assert_eq!(patched, new);
    }

    #[test]
    fn test_identical_values_produce_no_changes() {
        let value = json!({"a": [1, 2, {"b": null}]});
        assert!(diff(&value, &value).is_empty());
    }

    #[test]
    fn test_missing_parent() {
        let mut target = json!({});
        let result = apply(&mut target, &[Change::set("/units/1/hp".into(), json!(3))]);
        assert_eq!(result, Err(PatchError::MissingParent("/units/1/hp".into())));
    }

    #[test]
    fn test_root_replacement() {
        let mut target = json!(1);
        apply(&mut target, &diff(&json!(1), &json!({"a": 1}))).unwrap();
        assert_eq!(target, json!({"a": 1}));
        assert!(diff(&json!({}), &json!({})).is_empty());
    }
}
