//! Path traversal and merging over the JSON document tree.

use serde_json::{Map, Value};

use crate::path::KeyPath;

/// Resolve `path` against `root`. `None` means "never set", which is
/// different from an explicit `null`.
pub fn get<'a>(root: &'a Value, path: &KeyPath) -> Option<&'a Value> {
    path.segments()
        .iter()
        .try_fold(root, |node, seg| match node {
            Value::Object(map) => map.get(seg),
            Value::Array(items) => seg.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
}

/// Write `value` at `path`, creating intermediate objects as needed, and
/// return the previous value.
///
/// Any scalar (or null) met on the way is replaced by an object. Arrays are
/// descended into only for an in-bounds numeric segment; otherwise they too
/// are replaced.
pub fn set_in(root: &mut Value, path: &KeyPath, value: Value) -> Option<Value> {
    let old = get(root, path).cloned();
    let slot = path
        .segments()
        .iter()
        .fold(root, |node, seg| child_mut(node, seg));
    *slot = value;
    old
}

fn child_mut<'a>(node: &'a mut Value, seg: &str) -> &'a mut Value {
    if let Some(i) = array_index(node, seg) {
        return &mut node[i];
    }
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    &mut node[seg]
}

fn array_index(node: &Value, seg: &str) -> Option<usize> {
    let len = node.as_array()?.len();
    seg.parse::<usize>().ok().filter(|i| *i < len)
}

/// Overlay `stored` onto `base`: objects merge key by key, everything else
/// (arrays included) replaces wholesale. Keys only in `base` survive, which
/// is how an old document gains fields added to the schema since.
pub fn merge(base: &mut Value, stored: Value) {
    match (base, stored) {
        (Value::Object(base), Value::Object(stored)) => {
            for (key, value) in stored {
                match base.get_mut(&key) {
                    Some(slot) => merge(slot, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

/// Primitives compare by value; objects and arrays always count as changed.
pub fn is_unchanged(old: Option<&Value>, new: &Value) -> bool {
    match new {
        Value::Object(_) | Value::Array(_) => false,
        primitive => old == Some(primitive),
    }
}


#[cfg(test)]
mod proptest_suite {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn arb_segments() -> impl Strategy<Value = Vec<String>> {
        prop::collection::vec("[a-z]{1,6}", 1..5)
    }

    fn arb_leaf() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::from),
            any::<i64>().prop_map(Value::from),
            "[ -~]{0,16}".prop_map(Value::from),
        ]
    }

    proptest! {
        #[test]
        fn set_then_get(segments in arb_segments(), value in arb_leaf()) {
            let path = KeyPath::from_segments(segments).unwrap();
            let mut doc = json!({"patient": {"name": "x"}, "scores": {}});
            set_in(&mut doc, &path, value.clone());
            prop_assert_eq!(get(&doc, &path), Some(&value));
        }

        #[test]
        fn set_leaves_siblings_alone(
            a in arb_segments(),
            b in arb_segments(),
            va in arb_leaf(),
            vb in arb_leaf(),
        ) {
            // b is not a prefix of a and vice versa
            prop_assume!(!a.starts_with(&b) && !b.starts_with(&a));
            let pa = KeyPath::from_segments(a).unwrap();
            let pb = KeyPath::from_segments(b).unwrap();
            let mut doc = json!({});
            set_in(&mut doc, &pa, va.clone());
            set_in(&mut doc, &pb, vb);
            prop_assert_eq!(get(&doc, &pa), Some(&va));
        }

        #[test]
        fn merge_keeps_stored_leaves(
            entries in prop::collection::vec((arb_segments(), arb_leaf()), 1..8),
        ) {
            let mut stored = json!({});
            let mut paths = Vec::new();
            for (segments, value) in entries {
                let path = KeyPath::from_segments(segments).unwrap();
                set_in(&mut stored, &path, value);
                paths.push(path);
            }

            let mut merged = json!({"version": 1, "patient": {}, "scores": {}});
            merge(&mut merged, stored.clone());
            for path in &paths {
                prop_assert_eq!(get(&merged, path), get(&stored, path));
            }
        }
    }
}
