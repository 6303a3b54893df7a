//! Last-writer-wins registers arranged as a nested map.
//!
//! Every leaf carries `(timestamp, replica_id)` metadata. A write only lands
//! if it wins the total order over that pair: strictly greater timestamp
//! first, then lexicographically greater replica id on an exact tie. Because
//! the order is total and comparison is against whatever is already present,
//! the final state is independent of arrival order — the property the whole
//! sync engine leans on.
//!
//! Writes through an existing leaf, or shallow writes over an existing
//! subtree, are resolved with the same rule (see [`LwwMap::apply`]), so the
//! structure converges even when clients disagree about a slot's shape.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::borrow::Cow;
use std::collections::HashMap;

/// One step of a document path: an object key or an array-style index.
///
/// Indices address the same map slot as their decimal-string form; the
/// structure is a map-of-maps all the way down, matching how the wire
/// protocol's JSON paths behave.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    Key(String),
    Index(u64),
}

impl PathSegment {
    /// The map key this segment addresses.
    pub fn as_key(&self) -> Cow<'_, str> {
        match self {
            PathSegment::Key(k) => Cow::Borrowed(k.as_str()),
            PathSegment::Index(i) => Cow::Owned(i.to_string()),
        }
    }
}

impl From<&str> for PathSegment {
    fn from(key: &str) -> Self {
        PathSegment::Key(key.to_string())
    }
}

impl From<String> for PathSegment {
    fn from(key: String) -> Self {
        PathSegment::Key(key)
    }
}

impl From<u64> for PathSegment {
    fn from(index: u64) -> Self {
        PathSegment::Index(index)
    }
}

/// Build a path from string literals. Mostly for tests.
pub fn path(segments: &[&str]) -> Vec<PathSegment> {
    segments.iter().map(|s| PathSegment::from(*s)).collect()
}

/// Whether two paths address the same slot (`Key("0")` equals `Index(0)`).
pub fn same_path(a: &[PathSegment], b: &[PathSegment]) -> bool {
    a.len() == b.len()
        && a.iter()
            .zip(b.iter())
            .all(|(x, y)| x.as_key() == y.as_key())
}

/// A single last-writer-wins register.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LwwEntry {
    pub value: Value,
    pub timestamp: u64,
    #[serde(rename = "replicaId")]
    pub replica_id: String,
}

impl LwwEntry {
    /// Total-order tie-break: greater timestamp wins, then greater replica id.
    pub fn beats(&self, other: &LwwEntry) -> bool {
        self.timestamp > other.timestamp
            || (self.timestamp == other.timestamp && self.replica_id > other.replica_id)
    }
}

/// One slot in the nested structure: either a register or a sub-map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
enum LwwNode {
    Map(LwwMap),
    Leaf(LwwEntry),
}

impl LwwNode {
    /// The winning `(timestamp, replica_id)` anywhere in this subtree.
    fn max_entry(&self) -> Option<(u64, &str)> {
        match self {
            LwwNode::Leaf(entry) => Some((entry.timestamp, entry.replica_id.as_str())),
            LwwNode::Map(map) => map
                .slots
                .values()
                .filter_map(LwwNode::max_entry)
                .max_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(b.1))),
        }
    }
}

/// Nested map of LWW registers mirroring the document's JSON shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LwwMap {
    #[serde(flatten)]
    slots: HashMap<String, LwwNode>,
}

impl LwwMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write `value` at `path`, creating intermediate maps as needed.
    ///
    /// Returns `true` if the write landed, `false` if it lost the tie-break.
    /// Empty paths are a no-op.
    ///
    /// Shape conflicts are resolved deterministically so replicas converge
    /// regardless of order:
    /// - a deep write through an existing leaf replaces the leaf with a map
    ///   only if the new `(timestamp, replica_id)` beats the leaf's;
    /// - a shallow write over an existing subtree replaces the subtree only
    ///   if it beats every register inside it.
    pub fn apply(&mut self, path: &[PathSegment], value: Value, timestamp: u64, replica_id: &str) -> bool {
        let Some((head, rest)) = path.split_first() else {
            return false;
        };
        let incoming = LwwEntry {
            value,
            timestamp,
            replica_id: replica_id.to_string(),
        };
        self.apply_entry(head, rest, incoming)
    }

    fn apply_entry(&mut self, head: &PathSegment, rest: &[PathSegment], incoming: LwwEntry) -> bool {
        let key = head.as_key().into_owned();

        if rest.is_empty() {
            match self.slots.get(&key) {
                None => {
                    self.slots.insert(key, LwwNode::Leaf(incoming));
                    true
                }
                Some(LwwNode::Leaf(existing)) => {
                    if incoming.beats(existing) {
                        self.slots.insert(key, LwwNode::Leaf(incoming));
                        true
                    } else {
                        false
                    }
                }
                Some(node @ LwwNode::Map(_)) => {
                    // Shallow write over a subtree: only wins if it beats
                    // everything the subtree has absorbed.
                    let wins = match node.max_entry() {
                        Some((ts, replica)) => {
                            incoming.timestamp > ts
                                || (incoming.timestamp == ts && incoming.replica_id.as_str() > replica)
                        }
                        None => true,
                    };
                    if wins {
                        self.slots.insert(key, LwwNode::Leaf(incoming));
                        true
                    } else {
                        false
                    }
                }
            }
        } else {
            let (next, remaining) = rest.split_first().expect("rest is non-empty");
            match self.slots.get_mut(&key) {
                Some(LwwNode::Map(map)) => map.apply_entry(next, remaining, incoming),
                Some(LwwNode::Leaf(existing)) => {
                    // Deep write through a leaf: the leaf gives way only if
                    // the incoming write is newer than it.
                    if incoming.beats(existing) {
                        let mut map = LwwMap::new();
                        let landed = map.apply_entry(next, remaining, incoming);
                        self.slots.insert(key, LwwNode::Map(map));
                        landed
                    } else {
                        false
                    }
                }
                None => {
                    let mut map = LwwMap::new();
                    let landed = map.apply_entry(next, remaining, incoming);
                    self.slots.insert(key, LwwNode::Map(map));
                    landed
                }
            }
        }
    }

    /// Plain value at `path`: a leaf's value, or a snapshot of a subtree.
    /// `None` if the path does not resolve.
    pub fn get(&self, path: &[PathSegment]) -> Option<Value> {
        let Some((head, rest)) = path.split_first() else {
            return Some(self.to_value());
        };
        match self.slots.get(head.as_key().as_ref())? {
            LwwNode::Leaf(entry) => {
                if rest.is_empty() {
                    Some(entry.value.clone())
                } else {
                    None
                }
            }
            LwwNode::Map(map) => map.get(rest),
        }
    }

    /// Plain JSON snapshot with all CRDT metadata stripped.
    pub fn to_value(&self) -> Value {
        let mut object = serde_json::Map::with_capacity(self.slots.len());
        for (key, node) in &self.slots {
            let value = match node {
                LwwNode::Leaf(entry) => entry.value.clone(),
                LwwNode::Map(map) => map.to_value(),
            };
            object.insert(key.clone(), value);
        }
        Value::Object(object)
    }

    /// Number of top-level slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_apply_and_get() {
        let mut map = LwwMap::new();
        assert!(map.apply(&path(&["name"]), json!("Alice"), 1, "a"));
        assert_eq!(map.get(&path(&["name"])), Some(json!("Alice")));
        assert_eq!(map.get(&path(&["missing"])), None);
    }

    #[test]
    fn test_later_timestamp_wins() {
        let mut map = LwwMap::new();
        map.apply(&path(&["name"]), json!("Alice"), 5, "a");
        assert!(!map.apply(&path(&["name"]), json!("Bob"), 3, "b"));
        assert_eq!(map.get(&path(&["name"])), Some(json!("Alice")));

        assert!(map.apply(&path(&["name"]), json!("Carol"), 7, "b"));
        assert_eq!(map.get(&path(&["name"])), Some(json!("Carol")));
    }

    #[test]
    fn test_tie_breaks_on_replica_id() {
        let mut ab = LwwMap::new();
        ab.apply(&path(&["k"]), json!(1), 10, "alpha");
        ab.apply(&path(&["k"]), json!(2), 10, "beta");

        let mut ba = LwwMap::new();
        ba.apply(&path(&["k"]), json!(2), 10, "beta");
        ba.apply(&path(&["k"]), json!(1), 10, "alpha");

        // "beta" > "alpha" lexicographically, so beta wins either way.
        assert_eq!(ab.get(&path(&["k"])), Some(json!(2)));
        assert_eq!(ab, ba);
    }

    #[test]
    fn test_nested_paths_create_structure() {
        let mut map = LwwMap::new();
        map.apply(&path(&["user", "profile", "name"]), json!("Ada"), 1, "a");
        assert_eq!(
            map.get(&path(&["user", "profile", "name"])),
            Some(json!("Ada"))
        );
        assert_eq!(
            map.get(&path(&["user"])),
            Some(json!({"profile": {"name": "Ada"}}))
        );
    }

    #[test]
    fn test_index_and_string_key_alias() {
        let mut map = LwwMap::new();
        map.apply(&[PathSegment::from("items"), PathSegment::Index(0)], json!("x"), 1, "a");
        assert_eq!(
            map.get(&[PathSegment::from("items"), PathSegment::from("0")]),
            Some(json!("x"))
        );
    }

    #[test]
    fn test_leaf_vs_subtree_converges() {
        // Shallow write at t5 vs deep write at t3: the shallow one wins
        // in both application orders.
        let shallow = (path(&["a"]), json!(1), 5u64, "x");
        let deep = (path(&["a", "b"]), json!(2), 3u64, "y");

        let mut m1 = LwwMap::new();
        m1.apply(&shallow.0, shallow.1.clone(), shallow.2, shallow.3);
        m1.apply(&deep.0, deep.1.clone(), deep.2, deep.3);

        let mut m2 = LwwMap::new();
        m2.apply(&deep.0, deep.1.clone(), deep.2, deep.3);
        m2.apply(&shallow.0, shallow.1.clone(), shallow.2, shallow.3);

        assert_eq!(m1.to_value(), m2.to_value());
        assert_eq!(m1.get(&path(&["a"])), Some(json!(1)));
    }

    #[test]
    fn test_subtree_vs_leaf_converges() {
        // Deep write at t7 vs shallow write at t5: the deep one wins
        // in both application orders.
        let shallow = (path(&["a"]), json!(1), 5u64, "x");
        let deep = (path(&["a", "b"]), json!(2), 7u64, "y");

        let mut m1 = LwwMap::new();
        m1.apply(&shallow.0, shallow.1.clone(), shallow.2, shallow.3);
        m1.apply(&deep.0, deep.1.clone(), deep.2, deep.3);

        let mut m2 = LwwMap::new();
        m2.apply(&deep.0, deep.1.clone(), deep.2, deep.3);
        m2.apply(&shallow.0, shallow.1.clone(), shallow.2, shallow.3);

        assert_eq!(m1.to_value(), m2.to_value());
        assert_eq!(m1.get(&path(&["a", "b"])), Some(json!(2)));
    }

    #[test]
    fn test_empty_path_is_noop() {
        let mut map = LwwMap::new();
        assert!(!map.apply(&[], json!(1), 1, "a"));
        assert!(map.is_empty());
    }

    #[test]
    fn test_to_value_strips_metadata() {
        let mut map = LwwMap::new();
        map.apply(&path(&["x"]), json!(1), 1, "a");
        map.apply(&path(&["nested", "y"]), json!(true), 2, "a");

        assert_eq!(map.to_value(), json!({"x": 1, "nested": {"y": true}}));
    }

    #[test]
    fn test_serde_roundtrip_preserves_metadata() {
        let mut map = LwwMap::new();
        map.apply(&path(&["x"]), json!(1), 42, "node-a");
        map.apply(&path(&["deep", "y"]), json!("v"), 43, "node-b");

        let json = serde_json::to_string(&map).unwrap();
        let back: LwwMap = serde_json::from_str(&json).unwrap();
        assert_eq!(map, back);

        // Metadata survives, so future tie-breaks behave identically.
        assert!(!back.clone().apply(&path(&["x"]), json!(9), 41, "node-z"));
    }

    #[test]
    fn test_same_path_aliases() {
        assert!(same_path(
            &[PathSegment::from("a"), PathSegment::Index(0)],
            &[PathSegment::from("a"), PathSegment::from("0")],
        ));
        assert!(!same_path(&path(&["a"]), &path(&["a", "b"])));
    }
}
