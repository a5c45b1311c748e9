use cid::Cid;
use indexmap::IndexMap;
use ipld_core::ipld::Ipld;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

/// A decoded DAG value.
///
/// Links to other blocks are a first-class variant, decided once at decode
/// time (CBOR tag 42 on the wire). Maps are shared nodes so callers can build
/// a document, hand sub-nodes around and keep mutating them until the graph
/// is serialized.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Integer(i128),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(MapNode),
    Link(Cid),
}

/// A shared, insertion-ordered map node.
///
/// Cloning a `MapNode` clones the handle, not the contents - two clones see
/// each other's inserts. Identity (for cycle detection) is the allocation,
/// not the contents.
#[derive(Debug, Clone, Default)]
pub struct MapNode(Arc<RwLock<IndexMap<String, Value>>>);

impl MapNode {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.write().unwrap().insert(key.into(), value.into());
    }

    /// Returns a clone of the value stored under `key`.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.0.read().unwrap().get(key).cloned()
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.0.write().unwrap().shift_remove(key)
    }

    pub fn len(&self) -> usize {
        self.0.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.read().unwrap().is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        self.0.read().unwrap().keys().cloned().collect()
    }

    /// Snapshot of the entries in insertion order.
    pub fn snapshot(&self) -> Vec<(String, Value)> {
        self.0
            .read()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Allocation identity, used by the cycle detector.
    fn id(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }

    /// Fallible snapshot for the cycle detector - a poisoned lock yields None.
    fn try_snapshot(&self) -> Option<Vec<(String, Value)>> {
        let guard = self.0.read().ok()?;
        Some(guard.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }
}

impl FromIterator<(String, Value)> for MapNode {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        MapNode(Arc::new(RwLock::new(iter.into_iter().collect())))
    }
}

impl PartialEq for MapNode {
    fn eq(&self, other: &Self) -> bool {
        if Arc::ptr_eq(&self.0, &other.0) {
            return true;
        }
        let a = self.snapshot();
        let b: HashMap<String, Value> = other.snapshot().into_iter().collect();
        a.len() == b.len() && a.iter().all(|(k, v)| b.get(k) == Some(v))
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::Link(a), Value::Link(b)) => a == b,
            _ => false,
        }
    }
}

impl Value {
    pub fn link(cid: Cid) -> Self {
        Value::Link(cid)
    }

    pub fn as_map(&self) -> Option<&MapNode> {
        match self {
            Value::Map(node) => Some(node),
            _ => None,
        }
    }

    pub fn as_link(&self) -> Option<&Cid> {
        match self {
            Value::Link(cid) => Some(cid),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i128> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Structural copy with fresh map allocations.
    ///
    /// Used by the decode cache: handing out deep clones keeps cached entries
    /// immutable no matter what the caller does with the result. Input must
    /// be acyclic (decoded values always are).
    pub fn deep_clone(&self) -> Value {
        match self {
            Value::List(items) => Value::List(items.iter().map(Value::deep_clone).collect()),
            Value::Map(node) => Value::Map(
                node.snapshot()
                    .into_iter()
                    .map(|(k, v)| (k, v.deep_clone()))
                    .collect(),
            ),
            other => other.clone(),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(v as i128)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v as i128)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Integer(v as i128)
    }
}

impl From<i128> for Value {
    fn from(v: i128) -> Self {
        Value::Integer(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<Cid> for Value {
    fn from(v: Cid) -> Self {
        Value::Link(v)
    }
}

impl From<MapNode> for Value {
    fn from(v: MapNode) -> Self {
        Value::Map(v)
    }
}

enum Step {
    Enter(Value),
    Leave(usize),
}

/// Detects whether a value contains itself.
///
/// Explicit worklist over map identities so arbitrarily deep documents never
/// exhaust the call stack. Shared sub-maps (diamonds) are fine - only a map
/// reachable from inside itself counts. A failure to read a node (poisoned
/// lock) is treated as not circular.
pub(crate) fn is_circular(value: &Value) -> bool {
    let mut on_path: HashSet<usize> = HashSet::new();
    let mut stack = vec![Step::Enter(value.clone())];
    while let Some(step) = stack.pop() {
        match step {
            Step::Leave(id) => {
                on_path.remove(&id);
            }
            Step::Enter(Value::List(items)) => {
                stack.extend(items.into_iter().map(Step::Enter));
            }
            Step::Enter(Value::Map(node)) => {
                let id = node.id();
                if !on_path.insert(id) {
                    return true;
                }
                stack.push(Step::Leave(id));
                if let Some(entries) = node.try_snapshot() {
                    stack.extend(entries.into_iter().map(|(_, v)| Step::Enter(v)));
                }
            }
            Step::Enter(_) => {}
        }
    }
    false
}

/// Converts a value into the `Ipld` data model for encoding.
///
/// Map keys come out in `BTreeMap` order, which is what gives the encoding
/// its canonical key ordering. Callers must have run the cycle check first.
pub(crate) fn to_ipld(value: &Value) -> Ipld {
    match value {
        Value::Null => Ipld::Null,
        Value::Bool(b) => Ipld::Bool(*b),
        Value::Integer(i) => Ipld::Integer(*i),
        Value::Float(f) => Ipld::Float(*f),
        Value::String(s) => Ipld::String(s.clone()),
        Value::Bytes(b) => Ipld::Bytes(b.clone()),
        Value::List(items) => Ipld::List(items.iter().map(to_ipld).collect()),
        Value::Map(node) => Ipld::Map(
            node.snapshot()
                .into_iter()
                .map(|(k, v)| (k, to_ipld(&v)))
                .collect(),
        ),
        Value::Link(cid) => Ipld::Link(*cid),
    }
}

/// Converts decoded `Ipld` into a value tree with fresh map nodes.
pub(crate) fn from_ipld(ipld: Ipld) -> Value {
    match ipld {
        Ipld::Null => Value::Null,
        Ipld::Bool(b) => Value::Bool(b),
        Ipld::Integer(i) => Value::Integer(i),
        Ipld::Float(f) => Value::Float(f),
        Ipld::String(s) => Value::String(s),
        Ipld::Bytes(b) => Value::Bytes(b),
        Ipld::List(items) => Value::List(items.into_iter().map(from_ipld).collect()),
        Ipld::Map(map) => Value::Map(map.into_iter().map(|(k, v)| (k, from_ipld(v))).collect()),
        Ipld::Link(cid) => Value::Link(cid),
    }
}
