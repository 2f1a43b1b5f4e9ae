#![forbid(unsafe_code)]

//! The trait tree: nested storage addressed by path segments.
//!
//! Every registered position holds exactly one [`TraitNode`]:
//!
//! - [`TraitNode::Leaf`] - a plain value (scalars, arrays, null);
//! - [`TraitNode::Selector`] - a derived value: its compute function, the
//!   dependency set of its latest evaluation, and the cached result;
//! - [`TraitNode::Branch`] - a record whose keys are child traits.
//!
//! Dispatch over the three shapes is pattern matching on this union; the
//! tree never probes values for their runtime shape.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::selector::SelectorNode;

/// A node in the trait tree.
pub enum TraitNode {
    /// A plain stored value.
    Leaf(Value),
    /// A derived value with its compute function and cache.
    Selector(SelectorNode),
    /// A record whose keys are independently addressable child traits.
    Branch(BTreeMap<String, TraitNode>),
}

impl TraitNode {
    /// Convert the node (and everything under it) into a plain value.
    ///
    /// Branches become objects of their materialized children; selectors
    /// contribute their cached result.
    #[must_use]
    pub fn materialize(&self) -> Value {
        match self {
            Self::Leaf(value) => value.clone(),
            Self::Selector(selector) => selector.cached.clone(),
            Self::Branch(children) => Value::Object(
                children
                    .iter()
                    .map(|(key, child)| (key.clone(), child.materialize()))
                    .collect(),
            ),
        }
    }

    /// Whether this node is a selector.
    #[must_use]
    pub fn is_selector(&self) -> bool {
        matches!(self, Self::Selector(_))
    }
}

impl std::fmt::Debug for TraitNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Leaf(value) => f.debug_tuple("Leaf").field(value).finish(),
            Self::Selector(selector) => f.debug_tuple("Selector").field(selector).finish(),
            Self::Branch(children) => f.debug_tuple("Branch").field(children).finish(),
        }
    }
}

/// The nested tree of all stored traits.
#[derive(Debug, Default)]
pub struct TraitTree {
    root: BTreeMap<String, TraitNode>,
}

impl TraitTree {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Borrow the node at an exact position, if one exists.
    #[must_use]
    pub fn node(&self, segments: &[&str]) -> Option<&TraitNode> {
        let (last, ancestors) = segments.split_last()?;
        let mut children = &self.root;
        for segment in ancestors {
            match children.get(*segment) {
                Some(TraitNode::Branch(next)) => children = next,
                _ => return None,
            }
        }
        children.get(*last)
    }

    /// Mutably borrow the node at an exact position, if one exists.
    #[must_use]
    pub fn node_mut(&mut self, segments: &[&str]) -> Option<&mut TraitNode> {
        let (last, ancestors) = segments.split_last()?;
        let mut children = &mut self.root;
        for segment in ancestors {
            match children.get_mut(*segment) {
                Some(TraitNode::Branch(next)) => children = next,
                _ => return None,
            }
        }
        children.get_mut(*last)
    }

    /// Read the value at a position.
    ///
    /// Walks branches by segment; if the walk reaches a leaf or a selector
    /// before the segments run out, the remaining segments index into that
    /// value (object keys and array indices), mirroring how reads behave on
    /// values that were stored whole.
    #[must_use]
    pub fn value_at(&self, segments: &[&str]) -> Option<Value> {
        let mut children = &self.root;
        for (depth, segment) in segments.iter().enumerate() {
            match children.get(*segment) {
                Some(TraitNode::Branch(next)) => children = next,
                Some(node) => {
                    let value = node.materialize();
                    return index_into(&value, &segments[depth + 1..]).cloned();
                }
                None => return None,
            }
        }
        // The position itself is a branch.
        let node = self.node(segments)?;
        Some(node.materialize())
    }

    /// Write a node at a position, creating intermediate branches as
    /// needed. Any non-branch intermediate on the way is replaced by a
    /// branch; the node previously at the position is overwritten.
    pub fn write(&mut self, segments: &[&str], node: TraitNode) {
        let Some((last, ancestors)) = segments.split_last() else {
            return;
        };
        let children = self.branch_for(ancestors);
        children.insert((*last).to_string(), node);
    }

    /// Ensure the position holds a branch, preserving an existing branch
    /// and its children.
    pub fn ensure_branch(&mut self, segments: &[&str]) {
        self.branch_for(segments);
    }

    /// Walk to the branch at `segments`, creating/replacing as needed.
    fn branch_for(&mut self, segments: &[&str]) -> &mut BTreeMap<String, TraitNode> {
        let mut children = &mut self.root;
        for segment in segments {
            let entry = children
                .entry((*segment).to_string())
                .or_insert_with(|| TraitNode::Branch(BTreeMap::new()));
            if !matches!(entry, TraitNode::Branch(_)) {
                *entry = TraitNode::Branch(BTreeMap::new());
            }
            let TraitNode::Branch(next) = entry else {
                unreachable!("entry was just normalized to a branch");
            };
            children = next;
        }
        children
    }
}

/// Index a plain value by the remaining path segments.
fn index_into<'a>(value: &'a Value, segments: &[&str]) -> Option<&'a Value> {
    let mut current = value;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(*segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn write_creates_intermediate_branches() {
        let mut tree = TraitTree::new();
        tree.write(&["a", "b", "c"], TraitNode::Leaf(json!(1)));

        assert!(matches!(tree.node(&["a"]), Some(TraitNode::Branch(_))));
        assert!(matches!(tree.node(&["a", "b"]), Some(TraitNode::Branch(_))));
        assert_eq!(tree.value_at(&["a", "b", "c"]), Some(json!(1)));
    }

    #[test]
    fn branch_materializes_as_object() {
        let mut tree = TraitTree::new();
        tree.write(&["a", "b"], TraitNode::Leaf(json!("x")));
        tree.write(&["a", "c"], TraitNode::Leaf(json!(2)));

        assert_eq!(tree.value_at(&["a"]), Some(json!({ "b": "x", "c": 2 })));
    }

    #[test]
    fn missing_positions_read_as_none() {
        let tree = TraitTree::new();
        assert!(tree.value_at(&["nope"]).is_none());
        assert!(tree.node(&["nope", "deeper"]).is_none());
    }

    #[test]
    fn reads_index_into_leaf_values() {
        let mut tree = TraitTree::new();
        tree.write(&["list"], TraitNode::Leaf(json!([10, 20, 30])));

        assert_eq!(tree.value_at(&["list", "1"]), Some(json!(20)));
        assert!(tree.value_at(&["list", "9"]).is_none());
        assert!(tree.value_at(&["list", "x"]).is_none());
    }

    #[test]
    fn overwriting_a_leaf_with_a_deeper_write_replaces_it() {
        let mut tree = TraitTree::new();
        tree.write(&["a"], TraitNode::Leaf(json!("scalar")));
        tree.write(&["a", "b"], TraitNode::Leaf(json!(1)));

        assert_eq!(tree.value_at(&["a"]), Some(json!({ "b": 1 })));
    }

    #[test]
    fn ensure_branch_preserves_existing_children() {
        let mut tree = TraitTree::new();
        tree.write(&["a", "b"], TraitNode::Leaf(json!(1)));
        tree.ensure_branch(&["a"]);

        assert_eq!(tree.value_at(&["a", "b"]), Some(json!(1)));
    }

    #[test]
    fn ensure_branch_converts_a_leaf() {
        let mut tree = TraitTree::new();
        tree.write(&["a"], TraitNode::Leaf(json!(5)));
        tree.ensure_branch(&["a"]);

        assert_eq!(tree.value_at(&["a"]), Some(json!({})));
    }
}
