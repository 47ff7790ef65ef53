//! Arena-backed routing trie with single-segment wildcards.

use std::collections::HashMap;

use crate::error::{Error, Result};

/// Segment that matches any single name without an exact child.
pub const WILDCARD: &str = "*";

/// Index of a node in a [`DispatchTrie`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

#[derive(Debug)]
struct Node<V> {
    name: String,
    parent: Option<NodeId>,
    children: HashMap<String, NodeId>,
    wildcard: Option<NodeId>,
    values: Vec<V>,
}

impl<V> Node<V> {
    fn new(name: String, parent: Option<NodeId>) -> Self {
        Self {
            name,
            parent,
            children: HashMap::new(),
            wildcard: None,
            values: Vec::new(),
        }
    }
}

/// Values registered under dot-separated locations such as `com.example.*`.
///
/// Nodes live in one vector and refer to each other by index; parents are
/// back-references only. The root has an empty name and never holds values.
#[derive(Debug)]
pub struct DispatchTrie<V> {
    nodes: Vec<Node<V>>,
}

impl<V> Default for DispatchTrie<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> DispatchTrie<V> {
    pub fn new() -> Self {
        Self {
            nodes: vec![Node::new(String::new(), None)],
        }
    }

    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    /// Child `name` of `parent`, created if missing.
    pub fn add_child(&mut self, parent: NodeId, name: &str) -> Result<NodeId> {
        if name.is_empty() {
            return Err(Error::IllegalArgument("trie node name must not be empty".into()));
        }
        if let Some(existing) = self.child(parent, name) {
            return Ok(existing);
        }
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node::new(name.to_string(), Some(parent)));
        let p = &mut self.nodes[parent.0];
        if name == WILDCARD {
            p.wildcard = Some(id);
        } else {
            p.children.insert(name.to_string(), id);
        }
        Ok(id)
    }

    /// Existing child `name` of `parent`; never creates one.
    pub fn child(&self, parent: NodeId, name: &str) -> Option<NodeId> {
        let p = &self.nodes[parent.0];
        if name == WILDCARD {
            p.wildcard
        } else {
            p.children.get(name).copied()
        }
    }

    pub fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.nodes[node.0].parent
    }

    pub fn name(&self, node: NodeId) -> &str {
        &self.nodes[node.0].name
    }

    /// Dot-joined path from the root to `node`.
    pub fn full_name(&self, node: NodeId) -> String {
        let mut segments = Vec::new();
        let mut cur = Some(node);
        while let Some(id) = cur {
            let n = &self.nodes[id.0];
            if n.parent.is_some() {
                segments.push(n.name.as_str());
            }
            cur = n.parent;
        }
        segments.reverse();
        segments.join(".")
    }

    pub fn values(&self, node: NodeId) -> &[V] {
        &self.nodes[node.0].values
    }

    /// Register `value` under `segments`, creating intermediate nodes.
    pub fn insert_path(&mut self, segments: &[&str], value: V) -> Result<NodeId> {
        if segments.is_empty() {
            return Err(Error::IllegalArgument("the root cannot hold values".into()));
        }
        let mut node = self.root();
        for segment in segments {
            node = self.add_child(node, segment)?;
        }
        self.nodes[node.0].values.push(value);
        Ok(node)
    }

    /// Register `value` under a dot-separated location.
    pub fn insert(&mut self, location: &str, value: V) -> Result<NodeId> {
        let segments: Vec<&str> = location.split('.').collect();
        self.insert_path(&segments, value)
    }

    /// Nodes holding values that match `segments`, most specific first.
    ///
    /// At each level the exact child is explored before the wildcard child,
    /// and deeper matches come before the shallower nodes they pass through.
    pub fn lookup_path(&self, segments: &[&str]) -> Vec<NodeId> {
        let mut out = Vec::new();
        self.collect(self.root(), segments, &mut out);
        out
    }

    pub fn lookup(&self, location: &str) -> Vec<NodeId> {
        let segments: Vec<&str> = location.split('.').collect();
        self.lookup_path(&segments)
    }

    fn collect(&self, node: NodeId, rest: &[&str], out: &mut Vec<NodeId>) {
        if let Some((head, tail)) = rest.split_first() {
            let n = &self.nodes[node.0];
            if let Some(exact) = n.children.get(*head) {
                self.collect(*exact, tail, out);
            }
            if let Some(wild) = n.wildcard {
                self.collect(wild, tail, out);
            }
        }
        if node != self.root() && !self.nodes[node.0].values.is_empty() {
            out.push(node);
        }
    }

    /// Number of nodes, root included.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() == 1
    }
}
