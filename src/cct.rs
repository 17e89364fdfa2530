//! The calling-context tree: a dynamic, context-sensitive profile.
//!
//! A rooted directed graph where each non-root vertex represents a function
//! observed in a sampled call context. An edge `A -> B` means "B was called
//! from A in some observed sample." Recursion is represented by *back-edges*
//! to ancestors rather than unboundedly-deep duplicate vertices (spec §3,
//! §9).

use std::collections::HashMap;

use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::Direction;

use crate::random_quantity::RandomQuantity;

pub type VertexId = NodeIndex<u32>;

pub const ROOT_NAME: &str = "<root>";

#[derive(Debug, Clone)]
pub struct Vertex {
    pub function: String,
    pub patchable: bool,
    pub hotness: f64,
    /// Tree parent; `None` only for the root.
    parent: Option<VertexId>,
    ipc_by_library: HashMap<String, RandomQuantity>,
    /// last sample timestamp seen at this vertex, per (client, thread).
    last_seen: HashMap<(u64, u32), u64>,
    pub call_count_estimate: f64,
}

impl Vertex {
    fn new_root() -> Self {
        Vertex {
            function: ROOT_NAME.to_string(),
            patchable: false,
            hotness: 0.0,
            parent: None,
            ipc_by_library: HashMap::new(),
            last_seen: HashMap::new(),
            call_count_estimate: 0.0,
        }
    }

    fn new_child(function: String, patchable: bool, parent: VertexId) -> Self {
        Vertex {
            function,
            patchable,
            hotness: 0.0,
            parent: Some(parent),
            ipc_by_library: HashMap::new(),
            last_seen: HashMap::new(),
            call_count_estimate: 0.0,
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn ipc(&self, library: &str) -> Option<&RandomQuantity> {
        self.ipc_by_library.get(library)
    }
}

#[derive(Debug, Clone)]
pub struct CallingContextTree {
    graph: StableDiGraph<Vertex, bool>, // edge weight: true => back-edge
    root: VertexId,
}

impl Default for CallingContextTree {
    fn default() -> Self {
        Self::new()
    }
}

impl CallingContextTree {
    pub fn new() -> Self {
        let mut graph = StableDiGraph::new();
        let root = graph.add_node(Vertex::new_root());
        CallingContextTree { graph, root }
    }

    pub fn root(&self) -> VertexId {
        self.root
    }

    pub fn get(&self, vid: VertexId) -> &Vertex {
        &self.graph[vid]
    }

    pub fn get_mut(&mut self, vid: VertexId) -> &mut Vertex {
        &mut self.graph[vid]
    }

    pub fn parent(&self, vid: VertexId) -> Option<VertexId> {
        self.graph[vid].parent
    }

    pub fn vertices(&self) -> impl Iterator<Item = VertexId> + '_ {
        self.graph.node_indices()
    }

    /// Linear scan for the (first) vertex with this function name. CCTs in
    /// this domain are small enough that this is cheaper than maintaining a
    /// secondary name index alongside the tree structure.
    pub fn find_by_name(&self, name: &str) -> Option<VertexId> {
        self.graph.node_indices().find(|&ix| self.graph[ix].function == name)
    }

    fn tree_children(&self, vid: VertexId) -> impl Iterator<Item = VertexId> + '_ {
        self.graph
            .edges_directed(vid, Direction::Outgoing)
            .filter(|e| !*e.weight())
            .map(|e| e.target())
    }

    fn find_tree_child(&self, parent: VertexId, name: &str) -> Option<VertexId> {
        self.tree_children(parent)
            .find(|&c| self.graph[c].function == name)
    }

    fn add_back_edge(&mut self, from: VertexId, to: VertexId) {
        if self.graph.find_edge(from, to).is_none() {
            self.graph.add_edge(from, to, true);
        }
    }

    /// Walks root -> leaf along `frames` (already trimmed of the hardware
    /// artifact frame), inserting or finding vertices, and returns the
    /// vertex id the walk ends at. Recursion — a function already present
    /// among the ancestors of the current insertion point — creates a
    /// back-edge to that ancestor instead of a fresh vertex, and the walk
    /// continues *from* that ancestor.
    pub fn insert_path(&mut self, frames: &[(String, bool)]) -> VertexId {
        // (function name, id) stack from root (exclusive) to current position.
        let mut stack: Vec<(String, VertexId)> = Vec::with_capacity(frames.len());

        for (name, patchable) in frames {
            if let Some(pos) = stack.iter().rposition(|(n, _)| n == name) {
                let (_, ancestor_id) = stack[pos];
                let cur = stack.last().map(|(_, id)| *id).unwrap_or(self.root);
                if cur != ancestor_id {
                    self.add_back_edge(cur, ancestor_id);
                }
                stack.truncate(pos + 1);
                continue;
            }

            let parent_id = stack.last().map(|(_, id)| *id).unwrap_or(self.root);
            let child_id = match self.find_tree_child(parent_id, name) {
                Some(id) => id,
                None => {
                    let v = Vertex::new_child(name.clone(), *patchable, parent_id);
                    let id = self.graph.add_node(v);
                    self.graph.add_edge(parent_id, id, false);
                    id
                }
            };
            stack.push((name.clone(), child_id));
        }

        stack.last().map(|(_, id)| *id).unwrap_or(self.root)
    }

    /// Adds a discounted contribution to a vertex's hotness (called on each
    /// new observation; decay is the separate multiplicative step).
    pub fn bump_hotness(&mut self, vid: VertexId, contribution: f64) {
        self.graph[vid].hotness += contribution;
        self.graph[vid].call_count_estimate += 1.0;
    }

    pub fn record_ipc(&mut self, vid: VertexId, library: &str, ipc: f64) {
        self.graph[vid]
            .ipc_by_library
            .entry(library.to_string())
            .or_insert_with(RandomQuantity::with_default_capacity)
            .observe(ipc);
    }

    /// Returns the previous timestamp for this (client, thread) at this
    /// vertex and records `timestamp` as the new last-seen value. A `None`
    /// return means there is no prior sample to compute a delta against.
    pub fn note_sample_time(
        &mut self,
        vid: VertexId,
        client: u64,
        thread: u32,
        timestamp: u64,
    ) -> Option<u64> {
        let key = (client, thread);
        let prev = self.graph[vid].last_seen.insert(key, timestamp);
        prev
    }

    /// Multiplies every vertex's hotness and call-count estimate by
    /// `discount` (the "decay step"). Does not touch per-client timestamps.
    pub fn decay(&mut self, discount: f64) {
        for ix in self.graph.node_indices() {
            let v = &mut self.graph[ix];
            v.hotness *= discount;
            v.call_count_estimate *= discount;
        }
    }

    /// Linear reduction over all vertices; ties are broken by whichever
    /// vertex was encountered first in iteration order.
    pub fn hottest_node(&self) -> Option<VertexId> {
        self.graph
            .node_indices()
            .filter(|&ix| !self.graph[ix].is_root())
            .max_by(|&a, &b| {
                self.graph[a]
                    .hotness
                    .partial_cmp(&self.graph[b].hotness)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(std::cmp::Ordering::Greater) // keep the first-seen on ties
            })
    }

    /// Every vertex must be reachable from the root by following tree edges
    /// backward through `parent`. Used by tests to check the invariant.
    pub fn is_reachable_from_root(&self, vid: VertexId) -> bool {
        let mut cur = vid;
        loop {
            if cur == self.root {
                return true;
            }
            match self.parent(cur) {
                Some(p) => cur = p,
                None => return false,
            }
        }
    }

    /// True iff every back-edge's target is an ancestor (via `parent`
    /// chain) of its source.
    pub fn back_edges_point_to_ancestors(&self) -> bool {
        for e in self.graph.edge_indices() {
            if !self.graph[e] {
                continue;
            }
            let (src, tgt) = self.graph.edge_endpoints(e).unwrap();
            let mut cur = src;
            let mut found = false;
            while let Some(p) = self.parent(cur) {
                if p == tgt {
                    found = true;
                    break;
                }
                cur = p;
            }
            if !found {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_path_insertion_is_reachable() {
        let mut cct = CallingContextTree::new();
        let vid = cct.insert_path(&[("main".into(), false), ("hot".into(), true)]);
        assert!(cct.is_reachable_from_root(vid));
        assert_eq!(cct.get(vid).function, "hot");
    }

    #[test]
    fn repeated_insertion_reuses_vertices() {
        let mut cct = CallingContextTree::new();
        let a = cct.insert_path(&[("main".into(), false), ("hot".into(), true)]);
        let b = cct.insert_path(&[("main".into(), false), ("hot".into(), true)]);
        assert_eq!(a, b);
    }

    #[test]
    fn recursion_creates_back_edge_not_new_vertex() {
        let mut cct = CallingContextTree::new();
        // main -> fib -> fib -> fib (recursive calls)
        let leaf = cct.insert_path(&[
            ("main".into(), false),
            ("fib".into(), true),
            ("fib".into(), true),
            ("fib".into(), true),
        ]);
        // recursion collapses back into the first "fib" vertex.
        let first_fib = cct.insert_path(&[("main".into(), false), ("fib".into(), true)]);
        assert_eq!(leaf, first_fib);
        assert!(cct.back_edges_point_to_ancestors());
        assert!(cct.is_reachable_from_root(leaf));
    }

    #[test]
    fn decay_is_multiplicative() {
        let mut cct = CallingContextTree::new();
        let vid = cct.insert_path(&[("hot".into(), true)]);
        cct.bump_hotness(vid, 4.0);
        cct.decay(0.5);
        assert!((cct.get(vid).hotness - 2.0).abs() < 1e-9);
    }

    #[test]
    fn hottest_node_breaks_ties_by_first_encountered() {
        let mut cct = CallingContextTree::new();
        let a = cct.insert_path(&[("a".into(), true)]);
        let b = cct.insert_path(&[("b".into(), true)]);
        cct.bump_hotness(a, 5.0);
        cct.bump_hotness(b, 5.0);
        assert_eq!(cct.hottest_node(), Some(a));
    }

    #[test]
    fn all_vertices_reachable_after_batch() {
        let mut cct = CallingContextTree::new();
        cct.insert_path(&[("main".into(), false), ("a".into(), true), ("b".into(), true)]);
        cct.insert_path(&[("main".into(), false), ("a".into(), true), ("c".into(), true)]);
        for v in cct.vertices() {
            assert!(cct.is_reachable_from_root(v));
        }
    }
}
