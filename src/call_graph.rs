//! Static call graph: function -> called-functions, augmented with
//! "called-from-loop" and "bitcode-available" flags (spec §2).

use std::collections::HashMap;

use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::Direction;

#[derive(Debug, Clone)]
struct FuncNode {
    name: String,
    bitcode_available: bool,
}

#[derive(Debug, Clone, Copy, Default)]
struct CallEdge {
    /// Whether this call site is lexically inside a loop.
    from_loop: bool,
}

#[derive(Debug, Clone, Default)]
pub struct CallGraph {
    graph: StableDiGraph<FuncNode, CallEdge>,
    index: HashMap<String, NodeIndex>,
}

impl CallGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_function(&mut self, name: impl Into<String>, bitcode_available: bool) {
        let name = name.into();
        if let Some(&ix) = self.index.get(&name) {
            self.graph[ix].bitcode_available = bitcode_available;
            return;
        }
        let ix = self.graph.add_node(FuncNode {
            name: name.clone(),
            bitcode_available,
        });
        self.index.insert(name, ix);
    }

    fn ensure(&mut self, name: &str) -> NodeIndex {
        if let Some(&ix) = self.index.get(name) {
            return ix;
        }
        let ix = self.graph.add_node(FuncNode {
            name: name.to_string(),
            bitcode_available: false,
        });
        self.index.insert(name.to_string(), ix);
        ix
    }

    pub fn add_call(&mut self, caller: &str, callee: &str, from_loop: bool) {
        let a = self.ensure(caller);
        let b = self.ensure(callee);
        if let Some(e) = self.graph.find_edge(a, b) {
            let edge = &mut self.graph[e];
            edge.from_loop = edge.from_loop || from_loop;
        } else {
            self.graph.add_edge(a, b, CallEdge { from_loop });
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn have_bitcode(&self, name: &str) -> bool {
        self.index
            .get(name)
            .map(|&ix| self.graph[ix].bitcode_available)
            .unwrap_or(false)
    }

    pub fn set_bitcode_available(&mut self, name: &str, available: bool) {
        let ix = self.ensure(name);
        self.graph[ix].bitcode_available = available;
    }

    pub fn called_functions(&self, name: &str) -> Vec<String> {
        let Some(&ix) = self.index.get(name) else {
            return Vec::new();
        };
        self.graph
            .neighbors_directed(ix, Direction::Outgoing)
            .map(|n| self.graph[n].name.clone())
            .collect()
    }

    /// True iff any call-site targeting this function is inside a loop.
    pub fn is_called_from_loop(&self, name: &str) -> bool {
        let Some(&ix) = self.index.get(name) else {
            return false;
        };
        self.graph
            .edges_directed(ix, Direction::Incoming)
            .any(|e| e.weight().from_loop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_callees() {
        let mut cg = CallGraph::new();
        cg.add_function("main", true);
        cg.add_function("hot", true);
        cg.add_call("main", "hot", false);
        assert_eq!(cg.called_functions("main"), vec!["hot".to_string()]);
    }

    #[test]
    fn bitcode_availability_is_per_function() {
        let mut cg = CallGraph::new();
        cg.add_function("main", true);
        cg.add_function("libc_memcpy", false);
        assert!(cg.have_bitcode("main"));
        assert!(!cg.have_bitcode("libc_memcpy"));
        assert!(!cg.have_bitcode("never-seen"));
    }

    #[test]
    fn called_from_loop_flag_is_sticky_across_duplicate_edges() {
        let mut cg = CallGraph::new();
        cg.add_function("main", true);
        cg.add_function("hot", true);
        cg.add_call("main", "hot", false);
        assert!(!cg.is_called_from_loop("hot"));
        cg.add_call("main", "hot", true);
        assert!(cg.is_called_from_loop("hot"));
    }
}
