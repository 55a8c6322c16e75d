//! Generic strongly connected component detection.
//!
//! Nuutila's refinement of Tarjan's algorithm: only non-root nodes go on the
//! component stack, and a node counts as "in component" once the root of its
//! component has been closed. The depth-first walk keeps its own frame stack,
//! so deep graphs never exhaust the native stack.

use std::collections::{HashMap, HashSet};

use super::graph::GraphTraits;

/// Callbacks fired by `SccDetector`.
pub trait SccHooks<G: GraphTraits> {
    /// Resolves a node through earlier merges before it is visited.
    fn rep_node(&self, _graph: &G, node: G::Node) -> G::Node {
        node
    }

    /// `node` belongs to the component whose root is `rep`.
    fn proc_node_on_cycle(&mut self, graph: &G, node: G::Node, rep: G::Node);

    /// Called for every closed root, including singleton components.
    fn proc_rep_node_on_cycle(&mut self, graph: &G, rep: G::Node);
}

struct Frame<N> {
    node: N,
    stamp: usize,
    children: Vec<N>,
    next: usize,
    /// Representative of the child currently being explored.
    pending: Option<N>,
}

pub struct SccDetector<N> {
    timestamp: usize,
    dfs_num: HashMap<N, usize>,
    in_component: HashSet<N>,
    scc_stack: Vec<N>,
}

impl<N: Copy + Eq + std::hash::Hash + std::fmt::Debug> Default for SccDetector<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<N: Copy + Eq + std::hash::Hash + std::fmt::Debug> SccDetector<N> {
    pub fn new() -> Self {
        Self {
            timestamp: 0,
            dfs_num: HashMap::new(),
            in_component: HashSet::new(),
            scc_stack: Vec::new(),
        }
    }

    pub fn reset(&mut self) {
        self.scc_stack.clear();
        self.dfs_num.clear();
        self.in_component.clear();
    }

    pub fn is_visited(&self, node: N) -> bool {
        self.dfs_num.contains_key(&node)
    }

    /// Visits every node of the graph, then forgets the traversal state.
    pub fn run_on_graph<G, H>(&mut self, graph: &G, hooks: &mut H)
    where
        G: GraphTraits<Node = N>,
        H: SccHooks<G>,
    {
        for node in graph.node_ids() {
            let rep = hooks.rep_node(graph, node);
            if !self.dfs_num.contains_key(&rep) {
                self.detect(graph, hooks, rep);
            }
        }
        assert!(
            self.scc_stack.is_empty(),
            "scc stack not empty after cycle detection"
        );
        self.reset();
    }

    /// Visits what is reachable from `node`. Traversal state is kept, so a
    /// later call skips everything already numbered until `reset`.
    pub fn run_on_node<G, H>(&mut self, graph: &G, hooks: &mut H, node: N)
    where
        G: GraphTraits<Node = N>,
        H: SccHooks<G>,
    {
        assert!(
            self.scc_stack.is_empty(),
            "scc stack not empty before cycle detection"
        );
        let rep = hooks.rep_node(graph, node);
        if !self.dfs_num.contains_key(&rep) {
            self.detect(graph, hooks, rep);
        }
        assert!(
            self.scc_stack.is_empty(),
            "scc stack not empty after cycle detection"
        );
    }

    fn enter(&mut self, graph: &impl GraphTraits<Node = N>, node: N) -> Frame<N> {
        let stamp = self.timestamp;
        self.timestamp += 1;
        debug_assert!(!self.dfs_num.contains_key(&node), "revisit {:?}", node);
        self.dfs_num.insert(node, stamp);
        Frame {
            node,
            stamp,
            children: graph.children(node),
            next: 0,
            pending: None,
        }
    }

    fn lower(&mut self, node: N, succ: N) {
        if self.in_component.contains(&succ) {
            return;
        }
        let succ_num = self.dfs_num[&succ];
        if let Some(num) = self.dfs_num.get_mut(&node) {
            if *num > succ_num {
                *num = succ_num;
            }
        }
    }

    fn detect<G, H>(&mut self, graph: &G, hooks: &mut H, root: N)
    where
        G: GraphTraits<Node = N>,
        H: SccHooks<G>,
    {
        let mut frames = vec![self.enter(graph, root)];

        while let Some(top) = frames.len().checked_sub(1) {
            if let Some(succ) = frames[top].pending.take() {
                let node = frames[top].node;
                self.lower(node, succ);
                frames[top].next += 1;
                continue;
            }

            let frame = &frames[top];
            if frame.next < frame.children.len() {
                let node = frame.node;
                let succ = hooks.rep_node(graph, frame.children[frame.next]);
                if self.dfs_num.contains_key(&succ) {
                    self.lower(node, succ);
                    frames[top].next += 1;
                } else {
                    frames[top].pending = Some(succ);
                    let child = self.enter(graph, succ);
                    frames.push(child);
                }
                continue;
            }

            let (node, stamp) = (frame.node, frame.stamp);
            frames.pop();

            if self.dfs_num[&node] != stamp {
                self.scc_stack.push(node);
                continue;
            }

            self.in_component.insert(node);
            while let Some(&cycle_node) = self.scc_stack.last() {
                if self.dfs_num[&cycle_node] < stamp {
                    break;
                }
                hooks.proc_node_on_cycle(graph, cycle_node, node);
                self.in_component.insert(cycle_node);
                self.scc_stack.pop();
            }
            hooks.proc_rep_node_on_cycle(graph, node);
        }
    }
}

/// Collects every component with more than one node, each sorted, the list
/// ordered by its smallest member.
pub fn strongly_connected_components<G: GraphTraits>(graph: &G) -> Vec<Vec<G::Node>> {
    struct Collect<N> {
        current: Vec<N>,
        components: Vec<Vec<N>>,
    }

    impl<G: GraphTraits> SccHooks<G> for Collect<G::Node> {
        fn proc_node_on_cycle(&mut self, _graph: &G, node: G::Node, _rep: G::Node) {
            self.current.push(node);
        }

        fn proc_rep_node_on_cycle(&mut self, _graph: &G, rep: G::Node) {
            if self.current.is_empty() {
                return;
            }
            self.current.push(rep);
            let mut component = std::mem::take(&mut self.current);
            component.sort();
            self.components.push(component);
        }
    }

    let mut hooks = Collect {
        current: Vec::new(),
        components: Vec::new(),
    };
    SccDetector::new().run_on_graph(graph, &mut hooks);
    hooks.components.sort();
    hooks.components
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;

    #[derive(Default)]
    struct Graph(BTreeMap<u32, Vec<u32>>);

    impl Graph {
        fn new() -> Self {
            Self::default()
        }

        fn add_edge(&mut self, from: u32, to: u32) {
            self.0.entry(from).or_default().push(to);
            self.0.entry(to).or_default();
        }
    }

    impl GraphTraits for Graph {
        type Node = u32;

        fn node_ids(&self) -> Vec<u32> {
            self.0.keys().copied().collect()
        }

        fn children(&self, node: u32) -> Vec<u32> {
            self.0.get(&node).cloned().unwrap_or_default()
        }
    }

    #[test]
    fn test_two_cycles_and_a_tail() {
        let mut graph = Graph::new();
        graph.add_edge(1, 2);
        graph.add_edge(2, 3);
        graph.add_edge(3, 1);
        graph.add_edge(3, 4);
        graph.add_edge(4, 5);
        graph.add_edge(5, 4);
        graph.add_edge(5, 6);
        assert_eq!(
            strongly_connected_components(&graph),
            vec![vec![1, 2, 3], vec![4, 5]]
        );
    }

    #[test]
    fn test_self_loop_is_not_a_component() {
        let mut graph = Graph::new();
        graph.add_edge(7, 7);
        graph.add_edge(7, 8);
        assert!(strongly_connected_components(&graph).is_empty());
    }

    #[test]
    fn test_deep_chain_does_not_overflow() {
        let mut graph = Graph::new();
        let n = 200_000u32;
        for i in 0..n {
            graph.add_edge(i, i + 1);
        }
        graph.add_edge(n, 0);
        let components = strongly_connected_components(&graph);
        assert_eq!(components.len(), 1);
        assert_eq!(components[0].len(), n as usize + 1);
    }

    struct Redirect;

    impl SccHooks<Graph> for Redirect {
        fn rep_node(&self, _graph: &Graph, node: u32) -> u32 {
            // 30 was merged into 3 earlier
            if node == 30 {
                3
            } else {
                node
            }
        }

        fn proc_node_on_cycle(&mut self, _graph: &Graph, node: u32, rep: u32) {
            assert_eq!((node, rep), (3, 2));
        }

        fn proc_rep_node_on_cycle(&mut self, _graph: &Graph, _rep: u32) {}
    }

    #[test]
    fn test_rep_node_resolution() {
        let mut graph = Graph::new();
        graph.add_edge(2, 30);
        graph.add_edge(3, 2);
        let mut detector = SccDetector::new();
        detector.run_on_node(&graph, &mut Redirect, 2);
        assert!(detector.is_visited(3));
        assert!(!detector.is_visited(30));
    }
}
