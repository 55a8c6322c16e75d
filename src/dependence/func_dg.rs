//! Per-function part of the dependence graph and its reaching definitions.

use std::collections::HashMap;

use petgraph::graph::NodeIndex;
use petgraph::visit::EdgeRef;
use petgraph::{Direction, Graph};

use crate::ir::{FuncId, InstId, ValueId};
use crate::util::SparseBitSet;

use super::def_use::InstAnalyzer;
use super::node::{DgEdge, DgNode, EdgeAttr};

pub struct FuncDg {
    func: FuncId,
    pub(crate) entry: Option<NodeIndex>,
    pub(crate) exit: Option<NodeIndex>,
    /// In instruction layout order.
    pub(crate) nodes: Vec<NodeIndex>,
    pub(crate) analyzer: InstAnalyzer,
}

impl FuncDg {
    pub fn new(analyzer: InstAnalyzer) -> Self {
        Self {
            func: analyzer.func(),
            entry: None,
            exit: None,
            nodes: Vec::new(),
            analyzer,
        }
    }

    pub fn func(&self) -> FuncId {
        self.func
    }

    /// Head node of the entry block.
    pub fn entry(&self) -> Option<NodeIndex> {
        self.entry
    }

    /// Tail node of a block without successors.
    pub fn exit(&self) -> Option<NodeIndex> {
        self.exit
    }

    pub fn nodes(&self) -> &[NodeIndex] {
        &self.nodes
    }

    pub fn analyzer(&self) -> &InstAnalyzer {
        &self.analyzer
    }

    /// Numbers every definition of the function. Possible definitions get
    /// an id and a GEN entry but never join a KILL set.
    fn def_registry(&self, graph: &Graph<DgNode, DgEdge>) -> DefRegistry {
        let mut registry = DefRegistry::default();
        for node in &self.nodes {
            let inst = graph[*node].inst;
            let mut gen = SparseBitSet::new();
            if let Some(du) = self.analyzer.def_use(inst) {
                for def in du.defs() {
                    let id = registry.defs.len();
                    registry.defs.push((def, inst));
                    gen.insert(id);
                    if !du.is_pdef(def) {
                        registry.kill.entry(def).or_default().insert(id);
                    }
                }
            }
            registry.gen.push(gen);
        }
        registry
    }

    /// Iterates `OUT = GEN ∪ (IN − KILL)` to a fixpoint. IN is the union of
    /// the OUT sets of intraprocedural CFG predecessors; the first node has
    /// no IN.
    pub fn reaching_definitions(&self, graph: &Graph<DgNode, DgEdge>) -> ReachingDefs {
        let registry = self.def_registry(graph);
        let position: HashMap<NodeIndex, usize> = self
            .nodes
            .iter()
            .enumerate()
            .map(|(pos, node)| (*node, pos))
            .collect();
        let preds: Vec<Vec<usize>> = self
            .nodes
            .iter()
            .map(|node| {
                graph
                    .edges_directed(*node, Direction::Incoming)
                    .filter(|e| {
                        e.weight().is_cfg()
                            && !e.weight().attr.intersects(EdgeAttr::CALL | EdgeAttr::RET)
                    })
                    .filter_map(|e| position.get(&e.source()).copied())
                    .collect()
            })
            .collect();
        let empty = SparseBitSet::new();
        let kills: Vec<&SparseBitSet> = self
            .nodes
            .iter()
            .map(|node| {
                self.analyzer
                    .def_use(graph[*node].inst)
                    .and_then(|du| du.ddef())
                    .and_then(|ddef| registry.kill.get(&ddef))
                    .unwrap_or(&empty)
            })
            .collect();

        let n = self.nodes.len();
        let mut ins = vec![SparseBitSet::new(); n];
        let mut outs = vec![SparseBitSet::new(); n];
        let mut rounds = 0;
        loop {
            rounds += 1;
            let mut changed = false;
            for pos in 0..n {
                if pos != 0 {
                    for pred in &preds[pos] {
                        let pred_out = std::mem::take(&mut outs[*pred]);
                        ins[pos].union_with(&pred_out);
                        outs[*pred] = pred_out;
                    }
                }
                changed |= outs[pos].union_with(&registry.gen[pos]);
                let mut live = ins[pos].clone();
                live.subtract(kills[pos]);
                changed |= outs[pos].union_with(&live);
            }
            if !changed {
                break;
            }
        }
        log::trace!(
            "reaching definitions of function {}: {} defs, {} rounds",
            self.func,
            registry.defs.len(),
            rounds
        );

        let inst_pos = self
            .nodes
            .iter()
            .enumerate()
            .map(|(pos, node)| (graph[*node].inst, pos))
            .collect();
        ReachingDefs {
            defs: registry.defs,
            ins,
            outs,
            inst_pos,
        }
    }

    /// `(def node, use node, value)` for every use reached by a definition
    /// of the same value.
    pub fn data_dependences(
        &self,
        graph: &Graph<DgNode, DgEdge>,
        reaching: &ReachingDefs,
    ) -> Vec<(NodeIndex, NodeIndex, ValueId)> {
        let mut edges = Vec::new();
        for (pos, node) in self.nodes.iter().enumerate() {
            let Some(du) = self.analyzer.def_use(graph[*node].inst) else {
                continue;
            };
            for used in du.uses() {
                for id in reaching.ins[pos].iter() {
                    let (value, def_inst) = reaching.defs[id];
                    if value != used {
                        continue;
                    }
                    if let Some(def_pos) = reaching.inst_pos.get(&def_inst) {
                        edges.push((self.nodes[*def_pos], *node, used));
                    }
                }
            }
        }
        edges
    }
}

#[derive(Default)]
struct DefRegistry {
    defs: Vec<(ValueId, InstId)>,
    /// Indexed by node position.
    gen: Vec<SparseBitSet>,
    kill: HashMap<ValueId, SparseBitSet>,
}

/// Solution of the reaching-definitions problem of one function.
pub struct ReachingDefs {
    defs: Vec<(ValueId, InstId)>,
    ins: Vec<SparseBitSet>,
    outs: Vec<SparseBitSet>,
    inst_pos: HashMap<InstId, usize>,
}

impl ReachingDefs {
    fn resolve(&self, set: &SparseBitSet) -> Vec<(ValueId, InstId)> {
        set.iter().map(|id| self.defs[id]).collect()
    }

    /// `(value, defining instruction)` pairs reaching `inst`.
    pub fn reaching_in(&self, inst: InstId) -> Vec<(ValueId, InstId)> {
        self.inst_pos
            .get(&inst)
            .map(|pos| self.resolve(&self.ins[*pos]))
            .unwrap_or_default()
    }

    pub fn reaching_out(&self, inst: InstId) -> Vec<(ValueId, InstId)> {
        self.inst_pos
            .get(&inst)
            .map(|pos| self.resolve(&self.outs[*pos]))
            .unwrap_or_default()
    }

    pub fn def_count(&self) -> usize {
        self.defs.len()
    }
}
