//! Graphviz rendering of the control-flow and data-dependence views.

use petgraph::dot::{Config as DotConfig, Dot};
use petgraph::visit::EdgeRef;
use petgraph::Graph;

use super::node::{DgEdge, DgNode, EdgeAttr};
use super::DgGraph;

fn escape(text: &str) -> String {
    text.replace('\\', "\\\\").replace('"', "\\\"")
}

impl DgGraph<'_> {
    /// Keeps the nodes and only the edges `keep` accepts.
    fn view(&self, keep: impl Fn(&DgEdge) -> bool) -> Graph<DgNode, DgEdge> {
        self.graph
            .filter_map(|_, node| Some(*node), |_, edge| keep(edge).then_some(*edge))
    }

    fn render(&self, view: &Graph<DgNode, DgEdge>, color: &str, labeled: bool) -> String {
        let program = self.program;
        format!(
            "{:?}",
            Dot::with_attr_getters(
                view,
                &[DotConfig::NodeNoLabel, DotConfig::EdgeNoLabel],
                &|_, edge| {
                    let mut attrs = format!("color={}", color);
                    if labeled {
                        if let Some(value) = edge.weight().value {
                            attrs.push_str(&format!(
                                " label=\"{}\"",
                                escape(&program.value_name(value))
                            ));
                        }
                    }
                    if edge.weight().attr.intersects(EdgeAttr::CALL | EdgeAttr::RET) {
                        attrs.push_str(" style=dashed");
                    }
                    attrs
                },
                &|_, (_, node)| {
                    format!(
                        "label=\"N{}\\n{}\"",
                        node.id,
                        escape(&program.inst_text(node.inst))
                    )
                },
            )
        )
    }

    /// Control flow edges in black; calls and returns dashed.
    pub fn cfg_dot(&self) -> String {
        let view = self.view(DgEdge::is_cfg);
        self.render(&view, "black", false)
    }

    /// Data dependences in red, labelled with the value they carry.
    pub fn ddg_dot(&self) -> String {
        let view = self.view(DgEdge::is_dd);
        self.render(&view, "red", true)
    }

    /// Every edge, for debugging.
    pub fn edge_list(&self) -> Vec<(usize, usize, DgEdge)> {
        self.graph
            .edge_references()
            .map(|e| (self.graph[e.source()].id, self.graph[e.target()].id, *e.weight()))
            .collect()
    }
}
