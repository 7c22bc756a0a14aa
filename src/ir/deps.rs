//! Async dependency graph of a procedure.
//!
//! Nodes are the ops that produce or consume completion tokens; an edge
//! runs from a token's producer to every op listing it as a dependency.
//! A chain is well formed when every produced token reaches a blocking
//! `wait` before the procedure returns.

use std::collections::{HashMap, HashSet};

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Dfs, Reversed};

use super::{Module, Op, Procedure, Value};
use crate::diagnostic::Diagnostic;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsyncNode {
    pub opcode: &'static str,
    pub token: Option<Value>,
    /// A blocking join.
    pub blocking: bool,
}

pub struct AsyncGraph {
    graph: DiGraph<AsyncNode, ()>,
    producers: HashMap<Value, NodeIndex>,
}

fn opcode(op: &Op) -> &'static str {
    match op {
        Op::Alloc { .. } => "alloc",
        Op::Dealloc { .. } => "dealloc",
        Op::Memcpy { .. } => "memcpy",
        Op::Wait { .. } => "wait",
        Op::Launch { .. } => "launch",
        _ => "op",
    }
}

impl AsyncGraph {
    pub fn build(procedure: &Procedure) -> Result<Self, Diagnostic> {
        let mut graph = Self {
            graph: DiGraph::new(),
            producers: HashMap::new(),
        };
        graph.add_ops(&procedure.name, &procedure.body)?;
        Ok(graph)
    }

    fn add_ops(&mut self, procedure: &str, ops: &[Op]) -> Result<(), Diagnostic> {
        for op in ops {
            let token = op.async_token();
            let blocking = matches!(op, Op::Wait { token: None, .. });
            if token.is_some() || blocking {
                let node = self.graph.add_node(AsyncNode {
                    opcode: opcode(op),
                    token,
                    blocking,
                });
                for dep in op.async_deps() {
                    let producer = self.producers.get(dep).copied().ok_or_else(|| {
                        Diagnostic::fatal(format!(
                            "in @{}: {} depends on {}, which no earlier async op produces",
                            procedure,
                            opcode(op),
                            dep
                        ))
                    })?;
                    self.graph.add_edge(producer, node, ());
                }
                if let Some(t) = token {
                    self.producers.insert(t, node);
                }
            }
            for region in op.regions() {
                self.add_ops(procedure, region)?;
            }
        }
        Ok(())
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Tokens in `token`'s chain, from the chain start up to `token`.
    pub fn ancestors(&self, token: Value) -> Vec<Value> {
        let Some(&start) = self.producers.get(&token) else {
            return Vec::new();
        };
        let reversed = Reversed(&self.graph);
        let mut dfs = Dfs::new(reversed, start);
        let mut tokens = Vec::new();
        while let Some(n) = dfs.next(reversed) {
            if let Some(t) = self.graph[n].token {
                tokens.push(t);
            }
        }
        tokens.sort();
        tokens
    }

    /// Tokens that no blocking wait joins, directly or through a successor.
    pub fn unjoined_tokens(&self) -> Vec<Value> {
        let reversed = Reversed(&self.graph);
        let mut joined = HashSet::new();
        for join in self.graph.node_indices().filter(|&n| self.graph[n].blocking) {
            let mut dfs = Dfs::new(reversed, join);
            while let Some(n) = dfs.next(reversed) {
                joined.insert(n);
            }
        }
        let mut open: Vec<Value> = self
            .graph
            .node_indices()
            .filter(|n| !joined.contains(n))
            .filter_map(|n| self.graph[n].token)
            .collect();
        open.sort();
        open
    }
}

/// Fail on the first procedure that leaves an async token unjoined.
pub fn verify_async_chains(module: &Module) -> Result<(), Diagnostic> {
    for procedure in &module.procedures {
        let graph = AsyncGraph::build(procedure)?;
        let open = graph.unjoined_tokens();
        if !open.is_empty() {
            let tokens = open
                .iter()
                .map(|t| t.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            return Err(Diagnostic::fatal(format!(
                "@{} returns before async tokens {} are waited on",
                procedure.name, tokens
            ))
            .with_help("end the chain with a blocking `wait` on its last token".to_string()));
        }
        log::debug!(
            "@{}: {} async ops, {} dependencies, all joined",
            procedure.name,
            graph.node_count(),
            graph.edge_count()
        );
    }
    Ok(())
}
