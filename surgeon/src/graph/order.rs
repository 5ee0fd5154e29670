use std::collections::{BTreeSet, HashSet};

use anyhow::bail;
use tract_hir::prelude::TractResult;

use super::{Graph, VarId};

impl Graph {
    /// Remove every node that does not contribute to a graph output, then
    /// every variable nothing refers to. Graph inputs are kept even when
    /// unused.
    pub fn cleanup(&mut self) -> TractResult<&mut Graph> {
        let producers = self.producers();
        let mut live = vec![false; self.nodes.len()];
        let mut seen = HashSet::new();
        let mut stack: Vec<VarId> = self.outputs.clone();
        while let Some(var) = stack.pop() {
            if !seen.insert(var) {
                continue;
            }
            if let Some(node) = producers.get(&var) {
                if !live[node.0] {
                    live[node.0] = true;
                    stack.extend(self.nodes[node.0].inputs.iter().copied());
                }
            }
        }
        let before = self.nodes.len();
        self.nodes = std::mem::take(&mut self.nodes)
            .into_iter()
            .zip(live)
            .filter_map(|(node, live)| live.then_some(node))
            .collect();
        if before != self.nodes.len() {
            debug!("cleanup removed {} dead nodes", before - self.nodes.len());
        }
        self.compact_variables();
        Ok(self)
    }

    /// Drop unreferenced variables and renumber the survivors.
    fn compact_variables(&mut self) {
        let mut used = vec![false; self.variables.len()];
        for v in self
            .inputs
            .iter()
            .chain(self.outputs.iter())
            .chain(self.nodes.iter().flat_map(|n| n.inputs.iter().chain(n.outputs.iter())))
        {
            used[v.0] = true;
        }
        if used.iter().all(|u| *u) {
            return;
        }
        let mut old_to_new = vec![usize::MAX; self.variables.len()];
        let mut variables = Vec::with_capacity(self.variables.len());
        let old = std::mem::take(&mut self.variables);
        for (ix, (var, used)) in old.into_iter().zip(used).enumerate() {
            if used {
                old_to_new[ix] = variables.len();
                variables.push(var);
            }
        }
        trace!("compacted variables: {} left", variables.len());
        self.variables = variables;
        let remap = |v: &mut VarId| v.0 = old_to_new[v.0];
        self.inputs.iter_mut().for_each(remap);
        self.outputs.iter_mut().for_each(remap);
        for node in &mut self.nodes {
            node.inputs.iter_mut().for_each(remap);
            node.outputs.iter_mut().for_each(remap);
        }
    }

    /// Reorder nodes so each one comes after the producers of its inputs.
    ///
    /// Among ready nodes the earliest one goes first, so a sorted graph is
    /// left untouched.
    pub fn toposort(&mut self) -> TractResult<&mut Graph> {
        let producers = self.producers();
        let count = self.nodes.len();
        let mut pending = vec![0usize; count];
        let mut successors = vec![vec![]; count];
        for (ix, node) in self.nodes.iter().enumerate() {
            for input in &node.inputs {
                if let Some(p) = producers.get(input) {
                    pending[ix] += 1;
                    successors[p.0].push(ix);
                }
            }
        }
        let mut ready: BTreeSet<usize> = (0..count).filter(|&ix| pending[ix] == 0).collect();
        let mut order = Vec::with_capacity(count);
        while let Some(ix) = ready.pop_first() {
            order.push(ix);
            for &succ in &successors[ix] {
                pending[succ] -= 1;
                if pending[succ] == 0 {
                    ready.insert(succ);
                }
            }
        }
        if order.len() != count {
            let stuck = (0..count).find(|ix| pending[*ix] > 0).map(|ix| &*self.nodes[ix].name);
            bail!("Graph contains a cycle (node {:?} never becomes ready)", stuck.unwrap_or("?"))
        }
        if order.iter().enumerate().all(|(a, b)| a == *b) {
            return Ok(self);
        }
        let mut slots: Vec<_> = std::mem::take(&mut self.nodes).into_iter().map(Some).collect();
        self.nodes = order.into_iter().filter_map(|ix| slots[ix].take()).collect();
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use crate::graph::*;
    use tract_hir::prelude::{DatumType, tensor1};

    fn chain() -> (Graph, VarId) {
        let mut g = Graph::default();
        let x = g.add_source("x", DatumType::F32, shape(&[4usize]));
        let a = g.wire_node("a", "Relu", &[x], &["a"], vec![]).unwrap()[0];
        let b = g.wire_node("b", "Relu", &[a], &["b"], vec![]).unwrap()[0];
        g.set_outputs(&[b]);
        (g, a)
    }

    #[test]
    fn cleanup_drops_dead_branch() {
        let (mut g, a) = chain();
        let k = g.add_constant("k", tensor1(&[1f32]));
        g.wire_node("dead", "Add", &[a, k], &["dead"], vec![]).unwrap();
        g.cleanup().unwrap();
        assert_eq!(g.nodes.iter().map(|n| &*n.name).collect::<Vec<_>>(), vec!["a", "b"]);
        assert!(g.var_id("k").is_none());
        assert!(g.var_id("dead").is_none());
        assert_eq!(g.output_names(), vec!["b"]);
    }

    #[test]
    fn cleanup_keeps_unused_inputs() {
        let (mut g, _) = chain();
        g.add_source("unused", DatumType::F32, shape(&[2usize]));
        g.cleanup().unwrap();
        assert_eq!(g.input_names(), vec!["x", "unused"]);
    }

    #[test]
    fn toposort_reorders() {
        let (mut g, _) = chain();
        g.nodes.swap(0, 1);
        g.toposort().unwrap();
        assert_eq!(g.nodes.iter().map(|n| &*n.name).collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn toposort_is_stable() {
        let mut g = Graph::default();
        let x = g.add_source("x", DatumType::F32, shape(&[4usize]));
        let p = g.wire_node("p", "Relu", &[x], &["p"], vec![]).unwrap()[0];
        let q = g.wire_node("q", "Neg", &[x], &["q"], vec![]).unwrap()[0];
        let r = g.wire_node("r", "Add", &[p, q], &["r"], vec![]).unwrap()[0];
        g.set_outputs(&[r]);
        let before = g.clone();
        g.toposort().unwrap();
        assert_eq!(g, before);
    }

    #[test]
    fn toposort_detects_cycles() {
        let (mut g, _) = chain();
        g.nodes[0].inputs[0] = g.var_id("b").unwrap();
        assert!(g.toposort().is_err());
    }
}
