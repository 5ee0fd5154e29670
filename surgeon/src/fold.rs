//! Constant folding, evaluated by tract's analyser.
use std::collections::HashSet;
use std::fmt::Debug;

use tract_hir::prelude::TractResult;

use crate::graph::{Graph, VarId};
use crate::infer::Analysis;

pub trait ConstantFolder: Debug {
    /// Whether `fold(_, true)` is honoured, folding values derived from
    /// static shapes (`Shape`, `Size`, and what depends on them).
    fn supports_shape_folding(&self) -> bool {
        true
    }

    /// Replace every node whose outputs can be computed ahead of time with
    /// constants. Returns the number of nodes removed.
    fn fold(&self, graph: &mut Graph, fold_shapes: bool) -> TractResult<usize>;
}

/// Ops whose output must not be frozen even when tract can evaluate them.
const NON_DETERMINISTIC: &[&str] = &[
    "RandomUniform",
    "RandomNormal",
    "RandomUniformLike",
    "RandomNormalLike",
    "Multinomial",
    "Bernoulli",
];

#[derive(Debug, Clone, Default)]
pub struct TractFolder;

impl ConstantFolder for TractFolder {
    fn fold(&self, graph: &mut Graph, fold_shapes: bool) -> TractResult<usize> {
        let analysis = Analysis::run(graph)?;
        let mut known: HashSet<VarId> = (0..graph.variables.len())
            .map(VarId)
            .filter(|v| graph.variable(*v).is_constant())
            .collect();
        let mut folded = vec![];
        for (ix, node) in graph.nodes.iter().enumerate() {
            if NON_DETERMINISTIC.contains(&&*node.op_type) {
                continue;
            }
            if node.outputs.iter().any(|o| graph.outputs.contains(o)) {
                continue;
            }
            if !fold_shapes
                && !node.inputs.iter().all(|i| known.contains(i) || graph.variable(*i).is_empty())
            {
                continue;
            }
            let outputs: Vec<VarId> =
                node.outputs.iter().copied().filter(|o| !graph.variable(*o).is_empty()).collect();
            if outputs.is_empty() {
                continue;
            }
            let values: Option<Vec<_>> =
                outputs.iter().map(|o| analysis.value(&graph.variable(*o).name)).collect();
            let Some(values) = values else { continue };
            trace!("Folding {} ({})", node.name, node.op_type);
            known.extend(outputs.iter().copied());
            folded.push((ix, outputs, values));
        }
        let removed: HashSet<usize> = folded.iter().map(|(ix, _, _)| *ix).collect();
        for (_, outputs, values) in folded {
            for (var, value) in outputs.into_iter().zip(values) {
                graph.variable_mut(var).set_value(value);
            }
        }
        graph.nodes = std::mem::take(&mut graph.nodes)
            .into_iter()
            .enumerate()
            .filter(|(ix, _)| !removed.contains(ix))
            .map(|(_, n)| n)
            .collect();
        debug!("Folded {} nodes (fold_shapes: {fold_shapes})", removed.len());
        Ok(removed.len())
    }
}
