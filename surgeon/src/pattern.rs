//! Locating the PP-YOLOE detection head in a converted graph.
//!
//! The converted tail has a fixed shape: boxes end with `Mul` (by the
//! anchor strides) feeding a `Div` (by the image scale factor), and class
//! scores come out of a `Concat` of three `Reshape`s, one per feature
//! level.
use tract_hir::prelude::{DatumType, TractResult};

use crate::errors::SurgeryError;
use crate::graph::{Graph, NodeId, VarId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PostprocessAnchors {
    /// Box branch `Mul`, its first output carries the boxes.
    pub mul: NodeId,
    /// Class branch `Concat`, its first output carries the scores as
    /// `[batch, classes, anchors]`.
    pub concat: NodeId,
    pub anchors: i64,
    pub classes: i64,
}

/// First `Mul` (in node order of the `Div`s) directly feeding a `Div` as
/// its first input.
pub fn find_box_anchor(graph: &Graph) -> Option<NodeId> {
    let producers = graph.producers();
    graph
        .nodes
        .iter()
        .filter(|n| n.op_type == "Div")
        .filter_map(|div| producers.get(div.inputs.first()?))
        .find(|p| graph.node(**p).op_type == "Mul")
        .copied()
}

/// First `Concat` of exactly three inputs, all produced by `Reshape`s.
pub fn find_class_anchor(graph: &Graph) -> Option<NodeId> {
    let producers = graph.producers();
    graph
        .nodes
        .iter()
        .position(|n| {
            n.op_type == "Concat"
                && n.inputs.len() == 3
                && n.inputs
                    .iter()
                    .all(|i| producers.get(i).is_some_and(|p| graph.node(*p).op_type == "Reshape"))
        })
        .map(NodeId)
}

/// Target shape of a `Reshape`, which must be a constant by now.
fn reshape_target(graph: &Graph, reshape: NodeId) -> TractResult<Vec<i64>> {
    let node = graph.node(reshape);
    let target = node.inputs.get(1).map(|v| graph.variable(*v));
    let Some(value) = target.and_then(|t| t.value.as_ref()) else {
        return Err(SurgeryError::mismatch(format!(
            "Reshape {} has no constant target shape.",
            node.name
        ))
        .into());
    };
    let value = value.cast_to::<i64>()?;
    Ok(value.as_slice::<i64>()?.to_vec())
}

fn target_dim(graph: &Graph, reshape: NodeId, axis: usize) -> TractResult<i64> {
    reshape_target(graph, reshape)?.get(axis).copied().ok_or_else(|| {
        SurgeryError::mismatch(format!(
            "Reshape {} target shape has no axis {axis}.",
            graph.node(reshape).name
        ))
        .into()
    })
}

/// Find both heads and check they agree on the anchor count.
pub fn locate_anchors(graph: &Graph) -> TractResult<PostprocessAnchors> {
    let mul = find_box_anchor(graph).ok_or_else(|| SurgeryError::mismatch("Mul node not found."))?;
    let concat =
        find_class_anchor(graph).ok_or_else(|| SurgeryError::mismatch("Concat node not found."))?;

    let producers = graph.producers();
    let reshapes: Vec<NodeId> =
        graph.node(concat).inputs.iter().filter_map(|i| producers.get(i).copied()).collect();
    let classes = target_dim(graph, reshapes[0], 1)?;
    let mut sum = 0;
    for r in &reshapes {
        sum += target_dim(graph, *r, 2)?;
    }

    let Some(&strides) = graph.node(mul).inputs.get(1) else {
        return Err(SurgeryError::mismatch("Mul node has a single input.").into());
    };
    let strides = graph.variable(strides);
    let anchors = strides.shape.as_ref().and_then(|s| s.first()).and_then(|d| d.to_i64());
    let Some(anchors) = anchors else {
        return Err(SurgeryError::mismatch(format!("{} has no known first dimension.", strides.name))
            .into());
    };
    if anchors != sum {
        return Err(SurgeryError::Consistency {
            tensor: strides.name.clone(),
            expected: sum,
            found: anchors,
        }
        .into());
    }
    debug!(
        "Box head at {}, class head at {}: {anchors} anchors, {classes} classes",
        graph.node(mul).name,
        graph.node(concat).name
    );
    Ok(PostprocessAnchors { mul, concat, anchors, classes })
}

impl PostprocessAnchors {
    pub fn boxes(&self, graph: &Graph) -> VarId {
        graph.node(self.mul).outputs[0]
    }

    pub fn class_scores(&self, graph: &Graph) -> VarId {
        graph.node(self.concat).outputs[0]
    }

    /// Scores after transposition: `[batch, anchors, classes]`.
    pub fn scores_shape(&self, batch: usize) -> Vec<i64> {
        vec![batch as i64, self.anchors, self.classes]
    }
}

/// Default element type of the exported scores.
pub fn score_type(half: bool) -> DatumType {
    if half { DatumType::F16 } else { DatumType::F32 }
}
