//! TensorRT `EfficientNMS_TRT` plugin declaration.
use itertools::Itertools;
use tract_hir::prelude::{DatumType, TractResult};

use crate::graph::{Attribute, Graph, NodeId, VarId, Variable, shape};

pub const PLUGIN_OP: &str = "EfficientNMS_TRT";
pub const NODE_NAME: &str = "batched_nms";

pub const NUM_DETECTIONS: &str = "num_detections";
pub const DETECTION_BOXES: &str = "detection_boxes";
pub const DETECTION_SCORES: &str = "detection_scores";
pub const DETECTION_CLASSES: &str = "detection_classes";

#[derive(Debug, Clone, Copy, PartialEq, new)]
pub struct NmsParams {
    pub score_threshold: f32,
    pub iou_threshold: f32,
    pub max_detections: usize,
}

impl Default for NmsParams {
    fn default() -> NmsParams {
        NmsParams::new(0.25, 0.45, 100)
    }
}

impl NmsParams {
    /// Plugin attributes, in the order TensorRT documents them.
    pub fn attributes(&self) -> Vec<(String, Attribute)> {
        vec![
            ("plugin_version".into(), Attribute::String("1".into())),
            // no background class
            ("background_class".into(), Attribute::Int(-1)),
            ("max_output_boxes".into(), Attribute::Int(self.max_detections as i64)),
            ("score_threshold".into(), Attribute::Float(self.score_threshold)),
            ("iou_threshold".into(), Attribute::Float(self.iou_threshold)),
            // scores are already sigmoid-ed
            ("score_activation".into(), Attribute::Int(0)),
            ("box_coding".into(), Attribute::Int(0)),
        ]
    }

    /// The four plugin outputs for a given batch size and box dtype.
    pub fn outputs(&self, batch: usize, dtype: DatumType) -> [Variable; 4] {
        let k = self.max_detections;
        [
            Variable::typed(NUM_DETECTIONS, DatumType::I32, shape(&[batch, 1])),
            Variable::typed(DETECTION_BOXES, dtype, shape(&[batch, k, 4])),
            Variable::typed(DETECTION_SCORES, dtype, shape(&[batch, k])),
            Variable::typed(DETECTION_CLASSES, DatumType::I32, shape(&[batch, k])),
        ]
    }
}

/// Append the NMS node reading `boxes` and `scores`. Returns the node and
/// its four outputs.
pub fn wire_nms(
    graph: &mut Graph,
    params: &NmsParams,
    boxes: VarId,
    scores: VarId,
    batch: usize,
    dtype: DatumType,
) -> TractResult<(NodeId, Vec<VarId>)> {
    let outputs: Vec<VarId> =
        params.outputs(batch, dtype).into_iter().map(|v| graph.add_variable(v)).collect();
    let node =
        graph.add_node(NODE_NAME, PLUGIN_OP, &[boxes, scores], &outputs, params.attributes())?;
    Ok((node, outputs))
}

/// `{plugin_version: "1", background_class: -1, ...}`
pub fn describe(attrs: &[(String, Attribute)]) -> String {
    format!("{{{}}}", attrs.iter().map(|(k, v)| format!("{k}: {v}")).join(", "))
}
