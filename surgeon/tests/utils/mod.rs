#![allow(dead_code)]
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use ppyoloe_surgeon::convert::{ConvertOptions, ModelConverter};
use ppyoloe_surgeon::fold::ConstantFolder;
use ppyoloe_surgeon::infer::ShapeInference;
use ppyoloe_surgeon::logger::RecordingLogger;
use ppyoloe_surgeon::pb;
use ppyoloe_surgeon::prelude::*;
use ppyoloe_surgeon::proto::write_model;
use ppyoloe_surgeon::simplify::Simplifier;
use tract_hir::prelude::{Tensor, tensor1};

pub fn setup_test_logger() {
    let _ = env_logger::Builder::from_env("SURGEON_LOG").try_init();
}

/// Strides of the three PP-YOLOE feature levels.
pub const STRIDES: [usize; 3] = [8, 16, 32];

pub fn anchor_count(h: usize, w: usize) -> usize {
    STRIDES.iter().map(|s| (h / s) * (w / s)).sum()
}

fn ints(name: &str, v: &[i64]) -> (String, Attribute) {
    (name.to_string(), Attribute::Ints(v.to_vec()))
}

/// A small stand-in for a converted PP-YOLOE model, with the same tail:
/// `classes` class channels pooled at three strides, reshaped and
/// concatenated, and boxes going through `Mul` by the stride tensor then
/// `Div` by the scale factor.
///
/// `stride_anchors` sets the first dimension of the stride tensor, pass
/// `None` for a consistent model.
pub fn ppyoloe_tail(batch: usize, hw: (usize, usize), stride_anchors: Option<usize>) -> Graph {
    tail(batch, hw, stride_anchors, false)
}

/// Same tail, but the class head reshape targets are computed at runtime
/// from `Shape`, `Gather` and `Concat`, as paddle2onnx emits them.
pub fn ppyoloe_tail_from_shapes(batch: usize, hw: (usize, usize)) -> Graph {
    tail(batch, hw, None, true)
}

fn shape_target(g: &mut Graph, s: usize, act: VarId, n: i64) -> VarId {
    let dims = g
        .wire_node(format!("dims{s}"), "Shape", &[act], &[format!("dims{s}.out").as_str()], vec![])
        .unwrap()[0];
    let idx = g.add_constant(format!("lead{s}.idx"), tensor1(&[0i64, 1]));
    let lead = g
        .wire_node(
            format!("lead{s}"),
            "Gather",
            &[dims, idx],
            &[format!("lead{s}.out").as_str()],
            vec![("axis".into(), Attribute::Int(0))],
        )
        .unwrap()[0];
    let len = g.add_constant(format!("len{s}"), tensor1(&[n]));
    g.wire_node(
        format!("target{s}"),
        "Concat",
        &[lead, len],
        &[format!("target{s}.out").as_str()],
        vec![("axis".into(), Attribute::Int(0))],
    )
    .unwrap()[0]
}

fn tail(
    batch: usize,
    (h, w): (usize, usize),
    stride_anchors: Option<usize>,
    shape_targets: bool,
) -> Graph {
    let classes = 3i64;
    let b = batch as i64;
    let mut g = Graph::default();
    let image = g.add_source("image", DatumType::F32, vec![
        Dim::from(batch),
        Dim::from(3usize),
        Dim::from(h),
        Dim::from(w),
    ]);
    let scale =
        g.add_source("scale_factor", DatumType::F32, vec![Dim::from(batch), Dim::from(2usize)]);

    let mut levels = vec![];
    for s in STRIDES {
        let k = s as i64;
        let pooled = g
            .wire_node(
                format!("pool{s}"),
                "AveragePool",
                &[image],
                &[format!("pool{s}.out").as_str()],
                vec![ints("kernel_shape", &[k, k]), ints("strides", &[k, k])],
            )
            .unwrap()[0];
        let act = g
            .wire_node(
                format!("sigmoid{s}"),
                "Sigmoid",
                &[pooled],
                &[format!("sigmoid{s}.out").as_str()],
                vec![],
            )
            .unwrap()[0];
        let n = ((h / s) * (w / s)) as i64;
        let target = if shape_targets {
            shape_target(&mut g, s, act, n)
        } else {
            g.add_constant(format!("shape{s}"), tensor1(&[b, classes, n]))
        };
        let reshaped = g
            .wire_node(
                format!("reshape{s}"),
                "Reshape",
                &[act, target],
                &[format!("reshape{s}.out").as_str()],
                vec![],
            )
            .unwrap()[0];
        levels.push(reshaped);
    }
    let cls = g
        .wire_node("concat_cls", "Concat", &levels, &["cls"], vec![(
            "axis".into(),
            Attribute::Int(2),
        )])
        .unwrap()[0];

    let anchors = anchor_count(h, w);
    let feat = g
        .wire_node("transpose_cls", "Transpose", &[cls], &["feat"], vec![ints("perm", &[0, 2, 1])])
        .unwrap()[0];
    let proj = g.add_constant("proj", Tensor::zero::<f32>(&[3, 4]).unwrap());
    let reg = g.wire_node("matmul_reg", "MatMul", &[feat, proj], &["reg"], vec![]).unwrap()[0];
    let stride = g.add_constant(
        "stride_tensor",
        Tensor::zero::<f32>(&[stride_anchors.unwrap_or(anchors), 1]).unwrap(),
    );
    let boxes = g.wire_node("mul_stride", "Mul", &[reg, stride], &["boxes"], vec![]).unwrap()[0];
    let scale2 = g
        .wire_node("concat_scale", "Concat", &[scale, scale], &["scale2"], vec![(
            "axis".into(),
            Attribute::Int(1),
        )])
        .unwrap()[0];
    let scale_shape = g.add_constant("scale_shape", tensor1(&[b, 1, 4]));
    let scale3 = g
        .wire_node("reshape_scale", "Reshape", &[scale2, scale_shape], &["scale3"], vec![])
        .unwrap()[0];
    let scaled = g.wire_node("div_scale", "Div", &[boxes, scale3], &["scaled"], vec![]).unwrap()[0];
    g.set_outputs(&[scaled, cls]);
    g
}

/// Writes `graph` where the real converter would write the ONNX file.
#[derive(Debug, Clone)]
pub struct StubConverter {
    pub graph: Graph,
    pub calls: Arc<AtomicUsize>,
    pub seen: Arc<Mutex<Vec<ConvertOptions>>>,
}

impl StubConverter {
    pub fn new(graph: Graph) -> StubConverter {
        StubConverter { graph, calls: Arc::default(), seen: Arc::default() }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ModelConverter for StubConverter {
    fn convert(
        &self,
        _model_file: &Path,
        _params_file: &Path,
        save_file: &Path,
        options: &ConvertOptions,
    ) -> TractResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(options.clone());
        write_model(&self.graph.to_proto()?, save_file)
    }
}

#[derive(Debug, Clone)]
pub struct StubSimplifier(pub BestEffort<pb::ModelProto>);

impl Simplifier for StubSimplifier {
    fn simplify(&self, _model: &pb::ModelProto) -> BestEffort<pb::ModelProto> {
        self.0.clone()
    }
}

#[derive(Debug)]
pub struct FailingInference(pub &'static str);

impl ShapeInference for FailingInference {
    fn infer_shapes(&self, _graph: &Graph) -> BestEffort<Graph> {
        BestEffort::SkippedWithWarning(self.0.to_string())
    }
}

/// Keeps adding dead nodes, so the graph never looks converged.
#[derive(Debug, Default)]
pub struct RestlessFolder {
    pub calls: Arc<AtomicUsize>,
}

impl ConstantFolder for RestlessFolder {
    fn fold(&self, graph: &mut Graph, fold_shapes: bool) -> TractResult<usize> {
        if !fold_shapes {
            return Ok(0);
        }
        let round = self.calls.fetch_add(1, Ordering::SeqCst);
        let input = graph.inputs[0];
        for i in 0..=round {
            let name = format!("dead.{round}.{i}");
            graph.wire_node(name.clone(), "Relu", &[input], &[name.as_str()], vec![])?;
        }
        Ok(0)
    }
}

/// Fails every fold, or only shape folds when `shapes_only` is set.
#[derive(Debug, Default)]
pub struct BrokenFolder {
    pub shapes_only: bool,
}

impl ConstantFolder for BrokenFolder {
    fn fold(&self, _graph: &mut Graph, fold_shapes: bool) -> TractResult<usize> {
        if self.shapes_only && !fold_shapes {
            return Ok(0);
        }
        anyhow::bail!("folding blew up")
    }
}

pub fn recording(logger: &Arc<RecordingLogger>) -> Collaborators {
    Collaborators { logger: Box::new(logger.clone()), ..Collaborators::default() }
}
