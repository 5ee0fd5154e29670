use std::fmt;
use std::path::Path;

use anyhow::{Context, bail, ensure};
use tract_hir::prelude::{DatumType, TractResult};

use crate::convert::{ConvertOptions, ModelConverter, PaddleConverter};
use crate::errors::SurgeryError;
use crate::fold::{ConstantFolder, TractFolder};
use crate::graph::{Attribute, Graph, Variable, shape};
use crate::infer::{ShapeInference, TractShapeInference};
use crate::logger::{LogLogger, SurgeonLogger};
use crate::nms::{self, NmsParams, PLUGIN_OP};
use crate::pattern::{self, PostprocessAnchors};
use crate::proto;
use crate::simplify::{OnnxSim, Simplifier};

/// Stabilization stops after this many rounds, converged or not.
pub const MAX_STABILIZE_ITERATIONS: usize = 2;

#[derive(Debug, Clone, PartialEq)]
pub struct SurgeonOptions {
    pub opset: i64,
    pub batch_size: usize,
    /// (height, width)
    pub image_size: (usize, usize),
    /// Export f16 weights and outputs.
    pub half: bool,
    /// Run the simplifier before saving.
    pub simplify: bool,
}

impl Default for SurgeonOptions {
    fn default() -> SurgeonOptions {
        SurgeonOptions {
            opset: 11,
            batch_size: 1,
            image_size: (640, 640),
            half: false,
            simplify: false,
        }
    }
}

impl SurgeonOptions {
    /// Static shapes of the two inputs of an exported PP-YOLOE model.
    pub fn input_shapes(&self) -> Vec<(String, Vec<i64>)> {
        let b = self.batch_size as i64;
        let (h, w) = (self.image_size.0 as i64, self.image_size.1 as i64);
        vec![("image".to_string(), vec![b, 3, h, w]), ("scale_factor".to_string(), vec![b, 2])]
    }

    /// Reject sizes no model can be pinned to.
    pub fn validate(&self) -> TractResult<()> {
        if self.batch_size == 0 {
            return Err(SurgeryError::configuration("Batch size must be at least 1").into());
        }
        let (h, w) = self.image_size;
        if h == 0 || w == 0 {
            let msg = format!("Invalid image size {h}x{w}");
            return Err(SurgeryError::configuration(msg).into());
        }
        Ok(())
    }
}

/// External tools the surgeon delegates to.
#[derive(Debug)]
pub struct Collaborators {
    pub converter: Box<dyn ModelConverter>,
    pub shape_inference: Box<dyn ShapeInference>,
    pub folder: Box<dyn ConstantFolder>,
    pub simplifier: Box<dyn Simplifier>,
    pub logger: Box<dyn SurgeonLogger>,
}

impl Default for Collaborators {
    fn default() -> Collaborators {
        Collaborators {
            converter: Box::<PaddleConverter>::default(),
            shape_inference: Box::new(TractShapeInference),
            folder: Box::new(TractFolder),
            simplifier: Box::<OnnxSim>::default(),
            logger: Box::<LogLogger>::default(),
        }
    }
}

/// Owns a converted PP-YOLOE graph and rewrites its tail for TensorRT.
#[derive(Debug)]
pub struct GraphSurgeon {
    graph: Graph,
    options: SurgeonOptions,
    collaborators: Collaborators,
}

fn check_file(path: &Path, what: &str) -> TractResult<()> {
    if !path.is_file() {
        let msg = format!("Missing {what}: {}", path.display());
        return Err(SurgeryError::configuration(msg).into());
    }
    Ok(())
}

impl GraphSurgeon {
    /// Convert `model_dir/model_filename` (with its parameters) to ONNX at
    /// `onnx_path` and load it.
    pub fn new(
        model_dir: impl AsRef<Path>,
        onnx_path: impl AsRef<Path>,
        model_filename: &str,
        params_filename: &str,
        options: SurgeonOptions,
    ) -> TractResult<GraphSurgeon> {
        Self::new_with(
            model_dir,
            onnx_path,
            model_filename,
            params_filename,
            options,
            Collaborators::default(),
        )
    }

    pub fn new_with(
        model_dir: impl AsRef<Path>,
        onnx_path: impl AsRef<Path>,
        model_filename: &str,
        params_filename: &str,
        options: SurgeonOptions,
        collaborators: Collaborators,
    ) -> TractResult<GraphSurgeon> {
        let model_dir = model_dir.as_ref();
        let onnx_path = onnx_path.as_ref();
        options.validate()?;
        if !model_dir.is_dir() {
            return Err(SurgeryError::configuration(format!(
                "Invalid model directory: {}",
                model_dir.display()
            ))
            .into());
        }
        let model_file = model_dir.join(model_filename);
        let params_file = model_dir.join(params_filename);
        check_file(&model_file, "model file")?;
        check_file(&params_file, "parameters file")?;

        let convert = ConvertOptions::new(options.opset, options.half, options.input_shapes());
        collaborators
            .converter
            .convert(&model_file, &params_file, onnx_path, &convert)
            .with_context(|| format!("Converting {}", model_file.display()))?;
        Self::from_onnx_with(onnx_path, options, collaborators)
    }

    /// Load an already converted model.
    pub fn from_onnx(
        onnx_path: impl AsRef<Path>,
        options: SurgeonOptions,
    ) -> TractResult<GraphSurgeon> {
        Self::from_onnx_with(onnx_path, options, Collaborators::default())
    }

    pub fn from_onnx_with(
        onnx_path: impl AsRef<Path>,
        options: SurgeonOptions,
        collaborators: Collaborators,
    ) -> TractResult<GraphSurgeon> {
        let onnx_path = onnx_path.as_ref();
        let graph = proto::load(onnx_path)?;
        ensure!(!graph.nodes.is_empty(), "No graph in {}", onnx_path.display());
        Self::from_graph_with(graph, options, collaborators)
    }

    pub fn from_graph(graph: Graph, options: SurgeonOptions) -> TractResult<GraphSurgeon> {
        Self::from_graph_with(graph, options, Collaborators::default())
    }

    pub fn from_graph_with(
        graph: Graph,
        options: SurgeonOptions,
        collaborators: Collaborators,
    ) -> TractResult<GraphSurgeon> {
        options.validate()?;
        let mut surgeon = GraphSurgeon { graph, options, collaborators };
        surgeon.fold(false)?;
        Ok(surgeon)
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut Graph {
        &mut self.graph
    }

    pub fn into_graph(self) -> Graph {
        self.graph
    }

    pub fn options(&self) -> &SurgeonOptions {
        &self.options
    }

    fn fold(&mut self, fold_shapes: bool) -> TractResult<()> {
        let removed = self
            .collaborators
            .folder
            .fold(&mut self.graph, fold_shapes)
            .with_context(|| format!("Folding constants (fold_shapes: {fold_shapes})"))?;
        trace!("Constant folding removed {removed} nodes");
        Ok(())
    }

    /// Clean, sort, infer shapes and fold constants until the node count
    /// stops moving, at most `MAX_STABILIZE_ITERATIONS` times.
    pub fn stabilize(&mut self) -> TractResult<()> {
        for iteration in 0..MAX_STABILIZE_ITERATIONS {
            let before = self.graph.nodes.len();
            self.graph.cleanup()?.toposort()?;

            let mut cleared = self.graph.clone();
            cleared.clear_intermediate_shapes();
            let logger = &self.collaborators.logger;
            self.graph = self
                .collaborators
                .shape_inference
                .infer_shapes(&cleared)
                .or_keep(std::mem::take(&mut self.graph), |reason| {
                    logger.info(&format!(
                        "Shape inference could not be performed at this time:\n{reason}"
                    ))
                });

            if !self.collaborators.folder.supports_shape_folding() {
                self.collaborators.logger.error(
                    "This constant folder does not support folding shapes, \
                     please upgrade it or provide one that does.",
                );
                return Err(SurgeryError::Capability("constant folding of shapes".into()).into());
            }
            self.fold(true)?;

            let after = self.graph.nodes.len();
            debug!("stabilize round {iteration}: {before} -> {after} nodes");
            if before == after {
                break;
            }
        }
        Ok(())
    }

    /// Expose transposed class scores next to the boxes: inputs become
    /// `[images]`, outputs `[boxes, scores]`.
    pub fn apply_score_transpose(&mut self, dtype: DatumType) -> TractResult<PostprocessAnchors> {
        let anchors = pattern::locate_anchors(&self.graph)?;
        let scores_shape = shape(&anchors.scores_shape(self.options.batch_size)[..]);
        let scores = self.graph.add_variable(Variable::typed("scores", dtype, scores_shape));
        let class_scores = anchors.class_scores(&self.graph);
        self.graph.add_node(
            "last.Transpose",
            "Transpose",
            &[class_scores],
            &[scores],
            vec![("perm".into(), Attribute::Ints(vec![0, 2, 1]))],
        )?;

        let Some(&image) = self.graph.inputs.first() else {
            bail!(SurgeryError::mismatch("Graph has no input."))
        };
        self.graph.variable_mut(image).name = "images".into();
        self.graph.set_inputs(&[image]);
        let boxes = anchors.boxes(&self.graph);
        self.graph.set_outputs(&[boxes, scores]);
        Ok(anchors)
    }

    /// Append the `EfficientNMS_TRT` plugin and make its four outputs the
    /// graph outputs.
    pub fn register_nms(&mut self, params: NmsParams) -> TractResult<()> {
        self.stabilize()?;
        let dtype = pattern::score_type(self.options.half);
        self.apply_score_transpose(dtype)?;

        let &[boxes, scores] = &self.graph.outputs[..] else {
            bail!("Expected boxes and scores outputs, got {:?}", self.graph.output_names())
        };
        let attrs = params.attributes();
        let (_, outputs) =
            nms::wire_nms(&mut self.graph, &params, boxes, scores, self.options.batch_size, dtype)?;
        self.collaborators.logger.info(&format!(
            "Created NMS plugin '{PLUGIN_OP}' with attributes: {}",
            nms::describe(&attrs)
        ));
        self.graph.set_outputs(&outputs);
        self.stabilize()
    }

    /// Write the graph to `output_path`, simplified if asked and possible.
    pub fn save(&mut self, output_path: impl AsRef<Path>) -> TractResult<()> {
        let output_path = output_path.as_ref();
        self.graph.cleanup()?.toposort()?;
        let model = self.graph.to_proto()?;
        let model = if self.options.simplify {
            let logger = &self.collaborators.logger;
            self.collaborators
                .simplifier
                .simplify(&model)
                .or_keep(model, |reason| logger.info(&format!("Simplifier failure: {reason}")))
        } else {
            model
        };
        proto::write_model(&model, output_path)?;
        self.collaborators.logger.info(&format!("Saved ONNX model to {}", output_path.display()));
        Ok(())
    }
}

impl fmt::Display for GraphSurgeon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.graph)
    }
}
