use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use anyhow::{bail, ensure};
use itertools::Itertools;
use tract_hir::prelude::{DatumType, Tensor, TractResult};

use crate::pb;

mod order;

/// Index of a node in `Graph::nodes`.
///
/// Handles stay valid until the next pass that removes or reorders nodes
/// (`cleanup`, `toposort`, constant folding).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

/// Index of a variable in `Graph::variables`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VarId(pub usize);

/// One tensor dimension.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Dim {
    Value(i64),
    Param(String),
    Unknown,
}

impl Dim {
    pub fn to_i64(&self) -> Option<i64> {
        match self {
            Dim::Value(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<i64> for Dim {
    fn from(v: i64) -> Dim {
        Dim::Value(v)
    }
}

impl From<usize> for Dim {
    fn from(v: usize) -> Dim {
        Dim::Value(v as i64)
    }
}

impl fmt::Display for Dim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dim::Value(v) => write!(f, "{v}"),
            Dim::Param(p) => write!(f, "{p}"),
            Dim::Unknown => write!(f, "?"),
        }
    }
}

/// Shape helper: `shape(&[1, 3, 640, 640])`.
pub fn shape<D: Copy + Into<Dim>>(dims: &[D]) -> Vec<Dim> {
    dims.iter().map(|&d| d.into()).collect()
}

/// A node attribute value.
#[derive(Clone, Debug, PartialEq)]
pub enum Attribute {
    Int(i64),
    Float(f32),
    String(String),
    Ints(Vec<i64>),
    Floats(Vec<f32>),
    Strings(Vec<String>),
    Tensor(Arc<Tensor>),
    /// Anything else (subgraphs, type protos...), carried through untouched.
    Proto(pb::AttributeProto),
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Attribute::Int(i) => write!(f, "{i}"),
            Attribute::Float(x) => write!(f, "{x}"),
            Attribute::String(s) => write!(f, "{s:?}"),
            Attribute::Ints(v) => write!(f, "[{}]", v.iter().join(", ")),
            Attribute::Floats(v) => write!(f, "[{}]", v.iter().join(", ")),
            Attribute::Strings(v) => {
                write!(f, "[{}]", v.iter().map(|s| format!("{s:?}")).join(", "))
            }
            Attribute::Tensor(t) => write!(f, "{t:?}"),
            Attribute::Proto(p) => write!(f, "<{}>", p.name),
        }
    }
}

/// A named tensor slot.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Variable {
    pub name: String,
    pub datum_type: Option<DatumType>,
    pub shape: Option<Vec<Dim>>,
    /// Set for initializers and folded constants.
    pub value: Option<Arc<Tensor>>,
}

impl Variable {
    pub fn typed(name: impl Into<String>, datum_type: DatumType, shape: Vec<Dim>) -> Variable {
        Variable {
            name: name.into(),
            datum_type: Some(datum_type),
            shape: Some(shape),
            value: None,
        }
    }

    pub fn untyped(name: impl Into<String>) -> Variable {
        Variable { name: name.into(), ..Variable::default() }
    }

    pub fn constant(name: impl Into<String>, value: Arc<Tensor>) -> Variable {
        let shape = value.shape().iter().map(|&d| Dim::from(d)).collect();
        Variable {
            name: name.into(),
            datum_type: Some(value.datum_type()),
            shape: Some(shape),
            value: Some(value),
        }
    }

    pub fn is_constant(&self) -> bool {
        self.value.is_some()
    }

    /// Placeholder for an omitted optional node input or output.
    pub fn is_empty(&self) -> bool {
        self.name.is_empty() && self.value.is_none()
    }

    /// Turn the variable into a constant holding `value`.
    pub fn set_value(&mut self, value: Arc<Tensor>) {
        self.datum_type = Some(value.datum_type());
        self.shape = Some(value.shape().iter().map(|&d| Dim::from(d)).collect());
        self.value = Some(value);
    }
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        match &self.shape {
            Some(shape) => write!(f, " [{}]", shape.iter().join(","))?,
            None => write!(f, " [..]")?,
        }
        match self.datum_type {
            Some(dt) => write!(f, " {dt:?}"),
            None => write!(f, " ?"),
        }
    }
}

/// An operator instance.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Node {
    pub name: String,
    pub op_type: String,
    pub domain: String,
    pub inputs: Vec<VarId>,
    pub outputs: Vec<VarId>,
    pub attrs: Vec<(String, Attribute)>,
}

impl Node {
    pub fn attr(&self, name: &str) -> Option<&Attribute> {
        self.attrs.iter().find(|(n, _)| n == name).map(|(_, a)| a)
    }
}

pub const DEFAULT_IR_VERSION: i64 = 7;
pub const DEFAULT_OPSET: i64 = 11;

/// Model-level properties carried from import to export.
#[derive(Clone, Debug, PartialEq)]
pub struct ModelMeta {
    pub ir_version: i64,
    pub opset_import: Vec<pb::OperatorSetIdProto>,
    pub producer_name: String,
    pub producer_version: String,
    pub domain: String,
    pub model_version: i64,
    pub doc_string: String,
    pub metadata_props: Vec<pb::StringStringEntryProto>,
    pub graph_name: String,
}

impl Default for ModelMeta {
    fn default() -> ModelMeta {
        ModelMeta {
            ir_version: DEFAULT_IR_VERSION,
            opset_import: vec![pb::OperatorSetIdProto {
                domain: String::new(),
                version: DEFAULT_OPSET,
            }],
            producer_name: env!("CARGO_PKG_NAME").to_string(),
            producer_version: env!("CARGO_PKG_VERSION").to_string(),
            domain: String::new(),
            model_version: 0,
            doc_string: String::new(),
            metadata_props: vec![],
            graph_name: "main".to_string(),
        }
    }
}

impl ModelMeta {
    /// Version of the default ("" or "ai.onnx") opset, if declared.
    pub fn opset_version(&self) -> Option<i64> {
        self.opset_import
            .iter()
            .find(|o| o.domain.is_empty() || o.domain == "ai.onnx")
            .map(|o| o.version)
    }
}

/// Owned, mutable computation graph.
///
/// Nodes and variables live in two arenas; nodes refer to variables by
/// `VarId`. Node order is meaningful: after `toposort` it is an execution
/// order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Graph {
    pub nodes: Vec<Node>,
    pub variables: Vec<Variable>,
    pub inputs: Vec<VarId>,
    pub outputs: Vec<VarId>,
    pub meta: ModelMeta,
}

impl Graph {
    pub fn add_variable(&mut self, variable: Variable) -> VarId {
        self.variables.push(variable);
        VarId(self.variables.len() - 1)
    }

    /// Add a typed graph input.
    pub fn add_source(
        &mut self,
        name: impl Into<String>,
        datum_type: DatumType,
        shape: Vec<Dim>,
    ) -> VarId {
        let id = self.add_variable(Variable::typed(name, datum_type, shape));
        self.inputs.push(id);
        id
    }

    pub fn add_constant(
        &mut self,
        name: impl Into<String>,
        value: impl Into<Arc<Tensor>>,
    ) -> VarId {
        self.add_variable(Variable::constant(name, value.into()))
    }

    /// Append a node reading `inputs` and writing the existing `outputs`.
    pub fn add_node(
        &mut self,
        name: impl Into<String>,
        op_type: impl Into<String>,
        inputs: &[VarId],
        outputs: &[VarId],
        attrs: Vec<(String, Attribute)>,
    ) -> TractResult<NodeId> {
        let name = name.into();
        for v in inputs.iter().chain(outputs.iter()) {
            ensure!(v.0 < self.variables.len(), "Node {name} refers to unknown variable {:?}", v);
        }
        let producers = self.producers();
        for o in outputs {
            if let Some(p) = producers.get(o) {
                bail!(
                    "Variable {} is already produced by {}, can not be an output of {}",
                    self.variables[o.0].name,
                    self.nodes[p.0].name,
                    name
                );
            }
            if self.variables[o.0].is_constant() {
                bail!("Constant {} can not be an output of {}", self.variables[o.0].name, name);
            }
        }
        self.nodes.push(Node {
            name,
            op_type: op_type.into(),
            domain: String::new(),
            inputs: inputs.to_vec(),
            outputs: outputs.to_vec(),
            attrs,
        });
        Ok(NodeId(self.nodes.len() - 1))
    }

    /// Append a node, creating fresh untyped variables for its outputs.
    pub fn wire_node(
        &mut self,
        name: impl Into<String>,
        op_type: impl Into<String>,
        inputs: &[VarId],
        outputs: &[&str],
        attrs: Vec<(String, Attribute)>,
    ) -> TractResult<Vec<VarId>> {
        let outputs: Vec<VarId> =
            outputs.iter().map(|o| self.add_variable(Variable::untyped(*o))).collect();
        self.add_node(name, op_type, inputs, &outputs, attrs)?;
        Ok(outputs)
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0]
    }

    pub fn variable(&self, id: VarId) -> &Variable {
        &self.variables[id.0]
    }

    pub fn variable_mut(&mut self, id: VarId) -> &mut Variable {
        &mut self.variables[id.0]
    }

    pub fn var_id(&self, name: &str) -> Option<VarId> {
        self.variables.iter().position(|v| v.name == name).map(VarId)
    }

    pub fn node_id(&self, name: &str) -> Option<NodeId> {
        self.nodes.iter().position(|n| n.name == name).map(NodeId)
    }

    /// Map every node output to the node producing it.
    pub fn producers(&self) -> HashMap<VarId, NodeId> {
        let mut map = HashMap::new();
        for (ix, node) in self.nodes.iter().enumerate() {
            for &o in &node.outputs {
                map.insert(o, NodeId(ix));
            }
        }
        map
    }

    pub fn producer(&self, var: VarId) -> Option<NodeId> {
        self.nodes.iter().position(|n| n.outputs.contains(&var)).map(NodeId)
    }

    /// Nodes reading `var`, in node order.
    pub fn consumers(&self, var: VarId) -> Vec<NodeId> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.inputs.contains(&var))
            .map(|(ix, _)| NodeId(ix))
            .collect()
    }

    pub fn input_variables(&self) -> impl Iterator<Item = &Variable> {
        self.inputs.iter().map(move |&i| &self.variables[i.0])
    }

    pub fn output_variables(&self) -> impl Iterator<Item = &Variable> {
        self.outputs.iter().map(move |&o| &self.variables[o.0])
    }

    pub fn input_names(&self) -> Vec<&str> {
        self.input_variables().map(|v| &*v.name).collect()
    }

    pub fn output_names(&self) -> Vec<&str> {
        self.output_variables().map(|v| &*v.name).collect()
    }

    pub fn set_inputs(&mut self, inputs: &[VarId]) {
        self.inputs = inputs.to_vec();
    }

    pub fn set_outputs(&mut self, outputs: &[VarId]) {
        self.outputs = outputs.to_vec();
    }

    /// Forget the shape of every node output, graph outputs excepted.
    pub fn clear_intermediate_shapes(&mut self) {
        let outputs = self.outputs.clone();
        for node in &self.nodes {
            for o in &node.outputs {
                if !outputs.contains(o) {
                    self.variables[o.0].shape = None;
                }
            }
        }
    }
}

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "graph {:?}: {} nodes", self.meta.graph_name, self.nodes.len())?;
        for input in self.input_variables() {
            writeln!(f, "  input  {input}")?;
        }
        for output in self.output_variables() {
            writeln!(f, "  output {output}")?;
        }
        Ok(())
    }
}
