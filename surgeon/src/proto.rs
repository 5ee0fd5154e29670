//! Bridge between the ONNX protobuf messages and `Graph`.
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, bail};
use prost::Message;
use tract_hir::tract_ndarray::Array;
use tract_hir::prelude::{DatumType, Tensor, TractResult};

use crate::graph::{Attribute, Dim, Graph, ModelMeta, Node, VarId, Variable};
use crate::pb;
use crate::pb::attribute_proto::AttributeType;
use crate::pb::tensor_proto::DataType;
use crate::pb::tensor_shape_proto::dimension;

pub fn datum_type_from_proto(elem_type: i32) -> TractResult<DatumType> {
    let dt = DataType::from_i32(elem_type)
        .with_context(|| format!("Invalid ONNX data type {elem_type}"))?;
    Ok(match dt {
        DataType::Bool => DatumType::Bool,
        DataType::Uint8 => DatumType::U8,
        DataType::Uint16 => DatumType::U16,
        DataType::Uint32 => DatumType::U32,
        DataType::Uint64 => DatumType::U64,
        DataType::Int8 => DatumType::I8,
        DataType::Int16 => DatumType::I16,
        DataType::Int32 => DatumType::I32,
        DataType::Int64 => DatumType::I64,
        DataType::Float16 => DatumType::F16,
        DataType::Float => DatumType::F32,
        DataType::Double => DatumType::F64,
        DataType::String => DatumType::String,
        _ => bail!("Unsupported ONNX data type {:?}", dt),
    })
}

pub fn datum_type_to_proto(dt: DatumType) -> TractResult<DataType> {
    Ok(match dt {
        DatumType::Bool => DataType::Bool,
        DatumType::U8 => DataType::Uint8,
        DatumType::U16 => DataType::Uint16,
        DatumType::U32 => DataType::Uint32,
        DatumType::U64 => DataType::Uint64,
        DatumType::I8 => DataType::Int8,
        DatumType::I16 => DataType::Int16,
        DatumType::I32 => DataType::Int32,
        DatumType::I64 => DataType::Int64,
        DatumType::F16 => DataType::Float16,
        DatumType::F32 => DataType::Float,
        DatumType::F64 => DataType::Double,
        DatumType::String => DataType::String,
        _ => bail!("{:?} has no ONNX counterpart", dt),
    })
}

pub fn tensor_from_proto(t: &pb::TensorProto) -> TractResult<Tensor> {
    let dt = datum_type_from_proto(t.data_type)?;
    let shape: Vec<usize> = t.dims.iter().map(|&d| d as usize).collect();
    if !t.external_data.is_empty() {
        bail!("Tensor {} stores its data externally, which is not supported", t.name)
    }
    if !t.raw_data.is_empty() {
        return unsafe { Tensor::from_raw_dt(dt, &shape, &t.raw_data) };
    }
    let tensor: Tensor = match dt {
        DatumType::Bool => {
            Array::from_shape_vec(&*shape, t.int32_data.iter().map(|&x| x != 0).collect())?.into()
        }
        DatumType::U8 => {
            Array::from_shape_vec(&*shape, t.int32_data.iter().map(|&x| x as u8).collect())?.into()
        }
        DatumType::U16 => {
            Array::from_shape_vec(&*shape, t.int32_data.iter().map(|&x| x as u16).collect())?
                .into()
        }
        DatumType::I8 => {
            Array::from_shape_vec(&*shape, t.int32_data.iter().map(|&x| x as i8).collect())?.into()
        }
        DatumType::I16 => {
            Array::from_shape_vec(&*shape, t.int32_data.iter().map(|&x| x as i16).collect())?
                .into()
        }
        DatumType::I32 => Array::from_shape_vec(&*shape, t.int32_data.clone())?.into(),
        DatumType::U32 => {
            Array::from_shape_vec(&*shape, t.uint64_data.iter().map(|&x| x as u32).collect())?
                .into()
        }
        DatumType::U64 => Array::from_shape_vec(&*shape, t.uint64_data.clone())?.into(),
        DatumType::I64 => Array::from_shape_vec(&*shape, t.int64_data.clone())?.into(),
        DatumType::F32 => Array::from_shape_vec(&*shape, t.float_data.clone())?.into(),
        DatumType::F64 => Array::from_shape_vec(&*shape, t.double_data.clone())?.into(),
        DatumType::F16 => {
            // float16 payloads travel bit-cast in int32_data
            let bits: Vec<u8> =
                t.int32_data.iter().flat_map(|&x| (x as u16).to_le_bytes()).collect();
            unsafe { Tensor::from_raw_dt(DatumType::F16, &shape, &bits)? }
        }
        DatumType::String => {
            let strings = t
                .string_data
                .iter()
                .cloned()
                .map(String::from_utf8)
                .collect::<Result<Vec<String>, _>>()
                .context("Invalid UTF8 buffer")?;
            Array::from_shape_vec(&*shape, strings)?.into()
        }
        _ => bail!("Can not load {:?} tensor {}", dt, t.name),
    };
    Ok(tensor)
}

pub fn tensor_to_proto(name: &str, tensor: &Tensor) -> TractResult<pb::TensorProto> {
    let data_type = datum_type_to_proto(tensor.datum_type())?;
    let mut proto = pb::TensorProto {
        name: name.to_string(),
        dims: tensor.shape().iter().map(|&d| d as i64).collect(),
        data_type: data_type as i32,
        ..pb::TensorProto::default()
    };
    if tensor.datum_type() == DatumType::String {
        proto.string_data =
            tensor.as_slice::<String>()?.iter().map(|s| s.as_bytes().to_vec()).collect();
    } else {
        #[allow(unused_unsafe)]
        let bytes = unsafe { tensor.as_bytes() };
        proto.raw_data = bytes.to_vec();
    }
    Ok(proto)
}

fn shape_from_proto(shape: &pb::TensorShapeProto) -> Vec<Dim> {
    shape
        .dim
        .iter()
        .map(|d| match &d.value {
            Some(dimension::Value::DimValue(v)) if *v >= 0 => Dim::Value(*v),
            Some(dimension::Value::DimParam(p)) if !p.is_empty() => Dim::Param(p.clone()),
            _ => Dim::Unknown,
        })
        .collect()
}

fn value_info_type(vi: &pb::ValueInfoProto) -> TractResult<(Option<DatumType>, Option<Vec<Dim>>)> {
    match vi.r#type.as_ref().and_then(|t| t.value.as_ref()) {
        Some(pb::type_proto::Value::TensorType(t)) => {
            let dt =
                if t.elem_type == 0 { None } else { Some(datum_type_from_proto(t.elem_type)?) };
            Ok((dt, t.shape.as_ref().map(shape_from_proto)))
        }
        _ => Ok((None, None)),
    }
}

fn value_info(var: &Variable) -> TractResult<pb::ValueInfoProto> {
    let Some(datum_type) = var.datum_type else {
        return Ok(pb::ValueInfoProto { name: var.name.clone(), ..Default::default() });
    };
    let elem_type = datum_type_to_proto(datum_type)? as i32;
    let shape = var.shape.as_ref().map(|shape| pb::TensorShapeProto {
        dim: shape
            .iter()
            .map(|d| pb::tensor_shape_proto::Dimension {
                value: match d {
                    Dim::Value(v) => Some(dimension::Value::DimValue(*v)),
                    Dim::Param(p) => Some(dimension::Value::DimParam(p.clone())),
                    Dim::Unknown => None,
                },
                ..Default::default()
            })
            .collect(),
    });
    Ok(pb::ValueInfoProto {
        name: var.name.clone(),
        r#type: Some(pb::TypeProto {
            value: Some(pb::type_proto::Value::TensorType(pb::type_proto::Tensor {
                elem_type,
                shape,
            })),
            ..Default::default()
        }),
        ..Default::default()
    })
}

pub fn attribute_from_proto(attr: &pb::AttributeProto) -> TractResult<(String, Attribute)> {
    let value = match AttributeType::from_i32(attr.r#type) {
        Some(AttributeType::Int) => Attribute::Int(attr.i),
        Some(AttributeType::Float) => Attribute::Float(attr.f),
        Some(AttributeType::String) => Attribute::String(
            String::from_utf8(attr.s.clone())
                .with_context(|| format!("Attribute {} is not UTF8", attr.name))?,
        ),
        Some(AttributeType::Ints) => Attribute::Ints(attr.ints.clone()),
        Some(AttributeType::Floats) => Attribute::Floats(attr.floats.clone()),
        Some(AttributeType::Strings) => Attribute::Strings(
            attr.strings
                .iter()
                .map(|s| String::from_utf8(s.clone()))
                .collect::<Result<_, _>>()
                .with_context(|| format!("Attribute {} is not UTF8", attr.name))?,
        ),
        Some(AttributeType::Tensor) => match &attr.t {
            Some(t) => Attribute::Tensor(Arc::new(tensor_from_proto(t)?)),
            None => Attribute::Proto(attr.clone()),
        },
        _ => Attribute::Proto(attr.clone()),
    };
    Ok((attr.name.clone(), value))
}

pub fn attribute_to_proto(name: &str, attr: &Attribute) -> TractResult<pb::AttributeProto> {
    let mut proto = pb::AttributeProto { name: name.to_string(), ..pb::AttributeProto::default() };
    let ty = match attr {
        Attribute::Int(i) => {
            proto.i = *i;
            AttributeType::Int
        }
        Attribute::Float(f) => {
            proto.f = *f;
            AttributeType::Float
        }
        Attribute::String(s) => {
            proto.s = s.as_bytes().to_vec();
            AttributeType::String
        }
        Attribute::Ints(v) => {
            proto.ints = v.clone();
            AttributeType::Ints
        }
        Attribute::Floats(v) => {
            proto.floats = v.clone();
            AttributeType::Floats
        }
        Attribute::Strings(v) => {
            proto.strings = v.iter().map(|s| s.as_bytes().to_vec()).collect();
            AttributeType::Strings
        }
        Attribute::Tensor(t) => {
            proto.t = Some(tensor_to_proto("", t)?);
            AttributeType::Tensor
        }
        Attribute::Proto(p) => {
            let mut p = p.clone();
            p.name = name.to_string();
            return Ok(p);
        }
    };
    proto.r#type = ty as i32;
    Ok(proto)
}

/// Name resolution while importing: one variable per tensor name.
struct Importer<'a> {
    by_name: HashMap<String, VarId>,
    value_infos: HashMap<&'a str, &'a pb::ValueInfoProto>,
}

impl Importer<'_> {
    fn var(&mut self, graph: &mut Graph, name: &str) -> TractResult<VarId> {
        if name.is_empty() {
            return Ok(graph.add_variable(Variable::default()));
        }
        if let Some(id) = self.by_name.get(name) {
            return Ok(*id);
        }
        let mut var = Variable::untyped(name);
        if let Some(vi) = self.value_infos.get(name) {
            (var.datum_type, var.shape) = value_info_type(vi)?;
        }
        let id = graph.add_variable(var);
        self.by_name.insert(name.to_string(), id);
        Ok(id)
    }
}

impl Graph {
    pub fn from_proto(proto: &pb::ModelProto) -> TractResult<Graph> {
        let gp = proto.graph.as_ref().context("Model has no graph")?;
        let mut graph = Graph {
            meta: ModelMeta {
                ir_version: proto.ir_version,
                opset_import: proto.opset_import.clone(),
                producer_name: proto.producer_name.clone(),
                producer_version: proto.producer_version.clone(),
                domain: proto.domain.clone(),
                model_version: proto.model_version,
                doc_string: proto.doc_string.clone(),
                metadata_props: proto.metadata_props.clone(),
                graph_name: gp.name.clone(),
            },
            ..Graph::default()
        };
        let mut importer = Importer {
            by_name: HashMap::new(),
            value_infos: gp.value_info.iter().map(|vi| (&*vi.name, vi)).collect(),
        };
        for init in &gp.initializer {
            let tensor = tensor_from_proto(init)
                .with_context(|| format!("Loading initializer {}", init.name))?;
            let id = graph.add_constant(init.name.clone(), tensor);
            importer.by_name.insert(init.name.clone(), id);
        }
        for input in &gp.input {
            if importer.by_name.contains_key(&input.name) {
                trace!("Input {} is an initializer", input.name);
                continue;
            }
            let (datum_type, shape) = value_info_type(input)?;
            let id = graph.add_variable(Variable {
                name: input.name.clone(),
                datum_type,
                shape,
                value: None,
            });
            importer.by_name.insert(input.name.clone(), id);
            graph.inputs.push(id);
        }
        for pbnode in &gp.node {
            let inputs = pbnode
                .input
                .iter()
                .map(|i| importer.var(&mut graph, i))
                .collect::<TractResult<Vec<_>>>()?;
            let outputs = pbnode
                .output
                .iter()
                .map(|o| importer.var(&mut graph, o))
                .collect::<TractResult<Vec<_>>>()?;
            let attrs = pbnode
                .attribute
                .iter()
                .map(attribute_from_proto)
                .collect::<TractResult<Vec<_>>>()
                .with_context(|| format!("Reading attributes of node {}", pbnode.name))?;
            graph.nodes.push(Node {
                name: pbnode.name.clone(),
                op_type: pbnode.op_type.clone(),
                domain: pbnode.domain.clone(),
                inputs,
                outputs,
                attrs,
            });
        }
        for output in &gp.output {
            let id = importer.var(&mut graph, &output.name)?;
            let (datum_type, shape) = value_info_type(output)?;
            let var = graph.variable_mut(id);
            if datum_type.is_some() {
                var.datum_type = datum_type;
            }
            if shape.is_some() {
                var.shape = shape;
            }
            graph.outputs.push(id);
        }
        debug!(
            "Imported graph {:?}: {} nodes, {} variables",
            gp.name,
            graph.nodes.len(),
            graph.variables.len()
        );
        Ok(graph)
    }

    pub fn to_proto(&self) -> TractResult<pb::ModelProto> {
        let mut referenced = vec![false; self.variables.len()];
        for node in &self.nodes {
            for v in node.inputs.iter().chain(node.outputs.iter()) {
                referenced[v.0] = true;
            }
        }
        for v in &self.outputs {
            referenced[v.0] = true;
        }
        let mut initializer = vec![];
        let mut value_infos = vec![];
        for (ix, var) in self.variables.iter().enumerate() {
            if !referenced[ix] || var.is_empty() {
                continue;
            }
            let id = VarId(ix);
            if let Some(value) = &var.value {
                initializer.push(
                    tensor_to_proto(&var.name, value)
                        .with_context(|| format!("Exporting constant {}", var.name))?,
                );
            } else if !self.inputs.contains(&id)
                && !self.outputs.contains(&id)
                && (var.datum_type.is_some() || var.shape.is_some())
            {
                value_infos.push(value_info(var)?);
            }
        }
        let node = self
            .nodes
            .iter()
            .map(|node| -> TractResult<pb::NodeProto> {
                let name_of = |v: &VarId| self.variables[v.0].name.clone();
                Ok(pb::NodeProto {
                    input: node.inputs.iter().map(name_of).collect(),
                    output: node.outputs.iter().map(name_of).collect(),
                    name: node.name.clone(),
                    op_type: node.op_type.clone(),
                    domain: node.domain.clone(),
                    attribute: node
                        .attrs
                        .iter()
                        .map(|(name, attr)| attribute_to_proto(name, attr))
                        .collect::<TractResult<_>>()?,
                    ..Default::default()
                })
            })
            .collect::<TractResult<Vec<_>>>()?;
        let graph = pb::GraphProto {
            node,
            name: self.meta.graph_name.clone(),
            initializer,
            input: self.input_variables().map(value_info).collect::<TractResult<_>>()?,
            output: self.output_variables().map(value_info).collect::<TractResult<_>>()?,
            value_info: value_infos,
            ..pb::GraphProto::default()
        };
        Ok(pb::ModelProto {
            ir_version: self.meta.ir_version,
            opset_import: self.meta.opset_import.clone(),
            producer_name: self.meta.producer_name.clone(),
            producer_version: self.meta.producer_version.clone(),
            domain: self.meta.domain.clone(),
            model_version: self.meta.model_version,
            doc_string: self.meta.doc_string.clone(),
            graph: Some(graph),
            metadata_props: self.meta.metadata_props.clone(),
            ..pb::ModelProto::default()
        })
    }
}

pub fn read_model(path: impl AsRef<Path>) -> TractResult<pb::ModelProto> {
    let path = path.as_ref();
    let bytes = fs_err::read(path)?;
    pb::ModelProto::decode(&*bytes).with_context(|| format!("Decoding ONNX model {path:?}"))
}

pub fn write_model(model: &pb::ModelProto, path: impl AsRef<Path>) -> TractResult<()> {
    fs_err::write(path.as_ref(), model.encode_to_vec())?;
    Ok(())
}

pub fn load(path: impl AsRef<Path>) -> TractResult<Graph> {
    let path = path.as_ref();
    Graph::from_proto(&read_model(path)?).with_context(|| format!("Importing {path:?}"))
}
