//! Shape inference, delegated to tract's inference analyser.
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use anyhow::Context;
use tract_hir::internal::*;
use tract_onnx::model::ParseResult;

use crate::graph::{Dim, Graph};
use crate::outcome::BestEffort;

pub trait ShapeInference: Debug {
    /// Return a copy of `graph` with the type and shape of its variables
    /// filled in wherever they can be inferred.
    fn infer_shapes(&self, graph: &Graph) -> BestEffort<Graph>;
}

/// A graph as tract sees it after running its analyser.
pub(crate) struct Analysis {
    model: InferenceModel,
    outlets_by_name: HashMap<String, OutletId>,
}

impl Analysis {
    pub fn run(graph: &Graph) -> TractResult<Analysis> {
        let proto = graph.to_proto()?;
        let ParseResult { mut model, outlets_by_name, unresolved_inputs } =
            tract_onnx::onnx().parse(&proto, None).context("Loading graph in tract")?;
        if !unresolved_inputs.is_empty() {
            debug!("Unresolved inputs: {:?}", unresolved_inputs);
        }
        // unknown ops (plugins) only stop the analysis locally
        if let Err(e) = model.analyse(true) {
            debug!("Analyse incomplete: {e:?}");
        }
        Ok(Analysis { model, outlets_by_name })
    }

    pub fn fact(&self, name: &str) -> Option<&InferenceFact> {
        let outlet = self.outlets_by_name.get(name)?;
        self.model.outlet_fact(*outlet).ok()
    }

    /// Concrete value of `name`. Shape-derived values come out of tract as
    /// `TDim`, they are turned into `i64` (and dropped if still symbolic).
    pub fn value(&self, name: &str) -> Option<Arc<Tensor>> {
        let value = self.fact(name)?.value.concretize()?;
        if value.datum_type() != DatumType::TDim {
            return Some(value);
        }
        match value.cast_to::<i64>() {
            Ok(v) => Some(v.into_owned().into_arc_tensor()),
            Err(e) => {
                trace!("Keeping {name} symbolic: {e}");
                None
            }
        }
    }

    /// Element type of `name`, as ONNX can express it.
    pub fn datum_type(&self, name: &str) -> Option<DatumType> {
        self.fact(name)?.datum_type.concretize().map(onnx_datum_type)
    }
}

/// tract types shapes and everything computed from them as `TDim`, ONNX
/// carries them as `int64`.
pub fn onnx_datum_type(dt: DatumType) -> DatumType {
    if dt == DatumType::TDim { DatumType::I64 } else { dt }
}

fn shape_from_fact(fact: &InferenceFact) -> Option<Vec<Dim>> {
    if fact.shape.is_open() {
        return None;
    }
    Some(
        fact.shape
            .dims()
            .map(|d| match d.concretize() {
                Some(d) => match d.to_i64() {
                    Ok(v) => Dim::Value(v),
                    Err(_) => Dim::Param(d.to_string()),
                },
                None => Dim::Unknown,
            })
            .collect(),
    )
}

#[derive(Debug, Clone, Default)]
pub struct TractShapeInference;

impl TractShapeInference {
    fn try_infer(&self, graph: &Graph) -> TractResult<Graph> {
        let analysis = Analysis::run(graph)?;
        let mut inferred = graph.clone();
        let mut filled = 0;
        for var in inferred.variables.iter_mut() {
            if var.is_constant() || var.name.is_empty() {
                continue;
            }
            let Some(fact) = analysis.fact(&var.name) else { continue };
            if var.datum_type.is_none() {
                var.datum_type = analysis.datum_type(&var.name);
            }
            if var.shape.is_none() {
                var.shape = shape_from_fact(fact);
                filled += var.shape.is_some() as usize;
            }
        }
        trace!("Inferred {filled} shapes");
        Ok(inferred)
    }
}

impl ShapeInference for TractShapeInference {
    fn infer_shapes(&self, graph: &Graph) -> BestEffort<Graph> {
        BestEffort::from_result(self.try_infer(graph))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Attribute, shape};

    #[test]
    fn infers_through_transpose() {
        let mut g = Graph::default();
        let x = g.add_source("x", DatumType::F32, shape(&[1usize, 80, 8400]));
        let y = g
            .wire_node("t", "Transpose", &[x], &["y"], vec![(
                "perm".into(),
                Attribute::Ints(vec![0, 2, 1]),
            )])
            .unwrap()[0];
        let z = g.wire_node("r", "Relu", &[y], &["z"], vec![]).unwrap()[0];
        g.set_outputs(&[z]);
        let inferred = TractShapeInference.infer_shapes(&g).ok().unwrap();
        assert_eq!(inferred.variable(y).shape, Some(shape(&[1usize, 8400, 80])));
        assert_eq!(inferred.variable(y).datum_type, Some(DatumType::F32));
        assert_eq!(inferred.variable(z).shape, Some(shape(&[1usize, 8400, 80])));
    }

    #[test]
    fn unknown_ops_do_not_stop_inference() {
        let mut g = Graph::default();
        let x = g.add_source("x", DatumType::F32, shape(&[2usize, 3]));
        let y = g.wire_node("r", "Relu", &[x], &["y"], vec![]).unwrap()[0];
        let z = g.wire_node("p", "SomeVendorPlugin", &[y], &["z"], vec![]).unwrap()[0];
        g.set_outputs(&[z]);
        let inferred = TractShapeInference.infer_shapes(&g).ok().unwrap();
        assert_eq!(inferred.variable(y).shape, Some(shape(&[2usize, 3])));
        assert_eq!(inferred.variable(z).shape, None);
    }

    #[test]
    fn shape_values_are_int64() {
        let mut g = Graph::default();
        let x = g.add_source("x", DatumType::F32, shape(&[2usize, 3]));
        let s = g.wire_node("shape", "Shape", &[x], &["s"], vec![]).unwrap()[0];
        let y = g.wire_node("r", "Reshape", &[x, s], &["y"], vec![]).unwrap()[0];
        g.set_outputs(&[y]);
        let inferred = TractShapeInference.infer_shapes(&g).ok().unwrap();
        assert_eq!(inferred.variable(s).datum_type, Some(DatumType::I64));
        assert_eq!(inferred.variable(s).shape, Some(shape(&[2usize])));
        assert!(inferred.to_proto().is_ok());
        let analysis = Analysis::run(&g).unwrap();
        assert_eq!(analysis.value("s").unwrap().datum_type(), DatumType::I64);
    }
}
