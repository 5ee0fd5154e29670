//! Optional graph simplification with `onnxsim`.
use std::fmt::Debug;
use std::path::PathBuf;
use std::process::Command;

use anyhow::{Context, bail};
use tract_hir::prelude::TractResult;

use crate::outcome::BestEffort;
use crate::pb;
use crate::proto::{read_model, write_model};

pub trait Simplifier: Debug {
    /// Simplified copy of `model`, or the reason the result can not be
    /// trusted.
    fn simplify(&self, model: &pb::ModelProto) -> BestEffort<pb::ModelProto>;
}

/// Runs the `onnxsim` command line tool on a scratch copy of the model.
///
/// A run whose output reports a failed check is treated as a skip, even if
/// the tool wrote a model.
#[derive(Debug, Clone)]
pub struct OnnxSim {
    pub program: PathBuf,
}

impl Default for OnnxSim {
    fn default() -> OnnxSim {
        OnnxSim { program: std::env::var_os("ONNXSIM").unwrap_or_else(|| "onnxsim".into()).into() }
    }
}

impl OnnxSim {
    fn try_simplify(&self, model: &pb::ModelProto) -> TractResult<pb::ModelProto> {
        let dir = tempfile::tempdir()?;
        let input = dir.path().join("input.onnx");
        let output = dir.path().join("simplified.onnx");
        write_model(model, &input)?;
        let run = crate::convert::run(Command::new(&self.program).arg(&input).arg(&output))
            .context("Running onnxsim")?;
        let stdout = String::from_utf8_lossy(&run.stdout);
        if stdout.contains("Check failed") {
            bail!("assert check failed, keeping the original model")
        }
        read_model(&output)
    }
}

impl Simplifier for OnnxSim {
    fn simplify(&self, model: &pb::ModelProto) -> BestEffort<pb::ModelProto> {
        BestEffort::from_result(self.try_simplify(model))
    }
}
