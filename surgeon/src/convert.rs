//! Paddle to ONNX conversion, through the `paddle2onnx` tooling.
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, ensure};
use itertools::Itertools;
use tract_hir::prelude::TractResult;

#[derive(Debug, Clone, PartialEq, new)]
pub struct ConvertOptions {
    pub opset: i64,
    /// Export weights as f16.
    pub half: bool,
    /// Static shapes to pin, by input name.
    pub input_shapes: Vec<(String, Vec<i64>)>,
    #[new(value = "true")]
    pub auto_upgrade_opset: bool,
    #[new(value = "true")]
    pub enable_onnx_checker: bool,
}

impl ConvertOptions {
    /// Shapes in the python dict syntax paddle2onnx expects:
    /// `{'image':[1,3,640,640],'scale_factor':[1,2]}`.
    pub fn input_shape_dict(&self) -> String {
        let mut entries = self
            .input_shapes
            .iter()
            .map(|(name, shape)| format!("'{}':[{}]", name, shape.iter().join(",")));
        format!("{{{}}}", entries.join(","))
    }
}

pub trait ModelConverter: Debug {
    /// Write to `save_file` the ONNX translation of the model, with the
    /// input shapes of `options` made static.
    fn convert(
        &self,
        model_file: &Path,
        params_file: &Path,
        save_file: &Path,
        options: &ConvertOptions,
    ) -> TractResult<()>;
}

/// Runs the `paddle2onnx` executable, then its python optimizer to pin the
/// input shapes.
#[derive(Debug, Clone)]
pub struct PaddleConverter {
    pub program: PathBuf,
    pub python: PathBuf,
}

impl Default for PaddleConverter {
    fn default() -> PaddleConverter {
        PaddleConverter {
            program: std::env::var_os("PADDLE2ONNX").unwrap_or_else(|| "paddle2onnx".into()).into(),
            python: std::env::var_os("PYTHON").unwrap_or_else(|| "python3".into()).into(),
        }
    }
}

fn flag(b: bool) -> &'static str {
    if b { "True" } else { "False" }
}

fn file_name(p: &Path) -> TractResult<&std::ffi::OsStr> {
    p.file_name().with_context(|| format!("{} is not a file path", p.display()))
}

/// Run `command` to completion, failing with its stderr if it does not succeed.
pub(crate) fn run(command: &mut Command) -> TractResult<Output> {
    debug!("Running {command:?}");
    let output = command.output().with_context(|| format!("Spawning {command:?}"))?;
    ensure!(
        output.status.success(),
        "{:?} failed ({}):\n{}",
        command.get_program(),
        output.status,
        String::from_utf8_lossy(&output.stderr)
    );
    Ok(output)
}

impl ModelConverter for PaddleConverter {
    fn convert(
        &self,
        model_file: &Path,
        params_file: &Path,
        save_file: &Path,
        options: &ConvertOptions,
    ) -> TractResult<()> {
        let model_dir = model_file.parent().unwrap_or(Path::new("."));
        run(Command::new(&self.program)
            .arg("--model_dir")
            .arg(model_dir)
            .arg("--model_filename")
            .arg(file_name(model_file)?)
            .arg("--params_filename")
            .arg(file_name(params_file)?)
            .arg("--save_file")
            .arg(save_file)
            .arg("--opset_version")
            .arg(options.opset.to_string())
            .arg("--export_fp16_model")
            .arg(flag(options.half))
            .arg("--enable_auto_update_opset")
            .arg(flag(options.auto_upgrade_opset))
            .arg("--enable_onnx_checker")
            .arg(flag(options.enable_onnx_checker)))
        .context("Converting paddle model to ONNX")?;
        if options.input_shapes.is_empty() {
            return Ok(());
        }
        run(Command::new(&self.python)
            .args(["-m", "paddle2onnx.optimize"])
            .arg("--input_model")
            .arg(save_file)
            .arg("--output_model")
            .arg(save_file)
            .arg("--input_shape_dict")
            .arg(options.input_shape_dict()))
        .context("Pinning static input shapes")?;
        Ok(())
    }
}
