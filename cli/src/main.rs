#[macro_use]
extern crate log;

use std::path::PathBuf;
use std::process;

use anyhow::{Context, bail};
use clap::{Arg, ArgMatches, Command, crate_version};
use ppyoloe_surgeon::prelude::*;

fn main() {
    let matches = Command::new("ppyoloe-export")
        .version(crate_version!())
        .about("Export a PaddleDetection PP-YOLOE model to ONNX, with a TensorRT EfficientNMS tail")
        .arg(
            Arg::new("model-dir")
                .long("model-dir")
                .takes_value(true)
                .required(true)
                .help("Directory holding the exported PaddleDetection model"),
        )
        .arg(
            Arg::new("model-filename")
                .long("model-filename")
                .takes_value(true)
                .default_value("model.pdmodel")
                .help("Model file name inside the model directory"),
        )
        .arg(
            Arg::new("params-filename")
                .long("params-filename")
                .takes_value(true)
                .default_value("model.pdiparams")
                .help("Parameters file name inside the model directory"),
        )
        .arg(
            Arg::new("onnx-path")
                .long("onnx-path")
                .takes_value(true)
                .help("Where to write the intermediate ONNX model [default: <output>.tmp.onnx]"),
        )
        .arg(
            Arg::new("output")
                .short('o')
                .long("output")
                .takes_value(true)
                .required(true)
                .help("Where to write the final ONNX model"),
        )
        .arg(
            Arg::new("opset")
                .long("opset")
                .takes_value(true)
                .default_value("11")
                .help("ONNX opset version"),
        )
        .arg(
            Arg::new("batch-size")
                .long("batch-size")
                .takes_value(true)
                .default_value("1")
                .help("Static batch size"),
        )
        .arg(
            Arg::new("img-size")
                .long("img-size")
                .takes_value(true)
                .multiple_values(true)
                .min_values(1)
                .max_values(2)
                .default_value("640")
                .help("Input size, as H W or a single value for square images"),
        )
        .arg(Arg::new("half").long("half").help("Export f16 weights and outputs"))
        .arg(Arg::new("simplify").long("simplify").help("Simplify the final model with onnxsim"))
        .arg(
            Arg::new("score-thresh")
                .long("score-thresh")
                .takes_value(true)
                .default_value("0.25")
                .help("Boxes scoring lower are dropped by NMS"),
        )
        .arg(
            Arg::new("iou-thresh")
                .long("iou-thresh")
                .takes_value(true)
                .default_value("0.45")
                .help("IoU above which NMS drops the lower scoring box"),
        )
        .arg(
            Arg::new("max-detections")
                .long("max-detections")
                .takes_value(true)
                .default_value("100")
                .help("Detections kept per image"),
        )
        .arg(
            Arg::new("verbosity")
                .short('v')
                .multiple_occurrences(true)
                .help("Sets the level of verbosity."),
        )
        .get_matches();

    let level = match matches.occurrences_of("verbosity") {
        0 => "warn,ppyoloe_export=info,ppyoloe_surgeon=info",
        1 => "info,ppyoloe_export=debug,ppyoloe_surgeon=debug",
        2 => "debug,ppyoloe_export=trace,ppyoloe_surgeon=trace",
        _ => "trace",
    };
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default());
    if std::env::var("RUST_LOG").is_err() {
        builder.parse_filters(level);
    }
    builder.init();

    if let Err(e) = handle(&matches) {
        error!("{e:?}");
        process::exit(1)
    }
}

fn required<'a>(matches: &'a ArgMatches, name: &str) -> TractResult<&'a str> {
    matches.value_of(name).with_context(|| format!("Missing --{name}"))
}

fn options(matches: &ArgMatches) -> TractResult<SurgeonOptions> {
    let sizes: Vec<usize> = matches.values_of_t("img-size")?;
    let image_size = match sizes[..] {
        [s] => (s, s),
        [h, w] => (h, w),
        _ => bail!("--img-size takes one or two values, got {:?}", sizes),
    };
    Ok(SurgeonOptions {
        opset: matches.value_of_t("opset")?,
        batch_size: matches.value_of_t("batch-size")?,
        image_size,
        half: matches.is_present("half"),
        simplify: matches.is_present("simplify"),
    })
}

fn handle(matches: &ArgMatches) -> TractResult<()> {
    let model_dir = PathBuf::from(required(matches, "model-dir")?);
    let output = PathBuf::from(required(matches, "output")?);
    let onnx_path = matches
        .value_of("onnx-path")
        .map(PathBuf::from)
        .unwrap_or_else(|| output.with_extension("tmp.onnx"));
    let nms = NmsParams::new(
        matches.value_of_t("score-thresh")?,
        matches.value_of_t("iou-thresh")?,
        matches.value_of_t("max-detections")?,
    );

    let mut surgeon = GraphSurgeon::new(
        &model_dir,
        &onnx_path,
        required(matches, "model-filename")?,
        required(matches, "params-filename")?,
        options(matches)?,
    )?;
    surgeon.register_nms(nms)?;
    surgeon.save(&output)?;
    debug!("{surgeon}");
    Ok(())
}
