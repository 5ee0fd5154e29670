mod utils;

use std::sync::Arc;

use ppyoloe_surgeon::logger::RecordingLogger;
use ppyoloe_surgeon::prelude::*;

use crate::utils::*;

fn model_dir() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("model.pdmodel"), b"program").unwrap();
    std::fs::write(dir.path().join("model.pdiparams"), b"weights").unwrap();
    dir
}

fn construct(
    model_dir: &std::path::Path,
    onnx: &std::path::Path,
    converter: &StubConverter,
) -> TractResult<GraphSurgeon> {
    let logger = Arc::new(RecordingLogger::default());
    let collaborators =
        Collaborators { converter: Box::new(converter.clone()), ..recording(&logger) };
    GraphSurgeon::new_with(
        model_dir,
        onnx,
        "model.pdmodel",
        "model.pdiparams",
        SurgeonOptions::default(),
        collaborators,
    )
}

fn is_configuration(e: &anyhow::Error) -> bool {
    matches!(e.downcast_ref::<SurgeryError>(), Some(SurgeryError::Configuration(_)))
}

#[test]
fn missing_directory() {
    setup_test_logger();
    let work = tempfile::tempdir().unwrap();
    let onnx = work.path().join("tmp.onnx");
    let converter = StubConverter::new(ppyoloe_tail(1, (64, 64), None));
    let err = construct(&work.path().join("nope"), &onnx, &converter).unwrap_err();
    assert!(is_configuration(&err), "{err:?}");
    assert_eq!(converter.calls(), 0);
    assert!(!onnx.exists());
}

#[test]
fn directory_is_a_file() {
    let work = tempfile::tempdir().unwrap();
    let file = work.path().join("model");
    std::fs::write(&file, b"").unwrap();
    let onnx = work.path().join("tmp.onnx");
    let converter = StubConverter::new(ppyoloe_tail(1, (64, 64), None));
    let err = construct(&file, &onnx, &converter).unwrap_err();
    assert!(is_configuration(&err));
    assert!(!onnx.exists());
}

#[test]
fn missing_model_files() {
    let dir = tempfile::tempdir().unwrap();
    let onnx = dir.path().join("tmp.onnx");
    let converter = StubConverter::new(ppyoloe_tail(1, (64, 64), None));
    let err = construct(dir.path(), &onnx, &converter).unwrap_err();
    assert!(is_configuration(&err));
    assert!(err.to_string().contains("model.pdmodel"));

    std::fs::write(dir.path().join("model.pdmodel"), b"program").unwrap();
    let err = construct(dir.path(), &onnx, &converter).unwrap_err();
    assert!(is_configuration(&err));
    assert!(err.to_string().contains("model.pdiparams"));

    assert_eq!(converter.calls(), 0);
    assert!(!onnx.exists());
}

#[test]
fn converts_with_pinned_shapes() {
    let dir = model_dir();
    let onnx = dir.path().join("tmp.onnx");
    let converter = StubConverter::new(ppyoloe_tail(1, (64, 64), None));
    let surgeon = construct(dir.path(), &onnx, &converter).unwrap();
    assert_eq!(converter.calls(), 1);
    assert!(onnx.exists());
    let seen = converter.seen.lock().unwrap();
    assert_eq!(seen[0].opset, 11);
    assert!(!seen[0].half);
    assert!(seen[0].auto_upgrade_opset && seen[0].enable_onnx_checker);
    assert_eq!(
        seen[0].input_shapes,
        vec![("image".to_string(), vec![1, 3, 640, 640]), ("scale_factor".to_string(), vec![1, 2])]
    );
    assert_eq!(surgeon.graph().input_names(), vec!["image", "scale_factor"]);
    assert!(!surgeon.graph().nodes.is_empty());
}

#[test]
fn empty_conversion_is_refused() {
    let dir = model_dir();
    let onnx = dir.path().join("tmp.onnx");
    let converter = StubConverter::new(Graph::default());
    assert!(construct(dir.path(), &onnx, &converter).is_err());
}

#[test]
fn invalid_options_are_refused() {
    let dir = model_dir();
    let onnx = dir.path().join("tmp.onnx");
    let converter = StubConverter::new(ppyoloe_tail(1, (64, 64), None));
    let logger = Arc::new(RecordingLogger::default());
    let collaborators =
        Collaborators { converter: Box::new(converter.clone()), ..recording(&logger) };
    let err = GraphSurgeon::new_with(
        dir.path(),
        &onnx,
        "model.pdmodel",
        "model.pdiparams",
        SurgeonOptions { batch_size: 0, ..Default::default() },
        collaborators,
    )
    .unwrap_err();
    assert!(is_configuration(&err), "{err:?}");
    assert_eq!(converter.calls(), 0);
}
