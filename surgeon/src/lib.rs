#[macro_use]
extern crate derive_new;
#[macro_use]
extern crate log;

pub mod convert;
pub mod errors;
pub mod fold;
pub mod graph;
pub mod infer;
pub mod logger;
pub mod nms;
pub mod outcome;
pub mod pattern;
pub mod proto;
pub mod simplify;
pub mod surgeon;

pub use tract_onnx::pb;

pub use self::surgeon::{Collaborators, GraphSurgeon, SurgeonOptions};

pub mod prelude {
    pub use crate::errors::SurgeryError;
    pub use crate::graph::{Attribute, Dim, Graph, Node, NodeId, VarId, Variable};
    pub use crate::nms::NmsParams;
    pub use crate::outcome::BestEffort;
    pub use crate::surgeon::{Collaborators, GraphSurgeon, SurgeonOptions};
    pub use tract_hir::prelude::{DatumType, TractResult};
}

#[cfg(test)]
fn setup_test_logger() {
    let _ = env_logger::Builder::from_env("SURGEON_LOG").try_init();
}
