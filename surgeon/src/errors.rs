use std::fmt;

/// Failures the surgeon reports on its own behalf.
///
/// They travel inside the usual `TractResult` error, so callers can recover
/// the category with `err.downcast_ref::<SurgeryError>()`.
#[derive(Debug, Clone, PartialEq)]
pub enum SurgeryError {
    /// Missing model directory or model files, bad option value.
    Configuration(String),
    /// The converted graph does not have the expected PP-YOLOE tail.
    StructuralMismatch(String),
    /// Box and class branches disagree on the anchor count.
    Consistency { tensor: String, expected: i64, found: i64 },
    /// A collaborator lacks a required capability.
    Capability(String),
}

impl SurgeryError {
    pub fn configuration(msg: impl Into<String>) -> SurgeryError {
        SurgeryError::Configuration(msg.into())
    }

    pub fn mismatch(msg: impl Into<String>) -> SurgeryError {
        SurgeryError::StructuralMismatch(msg.into())
    }
}

impl fmt::Display for SurgeryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SurgeryError::Configuration(msg) => write!(f, "Configuration error: {msg}"),
            SurgeryError::StructuralMismatch(msg) => write!(f, "Structural mismatch: {msg}"),
            SurgeryError::Consistency { tensor, expected, found } => write!(
                f,
                "{tensor}.shape[0] must equal the sum of values[2] from the three Concat nodes \
                 (shape[0] is {found}, sum is {expected})"
            ),
            SurgeryError::Capability(msg) => write!(f, "Missing capability: {msg}"),
        }
    }
}

impl std::error::Error for SurgeryError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consistency_names_tensor() {
        let e = SurgeryError::Consistency { tensor: "stride".into(), expected: 8400, found: 100 };
        let msg = e.to_string();
        assert!(msg.starts_with("stride.shape[0]"));
        assert!(msg.contains("8400"));
    }

    #[test]
    fn survives_anyhow_round_trip() {
        let e: anyhow::Error = SurgeryError::mismatch("Mul node not found.").into();
        assert_eq!(
            e.downcast_ref::<SurgeryError>(),
            Some(&SurgeryError::StructuralMismatch("Mul node not found.".into()))
        );
    }
}
