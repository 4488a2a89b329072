use std::path::PathBuf;

use thiserror::Error;

use crate::parameter::Parameter;
use crate::xcorr::XcorrTerm;

/// Errors raised by the inversion engine.
#[derive(Debug, Error)]
pub enum InversionError {
    #[error("there is no {parameter} in a {equation} inversion")]
    UnsupportedParameter {
        parameter: Parameter,
        equation: String,
    },
    #[error("{0} is not inverted for in the current workflow stage")]
    InactiveParameter(Parameter),
    #[error("correlation {term} is not allocated for the active parameter set")]
    UnsupportedXcorr { term: XcorrTerm },
    #[error("wavefield component {component} does not exist in a {equation} wavefield")]
    UnsupportedComponent { component: String, equation: String },
    #[error("invalid taper edges: {0}")]
    InvalidTaperEdges(String),
    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: (usize, usize),
        actual: (usize, usize),
    },
    #[error("infinite or NaN value in adjoint wavefield, model written to {}", dump.display())]
    NonFiniteWavefield { dump: PathBuf },
    #[error("wavefield record has no snapshot {index} (record holds {len})")]
    MissingSnapshot { index: usize, len: usize },
    #[error("breakLoopType {0} is not supported (expected 0, 1 or 2)")]
    UnsupportedBreakLoopType(i64),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("plotting failed: {0}")]
    Plot(String),
}

pub type Result<T> = std::result::Result<T, InversionError>;
