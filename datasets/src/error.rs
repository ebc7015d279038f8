use irf::IrfError;
use skymaps::MapError;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by datasets.
#[derive(Error, Debug)]
pub enum DatasetError {
    #[error(transparent)]
    Map(#[from] MapError),

    #[error(transparent)]
    Irf(#[from] IrfError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to decode dataset file: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Either {0} must be defined")]
    NoReferenceGeometry(&'static str),

    #[error("Dataset '{dataset}' has no '{field}'")]
    MissingField { dataset: String, field: &'static str },

    #[error("Cannot stack incomplete {0}")]
    Stacking(String),

    #[error("Incompatible types for stacking: {0}")]
    IncompatibleTypes(String),

    #[error("Region must be fully contained inside the counts geometry")]
    RegionNotContained,

    #[error("Mask must be spatially uniform within the region for each energy bin")]
    MaskNotUniform,

    #[error("{0} is not supported")]
    Unsupported(String),

    #[error("Containment correction impossible: {0}")]
    ContainmentCorrection(String),

    #[error("Lazy loading is not implemented for {0}, read with lazy = false")]
    LazyReadUnsupported(String),

    #[error("No model named '{0}'")]
    UnknownModel(String),

    #[error("File {0} already exists, pass overwrite = true to replace it")]
    FileExists(PathBuf),

    #[error("HDU '{hdu}' is invalid: {reason}")]
    InvalidHdu { hdu: String, reason: String },
}
