use thiserror::Error;

/// Errors raised by axis, geometry and map operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MapError {
    #[error("Invalid axis '{name}': {reason}")]
    InvalidAxis { name: String, reason: String },

    #[error("Axis '{0}' not found in geometry")]
    AxisNotFound(String),

    #[error("Shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Geometries are not aligned: {0}")]
    NotAligned(String),

    #[error("Factor {factor} does not divide {what} of size {size}")]
    NotDivisible {
        factor: usize,
        what: String,
        size: usize,
    },

    #[error("Operation requires a WCS geometry: {0}")]
    RequiresWcs(String),

    #[error("Cutout at ({lon:.3}, {lat:.3}) does not overlap the map")]
    NoOverlap { lon: f64, lat: f64 },

    #[error("Index {index} out of range for axis '{axis}' with {nbin} bins")]
    IndexOutOfRange {
        axis: String,
        index: usize,
        nbin: usize,
    },

    #[error("Interpolation failed: {0}")]
    Interpolation(#[from] crate::interpolate::InterpolationError),
}
