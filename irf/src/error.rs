use skymaps::{InterpolationError, MapError};
use thiserror::Error;

/// Errors raised by IRF maps.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum IrfError {
    #[error(transparent)]
    Map(#[from] MapError),

    #[error(transparent)]
    Interpolation(#[from] InterpolationError),

    #[error("Missing exposure map for {0}.stack")]
    MissingExposure(String),

    #[error("{kind} requires axis '{axis}'")]
    MissingAxis { kind: String, axis: String },

    #[error("{0}: IRF map and exposure map spatial grids differ")]
    GeometryMismatch(String),

    #[error("Position ({lon:.3}, {lat:.3}) is outside the IRF map")]
    PositionOutside { lon: f64, lat: f64 },

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
}
