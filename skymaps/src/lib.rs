//! Sky map geometry and containers.
//!
//! This crate provides the binned data structures used by the IRF and
//! dataset crates:
//! - [`axis`]: named non-spatial axes (energy, rad, migra, labels)
//! - [`geom`]: CAR pixel grids and single-bin region geometries
//! - [`map`]: N-dimensional maps with stacking, resampling and reduction
//! - [`interpolate`]: multi-linear interpolation on scaled grids
//! - [`sampling`]: inverse-CDF sampling
//! - [`gti`] and [`table`]: observation bookkeeping

pub mod axis;
pub mod coord;
pub mod error;
pub mod geom;
pub mod gti;
pub mod interpolate;
pub mod map;
pub mod region;
pub mod sampling;
pub mod table;

pub use axis::{AxisInterp, MapAxes, MapAxis, NodeType};
pub use coord::{Frame, MapCoord, SkyCoord};
pub use error::MapError;
pub use geom::{CutoutSlices, Geom, SpatialGrid};
pub use gti::Gti;
pub use interpolate::{Bounds, InterpolationError, RegularGridInterpolator};
pub use map::{AxisSlice, Map, MaskMap, PadMode, RegionReduce};
pub use region::SkyRegion;
pub use sampling::InverseCdfSampler;
pub use table::{MetaTable, MetaValue};
