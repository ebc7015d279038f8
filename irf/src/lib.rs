//! Instrument response maps.
//!
//! Responses are tabulated on their own, usually coarser, sky grids and carry
//! an exposure map used to weight them when observations are stacked.

pub mod edisp_map;
pub mod error;
pub mod irf_map;
pub mod psf_kernel;
pub mod psf_map;

pub use edisp_map::{default_migra_axis, EDispKernel, EDispKernelMap, EDispMap, EDispMaps};
pub use error::IrfError;
pub use irf_map::IrfMap;
pub use psf_kernel::PsfKernel;
pub use psf_map::{default_rad_axis, power_law_weights, PsfMap, DEFAULT_KERNEL_FACTOR};
