//! Binned likelihood datasets for gamma-ray sky maps.
//!
//! A [`MapDataset`] bundles the role-maps of an observation and predicts
//! counts from sky models folded with exposure, PSF and energy dispersion:
//! - [`dataset`]: the dataset engine (prediction, masks, stacking, region
//!   reduction, simulation, persistence)
//! - [`evaluator`] and [`convolve`]: per-model prediction and PSF convolution
//! - [`models`]: spectral, spatial and FoV background models
//! - [`stats`]: Cash and WStat statistics
//! - [`io`] and [`lazy`]: dataset files and lazily loaded role-maps
//! - [`config`]: evaluation settings

pub mod config;
pub mod convolve;
pub mod dataset;
pub mod error;
pub mod evaluator;
pub mod io;
pub mod lazy;
pub mod models;
pub mod stats;

pub use config::{EvaluationConfig, EvaluationMode};
pub use dataset::{
    create_map_dataset_geoms, Background, CreateOptions, DatasetGeoms, DatasetInfo, EnergyRange,
    MapDataset, MapDatasetBuilder, MapDatasetOnOff, OnOffInfo, ReducibleDataset, ResidualMethod,
};
pub use error::DatasetError;
pub use models::{DatasetModels, FoVBackgroundModel, SkyModel, SpatialModel, SpectralModel};
pub use stats::StatType;
