//! Evaluation settings carried by every dataset.
//!
//! Stored as JSON next to analysis outputs so a fit can be reproduced with the
//! same caching and convolution settings.

use serde::{Deserialize, Serialize};

/// How the model evaluators choose the region they compute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvaluationMode {
    /// Evaluate each model on a cutout around its position.
    Local,
    /// Evaluate each model on the full dataset geometry.
    Global,
}

/// Settings for computing predicted counts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationConfig {
    /// Reuse the last predicted counts while model parameters are unchanged
    pub use_npred_cache: bool,
    pub evaluation_mode: EvaluationMode,
    /// PSF kernel radius in degrees; `None` uses the tabulated PSF extent
    pub psf_max_radius: Option<f64>,
    /// Oversampling factor used to build PSF kernels
    pub psf_upsample_factor: usize,
    /// Run the PSF convolution on the rayon thread pool
    pub convolve_parallel: bool,
}

impl Default for EvaluationConfig {
    /// Cached local evaluation with a 4x oversampled PSF kernel
    fn default() -> Self {
        Self {
            use_npred_cache: true,
            evaluation_mode: EvaluationMode::Local,
            psf_max_radius: None,
            psf_upsample_factor: irf::DEFAULT_KERNEL_FACTOR,
            convolve_parallel: true,
        }
    }
}

impl EvaluationConfig {
    /// Save configuration to a JSON file
    pub fn save_to_file(&self, path: &std::path::Path) -> Result<(), std::io::Error> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, json)
    }

    /// Load configuration from a JSON file
    pub fn load_from_file(path: &std::path::Path) -> Result<Self, std::io::Error> {
        let json = std::fs::read_to_string(path)?;
        serde_json::from_str(&json).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Same settings with the npred cache switched off.
    pub fn without_cache(mut self) -> Self {
        self.use_npred_cache = false;
        self
    }
}
