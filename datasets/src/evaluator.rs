//! Predicted counts for a single sky model.
//!
//! A [`MapEvaluator`] snapshots the part of a dataset a model needs: exposure,
//! PSF kernel and energy dispersion matrix at the model position, restricted
//! to a cutout around the model when evaluating locally. The snapshot is
//! refreshed when the dataset inputs change or the model leaves its support.

use irf::{EDispKernel, EDispMaps, PsfKernel, PsfMap};
use log::debug;
use ndarray::{Array2, Array3, Axis, Ix3};
use skymaps::{CutoutSlices, Geom, Map, MapAxis, MapError, MaskMap, SkyCoord, SkyRegion};

use crate::config::{EvaluationConfig, EvaluationMode};
use crate::convolve::{convolve2d, ConvolveOptions, EdgeMode};
use crate::error::DatasetError;
use crate::models::{Parameters, SkyModel};

/// Pixels per side of the grid used to fold the PSF into region geometries.
const REGION_PSF_NPIX: usize = 41;

/// Extra pixels added around a model's support when cutting out.
const CUTOUT_MARGIN_PIX: f64 = 3.0;

/// Dataset role-maps a model is evaluated against.
#[derive(Debug, Clone, Copy)]
pub struct EvaluatorInputs<'a> {
    /// Counts geometry
    pub geom: &'a Geom,
    pub exposure: &'a Map,
    pub psf: Option<&'a PsfMap>,
    pub edisp: Option<&'a EDispMaps>,
    pub mask_image: Option<&'a MaskMap>,
}

/// Spatial footprint of the last update.
#[derive(Debug, Clone, PartialEq)]
struct Support {
    position: SkyCoord,
    radius: Option<f64>,
    binsz: f64,
}

/// Region geometry evaluation: fine grid and the mask of the region on it.
#[derive(Debug, Clone)]
struct RegionGrid {
    grid: Geom,
    inside: Array2<bool>,
}

#[derive(Debug, Clone)]
pub struct MapEvaluator {
    model_name: String,
    geom: Option<Geom>,
    exposure: Option<Map>,
    psf_kernel: Option<PsfKernel>,
    psf_precomputed: bool,
    region_grid: Option<RegionGrid>,
    edisp: Option<EDispKernel>,
    contributes: bool,
    revision: Option<u64>,
    support: Option<Support>,
    cache: Option<(Parameters, Map)>,
}

fn ix3(data: ndarray::ArrayD<f64>) -> Result<Array3<f64>, DatasetError> {
    let shape = data.shape().to_vec();
    data.into_dimensionality::<Ix3>().map_err(|_| {
        DatasetError::Map(MapError::ShapeMismatch {
            expected: vec![0, 0, 0],
            actual: shape,
        })
    })
}

/// Position of `target` if it lies on `geom`, else the center of `fallback`.
fn irf_position(geom: &Geom, target: &SkyCoord, fallback: &Geom) -> SkyCoord {
    if geom.is_region() || geom.contains(target) {
        *target
    } else {
        fallback.center_coord()
    }
}

/// Spatial grid of `geom` on the true energy binning of `exposure`.
pub(crate) fn psf_kernel_geom(
    geom: &Geom,
    exposure: Option<&Map>,
) -> Result<Geom, DatasetError> {
    match exposure.map(|m| m.geom().axis("energy_true")) {
        Some(Ok(axis)) => Ok(geom.to_image().to_cube(vec![axis.clone()])?),
        _ => Ok(geom.clone()),
    }
}

impl MapEvaluator {
    pub fn new(model_name: &str) -> Self {
        Self {
            model_name: model_name.to_string(),
            geom: None,
            exposure: None,
            psf_kernel: None,
            psf_precomputed: false,
            region_grid: None,
            edisp: None,
            contributes: false,
            revision: None,
            support: None,
            cache: None,
        }
    }

    /// Evaluator reusing `kernel` on every update instead of rebuilding it.
    pub fn with_precomputed_psf(model_name: &str, kernel: PsfKernel) -> Self {
        let mut evaluator = Self::new(model_name);
        evaluator.psf_kernel = Some(kernel);
        evaluator.psf_precomputed = true;
        evaluator
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    /// Geometry predicted counts are computed on.
    pub fn geom(&self) -> Option<&Geom> {
        self.geom.as_ref()
    }

    pub fn psf_kernel(&self) -> Option<&PsfKernel> {
        self.psf_kernel.as_ref()
    }

    pub fn contributes(&self) -> bool {
        self.contributes
    }

    pub fn reset_cache(&mut self) {
        self.cache = None;
    }

    /// Whether inputs changed since the last update or the model moved.
    pub fn needs_update(&self, model: &SkyModel, revision: u64) -> bool {
        if self.revision != Some(revision) {
            return true;
        }
        let Some(support) = &self.support else {
            return false;
        };
        let Some(position) = model.position() else {
            return false;
        };
        let moved = support.position.separation(&position) > 0.5 * support.binsz;
        let resized = match (support.radius, model.evaluation_radius()) {
            (Some(a), Some(b)) => (a - b).abs() > support.binsz,
            (a, b) => a.is_some() != b.is_some(),
        };
        moved || resized
    }

    /// Refresh the snapshot of the dataset inputs.
    pub fn update(
        &mut self,
        inputs: EvaluatorInputs<'_>,
        model: &SkyModel,
        config: &EvaluationConfig,
        revision: u64,
    ) -> Result<(), DatasetError> {
        let geom = inputs.geom;
        let position = model.position().unwrap_or_else(|| geom.center_coord());
        self.revision = Some(revision);
        self.cache = None;
        self.support = None;

        let slices = match self.cutout_slices(inputs, model, config, &position) {
            Ok(slices) => slices,
            Err(DatasetError::Map(MapError::NoOverlap { .. })) => {
                debug!("Model '{}' does not overlap the dataset", self.model_name);
                self.contributes = false;
                self.geom = None;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let eval_geom = match &slices {
            Some(s) => geom.sub_geom(s)?,
            None => geom.clone(),
        };
        self.exposure = Some(Self::project(inputs.exposure, &eval_geom, slices.as_ref(), geom)?);
        let mask = inputs
            .mask_image
            .map(|m| match &slices {
                Some(s) if m.geom().is_aligned(geom) => m.cutout_by_slices(s),
                _ => m.interp_to_geom(&eval_geom.to_image(), false, false),
            })
            .transpose()?;

        self.region_grid = None;
        if let Some(psf) = inputs.psf {
            let psf_position = irf_position(psf.geom(), &position, &eval_geom);
            if let Some(region) = eval_geom.region_shape() {
                if model.spatial.is_some() {
                    let grid = Self::region_psf_grid(psf, region, config)?;
                    self.psf_kernel = Some(psf.get_psf_kernel(
                        &psf_kernel_geom(&grid.grid, Some(inputs.exposure))?,
                        Some(&psf_position),
                        config.psf_max_radius,
                        config.psf_upsample_factor,
                    )?);
                    self.region_grid = Some(grid);
                }
            } else if !(self.psf_precomputed && self.psf_kernel.is_some()) {
                self.psf_kernel = Some(psf.get_psf_kernel(
                    &psf_kernel_geom(&eval_geom, Some(inputs.exposure))?,
                    Some(&psf_position),
                    config.psf_max_radius,
                    config.psf_upsample_factor,
                )?);
            }
        } else if !self.psf_precomputed {
            self.psf_kernel = None;
        }

        self.edisp = match inputs.edisp {
            Some(edisp) => {
                let energy_axis = geom.axis("energy")?;
                let edisp_position = irf_position(edisp.geom(), &position, &eval_geom);
                Some(edisp.get_edisp_kernel(Some(&edisp_position), energy_axis)?)
            }
            None => None,
        };

        self.contributes = mask.as_ref().map_or(true, |m| m.any());
        if !geom.is_region() {
            self.support = Some(Support {
                position,
                radius: model.evaluation_radius(),
                binsz: geom.pixel_scale(),
            });
        }
        debug!(
            "Updated evaluator for '{}' on {:?} pixels, contributes: {}",
            self.model_name,
            eval_geom.npix(),
            self.contributes
        );
        self.geom = Some(eval_geom);
        Ok(())
    }

    /// Pixel ranges of the local cutout, `None` to use the full geometry.
    fn cutout_slices(
        &self,
        inputs: EvaluatorInputs<'_>,
        model: &SkyModel,
        config: &EvaluationConfig,
        position: &SkyCoord,
    ) -> Result<Option<CutoutSlices>, DatasetError> {
        let geom = inputs.geom;
        let radius = match (config.evaluation_mode, model.evaluation_radius()) {
            (EvaluationMode::Local, Some(radius)) if !geom.is_region() => radius,
            _ => return Ok(None),
        };
        let psf_radius = match inputs.psf {
            Some(psf) => match config.psf_max_radius {
                Some(r) => r,
                None => psf
                    .rad_axis()?
                    .center()
                    .last()
                    .copied()
                    .unwrap_or(irf::psf_map::DEFAULT_RAD_MAX),
            },
            None => 0.0,
        };
        let width = 2.0 * (radius + psf_radius) + CUTOUT_MARGIN_PIX * geom.pixel_scale();
        Ok(Some(geom.cutout_slices(position, (width, width))?))
    }

    /// Exposure on the evaluation grid.
    fn project(
        exposure: &Map,
        eval_geom: &Geom,
        slices: Option<&CutoutSlices>,
        geom: &Geom,
    ) -> Result<Map, DatasetError> {
        let aligned = exposure.geom().is_aligned(geom)
            || (geom.is_region() && exposure.geom().is_region());
        match slices {
            Some(s) if aligned => Ok(exposure.cutout_by_slices(s)?),
            None if aligned => Ok(exposure.clone()),
            _ => {
                let target = eval_geom
                    .to_image()
                    .to_cube(exposure.geom().axes().to_vec())?;
                Ok(exposure.interp_to_geom(&target, false, 0.0)?)
            }
        }
    }

    /// Square grid covering `region` plus the PSF extent.
    fn region_psf_grid(
        psf: &PsfMap,
        region: &SkyRegion,
        config: &EvaluationConfig,
    ) -> Result<RegionGrid, DatasetError> {
        let psf_radius = match config.psf_max_radius {
            Some(r) => r,
            None => psf
                .rad_axis()?
                .center()
                .last()
                .copied()
                .unwrap_or(irf::psf_map::DEFAULT_RAD_MAX),
        };
        let half_width = region.half_extent() + psf_radius;
        let binsz = 2.0 * half_width / REGION_PSF_NPIX as f64;
        let grid = Geom::create(
            region.center(),
            binsz,
            (REGION_PSF_NPIX, REGION_PSF_NPIX),
            vec![],
        )?;
        let inside = grid.region_mask(region);
        Ok(RegionGrid { grid, inside })
    }

    /// Fraction of the model inside the evaluation geometry per true energy bin,
    /// shape `(n_etrue, ny, nx)`.
    fn spatial_fractions(
        &self,
        model: &SkyModel,
        geom: &Geom,
        energy_axis_true: &MapAxis,
        options: ConvolveOptions,
    ) -> Result<Array3<f64>, DatasetError> {
        let n_etrue = energy_axis_true.nbin();
        let (nx, ny) = geom.npix();
        let Some(spatial) = &model.spatial else {
            return Ok(Array3::ones((n_etrue, ny, nx)));
        };

        if let (Some(region_grid), Some(kernel)) = (&self.region_grid, &self.psf_kernel) {
            let image = spatial.evaluate_geom(&region_grid.grid)?;
            let mut out = Array3::zeros((n_etrue, 1, 1));
            for (e, center) in energy_axis_true.center().iter().enumerate() {
                let idx = kernel_index(kernel, *center);
                let smoothed = convolve2d(image.view(), kernel.kernel_image(idx), options);
                out[[e, 0, 0]] = smoothed
                    .iter()
                    .zip(region_grid.inside.iter())
                    .filter(|(_, keep)| **keep)
                    .map(|(v, _)| *v)
                    .sum();
            }
            return Ok(out);
        }

        let image = spatial.evaluate_geom(geom)?;
        let mut out = Array3::zeros((n_etrue, ny, nx));
        match &self.psf_kernel {
            Some(kernel) if !geom.is_region() => {
                for (e, center) in energy_axis_true.center().iter().enumerate() {
                    let idx = kernel_index(kernel, *center);
                    let smoothed = convolve2d(image.view(), kernel.kernel_image(idx), options);
                    out.index_axis_mut(Axis(0), e).assign(&smoothed);
                }
            }
            _ => {
                for mut plane in out.axis_iter_mut(Axis(0)) {
                    plane.assign(&image);
                }
            }
        }
        Ok(out)
    }

    /// Predicted counts of `model` on the evaluation geometry.
    ///
    /// Integrated flux times exposure, smoothed by the PSF and redistributed
    /// to reconstructed energy. The result is cached against the model
    /// parameters.
    pub fn compute_npred(
        &mut self,
        model: &SkyModel,
        config: &EvaluationConfig,
    ) -> Result<Map, DatasetError> {
        let parameters = model.parameters();
        if config.use_npred_cache {
            if let Some((cached_parameters, npred)) = &self.cache {
                if cached_parameters.matches(&parameters) {
                    return Ok(npred.clone());
                }
            }
        }
        let (Some(geom), Some(exposure)) = (&self.geom, &self.exposure) else {
            return Err(DatasetError::MissingField {
                dataset: self.model_name.clone(),
                field: "exposure",
            });
        };

        let energy_axis_true = exposure.geom().axis("energy_true")?.clone();
        let options = ConvolveOptions {
            parallel: config.convolve_parallel,
            edge_mode: EdgeMode::Constant(0.0),
        };
        let flux = model.spectral.integrate_axis(&energy_axis_true);
        let fractions = self.spatial_fractions(model, geom, &energy_axis_true, options)?;

        let mut npred_true = ix3(exposure.data().clone())?;
        for ((mut plane, fraction), f) in npred_true
            .axis_iter_mut(Axis(0))
            .zip(fractions.axis_iter(Axis(0)))
            .zip(flux.iter())
        {
            plane.zip_mut_with(&fraction, |v, s| *v *= f * s);
        }

        let energy_axis = geom.axis("energy")?;
        let kernel = match &self.edisp {
            Some(kernel) => kernel.clone(),
            None => EDispKernel::from_diagonal_response(energy_axis_true, energy_axis.clone()),
        };
        let matrix = kernel.pdf_matrix();
        let (ny, nx) = (npred_true.shape()[1], npred_true.shape()[2]);
        let mut npred = Array3::zeros((matrix.ncols(), ny, nx));
        for (i, row) in matrix.outer_iter().enumerate() {
            let source = npred_true.index_axis(Axis(0), i);
            for (j, weight) in row.iter().enumerate() {
                if *weight != 0.0 {
                    npred.index_axis_mut(Axis(0), j).scaled_add(*weight, &source);
                }
            }
        }

        let npred = Map::from_data(geom.clone(), npred.into_dyn(), "")?;
        self.cache = Some((parameters, npred.clone()));
        Ok(npred)
    }
}

/// Kernel slice for a true energy, nearest bin when outside the kernel axis.
fn kernel_index(kernel: &PsfKernel, energy_true: f64) -> usize {
    kernel
        .psf_kernel_map()
        .geom()
        .axis("energy_true")
        .map(|axis| axis.coord_to_idx_clip(energy_true))
        .unwrap_or(0)
        .min(kernel.n_energy().saturating_sub(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{SpatialModel, SpectralModel};
    use approx::assert_relative_eq;

    fn energy_axis(name: &str) -> MapAxis {
        MapAxis::from_energy_bounds(1.0, 10.0, 2, "TeV", name).unwrap()
    }

    fn inputs_geom() -> (Geom, Map) {
        let geom = Geom::create(
            SkyCoord::icrs(0.0, 0.0),
            0.1,
            (21, 21),
            vec![energy_axis("energy")],
        )
        .unwrap();
        let exposure_geom = geom.to_image().to_cube(vec![energy_axis("energy_true")]).unwrap();
        let exposure = Map::from_elem(exposure_geom, 1e10, "m2 s");
        (geom, exposure)
    }

    fn point_model() -> SkyModel {
        SkyModel::new(
            "point",
            SpectralModel::constant(1e-12),
            Some(SpatialModel::point(SkyCoord::icrs(0.0, 0.0))),
        )
    }

    #[test]
    fn test_point_source_npred_no_irfs() {
        let (geom, exposure) = inputs_geom();
        let inputs = EvaluatorInputs {
            geom: &geom,
            exposure: &exposure,
            psf: None,
            edisp: None,
            mask_image: None,
        };
        let model = point_model();
        let config = EvaluationConfig::default();
        let mut evaluator = MapEvaluator::new("point");
        assert!(evaluator.needs_update(&model, 0));
        evaluator.update(inputs, &model, &config, 0).unwrap();
        assert!(!evaluator.needs_update(&model, 0));
        assert!(evaluator.needs_update(&model, 1));
        assert!(evaluator.contributes());

        let npred = evaluator.compute_npred(&model, &config).unwrap();
        // 9 TeV * 1e-12 cm-2 s-1 TeV-1 * 1e4 cm2/m2 * 1e10 m2 s
        assert_relative_eq!(npred.sum(), 900.0, max_relative = 1e-9);
    }

    #[test]
    fn test_cache_follows_parameters() {
        let (geom, exposure) = inputs_geom();
        let inputs = EvaluatorInputs {
            geom: &geom,
            exposure: &exposure,
            psf: None,
            edisp: None,
            mask_image: None,
        };
        let mut model = point_model();
        let config = EvaluationConfig::default();
        let mut evaluator = MapEvaluator::new("point");
        evaluator.update(inputs, &model, &config, 0).unwrap();
        let first = evaluator.compute_npred(&model, &config).unwrap().sum();
        if let SpectralModel::Constant { constant } = &mut model.spectral {
            constant.value *= 2.0;
        }
        let second = evaluator.compute_npred(&model, &config).unwrap().sum();
        assert_relative_eq!(second, 2.0 * first, max_relative = 1e-12);
    }

    #[test]
    fn test_model_outside_does_not_contribute() {
        let (geom, exposure) = inputs_geom();
        let inputs = EvaluatorInputs {
            geom: &geom,
            exposure: &exposure,
            psf: None,
            edisp: None,
            mask_image: None,
        };
        let model = SkyModel::new(
            "far",
            SpectralModel::constant(1e-12),
            Some(SpatialModel::point(SkyCoord::icrs(40.0, 10.0))),
        );
        let mut evaluator = MapEvaluator::new("far");
        evaluator
            .update(inputs, &model, &EvaluationConfig::default(), 0)
            .unwrap();
        assert!(!evaluator.contributes());
    }

    #[test]
    fn test_masked_out_model_does_not_contribute() {
        let (geom, exposure) = inputs_geom();
        let mask = MaskMap::from_elem(geom.to_image(), false, "");
        let inputs = EvaluatorInputs {
            geom: &geom,
            exposure: &exposure,
            psf: None,
            edisp: None,
            mask_image: Some(&mask),
        };
        let model = point_model();
        let mut evaluator = MapEvaluator::new("point");
        evaluator
            .update(inputs, &model, &EvaluationConfig::default(), 0)
            .unwrap();
        assert!(!evaluator.contributes());
    }

    #[test]
    fn test_psf_spreads_point_source() {
        let (geom, exposure) = inputs_geom();
        let psf = PsfMap::from_gauss(&energy_axis("energy_true"), None, &[0.15], None).unwrap();
        let inputs = EvaluatorInputs {
            geom: &geom,
            exposure: &exposure,
            psf: Some(&psf),
            edisp: None,
            mask_image: None,
        };
        let model = point_model();
        let config = EvaluationConfig {
            evaluation_mode: EvaluationMode::Global,
            ..EvaluationConfig::default()
        };
        let mut evaluator = MapEvaluator::new("point");
        evaluator.update(inputs, &model, &config, 0).unwrap();
        let npred = evaluator.compute_npred(&model, &config).unwrap();
        let peak = npred.data()[[0, 10, 10]];
        let total: f64 = npred.data().index_axis(Axis(0), 0).sum();
        assert!(peak < 0.5 * total);
        assert_relative_eq!(npred.sum(), 900.0, max_relative = 0.05);
    }
}
