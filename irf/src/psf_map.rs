//! Spatially resolved point spread function.
//!
//! A [`PsfMap`] tabulates the PSF surface brightness `psf(rad)` in `sr-1`
//! for every true energy and sky position of a (usually coarse) grid. The map
//! carries the axes `[rad, energy_true]`, so the data array is laid out as
//! `(energy_true, rad, y, x)`. Values between the tabulated nodes are found by
//! multi-linear interpolation: log in energy, linear in offset, linear in the
//! two pixel coordinates.

use log::debug;
use ndarray::parallel::prelude::*;
use ndarray::{Array2, Array3, ArrayD, Axis, IxDyn};
use rand::Rng;
use skymaps::{
    AxisInterp, AxisSlice, Bounds, Geom, InverseCdfSampler, Map, MapAxis, MapCoord, MaskMap,
    RegularGridInterpolator, SkyCoord, SkyRegion,
};

use crate::error::IrfError;
use crate::irf_map::IrfMap;
use crate::psf_kernel::PsfKernel;

/// Kind label used in errors and logs.
pub const PSF_MAP_KIND: &str = "PSFMap";

/// Upper edge of the default offset axis, degrees.
pub const DEFAULT_RAD_MAX: f64 = 0.66;

/// Number of bins of the default offset axis.
pub const DEFAULT_RAD_NBIN: usize = 66;

/// Oversampling of the offset axis when inverting the containment fraction.
const CONTAINMENT_RADIUS_UPSAMPLE: usize = 20;

/// Default PSF upsampling factor used when building kernels.
pub const DEFAULT_KERNEL_FACTOR: usize = 4;

/// Offset axis `0 - 0.66 deg` in 66 linear bins.
pub fn default_rad_axis() -> Result<MapAxis, IrfError> {
    Ok(MapAxis::from_bounds(
        0.0,
        DEFAULT_RAD_MAX,
        DEFAULT_RAD_NBIN,
        "rad",
        "deg",
        AxisInterp::Lin,
    )?)
}

/// Normalized power-law weights `dN/dE ~ E^-index` integrated over each bin.
pub fn power_law_weights(edges: &[f64], index: f64) -> Vec<f64> {
    let integral = |lo: f64, hi: f64| {
        if (index - 1.0).abs() < 1e-10 {
            (hi / lo).ln()
        } else {
            let g = 1.0 - index;
            (hi.powf(g) - lo.powf(g)) / g
        }
    };
    let weights: Vec<f64> = edges.windows(2).map(|w| integral(w[0], w[1])).collect();
    let total: f64 = weights.iter().sum();
    if total > 0.0 {
        weights.iter().map(|w| w / total).collect()
    } else {
        weights
    }
}

/// Linear interpolation in a sorted table, clamped at both ends.
fn interp_clamped(xs: &[f64], ys: &[f64], x: f64) -> f64 {
    let n = xs.len();
    if n == 0 {
        return 0.0;
    }
    if x <= xs[0] {
        return ys[0];
    }
    if x >= xs[n - 1] {
        return ys[n - 1];
    }
    let i = xs.partition_point(|v| *v <= x).clamp(1, n - 1) - 1;
    let t = (x - xs[i]) / (xs[i + 1] - xs[i]);
    ys[i] + t * (ys[i + 1] - ys[i])
}

/// PSF map plus exposure weights.
#[derive(Debug, Clone, PartialEq)]
pub struct PsfMap {
    inner: IrfMap,
}

impl PsfMap {
    /// Wrap a PSF map with axes `rad` and `energy_true`.
    pub fn new(psf_map: Map, exposure_map: Option<Map>) -> Result<Self, IrfError> {
        if psf_map.geom().axes().len() != 2 {
            return Err(IrfError::InvalidParameter(format!(
                "{PSF_MAP_KIND} needs exactly the axes rad and energy_true, got {:?}",
                psf_map.geom().axes().names()
            )));
        }
        let inner = IrfMap::new(
            PSF_MAP_KIND,
            psf_map,
            exposure_map,
            &["rad", "energy_true"],
        )?;
        Ok(Self { inner })
    }

    pub(crate) fn from_irf(inner: IrfMap) -> Self {
        Self { inner }
    }

    /// Zero PSF map on `geom` with a zero exposure map.
    ///
    /// `geom` must carry the `rad` and `energy_true` axes.
    pub fn from_geom(geom: &Geom) -> Result<Self, IrfError> {
        let exposure = Map::from_geom(geom.squash("rad")?, "m2 s");
        Self::new(Map::from_geom(geom.clone(), "sr-1"), Some(exposure))
    }

    /// Position independent Gaussian PSF.
    ///
    /// # Arguments
    /// * `energy_axis_true` - True energy axis
    /// * `rad_axis` - Offset axis, defaults to [`default_rad_axis`]
    /// * `sigma` - Gaussian width in degrees, one value or one per energy bin
    /// * `geom` - Spatial grid, defaults to a 2 x 1 all-sky grid of 180 deg pixels
    pub fn from_gauss(
        energy_axis_true: &MapAxis,
        rad_axis: Option<MapAxis>,
        sigma: &[f64],
        geom: Option<&Geom>,
    ) -> Result<Self, IrfError> {
        let rad_axis = match rad_axis {
            Some(axis) => axis,
            None => default_rad_axis()?,
        };
        let n_energy = energy_axis_true.nbin();
        let sigmas: Vec<f64> = match sigma.len() {
            1 => vec![sigma[0]; n_energy],
            n if n == n_energy => sigma.to_vec(),
            n => {
                return Err(IrfError::InvalidParameter(format!(
                    "expected 1 or {n_energy} sigma values, got {n}"
                )))
            }
        };
        if sigmas.iter().any(|s| !(*s > 0.0)) {
            return Err(IrfError::InvalidParameter(
                "Gaussian sigma must be positive".to_string(),
            ));
        }

        let image = match geom {
            Some(g) => g.to_image(),
            None => Geom::create(SkyCoord::icrs(0.0, 0.0), 180.0, (2, 1), vec![])?,
        };
        let geom = image.to_cube(vec![rad_axis.clone(), energy_axis_true.clone()])?;
        let rad = rad_axis.center();
        let shape = geom.data_shape();
        let data = ArrayD::from_shape_fn(IxDyn(&shape), |idx| {
            let sigma = sigmas[idx[0]].to_radians();
            let r = rad[idx[1]].to_radians();
            (-0.5 * r * r / (sigma * sigma)).exp() / (2.0 * std::f64::consts::PI * sigma * sigma)
        });
        let psf_map = Map::from_data(geom.clone(), data, "sr-1")?;
        let exposure = Map::from_elem(geom.squash("rad")?, 1.0, "m2 s");
        Self::new(psf_map, Some(exposure))
    }

    pub fn irf(&self) -> &IrfMap {
        &self.inner
    }

    pub fn psf_map(&self) -> &Map {
        self.inner.irf_map()
    }

    pub fn exposure_map(&self) -> Option<&Map> {
        self.inner.exposure_map()
    }

    pub fn geom(&self) -> &Geom {
        self.inner.geom()
    }

    pub fn energy_axis_true(&self) -> Result<&MapAxis, IrfError> {
        Ok(self.geom().axis("energy_true")?)
    }

    pub fn rad_axis(&self) -> Result<&MapAxis, IrfError> {
        Ok(self.geom().axis("rad")?)
    }

    /// Whether the PSF has a single spatial bin.
    pub fn is_position_independent(&self) -> bool {
        self.geom().npix() == (1, 1)
    }

    /// Interpolator over `(energy_true, rad, y_pix, x_pix)`.
    fn interpolator(&self) -> Result<RegularGridInterpolator, IrfError> {
        let geom = self.geom();
        let energy = self.energy_axis_true()?;
        let rad = self.rad_axis()?;
        let ie = geom.data_axis_index("energy_true")?;
        let ir = geom.data_axis_index("rad")?;
        let data = self
            .psf_map()
            .data()
            .view()
            .permuted_axes(IxDyn(&[ie, ir, 2, 3]))
            .to_owned();
        let (nx, ny) = geom.npix();
        let points = vec![
            energy.center(),
            rad.center(),
            (0..ny).map(|i| i as f64).collect(),
            (0..nx).map(|i| i as f64).collect(),
        ];
        let scales = vec![
            energy.interp(),
            AxisInterp::Lin,
            AxisInterp::Lin,
            AxisInterp::Lin,
        ];
        Ok(RegularGridInterpolator::new(points, scales, data)?
            .with_bounds(Bounds::Extrapolate)
            .with_clip(true))
    }

    /// Offsets and cumulative containment at `[0, rad centers...]`.
    fn containment_table(
        &self,
        interp: &RegularGridInterpolator,
        energy_true: f64,
        pix: (f64, f64),
    ) -> Result<(Vec<f64>, Vec<f64>), IrfError> {
        let mut nodes = vec![0.0];
        nodes.extend(self.rad_axis()?.center());
        let integrand = nodes
            .iter()
            .map(|r| {
                let value = interp.evaluate(&[energy_true, *r, pix.1, pix.0])?;
                Ok(value * 2.0 * std::f64::consts::PI * r.to_radians())
            })
            .collect::<Result<Vec<f64>, IrfError>>()?;

        let mut cumulative = Vec::with_capacity(nodes.len());
        cumulative.push(0.0);
        for k in 1..nodes.len() {
            let dr = (nodes[k] - nodes[k - 1]).to_radians();
            let prev = cumulative[k - 1];
            cumulative.push(prev + 0.5 * dr * (integrand[k] + integrand[k - 1]));
        }
        Ok((nodes, cumulative))
    }

    fn containment_radius_at(
        &self,
        interp: &RegularGridInterpolator,
        fraction: f64,
        energy_true: f64,
        pix: (f64, f64),
    ) -> Result<f64, IrfError> {
        let (nodes, cumulative) = self.containment_table(interp, energy_true, pix)?;
        let fine = self.rad_axis()?.upsample(CONTAINMENT_RADIUS_UPSAMPLE).center();
        let mut best = (f64::INFINITY, 0.0);
        for r in fine {
            let diff = (interp_clamped(&nodes, &cumulative, r) - fraction).abs();
            if diff < best.0 {
                best = (diff, r);
            }
        }
        Ok(best.1)
    }

    /// Fraction of the PSF contained within each offset in `rad` (degrees).
    ///
    /// `position` defaults to the center of the PSF map.
    pub fn containment(
        &self,
        rad: &[f64],
        energy_true: f64,
        position: Option<&SkyCoord>,
    ) -> Result<Vec<f64>, IrfError> {
        let interp = self.interpolator()?;
        let pix = self.inner.position_to_pix(position);
        let (nodes, cumulative) = self.containment_table(&interp, energy_true, pix)?;
        Ok(rad
            .iter()
            .map(|r| interp_clamped(&nodes, &cumulative, *r))
            .collect())
    }

    /// Offset in degrees containing `fraction` of the PSF.
    pub fn containment_radius(
        &self,
        fraction: f64,
        energy_true: f64,
        position: Option<&SkyCoord>,
    ) -> Result<f64, IrfError> {
        let interp = self.interpolator()?;
        let pix = self.inner.position_to_pix(position);
        self.containment_radius_at(&interp, fraction, energy_true, pix)
    }

    /// Containment radius for every spatial pixel of the PSF map.
    pub fn containment_radius_map(&self, energy_true: f64, fraction: f64) -> Result<Map, IrfError> {
        let interp = self.interpolator()?;
        let geom = self.geom().to_image();
        let (nx, ny) = geom.npix();
        let mut data = Array2::<f64>::zeros((ny, nx));
        for ((iy, ix), value) in data.indexed_iter_mut() {
            *value =
                self.containment_radius_at(&interp, fraction, energy_true, (ix as f64, iy as f64))?;
        }
        Ok(Map::from_data(geom, data.into_dyn(), "deg")?)
    }

    /// Convolution kernel on the grid of `geom`, centered at `position`.
    ///
    /// # Arguments
    /// * `geom` - Target geometry; the kernel uses its spatial grid and its
    ///   `energy_true` axis, or the PSF's own true energy axis when it has none
    /// * `position` - Where to evaluate the PSF, defaults to the PSF map center
    /// * `max_radius` - Kernel radius in degrees, clamped to the tabulated
    ///   offsets and half the target width
    /// * `factor` - Oversampling factor used while evaluating the PSF
    pub fn get_psf_kernel(
        &self,
        geom: &Geom,
        position: Option<&SkyCoord>,
        max_radius: Option<f64>,
        factor: usize,
    ) -> Result<PsfKernel, IrfError> {
        let factor = factor.max(1);
        let rad_max = self
            .rad_axis()?
            .center()
            .last()
            .copied()
            .unwrap_or(DEFAULT_RAD_MAX);
        let (width_x, width_y) = geom.width();
        let radius = max_radius
            .unwrap_or(rad_max)
            .min(rad_max)
            .min(0.5 * width_x.min(width_y));

        let energy_axis = match geom.axis("energy_true") {
            Ok(axis) => axis.clone(),
            Err(_) => self.energy_axis_true()?.clone(),
        };
        let energies = energy_axis.center();
        let kernel_geom = geom
            .to_image()
            .to_cube(vec![energy_axis])?
            .to_odd_npix(Some(radius))?;
        let fine = kernel_geom.upsample(factor)?;
        let separation = fine.separation(&fine.center_coord());

        let interp = self.interpolator()?;
        let (x, y) = self.inner.position_to_pix(position);
        let (nx, ny) = fine.npix();
        let mut data = Array3::<f64>::zeros((energies.len(), ny, nx));
        data.axis_iter_mut(Axis(0))
            .into_par_iter()
            .zip(energies.par_iter())
            .try_for_each(|(mut slice, energy)| -> Result<(), IrfError> {
                for (value, r) in slice.iter_mut().zip(separation.iter()) {
                    *value = interp.evaluate(&[*energy, *r, y, x])?.max(0.0);
                }
                Ok(())
            })?;

        let fine_map = Map::from_data(fine, data.into_dyn(), "")?;
        let kernel_map = fine_map.downsample(factor, true, None)?;
        debug!(
            "Built PSF kernel of {:?} pixels with radius {radius:.3} deg",
            kernel_map.geom().npix()
        );
        let mut kernel = PsfKernel::new(kernel_map)?;
        kernel.normalize();
        Ok(kernel)
    }

    /// Smear event positions by offsets drawn from the PSF.
    ///
    /// `map_coord` needs an `energy_true` value per event. Returns the
    /// displaced positions with the same `energy_true` values.
    pub fn sample_coord<R: Rng + ?Sized>(
        &self,
        map_coord: &MapCoord,
        rng: &mut R,
    ) -> Result<MapCoord, IrfError> {
        let energies = map_coord
            .axis("energy_true")
            .ok_or_else(|| IrfError::MissingAxis {
                kind: "MapCoord".to_string(),
                axis: "energy_true".to_string(),
            })?;
        let rad_axis = self.rad_axis()?;
        let centers = rad_axis.center();
        let widths = rad_axis.bin_width();
        let interp = self.interpolator()?;

        let mut pdf = Array2::<f64>::zeros((map_coord.len(), centers.len()));
        for (mut row, (position, energy)) in pdf
            .axis_iter_mut(Axis(0))
            .zip(map_coord.skycoord.iter().zip(energies.iter()))
        {
            let (x, y) = self.inner.position_to_pix(Some(position));
            for (j, value) in row.iter_mut().enumerate() {
                let psf = interp.evaluate(&[*energy, centers[j], y, x])?;
                *value = psf * centers[j] * widths[j];
            }
        }

        let pix = InverseCdfSampler::new(pdf.view()).sample_axis(rng);
        let positions = map_coord
            .skycoord
            .iter()
            .zip(pix.iter())
            .map(|(position, p)| {
                let separation = rad_axis.pix_to_coord(*p);
                let position_angle = rng.gen_range(0.0..360.0);
                position.directional_offset_by(position_angle, separation)
            })
            .collect();
        Ok(MapCoord::new(positions).with_axis("energy_true", energies.to_vec()))
    }

    /// Scale the PSF to unit integral over `rad` at every energy and position.
    pub fn normalize(&mut self) -> Result<(), IrfError> {
        let geom = self.geom().clone();
        let edges: Vec<f64> = self.rad_axis()?.edges().iter().map(|e| e.to_radians()).collect();
        let solid_angle: Vec<f64> = edges
            .windows(2)
            .map(|w| 2.0 * std::f64::consts::PI * (w[0].cos() - w[1].cos()))
            .collect();
        let rad_dim = Axis(geom.data_axis_index("rad")?);
        let mut psf = self.psf_map().clone();
        let data = psf.data_mut();
        let mut integral = data.sum_axis(rad_dim).mapv(|_| 0.0);
        for (j, omega) in solid_angle.iter().enumerate() {
            integral.scaled_add(*omega, &data.index_axis(rad_dim, j));
        }
        let integral = integral.insert_axis(rad_dim);
        ndarray::Zip::from(&mut *data)
            .and_broadcast(&integral)
            .for_each(|v, &norm| *v = if norm > 0.0 { *v / norm } else { 0.0 });
        self.inner = self.inner.with_irf_map(psf);
        Ok(())
    }

    /// PSF at the pixel containing the region center.
    pub fn to_region_nd_map(&self, region: &SkyRegion) -> Result<Self, IrfError> {
        Ok(Self::from_irf(self.inner.to_region_nd_map(region)?))
    }

    /// Exposure and power-law weighted mean over true energy.
    ///
    /// The result keeps a single `energy_true` bin spanning the full range.
    pub fn to_image(&self, spectral_index: f64) -> Result<Self, IrfError> {
        let exposure = self
            .exposure_map()
            .ok_or_else(|| IrfError::MissingExposure(PSF_MAP_KIND.to_string()))?;
        let energy_axis = self.energy_axis_true()?;
        let weights = power_law_weights(&energy_axis.edges(), spectral_index);
        let dim = Axis(self.geom().data_axis_index("energy_true")?);

        let mut weighted_exposure = exposure.clone();
        for (j, w) in weights.iter().enumerate() {
            weighted_exposure
                .data_mut()
                .index_axis_mut(dim, j)
                .mapv_inplace(|v| v * w);
        }
        let exposure_image = weighted_exposure.sum_over_axis("energy_true", true)?;
        let psf = self
            .psf_map()
            .checked_mul(&weighted_exposure)?
            .sum_over_axis("energy_true", true)?;
        let mut psf = psf.zip_with(&exposure_image, |p, e| p / e)?;
        psf.nan_to_num();
        Self::new(psf.with_unit("sr-1"), Some(exposure_image))
    }

    /// Exposure-weighted stacking, see [`IrfMap::stack`].
    pub fn stack(
        &mut self,
        other: &PsfMap,
        weights: Option<&MaskMap>,
        nan_to_num: bool,
    ) -> Result<(), IrfError> {
        self.inner.stack(&other.inner, weights, nan_to_num)
    }

    pub fn cutout(&self, position: &SkyCoord, width: (f64, f64)) -> Result<Self, IrfError> {
        Ok(Self::from_irf(self.inner.cutout(position, width)?))
    }

    pub fn slice_by_idx(&self, slices: &[(&str, AxisSlice)]) -> Result<Self, IrfError> {
        Ok(Self::from_irf(self.inner.slice_by_idx(slices)?))
    }
}
