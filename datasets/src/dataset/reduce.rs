//! Structural transforms and region reduction.

use log::debug;
use skymaps::{AxisSlice, Map, MapAxis, MapError, MaskMap, PadMode, RegionReduce, SkyCoord, SkyRegion};

use super::{make_name, Background, MapDataset, MapDatasetBuilder};
use crate::error::DatasetError;

/// Transforms producing a new dataset from an existing one.
///
/// Every transform takes an optional name for the result; a random name is
/// drawn when none is given. Models are not carried over.
pub trait ReducibleDataset: Sized {
    /// Reconstructed energy axis of the reference geometry.
    fn energy_axis(&self) -> Result<MapAxis, DatasetError>;

    /// Spatial cutout of `width` degrees around `position`.
    fn cutout(
        &self,
        position: &SkyCoord,
        width: (f64, f64),
        name: Option<&str>,
    ) -> Result<Self, DatasetError>;

    /// Merge `factor` bins spatially, or along `axis_name` when given.
    fn downsample(
        &self,
        factor: usize,
        axis_name: Option<&str>,
        name: Option<&str>,
    ) -> Result<Self, DatasetError>;

    /// Enlarge the spatial grid by `width` pixels on every side.
    fn pad(&self, width: usize, mode: PadMode<f64>, name: Option<&str>)
        -> Result<Self, DatasetError>;

    fn slice_by_idx(
        &self,
        slices: &[(&str, AxisSlice)],
        name: Option<&str>,
    ) -> Result<Self, DatasetError>;

    /// Rebin the reconstructed energy axis onto `energy_axis`.
    fn resample_energy_axis(
        &self,
        energy_axis: &MapAxis,
        name: Option<&str>,
    ) -> Result<Self, DatasetError>;

    /// Keep the reconstructed energy bins between the edges nearest to
    /// `energy_min` and `energy_max`.
    fn slice_by_energy(
        &self,
        energy_min: Option<f64>,
        energy_max: Option<f64>,
        name: Option<&str>,
    ) -> Result<Self, DatasetError> {
        let axis = self.energy_axis()?;
        let range = axis.bins_nearest(
            energy_min.unwrap_or_else(|| axis.edges_min()),
            energy_max.unwrap_or_else(|| axis.edges_max()),
        )?;
        self.slice_by_idx(&[("energy", AxisSlice::Range(range))], name)
    }

    /// Sum over reconstructed energy into a single bin.
    fn to_image(&self, name: Option<&str>) -> Result<Self, DatasetError> {
        let axis = self.energy_axis()?.squash();
        self.resample_energy_axis(&axis, name)
    }
}

fn downsample_map(
    map: &Map,
    factor: usize,
    axis_name: Option<&str>,
    preserve_counts: bool,
    weights: Option<&MaskMap>,
) -> Result<Map, MapError> {
    match axis_name {
        Some(axis_name) => map.downsample_axis(factor, axis_name, preserve_counts, weights),
        None => map.downsample(factor, preserve_counts, weights),
    }
}

fn downsample_mask(
    mask: &MaskMap,
    factor: usize,
    axis_name: Option<&str>,
) -> Result<MaskMap, MapError> {
    match axis_name {
        Some(axis_name) => mask.downsample_axis(factor, axis_name),
        None => mask.downsample(factor),
    }
}

/// `acceptance * counts_off / background`, non-finite values set to zero.
fn rescaled_acceptance_off(
    acceptance: &Map,
    counts_off: &Map,
    background: &Map,
) -> Result<Map, MapError> {
    let mut acceptance_off = acceptance.checked_mul(counts_off)?.checked_div(background)?;
    acceptance_off.nan_to_num();
    Ok(acceptance_off)
}

impl MapDataset {
    /// Builder for a derived dataset of the same type, sharing GTI, provenance
    /// table and evaluation settings.
    fn derive(&self, name: Option<&str>) -> MapDatasetBuilder {
        let name = name.map(str::to_string).unwrap_or_else(make_name);
        MapDataset::builder()
            .name(&name)
            .gti(self.gti.clone())
            .meta_table(self.meta_table.clone())
            .config(self.config.clone())
    }

    /// Apply `f` to every present map of a role.
    fn map_field<T, U>(
        value: Option<&T>,
        f: impl FnOnce(&T) -> Result<U, MapError>,
    ) -> Result<Option<U>, DatasetError> {
        Ok(value.map(f).transpose()?)
    }

    /// Reduce the dataset to a single spatial bin.
    ///
    /// Counts and background are summed over the region, restricted to the
    /// safe mask; exposure is averaged. PSF and energy dispersion are taken at
    /// the pixel holding the region center. Masks are true where any pixel of
    /// the region is.
    ///
    /// Fails if the region touches the border of the counts grid or if the
    /// mask varies across the region within an energy bin.
    pub fn to_region_map_dataset(
        &self,
        region: &SkyRegion,
        name: Option<&str>,
    ) -> Result<MapDataset, DatasetError> {
        let geom = self.geom()?;
        if !geom.is_region() {
            let padded = geom.to_image().pad(1)?.region_mask(region);
            let (ny, nx) = padded.dim();
            let on_border = padded.row(0).iter().any(|v| *v)
                || padded.row(ny - 1).iter().any(|v| *v)
                || padded.column(0).iter().any(|v| *v)
                || padded.column(nx - 1).iter().any(|v| *v);
            if on_border {
                return Err(DatasetError::RegionNotContained);
            }
        }

        if let Some(mask) = self.mask()? {
            if !mask.geom().is_region() {
                let region_mask = mask.geom().to_image().region_mask(region);
                let values: Vec<bool> = mask.data().iter().copied().collect();
                for plane in values.chunks(region_mask.len()) {
                    let mut inside = plane
                        .iter()
                        .zip(region_mask.iter())
                        .filter(|(_, r)| **r)
                        .map(|(v, _)| *v);
                    if let Some(first) = inside.next() {
                        if inside.any(|v| v != first) {
                            return Err(DatasetError::MaskNotUniform);
                        }
                    }
                }
            }
        }

        let mask_safe = self.mask_safe()?;
        let sum = |map: &Map| map.to_region_nd_map(region, RegionReduce::Sum, mask_safe);
        let mut builder = self
            .derive(name)
            .mask_safe(Self::map_field(mask_safe, |m| m.to_region_nd_map(region))?)
            .mask_fit(Self::map_field(self.mask_fit()?, |m| {
                m.to_region_nd_map(region)
            })?)
            .counts(Self::map_field(self.counts()?, sum)?)
            .exposure(Self::map_field(self.exposure()?, |m| {
                m.to_region_nd_map(region, RegionReduce::Mean, None)
            })?)
            .psf(self.psf()?.map(|p| p.to_region_nd_map(region)).transpose()?)
            .edisp(self.edisp()?.map(|e| e.to_region_nd_map(region)).transpose()?);

        match &self.background {
            Background::Cash(cash) => {
                if cash.background.get()?.is_some() {
                    builder = builder.background(Some(sum(&self.npred_background()?)?));
                }
            }
            Background::OnOff(on_off) => {
                let counts_off = Self::map_field(on_off.counts_off.get()?, sum)?;
                let acceptance = Self::map_field(on_off.acceptance.get()?, |m| {
                    m.to_region_nd_map(region, RegionReduce::Mean, mask_safe)
                })?;
                let acceptance_off = match (&acceptance, &counts_off, self.background()?) {
                    (Some(acceptance), Some(counts_off), Some(background)) => Some(
                        rescaled_acceptance_off(acceptance, counts_off, &sum(&background)?)?,
                    ),
                    _ => None,
                };
                builder = builder.on_off(counts_off, acceptance, acceptance_off);
            }
        }
        debug!("Reduced dataset '{}' to region {:?}", self.name, region);
        builder.build()
    }

    /// Region dataset without PSF, optionally correcting the exposure for the
    /// PSF fraction contained in a circular region.
    pub fn to_spectrum_dataset(
        &self,
        region: &SkyRegion,
        containment_correction: bool,
        name: Option<&str>,
    ) -> Result<MapDataset, DatasetError> {
        let mut dataset = self.to_region_map_dataset(region, name)?;
        if containment_correction {
            let SkyRegion::Circle { center, radius } = region else {
                return Err(DatasetError::ContainmentCorrection(
                    "only circular regions are supported".to_string(),
                ));
            };
            let Some(psf) = self.psf()? else {
                return Err(DatasetError::ContainmentCorrection(
                    "no PSF map set".to_string(),
                ));
            };
            let Some(exposure) = dataset.exposure.get_mut()? else {
                return Err(DatasetError::ContainmentCorrection(
                    "no exposure to correct".to_string(),
                ));
            };
            let dim = ndarray::Axis(exposure.geom().data_axis_index("energy_true")?);
            let energies = exposure.geom().axis("energy_true")?.center();
            for (idx, energy) in energies.iter().enumerate() {
                let containment = psf.containment(&[*radius], *energy, Some(center))?;
                let fraction = containment.first().copied().unwrap_or(1.0);
                exposure
                    .data_mut()
                    .index_axis_mut(dim, idx)
                    .mapv_inplace(|v| v * fraction);
            }
        }
        dataset.psf.set(None);
        Ok(dataset)
    }
}

impl ReducibleDataset for MapDataset {
    fn energy_axis(&self) -> Result<MapAxis, DatasetError> {
        Ok(self.geom()?.axis("energy")?.clone())
    }

    fn cutout(
        &self,
        position: &SkyCoord,
        width: (f64, f64),
        name: Option<&str>,
    ) -> Result<Self, DatasetError> {
        let cut = |m: &Map| m.cutout(position, width);
        let mut builder = self
            .derive(name)
            .counts(Self::map_field(self.counts()?, cut)?)
            .exposure(Self::map_field(self.exposure()?, cut)?)
            .psf(self.psf()?.map(|p| p.cutout(position, width)).transpose()?)
            .edisp(self.edisp()?.map(|e| e.cutout(position, width)).transpose()?)
            .mask_safe(Self::map_field(self.mask_safe()?, |m| {
                m.cutout(position, width)
            })?)
            .mask_fit(Self::map_field(self.mask_fit()?, |m| {
                m.cutout(position, width)
            })?);
        builder = match &self.background {
            Background::Cash(cash) => {
                builder.background(Self::map_field(cash.background.get()?, cut)?)
            }
            Background::OnOff(on_off) => builder.on_off(
                Self::map_field(on_off.counts_off.get()?, cut)?,
                Self::map_field(on_off.acceptance.get()?, cut)?,
                Self::map_field(on_off.acceptance_off.get()?, cut)?,
            ),
        };
        builder.build()
    }

    /// Counts and background are summed, exposure averaged (spatially only)
    /// and masks OR-merged. The PSF is kept as is; the energy dispersion is
    /// only merged when downsampling the reconstructed energy axis of a
    /// kernel map.
    fn downsample(
        &self,
        factor: usize,
        axis_name: Option<&str>,
        name: Option<&str>,
    ) -> Result<Self, DatasetError> {
        let mask_safe = self.mask_safe()?;
        let summed = |m: &Map| downsample_map(m, factor, axis_name, true, mask_safe);
        let exposure = match axis_name {
            None => Self::map_field(self.exposure()?, |m| m.downsample(factor, false, None))?,
            Some(_) => self.exposure()?.cloned(),
        };
        let edisp = match (self.edisp()?, axis_name) {
            (Some(edisp), Some("energy")) if !edisp.has_migra() => {
                let weights = self.mask_safe_edisp()?;
                Some(edisp.downsample_axis(factor, "energy", weights.as_ref())?)
            }
            (edisp, _) => edisp.cloned(),
        };

        let mut builder = self
            .derive(name)
            .counts(Self::map_field(self.counts()?, summed)?)
            .exposure(exposure)
            .psf(self.psf()?.cloned())
            .edisp(edisp)
            .mask_safe(Self::map_field(mask_safe, |m| {
                downsample_mask(m, factor, axis_name)
            })?)
            .mask_fit(Self::map_field(self.mask_fit()?, |m| {
                downsample_mask(m, factor, axis_name)
            })?);

        builder = match &self.background {
            Background::Cash(cash) => {
                builder.background(Self::map_field(cash.background.get()?, summed)?)
            }
            Background::OnOff(on_off) => {
                let counts_off = Self::map_field(on_off.counts_off.get()?, summed)?;
                let mut acceptance = None;
                let mut acceptance_off = None;
                if on_off.acceptance_off.get()?.is_some() {
                    acceptance = Self::map_field(on_off.acceptance.get()?, |m| {
                        downsample_map(m, factor, axis_name, false, None)
                    })?;
                    if let (Some(acc), Some(off), Some(background)) =
                        (&acceptance, &counts_off, self.background()?)
                    {
                        let background = summed(&background)?;
                        acceptance_off = Some(rescaled_acceptance_off(acc, off, &background)?);
                    }
                }
                builder.on_off(counts_off, acceptance, acceptance_off)
            }
        };
        builder.build()
    }

    /// Counts and background are padded with `mode`, exposure with its edge
    /// values and masks with false. Not supported for on/off datasets.
    fn pad(
        &self,
        width: usize,
        mode: PadMode<f64>,
        name: Option<&str>,
    ) -> Result<Self, DatasetError> {
        let Background::Cash(cash) = &self.background else {
            return Err(DatasetError::Unsupported(
                "padding an on/off dataset".to_string(),
            ));
        };
        let padded = |m: &Map| m.pad(width, mode.clone());
        let padded_mask = |m: &MaskMap| m.pad(width, PadMode::Constant(false));
        self.derive(name)
            .counts(Self::map_field(self.counts()?, padded)?)
            .exposure(Self::map_field(self.exposure()?, |m| {
                m.pad(width, PadMode::Edge)
            })?)
            .background(Self::map_field(cash.background.get()?, padded)?)
            .psf(self.psf()?.cloned())
            .edisp(self.edisp()?.cloned())
            .mask_safe(Self::map_field(self.mask_safe()?, padded_mask)?)
            .mask_fit(Self::map_field(self.mask_fit()?, padded_mask)?)
            .build()
    }

    fn slice_by_idx(
        &self,
        slices: &[(&str, AxisSlice)],
        name: Option<&str>,
    ) -> Result<Self, DatasetError> {
        let slice = |m: &Map| m.slice_by_idx(slices);
        let slice_mask = |m: &MaskMap| m.slice_by_idx(slices);
        let mut builder = self
            .derive(name)
            .counts(Self::map_field(self.counts()?, slice)?)
            .exposure(Self::map_field(self.exposure()?, slice)?)
            .psf(self.psf()?.map(|p| p.slice_by_idx(slices)).transpose()?)
            .edisp(self.edisp()?.map(|e| e.slice_by_idx(slices)).transpose()?)
            .mask_safe(Self::map_field(self.mask_safe()?, slice_mask)?)
            .mask_fit(Self::map_field(self.mask_fit()?, slice_mask)?);
        builder = match &self.background {
            Background::Cash(cash) => {
                builder.background(Self::map_field(cash.background.get()?, slice)?)
            }
            Background::OnOff(on_off) => builder.on_off(
                Self::map_field(on_off.counts_off.get()?, slice)?,
                Self::map_field(on_off.acceptance.get()?, slice)?,
                Self::map_field(on_off.acceptance_off.get()?, slice)?,
            ),
        };
        builder.build()
    }

    /// Counts and background are summed within the safe mask, masks are
    /// OR-merged. Exposure and PSF depend on true energy and are kept.
    fn resample_energy_axis(
        &self,
        energy_axis: &MapAxis,
        name: Option<&str>,
    ) -> Result<Self, DatasetError> {
        let mask_safe = self.mask_safe()?;
        let resample = |m: &Map| m.resample_axis(energy_axis, mask_safe);
        let resample_mask = |m: &MaskMap| m.resample_axis(energy_axis);
        let edisp = match self.edisp()? {
            Some(edisp) => {
                let weights = self.mask_safe_edisp()?;
                Some(edisp.resample_energy_axis(energy_axis, weights.as_ref())?)
            }
            None => None,
        };

        let mut builder = self
            .derive(name)
            .counts(Self::map_field(self.counts()?, resample)?)
            .exposure(self.exposure()?.cloned())
            .psf(self.psf()?.cloned())
            .edisp(edisp)
            .mask_safe(Self::map_field(mask_safe, resample_mask)?)
            .mask_fit(Self::map_field(self.mask_fit()?, resample_mask)?);

        builder = match &self.background {
            Background::Cash(cash) => {
                builder.background(Self::map_field(cash.background.get()?, resample)?)
            }
            Background::OnOff(on_off) => {
                let counts_off = Self::map_field(on_off.counts_off.get()?, resample)?;
                let acceptance = Self::map_field(on_off.acceptance.get()?, resample)?;
                let acceptance_off = match (&acceptance, &counts_off, self.background()?) {
                    (Some(acc), Some(off), Some(background)) => Some(rescaled_acceptance_off(
                        acc,
                        off,
                        &resample(&background)?,
                    )?),
                    _ => None,
                };
                builder.on_off(counts_off, acceptance, acceptance_off)
            }
        };
        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use skymaps::Geom;

    fn energy_axis() -> MapAxis {
        MapAxis::from_energy_bounds(0.1, 100.0, 6, "TeV", "energy").unwrap()
    }

    fn geom() -> Geom {
        Geom::create(SkyCoord::icrs(10.0, 0.0), 0.1, (10, 8), vec![energy_axis()]).unwrap()
    }

    fn cash_dataset() -> MapDataset {
        let mut mask = MaskMap::from_elem(geom(), true, "");
        mask.data_mut()
            .index_axis_mut(ndarray::Axis(0), 0)
            .fill(false);
        MapDataset::builder()
            .name("cash")
            .counts(Some(Map::from_elem(geom(), 1.0, "")))
            .background(Some(Map::from_elem(geom(), 0.5, "")))
            .mask_safe(Some(mask))
            .build()
            .unwrap()
    }

    fn on_off_dataset() -> MapDataset {
        MapDataset::builder()
            .name("on-off")
            .counts(Some(Map::from_elem(geom(), 1.0, "")))
            .on_off(
                Some(Map::from_elem(geom(), 8.0, "")),
                Some(Map::from_elem(geom(), 1.0, "")),
                Some(Map::from_elem(geom(), 4.0, "")),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn test_slice_by_energy() {
        let sliced = cash_dataset().slice_by_energy(Some(1.0), Some(10.0), None).unwrap();
        let axis = sliced.energy_axis().unwrap();
        assert_eq!(axis.nbin(), 2);
        assert_relative_eq!(axis.edges_min(), 1.0, epsilon = 1e-9);
        assert_relative_eq!(axis.edges_max(), 10.0, epsilon = 1e-9);
        assert_eq!(sliced.counts().unwrap().unwrap().data().shape(), &[2, 8, 10]);
    }

    #[test]
    fn test_to_image_sums_safe_counts() {
        let image = cash_dataset().to_image(Some("image")).unwrap();
        assert_eq!(image.name(), "image");
        let counts = image.counts().unwrap().unwrap();
        assert_eq!(counts.data().shape(), &[1, 8, 10]);
        // First energy bin is outside the safe range
        assert_relative_eq!(counts.data()[[0, 0, 0]], 5.0);
        assert!(image.mask_safe().unwrap().unwrap().data().iter().all(|v| *v));
    }

    #[test]
    fn test_downsample_spatial() {
        let dataset = cash_dataset();
        let down = dataset.downsample(2, None, None).unwrap();
        let counts = down.counts().unwrap().unwrap();
        assert_eq!(counts.data().shape(), &[6, 4, 5]);
        assert_relative_eq!(counts.data()[[1, 0, 0]], 4.0);
        assert_relative_eq!(counts.data()[[0, 0, 0]], 0.0);
    }

    #[test]
    fn test_downsample_energy() {
        let down = cash_dataset().downsample(3, Some("energy"), None).unwrap();
        assert_eq!(down.energy_axis().unwrap().nbin(), 2);
        let counts = down.counts().unwrap().unwrap();
        assert_relative_eq!(counts.data()[[0, 0, 0]], 2.0);
        assert_relative_eq!(counts.data()[[1, 0, 0]], 3.0);
    }

    #[test]
    fn test_pad() {
        let padded = cash_dataset()
            .pad(2, PadMode::Constant(0.0), None)
            .unwrap();
        let counts = padded.counts().unwrap().unwrap();
        assert_eq!(counts.data().shape(), &[6, 12, 14]);
        assert_relative_eq!(counts.sum(), 6.0 * 80.0);
        let mask = padded.mask_safe().unwrap().unwrap();
        assert!(!mask.data()[[1, 0, 0]]);

        let err = on_off_dataset()
            .pad(1, PadMode::Constant(0.0), None)
            .unwrap_err();
        assert!(matches!(err, DatasetError::Unsupported(_)));
    }

    #[test]
    fn test_on_off_resample_keeps_alpha() {
        let image = on_off_dataset().to_image(None).unwrap();
        assert!(image.is_on_off());
        for v in image.alpha().unwrap().data() {
            assert_relative_eq!(*v, 0.25, epsilon = 1e-12);
        }
        // The OFF background estimate is preserved
        let background = image.background().unwrap().unwrap();
        assert_relative_eq!(background.data()[[0, 0, 0]], 6.0 * 2.0, epsilon = 1e-9);
    }

    #[test]
    fn test_cutout_on_off() {
        let cut = on_off_dataset()
            .cutout(&SkyCoord::icrs(10.0, 0.0), (0.4, 0.4), None)
            .unwrap();
        assert_eq!(cut.counts_off().unwrap().unwrap().geom().npix(), (4, 4));
        assert_eq!(cut.acceptance_off().unwrap().unwrap().geom().npix(), (4, 4));
    }

    #[test]
    fn test_region_not_contained() {
        let region = SkyRegion::circle(SkyCoord::icrs(10.0, 0.38), 0.1);
        let err = cash_dataset().to_region_map_dataset(&region, None).unwrap_err();
        assert!(matches!(err, DatasetError::RegionNotContained));
    }

    #[test]
    fn test_mask_not_uniform() {
        let mut dataset = cash_dataset();
        let mut fit = MaskMap::from_elem(geom(), true, "");
        fit.data_mut()[[2, 4, 5]] = false;
        dataset.set_mask_fit(Some(fit));
        let region = SkyRegion::circle(SkyCoord::icrs(10.0, 0.0), 0.2);
        let err = dataset.to_region_map_dataset(&region, None).unwrap_err();
        assert!(matches!(err, DatasetError::MaskNotUniform));
    }

    #[test]
    fn test_to_region_map_dataset() {
        let dataset = cash_dataset();
        let region = SkyRegion::circle(SkyCoord::icrs(10.0, 0.0), 0.2);
        let n_inside = geom().region_mask(&region).iter().filter(|v| **v).count() as f64;
        let reduced = dataset.to_region_map_dataset(&region, None).unwrap();

        assert!(reduced.geom().unwrap().is_region());
        let counts = reduced.counts().unwrap().unwrap();
        assert_eq!(counts.data().shape(), &[6, 1, 1]);
        assert_relative_eq!(counts.data()[[0, 0, 0]], 0.0);
        assert_relative_eq!(counts.data()[[1, 0, 0]], n_inside);
        let background = reduced.background_map().unwrap().unwrap();
        assert_relative_eq!(background.data()[[1, 0, 0]], 0.5 * n_inside);
        assert!(!reduced.mask_safe().unwrap().unwrap().data()[[0, 0, 0]]);
    }

    #[test]
    fn test_containment_correction_needs_circle() {
        let region = SkyRegion::rectangle(SkyCoord::icrs(10.0, 0.0), 0.2, 0.2);
        let err = cash_dataset()
            .to_spectrum_dataset(&region, true, None)
            .unwrap_err();
        assert!(matches!(err, DatasetError::ContainmentCorrection(_)));

        let circle = SkyRegion::circle(SkyCoord::icrs(10.0, 0.0), 0.2);
        let err = cash_dataset()
            .to_spectrum_dataset(&circle, true, None)
            .unwrap_err();
        assert!(matches!(err, DatasetError::ContainmentCorrection(_)));
    }
}
