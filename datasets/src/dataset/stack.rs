//! In-place stacking of datasets.

use log::debug;
use ndarray::Zip;
use skymaps::Map;

use super::{Background, MapDataset};
use crate::error::DatasetError;

impl MapDataset {
    /// Stack `other` into this dataset, replacing non-finite contributions by zero.
    ///
    /// Contributions of `other` are restricted to its safe bins; this dataset
    /// is not masked. Use [`MapDataset::to_masked`] first to mask it.
    pub fn stack(&mut self, other: &MapDataset) -> Result<(), DatasetError> {
        self.stack_with(other, true)
    }

    /// Stack `other` into this dataset.
    ///
    /// # Arguments
    /// * `other` - Dataset of the same type (Cash or on/off)
    /// * `nan_to_num` - Replace non-finite values of `other` by zero
    pub fn stack_with(&mut self, other: &MapDataset, nan_to_num: bool) -> Result<(), DatasetError> {
        debug!("Stacking dataset '{}' into '{}'", other.name, self.name);
        match (&self.background, &other.background) {
            (Background::Cash(_), Background::Cash(_)) => self.stack_base(other, nan_to_num),
            (Background::OnOff(_), Background::OnOff(_)) => self.stack_on_off(other, nan_to_num),
            _ => Err(DatasetError::IncompatibleTypes(format!(
                "cannot stack a {} dataset into a {} dataset",
                other.stat_type(),
                self.stat_type()
            ))),
        }
    }

    /// Copy of the dataset with every role-map masked by `mask_safe`.
    pub fn to_masked(&self, name: Option<&str>) -> Result<MapDataset, DatasetError> {
        let mut dataset = self.empty_like(name)?;
        dataset.stack(self)?;
        Ok(dataset)
    }

    fn stack_base(&mut self, other: &MapDataset, nan_to_num: bool) -> Result<(), DatasetError> {
        let other_mask_safe = other.mask_safe()?;

        if let (Some(counts), Some(other_counts)) = (self.counts.get_mut()?, other.counts()?) {
            counts.stack(other_counts, other_mask_safe, nan_to_num)?;
        }

        if let (Some(exposure), Some(other_exposure)) = (self.exposure.get_mut()?, other.exposure()?)
        {
            let mask_image = other.mask_safe_image()?;
            exposure.stack(other_exposure, Some(&mask_image), nan_to_num)?;
            if let Some(livetime) = other_exposure.meta().get("livetime") {
                if mask_image.any() {
                    *exposure
                        .meta_mut()
                        .entry("livetime".to_string())
                        .or_insert(0.0) += livetime;
                }
            }
        }

        let stack_background = match (&self.background, &other.background) {
            (Background::Cash(a), Background::Cash(b)) => {
                a.background.get()?.is_some() && b.background.get()?.is_some()
            }
            _ => false,
        };
        if stack_background {
            let mut background = self.npred_background()?;
            background.stack(&other.npred_background()?, other_mask_safe, nan_to_num)?;
            if let Background::Cash(cash) = &mut self.background {
                cash.background.set(Some(background));
                cash.cache.get_mut().take();
            }
        }

        if let Some(other_psf) = other.psf()? {
            let weights = other.mask_safe_psf()?;
            if let Some(psf) = self.psf.get_mut()? {
                psf.stack(other_psf, weights.as_ref(), nan_to_num)?;
            }
        }

        if let Some(other_edisp) = other.edisp()? {
            let weights = other.mask_safe_edisp()?;
            if let Some(edisp) = self.edisp.get_mut()? {
                edisp.stack(other_edisp, weights.as_ref(), nan_to_num)?;
            }
        }

        if let (Some(mask), Some(other_mask)) = (self.mask_safe.get_mut()?, other_mask_safe) {
            mask.stack(other_mask)?;
        }

        if let Some(other_fit) = other.mask_fit()? {
            match self.mask_fit.get_mut()? {
                Some(mask) => mask.stack(other_fit)?,
                None => self.mask_fit.set(Some(other_fit.clone())),
            }
        }

        if let (Some(gti), Some(other_gti)) = (&mut self.gti, &other.gti) {
            gti.stack(other_gti);
            *gti = gti.union();
        }

        self.meta_table = match (&self.meta_table, &other.meta_table) {
            (Some(table), Some(other_table)) => Some(table.hstack(other_table)),
            (None, Some(other_table)) => Some(other_table.clone()),
            (table, None) => table.clone(),
        };

        self.evaluators.get_mut().clear();
        self.touch();
        Ok(())
    }

    /// Whether the dataset holds enough on/off information to be stacked.
    ///
    /// Incomplete datasets are accepted as long as no bin is safe.
    fn is_stackable(&self) -> Result<bool, DatasetError> {
        let complete = self.counts_off()?.is_some()
            && self.acceptance()?.is_some()
            && self.acceptance_off()?.is_some();
        let unmasked = match self.mask_safe()? {
            Some(mask) => mask.any(),
            None => true,
        };
        Ok(complete || !unmasked)
    }

    /// OFF counts and `alpha * counts_off`, when both can be formed.
    fn weighted_off(&self) -> Result<Option<(&Map, Map)>, DatasetError> {
        let Some(counts_off) = self.counts_off()? else {
            return Ok(None);
        };
        if self.acceptance()?.is_none() || self.acceptance_off()?.is_none() {
            return Ok(None);
        }
        let alpha_off = self.alpha()?.checked_mul(counts_off)?;
        Ok(Some((counts_off, alpha_off)))
    }

    /// Stack on/off datasets, rescaling `acceptance_off` so that the stacked
    /// alpha is the OFF-counts weighted mean of the individual alphas.
    fn stack_on_off(&mut self, other: &MapDataset, nan_to_num: bool) -> Result<(), DatasetError> {
        for dataset in [&*self, other] {
            if !dataset.is_stackable()? {
                return Err(DatasetError::Stacking(format!(
                    "dataset '{}', it has safe bins but no counts_off, acceptance or acceptance_off",
                    dataset.name
                )));
            }
        }

        let geom = self.geom()?.clone();
        let other_mask = other.mask_safe()?;
        let mut total_off = Map::<f64>::from_geom(geom.clone(), "");
        let mut total_alpha = Map::<f64>::from_geom(geom.clone(), "");
        let mut total_acceptance = Map::<f64>::from_geom(geom, "");

        if let Some(acceptance) = self.acceptance()? {
            total_acceptance.stack(acceptance, None, nan_to_num)?;
        }
        if let Some(acceptance) = other.acceptance()? {
            total_acceptance.stack(acceptance, other_mask, nan_to_num)?;
        }
        if let Some((counts_off, alpha_off)) = self.weighted_off()? {
            total_off.stack(counts_off, None, nan_to_num)?;
            total_alpha.stack(&alpha_off, None, nan_to_num)?;
        }
        if let Some((counts_off, alpha_off)) = other.weighted_off()? {
            total_off.stack(counts_off, other_mask, nan_to_num)?;
            total_alpha.stack(&alpha_off, other_mask, nan_to_num)?;
        }

        let mut acceptance_off = total_acceptance
            .checked_mul(&total_off)?
            .checked_div(&total_alpha)?;
        // Bins without OFF counts fall back to the OFF-weighted mean alpha
        let average_alpha = total_alpha.sum() / total_off.sum();
        Zip::from(acceptance_off.data_mut())
            .and(total_off.data())
            .and(total_acceptance.data())
            .for_each(|acc_off, &off, &acc| {
                if off == 0.0 {
                    *acc_off = acc / average_alpha;
                }
            });

        let on_off = self.on_off_maps_mut()?;
        on_off.acceptance.set(Some(total_acceptance));
        on_off.acceptance_off.set(Some(acceptance_off));
        on_off.counts_off.set(Some(total_off));
        self.stack_base(other, nan_to_num)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use skymaps::{Geom, Gti, MapAxis, MaskMap, MetaTable, MetaValue, SkyCoord};

    fn geom() -> Geom {
        let energy = MapAxis::from_energy_bounds(1.0, 10.0, 2, "TeV", "energy").unwrap();
        Geom::create(SkyCoord::icrs(0.0, 0.0), 0.1, (4, 4), vec![energy]).unwrap()
    }

    fn cash_dataset(name: &str, counts: f64, safe: bool, livetime: f64) -> MapDataset {
        let mut exposure = Map::from_elem(geom(), 1.0, "m2 s");
        exposure.meta_mut().insert("livetime".to_string(), livetime);
        MapDataset::builder()
            .name(name)
            .counts(Some(Map::from_elem(geom(), counts, "")))
            .exposure(Some(exposure))
            .background(Some(Map::from_elem(geom(), 0.5, "")))
            .mask_safe(Some(MaskMap::from_elem(geom(), safe, "")))
            .gti(Some(Gti::create(&[0.0], &[10.0], 55555.0)))
            .meta_table(Some(MetaTable::from_row(vec![(
                "OBS_ID",
                MetaValue::Int(name.len() as i64),
            )])))
            .build()
            .unwrap()
    }

    fn on_off_dataset(counts_off: f64, acceptance_off: f64) -> MapDataset {
        MapDataset::builder()
            .counts(Some(Map::from_elem(geom(), 3.0, "")))
            .mask_safe(Some(MaskMap::from_elem(geom(), true, "")))
            .on_off(
                Some(Map::from_elem(geom(), counts_off, "")),
                Some(Map::from_elem(geom(), 1.0, "")),
                Some(Map::from_elem(geom(), acceptance_off, "")),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn test_stack_cash() {
        let mut stacked = cash_dataset("a", 1.0, true, 100.0);
        let other = cash_dataset("bb", 2.0, true, 50.0);
        stacked.stack(&other).unwrap();

        assert_relative_eq!(stacked.counts().unwrap().unwrap().sum(), 3.0 * 32.0);
        assert_relative_eq!(stacked.background_map().unwrap().unwrap().sum(), 32.0);
        let exposure = stacked.exposure().unwrap().unwrap();
        assert_relative_eq!(exposure.meta()["livetime"], 150.0);
        assert_eq!(stacked.gti().unwrap().len(), 1);
        assert_eq!(stacked.meta_table().unwrap().n_rows(), 2);
    }

    #[test]
    fn test_stack_drops_unsafe_bins() {
        let mut stacked = cash_dataset("a", 1.0, true, 100.0);
        let other = cash_dataset("b", 2.0, false, 50.0);
        stacked.stack(&other).unwrap();

        assert_relative_eq!(stacked.counts().unwrap().unwrap().sum(), 32.0);
        let exposure = stacked.exposure().unwrap().unwrap();
        assert_relative_eq!(exposure.sum(), 32.0);
        // Livetime is only added when the other dataset has safe pixels
        assert_relative_eq!(exposure.meta()["livetime"], 100.0);
    }

    #[test]
    fn test_stack_adopts_mask_fit() {
        let mut stacked = cash_dataset("a", 1.0, true, 1.0);
        let mut other = cash_dataset("b", 1.0, true, 1.0);
        other.set_mask_fit(Some(MaskMap::from_elem(geom(), true, "")));
        stacked.stack(&other).unwrap();
        assert_eq!(stacked.mask_fit().unwrap().unwrap().count(), 32);
    }

    #[test]
    fn test_stack_type_mismatch() {
        let mut cash = cash_dataset("a", 1.0, true, 1.0);
        let on_off = on_off_dataset(4.0, 4.0);
        let err = cash.stack(&on_off).unwrap_err();
        assert!(matches!(err, DatasetError::IncompatibleTypes(_)));
    }

    #[test]
    fn test_stack_on_off_acceptance_off() {
        // alpha 0.25 with 4 OFF counts, alpha 0.5 with 12 OFF counts
        let mut stacked = on_off_dataset(4.0, 4.0);
        let other = on_off_dataset(12.0, 2.0);
        stacked.stack(&other).unwrap();

        let expected_alpha = (0.25 * 4.0 + 0.5 * 12.0) / 16.0;
        for v in stacked.alpha().unwrap().data() {
            assert_relative_eq!(*v, expected_alpha, epsilon = 1e-12);
        }
        for v in stacked.counts_off().unwrap().unwrap().data() {
            assert_relative_eq!(*v, 16.0);
        }
        for v in stacked.acceptance().unwrap().unwrap().data() {
            assert_relative_eq!(*v, 2.0);
        }
    }

    #[test]
    fn test_stack_incomplete_on_off() {
        let mut stacked = on_off_dataset(4.0, 4.0);
        let incomplete = MapDataset::builder()
            .counts(Some(Map::from_elem(geom(), 3.0, "")))
            .on_off(Some(Map::from_elem(geom(), 1.0, "")), None, None)
            .build()
            .unwrap();
        let err = stacked.stack(&incomplete).unwrap_err();
        assert!(matches!(err, DatasetError::Stacking(_)));

        let mut masked = incomplete.clone();
        masked.set_mask_safe(Some(MaskMap::from_elem(geom(), false, "")));
        stacked.stack(&masked).unwrap();
        assert_relative_eq!(stacked.counts().unwrap().unwrap().sum(), 3.0 * 32.0);
    }
}
