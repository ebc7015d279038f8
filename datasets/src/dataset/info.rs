//! Fit statistics, residuals, safe energy ranges and summary info.

use ndarray::{ArrayD, Axis, Zip};
use serde::Serialize;
use skymaps::{Map, MaskMap};
use std::fmt;

use super::{Background, MapDataset};
use crate::error::DatasetError;
use crate::stats::{cash, cash_sum, wstat, CashCountsStatistic, StatType, WStatCountsStatistic};

/// Residual definition used by [`MapDataset::residuals`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResidualMethod {
    /// `counts - npred`
    #[default]
    Diff,
    /// `(counts - npred) / npred`
    DiffOverModel,
    /// `(counts - npred) / sqrt(npred)`
    DiffOverSqrtModel,
}

/// Per-pixel reconstructed energy range of a mask.
///
/// Pixels without any true bin hold NaN.
#[derive(Debug, Clone)]
pub struct EnergyRange {
    pub energy_min: Map,
    pub energy_max: Map,
}

impl EnergyRange {
    /// Smallest minimum and largest maximum over all pixels, NaN if empty.
    pub fn total(&self) -> (f64, f64) {
        let min = self
            .energy_min
            .data()
            .iter()
            .filter(|v| v.is_finite())
            .fold(f64::NAN, |acc, v| acc.min(*v));
        let max = self
            .energy_max
            .data()
            .iter()
            .filter(|v| v.is_finite())
            .fold(f64::NAN, |acc, v| acc.max(*v));
        (min, max)
    }
}

/// On/off specific part of [`DatasetInfo`].
#[derive(Debug, Clone, Serialize)]
pub struct OnOffInfo {
    pub counts_off: f64,
    pub acceptance: f64,
    pub acceptance_off: f64,
    pub alpha: f64,
}

/// Summary statistics summed over energy.
///
/// Unavailable quantities are NaN and serialize as `null`.
#[derive(Debug, Clone, Serialize)]
pub struct DatasetInfo {
    pub name: String,
    pub counts: f64,
    pub excess: f64,
    pub sqrt_ts: f64,
    pub background: f64,
    pub npred: f64,
    pub npred_background: f64,
    pub npred_signal: f64,
    pub exposure_min: f64,
    pub exposure_max: f64,
    pub livetime: f64,
    pub ontime: f64,
    pub counts_rate: f64,
    pub background_rate: f64,
    pub excess_rate: f64,
    pub n_bins: usize,
    pub n_fit_bins: usize,
    pub stat_type: StatType,
    pub stat_sum: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_off: Option<OnOffInfo>,
}

impl fmt::Display for DatasetInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "MapDataset")?;
        writeln!(f, "----------")?;
        writeln!(f)?;
        writeln!(f, "  {:<32}: {}", "Name", self.name)?;
        writeln!(f)?;
        writeln!(f, "  {:<32}: {:.0}", "Total counts", self.counts)?;
        writeln!(f, "  {:<32}: {:.2}", "Total background counts", self.background)?;
        writeln!(f, "  {:<32}: {:.2}", "Total excess counts", self.excess)?;
        writeln!(f)?;
        writeln!(f, "  {:<32}: {:.2}", "Predicted counts", self.npred)?;
        writeln!(f, "  {:<32}: {:.2}", "Predicted background counts", self.npred_background)?;
        writeln!(f, "  {:<32}: {:.2}", "Predicted excess counts", self.npred_signal)?;
        writeln!(f)?;
        writeln!(f, "  {:<32}: {:.2e} m2 s", "Exposure min", self.exposure_min)?;
        writeln!(f, "  {:<32}: {:.2e} m2 s", "Exposure max", self.exposure_max)?;
        writeln!(f)?;
        writeln!(f, "  {:<32}: {}", "Number of total bins", self.n_bins)?;
        writeln!(f, "  {:<32}: {}", "Number of fit bins", self.n_fit_bins)?;
        writeln!(f)?;
        writeln!(f, "  {:<32}: {}", "Fit statistic type", self.stat_type)?;
        writeln!(f, "  {:<32}: {:.2}", "Fit statistic value (-2 log(L))", self.stat_sum)?;
        if let Some(on_off) = &self.on_off {
            writeln!(f)?;
            writeln!(f, "  {:<32}: {:.0}", "Total counts_off", on_off.counts_off)?;
            writeln!(f, "  {:<32}: {:.3}", "Acceptance", on_off.acceptance)?;
            writeln!(f, "  {:<32}: {:.3}", "Acceptance off", on_off.acceptance_off)?;
            writeln!(f, "  {:<32}: {:.3}", "Mean alpha", on_off.alpha)?;
        }
        Ok(())
    }
}

/// Flatten `map` to the values where `mask` is true, or all values.
fn select(map: &Map, mask: Option<&ArrayD<bool>>) -> ndarray::Array1<f64> {
    match mask {
        Some(mask) => map
            .data()
            .iter()
            .zip(mask.iter())
            .filter(|(_, m)| **m)
            .map(|(v, _)| *v)
            .collect(),
        None => map.data().iter().copied().collect(),
    }
}

impl MapDataset {
    /// Per-bin likelihood, Cash or WStat depending on the dataset type.
    pub fn stat_array(&self) -> Result<ArrayD<f64>, DatasetError> {
        let counts = self.require(self.counts()?, "counts")?;
        match &self.background {
            Background::Cash(_) => {
                let npred = self.npred()?;
                Ok(Zip::from(counts.data())
                    .and(npred.data())
                    .map_collect(|n, mu| cash(*n, *mu)))
            }
            Background::OnOff(on_off) => {
                let counts_off = self.require(on_off.counts_off.get()?, "counts_off")?;
                let alpha = self.alpha()?;
                let mu_sig = self.npred_signal(None, true)?;
                Ok(Zip::from(counts.data())
                    .and(counts_off.data())
                    .and(alpha.data())
                    .and(mu_sig.data())
                    .map_collect(|n_on, n_off, a, mu| wstat(*n_on, *n_off, *a, *mu, None, true)))
            }
        }
    }

    /// Likelihood summed over the bins of [`MapDataset::mask`].
    pub fn stat_sum(&self) -> Result<f64, DatasetError> {
        let mask = self.mask()?;
        let mask_data = mask.as_ref().map(|m| m.data());
        match &self.background {
            Background::Cash(_) => {
                let counts = self.require(self.counts()?, "counts")?;
                let npred = self.npred()?;
                let counts = select(counts, mask_data);
                let npred = select(&npred, mask_data);
                Ok(cash_sum(counts.iter(), npred.iter()))
            }
            Background::OnOff(_) => {
                let stat = self.stat_array()?;
                Ok(match mask_data {
                    Some(mask) => stat
                        .iter()
                        .zip(mask.iter())
                        .filter(|(_, m)| **m)
                        .map(|(v, _)| *v)
                        .sum(),
                    None => stat.sum(),
                })
            }
        }
    }

    /// Residuals between counts and predicted counts, NaN outside the mask.
    pub fn residuals(&self, method: ResidualMethod) -> Result<Map, DatasetError> {
        let counts = self.require(self.counts()?, "counts")?;
        let npred = self.npred()?;
        let mut residuals = counts.zip_with(&npred, |n, mu| match method {
            ResidualMethod::Diff => n - mu,
            ResidualMethod::DiffOverModel => (n - mu) / mu,
            ResidualMethod::DiffOverSqrtModel => (n - mu) / mu.sqrt(),
        })?;
        if let Some(mask) = self.mask()? {
            residuals = residuals.masked_nan(&mask)?;
        }
        Ok(residuals)
    }

    fn energy_range_of(&self, mask: Option<&MaskMap>) -> Result<EnergyRange, DatasetError> {
        let geom = self.geom()?;
        let axis = geom.axis("energy").or_else(|_| geom.axis("energy_true"))?;
        let edges = axis.edges();
        let nbin = axis.nbin();
        let image = geom.to_image();
        let (nx, ny) = image.npix();

        let (energy_min, energy_max) = match mask {
            Some(mask) => {
                let dim = Axis(mask.geom().data_axis_index(axis.name())?);
                let data = mask.data();
                // Collapse any further non-spatial axes before scanning energy.
                let lanes = data
                    .view()
                    .into_shape((data.len() / (ny * nx * nbin), nbin, ny, nx));
                let mut emin = ndarray::Array2::from_elem((ny, nx), f64::NAN);
                let mut emax = ndarray::Array2::from_elem((ny, nx), f64::NAN);
                match (dim.index(), lanes) {
                    (d, Ok(lanes)) if d + 3 == data.ndim() => {
                        for iy in 0..ny {
                            for ix in 0..nx {
                                let safe: Vec<bool> = (0..nbin)
                                    .map(|ie| lanes.slice(ndarray::s![.., ie, iy, ix]).iter().any(|v| *v))
                                    .collect();
                                if let Some(first) = safe.iter().position(|v| *v) {
                                    emin[[iy, ix]] = edges[first];
                                }
                                if let Some(last) = safe.iter().rposition(|v| *v) {
                                    emax[[iy, ix]] = edges[last + 1];
                                }
                            }
                        }
                    }
                    _ => {
                        return Err(DatasetError::Unsupported(format!(
                            "energy range of a mask with axes {:?}",
                            mask.geom().axes().names()
                        )))
                    }
                }
                (emin, emax)
            }
            None => (
                ndarray::Array2::from_elem((ny, nx), axis.edges_min()),
                ndarray::Array2::from_elem((ny, nx), axis.edges_max()),
            ),
        };
        let unit = axis.unit().to_string();
        Ok(EnergyRange {
            energy_min: Map::from_data(image.clone(), energy_min.into_dyn(), &unit)?,
            energy_max: Map::from_data(image, energy_max.into_dyn(), &unit)?,
        })
    }

    /// Energy range of [`MapDataset::mask`].
    pub fn energy_range(&self) -> Result<EnergyRange, DatasetError> {
        self.energy_range_of(self.mask()?.as_ref())
    }

    pub fn energy_range_safe(&self) -> Result<EnergyRange, DatasetError> {
        self.energy_range_of(self.mask_safe()?)
    }

    pub fn energy_range_fit(&self) -> Result<EnergyRange, DatasetError> {
        self.energy_range_of(self.mask_fit()?)
    }

    /// Summary statistics, summed over the safe bins when `in_safe_data_range`.
    pub fn info(&self, in_safe_data_range: bool) -> Result<DatasetInfo, DatasetError> {
        let mask_safe = self.mask_safe()?;
        let mask = if in_safe_data_range {
            mask_safe.map(|m| m.data())
        } else {
            None
        };
        let sum = |map: &Map| select(map, mask).sum();
        let mask_flat: Option<Vec<bool>> = mask.map(|m| m.iter().copied().collect());

        let counts_map = self.counts()?;
        let background_map = self.background()?;
        let mut counts = 0.0;
        let (mut background, mut excess, mut sqrt_ts) = (f64::NAN, f64::NAN, f64::NAN);
        let mut on_off_info = None;

        if let Some(counts_map) = counts_map {
            counts = sum(counts_map);
            if let Some(background_map) = &background_map {
                background = sum(background_map);
                let n_on: ndarray::Array1<f64> = counts_map.data().iter().copied().collect();
                match &self.background {
                    Background::Cash(_) => {
                        let mu_bkg = self.npred_background()?.into_data().into_iter().collect();
                        let stat = CashCountsStatistic::new(n_on, mu_bkg).sum(mask_flat.as_deref());
                        excess = stat.n_sig()[0];
                        sqrt_ts = stat.sqrt_ts()[0];
                    }
                    Background::OnOff(on_off) => {
                        let counts_off = self.require(on_off.counts_off.get()?, "counts_off")?;
                        let n_off = counts_off.data().iter().copied().collect();
                        let alpha = self.alpha()?.into_data().into_iter().collect();
                        let stat = WStatCountsStatistic::new(n_on, n_off, alpha, None)
                            .sum(mask_flat.as_deref());
                        excess = stat.n_sig()[0];
                        sqrt_ts = stat.sqrt_ts()[0];
                        let acceptance = match on_off.acceptance.get()? {
                            Some(acceptance) => sum(acceptance),
                            None => 1.0,
                        };
                        let (alpha, acceptance_off) = match on_off.acceptance_off.get()? {
                            Some(_) => (stat.alpha[0], acceptance / stat.alpha[0]),
                            None => (f64::NAN, f64::NAN),
                        };
                        on_off_info = Some(OnOffInfo {
                            counts_off: stat.n_off[0],
                            acceptance,
                            acceptance_off,
                            alpha,
                        });
                    }
                }
            }
        }

        let has_models = self.models.as_ref().is_some_and(|m| !m.is_empty());
        let npred = if has_models || !background.is_nan() {
            sum(&self.npred()?)
        } else {
            f64::NAN
        };
        let npred_background = if background_map.is_some() {
            sum(&self.npred_background()?)
        } else {
            f64::NAN
        };
        let npred_signal = if has_models && self.exposure()?.is_some() {
            sum(&self.npred_signal(None, true)?)
        } else {
            f64::NAN
        };

        let (mut exposure_min, mut exposure_max, mut livetime) = (f64::NAN, f64::NAN, f64::NAN);
        if let Some(exposure) = self.exposure()? {
            let spatial: Vec<bool> = self.mask_safe_image()?.data().iter().copied().collect();
            let values: Vec<f64> = exposure
                .data()
                .iter()
                .enumerate()
                .filter(|(i, v)| **v > 0.0 && spatial[i % spatial.len()])
                .map(|(_, v)| *v)
                .collect();
            let values = if values.is_empty() {
                exposure.data().iter().copied().collect()
            } else {
                values
            };
            exposure_min = values.iter().fold(f64::INFINITY, |a, v| a.min(*v));
            exposure_max = values.iter().fold(f64::NEG_INFINITY, |a, v| a.max(*v));
            livetime = exposure.meta().get("livetime").copied().unwrap_or(f64::NAN);
        }

        let ontime = match &self.gti {
            Some(gti) if !gti.is_empty() => gti.time_sum(),
            _ => f64::NAN,
        };

        let n_bins = counts_map.map_or(0, |c| c.data().len());
        let n_fit_bins = self.mask()?.map_or(0, |m| m.count());
        let stat_sum = match (&self.background, counts_map) {
            (Background::OnOff(_), Some(_)) => self.stat_sum()?,
            (Background::Cash(_), Some(_)) if self.models.is_some() => self.stat_sum()?,
            _ => f64::NAN,
        };

        Ok(DatasetInfo {
            name: self.name.clone(),
            counts,
            excess,
            sqrt_ts,
            background,
            npred,
            npred_background,
            npred_signal,
            exposure_min,
            exposure_max,
            livetime,
            ontime,
            counts_rate: counts / livetime,
            background_rate: background / livetime,
            excess_rate: excess / livetime,
            n_bins,
            n_fit_bins,
            stat_type: self.stat_type(),
            stat_sum,
            on_off: on_off_info,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use skymaps::{Geom, MapAxis, SkyCoord};

    fn geom() -> Geom {
        let energy = MapAxis::from_energy_bounds(1.0, 100.0, 4, "TeV", "energy").unwrap();
        Geom::create(SkyCoord::icrs(0.0, 0.0), 0.1, (4, 3), vec![energy]).unwrap()
    }

    fn cash_dataset() -> MapDataset {
        let mut mask = MaskMap::from_elem(geom(), true, "");
        mask.data_mut().index_axis_mut(Axis(0), 3).fill(false);
        let mut exposure = Map::from_elem(geom(), 1e9, "m2 s");
        exposure.meta_mut().insert("livetime".to_string(), 100.0);
        MapDataset::builder()
            .name("info")
            .counts(Some(Map::from_elem(geom(), 3.0, "")))
            .background(Some(Map::from_elem(geom(), 2.0, "")))
            .exposure(Some(exposure))
            .mask_safe(Some(mask))
            .build()
            .unwrap()
    }

    #[test]
    fn test_stat_sum_masks_bins() {
        let dataset = cash_dataset();
        let per_bin = cash(3.0, 2.0);
        let stat = dataset.stat_array().unwrap();
        assert_eq!(stat.len(), 48);
        assert_relative_eq!(stat[[0, 0, 0]], per_bin, epsilon = 1e-12);
        assert_relative_eq!(dataset.stat_sum().unwrap(), 36.0 * per_bin, epsilon = 1e-9);
    }

    #[test]
    fn test_residuals() {
        let dataset = cash_dataset();
        let diff = dataset.residuals(ResidualMethod::Diff).unwrap();
        assert_relative_eq!(diff.data()[[0, 0, 0]], 1.0);
        assert!(diff.data()[[3, 0, 0]].is_nan());

        let sqrt = dataset.residuals(ResidualMethod::DiffOverSqrtModel).unwrap();
        assert_relative_eq!(sqrt.data()[[1, 1, 1]], 1.0 / 2f64.sqrt(), epsilon = 1e-12);
        let model = dataset.residuals(ResidualMethod::DiffOverModel).unwrap();
        assert_relative_eq!(model.data()[[1, 1, 1]], 0.5, epsilon = 1e-12);
    }

    #[test]
    fn test_energy_range_safe() {
        let mut dataset = cash_dataset();
        let mut mask = dataset.mask_safe().unwrap().unwrap().clone();
        mask.data_mut()[[0, 1, 2]] = false;
        mask.data_mut()
            .index_axis_mut(Axis(2), 0)
            .fill(false);
        dataset.set_mask_safe(Some(mask));

        let range = dataset.energy_range_safe().unwrap();
        assert_relative_eq!(range.energy_min.data()[[0, 3]], 1.0, epsilon = 1e-9);
        assert_relative_eq!(range.energy_min.data()[[1, 2]], 100f64.powf(0.25), epsilon = 1e-9);
        assert_relative_eq!(range.energy_max.data()[[0, 3]], 100f64.powf(0.75), epsilon = 1e-9);
        assert!(range.energy_min.data()[[0, 0]].is_nan());

        let (min, max) = range.total();
        assert_relative_eq!(min, 1.0, epsilon = 1e-9);
        assert_relative_eq!(max, 100f64.powf(0.75), epsilon = 1e-9);
    }

    #[test]
    fn test_energy_range_without_mask() {
        let dataset = MapDataset::builder()
            .counts(Some(Map::from_geom(geom(), "")))
            .build()
            .unwrap();
        let (min, max) = dataset.energy_range().unwrap().total();
        assert_relative_eq!(min, 1.0, epsilon = 1e-9);
        assert_relative_eq!(max, 100.0, epsilon = 1e-9);
    }

    #[test]
    fn test_info_cash() {
        let info = cash_dataset().info(true).unwrap();
        assert_relative_eq!(info.counts, 108.0);
        assert_relative_eq!(info.background, 72.0);
        assert_relative_eq!(info.excess, 36.0);
        assert!(info.sqrt_ts > 0.0);
        assert_relative_eq!(info.npred, 72.0);
        assert!(info.npred_signal.is_nan());
        assert_relative_eq!(info.livetime, 100.0);
        assert_relative_eq!(info.counts_rate, 1.08);
        assert_relative_eq!(info.exposure_min, 1e9);
        assert_eq!(info.n_bins, 48);
        assert_eq!(info.n_fit_bins, 36);
        assert_eq!(info.stat_type, StatType::Cash);
        assert!(info.stat_sum.is_nan());
        assert!(info.on_off.is_none());

        let text = info.to_string();
        assert!(text.contains("Total counts"));
        assert!(text.contains("cash"));
    }

    #[test]
    fn test_info_on_off() {
        let dataset = MapDataset::builder()
            .name("on-off")
            .counts(Some(Map::from_elem(geom(), 5.0, "")))
            .on_off(
                Some(Map::from_elem(geom(), 10.0, "")),
                Some(Map::from_elem(geom(), 1.0, "")),
                Some(Map::from_elem(geom(), 5.0, "")),
            )
            .build()
            .unwrap();
        let info = dataset.info(false).unwrap();
        let on_off = info.on_off.as_ref().unwrap();
        assert_relative_eq!(on_off.counts_off, 480.0);
        assert_relative_eq!(on_off.alpha, 0.2, epsilon = 1e-12);
        assert_relative_eq!(on_off.acceptance, 48.0);
        assert_relative_eq!(on_off.acceptance_off, 240.0, epsilon = 1e-9);
        assert_relative_eq!(info.background, 96.0, epsilon = 1e-9);
        assert_relative_eq!(info.excess, 240.0 - 96.0, epsilon = 1e-9);
        assert_eq!(info.stat_type, StatType::WStat);
        assert!(info.stat_sum.is_finite());

        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["stat_type"], "wstat");
        assert!(json["livetime"].is_null());
    }
}
