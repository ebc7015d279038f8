//! Predicted counts: model signal, background and their sum.

use log::debug;
use ndarray::{ArrayD, Axis, IxDyn};
use skymaps::{Geom, Map, MapAxis};

use super::{Background, CashBackground, MapDataset, OnOffBackground};
use crate::error::DatasetError;
use crate::evaluator::{psf_kernel_geom, EvaluatorInputs, MapEvaluator};
use crate::stats::get_wstat_mu_bkg;

impl MapDataset {
    /// Evaluator for `model_name`, with the PSF kernel built once when the
    /// PSF does not vary over the field.
    pub(crate) fn new_evaluator(
        &self,
        model_name: &str,
        geom: &Geom,
    ) -> Result<MapEvaluator, DatasetError> {
        match self.psf()? {
            Some(psf) if psf.is_position_independent() && !geom.is_region() => {
                let kernel = psf.get_psf_kernel(
                    &psf_kernel_geom(geom, self.exposure()?)?,
                    None,
                    self.config.psf_max_radius,
                    self.config.psf_upsample_factor,
                )?;
                Ok(MapEvaluator::with_precomputed_psf(model_name, kernel))
            }
            _ => Ok(MapEvaluator::new(model_name)),
        }
    }

    /// Predicted counts from the sky models.
    ///
    /// # Arguments
    /// * `model_names` - Models to include, all models when `None`
    /// * `stack` - Sum the models; otherwise return one slice per contributing
    ///   model along a trailing `models` label axis. Without any contributing
    ///   model the result is the all-zero map of the dataset geometry.
    pub fn npred_signal(
        &self,
        model_names: Option<&[&str]>,
        stack: bool,
    ) -> Result<Map, DatasetError> {
        let geom = self.geom()?;
        let zeros = || Map::from_geom(geom.clone(), "");
        let Some(models) = &self.models else {
            return Ok(zeros());
        };
        let names: Vec<&str> = match model_names {
            Some(names) => {
                for name in names {
                    models.get(name)?;
                }
                names.to_vec()
            }
            None => models.names(),
        };
        if names.is_empty() {
            return Ok(zeros());
        }

        let exposure = self.require(self.exposure()?, "exposure")?;
        let mask_image = match self.mask()? {
            Some(_) => Some(self.mask_image()?),
            None => None,
        };
        let inputs = EvaluatorInputs {
            geom,
            exposure,
            psf: self.psf()?,
            edisp: self.edisp()?,
            mask_image: mask_image.as_ref(),
        };

        let mut evaluators = self.evaluators.borrow_mut();
        let mut total = zeros();
        let mut per_model = Vec::with_capacity(names.len());
        for name in &names {
            let model = models.get(name)?;
            let idx = match evaluators.iter().position(|e| e.model_name() == *name) {
                Some(idx) => idx,
                None => {
                    evaluators.push(self.new_evaluator(name, geom)?);
                    evaluators.len() - 1
                }
            };
            let evaluator = &mut evaluators[idx];
            if evaluator.needs_update(model, self.revision) {
                evaluator.update(inputs, model, &self.config, self.revision)?;
            }

            if !evaluator.contributes() {
                continue;
            }
            let mut npred = zeros();
            npred.stack(&evaluator.compute_npred(model, &self.config)?, None, true)?;
            if !self.config.use_npred_cache {
                evaluator.reset_cache();
            }
            if stack {
                total = total.checked_add(&npred)?;
            } else {
                per_model.push((name.to_string(), npred.into_data()));
            }
        }

        if stack || per_model.is_empty() {
            return Ok(total);
        }
        let labels = per_model.iter().map(|(name, _)| name.clone()).collect();
        let mut axes = geom.axes().to_vec();
        axes.push(MapAxis::from_labels(labels, "models")?);
        let cube = geom.to_image().to_cube(axes)?;
        let mut data = ArrayD::zeros(IxDyn(&cube.data_shape()));
        for (mut lane, (_, npred)) in data.axis_iter_mut(Axis(0)).zip(&per_model) {
            lane.assign(npred);
        }
        Ok(Map::from_data(cube, data, "")?)
    }

    fn cash_background(
        &self,
        cash: &CashBackground,
        geom: &Geom,
    ) -> Result<Map, DatasetError> {
        let Some(background) = cash.background.get()? else {
            return Ok(Map::from_geom(geom.clone(), ""));
        };
        let Some(model) = self
            .models
            .as_ref()
            .and_then(|m| m.background_model(&self.name))
        else {
            return Ok(background.clone());
        };

        let parameters = model.parameters();
        if self.config.use_npred_cache {
            if let Some((cached, values)) = &*cash.cache.borrow() {
                if cached.matches(&parameters) {
                    return Ok(values.clone());
                }
            }
        }
        let mut values = background.clone();
        values.mul_assign_data(&model.evaluate_geom(background.geom())?)?;
        debug!(
            "Dataset '{}': evaluated background model {}",
            self.name,
            model.name()
        );
        *cash.cache.borrow_mut() = Some((parameters, values.clone()));
        Ok(values)
    }

    /// WStat profile background in the ON region given the signal prediction.
    fn on_off_background(
        &self,
        on_off: &OnOffBackground,
        geom: &Geom,
        npred_signal: &Map,
    ) -> Result<Map, DatasetError> {
        let Some(counts_off) = on_off.counts_off.get()? else {
            return Ok(Map::from_geom(geom.clone(), ""));
        };
        let counts = self.require(self.counts()?, "counts")?;
        let alpha = self.alpha()?;
        for map in [counts_off, &alpha, npred_signal] {
            super::check_shape(counts, map)?;
        }
        let mut mu_bkg = counts.clone();
        ndarray::Zip::from(mu_bkg.data_mut())
            .and(counts_off.data())
            .and(alpha.data())
            .and(npred_signal.data())
            .for_each(|n_on, &n_off, &alpha, &mu_sig| {
                *n_on = alpha * get_wstat_mu_bkg(*n_on, n_off, alpha, mu_sig);
            });
        mu_bkg.nan_to_num();
        Ok(mu_bkg.with_unit(""))
    }

    /// Predicted background counts.
    ///
    /// With a background map this is the map scaled by the dataset's FoV
    /// background model, cached while the model parameters are unchanged.
    /// On/off datasets return `alpha` times the WStat profile background.
    /// Zero when no background is available.
    pub fn npred_background(&self) -> Result<Map, DatasetError> {
        let geom = self.geom()?;
        match &self.background {
            Background::Cash(cash) => self.cash_background(cash, geom),
            Background::OnOff(on_off) => {
                let signal = self.npred_signal(None, true)?;
                self.on_off_background(on_off, geom, &signal)
            }
        }
    }

    /// Total predicted counts, clipped at zero.
    pub fn npred(&self) -> Result<Map, DatasetError> {
        let geom = self.geom()?;
        let mut npred = self.npred_signal(None, true)?;
        let background = match &self.background {
            Background::Cash(cash) if cash.background.get()?.is_some() => {
                Some(self.cash_background(cash, geom)?)
            }
            Background::OnOff(on_off) if on_off.counts_off.get()?.is_some() => {
                Some(self.on_off_background(on_off, geom, &npred)?)
            }
            _ => None,
        };
        if let Some(background) = background {
            npred = npred.checked_add(&background)?;
        }
        npred.clip_min(0.0);
        Ok(npred)
    }

    /// Exposure ratio of the ON and OFF regions, non-finite values set to zero.
    pub fn alpha(&self) -> Result<Map, DatasetError> {
        let on_off = self.on_off_maps()?;
        let acceptance = self.require(on_off.acceptance.get()?, "acceptance")?;
        let acceptance_off = self.require(on_off.acceptance_off.get()?, "acceptance_off")?;
        let mut alpha = acceptance.checked_div(acceptance_off)?;
        alpha.nan_to_num();
        Ok(alpha.with_unit(""))
    }

    /// Background estimate.
    ///
    /// The stored background map, or `alpha * counts_off` for on/off datasets.
    pub fn background(&self) -> Result<Option<Map>, DatasetError> {
        match &self.background {
            Background::Cash(cash) => Ok(cash.background.get()?.cloned()),
            Background::OnOff(on_off) => match on_off.counts_off.get()? {
                Some(counts_off) => Ok(Some(self.alpha()?.checked_mul(counts_off)?)),
                None => Ok(None),
            },
        }
    }

    /// Predicted counts in the OFF region.
    pub fn npred_off(&self) -> Result<Map, DatasetError> {
        let mut npred_off = self.npred_background()?.checked_div(&self.alpha()?)?;
        npred_off.nan_to_num();
        Ok(npred_off)
    }
}
