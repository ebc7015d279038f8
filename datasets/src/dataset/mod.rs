//! Binned datasets for likelihood fitting of sky maps.
//!
//! A [`MapDataset`] holds the role-maps of one observation (or of several
//! stacked observations): counts, exposure, PSF, energy dispersion, safe and
//! fit masks, and a background description. The background strategy is
//! chosen by the [`Background`] discriminant: a background map scaled by an
//! optional FoV background model (Cash statistic) or OFF counts with ON/OFF
//! acceptances (WStat statistic).

mod create;
mod info;
mod persist;
mod predict;
mod reduce;
mod simulate;
mod stack;

pub use create::{create_map_dataset_geoms, CreateOptions, DatasetGeoms};
pub use info::{DatasetInfo, EnergyRange, OnOffInfo, ResidualMethod};
pub use reduce::ReducibleDataset;

use std::cell::RefCell;

use irf::{EDispMaps, PsfMap};
use log::debug;
use skymaps::{Geom, Gti, Map, MapError, MaskMap, MetaTable};

use crate::config::EvaluationConfig;
use crate::error::DatasetError;
use crate::evaluator::MapEvaluator;
use crate::lazy::LazyField;
use crate::models::{DatasetModels, Parameters};
use crate::stats::StatType;

/// Background map with the FoV model prediction computed from it.
#[derive(Debug, Clone, Default)]
pub struct CashBackground {
    background: LazyField<Map>,
    cache: RefCell<Option<(Parameters, Map)>>,
}

/// OFF counts and the acceptances of the ON and OFF regions.
#[derive(Debug, Clone, Default)]
pub struct OnOffBackground {
    counts_off: LazyField<Map>,
    acceptance: LazyField<Map>,
    acceptance_off: LazyField<Map>,
}

/// How the background of a dataset is described.
#[derive(Debug, Clone)]
pub enum Background {
    Cash(CashBackground),
    OnOff(OnOffBackground),
}

impl Background {
    pub fn cash(background: Option<Map>) -> Self {
        Background::Cash(CashBackground {
            background: background.into(),
            cache: RefCell::new(None),
        })
    }

    pub fn on_off(
        counts_off: Option<Map>,
        acceptance: Option<Map>,
        acceptance_off: Option<Map>,
    ) -> Self {
        Background::OnOff(OnOffBackground {
            counts_off: counts_off.into(),
            acceptance: acceptance.into(),
            acceptance_off: acceptance_off.into(),
        })
    }

    pub fn stat_type(&self) -> StatType {
        match self {
            Background::Cash(_) => StatType::Cash,
            Background::OnOff(_) => StatType::WStat,
        }
    }
}

/// Map dataset evaluated with the Cash or the WStat statistic.
#[derive(Debug, Clone)]
pub struct MapDataset {
    name: String,
    counts: LazyField<Map>,
    exposure: LazyField<Map>,
    psf: LazyField<PsfMap>,
    edisp: LazyField<EDispMaps>,
    mask_safe: LazyField<MaskMap>,
    mask_fit: LazyField<MaskMap>,
    background: Background,
    gti: Option<Gti>,
    meta_table: Option<MetaTable>,
    models: Option<DatasetModels>,
    evaluators: RefCell<Vec<MapEvaluator>>,
    /// Bumped whenever a role-map changes, evaluators compare against it.
    revision: u64,
    config: EvaluationConfig,
}

/// A [`MapDataset`] with an ON/OFF background.
pub type MapDatasetOnOff = MapDataset;

/// Random eight character dataset name.
pub(crate) fn make_name() -> String {
    format!("{:08x}", rand::random::<u32>())
}

/// Fail unless both maps have the same data shape.
pub(crate) fn check_shape(reference: &Map, other: &Map) -> Result<(), DatasetError> {
    if reference.data().shape() != other.data().shape() {
        return Err(MapError::ShapeMismatch {
            expected: reference.data().shape().to_vec(),
            actual: other.data().shape().to_vec(),
        }
        .into());
    }
    Ok(())
}

/// Builder for [`MapDataset`].
#[derive(Debug, Clone, Default)]
pub struct MapDatasetBuilder {
    name: Option<String>,
    counts: Option<Map>,
    exposure: Option<Map>,
    background: Option<Map>,
    psf: Option<PsfMap>,
    edisp: Option<EDispMaps>,
    mask_safe: Option<MaskMap>,
    mask_fit: Option<MaskMap>,
    gti: Option<Gti>,
    meta_table: Option<MetaTable>,
    models: Option<DatasetModels>,
    on_off: Option<(Option<Map>, Option<Map>, Option<Map>)>,
    config: EvaluationConfig,
}

impl MapDatasetBuilder {
    pub fn name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn counts(mut self, counts: Option<Map>) -> Self {
        self.counts = counts;
        self
    }

    pub fn exposure(mut self, exposure: Option<Map>) -> Self {
        self.exposure = exposure;
        self
    }

    pub fn background(mut self, background: Option<Map>) -> Self {
        self.background = background;
        self
    }

    pub fn psf(mut self, psf: Option<PsfMap>) -> Self {
        self.psf = psf;
        self
    }

    pub fn edisp(mut self, edisp: Option<EDispMaps>) -> Self {
        self.edisp = edisp;
        self
    }

    pub fn mask_safe(mut self, mask_safe: Option<MaskMap>) -> Self {
        self.mask_safe = mask_safe;
        self
    }

    pub fn mask_fit(mut self, mask_fit: Option<MaskMap>) -> Self {
        self.mask_fit = mask_fit;
        self
    }

    pub fn gti(mut self, gti: Option<Gti>) -> Self {
        self.gti = gti;
        self
    }

    pub fn meta_table(mut self, meta_table: Option<MetaTable>) -> Self {
        self.meta_table = meta_table;
        self
    }

    pub fn models(mut self, models: Option<DatasetModels>) -> Self {
        self.models = models;
        self
    }

    /// Use an ON/OFF background instead of a background map.
    pub fn on_off(
        mut self,
        counts_off: Option<Map>,
        acceptance: Option<Map>,
        acceptance_off: Option<Map>,
    ) -> Self {
        self.on_off = Some((counts_off, acceptance, acceptance_off));
        self
    }

    pub fn config(mut self, config: EvaluationConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the dataset, resolving its reference geometry.
    pub fn build(self) -> Result<MapDataset, DatasetError> {
        let background = match self.on_off {
            Some((counts_off, acceptance, acceptance_off)) => {
                if self.background.is_some() {
                    return Err(DatasetError::Unsupported(
                        "a background map on an on/off dataset".to_string(),
                    ));
                }
                Background::on_off(counts_off, acceptance, acceptance_off)
            }
            None => Background::cash(self.background),
        };
        let mut dataset = MapDataset {
            name: self.name.unwrap_or_else(make_name),
            counts: self.counts.into(),
            exposure: self.exposure.into(),
            psf: self.psf.into(),
            edisp: self.edisp.into(),
            mask_safe: self.mask_safe.into(),
            mask_fit: self.mask_fit.into(),
            background,
            gti: self.gti,
            meta_table: self.meta_table,
            models: None,
            evaluators: RefCell::new(Vec::new()),
            revision: 0,
            config: self.config,
        };
        dataset.geom()?;
        if self.models.is_some() {
            dataset.set_models(self.models)?;
        }
        Ok(dataset)
    }
}

impl MapDataset {
    pub fn builder() -> MapDatasetBuilder {
        MapDatasetBuilder::default()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
    }

    pub fn config(&self) -> &EvaluationConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: EvaluationConfig) {
        self.config = config;
        self.evaluators.get_mut().clear();
    }

    pub fn stat_type(&self) -> StatType {
        self.background.stat_type()
    }

    pub fn is_on_off(&self) -> bool {
        matches!(self.background, Background::OnOff(_))
    }

    pub fn background_kind(&self) -> &Background {
        &self.background
    }

    pub(crate) fn missing(&self, field: &'static str) -> DatasetError {
        DatasetError::MissingField {
            dataset: self.name.clone(),
            field,
        }
    }

    pub(crate) fn require<'a, T>(
        &self,
        value: Option<&'a T>,
        field: &'static str,
    ) -> Result<&'a T, DatasetError> {
        value.ok_or_else(|| self.missing(field))
    }

    fn touch(&mut self) {
        self.revision += 1;
    }

    pub fn counts(&self) -> Result<Option<&Map>, DatasetError> {
        self.counts.get()
    }

    pub fn exposure(&self) -> Result<Option<&Map>, DatasetError> {
        self.exposure.get()
    }

    pub fn psf(&self) -> Result<Option<&PsfMap>, DatasetError> {
        self.psf.get()
    }

    pub fn edisp(&self) -> Result<Option<&EDispMaps>, DatasetError> {
        self.edisp.get()
    }

    pub fn mask_safe(&self) -> Result<Option<&MaskMap>, DatasetError> {
        self.mask_safe.get()
    }

    pub fn mask_fit(&self) -> Result<Option<&MaskMap>, DatasetError> {
        self.mask_fit.get()
    }

    /// Stored background map; always `None` for on/off datasets.
    pub fn background_map(&self) -> Result<Option<&Map>, DatasetError> {
        match &self.background {
            Background::Cash(cash) => cash.background.get(),
            Background::OnOff(_) => Ok(None),
        }
    }

    pub(crate) fn on_off_maps(&self) -> Result<&OnOffBackground, DatasetError> {
        match &self.background {
            Background::OnOff(on_off) => Ok(on_off),
            Background::Cash(_) => Err(DatasetError::Unsupported(format!(
                "on/off quantities on cash dataset '{}'",
                self.name
            ))),
        }
    }

    fn on_off_maps_mut(&mut self) -> Result<&mut OnOffBackground, DatasetError> {
        let name = self.name.clone();
        match &mut self.background {
            Background::OnOff(on_off) => Ok(on_off),
            Background::Cash(_) => Err(DatasetError::Unsupported(format!(
                "on/off quantities on cash dataset '{name}'"
            ))),
        }
    }

    pub fn counts_off(&self) -> Result<Option<&Map>, DatasetError> {
        match &self.background {
            Background::OnOff(on_off) => on_off.counts_off.get(),
            Background::Cash(_) => Ok(None),
        }
    }

    pub fn acceptance(&self) -> Result<Option<&Map>, DatasetError> {
        match &self.background {
            Background::OnOff(on_off) => on_off.acceptance.get(),
            Background::Cash(_) => Ok(None),
        }
    }

    pub fn acceptance_off(&self) -> Result<Option<&Map>, DatasetError> {
        match &self.background {
            Background::OnOff(on_off) => on_off.acceptance_off.get(),
            Background::Cash(_) => Ok(None),
        }
    }

    pub fn gti(&self) -> Option<&Gti> {
        self.gti.as_ref()
    }

    pub fn meta_table(&self) -> Option<&MetaTable> {
        self.meta_table.as_ref()
    }

    pub fn models(&self) -> Option<&DatasetModels> {
        self.models.as_ref()
    }

    /// Mutable models, e.g. to change parameter values between evaluations.
    pub fn models_mut(&mut self) -> Option<&mut DatasetModels> {
        self.models.as_mut()
    }

    pub fn set_counts(&mut self, counts: Option<Map>) {
        self.counts.set(counts);
        self.touch();
    }

    pub fn set_exposure(&mut self, exposure: Option<Map>) {
        self.exposure.set(exposure);
        self.touch();
    }

    /// Replace the PSF. Evaluators are rebuilt on the next prediction.
    pub fn set_psf(&mut self, psf: Option<PsfMap>) {
        self.psf.set(psf);
        self.evaluators.get_mut().clear();
        self.touch();
    }

    pub fn set_edisp(&mut self, edisp: Option<EDispMaps>) {
        self.edisp.set(edisp);
        self.touch();
    }

    pub fn set_mask_safe(&mut self, mask_safe: Option<MaskMap>) {
        self.mask_safe.set(mask_safe);
        self.touch();
    }

    pub fn set_mask_fit(&mut self, mask_fit: Option<MaskMap>) {
        self.mask_fit.set(mask_fit);
        self.touch();
    }

    pub fn set_background(&mut self, background: Option<Map>) -> Result<(), DatasetError> {
        match &mut self.background {
            Background::Cash(cash) => {
                cash.background.set(background);
                cash.cache.get_mut().take();
            }
            Background::OnOff(_) => {
                return Err(DatasetError::Unsupported(
                    "a background map on an on/off dataset".to_string(),
                ))
            }
        }
        self.touch();
        Ok(())
    }

    pub fn set_counts_off(&mut self, counts_off: Option<Map>) -> Result<(), DatasetError> {
        self.on_off_maps_mut()?.counts_off.set(counts_off);
        self.touch();
        Ok(())
    }

    pub fn set_acceptance(&mut self, acceptance: Option<Map>) -> Result<(), DatasetError> {
        self.on_off_maps_mut()?.acceptance.set(acceptance);
        self.touch();
        Ok(())
    }

    pub fn set_acceptance_off(&mut self, acceptance_off: Option<Map>) -> Result<(), DatasetError> {
        self.on_off_maps_mut()?.acceptance_off.set(acceptance_off);
        self.touch();
        Ok(())
    }

    pub fn set_gti(&mut self, gti: Option<Gti>) {
        self.gti = gti;
    }

    pub fn set_meta_table(&mut self, meta_table: Option<MetaTable>) {
        self.meta_table = meta_table;
    }

    /// Attach models, keeping those that apply to this dataset.
    ///
    /// One evaluator is built per sky model. A position independent PSF is
    /// turned into a kernel once here and reused by every evaluator, so the
    /// PSF must be set before the models.
    pub fn set_models(&mut self, models: Option<DatasetModels>) -> Result<(), DatasetError> {
        let selected = models.map(|m| m.select(&self.name));
        let mut evaluators = Vec::new();
        if let Some(models) = &selected {
            if !models.sky_models().is_empty() {
                let geom = self.geom()?.clone();
                for model in models.sky_models() {
                    evaluators.push(self.new_evaluator(&model.name, &geom)?);
                }
            }
        }
        debug!(
            "Dataset '{}': {} evaluators for models {:?}",
            self.name,
            evaluators.len(),
            selected.as_ref().map(|m| m.names()).unwrap_or_default()
        );
        *self.evaluators.get_mut() = evaluators;
        if let Background::Cash(cash) = &mut self.background {
            cash.cache.get_mut().take();
        }
        self.models = selected;
        Ok(())
    }

    /// Reference geometry of the dataset.
    ///
    /// Resolved from the first present of counts, background, mask_safe and
    /// mask_fit; on/off datasets use counts, counts_off, acceptance and
    /// acceptance_off.
    pub fn geom(&self) -> Result<&Geom, DatasetError> {
        if let Some(counts) = self.counts()? {
            return Ok(counts.geom());
        }
        match &self.background {
            Background::Cash(cash) => {
                if let Some(background) = cash.background.get()? {
                    return Ok(background.geom());
                }
                if let Some(mask) = self.mask_safe()? {
                    return Ok(mask.geom());
                }
                if let Some(mask) = self.mask_fit()? {
                    return Ok(mask.geom());
                }
                Err(DatasetError::NoReferenceGeometry(
                    "counts, background, mask_safe or mask_fit",
                ))
            }
            Background::OnOff(on_off) => {
                for map in [&on_off.counts_off, &on_off.acceptance, &on_off.acceptance_off] {
                    if let Some(map) = map.get()? {
                        return Ok(map.geom());
                    }
                }
                Err(DatasetError::NoReferenceGeometry(
                    "counts, counts_off, acceptance or acceptance_off",
                ))
            }
        }
    }

    /// Combined mask: `mask_safe AND mask_fit`, or whichever is present.
    pub fn mask(&self) -> Result<Option<MaskMap>, DatasetError> {
        match (self.mask_fit()?, self.mask_safe()?) {
            (Some(fit), Some(safe)) => Ok(Some(fit.and(safe)?)),
            (Some(mask), None) | (None, Some(mask)) => Ok(Some(mask.clone())),
            (None, None) => Ok(None),
        }
    }

    fn reduce_to_image(&self, mask: Option<&MaskMap>) -> Result<MaskMap, DatasetError> {
        match mask {
            Some(mask) => Ok(mask.reduce_over_axes()),
            None => Ok(MaskMap::from_elem(self.geom()?.to_image(), true, "")),
        }
    }

    /// Spatial OR of [`MapDataset::mask`], all true without masks.
    pub fn mask_image(&self) -> Result<MaskMap, DatasetError> {
        self.reduce_to_image(self.mask()?.as_ref())
    }

    pub fn mask_safe_image(&self) -> Result<MaskMap, DatasetError> {
        self.reduce_to_image(self.mask_safe()?)
    }

    pub fn mask_fit_image(&self) -> Result<MaskMap, DatasetError> {
        self.reduce_to_image(self.mask_fit()?)
    }

    /// Safe mask projected onto the PSF grid, one bin along `rad` and `energy_true`.
    pub fn mask_safe_psf(&self) -> Result<Option<MaskMap>, DatasetError> {
        let (Some(_), Some(psf)) = (self.mask_safe()?, self.psf()?) else {
            return Ok(None);
        };
        let geom = psf.geom().squash("energy_true")?.squash("rad")?;
        let image = self
            .mask_safe_image()?
            .interp_to_geom(&geom.to_image(), false, false)?;
        Ok(Some(image.to_cube(geom.axes().to_vec())?))
    }

    /// Safe mask projected onto the energy dispersion grid.
    ///
    /// Kernel maps keep the reconstructed energy axis of the mask. The
    /// spatial projection extrapolates beyond the mask footprint so that IRF
    /// grids larger than the counts grid are still covered; near the edges
    /// of the field of view this can mark IRF pixels safe that have no data.
    pub fn mask_safe_edisp(&self) -> Result<Option<MaskMap>, DatasetError> {
        let (Some(mask_safe), Some(edisp)) = (self.mask_safe()?, self.edisp()?) else {
            return Ok(None);
        };
        let geom = edisp.geom().squash("energy_true")?;
        if edisp.has_migra() {
            let geom = geom.squash("migra")?;
            let image = self
                .mask_safe_image()?
                .interp_to_geom(&geom.to_image(), true, false)?;
            return Ok(Some(image.to_cube(geom.axes().to_vec())?));
        }
        if mask_safe.geom().is_region() {
            return Ok(Some(mask_safe.clone()));
        }
        let same_axes = geom.to_image().to_cube(mask_safe.geom().axes().to_vec())?;
        let mask = mask_safe
            .interp_to_geom(&same_axes, true, false)?
            .interp_to_geom(&geom, false, false)?;
        Ok(Some(mask))
    }

    /// Drop lazily loaded role-maps from memory; they are re-read on next access.
    ///
    /// Returns the number of evicted maps.
    pub fn reset_data_cache(&mut self) -> usize {
        let mut evicted = Vec::new();
        let mut evict = |field: &str, done: bool| {
            if done {
                evicted.push(field.to_string());
            }
        };
        evict("counts", self.counts.evict());
        evict("exposure", self.exposure.evict());
        evict("psf", self.psf.evict());
        evict("edisp", self.edisp.evict());
        evict("mask_safe", self.mask_safe.evict());
        evict("mask_fit", self.mask_fit.evict());
        match &mut self.background {
            Background::Cash(cash) => evict("background", cash.background.evict()),
            Background::OnOff(on_off) => {
                evict("counts_off", on_off.counts_off.evict());
                evict("acceptance", on_off.acceptance.evict());
                evict("acceptance_off", on_off.acceptance_off.evict());
            }
        }
        for field in &evicted {
            log::info!("Clearing {} cache for dataset {}", field, self.name);
        }
        evicted.len()
    }
}
