//! Zero-filled datasets and conversions between the Cash and on/off variants.

use irf::{default_rad_axis, EDispKernelMap, EDispMap, EDispMaps, PsfMap};
use log::debug;
use skymaps::{Geom, Gti, Map, MapAxis, MaskMap};

use super::{make_name, Background, MapDataset};
use crate::config::EvaluationConfig;
use crate::error::DatasetError;

/// IRF pixel size in degrees used when none is given.
pub const BINSZ_IRF_DEFAULT: f64 = 0.2;

/// Geometries of the role-maps of a dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetGeoms {
    /// Counts, background and masks.
    pub geom: Geom,
    pub geom_exposure: Option<Geom>,
    pub geom_psf: Option<Geom>,
    /// A `migra` axis selects an [`EDispMap`], an `energy` axis an
    /// [`EDispKernelMap`].
    pub geom_edisp: Option<Geom>,
}

/// Options of [`create_map_dataset_geoms`] and [`MapDataset::create`].
#[derive(Debug, Clone)]
pub struct CreateOptions {
    /// Defaults to the reconstructed energy axis renamed `energy_true`.
    pub energy_axis_true: Option<MapAxis>,
    /// Build an [`EDispMap`] on this axis instead of a kernel map.
    pub migra_axis: Option<MapAxis>,
    pub rad_axis: Option<MapAxis>,
    pub binsz_irf: f64,
    /// Put the PSF on the reconstructed energy axis.
    pub reco_psf: bool,
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self {
            energy_axis_true: None,
            migra_axis: None,
            rad_axis: None,
            binsz_irf: BINSZ_IRF_DEFAULT,
            reco_psf: false,
        }
    }
}

/// Role-map geometries for a counts geometry carrying an `energy` axis.
///
/// Extra non-energy axes of `geom` are appended to every IRF geometry.
pub fn create_map_dataset_geoms(
    geom: &Geom,
    options: &CreateOptions,
) -> Result<DatasetGeoms, DatasetError> {
    let energy_axis = geom.axis("energy")?;
    let energy_axis_true = match &options.energy_axis_true {
        Some(axis) if axis.name() != "energy_true" => {
            return Err(DatasetError::Unsupported(format!(
                "true energy axis named '{}'",
                axis.name()
            )))
        }
        Some(axis) => axis.clone(),
        None => energy_axis.renamed("energy_true"),
    };
    let rad_axis = match &options.rad_axis {
        Some(axis) => axis.clone(),
        None => default_rad_axis()?,
    };
    let external: Vec<MapAxis> = geom.axes().drop("energy")?.to_vec();
    let with_external = |axes: Vec<MapAxis>| -> Vec<MapAxis> {
        axes.into_iter().chain(external.iter().cloned()).collect()
    };

    let image = geom.to_image();
    let geom_exposure = image.to_cube(with_external(vec![energy_axis_true.clone()]))?;
    let geom_irf = if geom.is_region() {
        image
    } else {
        image.to_binsz(options.binsz_irf)?
    };
    let psf_energy = if options.reco_psf {
        energy_axis.renamed("energy_true")
    } else {
        energy_axis_true.clone()
    };
    let geom_psf = geom_irf.to_cube(with_external(vec![rad_axis, psf_energy]))?;
    let edisp_axis = match &options.migra_axis {
        Some(migra) => migra.clone(),
        None => energy_axis.clone(),
    };
    let geom_edisp = geom_irf.to_cube(with_external(vec![edisp_axis, energy_axis_true]))?;

    Ok(DatasetGeoms {
        geom: geom.clone(),
        geom_exposure: Some(geom_exposure),
        geom_psf: Some(geom_psf),
        geom_edisp: Some(geom_edisp),
    })
}

impl MapDataset {
    /// Zero-filled dataset on the given geometries.
    ///
    /// Counts and background are zero, the exposure is zero in `m2 s`, IRFs
    /// are built by their `from_geom` constructors, the GTI is empty and the
    /// safe mask is all false.
    pub fn from_geoms(
        geoms: &DatasetGeoms,
        name: Option<&str>,
        config: EvaluationConfig,
    ) -> Result<MapDataset, DatasetError> {
        let name = name.map(str::to_string).unwrap_or_else(make_name);
        let edisp = match &geoms.geom_edisp {
            Some(geom) if geom.has_axis("migra") => Some(EDispMaps::from(EDispMap::from_geom(geom)?)),
            Some(geom) => Some(EDispMaps::from(EDispKernelMap::from_geom(geom)?)),
            None => None,
        };
        let psf = match &geoms.geom_psf {
            Some(geom) => Some(PsfMap::from_geom(geom)?),
            None => None,
        };
        debug!("Creating empty dataset '{}'", name);
        MapDataset::builder()
            .name(&name)
            .counts(Some(Map::from_geom(geoms.geom.clone(), "")))
            .background(Some(Map::from_geom(geoms.geom.clone(), "")))
            .exposure(geoms.geom_exposure.clone().map(|g| Map::from_geom(g, "m2 s")))
            .psf(psf)
            .edisp(edisp)
            .gti(Some(Gti::default()))
            .mask_safe(Some(MaskMap::from_geom(geoms.geom.clone(), "")))
            .config(config)
            .build()
    }

    /// Zero-filled on/off dataset: as [`MapDataset::from_geoms`] with zero
    /// OFF counts and acceptances instead of a background map.
    pub fn from_geoms_on_off(
        geoms: &DatasetGeoms,
        name: Option<&str>,
        config: EvaluationConfig,
    ) -> Result<MapDataset, DatasetError> {
        let dataset = Self::from_geoms(geoms, name, config)?;
        let zeros = || Map::from_geom(geoms.geom.clone(), "");
        let name = dataset.name.clone();
        Self::from_map_dataset(&dataset, zeros(), zeros(), Some(zeros()), Some(&name))
    }

    /// Zero-filled dataset for a counts geometry, see [`create_map_dataset_geoms`].
    ///
    /// ```no_run
    /// use datasets::{CreateOptions, EvaluationConfig, MapDataset};
    /// use skymaps::{Geom, MapAxis, SkyCoord};
    ///
    /// let energy = MapAxis::from_energy_bounds(1.0, 10.0, 4, "TeV", "energy")?;
    /// let geom = Geom::create(SkyCoord::icrs(83.633, 22.014), 0.02, (100, 100), vec![energy])?;
    /// let empty = MapDataset::create(&geom, &CreateOptions::default(), Some("empty"), EvaluationConfig::default())?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn create(
        geom: &Geom,
        options: &CreateOptions,
        name: Option<&str>,
        config: EvaluationConfig,
    ) -> Result<MapDataset, DatasetError> {
        let geoms = create_map_dataset_geoms(geom, options)?;
        Self::from_geoms(&geoms, name, config)
    }

    pub fn create_on_off(
        geom: &Geom,
        options: &CreateOptions,
        name: Option<&str>,
        config: EvaluationConfig,
    ) -> Result<MapDataset, DatasetError> {
        let geoms = create_map_dataset_geoms(geom, options)?;
        Self::from_geoms_on_off(&geoms, name, config)
    }

    /// Geometries of the current role-maps.
    pub fn geoms(&self) -> Result<DatasetGeoms, DatasetError> {
        Ok(DatasetGeoms {
            geom: self.geom()?.clone(),
            geom_exposure: self.exposure()?.map(|m| m.geom().clone()),
            geom_psf: self.psf()?.map(|p| p.geom().clone()),
            geom_edisp: self.edisp()?.map(|e| e.geom().clone()),
        })
    }

    /// Zero-filled dataset of the same variant on the current geometries.
    pub fn empty_like(&self, name: Option<&str>) -> Result<MapDataset, DatasetError> {
        let geoms = self.geoms()?;
        match self.background {
            Background::Cash(_) => Self::from_geoms(&geoms, name, self.config.clone()),
            Background::OnOff(_) => Self::from_geoms_on_off(&geoms, name, self.config.clone()),
        }
    }

    /// On/off dataset sharing the role-maps and models of `dataset`.
    ///
    /// Without `counts_off`, OFF counts are derived from the predicted
    /// background as `npred_background / alpha` when `dataset` has a
    /// background map.
    pub fn from_map_dataset(
        dataset: &MapDataset,
        acceptance: Map,
        acceptance_off: Map,
        counts_off: Option<Map>,
        name: Option<&str>,
    ) -> Result<MapDataset, DatasetError> {
        let counts_off = match (counts_off, dataset.background_map()?) {
            (Some(counts_off), _) => Some(counts_off),
            (None, Some(_)) => {
                let alpha = acceptance.checked_div(&acceptance_off)?;
                let mut counts_off = dataset.npred_background()?.checked_div(&alpha)?;
                counts_off.nan_to_num();
                Some(counts_off)
            }
            (None, None) => None,
        };
        let name = name.map(str::to_string).unwrap_or_else(make_name);
        MapDataset::builder()
            .name(&name)
            .counts(dataset.counts()?.cloned())
            .exposure(dataset.exposure()?.cloned())
            .psf(dataset.psf()?.cloned())
            .edisp(dataset.edisp()?.cloned())
            .mask_safe(dataset.mask_safe()?.cloned())
            .mask_fit(dataset.mask_fit()?.cloned())
            .gti(dataset.gti.clone())
            .meta_table(dataset.meta_table.clone())
            .models(dataset.models.clone())
            .config(dataset.config.clone())
            .on_off(counts_off, Some(acceptance), Some(acceptance_off))
            .build()
    }

    /// Cash dataset with `alpha * counts_off` as background map.
    pub fn to_map_dataset(&self, name: Option<&str>) -> Result<MapDataset, DatasetError> {
        let name = name.map(str::to_string).unwrap_or_else(make_name);
        MapDataset::builder()
            .name(&name)
            .counts(self.counts()?.cloned())
            .exposure(self.exposure()?.cloned())
            .psf(self.psf()?.cloned())
            .edisp(self.edisp()?.cloned())
            .mask_safe(self.mask_safe()?.cloned())
            .mask_fit(self.mask_fit()?.cloned())
            .background(self.background()?)
            .gti(self.gti.clone())
            .meta_table(self.meta_table.clone())
            .config(self.config.clone())
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use irf::default_migra_axis;
    use skymaps::SkyCoord;

    fn geom() -> Geom {
        let energy = MapAxis::from_energy_bounds(1.0, 10.0, 3, "TeV", "energy").unwrap();
        Geom::create(SkyCoord::galactic(0.0, 0.0), 0.05, (20, 10), vec![energy]).unwrap()
    }

    #[test]
    fn test_default_geoms() {
        let geoms = create_map_dataset_geoms(&geom(), &CreateOptions::default()).unwrap();
        let exposure = geoms.geom_exposure.unwrap();
        assert_eq!(exposure.axes().names(), vec!["energy_true"]);
        assert_eq!(exposure.npix(), (20, 10));

        let psf = geoms.geom_psf.unwrap();
        assert_eq!(psf.axes().names(), vec!["rad", "energy_true"]);
        assert_eq!(psf.axis("rad").unwrap().nbin(), 66);
        assert_eq!(psf.npix(), (5, 3));

        let edisp = geoms.geom_edisp.unwrap();
        assert_eq!(edisp.axes().names(), vec!["energy", "energy_true"]);
    }

    #[test]
    fn test_geoms_with_migra_and_reco_psf() {
        let options = CreateOptions {
            migra_axis: Some(default_migra_axis().unwrap()),
            reco_psf: true,
            energy_axis_true: Some(
                MapAxis::from_energy_bounds(0.5, 20.0, 8, "TeV", "energy_true").unwrap(),
            ),
            ..CreateOptions::default()
        };
        let geoms = create_map_dataset_geoms(&geom(), &options).unwrap();
        let edisp = geoms.geom_edisp.unwrap();
        assert_eq!(edisp.axes().names(), vec!["migra", "energy_true"]);
        assert_eq!(edisp.axis("migra").unwrap().nbin(), 48);
        let psf = geoms.geom_psf.unwrap();
        assert_eq!(psf.axis("energy_true").unwrap().nbin(), 3);
        assert_eq!(geoms.geom_exposure.unwrap().axis("energy_true").unwrap().nbin(), 8);
    }

    #[test]
    fn test_rejects_misnamed_true_axis() {
        let options = CreateOptions {
            energy_axis_true: Some(
                MapAxis::from_energy_bounds(0.5, 20.0, 8, "TeV", "energy").unwrap(),
            ),
            ..CreateOptions::default()
        };
        assert!(matches!(
            create_map_dataset_geoms(&geom(), &options),
            Err(DatasetError::Unsupported(_))
        ));
    }

    #[test]
    fn test_create_is_empty_and_unsafe() {
        let dataset = MapDataset::create(
            &geom(),
            &CreateOptions::default(),
            Some("empty"),
            EvaluationConfig::default(),
        )
        .unwrap();
        assert_eq!(dataset.name(), "empty");
        assert_eq!(dataset.counts().unwrap().unwrap().sum(), 0.0);
        assert_eq!(dataset.exposure().unwrap().unwrap().unit(), "m2 s");
        assert!(!dataset.mask_safe().unwrap().unwrap().any());
        assert!(dataset.gti().unwrap().is_empty());
        assert!(!dataset.edisp().unwrap().unwrap().has_migra());
        assert_eq!(dataset.npred().unwrap().sum(), 0.0);
    }

    #[test]
    fn test_create_on_off_and_empty_like() {
        let dataset = MapDataset::create_on_off(
            &geom(),
            &CreateOptions::default(),
            None,
            EvaluationConfig::default(),
        )
        .unwrap();
        assert!(dataset.is_on_off());
        assert_eq!(dataset.counts_off().unwrap().unwrap().sum(), 0.0);

        let empty = dataset.empty_like(Some("copy")).unwrap();
        assert!(empty.is_on_off());
        assert_eq!(empty.geoms().unwrap(), dataset.geoms().unwrap());
    }

    #[test]
    fn test_on_off_round_trip() {
        let cash = MapDataset::builder()
            .name("cash")
            .counts(Some(Map::from_elem(geom(), 4.0, "")))
            .background(Some(Map::from_elem(geom(), 2.0, "")))
            .build()
            .unwrap();
        let on_off = MapDataset::from_map_dataset(
            &cash,
            Map::from_elem(geom(), 1.0, ""),
            Map::from_elem(geom(), 4.0, ""),
            None,
            Some("on-off"),
        )
        .unwrap();
        assert_relative_eq!(on_off.counts_off().unwrap().unwrap().data()[[0, 0, 0]], 8.0);

        let back = on_off.to_map_dataset(None).unwrap();
        assert!(!back.is_on_off());
        assert_relative_eq!(back.background_map().unwrap().unwrap().data()[[2, 3, 4]], 2.0);
    }
}
