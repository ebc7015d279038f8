//! Reading and writing datasets.

use irf::{EDispMaps, PsfMap};
use log::info;
use std::cell::RefCell;
use std::path::Path;

use super::{Background, CashBackground, MapDataset};
use crate::config::EvaluationConfig;
use crate::error::DatasetError;
use crate::io::{
    DatasetFile, HduKind, HduLocation, HDU_ACCEPTANCE, HDU_ACCEPTANCE_OFF, HDU_BACKGROUND,
    HDU_COUNTS, HDU_COUNTS_OFF, HDU_EDISP, HDU_EXPOSURE, HDU_MASK_FIT, HDU_MASK_SAFE, HDU_PSF,
    ReadHdu,
};
use crate::lazy::LazyField;
use crate::stats::StatType;

impl MapDataset {
    /// Encode the populated role-maps into a dataset file image.
    pub fn to_file(&self) -> Result<DatasetFile, DatasetError> {
        let mut file = DatasetFile::new(&self.name, self.stat_type());
        if let Some(counts) = self.counts()? {
            file.insert_map(HDU_COUNTS, counts);
        }
        if let Some(exposure) = self.exposure()? {
            file.insert_map(HDU_EXPOSURE, exposure);
        }
        match &self.background {
            Background::Cash(cash) => {
                if let Some(background) = cash.background.get()? {
                    file.insert_map(HDU_BACKGROUND, background);
                }
            }
            Background::OnOff(on_off) => {
                for (hdu, field) in [
                    (HDU_COUNTS_OFF, &on_off.counts_off),
                    (HDU_ACCEPTANCE, &on_off.acceptance),
                    (HDU_ACCEPTANCE_OFF, &on_off.acceptance_off),
                ] {
                    if let Some(map) = field.get()? {
                        file.insert_map(hdu, map);
                    }
                }
            }
        }
        if let Some(edisp) = self.edisp()? {
            file.insert_edisp(edisp);
        }
        if let Some(psf) = self.psf()? {
            file.insert_psf(psf);
        }
        if let Some(mask) = self.mask_safe()? {
            file.insert_mask(HDU_MASK_SAFE, mask);
        }
        if let Some(mask) = self.mask_fit()? {
            file.insert_mask(HDU_MASK_FIT, mask);
        }
        if let Some(gti) = &self.gti {
            file.insert_gti(gti);
        }
        if let Some(table) = &self.meta_table {
            file.insert_meta_table(table);
        }
        Ok(file)
    }

    /// Write the dataset to `path`. Models are not written.
    pub fn write(&self, path: &Path, overwrite: bool) -> Result<(), DatasetError> {
        self.to_file()?.write(path, overwrite)
    }

    /// Read a dataset written by [`MapDataset::write`].
    ///
    /// `name` overrides the stored name. With `lazy` the role-maps are
    /// decoded on first access; only datasets with a background map can be
    /// read lazily.
    pub fn read(
        path: &Path,
        name: Option<&str>,
        lazy: bool,
        config: EvaluationConfig,
    ) -> Result<MapDataset, DatasetError> {
        let file = DatasetFile::read(path)?;
        let name = name.unwrap_or(file.header.name.as_str()).to_string();
        if lazy {
            if file.header.stat_type == StatType::WStat {
                return Err(DatasetError::LazyReadUnsupported(
                    "on/off datasets".to_string(),
                ));
            }
            info!("Reading dataset '{}' lazily from {}", name, path.display());
            let at = |hdu: &str, kind: HduKind| HduLocation::new(path, hdu, kind);
            return Ok(MapDataset {
                name,
                counts: LazyField::from_location(at(HDU_COUNTS, HduKind::Map)),
                exposure: LazyField::from_location(at(HDU_EXPOSURE, HduKind::Map)),
                psf: LazyField::from_location(at(HDU_PSF, HduKind::Psf)),
                edisp: LazyField::from_location(at(HDU_EDISP, HduKind::EDisp)),
                mask_safe: LazyField::from_location(at(HDU_MASK_SAFE, HduKind::Mask)),
                mask_fit: LazyField::from_location(at(HDU_MASK_FIT, HduKind::Mask)),
                background: Background::Cash(CashBackground {
                    background: LazyField::from_location(at(HDU_BACKGROUND, HduKind::Map)),
                    cache: RefCell::new(None),
                }),
                gti: file.gti()?,
                meta_table: file.meta_table()?,
                models: None,
                evaluators: RefCell::new(Vec::new()),
                revision: 0,
                config,
            });
        }

        let builder = MapDataset::builder()
            .name(&name)
            .counts(file.map(HDU_COUNTS)?)
            .exposure(file.map(HDU_EXPOSURE)?)
            .psf(PsfMap::read_hdu(&file, HDU_PSF)?)
            .edisp(EDispMaps::read_hdu(&file, HDU_EDISP)?)
            .mask_safe(file.mask(HDU_MASK_SAFE)?)
            .mask_fit(file.mask(HDU_MASK_FIT)?)
            .gti(file.gti()?)
            .meta_table(file.meta_table()?)
            .config(config);
        match file.header.stat_type {
            StatType::Cash => builder.background(file.map(HDU_BACKGROUND)?).build(),
            StatType::WStat => builder
                .on_off(
                    file.map(HDU_COUNTS_OFF)?,
                    file.map(HDU_ACCEPTANCE)?,
                    file.map(HDU_ACCEPTANCE_OFF)?,
                )
                .build(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skymaps::{Geom, Gti, Map, MapAxis, MaskMap, SkyCoord};

    fn geom() -> Geom {
        let energy = MapAxis::from_energy_bounds(1.0, 10.0, 2, "TeV", "energy").unwrap();
        Geom::create(SkyCoord::icrs(0.0, 0.0), 0.1, (4, 4), vec![energy]).unwrap()
    }

    fn on_off() -> MapDataset {
        MapDataset::builder()
            .name("on-off")
            .counts(Some(Map::from_elem(geom(), 2.0, "")))
            .on_off(
                Some(Map::from_elem(geom(), 6.0, "")),
                Some(Map::from_elem(geom(), 1.0, "")),
                Some(Map::from_elem(geom(), 3.0, "")),
            )
            .mask_safe(Some(MaskMap::from_elem(geom(), true, "")))
            .gti(Some(Gti::create(&[0.0], &[100.0], 51910.0)))
            .build()
            .unwrap()
    }

    #[test]
    fn test_on_off_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("on_off.json");
        let dataset = on_off();
        dataset.write(&path, false).unwrap();

        let file = DatasetFile::read(&path).unwrap();
        assert!(!file.has_hdu(HDU_BACKGROUND));
        assert!(file.has_hdu(HDU_COUNTS_OFF));

        let read = MapDataset::read(&path, Some("renamed"), false, EvaluationConfig::default())
            .unwrap();
        assert_eq!(read.name(), "renamed");
        assert_eq!(read.stat_type(), StatType::WStat);
        assert_eq!(read.acceptance_off().unwrap(), dataset.acceptance_off().unwrap());
        assert_eq!(read.gti(), dataset.gti());
    }

    #[test]
    fn test_lazy_on_off_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("on_off.json");
        on_off().write(&path, false).unwrap();
        let err = MapDataset::read(&path, None, true, EvaluationConfig::default()).unwrap_err();
        assert!(matches!(err, DatasetError::LazyReadUnsupported(_)));
    }

    #[test]
    fn test_lazy_read_loads_on_access() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cash.json");
        MapDataset::builder()
            .name("cash")
            .counts(Some(Map::from_elem(geom(), 1.0, "")))
            .background(Some(Map::from_elem(geom(), 0.5, "")))
            .build()
            .unwrap()
            .write(&path, false)
            .unwrap();

        let mut dataset = MapDataset::read(&path, None, true, EvaluationConfig::default()).unwrap();
        assert_eq!(dataset.name(), "cash");
        assert!(!dataset.counts.is_loaded());
        assert_eq!(dataset.counts().unwrap().unwrap().sum(), 32.0);
        assert!(dataset.exposure().unwrap().is_none());
        assert_eq!(dataset.reset_data_cache(), 2);
        assert!(!dataset.counts.is_loaded());
        assert_eq!(dataset.npred_background().unwrap().sum(), 16.0);
    }
}
