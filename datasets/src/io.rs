//! Dataset files.
//!
//! A dataset file is a JSON document with a primary header and one named HDU
//! per populated role-map. Masks are stored as 0/1 integers.

use irf::{EDispKernelMap, EDispMap, EDispMaps, PsfMap};
use log::{debug, warn};
use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};
use skymaps::{Geom, Gti, Map, MaskMap, MetaTable};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::DatasetError;
use crate::stats::StatType;

pub const HDU_COUNTS: &str = "COUNTS";
pub const HDU_EXPOSURE: &str = "EXPOSURE";
pub const HDU_BACKGROUND: &str = "BACKGROUND";
pub const HDU_EDISP: &str = "EDISP";
pub const HDU_PSF: &str = "PSF";
pub const HDU_MASK_SAFE: &str = "MASK_SAFE";
pub const HDU_MASK_FIT: &str = "MASK_FIT";
pub const HDU_GTI: &str = "GTI";
pub const HDU_META_TABLE: &str = "META_TABLE";
pub const HDU_COUNTS_OFF: &str = "COUNTS_OFF";
pub const HDU_ACCEPTANCE: &str = "ACCEPTANCE";
pub const HDU_ACCEPTANCE_OFF: &str = "ACCEPTANCE_OFF";

/// Value written to the `CREATOR` header key.
pub const CREATOR: &str = concat!("datasets ", env!("CARGO_PKG_VERSION"));

fn exposure_hdu(hdu_name: &str) -> String {
    format!("{hdu_name}_EXPOSURE")
}

/// Primary header of a dataset file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrimaryHeader {
    #[serde(rename = "NAME")]
    pub name: String,
    #[serde(rename = "STATTYPE")]
    pub stat_type: StatType,
    #[serde(rename = "CREATOR")]
    pub creator: String,
}

/// JSON has no NaN: non-finite values are written as `null` and read back as NaN.
mod nan_as_null {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[f64], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(data.iter().map(|v| v.is_finite().then_some(*v)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<f64>, D::Error> {
        let values = Vec::<Option<f64>>::deserialize(deserializer)?;
        Ok(values.into_iter().map(|v| v.unwrap_or(f64::NAN)).collect())
    }
}

/// Map stored with its geometry, unit and metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapHdu {
    pub geom: Geom,
    pub unit: String,
    #[serde(default)]
    pub meta: BTreeMap<String, f64>,
    #[serde(with = "nan_as_null")]
    pub data: Vec<f64>,
}

/// Mask stored as 0/1 integers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaskHdu {
    pub geom: Geom,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Hdu {
    Map(MapHdu),
    Mask(MaskHdu),
    Gti(Gti),
    Table(MetaTable),
}

fn invalid(hdu: &str, reason: impl Into<String>) -> DatasetError {
    DatasetError::InvalidHdu {
        hdu: hdu.to_string(),
        reason: reason.into(),
    }
}

fn to_array<T>(hdu: &str, geom: &Geom, data: Vec<T>) -> Result<ArrayD<T>, DatasetError> {
    ArrayD::from_shape_vec(IxDyn(&geom.data_shape()), data).map_err(|e| invalid(hdu, e.to_string()))
}

impl MapHdu {
    pub fn from_map(map: &Map) -> Self {
        Self {
            geom: map.geom().clone(),
            unit: map.unit().to_string(),
            meta: map.meta().clone(),
            data: map.data().iter().copied().collect(),
        }
    }

    pub fn to_map(&self, hdu: &str) -> Result<Map, DatasetError> {
        let data = to_array(hdu, &self.geom, self.data.clone())?;
        let mut map = Map::from_data(self.geom.clone(), data, &self.unit)?;
        *map.meta_mut() = self.meta.clone();
        Ok(map)
    }
}

impl MaskHdu {
    pub fn from_mask(mask: &MaskMap) -> Self {
        Self {
            geom: mask.geom().clone(),
            data: mask.data().iter().map(|v| u8::from(*v)).collect(),
        }
    }

    pub fn to_mask(&self, hdu: &str) -> Result<MaskMap, DatasetError> {
        let values = self.data.iter().map(|v| *v != 0).collect();
        let data = to_array(hdu, &self.geom, values)?;
        Ok(MaskMap::from_data(self.geom.clone(), data, "")?)
    }
}

/// In-memory image of a dataset file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetFile {
    pub header: PrimaryHeader,
    pub hdus: BTreeMap<String, Hdu>,
}

impl DatasetFile {
    pub fn new(name: &str, stat_type: StatType) -> Self {
        Self {
            header: PrimaryHeader {
                name: name.to_string(),
                stat_type,
                creator: CREATOR.to_string(),
            },
            hdus: BTreeMap::new(),
        }
    }

    pub fn read(path: &Path) -> Result<Self, DatasetError> {
        debug!("Reading dataset file {}", path.display());
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Write the file, refusing to replace an existing one unless `overwrite`.
    pub fn write(&self, path: &Path, overwrite: bool) -> Result<(), DatasetError> {
        if path.exists() && !overwrite {
            return Err(DatasetError::FileExists(path.to_path_buf()));
        }
        let json = serde_json::to_string(self)?;
        std::fs::write(path, json)?;
        debug!(
            "Wrote dataset '{}' with HDUs {:?} to {}",
            self.header.name,
            self.hdus.keys().collect::<Vec<_>>(),
            path.display()
        );
        Ok(())
    }

    pub fn has_hdu(&self, name: &str) -> bool {
        self.hdus.contains_key(name)
    }

    pub fn insert_map(&mut self, name: &str, map: &Map) {
        self.hdus.insert(name.to_string(), Hdu::Map(MapHdu::from_map(map)));
    }

    pub fn insert_mask(&mut self, name: &str, mask: &MaskMap) {
        self.hdus
            .insert(name.to_string(), Hdu::Mask(MaskHdu::from_mask(mask)));
    }

    pub fn insert_psf(&mut self, psf: &PsfMap) {
        self.insert_map(HDU_PSF, psf.psf_map());
        if let Some(exposure) = psf.exposure_map() {
            self.insert_map(&exposure_hdu(HDU_PSF), exposure);
        }
    }

    pub fn insert_edisp(&mut self, edisp: &EDispMaps) {
        self.insert_map(HDU_EDISP, edisp.irf().irf_map());
        if let Some(exposure) = edisp.exposure_map() {
            self.insert_map(&exposure_hdu(HDU_EDISP), exposure);
        }
    }

    pub fn insert_gti(&mut self, gti: &Gti) {
        self.hdus.insert(HDU_GTI.to_string(), Hdu::Gti(gti.clone()));
    }

    pub fn insert_meta_table(&mut self, table: &MetaTable) {
        self.hdus
            .insert(HDU_META_TABLE.to_string(), Hdu::Table(table.clone()));
    }

    pub fn map(&self, name: &str) -> Result<Option<Map>, DatasetError> {
        match self.hdus.get(name) {
            None => Ok(None),
            Some(Hdu::Map(hdu)) => Ok(Some(hdu.to_map(name)?)),
            Some(_) => Err(invalid(name, "expected a map")),
        }
    }

    pub fn mask(&self, name: &str) -> Result<Option<MaskMap>, DatasetError> {
        match self.hdus.get(name) {
            None => Ok(None),
            Some(Hdu::Mask(hdu)) => Ok(Some(hdu.to_mask(name)?)),
            Some(_) => Err(invalid(name, "expected a mask")),
        }
    }

    pub fn gti(&self) -> Result<Option<Gti>, DatasetError> {
        match self.hdus.get(HDU_GTI) {
            None => Ok(None),
            Some(Hdu::Gti(gti)) => Ok(Some(gti.clone())),
            Some(_) => Err(invalid(HDU_GTI, "expected a GTI table")),
        }
    }

    pub fn meta_table(&self) -> Result<Option<MetaTable>, DatasetError> {
        match self.hdus.get(HDU_META_TABLE) {
            None => Ok(None),
            Some(Hdu::Table(table)) => Ok(Some(table.clone())),
            Some(_) => Err(invalid(HDU_META_TABLE, "expected a table")),
        }
    }
}

/// What a role-map HDU decodes into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HduKind {
    Map,
    Mask,
    Psf,
    EDisp,
}

/// Where a lazily loaded role-map lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HduLocation {
    pub path: PathBuf,
    pub hdu_name: String,
    pub kind: HduKind,
}

impl HduLocation {
    pub fn new(path: &Path, hdu_name: &str, kind: HduKind) -> Self {
        Self {
            path: path.to_path_buf(),
            hdu_name: hdu_name.to_string(),
            kind,
        }
    }
}

/// Role-map types that can be decoded from a dataset file.
pub trait ReadHdu: Sized {
    const KIND: HduKind;

    /// Decode the HDU, `None` when the file does not contain it.
    fn read_hdu(file: &DatasetFile, hdu_name: &str) -> Result<Option<Self>, DatasetError>;
}

impl ReadHdu for Map {
    const KIND: HduKind = HduKind::Map;

    fn read_hdu(file: &DatasetFile, hdu_name: &str) -> Result<Option<Self>, DatasetError> {
        file.map(hdu_name)
    }
}

impl ReadHdu for MaskMap {
    const KIND: HduKind = HduKind::Mask;

    fn read_hdu(file: &DatasetFile, hdu_name: &str) -> Result<Option<Self>, DatasetError> {
        file.mask(hdu_name)
    }
}

impl ReadHdu for PsfMap {
    const KIND: HduKind = HduKind::Psf;

    fn read_hdu(file: &DatasetFile, hdu_name: &str) -> Result<Option<Self>, DatasetError> {
        let Some(psf) = file.map(hdu_name)? else {
            return Ok(None);
        };
        let exposure = file.map(&exposure_hdu(hdu_name))?;
        Ok(Some(PsfMap::new(psf, exposure)?))
    }
}

impl ReadHdu for EDispMaps {
    const KIND: HduKind = HduKind::EDisp;

    /// Kernel maps carry a reconstructed `energy` axis, migration maps do not.
    fn read_hdu(file: &DatasetFile, hdu_name: &str) -> Result<Option<Self>, DatasetError> {
        let Some(edisp) = file.map(hdu_name)? else {
            return Ok(None);
        };
        let exposure = file.map(&exposure_hdu(hdu_name))?;
        let maps = if edisp.geom().has_axis("energy") {
            EDispMaps::from(EDispKernelMap::new(edisp, exposure)?)
        } else {
            EDispMaps::from(EDispMap::new(edisp, exposure)?)
        };
        Ok(Some(maps))
    }
}

/// Load a role-map from its location. A missing HDU resolves to `None`.
pub fn load<T: ReadHdu>(location: &HduLocation) -> Result<Option<T>, DatasetError> {
    if location.kind != T::KIND {
        return Err(invalid(
            &location.hdu_name,
            format!("expected {:?} HDU, location is {:?}", T::KIND, location.kind),
        ));
    }
    let file = DatasetFile::read(&location.path)?;
    let value = T::read_hdu(&file, &location.hdu_name)?;
    if value.is_none() {
        warn!(
            "HDU '{}' not found in {}",
            location.hdu_name,
            location.path.display()
        );
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use skymaps::{MapAxis, SkyCoord};

    fn geom() -> Geom {
        let axis = MapAxis::from_energy_bounds(1.0, 10.0, 2, "TeV", "energy").unwrap();
        Geom::create(SkyCoord::icrs(10.0, 20.0), 0.5, (3, 2), vec![axis]).unwrap()
    }

    #[test]
    fn test_map_hdu_roundtrip() {
        let mut map = Map::from_elem(geom(), 2.5, "m2 s");
        map.data_mut()[[1, 1, 2]] = 7.0;
        map.meta_mut().insert("livetime".to_string(), 100.0);
        let restored = MapHdu::from_map(&map).to_map("EXPOSURE").unwrap();
        assert_eq!(restored, map);
    }

    #[test]
    fn test_mask_hdu_is_integer() {
        let mut mask = MaskMap::from_elem(geom(), true, "");
        mask.data_mut()[[0, 0, 0]] = false;
        let hdu = MaskHdu::from_mask(&mask);
        assert_eq!(hdu.data[0], 0);
        assert_eq!(hdu.data[1], 1);
        assert_eq!(hdu.to_mask("MASK_SAFE").unwrap(), mask);
    }

    #[test]
    fn test_nan_survives_json() {
        let mut map = Map::from_elem(geom(), 1.0, "");
        map.data_mut()[[0, 1, 1]] = f64::NAN;
        let json = serde_json::to_string(&MapHdu::from_map(&map)).unwrap();
        let hdu: MapHdu = serde_json::from_str(&json).unwrap();
        assert!(hdu.data[4].is_nan());
        assert_eq!(hdu.data[0], 1.0);
    }

    #[test]
    fn test_wrong_length_is_invalid() {
        let hdu = MapHdu {
            geom: geom(),
            unit: String::new(),
            meta: BTreeMap::new(),
            data: vec![0.0; 5],
        };
        assert!(matches!(
            hdu.to_map("COUNTS"),
            Err(DatasetError::InvalidHdu { .. })
        ));
    }

    #[test]
    fn test_write_refuses_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dataset.json");
        let mut file = DatasetFile::new("test", StatType::Cash);
        file.insert_map(HDU_COUNTS, &Map::from_geom(geom(), ""));
        file.write(&path, false).unwrap();
        assert!(matches!(
            file.write(&path, false),
            Err(DatasetError::FileExists(_))
        ));
        file.write(&path, true).unwrap();

        let read = DatasetFile::read(&path).unwrap();
        assert_eq!(read.header.stat_type, StatType::Cash);
        assert!(read.has_hdu(HDU_COUNTS));
    }

    #[test]
    fn test_load_missing_hdu_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dataset.json");
        DatasetFile::new("test", StatType::Cash)
            .write(&path, false)
            .unwrap();
        let location = HduLocation::new(&path, HDU_BACKGROUND, HduKind::Map);
        let loaded: Option<Map> = load(&location).unwrap();
        assert!(loaded.is_none());
    }
}
