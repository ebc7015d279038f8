//! Role-maps loaded on first access.
//!
//! A field read lazily keeps the location of its HDU and decodes it the first
//! time it is needed. Loaded values can be evicted again to free memory; the
//! next access re-reads the file.

use log::debug;
use once_cell::unsync::OnceCell;

use crate::error::DatasetError;
use crate::io::{load, HduLocation, ReadHdu};

/// Optional role-map, held in memory or backed by a file location.
#[derive(Debug, Clone)]
pub struct LazyField<T> {
    value: OnceCell<Option<T>>,
    location: Option<HduLocation>,
}

impl<T> Default for LazyField<T> {
    fn default() -> Self {
        Self {
            value: OnceCell::from(None),
            location: None,
        }
    }
}

impl<T> From<Option<T>> for LazyField<T> {
    fn from(value: Option<T>) -> Self {
        Self {
            value: OnceCell::from(value),
            location: None,
        }
    }
}

impl<T: ReadHdu> LazyField<T> {
    pub fn new(value: T) -> Self {
        Self::from(Some(value))
    }

    /// Field decoded from `location` on first access.
    pub fn from_location(location: HduLocation) -> Self {
        Self {
            value: OnceCell::new(),
            location: Some(location),
        }
    }

    pub fn location(&self) -> Option<&HduLocation> {
        self.location.as_ref()
    }

    pub fn is_loaded(&self) -> bool {
        self.value.get().is_some()
    }

    pub fn get(&self) -> Result<Option<&T>, DatasetError> {
        let value = self.value.get_or_try_init(|| match &self.location {
            Some(location) => {
                debug!(
                    "Loading HDU '{}' from {}",
                    location.hdu_name,
                    location.path.display()
                );
                load(location)
            }
            None => Ok(None),
        })?;
        Ok(value.as_ref())
    }

    pub fn get_mut(&mut self) -> Result<Option<&mut T>, DatasetError> {
        self.get()?;
        Ok(self.value.get_mut().and_then(|v| v.as_mut()))
    }

    /// Replace the value; the field is no longer backed by a file.
    pub fn set(&mut self, value: Option<T>) {
        self.value = OnceCell::from(value);
        self.location = None;
    }

    /// Move the value out, leaving the field empty.
    pub fn take(&mut self) -> Result<Option<T>, DatasetError> {
        self.get()?;
        let value = self.value.take().flatten();
        self.set(None);
        Ok(value)
    }

    /// Drop the loaded value of a file-backed field. In-memory fields are kept.
    pub fn evict(&mut self) -> bool {
        match &self.location {
            Some(location) if self.value.get().is_some() => {
                debug!("Evicting HDU '{}'", location.hdu_name);
                self.value = OnceCell::new();
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{DatasetFile, HduKind, HDU_COUNTS};
    use crate::stats::StatType;
    use skymaps::{Geom, Map, SkyCoord};

    fn write_counts(dir: &std::path::Path) -> std::path::PathBuf {
        let geom = Geom::create(SkyCoord::icrs(0.0, 0.0), 1.0, (2, 2), vec![]).unwrap();
        let mut file = DatasetFile::new("lazy", StatType::Cash);
        file.insert_map(HDU_COUNTS, &Map::from_elem(geom, 3.0, ""));
        let path = dir.join("dataset.json");
        file.write(&path, false).unwrap();
        path
    }

    #[test]
    fn test_in_memory_field() {
        let geom = Geom::create(SkyCoord::icrs(0.0, 0.0), 1.0, (2, 2), vec![]).unwrap();
        let mut field = LazyField::new(Map::from_elem(geom, 1.0, ""));
        assert!(field.is_loaded());
        assert!(!field.evict());
        assert_eq!(field.get().unwrap().unwrap().sum(), 4.0);
        let taken = field.take().unwrap();
        assert!(taken.is_some());
        assert!(field.get().unwrap().is_none());
    }

    #[test]
    fn test_lazy_load_and_evict() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_counts(dir.path());
        let mut field: LazyField<Map> =
            LazyField::from_location(HduLocation::new(&path, HDU_COUNTS, HduKind::Map));
        assert!(!field.is_loaded());
        assert_eq!(field.get().unwrap().unwrap().sum(), 12.0);
        assert!(field.is_loaded());
        assert!(field.evict());
        assert!(!field.is_loaded());
        assert_eq!(field.get().unwrap().unwrap().sum(), 12.0);
    }

    #[test]
    fn test_set_detaches_location() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_counts(dir.path());
        let mut field: LazyField<Map> =
            LazyField::from_location(HduLocation::new(&path, HDU_COUNTS, HduKind::Map));
        field.set(None);
        assert!(field.location().is_none());
        assert!(field.get().unwrap().is_none());
    }
}
