//! Test helpers for the sky map workspace
//!
//! This crate provides standard geometries, IRFs and scratch directories
//! shared by the tests of the other crates.

use irf::PsfMap;
use once_cell::sync::Lazy;
use skymaps::{Geom, MapAxis, SkyCoord};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Error type for test helper operations
#[derive(thiserror::Error, Debug)]
pub enum TestHelperError {
    #[error("Failed to create scratch directory: {0}")]
    ScratchDir(#[from] std::io::Error),
}

/// Reconstructed energy axis with `nbin` log bins between `lo` and `hi` TeV.
pub fn energy_axis(lo: f64, hi: f64, nbin: usize) -> MapAxis {
    MapAxis::from_energy_bounds(lo, hi, nbin, "TeV", "energy").expect("valid energy bounds")
}

/// True energy axis with `nbin` log bins between `lo` and `hi` TeV.
pub fn energy_axis_true(lo: f64, hi: f64, nbin: usize) -> MapAxis {
    MapAxis::from_energy_bounds(lo, hi, nbin, "TeV", "energy_true").expect("valid energy bounds")
}

/// Migration axis 0.2 - 5 in 48 bins.
pub fn migra_axis() -> MapAxis {
    irf::default_migra_axis().expect("valid migra bounds")
}

/// 2 x 2 deg CAR grid at 0.02 deg/pixel centered on the Galactic center,
/// four energy bins between 1 and 10 TeV.
pub static GEOM_2DEG: Lazy<Geom> = Lazy::new(|| {
    Geom::create(
        SkyCoord::galactic(0.0, 0.0),
        0.02,
        (100, 100),
        vec![energy_axis(1.0, 10.0, 4)],
    )
    .expect("valid geometry")
});

/// Small CAR grid for fast tests: `npix` x `npix` pixels of `binsz` degrees
/// with `nbin` energy bins between 1 and 10 TeV.
pub fn small_geom(npix: usize, binsz: f64, nbin: usize) -> Geom {
    Geom::create(
        SkyCoord::icrs(83.63, 22.01),
        binsz,
        (npix, npix),
        vec![energy_axis(1.0, 10.0, nbin)],
    )
    .expect("valid geometry")
}

/// Position independent Gaussian PSF on the default all-sky grid.
pub fn gauss_psf(energy_axis_true: &MapAxis, sigma: f64) -> PsfMap {
    PsfMap::from_gauss(energy_axis_true, None, &[sigma], None).expect("valid Gaussian PSF")
}

/// Scratch directory removed when dropped.
pub fn scratch_dir() -> Result<TempDir, TestHelperError> {
    Ok(tempfile::Builder::new().prefix("skymaps-test").tempdir()?)
}

/// Returns a path within a scratch directory.
///
/// # Arguments
/// * `dir` - The scratch directory
/// * `path` - The relative path within it
pub fn scratch_path<P: AsRef<Path>>(dir: &TempDir, path: P) -> PathBuf {
    dir.path().join(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geom_2deg_shape() {
        assert_eq!(GEOM_2DEG.data_shape(), vec![4, 100, 100]);
    }

    #[test]
    fn test_scratch_dir_created() {
        let dir = scratch_dir().unwrap();
        assert!(dir.path().is_dir());
        let path = scratch_path(&dir, "dataset.json");
        assert_eq!(path, dir.path().join("dataset.json"));
    }

    #[test]
    fn test_gauss_psf_axes() {
        let psf = gauss_psf(&energy_axis_true(1.0, 10.0, 2), 0.1);
        assert_eq!(psf.rad_axis().unwrap().nbin(), 66);
    }
}
