//! Normalized PSF convolution kernels.

use ndarray::{ArrayView2, Axis};
use skymaps::Map;

use crate::error::IrfError;

/// PSF kernel: one normalized image per true-energy bin on an odd-sized grid.
#[derive(Debug, Clone, PartialEq)]
pub struct PsfKernel {
    psf_kernel_map: Map,
}

impl PsfKernel {
    /// Wrap a kernel map with axes `[energy_true]` (or an image).
    ///
    /// The spatial grid must have an odd number of pixels in both dimensions
    /// so the kernel has a central pixel.
    pub fn new(psf_kernel_map: Map) -> Result<Self, IrfError> {
        let (nx, ny) = psf_kernel_map.geom().npix();
        if nx % 2 == 0 || ny % 2 == 0 {
            return Err(IrfError::InvalidParameter(format!(
                "PSF kernel needs odd pixel counts, got ({nx}, {ny})"
            )));
        }
        if psf_kernel_map.geom().axes().len() > 1 {
            return Err(IrfError::InvalidParameter(
                "PSF kernel supports at most one non-spatial axis".to_string(),
            ));
        }
        Ok(Self { psf_kernel_map })
    }

    pub fn psf_kernel_map(&self) -> &Map {
        &self.psf_kernel_map
    }

    /// Number of kernel images.
    pub fn n_energy(&self) -> usize {
        let data = self.psf_kernel_map.data();
        if data.ndim() == 3 {
            data.shape()[0]
        } else {
            1
        }
    }

    /// Kernel image for true-energy bin `idx`.
    pub fn kernel_image(&self, idx: usize) -> ArrayView2<f64> {
        let data = self.psf_kernel_map.data();
        let view = if data.ndim() == 3 {
            data.index_axis(Axis(0), idx)
        } else {
            data.view()
        };
        view.into_dimensionality()
            .unwrap_or_else(|_| unreachable!("kernel data is two-dimensional per energy"))
    }

    /// Scale each energy slice to unit sum. Empty slices are left at zero.
    pub fn normalize(&mut self) {
        let data = self.psf_kernel_map.data_mut();
        if data.ndim() == 3 {
            for mut slice in data.axis_iter_mut(Axis(0)) {
                let total = slice.sum();
                if total > 0.0 {
                    slice.mapv_inplace(|v| v / total);
                }
            }
        } else {
            let total = data.sum();
            if total > 0.0 {
                data.mapv_inplace(|v| v / total);
            }
        }
    }

    /// Sum of each energy slice.
    pub fn slice_sums(&self) -> Vec<f64> {
        (0..self.n_energy())
            .map(|i| self.kernel_image(i).sum())
            .collect()
    }

    /// `(ix, iy)` of the brightest pixel of energy slice `idx`.
    pub fn peak_pixel(&self, idx: usize) -> (usize, usize) {
        let image = self.kernel_image(idx);
        let mut best = (0, 0);
        let mut best_value = f64::NEG_INFINITY;
        for ((iy, ix), v) in image.indexed_iter() {
            if *v > best_value {
                best_value = *v;
                best = (ix, iy);
            }
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use skymaps::{Geom, MapAxis, SkyCoord};

    #[test]
    fn test_even_grid_rejected() {
        let geom = Geom::create(SkyCoord::icrs(0.0, 0.0), 0.1, (4, 5), vec![]).unwrap();
        assert!(PsfKernel::new(Map::from_geom(geom, "")).is_err());
    }

    #[test]
    fn test_normalize_per_slice() {
        let etrue = MapAxis::from_energy_bounds(1.0, 10.0, 2, "TeV", "energy_true").unwrap();
        let geom = Geom::create(SkyCoord::icrs(0.0, 0.0), 0.1, (3, 3), vec![etrue]).unwrap();
        let mut map = Map::from_elem(geom, 2.0, "");
        map.data_mut()[[1, 1, 1]] = 20.0;
        let mut kernel = PsfKernel::new(map).unwrap();
        kernel.normalize();
        for total in kernel.slice_sums() {
            assert_relative_eq!(total, 1.0, epsilon = 1e-12);
        }
        assert_eq!(kernel.peak_pixel(1), (1, 1));
    }
}
