//! Multi-linear interpolation on regular N-dimensional grids.
//!
//! Grid points along each dimension may be irregularly spaced; they are
//! transformed into the dimension's [`AxisInterp`] scale before linear
//! interpolation, so log-scaled energy axes interpolate linearly in `ln(E)`.
//! Values may additionally be interpolated in log space, which is how
//! steeply falling IRF tables are usually handled.

use ndarray::{ArrayD, IxDyn};
use thiserror::Error;

use crate::axis::AxisInterp;

/// Smallest value kept when interpolating values in log scale.
pub const LOG_TINY: f64 = 1e-300;

/// Errors raised by the interpolator.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InterpolationError {
    #[error("coordinate {value} on dimension {dim} is outside [{min}, {max}]")]
    OutOfBounds {
        dim: usize,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("data shape {data_shape:?} does not match grid lengths {grid_lengths:?}")]
    DimensionMismatch {
        grid_lengths: Vec<usize>,
        data_shape: Vec<usize>,
    },

    #[error("grid points on dimension {0} must be finite and strictly increasing")]
    UnsortedPoints(usize),

    #[error("expected {expected} coordinates, got {actual}")]
    WrongArity { expected: usize, actual: usize },
}

/// Behaviour outside the grid.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Bounds {
    /// Extend the outermost cell linearly.
    Extrapolate,
    /// Return a constant.
    Fill(f64),
    /// Return an error.
    Error,
}

/// Multi-linear interpolator over a regular grid.
#[derive(Debug, Clone)]
pub struct RegularGridInterpolator {
    /// Grid points per dimension, already transformed by the dimension scale
    points: Vec<Vec<f64>>,
    scales: Vec<AxisInterp>,
    /// Values, transformed by `value_scale`
    values: ArrayD<f64>,
    value_scale: AxisInterp,
    bounds: Bounds,
    clip: bool,
}

impl RegularGridInterpolator {
    /// Create an interpolator.
    ///
    /// # Arguments
    /// * `points` - Grid coordinates per dimension, each strictly increasing
    /// * `scales` - Interpolation scale per dimension
    /// * `values` - Data with shape `(points[0].len(), points[1].len(), ...)`
    pub fn new(
        points: Vec<Vec<f64>>,
        scales: Vec<AxisInterp>,
        values: ArrayD<f64>,
    ) -> Result<Self, InterpolationError> {
        let grid_lengths: Vec<usize> = points.iter().map(|p| p.len()).collect();
        if grid_lengths != values.shape() || scales.len() != points.len() {
            return Err(InterpolationError::DimensionMismatch {
                grid_lengths,
                data_shape: values.shape().to_vec(),
            });
        }

        let mut scaled_points = Vec::with_capacity(points.len());
        for (dim, (pts, scale)) in points.iter().zip(scales.iter()).enumerate() {
            let scaled: Vec<f64> = pts.iter().map(|v| scale.forward(*v)).collect();
            if scaled.iter().any(|v| !v.is_finite()) || scaled.windows(2).any(|w| w[1] <= w[0]) {
                return Err(InterpolationError::UnsortedPoints(dim));
            }
            scaled_points.push(scaled);
        }

        Ok(Self {
            points: scaled_points,
            scales,
            values,
            value_scale: AxisInterp::Lin,
            bounds: Bounds::Extrapolate,
            clip: true,
        })
    }

    /// Interpolate values in log scale. Values are clipped at [`LOG_TINY`].
    pub fn with_log_values(mut self) -> Self {
        self.values.mapv_inplace(|v| v.max(LOG_TINY).ln());
        self.value_scale = AxisInterp::Log;
        self
    }

    pub fn with_bounds(mut self, bounds: Bounds) -> Self {
        self.bounds = bounds;
        self
    }

    /// Clip negative results to zero (enabled by default).
    pub fn with_clip(mut self, clip: bool) -> Self {
        self.clip = clip;
        self
    }

    pub fn ndim(&self) -> usize {
        self.points.len()
    }

    /// Find indices and interpolation weight for a scaled coordinate.
    ///
    /// Returns (lower_index, weight) where weight is the fraction of the way
    /// from `lower_index` to `lower_index + 1`. `None` signals out of bounds
    /// when extrapolation is disabled.
    fn find_index_and_weight(&self, dim: usize, value: f64) -> Option<(usize, f64)> {
        let coords = &self.points[dim];
        let n = coords.len();
        if n == 1 {
            return Some((0, 0.0));
        }
        let outside = value < coords[0] || value > coords[n - 1];
        if outside && self.bounds != Bounds::Extrapolate {
            return None;
        }

        let left = coords.partition_point(|c| *c <= value).clamp(1, n - 1) - 1;
        let weight = (value - coords[left]) / (coords[left + 1] - coords[left]);
        Some((left, weight))
    }

    /// Interpolate at a single point.
    pub fn evaluate(&self, coords: &[f64]) -> Result<f64, InterpolationError> {
        if coords.len() != self.ndim() {
            return Err(InterpolationError::WrongArity {
                expected: self.ndim(),
                actual: coords.len(),
            });
        }

        let mut cell = Vec::with_capacity(self.ndim());
        for (dim, (value, scale)) in coords.iter().zip(self.scales.iter()).enumerate() {
            let scaled = scale.forward(*value);
            match self.find_index_and_weight(dim, scaled) {
                Some(found) => cell.push(found),
                None => {
                    return match self.bounds {
                        Bounds::Fill(fill) => Ok(fill),
                        _ => Err(InterpolationError::OutOfBounds {
                            dim,
                            value: *value,
                            min: scale.inverse(self.points[dim][0]),
                            max: scale.inverse(self.points[dim][self.points[dim].len() - 1]),
                        }),
                    }
                }
            }
        }

        // Sum over the 2^N corners of the cell
        let ndim = self.ndim();
        let mut index = vec![0usize; ndim];
        let mut total = 0.0;
        for corner in 0..(1usize << ndim) {
            let mut weight = 1.0;
            for (dim, (lower, frac)) in cell.iter().enumerate() {
                let upper = corner >> dim & 1 == 1;
                let single = self.points[dim].len() == 1;
                if upper && single {
                    weight = 0.0;
                    break;
                }
                index[dim] = if upper { lower + 1 } else { *lower };
                weight *= if upper { *frac } else { 1.0 - frac };
            }
            if weight != 0.0 {
                total += weight * self.values[IxDyn(&index)];
            }
        }

        let value = self.value_scale.inverse(total);
        if self.value_scale == AxisInterp::Log && value <= 10.0 * LOG_TINY {
            return Ok(0.0);
        }
        Ok(if self.clip { value.max(0.0) } else { value })
    }

    /// Interpolate at many points, one row of coordinates per point.
    pub fn evaluate_many(&self, coords: &[Vec<f64>]) -> Result<Vec<f64>, InterpolationError> {
        coords.iter().map(|c| self.evaluate(c)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::{Array1, Array2};

    fn plane() -> RegularGridInterpolator {
        // f(x, y) = 2x + 3y
        let x = vec![0.0, 1.0, 3.0];
        let y = vec![0.0, 2.0];
        let data = Array2::from_shape_fn((3, 2), |(i, j)| 2.0 * x[i] + 3.0 * y[j]);
        RegularGridInterpolator::new(
            vec![x.clone(), y.clone()],
            vec![AxisInterp::Lin, AxisInterp::Lin],
            data.into_dyn(),
        )
        .unwrap()
    }

    #[test]
    fn test_plane_is_exact() {
        let interp = plane();
        assert_relative_eq!(interp.evaluate(&[0.5, 1.0]).unwrap(), 4.0, epsilon = 1e-12);
        assert_relative_eq!(interp.evaluate(&[2.0, 0.5]).unwrap(), 5.5, epsilon = 1e-12);
    }

    #[test]
    fn test_extrapolation_and_fill() {
        let interp = plane().with_clip(false);
        assert_relative_eq!(interp.evaluate(&[4.0, 1.0]).unwrap(), 11.0, epsilon = 1e-12);

        let filled = plane().with_bounds(Bounds::Fill(f64::NAN));
        assert!(filled.evaluate(&[4.0, 1.0]).unwrap().is_nan());

        let strict = plane().with_bounds(Bounds::Error);
        assert!(matches!(
            strict.evaluate(&[4.0, 1.0]),
            Err(InterpolationError::OutOfBounds { dim: 0, .. })
        ));
    }

    #[test]
    fn test_clip_negative() {
        let interp = plane();
        assert_eq!(interp.evaluate(&[-5.0, 0.0]).unwrap(), 0.0);
    }

    #[test]
    fn test_log_scales() {
        // Power law sampled on a log grid is exact in log-log interpolation
        let e: Vec<f64> = vec![1.0, 10.0, 100.0];
        let data = Array1::from_iter(e.iter().map(|v| v.powf(-2.0)));
        let interp =
            RegularGridInterpolator::new(vec![e], vec![AxisInterp::Log], data.into_dyn())
                .unwrap()
                .with_log_values();
        assert_relative_eq!(interp.evaluate(&[3.0]).unwrap(), 1.0 / 9.0, max_relative = 1e-10);
    }

    #[test]
    fn test_single_point_dimension() {
        let data = Array2::from_shape_vec((1, 2), vec![1.0, 3.0]).unwrap();
        let interp = RegularGridInterpolator::new(
            vec![vec![5.0], vec![0.0, 1.0]],
            vec![AxisInterp::Lin, AxisInterp::Lin],
            data.into_dyn(),
        )
        .unwrap();
        assert_relative_eq!(interp.evaluate(&[7.0, 0.5]).unwrap(), 2.0, epsilon = 1e-12);
    }

    #[test]
    fn test_dimension_mismatch() {
        let data = Array2::<f64>::zeros((2, 2));
        let result = RegularGridInterpolator::new(
            vec![vec![0.0, 1.0, 2.0], vec![0.0, 1.0]],
            vec![AxisInterp::Lin, AxisInterp::Lin],
            data.into_dyn(),
        );
        assert!(matches!(result, Err(InterpolationError::DimensionMismatch { .. })));
    }
}
