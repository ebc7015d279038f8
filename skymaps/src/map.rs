//! Binned maps: a geometry, an N-dimensional array and a unit.
//!
//! [`Map<f64>`] holds counts, exposure and IRF values; [`MaskMap`] holds
//! boolean masks. All structural operations return new maps and keep the
//! array shape equal to `geom.data_shape()`.
//!
//! Spatial operations act on the two innermost array dimensions `(ny, nx)`.
//! Non-spatial operations address axes by name.

use ndarray::{ArrayD, Axis, Dimension, IxDyn, Slice, Zip};
use std::collections::BTreeMap;
use std::ops::Range;

use crate::axis::{AxisInterp, MapAxis};
use crate::coord::SkyCoord;
use crate::error::MapError;
use crate::geom::{CutoutSlices, Geom};
use crate::interpolate::{Bounds, RegularGridInterpolator};
use crate::region::SkyRegion;

/// Boolean mask map.
pub type MaskMap = Map<bool>;

/// Selection along a non-spatial axis for [`Map::slice_by_idx`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AxisSlice {
    /// Keep the bins in the range.
    Range(Range<usize>),
    /// Keep a single bin and drop the axis.
    Index(usize),
}

/// Padding mode for [`Map::pad`].
#[derive(Debug, Clone, PartialEq)]
pub enum PadMode<T> {
    Constant(T),
    /// Repeat the outermost pixel.
    Edge,
}

/// Reduction applied by [`Map::to_region_nd_map`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionReduce {
    Sum,
    Mean,
}

/// A map: geometry, data, unit and scalar metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Map<T = f64> {
    geom: Geom,
    data: ArrayD<T>,
    unit: String,
    meta: BTreeMap<String, f64>,
}

fn shape_error(expected: &[usize], actual: &[usize]) -> MapError {
    MapError::ShapeMismatch {
        expected: expected.to_vec(),
        actual: actual.to_vec(),
    }
}

/// Index ranges where a child grid offset by `offset` overlaps a parent of `parent_n` pixels.
fn overlap(offset: isize, child_n: usize, parent_n: usize) -> Option<(Range<usize>, Range<usize>)> {
    let start = offset.max(0);
    let end = (offset + child_n as isize).min(parent_n as isize);
    if end <= start {
        return None;
    }
    let parent = start as usize..end as usize;
    let child = (start - offset) as usize..(end - offset) as usize;
    Some((parent, child))
}

impl<T: Clone> Map<T> {
    /// Wrap existing data, checking its shape against the geometry.
    pub fn from_data(geom: Geom, data: ArrayD<T>, unit: &str) -> Result<Self, MapError> {
        let expected = geom.data_shape();
        if data.shape() != expected.as_slice() {
            return Err(shape_error(&expected, data.shape()));
        }
        Ok(Self {
            geom,
            data,
            unit: unit.to_string(),
            meta: BTreeMap::new(),
        })
    }

    /// Map filled with `value`.
    pub fn from_elem(geom: Geom, value: T, unit: &str) -> Self {
        let data = ArrayD::from_elem(IxDyn(&geom.data_shape()), value);
        Self {
            geom,
            data,
            unit: unit.to_string(),
            meta: BTreeMap::new(),
        }
    }

    pub fn geom(&self) -> &Geom {
        &self.geom
    }

    pub fn data(&self) -> &ArrayD<T> {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut ArrayD<T> {
        &mut self.data
    }

    pub fn into_data(self) -> ArrayD<T> {
        self.data
    }

    pub fn unit(&self) -> &str {
        &self.unit
    }

    pub fn set_unit(&mut self, unit: &str) {
        self.unit = unit.to_string();
    }

    pub fn with_unit(mut self, unit: &str) -> Self {
        self.unit = unit.to_string();
        self
    }

    pub fn meta(&self) -> &BTreeMap<String, f64> {
        &self.meta
    }

    pub fn meta_mut(&mut self) -> &mut BTreeMap<String, f64> {
        &mut self.meta
    }

    /// Same geometry and metadata, new data of the same shape.
    fn with_data<U: Clone>(&self, geom: Geom, data: ArrayD<U>) -> Map<U> {
        Map {
            geom,
            data,
            unit: self.unit.clone(),
            meta: self.meta.clone(),
        }
    }

    /// Apply `f` to every value.
    pub fn map_values<U: Clone>(&self, f: impl Fn(&T) -> U) -> Map<U> {
        self.with_data(self.geom.clone(), self.data.map(f))
    }

    fn spatial_dims(&self) -> (usize, usize) {
        let nd = self.data.ndim();
        (nd - 2, nd - 1)
    }

    /// Broadcast `other` to the shape of this map's data.
    fn broadcast_other<'a, U>(
        &self,
        other: &'a ArrayD<U>,
    ) -> Result<ndarray::ArrayViewD<'a, U>, MapError> {
        other
            .broadcast(self.data.raw_dim())
            .ok_or_else(|| shape_error(self.data.shape(), other.shape()))
    }

    /// Cutout of `width` degrees centered on `position`, trimmed to the map.
    pub fn cutout(&self, position: &SkyCoord, width: (f64, f64)) -> Result<Self, MapError> {
        let slices = self.geom.cutout_slices(position, width)?;
        self.cutout_by_slices(&slices)
    }

    /// Cutout given pixel ranges of this map's grid.
    pub fn cutout_by_slices(&self, slices: &CutoutSlices) -> Result<Self, MapError> {
        let geom = self.geom.sub_geom(slices)?;
        let (ydim, xdim) = self.spatial_dims();
        let data = self
            .data
            .slice_each_axis(|ax| {
                if ax.axis.index() == xdim {
                    Slice::from(slices.x.clone())
                } else if ax.axis.index() == ydim {
                    Slice::from(slices.y.clone())
                } else {
                    Slice::from(..)
                }
            })
            .to_owned();
        Ok(self.with_data(geom, data))
    }

    /// Enlarge the map by `width` pixels on every side.
    pub fn pad(&self, width: usize, mode: PadMode<T>) -> Result<Self, MapError> {
        let geom = self.geom.pad(width)?;
        let (ydim, xdim) = self.spatial_dims();
        let (nx, ny) = self.geom.npix();
        let w = width as isize;
        let data = ArrayD::from_shape_fn(IxDyn(&geom.data_shape()), |idx| {
            let mut src: Vec<usize> = idx.slice().to_vec();
            let x = src[xdim] as isize - w;
            let y = src[ydim] as isize - w;
            let inside = x >= 0 && y >= 0 && x < nx as isize && y < ny as isize;
            match (&mode, inside) {
                (PadMode::Constant(value), false) => value.clone(),
                _ => {
                    src[xdim] = x.clamp(0, nx as isize - 1) as usize;
                    src[ydim] = y.clamp(0, ny as isize - 1) as usize;
                    self.data[IxDyn(&src)].clone()
                }
            }
        });
        Ok(self.with_data(geom, data))
    }

    /// Slice non-spatial axes by index. Names of absent axes are ignored.
    pub fn slice_by_idx(&self, slices: &[(&str, AxisSlice)]) -> Result<Self, MapError> {
        let mut geom = self.geom.clone();
        let mut data = self.data.clone();
        for (name, slice) in slices {
            if !geom.has_axis(name) {
                continue;
            }
            let dim = Axis(geom.data_axis_index(name)?);
            let axis = geom.axis(name)?.clone();
            match slice {
                AxisSlice::Range(range) => {
                    let sliced = axis.slice(range.clone())?;
                    data = data.slice_axis(dim, Slice::from(range.clone())).to_owned();
                    geom = geom.replace_axis(sliced)?;
                }
                AxisSlice::Index(index) => {
                    if *index >= axis.nbin() {
                        return Err(MapError::IndexOutOfRange {
                            axis: name.to_string(),
                            index: *index,
                            nbin: axis.nbin(),
                        });
                    }
                    data = data.index_axis(dim, *index).to_owned();
                    geom = geom.drop(name)?;
                }
            }
        }
        Ok(self.with_data(geom, data))
    }

    /// Spatial image at the given non-spatial indices (declared axis order).
    pub fn get_image_by_idx(&self, idx: &[usize]) -> Result<Self, MapError> {
        let names: Vec<String> = self.geom.axes().names().iter().map(|s| s.to_string()).collect();
        if idx.len() != names.len() {
            return Err(shape_error(&[names.len()], &[idx.len()]));
        }
        let slices: Vec<(&str, AxisSlice)> = names
            .iter()
            .zip(idx.iter())
            .map(|(n, i)| (n.as_str(), AxisSlice::Index(*i)))
            .collect();
        self.slice_by_idx(&slices)
    }

    /// Broadcast an image to a cube with the given axes.
    pub fn to_cube(&self, axes: Vec<MapAxis>) -> Result<Self, MapError> {
        let geom = self.geom.to_cube(axes)?;
        let shape = geom.data_shape();
        let data = self
            .data
            .broadcast(IxDyn(&shape))
            .ok_or_else(|| shape_error(&shape, self.data.shape()))?
            .to_owned();
        Ok(self.with_data(geom, data))
    }

    /// Nearest-neighbour projection onto another geometry.
    ///
    /// Spatial pixels outside this map take `fill`, or the nearest edge pixel
    /// when `extrapolate` is set. Non-spatial bins outside the source axes
    /// always take `fill`. Source axes absent from `geom` must have one bin.
    pub fn interp_to_geom(&self, geom: &Geom, extrapolate: bool, fill: T) -> Result<Self, MapError> {
        let src_axes = self.geom.axes();
        for axis in src_axes.iter() {
            if !geom.has_axis(axis.name()) && axis.nbin() != 1 {
                return Err(MapError::AxisNotFound(axis.name().to_string()));
            }
        }

        // Source index per target bin, per target non-spatial axis
        let target_axes = geom.axes();
        let mut axis_lookup: Vec<Option<Vec<Option<usize>>>> = Vec::new();
        for axis in target_axes.iter() {
            match src_axes.get(axis.name()) {
                Ok(src) => axis_lookup.push(Some(
                    axis.center().iter().map(|c| src.coord_to_idx(*c)).collect(),
                )),
                Err(_) => axis_lookup.push(None),
            }
        }

        let (nx, ny) = self.geom.npix();
        let spatial_lookup = geom.pixel_centers().mapv(|coord| {
            let (x, y) = self.geom.coord_to_pix(&coord);
            if !x.is_finite() || !y.is_finite() {
                return None;
            }
            let (ix, iy) = ((x + 0.5).floor(), (y + 0.5).floor());
            let inside = ix >= 0.0 && iy >= 0.0 && ix < nx as f64 && iy < ny as f64;
            if inside {
                Some((ix as usize, iy as usize))
            } else if extrapolate {
                Some((
                    ix.clamp(0.0, nx as f64 - 1.0) as usize,
                    iy.clamp(0.0, ny as f64 - 1.0) as usize,
                ))
            } else {
                None
            }
        });

        let n_target_axes = target_axes.len();
        let src_ndim = self.data.ndim();
        let data = ArrayD::from_shape_fn(IxDyn(&geom.data_shape()), |idx| {
            let idx = idx.slice();
            let (iy, ix) = (idx[n_target_axes], idx[n_target_axes + 1]);
            let Some((sx, sy)) = spatial_lookup[[iy, ix]] else {
                return fill.clone();
            };
            let mut src = vec![0usize; src_ndim];
            src[src_ndim - 2] = sy;
            src[src_ndim - 1] = sx;
            for (k, lookup) in axis_lookup.iter().enumerate() {
                let Some(lookup) = lookup else { continue };
                let target_pos = n_target_axes - 1 - k;
                let name = target_axes[k].name();
                let src_pos = src_axes.len() - 1 - src_axes.index_of(name).unwrap_or(0);
                match lookup[idx[target_pos]] {
                    Some(i) => src[src_pos] = i,
                    None => return fill.clone(),
                }
            }
            self.data[IxDyn(&src)].clone()
        });
        Ok(self.with_data(geom.clone(), data))
    }

    /// Paste `other` into the aligned sub-region of this map, combining values with `op`.
    fn paste_with(
        &mut self,
        other_geom: &Geom,
        other_data: &ArrayD<T>,
        op: impl Fn(&mut T, &T),
    ) -> Result<(), MapError> {
        let nd = self.data.ndim();
        if other_data.ndim() != nd || other_data.shape()[..nd - 2] != self.data.shape()[..nd - 2] {
            return Err(shape_error(self.data.shape(), other_data.shape()));
        }
        let (dx, dy) = other_geom.offset_in(&self.geom)?;
        let (cnx, cny) = other_geom.npix();
        let (pnx, pny) = self.geom.npix();
        let (Some((px, cx)), Some((py, cy))) = (overlap(dx, cnx, pnx), overlap(dy, cny, pny))
        else {
            return Ok(());
        };
        let (ydim, xdim) = (nd - 2, nd - 1);
        let pick = |x: &Range<usize>, y: &Range<usize>| {
            let (x, y) = (x.clone(), y.clone());
            move |ax: ndarray::AxisDescription| {
                if ax.axis.index() == xdim {
                    Slice::from(x.clone())
                } else if ax.axis.index() == ydim {
                    Slice::from(y.clone())
                } else {
                    Slice::from(..)
                }
            }
        };
        let source = other_data.slice_each_axis(pick(&cx, &cy));
        let mut target = self.data.slice_each_axis_mut(pick(&px, &py));
        Zip::from(&mut target).and(&source).for_each(|t, s| op(t, s));
        Ok(())
    }
}

impl<T: Clone + Default> Map<T> {
    /// Map filled with the default value (zeros / false).
    pub fn from_geom(geom: Geom, unit: &str) -> Self {
        Self::from_elem(geom, T::default(), unit)
    }
}

impl Map<f64> {
    /// Elementwise binary operation; `other` is broadcast to this map's shape.
    pub fn zip_with(&self, other: &Map<f64>, f: impl Fn(f64, f64) -> f64) -> Result<Self, MapError> {
        let rhs = self.broadcast_other(&other.data)?;
        let mut data = self.data.clone();
        Zip::from(&mut data).and(&rhs).for_each(|a, &b| *a = f(*a, b));
        Ok(self.with_data(self.geom.clone(), data))
    }

    pub fn checked_add(&self, other: &Map<f64>) -> Result<Self, MapError> {
        self.zip_with(other, |a, b| a + b)
    }

    pub fn checked_sub(&self, other: &Map<f64>) -> Result<Self, MapError> {
        self.zip_with(other, |a, b| a - b)
    }

    pub fn checked_mul(&self, other: &Map<f64>) -> Result<Self, MapError> {
        self.zip_with(other, |a, b| a * b)
    }

    pub fn checked_div(&self, other: &Map<f64>) -> Result<Self, MapError> {
        self.zip_with(other, |a, b| a / b)
    }

    /// Multiply in place by a broadcastable array.
    pub fn mul_assign_data(&mut self, other: &ArrayD<f64>) -> Result<(), MapError> {
        let shape = self.data.raw_dim();
        let rhs = other
            .broadcast(shape)
            .ok_or_else(|| shape_error(self.data.shape(), other.shape()))?;
        Zip::from(&mut self.data).and(&rhs).for_each(|a, &b| *a *= b);
        Ok(())
    }

    pub fn mul_scalar(&self, value: f64) -> Self {
        self.with_data(self.geom.clone(), self.data.mapv(|v| v * value))
    }

    pub fn mapv(&self, f: impl Fn(f64) -> f64) -> Self {
        self.with_data(self.geom.clone(), self.data.mapv(f))
    }

    pub fn sum(&self) -> f64 {
        self.data.sum()
    }

    /// Sum of the values where the broadcast mask is true.
    pub fn sum_masked(&self, mask: &MaskMap) -> Result<f64, MapError> {
        let m = self.broadcast_other(&mask.data)?;
        let mut total = 0.0;
        Zip::from(&self.data).and(&m).for_each(|v, &keep| {
            if keep {
                total += v;
            }
        });
        Ok(total)
    }

    /// Replace non-finite values by zero.
    pub fn nan_to_num(&mut self) {
        self.data.mapv_inplace(|v| if v.is_finite() { v } else { 0.0 });
    }

    /// Clip values below `min`.
    pub fn clip_min(&mut self, min: f64) {
        self.data.mapv_inplace(|v| if v < min { min } else { v });
    }

    /// Set values to NaN where the broadcast mask is false.
    pub fn masked_nan(&self, mask: &MaskMap) -> Result<Self, MapError> {
        let m = self.broadcast_other(&mask.data)?;
        let mut data = self.data.clone();
        Zip::from(&mut data).and(&m).for_each(|v, &keep| {
            if !keep {
                *v = f64::NAN;
            }
        });
        Ok(self.with_data(self.geom.clone(), data))
    }

    /// Add `other` into the aligned sub-region of this map.
    ///
    /// # Arguments
    /// * `other` - Map on an aligned (possibly smaller) spatial grid with the
    ///   same non-spatial shape
    /// * `weights` - Optional mask broadcast to `other`; false bins are dropped
    /// * `nan_to_num` - Replace non-finite contributions by zero
    pub fn stack(
        &mut self,
        other: &Map<f64>,
        weights: Option<&MaskMap>,
        nan_to_num: bool,
    ) -> Result<(), MapError> {
        let mut contribution = other.data.clone();
        if let Some(weights) = weights {
            let w = weights
                .data
                .broadcast(contribution.raw_dim())
                .ok_or_else(|| shape_error(contribution.shape(), weights.data.shape()))?;
            Zip::from(&mut contribution).and(&w).for_each(|v, &keep| {
                if !keep {
                    *v = 0.0;
                }
            });
        }
        if nan_to_num {
            contribution.mapv_inplace(|v| if v.is_finite() { v } else { 0.0 });
        }
        self.paste_with(&other.geom, &contribution, |t, s| *t += *s)
    }

    /// Spatial downsampling by merging `factor` x `factor` pixels.
    ///
    /// With `preserve_counts` the block sum is kept, otherwise the block mean.
    pub fn downsample(
        &self,
        factor: usize,
        preserve_counts: bool,
        weights: Option<&MaskMap>,
    ) -> Result<Self, MapError> {
        let geom = self.geom.downsample(factor)?;
        let source = match weights {
            Some(w) => {
                let m = self.broadcast_other(&w.data)?;
                let mut d = self.data.clone();
                Zip::from(&mut d).and(&m).for_each(|v, &keep| {
                    if !keep {
                        *v = 0.0;
                    }
                });
                d
            }
            None => self.data.clone(),
        };
        let (ydim, xdim) = self.spatial_dims();
        let norm = if preserve_counts {
            1.0
        } else {
            (factor * factor) as f64
        };
        let data = ArrayD::from_shape_fn(IxDyn(&geom.data_shape()), |idx| {
            let mut src: Vec<usize> = idx.slice().to_vec();
            let (oy, ox) = (src[ydim], src[xdim]);
            let mut total = 0.0;
            for dy in 0..factor {
                for dx in 0..factor {
                    src[ydim] = oy * factor + dy;
                    src[xdim] = ox * factor + dx;
                    total += source[IxDyn(&src)];
                }
            }
            total / norm
        });
        Ok(self.with_data(geom, data))
    }

    /// Merge every `factor` bins of a non-spatial axis (sum or mean).
    pub fn downsample_axis(
        &self,
        factor: usize,
        axis_name: &str,
        preserve_counts: bool,
        weights: Option<&MaskMap>,
    ) -> Result<Self, MapError> {
        let axis = self.geom.axis(axis_name)?.downsample(factor)?;
        let mut out = self.resample_axis(&axis, weights)?;
        if !preserve_counts {
            out.data.mapv_inplace(|v| v / factor as f64);
        }
        Ok(out)
    }

    /// Rebin a non-spatial axis onto `axis` by summing the grouped bins.
    pub fn resample_axis(&self, axis: &MapAxis, weights: Option<&MaskMap>) -> Result<Self, MapError> {
        let current = self.geom.axis(axis.name())?;
        let groups = current.group_by(axis);
        let dim = Axis(self.geom.data_axis_index(axis.name())?);
        let source = match weights {
            Some(w) => {
                let m = self.broadcast_other(&w.data)?;
                let mut d = self.data.clone();
                Zip::from(&mut d).and(&m).for_each(|v, &keep| {
                    if !keep {
                        *v = 0.0;
                    }
                });
                d
            }
            None => self.data.clone(),
        };
        let geom = self.geom.replace_axis(axis.clone())?;
        let mut data = ArrayD::zeros(IxDyn(&geom.data_shape()));
        for (j, group) in groups.iter().enumerate() {
            let mut lane = data.index_axis_mut(dim, j);
            for i in group.clone() {
                lane += &source.index_axis(dim, i);
            }
        }
        Ok(self.with_data(geom, data))
    }

    /// Sum over one non-spatial axis, keeping it as a single bin if `keepdims`.
    pub fn sum_over_axis(&self, axis_name: &str, keepdims: bool) -> Result<Self, MapError> {
        let dim = Axis(self.geom.data_axis_index(axis_name)?);
        let summed = self.data.sum_axis(dim);
        if keepdims {
            let geom = self.geom.squash(axis_name)?;
            let data = summed.insert_axis(dim);
            Ok(self.with_data(geom, data))
        } else {
            Ok(self.with_data(self.geom.drop(axis_name)?, summed))
        }
    }

    /// Sum over all non-spatial axes.
    pub fn sum_over_axes(&self, keepdims: bool) -> Result<Self, MapError> {
        let names: Vec<String> = self.geom.axes().names().iter().map(|s| s.to_string()).collect();
        let mut out = self.clone();
        for name in names {
            out = out.sum_over_axis(&name, keepdims)?;
        }
        Ok(out)
    }

    /// Reduce the spatial dimensions inside `region` to a single bin.
    pub fn to_region_nd_map(
        &self,
        region: &SkyRegion,
        func: RegionReduce,
        weights: Option<&MaskMap>,
    ) -> Result<Self, MapError> {
        let geom = self.geom.to_region_geom(region.clone());
        let region_mask = self.geom.region_mask(region);
        let n_pix = region_mask.iter().filter(|v| **v).count().max(1) as f64;
        let weight_data = match weights {
            Some(w) => Some(self.broadcast_other(&w.data)?.to_owned()),
            None => None,
        };
        let nd = self.data.ndim();
        let data = ArrayD::from_shape_fn(IxDyn(&geom.data_shape()), |idx| {
            let mut src: Vec<usize> = idx.slice().to_vec();
            let mut total = 0.0;
            for ((iy, ix), inside) in region_mask.indexed_iter() {
                if !*inside {
                    continue;
                }
                src[nd - 2] = iy;
                src[nd - 1] = ix;
                let keep = weight_data.as_ref().map_or(true, |w| w[IxDyn(&src)]);
                if keep {
                    total += self.data[IxDyn(&src)];
                }
            }
            match func {
                RegionReduce::Sum => total,
                RegionReduce::Mean => total / n_pix,
            }
        });
        Ok(self.with_data(geom, data))
    }

    /// Multi-linear interpolator in pixel coordinates of every data dimension.
    pub fn pixel_interpolator(&self) -> Result<RegularGridInterpolator, MapError> {
        let points = self
            .data
            .shape()
            .iter()
            .map(|n| (0..*n).map(|i| i as f64).collect())
            .collect();
        let scales = vec![AxisInterp::Lin; self.data.ndim()];
        Ok(
            RegularGridInterpolator::new(points, scales, self.data.clone())?
                .with_bounds(Bounds::Fill(f64::NAN))
                .with_clip(false),
        )
    }

    /// Interpolate at a sky position and the given non-spatial coordinates.
    ///
    /// Every non-spatial axis needs a coordinate. Returns NaN outside the map.
    pub fn interp_by_coord(
        &self,
        position: &SkyCoord,
        axis_coords: &[(&str, f64)],
    ) -> Result<f64, MapError> {
        let mut pix = Vec::with_capacity(self.data.ndim());
        for axis in self.geom.axes().iter().rev() {
            let coord = axis_coords
                .iter()
                .find(|(name, _)| *name == axis.name())
                .map(|(_, v)| *v)
                .ok_or_else(|| MapError::AxisNotFound(axis.name().to_string()))?;
            pix.push(axis.coord_to_pix(coord));
        }
        let (x, y) = self.geom.coord_to_pix(position);
        pix.push(y);
        pix.push(x);
        Ok(self.pixel_interpolator()?.evaluate(&pix)?)
    }
}

impl Map<bool> {
    /// Logical OR of `other` into the aligned sub-region of this mask.
    pub fn stack(&mut self, other: &MaskMap) -> Result<(), MapError> {
        self.paste_with(&other.geom, &other.data, |t, s| *t |= *s)
    }

    pub fn and(&self, other: &MaskMap) -> Result<Self, MapError> {
        let rhs = self.broadcast_other(&other.data)?;
        let mut data = self.data.clone();
        Zip::from(&mut data).and(&rhs).for_each(|a, &b| *a = *a && b);
        Ok(self.with_data(self.geom.clone(), data))
    }

    pub fn or(&self, other: &MaskMap) -> Result<Self, MapError> {
        let rhs = self.broadcast_other(&other.data)?;
        let mut data = self.data.clone();
        Zip::from(&mut data).and(&rhs).for_each(|a, &b| *a = *a || b);
        Ok(self.with_data(self.geom.clone(), data))
    }

    pub fn any(&self) -> bool {
        self.data.iter().any(|v| *v)
    }

    pub fn count(&self) -> usize {
        self.data.iter().filter(|v| **v).count()
    }

    /// OR-reduce all non-spatial axes into an image.
    pub fn reduce_over_axes(&self) -> Self {
        let mut data = self.data.clone();
        while data.ndim() > 2 {
            data = data.map_axis(Axis(0), |lane| lane.iter().any(|v| *v));
        }
        self.with_data(self.geom.to_image(), data)
    }

    /// OR-reduce one axis, keeping it as a single bin if `keepdims`.
    pub fn reduce_axis(&self, axis_name: &str, keepdims: bool) -> Result<Self, MapError> {
        let dim = Axis(self.geom.data_axis_index(axis_name)?);
        let reduced = self.data.map_axis(dim, |lane| lane.iter().any(|v| *v));
        if keepdims {
            Ok(self.with_data(self.geom.squash(axis_name)?, reduced.insert_axis(dim)))
        } else {
            Ok(self.with_data(self.geom.drop(axis_name)?, reduced))
        }
    }

    /// Spatial downsampling with OR over each block.
    pub fn downsample(&self, factor: usize) -> Result<Self, MapError> {
        let geom = self.geom.downsample(factor)?;
        let (ydim, xdim) = self.spatial_dims();
        let data = ArrayD::from_shape_fn(IxDyn(&geom.data_shape()), |idx| {
            let mut src: Vec<usize> = idx.slice().to_vec();
            let (oy, ox) = (src[ydim], src[xdim]);
            for dy in 0..factor {
                for dx in 0..factor {
                    src[ydim] = oy * factor + dy;
                    src[xdim] = ox * factor + dx;
                    if self.data[IxDyn(&src)] {
                        return true;
                    }
                }
            }
            false
        });
        Ok(self.with_data(geom, data))
    }

    /// Rebin a non-spatial axis onto `axis` with OR over the grouped bins.
    pub fn resample_axis(&self, axis: &MapAxis) -> Result<Self, MapError> {
        let groups = self.geom.axis(axis.name())?.group_by(axis);
        let dim = Axis(self.geom.data_axis_index(axis.name())?);
        let geom = self.geom.replace_axis(axis.clone())?;
        let mut data = ArrayD::from_elem(IxDyn(&geom.data_shape()), false);
        for (j, group) in groups.iter().enumerate() {
            let mut lane = data.index_axis_mut(dim, j);
            for i in group.clone() {
                Zip::from(&mut lane)
                    .and(&self.data.index_axis(dim, i))
                    .for_each(|a, &b| *a = *a || b);
            }
        }
        Ok(self.with_data(geom, data))
    }

    /// OR-merge every `factor` bins of a non-spatial axis.
    pub fn downsample_axis(&self, factor: usize, axis_name: &str) -> Result<Self, MapError> {
        let axis = self.geom.axis(axis_name)?.downsample(factor)?;
        self.resample_axis(&axis)
    }

    /// Any-reduce the spatial dimensions inside `region`.
    pub fn to_region_nd_map(&self, region: &SkyRegion) -> Result<Self, MapError> {
        let geom = self.geom.to_region_geom(region.clone());
        let region_mask = self.geom.region_mask(region);
        let nd = self.data.ndim();
        let data = ArrayD::from_shape_fn(IxDyn(&geom.data_shape()), |idx| {
            let mut src: Vec<usize> = idx.slice().to_vec();
            region_mask.indexed_iter().any(|((iy, ix), inside)| {
                src[nd - 2] = iy;
                src[nd - 1] = ix;
                *inside && self.data[IxDyn(&src)]
            })
        });
        Ok(self.with_data(geom, data))
    }

    pub fn to_f64(&self) -> Map<f64> {
        self.map_values(|v| if *v { 1.0 } else { 0.0 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::axis::MapAxis;
    use approx::assert_relative_eq;

    fn energy_axis() -> MapAxis {
        MapAxis::from_energy_bounds(1.0, 10.0, 4, "TeV", "energy").unwrap()
    }

    fn geom() -> Geom {
        Geom::create(SkyCoord::galactic(0.0, 0.0), 0.1, (10, 8), vec![energy_axis()]).unwrap()
    }

    fn ones() -> Map<f64> {
        Map::from_elem(geom(), 1.0, "")
    }

    #[test]
    fn test_from_data_checks_shape() {
        let bad = ArrayD::<f64>::zeros(IxDyn(&[4, 10, 8]));
        assert!(matches!(
            Map::from_data(geom(), bad, ""),
            Err(MapError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_arithmetic_broadcasts_image() {
        let cube = ones();
        let image = Map::from_elem(geom().to_image(), 2.0, "");
        let product = cube.checked_mul(&image).unwrap();
        assert_relative_eq!(product.sum(), 2.0 * 4.0 * 80.0);
        assert!(image.checked_mul(&cube).is_err());
    }

    #[test]
    fn test_stack_into_larger_map() {
        let mut parent = Map::<f64>::from_geom(geom(), "");
        let child = ones().cutout(&SkyCoord::galactic(0.0, 0.0), (0.4, 0.4)).unwrap();
        assert_eq!(child.geom().npix(), (4, 4));
        parent.stack(&child, None, true).unwrap();
        assert_relative_eq!(parent.sum(), 4.0 * 16.0);
    }

    #[test]
    fn test_stack_weights_and_nan() {
        let mut total = Map::<f64>::from_geom(geom(), "");
        let mut other = ones();
        other.data_mut()[[0, 0, 0]] = f64::NAN;
        let mut weights = MaskMap::from_elem(geom(), true, "");
        weights.data_mut()[[3, 0, 0]] = false;
        total.stack(&other, Some(&weights), true).unwrap();
        assert_relative_eq!(total.sum(), 320.0 - 2.0);
    }

    #[test]
    fn test_stack_misaligned_fails() {
        let mut total = Map::<f64>::from_geom(geom(), "");
        let shifted_geom =
            Geom::create(SkyCoord::galactic(0.05, 0.0), 0.1, (10, 8), vec![energy_axis()])
                .unwrap();
        let other = Map::from_elem(shifted_geom, 1.0, "");
        assert!(matches!(
            total.stack(&other, None, true),
            Err(MapError::NotAligned(_))
        ));
    }

    #[test]
    fn test_mask_stack_is_or() {
        let mut a = MaskMap::from_geom(geom(), "");
        let mut b = MaskMap::from_geom(geom(), "");
        b.data_mut()[[1, 2, 3]] = true;
        a.stack(&b).unwrap();
        assert_eq!(a.count(), 1);
    }

    #[test]
    fn test_downsample_preserves_counts() {
        let m = ones();
        let down = m.downsample(2, true, None).unwrap();
        assert_eq!(down.geom().npix(), (5, 4));
        assert_relative_eq!(down.sum(), m.sum());
        let mean = m.downsample(2, false, None).unwrap();
        assert_relative_eq!(mean.data()[[0, 0, 0]], 1.0);
    }

    #[test]
    fn test_resample_axis_sums() {
        let m = ones();
        let coarse = MapAxis::from_energy_bounds(1.0, 10.0, 2, "TeV", "energy").unwrap();
        let out = m.resample_axis(&coarse, None).unwrap();
        assert_eq!(out.data().shape(), &[2, 8, 10]);
        assert_relative_eq!(out.data()[[0, 0, 0]], 2.0);
        assert_relative_eq!(out.sum(), m.sum());
    }

    #[test]
    fn test_pad_modes() {
        let m = ones();
        let constant = m.pad(2, PadMode::Constant(0.0)).unwrap();
        assert_eq!(constant.geom().npix(), (14, 12));
        assert_relative_eq!(constant.sum(), m.sum());
        let edge = m.pad(2, PadMode::Edge).unwrap();
        assert_relative_eq!(edge.sum(), 4.0 * 14.0 * 12.0);
    }

    #[test]
    fn test_slice_by_idx() {
        let m = ones();
        let sliced = m
            .slice_by_idx(&[("energy", AxisSlice::Range(1..3))])
            .unwrap();
        assert_eq!(sliced.geom().data_shape(), vec![2, 8, 10]);
        let image = m.slice_by_idx(&[("energy", AxisSlice::Index(0))]).unwrap();
        assert!(image.geom().is_image());
        assert_eq!(image.data().shape(), &[8, 10]);
        let ignored = m.slice_by_idx(&[("rad", AxisSlice::Index(0))]).unwrap();
        assert_eq!(ignored.data().shape(), m.data().shape());
    }

    #[test]
    fn test_reduce_and_to_cube() {
        let mut mask = MaskMap::from_geom(geom(), "");
        mask.data_mut()[[2, 4, 5]] = true;
        let image = mask.reduce_over_axes();
        assert_eq!(image.data().shape(), &[8, 10]);
        assert!(image.data()[[4, 5]]);
        let cube = image.to_cube(vec![energy_axis()]).unwrap();
        assert_eq!(cube.count(), 4);
    }

    #[test]
    fn test_to_region_nd_map() {
        let m = ones();
        let region = SkyRegion::circle(SkyCoord::galactic(0.0, 0.0), 0.15);
        let summed = m.to_region_nd_map(&region, RegionReduce::Sum, None).unwrap();
        assert_eq!(summed.data().shape(), &[4, 1, 1]);
        let n_pix = geom().region_mask(&region).iter().filter(|v| **v).count() as f64;
        assert_relative_eq!(summed.data()[[0, 0, 0]], n_pix);
        let mean = m.to_region_nd_map(&region, RegionReduce::Mean, None).unwrap();
        assert_relative_eq!(mean.data()[[0, 0, 0]], 1.0);
    }

    #[test]
    fn test_interp_to_geom_coarser() {
        let mut mask = MaskMap::from_elem(geom().to_image(), true, "");
        for (iy, ix) in [(0, 0), (0, 1), (1, 0), (1, 1)] {
            mask.data_mut()[[iy, ix]] = false;
        }
        let coarse = geom().to_image().downsample(2).unwrap();
        let out = mask.interp_to_geom(&coarse, false, false).unwrap();
        assert_eq!(out.data().shape(), &[4, 5]);
        assert!(!out.data()[[0, 0]]);
        assert_eq!(out.count(), 19);
    }

    #[test]
    fn test_interp_by_coord_linear() {
        let image_geom = geom().to_image();
        let data = ArrayD::from_shape_fn(IxDyn(&[8, 10]), |idx| idx[1] as f64);
        let m = Map::from_data(image_geom.clone(), data, "").unwrap();
        let coord = image_geom.pix_to_coord(2.5, 3.0);
        assert_relative_eq!(m.interp_by_coord(&coord, &[]).unwrap(), 2.5, epsilon = 1e-9);
    }
}
