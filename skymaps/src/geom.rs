//! Map geometries: a spatial grid plus ordered non-spatial axes.
//!
//! Spatial grids are either plate carrée (CAR) pixel grids or a single-bin
//! sky region. Data arrays are laid out with the non-spatial axes in reverse
//! declared order followed by `(ny, nx)`, so a geometry with axes
//! `[rad, energy_true]` has data shape `(n_energy_true, n_rad, ny, nx)`.
//!
//! Longitude decreases with increasing pixel x, latitude increases with pixel y.

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::ops::Range;

use crate::axis::{MapAxes, MapAxis};
use crate::coord::{wrap_delta_lon, Frame, SkyCoord};
use crate::error::MapError;
use crate::region::SkyRegion;

/// Tolerance in pixels when checking grid alignment.
const ALIGN_TOL_PIX: f64 = 1e-3;

/// Plate carrée pixel grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WcsGrid {
    /// Center of pixel (0, 0).
    origin: SkyCoord,
    /// Pixel size in degrees.
    binsz: f64,
    nx: usize,
    ny: usize,
}

impl WcsGrid {
    fn new(center: SkyCoord, binsz: f64, nx: usize, ny: usize) -> Self {
        let origin = SkyCoord::new(
            (center.lon + 0.5 * (nx as f64 - 1.0) * binsz).rem_euclid(360.0),
            center.lat - 0.5 * (ny as f64 - 1.0) * binsz,
            center.frame,
        );
        Self {
            origin,
            binsz,
            nx,
            ny,
        }
    }

    fn pix_to_coord(&self, x: f64, y: f64) -> SkyCoord {
        SkyCoord::new(
            (self.origin.lon - x * self.binsz).rem_euclid(360.0),
            self.origin.lat + y * self.binsz,
            self.origin.frame,
        )
    }

    fn center(&self) -> SkyCoord {
        self.pix_to_coord(0.5 * (self.nx as f64 - 1.0), 0.5 * (self.ny as f64 - 1.0))
    }

    fn coord_to_pix(&self, coord: &SkyCoord) -> (f64, f64) {
        let c = coord.transform_to(self.origin.frame);
        let center = self.center();
        let x = 0.5 * (self.nx as f64 - 1.0) - wrap_delta_lon(c.lon - center.lon) / self.binsz;
        let y = (c.lat - self.origin.lat) / self.binsz;
        (x, y)
    }

    /// Grid covering the pixel ranges `x`, `y` of this grid.
    fn sub_grid(&self, x: &Range<isize>, y: &Range<isize>) -> Self {
        Self {
            origin: self.pix_to_coord(x.start as f64, y.start as f64),
            binsz: self.binsz,
            nx: (x.end - x.start) as usize,
            ny: (y.end - y.start) as usize,
        }
    }
}

/// Spatial part of a geometry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SpatialGrid {
    Wcs(WcsGrid),
    Region(SkyRegion),
}

/// Pixel ranges of a cutout in the parent grid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CutoutSlices {
    pub x: Range<usize>,
    pub y: Range<usize>,
}

/// Full map geometry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Geom {
    spatial: SpatialGrid,
    axes: MapAxes,
}

impl Geom {
    /// Create a CAR geometry.
    ///
    /// # Arguments
    /// * `center` - Sky position of the grid center
    /// * `binsz` - Pixel size in degrees
    /// * `npix` - Number of pixels `(nx, ny)`
    /// * `axes` - Non-spatial axes in declared order
    pub fn create(
        center: SkyCoord,
        binsz: f64,
        npix: (usize, usize),
        axes: Vec<MapAxis>,
    ) -> Result<Self, MapError> {
        if npix.0 == 0 || npix.1 == 0 || binsz <= 0.0 || !binsz.is_finite() {
            return Err(MapError::InvalidAxis {
                name: "spatial".to_string(),
                reason: format!("invalid grid: binsz={binsz}, npix={npix:?}"),
            });
        }
        Ok(Self {
            spatial: SpatialGrid::Wcs(WcsGrid::new(center, binsz, npix.0, npix.1)),
            axes: MapAxes::new(axes)?,
        })
    }

    /// Create a CAR geometry from its angular width `(width_lon, width_lat)`.
    pub fn create_width(
        center: SkyCoord,
        binsz: f64,
        width: (f64, f64),
        axes: Vec<MapAxis>,
    ) -> Result<Self, MapError> {
        let nx = (width.0 / binsz).round().max(1.0) as usize;
        let ny = (width.1 / binsz).round().max(1.0) as usize;
        Self::create(center, binsz, (nx, ny), axes)
    }

    /// Single spatial bin described by a sky region.
    pub fn region(region: SkyRegion, axes: Vec<MapAxis>) -> Result<Self, MapError> {
        Ok(Self {
            spatial: SpatialGrid::Region(region),
            axes: MapAxes::new(axes)?,
        })
    }

    pub fn spatial(&self) -> &SpatialGrid {
        &self.spatial
    }

    pub fn axes(&self) -> &MapAxes {
        &self.axes
    }

    pub fn axis(&self, name: &str) -> Result<&MapAxis, MapError> {
        self.axes.get(name)
    }

    pub fn has_axis(&self, name: &str) -> bool {
        self.axes.contains(name)
    }

    pub fn is_region(&self) -> bool {
        matches!(self.spatial, SpatialGrid::Region(_))
    }

    pub fn region_shape(&self) -> Option<&SkyRegion> {
        match &self.spatial {
            SpatialGrid::Region(region) => Some(region),
            SpatialGrid::Wcs(_) => None,
        }
    }

    pub fn is_image(&self) -> bool {
        self.axes.is_empty()
    }

    pub fn frame(&self) -> Frame {
        match &self.spatial {
            SpatialGrid::Wcs(grid) => grid.origin.frame,
            SpatialGrid::Region(region) => region.center().frame,
        }
    }

    fn wcs(&self, operation: &str) -> Result<&WcsGrid, MapError> {
        match &self.spatial {
            SpatialGrid::Wcs(grid) => Ok(grid),
            SpatialGrid::Region(_) => Err(MapError::RequiresWcs(operation.to_string())),
        }
    }

    /// Number of spatial pixels `(nx, ny)`.
    pub fn npix(&self) -> (usize, usize) {
        match &self.spatial {
            SpatialGrid::Wcs(grid) => (grid.nx, grid.ny),
            SpatialGrid::Region(_) => (1, 1),
        }
    }

    /// Array shape: axes in reverse order, then `(ny, nx)`.
    pub fn data_shape(&self) -> Vec<usize> {
        let (nx, ny) = self.npix();
        let mut shape: Vec<usize> = self.axes.shape().into_iter().rev().collect();
        shape.push(ny);
        shape.push(nx);
        shape
    }

    /// Position of the named axis in the data array.
    pub fn data_axis_index(&self, name: &str) -> Result<usize, MapError> {
        let idx = self
            .axes
            .index_of(name)
            .ok_or_else(|| MapError::AxisNotFound(name.to_string()))?;
        Ok(self.axes.len() - 1 - idx)
    }

    /// Pixel size in degrees. Region geometries report their enclosing diameter.
    pub fn pixel_scale(&self) -> f64 {
        match &self.spatial {
            SpatialGrid::Wcs(grid) => grid.binsz,
            SpatialGrid::Region(region) => 2.0 * region.half_extent(),
        }
    }

    pub fn center_coord(&self) -> SkyCoord {
        match &self.spatial {
            SpatialGrid::Wcs(grid) => grid.center(),
            SpatialGrid::Region(region) => region.center(),
        }
    }

    /// Angular size `(width_lon, width_lat)` in degrees.
    pub fn width(&self) -> (f64, f64) {
        match &self.spatial {
            SpatialGrid::Wcs(grid) => (grid.nx as f64 * grid.binsz, grid.ny as f64 * grid.binsz),
            SpatialGrid::Region(region) => {
                let w = 2.0 * region.half_extent();
                (w, w)
            }
        }
    }

    pub fn pix_to_coord(&self, x: f64, y: f64) -> SkyCoord {
        match &self.spatial {
            SpatialGrid::Wcs(grid) => grid.pix_to_coord(x, y),
            SpatialGrid::Region(region) => region.center(),
        }
    }

    /// Fractional pixel position of `coord`. For region geometries this is
    /// `(0, 0)` inside the region (or at its center) and NaN otherwise.
    pub fn coord_to_pix(&self, coord: &SkyCoord) -> (f64, f64) {
        match &self.spatial {
            SpatialGrid::Wcs(grid) => grid.coord_to_pix(coord),
            SpatialGrid::Region(region) => {
                if region.contains(coord) || region.center().separation(coord) < 1e-9 {
                    (0.0, 0.0)
                } else {
                    (f64::NAN, f64::NAN)
                }
            }
        }
    }

    /// Pixel index `(ix, iy)` containing `coord`, if inside the grid.
    pub fn coord_to_idx(&self, coord: &SkyCoord) -> Option<(usize, usize)> {
        let (x, y) = self.coord_to_pix(coord);
        let (nx, ny) = self.npix();
        let (ix, iy) = ((x + 0.5).floor(), (y + 0.5).floor());
        if ix >= 0.0 && iy >= 0.0 && ix < nx as f64 && iy < ny as f64 {
            Some((ix as usize, iy as usize))
        } else {
            None
        }
    }

    pub fn contains(&self, coord: &SkyCoord) -> bool {
        self.coord_to_idx(coord).is_some()
    }

    /// Sky coordinates of the pixel centers, shape `(ny, nx)`.
    pub fn pixel_centers(&self) -> Array2<SkyCoord> {
        let (nx, ny) = self.npix();
        Array2::from_shape_fn((ny, nx), |(iy, ix)| self.pix_to_coord(ix as f64, iy as f64))
    }

    /// Angular separation of every pixel center from `center`, in degrees.
    pub fn separation(&self, center: &SkyCoord) -> Array2<f64> {
        self.pixel_centers().mapv(|c| center.separation(&c))
    }

    /// Solid angle of every pixel in steradians.
    pub fn solid_angle(&self) -> Array2<f64> {
        match &self.spatial {
            SpatialGrid::Wcs(grid) => {
                let binsz = grid.binsz.to_radians();
                Array2::from_shape_fn((grid.ny, grid.nx), |(iy, _)| {
                    let lat = grid.pix_to_coord(0.0, iy as f64).lat.to_radians();
                    (binsz * binsz * lat.cos()).max(0.0)
                })
            }
            SpatialGrid::Region(region) => Array2::from_elem((1, 1), region.solid_angle()),
        }
    }

    /// Boolean image of the pixels whose centers lie inside `region`.
    ///
    /// A point region selects the pixel containing it.
    pub fn region_mask(&self, region: &SkyRegion) -> Array2<bool> {
        let (nx, ny) = self.npix();
        match (&self.spatial, region) {
            (SpatialGrid::Region(_), _) => Array2::from_elem((1, 1), true),
            (SpatialGrid::Wcs(_), SkyRegion::Point { center }) => {
                let mut mask = Array2::from_elem((ny, nx), false);
                if let Some((ix, iy)) = self.coord_to_idx(center) {
                    mask[[iy, ix]] = true;
                }
                mask
            }
            (SpatialGrid::Wcs(_), _) => self.pixel_centers().mapv(|c| region.contains(&c)),
        }
    }

    fn with_spatial(&self, spatial: SpatialGrid) -> Self {
        Self {
            spatial,
            axes: self.axes.clone(),
        }
    }

    /// Geometry with all non-spatial axes removed.
    pub fn to_image(&self) -> Self {
        Self {
            spatial: self.spatial.clone(),
            axes: MapAxes::default(),
        }
    }

    /// Geometry with the given non-spatial axes.
    pub fn to_cube(&self, axes: Vec<MapAxis>) -> Result<Self, MapError> {
        Ok(Self {
            spatial: self.spatial.clone(),
            axes: MapAxes::new(axes)?,
        })
    }

    /// Replace the named axis by a single bin spanning its range.
    pub fn squash(&self, name: &str) -> Result<Self, MapError> {
        Ok(Self {
            spatial: self.spatial.clone(),
            axes: self.axes.squash(name)?,
        })
    }

    pub fn drop(&self, name: &str) -> Result<Self, MapError> {
        Ok(Self {
            spatial: self.spatial.clone(),
            axes: self.axes.drop(name)?,
        })
    }

    /// Replace the axis with the same name.
    pub fn replace_axis(&self, axis: MapAxis) -> Result<Self, MapError> {
        Ok(Self {
            spatial: self.spatial.clone(),
            axes: self.axes.replace(axis)?,
        })
    }

    /// Same axes on a region spatial grid.
    pub fn to_region_geom(&self, region: SkyRegion) -> Self {
        self.with_spatial(SpatialGrid::Region(region))
    }

    /// Finer spatial grid, every pixel split into `factor` x `factor`.
    pub fn upsample(&self, factor: usize) -> Result<Self, MapError> {
        let grid = self.wcs("upsample")?;
        let f = factor.max(1) as f64;
        let offset = -(f - 1.0) / (2.0 * f);
        let origin = grid.pix_to_coord(offset, offset);
        Ok(self.with_spatial(SpatialGrid::Wcs(WcsGrid {
            origin,
            binsz: grid.binsz / f,
            nx: grid.nx * factor.max(1),
            ny: grid.ny * factor.max(1),
        })))
    }

    /// Coarser spatial grid merging `factor` x `factor` pixels.
    pub fn downsample(&self, factor: usize) -> Result<Self, MapError> {
        let grid = self.wcs("downsample")?;
        for (size, what) in [(grid.nx, "nx"), (grid.ny, "ny")] {
            if factor == 0 || size % factor != 0 {
                return Err(MapError::NotDivisible {
                    factor,
                    what: what.to_string(),
                    size,
                });
            }
        }
        let offset = 0.5 * (factor as f64 - 1.0);
        Ok(self.with_spatial(SpatialGrid::Wcs(WcsGrid {
            origin: grid.pix_to_coord(offset, offset),
            binsz: grid.binsz * factor as f64,
            nx: grid.nx / factor,
            ny: grid.ny / factor,
        })))
    }

    /// Same center and width with a different pixel size.
    pub fn to_binsz(&self, binsz: f64) -> Result<Self, MapError> {
        let grid = self.wcs("to_binsz")?;
        let width = self.width();
        let nx = (width.0 / binsz).round().max(1.0) as usize;
        let ny = (width.1 / binsz).round().max(1.0) as usize;
        Ok(self.with_spatial(SpatialGrid::Wcs(WcsGrid::new(
            grid.center(),
            binsz,
            nx,
            ny,
        ))))
    }

    /// Square grid with an odd number of pixels covering `2 * max_radius`
    /// (or the full width when `None`), centered on the geometry center.
    pub fn to_odd_npix(&self, max_radius: Option<f64>) -> Result<Self, MapError> {
        let grid = self.wcs("to_odd_npix")?;
        let width = match max_radius {
            Some(radius) => 2.0 * radius,
            None => self.width().0.max(self.width().1),
        };
        let npix = round_up_to_odd(width / grid.binsz);
        Ok(self.with_spatial(SpatialGrid::Wcs(WcsGrid::new(
            grid.center(),
            grid.binsz,
            npix,
            npix,
        ))))
    }

    /// Pixel ranges of a `width` sized cutout centered on `position`,
    /// trimmed to the grid.
    pub fn cutout_slices(
        &self,
        position: &SkyCoord,
        width: (f64, f64),
    ) -> Result<CutoutSlices, MapError> {
        let grid = self.wcs("cutout")?;
        let (px, py) = grid.coord_to_pix(position);
        let range = |p: f64, w: f64, n: usize| -> Range<usize> {
            let npix = (w / grid.binsz).round().max(1.0);
            let start = (p - 0.5 * (npix - 1.0)).round();
            let end = start + npix;
            let start = start.clamp(0.0, n as f64) as usize;
            let end = end.clamp(0.0, n as f64) as usize;
            start..end
        };
        let x = range(px, width.0, grid.nx);
        let y = range(py, width.1, grid.ny);
        if x.is_empty() || y.is_empty() {
            return Err(MapError::NoOverlap {
                lon: position.lon,
                lat: position.lat,
            });
        }
        Ok(CutoutSlices { x, y })
    }

    /// Geometry covering the given pixel ranges.
    pub fn sub_geom(&self, slices: &CutoutSlices) -> Result<Self, MapError> {
        let grid = self.wcs("cutout")?;
        let x = slices.x.start as isize..slices.x.end as isize;
        let y = slices.y.start as isize..slices.y.end as isize;
        Ok(self.with_spatial(SpatialGrid::Wcs(grid.sub_grid(&x, &y))))
    }

    pub fn cutout(&self, position: &SkyCoord, width: (f64, f64)) -> Result<Self, MapError> {
        let slices = self.cutout_slices(position, width)?;
        self.sub_geom(&slices)
    }

    /// Grid enlarged by `width` pixels on every side.
    pub fn pad(&self, width: usize) -> Result<Self, MapError> {
        let grid = self.wcs("pad")?;
        let w = width as isize;
        let x = -w..grid.nx as isize + w;
        let y = -w..grid.ny as isize + w;
        Ok(self.with_spatial(SpatialGrid::Wcs(grid.sub_grid(&x, &y))))
    }

    /// Offset `(dx, dy)` of this grid's pixel (0, 0) inside `parent`, when the
    /// two spatial grids share pixel size and pixel boundaries.
    pub fn offset_in(&self, parent: &Geom) -> Result<(isize, isize), MapError> {
        match (&self.spatial, &parent.spatial) {
            (SpatialGrid::Region(a), SpatialGrid::Region(b)) => {
                if a == b {
                    Ok((0, 0))
                } else {
                    Err(MapError::NotAligned("region geometries differ".to_string()))
                }
            }
            (SpatialGrid::Wcs(child), SpatialGrid::Wcs(grid)) => {
                if child.origin.frame != grid.origin.frame {
                    return Err(MapError::NotAligned("frames differ".to_string()));
                }
                if (child.binsz - grid.binsz).abs() > 1e-9 * grid.binsz {
                    return Err(MapError::NotAligned(format!(
                        "pixel sizes differ: {} vs {}",
                        child.binsz, grid.binsz
                    )));
                }
                let (x, y) = grid.coord_to_pix(&child.origin);
                let (dx, dy) = (x.round(), y.round());
                if (x - dx).abs() > ALIGN_TOL_PIX || (y - dy).abs() > ALIGN_TOL_PIX {
                    return Err(MapError::NotAligned(format!(
                        "pixel grids offset by ({x:.4}, {y:.4}) pixels"
                    )));
                }
                Ok((dx as isize, dy as isize))
            }
            _ => Err(MapError::NotAligned(
                "cannot align region and WCS geometries".to_string(),
            )),
        }
    }

    /// Whether both spatial grids coincide exactly.
    pub fn is_aligned(&self, other: &Geom) -> bool {
        self.npix() == other.npix() && matches!(other.offset_in(self), Ok((0, 0)))
    }
}

/// Round up to the next odd integer.
pub fn round_up_to_odd(value: f64) -> usize {
    let ceil = value.ceil().max(1.0) as usize;
    ceil / 2 * 2 + 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn energy_axis() -> MapAxis {
        MapAxis::from_energy_bounds(1.0, 10.0, 4, "TeV", "energy").unwrap()
    }

    fn geom() -> Geom {
        Geom::create_width(SkyCoord::galactic(0.0, 0.0), 0.02, (2.0, 2.0), vec![energy_axis()])
            .unwrap()
    }

    #[test]
    fn test_data_shape() {
        assert_eq!(geom().data_shape(), vec![4, 100, 100]);
        let rad = MapAxis::from_bounds(0.0, 0.66, 66, "rad", "deg", crate::axis::AxisInterp::Lin)
            .unwrap();
        let etrue = energy_axis().renamed("energy_true");
        let g = Geom::create(SkyCoord::icrs(0.0, 0.0), 0.2, (10, 8), vec![rad, etrue]).unwrap();
        assert_eq!(g.data_shape(), vec![4, 66, 8, 10]);
        assert_eq!(g.data_axis_index("rad").unwrap(), 1);
        assert_eq!(g.data_axis_index("energy_true").unwrap(), 0);
    }

    #[test]
    fn test_pix_coord_roundtrip() {
        let g = geom();
        let center = g.center_coord();
        assert_relative_eq!(center.separation(&SkyCoord::galactic(0.0, 0.0)), 0.0, epsilon = 1e-9);

        let coord = SkyCoord::galactic(359.5, 0.3);
        let (x, y) = g.coord_to_pix(&coord);
        let back = g.pix_to_coord(x, y);
        assert_relative_eq!(back.separation(&coord), 0.0, epsilon = 1e-9);
        assert!(x > 49.5, "longitude should decrease with x");
    }

    #[test]
    fn test_allsky_two_pixel_grid() {
        let g = Geom::create(SkyCoord::icrs(0.0, 0.0), 180.0, (2, 1), vec![]).unwrap();
        assert_eq!(g.coord_to_idx(&SkyCoord::icrs(90.0, 0.0)), Some((0, 0)));
        assert_eq!(g.coord_to_idx(&SkyCoord::icrs(270.0, 10.0)), Some((1, 0)));
    }

    #[test]
    fn test_downsample_upsample_alignment() {
        let g = geom();
        let down = g.downsample(5).unwrap();
        assert_eq!(down.npix(), (20, 20));
        assert_relative_eq!(down.center_coord().separation(&g.center_coord()), 0.0, epsilon = 1e-9);
        let up = down.upsample(5).unwrap();
        assert!(up.is_aligned(&g));
        assert!(g.downsample(3).is_err());
    }

    #[test]
    fn test_to_odd_npix() {
        let g = geom();
        let odd = g.to_odd_npix(Some(0.5)).unwrap();
        assert_eq!(odd.npix(), (51, 51));
        assert_relative_eq!(odd.center_coord().separation(&g.center_coord()), 0.0, epsilon = 1e-9);
        assert_eq!(round_up_to_odd(10.0), 11);
        assert_eq!(round_up_to_odd(11.0), 11);
        assert_eq!(round_up_to_odd(10.2), 11);
    }

    #[test]
    fn test_cutout_and_offset() {
        let g = geom();
        let slices = g
            .cutout_slices(&SkyCoord::galactic(0.0, 0.0), (1.0, 1.0))
            .unwrap();
        assert_eq!(slices.x.len(), 50);
        assert_eq!(slices.y.len(), 50);
        let cut = g.sub_geom(&slices).unwrap();
        let (dx, dy) = cut.offset_in(&g).unwrap();
        assert_eq!(dx as usize, slices.x.start);
        assert_eq!(dy as usize, slices.y.start);
    }

    #[test]
    fn test_cutout_trimmed_at_edge() {
        let g = geom();
        let slices = g
            .cutout_slices(&SkyCoord::galactic(359.0, 0.0), (1.0, 1.0))
            .unwrap();
        assert!(slices.x.len() < 50);
        assert_eq!(slices.x.end, 100);
        assert!(g
            .cutout_slices(&SkyCoord::galactic(20.0, 0.0), (1.0, 1.0))
            .is_err());
    }

    #[test]
    fn test_pad_offset() {
        let g = geom();
        let padded = g.pad(3).unwrap();
        assert_eq!(padded.npix(), (106, 106));
        assert_eq!(g.offset_in(&padded).unwrap(), (3, 3));
    }

    #[test]
    fn test_region_mask() {
        let g = geom();
        let region = SkyRegion::circle(SkyCoord::galactic(0.0, 0.0), 0.1);
        let mask = g.region_mask(&region);
        let n = mask.iter().filter(|v| **v).count();
        let expected = std::f64::consts::PI * 0.1 * 0.1 / (0.02 * 0.02);
        assert!((n as f64 - expected).abs() < 10.0);
    }

    #[test]
    fn test_solid_angle_equator() {
        let g = geom();
        let omega = g.solid_angle();
        assert_relative_eq!(omega[[50, 50]], 0.02f64.to_radians().powi(2), max_relative = 1e-3);
    }
}
