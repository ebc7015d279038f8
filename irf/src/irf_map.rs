//! Behaviour shared by all spatially resolved IRF maps.
//!
//! An IRF map pairs the response itself with an exposure map on the same
//! spatial grid. The exposure is the weight used when responses from several
//! observations are combined: the stacked response is the exposure-weighted
//! mean of the inputs.

use log::debug;
use skymaps::{AxisSlice, Geom, Map, MaskMap, RegionReduce, SkyCoord, SkyRegion};

use crate::error::IrfError;

/// Response map plus its exposure weights.
#[derive(Debug, Clone, PartialEq)]
pub struct IrfMap {
    kind: &'static str,
    irf_map: Map,
    exposure_map: Option<Map>,
}

impl IrfMap {
    /// Wrap a response map, checking required axes and grid alignment.
    ///
    /// # Arguments
    /// * `kind` - Name used in error messages, e.g. "PSFMap"
    /// * `irf_map` - The response values
    /// * `exposure_map` - Exposure on the same spatial grid, if known
    /// * `required_axes` - Axis names the response map must have
    pub fn new(
        kind: &'static str,
        irf_map: Map,
        exposure_map: Option<Map>,
        required_axes: &[&str],
    ) -> Result<Self, IrfError> {
        for axis in required_axes {
            if !irf_map.geom().has_axis(axis) {
                return Err(IrfError::MissingAxis {
                    kind: kind.to_string(),
                    axis: axis.to_string(),
                });
            }
        }
        if let Some(exposure) = &exposure_map {
            let (a, b) = (irf_map.geom(), exposure.geom());
            let same_grid = a.npix() == b.npix()
                && (a.is_region() && b.is_region() || a.is_aligned(b));
            if !same_grid {
                return Err(IrfError::GeometryMismatch(kind.to_string()));
            }
        }
        Ok(Self {
            kind,
            irf_map,
            exposure_map,
        })
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn irf_map(&self) -> &Map {
        &self.irf_map
    }

    pub fn exposure_map(&self) -> Option<&Map> {
        self.exposure_map.as_ref()
    }

    pub fn geom(&self) -> &Geom {
        self.irf_map.geom()
    }

    fn rewrap(&self, irf_map: Map, exposure_map: Option<Map>) -> Self {
        Self {
            kind: self.kind,
            irf_map,
            exposure_map,
        }
    }

    /// Stack another IRF map into this one, weighting by exposure.
    ///
    /// `weights` is broadcast to the other response map; its `energy` axis,
    /// if any, is OR-reduced before it is applied to the exposure.
    pub fn stack(
        &mut self,
        other: &IrfMap,
        weights: Option<&MaskMap>,
        nan_to_num: bool,
    ) -> Result<(), IrfError> {
        let (Some(exposure), Some(other_exposure)) = (&self.exposure_map, &other.exposure_map)
        else {
            return Err(IrfError::MissingExposure(self.kind.to_string()));
        };

        let mut weighted = self.irf_map.checked_mul(exposure)?;
        let other_weighted = other.irf_map.checked_mul(other_exposure)?;
        weighted.stack(&other_weighted, weights, nan_to_num)?;

        let exposure_weights = match weights {
            Some(w) if w.geom().has_axis("energy") => Some(w.reduce_axis("energy", true)?),
            Some(w) => Some(w.clone()),
            None => None,
        };
        let mut stacked_exposure = exposure.clone();
        stacked_exposure.stack(other_exposure, exposure_weights.as_ref(), nan_to_num)?;

        let mut irf = weighted.zip_with(&stacked_exposure, |w, e| w / e)?;
        irf.nan_to_num();
        debug!(
            "Stacked {} with total exposure {:.3e}",
            self.kind,
            stacked_exposure.sum()
        );
        self.irf_map = irf;
        self.exposure_map = Some(stacked_exposure);
        Ok(())
    }

    pub fn cutout(&self, position: &SkyCoord, width: (f64, f64)) -> Result<Self, IrfError> {
        let irf_map = self.irf_map.cutout(position, width)?;
        let exposure_map = self
            .exposure_map
            .as_ref()
            .map(|m| m.cutout(position, width))
            .transpose()?;
        Ok(self.rewrap(irf_map, exposure_map))
    }

    /// Slice non-spatial axes. Axes absent from a map are left untouched, as
    /// are axes the exposure map carries squashed.
    pub fn slice_by_idx(&self, slices: &[(&str, AxisSlice)]) -> Result<Self, IrfError> {
        let irf_map = self.irf_map.slice_by_idx(slices)?;
        let exposure_map = match &self.exposure_map {
            Some(exposure) => {
                let binned: Vec<(&str, AxisSlice)> = slices
                    .iter()
                    .filter(|(name, _)| {
                        match (exposure.geom().axis(name), self.irf_map.geom().axis(name)) {
                            (Ok(a), Ok(b)) => a.nbin() == b.nbin(),
                            _ => false,
                        }
                    })
                    .cloned()
                    .collect();
                Some(exposure.slice_by_idx(&binned)?)
            }
            None => None,
        };
        Ok(self.rewrap(irf_map, exposure_map))
    }

    /// Sum every `factor` bins of a response axis; the exposure is unchanged.
    pub fn downsample_axis(
        &self,
        factor: usize,
        axis_name: &str,
        weights: Option<&MaskMap>,
    ) -> Result<Self, IrfError> {
        let irf_map = self
            .irf_map
            .downsample_axis(factor, axis_name, true, weights)?;
        Ok(self.rewrap(irf_map, self.exposure_map.clone()))
    }

    /// Response and exposure at the pixel containing the region center.
    pub fn to_region_nd_map(&self, region: &SkyRegion) -> Result<Self, IrfError> {
        let center = region.center();
        if !self.geom().is_region() && !self.geom().contains(&center) {
            return Err(IrfError::PositionOutside {
                lon: center.lon,
                lat: center.lat,
            });
        }
        if self.geom().is_region() {
            return Ok(self.clone());
        }
        let point = SkyRegion::point(center);
        let irf_map = self
            .irf_map
            .to_region_nd_map(&point, RegionReduce::Sum, None)?;
        let exposure_map = self
            .exposure_map
            .as_ref()
            .map(|m| m.to_region_nd_map(&point, RegionReduce::Sum, None))
            .transpose()?;
        Ok(self.rewrap(irf_map, exposure_map))
    }

    /// Replace the response map, keeping kind and exposure.
    pub fn with_irf_map(&self, irf_map: Map) -> Self {
        self.rewrap(irf_map, self.exposure_map.clone())
    }

    /// Replace both maps.
    pub fn with_maps(&self, irf_map: Map, exposure_map: Option<Map>) -> Self {
        self.rewrap(irf_map, exposure_map)
    }

    /// Fractional pixel of `position` in the response grid, defaulting to the center.
    pub(crate) fn position_to_pix(&self, position: Option<&SkyCoord>) -> (f64, f64) {
        let geom = self.geom();
        let position = position.copied().unwrap_or_else(|| geom.center_coord());
        let (x, y) = geom.coord_to_pix(&position);
        if x.is_finite() && y.is_finite() {
            (x, y)
        } else {
            (0.0, 0.0)
        }
    }
}
