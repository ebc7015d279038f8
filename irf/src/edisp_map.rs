//! Energy dispersion maps.
//!
//! Two representations are supported:
//! - [`EDispKernelMap`] stores the reconstructed x true energy response
//!   matrix directly, axes `[energy, energy_true]`.
//! - [`EDispMap`] stores the migration PDF `dP/dmu` with `mu = E_reco / E_true`,
//!   axes `[migra, energy_true]`, and integrates it into a matrix on request.

use ndarray::{Array2, ArrayD, Axis, IxDyn};
use skymaps::{AxisInterp, AxisSlice, Geom, Map, MapAxis, MaskMap, SkyCoord, SkyRegion};

use crate::error::IrfError;
use crate::irf_map::IrfMap;

pub const EDISP_KERNEL_MAP_KIND: &str = "EDispKernelMap";
pub const EDISP_MAP_KIND: &str = "EDispMap";

/// Migration axis `0.2 - 5` in 48 linear bins.
pub fn default_migra_axis() -> Result<MapAxis, IrfError> {
    Ok(MapAxis::from_bounds(0.2, 5.0, 48, "migra", "", AxisInterp::Lin)?)
}

/// Fraction of true bin `i` falling into reconstructed bin `j` for a perfect
/// energy reconstruction.
fn overlap_fraction(true_edges: &[f64], reco_edges: &[f64]) -> Array2<f64> {
    let n_true = true_edges.len() - 1;
    let n_reco = reco_edges.len() - 1;
    Array2::from_shape_fn((n_true, n_reco), |(i, j)| {
        let (a_min, a_max) = (true_edges[i], true_edges[i + 1]);
        let (b_min, b_max) = (reco_edges[j], reco_edges[j + 1]);
        let overlap = (a_max.min(b_max) - a_min.max(b_min)).max(0.0);
        overlap / (a_max - a_min)
    })
}

/// Default spatial grid for position independent responses.
fn all_sky_image() -> Result<Geom, IrfError> {
    Ok(Geom::create(SkyCoord::icrs(0.0, 0.0), 180.0, (2, 1), vec![])?)
}

/// Pixel `(ix, iy)` holding `position`, or the central pixel.
fn pixel_of(geom: &Geom, position: Option<&SkyCoord>) -> Result<(usize, usize), IrfError> {
    let position = position.copied().unwrap_or_else(|| geom.center_coord());
    if geom.is_region() {
        return Ok((0, 0));
    }
    geom.coord_to_idx(&position).ok_or(IrfError::PositionOutside {
        lon: position.lon,
        lat: position.lat,
    })
}

/// Response matrix for one sky position, shape `(n_true, n_reco)`.
#[derive(Debug, Clone, PartialEq)]
pub struct EDispKernel {
    energy_axis_true: MapAxis,
    energy_axis: MapAxis,
    data: Array2<f64>,
}

impl EDispKernel {
    pub fn new(
        energy_axis_true: MapAxis,
        energy_axis: MapAxis,
        data: Array2<f64>,
    ) -> Result<Self, IrfError> {
        let expected = (energy_axis_true.nbin(), energy_axis.nbin());
        if data.dim() != expected {
            return Err(IrfError::InvalidParameter(format!(
                "energy dispersion matrix has shape {:?}, expected {expected:?}",
                data.dim()
            )));
        }
        Ok(Self {
            energy_axis_true,
            energy_axis,
            data,
        })
    }

    /// Perfect energy reconstruction: true bins spread over the reconstructed
    /// bins they overlap.
    pub fn from_diagonal_response(energy_axis_true: MapAxis, energy_axis: MapAxis) -> Self {
        let data = overlap_fraction(&energy_axis_true.edges(), &energy_axis.edges());
        Self {
            energy_axis_true,
            energy_axis,
            data,
        }
    }

    pub fn energy_axis_true(&self) -> &MapAxis {
        &self.energy_axis_true
    }

    pub fn energy_axis(&self) -> &MapAxis {
        &self.energy_axis
    }

    pub fn pdf_matrix(&self) -> &Array2<f64> {
        &self.data
    }

    /// Fold a true-energy spectrum through the response.
    pub fn apply(&self, true_values: &[f64]) -> Vec<f64> {
        (0..self.energy_axis.nbin())
            .map(|j| {
                true_values
                    .iter()
                    .enumerate()
                    .map(|(i, v)| v * self.data[[i, j]])
                    .sum()
            })
            .collect()
    }
}

/// Reconstructed x true energy response per spatial bin.
#[derive(Debug, Clone, PartialEq)]
pub struct EDispKernelMap {
    inner: IrfMap,
}

impl EDispKernelMap {
    pub fn new(edisp_kernel_map: Map, exposure_map: Option<Map>) -> Result<Self, IrfError> {
        let inner = IrfMap::new(
            EDISP_KERNEL_MAP_KIND,
            edisp_kernel_map,
            exposure_map,
            &["energy", "energy_true"],
        )?;
        Ok(Self { inner })
    }

    /// Diagonal response on `geom` (axes `energy` and `energy_true`) with zero exposure.
    pub fn from_geom(geom: &Geom) -> Result<Self, IrfError> {
        let matrix = overlap_fraction(
            &geom.axis("energy_true")?.edges(),
            &geom.axis("energy")?.edges(),
        );
        let it = geom.data_axis_index("energy_true")?;
        let ir = geom.data_axis_index("energy")?;
        let data =
            ArrayD::from_shape_fn(IxDyn(&geom.data_shape()), |idx| matrix[[idx[it], idx[ir]]]);
        let exposure = Map::from_geom(geom.squash("energy")?, "m2 s");
        Self::new(Map::from_data(geom.clone(), data, "")?, Some(exposure))
    }

    /// Diagonal response with unit exposure.
    ///
    /// `energy_axis` defaults to the true axis renamed to `energy`; `geom`
    /// defaults to a position independent all-sky grid.
    pub fn from_diagonal_response(
        energy_axis_true: &MapAxis,
        energy_axis: Option<&MapAxis>,
        geom: Option<&Geom>,
    ) -> Result<Self, IrfError> {
        let energy_axis = energy_axis
            .cloned()
            .unwrap_or_else(|| energy_axis_true.renamed("energy"));
        let image = match geom {
            Some(g) => g.to_image(),
            None => all_sky_image()?,
        };
        let geom = image.to_cube(vec![energy_axis, energy_axis_true.clone()])?;
        let mut edisp = Self::from_geom(&geom)?;
        let exposure = Map::from_elem(geom.squash("energy")?, 1.0, "m2 s");
        edisp.inner = edisp.inner.with_maps(edisp.inner.irf_map().clone(), Some(exposure));
        Ok(edisp)
    }

    pub fn irf(&self) -> &IrfMap {
        &self.inner
    }

    pub fn edisp_map(&self) -> &Map {
        self.inner.irf_map()
    }

    pub fn exposure_map(&self) -> Option<&Map> {
        self.inner.exposure_map()
    }

    pub fn geom(&self) -> &Geom {
        self.inner.geom()
    }

    /// Response matrix at the pixel containing `position` (default: center).
    pub fn get_edisp_kernel(&self, position: Option<&SkyCoord>) -> Result<EDispKernel, IrfError> {
        let geom = self.geom();
        let (ix, iy) = pixel_of(geom, position)?;
        let it = geom.data_axis_index("energy_true")?;
        let ir = geom.data_axis_index("energy")?;
        let true_axis = geom.axis("energy_true")?.clone();
        let reco_axis = geom.axis("energy")?.clone();
        let data = self.edisp_map().data();
        let matrix = Array2::from_shape_fn((true_axis.nbin(), reco_axis.nbin()), |(i, j)| {
            let mut idx = [0usize; 4];
            idx[it] = i;
            idx[ir] = j;
            idx[2] = iy;
            idx[3] = ix;
            data[IxDyn(&idx)]
        });
        EDispKernel::new(true_axis, reco_axis, matrix)
    }

    /// Rebin the reconstructed energy axis by summing grouped columns.
    pub fn resample_energy_axis(
        &self,
        energy_axis: &MapAxis,
        weights: Option<&MaskMap>,
    ) -> Result<Self, IrfError> {
        let resampled = self.edisp_map().resample_axis(energy_axis, weights)?;
        Ok(Self {
            inner: self.inner.with_irf_map(resampled),
        })
    }

    pub fn stack(
        &mut self,
        other: &EDispKernelMap,
        weights: Option<&MaskMap>,
        nan_to_num: bool,
    ) -> Result<(), IrfError> {
        self.inner.stack(&other.inner, weights, nan_to_num)
    }

    fn rewrap(inner: IrfMap) -> Self {
        Self { inner }
    }
}

/// Migration PDF per true energy and spatial bin.
#[derive(Debug, Clone, PartialEq)]
pub struct EDispMap {
    inner: IrfMap,
}

impl EDispMap {
    pub fn new(edisp_map: Map, exposure_map: Option<Map>) -> Result<Self, IrfError> {
        let inner = IrfMap::new(
            EDISP_MAP_KIND,
            edisp_map,
            exposure_map,
            &["migra", "energy_true"],
        )?;
        Ok(Self { inner })
    }

    /// Delta response at `migra = 1` on `geom` with zero exposure.
    pub fn from_geom(geom: &Geom) -> Result<Self, IrfError> {
        let migra = geom.axis("migra")?;
        let widths = migra.bin_width();
        let Some(unity) = migra.coord_to_idx(1.0) else {
            return Err(IrfError::InvalidParameter(
                "migra axis must contain 1".to_string(),
            ));
        };
        let im = geom.data_axis_index("migra")?;
        let data = ArrayD::from_shape_fn(IxDyn(&geom.data_shape()), |idx| {
            if idx[im] == unity {
                1.0 / widths[unity]
            } else {
                0.0
            }
        });
        let exposure = Map::from_geom(geom.squash("migra")?, "m2 s");
        Self::new(Map::from_data(geom.clone(), data, "")?, Some(exposure))
    }

    /// Delta response with unit exposure on a position independent grid.
    pub fn from_diagonal_response(
        energy_axis_true: &MapAxis,
        migra_axis: &MapAxis,
        geom: Option<&Geom>,
    ) -> Result<Self, IrfError> {
        let image = match geom {
            Some(g) => g.to_image(),
            None => all_sky_image()?,
        };
        let geom = image.to_cube(vec![migra_axis.clone(), energy_axis_true.clone()])?;
        let edisp = Self::from_geom(&geom)?;
        let exposure = Map::from_elem(geom.squash("migra")?, 1.0, "m2 s");
        Ok(Self {
            inner: edisp
                .inner
                .with_maps(edisp.inner.irf_map().clone(), Some(exposure)),
        })
    }

    pub fn irf(&self) -> &IrfMap {
        &self.inner
    }

    pub fn edisp_map(&self) -> &Map {
        self.inner.irf_map()
    }

    pub fn exposure_map(&self) -> Option<&Map> {
        self.inner.exposure_map()
    }

    pub fn geom(&self) -> &Geom {
        self.inner.geom()
    }

    /// Migration CDF at the migra edges for every true energy of one pixel.
    fn migra_cdf(&self, ix: usize, iy: usize) -> Result<Array2<f64>, IrfError> {
        let geom = self.geom();
        let migra = geom.axis("migra")?;
        let widths = migra.bin_width();
        let n_true = geom.axis("energy_true")?.nbin();
        let it = geom.data_axis_index("energy_true")?;
        let im = geom.data_axis_index("migra")?;
        let data = self.edisp_map().data();
        let mut cdf = Array2::<f64>::zeros((n_true, migra.nbin() + 1));
        for i in 0..n_true {
            for (k, width) in widths.iter().enumerate() {
                let mut idx = [0usize; 4];
                idx[it] = i;
                idx[im] = k;
                idx[2] = iy;
                idx[3] = ix;
                cdf[[i, k + 1]] = cdf[[i, k]] + data[IxDyn(&idx)] * width;
            }
        }
        Ok(cdf)
    }

    /// Integrate the migration PDF over each reconstructed energy bin.
    pub fn get_edisp_kernel(
        &self,
        position: Option<&SkyCoord>,
        energy_axis: &MapAxis,
    ) -> Result<EDispKernel, IrfError> {
        let geom = self.geom();
        let (ix, iy) = pixel_of(geom, position)?;
        let true_axis = geom.axis("energy_true")?.clone();
        let migra_edges = geom.axis("migra")?.edges();
        let cdf = self.migra_cdf(ix, iy)?;
        let reco_edges = energy_axis.edges();
        let true_centers = true_axis.center();

        let cdf_at = |row: usize, mu: f64| -> f64 {
            let n = migra_edges.len();
            if mu <= migra_edges[0] {
                return 0.0;
            }
            if mu >= migra_edges[n - 1] {
                return cdf[[row, n - 1]];
            }
            let k = migra_edges.partition_point(|m| *m <= mu).clamp(1, n - 1) - 1;
            let t = (mu - migra_edges[k]) / (migra_edges[k + 1] - migra_edges[k]);
            cdf[[row, k]] + t * (cdf[[row, k + 1]] - cdf[[row, k]])
        };
        let matrix = Array2::from_shape_fn((true_axis.nbin(), energy_axis.nbin()), |(i, j)| {
            let e = true_centers[i];
            (cdf_at(i, reco_edges[j + 1] / e) - cdf_at(i, reco_edges[j] / e)).max(0.0)
        });
        EDispKernel::new(true_axis, energy_axis.clone(), matrix)
    }

    /// Response matrix for every spatial bin.
    pub fn to_edisp_kernel_map(&self, energy_axis: &MapAxis) -> Result<EDispKernelMap, IrfError> {
        let geom = self.geom();
        let true_axis = geom.axis("energy_true")?.clone();
        let kernel_geom = geom
            .to_image()
            .to_cube(vec![energy_axis.clone(), true_axis])?;
        let (nx, ny) = geom.npix();
        let mut data = ArrayD::<f64>::zeros(IxDyn(&kernel_geom.data_shape()));
        for iy in 0..ny {
            for ix in 0..nx {
                let position = geom.pix_to_coord(ix as f64, iy as f64);
                let kernel = self.get_edisp_kernel(Some(&position), energy_axis)?;
                let mut pixel = data
                    .index_axis_mut(Axis(3), ix)
                    .index_axis_move(Axis(2), iy);
                pixel.assign(&kernel.pdf_matrix().view().into_dyn());
            }
        }
        let exposure_geom = kernel_geom.squash("energy")?;
        let exposure = self
            .exposure_map()
            .map(|exposure| {
                Map::from_data(exposure_geom, exposure.data().clone(), exposure.unit())
            })
            .transpose()?;
        EDispKernelMap::new(Map::from_data(kernel_geom, data, "")?, exposure)
    }

    pub fn stack(
        &mut self,
        other: &EDispMap,
        weights: Option<&MaskMap>,
        nan_to_num: bool,
    ) -> Result<(), IrfError> {
        self.inner.stack(&other.inner, weights, nan_to_num)
    }

    fn rewrap(inner: IrfMap) -> Self {
        Self { inner }
    }
}

/// Either energy dispersion representation.
#[derive(Debug, Clone, PartialEq)]
pub enum EDispMaps {
    Kernel(EDispKernelMap),
    Migra(EDispMap),
}

impl EDispMaps {
    pub fn irf(&self) -> &IrfMap {
        match self {
            EDispMaps::Kernel(e) => e.irf(),
            EDispMaps::Migra(e) => e.irf(),
        }
    }

    pub fn geom(&self) -> &Geom {
        self.irf().geom()
    }

    pub fn exposure_map(&self) -> Option<&Map> {
        self.irf().exposure_map()
    }

    pub fn kind(&self) -> &'static str {
        self.irf().kind()
    }

    pub fn has_migra(&self) -> bool {
        matches!(self, EDispMaps::Migra(_))
    }

    /// Response matrix at `position` onto `energy_axis`.
    ///
    /// For kernel maps the stored reconstructed axis is used as is.
    pub fn get_edisp_kernel(
        &self,
        position: Option<&SkyCoord>,
        energy_axis: &MapAxis,
    ) -> Result<EDispKernel, IrfError> {
        match self {
            EDispMaps::Kernel(e) => e.get_edisp_kernel(position),
            EDispMaps::Migra(e) => e.get_edisp_kernel(position, energy_axis),
        }
    }

    pub fn stack(
        &mut self,
        other: &EDispMaps,
        weights: Option<&MaskMap>,
        nan_to_num: bool,
    ) -> Result<(), IrfError> {
        match (self, other) {
            (EDispMaps::Kernel(a), EDispMaps::Kernel(b)) => a.stack(b, weights, nan_to_num),
            (EDispMaps::Migra(a), EDispMaps::Migra(b)) => a.stack(b, weights, nan_to_num),
            (a, b) => Err(IrfError::InvalidParameter(format!(
                "cannot stack {} with {}",
                a.kind(),
                b.kind()
            ))),
        }
    }

    fn map_inner(
        &self,
        f: impl Fn(&IrfMap) -> Result<IrfMap, IrfError>,
    ) -> Result<Self, IrfError> {
        Ok(match self {
            EDispMaps::Kernel(e) => EDispMaps::Kernel(EDispKernelMap::rewrap(f(e.irf())?)),
            EDispMaps::Migra(e) => EDispMaps::Migra(EDispMap::rewrap(f(e.irf())?)),
        })
    }

    pub fn cutout(&self, position: &SkyCoord, width: (f64, f64)) -> Result<Self, IrfError> {
        self.map_inner(|irf| irf.cutout(position, width))
    }

    pub fn slice_by_idx(&self, slices: &[(&str, AxisSlice)]) -> Result<Self, IrfError> {
        self.map_inner(|irf| irf.slice_by_idx(slices))
    }

    pub fn to_region_nd_map(&self, region: &SkyRegion) -> Result<Self, IrfError> {
        self.map_inner(|irf| irf.to_region_nd_map(region))
    }

    /// Merge every `factor` bins of `axis_name` in the response map.
    pub fn downsample_axis(
        &self,
        factor: usize,
        axis_name: &str,
        weights: Option<&MaskMap>,
    ) -> Result<Self, IrfError> {
        self.map_inner(|irf| irf.downsample_axis(factor, axis_name, weights))
    }

    /// Resample the reconstructed axis of a kernel map; migration maps are
    /// independent of it and returned unchanged.
    pub fn resample_energy_axis(
        &self,
        energy_axis: &MapAxis,
        weights: Option<&MaskMap>,
    ) -> Result<Self, IrfError> {
        match self {
            EDispMaps::Kernel(e) => Ok(EDispMaps::Kernel(
                e.resample_energy_axis(energy_axis, weights)?,
            )),
            EDispMaps::Migra(e) => Ok(EDispMaps::Migra(e.clone())),
        }
    }

    /// Kernel map representation on `energy_axis`.
    pub fn to_edisp_kernel_map(&self, energy_axis: &MapAxis) -> Result<EDispKernelMap, IrfError> {
        match self {
            EDispMaps::Kernel(e) => Ok(e.clone()),
            EDispMaps::Migra(e) => e.to_edisp_kernel_map(energy_axis),
        }
    }
}

impl From<EDispKernelMap> for EDispMaps {
    fn from(value: EDispKernelMap) -> Self {
        EDispMaps::Kernel(value)
    }
}

impl From<EDispMap> for EDispMaps {
    fn from(value: EDispMap) -> Self {
        EDispMaps::Migra(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use skymaps::AxisInterp;

    fn true_axis() -> MapAxis {
        MapAxis::from_energy_bounds(0.5, 20.0, 8, "TeV", "energy_true").unwrap()
    }

    fn reco_axis() -> MapAxis {
        MapAxis::from_energy_bounds(1.0, 10.0, 3, "TeV", "energy").unwrap()
    }

    fn migra_axis() -> MapAxis {
        MapAxis::from_bounds(0.2, 5.0, 48, "migra", "", AxisInterp::Lin).unwrap()
    }

    #[test]
    fn test_overlap_fraction_identity() {
        let edges = [1.0, 2.0, 4.0];
        let matrix = overlap_fraction(&edges, &edges);
        assert_eq!(matrix, Array2::eye(2));
    }

    #[test]
    fn test_kernel_rows_sum_inside_range() {
        let kernel = EDispKernel::from_diagonal_response(true_axis(), reco_axis());
        let centers = true_axis().center();
        for (i, e) in centers.iter().enumerate() {
            let total: f64 = kernel.pdf_matrix().row(i).sum();
            if *e > 1.1 && *e < 9.0 {
                assert_relative_eq!(total, 1.0, epsilon = 1e-10);
            }
            assert!(total <= 1.0 + 1e-10);
        }
    }

    #[test]
    fn test_kernel_apply_conserves_inside_range() {
        let axis = reco_axis();
        let kernel = EDispKernel::from_diagonal_response(axis.renamed("energy_true"), axis);
        let folded = kernel.apply(&[1.0, 2.0, 3.0]);
        assert_eq!(folded, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_edisp_kernel_map_from_diagonal_response() {
        let edisp =
            EDispKernelMap::from_diagonal_response(&true_axis(), Some(&reco_axis()), None).unwrap();
        assert_eq!(edisp.geom().data_shape(), vec![8, 3, 1, 2]);
        let kernel = edisp.get_edisp_kernel(None).unwrap();
        let expected = EDispKernel::from_diagonal_response(true_axis(), reco_axis());
        assert_eq!(kernel.pdf_matrix(), expected.pdf_matrix());
        assert_relative_eq!(edisp.exposure_map().unwrap().sum(), 16.0);
    }

    #[test]
    fn test_resample_energy_axis_sums_columns() {
        let edisp =
            EDispKernelMap::from_diagonal_response(&true_axis(), Some(&reco_axis()), None).unwrap();
        let before = edisp.get_edisp_kernel(None).unwrap();
        let resampled = edisp.resample_energy_axis(&reco_axis().squash(), None).unwrap();
        let after = resampled.get_edisp_kernel(None).unwrap();
        for i in 0..8 {
            assert_relative_eq!(
                after.pdf_matrix()[[i, 0]],
                before.pdf_matrix().row(i).sum(),
                epsilon = 1e-12
            );
        }
    }

    #[test]
    fn test_edisp_map_delta_integrates_to_one() {
        let edisp = EDispMap::from_diagonal_response(&true_axis(), &migra_axis(), None).unwrap();
        let cdf = edisp.migra_cdf(0, 0).unwrap();
        for i in 0..8 {
            assert_relative_eq!(cdf[[i, 48]], 1.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_edisp_map_kernel_is_near_diagonal() {
        let energy = MapAxis::from_energy_bounds(0.5, 20.0, 8, "TeV", "energy").unwrap();
        let edisp = EDispMap::from_diagonal_response(&true_axis(), &migra_axis(), None).unwrap();
        let kernel = edisp.get_edisp_kernel(None, &energy).unwrap();
        for i in 0..8 {
            let row = kernel.pdf_matrix().row(i);
            assert_relative_eq!(row.sum(), 1.0, epsilon = 1e-10);
            let peak = row
                .iter()
                .enumerate()
                .fold((0, f64::MIN), |acc, (j, v)| if *v > acc.1 { (j, *v) } else { acc });
            assert_eq!(peak.0, i);
        }
    }

    #[test]
    fn test_to_edisp_kernel_map() {
        let edisp = EDispMap::from_diagonal_response(&true_axis(), &migra_axis(), None).unwrap();
        let kernel_map = edisp.to_edisp_kernel_map(&reco_axis()).unwrap();
        assert_eq!(kernel_map.geom().data_shape(), vec![8, 3, 1, 2]);
        assert_eq!(kernel_map.exposure_map().unwrap().data().shape(), &[8, 1, 1, 2]);
    }

    #[test]
    fn test_stack_type_mismatch() {
        let kernel: EDispMaps =
            EDispKernelMap::from_diagonal_response(&true_axis(), Some(&reco_axis()), None)
                .unwrap()
                .into();
        let mut migra: EDispMaps = EDispMap::from_diagonal_response(&true_axis(), &migra_axis(), None)
            .unwrap()
            .into();
        assert!(migra.stack(&kernel, None, true).is_err());
    }

    #[test]
    fn test_position_outside() {
        let geom = Geom::create(SkyCoord::icrs(0.0, 0.0), 0.5, (4, 4), vec![]).unwrap();
        let edisp =
            EDispKernelMap::from_diagonal_response(&true_axis(), Some(&reco_axis()), Some(&geom))
                .unwrap();
        let far = SkyCoord::icrs(40.0, 40.0);
        assert!(matches!(
            edisp.get_edisp_kernel(Some(&far)),
            Err(IrfError::PositionOutside { .. })
        ));
    }
}
