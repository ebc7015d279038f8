//! Sky and background models evaluated by the map datasets.
//!
//! Spectral models return integrated fluxes per energy bin in `cm-2 s-1`;
//! spatial models return the fraction of the flux falling in every pixel.

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use skymaps::{Frame, Geom, MapAxis, SkyCoord, SkyRegion};

use crate::error::DatasetError;

/// Square centimeters per square meter.
pub const CM2_PER_M2: f64 = 1e4;

/// Oversampling used to integrate spatial models over a region.
const REGION_GRID_NPIX: usize = 101;

/// Conversion factor from `unit` to TeV. Unknown units are taken as TeV.
pub fn energy_to_tev(unit: &str) -> f64 {
    match unit {
        "keV" => 1e-9,
        "MeV" => 1e-6,
        "GeV" => 1e-3,
        "PeV" => 1e3,
        _ => 1.0,
    }
}

/// A named model parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub value: f64,
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub frozen: bool,
}

impl Parameter {
    pub fn new(name: &str, value: f64, unit: &str) -> Self {
        Self {
            name: name.to_string(),
            value,
            unit: unit.to_string(),
            frozen: false,
        }
    }
}

/// Snapshot of parameter values used to detect model changes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Parameters {
    values: Vec<f64>,
}

impl Parameters {
    pub fn from_values(values: Vec<f64>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Same values, counting NaN as equal to NaN.
    pub fn matches(&self, other: &Parameters) -> bool {
        self.values.len() == other.values.len()
            && self
                .values
                .iter()
                .zip(other.values.iter())
                .all(|(a, b)| a == b || (a.is_nan() && b.is_nan()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SpectralModel {
    /// `amplitude * (E / reference)^-index`, amplitude in `cm-2 s-1 TeV-1`.
    PowerLaw {
        amplitude: Parameter,
        index: Parameter,
        reference: Parameter,
    },
    /// Flat spectrum in `cm-2 s-1 TeV-1`.
    Constant { constant: Parameter },
}

impl SpectralModel {
    pub fn power_law(amplitude: f64, index: f64, reference: f64) -> Self {
        SpectralModel::PowerLaw {
            amplitude: Parameter::new("amplitude", amplitude, "cm-2 s-1 TeV-1"),
            index: Parameter::new("index", index, ""),
            reference: Parameter::new("reference", reference, "TeV"),
        }
    }

    pub fn constant(value: f64) -> Self {
        SpectralModel::Constant {
            constant: Parameter::new("const", value, "cm-2 s-1 TeV-1"),
        }
    }

    pub fn parameters(&self) -> Vec<&Parameter> {
        match self {
            SpectralModel::PowerLaw {
                amplitude,
                index,
                reference,
            } => vec![amplitude, index, reference],
            SpectralModel::Constant { constant } => vec![constant],
        }
    }

    /// Differential flux at `energy` TeV.
    pub fn evaluate(&self, energy: f64) -> f64 {
        match self {
            SpectralModel::PowerLaw {
                amplitude,
                index,
                reference,
            } => amplitude.value * (energy / reference.value).powf(-index.value),
            SpectralModel::Constant { constant } => constant.value,
        }
    }

    /// Flux integrated between `energy_min` and `energy_max` TeV.
    pub fn integral(&self, energy_min: f64, energy_max: f64) -> f64 {
        match self {
            SpectralModel::PowerLaw {
                amplitude,
                index,
                reference,
            } => {
                let e0 = reference.value;
                let g = index.value;
                if (g - 1.0).abs() < 1e-10 {
                    amplitude.value * e0 * (energy_max / energy_min).ln()
                } else {
                    let p = 1.0 - g;
                    amplitude.value * e0 / p
                        * ((energy_max / e0).powf(p) - (energy_min / e0).powf(p))
                }
            }
            SpectralModel::Constant { constant } => constant.value * (energy_max - energy_min),
        }
    }

    /// Integrated flux per bin of `axis`, in `m-2 s-1`.
    pub fn integrate_axis(&self, axis: &MapAxis) -> Vec<f64> {
        let scale = energy_to_tev(axis.unit());
        axis.edges()
            .windows(2)
            .map(|w| self.integral(w[0] * scale, w[1] * scale) * CM2_PER_M2)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SpatialModel {
    Point {
        lon: Parameter,
        lat: Parameter,
        frame: Frame,
    },
    /// Symmetric Gaussian, `sigma` in degrees.
    Gauss {
        lon: Parameter,
        lat: Parameter,
        sigma: Parameter,
        frame: Frame,
    },
    /// Isotropic surface brightness in `sr-1`.
    Constant { value: Parameter },
}

impl SpatialModel {
    pub fn point(position: SkyCoord) -> Self {
        SpatialModel::Point {
            lon: Parameter::new("lon_0", position.lon, "deg"),
            lat: Parameter::new("lat_0", position.lat, "deg"),
            frame: position.frame,
        }
    }

    pub fn gauss(position: SkyCoord, sigma: f64) -> Self {
        SpatialModel::Gauss {
            lon: Parameter::new("lon_0", position.lon, "deg"),
            lat: Parameter::new("lat_0", position.lat, "deg"),
            sigma: Parameter::new("sigma", sigma, "deg"),
            frame: position.frame,
        }
    }

    pub fn constant(value: f64) -> Self {
        SpatialModel::Constant {
            value: Parameter::new("value", value, "sr-1"),
        }
    }

    pub fn parameters(&self) -> Vec<&Parameter> {
        match self {
            SpatialModel::Point { lon, lat, .. } => vec![lon, lat],
            SpatialModel::Gauss { lon, lat, sigma, .. } => vec![lon, lat, sigma],
            SpatialModel::Constant { value } => vec![value],
        }
    }

    pub fn position(&self) -> Option<SkyCoord> {
        match self {
            SpatialModel::Point { lon, lat, frame } | SpatialModel::Gauss { lon, lat, frame, .. } => {
                Some(SkyCoord::new(lon.value, lat.value, *frame))
            }
            SpatialModel::Constant { .. } => None,
        }
    }

    /// Radius outside of which the model is negligible, `None` when unbounded.
    pub fn evaluation_radius(&self) -> Option<f64> {
        match self {
            SpatialModel::Point { .. } => Some(0.0),
            SpatialModel::Gauss { sigma, .. } => Some(5.0 * sigma.value),
            SpatialModel::Constant { .. } => None,
        }
    }

    /// Fraction of the model flux in every pixel of `geom`, shape `(ny, nx)`.
    pub fn evaluate_geom(&self, geom: &Geom) -> Result<Array2<f64>, DatasetError> {
        if let Some(region) = geom.region_shape() {
            return Ok(Array2::from_elem((1, 1), self.integrate_region(region)?));
        }
        Ok(match self {
            SpatialModel::Point { .. } => self.point_fractions(geom),
            SpatialModel::Gauss { sigma, .. } => {
                let center = self.position().unwrap_or_else(|| geom.center_coord());
                let s = sigma.value.to_radians();
                let norm = 1.0 / (2.0 * std::f64::consts::PI * s * s);
                let separation = geom.separation(&center);
                let mut values = geom.solid_angle();
                values.zip_mut_with(&separation, |v, sep| {
                    let t = sep.to_radians();
                    *v *= norm * (-0.5 * t * t / (s * s)).exp();
                });
                values
            }
            SpatialModel::Constant { value } => geom.solid_angle().mapv(|omega| value.value * omega),
        })
    }

    /// Point source flux split bilinearly between the four nearest pixel centers.
    fn point_fractions(&self, geom: &Geom) -> Array2<f64> {
        let (nx, ny) = geom.npix();
        let mut out = Array2::zeros((ny, nx));
        let Some(position) = self.position() else {
            return out;
        };
        let (x, y) = geom.coord_to_pix(&position);
        if !x.is_finite() || !y.is_finite() {
            return out;
        }
        let (x0, y0) = (x.floor(), y.floor());
        let (fx, fy) = (x - x0, y - y0);
        let corners = [
            (x0, y0, (1.0 - fx) * (1.0 - fy)),
            (x0 + 1.0, y0, fx * (1.0 - fy)),
            (x0, y0 + 1.0, (1.0 - fx) * fy),
            (x0 + 1.0, y0 + 1.0, fx * fy),
        ];
        for (cx, cy, w) in corners {
            if cx >= 0.0 && cy >= 0.0 && cx < nx as f64 && cy < ny as f64 {
                out[[cy as usize, cx as usize]] += w;
            }
        }
        out
    }

    /// Fraction of the flux inside `region`, integrated on a fine grid.
    fn integrate_region(&self, region: &SkyRegion) -> Result<f64, DatasetError> {
        match (self, region) {
            (SpatialModel::Point { .. }, _) => Ok(self
                .position()
                .map_or(0.0, |p| if region.contains(&p) { 1.0 } else { 0.0 })),
            (SpatialModel::Constant { value }, _) => Ok(value.value * region.solid_angle()),
            (SpatialModel::Gauss { .. }, SkyRegion::Point { .. }) => Ok(0.0),
            (SpatialModel::Gauss { .. }, _) => {
                let extent = region.half_extent().max(1e-6);
                let binsz = 2.0 * extent / REGION_GRID_NPIX as f64;
                let grid = Geom::create(
                    region.center(),
                    binsz,
                    (REGION_GRID_NPIX, REGION_GRID_NPIX),
                    vec![],
                )?;
                let values = self.evaluate_geom(&grid)?;
                let inside = grid.region_mask(region);
                Ok(values
                    .iter()
                    .zip(inside.iter())
                    .filter(|(_, keep)| **keep)
                    .map(|(v, _)| *v)
                    .sum())
            }
        }
    }
}

/// Source model: spectrum times spatial morphology.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkyModel {
    pub name: String,
    pub spectral: SpectralModel,
    /// `None` for models applied to a single region
    pub spatial: Option<SpatialModel>,
    /// Datasets the model applies to, `None` for all
    pub datasets_names: Option<Vec<String>>,
}

impl SkyModel {
    pub fn new(name: &str, spectral: SpectralModel, spatial: Option<SpatialModel>) -> Self {
        Self {
            name: name.to_string(),
            spectral,
            spatial,
            datasets_names: None,
        }
    }

    pub fn with_datasets_names(mut self, names: Vec<String>) -> Self {
        self.datasets_names = Some(names);
        self
    }

    pub fn applies_to(&self, dataset_name: &str) -> bool {
        self.datasets_names
            .as_ref()
            .map_or(true, |names| names.iter().any(|n| n == dataset_name))
    }

    pub fn position(&self) -> Option<SkyCoord> {
        self.spatial.as_ref().and_then(|s| s.position())
    }

    pub fn evaluation_radius(&self) -> Option<f64> {
        self.spatial.as_ref().and_then(|s| s.evaluation_radius())
    }

    pub fn parameters(&self) -> Parameters {
        let spatial = self.spatial.iter().flat_map(|s| s.parameters());
        Parameters::from_values(
            self.spectral
                .parameters()
                .into_iter()
                .chain(spatial)
                .map(|p| p.value)
                .collect(),
        )
    }
}

/// Background normalization per dataset: `norm * (E / reference)^-tilt`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FoVBackgroundModel {
    pub dataset_name: String,
    pub norm: Parameter,
    pub tilt: Parameter,
    pub reference: Parameter,
}

impl FoVBackgroundModel {
    pub fn new(dataset_name: &str) -> Self {
        Self {
            dataset_name: dataset_name.to_string(),
            norm: Parameter::new("norm", 1.0, ""),
            tilt: Parameter::new("tilt", 0.0, ""),
            reference: Parameter::new("reference", 1.0, "TeV"),
        }
    }

    pub fn name(&self) -> String {
        format!("{}-bkg", self.dataset_name)
    }

    pub fn parameters(&self) -> Parameters {
        Parameters::from_values(vec![self.norm.value, self.tilt.value, self.reference.value])
    }

    /// Scale factor for every bin of the data array of `geom`.
    ///
    /// The result has the shape of `geom.data_shape()` with the spatial
    /// dimensions collapsed to one, ready to broadcast.
    pub fn evaluate_geom(&self, geom: &Geom) -> Result<ndarray::ArrayD<f64>, DatasetError> {
        let mut shape = vec![1usize; geom.data_shape().len()];
        let Ok(axis) = geom.axis("energy") else {
            return Ok(ndarray::ArrayD::from_elem(
                ndarray::IxDyn(&shape),
                self.norm.value,
            ));
        };
        let dim = geom.data_axis_index("energy")?;
        shape[dim] = axis.nbin();
        let scale = energy_to_tev(axis.unit());
        let values: Vec<f64> = axis
            .center()
            .iter()
            .map(|e| self.norm.value * (e * scale / self.reference.value).powf(-self.tilt.value))
            .collect();
        ndarray::ArrayD::from_shape_vec(ndarray::IxDyn(&shape), values).map_err(|e| {
            DatasetError::Map(skymaps::MapError::InvalidAxis {
                name: "energy".to_string(),
                reason: e.to_string(),
            })
        })
    }
}

/// Sky models plus per-dataset background models.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatasetModels {
    models: Vec<SkyModel>,
    backgrounds: Vec<FoVBackgroundModel>,
}

impl DatasetModels {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model(mut self, model: SkyModel) -> Self {
        self.models.push(model);
        self
    }

    pub fn with_background(mut self, background: FoVBackgroundModel) -> Self {
        self.backgrounds.retain(|b| b.dataset_name != background.dataset_name);
        self.backgrounds.push(background);
        self
    }

    pub fn sky_models(&self) -> &[SkyModel] {
        &self.models
    }

    pub fn names(&self) -> Vec<&str> {
        self.models.iter().map(|m| m.name.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty() && self.backgrounds.is_empty()
    }

    pub fn get(&self, name: &str) -> Result<&SkyModel, DatasetError> {
        self.models
            .iter()
            .find(|m| m.name == name)
            .ok_or_else(|| DatasetError::UnknownModel(name.to_string()))
    }

    pub fn get_mut(&mut self, name: &str) -> Result<&mut SkyModel, DatasetError> {
        self.models
            .iter_mut()
            .find(|m| m.name == name)
            .ok_or_else(|| DatasetError::UnknownModel(name.to_string()))
    }

    pub fn background_model(&self, dataset_name: &str) -> Option<&FoVBackgroundModel> {
        self.backgrounds
            .iter()
            .find(|b| b.dataset_name == dataset_name)
    }

    pub fn background_model_mut(&mut self, dataset_name: &str) -> Option<&mut FoVBackgroundModel> {
        self.backgrounds
            .iter_mut()
            .find(|b| b.dataset_name == dataset_name)
    }

    /// Models applying to `dataset_name`.
    pub fn select(&self, dataset_name: &str) -> DatasetModels {
        DatasetModels {
            models: self
                .models
                .iter()
                .filter(|m| m.applies_to(dataset_name))
                .cloned()
                .collect(),
            backgrounds: self
                .backgrounds
                .iter()
                .filter(|b| b.dataset_name == dataset_name)
                .cloned()
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_power_law_integral() {
        let pwl = SpectralModel::power_law(1e-12, 2.0, 1.0);
        // Analytic: A * E0^2 * (1/e1 - 1/e2)
        assert_relative_eq!(pwl.integral(1.0, 10.0), 1e-12 * 0.9, max_relative = 1e-12);
        let flat = SpectralModel::power_law(1e-12, 1.0, 1.0);
        assert_relative_eq!(flat.integral(1.0, 10.0), 1e-12 * 10f64.ln(), max_relative = 1e-12);
    }

    #[test]
    fn test_integrate_axis_units() {
        let axis = MapAxis::from_energy_bounds(1000.0, 10000.0, 1, "GeV", "energy_true").unwrap();
        let flux = SpectralModel::constant(1e-12).integrate_axis(&axis);
        assert_relative_eq!(flux[0], 9e-12 * CM2_PER_M2, max_relative = 1e-12);
    }

    #[test]
    fn test_point_source_split() {
        let geom = Geom::create(SkyCoord::icrs(0.0, 0.0), 1.0, (4, 4), vec![]).unwrap();
        let position = geom.pix_to_coord(1.5, 2.0);
        let fractions = SpatialModel::point(position).evaluate_geom(&geom).unwrap();
        assert_relative_eq!(fractions.sum(), 1.0, epsilon = 1e-9);
        assert_relative_eq!(fractions[[2, 1]], 0.5, epsilon = 1e-6);
        assert_relative_eq!(fractions[[2, 2]], 0.5, epsilon = 1e-6);
    }

    #[test]
    fn test_gauss_normalized() {
        let geom = Geom::create(SkyCoord::galactic(0.0, 0.0), 0.02, (101, 101), vec![]).unwrap();
        let gauss = SpatialModel::gauss(SkyCoord::galactic(0.0, 0.0), 0.2);
        let values = gauss.evaluate_geom(&geom).unwrap();
        assert_relative_eq!(values.sum(), 1.0, epsilon = 1e-2);
    }

    #[test]
    fn test_gauss_region_fraction() {
        let center = SkyCoord::galactic(0.0, 0.0);
        let gauss = SpatialModel::gauss(center, 0.1);
        let geom = Geom::region(SkyRegion::circle(center, 0.1), vec![]).unwrap();
        let fraction = gauss.evaluate_geom(&geom).unwrap()[[0, 0]];
        // 1 - exp(-1/2) inside one sigma
        assert_relative_eq!(fraction, 1.0 - (-0.5f64).exp(), epsilon = 1e-2);
    }

    #[test]
    fn test_parameters_nan_matches() {
        let a = Parameters::from_values(vec![1.0, f64::NAN]);
        let b = Parameters::from_values(vec![1.0, f64::NAN]);
        let c = Parameters::from_values(vec![2.0, f64::NAN]);
        assert!(a.matches(&b));
        assert!(!a.matches(&c));
    }

    #[test]
    fn test_background_model_tilt() {
        let axis = MapAxis::from_energy_bounds(1.0, 100.0, 2, "TeV", "energy").unwrap();
        let geom = Geom::create(SkyCoord::icrs(0.0, 0.0), 1.0, (2, 2), vec![axis]).unwrap();
        let mut bkg = FoVBackgroundModel::new("obs");
        bkg.norm.value = 2.0;
        bkg.tilt.value = 1.0;
        let values = bkg.evaluate_geom(&geom).unwrap();
        assert_eq!(values.shape(), &[2, 1, 1]);
        assert_relative_eq!(values[[0, 0, 0]], 2.0 / 10f64.sqrt(), max_relative = 1e-9);
        assert_eq!(bkg.name(), "obs-bkg");
    }

    #[test]
    fn test_select_models() {
        let model = SkyModel::new("src", SpectralModel::constant(1.0), None)
            .with_datasets_names(vec!["a".to_string()]);
        let models = DatasetModels::new()
            .with_model(model)
            .with_background(FoVBackgroundModel::new("a"));
        assert_eq!(models.select("a").names(), vec!["src"]);
        assert!(models.select("b").names().is_empty());
        assert!(models.select("b").background_model("a").is_none());
        assert!(matches!(models.get("x"), Err(DatasetError::UnknownModel(_))));
    }
}
