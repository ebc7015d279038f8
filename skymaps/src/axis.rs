//! Non-spatial map axes.
//!
//! A [`MapAxis`] is an ordered list of bin edges (or bin centers for node-like
//! axes) together with a name, a unit and an interpolation scale. Energy axes
//! are log-scaled, so their bin centers are geometric means and pixel
//! coordinates are linear in `ln(E)`.
//!
//! ```
//! use skymaps::axis::MapAxis;
//!
//! let energy = MapAxis::from_energy_bounds(1.0, 10.0, 4, "TeV", "energy").unwrap();
//! assert_eq!(energy.nbin(), 4);
//! assert!((energy.edges()[4] - 10.0).abs() < 1e-12);
//! ```

use serde::{Deserialize, Serialize};
use std::ops::Range;

use crate::error::MapError;

/// Relative tolerance used when comparing axis edges.
pub const EDGE_RTOL: f64 = 1e-6;

/// Interpolation scale of an axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AxisInterp {
    Lin,
    Log,
    Sqrt,
}

impl AxisInterp {
    pub fn forward(&self, value: f64) -> f64 {
        match self {
            AxisInterp::Lin => value,
            AxisInterp::Log => value.ln(),
            AxisInterp::Sqrt => value.sqrt(),
        }
    }

    pub fn inverse(&self, value: f64) -> f64 {
        match self {
            AxisInterp::Lin => value,
            AxisInterp::Log => value.exp(),
            AxisInterp::Sqrt => value * value,
        }
    }
}

/// Whether the axis nodes describe bin edges or bin centers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Edges,
    Center,
}

/// A named, ordered, one-dimensional binning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapAxis {
    name: String,
    nodes: Vec<f64>,
    node_type: NodeType,
    interp: AxisInterp,
    unit: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    labels: Option<Vec<String>>,
}

impl MapAxis {
    /// Create an axis from bin edges.
    ///
    /// # Arguments
    /// * `edges` - Strictly increasing bin edges, at least two
    /// * `name` - Axis name, e.g. "energy"
    /// * `unit` - Unit string of the edges
    /// * `interp` - Interpolation scale
    pub fn from_edges(
        edges: Vec<f64>,
        name: &str,
        unit: &str,
        interp: AxisInterp,
    ) -> Result<Self, MapError> {
        if edges.len() < 2 {
            return Err(MapError::InvalidAxis {
                name: name.to_string(),
                reason: "at least two edges are required".to_string(),
            });
        }
        Self::validate_nodes(&edges, name, interp)?;
        Ok(Self {
            name: name.to_string(),
            nodes: edges,
            node_type: NodeType::Edges,
            interp,
            unit: unit.to_string(),
            labels: None,
        })
    }

    /// Create an axis from bin center nodes.
    pub fn from_nodes(
        nodes: Vec<f64>,
        name: &str,
        unit: &str,
        interp: AxisInterp,
    ) -> Result<Self, MapError> {
        if nodes.is_empty() {
            return Err(MapError::InvalidAxis {
                name: name.to_string(),
                reason: "at least one node is required".to_string(),
            });
        }
        Self::validate_nodes(&nodes, name, interp)?;
        Ok(Self {
            name: name.to_string(),
            nodes,
            node_type: NodeType::Center,
            interp,
            unit: unit.to_string(),
            labels: None,
        })
    }

    /// Create a label axis, one bin per label.
    pub fn from_labels(labels: Vec<String>, name: &str) -> Result<Self, MapError> {
        let nodes = (0..labels.len()).map(|i| i as f64).collect();
        let mut axis = Self::from_nodes(nodes, name, "", AxisInterp::Lin)?;
        axis.labels = Some(labels);
        Ok(axis)
    }

    /// Create an axis with `nbin` bins equally spaced in the interpolation scale.
    pub fn from_bounds(
        lo: f64,
        hi: f64,
        nbin: usize,
        name: &str,
        unit: &str,
        interp: AxisInterp,
    ) -> Result<Self, MapError> {
        if nbin == 0 {
            return Err(MapError::InvalidAxis {
                name: name.to_string(),
                reason: "nbin must be positive".to_string(),
            });
        }
        let (slo, shi) = (interp.forward(lo), interp.forward(hi));
        let edges = (0..=nbin)
            .map(|i| interp.inverse(slo + (shi - slo) * i as f64 / nbin as f64))
            .collect();
        Self::from_edges(edges, name, unit, interp)
    }

    /// Create a log-spaced energy axis.
    pub fn from_energy_bounds(
        energy_min: f64,
        energy_max: f64,
        nbin: usize,
        unit: &str,
        name: &str,
    ) -> Result<Self, MapError> {
        Self::from_bounds(energy_min, energy_max, nbin, name, unit, AxisInterp::Log)
    }

    fn validate_nodes(nodes: &[f64], name: &str, interp: AxisInterp) -> Result<(), MapError> {
        if nodes.iter().any(|v| !v.is_finite()) {
            return Err(MapError::InvalidAxis {
                name: name.to_string(),
                reason: "nodes must be finite".to_string(),
            });
        }
        if nodes.windows(2).any(|w| w[1] <= w[0]) {
            return Err(MapError::InvalidAxis {
                name: name.to_string(),
                reason: "nodes must be strictly increasing".to_string(),
            });
        }
        if interp == AxisInterp::Log && nodes[0] <= 0.0 {
            return Err(MapError::InvalidAxis {
                name: name.to_string(),
                reason: "log axis requires positive nodes".to_string(),
            });
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn unit(&self) -> &str {
        &self.unit
    }

    pub fn interp(&self) -> AxisInterp {
        self.interp
    }

    pub fn node_type(&self) -> NodeType {
        self.node_type
    }

    pub fn labels(&self) -> Option<&[String]> {
        self.labels.as_deref()
    }

    /// Return a copy of the axis with a different name.
    pub fn renamed(&self, name: &str) -> Self {
        let mut axis = self.clone();
        axis.name = name.to_string();
        axis
    }

    pub fn nbin(&self) -> usize {
        match self.node_type {
            NodeType::Edges => self.nodes.len() - 1,
            NodeType::Center => self.nodes.len(),
        }
    }

    /// Bin edges. For center-node axes the edges lie halfway between nodes
    /// in the interpolation scale.
    pub fn edges(&self) -> Vec<f64> {
        match self.node_type {
            NodeType::Edges => self.nodes.clone(),
            NodeType::Center => (0..=self.nodes.len())
                .map(|i| self.pix_to_coord(i as f64 - 0.5))
                .collect(),
        }
    }

    /// Bin centers, computed in the interpolation scale.
    pub fn center(&self) -> Vec<f64> {
        match self.node_type {
            NodeType::Edges => self
                .nodes
                .windows(2)
                .map(|w| {
                    self.interp
                        .inverse(0.5 * (self.interp.forward(w[0]) + self.interp.forward(w[1])))
                })
                .collect(),
            NodeType::Center => self.nodes.clone(),
        }
    }

    pub fn bin_width(&self) -> Vec<f64> {
        self.edges().windows(2).map(|w| w[1] - w[0]).collect()
    }

    pub fn edges_min(&self) -> f64 {
        self.edges()[0]
    }

    pub fn edges_max(&self) -> f64 {
        let edges = self.edges();
        edges[edges.len() - 1]
    }

    /// Nodes in the interpolation scale and the pixel offset of the first node.
    fn scaled_nodes(&self) -> (Vec<f64>, f64) {
        let scaled = self.nodes.iter().map(|v| self.interp.forward(*v)).collect();
        let offset = match self.node_type {
            NodeType::Edges => -0.5,
            NodeType::Center => 0.0,
        };
        (scaled, offset)
    }

    /// Convert a coordinate to a fractional pixel position.
    ///
    /// Bin `i` spans pixel coordinates `[i - 0.5, i + 0.5)`. Values outside the
    /// axis range are extrapolated linearly from the outermost bin.
    pub fn coord_to_pix(&self, coord: f64) -> f64 {
        let (nodes, offset) = self.scaled_nodes();
        let value = self.interp.forward(coord);
        if nodes.len() == 1 {
            return if (value - nodes[0]).abs() <= EDGE_RTOL * nodes[0].abs().max(1.0) {
                0.0
            } else {
                f64::NAN
            };
        }
        let n = nodes.len();
        let idx = match nodes.partition_point(|v| *v <= value) {
            0 => 0,
            i if i >= n => n - 2,
            i => i - 1,
        };
        let frac = (value - nodes[idx]) / (nodes[idx + 1] - nodes[idx]);
        idx as f64 + frac + offset
    }

    /// Convert a fractional pixel position back to a coordinate.
    pub fn pix_to_coord(&self, pix: f64) -> f64 {
        let (nodes, offset) = self.scaled_nodes();
        if nodes.len() == 1 {
            return self.nodes[0];
        }
        let p = pix - offset;
        let n = nodes.len();
        let idx = (p.floor().max(0.0) as usize).min(n - 2);
        let frac = p - idx as f64;
        self.interp
            .inverse(nodes[idx] + frac * (nodes[idx + 1] - nodes[idx]))
    }

    /// Index of the bin containing `coord`, or `None` when outside the axis.
    pub fn coord_to_idx(&self, coord: f64) -> Option<usize> {
        let pix = self.coord_to_pix(coord);
        if !pix.is_finite() {
            return None;
        }
        let idx = (pix + 0.5).floor();
        if idx < 0.0 || idx >= self.nbin() as f64 {
            None
        } else {
            Some(idx as usize)
        }
    }

    /// Index of the bin containing `coord`, clipped to the valid range.
    pub fn coord_to_idx_clip(&self, coord: f64) -> usize {
        let pix = self.coord_to_pix(coord);
        if !pix.is_finite() {
            return 0;
        }
        ((pix + 0.5).floor().max(0.0) as usize).min(self.nbin() - 1)
    }

    /// Single bin spanning the full axis range.
    pub fn squash(&self) -> Self {
        let mut axis = self.clone();
        axis.nodes = vec![self.edges_min(), self.edges_max()];
        axis.node_type = NodeType::Edges;
        axis.labels = None;
        axis
    }

    /// Subdivide every bin into `factor` bins, equally spaced in the axis scale.
    pub fn upsample(&self, factor: usize) -> Self {
        let mut axis = self.clone();
        let f = factor.max(1) as f64;
        axis.nodes = match self.node_type {
            NodeType::Edges => (0..=self.nbin() * factor.max(1))
                .map(|k| self.pix_to_coord(-0.5 + k as f64 / f))
                .collect(),
            NodeType::Center => (0..=(self.nodes.len() - 1) * factor.max(1))
                .map(|k| self.pix_to_coord(k as f64 / f))
                .collect(),
        };
        axis.labels = None;
        axis
    }

    /// Merge every `factor` consecutive bins.
    pub fn downsample(&self, factor: usize) -> Result<Self, MapError> {
        if factor == 0 || self.nbin() % factor != 0 {
            return Err(MapError::NotDivisible {
                factor,
                what: format!("axis '{}'", self.name),
                size: self.nbin(),
            });
        }
        let edges: Vec<f64> = self.edges().into_iter().step_by(factor).collect();
        let mut axis = self.clone();
        axis.nodes = edges;
        axis.node_type = NodeType::Edges;
        axis.labels = None;
        Ok(axis)
    }

    /// Sub-axis made of the bins in `range`.
    pub fn slice(&self, range: Range<usize>) -> Result<Self, MapError> {
        if range.start >= range.end || range.end > self.nbin() {
            return Err(MapError::IndexOutOfRange {
                axis: self.name.clone(),
                index: range.end,
                nbin: self.nbin(),
            });
        }
        let mut axis = self.clone();
        axis.nodes = match self.node_type {
            NodeType::Edges => self.nodes[range.start..=range.end].to_vec(),
            NodeType::Center => self.nodes[range.clone()].to_vec(),
        };
        axis.labels = self.labels.as_ref().map(|l| l[range].to_vec());
        Ok(axis)
    }

    /// Whether both axes have the same binning within [`EDGE_RTOL`].
    pub fn is_allclose(&self, other: &MapAxis) -> bool {
        let (a, b) = (self.edges(), other.edges());
        a.len() == b.len()
            && a.iter()
                .zip(b.iter())
                .all(|(x, y)| (x - y).abs() <= EDGE_RTOL * x.abs().max(y.abs()).max(1e-12))
    }

    /// Range of bins between the edges nearest to `lo` and `hi`.
    ///
    /// Bounds are rounded to the closest bin edge in pixel space (ties to
    /// even) and clipped to the axis, so the selection covers the requested
    /// range as closely as the binning allows.
    pub fn bins_nearest(&self, lo: f64, hi: f64) -> Result<Range<usize>, MapError> {
        let nbin = self.nbin() as f64;
        let edge = |value: f64| {
            let pix = self.coord_to_pix(value);
            if pix.is_nan() {
                return None;
            }
            Some((pix.clamp(-0.5, nbin - 0.5) + 0.5).round_ties_even() as usize)
        };
        match (edge(lo), edge(hi)) {
            (Some(start), Some(end)) if end > start => Ok(start..end),
            _ => Err(MapError::InvalidAxis {
                name: self.name.clone(),
                reason: format!("no bin between the edges nearest to {lo} and {hi}"),
            }),
        }
    }

    /// For every bin of `target`, the range of bins of `self` whose centers fall
    /// inside it. Bins of `self` outside the target range are dropped.
    pub fn group_by(&self, target: &MapAxis) -> Vec<Range<usize>> {
        let target_edges = target.edges();
        let centers = self.center();
        target_edges
            .windows(2)
            .map(|w| {
                let start = centers.partition_point(|c| *c < w[0]);
                let end = centers.partition_point(|c| *c < w[1]);
                start..end.max(start)
            })
            .collect()
    }
}

/// Ordered collection of non-spatial axes.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MapAxes(Vec<MapAxis>);

impl MapAxes {
    pub fn new(axes: Vec<MapAxis>) -> Result<Self, MapError> {
        for (i, axis) in axes.iter().enumerate() {
            if axes[..i].iter().any(|a| a.name == axis.name) {
                return Err(MapError::InvalidAxis {
                    name: axis.name.clone(),
                    reason: "duplicate axis name".to_string(),
                });
            }
        }
        Ok(Self(axes))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &MapAxis> + ExactSizeIterator {
        self.0.iter()
    }

    pub fn names(&self) -> Vec<&str> {
        self.0.iter().map(|a| a.name()).collect()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.0.iter().position(|a| a.name == name)
    }

    pub fn get(&self, name: &str) -> Result<&MapAxis, MapError> {
        self.0
            .iter()
            .find(|a| a.name == name)
            .ok_or_else(|| MapError::AxisNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index_of(name).is_some()
    }

    /// Number of bins per axis in declared order.
    pub fn shape(&self) -> Vec<usize> {
        self.0.iter().map(|a| a.nbin()).collect()
    }

    /// Replace the axis with the same name.
    pub fn replace(&self, axis: MapAxis) -> Result<Self, MapError> {
        let idx = self
            .index_of(axis.name())
            .ok_or_else(|| MapError::AxisNotFound(axis.name().to_string()))?;
        let mut axes = self.0.clone();
        axes[idx] = axis;
        Ok(Self(axes))
    }

    pub fn drop(&self, name: &str) -> Result<Self, MapError> {
        let idx = self
            .index_of(name)
            .ok_or_else(|| MapError::AxisNotFound(name.to_string()))?;
        let mut axes = self.0.clone();
        axes.remove(idx);
        Ok(Self(axes))
    }

    pub fn squash(&self, name: &str) -> Result<Self, MapError> {
        let squashed = self.get(name)?.squash();
        self.replace(squashed)
    }

    pub fn to_vec(&self) -> Vec<MapAxis> {
        self.0.clone()
    }

    /// Whether every axis has an all-close counterpart of the same name.
    pub fn is_allclose(&self, other: &MapAxes) -> bool {
        self.len() == other.len()
            && self
                .iter()
                .zip(other.iter())
                .all(|(a, b)| a.name == b.name && a.is_allclose(b))
    }
}

impl std::ops::Index<usize> for MapAxes {
    type Output = MapAxis;

    fn index(&self, index: usize) -> &MapAxis {
        &self.0[index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn energy_axis() -> MapAxis {
        MapAxis::from_energy_bounds(0.1, 100.0, 10, "TeV", "energy").unwrap()
    }

    #[test]
    fn test_log_axis_centers_are_geometric() {
        let axis = MapAxis::from_energy_bounds(1.0, 100.0, 2, "TeV", "energy").unwrap();
        let center = axis.center();
        assert_relative_eq!(center[0], 10f64.sqrt(), epsilon = 1e-12);
        assert_relative_eq!(center[1], 1000f64.sqrt(), epsilon = 1e-9);
    }

    #[test]
    fn test_coord_pix_roundtrip() {
        let axis = energy_axis();
        for coord in [0.15, 1.0, 3.3, 42.0] {
            let pix = axis.coord_to_pix(coord);
            assert_relative_eq!(axis.pix_to_coord(pix), coord, max_relative = 1e-10);
        }
        assert_relative_eq!(axis.coord_to_pix(0.1), -0.5, epsilon = 1e-12);
        assert_relative_eq!(axis.coord_to_pix(100.0), 9.5, epsilon = 1e-9);
    }

    #[test]
    fn test_coord_to_idx_outside() {
        let axis = energy_axis();
        assert_eq!(axis.coord_to_idx(0.05), None);
        assert_eq!(axis.coord_to_idx(1000.0), None);
        assert_eq!(axis.coord_to_idx(0.11), Some(0));
        assert_eq!(axis.coord_to_idx_clip(1000.0), 9);
    }

    #[test]
    fn test_bins_nearest_energy_range() {
        let axis = energy_axis();
        let range = axis.bins_nearest(1.0, 5.0).unwrap();
        assert_eq!(range, 3..6);
        let sliced = axis.slice(range).unwrap();
        assert_relative_eq!(sliced.edges_min(), 0.1 * 10f64.powf(0.9), max_relative = 1e-9);
        assert_relative_eq!(sliced.edges_max(), 0.1 * 10f64.powf(1.8), max_relative = 1e-9);
    }

    #[test]
    fn test_bins_nearest_exact_and_outside() {
        let axis = MapAxis::from_energy_bounds(1.0, 10.0, 4, "TeV", "energy").unwrap();
        assert_eq!(axis.bins_nearest(1.0, 10.0).unwrap(), 0..4);
        assert_eq!(axis.bins_nearest(0.01, 1000.0).unwrap(), 0..4);
        assert!(axis.bins_nearest(2.0, 2.1).is_err());
    }

    #[test]
    fn test_squash_upsample_downsample() {
        let axis = energy_axis();
        let squashed = axis.squash();
        assert_eq!(squashed.nbin(), 1);
        assert_relative_eq!(squashed.edges_max(), 100.0, max_relative = 1e-12);

        let up = axis.upsample(3);
        assert_eq!(up.nbin(), 30);
        assert_relative_eq!(up.edges()[3], axis.edges()[1], max_relative = 1e-10);

        let down = axis.downsample(5).unwrap();
        assert_eq!(down.nbin(), 2);
        assert!(axis.downsample(3).is_err());
    }

    #[test]
    fn test_group_by() {
        let fine = MapAxis::from_energy_bounds(1.0, 10.0, 4, "TeV", "energy").unwrap();
        let coarse = MapAxis::from_energy_bounds(1.0, 10.0, 2, "TeV", "energy").unwrap();
        assert_eq!(fine.group_by(&coarse), vec![0..2, 2..4]);
    }

    #[test]
    fn test_label_axis() {
        let axis =
            MapAxis::from_labels(vec!["a".to_string(), "b".to_string()], "models").unwrap();
        assert_eq!(axis.nbin(), 2);
        assert_eq!(axis.labels().unwrap()[1], "b");
    }

    #[test]
    fn test_invalid_edges() {
        assert!(MapAxis::from_edges(vec![1.0], "x", "", AxisInterp::Lin).is_err());
        assert!(MapAxis::from_edges(vec![2.0, 1.0], "x", "", AxisInterp::Lin).is_err());
        assert!(MapAxis::from_edges(vec![0.0, 1.0], "x", "", AxisInterp::Log).is_err());
    }

    #[test]
    fn test_axes_duplicate_names() {
        let axis = energy_axis();
        assert!(MapAxes::new(vec![axis.clone(), axis]).is_err());
    }
}
