//! Sky regions used for region masks and spectral extraction.

use serde::{Deserialize, Serialize};

use crate::coord::{wrap_delta_lon, SkyCoord};

/// A region on the sky.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SkyRegion {
    /// Circle of `radius` degrees.
    Circle { center: SkyCoord, radius: f64 },
    /// Rectangle aligned with the frame axes, sizes in degrees.
    Rectangle {
        center: SkyCoord,
        width: f64,
        height: f64,
    },
    /// A single position.
    Point { center: SkyCoord },
}

impl SkyRegion {
    pub fn circle(center: SkyCoord, radius: f64) -> Self {
        SkyRegion::Circle { center, radius }
    }

    pub fn rectangle(center: SkyCoord, width: f64, height: f64) -> Self {
        SkyRegion::Rectangle {
            center,
            width,
            height,
        }
    }

    pub fn point(center: SkyCoord) -> Self {
        SkyRegion::Point { center }
    }

    pub fn center(&self) -> SkyCoord {
        match self {
            SkyRegion::Circle { center, .. }
            | SkyRegion::Rectangle { center, .. }
            | SkyRegion::Point { center } => *center,
        }
    }

    /// Whether `coord` lies inside the region. Points contain nothing.
    pub fn contains(&self, coord: &SkyCoord) -> bool {
        match self {
            SkyRegion::Circle { center, radius } => center.separation(coord) <= *radius,
            SkyRegion::Rectangle {
                center,
                width,
                height,
            } => {
                let c = coord.transform_to(center.frame);
                let dlon = wrap_delta_lon(c.lon - center.lon) * center.lat.to_radians().cos();
                let dlat = c.lat - center.lat;
                dlon.abs() <= 0.5 * width && dlat.abs() <= 0.5 * height
            }
            SkyRegion::Point { .. } => false,
        }
    }

    /// Solid angle of the region in steradians.
    pub fn solid_angle(&self) -> f64 {
        match self {
            SkyRegion::Circle { radius, .. } => {
                2.0 * std::f64::consts::PI * (1.0 - radius.to_radians().cos())
            }
            SkyRegion::Rectangle { width, height, .. } => {
                width.to_radians() * height.to_radians()
            }
            SkyRegion::Point { .. } => 0.0,
        }
    }

    /// Half-size of the smallest frame-aligned box enclosing the region.
    pub fn half_extent(&self) -> f64 {
        match self {
            SkyRegion::Circle { radius, .. } => *radius,
            SkyRegion::Rectangle { width, height, .. } => 0.5 * width.max(*height),
            SkyRegion::Point { .. } => 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_circle_contains() {
        let region = SkyRegion::circle(SkyCoord::icrs(10.0, 0.0), 0.5);
        assert!(region.contains(&SkyCoord::icrs(10.3, 0.3)));
        assert!(!region.contains(&SkyCoord::icrs(10.5, 0.3)));
    }

    #[test]
    fn test_rectangle_wraps_longitude() {
        let region = SkyRegion::rectangle(SkyCoord::galactic(0.0, 0.0), 2.0, 1.0);
        assert!(region.contains(&SkyCoord::galactic(359.5, 0.2)));
        assert!(!region.contains(&SkyCoord::galactic(358.5, 0.2)));
        assert!(!region.contains(&SkyCoord::galactic(0.5, 0.6)));
    }

    #[test]
    fn test_small_circle_solid_angle() {
        let region = SkyRegion::circle(SkyCoord::icrs(0.0, 0.0), 0.1);
        let approx_area = std::f64::consts::PI * 0.1f64.to_radians().powi(2);
        assert_relative_eq!(region.solid_angle(), approx_area, max_relative = 1e-5);
    }
}
