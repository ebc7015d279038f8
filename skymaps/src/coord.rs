//! Celestial coordinates on the unit sphere.
//!
//! All angles are in degrees. Separations use the Vincenty formula which is
//! stable for both tiny and antipodal separations.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Celestial reference frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frame {
    #[default]
    Icrs,
    Galactic,
}

/// ICRS to galactic rotation matrix (IAU 1958 definition, J2000 pole).
const ICRS_TO_GALACTIC: [[f64; 3]; 3] = [
    [-0.054_875_560_416_215_4, -0.873_437_090_234_885, -0.483_835_015_548_713],
    [0.494_109_427_875_584, -0.444_829_629_960_011, 0.746_982_244_497_219],
    [-0.867_666_149_019_005, -0.198_076_373_431_202, 0.455_983_776_175_067],
];

/// A position on the sky.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SkyCoord {
    pub lon: f64,
    pub lat: f64,
    pub frame: Frame,
}

impl SkyCoord {
    pub fn new(lon: f64, lat: f64, frame: Frame) -> Self {
        Self { lon, lat, frame }
    }

    pub fn icrs(ra: f64, dec: f64) -> Self {
        Self::new(ra, dec, Frame::Icrs)
    }

    pub fn galactic(l: f64, b: f64) -> Self {
        Self::new(l, b, Frame::Galactic)
    }

    fn to_cartesian(self) -> [f64; 3] {
        let (lon, lat) = (self.lon.to_radians(), self.lat.to_radians());
        [lat.cos() * lon.cos(), lat.cos() * lon.sin(), lat.sin()]
    }

    fn from_cartesian(v: [f64; 3], frame: Frame) -> Self {
        let lon = v[1].atan2(v[0]).to_degrees().rem_euclid(360.0);
        let lat = v[2].clamp(-1.0, 1.0).asin().to_degrees();
        Self::new(lon, lat, frame)
    }

    /// Express the coordinate in another frame.
    pub fn transform_to(&self, frame: Frame) -> SkyCoord {
        if frame == self.frame {
            return *self;
        }
        let v = self.to_cartesian();
        let m = ICRS_TO_GALACTIC;
        let out = match frame {
            Frame::Galactic => [
                m[0][0] * v[0] + m[0][1] * v[1] + m[0][2] * v[2],
                m[1][0] * v[0] + m[1][1] * v[1] + m[1][2] * v[2],
                m[2][0] * v[0] + m[2][1] * v[1] + m[2][2] * v[2],
            ],
            Frame::Icrs => [
                m[0][0] * v[0] + m[1][0] * v[1] + m[2][0] * v[2],
                m[0][1] * v[0] + m[1][1] * v[1] + m[2][1] * v[2],
                m[0][2] * v[0] + m[1][2] * v[1] + m[2][2] * v[2],
            ],
        };
        Self::from_cartesian(out, frame)
    }

    /// Angular separation in degrees.
    pub fn separation(&self, other: &SkyCoord) -> f64 {
        let other = other.transform_to(self.frame);
        let (lon1, lat1) = (self.lon.to_radians(), self.lat.to_radians());
        let (lon2, lat2) = (other.lon.to_radians(), other.lat.to_radians());
        let dlon = lon2 - lon1;
        let num1 = lat2.cos() * dlon.sin();
        let num2 = lat1.cos() * lat2.sin() - lat1.sin() * lat2.cos() * dlon.cos();
        let denom = lat1.sin() * lat2.sin() + lat1.cos() * lat2.cos() * dlon.cos();
        num1.hypot(num2).atan2(denom).to_degrees()
    }

    /// Position angle of `other` as seen from `self`, east of north, in degrees.
    pub fn position_angle(&self, other: &SkyCoord) -> f64 {
        let other = other.transform_to(self.frame);
        let (lon1, lat1) = (self.lon.to_radians(), self.lat.to_radians());
        let (lon2, lat2) = (other.lon.to_radians(), other.lat.to_radians());
        let dlon = lon2 - lon1;
        let x = lat2.sin() * lat1.cos() - lat2.cos() * lat1.sin() * dlon.cos();
        let y = dlon.sin() * lat2.cos();
        y.atan2(x).to_degrees().rem_euclid(360.0)
    }

    /// Point reached by moving `separation` degrees along `position_angle`.
    pub fn directional_offset_by(&self, position_angle: f64, separation: f64) -> SkyCoord {
        let (lon, lat) = (self.lon.to_radians(), self.lat.to_radians());
        let (pa, sep) = (position_angle.to_radians(), separation.to_radians());
        let lat_new = (lat.sin() * sep.cos() + lat.cos() * sep.sin() * pa.cos())
            .clamp(-1.0, 1.0)
            .asin();
        let dlon = (pa.sin() * sep.sin() * lat.cos())
            .atan2(sep.cos() - lat.sin() * lat_new.sin());
        SkyCoord::new(
            (lon + dlon).to_degrees().rem_euclid(360.0),
            lat_new.to_degrees(),
            self.frame,
        )
    }
}

/// A batch of map coordinates: sky positions plus values for named axes.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MapCoord {
    pub skycoord: Vec<SkyCoord>,
    pub axes: BTreeMap<String, Vec<f64>>,
}

impl MapCoord {
    pub fn new(skycoord: Vec<SkyCoord>) -> Self {
        Self {
            skycoord,
            axes: BTreeMap::new(),
        }
    }

    /// Attach values for a named axis, one per position.
    pub fn with_axis(mut self, name: &str, values: Vec<f64>) -> Self {
        self.axes.insert(name.to_string(), values);
        self
    }

    pub fn axis(&self, name: &str) -> Option<&[f64]> {
        self.axes.get(name).map(|v| v.as_slice())
    }

    pub fn len(&self) -> usize {
        self.skycoord.len()
    }

    pub fn is_empty(&self) -> bool {
        self.skycoord.is_empty()
    }
}

/// Wrap a longitude difference into `(-180, 180]` degrees.
pub fn wrap_delta_lon(delta: f64) -> f64 {
    let wrapped = (delta + 180.0).rem_euclid(360.0) - 180.0;
    if wrapped == -180.0 {
        180.0
    } else {
        wrapped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_separation_basic() {
        let a = SkyCoord::icrs(0.0, 0.0);
        let b = SkyCoord::icrs(1.0, 0.0);
        assert_relative_eq!(a.separation(&b), 1.0, epsilon = 1e-12);
        let pole = SkyCoord::icrs(123.0, 90.0);
        assert_relative_eq!(a.separation(&pole), 90.0, epsilon = 1e-12);
    }

    #[test]
    fn test_offset_roundtrip() {
        let start = SkyCoord::galactic(10.0, -5.0);
        for pa in [45.0, 90.0, 200.0, 359.0] {
            let end = start.directional_offset_by(pa, 0.3);
            assert_relative_eq!(start.separation(&end), 0.3, epsilon = 1e-10);
            assert_relative_eq!(start.position_angle(&end), pa, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_offset_north() {
        let start = SkyCoord::icrs(50.0, 10.0);
        let end = start.directional_offset_by(0.0, 2.0);
        assert_relative_eq!(end.lon, 50.0, epsilon = 1e-10);
        assert_relative_eq!(end.lat, 12.0, epsilon = 1e-10);
    }

    #[test]
    fn test_frame_roundtrip() {
        let crab = SkyCoord::icrs(83.633, 22.0145);
        let gal = crab.transform_to(Frame::Galactic);
        assert_relative_eq!(gal.lon, 184.557, epsilon = 1e-2);
        assert_relative_eq!(gal.lat, -5.784, epsilon = 1e-2);
        let back = gal.transform_to(Frame::Icrs);
        assert_relative_eq!(back.separation(&crab), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_wrap_delta_lon() {
        assert_relative_eq!(wrap_delta_lon(350.0), -10.0);
        assert_relative_eq!(wrap_delta_lon(-190.0), 170.0);
        assert_relative_eq!(wrap_delta_lon(180.0), 180.0);
    }
}
