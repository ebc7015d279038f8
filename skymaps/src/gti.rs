//! Good time intervals.

use serde::{Deserialize, Serialize};

/// Sorted list of `[start, stop)` intervals in seconds relative to a
/// reference time given in MJD.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gti {
    reference_time_mjd: f64,
    intervals: Vec<(f64, f64)>,
}

const SECONDS_PER_DAY: f64 = 86400.0;

impl Default for Gti {
    fn default() -> Self {
        Self {
            reference_time_mjd: 51910.0,
            intervals: Vec::new(),
        }
    }
}

impl Gti {
    /// Create from parallel start and stop lists. Intervals are sorted by start.
    pub fn create(starts: &[f64], stops: &[f64], reference_time_mjd: f64) -> Self {
        let mut intervals: Vec<(f64, f64)> = starts
            .iter()
            .zip(stops.iter())
            .map(|(a, b)| (*a, *b))
            .collect();
        intervals.sort_by(|a, b| a.0.total_cmp(&b.0));
        Self {
            reference_time_mjd,
            intervals,
        }
    }

    pub fn reference_time_mjd(&self) -> f64 {
        self.reference_time_mjd
    }

    pub fn intervals(&self) -> &[(f64, f64)] {
        &self.intervals
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    pub fn len(&self) -> usize {
        self.intervals.len()
    }

    /// Total duration in seconds.
    pub fn time_sum(&self) -> f64 {
        self.intervals.iter().map(|(a, b)| b - a).sum()
    }

    pub fn time_start(&self) -> Option<f64> {
        self.intervals.iter().map(|(a, _)| *a).reduce(f64::min)
    }

    pub fn time_stop(&self) -> Option<f64> {
        self.intervals.iter().map(|(_, b)| *b).reduce(f64::max)
    }

    /// Append the intervals of `other`, converted to this reference time.
    pub fn stack(&mut self, other: &Gti) {
        let shift = (other.reference_time_mjd - self.reference_time_mjd) * SECONDS_PER_DAY;
        self.intervals
            .extend(other.intervals.iter().map(|(a, b)| (a + shift, b + shift)));
        self.intervals.sort_by(|a, b| a.0.total_cmp(&b.0));
    }

    /// Merge overlapping or touching intervals.
    pub fn union(&self) -> Gti {
        let mut merged: Vec<(f64, f64)> = Vec::with_capacity(self.intervals.len());
        let mut sorted = self.intervals.clone();
        sorted.sort_by(|a, b| a.0.total_cmp(&b.0));
        for (start, stop) in sorted {
            match merged.last_mut() {
                Some(last) if start <= last.1 => last.1 = last.1.max(stop),
                _ => merged.push((start, stop)),
            }
        }
        Gti {
            reference_time_mjd: self.reference_time_mjd,
            intervals: merged,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_union_merges_overlaps() {
        let gti = Gti::create(&[0.0, 5.0, 20.0, 10.0], &[10.0, 8.0, 30.0, 12.0], 51910.0);
        let union = gti.union();
        assert_eq!(union.intervals(), &[(0.0, 12.0), (20.0, 30.0)]);
        assert_relative_eq!(union.time_sum(), 22.0);
    }

    #[test]
    fn test_stack_converts_reference() {
        let mut a = Gti::create(&[0.0], &[100.0], 51910.0);
        let b = Gti::create(&[0.0], &[100.0], 51911.0);
        a.stack(&b);
        assert_eq!(a.len(), 2);
        assert_relative_eq!(a.intervals()[1].0, 86400.0);
        assert_relative_eq!(a.time_stop().unwrap(), 86500.0);
    }
}
