//! Poisson likelihood statistics.
//!
//! `cash` is used when the background is known; `wstat` profiles the
//! unknown background using counts from an OFF region scaled by `alpha`.
//! All statistics are `-2 ln L` up to model independent terms.

use ndarray::{Array1, Zip};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Predicted counts below this value are replaced by it before taking logs.
pub const TRUNCATION_VALUE: f64 = 1e-25;

/// Likelihood used by a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatType {
    Cash,
    WStat,
}

impl fmt::Display for StatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatType::Cash => write!(f, "cash"),
            StatType::WStat => write!(f, "wstat"),
        }
    }
}

/// Cash statistic for one bin.
pub fn cash(n_on: f64, mu_on: f64) -> f64 {
    let mu = if mu_on <= TRUNCATION_VALUE {
        TRUNCATION_VALUE
    } else {
        mu_on
    };
    2.0 * (mu - n_on * mu.ln())
}

/// Summed Cash statistic over paired slices.
pub fn cash_sum<'a>(
    n_on: impl IntoIterator<Item = &'a f64>,
    mu_on: impl IntoIterator<Item = &'a f64>,
) -> f64 {
    n_on.into_iter()
        .zip(mu_on)
        .map(|(n, mu)| cash(*n, *mu))
        .sum()
}

/// Background estimate maximizing the WStat likelihood for given signal.
pub fn get_wstat_mu_bkg(n_on: f64, n_off: f64, alpha: f64, mu_sig: f64) -> f64 {
    let c = alpha * (n_on + n_off) - (1.0 + alpha) * mu_sig;
    let d = (c * c + 4.0 * alpha * (alpha + 1.0) * n_off * mu_sig).sqrt();
    (c + d) / (2.0 * alpha * (alpha + 1.0))
}

/// Terms that make the WStat statistic zero for the saturated model.
pub fn get_wstat_gof_terms(n_on: f64, n_off: f64) -> f64 {
    let term = |n: f64| if n == 0.0 { 0.0 } else { n * (1.0 - n.ln()) };
    -2.0 * (term(n_on) + term(n_off))
}

/// WStat statistic for one bin.
///
/// `mu_bkg` defaults to the profile estimate from [`get_wstat_mu_bkg`].
pub fn wstat(
    n_on: f64,
    n_off: f64,
    alpha: f64,
    mu_sig: f64,
    mu_bkg: Option<f64>,
    extra_terms: bool,
) -> f64 {
    let mu_bkg = mu_bkg.unwrap_or_else(|| get_wstat_mu_bkg(n_on, n_off, alpha, mu_sig));
    let term1 = mu_sig + (1.0 + alpha) * mu_bkg;
    let term2 = if n_on == 0.0 {
        0.0
    } else {
        -n_on * (mu_sig + alpha * mu_bkg).ln()
    };
    let term3 = if n_off == 0.0 {
        0.0
    } else {
        -n_off * mu_bkg.ln()
    };
    let mut stat = 2.0 * (term1 + term2 + term3);
    if extra_terms {
        stat += get_wstat_gof_terms(n_on, n_off);
    }
    stat
}

fn select(values: &Array1<f64>, mask: Option<&[bool]>) -> f64 {
    match mask {
        Some(mask) => values
            .iter()
            .zip(mask.iter())
            .filter(|(_, keep)| **keep)
            .map(|(v, _)| *v)
            .sum(),
        None => values.sum(),
    }
}

fn signed_sqrt_ts(ts: &Array1<f64>, n_sig: &Array1<f64>) -> Array1<f64> {
    let mut out = Array1::zeros(ts.len());
    Zip::from(&mut out)
        .and(ts)
        .and(n_sig)
        .for_each(|o, &t, &s| *o = s.signum() * t.max(0.0).sqrt());
    out
}

/// Counts statistic with known background.
#[derive(Debug, Clone, PartialEq)]
pub struct CashCountsStatistic {
    pub n_on: Array1<f64>,
    pub mu_bkg: Array1<f64>,
}

impl CashCountsStatistic {
    pub fn new(n_on: Array1<f64>, mu_bkg: Array1<f64>) -> Self {
        Self { n_on, mu_bkg }
    }

    pub fn n_bkg(&self) -> Array1<f64> {
        self.mu_bkg.clone()
    }

    /// Excess `n_on - mu_bkg`.
    pub fn n_sig(&self) -> Array1<f64> {
        &self.n_on - &self.mu_bkg
    }

    pub fn error(&self) -> Array1<f64> {
        self.n_on.mapv(f64::sqrt)
    }

    pub fn stat_null(&self) -> Array1<f64> {
        Zip::from(&self.n_on)
            .and(&self.mu_bkg)
            .map_collect(|n, mu| cash(*n, *mu))
    }

    pub fn stat_max(&self) -> Array1<f64> {
        self.n_on.mapv(|n| cash(n, n))
    }

    pub fn ts(&self) -> Array1<f64> {
        self.stat_null() - self.stat_max()
    }

    pub fn sqrt_ts(&self) -> Array1<f64> {
        signed_sqrt_ts(&self.ts(), &self.n_sig())
    }

    /// Single-bin statistic summed over the bins where `mask` is true.
    pub fn sum(&self, mask: Option<&[bool]>) -> Self {
        Self {
            n_on: Array1::from_elem(1, select(&self.n_on, mask)),
            mu_bkg: Array1::from_elem(1, select(&self.mu_bkg, mask)),
        }
    }
}

/// Counts statistic with background measured in an OFF region.
#[derive(Debug, Clone, PartialEq)]
pub struct WStatCountsStatistic {
    pub n_on: Array1<f64>,
    pub n_off: Array1<f64>,
    pub alpha: Array1<f64>,
    pub mu_sig: Array1<f64>,
}

impl WStatCountsStatistic {
    pub fn new(
        n_on: Array1<f64>,
        n_off: Array1<f64>,
        alpha: Array1<f64>,
        mu_sig: Option<Array1<f64>>,
    ) -> Self {
        let mu_sig = mu_sig.unwrap_or_else(|| Array1::zeros(n_on.len()));
        Self {
            n_on,
            n_off,
            alpha,
            mu_sig,
        }
    }

    /// Background in the ON region, `alpha * n_off`.
    pub fn n_bkg(&self) -> Array1<f64> {
        &self.alpha * &self.n_off
    }

    pub fn n_sig(&self) -> Array1<f64> {
        &self.n_on - &self.n_bkg() - &self.mu_sig
    }

    pub fn error(&self) -> Array1<f64> {
        Zip::from(&self.n_on)
            .and(&self.n_off)
            .and(&self.alpha)
            .map_collect(|n_on, n_off, a| (n_on + a * a * n_off).sqrt())
    }

    fn wstat_with(&self, mu_sig: &Array1<f64>) -> Array1<f64> {
        let mut out = Array1::zeros(self.n_on.len());
        Zip::from(&mut out)
            .and(&self.n_on)
            .and(&self.n_off)
            .and(&self.alpha)
            .and(mu_sig)
            .for_each(|o, &n_on, &n_off, &alpha, &mu| {
                *o = wstat(n_on, n_off, alpha, mu, None, true);
            });
        out
    }

    pub fn stat_null(&self) -> Array1<f64> {
        self.wstat_with(&self.mu_sig)
    }

    pub fn stat_max(&self) -> Array1<f64> {
        self.wstat_with(&(&self.n_sig() + &self.mu_sig))
    }

    pub fn ts(&self) -> Array1<f64> {
        self.stat_null() - self.stat_max()
    }

    pub fn sqrt_ts(&self) -> Array1<f64> {
        signed_sqrt_ts(&self.ts(), &self.n_sig())
    }

    /// Single-bin statistic summed over the bins where `mask` is true.
    ///
    /// The summed `alpha` is the OFF-count weighted mean.
    pub fn sum(&self, mask: Option<&[bool]>) -> Self {
        let n_off = select(&self.n_off, mask);
        let n_bkg = select(&self.n_bkg(), mask);
        let alpha = n_bkg / n_off;
        Self {
            n_on: Array1::from_elem(1, select(&self.n_on, mask)),
            n_off: Array1::from_elem(1, n_off),
            alpha: Array1::from_elem(1, if alpha.is_finite() { alpha } else { 0.0 }),
            mu_sig: Array1::from_elem(1, select(&self.mu_sig, mask)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn test_cash_values() {
        assert_relative_eq!(cash(2.0, 2.0), 2.0 * (2.0 - 2.0 * 2f64.ln()));
        assert_relative_eq!(cash(0.0, 3.0), 6.0);
        let truncated = cash(1.0, 0.0);
        assert_relative_eq!(truncated, 2.0 * (1e-25 - 1e-25f64.ln()));
    }

    #[test]
    fn test_cash_sum() {
        let n = [1.0, 2.0];
        let mu = [1.0, 2.0];
        assert_relative_eq!(cash_sum(&n, &mu), cash(1.0, 1.0) + cash(2.0, 2.0));
    }

    #[test]
    fn test_wstat_mu_bkg_no_signal() {
        // Without signal the profile background is (n_on + n_off) / (1 + alpha)
        let mu = get_wstat_mu_bkg(10.0, 30.0, 0.5, 0.0);
        assert_relative_eq!(mu, 40.0 / 1.5, epsilon = 1e-12);
    }

    #[test]
    fn test_wstat_saturated_is_zero() {
        let (n_on, n_off, alpha) = (13.0, 20.0, 0.2);
        let mu_sig = n_on - alpha * n_off;
        let stat = wstat(n_on, n_off, alpha, mu_sig, None, true);
        assert_relative_eq!(stat, 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_wstat_zero_counts() {
        let stat = wstat(0.0, 0.0, 0.5, 1.0, None, true);
        assert!(stat.is_finite());
        assert_relative_eq!(stat, 2.0, epsilon = 1e-12);
    }

    #[test]
    fn test_cash_counts_statistic() {
        let stat = CashCountsStatistic::new(array![5.0, 10.0], array![2.0, 4.0]);
        assert_eq!(stat.n_sig(), array![3.0, 6.0]);
        let ts = stat.ts();
        assert!(ts.iter().all(|t| *t > 0.0));
        let summed = stat.sum(Some(&[true, false]));
        assert_eq!(summed.n_on[0], 5.0);
        assert_relative_eq!(summed.sqrt_ts()[0], stat.sqrt_ts()[0]);
    }

    #[test]
    fn test_wstat_counts_statistic() {
        let stat = WStatCountsStatistic::new(
            array![10.0, 4.0],
            array![20.0, 40.0],
            array![0.1, 0.2],
            None,
        );
        assert_eq!(stat.n_bkg(), array![2.0, 8.0]);
        assert_eq!(stat.n_sig(), array![8.0, -4.0]);
        let sqrt_ts = stat.sqrt_ts();
        assert!(sqrt_ts[0] > 0.0 && sqrt_ts[1] < 0.0);

        let summed = stat.sum(None);
        assert_relative_eq!(summed.alpha[0], 10.0 / 60.0);
        assert_relative_eq!(summed.n_bkg()[0], 10.0);
    }
}
