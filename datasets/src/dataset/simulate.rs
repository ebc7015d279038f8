//! Simulated counts.

use log::debug;
use rand::rngs::StdRng;
use rand::{thread_rng, RngCore, SeedableRng};
use rand_distr::{Distribution, Poisson};
use skymaps::Map;

use super::{Background, MapDataset};
use crate::error::DatasetError;

/// Poisson realisation of `expected`; non-finite and non-positive means give zero.
fn poisson_map(expected: &Map, rng: &mut StdRng) -> Map {
    let mut counts = expected.clone();
    for value in counts.data_mut().iter_mut() {
        let mean = *value;
        *value = match Poisson::new(mean) {
            Ok(dist) if mean.is_finite() => dist.sample(rng),
            _ => 0.0,
        };
    }
    counts
}

impl MapDataset {
    /// Replace the counts with a Poisson realisation of the prediction.
    ///
    /// On/off datasets draw ON counts from the signal plus the current
    /// background prediction and OFF counts from `npred_background / alpha`.
    /// A random seed is drawn when `rng_seed` is `None`.
    pub fn fake(&mut self, rng_seed: Option<u64>) -> Result<(), DatasetError> {
        match self.background {
            Background::Cash(_) => {
                let seed = rng_seed.unwrap_or(thread_rng().next_u64());
                let mut rng = StdRng::seed_from_u64(seed);
                let counts = poisson_map(&self.npred()?, &mut rng);
                debug!("Simulated {} counts for dataset {}", counts.sum(), self.name);
                self.set_counts(Some(counts));
                Ok(())
            }
            Background::OnOff(_) => {
                let npred_background = self.npred_background()?;
                self.fake_with_background(&npred_background, rng_seed)
            }
        }
    }

    /// On/off simulation for a given expected background in the ON region.
    pub fn fake_with_background(
        &mut self,
        npred_background: &Map,
        rng_seed: Option<u64>,
    ) -> Result<(), DatasetError> {
        let seed = rng_seed.unwrap_or(thread_rng().next_u64());
        let mut rng = StdRng::seed_from_u64(seed);

        let signal = poisson_map(&self.npred_signal(None, true)?, &mut rng);
        let background = poisson_map(npred_background, &mut rng);
        let counts = signal.checked_add(&background)?;

        let mut npred_off = npred_background.checked_div(&self.alpha()?)?;
        npred_off.nan_to_num();
        let counts_off = poisson_map(&npred_off, &mut rng);

        debug!(
            "Simulated {} ON and {} OFF counts for dataset {}",
            counts.sum(),
            counts_off.sum(),
            self.name
        );
        self.set_counts(Some(counts));
        self.set_counts_off(Some(counts_off))
    }

    /// Copy of the dataset whose counts are the predicted counts.
    ///
    /// Evaluators are copied along, so cached model predictions carry over.
    pub fn to_asimov_dataset(&self) -> Result<MapDataset, DatasetError> {
        let mut npred = self.npred()?;
        npred.nan_to_num();
        let mut asimov = self.clone();
        asimov.counts.set(Some(npred));
        Ok(asimov)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use skymaps::{Geom, MapAxis, SkyCoord};

    fn geom() -> Geom {
        let energy = MapAxis::from_energy_bounds(1.0, 10.0, 2, "TeV", "energy").unwrap();
        Geom::create(SkyCoord::icrs(0.0, 0.0), 0.1, (30, 30), vec![energy]).unwrap()
    }

    fn cash_dataset() -> MapDataset {
        MapDataset::builder()
            .name("fake")
            .counts(Some(Map::from_geom(geom(), "")))
            .background(Some(Map::from_elem(geom(), 5.0, "")))
            .build()
            .unwrap()
    }

    #[test]
    fn test_fake_is_reproducible() {
        let mut a = cash_dataset();
        let mut b = cash_dataset();
        a.fake(Some(42)).unwrap();
        b.fake(Some(42)).unwrap();
        let counts = a.counts().unwrap().unwrap();
        assert_eq!(counts, b.counts().unwrap().unwrap());
        assert!(counts.data().iter().all(|v| *v >= 0.0 && v.fract() == 0.0));

        let mean = counts.sum() / counts.data().len() as f64;
        assert_relative_eq!(mean, 5.0, epsilon = 0.3);
    }

    #[test]
    fn test_fake_on_off() {
        let mut dataset = MapDataset::builder()
            .name("fake-on-off")
            .counts(Some(Map::from_geom(geom(), "")))
            .on_off(
                Some(Map::from_geom(geom(), "")),
                Some(Map::from_elem(geom(), 1.0, "")),
                Some(Map::from_elem(geom(), 2.0, "")),
            )
            .build()
            .unwrap();
        let expected = Map::from_elem(geom(), 3.0, "");
        dataset.fake_with_background(&expected, Some(7)).unwrap();

        let n = 1800.0;
        let counts = dataset.counts().unwrap().unwrap().sum() / n;
        let counts_off = dataset.counts_off().unwrap().unwrap().sum() / n;
        assert_relative_eq!(counts, 3.0, epsilon = 0.3);
        assert_relative_eq!(counts_off, 6.0, epsilon = 0.5);
    }

    #[test]
    fn test_asimov() {
        let dataset = cash_dataset();
        let asimov = dataset.to_asimov_dataset().unwrap();
        assert_eq!(asimov.name(), dataset.name());
        assert_relative_eq!(asimov.counts().unwrap().unwrap().data()[[1, 4, 4]], 5.0);
        assert_relative_eq!(dataset.counts().unwrap().unwrap().sum(), 0.0);
    }
}
