//! Simulated interior temperature sensor.

use rand::{Rng, SeedableRng, rngs::StdRng};

/// Adds seeded gaussian noise to the simulated interior temperature.
///
/// A standard deviation of zero reports the true temperature unchanged and
/// never draws from the generator.
#[derive(Debug, Clone)]
pub struct SensorNoise {
    rng: StdRng,
    std_dev_c: f64,
}

impl SensorNoise {
    /// Creates a sensor with noise of `std_dev_c` (°C), seeded for reproducibility.
    pub fn new(std_dev_c: f64, seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            std_dev_c: if std_dev_c.is_finite() { std_dev_c.max(0.0) } else { 0.0 },
        }
    }

    /// Noise-free sensor.
    pub fn exact() -> Self {
        Self::new(0.0, 0)
    }

    /// Reading for a true temperature of `true_c`.
    pub fn measure(&mut self, true_c: f64) -> f64 {
        true_c + gaussian_noise(&mut self.rng, self.std_dev_c)
    }
}

/// Box-Muller sample with mean 0 and standard deviation `std_dev`.
fn gaussian_noise(rng: &mut StdRng, std_dev: f64) -> f64 {
    if std_dev <= 0.0 {
        return 0.0;
    }
    let u1: f64 = rng.random::<f64>().clamp(1e-12, 1.0);
    let u2: f64 = rng.random::<f64>();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos() * std_dev
}
