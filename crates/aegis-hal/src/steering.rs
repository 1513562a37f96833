//! Simulated steering-angle sensor.
//!
//! [`SteeringWalk`] is a bounded random walk over the raw 8-bit reading
//! range. It starts at the centre value and moves by at most `max_step` per
//! reading, clamped to `[0, 255]`. Seeding makes a run reproducible.

use aegis_types::RAW_CENTER;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub struct SteeringWalk {
    rng: StdRng,
    value: u8,
    max_step: u8,
}

impl SteeringWalk {
    /// Walk seeded from OS entropy.
    pub fn new(max_step: u8) -> Self {
        Self::from_rng(StdRng::from_entropy(), max_step)
    }

    /// Deterministic walk for tests and replays.
    pub fn seeded(seed: u64, max_step: u8) -> Self {
        Self::from_rng(StdRng::seed_from_u64(seed), max_step)
    }

    fn from_rng(rng: StdRng, max_step: u8) -> Self {
        Self {
            rng,
            value: RAW_CENTER,
            max_step,
        }
    }

    /// Current reading without advancing.
    pub fn value(&self) -> u8 {
        self.value
    }

    /// Advance one step and return the new reading.
    pub fn next_reading(&mut self) -> u8 {
        let step = i16::from(self.max_step);
        let delta = if step == 0 {
            0
        } else {
            self.rng.gen_range(-step..=step)
        };
        let next = (i16::from(self.value) + delta).clamp(0, i16::from(u8::MAX));
        // Clamped to the u8 range above.
        self.value = next as u8;
        self.value
    }
}

impl Iterator for SteeringWalk {
    type Item = u8;

    fn next(&mut self) -> Option<u8> {
        Some(self.next_reading())
    }
}
