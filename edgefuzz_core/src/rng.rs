use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;

/// The random source behind every stochastic decision the fuzzer makes.
///
/// All mutation choices, entry selections and byte values are drawn from one
/// `FuzzRng` owned by the [`Fuzzer`](crate::fuzzer::Fuzzer) and threaded
/// explicitly into the mutator and scheduler. Two instances built from the same
/// seed produce identical sequences.
#[derive(Debug, Clone)]
pub struct FuzzRng {
    seed: u64,
    inner: ChaCha8Rng,
}

impl FuzzRng {
    /// Creates a generator from an explicit seed.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            seed,
            inner: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    /// Creates a generator seeded from the operating system's entropy source.
    ///
    /// The drawn seed is kept so a session can be replayed with [`FuzzRng::with_seed`].
    pub fn from_entropy() -> Self {
        let seed: u64 = rand::rng().random();
        Self::with_seed(seed)
    }

    /// The seed this generator was created from.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Returns a uniformly distributed integer in `[0, n)`.
    ///
    /// # Panics
    /// Panics if `n == 0`; an empty range is a caller contract violation.
    pub fn below(&mut self, n: usize) -> usize {
        assert!(n > 0, "FuzzRng::below called with an empty range");
        self.inner.random_range(0..n)
    }

    /// Returns a uniformly distributed integer in `[low, high]`.
    ///
    /// # Panics
    /// Panics if `low > high`.
    pub fn between(&mut self, low: usize, high: usize) -> usize {
        assert!(low <= high, "FuzzRng::between called with low > high");
        self.inner.random_range(low..=high)
    }

    /// Returns `true` with probability `p`, clamped to `[0, 1]`.
    pub fn chance(&mut self, p: f64) -> bool {
        self.inner.random_bool(p.clamp(0.0, 1.0))
    }

    /// Returns a uniformly random byte.
    pub fn byte(&mut self) -> u8 {
        self.inner.random()
    }

    /// Returns a uniformly chosen element of `items`.
    ///
    /// # Panics
    /// Panics if `items` is empty.
    pub fn choose<'a, T>(&mut self, items: &'a [T]) -> &'a T {
        &items[self.below(items.len())]
    }

    /// Shuffles `items` in place (Fisher-Yates).
    pub fn shuffle<T>(&mut self, items: &mut [T]) {
        for i in (1..items.len()).rev() {
            let j = self.below(i + 1);
            items.swap(i, j);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_sequence() {
        let mut a = FuzzRng::with_seed(7);
        let mut b = FuzzRng::with_seed(7);
        let seq_a: Vec<usize> = (0..64).map(|_| a.below(1000)).collect();
        let seq_b: Vec<usize> = (0..64).map(|_| b.below(1000)).collect();
        assert_eq!(seq_a, seq_b);
    }

    #[test]
    fn different_seeds_diverge() {
        let mut a = FuzzRng::with_seed(1);
        let mut b = FuzzRng::with_seed(2);
        let seq_a: Vec<usize> = (0..32).map(|_| a.below(1 << 20)).collect();
        let seq_b: Vec<usize> = (0..32).map(|_| b.below(1 << 20)).collect();
        assert_ne!(seq_a, seq_b);
    }

    #[test]
    fn below_stays_in_range() {
        let mut rng = FuzzRng::with_seed(3);
        for n in 1..50 {
            for _ in 0..20 {
                assert!(rng.below(n) < n);
            }
        }
        for _ in 0..100 {
            let v = rng.between(3, 5);
            assert!((3..=5).contains(&v));
        }
    }

    #[test]
    #[should_panic(expected = "empty range")]
    fn below_zero_panics() {
        let mut rng = FuzzRng::with_seed(0);
        rng.below(0);
    }

    #[test]
    fn chance_extremes() {
        let mut rng = FuzzRng::with_seed(4);
        assert!((0..100).all(|_| rng.chance(1.0)));
        assert!((0..100).all(|_| !rng.chance(0.0)));
    }

    #[test]
    fn choose_visits_every_element() {
        let mut rng = FuzzRng::with_seed(5);
        let items = [10, 20, 30];
        let mut seen = std::collections::HashSet::new();
        for _ in 0..100 {
            seen.insert(*rng.choose(&items));
        }
        assert_eq!(seen.len(), items.len());
    }

    #[test]
    fn entropy_seed_is_replayable() {
        let mut original = FuzzRng::from_entropy();
        let mut replay = FuzzRng::with_seed(original.seed());
        assert_eq!(original.below(usize::MAX), replay.below(usize::MAX));
    }
}
