// Copyright (c) 2025 RustySync Contributors
//
// Skip-list level randomizer
//
// Generates node heights with a geometric distribution: the probability of
// height h is half the probability of height h-1. Each thread draws from
// its own xorshift stream so the generator is safe to call from arbitrary
// threads without coordination.

use std::cell::Cell;

thread_local! {
    static URAND_STATE: Cell<u64> = Cell::new(rand::random::<u64>() | 1);
}

/// Uniform pseudo-random 32-bit sample from a thread-local xorshift stream.
///
/// The stream is seeded once per thread from the process RNG, so two
/// threads never share a sequence.
pub fn urand() -> u32 {
    URAND_STATE.with(|state| {
        let mut x = state.get();
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        state.set(x);
        (x >> 32) as u32
    })
}

/// Pick a random level in `[1, max_height]` where each level is half as
/// likely as the one below it.
///
/// The position of the lowest set bit in a uniform sample has exactly the
/// required distribution. Forcing the top bit avoids special-casing an
/// all-zero sample; the top bit can never land in `[0, max_height)` for
/// any supported height, so the distribution is undisturbed. Positions at
/// or above `max_height` wrap back with a modulo, which also preserves the
/// shape of the distribution.
pub fn random_level(max_height: usize) -> usize {
    debug_assert!(max_height >= 1 && max_height < u32::BITS as usize);

    let sample = urand() | (1 << (u32::BITS - 1));
    let mut first_one = sample.trailing_zeros() as usize;
    if first_one >= max_height {
        first_one %= max_height;
    }
    first_one + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urand_streams_differ() {
        let here: Vec<u32> = (0..8).map(|_| urand()).collect();
        let there = std::thread::spawn(|| (0..8).map(|_| urand()).collect::<Vec<u32>>())
            .join()
            .unwrap();
        assert_ne!(here, there);
    }

    #[test]
    fn test_level_bounds() {
        for _ in 0..10_000 {
            let level = random_level(10);
            assert!((1..=10).contains(&level));
        }
        for _ in 0..1_000 {
            assert_eq!(random_level(1), 1);
        }
    }

    // The levels for skip-list node heights must have the proper
    // distribution between 1..=max_height, where the probability of
    // height h is half that of height h-1.
    #[test]
    fn test_level_distribution() {
        const SAMPLES: usize = 1 << 20;
        const DEGREES: usize = 10;
        // p = 1/2000 for 10 degrees of freedom
        const CRITICAL_CHI: f64 = 25.19;

        let mut bins = [0u64; DEGREES];
        for _ in 0..SAMPLES {
            let level = random_level(DEGREES);
            bins[level - 1] += 1;
        }

        // expected counts follow (1/2, 1/4, 1/8, ...) normalized to SAMPLES
        let mut expected = [0f64; DEGREES];
        expected[0] = (1u64 << DEGREES) as f64;
        for level in 1..DEGREES {
            expected[level] = expected[level - 1] / 2.0;
        }
        let total: f64 = expected.iter().sum();
        for e in expected.iter_mut() {
            *e *= SAMPLES as f64 / total;
        }

        let chi: f64 = bins
            .iter()
            .zip(expected.iter())
            .map(|(&b, &e)| {
                let d = b as f64 - e;
                d * d / e
            })
            .sum();
        assert!(chi < CRITICAL_CHI, "chi-squared {chi} over critical value");
    }
}
