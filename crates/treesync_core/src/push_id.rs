//! Chronologically ordered child keys for appended data.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const PUSH_CHARS: &[u8; 64] = b"-0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ_abcdefghijklmnopqrstuvwxyz";
const TIME_CHARS: usize = 8;
const RANDOM_CHARS: usize = 12;

/// Generates 20-character keys that sort in creation order.
///
/// The first 8 characters encode the timestamp. The remaining 12 are random,
/// and are incremented instead of re-drawn when two keys share a timestamp,
/// so keys generated in the same millisecond still sort correctly.
#[derive(Debug)]
pub struct PushIdGenerator {
    rng: StdRng,
    last_time: Option<i64>,
    last_random: [u8; RANDOM_CHARS],
}

impl PushIdGenerator {
    /// A generator seeded from the OS.
    pub fn new() -> Self {
        Self::from_rng(StdRng::from_entropy())
    }

    /// A deterministic generator.
    pub fn with_seed(seed: u64) -> Self {
        Self::from_rng(StdRng::seed_from_u64(seed))
    }

    fn from_rng(rng: StdRng) -> Self {
        Self {
            rng,
            last_time: None,
            last_random: [0; RANDOM_CHARS],
        }
    }

    /// Generates a key for the time `now_ms`.
    pub fn next_id(&mut self, now_ms: i64) -> String {
        let mut id = String::with_capacity(TIME_CHARS + RANDOM_CHARS);

        let mut time_chars = [0u8; TIME_CHARS];
        let mut remaining = now_ms.max(0);
        for slot in time_chars.iter_mut().rev() {
            *slot = PUSH_CHARS[(remaining % 64) as usize];
            remaining /= 64;
        }
        debug_assert_eq!(remaining, 0, "timestamp does not fit in a push id");
        id.extend(time_chars.iter().map(|&c| c as char));

        if self.last_time == Some(now_ms) {
            for digit in self.last_random.iter_mut().rev() {
                if *digit == 63 {
                    *digit = 0;
                } else {
                    *digit += 1;
                    break;
                }
            }
        } else {
            for digit in &mut self.last_random {
                *digit = self.rng.gen_range(0..64);
            }
        }
        self.last_time = Some(now_ms);
        id.extend(self.last_random.iter().map(|&d| PUSH_CHARS[d as usize] as char));
        id
    }
}

impl Default for PushIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
