//! Chronologically ordered push keys
//!
//! 20 characters: 8 encode the millisecond timestamp, 12 are random. Within
//! one millisecond (or if the clock steps backwards) the random part is
//! incremented instead of redrawn, so keys from one generator always sort in
//! the order they were made.

use std::sync::Mutex;

use chrono::Utc;
use rand::Rng;

/// Key alphabet, in ASCII order so lexicographic order matches numeric order.
const PUSH_CHARS: &[u8; 64] = b"-0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ_abcdefghijklmnopqrstuvwxyz";

const TIME_CHARS: usize = 8;
const RANDOM_CHARS: usize = 12;

struct GeneratorState {
    last_ms: i64,
    last_random: [u8; RANDOM_CHARS],
}

pub struct PushIdGenerator {
    state: Mutex<GeneratorState>,
}

impl PushIdGenerator {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GeneratorState {
                last_ms: i64::MIN,
                last_random: [0; RANDOM_CHARS],
            }),
        }
    }

    pub fn next_id(&self) -> String {
        self.next_id_at(Utc::now().timestamp_millis())
    }

    pub(crate) fn next_id_at(&self, now_ms: i64) -> String {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let ms = if now_ms <= state.last_ms {
            increment(&mut state.last_random);
            state.last_ms
        } else {
            let mut rng = rand::thread_rng();
            for slot in state.last_random.iter_mut() {
                *slot = rng.gen_range(0..64);
            }
            state.last_ms = now_ms;
            now_ms
        };

        let mut key = [0u8; TIME_CHARS + RANDOM_CHARS];
        let mut remaining = ms.max(0);
        for i in (0..TIME_CHARS).rev() {
            key[i] = PUSH_CHARS[(remaining % 64) as usize];
            remaining /= 64;
        }
        for (i, r) in state.last_random.iter().enumerate() {
            key[TIME_CHARS + i] = PUSH_CHARS[*r as usize];
        }

        // Every byte comes from the ASCII alphabet above.
        key.iter().map(|b| *b as char).collect()
    }
}

impl Default for PushIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

fn increment(random: &mut [u8; RANDOM_CHARS]) {
    for slot in random.iter_mut().rev() {
        if *slot == 63 {
            *slot = 0;
        } else {
            *slot += 1;
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_key_shape() {
        let generator = PushIdGenerator::new();
        let key = generator.next_id();
        assert_eq!(key.len(), 20);
        assert!(key.bytes().all(|b| PUSH_CHARS.contains(&b)));
    }

    #[test]
    fn test_same_millisecond_keys_increase() {
        let generator = PushIdGenerator::new();
        let keys: Vec<String> = (0..500).map(|_| generator.next_id_at(1_700_000_000_000)).collect();
        assert!(keys.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(keys.iter().collect::<HashSet<_>>().len(), keys.len());
    }

    #[test]
    fn test_later_time_sorts_after() {
        let generator = PushIdGenerator::new();
        let early = generator.next_id_at(1_000);
        let late = generator.next_id_at(2_000);
        assert!(early < late);
        assert_eq!(&early[..8], "------Ec");
    }

    #[test]
    fn test_clock_step_back_stays_monotonic() {
        let generator = PushIdGenerator::new();
        let a = generator.next_id_at(5_000);
        let b = generator.next_id_at(4_000);
        assert!(a < b);
    }

    #[test]
    fn test_concurrent_generation_is_unique() {
        let generator = std::sync::Arc::new(PushIdGenerator::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let g = std::sync::Arc::clone(&generator);
                std::thread::spawn(move || (0..250).map(|_| g.next_id()).collect::<Vec<_>>())
            })
            .collect();
        let all: Vec<String> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        assert_eq!(all.iter().collect::<HashSet<_>>().len(), 1000);
    }
}
