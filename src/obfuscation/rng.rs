//! Per-thread, non-cryptographic RNG for dummy padding lengths and header
//! randomization. Not security-critical: the obfuscation layer provides no
//! authenticity guarantee regardless of RNG quality.

use std::cell::Cell;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Instant;

thread_local! {
    static RNG_STATE: Cell<u32> = Cell::new(seed());
}

fn seed() -> u32 {
    let mut hasher = DefaultHasher::new();
    Instant::now().hash(&mut hasher);
    std::thread::current().id().hash(&mut hasher);
    let mixed = hasher.finish() as u32;
    if mixed == 0 {
        1
    } else {
        mixed
    }
}

/// xorshift32, per thread.
fn next_u32() -> u32 {
    RNG_STATE.with(|cell| {
        let mut x = cell.get();
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        cell.set(x);
        x
    })
}

/// Uniform value in `1..=255`, as used for the header randomization byte.
pub fn rand_byte_nonzero() -> u8 {
    (next_u32() % 255) as u8 + 1
}

/// Uniform value in `0..bound` (exclusive). Returns 0 if `bound == 0`.
pub fn rand_below(bound: u16) -> u16 {
    if bound == 0 {
        0
    } else {
        (next_u32() % bound as u32) as u16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rand_byte_nonzero_is_in_range() {
        for _ in 0..1000 {
            let b = rand_byte_nonzero();
            assert!(b >= 1);
        }
    }

    #[test]
    fn rand_below_respects_bound() {
        for _ in 0..1000 {
            assert!(rand_below(10) < 10);
        }
        assert_eq!(rand_below(0), 0);
    }
}
