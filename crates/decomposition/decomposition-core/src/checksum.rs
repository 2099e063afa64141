//! 64 bit state checksums
//!
//! Every persisted piece of state folds its fields into a running seed.
//! Two states with equal checksums are treated as equal; there is no
//! other equality on the aggregate.

/// Fold `value` into `seed`.
pub fn combine(seed: u64, value: u64) -> u64 {
    let mut z = seed
        .rotate_left(5)
        .wrapping_add(value)
        .wrapping_add(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

/// Types which contribute to a state checksum
pub trait Checksum {
    fn checksum(&self, seed: u64) -> u64;
}

impl Checksum for f64 {
    fn checksum(&self, seed: u64) -> u64 {
        // Treat -0.0 and 0.0 alike.
        let value = if *self == 0.0 { 0.0f64 } else { *self };
        combine(seed, value.to_bits())
    }
}

impl Checksum for i64 {
    fn checksum(&self, seed: u64) -> u64 {
        combine(seed, *self as u64)
    }
}

impl Checksum for u64 {
    fn checksum(&self, seed: u64) -> u64 {
        combine(seed, *self)
    }
}

impl Checksum for u32 {
    fn checksum(&self, seed: u64) -> u64 {
        combine(seed, u64::from(*self))
    }
}

impl Checksum for usize {
    fn checksum(&self, seed: u64) -> u64 {
        combine(seed, *self as u64)
    }
}

impl Checksum for bool {
    fn checksum(&self, seed: u64) -> u64 {
        combine(seed, u64::from(*self))
    }
}

impl Checksum for str {
    fn checksum(&self, seed: u64) -> u64 {
        self.bytes()
            .fold(combine(seed, self.len() as u64), |seed, byte| {
                combine(seed, u64::from(byte))
            })
    }
}

impl Checksum for String {
    fn checksum(&self, seed: u64) -> u64 {
        self.as_str().checksum(seed)
    }
}

impl<T: Checksum> Checksum for [T] {
    fn checksum(&self, seed: u64) -> u64 {
        self.iter()
            .fold(combine(seed, self.len() as u64), |seed, item| item.checksum(seed))
    }
}

impl<T: Checksum> Checksum for Vec<T> {
    fn checksum(&self, seed: u64) -> u64 {
        self.as_slice().checksum(seed)
    }
}

impl<T: Checksum> Checksum for Option<T> {
    fn checksum(&self, seed: u64) -> u64 {
        match self {
            Some(value) => value.checksum(combine(seed, 1)),
            None => combine(seed, 0),
        }
    }
}

impl<A: Checksum, B: Checksum> Checksum for (A, B) {
    fn checksum(&self, seed: u64) -> u64 {
        self.1.checksum(self.0.checksum(seed))
    }
}
