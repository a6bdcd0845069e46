//! wyhash-style key hashing.
//!
//! Every key is reduced to a 64-bit hash by one multiply-xor mixer. Integer
//! keys take a two-multiplication fast path; string and byte keys take a
//! small-input path for lengths up to eight bytes and a first-8/last-8 read
//! otherwise. Any other `Hash` key funnels its emitted words and byte runs
//! through the same mixer via [`WyHasher`].
//!
//! The shard router and the concurrent maps share this hasher, so a key is
//! hashed once per operation and routing agrees with map placement.

use std::hash::{BuildHasher, Hasher};

const WYP0: u64 = 0xa076_1d64_78bd_642f;
const WYP1: u64 = 0xe703_7ed1_a0b4_28db;

/// Fold two words through a 128-bit multiply, returning the XOR of the
/// product's halves.
#[inline]
fn mix(a: u64, b: u64) -> u64 {
    let product = u128::from(a) * u128::from(b);
    ((product >> 64) as u64) ^ (product as u64)
}

/// Hash a single 64-bit value.
#[inline]
pub(crate) fn hash_u64(value: u64) -> u64 {
    mix(value ^ WYP0, value ^ WYP1)
}

#[inline]
fn read_u32(bytes: &[u8]) -> u64 {
    u64::from(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
fn read_u64(bytes: &[u8]) -> u64 {
    u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ])
}

/// Hash a byte string.
///
/// Inputs of at most eight bytes are read as two overlapping 4-byte words
/// (or three spread bytes below four); longer inputs read the first and last
/// eight bytes with the length folded into the mix.
#[inline]
pub(crate) fn hash_bytes(bytes: &[u8]) -> u64 {
    let n = bytes.len();
    if n == 0 {
        return 0;
    }

    let (a, b) = if n <= 8 {
        if n >= 4 {
            (read_u32(&bytes[..4]), read_u32(&bytes[n - 4..]))
        } else {
            let a = (u64::from(bytes[0]) << 16)
                | (u64::from(bytes[n >> 1]) << 8)
                | u64::from(bytes[n - 1]);
            (a, 0)
        }
    } else {
        (read_u64(&bytes[..8]), read_u64(&bytes[n - 8..]))
    };

    mix(a ^ WYP0, b ^ (n as u64) ^ WYP1)
}

/// Streaming hasher front-end over the wyhash mixer.
///
/// A lone integer write collapses to the integer fast path and a lone byte
/// run to the string path, so `u64` and `String` keys hash exactly as
/// [`hash_u64`] and [`hash_bytes`] would: the first byte run adopts
/// `hash_bytes` directly, and the `0xff` terminator that `str` hashing
/// appends after its bytes is absorbed instead of mixed. Multi-field keys
/// fold each further write into the running state.
#[derive(Default)]
pub struct WyHasher {
    state: u64,
    written: bool,
    after_bytes: bool,
}

impl Hasher for WyHasher {
    #[inline]
    fn finish(&self) -> u64 {
        self.state
    }

    #[inline]
    fn write(&mut self, bytes: &[u8]) {
        self.state = if self.written {
            mix(self.state ^ hash_bytes(bytes), WYP1)
        } else {
            hash_bytes(bytes)
        };
        self.written = true;
        self.after_bytes = true;
    }

    #[inline]
    fn write_u8(&mut self, n: u8) {
        // str and String hashing append a 0xff terminator to the byte run;
        // absorbing it keeps a string key identical to `hash_bytes`.
        if n == 0xff && self.after_bytes {
            self.after_bytes = false;
            return;
        }
        self.write_u64(u64::from(n));
    }

    #[inline]
    fn write_u16(&mut self, n: u16) {
        self.write_u64(u64::from(n));
    }

    #[inline]
    fn write_u32(&mut self, n: u32) {
        self.write_u64(u64::from(n));
    }

    #[inline]
    fn write_u64(&mut self, n: u64) {
        self.state = hash_u64(self.state ^ n);
        self.written = true;
        self.after_bytes = false;
    }

    #[inline]
    fn write_u128(&mut self, n: u128) {
        self.write_u64(n as u64);
        self.write_u64((n >> 64) as u64);
    }

    #[inline]
    fn write_usize(&mut self, n: usize) {
        self.write_u64(n as u64);
    }

    #[inline]
    fn write_i8(&mut self, n: i8) {
        self.write_u64(n as u64);
    }

    #[inline]
    fn write_i16(&mut self, n: i16) {
        self.write_u64(n as u64);
    }

    #[inline]
    fn write_i32(&mut self, n: i32) {
        self.write_u64(n as u64);
    }

    #[inline]
    fn write_i64(&mut self, n: i64) {
        self.write_u64(n as u64);
    }

    #[inline]
    fn write_i128(&mut self, n: i128) {
        self.write_u128(n as u128);
    }

    #[inline]
    fn write_isize(&mut self, n: isize) {
        self.write_u64(n as u64);
    }
}

/// [`BuildHasher`] producing [`WyHasher`] instances.
///
/// Stateless: the same key always hashes to the same value, which the shard
/// router relies on.
#[derive(Clone, Copy, Default)]
pub struct WyHashBuilder;

impl BuildHasher for WyHashBuilder {
    type Hasher = WyHasher;

    #[inline]
    fn build_hasher(&self) -> WyHasher {
        WyHasher::default()
    }
}

/// Hash an arbitrary key through the wyhash front-end.
#[inline]
pub(crate) fn hash_key<K: std::hash::Hash + ?Sized>(key: &K) -> u64 {
    let mut hasher = WyHasher::default();
    key.hash(&mut hasher);
    hasher.finish()
}
