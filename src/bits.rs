//! # Fixed-Width Identifiers
//!
//! [`Bitmap`] is the single identifier type of the DHT. Node ids and blob
//! hashes share one keyspace, so a blob is stored on the nodes whose ids are
//! closest to its hash.
//!
//! ## Algebra
//!
//! | Operation | Meaning |
//! |-----------|---------|
//! | `a ^ b` | Kademlia XOR distance |
//! | `a & b`, `a \| b`, `!a` | bytewise boolean combination |
//! | `a + b`, `a - b` | unsigned big-endian arithmetic (panics on overflow/underflow) |
//! | `a.cmp(&b)` | lexicographic byte order == big-endian integer order |
//! | `prefix_len()` | leading zero bits, selects the routing bucket |
//!
//! ## Invariants
//!
//! - The width is fixed at [`NODE_ID_LENGTH`] bytes and never varies at runtime.
//! - `a ^ a` is all zeros and `(a ^ b) ^ b == a`.
//! - Values are immutable; every operation returns a new value.

use std::fmt;
use std::ops::{Add, BitAnd, BitOr, BitXor, Not, Sub};
use std::str::FromStr;

use rand::{Rng, RngCore};

/// Identifier width in bytes.
pub const NODE_ID_LENGTH: usize = 48;

/// Identifier width in bits.
pub const NODE_ID_BITS: usize = NODE_ID_LENGTH * 8;

/// Errors produced when building a [`Bitmap`] from external input.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BitmapError {
    /// Decoded input is not exactly [`NODE_ID_LENGTH`] bytes.
    LengthMismatch { expected: usize, actual: usize },
    /// Input is not valid hex.
    InvalidHex(hex::FromHexError),
}

impl fmt::Display for BitmapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BitmapError::LengthMismatch { expected, actual } => {
                write!(f, "identifier must be {} bytes, got {}", expected, actual)
            }
            BitmapError::InvalidHex(e) => write!(f, "invalid hex identifier: {}", e),
        }
    }
}

impl std::error::Error for BitmapError {}

impl From<hex::FromHexError> for BitmapError {
    fn from(err: hex::FromHexError) -> Self {
        BitmapError::InvalidHex(err)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Bitmap([u8; NODE_ID_LENGTH]);

impl Bitmap {
    #[inline]
    pub const fn from_bytes(bytes: [u8; NODE_ID_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Build from a byte slice, failing unless it is exactly the identifier width.
    pub fn try_from_slice(bytes: &[u8]) -> Result<Self, BitmapError> {
        let arr: [u8; NODE_ID_LENGTH] =
            bytes.try_into().map_err(|_| BitmapError::LengthMismatch {
                expected: NODE_ID_LENGTH,
                actual: bytes.len(),
            })?;
        Ok(Self(arr))
    }

    pub fn from_hex(s: &str) -> Result<Self, BitmapError> {
        let bytes = hex::decode(s)?;
        Self::try_from_slice(&bytes)
    }

    /// Parse a hex string that may omit leading zeros.
    ///
    /// `"1"` decodes to the identifier whose last byte is `0x01`.
    pub fn from_short_hex(s: &str) -> Result<Self, BitmapError> {
        let full = NODE_ID_LENGTH * 2;
        if s.len() > full {
            return Err(BitmapError::LengthMismatch {
                expected: NODE_ID_LENGTH,
                actual: s.len().div_ceil(2),
            });
        }
        let padded = format!("{}{}", "0".repeat(full - s.len()), s);
        Self::from_hex(&padded)
    }

    /// Key for a blob: the first [`NODE_ID_LENGTH`] bytes of BLAKE3's extendable output.
    pub fn from_content(data: &[u8]) -> Self {
        let mut out = [0u8; NODE_ID_LENGTH];
        blake3::Hasher::new()
            .update(data)
            .finalize_xof()
            .fill(&mut out);
        Self(out)
    }

    pub fn random() -> Self {
        let mut out = [0u8; NODE_ID_LENGTH];
        rand::thread_rng().fill_bytes(&mut out);
        Self(out)
    }

    #[inline]
    pub const fn zero() -> Self {
        Self([0u8; NODE_ID_LENGTH])
    }

    #[inline]
    pub const fn max() -> Self {
        Self([0xffu8; NODE_ID_LENGTH])
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; NODE_ID_LENGTH] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First eight hex characters, for log lines.
    pub fn hex_short(&self) -> String {
        hex::encode(&self.0[..4])
    }

    #[inline]
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }

    /// XOR distance to `other`.
    #[inline]
    pub fn distance(&self, other: &Bitmap) -> Bitmap {
        *self ^ *other
    }

    /// True if `a` is strictly closer to `self` than `b` under the XOR metric.
    pub fn closer(&self, a: &Bitmap, b: &Bitmap) -> bool {
        self.distance(a) < self.distance(b)
    }

    /// Number of leading zero bits; [`NODE_ID_BITS`] when all bits are zero.
    pub fn prefix_len(&self) -> usize {
        for (i, byte) in self.0.iter().enumerate() {
            if *byte != 0 {
                return i * 8 + byte.leading_zeros() as usize;
            }
        }
        NODE_ID_BITS
    }

    /// Copy with the first `n` bits forced to `one`.
    pub fn prefix(&self, n: usize, one: bool) -> Bitmap {
        let mut out = *self;
        for i in 0..n.min(NODE_ID_BITS) {
            out.set_bit(i, one);
        }
        out
    }

    /// Copy with the last `n` bits forced to `one`.
    pub fn suffix(&self, n: usize, one: bool) -> Bitmap {
        let mut out = *self;
        let n = n.min(NODE_ID_BITS);
        for i in NODE_ID_BITS - n..NODE_ID_BITS {
            out.set_bit(i, one);
        }
        out
    }

    /// Bit `i`, counting from the most significant bit.
    #[inline]
    pub fn bit(&self, i: usize) -> bool {
        self.0[i / 8] & (0x80 >> (i % 8)) != 0
    }

    #[inline]
    pub(crate) fn set_bit(&mut self, i: usize, one: bool) {
        let mask = 0x80u8 >> (i % 8);
        if one {
            self.0[i / 8] |= mask;
        } else {
            self.0[i / 8] &= !mask;
        }
    }

    fn overflowing_add(&self, other: &Bitmap) -> (Bitmap, bool) {
        let mut out = [0u8; NODE_ID_LENGTH];
        let mut carry = 0u16;
        for i in (0..NODE_ID_LENGTH).rev() {
            let sum = self.0[i] as u16 + other.0[i] as u16 + carry;
            out[i] = sum as u8;
            carry = sum >> 8;
        }
        (Bitmap(out), carry != 0)
    }

    /// Big-endian addition, `None` if the sum does not fit the width.
    pub fn checked_add(&self, other: &Bitmap) -> Option<Bitmap> {
        match self.overflowing_add(other) {
            (sum, false) => Some(sum),
            (_, true) => None,
        }
    }

    /// Big-endian subtraction, `None` if `other > self`.
    ///
    /// Computed as `self + (!other + 1)` with the final carry discarded.
    pub fn checked_sub(&self, other: &Bitmap) -> Option<Bitmap> {
        if self < other {
            return None;
        }
        let mut one = Bitmap::zero();
        one.0[NODE_ID_LENGTH - 1] = 1;
        let (negated, _) = (!*other).overflowing_add(&one);
        Some(self.overflowing_add(&negated).0)
    }

    /// Sample a value in `[low, high]`.
    ///
    /// The random draw is masked down to the bit length of `high - low` and
    /// then reduced by repeated subtraction of the interval width. Values in
    /// the lower part of the interval are favoured, so this is not a uniform
    /// sampler; it is good enough for picking refresh targets.
    ///
    /// # Panics
    ///
    /// Panics if `low > high`.
    pub fn random_in_range(low: &Bitmap, high: &Bitmap) -> Bitmap {
        Self::random_in_range_with(&mut rand::thread_rng(), low, high)
    }

    pub(crate) fn random_in_range_with<R: Rng + ?Sized>(
        rng: &mut R,
        low: &Bitmap,
        high: &Bitmap,
    ) -> Bitmap {
        let width = *high - *low;
        let mut draw = [0u8; NODE_ID_LENGTH];
        rng.fill_bytes(&mut draw);
        let mut r = Bitmap(draw).prefix(width.prefix_len(), false);
        while r > width {
            r = r - width;
        }
        r + *low
    }
}

/// # Panics
///
/// Panics if the sum overflows [`NODE_ID_BITS`]; use [`Bitmap::checked_add`]
/// when the operands are not known to be small enough.
impl Add for Bitmap {
    type Output = Bitmap;

    fn add(self, rhs: Bitmap) -> Bitmap {
        match self.checked_add(&rhs) {
            Some(sum) => sum,
            None => panic!("identifier overflow: {} + {}", self, rhs),
        }
    }
}

/// # Panics
///
/// Panics if `rhs > self`; negative identifiers are not representable.
impl Sub for Bitmap {
    type Output = Bitmap;

    fn sub(self, rhs: Bitmap) -> Bitmap {
        match self.checked_sub(&rhs) {
            Some(diff) => diff,
            None => panic!("identifier underflow: {} - {}", self, rhs),
        }
    }
}

impl BitXor for Bitmap {
    type Output = Bitmap;

    fn bitxor(self, rhs: Bitmap) -> Bitmap {
        let mut out = self.0;
        for (o, r) in out.iter_mut().zip(rhs.0.iter()) {
            *o ^= r;
        }
        Bitmap(out)
    }
}

impl BitAnd for Bitmap {
    type Output = Bitmap;

    fn bitand(self, rhs: Bitmap) -> Bitmap {
        let mut out = self.0;
        for (o, r) in out.iter_mut().zip(rhs.0.iter()) {
            *o &= r;
        }
        Bitmap(out)
    }
}

impl BitOr for Bitmap {
    type Output = Bitmap;

    fn bitor(self, rhs: Bitmap) -> Bitmap {
        let mut out = self.0;
        for (o, r) in out.iter_mut().zip(rhs.0.iter()) {
            *o |= r;
        }
        Bitmap(out)
    }
}

impl Not for Bitmap {
    type Output = Bitmap;

    fn not(self) -> Bitmap {
        let mut out = self.0;
        for o in out.iter_mut() {
            *o = !*o;
        }
        Bitmap(out)
    }
}

impl Default for Bitmap {
    fn default() -> Self {
        Self::zero()
    }
}

impl FromStr for Bitmap {
    type Err = BitmapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl TryFrom<&[u8]> for Bitmap {
    type Error = BitmapError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        Self::try_from_slice(bytes)
    }
}

impl From<[u8; NODE_ID_LENGTH]> for Bitmap {
    fn from(bytes: [u8; NODE_ID_LENGTH]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Bitmap {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Bitmap({})", self.hex_short())
    }
}

impl fmt::Display for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}
