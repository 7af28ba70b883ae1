//! Arbitrary-precision signed integer, used once an `Int32` arithmetic
//! operation overflows 32 bits.

use std::fmt;
use std::ops::{Add, Div, Mul, Neg, Rem, Sub};

use num_bigint::BigInt;
use num_integer::Integer;
use num_traits::{Signed, ToPrimitive, Zero};

use crate::value::Value;

/// A refcounted-by-the-heap arbitrary-precision integer. The wrapped
/// `BigInt` itself has no identity semantics of its own; `DynInt` values are
/// always stored behind a `Value::Ref(HeapId)` once promoted onto the heap.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct DynInt(pub BigInt);

impl DynInt {
    #[must_use]
    pub fn new(value: BigInt) -> Self {
        Self(value)
    }

    #[must_use]
    pub fn from_i64(v: i64) -> Self {
        Self(BigInt::from(v))
    }

    /// Parses a decimal or `0x`-prefixed hex literal.
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
            BigInt::parse_bytes(hex.as_bytes(), 16).map(Self)
        } else {
            text.parse::<BigInt>().ok().map(Self)
        }
    }

    #[must_use]
    pub fn inner(&self) -> &BigInt {
        &self.0
    }

    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    #[must_use]
    pub fn is_negative(&self) -> bool {
        self.0.is_negative()
    }

    #[must_use]
    pub fn to_i32(&self) -> Option<i32> {
        self.0.to_i32()
    }

    #[must_use]
    pub fn to_i64(&self) -> Option<i64> {
        self.0.to_i64()
    }

    #[must_use]
    pub fn to_f64(&self) -> f64 {
        self.0.to_f64().unwrap_or(f64::NAN)
    }

    /// Demotes back to `Value::Int32` if the magnitude fits; otherwise
    /// callers keep the BigInt on the heap. Per the "no contraction" choice
    /// recorded in `DESIGN.md`, this is only ever called at construction
    /// time (promotion), never after a subsequent arithmetic op.
    #[must_use]
    pub fn fits_i32(&self) -> bool {
        self.0.to_i32().is_some()
    }

    /// Floor division: rounds toward negative infinity rather than toward
    /// zero, for `//`'s BigInt tier. Differs from `Div`'s truncating `/`
    /// only when the operands have different signs. Caller checks for a
    /// zero divisor first.
    #[must_use]
    pub fn div_floor(&self, rhs: &Self) -> Self {
        Self(self.0.div_floor(&rhs.0))
    }
}

impl fmt::Display for DynInt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<BigInt> for DynInt {
    fn from(v: BigInt) -> Self {
        Self(v)
    }
}

impl Add for &DynInt {
    type Output = DynInt;
    fn add(self, rhs: Self) -> DynInt {
        DynInt(&self.0 + &rhs.0)
    }
}

impl Sub for &DynInt {
    type Output = DynInt;
    fn sub(self, rhs: Self) -> DynInt {
        DynInt(&self.0 - &rhs.0)
    }
}

impl Mul for &DynInt {
    type Output = DynInt;
    fn mul(self, rhs: Self) -> DynInt {
        DynInt(&self.0 * &rhs.0)
    }
}

impl Neg for &DynInt {
    type Output = DynInt;
    fn neg(self) -> DynInt {
        DynInt(-&self.0)
    }
}

/// Truncating division (rounds toward zero), matching `Int32`'s `/` tier
/// for the exact-division case. Caller checks for a zero divisor first.
impl Div for &DynInt {
    type Output = DynInt;
    fn div(self, rhs: Self) -> DynInt {
        DynInt(&self.0 / &rhs.0)
    }
}

/// Truncating remainder (sign follows the dividend), matching `Int32`'s
/// `wrapping_rem`. Caller checks for a zero divisor first.
impl Rem for &DynInt {
    type Output = DynInt;
    fn rem(self, rhs: Self) -> DynInt {
        DynInt(&self.0 % &rhs.0)
    }
}

/// Result of a checked 32-bit arithmetic op: whether it fit, and the low
/// bits computed either way (used by the VM to avoid a second computation
/// when promoting to `DynInt`).
pub struct Checked32 {
    pub fits: bool,
    pub low_bits: i32,
}

#[must_use]
pub fn checked_add_i32(a: i32, b: i32) -> Checked32 {
    match a.checked_add(b) {
        Some(v) => Checked32 { fits: true, low_bits: v },
        None => Checked32 { fits: false, low_bits: a.wrapping_add(b) },
    }
}

#[must_use]
pub fn checked_sub_i32(a: i32, b: i32) -> Checked32 {
    match a.checked_sub(b) {
        Some(v) => Checked32 { fits: true, low_bits: v },
        None => Checked32 { fits: false, low_bits: a.wrapping_sub(b) },
    }
}

#[must_use]
pub fn checked_mul_i32(a: i32, b: i32) -> Checked32 {
    match a.checked_mul(b) {
        Some(v) => Checked32 { fits: true, low_bits: v },
        None => Checked32 { fits: false, low_bits: a.wrapping_mul(b) },
    }
}

/// Converts a `DynInt` that fits back into a machine `Int32` `Value`, or
/// leaves it as-is for the caller to box onto the heap.
pub fn demote_or_box(v: DynInt) -> Result<Value, DynInt> {
    match v.to_i32() {
        Some(i) => Ok(Value::Int32(i)),
        None => Err(v),
    }
}

#[cfg(test)]
mod tests {
    use super::{checked_add_i32, checked_mul_i32, DynInt};

    #[test]
    fn add_overflow_detected() {
        let r = checked_add_i32(i32::MAX, 1);
        assert!(!r.fits);
    }

    #[test]
    fn add_no_overflow() {
        let r = checked_add_i32(2, 3);
        assert!(r.fits);
        assert_eq!(r.low_bits, 5);
    }

    #[test]
    fn mul_overflow_promotes_to_correct_value() {
        let r = checked_mul_i32(i32::MAX, 2);
        assert!(!r.fits);
        let promoted = DynInt::from_i64(i64::from(i32::MAX) * 2);
        assert_eq!(promoted.to_i64(), Some(4_294_967_294));
    }

    #[test]
    fn parses_hex_and_decimal() {
        assert_eq!(DynInt::parse("0x10").unwrap().to_i64(), Some(16));
        assert_eq!(DynInt::parse("42").unwrap().to_i64(), Some(42));
    }

    #[test]
    fn div_and_rem_truncate_toward_zero() {
        let a = DynInt::from_i64(-7);
        let b = DynInt::from_i64(2);
        assert_eq!((&a / &b).to_i64(), Some(-3));
        assert_eq!((&a % &b).to_i64(), Some(-1));
    }

    #[test]
    fn div_floor_rounds_toward_negative_infinity() {
        let a = DynInt::from_i64(-7);
        let b = DynInt::from_i64(2);
        assert_eq!(a.div_floor(&b).to_i64(), Some(-4));
    }
}
