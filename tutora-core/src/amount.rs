//! A currency amount newtype which maintains some useful internal invariants.
//!
//! Note that we don't impl `From<f64>` or [`FromStr`] because we want calling
//! code to be explicit about the input. If an [`Amount`] needs to be parsed
//! from a user-provided [`String`], use `Decimal::from_str`, then call
//! [`Amount::try_from_decimal`].
//!
//! All derived monetary totals in the billing engine are rounded to two
//! decimal places with [`Amount::round2`]; the newtype itself preserves full
//! precision so intermediate arithmetic (proportional fee splits, tip shares)
//! does not accumulate rounding error.
//!
//! [`FromStr`]: std::str::FromStr

use std::{
    fmt::{self, Display},
    iter::Sum,
    ops::{Add, Div, Mul, Sub},
};

use rust_decimal::{Decimal, RoundingStrategy, prelude::ToPrimitive};
use rust_decimal_macros::dec;
use serde::{Deserialize, Deserializer, Serialize};

/// Errors that can occur when attempting to construct an [`Amount`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Amount is negative")]
    Negative,
    #[error("Amount is too large")]
    TooLarge,
}

/// A non-negative currency amount, internally a [`Decimal`], which provides
/// the following properties:
///
/// - The contained value is non-negative.
/// - The contained value is no greater than [`Amount::MAX`].
/// - Arithmetic preserves full decimal precision; rounding happens only at
///   explicit [`round2`] boundaries.
///
/// [`round2`]: Amount::round2
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize)]
pub struct Amount(Decimal);

impl Amount {
    /// An [`Amount`] of zero.
    pub const ZERO: Self = Self(dec!(0));

    /// The maximum [`Amount`] this type can represent. One trillion currency
    /// units, far beyond any plausible invoice total; primarily a sanity
    /// check against corrupted arithmetic.
    pub const MAX: Self = Self(dec!(1_000_000_000_000));

    /// Tolerance used when comparing a supplied amount against an expected
    /// decomposition (payment normalisation).
    pub const EPSILON: Decimal = dec!(0.01);

    // --- Constructors --- //

    /// Construct an [`Amount`] from a whole number of currency units.
    #[inline]
    pub fn from_major(units: u64) -> Self {
        Self(Decimal::from(units))
    }

    /// Construct an [`Amount`] from a [`Decimal`] value.
    #[inline]
    pub fn try_from_decimal(value: Decimal) -> Result<Self, Error> {
        Self::try_from_inner(value)
    }

    // --- Getters --- //

    /// Returns the contained [`Decimal`].
    #[inline]
    pub fn as_decimal(&self) -> Decimal {
        self.0
    }

    /// Returns the amount rounded to two decimal places, half away from zero.
    #[inline]
    pub fn round2(&self) -> Self {
        Self(
            self.0
                .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero),
        )
    }

    /// Returns the amount as an `f64`. Lossy; display and export only.
    #[inline]
    pub fn to_f64_lossy(&self) -> f64 {
        self.0.to_f64().unwrap_or(0.0)
    }

    #[inline]
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// Whether `self` and `other` differ by no more than `tolerance`.
    #[inline]
    pub fn approx_eq(&self, other: Self, tolerance: Decimal) -> bool {
        (self.0 - other.0).abs() <= tolerance
    }

    // --- Checked arithmetic --- //

    pub fn checked_add(self, rhs: Self) -> Option<Self> {
        let inner = self.0.checked_add(rhs.0)?;
        Self::try_from_inner(inner).ok()
    }

    pub fn checked_sub(self, rhs: Self) -> Option<Self> {
        let inner = self.0.checked_sub(rhs.0)?;
        Self::try_from_inner(inner).ok()
    }

    /// Subtraction clamped at zero, for "remaining balance" style math.
    pub fn saturating_sub(self, rhs: Self) -> Self {
        Self((self.0 - rhs.0).max(Decimal::ZERO))
    }

    // Amount * scalar => Amount
    pub fn checked_mul(self, rhs: Decimal) -> Option<Self> {
        let inner = self.0.checked_mul(rhs)?;
        Self::try_from_inner(inner).ok()
    }

    // Amount / scalar => Amount
    pub fn checked_div(self, rhs: Decimal) -> Option<Self> {
        let inner = self.0.checked_div(rhs)?;
        Self::try_from_inner(inner).ok()
    }

    /// Checks all internal invariants, returning [`Self`] if all were OK.
    #[inline]
    fn try_from_inner(inner: Decimal) -> Result<Self, Error> {
        if inner.is_sign_negative() && !inner.is_zero() {
            Err(Error::Negative)
        } else if inner > Self::MAX.0 {
            Err(Error::TooLarge)
        } else {
            Ok(Self(inner))
        }
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let inner: Decimal = Deserialize::deserialize(deserializer)?;

        Self::try_from_inner(inner).map_err(|e| match e {
            Error::Negative => serde::de::Error::custom("Amount was negative"),
            Error::TooLarge => serde::de::Error::custom("Amount was too large"),
        })
    }
}

impl Display for Amount {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Delegate to Decimal's Display impl which respects `std::fmt` syntax.
        Decimal::fmt(&self.0, f)
    }
}

// --- Basic std::ops impls --- //

impl Add for Amount {
    type Output = Self;
    fn add(self, rhs: Self) -> Self::Output {
        Self::try_from_inner(self.0 + rhs.0).expect("Overflowed")
    }
}

impl Sub for Amount {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self::Output {
        Self::try_from_inner(self.0 - rhs.0).expect("Underflowed")
    }
}

// Amount * scalar => Amount
impl Mul<Decimal> for Amount {
    type Output = Self;
    fn mul(self, rhs: Decimal) -> Self::Output {
        Self::try_from_inner(self.0 * rhs).expect("Overflowed")
    }
}

// Amount / scalar => Amount
impl Div<Decimal> for Amount {
    type Output = Self;
    fn div(self, rhs: Decimal) -> Self::Output {
        Self::try_from_inner(self.0 / rhs).expect("Overflowed")
    }
}

impl Sum for Amount {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::ZERO, Add::add)
    }
}

// --- Tests and test infra --- //

#[cfg(any(test, feature = "test-utils"))]
mod arbitrary_impl {
    use proptest::{
        arbitrary::Arbitrary,
        strategy::{BoxedStrategy, Strategy},
    };

    use super::*;

    impl Arbitrary for Amount {
        type Parameters = ();
        type Strategy = BoxedStrategy<Self>;
        fn arbitrary_with(_args: Self::Parameters) -> Self::Strategy {
            // Cents up to ten million units keeps arithmetic comfortably
            // inside Amount::MAX even after summation in aggregates.
            (0u64..1_000_000_000)
                .prop_map(|cents| Amount(Decimal::new(cents as i64, 2)))
                .boxed()
        }
    }
}

#[cfg(test)]
mod test {
    use proptest::{arbitrary::any, prop_assert, prop_assert_eq, proptest};

    use super::*;

    #[test]
    fn round2_half_away_from_zero() {
        let a = Amount::try_from_decimal(dec!(10.005)).unwrap();
        assert_eq!(a.round2(), Amount::try_from_decimal(dec!(10.01)).unwrap());
        let b = Amount::try_from_decimal(dec!(10.004)).unwrap();
        assert_eq!(b.round2(), Amount::try_from_decimal(dec!(10.00)).unwrap());
    }

    #[test]
    fn negative_rejected() {
        assert!(Amount::try_from_decimal(dec!(-0.01)).is_err());
        assert!(serde_json::from_str::<Amount>("-1").is_err());
        assert!(serde_json::from_str::<Amount>("1.5").is_ok());
    }

    #[test]
    fn amount_add_sub() {
        proptest!(|(amount1 in any::<Amount>(), amount2 in any::<Amount>())| {
            let (greater, lesser) = if amount1 >= amount2 {
                (amount1, amount2)
            } else {
                (amount2, amount1)
            };

            let diff = greater - lesser;
            prop_assert_eq!(greater, lesser + diff);
            prop_assert_eq!(lesser, greater - diff);

            if greater > lesser {
                prop_assert!(lesser.checked_sub(greater).is_none());
                prop_assert_eq!(lesser.saturating_sub(greater), Amount::ZERO);
            }
        })
    }

    #[test]
    fn sum_matches_fold() {
        proptest!(|(amounts in proptest::collection::vec(any::<Amount>(), 0..16))| {
            let total: Amount = amounts.iter().copied().sum();
            let folded = amounts
                .iter()
                .copied()
                .fold(Amount::ZERO, |acc, a| acc + a);
            prop_assert_eq!(total, folded);
        })
    }
}
