//! An hour-quantity newtype, the unit the guardian and teacher ledgers are
//! kept in. Mirrors [`Amount`] but rounds to three decimal places, which is
//! enough to represent any whole number of minutes exactly after rounding
//! error is accounted for via [`Hours::EPSILON`].
//!
//! [`Amount`]: crate::amount::Amount

use std::{
    fmt::{self, Display},
    iter::Sum,
    ops::{Add, Div, Mul, Sub},
};

use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde::{Deserialize, Deserializer, Serialize};

/// Errors that can occur when attempting to construct an [`Hours`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Hours is negative")]
    Negative,
    #[error("Hours is too large")]
    TooLarge,
}

/// A non-negative quantity of lesson hours.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize)]
pub struct Hours(Decimal);

impl Hours {
    pub const ZERO: Self = Self(dec!(0));

    /// A million hours; sanity bound, same role as [`Amount::MAX`].
    ///
    /// [`Amount::MAX`]: crate::amount::Amount::MAX
    pub const MAX: Self = Self(dec!(1_000_000));

    /// Coverage-cap tolerance: a boundary lesson is included in full if doing
    /// so exceeds the cap by no more than this.
    pub const EPSILON: Decimal = dec!(0.001);

    // --- Constructors --- //

    /// Construct an [`Hours`] from a whole number of minutes.
    #[inline]
    pub fn from_minutes(minutes: u32) -> Self {
        Self(Decimal::from(minutes) / dec!(60))
    }

    /// Construct an [`Hours`] from a [`Decimal`] value.
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

    /// Rounded to three decimal places, half away from zero. Applied whenever
    /// an hour quantity is written to a ledger.
    #[inline]
    pub fn round3(&self) -> Self {
        Self(
            self.0
                .round_dp_with_strategy(3, RoundingStrategy::MidpointAwayFromZero),
        )
    }

    #[inline]
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// Whether `self` and `other` differ by no more than [`Hours::EPSILON`].
    #[inline]
    pub fn approx_eq(&self, other: Self) -> bool {
        (self.0 - other.0).abs() <= Self::EPSILON
    }

    /// Whether `self` exceeds `cap` by more than [`Hours::EPSILON`].
    #[inline]
    pub fn exceeds(&self, cap: Self) -> bool {
        self.0 > cap.0 + Self::EPSILON
    }

    #[inline]
    pub fn min(self, other: Self) -> Self {
        Self(self.0.min(other.0))
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

    /// Subtraction clamped at zero.
    pub fn saturating_sub(self, rhs: Self) -> Self {
        Self((self.0 - rhs.0).max(Decimal::ZERO))
    }

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

impl<'de> Deserialize<'de> for Hours {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let inner: Decimal = Deserialize::deserialize(deserializer)?;

        Self::try_from_inner(inner).map_err(|e| match e {
            Error::Negative => serde::de::Error::custom("Hours was negative"),
            Error::TooLarge => serde::de::Error::custom("Hours was too large"),
        })
    }
}

impl Display for Hours {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Decimal::fmt(&self.0, f)
    }
}

impl Add for Hours {
    type Output = Self;
    fn add(self, rhs: Self) -> Self::Output {
        Self::try_from_inner(self.0 + rhs.0).expect("Overflowed")
    }
}

impl Sub for Hours {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self::Output {
        Self::try_from_inner(self.0 - rhs.0).expect("Underflowed")
    }
}

impl Mul<Decimal> for Hours {
    type Output = Self;
    fn mul(self, rhs: Decimal) -> Self::Output {
        Self::try_from_inner(self.0 * rhs).expect("Overflowed")
    }
}

impl Div<Decimal> for Hours {
    type Output = Self;
    fn div(self, rhs: Decimal) -> Self::Output {
        Self::try_from_inner(self.0 / rhs).expect("Overflowed")
    }
}

impl Sum for Hours {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::ZERO, Add::add)
    }
}

#[cfg(any(test, feature = "test-utils"))]
mod arbitrary_impl {
    use proptest::{
        arbitrary::Arbitrary,
        strategy::{BoxedStrategy, Strategy},
    };

    use super::*;

    impl Arbitrary for Hours {
        type Parameters = ();
        type Strategy = BoxedStrategy<Self>;
        fn arbitrary_with(_args: Self::Parameters) -> Self::Strategy {
            // Up to ~10k hours in whole minutes.
            (0u32..600_000).prop_map(Hours::from_minutes).boxed()
        }
    }
}

#[cfg(test)]
mod test {
    use proptest::{arbitrary::any, prop_assert, prop_assert_eq, proptest};

    use super::*;

    #[test]
    fn minutes_roundtrip_within_epsilon() {
        proptest!(|(mins in 0u32..600_000)| {
            let hours = Hours::from_minutes(mins);
            let back = hours.as_decimal() * dec!(60);
            prop_assert!((back - Decimal::from(mins)).abs() < dec!(0.000_001));
        })
    }

    #[test]
    fn exceeds_respects_epsilon() {
        let cap = Hours::from_minutes(60);
        let exactly = Hours::from_minutes(60);
        let barely_over =
            Hours::try_from_decimal(dec!(1.0005)).unwrap();
        let clearly_over = Hours::try_from_decimal(dec!(1.01)).unwrap();
        assert!(!exactly.exceeds(cap));
        assert!(!barely_over.exceeds(cap));
        assert!(clearly_over.exceeds(cap));
    }

    #[test]
    fn hours_add_sub() {
        proptest!(|(h1 in any::<Hours>(), h2 in any::<Hours>())| {
            let (greater, lesser) =
                if h1 >= h2 { (h1, h2) } else { (h2, h1) };
            let diff = greater - lesser;
            prop_assert_eq!(greater, lesser + diff);
            prop_assert_eq!(lesser.saturating_sub(greater), Hours::ZERO);
        })
    }
}
