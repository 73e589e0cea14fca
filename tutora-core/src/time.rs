//! Unix-epoch millisecond timestamps.
//!
//! The billing engine only ever stores instants, compares them, and buckets
//! them into calendar dates (billing periods, due-date checks, teacher
//! months), so [`TimestampMs`] stays millisecond-native and converts to
//! [`chrono`] types on demand. There is no [`std::time`] surface.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize, de};

/// Error constructing a [`TimestampMs`] from a negative value.
#[derive(Debug, thiserror::Error)]
#[error("timestamp must be a non-negative millisecond count")]
pub struct NegativeTimestamp;

/// The number of milliseconds since the Unix epoch.
///
/// Internally a non-negative [`i64`] to ease interoperability with document
/// stores that don't support unsigned ints; the invariant is enforced at
/// every constructor, including deserialization.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize,
)]
pub struct TimestampMs(i64);

impl TimestampMs {
    /// The current instant.
    pub fn now() -> Self {
        Self(Utc::now().timestamp_millis().max(0))
    }

    /// Constructs a [`TimestampMs`] from an [`i64`]; errors if negative.
    pub fn try_from_i64(value: i64) -> Result<Self, NegativeTimestamp> {
        if value >= 0 {
            Ok(Self(value))
        } else {
            Err(NegativeTimestamp)
        }
    }

    /// Returns the contained [`i64`].
    pub fn as_i64(self) -> i64 {
        self.0
    }

    /// The absolute difference between two instants, in milliseconds. This
    /// is what the duplicate-payment fingerprint window compares.
    pub fn abs_diff(self, other: Self) -> u64 {
        self.0.abs_diff(other.0)
    }

    /// The UTC calendar date this instant falls on.
    pub fn date_utc(self) -> NaiveDate {
        self.to_datetime_utc().date_naive()
    }

    /// The instant as a [`chrono`] UTC datetime, for formatting and
    /// calendar math.
    pub fn to_datetime_utc(self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.0)
            .expect("non-negative i64 millis is always in chrono range")
    }
}

/// Enforces the non-negative invariant on the wire.
impl<'de> Deserialize<'de> for TimestampMs {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = i64::deserialize(deserializer)?;
        Self::try_from_i64(value).map_err(de::Error::custom)
    }
}

#[cfg(any(test, feature = "test-utils"))]
mod arbitrary_impl {
    use proptest::{
        arbitrary::Arbitrary,
        strategy::{BoxedStrategy, Strategy},
    };

    use super::*;

    impl Arbitrary for TimestampMs {
        type Parameters = ();
        type Strategy = BoxedStrategy<Self>;
        fn arbitrary_with(_args: Self::Parameters) -> Self::Strategy {
            // Bounded so `date_utc` lands on sane calendar dates.
            (0..4_102_444_800_000i64).prop_map(TimestampMs).boxed()
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_utils::roundtrip;

    #[test]
    fn timestamp_roundtrip() {
        roundtrip::json_value_roundtrip_proptest::<TimestampMs>();
    }

    #[test]
    fn constructors_enforce_nonnegative() {
        assert_eq!(TimestampMs::try_from_i64(42).unwrap().as_i64(), 42);
        assert_eq!(TimestampMs::try_from_i64(0).unwrap().as_i64(), 0);
        assert!(TimestampMs::try_from_i64(-42).is_err());

        assert_eq!(serde_json::from_str::<TimestampMs>("42").unwrap().0, 42);
        assert!(serde_json::from_str::<TimestampMs>("-42").is_err());
    }

    #[test]
    fn abs_diff_is_symmetric() {
        let a = TimestampMs::try_from_i64(1_000).unwrap();
        let b = TimestampMs::try_from_i64(31_000).unwrap();
        assert_eq!(a.abs_diff(b), 30_000);
        assert_eq!(b.abs_diff(a), 30_000);
        assert_eq!(a.abs_diff(a), 0);
    }

    #[test]
    fn date_utc_matches_chrono() {
        // 2025-01-15T12:00:00Z
        let ts = TimestampMs::try_from_i64(1_736_942_400_000).unwrap();
        assert_eq!(
            ts.date_utc(),
            NaiveDate::from_ymd_opt(2025, 1, 15).unwrap()
        );
    }
}
