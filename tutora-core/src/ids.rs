//! Byte-array id newtypes for every entity the billing engine references.
//!
//! Each id is 16 random bytes rendered as a short type prefix plus lowercase
//! hex, e.g. `inv_00112233445566778899aabbccddeeff`. The prefix makes ids
//! self-describing in logs and API payloads and catches cross-entity mixups
//! at parse time.

use std::fmt::{self, Display};
use std::str::FromStr;

use rand_core::RngCore;
use serde_with::{DeserializeFromStr, SerializeDisplay};

/// Errors that can occur when parsing an id string.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("id is missing the '{0}_' prefix")]
    WrongPrefix(&'static str),
    #[error("id payload must be exactly 32 hex characters")]
    BadLength,
    #[error("id payload contains a non-hex character")]
    BadHex,
}

pub(crate) fn encode_hex(bytes: &[u8; 16]) -> String {
    let mut out = String::with_capacity(32);
    for b in bytes {
        out.push(char::from_digit((b >> 4) as u32, 16).unwrap());
        out.push(char::from_digit((b & 0xf) as u32, 16).unwrap());
    }
    out
}

pub(crate) fn decode_hex(s: &str) -> Result<[u8; 16], ParseError> {
    if s.len() != 32 {
        return Err(ParseError::BadLength);
    }
    let mut bytes = [0u8; 16];
    for (i, chunk) in s.as_bytes().chunks_exact(2).enumerate() {
        let hi = (chunk[0] as char).to_digit(16).ok_or(ParseError::BadHex)?;
        let lo = (chunk[1] as char).to_digit(16).ok_or(ParseError::BadHex)?;
        bytes[i] = ((hi << 4) | lo) as u8;
    }
    Ok(bytes)
}

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(
            Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash,
            SerializeDisplay, DeserializeFromStr,
        )]
        pub struct $name([u8; 16]);

        impl $name {
            /// The string prefix for this id type, without the underscore.
            pub const PREFIX: &'static str = $prefix;

            #[inline]
            pub const fn from_array(bytes: [u8; 16]) -> Self {
                Self(bytes)
            }

            #[inline]
            pub const fn to_array(self) -> [u8; 16] {
                self.0
            }

            /// Generate a fresh random id.
            pub fn from_rng(rng: &mut dyn RngCore) -> Self {
                let mut bytes = [0u8; 16];
                rng.fill_bytes(&mut bytes);
                Self(bytes)
            }

            /// Deterministic id from a small integer. Fixture helper.
            #[cfg(any(test, feature = "test-utils"))]
            pub const fn from_u64(n: u64) -> Self {
                let mut bytes = [0u8; 16];
                let src = n.to_be_bytes();
                let mut i = 0;
                while i < 8 {
                    bytes[8 + i] = src[i];
                    i += 1;
                }
                Self(bytes)
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}_{}", Self::PREFIX, encode_hex(&self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{self}")
            }
        }

        impl FromStr for $name {
            type Err = ParseError;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let payload = s
                    .strip_prefix(concat!($prefix, "_"))
                    .ok_or(ParseError::WrongPrefix(Self::PREFIX))?;
                decode_hex(payload).map(Self)
            }
        }

        #[cfg(any(test, feature = "test-utils"))]
        impl proptest::arbitrary::Arbitrary for $name {
            type Parameters = ();
            type Strategy = proptest::strategy::BoxedStrategy<Self>;
            fn arbitrary_with(_args: Self::Parameters) -> Self::Strategy {
                use proptest::strategy::Strategy;
                proptest::arbitrary::any::<[u8; 16]>()
                    .prop_map(Self::from_array)
                    .boxed()
            }
        }
    };
}

define_id!(
    /// Identifies a guardian (the billed party).
    GuardianId, "gdn"
);
define_id!(
    /// Identifies a teacher.
    TeacherId, "tch"
);
define_id!(
    /// Identifies a student.
    StudentId, "stu"
);
define_id!(
    /// Identifies a class (a single scheduled lesson).
    ClassId, "cls"
);
define_id!(
    /// Identifies an invoice aggregate.
    InvoiceId, "inv"
);
define_id!(
    /// Identifies the user who performed an action.
    ActorId, "act"
);
define_id!(
    /// Identifies a persistent payment idempotency record.
    PaymentId, "pay"
);
define_id!(
    /// Identifies an audit entry.
    AuditId, "aud"
);

#[cfg(test)]
mod test {
    use proptest::{arbitrary::any, prop_assert_eq, proptest};

    use super::*;

    #[test]
    fn display_fromstr_roundtrip() {
        proptest!(|(id in any::<InvoiceId>())| {
            let s = id.to_string();
            prop_assert_eq!(InvoiceId::from_str(&s).unwrap(), id);
        })
    }

    #[test]
    fn prefix_mismatch_rejected() {
        let id = GuardianId::from_u64(7).to_string();
        assert!(InvoiceId::from_str(&id).is_err());
    }

    #[test]
    fn json_string_representation() {
        let id = ClassId::from_array([0xab; 16]);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"cls_abababababababababababababababab\"");
        assert_eq!(serde_json::from_str::<ClassId>(&json).unwrap(), id);
    }
}
