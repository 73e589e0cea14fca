//! Test-only helpers: serde roundtrip proptests and fixture builders.
//! Gated behind the `test-utils` feature; never compiled into production
//! binaries.

pub mod fixtures;
pub mod roundtrip;
