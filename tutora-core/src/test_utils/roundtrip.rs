use std::fmt::Debug;

use proptest::{
    arbitrary::{Arbitrary, any},
    prop_assert_eq, proptest,
    strategy::Strategy,
    test_runner::Config,
};
use serde::{Serialize, de::DeserializeOwned};

/// Quickly create a [`serde_json::Value`] canonical roundtrip proptest.
///
/// Uses [`serde_json::Value`] as the serialized representation rather than
/// the json string, since the `Value` comparison is field-order invariant.
///
/// ```ignore
/// json_value_roundtrip_proptest::<InvoiceStatus>();
/// ```
pub fn json_value_roundtrip_proptest<T>()
where
    T: Arbitrary + PartialEq + Serialize + DeserializeOwned,
{
    json_value_custom(any::<T>(), Config::default());
}

/// Roundtrip proptest with a custom strategy and config. Useful for foreign
/// types without an [`Arbitrary`] impl, or to reduce case counts on slow
/// strategies.
pub fn json_value_custom<S, T>(strategy: S, config: Config)
where
    S: Strategy<Value = T>,
    T: PartialEq + Serialize + DeserializeOwned + Debug,
{
    proptest!(config, |(value1 in strategy)| {
        let json_value1 = serde_json::to_value(&value1).unwrap();
        let value2 = serde_json::from_value::<T>(json_value1.clone()).unwrap();
        let json_value2 = serde_json::to_value(&value2).unwrap();

        prop_assert_eq!(&value1, &value2);
        prop_assert_eq!(&json_value1, &json_value2);
    });
}
