//! Conversion between domain identifiers and backend-native keys.

use std::fmt;

use kvmap_types::Value;

/// A backend's native key representation.
///
/// `to_value` and `from_value` define the default identity conversion used
/// by [`NativeEntryStore::infer_native_key`](crate::NativeEntryStore::infer_native_key).
/// `from_value(&k.to_value())` must give back `k`.
pub trait NativeKey: Clone + fmt::Debug + Send + Sync + 'static {
    fn to_value(&self) -> Value;

    /// `None` if `value` has no representation as this key type.
    fn from_value(value: &Value) -> Option<Self>;
}

impl NativeKey for Value {
    fn to_value(&self) -> Value {
        self.clone()
    }

    fn from_value(value: &Value) -> Option<Self> {
        value.clone().non_null()
    }
}

impl NativeKey for i64 {
    fn to_value(&self) -> Value {
        Value::Int(*self)
    }

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Int(i) => Some(*i),
            Value::Text(s) => s.parse().ok(),
            _ => None,
        }
    }
}

impl NativeKey for u64 {
    fn to_value(&self) -> Value {
        i64::try_from(*self).map_or_else(|_| Value::Text(self.to_string()), Value::Int)
    }

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Int(i) => u64::try_from(*i).ok(),
            Value::Text(s) => s.parse().ok(),
            _ => None,
        }
    }
}

impl NativeKey for String {
    fn to_value(&self) -> Value {
        Value::Text(self.clone())
    }

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Text(s) => Some(s.clone()),
            Value::Int(i) => Some(i.to_string()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn value_key_rejects_null() {
        assert_eq!(<Value as NativeKey>::from_value(&Value::Null), None);
        assert_eq!(
            <Value as NativeKey>::from_value(&Value::Int(3)),
            Some(Value::Int(3))
        );
    }

    #[test]
    fn numeric_keys_accept_text() {
        assert_eq!(i64::from_value(&Value::from("42")), Some(42));
        assert_eq!(u64::from_value(&Value::Int(-1)), None);
        assert_eq!(String::from_value(&Value::Int(7)).as_deref(), Some("7"));
        assert_eq!(u64::MAX.to_value(), Value::Text(u64::MAX.to_string()));
    }

    proptest! {
        #[test]
        fn i64_round_trips(k in any::<i64>()) {
            prop_assert_eq!(i64::from_value(&k.to_value()), Some(k));
        }

        #[test]
        fn u64_round_trips(k in any::<u64>()) {
            prop_assert_eq!(u64::from_value(&k.to_value()), Some(k));
        }
    }
}
