//! The conversion table used to coerce values between domain objects and
//! native records.
//!
//! Backends frequently store everything as bytes or strings (hash stores,
//! wide-column families), so reading a record back requires turning the
//! stored form into the declared type of the property. [`ConversionService`]
//! holds one converter per `(from, to)` pair; the defaults cover
//! byte-sequence, text, numeric and boolean coercions and callers may
//! register their own.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{TypeError, TypeResult};
use crate::value::{Value, ValueType};

/// A single conversion function.
pub type Converter = Arc<dyn Fn(&Value) -> TypeResult<Value> + Send + Sync>;

/// Pluggable table of value converters keyed by `(from, to)`.
#[derive(Clone)]
pub struct ConversionService {
    converters: HashMap<(ValueType, ValueType), Converter>,
}

impl ConversionService {
    /// An empty table: only identity and `Null` pass-through conversions work.
    pub fn empty() -> Self {
        Self {
            converters: HashMap::new(),
        }
    }

    /// Register (or replace) the converter for `from -> to`.
    pub fn register<F>(&mut self, from: ValueType, to: ValueType, converter: F)
    where
        F: Fn(&Value) -> TypeResult<Value> + Send + Sync + 'static,
    {
        self.converters.insert((from, to), Arc::new(converter));
    }

    /// Returns `true` if a value of type `from` can be converted to `to`.
    pub fn can_convert(&self, from: ValueType, to: ValueType) -> bool {
        from == to || to == ValueType::Any || self.converters.contains_key(&(from, to))
    }

    /// Convert `value` to `target`.
    ///
    /// `Null` converts to `Null` for every target, and values already of the
    /// target type are returned unchanged.
    pub fn convert(&self, value: &Value, target: ValueType) -> TypeResult<Value> {
        let Some(source) = value.value_type() else {
            return Ok(Value::Null);
        };
        if source == target || target == ValueType::Any {
            return Ok(value.clone());
        }
        match self.converters.get(&(source, target)) {
            Some(converter) => converter(value),
            None => Err(TypeError::Unsupported {
                from: source,
                to: target,
            }),
        }
    }

    /// Like [`convert`](Self::convert) but takes ownership, avoiding a clone
    /// when no conversion is needed.
    pub fn convert_owned(&self, value: Value, target: ValueType) -> TypeResult<Value> {
        match value.value_type() {
            None => Ok(Value::Null),
            Some(source) if source == target || target == ValueType::Any => Ok(value),
            Some(_) => self.convert(&value, target),
        }
    }

    fn with_defaults(mut self) -> Self {
        use ValueType::{Bool, Bytes, Float, Int, Text};

        self.register(Bytes, Text, |v| {
            let bytes = v.as_bytes().unwrap_or_default();
            String::from_utf8(bytes.to_vec())
                .map(Value::Text)
                .map_err(|e| TypeError::InvalidUtf8(e.to_string()))
        });
        self.register(Text, Bytes, |v| {
            Ok(Value::Bytes(v.as_str().unwrap_or_default().as_bytes().to_vec()))
        });
        self.register(Text, Int, |v| parse_int(v.as_str().unwrap_or_default()));
        self.register(Text, Float, |v| parse_float(v.as_str().unwrap_or_default()));
        self.register(Text, Bool, |v| parse_bool(v.as_str().unwrap_or_default()));
        self.register(Int, Text, |v| Ok(Value::Text(v.to_string())));
        self.register(Float, Text, |v| Ok(Value::Text(v.to_string())));
        self.register(Bool, Text, |v| Ok(Value::Text(v.to_string())));
        self.register(Bytes, Int, |v| parse_int(utf8(v)?.as_str()));
        self.register(Bytes, Float, |v| parse_float(utf8(v)?.as_str()));
        self.register(Bytes, Bool, |v| parse_bool(utf8(v)?.as_str()));
        self.register(Int, Bytes, |v| Ok(Value::Bytes(v.to_string().into_bytes())));
        self.register(Float, Bytes, |v| Ok(Value::Bytes(v.to_string().into_bytes())));
        self.register(Int, Float, |v| {
            let i = v.as_i64().unwrap_or_default();
            #[allow(clippy::cast_precision_loss)]
            let f = i as f64;
            Ok(Value::Float(f))
        });
        self.register(Float, Int, |v| {
            let f = v.as_f64().unwrap_or_default();
            if f.fract() != 0.0 || !f.is_finite() || f.abs() > 9.007_199_254_740_992e15 {
                return Err(TypeError::Lossy {
                    value: f.to_string(),
                    to: Int,
                });
            }
            #[allow(clippy::cast_possible_truncation)]
            let i = f as i64;
            Ok(Value::Int(i))
        });
        self.register(Int, Bool, |v| Ok(Value::Bool(v.as_i64().unwrap_or_default() != 0)));
        self.register(Bool, Int, |v| Ok(Value::Int(i64::from(v.as_bool().unwrap_or_default()))));
        self
    }
}

impl Default for ConversionService {
    /// The default table with byte/text/numeric/bool coercions installed.
    fn default() -> Self {
        Self::empty().with_defaults()
    }
}

impl fmt::Debug for ConversionService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversionService")
            .field("converters", &self.converters.len())
            .finish()
    }
}

fn utf8(v: &Value) -> TypeResult<String> {
    String::from_utf8(v.as_bytes().unwrap_or_default().to_vec())
        .map_err(|e| TypeError::InvalidUtf8(e.to_string()))
}

fn parse_int(s: &str) -> TypeResult<Value> {
    s.trim()
        .parse::<i64>()
        .map(Value::Int)
        .map_err(|_| TypeError::Parse {
            value: s.to_string(),
            to: ValueType::Int,
        })
}

fn parse_float(s: &str) -> TypeResult<Value> {
    s.trim()
        .parse::<f64>()
        .map(Value::Float)
        .map_err(|_| TypeError::Parse {
            value: s.to_string(),
            to: ValueType::Float,
        })
}

fn parse_bool(s: &str) -> TypeResult<Value> {
    match s.trim() {
        "true" | "1" => Ok(Value::Bool(true)),
        "false" | "0" => Ok(Value::Bool(false)),
        other => Err(TypeError::Parse {
            value: other.to_string(),
            to: ValueType::Bool,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn null_converts_to_null_for_any_target() {
        let conv = ConversionService::default();
        assert_eq!(conv.convert(&Value::Null, ValueType::Int).unwrap(), Value::Null);
        assert_eq!(conv.convert(&Value::Null, ValueType::Bytes).unwrap(), Value::Null);
    }

    #[test]
    fn bytes_to_numeric_goes_through_utf8() {
        let conv = ConversionService::default();
        let stored = Value::Bytes(b"42".to_vec());
        assert_eq!(conv.convert(&stored, ValueType::Int).unwrap(), Value::Int(42));
        assert_eq!(
            conv.convert(&stored, ValueType::Text).unwrap(),
            Value::Text("42".into())
        );
    }

    #[test]
    fn invalid_utf8_is_reported() {
        let conv = ConversionService::default();
        let err = conv
            .convert(&Value::Bytes(vec![0xff, 0xfe]), ValueType::Text)
            .unwrap_err();
        assert!(matches!(err, TypeError::InvalidUtf8(_)));
    }

    #[test]
    fn unparsable_text_is_a_parse_error() {
        let conv = ConversionService::default();
        let err = conv.convert(&Value::from("abc"), ValueType::Int).unwrap_err();
        assert_eq!(
            err,
            TypeError::Parse {
                value: "abc".into(),
                to: ValueType::Int
            }
        );
    }

    #[test]
    fn fractional_float_to_int_is_lossy() {
        let conv = ConversionService::default();
        assert!(matches!(
            conv.convert(&Value::Float(1.5), ValueType::Int),
            Err(TypeError::Lossy { .. })
        ));
        assert_eq!(
            conv.convert(&Value::Float(3.0), ValueType::Int).unwrap(),
            Value::Int(3)
        );
    }

    #[test]
    fn empty_table_rejects_cross_type_conversion() {
        let conv = ConversionService::empty();
        assert!(!conv.can_convert(ValueType::Text, ValueType::Int));
        assert!(conv.can_convert(ValueType::Text, ValueType::Text));
        assert!(conv.can_convert(ValueType::Text, ValueType::Any));
        assert_eq!(
            conv.convert(&Value::from("1"), ValueType::Int).unwrap_err(),
            TypeError::Unsupported {
                from: ValueType::Text,
                to: ValueType::Int
            }
        );
    }

    #[test]
    fn custom_converter_overrides_default() {
        let mut conv = ConversionService::default();
        conv.register(ValueType::Text, ValueType::Int, |v| {
            Ok(Value::Int(v.as_str().map_or(0, |s| s.len() as i64)))
        });
        assert_eq!(
            conv.convert(&Value::from("hello"), ValueType::Int).unwrap(),
            Value::Int(5)
        );
    }

    #[test]
    fn convert_owned_skips_matching_type() {
        let conv = ConversionService::empty();
        let v = conv.convert_owned(Value::from("x"), ValueType::Text).unwrap();
        assert_eq!(v, Value::Text("x".into()));
    }

    proptest! {
        #[test]
        fn int_survives_storage_as_bytes(n in any::<i64>()) {
            let conv = ConversionService::default();
            let stored = conv.convert(&Value::Int(n), ValueType::Bytes).unwrap();
            prop_assert_eq!(conv.convert(&stored, ValueType::Int).unwrap(), Value::Int(n));
        }

        #[test]
        fn text_to_bytes_preserves_content(s in ".*") {
            let conv = ConversionService::default();
            let bytes = conv.convert(&Value::Text(s.clone()), ValueType::Bytes).unwrap();
            prop_assert_eq!(bytes.as_bytes().unwrap(), s.as_bytes());
        }
    }
}
