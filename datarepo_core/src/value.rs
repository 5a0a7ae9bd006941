use std::cmp::Ordering;
use std::fmt;

/// A type-safe representation of a database parameter value.
/// Used to pass values to generic repository methods, to carry record columns
/// between engines and mappers, and to hold generated keys.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    String(String),
    I32(i32),
    I64(i64),
    F64(f64),
    Bool(bool),
    /// Represents a NULL value.
    Null,
    /// A list bound to an `in` predicate.
    List(Vec<ParamValue>),
}

impl ParamValue {
    pub fn is_null(&self) -> bool {
        matches!(self, ParamValue::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ParamValue::I32(v) => Some(i64::from(*v)),
            ParamValue::I64(v) => Some(*v),
            ParamValue::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::F64(v) => Some(*v),
            // i64 -> f64 may lose precision for huge keys; only used for comparisons.
            other => other.as_i64().map(|v| v as f64),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Compare two non-null values. Integers, floats and booleans compare numerically
    /// across variants; strings compare lexically. `None` when incomparable or either is null.
    pub fn compare(&self, other: &ParamValue) -> Option<Ordering> {
        match (self, other) {
            (ParamValue::Null, _) | (_, ParamValue::Null) => None,
            (ParamValue::String(a), ParamValue::String(b)) => Some(a.cmp(b)),
            (ParamValue::F64(_), _) | (_, ParamValue::F64(_)) => {
                self.as_f64()?.partial_cmp(&other.as_f64()?)
            }
            _ => Some(self.as_i64()?.cmp(&other.as_i64()?)),
        }
    }

    /// The identity key this value denotes, if it can serve as one.
    pub fn entity_key(&self) -> Option<EntityKey> {
        match self {
            ParamValue::String(s) => Some(EntityKey::Text(s.clone())),
            ParamValue::I32(_) | ParamValue::I64(_) => self.as_i64().map(EntityKey::Int),
            _ => None,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::String(s) => write!(f, "'{s}'"),
            ParamValue::I32(v) => write!(f, "{v}"),
            ParamValue::I64(v) => write!(f, "{v}"),
            ParamValue::F64(v) => write!(f, "{v}"),
            ParamValue::Bool(v) => write!(f, "{v}"),
            ParamValue::Null => f.write_str("null"),
            ParamValue::List(items) => {
                f.write_str("(")?;
                for (i, v) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{v}")?;
                }
                f.write_str(")")
            }
        }
    }
}

macro_rules! impl_from_scalar {
    ($($t:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$t> for ParamValue {
                fn from(v: $t) -> Self {
                    ParamValue::$variant(v)
                }
            }
        )*
    };
}

impl_from_scalar!(String => String, i32 => I32, i64 => I64, f64 => F64, bool => Bool);

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::String(v.to_string())
    }
}

impl From<&String> for ParamValue {
    fn from(v: &String) -> Self {
        ParamValue::String(v.clone())
    }
}

impl<T: Into<ParamValue>> From<Option<T>> for ParamValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(ParamValue::Null)
    }
}

impl<T: Into<ParamValue>> From<Vec<T>> for ParamValue {
    fn from(v: Vec<T>) -> Self {
        ParamValue::List(v.into_iter().map(Into::into).collect())
    }
}

/// Identity of a persisted row, used as the persistence-context key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityKey {
    Int(i64),
    Text(String),
}

impl EntityKey {
    pub fn to_param(&self) -> ParamValue {
        match self {
            EntityKey::Int(v) => ParamValue::I64(*v),
            EntityKey::Text(s) => ParamValue::String(s.clone()),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKey::Int(v) => write!(f, "{v}"),
            EntityKey::Text(s) => f.write_str(s),
        }
    }
}

/// A value could not be converted into the requested Rust type.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot convert {found} into {expected}")]
pub struct ConversionError {
    pub expected: &'static str,
    pub found: String,
}

impl ConversionError {
    fn new(expected: &'static str, found: &ParamValue) -> Self {
        Self {
            expected,
            found: format!("{found:?}"),
        }
    }
}

/// Conversion out of a [`ParamValue`]; the inverse of `Into<ParamValue>`.
pub trait FromParamValue: Sized {
    fn from_param(value: &ParamValue) -> Result<Self, ConversionError>;
}

impl FromParamValue for ParamValue {
    fn from_param(value: &ParamValue) -> Result<Self, ConversionError> {
        Ok(value.clone())
    }
}

impl FromParamValue for i64 {
    fn from_param(value: &ParamValue) -> Result<Self, ConversionError> {
        value
            .as_i64()
            .ok_or_else(|| ConversionError::new("i64", value))
    }
}

impl FromParamValue for i32 {
    fn from_param(value: &ParamValue) -> Result<Self, ConversionError> {
        value
            .as_i64()
            .and_then(|v| i32::try_from(v).ok())
            .ok_or_else(|| ConversionError::new("i32", value))
    }
}

impl FromParamValue for f64 {
    fn from_param(value: &ParamValue) -> Result<Self, ConversionError> {
        value
            .as_f64()
            .ok_or_else(|| ConversionError::new("f64", value))
    }
}

impl FromParamValue for bool {
    fn from_param(value: &ParamValue) -> Result<Self, ConversionError> {
        match value {
            ParamValue::Bool(b) => Ok(*b),
            // SQLite stores booleans as 0/1 integers.
            ParamValue::I32(0) | ParamValue::I64(0) => Ok(false),
            ParamValue::I32(1) | ParamValue::I64(1) => Ok(true),
            other => Err(ConversionError::new("bool", other)),
        }
    }
}

impl FromParamValue for String {
    fn from_param(value: &ParamValue) -> Result<Self, ConversionError> {
        match value {
            ParamValue::String(s) => Ok(s.clone()),
            other => Err(ConversionError::new("String", other)),
        }
    }
}

impl<T: FromParamValue> FromParamValue for Option<T> {
    fn from_param(value: &ParamValue) -> Result<Self, ConversionError> {
        match value {
            ParamValue::Null => Ok(None),
            other => T::from_param(other).map(Some),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn from_impls_cover_options_and_lists() {
        assert_eq!(ParamValue::from(Some(3_i32)), ParamValue::I32(3));
        assert_eq!(ParamValue::from(None::<String>), ParamValue::Null);
        assert_eq!(
            ParamValue::from(vec!["a", "b"]),
            ParamValue::List(vec!["a".into(), "b".into()])
        );
    }

    #[test]
    fn compare_is_numeric_across_variants() {
        assert_eq!(
            ParamValue::I32(20).compare(&ParamValue::I64(15)),
            Some(Ordering::Greater)
        );
        assert_eq!(
            ParamValue::F64(1.5).compare(&ParamValue::I32(2)),
            Some(Ordering::Less)
        );
        assert_eq!(ParamValue::Null.compare(&ParamValue::I32(1)), None);
        assert_eq!(ParamValue::String("a".into()).compare(&ParamValue::I32(1)), None);
    }

    #[test]
    fn bool_accepts_sqlite_integers() {
        assert!(bool::from_param(&ParamValue::I64(1)).unwrap());
        assert!(!bool::from_param(&ParamValue::I64(0)).unwrap());
        assert!(bool::from_param(&ParamValue::I64(2)).is_err());
    }

    #[test]
    fn narrowing_to_i32_checks_range() {
        assert_eq!(i32::from_param(&ParamValue::I64(42)).unwrap(), 42);
        let err = i32::from_param(&ParamValue::I64(i64::MAX)).unwrap_err();
        assert_eq!(err.expected, "i32");
    }

    #[test]
    fn keys_from_integer_variants_are_equal() {
        assert_eq!(
            ParamValue::I32(7).entity_key(),
            ParamValue::I64(7).entity_key()
        );
        assert_eq!(ParamValue::Null.entity_key(), None);
    }

    proptest! {
        #[test]
        fn integer_compare_matches_native(a in any::<i32>(), b in any::<i64>()) {
            let got = ParamValue::I32(a).compare(&ParamValue::I64(b));
            prop_assert_eq!(got, Some(i64::from(a).cmp(&b)));
        }

        #[test]
        fn option_string_survives_conversion(s in proptest::option::of("[a-z]{0,8}")) {
            let v = ParamValue::from(s.clone());
            prop_assert_eq!(Option::<String>::from_param(&v).unwrap(), s);
        }
    }
}
