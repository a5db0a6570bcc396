//! Type-tagged value carrier for data crossing the CA callback boundary.
//!
//! A [`Generic`] holds one of the primitive kinds CA can deliver, always as an
//! owned array (a scalar is an array of one). The active kind is reported by
//! [`Generic::get_type`], and only the accessors for that kind succeed. Asking
//! for any other kind is a [`GenericError::TypeMismatch`], never a silently
//! zeroed value.
//!
//! Kinds map onto the CA basic types as follows:
//! - [`Generic::String`] - `DBR_STRING`
//! - [`Generic::Short`] - `DBR_SHORT`
//! - [`Generic::UnsignedShort`] - `DBR_ENUM`
//! - [`Generic::UnsignedChar`] - `DBR_CHAR`
//! - [`Generic::Long`] - `DBR_LONG`
//! - [`Generic::UnsignedLong`] - written as `DBR_LONG`, never received
//! - [`Generic::Float`] - `DBR_FLOAT`
//! - [`Generic::Double`] - `DBR_DOUBLE`
use num::{NumCast, ToPrimitive};
use std::fmt;
use thiserror::Error;

/// The active kind of a [`Generic`]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum GenericType {
    String,
    Short,
    UnsignedShort,
    UnsignedChar,
    Long,
    UnsignedLong,
    Float,
    Double,
    /// No value has been received yet
    Unknown,
}

impl fmt::Display for GenericType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GenericType::String => "STRING",
            GenericType::Short => "SHORT",
            GenericType::UnsignedShort => "UNSIGNED_SHORT",
            GenericType::UnsignedChar => "UNSIGNED_CHAR",
            GenericType::Long => "LONG",
            GenericType::UnsignedLong => "UNSIGNED_LONG",
            GenericType::Float => "FLOAT",
            GenericType::Double => "DOUBLE",
            GenericType::Unknown => "UNKNOWN",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GenericError {
    #[error("Requested {requested} value but holding {actual}")]
    TypeMismatch {
        requested: GenericType,
        actual: GenericType,
    },
    #[error("Requested a single {0} value from an empty array")]
    Empty(GenericType),
    #[error("Cannot convert {from} value to {to}")]
    NoConvert { from: GenericType, to: GenericType },
    #[error("Cannot parse '{0}' as a number")]
    CannotParse(String),
}

/// A CA value of one primitive kind, owning its elements
#[derive(Clone, Debug, PartialEq)]
pub enum Generic {
    String(Vec<String>),
    Short(Vec<i16>),
    UnsignedShort(Vec<u16>),
    UnsignedChar(Vec<u8>),
    Long(Vec<i32>),
    UnsignedLong(Vec<u32>),
    Float(Vec<f32>),
    Double(Vec<f64>),
}

impl Generic {
    pub fn get_type(&self) -> GenericType {
        match self {
            Generic::String(_) => GenericType::String,
            Generic::Short(_) => GenericType::Short,
            Generic::UnsignedShort(_) => GenericType::UnsignedShort,
            Generic::UnsignedChar(_) => GenericType::UnsignedChar,
            Generic::Long(_) => GenericType::Long,
            Generic::UnsignedLong(_) => GenericType::UnsignedLong,
            Generic::Float(_) => GenericType::Float,
            Generic::Double(_) => GenericType::Double,
        }
    }

    /// Number of elements held
    pub fn array_count(&self) -> usize {
        match self {
            Generic::String(v) => v.len(),
            Generic::Short(v) => v.len(),
            Generic::UnsignedShort(v) => v.len(),
            Generic::UnsignedChar(v) => v.len(),
            Generic::Long(v) => v.len(),
            Generic::UnsignedLong(v) => v.len(),
            Generic::Float(v) => v.len(),
            Generic::Double(v) => v.len(),
        }
    }

    fn mismatch(&self, requested: GenericType) -> GenericError {
        GenericError::TypeMismatch {
            requested,
            actual: self.get_type(),
        }
    }

    /// The first string held
    pub fn get_string(&self) -> Result<&str, GenericError> {
        match self {
            Generic::String(v) => v
                .first()
                .map(String::as_str)
                .ok_or(GenericError::Empty(GenericType::String)),
            _ => Err(self.mismatch(GenericType::String)),
        }
    }

    pub fn get_string_array(&self) -> Result<&[String], GenericError> {
        match self {
            Generic::String(v) => Ok(v),
            _ => Err(self.mismatch(GenericType::String)),
        }
    }

    /// Every element formatted as text
    pub fn to_strings(&self) -> Vec<String> {
        fn _fmt<T: ToString>(v: &[T]) -> Vec<String> {
            v.iter().map(ToString::to_string).collect()
        }
        match self {
            Generic::String(v) => v.clone(),
            Generic::Short(v) => _fmt(v),
            Generic::UnsignedShort(v) => _fmt(v),
            Generic::UnsignedChar(v) => _fmt(v),
            Generic::Long(v) => _fmt(v),
            Generic::UnsignedLong(v) => _fmt(v),
            Generic::Float(v) => _fmt(v),
            Generic::Double(v) => _fmt(v),
        }
    }

    /// Convert numerically to another kind
    ///
    /// Fails if any element is out of range for the target kind, or if a
    /// fractional value would be truncated to an integer. Floating point
    /// targets round to the nearest value they hold. Strings only convert to
    /// themselves; use [`Generic::parse_into`] for those.
    pub fn convert_to(&self, kind: GenericType) -> Result<Generic, GenericError> {
        /// Utility function so that we don't have to repeat the map iter conversion
        fn _try_convert_vec<T, U>(
            from: &[T],
            exact: bool,
            err: &GenericError,
        ) -> Result<Vec<U>, GenericError>
        where
            T: Copy + NumCast,
            U: NumCast,
        {
            from.iter()
                .map(|n| {
                    let converted: U = NumCast::from(*n).ok_or_else(|| err.clone())?;
                    if exact && converted.to_f64() != n.to_f64() {
                        return Err(err.clone());
                    }
                    Ok(converted)
                })
                .collect()
        }
        macro_rules! convert_numeric {
            ($value:expr, $variant:ident, $exact:expr, $err:ident) => {
                match $value {
                    Generic::Short(v) => Generic::$variant(_try_convert_vec(v, $exact, &$err)?),
                    Generic::UnsignedShort(v) => {
                        Generic::$variant(_try_convert_vec(v, $exact, &$err)?)
                    }
                    Generic::UnsignedChar(v) => {
                        Generic::$variant(_try_convert_vec(v, $exact, &$err)?)
                    }
                    Generic::Long(v) => Generic::$variant(_try_convert_vec(v, $exact, &$err)?),
                    Generic::UnsignedLong(v) => {
                        Generic::$variant(_try_convert_vec(v, $exact, &$err)?)
                    }
                    Generic::Float(v) => Generic::$variant(_try_convert_vec(v, $exact, &$err)?),
                    Generic::Double(v) => Generic::$variant(_try_convert_vec(v, $exact, &$err)?),
                    Generic::String(_) => return Err($err),
                }
            };
        }

        if self.get_type() == kind {
            return Ok(self.clone());
        }
        let err = GenericError::NoConvert {
            from: self.get_type(),
            to: kind,
        };
        Ok(match kind {
            GenericType::Short => convert_numeric!(self, Short, true, err),
            GenericType::UnsignedShort => convert_numeric!(self, UnsignedShort, true, err),
            GenericType::UnsignedChar => convert_numeric!(self, UnsignedChar, true, err),
            GenericType::Long => convert_numeric!(self, Long, true, err),
            GenericType::UnsignedLong => convert_numeric!(self, UnsignedLong, true, err),
            GenericType::Float => convert_numeric!(self, Float, false, err),
            GenericType::Double => convert_numeric!(self, Double, false, err),
            GenericType::String | GenericType::Unknown => return Err(err),
        })
    }

    /// Parse a string value into a numeric kind
    ///
    /// Anything other than a [`Generic::String`] is converted with
    /// [`Generic::convert_to`] instead.
    pub fn parse_into(&self, kind: GenericType) -> Result<Generic, GenericError> {
        fn _parse_vec<U: std::str::FromStr>(from: &[String]) -> Result<Vec<U>, GenericError> {
            from.iter()
                .map(|s| {
                    s.trim()
                        .parse()
                        .map_err(|_| GenericError::CannotParse(s.clone()))
                })
                .collect()
        }
        let Generic::String(val) = self else {
            return self.convert_to(kind);
        };
        Ok(match kind {
            GenericType::String => self.clone(),
            GenericType::Short => Generic::Short(_parse_vec(val)?),
            GenericType::UnsignedShort => Generic::UnsignedShort(_parse_vec(val)?),
            GenericType::UnsignedChar => Generic::UnsignedChar(_parse_vec(val)?),
            GenericType::Long => Generic::Long(_parse_vec(val)?),
            GenericType::UnsignedLong => Generic::UnsignedLong(_parse_vec(val)?),
            GenericType::Float => Generic::Float(_parse_vec(val)?),
            GenericType::Double => Generic::Double(_parse_vec(val)?),
            GenericType::Unknown => {
                return Err(GenericError::NoConvert {
                    from: GenericType::String,
                    to: kind,
                });
            }
        })
    }
}

/// Implement construction and typed access for one numeric kind
macro_rules! impl_generic_kind {
    ($variant:ident, $typ:ty, $get:ident, $get_array:ident) => {
        impl From<$typ> for Generic {
            fn from(value: $typ) -> Self {
                Generic::$variant(vec![value])
            }
        }
        impl From<Vec<$typ>> for Generic {
            fn from(value: Vec<$typ>) -> Self {
                Generic::$variant(value)
            }
        }
        impl From<&[$typ]> for Generic {
            fn from(value: &[$typ]) -> Self {
                Generic::$variant(value.to_vec())
            }
        }
        impl Generic {
            pub fn $get(&self) -> Result<$typ, GenericError> {
                match self {
                    Generic::$variant(v) => v
                        .first()
                        .copied()
                        .ok_or(GenericError::Empty(GenericType::$variant)),
                    _ => Err(self.mismatch(GenericType::$variant)),
                }
            }
            pub fn $get_array(&self) -> Result<&[$typ], GenericError> {
                match self {
                    Generic::$variant(v) => Ok(v),
                    _ => Err(self.mismatch(GenericType::$variant)),
                }
            }
        }
    };
}
impl_generic_kind!(Short, i16, get_short, get_short_array);
impl_generic_kind!(UnsignedShort, u16, get_unsigned_short, get_unsigned_short_array);
impl_generic_kind!(UnsignedChar, u8, get_unsigned_char, get_unsigned_char_array);
impl_generic_kind!(Long, i32, get_long, get_long_array);
impl_generic_kind!(UnsignedLong, u32, get_unsigned_long, get_unsigned_long_array);
impl_generic_kind!(Float, f32, get_float, get_float_array);
impl_generic_kind!(Double, f64, get_double, get_double_array);

impl fmt::Display for Generic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let strings = self.to_strings();
        match strings.as_slice() {
            [single] => f.write_str(single),
            many => write!(f, "[{}]", many.join(", ")),
        }
    }
}

impl From<String> for Generic {
    fn from(value: String) -> Self {
        Generic::String(vec![value])
    }
}
impl From<&str> for Generic {
    fn from(value: &str) -> Self {
        Generic::String(vec![value.to_string()])
    }
}
impl From<Vec<String>> for Generic {
    fn from(value: Vec<String>) -> Self {
        Generic::String(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_accessor_returns_value() {
        assert_eq!(Generic::from(3.14f64).get_double().unwrap(), 3.14);
        assert_eq!(Generic::from(-4i16).get_short().unwrap(), -4);
        assert_eq!(Generic::from(7u16).get_unsigned_short().unwrap(), 7);
        assert_eq!(Generic::from(200u8).get_unsigned_char().unwrap(), 200);
        assert_eq!(Generic::from(-70000i32).get_long().unwrap(), -70000);
        assert_eq!(Generic::from(4_000_000_000u32).get_unsigned_long().unwrap(), 4_000_000_000);
        assert_eq!(Generic::from(1.5f32).get_float().unwrap(), 1.5);
        assert_eq!(Generic::from("TEST").get_string().unwrap(), "TEST");
    }

    #[test]
    fn wrong_accessor_is_type_mismatch() {
        let v = Generic::from(3.14f64);
        assert_eq!(
            v.get_short(),
            Err(GenericError::TypeMismatch {
                requested: GenericType::Short,
                actual: GenericType::Double
            })
        );
        assert!(matches!(
            v.get_string(),
            Err(GenericError::TypeMismatch { .. })
        ));
        assert!(v.get_float_array().is_err());
        assert!(Generic::from("x").get_double().is_err());
    }

    #[test]
    fn arrays_are_deep_copied() {
        let original = Generic::from(vec![1i32, 2, 3]);
        let mut copy = original.clone();
        if let Generic::Long(v) = &mut copy {
            v[0] = 100;
        }
        assert_eq!(original.get_long_array().unwrap(), &[1, 2, 3]);
        assert_eq!(copy.get_long().unwrap(), 100);
        assert_eq!(original.array_count(), 3);
    }

    #[test]
    fn empty_array_scalar_access() {
        let v = Generic::Double(Vec::new());
        assert_eq!(v.get_double(), Err(GenericError::Empty(GenericType::Double)));
        assert_eq!(v.get_double_array().unwrap(), &[] as &[f64]);
    }

    #[test]
    fn conversions() {
        let v = Generic::from(vec![500i32]);
        assert_eq!(v.convert_to(GenericType::Short).unwrap(), Generic::from(500i16));
        assert!(v.convert_to(GenericType::UnsignedChar).is_err());
        assert_eq!(
            Generic::from(455.9f32).convert_to(GenericType::Long),
            Err(GenericError::NoConvert {
                from: GenericType::Float,
                to: GenericType::Long
            })
        );
        assert_eq!(
            Generic::from(vec![455.0f64, -2.0]).convert_to(GenericType::Short).unwrap(),
            Generic::from(vec![455i16, -2])
        );
        assert!(Generic::from(f64::NAN).convert_to(GenericType::Long).is_err());
        assert_eq!(
            Generic::from(0.1f64).convert_to(GenericType::Float).unwrap(),
            Generic::from(0.1f32)
        );
        assert!(Generic::from("1").convert_to(GenericType::Long).is_err());
        assert_eq!(
            Generic::from(" 2.5 ").parse_into(GenericType::Double).unwrap(),
            Generic::from(2.5f64)
        );
        assert_eq!(
            Generic::from("abc").parse_into(GenericType::Long),
            Err(GenericError::CannotParse("abc".to_string()))
        );
    }

    #[test]
    fn display() {
        assert_eq!(Generic::from(3.5f64).to_string(), "3.5");
        assert_eq!(Generic::from(vec![1i16, 2]).to_string(), "[1, 2]");
        assert_eq!(Generic::from("On").to_string(), "On");
    }
}
