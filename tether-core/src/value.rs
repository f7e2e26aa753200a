use std::fmt::{self, Display};

/// A single cell returned by a driver.
#[derive(Default, Debug, Clone, PartialEq)]
pub enum Value {
    #[default]
    Null,
    Int64(i64),
    Float64(f64),
    Varchar(String),
    Blob(Box<[u8]>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int64(v) => Some(*v),
            _ => None,
        }
    }
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float64(v) => Some(*v),
            Value::Int64(v) => Some(*v as f64),
            _ => None,
        }
    }
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Varchar(v) => Some(v),
            _ => None,
        }
    }
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Blob(v) => Some(v),
            _ => None,
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Int64(v) => write!(f, "{}", v),
            Value::Float64(v) => write!(f, "{}", v),
            Value::Varchar(v) => write!(f, "'{}'", v.replace('\'', "''")),
            Value::Blob(v) => {
                f.write_str("X'")?;
                for b in v.iter() {
                    write!(f, "{:02X}", b)?;
                }
                f.write_str("'")
            }
        }
    }
}

macro_rules! impl_from_value {
    ($variant:ident, $($source:ty => $conv:expr),+ $(,)?) => {
        $(
            impl From<$source> for Value {
                fn from(value: $source) -> Self {
                    Value::$variant($conv(value))
                }
            }
        )+
    };
}

impl_from_value!(Int64, i8 => i64::from, i16 => i64::from, i32 => i64::from, i64 => |v| v, u8 => i64::from, u16 => i64::from, u32 => i64::from);
impl_from_value!(Float64, f32 => f64::from, f64 => |v| v);
impl_from_value!(Varchar, String => |v| v, &str => str::to_owned);
impl_from_value!(Blob, Vec<u8> => Vec::into_boxed_slice, &[u8] => |v: &[u8]| v.into());

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Int64(value as i64)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_as_sql_literal() {
        assert_eq!(Value::Null.to_string(), "NULL");
        assert_eq!(Value::from(42u8).to_string(), "42");
        assert_eq!(Value::from("it's").to_string(), "'it''s'");
        assert_eq!(Value::from(vec![0x0a, 0xff]).to_string(), "X'0AFF'");
        assert_eq!(Value::from(None::<i32>), Value::Null);
        assert_eq!(Value::from(true), Value::Int64(1));
    }

    #[test]
    fn accessors() {
        assert_eq!(Value::Int64(5).as_i64(), Some(5));
        assert_eq!(Value::Int64(5).as_f64(), Some(5.0));
        assert_eq!(Value::from("x").as_str(), Some("x"));
        assert_eq!(Value::from("x").as_i64(), None);
        assert!(Value::Null.is_null());
    }
}
