//! The [`FieldValue`] trait: values that can live in a halo field.

use std::io::{Read, Write};

use crate::codec;
use crate::error::WireError;

/// A value stored in a halo field.
///
/// Field values cross process boundaries in halo packets, migration
/// envelopes and remote-fetch replies, so every value type knows how to
/// write itself to and read itself from the wire.
pub trait FieldValue: Clone + Send + Sync + 'static {
    /// Serialize the value.
    fn encode(&self, w: &mut dyn Write) -> Result<(), WireError>;

    /// Deserialize a value written by [`encode`](FieldValue::encode).
    fn decode(r: &mut dyn Read) -> Result<Self, WireError>;

    /// Serialize into a fresh buffer.
    fn to_bytes(&self) -> Result<Vec<u8>, WireError> {
        let mut buf = Vec::new();
        self.encode(&mut buf)?;
        Ok(buf)
    }

    /// Deserialize from a complete buffer, rejecting trailing bytes.
    fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        let mut cursor = bytes;
        let value = Self::decode(&mut cursor)?;
        if !cursor.is_empty() {
            return Err(WireError::Malformed {
                detail: format!("{} trailing bytes after value", cursor.len()),
            });
        }
        Ok(value)
    }
}

macro_rules! impl_field_value {
    ($ty:ty, $write:ident, $read:ident) => {
        impl FieldValue for $ty {
            fn encode(&self, w: &mut dyn Write) -> Result<(), WireError> {
                codec::$write(w, *self)
            }

            fn decode(r: &mut dyn Read) -> Result<Self, WireError> {
                codec::$read(r)
            }
        }
    };
}

impl_field_value!(u8, write_u8, read_u8);
impl_field_value!(u32, write_u32_le, read_u32_le);
impl_field_value!(u64, write_u64_le, read_u64_le);
impl_field_value!(i32, write_i32_le, read_i32_le);
impl_field_value!(i64, write_i64_le, read_i64_le);
impl_field_value!(f32, write_f32_le, read_f32_le);
impl_field_value!(f64, write_f64_le, read_f64_le);

impl FieldValue for bool {
    fn encode(&self, w: &mut dyn Write) -> Result<(), WireError> {
        codec::write_u8(w, u8::from(*self))
    }

    fn decode(r: &mut dyn Read) -> Result<Self, WireError> {
        match codec::read_u8(r)? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(WireError::Malformed {
                detail: format!("invalid bool byte {other}"),
            }),
        }
    }
}

impl<T: FieldValue> FieldValue for Option<T> {
    fn encode(&self, w: &mut dyn Write) -> Result<(), WireError> {
        match self {
            None => codec::write_u8(w, 0),
            Some(v) => {
                codec::write_u8(w, 1)?;
                v.encode(w)
            }
        }
    }

    fn decode(r: &mut dyn Read) -> Result<Self, WireError> {
        match codec::read_u8(r)? {
            0 => Ok(None),
            1 => Ok(Some(T::decode(r)?)),
            other => Err(WireError::Malformed {
                detail: format!("invalid option tag {other}"),
            }),
        }
    }
}

impl<T: FieldValue> FieldValue for Vec<T> {
    fn encode(&self, w: &mut dyn Write) -> Result<(), WireError> {
        codec::write_len(w, self.len())?;
        for v in self {
            v.encode(w)?;
        }
        Ok(())
    }

    fn decode(r: &mut dyn Read) -> Result<Self, WireError> {
        let len = codec::read_len(r)?;
        let mut out = Vec::with_capacity(len.min(4096));
        for _ in 0..len {
            out.push(T::decode(r)?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut bytes = 7u32.to_bytes().unwrap();
        bytes.push(0);
        assert!(u32::from_bytes(&bytes).is_err());
    }

    #[test]
    fn optional_values_keep_emptiness() {
        let none: Option<f64> = None;
        assert_eq!(Option::<f64>::from_bytes(&none.to_bytes().unwrap()).unwrap(), None);
        let some = Some(2.5f64);
        assert_eq!(Option::<f64>::from_bytes(&some.to_bytes().unwrap()).unwrap(), some);
    }

    #[test]
    fn bad_bool_byte_is_malformed() {
        assert!(bool::from_bytes(&[2]).is_err());
    }
}
