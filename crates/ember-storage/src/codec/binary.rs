//! Length-prefixed big-endian row encoding.
//!
//! Each field starts with a presence byte (0 = NULL, 1 = value). Fixed
//! width types follow in big-endian order; character and binary data are
//! a `u32` length followed by the bytes.

use bytes::{Buf, BufMut, BytesMut};
use ember_common::{DataType, EmberError, EmberResult, Value};

use super::{corrupt, RowCodec};

/// The default binary row format.
#[derive(Debug, Clone, Copy, Default)]
pub struct BinaryCodec;

impl BinaryCodec {
    /// Registry tag.
    pub const TAG: &'static str = "binary";
}

impl RowCodec for BinaryCodec {
    fn tag(&self) -> &'static str {
        Self::TAG
    }

    fn encode(&self, values: &[Value], types: &[DataType], out: &mut BytesMut) -> EmberResult<()> {
        if values.len() != types.len() {
            return Err(EmberError::internal(format!(
                "row has {} values for {} columns",
                values.len(),
                types.len()
            )));
        }

        for (value, ty) in values.iter().zip(types) {
            if value.is_null() {
                out.put_u8(0);
                continue;
            }
            out.put_u8(1);
            match (ty, value.convert_to(ty)?) {
                (DataType::Boolean, Value::Boolean(b)) => out.put_u8(u8::from(b)),
                (DataType::Integer, Value::Integer(i)) => out.put_i32(i),
                (DataType::BigInt, Value::BigInt(i)) => out.put_i64(i),
                (DataType::Timestamp, Value::Timestamp(t)) => out.put_i64(t),
                (DataType::Double, Value::Double(d)) => out.put_f64(d),
                (DataType::Char(_) | DataType::Varchar(_), Value::String(s)) => {
                    out.put_u32(s.len() as u32);
                    out.extend_from_slice(s.as_bytes());
                }
                (DataType::Binary, Value::Binary(b)) => {
                    out.put_u32(b.len() as u32);
                    out.extend_from_slice(&b);
                }
                (ty, v) => {
                    return Err(EmberError::TypeMismatch {
                        expected: ty.to_string(),
                        actual: v.type_name().to_string(),
                    })
                }
            }
        }
        Ok(())
    }

    fn decode(&self, bytes: &[u8], types: &[DataType]) -> EmberResult<Vec<Value>> {
        let mut buf = bytes;
        let mut values = Vec::with_capacity(types.len());

        for ty in types {
            if buf.remaining() < 1 {
                return Err(corrupt("truncated presence byte"));
            }
            if buf.get_u8() == 0 {
                values.push(Value::Null);
                continue;
            }

            let need = match ty {
                DataType::Boolean => 1,
                DataType::Integer => 4,
                DataType::BigInt | DataType::Timestamp | DataType::Double => 8,
                DataType::Char(_) | DataType::Varchar(_) | DataType::Binary => 4,
            };
            if buf.remaining() < need {
                return Err(corrupt("truncated field"));
            }

            let value = match ty {
                DataType::Boolean => Value::Boolean(buf.get_u8() != 0),
                DataType::Integer => Value::Integer(buf.get_i32()),
                DataType::BigInt => Value::BigInt(buf.get_i64()),
                DataType::Timestamp => Value::Timestamp(buf.get_i64()),
                DataType::Double => Value::Double(buf.get_f64()),
                DataType::Char(_) | DataType::Varchar(_) | DataType::Binary => {
                    let len = buf.get_u32() as usize;
                    if buf.remaining() < len {
                        return Err(corrupt("truncated variable length field"));
                    }
                    let data = buf[..len].to_vec();
                    buf.advance(len);
                    if *ty == DataType::Binary {
                        Value::Binary(data)
                    } else {
                        Value::String(String::from_utf8(data).map_err(|_| corrupt("invalid UTF-8"))?)
                    }
                }
            };
            values.push(value);
        }
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn types() -> Vec<DataType> {
        vec![
            DataType::Integer,
            DataType::Varchar(20),
            DataType::Double,
            DataType::Binary,
            DataType::Boolean,
        ]
    }

    #[test]
    fn test_mixed_row() {
        let row = vec![
            Value::Integer(-3),
            Value::string("héllo"),
            Value::Null,
            Value::Binary(vec![0, 255]),
            Value::Boolean(true),
        ];
        let mut out = BytesMut::new();
        BinaryCodec.encode(&row, &types(), &mut out).unwrap();
        assert_eq!(BinaryCodec.encoded_len(&row, &types()).unwrap(), out.len());

        let back = BinaryCodec.decode(&out, &types()).unwrap();
        assert_eq!(back, row);
    }

    #[test]
    fn test_values_coerced_to_column_type() {
        let mut out = BytesMut::new();
        BinaryCodec
            .encode(&[Value::BigInt(9)], &[DataType::Integer], &mut out)
            .unwrap();
        assert_eq!(out.len(), 5);
        let back = BinaryCodec.decode(&out, &[DataType::Integer]).unwrap();
        assert!(matches!(back[0], Value::Integer(9)));
    }

    #[test]
    fn test_truncated_input() {
        let mut out = BytesMut::new();
        BinaryCodec
            .encode(&[Value::string("abcdef")], &[DataType::Varchar(0)], &mut out)
            .unwrap();
        let err = BinaryCodec
            .decode(&out[..out.len() - 2], &[DataType::Varchar(0)])
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_arity_mismatch() {
        let mut out = BytesMut::new();
        assert!(BinaryCodec
            .encode(&[Value::Null], &[DataType::Integer, DataType::Integer], &mut out)
            .is_err());
    }
}
