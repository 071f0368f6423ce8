//! Comma-separated text row encoding.
//!
//! A row is one UTF-8 line. Character fields are double-quoted with inner
//! quotes doubled, binary fields are lower-case hex, and an empty unquoted
//! field is NULL.

use bytes::{BufMut, BytesMut};
use ember_common::{DataType, EmberError, EmberResult, Value};

use super::{corrupt, RowCodec};

/// Text row format.
#[derive(Debug, Clone, Copy)]
pub struct TextCodec {
    separator: char,
}

impl Default for TextCodec {
    fn default() -> Self {
        Self { separator: ',' }
    }
}

impl TextCodec {
    /// Registry tag.
    pub const TAG: &'static str = "text";

    /// Creates a codec with a custom field separator.
    #[must_use]
    pub fn with_separator(separator: char) -> Self {
        Self { separator }
    }

    /// Splits the first line into (field text, was quoted) pairs.
    fn split(&self, line: &str) -> EmberResult<Vec<(String, bool)>> {
        let mut fields = Vec::new();
        let mut current = String::new();
        let mut quoted = false;
        let mut in_quotes = false;
        let mut chars = line.chars().peekable();

        while let Some(c) = chars.next() {
            if in_quotes {
                if c == '"' {
                    if chars.peek() == Some(&'"') {
                        chars.next();
                        current.push('"');
                    } else {
                        in_quotes = false;
                    }
                } else {
                    current.push(c);
                }
            } else if c == '"' {
                in_quotes = true;
                quoted = true;
            } else if c == '\n' {
                break;
            } else if c == self.separator {
                fields.push((std::mem::take(&mut current), quoted));
                quoted = false;
            } else {
                current.push(c);
            }
        }
        if in_quotes {
            return Err(corrupt("unterminated quote"));
        }
        fields.push((current, quoted));
        Ok(fields)
    }
}

fn parse_hex(text: &str) -> EmberResult<Vec<u8>> {
    if text.len() % 2 != 0 {
        return Err(corrupt("odd hex length"));
    }
    (0..text.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&text[i..i + 2], 16).map_err(|_| corrupt("invalid hex")))
        .collect()
}

impl RowCodec for TextCodec {
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

        let mut line = String::new();
        for (i, (value, ty)) in values.iter().zip(types).enumerate() {
            if i > 0 {
                line.push(self.separator);
            }
            match value.convert_to(ty)? {
                Value::Null => {}
                Value::String(s) => {
                    line.push('"');
                    line.push_str(&s.replace('"', "\"\""));
                    line.push('"');
                }
                other => line.push_str(&other.to_string()),
            }
        }
        line.push('\n');
        out.put_slice(line.as_bytes());
        Ok(())
    }

    fn decode(&self, bytes: &[u8], types: &[DataType]) -> EmberResult<Vec<Value>> {
        let text = std::str::from_utf8(bytes).map_err(|_| corrupt("invalid UTF-8"))?;
        let fields = self.split(text)?;
        if fields.len() != types.len() {
            return Err(corrupt("field count does not match columns"));
        }

        fields
            .into_iter()
            .zip(types)
            .map(|((field, quoted), ty)| {
                if field.is_empty() && !quoted {
                    return Ok(Value::Null);
                }
                match ty {
                    DataType::Char(_) | DataType::Varchar(_) => Ok(Value::String(field)),
                    DataType::Binary => parse_hex(&field).map(Value::Binary),
                    DataType::Boolean => Value::string(field).convert_to(ty),
                    DataType::Double => field
                        .parse::<f64>()
                        .map(Value::Double)
                        .map_err(|_| corrupt("invalid DOUBLE")),
                    _ => Value::string(field).convert_to(ty),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quoting() {
        let types = [DataType::Varchar(0), DataType::Integer, DataType::Varchar(0)];
        let row = vec![
            Value::string("say \"hi\", bob"),
            Value::Null,
            Value::string(""),
        ];
        let mut out = BytesMut::new();
        TextCodec::default().encode(&row, &types, &mut out).unwrap();
        assert_eq!(&out[..], b"\"say \"\"hi\"\", bob\",,\"\"\n");

        let back = TextCodec::default().decode(&out, &types).unwrap();
        assert_eq!(back, row);
    }

    #[test]
    fn test_typed_fields() {
        let types = [
            DataType::BigInt,
            DataType::Double,
            DataType::Boolean,
            DataType::Binary,
            DataType::Timestamp,
        ];
        let row = vec![
            Value::BigInt(-12),
            Value::Double(2.5),
            Value::Boolean(false),
            Value::Binary(vec![0xde, 0xad]),
            Value::Timestamp(1_000),
        ];
        let mut out = BytesMut::new();
        TextCodec::default().encode(&row, &types, &mut out).unwrap();
        let back = TextCodec::default().decode(&out, &types).unwrap();
        assert_eq!(back, row);
    }

    #[test]
    fn test_custom_separator() {
        let codec = TextCodec::with_separator(';');
        let types = [DataType::Integer, DataType::Integer];
        let mut out = BytesMut::new();
        codec
            .encode(&[Value::Integer(1), Value::Integer(2)], &types, &mut out)
            .unwrap();
        assert_eq!(&out[..], b"1;2\n");
    }

    #[test]
    fn test_bad_field_count() {
        let err = TextCodec::default()
            .decode(b"1,2,3\n", &[DataType::Integer])
            .unwrap_err();
        assert!(err.is_fatal());
    }
}
