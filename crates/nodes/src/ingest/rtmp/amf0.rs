// SPDX-FileCopyrightText: © 2025 MediaCore Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! AMF0 values carried by RTMP command and data messages.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use mediacore_core::{MediaCoreError, Result};

mod marker {
    pub const NUMBER: u8 = 0x00;
    pub const BOOLEAN: u8 = 0x01;
    pub const STRING: u8 = 0x02;
    pub const OBJECT: u8 = 0x03;
    pub const NULL: u8 = 0x05;
    pub const UNDEFINED: u8 = 0x06;
    pub const ECMA_ARRAY: u8 = 0x08;
    pub const OBJECT_END: u8 = 0x09;
    pub const STRICT_ARRAY: u8 = 0x0a;
    pub const DATE: u8 = 0x0b;
    pub const LONG_STRING: u8 = 0x0c;
}

const MAX_DEPTH: usize = 16;

#[derive(Debug, Clone, PartialEq)]
pub enum Amf0Value {
    Number(f64),
    Boolean(bool),
    String(String),
    Object(Vec<(String, Amf0Value)>),
    Null,
    Undefined,
    EcmaArray(Vec<(String, Amf0Value)>),
    StrictArray(Vec<Amf0Value>),
    /// Milliseconds since the epoch; the timezone field is ignored.
    Date(f64),
}

impl Amf0Value {
    pub fn object<K: Into<String>>(props: impl IntoIterator<Item = (K, Self)>) -> Self {
        Self::Object(props.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub const fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Property lookup on objects and ECMA arrays.
    pub fn get(&self, key: &str) -> Option<&Self> {
        match self {
            Self::Object(props) | Self::EcmaArray(props) => {
                props.iter().find(|(k, _)| k == key).map(|(_, v)| v)
            },
            _ => None,
        }
    }
}

pub fn encode(values: &[Amf0Value]) -> Bytes {
    let mut out = BytesMut::new();
    for value in values {
        write_value(&mut out, value);
    }
    out.freeze()
}

fn write_key(out: &mut BytesMut, key: &str) {
    let len = u16::try_from(key.len()).unwrap_or(u16::MAX);
    out.put_u16(len);
    out.put_slice(&key.as_bytes()[..usize::from(len)]);
}

fn write_props(out: &mut BytesMut, props: &[(String, Amf0Value)]) {
    for (key, value) in props {
        write_key(out, key);
        write_value(out, value);
    }
    out.put_u16(0);
    out.put_u8(marker::OBJECT_END);
}

fn write_value(out: &mut BytesMut, value: &Amf0Value) {
    match value {
        Amf0Value::Number(n) => {
            out.put_u8(marker::NUMBER);
            out.put_f64(*n);
        },
        Amf0Value::Boolean(b) => {
            out.put_u8(marker::BOOLEAN);
            out.put_u8(u8::from(*b));
        },
        Amf0Value::String(s) => match u16::try_from(s.len()) {
            Ok(len) => {
                out.put_u8(marker::STRING);
                out.put_u16(len);
                out.put_slice(s.as_bytes());
            },
            Err(_) => {
                out.put_u8(marker::LONG_STRING);
                out.put_u32(u32::try_from(s.len()).unwrap_or(u32::MAX));
                out.put_slice(s.as_bytes());
            },
        },
        Amf0Value::Object(props) => {
            out.put_u8(marker::OBJECT);
            write_props(out, props);
        },
        Amf0Value::Null => out.put_u8(marker::NULL),
        Amf0Value::Undefined => out.put_u8(marker::UNDEFINED),
        Amf0Value::EcmaArray(props) => {
            out.put_u8(marker::ECMA_ARRAY);
            out.put_u32(u32::try_from(props.len()).unwrap_or(u32::MAX));
            write_props(out, props);
        },
        Amf0Value::StrictArray(items) => {
            out.put_u8(marker::STRICT_ARRAY);
            out.put_u32(u32::try_from(items.len()).unwrap_or(u32::MAX));
            for item in items {
                write_value(out, item);
            }
        },
        Amf0Value::Date(ms) => {
            out.put_u8(marker::DATE);
            out.put_f64(*ms);
            out.put_u16(0);
        },
    }
}

/// Decodes every value in `data`.
///
/// # Errors
///
/// `DecodeFailure` on truncated input or an unknown type marker.
pub fn decode_all(mut data: &[u8]) -> Result<Vec<Amf0Value>> {
    let mut values = Vec::new();
    while data.has_remaining() {
        values.push(read_value(&mut data, 0)?);
    }
    Ok(values)
}

fn truncated() -> MediaCoreError {
    MediaCoreError::DecodeFailure("truncated AMF0 value".to_string())
}

fn need(data: &[u8], n: usize) -> Result<()> {
    if data.remaining() < n {
        return Err(truncated());
    }
    Ok(())
}

fn read_utf8(data: &mut &[u8], len: usize) -> Result<String> {
    need(data, len)?;
    let text = String::from_utf8_lossy(&data[..len]).into_owned();
    data.advance(len);
    Ok(text)
}

fn read_key(data: &mut &[u8]) -> Result<String> {
    need(data, 2)?;
    let len = usize::from(data.get_u16());
    read_utf8(data, len)
}

fn read_props(data: &mut &[u8], depth: usize) -> Result<Vec<(String, Amf0Value)>> {
    let mut props = Vec::new();
    loop {
        let key = read_key(data)?;
        if key.is_empty() && data.first() == Some(&marker::OBJECT_END) {
            data.advance(1);
            return Ok(props);
        }
        let value = read_value(data, depth + 1)?;
        props.push((key, value));
    }
}

fn read_value(data: &mut &[u8], depth: usize) -> Result<Amf0Value> {
    if depth > MAX_DEPTH {
        return Err(MediaCoreError::DecodeFailure("AMF0 nesting too deep".to_string()));
    }
    need(data, 1)?;
    let value = match data.get_u8() {
        marker::NUMBER => {
            need(data, 8)?;
            Amf0Value::Number(data.get_f64())
        },
        marker::BOOLEAN => {
            need(data, 1)?;
            Amf0Value::Boolean(data.get_u8() != 0)
        },
        marker::STRING => {
            let text = read_key(data)?;
            Amf0Value::String(text)
        },
        marker::LONG_STRING => {
            need(data, 4)?;
            let len = data.get_u32() as usize;
            Amf0Value::String(read_utf8(data, len)?)
        },
        marker::OBJECT => Amf0Value::Object(read_props(data, depth)?),
        marker::NULL => Amf0Value::Null,
        marker::UNDEFINED => Amf0Value::Undefined,
        marker::ECMA_ARRAY => {
            // The count is advisory; the terminator ends the array.
            need(data, 4)?;
            data.advance(4);
            Amf0Value::EcmaArray(read_props(data, depth)?)
        },
        marker::STRICT_ARRAY => {
            need(data, 4)?;
            let count = data.get_u32() as usize;
            let mut items = Vec::with_capacity(count.min(64));
            for _ in 0..count {
                items.push(read_value(data, depth + 1)?);
            }
            Amf0Value::StrictArray(items)
        },
        marker::DATE => {
            need(data, 10)?;
            let ms = data.get_f64();
            data.advance(2);
            Amf0Value::Date(ms)
        },
        other => {
            return Err(MediaCoreError::DecodeFailure(format!("unsupported AMF0 marker {other:#04x}")));
        },
    };
    Ok(value)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn connect_command_layout() {
        let bytes = encode(&[
            Amf0Value::String("connect".into()),
            Amf0Value::Number(1.0),
            Amf0Value::object([("app", Amf0Value::String("live".into()))]),
        ]);
        assert_eq!(&bytes[..10], &[0x02, 0x00, 0x07, b'c', b'o', b'n', b'n', b'e', b'c', b't']);
        assert_eq!(bytes[10], 0x00);
        assert_eq!(&bytes[bytes.len() - 3..], &[0x00, 0x00, 0x09]);

        let values = decode_all(&bytes).unwrap();
        assert_eq!(values[0].as_str(), Some("connect"));
        assert_eq!(values[1].as_number(), Some(1.0));
        assert_eq!(values[2].get("app").and_then(Amf0Value::as_str), Some("live"));
    }

    #[test]
    fn decodes_on_metadata_ecma_array() {
        let bytes = encode(&[
            Amf0Value::String("onMetaData".into()),
            Amf0Value::EcmaArray(vec![
                ("duration".into(), Amf0Value::Number(0.0)),
                ("hasVideo".into(), Amf0Value::Boolean(true)),
                ("created".into(), Amf0Value::Date(1.7e12)),
            ]),
        ]);
        let values = decode_all(&bytes).unwrap();
        assert_eq!(values[1].get("hasVideo"), Some(&Amf0Value::Boolean(true)));
        assert_eq!(values[1].get("created"), Some(&Amf0Value::Date(1.7e12)));
    }

    #[test]
    fn rejects_truncated_and_unknown_input() {
        assert!(decode_all(&[0x00, 0x40]).is_err());
        assert!(decode_all(&[0x02, 0x00, 0x05, b'a']).is_err());
        assert!(decode_all(&[0x11]).is_err());
    }
}
