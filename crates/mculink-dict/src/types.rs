use std::fmt;

use bytes::BufMut;
use mculink_frame::vlq;
use serde::{Serialize, Serializer};

use crate::error::{DictError, Result};

/// Parameter types a message format can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WireType {
    /// `%u`
    Uint32,
    /// `%i`
    Int32,
    /// `%hu`
    Uint16,
    /// `%hi`
    Int16,
    /// `%c`
    Byte,
    /// `%s`
    String,
    /// `%.*s` (firmware progmem buffer)
    ProgmemBuffer,
    /// `%*s`
    Buffer,
}

impl WireType {
    /// Every type, in the order the format parser tries them.
    pub const ALL: [WireType; 8] = [
        WireType::Uint32,
        WireType::Int32,
        WireType::Uint16,
        WireType::Int16,
        WireType::Byte,
        WireType::String,
        WireType::ProgmemBuffer,
        WireType::Buffer,
    ];

    /// Resolve a printf-style conversion (`"%u"`, `"%.*s"`, ...).
    pub fn from_spec(spec: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.spec() == spec)
    }

    /// The printf-style conversion for this type.
    pub fn spec(self) -> &'static str {
        match self {
            WireType::Uint32 => "%u",
            WireType::Int32 => "%i",
            WireType::Uint16 => "%hu",
            WireType::Int16 => "%hi",
            WireType::Byte => "%c",
            WireType::String => "%s",
            WireType::ProgmemBuffer => "%.*s",
            WireType::Buffer => "%*s",
        }
    }

    /// True for length-prefixed byte strings.
    pub fn is_dynamic_string(self) -> bool {
        matches!(
            self,
            WireType::String | WireType::ProgmemBuffer | WireType::Buffer
        )
    }

    /// True when negative values are decoded with sign extension.
    pub fn is_signed(self) -> bool {
        matches!(self, WireType::Int32 | WireType::Int16)
    }

    /// Upper bound on the encoded size of one value.
    pub fn max_length(self) -> usize {
        match self {
            WireType::Uint32 | WireType::Int32 => vlq::MAX_ENCODED_LEN,
            WireType::Uint16 | WireType::Int16 => 3,
            WireType::Byte => 2,
            WireType::String | WireType::ProgmemBuffer | WireType::Buffer => 64,
        }
    }

    fn int_range(self) -> (i64, i64) {
        match self {
            WireType::Uint32 => (0, i64::from(u32::MAX)),
            WireType::Int32 => (i64::from(i32::MIN), i64::from(i32::MAX)),
            WireType::Uint16 => (0, i64::from(u16::MAX)),
            WireType::Int16 => (i64::from(i16::MIN), i64::from(i16::MAX)),
            WireType::Byte => (0, i64::from(u8::MAX)),
            _ => (0, -1),
        }
    }

    /// Append `value` for parameter `param`.
    pub fn encode<B: BufMut>(self, param: &str, value: &ParamValue, dst: &mut B) -> Result<()> {
        if self.is_dynamic_string() {
            let bytes = value.as_bytes().ok_or_else(|| DictError::WrongKind {
                param: param.to_string(),
                expected: "a byte string",
            })?;
            let len = u8::try_from(bytes.len()).map_err(|_| DictError::OutOfRange {
                param: param.to_string(),
                value: bytes.len() as i64,
                wire: self.spec(),
            })?;
            dst.put_u8(len);
            dst.put_slice(bytes);
            return Ok(());
        }

        let v = value.as_int().ok_or_else(|| DictError::WrongKind {
            param: param.to_string(),
            expected: "an integer",
        })?;
        let (min, max) = self.int_range();
        if v < min || v > max {
            return Err(DictError::OutOfRange {
                param: param.to_string(),
                value: v,
                wire: self.spec(),
            });
        }
        // Unsigned values share the encoding of their 32-bit pattern.
        vlq::encode(v as u32 as i32, dst);
        Ok(())
    }

    /// Decode one value at `*pos`.
    pub fn decode(self, src: &[u8], pos: &mut usize) -> Result<ParamValue> {
        if self.is_dynamic_string() {
            let len = *src
                .get(*pos)
                .ok_or_else(|| DictError::Malformed(format!("missing length at {}", *pos)))?
                as usize;
            let start = *pos + 1;
            let data = src.get(start..start + len).ok_or_else(|| {
                DictError::Malformed(format!("string of {len} bytes overruns payload"))
            })?;
            *pos = start + len;
            return Ok(ParamValue::Bytes(data.to_vec()));
        }
        let raw = vlq::decode_raw(src, pos)?;
        let v = if self.is_signed() {
            i64::from(raw as i32)
        } else {
            i64::from(raw)
        };
        Ok(ParamValue::Int(v))
    }
}

impl fmt::Display for WireType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.spec())
    }
}

/// A decoded (or to-be-encoded) parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Int(i64),
    Float(f64),
    Bytes(Vec<u8>),
    Str(String),
}

impl ParamValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            ParamValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Integers widen to floats; timestamps are stored as floats.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            ParamValue::Int(v) => Some(*v as f64),
            ParamValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            ParamValue::Bytes(v) => Some(v),
            ParamValue::Str(v) => Some(v.as_bytes()),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::Str(v) => Some(v),
            ParamValue::Bytes(v) => std::str::from_utf8(v).ok(),
            _ => None,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Int(v) => write!(f, "{v}"),
            ParamValue::Float(v) => write!(f, "{v:.6}"),
            ParamValue::Str(v) => f.write_str(v),
            ParamValue::Bytes(v) => {
                f.write_str("b'")?;
                for &b in v {
                    write!(f, "{}", std::ascii::escape_default(b))?;
                }
                f.write_str("'")
            }
        }
    }
}

impl Serialize for ParamValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            ParamValue::Int(v) => serializer.serialize_i64(*v),
            ParamValue::Float(v) => serializer.serialize_f64(*v),
            ParamValue::Str(v) => serializer.serialize_str(v),
            ParamValue::Bytes(v) => match std::str::from_utf8(v) {
                Ok(text) => serializer.serialize_str(text),
                Err(_) => v.serialize(serializer),
            },
        }
    }
}

macro_rules! int_param {
    ($($t:ty),*) => {
        $(impl From<$t> for ParamValue {
            fn from(v: $t) -> Self {
                ParamValue::Int(i64::from(v))
            }
        })*
    };
}

int_param!(u8, u16, u32, i8, i16, i32, i64, bool);

impl From<u64> for ParamValue {
    fn from(v: u64) -> Self {
        ParamValue::Int(v as i64)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Float(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Str(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        ParamValue::Str(v)
    }
}

impl From<&[u8]> for ParamValue {
    fn from(v: &[u8]) -> Self {
        ParamValue::Bytes(v.to_vec())
    }
}

impl From<Vec<u8>> for ParamValue {
    fn from(v: Vec<u8>) -> Self {
        ParamValue::Bytes(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(t: WireType, v: ParamValue) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        t.encode("p", &v, &mut out)?;
        Ok(out)
    }

    #[test]
    fn spec_lookup() {
        for t in WireType::ALL {
            assert_eq!(WireType::from_spec(t.spec()), Some(t));
        }
        assert_eq!(WireType::from_spec("%d"), None);
        assert_eq!(WireType::from_spec("%.*s"), Some(WireType::ProgmemBuffer));
    }

    #[test]
    fn int_types_roundtrip() {
        let cases = [
            (WireType::Uint32, 4_000_000_000i64),
            (WireType::Int32, -123_456),
            (WireType::Uint16, 65_535),
            (WireType::Int16, -32_768),
            (WireType::Byte, 255),
        ];
        for (t, v) in cases {
            let bytes = encode(t, ParamValue::Int(v)).unwrap();
            assert!(bytes.len() <= t.max_length());
            let mut pos = 0;
            assert_eq!(t.decode(&bytes, &mut pos).unwrap(), ParamValue::Int(v));
            assert_eq!(pos, bytes.len());
        }
    }

    #[test]
    fn out_of_range_rejected() {
        assert!(matches!(
            encode(WireType::Byte, ParamValue::Int(256)),
            Err(DictError::OutOfRange { value: 256, wire: "%c", .. })
        ));
        assert!(matches!(
            encode(WireType::Uint32, ParamValue::Int(-1)),
            Err(DictError::OutOfRange { .. })
        ));
        assert!(matches!(
            encode(WireType::Int16, ParamValue::Int(40_000)),
            Err(DictError::OutOfRange { .. })
        ));
    }

    #[test]
    fn strings_are_length_prefixed() {
        let bytes = encode(WireType::Buffer, ParamValue::Bytes(vec![0xaa, 0xbb])).unwrap();
        assert_eq!(bytes, [2, 0xaa, 0xbb]);

        let bytes = encode(WireType::String, "hi".into()).unwrap();
        assert_eq!(bytes, [2, b'h', b'i']);

        let mut pos = 0;
        let decoded = WireType::ProgmemBuffer.decode(&[3, b'a', b'b', b'c', 9], &mut pos);
        assert_eq!(decoded.unwrap(), ParamValue::Bytes(b"abc".to_vec()));
        assert_eq!(pos, 4);
    }

    #[test]
    fn wrong_kind_rejected() {
        assert!(matches!(
            encode(WireType::Uint32, "x".into()),
            Err(DictError::WrongKind { .. })
        ));
        assert!(matches!(
            encode(WireType::Buffer, ParamValue::Int(1)),
            Err(DictError::WrongKind { .. })
        ));
    }

    #[test]
    fn overrun_string_is_malformed() {
        let mut pos = 0;
        let err = WireType::String.decode(&[5, b'a'], &mut pos).unwrap_err();
        assert!(matches!(err, DictError::Malformed(_)));
    }

    #[test]
    fn display_and_json() {
        assert_eq!(ParamValue::Int(-4).to_string(), "-4");
        assert_eq!(ParamValue::Bytes(vec![b'o', b'k', 0]).to_string(), "b'ok\\x00'");
        assert_eq!(
            serde_json::to_string(&ParamValue::Bytes(b"abc".to_vec())).unwrap(),
            "\"abc\""
        );
        assert_eq!(
            serde_json::to_string(&ParamValue::Bytes(vec![0xff, 0x00])).unwrap(),
            "[255,0]"
        );
    }
}
