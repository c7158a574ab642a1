use bytes::{BufMut, Bytes, BytesMut};
use mculink_frame::vlq;

use crate::error::{DictError, Result};
use crate::params::MessageParams;
use crate::types::{ParamValue, WireType};

/// A named command or response with ordered, typed parameters.
///
/// Built from the firmware's format string, e.g.
/// `"heater_set oid=%c value=%u"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageFormat {
    msgid: u32,
    msgid_bytes: Vec<u8>,
    format: String,
    name: String,
    params: Vec<(String, WireType)>,
}

impl MessageFormat {
    pub fn parse(msgid: u32, format: &str) -> Result<Self> {
        let invalid = |reason: &str| DictError::InvalidFormat {
            format: format.to_string(),
            reason: reason.to_string(),
        };

        let mut parts = format.split_whitespace();
        let name = parts.next().ok_or_else(|| invalid("empty format"))?;
        let mut params = Vec::new();
        for part in parts {
            let (param, spec) = part
                .split_once('=')
                .ok_or_else(|| invalid(&format!("'{part}' is not name=type")))?;
            let wire = WireType::from_spec(spec)
                .ok_or_else(|| invalid(&format!("unknown type '{spec}' for {param}")))?;
            if params.iter().any(|(p, _)| p == param) {
                return Err(invalid(&format!("duplicate parameter {param}")));
            }
            params.push((param.to_string(), wire));
        }

        let mut msgid_bytes = Vec::new();
        vlq::encode_u32(msgid, &mut msgid_bytes);
        Ok(Self {
            msgid,
            msgid_bytes,
            format: format.to_string(),
            name: name.to_string(),
            params,
        })
    }

    pub fn msgid(&self) -> u32 {
        self.msgid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The format string exactly as the firmware declared it.
    pub fn format(&self) -> &str {
        &self.format
    }

    pub fn params(&self) -> &[(String, WireType)] {
        &self.params
    }

    pub fn param_type(&self, param: &str) -> Option<WireType> {
        self.params
            .iter()
            .find(|(name, _)| name == param)
            .map(|(_, t)| *t)
    }

    /// Encode from arguments in declaration order.
    pub fn encode(&self, args: &[ParamValue]) -> Result<Bytes> {
        if args.len() != self.params.len() {
            return Err(DictError::ArgumentCount {
                message: self.name.clone(),
                expected: self.params.len(),
                actual: args.len(),
            });
        }
        let mut out = BytesMut::with_capacity(self.encoded_len_hint());
        out.put_slice(&self.msgid_bytes);
        for ((param, wire), value) in self.params.iter().zip(args) {
            wire.encode(param, value, &mut out)?;
        }
        Ok(out.freeze())
    }

    /// Encode from a name -> value map. `#`-prefixed metadata is ignored.
    pub fn encode_by_name(&self, args: &MessageParams) -> Result<Bytes> {
        if let Some((extra, _)) = args
            .iter()
            .find(|(k, _)| !k.starts_with('#') && self.param_type(k).is_none())
        {
            return Err(DictError::UnknownParam {
                message: self.name.clone(),
                param: extra.to_string(),
            });
        }
        let mut out = BytesMut::with_capacity(self.encoded_len_hint());
        out.put_slice(&self.msgid_bytes);
        for (param, wire) in &self.params {
            let value = args.get(param).ok_or_else(|| DictError::MissingParam {
                message: self.name.clone(),
                param: param.clone(),
            })?;
            wire.encode(param, value, &mut out)?;
        }
        Ok(out.freeze())
    }

    /// Decode one message at `*pos` (which points at the message id).
    pub fn decode(&self, src: &[u8], pos: &mut usize) -> Result<MessageParams> {
        *pos += self.msgid_bytes.len();
        let mut params = MessageParams::named(&self.name);
        for (param, wire) in &self.params {
            let value = wire.decode(src, pos)?;
            params.insert(param.clone(), value);
        }
        Ok(params)
    }

    /// Render decoded params as `name p1=v1 p2=v2`.
    pub fn format_params(&self, params: &MessageParams) -> String {
        let mut out = self.name.clone();
        for (param, _) in &self.params {
            match params.get(param) {
                Some(value) => out.push_str(&format!(" {param}={value}")),
                None => out.push_str(&format!(" {param}=?")),
            }
        }
        out
    }

    fn encoded_len_hint(&self) -> usize {
        self.msgid_bytes.len() + self.params.iter().map(|(_, t)| t.max_length()).sum::<usize>()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Value(WireType),
}

/// A firmware debug line (`output("...")`), rendered to text on decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputFormat {
    msgid: u32,
    msgid_bytes: Vec<u8>,
    format: String,
    segments: Vec<Segment>,
}

impl OutputFormat {
    pub const NAME: &'static str = "#output";

    pub fn parse(msgid: u32, format: &str) -> Result<Self> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut rest = format;
        while let Some(idx) = rest.find('%') {
            literal.push_str(&rest[..idx]);
            rest = &rest[idx..];
            if rest.starts_with("%%") {
                literal.push('%');
                rest = &rest[2..];
                continue;
            }
            let (wire, len) = (2..=4)
                .find_map(|len| {
                    rest.get(..len)
                        .and_then(WireType::from_spec)
                        .map(|t| (t, len))
                })
                .ok_or_else(|| DictError::InvalidFormat {
                    format: format.to_string(),
                    reason: "invalid output conversion".to_string(),
                })?;
            if !literal.is_empty() {
                segments.push(Segment::Literal(std::mem::take(&mut literal)));
            }
            segments.push(Segment::Value(wire));
            rest = &rest[len..];
        }
        literal.push_str(rest);
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        let mut msgid_bytes = Vec::new();
        vlq::encode_u32(msgid, &mut msgid_bytes);
        Ok(Self {
            msgid,
            msgid_bytes,
            format: format.to_string(),
            segments,
        })
    }

    pub fn msgid(&self) -> u32 {
        self.msgid
    }

    pub fn format(&self) -> &str {
        &self.format
    }

    pub fn decode(&self, src: &[u8], pos: &mut usize) -> Result<MessageParams> {
        *pos += self.msgid_bytes.len();
        let mut text = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(s) => text.push_str(s),
                Segment::Value(wire) => match wire.decode(src, pos)? {
                    ParamValue::Bytes(b) => text.push_str(&String::from_utf8_lossy(&b)),
                    other => text.push_str(&other.to_string()),
                },
            }
        }
        let mut params = MessageParams::named(Self::NAME);
        params.insert("#msg", text);
        Ok(params)
    }
}

/// Fallback for ids missing from the dictionary. Never fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnknownFormat;

impl UnknownFormat {
    pub const NAME: &'static str = "#unknown";

    /// Consume everything from `*pos` to the end of `src`.
    pub fn decode(&self, src: &[u8], pos: &mut usize) -> MessageParams {
        let start = (*pos).min(src.len());
        let mut params = MessageParams::named(Self::NAME);
        let mut id_pos = start;
        if let Ok(msgid) = vlq::decode_raw(src, &mut id_pos) {
            params.insert("#msgid", i64::from(msgid as i32));
        }
        params.insert("#msg", &src[start..]);
        *pos = src.len();
        params
    }
}

/// The three ways a message id can be interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MsgFormat {
    Message(MessageFormat),
    Output(OutputFormat),
    Unknown(UnknownFormat),
}

impl MsgFormat {
    pub fn name(&self) -> &str {
        match self {
            MsgFormat::Message(m) => m.name(),
            MsgFormat::Output(_) => OutputFormat::NAME,
            MsgFormat::Unknown(_) => UnknownFormat::NAME,
        }
    }

    pub fn decode(&self, src: &[u8], pos: &mut usize) -> Result<MessageParams> {
        match self {
            MsgFormat::Message(m) => m.decode(src, pos),
            MsgFormat::Output(o) => o.decode(src, pos),
            MsgFormat::Unknown(u) => Ok(u.decode(src, pos)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_message_format() {
        let fmt = MessageFormat::parse(7, "heater_set oid=%c value=%u").unwrap();
        assert_eq!(fmt.name(), "heater_set");
        assert_eq!(fmt.msgid(), 7);
        assert_eq!(
            fmt.params(),
            &[
                ("oid".to_string(), WireType::Byte),
                ("value".to_string(), WireType::Uint32)
            ]
        );
        assert_eq!(fmt.param_type("value"), Some(WireType::Uint32));
    }

    #[test]
    fn bad_formats_rejected() {
        for bad in ["", "cmd oid", "cmd oid=%q", "cmd a=%u a=%c"] {
            assert!(
                matches!(
                    MessageFormat::parse(1, bad),
                    Err(DictError::InvalidFormat { .. })
                ),
                "{bad:?} accepted"
            );
        }
    }

    #[test]
    fn encode_positional_and_decode() {
        let fmt = MessageFormat::parse(7, "heater_set oid=%c value=%u").unwrap();
        let bytes = fmt.encode(&[1u8.into(), 128u32.into()]).unwrap();
        assert_eq!(bytes.as_ref(), &[0x07, 0x01, 0x81, 0x00]);

        let mut pos = 0;
        let params = fmt.decode(&bytes, &mut pos).unwrap();
        assert_eq!(pos, bytes.len());
        assert_eq!(params.name(), "heater_set");
        assert_eq!(params.get_int("oid"), Some(1));
        assert_eq!(params.get_int("value"), Some(128));
        assert_eq!(fmt.format_params(&params), "heater_set oid=1 value=128");
    }

    #[test]
    fn encode_by_name_matches_positional() {
        let fmt = MessageFormat::parse(130, "config_x oid=%c pin=%u name=%s").unwrap();
        let mut args = MessageParams::named("config_x");
        args.insert("pin", 300u32);
        args.insert("oid", 4u8);
        args.insert("name", "pa0");

        let by_name = fmt.encode_by_name(&args).unwrap();
        let positional = fmt
            .encode(&[4u8.into(), 300u32.into(), "pa0".into()])
            .unwrap();
        assert_eq!(by_name, positional);
        // Two-byte message id.
        assert_eq!(&by_name[..2], &[0x81, 0x02]);
    }

    #[test]
    fn encode_errors() {
        let fmt = MessageFormat::parse(7, "heater_set oid=%c value=%u").unwrap();
        assert!(matches!(
            fmt.encode(&[1u8.into()]),
            Err(DictError::ArgumentCount { expected: 2, actual: 1, .. })
        ));

        let mut args = MessageParams::default();
        args.insert("oid", 1u8);
        assert!(matches!(
            fmt.encode_by_name(&args),
            Err(DictError::MissingParam { .. })
        ));

        args.insert("value", 1u8);
        args.insert("bogus", 1u8);
        assert!(matches!(
            fmt.encode_by_name(&args),
            Err(DictError::UnknownParam { .. })
        ));
    }

    #[test]
    fn output_format_renders_text() {
        let fmt = OutputFormat::parse(9, "adc %hu of %u on %s: 100%% %c").unwrap();
        let mut payload = vec![9u8];
        WireType::Uint16.encode("a", &ParamValue::Int(512), &mut payload).unwrap();
        WireType::Uint32.encode("b", &ParamValue::Int(4096), &mut payload).unwrap();
        WireType::String.encode("c", &"PA3".into(), &mut payload).unwrap();
        WireType::Byte.encode("d", &ParamValue::Int(7), &mut payload).unwrap();

        let mut pos = 0;
        let params = fmt.decode(&payload, &mut pos).unwrap();
        assert_eq!(pos, payload.len());
        assert_eq!(params.name(), "#output");
        assert_eq!(params.get_str("#msg"), Some("adc 512 of 4096 on PA3: 100% 7"));
    }

    #[test]
    fn output_format_rejects_bad_conversion() {
        assert!(OutputFormat::parse(1, "value %d").is_err());
        assert!(OutputFormat::parse(1, "trailing %").is_err());
    }

    #[test]
    fn unknown_format_never_fails() {
        let payload = [0x83, 0x01, 0xaa, 0xbb];
        let mut pos = 0;
        let params = UnknownFormat.decode(&payload, &mut pos);
        assert_eq!(pos, payload.len());
        assert_eq!(params.name(), "#unknown");
        assert_eq!(params.get_int("#msgid"), Some(385));
        assert_eq!(params.get_bytes("#msg"), Some(payload.as_slice()));

        // Even a truncated id decodes to something.
        let mut pos = 0;
        let params = UnknownFormat.decode(&[0x80], &mut pos);
        assert_eq!(params.get_int("#msgid"), None);
        assert_eq!(pos, 1);
    }
}
