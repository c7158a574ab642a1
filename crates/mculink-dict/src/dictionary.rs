use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;
use mculink_frame::{vlq, MESSAGE_HEADER_SIZE, MESSAGE_MIN, MESSAGE_TRAILER_SIZE};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::error::{DictError, Result};
use crate::format::{MessageFormat, MsgFormat, OutputFormat, UnknownFormat};
use crate::identify::{decompress_identify, IdentifyData};
use crate::params::MessageParams;
use crate::types::ParamValue;

/// Bootstrap response carrying one chunk of the compressed dictionary (id 0).
pub const IDENTIFY_RESPONSE_FORMAT: &str = "identify_response offset=%u data=%.*s";
/// Bootstrap request for a dictionary chunk (id 1).
pub const IDENTIFY_FORMAT: &str = "identify offset=%u count=%c";

/// Direction / role of a dictionary entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Command,
    Response,
    Output,
}

/// Message id <-> schema table for one firmware.
#[derive(Debug, Clone)]
pub struct MessageDictionary {
    by_id: HashMap<u32, MsgFormat>,
    by_name: HashMap<String, MessageFormat>,
    kinds: BTreeMap<u32, MessageKind>,
    static_strings: HashMap<u32, String>,
    config: BTreeMap<String, Value>,
    version: String,
    build_versions: String,
    raw_identify_data: Bytes,
    unknown: MsgFormat,
}

impl Default for MessageDictionary {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageDictionary {
    /// A dictionary holding only the two bootstrap formats.
    pub fn new() -> Self {
        let mut dict = Self {
            by_id: HashMap::new(),
            by_name: HashMap::new(),
            kinds: BTreeMap::new(),
            static_strings: HashMap::new(),
            config: BTreeMap::new(),
            version: String::new(),
            build_versions: String::new(),
            raw_identify_data: Bytes::new(),
            unknown: MsgFormat::Unknown(UnknownFormat),
        };
        // The bootstrap formats are static and known to parse.
        for (msgid, format, kind) in [
            (0, IDENTIFY_RESPONSE_FORMAT, MessageKind::Response),
            (1, IDENTIFY_FORMAT, MessageKind::Command),
        ] {
            if let Err(err) = dict.add_message(msgid, format, kind) {
                debug!(%err, "bootstrap format rejected");
            }
        }
        dict
    }

    /// Build a dictionary from the compressed identify payload.
    pub fn from_identify(compressed: &[u8]) -> Result<Self> {
        let mut dict = Self::new();
        dict.process_identify(compressed, true)?;
        Ok(dict)
    }

    /// Install the firmware's dictionary on top of the bootstrap formats.
    pub fn process_identify(&mut self, data: &[u8], decompress: bool) -> Result<()> {
        let json = if decompress {
            decompress_identify(data)?
        } else {
            data.to_vec()
        };
        let identify = IdentifyData::from_json(&json)?;

        for (key, format) in &identify.messages {
            let msgid = parse_id(key)?;
            let kind = if identify.commands.contains(msgid) {
                MessageKind::Command
            } else if identify.responses.contains(msgid) {
                MessageKind::Response
            } else {
                MessageKind::Output
            };
            self.add_message(msgid, format, kind)?;
        }
        for (msgid, format) in identify.commands.inline_formats() {
            self.add_message(msgid, format, MessageKind::Command)?;
        }
        for (msgid, format) in identify.responses.inline_formats() {
            self.add_message(msgid, format, MessageKind::Response)?;
        }
        for (format, &msgid) in &identify.output {
            self.add_message(msgid, format, MessageKind::Output)?;
        }

        for (key, text) in &identify.static_strings {
            self.static_strings.insert(parse_id(key)?, text.clone());
        }
        if let Some(table) = identify.enumerations.get("static_string_id") {
            for (text, id) in table {
                if let Some(id) = id.as_u64().and_then(|v| u32::try_from(v).ok()) {
                    self.static_strings.insert(id, text.clone());
                }
            }
        }

        self.config = identify.config;
        self.version = identify.version;
        self.build_versions = identify.build_versions;
        self.raw_identify_data = Bytes::copy_from_slice(data);
        debug!(
            messages = self.by_id.len(),
            version = %self.version,
            "installed firmware dictionary"
        );
        Ok(())
    }

    fn add_message(&mut self, msgid: u32, format: &str, kind: MessageKind) -> Result<()> {
        let entry = match kind {
            MessageKind::Output => MsgFormat::Output(OutputFormat::parse(msgid, format)?),
            MessageKind::Command | MessageKind::Response => {
                let parsed = MessageFormat::parse(msgid, format)?;
                self.by_name
                    .insert(parsed.name().to_string(), parsed.clone());
                MsgFormat::Message(parsed)
            }
        };
        self.by_id.insert(msgid, entry);
        self.kinds.insert(msgid, kind);
        Ok(())
    }

    /// Resolve a command by its full format string.
    ///
    /// The format must match the firmware's declaration exactly.
    pub fn lookup_command(&self, format: &str) -> Result<&MessageFormat> {
        let format = format.trim();
        let name = format.split_whitespace().next().unwrap_or("");
        let found = self
            .by_name
            .get(name)
            .ok_or_else(|| DictError::UnknownCommand(name.to_string()))?;
        if found.format() != format {
            return Err(DictError::FormatMismatch {
                requested: format.to_string(),
                actual: found.format().to_string(),
            });
        }
        Ok(found)
    }

    /// Find a command or response by name.
    pub fn lookup_message(&self, name: &str) -> Option<&MessageFormat> {
        self.by_name.get(name)
    }

    /// The format for a message id; unknown ids map to the fallback.
    pub fn lookup_msgid(&self, msgid: u32) -> &MsgFormat {
        self.by_id.get(&msgid).unwrap_or(&self.unknown)
    }

    /// Encode a textual command such as `"heater_set oid=1 value=128"`.
    ///
    /// Integers accept decimal or `0x` hex; byte strings are given as hex.
    pub fn create_command(&self, text: &str) -> Result<Bytes> {
        let mut parts = text.split_whitespace();
        let name = parts
            .next()
            .ok_or_else(|| DictError::UnknownCommand(String::new()))?;
        let format = self
            .by_name
            .get(name)
            .ok_or_else(|| DictError::UnknownCommand(name.to_string()))?;

        let mut args = MessageParams::named(name);
        for part in parts {
            let (param, raw) = part
                .split_once('=')
                .ok_or_else(|| DictError::InvalidArgument(part.to_string()))?;
            let wire = format
                .param_type(param)
                .ok_or_else(|| DictError::UnknownParam {
                    message: name.to_string(),
                    param: param.to_string(),
                })?;
            let value = if wire.is_dynamic_string() {
                ParamValue::Bytes(parse_hex(raw)?)
            } else {
                ParamValue::Int(parse_int(raw)?)
            };
            args.insert(param, value);
        }
        format.encode_by_name(&args)
    }

    /// Decode every message in a block payload.
    pub fn parse(&self, payload: &[u8]) -> Result<Vec<MessageParams>> {
        let mut out = Vec::new();
        let mut pos = 0;
        while pos < payload.len() {
            let mut id_pos = pos;
            let format = match vlq::decode_raw(payload, &mut id_pos) {
                Ok(msgid) => self.lookup_msgid(msgid),
                Err(_) => &self.unknown,
            };
            out.push(format.decode(payload, &mut pos)?);
        }
        if pos != payload.len() {
            return Err(DictError::Malformed(format!(
                "{} bytes past end of payload",
                pos - payload.len()
            )));
        }
        Ok(out)
    }

    /// Human-readable rendering of decoded params.
    pub fn format_params(&self, params: &MessageParams) -> String {
        let name = params.name();
        if let Some(format) = self.by_name.get(name) {
            return format.format_params(params);
        }
        if let Some(msg) = params.get("#msg") {
            return format!("{name} {msg}");
        }
        params.to_string()
    }

    /// Describe a raw block for debug dumps: sequence plus each message.
    pub fn dump_block(&self, block: &[u8]) -> Vec<String> {
        if block.len() < MESSAGE_MIN {
            return vec![format!("short block: {block:02x?}")];
        }
        let mut out = vec![format!("seq: {:02x}", block[1])];
        let payload = &block[MESSAGE_HEADER_SIZE..block.len() - MESSAGE_TRAILER_SIZE];
        match self.parse(payload) {
            Ok(messages) => out.extend(messages.iter().map(|m| self.format_params(m))),
            Err(err) => out.push(format!("undecodable: {err}")),
        }
        out
    }

    pub fn get_constant(&self, name: &str) -> Result<&Value> {
        self.config
            .get(name)
            .ok_or_else(|| DictError::MissingConstant(name.to_string()))
    }

    /// A constant as float; numeric strings are accepted.
    pub fn get_constant_float(&self, name: &str) -> Result<f64> {
        let value = self.get_constant(name)?;
        value
            .as_f64()
            .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
            .ok_or_else(|| DictError::InvalidConstant {
                name: name.to_string(),
                expected: "number",
            })
    }

    pub fn get_constant_int(&self, name: &str) -> Result<i64> {
        let value = self.get_constant(name)?;
        value
            .as_i64()
            .or_else(|| value.as_str().and_then(|s| parse_int(s).ok()))
            .ok_or_else(|| DictError::InvalidConstant {
                name: name.to_string(),
                expected: "integer",
            })
    }

    pub fn constants(&self) -> &BTreeMap<String, Value> {
        &self.config
    }

    pub fn lookup_static_string(&self, id: u32) -> Option<&str> {
        self.static_strings.get(&id).map(String::as_str)
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn build_versions(&self) -> &str {
        &self.build_versions
    }

    /// The compressed identify payload as received.
    pub fn raw_identify_data(&self) -> &Bytes {
        &self.raw_identify_data
    }

    /// Every known message as `(id, kind, format)`, ordered by id.
    pub fn messages(&self) -> Vec<(u32, MessageKind, &str)> {
        self.kinds
            .iter()
            .filter_map(|(&msgid, &kind)| {
                let format = match self.by_id.get(&msgid)? {
                    MsgFormat::Message(m) => m.format(),
                    MsgFormat::Output(o) => o.format(),
                    MsgFormat::Unknown(_) => return None,
                };
                Some((msgid, kind, format))
            })
            .collect()
    }
}

fn parse_id(key: &str) -> Result<u32> {
    key.trim()
        .parse()
        .map_err(|_| DictError::Identify(format!("invalid message id '{key}'")))
}

fn parse_int(raw: &str) -> Result<i64> {
    let (negative, digits) = match raw.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, raw),
    };
    let parsed = match digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        Some(hex) => i64::from_str_radix(hex, 16),
        None => digits.parse::<i64>(),
    }
    .map_err(|_| DictError::InvalidArgument(raw.to_string()))?;
    Ok(if negative { -parsed } else { parsed })
}

fn parse_hex(raw: &str) -> Result<Vec<u8>> {
    if raw.len() % 2 != 0 {
        return Err(DictError::InvalidArgument(raw.to_string()));
    }
    (0..raw.len())
        .step_by(2)
        .map(|i| {
            raw.get(i..i + 2)
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .ok_or_else(|| DictError::InvalidArgument(raw.to_string()))
        })
        .collect()
}
