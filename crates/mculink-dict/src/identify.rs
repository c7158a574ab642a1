use std::collections::BTreeMap;
use std::io::Read;

use flate2::read::ZlibDecoder;
use serde::Deserialize;
use serde_json::Value;

use crate::error::{DictError, Result};

/// Upper bound on the decompressed dictionary size.
pub const MAX_IDENTIFY_SIZE: u64 = 4 * 1024 * 1024;

/// The firmware's self-description, as downloaded during identify.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct IdentifyData {
    /// Message id -> format string.
    pub messages: BTreeMap<String, String>,
    /// Host-originated message ids.
    pub commands: IdSet,
    /// Firmware-originated message ids.
    pub responses: IdSet,
    /// Debug output formats (format -> id), as newer firmware reports them.
    pub output: BTreeMap<String, u32>,
    /// Compact ids for constant strings used in shutdown messages.
    pub static_strings: BTreeMap<String, String>,
    /// Named value tables; `static_string_id` doubles as a static string table.
    pub enumerations: BTreeMap<String, BTreeMap<String, Value>>,
    /// Firmware build constants.
    pub config: BTreeMap<String, Value>,
    pub version: String,
    pub build_versions: String,
}

/// Which ids belong to a category.
///
/// Older firmware lists ids and keeps formats in `messages`; newer firmware
/// maps each format string straight to its id.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum IdSet {
    Ids(Vec<u32>),
    ByFormat(BTreeMap<String, u32>),
}

impl Default for IdSet {
    fn default() -> Self {
        IdSet::Ids(Vec::new())
    }
}

impl IdSet {
    pub fn contains(&self, msgid: u32) -> bool {
        match self {
            IdSet::Ids(ids) => ids.contains(&msgid),
            IdSet::ByFormat(map) => map.values().any(|&id| id == msgid),
        }
    }

    /// `(id, format)` pairs carried inline, if any.
    pub fn inline_formats(&self) -> Vec<(u32, &str)> {
        match self {
            IdSet::Ids(_) => Vec::new(),
            IdSet::ByFormat(map) => map.iter().map(|(f, &id)| (id, f.as_str())).collect(),
        }
    }
}

impl IdentifyData {
    pub fn from_json(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Inflate the zlib stream the firmware serves through `identify`.
pub fn decompress_identify(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    ZlibDecoder::new(data)
        .take(MAX_IDENTIFY_SIZE + 1)
        .read_to_end(&mut out)
        .map_err(DictError::Decompress)?;
    if out.len() as u64 > MAX_IDENTIFY_SIZE {
        return Err(DictError::Identify(format!(
            "dictionary exceeds {MAX_IDENTIFY_SIZE} bytes"
        )));
    }
    Ok(out)
}
