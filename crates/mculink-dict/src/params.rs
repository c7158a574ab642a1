use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::types::ParamValue;

/// A decoded message: parameter name to value, plus `#`-prefixed metadata
/// (`#name`, `#sent_time`, `#receive_time`, `#msg`, `#msgid`).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct MessageParams {
    values: BTreeMap<String, ParamValue>,
}

impl MessageParams {
    /// An empty map tagged with `#name`.
    pub fn named(name: &str) -> Self {
        let mut params = Self::default();
        params.insert("#name", name);
        params
    }

    /// The message name (`#name`), or `""` when untagged.
    pub fn name(&self) -> &str {
        self.get_str("#name").unwrap_or("")
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<ParamValue>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&ParamValue> {
        self.values.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(ParamValue::as_int)
    }

    pub fn get_u32(&self, key: &str) -> Option<u32> {
        self.get_int(key).and_then(|v| u32::try_from(v).ok())
    }

    pub fn get_float(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(ParamValue::as_float)
    }

    pub fn get_bytes(&self, key: &str) -> Option<&[u8]> {
        self.get(key).and_then(ParamValue::as_bytes)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(ParamValue::as_str)
    }

    /// Host time the command that provoked this response was sent, if known.
    pub fn sent_time(&self) -> f64 {
        self.get_float("#sent_time").unwrap_or(0.0)
    }

    /// Host time this message was received.
    pub fn receive_time(&self) -> f64 {
        self.get_float("#receive_time").unwrap_or(0.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl fmt::Display for MessageParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (idx, (key, value)) in self.values.iter().enumerate() {
            if idx > 0 {
                f.write_str(", ")?;
            }
            write!(f, "'{key}': {value}")?;
        }
        f.write_str("}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_accessors() {
        let mut params = MessageParams::named("clock");
        params.insert("clock", 123u32);
        params.insert("#sent_time", 4.5);
        params.insert("data", b"xyz".as_slice());

        assert_eq!(params.name(), "clock");
        assert_eq!(params.get_u32("clock"), Some(123));
        assert_eq!(params.get_float("clock"), Some(123.0));
        assert_eq!(params.sent_time(), 4.5);
        assert_eq!(params.receive_time(), 0.0);
        assert_eq!(params.get_bytes("data"), Some(b"xyz".as_slice()));
        assert_eq!(params.get_int("missing"), None);
        assert_eq!(params.len(), 4);
    }

    #[test]
    fn negative_not_u32() {
        let mut params = MessageParams::default();
        params.insert("v", -1i32);
        assert_eq!(params.get_u32("v"), None);
        assert_eq!(params.name(), "");
    }

    #[test]
    fn serializes_as_object() {
        let mut params = MessageParams::named("uptime");
        params.insert("high", 0u32);
        let json = serde_json::to_value(&params).unwrap();
        assert_eq!(json["#name"], "uptime");
        assert_eq!(json["high"], 0);
    }
}
