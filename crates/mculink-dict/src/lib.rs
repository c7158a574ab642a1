//! Message dictionary for the MCU serial protocol.
//!
//! The firmware describes its own wire protocol. A connection starts with
//! two bootstrap formats (`identify` / `identify_response`), downloads a
//! zlib-compressed JSON dictionary in chunks, and from then on every message
//! id is resolved through the installed [`MessageDictionary`].

pub mod dictionary;
pub mod error;
pub mod format;
pub mod identify;
pub mod params;
pub mod types;

pub use dictionary::{MessageDictionary, MessageKind, IDENTIFY_FORMAT, IDENTIFY_RESPONSE_FORMAT};
pub use error::{DictError, Result};
pub use format::{MessageFormat, MsgFormat, OutputFormat, UnknownFormat};
pub use identify::{decompress_identify, IdentifyData};
pub use params::MessageParams;
pub use types::{ParamValue, WireType};
