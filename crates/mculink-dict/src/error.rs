/// Errors raised while building, encoding, or decoding dictionary messages.
///
/// Every variant is fatal to the message (or, during identify, to the
/// connection); nothing here is retried silently.
#[derive(Debug, thiserror::Error)]
pub enum DictError {
    /// No message with this name exists in the dictionary.
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    /// The requested format differs from the firmware's definition.
    #[error("command format mismatch: {requested} vs {actual}")]
    FormatMismatch { requested: String, actual: String },

    /// A format string could not be parsed.
    #[error("invalid format '{format}': {reason}")]
    InvalidFormat { format: String, reason: String },

    /// A positional encode received the wrong number of arguments.
    #[error("{message} expects {expected} arguments, got {actual}")]
    ArgumentCount {
        message: String,
        expected: usize,
        actual: usize,
    },

    /// An encode-by-name call was missing a parameter.
    #[error("{message} missing parameter '{param}'")]
    MissingParam { message: String, param: String },

    /// An encode-by-name call named a parameter the format does not have.
    #[error("{message} has no parameter '{param}'")]
    UnknownParam { message: String, param: String },

    /// A value does not fit its wire type.
    #[error("value {value} out of range for {param} ({wire})")]
    OutOfRange {
        param: String,
        value: i64,
        wire: &'static str,
    },

    /// A value has the wrong kind (integer vs. byte string) for its wire type.
    #[error("parameter {param} expects {expected}")]
    WrongKind {
        param: String,
        expected: &'static str,
    },

    /// A textual argument could not be parsed.
    #[error("invalid argument '{0}'")]
    InvalidArgument(String),

    /// The payload ended inside a message or carried trailing bytes.
    #[error("malformed message payload: {0}")]
    Malformed(String),

    /// A low-level integer decode failed.
    #[error("decode error: {0}")]
    Frame(#[from] mculink_frame::FrameError),

    /// The identify payload could not be decompressed.
    #[error("identify data decompression failed: {0}")]
    Decompress(std::io::Error),

    /// The identify payload is not a valid dictionary document.
    #[error("identify data invalid: {0}")]
    Identify(String),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A firmware build constant was requested but not defined.
    #[error("firmware constant {0} not defined")]
    MissingConstant(String),

    /// A firmware build constant has an unexpected type.
    #[error("firmware constant {name} is not a {expected}")]
    InvalidConstant {
        name: String,
        expected: &'static str,
    },
}

pub type Result<T> = std::result::Result<T, DictError>;
