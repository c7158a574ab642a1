use mculink_dict::DictError;
use mculink_queue::QueueError;
use mculink_transport::TransportError;

/// Errors from an MCU connection.
#[derive(Debug, thiserror::Error)]
pub enum McuError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Command transport error.
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    /// Dictionary or encoding error.
    #[error("dictionary error: {0}")]
    Dict(#[from] DictError),

    /// No matching response arrived in time.
    #[error("mcu '{mcu}': timeout waiting for '{response}'")]
    Timeout { mcu: String, response: String },

    /// A response lacked a field the host depends on.
    #[error("mcu '{mcu}': '{message}' response missing '{field}'")]
    MissingField {
        mcu: String,
        message: String,
        field: String,
    },

    /// The identify handshake failed.
    #[error("mcu '{mcu}': identify failed: {reason}")]
    Identify { mcu: String, reason: String },

    /// The connection has been closed.
    #[error("mcu '{mcu}': disconnected")]
    Disconnected { mcu: String },

    /// Wraps an error raised while connecting, naming the MCU.
    #[error("mcu '{mcu}': unable to connect: {source}")]
    Connect {
        mcu: String,
        #[source]
        source: Box<McuError>,
    },
}

impl McuError {
    pub(crate) fn connect(mcu: &str, source: McuError) -> Self {
        match source {
            already @ McuError::Connect { .. } => already,
            other => McuError::Connect {
                mcu: mcu.to_string(),
                source: Box::new(other),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, McuError>;
