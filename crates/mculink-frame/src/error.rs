/// Errors that can occur during block encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The payload does not fit in a single block.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// A VLQ integer ran past the end of its buffer.
    #[error("truncated integer at offset {offset}")]
    Truncated { offset: usize },

    /// A VLQ integer used more bytes than a 32-bit value can need.
    #[error("integer at offset {offset} exceeds 5 bytes")]
    Overlong { offset: usize },

    /// An I/O error occurred while reading or writing blocks.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection was closed before a complete block was received.
    #[error("connection closed (incomplete block)")]
    ConnectionClosed,
}

pub type Result<T> = std::result::Result<T, FrameError>;
