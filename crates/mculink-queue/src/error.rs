/// Errors surfaced by the command transport.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] mculink_transport::TransportError),

    /// Block-level error.
    #[error("frame error: {0}")]
    Frame(#[from] mculink_frame::FrameError),

    /// A single message cannot fit in one block.
    #[error("message too large ({size} bytes, max {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// The command queue handle was freed or belongs to another transport.
    #[error("unknown command queue {0}")]
    UnknownQueue(usize),

    /// The MCU reported a shutdown; only urgent messages are accepted.
    #[error("mcu is shut down")]
    Shutdown,

    /// The background thread has stopped.
    #[error("transport exited")]
    Exited,

    /// Failed to start the background thread.
    #[error("failed to spawn transport thread: {0}")]
    Spawn(std::io::Error),
}

pub type Result<T> = std::result::Result<T, QueueError>;
