//! Reliable command transport to an MCU.
//!
//! A [`SerialQueue`] owns one serial stream and a background thread that:
//! - reads and validates incoming blocks, tracking acknowledgements
//! - retransmits the unacknowledged window on timeout or NAK
//! - packs ready commands from every [`CommandQueue`] into outgoing blocks,
//!   ordered by requested clock, once their minimum clock is reachable
//!
//! Everything mutable lives behind one mutex; decoded blocks are handed to
//! consumers through [`SerialQueue::pull`].

pub mod clock_est;
pub mod command_queue;
pub mod error;
pub mod message;
pub mod rtt;
pub mod serialqueue;
pub mod stats;
pub mod time;

mod state;

pub use clock_est::ClockEstimate;
pub use error::{QueueError, Result};
pub use command_queue::CommandQueue;
pub use message::{MessagePhase, QueueMessage, BACKGROUND_PRIORITY_CLOCK, MAX_CLOCK};
pub use rtt::RttEstimator;
pub use serialqueue::{LinkState, QueueConfig, SerialQueue};
pub use stats::QueueStats;
pub use time::monotonic;
