//! Host-side link to Klipper-style MCU firmware.
//!
//! # Crate Structure
//!
//! - [`transport`]: serial byte streams (tty, Unix socket) and wakeups
//! - [`frame`]: VLQ integers and CRC-checked, sequenced blocks
//! - [`dict`]: the firmware's self-described message dictionary
//! - [`queue`]: the reliable, ordered, flow-controlled command transport
//! - [`mcu`]: identify, clock synchronization and the MCU facade (behind the
//!   `mcu` feature)

/// Re-export transport types.
pub mod transport {
    pub use mculink_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use mculink_frame::*;
}

/// Re-export dictionary types.
pub mod dict {
    pub use mculink_dict::*;
}

/// Re-export queue types.
pub mod queue {
    pub use mculink_queue::*;
}

/// Re-export MCU types (requires `mcu` feature).
#[cfg(feature = "mcu")]
pub mod mcu {
    pub use mculink_mcu::*;
}
