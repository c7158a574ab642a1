//! Host-side connection to one MCU.
//!
//! [`Mcu`] ties together the pieces below it:
//! - a [`SerialHandler`] that owns the transport, decodes incoming blocks
//!   with the firmware's dictionary, and dispatches them to callbacks
//! - the identify handshake that downloads that dictionary
//! - [`ClockSync`] (and [`SecondarySync`] for additional MCUs) mapping host
//!   time to MCU clock ticks and print time
//! - shutdown propagation as [`ShutdownEvent`]s

pub mod clocksync;
pub mod command;
pub mod config;
pub mod connector;
pub mod error;
pub mod handler;
pub mod identify;
pub mod mcu;
pub mod shutdown;

pub use clocksync::{ClockSync, SecondarySync};
pub use command::Command;
pub use config::{IdentifyConfig, McuConfig};
pub use connector::{Connector, Endpoint};
pub use error::{McuError, Result};
pub use handler::{ResponseHandler, SerialHandler};
pub use identify::identify;
pub use mcu::Mcu;
pub use shutdown::{error_help, ShutdownEvent};
