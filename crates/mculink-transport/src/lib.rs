//! Serial byte-stream transport for MCU links.
//!
//! Provides a unified stream over the byte pipes an MCU can be reached through:
//! - A tty device configured for raw mode at a given baud rate
//! - A Unix domain socket (simulators, host-process firmware)
//!
//! This is the lowest layer of mculink. The reliability engine drives a
//! [`SerialStream`] through a [`Poller`] that also carries a mio waker, so
//! producers on other threads can interrupt a blocking wait.

#![cfg(unix)]

pub mod error;
pub mod poll;
pub mod stream;
pub mod tty;
pub mod unix;

pub use error::{Result, TransportError};
pub use poll::{Poller, Readiness, Waker};
pub use stream::SerialStream;
pub use tty::open_serial;
pub use unix::connect_unix;
