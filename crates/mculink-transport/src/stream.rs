use std::io::{ErrorKind, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::time::Duration;

use serialport::{ClearBuffer, SerialPort, TTYPort};

use crate::error::Result;

/// Read/write timeout for a tty in blocking mode.
const TTY_BLOCKING_TIMEOUT: Duration = Duration::from_secs(3600);

/// A connected byte stream to an MCU: implements Read + Write.
///
/// Wraps either an opened tty device or a Unix domain socket. Both variants
/// expose a raw file descriptor so the reliability engine can poll them.
pub struct SerialStream {
    inner: SerialStreamInner,
}

enum SerialStreamInner {
    Tty(TTYPort),
    Unix(UnixStream),
}

/// A tty with a zero timeout reports "not ready" as `TimedOut`.
fn tty_would_block(err: std::io::Error) -> std::io::Error {
    if err.kind() == ErrorKind::TimedOut {
        ErrorKind::WouldBlock.into()
    } else {
        err
    }
}

impl Read for SerialStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match &mut self.inner {
            SerialStreamInner::Tty(port) => port.read(buf).map_err(tty_would_block),
            SerialStreamInner::Unix(stream) => stream.read(buf),
        }
    }
}

impl Write for SerialStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match &mut self.inner {
            SerialStreamInner::Tty(port) => port.write(buf).map_err(tty_would_block),
            SerialStreamInner::Unix(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match &mut self.inner {
            // Written bytes are already in the kernel queue; never tcdrain here.
            SerialStreamInner::Tty(_) => Ok(()),
            SerialStreamInner::Unix(stream) => stream.flush(),
        }
    }
}

impl SerialStream {
    /// Wrap a connected Unix domain socket.
    pub fn from_unix(stream: UnixStream) -> Self {
        Self {
            inner: SerialStreamInner::Unix(stream),
        }
    }

    /// Wrap an already configured tty port.
    pub fn from_tty(port: TTYPort) -> Self {
        Self {
            inner: SerialStreamInner::Tty(port),
        }
    }

    /// Switch between blocking and non-blocking reads and writes.
    ///
    /// A tty stays in blocking mode at the descriptor level; a zero port
    /// timeout makes unready reads and writes return `WouldBlock`.
    pub fn set_nonblocking(&mut self, nonblocking: bool) -> Result<()> {
        match &mut self.inner {
            SerialStreamInner::Unix(stream) => stream.set_nonblocking(nonblocking)?,
            SerialStreamInner::Tty(port) => {
                let timeout = if nonblocking {
                    Duration::ZERO
                } else {
                    TTY_BLOCKING_TIMEOUT
                };
                port.set_timeout(timeout).map_err(std::io::Error::from)?;
            }
        }
        Ok(())
    }

    /// Try to clone this stream (creates a new file descriptor).
    pub fn try_clone(&self) -> Result<Self> {
        let inner = match &self.inner {
            SerialStreamInner::Tty(port) => SerialStreamInner::Tty(
                port.try_clone_native().map_err(std::io::Error::from)?,
            ),
            SerialStreamInner::Unix(stream) => SerialStreamInner::Unix(stream.try_clone()?),
        };
        Ok(Self { inner })
    }

    /// Discard bytes queued for output but not yet transmitted.
    ///
    /// Used before a retransmit so stale copies of the window do not reach
    /// the wire twice. Sockets have no output queue to drop.
    pub fn discard_output(&self) -> Result<()> {
        match &self.inner {
            SerialStreamInner::Unix(_) => Ok(()),
            SerialStreamInner::Tty(port) => {
                port.clear(ClearBuffer::Output)
                    .map_err(std::io::Error::from)?;
                Ok(())
            }
        }
    }

    /// Short transport name for diagnostics.
    pub fn transport_name(&self) -> &'static str {
        match &self.inner {
            SerialStreamInner::Tty(_) => "tty",
            SerialStreamInner::Unix(_) => "unix-socket",
        }
    }
}

impl AsRawFd for SerialStream {
    fn as_raw_fd(&self) -> RawFd {
        match &self.inner {
            SerialStreamInner::Tty(port) => port.as_raw_fd(),
            SerialStreamInner::Unix(stream) => stream.as_raw_fd(),
        }
    }
}

impl std::fmt::Debug for SerialStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialStream")
            .field("type", &self.transport_name())
            .field("fd", &self.as_raw_fd())
            .finish()
    }
}
