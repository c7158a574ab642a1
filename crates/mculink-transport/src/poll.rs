use std::io::ErrorKind;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};

use crate::error::Result;

const SERIAL: Token = Token(0);
const WAKE: Token = Token(1);

/// Which sources became ready during a [`Poller::wait`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    /// The serial descriptor has bytes to read (or hung up).
    pub readable: bool,
    /// Another thread called [`Waker::wake`].
    pub woken: bool,
}

/// Waits for serial input, a deadline, or an explicit wake.
///
/// Readiness is edge-triggered: after `readable` the caller must read until
/// `WouldBlock` or it will not be told about the remaining bytes.
#[derive(Debug)]
pub struct Poller {
    poll: Poll,
    events: Events,
    serial_fd: RawFd,
    waker: Waker,
}

/// Cloneable handle that interrupts a blocked [`Poller::wait`].
#[derive(Debug, Clone)]
pub struct Waker {
    inner: Arc<mio::Waker>,
}

impl Waker {
    /// Interrupt the poller. Extra wakes coalesce.
    pub fn wake(&self) {
        if let Err(err) = self.inner.wake() {
            tracing::debug!(%err, "wake failed");
        }
    }
}

impl Poller {
    /// Build a poller for `serial` (anything with a raw descriptor).
    ///
    /// The descriptor must outlive the poller.
    pub fn new(serial: &impl AsRawFd) -> Result<Self> {
        let poll = Poll::new()?;
        let serial_fd = serial.as_raw_fd();
        poll.registry()
            .register(&mut SourceFd(&serial_fd), SERIAL, Interest::READABLE)?;
        let waker = Waker {
            inner: Arc::new(mio::Waker::new(poll.registry(), WAKE)?),
        };
        Ok(Self {
            poll,
            events: Events::with_capacity(4),
            serial_fd,
            waker,
        })
    }

    /// A handle other threads use to interrupt [`Poller::wait`].
    pub fn waker(&self) -> Waker {
        self.waker.clone()
    }

    /// Block until the serial fd is readable, a wake arrives, or `timeout`
    /// elapses. `None` waits indefinitely.
    pub fn wait(&mut self, timeout: Option<Duration>) -> Result<Readiness> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::Interrupted => return Ok(Readiness::default()),
            Err(err) => return Err(err.into()),
        }

        let mut readiness = Readiness::default();
        for event in self.events.iter() {
            match event.token() {
                SERIAL => {
                    readiness.readable |=
                        event.is_readable() || event.is_read_closed() || event.is_error();
                }
                WAKE => readiness.woken = true,
                _ => {}
            }
        }
        Ok(readiness)
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        let _ = self
            .poll
            .registry()
            .deregister(&mut SourceFd(&self.serial_fd));
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::os::unix::net::UnixStream;
    use std::time::Instant;

    use super::*;

    #[test]
    fn timeout_without_activity() {
        let (a, _b) = UnixStream::pair().unwrap();
        let mut poller = Poller::new(&a).unwrap();

        let start = Instant::now();
        let ready = poller.wait(Some(Duration::from_millis(20))).unwrap();
        assert_eq!(ready, Readiness::default());
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn serial_input_reported() {
        let (a, mut b) = UnixStream::pair().unwrap();
        let mut poller = Poller::new(&a).unwrap();

        b.write_all(b"\x7e").unwrap();
        let ready = poller.wait(Some(Duration::from_secs(1))).unwrap();
        assert!(ready.readable);
        assert!(!ready.woken);
    }

    #[test]
    fn wake_from_other_thread() {
        let (a, _b) = UnixStream::pair().unwrap();
        let mut poller = Poller::new(&a).unwrap();
        let waker = poller.waker();

        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            waker.wake();
            waker.wake();
        });

        let ready = poller.wait(Some(Duration::from_secs(5))).unwrap();
        assert!(ready.woken);
        handle.join().unwrap();

        // Pick up a second wake that may have landed after the first drain.
        poller.wait(Some(Duration::from_millis(5))).unwrap();
        let ready = poller.wait(Some(Duration::from_millis(5))).unwrap();
        assert!(!ready.woken);
    }
}
