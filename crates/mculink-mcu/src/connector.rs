use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::thread;
use std::time::Duration;

use mculink_transport::{connect_unix, open_serial, SerialStream};
use tracing::{debug, warn};

use crate::error::Result;

/// Where an MCU is attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// A tty device, configured for `baud`.
    Serial { path: PathBuf, baud: u32 },
    /// A Unix socket, as exposed by simulators and the Linux MCU process.
    Unix(PathBuf),
}

impl Endpoint {
    /// A tty endpoint unless `device` is `unix:<path>`.
    pub fn parse(device: &str, baud: u32) -> Self {
        match device.strip_prefix("unix:") {
            Some(path) => Endpoint::Unix(PathBuf::from(path)),
            None => Endpoint::Serial {
                path: PathBuf::from(device),
                baud,
            },
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            Endpoint::Serial { path, .. } | Endpoint::Unix(path) => path,
        }
    }

    pub fn open(&self) -> Result<SerialStream> {
        let stream = match self {
            Endpoint::Serial { path, baud } => open_serial(path, *baud)?,
            Endpoint::Unix(path) => connect_unix(path)?,
        };
        Ok(stream)
    }
}

impl FromStr for Endpoint {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self::parse(s, 250_000))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Serial { path, baud } => write!(f, "{}@{baud}", path.display()),
            Endpoint::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

/// Opens an endpoint, retrying while the device is not there yet.
#[derive(Debug, Clone)]
pub struct Connector {
    pub endpoint: Endpoint,
    pub attempts: u32,
    pub retry_delay: Duration,
}

impl Connector {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            attempts: 1,
            retry_delay: Duration::from_secs(5),
        }
    }

    pub fn with_retries(self, attempts: u32, retry_delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            retry_delay,
            ..self
        }
    }

    pub fn open(&self) -> Result<SerialStream> {
        let mut attempt = 1;
        loop {
            match self.endpoint.open() {
                Ok(stream) => {
                    debug!(endpoint = %self.endpoint, attempt, "opened mcu endpoint");
                    return Ok(stream);
                }
                Err(err) if attempt < self.attempts => {
                    warn!(endpoint = %self.endpoint, attempt, %err, "unable to open; retrying");
                    thread::sleep(self.retry_delay);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::net::UnixListener;

    use super::*;
    use crate::error::McuError;

    #[test]
    fn parse_device_strings() {
        assert_eq!(
            Endpoint::parse("/dev/ttyACM0", 115_200),
            Endpoint::Serial {
                path: PathBuf::from("/dev/ttyACM0"),
                baud: 115_200
            }
        );
        assert_eq!(
            "unix:/tmp/printer".parse::<Endpoint>().unwrap(),
            Endpoint::Unix(PathBuf::from("/tmp/printer"))
        );
        assert_eq!(Endpoint::parse("unix:/tmp/x", 1).to_string(), "unix:/tmp/x");
        assert_eq!(Endpoint::parse("/dev/ttyS1", 9600).path(), Path::new("/dev/ttyS1"));
    }

    #[test]
    fn opens_unix_socket() {
        let dir = std::env::temp_dir().join(format!("mculink-connector-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("mcu.sock");
        let _ = std::fs::remove_file(&path);
        let _listener = UnixListener::bind(&path).unwrap();

        let stream = Connector::new(Endpoint::Unix(path.clone())).open().unwrap();
        assert_eq!(stream.transport_name(), "unix");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_device_fails_after_retries() {
        let connector = Connector::new(Endpoint::Unix(PathBuf::from("/nonexistent/mcu.sock")))
            .with_retries(2, Duration::from_millis(1));
        let err = connector.open().unwrap_err();
        assert!(matches!(err, McuError::Transport(_)));
    }
}
