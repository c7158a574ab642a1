use std::path::Path;
use std::time::Duration;

use serialport::{DataBits, FlowControl, Parity, StopBits};
use tracing::info;

use crate::error::{Result, TransportError};
use crate::stream::SerialStream;

/// Open a tty device in raw 8N1 mode at `baud`.
///
/// Non-standard rates such as 250000 are set through the platform's
/// arbitrary-speed interface. USB CDC devices ignore the rate entirely.
pub fn open_serial(path: impl AsRef<Path>, baud: u32) -> Result<SerialStream> {
    let path = path.as_ref();
    if baud == 0 {
        return Err(TransportError::UnsupportedBaud(baud));
    }

    let port = serialport::new(path.to_string_lossy(), baud)
        .data_bits(DataBits::Eight)
        .stop_bits(StopBits::One)
        .parity(Parity::None)
        .flow_control(FlowControl::None)
        .timeout(Duration::ZERO)
        .open_native()
        .map_err(|err| match err.kind() {
            serialport::ErrorKind::InvalidInput => TransportError::Configure {
                path: path.to_path_buf(),
                source: err.into(),
            },
            _ => TransportError::Open {
                path: path.to_path_buf(),
                source: err.into(),
            },
        })?;

    info!(?path, baud, "opened serial device");
    Ok(SerialStream::from_tty(port))
}
