use std::fmt;
use std::io;

use mculink_dict::DictError;
use mculink_mcu::McuError;
use mculink_queue::QueueError;
use mculink_transport::TransportError;

// Exit codes follow the sysexits-style scheme shared with the rest of the tooling.
pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
pub const MCU_SHUTDOWN: i32 = 40;
pub const PERMISSION_DENIED: i32 = 50;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused => FAILURE,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn transport_error(context: &str, err: TransportError) -> CliError {
    match err {
        TransportError::Open { source, .. }
        | TransportError::Connect { source, .. }
        | TransportError::Io(source) => io_error(context, source),
        TransportError::UnsupportedBaud(_) => CliError::new(USAGE, format!("{context}: {err}")),
        other => CliError::new(TRANSPORT_ERROR, format!("{context}: {other}")),
    }
}

pub fn queue_error(context: &str, err: QueueError) -> CliError {
    match err {
        QueueError::Transport(err) => transport_error(context, err),
        QueueError::MessageTooLarge { .. } => {
            CliError::new(DATA_INVALID, format!("{context}: {err}"))
        }
        QueueError::Shutdown => CliError::new(MCU_SHUTDOWN, format!("{context}: {err}")),
        QueueError::Exited => CliError::new(FAILURE, format!("{context}: {err}")),
        other => CliError::new(INTERNAL, format!("{context}: {other}")),
    }
}

pub fn dict_error(context: &str, err: DictError) -> CliError {
    match err {
        DictError::UnknownCommand(_)
        | DictError::UnknownParam { .. }
        | DictError::MissingParam { .. }
        | DictError::InvalidArgument(_) => CliError::new(USAGE, format!("{context}: {err}")),
        other => CliError::new(DATA_INVALID, format!("{context}: {other}")),
    }
}

pub fn mcu_error(context: &str, err: McuError) -> CliError {
    match err {
        McuError::Transport(err) => transport_error(context, err),
        McuError::Queue(err) => queue_error(context, err),
        McuError::Dict(err) => dict_error(context, err),
        McuError::Timeout { .. } => CliError::new(TIMEOUT, format!("{context}: {err}")),
        McuError::Identify { .. } | McuError::MissingField { .. } => {
            CliError::new(DATA_INVALID, format!("{context}: {err}"))
        }
        McuError::Disconnected { .. } => CliError::new(FAILURE, format!("{context}: {err}")),
        McuError::Connect { mcu, source } => {
            mcu_error(&format!("{context}: mcu '{mcu}'"), *source)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_errors_keep_mcu_name_and_inner_code() {
        let err = McuError::Connect {
            mcu: "toolhead".to_string(),
            source: Box::new(McuError::Timeout {
                mcu: "toolhead".to_string(),
                response: "identify_response".to_string(),
            }),
        };
        let cli = mcu_error("connect failed", err);
        assert_eq!(cli.code, TIMEOUT);
        assert!(cli.message.contains("mcu 'toolhead'"));
    }

    #[test]
    fn missing_device_is_failure() {
        let err = TransportError::Open {
            path: "/dev/ttyNOPE".into(),
            source: io::Error::from(io::ErrorKind::NotFound),
        };
        assert_eq!(transport_error("open", err).code, FAILURE);
        assert_eq!(
            transport_error("open", TransportError::UnsupportedBaud(12)).code,
            USAGE
        );
    }

    #[test]
    fn shutdown_has_its_own_code() {
        let cli = mcu_error("send", McuError::Queue(QueueError::Shutdown));
        assert_eq!(cli.code, MCU_SHUTDOWN);
    }
}
