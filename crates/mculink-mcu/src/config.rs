use std::time::Duration;

use mculink_queue::QueueConfig;

/// Identify handshake tuning.
#[derive(Debug, Clone)]
pub struct IdentifyConfig {
    /// Bytes requested per `identify` command.
    pub chunk_size: u8,
    /// Offset mismatches tolerated before giving up.
    pub max_offset_mismatches: usize,
}

impl Default for IdentifyConfig {
    fn default() -> Self {
        Self {
            chunk_size: 40,
            max_offset_mismatches: 16,
        }
    }
}

/// Settings for one MCU connection.
#[derive(Debug, Clone)]
pub struct McuConfig {
    /// Name used in logs, errors and shutdown events.
    pub name: String,
    /// Serial line rate; also the wire-time estimate unless the firmware
    /// reports `SERIAL_BAUD`.
    pub baud: u32,
    /// Give up on `send_with_response` after this long.
    pub response_timeout: Duration,
    /// Resend a query if no response arrived within this interval.
    pub retry_interval: Duration,
    pub identify: IdentifyConfig,
    pub queue: QueueConfig,
}

impl Default for McuConfig {
    fn default() -> Self {
        Self {
            name: "mcu".to_string(),
            baud: 250_000,
            response_timeout: Duration::from_secs(5),
            retry_interval: Duration::from_millis(500),
            identify: IdentifyConfig::default(),
            queue: QueueConfig::default(),
        }
    }
}

impl McuConfig {
    /// Defaults with a different name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub(crate) fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            baud: self.baud,
            thread_name: format!("{}-serialqueue", self.name),
            ..self.queue.clone()
        }
    }
}
