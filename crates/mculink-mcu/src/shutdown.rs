use std::fmt;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Mutex, PoisonError};

use serde::Serialize;

/// Shutdown reasons with a known explanation, keyed by message prefix.
const COMMON_ERRORS: &[(&[&str], &str)] = &[
    (
        &["Timer too close"],
        "This often indicates the host computer is overloaded. Check for \
         other processes consuming excessive CPU time, high swap usage, disk \
         errors, overheating, unstable voltage, or similar system problems \
         on the host computer.",
    ),
    (
        &["Missed scheduling of next "],
        "This is generally indicative of an intermittent communication \
         failure between micro-controller and host.",
    ),
    (
        &["ADC out of range"],
        "This generally occurs when a heater temperature exceeds its \
         configured min_temp or max_temp.",
    ),
    (
        &["Rescheduled timer in the past", "Stepper too far in past"],
        "This generally occurs when the micro-controller has been requested \
         to step at a rate higher than it is capable of obtaining.",
    ),
    (
        &["Command request"],
        "This generally occurs in response to an emergency stop request or \
         an internal error in the host software.",
    ),
];

/// Explanation for a firmware shutdown message, if it is a common one.
pub fn error_help(msg: &str) -> Option<&'static str> {
    COMMON_ERRORS
        .iter()
        .find(|(prefixes, _)| prefixes.iter().any(|p| msg.starts_with(p)))
        .map(|(_, help)| *help)
}

/// The MCU stopped executing commands.
#[derive(Debug, Clone, Serialize)]
pub struct ShutdownEvent {
    pub mcu: String,
    /// `shutdown`, `is_shutdown`, or `lost_communication`.
    pub event_type: String,
    pub reason: String,
    /// MCU clock at the time of shutdown, when reported.
    pub clock: Option<u64>,
    pub hint: Option<&'static str>,
}

impl ShutdownEvent {
    pub fn new(mcu: &str, event_type: &str, reason: impl Into<String>, clock: Option<u64>) -> Self {
        let reason = reason.into();
        Self {
            mcu: mcu.to_string(),
            event_type: event_type.to_string(),
            hint: error_help(&reason),
            reason,
            clock,
        }
    }
}

impl fmt::Display for ShutdownEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MCU '{}' {}: {}", self.mcu, self.event_type, self.reason)?;
        if let Some(hint) = self.hint {
            write!(f, "\n{hint}")?;
        }
        Ok(())
    }
}

/// Fan-out of shutdown events to any number of subscribers.
#[derive(Debug, Default)]
pub(crate) struct ShutdownBus {
    subscribers: Mutex<Vec<Sender<ShutdownEvent>>>,
}

impl ShutdownBus {
    pub(crate) fn subscribe(&self) -> Receiver<ShutdownEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    /// Deliver to every live subscriber, pruning dropped ones.
    pub(crate) fn publish(&self, event: &ShutdownEvent) {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}
