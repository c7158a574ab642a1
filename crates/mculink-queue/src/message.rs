use bytes::Bytes;
use mculink_frame::{MESSAGE_HEADER_SIZE, MESSAGE_MIN, MESSAGE_TRAILER_SIZE};

/// Requested clock for messages with no deadline; sent when the link is idle.
pub const BACKGROUND_PRIORITY_CLOCK: u64 = 0x7fff_ffff_0000_0000;
/// Largest clock value the scheduler compares against.
pub const MAX_CLOCK: u64 = 0x7fff_ffff_ffff_ffff;

/// Where a message is in its life.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MessagePhase {
    /// Waiting in a command queue.
    Queued {
        /// Do not transmit before the MCU clock can have reached this value.
        min_clock: u64,
        /// Scheduling priority; lower is sent first.
        req_clock: u64,
    },
    /// On the wire (sent blocks) or delivered to a consumer (received blocks).
    Sent {
        /// Host time of the send that this message answers, or 0.0 if unknown.
        sent_time: f64,
        /// Host time of receipt (or of expected completion for sent blocks).
        receive_time: f64,
    },
}

/// One command, one outgoing block, or one received block.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueMessage {
    data: Bytes,
    phase: MessagePhase,
    notify_id: u64,
}

impl QueueMessage {
    /// An encoded command with its scheduling constraints.
    pub fn new(data: impl Into<Bytes>, min_clock: u64, req_clock: u64) -> Self {
        Self {
            data: data.into(),
            phase: MessagePhase::Queued {
                min_clock,
                req_clock,
            },
            notify_id: 0,
        }
    }

    /// A command with no timing constraints that is sent as soon as possible.
    pub fn immediate(data: impl Into<Bytes>) -> Self {
        Self::new(data, 0, 0)
    }

    /// A command sent only when nothing more urgent is ready.
    pub fn background(data: impl Into<Bytes>) -> Self {
        Self::new(data, 0, BACKGROUND_PRIORITY_CLOCK)
    }

    pub(crate) fn sent(data: Bytes, sent_time: f64, receive_time: f64, notify_id: u64) -> Self {
        Self {
            data,
            phase: MessagePhase::Sent {
                sent_time,
                receive_time,
            },
            notify_id,
        }
    }

    /// Ask for a notification (via [`crate::SerialQueue::pull`]) once the
    /// block carrying this message is acknowledged.
    pub fn with_notify(mut self, notify_id: u64) -> Self {
        self.notify_id = notify_id;
        self
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn phase(&self) -> MessagePhase {
        self.phase
    }

    pub fn notify_id(&self) -> u64 {
        self.notify_id
    }

    /// True for an acknowledgement notification rather than received data.
    pub fn is_notification(&self) -> bool {
        self.notify_id != 0 && self.data.is_empty()
    }

    pub fn min_clock(&self) -> Option<u64> {
        match self.phase {
            MessagePhase::Queued { min_clock, .. } => Some(min_clock),
            MessagePhase::Sent { .. } => None,
        }
    }

    pub fn req_clock(&self) -> Option<u64> {
        match self.phase {
            MessagePhase::Queued { req_clock, .. } => Some(req_clock),
            MessagePhase::Sent { .. } => None,
        }
    }

    pub fn sent_time(&self) -> Option<f64> {
        match self.phase {
            MessagePhase::Sent { sent_time, .. } => Some(sent_time),
            MessagePhase::Queued { .. } => None,
        }
    }

    pub fn receive_time(&self) -> Option<f64> {
        match self.phase {
            MessagePhase::Sent { receive_time, .. } => Some(receive_time),
            MessagePhase::Queued { .. } => None,
        }
    }

    /// For a whole block, the bytes between header and trailer.
    pub fn block_payload(&self) -> &[u8] {
        if self.data.len() < MESSAGE_MIN {
            return &[];
        }
        &self.data[MESSAGE_HEADER_SIZE..self.data.len() - MESSAGE_TRAILER_SIZE]
    }

    pub(crate) fn set_min_clock(&mut self, clock: u64) {
        if let MessagePhase::Queued { min_clock, .. } = &mut self.phase {
            *min_clock = clock;
        }
    }
}
