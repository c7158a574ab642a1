use std::collections::VecDeque;

use crate::message::QueueMessage;

/// Handle to one logical command channel within a [`crate::SerialQueue`].
///
/// Messages on one queue go out in submission order. Across queues, the
/// message with the lowest requested clock is sent first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandQueue(usize);

impl CommandQueue {
    pub(crate) fn from_slot(slot: usize) -> Self {
        Self(slot)
    }

    pub fn id(&self) -> usize {
        self.0
    }
}

/// The FIFO pair behind a [`CommandQueue`].
#[derive(Debug, Default)]
pub(crate) struct QueueSlot {
    /// Waiting for their minimum clock.
    pub(crate) stalled: VecDeque<QueueMessage>,
    /// Eligible for the next block.
    pub(crate) ready: VecDeque<QueueMessage>,
}

impl QueueSlot {
    pub(crate) fn is_empty(&self) -> bool {
        self.stalled.is_empty() && self.ready.is_empty()
    }

    /// `(stalled, ready)` byte totals.
    pub(crate) fn queued_bytes(&self) -> (usize, usize) {
        let stalled = self.stalled.iter().map(QueueMessage::len).sum();
        let ready = self.ready.iter().map(QueueMessage::len).sum();
        (stalled, ready)
    }
}
