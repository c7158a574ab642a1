use bytes::Bytes;
use mculink_dict::{MessageFormat, MessageParams, ParamValue};
use mculink_queue::CommandQueue;

use crate::error::Result;
use crate::handler::SerialHandler;

/// A firmware command resolved against the dictionary, bound to a queue.
#[derive(Debug, Clone)]
pub struct Command {
    handler: SerialHandler,
    format: MessageFormat,
    queue: CommandQueue,
}

impl Command {
    pub(crate) fn new(handler: SerialHandler, format: MessageFormat, queue: CommandQueue) -> Self {
        Self {
            handler,
            format,
            queue,
        }
    }

    /// The same command on another command queue.
    pub fn with_queue(self, queue: CommandQueue) -> Self {
        Self { queue, ..self }
    }

    pub fn format(&self) -> &MessageFormat {
        &self.format
    }

    pub fn queue(&self) -> CommandQueue {
        self.queue
    }

    /// Encode positional arguments.
    pub fn encode(&self, args: &[ParamValue]) -> Result<Bytes> {
        Ok(self.format.encode(args)?)
    }

    /// Queue the command for execution no earlier than `min_clock`.
    ///
    /// `req_clock` is when the MCU needs it by; zero for both means
    /// "as soon as possible".
    pub fn send(&self, args: &[ParamValue], min_clock: u64, req_clock: u64) -> Result<()> {
        let cmd = self.encode(args)?;
        self.handler.raw_send(cmd, min_clock, req_clock, self.queue)
    }

    /// Queue the command and wait until the MCU acknowledges its block.
    pub fn send_wait_ack(&self, args: &[ParamValue]) -> Result<f64> {
        let cmd = self.encode(args)?;
        self.handler.raw_send_wait_ack(cmd, 0, 0, self.queue)
    }

    /// Send and wait for the `response` message (matching `oid` if given).
    pub fn send_with_response(
        &self,
        args: &[ParamValue],
        response: &str,
        oid: Option<i64>,
    ) -> Result<MessageParams> {
        let cmd = self.encode(args)?;
        self.handler
            .send_bytes_with_response(cmd, response, oid, self.queue)
    }
}
