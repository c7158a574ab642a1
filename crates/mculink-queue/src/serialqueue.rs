use std::io::{ErrorKind, Read};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use mculink_frame::{vlq, BlockDecoder, BlockWriter, FrameError};
use mculink_transport::{Poller, SerialStream, Waker};
use tracing::{debug, error, trace};

use crate::clock_est::ClockEstimate;
use crate::error::{QueueError, Result};
use crate::command_queue::CommandQueue;
use crate::message::QueueMessage;
use crate::state::LinkCore;
use crate::stats::QueueStats;
use crate::time::{monotonic, NEVER};

const READ_CHUNK_SIZE: usize = 4096;

/// Transport tuning.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Most blocks allowed in flight without acknowledgement.
    pub max_pending_blocks: u64,
    /// MCU receive buffer size in bytes; `0` means unlimited.
    pub receive_window: usize,
    /// Line rate used to estimate wire time; `0` disables the adjustment.
    pub baud: u32,
    /// Sent and received blocks kept for [`SerialQueue::extract_old`].
    pub history_len: usize,
    /// Name of the transport thread.
    pub thread_name: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_pending_blocks: 12,
            receive_window: 0,
            baud: 250_000,
            history_len: 100,
            thread_name: "mculink-serialqueue".to_string(),
        }
    }
}

/// Link lifecycle as seen by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// No valid block received yet; the MCU's sequence is adopted.
    Connecting,
    /// Exchanging blocks normally.
    Synchronized,
    /// The MCU reported a fatal error; only urgent sends are accepted.
    Shutdown,
}

struct Shared {
    core: Mutex<LinkCore>,
    receive_cond: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, LinkCore> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Reliable, ordered command transport over one serial stream.
///
/// A background thread does all reading, writing and timing. Producers queue
/// messages with [`send`](Self::send) from any thread; consumers receive
/// blocks and acknowledgement notifications with [`pull`](Self::pull).
pub struct SerialQueue {
    shared: Arc<Shared>,
    waker: Waker,
    thread: Mutex<Option<JoinHandle<()>>>,
    transport: &'static str,
}

impl SerialQueue {
    /// Take ownership of `stream` and start the transport thread.
    pub fn new(mut stream: SerialStream, config: QueueConfig) -> Result<Self> {
        stream.set_nonblocking(true)?;
        let reader = stream.try_clone()?;
        let poller = Poller::new(&reader)?;
        let waker = poller.waker();
        let transport = stream.transport_name();

        let shared = Arc::new(Shared {
            core: Mutex::new(LinkCore::new(&config)),
            receive_cond: Condvar::new(),
        });
        let io = IoLoop {
            shared: Arc::clone(&shared),
            poller,
            reader,
            writer: BlockWriter::new(stream),
            decoder: BlockDecoder::new(),
        };
        let handle = thread::Builder::new()
            .name(config.thread_name.clone())
            .spawn(move || io.run())
            .map_err(QueueError::Spawn)?;
        debug!(transport, ?config, "serial queue started");

        Ok(Self {
            shared,
            waker,
            thread: Mutex::new(Some(handle)),
            transport,
        })
    }

    /// Kind of stream underneath (`"tty"` or `"unix"`).
    pub fn transport_name(&self) -> &'static str {
        self.transport
    }

    pub fn alloc_command_queue(&self) -> CommandQueue {
        self.shared.lock().alloc_queue()
    }

    /// Release a command queue, discarding anything still queued on it.
    pub fn free_command_queue(&self, cq: CommandQueue) -> Result<()> {
        self.shared.lock().free_queue(cq)
    }

    /// Queue one message.
    pub fn send(&self, cq: CommandQueue, msg: QueueMessage) -> Result<()> {
        self.submit(cq, vec![msg], false)
    }

    /// Queue several messages atomically, in order.
    pub fn send_batch(&self, cq: CommandQueue, msgs: Vec<QueueMessage>) -> Result<()> {
        self.submit(cq, msgs, false)
    }

    /// Queue a message even after the MCU has shut down.
    pub fn send_urgent(&self, cq: CommandQueue, msg: QueueMessage) -> Result<()> {
        self.submit(cq, vec![msg], true)
    }

    /// Encode `values` as VLQ integers and queue the result as one message.
    pub fn encode_and_send(
        &self,
        cq: CommandQueue,
        values: &[u32],
        min_clock: u64,
        req_clock: u64,
    ) -> Result<()> {
        let mut buf = BytesMut::with_capacity(values.len() * vlq::MAX_ENCODED_LEN);
        for &v in values {
            vlq::encode_u32(v, &mut buf);
        }
        self.send(cq, QueueMessage::new(buf.freeze(), min_clock, req_clock))
    }

    fn submit(&self, cq: CommandQueue, msgs: Vec<QueueMessage>, urgent: bool) -> Result<()> {
        let kick = self.shared.lock().send_batch(cq, msgs, urgent)?;
        if kick {
            self.waker.wake();
        }
        Ok(())
    }

    /// Next received block or acknowledgement notification.
    ///
    /// Blocks until one is available, `timeout` elapses (`Ok(None)`), or the
    /// transport exits (`Err(Exited)`, after queued messages are drained).
    pub fn pull(&self, timeout: Option<Duration>) -> Result<Option<QueueMessage>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut core = self.shared.lock();
        loop {
            if let Some(msg) = core.pop_received() {
                return Ok(Some(msg));
            }
            if core.exited() {
                return Err(QueueError::Exited);
            }
            core = match deadline {
                None => self
                    .shared
                    .receive_cond
                    .wait(core)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(None);
                    }
                    self.shared
                        .receive_cond
                        .wait_timeout(core, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }

    /// Bits per second on the wire, used to estimate transmit times.
    pub fn set_wire_frequency(&self, frequency: f64) {
        self.shared.lock().set_wire_frequency(frequency);
    }

    /// Limit unacknowledged bytes to the MCU's receive buffer size.
    pub fn set_receive_window(&self, bytes: usize) {
        self.shared.lock().set_receive_window(bytes);
    }

    /// Install a new host-time to MCU-clock mapping.
    pub fn set_clock_est(&self, ce: ClockEstimate) {
        self.shared.lock().set_clock_est(ce);
        self.waker.wake();
    }

    /// Enter the shutdown state: ordinary sends now fail.
    pub fn set_shutdown(&self) {
        self.shared.lock().set_shutdown();
    }

    pub fn link_state(&self) -> LinkState {
        self.shared.lock().link_state()
    }

    pub fn stats(&self) -> QueueStats {
        self.shared.lock().stats()
    }

    /// Recently acknowledged blocks (`sent == true`) or received blocks.
    pub fn extract_old(&self, sent: bool) -> Vec<QueueMessage> {
        self.shared.lock().extract_old(sent)
    }

    pub fn is_exited(&self) -> bool {
        self.shared.lock().exited()
    }

    /// Stop the transport thread and wake every blocked [`pull`](Self::pull).
    pub fn exit(&self) {
        self.shared.lock().request_exit();
        self.shared.receive_cond.notify_all();
        self.waker.wake();
        let handle = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("serial queue thread panicked");
            }
        }
    }
}

impl Drop for SerialQueue {
    fn drop(&mut self) {
        self.exit();
    }
}

impl std::fmt::Debug for SerialQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialQueue")
            .field("transport", &self.transport)
            .finish_non_exhaustive()
    }
}

/// State owned by the transport thread.
struct IoLoop {
    shared: Arc<Shared>,
    poller: Poller,
    reader: SerialStream,
    writer: BlockWriter<SerialStream>,
    decoder: BlockDecoder,
}

impl IoLoop {
    fn run(mut self) {
        let outcome = self.run_loop();
        self.shared.lock().request_exit();
        self.shared.receive_cond.notify_all();
        match outcome {
            Ok(()) => debug!("serial queue thread exiting"),
            Err(err) => error!(error = %err, "serial queue failed"),
        }
    }

    fn run_loop(&mut self) -> Result<()> {
        let mut buf = vec![0u8; READ_CHUNK_SIZE];
        loop {
            let now = monotonic();
            let retransmit_due = {
                let core = self.shared.lock();
                if core.exited() {
                    return Ok(());
                }
                core.retransmit_due(now)
            };
            if retransmit_due {
                self.writer.get_ref().discard_output()?;
                let data = self.shared.lock().retransmit(now);
                if let Some(data) = data {
                    self.writer.write_raw(&data)?;
                }
            }

            let (data, wake_at) = {
                let mut core = self.shared.lock();
                let data = if core.command_due(now) {
                    core.command_event(now)?
                } else {
                    None
                };
                (data, core.next_wake())
            };
            if let Some(data) = data {
                trace!(bytes = data.len(), "write");
                self.writer.write_raw(&data)?;
            }

            let timeout = if wake_at == NEVER {
                None
            } else {
                Some(Duration::from_secs_f64((wake_at - monotonic()).max(0.0)))
            };
            let readiness = self.poller.wait(timeout)?;
            if readiness.readable {
                self.input_event(&mut buf)?;
            }
        }
    }

    /// Drain every byte currently buffered; readiness is edge-triggered.
    fn input_event(&mut self, buf: &mut [u8]) -> Result<()> {
        loop {
            let n = match self.reader.read(buf) {
                Ok(0) => return Err(FrameError::ConnectionClosed.into()),
                Ok(n) => n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(err) => return Err(FrameError::Io(err).into()),
            };
            let now = monotonic();
            self.decoder.extend(&buf[..n]);

            let invalid_before = self.decoder.bytes_invalid();
            let mut core = self.shared.lock();
            while let Some(block) = self.decoder.next_block() {
                core.handle_block(&block, now);
            }
            core.add_invalid(self.decoder.bytes_invalid() - invalid_before);
            if core.has_received() {
                self.shared.receive_cond.notify_all();
            }
        }
    }
}
