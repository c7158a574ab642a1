use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, SyncSender};
use std::sync::{Arc, Condvar, Mutex, PoisonError, RwLock, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use mculink_dict::{MessageDictionary, MessageFormat, MessageParams, OutputFormat, UnknownFormat};
use mculink_queue::{monotonic, CommandQueue, QueueError, QueueMessage, QueueStats, SerialQueue};
use mculink_transport::SerialStream;
use tracing::{debug, error, info, warn};

use crate::config::McuConfig;
use crate::error::{McuError, Result};

/// Callback for a decoded message.
pub type ResponseHandler = Arc<dyn Fn(&MessageParams) + Send + Sync>;

type HandlerKey = (String, Option<i64>);

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Routes decoded messages to registered callbacks.
struct Router {
    mcu: String,
    dictionary: RwLock<Arc<MessageDictionary>>,
    handlers: Mutex<HashMap<HandlerKey, ResponseHandler>>,
    fallback: Mutex<Option<ResponseHandler>>,
    ack_waiters: Mutex<HashMap<u64, SyncSender<f64>>>,
}

impl Router {
    fn dictionary(&self) -> Arc<MessageDictionary> {
        Arc::clone(&self.dictionary.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn handle_block(&self, msg: &QueueMessage) {
        let dict = self.dictionary();
        let sent_time = msg.sent_time().unwrap_or(0.0);
        let receive_time = msg.receive_time().unwrap_or(0.0);
        let messages = match dict.parse(msg.block_payload()) {
            Ok(messages) => messages,
            Err(err) => {
                warn!(
                    mcu = %self.mcu,
                    %err,
                    block = ?dict.dump_block(msg.data()),
                    "undecodable block from mcu"
                );
                return;
            }
        };
        for mut params in messages {
            params.insert("#sent_time", sent_time);
            params.insert("#receive_time", receive_time);
            self.dispatch(&params);
        }
    }

    fn dispatch(&self, params: &MessageParams) {
        let key = (params.name().to_string(), params.get_int("oid"));
        let handler = lock(&self.handlers)
            .get(&key)
            .cloned()
            .or_else(|| lock(&self.fallback).clone());
        match handler {
            Some(handler) => handler(params),
            None => self.handle_default(params),
        }
    }

    fn handle_default(&self, params: &MessageParams) {
        match params.name() {
            OutputFormat::NAME => {
                info!(mcu = %self.mcu, "{}", params.get_str("#msg").unwrap_or_default());
            }
            UnknownFormat::NAME => {
                warn!(
                    mcu = %self.mcu,
                    msgid = ?params.get_int("#msgid"),
                    "unknown message from mcu (firmware/host mismatch?)"
                );
            }
            _ => {
                debug!(
                    mcu = %self.mcu,
                    message = %self.dictionary().format_params(params),
                    "unhandled message"
                );
            }
        }
    }

    fn complete_ack(&self, notify_id: u64, receive_time: f64) {
        if let Some(tx) = lock(&self.ack_waiters).remove(&notify_id) {
            let _ = tx.try_send(receive_time);
        }
    }
}

struct HandlerInner {
    name: String,
    queue: Arc<SerialQueue>,
    router: Arc<Router>,
    default_queue: CommandQueue,
    response_timeout: Duration,
    retry_interval: Duration,
    next_notify_id: AtomicU64,
    dispatch: Mutex<Option<JoinHandle<()>>>,
}

impl HandlerInner {
    fn shutdown_threads(&self) {
        self.queue.exit();
        let handle = lock(&self.dispatch).take();
        if let Some(handle) = handle {
            // A callback can hold the last reference; never join from inside.
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for HandlerInner {
    fn drop(&mut self) {
        self.shutdown_threads();
    }
}

/// Message-level access to one MCU connection.
///
/// Owns the [`SerialQueue`] and a dispatch thread that decodes every
/// received block with the current dictionary and hands each message to the
/// callback registered for its `(name, oid)`. Clones share the connection.
#[derive(Clone)]
pub struct SerialHandler {
    inner: Arc<HandlerInner>,
}

/// Non-owning reference for callbacks that need the handler.
#[derive(Clone)]
pub struct WeakSerialHandler {
    inner: Weak<HandlerInner>,
}

impl WeakSerialHandler {
    pub fn upgrade(&self) -> Option<SerialHandler> {
        self.inner.upgrade().map(|inner| SerialHandler { inner })
    }
}

impl SerialHandler {
    /// Start the transport over `stream` with only the bootstrap dictionary.
    pub fn new(stream: SerialStream, config: &McuConfig) -> Result<Self> {
        let queue = Arc::new(SerialQueue::new(stream, config.queue_config())?);
        let router = Arc::new(Router {
            mcu: config.name.clone(),
            dictionary: RwLock::new(Arc::new(MessageDictionary::new())),
            handlers: Mutex::new(HashMap::new()),
            fallback: Mutex::new(None),
            ack_waiters: Mutex::new(HashMap::new()),
        });

        let dispatch = {
            let queue = Arc::clone(&queue);
            let router = Arc::clone(&router);
            thread::Builder::new()
                .name(format!("{}-dispatch", config.name))
                .spawn(move || dispatch_loop(&queue, &router))
                .map_err(QueueError::Spawn)?
        };
        let default_queue = queue.alloc_command_queue();
        debug!(mcu = %config.name, transport = queue.transport_name(), "serial handler started");

        Ok(Self {
            inner: Arc::new(HandlerInner {
                name: config.name.clone(),
                queue,
                router,
                default_queue,
                response_timeout: config.response_timeout,
                retry_interval: config.retry_interval,
                next_notify_id: AtomicU64::new(1),
                dispatch: Mutex::new(Some(dispatch)),
            }),
        })
    }

    pub fn downgrade(&self) -> WeakSerialHandler {
        WeakSerialHandler {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn queue(&self) -> &SerialQueue {
        &self.inner.queue
    }

    pub fn dictionary(&self) -> Arc<MessageDictionary> {
        self.inner.router.dictionary()
    }

    /// Replace the dictionary used to encode commands and decode responses.
    pub fn install_dictionary(&self, dictionary: MessageDictionary) {
        *self
            .inner
            .router
            .dictionary
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Arc::new(dictionary);
    }

    /// Register (or with `None`, remove) the callback for `name`/`oid`.
    /// Returns the callback it replaced.
    pub fn register_response(
        &self,
        name: &str,
        oid: Option<i64>,
        handler: Option<ResponseHandler>,
    ) -> Option<ResponseHandler> {
        let key = (name.to_string(), oid);
        let mut handlers = lock(&self.inner.router.handlers);
        match handler {
            Some(handler) => handlers.insert(key, handler),
            None => handlers.remove(&key),
        }
    }

    /// Receive every message no registered callback claims, in place of
    /// the built-in logging.
    pub fn set_default_handler(&self, handler: Option<ResponseHandler>) {
        *lock(&self.inner.router.fallback) = handler;
    }

    pub fn default_queue(&self) -> CommandQueue {
        self.inner.default_queue
    }

    pub fn alloc_command_queue(&self) -> CommandQueue {
        self.inner.queue.alloc_command_queue()
    }

    /// Look up a command by its exact format string.
    pub fn lookup_command(&self, format: &str) -> Result<MessageFormat> {
        Ok(self.dictionary().lookup_command(format)?.clone())
    }

    /// Encode a textual command such as `"get_clock"` with the current dictionary.
    pub fn create_command(&self, text: &str) -> Result<Bytes> {
        Ok(self.dictionary().create_command(text)?)
    }

    /// Queue an encoded message without waiting.
    pub fn raw_send(
        &self,
        cmd: Bytes,
        min_clock: u64,
        req_clock: u64,
        queue: CommandQueue,
    ) -> Result<()> {
        self.inner
            .queue
            .send(queue, QueueMessage::new(cmd, min_clock, req_clock))?;
        Ok(())
    }

    /// Queue an encoded message that bypasses the shutdown gate.
    pub fn raw_send_urgent(&self, cmd: Bytes, queue: CommandQueue) -> Result<()> {
        self.inner
            .queue
            .send_urgent(queue, QueueMessage::immediate(cmd))?;
        Ok(())
    }

    /// Queue an encoded message and block until the MCU acknowledges it.
    ///
    /// Returns the host time the acknowledgement arrived.
    pub fn raw_send_wait_ack(
        &self,
        cmd: Bytes,
        min_clock: u64,
        req_clock: u64,
        queue: CommandQueue,
    ) -> Result<f64> {
        let notify_id = self.inner.next_notify_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::sync_channel(1);
        lock(&self.inner.router.ack_waiters).insert(notify_id, tx);
        let msg = QueueMessage::new(cmd, min_clock, req_clock).with_notify(notify_id);
        if let Err(err) = self.inner.queue.send(queue, msg) {
            lock(&self.inner.router.ack_waiters).remove(&notify_id);
            return Err(err.into());
        }
        match rx.recv_timeout(self.inner.response_timeout) {
            Ok(receive_time) => Ok(receive_time),
            Err(mpsc::RecvTimeoutError::Timeout) => {
                lock(&self.inner.router.ack_waiters).remove(&notify_id);
                Err(McuError::Timeout {
                    mcu: self.inner.name.clone(),
                    response: "ack".to_string(),
                })
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(McuError::Disconnected {
                mcu: self.inner.name.clone(),
            }),
        }
    }

    /// Encode and queue a textual command on the default queue.
    pub fn send(&self, text: &str) -> Result<()> {
        let cmd = self.create_command(text)?;
        self.raw_send(cmd, 0, 0, self.inner.default_queue)
    }

    /// Send a textual command and wait for the named response.
    pub fn send_with_response(
        &self,
        text: &str,
        response: &str,
        oid: Option<i64>,
    ) -> Result<MessageParams> {
        let cmd = self.create_command(text)?;
        self.send_bytes_with_response(cmd, response, oid, self.inner.default_queue)
    }

    /// Send an encoded command, resending until a matching response arrives.
    ///
    /// Only responses to commands sent after this call started are accepted.
    pub fn send_bytes_with_response(
        &self,
        cmd: Bytes,
        response: &str,
        oid: Option<i64>,
        queue: CommandQueue,
    ) -> Result<MessageParams> {
        let slot: Arc<(Mutex<Option<MessageParams>>, Condvar)> = Arc::default();
        let start = monotonic();
        let previous = lock(&self.inner.router.handlers)
            .get(&(response.to_string(), oid))
            .cloned();
        {
            let slot = Arc::clone(&slot);
            let previous = previous.clone();
            let handler: ResponseHandler = Arc::new(move |params: &MessageParams| {
                if params.sent_time() >= start {
                    let (value, cond) = &*slot;
                    lock(value).get_or_insert_with(|| params.clone());
                    cond.notify_all();
                }
                if let Some(previous) = &previous {
                    previous(params);
                }
            });
            self.register_response(response, oid, Some(handler));
        }

        let result = self.await_response(&slot, cmd, response, queue);
        self.register_response(response, oid, previous);
        result
    }

    fn await_response(
        &self,
        slot: &(Mutex<Option<MessageParams>>, Condvar),
        cmd: Bytes,
        response: &str,
        queue: CommandQueue,
    ) -> Result<MessageParams> {
        let (value, cond) = slot;
        let deadline = Instant::now() + self.inner.response_timeout;
        loop {
            self.raw_send(cmd.clone(), 0, 0, queue)?;
            let retry_at = (Instant::now() + self.inner.retry_interval).min(deadline);
            let mut guard = lock(value);
            loop {
                if let Some(params) = guard.take() {
                    return Ok(params);
                }
                let now = Instant::now();
                if now >= retry_at {
                    break;
                }
                guard = cond
                    .wait_timeout(guard, retry_at - now)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
            }
            drop(guard);
            if self.inner.queue.is_exited() {
                return Err(McuError::Disconnected {
                    mcu: self.inner.name.clone(),
                });
            }
            if Instant::now() >= deadline {
                return Err(McuError::Timeout {
                    mcu: self.inner.name.clone(),
                    response: response.to_string(),
                });
            }
            debug!(mcu = %self.inner.name, response, "no response yet; resending");
        }
    }

    pub fn stats(&self) -> QueueStats {
        self.inner.queue.stats()
    }

    pub fn is_connected(&self) -> bool {
        !self.inner.queue.is_exited()
    }

    /// Recent traffic, decoded, for shutdown reports.
    pub fn dump_debug(&self) -> String {
        let dict = self.dictionary();
        let mut out = format!("Dumping serial stats: {}", self.stats());
        for (sent, label) in [(true, "Sent"), (false, "Receive")] {
            let history = self.inner.queue.extract_old(sent);
            let kind = if sent { "send" } else { "receive" };
            let _ = write!(out, "\nDumping {kind} queue {} messages", history.len());
            for (idx, msg) in history.iter().enumerate() {
                let _ = write!(
                    out,
                    "\n{label} {idx} {:.6} {:.6} {}: {}",
                    msg.receive_time().unwrap_or(0.0),
                    msg.sent_time().unwrap_or(0.0),
                    msg.len(),
                    dict.dump_block(msg.data()).join(", ")
                );
            }
        }
        out
    }

    /// Stop the transport and dispatch threads.
    pub fn disconnect(&self) {
        self.inner.shutdown_threads();
        info!(mcu = %self.inner.name, "disconnected");
    }
}

impl std::fmt::Debug for SerialHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialHandler")
            .field("name", &self.inner.name)
            .field("queue", &self.inner.queue)
            .finish()
    }
}

fn dispatch_loop(queue: &SerialQueue, router: &Router) {
    loop {
        match queue.pull(None) {
            Ok(Some(msg)) if msg.is_notification() => {
                router.complete_ack(msg.notify_id(), msg.receive_time().unwrap_or(0.0));
            }
            Ok(Some(msg)) => router.handle_block(&msg),
            Ok(None) => {}
            Err(QueueError::Exited) => break,
            Err(err) => {
                error!(mcu = %router.mcu, %err, "dispatch stopped");
                break;
            }
        }
    }
    // Pending ack waiters see a disconnect.
    lock(&router.ack_waiters).clear();
    debug!(mcu = %router.mcu, "dispatch thread exiting");
}
