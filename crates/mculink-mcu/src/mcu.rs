use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use mculink_dict::{MessageDictionary, MessageParams};
use mculink_queue::{monotonic, CommandQueue, QueueError};
use mculink_transport::SerialStream;
use tracing::{debug, error, info, warn};

use crate::clocksync::{ClockSync, SecondarySync, CLOCK_QUERY_INTERVAL};
use crate::command::Command;
use crate::config::McuConfig;
use crate::connector::Endpoint;
use crate::error::{McuError, Result};
use crate::handler::{ResponseHandler, SerialHandler, WeakSerialHandler};
use crate::identify::identify;
use crate::shutdown::{ShutdownBus, ShutdownEvent};

/// Queries issued back to back while connecting.
const INITIAL_CLOCK_QUERIES: usize = 8;
const INITIAL_QUERY_PAUSE: Duration = Duration::from_millis(50);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// How this MCU's clock relates to print time.
enum ClockRole {
    Primary,
    Secondary {
        primary: Arc<Mutex<ClockSync>>,
        adj: Mutex<SecondarySync>,
    },
}

/// State shared with the callbacks and the clock thread.
struct McuState {
    name: String,
    is_shutdown: AtomicBool,
    first_event: Mutex<Option<ShutdownEvent>>,
    bus: ShutdownBus,
}

impl McuState {
    /// Record and broadcast the first shutdown; later ones are ignored.
    fn shutdown(&self, event: ShutdownEvent) -> bool {
        if self.is_shutdown.swap(true, Ordering::SeqCst) {
            return false;
        }
        *lock(&self.first_event) = Some(event.clone());
        self.bus.publish(&event);
        true
    }
}

/// Periodic `get_clock` poller.
struct ClockPoller {
    stop: Arc<(Mutex<bool>, Condvar)>,
    handle: Option<JoinHandle<()>>,
}

impl ClockPoller {
    fn stop(&mut self) {
        let (flag, cond) = &*self.stop;
        *lock(flag) = true;
        cond.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// A connected, identified and clock-synchronized MCU.
pub struct Mcu {
    handler: SerialHandler,
    clock: Arc<Mutex<ClockSync>>,
    role: ClockRole,
    state: Arc<McuState>,
    poller: Mutex<ClockPoller>,
}

impl Mcu {
    /// Open `endpoint` and connect as the primary MCU.
    pub fn connect(endpoint: &Endpoint, config: McuConfig) -> Result<Self> {
        let stream = endpoint
            .open()
            .map_err(|err| McuError::connect(&config.name, err))?;
        Self::connect_stream(stream, config)
    }

    /// Connect as the primary MCU over an already open stream.
    pub fn connect_stream(stream: SerialStream, config: McuConfig) -> Result<Self> {
        let name = config.name.clone();
        Self::establish(stream, config, None).map_err(|err| McuError::connect(&name, err))
    }

    /// Connect an additional MCU whose clock is mapped onto `primary`'s.
    pub fn connect_secondary(stream: SerialStream, config: McuConfig, primary: &Mcu) -> Result<Self> {
        let name = config.name.clone();
        Self::establish(stream, config, Some(Arc::clone(&primary.clock)))
            .map_err(|err| McuError::connect(&name, err))
    }

    fn establish(
        stream: SerialStream,
        config: McuConfig,
        primary: Option<Arc<Mutex<ClockSync>>>,
    ) -> Result<Self> {
        let handler = SerialHandler::new(stream, &config)?;
        identify(&handler, &config.identify)?;
        let mcu_freq = handler.dictionary().get_constant_float("CLOCK_FREQ")?;

        let state = Arc::new(McuState {
            name: config.name.clone(),
            is_shutdown: AtomicBool::new(false),
            first_event: Mutex::new(None),
            bus: ShutdownBus::default(),
        });
        let clock = Arc::new(Mutex::new(ClockSync::new(mcu_freq)));
        register_shutdown_handlers(&handler, &clock, &state);

        connect_clock(&handler, &clock)?;
        let role = match primary {
            None => ClockRole::Primary,
            Some(primary) => {
                let adj = SecondarySync::connect(&lock(&clock), &lock(&primary), monotonic());
                ClockRole::Secondary {
                    primary,
                    adj: Mutex::new(adj),
                }
            }
        };
        let poller = spawn_clock_poller(&handler, &clock, &state)?;

        info!(
            mcu = %config.name,
            freq = mcu_freq,
            version = handler.dictionary().version(),
            secondary = matches!(role, ClockRole::Secondary { .. }),
            "mcu connected"
        );
        Ok(Self {
            handler,
            clock,
            role,
            state,
            poller: Mutex::new(poller),
        })
    }

    pub fn name(&self) -> &str {
        &self.state.name
    }

    pub fn handler(&self) -> &SerialHandler {
        &self.handler
    }

    pub fn dictionary(&self) -> Arc<MessageDictionary> {
        self.handler.dictionary()
    }

    pub fn mcu_freq(&self) -> f64 {
        lock(&self.clock).mcu_freq()
    }

    /// Resolve a command by its exact format string, on the default queue.
    pub fn lookup_command(&self, format: &str) -> Result<Command> {
        let format = self.handler.lookup_command(format)?;
        Ok(Command::new(
            self.handler.clone(),
            format,
            self.handler.default_queue(),
        ))
    }

    pub fn alloc_command_queue(&self) -> CommandQueue {
        self.handler.alloc_command_queue()
    }

    /// Register (or remove) the callback for messages named `name`.
    pub fn register_callback(&self, name: &str, oid: Option<i64>, handler: Option<ResponseHandler>) {
        self.handler.register_response(name, oid, handler);
    }

    pub fn send_with_response(&self, text: &str, response: &str) -> Result<MessageParams> {
        self.handler.send_with_response(text, response, None)
    }

    /// Ask the firmware to shut down now, even if it already has.
    pub fn emergency_stop(&self) -> Result<()> {
        let cmd = self.handler.create_command("emergency_stop")?;
        warn!(mcu = %self.state.name, "sending emergency stop");
        self.handler.raw_send_urgent(cmd, self.handler.default_queue())
    }

    pub fn is_shutdown(&self) -> bool {
        self.state.is_shutdown.load(Ordering::SeqCst)
    }

    /// The first shutdown seen on this connection.
    pub fn shutdown_event(&self) -> Option<ShutdownEvent> {
        lock(&self.state.first_event).clone()
    }

    /// Receive every future shutdown event from this MCU.
    pub fn shutdown_events(&self) -> Receiver<ShutdownEvent> {
        self.state.bus.subscribe()
    }

    pub fn is_active(&self) -> bool {
        lock(&self.clock).is_active()
    }

    pub fn estimated_print_time(&self, eventtime: f64) -> f64 {
        let clock = lock(&self.clock);
        match &self.role {
            ClockRole::Primary => clock.estimated_print_time(eventtime),
            ClockRole::Secondary { adj, .. } => lock(adj).estimated_print_time(&clock, eventtime),
        }
    }

    pub fn print_time_to_clock(&self, print_time: f64) -> u64 {
        match &self.role {
            ClockRole::Primary => lock(&self.clock).print_time_to_clock(print_time),
            ClockRole::Secondary { adj, .. } => lock(adj).print_time_to_clock(print_time),
        }
    }

    pub fn clock_to_print_time(&self, clock: u64) -> f64 {
        match &self.role {
            ClockRole::Primary => lock(&self.clock).clock_to_print_time(clock),
            ClockRole::Secondary { adj, .. } => lock(adj).clock_to_print_time(clock),
        }
    }

    pub fn clock32_to_clock64(&self, clock32: u32) -> u64 {
        lock(&self.clock).clock32_to_clock64(clock32)
    }

    /// Estimated host time at which the MCU clock reaches `clock`.
    pub fn estimate_clock_systime(&self, clock: u64) -> f64 {
        lock(&self.clock).estimate_clock_systime(clock)
    }

    /// Refresh a secondary's print-time mapping; returns `(offset, freq)`.
    pub fn calibrate_clock(&self, print_time: f64, eventtime: f64) -> (f64, f64) {
        let clock = lock(&self.clock);
        match &self.role {
            ClockRole::Primary => clock.calibrate_clock(),
            ClockRole::Secondary { primary, adj } => {
                let main = lock(primary);
                lock(adj).calibrate_clock(&clock, &main, print_time, eventtime)
            }
        }
    }

    /// One-line status: transport counters and clock frequency.
    pub fn stats(&self) -> String {
        let clock = lock(&self.clock);
        let clock_stats = match &self.role {
            ClockRole::Primary => clock.stats(),
            ClockRole::Secondary { adj, .. } => lock(adj).stats(&clock),
        };
        format!("{} {}", self.handler.stats(), clock_stats)
    }

    pub fn dump_debug(&self) -> String {
        let clock_dump = {
            let clock = lock(&self.clock);
            match &self.role {
                ClockRole::Primary => clock.dump_debug(),
                ClockRole::Secondary { adj, .. } => lock(adj).dump_debug(&clock),
            }
        };
        format!("{clock_dump}\n{}", self.handler.dump_debug())
    }

    /// Stop clock polling and close the connection.
    pub fn disconnect(&self) {
        lock(&self.poller).stop();
        self.handler.disconnect();
    }
}

impl Drop for Mcu {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl std::fmt::Debug for Mcu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mcu")
            .field("name", &self.state.name)
            .field("handler", &self.handler)
            .field("is_shutdown", &self.is_shutdown())
            .finish()
    }
}

fn field(params: &MessageParams, mcu: &str, name: &str) -> Result<u32> {
    params.get_u32(name).ok_or_else(|| McuError::MissingField {
        mcu: mcu.to_string(),
        message: params.name().to_string(),
        field: name.to_string(),
    })
}

/// Seed the clock regression from `get_uptime` and a burst of `get_clock`.
fn connect_clock(handler: &SerialHandler, clock: &Arc<Mutex<ClockSync>>) -> Result<()> {
    let mcu = handler.name();
    let params = handler.send_with_response("get_uptime", "uptime", None)?;
    lock(clock).handle_uptime(
        field(&params, mcu, "high")?,
        field(&params, mcu, "clock")?,
        params.sent_time(),
    );

    for _ in 0..INITIAL_CLOCK_QUERIES {
        thread::sleep(INITIAL_QUERY_PAUSE);
        let params = handler.send_with_response("get_clock", "clock", None)?;
        let clock32 = field(&params, mcu, "clock")?;
        let estimate = {
            let mut clock = lock(clock);
            clock.reset_prediction_window();
            clock.handle_clock(clock32, params.sent_time(), params.receive_time())
        };
        if let Some(estimate) = estimate {
            handler.queue().set_clock_est(estimate);
        }
    }

    let weak = handler.downgrade();
    let clock = Arc::clone(clock);
    let on_clock: ResponseHandler = Arc::new(move |params: &MessageParams| {
        let Some(clock32) = params.get_u32("clock") else {
            return;
        };
        let estimate =
            lock(&clock).handle_clock(clock32, params.sent_time(), params.receive_time());
        if let (Some(estimate), Some(handler)) = (estimate, weak.upgrade()) {
            handler.queue().set_clock_est(estimate);
        }
    });
    handler.register_response("clock", None, Some(on_clock));
    Ok(())
}

fn register_shutdown_handlers(
    handler: &SerialHandler,
    clock: &Arc<Mutex<ClockSync>>,
    state: &Arc<McuState>,
) {
    for name in ["shutdown", "is_shutdown"] {
        let weak = handler.downgrade();
        let clock = Arc::clone(clock);
        let state = Arc::clone(state);
        let on_shutdown: ResponseHandler =
            Arc::new(move |params: &MessageParams| handle_shutdown(params, &weak, &clock, &state));
        handler.register_response(name, None, Some(on_shutdown));
    }
}

fn handle_shutdown(
    params: &MessageParams,
    weak: &WeakSerialHandler,
    clock: &Mutex<ClockSync>,
    state: &McuState,
) {
    if state.is_shutdown.load(Ordering::SeqCst) {
        return;
    }
    let Some(handler) = weak.upgrade() else {
        return;
    };
    handler.queue().set_shutdown();

    let dict = handler.dictionary();
    let reason = match params.get_u32("static_string_id") {
        Some(id) => dict
            .lookup_static_string(id)
            .map_or_else(|| format!("static string {id}"), str::to_string),
        None => "unknown reason".to_string(),
    };
    let (shutdown_clock, clock_dump) = {
        let clock = lock(clock);
        (
            params.get_u32("clock").map(|c| clock.clock32_to_clock64(c)),
            clock.dump_debug(),
        )
    };
    let event = ShutdownEvent::new(&state.name, params.name(), reason, shutdown_clock);
    error!(
        mcu = %state.name,
        event_type = %event.event_type,
        reason = %event.reason,
        "mcu shutdown\n{clock_dump}\n{}",
        handler.dump_debug()
    );
    state.shutdown(event);
}

fn spawn_clock_poller(
    handler: &SerialHandler,
    clock: &Arc<Mutex<ClockSync>>,
    state: &Arc<McuState>,
) -> Result<ClockPoller> {
    let cmd = handler.create_command("get_clock")?;
    let cq = handler.alloc_command_queue();
    let weak = handler.downgrade();
    let clock = Arc::clone(clock);
    let state = Arc::clone(state);
    let stop: Arc<(Mutex<bool>, Condvar)> = Arc::default();
    let thread_stop = Arc::clone(&stop);
    let interval = Duration::from_secs_f64(CLOCK_QUERY_INTERVAL);

    let handle = thread::Builder::new()
        .name(format!("{}-clock", state.name))
        .spawn(move || {
            let (flag, cond) = &*thread_stop;
            loop {
                let Some(handler) = weak.upgrade() else {
                    break;
                };
                // Clock queries continue after shutdown.
                if let Err(err) = handler.raw_send_urgent(cmd.clone(), cq) {
                    debug!(mcu = %state.name, %err, "clock query not sent; poller exiting");
                    break;
                }
                let active = {
                    let mut clock = lock(&clock);
                    clock.note_query_sent();
                    clock.is_active()
                };
                if !active {
                    let event = ShutdownEvent::new(
                        &state.name,
                        "lost_communication",
                        "Lost communication with MCU",
                        None,
                    );
                    if state.shutdown(event) {
                        error!(mcu = %state.name, "lost communication with mcu");
                    }
                }
                drop(handler);

                let stopped = lock(flag);
                let (stopped, _) = cond
                    .wait_timeout_while(stopped, interval, |stopped| !*stopped)
                    .unwrap_or_else(PoisonError::into_inner);
                if *stopped {
                    break;
                }
            }
        })
        .map_err(QueueError::Spawn)?;

    Ok(ClockPoller {
        stop,
        handle: Some(handle),
    })
}
