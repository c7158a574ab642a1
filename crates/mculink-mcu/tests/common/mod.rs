//! Scripted MCU firmware for end-to-end tests.
//!
//! Speaks the block protocol over one end of a socket pair: enforces
//! sequence numbers, NAKs bad or out-of-order blocks, serves a compressed
//! dictionary through `identify`, and answers clock queries from a simulated
//! clock.

#![allow(dead_code)]

use std::io::{ErrorKind, Read, Write};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use mculink_dict::{MessageDictionary, MessageParams, ParamValue};
use mculink_frame::{encode_block, vlq, BlockCheck, BlockChecker, MESSAGE_SYNC};
use mculink_mcu::{Mcu, McuConfig};
use mculink_queue::monotonic;
use mculink_transport::SerialStream;

pub const CLOCK_FREQ: f64 = 16_000_000.0;
/// Start close to a 32-bit wrap so clock extension is exercised.
pub const CLOCK_OFFSET: u64 = 0xffff_0000;
pub const HEATER_OUTPUT_ID: u32 = 20;

pub fn dictionary_json() -> String {
    r#"{
        "version": "v0.12.0-sim",
        "build_versions": "gcc: (sim) 12.2",
        "config": {
            "CLOCK_FREQ": 16000000,
            "MCU": "sim",
            "RECEIVE_WINDOW": 192,
            "STATS_SUMSQ_BASE": 256
        },
        "commands": {
            "identify offset=%u count=%c": 1,
            "get_uptime": 2,
            "get_clock": 3,
            "heater_set oid=%c value=%u": 4,
            "emergency_stop": 5
        },
        "responses": {
            "identify_response offset=%u data=%.*s": 0,
            "uptime high=%u clock=%u": 10,
            "clock clock=%u": 11,
            "shutdown clock=%u static_string_id=%hu": 12,
            "is_shutdown static_string_id=%hu": 13
        },
        "output": {
            "heater %c set to %u": 20
        },
        "enumerations": {
            "static_string_id": {
                "Command request": 2,
                "Timer too close": 3
            }
        }
    }"#
    .to_string()
}

pub fn compressed_dictionary() -> Vec<u8> {
    let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
    enc.write_all(dictionary_json().as_bytes()).unwrap();
    enc.finish().unwrap()
}

#[derive(Debug, Clone)]
pub struct FirmwareConfig {
    /// Clock rate relative to the nominal `CLOCK_FREQ`.
    pub clock_scale: f64,
    /// Flip a byte in the first block carrying `heater_set`.
    pub corrupt_heater_block: bool,
    /// Serve these bytes through `identify` instead of the compressed
    /// dictionary.
    pub identify_data: Option<Vec<u8>>,
}

impl Default for FirmwareConfig {
    fn default() -> Self {
        Self {
            clock_scale: 1.0,
            corrupt_heater_block: false,
            identify_data: None,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct FirmwareLog {
    pub identify_requests: usize,
    pub heater_values: Vec<u32>,
    pub corrupted_blocks: usize,
    pub naks_sent: usize,
    pub clock_queries: usize,
    pub shutdown: bool,
}

pub struct Firmware {
    log: Arc<Mutex<FirmwareLog>>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    start: f64,
    clock_scale: f64,
    pub dictionary_len: usize,
}

impl Firmware {
    pub fn log(&self) -> MutexGuard<'_, FirmwareLog> {
        self.log.lock().unwrap()
    }

    /// The simulated MCU clock at host time `t`.
    pub fn clock_at(&self, t: f64) -> u64 {
        clock_at(self.start, self.clock_scale, t)
    }
}

impl Drop for Firmware {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn clock_at(start: f64, scale: f64, t: f64) -> u64 {
    CLOCK_OFFSET + ((t - start) * CLOCK_FREQ * scale) as u64
}

/// Start the firmware; returns the host end of the link.
pub fn spawn_firmware(config: FirmwareConfig) -> (SerialStream, Firmware) {
    let (host, mcu) = UnixStream::pair().unwrap();
    (SerialStream::from_unix(host), serve_firmware(mcu, config))
}

/// Run the firmware on an already connected stream.
pub fn serve_firmware(mcu: UnixStream, config: FirmwareConfig) -> Firmware {
    let dictionary = config
        .identify_data
        .clone()
        .unwrap_or_else(compressed_dictionary);
    let mut parser = MessageDictionary::new();
    parser
        .process_identify(dictionary_json().as_bytes(), false)
        .unwrap();

    let log = Arc::new(Mutex::new(FirmwareLog::default()));
    let stop = Arc::new(AtomicBool::new(false));
    let start = monotonic();
    let clock_scale = config.clock_scale;
    let dictionary_len = dictionary.len();

    let mut sim = Sim {
        writer: mcu.try_clone().unwrap(),
        reader: mcu,
        parser,
        dictionary,
        checker: BlockChecker::new(),
        buf: Vec::new(),
        next_seq: 0,
        start,
        config,
        corrupt_pending: true,
        shutdown: false,
        log: Arc::clone(&log),
        stop: Arc::clone(&stop),
    };
    let handle = thread::spawn(move || sim.run());
    Firmware {
        log,
        stop,
        handle: Some(handle),
        start,
        clock_scale,
        dictionary_len,
    }
}

struct Sim {
    reader: UnixStream,
    writer: UnixStream,
    parser: MessageDictionary,
    dictionary: Vec<u8>,
    checker: BlockChecker,
    buf: Vec<u8>,
    next_seq: u64,
    start: f64,
    config: FirmwareConfig,
    corrupt_pending: bool,
    shutdown: bool,
    log: Arc<Mutex<FirmwareLog>>,
    stop: Arc<AtomicBool>,
}

impl Sim {
    fn run(&mut self) {
        self.reader
            .set_read_timeout(Some(Duration::from_millis(20)))
            .unwrap();
        let mut chunk = [0u8; 512];
        while !self.stop.load(Ordering::SeqCst) {
            match self.reader.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    self.buf.extend_from_slice(&chunk[..n]);
                    self.process();
                }
                Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
                Err(_) => break,
            }
        }
    }

    fn process(&mut self) {
        loop {
            match self.checker.check(&self.buf) {
                BlockCheck::NeedMore => break,
                BlockCheck::Discard(n) => {
                    let garbage = self.buf.drain(..n).any(|b| b != MESSAGE_SYNC);
                    if garbage {
                        self.send_nak();
                    }
                }
                BlockCheck::Valid(n) => {
                    if self.should_corrupt(n) {
                        self.buf[2] ^= 0xff;
                        self.corrupt_pending = false;
                        self.log.lock().unwrap().corrupted_blocks += 1;
                        continue;
                    }
                    let block: Vec<u8> = self.buf.drain(..n).collect();
                    self.handle_block(&block);
                }
            }
        }
    }

    fn should_corrupt(&self, len: usize) -> bool {
        if !(self.config.corrupt_heater_block && self.corrupt_pending) {
            return false;
        }
        if u64::from(self.buf[1] & 0x0f) != self.next_seq {
            return false;
        }
        self.parser
            .parse(&self.buf[2..len - 3])
            .map(|msgs| msgs.iter().any(|m| m.name() == "heater_set"))
            .unwrap_or(false)
    }

    fn handle_block(&mut self, block: &[u8]) {
        let seq = u64::from(block[1] & 0x0f);
        if seq != self.next_seq {
            self.send_nak();
            return;
        }
        self.next_seq = (self.next_seq + 1) & 0x0f;
        if let Ok(messages) = self.parser.parse(&block[2..block.len() - 3]) {
            for params in messages {
                self.handle_command(&params);
            }
        }
        self.send_block(&[]);
    }

    fn handle_command(&mut self, params: &MessageParams) {
        match params.name() {
            "identify" => {
                self.log.lock().unwrap().identify_requests += 1;
                let offset = params.get_int("offset").unwrap() as usize;
                let count = params.get_int("count").unwrap() as usize;
                let start = offset.min(self.dictionary.len());
                let end = (offset + count).min(self.dictionary.len());
                let data = self.dictionary[start..end].to_vec();
                self.respond(
                    "identify_response",
                    &[ParamValue::Int(offset as i64), ParamValue::Bytes(data)],
                );
            }
            "get_uptime" => {
                let clock = self.clock();
                self.respond(
                    "uptime",
                    &[
                        ParamValue::Int((clock >> 32) as i64),
                        ParamValue::Int((clock & 0xffff_ffff) as i64),
                    ],
                );
            }
            "get_clock" => {
                self.log.lock().unwrap().clock_queries += 1;
                let clock = self.clock();
                self.respond("clock", &[ParamValue::Int((clock & 0xffff_ffff) as i64)]);
            }
            "heater_set" if self.shutdown => {
                self.respond("is_shutdown", &[ParamValue::Int(2)]);
            }
            "heater_set" => {
                let oid = params.get_u32("oid").unwrap();
                let value = params.get_u32("value").unwrap();
                self.log.lock().unwrap().heater_values.push(value);
                let mut out = BytesMut::new();
                for v in [HEATER_OUTPUT_ID, oid, value] {
                    vlq::encode_u32(v, &mut out);
                }
                self.send_block(&out);
            }
            "emergency_stop" => {
                self.shutdown = true;
                self.log.lock().unwrap().shutdown = true;
                let clock = self.clock();
                self.respond(
                    "shutdown",
                    &[
                        ParamValue::Int((clock & 0xffff_ffff) as i64),
                        ParamValue::Int(2),
                    ],
                );
            }
            _ => {}
        }
    }

    fn clock(&self) -> u64 {
        clock_at(self.start, self.config.clock_scale, monotonic())
    }

    fn respond(&mut self, name: &str, args: &[ParamValue]) {
        let payload = self
            .parser
            .lookup_message(name)
            .unwrap()
            .encode(args)
            .unwrap();
        self.send_block(&payload);
    }

    fn send_nak(&mut self) {
        self.log.lock().unwrap().naks_sent += 1;
        self.send_block(&[]);
    }

    fn send_block(&mut self, payload: &[u8]) {
        let mut out = BytesMut::new();
        encode_block(self.next_seq, payload, &mut out).unwrap();
        let _ = self.writer.write_all(&out);
    }
}

pub fn test_config(name: &str) -> McuConfig {
    McuConfig::named(name)
}

/// Firmware plus a connected primary MCU.
pub fn connect(config: FirmwareConfig) -> (Mcu, Firmware) {
    let (stream, firmware) = spawn_firmware(config);
    let mcu = Mcu::connect_stream(stream, test_config("mcu")).unwrap();
    (mcu, firmware)
}

pub fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    done()
}
