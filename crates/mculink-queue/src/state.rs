use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};
use mculink_frame::{
    encode_block, reconstruct_seq, Block, MESSAGE_MAX, MESSAGE_MIN, MESSAGE_PAYLOAD_MAX,
    MESSAGE_SYNC,
};
use tracing::{debug, trace};

use crate::clock_est::ClockEstimate;
use crate::command_queue::{CommandQueue, QueueSlot};
use crate::error::{QueueError, Result};
use crate::message::{QueueMessage, BACKGROUND_PRIORITY_CLOCK, MAX_CLOCK};
use crate::rtt::RttEstimator;
use crate::serialqueue::{LinkState, QueueConfig};
use crate::stats::QueueStats;
use crate::time::{NEVER, NOW};

/// Commands are released this far ahead of their requested clock.
const MIN_REQTIME_DELTA: f64 = 0.250;
/// Extra idle time before background messages are eligible.
const MIN_BACKGROUND_DELTA: f64 = 0.005;
/// Upper bound on bytes handed to the stream per write.
const WRITE_CHUNK: usize = 4096;
/// UART framing: start bit, 8 data bits, stop bit.
const BITS_PER_BYTE: f64 = 10.0;
/// A message may not be scheduled more than 2^31 ticks before it is due.
const MAX_CLOCK_LEAD: u64 = 1 << 31;

#[derive(Debug)]
struct PendingNotify {
    notify_id: u64,
    send_seq: u64,
}

/// All mutable transport state. Guarded by the [`crate::SerialQueue`] mutex.
#[derive(Debug)]
pub(crate) struct LinkCore {
    max_pending_blocks: u64,
    receive_window: usize,
    baud_adjust: f64,
    history_len: usize,
    ce: ClockEstimate,
    rtt: RttEstimator,

    send_seq: u64,
    receive_seq: u64,
    ignore_nak_seq: u64,
    last_ack_seq: u64,
    retransmit_seq: u64,
    rtt_sample_seq: u64,
    need_ack_bytes: usize,
    last_ack_bytes: usize,
    last_receive_sent_time: f64,
    idle_time: f64,

    retransmit_timer: f64,
    command_timer: f64,
    need_kick_clock: u64,

    queues: Vec<Option<QueueSlot>>,
    pending_queues: Vec<usize>,
    ready_bytes: usize,
    upcoming_bytes: usize,
    sent_queue: VecDeque<QueueMessage>,
    notify_queue: VecDeque<PendingNotify>,
    receive_queue: VecDeque<QueueMessage>,
    old_sent: VecDeque<QueueMessage>,
    old_received: VecDeque<QueueMessage>,

    bytes_write: u64,
    bytes_read: u64,
    bytes_retransmit: u64,
    bytes_invalid: u64,

    link: LinkState,
    exit: bool,
}

impl LinkCore {
    pub(crate) fn new(config: &QueueConfig) -> Self {
        let mut core = Self {
            max_pending_blocks: config.max_pending_blocks.max(1),
            receive_window: config.receive_window,
            baud_adjust: 0.0,
            history_len: config.history_len,
            ce: ClockEstimate::default(),
            rtt: RttEstimator::new(),
            send_seq: 1,
            receive_seq: 1,
            ignore_nak_seq: 1,
            last_ack_seq: 0,
            retransmit_seq: 0,
            rtt_sample_seq: 0,
            need_ack_bytes: 0,
            last_ack_bytes: 0,
            last_receive_sent_time: 0.0,
            idle_time: 0.0,
            retransmit_timer: NEVER,
            command_timer: NEVER,
            need_kick_clock: MAX_CLOCK,
            queues: Vec::new(),
            pending_queues: Vec::new(),
            ready_bytes: 0,
            upcoming_bytes: 0,
            sent_queue: VecDeque::new(),
            notify_queue: VecDeque::new(),
            receive_queue: VecDeque::new(),
            old_sent: VecDeque::new(),
            old_received: VecDeque::new(),
            bytes_write: 0,
            bytes_read: 0,
            bytes_retransmit: 0,
            bytes_invalid: 0,
            link: LinkState::Connecting,
            exit: false,
        };
        core.set_wire_frequency(f64::from(config.baud));
        core
    }

    // Configuration

    pub(crate) fn set_wire_frequency(&mut self, frequency: f64) {
        self.baud_adjust = if frequency > 0.0 {
            BITS_PER_BYTE / frequency
        } else {
            0.0
        };
    }

    pub(crate) fn set_receive_window(&mut self, bytes: usize) {
        self.receive_window = bytes;
    }

    pub(crate) fn set_clock_est(&mut self, ce: ClockEstimate) {
        self.ce = ce;
        self.command_timer = NOW;
    }

    pub(crate) fn set_shutdown(&mut self) {
        self.link = LinkState::Shutdown;
    }

    pub(crate) fn link_state(&self) -> LinkState {
        self.link
    }

    pub(crate) fn request_exit(&mut self) {
        self.exit = true;
    }

    pub(crate) fn exited(&self) -> bool {
        self.exit
    }

    // Command queues

    pub(crate) fn alloc_queue(&mut self) -> CommandQueue {
        if let Some(id) = self.queues.iter().position(Option::is_none) {
            self.queues[id] = Some(QueueSlot::default());
            return CommandQueue::from_slot(id);
        }
        self.queues.push(Some(QueueSlot::default()));
        CommandQueue::from_slot(self.queues.len() - 1)
    }

    /// Release a queue; anything still queued on it is discarded.
    pub(crate) fn free_queue(&mut self, cq: CommandQueue) -> Result<()> {
        let slot = self
            .queues
            .get_mut(cq.id())
            .and_then(Option::take)
            .ok_or(QueueError::UnknownQueue(cq.id()))?;
        let (stalled, ready) = slot.queued_bytes();
        if stalled + ready > 0 {
            debug!(queue = cq.id(), stalled, ready, "discarding queued bytes");
        }
        self.upcoming_bytes -= stalled;
        self.ready_bytes -= ready;
        self.pending_queues.retain(|&id| id != cq.id());
        Ok(())
    }

    /// Queue messages on `cq`. Returns true when the I/O thread must be woken.
    pub(crate) fn send_batch(
        &mut self,
        cq: CommandQueue,
        mut msgs: Vec<QueueMessage>,
        urgent: bool,
    ) -> Result<bool> {
        if self.exit {
            return Err(QueueError::Exited);
        }
        if self.link == LinkState::Shutdown && !urgent {
            return Err(QueueError::Shutdown);
        }
        if msgs.is_empty() {
            return Ok(false);
        }

        let mut len = 0usize;
        let mut first_min_clock = MAX_CLOCK;
        for msg in &mut msgs {
            if msg.is_empty() || msg.len() > MESSAGE_PAYLOAD_MAX {
                return Err(QueueError::MessageTooLarge {
                    size: msg.len(),
                    max: MESSAGE_PAYLOAD_MAX,
                });
            }
            let min_clock = msg.min_clock().unwrap_or(0);
            let req_clock = msg.req_clock().unwrap_or(0);
            if req_clock != BACKGROUND_PRIORITY_CLOCK
                && min_clock.saturating_add(MAX_CLOCK_LEAD) < req_clock
            {
                msg.set_min_clock(req_clock - MAX_CLOCK_LEAD);
            }
            first_min_clock = first_min_clock.min(msg.min_clock().unwrap_or(0));
            len += msg.len();
        }

        let slot = self
            .queues
            .get_mut(cq.id())
            .and_then(Option::as_mut)
            .ok_or(QueueError::UnknownQueue(cq.id()))?;
        if slot.is_empty() {
            self.pending_queues.push(cq.id());
        }
        slot.stalled.extend(msgs);
        self.upcoming_bytes += len;

        if first_min_clock < self.need_kick_clock {
            self.need_kick_clock = 0;
            self.command_timer = NOW;
            return Ok(true);
        }
        Ok(false)
    }

    // Receive path

    pub(crate) fn add_invalid(&mut self, bytes: u64) {
        self.bytes_invalid += bytes;
    }

    /// Process one validated block read from the stream at host time `now`.
    pub(crate) fn handle_block(&mut self, block: &Block, now: f64) {
        let len = block.len();
        let rseq = reconstruct_seq(self.receive_seq, block.seq());
        if rseq != self.receive_seq {
            if rseq > self.send_seq && self.link != LinkState::Connecting {
                trace!(rseq, send_seq = self.send_seq, "ack for unsent block");
                self.bytes_invalid += len as u64;
                return;
            }
            self.update_receive_seq(now, rseq);
        }
        if self.link == LinkState::Connecting {
            debug!(seq = rseq, "link synchronized");
            self.link = LinkState::Synchronized;
        }
        self.bytes_read += len as u64;

        // Commands in a block the MCU has acknowledged are complete. A data
        // block may have been generated before the ack arrived, so it proves
        // one block less.
        let proves = if block.is_ack() { 1 } else { 2 };
        let wake_seq = rseq.saturating_sub(proves);
        while self
            .notify_queue
            .front()
            .is_some_and(|n| n.send_seq <= wake_seq)
        {
            if let Some(n) = self.notify_queue.pop_front() {
                self.receive_queue.push_back(QueueMessage::sent(
                    Bytes::new(),
                    self.last_receive_sent_time,
                    now,
                    n.notify_id,
                ));
            }
        }

        if block.is_ack() {
            if self.last_ack_seq < rseq {
                self.last_ack_seq = rseq;
            } else if rseq > self.ignore_nak_seq && !self.sent_queue.is_empty() {
                trace!(rseq, "nak; fast retransmit");
                self.retransmit_timer = NOW;
            }
        } else {
            let sent_time = if rseq > self.retransmit_seq {
                self.last_receive_sent_time
            } else {
                0.0
            };
            let receive_time = now - self.baud_adjust * len as f64;
            let msg = QueueMessage::sent(block.as_bytes().clone(), sent_time, receive_time, 0);
            push_history(&mut self.old_received, msg.clone(), self.history_len);
            self.receive_queue.push_back(msg);
        }
    }

    fn update_receive_seq(&mut self, now: f64, rseq: u64) {
        let mut sent_seq = self.receive_seq;
        loop {
            let Some(sent) = self.sent_queue.pop_front() else {
                // Acked past everything we sent: the MCU's counter is
                // authoritative while connecting.
                self.send_seq = rseq;
                self.last_receive_sent_time = 0.0;
                break;
            };
            self.need_ack_bytes = self.need_ack_bytes.saturating_sub(sent.len());
            self.last_ack_bytes = sent.len();
            self.last_receive_sent_time = sent.receive_time().unwrap_or(0.0);
            push_history(&mut self.old_sent, sent, self.history_len);
            sent_seq += 1;
            if rseq == sent_seq {
                break;
            }
        }
        self.receive_seq = rseq;
        self.command_timer = NOW;

        if self.rtt_sample_seq != 0
            && rseq > self.rtt_sample_seq
            && self.last_receive_sent_time != 0.0
        {
            self.rtt.update(now - self.last_receive_sent_time);
            self.rtt_sample_seq = 0;
        }
        self.retransmit_timer = match self.sent_queue.front() {
            None => NEVER,
            Some(first) => now + self.rtt.rto() + first.len() as f64 * self.baud_adjust,
        };
    }

    pub(crate) fn pop_received(&mut self) -> Option<QueueMessage> {
        self.receive_queue.pop_front()
    }

    pub(crate) fn has_received(&self) -> bool {
        !self.receive_queue.is_empty()
    }

    // Transmit path

    pub(crate) fn retransmit_due(&self, now: f64) -> bool {
        now >= self.retransmit_timer
    }

    pub(crate) fn command_due(&self, now: f64) -> bool {
        now >= self.command_timer
    }

    /// Earliest host time at which a timer needs servicing.
    pub(crate) fn next_wake(&self) -> f64 {
        self.retransmit_timer.min(self.command_timer)
    }

    /// Resend the whole unacknowledged window, preceded by a sync byte.
    pub(crate) fn retransmit(&mut self, now: f64) -> Option<Bytes> {
        let Some(first) = self.sent_queue.front() else {
            self.retransmit_timer = NEVER;
            return None;
        };
        let first_len = first.len() + 1;
        let mut buf = BytesMut::with_capacity(1 + self.sent_queue.len() * MESSAGE_MAX);
        buf.extend_from_slice(&[MESSAGE_SYNC]);
        for sent in &self.sent_queue {
            buf.extend_from_slice(sent.data());
        }
        self.bytes_retransmit += buf.len() as u64;

        if self.retransmit_timer == NOW {
            // Nak-triggered: don't honour a third nak for the same window.
            self.ignore_nak_seq = self.receive_seq;
            if self.receive_seq < self.retransmit_seq {
                self.ignore_nak_seq = self.retransmit_seq;
            }
        } else {
            self.rtt.backoff();
            self.ignore_nak_seq = self.send_seq;
        }
        debug!(
            blocks = self.sent_queue.len(),
            bytes = buf.len(),
            rto = self.rtt.rto(),
            "retransmitting"
        );
        self.retransmit_seq = self.send_seq;
        self.rtt_sample_seq = 0;
        self.idle_time = now + buf.len() as f64 * self.baud_adjust;
        self.retransmit_timer = now + first_len as f64 * self.baud_adjust + self.rtt.rto();
        Some(buf.freeze())
    }

    /// Pack and frame every block that may be sent now.
    pub(crate) fn command_event(&mut self, now: f64) -> Result<Option<Bytes>> {
        let mut out = BytesMut::new();
        let mut pending = 0usize;
        loop {
            let waketime = self.check_send_command(now);
            if waketime != NOW || pending + MESSAGE_MAX > WRITE_CHUNK {
                if pending > 0 {
                    self.bytes_write += pending as u64;
                    self.idle_time = now.max(self.idle_time) + pending as f64 * self.baud_adjust;
                    pending = 0;
                }
                if waketime != NOW {
                    self.command_timer = waketime;
                    break;
                }
            }
            pending += self.build_and_send_command(&mut out, pending, now)?;
        }
        Ok((!out.is_empty()).then(|| out.freeze()))
    }

    /// When the next block may be built: [`NOW`], a future time, or [`NEVER`].
    fn check_send_command(&mut self, now: f64) -> f64 {
        if self.send_seq - self.receive_seq >= self.max_pending_blocks {
            return NEVER;
        }
        if self.send_seq > self.receive_seq && self.receive_window > 0 {
            let mut need_ack_bytes = self.need_ack_bytes + MESSAGE_MAX;
            if self.last_ack_seq < self.receive_seq {
                need_ack_bytes += self.last_ack_bytes;
            }
            if need_ack_bytes > self.receive_window {
                return NEVER;
            }
        }

        let idletime = now.max(self.idle_time) + MESSAGE_MIN as f64 * self.baud_adjust;
        let ack_clock = self.ce.clock_from_time(idletime);
        let background_clock = self
            .ce
            .clock_from_time(self.idle_time + MIN_REQTIME_DELTA + MIN_BACKGROUND_DELTA);
        let mut min_stalled_clock = MAX_CLOCK;
        let mut min_ready_clock = MAX_CLOCK;
        for &id in &self.pending_queues {
            let Some(slot) = self.queues.get_mut(id).and_then(Option::as_mut) else {
                continue;
            };
            while let Some(front) = slot.stalled.front() {
                let min_clock = front.min_clock().unwrap_or(0);
                if ack_clock < min_clock {
                    min_stalled_clock = min_stalled_clock.min(min_clock);
                    break;
                }
                if let Some(msg) = slot.stalled.pop_front() {
                    self.upcoming_bytes -= msg.len();
                    self.ready_bytes += msg.len();
                    slot.ready.push_back(msg);
                }
            }
            if let Some(front) = slot.ready.front() {
                let mut req_clock = front.req_clock().unwrap_or(0);
                if req_clock == BACKGROUND_PRIORITY_CLOCK {
                    req_clock = background_clock;
                }
                min_ready_clock = min_ready_clock.min(req_clock);
            }
        }

        if self.ready_bytes >= MESSAGE_PAYLOAD_MAX {
            return NOW;
        }
        if !self.ce.is_valid() {
            if self.ready_bytes > 0 {
                return NOW;
            }
            self.need_kick_clock = MAX_CLOCK;
            return NEVER;
        }
        let reqclock_delta = (MIN_REQTIME_DELTA * self.ce.est_freq) as u64;
        if min_ready_clock <= ack_clock.saturating_add(reqclock_delta) {
            return NOW;
        }
        if min_ready_clock == MAX_CLOCK && min_stalled_clock == MAX_CLOCK {
            self.need_kick_clock = MAX_CLOCK;
            return NEVER;
        }
        let wantclock = (min_ready_clock - reqclock_delta).min(min_stalled_clock);
        self.need_kick_clock = wantclock;
        idletime + wantclock.saturating_sub(ack_clock) as f64 / self.ce.est_freq
    }

    /// Fill one block from the ready queues (lowest requested clock first),
    /// append it to `out` and track it as unacknowledged.
    fn build_and_send_command(
        &mut self,
        out: &mut BytesMut,
        pending: usize,
        now: f64,
    ) -> Result<usize> {
        let mut payload = BytesMut::with_capacity(MESSAGE_PAYLOAD_MAX);
        while self.ready_bytes > 0 {
            let mut best: Option<(usize, u64)> = None;
            for (pos, &id) in self.pending_queues.iter().enumerate() {
                let front = self
                    .queues
                    .get(id)
                    .and_then(Option::as_ref)
                    .and_then(|slot| slot.ready.front());
                if let Some(req_clock) = front.and_then(QueueMessage::req_clock) {
                    if best.is_none_or(|(_, clock)| req_clock < clock) {
                        best = Some((pos, req_clock));
                    }
                }
            }
            let Some((pos, _)) = best else { break };
            let id = self.pending_queues[pos];
            let Some(slot) = self.queues.get_mut(id).and_then(Option::as_mut) else {
                break;
            };
            let fits = slot
                .ready
                .front()
                .is_some_and(|m| payload.len() + m.len() <= MESSAGE_PAYLOAD_MAX);
            if !fits {
                break;
            }
            let Some(msg) = slot.ready.pop_front() else { break };
            if slot.is_empty() {
                self.pending_queues.remove(pos);
            }
            payload.extend_from_slice(msg.data());
            self.ready_bytes -= msg.len();
            if msg.notify_id() != 0 {
                self.notify_queue.push_back(PendingNotify {
                    notify_id: msg.notify_id(),
                    send_seq: self.send_seq,
                });
            }
        }

        let start = out.len();
        encode_block(self.send_seq, &payload, out)?;
        let block = Bytes::copy_from_slice(&out[start..]);
        let len = block.len();

        let idletime = now.max(self.idle_time) + (pending + len) as f64 * self.baud_adjust;
        if self.sent_queue.is_empty() {
            self.retransmit_timer = idletime + self.rtt.rto();
        }
        if self.rtt_sample_seq == 0 {
            self.rtt_sample_seq = self.send_seq;
        }
        trace!(seq = self.send_seq, len, "queued block");
        self.send_seq += 1;
        self.need_ack_bytes += len;
        self.sent_queue
            .push_back(QueueMessage::sent(block, now, idletime, 0));
        Ok(len)
    }

    // Introspection

    pub(crate) fn stats(&self) -> QueueStats {
        QueueStats {
            bytes_write: self.bytes_write,
            bytes_read: self.bytes_read,
            bytes_retransmit: self.bytes_retransmit,
            bytes_invalid: self.bytes_invalid,
            send_seq: self.send_seq,
            receive_seq: self.receive_seq,
            retransmit_seq: self.retransmit_seq,
            srtt: self.rtt.srtt(),
            rttvar: self.rtt.rttvar(),
            rto: self.rtt.rto(),
            ready_bytes: self.ready_bytes,
            upcoming_bytes: self.upcoming_bytes,
        }
    }

    pub(crate) fn extract_old(&self, sent: bool) -> Vec<QueueMessage> {
        let history = if sent {
            &self.old_sent
        } else {
            &self.old_received
        };
        history.iter().cloned().collect()
    }
}

fn push_history(history: &mut VecDeque<QueueMessage>, msg: QueueMessage, max: usize) {
    if max == 0 {
        return;
    }
    if history.len() >= max {
        history.pop_front();
    }
    history.push_back(msg);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn core() -> LinkCore {
        LinkCore::new(&QueueConfig {
            baud: 0,
            ..QueueConfig::default()
        })
    }

    fn ack(seq: u64) -> Block {
        block(seq, &[])
    }

    fn block(seq: u64, payload: &[u8]) -> Block {
        let mut buf = BytesMut::new();
        encode_block(seq, payload, &mut buf).unwrap();
        Block::from_validated(buf.freeze())
    }

    fn payloads(data: &[u8]) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        let mut pos = 0;
        while pos < data.len() {
            if data[pos] == MESSAGE_SYNC {
                pos += 1;
                continue;
            }
            let len = data[pos] as usize;
            out.push(data[pos + 2..pos + len - 3].to_vec());
            pos += len;
        }
        out
    }

    #[test]
    fn lowest_req_clock_first_across_queues() {
        let mut core = core();
        let (a, b, c) = (core.alloc_queue(), core.alloc_queue(), core.alloc_queue());
        core.send_batch(a, vec![QueueMessage::new(vec![0xa], 0, 300)], false)
            .unwrap();
        core.send_batch(b, vec![QueueMessage::new(vec![0xb], 0, 100)], false)
            .unwrap();
        core.send_batch(c, vec![QueueMessage::new(vec![0xc], 0, 200)], false)
            .unwrap();

        let out = core.command_event(1.0).unwrap().unwrap();
        assert_eq!(payloads(&out), vec![vec![0xb, 0xc, 0xa]]);
        assert_eq!(core.send_seq, 2);
        assert_eq!(core.ready_bytes, 0);
        assert!(core.pending_queues.is_empty());
        assert_eq!(core.command_timer, NEVER);
    }

    #[test]
    fn fifo_within_a_queue() {
        let mut core = core();
        let q = core.alloc_queue();
        let msgs = vec![
            QueueMessage::new(vec![1], 0, 500),
            QueueMessage::new(vec![2], 0, 100),
        ];
        core.send_batch(q, msgs, false).unwrap();
        let out = core.command_event(1.0).unwrap().unwrap();
        assert_eq!(payloads(&out), vec![vec![1, 2]]);
    }

    #[test]
    fn full_payloads_split_into_blocks() {
        let mut core = core();
        let q = core.alloc_queue();
        let msgs = (0..3).map(|i| QueueMessage::immediate(vec![i; 40])).collect();
        core.send_batch(q, msgs, false).unwrap();
        let out = core.command_event(1.0).unwrap().unwrap();
        let blocks = payloads(&out);
        assert_eq!(blocks.len(), 3);
        assert!(blocks.iter().all(|p| p.len() == 40));
        assert_eq!(core.stats().bytes_write, out.len() as u64);
    }

    #[test]
    fn window_limits_blocks_in_flight() {
        let mut core = core();
        let q = core.alloc_queue();
        let msgs = (0..20)
            .map(|_| QueueMessage::immediate(vec![7; MESSAGE_PAYLOAD_MAX]))
            .collect();
        core.send_batch(q, msgs, false).unwrap();
        let out = core.command_event(1.0).unwrap().unwrap();
        assert_eq!(payloads(&out).len(), 12);
        assert_eq!(core.command_timer, NEVER);

        // Acking two blocks opens the window for two more.
        core.handle_block(&ack(3), 1.1);
        assert_eq!(core.command_timer, NOW);
        let out = core.command_event(1.1).unwrap().unwrap();
        assert_eq!(payloads(&out).len(), 2);
        assert_eq!(core.send_seq, 15);
    }

    #[test]
    fn receive_window_limits_unacked_bytes() {
        let mut core = core();
        core.set_receive_window(128);
        let q = core.alloc_queue();
        let msgs = (0..4)
            .map(|_| QueueMessage::immediate(vec![1; 50]))
            .collect();
        core.send_batch(q, msgs, false).unwrap();
        let out = core.command_event(1.0).unwrap().unwrap();
        assert_eq!(payloads(&out).len(), 2);
        assert_eq!(core.need_ack_bytes, 110);
    }

    #[test]
    fn stalled_until_min_clock_reachable() {
        let mut core = core();
        core.set_clock_est(ClockEstimate::new(1000.0, 0.0, 0, 0));
        let q = core.alloc_queue();
        core.send_batch(q, vec![QueueMessage::new(vec![5], 5000, 5000)], false)
            .unwrap();

        assert!(core.command_event(1.0).unwrap().is_none());
        assert!((core.command_timer - 5.0).abs() < 0.01);
        assert_eq!(core.stats().upcoming_bytes, 1);
        assert_eq!(core.need_kick_clock, 5000);

        let out = core.command_event(5.0).unwrap().unwrap();
        assert_eq!(payloads(&out), vec![vec![5]]);
        assert_eq!(core.stats().upcoming_bytes, 0);
    }

    #[test]
    fn stalled_messages_promote_in_queue_order_as_clock_advances() {
        let mut core = core();
        let q = core.alloc_queue();
        let msgs = vec![
            QueueMessage::new(vec![1], 1000, 1000),
            QueueMessage::new(vec![2], 3000, 3000),
            QueueMessage::new(vec![3], 2000, 2000),
        ];
        core.send_batch(q, msgs, false).unwrap();
        let at_clock = |clock| ClockEstimate::new(1000.0, 1.0, clock, clock);

        core.set_clock_est(at_clock(0));
        assert!(core.command_event(1.0).unwrap().is_none());
        assert_eq!(core.stats().upcoming_bytes, 3);

        core.set_clock_est(at_clock(1500));
        let out = core.command_event(1.0).unwrap().unwrap();
        assert_eq!(payloads(&out), vec![vec![1]]);
        assert_eq!(core.need_kick_clock, 3000);

        // The third message is due but stays behind the second.
        core.set_clock_est(at_clock(2500));
        assert!(core.command_event(1.0).unwrap().is_none());
        assert_eq!(core.stats().upcoming_bytes, 2);

        core.set_clock_est(at_clock(3500));
        let out = core.command_event(1.0).unwrap().unwrap();
        assert_eq!(payloads(&out), vec![vec![2, 3]]);
        assert_eq!(core.stats().upcoming_bytes, 0);
        assert_eq!(core.send_seq, 3);
    }

    #[test]
    fn earlier_message_kicks_the_scheduler() {
        let mut core = core();
        core.set_clock_est(ClockEstimate::new(1000.0, 0.0, 0, 0));
        let q = core.alloc_queue();
        core.send_batch(q, vec![QueueMessage::new(vec![5], 5000, 5000)], false)
            .unwrap();
        core.command_event(1.0).unwrap();

        let other = core.alloc_queue();
        let kick = core
            .send_batch(other, vec![QueueMessage::new(vec![6], 1000, 1200)], false)
            .unwrap();
        assert!(kick);
        assert_eq!(core.command_timer, NOW);
    }

    #[test]
    fn far_future_min_clock_is_clamped() {
        let mut core = core();
        let q = core.alloc_queue();
        let req = 10 * MAX_CLOCK_LEAD;
        core.send_batch(q, vec![QueueMessage::new(vec![1], 0, req)], false)
            .unwrap();
        let slot = core.queues[q.id()].as_ref().unwrap();
        assert_eq!(slot.stalled[0].min_clock(), Some(req - MAX_CLOCK_LEAD));
    }

    #[test]
    fn background_waits_for_idle_link() {
        let mut core = core();
        core.set_clock_est(ClockEstimate::new(1000.0, 0.0, 0, 0));
        let q = core.alloc_queue();
        core.send_batch(q, vec![QueueMessage::background(vec![9])], false)
            .unwrap();
        assert!(core.command_event(1.0).unwrap().is_some());
    }

    #[test]
    fn ack_releases_window_and_samples_rtt() {
        let mut core = core();
        let q = core.alloc_queue();
        core.send_batch(q, vec![QueueMessage::immediate(vec![1])], false)
            .unwrap();
        core.command_event(1.0).unwrap();
        assert_eq!(core.retransmit_timer, 1.0 + core.rtt.rto());

        core.handle_block(&ack(2), 1.004);
        assert_eq!(core.link_state(), LinkState::Synchronized);
        assert_eq!(core.receive_seq, 2);
        assert!(core.sent_queue.is_empty());
        assert_eq!(core.retransmit_timer, NEVER);
        assert!((core.rtt.srtt() - 0.04).abs() < 1e-9);
        assert_eq!(core.extract_old(true).len(), 1);
    }

    #[test]
    fn timeout_retransmits_window_and_backs_off() {
        let mut core = core();
        let q = core.alloc_queue();
        core.send_batch(q, vec![QueueMessage::immediate(vec![1, 2, 3])], false)
            .unwrap();
        let sent = core.command_event(1.0).unwrap().unwrap();
        let rto = core.rtt.rto();

        assert!(core.retransmit_due(1.0 + rto));
        let again = core.retransmit(1.0 + rto).unwrap();
        assert_eq!(again[0], MESSAGE_SYNC);
        assert_eq!(&again[1..], &sent[..]);
        assert_eq!(core.rtt.rto(), 2.0 * rto);
        assert_eq!(core.retransmit_seq, core.send_seq);
        assert_eq!(core.ignore_nak_seq, core.send_seq);
        assert_eq!(core.stats().bytes_retransmit, again.len() as u64);
    }

    #[test]
    fn duplicate_ack_is_nak() {
        let mut core = core();
        let q = core.alloc_queue();
        let msgs = (0..2)
            .map(|_| QueueMessage::immediate(vec![1; MESSAGE_PAYLOAD_MAX]))
            .collect();
        core.send_batch(q, msgs, false).unwrap();
        core.command_event(1.0).unwrap();

        core.handle_block(&ack(2), 1.01);
        assert_ne!(core.retransmit_timer, NOW);
        core.handle_block(&ack(2), 1.02);
        assert_eq!(core.retransmit_timer, NOW);

        let rto = core.rtt.rto();
        let again = core.retransmit(1.02).unwrap();
        assert_eq!(payloads(&again).len(), 1);
        assert_eq!(core.rtt.rto(), rto);
        assert_eq!(core.ignore_nak_seq, 2);

        // A further duplicate for the same window is ignored.
        core.handle_block(&ack(2), 1.03);
        assert_ne!(core.retransmit_timer, NOW);
    }

    #[test]
    fn ack_beyond_sent_is_invalid_once_synchronized() {
        let mut core = core();
        core.handle_block(&ack(1), 1.0);
        assert_eq!(core.link_state(), LinkState::Synchronized);
        core.handle_block(&ack(9), 1.1);
        assert_eq!(core.receive_seq, 1);
        assert_eq!(core.stats().bytes_invalid, 5);
    }

    #[test]
    fn connecting_adopts_mcu_sequence() {
        let mut core = core();
        let q = core.alloc_queue();
        core.send_batch(q, vec![QueueMessage::immediate(vec![1])], false)
            .unwrap();
        core.command_event(1.0).unwrap();
        core.handle_block(&ack(6), 1.01);
        assert_eq!(core.send_seq, 6);
        assert_eq!(core.receive_seq, 6);
        assert!(core.sent_queue.is_empty());
    }

    #[test]
    fn data_block_is_delivered_with_timing() {
        let mut core = core();
        let q = core.alloc_queue();
        core.send_batch(q, vec![QueueMessage::immediate(vec![1])], false)
            .unwrap();
        core.command_event(1.0).unwrap();
        core.handle_block(&block(2, &[0x42, 0x01]), 1.02);

        let msg = core.pop_received().unwrap();
        assert_eq!(msg.block_payload(), &[0x42, 0x01]);
        assert_eq!(msg.sent_time(), Some(1.0));
        assert_eq!(msg.receive_time(), Some(1.02));
        assert_eq!(core.extract_old(false).len(), 1);
        assert!(!core.has_received());
    }

    #[test]
    fn notification_after_ack() {
        let mut core = core();
        let q = core.alloc_queue();
        core.send_batch(q, vec![QueueMessage::immediate(vec![1]).with_notify(42)], false)
            .unwrap();
        core.command_event(1.0).unwrap();
        assert!(!core.has_received());

        core.handle_block(&ack(2), 1.01);
        let note = core.pop_received().unwrap();
        assert!(note.is_notification());
        assert_eq!(note.notify_id(), 42);
        assert_eq!(note.receive_time(), Some(1.01));
    }

    #[test]
    fn shutdown_rejects_all_but_urgent() {
        let mut core = core();
        let q = core.alloc_queue();
        core.set_shutdown();
        let err = core
            .send_batch(q, vec![QueueMessage::immediate(vec![1])], false)
            .unwrap_err();
        assert!(matches!(err, QueueError::Shutdown));
        assert!(core
            .send_batch(q, vec![QueueMessage::immediate(vec![2])], true)
            .is_ok());
    }

    #[test]
    fn invalid_messages_rejected() {
        let mut core = core();
        let q = core.alloc_queue();
        let err = core
            .send_batch(q, vec![QueueMessage::immediate(vec![0; 60])], false)
            .unwrap_err();
        assert!(matches!(err, QueueError::MessageTooLarge { size: 60, max: 59 }));
        assert!(core
            .send_batch(q, vec![QueueMessage::immediate(Vec::new())], false)
            .is_err());
        assert_eq!(core.stats().upcoming_bytes, 0);
    }

    #[test]
    fn freed_queue_discards_and_is_reused() {
        let mut core = core();
        let q = core.alloc_queue();
        core.send_batch(q, vec![QueueMessage::immediate(vec![1, 2])], false)
            .unwrap();
        core.free_queue(q).unwrap();
        assert_eq!(core.stats().upcoming_bytes, 0);
        assert!(core.pending_queues.is_empty());
        assert!(matches!(
            core.send_batch(q, vec![QueueMessage::immediate(vec![1])], false),
            Err(QueueError::UnknownQueue(0))
        ));
        assert!(matches!(core.free_queue(q), Err(QueueError::UnknownQueue(0))));
        assert_eq!(core.alloc_queue(), q);
    }

    #[test]
    fn history_is_bounded() {
        let mut core = LinkCore::new(&QueueConfig {
            baud: 0,
            history_len: 2,
            ..QueueConfig::default()
        });
        for seq in 0..5u8 {
            core.handle_block(&block(1, &[seq]), 1.0);
        }
        let old = core.extract_old(false);
        assert_eq!(old.len(), 2);
        assert_eq!(old[1].block_payload(), &[4]);
    }
}
