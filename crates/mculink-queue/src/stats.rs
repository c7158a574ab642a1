use std::fmt;

use serde::Serialize;

/// Counters and timing state of one transport.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueueStats {
    pub bytes_write: u64,
    pub bytes_read: u64,
    pub bytes_retransmit: u64,
    pub bytes_invalid: u64,
    pub send_seq: u64,
    pub receive_seq: u64,
    pub retransmit_seq: u64,
    pub srtt: f64,
    pub rttvar: f64,
    pub rto: f64,
    pub ready_bytes: usize,
    /// Bytes queued but still waiting for their minimum clock.
    pub upcoming_bytes: usize,
}

impl fmt::Display for QueueStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "bytes_write={} bytes_read={} bytes_retransmit={} bytes_invalid={} \
             send_seq={} receive_seq={} retransmit_seq={} \
             srtt={:.3} rttvar={:.3} rto={:.3} ready_bytes={} upcoming_bytes={}",
            self.bytes_write,
            self.bytes_read,
            self.bytes_retransmit,
            self.bytes_invalid,
            self.send_seq,
            self.receive_seq,
            self.retransmit_seq,
            self.srtt,
            self.rttvar,
            self.rto,
            self.ready_bytes,
            self.upcoming_bytes,
        )
    }
}
