//! Clock offset estimation between host and clients.
//!
//! The host probes with `TimeSync(t_host, seq)`; a client takes `t_host - now` as its
//! provisional offset and echoes the probe with its own timestamp. The host then
//! estimates a per-peer offset Cristian-style, assuming symmetric latency.
//!
//! Only the client's provisional offset feeds the match start. The host-side
//! estimate is kept for diagnostics.

use std::collections::{BTreeMap, HashMap};

use crate::protocol::NetMessage;

/// Probe send times kept for matching echoes.
const SEND_HISTORY: usize = 32;

/// Host-side estimate for one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffsetSample {
    pub seq: i32,
    pub rtt_ms: i64,
    pub offset_ms: i64,
}

/// Round trip and offset from one echoed probe:
/// `rtt = recv - send`, `offset = t_client - (send + rtt / 2)`.
pub fn estimate_offset(host_send_ms: i64, host_recv_ms: i64, t_client_ms: i64) -> (i64, i64) {
    let rtt = host_recv_ms - host_send_ms;
    (rtt, t_client_ms - (host_send_ms + rtt / 2))
}

#[derive(Debug, Default)]
pub struct HostSync {
    next_seq: i32,
    send_times: BTreeMap<i32, i64>,
    offsets: HashMap<String, OffsetSample>,
}

impl HostSync {
    pub fn new() -> Self {
        Self {
            next_seq: 1,
            ..Default::default()
        }
    }

    /// Build the next probe and remember when it was sent.
    pub fn next_probe(&mut self, now_ms: i64) -> NetMessage {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        self.send_times.insert(seq, now_ms);
        while self.send_times.len() > SEND_HISTORY {
            self.send_times.pop_first();
        }
        NetMessage::TimeSync {
            t_host: now_ms,
            seq,
            t_client: None,
        }
    }

    /// Handle an echoed probe. `None` when the sequence is unknown or expired.
    pub fn on_echo(&mut self, peer_id: &str, seq: i32, t_client_ms: i64, now_ms: i64) -> Option<OffsetSample> {
        let sent = *self.send_times.get(&seq)?;
        let (rtt_ms, offset_ms) = estimate_offset(sent, now_ms, t_client_ms);
        let sample = OffsetSample {
            seq,
            rtt_ms,
            offset_ms,
        };
        self.offsets.insert(peer_id.to_string(), sample);
        Some(sample)
    }

    pub fn offset_for(&self, peer_id: &str) -> Option<OffsetSample> {
        self.offsets.get(peer_id).copied()
    }

    pub fn offsets(&self) -> &HashMap<String, OffsetSample> {
        &self.offsets
    }

    pub fn forget_peer(&mut self, peer_id: &str) {
        self.offsets.remove(peer_id);
    }
}

#[derive(Debug, Default)]
pub struct ClientSync {
    provisional_offset_ms: Option<i64>,
    last_seq: Option<i32>,
}

impl ClientSync {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the provisional offset from a host probe and build the echo.
    pub fn on_probe(&mut self, t_host: i64, seq: i32, now_ms: i64) -> NetMessage {
        self.provisional_offset_ms = Some(t_host - now_ms);
        self.last_seq = Some(seq);
        NetMessage::TimeSync {
            t_host,
            seq,
            t_client: Some(now_ms),
        }
    }

    /// `host clock - local clock` from the most recent probe.
    pub fn provisional_offset_ms(&self) -> Option<i64> {
        self.provisional_offset_ms
    }

    pub fn last_seq(&self) -> Option<i32> {
        self.last_seq
    }

    /// Translate a host instant to the local clock; no sample yet means no correction.
    pub fn to_local(&self, host_ms: i64) -> i64 {
        host_ms - self.provisional_offset_ms.unwrap_or(0)
    }
}
