//! Race event payloads carried inside `NetMessage::Event`.
//!
//! Payloads are bincode with fixed-width little-endian integers, so the layout is
//! exactly the field widths in declaration order:
//! - StartMatch: `host_go_at_ms: i64 | countdown_seconds: u8 | target_laps: u8`
//! - CancelMatch: empty
//! - LapCompleted: `laps: u8 | last_lap_ms: i64 | elapsed_since_go_ms: i64`
//! - Finished: `laps: u8 | elapsed_since_go_ms: i64`

use serde::{Deserialize, Serialize};

use crate::protocol::{EventType, NetMessage};

pub const DEFAULT_COUNTDOWN_SECONDS: u8 = 3;
pub const DEFAULT_TARGET_LAPS: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartMatch {
    pub host_go_at_ms: i64,
    pub countdown_seconds: u8,
    pub target_laps: u8,
}

impl StartMatch {
    /// Go instant `countdown + 1` seconds after `now`.
    pub fn scheduled(now_ms: i64, countdown_seconds: u8, target_laps: u8) -> Self {
        Self {
            host_go_at_ms: now_ms + (countdown_seconds as i64 + 1) * 1000,
            countdown_seconds,
            target_laps,
        }
    }

    /// Lenient read: missing fields fall back to `now + 4000`, 3 s countdown, 3 laps.
    fn read_lenient(payload: &[u8], now_ms: i64) -> Self {
        if let Ok(full) = bincode::deserialize::<StartMatch>(payload) {
            return full;
        }
        let host_go_at_ms = payload
            .get(..8)
            .and_then(|b| bincode::deserialize::<i64>(b).ok())
            .unwrap_or(now_ms + (DEFAULT_COUNTDOWN_SECONDS as i64 + 1) * 1000);
        Self {
            host_go_at_ms,
            countdown_seconds: payload.get(8).copied().unwrap_or(DEFAULT_COUNTDOWN_SECONDS),
            target_laps: payload.get(9).copied().unwrap_or(DEFAULT_TARGET_LAPS),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LapCompleted {
    pub laps: u8,
    /// 0 when the lap has no measured duration.
    pub last_lap_ms: i64,
    pub elapsed_since_go_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finished {
    pub laps: u8,
    pub elapsed_since_go_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaceEvent {
    StartMatch(StartMatch),
    CancelMatch,
    LapCompleted(LapCompleted),
    Finished(Finished),
}

#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("unknown event type {0}")]
    UnknownType(i32),
    #[error("malformed event payload: {0}")]
    Payload(#[from] bincode::Error),
}

impl RaceEvent {
    pub fn event_type(&self) -> EventType {
        match self {
            RaceEvent::StartMatch(_) => EventType::StartMatch,
            RaceEvent::CancelMatch => EventType::CancelMatch,
            RaceEvent::LapCompleted(_) => EventType::LapCompleted,
            RaceEvent::Finished(_) => EventType::Finished,
        }
    }

    pub fn encode_payload(&self) -> Result<Vec<u8>, EventError> {
        let payload = match self {
            RaceEvent::StartMatch(e) => bincode::serialize(e)?,
            RaceEvent::CancelMatch => Vec::new(),
            RaceEvent::LapCompleted(e) => bincode::serialize(e)?,
            RaceEvent::Finished(e) => bincode::serialize(e)?,
        };
        Ok(payload)
    }

    pub fn to_message(&self) -> Result<NetMessage, EventError> {
        Ok(NetMessage::event(self.event_type(), self.encode_payload()?))
    }

    /// Decode an event payload. `now_ms` supplies the fallback go instant for
    /// a truncated StartMatch.
    pub fn decode(kind: i32, payload: &[u8], now_ms: i64) -> Result<Self, EventError> {
        let event = match EventType::from_code(kind) {
            Some(EventType::StartMatch) => {
                RaceEvent::StartMatch(StartMatch::read_lenient(payload, now_ms))
            }
            Some(EventType::CancelMatch) => RaceEvent::CancelMatch,
            Some(EventType::LapCompleted) => RaceEvent::LapCompleted(bincode::deserialize(payload)?),
            Some(EventType::Finished) => RaceEvent::Finished(bincode::deserialize(payload)?),
            None => return Err(EventError::UnknownType(kind)),
        };
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_match_layout() {
        let e = RaceEvent::StartMatch(StartMatch::scheduled(10_000, 3, 5));
        let payload = e.encode_payload().unwrap();
        assert_eq!(payload.len(), 10);
        assert_eq!(&payload[..8], &14_000i64.to_le_bytes());
        assert_eq!(payload[8], 3);
        assert_eq!(payload[9], 5);
        assert_eq!(RaceEvent::decode(1, &payload, 0).unwrap(), e);
    }

    #[test]
    fn lap_and_finish_layout() {
        let lap = LapCompleted {
            laps: 2,
            last_lap_ms: 22_000,
            elapsed_since_go_ms: 42_000,
        };
        let payload = RaceEvent::LapCompleted(lap).encode_payload().unwrap();
        assert_eq!(payload.len(), 17);
        assert_eq!(payload[0], 2);
        assert_eq!(&payload[1..9], &22_000i64.to_le_bytes());
        assert_eq!(&payload[9..], &42_000i64.to_le_bytes());

        let fin = Finished {
            laps: 3,
            elapsed_since_go_ms: 61_000,
        };
        let payload = RaceEvent::Finished(fin).encode_payload().unwrap();
        assert_eq!(payload.len(), 9);
        assert_eq!(RaceEvent::decode(4, &payload, 0).unwrap(), RaceEvent::Finished(fin));
    }

    #[test]
    fn truncated_start_match_uses_defaults() {
        match RaceEvent::decode(1, &[], 50_000).unwrap() {
            RaceEvent::StartMatch(s) => {
                assert_eq!(s.host_go_at_ms, 54_000);
                assert_eq!(s.countdown_seconds, 3);
                assert_eq!(s.target_laps, 3);
            }
            other => panic!("expected StartMatch, got {other:?}"),
        }
        let mut only_go = 70_000i64.to_le_bytes().to_vec();
        only_go.push(5);
        match RaceEvent::decode(1, &only_go, 0).unwrap() {
            RaceEvent::StartMatch(s) => {
                assert_eq!(s.host_go_at_ms, 70_000);
                assert_eq!(s.countdown_seconds, 5);
                assert_eq!(s.target_laps, 3);
            }
            other => panic!("expected StartMatch, got {other:?}"),
        }
    }

    #[test]
    fn truncated_lap_is_an_error() {
        assert!(matches!(
            RaceEvent::decode(3, &[1, 2, 3], 0),
            Err(EventError::Payload(_))
        ));
        assert!(matches!(
            RaceEvent::decode(42, &[], 0),
            Err(EventError::UnknownType(42))
        ));
    }
}
