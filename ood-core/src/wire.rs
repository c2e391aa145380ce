//! Peer message codec (`[type: u8][fields…]`, little-endian) and stream framing
//! (4 bytes LE length + payload) for byte-stream transports.

use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use tracing::warn;

use crate::protocol::{msg_type, NetMessage};

pub const LEN_SIZE: usize = 4;
pub const MAX_FRAME_LEN: u32 = 64 * 1024;

/// Encode a peer message. Infallible: every variant has a fixed layout.
pub fn encode_message(msg: &NetMessage) -> Vec<u8> {
    // Vec writes cannot fail.
    let mut out = Vec::with_capacity(32);
    match msg {
        NetMessage::Join {
            name,
            protocol_version,
        } => {
            let name = clamp_to_char_boundary(name.as_deref().unwrap_or(""), u16::MAX as usize);
            out.push(msg_type::JOIN);
            let _ = out.write_u16::<LittleEndian>(name.len() as u16);
            out.extend_from_slice(name.as_bytes());
            let _ = out.write_i32::<LittleEndian>(*protocol_version);
        }
        NetMessage::TimeSync {
            t_host,
            seq,
            t_client,
        } => {
            out.push(msg_type::TIME_SYNC);
            let _ = out.write_i64::<LittleEndian>(*t_host);
            let _ = out.write_i32::<LittleEndian>(*seq);
            // 0 stands for "no client timestamp".
            let _ = out.write_i64::<LittleEndian>(t_client.unwrap_or(0));
        }
        NetMessage::Input {
            throttle,
            lane_change,
            fire,
            ts_client,
        } => {
            out.push(msg_type::INPUT);
            let _ = out.write_i32::<LittleEndian>(*throttle);
            let _ = out.write_i32::<LittleEndian>(*lane_change);
            out.push(*fire as u8);
            let _ = out.write_i64::<LittleEndian>(*ts_client);
        }
        NetMessage::Telemetry {
            piece_id,
            location_id,
            offset_mm,
            speed_mmps,
            flags,
            ts_client,
        } => {
            out.push(msg_type::TELEMETRY);
            let _ = out.write_i32::<LittleEndian>(*piece_id);
            let _ = out.write_i32::<LittleEndian>(*location_id);
            let _ = out.write_f32::<LittleEndian>(*offset_mm);
            let _ = out.write_i32::<LittleEndian>(*speed_mmps);
            let _ = out.write_i32::<LittleEndian>(*flags);
            let _ = out.write_i64::<LittleEndian>(*ts_client);
        }
        NetMessage::WorldState { tick } => {
            out.push(msg_type::WORLD_STATE);
            let _ = out.write_i32::<LittleEndian>(*tick);
        }
        NetMessage::Event { kind, payload } => {
            let n = payload.len().min(u16::MAX as usize);
            if n < payload.len() {
                warn!(kind, len = payload.len(), "event payload truncated to fit its length prefix");
            }
            out.push(msg_type::EVENT);
            let _ = out.write_i32::<LittleEndian>(*kind);
            let _ = out.write_u16::<LittleEndian>(n as u16);
            out.extend_from_slice(&payload[..n]);
        }
        NetMessage::Ping { nonce } => {
            out.push(msg_type::PING);
            let _ = out.write_i32::<LittleEndian>(*nonce);
        }
    }
    out
}

/// Longest prefix of `s` no longer than `max` bytes that ends on a char boundary.
fn clamp_to_char_boundary(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Decode a peer message. Empty, truncated, or unknown-type input yields `None`.
///
/// A TimeSync `t_client` of 0 (or a frame without it) decodes as `None`, so a client
/// clock that reads exactly 0 is indistinguishable from a probe.
pub fn decode_message(bytes: &[u8]) -> Option<NetMessage> {
    let mut c = Cursor::new(bytes);
    let kind = c.read_u8().ok()?;
    let msg = match kind {
        msg_type::JOIN => {
            let n = c.read_u16::<LittleEndian>().ok()? as usize;
            let mut name = vec![0u8; n];
            c.read_exact(&mut name).ok()?;
            let protocol_version = c.read_i32::<LittleEndian>().ok()?;
            let name = if n > 0 {
                Some(String::from_utf8_lossy(&name).into_owned())
            } else {
                None
            };
            NetMessage::Join {
                name,
                protocol_version,
            }
        }
        msg_type::TIME_SYNC => {
            let t_host = c.read_i64::<LittleEndian>().ok()?;
            let seq = c.read_i32::<LittleEndian>().ok()?;
            let t_client = c.read_i64::<LittleEndian>().ok().filter(|&t| t != 0);
            NetMessage::TimeSync {
                t_host,
                seq,
                t_client,
            }
        }
        msg_type::INPUT => NetMessage::Input {
            throttle: c.read_i32::<LittleEndian>().ok()?,
            lane_change: c.read_i32::<LittleEndian>().ok()?,
            fire: c.read_u8().ok()? & 1 != 0,
            ts_client: c.read_i64::<LittleEndian>().ok()?,
        },
        msg_type::TELEMETRY => NetMessage::Telemetry {
            piece_id: c.read_i32::<LittleEndian>().ok()?,
            location_id: c.read_i32::<LittleEndian>().ok()?,
            offset_mm: c.read_f32::<LittleEndian>().ok()?,
            speed_mmps: c.read_i32::<LittleEndian>().ok()?,
            flags: c.read_i32::<LittleEndian>().ok()?,
            ts_client: c.read_i64::<LittleEndian>().ok()?,
        },
        msg_type::WORLD_STATE => NetMessage::WorldState {
            tick: c.read_i32::<LittleEndian>().ok()?,
        },
        msg_type::EVENT => {
            let kind = c.read_i32::<LittleEndian>().ok()?;
            let n = c.read_u16::<LittleEndian>().ok()? as usize;
            let mut payload = vec![0u8; n];
            c.read_exact(&mut payload).ok()?;
            NetMessage::Event { kind, payload }
        }
        msg_type::PING => NetMessage::Ping {
            nonce: c.read_i32::<LittleEndian>().ok()?,
        },
        _ => return None,
    };
    Some(msg)
}

/// Wrap one payload into a stream frame: 4 bytes LE length + payload.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, FrameEncodeError> {
    let len = payload.len() as u32;
    if payload.len() > MAX_FRAME_LEN as usize {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("frame too large")]
    TooLarge,
}

/// Decode one frame from the front of `bytes`. Returns the payload and the number of bytes consumed.
/// Call with partial buffer; returns `NeedMore` until the whole frame is present.
pub fn decode_frame(bytes: &[u8]) -> Result<(&[u8], usize), FrameDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let len = frame_len([bytes[0], bytes[1], bytes[2], bytes[3]])?;
    if bytes.len() < LEN_SIZE + len {
        return Err(FrameDecodeError::NeedMore);
    }
    Ok((&bytes[LEN_SIZE..LEN_SIZE + len], LEN_SIZE + len))
}

/// Validate a length header read off a stream.
pub fn frame_len(header: [u8; LEN_SIZE]) -> Result<usize, FrameDecodeError> {
    let len = u32::from_le_bytes(header);
    if len > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge);
    }
    Ok(len as usize)
}

#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_sync_layout() {
        let bytes = encode_message(&NetMessage::TimeSync {
            t_host: 1000,
            seq: 7,
            t_client: None,
        });
        assert_eq!(bytes.len(), 21);
        assert_eq!(bytes[0], msg_type::TIME_SYNC);
        assert_eq!(&bytes[1..9], &1000i64.to_le_bytes());
        assert_eq!(&bytes[9..13], &7i32.to_le_bytes());
        assert_eq!(&bytes[13..], &[0u8; 8]);
    }

    #[test]
    fn time_sync_client_timestamp_presence() {
        let echo = NetMessage::TimeSync {
            t_host: 1000,
            seq: 7,
            t_client: Some(1060),
        };
        assert_eq!(decode_message(&encode_message(&echo)), Some(echo));
        let probe = NetMessage::TimeSync {
            t_host: 1000,
            seq: 8,
            t_client: None,
        };
        assert_eq!(decode_message(&encode_message(&probe)), Some(probe));
        // A short frame without the trailing field is still a probe.
        let mut short = vec![msg_type::TIME_SYNC];
        short.extend_from_slice(&5i64.to_le_bytes());
        short.extend_from_slice(&1i32.to_le_bytes());
        assert_eq!(
            decode_message(&short),
            Some(NetMessage::TimeSync {
                t_host: 5,
                seq: 1,
                t_client: None
            })
        );
    }

    #[test]
    fn join_with_and_without_name() {
        let named = NetMessage::Join {
            name: Some("Thermo".into()),
            protocol_version: 1,
        };
        let bytes = encode_message(&named);
        assert_eq!(&bytes[..3], &[msg_type::JOIN, 6, 0]);
        assert_eq!(decode_message(&bytes), Some(named));
        let anon = NetMessage::Join {
            name: None,
            protocol_version: 1,
        };
        assert_eq!(decode_message(&encode_message(&anon)), Some(anon));
    }

    #[test]
    fn oversized_join_name_is_cut_on_a_char_boundary() {
        let name = "é".repeat(40_000);
        let bytes = encode_message(&NetMessage::Join {
            name: Some(name.clone()),
            protocol_version: 1,
        });
        assert_eq!(u16::from_le_bytes([bytes[1], bytes[2]]), 65_534);
        match decode_message(&bytes) {
            Some(NetMessage::Join { name: Some(cut), .. }) => {
                assert_eq!(cut.len(), 65_534);
                assert!(name.starts_with(&cut));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn oversized_event_payload_is_capped() {
        let bytes = encode_message(&NetMessage::Event {
            kind: 3,
            payload: vec![7; 70_000],
        });
        assert_eq!(u16::from_le_bytes([bytes[5], bytes[6]]), u16::MAX);
        assert_eq!(bytes.len(), 7 + u16::MAX as usize);
    }

    #[test]
    fn event_payload_is_length_prefixed() {
        let msg = NetMessage::Event {
            kind: 3,
            payload: vec![1, 2, 3],
        };
        let bytes = encode_message(&msg);
        assert_eq!(bytes, vec![6, 3, 0, 0, 0, 3, 0, 1, 2, 3]);
        assert_eq!(decode_message(&bytes), Some(msg));
    }

    #[test]
    fn telemetry_and_input_decode() {
        let t = NetMessage::Telemetry {
            piece_id: 33,
            location_id: 12,
            offset_mm: -44.5,
            speed_mmps: 800,
            flags: 0x47,
            ts_client: 123_456,
        };
        assert_eq!(encode_message(&t).len(), 29);
        assert_eq!(decode_message(&encode_message(&t)), Some(t));
        let i = NetMessage::Input {
            throttle: 50,
            lane_change: -1,
            fire: true,
            ts_client: 9,
        };
        assert_eq!(decode_message(&encode_message(&i)), Some(i));
    }

    #[test]
    fn decode_rejects_garbage() {
        assert_eq!(decode_message(&[]), None);
        assert_eq!(decode_message(&[0x42, 1, 2]), None);
        assert_eq!(decode_message(&[msg_type::PING, 1, 2]), None);
        // Event declaring more payload than present.
        assert_eq!(decode_message(&[6, 1, 0, 0, 0, 9, 0, 1]), None);
    }

    #[test]
    fn frames_split_and_need_more() {
        let fa = encode_frame(b"abc").unwrap();
        let fb = encode_frame(b"").unwrap();
        let mut buf = fa.clone();
        buf.extend_from_slice(&fb);
        let (a, n) = decode_frame(&buf).unwrap();
        assert_eq!(a, b"abc");
        let (b, m) = decode_frame(&buf[n..]).unwrap();
        assert!(b.is_empty());
        assert_eq!(n + m, buf.len());
        assert!(matches!(decode_frame(&fa[..2]), Err(FrameDecodeError::NeedMore)));
        assert!(matches!(decode_frame(&fa[..5]), Err(FrameDecodeError::NeedMore)));
    }

    #[test]
    fn oversized_frames_rejected() {
        let big = vec![0u8; MAX_FRAME_LEN as usize + 1];
        assert!(matches!(encode_frame(&big), Err(FrameEncodeError::TooLarge)));
        let header = (MAX_FRAME_LEN + 1).to_le_bytes();
        assert!(matches!(frame_len(header), Err(FrameDecodeError::TooLarge)));
    }
}
