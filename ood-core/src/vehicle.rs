//! Vehicle wire protocol: length-prefixed command/telemetry frames.
//!
//! Frame layout: `[len: u8][msg_id: u8][payload: len - 1 bytes]`, all multi-byte
//! fields little-endian. `len` counts the id byte and the payload, not itself.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

/// Message ids, controller-to-vehicle (C2V) and vehicle-to-controller (V2C).
pub mod msg_id {
    pub const C2V_DISCONNECT: u8 = 0x0D;
    pub const C2V_PING: u8 = 0x16;
    pub const V2C_PING_RESP: u8 = 0x17;
    pub const C2V_VERSION_REQ: u8 = 0x18;
    pub const V2C_VERSION_RESP: u8 = 0x19;
    pub const C2V_BATTERY_REQ: u8 = 0x1A;
    pub const V2C_BATTERY_RESP: u8 = 0x1B;
    pub const C2V_SET_LIGHTS: u8 = 0x1D;
    pub const C2V_SET_SPEED: u8 = 0x24;
    pub const C2V_CHANGE_LANE: u8 = 0x25;
    pub const C2V_CANCEL_LANE: u8 = 0x26;
    pub const V2C_LOC_POS: u8 = 0x27;
    pub const V2C_LOC_TRANS: u8 = 0x29;
    pub const V2C_DELOCALIZED: u8 = 0x2B;
    pub const C2V_SET_OFFSET: u8 = 0x2C;
    pub const V2C_OFFSET_UPDATE: u8 = 0x2D;
    pub const C2V_TURN: u8 = 0x32;
    pub const C2V_LIGHTS_PATTERN: u8 = 0x33;
    pub const V2C_CAR_STATUS: u8 = 0x3F;
    pub const C2V_SET_CONFIG: u8 = 0x45;
    pub const C2V_SDK_MODE: u8 = 0x90;
}

/// SDK mode flag: the controller takes over localization.
pub const SDK_FLAG_OVERRIDE_LOCALIZATION: u8 = 0x01;

/// Number of channel slots carried by a lights-pattern frame.
pub const LIGHT_CHANNEL_SLOTS: usize = 3;

/// Battery readings in this range are millivolts; anything else is a percentage.
const BATTERY_MV_RANGE: std::ops::RangeInclusive<u16> = 2500..=5000;
const BATTERY_MV_EMPTY: i32 = 3300;
const BATTERY_MV_FULL: i32 = 4200;

/// One channel of a lights-pattern command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LightChannel {
    pub channel: u8,
    pub effect: u8,
    pub start: u8,
    pub end: u8,
    pub cycles_per_10_sec: u16,
}

/// Controller-to-vehicle command.
#[derive(Debug, Clone, PartialEq)]
pub enum VehicleCommand {
    SdkMode { on: bool, flags: u8 },
    SetSpeed { speed_mm_per_sec: i16, accel_mm_per_sec2: i16, respect_limit: u8 },
    SetOffsetFromCenter { offset_mm: f32 },
    ChangeLane {
        h_speed_mm_per_sec: i16,
        h_accel_mm_per_sec2: i16,
        offset_from_center_mm: f32,
        hop_intent: u8,
        tag: u8,
    },
    SetLights { mask: u8 },
    LightsPattern { channels: Vec<LightChannel> },
    Turn { kind: u8, trigger: u8 },
    SetConfig { parse_mask: u8, track_material: u8 },
    Ping,
    BatteryRequest,
    VersionRequest,
    Disconnect,
    CancelLane,
}

fn saturate_i16(v: i32) -> i16 {
    v.clamp(i16::MIN as i32, i16::MAX as i32) as i16
}

impl VehicleCommand {
    /// Speed command; values outside the 16-bit range saturate.
    pub fn set_speed(speed_mm_per_sec: i32, accel_mm_per_sec2: i32, respect_limit: bool) -> Self {
        VehicleCommand::SetSpeed {
            speed_mm_per_sec: saturate_i16(speed_mm_per_sec),
            accel_mm_per_sec2: saturate_i16(accel_mm_per_sec2),
            respect_limit: respect_limit as u8,
        }
    }

    /// Full stop, as issued when a racer finishes.
    pub fn stop() -> Self {
        Self::set_speed(0, 30000, true)
    }

    pub fn sdk_mode(on: bool) -> Self {
        VehicleCommand::SdkMode {
            on,
            flags: SDK_FLAG_OVERRIDE_LOCALIZATION,
        }
    }

    pub fn change_lane(h_speed: i32, h_accel: i32, offset_from_center_mm: f32, tag: u8) -> Self {
        VehicleCommand::ChangeLane {
            h_speed_mm_per_sec: saturate_i16(h_speed),
            h_accel_mm_per_sec2: saturate_i16(h_accel),
            offset_from_center_mm,
            hop_intent: 0,
            tag,
        }
    }

    fn id(&self) -> u8 {
        use msg_id::*;
        match self {
            VehicleCommand::SdkMode { .. } => C2V_SDK_MODE,
            VehicleCommand::SetSpeed { .. } => C2V_SET_SPEED,
            VehicleCommand::SetOffsetFromCenter { .. } => C2V_SET_OFFSET,
            VehicleCommand::ChangeLane { .. } => C2V_CHANGE_LANE,
            VehicleCommand::SetLights { .. } => C2V_SET_LIGHTS,
            VehicleCommand::LightsPattern { .. } => C2V_LIGHTS_PATTERN,
            VehicleCommand::Turn { .. } => C2V_TURN,
            VehicleCommand::SetConfig { .. } => C2V_SET_CONFIG,
            VehicleCommand::Ping => C2V_PING,
            VehicleCommand::BatteryRequest => C2V_BATTERY_REQ,
            VehicleCommand::VersionRequest => C2V_VERSION_REQ,
            VehicleCommand::Disconnect => C2V_DISCONNECT,
            VehicleCommand::CancelLane => C2V_CANCEL_LANE,
        }
    }

    /// Encode into one frame. Always returns `1 + len` bytes.
    pub fn encode(&self) -> Vec<u8> {
        // Vec writes cannot fail.
        let mut body = Vec::with_capacity(20);
        body.push(self.id());
        match self {
            VehicleCommand::SdkMode { on, flags } => {
                body.push(*on as u8);
                body.push(*flags);
            }
            VehicleCommand::SetSpeed {
                speed_mm_per_sec,
                accel_mm_per_sec2,
                respect_limit,
            } => {
                let _ = body.write_i16::<LittleEndian>(*speed_mm_per_sec);
                let _ = body.write_i16::<LittleEndian>(*accel_mm_per_sec2);
                body.push(*respect_limit);
            }
            VehicleCommand::SetOffsetFromCenter { offset_mm } => {
                let _ = body.write_f32::<LittleEndian>(*offset_mm);
            }
            VehicleCommand::ChangeLane {
                h_speed_mm_per_sec,
                h_accel_mm_per_sec2,
                offset_from_center_mm,
                hop_intent,
                tag,
            } => {
                let _ = body.write_i16::<LittleEndian>(*h_speed_mm_per_sec);
                let _ = body.write_i16::<LittleEndian>(*h_accel_mm_per_sec2);
                let _ = body.write_f32::<LittleEndian>(*offset_from_center_mm);
                body.push(*hop_intent);
                body.push(*tag);
            }
            VehicleCommand::SetLights { mask } => body.push(*mask),
            VehicleCommand::LightsPattern { channels } => {
                // Fixed size: count byte plus three channel slots, unused slots zeroed.
                let count = channels.len().min(LIGHT_CHANNEL_SLOTS);
                body.push(count as u8);
                for i in 0..LIGHT_CHANNEL_SLOTS {
                    let c = channels.get(i).copied().unwrap_or_default();
                    body.extend_from_slice(&[c.channel, c.effect, c.start, c.end]);
                    let _ = body.write_u16::<LittleEndian>(c.cycles_per_10_sec);
                }
            }
            VehicleCommand::Turn { kind, trigger } => {
                body.push(*kind);
                body.push(*trigger);
            }
            VehicleCommand::SetConfig {
                parse_mask,
                track_material,
            } => {
                body.push(*parse_mask);
                body.push(*track_material);
            }
            VehicleCommand::Ping
            | VehicleCommand::BatteryRequest
            | VehicleCommand::VersionRequest
            | VehicleCommand::Disconnect
            | VehicleCommand::CancelLane => {}
        }
        let mut out = Vec::with_capacity(1 + body.len());
        out.push(body.len() as u8);
        out.extend_from_slice(&body);
        out
    }

    /// Read back an encoded command. Returns `None` for anything that is not a
    /// well-formed C2V frame.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let (id, payload) = split_frame(bytes)?;
        let mut c = Cursor::new(payload);
        use msg_id::*;
        let cmd = match id {
            C2V_SDK_MODE => VehicleCommand::SdkMode {
                on: c.read_u8().ok()? != 0,
                flags: c.read_u8().ok()?,
            },
            C2V_SET_SPEED => VehicleCommand::SetSpeed {
                speed_mm_per_sec: c.read_i16::<LittleEndian>().ok()?,
                accel_mm_per_sec2: c.read_i16::<LittleEndian>().ok()?,
                respect_limit: c.read_u8().ok()?,
            },
            C2V_SET_OFFSET => VehicleCommand::SetOffsetFromCenter {
                offset_mm: c.read_f32::<LittleEndian>().ok()?,
            },
            C2V_CHANGE_LANE => VehicleCommand::ChangeLane {
                h_speed_mm_per_sec: c.read_i16::<LittleEndian>().ok()?,
                h_accel_mm_per_sec2: c.read_i16::<LittleEndian>().ok()?,
                offset_from_center_mm: c.read_f32::<LittleEndian>().ok()?,
                hop_intent: c.read_u8().ok()?,
                tag: c.read_u8().ok()?,
            },
            C2V_SET_LIGHTS => VehicleCommand::SetLights {
                mask: c.read_u8().ok()?,
            },
            C2V_LIGHTS_PATTERN => {
                let count = (c.read_u8().ok()? as usize).min(LIGHT_CHANNEL_SLOTS);
                let mut channels = Vec::with_capacity(count);
                for _ in 0..count {
                    channels.push(LightChannel {
                        channel: c.read_u8().ok()?,
                        effect: c.read_u8().ok()?,
                        start: c.read_u8().ok()?,
                        end: c.read_u8().ok()?,
                        cycles_per_10_sec: c.read_u16::<LittleEndian>().ok()?,
                    });
                }
                VehicleCommand::LightsPattern { channels }
            }
            C2V_TURN => VehicleCommand::Turn {
                kind: c.read_u8().ok()?,
                trigger: c.read_u8().ok()?,
            },
            C2V_SET_CONFIG => VehicleCommand::SetConfig {
                parse_mask: c.read_u8().ok()?,
                track_material: c.read_u8().ok()?,
            },
            C2V_PING => VehicleCommand::Ping,
            C2V_BATTERY_REQ => VehicleCommand::BatteryRequest,
            C2V_VERSION_REQ => VehicleCommand::VersionRequest,
            C2V_DISCONNECT => VehicleCommand::Disconnect,
            C2V_CANCEL_LANE => VehicleCommand::CancelLane,
            _ => return None,
        };
        Some(cmd)
    }
}

/// Battery report. Keeps the raw value next to the derived percentage since
/// firmware variants disagree on the unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatteryLevel {
    pub raw: u16,
    pub percent: u8,
}

impl BatteryLevel {
    pub fn from_raw(raw: u16) -> Self {
        let percent = if BATTERY_MV_RANGE.contains(&raw) {
            let span = BATTERY_MV_FULL - BATTERY_MV_EMPTY;
            ((raw as i32 - BATTERY_MV_EMPTY).clamp(0, span) * 100 / span) as u8
        } else {
            (raw & 0xFF).min(100) as u8
        };
        Self { raw, percent }
    }
}

/// Localization position update. Fields after `speed_mm_per_sec` are only
/// present on richer firmware.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionUpdate {
    pub location_id: u8,
    pub road_piece_id: u8,
    pub offset_from_center_mm: f32,
    pub speed_mm_per_sec: u16,
    pub parsing_flags: Option<u8>,
    pub last_recv_lane_change_id: Option<u8>,
    pub last_exec_lane_change_id: Option<u8>,
    pub last_desired_h_speed_mm_per_sec: Option<u16>,
    pub last_desired_speed_mm_per_sec: Option<u16>,
}

impl PositionUpdate {
    /// Reverse-parsing bit of `parsing_flags`, when reported.
    pub fn reverse_parsing(&self) -> Option<bool> {
        self.parsing_flags.map(|f| f & 0x40 != 0)
    }
}

/// Road piece transition update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransitionUpdate {
    pub road_piece_idx: i8,
    pub road_piece_idx_prev: i8,
    pub offset_from_center_mm: Option<f32>,
    pub last_recv_lane_change_id: Option<u8>,
    pub last_exec_lane_change_id: Option<u8>,
    pub last_desired_h_speed_mm_per_sec: Option<u16>,
    pub ave_follow_line_drift_pixels: Option<i8>,
    pub had_lane_change_activity: Option<u8>,
    pub uphill_counter: Option<u8>,
    pub downhill_counter: Option<u8>,
    pub left_wheel_dist_cm: Option<u8>,
    pub right_wheel_dist_cm: Option<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CarStatus {
    pub on_track: bool,
    pub on_charger: bool,
    pub low_battery: bool,
    pub charged_battery: bool,
}

/// Vehicle-to-controller message.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum VehicleMessage {
    PingResponse,
    Version(u16),
    BatteryLevel(BatteryLevel),
    PositionUpdate(PositionUpdate),
    TransitionUpdate(TransitionUpdate),
    Delocalized,
    OffsetUpdate { offset_from_center_mm: f32, lane_change_id: u8 },
    CarStatus(CarStatus),
}

/// Split a frame into (msg_id, payload). Bytes past the declared length are ignored.
fn split_frame(bytes: &[u8]) -> Option<(u8, &[u8])> {
    if bytes.len() < 2 {
        return None;
    }
    let len = bytes[0] as usize;
    if len == 0 || len + 1 > bytes.len() {
        return None;
    }
    Some((bytes[1], &bytes[2..1 + len]))
}

/// Decode one inbound notification frame. Never fails loudly: short, truncated
/// or unknown frames yield `None` and should simply be dropped by the caller.
pub fn decode(bytes: &[u8]) -> Option<VehicleMessage> {
    let (id, payload) = split_frame(bytes)?;
    let mut c = Cursor::new(payload);
    use msg_id::*;
    match id {
        V2C_PING_RESP => Some(VehicleMessage::PingResponse),
        V2C_VERSION_RESP => Some(VehicleMessage::Version(c.read_u16::<LittleEndian>().ok()?)),
        V2C_BATTERY_RESP => {
            let raw = c.read_u16::<LittleEndian>().ok()?;
            Some(VehicleMessage::BatteryLevel(BatteryLevel::from_raw(raw)))
        }
        V2C_LOC_POS => {
            let location_id = c.read_u8().ok()?;
            let road_piece_id = c.read_u8().ok()?;
            let offset_from_center_mm = c.read_f32::<LittleEndian>().ok()?;
            let speed_mm_per_sec = c.read_u16::<LittleEndian>().ok()?;
            Some(VehicleMessage::PositionUpdate(PositionUpdate {
                location_id,
                road_piece_id,
                offset_from_center_mm,
                speed_mm_per_sec,
                parsing_flags: c.read_u8().ok(),
                last_recv_lane_change_id: c.read_u8().ok(),
                last_exec_lane_change_id: c.read_u8().ok(),
                last_desired_h_speed_mm_per_sec: c.read_u16::<LittleEndian>().ok(),
                last_desired_speed_mm_per_sec: c.read_u16::<LittleEndian>().ok(),
            }))
        }
        V2C_LOC_TRANS => {
            let road_piece_idx = c.read_i8().ok()?;
            let road_piece_idx_prev = c.read_i8().ok()?;
            Some(VehicleMessage::TransitionUpdate(TransitionUpdate {
                road_piece_idx,
                road_piece_idx_prev,
                offset_from_center_mm: c.read_f32::<LittleEndian>().ok(),
                last_recv_lane_change_id: c.read_u8().ok(),
                last_exec_lane_change_id: c.read_u8().ok(),
                last_desired_h_speed_mm_per_sec: c.read_u16::<LittleEndian>().ok(),
                ave_follow_line_drift_pixels: c.read_i8().ok(),
                had_lane_change_activity: c.read_u8().ok(),
                uphill_counter: c.read_u8().ok(),
                downhill_counter: c.read_u8().ok(),
                left_wheel_dist_cm: c.read_u8().ok(),
                right_wheel_dist_cm: c.read_u8().ok(),
            }))
        }
        V2C_DELOCALIZED => Some(VehicleMessage::Delocalized),
        V2C_OFFSET_UPDATE => Some(VehicleMessage::OffsetUpdate {
            offset_from_center_mm: c.read_f32::<LittleEndian>().ok()?,
            lane_change_id: c.read_u8().ok()?,
        }),
        V2C_CAR_STATUS => Some(VehicleMessage::CarStatus(CarStatus {
            on_track: c.read_u8().ok()? != 0,
            on_charger: c.read_u8().ok()? != 0,
            low_battery: c.read_u8().ok()? != 0,
            charged_battery: c.read_u8().ok()? != 0,
        })),
        _ => None,
    }
}
