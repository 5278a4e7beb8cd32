//! Binary TSPI datagram codec
//!
//! Decodes the fixed 37-byte sensor frames into structured records and
//! re-encodes records whose values fit the original fixed-point ranges.
//! Wire format (big-endian throughout):
//!
//! ```text
//! ┌──────┬─────────┬───────────┬───────┬────────────┬────────┬─────────┬───────────┐
//! │ type │ version │ sensor_id │  day  │ time_ticks │ status │  flags  │  payload  │
//! │ (1B) │  (1B)   │   (2B)    │ (2B)  │    (4B)    │  (1B)  │  (2B)   │   (24B)   │
//! └──────┴─────────┴───────────┴───────┴────────────┴────────┴─────────┴───────────┘
//! ```
//!
//! Geocentric payload: three i32 positions, three i16 velocities, three i16
//! accelerations, all scaled by 100. Spherical payload: i32 range (/100 m),
//! u32 azimuth and elevation (/1e6 deg), then six i16 rates/accelerations
//! (/100). Scaling is exact integer division so decode→encode reproduces the
//! original bytes bit-for-bit.
//!
//! The codec performs no I/O and no schema validation; that is applied to the
//! serialized envelope downstream.

use bytes::{Buf, BufMut};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Total datagram size in bytes.
pub const DATAGRAM_LEN: usize = 37;
/// Fixed header size in bytes.
pub const HEADER_LEN: usize = 13;
/// Kinematics payload size in bytes.
pub const PAYLOAD_LEN: usize = DATAGRAM_LEN - HEADER_LEN;
/// The only supported datagram version.
pub const DATAGRAM_VERSION: u8 = 4;

/// Ticks per second in the frame time field.
pub const TICKS_PER_SECOND: u32 = 10_000;

const TYPE_GEOCENTRIC: u8 = 0xC1;
const TYPE_SPHERICAL: u8 = 0xC2;

/// Decode failures; each flavor is an unrecoverable malformed frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("datagram must be exactly {DATAGRAM_LEN} bytes, got {0}")]
    Length(usize),
    #[error("unsupported message type byte: {0:#04x}")]
    UnknownType(u8),
    #[error("unsupported datagram version: {0}")]
    Version(u8),
}

/// Encode failures: a scaled value does not fit its fixed-point field.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EncodeError {
    #[error("{field} = {value} is outside the fixed-point range")]
    OutOfRange { field: &'static str, value: f64 },
}

/// TSPI frame coordinate system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Geocentric,
    Spherical,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Geocentric => "geocentric",
            RecordKind::Spherical => "spherical",
        }
    }

    fn type_byte(&self) -> u8 {
        match self {
            RecordKind::Geocentric => TYPE_GEOCENTRIC,
            RecordKind::Spherical => TYPE_SPHERICAL,
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Component validity bits, packed as `status | (status_flags << 8)`.
///
/// Bit order: position x/y/z, velocity x/y/z, acceleration x/y/z.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidityBits(pub u16);

impl ValidityBits {
    pub const LABELS: [&'static str; 9] = [
        "position_x_valid",
        "position_y_valid",
        "position_z_valid",
        "velocity_x_valid",
        "velocity_y_valid",
        "velocity_z_valid",
        "acceleration_x_valid",
        "acceleration_y_valid",
        "acceleration_z_valid",
    ];

    pub fn from_words(status: u8, status_flags: u16) -> Self {
        Self(status as u16 | (status_flags << 8))
    }

    pub fn is_set(&self, index: usize) -> bool {
        index < Self::LABELS.len() && self.0 & (1 << index) != 0
    }
}

/// Geocentric kinematics in engineering units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeocentricSample {
    pub x_m: f64,
    pub y_m: f64,
    pub z_m: f64,
    pub vx_mps: f64,
    pub vy_mps: f64,
    pub vz_mps: f64,
    pub ax_mps2: f64,
    pub ay_mps2: f64,
    pub az_mps2: f64,
}

/// Spherical kinematics in engineering units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SphericalSample {
    pub range_m: f64,
    pub azimuth_deg: f64,
    pub elevation_deg: f64,
    pub azimuth_rate_dps: f64,
    pub elevation_rate_dps: f64,
    pub range_rate_mps: f64,
    pub azimuth_accel_dps2: f64,
    pub elevation_accel_dps2: f64,
    pub range_accel_mps2: f64,
}

/// Kinematics payload, discriminated by the frame type byte.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Kinematics {
    Geocentric(GeocentricSample),
    Spherical(SphericalSample),
}

/// A decoded TSPI wire frame. Carries no receive metadata; see
/// [`TelemetryRecord`] for the ingestion envelope. Immutable once decoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TspiFrame {
    pub sensor_id: u16,
    pub day: u16,
    pub time_ticks: u32,
    pub status: u8,
    pub status_flags: u16,
    pub kinematics: Kinematics,
}

impl TspiFrame {
    /// Coordinate system, determined by the kinematics payload.
    pub fn kind(&self) -> RecordKind {
        match self.kinematics {
            Kinematics::Geocentric(_) => RecordKind::Geocentric,
            Kinematics::Spherical(_) => RecordKind::Spherical,
        }
    }

    /// Fractional seconds since midnight UTC.
    pub fn time_s(&self) -> f64 {
        self.time_ticks as f64 / TICKS_PER_SECOND as f64
    }

    /// Combined component validity bits.
    pub fn validity(&self) -> ValidityBits {
        ValidityBits::from_words(self.status, self.status_flags)
    }

    /// Idempotency key for broker dedup and archive upserts.
    pub fn dedup_id(&self) -> DedupId {
        DedupId {
            sensor_id: self.sensor_id,
            day: self.day,
            second: self.time_ticks / TICKS_PER_SECOND,
        }
    }
}

/// Deterministic identifier `(sensor_id, day, floor(time_s))`.
///
/// Two frames landing in the same floor-second for the same sensor/day are
/// the same logical event: the second write is a no-op, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DedupId {
    pub sensor_id: u16,
    pub day: u16,
    pub second: u32,
}

impl fmt::Display for DedupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.sensor_id, self.day, self.second)
    }
}

/// Decode a fixed-size TSPI datagram.
pub fn decode(datagram: &[u8]) -> Result<TspiFrame, DecodeError> {
    if datagram.len() != DATAGRAM_LEN {
        return Err(DecodeError::Length(datagram.len()));
    }

    let mut buf = datagram;
    let type_byte = buf.get_u8();
    let version = buf.get_u8();
    let sensor_id = buf.get_u16();
    let day = buf.get_u16();
    let time_ticks = buf.get_u32();
    let status = buf.get_u8();
    let status_flags = buf.get_u16();

    let kind = match type_byte {
        TYPE_GEOCENTRIC => RecordKind::Geocentric,
        TYPE_SPHERICAL => RecordKind::Spherical,
        other => return Err(DecodeError::UnknownType(other)),
    };
    if version != DATAGRAM_VERSION {
        return Err(DecodeError::Version(version));
    }

    let kinematics = match kind {
        RecordKind::Geocentric => Kinematics::Geocentric(GeocentricSample {
            x_m: buf.get_i32() as f64 / 100.0,
            y_m: buf.get_i32() as f64 / 100.0,
            z_m: buf.get_i32() as f64 / 100.0,
            vx_mps: buf.get_i16() as f64 / 100.0,
            vy_mps: buf.get_i16() as f64 / 100.0,
            vz_mps: buf.get_i16() as f64 / 100.0,
            ax_mps2: buf.get_i16() as f64 / 100.0,
            ay_mps2: buf.get_i16() as f64 / 100.0,
            az_mps2: buf.get_i16() as f64 / 100.0,
        }),
        RecordKind::Spherical => Kinematics::Spherical(SphericalSample {
            range_m: buf.get_i32() as f64 / 100.0,
            azimuth_deg: buf.get_u32() as f64 / 1_000_000.0,
            elevation_deg: buf.get_u32() as f64 / 1_000_000.0,
            azimuth_rate_dps: buf.get_i16() as f64 / 100.0,
            elevation_rate_dps: buf.get_i16() as f64 / 100.0,
            range_rate_mps: buf.get_i16() as f64 / 100.0,
            azimuth_accel_dps2: buf.get_i16() as f64 / 100.0,
            elevation_accel_dps2: buf.get_i16() as f64 / 100.0,
            range_accel_mps2: buf.get_i16() as f64 / 100.0,
        }),
    };

    Ok(TspiFrame {
        sensor_id,
        day,
        time_ticks,
        status,
        status_flags,
        kinematics,
    })
}

fn scaled_i32(field: &'static str, value: f64, scale: f64) -> Result<i32, EncodeError> {
    let raw = (value * scale).round();
    if raw < i32::MIN as f64 || raw > i32::MAX as f64 {
        return Err(EncodeError::OutOfRange { field, value });
    }
    Ok(raw as i32)
}

fn scaled_u32(field: &'static str, value: f64, scale: f64) -> Result<u32, EncodeError> {
    let raw = (value * scale).round();
    if raw < 0.0 || raw > u32::MAX as f64 {
        return Err(EncodeError::OutOfRange { field, value });
    }
    Ok(raw as u32)
}

fn scaled_i16(field: &'static str, value: f64, scale: f64) -> Result<i16, EncodeError> {
    let raw = (value * scale).round();
    if raw < i16::MIN as f64 || raw > i16::MAX as f64 {
        return Err(EncodeError::OutOfRange { field, value });
    }
    Ok(raw as i16)
}

/// Encode a frame back into the 37-byte wire form.
///
/// The inverse of [`decode`] for any frame whose scaled values fit the
/// original fixed-point ranges.
pub fn encode(frame: &TspiFrame) -> Result<[u8; DATAGRAM_LEN], EncodeError> {
    let mut out = [0u8; DATAGRAM_LEN];
    {
        let mut buf = &mut out[..];
        buf.put_u8(frame.kind().type_byte());
        buf.put_u8(DATAGRAM_VERSION);
        buf.put_u16(frame.sensor_id);
        buf.put_u16(frame.day);
        buf.put_u32(frame.time_ticks);
        buf.put_u8(frame.status);
        buf.put_u16(frame.status_flags);

        match &frame.kinematics {
            Kinematics::Geocentric(k) => {
                buf.put_i32(scaled_i32("x_m", k.x_m, 100.0)?);
                buf.put_i32(scaled_i32("y_m", k.y_m, 100.0)?);
                buf.put_i32(scaled_i32("z_m", k.z_m, 100.0)?);
                buf.put_i16(scaled_i16("vx_mps", k.vx_mps, 100.0)?);
                buf.put_i16(scaled_i16("vy_mps", k.vy_mps, 100.0)?);
                buf.put_i16(scaled_i16("vz_mps", k.vz_mps, 100.0)?);
                buf.put_i16(scaled_i16("ax_mps2", k.ax_mps2, 100.0)?);
                buf.put_i16(scaled_i16("ay_mps2", k.ay_mps2, 100.0)?);
                buf.put_i16(scaled_i16("az_mps2", k.az_mps2, 100.0)?);
            }
            Kinematics::Spherical(k) => {
                buf.put_i32(scaled_i32("range_m", k.range_m, 100.0)?);
                buf.put_u32(scaled_u32("azimuth_deg", k.azimuth_deg, 1_000_000.0)?);
                buf.put_u32(scaled_u32("elevation_deg", k.elevation_deg, 1_000_000.0)?);
                buf.put_i16(scaled_i16("azimuth_rate_dps", k.azimuth_rate_dps, 100.0)?);
                buf.put_i16(scaled_i16("elevation_rate_dps", k.elevation_rate_dps, 100.0)?);
                buf.put_i16(scaled_i16("range_rate_mps", k.range_rate_mps, 100.0)?);
                buf.put_i16(scaled_i16("azimuth_accel_dps2", k.azimuth_accel_dps2, 100.0)?);
                buf.put_i16(scaled_i16("elevation_accel_dps2", k.elevation_accel_dps2, 100.0)?);
                buf.put_i16(scaled_i16("range_accel_mps2", k.range_accel_mps2, 100.0)?);
            }
        }
    }
    Ok(out)
}

/// A frame annotated with receive time at ingestion.
///
/// `recv_*` fields are always populated by the ingesting process, never by
/// replay; replay preserves the original values read back from storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub frame: TspiFrame,
    pub recv_epoch_ms: i64,
    pub recv_iso: String,
}

impl TelemetryRecord {
    /// Annotate a decoded frame with the ingestion receive time.
    pub fn received(frame: TspiFrame, recv_time: DateTime<Utc>) -> Self {
        Self {
            frame,
            recv_epoch_ms: recv_time.timestamp_millis(),
            recv_iso: recv_time.to_rfc3339_opts(SecondsFormat::Micros, true),
        }
    }

    pub fn dedup_id(&self) -> DedupId {
        self.frame.dedup_id()
    }
}
