//! Synthetic flight generator
//!
//! Deterministic geocentric traffic for demos and integration tests: a ring
//! of aircraft on circular tracks, one frame per aircraft per tick. The same
//! configuration always yields the same datagrams.

use std::f64::consts::TAU;

use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};

use crate::datagram::{
    encode, GeocentricSample, Kinematics, TelemetryRecord, TspiFrame, DATAGRAM_LEN,
    TICKS_PER_SECOND,
};
use crate::producer::TspiProducer;

#[derive(Debug, Clone)]
pub struct FlightConfig {
    /// Number of simulated aircraft.
    pub count: u16,
    /// Frames per aircraft per second.
    pub rate_hz: f64,
    pub speed_min_mps: f64,
    pub speed_max_mps: f64,
    pub day: u16,
}

impl Default for FlightConfig {
    fn default() -> Self {
        Self {
            count: 50,
            rate_hz: 50.0,
            speed_min_mps: 50.0,
            speed_max_mps: 200.0,
            day: 120,
        }
    }
}

pub struct FlightGenerator {
    config: FlightConfig,
    dt: f64,
    frame_index: u64,
}

impl FlightGenerator {
    pub fn new(config: FlightConfig) -> Self {
        let dt = 1.0 / config.rate_hz;
        Self {
            config,
            dt,
            frame_index: 0,
        }
    }

    fn sensor_id(&self, aircraft: u16) -> u16 {
        10_000 + aircraft
    }

    fn frame_for(&self, aircraft: u16, time_ticks: u32) -> TspiFrame {
        let count = self.config.count.max(1);
        let angle = (aircraft as f64 / count as f64) * TAU + self.frame_index as f64 * 0.01;
        let spread = (self.config.speed_max_mps - self.config.speed_min_mps)
            * (aircraft as f64 / (count - 1).max(1) as f64);
        let speed = self.config.speed_min_mps + spread;

        let vx = speed * angle.cos();
        let vy = speed * angle.sin();
        TspiFrame {
            sensor_id: self.sensor_id(aircraft),
            day: self.config.day,
            time_ticks,
            status: 0xFF,
            status_flags: 0x01,
            kinematics: Kinematics::Geocentric(GeocentricSample {
                x_m: vx * 10.0,
                y_m: vy * 10.0,
                z_m: 1000.0,
                vx_mps: vx,
                vy_mps: vy,
                vz_mps: 5.0,
                ax_mps2: 0.1 * angle.cos(),
                ay_mps2: 0.1 * angle.sin(),
                az_mps2: 0.0,
            }),
        }
    }

    /// The next `ticks` ticks of traffic as raw datagrams with their range
    /// time, `count` datagrams per tick.
    pub fn generate(&mut self, ticks: u64) -> Result<Vec<([u8; DATAGRAM_LEN], f64)>> {
        let mut out = Vec::with_capacity(ticks as usize * self.config.count as usize);
        for _ in 0..ticks {
            let time_s = self.frame_index as f64 * self.dt;
            let time_ticks = (time_s * TICKS_PER_SECOND as f64) as u32;
            for aircraft in 0..self.config.count {
                let frame = self.frame_for(aircraft, time_ticks);
                out.push((encode(&frame)?, time_s));
            }
            self.frame_index += 1;
        }
        Ok(out)
    }

    /// Push `duration_s` seconds of traffic through a producer, stamping
    /// receive times against `base_epoch` so archived data is queryable at
    /// known timestamps.
    pub fn stream_to_producer(
        &mut self,
        producer: &TspiProducer,
        duration_s: f64,
        base_epoch: DateTime<Utc>,
    ) -> Result<Vec<TelemetryRecord>> {
        let ticks = (duration_s * self.config.rate_hz) as u64;
        let mut records = Vec::new();
        for (datagram, time_s) in self.generate(ticks)? {
            let frame = crate::datagram::decode(&datagram)?;
            let recv = base_epoch + chrono::Duration::milliseconds((time_s * 1_000.0) as i64);
            let record = TelemetryRecord::received(frame, recv);
            producer.publish_record(&record)?;
            records.push(record);
        }
        Ok(records)
    }
}

/// Default epoch the demo traffic is anchored to.
pub fn default_base_epoch() -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000, 0).single().unwrap_or_else(Utc::now)
}
