//! Notification events emitted by the controller on state transitions.
//! The control loop drains them each tick and fans them out to the log,
//! the status ring buffer, the run log and MQTT.

use serde::Serialize;

use crate::queue::RunSource;
use crate::station::StationId;

/// Bits of the `notify_mask` option.
pub mod notify {
    pub const PROGRAM_SCHEDULED: u16 = 0x01;
    pub const SENSOR1: u16 = 0x02;
    pub const FLOW_SENSOR: u16 = 0x04;
    pub const WEATHER_UPDATE: u16 = 0x08;
    pub const REBOOT: u16 = 0x10;
    pub const STATION_OFF: u16 = 0x20;
    pub const SENSOR2: u16 = 0x40;
    pub const RAIN_DELAY: u16 = 0x80;
    pub const STATION_ON: u16 = 0x100;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RebootCause {
    /// `:>reboot` program, deferred until idle.
    Program,
    /// `:>reboot_now` program.
    ProgramImmediate,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    StationOn {
        station: StationId,
    },
    StationOff {
        station: StationId,
        source: RunSource,
        start: i64,
        duration: i64,
        flow_volume: Option<f64>,
    },
    ProgramScheduled {
        program: usize,
        name: String,
        manual: bool,
        water_level: u8,
    },
    /// `sensor` is 1 or 2.
    SensorChanged {
        sensor: u8,
        active: bool,
    },
    RainDelayChanged {
        active: bool,
    },
    FlowSummary {
        pulses: u64,
        volume: f64,
    },
    WeatherUpdated {
        water_level: u8,
    },
    Reboot {
        cause: RebootCause,
    },
}

impl Event {
    pub fn notify_bit(&self) -> u16 {
        match self {
            Event::StationOn { .. } => notify::STATION_ON,
            Event::StationOff { .. } => notify::STATION_OFF,
            Event::ProgramScheduled { .. } => notify::PROGRAM_SCHEDULED,
            Event::SensorChanged { sensor: 1, .. } => notify::SENSOR1,
            Event::SensorChanged { .. } => notify::SENSOR2,
            Event::RainDelayChanged { .. } => notify::RAIN_DELAY,
            Event::FlowSummary { .. } => notify::FLOW_SENSOR,
            Event::WeatherUpdated { .. } => notify::WEATHER_UPDATE,
            Event::Reboot { .. } => notify::REBOOT,
        }
    }

    pub fn is_enabled(&self, mask: u16) -> bool {
        mask & self.notify_bit() != 0
    }

    /// One-line description for the status feed.
    pub fn summary(&self) -> String {
        let on_off = |b: bool| if b { "active" } else { "inactive" };
        match self {
            Event::StationOn { station } => format!("station {station} on"),
            Event::StationOff {
                station,
                duration,
                flow_volume,
                ..
            } => match flow_volume {
                Some(v) => format!("station {station} off after {duration}s ({v:.2} flow)"),
                None => format!("station {station} off after {duration}s"),
            },
            Event::ProgramScheduled {
                name,
                manual,
                water_level,
                ..
            } => format!(
                "program '{name}' {} at {water_level}%",
                if *manual { "started manually" } else { "scheduled" }
            ),
            Event::SensorChanged { sensor, active } => format!("sensor{sensor} {}", on_off(*active)),
            Event::RainDelayChanged { active } => format!("rain delay {}", on_off(*active)),
            Event::FlowSummary { pulses, volume } => format!("flow {pulses} pulses, {volume:.2} volume"),
            Event::WeatherUpdated { water_level } => format!("water level set to {water_level}%"),
            Event::Reboot { cause } => format!("reboot ({cause:?})"),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
