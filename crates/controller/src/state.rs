use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::controller::ControllerSnapshot;
use crate::events::Event;

/// Activity entries kept for the status page.
const ACTIVITY_LEN: usize = 200;

pub type SharedState = Arc<RwLock<SystemState>>;

/// What the web API can see. The control loop is the only writer of
/// `controller`; the MQTT task owns `mqtt_connected`.
pub struct SystemState {
    pub started_at: Instant,
    pub mqtt_connected: bool,
    pub controller: ControllerSnapshot,
    pub activity: VecDeque<ActivityEntry>,
}

#[derive(Clone, Serialize)]
pub struct ActivityEntry {
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
    pub kind: ActivityKind,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityKind {
    Station,
    Program,
    Sensor,
    Weather,
    Error,
    System,
}

impl From<&Event> for ActivityKind {
    fn from(event: &Event) -> Self {
        match event {
            Event::StationOn { .. } | Event::StationOff { .. } => ActivityKind::Station,
            Event::ProgramScheduled { .. } => ActivityKind::Program,
            Event::SensorChanged { .. } | Event::RainDelayChanged { .. } | Event::FlowSummary { .. } => {
                ActivityKind::Sensor
            }
            Event::WeatherUpdated { .. } => ActivityKind::Weather,
            Event::Reboot { .. } => ActivityKind::System,
        }
    }
}

/// Body of `GET /api/status`.
#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub mqtt_connected: bool,
    #[serde(flatten)]
    pub controller: ControllerSnapshot,
    /// Newest first.
    pub activity: Vec<ActivityEntry>,
}

// ---------------------------------------------------------------------------
// Activity log
// ---------------------------------------------------------------------------

impl SystemState {
    pub fn new(controller: ControllerSnapshot) -> Self {
        Self {
            started_at: Instant::now(),
            mqtt_connected: false,
            controller,
            activity: VecDeque::with_capacity(ACTIVITY_LEN),
        }
    }

    pub fn record_event(&mut self, event: &Event) {
        self.push(ActivityKind::from(event), event.summary());
    }

    pub fn record_error(&mut self, detail: String) {
        self.push(ActivityKind::Error, detail);
    }

    pub fn record_system(&mut self, detail: String) {
        self.push(ActivityKind::System, detail);
    }

    pub fn to_status(&self) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            mqtt_connected: self.mqtt_connected,
            controller: self.controller.clone(),
            activity: self.activity.iter().rev().cloned().collect(),
        }
    }

    fn push(&mut self, kind: ActivityKind, detail: String) {
        while self.activity.len() >= ACTIVITY_LEN {
            self.activity.pop_front();
        }
        self.activity.push_back(ActivityEntry {
            at: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn activity_log_keeps_newest_entries() {
        let mut st = SystemState::new(ControllerSnapshot::default());
        for i in 0..ACTIVITY_LEN + 5 {
            st.record_system(format!("e{i}"));
        }
        assert_eq!(st.activity.len(), ACTIVITY_LEN);
        assert_eq!(st.activity.front().unwrap().detail, "e5");

        let status = st.to_status();
        assert_eq!(status.activity[0].detail, format!("e{}", ACTIVITY_LEN + 4));
    }

    #[test]
    fn controller_events_are_classified() {
        let mut st = SystemState::new(ControllerSnapshot::default());
        st.record_event(&Event::StationOn { station: 3 });
        st.record_event(&Event::RainDelayChanged { active: true });
        st.record_error("boom".into());

        let kinds: Vec<ActivityKind> = st.activity.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![ActivityKind::Station, ActivityKind::Sensor, ActivityKind::Error]);
        assert_eq!(st.activity[0].detail, "station 3 on");
    }

    #[test]
    fn status_flattens_controller_snapshot() {
        let snapshot = ControllerSnapshot {
            water_level: 80,
            program_busy: true,
            ..ControllerSnapshot::default()
        };
        let st = SystemState::new(snapshot);
        let v = serde_json::to_value(st.to_status()).unwrap();
        assert_eq!(v["water_level"], 80);
        assert_eq!(v["program_busy"], true);
        assert_eq!(v["mqtt_connected"], false);
        assert!(v["activity"].as_array().unwrap().is_empty());
    }
}
