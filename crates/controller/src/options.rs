//! Controller-wide options. Persisted as one key/value row per field so a
//! single corrupt value never loses the rest.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::codec::{decode_signed, ZERO_ADJUSTMENT};
use crate::program::SunTimes;
use crate::sensor::{SensorConfig, SensorKind};
use crate::station::{StationId, MAX_BOARDS, STATIONS_PER_BOARD};

/// Keys changed at runtime through the API. Seeding from the config file
/// never overwrites these once stored.
pub const RUNTIME_KEYS: &[&str] = &["enabled", "rain_delay_stop", "water_level"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterConfig {
    pub station: Option<StationId>,
    /// Encoded signed seconds, applied to the dependent station's start.
    pub on_adjust: u8,
    /// Encoded signed seconds, applied to the dependent station's end.
    pub off_adjust: u8,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            station: None,
            on_adjust: ZERO_ADJUSTMENT,
            off_adjust: ZERO_ADJUSTMENT,
        }
    }
}

impl MasterConfig {
    pub fn on_adjust_secs(&self) -> i64 {
        decode_signed(self.on_adjust)
    }

    pub fn off_adjust_secs(&self) -> i64 {
        decode_signed(self.off_adjust)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    pub enabled: bool,
    pub utc_offset_minutes: i32,
    /// Weather scaling percentage, 0..=250.
    pub water_level: u8,
    pub boards: u8,
    /// Encoded signed seconds between sequential stations.
    pub station_delay: u8,
    pub master1: MasterConfig,
    pub master2: MasterConfig,
    pub sensor1: SensorConfig,
    pub sensor2: SensorConfig,
    /// Hundredths of a volume unit per flow pulse.
    pub flow_pulse_rate: u16,
    pub remote_extension: bool,
    pub auto_refresh: bool,
    pub notify_mask: u16,
    pub sunrise_minute: u16,
    pub sunset_minute: u16,
    /// Local timestamp at which an active rain delay ends.
    pub rain_delay_stop: Option<i64>,
    pub device_key: String,
    pub location: String,
    pub mqtt_topic_prefix: String,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            enabled: true,
            utc_offset_minutes: 0,
            water_level: 100,
            boards: 1,
            station_delay: ZERO_ADJUSTMENT,
            master1: MasterConfig::default(),
            master2: MasterConfig::default(),
            sensor1: SensorConfig::default(),
            sensor2: SensorConfig::default(),
            flow_pulse_rate: 100,
            remote_extension: false,
            auto_refresh: false,
            notify_mask: 0,
            sunrise_minute: 360,
            sunset_minute: 1080,
            rain_delay_stop: None,
            device_key: String::new(),
            location: String::new(),
            mqtt_topic_prefix: "sprinkler".to_string(),
        }
    }
}

impl Options {
    pub fn station_count(&self) -> usize {
        usize::from(self.boards).clamp(1, MAX_BOARDS) * STATIONS_PER_BOARD
    }

    pub fn station_delay_secs(&self) -> i64 {
        decode_signed(self.station_delay)
    }

    pub fn masters(&self) -> [&MasterConfig; 2] {
        [&self.master1, &self.master2]
    }

    pub fn is_master(&self, station: StationId) -> bool {
        self.masters().iter().any(|m| m.station == Some(station))
    }

    pub fn sensors(&self) -> [SensorConfig; 2] {
        [self.sensor1, self.sensor2]
    }

    pub fn flow_sensor_enabled(&self) -> bool {
        self.sensor1.kind == SensorKind::Flow
    }

    pub fn sun(&self) -> SunTimes {
        SunTimes {
            sunrise: self.sunrise_minute,
            sunset: self.sunset_minute,
        }
    }

    // ----------------------------
    // Key/value persistence
    // ----------------------------

    /// Every option as a `(key, json value)` pair.
    pub fn to_pairs(&self) -> Vec<(String, Value)> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map.into_iter().collect(),
            _ => Vec::new(),
        }
    }

    /// Overlay stored pairs onto `base`. A pair that fails to decode (or
    /// names an unknown key) is skipped and the base value kept.
    pub fn from_pairs(base: &Options, pairs: Vec<(String, Value)>) -> Options {
        let mut merged: Map<String, Value> = match serde_json::to_value(base) {
            Ok(Value::Object(map)) => map,
            _ => return base.clone(),
        };
        for (key, value) in pairs {
            if !merged.contains_key(&key) {
                warn!(key = %key, "options: unknown stored key ignored");
                continue;
            }
            let mut candidate = merged.clone();
            candidate.insert(key.clone(), value);
            match serde_json::from_value::<Options>(Value::Object(candidate.clone())) {
                Ok(_) => merged = candidate,
                Err(e) => warn!(key = %key, "options: stored value rejected, keeping prior: {e}"),
            }
        }
        serde_json::from_value(Value::Object(merged)).unwrap_or_else(|_| base.clone())
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults() {
        let o = Options::default();
        assert!(o.enabled);
        assert_eq!(o.station_count(), 8);
        assert_eq!(o.station_delay_secs(), 0);
        assert_eq!(o.master1.on_adjust_secs(), 0);
    }

    #[test]
    fn station_count_is_clamped_to_board_range() {
        let mut o = Options::default();
        o.boards = 0;
        assert_eq!(o.station_count(), 8);
        o.boards = 200;
        assert_eq!(o.station_count(), 200);
    }

    #[test]
    fn is_master_checks_both_slots() {
        let mut o = Options::default();
        o.master2.station = Some(7);
        assert!(o.is_master(7));
        assert!(!o.is_master(0));
    }

    // -- key/value persistence ---------------------------------------------

    #[test]
    fn pairs_round_trip() {
        let mut o = Options::default();
        o.water_level = 42;
        o.rain_delay_stop = Some(1_000);
        o.master1.station = Some(0);
        let back = Options::from_pairs(&Options::default(), o.to_pairs());
        assert_eq!(back, o);
    }

    #[test]
    fn bad_pair_keeps_base_value() {
        let base = Options::default();
        let restored = Options::from_pairs(
            &base,
            vec![
                ("water_level".into(), json!("lots")),
                ("boards".into(), json!(3)),
                ("no_such_option".into(), json!(1)),
            ],
        );
        assert_eq!(restored.water_level, 100);
        assert_eq!(restored.boards, 3);
    }

    #[test]
    fn runtime_keys_are_real_fields() {
        let keys: Vec<String> = Options::default().to_pairs().into_iter().map(|(k, _)| k).collect();
        for k in RUNTIME_KEYS {
            assert!(keys.iter().any(|x| x == k), "missing {k}");
        }
    }
}
