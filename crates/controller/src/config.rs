//! TOML config file loading, validation, and database seeding for options,
//! stations and programs.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;

use crate::codec::encode_signed;
use crate::db::Db;
use crate::options::{MasterConfig, Options};
use crate::program::{DaySchedule, Program, Starts, MAX_START_TIMES};
use crate::sensor::{SensorConfig, SensorKind};
use crate::station::{StationKind, StationRecord, MAX_BOARDS, STATIONS_PER_BOARD};

/// Range of every signed adjustment, in seconds.
const ADJUST_LIMIT_SECS: i64 = 600;
const MAX_WATER_LEVEL: u16 = 250;
const MINUTES_PER_DAY: u16 = 1440;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub options: OptionsEntry,
    #[serde(default)]
    pub stations: Vec<StationRecord>,
    #[serde(default)]
    pub programs: Vec<Program>,
}

/// `[options]`. Adjustments are plain seconds here and encoded on the way
/// into the store.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OptionsEntry {
    pub enabled: bool,
    pub utc_offset_minutes: i32,
    pub water_level: u16,
    pub boards: u8,
    pub station_delay_secs: i64,
    pub master1: MasterEntry,
    pub master2: MasterEntry,
    pub sensor1: SensorConfig,
    pub sensor2: SensorConfig,
    pub flow_pulse_rate: u16,
    pub remote_extension: bool,
    pub auto_refresh: bool,
    pub notify_mask: u16,
    pub sunrise_minute: u16,
    pub sunset_minute: u16,
    pub device_key: String,
    pub location: String,
    pub mqtt_topic_prefix: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MasterEntry {
    pub station: Option<usize>,
    pub on_adjust_secs: i64,
    pub off_adjust_secs: i64,
}

impl Default for OptionsEntry {
    fn default() -> Self {
        let o = Options::default();
        Self {
            enabled: o.enabled,
            utc_offset_minutes: o.utc_offset_minutes,
            water_level: u16::from(o.water_level),
            boards: o.boards,
            station_delay_secs: 0,
            master1: MasterEntry::default(),
            master2: MasterEntry::default(),
            sensor1: o.sensor1,
            sensor2: o.sensor2,
            flow_pulse_rate: o.flow_pulse_rate,
            remote_extension: o.remote_extension,
            auto_refresh: o.auto_refresh,
            notify_mask: o.notify_mask,
            sunrise_minute: o.sunrise_minute,
            sunset_minute: o.sunset_minute,
            device_key: o.device_key,
            location: o.location,
            mqtt_topic_prefix: o.mqtt_topic_prefix,
        }
    }
}

impl MasterEntry {
    fn to_master(&self) -> MasterConfig {
        MasterConfig {
            station: self.station,
            on_adjust: encode_signed(self.on_adjust_secs),
            off_adjust: encode_signed(self.off_adjust_secs),
        }
    }
}

impl OptionsEntry {
    /// Encode into the stored form. Call after `validate`.
    pub fn to_options(&self) -> Options {
        Options {
            enabled: self.enabled,
            utc_offset_minutes: self.utc_offset_minutes,
            water_level: self.water_level.min(MAX_WATER_LEVEL) as u8,
            boards: self.boards,
            station_delay: encode_signed(self.station_delay_secs),
            master1: self.master1.to_master(),
            master2: self.master2.to_master(),
            sensor1: self.sensor1,
            sensor2: self.sensor2,
            flow_pulse_rate: self.flow_pulse_rate,
            remote_extension: self.remote_extension,
            auto_refresh: self.auto_refresh,
            notify_mask: self.notify_mask,
            sunrise_minute: self.sunrise_minute,
            sunset_minute: self.sunset_minute,
            rain_delay_stop: None,
            device_key: self.device_key.clone(),
            location: self.location.clone(),
            mqtt_topic_prefix: self.mqtt_topic_prefix.clone(),
        }
    }

    fn station_count(&self) -> usize {
        usize::from(self.boards) * STATIONS_PER_BOARD
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_options(&mut errors);
        self.validate_stations(&mut errors);
        self.validate_programs(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_options(&self, errors: &mut Vec<String>) {
        let o = &self.options;

        // ── Boards ──────────────────────────────────────────
        if o.boards == 0 || usize::from(o.boards) > MAX_BOARDS {
            errors.push(format!("options: boards {} out of range [1, {MAX_BOARDS}]", o.boards));
        }

        if o.water_level > MAX_WATER_LEVEL {
            errors.push(format!(
                "options: water_level {} out of range [0, {MAX_WATER_LEVEL}]",
                o.water_level
            ));
        }

        // ── Adjustments ─────────────────────────────────────
        let mut check_adjust = |name: &str, secs: i64| {
            if secs.abs() > ADJUST_LIMIT_SECS {
                errors.push(format!(
                    "options: {name} {secs} out of range [-{ADJUST_LIMIT_SECS}, {ADJUST_LIMIT_SECS}]"
                ));
            }
        };
        check_adjust("station_delay_secs", o.station_delay_secs);
        for (slot, m) in [("master1", &o.master1), ("master2", &o.master2)] {
            check_adjust(&format!("{slot}.on_adjust_secs"), m.on_adjust_secs);
            check_adjust(&format!("{slot}.off_adjust_secs"), m.off_adjust_secs);
        }

        // ── Masters ─────────────────────────────────────────
        for (slot, m) in [("master1", &o.master1), ("master2", &o.master2)] {
            if let Some(station) = m.station {
                if station >= o.station_count() {
                    errors.push(format!(
                        "options: {slot}.station {station} is beyond the {} configured stations",
                        o.station_count()
                    ));
                }
            }
        }
        if o.master1.station.is_some() && o.master1.station == o.master2.station {
            errors.push("options: master1 and master2 name the same station".to_string());
        }

        // ── Sensors ─────────────────────────────────────────
        if o.sensor2.kind == SensorKind::Flow {
            errors.push("options: a flow sensor is only supported on sensor1".to_string());
        }

        // ── Sun times ───────────────────────────────────────
        for (name, minute) in [("sunrise_minute", o.sunrise_minute), ("sunset_minute", o.sunset_minute)] {
            if minute >= MINUTES_PER_DAY {
                errors.push(format!("options: {name} {minute} out of range [0, {}]", MINUTES_PER_DAY - 1));
            }
        }

        // ── MQTT ────────────────────────────────────────────
        let prefix = o.mqtt_topic_prefix.trim();
        if prefix.is_empty() {
            errors.push("options: mqtt_topic_prefix is empty".to_string());
        } else if prefix.contains(&['#', '+'][..]) {
            errors.push(format!("options: mqtt_topic_prefix '{prefix}' contains a wildcard"));
        }
    }

    fn validate_stations(&self, errors: &mut Vec<String>) {
        let count = self.options.station_count();
        let mut seen_ids: HashSet<usize> = HashSet::new();

        for s in &self.stations {
            let ctx = format!("station {}", s.id);

            // ── Identity ────────────────────────────────────────
            if s.id >= count {
                errors.push(format!("{ctx}: id is beyond the {count} configured stations"));
            } else if !seen_ids.insert(s.id) {
                errors.push(format!("{ctx}: duplicate id"));
            }
            if s.name.trim().is_empty() {
                errors.push(format!("{ctx}: name is empty"));
            }

            // ── Special payload ─────────────────────────────────
            if let Err(e) = StationKind::decode(s.special_type, &s.payload) {
                errors.push(format!("{ctx}: {} payload rejected: {e}", s.special_type.as_str()));
            }
        }
    }

    fn validate_programs(&self, errors: &mut Vec<String>) {
        let count = self.options.station_count();

        for (i, p) in self.programs.iter().enumerate() {
            let ctx = || {
                if p.name.is_empty() {
                    format!("programs[{i}]")
                } else {
                    format!("program '{}'", p.name)
                }
            };

            if p.name.trim().is_empty() {
                errors.push(format!("{}: name is empty", ctx()));
            }
            if p.durations.len() > count {
                errors.push(format!(
                    "{}: {} durations but only {count} stations",
                    ctx(),
                    p.durations.len()
                ));
            }

            // ── Days ────────────────────────────────────────────
            match &p.schedule {
                DaySchedule::Weekly { days } if days.is_empty() => {
                    errors.push(format!("{}: weekly schedule has no days", ctx()));
                }
                DaySchedule::Monthly { day } if !(1..=31).contains(day) => {
                    errors.push(format!("{}: monthly day {day} out of range [1, 31]", ctx()));
                }
                DaySchedule::Interval { every, remainder } if *every == 0 || remainder >= every => {
                    errors.push(format!(
                        "{}: interval needs every >= 1 and remainder < every, got every={every} remainder={remainder}",
                        ctx()
                    ));
                }
                _ => {}
            }

            // ── Start times ─────────────────────────────────────
            match &p.starts {
                Starts::Fixed { times } => {
                    if times.is_empty() {
                        errors.push(format!("{}: no start times", ctx()));
                    } else if times.len() > MAX_START_TIMES {
                        errors.push(format!(
                            "{}: {} start times, at most {MAX_START_TIMES} allowed",
                            ctx(),
                            times.len()
                        ));
                    }
                }
                Starts::Repeating { repeat, interval, .. } => {
                    if *repeat > 0 && *interval == 0 {
                        errors.push(format!("{}: repeat {repeat} with a zero interval", ctx()));
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Load + apply
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents = std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config = toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

/// Seed options, stations and programs from the config into the database.
pub async fn apply(config: &Config, db: &Db) -> Result<()> {
    db.seed_options(&config.options.to_options())
        .await
        .context("failed to seed options")?;

    for s in &config.stations {
        db.upsert_station(s)
            .await
            .with_context(|| format!("failed to upsert station {}", s.id))?;
    }

    db.replace_programs(&config.programs)
        .await
        .context("failed to store programs")?;

    tracing::info!(
        stations = config.stations.len(),
        programs = config.programs.len(),
        "config applied"
    );

    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
