//! Watering programs and their day/time recurrence.
//!
//! All times handed to [`Program::check_match`] are local epoch seconds
//! (UTC shifted by the configured offset), so day boundaries fall on local
//! midnight.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use time::{Month, OffsetDateTime};

use crate::station::StationId;

pub const MAX_START_TIMES: usize = 4;
const SECS_PER_DAY: i64 = 86_400;
const MINUTES_PER_DAY: i64 = 1440;

/// Program names starting with this prefix are directives, not waterings.
pub const DIRECTIVE_PREFIX: char = ':';

/// Sunrise and sunset as minutes after local midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SunTimes {
    pub sunrise: u16,
    pub sunset: u16,
}

// ---------------------------------------------------------------------------
// Start times
// ---------------------------------------------------------------------------

/// `HH:MM`, `sunrise`, `sunrise+N`, `sunset-N` (N in minutes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum StartTime {
    At(u16),
    Sunrise(i16),
    Sunset(i16),
}

impl StartTime {
    /// Minute of the day, sun-relative times clamped into the same day.
    pub fn minute_of_day(&self, sun: SunTimes) -> i64 {
        let minute = match *self {
            StartTime::At(m) => i64::from(m),
            StartTime::Sunrise(offset) => i64::from(sun.sunrise) + i64::from(offset),
            StartTime::Sunset(offset) => i64::from(sun.sunset) + i64::from(offset),
        };
        minute.clamp(0, MINUTES_PER_DAY - 1)
    }
}

impl FromStr for StartTime {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let sun_offset = |rest: &str| -> Result<i16, String> {
            if rest.is_empty() {
                return Ok(0);
            }
            let offset: i16 = rest
                .parse()
                .map_err(|_| format!("invalid sun offset '{rest}' in start time '{s}'"))?;
            if offset.unsigned_abs() >= MINUTES_PER_DAY as u16 {
                return Err(format!("sun offset {offset} out of range in start time '{s}'"));
            }
            Ok(offset)
        };

        if let Some(rest) = s.strip_prefix("sunrise") {
            return Ok(StartTime::Sunrise(sun_offset(rest)?));
        }
        if let Some(rest) = s.strip_prefix("sunset") {
            return Ok(StartTime::Sunset(sun_offset(rest)?));
        }

        let (h, m) = s
            .split_once(':')
            .ok_or_else(|| format!("start time '{s}' is not HH:MM, sunrise±N or sunset±N"))?;
        let h: u16 = h.parse().map_err(|_| format!("invalid hour in start time '{s}'"))?;
        let m: u16 = m.parse().map_err(|_| format!("invalid minute in start time '{s}'"))?;
        if h > 23 || m > 59 {
            return Err(format!("start time '{s}' out of range"));
        }
        Ok(StartTime::At(h * 60 + m))
    }
}

impl TryFrom<String> for StartTime {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl fmt::Display for StartTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn sun(f: &mut fmt::Formatter<'_>, name: &str, offset: i16) -> fmt::Result {
            match offset {
                0 => write!(f, "{name}"),
                o if o > 0 => write!(f, "{name}+{o}"),
                o => write!(f, "{name}{o}"),
            }
        }
        match *self {
            StartTime::At(m) => write!(f, "{:02}:{:02}", m / 60, m % 60),
            StartTime::Sunrise(o) => sun(f, "sunrise", o),
            StartTime::Sunset(o) => sun(f, "sunset", o),
        }
    }
}

impl From<StartTime> for String {
    fn from(t: StartTime) -> Self {
        t.to_string()
    }
}

// ---------------------------------------------------------------------------
// Recurrence
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Weekday {
    Mon,
    Tue,
    Wed,
    Thu,
    Fri,
    Sat,
    Sun,
}

impl Weekday {
    fn days_from_monday(&self) -> u8 {
        *self as u8
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DaySchedule {
    Weekly { days: Vec<Weekday> },
    Monthly { day: u8 },
    /// Every `every` days, on days where `days_since_epoch % every == remainder`.
    Interval { every: u16, remainder: u16 },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OddEven {
    #[default]
    None,
    Odd,
    Even,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Starts {
    Fixed { times: Vec<StartTime> },
    /// `start`, then `repeat` more runs every `interval` minutes.
    Repeating { start: StartTime, repeat: u16, interval: u16 },
}

// ---------------------------------------------------------------------------
// Program
// ---------------------------------------------------------------------------

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Program {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub use_weather: bool,
    #[serde(default)]
    pub odd_even: OddEven,
    pub schedule: DaySchedule,
    pub starts: Starts,
    /// Encoded water time per station, see `codec::resolve_water_time`.
    #[serde(default)]
    pub durations: Vec<u16>,
}

impl Program {
    pub fn duration_for(&self, station: StationId) -> u16 {
        self.durations.get(station).copied().unwrap_or(0)
    }

    pub fn is_directive(&self) -> bool {
        self.name.starts_with(DIRECTIVE_PREFIX)
    }

    /// Whether the program starts a run at minute `t` (local seconds).
    pub fn check_match(&self, t: i64, sun: SunTimes) -> bool {
        if !self.enabled {
            return false;
        }
        let minute = t.rem_euclid(SECS_PER_DAY) / 60;

        if self.day_matches(t) {
            match &self.starts {
                Starts::Fixed { times } => {
                    return times
                        .iter()
                        .take(MAX_START_TIMES)
                        .any(|st| st.minute_of_day(sun) == minute);
                }
                Starts::Repeating { start, repeat, interval } => {
                    let start = start.minute_of_day(sun);
                    if minute == start {
                        return true;
                    }
                    if minute > start && repeats_at(minute - start, *repeat, *interval) {
                        return true;
                    }
                }
            }
        }

        // A repeating run that started yesterday may carry past midnight.
        if let Starts::Repeating { start, repeat, interval } = &self.starts {
            if *interval > 0 && self.day_matches(t - SECS_PER_DAY) {
                let since = minute - start.minute_of_day(sun) + MINUTES_PER_DAY;
                return repeats_at(since, *repeat, *interval);
            }
        }
        false
    }

    fn day_matches(&self, t: i64) -> bool {
        let Ok(date) = OffsetDateTime::from_unix_timestamp(t) else {
            return false;
        };

        let scheduled = match &self.schedule {
            DaySchedule::Weekly { days } => {
                let today = date.weekday().number_days_from_monday();
                days.iter().any(|d| d.days_from_monday() == today)
            }
            DaySchedule::Monthly { day } => date.day() == *day,
            DaySchedule::Interval { every, remainder } => {
                *every > 0 && t.div_euclid(SECS_PER_DAY) % i64::from(*every) == i64::from(*remainder)
            }
        };
        if !scheduled {
            return false;
        }

        let dom = date.day();
        match self.odd_even {
            OddEven::None => true,
            OddEven::Even => dom % 2 == 0,
            // the 31st and Feb 29 would make two odd days in a row
            OddEven::Odd => dom % 2 == 1 && dom != 31 && !(date.month() == Month::February && dom == 29),
        }
    }
}

fn repeats_at(minutes_since_start: i64, repeat: u16, interval: u16) -> bool {
    if interval == 0 || minutes_since_start <= 0 {
        return false;
    }
    let interval = i64::from(interval);
    minutes_since_start % interval == 0 && minutes_since_start / interval <= i64::from(repeat)
}

// ===========================================================================
// Tests
// ===========================================================================
