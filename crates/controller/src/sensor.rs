//! Sensor debouncing.
//!
//! Rain and soil sensors are debounced with on/off delay timers (never
//! shorter than five seconds). Program-switch inputs keep a 4-bit history
//! and fire once per press. A flow sensor counts falling edges.

use serde::{Deserialize, Serialize};

/// Floor applied to every configured on/off delay.
pub const MIN_SENSOR_DELAY_SECS: i64 = 5;

/// History pattern for a press: low, low, high, high (oldest first).
const SWITCH_PRESS_PATTERN: u8 = 0b0011;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorKind {
    #[default]
    None,
    Rain,
    Soil,
    Flow,
    ProgramSwitch,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Polarity {
    /// Contact closes (pulls the input low) when triggered.
    #[default]
    NormallyOpen,
    NormallyClosed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    pub kind: SensorKind,
    pub polarity: Polarity,
    pub on_delay_minutes: u8,
    pub off_delay_minutes: u8,
}

impl SensorConfig {
    pub fn is_binary(&self) -> bool {
        matches!(self.kind, SensorKind::Rain | SensorKind::Soil)
    }

    /// Translate a raw pin level into "sensor triggered".
    pub fn detected(&self, raw_high: bool) -> bool {
        match self.polarity {
            Polarity::NormallyOpen => !raw_high,
            Polarity::NormallyClosed => raw_high,
        }
    }

    fn on_delay(&self) -> i64 {
        (i64::from(self.on_delay_minutes) * 60).max(MIN_SENSOR_DELAY_SECS)
    }

    fn off_delay(&self) -> i64 {
        (i64::from(self.off_delay_minutes) * 60).max(MIN_SENSOR_DELAY_SECS)
    }
}

// ---------------------------------------------------------------------------
// Per-sensor state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SensorState {
    pub detected: bool,
    #[serde(skip)]
    on_timer: Option<i64>,
    #[serde(skip)]
    off_timer: Option<i64>,
    pub active: bool,
    pub last_active: Option<i64>,
    #[serde(skip)]
    history: u8,
}

impl SensorState {
    /// Debounce a rain/soil input. Returns the debounced `active` flag.
    pub fn update_binary(&mut self, cfg: &SensorConfig, raw_high: bool, now: i64) -> bool {
        if !cfg.is_binary() {
            self.active = false;
            return false;
        }

        self.detected = cfg.detected(raw_high);
        if self.detected {
            let deadline = *self.on_timer.get_or_insert(now + cfg.on_delay());
            self.off_timer = None;
            if now >= deadline && !self.active {
                self.active = true;
                self.last_active = Some(now);
            }
        } else {
            let deadline = *self.off_timer.get_or_insert(now + cfg.off_delay());
            self.on_timer = None;
            if now >= deadline {
                self.active = false;
            }
        }
        self.active
    }

    /// Shift the current level into the press history. Returns `true` only
    /// on the poll that completes a low-low-high-high sequence.
    pub fn update_switch(&mut self, cfg: &SensorConfig, raw_high: bool) -> bool {
        if cfg.kind != SensorKind::ProgramSwitch {
            self.history = 0;
            return false;
        }
        self.detected = cfg.detected(raw_high);
        self.history = (self.history << 1) | u8::from(self.detected);
        self.history & 0b1111 == SWITCH_PRESS_PATTERN
    }
}

// ---------------------------------------------------------------------------
// Flow counter
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct FlowCounter {
    pulses: u64,
    last_high: bool,
    log_start: u64,
}

impl FlowCounter {
    /// Sample the input; a high-to-low transition counts one pulse.
    pub fn poll(&mut self, raw_high: bool) {
        if self.last_high && !raw_high {
            self.pulses += 1;
        }
        self.last_high = raw_high;
    }

    pub fn pulses(&self) -> u64 {
        self.pulses
    }

    pub fn start_log(&mut self) {
        self.log_start = self.pulses;
    }

    pub fn pulses_since_log(&self) -> u64 {
        self.pulses - self.log_start
    }
}

/// Convert a pulse count to volume; `pulse_rate` is hundredths of a unit.
pub fn flow_volume(pulses: u64, pulse_rate: u16) -> f64 {
    pulses as f64 * f64::from(pulse_rate) / 100.0
}

// ---------------------------------------------------------------------------
// Monitor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct SensorMonitor {
    pub sensors: [SensorState; 2],
    pub flow: FlowCounter,
}

impl SensorMonitor {
    /// Debounce both binary inputs; returns the two `active` flags.
    pub fn update_binary_sensors(&mut self, cfgs: &[SensorConfig; 2], raw: [bool; 2], now: i64) -> [bool; 2] {
        [
            self.sensors[0].update_binary(&cfgs[0], raw[0], now),
            self.sensors[1].update_binary(&cfgs[1], raw[1], now),
        ]
    }

    /// Poll both program-switch inputs. Bit 0 is sensor 1, bit 1 sensor 2.
    pub fn update_switch_sensors(&mut self, cfgs: &[SensorConfig; 2], raw: [bool; 2]) -> u8 {
        let mut mask = 0;
        for i in 0..2 {
            if self.sensors[i].update_switch(&cfgs[i], raw[i]) {
                mask |= 1 << i;
            }
        }
        mask
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn rain(on_delay_minutes: u8, off_delay_minutes: u8) -> SensorConfig {
        SensorConfig {
            kind: SensorKind::Rain,
            polarity: Polarity::NormallyOpen,
            on_delay_minutes,
            off_delay_minutes,
        }
    }

    fn switch() -> SensorConfig {
        SensorConfig {
            kind: SensorKind::ProgramSwitch,
            ..SensorConfig::default()
        }
    }

    // -- polarity -----------------------------------------------------------

    #[test]
    fn normally_open_detects_low() {
        assert!(rain(0, 0).detected(false));
        assert!(!rain(0, 0).detected(true));
    }

    #[test]
    fn normally_closed_detects_high() {
        let cfg = SensorConfig {
            polarity: Polarity::NormallyClosed,
            ..rain(0, 0)
        };
        assert!(cfg.detected(true));
        assert!(!cfg.detected(false));
    }

    // -- binary debounce ----------------------------------------------------

    #[test]
    fn zero_delay_still_waits_five_seconds() {
        let cfg = rain(0, 0);
        let mut s = SensorState::default();
        let t0 = 1_000;

        for t in t0..t0 + 5 {
            assert!(!s.update_binary(&cfg, false, t), "active early at t0+{}", t - t0);
        }
        assert!(s.update_binary(&cfg, false, t0 + 5));
        assert_eq!(s.last_active, Some(t0 + 5));
    }

    #[test]
    fn configured_on_delay_is_minutes() {
        let cfg = rain(2, 0);
        let mut s = SensorState::default();
        assert!(!s.update_binary(&cfg, false, 0));
        assert!(!s.update_binary(&cfg, false, 119));
        assert!(s.update_binary(&cfg, false, 120));
    }

    #[test]
    fn release_uses_off_delay() {
        let cfg = rain(0, 1);
        let mut s = SensorState::default();
        s.update_binary(&cfg, false, 0);
        assert!(s.update_binary(&cfg, false, 5));

        assert!(s.update_binary(&cfg, true, 10));
        assert!(s.update_binary(&cfg, true, 69));
        assert!(!s.update_binary(&cfg, true, 70));
    }

    #[test]
    fn chatter_restarts_the_on_timer() {
        let cfg = rain(0, 0);
        let mut s = SensorState::default();
        s.update_binary(&cfg, false, 0);
        s.update_binary(&cfg, false, 3);
        s.update_binary(&cfg, true, 4);
        assert!(!s.update_binary(&cfg, false, 5));
        assert!(!s.update_binary(&cfg, false, 9));
        assert!(s.update_binary(&cfg, false, 10));
    }

    #[test]
    fn non_binary_kinds_never_activate() {
        let cfg = SensorConfig {
            kind: SensorKind::Flow,
            ..rain(0, 0)
        };
        let mut s = SensorState::default();
        for t in 0..20 {
            assert!(!s.update_binary(&cfg, false, t));
        }
    }

    // -- program switch -----------------------------------------------------

    #[test]
    fn switch_fires_on_fourth_poll_of_low_low_high_high() {
        let cfgs = [SensorConfig::default(), switch()];
        let mut m = SensorMonitor::default();
        // normally open: a pressed button reads low, so "high" history
        // bits come from raw low levels
        let presses = [false, false, true, true];
        let masks: Vec<u8> = presses
            .iter()
            .map(|&pressed| m.update_switch_sensors(&cfgs, [true, !pressed]))
            .collect();
        assert_eq!(masks, vec![0, 0, 0, 0b10]);
    }

    #[test]
    fn holding_the_switch_fires_once() {
        let cfgs = [switch(), SensorConfig::default()];
        let mut m = SensorMonitor::default();
        let fired: u32 = (0..10)
            .map(|i| m.update_switch_sensors(&cfgs, [i < 2, true]) as u32)
            .sum();
        assert_eq!(fired, 1);
    }

    // -- flow ---------------------------------------------------------------

    #[test]
    fn flow_counts_falling_edges() {
        let mut f = FlowCounter::default();
        for level in [true, false, true, false, false, true, false] {
            f.poll(level);
        }
        assert_eq!(f.pulses(), 3);
    }

    #[test]
    fn flow_log_counts_from_start() {
        let mut f = FlowCounter::default();
        f.poll(true);
        f.poll(false);
        f.start_log();
        f.poll(true);
        f.poll(false);
        assert_eq!(f.pulses_since_log(), 1);
        assert_eq!(flow_volume(f.pulses_since_log(), 250), 2.5);
    }
}
