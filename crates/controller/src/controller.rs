//! The controller context: every piece of runtime state the engine and the
//! scheduler share, and the once-per-second tick that drives them.
//!
//! ## Tick order
//!
//! ```text
//! rain delay ─▶ binary sensors ─▶ program switch ─▶ minute pass (on new minute)
//!      ─▶ advance (while busy) ─▶ dynamic shutoffs ─▶ masters ─▶ latch
//!      ─▶ status edges ─▶ reboot check
//! ```
//!
//! Everything runs on the caller's task; nothing here awaits.

use serde::Serialize;
use tracing::{info, warn};

use crate::adapters::Dispatcher;
use crate::engine::StationBitmap;
use crate::events::{Event, RebootCause};
use crate::options::Options;
use crate::program::Program;
use crate::queue::{QueueEntry, RuntimeQueue};
use crate::sensor::SensorMonitor;
use crate::station::{station_table, Station, StationId, StationRecord};
use crate::valve::{DigitalIo, SENSOR1_PIN, SENSOR2_PIN};

/// Seconds between a reboot directive and the restart.
pub const REBOOT_DELAY_SECS: i64 = 65;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControllerStatus {
    pub enabled: bool,
    pub rain_delayed: bool,
    pub program_busy: bool,
    /// Binary sensors after their debounce delays.
    pub sensor_active: [bool; 2],
    /// Only reboot once idle.
    pub safe_reboot: bool,
    pub reboot_at: Option<i64>,
}

#[derive(Debug, Default)]
pub(crate) struct RefreshCursor {
    pub(crate) next: StationId,
    pub(crate) last: Option<i64>,
}

/// Operator requests, applied at the start of the next tick.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    RunStation { station: StationId, seconds: i64 },
    RunProgram { program: usize, use_weather: bool },
    StopAll,
    SetEnabled(bool),
    SetRainDelay { hours: u16 },
    SetWaterLevel(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Continue,
    Reboot(RebootCause),
}

pub struct Controller<IO: DigitalIo, D: Dispatcher> {
    pub(crate) options: Options,
    pub(crate) stations: Vec<Station>,
    pub(crate) programs: Vec<Program>,
    pub(crate) status: ControllerStatus,
    previous: ControllerStatus,
    pub(crate) sensors: SensorMonitor,
    pub(crate) bitmap: StationBitmap,
    pub(crate) queue: RuntimeQueue,
    pub(crate) io: IO,
    pub(crate) net: D,
    pub(crate) refresh: RefreshCursor,
    /// Flow counter reading when each station turned on.
    pub(crate) flow_start: Vec<u64>,
    events: Vec<Event>,
    last_minute: Option<i64>,
    options_dirty: bool,
}

impl<IO: DigitalIo, D: Dispatcher> Controller<IO, D> {
    pub fn new(options: Options, records: Vec<StationRecord>, programs: Vec<Program>, io: IO, net: D) -> Self {
        let count = options.station_count();
        let stations = station_table(records, count);
        let status = ControllerStatus {
            enabled: options.enabled,
            ..ControllerStatus::default()
        };
        Self {
            options,
            stations,
            programs,
            previous: status.clone(),
            status,
            sensors: SensorMonitor::default(),
            bitmap: StationBitmap::default(),
            queue: RuntimeQueue::default(),
            io,
            net,
            refresh: RefreshCursor::default(),
            flow_start: vec![0; count],
            events: Vec::new(),
            last_minute: None,
            options_dirty: false,
        }
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub(crate) fn emit(&mut self, event: Event) {
        self.events.push(event);
    }

    pub fn drain_events(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.events)
    }

    /// `true` once after any runtime option changed.
    pub fn take_options_dirty(&mut self) -> bool {
        std::mem::take(&mut self.options_dirty)
    }

    // ----------------------------
    // Tick
    // ----------------------------

    /// One control-loop pass. `now` is local epoch seconds.
    pub fn tick(&mut self, now: i64) -> TickOutcome {
        self.check_rain_delay(now);

        let raw = [self.io.read_pin(SENSOR1_PIN), self.io.read_pin(SENSOR2_PIN)];
        let cfgs = self.options.sensors();
        self.status.sensor_active = self.sensors.update_binary_sensors(&cfgs, raw, now);
        let pressed = self.sensors.update_switch_sensors(&cfgs, raw);
        if pressed != 0 {
            self.handle_program_switch(pressed, now);
        }

        let minute = now.div_euclid(60);
        if self.last_minute != Some(minute) {
            self.last_minute = Some(minute);
            self.check_program_schedule(now);
        }

        if self.status.program_busy {
            self.advance(now);
        }

        self.process_dynamic_events(now);
        self.activate_masters(now);
        self.apply_all_station_bits(now);
        self.emit_status_edges();

        self.check_reboot(now)
    }

    fn check_rain_delay(&mut self, now: i64) {
        match self.options.rain_delay_stop {
            Some(stop) if now < stop => self.status.rain_delayed = true,
            Some(_) => {
                self.status.rain_delayed = false;
                self.options.rain_delay_stop = None;
                self.options_dirty = true;
            }
            None => self.status.rain_delayed = false,
        }
    }

    /// A switch press resets everything, then starts program 1 or 2 at
    /// full water level.
    fn handle_program_switch(&mut self, pressed: u8, now: i64) {
        info!(pressed, "program switch pressed");
        self.reset_all_stations_immediate(now);
        for index in 0..2 {
            if pressed & (1 << index) != 0 && index < self.programs.len() {
                self.manual_start_program(index, false, now);
            }
        }
    }

    fn emit_status_edges(&mut self) {
        for index in 0..2 {
            let active = self.status.sensor_active[index];
            if active != self.previous.sensor_active[index] {
                info!(sensor = index + 1, active, "sensor changed");
                self.emit(Event::SensorChanged {
                    sensor: index as u8 + 1,
                    active,
                });
            }
        }
        if self.status.rain_delayed != self.previous.rain_delayed {
            info!(active = self.status.rain_delayed, "rain delay changed");
            self.emit(Event::RainDelayChanged {
                active: self.status.rain_delayed,
            });
        }
        self.previous = self.status.clone();
    }

    fn check_reboot(&mut self, now: i64) -> TickOutcome {
        let Some(at) = self.status.reboot_at else {
            return TickOutcome::Continue;
        };
        if now < at {
            return TickOutcome::Continue;
        }
        let cause = if self.status.safe_reboot {
            if self.status.program_busy || self.program_pending_soon(now) {
                return TickOutcome::Continue;
            }
            RebootCause::Program
        } else {
            RebootCause::ProgramImmediate
        };
        self.status.reboot_at = None;
        warn!(?cause, "rebooting");
        self.emit(Event::Reboot { cause });
        TickOutcome::Reboot(cause)
    }

    // ----------------------------
    // Commands
    // ----------------------------

    pub fn handle_command(&mut self, command: Command, now: i64) {
        info!(?command, "command");
        match command {
            Command::RunStation { station, seconds } => {
                if !self.run_station(station, seconds, now) {
                    warn!(station, seconds, "run station rejected");
                }
            }
            Command::RunProgram { program, use_weather } => {
                if !self.manual_start_program(program, use_weather, now) {
                    warn!(program, "run program rejected");
                }
            }
            Command::StopAll => self.reset_all_stations(),
            Command::SetEnabled(enabled) => {
                self.status.enabled = enabled;
                self.options.enabled = enabled;
                self.options_dirty = true;
            }
            Command::SetRainDelay { hours } => {
                self.options.rain_delay_stop = (hours > 0).then(|| now + i64::from(hours) * 3600);
                self.options_dirty = true;
                self.check_rain_delay(now);
            }
            Command::SetWaterLevel(level) => {
                self.options.water_level = level;
                self.options_dirty = true;
                self.emit(Event::WeatherUpdated { water_level: level });
            }
        }
    }

    /// Sample the flow input. Called far more often than `tick`.
    pub fn poll_flow(&mut self) {
        if self.options.flow_sensor_enabled() {
            let raw = self.io.read_pin(SENSOR1_PIN);
            self.sensors.flow.poll(raw);
        }
    }

    pub fn snapshot(&self) -> ControllerSnapshot {
        ControllerSnapshot {
            enabled: self.status.enabled,
            rain_delayed: self.status.rain_delayed,
            rain_delay_stop: self.options.rain_delay_stop,
            program_busy: self.status.program_busy,
            sensor1_active: self.status.sensor_active[0],
            sensor2_active: self.status.sensor_active[1],
            water_level: self.options.water_level,
            stations: self
                .stations
                .iter()
                .map(|s| StationView {
                    id: s.id,
                    name: s.name.clone(),
                    open: self.bitmap.get(s.id),
                    master: self.options.is_master(s.id),
                    special: s.kind.is_special(),
                })
                .collect(),
            programs: self
                .programs
                .iter()
                .enumerate()
                .map(|(id, p)| ProgramView {
                    id,
                    name: p.name.clone(),
                    enabled: p.enabled,
                })
                .collect(),
            queue: self.queue.entries().to_vec(),
            dropped_enqueues: self.queue.dropped(),
            last_sequential_stop: self.queue.last_sequential_stop(),
        }
    }
}

/// Local epoch seconds from UTC and the configured offset.
pub fn local_time(utc_secs: i64, utc_offset_minutes: i32) -> i64 {
    utc_secs + i64::from(utc_offset_minutes) * 60
}

// ---------------------------------------------------------------------------
// Snapshot (read by the web layer)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize)]
pub struct ControllerSnapshot {
    pub enabled: bool,
    pub rain_delayed: bool,
    pub rain_delay_stop: Option<i64>,
    pub program_busy: bool,
    pub sensor1_active: bool,
    pub sensor2_active: bool,
    pub water_level: u8,
    pub stations: Vec<StationView>,
    pub programs: Vec<ProgramView>,
    pub queue: Vec<QueueEntry>,
    pub dropped_enqueues: u64,
    pub last_sequential_stop: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StationView {
    pub id: StationId,
    pub name: String,
    pub open: bool,
    pub master: bool,
    pub special: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProgramView {
    pub id: usize,
    pub name: String,
    pub enabled: bool,
}

// ---------------------------------------------------------------------------
// Test helpers
// ---------------------------------------------------------------------------


// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::queue::RunSource;
    use crate::sensor::{Polarity, SensorConfig, SensorKind};

    const SIX_AM: i64 = DAY + 6 * 3600;

    fn rain_sensor() -> Options {
        Options {
            sensor1: SensorConfig {
                kind: SensorKind::Rain,
                polarity: Polarity::NormallyOpen,
                on_delay_minutes: 0,
                off_delay_minutes: 0,
            },
            ..Options::default()
        }
    }

    // -- tick ---------------------------------------------------------------

    #[test]
    fn manual_run_round_trip() {
        let mut c = controller(Options::default(), vec![], vec![]);
        c.handle_command(Command::RunStation { station: 0, seconds: 30 }, SIX_AM);

        let events = run_until(&mut c, SIX_AM, SIX_AM + 40);

        assert!(c.queue.is_empty());
        assert!(!c.status.program_busy);
        assert!(!c.io.is_latched(0));
        assert_eq!(events[0], Event::StationOn { station: 0 });
        assert!(matches!(
            events[1],
            Event::StationOff { station: 0, start, duration: 30, source: RunSource::Manual, .. } if start == SIX_AM + 1
        ));
    }

    #[test]
    fn station_latches_while_running() {
        let mut c = controller(Options::default(), vec![], vec![]);
        c.handle_command(Command::RunStation { station: 3, seconds: 10 }, SIX_AM);
        c.tick(SIX_AM);
        assert!(!c.io.is_latched(3));
        c.tick(SIX_AM + 1);
        assert!(c.io.is_latched(3));
        run_until(&mut c, SIX_AM + 2, SIX_AM + 11);
        assert!(!c.io.is_latched(3));
    }

    #[test]
    fn scheduled_program_runs_on_its_minute() {
        let programs = vec![daily("morning", 360, &[20, 0, 20])];
        let mut c = controller(Options::default(), vec![], programs);

        let events = run_until(&mut c, SIX_AM - 5, SIX_AM + 60);

        assert!(matches!(&events[0], Event::ProgramScheduled { program: 0, manual: false, .. }));
        let offs: Vec<(StationId, i64)> = events
            .iter()
            .filter_map(|e| match e {
                Event::StationOff { station, start, .. } => Some((*station, *start)),
                _ => None,
            })
            .collect();
        assert_eq!(offs, vec![(0, SIX_AM + 1), (2, SIX_AM + 21)]);
    }

    #[test]
    fn rain_sensor_activates_after_delay_and_stops_program() {
        let programs = vec![daily("morning", 360, &[600])];
        let mut c = controller(rain_sensor(), vec![], programs);
        run_until(&mut c, SIX_AM, SIX_AM + 10);
        assert!(c.io.is_latched(0));

        // normally open: closed contact reads low
        c.io.inputs.insert(SENSOR1_PIN, false);
        let t0 = SIX_AM + 11;
        let events = run_until(&mut c, t0, t0 + 4);
        assert!(!c.status.sensor_active[0]);
        assert!(events.is_empty());

        let events = run_until(&mut c, t0 + 5, t0 + 5);
        assert!(c.status.sensor_active[0]);
        assert!(!c.io.is_latched(0));
        assert!(events.contains(&Event::SensorChanged { sensor: 1, active: true }));
        assert!(events.iter().any(|e| matches!(e, Event::StationOff { station: 0, .. })));
    }

    #[test]
    fn rain_sensor_spares_manual_runs() {
        let mut c = controller(rain_sensor(), vec![], vec![]);
        c.io.inputs.insert(SENSOR1_PIN, false);
        run_until(&mut c, SIX_AM, SIX_AM + 6);
        assert!(c.status.sensor_active[0]);

        c.handle_command(Command::RunStation { station: 1, seconds: 60 }, SIX_AM + 7);
        run_until(&mut c, SIX_AM + 7, SIX_AM + 10);
        assert!(c.io.is_latched(1));
    }

    #[test]
    fn program_switch_starts_first_program() {
        let options = Options {
            sensor1: SensorConfig {
                kind: SensorKind::ProgramSwitch,
                ..SensorConfig::default()
            },
            ..Options::default()
        };
        let programs = vec![daily("manual", 100, &[30])];
        let mut c = controller(options, vec![], programs);

        run_until(&mut c, SIX_AM, SIX_AM + 1);
        c.io.inputs.insert(SENSOR1_PIN, false);
        let events = run_until(&mut c, SIX_AM + 2, SIX_AM + 5);

        assert!(events
            .iter()
            .any(|e| matches!(e, Event::ProgramScheduled { program: 0, manual: true, .. })));
        assert!(c.io.is_latched(0));
    }

    #[test]
    fn program_switch_ignores_water_level() {
        let options = Options {
            water_level: 15,
            sensor1: SensorConfig {
                kind: SensorKind::ProgramSwitch,
                ..SensorConfig::default()
            },
            ..Options::default()
        };
        let mut c = controller(options, vec![], vec![daily("manual", 100, &[60])]);

        run_until(&mut c, SIX_AM, SIX_AM + 1);
        c.io.inputs.insert(SENSOR1_PIN, false);
        let events = run_until(&mut c, SIX_AM + 2, SIX_AM + 5);

        assert!(events
            .iter()
            .any(|e| matches!(e, Event::ProgramScheduled { program: 0, water_level: 100, .. })));
        assert_eq!(c.queue.entries()[0].duration, 60);
        assert!(c.io.is_latched(0));
    }

    // -- commands -----------------------------------------------------------

    #[test]
    fn rain_delay_command_sets_and_expires() {
        let mut c = controller(Options::default(), vec![], vec![]);
        c.handle_command(Command::SetRainDelay { hours: 1 }, SIX_AM);
        assert!(c.take_options_dirty());
        assert_eq!(c.options.rain_delay_stop, Some(SIX_AM + 3600));

        let events = run_until(&mut c, SIX_AM, SIX_AM);
        assert_eq!(events, vec![Event::RainDelayChanged { active: true }]);

        let events = run_until(&mut c, SIX_AM + 3600, SIX_AM + 3600);
        assert_eq!(events, vec![Event::RainDelayChanged { active: false }]);
        assert_eq!(c.options.rain_delay_stop, None);
        assert!(c.take_options_dirty());
    }

    #[test]
    fn disable_keeps_queue_for_manual_runs_but_outputs_nothing() {
        let mut c = controller(Options::default(), vec![], vec![]);
        c.handle_command(Command::RunStation { station: 2, seconds: 60 }, SIX_AM);
        run_until(&mut c, SIX_AM, SIX_AM + 2);
        assert!(c.io.is_latched(2));

        c.handle_command(Command::SetEnabled(false), SIX_AM + 3);
        c.tick(SIX_AM + 3);
        assert!(!c.io.is_latched(2));
        assert!(c.bitmap.get(2));

        c.handle_command(Command::SetEnabled(true), SIX_AM + 4);
        c.tick(SIX_AM + 4);
        assert!(c.io.is_latched(2));
    }

    #[test]
    fn stop_all_reaps_running_stations_next_pass() {
        let mut c = controller(Options::default(), vec![], vec![]);
        c.handle_command(Command::RunStation { station: 0, seconds: 600 }, SIX_AM);
        run_until(&mut c, SIX_AM, SIX_AM + 10);

        c.handle_command(Command::StopAll, SIX_AM + 11);
        let events = run_until(&mut c, SIX_AM + 11, SIX_AM + 11);

        assert!(!c.io.is_latched(0));
        assert!(!c.status.program_busy);
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::StationOff { station: 0, duration: 10, .. })));
    }

    #[test]
    fn water_level_command_emits_weather_event() {
        let mut c = controller(Options::default(), vec![], vec![]);
        c.handle_command(Command::SetWaterLevel(60), SIX_AM);
        assert_eq!(c.options.water_level, 60);
        assert_eq!(c.drain_events(), vec![Event::WeatherUpdated { water_level: 60 }]);
    }

    #[test]
    fn run_program_command_rejects_unknown_program() {
        let mut c = controller(Options::default(), vec![], vec![]);
        c.handle_command(Command::RunProgram { program: 3, use_weather: true }, SIX_AM);
        assert!(c.queue.is_empty());
    }

    // -- reboot -------------------------------------------------------------

    #[test]
    fn immediate_reboot_fires_after_delay() {
        let programs = vec![daily(":>reboot_now", 360, &[])];
        let mut c = controller(Options::default(), vec![], programs);
        for now in SIX_AM..SIX_AM + REBOOT_DELAY_SECS {
            assert_eq!(c.tick(now), TickOutcome::Continue);
        }
        assert_eq!(
            c.tick(SIX_AM + REBOOT_DELAY_SECS),
            TickOutcome::Reboot(RebootCause::ProgramImmediate)
        );
    }

    #[test]
    fn safe_reboot_waits_for_idle() {
        let programs = vec![daily(":>reboot", 360, &[]), daily("long", 360, &[300])];
        let mut c = controller(Options::default(), vec![], programs);
        for now in SIX_AM..=SIX_AM + 300 {
            assert_eq!(c.tick(now), TickOutcome::Continue, "at +{}", now - SIX_AM);
        }
        assert_eq!(c.tick(SIX_AM + 301), TickOutcome::Reboot(RebootCause::Program));
    }

    #[test]
    fn safe_reboot_waits_for_imminent_program() {
        let programs = vec![daily(":>reboot", 360, &[]), daily("next", 362, &[10])];
        let mut c = controller(Options::default(), vec![], programs);
        let outcomes: Vec<TickOutcome> = (SIX_AM..SIX_AM + 150).map(|t| c.tick(t)).collect();
        // at +65 the 06:02 start is less than a minute away
        assert_eq!(outcomes[65], TickOutcome::Continue);
        assert!(outcomes.contains(&TickOutcome::Reboot(RebootCause::Program)));
    }

    // -- misc ---------------------------------------------------------------

    #[test]
    fn local_time_applies_offset() {
        assert_eq!(local_time(1_000_000, -300), 1_000_000 - 18_000);
        assert_eq!(local_time(1_000_000, 0), 1_000_000);
    }

    #[test]
    fn snapshot_reflects_open_stations_and_queue() {
        let mut c = controller(Options::default(), vec![], vec![]);
        c.handle_command(Command::RunStation { station: 5, seconds: 60 }, SIX_AM);
        c.tick(SIX_AM + 1);
        let snap = c.snapshot();
        assert_eq!(snap.stations.len(), 8);
        assert!(snap.stations[5].open);
        assert_eq!(snap.queue.len(), 1);
        assert!(snap.program_busy);
    }

    #[test]
    fn flow_pulses_are_counted_only_for_flow_sensor() {
        let options = Options {
            sensor1: SensorConfig {
                kind: SensorKind::Flow,
                ..SensorConfig::default()
            },
            ..Options::default()
        };
        let mut c = controller(options, vec![], vec![]);
        for level in [true, false, true, false, true] {
            c.io.inputs.insert(SENSOR1_PIN, level);
            c.poll_flow();
        }
        assert_eq!(c.sensors.flow.pulses(), 2);

        let mut plain = controller(Options::default(), vec![], vec![]);
        plain.io.inputs.insert(SENSOR1_PIN, false);
        plain.poll_flow();
        assert_eq!(plain.sensors.flow.pulses(), 0);
    }
}
