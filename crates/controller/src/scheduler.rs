//! Program scheduling: the once-a-minute match pass, start-time assignment,
//! the per-second advance of running waterings, and manual starts.
//!
//! ## Entry lifecycle
//!
//! ```text
//! enqueue ──▶ unscheduled ──[schedule_all_stations]──▶ pending
//!    ──[start <= now]──▶ running ──[now >= end]──▶ turned off, dequeued
//! ```
//!
//! Sequential stations run back to back, separated by the station delay.
//! Everything else starts one second apart so the boards never see a burst
//! of simultaneous inrush.

use tracing::{debug, info, warn};

use crate::adapters::Dispatcher;
use crate::codec::{resolve_water_time, scale_water_time, weather_adjusted, MAX_WATER_TIME};
use crate::controller::{Controller, REBOOT_DELAY_SECS};
use crate::events::Event;
use crate::queue::RunSource;
use crate::sensor::flow_volume;
use crate::station::StationId;
use crate::valve::DigitalIo;

/// Deferred reboot; waits until nothing runs or is about to.
const REBOOT_DIRECTIVE: &str = ":>reboot";
/// Reboot regardless of activity.
const REBOOT_NOW_DIRECTIVE: &str = ":>reboot_now";

/// How far ahead a safe reboot looks for a program about to start.
const REBOOT_LOOKAHEAD_SECS: i64 = 60;

impl<IO: DigitalIo, D: Dispatcher> Controller<IO, D> {
    // ----------------------------
    // Minute pass
    // ----------------------------

    /// Enqueue every program matching `now`, then assign start times.
    pub fn check_program_schedule(&mut self, now: i64) {
        let sun = self.options.sun();
        let mut matched = false;

        for index in 0..self.programs.len() {
            if !self.programs[index].check_match(now, sun) {
                continue;
            }
            if self.process_special_program_command(index, now) {
                continue;
            }
            let use_weather = self.programs[index].use_weather;
            let enqueued = self.enqueue_program(index, RunSource::Program(index), use_weather);
            if enqueued == 0 {
                debug!(program = index, "program matched with nothing to water");
                continue;
            }
            matched = true;
            self.announce_program(index, false, use_weather, enqueued);
        }

        if matched {
            self.schedule_all_stations(now);
        }
    }

    /// Handle a `:`-named directive. Returns `true` if the program was one
    /// and must not water.
    pub fn process_special_program_command(&mut self, index: usize, now: i64) -> bool {
        let Some(program) = self.programs.get(index) else {
            return false;
        };
        if !program.name.starts_with(REBOOT_DIRECTIVE) {
            return false;
        }
        let safe = program.name != REBOOT_NOW_DIRECTIVE;
        self.status.safe_reboot = safe;
        self.status.reboot_at = Some(now + REBOOT_DELAY_SECS);
        info!(program = %program.name, safe, at = now + REBOOT_DELAY_SECS, "reboot scheduled");
        true
    }

    /// Queue one entry per station with a nonzero water time. Masters and
    /// disabled stations are skipped.
    fn enqueue_program(&mut self, index: usize, source: RunSource, use_weather: bool) -> usize {
        let Some(program) = self.programs.get(index) else {
            return 0;
        };
        let sun = self.options.sun();
        let mut enqueued = 0;

        for station in 0..self.stations.len() {
            if self.options.is_master(station) || self.stations[station].attributes.disabled {
                continue;
            }
            let code = program.duration_for(station);
            if code == 0 {
                continue;
            }
            let seconds = resolve_water_time(code, sun.sunrise, sun.sunset);
            let level = self.options.water_level;
            // the low-water clamp only guards scheduled runs
            let seconds = match source {
                RunSource::Program(_) => scale_water_time(seconds, level, use_weather),
                _ => weather_adjusted(seconds, level, use_weather),
            };
            if seconds <= 0 {
                continue;
            }
            if self.queue.enqueue(station, source, seconds).is_some() {
                enqueued += 1;
            }
        }
        enqueued
    }

    fn announce_program(&mut self, index: usize, manual: bool, use_weather: bool, enqueued: usize) {
        let name = self.programs[index].name.clone();
        let water_level = if use_weather { self.options.water_level } else { 100 };
        info!(program = index, name = %name, manual, water_level, stations = enqueued, "program started");
        self.emit(Event::ProgramScheduled {
            program: index,
            name,
            manual,
            water_level,
        });
    }

    // ----------------------------
    // Start times
    // ----------------------------

    /// Give every unscheduled entry a start time.
    pub fn schedule_all_stations(&mut self, now: i64) {
        let delay = self.options.station_delay_secs();
        let remote_extension = self.options.remote_extension;

        let mut concurrent_start = now + 1;
        let mut sequential_start = match self.queue.last_sequential_stop() {
            Some(stop) if stop > now => stop + delay,
            _ => now + 1,
        };

        let mut scheduled = 0usize;
        for entry in self.queue.entries_mut() {
            if entry.start_time.is_some() || entry.duration == 0 {
                continue;
            }
            let sequential = !remote_extension
                && self
                    .stations
                    .get(entry.station)
                    .is_some_and(|s| s.attributes.sequential);
            if sequential {
                entry.start_time = Some(sequential_start);
                sequential_start += entry.duration + delay;
            } else {
                entry.start_time = Some(concurrent_start);
                concurrent_start += 1;
            }
            scheduled += 1;
        }

        if scheduled > 0 && !self.status.program_busy {
            self.status.program_busy = true;
            if self.options.flow_sensor_enabled() {
                self.sensors.flow.start_log();
            }
        }
        self.queue.reassign_slots();
        self.recompute_last_sequential_stop(now);
    }

    fn recompute_last_sequential_stop(&mut self, now: i64) {
        let remote_extension = self.options.remote_extension;
        let stations = &self.stations;
        self.queue.recompute_last_sequential_stop(now, |id| {
            !remote_extension && stations.get(id).is_some_and(|s| s.attributes.sequential)
        });
    }

    // ----------------------------
    // Per-second advance
    // ----------------------------

    /// Turn stations on and off from their slots, reap finished entries and
    /// go idle once the queue drains.
    pub fn advance(&mut self, now: i64) {
        self.queue.reassign_slots();

        for id in 0..self.stations.len() {
            if self.options.is_master(id) {
                continue;
            }
            let Some(entry) = self.queue.slot(id).cloned() else {
                continue;
            };
            if entry.has_elapsed(now) {
                self.turn_off_station(id, now);
            } else if entry.is_due(now) && !self.bitmap.get(id) {
                self.turn_on_station(id);
            }
        }

        self.queue.clean(now);
        self.recompute_last_sequential_stop(now);

        if self.queue.is_empty() {
            self.clear_all_station_bits();
            self.apply_all_station_bits(now);
            self.queue.reset_runtime();
            self.status.program_busy = false;
            if self.options.flow_sensor_enabled() {
                let pulses = self.sensors.flow.pulses_since_log();
                let volume = flow_volume(pulses, self.options.flow_pulse_rate);
                info!(pulses, volume, "program flow");
                self.emit(Event::FlowSummary { pulses, volume });
            }
            info!("queue drained, controller idle");
        }
    }

    // ----------------------------
    // Manual starts
    // ----------------------------

    /// Run one station for `seconds`. Rejected for masters and unknown ids.
    pub fn run_station(&mut self, station: StationId, seconds: i64, now: i64) -> bool {
        if station >= self.stations.len() || self.options.is_master(station) {
            return false;
        }
        if seconds <= 0 {
            return false;
        }
        let seconds = seconds.min(MAX_WATER_TIME);
        if self.queue.enqueue(station, RunSource::Manual, seconds).is_none() {
            return false;
        }
        info!(station, seconds, "manual run queued");
        self.schedule_all_stations(now);
        true
    }

    /// Stop everything now, then queue program `index`.
    pub fn manual_start_program(&mut self, index: usize, use_weather: bool, now: i64) -> bool {
        if index >= self.programs.len() {
            warn!(program = index, "no such program");
            return false;
        }
        self.reset_all_stations_immediate(now);
        let enqueued = self.enqueue_program(index, RunSource::ManualProgram(index), use_weather);
        self.announce_program(index, true, use_weather, enqueued);
        if enqueued > 0 {
            self.schedule_all_stations(now);
        }
        true
    }

    // ----------------------------
    // Resets
    // ----------------------------

    /// Cancel every entry. Running stations are turned off and logged on
    /// the next advance.
    pub fn reset_all_stations(&mut self) {
        info!(entries = self.queue.len(), "all stations cancelled");
        self.queue.cancel_all();
    }

    /// Close every valve and empty the queue without logging.
    pub fn reset_all_stations_immediate(&mut self, now: i64) {
        self.clear_all_station_bits();
        self.apply_all_station_bits(now);
        self.queue.clear();
        self.status.program_busy = false;
    }

    /// Whether any watering program starts within the next minute.
    pub fn program_pending_soon(&self, now: i64) -> bool {
        let sun = self.options.sun();
        self.programs
            .iter()
            .any(|p| !p.is_directive() && p.check_match(now + REBOOT_LOOKAHEAD_SECS, sun))
    }
}

// ===========================================================================
// Tests
// ===========================================================================
