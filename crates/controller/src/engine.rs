//! Station activation: the authoritative "should be open" bitmap, pushing it
//! to the valve boards, master valves, special-station switching and the
//! per-second dynamic shutoffs.

use tracing::{debug, info};

use crate::adapters::{http_url, remote_url, rf_send, Dispatcher};
use crate::controller::Controller;
use crate::events::Event;
use crate::sensor::flow_volume;
use crate::station::{board_of, offset_of, StationId, StationKind, MAX_BOARDS, STATIONS_PER_BOARD};
use crate::valve::DigitalIo;

// ---------------------------------------------------------------------------
// Bitmap
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StationBitChange {
    NoChange,
    TurnedOn,
    TurnedOff,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StationBitmap {
    boards: [u8; MAX_BOARDS],
}

impl StationBitmap {
    pub fn get(&self, id: StationId) -> bool {
        self.boards
            .get(board_of(id))
            .is_some_and(|b| b & (1 << offset_of(id)) != 0)
    }

    pub fn set(&mut self, id: StationId, value: bool) -> StationBitChange {
        let Some(board) = self.boards.get_mut(board_of(id)) else {
            return StationBitChange::NoChange;
        };
        let mask = 1u8 << offset_of(id);
        let was = *board & mask != 0;
        match (was, value) {
            (false, true) => {
                *board |= mask;
                StationBitChange::TurnedOn
            }
            (true, false) => {
                *board &= !mask;
                StationBitChange::TurnedOff
            }
            _ => StationBitChange::NoChange,
        }
    }

    /// The first `count` boards.
    pub fn boards(&self, count: usize) -> &[u8] {
        &self.boards[..count.min(MAX_BOARDS)]
    }

}

// ---------------------------------------------------------------------------
// Engine operations
// ---------------------------------------------------------------------------

impl<IO: DigitalIo, D: Dispatcher> Controller<IO, D> {
    /// Set one station bit. A genuine transition on a special station also
    /// sends its on/off command.
    pub fn set_station_bit(&mut self, id: StationId, value: bool) -> StationBitChange {
        if id >= self.stations.len() {
            return StationBitChange::NoChange;
        }
        let change = self.bitmap.set(id, value);
        if change != StationBitChange::NoChange {
            self.switch_special_station(id, value);
        }
        change
    }

    pub fn clear_all_station_bits(&mut self) {
        for id in 0..self.stations.len() {
            self.set_station_bit(id, false);
        }
    }

    pub(crate) fn switch_special_station(&mut self, id: StationId, on: bool) {
        let Some(station) = self.stations.get(id) else {
            return;
        };
        match &station.kind {
            StationKind::Standard => {}
            StationKind::Rf(rf) => rf_send(&mut self.io, rf, on),
            StationKind::Gpio(g) => self.io.write_pin(g.pin, on == g.active_high),
            StationKind::Remote(target) => {
                if let Some(url) = remote_url(target, &self.options.device_key, on, self.options.auto_refresh) {
                    self.net.get(url);
                }
            }
            StationKind::Http(target) => match http_url(target, on) {
                Some(url) => self.net.get(url),
                None => debug!(station = id, on, "http station has no host or command, skipped"),
            },
            StationKind::Unusable { reason, .. } => {
                debug!(station = id, on, "special station not switched: {reason}");
            }
        }
    }

    /// Push the bitmap to the boards (all zero while disabled), then
    /// re-assert at most one special station per second when auto-refresh
    /// is on.
    pub fn apply_all_station_bits(&mut self, now: i64) {
        let boards = self.stations.len() / STATIONS_PER_BOARD;
        let out = if self.status.enabled {
            self.bitmap.boards(boards).to_vec()
        } else {
            vec![0; boards]
        };
        self.io.shift_out(&out);

        if !self.options.auto_refresh || self.refresh.last.is_some_and(|last| now <= last) {
            return;
        }
        self.refresh.last = Some(now);

        let count = self.stations.len();
        let next = (1..=count)
            .map(|step| (self.refresh.next + step) % count)
            .find(|&id| self.stations[id].kind.is_special());
        if let Some(id) = next {
            self.refresh.next = id;
            let on = self.status.enabled && self.bitmap.get(id);
            self.switch_special_station(id, on);
        }
    }

    pub fn turn_on_station(&mut self, id: StationId) {
        if self.set_station_bit(id, true) == StationBitChange::TurnedOn {
            self.flow_start[id] = self.sensors.flow.pulses();
            info!(station = id, "station on");
            self.emit(Event::StationOn { station: id });
        }
    }

    /// Clear the bit, log the run if the valve was actually open, and drop
    /// the station's queue entry.
    pub fn turn_off_station(&mut self, id: StationId, now: i64) {
        let was_open = self.set_station_bit(id, false) == StationBitChange::TurnedOff;

        let Some(entry) = self.queue.slot(id).cloned() else {
            return;
        };
        let started = entry.start_time.filter(|&start| was_open && now > start);
        if let Some(start) = started {
            let flow = self.options.flow_sensor_enabled().then(|| {
                let pulses = self.sensors.flow.pulses() - self.flow_start[id];
                flow_volume(pulses, self.options.flow_pulse_rate)
            });
            info!(station = id, duration = now - start, "station off");
            self.emit(Event::StationOff {
                station: id,
                source: entry.source,
                start,
                duration: now - start,
                flow_volume: flow,
            });
        }
        self.queue.dequeue(entry.id);
    }

    /// Drive each configured master from the stations that use it.
    pub fn activate_masters(&mut self, now: i64) {
        for slot in 0..2 {
            let master = *self.options.masters()[slot];
            let Some(master_id) = master.station.filter(|&m| m < self.stations.len()) else {
                continue;
            };
            let on_adjust = master.on_adjust_secs();
            let off_adjust = master.off_adjust_secs();

            let engaged = self
                .stations
                .iter()
                .filter(|s| s.id != master_id && s.attributes.uses_master(slot))
                .filter(|s| self.bitmap.get(s.id))
                .filter_map(|s| self.queue.slot(s.id))
                .filter_map(|e| e.start_time.map(|start| (start, e.duration)))
                .any(|(start, duration)| now >= start + on_adjust && now <= start + duration + off_adjust);

            self.set_station_bit(master_id, engaged);
        }
    }

    /// Shut off program-driven stations blocked by the controller being
    /// disabled, rain delay, or an active sensor.
    pub fn process_dynamic_events(&mut self, now: i64) {
        for id in 0..self.stations.len() {
            if self.options.is_master(id) {
                continue;
            }
            let Some(entry) = self.queue.slot(id) else {
                continue;
            };
            if entry.source.is_manual() {
                continue;
            }

            let attrs = self.stations[id].attributes;
            let mut reasons: Vec<&str> = Vec::new();
            if !self.status.enabled {
                reasons.push("disabled");
            }
            if self.status.rain_delayed && !attrs.ignore_rain_delay {
                reasons.push("rain delay");
            }
            for sensor in 0..2 {
                if self.status.sensor_active[sensor] && !attrs.ignores_sensor(sensor) {
                    reasons.push(if sensor == 0 { "sensor1" } else { "sensor2" });
                }
            }

            if !reasons.is_empty() {
                info!(station = id, ?reasons, "station shut off");
                self.turn_off_station(id, now);
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
