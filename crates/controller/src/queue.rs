//! Bounded runtime queue of pending and running waterings.
//!
//! Entries are addressed by an [`EntryId`] that is never reused, so a
//! station's slot can't silently point at a different entry after the
//! queue is compacted. A slot whose entry has been removed simply stops
//! resolving.

use serde::Serialize;
use tracing::warn;

use crate::station::{StationId, MAX_STATIONS};

/// One slot per station.
pub const QUEUE_CAPACITY: usize = MAX_STATIONS;

// ---------------------------------------------------------------------------
// Entry types
// ---------------------------------------------------------------------------

/// Who put an entry in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "program", rename_all = "snake_case")]
pub enum RunSource {
    /// Matched by the minute scheduling pass.
    Program(usize),
    /// A program started by hand (API or program switch).
    ManualProgram(usize),
    /// A single station started by hand.
    Manual,
}

impl RunSource {
    /// Manual runs are exempt from sensor, rain-delay and disable shutoffs.
    pub fn is_manual(&self) -> bool {
        !matches!(self, RunSource::Program(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct EntryId(u64);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueEntry {
    pub id: EntryId,
    pub station: StationId,
    pub source: RunSource,
    /// `None` until `schedule_all_stations` assigns it.
    pub start_time: Option<i64>,
    /// Seconds. Zero marks the entry for removal on the next pass.
    pub duration: i64,
}

impl QueueEntry {
    pub fn end_time(&self) -> Option<i64> {
        self.start_time.map(|start| start + self.duration)
    }

    /// Whether the watering window `[start, start + duration)` contains `now`.
    pub fn is_due(&self, now: i64) -> bool {
        match self.start_time {
            Some(start) => now >= start && now < start + self.duration,
            None => false,
        }
    }

    pub fn has_elapsed(&self, now: i64) -> bool {
        self.end_time().is_some_and(|end| now >= end)
    }
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct RuntimeQueue {
    entries: Vec<QueueEntry>,
    slots: Vec<Option<EntryId>>,
    capacity: usize,
    next_id: u64,
    last_sequential_stop: Option<i64>,
    dropped: u64,
}

impl Default for RuntimeQueue {
    fn default() -> Self {
        Self::with_capacity(QUEUE_CAPACITY)
    }
}

impl RuntimeQueue {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            slots: vec![None; MAX_STATIONS],
            capacity,
            next_id: 0,
            last_sequential_stop: None,
            dropped: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[QueueEntry] {
        &self.entries
    }

    pub fn entries_mut(&mut self) -> impl Iterator<Item = &mut QueueEntry> {
        self.entries.iter_mut()
    }

    /// Enqueue attempts rejected because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn last_sequential_stop(&self) -> Option<i64> {
        self.last_sequential_stop
    }

    /// Append an unscheduled entry. Returns `None` when the queue is full.
    pub fn enqueue(&mut self, station: StationId, source: RunSource, duration: i64) -> Option<EntryId> {
        if self.entries.len() >= self.capacity {
            self.dropped += 1;
            warn!(
                station,
                capacity = self.capacity,
                dropped = self.dropped,
                "queue: full, watering dropped"
            );
            return None;
        }
        let id = EntryId(self.next_id);
        self.next_id += 1;
        self.entries.push(QueueEntry {
            id,
            station,
            source,
            start_time: None,
            duration,
        });
        Some(id)
    }

    pub fn get(&self, id: EntryId) -> Option<&QueueEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    /// The entry currently authoritative for `station`, if any.
    pub fn slot(&self, station: StationId) -> Option<&QueueEntry> {
        self.slots
            .get(station)
            .copied()
            .flatten()
            .and_then(|id| self.get(id))
    }

    /// Remove one entry, compacting the queue. Any station slot that
    /// referenced it is cleared; all other slots keep resolving to the
    /// same entries they did before.
    pub fn dequeue(&mut self, id: EntryId) -> Option<QueueEntry> {
        let index = self.entries.iter().position(|e| e.id == id)?;
        let removed = self.entries.remove(index);
        if let Some(slot) = self.slots.get_mut(removed.station) {
            if *slot == Some(id) {
                *slot = None;
            }
        }
        Some(removed)
    }

    /// Recompute every station's slot. Walking the queue in order, an entry
    /// takes the slot unless the slot already holds a strictly earlier start
    /// time. Unscheduled entries only take an otherwise empty slot.
    pub fn reassign_slots(&mut self) {
        self.slots.iter_mut().for_each(|s| *s = None);
        for entry in &self.entries {
            let Some(slot) = self.slots.get_mut(entry.station) else {
                continue;
            };
            let holder_start = slot
                .and_then(|id| self.entries.iter().find(|e| e.id == id))
                .map(|e| e.start_time);
            let wins = match (holder_start, entry.start_time) {
                (None, _) => true,
                (Some(None), Some(_)) => true,
                (Some(None), None) => false,
                (Some(Some(_)), None) => false,
                (Some(Some(held)), Some(start)) => held >= start,
            };
            if wins {
                *slot = Some(entry.id);
            }
        }
    }

    /// Drop entries marked for removal or whose window has passed.
    pub fn clean(&mut self, now: i64) {
        let mut removed = Vec::new();
        self.entries.retain(|e| {
            let keep = e.duration > 0 && !e.has_elapsed(now);
            if !keep {
                removed.push(e.id);
            }
            keep
        });
        for slot in self.slots.iter_mut() {
            if slot.is_some_and(|id| removed.contains(&id)) {
                *slot = None;
            }
        }
    }

    /// Latest future stop time among sequential entries.
    pub fn recompute_last_sequential_stop<F>(&mut self, now: i64, is_sequential: F)
    where
        F: Fn(StationId) -> bool,
    {
        self.last_sequential_stop = self
            .entries
            .iter()
            .filter(|e| is_sequential(e.station))
            .filter_map(|e| e.end_time())
            .filter(|&end| end > now)
            .max();
    }

    /// Zero every duration; entries are reaped on the next pass.
    pub fn cancel_all(&mut self) {
        for entry in &mut self.entries {
            entry.duration = 0;
        }
    }

    /// Reset derived state once the queue has drained.
    pub fn reset_runtime(&mut self) {
        self.slots.iter_mut().for_each(|s| *s = None);
        self.last_sequential_stop = None;
    }

    /// Remove everything immediately.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.reset_runtime();
    }
}

// ===========================================================================
// Tests
// ===========================================================================
