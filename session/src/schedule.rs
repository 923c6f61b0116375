use common::{Allocation, DepotMap};
use std::collections::BTreeMap;
use thiserror::Error;

/// How many times one download slot may be handed out before it is
/// dropped from the schedule.
pub const RETRY_LIMIT: u32 = 3;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("no more allocations fulfill request: offset ~ {offset}")]
    NoCandidate { offset: u64 },
}

/// Hint passed to `Schedule::get`. The offset is required for download
/// schedules and advisory for upload schedules.
#[derive(Clone, Copy, Debug, Default)]
pub struct ScheduleContext {
    pub offset: u64,
    pub size: Option<u64>,
}

impl ScheduleContext {
    pub fn at(offset: u64) -> Self {
        Self { offset, size: None }
    }
}

/// A depot- or replica-selection strategy.
///
/// `set_source` installs the pool of choices once per transfer; `get`
/// emits the next choice for a context. Emission order need not follow
/// offsets (the upload case ignores them), but an offset may be used to
/// request a new attempt at a previously served range.
///
/// Schedules mutate in place and are not thread-safe; the engine
/// serializes access to them.
pub trait Schedule {
    type Source;
    type Choice;

    fn set_source(&mut self, source: Self::Source);

    fn get(&mut self, context: &ScheduleContext) -> Result<Self::Choice, ScheduleError>;
}

/// Round-robin over the enabled depots. Never blocks: one full rotation
/// without an enabled depot fails with `NoCandidate`.
#[derive(Default)]
pub struct RoundRobinUpload {
    depots: DepotMap,
    ring: Vec<String>,
    cursor: usize,
}

impl Schedule for RoundRobinUpload {
    type Source = DepotMap;
    type Choice = String;

    fn set_source(&mut self, source: DepotMap) {
        self.ring = source.keys().cloned().collect();
        self.depots = source;
        self.cursor = 0;
    }

    fn get(&mut self, context: &ScheduleContext) -> Result<String, ScheduleError> {
        for _ in 0..self.ring.len() {
            let key = self.ring[self.cursor].clone();
            self.cursor = (self.cursor + 1) % self.ring.len();
            if self.depots.get(&key).is_some_and(|d| d.enabled) {
                return Ok(key);
            }
        }
        Err(ScheduleError::NoCandidate {
            offset: context.offset,
        })
    }
}

struct Slot {
    alloc: Allocation,
    retry: u32,
}

/// Replica-aware download schedule.
///
/// Slots are bucketed by their allocation's offset, in insertion order.
/// A request pops the tail of the exact-offset bucket; slots below the
/// retry limit are reinserted at the head so other replicas get tried
/// first on the next miss. When the exact bucket is empty, buckets at
/// lower offsets are scanned for a slot whose range covers the request.
#[derive(Default)]
pub struct ReplicaDownload {
    slots: BTreeMap<u64, Vec<Slot>>,
}

impl ReplicaDownload {
    fn bookkeep(bucket: &mut Vec<Slot>, mut slot: Slot) -> Option<Allocation> {
        if slot.retry < RETRY_LIMIT {
            slot.retry += 1;
            let alloc = slot.alloc.clone();
            bucket.insert(0, slot);
            return Some(alloc);
        }
        // Exhausted: the slot stays popped.
        None
    }
}

impl Schedule for ReplicaDownload {
    type Source = Vec<Allocation>;
    type Choice = Allocation;

    fn set_source(&mut self, source: Vec<Allocation>) {
        self.slots.clear();
        for alloc in source {
            self.slots
                .entry(alloc.offset)
                .or_default()
                .push(Slot { alloc, retry: 0 });
        }
    }

    fn get(&mut self, context: &ScheduleContext) -> Result<Allocation, ScheduleError> {
        let offset = context.offset;

        if let Some(bucket) = self.slots.get_mut(&offset) {
            while let Some(slot) = bucket.pop() {
                if let Some(alloc) = Self::bookkeep(bucket, slot) {
                    return Ok(alloc);
                }
            }
        }

        // No slot sits exactly at the offset; look for an earlier one
        // whose range covers it.
        let lower: Vec<u64> = self.slots.range(..offset).map(|(k, _)| *k).collect();
        for key in lower {
            let Some(bucket) = self.slots.get_mut(&key) else {
                continue;
            };
            while let Some(pos) = bucket.iter().position(|s| s.alloc.covers(offset)) {
                let slot = bucket.remove(pos);
                if let Some(alloc) = Self::bookkeep(bucket, slot) {
                    return Ok(alloc);
                }
            }
        }

        Err(ScheduleError::NoCandidate { offset })
    }
}
