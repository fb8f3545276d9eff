use std::collections::BTreeMap;
use rustc_hash::FxHashSet;

/// What a channel needs from whoever drives it: a clock and a way to get called again
pub trait UpdateScheduler {
    /// the service's logical clock in milliseconds
    fn time_now(&self) -> u64;

    /// requests an update pass for the channel as soon as possible
    fn add_to_update(&mut self, channel_id: u32);

    /// requests an update pass for the channel once the clock reaches `timestamp`
    fn add_to_next_time_update(&mut self, timestamp: u64, channel_id: u32);
}

/// Time-indexed wake queue. Channels re-register themselves on every update, so an id that
///  was registered several times is only woken once per sweep.
#[derive(Default)]
pub struct UpdateQueue {
    now: u64,
    immediate: FxHashSet<u32>,
    timed: BTreeMap<u64, Vec<u32>>,
}

impl UpdateQueue {
    pub fn new(now: u64) -> UpdateQueue {
        UpdateQueue {
            now,
            ..Default::default()
        }
    }

    /// The clock never goes backwards, even if the caller's time source does
    pub fn set_now(&mut self, now: u64) {
        self.now = self.now.max(now);
    }

    /// the earliest registered wake time, `now` if an immediate update is pending
    pub fn next_wake(&self) -> Option<u64> {
        if !self.immediate.is_empty() {
            return Some(self.now);
        }
        self.timed.keys().next().copied()
    }

    /// Removes and returns all ids that are due at the current time: immediate ones first, then
    ///  timed ones in wake order, each id at most once
    pub fn take_due(&mut self) -> Vec<u32> {
        let mut seen = FxHashSet::default();
        let mut result = Vec::new();

        let mut immediate: Vec<u32> = self.immediate.drain().collect();
        immediate.sort_unstable();
        for id in immediate {
            if seen.insert(id) {
                result.push(id);
            }
        }

        let not_due = self.timed.split_off(&self.now.saturating_add(1));
        let due = std::mem::replace(&mut self.timed, not_due);
        for id in due.into_values().flatten() {
            if seen.insert(id) {
                result.push(id);
            }
        }
        result
    }

    /// forgets all pending wakes for a channel that was disposed
    pub fn remove(&mut self, channel_id: u32) {
        self.immediate.remove(&channel_id);
        self.timed.retain(|_, ids| {
            ids.retain(|id| *id != channel_id);
            !ids.is_empty()
        });
    }
}

impl UpdateScheduler for UpdateQueue {
    fn time_now(&self) -> u64 {
        self.now
    }

    fn add_to_update(&mut self, channel_id: u32) {
        self.immediate.insert(channel_id);
    }

    fn add_to_next_time_update(&mut self, timestamp: u64, channel_id: u32) {
        self.timed.entry(timestamp)
            .or_default()
            .push(channel_id);
    }
}
