use std::collections::{BTreeSet, HashMap};

/// Tracks which offsets of each partition are still being processed, so a stored
/// offset never moves past a message that has not been acknowledged.
///
/// Messages are processed concurrently and complete out of order. Kafka only keeps a
/// single position per partition, so storing the offset of a late message while an
/// earlier one is still running (or failed) would skip the earlier one on restart.
#[derive(Debug, Default)]
pub struct OffsetTracker {
    partitions: HashMap<i32, PartitionOffsets>,
}

#[derive(Debug, Default)]
struct PartitionOffsets {
    in_flight: BTreeSet<i64>,
    completed: BTreeSet<i64>,
    stored: Option<i64>,
}

impl OffsetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that a message was handed out for processing.
    pub fn received(&mut self, partition: i32, offset: i64) {
        self.partitions
            .entry(partition)
            .or_default()
            .in_flight
            .insert(offset);
    }

    /// Record that a message was acknowledged. Returns the position to store for the
    /// partition, i.e. the offset of the next message to read after every contiguously
    /// acknowledged one, or `None` if that position did not advance.
    pub fn completed(&mut self, partition: i32, offset: i64) -> Option<i64> {
        let state = self.partitions.get_mut(&partition)?;
        if !state.in_flight.remove(&offset) {
            return None;
        }
        state.completed.insert(offset);

        let safe = match state.in_flight.first() {
            Some(lowest_pending) => state.completed.range(..*lowest_pending).next_back(),
            None => state.completed.last(),
        }
        .copied()?;

        state.completed = state.completed.split_off(&(safe + 1));

        let next = safe + 1;
        if state.stored.is_some_and(|stored| stored >= next) {
            return None;
        }
        state.stored = Some(next);
        Some(next)
    }

    /// Number of messages of the partition that are received but not acknowledged.
    pub fn in_flight(&self, partition: i32) -> usize {
        self.partitions
            .get(&partition)
            .map_or(0, |state| state.in_flight.len())
    }
}
