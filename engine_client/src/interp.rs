//! Interpolation.
//!
//! The server sends discrete entity state lists at tick boundaries.
//! The client renders at its own rate and interpolates between the last two.

use std::{collections::VecDeque, time::Instant};

use engine_shared::{math::Vec3, protocol::EntityState};

/// One received `set_states` call.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub received: Instant,
    pub entities: Vec<EntityState>,
}

/// Buffered snapshot history for interpolation.
#[derive(Default)]
pub struct SnapshotBuffer {
    history: VecDeque<Snapshot>,
    max: usize,
}

impl SnapshotBuffer {
    pub fn new(max: usize) -> Self {
        Self {
            history: VecDeque::new(),
            max,
        }
    }

    pub fn push(&mut self, snap: Snapshot) {
        self.history.push_back(snap);
        while self.history.len() > self.max {
            self.history.pop_front();
        }
    }

    /// Returns the number of buffered snapshots.
    pub fn len(&self) -> usize {
        self.history.len()
    }

    /// Returns true if no snapshots are buffered.
    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn clear(&mut self) {
        self.history.clear();
    }

    /// Gets an interpolated position for an entity given a fractional alpha.
    ///
    /// `alpha` should be in $[0,1]$ where 0 = older snapshot, 1 = newer.
    pub fn interp_entity(&self, entity: i64, alpha: f64) -> Option<Vec3> {
        if self.history.len() < 2 {
            return None;
        }
        let a = &self.history[self.history.len() - 2];
        let b = &self.history[self.history.len() - 1];

        let pa = find_entity(a, entity).map(|e| e.position);
        let pb = find_entity(b, entity).map(|e| e.position);
        match (pa, pb) {
            (Some(pa), Some(pb)) => Some(pa.lerp(pb, alpha)),
            _ => None,
        }
    }

    pub fn last_snapshot(&self) -> Option<&Snapshot> {
        self.history.back()
    }
}

/// Convenience: find entity state in a snapshot.
pub fn find_entity(snap: &Snapshot, id: i64) -> Option<&EntityState> {
    snap.entities.iter().find(|e| e.id == id)
}
