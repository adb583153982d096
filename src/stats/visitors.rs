use std::{collections::HashMap, time::Duration};

use tokio::time::Instant;

/// In-memory heartbeat table. Never persisted.
///
/// Liveness is evaluated lazily: an entry is only dropped when a read
/// observes it past the TTL, so the count can shrink only on reads.
#[derive(Debug)]
pub struct VisitorTable {
    ttl: Duration,
    last_heartbeat: HashMap<String, Instant>,
}

/// A heartbeat at `last` is live at `now` iff strictly less than `ttl` has elapsed.
pub fn is_active(last: Instant, now: Instant, ttl: Duration) -> bool {
    now.saturating_duration_since(last) < ttl
}

impl VisitorTable {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            last_heartbeat: HashMap::new(),
        }
    }

    pub fn record(&mut self, visitor_id: &str, now: Instant) {
        match self.last_heartbeat.get_mut(visitor_id) {
            Some(last) => *last = now,
            None => {
                self.last_heartbeat.insert(visitor_id.to_string(), now);
            }
        }
    }

    /// Prunes expired visitors and returns how many remain.
    pub fn active_count(&mut self, now: Instant) -> usize {
        let ttl = self.ttl;
        self.last_heartbeat
            .retain(|_, last| is_active(*last, now, ttl));
        self.last_heartbeat.len()
    }

    /// Entries currently held, including ones a read has not pruned yet.
    pub fn tracked(&self) -> usize {
        self.last_heartbeat.len()
    }
}
