use crate::connection::TimerId;

/// Capability contract for the per-dispatcher timer facility.
///
/// The dispatcher loop drives it with elapsed wall-clock deltas and uses
/// `next_due_in_ms` as the poll wait bound. Implementations are not required
/// to be thread-safe; a driver is owned exclusively by one dispatcher loop.
pub trait TimerDriver: Send {
    /// Advance the internal clock and return the ids of timers that fired,
    /// in due order. Repeating timers are re-armed from the current instant.
    fn advance(&mut self, elapsed_ms: u64) -> Vec<TimerId>;

    /// Milliseconds until the earliest pending timer, or -1 when none are
    /// pending (the poll may then wait indefinitely).
    fn next_due_in_ms(&self) -> i32;

    fn add(&mut self, id: TimerId, interval_ms: u64, repeating: bool);

    /// Remove a pending timer. Removing an unknown id is a no-op.
    fn remove(&mut self, id: TimerId) -> bool;
}

#[derive(Debug, Clone)]
struct TimerEntry {
    id: TimerId,
    due_ms: u64,
    interval_ms: u64,
    repeating: bool,
}

/// Simple monotonic timer queue keyed on a virtual clock.
///
/// Linear-scan implementation; dispatcher timer counts are small (heartbeat,
/// per-connection idle timers) so a heap buys nothing here.
#[derive(Debug, Default)]
pub struct DeadlineTimer {
    now_ms: u64,
    entries: Vec<TimerEntry>,
}

impl DeadlineTimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending_count(&self) -> usize {
        self.entries.len()
    }
}

impl TimerDriver for DeadlineTimer {
    fn advance(&mut self, elapsed_ms: u64) -> Vec<TimerId> {
        self.now_ms += elapsed_ms;
        let now = self.now_ms;

        let mut fired: Vec<(u64, TimerId)> = Vec::new();
        self.entries.retain_mut(|entry| {
            if entry.due_ms > now {
                return true;
            }
            fired.push((entry.due_ms, entry.id));
            if entry.repeating {
                entry.due_ms = now + entry.interval_ms;
                true
            } else {
                false
            }
        });

        fired.sort_by_key(|&(due, _)| due);
        fired.into_iter().map(|(_, id)| id).collect()
    }

    fn next_due_in_ms(&self) -> i32 {
        match self.entries.iter().map(|e| e.due_ms).min() {
            Some(due) => {
                let remaining = due.saturating_sub(self.now_ms);
                remaining.min(i32::MAX as u64) as i32
            }
            None => -1,
        }
    }

    fn add(&mut self, id: TimerId, interval_ms: u64, repeating: bool) {
        self.entries.push(TimerEntry {
            id,
            due_ms: self.now_ms + interval_ms,
            interval_ms,
            repeating,
        });
    }

    fn remove(&mut self, id: TimerId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.id != id);
        self.entries.len() != before
    }
}
