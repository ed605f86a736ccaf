// =============================================================================
// SCHEDULE INVENTORY
// =============================================================================
// Seat counters for one schedule instance.
//
// `available_seats` changes only through `try_reserve` and `release`. The
// struct is only ever reachable through the schedule's lock (see
// allocator.rs), which makes each call indivisible for concurrent callers
// on the same schedule.
// =============================================================================

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleInventory {
    schedule_id: Uuid,
    total_seats: i32,
    available_seats: i32,
}

impl ScheduleInventory {
    /// A freshly published schedule: every seat available.
    pub fn new(schedule_id: Uuid, total_seats: i32) -> Self {
        Self {
            schedule_id,
            total_seats,
            available_seats: total_seats,
        }
    }

    /// Rebuild from stored counters, rejecting values outside 0..=total.
    pub fn restore(schedule_id: Uuid, total_seats: i32, available_seats: i32) -> AppResult<Self> {
        if total_seats < 0 || available_seats < 0 || available_seats > total_seats {
            return Err(AppError::Consistency(format!(
                "schedule {} has available={} total={}",
                schedule_id, available_seats, total_seats
            )));
        }
        Ok(Self {
            schedule_id,
            total_seats,
            available_seats,
        })
    }

    pub fn schedule_id(&self) -> Uuid {
        self.schedule_id
    }

    pub fn total_seats(&self) -> i32 {
        self.total_seats
    }

    pub fn available_seats(&self) -> i32 {
        self.available_seats
    }

    pub fn occupied_seats(&self) -> i32 {
        self.total_seats - self.available_seats
    }

    /// Take `n` seats if at least `n` are available. Leaves the counters
    /// untouched and returns false otherwise.
    pub fn try_reserve(&mut self, n: i32) -> bool {
        if n <= 0 || self.available_seats < n {
            return false;
        }
        self.available_seats -= n;
        true
    }

    /// Give back `n` seats, never exceeding `total_seats`.
    pub fn release(&mut self, n: i32) {
        if n <= 0 {
            return;
        }
        let restored = self.available_seats.saturating_add(n);
        if restored > self.total_seats {
            tracing::warn!(
                schedule_id = %self.schedule_id,
                available = self.available_seats,
                released = n,
                total = self.total_seats,
                "Release would exceed capacity; clamping"
            );
        }
        self.available_seats = restored.min(self.total_seats);
    }
}
