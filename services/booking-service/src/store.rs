// =============================================================================
// STORE MODULE
// =============================================================================
// Persistence seams of the allocation engine.
//
// - `BookingStore`: loads one schedule's inventory, bookings and waitlist,
//   and commits a change set for that schedule as one all-or-nothing unit
// - `Catalog`: read-only schedule facts (departure, class, base fare)
//
// Postgres implements both in db.rs. `MemoryStore` below implements both
// for tests and for running without a database.
// =============================================================================

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::inventory::ScheduleInventory;
use crate::models::{Booking, ScheduleInfo, WaitlistEntry};
use crate::seats::MAX_COACH_SEATS;

/// Everything the engine needs to own a schedule.
#[derive(Debug, Clone)]
pub struct ScheduleSnapshot {
    pub inventory: ScheduleInventory,
    pub bookings: Vec<Booking>,
    pub waitlist: Vec<WaitlistEntry>,
}

/// The outcome of one allocation operation on one schedule. Bookings and
/// waitlist entries are upserted whole.
#[derive(Debug, Clone, Default)]
pub struct ScheduleChanges {
    pub schedule_id: Uuid,
    pub available_seats: i32,
    pub bookings: Vec<Booking>,
    pub waitlist: Vec<WaitlistEntry>,
}

#[async_trait]
pub trait BookingStore: Send + Sync {
    async fn load_schedule(&self, schedule_id: Uuid) -> AppResult<Option<ScheduleSnapshot>>;

    /// Which schedule a booking belongs to.
    async fn booking_schedule(&self, booking_id: Uuid) -> AppResult<Option<Uuid>>;

    /// Whether any booking, on any schedule, already carries this reference.
    async fn reference_taken(&self, reference: &str) -> AppResult<bool>;

    /// Apply every change or none of them.
    async fn commit(&self, changes: &ScheduleChanges) -> AppResult<()>;

    async fn health_check(&self) -> bool;
}

#[async_trait]
pub trait Catalog: Send + Sync {
    async fn schedule(&self, schedule_id: Uuid) -> AppResult<Option<ScheduleInfo>>;
}

/// Reject coaches the seat assignor cannot scan.
pub fn validate_capacity(total_seats: i32) -> AppResult<()> {
    if !(1..=MAX_COACH_SEATS).contains(&total_seats) {
        return Err(AppError::Validation(format!(
            "a schedule must have between 1 and {} seats, got {}",
            MAX_COACH_SEATS, total_seats
        )));
    }
    Ok(())
}

// =============================================================================
// SAMPLE DATA
// =============================================================================
/// Schedules published on a fresh install, with their seat counts.
pub fn sample_schedules(now: DateTime<Utc>) -> Vec<(ScheduleInfo, i32)> {
    let schedule = |n: u128, name: &str, origin: &str, destination: &str, class: &str, hours: i64, fare: f64| {
        ScheduleInfo {
            schedule_id: Uuid::from_u128(0x5c4e_d01e_0000_0000_0000_0000_0000_0000 + n),
            service_name: name.to_string(),
            origin: origin.to_string(),
            destination: destination.to_string(),
            train_class: class.to_string(),
            departure_at: now + Duration::hours(hours),
            base_fare: fare,
        }
    };

    vec![
        (schedule(1, "12951 Rajdhani Express", "NDLS", "MMCT", "3A", 48, 2450.0), 64),
        (schedule(2, "12002 Shatabdi Express", "NDLS", "BPL", "CC", 24, 1255.0), 78),
        (schedule(3, "22436 Vande Bharat", "NDLS", "BSB", "EC", 72, 3310.0), 52),
        (schedule(4, "14005 Lichchavi Express", "SMI", "ANVT", "SL", 6, 455.0), 4),
    ]
}

// =============================================================================
// IN-MEMORY STORE
// =============================================================================

#[derive(Debug, Default)]
struct MemoryState {
    schedules: HashMap<Uuid, ScheduleInfo>,
    inventory: HashMap<Uuid, ScheduleInventory>,
    bookings: HashMap<Uuid, Booking>,
    waitlist: HashMap<Uuid, WaitlistEntry>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store pre-loaded with `sample_schedules`.
    pub async fn seeded() -> AppResult<Self> {
        let store = Self::new();
        for (info, total_seats) in sample_schedules(Utc::now()) {
            store.publish_schedule(info, total_seats).await?;
        }
        Ok(store)
    }

    /// Make a schedule bookable with all seats available.
    pub async fn publish_schedule(&self, info: ScheduleInfo, total_seats: i32) -> AppResult<()> {
        validate_capacity(total_seats)?;
        let mut state = self.state.write().await;
        let id = info.schedule_id;
        state.inventory.insert(id, ScheduleInventory::new(id, total_seats));
        state.schedules.insert(id, info);
        Ok(())
    }

    #[cfg(test)]
    pub async fn stored_booking(&self, booking_id: Uuid) -> Option<Booking> {
        self.state.read().await.bookings.get(&booking_id).cloned()
    }

    #[cfg(test)]
    pub async fn stored_available(&self, schedule_id: Uuid) -> Option<i32> {
        self.state
            .read()
            .await
            .inventory
            .get(&schedule_id)
            .map(|inv| inv.available_seats())
    }
}

#[async_trait]
impl BookingStore for MemoryStore {
    async fn load_schedule(&self, schedule_id: Uuid) -> AppResult<Option<ScheduleSnapshot>> {
        let state = self.state.read().await;
        let Some(inventory) = state.inventory.get(&schedule_id).cloned() else {
            return Ok(None);
        };

        let mut bookings: Vec<Booking> = state
            .bookings
            .values()
            .filter(|b| b.schedule_id == schedule_id)
            .cloned()
            .collect();
        bookings.sort_by_key(|b| b.created_at);

        let mut waitlist: Vec<WaitlistEntry> = state
            .waitlist
            .values()
            .filter(|e| e.schedule_id == schedule_id)
            .cloned()
            .collect();
        waitlist.sort_by_key(|e| e.queued_at);

        Ok(Some(ScheduleSnapshot {
            inventory,
            bookings,
            waitlist,
        }))
    }

    async fn booking_schedule(&self, booking_id: Uuid) -> AppResult<Option<Uuid>> {
        Ok(self
            .state
            .read()
            .await
            .bookings
            .get(&booking_id)
            .map(|b| b.schedule_id))
    }

    async fn reference_taken(&self, reference: &str) -> AppResult<bool> {
        Ok(self
            .state
            .read()
            .await
            .bookings
            .values()
            .any(|b| b.booking_reference == reference))
    }

    async fn commit(&self, changes: &ScheduleChanges) -> AppResult<()> {
        let mut state = self.state.write().await;

        // Validate everything before touching anything.
        let inventory = state.inventory.get(&changes.schedule_id).ok_or_else(|| {
            AppError::NotFound(format!("schedule {}", changes.schedule_id))
        })?;
        let updated = ScheduleInventory::restore(
            changes.schedule_id,
            inventory.total_seats(),
            changes.available_seats,
        )?;
        for booking in &changes.bookings {
            let clash = state.bookings.values().any(|existing| {
                existing.id != booking.id && existing.booking_reference == booking.booking_reference
            });
            if clash {
                return Err(AppError::Internal(format!(
                    "duplicate booking reference {}",
                    booking.booking_reference
                )));
            }
        }

        state.inventory.insert(changes.schedule_id, updated);
        for booking in &changes.bookings {
            state.bookings.insert(booking.id, booking.clone());
        }
        for entry in &changes.waitlist {
            state.waitlist.insert(entry.id, entry.clone());
        }
        Ok(())
    }

    async fn health_check(&self) -> bool {
        true
    }
}

#[async_trait]
impl Catalog for MemoryStore {
    async fn schedule(&self, schedule_id: Uuid) -> AppResult<Option<ScheduleInfo>> {
        Ok(self.state.read().await.schedules.get(&schedule_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_seeded_store_publishes_samples() {
        let store = MemoryStore::seeded().await.unwrap();
        let (info, seats) = sample_schedules(Utc::now()).remove(0);

        let snapshot = store.load_schedule(info.schedule_id).await.unwrap().unwrap();
        assert_eq!(snapshot.inventory.total_seats(), seats);
        assert_eq!(snapshot.inventory.available_seats(), seats);
        assert!(snapshot.bookings.is_empty());
        assert!(store.schedule(info.schedule_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_unknown_schedule_loads_as_none() {
        let store = MemoryStore::new();
        assert!(store.load_schedule(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_commit_rejects_out_of_range_counter_without_applying() {
        let store = MemoryStore::seeded().await.unwrap();
        let (info, seats) = sample_schedules(Utc::now()).remove(0);

        let changes = ScheduleChanges {
            schedule_id: info.schedule_id,
            available_seats: seats + 1,
            ..Default::default()
        };
        assert!(store.commit(&changes).await.is_err());
        assert_eq!(store.stored_available(info.schedule_id).await, Some(seats));
    }

    #[test]
    fn test_validate_capacity() {
        assert!(validate_capacity(0).is_err());
        assert!(validate_capacity(1).is_ok());
        assert!(validate_capacity(MAX_COACH_SEATS).is_ok());
        assert!(validate_capacity(MAX_COACH_SEATS + 1).is_err());
    }
}
