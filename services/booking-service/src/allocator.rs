// =============================================================================
// BOOKING ALLOCATOR
// =============================================================================
// Orchestrates a booking request: fare resolution, capacity reservation,
// seat assignment or waitlisting, persistence, notification.
//
// CONCURRENCY MODEL:
// - Each schedule has exactly one in-process owner: a `ScheduleBook`
//   behind its own tokio Mutex. Every operation on a schedule (reads
//   included) runs under that lock, so operations on one schedule are
//   serialised and operations on different schedules never contend.
// - Mutations are computed on a working copy, committed to the store as
//   one change set, and only then swapped in. A failed commit drops the
//   working copy, which rolls back the reservation.
// - Notifications go out after the lock is released.
// - The layout cache is written and invalidated only under the schedule's
//   lock, so no cached layout predates the schedule's latest commit.
// - A schedule gets a registry slot only once the catalog knows it. Idle
//   slots of departed schedules are evicted by `evict_idle`.
// =============================================================================

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard as StdMutexGuard};
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::inventory::ScheduleInventory;
use crate::layout_cache::{layout_cache_key, LayoutCache};
use crate::metrics;
use crate::models::{
    new_booking_reference, round_money, Booking, BookingStatus, CoachLayoutResponse,
    ConfirmationChance, CreateBookingRequest, FareQuote, FareQuoteResponse, Gender, Passenger,
    Quota, ScheduleInfo, WaitlistPositionResponse, WaitlistPriority,
};
use crate::notifier::{Notification, Notifier};
use crate::promotion::RefundPolicy;
use crate::seats::SeatMap;
use crate::store::{BookingStore, Catalog, ScheduleChanges, ScheduleSnapshot};
use crate::waitlist::WaitlistQueue;

// =============================================================================
// POLICY
// =============================================================================
#[derive(Debug, Clone)]
pub struct AllocationPolicy {
    pub quota_multipliers: HashMap<Quota, f64>,
    /// Passengers this age or older make a booking senior: waitlist
    /// priority 1 and eligibility for the Senior quota
    pub senior_citizen_age: i32,
    pub max_passengers_per_booking: usize,
    pub refund: RefundPolicy,
}

impl Default for AllocationPolicy {
    fn default() -> Self {
        Self {
            quota_multipliers: HashMap::from([
                (Quota::General, 1.00),
                (Quota::Ladies, 0.95),
                (Quota::Senior, 0.90),
                (Quota::Tatkal, 1.30),
            ]),
            senior_citizen_age: 58,
            max_passengers_per_booking: 6,
            refund: RefundPolicy::default(),
        }
    }
}

impl AllocationPolicy {
    pub fn multiplier(&self, quota: Quota) -> f64 {
        self.quota_multipliers.get(&quota).copied().unwrap_or(1.0)
    }

    pub fn fare_per_person(&self, base_fare: f64, quota: Quota) -> f64 {
        round_money(base_fare * self.multiplier(quota))
    }

    /// Checks that need no schedule state. Runs before any lock is taken,
    /// so a rejected request never touches inventory.
    pub fn validate(&self, request: &CreateBookingRequest) -> AppResult<()> {
        let count = request.passengers.len();
        if count == 0 {
            return Err(AppError::Validation("at least one passenger is required".into()));
        }
        if count > self.max_passengers_per_booking {
            return Err(AppError::Validation(format!(
                "at most {} passengers per booking, got {}",
                self.max_passengers_per_booking, count
            )));
        }
        for p in &request.passengers {
            if p.name.trim().is_empty() {
                return Err(AppError::Validation("passenger name must not be blank".into()));
            }
            if !(0..=120).contains(&p.age) {
                return Err(AppError::Validation(format!(
                    "passenger {} has invalid age {}",
                    p.name, p.age
                )));
            }
        }

        match request.selected_quota {
            Quota::Senior => {
                if let Some(p) = request.passengers.iter().find(|p| p.age < self.senior_citizen_age) {
                    return Err(AppError::QuotaNotEligible(format!(
                        "senior quota requires every passenger to be {} or older ({} is {})",
                        self.senior_citizen_age, p.name, p.age
                    )));
                }
            }
            Quota::Ladies => {
                if let Some(p) = request.passengers.iter().find(|p| p.gender != Gender::Female) {
                    return Err(AppError::QuotaNotEligible(format!(
                        "ladies quota requires every passenger to be female ({})",
                        p.name
                    )));
                }
            }
            Quota::General | Quota::Tatkal => {}
        }

        if !request.auto_assign_seats {
            if request.preferred_seats.is_empty() {
                return Err(AppError::Validation(
                    "preferred seats are required when auto-assignment is disabled".into(),
                ));
            }
            SeatMap::check_preference_shape(&request.preferred_seats, count)?;
        }
        Ok(())
    }
}

// =============================================================================
// SCHEDULE BOOK
// =============================================================================
// The authoritative in-memory state of one schedule.
// -----------------------------------------------------------------------------
#[derive(Debug, Clone)]
pub struct ScheduleBook {
    pub(crate) info: ScheduleInfo,
    pub(crate) inventory: ScheduleInventory,
    pub(crate) seats: SeatMap,
    pub(crate) bookings: HashMap<Uuid, Booking>,
    pub(crate) waitlist: WaitlistQueue,
    touched_bookings: BTreeSet<Uuid>,
    touched_entries: BTreeSet<Uuid>,
}

impl ScheduleBook {
    pub fn from_snapshot(info: ScheduleInfo, snapshot: ScheduleSnapshot) -> AppResult<Self> {
        if snapshot.inventory.schedule_id() != info.schedule_id {
            return Err(AppError::Consistency(format!(
                "inventory of schedule {} loaded for schedule {}",
                snapshot.inventory.schedule_id(),
                info.schedule_id
            )));
        }
        let seats = SeatMap::from_bookings(snapshot.inventory.total_seats(), &snapshot.bookings)?;
        Ok(Self {
            info,
            inventory: snapshot.inventory,
            seats,
            bookings: snapshot.bookings.into_iter().map(|b| (b.id, b)).collect(),
            waitlist: WaitlistQueue::new(snapshot.waitlist),
            touched_bookings: BTreeSet::new(),
            touched_entries: BTreeSet::new(),
        })
    }

    pub(crate) fn touch_booking(&mut self, booking_id: Uuid) {
        self.touched_bookings.insert(booking_id);
    }

    pub(crate) fn touch_entry(&mut self, entry_id: Uuid) {
        self.touched_entries.insert(entry_id);
    }

    /// Drain the touched records into a change set.
    fn take_changes(&mut self) -> ScheduleChanges {
        let bookings = std::mem::take(&mut self.touched_bookings)
            .into_iter()
            .filter_map(|id| self.bookings.get(&id).cloned())
            .collect();
        let waitlist = std::mem::take(&mut self.touched_entries)
            .into_iter()
            .filter_map(|id| self.waitlist.get(id).cloned())
            .collect();
        ScheduleChanges {
            schedule_id: self.info.schedule_id,
            available_seats: self.inventory.available_seats(),
            bookings,
            waitlist,
        }
    }

    /// The booking, provided `user_id` owns it. Someone else's booking is
    /// reported exactly like a missing one.
    pub(crate) fn owned_booking(&self, user_id: &str, booking_id: Uuid) -> AppResult<&Booking> {
        self.bookings
            .get(&booking_id)
            .filter(|b| b.user_id == user_id)
            .ok_or_else(|| AppError::NotFound(format!("booking {}", booking_id)))
    }

    fn waitlist_status(&self, booking: &Booking) -> WaitlistPositionResponse {
        let Some(entry) = self.waitlist.active_for_booking(booking.id) else {
            return WaitlistPositionResponse {
                booking_id: booking.id,
                status: booking.status,
                position: 0,
                total_waiting: 0,
                priority: None,
                estimated_confirmation: None,
            };
        };

        let seats_ahead: i32 = self
            .waitlist
            .ahead_of(entry)
            .filter_map(|e| self.bookings.get(&e.booking_id))
            .map(|b| b.passenger_count)
            .sum();

        WaitlistPositionResponse {
            booking_id: booking.id,
            status: booking.status,
            position: entry.position,
            total_waiting: self.waitlist.group_len(&entry.train_class, entry.priority) as i32,
            priority: Some(entry.priority),
            estimated_confirmation: Some(estimate_confirmation(
                seats_ahead + booking.passenger_count,
                self.inventory.total_seats(),
            )),
        }
    }
}

/// Share of the coach that must free up before this booking is served.
pub fn estimate_confirmation(seats_needed: i32, total_seats: i32) -> ConfirmationChance {
    if total_seats <= 0 {
        return ConfirmationChance::Low;
    }
    let share = f64::from(seats_needed) / f64::from(total_seats);
    if share <= 0.10 {
        ConfirmationChance::High
    } else if share <= 0.25 {
        ConfirmationChance::Medium
    } else {
        ConfirmationChance::Low
    }
}

pub(crate) fn loaded(slot: &Option<ScheduleBook>) -> AppResult<&ScheduleBook> {
    slot.as_ref()
        .ok_or_else(|| AppError::Internal("schedule slot used before loading".into()))
}

// =============================================================================
// ALLOCATOR
// =============================================================================

type ScheduleSlot = Arc<Mutex<Option<ScheduleBook>>>;
pub(crate) type ScheduleGuard = OwnedMutexGuard<Option<ScheduleBook>>;

const MAX_REFERENCE_ATTEMPTS: usize = 16;

/// Result of a successful CreateBooking.
#[derive(Debug, Clone)]
pub struct BookingOutcome {
    pub booking: Booking,
    pub waitlist_position: Option<i32>,
}

pub struct BookingAllocator {
    store: Arc<dyn BookingStore>,
    catalog: Arc<dyn Catalog>,
    notifier: Arc<dyn Notifier>,
    policy: AllocationPolicy,
    layout_cache: Option<Arc<dyn LayoutCache>>,
    slots: StdMutex<HashMap<Uuid, ScheduleSlot>>,
}

impl BookingAllocator {
    pub fn new(
        store: Arc<dyn BookingStore>,
        catalog: Arc<dyn Catalog>,
        notifier: Arc<dyn Notifier>,
        policy: AllocationPolicy,
    ) -> Self {
        Self {
            store,
            catalog,
            notifier,
            policy,
            layout_cache: None,
            slots: StdMutex::new(HashMap::new()),
        }
    }

    pub fn with_layout_cache(mut self, cache: Arc<dyn LayoutCache>) -> Self {
        self.layout_cache = Some(cache);
        self
    }

    pub fn policy(&self) -> &AllocationPolicy {
        &self.policy
    }

    // -------------------------------------------------------------------------
    // SCHEDULE OWNERSHIP
    // -------------------------------------------------------------------------

    fn registry(&self) -> AppResult<StdMutexGuard<'_, HashMap<Uuid, ScheduleSlot>>> {
        self.slots
            .lock()
            .map_err(|_| AppError::Internal("schedule registry poisoned".into()))
    }

    /// Acquire the schedule's lock, loading it from the store on first use.
    pub(crate) async fn lock_schedule(&self, schedule_id: Uuid) -> AppResult<ScheduleGuard> {
        let existing = self.registry()?.get(&schedule_id).cloned();
        let slot = match existing {
            Some(slot) => slot,
            None => {
                // Unknown ids never get a slot.
                if self.catalog.schedule(schedule_id).await?.is_none() {
                    return Err(AppError::NotFound(format!("schedule {}", schedule_id)));
                }
                let mut slots = self.registry()?;
                let slot = Arc::clone(slots.entry(schedule_id).or_default());
                slot
            }
        };

        let mut guard = slot.lock_owned().await;
        if guard.is_none() {
            let info = self
                .catalog
                .schedule(schedule_id)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("schedule {}", schedule_id)))?;
            let snapshot = self
                .store
                .load_schedule(schedule_id)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("schedule {}", schedule_id)))?;

            tracing::debug!(
                schedule_id = %schedule_id,
                bookings = snapshot.bookings.len(),
                occupied = snapshot.inventory.occupied_seats(),
                available = snapshot.inventory.available_seats(),
                "Loaded schedule"
            );
            *guard = Some(ScheduleBook::from_snapshot(info, snapshot)?);
        }
        Ok(guard)
    }

    /// Drop registry slots nobody holds whose schedule has departed or never
    /// loaded. The next use of such a schedule reloads it from the store.
    /// Returns the number of slots dropped.
    pub fn evict_idle(&self, now: DateTime<Utc>) -> AppResult<usize> {
        let mut slots = self.registry()?;
        let before = slots.len();
        // Clones are only taken under the registry lock, so a count of one
        // means no task can be waiting on this slot.
        slots.retain(|_, slot| {
            if Arc::strong_count(slot) > 1 {
                return true;
            }
            match slot.try_lock() {
                Ok(book) => matches!(&*book, Some(book) if book.info.departure_at > now),
                Err(_) => true,
            }
        });
        Ok(before - slots.len())
    }

    #[cfg(test)]
    pub(crate) fn registered_schedules(&self) -> usize {
        self.slots.lock().map(|slots| slots.len()).unwrap_or_default()
    }

    /// Persist a working copy and make it the schedule's state. On failure
    /// the previous state stays in place.
    pub(crate) async fn commit(&self, guard: &mut ScheduleGuard, mut working: ScheduleBook) -> AppResult<()> {
        let changes = working.take_changes();
        let start = Instant::now();

        if let Err(e) = self.store.commit(&changes).await {
            tracing::error!(
                schedule_id = %changes.schedule_id,
                error = %e,
                "Commit failed; allocation discarded"
            );
            return Err(e);
        }

        metrics::record_commit(start.elapsed().as_secs_f64());
        metrics::set_available_seats(changes.schedule_id, changes.available_seats);
        let cache_key = layout_cache_key(changes.schedule_id, &working.info.train_class);
        **guard = Some(working);

        // Still under the lock: no layout read can re-cache the old state.
        if let Some(cache) = &self.layout_cache {
            cache.invalidate(&cache_key).await;
        }
        Ok(())
    }

    /// Deliver notifications in the background.
    pub(crate) fn dispatch(&self, notifications: Vec<Notification>) {
        if notifications.is_empty() {
            return;
        }
        let notifier = Arc::clone(&self.notifier);
        tokio::spawn(async move {
            for notification in notifications {
                notifier.notify(notification).await;
            }
        });
    }

    // -------------------------------------------------------------------------
    // CREATE BOOKING
    // -------------------------------------------------------------------------

    pub async fn create_booking(
        &self,
        user_id: &str,
        request: CreateBookingRequest,
    ) -> AppResult<BookingOutcome> {
        let result = self.allocate(user_id, request).await;
        match &result {
            Ok(outcome) => {
                metrics::record_booking(outcome.booking.status.as_str());
                self.dispatch(vec![Notification::booking_created(
                    &outcome.booking,
                    outcome.waitlist_position,
                )]);
            }
            Err(_) => metrics::record_booking("rejected"),
        }
        result
    }

    async fn allocate(&self, user_id: &str, request: CreateBookingRequest) -> AppResult<BookingOutcome> {
        self.policy.validate(&request)?;

        let schedule_id = request.schedule_id;
        let mut guard = self.lock_schedule(schedule_id).await?;
        let mut working = loaded(&guard)?.clone();

        let now = Utc::now();
        if now >= working.info.departure_at {
            return Err(AppError::Validation(format!(
                "schedule {} departed at {}",
                schedule_id, working.info.departure_at
            )));
        }

        let preferred = (!request.auto_assign_seats).then_some(request.preferred_seats.as_slice());
        if let Some(preferred) = preferred {
            working.seats.check_preference_range(preferred)?;
        }

        let passenger_count = request.passengers.len() as i32;
        let fare = self.policy.fare_per_person(working.info.base_fare, request.selected_quota);
        let passengers: Vec<Passenger> = request
            .passengers
            .iter()
            .map(|p| Passenger {
                id: Uuid::new_v4(),
                name: p.name.trim().to_string(),
                age: p.age,
                gender: p.gender,
                seat_number: None,
            })
            .collect();

        let booking_id = Uuid::new_v4();
        let booking_reference = self.fresh_reference(&working).await?;

        let mut booking = Booking {
            id: booking_id,
            user_id: user_id.to_string(),
            schedule_id,
            passenger_count,
            total_amount: round_money(fare * f64::from(passenger_count)),
            booking_reference,
            status: BookingStatus::Waitlisted,
            quota: request.selected_quota,
            cancellation_reason: None,
            created_at: now,
            cancelled_at: None,
            passengers,
        };

        // Whole booking confirmed, or whole booking waitlisted.
        let waitlist_position = if working.inventory.try_reserve(passenger_count) {
            let seats = match preferred {
                Some(preferred) => working.seats.assign_preferred(preferred)?,
                None => working.seats.assign_auto(passenger_count)?,
            };
            booking.assign_seats(&seats)?;
            booking.status = BookingStatus::Confirmed; // initial state, not a transition
            None
        } else {
            let priority = if booking.has_passenger_aged(self.policy.senior_citizen_age) {
                WaitlistPriority::SeniorCitizen
            } else {
                WaitlistPriority::Regular
            };
            let train_class = working.info.train_class.clone();
            let entry = working
                .waitlist
                .enqueue(booking_id, schedule_id, &train_class, priority, now);
            working.touch_entry(entry.id);
            Some(entry.position)
        };

        working.bookings.insert(booking_id, booking.clone());
        working.touch_booking(booking_id);

        let train_class = working.info.train_class.clone();
        let available = working.inventory.available_seats();
        self.commit(&mut guard, working).await?;
        drop(guard);

        tracing::info!(
            schedule_id = %schedule_id,
            train_class = %train_class,
            booking_id = %booking.id,
            reference = %booking.booking_reference,
            status = booking.status.as_str(),
            passengers = passenger_count,
            waitlist_position = ?waitlist_position,
            available,
            "Booking allocated"
        );

        Ok(BookingOutcome {
            booking,
            waitlist_position,
        })
    }

    /// A reference no booking on any schedule carries yet.
    async fn fresh_reference(&self, book: &ScheduleBook) -> AppResult<String> {
        for _ in 0..MAX_REFERENCE_ATTEMPTS {
            let candidate = new_booking_reference();
            if book.bookings.values().any(|b| b.booking_reference == candidate) {
                continue;
            }
            if !self.store.reference_taken(&candidate).await? {
                return Ok(candidate);
            }
        }
        Err(AppError::Consistency(format!(
            "no free booking reference after {} attempts",
            MAX_REFERENCE_ATTEMPTS
        )))
    }

    // -------------------------------------------------------------------------
    // READ-SIDE PROJECTIONS
    // -------------------------------------------------------------------------

    pub async fn booking(&self, user_id: &str, booking_id: Uuid) -> AppResult<Booking> {
        let guard = self.lock_for_booking(booking_id).await?;
        let booking = loaded(&guard)?.owned_booking(user_id, booking_id)?.clone();
        Ok(booking)
    }

    /// Seat map of a schedule; only Confirmed bookings occupy seats.
    /// Served from the layout cache when one is configured.
    pub async fn coach_layout(&self, schedule_id: Uuid, train_class: &str) -> AppResult<CoachLayoutResponse> {
        let cache_key = layout_cache_key(schedule_id, train_class);
        if let Some(cache) = &self.layout_cache {
            if let Some(layout) = cache.get(&cache_key).await {
                return Ok(layout);
            }
        }

        let guard = self.lock_schedule(schedule_id).await?;
        let book = loaded(&guard)?;
        if !book.info.train_class.eq_ignore_ascii_case(train_class.trim()) {
            return Err(AppError::NotFound(format!(
                "class {} on schedule {}",
                train_class, schedule_id
            )));
        }
        let layout = CoachLayoutResponse {
            schedule_id,
            train_class: book.info.train_class.clone(),
            total_seats: book.inventory.total_seats(),
            available_seats: book.inventory.available_seats(),
            seats: book.seats.layout(),
        };
        if let Some(cache) = &self.layout_cache {
            cache.put(&cache_key, &layout).await;
        }
        drop(guard);
        Ok(layout)
    }

    pub async fn waitlist_position(&self, user_id: &str, booking_id: Uuid) -> AppResult<WaitlistPositionResponse> {
        let guard = self.lock_for_booking(booking_id).await?;
        let book = loaded(&guard)?;
        let booking = book.owned_booking(user_id, booking_id)?;
        Ok(book.waitlist_status(booking))
    }

    /// Position of the user's earliest still-waiting booking on a schedule.
    pub async fn waitlist_position_for_user(
        &self,
        schedule_id: Uuid,
        user_id: &str,
    ) -> AppResult<WaitlistPositionResponse> {
        let guard = self.lock_schedule(schedule_id).await?;
        let book = loaded(&guard)?;
        let earliest = book
            .bookings
            .values()
            .filter(|b| b.user_id == user_id && b.status == BookingStatus::Waitlisted)
            .min_by_key(|b| b.created_at)
            .ok_or_else(|| {
                AppError::NotFound(format!("no waitlisted booking on schedule {}", schedule_id))
            })?;
        let status = book.waitlist_status(earliest);
        Ok(status)
    }

    /// Per-quota fare for one seat on a schedule.
    pub async fn fare_quote(&self, schedule_id: Uuid) -> AppResult<FareQuoteResponse> {
        let info = self
            .catalog
            .schedule(schedule_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("schedule {}", schedule_id)))?;
        let fares = Quota::ALL
            .into_iter()
            .map(|quota| FareQuote {
                quota,
                multiplier: self.policy.multiplier(quota),
                fare_per_person: self.policy.fare_per_person(info.base_fare, quota),
            })
            .collect();
        Ok(FareQuoteResponse {
            schedule_id,
            service_name: info.service_name,
            departure_at: info.departure_at,
            base_fare: info.base_fare,
            fares,
        })
    }

    pub(crate) async fn lock_for_booking(&self, booking_id: Uuid) -> AppResult<ScheduleGuard> {
        let schedule_id = self
            .store
            .booking_schedule(booking_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("booking {}", booking_id)))?;
        self.lock_schedule(schedule_id).await
    }
}
