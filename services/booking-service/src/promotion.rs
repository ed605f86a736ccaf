// =============================================================================
// CANCELLATION & PROMOTION
// =============================================================================
// Cancelling a booking clears its seats, returns its capacity to the
// schedule and, when that capacity was real (the booking was Confirmed),
// walks the waitlist to confirm as many queued bookings as now fit.
//
// PROMOTION RULES:
// - Entries are visited by (priority, position)
// - An entry that does not fit is skipped, and the scan continues: a
//   smaller booking further back may still fit the remainder
// - Promoted bookings get auto-assigned seats; preferences are not kept
// - Remaining active entries are renumbered 1..k per stratum afterwards
// =============================================================================

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::allocator::{loaded, BookingAllocator, ScheduleBook};
use crate::error::{AppError, AppResult};
use crate::metrics;
use crate::models::{round_money, Booking, BookingStatus};
use crate::notifier::Notification;

// =============================================================================
// REFUND POLICY
// =============================================================================
/// Two fixed tiers: less than `late_window_minutes` before departure
/// refunds `late_refund_pct`, anything earlier refunds `standard_refund_pct`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RefundPolicy {
    pub late_window_minutes: i64,
    pub late_refund_pct: f64,
    pub standard_refund_pct: f64,
}

impl Default for RefundPolicy {
    fn default() -> Self {
        Self {
            late_window_minutes: 30,
            late_refund_pct: 0.40,
            standard_refund_pct: 0.80,
        }
    }
}

impl RefundPolicy {
    pub fn refund_pct(&self, time_to_departure: Duration) -> f64 {
        if time_to_departure < Duration::minutes(self.late_window_minutes) {
            self.late_refund_pct
        } else {
            self.standard_refund_pct
        }
    }
}

/// Result of a successful CancelBooking.
#[derive(Debug, Clone)]
pub struct CancellationOutcome {
    pub booking: Booking,
    pub refund_pct: f64,
    pub refund_amount: f64,
    /// Waitlisted bookings confirmed by the freed capacity
    pub promoted: Vec<Booking>,
}

// =============================================================================
// PROMOTION
// =============================================================================
impl ScheduleBook {
    /// Confirm waitlisted bookings into the schedule's free capacity.
    /// Returns the promoted booking ids in service order.
    pub(crate) fn promote(&mut self, now: DateTime<Utc>) -> AppResult<Vec<Uuid>> {
        let mut promoted = Vec::new();

        for entry in self.waitlist.service_order() {
            if self.inventory.available_seats() == 0 {
                break;
            }
            let count = self
                .bookings
                .get(&entry.booking_id)
                .map(|b| b.passenger_count)
                .ok_or_else(|| {
                    AppError::Consistency(format!(
                        "waitlist entry {} points at missing booking {}",
                        entry.id, entry.booking_id
                    ))
                })?;

            if !self.inventory.try_reserve(count) {
                continue;
            }
            let seats = self.seats.assign_auto(count)?;

            let booking = self.bookings.get_mut(&entry.booking_id).ok_or_else(|| {
                AppError::Consistency(format!("booking {} vanished", entry.booking_id))
            })?;
            booking.transition_to(BookingStatus::Confirmed)?;
            booking.assign_seats(&seats)?;

            self.waitlist.mark_confirmed(entry.id, now);
            self.touch_booking(entry.booking_id);
            self.touch_entry(entry.id);
            promoted.push(entry.booking_id);
        }

        for entry_id in self.waitlist.rerank() {
            self.touch_entry(entry_id);
        }
        Ok(promoted)
    }
}

// =============================================================================
// CANCELLATION
// =============================================================================
impl BookingAllocator {
    pub async fn cancel_booking(
        &self,
        user_id: &str,
        booking_id: Uuid,
        reason: Option<String>,
    ) -> AppResult<CancellationOutcome> {
        self.cancel_booking_at(user_id, booking_id, reason, Utc::now())
            .await
    }

    pub(crate) async fn cancel_booking_at(
        &self,
        user_id: &str,
        booking_id: Uuid,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> AppResult<CancellationOutcome> {
        let mut guard = self.lock_for_booking(booking_id).await?;
        let book = loaded(&guard)?;

        let previous_status = book.owned_booking(user_id, booking_id)?.status;
        if previous_status == BookingStatus::Cancelled {
            return Err(AppError::AlreadyCancelled(booking_id));
        }

        let departure = book.info.departure_at;
        if now >= departure {
            return Err(AppError::DepartureElapsed(departure));
        }
        let refund_pct = self.policy().refund.refund_pct(departure - now);

        let mut working = book.clone();
        let booking = working
            .bookings
            .get_mut(&booking_id)
            .ok_or_else(|| AppError::NotFound(format!("booking {}", booking_id)))?;

        let released_seats = booking.seat_numbers();
        let passenger_count = booking.passenger_count;
        let refund_amount = round_money(booking.total_amount * refund_pct);
        booking.clear_seats();
        booking.transition_to(BookingStatus::Cancelled)?;
        booking.cancellation_reason = reason.filter(|r| !r.trim().is_empty());
        booking.cancelled_at = Some(now);
        working.touch_booking(booking_id);

        let promoted_ids = if previous_status == BookingStatus::Confirmed {
            working.seats.vacate(&released_seats);
            working.inventory.release(passenger_count);
            working.promote(now)?
        } else {
            let entry_id = working.waitlist.active_for_booking(booking_id).map(|e| e.id);
            if let Some(entry_id) = entry_id {
                working.waitlist.deactivate(entry_id);
                working.touch_entry(entry_id);
            }
            for entry_id in working.waitlist.rerank() {
                working.touch_entry(entry_id);
            }
            Vec::new()
        };

        let cancelled = working
            .bookings
            .get(&booking_id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("booking {}", booking_id)))?;
        let promoted: Vec<Booking> = promoted_ids
            .iter()
            .filter_map(|id| working.bookings.get(id).cloned())
            .collect();
        let train_class = working.info.train_class.clone();
        let available = working.inventory.available_seats();
        let still_waiting = working.waitlist.active_len();

        self.commit(&mut guard, working).await?;
        drop(guard);

        tracing::info!(
            schedule_id = %cancelled.schedule_id,
            train_class = %train_class,
            booking_id = %booking_id,
            previous_status = previous_status.as_str(),
            refund_pct,
            refund_amount,
            promoted = promoted.len(),
            still_waiting,
            available,
            "Booking cancelled"
        );
        metrics::record_cancellation(previous_status.as_str());
        metrics::record_promotions(promoted.len());

        let mut notifications = vec![Notification::booking_cancelled(&cancelled, refund_amount)];
        notifications.extend(promoted.iter().map(Notification::booking_promoted));
        self.dispatch(notifications);

        Ok(CancellationOutcome {
            booking: cancelled,
            refund_pct,
            refund_amount,
            promoted,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::test_support::*;
    use crate::allocator::AllocationPolicy;
    use crate::models::WaitlistPriority;
    use crate::notifier::LogNotifier;
    use std::collections::BTreeSet;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    #[test]
    fn test_refund_tiers() {
        let policy = RefundPolicy::default();
        assert_eq!(policy.refund_pct(Duration::minutes(45)), 0.80);
        assert_eq!(policy.refund_pct(Duration::minutes(10)), 0.40);
        assert_eq!(policy.refund_pct(Duration::minutes(30)), 0.80);
        assert_eq!(policy.refund_pct(Duration::minutes(29) + Duration::seconds(59)), 0.40);
    }

    #[tokio::test]
    async fn test_scenario_b_cancel_promotes_waitlisted_booking() {
        let (allocator, store, schedule_id) = engine(2).await;

        let pair = allocator
            .create_booking("user-1", request(schedule_id, adults(2)))
            .await
            .unwrap();
        let single = allocator
            .create_booking("user-2", request(schedule_id, adults(1)))
            .await
            .unwrap();
        assert_eq!(single.booking.status, BookingStatus::Waitlisted);

        let outcome = allocator
            .cancel_booking("user-1", pair.booking.id, Some("plans changed".into()))
            .await
            .unwrap();
        assert!(outcome.booking.seat_numbers().is_empty());
        assert_eq!(outcome.booking.status, BookingStatus::Cancelled);
        assert_eq!(outcome.promoted.len(), 1);

        let promoted = allocator.booking("user-2", single.booking.id).await.unwrap();
        assert_eq!(promoted.status, BookingStatus::Confirmed);
        assert_eq!(promoted.seat_numbers(), vec![1]);

        // Two seats freed, one taken by the promoted booking.
        assert_eq!(store.stored_available(schedule_id).await, Some(1));

        let position = allocator
            .waitlist_position("user-2", single.booking.id)
            .await
            .unwrap();
        assert_eq!(position.position, 0);
        assert!(allocator
            .waitlist_position_for_user(schedule_id, "user-2")
            .await
            .is_err());

        let stored = store.stored_booking(pair.booking.id).await.unwrap();
        assert_eq!(stored.status, BookingStatus::Cancelled);
        assert_eq!(stored.cancellation_reason.as_deref(), Some("plans changed"));
    }

    #[tokio::test]
    async fn test_promotion_skips_bookings_that_do_not_fit() {
        let (allocator, _store, schedule_id) = engine(3).await;

        let one = allocator
            .create_booking("a", request(schedule_id, adults(1)))
            .await
            .unwrap();
        allocator
            .create_booking("b", request(schedule_id, adults(2)))
            .await
            .unwrap();
        let big = allocator
            .create_booking("c", request(schedule_id, adults(3)))
            .await
            .unwrap();
        let small = allocator
            .create_booking("d", request(schedule_id, adults(1)))
            .await
            .unwrap();
        assert_eq!(big.waitlist_position, Some(1));
        assert_eq!(small.waitlist_position, Some(2));

        let outcome = allocator.cancel_booking("a", one.booking.id, None).await.unwrap();
        assert_eq!(outcome.promoted.len(), 1);
        assert_eq!(outcome.promoted[0].id, small.booking.id);
        assert_eq!(outcome.promoted[0].seat_numbers(), vec![1]);

        let still_waiting = allocator.waitlist_position("c", big.booking.id).await.unwrap();
        assert_eq!(still_waiting.status, BookingStatus::Waitlisted);
        assert_eq!(still_waiting.position, 1);
        assert_eq!(still_waiting.total_waiting, 1);
    }

    #[tokio::test]
    async fn test_promotion_serves_senior_stratum_first() {
        let (allocator, _store, schedule_id) = engine(1).await;

        let holder = allocator
            .create_booking("h", request(schedule_id, adults(1)))
            .await
            .unwrap();
        let regular = allocator
            .create_booking("r", request(schedule_id, adults(1)))
            .await
            .unwrap();
        let senior = allocator
            .create_booking("s", request(schedule_id, vec![passenger("Elder", 67)]))
            .await
            .unwrap();

        let outcome = allocator.cancel_booking("h", holder.booking.id, None).await.unwrap();
        assert_eq!(outcome.promoted.len(), 1);
        assert_eq!(outcome.promoted[0].id, senior.booking.id);

        let waiting = allocator.waitlist_position("r", regular.booking.id).await.unwrap();
        assert_eq!(waiting.position, 1);
        assert_eq!(waiting.priority, Some(WaitlistPriority::Regular));
    }

    #[tokio::test]
    async fn test_cancelling_waitlisted_booking_reranks_without_release() {
        let (allocator, store, schedule_id) = engine(1).await;
        allocator
            .create_booking("h", request(schedule_id, adults(1)))
            .await
            .unwrap();

        let mut waiting = Vec::new();
        for user in ["w1", "w2", "w3"] {
            waiting.push(
                allocator
                    .create_booking(user, request(schedule_id, adults(1)))
                    .await
                    .unwrap(),
            );
        }

        let outcome = allocator
            .cancel_booking("w2", waiting[1].booking.id, None)
            .await
            .unwrap();
        assert!(outcome.promoted.is_empty());
        assert_eq!(store.stored_available(schedule_id).await, Some(0));

        let first = allocator.waitlist_position("w1", waiting[0].booking.id).await.unwrap();
        let third = allocator.waitlist_position("w3", waiting[2].booking.id).await.unwrap();
        assert_eq!((first.position, third.position), (1, 2));
        assert_eq!(third.total_waiting, 2);
    }

    #[tokio::test]
    async fn test_cancel_twice_is_rejected_without_side_effects() {
        let (allocator, store, schedule_id) = engine(2).await;
        let booking = allocator
            .create_booking("u", request(schedule_id, adults(2)))
            .await
            .unwrap();
        let promoted = allocator
            .create_booking("v", request(schedule_id, adults(2)))
            .await
            .unwrap();
        let waiting = allocator
            .create_booking("w", request(schedule_id, adults(1)))
            .await
            .unwrap();
        assert_eq!(waiting.waitlist_position, Some(2));

        allocator.cancel_booking("u", booking.booking.id, None).await.unwrap();
        let available = store.stored_available(schedule_id).await;
        let layout = allocator.coach_layout(schedule_id, "3A").await.unwrap();
        let promoted_state = allocator.booking("v", promoted.booking.id).await.unwrap();
        let position = allocator
            .waitlist_position("w", waiting.booking.id)
            .await
            .unwrap();
        assert_eq!(promoted_state.status, BookingStatus::Confirmed);
        assert_eq!(position.status, BookingStatus::Waitlisted);
        assert_eq!(position.position, 1);

        let err = allocator
            .cancel_booking("u", booking.booking.id, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::AlreadyCancelled(_)));
        assert_eq!(store.stored_available(schedule_id).await, available);
        assert_eq!(allocator.coach_layout(schedule_id, "3A").await.unwrap(), layout);
        assert_eq!(
            allocator.booking("v", promoted.booking.id).await.unwrap(),
            promoted_state
        );
        assert_eq!(
            allocator
                .waitlist_position("w", waiting.booking.id)
                .await
                .unwrap(),
            position
        );
    }

    #[tokio::test]
    async fn test_layout_frees_seats_of_cancelled_booking() {
        let (allocator, _store, schedule_id) = engine(4).await;
        allocator
            .create_booking("u", request(schedule_id, adults(1)))
            .await
            .unwrap();
        let leaving = allocator
            .create_booking("v", request(schedule_id, adults(2)))
            .await
            .unwrap();
        assert_eq!(leaving.booking.seat_numbers(), vec![2, 3]);

        allocator.cancel_booking("v", leaving.booking.id, None).await.unwrap();

        let layout = allocator.coach_layout(schedule_id, "3A").await.unwrap();
        assert_eq!(layout.available_seats, 3);
        let occupied: Vec<i32> = layout
            .seats
            .iter()
            .filter(|s| s.is_occupied)
            .map(|s| s.seat_number)
            .collect();
        assert_eq!(occupied, vec![1]);
    }

    #[tokio::test]
    async fn test_cancel_refund_tiers_against_departure() {
        let departure = Utc::now() + Duration::hours(3);
        let (allocator, _store, schedule_id) = engine_departing(10, departure).await;

        let early = allocator
            .create_booking("u", request(schedule_id, adults(1)))
            .await
            .unwrap();
        let late = allocator
            .create_booking("u", request(schedule_id, adults(1)))
            .await
            .unwrap();

        let outcome = allocator
            .cancel_booking_at("u", early.booking.id, None, departure - Duration::minutes(45))
            .await
            .unwrap();
        assert_eq!(outcome.refund_pct, 0.80);
        assert_eq!(outcome.refund_amount, 800.0);

        let outcome = allocator
            .cancel_booking_at("u", late.booking.id, None, departure - Duration::minutes(10))
            .await
            .unwrap();
        assert_eq!(outcome.refund_pct, 0.40);
        assert_eq!(outcome.refund_amount, 400.0);
    }

    #[tokio::test]
    async fn test_cancel_after_departure_is_fatal() {
        let departure = Utc::now() + Duration::hours(1);
        let (allocator, store, schedule_id) = engine_departing(4, departure).await;
        let booking = allocator
            .create_booking("u", request(schedule_id, adults(1)))
            .await
            .unwrap();

        let err = allocator
            .cancel_booking_at("u", booking.booking.id, None, departure + Duration::minutes(1))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::DepartureElapsed(_)));
        assert_eq!(store.stored_available(schedule_id).await, Some(3));
    }

    #[tokio::test]
    async fn test_cancel_by_other_user_is_not_found() {
        let (allocator, _store, schedule_id) = engine(4).await;
        let booking = allocator
            .create_booking("owner", request(schedule_id, adults(1)))
            .await
            .unwrap();

        assert!(matches!(
            allocator.cancel_booking("intruder", booking.booking.id, None).await,
            Err(AppError::NotFound(_))
        ));
        assert!(matches!(
            allocator.cancel_booking("owner", Uuid::new_v4(), None).await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_cancellation_commit_changes_nothing() {
        let store = Arc::new(FlakyStore::new());
        let info = schedule_info(Utc::now() + Duration::days(1));
        let schedule_id = info.schedule_id;
        store.inner.publish_schedule(info, 1).await.unwrap();
        let allocator = BookingAllocator::new(
            store.clone(),
            store.clone(),
            Arc::new(LogNotifier),
            AllocationPolicy::default(),
        );

        let holder = allocator
            .create_booking("h", request(schedule_id, adults(1)))
            .await
            .unwrap();
        let waiting = allocator
            .create_booking("w", request(schedule_id, adults(1)))
            .await
            .unwrap();

        store.fail_commits.store(true, Ordering::SeqCst);
        assert!(allocator.cancel_booking("h", holder.booking.id, None).await.is_err());
        store.fail_commits.store(false, Ordering::SeqCst);

        let held = allocator.booking("h", holder.booking.id).await.unwrap();
        assert_eq!(held.status, BookingStatus::Confirmed);
        assert_eq!(held.seat_numbers(), vec![1]);
        let still = allocator.waitlist_position("w", waiting.booking.id).await.unwrap();
        assert_eq!(still.position, 1);

        // The retry goes through and promotes as usual.
        let outcome = allocator.cancel_booking("h", holder.booking.id, None).await.unwrap();
        assert_eq!(outcome.promoted.len(), 1);
    }

    #[tokio::test]
    async fn test_mixed_workload_keeps_invariants() {
        let (allocator, store, schedule_id) = engine(6).await;

        let handles: Vec<_> = (0..24)
            .map(|i| {
                let allocator = Arc::clone(&allocator);
                tokio::spawn(async move {
                    let user = format!("user-{i}");
                    let outcome = allocator
                        .create_booking(&user, request(schedule_id, adults(1 + i % 2)))
                        .await
                        .unwrap();
                    if i % 3 == 0 {
                        allocator
                            .cancel_booking(&user, outcome.booking.id, None)
                            .await
                            .unwrap();
                    }
                    (user, outcome.booking.id)
                })
            })
            .collect();

        let mut bookings = Vec::new();
        for handle in handles {
            let (user, id) = handle.await.unwrap();
            bookings.push(allocator.booking(&user, id).await.unwrap());
        }

        let confirmed: Vec<&Booking> = bookings
            .iter()
            .filter(|b| b.status == BookingStatus::Confirmed)
            .collect();
        let seats_held: i32 = confirmed.iter().map(|b| b.passenger_count).sum();
        assert!(seats_held <= 6);
        assert_eq!(store.stored_available(schedule_id).await, Some(6 - seats_held));

        let all_seats: Vec<i32> = confirmed.iter().flat_map(|b| b.seat_numbers()).collect();
        let unique: BTreeSet<i32> = all_seats.iter().copied().collect();
        assert_eq!(unique.len(), all_seats.len());

        for cancelled in bookings.iter().filter(|b| b.status == BookingStatus::Cancelled) {
            assert!(cancelled.seat_numbers().is_empty());
        }

        let mut positions: Vec<(WaitlistPriority, i32)> = Vec::new();
        for b in bookings.iter().filter(|b| b.status == BookingStatus::Waitlisted) {
            let p = allocator.waitlist_position(&b.user_id, b.id).await.unwrap();
            positions.push((p.priority.unwrap(), p.position));
        }
        positions.sort();
        let ranks: Vec<i32> = positions.iter().map(|(_, p)| *p).collect();
        let expected: Vec<i32> = (1..=ranks.len() as i32).collect();
        assert_eq!(ranks, expected);
    }
}
