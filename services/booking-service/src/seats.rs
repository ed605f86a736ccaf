// =============================================================================
// SEAT ASSIGNOR
// =============================================================================
// Tracks which seat numbers are held by Confirmed bookings on one schedule
// and hands out new ones.
//
// The occupied set is maintained incrementally (occupy/vacate) so finding
// the next free seat is a bounded scan over 1..=total_seats, never a join
// across every booking and passenger.
// =============================================================================

use std::collections::BTreeSet;

use crate::error::{AppError, AppResult};
use crate::models::{Booking, BookingStatus, SeatStatus};

/// Largest coach the assignor will scan.
pub const MAX_COACH_SEATS: i32 = 100;

#[derive(Debug, Clone, Default)]
pub struct SeatMap {
    total_seats: i32,
    occupied: BTreeSet<i32>,
}

impl SeatMap {
    pub fn new(total_seats: i32) -> Self {
        Self {
            total_seats: total_seats.min(MAX_COACH_SEATS),
            occupied: BTreeSet::new(),
        }
    }

    /// Build the occupied set from the Confirmed bookings of a schedule.
    /// Two confirmed passengers sharing a seat is a consistency error.
    pub fn from_bookings<'a>(
        total_seats: i32,
        bookings: impl IntoIterator<Item = &'a Booking>,
    ) -> AppResult<Self> {
        let mut map = Self::new(total_seats);
        for booking in bookings {
            if booking.status != BookingStatus::Confirmed {
                continue;
            }
            for seat in booking.seat_numbers() {
                if !map.occupied.insert(seat) {
                    return Err(AppError::Consistency(format!(
                        "seat {} is held by more than one confirmed booking (latest {})",
                        seat, booking.id
                    )));
                }
            }
        }
        Ok(map)
    }

    pub fn total_seats(&self) -> i32 {
        self.total_seats
    }

    pub fn is_occupied(&self, seat_number: i32) -> bool {
        self.occupied.contains(&seat_number)
    }

    /// Lowest seat not occupied and not in `exclude`.
    pub fn next_available(&self, exclude: &BTreeSet<i32>) -> AppResult<i32> {
        (1..=self.total_seats)
            .find(|seat| !self.occupied.contains(seat) && !exclude.contains(seat))
            .ok_or_else(|| {
                AppError::Consistency(format!(
                    "no free seat among {} although capacity was reserved",
                    self.total_seats
                ))
            })
    }

    /// Shape checks on a preference list that need no occupancy data: one
    /// seat per passenger and no duplicates.
    pub fn check_preference_shape(preferred: &[i32], passenger_count: usize) -> AppResult<()> {
        if preferred.len() != passenger_count {
            return Err(AppError::Validation(format!(
                "{} preferred seats given for {} passengers",
                preferred.len(),
                passenger_count
            )));
        }
        let mut seen = BTreeSet::new();
        let duplicates: BTreeSet<i32> = preferred
            .iter()
            .copied()
            .filter(|seat| !seen.insert(*seat))
            .collect();
        if !duplicates.is_empty() {
            return Err(AppError::Validation(format!(
                "preferred seats repeated: {:?}",
                duplicates.into_iter().collect::<Vec<_>>()
            )));
        }
        Ok(())
    }

    /// Seat numbers in `preferred` that do not exist in this coach.
    pub fn check_preference_range(&self, preferred: &[i32]) -> AppResult<()> {
        let invalid: Vec<i32> = preferred
            .iter()
            .copied()
            .filter(|seat| *seat < 1 || *seat > self.total_seats)
            .collect();
        if !invalid.is_empty() {
            return Err(AppError::Validation(format!(
                "seats {:?} do not exist (coach has seats 1-{})",
                invalid, self.total_seats
            )));
        }
        Ok(())
    }

    /// Claim exactly the preferred seats, or none of them.
    pub fn assign_preferred(&mut self, preferred: &[i32]) -> AppResult<Vec<i32>> {
        Self::check_preference_shape(preferred, preferred.len())?;
        self.check_preference_range(preferred)?;

        let taken: Vec<i32> = preferred
            .iter()
            .copied()
            .filter(|seat| self.is_occupied(*seat))
            .collect();
        if !taken.is_empty() {
            return Err(AppError::SeatsOccupied { seats: taken });
        }

        self.occupy(preferred);
        Ok(preferred.to_vec())
    }

    /// Claim the `count` lowest free seats.
    pub fn assign_auto(&mut self, count: i32) -> AppResult<Vec<i32>> {
        let mut handed_out = BTreeSet::new();
        let mut seats = Vec::with_capacity(count.max(0) as usize);
        for _ in 0..count {
            let seat = self.next_available(&handed_out)?;
            handed_out.insert(seat);
            seats.push(seat);
        }
        self.occupy(&seats);
        Ok(seats)
    }

    pub fn occupy(&mut self, seats: &[i32]) {
        self.occupied.extend(seats.iter().copied());
    }

    pub fn vacate(&mut self, seats: &[i32]) {
        for seat in seats {
            self.occupied.remove(seat);
        }
    }

    pub fn layout(&self) -> Vec<SeatStatus> {
        (1..=self.total_seats)
            .map(|seat_number| SeatStatus {
                seat_number,
                is_occupied: self.is_occupied(seat_number),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Gender, Passenger, Quota};
    use chrono::Utc;
    use uuid::Uuid;

    fn confirmed_with(seats: &[i32], status: BookingStatus) -> Booking {
        Booking {
            id: Uuid::new_v4(),
            user_id: "u".to_string(),
            schedule_id: Uuid::nil(),
            passenger_count: seats.len() as i32,
            total_amount: 0.0,
            booking_reference: "PNRTEST000".to_string(),
            status,
            quota: Quota::General,
            cancellation_reason: None,
            created_at: Utc::now(),
            cancelled_at: None,
            passengers: seats
                .iter()
                .map(|s| Passenger {
                    id: Uuid::new_v4(),
                    name: "p".to_string(),
                    age: 30,
                    gender: Gender::Other,
                    seat_number: Some(*s),
                })
                .collect(),
        }
    }

    #[test]
    fn test_next_available_skips_occupied_and_excluded() {
        let mut map = SeatMap::new(5);
        map.occupy(&[1, 3]);
        let exclude: BTreeSet<i32> = [2].into_iter().collect();
        assert_eq!(map.next_available(&exclude).unwrap(), 4);
    }

    #[test]
    fn test_next_available_full_coach_is_consistency_error() {
        let mut map = SeatMap::new(2);
        map.occupy(&[1, 2]);
        let err = map.next_available(&BTreeSet::new()).unwrap_err();
        assert!(matches!(err, AppError::Consistency(_)));
    }

    #[test]
    fn test_assign_auto_within_one_request_never_collides() {
        let mut map = SeatMap::new(6);
        map.occupy(&[2]);
        let seats = map.assign_auto(3).unwrap();
        assert_eq!(seats, vec![1, 3, 4]);
        assert!(map.is_occupied(4));
    }

    #[test]
    fn test_assign_preferred_is_all_or_nothing() {
        let mut map = SeatMap::new(10);
        map.occupy(&[7]);

        let err = map.assign_preferred(&[6, 7]).unwrap_err();
        match err {
            AppError::SeatsOccupied { seats } => assert_eq!(seats, vec![7]),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!map.is_occupied(6));

        assert_eq!(map.assign_preferred(&[5, 6]).unwrap(), vec![5, 6]);
        assert!(map.is_occupied(5) && map.is_occupied(6));
    }

    #[test]
    fn test_preference_shape() {
        assert!(SeatMap::check_preference_shape(&[5, 5], 2).is_err());
        assert!(SeatMap::check_preference_shape(&[5], 2).is_err());
        assert!(SeatMap::check_preference_shape(&[5, 6], 2).is_ok());
    }

    #[test]
    fn test_preference_range() {
        let map = SeatMap::new(10);
        assert!(map.check_preference_range(&[0]).is_err());
        assert!(map.check_preference_range(&[11]).is_err());
        assert!(map.check_preference_range(&[1, 10]).is_ok());
    }

    #[test]
    fn test_from_bookings_counts_only_confirmed() {
        let confirmed = confirmed_with(&[1, 2], BookingStatus::Confirmed);
        let waitlisted = confirmed_with(&[3], BookingStatus::Waitlisted);
        let map = SeatMap::from_bookings(10, [&confirmed, &waitlisted]).unwrap();

        assert!(map.is_occupied(1) && map.is_occupied(2));
        assert!(!map.is_occupied(3));
    }

    #[test]
    fn test_from_bookings_detects_collision() {
        let a = confirmed_with(&[4], BookingStatus::Confirmed);
        let b = confirmed_with(&[4], BookingStatus::Confirmed);
        assert!(SeatMap::from_bookings(10, [&a, &b]).is_err());
    }

    #[test]
    fn test_scan_is_capped() {
        let map = SeatMap::new(500);
        assert_eq!(map.total_seats(), MAX_COACH_SEATS);
        assert_eq!(map.layout().len(), MAX_COACH_SEATS as usize);
    }
}
