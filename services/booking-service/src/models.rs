// =============================================================================
// MODELS MODULE
// =============================================================================
// Domain records (bookings, passengers, waitlist entries, schedules) and the
// request/response shapes of the HTTP API.
//
// NOTES:
// - Status, quota, gender and waitlist priority are enums, never raw
//   integers or free strings
// - "No seat assigned" is `None`, never an empty string
// - API types are kept apart from the stored records so the wire shape can
//   change without touching storage
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use rand::Rng;
use uuid::Uuid;

use crate::error::{AppError, AppResult};

// =============================================================================
// BOOKING STATUS
// =============================================================================
// Requested -> {Confirmed | Waitlisted}; Waitlisted -> Confirmed (promotion);
// Confirmed | Waitlisted -> Cancelled. Nothing leaves Cancelled.
// -----------------------------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Confirmed,
    Waitlisted,
    Cancelled,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Waitlisted => "waitlisted",
            BookingStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "confirmed" => Some(BookingStatus::Confirmed),
            "waitlisted" => Some(BookingStatus::Waitlisted),
            "cancelled" => Some(BookingStatus::Cancelled),
            _ => None,
        }
    }

    /// Whether `self -> next` is an edge of the booking state machine.
    pub fn can_transition_to(self, next: BookingStatus) -> bool {
        matches!(
            (self, next),
            (BookingStatus::Waitlisted, BookingStatus::Confirmed)
                | (BookingStatus::Confirmed, BookingStatus::Cancelled)
                | (BookingStatus::Waitlisted, BookingStatus::Cancelled)
        )
    }
}

// =============================================================================
// QUOTA
// =============================================================================
/// Fare/eligibility category selected for a booking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quota {
    #[default]
    General,
    Ladies,
    Senior,
    Tatkal,
}

impl Quota {
    pub const ALL: [Quota; 4] = [Quota::General, Quota::Ladies, Quota::Senior, Quota::Tatkal];

    pub fn as_str(&self) -> &'static str {
        match self {
            Quota::General => "general",
            Quota::Ladies => "ladies",
            Quota::Senior => "senior",
            Quota::Tatkal => "tatkal",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Quota::ALL.into_iter().find(|q| q.as_str() == value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gender {
    Male,
    Female,
    Other,
}

impl Gender {
    pub fn as_str(&self) -> &'static str {
        match self {
            Gender::Male => "male",
            Gender::Female => "female",
            Gender::Other => "other",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "male" => Some(Gender::Male),
            "female" => Some(Gender::Female),
            "other" => Some(Gender::Other),
            _ => None,
        }
    }
}

// =============================================================================
// PASSENGER
// =============================================================================
// The roster is fixed once the booking exists; `seat_number` is the only
// field promotion or cancellation ever rewrites.
// -----------------------------------------------------------------------------
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Passenger {
    pub id: Uuid,
    pub name: String,
    pub age: i32,
    pub gender: Gender,
    pub seat_number: Option<i32>,
}

// =============================================================================
// BOOKING
// =============================================================================
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Uuid,
    pub user_id: String,
    pub schedule_id: Uuid,
    pub passenger_count: i32,
    pub total_amount: f64,
    /// Human-presentable reference, e.g. "PNR4F7K2QZ"
    pub booking_reference: String,
    pub status: BookingStatus,
    pub quota: Quota,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancellation_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancelled_at: Option<DateTime<Utc>>,
    pub passengers: Vec<Passenger>,
}

impl Booking {
    /// Move to `next`, rejecting any edge the state machine does not have.
    pub fn transition_to(&mut self, next: BookingStatus) -> AppResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(AppError::IllegalTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Seats currently held by this booking's passengers.
    pub fn seat_numbers(&self) -> Vec<i32> {
        self.passengers.iter().filter_map(|p| p.seat_number).collect()
    }

    /// Hand seats to passengers in roster order.
    pub fn assign_seats(&mut self, seats: &[i32]) -> AppResult<()> {
        if seats.len() != self.passengers.len() {
            return Err(AppError::Consistency(format!(
                "booking {} has {} passengers but {} seats were assigned",
                self.id,
                self.passengers.len(),
                seats.len()
            )));
        }
        for (passenger, seat) in self.passengers.iter_mut().zip(seats) {
            passenger.seat_number = Some(*seat);
        }
        Ok(())
    }

    pub fn clear_seats(&mut self) {
        for passenger in &mut self.passengers {
            passenger.seat_number = None;
        }
    }

    pub fn has_passenger_aged(&self, min_age: i32) -> bool {
        self.passengers.iter().any(|p| p.age >= min_age)
    }
}

const REFERENCE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const REFERENCE_SUFFIX_LEN: usize = 7;

/// Generate a booking reference: "PNR" followed by 7 upper-case alphanumerics.
/// Uniqueness is checked by the allocator against the store.
pub fn new_booking_reference() -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..REFERENCE_SUFFIX_LEN)
        .map(|_| char::from(REFERENCE_ALPHABET[rng.gen_range(0..REFERENCE_ALPHABET.len())]))
        .collect();
    format!("PNR{}", suffix)
}

/// Round a currency amount to two decimal places.
pub fn round_money(amount: f64) -> f64 {
    (amount * 100.0).round() / 100.0
}

// =============================================================================
// WAITLIST ENTRY
// =============================================================================
/// Served lowest rank first: bookings containing a senior citizen before
/// everyone else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitlistPriority {
    SeniorCitizen,
    Regular,
}

impl WaitlistPriority {
    pub fn rank(&self) -> i32 {
        match self {
            WaitlistPriority::SeniorCitizen => 1,
            WaitlistPriority::Regular => 2,
        }
    }

    pub fn from_rank(rank: i32) -> Option<Self> {
        match rank {
            1 => Some(WaitlistPriority::SeniorCitizen),
            2 => Some(WaitlistPriority::Regular),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitlistEntry {
    pub id: Uuid,
    pub booking_id: Uuid,
    pub schedule_id: Uuid,
    pub train_class: String,
    pub priority: WaitlistPriority,
    /// 1-based rank within (schedule, class, priority) among active entries
    pub position: i32,
    pub queued_at: DateTime<Utc>,
    pub is_active: bool,
    pub confirmed_at: Option<DateTime<Utc>>,
}

// =============================================================================
// SCHEDULE (catalog view)
// =============================================================================
/// Read-only facts about one schedule instance, owned by the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleInfo {
    pub schedule_id: Uuid,
    pub service_name: String,
    pub origin: String,
    pub destination: String,
    pub train_class: String,
    pub departure_at: DateTime<Utc>,
    pub base_fare: f64,
}

// =============================================================================
// API REQUEST/RESPONSE STRUCTURES
// =============================================================================

// -----------------------------------------------------------------------------
// CREATE BOOKING
// -----------------------------------------------------------------------------
/// # Example JSON
/// ```json
/// {
///   "schedule_id": "5b1c...",
///   "passengers": [{ "name": "Asha", "age": 61, "gender": "female" }],
///   "auto_assign_seats": false,
///   "preferred_seats": [12],
///   "selected_quota": "senior"
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PassengerRequest {
    pub name: String,
    pub age: i32,
    pub gender: Gender,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateBookingRequest {
    pub schedule_id: Uuid,
    pub passengers: Vec<PassengerRequest>,

    /// When false, `preferred_seats` must name one seat per passenger
    #[serde(default = "default_auto_assign")]
    pub auto_assign_seats: bool,

    #[serde(default)]
    pub preferred_seats: Vec<i32>,

    #[serde(default)]
    pub selected_quota: Quota,
}

fn default_auto_assign() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeatAllocation {
    pub passenger_name: String,
    pub seat_number: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateBookingResponse {
    pub success: bool,
    pub message: String,
    pub booking_id: Option<Uuid>,
    pub booking_reference: Option<String>,
    pub status: Option<BookingStatus>,
    pub total_amount: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub waitlist_position: Option<i32>,
    pub seat_allocations: Vec<SeatAllocation>,
}

// -----------------------------------------------------------------------------
// CANCEL BOOKING
// -----------------------------------------------------------------------------
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CancelBookingRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelBookingResponse {
    pub success: bool,
    pub message: String,
    pub refund_amount: Option<f64>,
}

// -----------------------------------------------------------------------------
// COACH LAYOUT
// -----------------------------------------------------------------------------
// Also the cached representation, hence Deserialize.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeatStatus {
    pub seat_number: i32,
    pub is_occupied: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoachLayoutResponse {
    pub schedule_id: Uuid,
    pub train_class: String,
    pub total_seats: i32,
    pub available_seats: i32,
    pub seats: Vec<SeatStatus>,
}

// -----------------------------------------------------------------------------
// WAITLIST POSITION
// -----------------------------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationChance {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitlistPositionResponse {
    pub booking_id: Uuid,
    pub status: BookingStatus,
    /// 0 when the booking is not waiting
    pub position: i32,
    pub total_waiting: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<WaitlistPriority>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_confirmation: Option<ConfirmationChance>,
}

// -----------------------------------------------------------------------------
// FARE QUOTE
// -----------------------------------------------------------------------------
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FareQuote {
    pub quota: Quota,
    pub multiplier: f64,
    pub fare_per_person: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FareQuoteResponse {
    pub schedule_id: Uuid,
    pub service_name: String,
    pub departure_at: DateTime<Utc>,
    pub base_fare: f64,
    pub fares: Vec<FareQuote>,
}

// =============================================================================
// HEALTH CHECK RESPONSES
// =============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    pub status: String,
    pub checks: ReadinessChecks,
}

/// `cache` is absent when Redis is not configured
#[derive(Debug, Serialize)]
pub struct ReadinessChecks {
    pub storage: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache: Option<bool>,
}

// =============================================================================
// ERROR RESPONSES
// =============================================================================

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(
        error: impl Into<String>,
        message: impl Into<String>,
        details: impl Into<String>,
    ) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            details: Some(details.into()),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn booking(status: BookingStatus) -> Booking {
        Booking {
            id: Uuid::new_v4(),
            user_id: "user-1".to_string(),
            schedule_id: Uuid::new_v4(),
            passenger_count: 2,
            total_amount: 200.0,
            booking_reference: new_booking_reference(),
            status,
            quota: Quota::General,
            cancellation_reason: None,
            created_at: Utc::now(),
            cancelled_at: None,
            passengers: vec![
                Passenger {
                    id: Uuid::new_v4(),
                    name: "Ravi".to_string(),
                    age: 34,
                    gender: Gender::Male,
                    seat_number: None,
                },
                Passenger {
                    id: Uuid::new_v4(),
                    name: "Meera".to_string(),
                    age: 60,
                    gender: Gender::Female,
                    seat_number: None,
                },
            ],
        }
    }

    #[test]
    fn test_status_transitions() {
        use BookingStatus::*;
        assert!(Waitlisted.can_transition_to(Confirmed));
        assert!(Confirmed.can_transition_to(Cancelled));
        assert!(Waitlisted.can_transition_to(Cancelled));

        assert!(!Cancelled.can_transition_to(Confirmed));
        assert!(!Cancelled.can_transition_to(Waitlisted));
        assert!(!Confirmed.can_transition_to(Waitlisted));
        assert!(!Confirmed.can_transition_to(Confirmed));
    }

    #[test]
    fn test_transition_to_rejects_illegal_edge() {
        let mut b = booking(BookingStatus::Cancelled);
        let err = b.transition_to(BookingStatus::Confirmed).unwrap_err();
        assert!(matches!(err, AppError::IllegalTransition { .. }));
        assert_eq!(b.status, BookingStatus::Cancelled);
    }

    #[test]
    fn test_assign_and_clear_seats() {
        let mut b = booking(BookingStatus::Confirmed);
        b.assign_seats(&[3, 4]).unwrap();
        assert_eq!(b.seat_numbers(), vec![3, 4]);

        assert!(b.assign_seats(&[1]).is_err());

        b.clear_seats();
        assert!(b.seat_numbers().is_empty());
    }

    #[test]
    fn test_senior_detection() {
        let b = booking(BookingStatus::Waitlisted);
        assert!(b.has_passenger_aged(58));
        assert!(!b.has_passenger_aged(61));
    }

    #[test]
    fn test_booking_reference_shape() {
        let reference = new_booking_reference();
        assert_eq!(reference.len(), 10);
        assert!(reference.starts_with("PNR"));
        assert!(reference[3..].chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
    }

    #[test]
    fn test_booking_references_use_full_alphabet() {
        let suffixes: String = (0..200).map(|_| new_booking_reference()[3..].to_string()).collect();
        // 1400 draws; hex output would never contain G-Z
        assert!(suffixes.chars().any(|c| ('G'..='Z').contains(&c)));
        assert!(suffixes.chars().any(|c| c.is_ascii_digit()));
    }

    #[test]
    fn test_enum_string_round_trips() {
        for quota in Quota::ALL {
            assert_eq!(Quota::parse(quota.as_str()), Some(quota));
        }
        assert_eq!(BookingStatus::parse("waitlisted"), Some(BookingStatus::Waitlisted));
        assert_eq!(BookingStatus::parse("2"), None);
        assert_eq!(WaitlistPriority::from_rank(1), Some(WaitlistPriority::SeniorCitizen));
        assert!(WaitlistPriority::SeniorCitizen < WaitlistPriority::Regular);
    }

    #[test]
    fn test_create_request_defaults() {
        let req: CreateBookingRequest = serde_json::from_str(
            r#"{"schedule_id":"00000000-0000-0000-0000-000000000001",
                "passengers":[{"name":"A","age":30,"gender":"male"}]}"#,
        )
        .unwrap();
        assert!(req.auto_assign_seats);
        assert!(req.preferred_seats.is_empty());
        assert_eq!(req.selected_quota, Quota::General);
    }
}
