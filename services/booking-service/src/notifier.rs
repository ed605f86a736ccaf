// =============================================================================
// NOTIFIER
// =============================================================================
// Fire-and-forget delivery of booking messages. A failed delivery is logged
// and never affects the booking it describes.
// =============================================================================

use async_trait::async_trait;
use serde::Serialize;

use crate::models::{Booking, BookingStatus};

pub const OUTBOX_KEY: &str = "notifications:outbox";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub user_id: String,
    pub subject: String,
    pub body: String,
}

impl Notification {
    /// Message for a freshly created booking (confirmed or waitlisted).
    pub fn booking_created(booking: &Booking, waitlist_position: Option<i32>) -> Self {
        let (subject, body) = match booking.status {
            BookingStatus::Confirmed => (
                format!("Booking {} confirmed", booking.booking_reference),
                format!(
                    "Your booking for {} passenger(s) is confirmed. Seats: {}.",
                    booking.passenger_count,
                    describe_seats(booking)
                ),
            ),
            _ => (
                format!("Booking {} waitlisted", booking.booking_reference),
                format!(
                    "Your booking for {} passenger(s) is on the waitlist at position {}.",
                    booking.passenger_count,
                    waitlist_position.unwrap_or_default()
                ),
            ),
        };
        Self {
            user_id: booking.user_id.clone(),
            subject,
            body,
        }
    }

    pub fn booking_promoted(booking: &Booking) -> Self {
        Self {
            user_id: booking.user_id.clone(),
            subject: format!("Waitlisted booking {} confirmed", booking.booking_reference),
            body: format!("Seats are now assigned: {}.", describe_seats(booking)),
        }
    }

    pub fn booking_cancelled(booking: &Booking, refund_amount: f64) -> Self {
        Self {
            user_id: booking.user_id.clone(),
            subject: format!("Booking {} cancelled", booking.booking_reference),
            body: format!("Your booking was cancelled. Refund amount: {:.2}.", refund_amount),
        }
    }
}

fn describe_seats(booking: &Booking) -> String {
    booking
        .seat_numbers()
        .iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: Notification);
}

/// Writes notifications to the log only.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: Notification) {
        tracing::info!(
            user_id = %notification.user_id,
            subject = %notification.subject,
            "Notification queued"
        );
    }
}

/// Pushes JSON notifications onto a Redis list consumed by the mailer.
#[derive(Clone)]
pub struct RedisNotifier {
    redis: redis::aio::ConnectionManager,
}

impl RedisNotifier {
    pub fn new(redis: redis::aio::ConnectionManager) -> Self {
        Self { redis }
    }
}

#[async_trait]
impl Notifier for RedisNotifier {
    async fn notify(&self, notification: Notification) {
        let payload = match serde_json::to_string(&notification) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to encode notification");
                return;
            }
        };

        let result: Result<i64, _> = redis::cmd("LPUSH")
            .arg(OUTBOX_KEY)
            .arg(&payload)
            .query_async(&mut self.redis.clone())
            .await;

        if let Err(e) = result {
            tracing::warn!(
                user_id = %notification.user_id,
                error = %e,
                "Failed to enqueue notification"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Gender, Passenger, Quota};
    use chrono::Utc;
    use uuid::Uuid;

    #[test]
    fn test_confirmed_message_lists_seats() {
        let booking = Booking {
            id: Uuid::new_v4(),
            user_id: "user-9".to_string(),
            schedule_id: Uuid::new_v4(),
            passenger_count: 1,
            total_amount: 455.0,
            booking_reference: "PNRABC1234".to_string(),
            status: BookingStatus::Confirmed,
            quota: Quota::General,
            cancellation_reason: None,
            created_at: Utc::now(),
            cancelled_at: None,
            passengers: vec![Passenger {
                id: Uuid::new_v4(),
                name: "Kiran".to_string(),
                age: 40,
                gender: Gender::Male,
                seat_number: Some(12),
            }],
        };

        let n = Notification::booking_created(&booking, None);
        assert_eq!(n.user_id, "user-9");
        assert!(n.subject.contains("PNRABC1234"));
        assert!(n.body.contains("12"));
    }
}
