// =============================================================================
// ERROR MODULE
// =============================================================================
// Error taxonomy of the allocation engine and its HTTP mapping.
//
// CATEGORIES:
// - Validation (user-correctable): bad passengers, seat preferences, quota
// - Not found: missing booking OR booking owned by someone else (the two
//   are indistinguishable to the caller)
// - Business-rule fatal: cancelling after departure, cancelling twice
// - System: storage, cache, internal consistency; logged, and reported to
//   the caller only as a generic failure
//
// Running out of seats is NOT an error: it routes the booking to the
// waitlist.
// =============================================================================

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{BookingStatus, ErrorResponse};

#[derive(Debug, Error)]
pub enum AppError {
    // -------------------------------------------------------------------------
    // INFRASTRUCTURE ERRORS
    // -------------------------------------------------------------------------
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Cache error: {0}")]
    Redis(#[from] redis::RedisError),

    // -------------------------------------------------------------------------
    // VALIDATION ERRORS
    // -------------------------------------------------------------------------
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("seats already occupied: {}", format_seats(.seats))]
    SeatsOccupied { seats: Vec<i32> },

    #[error("Quota not applicable: {0}")]
    QuotaNotEligible(String),

    // -------------------------------------------------------------------------
    // LOOKUP / IDENTITY
    // -------------------------------------------------------------------------
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    // -------------------------------------------------------------------------
    // BUSINESS RULES
    // -------------------------------------------------------------------------
    #[error("Booking {0} is already cancelled")]
    AlreadyCancelled(Uuid),

    #[error("Schedule departed at {0}; cancellation is no longer possible")]
    DepartureElapsed(DateTime<Utc>),

    // -------------------------------------------------------------------------
    // INTERNAL ERRORS
    // -------------------------------------------------------------------------
    #[error("Illegal booking transition {from:?} -> {to:?}")]
    IllegalTransition { from: BookingStatus, to: BookingStatus },

    /// An allocation invariant did not hold (e.g. no free seat although
    /// inventory was reserved)
    #[error("Inventory consistency violation: {0}")]
    Consistency(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

fn format_seats(seats: &[i32]) -> String {
    seats
        .iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

// =============================================================================
// HTTP RESPONSE CONVERSION
// =============================================================================
impl AppError {
    pub fn status_code(&self) -> StatusCode {
        self.classify().0
    }

    /// Status, stable error code and the caller-facing message.
    fn classify(&self) -> (StatusCode, &'static str, String) {
        match self {
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),

            AppError::SeatsOccupied { .. } => {
                (StatusCode::CONFLICT, "SEATS_OCCUPIED", self.to_string())
            }

            AppError::QuotaNotEligible(msg) => {
                (StatusCode::BAD_REQUEST, "QUOTA_NOT_ELIGIBLE", msg.clone())
            }

            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),

            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", msg.clone()),

            AppError::AlreadyCancelled(_) => {
                (StatusCode::CONFLICT, "ALREADY_CANCELLED", self.to_string())
            }

            AppError::DepartureElapsed(_) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "DEPARTURE_ELAPSED",
                self.to_string(),
            ),

            // Everything below is a system error: never expose internals.
            AppError::IllegalTransition { .. } | AppError::Consistency(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "ALLOCATION_ERROR",
                "The booking could not be processed".to_string(),
            ),

            AppError::Database(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "DATABASE_ERROR",
                "A database error occurred".to_string(),
            ),

            AppError::Redis(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "CACHE_ERROR",
                "A cache error occurred".to_string(),
            ),

            AppError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "An internal error occurred".to_string(),
            ),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_code, message) = self.classify();

        if status.is_server_error() {
            tracing::error!(error_code = error_code, error = %self, "Request failed");
        } else {
            tracing::warn!(error_code = error_code, message = %message, "Request rejected");
        }

        let body = match &self {
            AppError::SeatsOccupied { seats } => {
                ErrorResponse::with_details(error_code, message, format_seats(seats))
            }
            _ => ErrorResponse::new(error_code, message),
        };

        (status, Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seats_occupied_message_names_seats() {
        let err = AppError::SeatsOccupied { seats: vec![5, 7] };
        assert_eq!(err.to_string(), "seats already occupied: 5, 7");
    }

    #[test]
    fn test_status_codes() {
        let cases = vec![
            (AppError::Validation("x".into()), StatusCode::BAD_REQUEST),
            (AppError::SeatsOccupied { seats: vec![1] }, StatusCode::CONFLICT),
            (AppError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (AppError::AlreadyCancelled(Uuid::nil()), StatusCode::CONFLICT),
            (AppError::DepartureElapsed(Utc::now()), StatusCode::UNPROCESSABLE_ENTITY),
            (AppError::Consistency("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
            (AppError::Unauthorized("x".into()), StatusCode::UNAUTHORIZED),
        ];
        for (err, expected) in cases {
            assert_eq!(err.status_code(), expected);
            assert_eq!(err.into_response().status(), expected);
        }
    }

    #[test]
    fn test_redis_failure_becomes_cache_error() {
        fn ping() -> AppResult<()> {
            let reply: redis::RedisResult<()> =
                Err(redis::RedisError::from((redis::ErrorKind::IoError, "connection refused")));
            reply?;
            Ok(())
        }

        let err = ping().unwrap_err();
        assert!(matches!(err, AppError::Redis(_)));
        let (status, code, _) = err.classify();
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(code, "CACHE_ERROR");
    }
}
