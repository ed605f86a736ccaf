// =============================================================================
// HANDLERS MODULE
// =============================================================================
// HTTP request handlers. Each one unwraps the request, calls the allocation
// engine and shapes the response; no allocation logic lives here.
// Layout caching happens inside the engine (layout_cache.rs).
// =============================================================================

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::identity::Principal;
use crate::metrics;
use crate::models::*;
use crate::AppState;

// =============================================================================
// HEALTH CHECK ENDPOINTS
// =============================================================================

/// Liveness check
///
/// GET /health
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: "booking-service".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness check: storage must answer, and Redis too when configured.
///
/// GET /ready
pub async fn readiness_check(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<ReadinessResponse>) {
    let storage = state.store.health_check().await;

    let cache = match &state.redis {
        Some(redis) => Some(match ping(redis).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "Redis readiness check failed");
                false
            }
        }),
        None => None,
    };

    let ready = storage && cache.unwrap_or(true);
    let response = ReadinessResponse {
        status: if ready { "ready" } else { "not_ready" }.to_string(),
        checks: ReadinessChecks { storage, cache },
    };

    let code = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(response))
}

async fn ping(redis: &redis::aio::ConnectionManager) -> AppResult<()> {
    redis::cmd("PING")
        .query_async::<_, String>(&mut redis.clone())
        .await?;
    Ok(())
}

// =============================================================================
// METRICS ENDPOINT
// =============================================================================
/// GET /metrics
pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> String {
    state.metrics_handle.render()
}

/// Record the request metric for a handler result and pass it through.
fn observe<T>(
    method: &str,
    endpoint: &str,
    ok_status: StatusCode,
    start: Instant,
    result: AppResult<T>,
) -> AppResult<T> {
    let status = match &result {
        Ok(_) => ok_status.as_u16(),
        Err(e) => e.status_code().as_u16(),
    };
    metrics::record_http_request(method, endpoint, status, start.elapsed().as_secs_f64());
    result
}

// =============================================================================
// BOOKING API ENDPOINTS
// =============================================================================

// -----------------------------------------------------------------------------
// CREATE BOOKING
// -----------------------------------------------------------------------------
/// POST /api/v1/bookings
///
/// # Response
/// - 201 Created: booking confirmed or waitlisted
/// - 400 Bad Request: invalid passengers, preferences or quota
/// - 409 Conflict: a preferred seat is already occupied
pub async fn create_booking(
    State(state): State<Arc<AppState>>,
    principal: Principal,
    Json(request): Json<CreateBookingRequest>,
) -> AppResult<(StatusCode, Json<CreateBookingResponse>)> {
    let start = Instant::now();

    tracing::debug!(
        user_id = %principal.user_id,
        schedule_id = %request.schedule_id,
        passengers = request.passengers.len(),
        quota = request.selected_quota.as_str(),
        "Booking requested"
    );

    let result = state
        .allocator
        .create_booking(&principal.user_id, request)
        .await;

    let outcome = observe("POST", "/api/v1/bookings", StatusCode::CREATED, start, result)?;
    let booking = outcome.booking;

    let message = match booking.status {
        BookingStatus::Confirmed => "Booking confirmed".to_string(),
        _ => format!(
            "Booking waitlisted at position {}",
            outcome.waitlist_position.unwrap_or_default()
        ),
    };
    let seat_allocations = booking
        .passengers
        .iter()
        .filter_map(|p| {
            p.seat_number.map(|seat_number| SeatAllocation {
                passenger_name: p.name.clone(),
                seat_number,
            })
        })
        .collect();

    Ok((
        StatusCode::CREATED,
        Json(CreateBookingResponse {
            success: true,
            message,
            booking_id: Some(booking.id),
            booking_reference: Some(booking.booking_reference),
            status: Some(booking.status),
            total_amount: Some(booking.total_amount),
            waitlist_position: outcome.waitlist_position,
            seat_allocations,
        }),
    ))
}

// -----------------------------------------------------------------------------
// GET BOOKING
// -----------------------------------------------------------------------------
/// GET /api/v1/bookings/:booking_id
///
/// 404 both when the booking is missing and when it belongs to someone else.
pub async fn get_booking(
    State(state): State<Arc<AppState>>,
    principal: Principal,
    Path(booking_id): Path<Uuid>,
) -> AppResult<Json<Booking>> {
    let start = Instant::now();
    let result = state.allocator.booking(&principal.user_id, booking_id).await;
    observe("GET", "/api/v1/bookings/:booking_id", StatusCode::OK, start, result).map(Json)
}

// -----------------------------------------------------------------------------
// CANCEL BOOKING
// -----------------------------------------------------------------------------
/// POST /api/v1/bookings/:booking_id/cancel
///
/// Body is optional: `{ "reason": "..." }`.
///
/// # Response
/// - 200 OK: cancelled, with refund amount
/// - 409 Conflict: already cancelled
/// - 422 Unprocessable Entity: the schedule has departed
pub async fn cancel_booking(
    State(state): State<Arc<AppState>>,
    principal: Principal,
    Path(booking_id): Path<Uuid>,
    request: Option<Json<CancelBookingRequest>>,
) -> AppResult<Json<CancelBookingResponse>> {
    let start = Instant::now();
    let reason = request.and_then(|Json(r)| r.reason);

    let result = state
        .allocator
        .cancel_booking(&principal.user_id, booking_id, reason)
        .await;

    let outcome = observe(
        "POST",
        "/api/v1/bookings/:booking_id/cancel",
        StatusCode::OK,
        start,
        result,
    )?;

    let message = match outcome.promoted.len() {
        0 => "Booking cancelled".to_string(),
        n => format!("Booking cancelled; {} waitlisted booking(s) confirmed", n),
    };

    Ok(Json(CancelBookingResponse {
        success: true,
        message,
        refund_amount: Some(outcome.refund_amount),
    }))
}

// -----------------------------------------------------------------------------
// WAITLIST POSITION
// -----------------------------------------------------------------------------
/// GET /api/v1/bookings/:booking_id/waitlist
pub async fn booking_waitlist_position(
    State(state): State<Arc<AppState>>,
    principal: Principal,
    Path(booking_id): Path<Uuid>,
) -> AppResult<Json<WaitlistPositionResponse>> {
    let start = Instant::now();
    let result = state
        .allocator
        .waitlist_position(&principal.user_id, booking_id)
        .await;
    observe("GET", "/api/v1/bookings/:booking_id/waitlist", StatusCode::OK, start, result).map(Json)
}

/// GET /api/v1/schedules/:schedule_id/waitlist
///
/// Position of the caller's earliest waitlisted booking on the schedule.
pub async fn schedule_waitlist_position(
    State(state): State<Arc<AppState>>,
    principal: Principal,
    Path(schedule_id): Path<Uuid>,
) -> AppResult<Json<WaitlistPositionResponse>> {
    let start = Instant::now();
    let result = state
        .allocator
        .waitlist_position_for_user(schedule_id, &principal.user_id)
        .await;
    observe("GET", "/api/v1/schedules/:schedule_id/waitlist", StatusCode::OK, start, result).map(Json)
}

// =============================================================================
// SCHEDULE API ENDPOINTS
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct LayoutParams {
    pub train_class: String,
}

/// GET /api/v1/schedules/:schedule_id/layout?train_class=3A
pub async fn coach_layout(
    State(state): State<Arc<AppState>>,
    Path(schedule_id): Path<Uuid>,
    Query(params): Query<LayoutParams>,
) -> AppResult<Json<CoachLayoutResponse>> {
    let start = Instant::now();
    let endpoint = "/api/v1/schedules/:schedule_id/layout";

    if params.train_class.trim().is_empty() {
        return observe(
            "GET",
            endpoint,
            StatusCode::OK,
            start,
            Err(AppError::Validation("train_class is required".to_string())),
        );
    }

    let result = state
        .allocator
        .coach_layout(schedule_id, &params.train_class)
        .await;
    observe("GET", endpoint, StatusCode::OK, start, result).map(Json)
}

/// GET /api/v1/schedules/:schedule_id/fares
pub async fn fare_quote(
    State(state): State<Arc<AppState>>,
    Path(schedule_id): Path<Uuid>,
) -> AppResult<Json<FareQuoteResponse>> {
    let start = Instant::now();
    let result = state.allocator.fare_quote(schedule_id).await;
    observe("GET", "/api/v1/schedules/:schedule_id/fares", StatusCode::OK, start, result).map(Json)
}
