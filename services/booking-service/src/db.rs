// =============================================================================
// DATABASE MODULE
// =============================================================================
// PostgreSQL implementation of `BookingStore` and `Catalog`.
//
// NOTES:
// - One transaction per allocation commit; any failed statement rolls the
//   whole change set back (the transaction is dropped without commit)
// - CHECK constraints repeat the inventory bounds, and a deferred UNIQUE
//   constraint on (schedule_id, seat_number) repeats the no-collision rule
//   at the storage layer
// =============================================================================

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, FromRow, PgPool, Postgres, Transaction};
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::inventory::ScheduleInventory;
use crate::models::{
    Booking, BookingStatus, Gender, Passenger, Quota, ScheduleInfo, WaitlistEntry,
    WaitlistPriority,
};
use crate::store::{
    sample_schedules, validate_capacity, BookingStore, Catalog, ScheduleChanges, ScheduleSnapshot,
};

// -----------------------------------------------------------------------------
// DATABASE WRAPPER
// -----------------------------------------------------------------------------
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

// -----------------------------------------------------------------------------
// ROW TYPES
// -----------------------------------------------------------------------------
// Flat rows as stored; converted into domain types below.

#[derive(Debug, FromRow)]
struct ScheduleRow {
    id: Uuid,
    service_name: String,
    origin: String,
    destination: String,
    train_class: String,
    departure_at: DateTime<Utc>,
    base_fare: f64,
}

#[derive(Debug, FromRow)]
struct InventoryRow {
    total_seats: i32,
    available_seats: i32,
}

#[derive(Debug, FromRow)]
struct BookingRow {
    id: Uuid,
    user_id: String,
    schedule_id: Uuid,
    passenger_count: i32,
    total_amount: f64,
    booking_reference: String,
    status: String,
    quota: String,
    cancellation_reason: Option<String>,
    created_at: DateTime<Utc>,
    cancelled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, FromRow)]
struct PassengerRow {
    id: Uuid,
    booking_id: Uuid,
    name: String,
    age: i32,
    gender: String,
    seat_number: Option<i32>,
}

#[derive(Debug, FromRow)]
struct WaitlistRow {
    id: Uuid,
    booking_id: Uuid,
    schedule_id: Uuid,
    train_class: String,
    priority: i32,
    position: i32,
    queued_at: DateTime<Utc>,
    is_active: bool,
    confirmed_at: Option<DateTime<Utc>>,
}

fn corrupt(what: &str, value: impl std::fmt::Display) -> AppError {
    AppError::Consistency(format!("stored {} has unknown value {}", what, value))
}

impl From<ScheduleRow> for ScheduleInfo {
    fn from(row: ScheduleRow) -> Self {
        ScheduleInfo {
            schedule_id: row.id,
            service_name: row.service_name,
            origin: row.origin,
            destination: row.destination,
            train_class: row.train_class,
            departure_at: row.departure_at,
            base_fare: row.base_fare,
        }
    }
}

impl TryFrom<WaitlistRow> for WaitlistEntry {
    type Error = AppError;

    fn try_from(row: WaitlistRow) -> AppResult<Self> {
        Ok(WaitlistEntry {
            id: row.id,
            booking_id: row.booking_id,
            schedule_id: row.schedule_id,
            train_class: row.train_class,
            priority: WaitlistPriority::from_rank(row.priority)
                .ok_or_else(|| corrupt("waitlist priority", row.priority))?,
            position: row.position,
            queued_at: row.queued_at,
            is_active: row.is_active,
            confirmed_at: row.confirmed_at,
        })
    }
}

impl Database {
    // -------------------------------------------------------------------------
    // CONNECTION
    // -------------------------------------------------------------------------
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .min_connections(2)
            .acquire_timeout(std::time::Duration::from_secs(5))
            .idle_timeout(std::time::Duration::from_secs(300))
            .connect(database_url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        Ok(Self { pool })
    }

    // -------------------------------------------------------------------------
    // MIGRATIONS
    // -------------------------------------------------------------------------
    /// Create tables if missing and seed sample schedules on an empty
    /// database. Safe to run on every start.
    pub async fn run_migrations(&self) -> Result<()> {
        let statements = [
            (
                "schedules",
                r#"
                CREATE TABLE IF NOT EXISTS schedules (
                    id UUID PRIMARY KEY,
                    service_name VARCHAR(120) NOT NULL,
                    origin VARCHAR(16) NOT NULL,
                    destination VARCHAR(16) NOT NULL,
                    train_class VARCHAR(8) NOT NULL,
                    departure_at TIMESTAMPTZ NOT NULL,
                    base_fare DOUBLE PRECISION NOT NULL CHECK (base_fare >= 0),
                    -- Schedules are deactivated, never deleted
                    is_active BOOLEAN NOT NULL DEFAULT TRUE,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                )
                "#,
            ),
            (
                "schedule_inventory",
                r#"
                CREATE TABLE IF NOT EXISTS schedule_inventory (
                    schedule_id UUID PRIMARY KEY REFERENCES schedules(id),
                    total_seats INTEGER NOT NULL,
                    available_seats INTEGER NOT NULL,
                    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    CONSTRAINT valid_capacity CHECK (total_seats BETWEEN 1 AND 100),
                    CONSTRAINT valid_available CHECK (
                        available_seats >= 0 AND available_seats <= total_seats
                    )
                )
                "#,
            ),
            (
                "bookings",
                r#"
                CREATE TABLE IF NOT EXISTS bookings (
                    id UUID PRIMARY KEY,
                    user_id VARCHAR(64) NOT NULL,
                    schedule_id UUID NOT NULL REFERENCES schedules(id),
                    passenger_count INTEGER NOT NULL CHECK (passenger_count > 0),
                    total_amount DOUBLE PRECISION NOT NULL,
                    booking_reference VARCHAR(16) UNIQUE NOT NULL,
                    status VARCHAR(16) NOT NULL
                        CHECK (status IN ('confirmed', 'waitlisted', 'cancelled')),
                    quota VARCHAR(16) NOT NULL,
                    cancellation_reason TEXT,
                    created_at TIMESTAMPTZ NOT NULL,
                    cancelled_at TIMESTAMPTZ
                )
                "#,
            ),
            (
                "passengers",
                r#"
                CREATE TABLE IF NOT EXISTS passengers (
                    id UUID PRIMARY KEY,
                    booking_id UUID NOT NULL REFERENCES bookings(id) ON DELETE CASCADE,
                    schedule_id UUID NOT NULL,
                    ordinal INTEGER NOT NULL,
                    name VARCHAR(120) NOT NULL,
                    age INTEGER NOT NULL,
                    gender VARCHAR(8) NOT NULL,
                    -- NULL while waitlisted or cancelled
                    seat_number INTEGER,
                    -- Deferred: promotion moves a seat from one passenger to
                    -- another inside one transaction
                    CONSTRAINT unique_seat_per_schedule UNIQUE (schedule_id, seat_number)
                        DEFERRABLE INITIALLY DEFERRED
                )
                "#,
            ),
            (
                "waitlist_entries",
                r#"
                CREATE TABLE IF NOT EXISTS waitlist_entries (
                    id UUID PRIMARY KEY,
                    booking_id UUID UNIQUE NOT NULL REFERENCES bookings(id),
                    schedule_id UUID NOT NULL REFERENCES schedules(id),
                    train_class VARCHAR(8) NOT NULL,
                    priority INTEGER NOT NULL CHECK (priority IN (1, 2)),
                    position INTEGER NOT NULL CHECK (position > 0),
                    queued_at TIMESTAMPTZ NOT NULL,
                    is_active BOOLEAN NOT NULL DEFAULT TRUE,
                    confirmed_at TIMESTAMPTZ
                )
                "#,
            ),
            (
                "booking indexes",
                "CREATE INDEX IF NOT EXISTS idx_bookings_schedule ON bookings(schedule_id)",
            ),
            (
                "passenger indexes",
                "CREATE INDEX IF NOT EXISTS idx_passengers_schedule ON passengers(schedule_id)",
            ),
            (
                "waitlist indexes",
                r#"
                CREATE INDEX IF NOT EXISTS idx_waitlist_active
                ON waitlist_entries(schedule_id, train_class, priority, position)
                WHERE is_active
                "#,
            ),
        ];

        for (name, sql) in statements {
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .with_context(|| format!("Failed to create {}", name))?;
        }

        self.seed_sample_data().await?;
        Ok(())
    }

    async fn seed_sample_data(&self) -> Result<()> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM schedules")
            .fetch_one(&self.pool)
            .await?;
        if count.0 > 0 {
            return Ok(());
        }

        for (info, total_seats) in sample_schedules(Utc::now()) {
            self.publish_schedule(&info, total_seats)
                .await
                .with_context(|| format!("Failed to seed {}", info.service_name))?;
        }
        tracing::info!("Seeded sample schedules");
        Ok(())
    }

    /// Insert a schedule with all of its seats available.
    pub async fn publish_schedule(&self, info: &ScheduleInfo, total_seats: i32) -> AppResult<()> {
        validate_capacity(total_seats)?;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO schedules
                (id, service_name, origin, destination, train_class, departure_at, base_fare)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(info.schedule_id)
        .bind(&info.service_name)
        .bind(&info.origin)
        .bind(&info.destination)
        .bind(&info.train_class)
        .bind(info.departure_at)
        .bind(info.base_fare)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO schedule_inventory (schedule_id, total_seats, available_seats)
            VALUES ($1, $2, $2)
            ON CONFLICT (schedule_id) DO NOTHING
            "#,
        )
        .bind(info.schedule_id)
        .bind(total_seats)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // WRITE HELPERS (inside a commit transaction)
    // -------------------------------------------------------------------------

    async fn upsert_booking(tx: &mut Transaction<'_, Postgres>, booking: &Booking) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO bookings
                (id, user_id, schedule_id, passenger_count, total_amount, booking_reference,
                 status, quota, cancellation_reason, created_at, cancelled_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status,
                cancellation_reason = EXCLUDED.cancellation_reason,
                cancelled_at = EXCLUDED.cancelled_at
            "#,
        )
        .bind(booking.id)
        .bind(&booking.user_id)
        .bind(booking.schedule_id)
        .bind(booking.passenger_count)
        .bind(booking.total_amount)
        .bind(&booking.booking_reference)
        .bind(booking.status.as_str())
        .bind(booking.quota.as_str())
        .bind(&booking.cancellation_reason)
        .bind(booking.created_at)
        .bind(booking.cancelled_at)
        .execute(&mut **tx)
        .await?;

        // Only seat_number is ever rewritten after creation.
        for (ordinal, passenger) in booking.passengers.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO passengers
                    (id, booking_id, schedule_id, ordinal, name, age, gender, seat_number)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ON CONFLICT (id) DO UPDATE SET seat_number = EXCLUDED.seat_number
                "#,
            )
            .bind(passenger.id)
            .bind(booking.id)
            .bind(booking.schedule_id)
            .bind(ordinal as i32)
            .bind(&passenger.name)
            .bind(passenger.age)
            .bind(passenger.gender.as_str())
            .bind(passenger.seat_number)
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }

    async fn upsert_waitlist_entry(
        tx: &mut Transaction<'_, Postgres>,
        entry: &WaitlistEntry,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO waitlist_entries
                (id, booking_id, schedule_id, train_class, priority, position,
                 queued_at, is_active, confirmed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (id) DO UPDATE SET
                position = EXCLUDED.position,
                is_active = EXCLUDED.is_active,
                confirmed_at = EXCLUDED.confirmed_at
            "#,
        )
        .bind(entry.id)
        .bind(entry.booking_id)
        .bind(entry.schedule_id)
        .bind(&entry.train_class)
        .bind(entry.priority.rank())
        .bind(entry.position)
        .bind(entry.queued_at)
        .bind(entry.is_active)
        .bind(entry.confirmed_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

// =============================================================================
// BOOKING STORE
// =============================================================================
#[async_trait]
impl BookingStore for Database {
    async fn load_schedule(&self, schedule_id: Uuid) -> AppResult<Option<ScheduleSnapshot>> {
        let Some(inv) = sqlx::query_as::<_, InventoryRow>(
            "SELECT total_seats, available_seats FROM schedule_inventory WHERE schedule_id = $1",
        )
        .bind(schedule_id)
        .fetch_optional(&self.pool)
        .await?
        else {
            return Ok(None);
        };
        let inventory = ScheduleInventory::restore(schedule_id, inv.total_seats, inv.available_seats)?;

        let booking_rows = sqlx::query_as::<_, BookingRow>(
            r#"
            SELECT id, user_id, schedule_id, passenger_count, total_amount, booking_reference,
                   status, quota, cancellation_reason, created_at, cancelled_at
            FROM bookings
            WHERE schedule_id = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(schedule_id)
        .fetch_all(&self.pool)
        .await?;

        let passenger_rows = sqlx::query_as::<_, PassengerRow>(
            r#"
            SELECT id, booking_id, name, age, gender, seat_number
            FROM passengers
            WHERE schedule_id = $1
            ORDER BY booking_id, ordinal ASC
            "#,
        )
        .bind(schedule_id)
        .fetch_all(&self.pool)
        .await?;

        let mut rosters: HashMap<Uuid, Vec<Passenger>> = HashMap::new();
        for row in passenger_rows {
            rosters.entry(row.booking_id).or_default().push(Passenger {
                id: row.id,
                name: row.name,
                age: row.age,
                gender: Gender::parse(&row.gender).ok_or_else(|| corrupt("gender", &row.gender))?,
                seat_number: row.seat_number,
            });
        }

        let mut bookings = Vec::with_capacity(booking_rows.len());
        for row in booking_rows {
            bookings.push(Booking {
                id: row.id,
                passengers: rosters.remove(&row.id).unwrap_or_default(),
                user_id: row.user_id,
                schedule_id: row.schedule_id,
                passenger_count: row.passenger_count,
                total_amount: row.total_amount,
                booking_reference: row.booking_reference,
                status: BookingStatus::parse(&row.status)
                    .ok_or_else(|| corrupt("booking status", &row.status))?,
                quota: Quota::parse(&row.quota).ok_or_else(|| corrupt("quota", &row.quota))?,
                cancellation_reason: row.cancellation_reason,
                created_at: row.created_at,
                cancelled_at: row.cancelled_at,
            });
        }

        let waitlist = sqlx::query_as::<_, WaitlistRow>(
            r#"
            SELECT id, booking_id, schedule_id, train_class, priority, position,
                   queued_at, is_active, confirmed_at
            FROM waitlist_entries
            WHERE schedule_id = $1
            ORDER BY queued_at ASC
            "#,
        )
        .bind(schedule_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(WaitlistEntry::try_from)
        .collect::<AppResult<Vec<_>>>()?;

        Ok(Some(ScheduleSnapshot {
            inventory,
            bookings,
            waitlist,
        }))
    }

    async fn booking_schedule(&self, booking_id: Uuid) -> AppResult<Option<Uuid>> {
        let row: Option<(Uuid,)> = sqlx::query_as("SELECT schedule_id FROM bookings WHERE id = $1")
            .bind(booking_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.0))
    }

    async fn reference_taken(&self, reference: &str) -> AppResult<bool> {
        let row: (bool,) =
            sqlx::query_as("SELECT EXISTS (SELECT 1 FROM bookings WHERE booking_reference = $1)")
                .bind(reference)
                .fetch_one(&self.pool)
                .await?;
        Ok(row.0)
    }

    async fn commit(&self, changes: &ScheduleChanges) -> AppResult<()> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE schedule_inventory
            SET available_seats = $1, updated_at = NOW()
            WHERE schedule_id = $2
            "#,
        )
        .bind(changes.available_seats)
        .bind(changes.schedule_id)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("schedule {}", changes.schedule_id)));
        }

        for booking in &changes.bookings {
            Self::upsert_booking(&mut tx, booking).await?;
        }
        // Entries reference their bookings, so bookings go first.
        for entry in &changes.waitlist {
            Self::upsert_waitlist_entry(&mut tx, entry).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn health_check(&self) -> bool {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await.is_ok()
    }
}

// =============================================================================
// CATALOG
// =============================================================================
#[async_trait]
impl Catalog for Database {
    async fn schedule(&self, schedule_id: Uuid) -> AppResult<Option<ScheduleInfo>> {
        let row = sqlx::query_as::<_, ScheduleRow>(
            r#"
            SELECT id, service_name, origin, destination, train_class, departure_at, base_fare
            FROM schedules
            WHERE id = $1 AND is_active
            "#,
        )
        .bind(schedule_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(ScheduleInfo::from))
    }
}
