use chrono::{NaiveTime, Utc, Weekday};
use sqlx::PgPool;
use uuid::Uuid;

use consultbook_common::{AppError, SessionType};

use crate::models::{Consultant, WeeklyAvailabilityPattern};
use crate::postgres::PgBookingStore;
use crate::store::BookingStore;

pub const DEMO_CONSULTANT_SLUG: &str = "demo-consultant";

pub struct MigrationRunner {
    pool: PgPool,
}

impl MigrationRunner {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn run_all_migrations(&self) -> Result<(), AppError> {
        tracing::info!("Starting database migrations...");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::Internal(format!("migration failed: {}", e)))?;

        tracing::info!("All migrations completed successfully");
        Ok(())
    }

    pub async fn check_migration_status(&self) -> Result<MigrationStatus, AppError> {
        let migrator = sqlx::migrate!("./migrations");
        let total = migrator.migrations.len();

        let table_exists = sqlx::query_scalar::<_, bool>(
            "SELECT to_regclass('public._sqlx_migrations') IS NOT NULL",
        )
        .fetch_one(&self.pool)
        .await?;

        let applied = if table_exists {
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM _sqlx_migrations WHERE success")
                .fetch_one(&self.pool)
                .await? as usize
        } else {
            0
        };
        let pending = total.saturating_sub(applied);

        Ok(MigrationStatus {
            total,
            applied,
            pending,
            is_up_to_date: pending == 0,
        })
    }

    /// Demo consultant with a Monday 10:00-11:00 PERSONAL window. Returns the
    /// consultant id; does nothing when the slug already exists.
    pub async fn seed_demo_data(&self) -> Result<Uuid, AppError> {
        let existing = sqlx::query_scalar::<_, Uuid>("SELECT id FROM consultants WHERE slug = $1")
            .bind(DEMO_CONSULTANT_SLUG)
            .fetch_optional(&self.pool)
            .await?;
        if let Some(id) = existing {
            tracing::info!(consultant_id = %id, "Demo consultant already present");
            return Ok(id);
        }

        let store = PgBookingStore::new(self.pool.clone());
        let consultant = Consultant {
            id: Uuid::new_v4(),
            slug: DEMO_CONSULTANT_SLUG.to_string(),
            display_name: "Demo Consultant".to_string(),
            owner_user_id: Uuid::new_v4(),
            timezone: "Asia/Kolkata".to_string(),
            created_at: Utc::now(),
        };
        store.insert_consultant(&consultant).await?;

        let window = |h: u32| {
            NaiveTime::from_hms_opt(h, 0, 0)
                .ok_or_else(|| AppError::Internal(format!("invalid hour {}", h)))
        };
        store
            .insert_pattern(&WeeklyAvailabilityPattern {
                id: Uuid::new_v4(),
                consultant_id: consultant.id,
                session_type: SessionType::Personal,
                day_of_week: Weekday::Mon,
                start_time: window(10)?,
                end_time: window(11)?,
                slot_minutes: None,
                timezone: consultant.timezone.clone(),
                is_active: true,
            })
            .await?;

        tracing::info!(consultant_id = %consultant.id, "Demo consultant seeded");
        Ok(consultant.id)
    }
}

#[derive(Debug)]
pub struct MigrationStatus {
    pub total: usize,
    pub applied: usize,
    pub pending: usize,
    pub is_up_to_date: bool,
}

impl std::fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Migrations: {}/{} applied, {} pending",
            self.applied, self.total, self.pending
        )
    }
}
