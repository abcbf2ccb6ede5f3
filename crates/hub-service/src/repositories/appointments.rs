//! Postgres appointment repository.
//!
//! The `appointments` table is owned by the booking system; the hub only
//! reads it and stamps call start/end and completion.

use super::AppointmentRepository;
use crate::errors::HubError;
use crate::models::{Appointment, AppointmentStatus, AppointmentUpdate};
use crate::observability::metrics;

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use std::time::Instant;
use tracing::instrument;

pub struct PgAppointmentRepository {
    pool: PgPool,
}

impl PgAppointmentRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AppointmentRepository for PgAppointmentRepository {
    #[instrument(skip_all, name = "hub.repo.find_appointment")]
    async fn find_by_id(&self, id: &str) -> Result<Option<Appointment>, HubError> {
        let start = Instant::now();

        let row = sqlx::query(
            r#"
            SELECT id, doctor_id, user_id, appointment_status,
                   call_start_time, call_end_time
            FROM appointments
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            metrics::record_db_query("find_appointment", "error", start.elapsed());
            HubError::from(e)
        })?;

        metrics::record_db_query("find_appointment", "success", start.elapsed());

        row.map(map_row_to_appointment).transpose()
    }

    #[instrument(skip_all, name = "hub.repo.update_appointment")]
    async fn update(&self, id: &str, update: AppointmentUpdate) -> Result<(), HubError> {
        let start = Instant::now();

        // NULL parameters leave the column unchanged
        let result = sqlx::query(
            r#"
            UPDATE appointments
            SET call_start_time = COALESCE($2, call_start_time),
                call_end_time = COALESCE($3, call_end_time),
                appointment_status = COALESCE($4, appointment_status),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id) // $1
        .bind(update.call_start_time) // $2
        .bind(update.call_end_time) // $3
        .bind(update.appointment_status.map(|s| s.as_str())) // $4
        .execute(&self.pool)
        .await
        .map_err(|e| {
            metrics::record_db_query("update_appointment", "error", start.elapsed());
            HubError::from(e)
        })?;

        metrics::record_db_query("update_appointment", "success", start.elapsed());

        if result.rows_affected() == 0 {
            return Err(HubError::NotFound("Appointment not found".to_string()));
        }
        Ok(())
    }
}

fn map_row_to_appointment(row: sqlx::postgres::PgRow) -> Result<Appointment, HubError> {
    let status: String = row.try_get("appointment_status")?;
    let appointment_status: AppointmentStatus =
        status.parse().map_err(HubError::Persistence)?;

    Ok(Appointment {
        id: row.try_get("id")?,
        doctor_id: row.try_get("doctor_id")?,
        user_id: row.try_get("user_id")?,
        appointment_status,
        call_start_time: row.try_get("call_start_time")?,
        call_end_time: row.try_get("call_end_time")?,
    })
}
