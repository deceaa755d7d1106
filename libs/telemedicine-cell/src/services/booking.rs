// libs/telemedicine-cell/src/services/booking.rs
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Method;
use serde::Deserialize;
use tracing::{debug, warn};
use uuid::Uuid;

use shared_config::AppConfig;
use shared_database::supabase::SupabaseClient;

use crate::error::TelemedicineError;

/// The slice of a booking the orchestrator needs
#[derive(Debug, Clone, Deserialize)]
pub struct BookingRecord {
    pub id: Uuid,
    pub doctor_id: Uuid,
    pub patient_id: Uuid,
    #[serde(rename = "appointment_date")]
    pub scheduled_time: DateTime<Utc>,
    pub status: String,
}

impl BookingRecord {
    pub fn is_cancelled(&self) -> bool {
        self.status.eq_ignore_ascii_case("cancelled") || self.status.eq_ignore_ascii_case("canceled")
    }
}

/// Read-only view of the booking system
#[async_trait]
pub trait BookingDirectory: Send + Sync {
    /// `auth_token` is the caller's bearer token, forwarded so row-level security applies
    async fn get_booking(
        &self,
        booking_id: Uuid,
        auth_token: Option<&str>,
    ) -> Result<BookingRecord, TelemedicineError>;
}

/// Reads bookings from the `appointments` table
pub struct SupabaseBookingDirectory {
    supabase: SupabaseClient,
}

impl SupabaseBookingDirectory {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            supabase: SupabaseClient::new(config),
        }
    }
}

#[async_trait]
impl BookingDirectory for SupabaseBookingDirectory {
    async fn get_booking(
        &self,
        booking_id: Uuid,
        auth_token: Option<&str>,
    ) -> Result<BookingRecord, TelemedicineError> {
        debug!("Fetching booking {}", booking_id);

        let path = format!(
            "/rest/v1/appointments?id=eq.{}&select=id,doctor_id,patient_id,appointment_date,status",
            booking_id
        );
        let rows: Vec<BookingRecord> = self.supabase.request(Method::GET, &path, auth_token, None).await?;

        let booking = rows.into_iter().next().ok_or_else(|| {
            warn!("Booking {} not found", booking_id);
            TelemedicineError::BookingNotFound
        })?;

        if booking.is_cancelled() {
            return Err(TelemedicineError::validation(format!(
                "booking {} is cancelled",
                booking_id
            )));
        }

        Ok(booking)
    }
}
