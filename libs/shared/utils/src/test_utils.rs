use std::sync::Arc;

use chrono::{Duration, Utc};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::json;
use uuid::Uuid;

use shared_config::{
    AppConfig, JitsiConfig, LiveKitConfig, TelemedicineSettings, ZoomConfig,
};
use shared_models::auth::User;

pub struct TestConfig {
    pub jwt_secret: String,
    pub supabase_url: String,
    pub supabase_anon_key: String,
    pub provider_base_url: String,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            jwt_secret: "test-secret-key-for-jwt-validation-must-be-long-enough".to_string(),
            supabase_url: "http://localhost:54321".to_string(),
            supabase_anon_key: "test-anon-key".to_string(),
            provider_base_url: "http://localhost:9".to_string(),
        }
    }
}

impl TestConfig {
    /// Point provider HTTP APIs (Zoom, LiveKit) at a mock server
    pub fn with_provider_base_url(mut self, url: impl Into<String>) -> Self {
        self.provider_base_url = url.into();
        self
    }

    pub fn with_supabase_url(mut self, url: impl Into<String>) -> Self {
        self.supabase_url = url.into();
        self
    }

    /// Test settings: single attempt, short timeouts, no grace period
    pub fn settings() -> TelemedicineSettings {
        TelemedicineSettings {
            room_grace_period_secs: 0,
            message_backlog_size: 10,
            outbound_buffer_size: 16,
            waiting_room_timeout_secs: 900,
            sweep_interval_secs: 1,
            provider_timeout_secs: 2,
            provider_max_attempts: 1,
            provider_initial_backoff_ms: 1,
            ..TelemedicineSettings::default()
        }
    }

    pub fn to_app_config(&self) -> AppConfig {
        AppConfig {
            supabase_url: self.supabase_url.clone(),
            supabase_anon_key: self.supabase_anon_key.clone(),
            supabase_jwt_secret: self.jwt_secret.clone(),
            zoom: Some(ZoomConfig {
                api_base_url: self.provider_base_url.clone(),
                access_token: "test-zoom-token".to_string(),
                user_id: "me".to_string(),
                webhook_secret_token: "test-zoom-webhook-secret".to_string(),
            }),
            livekit: Some(LiveKitConfig {
                host: self.provider_base_url.clone(),
                api_key: "test-livekit-key".to_string(),
                api_secret: "test-livekit-secret-that-is-long-enough".to_string(),
                meet_url: "https://meet.livekit.test/custom".to_string(),
            }),
            jitsi: Some(JitsiConfig {
                domain: "meet.jitsi.test".to_string(),
                app_id: "telemedicine-test".to_string(),
                app_secret: Some("test-jitsi-app-secret".to_string()),
                webhook_token: "test-jitsi-webhook-token".to_string(),
            }),
            telemedicine: Self::settings(),
        }
    }

    pub fn to_arc(&self) -> Arc<AppConfig> {
        Arc::new(self.to_app_config())
    }
}

pub struct TestUser {
    pub id: Uuid,
    pub email: String,
    pub role: String,
}

impl Default for TestUser {
    fn default() -> Self {
        Self {
            id: Uuid::new_v4(),
            email: "test@example.com".to_string(),
            role: "patient".to_string(),
        }
    }
}

impl TestUser {
    pub fn new(email: &str, role: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            email: email.to_string(),
            role: role.to_string(),
        }
    }

    pub fn doctor(email: &str) -> Self {
        Self::new(email, "doctor")
    }

    pub fn patient(email: &str) -> Self {
        Self::new(email, "patient")
    }

    pub fn admin(email: &str) -> Self {
        Self::new(email, "admin")
    }

    pub fn to_user(&self) -> User {
        User {
            id: self.id.to_string(),
            email: Some(self.email.clone()),
            role: Some(self.role.clone()),
            metadata: None,
            created_at: Some(Utc::now()),
        }
    }
}

pub struct JwtTestUtils;

impl JwtTestUtils {
    pub fn create_test_token(user: &TestUser, secret: &str, exp_hours: Option<i64>) -> String {
        let now = Utc::now();
        let exp = now + Duration::hours(exp_hours.unwrap_or(24));

        let claims = json!({
            "sub": user.id.to_string(),
            "email": user.email,
            "role": user.role,
            "iat": now.timestamp(),
            "exp": exp.timestamp()
        });

        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .expect("HS256 encoding of static claims cannot fail")
    }

    pub fn create_expired_token(user: &TestUser, secret: &str) -> String {
        Self::create_test_token(user, secret, Some(-1))
    }

    pub fn create_invalid_signature_token(user: &TestUser) -> String {
        Self::create_test_token(user, "wrong-secret", Some(24))
    }

    pub fn create_malformed_token() -> String {
        "invalid.token.format".to_string()
    }
}

pub struct MockSupabaseResponses;

impl MockSupabaseResponses {
    /// Row shape returned by `/rest/v1/appointments` for a booking lookup
    pub fn appointment_response(
        appointment_id: Uuid,
        patient_id: Uuid,
        doctor_id: Uuid,
        status: &str,
    ) -> serde_json::Value {
        json!({
            "id": appointment_id,
            "patient_id": patient_id,
            "doctor_id": doctor_id,
            "appointment_date": (Utc::now() + Duration::hours(1)).to_rfc3339(),
            "status": status,
            "appointment_type": "video_consultation",
            "duration_minutes": 30
        })
    }

    pub fn error_response(message: &str, code: &str) -> serde_json::Value {
        json!({
            "message": message,
            "code": code
        })
    }
}
