use std::env;
use std::str::FromStr;
use tracing::warn;

/// Zoom REST credentials (server-to-server access token + webhook secret)
#[derive(Debug, Clone)]
pub struct ZoomConfig {
    pub api_base_url: String,
    pub access_token: String,
    pub user_id: String,
    pub webhook_secret_token: String,
}

/// LiveKit project credentials; the API secret signs both access tokens and webhooks
#[derive(Debug, Clone)]
pub struct LiveKitConfig {
    pub host: String,
    pub api_key: String,
    pub api_secret: String,
    pub meet_url: String,
}

/// Jitsi deployment. `app_secret` is optional: without it rooms are joined anonymously.
#[derive(Debug, Clone)]
pub struct JitsiConfig {
    pub domain: String,
    pub app_id: String,
    pub app_secret: Option<String>,
    pub webhook_token: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    Supabase,
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(StoreBackend::Memory),
            "supabase" => Ok(StoreBackend::Supabase),
            other => Err(format!("unknown store backend: {}", other)),
        }
    }
}

/// Orchestrator tunables
#[derive(Debug, Clone)]
pub struct TelemedicineSettings {
    pub store_backend: StoreBackend,
    pub room_grace_period_secs: u64,
    pub message_backlog_size: usize,
    pub outbound_buffer_size: usize,
    pub waiting_room_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    pub provider_timeout_secs: u64,
    pub provider_max_attempts: u32,
    pub provider_initial_backoff_ms: u64,
    pub webhook_max_skew_secs: i64,
    pub join_token_ttl_secs: i64,
}

impl Default for TelemedicineSettings {
    fn default() -> Self {
        Self {
            store_backend: StoreBackend::Memory,
            room_grace_period_secs: 30,
            message_backlog_size: 50,
            outbound_buffer_size: 64,
            waiting_room_timeout_secs: 900,
            sweep_interval_secs: 60,
            provider_timeout_secs: 10,
            provider_max_attempts: 3,
            provider_initial_backoff_ms: 200,
            webhook_max_skew_secs: 300,
            join_token_ttl_secs: 6 * 60 * 60,
        }
    }
}

impl TelemedicineSettings {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            store_backend: parse_env("TELEMEDICINE_STORE", defaults.store_backend),
            room_grace_period_secs: parse_env("ROOM_GRACE_PERIOD_SECS", defaults.room_grace_period_secs),
            message_backlog_size: parse_env("MESSAGE_BACKLOG_SIZE", defaults.message_backlog_size),
            outbound_buffer_size: parse_env("OUTBOUND_BUFFER_SIZE", defaults.outbound_buffer_size),
            waiting_room_timeout_secs: parse_env("WAITING_ROOM_TIMEOUT_SECS", defaults.waiting_room_timeout_secs),
            sweep_interval_secs: parse_env("SWEEP_INTERVAL_SECS", defaults.sweep_interval_secs),
            provider_timeout_secs: parse_env("PROVIDER_TIMEOUT_SECS", defaults.provider_timeout_secs),
            provider_max_attempts: parse_env("PROVIDER_MAX_ATTEMPTS", defaults.provider_max_attempts),
            provider_initial_backoff_ms: parse_env("PROVIDER_INITIAL_BACKOFF_MS", defaults.provider_initial_backoff_ms),
            webhook_max_skew_secs: parse_env("WEBHOOK_MAX_SKEW_SECS", defaults.webhook_max_skew_secs),
            join_token_ttl_secs: parse_env("JOIN_TOKEN_TTL_SECS", defaults.join_token_ttl_secs),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub supabase_url: String,
    pub supabase_anon_key: String,
    pub supabase_jwt_secret: String,
    pub zoom: Option<ZoomConfig>,
    pub livekit: Option<LiveKitConfig>,
    pub jitsi: Option<JitsiConfig>,
    pub telemedicine: TelemedicineSettings,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let config = Self {
            supabase_url: env::var("SUPABASE_URL")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_URL not set, using empty value");
                    String::new()
                }),
            supabase_anon_key: env::var("SUPABASE_ANON_PUBLIC_KEY")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_ANON_PUBLIC_KEY not set, using empty value");
                    String::new()
                }),
            supabase_jwt_secret: env::var("SUPABASE_JWT_SECRET")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_JWT_SECRET not set, using empty value");
                    String::new()
                }),
            zoom: Self::zoom_from_env(),
            livekit: Self::livekit_from_env(),
            jitsi: Self::jitsi_from_env(),
            telemedicine: TelemedicineSettings::from_env(),
        };

        if !config.is_configured() {
            warn!("Application not fully configured - missing environment variables");
        }
        if config.configured_providers().is_empty() {
            warn!("No video provider configured - consultations cannot be created");
        }

        config
    }

    fn zoom_from_env() -> Option<ZoomConfig> {
        let access_token = non_empty_var("ZOOM_ACCESS_TOKEN")?;
        let webhook_secret_token = match non_empty_var("ZOOM_WEBHOOK_SECRET_TOKEN") {
            Some(secret) => secret,
            None => {
                warn!("ZOOM_WEBHOOK_SECRET_TOKEN not set, Zoom provider disabled");
                return None;
            }
        };

        Some(ZoomConfig {
            api_base_url: non_empty_var("ZOOM_API_BASE_URL")
                .unwrap_or_else(|| "https://api.zoom.us/v2".to_string()),
            access_token,
            user_id: non_empty_var("ZOOM_USER_ID").unwrap_or_else(|| "me".to_string()),
            webhook_secret_token,
        })
    }

    fn livekit_from_env() -> Option<LiveKitConfig> {
        let host = non_empty_var("LIVEKIT_HOST")?;
        match (non_empty_var("LIVEKIT_API_KEY"), non_empty_var("LIVEKIT_API_SECRET")) {
            (Some(api_key), Some(api_secret)) => Some(LiveKitConfig {
                host,
                api_key,
                api_secret,
                meet_url: non_empty_var("LIVEKIT_MEET_URL")
                    .unwrap_or_else(|| "https://meet.livekit.io/custom".to_string()),
            }),
            _ => {
                warn!("LIVEKIT_API_KEY/LIVEKIT_API_SECRET not set, LiveKit provider disabled");
                None
            }
        }
    }

    fn jitsi_from_env() -> Option<JitsiConfig> {
        let domain = non_empty_var("JITSI_DOMAIN")?;
        let webhook_token = match non_empty_var("JITSI_WEBHOOK_TOKEN") {
            Some(token) => token,
            None => {
                warn!("JITSI_WEBHOOK_TOKEN not set, Jitsi provider disabled");
                return None;
            }
        };

        Some(JitsiConfig {
            domain,
            app_id: non_empty_var("JITSI_APP_ID").unwrap_or_else(|| "telemedicine".to_string()),
            app_secret: non_empty_var("JITSI_APP_SECRET"),
            webhook_token,
        })
    }

    pub fn is_configured(&self) -> bool {
        !self.supabase_url.is_empty()
            && !self.supabase_anon_key.is_empty()
            && !self.supabase_jwt_secret.is_empty()
    }

    /// Names of the providers whose credentials are complete
    pub fn configured_providers(&self) -> Vec<&'static str> {
        let mut providers = Vec::new();
        if self.zoom.is_some() {
            providers.push("zoom");
        }
        if self.livekit.is_some() {
            providers.push("livekit");
        }
        if self.jitsi.is_some() {
            providers.push("jitsi");
        }
        providers
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_env<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    match env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            warn!("{} has an invalid value ({}), using default", key, raw);
            default
        }),
        Err(_) => default,
    }
}
