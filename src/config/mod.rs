use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub providers: ProviderConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub billing: BillingConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            data_dir: default_data_dir(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_admin_email")]
    pub admin_email: String,
    #[serde(default)]
    pub admin_password: String,
    /// Static API token accepted alongside user sessions.
    #[serde(default = "default_admin_token")]
    pub admin_token: String,
    #[serde(default = "default_session_ttl_days")]
    pub session_ttl_days: i64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            admin_email: default_admin_email(),
            admin_password: String::new(),
            admin_token: default_admin_token(),
            session_ttl_days: default_session_ttl_days(),
        }
    }
}

fn default_admin_email() -> String {
    "admin@localhost".to_string()
}

fn default_admin_token() -> String {
    // Generate a random token if not provided
    uuid::Uuid::new_v4().to_string()
}

fn default_session_ttl_days() -> i64 {
    7
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    pub openai_api_key: Option<String>,
    pub gemini_api_key: Option<String>,
    pub groq_api_key: Option<String>,
    /// Ordered fallback list; providers are tried in exactly this order.
    #[serde(default = "default_fallback_order")]
    pub fallback_order: Vec<String>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            openai_api_key: None,
            gemini_api_key: None,
            groq_api_key: None,
            fallback_order: default_fallback_order(),
            request_timeout_secs: default_request_timeout(),
            max_output_tokens: default_max_output_tokens(),
            temperature: default_temperature(),
        }
    }
}

fn default_fallback_order() -> Vec<String> {
    vec![
        "gemini".to_string(),
        "groq".to_string(),
        "openai".to_string(),
    ]
}

fn default_request_timeout() -> u64 {
    30
}

fn default_max_output_tokens() -> u32 {
    2048
}

fn default_temperature() -> f32 {
    0.7
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchConfig {
    /// Per-source time window in seconds; slow sources are dropped, not awaited.
    #[serde(default = "default_source_timeout")]
    pub source_timeout_secs: u64,
    /// Contact email forwarded to the OpenAlex/Crossref polite pools.
    pub contact_email: Option<String>,
    #[serde(default = "default_true")]
    pub enable_arxiv: bool,
    #[serde(default = "default_true")]
    pub enable_doaj: bool,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            source_timeout_secs: default_source_timeout(),
            contact_email: None,
            enable_arxiv: true,
            enable_doaj: true,
        }
    }
}

fn default_source_timeout() -> u64 {
    8
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct BillingConfig {
    /// Secret key for the Stripe API (checkout session creation).
    pub stripe_secret_key: Option<String>,
    /// Signing secret for verifying Stripe webhook payloads.
    pub stripe_webhook_secret: Option<String>,
    /// Tokens granted per completed checkout, keyed by plan name.
    #[serde(default = "default_plan_grants")]
    pub plan_grants: std::collections::HashMap<String, i64>,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            stripe_secret_key: None,
            stripe_webhook_secret: None,
            plan_grants: default_plan_grants(),
        }
    }
}

fn default_plan_grants() -> std::collections::HashMap<String, i64> {
    let mut grants = std::collections::HashMap::new();
    grants.insert("starter".to_string(), 500);
    grants.insert("pro".to_string(), 2500);
    grants.insert("team".to_string(), 10000);
    grants
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_api_requests")]
    pub api_requests_per_window: u32,
    #[serde(default = "default_auth_requests")]
    pub auth_requests_per_window: u32,
    #[serde(default = "default_stream_requests")]
    pub stream_requests_per_window: u32,
    #[serde(default = "default_webhook_requests")]
    pub webhook_requests_per_window: u32,
    #[serde(default = "default_window_seconds")]
    pub window_seconds: u64,
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_requests_per_window: default_api_requests(),
            auth_requests_per_window: default_auth_requests(),
            stream_requests_per_window: default_stream_requests(),
            webhook_requests_per_window: default_webhook_requests(),
            window_seconds: default_window_seconds(),
            cleanup_interval: default_cleanup_interval(),
        }
    }
}

fn default_api_requests() -> u32 {
    100
}

fn default_auth_requests() -> u32 {
    20
}

fn default_stream_requests() -> u32 {
    30
}

fn default_webhook_requests() -> u32 {
    500
}

fn default_window_seconds() -> u64 {
    60
}

fn default_cleanup_interval() -> u64 {
    300
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            info!("Loading configuration from {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| "Failed to parse configuration file")?;
            Ok(config)
        } else {
            info!("No config file found, using defaults");
            Ok(Config::default())
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            auth: AuthConfig::default(),
            providers: ProviderConfig::default(),
            search: SearchConfig::default(),
            billing: BillingConfig::default(),
            rate_limit: RateLimitConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}
