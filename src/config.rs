use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    pub enable_tracing: bool,
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub funds: FundsConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub otp: OtpConfig,
    /// Registered biller integrations
    #[serde(default)]
    pub billers: Vec<BillerEndpoint>,
    /// PostgreSQL connection URL for the durable store
    #[serde(default)]
    pub postgres_url: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
}

/// Fund movement configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct FundsConfig {
    /// Intermediate ledger account holding funds mid-transaction
    pub suspense_account: String,
    pub currency: String,
    /// Core-banking integration endpoint
    pub corebank_endpoint: String,
    pub bank_timeout_ms: u64,
    pub provider_timeout_ms: u64,
}

impl Default for FundsConfig {
    fn default() -> Self {
        Self {
            suspense_account: "SUSPENSE-001".to_string(),
            currency: "MWK".to_string(),
            corebank_endpoint: "http://localhost:9090/api/v1/transfers".to_string(),
            bank_timeout_ms: 15_000,
            provider_timeout_ms: 30_000,
        }
    }
}

/// One biller integration endpoint behind the provider registry.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BillerEndpoint {
    pub code: String,
    pub endpoint: String,
    /// Biller pulls directly from the suspense account
    #[serde(default)]
    pub debit_override: bool,
}

/// Transaction retry scheduler configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RetryConfig {
    /// Backoff base interval in seconds; the delay doubles per attempt
    pub base_interval_secs: u64,
    pub max_retries: u32,
    pub sweep_interval_secs: u64,
    /// Max transactions claimed per sweep
    pub sweep_limit: i64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_interval_secs: 120,
            max_retries: 3,
            sweep_interval_secs: 60,
            sweep_limit: 100,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SessionConfig {
    /// Sliding TTL for session context, in seconds
    pub ttl_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { ttl_secs: 900 }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OtpConfig {
    pub code_ttl_secs: u64,
    pub max_attempts: u32,
}

impl Default for OtpConfig {
    fn default() -> Self {
        Self {
            code_ttl_secs: 600,
            max_attempts: 5,
        }
    }
}

impl AppConfig {
    pub fn load(env: &str) -> Self {
        let config_path = format!("config/{}.yaml", env);
        let content = fs::read_to_string(&config_path)
            .unwrap_or_else(|_| panic!("Failed to read config file: {}", config_path));
        serde_yaml::from_str(&content).expect("Failed to parse config yaml")
    }
}

impl FundsConfig {
    pub fn bank_timeout(&self) -> Duration {
        Duration::from_millis(self.bank_timeout_ms)
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_millis(self.provider_timeout_ms)
    }
}

impl RetryConfig {
    pub fn base_interval(&self) -> Duration {
        Duration::from_secs(self.base_interval_secs)
    }
}

impl SessionConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl OtpConfig {
    pub fn code_ttl(&self) -> Duration {
        Duration::from_secs(self.code_ttl_secs)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: "./logs".to_string(),
            log_file: "kwachaflow.log".to_string(),
            use_json: false,
            rotation: "daily".to_string(),
            enable_tracing: true,
            gateway: GatewayConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
            },
            funds: FundsConfig::default(),
            retry: RetryConfig::default(),
            session: SessionConfig::default(),
            otp: OtpConfig::default(),
            billers: Vec::new(),
            postgres_url: None,
        }
    }
}
