use std::env;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Distinguishes runtime behavior for different stages of the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEnvironment {
    Development,
    Test,
    Production,
}

impl AppEnvironment {
    fn from_str(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "prod" | "production" => Self::Production,
            "test" | "ci" => Self::Test,
            _ => Self::Development,
        }
    }
}

/// Top-level configuration for the application.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub environment: AppEnvironment,
    pub server: ServerConfig,
    pub telemetry: TelemetryConfig,
    pub storage: StorageConfig,
    pub sweeper: SweeperConfig,
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let environment = AppEnvironment::from_str(
            &env::var("APP_ENV").unwrap_or_else(|_| "development".to_string()),
        );

        let host = env::var("APP_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = env::var("APP_PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse::<u16>()
            .map_err(|_| ConfigError::InvalidPort)?;

        let log_level = env::var("APP_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let database_path = env::var("DOCS_DATABASE_PATH")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .map(PathBuf::from);

        let lead_times_days = match env::var("DOCS_SWEEP_LEAD_DAYS") {
            Ok(raw) => parse_lead_times(&raw)?,
            Err(_) => SweeperConfig::default().lead_times_days,
        };
        let interval = Duration::from_secs(parse_seconds(
            "DOCS_SWEEP_INTERVAL_SECS",
            DEFAULT_SWEEP_INTERVAL_SECS,
        )?);
        let lease_ttl = Duration::from_secs(parse_seconds(
            "DOCS_SWEEP_LEASE_SECS",
            DEFAULT_SWEEP_LEASE_SECS,
        )?);

        Ok(Self {
            environment,
            server: ServerConfig { host, port },
            telemetry: TelemetryConfig { log_level },
            storage: StorageConfig { database_path },
            sweeper: SweeperConfig {
                lead_times_days,
                interval,
                lease_ttl,
            },
        })
    }
}

/// Settings controlling the HTTP server binding.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        if self.host.eq_ignore_ascii_case("localhost") {
            return Ok(SocketAddr::new(IpAddr::from([127, 0, 0, 1]), self.port));
        }

        let ip: IpAddr = self
            .host
            .parse()
            .map_err(|source| ConfigError::InvalidHost { source })?;

        Ok(SocketAddr::new(ip, self.port))
    }
}

/// Tracing controls.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub log_level: String,
}

/// Where document records live; `None` keeps them in an in-memory SQLite database.
#[derive(Debug, Clone, Default)]
pub struct StorageConfig {
    pub database_path: Option<PathBuf>,
}

const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 24 * 60 * 60;
const DEFAULT_SWEEP_LEASE_SECS: u64 = 60 * 60;

/// Cadence and lead times of the document validity sweeper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweeperConfig {
    /// Days before expiry at which a notice goes out, largest first.
    pub lead_times_days: Vec<u32>,
    pub interval: Duration,
    pub lease_ttl: Duration,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            lead_times_days: vec![30, 15, 7, 1],
            interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            lease_ttl: Duration::from_secs(DEFAULT_SWEEP_LEASE_SECS),
        }
    }
}

fn parse_lead_times(raw: &str) -> Result<Vec<u32>, ConfigError> {
    let mut days = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|part| !part.is_empty()) {
        match part.parse::<u32>() {
            Ok(value) if value > 0 => days.push(value),
            _ => {
                return Err(ConfigError::InvalidLeadTimes {
                    value: raw.to_string(),
                })
            }
        }
    }
    if days.is_empty() {
        return Err(ConfigError::InvalidLeadTimes {
            value: raw.to_string(),
        });
    }
    days.sort_unstable_by(|a, b| b.cmp(a));
    days.dedup();
    Ok(days)
}

fn parse_seconds(variable: &'static str, default: u64) -> Result<u64, ConfigError> {
    match env::var(variable) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .ok()
            .filter(|secs| *secs > 0)
            .ok_or(ConfigError::InvalidDuration { variable }),
        Err(_) => Ok(default),
    }
}

#[derive(Debug)]
pub enum ConfigError {
    InvalidPort,
    InvalidHost { source: std::net::AddrParseError },
    InvalidLeadTimes { value: String },
    InvalidDuration { variable: &'static str },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidPort => write!(f, "APP_PORT must be a valid u16"),
            ConfigError::InvalidHost { .. } => {
                write!(f, "APP_HOST must parse to an IPv4 or IPv6 address")
            }
            ConfigError::InvalidLeadTimes { value } => write!(
                f,
                "DOCS_SWEEP_LEAD_DAYS must be a comma-separated list of positive days, got '{}'",
                value
            ),
            ConfigError::InvalidDuration { variable } => {
                write!(f, "{} must be a positive number of seconds", variable)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::InvalidHost { source } => Some(source),
            ConfigError::InvalidPort
            | ConfigError::InvalidLeadTimes { .. }
            | ConfigError::InvalidDuration { .. } => None,
        }
    }
}
