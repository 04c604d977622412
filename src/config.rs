/// Configuration management for Taskgate
use crate::error::{GateError, GateResult};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

/// Main server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub service: ServiceConfig,
    pub storage: StorageConfig,
    pub authentication: AuthConfig,
    pub second_factor: SecondFactorConfig,
    pub csrf: CsrfConfig,
    pub bootstrap: BootstrapConfig,
    pub jobs: JobsConfig,
    pub logging: LoggingConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub hostname: String,
    pub port: u16,
    pub version: String,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub data_directory: PathBuf,
    pub database: PathBuf,
}

/// Token issuance configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub jwt_secret: String,
    /// Access token lifetime in seconds (minutes-scale)
    pub access_token_ttl: i64,
    /// Refresh token lifetime in seconds (multi-day)
    pub refresh_token_ttl: i64,
    /// Password-reset token lifetime in seconds
    pub reset_token_ttl: i64,
}

/// TOTP configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecondFactorConfig {
    /// Issuer label shown in authenticator apps
    pub issuer: String,
    /// Time step in seconds
    pub step: u64,
    pub digits: u32,
    /// Accepted steps either side of the current one
    pub skew: u64,
}

/// CSRF double-submit configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CsrfConfig {
    pub cookie_name: String,
    pub header_name: String,
    /// Mark the cookie `Secure` (disable only for local plain-HTTP development)
    pub secure_cookie: bool,
}

/// Initial administrator provisioning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapConfig {
    pub admin_email: Option<String>,
    pub admin_password: Option<String>,
}

/// Background job configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    pub credential_sweep_interval: u64,
    /// Expired credentials are kept this long before the sweep deletes them
    pub credential_sweep_grace: i64,
}

/// Filter used when `RUST_LOG` is unset or empty
pub const DEFAULT_LOG_FILTER: &str = "taskgate=debug,tower_http=debug";

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for SecondFactorConfig {
    fn default() -> Self {
        Self {
            issuer: "Taskgate".to_string(),
            step: 30,
            digits: 6,
            skew: 2,
        }
    }
}

impl Default for CsrfConfig {
    fn default() -> Self {
        Self {
            cookie_name: "csrf_token".to_string(),
            header_name: "x-csrf-token".to_string(),
            secure_cookie: true,
        }
    }
}

/// Read an environment variable, falling back to a default when unset or unparsable
fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn log_filter(raw: Option<String>) -> String {
    raw.map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string())
}

impl ServerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> GateResult<Self> {
        dotenv::dotenv().ok();

        let hostname = env::var("TASKGATE_HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
        let port = env::var("TASKGATE_PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .map_err(|_| GateError::Validation("Invalid port number".to_string()))?;
        let version = env::var("TASKGATE_VERSION")
            .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string());

        let data_directory: PathBuf = env::var("TASKGATE_DATA_DIRECTORY")
            .unwrap_or_else(|_| "./data".to_string())
            .into();
        let database = env::var("TASKGATE_DATABASE_LOCATION")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_directory.join("taskgate.sqlite"));

        let jwt_secret = env::var("TASKGATE_JWT_SECRET")
            .map_err(|_| GateError::Validation("JWT secret required".to_string()))?;

        let defaults = SecondFactorConfig::default();
        let csrf_defaults = CsrfConfig::default();

        let admin_email = env::var("TASKGATE_BOOTSTRAP_ADMIN_EMAIL").ok();
        let admin_password = env::var("TASKGATE_BOOTSTRAP_ADMIN_PASSWORD").ok();

        let level = log_filter(env::var("RUST_LOG").ok());
        let json = env::var("TASKGATE_LOG_FORMAT")
            .map(|v| v.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        Ok(ServerConfig {
            service: ServiceConfig {
                hostname,
                port,
                version,
            },
            storage: StorageConfig {
                data_directory,
                database,
            },
            authentication: AuthConfig {
                jwt_secret,
                access_token_ttl: env_or("TASKGATE_ACCESS_TOKEN_TTL_SECS", 15 * 60),
                refresh_token_ttl: env_or("TASKGATE_REFRESH_TOKEN_TTL_SECS", 14 * 24 * 3600),
                reset_token_ttl: env_or("TASKGATE_RESET_TOKEN_TTL_SECS", 3600),
            },
            second_factor: SecondFactorConfig {
                issuer: env::var("TASKGATE_TOTP_ISSUER").unwrap_or(defaults.issuer),
                step: env_or("TASKGATE_TOTP_STEP_SECS", defaults.step),
                digits: env_or("TASKGATE_TOTP_DIGITS", defaults.digits),
                skew: env_or("TASKGATE_TOTP_SKEW", defaults.skew),
            },
            csrf: CsrfConfig {
                cookie_name: env::var("TASKGATE_CSRF_COOKIE").unwrap_or(csrf_defaults.cookie_name),
                header_name: env::var("TASKGATE_CSRF_HEADER").unwrap_or(csrf_defaults.header_name),
                secure_cookie: env_or("TASKGATE_CSRF_SECURE_COOKIE", csrf_defaults.secure_cookie),
            },
            bootstrap: BootstrapConfig {
                admin_email,
                admin_password,
            },
            jobs: JobsConfig {
                credential_sweep_interval: env_or("TASKGATE_CREDENTIAL_SWEEP_SECS", 3600),
                credential_sweep_grace: env_or("TASKGATE_CREDENTIAL_SWEEP_GRACE_SECS", 24 * 3600),
            },
            logging: LoggingConfig { level, json },
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> GateResult<()> {
        if self.service.hostname.is_empty() {
            return Err(GateError::Validation("Hostname cannot be empty".to_string()));
        }

        if self.authentication.jwt_secret.len() < 32 {
            return Err(GateError::Validation(
                "JWT secret must be at least 32 characters".to_string(),
            ));
        }

        let auth = &self.authentication;
        if auth.access_token_ttl <= 0 || auth.refresh_token_ttl <= 0 || auth.reset_token_ttl <= 0 {
            return Err(GateError::Validation("Token lifetimes must be positive".to_string()));
        }

        if self.second_factor.step == 0 {
            return Err(GateError::Validation("TOTP step must be positive".to_string()));
        }

        if !(6..=8).contains(&self.second_factor.digits) {
            return Err(GateError::Validation("TOTP digits must be between 6 and 8".to_string()));
        }

        if self.bootstrap.admin_email.is_some() != self.bootstrap.admin_password.is_some() {
            return Err(GateError::Validation(
                "Bootstrap admin requires both email and password".to_string(),
            ));
        }

        Ok(())
    }

    /// Configuration for unit tests
    #[cfg(test)]
    pub fn for_tests() -> Self {
        ServerConfig {
            service: ServiceConfig {
                hostname: "localhost".to_string(),
                port: 8080,
                version: "0.1.0".to_string(),
            },
            storage: StorageConfig {
                data_directory: PathBuf::from("./data"),
                database: PathBuf::from(":memory:"),
            },
            authentication: AuthConfig {
                jwt_secret: "test-secret-key-for-testing-only-0123456789".to_string(),
                access_token_ttl: 900,
                refresh_token_ttl: 14 * 24 * 3600,
                reset_token_ttl: 3600,
            },
            second_factor: SecondFactorConfig::default(),
            csrf: CsrfConfig::default(),
            bootstrap: BootstrapConfig {
                admin_email: None,
                admin_password: None,
            },
            jobs: JobsConfig {
                credential_sweep_interval: 3600,
                credential_sweep_grace: 0,
            },
            logging: LoggingConfig {
                level: DEFAULT_LOG_FILTER.to_string(),
                json: false,
            },
        }
    }
}
