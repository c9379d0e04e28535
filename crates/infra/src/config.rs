//! Process configuration loaded from the environment.
//!
//! A `.env` file in the working directory is read first when present; real
//! environment variables take precedence over it.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// SMTP connection parameters for the mail transport.
#[derive(Clone, PartialEq, Eq)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    /// Implicit TLS on connect. When false, STARTTLS is used if offered.
    pub secure: bool,
    pub username: Option<String>,
    pub password: Option<String>,
    pub from_name: String,
}

impl core::fmt::Debug for SmtpSettings {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SmtpSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("secure", &self.secure)
            .field("username", &self.username)
            .field("from_name", &self.from_name)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Settings {
    pub port: u16,
    /// Shared secret expected from machine senders.
    pub secret_key: String,
    /// HMAC secret for bearer tokens.
    pub auth_secret_key: String,
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub smtp: Option<SmtpSettings>,
    pub worker_concurrency: usize,
    pub send_timeout: Duration,
    pub cleanup_interval: Duration,
}

impl core::fmt::Debug for Settings {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Settings")
            .field("port", &self.port)
            .field("database", &self.database_url.is_some())
            .field("redis", &self.redis_url.is_some())
            .field("smtp", &self.smtp)
            .field("worker_concurrency", &self.worker_concurrency)
            .field("send_timeout", &self.send_timeout)
            .field("cleanup_interval", &self.cleanup_interval)
            .finish_non_exhaustive()
    }
}

impl Settings {
    pub const DEFAULT_PORT: u16 = 4000;
    pub const DEFAULT_SMTP_PORT: u16 = 587;
    pub const DEFAULT_FROM_NAME: &'static str = "Courier";
    pub const DEFAULT_WORKER_CONCURRENCY: usize = 2;
    pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(30);
    pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(3600);

    /// Load `.env` (if any) and read settings from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        if let Err(err) = dotenvy::dotenv() {
            if !err.not_found() {
                tracing::warn!(error = %err, "failed to read .env file");
            }
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through an arbitrary lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let smtp = match get("EMAIL_HOST") {
            Some(host) => Some(SmtpSettings {
                host,
                port: parse_or(&get, "EMAIL_PORT", Self::DEFAULT_SMTP_PORT)?,
                secure: parse_bool(&get, "EMAIL_SECURE")?,
                username: get("EMAIL_USER"),
                password: get("EMAIL_PASS"),
                from_name: get("EMAIL_FROM_NAME").unwrap_or_else(|| Self::DEFAULT_FROM_NAME.to_string()),
            }),
            None => None,
        };

        let worker_concurrency: usize =
            parse_or(&get, "WORKER_CONCURRENCY", Self::DEFAULT_WORKER_CONCURRENCY)?;
        if worker_concurrency == 0 {
            return Err(ConfigError::Invalid {
                key: "WORKER_CONCURRENCY",
                reason: "must be at least 1".into(),
            });
        }

        Ok(Self {
            port: parse_or(&get, "PORT", Self::DEFAULT_PORT)?,
            secret_key: get("SECRET_KEY").ok_or(ConfigError::Missing("SECRET_KEY"))?,
            auth_secret_key: get("AUTH_SECRET_KEY").ok_or(ConfigError::Missing("AUTH_SECRET_KEY"))?,
            database_url: get("DATABASE_URL"),
            redis_url: get("REDIS_URL"),
            smtp,
            worker_concurrency,
            send_timeout: seconds_or(&get, "SEND_TIMEOUT_SECS", Self::DEFAULT_SEND_TIMEOUT)?,
            cleanup_interval: seconds_or(&get, "CLEANUP_INTERVAL_SECS", Self::DEFAULT_CLEANUP_INTERVAL)?,
        })
    }
}

fn parse_or<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: core::str::FromStr,
    T::Err: core::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

fn parse_bool<G>(get: &G, key: &'static str) -> Result<bool, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match get(key).as_deref().map(str::to_ascii_lowercase).as_deref() {
        None | Some("false") | Some("0") | Some("no") => Ok(false),
        Some("true") | Some("1") | Some("yes") => Ok(true),
        Some(other) => Err(ConfigError::Invalid {
            key,
            reason: format!("expected true or false, got '{other}'"),
        }),
    }
}

fn seconds_or<G>(get: &G, key: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    let secs: u64 = parse_or(get, key, default.as_secs())?;
    if secs == 0 {
        return Err(ConfigError::Invalid {
            key,
            reason: "must be at least 1 second".into(),
        });
    }
    Ok(Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings(vars: &[(&str, &str)]) -> Result<Settings, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn defaults_apply_when_only_secrets_are_set() {
        let s = settings(&[("SECRET_KEY", "s"), ("AUTH_SECRET_KEY", "a")]).unwrap();

        assert_eq!(s.port, 4000);
        assert_eq!(s.worker_concurrency, 2);
        assert_eq!(s.send_timeout, Duration::from_secs(30));
        assert_eq!(s.cleanup_interval, Duration::from_secs(3600));
        assert!(s.smtp.is_none());
        assert!(s.database_url.is_none());
    }

    #[test]
    fn secrets_are_required() {
        assert_eq!(
            settings(&[("AUTH_SECRET_KEY", "a")]),
            Err(ConfigError::Missing("SECRET_KEY"))
        );
        assert_eq!(
            settings(&[("SECRET_KEY", "s"), ("AUTH_SECRET_KEY", "  ")]),
            Err(ConfigError::Missing("AUTH_SECRET_KEY"))
        );
    }

    #[test]
    fn smtp_block_is_read_when_host_is_present() {
        let s = settings(&[
            ("SECRET_KEY", "s"),
            ("AUTH_SECRET_KEY", "a"),
            ("EMAIL_HOST", "smtp.example.com"),
            ("EMAIL_PORT", "465"),
            ("EMAIL_SECURE", "true"),
            ("EMAIL_USER", "mailer@example.com"),
            ("EMAIL_PASS", "pw"),
        ])
        .unwrap();

        let smtp = s.smtp.unwrap();
        assert_eq!(smtp.host, "smtp.example.com");
        assert_eq!(smtp.port, 465);
        assert!(smtp.secure);
        assert_eq!(smtp.from_name, "Courier");
        assert!(!format!("{smtp:?}").contains("pw"));
    }

    #[test]
    fn malformed_numbers_are_rejected() {
        let err = settings(&[("SECRET_KEY", "s"), ("AUTH_SECRET_KEY", "a"), ("PORT", "http")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "PORT", .. }));

        let err = settings(&[
            ("SECRET_KEY", "s"),
            ("AUTH_SECRET_KEY", "a"),
            ("WORKER_CONCURRENCY", "0"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "WORKER_CONCURRENCY", .. }));
    }
}
