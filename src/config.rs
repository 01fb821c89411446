use std::path::PathBuf;
use std::str::FromStr;

use crate::engine::{HoursPolicy, SlotSettings};
use crate::limits::MAX_UTC_OFFSET_MIN;

/// Server settings, read once from `SLOTBOOK_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub slots: SlotSettings,
    pub confirmations: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "slotbook".into(),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            tls_cert: None,
            tls_key: None,
            slots: SlotSettings::default(),
            confirmations: true,
        }
    }
}

#[derive(Debug)]
pub struct ConfigError {
    pub var: &'static str,
    pub message: String,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.var, self.message)
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source; unset variables keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |var: &'static str| lookup(var).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let mut config = Config::default();

        if let Some(v) = get("SLOTBOOK_PORT") {
            config.port = parse("SLOTBOOK_PORT", &v)?;
        }
        if let Some(v) = get("SLOTBOOK_BIND") {
            config.bind = v;
        }
        if let Some(v) = get("SLOTBOOK_DATA_DIR") {
            config.data_dir = PathBuf::from(v);
        }
        if let Some(v) = get("SLOTBOOK_PASSWORD") {
            config.password = v;
        }
        if let Some(v) = get("SLOTBOOK_MAX_CONNECTIONS") {
            config.max_connections = parse("SLOTBOOK_MAX_CONNECTIONS", &v)?;
            if config.max_connections == 0 {
                return Err(invalid("SLOTBOOK_MAX_CONNECTIONS", "must be positive"));
            }
        }
        if let Some(v) = get("SLOTBOOK_COMPACT_THRESHOLD") {
            config.compact_threshold = parse("SLOTBOOK_COMPACT_THRESHOLD", &v)?;
        }
        if let Some(v) = get("SLOTBOOK_METRICS_PORT") {
            config.metrics_port = Some(parse("SLOTBOOK_METRICS_PORT", &v)?);
        }
        config.tls_cert = get("SLOTBOOK_TLS_CERT");
        config.tls_key = get("SLOTBOOK_TLS_KEY");
        if config.tls_cert.is_some() != config.tls_key.is_some() {
            return Err(invalid(
                "SLOTBOOK_TLS_CERT",
                "SLOTBOOK_TLS_CERT and SLOTBOOK_TLS_KEY must be set together",
            ));
        }
        if let Some(v) = get("SLOTBOOK_SLOT_STEP_MINUTES") {
            config.slots.step_min = parse("SLOTBOOK_SLOT_STEP_MINUTES", &v)?;
        }
        if let Some(v) = get("SLOTBOOK_BUSINESS_HOURS") {
            config.slots.hours =
                HoursPolicy::from_str(&v).map_err(|e| invalid("SLOTBOOK_BUSINESS_HOURS", e))?;
        }
        if let Some(v) = get("SLOTBOOK_UTC_OFFSET_MINUTES") {
            config.slots.default_utc_offset_min = parse("SLOTBOOK_UTC_OFFSET_MINUTES", &v)?;
            if config.slots.default_utc_offset_min.abs() > MAX_UTC_OFFSET_MIN {
                return Err(invalid("SLOTBOOK_UTC_OFFSET_MINUTES", "offset out of range"));
            }
        }
        config
            .slots
            .validate()
            .map_err(|e| invalid("SLOTBOOK_SLOT_STEP_MINUTES", e))?;
        if let Some(v) = get("SLOTBOOK_CONFIRMATIONS") {
            config.confirmations = parse_flag("SLOTBOOK_CONFIRMATIONS", &v)?;
        }
        Ok(config)
    }
}

fn invalid(var: &'static str, message: impl Into<String>) -> ConfigError {
    ConfigError { var, message: message.into() }
}

fn parse<T>(var: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e: T::Err| invalid(var, format!("{value:?}: {e}")))
}

fn parse_flag(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(var, format!("{value:?} is not a boolean"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::ClockTime;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        assert_eq!(config(&[]).unwrap(), Config::default());
    }

    #[test]
    fn reads_every_variable() {
        let c = config(&[
            ("SLOTBOOK_PORT", "6000"),
            ("SLOTBOOK_BIND", "127.0.0.1"),
            ("SLOTBOOK_DATA_DIR", "/var/lib/slotbook"),
            ("SLOTBOOK_PASSWORD", "s3cret"),
            ("SLOTBOOK_MAX_CONNECTIONS", "8"),
            ("SLOTBOOK_COMPACT_THRESHOLD", "50"),
            ("SLOTBOOK_METRICS_PORT", "9090"),
            ("SLOTBOOK_SLOT_STEP_MINUTES", "30"),
            ("SLOTBOOK_BUSINESS_HOURS", "fallback:09:00-21:00"),
            ("SLOTBOOK_UTC_OFFSET_MINUTES", "-180"),
            ("SLOTBOOK_CONFIRMATIONS", "false"),
        ])
        .unwrap();
        assert_eq!(c.port, 6000);
        assert_eq!(c.bind, "127.0.0.1");
        assert_eq!(c.data_dir, PathBuf::from("/var/lib/slotbook"));
        assert_eq!(c.password, "s3cret");
        assert_eq!(c.max_connections, 8);
        assert_eq!(c.compact_threshold, 50);
        assert_eq!(c.metrics_port, Some(9090));
        assert_eq!(c.slots.step_min, 30);
        assert_eq!(
            c.slots.hours,
            HoursPolicy::Fallback {
                open: ClockTime::from_hm(9, 0).unwrap(),
                close: ClockTime::from_hm(21, 0).unwrap()
            }
        );
        assert_eq!(c.slots.default_utc_offset_min, -180);
        assert!(!c.confirmations);
    }

    #[test]
    fn invalid_values_are_errors() {
        assert_eq!(config(&[("SLOTBOOK_PORT", "http")]).unwrap_err().var, "SLOTBOOK_PORT");
        assert!(config(&[("SLOTBOOK_MAX_CONNECTIONS", "0")]).is_err());
        assert!(config(&[("SLOTBOOK_SLOT_STEP_MINUTES", "0")]).is_err());
        assert!(config(&[("SLOTBOOK_BUSINESS_HOURS", "lenient")]).is_err());
        assert!(config(&[("SLOTBOOK_UTC_OFFSET_MINUTES", "9999")]).is_err());
        assert!(config(&[("SLOTBOOK_CONFIRMATIONS", "maybe")]).is_err());
    }

    #[test]
    fn tls_needs_both_files() {
        assert!(config(&[("SLOTBOOK_TLS_CERT", "cert.pem")]).is_err());
        let c = config(&[("SLOTBOOK_TLS_CERT", "cert.pem"), ("SLOTBOOK_TLS_KEY", "key.pem")]).unwrap();
        assert_eq!(c.tls_key.as_deref(), Some("key.pem"));
    }
}
