use anyhow::Context;
use std::{env, net::SocketAddr, str::FromStr, time::Duration};

/// Timers that govern a room's lifecycle.
#[derive(Clone, Copy, Debug)]
pub struct RaceTiming {
    /// Length of one of the three countdown ticks.
    pub countdown_tick: Duration,
    /// Minimum spacing between broadcast progress updates from one sender.
    pub progress_interval: Duration,
    /// How long an empty room survives before eviction.
    pub eviction_grace: Duration,
}

impl Default for RaceTiming {
    fn default() -> Self {
        Self {
            countdown_tick: Duration::from_secs(1),
            progress_interval: Duration::from_millis(200),
            eviction_grace: Duration::from_secs(30),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub database_url: Option<String>,
    pub tick_interval: Duration,
    pub timing: RaceTiming,
    pub commit_retries: u32,
}

impl Config {
    /// Reads configuration from the environment, loading `.env` first if present.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let millis = |key: &str, default: u64| -> anyhow::Result<Duration> {
            Ok(Duration::from_millis(parse_var(&lookup, key, default)?))
        };

        Ok(Self {
            bind_addr: parse_var(&lookup, "BIND_ADDR", SocketAddr::from(([0, 0, 0, 0], 3000)))?,
            database_url: lookup("DATABASE_URL").filter(|url| !url.trim().is_empty()),
            tick_interval: millis("TICK_MS", 50)?,
            timing: RaceTiming {
                countdown_tick: millis("COUNTDOWN_TICK_MS", 1000)?,
                progress_interval: millis("PROGRESS_INTERVAL_MS", 200)?,
                eviction_grace: Duration::from_secs(parse_var(&lookup, "EVICTION_GRACE_SECS", 30)?),
            },
            commit_retries: parse_var(&lookup, "COMMIT_RETRIES", 5)?,
        })
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {key}: `{raw}`")),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> anyhow::Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.bind_addr.port(), 3000);
        assert!(config.database_url.is_none());
        assert_eq!(config.tick_interval, Duration::from_millis(50));
        assert_eq!(config.timing.countdown_tick, Duration::from_secs(1));
        assert_eq!(config.commit_retries, 5);
    }

    #[test]
    fn test_overrides() {
        let config = config_from(&[
            ("BIND_ADDR", "127.0.0.1:8080"),
            ("DATABASE_URL", "postgres://localhost/typerace"),
            ("PROGRESS_INTERVAL_MS", "500"),
            ("EVICTION_GRACE_SECS", "5"),
        ])
        .unwrap();
        assert_eq!(config.bind_addr.port(), 8080);
        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/typerace"));
        assert_eq!(config.timing.progress_interval, Duration::from_millis(500));
        assert_eq!(config.timing.eviction_grace, Duration::from_secs(5));
    }

    #[test]
    fn test_invalid_value_names_variable() {
        let err = config_from(&[("TICK_MS", "soon")]).unwrap_err();
        assert!(err.to_string().contains("TICK_MS"));
    }

    #[test]
    fn test_blank_database_url_is_unset() {
        let config = config_from(&[("DATABASE_URL", "  ")]).unwrap();
        assert!(config.database_url.is_none());
    }
}
