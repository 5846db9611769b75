use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;

/// How long each awaited agent command may take before the caller gets a timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandTimeouts {
    pub create: Duration,
    pub stop: Duration,
    pub inspect: Duration,
    pub exec: Duration,
}

impl Default for CommandTimeouts {
    fn default() -> Self {
        Self {
            create: Duration::from_secs(60),
            stop: Duration::from_secs(30),
            inspect: Duration::from_secs(8),
            exec: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub database_url: Option<String>,
    pub db_pool_size: u32,
    pub timeouts: CommandTimeouts,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let defaults = CommandTimeouts::default();
        let secs = |key: &str, default: Duration| -> anyhow::Result<Duration> {
            Ok(parse::<u64>(&lookup, key)?.map_or(default, Duration::from_secs))
        };

        Ok(Self {
            port: parse(&lookup, "VMCTL_PORT")?.unwrap_or(7000),
            database_url: lookup("DATABASE_URL").filter(|url| !url.trim().is_empty()),
            db_pool_size: parse(&lookup, "VMCTL_DB_POOL_SIZE")?.unwrap_or(10),
            timeouts: CommandTimeouts {
                create: secs("VMCTL_CREATE_TIMEOUT_SECS", defaults.create)?,
                stop: secs("VMCTL_STOP_TIMEOUT_SECS", defaults.stop)?,
                inspect: secs("VMCTL_INSPECT_TIMEOUT_SECS", defaults.inspect)?,
                exec: secs("VMCTL_EXEC_TIMEOUT_SECS", defaults.exec)?,
            },
        })
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    lookup(key)
        .filter(|raw| !raw.trim().is_empty())
        .map(|raw| raw.trim().parse::<T>())
        .transpose()
        .with_context(|| format!("invalid value for {key}"))
}
