use std::path::PathBuf;
use std::time::Duration as StdDuration;

use chrono::Duration;
use clap::Parser;

use taskwatch_broker::BrokerConfig;
use taskwatch_db::{data_dir, DbConfig};
use taskwatch_notify::SmtpConfig;
use taskwatch_store::StoreConfig;

use crate::checker::CheckerConfig;

pub const DEFAULT_MODULES: &str = "checker,emailnotifier:null,uinotifier";

#[derive(Debug, Clone, Parser)]
#[command(name = "taskwatch", about = "Task expiry checker and notification pipeline")]
pub struct Config {
    /// Postgres connection URL (needs the `postgres` feature)
    #[arg(long, env = "TASKWATCH_DATABASE_URL", hide_env_values = true)]
    pub database_url: Option<String>,

    /// SQLite task database, used when no database URL is given
    #[arg(long, env = "TASKWATCH_SQLITE_PATH")]
    pub sqlite_path: Option<String>,

    /// SQLite file backing the message broker
    #[arg(long, env = "TASKWATCH_BROKER_PATH")]
    pub broker_path: Option<PathBuf>,

    /// Time a delivery may stay unacknowledged before redelivery
    #[arg(long, env = "TASKWATCH_BROKER_ACK_WAIT", default_value = "30s", value_parser = parse_duration)]
    pub broker_ack_wait: Duration,

    /// Minimum age before an acknowledged message is pruned
    #[arg(long, env = "TASKWATCH_BROKER_RETENTION", default_value = "1h", value_parser = parse_duration)]
    pub broker_retention: Duration,

    /// Modules to run, comma separated
    #[arg(
        long,
        env = "TASKWATCH_MODULES",
        value_delimiter = ',',
        default_value = DEFAULT_MODULES
    )]
    pub modules: Vec<String>,

    #[arg(long, env = "TASKWATCH_CHECK_INTERVAL", default_value = "60s", value_parser = parse_duration)]
    pub check_interval: Duration,

    /// How far ahead of `expires_at` a task counts as expiring
    #[arg(long, env = "TASKWATCH_EXPIRING_WINDOW", default_value = "24h", value_parser = parse_duration)]
    pub expiring_window: Duration,

    /// How long completed tasks are kept before deletion
    #[arg(long, env = "TASKWATCH_DELETE_WINDOW", default_value = "48h", value_parser = parse_duration)]
    pub delete_window: Duration,

    /// Local attachment directory, used when S3 is not configured
    #[arg(long, env = "TASKWATCH_ATTACHMENTS_DIR")]
    pub attachments_dir: Option<String>,

    #[arg(long, env = "TASKWATCH_SMTP_HOST")]
    pub smtp_host: Option<String>,

    #[arg(long, env = "TASKWATCH_SMTP_PORT", default_value = "587")]
    pub smtp_port: u16,

    #[arg(long, env = "TASKWATCH_SMTP_FROM_NAME", default_value = "Taskwatch")]
    pub smtp_from_name: String,

    /// Sender address, also used as the SMTP login
    #[arg(long, env = "TASKWATCH_SMTP_FROM_ADDRESS")]
    pub smtp_from_address: Option<String>,

    #[arg(long, env = "TASKWATCH_SMTP_PASSWORD", hide_env_values = true)]
    pub smtp_password: Option<String>,

    /// User directory base URL for email lookups. Without it the user id is
    /// used as the address, which only the null email backend accepts.
    #[arg(long, env = "TASKWATCH_DIRECTORY_URL")]
    pub directory_url: Option<String>,

    #[arg(long, env = "TASKWATCH_DIRECTORY_TOKEN", hide_env_values = true)]
    pub directory_token: Option<String>,

    /// Port for the health check endpoint; disabled when unset
    #[arg(long, env = "TASKWATCH_HEALTH_PORT")]
    pub health_port: Option<u16>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, env = "TASKWATCH_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Config {
    pub fn db_config(&self) -> DbConfig {
        DbConfig {
            database_url: self.database_url.clone(),
            sqlite_path: self.sqlite_path.clone(),
        }
    }

    pub fn store_config(&self) -> StoreConfig {
        let mut config = StoreConfig::from_env();
        if let Some(dir) = &self.attachments_dir {
            config.local_data_dir = Some(dir.clone());
        }
        if config.local_data_dir.is_none() {
            config.local_data_dir = Some(data_dir().join("attachments").to_string_lossy().into());
        }
        config
    }

    pub fn broker_config(&self) -> Result<BrokerConfig, String> {
        Ok(BrokerConfig {
            path: Some(
                self.broker_path
                    .clone()
                    .unwrap_or_else(|| data_dir().join("broker.db")),
            ),
            ack_wait: to_std(self.broker_ack_wait)?,
            retention: to_std(self.broker_retention)?,
            ..BrokerConfig::default()
        })
    }

    pub fn checker_config(&self) -> Result<CheckerConfig, String> {
        Ok(CheckerConfig {
            interval: to_std(self.check_interval)?,
            expiring_window: self.expiring_window,
            delete_window: self.delete_window,
        })
    }

    /// SMTP settings, required only by the `emailnotifier:smtp` module.
    pub fn smtp_config(&self) -> Result<SmtpConfig, String> {
        let host = self.smtp_host.clone().ok_or("--smtp-host is required")?;
        let from_address = self
            .smtp_from_address
            .clone()
            .ok_or("--smtp-from-address is required")?;
        let password = self
            .smtp_password
            .clone()
            .ok_or("--smtp-password is required")?;
        Ok(SmtpConfig {
            host,
            port: self.smtp_port,
            from_name: self.smtp_from_name.clone(),
            from_address,
            password,
        })
    }
}

fn to_std(d: Duration) -> Result<StdDuration, String> {
    d.to_std().map_err(|e| format!("invalid duration {d}: {e}"))
}

/// Parse durations like `30s`, `15m`, `24h`, `7d` or compounds like `1h30m`.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim().to_lowercase();
    if s.is_empty() {
        return Err("duration cannot be empty".into());
    }

    let mut total = Duration::zero();
    let mut digits = String::new();
    for c in s.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        if digits.is_empty() {
            return Err(format!("expected a number before '{c}'"));
        }
        let n: i64 = digits
            .parse()
            .map_err(|e| format!("invalid number '{digits}': {e}"))?;
        digits.clear();
        let part = match c {
            'd' => Duration::try_days(n),
            'h' => Duration::try_hours(n),
            'm' => Duration::try_minutes(n),
            's' => Duration::try_seconds(n),
            _ => return Err(format!("unknown unit '{c}', use d, h, m or s")),
        };
        total = part
            .and_then(|p| total.checked_add(&p))
            .ok_or_else(|| format!("duration '{s}' is too large"))?;
    }

    if !digits.is_empty() {
        return Err(format!("'{s}' is missing a unit (d, h, m or s)"));
    }
    if total <= Duration::zero() {
        return Err(format!("duration '{s}' must be positive"));
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_units() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::seconds(30));
        assert_eq!(parse_duration("15m").unwrap(), Duration::minutes(15));
        assert_eq!(parse_duration("24h").unwrap(), Duration::hours(24));
        assert_eq!(parse_duration("7D").unwrap(), Duration::days(7));
    }

    #[test]
    fn parses_compound_durations() {
        assert_eq!(
            parse_duration("1d12h").unwrap(),
            Duration::hours(36)
        );
        assert_eq!(
            parse_duration(" 1h30m15s ").unwrap(),
            Duration::seconds(5415)
        );
    }

    #[test]
    fn rejects_malformed_durations() {
        for bad in ["", "10", "h", "5x", "0s", "1h30"] {
            assert!(parse_duration(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn defaults() {
        let config = Config::try_parse_from(["taskwatch"]).unwrap();
        assert_eq!(config.modules, vec!["checker", "emailnotifier:null", "uinotifier"]);
        assert_eq!(config.check_interval, Duration::seconds(60));
        assert_eq!(config.expiring_window, Duration::hours(24));
        assert_eq!(config.delete_window, Duration::hours(48));
        assert_eq!(config.broker_ack_wait, Duration::seconds(30));
        assert_eq!(config.broker_retention, Duration::hours(1));
        assert_eq!(config.smtp_port, 587);
        assert!(config.health_port.is_none());

        let checker = config.checker_config().unwrap();
        assert_eq!(checker.interval, StdDuration::from_secs(60));
    }

    #[test]
    fn flags_override_defaults() {
        let config = Config::try_parse_from([
            "taskwatch",
            "--modules",
            "checker,uinotifier",
            "--check-interval",
            "5m",
            "--broker-path",
            "/tmp/b.db",
        ])
        .unwrap();
        assert_eq!(config.modules, vec!["checker", "uinotifier"]);
        assert_eq!(config.check_interval, Duration::minutes(5));
        assert_eq!(
            config.broker_config().unwrap().path,
            Some(PathBuf::from("/tmp/b.db"))
        );
    }

    #[test]
    fn bad_duration_flag_is_a_parse_error() {
        assert!(Config::try_parse_from(["taskwatch", "--check-interval", "soon"]).is_err());
    }

    #[test]
    fn smtp_config_requires_host_and_credentials() {
        let config = Config::try_parse_from(["taskwatch", "--smtp-host", "mail.example.com"])
            .unwrap();
        assert!(config.smtp_config().is_err());

        let config = Config::try_parse_from([
            "taskwatch",
            "--smtp-host",
            "mail.example.com",
            "--smtp-from-address",
            "noreply@example.com",
            "--smtp-password",
            "pw",
        ])
        .unwrap();
        let smtp = config.smtp_config().unwrap();
        assert_eq!(smtp.port, 587);
        assert_eq!(smtp.from_name, "Taskwatch");
    }
}
