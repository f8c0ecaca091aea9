use std::time::Duration;

use anyhow::Context;
use clap::Args;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing_subscriber::EnvFilter;

use crate::retry::RetryPolicy;

/// Connection, retry and logging settings shared by every subcommand.
#[derive(Debug, Clone, Args)]
pub struct Settings {
    /// Postgres connection string
    #[arg(long, env = "DATABASE_URL", hide_env_values = true, global = true)]
    pub database_url: Option<String>,
    #[arg(long, env = "THESIS_MAX_CONNECTIONS", default_value_t = 5, global = true)]
    pub max_connections: u32,
    /// Attempts per store call, the first one included
    #[arg(long, env = "THESIS_RETRY_ATTEMPTS", default_value_t = 3, global = true)]
    pub retry_attempts: u32,
    /// First backoff delay; doubles per retry up to five seconds
    #[arg(long, env = "THESIS_RETRY_BASE_MS", default_value_t = 200, global = true)]
    pub retry_base_ms: u64,
    /// Emit logs as JSON lines
    #[arg(long, env = "THESIS_LOG_JSON", global = true)]
    pub log_json: bool,
}

impl Settings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_attempts.max(1),
            initial_delay: Duration::from_millis(self.retry_base_ms),
            ..RetryPolicy::default()
        }
    }

    pub async fn connect(&self) -> anyhow::Result<PgPool> {
        let database_url = self
            .database_url
            .as_deref()
            .context("DATABASE_URL must be set to a Postgres instance")?;

        PgPoolOptions::new()
            .max_connections(self.max_connections)
            .connect(database_url)
            .await
            .context("failed to connect to Postgres")
    }
}

/// Logs go to stderr so command output on stdout stays machine-readable.
/// `RUST_LOG` overrides the default `info` filter.
pub fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        settings: Settings,
    }

    #[test]
    fn retry_flags_shape_the_policy() {
        let harness = Harness::parse_from([
            "thesis-progress",
            "--retry-attempts",
            "5",
            "--retry-base-ms",
            "50",
        ]);
        let policy = harness.settings.retry_policy();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.initial_delay, Duration::from_millis(50));
        assert_eq!(policy.max_delay, Duration::from_secs(5));
    }

    #[test]
    fn zero_attempts_still_tries_once() {
        let harness = Harness::parse_from(["thesis-progress", "--retry-attempts", "0"]);
        assert_eq!(harness.settings.retry_policy().max_attempts, 1);
    }
}
