// Application configuration, loaded from environment variables and CLI flags.

use std::time::Duration;

use thiserror::Error;

use crate::chat::discord::DEFAULT_API_BASE;
use crate::duel::{self, DuelSettings};
use crate::presence::{self, PresenceSettings};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {name}: '{value}'")]
    Invalid { name: &'static str, value: String },
}

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Bot credential for the chat platform.
    pub bot_token: String,
    /// Scoring backend endpoint (rewards, traits, commands).
    pub scoring_url: String,
    /// Duel command endpoint; the scoring endpoint unless overridden.
    pub duel_url: String,
    /// Chat platform REST base URL.
    pub chat_api_base: String,
    /// Port to bind the HTTP server to.
    pub port: u16,
    pub presence_interval: Duration,
    pub presence_window: Duration,
    pub stale_after: Duration,
    pub orphan_sweep_interval: Duration,
    pub duel_warning_grace: Duration,
    pub backend_timeout: Duration,
    pub announcement_channel: String,
    pub duel_category: String,
}

impl Config {
    /// Load configuration from environment variables and CLI arguments.
    ///
    /// Environment variables:
    /// - `BOT_TOKEN` - chat platform credential (required)
    /// - `PHP_API_URL` - scoring backend endpoint (required)
    /// - `DUEL_API_URL` - duel command endpoint (default: `PHP_API_URL`)
    /// - `DISCORD_API_BASE` - chat REST base URL
    /// - `PORT` - HTTP server port (default: 8080)
    /// - `PRESENCE_INTERVAL_SECS` (900), `PRESENCE_WINDOW_SECS` (1020),
    ///   `STALE_AFTER_SECS` (3600), `ORPHAN_SWEEP_SECS` (300),
    ///   `DUEL_WARNING_GRACE_SECS` (10), `BACKEND_TIMEOUT_SECS` (10)
    /// - `ANNOUNCE_CHANNEL` (general), `DUEL_CATEGORY` (Duels)
    ///
    /// CLI flags:
    /// - `--port <PORT>` - Override the port
    pub fn load() -> Result<Self, ConfigError> {
        let args: Vec<String> = std::env::args().collect();
        Self::from_sources(&args, |name| std::env::var(name).ok())
    }

    /// Build the configuration from explicit arguments and a variable lookup.
    pub fn from_sources(
        args: &[String],
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let var = |name: &str| env(name).filter(|v| !v.trim().is_empty());
        let required = |name: &'static str| var(name).ok_or(ConfigError::Missing(name));
        let seconds = |name: &'static str, default: Duration| -> Result<Duration, ConfigError> {
            match var(name) {
                None => Ok(default),
                Some(v) => v
                    .trim()
                    .parse::<u64>()
                    .ok()
                    .filter(|s| *s > 0)
                    .map(Duration::from_secs)
                    .ok_or(ConfigError::Invalid { name, value: v }),
            }
        };

        let bot_token = required("BOT_TOKEN")?;
        let scoring_url = required("PHP_API_URL")?;
        let duel_url = var("DUEL_API_URL").unwrap_or_else(|| scoring_url.clone());

        // Port: CLI flag --port takes precedence, then env var, then default
        let port: u16 = match Self::parse_cli_value(args, "--port").or_else(|| var("PORT")) {
            Some(v) => v.trim().parse().map_err(|_| ConfigError::Invalid {
                name: "PORT",
                value: v,
            })?,
            None => 8080,
        };

        Ok(Config {
            bot_token,
            scoring_url,
            duel_url,
            chat_api_base: var("DISCORD_API_BASE").unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            port,
            presence_interval: seconds("PRESENCE_INTERVAL_SECS", presence::DEFAULT_INTERVAL)?,
            presence_window: seconds("PRESENCE_WINDOW_SECS", presence::DEFAULT_ELIGIBILITY_WINDOW)?,
            stale_after: seconds("STALE_AFTER_SECS", presence::DEFAULT_STALE_AFTER)?,
            orphan_sweep_interval: seconds("ORPHAN_SWEEP_SECS", duel::DEFAULT_SWEEP_INTERVAL)?,
            duel_warning_grace: seconds("DUEL_WARNING_GRACE_SECS", duel::DEFAULT_WARNING_GRACE)?,
            backend_timeout: seconds("BACKEND_TIMEOUT_SECS", Duration::from_secs(10))?,
            announcement_channel: var("ANNOUNCE_CHANNEL")
                .unwrap_or_else(|| presence::DEFAULT_ANNOUNCEMENT_CHANNEL.to_string()),
            duel_category: var("DUEL_CATEGORY").unwrap_or_else(|| duel::DEFAULT_CATEGORY.to_string()),
        })
    }

    pub fn presence_settings(&self) -> PresenceSettings {
        PresenceSettings::new(
            self.presence_interval,
            self.presence_window,
            self.stale_after,
            &self.announcement_channel,
        )
    }

    pub fn duel_settings(&self) -> DuelSettings {
        DuelSettings {
            category_name: self.duel_category.clone(),
            warning_grace: self.duel_warning_grace,
            sweep_interval: self.orphan_sweep_interval,
            ..DuelSettings::default()
        }
    }

    /// Parse a CLI flag value like `--port 8080`.
    fn parse_cli_value(args: &[String], flag: &str) -> Option<String> {
        args.windows(2).find_map(|pair| {
            if pair[0] == flag {
                Some(pair[1].clone())
            } else {
                None
            }
        })
    }
}
