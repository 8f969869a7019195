use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::trainer::asof::JoinMethod;

const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub trainer: TrainerConfig,
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub notifier: NotifierConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub bind: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub database_path: PathBuf,
    pub models_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrainerConfig {
    #[serde(default = "default_label_col")]
    pub label_col: String,
    #[serde(default = "default_initial_features")]
    pub initial_features: Vec<String>,
    #[serde(default = "default_linear_fallback_n")]
    pub linear_fallback_n: usize,
    #[serde(default = "default_shap_sample_size")]
    pub shap_sample_size: usize,
    #[serde(default)]
    pub macro_join: JoinMethod,
    #[serde(default)]
    pub max_lag_days: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    pub default_mae_threshold: f64,
    pub status_limit: usize,
    pub default_top_k: usize,
}

/// Channel credentials are never read from the toml file, only from the environment.
#[derive(Debug, Clone, Deserialize)]
pub struct NotifierConfig {
    pub timeout_secs: u64,
    pub messaging_api_url: String,
    #[serde(skip)]
    pub webhook_url: Option<String>,
    #[serde(skip)]
    pub smtp: Option<SmtpConfig>,
    #[serde(skip)]
    pub messaging_token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub recipients: Vec<String>,
    pub implicit_tls: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_label_col() -> String {
    "actual_volatility".to_string()
}

fn default_initial_features() -> Vec<String> {
    vec!["rci".to_string(), "atr".to_string(), "vix".to_string()]
}

fn default_linear_fallback_n() -> usize {
    25
}

fn default_shap_sample_size() -> usize {
    512
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            label_col: default_label_col(),
            initial_features: default_initial_features(),
            linear_fallback_n: default_linear_fallback_n(),
            shap_sample_size: default_shap_sample_size(),
            macro_join: JoinMethod::default(),
            max_lag_days: Some(3),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_mae_threshold: 0.05,
            status_limit: 20,
            default_top_k: 3,
        }
    }
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 10,
            messaging_api_url: "https://notify-api.line.me/api/notify".to_string(),
            webhook_url: None,
            smtp: None,
            messaging_token: None,
        }
    }
}

/// Split a recipient list on `;` or `,`, dropping blanks.
pub fn parse_recipient_list(raw: &str) -> Vec<String> {
    raw.split([';', ','])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn env_non_empty(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_flag(name: &str, default: bool) -> bool {
    env_non_empty(name)
        .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
        .unwrap_or(default)
}

impl NotifierConfig {
    /// Pull channel credentials from the environment. Incomplete SMTP settings
    /// leave the email channel unconfigured rather than failing startup.
    pub fn apply_env(&mut self) -> Result<()> {
        self.webhook_url = env_non_empty("SLACK_WEBHOOK_URL");
        self.messaging_token = env_non_empty("LINE_TOKEN");

        let host = env_non_empty("SMTP_HOST");
        let user = env_non_empty("SMTP_USER");
        let password = env_non_empty("SMTP_PASS");
        let recipients = env_non_empty("SMTP_TO")
            .map(|raw| parse_recipient_list(&raw))
            .unwrap_or_default();
        let port = match env_non_empty("SMTP_PORT") {
            Some(raw) => raw
                .parse::<u16>()
                .with_context(|| format!("invalid SMTP_PORT '{}'", raw))?,
            None => 587,
        };
        self.smtp = match (host, user, password) {
            (Some(host), Some(user), Some(password)) if !recipients.is_empty() => {
                Some(SmtpConfig {
                    host,
                    port,
                    user,
                    password,
                    recipients,
                    implicit_tls: env_flag("SMTP_SSL", false),
                })
            }
            _ => None,
        };
        Ok(())
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config_path = std::env::var("VOLAI_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
        let mut config = Self::from_path(&config_path)?;

        if let Some(db) = env_non_empty("DATABASE_PATH") {
            config.storage.database_path = PathBuf::from(db);
        }
        if let Some(dir) = env_non_empty("MODELS_DIR") {
            config.storage.models_dir = PathBuf::from(dir);
        }
        config
            .notifier
            .apply_env()
            .context("notifier environment is invalid")?;

        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_toml_str(&config_str)
            .with_context(|| format!("failed to parse {}", path.display()))
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Config = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.trainer.label_col.trim().is_empty() {
            bail!("trainer.label_col must not be empty");
        }
        if self.trainer.linear_fallback_n < 2 {
            bail!(
                "trainer.linear_fallback_n must be >= 2, got {}",
                self.trainer.linear_fallback_n
            );
        }
        if self.trainer.shap_sample_size == 0 {
            bail!("trainer.shap_sample_size must be > 0");
        }
        if let Some(lag) = self.trainer.max_lag_days {
            if lag < 0 {
                bail!("trainer.max_lag_days must be >= 0, got {}", lag);
            }
        }
        if self.scheduler.status_limit == 0 {
            bail!("scheduler.status_limit must be > 0");
        }
        if !self.scheduler.default_mae_threshold.is_finite()
            || self.scheduler.default_mae_threshold < 0.0
        {
            bail!("scheduler.default_mae_threshold must be a non-negative number");
        }
        Ok(())
    }
}
