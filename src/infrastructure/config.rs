//! Configuration infrastructure
//!
//! Contains configuration loading and management for the pricing sync jobs.
//!
//! Configuration can be read two ways:
//! 1. [`ConfigManager::load_config`]: a single JSON file, created with defaults
//!    on first use and reset (with a backup) when corrupted
//! 2. [`ConfigManager::load_layered`]: defaults, then the JSON file, then
//!    `MPSYNC__SECTION__KEY` environment overrides

#![allow(clippy::uninlined_format_args)]

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{info, warn};

use crate::infrastructure::sheets::column_letter_to_index;

/// Complete application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub proxy: ProxyConfig,
    pub browser: BrowserConfig,
    pub fetch: FetchConfig,
    pub sheets: SheetsConfig,
    pub columns: ColumnConfig,
    pub export: ExportConfig,
    pub logging: LoggingConfig,
}

/// Upstream proxy settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Route tunnel traffic through the first pool entry
    pub enabled: bool,

    /// Line-oriented proxy pool file
    pub pool_file: PathBuf,
}

/// Browser session settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    /// Explicit browser executable; searched on PATH when absent
    pub binary: Option<PathBuf>,

    /// Required major version; detected from the binary when absent
    pub version_main: Option<u32>,

    /// Explicit chromedriver executable; searched on PATH when absent
    pub driver_binary: Option<PathBuf>,

    pub headless: bool,
    pub page_load_timeout_seconds: u64,
    pub implicit_wait_seconds: u64,

    /// How long to wait for the DevTools endpoint after spawn
    pub startup_timeout_seconds: u64,

    pub download_dir: PathBuf,

    /// One profile directory per job, never shared
    pub profiles: ProfileDirs,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileDirs {
    pub wildberries: PathBuf,
    pub ozon: PathBuf,
}

/// Marketplace request settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub request_timeout_seconds: u64,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_requests_per_second: u32,

    /// Rotated per request
    pub user_agents: Vec<String>,

    /// Human-like pause between items
    pub random_delay_min_ms: u64,
    pub random_delay_max_ms: u64,
}

/// Tabular store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SheetsConfig {
    pub api_base: String,
    pub spreadsheet_id: String,
    pub sheet_gid: i64,
    pub max_attempts: u32,

    /// Rate-limit backoff waits `2^attempt` of these
    pub backoff_unit_ms: u64,
}

/// Column letters of the sheet layout
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ColumnConfig {
    pub wb_sku: String,
    pub wb_link: String,
    pub wb_price: String,
    pub wb_rating_reviews: String,
    pub wb_display_battery: String,
    pub wb_promo: String,
    pub wb_seller: String,
    pub ozon_input: String,
    pub ozon_price: String,
    pub promo_color: String,
}

/// Local fallback artifacts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    pub dir: PathBuf,
    pub file_prefix: String,
    pub sheet_title: String,
}

/// Logging configuration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "error", "warn", "info", "debug", "trace"
    pub level: String,

    /// Enable JSON formatted file logs
    pub json_format: bool,

    pub console_output: bool,
    pub file_output: bool,

    /// Log directory; `<data dir>/logs` when absent
    pub directory: Option<PathBuf>,

    pub file_name: String,

    /// Number of rotated log files to keep
    pub max_files: u32,

    /// Delete rotated files beyond `max_files` on startup
    pub auto_cleanup_logs: bool,

    /// Module-specific log level filters (e.g., "reqwest": "info")
    pub module_filters: HashMap<String, String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            enabled: defaults::USE_PROXY,
            pool_file: defaults::app_data_dir().join(defaults::PROXY_FILE_NAME),
        }
    }
}

impl Default for BrowserConfig {
    fn default() -> Self {
        let base = defaults::app_data_dir();
        Self {
            binary: None,
            version_main: None,
            driver_binary: None,
            headless: defaults::HEADLESS_MODE,
            page_load_timeout_seconds: defaults::PAGE_LOAD_TIMEOUT_SECONDS,
            implicit_wait_seconds: defaults::IMPLICIT_WAIT_SECONDS,
            startup_timeout_seconds: defaults::BROWSER_STARTUP_TIMEOUT_SECONDS,
            download_dir: base.join("downloads"),
            profiles: ProfileDirs::default(),
        }
    }
}

impl Default for ProfileDirs {
    fn default() -> Self {
        let base = defaults::app_data_dir();
        Self {
            wildberries: base.join("chrome_profile_wb"),
            ozon: base.join("chrome_profile_ozon"),
        }
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            request_timeout_seconds: defaults::REQUEST_TIMEOUT_SECONDS,
            max_attempts: defaults::FETCH_MAX_ATTEMPTS,
            base_delay_ms: defaults::FETCH_BASE_DELAY_MS,
            max_delay_ms: defaults::FETCH_MAX_DELAY_MS,
            max_requests_per_second: defaults::MAX_REQUESTS_PER_SECOND,
            user_agents: defaults::USER_AGENTS.iter().map(|s| (*s).to_string()).collect(),
            random_delay_min_ms: defaults::RANDOM_DELAY_MIN_MS,
            random_delay_max_ms: defaults::RANDOM_DELAY_MAX_MS,
        }
    }
}

impl Default for SheetsConfig {
    fn default() -> Self {
        Self {
            api_base: defaults::SHEETS_API_BASE.to_string(),
            spreadsheet_id: String::new(),
            sheet_gid: defaults::SHEET_GID,
            max_attempts: defaults::SYNC_MAX_ATTEMPTS,
            backoff_unit_ms: defaults::SYNC_BACKOFF_UNIT_MS,
        }
    }
}

impl Default for ColumnConfig {
    fn default() -> Self {
        Self {
            wb_sku: "K".into(),
            wb_link: "K".into(),
            wb_price: "M".into(),
            wb_rating_reviews: "Y".into(),
            wb_display_battery: "H".into(),
            wb_promo: "AD".into(),
            wb_seller: "I".into(),
            ozon_input: "K".into(),
            ozon_price: "V".into(),
            promo_color: defaults::PROMO_COLOR.into(),
        }
    }
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            dir: defaults::app_data_dir().join("exports"),
            file_prefix: defaults::EXPORT_FILE_PREFIX.to_string(),
            sheet_title: defaults::EXPORT_SHEET_TITLE.to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: defaults::LOG_LEVEL.to_string(),
            json_format: defaults::LOG_JSON_FORMAT,
            console_output: defaults::LOG_CONSOLE_OUTPUT,
            file_output: defaults::LOG_FILE_OUTPUT,
            directory: None,
            file_name: defaults::LOG_FILE_NAME.to_string(),
            max_files: defaults::LOG_MAX_FILES,
            auto_cleanup_logs: defaults::LOG_AUTO_CLEANUP,
            module_filters: {
                let mut filters = HashMap::new();
                filters.insert("reqwest".to_string(), "info".to_string());
                filters.insert("hyper".to_string(), "warn".to_string());
                filters.insert("h2".to_string(), "warn".to_string());
                filters.insert("tokio".to_string(), "info".to_string());
                filters
            },
        }
    }
}

impl AppConfig {
    /// Human-readable problems that would make a job fail early
    #[must_use]
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.sheets.spreadsheet_id.trim().is_empty() {
            errors.push("sheets.spreadsheet_id is not set".to_string());
        }
        if self.sheets.max_attempts == 0 {
            errors.push("sheets.max_attempts must be at least 1".to_string());
        }
        if self.proxy.enabled && !self.proxy.pool_file.exists() {
            errors.push(format!(
                "proxy is enabled but pool file {} does not exist",
                self.proxy.pool_file.display()
            ));
        }
        if self.fetch.user_agents.is_empty() {
            errors.push("fetch.user_agents is empty".to_string());
        }
        if self.fetch.max_attempts == 0 {
            errors.push("fetch.max_attempts must be at least 1".to_string());
        }
        if self.fetch.max_requests_per_second == 0 {
            errors.push("fetch.max_requests_per_second must be at least 1".to_string());
        }
        if self.fetch.random_delay_min_ms > self.fetch.random_delay_max_ms {
            errors.push("fetch.random_delay_min_ms exceeds random_delay_max_ms".to_string());
        }

        let c = &self.columns;
        for (name, letters) in [
            ("wb_sku", &c.wb_sku),
            ("wb_link", &c.wb_link),
            ("wb_price", &c.wb_price),
            ("wb_rating_reviews", &c.wb_rating_reviews),
            ("wb_display_battery", &c.wb_display_battery),
            ("wb_promo", &c.wb_promo),
            ("wb_seller", &c.wb_seller),
            ("ozon_input", &c.ozon_input),
            ("ozon_price", &c.ozon_price),
        ] {
            if column_letter_to_index(letters).is_none() {
                errors.push(format!("columns.{name} = {letters:?} is not a column letter"));
            }
        }

        errors
    }
}

/// Configuration manager for loading and saving settings
pub struct ConfigManager {
    pub config_path: PathBuf,
}

impl ConfigManager {
    /// Get the application configuration directory
    pub fn get_config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get user config directory")?
            .join(defaults::APP_DIR_NAME);

        Ok(config_dir)
    }

    /// Manager for the default per-user config file
    pub fn new() -> Result<Self> {
        let config_dir = Self::get_config_dir()?;
        Ok(Self::with_path(config_dir.join(defaults::CONFIG_FILE_NAME)))
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: path.into(),
        }
    }

    /// Load configuration from file, creating default if it doesn't exist
    pub async fn load_config(&self) -> Result<AppConfig> {
        if !self.config_path.exists() {
            info!("Configuration file not found, creating default: {:?}", self.config_path);
            let default_config = AppConfig::default();
            self.save_config(&default_config).await?;
            return Ok(default_config);
        }

        let content = fs::read_to_string(&self.config_path)
            .await
            .context("Failed to read configuration file")?;

        match serde_json::from_str::<AppConfig>(&content) {
            Ok(config) => {
                info!("Loaded configuration from: {:?}", self.config_path);
                Ok(config)
            }
            Err(parse_error) => {
                warn!("⚠️  Configuration file is not valid: {}", parse_error);
                warn!("⚠️  Resetting to default configuration");

                let backup_path = self.config_path.with_extension("json.corrupted");
                if let Err(e) = fs::copy(&self.config_path, &backup_path).await {
                    warn!("Failed to create backup of corrupted config: {}", e);
                } else {
                    info!("Backed up corrupted config to: {:?}", backup_path);
                }

                self.reset_to_defaults().await
            }
        }
    }

    /// Save configuration to file
    pub async fn save_config(&self, config: &AppConfig) -> Result<()> {
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent)
                .await
                .context("Failed to create config directory")?;
        }

        let content =
            serde_json::to_string_pretty(config).context("Failed to serialize configuration")?;

        fs::write(&self.config_path, content)
            .await
            .context("Failed to write configuration file")?;

        info!("Saved configuration to: {:?}", self.config_path);
        Ok(())
    }

    /// Reset configuration to defaults (useful for troubleshooting)
    pub async fn reset_to_defaults(&self) -> Result<AppConfig> {
        info!("🔄 Resetting configuration to defaults");

        let default_config = AppConfig::default();
        self.save_config(&default_config)
            .await
            .context("Failed to save default configuration")?;

        info!("✅ Configuration reset to defaults");
        Ok(default_config)
    }

    /// Defaults, overlaid by the JSON file (if present), overlaid by
    /// `MPSYNC__SECTION__KEY` environment variables
    pub fn load_layered(&self) -> Result<AppConfig> {
        Self::layered(&self.config_path, None)
    }

    fn layered(path: &Path, env: Option<HashMap<String, String>>) -> Result<AppConfig> {
        let defaults = config::Config::try_from(&AppConfig::default())
            .context("Failed to serialize default configuration")?;

        let settings = config::Config::builder()
            .add_source(defaults)
            .add_source(
                config::File::from(path)
                    .format(config::FileFormat::Json)
                    .required(false),
            )
            .add_source(
                config::Environment::with_prefix(defaults::ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true)
                    .source(env),
            )
            .build()
            .with_context(|| format!("Failed to layer configuration from {}", path.display()))?;

        settings
            .try_deserialize::<AppConfig>()
            .context("Failed to deserialize layered configuration")
    }

    /// Get the configuration file path
    pub fn config_path(&self) -> &PathBuf {
        &self.config_path
    }
}

/// Default configuration values
pub mod defaults {
    use std::path::PathBuf;

    /// Directory name under the platform config/data roots
    pub const APP_DIR_NAME: &str = "marketplace-pricing-sync";

    pub const CONFIG_FILE_NAME: &str = "pricing_sync_config.json";

    /// Prefix of environment overrides (`MPSYNC__FETCH__MAX_ATTEMPTS=5`)
    pub const ENV_PREFIX: &str = "MPSYNC";

    pub const USE_PROXY: bool = false;
    pub const PROXY_FILE_NAME: &str = "proxies.txt";

    pub const HEADLESS_MODE: bool = false;
    pub const PAGE_LOAD_TIMEOUT_SECONDS: u64 = 30;
    pub const IMPLICIT_WAIT_SECONDS: u64 = 10;
    pub const BROWSER_STARTUP_TIMEOUT_SECONDS: u64 = 20;
    /// Home page loads tried before a job gives up on session cookies
    pub const COOKIE_ATTEMPTS: u32 = 3;

    pub const REQUEST_TIMEOUT_SECONDS: u64 = 15;
    pub const FETCH_MAX_ATTEMPTS: u32 = 3;
    pub const FETCH_BASE_DELAY_MS: u64 = 2_000;
    pub const FETCH_MAX_DELAY_MS: u64 = 10_000;
    pub const MAX_REQUESTS_PER_SECOND: u32 = 5;
    pub const RANDOM_DELAY_MIN_MS: u64 = 400;
    pub const RANDOM_DELAY_MAX_MS: u64 = 1_200;

    pub const USER_AGENTS: &[&str] = &[
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/119.0.0.0 Safari/537.36",
    ];

    pub const SHEETS_API_BASE: &str = "https://sheets.googleapis.com/v4";
    pub const SHEET_GID: i64 = 640_866_547;
    pub const SYNC_MAX_ATTEMPTS: u32 = 3;
    pub const SYNC_BACKOFF_UNIT_MS: u64 = 1_000;

    /// Background of promo cells
    pub const PROMO_COLOR: &str = "b7e1cd";

    pub const EXPORT_FILE_PREFIX: &str = "wb_results";
    pub const EXPORT_SHEET_TITLE: &str = "WB Results";

    pub const LOG_LEVEL: &str = "info";
    pub const LOG_JSON_FORMAT: bool = false;
    pub const LOG_CONSOLE_OUTPUT: bool = true;
    pub const LOG_FILE_OUTPUT: bool = true;
    pub const LOG_FILE_NAME: &str = "pricing_sync.log";
    pub const LOG_MAX_FILES: u32 = 5;
    pub const LOG_AUTO_CLEANUP: bool = true;

    /// Per-user data root; falls back to the working directory
    #[must_use]
    pub fn app_data_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR_NAME)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_follow_sheet_layout() {
        let config = AppConfig::default();
        assert_eq!(config.columns.wb_promo, "AD");
        assert_eq!(config.columns.ozon_price, "V");
        assert_eq!(config.fetch.user_agents.len(), 2);
        assert_eq!(config.browser.page_load_timeout_seconds, 30);
        assert_ne!(config.browser.profiles.wildberries, config.browser.profiles.ozon);
    }

    #[test]
    fn validate_reports_each_problem() {
        let mut config = AppConfig::default();
        config.fetch.user_agents.clear();
        config.columns.wb_price = "1A".into();
        config.fetch.random_delay_min_ms = 5_000;

        let errors = config.validate();
        assert!(errors.iter().any(|e| e.contains("spreadsheet_id")));
        assert!(errors.iter().any(|e| e.contains("user_agents")));
        assert!(errors.iter().any(|e| e.contains("wb_price")));
        assert!(errors.iter().any(|e| e.contains("random_delay_min_ms")));

        let mut ok = AppConfig::default();
        ok.sheets.spreadsheet_id = "sheet".into();
        assert!(ok.validate().is_empty());
    }

    #[tokio::test]
    async fn missing_file_is_created_with_defaults() {
        let dir = TempDir::new().unwrap();
        let manager = ConfigManager::with_path(dir.path().join("nested").join("config.json"));

        let config = manager.load_config().await.unwrap();
        assert_eq!(config.sheets.max_attempts, defaults::SYNC_MAX_ATTEMPTS);
        assert!(manager.config_path().exists());
    }

    #[tokio::test]
    async fn corrupted_file_is_backed_up_and_reset() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();
        let manager = ConfigManager::with_path(&path);

        let config = manager.load_config().await.unwrap();
        assert_eq!(config.columns.wb_sku, "K");
        assert_eq!(
            std::fs::read_to_string(path.with_extension("json.corrupted")).unwrap(),
            "{ not json"
        );
        let rewritten: AppConfig =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(rewritten.columns.wb_price, "M");
    }

    #[tokio::test]
    async fn partial_file_keeps_defaults_for_missing_sections() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"sheets": {"spreadsheet_id": "abc"}}"#).unwrap();

        let config = ConfigManager::with_path(&path).load_config().await.unwrap();
        assert_eq!(config.sheets.spreadsheet_id, "abc");
        assert_eq!(config.sheets.sheet_gid, defaults::SHEET_GID);
        assert_eq!(config.columns.ozon_input, "K");
    }

    #[test]
    fn layered_loader_applies_file_then_environment() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"sheets": {"spreadsheet_id": "from-file"}, "fetch": {"max_attempts": 4}}"#,
        )
        .unwrap();

        let mut env = HashMap::new();
        env.insert("MPSYNC__FETCH__MAX_ATTEMPTS".to_string(), "6".to_string());
        env.insert("MPSYNC__PROXY__ENABLED".to_string(), "true".to_string());

        let config = ConfigManager::layered(&path, Some(env)).unwrap();
        assert_eq!(config.sheets.spreadsheet_id, "from-file");
        assert_eq!(config.fetch.max_attempts, 6);
        assert!(config.proxy.enabled);
        assert_eq!(config.columns.wb_seller, "I");
    }
}
