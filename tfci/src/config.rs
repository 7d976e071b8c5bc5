//! Resolved daemon configuration.
//!
//! Flag parsing lives in the server binary; this module turns the raw flag
//! values into an immutable [`ServerConfig`] and applies the defaults that
//! depend on other values (state and log directories derive from the checkout).

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use thiserror::Error;

use crate::io::config::{ProvisionerConfig, load_config};
use crate::io::store::StatePaths;

/// Name of the state directory created inside the checkout when none is given.
pub const DEFAULT_STATE_DIR_NAME: &str = ".terraform-ci";

/// Errors that stop the daemon before any component starts.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no checkout directory specified")]
    MissingCheckoutDir,
    #[error("checkout directory {} is not a directory", .0.display())]
    CheckoutNotADirectory(PathBuf),
    #[error("unknown log level '{0}' (expected DEBUG, INFO, WARN or ERROR)")]
    InvalidLogLevel(String),
    #[error("invalid provisioner config: {0:#}")]
    Provisioner(anyhow::Error),
}

/// Verbosity of daemon logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Directive understood by `tracing_subscriber::EnvFilter`.
    pub fn as_directive(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl FromStr for LogLevel {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DEBUG" => Ok(LogLevel::Debug),
            "INFO" => Ok(LogLevel::Info),
            "WARN" | "WARNING" => Ok(LogLevel::Warn),
            "ERROR" => Ok(LogLevel::Error),
            _ => Err(ConfigError::InvalidLogLevel(s.to_string())),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_directive().to_ascii_uppercase())
    }
}

/// Raw option values as they come off the command line.
#[derive(Debug, Clone)]
pub struct ConfigOptions {
    pub checkout_dir: Option<PathBuf>,
    pub clear_state: bool,
    pub log_dir: Option<PathBuf>,
    pub log_level: String,
    pub no_plans: bool,
    pub bind: String,
    pub port: u16,
    pub site_dir: PathBuf,
    pub state_dir: Option<PathBuf>,
    pub verbose: bool,
}

impl Default for ConfigOptions {
    fn default() -> Self {
        Self {
            checkout_dir: None,
            clear_state: false,
            log_dir: None,
            log_level: "INFO".to_string(),
            no_plans: false,
            bind: "0.0.0.0".to_string(),
            port: 3000,
            site_dir: PathBuf::from("site"),
            state_dir: None,
            verbose: false,
        }
    }
}

/// Fully resolved configuration, immutable for the life of the process.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub checkout_dir: PathBuf,
    pub state_dir: PathBuf,
    pub site_dir: PathBuf,
    pub log_dir: PathBuf,
    pub log_level: LogLevel,
    pub bind: String,
    pub port: u16,
    /// Discard all run history before accepting requests.
    pub clear_state: bool,
    /// When false, plan requests are recorded as succeeded without running anything.
    pub run_plan_enabled: bool,
    pub provisioner: ProvisionerConfig,
}

impl ServerConfig {
    /// Defaults for a checkout, with state kept in `<checkout>/.terraform-ci`.
    pub fn new(checkout_dir: impl Into<PathBuf>) -> Self {
        let checkout_dir = checkout_dir.into();
        let state_dir = checkout_dir.join(DEFAULT_STATE_DIR_NAME);
        Self {
            log_dir: state_dir.join("logs"),
            state_dir,
            checkout_dir,
            site_dir: PathBuf::from("site"),
            log_level: LogLevel::Info,
            bind: "0.0.0.0".to_string(),
            port: 3000,
            clear_state: false,
            run_plan_enabled: true,
            provisioner: ProvisionerConfig::default(),
        }
    }

    /// Apply defaults and validation to raw options.
    ///
    /// Does not read `config.toml`; see [`ServerConfig::load_provisioner`].
    pub fn resolve(opts: ConfigOptions) -> Result<Self, ConfigError> {
        let checkout_dir = match opts.checkout_dir {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => return Err(ConfigError::MissingCheckoutDir),
        };
        if !checkout_dir.is_dir() {
            return Err(ConfigError::CheckoutNotADirectory(checkout_dir));
        }

        let log_level = if opts.verbose {
            LogLevel::Debug
        } else {
            opts.log_level.parse()?
        };
        let state_dir = opts
            .state_dir
            .unwrap_or_else(|| checkout_dir.join(DEFAULT_STATE_DIR_NAME));
        let log_dir = opts.log_dir.unwrap_or_else(|| state_dir.join("logs"));

        Ok(Self {
            checkout_dir,
            state_dir,
            site_dir: opts.site_dir,
            log_dir,
            log_level,
            bind: opts.bind,
            port: opts.port,
            clear_state: opts.clear_state,
            run_plan_enabled: !opts.no_plans,
            provisioner: ProvisionerConfig::default(),
        })
    }

    /// Read `<state>/config.toml`, keeping defaults when it is absent.
    pub fn load_provisioner(mut self) -> Result<Self, ConfigError> {
        let path = StatePaths::new(&self.state_dir).config_path;
        self.provisioner = load_config(&path).map_err(ConfigError::Provisioner)?;
        Ok(self)
    }

    /// Checkout-relative path prefixes the change watcher must not react to.
    ///
    /// Covers the daemon's own state directory (when it lives inside the
    /// checkout) and the provisioner's working data.
    pub fn ignored_prefixes(&self) -> Vec<String> {
        let mut prefixes = vec![".terraform/".to_string(), ".terraform.lock.hcl".to_string()];
        for dir in [&self.state_dir, &self.log_dir] {
            if let Some(prefix) = relative_prefix(&self.checkout_dir, dir)
                && !prefixes.contains(&prefix)
            {
                prefixes.push(prefix);
            }
        }
        prefixes
    }
}

fn relative_prefix(root: &Path, dir: &Path) -> Option<String> {
    let rel = dir.strip_prefix(root).ok()?;
    let rel = rel.to_str()?;
    if rel.is_empty() {
        return None;
    }
    Some(format!("{}/", rel.trim_end_matches('/')))
}
