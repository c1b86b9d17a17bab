//! CLI argument parsing and config file support.
//!
//! The daemon can be configured via CLI flags, a JSON config file,
//! or a combination of both (CLI overrides config file).

use std::path::{Path, PathBuf};

use clap::Parser;
use keyward_types::config::AppConfig;
use keyward_types::{KeywardError, Result};
use serde::{Deserialize, Serialize};

/// Origin used by the native host when the browser passes none.
const DEFAULT_NATIVE_ORIGIN: &str = "native-host";

/// Origin prefixes browsers pass to a native-messaging host.
const EXTENSION_SCHEMES: [&str; 2] = ["chrome-extension://", "moz-extension://"];

// ---------------------------------------------------------------------------
// CLI arguments
// ---------------------------------------------------------------------------

/// keyward: Ethereum key custody outside the browser.
///
/// Without an origin argument the daemon serves the management socket.
/// When a browser launches it as a native-messaging host (passing the
/// extension origin), it serves stdin/stdout as well.
#[derive(Debug, Parser)]
#[command(name = "keyward-daemon", version, about)]
pub struct CliArgs {
    /// Data directory (default: ~/.keyward).
    #[arg(long, env = "KEYWARD_DATA_DIR", value_name = "PATH")]
    pub data_dir: Option<PathBuf>,

    /// Load settings from a JSON config file.
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Serve native messaging on stdin/stdout.
    #[arg(long)]
    pub native: bool,

    /// Lock the wallet after a period of inactivity.
    #[arg(long)]
    pub auto_lock: bool,

    /// Inactivity before auto-lock, in milliseconds.
    #[arg(long, value_name = "MS")]
    pub auto_lock_timeout_ms: Option<u64>,

    /// Reject approval prompts left unanswered this long.
    #[arg(long, value_name = "MS")]
    pub approval_timeout_ms: Option<u64>,

    /// Browser origin granted account access up front (repeatable).
    #[arg(long = "allow-origin", value_name = "ORIGIN")]
    pub allowed_origins: Vec<String>,

    /// Calling origin. Browsers pass the extension origin here.
    #[arg(value_name = "ORIGIN")]
    pub origin: Option<String>,

    /// Window handle Chrome passes on Windows.
    #[arg(long, hide = true)]
    pub parent_window: Option<String>,
}

// ---------------------------------------------------------------------------
// Config file (JSON)
// ---------------------------------------------------------------------------

/// JSON config file format.
///
/// Example `daemon.json`:
/// ```json
/// {
///   "data_dir": "/home/alice/.keyward",
///   "auto_lock_enabled": true,
///   "auto_lock_timeout_ms": 900000,
///   "allowed_origins": ["chrome-extension://abcdefghijklmnop/"],
///   "rate_quotas": { "sign_transaction": 5 }
/// }
/// ```
///
/// Every [`AppConfig`] field may appear at the top level; missing ones
/// keep their defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonConfigFile {
    pub data_dir: Option<PathBuf>,
    #[serde(flatten)]
    pub app: AppConfig,
}

impl DaemonConfigFile {
    /// Loads a config file.
    ///
    /// # Errors
    ///
    /// `KeywardError::ConfigError` if the file cannot be read or is not
    /// valid JSON.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| KeywardError::ConfigError {
            reason: format!("failed to read config file '{}': {e}", path.display()),
        })?;
        serde_json::from_str(&text).map_err(|e| KeywardError::ConfigError {
            reason: format!("invalid config JSON in '{}': {e}", path.display()),
        })
    }
}

// ---------------------------------------------------------------------------
// Resolved config
// ---------------------------------------------------------------------------

/// Which transports this process serves.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Management socket only.
    Management,
    /// Native messaging on stdio, plus the management socket if free.
    NativeHost {
        /// Origin attributed to requests that carry none.
        origin: String,
    },
}

/// Fully resolved daemon configuration with all defaults applied.
#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub data_dir: PathBuf,
    pub app: AppConfig,
    pub mode: Mode,
}

impl DaemonConfig {
    /// Resolves the configuration: defaults, then the config file (if
    /// any), then CLI flags.
    ///
    /// # Errors
    ///
    /// `KeywardError::ConfigError` for an unreadable config file or an
    /// out-of-range value.
    pub fn resolve(cli: &CliArgs) -> Result<Self> {
        let file = match &cli.config {
            Some(path) => DaemonConfigFile::load(path)?,
            None => DaemonConfigFile::default(),
        };
        let config = Self::merge(file, cli);
        config.app.validate()?;
        Ok(config)
    }

    fn merge(file: DaemonConfigFile, cli: &CliArgs) -> Self {
        let mut app = file.app;
        if cli.auto_lock {
            app.auto_lock_enabled = true;
        }
        if let Some(ms) = cli.auto_lock_timeout_ms {
            app.auto_lock_timeout_ms = ms;
        }
        if cli.approval_timeout_ms.is_some() {
            app.approval_timeout_ms = cli.approval_timeout_ms;
        }
        if !cli.allowed_origins.is_empty() {
            app.allowed_origins
                .get_or_insert_with(Vec::new)
                .extend(cli.allowed_origins.iter().cloned());
        }

        let data_dir = cli
            .data_dir
            .clone()
            .or(file.data_dir)
            .unwrap_or_else(default_data_dir);

        Self {
            data_dir,
            app,
            mode: mode_for(cli),
        }
    }
}

fn mode_for(cli: &CliArgs) -> Mode {
    let launched_by_browser = cli
        .origin
        .as_deref()
        .is_some_and(|o| EXTENSION_SCHEMES.iter().any(|s| o.starts_with(s)));
    if cli.native || launched_by_browser {
        Mode::NativeHost {
            origin: cli
                .origin
                .clone()
                .unwrap_or_else(|| DEFAULT_NATIVE_ORIGIN.into()),
        }
    } else {
        Mode::Management
    }
}

/// Platform-specific default data directory.
fn default_data_dir() -> PathBuf {
    if let Some(home) = dirs::home_dir() {
        return home.join(".keyward");
    }
    if let Some(data) = dirs::data_dir() {
        return data.join("keyward");
    }
    PathBuf::from("keyward-data")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> std::result::Result<CliArgs, KeywardError> {
        CliArgs::try_parse_from(args).map_err(|e| KeywardError::ConfigError { reason: e.to_string() })
    }

    #[test]
    fn bare_invocation_is_management() -> std::result::Result<(), KeywardError> {
        let config = DaemonConfig::resolve(&parse(&["keyward-daemon", "--data-dir", "/tmp/kw"])?)?;
        assert_eq!(config.mode, Mode::Management);
        assert_eq!(config.data_dir, PathBuf::from("/tmp/kw"));
        assert_eq!(config.app, AppConfig::default());
        Ok(())
    }

    #[test]
    fn extension_origin_selects_native_host() -> std::result::Result<(), KeywardError> {
        let cli = parse(&[
            "keyward-daemon",
            "chrome-extension://abcdefghijklmnop/",
            "--parent-window=0",
        ])?;
        assert_eq!(
            mode_for(&cli),
            Mode::NativeHost {
                origin: "chrome-extension://abcdefghijklmnop/".into()
            }
        );

        let forced = parse(&["keyward-daemon", "--native"])?;
        assert_eq!(
            mode_for(&forced),
            Mode::NativeHost {
                origin: DEFAULT_NATIVE_ORIGIN.into()
            }
        );
        Ok(())
    }

    #[test]
    fn cli_overrides_config_file() -> std::result::Result<(), KeywardError> {
        let dir = tempfile::tempdir().map_err(|e| KeywardError::StorageError { reason: e.to_string() })?;
        let path = dir.path().join("daemon.json");
        std::fs::write(
            &path,
            r#"{
                "data_dir": "/srv/keyward",
                "auto_lock_timeout_ms": 600000,
                "allowed_origins": ["https://a.example"],
                "rate_quotas": { "sign_transaction": 3 }
            }"#,
        )
        .map_err(|e| KeywardError::StorageError { reason: e.to_string() })?;

        let path_arg = path.display().to_string();
        let cli = parse(&[
            "keyward-daemon",
            "--config",
            &path_arg,
            "--auto-lock",
            "--allow-origin",
            "https://b.example",
        ])?;
        let config = DaemonConfig::resolve(&cli)?;

        assert_eq!(config.data_dir, PathBuf::from("/srv/keyward"));
        assert!(config.app.auto_lock_enabled);
        assert_eq!(config.app.auto_lock_timeout_ms, 600_000);
        assert_eq!(config.app.rate_quotas.sign_transaction, 3);
        assert_eq!(config.app.rate_quotas.sign_message, 20);
        assert_eq!(
            config.app.allowed_origins,
            Some(vec!["https://a.example".to_string(), "https://b.example".to_string()])
        );
        Ok(())
    }

    #[test]
    fn invalid_values_rejected() -> std::result::Result<(), KeywardError> {
        let cli = parse(&["keyward-daemon", "--auto-lock-timeout-ms", "0"])?;
        assert!(matches!(DaemonConfig::resolve(&cli), Err(KeywardError::ConfigError { .. })));

        let missing = parse(&["keyward-daemon", "--config", "/nonexistent/keyward.json"])?;
        assert!(matches!(DaemonConfig::resolve(&missing), Err(KeywardError::ConfigError { .. })));
        Ok(())
    }
}
