//! IPC transport configuration.

use std::path::PathBuf;
use std::time::Duration;

use keyward_types::config::AppConfig;
use keyward_types::{KeywardError, Result};

/// Socket file name inside the data directory.
pub const SOCKET_FILE_NAME: &str = "daemon.sock";

/// Longest accepted IPC line, in bytes.
pub const MAX_LINE_LEN: usize = 1024 * 1024;

/// Configuration shared by the IPC server and client.
#[derive(Clone, Debug)]
pub struct IpcConfig {
    /// Path of the Unix socket. Created with `0600` permissions.
    pub socket_path: PathBuf,

    /// How long a correlated client request waits for its reply.
    pub request_timeout: Duration,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            socket_path: std::env::temp_dir().join("keyward.sock"),
            request_timeout: Duration::from_millis(AppConfig::default().ipc_timeout_ms),
        }
    }
}

impl IpcConfig {
    /// Socket inside `data_dir`, timeout from `app`.
    pub fn in_data_dir(data_dir: &std::path::Path, app: &AppConfig) -> Self {
        Self {
            socket_path: data_dir.join(SOCKET_FILE_NAME),
            request_timeout: Duration::from_millis(app.ipc_timeout_ms),
        }
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// `KeywardError::ConfigError` for an empty socket path or a zero
    /// timeout.
    pub fn validate(&self) -> Result<()> {
        if self.socket_path.as_os_str().is_empty() {
            return Err(KeywardError::ConfigError {
                reason: "IPC socket path must not be empty".into(),
            });
        }
        if self.request_timeout.is_zero() {
            return Err(KeywardError::ConfigError {
                reason: "IPC request timeout must be greater than 0".into(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        let config = IpcConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.request_timeout, Duration::from_secs(5));
    }

    #[test]
    fn empty_path_rejected() {
        let config = IpcConfig {
            socket_path: PathBuf::new(),
            ..IpcConfig::default()
        };
        assert!(matches!(config.validate(), Err(KeywardError::ConfigError { .. })));
    }

    #[test]
    fn data_dir_socket() {
        let config = IpcConfig::in_data_dir(std::path::Path::new("/home/u/.keyward"), &AppConfig::default());
        assert_eq!(config.socket_path, PathBuf::from("/home/u/.keyward/daemon.sock"));
    }
}
