// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! `apx_server` JSON configuration: spec.md §6.

use std::path::Path;

use serde::Deserialize;

/// Top-level configuration document, matching spec.md §6's JSON shape
/// exactly (`server` / `extension.socket-server` / `extension.textlog` /
/// `extension.monitor`).
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub extension: ExtensionSection,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerSection {
    #[serde(rename = "shutdown-timer")]
    pub shutdown_timer: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExtensionSection {
    #[serde(rename = "socket-server", default)]
    pub socket_server: SocketServerConfig,
    #[serde(default)]
    pub textlog: TextlogConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SocketServerConfig {
    #[serde(rename = "tcp-port")]
    pub tcp_port: u16,
    #[serde(rename = "unix-file", default)]
    pub unix_file: Option<String>,
    #[serde(rename = "tcp-tag", default)]
    pub tcp_tag: Option<String>,
    #[serde(rename = "unix-tag", default)]
    pub unix_tag: Option<String>,
}

impl Default for SocketServerConfig {
    fn default() -> SocketServerConfig {
        SocketServerConfig { tcp_port: 5000, unix_file: None, tcp_tag: None, unix_tag: None }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TextlogConfig {
    #[serde(rename = "extension-enabled", default)]
    pub extension_enabled: bool,
    #[serde(rename = "file-enabled", default)]
    pub file_enabled: bool,
    #[serde(rename = "file-path", default)]
    pub file_path: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MonitorConfig {
    #[serde(rename = "extension-enabled", default)]
    pub extension_enabled: bool,
}

impl ServerConfig {
    /// Load configuration from a JSON file. spec.md §6: exit code 1 on
    /// any configuration error.
    pub fn from_file(path: &Path) -> Result<ServerConfig, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let config: ServerConfig = serde_json::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.extension.socket_server.tcp_port == 0 {
            return Err(ConfigError::InvalidValue("extension.socket-server.tcp-port cannot be 0".into()));
        }
        if self.extension.textlog.file_enabled && self.extension.textlog.file_path.is_none() {
            return Err(ConfigError::InvalidValue("extension.textlog.file-path required when file-enabled".into()));
        }
        Ok(())
    }
}

/// Configuration error types, reported to the CLI as exit code 1.
#[derive(Debug, Clone)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(s) => write!(f, "I/O error: {s}"),
            Self::Parse(s) => write!(f, "parse error: {s}"),
            Self::InvalidValue(s) => write!(f, "invalid value: {s}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_minimal_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "extension": {{ "socket-server": {{ "tcp-port": 5000 }} }} }}"#).unwrap();
        let config = ServerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.extension.socket_server.tcp_port, 5000);
        assert!(config.server.shutdown_timer.is_none());
    }

    #[test]
    fn parses_full_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "server": {{ "shutdown-timer": 30 }},
                "extension": {{
                    "socket-server": {{ "tcp-port": 5000, "unix-file": "/tmp/apx.sock", "tcp-tag": "tcp", "unix-tag": "unix" }},
                    "textlog": {{ "extension-enabled": true, "file-enabled": true, "file-path": "/tmp/apx.log" }},
                    "monitor": {{ "extension-enabled": true }}
                }}
            }}"#
        )
        .unwrap();
        let config = ServerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.server.shutdown_timer, Some(30));
        assert_eq!(config.extension.socket_server.unix_file.as_deref(), Some("/tmp/apx.sock"));
        assert!(config.extension.textlog.extension_enabled);
        assert!(config.extension.monitor.extension_enabled);
    }

    #[test]
    fn zero_tcp_port_is_invalid() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "extension": {{ "socket-server": {{ "tcp-port": 0 }} }} }}"#).unwrap();
        let err = ServerConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(_)));
    }

    #[test]
    fn textlog_file_enabled_without_path_is_invalid() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "extension": {{ "socket-server": {{ "tcp-port": 5000 }}, "textlog": {{ "file-enabled": true }} }} }}"#
        )
        .unwrap();
        let err = ServerConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(_)));
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = ServerConfig::from_file(Path::new("/nonexistent/apx.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn malformed_json_is_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        let err = ServerConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
