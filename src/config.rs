/// Typed configuration, read once at startup from `config.json`.
/// Unknown keys are rejected with `ConfigInvalid`.
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::BotError;

/// Per-server options.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Base nickname. With `random_nick`, 4 random alphanumerics are appended.
    #[serde(default = "default_nick")]
    pub nick: String,
    #[serde(default)]
    pub nickserv_password: Option<String>,
    #[serde(default)]
    pub use_tls: bool,
    /// Verify the server certificate on TLS connections.
    #[serde(default = "default_true")]
    pub verify_ssl: bool,
    #[serde(default)]
    pub random_nick: bool,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Channels joined automatically after registration.
    #[serde(default)]
    pub channels: BTreeSet<String>,
    /// Extra channels joined whenever the key channel is joined.
    #[serde(default)]
    pub also_join: HashMap<String, Vec<String>>,
    /// Channels where `xdcc send` requests are rewritten to `xdcc ssend`.
    #[serde(default)]
    pub rewrite_to_ssend: HashSet<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            nick: default_nick(),
            nickserv_password: None,
            use_tls: false,
            verify_ssl: true,
            random_nick: false,
            port: default_port(),
            channels: BTreeSet::new(),
            also_join: HashMap::new(),
            rewrite_to_ssend: HashSet::new(),
        }
    }
}

/// Control-plane bind address.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpConfig {
    #[serde(default = "default_http_host")]
    pub host: String,
    #[serde(default = "default_http_port")]
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: default_http_host(),
            port: default_http_port(),
        }
    }
}

/// Process-wide options plus the server table.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub servers: HashMap<String, ServerConfig>,
    /// Fallback used when an operator names a server not in `servers`.
    #[serde(default)]
    pub default_server_config: Option<ServerConfig>,
    #[serde(default = "default_download_path")]
    pub download_path: PathBuf,
    /// Empty set means no MIME gating.
    #[serde(default)]
    pub allowed_mimetypes: HashSet<String>,
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    /// Seconds without activity before a channel is parted.
    #[serde(default = "default_idle_timeout")]
    pub channel_idle_timeout: u64,
    /// Seconds without channels or transfers before a session quits.
    #[serde(default = "default_idle_timeout")]
    pub server_idle_timeout: u64,
    /// Seconds to wait for DCC ACCEPT (and for passive peers to dial in).
    #[serde(default = "default_resume_timeout")]
    pub resume_timeout: u64,
    /// Seconds a finished transfer remains visible in `/info`.
    #[serde(default = "default_transfer_list_timeout")]
    pub transfer_list_timeout: u64,
    #[serde(default)]
    pub auto_md5sum: bool,
    /// Appended to in-flight downloads, stripped on completion.
    #[serde(default = "default_incomplete_suffix")]
    pub incomplete_suffix: String,
    /// Peers whose `xdcc send` requests are always rewritten to ssend.
    #[serde(default)]
    pub ssend_map: HashMap<String, bool>,
    #[serde(default)]
    pub allow_private_ips: bool,
    #[serde(default)]
    pub http: HttpConfig,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, BotError> {
        let raw = std::fs::read_to_string(path.as_ref())
            .map_err(|e| BotError::ConfigInvalid(format!("{}: {e}", path.as_ref().display())))?;
        let config: Config =
            serde_json::from_str(&raw).map_err(|e| BotError::ConfigInvalid(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), BotError> {
        if self.servers.is_empty() && self.default_server_config.is_none() {
            return Err(BotError::ConfigInvalid(
                "no servers configured and no default_server_config".into(),
            ));
        }
        if self.incomplete_suffix.is_empty() {
            return Err(BotError::ConfigInvalid(
                "incomplete_suffix must not be empty".into(),
            ));
        }
        Ok(())
    }

    /// Resolve the configuration for a server, falling back to the default.
    pub fn server_config(&self, server: &str) -> Result<ServerConfig, BotError> {
        if let Some(config) = self.servers.get(server) {
            return Ok(config.clone());
        }
        self.default_server_config
            .clone()
            .ok_or_else(|| BotError::ConfigInvalid(format!("no configuration for server {server}")))
    }
}

fn default_nick() -> String {
    "dccbot".into()
}

fn default_true() -> bool {
    true
}

fn default_port() -> u16 {
    6667
}

fn default_http_host() -> String {
    "127.0.0.1".into()
}

fn default_http_port() -> u16 {
    8080
}

fn default_download_path() -> PathBuf {
    PathBuf::from("./downloads")
}

fn default_max_file_size() -> u64 {
    100 * 1024 * 1024
}

fn default_idle_timeout() -> u64 {
    1800
}

fn default_resume_timeout() -> u64 {
    30
}

fn default_transfer_list_timeout() -> u64 {
    86400
}

fn default_incomplete_suffix() -> String {
    ".incomplete".into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn minimal_config_with_one_server() {
        let config: Config = serde_json::from_str(
            r##"{"servers": {"irc.example.net": {"channels": ["#downloads"]}}}"##,
        )
        .unwrap();
        config.validate().unwrap();

        let server = config.server_config("irc.example.net").unwrap();
        assert_eq!(server.nick, "dccbot");
        assert_eq!(server.port, 6667);
        assert!(server.verify_ssl);
        assert!(server.channels.contains("#downloads"));
        assert_eq!(config.max_file_size, 100 * 1024 * 1024);
        assert_eq!(config.incomplete_suffix, ".incomplete");
        assert_eq!(config.resume_timeout, 30);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let result: Result<Config, _> =
            serde_json::from_str(r#"{"servers": {}, "downloads_path": "/tmp"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn unknown_server_falls_back_to_default() {
        let config: Config = serde_json::from_str(
            r#"{"default_server_config": {"nick": "leech", "use_tls": true}}"#,
        )
        .unwrap();
        config.validate().unwrap();

        let server = config.server_config("irc.other.net").unwrap();
        assert_eq!(server.nick, "leech");
        assert!(server.use_tls);
    }

    #[test]
    fn no_servers_and_no_default_is_invalid() {
        let config: Config = serde_json::from_str(r#"{"servers": {}}"#).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn unknown_server_without_default_is_an_error() {
        let config: Config =
            serde_json::from_str(r#"{"servers": {"irc.example.net": {}}}"#).unwrap();
        assert!(config.server_config("irc.unknown.net").is_err());
    }
}
