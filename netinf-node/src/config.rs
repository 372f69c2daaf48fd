//! Load config from file and environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use netinf_core::{integrity, FetchPolicy, RetrieveKeys};
use serde::Deserialize;

/// Daemon configuration. File: ~/.config/netinf/config.toml or /etc/netinf/config.toml.
/// Env overrides: NETINF_NRS_HOST, NETINF_NRS_PORT, NETINF_HASH_ALG,
/// NETINF_DISCOVERY_INTERVAL_SECS, NETINF_PUBLISH, NETINF_FULL_PUT, NETINF_STORE_DIR,
/// NETINF_PEER_PORT, NETINF_DISCOVERY_PORT.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub nrs: NrsSettings,
    /// Algorithm label for identifiers of downloaded content (default "sha-256").
    #[serde(default = "default_hash_alg")]
    pub hash_alg: String,
    /// Seconds between discovery scans (default 30).
    #[serde(default = "default_discovery_interval_secs")]
    pub discovery_interval_secs: u64,
    /// Peers not seen for this long are dropped (default 120).
    #[serde(default = "default_peer_expiry_secs")]
    pub peer_expiry_secs: u64,
    /// How long one scan listens for beacon replies (default 1500 ms).
    #[serde(default = "default_scan_window_ms")]
    pub scan_window_ms: u64,
    /// Publish obtained content back into the network.
    #[serde(default)]
    pub publish: bool,
    /// Embed content in publishes instead of metadata and locators only.
    #[serde(default)]
    pub full_put: bool,
    /// Re-hash retrieved files and reject mismatches.
    #[serde(default)]
    pub verify_retrieved: bool,
    #[serde(default = "default_store_dir")]
    pub store_dir: PathBuf,
    /// Discovery UDP port (default 45678).
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// Request server TCP port (default 45679).
    #[serde(default = "default_peer_port")]
    pub peer_port: u16,
    /// Bound on every protocol call (default 10).
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_retrieve_order")]
    pub retrieve_order: Vec<RetrieveSource>,
    /// Extra tracing directives, e.g. "netinf_node::nrs=trace".
    #[serde(default)]
    pub log_filter: Option<String>,
}

/// Name resolution service endpoint and response key names.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NrsSettings {
    #[serde(default = "default_nrs_host")]
    pub host: String,
    #[serde(default = "default_nrs_port")]
    pub port: u16,
    #[serde(default = "default_publish_path")]
    pub publish_path: String,
    #[serde(default = "default_search_path")]
    pub search_path: String,
    #[serde(default = "default_retrieve_path")]
    pub retrieve_path: String,
    #[serde(default = "default_file_path_key")]
    pub file_path_key: String,
    #[serde(default = "default_content_type_key")]
    pub content_type_key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetrieveSource {
    Local,
    Nrs,
    Peer,
}

fn default_hash_alg() -> String {
    integrity::SHA_256.to_string()
}
fn default_discovery_interval_secs() -> u64 {
    30
}
fn default_peer_expiry_secs() -> u64 {
    120
}
fn default_scan_window_ms() -> u64 {
    1500
}
fn default_store_dir() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".local/share/netinf"),
        None => PathBuf::from("/var/lib/netinf"),
    }
}
fn default_discovery_port() -> u16 {
    45678
}
fn default_peer_port() -> u16 {
    45679
}
fn default_request_timeout_secs() -> u64 {
    10
}
fn default_retrieve_order() -> Vec<RetrieveSource> {
    vec![RetrieveSource::Local, RetrieveSource::Nrs, RetrieveSource::Peer]
}
fn default_nrs_host() -> String {
    "localhost".to_string()
}
fn default_nrs_port() -> u16 {
    8080
}
fn default_publish_path() -> String {
    "netinfproto/publish".to_string()
}
fn default_search_path() -> String {
    "netinfproto/search".to_string()
}
fn default_retrieve_path() -> String {
    "netinfproto/get".to_string()
}
fn default_file_path_key() -> String {
    RetrieveKeys::default().file_path
}
fn default_content_type_key() -> String {
    RetrieveKeys::default().content_type
}

impl Default for NrsSettings {
    fn default() -> Self {
        Self {
            host: default_nrs_host(),
            port: default_nrs_port(),
            publish_path: default_publish_path(),
            search_path: default_search_path(),
            retrieve_path: default_retrieve_path(),
            file_path_key: default_file_path_key(),
            content_type_key: default_content_type_key(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            nrs: NrsSettings::default(),
            hash_alg: default_hash_alg(),
            discovery_interval_secs: default_discovery_interval_secs(),
            peer_expiry_secs: default_peer_expiry_secs(),
            scan_window_ms: default_scan_window_ms(),
            publish: false,
            full_put: false,
            verify_retrieved: false,
            store_dir: default_store_dir(),
            discovery_port: default_discovery_port(),
            peer_port: default_peer_port(),
            request_timeout_secs: default_request_timeout_secs(),
            retrieve_order: default_retrieve_order(),
            log_filter: None,
        }
    }
}

impl Config {
    pub fn policy(&self) -> FetchPolicy {
        FetchPolicy {
            hash_algorithm: self.hash_alg.clone(),
            publish_on_success: self.publish,
            full_put: self.full_put,
        }
    }

    pub fn retrieve_keys(&self) -> RetrieveKeys {
        RetrieveKeys {
            file_path: self.nrs.file_path_key.clone(),
            content_type: self.nrs.content_type_key.clone(),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_secs(self.discovery_interval_secs)
    }

    pub fn peer_expiry(&self) -> Duration {
        Duration::from_secs(self.peer_expiry_secs)
    }

    pub fn scan_window(&self) -> Duration {
        Duration::from_millis(self.scan_window_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !integrity::is_supported(&self.hash_alg) {
            return Err(ConfigError::Invalid(format!(
                "unsupported hash_alg {:?}",
                self.hash_alg
            )));
        }
        if self.discovery_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "discovery_interval_secs must be positive".into(),
            ));
        }
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "request_timeout_secs must be positive".into(),
            ));
        }
        if self.nrs.host.is_empty() {
            return Err(ConfigError::Invalid("nrs.host is empty".into()));
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("{var}={value:?} is not valid")]
    Env { var: &'static str, value: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Result<Config, ConfigError> {
    load_from(&config_paths(), |name| std::env::var(name).ok())
}

fn load_from(
    paths: &[PathBuf],
    env: impl Fn(&str) -> Option<String>,
) -> Result<Config, ConfigError> {
    let mut c = match paths.iter().find(|p| p.exists()) {
        Some(path) => load_file(path)?,
        None => Config::default(),
    };
    if let Some(s) = env("NETINF_NRS_HOST") {
        c.nrs.host = s;
    }
    if let Some(s) = env("NETINF_NRS_PORT") {
        c.nrs.port = parse_env("NETINF_NRS_PORT", s)?;
    }
    if let Some(s) = env("NETINF_HASH_ALG") {
        c.hash_alg = s;
    }
    if let Some(s) = env("NETINF_DISCOVERY_INTERVAL_SECS") {
        c.discovery_interval_secs = parse_env("NETINF_DISCOVERY_INTERVAL_SECS", s)?;
    }
    if let Some(s) = env("NETINF_PUBLISH") {
        c.publish = parse_flag("NETINF_PUBLISH", s)?;
    }
    if let Some(s) = env("NETINF_FULL_PUT") {
        c.full_put = parse_flag("NETINF_FULL_PUT", s)?;
    }
    if let Some(s) = env("NETINF_STORE_DIR") {
        c.store_dir = PathBuf::from(s);
    }
    if let Some(s) = env("NETINF_PEER_PORT") {
        c.peer_port = parse_env("NETINF_PEER_PORT", s)?;
    }
    if let Some(s) = env("NETINF_DISCOVERY_PORT") {
        c.discovery_port = parse_env("NETINF_DISCOVERY_PORT", s)?;
    }
    c.validate()?;
    Ok(c)
}

fn parse_env<T: std::str::FromStr>(var: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Env { var, value })
}

fn parse_flag(var: &'static str, value: String) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Env { var, value }),
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/netinf/config.toml"));
    }
    out.push(PathBuf::from("/etc/netinf/config.toml"));
    out
}

fn load_file(path: &Path) -> Result<Config, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&s).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn write(dir: &tempfile::TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("config.toml");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn defaults_without_file() {
        let c = load_from(&[PathBuf::from("/no/such/config.toml")], no_env).unwrap();
        assert_eq!(c.nrs.publish_path, "netinfproto/publish");
        assert_eq!(c.hash_alg, "sha-256");
        assert_eq!(c.discovery_port, 45678);
        assert_eq!(c.peer_port, 45679);
        assert!(!c.publish);
        assert_eq!(
            c.retrieve_order,
            [RetrieveSource::Local, RetrieveSource::Nrs, RetrieveSource::Peer]
        );
    }

    #[test]
    fn file_values_then_env_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            &dir,
            r#"
            publish = true
            retrieve_order = ["nrs"]
            [nrs]
            host = "nrs.lan"
            port = 9090
            content_type_key = "ct"
            "#,
        );
        let env: HashMap<&str, &str> = [("NETINF_NRS_PORT", "9999"), ("NETINF_FULL_PUT", "yes")]
            .into_iter()
            .collect();
        let c = load_from(&[path], |k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(c.nrs.host, "nrs.lan");
        assert_eq!(c.nrs.port, 9999);
        assert_eq!(c.retrieve_keys().content_type, "ct");
        assert_eq!(c.retrieve_order, [RetrieveSource::Nrs]);
        let policy = c.policy();
        assert!(policy.publish_on_success);
        assert!(policy.full_put);
    }

    #[test]
    fn unknown_field_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "proxy_port = 3128\n");
        assert!(matches!(
            load_from(&[path], no_env),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn bad_env_and_bad_algorithm_rejected() {
        let paths = [PathBuf::from("/no/such/config.toml")];
        assert!(matches!(
            load_from(&paths, |k| (k == "NETINF_PEER_PORT").then(|| "x".to_string())),
            Err(ConfigError::Env {
                var: "NETINF_PEER_PORT",
                ..
            })
        ));
        assert!(matches!(
            load_from(&paths, |k| (k == "NETINF_HASH_ALG").then(|| "md5".to_string())),
            Err(ConfigError::Invalid(_))
        ));
    }
}
