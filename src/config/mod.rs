//! Configuration
//!
//! Connection settings, credentials, host key policy and tunnel options.
//! Values come from an optional JSON file (see [`storage`]) with
//! `HPC_CONSOLE_*` environment variables layered on top.

pub mod storage;

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConsoleError;

pub use storage::{config_dir, config_file, ConfigError, ConfigStorage};

/// Environment variable names understood by [`ConsoleConfig::apply_env`]
pub const ENV_HOST: &str = "HPC_CONSOLE_HOST";
pub const ENV_PORT: &str = "HPC_CONSOLE_PORT";
pub const ENV_USERNAME: &str = "HPC_CONSOLE_USERNAME";
pub const ENV_PASSWORD: &str = "HPC_CONSOLE_PASSWORD";
pub const ENV_HOST_KEY_POLICY: &str = "HPC_CONSOLE_HOST_KEY_POLICY";
pub const ENV_EMAIL: &str = "HPC_CONSOLE_EMAIL";

/// Username and password, read once at start-up
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Both fields present and non-empty
    pub fn validate(&self) -> Result<(), ConsoleError> {
        if self.username.trim().is_empty() || self.password.is_empty() {
            return Err(ConsoleError::Configuration(
                "Missing SSH credentials.".to_string(),
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// What to do with the login host's public key
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostKeyPolicy {
    /// Only hosts already present in known_hosts are accepted
    Strict,
    /// Unknown hosts are trusted and recorded, changed keys are rejected
    #[default]
    AcceptNew,
    /// Every key is accepted without verification
    AcceptAny,
}

impl std::str::FromStr for HostKeyPolicy {
    type Err = ConsoleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "strict" => Ok(Self::Strict),
            "accept_new" => Ok(Self::AcceptNew),
            "accept_any" => Ok(Self::AcceptAny),
            other => Err(ConsoleError::Configuration(format!(
                "Unknown host key policy '{}'. Expected strict, accept_new or accept_any.",
                other
            ))),
        }
    }
}

/// How a tunnel worker serves accepted local connections
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayMode {
    /// Accept one client, relay it to completion, then accept the next
    #[default]
    Serial,
    /// One relay task per accepted client
    Concurrent,
}

/// Tunnel options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelSettings {
    /// Local address the listeners bind to
    #[serde(default = "default_bind_host")]
    pub bind_host: String,

    /// Port opened on the target node (sshd on compute nodes)
    #[serde(default = "default_remote_port")]
    pub remote_port: u16,

    /// Upper bound on waiting for a tunnel worker to exit
    #[serde(default = "default_join_timeout_ms")]
    pub join_timeout_ms: u64,

    #[serde(default)]
    pub relay_mode: RelayMode,
}

impl TunnelSettings {
    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            bind_host: default_bind_host(),
            remote_port: default_remote_port(),
            join_timeout_ms: default_join_timeout_ms(),
            relay_mode: RelayMode::Serial,
        }
    }
}

/// Complete console configuration
#[derive(Clone, Serialize, Deserialize)]
pub struct ConsoleConfig {
    /// Login host of the cluster
    #[serde(default)]
    pub host: String,

    /// SSH port (default: 22)
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub username: String,

    /// Usually supplied through the environment rather than the file
    #[serde(default, skip_serializing)]
    pub password: String,

    /// Connection timeout in seconds
    #[serde(default = "default_timeout")]
    pub connect_timeout_secs: u64,

    /// Keepalive interval in seconds, 0 disables keepalives
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_secs: u64,

    /// Missed keepalives before the session is dropped
    #[serde(default = "default_keepalive_max")]
    pub keepalive_max: usize,

    #[serde(default)]
    pub host_key_policy: HostKeyPolicy,

    /// Overrides ~/.ssh/known_hosts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub known_hosts_path: Option<PathBuf>,

    #[serde(default)]
    pub tunnel: TunnelSettings,

    /// Passed to batch job scripts for scheduler notifications
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl fmt::Debug for ConsoleConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsoleConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("keepalive_interval_secs", &self.keepalive_interval_secs)
            .field("keepalive_max", &self.keepalive_max)
            .field("host_key_policy", &self.host_key_policy)
            .field("known_hosts_path", &self.known_hosts_path)
            .field("tunnel", &self.tunnel)
            .field("email", &self.email)
            .finish_non_exhaustive()
    }
}

fn default_port() -> u16 {
    22
}

fn default_timeout() -> u64 {
    30
}

fn default_keepalive_interval() -> u64 {
    30
}

fn default_keepalive_max() -> usize {
    3
}

fn default_bind_host() -> String {
    "127.0.0.1".to_string()
}

fn default_remote_port() -> u16 {
    22
}

fn default_join_timeout_ms() -> u64 {
    1000
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_port(),
            username: String::new(),
            password: String::new(),
            connect_timeout_secs: default_timeout(),
            keepalive_interval_secs: default_keepalive_interval(),
            keepalive_max: default_keepalive_max(),
            host_key_policy: HostKeyPolicy::default(),
            known_hosts_path: None,
            tunnel: TunnelSettings::default(),
            email: None,
        }
    }
}

impl ConsoleConfig {
    /// Layer `HPC_CONSOLE_*` variables from the process environment
    pub fn apply_env(&mut self) -> Result<(), ConsoleError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Layer overrides from an arbitrary lookup (the environment in production)
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConsoleError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup(ENV_HOST) {
            self.host = host;
        }
        if let Some(port) = lookup(ENV_PORT) {
            self.port = port.trim().parse().map_err(|_| {
                ConsoleError::Configuration(format!("{} is not a valid port: {}", ENV_PORT, port))
            })?;
        }
        if let Some(username) = lookup(ENV_USERNAME) {
            self.username = username;
        }
        if let Some(password) = lookup(ENV_PASSWORD) {
            self.password = password;
        }
        if let Some(policy) = lookup(ENV_HOST_KEY_POLICY) {
            self.host_key_policy = policy.parse()?;
        }
        if let Some(email) = lookup(ENV_EMAIL) {
            let email = email.trim();
            self.email = (!email.is_empty()).then(|| email.to_string());
        }
        Ok(())
    }

    /// Login host, required before connecting
    pub fn remote_host(&self) -> Result<&str, ConsoleError> {
        let host = self.host.trim();
        if host.is_empty() {
            return Err(ConsoleError::Configuration(format!(
                "No remote host configured. Set {} or \"host\" in the config file.",
                ENV_HOST
            )));
        }
        Ok(host)
    }

    /// Credentials as configured, validated
    pub fn credentials(&self) -> Result<Credentials, ConsoleError> {
        let credentials = Credentials::new(self.username.clone(), self.password.clone());
        credentials.validate()?;
        Ok(credentials)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}
