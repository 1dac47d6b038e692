use crate::auth::{Authenticator, CredentialStore};
use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

/// Config holds the server's immutable startup settings. Assembled
/// once (from a TOML file, CLI flags, or both) and shared read-only
/// across sessions.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listen address
    pub listen: SocketAddr,

    /// Username for username/password authentication; presence of
    /// both user and password selects UserPass, absence selects NoAuth
    pub user: Option<String>,

    /// Password for username/password authentication
    pub password: Option<String>,

    /// Additional accounts (username -> password) merged into the
    /// credential store
    pub users: HashMap<String, String>,

    /// Outbound dial bound in seconds
    pub connect_timeout_secs: u64,

    /// BIND accept bound in seconds
    pub bind_timeout_secs: u64,

    /// Idle expiry for UDP client-target flows in seconds
    pub udp_idle_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 1080),
            user: None,
            password: None,
            users: HashMap::new(),
            connect_timeout_secs: 10,
            bind_timeout_secs: 30,
            udp_idle_timeout_secs: 60,
        }
    }
}

/// Config implementation block
impl Config {
    /// load reads and parses a TOML config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// validate rejects inconsistent settings
    pub fn validate(&self) -> Result<()> {
        if self.user.is_some() != self.password.is_some() {
            bail!("must provide both user and password (or neither)");
        }
        Ok(())
    }

    /// credentials assembles the credential store from the single
    /// user/password pair and the users table, or None when no
    /// credentials are configured
    pub fn credentials(&self) -> Option<CredentialStore> {
        let mut users = self.users.clone();
        if let (Some(u), Some(p)) = (&self.user, &self.password) {
            users.insert(u.clone(), p.clone());
        }

        if users.is_empty() {
            None
        } else {
            Some(CredentialStore::new(users))
        }
    }

    /// authenticators builds the server's method preference order:
    /// UserPass only when credentials are configured, NoAuth otherwise
    pub fn authenticators(&self) -> Vec<Authenticator> {
        match self.credentials() {
            Some(store) => vec![Authenticator::UserPass(store)],
            None => vec![Authenticator::NoAuth],
        }
    }

    /// connect_timeout is the outbound dial bound
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// bind_timeout bounds the BIND accept wait
    pub fn bind_timeout(&self) -> Duration {
        Duration::from_secs(self.bind_timeout_secs)
    }

    /// udp_idle_timeout is the idle expiry for UDP flows
    pub fn udp_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.udp_idle_timeout_secs)
    }
}
