//! Server configuration.
//!
//! Values resolve in the order defaults, TOML file, env vars, CLI flags.
//! The file uses the field names below; every field is optional.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tessera_cluster::{ClusterConfig, NodeId, PoolConfig, DEFAULT_MAX_CONNECTIONS};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TesseraConfig {
    pub bind: String,
    pub port: u16,
    /// Host other nodes use to reach this one. Falls back to `bind`.
    pub announce_host: String,
    /// Empty disables client authentication.
    pub requirepass: String,
    pub maxclients: usize,
    pub cluster: ClusterSection,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSection {
    /// Start a new cluster owning every slot.
    pub as_seed: bool,
    /// Data address of any member, used to join.
    pub seed: String,
    /// Join as a slave of this master's data address.
    pub master: String,
    /// Raft listen address. Defaults to `bind` on `port + raft_port_offset`.
    pub raft_listen: String,
    /// Raft address announced to peers. Defaults to the listen port on the
    /// announce host.
    pub raft_advertise: String,
    pub raft_port_offset: u16,
    /// Shared secret for raft transport tags. Empty disables them.
    pub auth_pass: String,
    pub heartbeat_interval_ms: u64,
    pub failover_timeout_ms: u64,
    pub rebalance_interval_ms: u64,
    pub commit_poll_attempts: u32,
    pub commit_poll_interval_ms: u64,
    pub tx_retention_ms: u64,
    pub pool_max_idle: usize,
    pub pool_max_active: usize,
    pub pool_wait_timeout_ms: u64,
    pub dial_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub join_attempts: u32,
}

impl Default for TesseraConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".into(),
            port: 6380,
            announce_host: String::new(),
            requirepass: String::new(),
            maxclients: DEFAULT_MAX_CONNECTIONS,
            cluster: ClusterSection::default(),
        }
    }
}

impl Default for ClusterSection {
    fn default() -> Self {
        Self {
            as_seed: false,
            seed: String::new(),
            master: String::new(),
            raft_listen: String::new(),
            raft_advertise: String::new(),
            raft_port_offset: 10_000,
            auth_pass: String::new(),
            heartbeat_interval_ms: 1_000,
            failover_timeout_ms: 10_000,
            rebalance_interval_ms: 5_000,
            commit_poll_attempts: 50,
            commit_poll_interval_ms: 100,
            tx_retention_ms: 60_000,
            pool_max_idle: 1,
            pool_max_active: 16,
            pool_wait_timeout_ms: 5_000,
            dial_timeout_ms: 3_000,
            read_timeout_ms: 30_000,
            join_attempts: 10,
        }
    }
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

impl TesseraConfig {
    pub fn from_file(path: &Path) -> Result<Self, String> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read config '{}': {e}", path.display()))?;
        toml::from_str(&text).map_err(|e| format!("invalid config '{}': {e}", path.display()))
    }

    pub fn to_toml(&self) -> Result<String, String> {
        toml::to_string_pretty(self).map_err(|e| e.to_string())
    }

    pub fn requirepass(&self) -> Option<String> {
        non_empty(&self.requirepass)
    }

    fn announce_host(&self) -> &str {
        if self.announce_host.is_empty() {
            &self.bind
        } else {
            &self.announce_host
        }
    }

    /// The data address this node is known by. Doubles as its node id.
    pub fn announce_address(&self) -> String {
        format!("{}:{}", self.announce_host(), self.port)
    }

    fn raft_port(&self) -> Result<u16, String> {
        self.port
            .checked_add(self.cluster.raft_port_offset)
            .ok_or_else(|| {
                format!(
                    "port {} + raft-port-offset {} exceeds u16 range",
                    self.port, self.cluster.raft_port_offset
                )
            })
    }

    pub fn raft_listen_address(&self) -> Result<String, String> {
        if !self.cluster.raft_listen.is_empty() {
            return Ok(self.cluster.raft_listen.clone());
        }
        Ok(format!("{}:{}", self.bind, self.raft_port()?))
    }

    /// The raft address announced to peers.
    pub fn raft_announce_address(&self) -> Result<String, String> {
        if !self.cluster.raft_advertise.is_empty() {
            return Ok(self.cluster.raft_advertise.clone());
        }
        let listen = self.raft_listen_address()?;
        let port = listen
            .rsplit_once(':')
            .map(|(_, port)| port)
            .ok_or_else(|| format!("raft listen address '{listen}' has no port"))?;
        Ok(format!("{}:{port}", self.announce_host()))
    }

    /// Seed or join, not both and not neither.
    pub fn validate(&self) -> Result<(), String> {
        let c = &self.cluster;
        if c.as_seed && !c.seed.is_empty() {
            return Err("as-seed and seed are mutually exclusive".into());
        }
        if !c.as_seed && c.seed.is_empty() {
            return Err("either as-seed or seed must be set".into());
        }
        if c.as_seed && !c.master.is_empty() {
            return Err("a seed node cannot start as a slave".into());
        }
        if self.maxclients == 0 {
            return Err("maxclients must be at least 1".into());
        }
        if c.pool_max_active == 0 {
            return Err("pool-max-active must be at least 1".into());
        }
        if c.tx_retention_ms == 0 {
            return Err("tx-retention-ms must be at least 1".into());
        }
        self.raft_port()?;
        Ok(())
    }

    pub fn to_cluster_config(&self) -> Result<ClusterConfig, String> {
        let c = &self.cluster;
        let ms = Duration::from_millis;
        let mut config = ClusterConfig::new(
            NodeId::from(self.announce_address()),
            self.raft_announce_address()?,
        );
        config.heartbeat_interval = ms(c.heartbeat_interval_ms);
        config.failover_timeout = ms(c.failover_timeout_ms);
        config.rebalance_interval = ms(c.rebalance_interval_ms);
        config.commit_poll_attempts = c.commit_poll_attempts;
        config.commit_poll_interval = ms(c.commit_poll_interval_ms);
        config.tx_retention = ms(c.tx_retention_ms);
        config.pool = PoolConfig {
            max_idle: c.pool_max_idle,
            max_active: c.pool_max_active,
            wait_timeout: ms(c.pool_wait_timeout_ms),
            dial_timeout: ms(c.dial_timeout_ms),
            read_timeout: ms(c.read_timeout_ms),
            password: self.requirepass(),
        };
        Ok(config)
    }
}
