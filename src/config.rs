//! Node configuration, loaded from TOML.

use std::{fs, net::SocketAddr, path::Path};

use ed25519_dalek::{SigningKey, SECRET_KEY_LENGTH};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::{
    core::{id::NodeId, node::Node},
    error::NetworkError,
    peer::DEFAULT_MAX_PEERS,
};

/// The address nodes listen on unless configured otherwise.
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:1122";

/// How log lines are rendered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Plain,
    Json,
}

/// A bootstrap node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedConfig {
    /// Hex node identifier, `0x`-prefixed or not.
    pub id: String,
    pub addr: SocketAddr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Hex ed25519 secret key. A fresh key is generated when absent.
    pub secret_key: Option<String>,
    pub listen_addr: SocketAddr,
    /// The address advertised to other nodes, the bound listen address if unset.
    pub public_addr: Option<SocketAddr>,
    pub seeds: Vec<SeedConfig>,
    /// Routes every connection through this NAT server when set.
    pub nat_addr: Option<SocketAddr>,
    pub chain_id: u16,
    pub protocol_version: u16,
    pub max_peers: usize,
    /// Default filter directive, `RUST_LOG` takes precedence.
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            secret_key: None,
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 1122)),
            public_addr: None,
            seeds: Vec::new(),
            nat_addr: None,
            chain_id: 0,
            protocol_version: 0,
            max_peers: DEFAULT_MAX_PEERS,
            log_level: "info".into(),
            log_format: LogFormat::Plain,
        }
    }
}

impl NetworkConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, NetworkError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;

        Ok(config)
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, NetworkError> {
        Self::from_toml_str(&fs::read_to_string(path)?)
    }

    /// Checks the key, the seeds and the limits.
    pub fn validate(&self) -> Result<(), NetworkError> {
        if let Some(key) = &self.secret_key {
            parse_secret_key(key)?;
        }

        self.seeds()?;

        if self.max_peers == 0 {
            return Err(NetworkError::Config("max_peers must be positive".into()));
        }

        Ok(())
    }

    /// The configured key, or a newly generated one.
    pub fn signing_key(&self) -> Result<SigningKey, NetworkError> {
        match &self.secret_key {
            Some(key) => parse_secret_key(key),
            None => Ok(SigningKey::generate(&mut OsRng)),
        }
    }

    pub fn seeds(&self) -> Result<Vec<Node>, NetworkError> {
        self.seeds
            .iter()
            .map(|seed| Ok(Node::new(NodeId::from_hex(&seed.id)?, seed.addr)))
            .collect()
    }
}

fn parse_secret_key(s: &str) -> Result<SigningKey, NetworkError> {
    let raw = s.strip_prefix("0x").unwrap_or(s);
    let bytes = hex::decode(raw).map_err(|e| NetworkError::Config(format!("secret key: {e}")))?;
    let bytes: [u8; SECRET_KEY_LENGTH] = bytes.try_into().map_err(|_| {
        NetworkError::Config(format!("secret key must be {SECRET_KEY_LENGTH} bytes"))
    })?;

    Ok(SigningKey::from_bytes(&bytes))
}
