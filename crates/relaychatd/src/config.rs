//! Cluster configuration: the set of nodes, their client and RPC
//! addresses (spec §4.I).
//!
//! Loaded from a single JSON file shared by every node in the cluster
//! (each node is told which entry is itself via `--node`), the same
//! shape the original system's `config_loader.py` reads — expressed here
//! with `serde_json` rather than the TOML the teacher daemon used for its
//! own local config, since this file is a cluster-wide topology document
//! copied verbatim to every node, not a per-install settings file.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error reading {path}: {source}")]
    Io { path: String, source: std::io::Error },

    #[error("malformed cluster config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("no node named {name:?} in cluster config")]
    UnknownNode { name: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeEntry {
    pub name: String,
    pub client_addr: SocketAddr,
    pub rpc_addr: SocketAddr,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    pub nodes: Vec<NodeEntry>,
}

impl ClusterConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// The entry for `name`, or an error if the cluster config doesn't
    /// mention it.
    pub fn node(&self, name: &str) -> Result<&NodeEntry, ConfigError> {
        self.nodes
            .iter()
            .find(|n| n.name == name)
            .ok_or_else(|| ConfigError::UnknownNode { name: name.to_string() })
    }

    /// `(name, rpc_addr)` for every node other than `current`.
    pub fn peers_of(&self, current: &str) -> Vec<(String, SocketAddr)> {
        self.nodes
            .iter()
            .filter(|n| n.name != current)
            .map(|n| (n.name.clone(), n.rpc_addr))
            .collect()
    }
}
