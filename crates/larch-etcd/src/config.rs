//! Backend configuration parsed from the host's flat string map.

use std::collections::HashMap;

use larch_core::constants::DEFAULT_ENDPOINT;
use larch_core::constants::DEFAULT_ROOT_PATH;
use larch_core::constants::ENDPOINT_DELIMITER;
use serde::Deserialize;
use serde::Serialize;

/// Configuration for [`EtcdBackend`](crate::EtcdBackend).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EtcdConfig {
    /// Root prefix under which all service keys live. Always absolute.
    pub path: String,
    /// Coordination-service endpoints, for whoever constructs the client.
    pub endpoints: Vec<String>,
}

impl Default for EtcdConfig {
    fn default() -> Self {
        Self {
            path: DEFAULT_ROOT_PATH.to_string(),
            endpoints: vec![DEFAULT_ENDPOINT.to_string()],
        }
    }
}

impl EtcdConfig {
    /// Parse the host-supplied configuration map.
    ///
    /// `path` gets a leading `/` added if absent; `address` is split on
    /// commas, with surrounding whitespace trimmed per endpoint. Unknown
    /// keys are ignored.
    pub fn from_conf(conf: &HashMap<String, String>) -> Self {
        let mut path = conf
            .get("path")
            .cloned()
            .unwrap_or_else(|| DEFAULT_ROOT_PATH.to_string());
        if !path.starts_with('/') {
            path.insert(0, '/');
        }

        let endpoints = match conf.get("address") {
            None => vec![DEFAULT_ENDPOINT.to_string()],
            Some(address) => address
                .split(ENDPOINT_DELIMITER)
                .map(str::trim)
                .filter(|e| !e.is_empty())
                .map(str::to_string)
                .collect(),
        };

        Self { path, endpoints }
    }
}
