//! Preseed document for `incus admin init --preseed`.
//!
//! The document is built from an [`InstallationConfig`] by a pure function
//! and serialised with `serde_yaml`. Maps are `BTreeMap`s so the same config
//! always yields byte-identical YAML.

pub mod storage;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::InstallationConfig;

pub const POOL_NAME: &str = "default";
pub const PROFILE_NAME: &str = "default";
pub const STORAGE_DRIVER: &str = "dir";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreseedDocument {
    pub config: BTreeMap<String, String>,
    pub networks: Vec<Network>,
    pub storage_pools: Vec<StoragePool>,
    pub profiles: Vec<Profile>,
    /// Always `null`: standalone installs only.
    pub cluster: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    pub config: BTreeMap<String, String>,
    pub description: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoragePool {
    pub config: BTreeMap<String, String>,
    pub description: String,
    pub name: String,
    pub driver: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub config: BTreeMap<String, String>,
    pub description: String,
    pub devices: BTreeMap<String, Device>,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
}

pub fn generate(config: &InstallationConfig) -> PreseedDocument {
    let network = Network {
        config: BTreeMap::from([
            ("ipv4.address".to_string(), "auto".to_string()),
            ("ipv6.address".to_string(), "auto".to_string()),
        ]),
        description: String::new(),
        name: config.bridge_name.clone(),
        kind: "bridge".to_string(),
    };

    let pool = StoragePool {
        config: BTreeMap::from([(
            "source".to_string(),
            config.storage_path.display().to_string(),
        )]),
        description: String::new(),
        name: POOL_NAME.to_string(),
        driver: STORAGE_DRIVER.to_string(),
    };

    let devices = BTreeMap::from([
        (
            "eth0".to_string(),
            Device {
                name: Some("eth0".to_string()),
                network: Some(config.bridge_name.clone()),
                path: None,
                pool: None,
                kind: "nic".to_string(),
            },
        ),
        (
            "root".to_string(),
            Device {
                name: None,
                network: None,
                path: Some("/".to_string()),
                pool: Some(POOL_NAME.to_string()),
                kind: "disk".to_string(),
            },
        ),
    ]);

    PreseedDocument {
        config: BTreeMap::new(),
        networks: vec![network],
        storage_pools: vec![pool],
        profiles: vec![Profile {
            config: BTreeMap::new(),
            description: String::new(),
            devices,
            name: PROFILE_NAME.to_string(),
        }],
        cluster: None,
    }
}

impl PreseedDocument {
    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }

    /// Drop entries for objects the daemon already has, so an init that
    /// stopped halfway can be completed without re-creating them.
    pub fn only_missing(mut self, pool_exists: bool, network_exists: bool) -> Self {
        if pool_exists {
            self.storage_pools.clear();
        }
        if network_exists {
            self.networks.clear();
        }
        self
    }

    pub fn storage_source(&self) -> Option<&str> {
        self.storage_pools
            .first()
            .and_then(|p| p.config.get("source"))
            .map(String::as_str)
    }
}
