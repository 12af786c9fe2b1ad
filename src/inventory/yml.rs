//! YAML inventory loader.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::host::{Address, Host, HostInfo, PRIMARY};
#[cfg(feature = "ssh")]
use crate::ssh::RawPrivateKey;

/// Configuration picked up from the inventory itself, shared by the hosts.
#[derive(Default)]
pub struct InventoryConfiguration {
    #[cfg(feature = "ssh")]
    pub private_key: Option<Arc<RawPrivateKey>>,
}

/// The inventory file as parsed from YAML.
#[derive(Debug, Default, Deserialize)]
pub struct Inventory {
    #[serde(default, rename = "privateKey")]
    pub private_key_file: Option<PathBuf>,
    #[serde(default)]
    pub passphrase: Option<String>,
    #[serde(default)]
    pub configuration: Option<serde_yaml::Value>,
    #[serde(default)]
    pub hosts: Vec<YamlHost>,
    /// Bulk label assignment: label name to host IDs.
    #[serde(default)]
    pub labels: HashMap<String, Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
pub struct YamlSsh {
    pub hostname: String,
    #[serde(default)]
    pub network: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default, rename = "become")]
    pub become_method: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct YamlAddress {
    pub address: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct YamlHost {
    #[serde(default)]
    pub network: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub properties: HashMap<String, String>,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub addresses: Vec<YamlAddress>,
    #[serde(default)]
    pub ssh: Option<YamlSsh>,
    #[serde(default)]
    pub configuration: Option<serde_yaml::Value>,
}

fn yaml_to_json(v: &serde_yaml::Value) -> Result<serde_json::Value> {
    serde_json::to_value(v).map_err(Error::Json)
}

impl YamlHost {
    fn to_host(&self) -> Result<Host> {
        let mut host = Host {
            info: HostInfo {
                id: self.id.clone(),
                labels: self.labels.clone(),
                properties: self.properties.clone(),
                ..HostInfo::default()
            },
            network: self.network.clone(),
            backend: "linux".into(),
            ..Host::default()
        };
        if let Some(ssh) = &self.ssh {
            if ssh.hostname.is_empty() {
                return Err(Error::Config("empty hostname".into()));
            }
            host.hostname = ssh.hostname.clone();
            if !ssh.network.is_empty() {
                host.network = ssh.network.clone();
            }
            host.port = ssh.port;
            host.login_user = ssh.user.clone();
            host.login_password = ssh.password.clone();
            host.become_method = ssh.become_method.clone();
        }
        if let Some(cfg) = &self.configuration {
            host.configuration = Some(yaml_to_json(cfg)?);
        }
        host.defaults();

        if self.address.is_empty() {
            if self.addresses.is_empty() {
                host.discover_ips()?;
            } else {
                for a in &self.addresses {
                    let ip: IpAddr = a.address.parse().map_err(|_| {
                        Error::Config(format!("cannot parse address {}", a.address))
                    })?;
                    if a.name.is_empty() {
                        return Err(Error::Config(format!(
                            "name required for address {}",
                            a.address
                        )));
                    }
                    host.info.addresses.push(Address {
                        name: a.name.clone(),
                        address: ip.to_string(),
                    });
                }
            }
        } else {
            if !self.addresses.is_empty() {
                return Err(Error::Config(format!(
                    "both address and addresses are given for {}",
                    self.id
                )));
            }
            let ip: IpAddr = self.address.parse().map_err(|_| {
                Error::Config(format!("cannot parse address {}", self.address))
            })?;
            host.info.addresses.push(Address {
                name: PRIMARY.into(),
                address: ip.to_string(),
            });
        }
        Ok(host)
    }
}

impl Inventory {
    /// Converts the parsed file to the host array, applying the bulk label
    /// assignments.
    pub fn to_inventory(&self) -> Result<Vec<Arc<Host>>> {
        let mut hosts = Vec::with_capacity(self.hosts.len());
        for h in &self.hosts {
            hosts.push(h.to_host()?);
        }
        let mut missing = Vec::new();
        for (label, ids) in &self.labels {
            for id in ids {
                match hosts.iter_mut().find(|h| h.id() == id) {
                    Some(host) => host.info.labels.push(label.clone()),
                    None => missing.push(id.clone()),
                }
            }
        }
        if !missing.is_empty() {
            return Err(Error::Config(format!(
                "these hosts are referenced in the inventory, but they are not defined: {}",
                missing.join(",")
            )));
        }
        Ok(hosts.into_iter().map(Arc::new).collect())
    }
}

/// Loads an inventory from a YAML file. Returns the shared configuration,
/// the hosts, and the inventory-embedded configuration tree.
pub fn load_inventory(
    path: &Path,
) -> Result<(InventoryConfiguration, Vec<Arc<Host>>, Option<serde_json::Value>)> {
    let data = std::fs::read_to_string(path)?;
    let inv: Inventory = serde_yaml::from_str(&data)?;

    let mut cfg = InventoryConfiguration::default();
    #[cfg(feature = "ssh")]
    if let Some(file) = &inv.private_key_file {
        let pem = std::fs::read(file)?;
        cfg.private_key = Some(Arc::new(RawPrivateKey::from_pem(
            pem,
            inv.passphrase.clone(),
        )));
    }

    let mut hosts = inv.to_inventory()?;
    #[cfg(feature = "ssh")]
    if let Some(key) = &cfg.private_key {
        for host in &mut hosts {
            Arc::get_mut(host)
                .expect("hosts are not shared during load")
                .key_auth = Some(key.clone());
        }
    }

    let configuration = match &inv.configuration {
        Some(v) => Some(yaml_to_json(v)?),
        None => None,
    };
    Ok((cfg, hosts, configuration))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::{InvServer, Selector, ALL_HOSTS};

    const INV: &str = r#"---
hosts:
  - id: h1
    address: 127.0.0.2
    labels:
      - l1
      - l2
  - id: h2
    address: 127.0.0.3
  - id: h3
    address: 127.0.0.4
    labels:
      - lx
labels:
  bulk1:
    - h2
    - h3
"#;

    #[test]
    fn parses_and_labels() {
        let inv: Inventory = serde_yaml::from_str(INV).unwrap();
        let hosts = inv.to_inventory().unwrap();
        assert_eq!(hosts.len(), 3);

        let srv = InvServer::new(hosts);
        let h1 = srv
            .select(ALL_HOSTS, &[Selector::with_ids(&["h1"])])
            .unwrap();
        let ids = srv.get_host_ids(&h1).unwrap();
        assert_eq!(ids, vec!["h1"]);
        let info = srv.get_host_info(&ids).unwrap();
        assert!(!info[0].has_label("bulk1"));
        assert!(info[0].has_label("l1"));

        for h in ["h2", "h3"] {
            let id = srv
                .select(ALL_HOSTS, &[Selector::with_ids(&[h])])
                .unwrap();
            let ids = srv.get_host_ids(&id).unwrap();
            let info = srv.get_host_info(&ids).unwrap();
            assert!(info[0].has_label("bulk1"));
        }
    }

    #[test]
    fn unknown_label_target_fails() {
        let inv: Inventory = serde_yaml::from_str(
            "hosts:\n  - id: h1\n    address: 127.0.0.2\nlabels:\n  l:\n    - nope\n",
        )
        .unwrap();
        assert!(inv.to_inventory().is_err());
    }

    #[test]
    fn address_and_addresses_conflict() {
        let inv: Inventory = serde_yaml::from_str(
            "hosts:\n  - id: h1\n    address: 127.0.0.2\n    addresses:\n      - address: 127.0.0.3\n        name: alt\n",
        )
        .unwrap();
        assert!(inv.to_inventory().is_err());
    }
}
