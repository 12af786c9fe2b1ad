//! The inventory: ordered, reference-counted host sets.
//!
//! Host sets are immutable once published under an ID, sorted by host ID,
//! and canonicalised: building a set whose host-ID sequence matches an
//! existing one returns the existing ID with its reference count bumped.
//! The reserved set `all` holds every known host, is created with the
//! server and is never released.

pub mod yml;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::host::{Host, HostInfo, LOCALHOST, LOCALHOST_ID};

/// The inventory that contains all known hosts.
pub const ALL_HOSTS: &str = "all";

/// A property key and the values one of which should match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyAndValues {
    pub key: String,
    pub values: Vec<String>,
}

/// Host selection criteria. Multiple selectors passed to `Select` are
/// conjunctive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Selector {
    /// Hosts carrying all the labels.
    HasAllLabels(Vec<String>),
    /// Hosts carrying at least one of the labels.
    HasAnyLabel(Vec<String>),
    /// Hosts carrying none of the labels.
    HasNoneLabels(Vec<String>),
    /// Hosts with one of the IDs.
    ByID(Vec<String>),
    /// Hosts matching at least one of the property criteria.
    HasAnyProperty(Vec<KeyAndValues>),
    /// Hosts matching all the property criteria.
    HasAllProperty(Vec<KeyAndValues>),
}

impl Selector {
    /// Selector for hosts carrying the label.
    pub fn has(label: impl Into<String>) -> Selector {
        Selector::HasAllLabels(vec![label.into()])
    }

    pub fn has_all_of(labels: &[&str]) -> Selector {
        Selector::HasAllLabels(labels.iter().map(|s| s.to_string()).collect())
    }

    pub fn has_any_of(labels: &[&str]) -> Selector {
        Selector::HasAnyLabel(labels.iter().map(|s| s.to_string()).collect())
    }

    pub fn has_none_of(labels: &[&str]) -> Selector {
        Selector::HasNoneLabels(labels.iter().map(|s| s.to_string()).collect())
    }

    pub fn with_ids(ids: &[&str]) -> Selector {
        Selector::ByID(ids.iter().map(|s| s.to_string()).collect())
    }
}

fn property_match(kv: &KeyAndValues, h: &HostInfo) -> bool {
    match h.properties.get(&kv.key) {
        Some(v) => kv.values.iter().any(|x| x == v),
        None => false,
    }
}

/// Whether the host matches the selector.
pub fn is_match(sel: &Selector, h: &HostInfo) -> bool {
    match sel {
        Selector::HasAllLabels(labels) => labels.iter().all(|l| h.has_label(l)),
        Selector::HasAnyLabel(labels) => labels.iter().any(|l| h.has_label(l)),
        Selector::HasNoneLabels(labels) => !labels.iter().any(|l| h.has_label(l)),
        Selector::ByID(ids) => ids.iter().any(|id| *id == h.id),
        Selector::HasAnyProperty(props) => props.iter().any(|p| property_match(p, h)),
        Selector::HasAllProperty(props) => props.iter().all(|p| property_match(p, h)),
    }
}

/// References to a set of hosts, ordered by host ID.
struct HostSet {
    id: String,
    hosts: Vec<Arc<Host>>,
    refcnt: usize,
}

impl HostSet {
    fn new(id: impl Into<String>) -> HostSet {
        HostSet {
            id: id.into(),
            hosts: Vec::new(),
            refcnt: 0,
        }
    }

    fn add(&mut self, hosts: impl IntoIterator<Item = Arc<Host>>) {
        self.hosts.extend(hosts);
        self.hosts.sort_by(|a, b| a.id().cmp(b.id()));
    }

    /// Structural equality on the host-ID sequences.
    fn same_hosts(&self, other: &HostSet) -> bool {
        self.hosts.len() == other.hosts.len()
            && self
                .hosts
                .iter()
                .zip(&other.hosts)
                .all(|(a, b)| a.id() == b.id())
    }

    fn find(&self, id: &str) -> Option<Arc<Host>> {
        self.hosts.iter().find(|h| h.id() == id).cloned()
    }
}

/// Serves the inventory through named host sets.
pub struct InvServer {
    sets: RwLock<HashMap<String, HostSet>>,
}

impl InvServer {
    pub fn new(hosts: Vec<Arc<Host>>) -> InvServer {
        let mut all = HostSet::new(ALL_HOSTS);
        all.add(hosts);
        let mut sets = HashMap::new();
        sets.insert(all.id.clone(), all);
        InvServer {
            sets: RwLock::new(sets),
        }
    }

    /// Inserts the candidate set, or returns the ID of an existing set with
    /// the same hosts. Bumps the winner's reference count either way.
    fn publish(sets: &mut HashMap<String, HostSet>, mut candidate: HostSet) -> String {
        if let Some(existing) = sets.values_mut().find(|s| s.same_hosts(&candidate)) {
            existing.refcnt += 1;
            return existing.id.clone();
        }
        candidate.id = Uuid::new_v4().to_string();
        candidate.refcnt = 1;
        let id = candidate.id.clone();
        sets.insert(id.clone(), candidate);
        id
    }

    fn resolve(sets: &HashMap<String, HostSet>, host_id: &str) -> Result<Arc<Host>> {
        if host_id == LOCALHOST_ID {
            return Ok(LOCALHOST.clone());
        }
        sets[ALL_HOSTS]
            .find(host_id)
            .ok_or_else(|| Error::InvalidHost(host_id.to_string()))
    }

    /// Selects the subset of `from` matched by all of the selectors and
    /// returns the new inventory ID.
    pub fn select(&self, from: &str, selectors: &[Selector]) -> Result<String> {
        let mut sets = self.sets.write();
        let hosts: Vec<Arc<Host>> = sets
            .get(from)
            .ok_or_else(|| Error::InventoryNotFound(from.to_string()))?
            .hosts
            .iter()
            .filter(|h| selectors.iter().all(|sel| is_match(sel, &h.info)))
            .cloned()
            .collect();
        let mut set = HostSet::new("");
        set.add(hosts);
        Ok(Self::publish(&mut sets, set))
    }

    /// Concatenates the source inventories; duplicates are preserved.
    pub fn union(&self, sources: &[String]) -> Result<String> {
        let mut sets = self.sets.write();
        let mut hosts = Vec::new();
        for src in sources {
            let set = sets
                .get(src)
                .ok_or_else(|| Error::InventoryNotFound(src.to_string()))?;
            hosts.extend(set.hosts.iter().cloned());
        }
        let mut set = HostSet::new("");
        set.add(hosts);
        Ok(Self::publish(&mut sets, set))
    }

    /// Creates a new inventory containing the given hosts.
    pub fn make(&self, host_ids: &[String]) -> Result<String> {
        let mut sets = self.sets.write();
        let mut hosts = Vec::new();
        for id in host_ids {
            hosts.push(Self::resolve(&sets, id)?);
        }
        let mut set = HostSet::new("");
        set.add(hosts);
        Ok(Self::publish(&mut sets, set))
    }

    /// Produces a derived inventory with the extra hosts; the original is
    /// unchanged.
    pub fn add(&self, to: &str, host_ids: &[String]) -> Result<String> {
        let mut sets = self.sets.write();
        let mut hosts: Vec<Arc<Host>> = sets
            .get(to)
            .ok_or_else(|| Error::InventoryNotFound(to.to_string()))?
            .hosts
            .clone();
        for id in host_ids {
            hosts.push(Self::resolve(&sets, id)?);
        }
        let mut set = HostSet::new("");
        set.add(hosts);
        Ok(Self::publish(&mut sets, set))
    }

    pub fn get_host_ids(&self, id: &str) -> Result<Vec<String>> {
        let sets = self.sets.read();
        let set = sets
            .get(id)
            .ok_or_else(|| Error::InventoryNotFound(id.to_string()))?;
        Ok(set.hosts.iter().map(|h| h.id().to_string()).collect())
    }

    /// Looks up hosts by ID among all known hosts.
    pub fn get_host(&self, ids: &[String]) -> Result<Vec<Arc<Host>>> {
        let sets = self.sets.read();
        ids.iter().map(|id| Self::resolve(&sets, id)).collect()
    }

    pub fn get_host_info(&self, ids: &[String]) -> Result<Vec<HostInfo>> {
        Ok(self
            .get_host(ids)?
            .into_iter()
            .map(|h| h.info.clone())
            .collect())
    }

    /// Drops one reference. The set becomes garbage at zero. Releasing the
    /// reserved `all` set does nothing.
    pub fn release(&self, id: &str) {
        if id == ALL_HOSTS {
            return;
        }
        let mut sets = self.sets.write();
        if let Some(set) = sets.get_mut(id) {
            set.refcnt = set.refcnt.saturating_sub(1);
            if set.refcnt == 0 {
                sets.remove(id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(id: &str, labels: &[&str]) -> Arc<Host> {
        let mut h = Host::default();
        h.info.id = id.to_string();
        h.info.labels = labels.iter().map(|s| s.to_string()).collect();
        Arc::new(h)
    }

    fn server() -> InvServer {
        InvServer::new(vec![
            host("h1", &["l1", "l2"]),
            host("h2", &[]),
            host("h3", &["lx"]),
        ])
    }

    #[test]
    fn select_by_label() {
        let srv = server();
        let id = srv
            .select(ALL_HOSTS, &[Selector::has("l1")])
            .unwrap();
        assert_eq!(srv.get_host_ids(&id).unwrap(), vec!["h1"]);
    }

    #[test]
    fn select_is_conjunctive() {
        let srv = server();
        let id = srv
            .select(
                ALL_HOSTS,
                &[Selector::has("l1"), Selector::has_none_of(&["l2"])],
            )
            .unwrap();
        assert!(srv.get_host_ids(&id).unwrap().is_empty());
    }

    #[test]
    fn make_canonicalises_regardless_of_order() {
        let srv = server();
        let a = srv.make(&["h1".into(), "h3".into()]).unwrap();
        let b = srv.make(&["h3".into(), "h1".into()]).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn union_preserves_duplicates() {
        let srv = server();
        let i = srv.make(&["h1".into(), "h2".into()]).unwrap();
        let same = srv.union(&[i.clone()]).unwrap();
        assert_eq!(same, i);
        let double = srv.union(&[i.clone(), i.clone()]).unwrap();
        assert_eq!(
            srv.get_host_ids(&double).unwrap(),
            vec!["h1", "h1", "h2", "h2"]
        );
    }

    #[test]
    fn release_frees_at_zero() {
        let srv = server();
        let a = srv.make(&["h1".into()]).unwrap();
        let b = srv.make(&["h1".into()]).unwrap();
        assert_eq!(a, b);
        srv.release(&a);
        assert!(srv.get_host_ids(&a).is_ok());
        srv.release(&a);
        assert!(srv.get_host_ids(&a).is_err());
    }

    #[test]
    fn release_all_is_ignored() {
        let srv = server();
        srv.release(ALL_HOSTS);
        srv.release(ALL_HOSTS);
        assert_eq!(srv.get_host_ids(ALL_HOSTS).unwrap().len(), 3);
    }

    #[test]
    fn add_derives_a_new_set() {
        let srv = server();
        let a = srv.make(&["h1".into()]).unwrap();
        let b = srv.add(&a, &["h2".into()]).unwrap();
        assert_ne!(a, b);
        assert_eq!(srv.get_host_ids(&a).unwrap(), vec!["h1"]);
        assert_eq!(srv.get_host_ids(&b).unwrap(), vec!["h1", "h2"]);
    }

    #[test]
    fn unknown_host_is_an_error() {
        let srv = server();
        assert!(srv.make(&["nope".into()]).is_err());
    }

    #[test]
    fn localhost_resolves_without_inventory() {
        let srv = server();
        let id = srv.make(&["localhost".into()]).unwrap();
        assert_eq!(srv.get_host_ids(&id).unwrap(), vec!["localhost"]);
    }

    #[test]
    fn property_selectors() {
        let mut h = Host::default();
        h.info.id = "p1".into();
        h.info
            .properties
            .insert("os".into(), "debian".into());
        let srv = InvServer::new(vec![Arc::new(h)]);
        let kv = KeyAndValues {
            key: "os".into(),
            values: vec!["debian".into(), "ubuntu".into()],
        };
        let id = srv
            .select(ALL_HOSTS, &[Selector::HasAllProperty(vec![kv])])
            .unwrap();
        assert_eq!(srv.get_host_ids(&id).unwrap(), vec!["p1"]);

        let kv = KeyAndValues {
            key: "os".into(),
            values: vec!["fedora".into()],
        };
        let id = srv
            .select(ALL_HOSTS, &[Selector::HasAnyProperty(vec![kv])])
            .unwrap();
        assert!(srv.get_host_ids(&id).unwrap().is_empty());
    }
}
