//! Peer registry: last-known peer set keyed by address, reconciled wholesale on each refresh.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::peer::{DeviceStatus, Peer};

/// Diff produced by a refresh.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reconciliation {
    pub added: Vec<Peer>,
    pub removed: Vec<Peer>,
    pub updated: Vec<Peer>,
}

impl Reconciliation {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.updated.is_empty()
    }
}

/// Ordered by first sighting. Peers still present keep their position across refreshes.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: Vec<Peer>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the visible set with `incoming`. The new contents are built aside and
    /// swapped in at once; readers never see a partial refresh.
    ///
    /// Within `incoming`, a repeated address keeps its first position and its last attributes.
    /// Entries with an empty address are skipped.
    pub fn refresh(&mut self, incoming: Vec<Peer>) -> Reconciliation {
        let mut order: Vec<String> = Vec::with_capacity(incoming.len());
        let mut latest: HashMap<String, Peer> = HashMap::with_capacity(incoming.len());
        for peer in incoming {
            if peer.address.is_empty() {
                continue;
            }
            if !latest.contains_key(&peer.address) {
                order.push(peer.address.clone());
            }
            latest.insert(peer.address.clone(), peer);
        }

        let mut diff = Reconciliation::default();
        let mut next = Vec::with_capacity(order.len());
        for old in &self.peers {
            match latest.remove(&old.address) {
                Some(fresh) => {
                    if !fresh.same_attributes(old) {
                        diff.updated.push(fresh.clone());
                    }
                    next.push(fresh);
                }
                None => diff.removed.push(old.clone()),
            }
        }
        for address in order {
            if let Some(fresh) = latest.remove(&address) {
                diff.added.push(fresh.clone());
                next.push(fresh);
            }
        }

        self.peers = next;
        diff
    }

    /// Drop every peer. Returns the removals.
    pub fn clear(&mut self) -> Reconciliation {
        Reconciliation {
            removed: std::mem::take(&mut self.peers),
            ..Reconciliation::default()
        }
    }

    pub fn current_peers(&self) -> &[Peer] {
        &self.peers
    }

    pub fn get(&self, address: &str) -> Option<&Peer> {
        self.peers.iter().find(|p| p.address == address)
    }

    pub fn contains(&self, address: &str) -> bool {
        self.get(address).is_some()
    }

    /// Peers the OS reports as currently connected to us.
    pub fn connected(&self) -> Vec<Peer> {
        self.peers
            .iter()
            .filter(|p| p.status == DeviceStatus::Connected)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::PeerRecord;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};
    use std::time::{Duration, SystemTime};

    fn peer(address: &str, name: &str) -> Peer {
        PeerRecord::new(address, name).into_peer(SystemTime::UNIX_EPOCH)
    }

    fn addresses(reg: &PeerRegistry) -> Vec<&str> {
        reg.current_peers().iter().map(|p| p.address.as_str()).collect()
    }

    #[test]
    fn first_refresh_adds_everything() {
        let mut reg = PeerRegistry::new();
        let diff = reg.refresh(vec![peer("a", "A"), peer("b", "B")]);
        assert_eq!(diff.added.len(), 2);
        assert!(diff.removed.is_empty());
        assert!(diff.updated.is_empty());
        assert_eq!(addresses(&reg), vec!["a", "b"]);
    }

    #[test]
    fn same_input_twice_is_empty_diff() {
        let mut reg = PeerRegistry::new();
        let scan = vec![peer("a", "A"), peer("b", "B")];
        assert!(!reg.refresh(scan.clone()).is_empty());
        assert!(reg.refresh(scan).is_empty());
    }

    #[test]
    fn newer_timestamp_alone_is_not_an_update() {
        let mut reg = PeerRegistry::new();
        reg.refresh(vec![peer("a", "A")]);
        let later = PeerRecord::new("a", "A").into_peer(SystemTime::UNIX_EPOCH + Duration::from_secs(60));
        let diff = reg.refresh(vec![later.clone()]);
        assert!(diff.is_empty());
        assert_eq!(reg.get("a").map(|p| p.last_seen_at), Some(later.last_seen_at));
    }

    #[test]
    fn missing_peers_are_evicted_and_order_is_stable() {
        let mut reg = PeerRegistry::new();
        reg.refresh(vec![peer("a", "A"), peer("b", "B"), peer("c", "C")]);
        let diff = reg.refresh(vec![peer("d", "D"), peer("c", "C"), peer("a", "A")]);
        assert_eq!(addresses(&reg), vec!["a", "c", "d"]);
        assert_eq!(diff.removed.len(), 1);
        assert_eq!(diff.removed[0].address, "b");
        assert_eq!(diff.added.len(), 1);
        assert_eq!(diff.added[0].address, "d");
    }

    #[test]
    fn changed_attributes_are_updates() {
        let mut reg = PeerRegistry::new();
        reg.refresh(vec![peer("a", "A")]);
        let mut owner = peer("a", "A");
        owner.is_group_owner = true;
        let diff = reg.refresh(vec![owner]);
        assert_eq!(diff.updated.len(), 1);
        assert!(reg.get("a").is_some_and(|p| p.is_group_owner));
    }

    #[test]
    fn duplicate_addresses_collapse_last_wins() {
        let mut reg = PeerRegistry::new();
        reg.refresh(vec![peer("a", "first"), peer("b", "B"), peer("a", "second")]);
        assert_eq!(addresses(&reg), vec!["a", "b"]);
        assert_eq!(reg.get("a").map(|p| p.display_name.as_str()), Some("second"));
    }

    #[test]
    fn empty_address_ignored() {
        let mut reg = PeerRegistry::new();
        let diff = reg.refresh(vec![peer("", "ghost"), peer("a", "A")]);
        assert_eq!(diff.added.len(), 1);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn clear_reports_removals() {
        let mut reg = PeerRegistry::new();
        reg.refresh(vec![peer("a", "A"), peer("b", "B")]);
        let diff = reg.clear();
        assert_eq!(diff.removed.len(), 2);
        assert!(reg.is_empty());
    }

    #[test]
    fn connected_filters_by_status() {
        let mut reg = PeerRegistry::new();
        let mut a = peer("a", "A");
        a.status = DeviceStatus::Connected;
        reg.refresh(vec![a, peer("b", "B")]);
        let connected = reg.connected();
        assert_eq!(connected.len(), 1);
        assert_eq!(connected[0].address, "a");
    }

    #[test]
    fn registry_always_mirrors_latest_scan() {
        let mut rng = StdRng::seed_from_u64(7);
        let pool: Vec<Peer> = (0..12).map(|i| peer(&format!("p{i}"), &format!("P{i}"))).collect();
        let mut reg = PeerRegistry::new();
        for _ in 0..200 {
            let mut scan: Vec<Peer> = pool.iter().filter(|_| rng.gen_bool(0.5)).cloned().collect();
            scan.shuffle(&mut rng);
            let before: Vec<String> = reg.current_peers().iter().map(|p| p.address.clone()).collect();
            reg.refresh(scan.clone());

            let mut got: Vec<&str> = addresses(&reg);
            let mut want: Vec<&str> = scan.iter().map(|p| p.address.as_str()).collect();
            // Survivors keep their previous relative order.
            let survivors: Vec<&str> = before
                .iter()
                .map(String::as_str)
                .filter(|a| want.contains(a))
                .collect();
            assert_eq!(&got[..survivors.len()], survivors.as_slice());

            got.sort_unstable();
            want.sort_unstable();
            assert_eq!(got, want);
        }
    }
}
