//! Peer directory.
//!
//! Tracks every known peer, its learned direct paths, and the send/receive
//! stamps the ping scheduler works from. Supernodes are the compiled-in
//! rendezvous peers; they are never expired. A JSON snapshot (`peer.db`)
//! persists addresses, identities, and fixed endpoints across restarts so a
//! node comes back with somewhere to dial.

use anyhow::{Context, Result};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Mutex;

use crate::constants::{
    FIREWALL_OPENER_DELAY, PEER_DIRECT_PING_DELAY, PEER_IN_MEMORY_EXPIRATION,
    PEER_PATH_ACTIVITY_TIMEOUT,
};
use crate::identity::{from_hex, to_hex, Address, Identity};

/// One direct UDP path to a peer. Fixed paths come from the supernode
/// table or seed config and are never forgotten.
#[derive(Debug, Clone)]
struct Path {
    addr: SocketAddr,
    fixed: bool,
    last_send: u64,
    last_receive: u64,
}

impl Path {
    fn active(&self, now: u64) -> bool {
        now.saturating_sub(self.last_receive) < PEER_PATH_ACTIVITY_TIMEOUT
    }
}

struct Peer {
    address: Address,
    public: Option<[u8; 32]>,
    session_key: Option<[u8; 32]>,
    paths: Vec<Path>,
    last_direct_send: u64,
    last_direct_receive: u64,
    last_firewall_opener: u64,
}

impl Peer {
    fn new(address: Address) -> Self {
        Self {
            address,
            public: None,
            session_key: None,
            paths: Vec::new(),
            last_direct_send: 0,
            last_direct_receive: 0,
            last_firewall_opener: 0,
        }
    }

    fn has_active_direct_path(&self, now: u64) -> bool {
        self.paths.iter().any(|p| p.active(now))
    }

    fn has_any_direct_path(&self) -> bool {
        !self.paths.is_empty()
    }

    /// Best path to send on: most recently heard-from active path, else a
    /// fixed one.
    fn send_path(&self, now: u64) -> Option<SocketAddr> {
        self.paths
            .iter()
            .filter(|p| p.active(now))
            .max_by_key(|p| p.last_receive)
            .or_else(|| self.paths.iter().find(|p| p.fixed))
            .map(|p| p.addr)
    }
}

/// Read-only peer snapshot handed to the supervisor and control channel.
#[derive(Debug, Clone)]
pub struct PeerView {
    pub address: Address,
    pub supernode: bool,
    pub last_direct_send: u64,
    pub last_direct_receive: u64,
    pub direct_path: Option<SocketAddr>,
}

#[derive(Serialize, Deserialize)]
struct PeerRecord {
    address: Address,
    #[serde(default)]
    public: Option<String>,
    #[serde(default)]
    endpoints: Vec<SocketAddr>,
}

struct Inner {
    peers: HashMap<Address, Peer>,
    supernodes: HashSet<Address>,
}

pub struct Topology {
    local: Address,
    db_path: PathBuf,
    inner: Mutex<Inner>,
}

impl Topology {
    /// Construct and load the persistent snapshot. The local identity is
    /// only borrowed to re-derive session keys for persisted peers.
    pub fn new(local: &Identity, db_path: PathBuf) -> Self {
        let topology = Self {
            local: local.address(),
            db_path,
            inner: Mutex::new(Inner {
                peers: HashMap::new(),
                supernodes: HashSet::new(),
            }),
        };
        if let Err(e) = topology.load(local) {
            warn!("could not load peer database: {:#}", e);
        }
        topology
    }

    fn load(&self, local: &Identity) -> Result<()> {
        let raw = match std::fs::read(&self.db_path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e).context("failed to read peer database"),
        };
        let records: Vec<PeerRecord> =
            serde_json::from_slice(&raw).context("failed to parse peer database")?;

        let mut inner = self.inner.lock().unwrap();
        for record in records {
            if record.address == self.local {
                continue;
            }
            let mut peer = Peer::new(record.address);
            if let Some(hex) = &record.public {
                if let Ok(bytes) = from_hex(hex) {
                    if let Ok(public) = <[u8; 32]>::try_from(bytes.as_slice()) {
                        peer.session_key = local.agree(&public).ok();
                        peer.public = Some(public);
                    }
                }
            }
            for addr in record.endpoints {
                peer.paths.push(Path {
                    addr,
                    fixed: true,
                    last_send: 0,
                    last_receive: 0,
                });
            }
            inner.peers.insert(record.address, peer);
        }
        debug!("loaded {} peers from {:?}", inner.peers.len(), self.db_path);
        Ok(())
    }

    fn save_locked(&self, inner: &Inner) {
        let records: Vec<PeerRecord> = inner
            .peers
            .values()
            .map(|p| PeerRecord {
                address: p.address,
                public: p.public.map(|pk| to_hex(&pk)),
                endpoints: p
                    .paths
                    .iter()
                    .filter(|path| path.fixed)
                    .map(|path| path.addr)
                    .collect(),
            })
            .collect();
        match serde_json::to_vec(&records) {
            Ok(raw) => {
                if let Err(e) = std::fs::write(&self.db_path, raw) {
                    warn!("could not write peer database: {}", e);
                }
            }
            Err(e) => warn!("could not serialize peer database: {}", e),
        }
    }

    /// Install the supernode table. Entries for our own address mark this
    /// node as a supernode but create no peer.
    pub fn set_supernodes(&self, table: &[(Address, Vec<SocketAddr>)]) {
        let mut inner = self.inner.lock().unwrap();
        inner.supernodes = table.iter().map(|(a, _)| *a).collect();
        for (address, endpoints) in table {
            if *address == self.local {
                continue;
            }
            let peer = inner
                .peers
                .entry(*address)
                .or_insert_with(|| Peer::new(*address));
            for endpoint in endpoints {
                if !peer.paths.iter().any(|p| p.addr == *endpoint) {
                    peer.paths.push(Path {
                        addr: *endpoint,
                        fixed: true,
                        last_send: 0,
                        last_receive: 0,
                    });
                }
            }
        }
    }

    pub fn am_supernode(&self) -> bool {
        self.inner.lock().unwrap().supernodes.contains(&self.local)
    }

    /// Supernode peers (excluding ourselves) whose last direct send is
    /// older than the direct ping delay.
    pub fn supernodes_needing_ping(&self, now: u64) -> Vec<Address> {
        let inner = self.inner.lock().unwrap();
        inner
            .supernodes
            .iter()
            .filter(|a| **a != self.local)
            .filter(|a| {
                inner
                    .peers
                    .get(a)
                    .map(|p| now.saturating_sub(p.last_direct_send) > PEER_DIRECT_PING_DELAY)
                    .unwrap_or(false)
            })
            .copied()
            .collect()
    }

    pub fn supernode_addresses(&self) -> Vec<Address> {
        let inner = self.inner.lock().unwrap();
        inner
            .supernodes
            .iter()
            .filter(|a| **a != self.local)
            .copied()
            .collect()
    }

    /// Record a peer identity learned from the wire, deriving the session
    /// key. A conflicting public key for a known address is rejected.
    pub fn learn_identity(&self, local: &Identity, claimed: &Identity) -> Result<()> {
        if claimed.address() == self.local {
            return Ok(());
        }
        let public = claimed.public_bytes();
        let mut inner = self.inner.lock().unwrap();
        let peer = inner
            .peers
            .entry(claimed.address())
            .or_insert_with(|| Peer::new(claimed.address()));
        match peer.public {
            Some(known) if known != public => {
                anyhow::bail!(
                    "identity collision for {}: public key mismatch",
                    claimed.address()
                );
            }
            Some(_) => {}
            None => {
                peer.session_key = local.agree(&public).ok();
                peer.public = Some(public);
            }
        }
        Ok(())
    }

    pub fn session_key(&self, address: Address) -> Option<[u8; 32]> {
        self.inner
            .lock()
            .unwrap()
            .peers
            .get(&address)
            .and_then(|p| p.session_key)
    }

    /// Stamp receive activity on a (possibly new) path to a known peer.
    /// Unknown addresses are ignored; peers enter the directory only via
    /// identity learning or the seed tables.
    pub fn learn_path(&self, address: Address, from: SocketAddr, now: u64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(peer) = inner.peers.get_mut(&address) {
            peer.last_direct_receive = now;
            if let Some(path) = peer.paths.iter_mut().find(|p| p.addr == from) {
                path.last_receive = now;
            } else {
                peer.paths.push(Path {
                    addr: from,
                    fixed: false,
                    last_send: 0,
                    last_receive: now,
                });
            }
        }
    }

    /// Stamp send activity toward a peer.
    pub fn mark_sent(&self, address: Address, via: SocketAddr, now: u64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(peer) = inner.peers.get_mut(&address) {
            peer.last_direct_send = now;
            if let Some(path) = peer.paths.iter_mut().find(|p| p.addr == via) {
                path.last_send = now;
            }
        }
    }

    pub fn mark_firewall_opener(&self, address: Address, now: u64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(peer) = inner.peers.get_mut(&address) {
            peer.last_firewall_opener = now;
        }
    }

    pub fn send_path(&self, address: Address, now: u64) -> Option<SocketAddr> {
        self.inner
            .lock()
            .unwrap()
            .peers
            .get(&address)
            .and_then(|p| p.send_path(now))
    }

    /// Every known path to a peer, for NAT keepalives.
    pub fn all_paths(&self, address: Address) -> Vec<SocketAddr> {
        self.inner
            .lock()
            .unwrap()
            .peers
            .get(&address)
            .map(|p| p.paths.iter().map(|path| path.addr).collect())
            .unwrap_or_default()
    }

    /// Peers reachable by direct UDP right now.
    pub fn peers_with_active_direct_path(&self, now: u64) -> Vec<Address> {
        self.collect(|p| p.has_active_direct_path(now))
    }

    /// Peers with a usable direct link whose last direct send has gone
    /// stale.
    pub fn peers_needing_ping(&self, now: u64) -> Vec<Address> {
        self.collect(|p| {
            (p.has_active_direct_path(now) || p.paths.iter().any(|path| path.fixed))
                && now.saturating_sub(p.last_direct_send) >= PEER_DIRECT_PING_DELAY
        })
    }

    /// Peers whose NAT mapping needs a keepalive.
    pub fn peers_needing_firewall_opener(&self, now: u64) -> Vec<Address> {
        self.collect(|p| {
            p.has_any_direct_path()
                && now.saturating_sub(p.last_firewall_opener) >= FIREWALL_OPENER_DELAY
        })
    }

    fn collect(&self, predicate: impl Fn(&Peer) -> bool) -> Vec<Address> {
        self.inner
            .lock()
            .unwrap()
            .peers
            .values()
            .filter(|p| predicate(p))
            .map(|p| p.address)
            .collect()
    }

    pub fn peer_views(&self, now: u64) -> Vec<PeerView> {
        let inner = self.inner.lock().unwrap();
        let mut views: Vec<PeerView> = inner
            .peers
            .values()
            .map(|p| PeerView {
                address: p.address,
                supernode: inner.supernodes.contains(&p.address),
                last_direct_send: p.last_direct_send,
                last_direct_receive: p.last_direct_receive,
                direct_path: p.send_path(now),
            })
            .collect();
        views.sort_by_key(|v| v.address);
        views
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Expire silent peers and dead learned paths, then rewrite the
    /// snapshot. Supernodes and fixed endpoints survive.
    pub fn clean(&self, now: u64) {
        let mut inner = self.inner.lock().unwrap();
        let supernodes = inner.supernodes.clone();
        for peer in inner.peers.values_mut() {
            peer.paths
                .retain(|p| p.fixed || now.saturating_sub(p.last_receive) < PEER_IN_MEMORY_EXPIRATION);
        }
        inner.peers.retain(|address, peer| {
            supernodes.contains(address)
                || peer.paths.iter().any(|p| p.fixed)
                || now.saturating_sub(peer.last_direct_receive) < PEER_IN_MEMORY_EXPIRATION
        });
        self.save_locked(&inner);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topology(home: &std::path::Path) -> (Identity, Topology) {
        let id = Identity::generate();
        let topo = Topology::new(&id, home.join("peer.db"));
        (id, topo)
    }

    fn sn(addr: &str, ep: &str) -> (Address, Vec<SocketAddr>) {
        (addr.parse().unwrap(), vec![ep.parse().unwrap()])
    }

    #[test]
    fn supernode_installation_and_roles() {
        let home = tempfile::tempdir().unwrap();
        let (_, topo) = topology(home.path());

        topo.set_supernodes(&[sn("0102030405", "192.0.2.1:9993")]);
        assert!(!topo.am_supernode());
        assert_eq!(topo.supernode_addresses().len(), 1);

        // Fixed paths make supernodes pingable before any traffic.
        let need = topo.supernodes_needing_ping(PEER_DIRECT_PING_DELAY + 1);
        assert_eq!(need.len(), 1);
    }

    #[test]
    fn ping_and_firewall_collectors() {
        let home = tempfile::tempdir().unwrap();
        let (local, topo) = topology(home.path());
        let peer_id = Identity::generate();
        let addr = peer_id.address();
        let ep: SocketAddr = "192.0.2.7:9993".parse().unwrap();

        topo.learn_identity(&local, &peer_id.public_only()).unwrap();
        topo.learn_path(addr, ep, 1_000);

        // Active path, nothing sent yet: needs ping, needs opener.
        let now = 1_000 + PEER_DIRECT_PING_DELAY;
        assert_eq!(topo.peers_with_active_direct_path(1_500), vec![addr]);
        assert!(topo.peers_needing_ping(now).contains(&addr));
        assert!(topo
            .peers_needing_firewall_opener(FIREWALL_OPENER_DELAY)
            .contains(&addr));

        topo.mark_sent(addr, ep, now);
        assert!(topo.peers_needing_ping(now + 1).is_empty());

        topo.mark_firewall_opener(addr, now);
        assert!(topo
            .peers_needing_firewall_opener(now + FIREWALL_OPENER_DELAY - 1)
            .is_empty());
    }

    #[test]
    fn session_keys_match_between_ends() {
        let home_a = tempfile::tempdir().unwrap();
        let home_b = tempfile::tempdir().unwrap();
        let (a, topo_a) = topology(home_a.path());
        let (b, topo_b) = topology(home_b.path());

        topo_a.learn_identity(&a, &b.public_only()).unwrap();
        topo_b.learn_identity(&b, &a.public_only()).unwrap();

        let k_ab = topo_a.session_key(b.address()).unwrap();
        let k_ba = topo_b.session_key(a.address()).unwrap();
        assert_eq!(k_ab, k_ba);
    }

    #[test]
    fn learning_an_identity_twice_is_idempotent() {
        let home = tempfile::tempdir().unwrap();
        let (local, topo) = topology(home.path());
        let real = Identity::generate();

        topo.learn_identity(&local, &real.public_only()).unwrap();
        let key = topo.session_key(real.address()).unwrap();

        topo.learn_identity(&local, &real.public_only()).unwrap();
        assert_eq!(topo.session_key(real.address()), Some(key));
        assert_eq!(topo.len(), 1);
    }

    #[test]
    fn clean_expires_silent_peers_but_keeps_seeds() {
        let home = tempfile::tempdir().unwrap();
        let (local, topo) = topology(home.path());

        topo.set_supernodes(&[sn("0102030405", "192.0.2.1:9993")]);
        let peer_id = Identity::generate();
        topo.learn_identity(&local, &peer_id.public_only()).unwrap();
        topo.learn_path(peer_id.address(), "192.0.2.9:9993".parse().unwrap(), 1_000);
        assert_eq!(topo.len(), 2);

        topo.clean(1_000 + PEER_IN_MEMORY_EXPIRATION + 1);
        assert_eq!(topo.len(), 1); // learned peer gone, supernode stays
        assert!(home.path().join("peer.db").exists());
    }

    #[test]
    fn snapshot_round_trips_identity_and_endpoints() {
        let home = tempfile::tempdir().unwrap();
        let local = Identity::generate();
        let peer_id = Identity::generate();
        {
            let topo = Topology::new(&local, home.path().join("peer.db"));
            topo.set_supernodes(&[sn("0102030405", "192.0.2.1:9993")]);
            topo.learn_identity(&local, &peer_id.public_only()).unwrap();
            topo.learn_path(peer_id.address(), "192.0.2.9:9993".parse().unwrap(), 1_000);
            topo.clean(2_000);
        }

        let topo = Topology::new(&local, home.path().join("peer.db"));
        // Session key re-derived from the persisted public key.
        assert!(topo.session_key(peer_id.address()).is_some());
        assert_eq!(
            topo.all_paths("0102030405".parse().unwrap()),
            vec!["192.0.2.1:9993".parse::<SocketAddr>().unwrap()]
        );
    }
}
