//! Multicast group membership tracking.
//!
//! A group is an (Ethernet multicast MAC, ADI) pair. Taps report the groups
//! their network has subscribed; peers advertise membership with
//! MULTICAST_LIKE, which the multicaster records with a timestamp so stale
//! likes age out.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Mutex;

use crate::constants::MULTICAST_LIKE_EXPIRATION;
use crate::identity::Address;

/// (MAC, ADI) pair identifying one multicast group on one virtual network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MulticastGroup {
    pub mac: [u8; 6],
    pub adi: u32,
}

impl MulticastGroup {
    pub fn new(mac: [u8; 6], adi: u32) -> Self {
        Self { mac, adi }
    }

    /// The broadcast group every network implicitly subscribes.
    pub fn broadcast() -> Self {
        Self {
            mac: [0xff; 6],
            adi: 0,
        }
    }
}

impl fmt::Display for MulticastGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}/{}",
            self.mac[0], self.mac[1], self.mac[2], self.mac[3], self.mac[4], self.mac[5], self.adi
        )
    }
}

/// Per-(network, group) membership with like timestamps.
pub struct Multicaster {
    likes: Mutex<HashMap<(u64, MulticastGroup), HashMap<Address, u64>>>,
}

impl Multicaster {
    pub fn new() -> Self {
        Self {
            likes: Mutex::new(HashMap::new()),
        }
    }

    /// Record a LIKE from a peer, renewing its timestamp.
    pub fn add_like(&self, network_id: u64, group: MulticastGroup, member: Address, now: u64) {
        self.likes
            .lock()
            .unwrap()
            .entry((network_id, group))
            .or_default()
            .insert(member, now);
    }

    /// Current members of a group whose likes have not expired.
    pub fn members(&self, network_id: u64, group: MulticastGroup, now: u64) -> HashSet<Address> {
        self.likes
            .lock()
            .unwrap()
            .get(&(network_id, group))
            .map(|m| {
                m.iter()
                    .filter(|(_, &ts)| now.saturating_sub(ts) < MULTICAST_LIKE_EXPIRATION)
                    .map(|(a, _)| *a)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Drop expired likes and empty groups.
    pub fn clean(&self, now: u64) {
        let mut likes = self.likes.lock().unwrap();
        for members in likes.values_mut() {
            members.retain(|_, ts| now.saturating_sub(*ts) < MULTICAST_LIKE_EXPIRATION);
        }
        likes.retain(|_, members| !members.is_empty());
    }
}

impl Default for Multicaster {
    fn default() -> Self {
        Self::new()
    }
}
