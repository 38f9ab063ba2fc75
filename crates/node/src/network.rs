//! Joined virtual networks.
//!
//! Each network wraps one Ethernet tap device and the multicast groups its
//! tap currently subscribes. The tap driver itself is a platform concern
//! behind the `EthernetTap` trait; this build ships the null backend, with
//! real drivers supplied out of tree.

use log::debug;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::multicast::MulticastGroup;

/// Virtual Ethernet interface owned by one joined network.
pub trait EthernetTap: Send + Sync {
    fn device_name(&self) -> String;

    /// Multicast groups the OS side of the tap has subscribed.
    fn multicast_groups(&self) -> HashSet<MulticastGroup>;

    /// Poke the OS to re-evaluate the tap's configuration (routes,
    /// addresses). Called after the host's network environment changes.
    fn whack(&self);
}

/// Placeholder tap for builds without a platform driver: no subscriptions,
/// whack is a no-op.
pub struct NullTap {
    name: String,
}

impl NullTap {
    pub fn new(network_id: u64) -> Self {
        Self {
            name: format!("weft{:x}", network_id & 0xffff),
        }
    }
}

impl EthernetTap for NullTap {
    fn device_name(&self) -> String {
        self.name.clone()
    }

    fn multicast_groups(&self) -> HashSet<MulticastGroup> {
        HashSet::new()
    }

    fn whack(&self) {}
}

/// One joined virtual network.
pub struct Network {
    id: u64,
    tap: Box<dyn EthernetTap>,
    multicast_groups: Mutex<HashSet<MulticastGroup>>,
}

impl Network {
    pub fn new(id: u64, tap: Box<dyn EthernetTap>) -> Arc<Self> {
        Arc::new(Self {
            id,
            tap,
            multicast_groups: Mutex::new(HashSet::new()),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn device_name(&self) -> String {
        self.tap.device_name()
    }

    /// Refresh the group set from the tap. Returns whether it changed. The
    /// broadcast group is always a member.
    pub fn update_multicast_groups(&self) -> bool {
        let mut fresh = self.tap.multicast_groups();
        fresh.insert(MulticastGroup::broadcast());

        let mut current = self.multicast_groups.lock().unwrap();
        if *current == fresh {
            false
        } else {
            debug!(
                "network {:016x}: multicast groups now {}",
                self.id,
                fresh.len()
            );
            *current = fresh;
            true
        }
    }

    pub fn multicast_groups(&self) -> HashSet<MulticastGroup> {
        self.multicast_groups.lock().unwrap().clone()
    }

    pub fn whack_tap(&self) {
        self.tap.whack();
    }

    /// Periodic housekeeping hook; the null tap has nothing to forget.
    pub fn clean(&self) {}
}

#[cfg(test)]
pub mod test_tap {
    use super::*;

    /// Scriptable tap for tests: groups are set from the outside, whacks
    /// are counted.
    pub struct TestTap {
        pub groups: Mutex<HashSet<MulticastGroup>>,
        pub whacks: std::sync::atomic::AtomicU32,
    }

    impl TestTap {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                groups: Mutex::new(HashSet::new()),
                whacks: std::sync::atomic::AtomicU32::new(0),
            })
        }
    }

    impl EthernetTap for Arc<TestTap> {
        fn device_name(&self) -> String {
            "test0".to_string()
        }

        fn multicast_groups(&self) -> HashSet<MulticastGroup> {
            self.groups.lock().unwrap().clone()
        }

        fn whack(&self) {
            self.whacks
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
    }
}
