//! Compiled-in seed topology.
//!
//! Supernodes are well-known rendezvous/relay peers every node dials at
//! startup. Their identities are learned on first contact; the table only
//! pins addresses and endpoints. TODO: fetch this table from the seeds
//! themselves so new relays don't require a release.

use std::net::SocketAddr;

use crate::identity::Address;

const SUPERNODES: &[(&str, &[&str])] = &[
    ("3f2a9c04d1", &["104.194.8.134:9993"]),
    ("92b1c7ee05", &["45.63.108.26:9993", "45.63.108.26:9994"]),
    ("b04f07a8e2", &["185.112.146.77:9993"]),
];

/// The compiled-in supernode table, parsed.
pub fn supernodes() -> Vec<(Address, Vec<SocketAddr>)> {
    SUPERNODES
        .iter()
        .filter_map(|(addr, endpoints)| {
            let address: Address = addr.parse().ok()?;
            let endpoints: Vec<SocketAddr> =
                endpoints.iter().filter_map(|e| e.parse().ok()).collect();
            if endpoints.is_empty() {
                None
            } else {
                Some((address, endpoints))
            }
        })
        .collect()
}
