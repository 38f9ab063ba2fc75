//! Host network environment watcher.
//!
//! Reduces the set of (interface, address) pairs to a single u64. The
//! supervisor polls this every few seconds; a changed value means the host
//! moved networks, gained or lost an address, or woke up somewhere else,
//! and every peer relationship needs a resync. XOR-folding per-entry hashes
//! makes the value independent of enumeration order.

use sha2::{Digest, Sha256};

pub struct SysEnv;

impl SysEnv {
    pub fn new() -> Self {
        SysEnv
    }

    /// Fingerprint of the current interface/address state. Loopback and
    /// link-local addresses are excluded; they churn without meaning a real
    /// environment change.
    pub fn network_configuration_fingerprint(&self) -> u64 {
        let mut fp = 0x9e3779b97f4a7c15u64; // nonzero basis so "no interfaces" is distinct from failure
        for entry in interface_addresses() {
            let digest = Sha256::digest(entry.as_bytes());
            fp ^= u64::from_be_bytes(digest[..8].try_into().unwrap());
        }
        fp
    }
}

impl Default for SysEnv {
    fn default() -> Self {
        Self::new()
    }
}

/// Enumerate `"ifname/address"` strings for all global unicast addresses.
#[cfg(unix)]
fn interface_addresses() -> Vec<String> {
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

    let mut result = Vec::new();

    unsafe {
        let mut ifaddrs: *mut libc::ifaddrs = std::ptr::null_mut();
        if libc::getifaddrs(&mut ifaddrs) != 0 {
            return result;
        }

        let mut current = ifaddrs;
        while !current.is_null() {
            let ifa = &*current;
            current = ifa.ifa_next;

            if ifa.ifa_addr.is_null() {
                continue;
            }

            let name = match std::ffi::CStr::from_ptr(ifa.ifa_name).to_str() {
                Ok(s) => s.to_string(),
                Err(_) => continue,
            };

            let ip: IpAddr = match (*ifa.ifa_addr).sa_family as i32 {
                libc::AF_INET => {
                    let sa = ifa.ifa_addr as *const libc::sockaddr_in;
                    IpAddr::V4(Ipv4Addr::from(u32::from_be((*sa).sin_addr.s_addr)))
                }
                libc::AF_INET6 => {
                    let sa = ifa.ifa_addr as *const libc::sockaddr_in6;
                    IpAddr::V6(Ipv6Addr::from((*sa).sin6_addr.s6_addr))
                }
                _ => continue,
            };

            if ip.is_loopback() || ip.is_unspecified() {
                continue;
            }
            if let IpAddr::V6(v6) = ip {
                let octets = v6.octets();
                if octets[0] == 0xfe && (octets[1] & 0xc0) == 0x80 {
                    continue; // link-local
                }
            }

            result.push(format!("{}/{}", name, ip));
        }

        libc::freeifaddrs(ifaddrs);
    }

    result
}

#[cfg(not(unix))]
fn interface_addresses() -> Vec<String> {
    Vec::new()
}
