//! Wire protocol engine.
//!
//! Builds and parses verb packets, answers inbound traffic, and keeps the
//! retry queue for sends whose destination has no usable path yet. HELLO
//! and OK(HELLO) are the identity-establishing pair and travel unarmored;
//! every other verb requires an agreed session key.

use log::{debug, info, warn};
use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Mutex;

use crate::constants::{
    MAX_UDP_PAYLOAD, MIN_SERVICE_LOOP_INTERVAL, PROTOCOL_VERSION, SEND_RETRY_ATTEMPTS,
    SEND_RETRY_DELAY,
};
use crate::identity::Identity;
use crate::multicast::MulticastGroup;
use crate::netconf;
use crate::node::{Runtime, VERSION_MAJOR, VERSION_MINOR, VERSION_REVISION};
use crate::packet::{ErrorCode, Packet, Reader, Verb, HEADER_LENGTH};
use crate::time::now_ms;

struct Deferred {
    packet: Packet,
    encrypt: bool,
    next_attempt: u64,
    attempts: u32,
}

pub struct Switch {
    retry: Mutex<VecDeque<Deferred>>,
}

impl Switch {
    pub fn new() -> Self {
        Self {
            retry: Mutex::new(VecDeque::new()),
        }
    }

    /// Announce ourselves to a peer: protocol and node version, timestamp,
    /// and our full public identity.
    pub async fn send_hello(&self, env: &Runtime, dest: crate::identity::Address) {
        let now = now_ms();
        let mut outp = Packet::new(
            dest,
            env.identity.address(),
            Verb::Hello,
            env.prng.next_packet_id(),
        );
        outp.append_u8(PROTOCOL_VERSION);
        outp.append_u8(VERSION_MAJOR);
        outp.append_u8(VERSION_MINOR);
        outp.append_u16(VERSION_REVISION);
        outp.append_u64(now);
        append_identity(&mut outp, &env.identity);

        match env.topology.send_path(dest, now) {
            Some(path) => {
                if env.demarc.send(path, outp.as_bytes()).await {
                    env.topology.mark_sent(dest, path, now);
                }
            }
            None => debug!("no path to {} for HELLO, dropping", dest),
        }
    }

    /// Send a packet, armoring it when a session key exists. Packets with
    /// no usable path are parked on the retry queue.
    pub async fn send(&self, env: &Runtime, mut packet: Packet, encrypt: bool) {
        let dest = packet.destination();
        let now = now_ms();
        if encrypt {
            if let Some(key) = env.topology.session_key(dest) {
                packet.armor(&key);
            }
        }
        match env.topology.send_path(dest, now) {
            Some(path) => {
                if env.demarc.send(path, packet.as_bytes()).await {
                    env.topology.mark_sent(dest, path, now);
                }
            }
            None => {
                debug!("no path to {}, deferring {:?}", dest, packet.verb());
                self.retry.lock().unwrap().push_back(Deferred {
                    packet,
                    encrypt,
                    next_attempt: now + SEND_RETRY_DELAY,
                    attempts: 0,
                });
            }
        }
    }

    /// A tiny datagram to every known path of a peer, purely to refresh
    /// NAT translation state.
    pub async fn send_firewall_opener(&self, env: &Runtime, dest: crate::identity::Address) {
        let now = now_ms();
        let junk = [env.prng.next_u32() as u8];
        for path in env.topology.all_paths(dest) {
            env.demarc.send(path, &junk).await;
        }
        env.topology.mark_firewall_opener(dest, now);
    }

    /// MULTICAST_LIKE batches for the given per-network group sets, sent to
    /// every supernode and every peer with a live direct path.
    pub async fn announce_multicast_groups(
        &self,
        env: &Runtime,
        announce: &[(u64, HashSet<MulticastGroup>)],
    ) {
        let now = now_ms();
        let mut dests: Vec<crate::identity::Address> = env.topology.supernode_addresses();
        for addr in env.topology.peers_with_active_direct_path(now) {
            if !dests.contains(&addr) {
                dests.push(addr);
            }
        }
        if dests.is_empty() {
            return;
        }

        // Flatten to (network, group) entries, 18 bytes each on the wire.
        let mut entries: Vec<(u64, MulticastGroup)> = Vec::new();
        for (network_id, groups) in announce {
            for group in groups {
                entries.push((*network_id, *group));
            }
        }
        if entries.is_empty() {
            return;
        }

        let per_packet = (MAX_UDP_PAYLOAD - HEADER_LENGTH) / 18;
        for dest in dests {
            for chunk in entries.chunks(per_packet) {
                let mut outp = Packet::new(
                    dest,
                    env.identity.address(),
                    Verb::MulticastLike,
                    env.prng.next_packet_id(),
                );
                for (network_id, group) in chunk {
                    outp.append_u64(*network_id);
                    outp.append_bytes(&group.mac);
                    outp.append_u32(group.adi);
                }
                self.send(env, outp, true).await;
            }
        }
    }

    /// Drain the retry queue and suggest how long the supervisor may sleep
    /// before calling again.
    pub async fn do_timer_tasks(&self, env: &Runtime) -> u64 {
        let now = now_ms();

        let due: Vec<Deferred> = {
            let mut retry = self.retry.lock().unwrap();
            let mut due = Vec::new();
            let mut keep = VecDeque::new();
            while let Some(entry) = retry.pop_front() {
                if entry.next_attempt <= now {
                    due.push(entry);
                } else {
                    keep.push_back(entry);
                }
            }
            *retry = keep;
            due
        };

        for mut entry in due {
            let dest = entry.packet.destination();
            match env.topology.send_path(dest, now) {
                Some(path) => {
                    if entry.encrypt && entry.packet.is_unarmored() {
                        if let Some(key) = env.topology.session_key(dest) {
                            entry.packet.armor(&key);
                        }
                    }
                    if env.demarc.send(path, entry.packet.as_bytes()).await {
                        env.topology.mark_sent(dest, path, now);
                        continue;
                    }
                    self.requeue(entry, now);
                }
                None => self.requeue(entry, now),
            }
        }

        let retry = self.retry.lock().unwrap();
        retry
            .iter()
            .map(|e| e.next_attempt.saturating_sub(now).max(1))
            .min()
            .unwrap_or(MIN_SERVICE_LOOP_INTERVAL)
    }

    fn requeue(&self, mut entry: Deferred, now: u64) {
        entry.attempts += 1;
        if entry.attempts >= SEND_RETRY_ATTEMPTS {
            debug!(
                "dropping {:?} to {} after {} attempts",
                entry.packet.verb(),
                entry.packet.destination(),
                entry.attempts
            );
            return;
        }
        entry.next_attempt = now + SEND_RETRY_DELAY;
        self.retry.lock().unwrap().push_back(entry);
    }

    pub fn pending_sends(&self) -> usize {
        self.retry.lock().unwrap().len()
    }

    /// Entry point for every datagram the demarcation point receives.
    pub async fn on_remote_packet(
        &self,
        env: &Runtime,
        _local_port: u16,
        source: SocketAddr,
        data: &[u8],
    ) {
        if data.len() < HEADER_LENGTH {
            return; // firewall openers and other line noise
        }
        let packet = match Packet::parse(data) {
            Ok(p) => p,
            Err(e) => {
                debug!("undecodable packet from {}: {:#}", source, e);
                return;
            }
        };
        if packet.destination() != env.identity.address() {
            debug!(
                "packet from {} addressed to {}, not us; relaying is not ours to do",
                source,
                packet.destination()
            );
            return;
        }

        let verb = packet.verb();
        let sender = packet.source();

        // HELLO and OK establish identity; everything else must carry a
        // valid tag under the agreed key.
        if !matches!(verb, Verb::Hello | Verb::Ok) {
            match env.topology.session_key(sender) {
                Some(key) if packet.dearmor(&key) => {}
                Some(_) => {
                    debug!("bad auth tag on {:?} from {}", verb, sender);
                    return;
                }
                None => {
                    debug!("{:?} from unknown peer {}, dropping", verb, sender);
                    return;
                }
            }
        }

        let now = now_ms();
        env.topology.learn_path(sender, source, now);

        let result = match verb {
            Verb::Hello => self.handle_hello(env, &packet, source).await,
            Verb::Ok => self.handle_ok(env, &packet, source).await,
            Verb::Error => handle_error(&packet),
            Verb::MulticastLike => handle_multicast_like(env, &packet, now),
            Verb::NetworkConfigRequest => self.handle_netconf_request(env, &packet).await,
            Verb::Nop | Verb::Whois | Verb::Rendezvous | Verb::Frame | Verb::MulticastFrame => {
                debug!("ignoring {:?} from {}", verb, sender);
                Ok(())
            }
        };
        if let Err(e) = result {
            debug!("dropping {:?} from {}: {:#}", verb, sender, e);
        }
    }

    async fn handle_hello(
        &self,
        env: &Runtime,
        packet: &Packet,
        source: SocketAddr,
    ) -> anyhow::Result<()> {
        let mut r = Reader::new(packet.payload());
        let protocol = r.u8()?;
        let _major = r.u8()?;
        let _minor = r.u8()?;
        let _revision = r.u16()?;
        let timestamp = r.u64()?;
        let claimed = read_identity(&mut r)?;

        if claimed.address() != packet.source() {
            anyhow::bail!("HELLO identity does not match packet source");
        }

        if protocol != PROTOCOL_VERSION {
            let mut outp = Packet::new(
                packet.source(),
                env.identity.address(),
                Verb::Error,
                env.prng.next_packet_id(),
            );
            outp.append_u8(Verb::Hello as u8);
            outp.append_u64(packet.packet_id());
            outp.append_u8(ErrorCode::BadProtocolVersion as u8);
            self.send(env, outp, false).await;
            return Ok(());
        }

        env.topology.learn_identity(&env.identity, &claimed)?;
        env.topology.learn_path(claimed.address(), source, now_ms());
        debug!("HELLO from {} at {}", claimed.address(), source);

        let mut outp = Packet::new(
            packet.source(),
            env.identity.address(),
            Verb::Ok,
            env.prng.next_packet_id(),
        );
        outp.append_u8(Verb::Hello as u8);
        outp.append_u64(packet.packet_id());
        outp.append_u64(timestamp);
        outp.append_u8(PROTOCOL_VERSION);
        outp.append_u8(VERSION_MAJOR);
        outp.append_u8(VERSION_MINOR);
        outp.append_u16(VERSION_REVISION);
        append_identity(&mut outp, &env.identity);
        self.send(env, outp, false).await;
        Ok(())
    }

    async fn handle_ok(
        &self,
        env: &Runtime,
        packet: &Packet,
        source: SocketAddr,
    ) -> anyhow::Result<()> {
        let mut r = Reader::new(packet.payload());
        let in_re_verb = r.u8()?;
        let _in_re_packet_id = r.u64()?;

        if in_re_verb == Verb::Hello as u8 {
            let _timestamp_echo = r.u64()?;
            let _protocol = r.u8()?;
            let _major = r.u8()?;
            let _minor = r.u8()?;
            let _revision = r.u16()?;
            let claimed = read_identity(&mut r)?;
            if claimed.address() != packet.source() {
                anyhow::bail!("OK(HELLO) identity does not match packet source");
            }
            env.topology.learn_identity(&env.identity, &claimed)?;
            env.topology.learn_path(claimed.address(), source, now_ms());
            debug!("OK(HELLO) from {} at {}", claimed.address(), source);
        }
        Ok(())
    }

    async fn handle_netconf_request(&self, env: &Runtime, packet: &Packet) -> anyhow::Result<()> {
        let mut r = Reader::new(packet.payload());
        let network_id = r.u64()?;
        let meta_len = r.u16()? as usize;
        let metadata = r.take(meta_len)?;

        match env.netconf.get() {
            Some(service) => {
                let msg =
                    netconf::request_message(packet.source(), network_id, packet.packet_id(), metadata);
                if let Err(e) = service.send(&msg).await {
                    warn!("could not forward network config request: {:#}", e);
                }
            }
            None => {
                let mut outp = Packet::new(
                    packet.source(),
                    env.identity.address(),
                    Verb::Error,
                    env.prng.next_packet_id(),
                );
                outp.append_u8(Verb::NetworkConfigRequest as u8);
                outp.append_u64(packet.packet_id());
                outp.append_u8(ErrorCode::UnsupportedOperation as u8);
                outp.append_u64(network_id);
                self.send(env, outp, true).await;
            }
        }
        Ok(())
    }
}

impl Default for Switch {
    fn default() -> Self {
        Self::new()
    }
}

fn handle_error(packet: &Packet) -> anyhow::Result<()> {
    let mut r = Reader::new(packet.payload());
    let in_re_verb = r.u8()?;
    let _in_re_packet_id = r.u64()?;
    let code = r.u8()?;
    info!(
        "ERROR {:?} in reply to verb 0x{:02x} from {}",
        ErrorCode::from_u8(code),
        in_re_verb,
        packet.source()
    );
    Ok(())
}

fn handle_multicast_like(env: &Runtime, packet: &Packet, now: u64) -> anyhow::Result<()> {
    let mut r = Reader::new(packet.payload());
    while r.remaining() >= 18 {
        let network_id = r.u64()?;
        let mac: [u8; 6] = r.take(6)?.try_into().unwrap();
        let adi = r.u32()?;
        env.multicaster
            .add_like(network_id, MulticastGroup::new(mac, adi), packet.source(), now);
    }
    Ok(())
}

fn append_identity(packet: &mut Packet, identity: &Identity) {
    let serialized = identity.serialize(false);
    packet.append_u16(serialized.len() as u16);
    packet.append_bytes(serialized.as_bytes());
}

fn read_identity(r: &mut Reader<'_>) -> anyhow::Result<Identity> {
    let len = r.u16()? as usize;
    let raw = std::str::from_utf8(r.take(len)?)?;
    raw.parse()
}
