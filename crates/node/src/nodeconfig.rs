//! Local control channel and the joined-network registry.
//!
//! The control server binds a well-known loopback UDP port; holding that
//! bind is what enforces one node per home directory. Packets are
//! authenticated with a key derived from `authtoken.secret`, so any local
//! process that can read the token can drive the node.
//!
//! Control packet layout:
//!
//! ```text
//! [0..16)  truncated HMAC-SHA256 tag over the rest
//! [16..20) conversation ID (big-endian u32, client-chosen, nonzero)
//! [20..]   newline-separated UTF-8 lines (a command, or response lines)
//! ```

use anyhow::{bail, Context, Result};
use hmac::{Hmac, Mac};
use log::{debug, warn};
use sha2::Sha256;
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use subtle::ConstantTimeEq;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use crate::authtoken::control_key;
use crate::constants::{CONTROL_MAX_PACKET_SIZE, CONTROL_UDP_PORT};
use crate::network::{EthernetTap, Network, NullTap};
use crate::node::{version_string, Runtime};
use crate::time::now_ms;

const TAG_LENGTH: usize = 16;
const OVERHEAD: usize = TAG_LENGTH + 4;

/// Encode one control message, splitting across packets when the lines do
/// not fit in one.
pub fn encode_control_message(
    key: &[u8; 32],
    conversation_id: u32,
    lines: &[String],
) -> Result<Vec<Vec<u8>>> {
    let mut packets = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut size = OVERHEAD;

    let flush = |current: &mut Vec<&str>, packets: &mut Vec<Vec<u8>>| {
        packets.push(seal(key, conversation_id, &current.join("\n")));
        current.clear();
    };

    for line in lines {
        if line.contains('\n') {
            bail!("control lines must not contain newlines");
        }
        let need = line.len() + 1;
        if OVERHEAD + line.len() > CONTROL_MAX_PACKET_SIZE {
            bail!("control line of {} bytes does not fit a packet", line.len());
        }
        if size + need > CONTROL_MAX_PACKET_SIZE && !current.is_empty() {
            flush(&mut current, &mut packets);
            size = OVERHEAD;
        }
        current.push(line);
        size += need;
    }
    if !current.is_empty() || packets.is_empty() {
        flush(&mut current, &mut packets);
    }
    Ok(packets)
}

/// Verify and decode one control packet. `None` for anything not
/// authenticated by our key.
pub fn decode_control_message(key: &[u8; 32], data: &[u8]) -> Option<(u32, Vec<String>)> {
    if data.len() < OVERHEAD || data.len() > CONTROL_MAX_PACKET_SIZE {
        return None;
    }
    let expected = tag(key, &data[TAG_LENGTH..]);
    if !bool::from(expected.ct_eq(&data[..TAG_LENGTH])) {
        return None;
    }
    let conversation_id = u32::from_be_bytes(data[TAG_LENGTH..OVERHEAD].try_into().unwrap());
    let payload = &data[OVERHEAD..];
    if payload.is_empty() {
        return Some((conversation_id, Vec::new()));
    }
    let text = std::str::from_utf8(payload).ok()?;
    Some((
        conversation_id,
        text.split('\n').map(str::to_string).collect(),
    ))
}

fn seal(key: &[u8; 32], conversation_id: u32, payload: &str) -> Vec<u8> {
    let mut out = vec![0u8; TAG_LENGTH];
    out.extend_from_slice(&conversation_id.to_be_bytes());
    out.extend_from_slice(payload.as_bytes());
    let t = tag(key, &out[TAG_LENGTH..]);
    out[..TAG_LENGTH].copy_from_slice(&t);
    out
}

fn tag(key: &[u8; 32], data: &[u8]) -> [u8; TAG_LENGTH] {
    let mut mac = Hmac::<Sha256>::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    let full = mac.finalize().into_bytes();
    let mut t = [0u8; TAG_LENGTH];
    t.copy_from_slice(&full[..TAG_LENGTH]);
    t
}

/// Control server plus the registry of joined virtual networks.
pub struct NodeConfig {
    socket: Arc<UdpSocket>,
    key: [u8; 32],
    networks: Mutex<BTreeMap<u64, Arc<Network>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl NodeConfig {
    /// Bind the loopback control port. A failure here almost always means
    /// another node owns this home directory already.
    pub async fn new(auth_token: &str, control_port: u16) -> Result<Self> {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), control_port);
        let socket = UdpSocket::bind(addr)
            .await
            .context("local control UDP port cannot be bound")?;
        Ok(Self {
            socket: Arc::new(socket),
            key: control_key(auth_token),
            networks: Mutex::new(BTreeMap::new()),
            task: Mutex::new(None),
        })
    }

    pub fn control_port(&self) -> u16 {
        self.socket.local_addr().map(|a| a.port()).unwrap_or(0)
    }

    /// Spawn the request-handling task.
    pub fn start(&self, env: Arc<Runtime>) {
        let socket = self.socket.clone();
        let key = self.key;
        let task = tokio::spawn(async move {
            let mut buf = [0u8; CONTROL_MAX_PACKET_SIZE];
            loop {
                let (len, from) = match socket.recv_from(&mut buf).await {
                    Ok(r) => r,
                    Err(e) => {
                        warn!("control socket receive error: {}", e);
                        continue;
                    }
                };
                let (conversation_id, lines) = match decode_control_message(&key, &buf[..len]) {
                    Some(decoded) => decoded,
                    None => {
                        debug!("unauthenticated control packet from {}, dropping", from);
                        continue;
                    }
                };
                let command = lines.first().map(String::as_str).unwrap_or("");
                let responses = env.nodeconfig.execute(&env, command);
                match encode_control_message(&key, conversation_id, &responses) {
                    Ok(packets) => {
                        for packet in packets {
                            if let Err(e) = socket.send_to(&packet, from).await {
                                debug!("control response to {} failed: {}", from, e);
                            }
                        }
                    }
                    Err(e) => warn!("could not encode control response: {:#}", e),
                }
            }
        });
        *self.task.lock().unwrap() = Some(task);
    }

    /// Run one control command, producing response lines.
    pub fn execute(&self, env: &Runtime, command: &str) -> Vec<String> {
        let mut args = command.split_whitespace();
        let verb = args.next().unwrap_or("");
        match verb {
            "info" => vec![format!(
                "200 info {} {} OK",
                env.identity.address(),
                version_string()
            )],
            "listpeers" => {
                let now = now_ms();
                let mut lines = Vec::new();
                for view in env.topology.peer_views(now) {
                    lines.push(format!(
                        "200 listpeers {} {} {} {}",
                        view.address,
                        view.direct_path
                            .map(|p| p.to_string())
                            .unwrap_or_else(|| "-".to_string()),
                        view.last_direct_receive,
                        if view.supernode { "SUPERNODE" } else { "LEAF" }
                    ));
                }
                if lines.is_empty() {
                    lines.push("200 listpeers".to_string());
                }
                lines
            }
            "listnetworks" => {
                let mut lines = Vec::new();
                for network in self.networks() {
                    let groups: Vec<String> = network
                        .multicast_groups()
                        .iter()
                        .map(|g| g.to_string())
                        .collect();
                    lines.push(format!(
                        "200 listnetworks {:016x} {} {}",
                        network.id(),
                        network.device_name(),
                        groups.join(",")
                    ));
                }
                if lines.is_empty() {
                    lines.push("200 listnetworks".to_string());
                }
                lines
            }
            "join" => match args.next().map(parse_network_id) {
                Some(Ok(id)) => {
                    self.join(id);
                    vec![format!("200 join {:016x} OK", id)]
                }
                _ => vec!["400 join invalid network id".to_string()],
            },
            "leave" => match args.next().map(parse_network_id) {
                Some(Ok(id)) => {
                    if self.leave(id) {
                        vec![format!("200 leave {:016x} OK", id)]
                    } else {
                        vec![format!("404 leave {:016x} not a member", id)]
                    }
                }
                _ => vec!["400 leave invalid network id".to_string()],
            },
            "" => vec!["400 no command given".to_string()],
            other => vec![format!("404 {} command not found", other)],
        }
    }

    /// Join a virtual network, creating its tap.
    pub fn join(&self, network_id: u64) -> Arc<Network> {
        self.networks
            .lock()
            .unwrap()
            .entry(network_id)
            .or_insert_with(|| {
                let tap: Box<dyn EthernetTap> = Box::new(NullTap::new(network_id));
                Network::new(network_id, tap)
            })
            .clone()
    }

    pub fn leave(&self, network_id: u64) -> bool {
        self.networks.lock().unwrap().remove(&network_id).is_some()
    }

    pub fn networks(&self) -> Vec<Arc<Network>> {
        self.networks.lock().unwrap().values().cloned().collect()
    }

    pub fn network(&self, network_id: u64) -> Option<Arc<Network>> {
        self.networks.lock().unwrap().get(&network_id).cloned()
    }

    /// Poke every tap to re-apply its OS-side configuration.
    pub fn whack_all_taps(&self) {
        for network in self.networks() {
            network.whack_tap();
        }
    }

    pub fn clean_all_networks(&self) {
        for network in self.networks() {
            network.clean();
        }
    }

    pub fn shutdown(&self) {
        if let Some(task) = self.task.lock().unwrap().take() {
            task.abort();
        }
    }
}

impl Drop for NodeConfig {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn parse_network_id(s: &str) -> Result<u64> {
    u64::from_str_radix(s.trim().trim_start_matches("0x"), 16).context("bad network id")
}

/// Callback invoked once per decoded response line.
pub type ResponseHandler = Box<dyn FnMut(u32, &str) + Send>;

struct ClientInner {
    socket: Arc<UdpSocket>,
    key: [u8; 32],
    dest: SocketAddr,
    // Held while the handler runs; Drop takes it to fence off callbacks
    // during teardown.
    handler: Mutex<ResponseHandler>,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Client side of the control channel, for CLI front-ends.
///
/// If no ephemeral socket can be bound the client silently degrades to a
/// no-op whose `send` returns 0.
pub struct LocalClient {
    inner: Option<Arc<ClientInner>>,
}

impl LocalClient {
    pub async fn new(auth_token: &str, handler: ResponseHandler) -> Self {
        Self::with_port(auth_token, CONTROL_UDP_PORT, handler).await
    }

    /// As `new`, with an explicit server port (tests use ephemeral ones).
    pub async fn with_port(auth_token: &str, control_port: u16, handler: ResponseHandler) -> Self {
        let mut bound = None;
        for _ in 0..5000 {
            let port = 32768 + (rand::random::<u32>() % 20000) as u16;
            let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
            if let Ok(socket) = UdpSocket::bind(addr).await {
                bound = Some(socket);
                break;
            }
        }
        let socket = match bound {
            Some(s) => Arc::new(s),
            None => return Self { inner: None },
        };

        let inner = Arc::new(ClientInner {
            socket: socket.clone(),
            key: control_key(auth_token),
            dest: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), control_port),
            handler: Mutex::new(handler),
            task: Mutex::new(None),
        });

        let recv_inner = inner.clone();
        let task = tokio::spawn(async move {
            let mut buf = [0u8; CONTROL_MAX_PACKET_SIZE];
            loop {
                let Ok((len, _from)) = recv_inner.socket.recv_from(&mut buf).await else {
                    break;
                };
                if let Some((conversation_id, lines)) =
                    decode_control_message(&recv_inner.key, &buf[..len])
                {
                    let mut handler = recv_inner.handler.lock().unwrap();
                    for line in lines {
                        handler(conversation_id, &line);
                    }
                }
            }
        });
        *inner.task.lock().unwrap() = Some(task);

        Self { inner: Some(inner) }
    }

    /// Send a command. Returns the conversation ID responses will carry,
    /// or 0 when the client is in its no-op state or the send failed.
    pub async fn send(&self, command: &str) -> u32 {
        let Some(inner) = &self.inner else {
            return 0;
        };
        let conversation_id = loop {
            let id: u32 = rand::random();
            if id != 0 {
                break id;
            }
        };
        let packets =
            match encode_control_message(&inner.key, conversation_id, &[command.to_string()]) {
                Ok(p) => p,
                Err(_) => return 0,
            };
        for packet in packets {
            if inner.socket.send_to(&packet, inner.dest).await.is_err() {
                return 0;
            }
        }
        conversation_id
    }
}

impl Drop for LocalClient {
    fn drop(&mut self) {
        if let Some(inner) = &self.inner {
            if let Some(task) = inner.task.lock().unwrap().take() {
                task.abort();
            }
            // Wait out any in-flight callback before the handler drops.
            drop(inner.handler.lock().unwrap());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_codec_round_trip() {
        let key = control_key("secret-token");
        let lines = vec!["200 info abc".to_string(), "200 info done".to_string()];
        let packets = encode_control_message(&key, 77, &lines).unwrap();
        assert_eq!(packets.len(), 1);

        let (conversation_id, decoded) = decode_control_message(&key, &packets[0]).unwrap();
        assert_eq!(conversation_id, 77);
        assert_eq!(decoded, lines);
    }

    #[test]
    fn wrong_key_is_rejected() {
        let key = control_key("token-a");
        let packets =
            encode_control_message(&key, 1, &["listnetworks".to_string()]).unwrap();
        let other = control_key("token-b");
        assert!(decode_control_message(&other, &packets[0]).is_none());
        assert!(decode_control_message(&key, &packets[0][..10]).is_none());
    }

    #[test]
    fn long_responses_split_across_packets() {
        let key = control_key("t");
        let lines: Vec<String> = (0..200)
            .map(|i| format!("200 listpeers {:060}", i))
            .collect();
        let packets = encode_control_message(&key, 9, &lines).unwrap();
        assert!(packets.len() > 1);
        for p in &packets {
            assert!(p.len() <= CONTROL_MAX_PACKET_SIZE);
        }

        let mut all = Vec::new();
        for p in &packets {
            let (conversation_id, decoded) = decode_control_message(&key, p).unwrap();
            assert_eq!(conversation_id, 9);
            all.extend(decoded);
        }
        assert_eq!(all, lines);
    }

    #[test]
    fn zero_lines_still_encode_to_one_packet() {
        let key = control_key("t");
        let packets = encode_control_message(&key, 5, &[]).unwrap();
        assert_eq!(packets.len(), 1);
        let (conversation_id, decoded) = decode_control_message(&key, &packets[0]).unwrap();
        assert_eq!(conversation_id, 5);
        assert!(decoded.is_empty());
    }

    #[tokio::test]
    async fn single_instance_guard_on_same_port() {
        let first = NodeConfig::new("tok", 0).await.unwrap();
        let port = first.control_port();
        assert!(NodeConfig::new("tok", port).await.is_err());
    }
}
