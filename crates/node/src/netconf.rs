//! Bridge between NETWORK_CONFIG_REQUEST wire traffic and the external
//! netconf helper service.
//!
//! The node itself is never a network configuration authority. Inbound
//! request verbs are re-framed as dictionaries for the helper; helper
//! responses are re-framed as OK or ERROR wire packets addressed to the
//! requesting peer. Anything malformed is logged and dropped; a broken
//! helper must not be able to wedge the node.

use anyhow::{Context, Result};
use log::{debug, warn};
use std::path::{Path, PathBuf};

use crate::constants::NETCONF_MAX_PAYLOAD;
use crate::identity::Address;
use crate::packet::{ErrorCode, Packet, Verb};
use crate::node::Runtime;
use crate::service::Dictionary;

/// Well-known helper location under the home directory. Its presence at
/// startup is what enables the bridge.
pub fn service_path(home: &Path) -> PathBuf {
    home.join("services.d").join("netconf.service")
}

/// Build the dictionary handed to the helper for one inbound request.
pub fn request_message(
    peer: Address,
    network_id: u64,
    packet_id: u64,
    metadata: &[u8],
) -> Dictionary {
    let mut msg = Dictionary::new();
    msg.set("type", "netconf-request");
    msg.set("peer", &peer.to_string());
    msg.set("nwid", &format!("{:016x}", network_id));
    msg.set("requestId", &format!("{:016x}", packet_id));
    msg.set("metadata", &String::from_utf8_lossy(metadata));
    msg
}

/// Handle one message from the helper. Only `netconf-response` is
/// recognized; everything else is ignored.
pub async fn handle_service_message(env: &Runtime, msg: Dictionary) {
    if msg.get("type") != Some("netconf-response") {
        return;
    }
    if let Err(e) = handle_response(env, &msg).await {
        warn!("dropping netconf response: {:#}", e);
    }
}

async fn handle_response(env: &Runtime, msg: &Dictionary) -> Result<()> {
    let request_id = parse_hex_u64(msg.get("requestId").context("missing requestId")?)
        .context("bad requestId")?;
    let network_id =
        parse_hex_u64(msg.get("nwid").context("missing nwid")?).context("bad nwid")?;
    let peer: Address = msg
        .get("peer")
        .context("missing peer")?
        .parse()
        .context("bad peer address")?;

    // Drop silently when the network or peer is not something we can
    // answer for.
    if env.nodeconfig.network(network_id).is_none() {
        debug!(
            "netconf response for unknown network {:016x}, dropping",
            network_id
        );
        return Ok(());
    }
    if peer.is_reserved() {
        debug!("netconf response with reserved peer address {}, dropping", peer);
        return Ok(());
    }

    if let Some(outp) = build_reply(
        env.identity.address(),
        peer,
        env.prng.next_packet_id(),
        request_id,
        network_id,
        msg.get("error"),
        msg.get("netconf"),
    ) {
        env.switch.send(env, outp, true).await;
    }
    Ok(())
}

/// Synthesize the wire reply for one helper response. `None` means the
/// message carried nothing forwardable (no error, no config, or an
/// oversized payload).
fn build_reply(
    our: Address,
    peer: Address,
    packet_id: u64,
    request_id: u64,
    network_id: u64,
    error: Option<&str>,
    netconf: Option<&str>,
) -> Option<Packet> {
    if let Some(error) = error {
        let code = match error {
            "NOT_FOUND" => ErrorCode::ObjNotFound,
            _ => ErrorCode::InvalidRequest,
        };
        let mut outp = Packet::new(peer, our, Verb::Error, packet_id);
        outp.append_u8(Verb::NetworkConfigRequest as u8);
        outp.append_u64(request_id);
        outp.append_u8(code as u8);
        outp.append_u64(network_id);
        return Some(outp);
    }

    if let Some(netconf) = netconf {
        if netconf.len() >= NETCONF_MAX_PAYLOAD {
            debug!(
                "netconf response payload of {} bytes exceeds cap, dropping",
                netconf.len()
            );
            return None;
        }
        let mut outp = Packet::new(peer, our, Verb::Ok, packet_id);
        outp.append_u8(Verb::NetworkConfigRequest as u8);
        outp.append_u64(request_id);
        outp.append_u64(network_id);
        outp.append_u16(netconf.len() as u16);
        outp.append_bytes(netconf.as_bytes());
        return Some(outp);
    }

    None
}

fn parse_hex_u64(s: &str) -> Result<u64> {
    let trimmed = s.trim().trim_start_matches("0x");
    u64::from_str_radix(trimmed, 16).context("not a hex integer")
}
