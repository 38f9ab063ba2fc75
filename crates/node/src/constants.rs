//! Protocol and service-loop constants.

/// Wire protocol version spoken in HELLO.
pub const PROTOCOL_VERSION: u8 = 2;

/// First port tried for the peer-to-peer UDP endpoint.
pub const DEFAULT_UDP_PORT: u16 = 9993;

/// Number of consecutive ports scanned when the default is taken.
pub const UDP_PORT_SCAN_RANGE: u16 = 128;

/// Loopback UDP port for the local control channel. Binding this port is
/// also the single-instance guard for a home directory.
pub const CONTROL_UDP_PORT: u16 = 39393;

/// Hard ceiling on the service loop wait, in milliseconds. The switch may
/// suggest shorter delays but never longer ones.
pub const MIN_SERVICE_LOOP_INTERVAL: u64 = 500;

/// How often the ping stage runs (ms).
pub const PING_CHECK_DELAY: u64 = 7_000;

/// A peer with a direct link is pinged when its last direct send is older
/// than this (ms).
pub const PEER_DIRECT_PING_DELAY: u64 = 15_000;

/// A direct path is considered active if something was received on it within
/// this window (ms).
pub const PEER_PATH_ACTIVITY_TIMEOUT: u64 = PEER_DIRECT_PING_DELAY + 10_000;

/// NAT mappings are held open with a tiny keepalive at this interval (ms).
pub const FIREWALL_OPENER_DELAY: u64 = 50_000;

/// Peers silent for longer than this are dropped by topology cleaning (ms).
pub const PEER_IN_MEMORY_EXPIRATION: u64 = 600_000;

/// How often the host network environment fingerprint is recomputed (ms).
pub const NETWORK_FINGERPRINT_CHECK_DELAY: u64 = 5_000;

/// How often taps are polled for multicast subscription changes (ms).
pub const MULTICAST_LOCAL_POLL_PERIOD: u64 = 10_000;

/// How often every multicast group is re-announced regardless of change (ms).
pub const MULTICAST_LIKE_ANNOUNCE_ALL_PERIOD: u64 = 120_000;

/// Multicast LIKE entries expire after this long without renewal (ms).
pub const MULTICAST_LIKE_EXPIRATION: u64 = 600_000;

/// How often persistent databases are cleaned (ms).
pub const DB_CLEAN_PERIOD: u64 = 300_000;

/// A cooperative wait that overshoots its requested delay by at least this
/// much is treated as a host suspend/resume (ms).
pub const SLEEP_WAKE_DETECTION_THRESHOLD: u64 = 2_000;

/// Pause after detecting suspend/resume, letting the OS re-plumb interfaces
/// before peers are re-pinged (ms).
pub const SLEEP_WAKE_SETTLE_TIME: u64 = 2_000;

/// Maximum size of a peer-to-peer UDP datagram we will build or accept.
pub const MAX_UDP_PAYLOAD: usize = 1500;

/// Maximum size of one local control packet.
pub const CONTROL_MAX_PACKET_SIZE: usize = 4096;

/// Length of the generated control auth token.
pub const AUTH_TOKEN_LENGTH: usize = 24;

/// Deferred wire sends are retried this often (ms) and dropped after the
/// attempt cap.
pub const SEND_RETRY_DELAY: u64 = 1_000;
pub const SEND_RETRY_ATTEMPTS: u32 = 5;

/// Sanity cap on a network configuration payload relayed from the netconf
/// helper to a peer.
pub const NETCONF_MAX_PAYLOAD: usize = 2048;

/// Default byte cap for the rotating node.log sink.
pub const LOG_MAX_SIZE: u64 = 131_072;
