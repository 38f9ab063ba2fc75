//! Node supervisor.
//!
//! Owns the runtime environment, runs startup, drives the periodic tick
//! schedule, and tears everything down on exit. One node per home
//! directory; the control-port bind in NodeConfig enforces that.

use anyhow::{bail, Context, Result};
use log::{error, info, warn};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::sync::Notify;

use crate::authtoken;
use crate::config::Config;
use crate::constants::{
    DB_CLEAN_PERIOD, MIN_SERVICE_LOOP_INTERVAL, MULTICAST_LIKE_ANNOUNCE_ALL_PERIOD,
    MULTICAST_LOCAL_POLL_PERIOD, NETWORK_FINGERPRINT_CHECK_DELAY, PING_CHECK_DELAY,
    SLEEP_WAKE_DETECTION_THRESHOLD, SLEEP_WAKE_SETTLE_TIME, UDP_PORT_SCAN_RANGE,
};
use crate::defaults;
use crate::demarc::Demarc;
use crate::identity::{self, Identity};
use crate::logger::{self, LogSink};
use crate::multicast::Multicaster;
use crate::netconf;
use crate::nodeconfig::NodeConfig;
use crate::prng::Prng;
use crate::service::{Service, ServiceHandler};
use crate::switch::Switch;
use crate::sysenv::SysEnv;
use crate::time::now_ms;
use crate::topology::Topology;

pub const VERSION_MAJOR: u8 = 0;
pub const VERSION_MINOR: u8 = 4;
pub const VERSION_REVISION: u16 = 1;

/// Scanned for by loaders and updaters to identify a binary's version.
/// The 16-byte prefix is fixed; the tail is major, minor, and the
/// little-endian revision.
#[used]
pub static EMBEDDED_VERSION_STAMP: [u8; 20] = [
    0x6d, 0xfe, 0xff, 0x01, 0x90, 0xfa, 0x89, 0x57, 0x88, 0xa1, 0xaa, 0xdc, 0xdd, 0xde, 0xb0,
    0x33, VERSION_MAJOR, VERSION_MINOR, (VERSION_REVISION & 0xff) as u8,
    (VERSION_REVISION >> 8) as u8,
];

pub fn version_string() -> &'static str {
    static VERSION: OnceLock<String> = OnceLock::new();
    VERSION.get_or_init(|| format!("{}.{}.{}", VERSION_MAJOR, VERSION_MINOR, VERSION_REVISION))
}

/// Why the supervisor stopped (or that it has not).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReasonForTermination {
    Running,
    NormalTermination,
    UnrecoverableError,
}

/// The runtime environment: every subsystem, owned in one place.
///
/// Subsystems never hold references to each other; anything that needs a
/// neighbor takes `&Runtime` at the call site. Fields are declared in
/// reverse construction order so drop order mirrors teardown order.
pub struct Runtime {
    /// Netconf bridge, present only when the helper executable exists.
    pub netconf: OnceLock<Service>,
    pub sysenv: SysEnv,
    pub topology: Topology,
    pub switch: Switch,
    pub multicaster: Multicaster,
    pub demarc: Demarc,
    pub nodeconfig: NodeConfig,
    pub prng: Prng,
    pub identity: Identity,
    pub home: PathBuf,
}

impl Runtime {
    /// Construct every subsystem in startup order. I/O tasks are not
    /// started here; the supervisor does that once it holds the Arc.
    pub(crate) async fn assemble(home: &Path, config: &Config) -> Result<Arc<Runtime>> {
        let prng = Prng::new();

        let identity = identity::init_from_home(home)?;

        // Obsolete files from old versions.
        for legacy in ["status", "thisdeviceismine"] {
            let _ = std::fs::remove_file(home.join(legacy));
        }

        let token = authtoken::init_from_home(home)?;

        let nodeconfig = NodeConfig::new(&token, config.network.control_port)
            .await
            .context(
                "another instance appears to be running, or the local control UDP port cannot be bound",
            )?;

        let demarc = Demarc::new();
        let multicaster = Multicaster::new();
        let switch = Switch::new();
        let topology = Topology::new(&identity, home.join("peer.db"));
        let sysenv = SysEnv::new();

        Ok(Arc::new(Runtime {
            netconf: OnceLock::new(),
            sysenv,
            topology,
            switch,
            multicaster,
            demarc,
            nodeconfig,
            prng,
            identity,
            home: home.to_path_buf(),
        }))
    }

    /// Stop every spawned task. Dropping the Arc afterwards releases the
    /// subsystems in reverse construction order.
    pub fn shutdown(&self) {
        if let Some(service) = self.netconf.get() {
            service.shutdown();
        }
        self.nodeconfig.shutdown();
        self.demarc.shutdown();
    }
}

struct NodeState {
    started: AtomicBool,
    running: AtomicBool,
    terminate_now: AtomicBool,
    wakeup: Notify,
    reason: Mutex<(ReasonForTermination, String)>,
}

/// Handle on one node. `run()` consumes the calling task until shutdown;
/// clones share the same state, so any of them may call `terminate()`.
#[derive(Clone)]
pub struct Node {
    home: PathBuf,
    state: Arc<NodeState>,
}

impl Node {
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self {
            home: home.into(),
            state: Arc::new(NodeState {
                started: AtomicBool::new(false),
                running: AtomicBool::new(false),
                terminate_now: AtomicBool::new(false),
                wakeup: Notify::new(),
                reason: Mutex::new((ReasonForTermination::Running, String::new())),
            }),
        }
    }

    pub fn started(&self) -> bool {
        self.state.started.load(Ordering::SeqCst)
    }

    pub fn running(&self) -> bool {
        self.state.running.load(Ordering::SeqCst)
    }

    /// Ask the supervisor to exit. Idempotent; wakes the loop within one
    /// tick.
    pub fn terminate(&self) {
        self.state.terminate_now.store(true, Ordering::SeqCst);
        self.state.wakeup.notify_one();
    }

    /// The final reason, available only after the loop has exited.
    pub fn reason_for_termination(&self) -> Option<(ReasonForTermination, String)> {
        if !self.started() || self.running() {
            return None;
        }
        Some(self.state.reason.lock().unwrap().clone())
    }

    fn conclude(
        &self,
        reason: ReasonForTermination,
        message: impl Into<String>,
    ) -> ReasonForTermination {
        let message = message.into();
        match reason {
            ReasonForTermination::UnrecoverableError => error!("terminating: {}", message),
            _ => info!("terminating: {}", message),
        }
        *self.state.reason.lock().unwrap() = (reason, message);
        self.state.running.store(false, Ordering::SeqCst);
        reason
    }

    /// Run the node in the current task until it terminates.
    pub async fn run(&self) -> ReasonForTermination {
        self.state.started.store(true, Ordering::SeqCst);
        self.state.running.store(true, Ordering::SeqCst);

        let env = match self.init().await {
            Ok(env) => env,
            Err(e) => {
                return self.conclude(ReasonForTermination::UnrecoverableError, format!("{:#}", e))
            }
        };

        info!(
            "{} starting version {}",
            env.identity.address(),
            version_string()
        );

        let mut loop_state = LoopState::new(&env);
        while !self.state.terminate_now.load(Ordering::SeqCst) {
            run_tick(&env, &mut loop_state).await;

            let delay = env
                .switch
                .do_timer_tasks(&env)
                .await
                .min(MIN_SERVICE_LOOP_INTERVAL);
            let start = now_ms();
            let _ = tokio::time::timeout(
                Duration::from_millis(delay),
                self.state.wakeup.notified(),
            )
            .await;
            loop_state.last_delay_delta = now_ms().saturating_sub(start) as i64 - delay as i64;
        }

        env.shutdown();
        self.conclude(ReasonForTermination::NormalTermination, "normal termination")
    }

    async fn init(&self) -> Result<Arc<Runtime>> {
        std::fs::create_dir_all(&self.home)
            .with_context(|| format!("could not create home directory {:?}", self.home))?;

        let config = Config::load_from_home(&self.home)?;

        let sink = if config.log.stdout {
            LogSink::Stdout
        } else {
            LogSink::File {
                path: self.home.join("node.log"),
                max_size: config.log.max_size,
            }
        };
        // A second node in the same process (tests) keeps the first sink.
        let _ = logger::init(sink, config.log_level());

        let env = Runtime::assemble(&self.home, &config).await?;

        let mut bound = false;
        for offset in 0..UDP_PORT_SCAN_RANGE {
            let port = config.network.port as u32 + offset as u32;
            if port > u16::MAX as u32 {
                break;
            }
            if env.demarc.bind_local_udp(port as u16).await {
                bound = true;
                break;
            }
        }
        if !bound {
            bail!("could not bind any local UDP ports");
        }

        let mut supernodes = defaults::supernodes();
        for seed in &config.seeds {
            let seed_identity: Identity = match seed.identity.parse() {
                Ok(id) => id,
                Err(e) => {
                    warn!("ignoring seed with bad identity: {:#}", e);
                    continue;
                }
            };
            let endpoints: Vec<std::net::SocketAddr> =
                seed.endpoints.iter().filter_map(|e| e.parse().ok()).collect();
            if endpoints.is_empty() {
                warn!("ignoring seed {} with no usable endpoints", seed_identity.address());
                continue;
            }
            let _ = env.topology.learn_identity(&env.identity, &seed_identity);
            supernodes.push((seed_identity.address(), endpoints));
        }
        env.topology.set_supernodes(&supernodes);

        env.demarc.start(env.clone());
        env.nodeconfig.start(env.clone());

        let service_path = netconf::service_path(&self.home);
        if service_path.exists() {
            info!("services.d/netconf.service appears to exist, starting...");
            let handler_env = env.clone();
            let handler: ServiceHandler = Box::new(move |msg| {
                let env = handler_env.clone();
                Box::pin(async move { netconf::handle_service_message(&env, msg).await })
            });
            let service = Service::spawn(
                "netconf",
                service_path,
                self.home.clone(),
                handler,
            );
            let _ = env.netconf.set(service);
        }

        Ok(env)
    }
}

/// Mutable timing state of the service loop, kept apart from the loop body
/// so single ticks are testable.
pub(crate) struct LoopState {
    last_ping_check: u64,
    last_clean: u64,
    pub(crate) last_network_fingerprint_check: u64,
    last_autoconfigure_check: u64,
    pub(crate) last_multicast_check: u64,
    pub(crate) last_multicast_announce_all: u64,
    pub(crate) last_delay_delta: i64,
    pub(crate) network_fingerprint: u64,
}

impl LoopState {
    pub(crate) fn new(env: &Runtime) -> Self {
        Self {
            last_ping_check: 0,
            last_clean: now_ms(), // no need to clean immediately
            last_network_fingerprint_check: 0,
            last_autoconfigure_check: 0,
            last_multicast_check: 0,
            last_multicast_announce_all: 0,
            last_delay_delta: 0,
            network_fingerprint: env.sysenv.network_configuration_fingerprint(),
        }
    }
}

/// One pass over the periodic stages, in their fixed order. The
/// cooperative wait between ticks lives in `Node::run`.
pub(crate) async fn run_tick(env: &Arc<Runtime>, state: &mut LoopState) {
    let now = now_ms();
    let mut ping_all = false;

    // A wait that overshot badly means the host slept. Force environment
    // rechecks and re-ping everything once the OS has settled.
    if state.last_delay_delta >= SLEEP_WAKE_DETECTION_THRESHOLD as i64 {
        state.last_network_fingerprint_check = 0;
        state.last_multicast_check = 0;
        ping_all = true;
        warn!("probable suspend/resume detected, pausing a moment for things to settle...");
        tokio::time::sleep(Duration::from_millis(SLEEP_WAKE_SETTLE_TIME)).await;
    }

    if now.saturating_sub(state.last_network_fingerprint_check) >= NETWORK_FINGERPRINT_CHECK_DELAY
    {
        state.last_network_fingerprint_check = now;
        let fingerprint = env.sysenv.network_configuration_fingerprint();
        if fingerprint != state.network_fingerprint {
            info!(
                "network configuration fingerprint change: {:016x} != {:016x}, resyncing with network",
                state.network_fingerprint, fingerprint
            );
            state.network_fingerprint = fingerprint;
            ping_all = true;
            // Reset, not read, here: an out-of-tree autoconfiguration
            // collaborator consumes this stamp.
            state.last_autoconfigure_check = 0;
            state.last_multicast_check = 0;
            env.nodeconfig.whack_all_taps();
        }
    }

    if now.saturating_sub(state.last_multicast_check) >= MULTICAST_LOCAL_POLL_PERIOD {
        state.last_multicast_check = now;
        let announce_all = now.saturating_sub(state.last_multicast_announce_all)
            >= MULTICAST_LIKE_ANNOUNCE_ALL_PERIOD;

        let mut to_announce = Vec::new();
        for network in env.nodeconfig.networks() {
            if network.update_multicast_groups() || announce_all {
                to_announce.push((network.id(), network.multicast_groups()));
            }
        }

        if !to_announce.is_empty() {
            env.switch.announce_multicast_groups(env, &to_announce).await;
            // Stamp only when an announce-all pass actually announced
            // something; keeps the announce-all condition true through
            // startup until at least one group exists.
            if announce_all {
                state.last_multicast_announce_all = now;
            }
        }
    }

    if now.saturating_sub(state.last_ping_check) >= PING_CHECK_DELAY {
        state.last_ping_check = now;
        if env.topology.am_supernode() {
            // Supernodes ping only each other and never need firewall
            // openers; they are not firewalled.
            for address in env.topology.supernodes_needing_ping(now) {
                env.switch.send_hello(env, address).await;
            }
        } else if ping_all {
            for address in env.topology.peers_with_active_direct_path(now) {
                env.switch.send_hello(env, address).await;
            }
        } else {
            for address in env.topology.peers_needing_ping(now) {
                env.switch.send_hello(env, address).await;
            }
            for address in env.topology.peers_needing_firewall_opener(now) {
                env.switch.send_firewall_opener(env, address).await;
            }
        }
    }

    if now.saturating_sub(state.last_clean) >= DB_CLEAN_PERIOD {
        state.last_clean = now;
        env.topology.clean(now);
        env.multicaster.clean(now);
        env.nodeconfig.clean_all_networks();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::Dictionary;
    use std::net::SocketAddr;
    use tempfile::TempDir;

    async fn test_runtime(home: &TempDir) -> Arc<Runtime> {
        let mut config = Config::default();
        config.network.control_port = 0; // ephemeral; tests must not collide
        let env = Runtime::assemble(home.path(), &config).await.unwrap();
        assert!(env.demarc.bind_local_udp(0).await);
        env.demarc.start(env.clone());
        env
    }

    fn endpoint_of(env: &Runtime) -> SocketAddr {
        format!("127.0.0.1:{}", env.demarc.bound_ports()[0])
            .parse()
            .unwrap()
    }

    async fn wait_for(mut cond: impl FnMut() -> bool, what: &str) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("timed out waiting for {}", what);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn hello_establishes_identity_both_ways() {
        let (home_a, home_b) = (TempDir::new().unwrap(), TempDir::new().unwrap());
        let a = test_runtime(&home_a).await;
        let b = test_runtime(&home_b).await;

        // A knows B's identity and endpoint; B knows nothing about A.
        a.topology
            .learn_identity(&a.identity, &b.identity.public_only())
            .unwrap();
        a.topology
            .learn_path(b.identity.address(), endpoint_of(&b), now_ms());

        a.switch.send_hello(&a, b.identity.address()).await;

        let (a2, b2) = (a.clone(), b.clone());
        wait_for(
            move || b2.topology.session_key(a2.identity.address()).is_some(),
            "B to learn A from HELLO",
        )
        .await;

        a.shutdown();
        b.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn injected_sleep_wake_delta_forces_ping_all() {
        let (home_a, home_b) = (TempDir::new().unwrap(), TempDir::new().unwrap());
        let a = test_runtime(&home_a).await;
        let b = test_runtime(&home_b).await;

        a.topology
            .learn_identity(&a.identity, &b.identity.public_only())
            .unwrap();
        a.topology
            .learn_path(b.identity.address(), endpoint_of(&b), now_ms());
        // Fresh direct send stamp: without ping_all nothing would be sent.
        a.topology
            .mark_sent(b.identity.address(), endpoint_of(&b), now_ms());

        let mut state = LoopState::new(&a);
        state.last_delay_delta = SLEEP_WAKE_DETECTION_THRESHOLD as i64 + 1;
        run_tick(&a, &mut state).await;

        // The forced recheck stamps must have been refreshed this tick.
        assert_ne!(state.last_network_fingerprint_check, 0);

        let (a2, b2) = (a.clone(), b.clone());
        wait_for(
            move || b2.topology.session_key(a2.identity.address()).is_some(),
            "B to hear a forced HELLO",
        )
        .await;

        a.shutdown();
        b.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn fingerprint_change_forces_full_resync() {
        let (home_a, home_b) = (TempDir::new().unwrap(), TempDir::new().unwrap());
        let a = test_runtime(&home_a).await;
        let b = test_runtime(&home_b).await;

        a.topology
            .learn_identity(&a.identity, &b.identity.public_only())
            .unwrap();
        a.topology
            .learn_path(b.identity.address(), endpoint_of(&b), now_ms());
        a.topology
            .mark_sent(b.identity.address(), endpoint_of(&b), now_ms());

        let mut state = LoopState::new(&a);
        // Pretend the last observed environment was something else; the
        // recheck this tick must see a change and re-ping direct peers.
        state.network_fingerprint = !state.network_fingerprint;
        run_tick(&a, &mut state).await;

        assert_eq!(
            state.network_fingerprint,
            a.sysenv.network_configuration_fingerprint()
        );

        let (a2, b2) = (a.clone(), b.clone());
        wait_for(
            move || b2.topology.session_key(a2.identity.address()).is_some(),
            "B to hear the resync HELLO",
        )
        .await;

        a.shutdown();
        b.shutdown();
    }

    #[tokio::test]
    async fn announce_all_stamp_advances_only_on_actual_announcement() {
        let home = TempDir::new().unwrap();
        let env = test_runtime(&home).await;

        // Nothing joined: an announce-all pass with nothing to announce
        // must not advance the stamp, keeping announce-all pending.
        let mut state = LoopState::new(&env);
        run_tick(&env, &mut state).await;
        assert_eq!(state.last_multicast_announce_all, 0);

        // With a joined network there is always at least the broadcast
        // group, so the next announce-all pass stamps.
        env.nodeconfig.join(0xbeef);
        state.last_multicast_check = 0;
        run_tick(&env, &mut state).await;
        let stamped = state.last_multicast_announce_all;
        assert_ne!(stamped, 0);

        // No change and announce-all period not lapsed: stamp holds.
        state.last_multicast_check = 0;
        run_tick(&env, &mut state).await;
        assert_eq!(state.last_multicast_announce_all, stamped);

        env.shutdown();
    }

    #[tokio::test]
    async fn netconf_responses_respect_network_and_peer_gates() {
        let home = TempDir::new().unwrap();
        let env = test_runtime(&home).await;

        let mut msg = Dictionary::new();
        msg.set("type", "netconf-response");
        msg.set("requestId", "1a");
        msg.set("nwid", "deadbeef");
        msg.set("peer", "0102030405");
        msg.set("error", "NOT_FOUND");

        // Unknown network: dropped, nothing reaches the switch.
        netconf::handle_service_message(&env, msg.clone()).await;
        assert_eq!(env.switch.pending_sends(), 0);

        // Known network, unknown peer path: the reply is synthesized and
        // parked on the retry queue.
        env.nodeconfig.join(0xdeadbeef);
        netconf::handle_service_message(&env, msg.clone()).await;
        assert_eq!(env.switch.pending_sends(), 1);

        // Reserved peer addresses never get a reply.
        msg.set("peer", "ff02030405");
        netconf::handle_service_message(&env, msg.clone()).await;
        msg.set("peer", "0000000000");
        netconf::handle_service_message(&env, msg).await;
        assert_eq!(env.switch.pending_sends(), 1);

        env.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn deferred_sends_flush_once_a_path_appears() {
        let (home_a, home_b) = (TempDir::new().unwrap(), TempDir::new().unwrap());
        let a = test_runtime(&home_a).await;
        let b = test_runtime(&home_b).await;

        a.topology
            .learn_identity(&a.identity, &b.identity.public_only())
            .unwrap();

        // No path yet: the packet parks on the retry queue and the switch
        // asks to be called back soon.
        let mut outp = crate::packet::Packet::new(
            b.identity.address(),
            a.identity.address(),
            crate::packet::Verb::Nop,
            a.prng.next_packet_id(),
        );
        outp.append_u8(0);
        a.switch.send(&a, outp, true).await;
        assert_eq!(a.switch.pending_sends(), 1);
        let suggested = a.switch.do_timer_tasks(&a).await;
        assert!(suggested <= crate::constants::SEND_RETRY_DELAY);

        a.topology
            .learn_path(b.identity.address(), endpoint_of(&b), now_ms());
        tokio::time::sleep(Duration::from_millis(
            crate::constants::SEND_RETRY_DELAY + 100,
        ))
        .await;
        a.switch.do_timer_tasks(&a).await;
        assert_eq!(a.switch.pending_sends(), 0);

        a.shutdown();
        b.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cold_start_creates_state_and_terminates_cleanly() {
        let home = TempDir::new().unwrap();
        std::fs::write(
            home.path().join("config.toml"),
            "[network]\nport = 42100\ncontrol_port = 42101\n",
        )
        .unwrap();

        let node = Node::new(home.path());
        assert!(!node.started());
        assert!(node.reason_for_termination().is_none());

        let runner = node.clone();
        let handle = tokio::spawn(async move { runner.run().await });

        let secret_path = home.path().join("identity.secret");
        let public_path = home.path().join("identity.public");
        let token_path = home.path().join("authtoken.secret");
        wait_for(
            || secret_path.exists() && public_path.exists() && token_path.exists(),
            "startup files",
        )
        .await;

        assert!(node.started());
        assert!(node.running());
        assert!(node.reason_for_termination().is_none());

        // identity.public is the public projection of identity.secret.
        let secret: Identity = std::fs::read_to_string(&secret_path)
            .unwrap()
            .parse()
            .unwrap();
        assert_eq!(
            std::fs::read_to_string(&public_path).unwrap(),
            secret.serialize(false)
        );
        let token = std::fs::read_to_string(&token_path).unwrap();
        assert_eq!(token.len(), crate::constants::AUTH_TOKEN_LENGTH);

        node.terminate();
        let reason = tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .expect("terminate must stop the loop within a bounded time")
            .unwrap();
        assert_eq!(reason, ReasonForTermination::NormalTermination);
        assert_eq!(
            node.reason_for_termination(),
            Some((
                ReasonForTermination::NormalTermination,
                "normal termination".to_string()
            ))
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn second_instance_terminates_unrecoverably() {
        let home_one = TempDir::new().unwrap();
        std::fs::write(
            home_one.path().join("config.toml"),
            "[network]\nport = 42210\ncontrol_port = 42211\n",
        )
        .unwrap();

        let first = Node::new(home_one.path());
        let runner = first.clone();
        let handle = tokio::spawn(async move { runner.run().await });

        let token_path = home_one.path().join("authtoken.secret");
        wait_for(|| token_path.exists(), "first node startup").await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        // Second home, same control port: the single-instance guard trips.
        let home_two = TempDir::new().unwrap();
        std::fs::write(
            home_two.path().join("config.toml"),
            "[network]\nport = 42310\ncontrol_port = 42211\n",
        )
        .unwrap();

        let second = Node::new(home_two.path());
        let reason = second.run().await;
        assert_eq!(reason, ReasonForTermination::UnrecoverableError);
        let (_, message) = second.reason_for_termination().unwrap();
        assert!(
            message.contains("another instance"),
            "unexpected reason: {}",
            message
        );

        first.terminate();
        let _ = tokio::time::timeout(Duration::from_secs(10), handle).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn local_control_round_trip() {
        let home = TempDir::new().unwrap();
        std::fs::write(
            home.path().join("config.toml"),
            "[network]\nport = 42410\ncontrol_port = 42411\n",
        )
        .unwrap();

        let node = Node::new(home.path());
        let runner = node.clone();
        let handle = tokio::spawn(async move { runner.run().await });

        let token_path = home.path().join("authtoken.secret");
        wait_for(|| token_path.exists(), "node startup").await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        let token = std::fs::read_to_string(&token_path).unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let client = crate::nodeconfig::LocalClient::with_port(
            &token,
            42411,
            Box::new(move |conversation_id, line| {
                let _ = tx.send((conversation_id, line.to_string()));
            }),
        )
        .await;

        let conversation_id = client.send("info").await;
        assert_ne!(conversation_id, 0);

        let (got_id, line) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("control response expected")
            .unwrap();
        assert_eq!(got_id, conversation_id);
        assert!(line.starts_with("200 info"), "unexpected line: {}", line);

        node.terminate();
        let _ = tokio::time::timeout(Duration::from_secs(10), handle).await;
    }
}
