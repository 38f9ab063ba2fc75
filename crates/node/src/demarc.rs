//! Demarcation point between OS UDP sockets and the wire protocol engine.
//!
//! Owns every bound peer-to-peer socket. Inbound datagrams are handed to
//! the switch from per-socket receive tasks; outbound packets are sent on
//! the first bound socket. The port scan policy (which ports to try) lives
//! with the supervisor, not here.

use log::{debug, info, warn};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use crate::constants::MAX_UDP_PAYLOAD;
use crate::node::Runtime;

pub struct Demarc {
    sockets: Mutex<Vec<Arc<UdpSocket>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Demarc {
    pub fn new() -> Self {
        Self {
            sockets: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Try to bind one local UDP port. Returns whether the bind succeeded;
    /// the caller scans a port window and treats total failure as fatal.
    pub async fn bind_local_udp(&self, port: u16) -> bool {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
        match UdpSocket::bind(addr).await {
            Ok(socket) => {
                info!("bound peer-to-peer endpoint on udp/{}", port);
                self.sockets.lock().unwrap().push(Arc::new(socket));
                true
            }
            Err(e) => {
                debug!("udp/{} unavailable: {}", port, e);
                false
            }
        }
    }

    pub fn bound_ports(&self) -> Vec<u16> {
        self.sockets
            .lock()
            .unwrap()
            .iter()
            .filter_map(|s| s.local_addr().ok())
            .map(|a| a.port())
            .collect()
    }

    /// Spawn a receive task per bound socket, dispatching datagrams to the
    /// switch. Called once after the runtime environment is assembled.
    pub fn start(&self, env: Arc<Runtime>) {
        let sockets = self.sockets.lock().unwrap().clone();
        let mut tasks = self.tasks.lock().unwrap();
        for socket in sockets {
            let env = env.clone();
            let local_port = socket.local_addr().map(|a| a.port()).unwrap_or(0);
            tasks.push(tokio::spawn(async move {
                let mut buf = [0u8; MAX_UDP_PAYLOAD];
                loop {
                    match socket.recv_from(&mut buf).await {
                        Ok((len, source)) => {
                            env.switch
                                .on_remote_packet(&env, local_port, source, &buf[..len])
                                .await;
                        }
                        Err(e) => {
                            warn!("udp/{} receive error: {}", local_port, e);
                        }
                    }
                }
            }));
        }
    }

    /// Send a raw datagram to a remote endpoint.
    pub async fn send(&self, dest: SocketAddr, data: &[u8]) -> bool {
        let socket = self.sockets.lock().unwrap().first().cloned();
        match socket {
            Some(socket) => match socket.send_to(data, dest).await {
                Ok(_) => true,
                Err(e) => {
                    debug!("send to {} failed: {}", dest, e);
                    false
                }
            },
            None => false,
        }
    }

    /// Abort the receive tasks. Sockets close when the last reference
    /// drops.
    pub fn shutdown(&self) {
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}

impl Default for Demarc {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Demarc {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn binds_and_reports_port() {
        let demarc = Demarc::new();
        // Port 0 lets the OS choose; the scan in the supervisor uses real
        // ports but the bind/bookkeeping path is identical.
        assert!(demarc.bind_local_udp(0).await);
        let ports = demarc.bound_ports();
        assert_eq!(ports.len(), 1);
        assert_ne!(ports[0], 0);
    }

    #[tokio::test]
    async fn double_bind_same_port_fails() {
        let demarc = Demarc::new();
        assert!(demarc.bind_local_udp(0).await);
        let port = demarc.bound_ports()[0];

        let other = Demarc::new();
        assert!(!other.bind_local_udp(port).await);
    }
}
