pub mod authtoken;
pub mod config;
pub mod constants;
pub mod defaults;
pub mod demarc;
pub mod identity;
pub mod logger;
pub mod multicast;
pub mod netconf;
pub mod network;
pub mod node;
pub mod nodeconfig;
pub mod packet;
pub mod prng;
pub mod service;
pub mod switch;
pub mod sysenv;
pub mod time;
pub mod topology;

// Re-export key types for easier access by consumers
pub use identity::{Address, Identity};
pub use multicast::MulticastGroup;
pub use node::{Node, ReasonForTermination, Runtime};
pub use nodeconfig::{LocalClient, NodeConfig};
pub use packet::{ErrorCode, Packet, Verb};
pub use service::{Dictionary, Service};
