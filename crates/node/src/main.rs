use anyhow::Result;
use clap::Parser;
use log::error;
use std::path::PathBuf;
use tokio::signal;

use weft::node::{Node, ReasonForTermination};

#[derive(Parser, Debug)]
#[command(
    name = "weftd",
    version,
    about = "Peer-to-peer virtual Ethernet node",
    long_about = "weftd\n\n\
        Runs one node per home directory. The home directory holds the\n\
        node's identity, the control auth token, the peer database, and\n\
        optional helper services under services.d/.\n\n\
        Examples:\n  \
          # Run with the default home directory\n  \
          weftd\n\n  \
          # Run against an explicit home directory\n  \
          weftd /var/lib/weft"
)]
struct Args {
    /// Home directory (defaults to ~/.weft)
    home: Option<PathBuf>,
}

fn default_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".weft")
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let home = args.home.unwrap_or_else(default_home);

    let node = Node::new(home);

    let signal_node = node.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            signal_node.terminate();
        }
    });

    let reason = node.run().await;
    let detail = node
        .reason_for_termination()
        .map(|(_, message)| message)
        .unwrap_or_default();

    match reason {
        ReasonForTermination::NormalTermination => Ok(()),
        _ => {
            error!("node exited abnormally: {}", detail);
            eprintln!("weftd: {}", detail);
            std::process::exit(1);
        }
    }
}
