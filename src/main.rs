use std::env::current_dir;
use std::fmt;
use std::path::Path;
use std::process::exit;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::net::TcpListener;

use manager::choke_scheduler::ChokeScheduler;
use manager::orchestrator;
use persistence::piece_store::PieceStore;

mod config;
mod manager;
mod persistence;
mod swarm_protocol;

#[cfg(test)]
#[macro_use]
extern crate assert_matches;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Peer id of this process; must appear in the peer list
    #[arg(short, long, env)]
    peer_id: u32,

    /// Path to the common config file
    #[arg(short, long, env, default_value = "Common.cfg")]
    common_config: String,

    /// Path to the peer list file
    #[arg(short = 'i', long, env, default_value = "PeerInfo.cfg")]
    peer_list: String,

    /// Optional base path holding the per-peer file directories
    #[arg(short, long, env, default_value_t = current_dir().unwrap().to_str().expect("current path must be an utf8 string").to_string())]
    base_path: String,

    /// Optional log level
    #[arg(short, long, env, default_value_t = LogLevels::Info)]
    log_level: LogLevels,
}

#[derive(clap::ValueEnum, Debug, Clone)]
enum LogLevels {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevels {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", format!("{:?}", self).to_lowercase())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // init logging
    env_logger::init_from_env(
        env_logger::Env::default().filter_or("LOG_LEVEL", args.log_level.to_string()),
    );

    let common = match config::CommonConfig::load(Path::new(&args.common_config)) {
        Ok(common) => common,
        Err(e) => {
            log::error!("invalid common config: {e:#}");
            exit(1);
        }
    };
    let peers = match config::load_peer_list(Path::new(&args.peer_list)) {
        Ok(peers) => peers,
        Err(e) => {
            log::error!("invalid peer list: {e:#}");
            exit(1);
        }
    };
    let own = match peers.iter().find(|p| p.peer_id == args.peer_id) {
        Some(own) => own.clone(),
        None => {
            log::error!(
                "peer id {} does not appear in peer list {}",
                args.peer_id,
                args.peer_list
            );
            exit(1);
        }
    };

    let piece_store = Arc::new(PieceStore::new(
        Path::new(&args.base_path),
        own.peer_id,
        &common.file_name,
        common.file_size,
        common.piece_size,
        own.has_file,
        common.expected_sha256,
    ));
    log::info!(
        "peer {} starting: {:?} is {} pieces of up to {} bytes",
        own.peer_id,
        common.file_name,
        piece_store.num_pieces(),
        common.piece_size,
    );

    let tracked: Vec<u32> = peers.iter().map(|p| p.peer_id).collect();
    let scheduler = Arc::new(ChokeScheduler::new(
        common.preferred_neighbors,
        common.unchoke_interval,
        common.optimistic_unchoke_interval,
        &tracked,
    ));

    if piece_store.is_complete() {
        if piece_store.verify_file_hash() {
            log::info!("starting with the complete file, digest verified");
        } else {
            log::warn!("starting with the complete file but digest verification failed");
        }
        scheduler.mark_completed(own.peer_id);
    }

    let listener = TcpListener::bind(format!("0.0.0.0:{}", own.port)).await?;
    log::info!("peer {} listening on port {}", own.peer_id, own.port);

    orchestrator::run(listener, own.peer_id, peers, piece_store, scheduler).await;
    log::info!("file distribution complete, exiting");
    Ok(())
}
