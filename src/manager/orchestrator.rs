use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};

use crate::config::PeerInfo;
use crate::manager::choke_scheduler::ChokeScheduler;
use crate::manager::peer_session;
use crate::persistence::piece_store::PieceStore;

const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// Runs the swarm for one peer: accepts inbound sessions on the pre-bound
/// listener, dials every peer listed before us (later peers dial us, so each
/// pair shares exactly one session), runs the scheduler loop, and returns
/// once the completion barrier fires — the only designed shutdown trigger.
pub async fn run(
    listener: TcpListener,
    own_peer_id: u32,
    peers: Vec<PeerInfo>,
    piece_store: Arc<PieceStore>,
    scheduler: Arc<ChokeScheduler>,
) {
    let mut shutdown_rx = scheduler.shutdown_signal();

    tokio::spawn(scheduler.clone().run());

    let piece_store_for_accept = piece_store.clone();
    let scheduler_for_accept = scheduler.clone();
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    log::debug!("accepted incoming connection from {addr}");
                    tokio::spawn(peer_session::run(
                        stream,
                        own_peer_id,
                        piece_store_for_accept.clone(),
                        scheduler_for_accept.clone(),
                    ));
                }
                Err(e) => {
                    log::warn!("could not accept incoming connection: {e}");
                }
            }
        }
    });

    // one dial attempt per already-started peer; a failed dial is that
    // neighbor's loss, reconnection is nobody's job in this protocol
    for peer in peers.iter().take_while(|p| p.peer_id != own_peer_id) {
        let dest = format!("{}:{}", peer.host, peer.port);
        let peer_id = peer.peer_id;
        let piece_store = piece_store.clone();
        let scheduler = scheduler.clone();
        tokio::spawn(async move {
            log::debug!("dialing peer {peer_id} at {dest}");
            match TcpStream::connect(&dest).await {
                Ok(stream) => {
                    peer_session::run(stream, own_peer_id, piece_store, scheduler).await
                }
                Err(e) => log::warn!("could not connect to peer {peer_id} at {dest}: {e}"),
            }
        });
    }

    while !*shutdown_rx.borrow() {
        if shutdown_rx.changed().await.is_err() {
            break;
        }
    }
    // let the writer tasks flush queued completion notices to the other
    // peers before the process exit closes every socket
    tokio::time::sleep(SHUTDOWN_GRACE).await;
    log::info!("peer {own_peer_id} leaving the swarm");
}
