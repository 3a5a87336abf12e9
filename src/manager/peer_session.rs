use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use tokio::io::ReadHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, Receiver, Sender};

use crate::manager::choke_scheduler::ChokeScheduler;
use crate::persistence::piece_store::PieceStore;
use crate::swarm_protocol::wire_protocol::{
    Message, Phase, Protocol, ProtocolReadHalf, ProtocolWriteHalf, WireError,
};

const TO_PEER_CHANNEL_CAPACITY: usize = 100;

/// Per-connection protocol state. Everything here is private to the session
/// task; shared state lives behind the piece store and the scheduler.
struct PeerSession {
    own_peer_id: u32,
    remote_peer_id: u32,
    piece_store: Arc<PieceStore>,
    scheduler: Arc<ChokeScheduler>,
    remote_bitfield: Option<Vec<bool>>,
    outstanding_request: Option<u32>,
    completion_signalled: bool,
    out_tx: Sender<Message>,
}

/// Runs one session from handshake to teardown. The socket is closed on
/// every exit path: the read half when this future returns, the write half
/// when the writer task drains.
pub async fn run(
    stream: TcpStream,
    own_peer_id: u32,
    piece_store: Arc<PieceStore>,
    scheduler: Arc<ChokeScheduler>,
) {
    let peer_addr = addr_or_unknown(&stream);
    if let Err(e) = drive(stream, own_peer_id, piece_store, scheduler).await {
        if is_connection_closed(&e) {
            log::debug!("connection with peer {peer_addr} closed: {e}");
        } else {
            log::warn!("session with peer {peer_addr} failed: {e}");
        }
    }
}

async fn drive(
    mut stream: TcpStream,
    own_peer_id: u32,
    piece_store: Arc<PieceStore>,
    scheduler: Arc<ChokeScheduler>,
) -> Result<()> {
    let remote_peer_id = stream.handshake(own_peer_id).await?;
    let peer_addr = addr_or_unknown(&stream);
    log::info!("connected to peer {remote_peer_id} at {peer_addr}");

    let (mut read, write) = tokio::io::split(stream);
    let (out_tx, out_rx) = mpsc::channel(TO_PEER_CHANNEL_CAPACITY);
    tokio::spawn(snd_message_handler(remote_peer_id, out_rx, write));

    let mut session = PeerSession {
        own_peer_id,
        remote_peer_id,
        piece_store,
        scheduler,
        remote_bitfield: None,
        outstanding_request: None,
        completion_signalled: false,
        out_tx,
    };
    session.setup(&mut read).await?;
    loop {
        let message = read.receive(Phase::Active).await?;
        session.handle_message(message).await?;
    }
}

/// Owns the write half: every byte written to this socket, whether from the
/// session or pushed by the scheduler, goes through this one task.
async fn snd_message_handler<T: ProtocolWriteHalf + 'static>(
    remote_peer_id: u32,
    mut out_rx: Receiver<Message>,
    mut wire_proto: T,
) {
    while let Some(message) = out_rx.recv().await {
        log::trace!("sending message {message} to peer {remote_peer_id}");
        if let Err(e) = wire_proto.send(message).await {
            log::trace!("sending to peer {remote_peer_id} failed: {e}");
            break;
        }
    }
}

impl PeerSession {
    /// Bitfield exchange and initial declarations, in fixed order: our
    /// bitfield out, their bitfield in (anything else is a protocol error),
    /// initial interest, scheduler registration, and a proactive completion
    /// announcement when we already hold the whole file.
    async fn setup(&mut self, read: &mut ReadHalf<TcpStream>) -> Result<()> {
        self.send(Message::Bitfield(self.piece_store.bitmap())).await?;

        let bits = match read.receive(Phase::Setup).await? {
            Message::Bitfield(bits) => bits,
            other => bail!(WireError::Framing(format!("expected bitfield, got {other}"))),
        };
        let num_pieces = self.piece_store.num_pieces();
        if bits.len() < num_pieces {
            bail!(WireError::Framing(format!(
                "bitfield too short: {} bits for {num_pieces} pieces",
                bits.len()
            )));
        }
        // the bitfield is byte aligned and can carry more bits than pieces
        self.remote_bitfield = Some(bits[0..num_pieces].to_vec());

        self.send_interest().await?;
        self.scheduler
            .register_peer(self.remote_peer_id, self.out_tx.clone());
        if self.piece_store.is_complete() {
            self.send(Message::PeerCompleted(self.own_peer_id)).await?;
        }
        Ok(())
    }

    async fn handle_message(&mut self, message: Message) -> Result<()> {
        log::trace!(
            "received message from peer {}: {message}",
            self.remote_peer_id
        );
        match message {
            Message::Choke => {
                self.scheduler.set_choked(self.remote_peer_id, true);
                // a choking peer discards requests in flight
                self.outstanding_request = None;
            }
            Message::Unchoke => {
                self.scheduler.set_choked(self.remote_peer_id, false);
                if !self.piece_store.is_complete() && self.outstanding_request.is_none() {
                    self.request_next_piece().await?;
                }
            }
            Message::Interested => self.scheduler.set_interested(self.remote_peer_id, true),
            Message::NotInterested => self.scheduler.set_interested(self.remote_peer_id, false),
            Message::Have(piece_idx) => self.handle_have(piece_idx).await?,
            Message::Request(piece_idx) => self.handle_request(piece_idx).await?,
            Message::Piece(piece_idx, data) => self.handle_piece(piece_idx, data).await?,
            Message::PeerCompleted(peer_id) => self.scheduler.mark_completed(peer_id),
            Message::Bitfield(_) => {
                log::warn!(
                    "ignoring bitfield from peer {} outside session setup",
                    self.remote_peer_id
                );
            }
            Message::Unknown(type_code) => {
                log::debug!(
                    "ignoring unknown message type {type_code} from peer {}",
                    self.remote_peer_id
                );
            }
        }
        Ok(())
    }

    async fn handle_have(&mut self, piece_idx: u32) -> Result<()> {
        let num_pieces = self.piece_store.num_pieces();
        let remote = self
            .remote_bitfield
            .get_or_insert_with(|| vec![false; num_pieces]);
        if (piece_idx as usize) >= remote.len() {
            log::warn!(
                "got have {piece_idx} from peer {} but there are only {num_pieces} pieces",
                self.remote_peer_id
            );
            return Ok(());
        }
        remote[piece_idx as usize] = true;
        self.send_interest().await
    }

    async fn handle_request(&mut self, piece_idx: u32) -> Result<()> {
        if self.scheduler.is_choked(self.remote_peer_id) {
            // no rejection message exists in this protocol
            log::trace!(
                "ignoring request for piece {piece_idx} from choked peer {}",
                self.remote_peer_id
            );
            return Ok(());
        }
        match self.piece_store.piece_bytes(piece_idx as usize) {
            Ok(data) => self.send(Message::Piece(piece_idx, data)).await,
            Err(e) => {
                // the request stays unanswered, the peer re-requests on its own
                log::error!(
                    "could not read piece {piece_idx} for peer {}: {e}",
                    self.remote_peer_id
                );
                Ok(())
            }
        }
    }

    async fn handle_piece(&mut self, piece_idx: u32, data: Vec<u8>) -> Result<()> {
        self.outstanding_request = None;
        self.scheduler
            .record_download(self.remote_peer_id, data.len() as u64);
        let became_complete = match self.piece_store.store_piece(piece_idx as usize, &data) {
            Ok(became_complete) => became_complete,
            Err(e) => {
                log::error!(
                    "could not persist piece {piece_idx} from peer {}: {e}",
                    self.remote_peer_id
                );
                false
            }
        };
        self.scheduler.broadcast_have(piece_idx).await;

        if became_complete && !self.completion_signalled {
            self.completion_signalled = true;
            if let Err(e) = self.announce_completion().await {
                // never tear the session down from the completion path
                log::error!("completion announcement failed: {e}");
            }
        } else if !self.piece_store.is_complete() {
            // self-clocking pull: every piece answers with the next request,
            // until completion or the remote has nothing left to offer
            self.request_next_piece().await?;
        }
        Ok(())
    }

    async fn announce_completion(&mut self) -> Result<()> {
        self.send(Message::NotInterested).await?;
        if self.piece_store.verify_file_hash() {
            log::info!("peer {}: file complete, digest verified", self.own_peer_id);
        } else {
            log::warn!(
                "peer {}: file complete but digest verification failed",
                self.own_peer_id
            );
        }
        self.scheduler.mark_completed(self.own_peer_id);
        self.scheduler
            .broadcast_peer_completed(self.own_peer_id)
            .await;
        Ok(())
    }

    /// One request in flight at a time, always for the lowest missing piece
    /// the remote can serve.
    async fn request_next_piece(&mut self) -> Result<()> {
        if let Some(remote) = &self.remote_bitfield {
            if let Some(piece_idx) = next_wanted_piece(&self.piece_store.bitmap(), remote) {
                self.outstanding_request = Some(piece_idx);
                self.send(Message::Request(piece_idx)).await?;
            }
        }
        Ok(())
    }

    /// Interested iff the remote holds a piece we lack; once our store is
    /// complete we declare NOT_INTERESTED no matter what the remote holds.
    async fn send_interest(&mut self) -> Result<()> {
        let interested = !self.piece_store.is_complete()
            && self
                .remote_bitfield
                .as_ref()
                .map_or(false, |remote| {
                    wants_remote_pieces(&self.piece_store.bitmap(), remote)
                });
        let message = if interested {
            Message::Interested
        } else {
            Message::NotInterested
        };
        self.send(message).await
    }

    async fn send(&self, message: Message) -> Result<()> {
        self.out_tx
            .send(message)
            .await
            .map_err(|_| anyhow!("output channel to peer {} is closed", self.remote_peer_id))
    }
}

fn wants_remote_pieces(local: &[bool], remote: &[bool]) -> bool {
    next_wanted_piece(local, remote).is_some()
}

/// Lowest index missing locally and present remotely.
fn next_wanted_piece(local: &[bool], remote: &[bool]) -> Option<u32> {
    local
        .iter()
        .zip(remote.iter())
        .position(|(have, remote_has)| !*have && *remote_has)
        .map(|piece_idx| piece_idx as u32)
}

fn addr_or_unknown(stream: &TcpStream) -> String {
    match stream.peer_addr() {
        Ok(addr) => addr.to_string(),
        Err(_) => "<unknown>".to_string(),
    }
}

/// Socket-closed/reset conditions are expected teardown noise and get
/// quieter logging than real protocol failures.
fn is_connection_closed(e: &anyhow::Error) -> bool {
    e.chain().any(|cause| {
        cause
            .downcast_ref::<std::io::Error>()
            .map_or(false, |io_err| {
                matches!(
                    io_err.kind(),
                    std::io::ErrorKind::UnexpectedEof
                        | std::io::ErrorKind::ConnectionReset
                        | std::io::ErrorKind::ConnectionAborted
                        | std::io::ErrorKind::BrokenPipe
                )
            })
    })
}

#[cfg(test)]
mod tests {
    use std::env;
    use std::fs;
    use std::path::PathBuf;
    use std::time::Duration;

    use super::*;

    #[test]
    fn picks_lowest_missing_piece_the_remote_has() {
        let local = vec![true, false, true];
        let remote = vec![true, true, false];
        assert!(wants_remote_pieces(&local, &remote));
        assert_eq!(next_wanted_piece(&local, &remote), Some(1));
    }

    #[test]
    fn wants_nothing_from_a_remote_with_nothing_new() {
        let local = vec![true, false, true];
        let remote = vec![true, false, true];
        assert!(!wants_remote_pieces(&local, &remote));
        assert_eq!(next_wanted_piece(&local, &remote), None);
    }

    #[test]
    fn final_piece_is_selectable() {
        let local = vec![true, true, false];
        let remote = vec![false, false, true];
        assert_eq!(next_wanted_piece(&local, &remote), Some(2));
    }

    fn test_base(name: &str) -> PathBuf {
        let base = env::temp_dir().join(format!("fileswarm_session_{name}_{}", std::process::id()));
        let _ = fs::remove_dir_all(&base);
        base
    }

    fn test_session(
        name: &str,
        has_full_file: bool,
        remote_bitfield: Option<Vec<bool>>,
    ) -> (PeerSession, Receiver<Message>) {
        let piece_store = Arc::new(PieceStore::new(
            &test_base(name),
            1001,
            "shared.dat",
            12,
            4,
            has_full_file,
            None,
        ));
        let scheduler = Arc::new(ChokeScheduler::new(
            2,
            Duration::from_secs(5),
            Duration::from_secs(15),
            &[1001, 1002],
        ));
        let (out_tx, out_rx) = mpsc::channel(16);
        let session = PeerSession {
            own_peer_id: 1001,
            remote_peer_id: 1002,
            piece_store,
            scheduler,
            remote_bitfield,
            outstanding_request: None,
            completion_signalled: false,
            out_tx,
        };
        (session, out_rx)
    }

    #[tokio::test]
    async fn declares_interest_when_the_remote_has_a_missing_piece() {
        let (mut session, mut out_rx) =
            test_session("interest", false, Some(vec![true, true, false]));
        session.piece_store.store_piece(0, b"aaaa").unwrap();
        session.send_interest().await.unwrap();
        assert_eq!(out_rx.try_recv().unwrap(), Message::Interested);
    }

    #[tokio::test]
    async fn complete_store_is_never_interested() {
        let (mut session, mut out_rx) =
            test_session("complete", true, Some(vec![true, true, true]));
        session.send_interest().await.unwrap();
        assert_eq!(out_rx.try_recv().unwrap(), Message::NotInterested);
    }

    #[tokio::test]
    async fn requests_from_choked_peers_are_ignored() {
        let (mut session, mut out_rx) = test_session("choked_request", true, None);
        session
            .scheduler
            .register_peer(1002, session.out_tx.clone());
        session.handle_message(Message::Request(0)).await.unwrap();
        assert!(out_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn requests_are_served_once_unchoked() {
        let (mut session, mut out_rx) = test_session("served_request", false, None);
        session.piece_store.store_piece(1, b"bbbb").unwrap();
        session
            .scheduler
            .register_peer(1002, session.out_tx.clone());
        session.scheduler.set_choked(1002, false);
        session.handle_message(Message::Request(1)).await.unwrap();
        assert_eq!(
            out_rx.try_recv().unwrap(),
            Message::Piece(1, b"bbbb".to_vec())
        );
    }

    #[tokio::test]
    async fn have_allocates_a_bitfield_and_recomputes_interest() {
        let (mut session, mut out_rx) = test_session("have", false, None);
        session.handle_message(Message::Have(2)).await.unwrap();
        assert_eq!(
            session.remote_bitfield,
            Some(vec![false, false, true])
        );
        assert_eq!(out_rx.try_recv().unwrap(), Message::Interested);
    }

    #[tokio::test]
    async fn unchoke_triggers_the_lowest_missing_request() {
        let (mut session, mut out_rx) =
            test_session("unchoke", false, Some(vec![true, true, true]));
        session
            .scheduler
            .register_peer(1002, session.out_tx.clone());
        session.handle_message(Message::Unchoke).await.unwrap();
        assert_eq!(out_rx.try_recv().unwrap(), Message::Request(0));
        assert_eq!(session.outstanding_request, Some(0));

        // a second unchoke while a request is in flight stays quiet
        session.handle_message(Message::Unchoke).await.unwrap();
        assert!(out_rx.try_recv().is_err());

        // a choke discards the in-flight request
        session.handle_message(Message::Choke).await.unwrap();
        assert_eq!(session.outstanding_request, None);
    }
}
