use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rand::seq::IndexedRandom;
use size::{Size, Style};
use tokio::sync::{mpsc, watch};
use tokio::time;

use crate::swarm_protocol::wire_protocol::Message;

/// Bandwidth-allocation scheduler plus the completion barrier.
///
/// Owns per-peer choke and interest state, cumulative download counters and
/// every session's output sink. A dedicated loop periodically re-ranks
/// interested peers by download contribution, keeps the top K unchoked and
/// grants one extra slot to a randomly drawn "optimistic" peer so that cold
/// peers get a chance to prove themselves. The re-rank and the optimistic
/// re-roll run on two independently configured intervals.
///
/// The registry and the barrier share one lock, separate from the piece
/// store's, and the lock is never held across an await.
pub struct ChokeScheduler {
    preferred_count: usize,
    unchoke_interval: Duration,
    optimistic_unchoke_interval: Duration,
    inner: Mutex<Registry>,
    shutdown_tx: watch::Sender<bool>,
}

struct Registry {
    peers: HashMap<u32, PeerEntry>,
    preferred: HashSet<u32>,
    optimistic: Option<u32>,
    completed: HashMap<u32, bool>,
    shutdown_fired: bool,
}

struct PeerEntry {
    choked: bool,
    interested: bool,
    downloaded_bytes: u64,
    out_tx: mpsc::Sender<Message>,
}

impl ChokeScheduler {
    pub fn new(
        preferred_count: usize,
        unchoke_interval: Duration,
        optimistic_unchoke_interval: Duration,
        tracked_peers: &[u32],
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        ChokeScheduler {
            preferred_count,
            unchoke_interval,
            optimistic_unchoke_interval,
            inner: Mutex::new(Registry {
                peers: HashMap::new(),
                preferred: HashSet::new(),
                optimistic: None,
                completed: tracked_peers.iter().map(|id| (*id, false)).collect(),
                shutdown_fired: false,
            }),
            shutdown_tx,
        }
    }

    /// Fires once, when every tracked peer has reported completion.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Idempotent; the first registration wins, later ones are ignored.
    pub fn register_peer(&self, peer_id: u32, out_tx: mpsc::Sender<Message>) {
        let mut registry = self.lock();
        if registry.peers.contains_key(&peer_id) {
            log::debug!("peer {peer_id} is already registered, keeping the first registration");
            return;
        }
        registry.peers.insert(
            peer_id,
            PeerEntry {
                choked: true,
                interested: false,
                downloaded_bytes: 0,
                out_tx,
            },
        );
    }

    pub fn set_choked(&self, peer_id: u32, choked: bool) {
        if let Some(entry) = self.lock().peers.get_mut(&peer_id) {
            entry.choked = choked;
        }
    }

    pub fn set_interested(&self, peer_id: u32, interested: bool) {
        if let Some(entry) = self.lock().peers.get_mut(&peer_id) {
            entry.interested = interested;
        }
    }

    /// Unregistered peers count as choked: never serve a peer we don't know.
    pub fn is_choked(&self, peer_id: u32) -> bool {
        self.lock()
            .peers
            .get(&peer_id)
            .map_or(true, |entry| entry.choked)
    }

    pub fn record_download(&self, peer_id: u32, bytes: u64) {
        if let Some(entry) = self.lock().peers.get_mut(&peer_id) {
            entry.downloaded_bytes += bytes;
        }
    }

    /// Best-effort HAVE to every registered peer; failures are logged only.
    pub async fn broadcast_have(&self, piece_idx: u32) {
        self.broadcast(Message::Have(piece_idx)).await;
    }

    /// Best-effort PEER_COMPLETED relay to every registered peer.
    pub async fn broadcast_peer_completed(&self, peer_id: u32) {
        self.broadcast(Message::PeerCompleted(peer_id)).await;
    }

    /// Flips the barrier entry for `peer_id`; entries never reset. When the
    /// last tracked entry flips, the shutdown signal fires exactly once.
    pub fn mark_completed(&self, peer_id: u32) {
        let mut registry = self.lock();
        match registry.completed.get_mut(&peer_id) {
            None => {
                log::warn!("completion report for untracked peer {peer_id}, ignoring");
                return;
            }
            Some(completed) => {
                if !*completed {
                    *completed = true;
                    let done = registry.completed.values().filter(|c| **c).count();
                    log::info!(
                        "peer {peer_id} has the complete file ({done}/{} peers done)",
                        registry.completed.len()
                    );
                }
            }
        }
        if registry.shutdown_fired || !registry.completed.values().all(|c| *c) {
            return;
        }
        registry.shutdown_fired = true;
        drop(registry);
        log::info!("every peer has the complete file, signalling shutdown");
        let _ = self.shutdown_tx.send(true);
    }

    /// The periodic scheduler loop. Runs until the shutdown signal fires.
    /// Output sinks stay open so in-flight completion notices can drain;
    /// the orchestrator owns socket teardown on its way out.
    pub async fn run(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut rerank_tick = time::interval(self.unchoke_interval);
        let mut optimistic_tick = time::interval(self.optimistic_unchoke_interval);
        loop {
            tokio::select! {
                _ = rerank_tick.tick() => {
                    self.recompute_preferred();
                    self.apply_choke_transitions().await;
                }
                _ = optimistic_tick.tick() => {
                    self.reroll_optimistic();
                    self.apply_choke_transitions().await;
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
        log::info!("choke scheduler stopped");
    }

    /// Re-ranks interested peers by download contribution and keeps the top K.
    fn recompute_preferred(&self) {
        let mut registry = self.lock();
        let candidates: Vec<(u32, u64)> = registry
            .peers
            .iter()
            .filter(|(_, entry)| entry.interested)
            .map(|(peer_id, entry)| (*peer_id, entry.downloaded_bytes))
            .collect();
        registry.preferred = rank_preferred(&candidates, self.preferred_count);

        let total_downloaded: u64 = registry
            .peers
            .values()
            .map(|entry| entry.downloaded_bytes)
            .sum();
        log::info!(
            "re-ranked {} interested peers: preferred {:?}, optimistic {:?}, downloaded so far: {}",
            candidates.len(),
            registry.preferred,
            registry.optimistic,
            Size::from_bytes(total_downloaded)
                .format()
                .with_style(Style::Abbreviated),
        );
    }

    /// Draws a fresh optimistic peer among interested, non-preferred peers.
    /// No stickiness: the previous pick gets no say in the new draw.
    fn reroll_optimistic(&self) {
        let mut registry = self.lock();
        let candidates: Vec<u32> = registry
            .peers
            .iter()
            .filter(|(peer_id, entry)| entry.interested && !registry.preferred.contains(peer_id))
            .map(|(peer_id, _)| *peer_id)
            .collect();
        registry.optimistic = candidates.choose(&mut rand::rng()).copied();
        if let Some(peer_id) = registry.optimistic {
            log::debug!("optimistically unchoking peer {peer_id}");
        }
    }

    /// Pushes UNCHOKE to every peer entering (preferred ∪ {optimistic}) and
    /// CHOKE to every peer leaving it, flipping the registry state as it goes.
    async fn apply_choke_transitions(&self) {
        let to_send = {
            let mut to_send = Vec::new();
            let mut registry = self.lock();
            let Registry {
                peers,
                preferred,
                optimistic,
                ..
            } = &mut *registry;
            for (peer_id, entry) in peers.iter_mut() {
                let unchoke = preferred.contains(peer_id) || *optimistic == Some(*peer_id);
                if unchoke && entry.choked {
                    entry.choked = false;
                    to_send.push((*peer_id, Message::Unchoke, entry.out_tx.clone()));
                } else if !unchoke && !entry.choked {
                    entry.choked = true;
                    to_send.push((*peer_id, Message::Choke, entry.out_tx.clone()));
                }
            }
            to_send
        };

        for (peer_id, message, out_tx) in to_send {
            log::debug!("sending {message} to peer {peer_id}");
            if let Err(e) = out_tx.send(message).await {
                // the session tears itself down, nothing to do here
                log::trace!("could not push choke transition to peer {peer_id}: {e}");
            }
        }
    }

    async fn broadcast(&self, message: Message) {
        let sinks: Vec<(u32, mpsc::Sender<Message>)> = self
            .lock()
            .peers
            .iter()
            .map(|(peer_id, entry)| (*peer_id, entry.out_tx.clone()))
            .collect();
        for (peer_id, out_tx) in sinks {
            if let Err(e) = out_tx.send(message.clone()).await {
                log::trace!("could not broadcast {message} to peer {peer_id}: {e}");
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.inner
            .lock()
            .expect("another user panicked while holding the lock")
    }
}

/// Top K by download contribution, descending; ties broken by ascending
/// peer id so a cycle's outcome is reproducible.
fn rank_preferred(candidates: &[(u32, u64)], preferred_count: usize) -> HashSet<u32> {
    let mut ranked = candidates.to_vec();
    ranked.sort_by(|(id_a, bytes_a), (id_b, bytes_b)| {
        bytes_b.cmp(bytes_a).then(id_a.cmp(id_b))
    });
    ranked
        .iter()
        .take(preferred_count)
        .map(|(peer_id, _)| *peer_id)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler(preferred_count: usize, tracked: &[u32]) -> ChokeScheduler {
        ChokeScheduler::new(
            preferred_count,
            Duration::from_secs(5),
            Duration::from_secs(15),
            tracked,
        )
    }

    #[test]
    fn ranking_is_deterministic() {
        let candidates = vec![(1001, 100), (1002, 50), (1003, 200), (1004, 10)];
        let preferred = rank_preferred(&candidates, 2);
        assert_eq!(preferred, HashSet::from([1003, 1001]));
    }

    #[test]
    fn ranking_breaks_ties_by_peer_id() {
        let candidates = vec![(1003, 50), (1001, 50), (1002, 50)];
        let preferred = rank_preferred(&candidates, 2);
        assert_eq!(preferred, HashSet::from([1001, 1002]));
    }

    #[test]
    fn unknown_peers_default_to_choked() {
        let scheduler = scheduler(2, &[1001]);
        assert!(scheduler.is_choked(9999));
        // setters on unknown ids are no-ops, not registrations
        scheduler.set_choked(9999, false);
        assert!(scheduler.is_choked(9999));
    }

    #[tokio::test]
    async fn first_registration_wins() {
        let scheduler = scheduler(1, &[1001]);
        let (tx_first, mut rx_first) = mpsc::channel(16);
        let (tx_second, mut rx_second) = mpsc::channel(16);
        scheduler.register_peer(1001, tx_first);
        scheduler.set_interested(1001, true);
        scheduler.register_peer(1001, tx_second);

        scheduler.recompute_preferred();
        scheduler.apply_choke_transitions().await;
        assert_eq!(rx_first.try_recv().unwrap(), Message::Unchoke);
        assert!(rx_second.try_recv().is_err());
    }

    #[tokio::test]
    async fn choke_transitions_follow_the_ranking() {
        let scheduler = scheduler(1, &[1001, 1002]);
        let (tx_a, mut rx_a) = mpsc::channel(16);
        let (tx_b, mut rx_b) = mpsc::channel(16);
        scheduler.register_peer(1001, tx_a);
        scheduler.register_peer(1002, tx_b);
        scheduler.set_interested(1001, true);
        scheduler.set_interested(1002, true);
        scheduler.record_download(1001, 500);

        scheduler.recompute_preferred();
        scheduler.apply_choke_transitions().await;
        assert_eq!(rx_a.try_recv().unwrap(), Message::Unchoke);
        assert!(rx_b.try_recv().is_err());
        assert!(!scheduler.is_choked(1001));
        assert!(scheduler.is_choked(1002));

        // the other peer overtakes; the old favorite gets choked again
        scheduler.record_download(1002, 9000);
        scheduler.recompute_preferred();
        scheduler.apply_choke_transitions().await;
        assert_eq!(rx_a.try_recv().unwrap(), Message::Choke);
        assert_eq!(rx_b.try_recv().unwrap(), Message::Unchoke);

        // a second pass with no change pushes nothing
        scheduler.recompute_preferred();
        scheduler.apply_choke_transitions().await;
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn optimistic_peer_is_drawn_outside_the_preferred_set() {
        let scheduler = scheduler(1, &[1001, 1002]);
        let (tx_a, mut rx_a) = mpsc::channel(16);
        let (tx_b, mut rx_b) = mpsc::channel(16);
        scheduler.register_peer(1001, tx_a);
        scheduler.register_peer(1002, tx_b);
        scheduler.set_interested(1001, true);
        scheduler.set_interested(1002, true);
        scheduler.record_download(1001, 500);

        scheduler.recompute_preferred();
        scheduler.reroll_optimistic();
        // 1001 is preferred, so 1002 is the only optimistic candidate
        assert_eq!(scheduler.lock().optimistic, Some(1002));
        scheduler.apply_choke_transitions().await;
        assert_eq!(rx_a.try_recv().unwrap(), Message::Unchoke);
        assert_eq!(rx_b.try_recv().unwrap(), Message::Unchoke);
    }

    #[tokio::test]
    async fn broadcasts_reach_every_registered_peer() {
        let scheduler = scheduler(2, &[1001, 1002]);
        let (tx_a, mut rx_a) = mpsc::channel(16);
        let (tx_b, mut rx_b) = mpsc::channel(16);
        scheduler.register_peer(1001, tx_a);
        scheduler.register_peer(1002, tx_b);

        scheduler.broadcast_have(3).await;
        assert_eq!(rx_a.try_recv().unwrap(), Message::Have(3));
        assert_eq!(rx_b.try_recv().unwrap(), Message::Have(3));

        scheduler.broadcast_peer_completed(1001).await;
        assert_eq!(rx_a.try_recv().unwrap(), Message::PeerCompleted(1001));
        assert_eq!(rx_b.try_recv().unwrap(), Message::PeerCompleted(1001));
    }

    #[test]
    fn completion_barrier_fires_exactly_once() {
        let scheduler = scheduler(2, &[1001, 1002, 1003]);
        let shutdown_rx = scheduler.shutdown_signal();

        scheduler.mark_completed(1001);
        scheduler.mark_completed(1002);
        assert!(!*shutdown_rx.borrow());
        // marking an already-completed peer changes nothing
        scheduler.mark_completed(1002);
        assert!(!*shutdown_rx.borrow());

        scheduler.mark_completed(1003);
        assert!(*shutdown_rx.borrow());

        // the signal does not fire a second time
        let mut shutdown_rx = shutdown_rx;
        assert!(shutdown_rx.has_changed().unwrap());
        shutdown_rx.mark_unchanged();
        scheduler.mark_completed(1003);
        assert!(!shutdown_rx.has_changed().unwrap());
    }

    #[test]
    fn untracked_completions_are_ignored() {
        let scheduler = scheduler(2, &[1001]);
        let shutdown_rx = scheduler.shutdown_signal();
        scheduler.mark_completed(4242);
        assert!(!*shutdown_rx.borrow());
    }
}
