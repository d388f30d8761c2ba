use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap, HashSet},
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::{mpsc, Mutex};

use crate::{
    config::{ClientConfig, TorrentConfig},
    listener::Listener,
    metainfo::{MetaInfo, MetaInfoError},
    p2p::{state::SessionState, PeerCommand, PeerHandle},
    piece_manager::{PieceManager, PieceManagerError},
    stats::{PeerStats, PieceStats, ThroughputStats, TorrentStats},
    store::StoreInfo,
    tracker::{AnnounceParams, Event, TrackerClient},
    Bitfield,
};

#[derive(Debug, thiserror::Error)]
pub enum TorrentError {

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    PieceManager(#[from] PieceManagerError),

    #[error(transparent)]
    MetaInfo(#[from] MetaInfoError),

    #[error("seeding requested but on-disk content at {0} is missing or incomplete")]
    IncompleteSeedContent(std::path::PathBuf),

}

pub type Result<T> = std::result::Result<T, TorrentError>;

pub type TorrentTx = mpsc::UnboundedSender<CommandToTorrent>;
type TorrentRx = mpsc::UnboundedReceiver<CommandToTorrent>;

// Messages a peer session (or the coordinator itself) may send back to the
// torrent's own run loop - only the bits of state that only the run loop is
// allowed to touch (the peer map, per-peer stats snapshot) travel this way.
// Everything else a session needs lives on `CoordinatorHandle` directly.
pub enum CommandToTorrent {

    PeerDisconnected { address: SocketAddr },

    PieceVerified { index: usize, from: SocketAddr },

    PeerState { address: SocketAddr, state: SessionState },

}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Role {
    #[default]
    Leecher,
    Seeder,
}

struct QueueState {
    // Min-heap over (rank, piece_index); rank is the piece's position in the
    // rarest-first ordering at the time it was queued, used only to break
    // ties among pieces added in the same refill.
    heap: BinaryHeap<Reverse<(usize, usize)>>,
    queued: HashSet<usize>,
    pending: HashMap<usize, Instant>,
}

// Shared context every peer session holds an `Arc` to. Like `PieceManager`,
// this is touched directly by sessions rather than through a channel - the
// only channel in this design is the narrow one back to the torrent's own
// run loop for the handful of things that loop exclusively owns.
pub struct CoordinatorHandle {

    pub info_hash: [u8; 20],

    pub client_id: [u8; 20],

    pub piece_manager: Arc<PieceManager>,

    pub config: TorrentConfig,

    queue: Mutex<QueueState>,

    torrent_tx: TorrentTx,

}

impl CoordinatorHandle {

    // Pulls the current rarest-first ordering from the piece manager and
    // adds anything not already queued or in flight.
    pub async fn refill_queue(&self) {
        let missing = self.piece_manager.rarest_missing().await;
        let mut q = self.queue.lock().await;
        for (rank, index) in missing.into_iter().enumerate() {
            if !q.pending.contains_key(&index) && q.queued.insert(index) {
                q.heap.push(Reverse((rank, index)));
            }
        }
    }

    // Claims the rarest queued piece the given peer actually has and isn't
    // already claimed by someone else. Pieces the peer doesn't have are put
    // back for other sessions to consider.
    pub async fn next_queued_piece(&self, bitfield: &Bitfield) -> Option<usize> {
        let found = {
            let mut q = self.queue.lock().await;
            let mut skipped = Vec::new();
            let found = loop {
                match q.heap.pop() {
                    Some(Reverse((rank, index))) => {
                        if q.pending.contains_key(&index) {
                            continue;
                        }
                        if bitfield.get(index).map(|b| *b).unwrap_or(false) {
                            break Some(index);
                        }
                        skipped.push(Reverse((rank, index)));
                    }
                    None => break None,
                }
            };
            for entry in skipped {
                q.heap.push(entry);
            }
            if let Some(index) = found {
                q.queued.remove(&index);
                q.pending.insert(index, Instant::now());
            }
            found
            // `q` dropped here, before touching the piece manager's own lock.
        };
        if let Some(index) = found {
            self.piece_manager.mark_requested(index).await;
        }
        found
    }

    // Returns any request that has been outstanding for longer than
    // `timeout` to the queue and unmarks it on the piece manager, so another
    // peer can pick it up.
    pub async fn sweep_timeouts(&self, timeout: Duration) {
        let expired: Vec<usize> = {
            let mut q = self.queue.lock().await;
            let now = Instant::now();
            let expired: Vec<usize> = q.pending.iter()
                .filter(|(_, since)| now.saturating_duration_since(**since) >= timeout)
                .map(|(&index, _)| index)
                .collect();
            for &index in &expired {
                q.pending.remove(&index);
            }
            expired
            // `q` dropped here, before touching the piece manager's own lock.
        };

        for index in expired {
            self.piece_manager.unmark_requested(index).await;
            let rank = self.piece_manager.availability(index).await;

            let mut q = self.queue.lock().await;
            if q.queued.insert(index) {
                q.heap.push(Reverse((rank, index)));
            }
            drop(q);

            tracing::debug!(piece = index, rank, "request timed out, re-queued");
        }
    }

    async fn piece_verified(&self, index: usize) {
        self.queue.lock().await.pending.remove(&index);
    }

    pub async fn announce_piece_verified(&self, index: usize, from: SocketAddr) {
        self.piece_verified(index).await;
        let _ = self.torrent_tx.send(CommandToTorrent::PieceVerified { index, from });
    }

    pub async fn deregister(&self, address: SocketAddr) {
        let _ = self.torrent_tx.send(CommandToTorrent::PeerDisconnected { address });
    }

    pub async fn report_peer_state(&self, address: SocketAddr, state: SessionState) {
        let _ = self.torrent_tx.send(CommandToTorrent::PeerState { address, state });
    }
}

// A single torrent's swarm: the set of peer sessions, the trackers it
// announces to, and the background upkeep that keeps both fed.
pub struct Torrent {

    coordinator: Arc<CoordinatorHandle>,

    peers: HashMap<SocketAddr, PeerHandle>,

    peer_states: HashMap<SocketAddr, SessionState>,

    available: Vec<SocketAddr>,

    // Trackers ordered by tier, per BEP 12; within a tier, announce to the
    // first that answers and leave the rest as fallbacks.
    trackers: Vec<Vec<TrackerClient>>,

    torrent_rx: TorrentRx,

    role: Role,

    listen_address: SocketAddr,

    announce_interval: Duration,

    start_time: Option<Instant>,

    config: TorrentConfig,

}

impl Torrent {

    pub async fn new(metainfo: MetaInfo, client_config: ClientConfig, config: TorrentConfig) -> Result<Self> {
        let info_hash = metainfo.info_hash();
        let info = StoreInfo::new(&metainfo, config.output_dir.clone());
        let piece_manager = PieceManager::new(info, metainfo.piece_hashes());

        let trackers = metainfo.trackers()
            .into_iter()
            .map(|tier| tier.into_iter().map(TrackerClient::new).collect())
            .collect();

        let (torrent_tx, torrent_rx) = mpsc::unbounded_channel();

        let coordinator = Arc::new(CoordinatorHandle {
            info_hash,
            client_id: client_config.client_id,
            piece_manager,
            config: config.clone(),
            queue: Mutex::new(QueueState {
                heap: BinaryHeap::new(),
                queued: HashSet::new(),
                pending: HashMap::new(),
            }),
            torrent_tx,
        });

        Ok(Torrent {
            coordinator,
            peers: HashMap::new(),
            peer_states: HashMap::new(),
            available: Vec::new(),
            trackers,
            torrent_rx,
            role: config.role,
            listen_address: config.listen_address,
            announce_interval: config.announce_interval,
            start_time: None,
            config,
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub async fn stats(&self) -> TorrentStats {
        let bitfield = self.coordinator.piece_manager.get_bitfield().await;
        TorrentStats {
            start_time: self.start_time,
            time_elapsed: self.start_time.map(|t| t.elapsed()).unwrap_or_default(),
            role: self.role,
            piece_stats: PieceStats {
                num_pieces: bitfield.len(),
                num_pending: self.peers.len(),
                num_downloaded: bitfield.count_ones(),
            },
            peer_stats: self.peer_states.iter()
                .map(|(&address, &state)| PeerStats { address, state })
                .collect(),
            throughput: ThroughputStats::default(),
        }
    }

    #[tracing::instrument(skip_all, name = "torrent", fields(info_hash = %hex::encode(self.coordinator.info_hash)))]
    pub async fn start(&mut self) -> Result<()> {
        tracing::info!("starting torrent");
        self.start_time = Some(Instant::now());

        if self.role == Role::Seeder {
            self.coordinator.piece_manager.load_existing().await?;
            if !self.coordinator.piece_manager.is_complete().await {
                let output_dir = self.coordinator.piece_manager.info().output_dir.clone();
                return Err(TorrentError::IncompleteSeedContent(output_dir));
            }
        }

        let listener = Listener::bind(self.listen_address).await?;
        self.listen_address = listener.local_addr()?;
        tracing::info!("listening on {}", self.listen_address);

        self.announce(Some(Event::Started)).await;
        self.connect_to_peers();

        let result = self.run(listener).await;
        self.shutdown().await;
        result
    }

    async fn run(&mut self, listener: Listener) -> Result<()> {
        let mut queue_filler = tokio::time::interval(self.config.queue_refill_interval);
        let mut timeout_sweeper = tokio::time::interval(Duration::from_secs(10));
        let mut peer_connector = tokio::time::interval(Duration::from_secs(30));
        let mut reannounce = tokio::time::interval(self.announce_interval);
        queue_filler.tick().await;
        timeout_sweeper.tick().await;
        peer_connector.tick().await;
        reannounce.tick().await;

        loop {
            tokio::select! {

                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, address)) => self.accept_peer(address, stream),
                        Err(e) => tracing::warn!("inbound connection error: {}", e),
                    }
                }

                Some(cmd) = self.torrent_rx.recv() => {
                    match cmd {
                        CommandToTorrent::PeerDisconnected { address } => {
                            self.peers.remove(&address);
                            self.peer_states.remove(&address);
                        }
                        CommandToTorrent::PieceVerified { index, from } => {
                            self.broadcast_have(index, from);
                        }
                        CommandToTorrent::PeerState { address, state } => {
                            self.peer_states.insert(address, state);
                        }
                    }
                }

                _ = queue_filler.tick() => self.coordinator.refill_queue().await,

                _ = timeout_sweeper.tick() => self.coordinator.sweep_timeouts(self.config.request_timeout).await,

                _ = peer_connector.tick() => {
                    self.announce(None).await;
                    self.connect_to_peers();
                }

                _ = reannounce.tick() => self.announce(None).await,
            }

            if self.role == Role::Leecher && self.coordinator.piece_manager.is_complete().await {
                self.complete().await?;
                break;
            }
        }

        Ok(())
    }

    fn accept_peer(&mut self, address: SocketAddr, stream: tokio::net::TcpStream) {
        if self.peers.contains_key(&address) {
            return;
        }
        tracing::info!("accepted inbound connection from {}", address);
        let handle = PeerHandle::spawn(address, self.coordinator.clone(), Some(stream));
        self.peers.insert(address, handle);
    }

    fn connect_to_peers(&mut self) {
        let max_peers = self.config.min_max_peers.1 as usize;
        let slots = max_peers.saturating_sub(self.peers.len()).min(self.available.len());
        if slots == 0 {
            return;
        }
        tracing::info!("connecting to {} peers", slots);
        for address in self.available.drain(..slots).collect::<Vec<_>>() {
            if self.peers.contains_key(&address) {
                continue;
            }
            let handle = PeerHandle::spawn(address, self.coordinator.clone(), None);
            self.peers.insert(address, handle);
        }
    }

    fn broadcast_have(&self, index: usize, from: SocketAddr) {
        for (&address, peer) in self.peers.iter() {
            if address == from {
                continue;
            }
            let _ = peer.peer_tx.send(PeerCommand::PieceVerified(index));
        }
    }

    #[tracing::instrument(skip(self), fields(num_peers = self.peers.len() + self.available.len()))]
    async fn announce(&mut self, event: Option<Event>) {
        let downloaded = self.coordinator.piece_manager.downloaded().await;
        let uploaded = self.coordinator.piece_manager.uploaded().await;
        let total = self.coordinator.piece_manager.info().total_len;
        let left = total.saturating_sub(downloaded);

        let known: HashSet<SocketAddr> = self.peers.keys().copied().chain(self.available.iter().copied()).collect();

        for tier in self.trackers.iter_mut() {
            let mut tier_succeeded = false;
            for tracker in tier.iter_mut() {
                let params = AnnounceParams {
                    info_hash: self.coordinator.info_hash,
                    peer_id: self.coordinator.client_id,
                    port: self.listen_address.port(),
                    uploaded,
                    downloaded,
                    left,
                    event,
                };
                match tracker.announce(params).await {
                    Ok(resp) => {
                        if let Some(interval) = resp.interval {
                            self.announce_interval = interval;
                        }
                        self.available.extend(
                            resp.peers.into_iter().filter(|a| !known.contains(a) && *a != self.listen_address),
                        );
                        tier_succeeded = true;
                        break;
                    }
                    Err(e) => tracing::warn!("tracker {} announce error: {}", tracker.url(), e),
                }
            }
            if tier_succeeded {
                break;
            }
        }

        tracing::trace!("{} peers known after announce", self.peers.len() + self.available.len());
    }

    async fn complete(&mut self) -> Result<()> {
        tracing::info!("torrent download complete");
        let output_dir = self.coordinator.piece_manager.info().output_dir.clone();
        self.coordinator.piece_manager.reconstruct(&output_dir).await?;
        self.role = Role::Seeder;
        self.announce(Some(Event::Completed)).await;
        Ok(())
    }

    async fn shutdown(&mut self) {
        tracing::info!("shutting down, disconnecting {} peers", self.peers.len());
        for peer in self.peers.values() {
            let _ = peer.peer_tx.send(PeerCommand::Shutdown);
        }
        for (_, peer) in self.peers.drain() {
            if let Err(e) = peer.session_handle.await {
                tracing::warn!("peer task panicked: {}", e);
            }
        }
        self.announce(Some(Event::Stopped)).await;
    }
}

