use std::{collections::HashSet, net::SocketAddr, sync::Arc, time::Instant};
use tokio::{net::TcpStream, time};
use tokio_util::codec::Framed;
use futures::{SinkExt, StreamExt, stream::SplitSink};
use crate::{
    block::{self, BlockData, BlockInfo},
    piece_manager::PeerId,
    torrent::CoordinatorHandle,
    Bitfield,
};
use super::{handshake::*, message::*, state::*, PeerCommand, PeerError, PeerRx, PeerTx, Result};

type MessageSink = SplitSink<Framed<TcpStream, MessageCodec>, Message>;

// Maximum number of blocks this session will have outstanding with the
// remote peer at once.
const MAX_OUTSTANDING_REQUESTS: usize = 5;

pub struct PeerSession {

    address: SocketAddr,

    coordinator: Arc<CoordinatorHandle>,

    peer_rx: PeerRx,

    peer_tx: PeerTx,

    remote_peer_id: Option<PeerId>,

    // Pieces currently assigned to us by the coordinator's queue that we
    // haven't finished requesting blocks for yet.
    assigned_pieces: std::collections::VecDeque<usize>,

    // Outstanding block requests we've sent, by (piece, begin).
    requests_out: HashSet<(usize, usize)>,

    bitfield: Bitfield,

    state: SessionState,

    last_sent: Instant,

}

impl PeerSession {
    pub fn new(address: SocketAddr, coordinator: Arc<CoordinatorHandle>, peer_rx: PeerRx, peer_tx: PeerTx) -> Self {
        let bitfield = Bitfield::repeat(false, coordinator.piece_manager.info().num_pieces as usize);
        Self {
            address,
            coordinator,
            peer_rx,
            peer_tx,
            remote_peer_id: None,
            assigned_pieces: std::collections::VecDeque::new(),
            requests_out: HashSet::new(),
            bitfield,
            state: SessionState::default(),
            last_sent: Instant::now(),
        }
    }

    #[tracing::instrument(name = "session", skip(self, inbound_stream), fields(address = %self.address))]
    pub async fn run(&mut self, inbound_stream: Option<TcpStream>) -> Result<()> {
        self.state.update(|s| s.conn_state = ConnState::Connecting);
        let inbound = inbound_stream.is_some();

        let mut handshake_socket = if let Some(stream) = inbound_stream {
            Framed::new(stream, HandshakeCodec)
        } else {
            let stream = time::timeout(time::Duration::from_secs(10), TcpStream::connect(self.address))
                .await
                .map_err(|_| PeerError::Timeout)??;
            tracing::trace!("outbound connection established");
            Framed::new(stream, HandshakeCodec)
        };

        self.exchange_handshake(&mut handshake_socket, inbound).await?;

        let socket = Framed::new(handshake_socket.into_inner(), MessageCodec);
        self.message_loop(socket).await
    }

    pub async fn disconnect(&mut self) {
        if let Some(peer_id) = self.remote_peer_id {
            self.coordinator.piece_manager.forget_peer(peer_id).await;
        }
        for &(piece, _) in &self.requests_out {
            self.coordinator.piece_manager.unmark_requested(piece).await;
        }
        self.coordinator.deregister(self.address).await;
        self.state.update(|s| *s = SessionState::default());
    }

    async fn exchange_handshake(&mut self, socket: &mut Framed<TcpStream, HandshakeCodec>, inbound: bool) -> Result<()> {
        self.state.update(|s| s.conn_state = ConnState::Handshaking);
        let handshake = Handshake::new(self.coordinator.info_hash, self.coordinator.client_id);

        if !inbound {
            tracing::debug!("send handshake");
            socket.send(handshake).await?;
        }

        let Some(Ok(peer_handshake)) = socket.next().await else {
            return Err(PeerError::NoHandshake);
        };
        tracing::debug!("read handshake");

        if peer_handshake.protocol != PROTOCOL {
            return Err(PeerError::IncorrectProtocol);
        }
        if peer_handshake.info_hash != self.coordinator.info_hash {
            return Err(PeerError::IncorrectInfoHash);
        }
        self.remote_peer_id = Some(peer_handshake.peer_id);

        if inbound {
            tracing::debug!("send handshake");
            socket.send(Handshake::new(self.coordinator.info_hash, self.coordinator.client_id)).await?;
        }

        tracing::info!("handshake complete, peer connected");
        Ok(())
    }

    async fn message_loop(&mut self, socket: Framed<TcpStream, MessageCodec>) -> Result<()> {
        self.state.connect_time = Some(Instant::now());
        self.state.update(|s| s.conn_state = ConnState::Introducing);

        let (mut sink, mut stream) = socket.split();
        self.send_message(&mut sink, Message::Bitfield(self.coordinator.piece_manager.get_bitfield().await)).await?;

        let mut ticker = time::interval(time::Duration::from_secs(1));
        let read_deadline = self.coordinator.config.request_timeout.max(time::Duration::from_secs(30));

        loop {
            tokio::select! {
                frame = time::timeout(read_deadline, stream.next()) => {
                    match frame {
                        Ok(Some(Ok(msg))) => self.handle_message(&mut sink, msg).await?,
                        Ok(Some(Err(e))) => return Err(e),
                        Ok(None) => {
                            tracing::info!("peer closed the connection");
                            return Ok(());
                        }
                        Err(_) => {
                            tracing::warn!("read deadline elapsed");
                            return Err(PeerError::Timeout);
                        }
                    }
                }

                Some(cmd) = self.peer_rx.recv() => {
                    match cmd {
                        PeerCommand::PieceVerified(idx) => self.handle_piece_verified(&mut sink, idx).await?,
                        PeerCommand::Shutdown => {
                            tracing::info!("session shutdown requested");
                            return Ok(());
                        }
                    }
                }

                t = ticker.tick() => self.tick(&mut sink, t.into_std()).await?,
            }
        }
    }

    #[inline(always)]
    async fn send_message(&mut self, sink: &mut MessageSink, msg: Message) -> Result<()> {
        tracing::trace!("send: {}", msg);
        self.last_sent = Instant::now();
        sink.send(msg).await
    }

    async fn handle_message(&mut self, sink: &mut MessageSink, msg: Message) -> Result<()> {
        tracing::trace!("recv: {}", msg);

        match msg {
            Message::Bitfield(bitfield) => {
                if self.state.conn_state != ConnState::Introducing {
                    // A bitfield arriving after the first non-handshake message is
                    // late; per spec.md §4.3 it is ignored, not a protocol error.
                    tracing::trace!("ignoring late bitfield");
                } else {
                    self.handle_bitfield(sink, bitfield).await?;
                }
            }

            Message::KeepAlive => {}

            Message::Choke => {
                if !self.state.peer_choking {
                    self.state.peer_choking = true;
                    self.free_outstanding_requests().await;
                }
            }

            Message::Unchoke => {
                if self.state.peer_choking {
                    self.state.peer_choking = false;
                    self.fill_request_pipeline(sink).await?;
                }
            }

            Message::Interested => {
                if !self.state.peer_interested {
                    self.state.peer_interested = true;
                }
                self.reapply_choking_policy(sink).await?;
            }

            Message::NotInterested => {
                self.state.peer_interested = false;
                self.reapply_choking_policy(sink).await?;
            }

            Message::Have { idx } => self.handle_have(sink, idx).await?,

            Message::Request(block) => self.handle_request(sink, block).await?,

            Message::Block(block) => {
                self.handle_block(block).await?;
                self.fill_request_pipeline(sink).await?;
            }

            Message::Cancel(_) => {
                // No scheduled-send bookkeeping to cancel in this core.
            }

            Message::Port { .. } => {
                // DHT listen-port advertisement; this core doesn't implement DHT.
            }
        }

        if self.state.conn_state == ConnState::Introducing {
            self.state.update(|s| s.conn_state = ConnState::Connected);
        }

        Ok(())
    }

    async fn handle_bitfield(&mut self, sink: &mut MessageSink, mut bitfield: Bitfield) -> Result<()> {
        let num_pieces = self.coordinator.piece_manager.info().num_pieces as usize;
        bitfield.resize(num_pieces, false);
        tracing::info!("peer has {}/{} pieces", bitfield.count_ones(), num_pieces);

        if let Some(peer_id) = self.remote_peer_id {
            self.coordinator.piece_manager.observe_bitfield(peer_id, &bitfield).await;
        }
        self.state.update(|s| s.num_pieces = bitfield.count_ones());
        self.bitfield = bitfield;
        self.recompute_interest(sink).await
    }

    async fn handle_have(&mut self, sink: &mut MessageSink, idx: u32) -> Result<()> {
        let idx = idx as usize;
        if idx >= self.bitfield.len() {
            return Err(PeerError::InvalidMessage);
        }
        if !self.bitfield[idx] {
            self.bitfield.set(idx, true);
            self.state.update(|s| s.num_pieces += 1);
            if let Some(peer_id) = self.remote_peer_id {
                self.coordinator.piece_manager.observe_have(peer_id, idx).await;
            }
        }
        self.recompute_interest(sink).await
    }

    async fn handle_block(&mut self, data: BlockData) -> Result<()> {
        let key = (data.piece_idx, data.offset);
        if !self.requests_out.remove(&key) {
            tracing::warn!("unrequested block: piece {} begin {}", data.piece_idx, data.offset);
            return Ok(());
        }

        let block_len = data.data.len() as u64;
        let verified = self.coordinator.piece_manager.submit_block(data.piece_idx, data.offset, data.data).await?;
        self.state.update(|state| state.throughput.down += block_len);
        if verified {
            self.assigned_pieces.retain(|&p| p != data.piece_idx);
            self.coordinator.announce_piece_verified(data.piece_idx, self.address).await;
        }
        Ok(())
    }

    async fn handle_request(&mut self, sink: &mut MessageSink, request: BlockInfo) -> Result<()> {
        if self.state.am_choking {
            tracing::debug!("ignoring request while choking peer");
            return Ok(());
        }
        let Some(block) = self.coordinator.piece_manager.read_block(request.piece_idx, request.offset, request.len).await? else {
            tracing::debug!("ignoring request for unverified piece {}", request.piece_idx);
            return Ok(());
        };
        self.state.update(|state| state.throughput.up += block.len() as u64);
        self.send_message(sink, Message::Block(BlockData {
            piece_idx: request.piece_idx,
            offset: request.offset,
            data: block,
        })).await
    }

    // Broadcast from the coordinator that some piece (possibly requested by
    // this session, possibly not) has become verified.
    async fn handle_piece_verified(&mut self, sink: &mut MessageSink, idx: usize) -> Result<()> {
        if !self.bitfield[idx] {
            self.send_message(sink, Message::Have { idx: idx as u32 }).await?;
        }
        self.requests_out.retain(|&(p, _)| p != idx);
        self.recompute_interest(sink).await
    }

    // Pull piece indices from the coordinator's request queue and issue
    // block requests for them until the outstanding-request cap is hit.
    async fn fill_request_pipeline(&mut self, sink: &mut MessageSink) -> Result<()> {
        if !self.state.am_interested || self.state.peer_choking {
            return Ok(());
        }

        while self.requests_out.len() < MAX_OUTSTANDING_REQUESTS {
            if self.assigned_pieces.is_empty() {
                match self.coordinator.next_queued_piece(&self.bitfield).await {
                    Some(idx) => self.assigned_pieces.push_back(idx),
                    None => break,
                }
            }

            let Some(&piece_idx) = self.assigned_pieces.front() else { break };
            let piece_len = self.coordinator.piece_manager.info().piece_length(piece_idx);
            let num_blocks = block::num_blocks(piece_len) as usize;

            let next_begin = (0..num_blocks)
                .map(|b| b * crate::BLOCK_SIZE)
                .find(|&begin| !self.requests_out.contains(&(piece_idx, begin)));

            let Some(begin) = next_begin else {
                // Every block of this piece has been requested; move on.
                self.assigned_pieces.pop_front();
                continue;
            };

            let len = block::block_len(piece_len, begin / crate::BLOCK_SIZE);
            self.requests_out.insert((piece_idx, begin));
            self.coordinator.piece_manager.mark_requested(piece_idx).await;
            self.send_message(sink, Message::Request(BlockInfo { piece_idx, offset: begin, len })).await?;

            if begin + len >= piece_len {
                self.assigned_pieces.pop_front();
            }
        }

        Ok(())
    }

    async fn free_outstanding_requests(&mut self) {
        for (piece, _) in self.requests_out.drain() {
            self.coordinator.piece_manager.unmark_requested(piece).await;
        }
        self.assigned_pieces.clear();
    }

    // Unchoke any peer that has declared interest; choke peers that have
    // declared not-interested. No slot limit, per spec.md's simplified
    // choking policy.
    async fn reapply_choking_policy(&mut self, sink: &mut MessageSink) -> Result<()> {
        if self.state.peer_interested && self.state.am_choking {
            self.state.am_choking = false;
            self.send_message(sink, Message::Unchoke).await?;
        } else if !self.state.peer_interested && !self.state.am_choking {
            self.state.am_choking = true;
            self.send_message(sink, Message::Choke).await?;
        }
        Ok(())
    }

    async fn recompute_interest(&mut self, sink: &mut MessageSink) -> Result<()> {
        let own_bitfield = self.coordinator.piece_manager.get_bitfield().await;
        let interested = self.bitfield.iter_ones().any(|i| !own_bitfield[i]);

        if interested && !self.state.am_interested {
            self.state.am_interested = true;
            self.send_message(sink, Message::Interested).await?;
            if !self.state.peer_choking {
                self.fill_request_pipeline(sink).await?;
            }
        } else if !interested && self.state.am_interested {
            self.state.am_interested = false;
            self.send_message(sink, Message::NotInterested).await?;
        }
        Ok(())
    }

    async fn tick(&mut self, sink: &mut MessageSink, now: Instant) -> Result<()> {
        let connect_time = self.state.connect_time.unwrap_or(now);

        if !self.state.am_interested && !self.state.peer_interested
            && now.saturating_duration_since(connect_time) >= time::Duration::from_secs(30)
        {
            tracing::info!("disconnecting idle peer");
            return Err(PeerError::Timeout);
        }

        if self.state.changed {
            self.coordinator.report_peer_state(self.address, self.state).await;
        }
        self.state.tick();

        if now.saturating_duration_since(self.last_sent) >= self.coordinator.config.keep_alive_interval {
            self.send_message(sink, Message::KeepAlive).await?;
        }

        Ok(())
    }
}
