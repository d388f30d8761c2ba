use std::{net::SocketAddr, sync::Arc};
use tokio::{net::TcpStream, sync::mpsc, task::JoinHandle};
use tracing::Instrument;

mod handshake;
mod message;
mod session;
pub mod state;

pub use handshake::{Handshake, HandshakeCodec, PROTOCOL};
pub use message::{Message, MessageCodec};
pub use session::PeerSession;

use crate::torrent::CoordinatorHandle;

pub type Result<T> = std::result::Result<T, PeerError>;
pub(crate) type PeerRx = mpsc::UnboundedReceiver<PeerCommand>;
pub type PeerTx = mpsc::UnboundedSender<PeerCommand>;

#[derive(thiserror::Error, Debug)]
pub enum PeerError {

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    PieceManager(#[from] crate::piece_manager::PieceManagerError),

    #[error("handshake sent an unexpected protocol string")]
    IncorrectProtocol,

    #[error("handshake info-hash does not match this torrent")]
    IncorrectInfoHash,

    #[error("peer closed the connection before completing the handshake")]
    NoHandshake,

    #[error("invalid message id: {0}")]
    InvalidMessageId(u8),

    #[error("invalid message")]
    InvalidMessage,

    #[error("timed out waiting on the peer")]
    Timeout,

    #[error("internal channel closed")]
    ChannelClosed,
}

impl<T> From<mpsc::error::SendError<T>> for PeerError {
    fn from(_: mpsc::error::SendError<T>) -> Self {
        PeerError::ChannelClosed
    }
}

// Commands delivered to a peer session from elsewhere in the process - only
// the coordinator's broadcast of a newly-verified piece and a shutdown
// signal; everything else a session needs (piece bytes, availability) it
// pulls directly off the shared piece manager.
pub enum PeerCommand {

    PieceVerified(usize),

    Shutdown,

}

pub struct PeerHandle {

    pub peer_tx: PeerTx,

    pub session_handle: JoinHandle<()>,

}

impl PeerHandle {
    // Spawns a session task. `socket` is `Some` for an inbound connection
    // that has already been accepted; `None` means the session dials out.
    pub fn spawn(address: SocketAddr, coordinator: Arc<CoordinatorHandle>, socket: Option<TcpStream>) -> Self {
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let session = PeerSession::new(address, coordinator, peer_rx, peer_tx.clone());

        let session_handle = tokio::spawn(
            async move {
                let mut session = session;
                if let Err(e) = session.run(socket).await {
                    tracing::warn!("session ended: {}", e);
                }
                session.disconnect().await;
            }
            .instrument(tracing::info_span!("peer", addr = %address)),
        );

        PeerHandle {
            peer_tx,
            session_handle,
        }
    }
}
