use std::time::Instant;
use crate::stats::ThroughputStats;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ConnState {
    Connecting,
    Handshaking,
    // Bitfields have not yet been exchanged.
    Introducing,
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, Copy)]
pub struct SessionState {

    pub conn_state: ConnState,

    // Whether we are serving the peer's requests.
    pub am_choking: bool,

    // Whether we want to request blocks from the peer.
    pub am_interested: bool,

    // Whether the peer is serving our requests.
    pub peer_choking: bool,

    // Whether the peer wants to request blocks from us.
    pub peer_interested: bool,

    pub throughput: ThroughputStats,

    pub num_pieces: usize,

    pub connect_time: Option<Instant>,

    pub changed: bool,

}

impl Default for SessionState {
    fn default() -> SessionState {
        SessionState {
            conn_state: ConnState::Disconnected,
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            throughput: ThroughputStats::default(),
            num_pieces: 0,
            connect_time: None,
            changed: false,
        }
    }
}

impl SessionState {
    pub fn tick(&mut self) {
        self.throughput.reset();
    }

    #[inline(always)]
    pub fn update(&mut self, f: impl FnOnce(&mut SessionState)) {
        f(self);
        self.changed = true;
    }
}
