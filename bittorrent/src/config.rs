use std::{
    net::{Ipv4Addr, SocketAddr}, 
    path::PathBuf, 
    time::Duration
};

#[derive(Debug, Clone)]
pub struct TorrentConfig {

    pub output_dir: PathBuf,

    pub listen_address: SocketAddr,

    // Re-announce cadence when the tracker doesn't dictate one itself.
    pub announce_interval: Duration,

    pub min_max_peers: (u32, u32),

    // How long a request may go unanswered before the coordinator's
    // timeout sweeper returns it to the queue.
    pub request_timeout: Duration,

    // Send-idle duration after which a peer session emits a keep-alive.
    pub keep_alive_interval: Duration,

    // Cadence of the request queue filler.
    pub queue_refill_interval: Duration,

    // Declarative, informative-only rate caps (bytes/s). Never enforced by
    // the request pipeline or piece manager.
    pub max_download: Option<u64>,

    pub max_upload: Option<u64>,

    pub role: Role,

}

use crate::torrent::Role;

impl Default for TorrentConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("downloads"),
            listen_address: SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 6881),
            announce_interval: Duration::from_secs(1800),
            min_max_peers: (5, 100),
            request_timeout: Duration::from_secs(30),
            keep_alive_interval: Duration::from_secs(120),
            queue_refill_interval: Duration::from_secs(5),
            max_download: None,
            max_upload: None,
            role: Role::Leecher,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {

    pub client_id: [u8; 20],

}

const DEFAULT_CLIENT_ID: [u8; 20] = *b"-PC0001-000000000000";

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_id: DEFAULT_CLIENT_ID,
        }
    }
}

impl ClientConfig {
    // Generates a fresh per-process peer id: "-PC0001-" followed by 12
    // random digits, as opposed to `Default`'s fixed placeholder.
    pub fn generate() -> Self {
        use rand::Rng;
        let mut id = DEFAULT_CLIENT_ID;
        let mut rng = rand::thread_rng();
        for byte in &mut id[8..20] {
            *byte = b'0' + rng.gen_range(0..10);
        }
        Self { client_id: id }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_client_id_has_standard_prefix() {
        let config = ClientConfig::generate();
        assert_eq!(&config.client_id[0..8], b"-PC0001-");
        assert!(config.client_id[8..20].iter().all(u8::is_ascii_digit));
    }
}