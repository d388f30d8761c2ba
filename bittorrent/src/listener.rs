use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};

// Accepts inbound peer connections on the torrent's configured port. Kept as
// its own thin component so the coordinator's main loop doesn't need to know
// about socket setup.
pub struct Listener {
    inner: TcpListener,
}

impl Listener {
    pub async fn bind(address: SocketAddr) -> std::io::Result<Self> {
        let inner = TcpListener::bind(address).await?;
        Ok(Self { inner })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    pub async fn accept(&self) -> std::io::Result<(TcpStream, SocketAddr)> {
        self.inner.accept().await
    }
}
