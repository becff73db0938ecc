use anyhow::Context;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{trace, warn};

/// Outgoing side of a transmitter socket: media datagrams, retransmissions, retry NAKs and
///  membership replies all leave through this, and tests replace it with a mock.
///
/// A failed send is logged and otherwise ignored. Receivers notice the missing sequence
///  number and ask for a retransmission.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SendSocket: Send + Sync + 'static {
    async fn send_datagram(&self, to: SocketAddr, datagram: &[u8]);

    /// The address receivers send retry requests and membership messages to
    fn local_addr(&self) -> SocketAddr;
}

/// A bound UDP socket shared between a sender and the task that reads requests from it
pub struct TrtpSocket {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
}

impl TrtpSocket {
    pub fn new(socket: Arc<UdpSocket>) -> anyhow::Result<TrtpSocket> {
        let local_addr = socket.local_addr()
            .context("transmitter socket has no local address")?;
        Ok(TrtpSocket { socket, local_addr })
    }
}

#[async_trait]
impl SendSocket for TrtpSocket {
    async fn send_datagram(&self, to: SocketAddr, datagram: &[u8]) {
        trace!("{:?}: sending {} bytes to {:?}", self.local_addr, datagram.len(), to);

        if let Err(e) = self.socket.send_to(datagram, to).await {
            warn!("{:?}: error sending datagram to {:?}: {}", self.local_addr, to, e);
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}
