use std::{
    fmt::Display,
    io,
    net::SocketAddr,
    sync::atomic::{AtomicBool, Ordering},
};

use futures::future::BoxFuture;
use rand::{distributions::Alphanumeric, Rng};
use speedy::{Readable, Writable};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    sync::mpsc,
};

use crate::{counter::Counter, wire::BlockInfo};

#[derive(Clone, PartialEq, Eq, Hash, Default, Readable, Writable)]
pub struct PeerId(pub [u8; 20]);

impl PeerId {
    /// Azureus style id, `-MG0100-` followed by 12 random characters.
    pub fn generate() -> Self {
        let mut id = [0u8; 20];
        id[..8].copy_from_slice(b"-MG0100-");

        let rng = rand::thread_rng();
        for (b, c) in id[8..].iter_mut().zip(rng.sample_iter(Alphanumeric)) {
            *b = c;
        }

        Self(id)
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_string())
    }
}

impl From<[u8; 20]> for PeerId {
    fn from(value: [u8; 20]) -> Self {
        Self(value)
    }
}

impl From<PeerId> for [u8; 20] {
    fn from(value: PeerId) -> Self {
        value.0
    }
}

/// Messages sent by the session to a peer.
#[derive(Debug)]
pub enum PeerMsg {
    /// Blocks assigned by the scheduler. Dropped if the peer is choking us,
    /// the session releases them when it sees the choke.
    Request(Vec<BlockInfo>),
    /// Another peer delivered this block first.
    Cancel(BlockInfo),
    /// We verified a piece, tell the peer if it does not have it.
    Have(usize),
    /// Stop uploading to the peer.
    Choke,
    /// Allow the peer to download from us.
    Unchoke,
    /// Everything is downloaded, the peer will only upload from now on.
    SeedOnly,
    /// Close the connection.
    Quit,
}

/// Determines who initiated the connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Outbound means we initiated the connection
    Outbound,
    /// Inbound means the peer initiated the connection
    Inbound,
}

/// Data of a connected peer that is shared with the swarm.
#[derive(Debug)]
pub struct PeerCtx {
    pub direction: Direction,
    pub remote_addr: SocketAddr,
    pub id: PeerId,
    pub tx: mpsc::UnboundedSender<PeerMsg>,
    pub counter: Counter,

    /// If we're interested, peer has pieces that we don't have.
    pub am_interested: AtomicBool,

    /// If we're choking, the peer may not download from us.
    pub am_choking: AtomicBool,

    /// If peer is choking, we may not download from them.
    pub peer_choking: AtomicBool,

    /// If peer is interested in us, they mean to download pieces that we
    /// have.
    pub peer_interested: AtomicBool,
}

impl PeerCtx {
    /// Both sides of a connection start off as choked and not interested.
    pub fn new(
        direction: Direction,
        remote_addr: SocketAddr,
        id: PeerId,
        tx: mpsc::UnboundedSender<PeerMsg>,
    ) -> Self {
        Self {
            direction,
            remote_addr,
            id,
            tx,
            counter: Counter::new(),
            am_interested: AtomicBool::new(false),
            am_choking: AtomicBool::new(true),
            peer_choking: AtomicBool::new(true),
            peer_interested: AtomicBool::new(false),
        }
    }

    pub fn is_choking_us(&self) -> bool {
        self.peer_choking.load(Ordering::Relaxed)
    }

    pub fn is_interested(&self) -> bool {
        self.peer_interested.load(Ordering::Relaxed)
    }
}

/// A duplex byte stream to a peer.
pub trait PeerIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> PeerIo for T {}

pub type BoxedStream = Box<dyn PeerIo>;

/// Opens the byte stream of outbound connections.
pub trait Connector: Send + Sync {
    fn connect(&self, addr: SocketAddr) -> BoxFuture<'_, io::Result<BoxedStream>>;
}

/// The default transport.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    fn connect(&self, addr: SocketAddr) -> BoxFuture<'_, io::Result<BoxedStream>> {
        Box::pin(async move {
            let socket = TcpStream::connect(addr).await?;
            socket.set_nodelay(true)?;
            Ok(Box::new(socket) as BoxedStream)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_peer_ids() {
        let a = PeerId::generate();
        let b = PeerId::generate();

        assert_eq!(&a.0[..8], b"-MG0100-");
        assert!(a.0[8..].iter().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, b);
        assert_eq!(a.to_string().len(), 40);
    }
}
