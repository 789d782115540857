use std::{
    fmt::Display,
    net::SocketAddr,
    ops::Deref,
    path::PathBuf,
    sync::Arc,
};

use speedy::{Readable, Writable};
use tokio::net::TcpStream;

use crate::{
    bitfield::Bitfield,
    error::Error,
    magnet::Magnet,
    metainfo::TorrentMetadata,
    peer::PeerCtx,
    wire::{Block, BlockInfo},
};

/// SHA-1 of the info dictionary, identifies a torrent.
#[derive(Default, Clone, PartialEq, Eq, Hash, Readable, Writable)]
pub struct InfoHash(pub [u8; 20]);

impl Display for InfoHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl Deref for InfoHash {
    type Target = [u8; 20];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Debug for InfoHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.to_string();
        f.write_str(&s[..10])
    }
}

impl From<[u8; 20]> for InfoHash {
    fn from(value: [u8; 20]) -> Self {
        Self(value)
    }
}

impl From<InfoHash> for [u8; 20] {
    fn from(value: InfoHash) -> Self {
        value.0
    }
}

impl TryFrom<Vec<u8>> for InfoHash {
    type Error = &'static str;

    fn try_from(value: Vec<u8>) -> Result<Self, Self::Error> {
        let buf: [u8; 20] = value
            .try_into()
            .map_err(|_| "The infohash must have exactly 20 bytes")?;
        Ok(InfoHash(buf))
    }
}

/// Messages received by the session loop, from its peers, the inbound
/// listener and the session handle.
#[derive(Debug)]
pub enum SessionMsg {
    /// The byte stream of the peer is open, handshakes are being exchanged.
    PeerHandshaking(SocketAddr),

    /// The peer handshaked.
    PeerConnected(Arc<PeerCtx>),

    PeerBitfield(SocketAddr, Bitfield),

    PeerHave(SocketAddr, usize),

    /// The peer choked us and dropped our requests.
    PeerChoked(SocketAddr),

    PeerUnchoked(SocketAddr),

    PeerInterested(SocketAddr, bool),

    /// A requested block arrived.
    BlockReceived(SocketAddr, Block),

    /// Requests that the peer did not answer in time, they were cancelled.
    RequestsTimedOut(SocketAddr, Vec<BlockInfo>),

    /// The task of the peer ended, with the error that stopped it.
    PeerClosed(SocketAddr, Option<Error>),

    /// A remote peer connected to our listener.
    InboundPeer(TcpStream, SocketAddr),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub enum SessionState {
    #[default]
    Initializing,

    /// Resolving the metadata and hashing existing data.
    FetchingMetadata,

    Active,

    /// Everything that was asked for is verified. The session keeps
    /// uploading, and in stream mode downloading the rest of the torrent,
    /// until it is cancelled.
    Completed,

    Cancelled,

    /// A storage error stopped the session.
    Failed(String),
}

impl SessionState {
    /// Nothing happens after these states.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Failed(_))
    }
}

impl Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initializing => f.write_str("initializing"),
            Self::FetchingMetadata => f.write_str("fetching metadata"),
            Self::Active => f.write_str("downloading"),
            Self::Completed => f.write_str("completed"),
            Self::Cancelled => f.write_str("cancelled"),
            Self::Failed(e) => write!(f, "failed: {e}"),
        }
    }
}

/// Snapshot of a session, published on every change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Progress {
    /// Verified bytes over the size of the torrent.
    pub fraction: f64,
    pub downloaded: u64,
    pub uploaded: u64,
    /// Bytes per second.
    pub download_rate: u64,
    pub upload_rate: u64,
    /// Handshaked peers.
    pub peers: usize,
    pub state: SessionState,
    pub buffer_ready: bool,
    /// No peer is connected and the peer source has nothing to offer.
    pub stalled: bool,
    pub verified_pieces: usize,
    pub total_pieces: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Mode {
    /// Download the whole torrent, rarest pieces first.
    #[default]
    Download,

    /// Download a file sequentially so that it can be played while it is
    /// downloaded. Defaults to the largest file of the torrent.
    Stream { file: Option<usize> },
}

/// Where the metadata of the torrent comes from.
#[derive(Debug, Clone)]
pub enum MetadataSource {
    Resolved(TorrentMetadata),
    /// A `.torrent` file.
    TorrentFile(PathBuf),
}

impl MetadataSource {
    /// Resolve the metadata. When a magnet link is given, the info hash of
    /// the metadata must match its `xt` field.
    pub async fn resolve(
        self,
        magnet: Option<&Magnet>,
    ) -> Result<TorrentMetadata, Error> {
        let meta = match self {
            Self::Resolved(meta) => meta,
            Self::TorrentFile(path) => TorrentMetadata::from_file(path).await?,
        };

        if let Some(magnet) = magnet {
            if magnet.info_hash()? != meta.info_hash {
                return Err(Error::InfoHashMismatch);
            }
        }

        Ok(meta)
    }
}
