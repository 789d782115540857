use std::{io, net::SocketAddr};

use thiserror::Error;
use tokio::sync::mpsc;

use crate::{peer::PeerMsg, torrent::SessionMsg};

impl From<bendy::decoding::Error> for Error {
    fn from(value: bendy::decoding::Error) -> Self {
        Self::BencodeError(value.to_string())
    }
}

impl From<mpsc::error::SendError<PeerMsg>> for Error {
    fn from(_value: mpsc::error::SendError<PeerMsg>) -> Self {
        Self::SendErrorPeer
    }
}

impl From<mpsc::error::SendError<SessionMsg>> for Error {
    fn from(_value: mpsc::error::SendError<SessionMsg>) -> Self {
        Self::SendErrorSession
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Could not connect to peer {0}")]
    UnreachablePeer(SocketAddr),

    #[error("The piece {0} does not match the hash of the metainfo")]
    Corruption(usize),

    #[error(
        "The range {offset}..{} is not fully downloaded yet",
        offset + len
    )]
    IncompleteRange { offset: u64, len: u64 },

    #[error("The range {offset}..{} is outside of the torrent", offset + len)]
    RangeInvalid { offset: u64, len: u64 },

    #[error("No peers are available for this torrent")]
    NoPeersAvailable,

    #[error("Storage error: {0}")]
    StorageIO(io::Error),

    #[error("IO error")]
    IO(#[from] io::Error),

    #[error("The handshake received is not valid")]
    HandshakeInvalid,

    #[error("The peer took to long to send the handshake")]
    HandshakeTimeout,

    #[error("The peer violated the protocol: {0}")]
    ProtocolViolation(String),

    #[error("The message of {0} bytes is larger than the allowed maximum")]
    MessageTooLarge(usize),

    #[error("The peer closed the socket")]
    PeerClosedSocket,

    #[error("The peer took to long to respond")]
    Timeout,

    #[error("The block {index}:{begin} of len {len} is outside of the piece")]
    BlockOutOfBounds { index: usize, begin: u32, len: u32 },

    #[error("The block {index}:{begin} conflicts with bytes already stored")]
    BlockConflict { index: usize, begin: u32 },

    #[error("The piece index {0} does not exist on this torrent")]
    PieceIndexInvalid(usize),

    #[error("The file index {0} does not exist on this torrent")]
    FileIndexInvalid(usize),

    #[error("Failed to decode the bencode buffer: {0}")]
    BencodeError(String),

    #[error("The metainfo is not valid: {0}")]
    MetaInfoInvalid(&'static str),

    #[error("No metadata was given, a .torrent file or a resolved record is required")]
    MetadataMissing,

    #[error("The info hash of the metainfo does not match the magnet link")]
    InfoHashMismatch,

    #[error("Error when reading magnet link")]
    MagnetLinkInvalid,

    #[error(
        "Your magnet does not have an info_hash, are you sure you copied the \
         entire magnet link?"
    )]
    MagnetNoInfoHash,

    #[error("Error when serializing/deserializing")]
    SpeedyError(#[from] speedy::Error),

    #[error(
        "Tried to load $HOME but could not find it. Please make sure you have \
         a $HOME env and that this program has the permission to create dirs."
    )]
    HomeInvalid,

    #[error(
        "Could not open the folder `{0}`. Please make sure the program has \
         permission to open it and that the folder exist"
    )]
    FolderOpenError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Could not send message to Peer")]
    SendErrorPeer,

    #[error("Could not send message to the session")]
    SendErrorSession,

    #[error("The session was already started")]
    SessionAlreadyStarted,

    #[error("The session was cancelled")]
    Cancelled,
}

impl Error {
    /// Only storage failures stop a session, every other error is
    /// recovered by dropping or retrying the peer that caused it.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::StorageIO(_))
    }
}
