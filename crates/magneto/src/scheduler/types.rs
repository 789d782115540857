use std::{net::SocketAddr, ops::Range};

use tokio::time::Instant;

use crate::{bitfield::Bitfield, wire::BlockInfo};

/// How pieces are ordered, fixed for the lifetime of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Strategy {
    /// Least available pieces first, ties broken by the lowest index.
    RarestFirst,

    /// Pieces of the target file in increasing order, the first `window`
    /// pieces of the file with elevated priority.
    Sequential {
        /// Pieces that hold any byte of the target file.
        file: Range<usize>,
        /// Size of the priority window, in pieces.
        window: usize,
    },
}

impl Strategy {
    /// The pieces of the priority window, empty for rarest-first.
    pub fn window(&self) -> Range<usize> {
        match self {
            Self::RarestFirst => 0..0,
            Self::Sequential { file, window } => {
                file.start..(file.start + window).min(file.end)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PieceState {
    #[default]
    Missing,
    /// At least one block was requested.
    InFlight,
    Verified,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Pending,
    Fulfilled,
    TimedOut,
}

/// A block assigned to a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRequest {
    pub block: BlockInfo,
    pub peer: SocketAddr,
    pub requested_at: Instant,
    pub state: RequestState,
}

/// A peer that can receive requests, as seen by the scheduler.
#[derive(Debug, Clone, Copy)]
pub struct PeerSlot<'a> {
    pub peer: SocketAddr,
    /// Pieces that the peer advertises.
    pub have: &'a Bitfield,
    /// How many more requests the peer can take.
    pub slots: usize,
}

/// Result of [`super::PieceScheduler::on_block_received`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    /// The first copy of the block.
    Fresh {
        /// Other peers that still have the block outstanding, they should be
        /// sent a Cancel.
        cancel: Vec<SocketAddr>,
        /// Every block of the piece is here, it can be verified.
        piece_complete: bool,
    },
    /// The block was already received, was not requested from the peer, or
    /// the piece is verified.
    Duplicate,
}

/// Scheduling state of one block of a piece.
#[derive(Debug, Clone, Default)]
pub(crate) struct BlockSlot {
    pub received: bool,
    /// Peer that delivered the block.
    pub contributor: Option<SocketAddr>,
    /// Outstanding requests, more than one only in endgame or inside of the
    /// priority window.
    pub requests: Vec<BlockRequest>,
}

/// One per piece index.
#[derive(Debug, Clone, Default)]
pub(crate) struct PieceRecord {
    pub state: PieceState,
    /// Empty until the piece is first requested.
    pub blocks: Vec<BlockSlot>,
}

impl PieceRecord {
    pub fn reset(&mut self) {
        self.state = PieceState::Missing;
        self.blocks = Vec::new();
    }

    pub fn is_complete(&self) -> bool {
        !self.blocks.is_empty() && self.blocks.iter().all(|b| b.received)
    }
}
