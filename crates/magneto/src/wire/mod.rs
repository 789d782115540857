//! The "TCP Wire" protocol between Peers, version 1 without extensions.
//! Peers follow this protocol to exchange pieces of a torrent.
mod codec;
mod handshake_codec;

pub use codec::*;
pub use handshake_codec::*;

use bytes::{BufMut, BytesMut};

/// The block_len that most clients support, some clients drop the
/// connection on blocks larger than this value.
///
/// The last block of a piece might be smaller.
pub const BLOCK_LEN: u32 = 16384;

/// Protocol String, "BitTorrent protocol" in bytes.
pub const PSTR: [u8; 19] = *b"BitTorrent protocol";

/// Frames larger than this are a protocol violation.
pub const MAX_MESSAGE_SIZE: usize = 2 * 1024 * 1024;

/// A Block is a subset of a Piece, pieces are subsets of the entire Torrent
/// data. Peers send Blocks in the "Piece" message.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Block {
    /// The index of the piece this block belongs to.
    pub index: usize,
    /// The zero-based byte offset into the piece.
    pub begin: u32,
    /// The block's data. 16 KiB most of the times, but the last block of a
    /// piece *might* be smaller.
    pub block: Vec<u8>,
}

impl Block {
    /// Like most clients, we only support data <= 16kiB.
    pub fn is_valid(&self) -> bool {
        !self.block.is_empty() && self.block.len() <= BLOCK_LEN as usize
    }

    pub fn info(&self) -> BlockInfo {
        BlockInfo {
            index: self.index as u32,
            begin: self.begin,
            len: self.block.len() as u32,
        }
    }
}

/// The representation of a [`Block`], sent in the "Request" and "Cancel"
/// messages.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockInfo {
    /// The index of the piece of which this is a block.
    pub index: u32,
    /// The zero-based byte offset into the piece.
    pub begin: u32,
    /// The block's length in bytes. <= 16 KiB
    pub len: u32,
}

impl Default for BlockInfo {
    fn default() -> Self {
        Self { index: 0, begin: 0, len: BLOCK_LEN }
    }
}

impl From<&Block> for BlockInfo {
    fn from(val: &Block) -> Self {
        val.info()
    }
}

impl BlockInfo {
    pub fn new(index: u32, begin: u32, len: u32) -> Self {
        Self { index, begin, len }
    }

    pub fn piece(&self) -> usize {
        self.index as usize
    }

    /// Encodes the block info in the network binary protocol's format into the
    /// given buffer.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.index);
        buf.put_u32(self.begin);
        buf.put_u32(self.len);
    }

    /// Like most clients, we only serve data <= 16kiB.
    pub fn is_valid(&self) -> bool {
        self.len <= BLOCK_LEN && self.len > 0
    }
}
