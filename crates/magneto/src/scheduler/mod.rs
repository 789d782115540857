//! Decides which blocks are requested next, and from which peer.
//!
//! The scheduler is a plain state machine owned by the session loop, it never
//! touches the network. The session feeds it with the peers that can take
//! requests and the availability of the swarm, and reports back what happened
//! to every request it handed out.
mod types;

pub use types::*;

use std::{net::SocketAddr, ops::Range, sync::Arc};

use hashbrown::{HashMap, HashSet};
use tokio::time::Instant;
use tracing::debug;

use crate::{
    bitfield::{Bitfield, BitfieldExt},
    config::Config,
    metainfo::TorrentMetadata,
    wire::{BlockInfo, BLOCK_LEN},
};

#[derive(Debug)]
pub struct PieceScheduler {
    meta: Arc<TorrentMetadata>,
    strategy: Strategy,
    pieces: Vec<PieceRecord>,
    /// Reverse index of the outstanding requests of each peer.
    by_peer: HashMap<SocketAddr, HashSet<BlockInfo>>,
    endgame_blocks: usize,
    window_duplicates: usize,
    /// Blocks not received yet, of the pieces that are not verified.
    unreceived: usize,
    verified: usize,
    /// Requests dropped with their piece, the peers should be told.
    cancels: Vec<(SocketAddr, BlockInfo)>,
}

impl PieceScheduler {
    /// `have` holds the pieces that are already verified, after a recheck.
    pub fn new(
        meta: Arc<TorrentMetadata>,
        strategy: Strategy,
        have: &Bitfield,
        config: &Config,
    ) -> Self {
        let mut pieces = vec![PieceRecord::default(); meta.piece_count()];
        let mut unreceived = 0;
        let mut verified = 0;

        for (i, piece) in pieces.iter_mut().enumerate() {
            if have.has(i) {
                piece.state = PieceState::Verified;
                verified += 1;
            } else {
                unreceived += meta.block_count(i) as usize;
            }
        }

        Self {
            meta,
            strategy,
            pieces,
            by_peer: HashMap::new(),
            endgame_blocks: config.endgame_blocks,
            window_duplicates: config.stream_window_duplicates.max(1),
            unreceived,
            verified,
            cancels: Vec::new(),
        }
    }

    pub fn strategy(&self) -> &Strategy {
        &self.strategy
    }

    pub fn piece_state(&self, piece: usize) -> PieceState {
        self.pieces.get(piece).map(|p| p.state).unwrap_or_default()
    }

    /// Duplicate requests are allowed once few blocks are left.
    pub fn in_endgame(&self) -> bool {
        self.unreceived > 0 && self.unreceived <= self.endgame_blocks
    }

    pub fn unreceived_blocks(&self) -> usize {
        self.unreceived
    }

    /// Requests outstanding to `peer`.
    pub fn pending_count(&self, peer: &SocketAddr) -> usize {
        self.by_peer.get(peer).map(|r| r.len()).unwrap_or(0)
    }

    pub fn verified_count(&self) -> usize {
        self.verified
    }

    pub fn is_complete(&self) -> bool {
        self.verified == self.pieces.len()
    }

    pub fn is_range_complete(&self, range: Range<usize>) -> bool {
        self.pieces[range.start.min(self.pieces.len())..range.end.min(self.pieces.len())]
            .iter()
            .all(|p| p.state == PieceState::Verified)
    }

    /// Every piece of the priority window is verified. Without a window this
    /// is the completion of the torrent.
    pub fn buffer_ready(&self) -> bool {
        match &self.strategy {
            Strategy::RarestFirst => self.is_complete(),
            Strategy::Sequential { .. } => {
                self.is_range_complete(self.strategy.window())
            }
        }
    }

    /// Every piece the session was asked for is verified: the whole torrent
    /// or the target file.
    pub fn target_complete(&self) -> bool {
        match &self.strategy {
            Strategy::RarestFirst => self.is_complete(),
            Strategy::Sequential { file, .. } => {
                self.is_range_complete(file.clone())
            }
        }
    }

    fn block_info(&self, piece: usize, block: usize) -> BlockInfo {
        let begin = block as u32 * BLOCK_LEN;
        let len = BLOCK_LEN.min(self.meta.piece_len(piece) - begin);
        BlockInfo::new(piece as u32, begin, len)
    }

    /// Piece and block index of `info`, if it is a block of this torrent.
    fn locate(&self, info: &BlockInfo) -> Option<(usize, usize)> {
        let piece = info.piece();
        if piece >= self.pieces.len() || info.begin % BLOCK_LEN != 0 {
            return None;
        }
        let block = (info.begin / BLOCK_LEN) as usize;
        (self.block_info(piece, block) == *info).then_some((piece, block))
    }

    fn ensure_blocks(&mut self, piece: usize) {
        let record = &mut self.pieces[piece];
        if record.blocks.is_empty() && record.state != PieceState::Verified {
            let n = self.meta.block_count(piece) as usize;
            record.blocks = vec![BlockSlot::default(); n];
        }
    }

    fn assign(
        &mut self,
        piece: usize,
        block: usize,
        peer: SocketAddr,
        now: Instant,
    ) -> BlockRequest {
        let request = BlockRequest {
            block: self.block_info(piece, block),
            peer,
            requested_at: now,
            state: RequestState::Pending,
        };

        let record = &mut self.pieces[piece];
        record.state = PieceState::InFlight;
        record.blocks[block].requests.push(request.clone());
        self.by_peer.entry(peer).or_default().insert(request.block.clone());

        request
    }

    /// Remove the request of `peer` for a block, if there is one.
    fn unassign(&mut self, peer: SocketAddr, info: &BlockInfo) -> Option<BlockRequest> {
        if let Some(set) = self.by_peer.get_mut(&peer) {
            set.remove(info);
            if set.is_empty() {
                self.by_peer.remove(&peer);
            }
        }

        let (piece, block) = self.locate(info)?;
        let slot = self.pieces[piece].blocks.get_mut(block)?;
        let pos = slot.requests.iter().position(|r| r.peer == peer)?;

        Some(slot.requests.remove(pos))
    }

    /// The pieces that may be requested now, in priority order.
    fn piece_order(&self, availability: &[u32]) -> Vec<usize> {
        let avail = |p: usize| availability.get(p).copied().unwrap_or(0);
        let wanted = |p: &usize| self.pieces[*p].state != PieceState::Verified;

        match &self.strategy {
            Strategy::RarestFirst => {
                let mut order: Vec<usize> = (0..self.pieces.len())
                    .filter(wanted)
                    .filter(|&p| avail(p) > 0)
                    .collect();
                order.sort_by_key(|&p| (avail(p), p));
                order
            }
            Strategy::Sequential { file, window } => {
                if file.is_empty() {
                    return (0..self.pieces.len()).filter(wanted).collect();
                }

                // nothing past the window is requested while a piece of the
                // window, or the first one after it, was never requested.
                let gate_end = (file.start + window).min(file.end - 1);
                let gate_closed = (file.start..=gate_end)
                    .any(|p| self.pieces[p].state == PieceState::Missing);

                let mut order: Vec<usize> = file
                    .clone()
                    .filter(wanted)
                    .filter(|&p| !gate_closed || p <= gate_end)
                    .collect();

                if !gate_closed && !self.has_fresh_blocks(file.clone()) {
                    order.extend(
                        (0..self.pieces.len())
                            .filter(|p| !file.contains(p))
                            .filter(wanted),
                    );
                }

                order
            }
        }
    }

    /// Some block of `range` was neither received nor requested.
    fn has_fresh_blocks(&self, range: Range<usize>) -> bool {
        self.pieces[range].iter().any(|p| match p.state {
            PieceState::Verified => false,
            PieceState::Missing => true,
            PieceState::InFlight => p
                .blocks
                .iter()
                .any(|b| !b.received && b.requests.is_empty()),
        })
    }

    /// Hand out up to the free slots of `peers` block requests.
    ///
    /// `peers` is in preference order, the first peer with a free slot that
    /// has a piece gets its blocks. A block is never given to two peers at
    /// once, except in endgame or inside of the priority window.
    pub fn next_requests(
        &mut self,
        peers: &[PeerSlot],
        availability: &[u32],
        now: Instant,
    ) -> Vec<BlockRequest> {
        let mut slots: Vec<usize> = peers.iter().map(|p| p.slots).collect();
        let mut free: usize = slots.iter().sum();
        let mut out = Vec::new();

        if free == 0 {
            return out;
        }

        let order = self.piece_order(availability);

        // fresh blocks
        for &piece in &order {
            if free == 0 {
                break;
            }
            let has_peer = peers
                .iter()
                .zip(&slots)
                .any(|(p, &s)| s > 0 && p.have.has(piece));
            if !has_peer {
                continue;
            }

            self.ensure_blocks(piece);

            for block in 0..self.pieces[piece].blocks.len() {
                let slot = &self.pieces[piece].blocks[block];
                if slot.received || !slot.requests.is_empty() {
                    continue;
                }

                let Some(i) = (0..peers.len())
                    .find(|&i| slots[i] > 0 && peers[i].have.has(piece))
                else {
                    break;
                };

                slots[i] -= 1;
                free -= 1;
                out.push(self.assign(piece, block, peers[i].peer, now));

                if free == 0 {
                    break;
                }
            }
        }

        // duplicates, only for peers that ran out of fresh work
        let endgame = self.in_endgame();
        let window = self.strategy.window();

        if free == 0 || (!endgame && window.is_empty()) {
            return out;
        }

        for &piece in &order {
            if free == 0 {
                break;
            }
            let max = if endgame {
                usize::MAX
            } else if window.contains(&piece) {
                self.window_duplicates
            } else {
                continue;
            };

            for block in 0..self.pieces[piece].blocks.len() {
                loop {
                    let slot = &self.pieces[piece].blocks[block];
                    if slot.received || slot.requests.len() >= max || free == 0 {
                        break;
                    }

                    let Some(i) = (0..peers.len()).find(|&i| {
                        slots[i] > 0
                            && peers[i].have.has(piece)
                            && !slot.requests.iter().any(|r| r.peer == peers[i].peer)
                    }) else {
                        break;
                    };

                    slots[i] -= 1;
                    free -= 1;
                    out.push(self.assign(piece, block, peers[i].peer, now));
                }
            }
        }

        if !out.is_empty() {
            debug!("scheduled {} requests, endgame: {endgame}", out.len());
        }

        out
    }

    /// A block arrived from `peer`. Only the first copy of a block that was
    /// requested from `peer` counts, the other peers that still have it
    /// outstanding are returned to be cancelled.
    pub fn on_block_received(
        &mut self,
        peer: SocketAddr,
        info: &BlockInfo,
    ) -> Received {
        // late blocks of dropped or timed out requests
        if self.unassign(peer, info).is_none() {
            return Received::Duplicate;
        }

        let Some((piece, block)) = self.locate(info) else {
            return Received::Duplicate;
        };
        let Some(slot) = self.pieces[piece].blocks.get_mut(block) else {
            return Received::Duplicate;
        };
        if slot.received {
            return Received::Duplicate;
        }

        slot.received = true;
        slot.contributor = Some(peer);
        let cancel: Vec<SocketAddr> =
            slot.requests.drain(..).map(|r| r.peer).collect();

        for other in &cancel {
            if let Some(set) = self.by_peer.get_mut(other) {
                set.remove(info);
            }
        }

        self.unreceived -= 1;

        Received::Fresh {
            cancel,
            piece_complete: self.pieces[piece].is_complete(),
        }
    }

    /// The storage refused a block that was counted as [`Received::Fresh`],
    /// it has to be downloaded again.
    pub fn on_block_rejected(&mut self, peer: SocketAddr, info: &BlockInfo) {
        let Some((piece, block)) = self.locate(info) else { return };
        let Some(slot) = self.pieces[piece].blocks.get_mut(block) else {
            return;
        };

        if slot.received && slot.contributor == Some(peer) {
            slot.received = false;
            slot.contributor = None;
            self.unreceived += 1;
        }
    }

    /// The requests of `peer` for `blocks` took too long. The blocks can be
    /// requested again right away, the pieces stay in flight.
    pub fn on_timed_out(
        &mut self,
        peer: SocketAddr,
        blocks: &[BlockInfo],
    ) -> Vec<BlockRequest> {
        blocks
            .iter()
            .filter_map(|info| self.unassign(peer, info))
            .map(|mut r| {
                r.state = RequestState::TimedOut;
                r
            })
            .collect()
    }

    /// Forget every request of `peer`, when it is closed or choked us.
    pub fn release_peer(&mut self, peer: SocketAddr) -> Vec<BlockInfo> {
        let Some(blocks) = self.by_peer.remove(&peer) else {
            return Vec::new();
        };

        for info in &blocks {
            if let Some((piece, block)) = self.locate(info) {
                if let Some(slot) = self.pieces[piece].blocks.get_mut(block) {
                    slot.requests.retain(|r| r.peer != peer);
                }
            }
        }

        blocks.into_iter().collect()
    }

    fn drop_requests(&mut self, piece: usize) {
        for slot in &self.pieces[piece].blocks {
            for r in &slot.requests {
                if let Some(set) = self.by_peer.get_mut(&r.peer) {
                    set.remove(&r.block);
                    if set.is_empty() {
                        self.by_peer.remove(&r.peer);
                    }
                }
                self.cancels.push((r.peer, r.block.clone()));
            }
        }
    }

    /// Requests that were dropped because their piece was verified or
    /// corrupt, since the last call.
    pub fn take_cancels(&mut self) -> Vec<(SocketAddr, BlockInfo)> {
        std::mem::take(&mut self.cancels)
    }

    pub fn on_piece_verified(&mut self, piece: usize) {
        let Some(record) = self.pieces.get(piece) else { return };
        if record.state == PieceState::Verified {
            return;
        }

        let missing = if record.blocks.is_empty() {
            self.meta.block_count(piece) as usize
        } else {
            record.blocks.iter().filter(|b| !b.received).count()
        };

        self.drop_requests(piece);
        self.unreceived -= missing;
        self.verified += 1;

        let record = &mut self.pieces[piece];
        record.state = PieceState::Verified;
        record.blocks = Vec::new();
    }

    /// The piece failed verification: it is missing again and every block
    /// has to be downloaded again. Returns the peers that contributed to it.
    pub fn on_piece_corrupt(&mut self, piece: usize) -> Vec<SocketAddr> {
        let Some(record) = self.pieces.get(piece) else {
            return Vec::new();
        };
        if record.state == PieceState::Verified {
            return Vec::new();
        }

        let mut contributors: Vec<SocketAddr> =
            record.blocks.iter().filter_map(|b| b.contributor).collect();
        contributors.sort();
        contributors.dedup();

        let received = record.blocks.iter().filter(|b| b.received).count();

        self.drop_requests(piece);
        self.unreceived += received;
        self.pieces[piece].reset();

        contributors
    }
}
