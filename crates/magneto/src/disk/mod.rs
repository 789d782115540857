//! Storage of the pieces of one torrent.
//!
//! Blocks are buffered in memory per piece until the piece is complete, then
//! the piece is hashed and, if it matches the metadata, written to the
//! backend and marked as verified. Only verified data is ever read back.
mod backend;

pub use backend::*;

use std::{
    collections::VecDeque,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

use sha1_smol::Sha1;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::{
    bitfield::{Bitfield, BitfieldExt},
    error::Error,
    metainfo::TorrentMetadata,
    wire::{BlockInfo, BLOCK_LEN},
};

/// What happened to a block given to [`PieceStore::write`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The block is new, `complete` is true when it was the last missing
    /// block of its piece.
    Stored { complete: bool },
    /// The same bytes were already buffered.
    Duplicate,
    /// The piece is verified and the bytes match what is stored.
    AlreadyVerified,
}

/// Events queued by the store and drained by the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreEvent {
    Verified(usize),
    Corrupted(usize),
}

/// Blocks of a piece that is being downloaded.
#[derive(Debug, Default)]
struct PieceBuffer {
    data: Vec<u8>,
    received: Bitfield,
}

impl PieceBuffer {
    fn reset(&mut self) {
        self.data = Vec::new();
        self.received = Bitfield::new();
    }
}

#[derive(Debug)]
pub struct PieceStore {
    meta: Arc<TorrentMetadata>,
    backend: StorageBackend,
    pieces: Vec<Mutex<PieceBuffer>>,
    have: RwLock<Bitfield>,
    events: Mutex<VecDeque<StoreEvent>>,
    verified_bytes: AtomicU64,
    /// Bumped on every verified piece and on close, wakes range waiters.
    verified_tx: watch::Sender<usize>,
    closed: AtomicBool,
}

impl PieceStore {
    pub fn new(meta: Arc<TorrentMetadata>, backend: StorageBackend) -> Self {
        let pieces =
            (0..meta.piece_count()).map(|_| Mutex::default()).collect();
        let have = RwLock::new(Bitfield::from_piece(meta.piece_count()));
        let (verified_tx, _) = watch::channel(0);

        Self {
            meta,
            backend,
            pieces,
            have,
            events: Mutex::default(),
            verified_bytes: AtomicU64::new(0),
            verified_tx,
            closed: AtomicBool::new(false),
        }
    }

    /// Store the files of the torrent under `dir`.
    pub fn on_disk(meta: Arc<TorrentMetadata>, dir: impl Into<PathBuf>) -> Self {
        let backend = StorageBackend::Disk(FileStorage::new(dir, &meta));
        Self::new(meta, backend)
    }

    pub fn in_memory(meta: Arc<TorrentMetadata>) -> Self {
        let backend =
            StorageBackend::Memory(MemoryStorage::new(meta.total_length));
        Self::new(meta, backend)
    }

    pub fn metadata(&self) -> &Arc<TorrentMetadata> {
        &self.meta
    }

    fn check_block(&self, piece: usize, begin: u32, len: u32) -> Result<u32, Error> {
        if piece >= self.meta.piece_count() {
            return Err(Error::PieceIndexInvalid(piece));
        }

        let piece_len = self.meta.piece_len(piece);
        let oob = Error::BlockOutOfBounds { index: piece, begin, len };

        if begin % BLOCK_LEN != 0 || begin >= piece_len {
            return Err(oob);
        }

        // blocks are aligned, only the last one of a piece may be smaller
        let expected = BLOCK_LEN.min(piece_len - begin);
        if len != expected {
            return Err(oob);
        }

        Ok(begin / BLOCK_LEN)
    }

    /// Buffer a block of a piece.
    ///
    /// Writes for one piece are serialized. Writing bytes that are already
    /// there is a no-op, writing different bytes over them is rejected with
    /// [`Error::BlockConflict`].
    pub async fn write(
        &self,
        piece: usize,
        begin: u32,
        bytes: &[u8],
    ) -> Result<WriteOutcome, Error> {
        let block = self.check_block(piece, begin, bytes.len() as u32)?;
        let mut buf = self.pieces[piece].lock().await;

        if self.is_verified(piece).await {
            let offset = self.meta.piece_offset(piece) + begin as u64;
            let stored = self
                .backend
                .read(offset, bytes.len())
                .await
                .map_err(Error::StorageIO)?;

            if stored != bytes {
                return Err(Error::BlockConflict { index: piece, begin });
            }
            return Ok(WriteOutcome::AlreadyVerified);
        }

        if buf.received.is_empty() {
            buf.data = vec![0u8; self.meta.piece_len(piece) as usize];
            buf.received = Bitfield::from_piece(self.meta.block_count(piece) as usize);
        }

        let start = begin as usize;
        let range = start..start + bytes.len();

        if buf.received.has(block as usize) {
            if buf.data[range] != *bytes {
                return Err(Error::BlockConflict { index: piece, begin });
            }
            return Ok(WriteOutcome::Duplicate);
        }

        buf.data[range].copy_from_slice(bytes);
        buf.received.set(block as usize, true);

        Ok(WriteOutcome::Stored { complete: buf.received.all() })
    }

    /// Hash a complete piece and compare it with the metadata.
    ///
    /// On a match the piece is written to the backend and becomes verified.
    /// On a mismatch the buffered blocks are thrown away and the piece is
    /// missing again.
    #[tracing::instrument(skip(self))]
    pub async fn verify(&self, piece: usize) -> Result<(), Error> {
        if piece >= self.meta.piece_count() {
            return Err(Error::PieceIndexInvalid(piece));
        }

        let mut buf = self.pieces[piece].lock().await;

        if self.is_verified(piece).await {
            return Ok(());
        }

        if buf.received.is_empty() || !buf.received.all() {
            return Err(Error::IncompleteRange {
                offset: self.meta.piece_offset(piece),
                len: self.meta.piece_len(piece) as u64,
            });
        }

        let hash = Sha1::from(&buf.data).digest().bytes();

        if hash != self.meta.piece_hashes[piece] {
            warn!("piece {piece} is corrupted");
            buf.reset();
            self.events.lock().await.push_back(StoreEvent::Corrupted(piece));
            return Err(Error::Corruption(piece));
        }

        let offset = self.meta.piece_offset(piece);
        self.backend.write(offset, &buf.data).await.map_err(Error::StorageIO)?;
        buf.reset();

        self.mark_verified(piece).await;
        self.events.lock().await.push_back(StoreEvent::Verified(piece));
        debug!("piece {piece} verified");

        Ok(())
    }

    async fn mark_verified(&self, piece: usize) {
        self.have.write().await.set(piece, true);
        self.verified_bytes
            .fetch_add(self.meta.piece_len(piece) as u64, Ordering::Relaxed);
        self.verified_tx.send_modify(|n| *n += 1);
    }

    /// Read bytes of the torrent, every piece that they touch must be
    /// verified.
    pub async fn read(&self, offset: u64, len: u64) -> Result<Vec<u8>, Error> {
        if offset.saturating_add(len) > self.meta.total_length {
            return Err(Error::RangeInvalid { offset, len });
        }
        if len == 0 {
            return Ok(Vec::new());
        }
        if !self.is_range_verified(offset, len).await {
            return Err(Error::IncompleteRange { offset, len });
        }

        self.backend
            .read(offset, len as usize)
            .await
            .map_err(Error::StorageIO)
    }

    /// Read a block that a peer asked for, the piece must be verified.
    pub async fn read_block(&self, info: &BlockInfo) -> Result<Vec<u8>, Error> {
        let piece = info.piece();
        if piece >= self.meta.piece_count()
            || info.begin as u64 + info.len as u64 > self.meta.piece_len(piece) as u64
        {
            return Err(Error::BlockOutOfBounds {
                index: piece,
                begin: info.begin,
                len: info.len,
            });
        }

        let offset = self.meta.piece_offset(piece) + info.begin as u64;
        self.read(offset, info.len as u64).await
    }

    /// Wait until the range is verified and read it. Fails with
    /// [`Error::Cancelled`] if the store is closed first.
    pub async fn wait_for_range(
        &self,
        offset: u64,
        len: u64,
    ) -> Result<Vec<u8>, Error> {
        if offset.saturating_add(len) > self.meta.total_length {
            return Err(Error::RangeInvalid { offset, len });
        }

        // subscribe before checking, so a piece verified in between is seen
        let mut rx = self.verified_tx.subscribe();

        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(Error::Cancelled);
            }
            if self.is_range_verified(offset, len).await {
                return self.read(offset, len).await;
            }
            rx.changed().await.map_err(|_| Error::Cancelled)?;
        }
    }

    pub async fn is_range_verified(&self, offset: u64, len: u64) -> bool {
        let have = self.have.read().await;
        self.meta.pieces_of_range(offset, len).all(|p| have.has(p))
    }

    pub async fn is_verified(&self, piece: usize) -> bool {
        self.have.read().await.has(piece)
    }

    /// Snapshot of the verified pieces.
    pub async fn have_bitmap(&self) -> Bitfield {
        self.have.read().await.clone()
    }

    pub fn verified_bytes(&self) -> u64 {
        self.verified_bytes.load(Ordering::Relaxed)
    }

    /// Take the queued events, oldest first.
    pub async fn drain_events(&self) -> Vec<StoreEvent> {
        self.events.lock().await.drain(..).collect()
    }

    /// Hash the data left by a previous run and mark the pieces that match
    /// as verified. Returns how many pieces were verified.
    #[tracing::instrument(skip(self))]
    pub async fn recheck(&self) -> Result<usize, Error> {
        let mut found = 0;

        for piece in 0..self.meta.piece_count() {
            if self.is_verified(piece).await {
                continue;
            }

            let offset = self.meta.piece_offset(piece);
            let len = self.meta.piece_len(piece) as usize;

            let Some(data) = self
                .backend
                .read_existing(offset, len)
                .await
                .map_err(Error::StorageIO)?
            else {
                continue;
            };

            if Sha1::from(&data).digest().bytes() == self.meta.piece_hashes[piece] {
                self.mark_verified(piece).await;
                found += 1;
            }
        }

        if found > 0 {
            info!("recheck found {found} verified pieces");
        }

        Ok(found)
    }

    /// Release the backend. Range waiters are woken up and fail.
    pub async fn close(&self) -> Result<(), Error> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.verified_tx.send_modify(|_| {});
        self.backend.close().await.map_err(Error::StorageIO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::InfoHash;
    use std::time::Duration;

    /// A torrent of `pieces` pieces of 2 blocks, filled with the piece index.
    fn torrent(pieces: usize) -> (Arc<TorrentMetadata>, Vec<u8>) {
        let piece_length = 2 * BLOCK_LEN;
        let data: Vec<u8> = (0..pieces)
            .flat_map(|p| vec![p as u8; piece_length as usize])
            .collect();
        let hashes = data
            .chunks(piece_length as usize)
            .map(|c| Sha1::from(c).digest().bytes())
            .collect();
        let meta = TorrentMetadata::new(
            InfoHash::default(),
            "t",
            piece_length,
            vec![("t".into(), data.len() as u64)],
            hashes,
        )
        .unwrap();
        (Arc::new(meta), data)
    }

    fn block(data: &[u8], piece: usize, b: usize) -> &[u8] {
        let start = piece * 2 * BLOCK_LEN as usize + b * BLOCK_LEN as usize;
        &data[start..start + BLOCK_LEN as usize]
    }

    async fn download(store: &PieceStore, data: &[u8], piece: usize) {
        store.write(piece, 0, block(data, piece, 0)).await.unwrap();
        store.write(piece, BLOCK_LEN, block(data, piece, 1)).await.unwrap();
        store.verify(piece).await.unwrap();
    }

    #[tokio::test]
    async fn write_verify_read() {
        let (meta, data) = torrent(3);
        let store = PieceStore::in_memory(meta);

        let r = store.write(1, 0, block(&data, 1, 0)).await.unwrap();
        assert_eq!(r, WriteOutcome::Stored { complete: false });

        // not complete yet
        assert!(matches!(
            store.verify(1).await,
            Err(Error::IncompleteRange { .. })
        ));

        let r = store.write(1, BLOCK_LEN, block(&data, 1, 1)).await.unwrap();
        assert_eq!(r, WriteOutcome::Stored { complete: true });

        store.verify(1).await.unwrap();
        assert!(store.is_verified(1).await);
        assert_eq!(store.drain_events().await, vec![StoreEvent::Verified(1)]);
        assert_eq!(store.verified_bytes(), 2 * BLOCK_LEN as u64);

        let piece_len = 2 * BLOCK_LEN as u64;
        let read = store.read(piece_len, piece_len).await.unwrap();
        assert_eq!(read, &data[piece_len as usize..2 * piece_len as usize]);

        // piece 0 is not there
        assert!(matches!(
            store.read(piece_len - 1, 2).await,
            Err(Error::IncompleteRange { .. })
        ));
        assert!(matches!(
            store.read(0, 10 * piece_len).await,
            Err(Error::RangeInvalid { .. })
        ));
    }

    #[tokio::test]
    async fn rewriting_a_verified_piece_is_idempotent() {
        let (meta, data) = torrent(2);
        let store = PieceStore::in_memory(meta);
        download(&store, &data, 0).await;
        store.drain_events().await;

        let before = store.have_bitmap().await;
        let r = store.write(0, 0, block(&data, 0, 0)).await.unwrap();
        assert_eq!(r, WriteOutcome::AlreadyVerified);
        assert_eq!(store.have_bitmap().await, before);
        assert!(store.drain_events().await.is_empty());

        // different bytes over verified data are rejected
        let other = vec![9u8; BLOCK_LEN as usize];
        assert!(matches!(
            store.write(0, 0, &other).await,
            Err(Error::BlockConflict { .. })
        ));
        assert!(store.is_verified(0).await);
    }

    #[tokio::test]
    async fn duplicate_and_conflicting_blocks() {
        let (meta, data) = torrent(1);
        let store = PieceStore::in_memory(meta);

        store.write(0, 0, block(&data, 0, 0)).await.unwrap();
        let r = store.write(0, 0, block(&data, 0, 0)).await.unwrap();
        assert_eq!(r, WriteOutcome::Duplicate);

        let other = vec![9u8; BLOCK_LEN as usize];
        assert!(matches!(
            store.write(0, 0, &other).await,
            Err(Error::BlockConflict { .. })
        ));
    }

    #[tokio::test]
    async fn blocks_out_of_bounds() {
        let (meta, data) = torrent(1);
        let store = PieceStore::in_memory(meta);
        let b = block(&data, 0, 0);

        assert!(matches!(
            store.write(1, 0, b).await,
            Err(Error::PieceIndexInvalid(1))
        ));
        assert!(matches!(
            store.write(0, 2 * BLOCK_LEN, b).await,
            Err(Error::BlockOutOfBounds { .. })
        ));
        // misaligned
        assert!(matches!(
            store.write(0, 1, &b[1..]).await,
            Err(Error::BlockOutOfBounds { .. })
        ));
        // too long
        let long = vec![0u8; BLOCK_LEN as usize + 1];
        assert!(matches!(
            store.write(0, 0, &long).await,
            Err(Error::BlockOutOfBounds { .. })
        ));
    }

    #[tokio::test]
    async fn corruption_resets_the_piece() {
        let (meta, data) = torrent(2);
        let store = PieceStore::in_memory(meta);

        store.write(1, 0, block(&data, 1, 0)).await.unwrap();
        store.write(1, BLOCK_LEN, &vec![7u8; BLOCK_LEN as usize]).await.unwrap();

        assert!(matches!(store.verify(1).await, Err(Error::Corruption(1))));
        assert!(!store.is_verified(1).await);
        assert_eq!(store.drain_events().await, vec![StoreEvent::Corrupted(1)]);

        // the piece can be downloaded again from scratch
        let r = store.write(1, BLOCK_LEN, block(&data, 1, 1)).await.unwrap();
        assert_eq!(r, WriteOutcome::Stored { complete: false });
        store.write(1, 0, block(&data, 1, 0)).await.unwrap();
        store.verify(1).await.unwrap();
        assert!(store.is_verified(1).await);
    }

    #[tokio::test]
    async fn have_bitmap_is_monotonic() {
        let (meta, data) = torrent(4);
        let store = PieceStore::in_memory(meta);
        let mut prev = store.have_bitmap().await;

        for piece in [2, 0, 3, 1] {
            download(&store, &data, piece).await;

            let have = store.have_bitmap().await;
            for i in prev.iter_ones() {
                assert!(have[i]);
            }
            assert!(have[piece]);
            prev = have;
        }

        assert!(prev.all());
    }

    #[tokio::test]
    async fn wait_for_range_wakes_up() {
        let (meta, data) = torrent(2);
        let store = Arc::new(PieceStore::in_memory(meta));

        let waiter = {
            let store = store.clone();
            tokio::spawn(async move { store.wait_for_range(0, 10).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        download(&store, &data, 0).await;
        let read = waiter.await.unwrap().unwrap();
        assert_eq!(read, &data[..10]);
    }

    #[tokio::test]
    async fn close_cancels_waiters() {
        let (meta, _) = torrent(2);
        let store = Arc::new(PieceStore::in_memory(meta));

        let waiter = {
            let store = store.clone();
            tokio::spawn(async move { store.wait_for_range(0, 10).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        store.close().await.unwrap();
        assert!(matches!(waiter.await.unwrap(), Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn recheck_finds_previous_data() {
        let (meta, mut data) = torrent(3);
        // piece 2 was left half written
        let len = data.len();
        data[len - 1] = 0xff;

        let backend = StorageBackend::Memory(MemoryStorage::with_data(data));
        let store = PieceStore::new(meta, backend);

        assert_eq!(store.recheck().await.unwrap(), 2);
        assert!(store.is_verified(0).await);
        assert!(store.is_verified(1).await);
        assert!(!store.is_verified(2).await);
    }
}
