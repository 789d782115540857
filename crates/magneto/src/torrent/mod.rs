//! A download session: the orchestrator of one torrent.
//!
//! [`DownloadSession`] is a handle, the work happens on a task that owns the
//! [`SwarmManager`] and the [`PieceScheduler`]. Peers report to that task
//! with [`SessionMsg`] and progress goes out through a watch channel, so any
//! number of sessions can run side by side.
mod types;

pub use types::*;

use std::{collections::BTreeMap, net::SocketAddr, sync::Arc};

use tokio::{
    net::TcpListener,
    select, spawn,
    sync::{mpsc, watch, Mutex, OnceCell},
    task::JoinHandle,
    time::{interval, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    config::Config,
    counter::Counter,
    disk::{PieceStore, StoreEvent, WriteOutcome},
    error::Error,
    magnet::Magnet,
    metainfo::{FileEntry, TorrentMetadata},
    peer::{Connector, PeerId, PeerMsg, TcpConnector},
    peer_source::{PeerSource, StaticPeers},
    scheduler::{PeerSlot, PieceScheduler, Received, Strategy},
    swarm::SwarmManager,
    wire::{Block, BlockInfo},
};

/// Called once, when the stream buffer is ready.
pub type BufferReadyFn = Box<dyn FnOnce() + Send + 'static>;

/// Context of a session that is shared with its peers.
#[derive(Debug)]
pub struct SessionCtx {
    pub tx: mpsc::Sender<SessionMsg>,
    pub info_hash: InfoHash,
    pub local_peer_id: PeerId,
    pub store: Arc<PieceStore>,
    pub meta: Arc<TorrentMetadata>,
    pub config: Arc<Config>,
    /// Bytes of every peer of the session.
    pub counter: Counter,
}

/// Everything [`DownloadSession::start`] consumes.
struct Launch {
    metadata: MetadataSource,
    magnet: Option<Magnet>,
    source: Box<dyn PeerSource>,
    extra_peers: Vec<SocketAddr>,
    connector: Arc<dyn Connector>,
    in_memory: bool,
    on_buffer_ready: Option<BufferReadyFn>,
}

struct Running {
    ctx: Arc<SessionCtx>,
    target_file: Option<usize>,
    listen_addr: Option<SocketAddr>,
    task: JoinHandle<()>,
}

pub struct SessionBuilder {
    config: Config,
    metadata: Option<MetadataSource>,
    magnet: Option<Magnet>,
    peers: Vec<SocketAddr>,
    source: Option<Box<dyn PeerSource>>,
    connector: Option<Arc<dyn Connector>>,
    mode: Mode,
    in_memory: bool,
    on_buffer_ready: Option<BufferReadyFn>,
}

impl SessionBuilder {
    pub fn metadata(mut self, meta: TorrentMetadata) -> Self {
        self.metadata = Some(MetadataSource::Resolved(meta));
        self
    }

    pub fn torrent_file(mut self, path: impl Into<std::path::PathBuf>) -> Self {
        self.metadata = Some(MetadataSource::TorrentFile(path.into()));
        self
    }

    /// The peers of the magnet link are used, and its info hash must match
    /// the metadata.
    pub fn magnet(mut self, magnet: Magnet) -> Self {
        self.peers.extend(magnet.peers());
        self.magnet = Some(magnet);
        self
    }

    pub fn peers(mut self, peers: impl IntoIterator<Item = SocketAddr>) -> Self {
        self.peers.extend(peers);
        self
    }

    pub fn peer_source(mut self, source: impl PeerSource + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Transport of the outbound connections, TCP by default.
    pub fn connector(mut self, connector: impl Connector + 'static) -> Self {
        self.connector = Some(Arc::new(connector));
        self
    }

    pub fn mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    /// Keep the torrent in memory instead of the download dir.
    pub fn in_memory(mut self, in_memory: bool) -> Self {
        self.in_memory = in_memory;
        self
    }

    pub fn on_buffer_ready(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.on_buffer_ready = Some(Box::new(f));
        self
    }

    pub fn build(self) -> Result<DownloadSession, Error> {
        self.config.validate()?;
        let metadata = self.metadata.ok_or(Error::MetadataMissing)?;

        let (source, extra_peers): (Box<dyn PeerSource>, _) = match self.source {
            Some(source) => (source, self.peers),
            None => (Box::new(StaticPeers::new(self.peers)), Vec::new()),
        };

        let launch = Launch {
            metadata,
            magnet: self.magnet,
            source,
            extra_peers,
            connector: self.connector.unwrap_or_else(|| Arc::new(TcpConnector)),
            in_memory: self.in_memory,
            on_buffer_ready: self.on_buffer_ready,
        };

        let (progress_tx, _) = watch::channel(Progress::default());

        Ok(DownloadSession {
            config: Arc::new(self.config),
            mode: self.mode,
            launch: Mutex::new(Some(launch)),
            running: OnceCell::new(),
            progress_tx: Arc::new(progress_tx),
            cancel: CancellationToken::new(),
        })
    }
}

pub struct DownloadSession {
    config: Arc<Config>,
    mode: Mode,
    /// Locked by `start` until the session runs.
    launch: Mutex<Option<Launch>>,
    running: OnceCell<Running>,
    progress_tx: Arc<watch::Sender<Progress>>,
    cancel: CancellationToken,
}

impl DownloadSession {
    pub fn builder(config: Config) -> SessionBuilder {
        SessionBuilder {
            config,
            metadata: None,
            magnet: None,
            peers: Vec::new(),
            source: None,
            connector: None,
            mode: Mode::default(),
            in_memory: false,
            on_buffer_ready: None,
        }
    }

    fn set_state(&self, state: SessionState) {
        self.progress_tx.send_modify(|p| p.state = state);
    }

    /// Resolve the metadata, hash the data of a previous run, and start
    /// admitting peers and scheduling requests.
    ///
    /// # Errors
    ///
    /// Fails if the metadata cannot be resolved, on a storage error, or if
    /// the session was already started or cancelled.
    #[tracing::instrument(skip(self))]
    pub async fn start(&self) -> Result<(), Error> {
        let mut guard = self.launch.lock().await;

        if self.cancel.is_cancelled() {
            guard.take();
            self.set_state(SessionState::Cancelled);
            return Err(Error::Cancelled);
        }
        let Some(launch) = guard.take() else {
            return Err(Error::SessionAlreadyStarted);
        };

        self.set_state(SessionState::FetchingMetadata);

        match self.spawn_session(launch).await {
            Ok(running) => {
                let _ = self.running.set(running);
                Ok(())
            }
            Err(Error::Cancelled) => {
                self.set_state(SessionState::Cancelled);
                Err(Error::Cancelled)
            }
            Err(e) => {
                error!("could not start the session: {e}");
                self.set_state(SessionState::Failed(e.to_string()));
                Err(e)
            }
        }
    }

    async fn spawn_session(&self, launch: Launch) -> Result<Running, Error> {
        let Launch {
            metadata,
            magnet,
            source,
            extra_peers,
            connector,
            in_memory,
            on_buffer_ready,
        } = launch;

        let meta = Arc::new(metadata.resolve(magnet.as_ref()).await?);
        let (strategy, target_file) = strategy_for(&meta, self.mode, &self.config)?;

        info!(
            "starting {} ({}), {} pieces, {strategy:?}",
            meta.name,
            meta.info_hash,
            meta.piece_count()
        );

        let store = Arc::new(if in_memory {
            PieceStore::in_memory(meta.clone())
        } else {
            PieceStore::on_disk(meta.clone(), self.config.download_dir.clone())
        });
        store.recheck().await?;

        if self.cancel.is_cancelled() {
            store.close().await?;
            return Err(Error::Cancelled);
        }

        let have = store.have_bitmap().await;
        let scheduler =
            PieceScheduler::new(meta.clone(), strategy, &have, &self.config);

        let (tx, rx) = mpsc::channel::<SessionMsg>(512);

        let ctx = Arc::new(SessionCtx {
            tx: tx.clone(),
            info_hash: meta.info_hash.clone(),
            local_peer_id: PeerId::generate(),
            store,
            meta,
            config: self.config.clone(),
            counter: Counter::new(),
        });

        let mut swarm = SwarmManager::new(ctx.clone(), connector, source);
        for addr in extra_peers {
            swarm.add_candidate(addr);
        }

        let (listener, listen_addr) = if self.config.accept_inbound {
            match bind_listener(&self.config).await {
                Some(listener) => {
                    let addr = listener.local_addr().ok();
                    (Some(spawn_listener(listener, tx)), addr)
                }
                None => {
                    warn!("no free port in {:?}, not accepting peers", self.config.listen_port_range);
                    (None, None)
                }
            }
        } else {
            (None, None)
        };

        let session_loop = SessionLoop {
            ctx: ctx.clone(),
            rx,
            swarm,
            scheduler,
            progress_tx: self.progress_tx.clone(),
            listener,
            on_buffer_ready,
            cancel: self.cancel.clone(),
            state: SessionState::Active,
            buffer_ready: false,
            seeding: false,
            stalled: false,
        };

        let task = spawn(session_loop.run());

        Ok(Running { ctx, target_file, listen_addr, task })
    }

    /// The latest progress snapshot.
    pub fn progress(&self) -> Progress {
        self.progress_tx.borrow().clone()
    }

    /// Watch every progress update.
    pub fn subscribe(&self) -> watch::Receiver<Progress> {
        self.progress_tx.subscribe()
    }

    /// The priority window of the stream is verified.
    pub fn is_buffer_ready(&self) -> bool {
        self.progress_tx.borrow().buffer_ready
    }

    /// Wait until the stream buffer is ready, or the whole torrent in
    /// download mode.
    ///
    /// # Errors
    ///
    /// [`Error::Cancelled`] if the session stops first.
    pub async fn wait_buffer_ready(&self) -> Result<(), Error> {
        self.wait_for(|p| p.buffer_ready).await
    }

    /// Wait until the session reaches [`SessionState::Completed`].
    pub async fn wait_complete(&self) -> Result<(), Error> {
        self.wait_for(|p| p.state == SessionState::Completed).await
    }

    async fn wait_for(&self, f: impl Fn(&Progress) -> bool) -> Result<(), Error> {
        let mut rx = self.subscribe();
        let progress = rx
            .wait_for(|p| f(p) || p.state.is_terminal())
            .await
            .map_err(|_| Error::Cancelled)?;
        let done = f(&*progress);
        drop(progress);

        if done {
            Ok(())
        } else {
            Err(Error::Cancelled)
        }
    }

    /// Read bytes of the torrent, `offset` counts from the start of the
    /// first file. Every piece of the range must be verified.
    ///
    /// # Errors
    ///
    /// [`Error::IncompleteRange`] if the data is not there yet.
    pub async fn read(&self, offset: u64, len: u64) -> Result<Vec<u8>, Error> {
        match self.running.get() {
            Some(running) => running.ctx.store.read(offset, len).await,
            None => Err(Error::IncompleteRange { offset, len }),
        }
    }

    /// Like [`Self::read`], waiting for the range to be verified.
    pub async fn read_wait(&self, offset: u64, len: u64) -> Result<Vec<u8>, Error> {
        match self.running.get() {
            Some(running) => running.ctx.store.wait_for_range(offset, len).await,
            None => Err(Error::Cancelled),
        }
    }

    /// The file that is streamed.
    pub fn target_file(&self) -> Option<&FileEntry> {
        let running = self.running.get()?;
        running.ctx.meta.files.get(running.target_file?)
    }

    pub fn metadata(&self) -> Option<&Arc<TorrentMetadata>> {
        self.running.get().map(|r| &r.ctx.meta)
    }

    /// Address of the inbound listener.
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.running.get()?.listen_addr
    }

    /// Stop every peer and release the storage. Safe to call more than once
    /// and at any time, a `start` in progress is waited for.
    #[tracing::instrument(skip(self))]
    pub async fn cancel(&self) -> Result<(), Error> {
        self.cancel.cancel();

        // once the lock is ours, start either runs the session or gave up
        let never_started = self.launch.lock().await.take().is_some();

        if never_started || self.running.get().is_none() {
            self.progress_tx.send_if_modified(|p| {
                if p.state.is_terminal() {
                    return false;
                }
                p.state = SessionState::Cancelled;
                true
            });
            return Ok(());
        }

        let mut progress = self.subscribe();
        let _ = progress.wait_for(|p| p.state.is_terminal()).await;

        Ok(())
    }
}

impl Drop for DownloadSession {
    fn drop(&mut self) {
        if let Some(running) = self.running.get() {
            running.task.abort();
        }
    }
}

/// The strategy of `mode`, and the target file when streaming.
pub fn strategy_for(
    meta: &TorrentMetadata,
    mode: Mode,
    config: &Config,
) -> Result<(Strategy, Option<usize>), Error> {
    let Mode::Stream { file } = mode else {
        return Ok((Strategy::RarestFirst, None));
    };

    let index = file.unwrap_or_else(|| meta.largest_file());
    let pieces = meta.pieces_of_file(index)?;
    let entry = &meta.files[index];

    let window = match config.stream_window_pieces {
        Some(n) => n,
        None => {
            let by_fraction = (entry.length as f64 * config.stream_buffer_fraction) as u64;
            let bytes = by_fraction.min(config.stream_buffer_bytes).max(1);
            meta.pieces_of_range(entry.offset, bytes).len()
        }
    };

    Ok((Strategy::Sequential { file: pieces, window: window.max(1) }, Some(index)))
}

async fn bind_listener(config: &Config) -> Option<TcpListener> {
    for port in config.listen_port_range.clone() {
        if let Ok(listener) = TcpListener::bind(("0.0.0.0", port)).await {
            return Some(listener);
        }
    }
    None
}

fn spawn_listener(
    listener: TcpListener,
    tx: mpsc::Sender<SessionMsg>,
) -> JoinHandle<()> {
    spawn(async move {
        debug!("accepting peers on {:?}", listener.local_addr());

        loop {
            match listener.accept().await {
                Ok((socket, addr)) => {
                    info!("received inbound connection from {addr}");
                    let _ = socket.set_nodelay(true);
                    if tx.send(SessionMsg::InboundPeer(socket, addr)).await.is_err() {
                        return;
                    }
                }
                Err(e) => warn!("could not accept a connection: {e}"),
            }
        }
    })
}

/// The task behind a [`DownloadSession`].
struct SessionLoop {
    ctx: Arc<SessionCtx>,
    rx: mpsc::Receiver<SessionMsg>,
    swarm: SwarmManager,
    scheduler: PieceScheduler,
    progress_tx: Arc<watch::Sender<Progress>>,
    listener: Option<JoinHandle<()>>,
    on_buffer_ready: Option<BufferReadyFn>,
    cancel: CancellationToken,
    state: SessionState,
    buffer_ready: bool,
    /// Everything is downloaded, peers only upload.
    seeding: bool,
    stalled: bool,
}

impl SessionLoop {
    #[tracing::instrument(skip_all)]
    async fn run(mut self) {
        self.state = match self.event_loop().await {
            Ok(()) => SessionState::Cancelled,
            Err(e) => {
                error!("session failed: {e}");
                SessionState::Failed(e.to_string())
            }
        };

        self.shutdown().await;
    }

    /// Returns `Ok` when the session is cancelled, and the error that
    /// stopped it otherwise.
    async fn event_loop(&mut self) -> Result<(), Error> {
        let config = self.ctx.config.clone();
        let cancel = self.cancel.clone();

        let mut tick_interval = interval(config.tick_interval());
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut sweep_interval = interval(config.sweep_interval());
        sweep_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        self.update_state();
        self.publish();

        loop {
            select! {
                biased;

                _ = cancel.cancelled() => return Ok(()),
                msg = self.rx.recv() => {
                    let Some(msg) = msg else { return Ok(()) };
                    let mut next = Some(msg);

                    // handle everything that is queued, then schedule once
                    while let Some(msg) = next {
                        self.handle_msg(msg).await?;
                        next = self.rx.try_recv().ok();
                    }

                    self.schedule();
                    self.update_state();
                    self.publish();
                }
                _ = tick_interval.tick() => {
                    self.ctx.counter.update_rates().await;
                    self.schedule();
                    self.update_state();
                    self.publish();
                }
                _ = sweep_interval.tick() => {
                    for addr in self.swarm.sweep(config.request_timeout()).await {
                        self.scheduler.release_peer(addr);
                    }
                    self.swarm.rechoke(config.upload_slots);
                    self.schedule();
                    self.update_stalled();
                }
            }
        }
    }

    async fn handle_msg(&mut self, msg: SessionMsg) -> Result<(), Error> {
        match msg {
            SessionMsg::PeerHandshaking(addr) => {
                self.swarm.on_handshaking(addr);
            }
            SessionMsg::PeerConnected(ctx) => {
                let addr = ctx.remote_addr;
                debug!("{addr} connected");
                self.swarm.on_connected(ctx);
                if self.seeding {
                    self.swarm.send(&addr, PeerMsg::SeedOnly);
                }
            }
            SessionMsg::PeerBitfield(addr, bitfield) => {
                self.swarm.on_bitfield(addr, bitfield);
            }
            SessionMsg::PeerHave(addr, piece) => {
                self.swarm.on_have(addr, piece);
            }
            SessionMsg::PeerChoked(addr) => {
                self.swarm.on_choke(addr, true);
                let released = self.scheduler.release_peer(addr);
                debug!("{addr} choked us, releasing {} requests", released.len());
            }
            SessionMsg::PeerUnchoked(addr) => {
                self.swarm.on_choke(addr, false);
            }
            SessionMsg::PeerInterested(_, _) => {
                self.swarm.rechoke(self.ctx.config.upload_slots);
            }
            SessionMsg::BlockReceived(addr, block) => {
                self.on_block(addr, block).await?;
            }
            SessionMsg::RequestsTimedOut(addr, blocks) => {
                let timed_out = self.scheduler.on_timed_out(addr, &blocks);
                debug!("{addr} {} requests back in the pool", timed_out.len());
            }
            SessionMsg::PeerClosed(addr, e) => {
                match e {
                    Some(e) => debug!("{addr} closed: {e}"),
                    None => debug!("{addr} closed"),
                }
                self.swarm.on_closed(addr);
                self.scheduler.release_peer(addr);
            }
            SessionMsg::InboundPeer(socket, addr) => {
                self.swarm.admit_inbound(addr, Box::new(socket));
            }
        }

        Ok(())
    }

    async fn on_block(&mut self, addr: SocketAddr, block: Block) -> Result<(), Error> {
        let info = block.info();

        if self.swarm.is_banned(&addr) {
            return Ok(());
        }

        // only the blocks the scheduler is waiting for reach the store
        let Received::Fresh { cancel, piece_complete } =
            self.scheduler.on_block_received(addr, &info)
        else {
            debug!("{addr} block not needed {info:?}");
            return Ok(());
        };

        let stored = match self.ctx.store.write(block.index, block.begin, &block.block).await
        {
            Ok(outcome) => outcome,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!("{addr} sent a bad block {info:?}: {e}");
                self.scheduler.on_block_rejected(addr, &info);
                return Ok(());
            }
        };

        for peer in cancel {
            self.swarm.send(&peer, PeerMsg::Cancel(info.clone()));
        }

        let store_complete = matches!(stored, WriteOutcome::Stored { complete: true });
        if piece_complete || store_complete {
            self.verify(info.piece()).await?;
        }

        Ok(())
    }

    async fn verify(&mut self, piece: usize) -> Result<(), Error> {
        match self.ctx.store.verify(piece).await {
            Ok(()) | Err(Error::Corruption(_)) => {}
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => debug!("piece {piece} not verified: {e}"),
        }

        for event in self.ctx.store.drain_events().await {
            match event {
                StoreEvent::Verified(piece) => {
                    self.scheduler.on_piece_verified(piece);
                    self.swarm.broadcast_have(piece);
                }
                StoreEvent::Corrupted(piece) => {
                    for peer in self.scheduler.on_piece_corrupt(piece) {
                        for closed in self.swarm.strike(peer) {
                            self.scheduler.release_peer(closed);
                        }
                    }
                }
            }
        }

        for (peer, info) in self.scheduler.take_cancels() {
            self.swarm.send(&peer, PeerMsg::Cancel(info));
        }

        Ok(())
    }

    /// Fill the free pipeline slots of the ready peers.
    fn schedule(&mut self) {
        if self.scheduler.is_complete() {
            return;
        }

        let depth = self.ctx.config.pipeline_depth;
        let ready = self.swarm.ready_peers();

        let slots: Vec<PeerSlot> = ready
            .iter()
            .map(|p| PeerSlot {
                peer: p.addr,
                have: &p.have,
                slots: depth.saturating_sub(self.scheduler.pending_count(&p.addr)),
            })
            .collect();

        let requests =
            self.scheduler.next_requests(&slots, self.swarm.availability(), Instant::now());

        let mut by_peer: BTreeMap<SocketAddr, Vec<BlockInfo>> = BTreeMap::new();
        for r in requests {
            by_peer.entry(r.peer).or_default().push(r.block);
        }

        for (addr, blocks) in by_peer {
            self.swarm.send(&addr, PeerMsg::Request(blocks));
        }
    }

    fn update_state(&mut self) {
        if !self.buffer_ready && self.scheduler.buffer_ready() {
            self.buffer_ready = true;
            info!("buffer is ready");
            if let Some(f) = self.on_buffer_ready.take() {
                f();
            }
        }

        if self.state == SessionState::Active && self.scheduler.target_complete() {
            info!("download complete");
            self.state = SessionState::Completed;
        }

        if !self.seeding && self.scheduler.is_complete() {
            info!("every piece is verified, seeding");
            self.seeding = true;
            self.swarm.broadcast(|| PeerMsg::SeedOnly);
        }
    }

    fn update_stalled(&mut self) {
        let stalled = !self.scheduler.is_complete()
            && self.swarm.connected_count() == 0
            && self.swarm.is_empty()
            && !self.swarm.has_candidates();

        if stalled && !self.stalled {
            warn!("{}", Error::NoPeersAvailable);
        }
        self.stalled = stalled;
        self.publish();
    }

    fn publish(&self) {
        let meta = &self.ctx.meta;
        let counter = &self.ctx.counter;

        let progress = Progress {
            fraction: self.ctx.store.verified_bytes() as f64 / meta.total_length as f64,
            downloaded: counter.total_download(),
            uploaded: counter.total_upload(),
            download_rate: counter.download_rate(),
            upload_rate: counter.upload_rate(),
            peers: self.swarm.connected_count(),
            state: self.state.clone(),
            buffer_ready: self.buffer_ready,
            stalled: self.stalled,
            verified_pieces: self.scheduler.verified_count(),
            total_pieces: meta.piece_count(),
        };

        self.progress_tx.send_if_modified(|p| {
            if *p == progress {
                return false;
            }
            *p = progress;
            true
        });
    }

    /// Release every peer, the listener and the storage.
    async fn shutdown(&mut self) {
        info!("shutting down the session");

        if let Some(listener) = self.listener.take() {
            listener.abort();
        }

        // peers blocked on a full channel fail right away
        self.rx.close();

        self.swarm.shutdown(self.ctx.config.shutdown_grace()).await;

        if let Err(e) = self.ctx.store.close().await {
            warn!("could not close the storage: {e}");
        }

        self.publish();
    }
}
