//! A remote peer in the network that downloads and uploads data.
//!
//! Every peer runs on its own task. It never mutates shared state: blocks,
//! pieces and state changes are reported to the session with
//! [`SessionMsg`], and the session answers with [`PeerMsg`].
mod request_manager;
pub mod session;
mod types;

pub use session::ConnectionState;
pub use types::*;

use request_manager::RequestManager;

use std::{
    net::SocketAddr,
    sync::{atomic::Ordering, Arc},
};

use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tokio::{
    select,
    sync::mpsc,
    time::{interval, timeout, Instant, MissedTickBehavior},
};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::{
    bitfield::{Bitfield, BitfieldExt},
    error::Error,
    peer::session::Session,
    torrent::{SessionCtx, SessionMsg},
    wire::{Block, BlockInfo, Core, CoreCodec, Handshake, HandshakeCodec},
};

pub trait PeerState {}

/// A peer that is not connected yet.
pub struct Idle {
    pub direction: Direction,
    pub remote_addr: SocketAddr,
    session: Arc<SessionCtx>,
    tx: mpsc::UnboundedSender<PeerMsg>,
    rx: mpsc::UnboundedReceiver<PeerMsg>,
}

/// A peer that handshaked with us.
pub struct Connected {
    pub ctx: Arc<PeerCtx>,
    session: Arc<SessionCtx>,
    sink: SplitSink<Framed<BoxedStream, CoreCodec>, Core>,
    stream: SplitStream<Framed<BoxedStream, CoreCodec>>,
    rx: mpsc::UnboundedReceiver<PeerMsg>,
    /// Pieces that the peer advertises.
    pieces: Bitfield,
    requests: RequestManager,
    conn: Session,
}

impl PeerState for Idle {}
impl PeerState for Connected {}

pub struct Peer<S: PeerState> {
    pub state: S,
}

impl Peer<Idle> {
    pub fn new(
        direction: Direction,
        remote_addr: SocketAddr,
        session: Arc<SessionCtx>,
        tx: mpsc::UnboundedSender<PeerMsg>,
        rx: mpsc::UnboundedReceiver<PeerMsg>,
    ) -> Self {
        Self { state: Idle { direction, remote_addr, session, tx, rx } }
    }

    /// Open a stream to the peer and handshake.
    ///
    /// # Errors
    ///
    /// [`Error::UnreachablePeer`] if the stream cannot be opened in time.
    pub async fn connect(
        self,
        connector: &dyn Connector,
    ) -> Result<Peer<Connected>, Error> {
        let remote = self.state.remote_addr;
        let connect_timeout = self.state.session.config.connect_timeout();

        let socket = match timeout(connect_timeout, connector.connect(remote)).await {
            Ok(Ok(socket)) => socket,
            Ok(Err(e)) => {
                debug!("{remote} could not connect: {e}");
                return Err(Error::UnreachablePeer(remote));
            }
            Err(_) => {
                debug!("{remote} connect timed out");
                return Err(Error::UnreachablePeer(remote));
            }
        };

        self.handshake(socket).await
    }

    /// Exchange handshakes on an open stream. The outbound side sends its
    /// handshake first.
    #[tracing::instrument(skip_all, fields(remote = %self.state.remote_addr))]
    pub async fn handshake(
        self,
        socket: BoxedStream,
    ) -> Result<Peer<Connected>, Error> {
        let handshake_timeout = self.state.session.config.connect_timeout();

        timeout(handshake_timeout, self.exchange_handshakes(socket))
            .await
            .map_err(|_| Error::HandshakeTimeout)?
    }

    async fn exchange_handshakes(
        self,
        socket: BoxedStream,
    ) -> Result<Peer<Connected>, Error> {
        let Idle { direction, remote_addr: remote, session, tx, rx } =
            self.state;

        session.tx.send(SessionMsg::PeerHandshaking(remote)).await?;

        let mut socket = Framed::new(socket, HandshakeCodec);
        let ours =
            Handshake::new(session.info_hash.clone(), session.local_peer_id.clone());

        if direction == Direction::Outbound {
            debug!("{remote} sending the first handshake");
            socket.send(ours.clone()).await?;
        }

        let theirs = match socket.next().await {
            Some(Ok(theirs)) => theirs,
            Some(Err(e)) => {
                warn!("{remote} sent an invalid handshake: {e}");
                return Err(Error::HandshakeInvalid);
            }
            None => return Err(Error::PeerClosedSocket),
        };

        if !theirs.validate(&ours) {
            return Err(Error::HandshakeInvalid);
        }

        if direction == Direction::Inbound {
            debug!("{remote} sending the second handshake");
            socket.send(ours).await?;
        }

        // whatever came right after the handshake stays in the read buffer
        let (sink, stream) = socket.map_codec(|_| CoreCodec).split();

        let ctx = Arc::new(PeerCtx::new(direction, remote, theirs.peer_id, tx));
        let pieces = Bitfield::from_piece(session.meta.piece_count());

        let mut conn = Session::default();
        conn.connection = ConnectionState::Choked;

        info!("{remote} {:?} handshaked, id {}", ctx.direction, ctx.id);

        Ok(Peer {
            state: Connected {
                ctx,
                session,
                sink,
                stream,
                rx,
                pieces,
                requests: RequestManager::new(),
                conn,
            },
        })
    }
}

impl Peer<Connected> {
    pub fn remote_addr(&self) -> SocketAddr {
        self.state.ctx.remote_addr
    }

    /// Start the event loop of the Peer, listen to messages sent by the
    /// remote peer and by the session. Returns `Ok` when the session asks
    /// the peer to quit.
    pub async fn run(&mut self) -> Result<(), Error> {
        let remote = self.state.ctx.remote_addr;
        let session = self.state.session.clone();

        session.tx.send(SessionMsg::PeerConnected(self.state.ctx.clone())).await?;

        let have = session.store.have_bitmap().await;
        if have.any() {
            debug!("{remote} sending bitfield");
            self.send(Core::Bitfield(have)).await?;
        }

        // update rates, check for timed-out requests and idle connections
        let mut tick_interval = interval(session.config.tick_interval());
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            select! {
                msg = self.state.stream.next() => {
                    match msg {
                        Some(Ok(msg)) => {
                            self.state.conn.received();
                            self.handle_msg(msg).await?;
                        }
                        Some(Err(e)) => return Err(e),
                        None => return Err(Error::PeerClosedSocket),
                    }
                }
                msg = self.state.rx.recv() => {
                    let Some(msg) = msg else { return Ok(()) };
                    if !self.handle_peer_msg(msg).await? {
                        self.state.conn.connection = ConnectionState::Closed;
                        return Ok(());
                    }
                }
                _ = tick_interval.tick() => {
                    self.tick().await?;
                }
            }
        }
    }

    async fn send(&mut self, msg: Core) -> Result<(), Error> {
        self.state.sink.send(msg).await?;
        self.state.conn.sent();
        Ok(())
    }

    /// Handle a message of the remote peer.
    async fn handle_msg(&mut self, msg: Core) -> Result<(), Error> {
        let remote = self.state.ctx.remote_addr;
        let piece_count = self.state.session.meta.piece_count();
        let ctx = self.state.ctx.clone();
        let tx = self.state.session.tx.clone();

        match msg {
            Core::KeepAlive => {}
            Core::Choke => {
                debug!("{remote} choked us");
                ctx.peer_choking.store(true, Ordering::Relaxed);
                self.state.conn.connection = ConnectionState::Choked;

                // a choked peer discards our requests
                self.state.requests.drain();
                tx.send(SessionMsg::PeerChoked(remote)).await?;
            }
            Core::Unchoke => {
                debug!("{remote} unchoked us");
                ctx.peer_choking.store(false, Ordering::Relaxed);
                self.state.conn.connection = ConnectionState::Ready;
                tx.send(SessionMsg::PeerUnchoked(remote)).await?;
            }
            Core::Interested | Core::NotInterested => {
                let interested = msg == Core::Interested;
                debug!("{remote} interested: {interested}");
                ctx.peer_interested.store(interested, Ordering::Relaxed);
                tx.send(SessionMsg::PeerInterested(remote, interested)).await?;
            }
            Core::Have(piece) => {
                if piece >= piece_count {
                    return Err(Error::ProtocolViolation(format!(
                        "have of piece {piece} out of {piece_count}"
                    )));
                }
                self.state.pieces.set(piece, true);
                tx.send(SessionMsg::PeerHave(remote, piece)).await?;
                self.update_interest().await?;
            }
            Core::Bitfield(raw) => {
                let expected = piece_count.div_ceil(8);
                if raw.as_raw_slice().len() != expected {
                    return Err(Error::ProtocolViolation(format!(
                        "bitfield of {} bytes, expected {expected}",
                        raw.as_raw_slice().len()
                    )));
                }
                let pieces = Bitfield::from_wire(raw.into_vec(), piece_count);
                debug!("{remote} has {} pieces", pieces.count_ones());

                self.state.pieces = pieces.clone();
                tx.send(SessionMsg::PeerBitfield(remote, pieces)).await?;
                self.update_interest().await?;
            }
            Core::Request(info) => self.handle_request(info).await?,
            Core::Piece(block) => self.handle_piece_msg(block).await?,
            // requests are answered right away, there is nothing to cancel
            Core::Cancel(_) => {}
        }

        Ok(())
    }

    /// Serve a block to the peer, only if we are not choking it and the
    /// piece is verified.
    async fn handle_request(&mut self, info: BlockInfo) -> Result<(), Error> {
        let remote = self.state.ctx.remote_addr;

        if !info.is_valid() {
            return Err(Error::ProtocolViolation(format!(
                "request of {} bytes",
                info.len
            )));
        }

        if self.state.ctx.am_choking.load(Ordering::Relaxed) {
            debug!("{remote} requested while choked, ignoring");
            return Ok(());
        }

        let data = match self.state.session.store.read_block(&info).await {
            Ok(data) => data,
            Err(e) => {
                debug!("{remote} cannot serve {info:?}: {e}");
                return Ok(());
            }
        };

        let len = data.len() as u64;
        let block = Block { index: info.piece(), begin: info.begin, block: data };
        self.send(Core::Piece(block)).await?;

        self.state.ctx.counter.record_upload(len);
        self.state.session.counter.record_upload(len);

        Ok(())
    }

    /// Handle a new Piece msg from the peer, a Piece msg actually sends
    /// a block, and not a piece.
    async fn handle_piece_msg(&mut self, block: Block) -> Result<(), Error> {
        let remote = self.state.ctx.remote_addr;

        if !block.is_valid() {
            return Err(Error::ProtocolViolation(format!(
                "block of {} bytes",
                block.block.len()
            )));
        }

        let info = block.info();

        // late blocks of timed-out or cancelled requests are dropped
        if !self.state.requests.remove_request(&info) {
            debug!("{remote} sent a block that was not requested {info:?}");
            return Ok(());
        }

        let len = block.block.len() as u64;
        self.state.ctx.counter.record_download(len);
        self.state.session.counter.record_download(len);

        self.state.session.tx.send(SessionMsg::BlockReceived(remote, block)).await?;

        Ok(())
    }

    /// Handle a message of the session, returns false when the peer must
    /// quit.
    async fn handle_peer_msg(&mut self, msg: PeerMsg) -> Result<bool, Error> {
        let remote = self.state.ctx.remote_addr;
        let ctx = self.state.ctx.clone();

        match msg {
            PeerMsg::Request(blocks) => {
                if ctx.is_choking_us() {
                    debug!("{remote} is choking us, dropping {} requests", blocks.len());
                    return Ok(true);
                }

                if !ctx.am_interested.swap(true, Ordering::Relaxed) {
                    self.send(Core::Interested).await?;
                }

                let deadline =
                    Instant::now() + self.state.session.config.request_timeout();

                for block in blocks {
                    if self.state.requests.add_request(block.clone(), deadline) {
                        self.state.sink.feed(Core::Request(block)).await?;
                    }
                }
                self.state.sink.flush().await?;
                self.state.conn.sent();
            }
            PeerMsg::Cancel(block) => {
                if self.state.requests.remove_request(&block) {
                    debug!("{remote} cancel {block:?}");
                    self.send(Core::Cancel(block)).await?;
                }
            }
            PeerMsg::Have(piece) => {
                if !self.state.pieces.has(piece) {
                    self.send(Core::Have(piece)).await?;
                }
            }
            PeerMsg::Choke => {
                if !ctx.am_choking.swap(true, Ordering::Relaxed) {
                    debug!("{remote} sending choke");
                    self.send(Core::Choke).await?;
                }
            }
            PeerMsg::Unchoke => {
                if ctx.am_choking.swap(false, Ordering::Relaxed) {
                    debug!("{remote} sending unchoke");
                    self.send(Core::Unchoke).await?;
                }
            }
            PeerMsg::SeedOnly => {
                self.state.conn.seed_only = true;
                self.state.requests.drain();
                if ctx.am_interested.swap(false, Ordering::Relaxed) {
                    self.send(Core::NotInterested).await?;
                }
            }
            PeerMsg::Quit => {
                debug!("{remote} quit");
                return Ok(false);
            }
        }

        Ok(true)
    }

    async fn tick(&mut self) -> Result<(), Error> {
        let remote = self.state.ctx.remote_addr;
        let config = self.state.session.config.clone();
        let now = Instant::now();

        self.state.ctx.counter.update_rates().await;

        let timed_out = self.state.requests.take_timed_out(now);
        if !timed_out.is_empty() {
            debug!("{remote} {} requests timed out", timed_out.len());

            for block in &timed_out {
                self.state.sink.feed(Core::Cancel(block.clone())).await?;
            }
            self.state.sink.flush().await?;

            self.state
                .session
                .tx
                .send(SessionMsg::RequestsTimedOut(remote, timed_out))
                .await?;
        }

        if self.state.conn.is_idle(now, config.idle_timeout()) {
            warn!("{remote} was idle for too long");
            return Err(Error::Timeout);
        }

        if self.state.conn.needs_keep_alive(now, config.idle_timeout()) {
            self.send(Core::KeepAlive).await?;
        }

        self.update_interest().await
    }

    /// Tell the peer whether it has pieces that we want.
    async fn update_interest(&mut self) -> Result<(), Error> {
        let interested = !self.state.conn.seed_only && self.has_piece_not_in_local().await;
        let ctx = self.state.ctx.clone();

        if interested && !ctx.am_interested.load(Ordering::Relaxed) {
            debug!("{} sending interested", ctx.remote_addr);
            ctx.am_interested.store(true, Ordering::Relaxed);
            self.send(Core::Interested).await?;
        }

        // sorry, you're not the problem, it's me.
        if !interested
            && self.state.requests.is_empty()
            && ctx.am_interested.load(Ordering::Relaxed)
        {
            debug!("{} sending not interested", ctx.remote_addr);
            ctx.am_interested.store(false, Ordering::Relaxed);
            self.send(Core::NotInterested).await?;
        }

        Ok(())
    }

    /// If this peer has a piece that we do not have.
    async fn has_piece_not_in_local(&self) -> bool {
        let local = self.state.session.store.have_bitmap().await;
        self.state.pieces.iter_ones().any(|i| !local.has(i))
    }
}
