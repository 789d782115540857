//! The set of peers of a session.
//!
//! The swarm admits and evicts peers, keeps a read-only summary of every one
//! of them and aggregates their bitfields into the availability map that the
//! scheduler uses. It is owned by the session loop, peers only talk to it
//! through the session.
use std::{
    collections::VecDeque,
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use hashbrown::{HashMap, HashSet};
use tokio::{
    spawn,
    sync::mpsc,
    task::JoinHandle,
    time::{timeout, Instant},
};
use tracing::{debug, info, warn};

use crate::{
    bitfield::{Bitfield, BitfieldExt},
    peer::{
        BoxedStream, ConnectionState, Connector, Direction, Idle, Peer, PeerCtx,
        PeerMsg,
    },
    peer_source::PeerSource,
    torrent::{SessionCtx, SessionMsg},
};

/// What the swarm knows about one of its peers.
#[derive(Debug)]
pub struct PeerHandle {
    pub addr: SocketAddr,
    pub state: ConnectionState,
    /// Pieces that the peer advertises.
    pub have: Bitfield,
    /// Set once the peer handshaked.
    pub ctx: Option<Arc<PeerCtx>>,
    pub admitted_at: Instant,
    tx: mpsc::UnboundedSender<PeerMsg>,
    task: JoinHandle<()>,
}

impl PeerHandle {
    /// Download rate of the peer, used as its score.
    pub fn throughput(&self) -> u64 {
        self.ctx.as_ref().map(|c| c.counter.download_rate()).unwrap_or(0)
    }

    pub fn send(&self, msg: PeerMsg) -> bool {
        self.tx.send(msg).is_ok()
    }

    fn is_interested(&self) -> bool {
        self.ctx.as_ref().is_some_and(|c| c.is_interested())
    }
}

pub struct SwarmManager {
    session: Arc<SessionCtx>,
    connector: Arc<dyn Connector>,
    source: Box<dyn PeerSource>,
    max_peers: usize,
    max_strikes: u32,
    peers: HashMap<SocketAddr, PeerHandle>,
    /// Known addresses that were not admitted yet.
    candidates: VecDeque<SocketAddr>,
    /// Bans and strikes count against hosts, a peer that comes back on
    /// another port is the same peer.
    banned: HashSet<IpAddr>,
    strikes: HashMap<IpAddr, u32>,
    /// For every piece, how many handshaked peers advertise it.
    availability: Vec<u32>,
}

impl SwarmManager {
    pub fn new(
        session: Arc<SessionCtx>,
        connector: Arc<dyn Connector>,
        source: Box<dyn PeerSource>,
    ) -> Self {
        let availability = vec![0; session.meta.piece_count()];

        Self {
            max_peers: session.config.max_peers,
            max_strikes: session.config.max_corruption_strikes,
            session,
            connector,
            source,
            peers: HashMap::new(),
            candidates: VecDeque::new(),
            banned: HashSet::new(),
            strikes: HashMap::new(),
            availability,
        }
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Peers that finished the handshake.
    pub fn connected_count(&self) -> usize {
        self.peers.values().filter(|p| p.state.is_handshaked()).count()
    }

    pub fn has_candidates(&self) -> bool {
        !self.candidates.is_empty()
    }

    pub fn is_banned(&self, addr: &SocketAddr) -> bool {
        self.banned.contains(&addr.ip())
    }

    pub fn get(&self, addr: &SocketAddr) -> Option<&PeerHandle> {
        self.peers.get(addr)
    }

    pub fn availability(&self) -> &[u32] {
        &self.availability
    }

    /// Remember an address to be admitted when there is room.
    pub fn add_candidate(&mut self, addr: SocketAddr) {
        if !self.is_banned(&addr)
            && !self.peers.contains_key(&addr)
            && !self.candidates.contains(&addr)
        {
            self.candidates.push_back(addr);
        }
    }

    fn can_admit(&self, addr: &SocketAddr) -> bool {
        self.peers.len() < self.max_peers
            && !self.peers.contains_key(addr)
            && !self.is_banned(addr)
    }

    /// Start a connection to `addr`, if the swarm is not full. Returns
    /// whether the peer was admitted.
    pub fn admit_peer(&mut self, addr: SocketAddr) -> bool {
        if !self.can_admit(&addr) {
            return false;
        }
        self.candidates.retain(|c| *c != addr);
        self.spawn_peer(addr, Direction::Outbound, None);
        true
    }

    /// Admit a peer that connected to us.
    pub fn admit_inbound(&mut self, addr: SocketAddr, socket: BoxedStream) -> bool {
        if !self.can_admit(&addr) {
            debug!("{addr} refusing inbound connection");
            return false;
        }
        self.spawn_peer(addr, Direction::Inbound, Some(socket));
        true
    }

    fn spawn_peer(
        &mut self,
        addr: SocketAddr,
        direction: Direction,
        socket: Option<BoxedStream>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = self.session.clone();
        let connector = self.connector.clone();
        let peer_tx = tx.clone();

        debug!("{addr} admitting {direction:?} peer");

        let task = spawn(async move {
            let peer = Peer::<Idle>::new(direction, addr, session.clone(), peer_tx, rx);

            let connected = match socket {
                Some(socket) => peer.handshake(socket).await,
                None => peer.connect(connector.as_ref()).await,
            };

            let result = match connected {
                Ok(mut peer) => peer.run().await,
                Err(e) => Err(e),
            };

            if let Err(e) = &result {
                debug!("{addr} peer session stopped due to an error: {e}");
            }

            let _ = session.tx.send(SessionMsg::PeerClosed(addr, result.err())).await;
        });

        self.peers.insert(
            addr,
            PeerHandle {
                addr,
                state: ConnectionState::Connecting,
                have: Bitfield::from_piece(self.availability.len()),
                ctx: None,
                admitted_at: Instant::now(),
                tx,
                task,
            },
        );
    }

    pub fn on_handshaking(&mut self, addr: SocketAddr) {
        let Some(peer) = self.peers.get_mut(&addr) else { return };
        if peer.state == ConnectionState::Connecting {
            peer.state = ConnectionState::Handshaking;
        }
    }

    pub fn on_connected(&mut self, ctx: Arc<PeerCtx>) {
        let Some(peer) = self.peers.get_mut(&ctx.remote_addr) else { return };
        peer.state = ConnectionState::Choked;
        peer.ctx = Some(ctx);
    }

    pub fn on_choke(&mut self, addr: SocketAddr, choked: bool) {
        let Some(peer) = self.peers.get_mut(&addr) else { return };
        if peer.state.is_handshaked() {
            peer.state =
                if choked { ConnectionState::Choked } else { ConnectionState::Ready };
        }
    }

    /// Replace the bitfield of a peer.
    pub fn on_bitfield(&mut self, addr: SocketAddr, bitfield: Bitfield) {
        let Some(peer) = self.peers.get_mut(&addr) else { return };

        for piece in peer.have.iter_ones() {
            self.availability[piece] = self.availability[piece].saturating_sub(1);
        }
        for piece in bitfield.iter_ones() {
            if let Some(n) = self.availability.get_mut(piece) {
                *n += 1;
            }
        }

        peer.have = bitfield;
    }

    pub fn on_have(&mut self, addr: SocketAddr, piece: usize) {
        let Some(peer) = self.peers.get_mut(&addr) else { return };
        if piece < self.availability.len() && !peer.have.has(piece) {
            peer.have.set(piece, true);
            self.availability[piece] += 1;
        }
    }

    /// Forget a peer, its pieces no longer count for availability.
    pub fn on_closed(&mut self, addr: SocketAddr) -> Option<PeerHandle> {
        let mut peer = self.peers.remove(&addr)?;

        for piece in peer.have.iter_ones() {
            self.availability[piece] = self.availability[piece].saturating_sub(1);
        }
        peer.state = ConnectionState::Closed;

        Some(peer)
    }

    /// Peers that can take requests right now, best first.
    pub fn ready_peers(&self) -> Vec<&PeerHandle> {
        let mut peers: Vec<&PeerHandle> = self
            .peers
            .values()
            .filter(|p| p.state == ConnectionState::Ready)
            .collect();

        peers.sort_by(|a, b| {
            b.throughput().cmp(&a.throughput()).then(a.addr.cmp(&b.addr))
        });
        peers
    }

    /// Ready peers that advertise `piece`, best first.
    pub fn candidate_peers_for(&self, piece: usize) -> Vec<SocketAddr> {
        self.ready_peers()
            .into_iter()
            .filter(|p| p.have.has(piece))
            .map(|p| p.addr)
            .collect()
    }

    /// Close the handshaked peer with the lowest throughput.
    pub fn evict_worst_peer(&mut self) -> Option<SocketAddr> {
        let worst = self
            .peers
            .values()
            .filter(|p| p.state.is_handshaked())
            .min_by(|a, b| {
                a.throughput().cmp(&b.throughput()).then(a.addr.cmp(&b.addr))
            })?
            .addr;

        info!("{worst} evicting the worst peer");
        if let Some(peer) = self.on_closed(worst) {
            peer.send(PeerMsg::Quit);
        }

        Some(worst)
    }

    /// Count a bad piece against the host of a peer. Once the host is
    /// banned its peers are closed and never admitted again. Returns the
    /// peers closed by the ban.
    pub fn strike(&mut self, addr: SocketAddr) -> Vec<SocketAddr> {
        let ip = addr.ip();
        let strikes = self.strikes.entry(ip).or_default();
        *strikes += 1;

        if *strikes < self.max_strikes {
            debug!("{addr} strike {strikes}");
            return Vec::new();
        }

        warn!("{addr} sent too many corrupted pieces, banning {ip}");
        self.banned.insert(ip);
        self.candidates.retain(|c| c.ip() != ip);

        let mut closed: Vec<SocketAddr> =
            self.peers.keys().filter(|a| a.ip() == ip).copied().collect();
        closed.sort();
        for addr in &closed {
            if let Some(peer) = self.on_closed(*addr) {
                peer.send(PeerMsg::Quit);
            }
        }

        closed
    }

    /// Drop dead peers, ask the peer source for more and fill the free slots.
    /// At capacity, a peer that transfers nothing makes room for a new
    /// candidate. Returns the peers that were removed.
    pub async fn sweep(&mut self, min_age: Duration) -> Vec<SocketAddr> {
        let mut removed: Vec<SocketAddr> = self
            .peers
            .values()
            .filter(|p| p.task.is_finished())
            .map(|p| p.addr)
            .collect();

        for addr in &removed {
            self.on_closed(*addr);
        }

        let wanted = self.max_peers.saturating_sub(self.peers.len() + self.candidates.len());
        if wanted > 0 {
            for addr in self.source.next_peers(wanted).await {
                self.add_candidate(addr);
            }
        }

        while self.peers.len() < self.max_peers {
            let Some(addr) = self.candidates.pop_front() else { break };
            self.admit_peer(addr);
        }

        if self.peers.len() >= self.max_peers && !self.candidates.is_empty() {
            let now = Instant::now();
            let idle_worst = self
                .peers
                .values()
                .filter(|p| p.state.is_handshaked())
                .filter(|p| now.saturating_duration_since(p.admitted_at) >= min_age)
                .min_by_key(|p| (p.throughput(), p.addr))
                .filter(|p| p.throughput() == 0)
                .map(|p| p.addr);

            if idle_worst.is_some() {
                if let Some(addr) = self.evict_worst_peer() {
                    removed.push(addr);
                    if let Some(next) = self.candidates.pop_front() {
                        self.admit_peer(next);
                    }
                }
            }
        }

        removed
    }

    /// Send Have to the handshaked peers that do not advertise `piece`.
    pub fn broadcast_have(&self, piece: usize) {
        for peer in self.peers.values() {
            if peer.state.is_handshaked() && !peer.have.has(piece) {
                peer.send(PeerMsg::Have(piece));
            }
        }
    }

    pub fn send(&self, addr: &SocketAddr, msg: PeerMsg) -> bool {
        self.peers.get(addr).is_some_and(|p| p.send(msg))
    }

    pub fn broadcast(&self, msg: impl Fn() -> PeerMsg) {
        for peer in self.peers.values() {
            peer.send(msg());
        }
    }

    /// Unchoke the interested peers that give us the most, up to `slots`,
    /// and choke the others.
    pub fn rechoke(&self, slots: usize) {
        let mut interested: Vec<&PeerHandle> = self
            .peers
            .values()
            .filter(|p| p.state.is_handshaked() && p.is_interested())
            .collect();

        interested.sort_by(|a, b| {
            b.throughput().cmp(&a.throughput()).then(a.addr.cmp(&b.addr))
        });

        let unchoked: HashSet<SocketAddr> =
            interested.iter().take(slots).map(|p| p.addr).collect();

        for peer in self.peers.values().filter(|p| p.state.is_handshaked()) {
            if unchoked.contains(&peer.addr) {
                peer.send(PeerMsg::Unchoke);
            } else {
                peer.send(PeerMsg::Choke);
            }
        }
    }

    /// Ask every peer to quit and wait up to `grace` for them, the ones that
    /// do not answer in time are aborted.
    pub async fn shutdown(&mut self, grace: Duration) {
        self.candidates.clear();

        let peers: Vec<PeerHandle> = self.peers.drain().map(|(_, p)| p).collect();
        for peer in &peers {
            peer.send(PeerMsg::Quit);
        }

        let deadline = Instant::now() + grace;

        for peer in peers {
            let abort = peer.task.abort_handle();
            let left = deadline.saturating_duration_since(Instant::now());
            if timeout(left, peer.task).await.is_err() {
                debug!("{} did not quit in time, aborting", peer.addr);
                abort.abort();
            }
        }

        self.availability.iter_mut().for_each(|n| *n = 0);
    }
}
