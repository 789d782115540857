use std::time::Duration;

use tokio::time::Instant;

/// Lifecycle of a connection, `Closed` is terminal.
#[derive(Clone, Default, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Opening the byte stream.
    #[default]
    Connecting,

    /// Exchanging handshakes.
    Handshaking,

    /// Handshaked and unchoked by the peer, requests can be sent.
    Ready,

    /// Handshaked but the peer does not allow us to download. Every
    /// connection starts choked.
    Choked,

    Closed,
}

impl ConnectionState {
    /// The peer handshaked and its pieces count for availability.
    pub fn is_handshaked(&self) -> bool {
        matches!(self, Self::Ready | Self::Choked)
    }
}

/// Holds and provides facilities to modify the state of a peer session.
#[derive(Debug)]
pub struct Session {
    /// The current state of the connection.
    pub connection: ConnectionState,

    /// Anything received, keep-alives included.
    pub last_received: Instant,

    pub last_sent: Instant,

    /// If the torrent was fully downloaded, the peer will only seed.
    pub seed_only: bool,
}

impl Default for Session {
    fn default() -> Self {
        let now = Instant::now();
        Self {
            connection: ConnectionState::default(),
            last_received: now,
            last_sent: now,
            seed_only: false,
        }
    }
}

impl Session {
    /// Keep-alives are sent at most this long apart.
    pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(60);

    pub fn received(&mut self) {
        self.last_received = Instant::now();
    }

    pub fn sent(&mut self) {
        self.last_sent = Instant::now();
    }

    /// Nothing was received for `idle_timeout`.
    pub fn is_idle(&self, now: Instant, idle_timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_received) >= idle_timeout
    }

    /// A keep-alive is due, so that the peer does not drop us.
    pub fn needs_keep_alive(&self, now: Instant, idle_timeout: Duration) -> bool {
        let every = Self::KEEP_ALIVE_INTERVAL.min(idle_timeout / 2);
        now.saturating_duration_since(self.last_sent) >= every
    }
}
