//! Where candidate peer addresses come from.
//!
//! Trackers and the DHT are not implemented. A session is seeded with a
//! static list, usually the `x.pe` fields of a magnet link, and any other
//! discovery mechanism can be plugged in by implementing [`PeerSource`].
use std::{collections::VecDeque, net::SocketAddr};

use futures::future::BoxFuture;
use hashbrown::HashSet;

pub trait PeerSource: Send {
    /// Up to `max` addresses that were not returned before. An empty list
    /// means that the source has nothing new right now, it may be polled
    /// again later.
    fn next_peers(&mut self, max: usize) -> BoxFuture<'_, Vec<SocketAddr>>;
}

/// A fixed list of addresses, each one is returned once.
#[derive(Debug, Default, Clone)]
pub struct StaticPeers {
    queue: VecDeque<SocketAddr>,
}

impl StaticPeers {
    pub fn new(peers: impl IntoIterator<Item = SocketAddr>) -> Self {
        let mut seen = HashSet::new();
        let queue = peers.into_iter().filter(|p| seen.insert(*p)).collect();
        Self { queue }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl PeerSource for StaticPeers {
    fn next_peers(&mut self, max: usize) -> BoxFuture<'_, Vec<SocketAddr>> {
        let n = max.min(self.queue.len());
        let peers = self.queue.drain(..n).collect();
        Box::pin(async move { peers })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_peers_are_returned_once() {
        let a: SocketAddr = "10.0.0.1:6881".parse().unwrap();
        let b: SocketAddr = "10.0.0.2:6881".parse().unwrap();
        let c: SocketAddr = "10.0.0.3:6881".parse().unwrap();

        let mut source = StaticPeers::new([a, b, a, c]);
        assert_eq!(source.len(), 3);

        assert_eq!(source.next_peers(2).await, vec![a, b]);
        assert_eq!(source.next_peers(2).await, vec![c]);
        assert!(source.next_peers(2).await.is_empty());
        assert!(source.is_empty());
    }
}
