//! In-process seeders that speak the wire protocol over duplex streams.
#![allow(dead_code)]

use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use futures::{future::BoxFuture, SinkExt, StreamExt};
use hashbrown::HashMap;
use magneto::{
    bitfield::{Bitfield, BitfieldExt},
    config::Config,
    error::Error,
    metainfo::TorrentMetadata,
    peer::{BoxedStream, Connector, PeerId},
    torrent::InfoHash,
    wire::{Block, Core, CoreCodec, Handshake, HandshakeCodec},
};
use rand::Rng;
use sha1_smol::Sha1;
use tokio::{io::DuplexStream, spawn};
use tokio_util::codec::Framed;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    Honest,
    /// Unchokes but never answers a request.
    Silent,
    /// Flips the first byte of every block.
    Corrupt,
}

/// A torrent with random content.
pub struct Fixture {
    pub meta: Arc<TorrentMetadata>,
    pub data: Arc<Vec<u8>>,
}

impl Fixture {
    pub fn new(piece_length: u32, files: &[u64]) -> Self {
        let total: u64 = files.iter().sum();
        let mut data = vec![0u8; total as usize];
        rand::thread_rng().fill(&mut data[..]);

        let hashes = data
            .chunks(piece_length as usize)
            .map(|piece| Sha1::from(piece).digest().bytes())
            .collect();

        let files = files
            .iter()
            .enumerate()
            .map(|(i, len)| (format!("file-{i}").into(), *len))
            .collect();

        let meta = TorrentMetadata::new(
            InfoHash(rand::thread_rng().gen()),
            "fixture",
            piece_length,
            files,
            hashes,
        )
        .unwrap();

        Self { meta: Arc::new(meta), data: Arc::new(data) }
    }

    pub fn swarm(&self, seeders: &[(SocketAddr, Behavior)]) -> FakeSwarm {
        FakeSwarm {
            seeders: Arc::new(seeders.iter().copied().collect()),
            meta: self.meta.clone(),
            data: self.data.clone(),
        }
    }
}

/// Every seeder gets its own host, bans apply to whole hosts.
pub fn addr(host: u8) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, host], 6881))
}

/// Short timeouts and no listener.
pub fn test_config() -> Config {
    Config {
        accept_inbound: false,
        pipeline_depth: 8,
        tick_interval_ms: 50,
        sweep_interval_ms: 100,
        request_timeout_ms: 300,
        connect_timeout_ms: 1_000,
        shutdown_grace_ms: 200,
        ..Default::default()
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .without_time()
        .try_init();
}

/// Connects to seeders that live in the test process.
#[derive(Clone)]
pub struct FakeSwarm {
    seeders: Arc<HashMap<SocketAddr, Behavior>>,
    meta: Arc<TorrentMetadata>,
    data: Arc<Vec<u8>>,
}

impl Connector for FakeSwarm {
    fn connect(&self, addr: SocketAddr) -> BoxFuture<'_, io::Result<BoxedStream>> {
        let Some(behavior) = self.seeders.get(&addr).copied() else {
            return Box::pin(async {
                Err(io::Error::from(io::ErrorKind::ConnectionRefused))
            });
        };

        let (ours, theirs) = tokio::io::duplex(1 << 20);
        let meta = self.meta.clone();
        let data = self.data.clone();

        spawn(async move {
            let _ = seed(theirs, behavior, meta, data).await;
        });

        Box::pin(async move { Ok(Box::new(ours) as BoxedStream) })
    }
}

async fn seed(
    socket: DuplexStream,
    behavior: Behavior,
    meta: Arc<TorrentMetadata>,
    data: Arc<Vec<u8>>,
) -> Result<(), Error> {
    let mut socket = Framed::new(socket, HandshakeCodec);

    let Some(Ok(_)) = socket.next().await else { return Ok(()) };
    socket.send(Handshake::new(meta.info_hash.clone(), PeerId::generate())).await?;

    let mut socket = socket.map_codec(|_| CoreCodec);

    let mut have = Bitfield::from_piece(meta.piece_count());
    have.fill(true);
    socket.send(Core::Bitfield(have)).await?;
    socket.send(Core::Unchoke).await?;

    while let Some(msg) = socket.next().await {
        let Core::Request(info) = msg? else { continue };

        if behavior == Behavior::Silent {
            continue;
        }

        let start = (meta.piece_offset(info.piece()) + info.begin as u64) as usize;
        let mut block = data[start..start + info.len as usize].to_vec();

        if behavior == Behavior::Corrupt {
            block[0] ^= 0xff;
        }

        socket
            .send(Core::Piece(Block { index: info.piece(), begin: info.begin, block }))
            .await?;
    }

    Ok(())
}

/// Fail the test instead of hanging.
pub async fn within<T>(f: impl std::future::Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(30), f)
        .await
        .expect("the session took too long")
}
