//! A BitTorrent download engine with two scheduling strategies.
//!
//! Magneto downloads a torrent either to completion, picking the rarest pieces
//! of the swarm first, or sequentially with a priority window at the start of
//! a target file, so that a media player can start playing it while the rest
//! is still being downloaded.
//!
//! The engine is made of a few components, leaves first:
//!
//! * [`disk::PieceStore`] assembles, verifies and serves pieces.
//! * [`scheduler::PieceScheduler`] decides which block to request next.
//! * [`peer`] handles one remote peer: handshake, messages and the request
//!   pipeline.
//! * [`swarm::SwarmManager`] owns the connected peers and the availability
//!   map of the swarm.
//! * [`torrent::DownloadSession`] drives everything and exposes progress.
//!
//! # Example
//!
//! ```ignore
//! use magneto::{config::Config, torrent::{DownloadSession, Mode}};
//!
//! let session = DownloadSession::builder(Config::default())
//!     .metadata(metadata)
//!     .peers(peers)
//!     .mode(Mode::Stream { file: None })
//!     .build()?;
//!
//! session.start().await?;
//! session.wait_buffer_ready().await?;
//! ```

pub mod bitfield;
pub mod config;
pub mod counter;
pub mod disk;
pub mod error;
pub mod magnet;
pub mod metainfo;
pub mod peer;
pub mod peer_source;
pub mod scheduler;
pub mod swarm;
pub mod torrent;
pub mod utils;
pub mod wire;
