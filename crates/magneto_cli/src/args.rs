use std::{net::SocketAddr, path::PathBuf};

use clap::{Parser, ValueEnum};
use magneto::{config::Config, magnet::Magnet, torrent::Mode};

use crate::error::Error;

#[derive(Parser, Debug)]
#[clap(name = "Magneto")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Magnet link of the torrent, wrapped in quotes.
    #[clap(short, long)]
    pub magnet: Option<String>,

    /// The .torrent file of the torrent.
    #[clap(short, long)]
    pub torrent: Option<PathBuf>,

    /// Address of a peer to download from, can be repeated.
    #[clap(short, long = "peer")]
    pub peers: Vec<SocketAddr>,

    #[clap(long, value_enum, default_value_t = ModeArg::Download)]
    pub mode: ModeArg,

    /// Index of the file to stream, the largest one by default.
    #[clap(short, long)]
    pub file: Option<usize>,

    /// The directory in which torrents will be downloaded.
    #[clap(short, long)]
    pub download_dir: Option<PathBuf>,

    /// Max connected peers.
    #[clap(long)]
    pub max_peers: Option<usize>,

    /// Filter of the log file, `info` or `magneto=debug` for example.
    #[clap(long, default_value = "info")]
    pub log_level: String,

    /// Do not open a media player in stream mode.
    #[clap(long)]
    pub no_player: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModeArg {
    /// Download the complete torrent.
    Download,
    /// Stream while downloading.
    Stream,
}

impl Args {
    /// The flags win over the config file.
    pub fn apply(&self, config: &mut Config) {
        if let Some(dir) = &self.download_dir {
            config.download_dir = dir.clone();
        }
        if let Some(max_peers) = self.max_peers {
            config.max_peers = max_peers;
        }
    }

    pub fn mode(&self) -> Mode {
        match self.mode {
            ModeArg::Download => Mode::Download,
            ModeArg::Stream => Mode::Stream { file: self.file },
        }
    }

    pub fn magnet(&self) -> Result<Option<Magnet>, Error> {
        self.magnet.as_deref().map(parse_magnet).transpose()
    }
}

/// Check the link the way a user would get told about it, then parse it.
pub fn parse_magnet(link: &str) -> Result<Magnet, Error> {
    let link = link.trim();

    if link.is_empty() {
        return Err(Error::EmptyMagnet);
    }
    if !link.starts_with("magnet:") {
        return Err(Error::InvalidMagnet(link.to_owned()));
    }

    Ok(Magnet::new(link)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_magnets() {
        assert!(matches!(parse_magnet("  "), Err(Error::EmptyMagnet)));
        assert!(matches!(
            parse_magnet("http://example.com"),
            Err(Error::InvalidMagnet(_))
        ));

        let hash = "56bc861f42972dee863a40e4cb7fc0b3a6c3d3b8";
        let m = parse_magnet(&format!("magnet:?xt=urn:btih:{hash}&dn=Some%20Movie")).unwrap();
        assert_eq!(m.parse_dn(), "Some Movie");
    }

    #[test]
    fn flags_override_config() {
        let args = Args::parse_from([
            "magneto",
            "--torrent",
            "a.torrent",
            "--peer",
            "10.0.0.1:6881",
            "--peer",
            "10.0.0.2:6881",
            "--mode",
            "stream",
            "--file",
            "2",
            "--max-peers",
            "7",
            "-d",
            "/tmp/movies",
        ]);

        let mut config = Config::default();
        args.apply(&mut config);

        assert_eq!(config.max_peers, 7);
        assert_eq!(config.download_dir, PathBuf::from("/tmp/movies"));
        assert_eq!(args.peers.len(), 2);
        assert_eq!(args.mode(), Mode::Stream { file: Some(2) });
    }
}
