//! Configuration of a download session.
//!
//! The configuration lives in a TOML file in the user's config folder. CLI
//! flags override the file values, the binary is responsible for that merge.
use std::{ops::RangeInclusive, path::PathBuf, time::Duration};

use directories::{ProjectDirs, UserDirs};
use serde::{Deserialize, Serialize};
use tokio::{
    fs::{create_dir_all, OpenOptions},
    io::{AsyncReadExt, AsyncWriteExt},
};
use tracing::{info, warn};

use crate::error::Error;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Where the torrent files are written.
    pub download_dir: PathBuf,

    /// Bind a listener for peers that connect to us.
    pub accept_inbound: bool,

    /// Max connected peers of a session.
    pub max_peers: usize,

    /// Max block requests outstanding to one peer.
    pub pipeline_depth: usize,

    /// Remaining blocks under which endgame starts.
    pub endgame_blocks: usize,

    /// Peers that we upload to at the same time.
    pub upload_slots: usize,

    /// The stream buffer is the smaller of this fraction of the target file
    /// and `stream_buffer_bytes`.
    pub stream_buffer_fraction: f64,
    pub stream_buffer_bytes: u64,

    /// Force the size of the priority window, in pieces.
    pub stream_window_pieces: Option<usize>,

    /// How many peers may be asked for the same block of the priority window.
    pub stream_window_duplicates: usize,

    pub request_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub idle_timeout_ms: u64,
    pub tick_interval_ms: u64,
    pub sweep_interval_ms: u64,
    pub shutdown_grace_ms: u64,

    /// Bad pieces a peer may contribute to before it is banned.
    pub max_corruption_strikes: u32,

    /// The first free port of this range is used by the listener.
    pub listen_port_range: RangeInclusive<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            download_dir: Self::default_download_dir(),
            accept_inbound: true,
            max_peers: 50,
            pipeline_depth: 64,
            endgame_blocks: 20,
            upload_slots: 4,
            stream_buffer_fraction: 0.10,
            stream_buffer_bytes: 100 * 1024 * 1024,
            stream_window_pieces: None,
            stream_window_duplicates: 2,
            request_timeout_ms: 20_000,
            connect_timeout_ms: 10_000,
            idle_timeout_ms: 120_000,
            tick_interval_ms: 1_000,
            sweep_interval_ms: 5_000,
            shutdown_grace_ms: 3_000,
            max_corruption_strikes: 3,
            listen_port_range: 6881..=6891,
        }
    }
}

impl Config {
    pub const FILE_NAME: &'static str = "config.toml";

    fn default_download_dir() -> PathBuf {
        UserDirs::new()
            .and_then(|dirs| dirs.download_dir().map(|d| d.to_path_buf()))
            .unwrap_or_else(|| PathBuf::from("torrents"))
    }

    /// `~/.config/magneto` on Linux.
    pub fn config_dir() -> Result<PathBuf, Error> {
        let dirs =
            ProjectDirs::from("", "", "Magneto").ok_or(Error::HomeInvalid)?;
        Ok(dirs.config_dir().to_path_buf())
    }

    /// Folder of the log files, `~/.local/share/magneto` on Linux.
    pub fn log_dir() -> Result<PathBuf, Error> {
        let dirs =
            ProjectDirs::from("", "", "Magneto").ok_or(Error::HomeInvalid)?;
        Ok(dirs.data_local_dir().to_path_buf())
    }

    /// Load the configuration file of the user's config folder.
    ///
    /// # Errors
    ///
    /// Fails if the user has no home folder, or if the program does not have
    /// permission to create the folder or the file.
    pub async fn load() -> Result<Self, Error> {
        let dir = Self::config_dir()?;

        if !dir.exists() {
            create_dir_all(&dir)
                .await
                .map_err(|_| Error::FolderOpenError(dir.display().to_string()))?;
        }

        Self::load_from(dir.join(Self::FILE_NAME)).await
    }

    /// Load the configuration at `path`. A missing, empty or invalid file is
    /// replaced by the default configuration.
    pub async fn load_from(path: PathBuf) -> Result<Self, Error> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .await?;

        let mut dst = String::new();
        file.read_to_string(&mut dst).await?;

        match toml::from_str::<Config>(&dst) {
            Ok(config) => {
                config.validate()?;
                Ok(config)
            }
            Err(e) => {
                if !dst.trim().is_empty() {
                    warn!("invalid config file {path:?}, rewriting it: {e}");
                }
                let config = Config::default();
                let s = toml::to_string(&config)
                    .map_err(|e| Error::ConfigError(e.to_string()))?;

                let mut file = OpenOptions::new()
                    .write(true)
                    .truncate(true)
                    .open(&path)
                    .await?;
                file.write_all(s.as_bytes()).await?;
                info!("wrote default config to {path:?}");

                Ok(config)
            }
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.max_peers == 0 {
            return Err(Error::ConfigError("max_peers cannot be zero".into()));
        }
        if self.pipeline_depth == 0 {
            return Err(Error::ConfigError(
                "pipeline_depth cannot be zero".into(),
            ));
        }
        if self.listen_port_range.start() > self.listen_port_range.end() {
            return Err(Error::ConfigError(
                "listen_port_range is inverted".into(),
            ));
        }
        if !(self.stream_buffer_fraction > 0.0
            && self.stream_buffer_fraction <= 1.0)
        {
            return Err(Error::ConfigError(
                "stream_buffer_fraction must be in (0, 1]".into(),
            ));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{distributions::Alphanumeric, Rng};

    fn tmp_file() -> PathBuf {
        let name: String = rand::thread_rng()
            .sample_iter(Alphanumeric)
            .take(12)
            .map(char::from)
            .collect();
        std::env::temp_dir().join(format!("magneto-config-{name}.toml"))
    }

    #[test]
    fn defaults_are_valid() {
        let c = Config::default();
        assert!(c.validate().is_ok());
        assert_eq!(c.max_peers, 50);
        assert_eq!(c.listen_port_range, 6881..=6891);
        assert_eq!(c.request_timeout(), Duration::from_secs(20));
    }

    #[test]
    fn validate_rejects_bad_values() {
        let c = Config { max_peers: 0, ..Default::default() };
        assert!(c.validate().is_err());

        let c = Config { pipeline_depth: 0, ..Default::default() };
        assert!(c.validate().is_err());

        #[allow(clippy::reversed_empty_ranges)]
        let c = Config { listen_port_range: 7000..=6000, ..Default::default() };
        assert!(c.validate().is_err());

        let c = Config { stream_buffer_fraction: 0.0, ..Default::default() };
        assert!(c.validate().is_err());

        let c = Config { stream_buffer_fraction: 1.5, ..Default::default() };
        assert!(c.validate().is_err());
    }

    #[tokio::test]
    async fn writes_default_when_invalid() {
        let path = tmp_file();
        tokio::fs::write(&path, "this is not = = toml").await.unwrap();

        let c = Config::load_from(path.clone()).await.unwrap();
        assert_eq!(c, Config::default());

        // the default was written back and parses now
        let s = tokio::fs::read_to_string(&path).await.unwrap();
        let parsed: Config = toml::from_str(&s).unwrap();
        assert_eq!(parsed, Config::default());

        tokio::fs::remove_file(path).await.unwrap();
    }

    #[tokio::test]
    async fn partial_file_uses_defaults() {
        let path = tmp_file();
        tokio::fs::write(&path, "max_peers = 7\n").await.unwrap();

        let c = Config::load_from(path.clone()).await.unwrap();
        assert_eq!(c.max_peers, 7);
        assert_eq!(c.pipeline_depth, 64);

        tokio::fs::remove_file(path).await.unwrap();
    }
}
