//! Handle magnet links.
use std::{net::SocketAddr, ops::Deref};

use magnet_url::Magnet as Magnet_;

use crate::{error::Error, torrent::InfoHash};

#[derive(Debug, Clone)]
pub struct Magnet {
    inner: Magnet_,
    raw: String,
}

impl Deref for Magnet {
    type Target = Magnet_;
    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl Magnet {
    /// Parse a magnet link. The link must start with `magnet:` and carry a
    /// hex encoded v1 info hash.
    pub fn new(magnet_url: &str) -> Result<Self, Error> {
        let magnet_url = magnet_url.trim();
        if !magnet_url.starts_with("magnet:") {
            return Err(Error::MagnetLinkInvalid);
        }

        let inner =
            Magnet_::new(magnet_url).map_err(|_| Error::MagnetLinkInvalid)?;
        let magnet = Self { inner, raw: magnet_url.to_owned() };

        // fail early instead of on first use
        magnet.info_hash()?;

        Ok(magnet)
    }

    /// The name comes URL encoded, and it is also optional.
    pub fn parse_dn(&self) -> String {
        self.inner
            .display_name()
            .and_then(|dn| urlencoding::decode(dn).ok())
            .map(|dn| dn.replace('+', " "))
            .unwrap_or_else(|| "Unknown".to_owned())
    }

    /// Decode the hex "xt" field.
    pub fn info_hash(&self) -> Result<InfoHash, Error> {
        let xt = self.inner.hash().ok_or(Error::MagnetNoInfoHash)?;
        let buf = hex::decode(xt).map_err(|_| Error::MagnetLinkInvalid)?;
        InfoHash::try_from(buf).map_err(|_| Error::MagnetLinkInvalid)
    }

    /// Peer addresses of the `x.pe` fields, invalid ones are skipped.
    pub fn peers(&self) -> Vec<SocketAddr> {
        let Some((_, query)) = self.raw.split_once('?') else {
            return Vec::new();
        };

        query
            .split('&')
            .filter_map(|kv| kv.strip_prefix("x.pe="))
            .filter_map(|v| urlencoding::decode(v).ok())
            .filter_map(|v| v.parse().ok())
            .collect()
    }
}
