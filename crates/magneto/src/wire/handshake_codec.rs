//! Codec for encoding and decoding handshakes.
//!
//! This has to be a separate codec as the handshake has a different
//! structure than the rest of the messages. Handshakes are only sent once at
//! the beginning of a connection, after that the framed socket is switched to
//! [`super::CoreCodec`] keeping its buffers.
use std::io;

use bytes::{Buf, BytesMut};
use speedy::{BigEndian, Readable, Writable};
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

use super::PSTR;
use crate::{error::Error, peer::PeerId, torrent::InfoHash};

/// Size of a handshake on the wire.
pub const HANDSHAKE_LEN: usize = 1 + 19 + 8 + 20 + 20;

#[derive(Debug)]
pub struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = io::Error;

    fn encode(&mut self, handshake: Handshake, buf: &mut BytesMut) -> io::Result<()> {
        let Handshake { pstr_len, pstr, reserved, info_hash, peer_id } =
            handshake;

        buf.reserve(HANDSHAKE_LEN);
        buf.extend_from_slice(&[pstr_len]);
        buf.extend_from_slice(&pstr);
        buf.extend_from_slice(&reserved);
        buf.extend_from_slice(&info_hash.0);
        buf.extend_from_slice(&peer_id.0);

        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<Handshake>> {
        if buf.is_empty() {
            return Ok(None);
        }

        // peek the protocol length without advancing, the rest of the
        // handshake might not be here yet.
        let prot_len = buf[0] as usize;
        if prot_len != PSTR.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Handshake must have the string \"BitTorrent protocol\"",
            ));
        }

        if buf.remaining() < HANDSHAKE_LEN {
            return Ok(None);
        }

        let raw = buf.split_to(HANDSHAKE_LEN);
        Handshake::deserialize(&raw)
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
    }
}

/// pstrlen = 19
/// pstr = "BitTorrent protocol"
///
/// This is the very first message exchanged. If the peer's protocol string
/// or the info hash differs from ours, the connection is severed. We do not
/// support any extension so the reserved field is 8 zero bytes.
#[derive(Clone, Debug, PartialEq, Writable, Readable)]
pub struct Handshake {
    pub pstr_len: u8,
    pub pstr: [u8; 19],
    pub reserved: [u8; 8],
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(info_hash: InfoHash, peer_id: PeerId) -> Self {
        Self {
            pstr_len: PSTR.len() as u8,
            pstr: PSTR,
            reserved: [0u8; 8],
            info_hash,
            peer_id,
        }
    }

    pub fn serialize(&self) -> Result<[u8; HANDSHAKE_LEN], Error> {
        let mut buf = [0u8; HANDSHAKE_LEN];
        let temp = self.write_to_vec_with_ctx(BigEndian {})?;
        buf.copy_from_slice(&temp[..]);
        Ok(buf)
    }

    pub fn deserialize(buf: &[u8]) -> Result<Self, Error> {
        Ok(Self::read_from_buffer_with_ctx(BigEndian {}, buf)?)
    }

    /// Validate the handshake of the remote peer against ours.
    pub fn validate(&self, ours: &Self) -> bool {
        if self.pstr_len != 19 || self.pstr != PSTR {
            warn!("! handshake with wrong pstr, dropping connection");
            return false;
        }
        if self.info_hash != ours.info_hash {
            warn!("! info_hash from receiving handshake does not match ours");
            return false;
        }
        if self.peer_id == ours.peer_id {
            warn!("! handshake from ourselves, dropping connection");
            return false;
        }
        true
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;

    #[test]
    fn handshake_layout() {
        let info_hash = InfoHash([5u8; 20]);
        let peer_id = PeerId::from([7u8; 20]);
        let ours = Handshake::new(info_hash, peer_id);

        assert_eq!(ours.pstr_len, 19);
        assert_eq!(ours.pstr, PSTR);

        let raw = ours.serialize().unwrap();
        assert_eq!(raw[0], 19);
        assert_eq!(&raw[1..20], b"BitTorrent protocol");
        assert_eq!(&raw[20..28], &[0u8; 8]);
        assert_eq!(&raw[28..48], &[5u8; 20]);
        assert_eq!(&raw[48..68], &[7u8; 20]);

        assert_eq!(Handshake::deserialize(&raw).unwrap(), ours);
    }

    #[test]
    fn decode_waits_for_the_whole_handshake() {
        let ours = Handshake::new(InfoHash([1u8; 20]), PeerId::from([2u8; 20]));
        let mut frame = BytesMut::new();
        HandshakeCodec.encode(ours.clone(), &mut frame).unwrap();
        assert_eq!(frame.len(), HANDSHAKE_LEN);

        // a core message right behind the handshake must stay in the buffer
        frame.extend_from_slice(&[0, 0, 0, 1, 2]);

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&frame[..30]);
        assert!(HandshakeCodec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&frame[30..]);
        let theirs = HandshakeCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(theirs, ours);
        assert_eq!(&buf[..], &[0, 0, 0, 1, 2]);
    }

    #[test]
    fn validate() {
        let ours = Handshake::new(InfoHash([1u8; 20]), PeerId::from([2u8; 20]));

        let theirs =
            Handshake::new(InfoHash([1u8; 20]), PeerId::from([3u8; 20]));
        assert!(theirs.validate(&ours));

        let wrong_hash =
            Handshake::new(InfoHash([9u8; 20]), PeerId::from([3u8; 20]));
        assert!(!wrong_hash.validate(&ours));

        let myself = ours.clone();
        assert!(!myself.validate(&ours));

        let mut wrong_pstr = theirs.clone();
        wrong_pstr.pstr[0] = b'b';
        assert!(!wrong_pstr.validate(&ours));
    }

    #[test]
    fn wrong_protocol_len() {
        let mut buf = BytesMut::from(&[18u8, 0, 0][..]);
        assert!(HandshakeCodec.decode(&mut buf).is_err());
    }
}
