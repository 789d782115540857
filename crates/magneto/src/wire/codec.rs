use bytes::{Buf, BufMut, BytesMut};
use tokio::io;
use tokio_util::codec::{Decoder, Encoder};

use super::{Block, BlockInfo, MAX_MESSAGE_SIZE};
use crate::{bitfield::Bitfield, error::Error};

/// Core messages exchanged after a successful handshake.
#[derive(Debug, Clone, PartialEq)]
pub enum Core {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(usize),
    /// Raw bitfield, the padding bits are still present.
    Bitfield(Bitfield),
    Request(BlockInfo),
    Piece(Block),
    Cancel(BlockInfo),
}

/// The IDs of the [`Core`] messages.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum CoreId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
}

impl TryFrom<u8> for CoreId {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use CoreId::*;
        Ok(match value {
            0 => Choke,
            1 => Unchoke,
            2 => Interested,
            3 => NotInterested,
            4 => Have,
            5 => Bitfield,
            6 => Request,
            7 => Piece,
            8 => Cancel,
            v => {
                return Err(Error::ProtocolViolation(format!(
                    "unknown message id {v}"
                )))
            }
        })
    }
}

impl Core {
    /// Size of the encoded message, with the length prefix.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        use Core::*;
        match self {
            KeepAlive => 4,
            Choke | Unchoke | Interested | NotInterested => 4 + 1,
            Cancel(_) | Request(_) => 4 + 1 + 4 + 4 + 4,
            Have(_) => 4 + 1 + 4,
            Bitfield(b) => 4 + 1 + b.as_raw_slice().len(),
            Piece(b) => 4 + 1 + 4 + 4 + b.block.len(),
        }
    }

    /// `None` for keep-alives, they are only a length prefix.
    pub fn id(&self) -> Option<CoreId> {
        Some(match self {
            Core::KeepAlive => return None,
            Core::Choke => CoreId::Choke,
            Core::Unchoke => CoreId::Unchoke,
            Core::Interested => CoreId::Interested,
            Core::NotInterested => CoreId::NotInterested,
            Core::Have(_) => CoreId::Have,
            Core::Bitfield(_) => CoreId::Bitfield,
            Core::Request(_) => CoreId::Request,
            Core::Piece(_) => CoreId::Piece,
            Core::Cancel(_) => CoreId::Cancel,
        })
    }
}

#[derive(Debug, Clone)]
pub struct CoreCodec;

fn expect_len(id: CoreId, size: usize, expected: usize) -> Result<(), Error> {
    if size != expected {
        return Err(Error::ProtocolViolation(format!(
            "{id:?} with length {size}, expected {expected}"
        )));
    }
    Ok(())
}

impl Encoder<Core> for CoreCodec {
    type Error = Error;

    fn encode(&mut self, item: Core, buf: &mut BytesMut) -> Result<(), Error> {
        let len = item.len();

        let Some(id) = item.id() else {
            buf.put_u32(0);
            return Ok(());
        };

        // checked before anything is written
        let index = match &item {
            Core::Have(i) | Core::Piece(Block { index: i, .. }) => {
                u32::try_from(*i).map_err(|e| {
                    io::Error::new(io::ErrorKind::InvalidInput, e)
                })?
            }
            _ => 0,
        };

        buf.reserve(len);
        buf.put_u32((len - 4) as u32);
        buf.put_u8(id as u8);

        match item {
            Core::Have(_) => buf.put_u32(index),
            Core::Bitfield(bitfield) => {
                buf.extend_from_slice(bitfield.as_raw_slice())
            }
            Core::Request(info) | Core::Cancel(info) => info.encode(buf),
            Core::Piece(b) => {
                buf.put_u32(index);
                buf.put_u32(b.begin);
                buf.extend_from_slice(&b.block);
            }
            Core::KeepAlive
            | Core::Choke
            | Core::Unchoke
            | Core::Interested
            | Core::NotInterested => {}
        }

        Ok(())
    }
}

impl Decoder for CoreCodec {
    type Item = Core;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Core>, Error> {
        // the length prefix is needed to know anything about the message
        if buf.len() < 4 {
            return Ok(None);
        }

        // peek at the length prefix without consuming it
        let size = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

        if size == 0 {
            buf.advance(4);
            return Ok(Some(Core::KeepAlive));
        }

        if size > MAX_MESSAGE_SIZE {
            return Err(Error::MessageTooLarge(size));
        }

        // a message larger than the MTU arrives in many packets, wait until
        // the whole frame is buffered.
        if buf.len() < 4 + size {
            buf.reserve(4 + size - buf.len());
            return Ok(None);
        }

        buf.advance(4);
        let id = CoreId::try_from(buf.get_u8())?;

        // the cursor is past the size and the id, into the payload.
        let msg = match id {
            CoreId::Choke => {
                expect_len(id, size, 1)?;
                Core::Choke
            }
            CoreId::Unchoke => {
                expect_len(id, size, 1)?;
                Core::Unchoke
            }
            CoreId::Interested => {
                expect_len(id, size, 1)?;
                Core::Interested
            }
            CoreId::NotInterested => {
                expect_len(id, size, 1)?;
                Core::NotInterested
            }
            CoreId::Have => {
                expect_len(id, size, 1 + 4)?;
                Core::Have(buf.get_u32() as usize)
            }
            CoreId::Bitfield => {
                let bitfield = buf.split_to(size - 1).to_vec();
                Core::Bitfield(Bitfield::from_vec(bitfield))
            }
            CoreId::Request => {
                expect_len(id, size, 1 + 4 + 4 + 4)?;
                Core::Request(BlockInfo::new(
                    buf.get_u32(),
                    buf.get_u32(),
                    buf.get_u32(),
                ))
            }
            CoreId::Piece => {
                if size < 1 + 4 + 4 {
                    return Err(Error::ProtocolViolation(format!(
                        "Piece with length {size}"
                    )));
                }
                let index = buf.get_u32() as usize;
                let begin = buf.get_u32();
                let block = buf.split_to(size - 9).to_vec();
                Core::Piece(Block { index, begin, block })
            }
            CoreId::Cancel => {
                expect_len(id, size, 1 + 4 + 4 + 4)?;
                Core::Cancel(BlockInfo::new(
                    buf.get_u32(),
                    buf.get_u32(),
                    buf.get_u32(),
                ))
            }
        };

        Ok(Some(msg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::BLOCK_LEN;
    use bitvec::{bitvec, prelude::Msb0};

    #[test]
    fn fragmented_piece_message() {
        let mut codec = CoreCodec;
        let mut buffer = BytesMut::new();

        let data = vec![0xAA; BLOCK_LEN as usize];
        let mut frame = BytesMut::new();
        codec
            .encode(
                Core::Piece(Block { index: 3, begin: 0, block: data }),
                &mut frame,
            )
            .unwrap();

        // simulate TCP fragmentation
        buffer.extend_from_slice(&frame[..5_000]);
        assert!(codec.decode(&mut buffer).unwrap().is_none());

        buffer.extend_from_slice(&frame[5_000..12_000]);
        assert!(codec.decode(&mut buffer).unwrap().is_none());

        buffer.extend_from_slice(&frame[12_000..]);

        let keepalive = [0x00, 0x00, 0x00, 0x00];
        let interested = [0x00, 0x00, 0x00, 0x01, 0x02];
        buffer.extend_from_slice(&keepalive);
        buffer.extend_from_slice(&interested);

        match codec.decode(&mut buffer).unwrap().unwrap() {
            Core::Piece(block) => {
                assert_eq!(block.index, 3);
                assert_eq!(block.begin, 0);
                assert_eq!(block.block.len(), BLOCK_LEN as usize);
                assert!(block.block.iter().all(|&b| b == 0xAA));
            }
            msg => panic!("wrong message {msg:?}"),
        }

        assert_eq!(codec.decode(&mut buffer).unwrap().unwrap(), Core::KeepAlive);
        assert_eq!(
            codec.decode(&mut buffer).unwrap().unwrap(),
            Core::Interested
        );
        assert!(buffer.is_empty());
        assert!(codec.decode(&mut buffer).unwrap().is_none());
    }

    #[test]
    fn request_layout() {
        let mut buf = BytesMut::new();
        CoreCodec
            .encode(Core::Request(BlockInfo::new(1, BLOCK_LEN, BLOCK_LEN)), &mut buf)
            .unwrap();

        assert_eq!(buf.len(), Core::Request(BlockInfo::default()).len());
        assert_eq!(buf.get_u32(), 13);
        assert_eq!(buf.get_u8(), CoreId::Request as u8);
        assert_eq!(buf.get_u32(), 1);
        assert_eq!(buf.get_u32(), BLOCK_LEN);
        assert_eq!(buf.get_u32(), BLOCK_LEN);
    }

    #[test]
    fn bitfield_and_have() {
        let mut buf = BytesMut::new();
        let bitfield = bitvec![u8, Msb0; 1, 0, 1, 1, 0, 0, 0, 0, 1];
        CoreCodec.encode(Core::Bitfield(bitfield), &mut buf).unwrap();
        CoreCodec.encode(Core::Have(7), &mut buf).unwrap();

        // 9 bits take 2 bytes on the wire
        assert_eq!(&buf[..5], &[0, 0, 0, 3, 5]);

        let Some(Core::Bitfield(b)) = CoreCodec.decode(&mut buf).unwrap() else {
            panic!("expected a bitfield");
        };
        assert_eq!(b.len(), 16);
        assert_eq!(b.count_ones(), 4);

        assert_eq!(CoreCodec.decode(&mut buf).unwrap(), Some(Core::Have(7)));
    }

    #[test]
    fn oversized_message_is_an_error() {
        let mut buf = BytesMut::new();
        buf.put_u32(MAX_MESSAGE_SIZE as u32 + 1);
        buf.put_u8(CoreId::Piece as u8);

        assert!(matches!(
            CoreCodec.decode(&mut buf),
            Err(Error::MessageTooLarge(_))
        ));
    }

    #[test]
    fn unknown_id_is_an_error() {
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u8(42);

        assert!(matches!(
            CoreCodec.decode(&mut buf),
            Err(Error::ProtocolViolation(_))
        ));
    }

    #[test]
    fn malformed_have_is_an_error() {
        let mut buf = BytesMut::new();
        buf.put_u32(3);
        buf.put_u8(CoreId::Have as u8);
        buf.put_u16(1);

        assert!(matches!(
            CoreCodec.decode(&mut buf),
            Err(Error::ProtocolViolation(_))
        ));
    }
}
