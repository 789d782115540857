//! The resolved metadata of a torrent, and the decoding of `.torrent` files
//! into it.
use std::{
    ops::Range,
    path::{Component, Path, PathBuf},
};

use bendy::{
    decoding::{self, Decoder, FromBencode, Object, ResultExt},
    encoding::AsString,
};
use sha1_smol::Sha1;

use crate::{
    error::Error,
    torrent::InfoHash,
    wire::BLOCK_LEN,
};

/// A file of the torrent, laid out in the torrent's byte space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Path relative to the download dir.
    pub path: PathBuf,
    /// Offset of the first byte of the file in the torrent.
    pub offset: u64,
    pub length: u64,
}

impl FileEntry {
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// Everything the engine needs to know about a torrent. Immutable once
/// resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentMetadata {
    pub info_hash: InfoHash,
    pub name: String,
    pub piece_length: u32,
    pub total_length: u64,
    pub files: Vec<FileEntry>,
    pub piece_hashes: Vec<[u8; 20]>,
}

impl TorrentMetadata {
    /// Lay out `files` one after the other and check that the piece hashes
    /// cover all of them.
    pub fn new(
        info_hash: InfoHash,
        name: impl Into<String>,
        piece_length: u32,
        files: Vec<(PathBuf, u64)>,
        piece_hashes: Vec<[u8; 20]>,
    ) -> Result<Self, Error> {
        if piece_length == 0 {
            return Err(Error::MetaInfoInvalid("piece length is zero"));
        }
        if files.is_empty() {
            return Err(Error::MetaInfoInvalid("torrent without files"));
        }

        let mut offset = 0;
        let mut entries = Vec::with_capacity(files.len());

        for (path, length) in files {
            if path.components().any(|c| !matches!(c, Component::Normal(_))) {
                return Err(Error::MetaInfoInvalid("file path escapes the download dir"));
            }
            entries.push(FileEntry { path, offset, length });
            offset += length;
        }

        if offset == 0 {
            return Err(Error::MetaInfoInvalid("torrent is empty"));
        }

        let pieces = offset.div_ceil(piece_length as u64) as usize;
        if pieces != piece_hashes.len() {
            return Err(Error::MetaInfoInvalid(
                "number of piece hashes does not match the torrent size",
            ));
        }

        Ok(Self {
            info_hash,
            name: name.into(),
            piece_length,
            total_length: offset,
            files: entries,
            piece_hashes,
        })
    }

    /// Decode the bytes of a `.torrent` file.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, Error> {
        let meta = MetaInfo::from_bencode(buf)?;
        meta.info.into_metadata()
    }

    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let buf = tokio::fs::read(path).await?;
        Self::from_bytes(&buf)
    }

    #[inline]
    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len()
    }

    #[inline]
    pub fn piece_offset(&self, piece: usize) -> u64 {
        piece as u64 * self.piece_length as u64
    }

    /// Size of a piece in bytes, only the last one may be smaller.
    pub fn piece_len(&self, piece: usize) -> u32 {
        let start = self.piece_offset(piece);
        let end = (start + self.piece_length as u64).min(self.total_length);
        end.saturating_sub(start) as u32
    }

    pub fn block_count(&self, piece: usize) -> u32 {
        self.piece_len(piece).div_ceil(BLOCK_LEN)
    }

    /// The pieces that hold any byte of `offset..offset + len`.
    pub fn pieces_of_range(&self, offset: u64, len: u64) -> Range<usize> {
        if len == 0 || offset >= self.total_length {
            return 0..0;
        }
        let end = (offset + len).min(self.total_length);
        let first = (offset / self.piece_length as u64) as usize;
        let last = ((end - 1) / self.piece_length as u64) as usize;
        first..last + 1
    }

    /// The pieces that hold any byte of the file.
    pub fn pieces_of_file(&self, file: usize) -> Result<Range<usize>, Error> {
        let f = self.files.get(file).ok_or(Error::FileIndexInvalid(file))?;
        Ok(self.pieces_of_range(f.offset, f.length))
    }

    /// Index of the largest file, the first one wins a tie.
    pub fn largest_file(&self) -> usize {
        let mut largest = 0;
        for (i, f) in self.files.iter().enumerate() {
            if f.length > self.files[largest].length {
                largest = i;
            }
        }
        largest
    }
}

/// A `.torrent` file, only the fields the engine uses are decoded.
#[derive(Debug, PartialEq, Clone)]
struct MetaInfo {
    info: Info,
}

/// The info dictionary of a `.torrent`. In the single file format `length` is
/// set, in the multi file format `files` is set and `name` is the name of the
/// root folder.
#[derive(Debug, PartialEq, Clone)]
struct Info {
    length: Option<u64>,
    files: Option<Vec<File>>,
    name: String,
    piece_length: u32,
    pieces: Vec<u8>,
    info_hash: InfoHash,
}

#[derive(Debug, PartialEq, Clone)]
struct File {
    length: u64,
    path: Vec<String>,
}

impl Info {
    fn into_metadata(self) -> Result<TorrentMetadata, Error> {
        if self.pieces.len() % 20 != 0 {
            return Err(Error::MetaInfoInvalid("pieces is not a multiple of 20"));
        }

        let hashes = self
            .pieces
            .chunks_exact(20)
            .map(|c| {
                let mut h = [0u8; 20];
                h.copy_from_slice(c);
                h
            })
            .collect();

        let files = match (self.length, self.files) {
            (Some(length), None) => vec![(PathBuf::from(&self.name), length)],
            (None, Some(files)) => files
                .into_iter()
                .map(|f| {
                    let mut path = PathBuf::from(&self.name);
                    path.extend(f.path);
                    (path, f.length)
                })
                .collect(),
            _ => {
                return Err(Error::MetaInfoInvalid(
                    "info must have either length or files",
                ))
            }
        };

        TorrentMetadata::new(
            self.info_hash,
            self.name,
            self.piece_length,
            files,
            hashes,
        )
    }
}

impl FromBencode for File {
    fn decode_bencode_object(object: Object) -> Result<Self, decoding::Error> {
        let mut dict_dec = object.try_into_dictionary()?;
        let mut length = None;
        let mut path = None;

        while let Some(pair) = dict_dec.next_pair()? {
            match pair {
                (b"length", value) => {
                    length = u64::decode_bencode_object(value)
                        .context("length")
                        .map(Some)?;
                }
                (b"path", value) => {
                    path = Vec::<String>::decode_bencode_object(value)
                        .context("path")
                        .map(Some)?;
                }
                _ => {}
            }
        }

        Ok(Self {
            length: length
                .ok_or_else(|| decoding::Error::missing_field("length"))?,
            path: path.ok_or_else(|| decoding::Error::missing_field("path"))?,
        })
    }
}

impl FromBencode for MetaInfo {
    fn decode_bencode_object(object: Object) -> Result<Self, decoding::Error> {
        let mut info = None;

        let mut dict_dec = object.try_into_dictionary()?;
        while let Some(pair) = dict_dec.next_pair()? {
            if let (b"info", value) = pair {
                info = Info::decode_bencode_object(value)
                    .context("info")
                    .map(Some)?;
            }
        }

        let info =
            info.ok_or_else(|| decoding::Error::missing_field("info"))?;

        Ok(MetaInfo { info })
    }
}

impl FromBencode for Info {
    fn decode_bencode_object(object: Object) -> Result<Self, decoding::Error> {
        let mut files = None;
        let mut length = None;
        let mut name = None;
        let mut piece_length = None;
        let mut pieces = None;

        // the info hash is the hash of the raw dictionary, as it is in the
        // file, not of a re-encoding of it.
        let raw = object.try_into_dictionary()?.into_raw()?;
        let info_hash = InfoHash(Sha1::from(raw).digest().bytes());

        let mut decoder = Decoder::new(raw);
        let Some(object) = decoder.next_object()? else {
            return Err(decoding::Error::missing_field("info"));
        };
        let mut dict = object.try_into_dictionary()?;

        while let Some(pair) = dict.next_pair()? {
            match pair {
                (b"files", value) => {
                    files = Vec::<File>::decode_bencode_object(value)
                        .context("files")
                        .map(Some)?;
                }
                (b"length", value) => {
                    length = u64::decode_bencode_object(value)
                        .context("length")
                        .map(Some)?;
                }
                (b"name", value) => {
                    name = String::decode_bencode_object(value)
                        .context("name")
                        .map(Some)?;
                }
                (b"piece length", value) => {
                    piece_length = u32::decode_bencode_object(value)
                        .context("piece length")
                        .map(Some)?;
                }
                (b"pieces", value) => {
                    pieces = AsString::<Vec<u8>>::decode_bencode_object(value)
                        .context("pieces")
                        .map(|bytes| Some(bytes.0))?;
                }
                _ => {}
            }
        }

        Ok(Info {
            files,
            length,
            name: name.ok_or_else(|| decoding::Error::missing_field("name"))?,
            piece_length: piece_length
                .ok_or_else(|| decoding::Error::missing_field("piece length"))?,
            pieces: pieces
                .ok_or_else(|| decoding::Error::missing_field("pieces"))?,
            info_hash,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(total: u64, piece_length: u32) -> TorrentMetadata {
        let pieces = total.div_ceil(piece_length as u64) as usize;
        TorrentMetadata::new(
            InfoHash::default(),
            "test",
            piece_length,
            vec![("test".into(), total)],
            vec![[0u8; 20]; pieces],
        )
        .unwrap()
    }

    fn bencode_str(s: &[u8]) -> Vec<u8> {
        let mut v = format!("{}:", s.len()).into_bytes();
        v.extend_from_slice(s);
        v
    }

    /// piece_length: 16384
    /// -------------------------------------
    /// | f: 32868                          |
    /// -------------p-------------p---------
    /// | b: 16384   | b: 16384    | b: 100 |
    /// -------------------------------------
    #[test]
    fn one_block_pieces() {
        let m = metadata(32868, BLOCK_LEN);
        assert_eq!(m.piece_count(), 3);
        assert_eq!(m.block_count(0), 1);
        assert_eq!(m.block_count(2), 1);
        assert_eq!(m.piece_len(2), 100);
    }

    #[test]
    fn many_block_pieces() {
        let m = metadata(2 * 40_000, 40_000);
        assert_eq!(m.block_count(1), 3);
        assert_eq!(m.piece_len(1), 40_000);
    }

    #[test]
    fn hashes_must_cover_the_torrent() {
        let r = TorrentMetadata::new(
            InfoHash::default(),
            "x",
            10,
            vec![("x".into(), 25)],
            vec![[0u8; 20]; 2],
        );
        assert!(matches!(r, Err(Error::MetaInfoInvalid(_))));
    }

    #[test]
    fn rejects_paths_outside_of_the_download_dir() {
        let r = TorrentMetadata::new(
            InfoHash::default(),
            "x",
            10,
            vec![("../etc/passwd".into(), 5)],
            vec![[0u8; 20]],
        );
        assert!(r.is_err());
    }

    #[test]
    fn pieces_of_files() {
        // 3 files over pieces of 10 bytes:
        // | a: 15          | b: 5 | c: 30                        |
        // 0         10         20         30         40         50
        let m = TorrentMetadata::new(
            InfoHash::default(),
            "dir",
            10,
            vec![("dir/a".into(), 15), ("dir/b".into(), 5), ("dir/c".into(), 30)],
            vec![[0u8; 20]; 5],
        )
        .unwrap();

        assert_eq!(m.pieces_of_file(0).unwrap(), 0..2);
        assert_eq!(m.pieces_of_file(1).unwrap(), 1..2);
        assert_eq!(m.pieces_of_file(2).unwrap(), 2..5);
        assert!(m.pieces_of_file(3).is_err());
        assert_eq!(m.largest_file(), 2);
        assert_eq!(m.files[2].offset, 20);
        assert_eq!(m.pieces_of_range(0, 0), 0..0);
        assert_eq!(m.pieces_of_range(45, 100), 4..5);
    }

    #[test]
    fn decode_single_file_torrent() {
        let hashes = [[1u8; 20], [2u8; 20]].concat();

        let mut info = b"d6:lengthi20e4:name5:movie12:piece lengthi16e6:pieces".to_vec();
        info.extend(bencode_str(&hashes));
        info.push(b'e');

        let mut torrent = b"d8:announce9:udp://x:14:info".to_vec();
        torrent.extend(&info);
        torrent.push(b'e');

        let m = TorrentMetadata::from_bytes(&torrent).unwrap();
        assert_eq!(m.name, "movie");
        assert_eq!(m.total_length, 20);
        assert_eq!(m.piece_length, 16);
        assert_eq!(m.piece_hashes, vec![[1u8; 20], [2u8; 20]]);
        assert_eq!(m.files, vec![FileEntry { path: "movie".into(), offset: 0, length: 20 }]);
        assert_eq!(m.info_hash, InfoHash(Sha1::from(&info).digest().bytes()));
    }

    #[test]
    fn decode_multi_file_torrent() {
        let mut info = b"d5:filesl".to_vec();
        info.extend(b"d6:lengthi3e4:pathl1:aee");
        info.extend(b"d6:lengthi5e4:pathl3:sub1:bee");
        info.extend(b"e4:name3:dir12:piece lengthi4e6:pieces");
        info.extend(bencode_str(&[0u8; 40]));
        info.push(b'e');

        let mut torrent = b"d4:info".to_vec();
        torrent.extend(&info);
        torrent.push(b'e');

        let m = TorrentMetadata::from_bytes(&torrent).unwrap();
        assert_eq!(m.files.len(), 2);
        assert_eq!(m.files[0].path, PathBuf::from("dir/a"));
        assert_eq!(m.files[1].path, PathBuf::from("dir/sub/b"));
        assert_eq!(m.files[1].offset, 3);
        assert_eq!(m.total_length, 8);
    }
}
