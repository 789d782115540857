//! Where the bytes of verified pieces end up.
//!
//! A torrent is one contiguous byte space split into files. The backends map
//! a range of that space into the files it covers.
use std::{
    io::{self, SeekFrom},
    path::PathBuf,
};

use hashbrown::HashMap;
use tokio::{
    fs::{create_dir_all, File, OpenOptions},
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
    sync::Mutex,
};
use tracing::debug;

use crate::metainfo::{FileEntry, TorrentMetadata};

/// A part of a range that falls in one file.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Span {
    file: usize,
    /// Offset inside of the file.
    file_offset: u64,
    /// Offset inside of the buffer of the range.
    buf_offset: usize,
    len: usize,
}

/// Split `offset..offset + len` into the files that it covers.
fn spans(files: &[FileEntry], offset: u64, len: usize) -> Vec<Span> {
    let end = offset + len as u64;
    files
        .iter()
        .enumerate()
        .filter(|(_, f)| f.length > 0 && f.offset < end && f.end() > offset)
        .map(|(i, f)| {
            let start = offset.max(f.offset);
            let stop = end.min(f.end());
            Span {
                file: i,
                file_offset: start - f.offset,
                buf_offset: (start - offset) as usize,
                len: (stop - start) as usize,
            }
        })
        .collect()
}

#[derive(Debug)]
pub enum StorageBackend {
    Disk(FileStorage),
    Memory(MemoryStorage),
}

impl StorageBackend {
    pub async fn write(&self, offset: u64, data: &[u8]) -> io::Result<()> {
        match self {
            Self::Disk(s) => s.write(offset, data).await,
            Self::Memory(s) => s.write(offset, data).await,
        }
    }

    pub async fn read(&self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        match self {
            Self::Disk(s) => s.read(offset, len).await,
            Self::Memory(s) => s.read(offset, len).await,
        }
    }

    /// Read data that may have been written by a previous run, `None` if
    /// some of it is not there.
    pub async fn read_existing(
        &self,
        offset: u64,
        len: usize,
    ) -> io::Result<Option<Vec<u8>>> {
        match self {
            Self::Disk(s) => s.read_existing(offset, len).await,
            Self::Memory(s) => s.read(offset, len).await.map(Some),
        }
    }

    /// Flush and release the file handles.
    pub async fn close(&self) -> io::Result<()> {
        match self {
            Self::Disk(s) => s.close().await,
            Self::Memory(_) => Ok(()),
        }
    }
}

/// Files of the torrent under a download dir. Handles are opened on first
/// use and kept until [`FileStorage::close`].
#[derive(Debug)]
pub struct FileStorage {
    root: PathBuf,
    files: Vec<FileEntry>,
    handles: Mutex<HashMap<usize, File>>,
}

impl FileStorage {
    pub fn new(root: impl Into<PathBuf>, meta: &TorrentMetadata) -> Self {
        Self {
            root: root.into(),
            files: meta.files.clone(),
            handles: Mutex::new(HashMap::new()),
        }
    }

    async fn open(&self, file: usize) -> io::Result<File> {
        let path = self.root.join(&self.files[file].path);
        if let Some(parent) = path.parent() {
            create_dir_all(parent).await?;
        }
        debug!("opening {path:?}");
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .await
    }

    async fn write(&self, offset: u64, data: &[u8]) -> io::Result<()> {
        let mut handles = self.handles.lock().await;

        for span in spans(&self.files, offset, data.len()) {
            if !handles.contains_key(&span.file) {
                let f = self.open(span.file).await?;
                handles.insert(span.file, f);
            }
            let Some(file) = handles.get_mut(&span.file) else { continue };

            file.seek(SeekFrom::Start(span.file_offset)).await?;
            file.write_all(&data[span.buf_offset..span.buf_offset + span.len])
                .await?;
            file.flush().await?;
        }

        Ok(())
    }

    async fn read(&self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        let mut handles = self.handles.lock().await;
        let mut buf = vec![0u8; len];

        for span in spans(&self.files, offset, len) {
            if !handles.contains_key(&span.file) {
                let f = self.open(span.file).await?;
                handles.insert(span.file, f);
            }
            let Some(file) = handles.get_mut(&span.file) else { continue };

            file.seek(SeekFrom::Start(span.file_offset)).await?;
            file.read_exact(&mut buf[span.buf_offset..span.buf_offset + span.len])
                .await?;
        }

        Ok(buf)
    }

    async fn read_existing(
        &self,
        offset: u64,
        len: usize,
    ) -> io::Result<Option<Vec<u8>>> {
        let mut buf = vec![0u8; len];

        for span in spans(&self.files, offset, len) {
            let path = self.root.join(&self.files[span.file].path);
            let mut file = match File::open(&path).await {
                Ok(f) => f,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    return Ok(None)
                }
                Err(e) => return Err(e),
            };

            let size = file.metadata().await?.len();
            if size < span.file_offset + span.len as u64 {
                return Ok(None);
            }

            file.seek(SeekFrom::Start(span.file_offset)).await?;
            file.read_exact(&mut buf[span.buf_offset..span.buf_offset + span.len])
                .await?;
        }

        Ok(Some(buf))
    }

    async fn close(&self) -> io::Result<()> {
        let mut handles = self.handles.lock().await;
        for (_, mut file) in handles.drain() {
            file.flush().await?;
            file.sync_all().await?;
        }
        Ok(())
    }
}

/// The whole torrent in memory, for tests and for torrents that are only
/// streamed.
#[derive(Debug)]
pub struct MemoryStorage {
    data: Mutex<Vec<u8>>,
}

impl MemoryStorage {
    pub fn new(len: u64) -> Self {
        Self { data: Mutex::new(vec![0u8; len as usize]) }
    }

    /// Storage that already holds `data`, like a previous run would leave it.
    pub fn with_data(data: Vec<u8>) -> Self {
        Self { data: Mutex::new(data) }
    }

    async fn write(&self, offset: u64, bytes: &[u8]) -> io::Result<()> {
        let mut data = self.data.lock().await;
        let start = offset as usize;
        let Some(dst) = data.get_mut(start..start + bytes.len()) else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "write past the end of the torrent",
            ));
        };
        dst.copy_from_slice(bytes);
        Ok(())
    }

    async fn read(&self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        let data = self.data.lock().await;
        let start = offset as usize;
        data.get(start..start + len).map(|s| s.to_vec()).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "read past the end of the torrent",
            )
        })
    }
}
