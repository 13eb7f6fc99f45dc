use std::{
    collections::HashMap,
    io,
    num::NonZeroUsize,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex, RwLock,
    },
};

use bytes::Bytes;
use lru::LruCache;
use sha1::{Digest, Sha1};
use tokio::task;

use super::{
    error::{NewTorrentError, ReadError, Result},
    Alert, AlertSender, Command, CommandReceiver, WriteResult,
};
use crate::{
    block_count, block_len,
    storage_info::StorageInfo,
    vfs::{Vfs, VfsFile},
    Bitfield, Block, BlockInfo, FileInfo, PieceIndex, Sha1Hash, TorrentId,
    BLOCK_LEN,
};

/// How many whole pieces the per-torrent read cache keeps.
const READ_CACHE_PIECES: usize = 64;

/// The disk task. Owns the file handles of every torrent in the engine.
pub(super) struct Disk {
    torrents: HashMap<TorrentId, Torrent>,
    cmd_port: CommandReceiver,
    vfs: Arc<dyn Vfs>,
}

impl Disk {
    pub fn new(vfs: Arc<dyn Vfs>, cmd_port: CommandReceiver) -> Self {
        Self {
            torrents: HashMap::new(),
            cmd_port,
            vfs,
        }
    }

    /// The disk command loop, run until shutdown or channel failure.
    pub async fn run(&mut self) -> Result<()> {
        log::info!("Starting disk task");
        while let Some(cmd) = self.cmd_port.recv().await {
            match cmd {
                Command::NewTorrent {
                    id,
                    storage_info,
                    piece_hashes,
                    alert_chan,
                } => {
                    if self.torrents.contains_key(&id) {
                        log::warn!("Torrent {} already allocated", id);
                        alert_chan.send(Alert::Allocated(Err(
                            NewTorrentError::AlreadyExists,
                        )))?;
                        continue;
                    }

                    // an allocation failure must not take the disk task
                    // down with it; the torrent is told and the loop goes
                    // on serving the others
                    match Torrent::new(
                        Arc::clone(&self.vfs),
                        storage_info,
                        piece_hashes,
                        alert_chan.clone(),
                    ) {
                        Ok(torrent) => {
                            log::info!("Torrent {} allocated", id);
                            self.torrents.insert(id, torrent);
                            alert_chan.send(Alert::Allocated(Ok(())))?;
                        }
                        Err(e) => {
                            log::warn!(
                                "Torrent {} allocation failure: {}",
                                id,
                                e
                            );
                            alert_chan.send(Alert::Allocated(Err(e)))?;
                        }
                    }
                }
                Command::WritePiece {
                    id,
                    piece_index,
                    data,
                } => match self.torrents.get(&id) {
                    Some(torrent) => torrent.write_piece(piece_index, data)?,
                    None => log::warn!("Write for unknown torrent {}", id),
                },
                Command::ReadBlock { id, block_info } => {
                    match self.torrents.get(&id) {
                        Some(torrent) => torrent.read_block(block_info)?,
                        None => {
                            log::warn!("Read for unknown torrent {}", id)
                        }
                    }
                }
                Command::Recheck { id } => match self.torrents.get(&id) {
                    Some(torrent) => torrent.recheck(),
                    None => log::warn!("Recheck for unknown torrent {}", id),
                },
                Command::RemoveTorrent { id, delete_files } => {
                    match self.torrents.remove(&id) {
                        Some(torrent) => {
                            if delete_files {
                                torrent.delete_files();
                            }
                        }
                        None => {
                            log::warn!("Remove for unknown torrent {}", id)
                        }
                    }
                }
                Command::Shutdown => {
                    log::info!("Stopping disk task");
                    break;
                }
            }
        }
        Ok(())
    }
}

/// A torrent as the disk task sees it: open file handles, expected piece
/// hashes, the read cache.
struct Torrent {
    /// The fields IO worker threads need, behind one arc so that
    /// dispatching a job costs a single refcount bump.
    ctx: Arc<ThreadContext>,
}

struct ThreadContext {
    info: StorageInfo,
    /// The concatenation of all expected piece hashes.
    piece_hashes: Vec<u8>,
    /// Handles of all files in torrent, opened during allocation. Writers
    /// take the write lock of the files they touch; cache-miss readers take
    /// read locks.
    files: Vec<RwLock<TorrentFile>>,
    /// The channel used to alert the torrent of operation outcomes.
    alert_chan: AlertSender,
    /// Whole-piece read cache for the upload path. A peer requesting one
    /// block of a piece will very likely request the rest of it next, so
    /// cache at piece granularity, as 16 KiB blocks ready to serve.
    read_cache: Mutex<LruCache<PieceIndex, Arc<Vec<Bytes>>>>,
    vfs: Arc<dyn Vfs>,
    stats: Stats,
}

#[derive(Default)]
struct Stats {
    /// The number of bytes successfully written to disk.
    write_count: AtomicU64,
    /// The number of times we failed to write to disk.
    write_failure_count: AtomicUsize,
    /// The number of bytes successfully read from disk.
    read_count: AtomicU64,
}

impl Torrent {
    /// Opens every file of the torrent, creating directories as needed.
    /// Existing files are kept as they are, which is what makes resume and
    /// recheck possible.
    fn new(
        vfs: Arc<dyn Vfs>,
        info: StorageInfo,
        piece_hashes: Vec<u8>,
        alert_chan: AlertSender,
    ) -> std::result::Result<Self, NewTorrentError> {
        if !vfs.exists(&info.download_dir) {
            log::info!(
                "Creating missing download directory {:?}",
                info.download_dir
            );
            vfs.mkdir_all(&info.download_dir)?;
        }

        let mut files = Vec::with_capacity(info.structure.files().len());
        for file in info.structure.files() {
            files.push(RwLock::new(TorrentFile::open(
                &*vfs,
                &info.download_dir,
                file.clone(),
            )?));
        }

        Ok(Self {
            ctx: Arc::new(ThreadContext {
                info,
                piece_hashes,
                files,
                alert_chan,
                read_cache: Mutex::new(LruCache::new(
                    NonZeroUsize::new(READ_CACHE_PIECES)
                        .expect("cache size is nonzero"),
                )),
                vfs,
                stats: Stats::default(),
            }),
        })
    }

    /// Hashes the piece on a blocking worker and writes it to the files it
    /// spans if, and only if, the hash matches.
    fn write_piece(
        &self,
        piece_index: PieceIndex,
        data: Vec<u8>,
    ) -> Result<()> {
        log::trace!("Queueing piece {} write", piece_index);

        let valid_len = self
            .ctx
            .info
            .piece_len(piece_index)
            .map(|len| len as usize == data.len())
            .unwrap_or(false);
        let expected_hash = self.expected_hash(piece_index);
        let (file_range, expected_hash) = match (
            self.ctx.info.files_intersecting_piece(piece_index),
            expected_hash,
        ) {
            (Ok(range), Some(hash)) if valid_len => (range, hash),
            _ => {
                log::warn!("Invalid piece {} write request", piece_index);
                self.ctx.alert_chan.send(Alert::PieceWritten {
                    piece_index,
                    result: WriteResult::InvalidArgs,
                })?;
                return Ok(());
            }
        };

        let ctx = Arc::clone(&self.ctx);
        // hashing and positioned writes are synchronous and can be slow,
        // so they belong on the blocking pool
        task::spawn_blocking(move || {
            let digest = Sha1::digest(&data);
            if digest.as_slice() != expected_hash {
                log::warn!("Piece {} is not valid", piece_index);
                ctx.stats
                    .write_failure_count
                    .fetch_add(1, Ordering::Relaxed);
                ctx.send(Alert::PieceWritten {
                    piece_index,
                    result: WriteResult::HashMismatch,
                });
                return;
            }

            log::debug!("Piece {} is valid, writing to disk", piece_index);
            let mut torrent_offset =
                ctx.info.torrent_piece_offset(piece_index);
            let mut remaining = &data[..];
            let write = (|| -> io::Result<()> {
                for file in &ctx.files[file_range.clone()] {
                    let file = file.write().expect("file lock poisoned");
                    // empty files have no bytes of any piece
                    if file.info.len == 0 {
                        continue;
                    }
                    let slice = file
                        .info
                        .get_slice(torrent_offset, remaining.len() as u64);
                    let (head, tail) =
                        remaining.split_at(slice.len as usize);
                    file.write_all_at(head, slice.offset)?;
                    // the bitfield bit is only set after this alert, so the
                    // bytes must be durable before it is sent
                    file.handle.sync_data()?;
                    torrent_offset += slice.len;
                    remaining = tail;
                }
                debug_assert!(remaining.is_empty());
                Ok(())
            })();

            match write {
                Ok(()) => {
                    ctx.stats
                        .write_count
                        .fetch_add(data.len() as u64, Ordering::Relaxed);
                    log::debug!("Wrote piece {} to disk", piece_index);
                    ctx.send(Alert::PieceWritten {
                        piece_index,
                        result: WriteResult::Success { bytes: data.len() },
                    });
                }
                Err(e) => {
                    log::error!(
                        "Error writing piece {} to disk: {}",
                        piece_index,
                        e
                    );
                    ctx.stats
                        .write_failure_count
                        .fetch_add(1, Ordering::Relaxed);
                    ctx.send(Alert::PieceWritten {
                        piece_index,
                        result: WriteResult::Io(e),
                    });
                }
            }
        });

        Ok(())
    }

    /// Serves a block from the read cache, or reads its whole piece from
    /// disk on a miss.
    fn read_block(&self, block_info: BlockInfo) -> Result<()> {
        log::trace!("Reading {} from disk", block_info);

        let piece_index = block_info.piece_index;
        let piece_len = match self.ctx.info.piece_len(piece_index) {
            Ok(len) => len,
            Err(_) => {
                self.ctx.alert_chan.send(Alert::ReadFailed {
                    block_info,
                    error: ReadError::InvalidBlock,
                })?;
                return Ok(());
            }
        };
        let block_index = (block_info.offset / BLOCK_LEN) as usize;
        if block_info.offset % BLOCK_LEN != 0
            || block_index >= block_count(piece_len)
            || block_info.len != block_len(piece_len, block_index)
        {
            self.ctx.alert_chan.send(Alert::ReadFailed {
                block_info,
                error: ReadError::InvalidBlock,
            })?;
            return Ok(());
        }

        // serve from the cache if the piece is in it
        if let Some(blocks) = self
            .ctx
            .read_cache
            .lock()
            .expect("read cache lock poisoned")
            .get(&piece_index)
        {
            log::trace!("Piece {} read cache hit", piece_index);
            self.ctx.alert_chan.send(Alert::BlockRead(Block::new(
                block_info,
                blocks[block_index].clone(),
            )))?;
            return Ok(());
        }

        // cache miss: read the whole piece on a blocking worker
        log::debug!("Piece {} read cache miss", piece_index);
        let ctx = Arc::clone(&self.ctx);
        task::spawn_blocking(move || match ctx.read_piece(piece_index) {
            Ok(piece) => {
                let blocks = split_into_blocks(&piece);
                let block = blocks[block_index].clone();
                ctx.read_cache
                    .lock()
                    .expect("read cache lock poisoned")
                    .put(piece_index, Arc::new(blocks));
                ctx.stats
                    .read_count
                    .fetch_add(piece.len() as u64, Ordering::Relaxed);
                ctx.send(Alert::BlockRead(Block::new(block_info, block)));
            }
            Err(error) => {
                log::warn!(
                    "Error reading piece {} from disk: {}",
                    piece_index,
                    error
                );
                ctx.send(Alert::ReadFailed { block_info, error });
            }
        });

        Ok(())
    }

    /// Rehashes everything on disk and reports the ground-truth bitfield.
    fn recheck(&self) {
        let ctx = Arc::clone(&self.ctx);
        task::spawn_blocking(move || {
            log::info!("Rechecking {} pieces", ctx.info.piece_count);
            let mut bitfield =
                Bitfield::repeat(false, ctx.info.piece_count);
            for piece_index in 0..ctx.info.piece_count {
                let valid = match ctx.read_piece(piece_index) {
                    Ok(piece) => {
                        let digest = Sha1::digest(&piece);
                        ctx.expected_hash(piece_index)
                            .map(|hash| digest.as_slice() == hash)
                            .unwrap_or(false)
                    }
                    // unreadable data is simply data we don't have
                    Err(_) => false,
                };
                bitfield.set(piece_index, valid);
            }
            log::info!(
                "Recheck found {} verified pieces",
                bitfield.count_ones()
            );
            ctx.send(Alert::RecheckDone(bitfield));
        });
    }

    /// Deletes the torrent's files. Failures are logged; there is nobody
    /// left to alert as the torrent is already being removed.
    fn delete_files(&self) {
        let ctx = &self.ctx;
        let result = if ctx.info.structure.is_archive() {
            ctx.vfs.delete_dir(&ctx.info.download_dir)
        } else {
            let file = &ctx.info.structure.files()[0];
            ctx.vfs.delete_file(&ctx.info.download_dir.join(&file.path))
        };
        if let Err(e) = result {
            log::warn!("Failed to delete torrent files: {}", e);
        }
    }

    fn expected_hash(&self, piece_index: PieceIndex) -> Option<Sha1Hash> {
        self.ctx.expected_hash(piece_index)
    }
}

impl ThreadContext {
    fn expected_hash(&self, piece_index: PieceIndex) -> Option<Sha1Hash> {
        let pos = piece_index * 20;
        if pos + 20 > self.piece_hashes.len() {
            return None;
        }
        let mut hash = [0; 20];
        hash.copy_from_slice(&self.piece_hashes[pos..pos + 20]);
        Some(hash)
    }

    /// Reads a whole piece from the files it spans. Fails with
    /// `MissingData` if any file is shorter than the piece needs.
    fn read_piece(
        &self,
        piece_index: PieceIndex,
    ) -> std::result::Result<Vec<u8>, ReadError> {
        let piece_len = self
            .info
            .piece_len(piece_index)
            .map_err(|_| ReadError::InvalidBlock)?
            as usize;
        let file_range = self
            .info
            .files_intersecting_piece(piece_index)
            .map_err(|_| ReadError::InvalidBlock)?;

        let mut piece = vec![0; piece_len];
        let mut torrent_offset = self.info.torrent_piece_offset(piece_index);
        let mut filled = 0;
        for file in &self.files[file_range] {
            let file = file.read().expect("file lock poisoned");
            if file.info.len == 0 {
                continue;
            }
            let slice = file
                .info
                .get_slice(torrent_offset, (piece_len - filled) as u64);
            let buf = &mut piece[filled..filled + slice.len as usize];
            file.read_exact_at(buf, slice.offset)?;
            torrent_offset += slice.len;
            filled += slice.len as usize;
        }
        debug_assert_eq!(filled, piece_len);
        Ok(piece)
    }

    /// Sends an alert, tolerating a torrent that has already shut down.
    fn send(&self, alert: Alert) {
        if self.alert_chan.send(alert).is_err() {
            log::debug!("Torrent gone, dropping disk alert");
        }
    }
}

/// A file handle paired with its layout information. The path in `info` is
/// relative to the download directory; opening resolves it.
struct TorrentFile {
    info: FileInfo,
    handle: Box<dyn VfsFile>,
}

impl TorrentFile {
    fn open(
        vfs: &dyn Vfs,
        download_dir: &std::path::Path,
        info: FileInfo,
    ) -> std::result::Result<Self, NewTorrentError> {
        let path = download_dir.join(&info.path);
        if let Some(subdir) = path.parent() {
            if !vfs.exists(subdir) {
                log::debug!("Creating torrent subdir {:?}", subdir);
                vfs.mkdir_all(subdir)?;
            }
        }
        let handle = vfs.open(&path).map_err(|e| {
            log::warn!("Failed to open file {:?}: {}", path, e);
            NewTorrentError::Io(e)
        })?;
        Ok(Self { info, handle })
    }

    /// Positioned write of the whole buffer. IO syscalls are not guaranteed
    /// to write the whole input in one go, so this loops until all bytes
    /// are confirmed on disk or an error occurs.
    fn write_all_at(
        &self,
        mut buf: &[u8],
        mut offset: u64,
    ) -> io::Result<()> {
        while !buf.is_empty() {
            let written = self.handle.write_at(buf, offset)?;
            if written == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "file refused further bytes",
                ));
            }
            buf = &buf[written..];
            offset += written as u64;
        }
        Ok(())
    }

    /// Positioned read of the whole buffer. A short read means the file
    /// doesn't have the data.
    fn read_exact_at(
        &self,
        mut buf: &mut [u8],
        mut offset: u64,
    ) -> std::result::Result<(), ReadError> {
        while !buf.is_empty() {
            let read = self.handle.read_at(buf, offset)?;
            if read == 0 {
                return Err(ReadError::MissingData);
            }
            buf = &mut buf[read..];
            offset += read as u64;
        }
        Ok(())
    }
}

/// Splits a piece into served-size blocks without copying more than once.
fn split_into_blocks(piece: &[u8]) -> Vec<Bytes> {
    let whole = Bytes::copy_from_slice(piece);
    let mut blocks = Vec::with_capacity(block_count(piece.len() as u32));
    let mut offset = 0;
    while offset < whole.len() {
        let end = (offset + BLOCK_LEN as usize).min(whole.len());
        blocks.push(whole.slice(offset..end));
        offset = end;
    }
    blocks
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use tokio::sync::mpsc;

    use super::*;
    use crate::vfs::MemFs;

    fn storage_info(piece_count: usize, piece_len: u32) -> StorageInfo {
        let download_len = piece_count as u64 * piece_len as u64;
        StorageInfo {
            piece_count,
            piece_len,
            last_piece_len: piece_len,
            download_len,
            download_dir: PathBuf::from("/downloads"),
            structure: crate::storage_info::FsStructure::File(FileInfo {
                path: PathBuf::from("data.bin"),
                torrent_offset: 0,
                len: download_len,
            }),
        }
    }

    fn hashes_of(pieces: &[Vec<u8>]) -> Vec<u8> {
        let mut hashes = Vec::new();
        for piece in pieces {
            hashes.extend_from_slice(&Sha1::digest(piece));
        }
        hashes
    }

    async fn recv(
        alerts: &mut super::super::AlertReceiver,
    ) -> Alert {
        tokio::time::timeout(
            std::time::Duration::from_secs(5),
            alerts.recv(),
        )
        .await
        .expect("timed out waiting for disk alert")
        .expect("disk alert channel closed")
    }

    #[tokio::test]
    async fn test_verified_write_and_read_back() {
        let fs = MemFs::new();
        let piece: Vec<u8> = (0..2 * BLOCK_LEN).map(|i| i as u8).collect();
        let info = storage_info(1, 2 * BLOCK_LEN);
        let (alert_chan, mut alerts) = mpsc::unbounded_channel();
        let torrent = Torrent::new(
            Arc::new(fs.clone()),
            info,
            hashes_of(&[piece.clone()]),
            alert_chan,
        )
        .unwrap();

        torrent.write_piece(0, piece.clone()).unwrap();
        match recv(&mut alerts).await {
            Alert::PieceWritten {
                piece_index: 0,
                result: WriteResult::Success { bytes },
            } => assert_eq!(bytes, piece.len()),
            other => panic!("unexpected alert: {:?}", other),
        }
        assert_eq!(
            fs.contents(std::path::Path::new("/downloads/data.bin")),
            Some(piece.clone())
        );

        // read one block back; first read misses the cache
        let block_info = BlockInfo {
            piece_index: 0,
            offset: BLOCK_LEN,
            len: BLOCK_LEN,
        };
        torrent.read_block(block_info).unwrap();
        match recv(&mut alerts).await {
            Alert::BlockRead(block) => {
                assert_eq!(block.info(), block_info);
                assert_eq!(
                    &block.data[..],
                    &piece[BLOCK_LEN as usize..2 * BLOCK_LEN as usize]
                );
            }
            other => panic!("unexpected alert: {:?}", other),
        }
        // second read hits it
        torrent.read_block(block_info).unwrap();
        assert!(matches!(recv(&mut alerts).await, Alert::BlockRead(_)));
    }

    #[tokio::test]
    async fn test_hash_mismatch_writes_nothing() {
        let fs = MemFs::new();
        let good: Vec<u8> = vec![7; BLOCK_LEN as usize];
        let info = storage_info(1, BLOCK_LEN);
        let (alert_chan, mut alerts) = mpsc::unbounded_channel();
        let torrent = Torrent::new(
            Arc::new(fs.clone()),
            info,
            hashes_of(&[good]),
            alert_chan,
        )
        .unwrap();

        // a zeroed piece instead of the expected bytes
        torrent
            .write_piece(0, vec![0; BLOCK_LEN as usize])
            .unwrap();
        match recv(&mut alerts).await {
            Alert::PieceWritten {
                piece_index: 0,
                result: WriteResult::HashMismatch,
            } => {}
            other => panic!("unexpected alert: {:?}", other),
        }
        // the file was opened empty at allocation and must still be empty
        assert_eq!(
            fs.contents(std::path::Path::new("/downloads/data.bin"))
                .unwrap(),
            Vec::<u8>::new()
        );
    }

    #[tokio::test]
    async fn test_invalid_write_args() {
        let fs = MemFs::new();
        let info = storage_info(1, BLOCK_LEN);
        let (alert_chan, mut alerts) = mpsc::unbounded_channel();
        let torrent = Torrent::new(
            Arc::new(fs),
            info,
            vec![0; 20],
            alert_chan,
        )
        .unwrap();

        // out of bounds piece index
        torrent.write_piece(3, vec![0; BLOCK_LEN as usize]).unwrap();
        assert!(matches!(
            recv(&mut alerts).await,
            Alert::PieceWritten {
                result: WriteResult::InvalidArgs,
                ..
            }
        ));
        // wrong piece length
        torrent.write_piece(0, vec![0; 10]).unwrap();
        assert!(matches!(
            recv(&mut alerts).await,
            Alert::PieceWritten {
                result: WriteResult::InvalidArgs,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_read_missing_data() {
        let fs = MemFs::new();
        let info = storage_info(1, BLOCK_LEN);
        let (alert_chan, mut alerts) = mpsc::unbounded_channel();
        let torrent = Torrent::new(
            Arc::new(fs),
            info,
            vec![0; 20],
            alert_chan,
        )
        .unwrap();

        let block_info = BlockInfo {
            piece_index: 0,
            offset: 0,
            len: BLOCK_LEN,
        };
        torrent.read_block(block_info).unwrap();
        assert!(matches!(
            recv(&mut alerts).await,
            Alert::ReadFailed {
                error: ReadError::MissingData,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_recheck_rebuilds_bitfield() {
        let fs = MemFs::new();
        let piece_a: Vec<u8> = vec![1; BLOCK_LEN as usize];
        let piece_b: Vec<u8> = vec![2; BLOCK_LEN as usize];
        // piece 0 is on disk, piece 1 is garbage
        let mut on_disk = piece_a.clone();
        on_disk.extend(vec![9; BLOCK_LEN as usize]);
        fs.put("/downloads/data.bin", on_disk);

        let info = storage_info(2, BLOCK_LEN);
        let (alert_chan, mut alerts) = mpsc::unbounded_channel();
        let torrent = Torrent::new(
            Arc::new(fs),
            info,
            hashes_of(&[piece_a, piece_b]),
            alert_chan,
        )
        .unwrap();

        torrent.recheck();
        match recv(&mut alerts).await {
            Alert::RecheckDone(bitfield) => {
                assert!(bitfield[0]);
                assert!(!bitfield[1]);
            }
            other => panic!("unexpected alert: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_multi_file_write_spans_files() {
        let fs = MemFs::new();
        let piece_len = 2 * BLOCK_LEN;
        let piece: Vec<u8> = (0..piece_len).map(|i| (i % 251) as u8).collect();
        let info = StorageInfo {
            piece_count: 1,
            piece_len,
            last_piece_len: piece_len,
            download_len: piece_len as u64,
            download_dir: PathBuf::from("/downloads/multi"),
            structure: crate::storage_info::FsStructure::Archive {
                files: vec![
                    FileInfo {
                        path: PathBuf::from("a.bin"),
                        torrent_offset: 0,
                        len: BLOCK_LEN as u64 + 100,
                    },
                    FileInfo {
                        path: PathBuf::from("sub/b.bin"),
                        torrent_offset: BLOCK_LEN as u64 + 100,
                        len: BLOCK_LEN as u64 - 100,
                    },
                ],
            },
        };
        let (alert_chan, mut alerts) = mpsc::unbounded_channel();
        let torrent = Torrent::new(
            Arc::new(fs.clone()),
            info,
            hashes_of(&[piece.clone()]),
            alert_chan,
        )
        .unwrap();

        torrent.write_piece(0, piece.clone()).unwrap();
        assert!(matches!(
            recv(&mut alerts).await,
            Alert::PieceWritten {
                result: WriteResult::Success { .. },
                ..
            }
        ));

        let first = fs
            .contents(std::path::Path::new("/downloads/multi/a.bin"))
            .unwrap();
        let second = fs
            .contents(std::path::Path::new("/downloads/multi/sub/b.bin"))
            .unwrap();
        assert_eq!(first.len(), BLOCK_LEN as usize + 100);
        assert_eq!(second.len(), BLOCK_LEN as usize - 100);
        let mut joined = first;
        joined.extend(second);
        assert_eq!(joined, piece);
    }
}
