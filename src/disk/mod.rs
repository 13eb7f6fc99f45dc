//! The disk task: hash verification, durable writes, reads for seeding.
//!
//! The task owns every torrent's file handles. Work arrives as commands,
//! the expensive parts (SHA-1, file I/O) run on blocking workers, and
//! outcomes return to each torrent through its own alert channel, which the
//! torrent drains as a batch at the start of its tick.

mod error;
mod io;

use std::sync::Arc;

use tokio::{sync::mpsc, task};

pub(crate) use error::{NewTorrentError, ReadError};

use crate::{
    storage_info::StorageInfo, vfs::Vfs, Bitfield, Block, BlockInfo,
    PieceIndex, TorrentId,
};

/// The commands the disk task accepts.
pub(crate) enum Command {
    /// Sets up a torrent's directory structure and file handles. The first
    /// alert on the given channel reports the allocation outcome.
    NewTorrent {
        id: TorrentId,
        storage_info: StorageInfo,
        piece_hashes: Vec<u8>,
        alert_chan: AlertSender,
    },
    /// Hashes the assembled piece and, if valid, writes it durably.
    WritePiece {
        id: TorrentId,
        piece_index: PieceIndex,
        data: Vec<u8>,
    },
    /// Reads a block for the upload path, through the piece read cache.
    ReadBlock { id: TorrentId, block_info: BlockInfo },
    /// Rehashes all on-disk data and reports the ground-truth bitfield.
    Recheck { id: TorrentId },
    /// Forgets the torrent, optionally deleting its files.
    RemoveTorrent { id: TorrentId, delete_files: bool },
    /// Stops the disk task.
    Shutdown,
}

/// Per-operation outcomes, delivered to the owning torrent.
#[derive(Debug)]
pub(crate) enum Alert {
    /// The allocation outcome of `NewTorrent`.
    Allocated(Result<(), NewTorrentError>),
    /// A `WritePiece` finished.
    PieceWritten {
        piece_index: PieceIndex,
        result: WriteResult,
    },
    /// A `ReadBlock` succeeded.
    BlockRead(Block),
    /// A `ReadBlock` failed.
    ReadFailed {
        block_info: BlockInfo,
        error: ReadError,
    },
    /// A `Recheck` finished with the verified bitfield.
    RecheckDone(Bitfield),
}

/// The outcome of a verified write.
#[derive(Debug)]
pub(crate) enum WriteResult {
    /// The piece hash matched and all bytes are durably on disk.
    Success { bytes: usize },
    /// The piece hash did not match; nothing was written.
    HashMismatch,
    /// The piece index was out of bounds; nothing was written.
    InvalidArgs,
    /// The filesystem failed mid-write.
    Io(std::io::Error),
}

pub(crate) type CommandSender = mpsc::UnboundedSender<Command>;
pub(crate) type CommandReceiver = mpsc::UnboundedReceiver<Command>;
pub(crate) type AlertSender = mpsc::UnboundedSender<Alert>;
pub(crate) type AlertReceiver = mpsc::UnboundedReceiver<Alert>;

/// Spawns the disk task over the given filesystem and returns its command
/// channel and join handle.
pub(crate) fn spawn(
    vfs: Arc<dyn Vfs>,
) -> (task::JoinHandle<()>, CommandSender) {
    let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
    let mut disk = io::Disk::new(vfs, cmd_port);
    let join_handle = task::spawn(async move {
        if let Err(e) = disk.run().await {
            log::error!("Disk task exited with error: {}", e);
        }
    });
    (join_handle, cmd_chan)
}
