//! spindrift is a BitTorrent v1 engine library. The [`Engine`] hosts any
//! number of torrents; each torrent runs on a task of its own that owns all
//! of its mutable state and talks to peer sockets and the disk over
//! channels. This module holds the small vocabulary the whole crate shares.

#[macro_use]
extern crate serde_derive;

mod choke;
mod chunked_buf;
pub mod conf;
mod counter;
pub mod discovery;
mod disk;
mod download;
pub mod engine;
pub mod error;
pub mod metainfo;
mod peer;
mod piece_picker;
pub mod storage_info;
pub mod store;
mod torrent;
pub mod vfs;

use bitvec::prelude::{BitVec, Msb0};
use bytes::Bytes;

pub use engine::{AddMode, Engine, TorrentHandle};
pub use storage_info::FileInfo;
pub use torrent::{TorrentState, TorrentStatus};

/// Pieces are addressed by their position in the torrent. They cross the
/// wire as big endian u32 values but live as `usize` in memory, like every
/// other index in the crate.
pub type PieceIndex = usize;

/// A file's position in the torrent's file list.
pub type FileIndex = usize;

/// An engine-unique identifier handed to each torrent when it is added.
pub type TorrentId = u32;

/// Within a torrent, each connection gets a small integer key that stays
/// stable for the connection's lifetime. Block reservations and choke
/// decisions refer to peers by this key, never by the wire-level peer id,
/// which isn't known until the handshake.
pub(crate) type PeerKey = u32;

/// The 20 byte identity a client announces in its handshake. BEP 20
/// describes the common conventions for picking one.
pub type PeerId = [u8; 20];

/// A SHA-1 digest: piece hashes and the torrent's info hash.
pub type Sha1Hash = [u8; 20];

/// One bit per piece, set when the piece is verified. The backing storage
/// is most-significant-bit-first bytes, which is exactly the layout the
/// BITFIELD message uses, so the raw slice can go on the wire as is.
pub type Bitfield = BitVec<u8, Msb0>;

/// Transfers happen in 16 KiB blocks, the unit the whole swarm requests
/// in. Only the final block of a piece may fall short of this.
pub(crate) const BLOCK_LEN: u32 = 16 * 1024;

/// Addresses one block: which piece, where in the piece, and how long.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct BlockInfo {
    pub piece_index: PieceIndex,
    /// Byte offset within the piece. Always a multiple of [`BLOCK_LEN`]
    /// for blocks we deal in.
    pub offset: u32,
    /// Payload length. [`BLOCK_LEN`], or less for a piece's tail block.
    pub len: u32,
}

impl BlockInfo {
    /// The block's position in its piece's block grid.
    pub fn index_in_piece(&self) -> usize {
        debug_assert!(self.len > 0);
        debug_assert!(self.len <= BLOCK_LEN);
        (self.offset / BLOCK_LEN) as usize
    }
}

impl std::fmt::Display for BlockInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "(piece: {}, offset: {}, len: {})",
            self.piece_index, self.offset, self.len
        )
    }
}

/// A block with its payload attached, as served to a peer on the upload
/// path.
#[derive(Clone, Debug)]
pub(crate) struct Block {
    pub piece_index: PieceIndex,
    pub offset: u32,
    pub data: Bytes,
}

impl Block {
    pub fn new(info: BlockInfo, data: impl Into<Bytes>) -> Self {
        Self {
            piece_index: info.piece_index,
            offset: info.offset,
            data: data.into(),
        }
    }

    pub fn info(&self) -> BlockInfo {
        BlockInfo {
            piece_index: self.piece_index,
            offset: self.offset,
            len: self.data.len() as u32,
        }
    }
}

/// The length of the block at `index` in a piece of `piece_len` bytes:
/// [`BLOCK_LEN`] everywhere except the tail block, which takes whatever
/// remains.
///
/// # Panics
///
/// Panics if the piece has no block at that index.
pub(crate) fn block_len(piece_len: u32, index: usize) -> u32 {
    let block_offset = index as u32 * BLOCK_LEN;
    assert!(block_offset < piece_len);
    (piece_len - block_offset).min(BLOCK_LEN)
}

/// How many blocks a piece of the given length splits into. A short tail
/// counts as a whole block.
pub(crate) fn block_count(piece_len: u32) -> usize {
    let whole = (piece_len / BLOCK_LEN) as usize;
    if piece_len % BLOCK_LEN == 0 {
        whole
    } else {
        whole + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_grid_of_an_even_piece() {
        let piece_len = 4 * BLOCK_LEN;
        assert_eq!(block_count(piece_len), 4);
        for index in 0..4 {
            assert_eq!(block_len(piece_len, index), BLOCK_LEN);
        }
    }

    #[test]
    fn tail_block_takes_the_remainder() {
        let piece_len = 2 * BLOCK_LEN + 600;
        assert_eq!(block_count(piece_len), 3);
        assert_eq!(block_len(piece_len, 0), BLOCK_LEN);
        assert_eq!(block_len(piece_len, 1), BLOCK_LEN);
        assert_eq!(block_len(piece_len, 2), 600);
    }

    #[test]
    #[should_panic]
    fn block_past_the_piece_end_panics() {
        block_len(BLOCK_LEN, 1);
    }

    #[test]
    fn block_offset_maps_back_to_its_index() {
        let block = BlockInfo {
            piece_index: 0,
            offset: 3 * BLOCK_LEN,
            len: BLOCK_LEN,
        };
        assert_eq!(block.index_in_piece(), 3);

        let tail = BlockInfo {
            piece_index: 7,
            offset: BLOCK_LEN,
            len: 9,
        };
        assert_eq!(tail.index_in_piece(), 1);
    }

    #[test]
    fn block_carries_its_info() {
        let info = BlockInfo {
            piece_index: 2,
            offset: BLOCK_LEN,
            len: 5,
        };
        let block = Block::new(info, vec![0u8; 5]);
        assert_eq!(block.info(), info);
    }
}
