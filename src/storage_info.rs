//! Maps pieces onto the files they live in.
//!
//! A torrent's payload is one contiguous byte string chopped into equal
//! pieces, while on disk the same bytes are split into files at arbitrary
//! offsets. The verification path thinks in pieces and the filesystem in
//! files; this module holds the arithmetic between the two views.

use std::{ops::Range, path::PathBuf};

use crate::{
    error::{Error, Result},
    metainfo::Metainfo,
    FileIndex, PieceIndex,
};

/// One file of the download.
#[derive(Clone, Debug)]
pub struct FileInfo {
    /// Path relative to the download directory.
    pub path: PathBuf,
    /// Size in bytes.
    pub len: u64,
    /// Where the file begins within the torrent's contiguous byte string.
    /// Zero for a single file torrent.
    pub torrent_offset: u64,
}

impl FileInfo {
    /// One past the file's last byte, in torrent coordinates.
    pub(crate) fn torrent_end_offset(&self) -> u64 {
        self.torrent_offset + self.len
    }

    /// Translates a torrent-coordinate range into this file's own
    /// coordinates, cutting the length down to what fits inside the file.
    ///
    /// # Panics
    ///
    /// The range must start inside the file.
    pub(crate) fn get_slice(&self, torrent_offset: u64, len: u64) -> FileSlice {
        assert!(
            torrent_offset >= self.torrent_offset,
            "range starts before the file"
        );
        let offset = torrent_offset - self.torrent_offset;
        assert!(offset < self.len, "range starts past the file end");
        FileSlice {
            offset,
            len: len.min(self.len - offset),
        }
    }
}

/// A byte range within one file, in file coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct FileSlice {
    pub offset: u64,
    pub len: u64,
}

/// The piece and file geometry of a torrent, fixed at construction.
#[derive(Clone, Debug)]
pub struct StorageInfo {
    pub piece_count: usize,
    /// The nominal piece length. Every piece except possibly the last is
    /// exactly this long.
    pub piece_len: u32,
    /// The final piece's length: equals `piece_len` unless the payload
    /// stops short of a piece boundary.
    pub last_piece_len: u32,
    /// Total payload size, summed over all files.
    pub download_len: u64,
    /// Where the files land. An archive gets a subdirectory named after
    /// the torrent, so one with several top-level entries doesn't scatter
    /// them across the user's download directory.
    pub download_dir: PathBuf,
    pub structure: FsStructure,
}

impl StorageInfo {
    /// Derives the geometry from parsed metainfo.
    pub fn new(metainfo: &Metainfo, download_dir: PathBuf) -> Self {
        let download_len = metainfo.structure.download_len();
        let piece_len = metainfo.piece_len;
        let tail = download_len % piece_len as u64;
        let last_piece_len = if tail == 0 { piece_len } else { tail as u32 };

        let download_dir = if metainfo.structure.is_archive() {
            download_dir.join(&metainfo.name)
        } else {
            download_dir
        };

        Self {
            piece_count: metainfo.piece_count(),
            piece_len,
            last_piece_len,
            download_len,
            download_dir,
            structure: metainfo.structure.clone(),
        }
    }

    /// The length of one piece. Only the final piece may differ from the
    /// nominal length.
    pub fn piece_len(&self, index: PieceIndex) -> Result<u32> {
        if index + 1 == self.piece_count {
            Ok(self.last_piece_len)
        } else if index < self.piece_count {
            Ok(self.piece_len)
        } else {
            log::error!(
                "No piece {} in a {} piece torrent",
                index,
                self.piece_count
            );
            Err(Error::InvalidPieceIndex)
        }
    }

    /// The piece's starting offset in the torrent's byte string.
    pub fn torrent_piece_offset(&self, index: PieceIndex) -> u64 {
        self.piece_len as u64 * index as u64
    }

    /// Which files the piece's bytes touch.
    pub(crate) fn files_intersecting_piece(
        &self,
        index: PieceIndex,
    ) -> Result<Range<FileIndex>> {
        let start = self.torrent_piece_offset(index);
        let end = start + self.piece_len(index)? as u64;
        Ok(self.structure.files_intersecting_bytes(start..end))
    }
}

/// How the payload is laid out on disk.
#[derive(Clone, Debug)]
pub enum FsStructure {
    /// The whole payload is a single file.
    File(FileInfo),
    /// The payload spans several files, ordered by their torrent offset.
    Archive { files: Vec<FileInfo> },
}

impl FsStructure {
    pub fn is_archive(&self) -> bool {
        matches!(self, Self::Archive { .. })
    }

    /// The file list regardless of layout.
    pub(crate) fn files(&self) -> &[FileInfo] {
        match self {
            Self::File(file) => std::slice::from_ref(file),
            Self::Archive { files } => files,
        }
    }

    /// The payload size, summed over the files.
    pub fn download_len(&self) -> u64 {
        self.files().iter().map(|f| f.len).sum()
    }

    /// The files overlapping the half-open byte range, as an index range
    /// into [`Self::files`]. Empty when the range lies beyond the payload.
    ///
    /// The file list is sorted by offset, so both edges fall out of a
    /// binary partition: drop files that end at or before the range
    /// starts, stop at the first file that begins at or past where the
    /// range ends.
    pub(crate) fn files_intersecting_bytes(
        &self,
        bytes: Range<u64>,
    ) -> Range<FileIndex> {
        let files = self.files();
        let start = files
            .partition_point(|f| f.torrent_end_offset() <= bytes.start);
        let end =
            files.partition_point(|f| f.torrent_offset < bytes.end);
        start..end.max(start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(name: &str, torrent_offset: u64, len: u64) -> FileInfo {
        FileInfo {
            path: PathBuf::from(name),
            torrent_offset,
            len,
        }
    }

    /// Three files of 10, 25 and 13 bytes: 48 bytes of payload, split
    /// into three 16 byte pieces. The piece boundaries at 16 and 32 both
    /// fall inside the middle file.
    fn archive() -> FsStructure {
        FsStructure::Archive {
            files: vec![
                file("a", 0, 10),
                file("b", 10, 25),
                file("c", 35, 13),
            ],
        }
    }

    fn archive_info() -> StorageInfo {
        StorageInfo {
            piece_count: 3,
            piece_len: 16,
            last_piece_len: 16,
            download_len: 48,
            download_dir: PathBuf::from("/dl"),
            structure: archive(),
        }
    }

    #[test]
    fn slice_is_cut_down_to_the_file() {
        let f = file("x", 100, 40);
        // fits entirely inside
        assert_eq!(
            f.get_slice(110, 20),
            FileSlice {
                offset: 10,
                len: 20
            }
        );
        // runs past the file end and is shortened
        assert_eq!(
            f.get_slice(130, 50),
            FileSlice {
                offset: 30,
                len: 10
            }
        );
        // covers the file exactly
        assert_eq!(f.get_slice(100, 40), FileSlice { offset: 0, len: 40 });
    }

    #[test]
    #[should_panic(expected = "before the file")]
    fn slice_starting_before_the_file_panics() {
        file("x", 100, 40).get_slice(60, 10);
    }

    #[test]
    #[should_panic(expected = "past the file")]
    fn slice_starting_past_the_file_panics() {
        file("x", 100, 40).get_slice(140, 1);
    }

    #[test]
    fn piece_lengths_and_offsets() {
        // five pieces of 64 bytes, the last one a short 16
        let total = 4 * 64 + 16;
        let info = StorageInfo {
            piece_count: 5,
            piece_len: 64,
            last_piece_len: 16,
            download_len: total,
            download_dir: PathBuf::from("/dl"),
            structure: FsStructure::File(file("x", 0, total)),
        };
        assert_eq!(info.piece_len(0).unwrap(), 64);
        assert_eq!(info.piece_len(3).unwrap(), 64);
        assert_eq!(info.piece_len(4).unwrap(), 16);
        assert!(info.piece_len(5).is_err());

        assert_eq!(info.torrent_piece_offset(0), 0);
        assert_eq!(info.torrent_piece_offset(4), 256);
    }

    #[test]
    fn single_file_holds_every_piece() {
        let info = StorageInfo {
            piece_count: 2,
            piece_len: 8,
            last_piece_len: 8,
            download_len: 16,
            download_dir: PathBuf::from("/dl"),
            structure: FsStructure::File(file("x", 0, 16)),
        };
        assert_eq!(info.files_intersecting_piece(0).unwrap(), 0..1);
        assert_eq!(info.files_intersecting_piece(1).unwrap(), 0..1);
    }

    #[test]
    fn pieces_map_to_their_file_runs() {
        let info = archive_info();
        // bytes 0..16 straddle the first file boundary
        assert_eq!(info.files_intersecting_piece(0).unwrap(), 0..2);
        // bytes 16..32 sit wholly inside the middle file
        assert_eq!(info.files_intersecting_piece(1).unwrap(), 1..2);
        // bytes 32..48 straddle the last boundary
        assert_eq!(info.files_intersecting_piece(2).unwrap(), 1..3);
        // no fourth piece
        assert!(info.files_intersecting_piece(3).is_err());
    }

    #[test]
    fn byte_ranges_map_to_file_runs() {
        let s = archive();
        // exactly the first file
        assert_eq!(s.files_intersecting_bytes(0..10), 0..1);
        // one byte on each side of a file boundary
        assert_eq!(s.files_intersecting_bytes(9..11), 0..2);
        // exactly the middle file
        assert_eq!(s.files_intersecting_bytes(10..35), 1..2);
        // the tail of the payload
        assert_eq!(s.files_intersecting_bytes(35..48), 2..3);
        // everything
        assert_eq!(s.files_intersecting_bytes(0..48), 0..3);
        // beyond the payload: an empty run
        assert!(s.files_intersecting_bytes(48..64).is_empty());
    }

    #[test]
    fn archive_length_sums_its_files() {
        assert_eq!(archive().download_len(), 48);
    }
}
