//! Parsing of `.torrent` metainfo and magnet URIs.

use std::path::PathBuf;

use serde_bytes::ByteBuf;
use sha1::{Digest, Sha1};
use url::Url;

use crate::{
    error::{Error, Result},
    storage_info::{FileInfo, FsStructure},
    Sha1Hash,
};

/// The parsed and validated form of a `.torrent` file.
///
/// Only the fields the engine itself consumes are kept; the raw bencoded
/// info dictionary is preserved so that magnet-origin torrents can be
/// reconstructed from the session store.
#[derive(Debug, Clone)]
pub struct Metainfo {
    /// The name of the torrent, also the name of its download directory
    /// entry.
    pub name: String,
    /// The SHA-1 digest of the bencoded info dictionary, the torrent's
    /// identity on the wire.
    pub info_hash: Sha1Hash,
    /// The concatenation of all 20 byte piece hashes.
    pub pieces: Vec<u8>,
    /// The nominal piece length. The last piece may be shorter.
    pub piece_len: u32,
    /// The file layout of the download.
    pub structure: FsStructure,
    /// The announce URL, if the torrent has one. The engine only hands this
    /// to the host's tracker adapter, it never speaks the tracker protocol
    /// itself.
    pub announce: Option<String>,
    /// The bencoded info dictionary, verbatim as hashed.
    pub raw_info: Vec<u8>,
}

impl Metainfo {
    /// Parses a `.torrent` file's bytes.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let raw: RawMetainfo =
            serde_bencode::from_bytes(buf).map_err(|e| {
                log::warn!("Failed to parse metainfo: {}", e);
                Error::InvalidMetainfo
            })?;
        Self::from_raw(raw)
    }

    /// Reconstructs a metainfo from a previously stored raw info dictionary,
    /// as used when resuming a magnet-origin torrent.
    pub fn from_raw_info(raw_info: &[u8]) -> Result<Self> {
        let info: RawInfo =
            serde_bencode::from_bytes(raw_info).map_err(|e| {
                log::warn!("Failed to parse stored info dict: {}", e);
                Error::InvalidMetainfo
            })?;
        Self::from_raw(RawMetainfo {
            info,
            announce: None,
        })
    }

    fn from_raw(raw: RawMetainfo) -> Result<Self> {
        let info = raw.info;

        if info.pieces.is_empty() || info.pieces.len() % 20 != 0 {
            log::warn!("Metainfo has invalid piece hash string");
            return Err(Error::InvalidMetainfo);
        }
        if info.piece_length == 0 || info.piece_length > u32::MAX as u64 {
            log::warn!("Metainfo has invalid piece length");
            return Err(Error::InvalidMetainfo);
        }

        // the info hash must be computed over the info dict exactly as it
        // will be re-serialized for storage
        let raw_info = serde_bencode::to_bytes(&info).map_err(|e| {
            log::warn!("Failed to re-encode info dict: {}", e);
            Error::InvalidMetainfo
        })?;
        let digest = Sha1::digest(&raw_info);
        let mut info_hash = [0; 20];
        info_hash.copy_from_slice(&digest);

        let structure = match (&info.length, &info.files) {
            (Some(len), None) => FsStructure::File(FileInfo {
                path: PathBuf::from(&info.name),
                torrent_offset: 0,
                len: *len,
            }),
            (None, Some(files)) if !files.is_empty() => {
                let mut offset = 0;
                let mut file_infos = Vec::with_capacity(files.len());
                for file in files {
                    let mut path = PathBuf::new();
                    for part in &file.path {
                        // path components must not escape the download root
                        if part.is_empty() || part == ".." {
                            log::warn!("Metainfo has invalid file path");
                            return Err(Error::InvalidMetainfo);
                        }
                        path.push(part);
                    }
                    file_infos.push(FileInfo {
                        path,
                        torrent_offset: offset,
                        len: file.length,
                    });
                    offset += file.length;
                }
                FsStructure::Archive { files: file_infos }
            }
            _ => {
                log::warn!(
                    "Metainfo must have exactly one of `length` and `files`"
                );
                return Err(Error::InvalidMetainfo);
            }
        };

        let download_len = structure.download_len();
        let piece_count = info.pieces.len() / 20;
        // the piece grid must cover the download exactly
        let covered = info.piece_length * (piece_count as u64 - 1);
        if covered >= download_len
            || download_len > covered + info.piece_length
        {
            log::warn!("Metainfo piece grid doesn't match download length");
            return Err(Error::InvalidMetainfo);
        }

        Ok(Self {
            name: info.name,
            info_hash,
            pieces: info.pieces.into_vec(),
            piece_len: info.piece_length as u32,
            structure,
            announce: raw.announce,
            raw_info,
        })
    }

    /// The number of pieces in the torrent.
    pub fn piece_count(&self) -> usize {
        self.pieces.len() / 20
    }

    /// The expected hash of the piece at the index.
    pub fn piece_hash(&self, index: usize) -> Option<Sha1Hash> {
        let pos = index * 20;
        if pos + 20 > self.pieces.len() {
            return None;
        }
        let mut hash = [0; 20];
        hash.copy_from_slice(&self.pieces[pos..pos + 20]);
        Some(hash)
    }
}

/// The engine-relevant parts of a magnet link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MagnetUri {
    /// The v1 info hash from the `xt` parameter.
    pub info_hash: Sha1Hash,
    /// The display name, if present.
    pub name: Option<String>,
    /// Tracker URLs, passed through to the host's tracker adapter.
    pub trackers: Vec<String>,
}

impl MagnetUri {
    /// Parses a `magnet:?xt=urn:btih:...` URI. Both the 40 character hex and
    /// the 32 character base32 info hash encodings are accepted.
    pub fn parse(uri: &str) -> Result<Self> {
        let url = Url::parse(uri).map_err(|_| Error::InvalidMagnet)?;
        if url.scheme() != "magnet" {
            return Err(Error::InvalidMagnet);
        }

        let mut info_hash = None;
        let mut name = None;
        let mut trackers = Vec::new();
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "xt" => {
                    let encoded = value
                        .strip_prefix("urn:btih:")
                        .ok_or(Error::InvalidMagnet)?;
                    info_hash = Some(decode_info_hash(encoded)?);
                }
                "dn" => name = Some(value.into_owned()),
                "tr" => trackers.push(value.into_owned()),
                _ => {}
            }
        }

        Ok(Self {
            info_hash: info_hash.ok_or(Error::InvalidMagnet)?,
            name,
            trackers,
        })
    }
}

fn decode_info_hash(encoded: &str) -> Result<Sha1Hash> {
    let mut hash = [0; 20];
    match encoded.len() {
        40 => {
            let bytes =
                hex::decode(encoded).map_err(|_| Error::InvalidMagnet)?;
            hash.copy_from_slice(&bytes);
            Ok(hash)
        }
        32 => {
            let bytes = decode_base32(encoded)?;
            hash.copy_from_slice(&bytes);
            Ok(hash)
        }
        _ => Err(Error::InvalidMagnet),
    }
}

/// RFC 4648 base32 decoding, the legacy magnet info hash encoding.
fn decode_base32(encoded: &str) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(encoded.len() * 5 / 8);
    let mut acc: u64 = 0;
    let mut bits = 0;
    for c in encoded.bytes() {
        let value = match c {
            b'A'..=b'Z' => c - b'A',
            b'a'..=b'z' => c - b'a',
            b'2'..=b'7' => c - b'2' + 26,
            _ => return Err(Error::InvalidMagnet),
        };
        acc = (acc << 5) | value as u64;
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            out.push((acc >> bits) as u8);
        }
    }
    Ok(out)
}

/// The serde shape of a `.torrent` file. Only used during parsing.
#[derive(Debug, Deserialize)]
struct RawMetainfo {
    info: RawInfo,
    announce: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RawInfo {
    name: String,
    #[serde(with = "serde_bytes")]
    pieces: ByteBuf,
    #[serde(rename = "piece length")]
    piece_length: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    length: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    files: Option<Vec<RawFile>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    private: Option<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RawFile {
    path: Vec<String>,
    length: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds the bencoding of a minimal single file torrent by hand so the
    /// parser is tested against known bytes rather than its own output.
    fn single_file_torrent(
        name: &str,
        piece_length: usize,
        length: usize,
        pieces: &[u8],
    ) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"d4:infod");
        buf.extend_from_slice(
            format!("6:lengthi{}e", length).as_bytes(),
        );
        buf.extend_from_slice(
            format!("4:name{}:{}", name.len(), name).as_bytes(),
        );
        buf.extend_from_slice(
            format!("12:piece lengthi{}e", piece_length).as_bytes(),
        );
        buf.extend_from_slice(format!("6:pieces{}:", pieces.len()).as_bytes());
        buf.extend_from_slice(pieces);
        buf.extend_from_slice(b"ee");
        buf
    }

    #[test]
    fn test_parse_single_file() {
        let pieces = [0xabu8; 40];
        let buf = single_file_torrent("test.bin", 16384, 20000, &pieces);
        let metainfo = Metainfo::from_bytes(&buf).unwrap();
        assert_eq!(metainfo.name, "test.bin");
        assert_eq!(metainfo.piece_len, 16384);
        assert_eq!(metainfo.piece_count(), 2);
        assert_eq!(metainfo.structure.download_len(), 20000);
        assert_eq!(metainfo.piece_hash(0), Some([0xab; 20]));
        assert_eq!(metainfo.piece_hash(2), None);
    }

    #[test]
    fn test_info_hash_matches_raw_info() {
        let pieces = [0u8; 20];
        let buf = single_file_torrent("a", 16384, 100, &pieces);
        let metainfo = Metainfo::from_bytes(&buf).unwrap();
        let digest = Sha1::digest(&metainfo.raw_info);
        assert_eq!(&metainfo.info_hash[..], &digest[..]);
    }

    #[test]
    fn test_roundtrip_via_raw_info() {
        let pieces = [7u8; 60];
        let buf = single_file_torrent("round", 16384, 40000, &pieces);
        let metainfo = Metainfo::from_bytes(&buf).unwrap();
        let restored = Metainfo::from_raw_info(&metainfo.raw_info).unwrap();
        assert_eq!(restored.info_hash, metainfo.info_hash);
        assert_eq!(restored.piece_count(), metainfo.piece_count());
        assert_eq!(restored.name, metainfo.name);
    }

    #[test]
    fn test_reject_mismatched_piece_grid() {
        // two piece hashes but a download only one piece long
        let pieces = [0u8; 40];
        let buf = single_file_torrent("bad", 16384, 16384, &pieces);
        assert!(matches!(
            Metainfo::from_bytes(&buf),
            Err(Error::InvalidMetainfo)
        ));
    }

    #[test]
    fn test_parse_magnet_hex() {
        let uri = format!(
            "magnet:?xt=urn:btih:{}&dn=linux.iso&tr=http://tracker.example/ann",
            "aa".repeat(20)
        );
        let magnet = MagnetUri::parse(&uri).unwrap();
        assert_eq!(magnet.info_hash, [0xaa; 20]);
        assert_eq!(magnet.name.as_deref(), Some("linux.iso"));
        assert_eq!(magnet.trackers.len(), 1);
    }

    #[test]
    fn test_parse_magnet_base32() {
        // base32 of twenty 0x00 bytes
        let uri = format!("magnet:?xt=urn:btih:{}", "A".repeat(32));
        let magnet = MagnetUri::parse(&uri).unwrap();
        assert_eq!(magnet.info_hash, [0; 20]);
    }

    #[test]
    fn test_reject_bad_magnets() {
        assert!(MagnetUri::parse("http://not.a.magnet/").is_err());
        assert!(MagnetUri::parse("magnet:?dn=nohash").is_err());
        assert!(MagnetUri::parse("magnet:?xt=urn:btih:tooshort").is_err());
    }
}
