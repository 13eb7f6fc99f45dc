//! Session persistence: the store contract and the per-torrent resume state.
//!
//! The engine records, for every torrent, which pieces are verified on disk
//! and the transfer counters, so that a restart resumes where it left off
//! instead of re-downloading. The store itself is a capability the host
//! provides; the engine ships an in-memory adapter for tests and a
//! directory-backed one for simple hosts.

use std::{
    collections::HashMap,
    fs, io,
    path::PathBuf,
    sync::Mutex,
};

use serde_bytes::ByteBuf;

use crate::{
    error::{Error, Result},
    Bitfield, Sha1Hash,
};

/// The key under which a torrent's resume state is stored.
pub fn state_key(info_hash: &Sha1Hash) -> String {
    format!("torrent:{}:state", hex::encode(info_hash))
}

/// The key under which a magnet-origin torrent's raw info dict is stored.
pub fn meta_key(info_hash: &Sha1Hash) -> String {
    format!("torrent:{}:meta", hex::encode(info_hash))
}

/// The prefix shared by all torrent keys, used for session restore.
pub const TORRENT_KEY_PREFIX: &str = "torrent:";

/// Extracts the info hash from a `torrent:<hex>:state` key.
pub(crate) fn info_hash_of_state_key(key: &str) -> Option<Sha1Hash> {
    let hex_part = key
        .strip_prefix(TORRENT_KEY_PREFIX)?
        .strip_suffix(":state")?;
    let bytes = hex::decode(hex_part).ok()?;
    if bytes.len() != 20 {
        return None;
    }
    let mut hash = [0; 20];
    hash.copy_from_slice(&bytes);
    Some(hash)
}

/// The persistence capability the engine is constructed over.
pub trait SessionStore: Send + Sync + 'static {
    fn get(&self, key: &str) -> io::Result<Option<Vec<u8>>>;
    fn set(&self, key: &str, value: &[u8]) -> io::Result<()>;
    fn delete(&self, key: &str) -> io::Result<()>;
    /// Returns all keys starting with the prefix, in no particular order.
    fn keys(&self, prefix: &str) -> io::Result<Vec<String>>;
}

/// A torrent's persisted state. Version 1.
///
/// The encoding is bencode, so the same parser stack that reads metainfo
/// reads this, and the bitfield round-trips as a raw byte string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeState {
    pub version: u8,
    /// The verified-piece bitfield, `ceil(piece_count / 8)` bytes.
    pub bitfield: ByteBuf,
    /// Payload bytes downloaded over the torrent's lifetime.
    pub downloaded: u64,
    /// Payload bytes uploaded over the torrent's lifetime.
    pub uploaded: u64,
    /// When the torrent was added, unix milliseconds.
    pub added_at: u64,
    /// When the download completed, unix milliseconds, if it has.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub completed_at: Option<u64>,
}

impl ResumeState {
    pub const VERSION: u8 = 1;

    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_bencode::to_bytes(self).map_err(|e| {
            log::error!("Failed to encode resume state: {}", e);
            Error::InvalidResumeState
        })
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let state: Self = serde_bencode::from_bytes(buf).map_err(|e| {
            log::warn!("Failed to decode resume state: {}", e);
            Error::InvalidResumeState
        })?;
        if state.version != Self::VERSION {
            log::warn!("Unknown resume state version {}", state.version);
            return Err(Error::InvalidResumeState);
        }
        Ok(state)
    }

    /// Reconstructs the bitfield, truncated to the torrent's piece count.
    pub fn bitfield(&self, piece_count: usize) -> Bitfield {
        let mut bitfield = Bitfield::from_vec(self.bitfield.to_vec());
        bitfield.resize(piece_count, false);
        bitfield
    }
}

/// An in-memory session store. State does not survive the process; used in
/// tests and by hosts that handle persistence themselves.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemoryStore {
    fn get(&self, key: &str) -> io::Result<Option<Vec<u8>>> {
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    fn set(&self, key: &str, value: &[u8]) -> io::Result<()> {
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_owned(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> io::Result<()> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }

    fn keys(&self, prefix: &str) -> io::Result<Vec<String>> {
        Ok(self
            .entries
            .lock()
            .unwrap()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

/// A session store backed by one file per key in a directory.
#[derive(Debug)]
pub struct DirStore {
    dir: PathBuf,
}

impl DirStore {
    pub fn new(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_of(&self, key: &str) -> PathBuf {
        self.dir.join(key)
    }
}

impl SessionStore for DirStore {
    fn get(&self, key: &str) -> io::Result<Option<Vec<u8>>> {
        match fs::read(self.path_of(key)) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn set(&self, key: &str, value: &[u8]) -> io::Result<()> {
        // write-then-rename so that a crash can't leave a torn state file
        let tmp = self.path_of(&format!("{}.tmp", key));
        fs::write(&tmp, value)?;
        fs::rename(tmp, self.path_of(key))
    }

    fn delete(&self, key: &str) -> io::Result<()> {
        match fs::remove_file(self.path_of(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn keys(&self, prefix: &str) -> io::Result<Vec<String>> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let name = entry?.file_name();
            if let Some(name) = name.to_str() {
                if name.starts_with(prefix) && !name.ends_with(".tmp") {
                    keys.push(name.to_owned());
                }
            }
        }
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn sample_state() -> ResumeState {
        ResumeState {
            version: ResumeState::VERSION,
            bitfield: ByteBuf::from(vec![0b1010_0000, 0b1000_0000]),
            downloaded: 123_456,
            uploaded: 789,
            added_at: 1_600_000_000_000,
            completed_at: None,
        }
    }

    #[test]
    fn test_resume_state_roundtrip() {
        let state = sample_state();
        let encoded = state.encode().unwrap();
        let decoded = ResumeState::decode(&encoded).unwrap();
        assert_eq!(decoded, state);

        // and with the completion timestamp present
        let mut state = sample_state();
        state.completed_at = Some(1_600_000_100_000);
        let decoded = ResumeState::decode(&state.encode().unwrap()).unwrap();
        assert_eq!(decoded, state);
    }

    #[test]
    fn test_resume_state_rejects_unknown_version() {
        let mut state = sample_state();
        state.version = 2;
        let encoded = state.encode().unwrap();
        assert!(matches!(
            ResumeState::decode(&encoded),
            Err(Error::InvalidResumeState)
        ));
    }

    #[test]
    fn test_bitfield_reconstruction() {
        let state = sample_state();
        // 9 pieces: the stored 16 bits are truncated to the piece count
        let bitfield = state.bitfield(9);
        assert_eq!(bitfield.len(), 9);
        assert!(bitfield[0]);
        assert!(!bitfield[1]);
        assert!(bitfield[2]);
        assert!(bitfield[8]);
        assert_eq!(bitfield.count_ones(), 3);
    }

    #[test]
    fn test_key_parsing() {
        let hash = [0xcd; 20];
        let key = state_key(&hash);
        assert_eq!(info_hash_of_state_key(&key), Some(hash));
        assert_eq!(info_hash_of_state_key("torrent:zz:state"), None);
        assert_eq!(
            info_hash_of_state_key(&format!(
                "torrent:{}:meta",
                hex::encode(hash)
            )),
            None
        );
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryStore::new();
        store.set("torrent:aa:state", b"x").unwrap();
        store.set("torrent:bb:state", b"y").unwrap();
        store.set("other", b"z").unwrap();

        assert_eq!(store.get("torrent:aa:state").unwrap(), Some(b"x".to_vec()));
        assert_eq!(store.get("missing").unwrap(), None);

        let mut keys = store.keys(TORRENT_KEY_PREFIX).unwrap();
        keys.sort();
        assert_eq!(keys, vec!["torrent:aa:state", "torrent:bb:state"]);

        store.delete("torrent:aa:state").unwrap();
        assert_eq!(store.get("torrent:aa:state").unwrap(), None);
    }
}
