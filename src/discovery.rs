//! The peer acquisition seam.
//!
//! The engine does not speak the tracker or DHT wire protocols. Host
//! adapters do, and they meet the engine at the types in this module: peer
//! candidates flow in through a [`PeerSource`] channel, announce and lookup
//! triggers flow out through [`AnnounceSink`] and [`DhtSink`] channels. An
//! engine wired to no adapters still works, it just only downloads from
//! peers handed to it directly.

use std::net::SocketAddr;

use tokio::sync::mpsc;

use crate::Sha1Hash;

/// A peer candidate discovered by a tracker or DHT adapter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PeerFound {
    /// The torrent the peer was discovered for.
    pub info_hash: Sha1Hash,
    /// The peer's TCP endpoint.
    pub addr: SocketAddr,
}

/// The sending half host adapters use to deliver peer candidates.
pub type PeerSource = mpsc::UnboundedSender<PeerFound>;
pub(crate) type PeerSourceReceiver = mpsc::UnboundedReceiver<PeerFound>;

/// The announce event vocabulary of BEP 3.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AnnounceEvent {
    Started,
    Completed,
    Stopped,
    None,
}

/// An announce trigger emitted by the engine for the host's tracker adapter.
#[derive(Clone, Debug)]
pub struct Announce {
    pub info_hash: Sha1Hash,
    pub event: AnnounceEvent,
    /// Payload bytes downloaded so far.
    pub downloaded: u64,
    /// Payload bytes uploaded so far.
    pub uploaded: u64,
    /// Bytes still missing from the download.
    pub left: u64,
    /// How many peers the engine would like back.
    pub num_want: usize,
    /// The announce URL from the torrent's metainfo, if it had one.
    pub tracker_url: Option<String>,
}

/// The receiving half the host's tracker adapter drains.
pub type AnnounceSinkReceiver = mpsc::UnboundedReceiver<Announce>;
pub(crate) type AnnounceSink = mpsc::UnboundedSender<Announce>;

/// A request emitted by the engine for the host's DHT adapter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DhtRequest {
    /// Find peers for the torrent.
    Lookup(Sha1Hash),
    /// Announce that we serve the torrent on the given port.
    Announce(Sha1Hash, u16),
}

/// The receiving half the host's DHT adapter drains.
pub type DhtSinkReceiver = mpsc::UnboundedReceiver<DhtRequest>;
pub(crate) type DhtSink = mpsc::UnboundedSender<DhtRequest>;
