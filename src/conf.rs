//! This module defines types used to configure the engine and its parts.

use std::{path::PathBuf, time::Duration};

use crate::PeerId;

/// The default spindrift client id.
pub const SPINDRIFT_CLIENT_ID: &PeerId = b"spd-0000000000000000";

/// The global configuration for the torrent engine and all its parts.
#[derive(Clone, Debug)]
pub struct Conf {
    pub engine: EngineConf,
    pub torrent: TorrentConf,
}

impl Conf {
    /// Builds a configuration with workable defaults under
    /// [`SPINDRIFT_CLIENT_ID`]. Only the download directory must be
    /// supplied; there is no sane guess for it.
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            engine: EngineConf {
                client_id: *SPINDRIFT_CLIENT_ID,
                listen_port: 6881,
                enable_dht: false,
            },
            torrent: TorrentConf::new(download_dir),
        }
    }
}

/// Configuration related to the engine itself.
#[derive(Clone, Debug)]
pub struct EngineConf {
    /// The ID of the client to announce to trackers and other peers.
    pub client_id: PeerId,
    /// The port advertised for inbound peer connections.
    pub listen_port: u16,
    /// Whether the DHT reserved bit is advertised in handshakes.
    pub enable_dht: bool,
}

/// Configuration for a torrent.
///
/// The engine will have a default instance of this applied to all torrents by
/// default, but individual torrents may override this configuration.
#[derive(Clone, Debug)]
pub struct TorrentConf {
    /// The directory in which a torrent's files are placed upon download and
    /// from which they are seeded.
    pub download_dir: PathBuf,

    /// The minimum number of peers we want to keep in torrent at all times.
    pub min_requested_peer_count: usize,

    /// The max number of connected peers the torrent should have.
    pub max_connected_peer_count: usize,

    /// If the tracker doesn't provide a minimum announce interval, we default
    /// to announcing every 30 seconds.
    pub announce_interval: Duration,

    /// A block request not answered within this window is swept by the
    /// scheduler, made requestable again, and the peer accrues a stall strike.
    pub request_timeout: Duration,

    /// If no message needed sending for this long, a keep alive is sent.
    pub keep_alive_interval: Duration,

    /// A peer that sent nothing at all for this long is disconnected.
    pub idle_timeout: Duration,

    /// A peer that doesn't complete the handshake within this window is
    /// disconnected.
    pub handshake_timeout: Duration,

    /// The lower bound of the per-peer request pipeline. The pipeline adapts
    /// upward with observed throughput but never below this.
    pub min_request_pipeline_len: usize,

    /// The upper bound of the per-peer request pipeline.
    pub max_request_pipeline_len: usize,

    /// The number of pieces that may have an in-memory buffer at any time.
    pub max_active_pieces: usize,

    /// Hard cap on the total bytes pinned in active piece buffers.
    pub max_buffered_bytes: usize,

    /// The number of hash/write jobs that may be queued at the disk before
    /// the scheduler stops starting new pieces.
    pub max_pending_disk_writes: usize,

    /// The pending disk job count past which the tick delay starts scaling
    /// with the backlog.
    pub disk_backlog_threshold: usize,

    /// The per-pending-job increment of the backlog-scaled tick delay.
    pub disk_backlog_delay_per_job: Duration,

    /// The cap of the backlog-scaled tick delay.
    pub max_backlog_delay: Duration,

    /// The floor of the tick interval, preventing a busy loop.
    pub min_tick_interval: Duration,

    /// The tick delay used when the torrent has no pending work.
    pub idle_tick_interval: Duration,

    /// Before this many pieces have completed, selection is rarest-first;
    /// after, it is sequential from the first needed piece.
    pub warmup_piece_count: usize,

    /// Endgame begins when the ratio of missing to total pieces drops to this
    /// value, or earlier if every missing piece is already active.
    pub endgame_threshold: f64,

    /// During endgame, how many peers may have the same block outstanding.
    pub endgame_duplicate_requests: usize,

    /// The number of upload slots, including the optimistic one.
    pub max_upload_slots: usize,

    /// How often unchoke decisions are recomputed.
    pub choke_interval: Duration,

    /// Every this many choke rounds the optimistic unchoke is re-rolled.
    pub optimistic_unchoke_rounds: usize,

    /// An unchoked peer that sent nothing for this long is rotated out
    /// regardless of its rank.
    pub snub_timeout: Duration,

    /// A peer whose blocks contributed to this many failed pieces is dropped
    /// and banned for the session.
    pub max_failed_piece_contributions: usize,

    /// Resume state is persisted every this many piece completions. It is
    /// always persisted on pause, stop and shutdown.
    pub resume_persist_interval: usize,
}

impl TorrentConf {
    /// Per-torrent defaults. As with [`Conf::new`], the download directory
    /// is the one thing the caller has to decide.
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            // an announce round trip for fewer peers than this isn't worth
            // making, even when the torrent is nearly full
            min_requested_peer_count: 10,
            // enough connections to saturate a healthy swarm without
            // drowning the host in sockets
            max_connected_peer_count: 50,
            announce_interval: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30),
            keep_alive_interval: Duration::from_secs(120),
            idle_timeout: Duration::from_secs(180),
            handshake_timeout: Duration::from_secs(10),
            min_request_pipeline_len: 10,
            max_request_pipeline_len: 500,
            max_active_pieces: 128,
            max_buffered_bytes: 64 * 1024 * 1024,
            max_pending_disk_writes: 32,
            disk_backlog_threshold: 30,
            disk_backlog_delay_per_job: Duration::from_micros(400),
            max_backlog_delay: Duration::from_millis(100),
            min_tick_interval: Duration::from_millis(5),
            idle_tick_interval: Duration::from_millis(20),
            warmup_piece_count: 4,
            endgame_threshold: 0.05,
            endgame_duplicate_requests: 2,
            max_upload_slots: 4,
            choke_interval: Duration::from_secs(10),
            optimistic_unchoke_rounds: 3,
            snub_timeout: Duration::from_secs(60),
            max_failed_piece_contributions: 3,
            resume_persist_interval: 16,
        }
    }

    /// The number of pieces still accepting new block reservations, derived
    /// from the current peer count so that a torrent with few peers doesn't
    /// sprawl buffers it cannot fill.
    pub(crate) fn max_partial_pieces(
        &self,
        connected_peer_count: usize,
        blocks_per_piece: usize,
    ) -> usize {
        let by_peers = connected_peer_count + connected_peer_count / 2;
        let by_blocks = 2048 / blocks_per_piece.max(1);
        by_peers.min(by_blocks).max(1).min(self.max_active_pieces)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_partial_pieces() {
        let conf = TorrentConf::new("/tmp");
        // 4 peers, 16 blocks per piece: peer bound is 6, block bound is 128
        assert_eq!(conf.max_partial_pieces(4, 16), 6);
        // many peers, large pieces: the block bound kicks in
        assert_eq!(conf.max_partial_pieces(100, 1024), 2);
        // no peers yet: still at least one partial allowed
        assert_eq!(conf.max_partial_pieces(0, 16), 1);
    }
}
