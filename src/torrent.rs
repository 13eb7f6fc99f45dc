//! The per-torrent runtime: one task owning every piece of the torrent's
//! mutable state.
//!
//! Everything here runs on a single task, the scheduling domain. Peer
//! driver tasks feed raw bytes in, the disk task feeds completion alerts
//! in, and both are drained at the start of each tick; within a tick the
//! code is free to mutate the picker, the active pieces and every session
//! without any locking. The tick itself is adaptive: immediate while there
//! is work, stretched while the disk is backlogged, slow while idle.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant, SystemTime},
};

use bytes::Bytes;
use rand::Rng;
use serde_bytes::ByteBuf;
use tokio::{
    net::TcpStream,
    sync::{mpsc, oneshot},
    time::sleep,
};

use crate::{
    choke::{Candidate, Choker},
    conf::TorrentConf,
    counter::ThruputCounters,
    discovery::{Announce, AnnounceEvent, AnnounceSink, DhtRequest, DhtSink},
    disk,
    download::Downloads,
    error::{Error, Result},
    peer::{
        codec::{
            decode_message, Decoded, Handshake, Message, PieceHeader,
            PIECE_HEADER_LEN,
        },
        io::{self, PeerEvent},
        Direction, PeerSession, State as PeerState,
    },
    piece_picker::PiecePicker,
    storage_info::StorageInfo,
    store::{self, ResumeState, SessionStore},
    Bitfield, BlockInfo, PeerId, PeerKey, PieceIndex, Sha1Hash, TorrentId,
};

/// The host-visible lifecycle state of a torrent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TorrentState {
    /// Waiting for the disk task to set up files.
    Allocating,
    /// Rehashing on-disk data.
    Checking,
    Downloading,
    Seeding,
    Paused,
    /// A disk failure stopped the torrent; user action required.
    Errored,
}

/// A point-in-time summary of a torrent, as returned by the status query.
#[derive(Clone, Debug)]
pub struct TorrentStatus {
    pub state: TorrentState,
    /// Completed fraction of wanted pieces, 0 to 1.
    pub progress: f64,
    /// Payload download rate, bytes per second over a 5 second window.
    pub download_rate: u64,
    /// Payload upload rate, bytes per second over a 5 second window.
    pub upload_rate: u64,
    /// Lifetime payload bytes downloaded, across restarts.
    pub downloaded: u64,
    /// Lifetime payload bytes uploaded, across restarts.
    pub uploaded: u64,
    pub peer_count: usize,
    pub error_message: Option<String>,
}

/// The commands a torrent accepts from the engine.
pub(crate) enum Command {
    /// Peer candidates from discovery or the host.
    AddPeers(Vec<SocketAddr>),
    /// An inbound connection whose handshake the engine already exchanged.
    InboundPeer {
        socket: TcpStream,
        leftover: Bytes,
        handshake: Handshake,
    },
    Pause,
    Resume,
    Recheck,
    /// Per-file download priorities, by file index. Priority 0 skips the
    /// file; pieces wholly inside skipped files are never selected.
    SetFilePriorities(Vec<u8>),
    Status(oneshot::Sender<TorrentStatus>),
    /// Persist state and stop. The sender is acknowledged once state is
    /// durable.
    Shutdown(oneshot::Sender<()>),
}

pub(crate) type Sender = mpsc::UnboundedSender<Command>;
type Receiver = mpsc::UnboundedReceiver<Command>;

/// How many peer events a torrent buffers before its drivers stop reading,
/// which is what propagates backpressure onto the sockets.
const PEER_EVENT_QUEUE_LEN: usize = 512;

/// Everything a torrent needs at construction.
pub(crate) struct Params {
    pub id: TorrentId,
    pub info_hash: Sha1Hash,
    pub client_id: PeerId,
    pub enable_dht: bool,
    pub listen_port: u16,
    pub conf: TorrentConf,
    pub storage: StorageInfo,
    pub piece_hashes: Vec<u8>,
    pub tracker_url: Option<String>,
    pub disk: disk::CommandSender,
    pub store: Arc<dyn SessionStore>,
    pub announce_sink: Option<AnnounceSink>,
    pub dht_sink: Option<DhtSink>,
    pub start_paused: bool,
}

pub(crate) fn spawn(
    params: Params,
) -> (tokio::task::JoinHandle<()>, Sender) {
    let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
    let mut torrent = Torrent::new(params, cmd_port);
    let join_handle = tokio::spawn(async move {
        if let Err(e) = torrent.run().await {
            log::error!("Torrent {} exited with error: {}", torrent.id, e);
        }
    });
    (join_handle, cmd_chan)
}

struct Torrent {
    id: TorrentId,
    info_hash: Sha1Hash,
    client_id: PeerId,
    enable_dht: bool,
    listen_port: u16,
    conf: TorrentConf,
    storage: StorageInfo,
    piece_hashes: Vec<u8>,
    tracker_url: Option<String>,
    state: TorrentState,
    error_message: Option<String>,
    /// The state to return to once allocation or checking finishes.
    paused: bool,

    picker: PiecePicker,
    downloads: Downloads,
    peers: HashMap<PeerKey, PeerSession>,
    next_peer_key: PeerKey,
    /// Scheduling visit order, rotated every tick so no peer is starved.
    visit_order: VecDeque<PeerKey>,
    /// Addresses with a live session (or dial in progress).
    connected_addrs: HashSet<SocketAddr>,
    /// Addresses banned for the session: protocol violations and poisoners.
    banned_addrs: HashSet<SocketAddr>,
    /// Dial queue.
    candidates: VecDeque<SocketAddr>,
    /// Transiently failed addresses eligible for reconnection.
    reconnects: HashMap<SocketAddr, ReconnectState>,

    choker: Choker,
    last_choke_round: Option<Instant>,

    counters: ThruputCounters,
    /// Lifetime transfer totals carried over from previous sessions.
    downloaded_base: u64,
    uploaded_base: u64,
    added_at: u64,
    completed_at: Option<u64>,
    completions_since_persist: usize,

    cmd_port: Receiver,
    peer_events: io::EventReceiver,
    peer_events_chan: io::EventSender,
    disk: disk::CommandSender,
    disk_alerts: disk::AlertReceiver,
    disk_alerts_chan: disk::AlertSender,
    pending_disk_writes: usize,
    store: Arc<dyn SessionStore>,
    announce_sink: Option<AnnounceSink>,
    dht_sink: Option<DhtSink>,
    last_announce: Option<Instant>,

    /// The frame size guard: the largest legitimate PIECE frame or
    /// bitfield, plus slack.
    max_frame_len: u32,
}

struct ReconnectState {
    attempts: usize,
    next_attempt: Instant,
}

/// Dial failures back off this long, plus jitter, before the address is
/// retried; after `MAX_RECONNECT_ATTEMPTS` consecutive failures it is
/// forgotten.
const RECONNECT_BACKOFF: Duration = Duration::from_secs(30);
const RECONNECT_JITTER_SECS: u64 = 10;
const MAX_RECONNECT_ATTEMPTS: usize = 3;

impl Torrent {
    fn new(params: Params, cmd_port: Receiver) -> Self {
        let Params {
            id,
            info_hash,
            client_id,
            enable_dht,
            listen_port,
            conf,
            storage,
            piece_hashes,
            tracker_url,
            disk,
            store,
            announce_sink,
            dht_sink,
            start_paused,
        } = params;

        let piece_count = storage.piece_count;
        let bitfield_frame_len = (piece_count + 7) / 8 + 1;
        let piece_frame_len = crate::BLOCK_LEN as usize + 9;
        let max_frame_len =
            bitfield_frame_len.max(piece_frame_len) as u32 + 64;

        let (peer_events_chan, peer_events) =
            mpsc::channel(PEER_EVENT_QUEUE_LEN);
        let (disk_alerts_chan, disk_alerts) = mpsc::unbounded_channel();

        let now = Instant::now();
        Self {
            id,
            info_hash,
            client_id,
            enable_dht,
            listen_port,
            picker: PiecePicker::new(piece_count, conf.warmup_piece_count),
            downloads: Downloads::new(
                conf.max_active_pieces,
                conf.max_buffered_bytes,
                conf.endgame_duplicate_requests,
            ),
            choker: Choker::new(
                conf.max_upload_slots,
                conf.optimistic_unchoke_rounds,
            ),
            conf,
            storage,
            piece_hashes,
            tracker_url,
            state: TorrentState::Allocating,
            error_message: None,
            paused: start_paused,
            peers: HashMap::new(),
            next_peer_key: 0,
            visit_order: VecDeque::new(),
            connected_addrs: HashSet::new(),
            banned_addrs: HashSet::new(),
            candidates: VecDeque::new(),
            reconnects: HashMap::new(),
            last_choke_round: None,
            counters: ThruputCounters::new(now),
            downloaded_base: 0,
            uploaded_base: 0,
            added_at: unix_ms(),
            completed_at: None,
            completions_since_persist: 0,
            cmd_port,
            peer_events,
            peer_events_chan,
            disk,
            disk_alerts,
            disk_alerts_chan,
            pending_disk_writes: 0,
            store,
            announce_sink,
            dht_sink,
            last_announce: None,
            max_frame_len,
        }
    }

    /// The torrent event loop. Returns when shut down.
    async fn run(&mut self) -> Result<()> {
        log::info!(
            "Starting torrent {} ({})",
            self.id,
            hex::encode(self.info_hash)
        );

        self.load_resume_state();
        self.disk.send(disk::Command::NewTorrent {
            id: self.id,
            storage_info: self.storage.clone(),
            piece_hashes: self.piece_hashes.clone(),
            alert_chan: self.disk_alerts_chan.clone(),
        })?;

        if !self.paused {
            self.emit_announce(AnnounceEvent::Started);
            self.emit_dht_lookup();
        }

        loop {
            let delay = self.next_tick_delay();
            tokio::select! {
                _ = sleep(delay) => {}
                cmd = self.cmd_port.recv() => match cmd {
                    Some(Command::Shutdown(ack)) => {
                        self.shutdown();
                        let _ = ack.send(());
                        return Ok(());
                    }
                    Some(cmd) => self.handle_command(cmd),
                    // the engine dropped us; treat as shutdown
                    None => {
                        self.shutdown();
                        return Ok(());
                    }
                },
                event = self.peer_events.recv() => {
                    if let Some((key, event)) = event {
                        self.handle_peer_event(key, event);
                    }
                }
                alert = self.disk_alerts.recv() => {
                    if let Some(alert) = alert {
                        self.handle_disk_alert(alert);
                    }
                }
            }
            self.tick();
        }
    }

    /// One pass of the scheduling loop: drain inputs, sweep timeouts,
    /// schedule requests, run choke maintenance on cadence, flush sockets.
    fn tick(&mut self) {
        let now = Instant::now();

        // ingest: remaining queued peer events, then decode every session's
        // buffered frames
        while let Ok((key, event)) = self.peer_events.try_recv() {
            self.handle_peer_event(key, event);
        }
        self.ingest(now);

        // the completion batch
        while let Ok(alert) = self.disk_alerts.try_recv() {
            self.handle_disk_alert(alert);
        }

        self.sweep_timeouts(now);

        if self.is_scheduling() {
            self.schedule(now);
        }

        let choke_due = self
            .last_choke_round
            .map(|at| now.duration_since(at) >= self.conf.choke_interval)
            .unwrap_or(true);
        if choke_due && self.is_scheduling() {
            self.run_choke_round(now);
            self.last_choke_round = Some(now);
        }

        self.announce_if_due(now);
        self.flush_and_reap(now);
        self.dial_candidates(now);
    }

    /// The delay hint for the next tick.
    fn next_tick_delay(&self) -> Duration {
        // a hasher/writer backlog paces the whole loop
        if self.pending_disk_writes > self.conf.disk_backlog_threshold {
            let scaled = self.conf.disk_backlog_delay_per_job
                * self.pending_disk_writes as u32;
            return scaled
                .min(self.conf.max_backlog_delay)
                .max(self.conf.min_tick_interval);
        }
        let has_work = self
            .peers
            .values()
            .any(|peer| !peer.recv_buf.is_empty())
            || !self.candidates.is_empty();
        if has_work {
            self.conf.min_tick_interval
        } else {
            self.conf.idle_tick_interval
        }
    }

    fn is_scheduling(&self) -> bool {
        !self.paused
            && matches!(
                self.state,
                TorrentState::Downloading | TorrentState::Seeding
            )
    }

    // ------------------------------------------------------------------
    // commands
    // ------------------------------------------------------------------

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::AddPeers(addrs) => {
                for addr in addrs {
                    self.add_candidate(addr);
                }
            }
            Command::InboundPeer {
                socket,
                leftover,
                handshake,
            } => self.accept_inbound(socket, leftover, handshake),
            Command::Pause => self.pause(),
            Command::Resume => self.resume(),
            Command::Recheck => self.start_recheck(),
            Command::SetFilePriorities(priorities) => {
                self.set_file_priorities(&priorities)
            }
            Command::Status(reply) => {
                let _ = reply.send(self.status());
            }
            Command::Shutdown(_) => unreachable!("handled by the run loop"),
        }
    }

    fn pause(&mut self) {
        if self.paused {
            return;
        }
        log::info!("Pausing torrent {}", self.id);
        self.paused = true;
        self.emit_announce(AnnounceEvent::Stopped);
        let keys: Vec<PeerKey> = self.peers.keys().copied().collect();
        for key in keys {
            self.close_peer(key, None);
        }
        self.persist_resume_state();
    }

    fn resume(&mut self) {
        if !self.paused {
            return;
        }
        log::info!("Resuming torrent {}", self.id);
        self.paused = false;
        self.emit_announce(AnnounceEvent::Started);
        self.emit_dht_lookup();
    }

    fn start_recheck(&mut self) {
        log::info!("Rechecking torrent {}", self.id);
        self.state = TorrentState::Checking;
        // in-assembly pieces are stale against a rebuilt ground truth
        let assembling: Vec<(PieceIndex, u32)> = self
            .downloads
            .assembling_pieces()
            .map(|index| (index, self.piece_len(index)))
            .collect();
        for (index, len) in assembling {
            self.downloads.abandon(index, len);
        }
        for peer in self.peers.values_mut() {
            peer.outstanding_requests.clear();
        }
        if self.disk.send(disk::Command::Recheck { id: self.id }).is_err() {
            self.enter_error("disk task unavailable");
        }
    }

    /// Applies per-file priorities: a piece is excluded from selection
    /// only when every file it intersects is priority 0.
    fn set_file_priorities(&mut self, priorities: &[u8]) {
        let file_count = self.storage.structure.files().len();
        let mut skipped = Bitfield::repeat(false, self.storage.piece_count);
        for index in 0..self.storage.piece_count {
            let files = match self.storage.files_intersecting_piece(index) {
                Ok(files) => files,
                Err(_) => continue,
            };
            let all_skipped = files.clone().all(|file| {
                file < file_count && priorities.get(file) == Some(&0)
            });
            if !files.is_empty() && all_skipped {
                skipped.set(index, true);
            }
        }
        log::info!(
            "Torrent {} skipping {} pieces by file priority",
            self.id,
            skipped.count_ones()
        );

        // in-flight pieces that became unwanted are dropped outright
        let now = Instant::now();
        let stale: Vec<PieceIndex> = self
            .downloads
            .assembling_pieces()
            .filter(|index| skipped[*index])
            .collect();
        for index in stale {
            let len = self.piece_len(index);
            self.downloads.abandon(index, len);
            for session in self.peers.values_mut() {
                let dropped: Vec<BlockInfo> = session
                    .outstanding_requests
                    .iter()
                    .filter(|b| b.piece_index == index)
                    .copied()
                    .collect();
                for block in dropped {
                    session.send(Message::Cancel(block), now);
                    session.remove_outstanding(&block);
                }
            }
        }
        self.picker.set_skipped(skipped);
    }

    fn status(&self) -> TorrentStatus {
        let wanted = self.picker.own_count() + self.picker.missing_count();
        let progress = if wanted == 0 {
            1.0
        } else {
            self.picker.own_count() as f64 / wanted as f64
        };
        let mut counters = self.counters.clone();
        let now = Instant::now();
        TorrentStatus {
            state: if self.paused && self.state != TorrentState::Errored {
                TorrentState::Paused
            } else {
                self.state
            },
            progress,
            download_rate: counters.down.rate(now),
            upload_rate: counters.up.rate(now),
            downloaded: self.downloaded_base + self.counters.down.total(),
            uploaded: self.uploaded_base + self.counters.up.total(),
            peer_count: self
                .peers
                .values()
                .filter(|p| p.is_ready())
                .count(),
            error_message: self.error_message.clone(),
        }
    }

    fn shutdown(&mut self) {
        log::info!("Shutting down torrent {}", self.id);
        self.emit_announce(AnnounceEvent::Stopped);
        self.persist_resume_state();
        // dropping the sessions drops their outbound channels, which makes
        // every driver task wind down
        self.peers.clear();
    }

    // ------------------------------------------------------------------
    // resume state
    // ------------------------------------------------------------------

    fn load_resume_state(&mut self) {
        let key = store::state_key(&self.info_hash);
        let stored = match self.store.get(&key) {
            Ok(Some(stored)) => stored,
            Ok(None) => return,
            Err(e) => {
                log::warn!("Failed to read resume state: {}", e);
                return;
            }
        };
        match ResumeState::decode(&stored) {
            Ok(resume) => {
                let bitfield = resume.bitfield(self.storage.piece_count);
                log::info!(
                    "Resuming torrent {} with {} verified pieces",
                    self.id,
                    bitfield.count_ones()
                );
                self.picker.restore(bitfield);
                self.downloaded_base = resume.downloaded;
                self.uploaded_base = resume.uploaded;
                self.added_at = resume.added_at;
                self.completed_at = resume.completed_at;
            }
            Err(e) => {
                log::warn!("Ignoring invalid resume state: {}", e);
            }
        }
    }

    fn persist_resume_state(&mut self) {
        self.completions_since_persist = 0;
        let resume = ResumeState {
            version: ResumeState::VERSION,
            bitfield: ByteBuf::from(
                self.picker.own_pieces().as_raw_slice().to_vec(),
            ),
            downloaded: self.downloaded_base + self.counters.down.total(),
            uploaded: self.uploaded_base + self.counters.up.total(),
            added_at: self.added_at,
            completed_at: self.completed_at,
        };
        let encoded = match resume.encode() {
            Ok(encoded) => encoded,
            Err(e) => {
                log::error!("Failed to encode resume state: {}", e);
                return;
            }
        };
        let key = store::state_key(&self.info_hash);
        if let Err(e) = self.store.set(&key, &encoded) {
            log::warn!("Failed to persist resume state: {}", e);
        }
    }

    // ------------------------------------------------------------------
    // peer lifecycle
    // ------------------------------------------------------------------

    fn add_candidate(&mut self, addr: SocketAddr) {
        if self.banned_addrs.contains(&addr)
            || self.connected_addrs.contains(&addr)
            || self.candidates.contains(&addr)
        {
            return;
        }
        self.candidates.push_back(addr);
    }

    /// Dials queued candidates up to the connection limit.
    fn dial_candidates(&mut self, now: Instant) {
        if !self.is_scheduling() {
            return;
        }
        // addresses whose backoff expired return to the queue
        let due: Vec<SocketAddr> = self
            .reconnects
            .iter()
            .filter(|(_, r)| r.next_attempt <= now)
            .map(|(addr, _)| *addr)
            .collect();
        for addr in due {
            self.add_candidate(addr);
        }

        while self.connected_addrs.len()
            < self.conf.max_connected_peer_count
        {
            let addr = match self.candidates.pop_front() {
                Some(addr) => addr,
                None => break,
            };
            if self.connected_addrs.contains(&addr)
                || self.banned_addrs.contains(&addr)
            {
                continue;
            }
            self.spawn_outbound(addr, now);
        }
    }

    fn spawn_outbound(&mut self, addr: SocketAddr, now: Instant) {
        let key = self.next_peer_key;
        self.next_peer_key += 1;

        let (outbound_chan, outbound_port) = mpsc::unbounded_channel();
        let session = PeerSession::new(
            addr,
            Direction::Outbound,
            outbound_chan,
            now,
            self.conf.min_request_pipeline_len,
        );
        self.peers.insert(key, session);
        self.visit_order.push_back(key);
        self.connected_addrs.insert(addr);

        let handshake =
            Handshake::new(self.info_hash, self.client_id, self.enable_dht);
        tokio::spawn(io::run_outbound(
            key,
            addr,
            handshake,
            self.conf.handshake_timeout,
            self.peer_events_chan.clone(),
            outbound_port,
        ));
    }

    fn accept_inbound(
        &mut self,
        socket: TcpStream,
        leftover: Bytes,
        handshake: Handshake,
    ) {
        let addr = match socket.peer_addr() {
            Ok(addr) => addr,
            Err(e) => {
                log::debug!("Inbound peer lost before adoption: {}", e);
                return;
            }
        };
        if self.banned_addrs.contains(&addr)
            || self.peers.len() >= self.conf.max_connected_peer_count
            || self.paused
        {
            log::debug!("Rejecting inbound peer {}", addr);
            return;
        }

        let key = self.next_peer_key;
        self.next_peer_key += 1;
        let now = Instant::now();
        let (outbound_chan, outbound_port) = mpsc::unbounded_channel();
        let mut session = PeerSession::new(
            addr,
            Direction::Inbound,
            outbound_chan,
            now,
            self.conf.min_request_pipeline_len,
        );
        session.on_handshake(&handshake);
        log::info!("Adopted inbound peer {}", addr);

        queue_post_handshake(&self.picker, &mut session, now);
        self.peers.insert(key, session);
        self.visit_order.push_back(key);
        self.connected_addrs.insert(addr);

        tokio::spawn(io::run_connected(
            key,
            socket,
            leftover,
            self.peer_events_chan.clone(),
            outbound_port,
        ));
    }

    fn handle_peer_event(&mut self, key: PeerKey, event: PeerEvent) {
        let now = Instant::now();
        match event {
            PeerEvent::Connected => {
                if let Some(session) = self.peers.get_mut(&key) {
                    session.state = PeerState::Handshaking;
                }
            }
            PeerEvent::HandshakeDone(handshake) => {
                let Self {
                    peers,
                    picker,
                    reconnects,
                    ..
                } = self;
                if let Some(session) = peers.get_mut(&key) {
                    session.on_handshake(&handshake);
                    session.last_incoming = now;
                    log::info!(
                        "Peer {} handshake complete (id {})",
                        session.addr,
                        session
                            .peer_id
                            .map(hex::encode)
                            .unwrap_or_default()
                    );
                    // a fresh session wipes any failure streak
                    reconnects.remove(&session.addr);
                    queue_post_handshake(picker, session, now);
                }
            }
            PeerEvent::Data(chunk) => {
                if let Some(session) = self.peers.get_mut(&key) {
                    session.last_incoming = now;
                    session.recv_buf.push(chunk);
                }
            }
            PeerEvent::Closed(error) => {
                if self.peers.contains_key(&key) {
                    self.close_peer(key, error);
                }
            }
        }
    }

    /// Decodes and dispatches every complete frame buffered in every
    /// session.
    fn ingest(&mut self, now: Instant) {
        let keys: Vec<PeerKey> = self.visit_order.iter().copied().collect();
        for key in keys {
            loop {
                let decoded = {
                    let session = match self.peers.get_mut(&key) {
                        Some(session) => session,
                        None => break,
                    };
                    if !session.is_ready() {
                        break;
                    }
                    match decode_message(
                        &mut session.recv_buf,
                        self.max_frame_len,
                    ) {
                        Ok(Some(decoded)) => decoded,
                        Ok(None) => break,
                        Err(e) => {
                            self.close_peer(key, Some(e));
                            break;
                        }
                    }
                };
                let result = match decoded {
                    Decoded::Piece(header) => {
                        self.handle_piece(key, header, now)
                    }
                    Decoded::Message(msg) => self.handle_msg(key, msg, now),
                };
                if let Err(e) = result {
                    self.close_peer(key, Some(e));
                    break;
                }
            }
        }
    }

    /// Applies a control message to the session and torrent state.
    fn handle_msg(
        &mut self,
        key: PeerKey,
        msg: Message,
        now: Instant,
    ) -> Result<()> {
        let piece_count = self.storage.piece_count;
        let session = self
            .peers
            .get_mut(&key)
            .expect("ingest checked the session");
        log::trace!("Peer {} sent {:?}", session.addr, msg);

        match msg {
            Message::KeepAlive => {}
            Message::Choke => {
                if !session.peer_choking {
                    log::debug!("Peer {} choked us", session.addr);
                    session.peer_choking = true;
                    // in-flight data is treated as lost; the blocks return
                    // to the pool for other peers to pick up
                    session.outstanding_requests.clear();
                    self.downloads.release_peer(key);
                }
            }
            Message::Unchoke => {
                if session.peer_choking {
                    log::debug!("Peer {} unchoked us", session.addr);
                    session.peer_choking = false;
                }
            }
            Message::Interested => {
                session.peer_interested = true;
            }
            Message::NotInterested => {
                session.peer_interested = false;
            }
            Message::Have { piece_index } => {
                if piece_index >= piece_count {
                    return Err(Error::ProtocolViolation(
                        "have index out of bounds",
                    ));
                }
                let pieces = session.pieces_mut(piece_count);
                if !pieces[piece_index] {
                    pieces.set(piece_index, true);
                    let wanted = self.picker.register_have(piece_index);
                    if wanted {
                        self.update_interest(key, now);
                    }
                }
            }
            Message::Bitfield(mut bitfield) => {
                // the wire bitfield is padded to a byte boundary; it must
                // be exactly the expected number of bytes
                if bitfield.len() / 8 != (piece_count + 7) / 8 {
                    return Err(Error::ProtocolViolation(
                        "bitfield length mismatch",
                    ));
                }
                bitfield.resize(piece_count, false);
                if let Some(old) = session.pieces.take() {
                    self.picker.unregister_peer_pieces(&old);
                }
                self.picker.register_peer_pieces(&bitfield);
                let session = self
                    .peers
                    .get_mut(&key)
                    .expect("session still present");
                session.pieces = Some(bitfield);
                self.update_interest(key, now);
            }
            Message::HaveAll => {
                if !session.supports_fast {
                    return Err(Error::ProtocolViolation(
                        "have-all without fast extension",
                    ));
                }
                let bitfield = Bitfield::repeat(true, piece_count);
                if let Some(old) = session.pieces.take() {
                    self.picker.unregister_peer_pieces(&old);
                }
                self.picker.register_peer_pieces(&bitfield);
                let session = self
                    .peers
                    .get_mut(&key)
                    .expect("session still present");
                session.pieces = Some(bitfield);
                self.update_interest(key, now);
            }
            Message::HaveNone => {
                if !session.supports_fast {
                    return Err(Error::ProtocolViolation(
                        "have-none without fast extension",
                    ));
                }
                if let Some(old) = session.pieces.take() {
                    self.picker.unregister_peer_pieces(&old);
                }
                session.pieces =
                    Some(Bitfield::repeat(false, piece_count));
            }
            Message::Request(block) => {
                self.handle_request(key, block, now);
            }
            Message::Cancel(block) => {
                session.pending_uploads.retain(|b| *b != block);
            }
            Message::Extended { id, payload } => {
                // BEP 10 shape is honored; we run no extension logic yet
                log::debug!(
                    "Peer {} extended message {} ({} bytes)",
                    session.addr,
                    id,
                    payload.len()
                );
            }
            Message::Block { .. } => {
                unreachable!("piece frames take the zero-copy path")
            }
        }
        Ok(())
    }

    /// Lands a PIECE frame: one copy from the receive buffer into the
    /// active piece buffer, then the commit bookkeeping.
    fn handle_piece(
        &mut self,
        key: PeerKey,
        header: PieceHeader,
        now: Instant,
    ) -> Result<()> {
        let PieceHeader {
            piece_index,
            offset,
            data_len,
        } = header;
        let min_pipeline = self.conf.min_request_pipeline_len;
        let max_pipeline = self.conf.max_request_pipeline_len;

        let accepted = {
            // split borrows: the receive buffer is the copy source, the
            // active piece buffer the destination
            let Self {
                peers, downloads, ..
            } = self;
            let session = peers
                .get_mut(&key)
                .expect("ingest checked the session");
            let accepted = match downloads.destination_for(
                piece_index,
                offset,
                data_len,
            ) {
                Some(dest) => {
                    session.recv_buf.copy_to(dest, PIECE_HEADER_LEN);
                    true
                }
                None => {
                    log::debug!(
                        "Peer {} sent unwanted block (piece {} offset {})",
                        session.addr,
                        piece_index,
                        offset
                    );
                    false
                }
            };
            session.recv_buf.discard(header.frame_len());

            session.last_payload_received = now;
            session.counters.down.record(now, data_len as u64);
            session.remove_outstanding(&BlockInfo {
                piece_index,
                offset,
                len: data_len,
            });
            session.adapt_pipeline(now, min_pipeline, max_pipeline);
            accepted
        };
        self.counters.down.record(now, data_len as u64);

        if !accepted {
            return Ok(());
        }

        let commit = self
            .downloads
            .commit_block(piece_index, offset, key)
            .expect("destination_for accepted the block");

        // endgame losers get a CANCEL for the block that just arrived
        let block = BlockInfo {
            piece_index,
            offset,
            len: data_len,
        };
        for loser in commit.cancel {
            if let Some(peer) = self.peers.get_mut(&loser) {
                peer.send(Message::Cancel(block), now);
                peer.remove_outstanding(&block);
            }
        }

        if commit.piece_complete {
            self.submit_piece(piece_index);
        }
        Ok(())
    }

    /// Hands a fully received piece to the disk task.
    fn submit_piece(&mut self, piece_index: PieceIndex) {
        log::debug!("Piece {} fully received, queueing write", piece_index);
        let (data, _contributors) = self
            .downloads
            .take_complete(piece_index)
            .expect("commit said the piece completed");
        self.pending_disk_writes += 1;
        if self
            .disk
            .send(disk::Command::WritePiece {
                id: self.id,
                piece_index,
                data,
            })
            .is_err()
        {
            self.enter_error("disk task unavailable");
        }
    }

    /// Admits or ignores an upload request per the choke state.
    fn handle_request(
        &mut self,
        key: PeerKey,
        block: BlockInfo,
        _now: Instant,
    ) {
        let servable = block.piece_index < self.storage.piece_count
            && block.len > 0
            && block.len <= crate::BLOCK_LEN
            && self
                .storage
                .piece_len(block.piece_index)
                .map(|len| block.offset + block.len <= len)
                .unwrap_or(false)
            && self.picker.have_piece(block.piece_index);
        let session = self
            .peers
            .get_mut(&key)
            .expect("ingest checked the session");
        if session.am_choking {
            log::debug!(
                "Ignoring request from choked peer {}",
                session.addr
            );
            return;
        }
        if !servable {
            log::debug!(
                "Ignoring request for data we don't serve: {}",
                block
            );
            return;
        }
        if session.pending_uploads.contains(&block) {
            return;
        }
        session.pending_uploads.push(block);
        if self
            .disk
            .send(disk::Command::ReadBlock {
                id: self.id,
                block_info: block,
            })
            .is_err()
        {
            self.enter_error("disk task unavailable");
        }
    }

    /// Recomputes our interest in a peer and sends the transition message
    /// if it changed.
    fn update_interest(&mut self, key: PeerKey, now: Instant) {
        let session = match self.peers.get_mut(&key) {
            Some(session) => session,
            None => return,
        };
        let interested = match &session.pieces {
            Some(pieces) => self.picker.needs_any_of(pieces),
            None => false,
        };
        if interested != session.am_interested {
            session.am_interested = interested;
            if interested {
                log::debug!("Interested in peer {}", session.addr);
                session.send(Message::Interested, now);
            } else {
                log::debug!("No longer interested in peer {}", session.addr);
                session.send(Message::NotInterested, now);
            }
        }
    }

    fn close_peer(&mut self, key: PeerKey, error: Option<Error>) {
        let mut session = match self.peers.remove(&key) {
            Some(session) => session,
            None => return,
        };
        session.state = PeerState::Closed;
        match &error {
            Some(e) => {
                log::info!("Closing peer {}: {}", session.addr, e)
            }
            None => log::info!("Peer {} disconnected", session.addr),
        }

        self.visit_order.retain(|k| *k != key);
        self.connected_addrs.remove(&session.addr);
        self.downloads.release_peer(key);
        if let Some(pieces) = session.pieces.take() {
            self.picker.unregister_peer_pieces(&pieces);
        }

        // protocol violations and bad data ban the address for the
        // session; transient failures earn a backoff and a retry
        match error {
            Some(
                Error::ProtocolViolation(_)
                | Error::InvalidPeerInfoHash,
            ) => {
                self.banned_addrs.insert(session.addr);
            }
            Some(Error::Io(_) | Error::HandshakeTimeout | Error::PeerIdle)
                if session.direction == Direction::Outbound =>
            {
                let entry = self
                    .reconnects
                    .entry(session.addr)
                    .or_insert(ReconnectState {
                        attempts: 0,
                        next_attempt: Instant::now(),
                    });
                entry.attempts += 1;
                if entry.attempts > MAX_RECONNECT_ATTEMPTS {
                    self.reconnects.remove(&session.addr);
                } else {
                    let jitter = rand::thread_rng()
                        .gen_range(0..=RECONNECT_JITTER_SECS);
                    entry.next_attempt = Instant::now()
                        + RECONNECT_BACKOFF
                        + Duration::from_secs(jitter);
                }
            }
            _ => {}
        }
    }

    // ------------------------------------------------------------------
    // timeouts and scheduling
    // ------------------------------------------------------------------

    fn sweep_timeouts(&mut self, now: Instant) {
        // stale block reservations become requestable again; the owners
        // accrue stall strikes
        for (block, owners) in self
            .downloads
            .sweep_timeouts(now, self.conf.request_timeout)
        {
            for owner in owners {
                if let Some(session) = self.peers.get_mut(&owner) {
                    session.stall_strikes += 1;
                    log::debug!(
                        "Request {} to peer {} timed out ({} strikes)",
                        block,
                        session.addr,
                        session.stall_strikes
                    );
                    session.remove_outstanding(&block);
                }
            }
        }

        // idle and keepalive handling
        let mut to_close = Vec::new();
        for (key, session) in self.peers.iter_mut() {
            if !session.is_ready() {
                continue;
            }
            if now.duration_since(session.last_incoming)
                > self.conf.idle_timeout
            {
                to_close.push(*key);
                continue;
            }
            if now.duration_since(session.last_outgoing)
                > self.conf.keep_alive_interval
            {
                session.send(Message::KeepAlive, now);
            }
        }
        for key in to_close {
            self.close_peer(key, Some(Error::PeerIdle));
        }
    }

    /// Phase A and Phase B of request scheduling, then pipeline emission.
    fn schedule(&mut self, now: Instant) {
        self.update_endgame();

        let keys: Vec<PeerKey> = self.visit_order.iter().copied().collect();
        for key in keys {
            self.update_interest(key, now);
            self.schedule_peer(key, now);
        }
        // rotate so the next tick starts with a different peer
        if let Some(first) = self.visit_order.pop_front() {
            self.visit_order.push_back(first);
        }
    }

    fn update_endgame(&mut self) {
        let missing = self.picker.missing_count();
        let total = self.picker.piece_count().max(1);
        let endgame = missing > 0
            && (missing as f64 / total as f64
                <= self.conf.endgame_threshold
                || missing == self.downloads.active_count());
        self.downloads.set_endgame(endgame);
    }

    fn schedule_peer(&mut self, key: PeerKey, now: Instant) {
        // the admission gate
        let (mut capacity, peer_pieces) = {
            let session = match self.peers.get(&key) {
                Some(session) => session,
                None => return,
            };
            if !session.is_ready()
                || session.peer_choking
                || !session.am_interested
            {
                return;
            }
            let capacity = session.request_capacity();
            if capacity == 0 {
                return;
            }
            match &session.pieces {
                Some(pieces) => (capacity, pieces.clone()),
                None => return,
            }
        };

        let mut requests: Vec<BlockInfo> = Vec::new();

        // Phase A: drain active pieces the peer can serve, rarest first so
        // scarce pieces finish soonest
        let mut active: Vec<PieceIndex> = self
            .downloads
            .assembling_pieces()
            .filter(|index| peer_pieces[*index])
            .collect();
        active.sort_by_key(|index| self.picker.availability_of(*index));
        for index in active {
            while capacity > 0 {
                match self.downloads.next_block(index, key, now) {
                    Some(block) => {
                        requests.push(block);
                        capacity -= 1;
                    }
                    None => break,
                }
            }
            if capacity == 0 {
                break;
            }
        }

        // Phase B: promote new pieces while the pipeline has room and the
        // backpressure caps allow
        while capacity > 0 {
            if self.pending_disk_writes >= self.conf.max_pending_disk_writes
            {
                break;
            }
            let blocks_per_piece =
                crate::block_count(self.storage.piece_len);
            let max_partials = self.conf.max_partial_pieces(
                self.connected_addrs.len(),
                blocks_per_piece,
            );
            let downloads = &self.downloads;
            let picked = self.picker.pick_piece(&peer_pieces, |index| {
                downloads.is_active(index)
            });
            let index = match picked {
                Some(index) => index,
                None => break,
            };
            let len = self.piece_len(index);
            if !self.downloads.can_start_piece(len, max_partials) {
                break;
            }
            self.downloads.start_piece(index, len);
            while capacity > 0 {
                match self.downloads.next_block(index, key, now) {
                    Some(block) => {
                        requests.push(block);
                        capacity -= 1;
                    }
                    None => break,
                }
            }
        }

        if requests.is_empty() {
            return;
        }
        let session = self
            .peers
            .get_mut(&key)
            .expect("session gated above");
        log::debug!(
            "Requesting {} blocks from peer {}",
            requests.len(),
            session.addr
        );
        for block in requests {
            session.outstanding_requests.push(block);
            session.send(Message::Request(block), now);
        }
    }

    fn run_choke_round(&mut self, now: Instant) {
        let seeding = self.state == TorrentState::Seeding;
        let snub_timeout = self.conf.snub_timeout;
        let candidates: Vec<Candidate> = self
            .peers
            .iter_mut()
            .filter(|(_, session)| session.is_ready())
            .map(|(key, session)| Candidate {
                key: *key,
                peer_interested: session.peer_interested,
                am_choking: session.am_choking,
                rate: if seeding {
                    session.counters.up.rate(now)
                } else {
                    session.counters.down.rate(now)
                },
                snubbed: session.is_snubbed(now, snub_timeout),
            })
            .collect();

        let decisions = self.choker.run_round(&candidates);
        for key in decisions.unchoke {
            if let Some(session) = self.peers.get_mut(&key) {
                log::debug!("Unchoking peer {}", session.addr);
                session.am_choking = false;
                session.unchoked_at = Some(now);
                session.send(Message::Unchoke, now);
            }
        }
        for key in decisions.choke {
            if let Some(session) = self.peers.get_mut(&key) {
                log::debug!("Choking peer {}", session.addr);
                session.am_choking = true;
                session.unchoked_at = None;
                // any admitted upload requests die with the slot
                session.pending_uploads.clear();
                session.send(Message::Choke, now);
            }
        }
    }

    // ------------------------------------------------------------------
    // disk alerts
    // ------------------------------------------------------------------

    fn handle_disk_alert(&mut self, alert: disk::Alert) {
        match alert {
            disk::Alert::Allocated(Ok(())) => {
                if self.state == TorrentState::Allocating {
                    self.state = if self.picker.is_complete() {
                        TorrentState::Seeding
                    } else {
                        TorrentState::Downloading
                    };
                    log::info!(
                        "Torrent {} allocated, now {:?}",
                        self.id,
                        self.state
                    );
                }
            }
            disk::Alert::Allocated(Err(e)) => {
                log::error!("Torrent {} allocation failed: {}", self.id, e);
                self.enter_error(format!("allocation failed: {}", e));
            }
            disk::Alert::PieceWritten {
                piece_index,
                result,
            } => self.handle_piece_written(piece_index, result),
            disk::Alert::BlockRead(block) => self.serve_block(block),
            disk::Alert::ReadFailed { block_info, error } => {
                log::warn!("Read of {} failed: {}", block_info, error);
                for session in self.peers.values_mut() {
                    session.pending_uploads.retain(|b| *b != block_info);
                }
            }
            disk::Alert::RecheckDone(bitfield) => {
                log::info!(
                    "Torrent {} recheck done: {}/{} pieces",
                    self.id,
                    bitfield.count_ones(),
                    bitfield.len()
                );
                self.picker.restore(bitfield);
                self.state = if self.picker.is_complete() {
                    TorrentState::Seeding
                } else {
                    TorrentState::Downloading
                };
                self.persist_resume_state();
            }
        }
    }

    fn handle_piece_written(
        &mut self,
        piece_index: PieceIndex,
        result: disk::WriteResult,
    ) {
        self.pending_disk_writes =
            self.pending_disk_writes.saturating_sub(1);
        let len = self.piece_len(piece_index);
        let now = Instant::now();

        match result {
            disk::WriteResult::Success { bytes } => {
                log::debug!(
                    "Piece {} verified and written ({} bytes)",
                    piece_index,
                    bytes
                );
                self.downloads.finish_write(piece_index, len);
                self.picker.received_piece(piece_index);

                // the bit is set: everyone learns, late requests die
                let keys: Vec<PeerKey> =
                    self.peers.keys().copied().collect();
                for key in keys {
                    let session = self
                        .peers
                        .get_mut(&key)
                        .expect("key just collected");
                    if !session.is_ready() {
                        continue;
                    }
                    let stale: Vec<BlockInfo> = session
                        .outstanding_requests
                        .iter()
                        .filter(|b| b.piece_index == piece_index)
                        .copied()
                        .collect();
                    for block in stale {
                        session.send(Message::Cancel(block), now);
                        session.remove_outstanding(&block);
                    }
                    session.send(
                        Message::Have { piece_index },
                        now,
                    );
                    self.update_interest(key, now);
                }

                self.completions_since_persist += 1;
                if self.completions_since_persist
                    >= self.conf.resume_persist_interval
                {
                    self.persist_resume_state();
                }

                if self.picker.is_complete()
                    && self.state == TorrentState::Downloading
                {
                    log::info!("Torrent {} download complete", self.id);
                    self.completed_at = Some(unix_ms());
                    self.state = TorrentState::Seeding;
                    self.persist_resume_state();
                    self.emit_announce(AnnounceEvent::Completed);
                    self.emit_dht_announce();
                }
            }
            disk::WriteResult::HashMismatch => {
                log::warn!("Piece {} failed verification", piece_index);
                let contributors =
                    self.downloads.abandon(piece_index, len);
                for key in contributors {
                    let drop_peer = match self.peers.get_mut(&key) {
                        Some(session) => {
                            session.failed_piece_contributions += 1;
                            log::warn!(
                                "Peer {} contributed to a bad piece ({} so far)",
                                session.addr,
                                session.failed_piece_contributions
                            );
                            session.failed_piece_contributions
                                >= self.conf.max_failed_piece_contributions
                        }
                        None => false,
                    };
                    if drop_peer {
                        if let Some(session) = self.peers.get(&key) {
                            self.banned_addrs.insert(session.addr);
                        }
                        self.close_peer(
                            key,
                            Some(Error::ProtocolViolation(
                                "too many bad piece contributions",
                            )),
                        );
                    }
                }
            }
            disk::WriteResult::InvalidArgs => {
                log::error!(
                    "Disk rejected piece {} write as invalid",
                    piece_index
                );
                self.downloads.abandon(piece_index, len);
            }
            disk::WriteResult::Io(e) => {
                log::error!(
                    "Disk write of piece {} failed: {}",
                    piece_index,
                    e
                );
                self.downloads.abandon(piece_index, len);
                self.enter_error(format!("disk write failed: {}", e));
            }
        }
    }

    /// Sends a read-back block to every peer that still wants it.
    fn serve_block(&mut self, block: crate::Block) {
        let info = block.info();
        let now = Instant::now();
        let mut served: u64 = 0;
        for session in self.peers.values_mut() {
            if !session.is_ready() || session.am_choking {
                continue;
            }
            if let Some(pos) =
                session.pending_uploads.iter().position(|b| *b == info)
            {
                session.pending_uploads.remove(pos);
                session.send(
                    Message::Block {
                        info,
                        data: block.data.clone(),
                    },
                    now,
                );
                session.counters.up.record(now, info.len as u64);
                served += 1;
            }
        }
        if served > 0 {
            self.counters
                .up
                .record(now, served * info.len as u64);
        }
    }

    fn enter_error(&mut self, message: impl Into<String>) {
        let message = message.into();
        log::error!("Torrent {} errored: {}", self.id, message);
        self.error_message = Some(message);
        self.state = TorrentState::Errored;
        self.persist_resume_state();
    }

    // ------------------------------------------------------------------
    // emit
    // ------------------------------------------------------------------

    fn flush_and_reap(&mut self, _now: Instant) {
        let mut dead = Vec::new();
        for (key, session) in self.peers.iter_mut() {
            if !session.flush() {
                dead.push(*key);
            }
        }
        for key in dead {
            self.close_peer(key, Some(Error::Channel));
        }
    }

    fn announce_if_due(&mut self, now: Instant) {
        if !self.is_scheduling() {
            return;
        }
        let due = self
            .last_announce
            .map(|at| {
                now.duration_since(at) >= self.conf.announce_interval
            })
            .unwrap_or(true);
        if due {
            self.emit_announce(AnnounceEvent::None);
        }
    }

    fn emit_announce(&mut self, event: AnnounceEvent) {
        self.last_announce = Some(Instant::now());
        let sink = match &self.announce_sink {
            Some(sink) => sink,
            None => return,
        };
        let downloaded = self.downloaded_base + self.counters.down.total();
        let uploaded = self.uploaded_base + self.counters.up.total();
        let left = self
            .storage
            .download_len
            .saturating_sub(
                self.picker.own_count() as u64
                    * self.storage.piece_len as u64,
            );
        let num_want = self
            .conf
            .max_connected_peer_count
            .saturating_sub(self.connected_addrs.len())
            .max(self.conf.min_requested_peer_count);
        let _ = sink.send(Announce {
            info_hash: self.info_hash,
            event,
            downloaded,
            uploaded,
            left,
            num_want,
            tracker_url: self.tracker_url.clone(),
        });
    }

    fn emit_dht_lookup(&self) {
        if let Some(sink) = &self.dht_sink {
            let _ = sink.send(DhtRequest::Lookup(self.info_hash));
        }
    }

    fn emit_dht_announce(&self) {
        if let Some(sink) = &self.dht_sink {
            let _ = sink
                .send(DhtRequest::Announce(self.info_hash, self.listen_port));
        }
    }

    fn piece_len(&self, index: PieceIndex) -> u32 {
        self.storage
            .piece_len(index)
            .expect("piece index verified by caller")
    }
}

/// Queues what we send every peer right after the handshake: our piece
/// availability, and an extended handshake when supported.
fn queue_post_handshake(
    picker: &PiecePicker,
    session: &mut PeerSession,
    now: Instant,
) {
    if session.supports_extended {
        // minimal BEP 10 handshake: we advertise no extensions yet but
        // honor the channel's shape
        session.send(
            Message::Extended {
                id: 0,
                payload: Bytes::from_static(b"d1:mdee"),
            },
            now,
        );
    }
    let own = picker.own_pieces();
    if picker.is_complete() && session.supports_fast {
        session.send(Message::HaveAll, now);
    } else if own.count_ones() > 0 {
        session.send(Message::Bitfield(own.clone()), now);
    } else if session.supports_fast {
        session.send(Message::HaveNone, now);
    }
}

fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
