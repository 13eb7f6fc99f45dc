//! Per-peer connection state.
//!
//! A [`PeerSession`] is pure state owned by the torrent task; no I/O
//! happens here. The socket lives on a driver task (see [`io`]) that feeds
//! raw receive chunks into the session's [`ChunkedBuffer`] and drains the
//! frames the session queues for sending. All protocol decisions are made
//! by the torrent task against this state, which is what keeps the wire
//! state machines single threaded.

pub(crate) mod codec;
pub(crate) mod io;

use std::{net::SocketAddr, time::Instant};

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc::UnboundedSender;

use crate::{
    chunked_buf::ChunkedBuffer, counter::ThruputCounters, Bitfield,
    BlockInfo, PeerId,
};

use codec::{Handshake, Message};

/// At any given time, a connection with a peer is in one of the below
/// states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum State {
    /// The TCP connection is being established.
    Connecting,
    /// The connection is up and handshakes are being exchanged.
    Handshaking,
    /// The normal state of a session; all messages may be exchanged.
    Ready,
    /// The session is defunct and will be reaped at the end of the tick.
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Direction {
    Outbound,
    Inbound,
}

pub(crate) struct PeerSession {
    /// The remote address of the peer.
    pub addr: SocketAddr,
    pub direction: Direction,
    pub state: State,
    /// The peer's 20 byte id, learned from its handshake.
    pub peer_id: Option<PeerId>,
    /// Capabilities from the peer's handshake reserved bits.
    pub supports_extended: bool,
    pub supports_fast: bool,
    /// Our side of the standard four flags. Both sides start choked and
    /// uninterested.
    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,
    /// The pieces the peer claims to have. `None` until the peer announces
    /// availability; a leech that never does is simply never interesting.
    pub pieces: Option<Bitfield>,
    /// The receive buffer the driver task's chunks are pushed into.
    pub recv_buf: ChunkedBuffer,
    /// Requests we have sent to the peer and not yet seen answered,
    /// cancelled or timed out, in send order.
    pub outstanding_requests: Vec<BlockInfo>,
    /// The current pipeline target. At least the configured minimum, grows
    /// with observed throughput so a fast link stays saturated.
    pub pipeline_limit: usize,
    /// REQUESTs from the peer we have admitted but whose disk reads haven't
    /// completed yet.
    pub pending_uploads: Vec<BlockInfo>,
    /// Payload byte counters in both directions, 5 second window.
    pub counters: ThruputCounters,
    /// When any message was last received from the peer.
    pub last_incoming: Instant,
    /// When any message was last queued for the peer.
    pub last_outgoing: Instant,
    /// When piece payload last arrived from the peer, for snub detection.
    pub last_payload_received: Instant,
    /// When we last unchoked the peer, for snub detection.
    pub unchoked_at: Option<Instant>,
    /// How many hash-failed pieces this peer contributed blocks to.
    pub failed_piece_contributions: usize,
    /// How many of this peer's requests the timeout sweep has reclaimed.
    pub stall_strikes: usize,
    /// Frames queued during the tick, flushed to the driver at its end.
    out_buf: BytesMut,
    /// The channel to the driver task's writer half.
    outbound: UnboundedSender<Bytes>,
}

impl PeerSession {
    pub fn new(
        addr: SocketAddr,
        direction: Direction,
        outbound: UnboundedSender<Bytes>,
        now: Instant,
        min_pipeline: usize,
    ) -> Self {
        Self {
            addr,
            direction,
            state: State::Connecting,
            peer_id: None,
            supports_extended: false,
            supports_fast: false,
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            pieces: None,
            recv_buf: ChunkedBuffer::new(),
            outstanding_requests: Vec::new(),
            pipeline_limit: min_pipeline,
            pending_uploads: Vec::new(),
            counters: ThruputCounters::new(now),
            last_incoming: now,
            last_outgoing: now,
            last_payload_received: now,
            unchoked_at: None,
            failed_piece_contributions: 0,
            stall_strikes: 0,
            out_buf: BytesMut::new(),
            outbound,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state == State::Ready
    }

    /// Applies the peer's handshake and moves the session to `Ready`.
    pub fn on_handshake(&mut self, handshake: &Handshake) {
        self.peer_id = Some(handshake.peer_id);
        self.supports_extended = handshake.supports_extended();
        self.supports_fast = handshake.supports_fast();
        self.state = State::Ready;
    }

    /// Queues a message for the peer. Frames accumulate in the session's
    /// out buffer and leave for the socket in one flush at the end of the
    /// tick.
    pub fn send(&mut self, msg: Message, now: Instant) {
        log::trace!("Queueing {:?} for peer {}", msg, self.addr);
        msg.encode(&mut self.out_buf);
        self.last_outgoing = now;
    }

    /// Hands the queued frames to the driver task. Returns false if the
    /// driver is gone, in which case the session is defunct.
    pub fn flush(&mut self) -> bool {
        if self.out_buf.is_empty() {
            return true;
        }
        let frames = self.out_buf.split().freeze();
        self.outbound.send(frames).is_ok()
    }

    /// Lazily initializes the peer's piece set, as a HAVE may arrive before
    /// any bitfield.
    pub fn pieces_mut(&mut self, piece_count: usize) -> &mut Bitfield {
        self.pieces
            .get_or_insert_with(|| Bitfield::repeat(false, piece_count))
    }

    /// Room left in the request pipeline.
    pub fn request_capacity(&self) -> usize {
        self.pipeline_limit
            .saturating_sub(self.outstanding_requests.len())
    }

    /// Recomputes the pipeline target from the observed download rate:
    /// roughly two seconds' worth of blocks, clamped to the configured
    /// bounds.
    pub fn adapt_pipeline(
        &mut self,
        now: Instant,
        min: usize,
        max: usize,
    ) {
        let rate = self.counters.down.rate(now);
        let by_rate = (2 * rate / crate::BLOCK_LEN as u64) as usize;
        self.pipeline_limit = by_rate.clamp(min, max);
    }

    /// Removes a request from the outstanding set, returning true if it was
    /// there.
    pub fn remove_outstanding(&mut self, block: &BlockInfo) -> bool {
        if let Some(pos) =
            self.outstanding_requests.iter().position(|b| b == block)
        {
            self.outstanding_requests.remove(pos);
            true
        } else {
            false
        }
    }

    /// True if the peer holds an upload slot but hasn't sent payload for
    /// the snub window.
    pub fn is_snubbed(
        &self,
        now: Instant,
        snub_timeout: std::time::Duration,
    ) -> bool {
        match self.unchoked_at {
            Some(unchoked_at) => {
                let silent_since =
                    self.last_payload_received.max(unchoked_at);
                now.duration_since(silent_since) > snub_timeout
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;
    use crate::BLOCK_LEN;

    fn session() -> (PeerSession, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = PeerSession::new(
            "127.0.0.1:51413".parse().unwrap(),
            Direction::Outbound,
            tx,
            Instant::now(),
            10,
        );
        (session, rx)
    }

    #[test]
    fn test_initial_flags() {
        let (session, _rx) = session();
        assert!(session.am_choking);
        assert!(session.peer_choking);
        assert!(!session.am_interested);
        assert!(!session.peer_interested);
        assert_eq!(session.state, State::Connecting);
    }

    #[test]
    fn test_send_batches_until_flush() {
        let (mut session, mut rx) = session();
        let now = Instant::now();
        session.send(Message::Interested, now);
        session.send(Message::Have { piece_index: 3 }, now);
        // nothing leaves before the flush
        assert!(rx.try_recv().is_err());

        assert!(session.flush());
        let frames = rx.try_recv().unwrap();
        // interested frame (5 bytes) followed by have frame (9 bytes)
        assert_eq!(frames.len(), 5 + 9);
        assert_eq!(&frames[..5], &[0, 0, 0, 1, 2]);

        // an empty flush sends nothing
        assert!(session.flush());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_pipeline_adaptation() {
        let (mut session, _rx) = session();
        let now = Instant::now();
        // no throughput: pinned at the minimum
        session.adapt_pipeline(now, 10, 500);
        assert_eq!(session.pipeline_limit, 10);

        // 8 MiB/s: two seconds' worth is 1024 blocks, clamped to the max
        session
            .counters
            .down
            .record(now, 5 * 8 * 1024 * 1024);
        session.adapt_pipeline(now, 10, 500);
        assert_eq!(session.pipeline_limit, 500);
    }

    #[test]
    fn test_request_capacity() {
        let (mut session, _rx) = session();
        assert_eq!(session.request_capacity(), 10);
        let block = BlockInfo {
            piece_index: 0,
            offset: 0,
            len: BLOCK_LEN,
        };
        session.outstanding_requests.push(block);
        assert_eq!(session.request_capacity(), 9);
        assert!(session.remove_outstanding(&block));
        assert!(!session.remove_outstanding(&block));
        assert_eq!(session.request_capacity(), 10);
    }

    #[test]
    fn test_snub_detection() {
        let (mut session, _rx) = session();
        let start = Instant::now();
        let snub = Duration::from_secs(60);
        // choked peers are never snubbed
        assert!(!session.is_snubbed(start + Duration::from_secs(600), snub));

        session.unchoked_at = Some(start);
        assert!(!session.is_snubbed(start + Duration::from_secs(59), snub));
        assert!(session.is_snubbed(start + Duration::from_secs(61), snub));

        // payload resets the window
        session.last_payload_received = start + Duration::from_secs(60);
        assert!(!session.is_snubbed(start + Duration::from_secs(61), snub));
    }
}
