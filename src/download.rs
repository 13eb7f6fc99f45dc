//! In-flight piece bookkeeping.
//!
//! A [`PieceDownload`] is a piece being assembled: a pre-allocated buffer,
//! a per-block record of who was asked for what and when, and the received
//! set. [`Downloads`] is the per-torrent collection of these, and is where
//! admission control (how many pieces may hold buffers), the endgame
//! duplicate rules, and the request timeout sweep live.
//!
//! Buffer ownership: while a piece is assembling, its buffer belongs here.
//! When the last block lands the buffer moves to the disk task for hashing
//! and writing; until the completion comes back the piece is tracked in
//! `in_disk` and its bytes still count against the buffer cap, but nothing
//! in the scheduling domain may touch it.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use crate::{
    block_count, block_len, BlockInfo, PeerKey, PieceIndex, BLOCK_LEN,
};

/// The outcome of trying to reserve a block for a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Reservation {
    /// The block is now (also) owned by the peer.
    Reserved,
    /// The block is owned by another peer and duplicates are not allowed.
    AlreadyRequested,
    /// The block's data has already arrived.
    AlreadyReceived,
    /// The piece is not assembling.
    PieceNotActive,
}

/// What happened to a committed block.
#[derive(Debug, Default)]
pub(crate) struct Commit {
    /// True if this block completed the piece.
    pub piece_complete: bool,
    /// Peers other than the submitter that still had the block reserved;
    /// each should be sent a CANCEL for it.
    pub cancel: Vec<PeerKey>,
}

#[derive(Debug, Clone)]
enum BlockState {
    /// Not yet requested from anyone.
    Free,
    /// Requested and awaited. Outside endgame there is exactly one owner.
    Requested {
        owners: Vec<PeerKey>,
        requested_at: Instant,
    },
    /// Present in the piece buffer. Never re-accepted.
    Received,
}

/// A piece being assembled.
pub(crate) struct PieceDownload {
    index: PieceIndex,
    len: u32,
    buf: Vec<u8>,
    blocks: Vec<BlockState>,
    received_count: usize,
    /// Every peer that contributed at least one received block. Held for
    /// penalty attribution should the piece fail its hash.
    contributors: Vec<PeerKey>,
}

impl PieceDownload {
    fn new(index: PieceIndex, len: u32, mut buf: Vec<u8>) -> Self {
        buf.clear();
        buf.resize(len as usize, 0);
        Self {
            index,
            len,
            buf,
            blocks: vec![BlockState::Free; block_count(len)],
            received_count: 0,
            contributors: Vec::new(),
        }
    }

    /// True while some block has not been requested from anyone. In the
    /// spec's terms this is the `Partial` state; once false the piece is
    /// fully requested and only admission of other pieces can create new
    /// work.
    pub fn has_free_block(&self) -> bool {
        self.blocks
            .iter()
            .any(|b| matches!(b, BlockState::Free))
    }

    pub fn is_complete(&self) -> bool {
        self.received_count == self.blocks.len()
    }

    fn block_info(&self, block_index: usize) -> BlockInfo {
        BlockInfo {
            piece_index: self.index,
            offset: block_index as u32 * BLOCK_LEN,
            len: block_len(self.len, block_index),
        }
    }
}

/// The set of pieces currently holding buffers, with admission control.
pub(crate) struct Downloads {
    /// Pieces assembling in memory.
    pieces: HashMap<PieceIndex, PieceDownload>,
    /// Pieces handed to the disk task, awaiting their write completion.
    /// The value is the contributor list, kept for hash-failure penalties.
    in_disk: HashMap<PieceIndex, Vec<PeerKey>>,
    /// Total bytes pinned by assembling and in-disk piece buffers.
    buffered_bytes: usize,
    /// Recycled piece buffers, fed by abandoned pieces.
    buf_pool: Vec<Vec<u8>>,
    /// Whether endgame duplicate requests are currently allowed.
    endgame: bool,
    /// How many owners a block may have during endgame.
    endgame_duplicates: usize,
    /// Admission caps, from the torrent configuration.
    max_active_pieces: usize,
    max_buffered_bytes: usize,
}

impl Downloads {
    pub fn new(
        max_active_pieces: usize,
        max_buffered_bytes: usize,
        endgame_duplicates: usize,
    ) -> Self {
        Self {
            pieces: HashMap::new(),
            in_disk: HashMap::new(),
            buffered_bytes: 0,
            buf_pool: Vec::new(),
            endgame: false,
            endgame_duplicates,
            max_active_pieces,
            max_buffered_bytes,
        }
    }

    pub fn is_active(&self, index: PieceIndex) -> bool {
        self.pieces.contains_key(&index) || self.in_disk.contains_key(&index)
    }

    /// The pieces currently assembling in memory (not the ones already at
    /// the disk task).
    pub fn assembling_pieces(
        &self,
    ) -> impl Iterator<Item = PieceIndex> + '_ {
        self.pieces.keys().copied()
    }

    /// The number of pieces still accepting new block reservations.
    pub fn partial_count(&self) -> usize {
        self.pieces.values().filter(|p| p.has_free_block()).count()
    }

    pub fn active_count(&self) -> usize {
        self.pieces.len() + self.in_disk.len()
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buffered_bytes
    }

    pub fn set_endgame(&mut self, endgame: bool) {
        if endgame && !self.endgame {
            log::info!("Entering endgame");
        }
        self.endgame = endgame;
    }

    /// Whether a new piece of the given length may start assembling, per the
    /// admission caps. `max_partials` is derived from the connected peer
    /// count by the caller.
    pub fn can_start_piece(&self, len: u32, max_partials: usize) -> bool {
        self.active_count() < self.max_active_pieces
            && self.partial_count() < max_partials
            && self.buffered_bytes + len as usize <= self.max_buffered_bytes
    }

    /// Starts assembling a piece, allocating (or recycling) its buffer.
    pub fn start_piece(&mut self, index: PieceIndex, len: u32) {
        debug_assert!(!self.is_active(index));
        let buf = self
            .buf_pool
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(len as usize));
        self.buffered_bytes += len as usize;
        self.pieces
            .insert(index, PieceDownload::new(index, len, buf));
        log::debug!("Started piece {} download ({} bytes)", index, len);
    }

    /// Reserves the lowest eligible block of the piece for the peer and
    /// returns its info. During endgame, blocks already requested from other
    /// peers are eligible up to the duplicate cap once no free block
    /// remains.
    pub fn next_block(
        &mut self,
        index: PieceIndex,
        peer: PeerKey,
        now: Instant,
    ) -> Option<BlockInfo> {
        let endgame = self.endgame;
        let dup_cap = self.endgame_duplicates;
        let piece = self.pieces.get_mut(&index)?;

        // sequential within piece: the lowest free block wins
        for (block_index, state) in piece.blocks.iter_mut().enumerate() {
            if matches!(state, BlockState::Free) {
                *state = BlockState::Requested {
                    owners: vec![peer],
                    requested_at: now,
                };
                return Some(piece.block_info(block_index));
            }
        }

        if !endgame {
            return None;
        }

        // endgame: double up on the stalest outstanding block
        let mut candidate: Option<(usize, Instant)> = None;
        for (block_index, state) in piece.blocks.iter().enumerate() {
            if let BlockState::Requested {
                owners,
                requested_at,
            } = state
            {
                if owners.len() < dup_cap && !owners.contains(&peer) {
                    match candidate {
                        Some((_, at)) if *requested_at >= at => {}
                        _ => candidate = Some((block_index, *requested_at)),
                    }
                }
            }
        }
        let (block_index, _) = candidate?;
        if let BlockState::Requested { owners, .. } =
            &mut piece.blocks[block_index]
        {
            owners.push(peer);
        }
        Some(piece.block_info(block_index))
    }

    /// Reserves a specific block for a peer.
    pub fn reserve_block(
        &mut self,
        index: PieceIndex,
        block_index: usize,
        peer: PeerKey,
        now: Instant,
    ) -> Reservation {
        let endgame = self.endgame;
        let dup_cap = self.endgame_duplicates;
        let piece = match self.pieces.get_mut(&index) {
            Some(piece) => piece,
            None => return Reservation::PieceNotActive,
        };
        match &mut piece.blocks[block_index] {
            state @ BlockState::Free => {
                *state = BlockState::Requested {
                    owners: vec![peer],
                    requested_at: now,
                };
                Reservation::Reserved
            }
            BlockState::Requested { owners, .. } => {
                if endgame
                    && owners.len() < dup_cap
                    && !owners.contains(&peer)
                {
                    owners.push(peer);
                    Reservation::Reserved
                } else {
                    Reservation::AlreadyRequested
                }
            }
            BlockState::Received => Reservation::AlreadyReceived,
        }
    }

    /// Returns the destination slice for an arriving PIECE payload, or
    /// `None` if the bytes are not welcome: the piece is not assembling, the
    /// offset is not block aligned, the length is wrong, or the block was
    /// already received. A well-formed unsolicited block for a missing slot
    /// is welcome; progress beats protocol pedantry here.
    pub fn destination_for(
        &mut self,
        index: PieceIndex,
        offset: u32,
        len: u32,
    ) -> Option<&mut [u8]> {
        let piece = self.pieces.get_mut(&index)?;
        if offset % BLOCK_LEN != 0 {
            return None;
        }
        let block_index = (offset / BLOCK_LEN) as usize;
        if block_index >= piece.blocks.len()
            || len != block_len(piece.len, block_index)
        {
            return None;
        }
        if matches!(piece.blocks[block_index], BlockState::Received) {
            return None;
        }
        let start = offset as usize;
        Some(&mut piece.buf[start..start + len as usize])
    }

    /// Marks a block received after its bytes were copied into the piece
    /// buffer. Returns `None` if the block wasn't accepted (mirror the
    /// conditions of [`Self::destination_for`]).
    pub fn commit_block(
        &mut self,
        index: PieceIndex,
        offset: u32,
        peer: PeerKey,
    ) -> Option<Commit> {
        let piece = self.pieces.get_mut(&index)?;
        let block_index = (offset / BLOCK_LEN) as usize;
        if block_index >= piece.blocks.len() {
            return None;
        }

        let mut commit = Commit::default();
        match &piece.blocks[block_index] {
            BlockState::Received => return None,
            BlockState::Requested { owners, .. } => {
                commit.cancel =
                    owners.iter().copied().filter(|o| *o != peer).collect();
            }
            BlockState::Free => {}
        }
        piece.blocks[block_index] = BlockState::Received;
        piece.received_count += 1;
        if !piece.contributors.contains(&peer) {
            piece.contributors.push(peer);
        }
        commit.piece_complete = piece.is_complete();
        Some(commit)
    }

    /// Takes a fully received piece's buffer for hashing and writing. The
    /// piece moves to the in-disk set; its bytes stay counted until the
    /// write completion arrives.
    pub fn take_complete(
        &mut self,
        index: PieceIndex,
    ) -> Option<(Vec<u8>, Vec<PeerKey>)> {
        let piece = self.pieces.remove(&index)?;
        debug_assert!(piece.is_complete());
        self.in_disk.insert(index, piece.contributors.clone());
        Some((piece.buf, piece.contributors))
    }

    /// Called when the disk reports a successful verified write.
    pub fn finish_write(&mut self, index: PieceIndex, len: u32) {
        if self.in_disk.remove(&index).is_some() {
            self.buffered_bytes -= len as usize;
        }
    }

    /// Discards a piece after a hash failure (or a skip-priority change) and
    /// returns the peers that contributed to it.
    pub fn abandon(&mut self, index: PieceIndex, len: u32) -> Vec<PeerKey> {
        if let Some(contributors) = self.in_disk.remove(&index) {
            // the buffer was consumed by the disk task
            self.buffered_bytes -= len as usize;
            return contributors;
        }
        if let Some(piece) = self.pieces.remove(&index) {
            self.buffered_bytes -= len as usize;
            self.recycle(piece.buf);
            return piece.contributors;
        }
        Vec::new()
    }

    /// Clears reservations older than the timeout and returns them with
    /// their owners for stall accounting. Timed out blocks become free and
    /// requestable again.
    pub fn sweep_timeouts(
        &mut self,
        now: Instant,
        timeout: Duration,
    ) -> Vec<(BlockInfo, Vec<PeerKey>)> {
        let mut swept = Vec::new();
        for piece in self.pieces.values_mut() {
            for block_index in 0..piece.blocks.len() {
                if let BlockState::Requested {
                    owners,
                    requested_at,
                } = &piece.blocks[block_index]
                {
                    if now.duration_since(*requested_at) > timeout {
                        swept.push((
                            piece.block_info(block_index),
                            owners.clone(),
                        ));
                        piece.blocks[block_index] = BlockState::Free;
                    }
                }
            }
        }
        swept
    }

    /// Drops every reservation held by a disconnecting peer. Blocks it was
    /// the sole owner of become free again.
    pub fn release_peer(&mut self, peer: PeerKey) {
        for piece in self.pieces.values_mut() {
            for state in piece.blocks.iter_mut() {
                if let BlockState::Requested { owners, .. } = state {
                    owners.retain(|o| *o != peer);
                    if owners.is_empty() {
                        *state = BlockState::Free;
                    }
                }
            }
        }
    }

    /// True if no reservation anywhere is attributed to the peer. Test and
    /// assertion helper.
    #[cfg(test)]
    pub fn has_no_reservations_for(&self, peer: PeerKey) -> bool {
        self.pieces.values().all(|piece| {
            piece.blocks.iter().all(|state| match state {
                BlockState::Requested { owners, .. } => {
                    !owners.contains(&peer)
                }
                _ => true,
            })
        })
    }

    fn recycle(&mut self, buf: Vec<u8>) {
        // a handful of spare buffers is plenty; beyond that let them drop
        if self.buf_pool.len() < 8 {
            self.buf_pool.push(buf);
        }
    }
}
