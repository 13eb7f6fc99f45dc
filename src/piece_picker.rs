//! Decides which piece to download next.
//!
//! The picker owns the authoritative verified-piece bitfield and the
//! per-piece availability counts derived from connected peers' announced
//! pieces. Selection is rarest-first while the torrent warms up (so the
//! swarm's scarce pieces spread), then sequential from a cached cursor (so
//! completed data forms a growing prefix and disk writes stay local).

use rand::Rng;

use crate::{Bitfield, PieceIndex};

pub(crate) struct PiecePicker {
    /// Which pieces we have, verified and durably written. Bits only ever go
    /// from zero to one, except across an explicit recheck.
    own_pieces: Bitfield,
    /// How many connected peers have each piece.
    availability: Vec<u16>,
    /// Pieces excluded by per-file priority. Never selected.
    skipped: Bitfield,
    /// Pieces excluded for the session (e.g. poisoned data). Never selected.
    blacklisted: Bitfield,
    /// The index before which every piece is either owned or excluded. Lazily
    /// advanced; the sequential scan starts here.
    first_needed: PieceIndex,
    /// Cached count of set bits in `own_pieces`.
    own_count: usize,
    /// Cached count of wanted pieces: not owned, not skipped, not
    /// blacklisted. Consulted every tick for the endgame decision, so it
    /// must not be derived by scanning.
    missing_count: usize,
    /// Below this many owned pieces, selection is rarest-first.
    warmup_piece_count: usize,
}

impl PiecePicker {
    pub fn new(piece_count: usize, warmup_piece_count: usize) -> Self {
        Self {
            own_pieces: Bitfield::repeat(false, piece_count),
            availability: vec![0; piece_count],
            skipped: Bitfield::repeat(false, piece_count),
            blacklisted: Bitfield::repeat(false, piece_count),
            first_needed: 0,
            own_count: 0,
            missing_count: piece_count,
            warmup_piece_count,
        }
    }

    /// Replaces the owned set wholesale, as done on resume and after a
    /// recheck. This is the one operation allowed to clear bits.
    pub fn restore(&mut self, own_pieces: Bitfield) {
        debug_assert_eq!(own_pieces.len(), self.own_pieces.len());
        self.own_count = own_pieces.count_ones();
        self.own_pieces = own_pieces;
        self.first_needed = 0;
        self.recount_missing();
        self.advance_cursor();
    }

    pub fn own_pieces(&self) -> &Bitfield {
        &self.own_pieces
    }

    pub fn own_count(&self) -> usize {
        self.own_count
    }

    pub fn piece_count(&self) -> usize {
        self.own_pieces.len()
    }

    pub fn have_piece(&self, index: PieceIndex) -> bool {
        self.own_pieces[index]
    }

    /// True once every non-excluded piece is owned.
    pub fn is_complete(&self) -> bool {
        self.missing_count() == 0
    }

    /// The number of pieces still wanted: not owned, not skipped, not
    /// blacklisted.
    pub fn missing_count(&self) -> usize {
        self.missing_count
    }

    /// Records that a piece was verified and written. Idempotent.
    pub fn received_piece(&mut self, index: PieceIndex) {
        if !self.own_pieces[index] {
            if self.is_wanted(index) {
                self.missing_count -= 1;
            }
            self.own_pieces.set(index, true);
            self.own_count += 1;
            self.advance_cursor();
        }
    }

    /// Marks a piece as never-select for the session.
    pub fn blacklist_piece(&mut self, index: PieceIndex) {
        if self.is_wanted(index) {
            self.missing_count -= 1;
        }
        self.blacklisted.set(index, true);
        self.advance_cursor();
    }

    /// Replaces the priority exclusions, as derived from per-file
    /// priorities by the torrent.
    pub fn set_skipped(&mut self, skipped: Bitfield) {
        debug_assert_eq!(skipped.len(), self.own_pieces.len());
        self.skipped = skipped;
        self.first_needed = 0;
        self.recount_missing();
        self.advance_cursor();
    }

    fn recount_missing(&mut self) {
        self.missing_count = (0..self.own_pieces.len())
            .filter(|&index| self.is_wanted(index))
            .count();
    }

    /// Registers a peer's full bitfield with the availability counts.
    /// Returns true if the peer has at least one piece we still need.
    pub fn register_peer_pieces(&mut self, pieces: &Bitfield) -> bool {
        debug_assert_eq!(pieces.len(), self.own_pieces.len());
        let mut interested = false;
        for index in pieces.iter_ones() {
            self.availability[index] += 1;
            if self.is_wanted(index) {
                interested = true;
            }
        }
        interested
    }

    /// Registers a single HAVE announcement. Returns true if the piece is
    /// one we still need.
    pub fn register_have(&mut self, index: PieceIndex) -> bool {
        self.availability[index] += 1;
        self.is_wanted(index)
    }

    /// Removes a disconnected peer's pieces from the availability counts.
    pub fn unregister_peer_pieces(&mut self, pieces: &Bitfield) {
        debug_assert_eq!(pieces.len(), self.own_pieces.len());
        for index in pieces.iter_ones() {
            debug_assert!(self.availability[index] > 0);
            self.availability[index] -= 1;
        }
    }

    /// True if the peer has any piece we still need, for interest
    /// recomputation.
    pub fn needs_any_of(&self, pieces: &Bitfield) -> bool {
        pieces.iter_ones().any(|index| self.is_wanted(index))
    }

    /// How many connected peers have the piece.
    pub fn availability_of(&self, index: PieceIndex) -> u16 {
        self.availability[index]
    }

    /// Picks the next piece to start downloading from a peer with the given
    /// pieces, skipping pieces for which `is_active` holds (those are
    /// already in flight and are drained separately).
    ///
    /// During warm-up this is rarest-first with random tie-breaks, so
    /// concurrently started peers don't all pile onto the same piece.
    /// Afterwards it is the first wanted piece at or past the cached cursor.
    pub fn pick_piece(
        &mut self,
        peer_pieces: &Bitfield,
        mut is_active: impl FnMut(PieceIndex) -> bool,
    ) -> Option<PieceIndex> {
        debug_assert_eq!(peer_pieces.len(), self.own_pieces.len());
        if self.own_count < self.warmup_piece_count {
            self.pick_rarest(peer_pieces, is_active)
        } else {
            (self.first_needed..self.own_pieces.len()).find(|&index| {
                self.is_wanted(index)
                    && peer_pieces[index]
                    && !is_active(index)
            })
        }
    }

    fn pick_rarest(
        &mut self,
        peer_pieces: &Bitfield,
        mut is_active: impl FnMut(PieceIndex) -> bool,
    ) -> Option<PieceIndex> {
        let mut best: Option<(PieceIndex, u16)> = None;
        let mut ties = 0u32;
        let mut rng = rand::thread_rng();
        for index in peer_pieces.iter_ones() {
            if !self.is_wanted(index) || is_active(index) {
                continue;
            }
            let avail = self.availability[index];
            match best {
                Some((_, best_avail)) if avail > best_avail => {}
                Some((_, best_avail)) if avail == best_avail => {
                    // reservoir sample among equally rare pieces
                    ties += 1;
                    if rng.gen_ratio(1, ties + 1) {
                        best = Some((index, avail));
                    }
                }
                _ => {
                    best = Some((index, avail));
                    ties = 0;
                }
            }
        }
        best.map(|(index, _)| index)
    }

    fn is_wanted(&self, index: PieceIndex) -> bool {
        !self.own_pieces[index]
            && !self.skipped[index]
            && !self.blacklisted[index]
    }

    fn advance_cursor(&mut self) {
        while self.first_needed < self.own_pieces.len()
            && !self.is_wanted(self.first_needed)
        {
            self.first_needed += 1;
        }
    }
}
