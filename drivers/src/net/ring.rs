//! Descriptor ring slot ownership.
//!
//! A ring is a power-of-two array of slots, each in exactly one state:
//!
//! ```text
//!   Free ──post──▶ Posted ──complete──▶ PendingReclaim ──reclaim──▶ Free
//!  (software)     (hardware)            (software, not yet processed)
//! ```
//!
//! The per-slot software context `C` lives inside the state, so a buffer
//! posted to hardware cannot be reached through a `Free` slot and a slot
//! cannot hold two owners at once.
//!
//! # Indices
//!
//! Three free-running counters (wrapping `usize`) locate the boundaries:
//! `produced` (next slot to post), `completed` (next slot hardware will
//! report) and `reclaimed` (next slot to process). The slot index is
//! `counter & mask`. Because the counters never wrap at `N`, a completely
//! full ring and an empty one are distinguishable, and
//! `produced - reclaimed <= N` always holds: the producer can never lap the
//! reclaimer.

use alloc::boxed::Box;
use alloc::vec::Vec;

use nveth_abi::{ChannelDir, MIN_RING_SIZE, MacClass, RX_REFILL_THRESHOLD};

use super::types::{EtherError, EtherResult};

/// Ownership state of one ring slot.
#[derive(Debug, Default)]
pub enum Slot<C> {
    #[default]
    Free,
    /// Handed to hardware.
    Posted(C),
    /// Hardware finished, software has not processed it yet.
    PendingReclaim(C),
}

impl<C> Slot<C> {
    #[inline]
    pub fn is_free(&self) -> bool {
        matches!(self, Slot::Free)
    }
}

/// Check a configured ring size against the class limits.
pub fn validate_ring_size(size: usize, class: MacClass, dir: ChannelDir) -> EtherResult<usize> {
    if !size.is_power_of_two() || size < MIN_RING_SIZE || size > class.max_ring_size(dir) {
        return Err(EtherError::InvalidRingSize { dir, size });
    }
    Ok(size)
}

pub struct DescRing<C> {
    slots: Box<[Slot<C>]>,
    mask: usize,
    produced: usize,
    completed: usize,
    reclaimed: usize,
}

impl<C> DescRing<C> {
    /// Allocate an all-`Free` ring. Fails if `size` exceeds the class limit
    /// or is not a power of two.
    pub fn new(size: usize, class: MacClass, dir: ChannelDir) -> EtherResult<Self> {
        let size = validate_ring_size(size, class, dir)?;
        let slots = (0..size).map(|_| Slot::Free).collect::<Vec<_>>();
        Ok(Self {
            slots: slots.into_boxed_slice(),
            mask: size - 1,
            produced: 0,
            completed: 0,
            reclaimed: 0,
        })
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.mask + 1
    }

    /// Slot the next post lands in.
    #[inline]
    pub fn produce_idx(&self) -> usize {
        self.produced & self.mask
    }

    /// Slot the next reclaim reads.
    #[inline]
    pub fn reclaim_idx(&self) -> usize {
        self.reclaimed & self.mask
    }

    /// Slots between reclaim and produce: posted or awaiting reclaim.
    #[inline]
    pub fn outstanding(&self) -> usize {
        self.produced.wrapping_sub(self.reclaimed)
    }

    /// Slots hardware still owns.
    #[inline]
    pub fn in_flight(&self) -> usize {
        self.produced.wrapping_sub(self.completed)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.outstanding() == 0
    }

    /// Slots that are not outstanding.
    #[inline]
    pub fn free_slots(&self) -> usize {
        self.size() - self.outstanding()
    }

    /// Transmit availability: one slot is always kept empty so the hardware
    /// tail pointer never equals its head pointer on a full ring.
    #[inline]
    pub fn available(&self) -> usize {
        self.free_slots().saturating_sub(1)
    }

    /// Receive low-water mark: enough slots consumed to justify a refill.
    #[inline]
    pub fn refill_due(&self) -> bool {
        self.free_slots() >= RX_REFILL_THRESHOLD
    }

    #[inline]
    pub fn slot(&self, idx: usize) -> &Slot<C> {
        &self.slots[idx & self.mask]
    }

    /// Whether the `n` slots starting at the produce index are all `Free`.
    pub fn run_is_free(&self, n: usize) -> bool {
        n <= self.free_slots()
            && (0..n).all(|i| self.slots[self.produced.wrapping_add(i) & self.mask].is_free())
    }

    /// Hand one context to hardware at the produce index.
    ///
    /// Returns the slot index, or the context back when the ring is full.
    /// Nothing is visible to hardware until the caller rings the doorbell
    /// for the batch.
    pub fn post(&mut self, ctx: C) -> Result<usize, C> {
        let idx = self.produce_idx();
        if self.free_slots() == 0 || !self.slots[idx].is_free() {
            return Err(ctx);
        }
        self.slots[idx] = Slot::Posted(ctx);
        self.produced = self.produced.wrapping_add(1);
        Ok(idx)
    }

    /// Post a prepared run of contexts in one step.
    ///
    /// Either every context lands in consecutive slots starting at the
    /// produce index (returning the first index) or none does and the run is
    /// handed back untouched.
    pub fn post_all(&mut self, ctxs: Vec<C>) -> Result<usize, Vec<C>> {
        if !self.run_is_free(ctxs.len()) {
            return Err(ctxs);
        }
        let first = self.produce_idx();
        for ctx in ctxs {
            let idx = self.produce_idx();
            self.slots[idx] = Slot::Posted(ctx);
            self.produced = self.produced.wrapping_add(1);
        }
        Ok(first)
    }

    /// Record that hardware finished up to `count` more slots in post order.
    ///
    /// Returns how many were actually in flight; a larger `count` is a
    /// hardware anomaly the caller should report.
    pub fn complete(&mut self, count: usize) -> usize {
        let n = count.min(self.in_flight());
        for _ in 0..n {
            let idx = self.completed & self.mask;
            let slot = core::mem::take(&mut self.slots[idx]);
            self.slots[idx] = match slot {
                Slot::Posted(ctx) => Slot::PendingReclaim(ctx),
                other => other,
            };
            self.completed = self.completed.wrapping_add(1);
        }
        n
    }

    /// Take the oldest completed context, freeing its slot.
    pub fn reclaim(&mut self) -> Option<(usize, C)> {
        if self.reclaimed == self.completed {
            return None;
        }
        let idx = self.reclaim_idx();
        match core::mem::take(&mut self.slots[idx]) {
            Slot::PendingReclaim(ctx) => {
                self.reclaimed = self.reclaimed.wrapping_add(1);
                Some((idx, ctx))
            }
            other => {
                self.slots[idx] = other;
                None
            }
        }
    }

    /// Remove every context regardless of state and reset the indices.
    ///
    /// Only valid once hardware has stopped fetching from this ring.
    pub fn drain(&mut self) -> Vec<C> {
        let mut out = Vec::with_capacity(self.outstanding());
        for i in 0..self.outstanding() {
            let idx = self.reclaimed.wrapping_add(i) & self.mask;
            match core::mem::take(&mut self.slots[idx]) {
                Slot::Posted(ctx) | Slot::PendingReclaim(ctx) => out.push(ctx),
                Slot::Free => {}
            }
        }
        self.produced = 0;
        self.completed = 0;
        self.reclaimed = 0;
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring(size: usize) -> DescRing<u32> {
        DescRing::new(size, MacClass::Eqos, ChannelDir::Tx)
            .unwrap_or_else(|e| panic!("ring: {}", e))
    }

    #[test]
    fn rejects_bad_sizes() {
        assert!(DescRing::<u8>::new(100, MacClass::Eqos, ChannelDir::Tx).is_err());
        assert!(DescRing::<u8>::new(2048, MacClass::Eqos, ChannelDir::Rx).is_err());
        assert!(DescRing::<u8>::new(32, MacClass::Mgbe, ChannelDir::Rx).is_err());
        assert!(DescRing::<u8>::new(16384, MacClass::Mgbe, ChannelDir::Rx).is_ok());
        assert!(DescRing::<u8>::new(16384, MacClass::Mgbe, ChannelDir::Tx).is_err());
    }

    #[test]
    fn fills_to_capacity_and_refuses_more() {
        let mut r = ring(64);
        for i in 0..64 {
            assert_eq!(r.post(i), Ok(i as usize));
        }
        assert_eq!(r.free_slots(), 0);
        assert_eq!(r.available(), 0);
        assert_eq!(r.post(99), Err(99));
        assert_eq!(r.produce_idx(), r.reclaim_idx());
        assert_eq!(r.outstanding(), 64);
    }

    #[test]
    fn slots_move_through_states_in_order() {
        let mut r = ring(64);
        assert_eq!(r.post(10), Ok(0));
        assert_eq!(r.post(11), Ok(1));
        assert!(matches!(r.slot(0), Slot::Posted(10)));
        assert_eq!(r.reclaim(), None);
        assert_eq!(r.complete(1), 1);
        assert!(matches!(r.slot(0), Slot::PendingReclaim(10)));
        assert!(matches!(r.slot(1), Slot::Posted(11)));
        assert_eq!(r.reclaim(), Some((0, 10)));
        assert!(r.slot(0).is_free());
        assert_eq!(r.reclaim(), None);
    }

    #[test]
    fn over_reported_completions_are_clamped() {
        let mut r = ring(64);
        assert!(r.post(1).is_ok());
        assert_eq!(r.complete(5), 1);
        assert_eq!(r.complete(1), 0);
    }

    #[test]
    fn indices_agree_only_when_empty_or_full() {
        let mut r = ring(64);
        for round in 0..10u32 {
            for i in 0..37 {
                assert!(r.post(round * 100 + i).is_ok());
                let outstanding = r.outstanding();
                if r.produce_idx() == r.reclaim_idx() {
                    assert!(outstanding == 0 || outstanding == r.size());
                }
            }
            assert_eq!(r.complete(37), 37);
            while r.reclaim().is_some() {
                if r.produce_idx() == r.reclaim_idx() {
                    assert!(r.is_empty());
                }
            }
        }
        assert!(r.is_empty());
        assert_eq!(r.produce_idx(), (10 * 37) % 64);
    }

    #[test]
    fn run_is_free_tracks_wrap() {
        let mut r = ring(64);
        for i in 0..60 {
            assert!(r.post(i).is_ok());
        }
        assert!(r.run_is_free(4));
        assert!(!r.run_is_free(5));
        assert_eq!(r.complete(10), 10);
        for _ in 0..10 {
            assert!(r.reclaim().is_some());
        }
        assert!(r.run_is_free(14));
        assert!(!r.refill_due());
        assert_eq!(r.complete(2), 2);
        assert!(r.reclaim().is_some());
        assert!(r.reclaim().is_some());
        assert!(r.refill_due());
    }

    #[test]
    fn post_all_is_all_or_nothing() {
        let mut r = ring(64);
        for i in 0..60 {
            assert!(r.post(i).is_ok());
        }
        assert_eq!(r.post_all(alloc::vec![1, 2, 3, 4, 5]), Err(alloc::vec![1, 2, 3, 4, 5]));
        assert_eq!(r.outstanding(), 60);
        assert_eq!(r.post_all(alloc::vec![7, 8]), Ok(60));
        assert!(matches!(r.slot(61), Slot::Posted(8)));
    }

    #[test]
    fn drain_returns_everything_outstanding() {
        let mut r = ring(64);
        for i in 0..5 {
            assert!(r.post(i).is_ok());
        }
        assert_eq!(r.complete(2), 2);
        assert!(r.reclaim().is_some());
        let drained = r.drain();
        assert_eq!(drained, [1, 2, 3, 4]);
        assert!(r.is_empty());
        assert!((0..64).all(|i| r.slot(i).is_free()));
    }
}
