//! Hardware seam: descriptor formats and the DMA engine interface.
//!
//! The engine never touches registers. It prepares descriptors, hands a
//! whole batch to [`DmaEngine::submit`] (one doorbell write) and reads
//! completion status back in post order.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use bitflags::bitflags;
use nveth_abi::{ChannelDir, ChannelId, DmaAddr, PktId};

bitflags! {
    /// Transmit descriptor control bits.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct TxDescFlags: u16 {
        /// Context descriptor; carries MSS/VLAN/PTP setup, no buffer.
        const CONTEXT = 1 << 0;
        const FIRST   = 1 << 1;
        const LAST    = 1 << 2;
        /// Interrupt on completion.
        const IOC     = 1 << 3;
        /// Insert checksums.
        const CSUM    = 1 << 4;
        /// Segmentation offload enabled for this packet.
        const TSO     = 1 << 5;
        /// Context carries a VLAN tag to insert.
        const VLAN    = 1 << 6;
        /// Capture a transmit timestamp.
        const TTSE    = 1 << 7;
        /// One-step timestamp insertion.
        const OSTC    = 1 << 8;
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TxDescriptor {
    pub addr: DmaAddr,
    pub len: u16,
    pub flags: TxDescFlags,
    /// Segment size (context descriptor).
    pub mss: u16,
    /// Tag to insert (context descriptor).
    pub vlan: u16,
    /// Timestamp match id (context descriptor, MGBE).
    pub pktid: u32,
    /// L2..L4 header length (first descriptor, TSO).
    pub hdr_len: u16,
    /// Payload bytes following the header (first descriptor, TSO).
    pub pay_len: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RxDescriptor {
    pub addr: DmaAddr,
    pub buf_len: u32,
}

/// Descriptors handed to hardware in one doorbell.
#[derive(Debug)]
pub enum DescBatch<'a> {
    Tx(&'a [TxDescriptor]),
    Rx(&'a [RxDescriptor]),
}

impl DescBatch<'_> {
    pub fn len(&self) -> usize {
        match self {
            Self::Tx(d) => d.len(),
            Self::Rx(d) => d.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Write-back status of one completed transmit descriptor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TxStatus {
    pub error: bool,
    /// Timestamp captured in the descriptor itself.
    pub tstamp_ns: Option<u64>,
}

/// Write-back status of one completed receive descriptor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RxStatus {
    /// Bytes written into the buffer.
    pub len: usize,
    pub first: bool,
    pub last: bool,
    pub error: bool,
    /// L3/L4 checksums verified.
    pub csum_ok: bool,
    pub vlan: Option<u16>,
    pub hash: Option<u32>,
    pub tstamp_ns: Option<u64>,
    /// Context descriptor written back by hardware; carries no frame.
    pub context: bool,
}

/// Completions read by one poll, oldest first.
#[derive(Debug)]
pub struct Completions<S> {
    pub done: Vec<S>,
    /// Hardware has finished more descriptors than were returned.
    pub more_pending: bool,
}

impl<S> Completions<S> {
    pub fn none() -> Self {
        Self {
            done: Vec::new(),
            more_pending: false,
        }
    }

    #[inline]
    pub fn count(&self) -> usize {
        self.done.len()
    }
}

/// Completions the device reported beyond a poll's budget.
///
/// They describe descriptors that really finished, so they are replayed
/// ahead of fresh ones on the next poll instead of being discarded.
#[derive(Debug)]
pub struct CompletionBacklog<S> {
    held: VecDeque<S>,
}

impl<S> Default for CompletionBacklog<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> CompletionBacklog<S> {
    pub const fn new() -> Self {
        Self {
            held: VecDeque::new(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.held.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }

    pub fn clear(&mut self) {
        self.held.clear();
    }

    /// At most `budget` completions, held ones first; `fetch` is asked for
    /// the remainder only.
    ///
    /// Returns the batch and how many completions `fetch` returned over what
    /// it was asked for. Those are kept for the next call.
    pub fn next_batch(
        &mut self,
        budget: usize,
        fetch: impl FnOnce(usize) -> Completions<S>,
    ) -> (Completions<S>, usize) {
        let held = self.held.len().min(budget);
        let mut done: Vec<S> = self.held.drain(..held).collect();
        let mut more_pending = !self.held.is_empty();
        let mut excess = 0;

        let want = budget - held;
        if want > 0 {
            let mut fresh = fetch(want);
            if fresh.count() > want {
                excess = fresh.count() - want;
                self.held.extend(fresh.done.drain(want..));
                more_pending = true;
            }
            more_pending |= fresh.more_pending;
            done.append(&mut fresh.done);
        }
        (Completions { done, more_pending }, excess)
    }
}

/// Answer to a deferred timestamp lookup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TsQuery {
    Ready(u64),
    /// Hardware dropped or overwrote the sample.
    Missed,
    Pending,
}

/// DMA engine and interrupt control for all channels.
pub trait DmaEngine: Send + Sync {
    /// Make a fully prepared batch visible to hardware with one tail write.
    fn submit(&self, chan: ChannelId, batch: DescBatch<'_>);

    /// Up to `budget` finished transmit descriptors, in post order.
    fn poll_tx_completions(&self, chan: ChannelId, budget: usize) -> Completions<TxStatus>;

    /// Up to `budget` finished receive descriptors, in post order.
    fn poll_rx_completions(&self, chan: ChannelId, budget: usize) -> Completions<RxStatus>;

    fn irq_enable(&self, chan: ChannelId, dir: ChannelDir);

    fn irq_disable(&self, chan: ChannelId, dir: ChannelDir);

    fn tx_timestamp(&self, pktid: PktId) -> TsQuery;
}
