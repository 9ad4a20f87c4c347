//! Move-only packet buffer exchanged between the rings and the stack.
//!
//! `NetBuf` carries a linear region plus optional page fragments (transmit
//! scatter-gather) and per-packet metadata the driver fills in or reads:
//! checksum verdict, RSS hash, VLAN tag, hardware timestamp and the transmit
//! offload request.
//!
//! # Ownership
//!
//! `NetBuf` deliberately does not implement `Clone`. While a buffer is
//! posted to hardware it is owned by exactly one ring slot; it leaves the
//! slot only by being delivered upstream, handed to the timestamp list, or
//! dropped.
//!
//! # Layout
//!
//! ```text
//! |<-- consumed -->|<-- payload (head..tail) -->|<-- tailroom -->|
//! 0            head                          tail           capacity
//! ```

use alloc::vec::Vec;
use core::fmt;

use bitflags::bitflags;

use crate::error::{DmaError, DmaResult};

// =============================================================================
// Metadata
// =============================================================================

/// Receive checksum verdict.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CsumState {
    /// Stack must verify.
    #[default]
    None,
    /// Hardware verified L3/L4 checksums.
    Unnecessary,
}

bitflags! {
    /// Per-packet transmit offload requests.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct TxOffloadFlags: u8 {
        /// Insert L3/L4 checksums.
        const CSUM = 1 << 0;
        /// Capture a hardware transmit timestamp.
        const PTP  = 1 << 1;
    }
}

/// Segmentation offload kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GsoKind {
    /// TCP segmentation; `hdr_len` is the TCP header length in bytes.
    Tcp { hdr_len: u8 },
    /// UDP segmentation; the L4 header is always 8 bytes.
    Udp,
}

/// Segmentation offload request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Gso {
    /// Segment size as given by the stack (includes the UDP header for UDP).
    pub size: u16,
    pub kind: GsoKind,
}

/// What the stack asked the driver to do with an outgoing packet.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TxOffload {
    pub flags: TxOffloadFlags,
    pub gso: Option<Gso>,
    /// Offset of the L4 header from the start of the linear region.
    pub l4_offset: u16,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BufMeta {
    pub csum: CsumState,
    pub hash: Option<u32>,
    /// Received tag, or tag to insert on transmit.
    pub vlan: Option<u16>,
    pub hw_tstamp_ns: Option<u64>,
    pub tx: TxOffload,
    /// Segments coalesced into this buffer by receive reassembly.
    pub gro_segs: u16,
    /// Payload length of the first coalesced segment.
    pub gso_size: u16,
}

// =============================================================================
// NetBuf
// =============================================================================

pub struct NetBuf {
    data: Vec<u8>,
    head: usize,
    tail: usize,
    frags: Vec<Vec<u8>>,
    pub meta: BufMeta,
}

impl fmt::Debug for NetBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetBuf")
            .field("len", &self.len())
            .field("frags", &self.frags.len())
            .field("capacity", &self.data.len())
            .field("meta", &self.meta)
            .finish()
    }
}

impl NetBuf {
    /// Zeroed receive buffer of `capacity` bytes with an empty payload.
    ///
    /// Returns `None` when the allocator cannot satisfy the request instead
    /// of aborting.
    pub fn with_capacity(capacity: usize) -> Option<Self> {
        let mut data = Vec::new();
        data.try_reserve_exact(capacity).ok()?;
        data.resize(capacity, 0);
        Some(Self {
            data,
            head: 0,
            tail: 0,
            frags: Vec::new(),
            meta: BufMeta::default(),
        })
    }

    /// Buffer whose payload is a copy of `bytes`.
    pub fn from_slice(bytes: &[u8]) -> Self {
        Self {
            data: bytes.to_vec(),
            head: 0,
            tail: bytes.len(),
            frags: Vec::new(),
            meta: BufMeta::default(),
        }
    }

    /// Linear payload length.
    #[inline]
    pub fn len(&self) -> usize {
        self.tail - self.head
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.total_len() == 0
    }

    /// Linear plus fragment bytes.
    pub fn total_len(&self) -> usize {
        self.len() + self.frags.iter().map(Vec::len).sum::<usize>()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.head..self.tail]
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data[self.head..self.tail]
    }

    /// Area the device may write into when the buffer is posted for receive.
    #[inline]
    pub fn dma_area(&self) -> &[u8] {
        &self.data[self.head..]
    }

    #[inline]
    pub fn dma_area_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.head..]
    }

    /// Expose `len` bytes written by the device as payload.
    pub fn set_len(&mut self, len: usize) -> DmaResult {
        if self.head + len > self.data.len() {
            return Err(DmaError::InvalidLength { len });
        }
        self.tail = self.head + len;
        Ok(())
    }

    /// Drop `len` bytes from the front of the payload.
    pub fn pull(&mut self, len: usize) -> DmaResult {
        if len > self.len() {
            return Err(DmaError::InvalidLength { len });
        }
        self.head += len;
        Ok(())
    }

    /// Shorten the linear payload to `len` bytes. No-op if already shorter.
    pub fn truncate(&mut self, len: usize) {
        if len < self.len() {
            self.tail = self.head + len;
        }
    }

    /// Append bytes to the linear payload, growing the backing store.
    pub fn append(&mut self, bytes: &[u8]) -> DmaResult {
        self.data.truncate(self.tail);
        self.data
            .try_reserve(bytes.len())
            .map_err(|_| DmaError::NoMemory)?;
        self.data.extend_from_slice(bytes);
        self.tail = self.data.len();
        Ok(())
    }

    /// Attach a page fragment after the linear region.
    pub fn push_frag(&mut self, frag: Vec<u8>) {
        self.frags.push(frag);
    }

    #[inline]
    pub fn frags(&self) -> &[Vec<u8>] {
        &self.frags
    }
}
