//! Receive buffer allocator with a reserved fallback buffer.
//!
//! Refill runs in a context that must not fail the ring: when the buffer
//! source is empty, the slot is posted with the channel's **reserved
//! buffer** instead, so hardware always has somewhere to write. Frames that
//! land in the reserved buffer are discarded by the completion path. Only a
//! genuine mapping failure is reported, and it aborts the current refill
//! batch.
//!
//! The reserved buffer is represented as its own [`RxBuffer`] variant rather
//! than compared by pointer, so releasing it is a no-op by construction and
//! can never double-free.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use nveth_abi::{DmaAddr, DmaDirection};
use nveth_lib::{klog_debug, klog_warn};

use crate::dma::DmaMapper;
use crate::error::{DmaError, DmaResult};
use crate::netbuf::NetBuf;

// =============================================================================
// Buffer sources
// =============================================================================

/// Where fresh packet buffers come from.
pub trait BufferSource: Send + Sync {
    /// A zeroed buffer of `len` bytes, or `None` when memory is exhausted.
    fn alloc(&self, len: usize) -> Option<NetBuf>;
}

/// Allocates from the global heap, failing softly on exhaustion.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapSource;

impl BufferSource for HeapSource {
    fn alloc(&self, len: usize) -> Option<NetBuf> {
        NetBuf::with_capacity(len)
    }
}

/// Heap source with a fixed allocation quota.
///
/// Each successful allocation consumes one unit; [`refund`](Self::refund)
/// returns units. Lock-free, safe from any context.
#[derive(Debug)]
pub struct QuotaSource {
    remaining: AtomicUsize,
}

impl QuotaSource {
    pub const fn new(quota: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(quota),
        }
    }

    pub fn refund(&self, units: usize) {
        self.remaining.fetch_add(units, Ordering::AcqRel);
    }

    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }
}

impl BufferSource for QuotaSource {
    fn alloc(&self, len: usize) -> Option<NetBuf> {
        loop {
            let left = self.remaining.load(Ordering::Acquire);
            if left == 0 {
                return None;
            }
            if self
                .remaining
                .compare_exchange_weak(left, left - 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
            core::hint::spin_loop();
        }
        let buf = NetBuf::with_capacity(len);
        if buf.is_none() {
            self.refund(1);
        }
        buf
    }
}

// =============================================================================
// Reserved buffer
// =============================================================================

/// Statically mapped fallback buffer owned by one Rx channel.
struct ReservedBuffer {
    storage: Box<[u8]>,
    addr: DmaAddr,
}

impl ReservedBuffer {
    fn new(mapper: &dyn DmaMapper, len: usize) -> DmaResult<Self> {
        if len == 0 {
            return Err(DmaError::InvalidLength { len });
        }
        let storage = vec![0u8; len].into_boxed_slice();
        let addr = mapper.map(DmaDirection::FromDevice, &storage)?;
        Ok(Self { storage, addr })
    }
}

// =============================================================================
// RxBuffer
// =============================================================================

/// A buffer posted (or about to be posted) to an Rx descriptor.
#[derive(Debug)]
pub enum RxBuffer {
    /// Freshly allocated and mapped; owned by the slot.
    Dynamic { buf: NetBuf, addr: DmaAddr },
    /// The channel's reserved buffer. Never freed through this handle.
    Reserved { addr: DmaAddr },
}

impl RxBuffer {
    #[inline]
    pub fn addr(&self) -> DmaAddr {
        match self {
            Self::Dynamic { addr, .. } | Self::Reserved { addr } => *addr,
        }
    }

    #[inline]
    pub fn is_reserved(&self) -> bool {
        matches!(self, Self::Reserved { .. })
    }
}

// =============================================================================
// BufferAllocator
// =============================================================================

pub struct BufferAllocator {
    mapper: Arc<dyn DmaMapper>,
    source: Arc<dyn BufferSource>,
    reserved: Option<ReservedBuffer>,
    buf_len: usize,
    alloc_failed: AtomicU64,
}

impl BufferAllocator {
    /// Build an allocator for buffers of `buf_len` bytes and map its reserved
    /// buffer. Fails only if the reserved buffer cannot be mapped.
    pub fn new(
        mapper: Arc<dyn DmaMapper>,
        source: Arc<dyn BufferSource>,
        buf_len: usize,
    ) -> DmaResult<Self> {
        let reserved = ReservedBuffer::new(&*mapper, buf_len)?;
        klog_debug!("nveth: reserved rx buffer {} ({} bytes)", reserved.addr, buf_len);
        Ok(Self {
            mapper,
            source,
            reserved: Some(reserved),
            buf_len,
            alloc_failed: AtomicU64::new(0),
        })
    }

    #[inline]
    pub fn buf_len(&self) -> usize {
        self.buf_len
    }

    #[inline]
    pub fn mapper(&self) -> &dyn DmaMapper {
        &*self.mapper
    }

    /// Allocation failures that fell back to the reserved buffer.
    #[inline]
    pub fn alloc_failed(&self) -> u64 {
        self.alloc_failed.load(Ordering::Relaxed)
    }

    /// Bus address of the reserved buffer while the channel is up.
    pub fn reserved_addr(&self) -> Option<DmaAddr> {
        self.reserved.as_ref().map(|r| r.addr)
    }

    /// Obtain a mapped buffer of `len` bytes for an Rx slot.
    ///
    /// Allocation failure substitutes the reserved buffer and succeeds.
    /// A mapping failure frees the new buffer and is returned as an error.
    pub fn acquire(&self, len: usize) -> DmaResult<RxBuffer> {
        let Some(buf) = self.source.alloc(len) else {
            self.alloc_failed.fetch_add(1, Ordering::Relaxed);
            let reserved = self.reserved.as_ref().ok_or(DmaError::NoMemory)?;
            klog_debug!("nveth: rx alloc failed, using reserved buffer");
            return Ok(RxBuffer::Reserved {
                addr: reserved.addr,
            });
        };
        match self.mapper.map(DmaDirection::FromDevice, buf.dma_area()) {
            Ok(addr) => Ok(RxBuffer::Dynamic { buf, addr }),
            Err(e) => {
                klog_warn!("nveth: rx buffer map failed: {}", e);
                Err(e)
            }
        }
    }

    /// Unmap and free a buffer that will not be delivered.
    pub fn release(&self, rx: RxBuffer) {
        if let RxBuffer::Dynamic { buf, addr } = rx {
            self.mapper
                .unmap(addr, buf.dma_area().len(), DmaDirection::FromDevice);
        }
    }

    /// Take a completed buffer back from the device for delivery.
    ///
    /// Syncs device writes into the buffer, unmaps it and exposes `len`
    /// bytes. The reserved buffer yields `None`.
    pub fn reclaim(&self, rx: RxBuffer, len: usize) -> Option<NetBuf> {
        match rx {
            RxBuffer::Reserved { .. } => None,
            RxBuffer::Dynamic { mut buf, addr } => {
                let area_len = buf.dma_area().len();
                self.mapper.sync_for_cpu(addr, buf.dma_area_mut());
                self.mapper.unmap(addr, area_len, DmaDirection::FromDevice);
                let _ = buf.set_len(len.min(area_len));
                Some(buf)
            }
        }
    }

    /// Unmap the reserved buffer. Called once the ring no longer references it.
    pub fn shutdown(&mut self) {
        if let Some(reserved) = self.reserved.take() {
            self.mapper.unmap(
                reserved.addr,
                reserved.storage.len(),
                DmaDirection::FromDevice,
            );
        }
    }
}

impl Drop for BufferAllocator {
    fn drop(&mut self) {
        self.shutdown();
    }
}
