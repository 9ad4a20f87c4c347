//! Streaming DMA mapping interface.
//!
//! The engine never programs an IOMMU itself; the embedding kernel provides
//! a [`DmaMapper`]. Every successful [`map`](DmaMapper::map) must be paired
//! with exactly one [`unmap`](DmaMapper::unmap) of the same address, length
//! and direction.

use nveth_abi::{DmaAddr, DmaDirection};

use crate::error::DmaResult;

pub trait DmaMapper: Send + Sync {
    /// Make `buf` visible to the device and return its bus address.
    fn map(&self, dir: DmaDirection, buf: &[u8]) -> DmaResult<DmaAddr>;

    /// Tear down a mapping created by [`map`](DmaMapper::map).
    fn unmap(&self, addr: DmaAddr, len: usize, dir: DmaDirection);

    /// Make device writes to `addr` visible in `buf` before the CPU reads it.
    ///
    /// Coherent platforms need nothing here.
    fn sync_for_cpu(&self, _addr: DmaAddr, _buf: &mut [u8]) {}
}
