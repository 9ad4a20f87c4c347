//! Packet buffers and DMA mapping for the nveth rings.

#![no_std]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod allocator;
pub mod dma;
pub mod error;
pub mod netbuf;
#[cfg(any(test, feature = "itests"))]
pub mod test_fixtures;

pub use allocator::{BufferAllocator, BufferSource, HeapSource, QuotaSource, RxBuffer};
pub use dma::DmaMapper;
pub use error::{DmaError, DmaResult};
pub use netbuf::{BufMeta, CsumState, Gso, GsoKind, NetBuf, TxOffload, TxOffloadFlags};
