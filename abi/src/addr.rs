//! Bus address type for DMA-visible memory.
//!
//! Descriptors carry the address the DMA engine reads or writes, which is
//! neither a kernel virtual address nor necessarily a CPU physical address
//! (an IOMMU may sit in between). `DmaAddr` keeps that distinction in the
//! type system. It is `#[repr(transparent)]` over `u64`.
//!
//! # Example
//!
//! ```ignore
//! use nveth_abi::addr::DmaAddr;
//!
//! let addr = DmaAddr::new(0x8000_1000);
//! assert_eq!(addr.lower_32(), 0x8000_1000);
//! assert_eq!(addr.upper_32(), 0);
//! ```

use core::fmt;

/// An address as seen by the DMA engine.
///
/// Obtained from a mapping operation and only valid until the matching unmap.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct DmaAddr(pub u64);

impl DmaAddr {
    /// The null bus address. Never handed to hardware.
    pub const NULL: Self = Self(0);

    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Address `offset` bytes past this one.
    ///
    /// Returns `None` on overflow so a bogus mapping can never wrap into a
    /// low address the device might own.
    #[inline]
    pub const fn checked_add(self, offset: u64) -> Option<Self> {
        match self.0.checked_add(offset) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    /// Low 32 bits, as programmed into the first address word of a descriptor.
    #[inline]
    pub const fn lower_32(self) -> u32 {
        self.0 as u32
    }

    /// High 32 bits, as programmed into the second address word of a descriptor.
    #[inline]
    pub const fn upper_32(self) -> u32 {
        (self.0 >> 32) as u32
    }
}

impl fmt::LowerHex for DmaAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl fmt::Display for DmaAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dma:{:#x}", self.0)
    }
}

impl From<u64> for DmaAddr {
    #[inline]
    fn from(addr: u64) -> Self {
        Self(addr)
    }
}

impl From<DmaAddr> for u64 {
    #[inline]
    fn from(addr: DmaAddr) -> Self {
        addr.0
    }
}
