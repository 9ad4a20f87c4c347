//! Error type for buffer allocation and DMA mapping.

use core::fmt;

/// Failure while obtaining or mapping a packet buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaError {
    /// The buffer source had no memory left.
    NoMemory,
    /// The mapper refused to map `len` bytes (IOMMU exhausted, bad range).
    MappingFailed { len: usize },
    /// Zero-length or over-long mapping request.
    InvalidLength { len: usize },
}

impl DmaError {
    /// Negative Linux errno for an OS boundary.
    pub const fn to_errno(&self) -> i32 {
        match self {
            Self::NoMemory => -12,             // ENOMEM
            Self::MappingFailed { .. } => -12, // ENOMEM
            Self::InvalidLength { .. } => -22, // EINVAL
        }
    }
}

impl fmt::Display for DmaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoMemory => write!(f, "out of memory for packet buffer"),
            Self::MappingFailed { len } => write!(f, "dma mapping of {} bytes failed", len),
            Self::InvalidLength { len } => write!(f, "invalid dma length {}", len),
        }
    }
}

/// Convenience result type for buffer operations.
pub type DmaResult<T = ()> = Result<T, DmaError>;
