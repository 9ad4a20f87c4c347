//! Error type for the packet movement engine.

use core::fmt;

use nveth_abi::{ChannelDir, ChannelId};
use nveth_mm::DmaError;

/// Driver error.
///
/// Internal code uses `EtherError` exclusively. Conversion to a negative
/// errno happens at the OS boundary via [`to_errno`](EtherError::to_errno).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EtherError {
    /// Ring size is not a power of two or outside the class bounds.
    InvalidRingSize { dir: ChannelDir, size: usize },
    /// No free descriptors for the request.
    RingFull,
    /// Buffer allocation or mapping failed.
    Dma(DmaError),
    /// Work remains; call again later.
    WouldBlock,
    /// Channel is not open.
    NotRunning(ChannelId),
    InvalidArgument,
    /// Pending timestamp pool exhausted.
    NoTimestampNode,
}

impl EtherError {
    pub const fn to_errno(&self) -> i32 {
        match self {
            Self::InvalidRingSize { .. } => -22, // EINVAL
            Self::RingFull => -16,               // EBUSY
            Self::Dma(e) => e.to_errno(),
            Self::WouldBlock => -11,     // EAGAIN
            Self::NotRunning(_) => -100, // ENETDOWN
            Self::InvalidArgument => -22,
            Self::NoTimestampNode => -12, // ENOMEM
        }
    }
}

impl From<DmaError> for EtherError {
    fn from(e: DmaError) -> Self {
        Self::Dma(e)
    }
}

impl fmt::Display for EtherError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidRingSize { dir, size } => {
                write!(f, "invalid {} ring size {}", dir, size)
            }
            Self::RingFull => write!(f, "descriptor ring full"),
            Self::Dma(e) => write!(f, "dma: {}", e),
            Self::WouldBlock => write!(f, "operation would block"),
            Self::NotRunning(ch) => write!(f, "channel {} not running", ch),
            Self::InvalidArgument => write!(f, "invalid argument"),
            Self::NoTimestampNode => write!(f, "no free timestamp node"),
        }
    }
}

pub type EtherResult<T = ()> = Result<T, EtherError>;
