//! DMA channel vocabulary shared by the buffer and driver crates.

use core::fmt;

/// Direction of a streaming DMA mapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DmaDirection {
    /// CPU writes, device reads (transmit buffers).
    ToDevice,
    /// Device writes, CPU reads (receive buffers).
    FromDevice,
}

impl DmaDirection {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ToDevice => "to-device",
            Self::FromDevice => "from-device",
        }
    }
}

impl fmt::Display for DmaDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which half of a DMA channel an operation targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChannelDir {
    Tx,
    Rx,
}

impl ChannelDir {
    /// Mapping direction used for buffers on this half of the channel.
    #[inline]
    pub const fn dma_direction(self) -> DmaDirection {
        match self {
            Self::Tx => DmaDirection::ToDevice,
            Self::Rx => DmaDirection::FromDevice,
        }
    }
}

impl fmt::Display for ChannelDir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tx => f.write_str("tx"),
            Self::Rx => f.write_str("rx"),
        }
    }
}

/// Index of a DMA channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct ChannelId(pub u32);

impl ChannelId {
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch{}", self.0)
    }
}

/// Hardware-assigned identifier used to match a deferred transmit timestamp
/// with the packet it belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct PktId(pub u32);

/// MAC IP class. Decides ring size bounds and a few descriptor rules.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum MacClass {
    /// 1G controller.
    #[default]
    Eqos,
    /// 10G controller.
    Mgbe,
}

impl MacClass {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Eqos => "eqos",
            Self::Mgbe => "mgbe",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        if value.eq_ignore_ascii_case("eqos") {
            Some(Self::Eqos)
        } else if value.eq_ignore_ascii_case("mgbe") {
            Some(Self::Mgbe)
        } else {
            None
        }
    }

    /// Ring size used when none is configured or the configured one is invalid.
    pub const fn default_ring_size(self) -> usize {
        match self {
            Self::Eqos => 1024,
            Self::Mgbe => 4096,
        }
    }

    /// Largest ring the class supports for the given half of a channel.
    pub const fn max_ring_size(self, dir: ChannelDir) -> usize {
        match (self, dir) {
            (Self::Eqos, _) => 1024,
            (Self::Mgbe, ChannelDir::Tx) => 4096,
            (Self::Mgbe, ChannelDir::Rx) => 16384,
        }
    }
}

impl fmt::Display for MacClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Driver-wide constants
// =============================================================================

/// Smallest ring any class accepts.
pub const MIN_RING_SIZE: usize = 64;

/// Largest buffer length a single descriptor can describe.
pub const MAX_DESC_DATA_LEN: usize = 0x3FFF;

/// Rx descriptors consumed before a refill pass is run.
pub const RX_REFILL_THRESHOLD: usize = 16;

/// Default NAPI poll weight.
pub const NAPI_WEIGHT: usize = 64;

/// Largest segmentation-offload payload the stack hands down.
pub const GSO_MAX_SIZE: usize = 65536;

/// Largest number of page fragments a transmit packet may carry.
pub const MAX_SKB_FRAGS: usize = 17;

/// Descriptors a maximum-size linear region can split into.
pub const TX_MAX_SPLIT: usize = GSO_MAX_SIZE / MAX_DESC_DATA_LEN + 1;

/// Free Tx descriptors required to accept one more worst-case packet.
///
/// Fragments plus linear split plus one context and one header slot.
pub const TX_DESC_THRESHOLD: usize = MAX_SKB_FRAGS + TX_MAX_SPLIT + 2;

/// Maximum supported DMA channels.
pub const MAX_DMA_CHANNELS: usize = 8;
