//! Interface to the networking stack above the driver.

use nveth_abi::ChannelId;
use nveth_mm::NetBuf;

use super::Ipv4UdpFrame;

/// Outcome of offering one packet for transmit.
#[derive(Debug)]
pub enum TxVerdict {
    Accepted,
    /// Ring full; the queue has been stopped. The packet is handed back to
    /// be offered again after the wake.
    Stalled(NetBuf),
    /// The packet was consumed and discarded.
    Dropped,
}

pub trait Upstream: Send + Sync {
    /// Hand a received (or reassembled) frame to the stack.
    fn deliver(&self, chan: ChannelId, buf: NetBuf);

    /// Stop offering packets on `chan`.
    fn stop_queue(&self, chan: ChannelId);

    /// Resume offering packets on `chan`.
    fn wake_queue(&self, chan: ChannelId);

    /// Report the hardware transmit timestamp of a sent packet.
    fn tx_timestamp(&self, buf: NetBuf, ns: u64);

    /// Whether the socket owning this flow opted in to reassembly.
    fn gro_enabled(&self, frame: &Ipv4UdpFrame) -> bool;
}
