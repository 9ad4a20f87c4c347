//! Packets waiting for a deferred hardware transmit timestamp.
//!
//! On MGBE the transmit timestamp is not written back into the descriptor.
//! The completion path parks the sent buffer here under its packet id and a
//! worker later asks hardware for the sample. Nodes older than
//! [`TS_NODE_EXPIRY_MS`] are discarded on every add and every scan.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

use nveth_abi::{ChannelId, PktId};
use nveth_lib::{elapsed_ms, klog_debug, klog_warn};
use nveth_mm::NetBuf;
use spin::Mutex;

use super::hw::{DmaEngine, TsQuery};
use super::types::{EtherError, EtherResult};
use super::upstream::Upstream;

pub const TS_NODE_EXPIRY_MS: u64 = 1000;
/// Delay before a scan that returned `WouldBlock` should run again.
pub const TS_RETRY_MS: u64 = 1;
pub const MAX_PENDING_TS_PER_CHANNEL: usize = 64;

#[derive(Debug)]
struct TsNode {
    buf: NetBuf,
    pktid: PktId,
    chan: ChannelId,
    stamped_ms: u64,
}

pub struct TxTimestampList {
    nodes: Mutex<Vec<TsNode>>,
    capacity: usize,
    running: AtomicBool,
}

impl TxTimestampList {
    pub fn new(channels: usize) -> Self {
        let capacity = MAX_PENDING_TS_PER_CHANNEL * channels.max(1);
        Self {
            nodes: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
            running: AtomicBool::new(false),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.nodes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn expire(nodes: &mut Vec<TsNode>, now_ms: u64) {
        nodes.retain(|n| {
            let keep = elapsed_ms(now_ms, n.stamped_ms) < TS_NODE_EXPIRY_MS;
            if !keep {
                klog_debug!("nveth: {} tx timestamp {:#x} expired", n.chan, n.pktid.0);
            }
            keep
        });
    }

    /// Park `buf` until hardware reports the timestamp for `pktid`.
    ///
    /// With the pool exhausted the buffer is dropped.
    pub fn add(&self, buf: NetBuf, pktid: PktId, chan: ChannelId, now_ms: u64) -> EtherResult {
        let mut nodes = self.nodes.lock();
        Self::expire(&mut nodes, now_ms);
        if nodes.len() >= self.capacity {
            drop(nodes);
            klog_warn!("nveth: {} no free timestamp node for {:#x}", chan, pktid.0);
            return Err(EtherError::NoTimestampNode);
        }
        nodes.push(TsNode {
            buf,
            pktid,
            chan,
            stamped_ms: now_ms,
        });
        Ok(())
    }

    /// Query hardware for every parked packet.
    ///
    /// Ready timestamps are delivered and missed ones discarded. Returns
    /// `WouldBlock` while nodes remain, or if another scan is running, so
    /// the caller retries after [`TS_RETRY_MS`].
    pub fn process(&self, hw: &dyn DmaEngine, upstream: &dyn Upstream, now_ms: u64) -> EtherResult {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(EtherError::WouldBlock);
        }

        let mut ready = Vec::new();
        let remaining = {
            let mut nodes = self.nodes.lock();
            Self::expire(&mut nodes, now_ms);
            let mut i = 0;
            while i < nodes.len() {
                match hw.tx_timestamp(nodes[i].pktid) {
                    TsQuery::Ready(ns) => ready.push((nodes.swap_remove(i).buf, ns)),
                    TsQuery::Missed => {
                        let node = nodes.swap_remove(i);
                        klog_debug!("nveth: {} tx timestamp {:#x} missed", node.chan, node.pktid.0);
                    }
                    TsQuery::Pending => i += 1,
                }
            }
            nodes.len()
        };

        for (buf, ns) in ready {
            upstream.tx_timestamp(buf, ns);
        }
        self.running.store(false, Ordering::Release);

        if remaining > 0 {
            Err(EtherError::WouldBlock)
        } else {
            Ok(())
        }
    }

    /// Drop every node belonging to `chan`.
    pub fn release_channel(&self, chan: ChannelId) -> usize {
        let mut nodes = self.nodes.lock();
        let before = nodes.len();
        nodes.retain(|n| n.chan != chan);
        before - nodes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::test_fixtures::{MockHw, RecordingUpstream};

    const CH0: ChannelId = ChannelId(0);

    #[test]
    fn ready_missed_and_pending() {
        let list = TxTimestampList::new(1);
        let hw = MockHw::new();
        let up = RecordingUpstream::new();
        for id in 1..=3 {
            assert!(list.add(NetBuf::from_slice(&[id as u8]), PktId(id), CH0, 0).is_ok());
        }
        hw.set_timestamp(PktId(1), TsQuery::Ready(1_000));
        hw.set_timestamp(PktId(2), TsQuery::Missed);

        assert_eq!(list.process(&hw, &up, 0), Err(EtherError::WouldBlock));
        assert_eq!(list.len(), 1);
        assert_eq!(up.timestamps(), [(alloc::vec![1u8], 1_000)]);

        hw.set_timestamp(PktId(3), TsQuery::Ready(3_000));
        assert_eq!(list.process(&hw, &up, 1), Ok(()));
        assert!(list.is_empty());
    }

    #[test]
    fn pool_exhaustion_drops() {
        let list = TxTimestampList::new(1);
        for id in 0..64 {
            assert!(list.add(NetBuf::from_slice(&[0]), PktId(id), CH0, 10).is_ok());
        }
        assert_eq!(
            list.add(NetBuf::from_slice(&[0]), PktId(99), CH0, 10),
            Err(EtherError::NoTimestampNode)
        );
        // Aged nodes are reclaimed before the capacity check.
        assert!(list.add(NetBuf::from_slice(&[0]), PktId(99), CH0, 1010).is_ok());
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn release_channel_only_drops_that_channel() {
        let list = TxTimestampList::new(2);
        assert_eq!(list.capacity(), 128);
        assert!(list.add(NetBuf::from_slice(&[0]), PktId(1), CH0, 0).is_ok());
        assert!(list.add(NetBuf::from_slice(&[0]), PktId(2), ChannelId(1), 0).is_ok());
        assert_eq!(list.release_channel(CH0), 1);
        assert_eq!(list.len(), 1);
    }
}
