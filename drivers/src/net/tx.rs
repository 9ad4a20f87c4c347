//! Transmit half of a DMA channel.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use nveth_abi::{ChannelDir, ChannelId, DmaDirection, MacClass, PktId, TX_DESC_THRESHOLD};
use nveth_lib::{klog_debug, klog_error, klog_warn};
use nveth_mm::{NetBuf, TxOffloadFlags};
use spin::Mutex;

use super::channel::EtherDeps;
use super::config::{EtherConfig, PtpMode};
use super::hw::{CompletionBacklog, DescBatch, TxStatus};
use super::napi::NapiContext;
use super::ring::DescRing;
use super::segmenter::{self, SegmentError, SegmentParams, TxSlotFlags, TxSwcx};
use super::stats::ChannelStats;
use super::tstamp::TxTimestampList;
use super::types::EtherResult;
use super::upstream::TxVerdict;

/// Work found while reclaiming that must run without the ring lock held.
enum TxDone {
    Stamp(NetBuf, u64),
    Defer(NetBuf, PktId),
}

struct TxState {
    ring: DescRing<TxSwcx>,
    backlog: CompletionBacklog<TxStatus>,
    /// Set by `drain`; nothing is posted afterwards.
    closed: bool,
}

pub struct TxChannel {
    id: ChannelId,
    state: Mutex<TxState>,
    stopped: AtomicBool,
    pktid_seq: AtomicU32,
    mac: MacClass,
    ptp: PtpMode,
    pub napi: NapiContext,
}

impl TxChannel {
    pub fn new(id: ChannelId, cfg: &EtherConfig) -> EtherResult<Self> {
        Ok(Self {
            id,
            state: Mutex::new(TxState {
                ring: DescRing::new(cfg.tx_ring_size, cfg.mac, ChannelDir::Tx)?,
                backlog: CompletionBacklog::new(),
                closed: false,
            }),
            stopped: AtomicBool::new(false),
            pktid_seq: AtomicU32::new(0),
            mac: cfg.mac,
            ptp: cfg.ptp,
            napi: NapiContext::new(cfg.napi_budget),
        })
    }

    #[inline]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn available(&self) -> usize {
        self.state.lock().ring.available()
    }

    /// Next deferred-timestamp id: a 28-bit per-channel sequence with the
    /// channel number in the top nibble.
    fn next_pktid(&self) -> PktId {
        let seq = self.pktid_seq.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        PktId((seq & 0x0FFF_FFFF) | ((self.id.0 & 0xF) << 28))
    }

    fn stop_queue(&self, deps: &EtherDeps, stats: &ChannelStats) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            stats.tx_stalls.inc();
            klog_debug!("nveth: {} tx queue stopped", self.id);
            deps.upstream.stop_queue(self.id);
        }
    }

    /// Wake the queue if it is stopped and the ring has room again.
    fn maybe_wake(&self, deps: &EtherDeps, stats: &ChannelStats, available: usize) {
        if available > TX_DESC_THRESHOLD && self.stopped.swap(false, Ordering::AcqRel) {
            stats.tx_wakes.inc();
            klog_debug!("nveth: {} tx queue woken, {} free", self.id, available);
            deps.upstream.wake_queue(self.id);
        }
    }

    pub fn start_xmit(&self, deps: &EtherDeps, stats: &ChannelStats, pkt: NetBuf) -> TxVerdict {
        let meta = pkt.meta;
        let pktid = (self.mac == MacClass::Mgbe
            && self.ptp == PtpMode::TwoStep
            && meta.tx.flags.contains(TxOffloadFlags::PTP))
        .then(|| self.next_pktid());
        let params = SegmentParams {
            mac: self.mac,
            ptp: self.ptp,
            pktid,
        };

        let result = {
            let mut guard = self.state.lock();
            if guard.closed {
                klog_debug!("nveth: {} tx closed, dropping packet", self.id);
                stats.tx_dropped.inc();
                return TxVerdict::Dropped;
            }
            let ring = &mut guard.ring;
            segmenter::plan(ring, &*deps.mapper, pkt, params)
                .and_then(|batch| batch.commit(ring))
                .map(|descs| {
                    deps.hw.submit(self.id, DescBatch::Tx(&descs));
                    ring.available()
                })
        };

        match result {
            Ok(available) => {
                if meta.vlan.is_some() {
                    stats.tx_vlan.inc();
                }
                if meta.tx.gso.is_some() {
                    stats.tx_tso.inc();
                }
                if available <= TX_DESC_THRESHOLD {
                    self.stop_queue(deps, stats);
                    // A reclaim may have run between the commit and the stop.
                    self.maybe_wake(deps, stats, self.available());
                }
                TxVerdict::Accepted
            }
            Err(failure) => match failure.error {
                SegmentError::RingFull => {
                    klog_debug!("nveth: {} tx ring full", self.id);
                    self.stop_queue(deps, stats);
                    TxVerdict::Stalled(failure.pkt)
                }
                SegmentError::Map(_) | SegmentError::Oversized { .. } => {
                    klog_warn!("nveth: {} dropping tx packet: {}", self.id, failure.error);
                    stats.tx_dropped.inc();
                    TxVerdict::Dropped
                }
            },
        }
    }

    /// Reclaim up to `budget` finished descriptors. Returns how many.
    pub fn reclaim(
        &self,
        deps: &EtherDeps,
        stats: &ChannelStats,
        tstamps: &TxTimestampList,
        budget: usize,
    ) -> usize {
        let mut deferred = Vec::new();
        let (processed, available) = {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            let (done, excess) = st
                .backlog
                .next_batch(budget, |want| deps.hw.poll_tx_completions(self.id, want));
            if excess > 0 {
                klog_error!(
                    "nveth: {} {} tx completions over budget {}, held for next poll",
                    self.id,
                    excess,
                    budget
                );
                stats.poll_anomalies.inc();
            }

            let ring = &mut st.ring;
            let n = ring.complete(done.count());
            if n < done.count() {
                klog_error!(
                    "nveth: {} hardware completed {} tx descriptors, {} in flight",
                    self.id,
                    done.count(),
                    n
                );
                stats.poll_anomalies.inc();
                // Statuses past the in-flight count describe nothing we posted.
                st.backlog.clear();
            } else if n == 0 && done.more_pending {
                klog_error!("nveth: {} tx completion made no progress", self.id);
                stats.poll_anomalies.inc();
            }

            let mut processed = 0;
            for status in done.done.into_iter().take(n) {
                let Some((_, swcx)) = ring.reclaim() else {
                    break;
                };
                processed += 1;
                if swcx.flags.contains(TxSlotFlags::CONTEXT) {
                    continue;
                }
                stats.tx_bytes.add(swcx.len as u64);
                deps.mapper
                    .unmap(swcx.addr, swcx.len, DmaDirection::ToDevice);

                let Some(buf) = swcx.buf else {
                    continue;
                };
                if status.error {
                    stats.tx_errors.inc();
                } else {
                    stats.tx_packets.inc();
                }
                if let Some(ns) = status.tstamp_ns {
                    deferred.push(TxDone::Stamp(buf, ns));
                } else if swcx.flags.contains(TxSlotFlags::TS_DELAYED)
                    && let Some(pktid) = swcx.pktid
                {
                    deferred.push(TxDone::Defer(buf, pktid));
                }
            }
            (processed, ring.available())
        };

        for done in deferred {
            match done {
                TxDone::Stamp(buf, ns) => deps.upstream.tx_timestamp(buf, ns),
                TxDone::Defer(buf, pktid) => {
                    // Pool exhaustion is logged by the list; the buffer is gone.
                    let _ = tstamps.add(buf, pktid, self.id, deps.clock.now_ms());
                }
            }
        }

        self.maybe_wake(deps, stats, available);
        processed
    }

    /// Stop the upstream queue for good ahead of teardown.
    pub fn shutdown_queue(&self, deps: &EtherDeps) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            deps.upstream.stop_queue(self.id);
        }
    }

    /// Unmap and free everything still on the ring and refuse further
    /// packets. Hardware must be idle.
    pub fn drain(&self, deps: &EtherDeps) -> usize {
        let slots = {
            let mut st = self.state.lock();
            st.closed = true;
            st.backlog.clear();
            st.ring.drain()
        };
        let count = slots.len();
        for swcx in slots {
            if !swcx.flags.contains(TxSlotFlags::CONTEXT) {
                deps.mapper
                    .unmap(swcx.addr, swcx.len, DmaDirection::ToDevice);
            }
        }
        count
    }
}
