//! Receive half of a DMA channel.
//!
//! Slots whose buffer was not consumed (context write-backs, frames split
//! across descriptors) keep their mapping and go onto a recycle stash;
//! refill re-posts stashed buffers before allocating new ones.

use alloc::vec::Vec;

use nveth_abi::{ChannelDir, ChannelId};
use nveth_lib::spsc::Producer;
use nveth_lib::{klog_debug, klog_error, klog_warn};
use nveth_mm::{BufferAllocator, CsumState, NetBuf, RxBuffer};
use spin::Mutex;

use super::channel::EtherDeps;
use super::config::EtherConfig;
use super::hw::{CompletionBacklog, DescBatch, DmaEngine, RxDescriptor, RxStatus};
use super::napi::NapiContext;
use super::nvgro::NvgroSegment;
use super::parse_ipv4_udp;
use super::ring::DescRing;
use super::stats::ChannelStats;
use super::types::EtherResult;

struct RxState {
    ring: DescRing<RxBuffer>,
    alloc: BufferAllocator,
    stash: Vec<RxBuffer>,
    backlog: CompletionBacklog<RxStatus>,
}

impl RxState {
    /// Post buffers into every free slot, stopping at the first mapping
    /// failure. Rings the doorbell once for whatever was posted.
    fn refill(&mut self, id: ChannelId, hw: &dyn DmaEngine) -> usize {
        let buf_len = self.alloc.buf_len();
        let mut descs = Vec::new();
        while self.ring.free_slots() > 0 {
            let rx = match self.stash.pop() {
                Some(rx) => rx,
                None => match self.alloc.acquire(buf_len) {
                    Ok(rx) => rx,
                    Err(e) => {
                        klog_warn!("nveth: {} rx refill stopped: {}", id, e);
                        break;
                    }
                },
            };
            let addr = rx.addr();
            if let Err(rx) = self.ring.post(rx) {
                self.stash.push(rx);
                break;
            }
            descs.push(RxDescriptor {
                addr,
                buf_len: buf_len as u32,
            });
        }
        if !descs.is_empty() {
            hw.submit(id, DescBatch::Rx(&descs));
        }
        descs.len()
    }
}

pub struct RxChannel {
    id: ChannelId,
    state: Mutex<RxState>,
    nvgro: Mutex<Option<Producer<NvgroSegment>>>,
    pub napi: NapiContext,
}

impl RxChannel {
    pub fn new(id: ChannelId, cfg: &EtherConfig, deps: &EtherDeps) -> EtherResult<Self> {
        let ring = DescRing::new(cfg.rx_ring_size, cfg.mac, ChannelDir::Rx)?;
        let alloc = BufferAllocator::new(deps.mapper.clone(), deps.source.clone(), cfg.rx_buf_len)?;
        Ok(Self {
            id,
            state: Mutex::new(RxState {
                ring,
                alloc,
                stash: Vec::new(),
                backlog: CompletionBacklog::new(),
            }),
            nvgro: Mutex::new(None),
            napi: NapiContext::new(cfg.napi_budget),
        })
    }

    /// Route eligible frames to reassembly through `producer`.
    pub fn attach_nvgro(&self, producer: Producer<NvgroSegment>) {
        *self.nvgro.lock() = Some(producer);
    }

    pub fn refill(&self, hw: &dyn DmaEngine) -> usize {
        self.state.lock().refill(self.id, hw)
    }

    /// Buffers currently posted to hardware.
    pub fn posted(&self) -> usize {
        self.state.lock().ring.in_flight()
    }

    pub fn alloc_failed(&self) -> u64 {
        self.state.lock().alloc.alloc_failed()
    }

    /// Process up to `budget` completed descriptors. Returns how many.
    pub fn poll(&self, deps: &EtherDeps, stats: &ChannelStats, budget: usize) -> usize {
        let mut ready = Vec::new();
        let mut processed = 0;
        {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            let (done, excess) = st
                .backlog
                .next_batch(budget, |want| deps.hw.poll_rx_completions(self.id, want));
            if excess > 0 {
                klog_error!(
                    "nveth: {} {} rx completions over budget {}, held for next poll",
                    self.id,
                    excess,
                    budget
                );
                stats.poll_anomalies.inc();
            }

            let n = st.ring.complete(done.count());
            if n < done.count() {
                klog_error!(
                    "nveth: {} hardware completed {} rx descriptors, {} posted",
                    self.id,
                    done.count(),
                    n
                );
                stats.poll_anomalies.inc();
                st.backlog.clear();
            } else if n == 0 && done.more_pending {
                klog_error!("nveth: {} rx completion made no progress", self.id);
                stats.poll_anomalies.inc();
            }

            for status in done.done.into_iter().take(n) {
                let Some((_, rx)) = st.ring.reclaim() else {
                    break;
                };
                processed += 1;

                if rx.is_reserved() {
                    // Frame landed in the fallback buffer; nothing to deliver.
                    stats.rx_reserved.inc();
                    continue;
                }
                if status.context || !(status.first && status.last) {
                    stats.rx_split.inc();
                    st.stash.push(rx);
                    continue;
                }
                if status.error {
                    stats.rx_errors.inc();
                    st.alloc.release(rx);
                    continue;
                }
                let Some(mut buf) = st.alloc.reclaim(rx, status.len) else {
                    continue;
                };
                if status.csum_ok {
                    buf.meta.csum = CsumState::Unnecessary;
                }
                buf.meta.hash = status.hash;
                buf.meta.vlan = status.vlan;
                buf.meta.hw_tstamp_ns = status.tstamp_ns;
                stats.rx_packets.inc();
                stats.rx_bytes.add(buf.len() as u64);
                ready.push(buf);
            }

            if st.ring.refill_due() {
                st.refill(self.id, &*deps.hw);
            }
        }

        for buf in ready {
            self.forward(deps, buf);
        }
        processed
    }

    /// Offer `buf` to reassembly, or deliver it directly.
    fn forward(&self, deps: &EtherDeps, buf: NetBuf) {
        let Some(frame) = parse_ipv4_udp(buf.as_slice()) else {
            return deps.upstream.deliver(self.id, buf);
        };
        if !deps.upstream.gro_enabled(&frame) {
            return deps.upstream.deliver(self.id, buf);
        }
        let mut guard = self.nvgro.lock();
        let Some(producer) = guard.as_mut() else {
            return deps.upstream.deliver(self.id, buf);
        };
        let seg = NvgroSegment::new(buf, self.id, &frame, deps.clock.now_ms());
        if let Err(seg) = producer.try_push(seg) {
            klog_debug!("nveth: {} nvgro queue full, delivering directly", self.id);
            deps.upstream.deliver(self.id, seg.buf);
        }
    }

    /// Release every buffer and the reserved mapping. Hardware must be idle.
    pub fn drain(&self) -> usize {
        self.nvgro.lock().take();
        let mut st = self.state.lock();
        st.backlog.clear();
        let posted = st.ring.drain();
        let count = posted.len();
        for rx in posted {
            st.alloc.release(rx);
        }
        while let Some(rx) = st.stash.pop() {
            st.alloc.release(rx);
        }
        st.alloc.shutdown();
        count
    }
}
