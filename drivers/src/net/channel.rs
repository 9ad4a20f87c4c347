//! Driver instance: every DMA channel plus the state they share.
//!
//! # Interrupt and poll flow
//!
//! ```text
//!   isr(chan, dir)            irq off, schedule poll
//!   poll(chan, dir)           reclaim up to budget
//!     processed <  budget  -> poll done, irq back on
//!     processed == budget  -> stay scheduled, irq stays off
//!     teardown pending     -> poll stopped, irq stays off
//! ```
//!
//! All counters live in the context; nothing here is global.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

use nveth_abi::{ChannelDir, ChannelId};
use nveth_lib::spsc;
use nveth_lib::{MonotonicClock, klog_error, klog_info, klog_warn};
use nveth_mm::{BufferSource, DmaMapper, NetBuf};

use super::config::EtherConfig;
use super::hw::DmaEngine;
use super::napi::NapiContext;
use super::nvgro::NvgroTask;
use super::rx::RxChannel;
use super::stats::{ChannelStats, ChannelStatsSnapshot};
use super::tstamp::TxTimestampList;
use super::tx::TxChannel;
use super::types::{EtherError, EtherResult};
use super::upstream::{TxVerdict, Upstream};

/// Everything the engine calls out to.
#[derive(Clone)]
pub struct EtherDeps {
    pub hw: Arc<dyn DmaEngine>,
    pub upstream: Arc<dyn Upstream>,
    pub mapper: Arc<dyn DmaMapper>,
    pub source: Arc<dyn BufferSource>,
    pub clock: Arc<dyn MonotonicClock>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PollOutcome {
    /// Under budget; the interrupt is re-armed.
    Done { processed: usize },
    /// Budget used up; poll again, the interrupt stays masked.
    Reschedule { processed: usize },
    /// No poll was pending.
    NotScheduled,
    /// Channel is being torn down; the interrupt stays masked.
    Stopped { processed: usize },
}

struct Channel {
    id: ChannelId,
    tx: TxChannel,
    rx: RxChannel,
    stats: ChannelStats,
    running: AtomicBool,
}

impl Channel {
    fn napi(&self, dir: ChannelDir) -> &NapiContext {
        match dir {
            ChannelDir::Tx => &self.tx.napi,
            ChannelDir::Rx => &self.rx.napi,
        }
    }
}

pub struct EtherContext {
    cfg: EtherConfig,
    deps: EtherDeps,
    channels: Vec<Channel>,
    tstamps: TxTimestampList,
}

impl EtherContext {
    /// Bring up every configured channel.
    ///
    /// Receive rings are filled completely and both interrupts enabled. When
    /// reassembly is on, the returned task must be run by the host; it is the
    /// only consumer of the receive paths' segment channels.
    pub fn open(cfg: EtherConfig, deps: EtherDeps) -> EtherResult<(Self, Option<NvgroTask>)> {
        let mut cfg = cfg;
        cfg.sanitize();
        klog_info!(
            "nveth: {} with {} channel(s), tx ring {}, rx ring {}, nvgro {}",
            cfg.mac,
            cfg.channels,
            cfg.tx_ring_size,
            cfg.rx_ring_size,
            if cfg.nvgro { "on" } else { "off" }
        );

        let mut task = cfg.nvgro.then(|| {
            NvgroTask::new(
                cfg.nvgro_pkt_age_ms,
                cfg.nvgro_timer_ms,
                deps.upstream.clone(),
                deps.clock.clone(),
            )
        });

        let count = cfg.channels;
        let mut ctx = Self {
            cfg,
            deps,
            channels: Vec::with_capacity(count as usize),
            tstamps: TxTimestampList::new(count as usize),
        };
        // On error the partially built context drops and tears down the
        // channels opened so far.
        for i in 0..count {
            ctx.open_channel(ChannelId(i), task.as_mut())?;
        }
        Ok((ctx, task))
    }

    fn open_channel(&mut self, id: ChannelId, task: Option<&mut NvgroTask>) -> EtherResult {
        let tx = TxChannel::new(id, &self.cfg)?;
        let rx = RxChannel::new(id, &self.cfg, &self.deps)?;
        if let Some(task) = task {
            let (producer, consumer) = spsc::channel(self.cfg.rx_ring_size);
            rx.attach_nvgro(producer);
            task.add_input(consumer);
        }
        let posted = rx.refill(&*self.deps.hw);
        self.deps.hw.irq_enable(id, ChannelDir::Tx);
        self.deps.hw.irq_enable(id, ChannelDir::Rx);
        klog_info!("nveth: {} up, {} rx buffers posted", id, posted);
        self.channels.push(Channel {
            id,
            tx,
            rx,
            stats: ChannelStats::default(),
            running: AtomicBool::new(true),
        });
        Ok(())
    }

    #[inline]
    pub fn config(&self) -> &EtherConfig {
        &self.cfg
    }

    fn channel(&self, id: ChannelId) -> EtherResult<&Channel> {
        self.channels
            .get(id.index())
            .filter(|ch| ch.running.load(Ordering::Acquire))
            .ok_or(EtherError::NotRunning(id))
    }

    /// Offer one packet for transmit on `chan`.
    pub fn start_xmit(&self, chan: ChannelId, pkt: NetBuf) -> TxVerdict {
        match self.channel(chan) {
            Ok(ch) => ch.tx.start_xmit(&self.deps, &ch.stats, pkt),
            Err(e) => {
                klog_warn!("nveth: xmit on {}: {}", chan, e);
                TxVerdict::Dropped
            }
        }
    }

    /// Interrupt entry. Masks the interrupt and schedules a poll.
    ///
    /// Returns whether a poll was newly scheduled.
    pub fn isr(&self, chan: ChannelId, dir: ChannelDir) -> bool {
        let Ok(ch) = self.channel(chan) else {
            return false;
        };
        self.deps.hw.irq_disable(chan, dir);
        match dir {
            ChannelDir::Tx => ch.stats.tx_irq.inc(),
            ChannelDir::Rx => ch.stats.rx_irq.inc(),
        }
        let napi = ch.napi(dir);
        if napi.schedule() {
            return true;
        }
        if !napi.is_disabled() {
            ch.stats.napi_already_scheduled.inc();
            klog_error!("nveth: {} {} irq with poll already scheduled", chan, dir);
        }
        false
    }

    /// Run one scheduled poll of `dir` on `chan`.
    pub fn poll(&self, chan: ChannelId, dir: ChannelDir) -> EtherResult<PollOutcome> {
        let ch = self.channel(chan)?;
        let napi = ch.napi(dir);
        if !napi.begin_poll() {
            return Ok(PollOutcome::NotScheduled);
        }
        let budget = napi.budget();
        let processed = match dir {
            ChannelDir::Tx => ch.tx.reclaim(&self.deps, &ch.stats, &self.tstamps, budget),
            ChannelDir::Rx => ch.rx.poll(&self.deps, &ch.stats, budget),
        };
        if processed < budget {
            let _arm = napi.arm_guard();
            if !napi.complete() {
                return Ok(PollOutcome::Stopped { processed });
            }
            self.deps.hw.irq_enable(chan, dir);
            Ok(PollOutcome::Done { processed })
        } else if napi.reschedule() {
            Ok(PollOutcome::Reschedule { processed })
        } else {
            Ok(PollOutcome::Stopped { processed })
        }
    }

    pub fn poll_tx(&self, chan: ChannelId) -> EtherResult<PollOutcome> {
        self.poll(chan, ChannelDir::Tx)
    }

    pub fn poll_rx(&self, chan: ChannelId) -> EtherResult<PollOutcome> {
        self.poll(chan, ChannelDir::Rx)
    }

    /// Collect deferred transmit timestamps. `WouldBlock` means retry after
    /// [`TS_RETRY_MS`](super::tstamp::TS_RETRY_MS).
    pub fn process_tx_timestamps(&self) -> EtherResult {
        self.tstamps
            .process(&*self.deps.hw, &*self.deps.upstream, self.deps.clock.now_ms())
    }

    pub fn pending_timestamps(&self) -> usize {
        self.tstamps.len()
    }

    /// Stop `chan` and release everything it owns.
    ///
    /// The upstream queue is stopped first. Each direction then waits out
    /// its running poll and masks its interrupt, so nothing touches the rings
    /// while they are drained.
    pub fn teardown(&self, chan: ChannelId) -> EtherResult {
        let ch = self.channel(chan)?;
        if !ch.running.swap(false, Ordering::AcqRel) {
            return Err(EtherError::NotRunning(chan));
        }
        ch.tx.shutdown_queue(&self.deps);
        for dir in [ChannelDir::Tx, ChannelDir::Rx] {
            let napi = ch.napi(dir);
            napi.disable();
            let _arm = napi.arm_guard();
            self.deps.hw.irq_disable(chan, dir);
        }
        let tx = ch.tx.drain(&self.deps);
        let rx = ch.rx.drain();
        let ts = self.tstamps.release_channel(chan);
        klog_info!(
            "nveth: {} down, released {} tx / {} rx slots, {} timestamp nodes",
            chan,
            tx,
            rx,
            ts
        );
        Ok(())
    }

    pub fn stats(&self, chan: ChannelId) -> Option<ChannelStatsSnapshot> {
        self.channels.get(chan.index()).map(|ch| ch.stats.snapshot())
    }

    pub fn tx_stopped(&self, chan: ChannelId) -> bool {
        self.channel(chan).is_ok_and(|ch| ch.tx.is_stopped())
    }

    pub fn tx_available(&self, chan: ChannelId) -> usize {
        self.channel(chan).map_or(0, |ch| ch.tx.available())
    }

    pub fn rx_posted(&self, chan: ChannelId) -> usize {
        self.channel(chan).map_or(0, |ch| ch.rx.posted())
    }

    pub fn rx_alloc_failed(&self, chan: ChannelId) -> u64 {
        self.channels
            .get(chan.index())
            .map_or(0, |ch| ch.rx.alloc_failed())
    }
}

impl Drop for EtherContext {
    fn drop(&mut self) {
        let running: Vec<ChannelId> = self
            .channels
            .iter()
            .filter(|ch| ch.running.load(Ordering::Acquire))
            .map(|ch| ch.id)
            .collect();
        for chan in running {
            let _ = self.teardown(chan);
        }
    }
}
