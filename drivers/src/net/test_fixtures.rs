//! Scripted hardware and stack doubles for driver tests.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use nveth_abi::{ChannelDir, ChannelId, DmaAddr, PktId};
use nveth_mm::NetBuf;
use nveth_mm::test_fixtures::MockMapper;
use spin::Mutex;

use super::hw::{
    Completions, DescBatch, DmaEngine, RxStatus, TsQuery, TxDescriptor, TxStatus,
};
use super::upstream::Upstream;
use super::{ETH_HEADER_LEN, IPPROTO_UDP, Ipv4UdpFrame, ipv4_header_checksum};

#[derive(Default)]
struct HwChannel {
    tx_descs: Vec<TxDescriptor>,
    tx_done: VecDeque<TxStatus>,
    rx_posted: VecDeque<DmaAddr>,
    rx_done: VecDeque<RxStatus>,
}

/// How completion polls misreport, for exercising the driver's checks.
#[derive(Clone, Copy, Default)]
struct Misreport {
    /// Completions returned beyond the budget asked for.
    extra: usize,
    /// Report nothing while claiming more is pending.
    stalled: bool,
}

#[derive(Default)]
struct HwInner {
    channels: BTreeMap<ChannelId, HwChannel>,
    misreport: Misreport,
    irqs: BTreeMap<(ChannelId, bool), bool>,
    timestamps: BTreeMap<u32, TsQuery>,
    doorbells: usize,
}

/// DMA engine whose completions are queued by the test.
///
/// Received bytes are written through the mapper so they show up in the
/// posted buffer when the driver syncs it.
#[derive(Default)]
pub struct MockHw {
    inner: Mutex<HwInner>,
    mapper: Option<Arc<MockMapper>>,
}

fn irq_key(chan: ChannelId, dir: ChannelDir) -> (ChannelId, bool) {
    (chan, dir == ChannelDir::Tx)
}

fn take_up_to<S>(queue: &mut VecDeque<S>, budget: usize, mis: Misreport) -> Completions<S> {
    if mis.stalled {
        return Completions {
            done: Vec::new(),
            more_pending: true,
        };
    }
    let n = queue.len().min(budget + mis.extra);
    Completions {
        done: queue.drain(..n).collect(),
        more_pending: !queue.is_empty(),
    }
}

impl MockHw {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mapper(mapper: Arc<MockMapper>) -> Self {
        Self {
            inner: Mutex::new(HwInner::default()),
            mapper: Some(mapper),
        }
    }

    /// Finish the next `n` transmit descriptors without error.
    pub fn complete_tx(&self, chan: ChannelId, n: usize) {
        let mut inner = self.inner.lock();
        let ch = inner.channels.entry(chan).or_default();
        ch.tx_done.extend(core::iter::repeat_n(TxStatus::default(), n));
    }

    pub fn complete_tx_with(&self, chan: ChannelId, status: TxStatus) {
        self.inner
            .lock()
            .channels
            .entry(chan)
            .or_default()
            .tx_done
            .push_back(status);
    }

    /// Deliver a whole frame into the oldest posted receive buffer.
    pub fn receive(&self, chan: ChannelId, bytes: &[u8]) {
        self.receive_with(
            chan,
            bytes,
            RxStatus {
                first: true,
                last: true,
                ..RxStatus::default()
            },
        );
    }

    pub fn receive_with(&self, chan: ChannelId, bytes: &[u8], mut status: RxStatus) {
        let mut inner = self.inner.lock();
        let ch = inner.channels.entry(chan).or_default();
        let addr = ch
            .rx_posted
            .pop_front()
            .unwrap_or_else(|| panic!("{}: no rx buffer posted", chan));
        if let Some(mapper) = &self.mapper {
            mapper.device_write(addr, bytes);
        }
        status.len = bytes.len();
        ch.rx_done.push_back(status);
    }

    /// Return up to `extra` completions more than each poll asks for.
    pub fn set_over_report(&self, extra: usize) {
        self.inner.lock().misreport.extra = extra;
    }

    pub fn set_stalled(&self, stalled: bool) {
        self.inner.lock().misreport.stalled = stalled;
    }

    pub fn set_timestamp(&self, pktid: PktId, query: TsQuery) {
        self.inner.lock().timestamps.insert(pktid.0, query);
    }

    pub fn irq_enabled(&self, chan: ChannelId, dir: ChannelDir) -> bool {
        self.inner
            .lock()
            .irqs
            .get(&irq_key(chan, dir))
            .copied()
            .unwrap_or(false)
    }

    /// Number of `submit` calls across all channels.
    pub fn doorbells(&self) -> usize {
        self.inner.lock().doorbells
    }

    /// Every transmit descriptor submitted on `chan`, oldest first.
    pub fn tx_descs(&self, chan: ChannelId) -> Vec<TxDescriptor> {
        self.inner
            .lock()
            .channels
            .get(&chan)
            .map_or_else(Vec::new, |ch| ch.tx_descs.clone())
    }

    /// Receive buffers posted and not yet written.
    pub fn rx_posted(&self, chan: ChannelId) -> usize {
        self.inner
            .lock()
            .channels
            .get(&chan)
            .map_or(0, |ch| ch.rx_posted.len())
    }
}

impl DmaEngine for MockHw {
    fn submit(&self, chan: ChannelId, batch: DescBatch<'_>) {
        let mut inner = self.inner.lock();
        inner.doorbells += 1;
        let ch = inner.channels.entry(chan).or_default();
        match batch {
            DescBatch::Tx(descs) => ch.tx_descs.extend_from_slice(descs),
            DescBatch::Rx(descs) => ch.rx_posted.extend(descs.iter().map(|d| d.addr)),
        }
    }

    fn poll_tx_completions(&self, chan: ChannelId, budget: usize) -> Completions<TxStatus> {
        let mut inner = self.inner.lock();
        let mis = inner.misreport;
        match inner.channels.get_mut(&chan) {
            Some(ch) => take_up_to(&mut ch.tx_done, budget, mis),
            None => Completions::none(),
        }
    }

    fn poll_rx_completions(&self, chan: ChannelId, budget: usize) -> Completions<RxStatus> {
        let mut inner = self.inner.lock();
        let mis = inner.misreport;
        match inner.channels.get_mut(&chan) {
            Some(ch) => take_up_to(&mut ch.rx_done, budget, mis),
            None => Completions::none(),
        }
    }

    fn irq_enable(&self, chan: ChannelId, dir: ChannelDir) {
        self.inner.lock().irqs.insert(irq_key(chan, dir), true);
    }

    fn irq_disable(&self, chan: ChannelId, dir: ChannelDir) {
        self.inner.lock().irqs.insert(irq_key(chan, dir), false);
    }

    fn tx_timestamp(&self, pktid: PktId) -> TsQuery {
        self.inner
            .lock()
            .timestamps
            .get(&pktid.0)
            .copied()
            .unwrap_or(TsQuery::Pending)
    }
}

/// Stack double that records everything handed to it.
pub struct RecordingUpstream {
    delivered: Mutex<Vec<(ChannelId, NetBuf)>>,
    timestamps: Mutex<Vec<(Vec<u8>, u64)>>,
    stops: AtomicUsize,
    wakes: AtomicUsize,
    gro: AtomicBool,
}

impl RecordingUpstream {
    pub fn new() -> Self {
        Self {
            delivered: Mutex::new(Vec::new()),
            timestamps: Mutex::new(Vec::new()),
            stops: AtomicUsize::new(0),
            wakes: AtomicUsize::new(0),
            gro: AtomicBool::new(true),
        }
    }

    pub fn delivered_len(&self) -> usize {
        self.delivered.lock().len()
    }

    pub fn take_delivered(&self) -> Vec<(ChannelId, NetBuf)> {
        core::mem::take(&mut *self.delivered.lock())
    }

    pub fn timestamps(&self) -> Vec<(Vec<u8>, u64)> {
        self.timestamps.lock().clone()
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::Relaxed)
    }

    pub fn wakes(&self) -> usize {
        self.wakes.load(Ordering::Relaxed)
    }

    pub fn set_gro(&self, on: bool) {
        self.gro.store(on, Ordering::Relaxed);
    }
}

impl Upstream for RecordingUpstream {
    fn deliver(&self, chan: ChannelId, buf: NetBuf) {
        self.delivered.lock().push((chan, buf));
    }

    fn stop_queue(&self, _chan: ChannelId) {
        self.stops.fetch_add(1, Ordering::Relaxed);
    }

    fn wake_queue(&self, _chan: ChannelId) {
        self.wakes.fetch_add(1, Ordering::Relaxed);
    }

    fn tx_timestamp(&self, buf: NetBuf, ns: u64) {
        self.timestamps.lock().push((buf.as_slice().to_vec(), ns));
    }

    fn gro_enabled(&self, _frame: &Ipv4UdpFrame) -> bool {
        self.gro.load(Ordering::Relaxed)
    }
}

/// Ethernet/IPv4/UDP frame from 10.0.0.1:4000 to 10.0.0.2:5000.
pub fn udp_frame(ip_id: u16, ttl: u8, payload: &[u8]) -> Vec<u8> {
    let udp_len = (8 + payload.len()) as u16;
    let tot_len = 20 + udp_len;
    let mut frame = Vec::with_capacity(ETH_HEADER_LEN + tot_len as usize);
    frame.extend_from_slice(&[0x02, 0, 0, 0, 0, 0x02]);
    frame.extend_from_slice(&[0x02, 0, 0, 0, 0, 0x01]);
    frame.extend_from_slice(&[0x08, 0x00]);

    let mut ip = [0u8; 20];
    ip[0] = 0x45;
    ip[2..4].copy_from_slice(&tot_len.to_be_bytes());
    ip[4..6].copy_from_slice(&ip_id.to_be_bytes());
    ip[8] = ttl;
    ip[9] = IPPROTO_UDP;
    ip[12..16].copy_from_slice(&[10, 0, 0, 1]);
    ip[16..20].copy_from_slice(&[10, 0, 0, 2]);
    let csum = ipv4_header_checksum(&ip);
    ip[10..12].copy_from_slice(&csum.to_be_bytes());
    frame.extend_from_slice(&ip);

    frame.extend_from_slice(&4000u16.to_be_bytes());
    frame.extend_from_slice(&5000u16.to_be_bytes());
    frame.extend_from_slice(&udp_len.to_be_bytes());
    frame.extend_from_slice(&[0, 0]);
    frame.extend_from_slice(payload);
    frame
}
