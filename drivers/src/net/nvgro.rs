//! NVGRO: reassembly of sender-segmented UDP flows.
//!
//! A cooperating sender splits a large UDP message into datagrams and marks
//! each one. The IPv4 identification field carries a sequence number and
//! bits 6..7 of the TTL carry the segment role: 1 starts a group, 2 ends
//! it, 0 is anything in between.
//!
//! The engine keeps two queues. The *final* queue holds a contiguous run
//! starting at a first segment; the *master* queue holds everything that
//! arrived ahead of its turn. When the final queue reaches a last segment
//! the run is merged into one buffer and delivered. Entries that wait too
//! long are evicted by a periodic purge and counted as dropped.
//!
//! Receive paths never touch the queues. They push [`NvgroSegment`]s into
//! an SPSC channel and the single [`NvgroTask`] owns the engine, so the
//! purge and the state machine cannot run concurrently.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use nveth_abi::ChannelId;
use nveth_lib::spsc::Consumer;
use nveth_lib::{MonotonicClock, elapsed_ms, klog_debug, klog_info, klog_warn};
use nveth_mm::{CsumState, NetBuf};

use super::upstream::Upstream;
use super::{ETH_HEADER_LEN, Ipv4UdpFrame, UDP_HEADER_LEN, ipv4_header_checksum};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SegmentRole {
    Middle,
    First,
    Last,
}

impl SegmentRole {
    /// Role packed into TTL bits 6..7. The unused value 3 is a middle.
    pub fn from_ttl(ttl: u8) -> Self {
        match (ttl & 0xC0) >> 6 {
            1 => Self::First,
            2 => Self::Last,
            _ => Self::Middle,
        }
    }

    const fn tag(self) -> char {
        match self {
            Self::Middle => 'M',
            Self::First => 'F',
            Self::Last => 'L',
        }
    }
}

/// One received datagram queued for reassembly.
#[derive(Debug)]
pub struct NvgroSegment {
    pub buf: NetBuf,
    pub chan: ChannelId,
    pub seq: u16,
    pub role: SegmentRole,
    /// Arrival time in milliseconds.
    pub age_ms: u64,
    payload_offset: usize,
    payload_end: usize,
}

impl NvgroSegment {
    pub fn new(buf: NetBuf, chan: ChannelId, frame: &Ipv4UdpFrame, now_ms: u64) -> Self {
        Self {
            buf,
            chan,
            seq: frame.ip_id,
            role: SegmentRole::from_ttl(frame.ttl),
            age_ms: now_ms,
            payload_offset: frame.payload_offset(),
            payload_end: frame.payload_end(),
        }
    }

    fn payload(&self) -> &[u8] {
        let data = self.buf.as_slice();
        let end = self.payload_end.min(data.len());
        &data[self.payload_offset.min(end)..end]
    }
}

pub struct NvgroEngine {
    fq: VecDeque<NvgroSegment>,
    mq: VecDeque<NvgroSegment>,
    expected: u16,
    pkt_age_ms: u64,
    dropped: u64,
    merged: u64,
}

impl NvgroEngine {
    pub fn new(pkt_age_ms: u64) -> Self {
        Self {
            fq: VecDeque::new(),
            mq: VecDeque::new(),
            expected: 0,
            pkt_age_ms,
            dropped: 0,
            merged: 0,
        }
    }

    #[inline]
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    #[inline]
    pub fn merged(&self) -> u64 {
        self.merged
    }

    pub fn final_len(&self) -> usize {
        self.fq.len()
    }

    pub fn master_len(&self) -> usize {
        self.mq.len()
    }

    /// Sequence number the final queue wants next.
    pub fn expected(&self) -> u16 {
        self.expected
    }

    /// Run one segment through the state machine.
    ///
    /// Returns a merged buffer and the channel its first segment came from
    /// when the segment completes a group.
    pub fn process(&mut self, seg: NvgroSegment) -> Option<(ChannelId, NetBuf)> {
        match seg.role {
            SegmentRole::First => {
                if !self.fq.is_empty() {
                    self.dropped += self.fq.len() as u64;
                    klog_debug!("nveth: nvgro new group drops {} segments", self.fq.len());
                    self.fq.clear();
                }
                self.expected = seg.seq.wrapping_add(1);
                self.fq.push_back(seg);
                // Later segments of this group may already be waiting.
                if self.mq.is_empty() { None } else { self.pull_successors() }
            }
            _ if seg.seq == self.expected => {
                let last = seg.role == SegmentRole::Last;
                self.expected = seg.seq.wrapping_add(1);
                self.fq.push_back(seg);
                if last {
                    self.merge()
                } else if !self.mq.is_empty() {
                    self.pull_successors()
                } else {
                    None
                }
            }
            _ => {
                let last = seg.role == SegmentRole::Last;
                self.mq.push_back(seg);
                if last { self.pull_successors() } else { None }
            }
        }
    }

    /// Move successors of the final queue's tail out of the master queue
    /// until a gap (nothing to deliver) or a last segment (merge).
    fn pull_successors(&mut self) -> Option<(ChannelId, NetBuf)> {
        let mut next = self.fq.back()?.seq;
        loop {
            next = next.wrapping_add(1);
            let pos = self.mq.iter().position(|s| s.seq == next)?;
            let seg = self.mq.remove(pos)?;
            let last = seg.role == SegmentRole::Last;
            self.fq.push_back(seg);
            self.expected = next.wrapping_add(1);
            if last {
                return self.merge();
            }
        }
    }

    /// Collapse the final queue into one datagram.
    fn merge(&mut self) -> Option<(ChannelId, NetBuf)> {
        let segs = core::mem::take(&mut self.fq);
        let count = segs.len();
        let mut segs = segs.into_iter();
        let first = segs.next()?;
        let chan = first.chan;
        let hdr_len = first.payload_offset;
        let gso_size = first.payload().len();
        let mut out = first.buf;
        out.truncate(first.payload_end);

        for seg in segs {
            if let Err(e) = out.append(seg.payload()) {
                klog_warn!("nveth: nvgro merge of {} segments failed: {}", count, e);
                self.dropped += count as u64;
                return None;
            }
        }

        let payload_len = out.len() - hdr_len;
        let ip = &mut out.as_mut_slice()[ETH_HEADER_LEN..hdr_len];
        let ihl = ip.len() - UDP_HEADER_LEN;
        let tot_len = ihl + UDP_HEADER_LEN + payload_len;
        if let Ok(tot_len) = u16::try_from(tot_len) {
            let udp_len = (UDP_HEADER_LEN + payload_len) as u16;
            ip[2..4].copy_from_slice(&tot_len.to_be_bytes());
            ip[ihl + 4..ihl + 6].copy_from_slice(&udp_len.to_be_bytes());
            // UDP checksum no longer covers the payload; clear it.
            ip[ihl + 6..ihl + 8].copy_from_slice(&[0, 0]);
            ip[10..12].copy_from_slice(&[0, 0]);
            let csum = ipv4_header_checksum(&ip[..ihl]);
            ip[10..12].copy_from_slice(&csum.to_be_bytes());
        }

        out.meta.gro_segs = count as u16;
        out.meta.gso_size = gso_size as u16;
        out.meta.csum = CsumState::Unnecessary;
        self.merged += 1;
        Some((chan, out))
    }

    /// Evict segments older than the age threshold.
    ///
    /// The master queue is in arrival order, so eviction stops at the first
    /// young entry. The final queue is dropped whole once its head has aged.
    pub fn purge(&mut self, now_ms: u64) -> u64 {
        let before = self.dropped;
        while let Some(seg) = self.mq.front() {
            if elapsed_ms(now_ms, seg.age_ms) <= self.pkt_age_ms {
                break;
            }
            self.mq.pop_front();
            self.dropped += 1;
        }
        if let Some(head) = self.fq.front()
            && elapsed_ms(now_ms, head.age_ms) > self.pkt_age_ms
        {
            self.dropped += self.fq.len() as u64;
            self.fq.clear();
        }
        self.dropped - before
    }

    /// Log both queues.
    pub fn dump(&self) {
        klog_info!("nveth: nvgro {}", self);
    }
}

impl fmt::Display for NvgroEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fq[")?;
        for (i, s) in self.fq.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{}{}", s.role.tag(), s.seq)?;
        }
        write!(f, "] mq[")?;
        for (i, s) in self.mq.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{}{}", s.role.tag(), s.seq)?;
        }
        write!(
            f,
            "] expected={} merged={} dropped={}",
            self.expected, self.merged, self.dropped
        )
    }
}

// =============================================================================
// Reassembly task
// =============================================================================

/// Sole owner of the reassembly queues.
///
/// The host runs [`run`](Self::run) from one thread or work item, whenever
/// receive paths have pushed segments and at least every `timer_ms`.
pub struct NvgroTask {
    engine: NvgroEngine,
    inputs: Vec<Consumer<NvgroSegment>>,
    upstream: Arc<dyn Upstream>,
    clock: Arc<dyn MonotonicClock>,
    timer_ms: u64,
    last_purge_ms: u64,
}

impl NvgroTask {
    pub fn new(
        pkt_age_ms: u64,
        timer_ms: u64,
        upstream: Arc<dyn Upstream>,
        clock: Arc<dyn MonotonicClock>,
    ) -> Self {
        let last_purge_ms = clock.now_ms();
        Self {
            engine: NvgroEngine::new(pkt_age_ms),
            inputs: Vec::new(),
            upstream,
            clock,
            timer_ms,
            last_purge_ms,
        }
    }

    pub fn add_input(&mut self, input: Consumer<NvgroSegment>) {
        self.inputs.push(input);
    }

    pub fn engine(&self) -> &NvgroEngine {
        &self.engine
    }

    /// When the next purge is due.
    pub fn next_purge_ms(&self) -> u64 {
        self.last_purge_ms.saturating_add(self.timer_ms)
    }

    /// Every receive path has gone away and nothing is left to read.
    pub fn is_closed(&self) -> bool {
        self.inputs.iter().all(|c| c.is_closed() && c.is_empty())
    }

    /// Drain all inputs, deliver completed groups, and purge if due.
    ///
    /// Returns the number of segments consumed.
    pub fn run(&mut self) -> usize {
        let mut consumed = 0;
        for input in self.inputs.iter_mut() {
            while let Some(seg) = input.pop() {
                consumed += 1;
                if let Some((chan, buf)) = self.engine.process(seg) {
                    self.upstream.deliver(chan, buf);
                }
            }
        }

        let now = self.clock.now_ms();
        if elapsed_ms(now, self.last_purge_ms) >= self.timer_ms {
            self.last_purge_ms = now;
            let dropped = self.engine.purge(now);
            if dropped > 0 {
                klog_info!(
                    "nveth: nvgro purge dropped {} (total {})",
                    dropped,
                    self.engine.dropped()
                );
            }
        }
        consumed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::parse_ipv4_udp;
    use crate::net::test_fixtures::{RecordingUpstream, udp_frame};
    use alloc::format;
    use nveth_lib::ManualClock;
    use nveth_lib::spsc;

    const FIRST: u8 = 0x40 | 0x3f;
    const MIDDLE: u8 = 0x3f;
    const LAST: u8 = 0x80 | 0x3f;

    fn seg(seq: u16, ttl: u8, payload: &[u8], now: u64) -> NvgroSegment {
        let frame = udp_frame(seq, ttl, payload);
        let parsed = parse_ipv4_udp(&frame).unwrap_or_else(|| panic!("frame"));
        NvgroSegment::new(NetBuf::from_slice(&frame), ChannelId(0), &parsed, now)
    }

    fn check_merged(buf: &NetBuf, payload: &[u8], segs: u16) {
        let parsed = parse_ipv4_udp(buf.as_slice()).unwrap_or_else(|| panic!("merged frame"));
        assert_eq!(&buf.as_slice()[parsed.payload_offset()..parsed.payload_end()], payload);
        let ip = &buf.as_slice()[ETH_HEADER_LEN..ETH_HEADER_LEN + parsed.ihl];
        assert_eq!(ipv4_header_checksum(ip), 0);
        assert_eq!(buf.meta.gro_segs, segs);
        assert_eq!(buf.meta.csum, CsumState::Unnecessary);
    }

    #[test]
    fn role_from_ttl_bits() {
        assert_eq!(SegmentRole::from_ttl(0x40), SegmentRole::First);
        assert_eq!(SegmentRole::from_ttl(0xBF), SegmentRole::Last);
        assert_eq!(SegmentRole::from_ttl(0x3F), SegmentRole::Middle);
        assert_eq!(SegmentRole::from_ttl(0xC0), SegmentRole::Middle);
    }

    #[test]
    fn in_order_group_merges() {
        let mut e = NvgroEngine::new(500);
        assert!(e.process(seg(10, FIRST, b"aa", 0)).is_none());
        assert!(e.process(seg(11, MIDDLE, b"bb", 0)).is_none());
        let (chan, buf) = e
            .process(seg(12, LAST, b"c", 0))
            .unwrap_or_else(|| panic!("merge"));
        assert_eq!(chan, ChannelId(0));
        check_merged(&buf, b"aabbc", 3);
        assert_eq!(buf.meta.gso_size, 2);
        assert_eq!(e.final_len(), 0);
        assert_eq!(e.merged(), 1);
    }

    #[test]
    fn swapped_middle_and_last_merge_once() {
        let mut e = NvgroEngine::new(500);
        assert!(e.process(seg(100, FIRST, b"s0", 0)).is_none());
        assert!(e.process(seg(102, LAST, b"s2", 0)).is_none());
        assert_eq!(e.master_len(), 1);
        let (_, buf) = e
            .process(seg(101, MIDDLE, b"s1", 0))
            .unwrap_or_else(|| panic!("merge"));
        check_merged(&buf, b"s0s1s2", 3);
        assert_eq!(e.master_len(), 0);
        assert_eq!(e.merged(), 1);
        assert_eq!(e.dropped(), 0);
    }

    #[test]
    fn first_arriving_last_completes_the_group() {
        let mut e = NvgroEngine::new(500);
        assert!(e.process(seg(101, MIDDLE, b"s1", 0)).is_none());
        assert!(e.process(seg(102, LAST, b"s2", 0)).is_none());
        assert_eq!(e.master_len(), 2);
        let (_, buf) = e
            .process(seg(100, FIRST, b"s0", 0))
            .unwrap_or_else(|| panic!("merge"));
        check_merged(&buf, b"s0s1s2", 3);
        assert_eq!(e.master_len() + e.final_len(), 0);
        assert_eq!(e.merged(), 1);
        assert_eq!(e.expected(), 103);
    }

    #[test]
    fn missing_middle_is_purged_after_age() {
        let mut e = NvgroEngine::new(500);
        assert!(e.process(seg(100, FIRST, b"s0", 0)).is_none());
        assert!(e.process(seg(102, LAST, b"s2", 10)).is_none());
        assert_eq!(e.purge(400), 0);
        assert_eq!(e.purge(511), 2);
        assert_eq!(e.dropped(), 2);
        assert_eq!(e.final_len() + e.master_len(), 0);
        assert_eq!(e.merged(), 0);
        // A late arrival cannot complete the evicted group.
        assert!(e.process(seg(101, MIDDLE, b"s1", 600)).is_none());
        assert_eq!(e.merged(), 0);
    }

    #[test]
    fn new_first_drops_incomplete_group() {
        let mut e = NvgroEngine::new(500);
        assert!(e.process(seg(1, FIRST, b"x", 0)).is_none());
        assert!(e.process(seg(2, MIDDLE, b"x", 0)).is_none());
        assert!(e.process(seg(50, FIRST, b"y", 0)).is_none());
        assert_eq!(e.dropped(), 2);
        assert_eq!(e.expected(), 51);
    }

    #[test]
    fn sequence_wraps() {
        let mut e = NvgroEngine::new(500);
        assert!(e.process(seg(u16::MAX, FIRST, b"a", 0)).is_none());
        assert!(e.process(seg(1, LAST, b"c", 0)).is_none());
        let merged = e.process(seg(0, MIDDLE, b"b", 0));
        let (_, buf) = merged.unwrap_or_else(|| panic!("merge across wrap"));
        check_merged(&buf, b"abc", 3);
    }

    #[test]
    fn dump_lists_both_queues() {
        let mut e = NvgroEngine::new(500);
        assert!(e.process(seg(7, FIRST, b"a", 0)).is_none());
        assert!(e.process(seg(9, LAST, b"c", 0)).is_none());
        assert_eq!(format!("{}", e), "fq[F7] mq[L9] expected=8 merged=0 dropped=0");
    }

    #[test]
    fn task_drains_inputs_and_purges_on_timer() {
        let upstream = Arc::new(RecordingUpstream::new());
        let clock = Arc::new(ManualClock::new(0));
        let mut task = NvgroTask::new(500, 5000, upstream.clone(), clock.clone());
        let (mut tx0, rx0) = spsc::channel(16);
        let (mut tx1, rx1) = spsc::channel(16);
        task.add_input(rx0);
        task.add_input(rx1);

        for s in [seg(1, FIRST, b"a", 0), seg(3, LAST, b"c", 0)] {
            assert!(tx0.try_push(s).is_ok());
        }
        assert!(tx1.try_push(seg(2, MIDDLE, b"b", 0)).is_ok());
        assert_eq!(task.run(), 3);
        assert_eq!(upstream.delivered_len(), 1);

        assert!(tx0.try_push(seg(20, FIRST, b"z", 0)).is_ok());
        clock.set(1000);
        assert_eq!(task.run(), 1);
        assert_eq!(task.engine().final_len(), 1);
        clock.set(5000);
        assert_eq!(task.run(), 0);
        assert_eq!(task.engine().dropped(), 1);
        assert_eq!(task.next_purge_ms(), 10_000);

        drop(tx0);
        drop(tx1);
        assert!(task.is_closed());
    }
}
