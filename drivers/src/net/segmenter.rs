//! Transmit segmentation into descriptor-sized chunks.
//!
//! Segmenting a packet is a transaction. [`plan`] works out every slot the
//! packet needs, checks the ring can take them all, and maps each chunk
//! into a [`TxBatch`] without touching the ring. [`TxBatch::commit`] posts
//! the whole run at once. Dropping an uncommitted batch unmaps what it
//! mapped, newest first, so a failure at chunk `k + 1` leaves the ring and
//! the mapper exactly as they were.
//!
//! The two failure modes are kept apart because the caller reacts
//! differently: [`SegmentError::RingFull`] means stop the queue and retry
//! the same packet later, [`SegmentError::Map`] means drop it.

use alloc::vec::Vec;
use core::fmt;

use bitflags::bitflags;
use nveth_abi::{DmaAddr, DmaDirection, MAX_DESC_DATA_LEN, MacClass, PktId};
use nveth_mm::{DmaError, DmaMapper, GsoKind, NetBuf, TxOffloadFlags};

use super::UDP_HEADER_LEN;
use super::config::PtpMode;
use super::hw::{TxDescFlags, TxDescriptor};
use super::ring::DescRing;

bitflags! {
    /// Software context flags of a transmit slot.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct TxSlotFlags: u8 {
        /// Chunk of a page fragment rather than the linear region.
        const PAGED      = 1 << 0;
        /// Context slot; nothing mapped.
        const CONTEXT    = 1 << 1;
        /// Timestamp is collected later by packet id.
        const TS_DELAYED = 1 << 2;
    }
}

/// Software context of one transmit slot.
#[derive(Debug, Default)]
pub struct TxSwcx {
    pub addr: DmaAddr,
    pub len: usize,
    pub flags: TxSlotFlags,
    /// Set on the last data slot of a packet only.
    pub buf: Option<NetBuf>,
    pub pktid: Option<PktId>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SegmentError {
    /// Not enough free slots. Nothing was mapped.
    RingFull,
    /// A chunk could not be mapped. Earlier chunks were unmapped.
    Map(DmaError),
    /// The packet needs more slots than the ring has.
    Oversized { needed: usize },
}

impl fmt::Display for SegmentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RingFull => write!(f, "tx ring full"),
            Self::Map(e) => write!(f, "tx map: {}", e),
            Self::Oversized { needed } => write!(f, "packet needs {} descriptors", needed),
        }
    }
}

/// A failed attempt hands the packet back with the reason.
#[derive(Debug)]
pub struct SegmentFailure {
    pub error: SegmentError,
    pub pkt: NetBuf,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SegmentParams {
    pub mac: MacClass,
    pub ptp: PtpMode,
    /// Match id for a deferred timestamp.
    pub pktid: Option<PktId>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ChunkSrc {
    Linear,
    Frag(usize),
}

#[derive(Clone, Copy, Debug)]
struct Chunk {
    src: ChunkSrc,
    start: usize,
    len: usize,
}

#[derive(Clone, Copy, Debug)]
struct Mapped {
    addr: DmaAddr,
    len: usize,
    paged: bool,
}

/// Segmentation offload layout of a packet.
#[derive(Clone, Copy, Debug)]
struct TsoLayout {
    hdr_len: usize,
    mss: u16,
}

fn split(src: ChunkSrc, start: usize, len: usize, out: &mut Vec<Chunk>) {
    let end = start + len;
    let mut at = start;
    while at < end {
        let n = (end - at).min(MAX_DESC_DATA_LEN);
        out.push(Chunk { src, start: at, len: n });
        at += n;
    }
}

fn chunk_bytes<'p>(pkt: &'p NetBuf, chunk: &Chunk) -> &'p [u8] {
    let region = match chunk.src {
        ChunkSrc::Linear => pkt.as_slice(),
        ChunkSrc::Frag(i) => &pkt.frags()[i],
    };
    &region[chunk.start..chunk.start + chunk.len]
}

fn tso_layout(pkt: &NetBuf) -> Result<Option<TsoLayout>, DmaError> {
    let Some(gso) = pkt.meta.tx.gso else {
        return Ok(None);
    };
    let l4 = pkt.meta.tx.l4_offset as usize;
    let (hdr_len, mss) = match gso.kind {
        GsoKind::Tcp { hdr_len } => (l4 + hdr_len as usize, gso.size),
        GsoKind::Udp => (
            l4 + UDP_HEADER_LEN,
            gso.size.saturating_sub(UDP_HEADER_LEN as u16),
        ),
    };
    if hdr_len == 0 || hdr_len > pkt.len() || hdr_len > MAX_DESC_DATA_LEN {
        return Err(DmaError::InvalidLength { len: hdr_len });
    }
    Ok(Some(TsoLayout { hdr_len, mss }))
}

/// Prepare `pkt` for transmit on `ring`.
///
/// The ring is only read; the caller must hold it exclusively until the
/// returned batch is committed or dropped.
pub fn plan<'m>(
    ring: &DescRing<TxSwcx>,
    mapper: &'m dyn DmaMapper,
    pkt: NetBuf,
    params: SegmentParams,
) -> Result<TxBatch<'m>, SegmentFailure> {
    let tso = match tso_layout(&pkt) {
        Ok(tso) => tso,
        Err(e) => {
            return Err(SegmentFailure {
                error: SegmentError::Map(e),
                pkt,
            });
        }
    };

    let meta = pkt.meta;
    let ptp = params.ptp != PtpMode::Off && meta.tx.flags.contains(TxOffloadFlags::PTP);
    let needs_context = meta.vlan.is_some()
        || tso.is_some()
        || (ptp && (params.mac == MacClass::Mgbe || params.ptp == PtpMode::OneStep));

    let mut chunks = Vec::new();
    match tso {
        Some(tso) => {
            split(ChunkSrc::Linear, 0, tso.hdr_len, &mut chunks);
            split(ChunkSrc::Linear, tso.hdr_len, pkt.len() - tso.hdr_len, &mut chunks);
        }
        None => split(ChunkSrc::Linear, 0, pkt.len(), &mut chunks),
    }
    for (i, frag) in pkt.frags().iter().enumerate() {
        split(ChunkSrc::Frag(i), 0, frag.len(), &mut chunks);
    }
    if chunks.is_empty() {
        return Err(SegmentFailure {
            error: SegmentError::Map(DmaError::InvalidLength { len: 0 }),
            pkt,
        });
    }

    let needed = chunks.len() + needs_context as usize;
    if needed >= ring.size() {
        return Err(SegmentFailure {
            error: SegmentError::Oversized { needed },
            pkt,
        });
    }
    if needed > ring.available() || !ring.run_is_free(needed) {
        return Err(SegmentFailure {
            error: SegmentError::RingFull,
            pkt,
        });
    }

    let mut mapped = Vec::with_capacity(chunks.len());
    for chunk in &chunks {
        match mapper.map(DmaDirection::ToDevice, chunk_bytes(&pkt, chunk)) {
            Ok(addr) => mapped.push(Mapped {
                addr,
                len: chunk.len,
                paged: matches!(chunk.src, ChunkSrc::Frag(_)),
            }),
            Err(e) => {
                drop(TxBatch::rollback_only(mapper, mapped));
                return Err(SegmentFailure {
                    error: SegmentError::Map(e),
                    pkt,
                });
            }
        }
    }

    let ts_delayed = ptp && params.ptp == PtpMode::TwoStep && params.mac == MacClass::Mgbe;
    Ok(TxBatch {
        mapper,
        mapped,
        pkt: Some(pkt),
        tso,
        needs_context,
        ptp,
        one_step: ptp && params.ptp == PtpMode::OneStep,
        pktid: if ts_delayed { params.pktid } else { None },
    })
}

/// Mapped chunks of one packet, not yet visible to hardware.
pub struct TxBatch<'m> {
    mapper: &'m dyn DmaMapper,
    mapped: Vec<Mapped>,
    pkt: Option<NetBuf>,
    tso: Option<TsoLayout>,
    needs_context: bool,
    ptp: bool,
    one_step: bool,
    pktid: Option<PktId>,
}

impl<'m> TxBatch<'m> {
    fn rollback_only(mapper: &'m dyn DmaMapper, mapped: Vec<Mapped>) -> Self {
        Self {
            mapper,
            mapped,
            pkt: None,
            tso: None,
            needs_context: false,
            ptp: false,
            one_step: false,
            pktid: None,
        }
    }

    /// Slots the batch occupies once committed.
    pub fn slot_count(&self) -> usize {
        self.mapped.len() + self.needs_context as usize
    }

    pub fn is_tso(&self) -> bool {
        self.tso.is_some()
    }

    fn context_descriptor(&self, pkt: &NetBuf) -> TxDescriptor {
        let mut flags = TxDescFlags::CONTEXT;
        let mut desc = TxDescriptor::default();
        if let Some(tag) = pkt.meta.vlan {
            flags |= TxDescFlags::VLAN;
            desc.vlan = tag;
        }
        if let Some(tso) = self.tso {
            flags |= TxDescFlags::TSO;
            desc.mss = tso.mss;
        }
        if self.one_step {
            flags |= TxDescFlags::OSTC;
        }
        if self.ptp {
            // One-step packets carry id 0; hardware does not report them.
            desc.pktid = self.pktid.map_or(0, |id| id.0);
        }
        desc.flags = flags;
        desc
    }

    /// Post every slot of the batch in one step.
    ///
    /// Returns the descriptors to hand to hardware in slot order. Fails with
    /// `RingFull` only if the ring changed since [`plan`]; the batch is then
    /// rolled back like any other failure.
    pub fn commit(mut self, ring: &mut DescRing<TxSwcx>) -> Result<Vec<TxDescriptor>, SegmentFailure> {
        let Some(pkt) = self.pkt.take() else {
            return Err(SegmentFailure {
                error: SegmentError::Map(DmaError::InvalidLength { len: 0 }),
                pkt: NetBuf::from_slice(&[]),
            });
        };

        let mut descs = Vec::with_capacity(self.slot_count());
        let mut slots = Vec::with_capacity(self.slot_count());
        if self.needs_context {
            descs.push(self.context_descriptor(&pkt));
            slots.push(TxSwcx {
                flags: TxSlotFlags::CONTEXT,
                ..TxSwcx::default()
            });
        }

        let mut first_flags = TxDescFlags::FIRST;
        if pkt.meta.tx.flags.contains(TxOffloadFlags::CSUM) {
            first_flags |= TxDescFlags::CSUM;
        }
        if self.ptp {
            first_flags |= TxDescFlags::TTSE;
        }
        if self.tso.is_some() {
            first_flags |= TxDescFlags::TSO;
        }

        let last = self.mapped.len() - 1;
        let mut pkt = Some(pkt);
        for (i, m) in self.mapped.iter().enumerate() {
            let mut desc = TxDescriptor {
                addr: m.addr,
                len: m.len as u16,
                ..TxDescriptor::default()
            };
            let mut flags = TxSlotFlags::empty();
            if m.paged {
                flags |= TxSlotFlags::PAGED;
            }
            if i == 0 {
                desc.flags |= first_flags;
                if let (Some(tso), Some(p)) = (self.tso, pkt.as_ref()) {
                    desc.hdr_len = tso.hdr_len as u16;
                    desc.pay_len = (p.total_len() - tso.hdr_len) as u32;
                }
            }
            let mut swcx = TxSwcx {
                addr: m.addr,
                len: m.len,
                ..TxSwcx::default()
            };
            if i == last {
                desc.flags |= TxDescFlags::LAST | TxDescFlags::IOC;
                if self.pktid.is_some() {
                    flags |= TxSlotFlags::TS_DELAYED;
                    swcx.pktid = self.pktid;
                }
                swcx.buf = pkt.take();
            }
            swcx.flags = flags;
            descs.push(desc);
            slots.push(swcx);
        }

        match ring.post_all(slots) {
            Ok(_) => {
                self.mapped.clear();
                Ok(descs)
            }
            Err(slots) => {
                let pkt = slots
                    .into_iter()
                    .find_map(|s| s.buf)
                    .unwrap_or_else(|| NetBuf::from_slice(&[]));
                Err(SegmentFailure {
                    error: SegmentError::RingFull,
                    pkt,
                })
            }
        }
    }
}

impl Drop for TxBatch<'_> {
    fn drop(&mut self) {
        while let Some(m) = self.mapped.pop() {
            self.mapper.unmap(m.addr, m.len, DmaDirection::ToDevice);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;
    use nveth_abi::ChannelDir;
    use nveth_mm::test_fixtures::MockMapper;
    use nveth_mm::{Gso, TxOffload};

    fn ring() -> DescRing<TxSwcx> {
        DescRing::new(64, MacClass::Eqos, ChannelDir::Tx).unwrap_or_else(|e| panic!("{}", e))
    }

    fn params() -> SegmentParams {
        SegmentParams::default()
    }

    fn send(ring: &mut DescRing<TxSwcx>, mapper: &MockMapper, pkt: NetBuf) -> Vec<TxDescriptor> {
        plan(ring, mapper, pkt, params())
            .and_then(|b| b.commit(ring))
            .unwrap_or_else(|f| panic!("{}", f.error))
    }

    #[test]
    fn linear_packet_takes_one_slot() {
        let mapper = MockMapper::new();
        let mut r = ring();
        let descs = send(&mut r, &mapper, NetBuf::from_slice(&[1; 60]));
        assert_eq!(descs.len(), 1);
        assert_eq!(
            descs[0].flags,
            TxDescFlags::FIRST | TxDescFlags::LAST | TxDescFlags::IOC
        );
        assert_eq!(r.outstanding(), 1);
        assert!(matches!(r.slot(0), crate::net::ring::Slot::Posted(s) if s.buf.is_some()));
    }

    #[test]
    fn large_linear_region_is_split() {
        let mapper = MockMapper::new();
        let mut r = ring();
        let mut pkt = NetBuf::from_slice(&vec![0u8; MAX_DESC_DATA_LEN * 2 + 10]);
        pkt.push_frag(vec![0u8; 100]);
        let descs = send(&mut r, &mapper, pkt);
        let lens: Vec<u16> = descs.iter().map(|d| d.len).collect();
        assert_eq!(lens, [0x3FFF, 0x3FFF, 10, 100]);
        assert!(matches!(r.slot(3), crate::net::ring::Slot::Posted(s) if s.flags.contains(TxSlotFlags::PAGED)));
        assert_eq!(mapper.live_count(), 4);
    }

    #[test]
    fn tso_with_vlan_gets_context_and_header_slot() {
        let mapper = MockMapper::new();
        let mut r = ring();
        let mut pkt = NetBuf::from_slice(&[0u8; 54 + 3000]);
        pkt.meta.vlan = Some(100);
        pkt.meta.tx = TxOffload {
            flags: TxOffloadFlags::CSUM,
            gso: Some(Gso {
                size: 1448,
                kind: GsoKind::Tcp { hdr_len: 20 },
            }),
            l4_offset: 34,
        };
        let descs = send(&mut r, &mapper, pkt);
        assert_eq!(descs.len(), 3);
        assert!(descs[0].flags.contains(TxDescFlags::CONTEXT | TxDescFlags::VLAN | TxDescFlags::TSO));
        assert_eq!(descs[0].mss, 1448);
        assert_eq!(descs[0].vlan, 100);
        assert_eq!(descs[1].len, 54);
        assert_eq!(descs[1].hdr_len, 54);
        assert_eq!(descs[1].pay_len, 3000);
        assert!(descs[1].flags.contains(TxDescFlags::FIRST | TxDescFlags::CSUM));
        assert!(descs[2].flags.contains(TxDescFlags::LAST));
        assert!(matches!(r.slot(0), crate::net::ring::Slot::Posted(s) if s.flags == TxSlotFlags::CONTEXT));
    }

    #[test]
    fn udp_gso_subtracts_header_from_mss() {
        let mapper = MockMapper::new();
        let mut r = ring();
        let mut pkt = NetBuf::from_slice(&[0u8; 42 + 2000]);
        pkt.meta.tx.gso = Some(Gso {
            size: 1480,
            kind: GsoKind::Udp,
        });
        pkt.meta.tx.l4_offset = 34;
        let descs = send(&mut r, &mapper, pkt);
        assert_eq!(descs[0].mss, 1472);
        assert_eq!(descs[1].hdr_len, 42);
    }

    #[test]
    fn mgbe_two_step_ptp_defers_timestamp() {
        let mapper = MockMapper::new();
        let mut r = DescRing::new(64, MacClass::Mgbe, ChannelDir::Tx)
            .unwrap_or_else(|e| panic!("{}", e));
        let mut pkt = NetBuf::from_slice(&[0u8; 90]);
        pkt.meta.tx.flags = TxOffloadFlags::PTP;
        let p = SegmentParams {
            mac: MacClass::Mgbe,
            ptp: PtpMode::TwoStep,
            pktid: Some(PktId(0x1000_0001)),
        };
        let descs = plan(&r, &mapper, pkt, p)
            .and_then(|b| b.commit(&mut r))
            .unwrap_or_else(|f| panic!("{}", f.error));
        assert_eq!(descs[0].pktid, 0x1000_0001);
        assert!(descs[1].flags.contains(TxDescFlags::TTSE));
        assert!(matches!(
            r.slot(1),
            crate::net::ring::Slot::Posted(s)
                if s.flags.contains(TxSlotFlags::TS_DELAYED) && s.pktid == Some(PktId(0x1000_0001))
        ));
    }

    #[test]
    fn ring_full_is_reported_before_mapping() {
        let mapper = MockMapper::new();
        let mut r = ring();
        for _ in 0..62 {
            send(&mut r, &mapper, NetBuf::from_slice(&[0; 10]));
        }
        let maps = mapper.map_calls();
        let mut pkt = NetBuf::from_slice(&[0; 10]);
        pkt.push_frag(vec![1; 10]);
        let failure = plan(&r, &mapper, pkt, params()).err();
        let failure = failure.unwrap_or_else(|| panic!("expected ring full"));
        assert_eq!(failure.error, SegmentError::RingFull);
        assert_eq!(failure.pkt.total_len(), 20);
        assert_eq!(mapper.map_calls(), maps);
    }

    #[test]
    fn map_failure_rolls_back_every_chunk() {
        let mapper = MockMapper::new();
        let mut r = ring();
        send(&mut r, &mapper, NetBuf::from_slice(&[0; 10]));
        let live_before = mapper.live_count();
        let outstanding_before = r.outstanding();
        let produce_before = r.produce_idx();

        for k in 0..4 {
            let mut pkt = NetBuf::from_slice(&[0; 100]);
            for _ in 0..4 {
                pkt.push_frag(vec![0; 100]);
            }
            mapper.fail_after(k);
            let failure = plan(&r, &mapper, pkt, params()).err();
            let failure = failure.unwrap_or_else(|| panic!("expected map failure"));
            assert!(matches!(failure.error, SegmentError::Map(DmaError::MappingFailed { .. })));
            assert_eq!(failure.pkt.frags().len(), 4);
            assert_eq!(mapper.live_count(), live_before);
            assert_eq!(r.outstanding(), outstanding_before);
            assert_eq!(r.produce_idx(), produce_before);
            assert!((1..64).all(|i| r.slot(i).is_free()));
        }
        assert_eq!(mapper.bad_unmaps(), 0);
        mapper.clear_failure();
        send(&mut r, &mapper, NetBuf::from_slice(&[0; 10]));
        assert_eq!(r.outstanding(), 2);
    }

    #[test]
    fn oversized_and_empty_packets_are_rejected() {
        let mapper = MockMapper::new();
        let r = ring();
        let mut pkt = NetBuf::from_slice(&[0; 10]);
        for _ in 0..70 {
            pkt.push_frag(vec![0; 10]);
        }
        let failure = plan(&r, &mapper, pkt, params()).err();
        assert!(matches!(
            failure.map(|f| f.error),
            Some(SegmentError::Oversized { needed: 71 })
        ));
        let failure = plan(&r, &mapper, NetBuf::from_slice(&[]), params()).err();
        assert!(matches!(failure.map(|f| f.error), Some(SegmentError::Map(_))));
        assert_eq!(mapper.live_count(), 0);
    }
}
