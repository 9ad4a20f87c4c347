//! Deterministic DMA mapper for tests.
//!
//! Hands out increasing fake bus addresses, tracks every live mapping so a
//! test can assert nothing leaked, can be told to fail the Nth mapping, and
//! models device writes: bytes queued with [`MockMapper::device_write`] are
//! copied into the CPU buffer on [`DmaMapper::sync_for_cpu`].

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use nveth_abi::{DmaAddr, DmaDirection};
use spin::Mutex;

use crate::dma::DmaMapper;
use crate::error::{DmaError, DmaResult};

const MOCK_DMA_BASE: u64 = 0x1_0000_0000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LiveMapping {
    pub len: usize,
    pub dir: DmaDirection,
}

struct MockInner {
    next_addr: u64,
    live: BTreeMap<u64, LiveMapping>,
    device_mem: BTreeMap<u64, Vec<u8>>,
    maps: usize,
    unmaps: usize,
    fail_after: Option<usize>,
    bad_unmaps: usize,
}

pub struct MockMapper {
    inner: Mutex<MockInner>,
}

impl Default for MockMapper {
    fn default() -> Self {
        Self::new()
    }
}

impl MockMapper {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MockInner {
                next_addr: MOCK_DMA_BASE,
                live: BTreeMap::new(),
                device_mem: BTreeMap::new(),
                maps: 0,
                unmaps: 0,
                fail_after: None,
                bad_unmaps: 0,
            }),
        }
    }

    /// Let `n` more mappings succeed, then fail every one after.
    pub fn fail_after(&self, n: usize) {
        self.inner.lock().fail_after = Some(n);
    }

    pub fn clear_failure(&self) {
        self.inner.lock().fail_after = None;
    }

    pub fn live_count(&self) -> usize {
        self.inner.lock().live.len()
    }

    pub fn is_live(&self, addr: DmaAddr) -> bool {
        self.inner.lock().live.contains_key(&addr.as_u64())
    }

    pub fn map_calls(&self) -> usize {
        self.inner.lock().maps
    }

    pub fn unmap_calls(&self) -> usize {
        self.inner.lock().unmaps
    }

    /// Unmaps that named an address, length or direction never mapped.
    pub fn bad_unmaps(&self) -> usize {
        self.inner.lock().bad_unmaps
    }

    /// Stage bytes the device "wrote" at `addr`.
    pub fn device_write(&self, addr: DmaAddr, bytes: &[u8]) {
        self.inner
            .lock()
            .device_mem
            .insert(addr.as_u64(), bytes.to_vec());
    }
}

impl DmaMapper for MockMapper {
    fn map(&self, dir: DmaDirection, buf: &[u8]) -> DmaResult<DmaAddr> {
        let mut inner = self.inner.lock();
        if buf.is_empty() {
            return Err(DmaError::InvalidLength { len: 0 });
        }
        if let Some(left) = inner.fail_after.as_mut() {
            if *left == 0 {
                return Err(DmaError::MappingFailed { len: buf.len() });
            }
            *left -= 1;
        }
        let addr = inner.next_addr;
        // Keep addresses page-spaced so overlapping ranges are impossible.
        inner.next_addr += ((buf.len() as u64) + 0xFFF) & !0xFFF;
        inner.live.insert(
            addr,
            LiveMapping {
                len: buf.len(),
                dir,
            },
        );
        inner.maps += 1;
        Ok(DmaAddr::new(addr))
    }

    fn unmap(&self, addr: DmaAddr, len: usize, dir: DmaDirection) {
        let mut inner = self.inner.lock();
        inner.unmaps += 1;
        match inner.live.remove(&addr.as_u64()) {
            Some(m) if m.len == len && m.dir == dir => {}
            _ => inner.bad_unmaps += 1,
        }
        inner.device_mem.remove(&addr.as_u64());
    }

    fn sync_for_cpu(&self, addr: DmaAddr, buf: &mut [u8]) {
        let inner = self.inner.lock();
        if let Some(bytes) = inner.device_mem.get(&addr.as_u64()) {
            let n = bytes.len().min(buf.len());
            buf[..n].copy_from_slice(&bytes[..n]);
        }
    }
}
