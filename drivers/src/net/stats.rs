//! Per-channel counters.
//!
//! Counters are owned by the channel that increments them and read through
//! a [`ChannelStatsSnapshot`]. Increments are `Relaxed`; a snapshot is not
//! a consistent cut across fields.

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    #[inline]
    pub fn inc(&self) {
        self.add(1);
    }

    #[inline]
    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

macro_rules! channel_stats {
    ($($(#[$doc:meta])* $field:ident),* $(,)?) => {
        #[derive(Debug, Default)]
        pub struct ChannelStats {
            $($(#[$doc])* pub $field: Counter,)*
        }

        /// Read-only copy of [`ChannelStats`].
        #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
        pub struct ChannelStatsSnapshot {
            $($(#[$doc])* pub $field: u64,)*
        }

        impl ChannelStats {
            pub fn snapshot(&self) -> ChannelStatsSnapshot {
                ChannelStatsSnapshot {
                    $($field: self.$field.get(),)*
                }
            }
        }
    };
}

channel_stats! {
    tx_packets,
    tx_bytes,
    /// Completions reporting a transmit error.
    tx_errors,
    /// Packets dropped because a fragment could not be mapped.
    tx_dropped,
    tx_vlan,
    tx_tso,
    tx_irq,
    /// Times the queue was stopped for lack of descriptors.
    tx_stalls,
    tx_wakes,
    rx_packets,
    rx_bytes,
    rx_errors,
    rx_irq,
    /// Completions that landed in the reserved buffer.
    rx_reserved,
    /// Split frames recycled without delivery.
    rx_split,
    /// Interrupts raised while a poll was already scheduled.
    napi_already_scheduled,
    /// Hardware reported more work than asked for, or no progress.
    poll_anomalies,
}

impl ChannelStatsSnapshot {
    #[inline]
    pub const fn total_packets(&self) -> u64 {
        self.rx_packets + self.tx_packets
    }

    #[inline]
    pub const fn total_errors(&self) -> u64 {
        self.rx_errors + self.tx_errors
    }
}

impl fmt::Display for ChannelStatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rx: {} pkts/{} bytes, tx: {} pkts/{} bytes, err: {}/{}, drop: {}, stalls: {}/{}",
            self.rx_packets,
            self.rx_bytes,
            self.tx_packets,
            self.tx_bytes,
            self.rx_errors,
            self.tx_errors,
            self.tx_dropped,
            self.tx_stalls,
            self.tx_wakes
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::format;

    #[test]
    fn snapshot_copies_counters() {
        let stats = ChannelStats::default();
        stats.tx_packets.inc();
        stats.tx_bytes.add(1500);
        stats.rx_packets.add(2);
        let snap = stats.snapshot();
        assert_eq!(snap.tx_bytes, 1500);
        assert_eq!(snap.total_packets(), 3);
        stats.tx_packets.inc();
        assert_eq!(snap.tx_packets, 1);
        assert!(format!("{}", snap).starts_with("rx: 2 pkts/0 bytes"));
    }
}
