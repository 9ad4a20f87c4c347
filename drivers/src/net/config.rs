//! Driver configuration from `key=value` tokens.
//!
//! Unknown keys are ignored and unparsable values keep the default, so a
//! bad token never prevents the interface from coming up.

use nveth_abi::{ChannelDir, MAX_DMA_CHANNELS, MacClass, NAPI_WEIGHT};
use nveth_lib::cmdline::{parse_bool, parse_ms, parse_u32, tokens};
use nveth_lib::{KlogLevel, klog_info, klog_set_level, klog_warn};

use super::ring::validate_ring_size;

pub const NVGRO_AGE_THRESHOLD_MS: u64 = 500;
pub const NVGRO_PURGE_TIMER_MS: u64 = 5000;

/// Ethernet frame plus VLAN tag and FCS, rounded up, plus headroom.
pub const DEFAULT_RX_BUF_LEN: usize = 1536 + 64;

/// Hardware transmit timestamping mode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PtpMode {
    #[default]
    Off,
    /// Timestamp reported after transmit, matched by packet id.
    TwoStep,
    /// Timestamp inserted by hardware; needs a context descriptor.
    OneStep,
}

impl PtpMode {
    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "off" | "0" => Some(Self::Off),
            "twostep" | "two-step" => Some(Self::TwoStep),
            "onestep" | "one-step" => Some(Self::OneStep),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EtherConfig {
    pub mac: MacClass,
    pub tx_ring_size: usize,
    pub rx_ring_size: usize,
    pub channels: u32,
    pub napi_budget: usize,
    pub rx_buf_len: usize,
    pub nvgro: bool,
    pub nvgro_pkt_age_ms: u64,
    pub nvgro_timer_ms: u64,
    pub ptp: PtpMode,
}

impl Default for EtherConfig {
    fn default() -> Self {
        Self::for_class(MacClass::default())
    }
}

impl EtherConfig {
    pub fn for_class(mac: MacClass) -> Self {
        Self {
            mac,
            tx_ring_size: mac.default_ring_size(),
            rx_ring_size: mac.default_ring_size(),
            channels: 1,
            napi_budget: NAPI_WEIGHT,
            rx_buf_len: DEFAULT_RX_BUF_LEN,
            nvgro: true,
            nvgro_pkt_age_ms: NVGRO_AGE_THRESHOLD_MS,
            nvgro_timer_ms: NVGRO_PURGE_TIMER_MS,
            ptp: PtpMode::Off,
        }
    }

    /// Replace out-of-range ring sizes with the class default.
    pub fn sanitize(&mut self) {
        for dir in [ChannelDir::Tx, ChannelDir::Rx] {
            let size = match dir {
                ChannelDir::Tx => &mut self.tx_ring_size,
                ChannelDir::Rx => &mut self.rx_ring_size,
            };
            if validate_ring_size(*size, self.mac, dir).is_err() {
                let fallback = self.mac.default_ring_size();
                klog_info!(
                    "nveth: invalid {} ring size {}, using {}",
                    dir,
                    *size,
                    fallback
                );
                *size = fallback;
            }
        }
        if self.channels == 0 || self.channels as usize > MAX_DMA_CHANNELS {
            klog_warn!("nveth: {} channels unsupported, using 1", self.channels);
            self.channels = 1;
        }
        if self.napi_budget == 0 {
            self.napi_budget = NAPI_WEIGHT;
        }
    }
}

/// Build a configuration from a command line. `None` yields the defaults.
///
/// The hardware class is read first since it decides the ring defaults.
pub fn config_from_cmdline(cmdline: Option<&str>) -> EtherConfig {
    let Some(cmdline) = cmdline else {
        return EtherConfig::default();
    };

    let mac = tokens(cmdline)
        .filter(|(key, _)| *key == "nveth.mac")
        .filter_map(|(_, value)| MacClass::from_str(value))
        .last()
        .unwrap_or_default();
    let mut cfg = EtherConfig::for_class(mac);

    for (key, value) in tokens(cmdline) {
        match key {
            "nveth.tx_ring" => {
                if let Some(n) = parse_u32(value) {
                    cfg.tx_ring_size = n as usize;
                }
            }
            "nveth.rx_ring" => {
                if let Some(n) = parse_u32(value) {
                    cfg.rx_ring_size = n as usize;
                }
            }
            "nveth.channels" => {
                if let Some(n) = parse_u32(value) {
                    cfg.channels = n;
                }
            }
            "nveth.napi_budget" => {
                if let Some(n) = parse_u32(value) {
                    cfg.napi_budget = n as usize;
                }
            }
            "nveth.rx_buf_len" => {
                if let Some(n) = parse_u32(value).filter(|n| *n > 0) {
                    cfg.rx_buf_len = n as usize;
                }
            }
            "nveth.nvgro" => {
                if let Some(on) = parse_bool(value) {
                    cfg.nvgro = on;
                }
            }
            "nveth.nvgro.pkt_age_ms" => {
                if let Some(ms) = parse_ms(value) {
                    cfg.nvgro_pkt_age_ms = ms as u64;
                }
            }
            "nveth.nvgro.timer_ms" => {
                if let Some(ms) = parse_ms(value).filter(|ms| *ms > 0) {
                    cfg.nvgro_timer_ms = ms as u64;
                }
            }
            "nveth.ptp" => {
                if let Some(mode) = PtpMode::from_str(value) {
                    cfg.ptp = mode;
                }
            }
            "nveth.log" => {
                if let Some(level) = KlogLevel::from_str(value) {
                    klog_set_level(level);
                }
            }
            _ => {}
        }
    }

    cfg.sanitize();
    cfg
}
