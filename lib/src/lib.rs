#![no_std]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod clock;
pub mod cmdline;
pub mod klog;
pub mod spsc;

pub use clock::{ManualClock, MonotonicClock, elapsed_ms};
pub use klog::{
    KlogBackend, KlogLevel, klog_clear_backend, klog_get_level, klog_init, klog_is_enabled,
    klog_register_backend, klog_set_level,
};
