//! Poll scheduling state for one direction of one channel.
//!
//! ```text
//!   Idle ──schedule──▶ Scheduled ──begin_poll──▶ Polling ──complete──▶ Idle
//!                          ▲                        │
//!                          └──────reschedule────────┘
//! ```
//!
//! `disable` parks the context in `Disabled` once no poll is running; that
//! is the teardown barrier. A poll still running when `disable` starts sees
//! `Stopping`: its `complete`/`reschedule` fail and it must not re-arm the
//! interrupt. Interrupts raised afterwards cannot schedule.
//!
//! The interrupt is re-armed after `complete` and masked for teardown after
//! `disable`, both under [`NapiContext::arm_guard`], so a late re-arm can
//! never land after the final mask.

use core::sync::atomic::{AtomicU8, Ordering};

use spin::{Mutex, MutexGuard};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NapiState {
    Idle = 0,
    Scheduled = 1,
    Polling = 2,
    Disabled = 3,
    /// `disable` is waiting for the running poll to finish.
    Stopping = 4,
}

pub struct NapiContext {
    state: AtomicU8,
    budget: usize,
    arm: Mutex<()>,
}

impl NapiContext {
    pub const fn new(budget: usize) -> Self {
        Self {
            state: AtomicU8::new(NapiState::Idle as u8),
            budget,
            arm: Mutex::new(()),
        }
    }

    #[inline]
    pub fn budget(&self) -> usize {
        self.budget
    }

    #[inline]
    pub fn state(&self) -> NapiState {
        match self.state.load(Ordering::Acquire) {
            1 => NapiState::Scheduled,
            2 => NapiState::Polling,
            3 => NapiState::Disabled,
            4 => NapiState::Stopping,
            _ => NapiState::Idle,
        }
    }

    #[inline]
    pub fn is_scheduled(&self) -> bool {
        matches!(self.state(), NapiState::Scheduled)
    }

    /// Being torn down or already parked.
    #[inline]
    pub fn is_disabled(&self) -> bool {
        matches!(self.state(), NapiState::Disabled | NapiState::Stopping)
    }

    fn transition(&self, from: NapiState, to: NapiState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Leave `Polling` for `to`, or hand the context to a waiting `disable`.
    fn finish_poll(&self, to: NapiState) -> bool {
        if self.transition(NapiState::Polling, to) {
            return true;
        }
        self.transition(NapiState::Stopping, NapiState::Disabled);
        false
    }

    /// Lock serialising interrupt re-arm against the teardown mask.
    pub fn arm_guard(&self) -> MutexGuard<'_, ()> {
        self.arm.lock()
    }

    /// Idle → Scheduled. False if a poll is already scheduled or running.
    pub fn schedule(&self) -> bool {
        self.transition(NapiState::Idle, NapiState::Scheduled)
    }

    pub fn begin_poll(&self) -> bool {
        self.transition(NapiState::Scheduled, NapiState::Polling)
    }

    /// Polling → Idle. Only on `true` may the caller re-arm the interrupt.
    pub fn complete(&self) -> bool {
        self.finish_poll(NapiState::Idle)
    }

    /// Polling → Scheduled: budget exhausted, poll again without an interrupt.
    /// False when the context is being disabled.
    pub fn reschedule(&self) -> bool {
        self.finish_poll(NapiState::Scheduled)
    }

    /// Wait out any running poll, then park in `Disabled`.
    pub fn disable(&self) {
        loop {
            match self.state() {
                NapiState::Disabled => return,
                NapiState::Stopping => core::hint::spin_loop(),
                NapiState::Polling => {
                    self.transition(NapiState::Polling, NapiState::Stopping);
                }
                from => {
                    if self.transition(from, NapiState::Disabled) {
                        return;
                    }
                }
            }
        }
    }

    pub fn enable(&self) {
        self.transition(NapiState::Disabled, NapiState::Idle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_is_exclusive() {
        let napi = NapiContext::new(64);
        assert!(napi.schedule());
        assert!(!napi.schedule());
        assert!(napi.begin_poll());
        assert!(!napi.schedule());
        assert!(napi.reschedule());
        assert!(napi.is_scheduled());
        assert!(napi.begin_poll());
        assert!(napi.complete());
        assert_eq!(napi.state(), NapiState::Idle);
    }

    #[test]
    fn disabled_context_ignores_interrupts() {
        let napi = NapiContext::new(64);
        assert!(napi.schedule());
        napi.disable();
        assert_eq!(napi.state(), NapiState::Disabled);
        assert!(!napi.schedule());
        assert!(!napi.begin_poll());
        napi.enable();
        assert!(napi.schedule());
    }

    #[test]
    fn disable_waits_for_running_poll() {
        use alloc::sync::Arc;
        use std::thread;

        let napi = Arc::new(NapiContext::new(64));
        assert!(napi.schedule());
        assert!(napi.begin_poll());
        let poller = {
            let napi = napi.clone();
            thread::spawn(move || {
                while napi.state() != NapiState::Stopping {
                    thread::yield_now();
                }
                napi.complete()
            })
        };
        napi.disable();
        assert_eq!(napi.state(), NapiState::Disabled);
        // The poll that was running when disable started may not re-arm.
        assert_eq!(poller.join().ok(), Some(false));
        assert!(napi.is_disabled());
        assert!(!napi.schedule());
    }

    #[test]
    fn reschedule_fails_once_disable_is_pending() {
        use alloc::sync::Arc;
        use std::thread;

        let napi = Arc::new(NapiContext::new(8));
        assert!(napi.schedule());
        assert!(napi.begin_poll());
        let teardown = {
            let napi = napi.clone();
            thread::spawn(move || napi.disable())
        };
        while napi.state() != NapiState::Stopping {
            thread::yield_now();
        }
        assert!(!napi.reschedule());
        assert!(teardown.join().is_ok());
        assert_eq!(napi.state(), NapiState::Disabled);
        assert!(!napi.begin_poll());
    }
}
