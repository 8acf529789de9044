// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 pfnet developers

//! Debounced roam-event dispatch.
//!
//! Interface and address churn tends to arrive in bursts (a link flap
//! produces several messages within milliseconds). Upper layers only need
//! one signal per burst, so a roam callback is scheduled after a short
//! delay and further requests inside the window are dropped.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::monitor::NetCallbacks;
use crate::sched::Scheduler;

pub(crate) struct RoamDebouncer {
    delay: Duration,
    /// Gate instant: a new event may be scheduled only strictly after it.
    last: Mutex<Option<Instant>>,
}

impl RoamDebouncer {
    pub fn new(delay: Duration) -> Self {
        RoamDebouncer {
            delay,
            last: Mutex::new(None),
        }
    }

    /// Schedule one upstream roam callback after the delay, unless one is
    /// already pending for this window.
    pub fn fire(&self, sched: &Scheduler, callbacks: &Arc<dyn NetCallbacks>, address: bool) {
        let now = Instant::now();
        let mut last = self.last.lock();
        let open = last.map_or(true, |gate| now > gate);
        if open {
            *last = Some(now + self.delay);
            let cb = Arc::clone(callbacks);
            sched.schedule_in(self.delay, move || cb.roam(address));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    struct Recorder {
        roams: AtomicUsize,
        with_address: AtomicUsize,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Recorder {
                roams: AtomicUsize::new(0),
                with_address: AtomicUsize::new(0),
            })
        }
    }

    impl NetCallbacks for Recorder {
        fn is_interface_usable(&self, _name: &str) -> bool {
            true
        }

        fn roam(&self, address_changed: bool) {
            self.roams.fetch_add(1, Ordering::SeqCst);
            if address_changed {
                self.with_address.fetch_add(1, Ordering::SeqCst);
            }
        }

        fn tun_registered(&self, _name: &str, _installed: bool) {}
    }

    #[test]
    fn test_burst_coalesces_to_one_event() {
        let sched = Scheduler::new();
        let recorder = Recorder::new();
        let callbacks: Arc<dyn NetCallbacks> = recorder.clone();
        let debouncer = RoamDebouncer::new(Duration::from_millis(100));

        for _ in 0..3 {
            debouncer.fire(&sched, &callbacks, true);
            thread::sleep(Duration::from_millis(5));
        }

        thread::sleep(Duration::from_millis(300));
        assert_eq!(recorder.roams.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.with_address.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_fires_again_after_window() {
        let sched = Scheduler::new();
        let recorder = Recorder::new();
        let callbacks: Arc<dyn NetCallbacks> = recorder.clone();
        let debouncer = RoamDebouncer::new(Duration::from_millis(20));

        debouncer.fire(&sched, &callbacks, false);
        thread::sleep(Duration::from_millis(80));
        debouncer.fire(&sched, &callbacks, false);
        thread::sleep(Duration::from_millis(80));

        assert_eq!(recorder.roams.load(Ordering::SeqCst), 2);
        assert_eq!(recorder.with_address.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_event_arrives_after_delay_not_before() {
        let sched = Scheduler::new();
        let recorder = Recorder::new();
        let callbacks: Arc<dyn NetCallbacks> = recorder.clone();
        let debouncer = RoamDebouncer::new(Duration::from_millis(150));

        debouncer.fire(&sched, &callbacks, true);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(recorder.roams.load(Ordering::SeqCst), 0);
        thread::sleep(Duration::from_millis(300));
        assert_eq!(recorder.roams.load(Ordering::SeqCst), 1);
    }
}
