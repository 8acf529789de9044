// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 pfnet developers

//! Rendezvous between the reader thread and callers waiting on it.
//!
//! Two kinds of waiters share one mutex/condvar pair: route queries
//! waiting for the reply carrying their sequence number, and virtual-IP
//! installers waiting for the cache to reflect a kernel event. The reader
//! broadcasts after every inbound message; with a handful of waiters at
//! most, finer signaling is not worth having.
//!
//! At most one route query is in flight. `waiting_seq` is nonzero exactly
//! while a query owns the slot; later queries wait their turn on the
//! condvar.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::wire;
use crate::Result;

#[derive(Default)]
struct ReplySlot {
    /// Sequence number the in-flight query waits for; 0 when idle.
    waiting_seq: i32,
    /// Last matched reply, reused (and regrown) across queries.
    reply: Vec<u8>,
}

fn reply_matches(reply: &[u8], seq: i32) -> bool {
    if reply.len() < wire::RT_MSGHDR_LEN {
        return false;
    }
    matches!(wire::peek_pid_seq(reply), Some((_, s)) if s == seq)
}

pub(crate) struct Rendezvous {
    state: Mutex<ReplySlot>,
    cond: Condvar,
}

impl Rendezvous {
    pub fn new() -> Self {
        Rendezvous {
            state: Mutex::new(ReplySlot::default()),
            cond: Condvar::new(),
        }
    }

    /// Reader-side hand-off. Copies the message into the reply slot when
    /// its (pid, seq) matches the awaited query, then wakes every waiter;
    /// virtual-IP waiters re-check their cache predicate on any message.
    pub fn deliver(&self, own_pid: i32, msg: &[u8]) {
        let mut slot = self.state.lock();
        if let Some((pid, seq)) = wire::peek_pid_seq(msg) {
            if pid == own_pid && seq == slot.waiting_seq {
                let len = wire::declared_len(msg)
                    .unwrap_or(msg.len())
                    .min(msg.len());
                slot.reply.clear();
                slot.reply.extend_from_slice(&msg[..len]);
            }
        }
        self.cond.notify_all();
    }

    /// Run one route query: wait for the slot, publish `seq`, send the
    /// request, then wait up to `timeout` for the matching reply.
    ///
    /// `Ok(None)` means the kernel did not answer in time; the slot is
    /// released either way so the next query can proceed.
    pub fn query(
        &self,
        seq: i32,
        timeout: Duration,
        send: impl FnOnce() -> Result<()>,
    ) -> Result<Option<Vec<u8>>> {
        let mut slot = self.state.lock();
        while slot.waiting_seq != 0 {
            self.cond.wait(&mut slot);
        }
        slot.waiting_seq = seq;

        let result = match send() {
            Err(e) => Err(e),
            Ok(()) => {
                let mut reply = None;
                loop {
                    if self.cond.wait_for(&mut slot, timeout).timed_out() {
                        break;
                    }
                    if reply_matches(&slot.reply, seq) {
                        reply = Some(slot.reply.clone());
                        break;
                    }
                }
                Ok(reply)
            }
        };

        slot.waiting_seq = 0;
        self.cond.notify_one();
        drop(slot);
        result
    }

    /// Wait in bounded steps until `done` reports true, re-checking after
    /// every reader broadcast. Returns false when one full step passes
    /// without the condition holding.
    pub fn wait_until(&self, step: Duration, mut done: impl FnMut() -> bool) -> bool {
        let mut slot = self.state.lock();
        loop {
            if done() {
                return true;
            }
            if self.cond.wait_for(&mut slot, step).timed_out() {
                return false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{testmsg, RTA_GATEWAY, RTF_UP, RTM_GET};
    use crate::Error;
    use std::net::IpAddr;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    const PID: i32 = 4321;

    fn gw() -> IpAddr {
        "10.0.0.1".parse().unwrap()
    }

    fn reply_for(seq: i32) -> Vec<u8> {
        testmsg::route_reply(RTM_GET, RTF_UP, PID, seq, &[(RTA_GATEWAY, gw())])
    }

    #[test]
    fn test_query_receives_matching_reply() {
        let rv = Arc::new(Rendezvous::new());
        let r = Arc::clone(&rv);

        let deliverer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            // Wrong seq first; the waiter must keep waiting.
            r.deliver(PID, &reply_for(99));
            thread::sleep(Duration::from_millis(20));
            r.deliver(PID, &reply_for(7));
        });

        let reply = rv
            .query(7, Duration::from_millis(500), || Ok(()))
            .unwrap()
            .expect("should get reply");
        assert!(reply_matches(&reply, 7));

        deliverer.join().unwrap();
    }

    #[test]
    fn test_query_ignores_foreign_pid() {
        let rv = Arc::new(Rendezvous::new());
        let r = Arc::clone(&rv);

        let deliverer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            let mut msg = reply_for(7);
            // Rewrite the pid field: not our process.
            msg[16..20].copy_from_slice(&9999i32.to_ne_bytes());
            r.deliver(PID, &msg);
        });

        let reply = rv.query(7, Duration::from_millis(80), || Ok(())).unwrap();
        assert!(reply.is_none());
        deliverer.join().unwrap();
    }

    #[test]
    fn test_query_timeout_releases_slot() {
        let rv = Rendezvous::new();

        let start = Instant::now();
        let reply = rv.query(5, Duration::from_millis(50), || Ok(())).unwrap();
        assert!(reply.is_none());
        assert!(start.elapsed() >= Duration::from_millis(45));

        // The next query must not inherit a stuck slot (a timed-out query
        // may not wedge its successors).
        let rv2 = Arc::new(rv);
        let r = Arc::clone(&rv2);
        let deliverer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            r.deliver(PID, &reply_for(6));
        });
        let reply = rv2
            .query(6, Duration::from_millis(500), || Ok(()))
            .unwrap();
        assert!(reply.is_some());
        deliverer.join().unwrap();
    }

    #[test]
    fn test_send_failure_clears_slot() {
        let rv = Rendezvous::new();
        let result = rv.query(5, Duration::from_millis(500), || {
            Err(Error::Send(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "down",
            )))
        });
        assert!(result.is_err());

        // Slot released: a follow-up query times out normally instead of
        // queueing behind the failed one.
        let start = Instant::now();
        let reply = rv.query(6, Duration::from_millis(30), || Ok(())).unwrap();
        assert!(reply.is_none());
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn test_single_query_in_flight() {
        let rv = Arc::new(Rendezvous::new());
        let started = Arc::new(AtomicBool::new(false));

        let r = Arc::clone(&rv);
        let s = Arc::clone(&started);
        let first = thread::spawn(move || {
            r.query(1, Duration::from_millis(150), || {
                s.store(true, Ordering::SeqCst);
                Ok(())
            })
            .unwrap()
        });

        // Once the first query owns the slot, a second query must queue
        // behind it for the full remainder of the first one's wait.
        while !started.load(Ordering::SeqCst) {
            thread::yield_now();
        }
        thread::sleep(Duration::from_millis(30));
        let start = Instant::now();
        let reply = rv.query(2, Duration::from_millis(10), || Ok(())).unwrap();
        assert!(reply.is_none());
        assert!(
            start.elapsed() >= Duration::from_millis(100),
            "second query ran while the first was still in flight"
        );
        assert!(first.join().unwrap().is_none());
    }

    #[test]
    fn test_wait_until_woken_by_delivery() {
        let rv = Arc::new(Rendezvous::new());
        let flag = Arc::new(AtomicBool::new(false));

        let r = Arc::clone(&rv);
        let f = Arc::clone(&flag);
        let setter = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            f.store(true, Ordering::SeqCst);
            // Any message wakes predicate waiters.
            r.deliver(PID, &reply_for(0));
        });

        let f = Arc::clone(&flag);
        let ok = rv.wait_until(Duration::from_millis(500), || f.load(Ordering::SeqCst));
        assert!(ok);
        setter.join().unwrap();
    }

    #[test]
    fn test_wait_until_times_out() {
        let rv = Rendezvous::new();
        let start = Instant::now();
        let ok = rv.wait_until(Duration::from_millis(40), || false);
        assert!(!ok);
        assert!(start.elapsed() >= Duration::from_millis(35));
    }

    #[test]
    fn test_wait_until_immediate() {
        let rv = Rendezvous::new();
        assert!(rv.wait_until(Duration::from_millis(500), || true));
    }
}
