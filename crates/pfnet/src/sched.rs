// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 pfnet developers

//! Delayed-job scheduler.
//!
//! One worker thread owns a deadline-ordered heap. Submissions arrive
//! over a channel; dropping the scheduler drops the sender, which wakes
//! the worker with a disconnect and stops it. Jobs that are not yet due
//! at shutdown are discarded.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};

type Job = Box<dyn FnOnce() + Send>;

struct Entry {
    due: Instant,
    order: u64,
    job: Job,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.order == other.order
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: the earliest deadline sits on top of the max-heap.
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.order.cmp(&self.order))
    }
}

/// Runs closures after a delay, in deadline order, on one worker thread.
pub struct Scheduler {
    tx: Option<Sender<Entry>>,
    order: AtomicU64,
    worker: Option<JoinHandle<()>>,
}

impl Scheduler {
    pub fn new() -> Self {
        let (tx, rx) = channel::unbounded();
        #[allow(clippy::expect_used)] // thread spawn failure is unrecoverable
        let worker = thread::Builder::new()
            .name("pfnet-sched".to_string())
            .spawn(move || worker_loop(&rx))
            .expect("failed to spawn scheduler thread");

        Scheduler {
            tx: Some(tx),
            order: AtomicU64::new(0),
            worker: Some(worker),
        }
    }

    /// Run `job` on the worker thread once `delay` has elapsed.
    pub fn schedule_in(&self, delay: Duration, job: impl FnOnce() + Send + 'static) {
        if let Some(tx) = &self.tx {
            let entry = Entry {
                due: Instant::now() + delay,
                order: self.order.fetch_add(1, AtomicOrdering::Relaxed),
                job: Box::new(job),
            };
            let _ = tx.send(entry);
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        // Dropping the sender disconnects the channel and stops the
        // worker at its next wakeup.
        drop(self.tx.take());
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn worker_loop(rx: &Receiver<Entry>) {
    let mut heap: BinaryHeap<Entry> = BinaryHeap::new();
    loop {
        let wait = heap
            .peek()
            .map(|e| e.due.saturating_duration_since(Instant::now()));

        let received = match wait {
            None => match rx.recv() {
                Ok(entry) => Some(entry),
                Err(_) => break,
            },
            Some(timeout) => match rx.recv_timeout(timeout) {
                Ok(entry) => Some(entry),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => break,
            },
        };
        if let Some(entry) = received {
            heap.push(entry);
        }

        while heap.peek().is_some_and(|e| e.due <= Instant::now()) {
            if let Some(entry) = heap.pop() {
                (entry.job)();
            }
        }
    }
}
