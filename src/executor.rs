// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Channel-owned executors: a worker pool for callable execution and a
//! single-threaded, sequence-numbered executor for stream side effects.
//!
//! `close` only stops intake (safe from any thread, including the workers
//! themselves during teardown); `join` additionally reaps the threads and is
//! called from the owning side.

use std::panic;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::thread;
use std::thread::JoinHandle;

use crossbeam_channel::Receiver;
use crossbeam_channel::Sender;

use crate::prelude::*;

type Job = Box<dyn FnOnce() + Send + 'static>;

fn run_job(job: Job) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
        let msg = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "opaque panic payload".to_string());
        warn!("worker job panicked: {msg}");
    }
}

fn worker_loop(rx: Receiver<Job>) {
    while let Ok(job) = rx.recv() {
        run_job(job);
    }
}

fn join_all(handles: &Mutex<Vec<JoinHandle<()>>>) {
    let current = thread::current().id();
    for handle in handles.lock().unwrap().drain(..) {
        if handle.thread().id() == current {
            continue;
        }
        _ = handle.join();
    }
}

/// Fixed-size pool draining a shared queue, in the same shape as the
/// read/write loop threads: named `std::thread`s over a crossbeam channel.
pub struct WorkerPool {
    tx: Mutex<Option<Sender<Job>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(name: &str, size: usize) -> Self {
        let size = size.max(1);
        let (tx, rx) = crossbeam_channel::unbounded::<Job>();
        let handles = (0..size)
            .map(|i| {
                let rx = rx.clone();
                thread::Builder::new()
                    .name(format!("{name}-{i}"))
                    .spawn(move || worker_loop(rx))
                    .expect("spawning worker thread")
            })
            .collect();
        Self {
            tx: Mutex::new(Some(tx)),
            handles: Mutex::new(handles),
        }
    }

    /// Queues a job. Returns false after close.
    pub fn submit(&self, job: impl FnOnce() + Send + 'static) -> bool {
        match &*self.tx.lock().unwrap() {
            Some(tx) => tx.send(Box::new(job)).is_ok(),
            None => false,
        }
    }

    /// Queues a job and blocks for its result.
    pub fn run<R: Send + 'static>(&self, job: impl FnOnce() -> R + Send + 'static) -> Result<R> {
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        if !self.submit(move || {
            _ = done_tx.send(job());
        }) {
            bail!("worker pool is shut down");
        }
        done_rx.recv().location_ctx("worker job dropped its result")
    }

    /// Stops intake; queued jobs still drain.
    pub fn close(&self) {
        *self.tx.lock().unwrap() = None;
    }

    pub fn join(&self) {
        self.close();
        join_all(&self.handles);
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.join();
    }
}

struct Progress {
    executed: Mutex<u64>,
    cond: Condvar,
    closed: Mutex<bool>,
}

/// The pipe-writer: one thread executing stream side effects in submission
/// order, with a sequence number per task so a response can wait until the
/// side effects that preceded it are visible.
pub struct IoExecutor {
    tx: Mutex<Option<Sender<Job>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    next_id: AtomicU64,
    progress: Arc<Progress>,
}

impl IoExecutor {
    pub fn new(name: &str) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded::<Job>();
        let progress = Arc::new(Progress {
            executed: Mutex::new(0),
            cond: Condvar::new(),
            closed: Mutex::new(false),
        });
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || worker_loop(rx))
            .expect("spawning pipe-writer thread");
        Self {
            tx: Mutex::new(Some(tx)),
            handle: Mutex::new(Some(handle)),
            next_id: AtomicU64::new(0),
            progress,
        }
    }

    /// Queues a task and returns its sequence id (1-based, FIFO order).
    /// After close the task runs inline so completions still happen.
    pub fn submit(&self, job: impl FnOnce() + Send + 'static) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let progress = Arc::clone(&self.progress);
        let wrapped = move || {
            job();
            let mut executed = progress.executed.lock().unwrap();
            *executed = (*executed).max(id);
            progress.cond.notify_all();
        };
        let mut job: Option<Job> = Some(Box::new(wrapped));
        if let Some(tx) = &*self.tx.lock().unwrap() {
            if let Err(returned) = tx.send(job.take().unwrap()) {
                job = Some(returned.into_inner());
            }
        }
        if let Some(job) = job {
            // Closed: run inline so completions still happen.
            run_job(job);
        }
        id
    }

    pub fn executed(&self) -> u64 {
        *self.progress.executed.lock().unwrap()
    }

    /// Blocks until task `id` has executed (or the executor closed).
    pub fn wait_for(&self, id: u64) {
        let mut executed = self.progress.executed.lock().unwrap();
        while *executed < id {
            if *self.progress.closed.lock().unwrap() {
                return;
            }
            executed = self.progress.cond.wait(executed).unwrap();
        }
    }

    /// Stops intake and wakes every `wait_for`.
    pub fn close(&self) {
        *self.tx.lock().unwrap() = None;
        *self.progress.closed.lock().unwrap() = true;
        self.progress.cond.notify_all();
    }

    pub fn join(&self) {
        self.close();
        let current = thread::current().id();
        if let Some(handle) = self.handle.lock().unwrap().take() {
            if handle.thread().id() != current {
                _ = handle.join();
            }
        }
    }
}

impl Drop for IoExecutor {
    fn drop(&mut self) {
        self.join();
    }
}
