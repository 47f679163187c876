// SPDX-License-Identifier: Apache-2.0

//! Thread pool with per-thread FIFO job queues.
//!
//! Jobs are dispatched round-robin, or pinned to a thread with a caller
//! seed so related work keeps its submission order. Each worker drains its
//! whole queue per pass.

use crate::error::Error;
use crate::tpstat;
use crate::wake::Wakeup;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

const MIN_THREADS: u32 = 1;
const MAX_THREADS: u32 = 64;

const MAX_RATIO: f32 = 2.0;
const MIN_RATIO: f32 = 1.0;
const DELTA: f32 = 0.015;

const IDLE_RECHECK: Duration = Duration::from_millis(100);

type Job = Box<dyn FnOnce() + Send + 'static>;

pub(crate) struct PoolThread {
    queue: Mutex<VecDeque<Job>>,
    wake: Wakeup,
    running: AtomicBool,
    /// Jobs submitted but not yet finished; exposed through `tpstat`.
    jobs: AtomicU32,
}

pub(crate) struct PoolShared {
    pub(crate) name: String,
    pub(crate) threads: Vec<Arc<PoolThread>>,
}

impl PoolShared {
    pub(crate) fn queued_jobs(&self) -> Vec<u32> {
        self.threads
            .iter()
            .map(|t| t.jobs.load(Ordering::SeqCst))
            .collect()
    }
}

/// Per-thread queue gauges for diagnostics.
pub struct PoolInfo {
    /// Pool name.
    pub name: String,
    /// Outstanding job count per worker thread.
    pub queued: Vec<u32>,
}

/// A named pool of worker threads with per-thread FIFO queues.
pub struct ThreadPool {
    shared: Arc<PoolShared>,
    index: AtomicU32,
    handles: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    /// Create a pool of `threads` workers (clamped to 1..=64).
    ///
    /// With `pin_core` set, worker `i` is pinned to core
    /// `(pin_core + i) % available_cores`.
    ///
    /// # Errors
    ///
    /// [`Error::ThreadSpawn`] if any worker thread cannot be started; workers
    /// already started are stopped before returning.
    pub fn new(name: &str, threads: u32, pin_core: Option<usize>) -> Result<Self, Error> {
        let count = threads.clamp(MIN_THREADS, MAX_THREADS);

        let mut pool_threads = Vec::with_capacity(count as usize);
        for _ in 0..count {
            pool_threads.push(Arc::new(PoolThread {
                queue: Mutex::new(VecDeque::new()),
                wake: Wakeup::new(),
                running: AtomicBool::new(true),
                jobs: AtomicU32::new(0),
            }));
        }

        let shared = Arc::new(PoolShared {
            name: name.to_string(),
            threads: pool_threads,
        });

        let mut handles = Vec::with_capacity(count as usize);
        for (i, thread) in shared.threads.iter().enumerate() {
            let thread_name = format!("{:.8}{i}", name);
            let worker = thread.clone();
            let spawned = std::thread::Builder::new()
                .name(thread_name.clone())
                .spawn(move || {
                    if let Some(start) = pin_core {
                        pin_current_thread(start + i);
                    }
                    worker_loop(&worker);
                })
                .map_err(|source| Error::ThreadSpawn {
                    thread_name,
                    source,
                });

            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    stop_threads(&shared.threads, &mut handles);
                    return Err(e);
                }
            }
        }

        tpstat::register(&shared);
        Ok(ThreadPool {
            shared,
            index: AtomicU32::new(0),
            handles,
        })
    }

    /// Queue a job on the next worker in round-robin order.
    pub fn submit(&self, job: impl FnOnce() + Send + 'static) {
        let index = self.index.fetch_add(1, Ordering::SeqCst) as usize;
        self.enqueue(index % self.shared.threads.len(), Box::new(job));
    }

    /// Queue a job on the worker selected by `seed`, so equal seeds share a
    /// queue and therefore execute in submission order.
    pub fn submit_seeded(&self, seed: u32, job: impl FnOnce() + Send + 'static) {
        self.enqueue(seed as usize % self.shared.threads.len(), Box::new(job));
    }

    fn enqueue(&self, index: usize, job: Job) {
        let thread = &self.shared.threads[index];
        {
            let mut queue = thread.queue.lock();
            queue.push_back(job);
            let _ = thread.jobs.fetch_add(1, Ordering::SeqCst);
        }
        thread.wake.post();
    }

    /// Per-thread queue gauges.
    pub fn info(&self) -> PoolInfo {
        PoolInfo {
            name: self.shared.name.clone(),
            queued: self.shared.queued_jobs(),
        }
    }

    /// Worker-count recommendation derived from the CPU count: small hosts
    /// get up to 2x oversubscription, large hosts approach 1x.
    pub fn recommended_threads() -> u32 {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(4);

        let ratio = (MAX_RATIO - cpus as f32 * DELTA).max(MIN_RATIO);
        (cpus as f32 * ratio) as u32
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        tpstat::unregister(&self.shared.name);
        stop_threads(&self.shared.threads, &mut self.handles);
    }
}

fn stop_threads(threads: &[Arc<PoolThread>], handles: &mut Vec<JoinHandle<()>>) {
    for thread in threads {
        thread.running.store(false, Ordering::SeqCst);
        thread.wake.post_force();
    }

    for handle in handles.drain(..) {
        let _ = handle.join();
    }

    for thread in threads {
        thread.queue.lock().clear();
        thread.jobs.store(0, Ordering::SeqCst);
    }
}

fn pin_current_thread(slot: usize) {
    if let Some(cores) = core_affinity::get_core_ids() {
        if !cores.is_empty() {
            let core = cores[slot % cores.len()];
            if !core_affinity::set_for_current(core) {
                tracing::warn!(core = core.id, "failed to pin pool thread");
            }
        }
    }
}

fn worker_loop(thread: &PoolThread) {
    while thread.running.load(Ordering::SeqCst) {
        let mut queue = thread.queue.lock();
        while queue.is_empty() {
            drop(queue);
            let _ = thread.wake.wait_timeout(IDLE_RECHECK);
            if !thread.running.load(Ordering::SeqCst) {
                return;
            }
            queue = thread.queue.lock();
        }

        let batch: Vec<Job> = queue.drain(..).collect();
        drop(queue);

        for job in batch {
            job();
            let _ = thread.jobs.fetch_sub(1, Ordering::SeqCst);
        }
    }
}
