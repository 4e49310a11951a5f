//! Parallel task execution over a cooperative core pool.
//!
//! Tasks run on OS threads so their bodies can issue blocking subprocess
//! calls; the traversal itself stays on the driver thread. Each task
//! acquires the cores it declared (`storage["ncores"]`, default one) before
//! its body runs and releases them afterwards.
//!
//! When any task fails, the pool drains: released cores accumulate in a
//! pending pot instead of becoming available, holding back new acquisitions.
//! If the session's exception handler accepts the failure
//! ([`SessionPlugin::ignored_exception`] fires) the pot is poured back and
//! the pool resumes; otherwise the evaluation shuts the pool down and the
//! outstanding workers are asked to finish.

use std::{sync::Arc, thread};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info};

use crate::plugins::{Execute, Job, SessionPlugin};

pub struct Parallel {
    ncores: usize,
    shared: Arc<Shared>,
}

struct Shared {
    pool: Mutex<Pool>,
    cond: Condvar,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

struct Pool {
    available: usize,
    /// When draining, released cores land here instead of `available`.
    pending: Option<usize>,
    registered_failures: usize,
    closed: bool,
}

impl Parallel {
    /// `ncores` defaults to the host core count.
    pub fn new(ncores: Option<usize>) -> Arc<Parallel> {
        let ncores = ncores.unwrap_or_else(num_cpus::get).max(1);
        Arc::new(Parallel {
            ncores,
            shared: Arc::new(Shared {
                pool: Mutex::new(Pool {
                    available: ncores,
                    pending: None,
                    registered_failures: 0,
                    closed: false,
                }),
                cond: Condvar::new(),
                workers: Mutex::new(Vec::new()),
            }),
        })
    }
}

impl Shared {
    fn acquire(&self, n: usize) {
        let mut pool = self.pool.lock();
        loop {
            if pool.closed {
                return;
            }
            if pool.pending.is_none() && pool.available >= n {
                pool.available -= n;
                return;
            }
            self.cond.wait(&mut pool);
        }
    }

    fn release(&self, n: usize) {
        let mut pool = self.pool.lock();
        if pool.closed || pool.pending.is_none() {
            pool.available += n;
        } else if let Some(pending) = &mut pool.pending {
            *pending += n;
        }
        self.cond.notify_all();
    }

    fn note_failure(&self) {
        let mut pool = self.pool.lock();
        if pool.registered_failures == 0 {
            info!("stopping scheduler");
            pool.pending = Some(0);
        }
        pool.registered_failures += 1;
    }

    fn resume_one(&self) {
        let mut pool = self.pool.lock();
        if pool.registered_failures == 0 {
            return;
        }
        pool.registered_failures -= 1;
        if pool.registered_failures > 0 {
            return;
        }
        let pending = pool.pending.take().unwrap_or(0);
        pool.available += pending;
        info!("resuming scheduler with {pending} cores");
        self.cond.notify_all();
    }

    fn reset(&self, ncores: usize) {
        *self.pool.lock() = Pool {
            available: ncores,
            pending: None,
            registered_failures: 0,
            closed: false,
        };
    }

    fn shutdown(&self) {
        self.pool.lock().closed = true;
        self.cond.notify_all();
    }
}

impl SessionPlugin for Parallel {
    fn name(&self) -> &'static str {
        "parallel"
    }

    fn pre_run(&self) -> Result<(), crate::Error> {
        self.shared.reset(self.ncores);
        Ok(())
    }

    fn post_run(&self) -> Result<(), crate::Error> {
        self.shared.shutdown();
        let workers: Vec<_> = std::mem::take(&mut *self.shared.workers.lock());
        if !workers.is_empty() {
            info!("waiting for {} running tasks to finish", workers.len());
            for worker in workers {
                let _ = worker.join();
            }
        }
        Ok(())
    }

    fn ignored_exception(&self) {
        self.shared.resume_one();
    }

    fn wrap_execute(&self, _execute: Execute) -> Execute {
        // Replaces the inline executor: each job gets its own worker thread
        // gated on the core pool.
        let shared = self.shared.clone();
        let total = self.ncores;
        Arc::new(move |job: Job| {
            let pool = shared.clone();
            let n = job.ncores().min(total);
            let label = job.task().label();
            let worker = thread::Builder::new()
                .name("mona-worker".to_string())
                .spawn(move || {
                    debug!("acquiring {n} cores for {label}");
                    pool.acquire(n);
                    let observer = pool.clone();
                    job.run_observed(move |failed| {
                        if failed {
                            observer.note_failure();
                        }
                    });
                    pool.release(n);
                })
                .expect("failed to spawn worker thread");
            shared.workers.lock().push(worker);
        })
    }
}
