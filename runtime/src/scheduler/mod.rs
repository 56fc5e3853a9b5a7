// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) the helios render project. All rights reserved.

//! Job scheduling. A render phase is a batch of job tags pushed through
//! a shared FIFO queue; local workers are OS threads pulling from it,
//! remote workers are transport stubs pulling from the same queue. The
//! queue is drained to completion or to the next cooperative abort.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use tracing::{info, warn};

use helios_data::message::AsyncQueue;
use helios_data::Tag;

use crate::db::Database;
use crate::error::{Error, Result};
use crate::tls::Tls;

/// Job executor result codes carried by `JobFinished`.
pub const JOB_OK: i32 = 0;
pub const JOB_FAILED: i32 = -1;
pub const JOB_ABORTED: i32 = -2;

/// How many inner-loop polls may pass between refreshes of a remotely
/// sourced abort flag. Kept under a million so long sample loops still
/// notice a cancel.
const ABORT_REFRESH_MASK: u32 = (1 << 19) - 1;

/// Refreshes the abort state from the authoritative host.
pub trait AbortSource: Send + Sync {
    fn poll_abort(&self) -> bool;
}

/// Process-wide cooperative cancellation flag. Executors poll `check`
/// at coarse boundaries; on hosts away from the manager the flag is
/// refreshed by a round-trip at a bounded cadence.
#[derive(Default)]
pub struct AbortFlag {
    aborted: AtomicBool,
    checks: AtomicU32,
    source: std::sync::RwLock<Option<Arc<dyn AbortSource>>>,
}

impl AbortFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_source(&self, source: Arc<dyn AbortSource>) {
        *self.source.write().unwrap() = Some(source);
    }

    pub fn set(&self) {
        self.aborted.store(true, Ordering::Release);
    }

    pub fn clear(&self) {
        self.aborted.store(false, Ordering::Release);
        *self.source.write().unwrap() = None;
    }

    pub fn is_set(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// Poll path for inner loops; refreshes from the source every
    /// 2^20 checks.
    pub fn check(&self) -> bool {
        let n = self.checks.fetch_add(1, Ordering::Relaxed);
        if n & ABORT_REFRESH_MASK == 0 {
            self.refresh();
        }
        self.is_set()
    }

    /// Synchronous refresh from the authoritative host, called at least
    /// once per completed job.
    pub fn refresh(&self) {
        let source = self.source.read().unwrap().clone();
        if let Some(source) = source {
            if source.poll_abort() {
                self.set();
            }
        }
    }
}

/// Callbacks observing the job stream of a render phase.
pub trait ProcessEvents: Send + Sync {
    /// Completion callback; returning false aborts the phase.
    fn progress(&self, percent: f32) -> bool {
        let _ = percent;
        true
    }
    fn job_started(&self, job: Tag) {
        let _ = job;
    }
    fn job_finished(&self, job: Tag, result: i32) {
        let _ = (job, result);
    }
    fn worker_finished(&self, worker: usize) {
        let _ = worker;
    }
}

/// No-op observer for phases nobody watches.
pub struct SilentEvents;
impl ProcessEvents for SilentEvents {}

struct Counts {
    total: u32,
    started: u32,
    completed: u32,
    failed: u32,
}

/// Tracks one phase: counts, percentage, abort. Shared by every worker
/// touching the phase, local or remote.
pub struct Process {
    counts: Mutex<Counts>,
    done_cv: Condvar,
    abort: Arc<AbortFlag>,
    events: Box<dyn ProcessEvents>,
}

impl Process {
    pub fn new(total: usize, events: Box<dyn ProcessEvents>) -> Arc<Process> {
        Arc::new(Process {
            counts: Mutex::new(Counts {
                total: total as u32,
                started: 0,
                completed: 0,
                failed: 0,
            }),
            done_cv: Condvar::new(),
            abort: Arc::new(AbortFlag::new()),
            events,
        })
    }

    pub fn abort_flag(&self) -> Arc<AbortFlag> {
        self.abort.clone()
    }

    pub fn aborted(&self) -> bool {
        self.abort.is_set()
    }

    pub fn percent(&self) -> f32 {
        let c = self.counts.lock().unwrap();
        if c.total == 0 {
            100.0
        } else {
            c.completed as f32 * 100.0 / c.total as f32
        }
    }

    pub fn failed_jobs(&self) -> u32 {
        self.counts.lock().unwrap().failed
    }

    pub fn job_started(&self, job: Tag) {
        self.counts.lock().unwrap().started += 1;
        self.events.job_started(job);
    }

    /// Records a completion and polls the application, latching abort
    /// when it declines to continue.
    pub fn job_finished(&self, job: Tag, result: i32) {
        let percent = {
            let mut c = self.counts.lock().unwrap();
            c.completed += 1;
            if result != JOB_OK {
                c.failed += 1;
            }
            if c.total == 0 {
                100.0
            } else {
                c.completed as f32 * 100.0 / c.total as f32
            }
        };
        self.events.job_finished(job, result);
        if !self.events.progress(percent) {
            self.abort.set();
        }
        self.done_cv.notify_all();
    }

    /// Bumps the completion counter without a local job, for progress
    /// reported by a peer host.
    pub fn step(&self, count: u32) {
        {
            let mut c = self.counts.lock().unwrap();
            c.started += count;
            c.completed += count;
        }
        self.done_cv.notify_all();
    }

    /// A worker died mid-job; its job goes back to the queue.
    pub fn job_requeued(&self, _job: Tag) {
        let mut c = self.counts.lock().unwrap();
        c.started -= 1;
        self.done_cv.notify_all();
    }

    pub fn worker_finished(&self, worker: usize) {
        self.events.worker_finished(worker);
    }

    fn is_done(c: &Counts, aborted: bool) -> bool {
        c.completed >= c.total || (aborted && c.started <= c.completed)
    }

    /// Whether the phase is over as of this instant.
    pub fn done_now(&self) -> bool {
        let c = self.counts.lock().unwrap();
        Self::is_done(&c, self.aborted())
    }

    /// Blocks until every job completed, or until abort with no job in
    /// flight.
    pub fn wait(&self) {
        let mut c = self.counts.lock().unwrap();
        while !Self::is_done(&c, self.aborted()) {
            let (guard, timeout) = self
                .done_cv
                .wait_timeout(c, std::time::Duration::from_millis(50))
                .unwrap();
            c = guard;
            if timeout.timed_out() {
                // Re-check abort latched by another thread.
                continue;
            }
        }
    }
}

/// Runs batches of jobs over a pool of local worker threads plus any
/// remote workers subscribed to the same queue.
pub struct Scheduler {
    nthreads: usize,
    queue: AsyncQueue<Tag>,
    current: Mutex<Option<Arc<Process>>>,
}

impl Scheduler {
    /// `nthreads` local workers; zero is allowed for a manager that
    /// delegates every job to remote workers.
    pub fn new(nthreads: usize) -> Scheduler {
        Scheduler {
            nthreads,
            queue: AsyncQueue::default(),
            current: Mutex::new(None),
        }
    }

    pub fn nthreads(&self) -> usize {
        self.nthreads
    }

    /// Queue shared with remote worker stubs.
    pub fn queue(&self) -> AsyncQueue<Tag> {
        self.queue.clone()
    }

    /// Process of the phase currently executing, if any. Remote workers
    /// resolve it per job.
    pub fn current(&self) -> Option<Arc<Process>> {
        self.current.lock().unwrap().clone()
    }

    /// Ends the queue for good; parked remote workers drain and exit.
    pub fn close(&self) {
        self.queue.close();
    }

    /// Executes one batch to completion. Failed jobs are recorded and
    /// the batch continues; an abort drains in-flight jobs and returns
    /// `Aborted`.
    pub fn execute(&self, db: &Arc<Database>, jobs: Vec<Tag>, process: &Arc<Process>) -> Result<()> {
        if jobs.is_empty() {
            return Ok(());
        }

        info!(jobs = jobs.len(), threads = self.nthreads, "phase started");
        *self.current.lock().unwrap() = Some(process.clone());
        for job in jobs {
            self.queue
                .send_blocking(job)
                .map_err(|_| Error::ConnectionLost)?;
        }

        std::thread::scope(|scope| {
            for index in 0..self.nthreads {
                let queue = self.queue.clone();
                let process = process.clone();
                let db = db.clone();
                scope.spawn(move || {
                    Tls::init_worker(index);
                    Tls::install_abort(process.abort_flag());
                    worker_loop(index, &db, &queue, &process);
                    Tls::clear_abort();
                });
            }

            process.wait();
            // Drop jobs never started after an abort.
            while self.queue.try_recv().is_ok() {}
        });

        *self.current.lock().unwrap() = None;
        if process.aborted() {
            info!("phase aborted at {:.1}%", process.percent());
            return Err(Error::Aborted);
        }
        if process.failed_jobs() > 0 {
            warn!(failed = process.failed_jobs(), "phase completed with failed jobs");
        }
        Ok(())
    }
}

fn worker_loop(index: usize, db: &Arc<Database>, queue: &AsyncQueue<Tag>, process: &Arc<Process>) {
    loop {
        if process.aborted() {
            break;
        }
        // The queue holds the whole batch before any worker starts, but
        // a job re-queued from a dead remote worker can appear late, so
        // an empty queue only ends the loop once the phase is done.
        let job = match queue.try_recv() {
            Ok(job) => job,
            Err(_) => {
                if process.done_now() {
                    break;
                }
                std::thread::sleep(std::time::Duration::from_millis(1));
                continue;
            }
        };

        process.job_started(job);
        let result = match db.execute_job(job, Tls) {
            Ok(code) => code,
            Err(Error::Aborted) => JOB_ABORTED,
            Err(e) => {
                warn!(job = %helios_data::tag_to_str(job), "job failed: {e}");
                JOB_FAILED
            }
        };
        process.abort_flag().refresh();
        process.job_finished(job, result);
    }
    process.worker_finished(index);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{builtin, DbValue, TypeOps};
    use helios_data::TypeCode;
    use std::sync::atomic::AtomicUsize;

    const T_CHECK_JOB: TypeCode = 40;
    const T_SLOW_JOB: TypeCode = 41;

    /// Exercises typed payload plumbing end to end.
    #[derive(Clone, Copy)]
    #[repr(C)]
    struct CheckJob {
        check_int: i32,
        check_uint: u32,
        check_long: i64,
        check_float: f32,
        check_double: f64,
    }
    unsafe impl DbValue for CheckJob {}

    static SUM: AtomicUsize = AtomicUsize::new(0);

    fn execute_check(db: &Database, job: Tag, _tls: Tls) -> Result<i32> {
        let lease = db.access(job)?;
        let data = lease.get::<CheckJob>();
        if data.check_uint != 0xFFFF_FFFF || data.check_float != 1.5 {
            return Ok(JOB_FAILED);
        }
        SUM.fetch_add(data.check_int as usize, Ordering::SeqCst);
        Ok(JOB_OK)
    }

    fn execute_slow(_db: &Database, _job: Tag, tls: Tls) -> Result<i32> {
        for _ in 0..50 {
            if tls.aborted() {
                return Ok(JOB_ABORTED);
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        Ok(JOB_OK)
    }

    fn test_db() -> Arc<Database> {
        let db = Arc::new(Database::new(0));
        builtin::register(&db);
        db.register_type(T_CHECK_JOB, TypeOps {
            name: "check_job",
            atomic_size: 0,
            byteswap: None,
            generate: None,
            execute: Some(execute_check),
        });
        db.register_type(T_SLOW_JOB, TypeOps {
            name: "slow_job",
            atomic_size: 0,
            byteswap: None,
            generate: None,
            execute: Some(execute_slow),
        });
        db
    }

    fn make_check_job(db: &Database, n: i32) -> Tag {
        let (tag, lease) = db
            .create(T_CHECK_JOB, std::mem::size_of::<CheckJob>(), 0)
            .unwrap();
        *lease.get_mut::<CheckJob>() = CheckJob {
            check_int: n,
            check_uint: 0xFFFF_FFFF,
            check_long: -1,
            check_float: 1.5,
            check_double: 0.25,
        };
        tag
    }

    #[test]
    fn test_batch_runs_all_jobs() {
        let db = test_db();
        SUM.store(0, Ordering::SeqCst);

        let jobs: Vec<Tag> = (1..=100).map(|n| make_check_job(&db, n)).collect();
        let scheduler = Scheduler::new(4);
        let process = Process::new(jobs.len(), Box::new(SilentEvents));
        scheduler.execute(&db, jobs, &process).unwrap();

        assert_eq!(SUM.load(Ordering::SeqCst), 5050);
        assert_eq!(process.percent(), 100.0);
        assert_eq!(process.failed_jobs(), 0);
    }

    #[test]
    fn test_failed_job_does_not_stop_batch() {
        let db = test_db();
        SUM.store(0, Ordering::SeqCst);

        let mut jobs: Vec<Tag> = (1..=9).map(|n| make_check_job(&db, n)).collect();
        // One job with a wrong checksum pattern.
        let (bad, lease) = db
            .create(T_CHECK_JOB, std::mem::size_of::<CheckJob>(), 0)
            .unwrap();
        drop(lease);
        jobs.push(bad);

        let scheduler = Scheduler::new(2);
        let process = Process::new(jobs.len(), Box::new(SilentEvents));
        scheduler.execute(&db, jobs, &process).unwrap();

        assert_eq!(SUM.load(Ordering::SeqCst), 45);
        assert_eq!(process.failed_jobs(), 1);
    }

    struct AbortAfterFirst {
        seen: Arc<AtomicUsize>,
        finishes: Arc<AtomicUsize>,
    }

    impl ProcessEvents for AbortAfterFirst {
        fn progress(&self, _percent: f32) -> bool {
            // Decline to continue from the first completion on.
            self.seen.fetch_add(1, Ordering::SeqCst);
            false
        }
        fn job_finished(&self, _job: Tag, _result: i32) {
            self.finishes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_abort_after_first_completion() {
        let db = test_db();
        let jobs: Vec<Tag> = (0..8)
            .map(|_| {
                let (tag, lease) = db.create(T_SLOW_JOB, 8, 0).unwrap();
                drop(lease);
                tag
            })
            .collect();

        let finishes = Arc::new(AtomicUsize::new(0));
        let events = Box::new(AbortAfterFirst {
            seen: Arc::new(AtomicUsize::new(0)),
            finishes: finishes.clone(),
        });

        let scheduler = Scheduler::new(2);
        let process = Process::new(jobs.len(), events);
        let r = scheduler.execute(&db, jobs, &process);
        assert!(matches!(r, Err(Error::Aborted)));

        // One finish latched the abort; at most one more was in flight
        // per thread, plus a small grace for a just-dequeued job.
        let finishes = finishes.load(Ordering::SeqCst);
        assert!(finishes <= 4, "observed {finishes} completions after abort");
    }
}
