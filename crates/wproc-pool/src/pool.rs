//! The master-side worker pool.
//!
//! Owns the spawned workers, round-robins jobs onto them, parses their
//! framed responses, and delivers check results to the daemon through
//! a [`CheckHandler`]. One call to [`WorkerPool::poll`] is one turn of
//! the broker; completion callbacks run from inside it.
//!
//! Job timeouts are advisory here: every dispatched job gets a wakeup
//! in the scheduling queue so `poll` sleeps no longer than the next
//! deadline, but overdue jobs are only noted, never cancelled.

use std::os::unix::io::RawFd;

use nix::sys::wait::{waitpid, WaitPidFlag};
use nix::unistd::Pid;

use wproc_core::kvvec::{KvBuf, KvVec, FRAME_DELIM};
use wproc_core::squeue::Squeue;
use wproc_core::tv::{now_secs, Tv};
use wproc_core::{wdebug, werror, winfo, wwarn};
use wproc_runtime::worker::{spawn_worker, write_all};
use wproc_runtime::{max_usable_fds, IoBroker, IoCache, Ready, Token, WorkError};

use crate::config::PoolConfig;
use crate::error::{PoolError, Result};
use crate::job::{CheckHandler, CheckResult, JobKind, JobPayload, NotifyJob, WorkerJob};

/// Master-side record of one worker process.
#[derive(Debug)]
pub struct WorkerProcess {
    sd: RawFd,
    pid: Pid,
    max_jobs: usize,
    job_index: u64,
    ioc: IoCache,
    /// Slot table, grown on demand up to `max_jobs` entries.
    jobs: Vec<Option<WorkerJob>>,
    alive: bool,
}

impl WorkerProcess {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }

    pub fn max_jobs(&self) -> usize {
        self.max_jobs
    }

    fn in_flight(&self) -> usize {
        self.jobs.iter().filter(|j| j.is_some()).count()
    }
}

/// Everything the response handlers touch; kept apart from the broker
/// so poll's dispatch closure can borrow both halves at once.
struct PoolCore {
    workers: Vec<WorkerProcess>,
    worker_index: usize,
    /// Wakeups keyed by job deadline; payload is (worker, slot).
    wakeups: Squeue<(usize, usize)>,
    handler: Box<dyn CheckHandler>,
}

/// The worker pool.
pub struct WorkerPool {
    broker: IoBroker,
    core: PoolCore,
    cfg: PoolConfig,
    child_init: Option<Box<dyn Fn()>>,
}

impl WorkerPool {
    /// Create an empty pool; call [`init_workers`] to populate it.
    ///
    /// [`init_workers`]: WorkerPool::init_workers
    pub fn new(cfg: PoolConfig, handler: Box<dyn CheckHandler>) -> Result<Self> {
        let broker = IoBroker::new()?;
        let wakeups = Squeue::new(cfg.horizon);
        Ok(Self {
            broker,
            core: PoolCore {
                workers: Vec::new(),
                worker_index: 0,
                wakeups,
                handler,
            },
            cfg,
            child_init: None,
        })
    }

    /// Install a hook the forked worker runs before entering its loop.
    ///
    /// The daemon uses this to drop heavyweight state that would
    /// otherwise linger in the worker's copy-on-write image.
    pub fn with_child_init(mut self, init: impl Fn() + 'static) -> Self {
        self.child_init = Some(Box::new(init));
        self
    }

    /// Bring the pool up to `desired` workers (0 means the configured
    /// default). The pool never shrinks.
    ///
    /// Workers are spawned first and registered second, so late workers
    /// don't inherit broker state set up for their siblings.
    pub fn init_workers(&mut self, desired: usize) -> Result<()> {
        let mut desired = if desired == 0 { self.cfg.workers } else { desired };
        if desired == 0 {
            desired = 4;
        }
        if desired < self.core.workers.len() {
            return Err(PoolError::Config("worker pool cannot shrink"));
        }

        let max_jobs = if self.cfg.max_jobs > 0 {
            self.cfg.max_jobs
        } else {
            // one socket plus two pipes per in-flight child
            (max_usable_fds() - 1) / 2
        };

        let first_new = self.core.workers.len();
        for _ in first_new..desired {
            let init = &self.child_init;
            let handle = match spawn_worker(|| {
                if let Some(f) = init {
                    f();
                }
            }) {
                Ok(h) => h,
                Err(e) => {
                    werror!("failed to spawn worker: {}", e);
                    continue;
                }
            };
            self.core.workers.push(WorkerProcess {
                sd: handle.sd,
                pid: handle.pid,
                max_jobs,
                job_index: 0,
                ioc: IoCache::with_capacity(self.cfg.iocache_size),
                jobs: Vec::new(),
                alive: true,
            });
        }

        if self.core.workers.is_empty() {
            return Err(PoolError::NoWorkers);
        }

        for idx in first_new..self.core.workers.len() {
            let wp = &self.core.workers[idx];
            self.broker.register(wp.sd, Token(idx as u64))?;
        }
        Ok(())
    }

    pub fn num_workers(&self) -> usize {
        self.core.workers.len()
    }

    pub fn alive_workers(&self) -> usize {
        self.core.workers.iter().filter(|w| w.alive).count()
    }

    pub fn workers(&self) -> &[WorkerProcess] {
        &self.core.workers
    }

    /// Queue a check; the accumulator comes back through the handler
    /// once the response lands.
    pub fn run_check(&mut self, result: CheckResult, command: &str, timeout_secs: u32) -> Result<()> {
        self.submit(WorkerJob {
            id: 0,
            kind: JobKind::Check,
            timeout: now_secs() + i64::from(timeout_secs),
            command: command.to_string(),
            payload: JobPayload::Check(result),
            wakeup: None,
        })
    }

    /// Queue a notification; its completion is logged, not delivered.
    pub fn notify(
        &mut self,
        contact: &str,
        host_name: &str,
        service_description: Option<&str>,
        command: &str,
        timeout_secs: u32,
    ) -> Result<()> {
        self.submit(WorkerJob {
            id: 0,
            kind: JobKind::Notify,
            timeout: now_secs() + i64::from(timeout_secs),
            command: command.to_string(),
            payload: JobPayload::Notify(NotifyJob {
                contact: contact.to_string(),
                host_name: host_name.to_string(),
                service_description: service_description.map(str::to_string),
            }),
            wakeup: None,
        })
    }

    /// Round-robin dispatch onto the next live worker.
    fn submit(&mut self, mut job: WorkerJob) -> Result<()> {
        let core = &mut self.core;
        let n = core.workers.len();
        if n == 0 {
            return Err(PoolError::NoWorkers);
        }

        let mut chosen = None;
        for _ in 0..n {
            let idx = core.worker_index % n;
            core.worker_index += 1;
            if core.workers[idx].alive {
                chosen = Some(idx);
                break;
            }
        }
        let Some(widx) = chosen else {
            return Err(PoolError::NoWorkers);
        };

        let wp = &mut core.workers[widx];
        job.id = wp.job_index;
        wp.job_index += 1;
        let slot = (job.id % wp.max_jobs as u64) as usize;

        // a still-occupied slot means the previous occupant never
        // answered; its response, if it ever comes, no longer matches
        let displaced = if slot < wp.jobs.len() {
            wp.jobs[slot].take()
        } else {
            None
        };
        let pid = wp.pid;
        if let Some(old) = displaced {
            wwarn!(
                "worker {}: job {} displaced unanswered job {}",
                pid,
                job.id,
                old.id
            );
            if let Some(h) = old.wakeup {
                core.wakeups.remove(h);
            }
        }

        let wp = &mut core.workers[widx];
        let frame = build_request(&job, now_secs());
        if let Err(e) = write_all(wp.sd, &frame.data) {
            if e == WorkError::Sys(libc::EPIPE) {
                wp.alive = false;
            }
            return Err(e.into());
        }

        job.wakeup = Some(core.wakeups.add(job.timeout, (widx, slot)));

        let wp = &mut core.workers[widx];
        if slot >= wp.jobs.len() {
            wp.jobs.resize_with(slot + 1, || None);
        }
        wp.jobs[slot] = Some(job);
        Ok(())
    }

    /// One turn of the broker, sleeping at most until the next job
    /// deadline. Completion callbacks run from inside this call.
    pub fn poll(&mut self, timeout_ms: i32) -> Result<()> {
        let now = now_secs();
        let effective = match self.core.wakeups.next_when() {
            Some(when) => {
                let until = (when - now)
                    .max(0)
                    .saturating_mul(1000)
                    .min(i32::MAX as i64) as i32;
                if timeout_ms < 0 {
                    until
                } else {
                    timeout_ms.min(until)
                }
            }
            None => timeout_ms,
        };

        let core = &mut self.core;
        match self
            .broker
            .poll(effective, |brk, ready| core.handle_worker_event(brk, ready))
        {
            Ok(_) => {}
            Err(WorkError::NoFds) => return Err(PoolError::NoWorkers),
            Err(WorkError::Sys(e)) if e == libc::EINTR => {}
            Err(e) => return Err(e.into()),
        }

        self.core.note_overdue(now_secs());
        Ok(())
    }

    /// Close every worker socket (each worker exits on the EOF) and
    /// drop the table. Exits are collected opportunistically; workers
    /// that haven't noticed yet fall to their parent-liveness probe.
    pub fn shutdown(&mut self) {
        for wp in &mut self.core.workers {
            if wp.alive {
                let _ = self.broker.close(wp.sd);
                wp.alive = false;
            }
            let _ = waitpid(wp.pid, Some(WaitPidFlag::WNOHANG));
        }
        self.core.workers.clear();
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if !self.core.workers.is_empty() {
            self.shutdown();
        }
    }
}

impl PoolCore {
    /// A worker socket is readable: buffer, then handle every frame.
    fn handle_worker_event(&mut self, brk: &mut IoBroker, ready: Ready) {
        let widx = ready.token.0 as usize;
        if widx >= self.workers.len() {
            return;
        }

        let read = {
            let wp = &mut self.workers[widx];
            wp.ioc.read(wp.sd)
        };
        match read {
            Ok(0) => {
                self.worker_gone(brk, widx);
                return;
            }
            Ok(_) => {}
            Err(WorkError::Sys(e)) if e == libc::EINTR => return,
            Err(e) => {
                wwarn!("read from worker {} failed: {}", widx, e);
                return;
            }
        }

        loop {
            let frame = self.workers[widx]
                .ioc
                .use_delim(FRAME_DELIM)
                .map(|f| f.to_vec());
            let Some(frame) = frame else { break };
            self.handle_frame(widx, &frame);
        }
    }

    /// EOF on a worker socket: the worker crashed or was killed. Its
    /// in-flight jobs are lost; respawning is a planned follow-up.
    fn worker_gone(&mut self, brk: &mut IoBroker, widx: usize) {
        let lost;
        {
            let wp = &mut self.workers[widx];
            werror!(
                "worker {} (pid {}) hung up with {} jobs in flight; dropping them",
                widx,
                wp.pid,
                wp.in_flight()
            );
            let _ = brk.close(wp.sd);
            wp.alive = false;
            let _ = waitpid(wp.pid, Some(WaitPidFlag::WNOHANG));
            lost = std::mem::take(&mut wp.jobs);
        }
        for job in lost.into_iter().flatten() {
            if let Some(h) = job.wakeup {
                self.wakeups.remove(h);
            }
        }
    }

    /// Decode one response frame and resolve the job it answers.
    fn handle_frame(&mut self, widx: usize, frame: &[u8]) {
        let Some(kvv) = KvVec::parse_frame(frame) else {
            wwarn!("unparsable frame from worker {}; dropping", widx);
            return;
        };

        // a single log=<text> pair is the worker's out-of-band channel
        if kvv.len() == 1 {
            if let Some(kv) = kvv.iter().next() {
                if kv.key.as_slice() == b"log" {
                    winfo!(
                        "worker {}: {}",
                        self.workers[widx].pid,
                        String::from_utf8_lossy(&kv.value)
                    );
                    return;
                }
            }
        }

        let Some(first) = kvv.iter().next() else { return };
        if first.key.as_slice() != b"job_id" {
            wwarn!("worker response without leading job_id; dropping frame");
            return;
        }
        let Some(id) = parse_num::<u64>(&first.value) else {
            wwarn!("worker response with garbled job_id; dropping frame");
            return;
        };
        if kvv.len() < 6 {
            wwarn!("short worker response ({} pairs); dropping frame", kvv.len());
            return;
        }

        let wp = &mut self.workers[widx];
        let slot = (id % wp.max_jobs as u64) as usize;
        match wp.jobs.get(slot).and_then(|s| s.as_ref()) {
            None => {
                wdebug!("response for untracked job {}; dropping", id);
                return;
            }
            Some(job) if job.id != id => {
                // slot was reused before this answer arrived
                wdebug!("stale response for displaced job {}; dropping", id);
                return;
            }
            Some(_) => {}
        }
        let Some(job) = wp.jobs[slot].take() else { return };

        if let Some(h) = job.wakeup {
            self.wakeups.remove(h);
        }

        match job.payload {
            JobPayload::Check(mut result) => {
                populate_check_result(&kvv, &mut result);
                if result.service_description.is_some() {
                    self.handler.service_check(result);
                } else {
                    self.handler.host_check(result);
                }
            }
            JobPayload::Notify(notify) => {
                winfo!(
                    "notification job {} for contact '{}' about '{}' finished (wait_status {})",
                    id,
                    notify.contact,
                    notify.host_name,
                    kvv.get(b"wait_status")
                        .map(|v| String::from_utf8_lossy(v).into_owned())
                        .unwrap_or_else(|| "?".into())
                );
            }
        }
    }

    /// Advisory deadline pass: unhook overdue wakeups and note them.
    /// Enforcement (signalling the child) is a planned follow-up.
    fn note_overdue(&mut self, now: i64) {
        loop {
            let Some(handle) = self.wakeups.peek() else { break };
            match self.wakeups.when(handle) {
                Some(when) if when <= now => {}
                _ => break,
            }
            let Some((widx, slot)) = self.wakeups.remove(handle) else {
                break;
            };
            if let Some(job) = self
                .workers
                .get_mut(widx)
                .and_then(|w| w.jobs.get_mut(slot))
                .and_then(|s| s.as_mut())
            {
                // the slot may have been reused since this wakeup was set
                if job.wakeup == Some(handle) {
                    job.wakeup = None;
                    wdebug!(
                        "job {} on worker {} passed its deadline; letting it run",
                        job.id,
                        widx
                    );
                }
            }
        }
    }
}

/// The request frame for a job: `job_id` first, then type, command and
/// the timeout as a relative duration.
fn build_request(job: &WorkerJob, now: i64) -> KvBuf {
    let mut kvv = KvVec::with_hint(4);
    kvv.add_str("job_id", &job.id.to_string());
    kvv.add_str("type", &job.kind.code().to_string());
    kvv.add_str("command", &job.command);
    kvv.add_str("timeout", &(job.timeout - now).max(0).to_string());
    kvv.to_frame()
}

/// Fill the accumulator from response fields.
fn populate_check_result(kvv: &KvVec, cr: &mut CheckResult) {
    let mut err_output: Option<Vec<u8>> = None;

    for kv in kvv {
        let value = &kv.value;
        match kv.key.as_slice() {
            b"start" => {
                if let Some(tv) = parse_tv(value) {
                    cr.start_time = tv;
                }
            }
            b"stop" => {
                if let Some(tv) = parse_tv(value) {
                    cr.finish_time = tv;
                }
            }
            b"wait_status" => {
                let status = parse_num::<i32>(value).unwrap_or(0);
                cr.exited_ok = libc::WIFEXITED(status);
                if cr.exited_ok {
                    cr.return_code = libc::WEXITSTATUS(status);
                }
            }
            b"error" => {
                if parse_num::<i32>(value) == Some(libc::ETIME) {
                    cr.early_timeout = true;
                }
            }
            b"stdout" => cr.output = value.clone(),
            b"stderr" => err_output = Some(value.clone()),
            b"ru_utime" => {
                if let Some(tv) = parse_tv(value) {
                    cr.rusage.utime = tv;
                }
            }
            b"ru_stime" => {
                if let Some(tv) = parse_tv(value) {
                    cr.rusage.stime = tv;
                }
            }
            b"ru_minflt" => cr.rusage.minflt = parse_num(value).unwrap_or(0),
            b"ru_majflt" => cr.rusage.majflt = parse_num(value).unwrap_or(0),
            b"ru_nswap" => cr.rusage.nswap = parse_num(value).unwrap_or(0),
            b"ru_inblock" => cr.rusage.inblock = parse_num(value).unwrap_or(0),
            b"ru_oublock" => cr.rusage.oublock = parse_num(value).unwrap_or(0),
            b"ru_nsignals" => cr.rusage.nsignals = parse_num(value).unwrap_or(0),
            b"job_id" | b"type" | b"command" | b"timeout" | b"runtime" => {}
            other => {
                wdebug!(
                    "unrecognized check result field '{}'",
                    String::from_utf8_lossy(other)
                );
            }
        }
    }

    // stderr stands in for empty stdout so diagnostics aren't lost
    if cr.output.is_empty() {
        if let Some(err) = err_output {
            if !err.is_empty() {
                cr.output = err;
            }
        }
    }
}

fn parse_tv(value: &[u8]) -> Option<Tv> {
    Tv::parse(std::str::from_utf8(value).ok()?)
}

fn parse_num<T: std::str::FromStr>(value: &[u8]) -> Option<T> {
    std::str::from_utf8(value).ok()?.trim().parse().ok()
}
