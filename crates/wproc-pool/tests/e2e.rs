//! End-to-end pool scenarios with real forked workers.
//!
//! Each test spins up a pool, submits work, and polls until the
//! completion callback fires (or a deadline passes). Workers are real
//! processes; commands are small /bin utilities.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use wproc_pool::{CheckHandler, CheckResult, PoolConfig, WorkerPool};

#[derive(Default)]
struct Collector {
    host: Rc<RefCell<Vec<CheckResult>>>,
    service: Rc<RefCell<Vec<CheckResult>>>,
}

impl Collector {
    fn new() -> (Box<Self>, Rc<RefCell<Vec<CheckResult>>>, Rc<RefCell<Vec<CheckResult>>>) {
        let c = Self::default();
        let host = c.host.clone();
        let service = c.service.clone();
        (Box::new(c), host, service)
    }
}

impl CheckHandler for Collector {
    fn host_check(&mut self, result: CheckResult) {
        self.host.borrow_mut().push(result);
    }

    fn service_check(&mut self, result: CheckResult) {
        self.service.borrow_mut().push(result);
    }
}

fn poll_until(pool: &mut WorkerPool, mut done: impl FnMut() -> bool, max: Duration) {
    let deadline = Instant::now() + max;
    while !done() && Instant::now() < deadline {
        let _ = pool.poll(100);
    }
}

#[test]
fn happy_path_host_check() {
    let (collector, host, _svc) = Collector::new();
    let mut pool = WorkerPool::new(PoolConfig::default().workers(2), collector).unwrap();
    pool.init_workers(0).unwrap();
    assert_eq!(pool.num_workers(), 2);

    pool.run_check(CheckResult::for_host("web01"), "/bin/echo hello", 10)
        .unwrap();
    poll_until(&mut pool, || !host.borrow().is_empty(), Duration::from_secs(10));

    let results = host.borrow();
    assert_eq!(results.len(), 1, "no completion delivered");
    let cr = &results[0];
    assert_eq!(cr.host_name, "web01");
    assert!(cr.exited_ok);
    assert_eq!(cr.return_code, 0);
    assert_eq!(cr.output, b"hello\n");
    assert!(cr.start_time.sec > 0);
    assert!(
        cr.start_time.sec < cr.finish_time.sec
            || (cr.start_time.sec == cr.finish_time.sec
                && cr.start_time.usec <= cr.finish_time.usec),
        "start {} after finish {}",
        cr.start_time,
        cr.finish_time
    );
    // rusage fields decoded (values may legitimately be zero)
    assert!(cr.rusage.minflt >= 0);
    drop(results);

    pool.shutdown();
}

#[test]
fn stderr_promoted_when_stdout_empty() {
    let (collector, _host, svc) = Collector::new();
    let mut pool = WorkerPool::new(PoolConfig::default().workers(1), collector).unwrap();
    pool.init_workers(1).unwrap();

    pool.run_check(
        CheckResult::for_service("web01", "PING"),
        "/bin/sh -c '1>&2 echo err; exit 3'",
        10,
    )
    .unwrap();
    poll_until(&mut pool, || !svc.borrow().is_empty(), Duration::from_secs(10));

    let results = svc.borrow();
    assert_eq!(results.len(), 1);
    let cr = &results[0];
    assert_eq!(cr.service_description.as_deref(), Some("PING"));
    assert!(cr.exited_ok);
    assert_eq!(cr.return_code, 3);
    assert_eq!(cr.output, b"err\n");
}

#[test]
fn shell_fallback_runs_pipelines() {
    let (collector, host, _svc) = Collector::new();
    let mut pool = WorkerPool::new(PoolConfig::default().workers(1), collector).unwrap();
    pool.init_workers(1).unwrap();

    pool.run_check(CheckResult::for_host("h"), "echo a | cat", 10)
        .unwrap();
    poll_until(&mut pool, || !host.borrow().is_empty(), Duration::from_secs(10));

    let results = host.borrow();
    assert_eq!(results.len(), 1);
    assert!(results[0].exited_ok);
    assert_eq!(results[0].output, b"a\n");
}

#[test]
fn large_output_survives_chunked_delivery() {
    let (collector, host, _svc) = Collector::new();
    let mut pool = WorkerPool::new(PoolConfig::default().workers(1), collector).unwrap();
    pool.init_workers(1).unwrap();

    // ~10 KB of output forces the response across multiple socket reads
    pool.run_check(
        CheckResult::for_host("h"),
        "/bin/sh -c \"head -c 10240 /dev/zero | tr '\\\\0' x\"",
        15,
    )
    .unwrap();
    poll_until(&mut pool, || !host.borrow().is_empty(), Duration::from_secs(15));

    let results = host.borrow();
    assert_eq!(results.len(), 1, "exactly one completion expected");
    let out = &results[0].output;
    assert_eq!(out.len(), 10240);
    assert!(out.iter().all(|&b| b == b'x'));
}

#[test]
fn slot_wraparound_discards_displaced_response() {
    let (collector, host, _svc) = Collector::new();
    let cfg = PoolConfig::default().workers(1).max_jobs(2);
    let mut pool = WorkerPool::new(cfg, collector).unwrap();
    pool.init_workers(1).unwrap();

    // three in-flight jobs on two slots: job 2 displaces job 0, whose
    // eventual response must be silently dropped
    for _ in 0..3 {
        pool.run_check(CheckResult::for_host("h"), "/bin/sleep 0.3", 10)
            .unwrap();
    }
    poll_until(&mut pool, || host.borrow().len() >= 2, Duration::from_secs(10));
    // allow the dropped response to arrive (and be discarded)
    let settle = Instant::now() + Duration::from_millis(500);
    while Instant::now() < settle {
        let _ = pool.poll(50);
    }

    assert_eq!(host.borrow().len(), 2);
}

#[test]
fn crashed_worker_is_skipped() {
    let (collector, host, _svc) = Collector::new();
    let mut pool = WorkerPool::new(PoolConfig::default().workers(2), collector).unwrap();
    pool.init_workers(2).unwrap();

    let victim = pool.workers()[0].pid();
    kill(victim, Signal::SIGKILL).unwrap();

    // let the EOF arrive and be accounted
    poll_until(&mut pool, || false, Duration::from_millis(300));
    assert_eq!(pool.alive_workers(), 1);

    // round-robin must route past the dead worker
    for _ in 0..2 {
        pool.run_check(CheckResult::for_host("h"), "/bin/echo up", 10)
            .unwrap();
    }
    poll_until(&mut pool, || host.borrow().len() >= 2, Duration::from_secs(10));
    assert_eq!(host.borrow().len(), 2);
    assert!(host.borrow().iter().all(|cr| cr.output == b"up\n"));
}

#[test]
fn notify_jobs_complete_without_callback() {
    let (collector, host, svc) = Collector::new();
    let mut pool = WorkerPool::new(PoolConfig::default().workers(1), collector).unwrap();
    pool.init_workers(1).unwrap();

    pool.notify("oncall", "web01", None, "/bin/echo paging", 10)
        .unwrap();
    // give the notification time to run; it must not reach the handler
    poll_until(&mut pool, || false, Duration::from_millis(800));
    assert!(host.borrow().is_empty());
    assert!(svc.borrow().is_empty());
}

#[test]
fn pool_rejects_shrinking_and_dispatch_before_init() {
    let (collector, _host, _svc) = Collector::new();
    let mut pool = WorkerPool::new(PoolConfig::default().workers(2), collector).unwrap();

    // dispatch before any worker exists
    assert!(pool
        .run_check(CheckResult::for_host("h"), "/bin/true", 5)
        .is_err());

    pool.init_workers(2).unwrap();
    assert!(pool.init_workers(1).is_err(), "shrinking must be refused");
    // growing is fine
    pool.init_workers(3).unwrap();
    assert_eq!(pool.num_workers(), 3);
}
