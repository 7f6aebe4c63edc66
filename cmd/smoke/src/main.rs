//! # smoke: end-to-end pool exercise
//!
//! Spins up a real pool, runs a host check, a service check that only
//! writes to stderr, a shell-fallback pipeline and a notification, and
//! verifies what the completion handler received. Exits nonzero on any
//! mismatch, so it doubles as a deployment sanity check.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use wproc::{CheckHandler, CheckResult, PoolConfig, WorkerPool};

#[derive(Default)]
struct Sink {
    results: Rc<RefCell<Vec<CheckResult>>>,
}

impl CheckHandler for Sink {
    fn host_check(&mut self, result: CheckResult) {
        self.results.borrow_mut().push(result);
    }

    fn service_check(&mut self, result: CheckResult) {
        self.results.borrow_mut().push(result);
    }
}

fn main() {
    let sink = Sink::default();
    let results = sink.results.clone();

    let mut pool = match WorkerPool::new(PoolConfig::from_env().workers(2), Box::new(sink)) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("smoke: pool creation failed: {}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = pool.init_workers(0) {
        eprintln!("smoke: init_workers failed: {}", e);
        std::process::exit(1);
    }
    eprintln!("smoke: {} workers up", pool.num_workers());

    let submissions = [
        ("host echo", pool.run_check(CheckResult::for_host("web01"), "/bin/echo hello", 10)),
        (
            "service stderr",
            pool.run_check(
                CheckResult::for_service("web01", "DISK"),
                "/bin/sh -c '1>&2 echo err; exit 3'",
                10,
            ),
        ),
        (
            "shell fallback",
            pool.run_check(CheckResult::for_host("db01"), "echo a | cat", 10),
        ),
        (
            "notification",
            pool.notify("oncall", "web01", None, "/bin/echo paging oncall", 10),
        ),
    ];
    for (what, outcome) in &submissions {
        if let Err(e) = outcome {
            eprintln!("smoke: submitting {} failed: {}", what, e);
            std::process::exit(1);
        }
    }

    // three check completions expected; the notification only logs
    let deadline = Instant::now() + Duration::from_secs(10);
    while results.borrow().len() < 3 && Instant::now() < deadline {
        let _ = pool.poll(200);
    }

    let results = results.borrow();
    let mut failed = false;
    let mut expect = |what: &str, ok: bool| {
        eprintln!("smoke: {:<30} {}", what, if ok { "ok" } else { "FAILED" });
        failed |= !ok;
    };

    expect("three completions", results.len() == 3);

    let by_host = |h: &str| results.iter().find(|r| r.host_name == h && r.service_description.is_none());
    let echo = by_host("web01");
    expect(
        "host echo output",
        echo.map_or(false, |r| r.exited_ok && r.return_code == 0 && r.output == b"hello\n"),
    );

    let disk = results.iter().find(|r| r.service_description.as_deref() == Some("DISK"));
    expect(
        "service stderr promoted",
        disk.map_or(false, |r| r.exited_ok && r.return_code == 3 && r.output == b"err\n"),
    );

    let pipe = by_host("db01");
    expect(
        "shell fallback output",
        pipe.map_or(false, |r| r.exited_ok && r.output == b"a\n"),
    );

    drop(results);
    pool.shutdown();

    if failed {
        std::process::exit(1);
    }
    eprintln!("smoke: all good");
}
