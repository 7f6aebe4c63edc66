//! # wrkr: interactive worker multiplexing driver
//!
//! Type command lines on stdin; each one becomes a job shipped to one
//! of the spawned workers (round-robin), and every framed response is
//! printed as it arrives. Handy for poking at the worker protocol
//! without a daemon around it.
//!
//! ## Usage
//!
//!   wrkr [-n WORKERS]
//!
//!   $ echo "/bin/echo hello" | wrkr -n 2

use std::os::unix::io::RawFd;

use wproc_core::kvvec::{KvVec, FRAME_DELIM};
use wproc_runtime::worker::{spawn_worker, write_all};
use wproc_runtime::{IoBroker, IoCache, Ready, Token, WorkerHandle};

const STDIN_TOKEN: u64 = u64::MAX;
const STDIN_FD: RawFd = 0;

struct Driver {
    workers: Vec<(WorkerHandle, IoCache)>,
    next: usize,
    job_id: u64,
    stdin_ioc: IoCache,
    quit: bool,
}

impl Driver {
    fn dispatch(&mut self, brk: &mut IoBroker, ready: Ready) {
        if ready.token.0 == STDIN_TOKEN {
            self.read_stdin(brk);
        } else {
            self.read_worker(brk, ready.token.0 as usize);
        }
    }

    /// A line on stdin becomes one job frame.
    fn read_stdin(&mut self, brk: &mut IoBroker) {
        match self.stdin_ioc.read(STDIN_FD) {
            Ok(0) => {
                // end of input: close worker channels so they exit
                let _ = brk.unregister(STDIN_FD);
                for (handle, _) in &self.workers {
                    let _ = brk.close(handle.sd);
                }
                self.quit = true;
                return;
            }
            Ok(_) => {}
            Err(e) => {
                eprintln!("wrkr: stdin read failed: {}", e);
                return;
            }
        }

        loop {
            let line = self.stdin_ioc.use_delim(b"\n").map(|l| l.to_vec());
            let Some(line) = line else { break };
            let cmd = String::from_utf8_lossy(&line).trim().to_string();
            if cmd.is_empty() {
                continue;
            }
            self.send_job(&cmd);
        }
    }

    fn send_job(&mut self, cmd: &str) {
        let id = self.job_id;
        self.job_id += 1;

        let mut kvv = KvVec::with_hint(4);
        kvv.add_str("job_id", &id.to_string());
        kvv.add_str("type", "0");
        kvv.add_str("command", cmd);
        kvv.add_str("timeout", "60");
        let frame = kvv.to_frame();

        let idx = self.next % self.workers.len();
        self.next += 1;
        let (handle, _) = &self.workers[idx];
        match write_all(handle.sd, &frame.data) {
            Ok(()) => println!("job {} -> worker {} ({})", id, idx, handle.pid),
            Err(e) => eprintln!("wrkr: send to worker {} failed: {}", idx, e),
        }
    }

    /// Print every complete frame a worker sent back.
    fn read_worker(&mut self, brk: &mut IoBroker, idx: usize) {
        let Some((handle, ioc)) = self.workers.get_mut(idx) else {
            return;
        };
        let sd = handle.sd;
        let pid = handle.pid;

        match ioc.read(sd) {
            Ok(0) => {
                println!("worker {} ({}) hung up", idx, pid);
                let _ = brk.close(sd);
                return;
            }
            Ok(_) => {}
            Err(e) => {
                eprintln!("wrkr: read from worker {} failed: {}", idx, e);
                return;
            }
        }

        loop {
            let frame = ioc.use_delim(FRAME_DELIM).map(|f| f.to_vec());
            let Some(frame) = frame else { break };
            match KvVec::parse_frame(&frame) {
                Some(kvv) => {
                    println!("worker {} ({}) replied:", idx, pid);
                    for kv in &kvv {
                        println!(
                            "  {} = {}",
                            String::from_utf8_lossy(&kv.key),
                            String::from_utf8_lossy(&kv.value).escape_debug()
                        );
                    }
                }
                None => println!("worker {} ({}): unparsable frame", idx, pid),
            }
        }
    }
}

fn parse_args() -> usize {
    let args: Vec<String> = std::env::args().collect();
    let mut workers = 3;
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-n" | "--workers" => {
                i += 1;
                workers = args.get(i).and_then(|s| s.parse().ok()).unwrap_or(3);
            }
            "-h" | "--help" => {
                eprintln!("Usage: wrkr [-n WORKERS]   (commands on stdin, one per line)");
                std::process::exit(0);
            }
            other => {
                eprintln!("wrkr: unknown argument: {}", other);
                std::process::exit(1);
            }
        }
        i += 1;
    }
    workers.max(1)
}

fn main() {
    let num_workers = parse_args();

    let mut broker = match IoBroker::new() {
        Ok(b) => b,
        Err(e) => {
            eprintln!("wrkr: failed to create io broker: {}", e);
            std::process::exit(1);
        }
    };

    let mut driver = Driver {
        workers: Vec::with_capacity(num_workers),
        next: 0,
        job_id: 0,
        stdin_ioc: IoCache::with_capacity(8192),
        quit: false,
    };

    for i in 0..num_workers {
        match spawn_worker(|| {}) {
            Ok(handle) => {
                eprintln!("wrkr: worker {} is pid {}, sd {}", i, handle.pid, handle.sd);
                broker
                    .register(handle.sd, Token(i as u64))
                    .expect("register worker socket");
                driver
                    .workers
                    .push((handle, IoCache::with_capacity(65536)));
            }
            Err(e) => {
                eprintln!("wrkr: failed to spawn worker: {}", e);
                std::process::exit(1);
            }
        }
    }
    broker
        .register(STDIN_FD, Token(STDIN_TOKEN))
        .expect("register stdin");

    while broker.num_fds() > 0 {
        if let Err(e) = broker.poll(-1, |brk, ready| driver.dispatch(brk, ready)) {
            eprintln!("wrkr: poll failed: {}", e);
            break;
        }
        if driver.quit && broker.num_fds() == 0 {
            break;
        }
    }
}
