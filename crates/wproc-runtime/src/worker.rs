//! The worker process: spawning, and the loop it runs.
//!
//! A worker is forked off the master with one end of a socketpair and
//! then runs a single broker loop for its whole life. Framed requests
//! arrive on the master socket; each one forks a child through
//! [`Runcmd`], the child's pipes feed per-job output buffers, and a
//! reaped child turns into a framed response carrying its captured
//! output and rusage.
//!
//! Everything here is single-threaded and cooperative: the only
//! suspension point is the broker poll.

use std::os::unix::io::{IntoRawFd, RawFd};

use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use nix::unistd::{fork, ForkResult, Pid};

use wproc_core::kvvec::{KvVec, FRAME_DELIM};
use wproc_core::tv::{now_secs, Tv};
use wproc_core::{wdebug, wlog};

use crate::broker::{IoBroker, Token};
use crate::error::{last_errno, Result, WorkError};
use crate::iocache::IoCache;
use crate::runcmd::Runcmd;

/// Jobs without a timeout get a default of 300 seconds.
const DEFAULT_JOB_TIMEOUT: i64 = 300;
/// Per-wakeup read size for child output pipes.
const OUTPUT_CHUNK: usize = 4096;
/// Request cache size; also the master's per-worker response cache size.
pub const IOCACHE_SIZE: usize = 65536;

/// Token for the master socket; child pipes encode slot and stream.
const TOK_MASTER: u64 = u64::MAX;

fn tok_stdout(slot: usize) -> Token {
    Token((slot as u64) << 1)
}

fn tok_stderr(slot: usize) -> Token {
    Token((slot as u64) << 1 | 1)
}

/// Master-side handle to a spawned worker.
#[derive(Debug, Clone, Copy)]
pub struct WorkerHandle {
    pub sd: RawFd,
    pub pid: Pid,
}

/// Fork a worker connected over a socketpair.
///
/// The child runs `init` before anything else, so the master can drop
/// heavyweight state that would otherwise sit in the copy-on-write
/// image. It then enters the worker loop and never returns; the parent
/// gets the socket and pid.
pub fn spawn_worker<F: FnOnce()>(init: F) -> Result<WorkerHandle> {
    let (parent_sd, child_sd) = socketpair(
        AddressFamily::Unix,
        SockType::Stream,
        None,
        SockFlag::empty(),
    )?;

    match unsafe { fork() }? {
        ForkResult::Parent { child } => {
            drop(child_sd);
            Ok(WorkerHandle {
                sd: parent_sd.into_raw_fd(),
                pid: child,
            })
        }
        ForkResult::Child => {
            init();
            drop(parent_sd);
            enter_worker(child_sd.into_raw_fd());
        }
    }
}

struct IoBuf {
    fd: RawFd,
    buf: Vec<u8>,
}

impl IoBuf {
    fn new(fd: RawFd) -> Self {
        Self {
            fd,
            buf: Vec::new(),
        }
    }
}

struct ChildJob {
    id: u64,
    cmd: String,
    pid: libc::pid_t,
    start: Tv,
    stop: Tv,
    /// Absolute deadline. Recorded but not yet enforced; a later
    /// revision adds a scan that signals overdue children.
    #[allow(dead_code)]
    timeout: i64,
    ret: i32,
    rusage: libc::rusage,
    outstd: IoBuf,
    outerr: IoBuf,
    request: KvVec,
}

struct WorkerState {
    master_sd: RawFd,
    ioc: IoCache,
    runcmd: Runcmd,
    children: Vec<Option<ChildJob>>,
    free_slots: Vec<usize>,
    parent_pid: libc::pid_t,
    started: u64,
    running: u64,
    done: bool,
}

/// Become a worker on `master_sd`. Never returns.
fn enter_worker(master_sd: RawFd) -> ! {
    wlog::set_role(b'w');

    unsafe {
        // a dead master shows up as EPIPE on write, not a signal
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        libc::setpgid(0, 0);
        libc::fcntl(libc::STDOUT_FILENO, libc::F_SETFD, libc::FD_CLOEXEC);
        libc::fcntl(libc::STDERR_FILENO, libc::F_SETFD, libc::FD_CLOEXEC);
        libc::fcntl(master_sd, libc::F_SETFD, libc::FD_CLOEXEC);
    }

    let mut broker = match IoBroker::new() {
        Ok(b) => b,
        Err(e) => {
            wproc_core::werror!("worker failed to create io broker: {}", e);
            std::process::exit(1);
        }
    };

    let mut st = WorkerState {
        master_sd,
        ioc: IoCache::with_capacity(IOCACHE_SIZE),
        runcmd: Runcmd::new(),
        children: Vec::new(),
        free_slots: Vec::new(),
        parent_pid: unsafe { libc::getppid() },
        started: 0,
        running: 0,
        done: false,
    };

    if broker.register(master_sd, Token(TOK_MASTER)).is_err() {
        std::process::exit(1);
    }

    // bounded poll so the liveness probe below runs even when idle
    while !st.done && broker.num_fds() > 0 {
        let _ = broker.poll(5000, |brk, ready| st.dispatch(brk, ready));

        // orphaned workers have nobody to report to
        if unsafe { libc::kill(st.parent_pid, 0) } != 0 {
            break;
        }
    }

    std::process::exit(0);
}

impl WorkerState {
    fn dispatch(&mut self, brk: &mut IoBroker, ready: crate::broker::Ready) {
        if ready.token.0 == TOK_MASTER {
            self.receive_command(brk);
        } else {
            let slot = (ready.token.0 >> 1) as usize;
            let is_stderr = ready.token.0 & 1 == 1;
            self.gather_output(brk, slot, is_stderr);
        }
    }

    /// Master socket is readable: buffer bytes, run every complete frame.
    fn receive_command(&mut self, brk: &mut IoBroker) {
        match self.ioc.read(self.master_sd) {
            Ok(0) => {
                // master closed the channel; we're done
                let _ = brk.close(self.master_sd);
                self.done = true;
                return;
            }
            Ok(_) => {}
            Err(WorkError::Sys(e)) if e == libc::EINTR => return,
            Err(e) => {
                wdebug!("worker read from master failed: {}", e);
                return;
            }
        }

        loop {
            let frame = self.ioc.use_delim(FRAME_DELIM).map(|f| f.to_vec());
            match frame {
                Some(f) => self.spawn_job(brk, &f),
                None => break,
            }
        }
    }

    /// Parse one request frame and start its child.
    fn spawn_job(&mut self, brk: &mut IoBroker, frame: &[u8]) {
        let Some(request) = KvVec::parse_frame(frame) else {
            self.wlog("dropping unparsable job frame");
            return;
        };

        let mut cmd: Option<String> = None;
        let mut id = 0u64;
        let mut timeout = 0i64;
        for kv in &request {
            match kv.key.as_slice() {
                b"command" => cmd = Some(String::from_utf8_lossy(&kv.value).into_owned()),
                b"job_id" => id = parse_num(&kv.value).unwrap_or(0),
                b"timeout" => timeout = parse_num(&kv.value).unwrap_or(0),
                // unknown keys ride along untouched and are echoed back
                _ => {}
            }
        }
        let timeout = derive_timeout(timeout, now_secs());

        let Some(cmd) = cmd else {
            self.job_error(&request, &format!("missing command line, ignoring job {}", id));
            return;
        };

        let spawned = match self.runcmd.open(&cmd) {
            Ok(sp) => sp,
            Err(e) => {
                self.job_error(&request, &format!("failed to start child: {}", e));
                return;
            }
        };

        let slot = self.alloc_slot();
        self.children[slot] = Some(ChildJob {
            id,
            cmd,
            pid: spawned.pid,
            start: Tv::now(),
            stop: Tv::default(),
            timeout,
            ret: 0,
            rusage: unsafe { std::mem::zeroed() },
            outstd: IoBuf::new(spawned.stdout_fd),
            outerr: IoBuf::new(spawned.stderr_fd),
            request,
        });

        if let Err(e) = brk.register(spawned.stdout_fd, tok_stdout(slot)) {
            wdebug!("register stdout fd {}: {}", spawned.stdout_fd, e);
        }
        if let Err(e) = brk.register(spawned.stderr_fd, tok_stderr(slot)) {
            wdebug!("register stderr fd {}: {}", spawned.stderr_fd, e);
        }

        self.started += 1;
        self.running += 1;
        self.wlog(&format!(
            "job {} started (started: {}, running: {})",
            id, self.started, self.running
        ));
    }

    /// A child pipe is readable: append output, or fold the pipe on EOF.
    fn gather_output(&mut self, brk: &mut IoBroker, slot: usize, is_stderr: bool) {
        loop {
            let fd = match self.children[slot].as_ref() {
                Some(c) => {
                    if is_stderr {
                        c.outerr.fd
                    } else {
                        c.outstd.fd
                    }
                }
                None => return,
            };
            if fd < 0 {
                return;
            }

            let mut buf = [0u8; OUTPUT_CHUNK];
            let rd = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            if rd < 0 {
                if last_errno() == libc::EINTR {
                    continue;
                }
                self.check_completion(brk, slot, false);
                return;
            }

            if rd > 0 {
                if let Some(c) = self.children[slot].as_mut() {
                    let io = if is_stderr { &mut c.outerr } else { &mut c.outstd };
                    io.buf.extend_from_slice(&buf[..rd as usize]);
                }
                return;
            }

            // EOF: this pipe is finished
            let _ = brk.close(fd);
            let other_fd = match self.children[slot].as_mut() {
                Some(c) => {
                    if is_stderr {
                        c.outerr.fd = -1;
                        c.outstd.fd
                    } else {
                        self.runcmd.release(fd);
                        c.outstd.fd = -1;
                        c.outerr.fd
                    }
                }
                None => return,
            };

            // when both pipes are gone the child is exiting; wait for it
            self.check_completion(brk, slot, other_fd < 0);
            return;
        }
    }

    /// Reap the child if it is done (or gone) and ship the response.
    fn check_completion(&mut self, brk: &mut IoBroker, slot: usize, blocking: bool) {
        let pid = match self.children[slot].as_ref() {
            Some(c) if c.pid > 0 => c.pid,
            _ => return,
        };

        let flags = if blocking { 0 } else { libc::WNOHANG };
        let mut status = 0;
        let mut rusage: libc::rusage = unsafe { std::mem::zeroed() };
        let ret = unsafe { libc::wait4(pid, &mut status, flags, &mut rusage) };

        if ret == pid || (ret < 0 && last_errno() == libc::ECHILD) {
            if let Some(c) = self.children[slot].as_mut() {
                c.ret = status;
                c.rusage = rusage;
                c.pid = 0;
            }
            self.finish_job(brk, slot, 0);
        }
    }

    /// Stamp the stop time, build the response, free the slot.
    fn finish_job(&mut self, brk: &mut IoBroker, slot: usize, reason: i32) {
        let Some(mut child) = self.children[slot].take() else {
            return;
        };
        self.free_slots.push(slot);
        wdebug!("job {} '{}' finished", child.id, child.cmd);

        child.stop = Tv::now();
        if child.outstd.fd >= 0 {
            let _ = brk.close(child.outstd.fd);
            self.runcmd.release(child.outstd.fd);
            child.outstd.fd = -1;
        }
        if child.outerr.fd >= 0 {
            let _ = brk.close(child.outerr.fd);
            child.outerr.fd = -1;
        }

        let resp = build_response(&child, reason);
        if let Err(e) = self.send_kvvec(&resp) {
            wdebug!("worker failed to send response for job {}: {}", child.id, e);
        }
        self.running -= 1;
    }

    /// Ship an error response for a job that never ran.
    fn job_error(&mut self, request: &KvVec, msg: &str) {
        let resp = build_error_response(request, msg, Tv::now());
        if let Err(e) = self.send_kvvec(&resp) {
            wdebug!("worker failed to send error response: {}", e);
        }
    }

    /// Out-of-band diagnostic to the master: a single-pair `log=` frame.
    fn wlog(&mut self, msg: &str) {
        let mut kvv = KvVec::with_hint(1);
        kvv.add_str("log", msg);
        if let Err(WorkError::Sys(e)) = self.send_kvvec(&kvv) {
            if e == libc::EPIPE {
                self.done = true;
            }
        }
    }

    fn send_kvvec(&mut self, kvv: &KvVec) -> Result<()> {
        let buf = kvv.to_frame();
        match write_all(self.master_sd, &buf.data) {
            Err(WorkError::Sys(e)) if e == libc::EPIPE => {
                // master is gone; exit with success so it (or its
                // successor) sees a clean EOF
                self.done = true;
                Err(WorkError::Sys(e))
            }
            other => other,
        }
    }

    fn alloc_slot(&mut self) -> usize {
        match self.free_slots.pop() {
            Some(slot) => slot,
            None => {
                self.children.push(None);
                self.children.len() - 1
            }
        }
    }
}

/// Absolute deadline for a job: a zero request value means the default,
/// anything else is a relative duration padded by one second.
fn derive_timeout(requested: i64, now: i64) -> i64 {
    if requested == 0 {
        now + DEFAULT_JOB_TIMEOUT
    } else {
        requested + now + 1
    }
}

/// Request pairs minus `env` keys, into a vector with room for `hint`.
fn echo_request(request: &KvVec, hint: usize) -> KvVec {
    let mut resp = KvVec::with_hint(hint);
    for kv in request {
        if kv.key.as_slice() != b"env" {
            resp.add(kv.key.clone(), kv.value.clone());
        }
    }
    resp
}

/// The full response record for a finished child.
fn build_response(child: &ChildJob, reason: i32) -> KvVec {
    let mut resp = echo_request(&child.request, child.request.len() + 16);

    resp.add_str("wait_status", &child.ret.to_string());
    resp.add(b"stdout".to_vec(), child.outstd.buf.clone());
    resp.add(b"stderr".to_vec(), child.outerr.buf.clone());
    resp.add_str("start", &child.start.to_string());
    resp.add_str("stop", &child.stop.to_string());
    resp.add_str("runtime", &format!("{:.6}", child.start.delta(&child.stop)));

    if reason == 0 {
        let ru = &child.rusage;
        resp.add_str("ru_utime", &tv_of(ru.ru_utime).to_string());
        resp.add_str("ru_stime", &tv_of(ru.ru_stime).to_string());
        resp.add_str("ru_minflt", &ru.ru_minflt.to_string());
        resp.add_str("ru_majflt", &ru.ru_majflt.to_string());
        resp.add_str("ru_nswap", &ru.ru_nswap.to_string());
        resp.add_str("ru_inblock", &ru.ru_inblock.to_string());
        resp.add_str("ru_oublock", &ru.ru_oublock.to_string());
        resp.add_str("ru_nsignals", &ru.ru_nsignals.to_string());
    } else {
        resp.add_str("reason", &reason.to_string());
    }
    resp
}

/// Response for a job that failed before a child ever ran: the request
/// pairs, an empty capture-and-timing skeleton, and the error text.
/// `wait_status` is deliberately absent so the master's accumulator
/// keeps `exited_ok == false`.
fn build_error_response(request: &KvVec, msg: &str, now: Tv) -> KvVec {
    let mut resp = echo_request(request, request.len() + 8);
    resp.add(b"stdout".to_vec(), Vec::new());
    resp.add(b"stderr".to_vec(), Vec::new());
    resp.add_str("start", &now.to_string());
    resp.add_str("stop", &now.to_string());
    resp.add_str("runtime", "0.000000");
    resp.add_str("error", msg);
    resp
}

fn tv_of(tv: libc::timeval) -> Tv {
    Tv::new(tv.tv_sec as i64, tv.tv_usec as i64)
}

fn parse_num<T: std::str::FromStr>(value: &[u8]) -> Option<T> {
    std::str::from_utf8(value).ok()?.trim().parse().ok()
}

/// Write the whole buffer, riding out partial writes and EINTR.
pub fn write_all(fd: RawFd, mut data: &[u8]) -> Result<()> {
    while !data.is_empty() {
        let n = unsafe { libc::write(fd, data.as_ptr() as *const libc::c_void, data.len()) };
        if n < 0 {
            if last_errno() == libc::EINTR {
                continue;
            }
            return Err(WorkError::last_sys());
        }
        data = &data[n as usize..];
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(pairs: &[(&str, &str)]) -> KvVec {
        let mut kvv = KvVec::new();
        for (k, v) in pairs {
            kvv.add_str(k, v);
        }
        kvv
    }

    fn child_with(request: KvVec) -> ChildJob {
        ChildJob {
            id: 9,
            cmd: "/bin/true".into(),
            pid: 0,
            start: Tv::new(100, 0),
            stop: Tv::new(101, 500_000),
            timeout: 0,
            ret: 0,
            rusage: unsafe { std::mem::zeroed() },
            outstd: IoBuf {
                fd: -1,
                buf: b"out\n".to_vec(),
            },
            outerr: IoBuf {
                fd: -1,
                buf: Vec::new(),
            },
            request,
        }
    }

    #[test]
    fn test_token_encoding() {
        assert_eq!(tok_stdout(5).0 >> 1, 5);
        assert_eq!(tok_stdout(5).0 & 1, 0);
        assert_eq!(tok_stderr(5).0 >> 1, 5);
        assert_eq!(tok_stderr(5).0 & 1, 1);
        assert_ne!(tok_stdout(0).0, TOK_MASTER);
    }

    #[test]
    fn test_derive_timeout() {
        assert_eq!(derive_timeout(0, 1000), 1000 + DEFAULT_JOB_TIMEOUT);
        assert_eq!(derive_timeout(30, 1000), 1031);
    }

    #[test]
    fn test_response_echoes_request_without_env() {
        let request = req(&[
            ("job_id", "9"),
            ("type", "0"),
            ("env", "PATH=/bin"),
            ("command", "/bin/true"),
            ("env", "HOME=/"),
        ]);
        let resp = build_response(&child_with(request), 0);

        assert_eq!(resp.get(b"job_id"), Some(&b"9"[..]));
        assert_eq!(resp.get(b"command"), Some(&b"/bin/true"[..]));
        assert!(resp.get(b"env").is_none());
        // echoed pairs come first
        assert_eq!(resp.iter().next().unwrap().key, b"job_id");
    }

    #[test]
    fn test_response_fields_normal_completion() {
        let resp = build_response(&child_with(req(&[("job_id", "9")])), 0);

        assert_eq!(resp.get(b"wait_status"), Some(&b"0"[..]));
        assert_eq!(resp.get(b"stdout"), Some(&b"out\n"[..]));
        assert_eq!(resp.get(b"stderr"), Some(&b""[..]));
        assert_eq!(resp.get(b"start"), Some(&b"100.000000"[..]));
        assert_eq!(resp.get(b"stop"), Some(&b"101.500000"[..]));
        assert_eq!(resp.get(b"runtime"), Some(&b"1.500000"[..]));
        for key in [
            "ru_utime",
            "ru_stime",
            "ru_minflt",
            "ru_majflt",
            "ru_nswap",
            "ru_inblock",
            "ru_oublock",
            "ru_nsignals",
        ] {
            assert!(resp.get(key.as_bytes()).is_some(), "missing {}", key);
        }
        assert!(resp.get(b"reason").is_none());
    }

    #[test]
    fn test_response_fields_abnormal_reason() {
        let resp = build_response(&child_with(req(&[("job_id", "9")])), libc::ETIME);
        assert_eq!(
            resp.get(b"reason"),
            Some(libc::ETIME.to_string().as_bytes())
        );
        assert!(resp.get(b"ru_utime").is_none());
    }

    #[test]
    fn test_error_response_shape() {
        let request = req(&[
            ("job_id", "4"),
            ("type", "0"),
            ("command", "/no/such"),
            ("timeout", "5"),
        ]);
        let resp = build_error_response(&request, "failed to start child", Tv::new(50, 0));

        // enough pairs for the master to accept the frame
        assert!(resp.len() >= 6, "only {} pairs", resp.len());
        assert_eq!(resp.iter().next().unwrap().key, b"job_id");
        assert_eq!(resp.get(b"error"), Some(&b"failed to start child"[..]));
        // no wait_status: the accumulator must keep exited_ok == false
        assert!(resp.get(b"wait_status").is_none());
    }

    #[test]
    fn test_parse_num() {
        assert_eq!(parse_num::<u64>(b"42"), Some(42));
        assert_eq!(parse_num::<i64>(b" 7 "), Some(7));
        assert_eq!(parse_num::<u64>(b"x42"), None);
        assert_eq!(parse_num::<u64>(b"\xff\xfe"), None);
    }

    #[test]
    fn test_write_all_roundtrip() {
        let (r, w) = nix::unistd::pipe().unwrap();
        use std::os::unix::io::AsRawFd;
        write_all(w.as_raw_fd(), b"framed bytes").unwrap();
        let mut buf = [0u8; 32];
        let n = unsafe {
            libc::read(
                r.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            )
        };
        assert_eq!(&buf[..n as usize], b"framed bytes");
    }
}
