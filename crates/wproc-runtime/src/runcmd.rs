//! Shell-free popen: run a command with stdout and stderr on pipes.
//!
//! The returned descriptors belong to the caller; the child pid is
//! tracked in a table indexed by the stdout descriptor, which is also
//! the set of descriptors a freshly forked child closes so plugin
//! processes never inherit another job's pipes or the master's sockets.
//!
//! Command lines are tokenized by [`wproc_core::cmdline::split`]; any
//! complication flag falls back to `/bin/sh -c <line>`.

use std::ffi::CString;
use std::os::unix::io::RawFd;

use wproc_core::cmdline;

use crate::broker::max_usable_fds;
use crate::error::{last_errno, Result, WorkError};

/// A started child: both pipe read ends plus the pid.
#[derive(Debug, Clone, Copy)]
pub struct Spawned {
    pub stdout_fd: RawFd,
    pub stderr_fd: RawFd,
    pub pid: libc::pid_t,
}

/// Child launcher owning the fd-indexed pid table.
///
/// Construction sizes the table to the descriptor limit; create it once
/// per process, before any jobs run.
pub struct Runcmd {
    pids: Vec<libc::pid_t>,
}

impl Runcmd {
    pub fn new() -> Self {
        Self {
            pids: vec![0; max_usable_fds()],
        }
    }

    /// The pid recorded for a stdout descriptor returned by [`open`].
    ///
    /// [`open`]: Runcmd::open
    pub fn pid_of(&self, fd: RawFd) -> Option<libc::pid_t> {
        match self.pids.get(fd as usize) {
            Some(&pid) if pid > 0 => Some(pid),
            _ => None,
        }
    }

    /// Start `cmd` with stdout and stderr redirected to fresh pipes.
    pub fn open(&mut self, cmd: &str) -> Result<Spawned> {
        let (argv, flags) = cmdline::split(cmd);
        let argv: Vec<CString> = if flags != 0 {
            // complications: let the shell interpret the original line
            ["/bin/sh", "-c", cmd]
                .iter()
                .map(|s| CString::new(*s))
                .collect::<std::result::Result<_, _>>()
                .map_err(|_| WorkError::BadCommand)?
        } else {
            argv.into_iter()
                .map(CString::new)
                .collect::<std::result::Result<_, _>>()
                .map_err(|_| WorkError::BadCommand)?
        };
        if argv.is_empty() {
            return Err(WorkError::BadCommand);
        }

        // everything the child touches is prepared before fork: the
        // argv pointer array and the failure diagnostic can't allocate
        // in the forked address space
        let mut argv_ptrs: Vec<*const libc::c_char> =
            argv.iter().map(|a| a.as_ptr()).collect();
        argv_ptrs.push(std::ptr::null());
        let exec_err_prefix = format!(
            "execvp({}) failed: errno ",
            argv[0].to_string_lossy()
        )
        .into_bytes();

        let (out_r, out_w) = pipe_raw()?;
        let (err_r, err_w) = match pipe_raw() {
            Ok(p) => p,
            Err(e) => {
                unsafe {
                    libc::close(out_r);
                    libc::close(out_w);
                }
                return Err(e);
            }
        };

        let pid = unsafe { libc::fork() };
        if pid < 0 {
            let e = WorkError::last_sys();
            unsafe {
                libc::close(out_r);
                libc::close(out_w);
                libc::close(err_r);
                libc::close(err_w);
            }
            return Err(e);
        }

        if pid == 0 {
            // child: plumb the pipes onto 1/2, drop every tracked
            // descriptor, exec. Nothing below allocates.
            unsafe {
                let core_limit = libc::rlimit {
                    rlim_cur: 0,
                    rlim_max: 0,
                };
                libc::setrlimit(libc::RLIMIT_CORE, &core_limit);

                libc::close(out_r);
                if out_w != libc::STDOUT_FILENO {
                    libc::dup2(out_w, libc::STDOUT_FILENO);
                    libc::close(out_w);
                }
                libc::close(err_r);
                if err_w != libc::STDERR_FILENO {
                    libc::dup2(err_w, libc::STDERR_FILENO);
                    libc::close(err_w);
                }

                for (fd, &p) in self.pids.iter().enumerate() {
                    if p > 0 {
                        libc::close(fd as RawFd);
                    }
                }

                libc::execvp(argv_ptrs[0], argv_ptrs.as_ptr());
                write_exec_failure(&exec_err_prefix, last_errno());
                libc::_exit(0);
            }
        }

        // parent
        unsafe {
            libc::close(out_w);
            libc::close(err_w);
        }
        if out_r as usize >= self.pids.len() {
            self.pids.resize(out_r as usize + 1, 0);
        }
        self.pids[out_r as usize] = pid;

        Ok(Spawned {
            stdout_fd: out_r,
            stderr_fd: err_r,
            pid,
        })
    }

    /// Reap the child recorded under `fd`, blocking until it exits.
    ///
    /// Closes `fd`, clears the table slot, and returns the exit code,
    /// or -1 when the child died by signal.
    pub fn close(&mut self, fd: RawFd) -> Result<i32> {
        let pid = self.take_pid(fd)?;
        unsafe { libc::close(fd) };

        let mut status = 0;
        loop {
            let ret = unsafe { libc::waitpid(pid, &mut status, 0) };
            if ret == pid {
                break;
            }
            if ret < 0 && last_errno() == libc::EINTR {
                continue;
            }
            return Err(WorkError::last_sys());
        }

        if libc::WIFEXITED(status) {
            Ok(libc::WEXITSTATUS(status))
        } else {
            Ok(-1)
        }
    }

    /// Non-blocking reap. `Ok(None)` while the child still runs;
    /// `Ok(Some(status))` (raw wait status) once it is gone. A nonzero
    /// `sig` is delivered once if the first reap finds no such child.
    pub fn try_close(&mut self, fd: RawFd, mut sig: i32) -> Result<Option<i32>> {
        let pid = match self.pids.get(fd as usize) {
            Some(&p) if p > 0 => p,
            _ => return Err(WorkError::UnknownChild(fd)),
        };

        let mut status = 0;
        loop {
            let ret = unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) };
            if ret == pid {
                break;
            }
            if ret == 0 {
                return Ok(None);
            }
            match last_errno() {
                libc::EINTR => continue,
                libc::ECHILD if sig != 0 => {
                    unsafe { libc::kill(pid, sig) };
                    sig = 0;
                }
                e => return Err(WorkError::Sys(e)),
            }
        }

        self.pids[fd as usize] = 0;
        unsafe { libc::close(fd) };
        Ok(Some(status))
    }

    /// Clear the table slot for `fd` without closing or reaping.
    ///
    /// For callers that wait on the child themselves (the worker loop
    /// reaps through `wait4` to get rusage) and close the descriptor
    /// through the broker. Returns the pid that was recorded, if any.
    pub fn release(&mut self, fd: RawFd) -> Option<libc::pid_t> {
        match self.pids.get_mut(fd as usize) {
            Some(p) if *p > 0 => {
                let pid = *p;
                *p = 0;
                Some(pid)
            }
            _ => None,
        }
    }

    fn take_pid(&mut self, fd: RawFd) -> Result<libc::pid_t> {
        match self.pids.get_mut(fd as usize) {
            Some(p) if *p > 0 => {
                let pid = *p;
                *p = 0;
                Ok(pid)
            }
            _ => Err(WorkError::UnknownChild(fd)),
        }
    }
}

impl Default for Runcmd {
    fn default() -> Self {
        Self::new()
    }
}

fn pipe_raw() -> Result<(RawFd, RawFd)> {
    let mut fds = [0 as RawFd; 2];
    let ret = unsafe { libc::pipe(fds.as_mut_ptr()) };
    if ret < 0 {
        return Err(WorkError::last_sys());
    }
    Ok((fds[0], fds[1]))
}

/// Emit `<prefix><errno>\n` on stderr without touching the heap; this
/// runs in the forked child after a failed exec.
fn write_exec_failure(prefix: &[u8], errno: i32) {
    let mut digits = [0u8; 12];
    let mut n = errno.unsigned_abs();
    let mut pos = digits.len();
    loop {
        pos -= 1;
        digits[pos] = b'0' + (n % 10) as u8;
        n /= 10;
        if n == 0 {
            break;
        }
    }
    unsafe {
        libc::write(
            libc::STDERR_FILENO,
            prefix.as_ptr() as *const libc::c_void,
            prefix.len(),
        );
        libc::write(
            libc::STDERR_FILENO,
            digits[pos..].as_ptr() as *const libc::c_void,
            digits.len() - pos,
        );
        libc::write(libc::STDERR_FILENO, b"\n".as_ptr() as *const libc::c_void, 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slurp(fd: RawFd) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 256];
        loop {
            let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            if n < 0 {
                if last_errno() == libc::EINTR {
                    continue;
                }
                break;
            }
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n as usize]);
        }
        out
    }

    #[test]
    fn test_open_captures_stdout() {
        let mut rc = Runcmd::new();
        let sp = rc.open("/bin/echo hello").unwrap();

        assert_eq!(rc.pid_of(sp.stdout_fd), Some(sp.pid));
        assert_eq!(slurp(sp.stdout_fd), b"hello\n");
        assert_eq!(slurp(sp.stderr_fd), b"");
        unsafe { libc::close(sp.stderr_fd) };

        assert_eq!(rc.close(sp.stdout_fd).unwrap(), 0);
        assert_eq!(rc.pid_of(sp.stdout_fd), None);
    }

    #[test]
    fn test_shell_fallback_on_pipe() {
        let mut rc = Runcmd::new();
        let sp = rc.open("echo a | cat").unwrap();
        assert_eq!(slurp(sp.stdout_fd), b"a\n");
        unsafe { libc::close(sp.stderr_fd) };
        assert_eq!(rc.close(sp.stdout_fd).unwrap(), 0);
    }

    #[test]
    fn test_exit_code_reported() {
        let mut rc = Runcmd::new();
        let sp = rc.open("/bin/sh -c 'exit 3'").unwrap();
        let _ = slurp(sp.stdout_fd);
        unsafe { libc::close(sp.stderr_fd) };
        assert_eq!(rc.close(sp.stdout_fd).unwrap(), 3);
    }

    #[test]
    fn test_exec_failure_diagnosed_on_stderr() {
        let mut rc = Runcmd::new();
        let sp = rc.open("/no/such/binary_wproc_test").unwrap();
        let err = slurp(sp.stderr_fd);
        let msg = String::from_utf8_lossy(&err);
        assert!(msg.contains("execvp"), "stderr was: {}", msg);
        assert_eq!(slurp(sp.stdout_fd), b"");
        unsafe { libc::close(sp.stderr_fd) };
        // the exec-failed child exits 0; the daemon learns from stderr
        assert_eq!(rc.close(sp.stdout_fd).unwrap(), 0);
    }

    #[test]
    fn test_empty_command_rejected() {
        let mut rc = Runcmd::new();
        assert_eq!(rc.open("").unwrap_err(), WorkError::BadCommand);
        assert_eq!(rc.open("   ").unwrap_err(), WorkError::BadCommand);
    }

    #[test]
    fn test_close_unknown_fd() {
        let mut rc = Runcmd::new();
        assert_eq!(rc.close(500).unwrap_err(), WorkError::UnknownChild(500));
    }

    #[test]
    fn test_try_close_running_then_done() {
        let mut rc = Runcmd::new();
        let sp = rc.open("/bin/sleep 0.2").unwrap();

        // immediately after spawn the child is (almost certainly) alive
        match rc.try_close(sp.stdout_fd, 0) {
            Ok(None) => {
                // drain to EOF so we know it exited, then reap
                let _ = slurp(sp.stdout_fd);
                let status = loop {
                    if let Some(st) = rc.try_close(sp.stdout_fd, 0).unwrap() {
                        break st;
                    }
                    std::thread::sleep(std::time::Duration::from_millis(10));
                };
                assert!(libc::WIFEXITED(status));
                assert_eq!(libc::WEXITSTATUS(status), 0);
            }
            Ok(Some(status)) => {
                // raced a very fast exit; still a clean one
                assert!(libc::WIFEXITED(status));
            }
            Err(e) => panic!("try_close failed: {}", e),
        }
        unsafe { libc::close(sp.stderr_fd) };
    }
}
