//! PTY-backed process backend.

use std::io::{self, Write};

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtyPair, PtySize};
use protocol::BackendKind;

use super::{spawn_reader_thread, BackendOutput, ProcessBackend, SpawnError, SpawnRequest};

/// A child process attached to a pseudo-terminal.
///
/// The slave side is closed in the parent right after spawning, so the
/// output stream ends once every process holding the terminal has exited.
pub struct PtyBackend {
    master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
    child: Box<dyn Child + Send + Sync>,
    pid: Option<u32>,
    exit_code: Option<i32>,
}

impl PtyBackend {
    /// Opens a PTY of the requested size and spawns `request.argv` on it.
    pub fn spawn(request: &SpawnRequest) -> Result<(Self, BackendOutput), SpawnError> {
        let pty_system = native_pty_system();

        let PtyPair { master, slave } = pty_system
            .openpty(PtySize {
                rows: request.rows,
                cols: request.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SpawnError::OpenPty(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&request.argv[0]);
        cmd.args(&request.argv[1..]);
        cmd.cwd(&request.cwd);
        for (key, value) in &request.env {
            cmd.env(key, value);
        }

        // On failure both halves are dropped here, closing their descriptors.
        let mut child = slave
            .spawn_command(cmd)
            .map_err(|e| SpawnError::Spawn {
                program: request.argv[0].clone(),
                reason: e.to_string(),
            })?;
        drop(slave);

        let pid = child.process_id();

        let wired = master
            .try_clone_reader()
            .and_then(|reader| Ok((reader, master.take_writer()?)));
        let (reader, writer) = match wired {
            Ok(pair) => pair,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(SpawnError::Spawn {
                    program: request.argv[0].clone(),
                    reason: e.to_string(),
                });
            }
        };

        let (tx, output) = BackendOutput::channel();
        if let Err(e) = spawn_reader_thread("termhub-pty-reader", reader, request.read_chunk_size, tx)
        {
            let _ = child.kill();
            let _ = child.wait();
            return Err(SpawnError::Io(e));
        }

        let backend = Self {
            master,
            writer,
            child,
            pid,
            exit_code: None,
        };

        Ok((backend, output))
    }
}

impl ProcessBackend for PtyBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Pty
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.writer.write_all(data)?;
        self.writer.flush()
    }

    fn resize(&mut self, rows: u16, cols: u16) -> bool {
        self.master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| tracing::debug!(error = %e, "PTY resize failed"))
            .is_ok()
    }

    #[cfg(unix)]
    fn signal(&mut self, signal: i32) -> bool {
        if self.exit_code.is_some() {
            return false;
        }
        super::signal_group(self.pid, signal)
    }

    #[cfg(not(unix))]
    fn signal(&mut self, signal: i32) -> bool {
        // Only termination can be expressed without POSIX signals.
        match signal {
            9 | 15 => self.kill(),
            _ => false,
        }
    }

    #[cfg(unix)]
    fn terminate(&mut self) -> bool {
        use nix::sys::signal::Signal;

        if self.exit_code.is_some() {
            return false;
        }
        // Hang up first: interactive shells ignore SIGTERM but exit on SIGHUP.
        let hup = super::signal_group(self.pid, Signal::SIGHUP as i32);
        let term = super::signal_group(self.pid, Signal::SIGTERM as i32);
        hup || term
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) -> bool {
        self.kill()
    }

    #[cfg(unix)]
    fn kill(&mut self) -> bool {
        if self.exit_code.is_some() {
            return false;
        }
        match self.pid {
            Some(_) => super::signal_group(self.pid, nix::sys::signal::Signal::SIGKILL as i32),
            None => self.child.kill().is_ok(),
        }
    }

    #[cfg(not(unix))]
    fn kill(&mut self) -> bool {
        self.child.kill().is_ok()
    }

    fn try_wait(&mut self) -> Option<i32> {
        if self.exit_code.is_none() {
            self.exit_code = self.reap(false);
        }
        self.exit_code
    }

    fn release(&mut self) {
        if self.try_wait().is_none() {
            self.kill();
            self.exit_code = self.reap(true);
        }
        tracing::debug!(pid = ?self.pid, exit_code = ?self.exit_code, "Released PTY backend");
    }
}

impl PtyBackend {
    /// Collects the child's exit status, blocking only if `block` is set.
    ///
    /// On unix the child is reaped with `waitpid` so a signal death is
    /// reported as `128 + n`, the same as the pipe backend.
    #[cfg(unix)]
    fn reap(&mut self, block: bool) -> Option<i32> {
        use nix::errno::Errno;
        use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
        use nix::unistd::Pid;

        let Some(pid) = self.pid else {
            return self.reap_child(block);
        };

        let flags = if block { None } else { Some(WaitPidFlag::WNOHANG) };
        match waitpid(Pid::from_raw(pid as i32), flags) {
            Ok(WaitStatus::Exited(_, code)) => Some(code),
            Ok(WaitStatus::Signaled(_, signal, _)) => Some(128 + signal as i32),
            Ok(_) => None,
            Err(Errno::EINTR) if block => self.reap(block),
            Err(e) => {
                // Nothing left to wait for; the exit status is unknown.
                tracing::debug!(pid, error = %e, "Failed to reap PTY child");
                Some(-1)
            }
        }
    }

    #[cfg(not(unix))]
    fn reap(&mut self, block: bool) -> Option<i32> {
        self.reap_child(block)
    }

    fn reap_child(&mut self, block: bool) -> Option<i32> {
        let status = if block {
            self.child.wait().ok()
        } else {
            self.child.try_wait().ok().flatten()
        };
        status.map(|status| status.exit_code() as i32)
    }
}
