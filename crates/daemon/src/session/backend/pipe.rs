//! Pipe-backed process backend.

use std::io::{self, Write};
use std::process::{Child, ChildStdin, Command, Stdio};

use protocol::BackendKind;

use super::{
    exit_code_of, spawn_reader_thread, BackendOutput, ProcessBackend, SpawnError, SpawnRequest,
};

/// A child process attached to stdin/stdout/stderr pipes.
///
/// stdout and stderr are read by separate threads feeding the same
/// channel, so the stream ends only after both have closed. On unix the
/// child leads its own process group.
pub struct PipeBackend {
    child: Child,
    stdin: Option<ChildStdin>,
    pid: u32,
    exit_code: Option<i32>,
}

impl PipeBackend {
    /// Spawns `request.argv` with piped standard streams.
    pub fn spawn(request: &SpawnRequest) -> Result<(Self, BackendOutput), SpawnError> {
        let mut cmd = Command::new(&request.argv[0]);
        cmd.args(&request.argv[1..])
            .current_dir(&request.cwd)
            .envs(request.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        let mut child = cmd.spawn().map_err(|e| SpawnError::Spawn {
            program: request.argv[0].clone(),
            reason: e.to_string(),
        })?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (tx, output) = BackendOutput::channel();
        let wired = (|| -> io::Result<()> {
            if let Some(stdout) = stdout {
                spawn_reader_thread("termhub-pipe-stdout", stdout, request.read_chunk_size, tx.clone())?;
            }
            if let Some(stderr) = stderr {
                spawn_reader_thread("termhub-pipe-stderr", stderr, request.read_chunk_size, tx)?;
            }
            Ok(())
        })();

        if let Err(e) = wired {
            let _ = child.kill();
            let _ = child.wait();
            return Err(SpawnError::Io(e));
        }

        let pid = child.id();
        let backend = Self {
            child,
            stdin,
            pid,
            exit_code: None,
        };

        Ok((backend, output))
    }
}

impl ProcessBackend for PipeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Pipe
    }

    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "stdin is closed"))?;
        stdin.write_all(data)?;
        stdin.flush()
    }

    #[cfg(unix)]
    fn signal(&mut self, signal: i32) -> bool {
        super::signal_group(Some(self.pid), signal)
    }

    #[cfg(not(unix))]
    fn signal(&mut self, signal: i32) -> bool {
        match signal {
            9 | 15 => self.kill(),
            _ => false,
        }
    }

    #[cfg(unix)]
    fn terminate(&mut self) -> bool {
        super::signal_group(Some(self.pid), nix::sys::signal::Signal::SIGTERM as i32)
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) -> bool {
        self.kill()
    }

    fn kill(&mut self) -> bool {
        #[cfg(unix)]
        let grouped = super::signal_group(Some(self.pid), nix::sys::signal::Signal::SIGKILL as i32);
        #[cfg(not(unix))]
        let grouped = false;

        self.child.kill().is_ok() || grouped
    }

    fn try_wait(&mut self) -> Option<i32> {
        if self.exit_code.is_none() {
            if let Ok(Some(status)) = self.child.try_wait() {
                self.exit_code = Some(exit_code_of(status));
            }
        }
        self.exit_code
    }

    fn release(&mut self) {
        self.stdin.take();
        if self.try_wait().is_none() {
            self.kill();
            if let Ok(status) = self.child.wait() {
                self.exit_code = Some(exit_code_of(status));
            }
        }
        tracing::debug!(pid = self.pid, exit_code = ?self.exit_code, "Released pipe backend");
    }
}
