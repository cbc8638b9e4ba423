//! Production process backend.
//!
//! `OsSpawner` starts real processes. Every child is placed in its own
//! process group so a terminal interrupt aimed at the controlling program
//! never propagates into ssh sessions or tunnels. Stdout and stderr are wired
//! to one pipe, so callers read a single interleaved stream.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::FromRawFd;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Child, Command, ExitStatus, Stdio};

use tracing::debug;

use super::{Process, SpawnOptions, Spawner};


/// Spawns real OS processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsSpawner;

impl Spawner for OsSpawner {
    fn spawn(&self, argv: &[String], opts: SpawnOptions) -> io::Result<Box<dyn Process>> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty command"))?;
        let (reader, writer) = output_pipe()?;

        // The Command owns our copies of the write end; it must be dropped
        // before anyone reads, or EOF never arrives.
        let child = {
            let mut cmd = Command::new(program);
            cmd.args(args)
                .stdin(if opts.interactive {
                    Stdio::piped()
                } else {
                    Stdio::null()
                })
                .stdout(Stdio::from(writer.try_clone()?))
                .stderr(Stdio::from(writer))
                .process_group(0);
            cmd.spawn()?
        };
        debug!(pid = child.id(), command = %argv.join(" "), "spawned");
        Ok(Box::new(OsProcess {
            child,
            output: Some(reader),
            exit: None,
        }))
    }
}


struct OsProcess {
    child: Child,
    output: Option<File>,
    exit: Option<i32>,
}

impl OsProcess {
    fn record(&mut self, status: ExitStatus) -> i32 {
        let code = exit_code(status);
        self.exit = Some(code);
        code
    }
}

impl Process for OsProcess {
    fn pid(&self) -> u32 {
        self.child.id()
    }

    fn take_stdin(&mut self) -> Option<Box<dyn Write + Send>> {
        self.child
            .stdin
            .take()
            .map(|s| Box::new(s) as Box<dyn Write + Send>)
    }

    fn take_output(&mut self) -> Option<Box<dyn Read + Send>> {
        self.output
            .take()
            .map(|f| Box::new(f) as Box<dyn Read + Send>)
    }

    fn try_wait(&mut self) -> io::Result<Option<i32>> {
        if let Some(code) = self.exit {
            return Ok(Some(code));
        }
        match self.child.try_wait()? {
            Some(status) => Ok(Some(self.record(status))),
            None => Ok(None),
        }
    }

    fn wait(&mut self) -> io::Result<i32> {
        if let Some(code) = self.exit {
            return Ok(code);
        }
        let status = self.child.wait()?;
        Ok(self.record(status))
    }

    fn terminate(&mut self) -> io::Result<()> {
        if self.try_wait()?.is_some() {
            return Ok(());
        }
        let pid = self.child.id() as libc::pid_t;
        let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            // Raced with a natural exit.
            if err.raw_os_error() != Some(libc::ESRCH) {
                return Err(err);
            }
        }
        Ok(())
    }
}


/// Signal deaths map to the negated signal number.
fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| -status.signal().unwrap_or(0))
}


/// A close-on-exec pipe; returns (read end, write end).
fn output_pipe() -> io::Result<(File, File)> {
    let mut fds = [0 as libc::c_int; 2];
    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: pipe2 just returned two fresh descriptors that nothing else owns.
    let ends = unsafe { (File::from_raw_fd(fds[0]), File::from_raw_fd(fds[1])) };
    Ok(ends)
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
