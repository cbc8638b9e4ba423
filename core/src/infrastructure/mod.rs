//! Process-spawning backends.
//!
//! `Spawner` is the seam every component goes through to start an OS process.
//! `OsSpawner` (in `runner`) is the production implementation; `MockSpawner`
//! (in `mock`) records argument vectors and serves scripted processes so the
//! higher layers can be tested without ssh, sudo or a kernel.

pub mod mock;
pub mod runner;

use std::io::{self, Read, Write};


/// How a process should be wired up when spawned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpawnOptions {
    /// Keep a writable stdin pipe open (persistent shells). Otherwise stdin
    /// is attached to `/dev/null`.
    pub interactive: bool,
}

impl SpawnOptions {
    pub fn interactive() -> Self {
        SpawnOptions { interactive: true }
    }
}


/// A spawned child process. Stdout and stderr share a single output stream.
pub trait Process: Send {
    fn pid(&self) -> u32;

    /// Hand over the stdin pipe. Only interactive processes have one, and it
    /// can be taken once.
    fn take_stdin(&mut self) -> Option<Box<dyn Write + Send>>;

    /// Hand over the combined stdout/stderr stream. Can be taken once.
    fn take_output(&mut self) -> Option<Box<dyn Read + Send>>;

    /// Non-blocking exit check. Signal deaths report the negated signal number.
    fn try_wait(&mut self) -> io::Result<Option<i32>>;

    /// Block until the process exits.
    fn wait(&mut self) -> io::Result<i32>;

    /// Ask the process to exit (SIGTERM). No-op once it has exited.
    fn terminate(&mut self) -> io::Result<()>;
}


/// Starts processes from argument vectors.
pub trait Spawner: Send + Sync {
    fn spawn(&self, argv: &[String], opts: SpawnOptions) -> io::Result<Box<dyn Process>>;
}
