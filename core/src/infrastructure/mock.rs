//! Mock process backend for testing.
//!
//! `MockSpawner` records every argument vector it is asked to spawn and hands
//! back scripted processes. One-shot processes print canned output and exit;
//! running processes print canned output and then stay alive until
//! terminated; interactive processes behave like a minimal shell that answers
//! each line it is sent, so persistent shell sessions can be driven end to end.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};

use super::{Process, SpawnOptions, Spawner};


/// What a scripted one-shot process does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockBehavior {
    /// Print `output`, then exit with `code`.
    Exit { output: String, code: i32 },
    /// Print `output`, then stay alive (output blocks) until terminated.
    Running { output: String },
}

impl MockBehavior {
    pub fn exit(output: &str, code: i32) -> Self {
        MockBehavior::Exit {
            output: output.to_string(),
            code,
        }
    }

    pub fn running(output: &str) -> Self {
        MockBehavior::Running {
            output: output.to_string(),
        }
    }

    /// A process that never prints anything and never exits on its own.
    pub fn hang() -> Self {
        MockBehavior::running("")
    }
}


#[derive(Default)]
struct MockState {
    spawned: Vec<Vec<String>>,
    rules: Vec<(String, MockBehavior)>,
    shell_rules: Vec<(String, String)>,
    shell_lines: Vec<(u32, String)>,
    next_pid: u32,
}


/// A test-double spawner. Cheap to clone; clones share recorded state.
#[derive(Clone)]
pub struct MockSpawner {
    state: Arc<Mutex<MockState>>,
}

impl MockSpawner {
    pub fn new() -> Self {
        MockSpawner {
            state: Arc::new(Mutex::new(MockState {
                next_pid: 1000,
                ..MockState::default()
            })),
        }
    }

    /// Script every one-shot or background spawn whose joined argv contains
    /// `pattern`. The first matching rule wins; unmatched spawns print nothing
    /// and exit 0.
    pub fn on(&self, pattern: &str, behavior: MockBehavior) {
        self.lock().rules.push((pattern.to_string(), behavior));
    }

    /// Script the answer an interactive shell gives to a line containing
    /// `pattern`.
    pub fn on_shell(&self, pattern: &str, output: &str) {
        self.lock()
            .shell_rules
            .push((pattern.to_string(), output.to_string()));
    }

    /// Every spawned argv, joined with spaces, in spawn order.
    pub fn spawned(&self) -> Vec<String> {
        self.lock().spawned.iter().map(|a| a.join(" ")).collect()
    }

    /// Every spawned argv, unjoined.
    pub fn spawned_argv(&self) -> Vec<Vec<String>> {
        self.lock().spawned.clone()
    }

    /// Number of spawns whose joined argv contains `pattern`.
    pub fn spawned_matching(&self, pattern: &str) -> usize {
        self.spawned().iter().filter(|c| c.contains(pattern)).count()
    }

    /// Every line written to an interactive shell, in order.
    pub fn shell_lines(&self) -> Vec<String> {
        self.lock()
            .shell_lines
            .iter()
            .map(|(_, l)| l.clone())
            .collect()
    }

    /// Lines written to the shell whose process id is `pid`.
    pub fn shell_lines_for(&self, pid: u32) -> Vec<String> {
        self.lock()
            .shell_lines
            .iter()
            .filter(|(p, _)| *p == pid)
            .map(|(_, l)| l.clone())
            .collect()
    }

    /// Number of shell lines containing `pattern`.
    pub fn shell_lines_matching(&self, pattern: &str) -> usize {
        self.shell_lines()
            .iter()
            .filter(|l| l.contains(pattern))
            .count()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for MockSpawner {
    fn default() -> Self {
        Self::new()
    }
}

impl Spawner for MockSpawner {
    fn spawn(&self, argv: &[String], opts: SpawnOptions) -> io::Result<Box<dyn Process>> {
        if argv.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty command"));
        }
        let (pid, behavior) = {
            let mut state = self.lock();
            state.spawned.push(argv.to_vec());
            let pid = state.next_pid;
            state.next_pid += 1;
            let joined = argv.join(" ");
            let behavior = state
                .rules
                .iter()
                .find(|(pattern, _)| joined.contains(pattern.as_str()))
                .map(|(_, b)| b.clone());
            (pid, behavior)
        };

        if opts.interactive {
            return Ok(Box::new(MockProcess::shell(pid, self.state.clone())));
        }
        let process = match behavior.unwrap_or_else(|| MockBehavior::exit("", 0)) {
            MockBehavior::Exit { output, code } => MockProcess::exited(pid, &output, code),
            MockBehavior::Running { output } => MockProcess::running(pid, &output),
        };
        Ok(Box::new(process))
    }
}


// ---------------------------------------------------------------------------
// MockProcess
// ---------------------------------------------------------------------------

struct MockProcess {
    pid: u32,
    stdin: Option<Box<dyn Write + Send>>,
    output: Option<Box<dyn Read + Send>>,
    /// Dropping this sender is what unblocks a reader waiting for more output.
    keepalive: Option<Sender<Vec<u8>>>,
    exit: Option<i32>,
}

impl MockProcess {
    fn exited(pid: u32, output: &str, code: i32) -> Self {
        let (tx, rx) = mpsc::channel();
        let _ = tx.send(output.as_bytes().to_vec());
        MockProcess {
            pid,
            stdin: None,
            output: Some(Box::new(MockStream::new(rx))),
            keepalive: None,
            exit: Some(code),
        }
    }

    fn running(pid: u32, output: &str) -> Self {
        let (tx, rx) = mpsc::channel();
        let _ = tx.send(output.as_bytes().to_vec());
        MockProcess {
            pid,
            stdin: None,
            output: Some(Box::new(MockStream::new(rx))),
            keepalive: Some(tx),
            exit: None,
        }
    }

    fn shell(pid: u32, state: Arc<Mutex<MockState>>) -> Self {
        let (tx, rx) = mpsc::channel();
        let input = MockShellInput {
            pid,
            state,
            replies: tx.clone(),
            pending: Vec::new(),
        };
        MockProcess {
            pid,
            stdin: Some(Box::new(input)),
            output: Some(Box::new(MockStream::new(rx))),
            keepalive: Some(tx),
            exit: None,
        }
    }
}

impl Process for MockProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn take_stdin(&mut self) -> Option<Box<dyn Write + Send>> {
        self.stdin.take()
    }

    fn take_output(&mut self) -> Option<Box<dyn Read + Send>> {
        self.output.take()
    }

    fn try_wait(&mut self) -> io::Result<Option<i32>> {
        Ok(self.exit)
    }

    fn wait(&mut self) -> io::Result<i32> {
        let code = *self.exit.get_or_insert(0);
        self.keepalive = None;
        Ok(code)
    }

    fn terminate(&mut self) -> io::Result<()> {
        if self.exit.is_none() {
            self.exit = Some(-libc::SIGTERM);
        }
        self.stdin = None;
        self.keepalive = None;
        Ok(())
    }
}


/// Output side of a mock process: drains queued chunks, then blocks until
/// every sender is gone, at which point it reports EOF.
struct MockStream {
    rx: Receiver<Vec<u8>>,
    pending: VecDeque<u8>,
}

impl MockStream {
    fn new(rx: Receiver<Vec<u8>>) -> Self {
        MockStream {
            rx,
            pending: VecDeque::new(),
        }
    }
}

impl Read for MockStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pending.is_empty() {
            match self.rx.recv() {
                Ok(chunk) => self.pending.extend(chunk),
                Err(_) => return Ok(0),
            }
        }
        let n = buf.len().min(self.pending.len());
        for (slot, byte) in buf.iter_mut().zip(self.pending.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}


/// Stdin side of a mock shell: every complete line is recorded and answered.
struct MockShellInput {
    pid: u32,
    state: Arc<Mutex<MockState>>,
    replies: Sender<Vec<u8>>,
    pending: Vec<u8>,
}

impl MockShellInput {
    fn answer(&self, line: &str) -> String {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.shell_lines.push((self.pid, line.to_string()));
        let mut reply = if line.contains("echo $$") {
            format!("{}\n", self.pid)
        } else {
            state
                .shell_rules
                .iter()
                .find(|(pattern, _)| line.contains(pattern.as_str()))
                .map(|(_, out)| out.clone())
                .unwrap_or_default()
        };
        if line.contains("printf '\\177'") {
            reply.push('\u{7f}');
        }
        reply
    }
}

impl Write for MockShellInput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.pending.extend_from_slice(buf);
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line[..line.len() - 1]).into_owned();
            let reply = self.answer(&line);
            if !reply.is_empty() {
                self.replies
                    .send(reply.into_bytes())
                    .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "shell closed"))?;
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(cmd: &str) -> Vec<String> {
        cmd.split_whitespace().map(String::from).collect()
    }

    fn read_all(p: &mut Box<dyn Process>) -> String {
        let mut out = String::new();
        p.take_output().unwrap().read_to_string(&mut out).unwrap();
        out
    }

    #[test]
    fn records_spawned_commands() {
        let mock = MockSpawner::new();
        mock.spawn(&argv("echo hello"), SpawnOptions::default()).unwrap();
        mock.spawn(&argv("echo world"), SpawnOptions::default()).unwrap();
        assert_eq!(mock.spawned(), vec!["echo hello", "echo world"]);
        assert_eq!(mock.spawned_matching("echo"), 2);
    }

    #[test]
    fn unmatched_spawn_exits_cleanly() {
        let mock = MockSpawner::new();
        let mut p = mock.spawn(&argv("true"), SpawnOptions::default()).unwrap();
        assert_eq!(read_all(&mut p), "");
        assert_eq!(p.wait().unwrap(), 0);
    }

    #[test]
    fn first_matching_rule_wins() {
        let mock = MockSpawner::new();
        mock.on("ip link", MockBehavior::exit("first", 1));
        mock.on("ip", MockBehavior::exit("second", 2));
        let mut p = mock
            .spawn(&argv("ip link show"), SpawnOptions::default())
            .unwrap();
        assert_eq!(read_all(&mut p), "first");
        assert_eq!(p.wait().unwrap(), 1);
    }

    #[test]
    fn running_process_blocks_until_terminated() {
        let mock = MockSpawner::new();
        mock.on("ssh", MockBehavior::running("@"));
        let mut p = mock.spawn(&argv("ssh -n host"), SpawnOptions::default()).unwrap();
        let mut out = p.take_output().unwrap();
        let mut first = [0u8; 1];
        out.read_exact(&mut first).unwrap();
        assert_eq!(&first, b"@");
        assert_eq!(p.try_wait().unwrap(), None);

        p.terminate().unwrap();
        let mut rest = Vec::new();
        out.read_to_end(&mut rest).unwrap();
        assert!(rest.is_empty());
        assert_eq!(p.try_wait().unwrap(), Some(-libc::SIGTERM));
    }

    #[test]
    fn shell_answers_handshake_with_pid() {
        let mock = MockSpawner::new();
        let mut p = mock.spawn(&argv("bash -s"), SpawnOptions::interactive()).unwrap();
        let pid = p.pid();
        let mut stdin = p.take_stdin().unwrap();
        let mut out = p.take_output().unwrap();
        stdin.write_all(b"echo $$; printf '\\177'\n").unwrap();

        let mut buf = Vec::new();
        let mut byte = [0u8; 1];
        while byte[0] != 0x7f {
            out.read_exact(&mut byte).unwrap();
            buf.push(byte[0]);
        }
        assert_eq!(buf, format!("{}\n\u{7f}", pid).into_bytes());
        assert_eq!(mock.shell_lines_for(pid).len(), 1);
    }

    #[test]
    fn shell_rules_answer_lines() {
        let mock = MockSpawner::new();
        mock.on_shell("ip link show", "2: h1-eth0: <UP>\n");
        let mut p = mock.spawn(&argv("bash -s"), SpawnOptions::interactive()).unwrap();
        let mut stdin = p.take_stdin().unwrap();
        let mut out = p.take_output().unwrap();
        stdin.write_all(b"ip link show; printf '\\177'\n").unwrap();
        drop(stdin);
        p.terminate().unwrap();

        let mut text = String::new();
        out.read_to_string(&mut text).unwrap();
        assert_eq!(text, "2: h1-eth0: <UP>\n\u{7f}");
        assert_eq!(mock.shell_lines_matching("ip link show"), 1);
    }
}
