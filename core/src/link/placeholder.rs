//! Per-server reservation of the placeholder device name.
//!
//! A tunnel build creates `tap<N>` in the root namespace of both servers and
//! keeps that name until the device is renamed inside its node. Two builds
//! touching the same server at once would collide on the name, so a build
//! reserves both servers up front, all or nothing, and releases them when its
//! guard drops.

use std::collections::HashSet;
use std::sync::{Condvar, Mutex, MutexGuard};

use tracing::debug;


#[derive(Debug, Default)]
pub struct PlaceholderLocks {
    held: Mutex<HashSet<String>>,
    released: Condvar,
}

impl PlaceholderLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until none of `servers` is reserved, then reserve all of them.
    pub fn acquire(&self, servers: &[&str]) -> PlaceholderGuard<'_> {
        let mut wanted: Vec<String> = servers.iter().map(|s| s.to_string()).collect();
        wanted.sort();
        wanted.dedup();
        let mut held = self.lock();
        while wanted.iter().any(|s| held.contains(s)) {
            held = self
                .released
                .wait(held)
                .unwrap_or_else(|e| e.into_inner());
        }
        for server in &wanted {
            held.insert(server.clone());
        }
        debug!(servers = ?wanted, "placeholder reserved");
        PlaceholderGuard {
            locks: self,
            servers: wanted,
        }
    }

    pub fn is_held(&self, server: &str) -> bool {
        self.lock().contains(server)
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        self.held.lock().unwrap_or_else(|e| e.into_inner())
    }
}


/// Releases its servers on drop.
#[derive(Debug)]
pub struct PlaceholderGuard<'a> {
    locks: &'a PlaceholderLocks,
    servers: Vec<String>,
}

impl Drop for PlaceholderGuard<'_> {
    fn drop(&mut self) {
        let mut held = self.locks.lock();
        for server in &self.servers {
            held.remove(server);
        }
        self.locks.released.notify_all();
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn guard_releases_on_drop() {
        let locks = PlaceholderLocks::new();
        {
            let _g = locks.acquire(&["a", "b"]);
            assert!(locks.is_held("a"));
            assert!(locks.is_held("b"));
        }
        assert!(!locks.is_held("a"));
        assert!(!locks.is_held("b"));
    }

    #[test]
    fn duplicate_servers_are_reserved_once() {
        let locks = PlaceholderLocks::new();
        let g = locks.acquire(&["a", "a"]);
        assert_eq!(g.servers, vec!["a"]);
    }

    #[test]
    fn disjoint_servers_do_not_block() {
        let locks = PlaceholderLocks::new();
        let _g1 = locks.acquire(&["a", "b"]);
        let _g2 = locks.acquire(&["c", "d"]);
        assert!(locks.is_held("d"));
    }

    #[test]
    fn shared_server_serializes() {
        let locks = Arc::new(PlaceholderLocks::new());
        let entered = Arc::new(AtomicBool::new(false));
        let g = locks.acquire(&["a", "b"]);

        let handle = {
            let locks = locks.clone();
            let entered = entered.clone();
            thread::spawn(move || {
                let _g = locks.acquire(&["b", "c"]);
                entered.store(true, Ordering::SeqCst);
            })
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!entered.load(Ordering::SeqCst));
        // All or nothing: "c" was not taken while waiting.
        assert!(!locks.is_held("c"));
        drop(g);
        handle.join().unwrap();
        assert!(entered.load(Ordering::SeqCst));
        assert!(!locks.is_held("b"));
    }
}
