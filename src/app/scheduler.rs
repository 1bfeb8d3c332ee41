use std::collections::HashSet;
use std::sync::{Arc, Condvar, Mutex, OnceLock};

/// Serializes runs that target the same emulator port within one process.
pub struct PortLocks {
    busy: Mutex<HashSet<u16>>,
    cv: Condvar,
}

impl PortLocks {
    pub fn new() -> Self {
        Self {
            busy: Mutex::new(HashSet::new()),
            cv: Condvar::new(),
        }
    }

    /// Blocks until no other run holds `port`.
    pub fn acquire(self: &Arc<Self>, port: u16) -> PortPermit {
        let mut busy = self.busy.lock().unwrap_or_else(|p| p.into_inner());
        while busy.contains(&port) {
            busy = self.cv.wait(busy).unwrap_or_else(|p| p.into_inner());
        }
        busy.insert(port);
        PortPermit {
            locks: Arc::clone(self),
            port,
        }
    }

    fn release(&self, port: u16) {
        let mut busy = self.busy.lock().unwrap_or_else(|p| p.into_inner());
        busy.remove(&port);
        self.cv.notify_all();
    }
}

impl Default for PortLocks {
    fn default() -> Self {
        Self::new()
    }
}

pub struct PortPermit {
    locks: Arc<PortLocks>,
    port: u16,
}

impl Drop for PortPermit {
    fn drop(&mut self) {
        self.locks.release(self.port);
    }
}

/// Process-wide registry shared by every pipeline.
pub fn port_locks() -> Arc<PortLocks> {
    static LOCKS: OnceLock<Arc<PortLocks>> = OnceLock::new();
    Arc::clone(LOCKS.get_or_init(|| Arc::new(PortLocks::new())))
}
