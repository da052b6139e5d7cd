/*!
Reusable line buffers for engine output.

restic can print several hundred JSON status lines per second during a large
backup. Output lines are read into buffers taken from a shared pool and handed
back as soon as the event parser has consumed them, so steady-state reading
does not allocate per line.
*/

use std::sync::{Arc, Mutex};

/// Default number of idle buffers kept around
pub const DEFAULT_MAX_IDLE: usize = 64;

const INITIAL_CAPACITY: usize = 512;

/// A bounded free-list of byte buffers
#[derive(Debug)]
pub struct BufferPool {
    idle: Mutex<Vec<Vec<u8>>>,
    max_idle: usize,
}

impl BufferPool {
    pub fn new(max_idle: usize) -> Self {
        Self {
            idle: Mutex::new(Vec::with_capacity(max_idle)),
            max_idle,
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Take an empty buffer, allocating only when the pool is drained
    pub fn acquire(&self) -> Vec<u8> {
        let mut idle = self.idle.lock().unwrap_or_else(|e| e.into_inner());
        idle.pop()
            .unwrap_or_else(|| Vec::with_capacity(INITIAL_CAPACITY))
    }

    /// Return a buffer. The caller must not keep any alias to its contents.
    pub fn release(&self, mut buffer: Vec<u8>) {
        buffer.clear();
        let mut idle = self.idle.lock().unwrap_or_else(|e| e.into_inner());
        if idle.len() < self.max_idle {
            idle.push(buffer);
        }
    }

    /// Number of buffers currently waiting for reuse
    pub fn idle(&self) -> usize {
        self.idle.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_IDLE)
    }
}
