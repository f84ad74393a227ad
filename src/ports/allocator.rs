//! Offset table with a single allocator-wide lock.
//!
//! Allocation must consider every worktree at once, so one lock guards the
//! whole table. Offset 0 is reserved for the un-offset primary checkout and
//! never handed out. Released offsets become reusable immediately.

use std::collections::BTreeMap;
use std::sync::Mutex;

use tracing::debug;

use crate::error::{Error, Result};

pub struct PortAllocator {
    /// offset → holding worktree id. BTreeMap keeps scans in offset order.
    held: Mutex<BTreeMap<u16, String>>,
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl PortAllocator {
    pub fn new() -> Self {
        Self {
            held: Mutex::new(BTreeMap::new()),
        }
    }

    /// Hand out the smallest positive multiple of `step` not currently held.
    pub fn allocate(&self, worktree_id: &str, step: u16) -> Result<u16> {
        if step == 0 {
            // Callers check virtualization_enabled() first; reaching here
            // with step 0 is a config the allocator cannot serve.
            return Err(Error::NoOffsetAvailable { step });
        }
        let mut held = self.held.lock().expect("allocator lock poisoned");
        let mut candidate = step as u32;
        while candidate <= u16::MAX as u32 {
            let offset = candidate as u16;
            if !held.contains_key(&offset) {
                held.insert(offset, worktree_id.to_string());
                debug!(worktree = worktree_id, offset, "offset allocated");
                return Ok(offset);
            }
            candidate += step as u32;
        }
        Err(Error::NoOffsetAvailable { step })
    }

    /// Idempotent: releasing an offset not currently held is a no-op.
    pub fn release(&self, offset: u16) {
        let mut held = self.held.lock().expect("allocator lock poisoned");
        if held.remove(&offset).is_some() {
            debug!(offset, "offset released");
        }
    }

    /// Snapshot of held offsets, in ascending order.
    pub fn held_offsets(&self) -> Vec<(u16, String)> {
        self.held
            .lock()
            .expect("allocator lock poisoned")
            .iter()
            .map(|(o, id)| (*o, id.clone()))
            .collect()
    }

    pub fn is_held(&self, offset: u16) -> bool {
        self.held
            .lock()
            .expect("allocator lock poisoned")
            .contains_key(&offset)
    }
}
