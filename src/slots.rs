use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;

/// Process-wide budget of worker slots shared by concurrently running steps.
pub trait SlotManager: Send + Sync {
    /// Reserve up to `n` slots without exceeding `max` in use; returns the number granted.
    fn acquire(&self, n: usize, max: usize) -> usize;

    fn release(&self, n: usize);

    fn available(&self, max: usize) -> usize;
}

/// Counter of slots in use, guarded by a mutex.
#[derive(Debug, Default)]
pub struct LocalSlots {
    in_use: Mutex<usize>,
}

impl LocalSlots {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_use(&self) -> usize {
        self.in_use.lock().map(|g| *g).unwrap_or(0)
    }
}

impl SlotManager for LocalSlots {
    fn acquire(&self, n: usize, max: usize) -> usize {
        let Ok(mut used) = self.in_use.lock() else {
            return 0;
        };
        let granted = n.min(max.saturating_sub(*used));
        *used += granted;
        granted
    }

    fn release(&self, n: usize) {
        if let Ok(mut used) = self.in_use.lock() {
            *used = used.saturating_sub(n);
        }
    }

    fn available(&self, max: usize) -> usize {
        self.in_use
            .lock()
            .map(|used| max.saturating_sub(*used))
            .unwrap_or(0)
    }
}

static GLOBAL_SLOTS: Lazy<Arc<LocalSlots>> = Lazy::new(|| Arc::new(LocalSlots::new()));

/// Slot manager shared by every step of this process.
pub fn global_slots() -> Arc<dyn SlotManager> {
    GLOBAL_SLOTS.clone()
}
