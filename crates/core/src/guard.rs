//! Non-reentrancy flag for mutating entry points.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Busy flag set for the duration of a mutating call.
#[derive(Debug, Default)]
pub struct NonReentrant {
    busy: Arc<AtomicBool>,
}

impl NonReentrant {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark busy. `None` if a call is already in progress.
    pub fn enter(&self) -> Option<GuardToken> {
        if self.busy.swap(true, Ordering::SeqCst) {
            return None;
        }
        Some(GuardToken {
            busy: Arc::clone(&self.busy),
        })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }
}

/// Clears the busy flag on drop, including on early returns.
#[derive(Debug)]
pub struct GuardToken {
    busy: Arc<AtomicBool>,
}

impl Drop for GuardToken {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_entry_is_refused() {
        let guard = NonReentrant::new();
        let token = guard.enter().unwrap();
        assert!(guard.is_busy());
        assert!(guard.enter().is_none());
        drop(token);
        assert!(!guard.is_busy());
        assert!(guard.enter().is_some());
    }
}
