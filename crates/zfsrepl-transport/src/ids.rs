//! Diagnostic identifiers for shells and executions

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counter handing out diagnostic ids
///
/// Shells take their `shell-N` id from a generator and executions
/// take `exec-M` ids from the generator owned by their shell, so ids
/// in log output are stable within one shell.
#[derive(Debug)]
pub struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    /// Create a generator starting at 1
    #[must_use]
    pub const fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Take the next id
    pub fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

static SHELL_IDS: IdGenerator = IdGenerator::new();

/// Process-wide generator used when no explicit one is injected
pub fn shell_ids() -> &'static IdGenerator {
    &SHELL_IDS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_sequential() {
        let ids = IdGenerator::new();
        assert_eq!(ids.next_id(), 1);
        assert_eq!(ids.next_id(), 2);
        assert_eq!(ids.next_id(), 3);
    }
}
