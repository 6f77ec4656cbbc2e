use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic token identifying the latest request for a piece of view state.
///
/// Work tagged with an older value must not write into the view: the user
/// has moved on (switched conversation, or a newer reload superseded it).
#[derive(Debug, Clone, Default)]
pub struct Generation(Arc<AtomicU64>);

impl Generation {
    /// Start a new generation and return its value.
    pub fn advance(&self) -> u64 {
        self.0.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.0.load(Ordering::Acquire) == generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_latest_is_current() {
        let generation = Generation::default();
        let first = generation.advance();
        assert!(generation.is_current(first));

        let shared = generation.clone();
        let second = shared.advance();
        assert!(!generation.is_current(first));
        assert!(generation.is_current(second));
    }
}
