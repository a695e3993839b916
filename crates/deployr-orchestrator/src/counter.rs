//! Sequential naming for applications that arrive without a usable name.
//! Explicitly-scoped service rather than a process-wide static, so tests
//! and embedders control the numbering.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use deployr_common::Language;

pub trait NameCounter: Send + Sync {
    /// Next sequence number for the given language, starting at 1.
    fn next(&self, language: Language) -> u64;
}

#[derive(Debug, Default)]
pub struct AtomicNameCounter {
    counters: DashMap<Language, Arc<AtomicU64>>,
}

impl AtomicNameCounter {
    pub fn new() -> Self {
        Default::default()
    }
}

impl NameCounter for AtomicNameCounter {
    fn next(&self, language: Language) -> u64 {
        let counter = self
            .counters
            .entry(language)
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .clone();
        counter.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_per_language_independently() {
        let counter = AtomicNameCounter::new();
        assert_eq!(counter.next(Language::Python), 1);
        assert_eq!(counter.next(Language::Python), 2);
        assert_eq!(counter.next(Language::Java), 1);
    }
}
