use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

/// A boolean that can be shared between tasks without a lock at the call site.
#[derive(Debug, Default)]
pub struct AtomicFlag(AtomicBool);

impl AtomicFlag {
    pub fn new(value: bool) -> Self {
        Self(AtomicBool::new(value))
    }

    pub fn get(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn set(&self, value: bool) {
        self.0.store(value, Ordering::SeqCst);
    }
}

/// A 32-bit counter that can be shared between tasks without a lock at the call site.
#[derive(Debug, Default)]
pub struct AtomicCounter(AtomicI32);

impl AtomicCounter {
    pub fn new(value: i32) -> Self {
        Self(AtomicI32::new(value))
    }

    pub fn get(&self) -> i32 {
        self.0.load(Ordering::SeqCst)
    }

    pub fn set(&self, value: i32) {
        self.0.store(value, Ordering::SeqCst);
    }

    /// Adds one and returns the new value.
    pub fn increment(&self) -> i32 {
        self.0.fetch_add(1, Ordering::SeqCst).wrapping_add(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_flag_set() {
        let flag = AtomicFlag::new(false);
        assert!(!flag.get());
        flag.set(true);
        assert!(flag.get());
        flag.set(false);
        assert!(!flag.get());
    }

    #[test]
    fn test_counter_increment_and_set() {
        let counter = AtomicCounter::default();
        assert_eq!(counter.increment(), 1);
        assert_eq!(counter.increment(), 2);
        counter.set(10);
        assert_eq!(counter.increment(), 11);
    }

    #[test]
    fn test_counter_concurrent_increments() {
        let counter = Arc::new(AtomicCounter::default());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let counter = counter.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        counter.increment();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(counter.get(), 8000);
    }
}
