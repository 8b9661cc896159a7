//! Admission counter bounding the outstanding items of one queue

use parking_lot::Mutex;

#[derive(Debug)]
struct CounterState {
    max: usize,
    total: usize,
}

/// Bounded counter shared by every tag group of a queue.
///
/// `total` grows only on successful admission and shrinks only on terminal
/// removal, so `0 <= total <= max` holds at all times.
#[derive(Debug)]
pub struct AdmissionCounter {
    state: Mutex<CounterState>,
}

impl AdmissionCounter {
    pub fn new(max: usize) -> Self {
        Self {
            state: Mutex::new(CounterState { max, total: 0 }),
        }
    }

    /// Admit one item if there is room
    pub fn add(&self) -> bool {
        let mut state = self.state.lock();
        if state.total < state.max {
            state.total += 1;
            true
        } else {
            false
        }
    }

    /// Release one admitted item
    pub fn decrement(&self) {
        let mut state = self.state.lock();
        state.total = state.total.saturating_sub(1);
    }

    pub fn total(&self) -> usize {
        self.state.lock().total
    }

    pub fn max(&self) -> usize {
        self.state.lock().max
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_add_until_full() {
        let counter = AdmissionCounter::new(2);
        assert!(counter.add());
        assert!(counter.add());
        assert!(!counter.add());
        assert_eq!(counter.total(), 2);
        assert_eq!(counter.max(), 2);
    }

    #[test]
    fn test_decrement_frees_slot() {
        let counter = AdmissionCounter::new(1);
        assert!(counter.add());
        assert!(!counter.add());
        counter.decrement();
        assert_eq!(counter.total(), 0);
        assert!(counter.add());
    }

    #[test]
    fn test_zero_capacity_refuses() {
        let counter = AdmissionCounter::new(0);
        assert!(!counter.add());
        assert_eq!(counter.total(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_add_never_exceeds_max() {
        let counter = Arc::new(AdmissionCounter::new(50));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let counter = Arc::clone(&counter);
            handles.push(tokio::spawn(async move {
                let mut admitted = 0;
                for _ in 0..20 {
                    if counter.add() {
                        admitted += 1;
                    }
                }
                admitted
            }));
        }

        let mut admitted = 0;
        for handle in handles {
            admitted += handle.await.unwrap();
        }
        assert_eq!(admitted, 50);
        assert_eq!(counter.total(), 50);
    }
}
