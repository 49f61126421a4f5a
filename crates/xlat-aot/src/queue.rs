use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

pub const DEFAULT_FLUSH_THRESHOLD: usize = 10_000;

/// Pending cache writes.
///
/// Producers only take the lock long enough to push. Once the queue grows past the threshold,
/// exactly one producer wins the `flushing` flag and drains the queue on its own thread; the
/// others keep compiling.
#[derive(Debug)]
pub struct WriteQueue<T> {
    pending: Mutex<VecDeque<T>>,
    flushing: AtomicBool,
    threshold: usize,
}

impl<T> WriteQueue<T> {
    pub fn new(threshold: usize) -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
            flushing: AtomicBool::new(false),
            threshold,
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Queues `item`. Returns `true` when the caller has been elected to flush and must call
    /// [`WriteQueue::flush`].
    pub fn push(&self, item: T) -> bool {
        let over = {
            let mut pending = self.lock();
            pending.push_back(item);
            pending.len() > self.threshold
        };
        over && self
            .flushing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Drains the queue into `sink` until it is observed empty, including items pushed while
    /// draining. Returns the number of items handed to `sink`.
    pub fn flush(&self, mut sink: impl FnMut(T)) -> usize {
        let mut drained = 0;
        loop {
            let batch = {
                let mut pending = self.lock();
                if pending.is_empty() {
                    self.flushing.store(false, Ordering::Release);
                    return drained;
                }
                std::mem::take(&mut *pending)
            };
            drained += batch.len();
            batch.into_iter().for_each(&mut sink);
        }
    }

    pub fn is_flushing(&self) -> bool {
        self.flushing.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn only_one_producer_is_elected_past_threshold() {
        let queue = WriteQueue::new(2);
        assert!(!queue.push(1));
        assert!(!queue.push(2));
        assert!(queue.push(3));
        assert!(!queue.push(4), "a flush is already running");

        let mut seen = Vec::new();
        assert_eq!(queue.flush(|v| seen.push(v)), 4);
        assert_eq!(seen, vec![1, 2, 3, 4]);
        assert!(!queue.is_flushing());
        assert!(queue.is_empty());
    }

    #[test]
    fn concurrent_pushes_are_all_drained() {
        let queue = Arc::new(WriteQueue::new(16));
        let total = Arc::new(Mutex::new(Vec::new()));

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let queue = Arc::clone(&queue);
                let total = Arc::clone(&total);
                std::thread::spawn(move || {
                    for i in 0..100 {
                        if queue.push(t * 1000 + i) {
                            queue.flush(|v| total.lock().unwrap().push(v));
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        queue.flush(|v| total.lock().unwrap().push(v));

        let mut all = total.lock().unwrap().clone();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 400);
    }
}
