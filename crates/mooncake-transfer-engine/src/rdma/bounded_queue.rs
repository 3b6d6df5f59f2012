//! A bounded, lock-free MPMC queue used for the per-context pending-slice
//! backlog (§4.5.4). A thin `crossbeam_queue::ArrayQueue` wrapper that
//! reports fullness instead of blocking the submitter.

use crossbeam_queue::ArrayQueue;

pub enum PushResult<T> {
    Pushed,
    Full(T),
}

pub struct BoundedQueue<T> {
    inner: ArrayQueue<T>,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: ArrayQueue::new(capacity.max(1)),
        }
    }

    pub fn try_push(&self, value: T) -> PushResult<T> {
        match self.inner.push(value) {
            Ok(()) => PushResult::Pushed,
            Err(value) => PushResult::Full(value),
        }
    }

    pub fn try_pop(&self) -> Option<T> {
        self.inner.pop()
    }

    pub fn pop_batch(&self, max: usize) -> Vec<T> {
        let mut out = Vec::with_capacity(max.min(self.inner.len()));
        while out.len() < max {
            match self.inner.pop() {
                Some(v) => out.push(v),
                None => break,
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.inner.is_full()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_past_capacity_reports_full() {
        let q = BoundedQueue::new(2);
        assert!(matches!(q.try_push(1), PushResult::Pushed));
        assert!(matches!(q.try_push(2), PushResult::Pushed));
        assert!(matches!(q.try_push(3), PushResult::Full(3)));
    }

    #[test]
    fn pop_batch_drains_up_to_max() {
        let q = BoundedQueue::new(8);
        for i in 0..5 {
            q.try_push(i);
        }
        let batch = q.pop_batch(3);
        assert_eq!(batch, vec![0, 1, 2]);
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn empty_and_full_report_correctly() {
        let q: BoundedQueue<u8> = BoundedQueue::new(1);
        assert!(q.is_empty());
        q.try_push(1);
        assert!(q.is_full());
    }
}
