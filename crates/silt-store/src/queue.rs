//! Bounded FIFO queue feeding the persistence workers.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use silt_delta::DeltaRecord;

/// A record waiting for a worker, stamped with its enqueue time.
#[derive(Debug)]
pub(crate) struct PersistJob {
    pub record: Arc<DeltaRecord>,
    pub queued_at: Instant,
}

impl PersistJob {
    pub fn new(record: Arc<DeltaRecord>) -> Self {
        Self {
            record,
            queued_at: Instant::now(),
        }
    }
}

/// Outcome of a worker's dequeue attempt.
#[derive(Debug)]
pub(crate) enum Dequeue {
    /// A job to run.
    Job(PersistJob),
    /// Nothing arrived within the idle timeout.
    Idle,
    /// The queue has been closed; the worker should exit.
    Closed,
}

#[derive(Debug, Default)]
struct QueueInner {
    jobs: VecDeque<PersistJob>,
    closed: bool,
}

/// Bounded FIFO persist queue.
///
/// Producers never block: a push against a full queue fails fast so the
/// engine's rejection path can roll the record's state back. Consumers
/// block with a timeout, which doubles as the worker idle clock.
#[derive(Debug)]
pub(crate) struct PersistQueue {
    inner: Mutex<QueueInner>,
    not_empty: Condvar,
    capacity: AtomicUsize,
}

impl PersistQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            not_empty: Condvar::new(),
            capacity: AtomicUsize::new(capacity),
        }
    }

    /// Append a job unless the queue is full or closed.
    ///
    /// Returns the queue depth after the push, or the rejected job.
    pub fn try_push(&self, job: PersistJob) -> Result<usize, PersistJob> {
        let mut inner = self.inner.lock();
        if inner.closed || inner.jobs.len() >= self.capacity.load(Ordering::Relaxed) {
            return Err(job);
        }
        inner.jobs.push_back(job);
        let depth = inner.jobs.len();
        drop(inner);
        self.not_empty.notify_one();
        Ok(depth)
    }

    /// Wait up to `idle_timeout` for a job.
    pub fn pop(&self, idle_timeout: Duration) -> Dequeue {
        let mut inner = self.inner.lock();
        loop {
            if let Some(job) = inner.jobs.pop_front() {
                return Dequeue::Job(job);
            }
            if inner.closed {
                return Dequeue::Closed;
            }
            if self.not_empty.wait_for(&mut inner, idle_timeout).timed_out() {
                return match inner.jobs.pop_front() {
                    Some(job) => Dequeue::Job(job),
                    None if inner.closed => Dequeue::Closed,
                    None => Dequeue::Idle,
                };
            }
        }
    }

    /// Current queue depth.
    pub fn len(&self) -> usize {
        self.inner.lock().jobs.len()
    }

    /// Adjust the bound. Applies to subsequent pushes only.
    pub fn set_capacity(&self, capacity: usize) {
        self.capacity.store(capacity, Ordering::Relaxed);
    }

    /// Configured bound.
    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Relaxed)
    }

    /// Close the queue, waking all consumers.
    ///
    /// Queued-but-unstarted jobs are returned to the caller so it can roll
    /// their records back; they will not be persisted.
    pub fn close(&self) -> Vec<PersistJob> {
        let mut inner = self.inner.lock();
        inner.closed = true;
        let dropped = inner.jobs.drain(..).collect();
        drop(inner);
        self.not_empty.notify_all();
        dropped
    }

    /// Reopen a closed queue. Used when the engine is restarted.
    pub fn reopen(&self) {
        self.inner.lock().closed = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(id: &str) -> PersistJob {
        PersistJob::new(Arc::new(DeltaRecord::new(id)))
    }

    #[test]
    fn test_push_then_pop_is_fifo() {
        let queue = PersistQueue::new(10);
        queue.try_push(job("a")).unwrap();
        queue.try_push(job("b")).unwrap();

        match queue.pop(Duration::from_millis(10)) {
            Dequeue::Job(j) => assert_eq!(j.record.id(), "a"),
            other => panic!("expected job, got {other:?}"),
        }
        match queue.pop(Duration::from_millis(10)) {
            Dequeue::Job(j) => assert_eq!(j.record.id(), "b"),
            other => panic!("expected job, got {other:?}"),
        }
    }

    #[test]
    fn test_full_queue_rejects() {
        let queue = PersistQueue::new(1);
        assert_eq!(queue.try_push(job("a")).unwrap(), 1);
        let rejected = queue.try_push(job("b")).unwrap_err();
        assert_eq!(rejected.record.id(), "b");
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_pop_times_out_idle() {
        let queue = PersistQueue::new(1);
        assert!(matches!(
            queue.pop(Duration::from_millis(10)),
            Dequeue::Idle
        ));
    }

    #[test]
    fn test_close_drops_pending_and_wakes() {
        let queue = PersistQueue::new(10);
        queue.try_push(job("a")).unwrap();
        queue.try_push(job("b")).unwrap();

        let dropped = queue.close();
        assert_eq!(dropped.len(), 2);
        assert!(matches!(queue.pop(Duration::from_millis(10)), Dequeue::Closed));
        assert!(queue.try_push(job("c")).is_err());
    }

    #[test]
    fn test_reopen_after_close() {
        let queue = PersistQueue::new(10);
        queue.close();
        queue.reopen();
        assert!(queue.try_push(job("a")).is_ok());
    }

    #[test]
    fn test_capacity_is_hot_adjustable() {
        let queue = PersistQueue::new(1);
        queue.try_push(job("a")).unwrap();
        assert!(queue.try_push(job("b")).is_err());
        queue.set_capacity(2);
        assert!(queue.try_push(job("b")).is_ok());
    }

    #[test]
    fn test_pop_wakes_on_push() {
        let queue = Arc::new(PersistQueue::new(4));
        let consumer = Arc::clone(&queue);
        let handle = std::thread::spawn(move || consumer.pop(Duration::from_secs(5)));
        std::thread::sleep(Duration::from_millis(20));
        queue.try_push(job("a")).unwrap();
        match handle.join().unwrap() {
            Dequeue::Job(j) => assert_eq!(j.record.id(), "a"),
            other => panic!("expected job, got {other:?}"),
        }
    }
}
