use crate::error::{PipelineError, Result};
use crate::token::CancellationToken;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// What travels through an inter-stage queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message<T> {
    /// One unit of user data
    Item(T),
    /// In-band stream end: the producing stage has no more items
    End,
}

/// Counts items that were put but not yet marked done
#[derive(Debug, Default)]
struct TaskTracker {
    unfinished: Mutex<usize>,
    all_done: Condvar,
}

impl TaskTracker {
    fn add(&self) {
        *self.unfinished.lock() += 1;
    }

    fn done(&self) {
        let mut unfinished = self.unfinished.lock();
        if *unfinished == 0 {
            tracing::warn!("task_done called more times than items were put");
            return;
        }
        *unfinished -= 1;
        if *unfinished == 0 {
            self.all_done.notify_all();
        }
    }

    fn wait(&self, deadline: Option<Instant>) -> bool {
        let mut unfinished = self.unfinished.lock();
        while *unfinished > 0 {
            match deadline {
                Some(deadline) => {
                    if self.all_done.wait_until(&mut unfinished, deadline).timed_out() {
                        return *unfinished == 0;
                    }
                }
                None => self.all_done.wait(&mut unfinished),
            }
        }
        true
    }
}

/// A bounded FIFO whose blocking operations can be interrupted by a
/// [`CancellationToken`].
///
/// Each blocking call waits in slices of `poll_interval` and checks the
/// token between slices, so cancellation is observed within about one
/// interval. Setting the token never discards queued items; `drain` does.
#[derive(Debug)]
pub struct InterruptableQueue<T> {
    sender: Sender<T>,
    receiver: Receiver<T>,
    capacity: usize,
    poll_interval: Duration,
    token: CancellationToken,
    tracker: Arc<TaskTracker>,
}

impl<T> Clone for InterruptableQueue<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            receiver: self.receiver.clone(),
            capacity: self.capacity,
            poll_interval: self.poll_interval,
            token: self.token.clone(),
            tracker: Arc::clone(&self.tracker),
        }
    }
}

impl<T: Send> InterruptableQueue<T> {
    /// Create a queue holding at most `capacity` items
    pub fn new(capacity: usize, poll_interval: Duration, token: CancellationToken) -> Result<Self> {
        if capacity == 0 {
            return Err(PipelineError::ConfigError(
                "queue capacity must be at least 1".into(),
            ));
        }
        if poll_interval.is_zero() {
            return Err(PipelineError::ConfigError(
                "queue poll interval must be non-zero".into(),
            ));
        }
        let (sender, receiver) = channel::bounded(capacity);
        Ok(Self {
            sender,
            receiver,
            capacity,
            poll_interval,
            token,
            tracker: Arc::new(TaskTracker::default()),
        })
    }

    /// Insert an item, blocking while the queue is full.
    ///
    /// Fails with [`PipelineError::Cancelled`] if the token is set before the
    /// insert succeeds; the queue is left untouched in that case.
    pub fn put(&self, item: T) -> Result<()> {
        // Counted up front so a fast consumer can never mark it done first.
        self.tracker.add();
        let mut item = item;
        loop {
            match self.sender.send_timeout(item, self.poll_interval) {
                Ok(()) => return Ok(()),
                Err(SendTimeoutError::Timeout(rejected)) => {
                    if self.token.is_cancelled() {
                        self.tracker.done();
                        return Err(PipelineError::Cancelled);
                    }
                    item = rejected;
                }
                Err(SendTimeoutError::Disconnected(_)) => {
                    self.tracker.done();
                    return Err(PipelineError::Cancelled);
                }
            }
        }
    }

    /// Remove the oldest item, blocking while the queue is empty.
    ///
    /// An item already queued is returned even when the token is set.
    pub fn get(&self) -> Result<T> {
        loop {
            match self.receiver.recv_timeout(self.poll_interval) {
                Ok(item) => return Ok(item),
                Err(RecvTimeoutError::Timeout) => {
                    if self.token.is_cancelled() {
                        return Err(PipelineError::Cancelled);
                    }
                }
                Err(RecvTimeoutError::Disconnected) => return Err(PipelineError::Cancelled),
            }
        }
    }

    /// Mark one previously fetched item as fully processed
    pub fn task_done(&self) {
        self.tracker.done();
    }

    /// Block until every item ever put has been marked done
    pub fn join(&self) {
        self.tracker.wait(None);
    }

    /// Like [`join`](Self::join) but gives up after `timeout`; returns whether
    /// the queue was fully consumed
    pub fn join_timeout(&self, timeout: Duration) -> bool {
        self.tracker.wait(Some(Instant::now() + timeout))
    }

    /// Discard everything currently queued, marking each item done.
    /// Returns the number of items removed.
    pub fn drain(&self) -> usize {
        let mut removed = 0;
        while self.receiver.try_recv().is_ok() {
            self.tracker.done();
            removed += 1;
        }
        removed
    }

    /// Items currently queued
    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    /// Whether nothing is queued right now
    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    /// Maximum number of queued items
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Items put but not yet marked done
    pub fn unfinished(&self) -> usize {
        *self.tracker.unfinished.lock()
    }

    /// Length of one wait slice between token checks
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Token that interrupts this queue's waits
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// Type-erased view of a queue used by pipeline teardown
pub(crate) trait DrainQueue: Send {
    fn drain(&self) -> usize;
    fn join_timeout(&self, timeout: Duration) -> bool;
    fn unfinished(&self) -> usize;
}

impl<T: Send> DrainQueue for InterruptableQueue<T> {
    fn drain(&self) -> usize {
        InterruptableQueue::drain(self)
    }

    fn join_timeout(&self, timeout: Duration) -> bool {
        InterruptableQueue::join_timeout(self, timeout)
    }

    fn unfinished(&self) -> usize {
        InterruptableQueue::unfinished(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    const POLL: Duration = Duration::from_millis(20);

    fn queue(capacity: usize) -> (InterruptableQueue<i32>, CancellationToken) {
        let token = CancellationToken::new();
        let queue = InterruptableQueue::new(capacity, POLL, token.clone()).unwrap();
        (queue, token)
    }

    #[test]
    fn test_put_get_preserves_items() {
        for capacity in [1, 2, 7, 64] {
            let (q, _token) = queue(capacity);
            let producer = {
                let q = q.clone();
                thread::spawn(move || {
                    for i in 0..200 {
                        q.put(i).unwrap();
                    }
                })
            };
            let received: Vec<i32> = (0..200)
                .map(|_| {
                    let item = q.get().unwrap();
                    q.task_done();
                    item
                })
                .collect();
            producer.join().unwrap();
            assert_eq!(received, (0..200).collect::<Vec<_>>());
            assert_eq!(q.unfinished(), 0);
        }
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let result = InterruptableQueue::<i32>::new(0, POLL, CancellationToken::new());
        assert!(matches!(result, Err(PipelineError::ConfigError(_))));
    }

    #[test]
    fn test_get_interrupted_within_poll_interval() {
        let (q, token) = queue(4);
        let waiter = thread::spawn(move || {
            let result = q.get();
            (result.is_err_and(|e| e.is_cancelled()), Instant::now())
        });

        thread::sleep(POLL * 5);
        assert!(!waiter.is_finished());

        let cancelled_at = Instant::now();
        token.cancel("test");
        let (was_cancelled, returned_at) = waiter.join().unwrap();
        assert!(was_cancelled);
        assert!(returned_at.duration_since(cancelled_at) < POLL * 3);
    }

    #[test]
    fn test_put_interrupted_when_full() {
        let (q, token) = queue(3);
        for i in 0..3 {
            q.put(i).unwrap();
        }
        let blocked = {
            let q = q.clone();
            thread::spawn(move || {
                let result = q.put(-1);
                (result.is_err_and(|e| e.is_cancelled()), Instant::now())
            })
        };

        thread::sleep(POLL * 5);
        assert!(!blocked.is_finished());

        let cancelled_at = Instant::now();
        token.cancel("test");
        let (was_cancelled, returned_at) = blocked.join().unwrap();
        assert!(was_cancelled);
        assert!(returned_at.duration_since(cancelled_at) < POLL * 3);
        // No partial insert
        assert_eq!(q.len(), 3);
        assert_eq!(q.unfinished(), 3);
    }

    #[test]
    fn test_queued_item_survives_cancellation() {
        let (q, token) = queue(2);
        q.put(7).unwrap();
        token.cancel("test");
        assert_eq!(q.get().unwrap(), 7);
        assert!(q.get().is_err_and(|e| e.is_cancelled()));
    }

    #[test]
    fn test_join_waits_for_task_done() {
        let (q, _token) = queue(4);
        q.put(1).unwrap();
        q.put(2).unwrap();
        assert!(!q.join_timeout(POLL));

        let consumer = {
            let q = q.clone();
            thread::spawn(move || {
                for _ in 0..2 {
                    q.get().unwrap();
                    thread::sleep(Duration::from_millis(5));
                    q.task_done();
                }
            })
        };
        q.join();
        consumer.join().unwrap();
        assert_eq!(q.unfinished(), 0);
    }

    #[test]
    fn test_drain_marks_items_done() {
        let (q, _token) = queue(5);
        for i in 0..4 {
            q.put(i).unwrap();
        }
        assert_eq!(q.drain(), 4);
        assert!(q.is_empty());
        assert!(q.join_timeout(Duration::ZERO));
    }
}
