//! Bounded single-consumer event queue that drops the oldest entry on overflow.
//!
//! BLE notifications arrive at whatever rate the device chooses.  A slow
//! consumer must never stall the dispatch task or grow memory without bound,
//! and for a live breathing signal the newest reading matters more than an
//! old one.  When the queue is full a push evicts the front entry and bumps
//! [`EventReceiver::dropped`].
//!
//! Ordering is FIFO among the entries that survive.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Notify;

struct State<T> {
    buf: VecDeque<T>,
    capacity: usize,
    dropped: u64,
    senders: usize,
    receiver_alive: bool,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    notify: Notify,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Create a queue holding at most `capacity` entries (minimum 1).
pub fn event_queue<T>(capacity: usize) -> (EventSender<T>, EventReceiver<T>) {
    let capacity = capacity.max(1);
    let shared = Arc::new(Shared {
        state: Mutex::new(State {
            buf: VecDeque::with_capacity(capacity),
            capacity,
            dropped: 0,
            senders: 1,
            receiver_alive: true,
        }),
        notify: Notify::new(),
    });
    (
        EventSender { shared: Arc::clone(&shared) },
        EventReceiver { shared },
    )
}

/// Producer half.  Cloneable; the queue closes when the last sender drops.
pub struct EventSender<T> {
    shared: Arc<Shared<T>>,
}

impl<T> EventSender<T> {
    /// Enqueue `value`, evicting the oldest entry if the queue is full.
    ///
    /// Never blocks.  Returns `false` when the receiver has been dropped; the
    /// value is discarded in that case.
    pub fn push(&self, value: T) -> bool {
        {
            let mut st = self.shared.lock();
            if !st.receiver_alive {
                return false;
            }
            if st.buf.len() >= st.capacity {
                st.buf.pop_front();
                st.dropped += 1;
            }
            st.buf.push_back(value);
        }
        self.shared.notify.notify_one();
        true
    }

    /// `true` once the receiver is gone.
    pub fn is_closed(&self) -> bool {
        !self.shared.lock().receiver_alive
    }
}

impl<T> Clone for EventSender<T> {
    fn clone(&self) -> Self {
        self.shared.lock().senders += 1;
        Self { shared: Arc::clone(&self.shared) }
    }
}

impl<T> Drop for EventSender<T> {
    fn drop(&mut self) {
        let last = {
            let mut st = self.shared.lock();
            st.senders -= 1;
            st.senders == 0
        };
        if last {
            self.shared.notify.notify_one();
        }
    }
}

/// Consumer half.
pub struct EventReceiver<T> {
    shared: Arc<Shared<T>>,
}

impl<T> EventReceiver<T> {
    /// Wait for the next entry.  Returns `None` once every sender has dropped
    /// and the buffer is drained.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            {
                let mut st = self.shared.lock();
                if let Some(v) = st.buf.pop_front() {
                    return Some(v);
                }
                if st.senders == 0 {
                    return None;
                }
            }
            self.shared.notify.notified().await;
        }
    }

    /// Take the next entry without waiting.
    pub fn try_recv(&mut self) -> Option<T> {
        self.shared.lock().buf.pop_front()
    }

    /// Entries currently buffered.
    pub fn len(&self) -> usize {
        self.shared.lock().buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total entries evicted because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.shared.lock().dropped
    }
}

impl<T> Drop for EventReceiver<T> {
    fn drop(&mut self) {
        let mut st = self.shared.lock();
        st.receiver_alive = false;
        st.buf.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn overflow_drops_oldest() {
        let (tx, mut rx) = event_queue(3);
        for i in 0..5 {
            assert!(tx.push(i));
        }
        assert_eq!(rx.dropped(), 2);
        assert_eq!(rx.recv().await, Some(2));
        assert_eq!(rx.recv().await, Some(3));
        assert_eq!(rx.recv().await, Some(4));
    }

    #[tokio::test]
    async fn closes_after_last_sender() {
        let (tx, mut rx) = event_queue(4);
        let tx2 = tx.clone();
        tx.push(1);
        drop(tx);
        tx2.push(2);
        drop(tx2);
        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.recv().await, Some(2));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn recv_wakes_on_push_from_task() {
        let (tx, mut rx) = event_queue(2);
        let producer = tokio::spawn(async move {
            tokio::task::yield_now().await;
            tx.push("hello");
        });
        assert_eq!(rx.recv().await, Some("hello"));
        producer.await.unwrap();
        assert_eq!(rx.recv().await, None);
    }

    #[test]
    fn push_after_receiver_drop_reports_closed() {
        let (tx, rx) = event_queue::<u8>(2);
        drop(rx);
        assert!(tx.is_closed());
        assert!(!tx.push(1));
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let (tx, mut rx) = event_queue(0);
        tx.push('a');
        tx.push('b');
        assert_eq!(rx.try_recv(), Some('b'));
        assert_eq!(rx.len(), 0);
    }
}
