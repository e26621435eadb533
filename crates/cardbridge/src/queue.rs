use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;

struct QueueState<T> {
    items: VecDeque<T>,
    finished: bool,
}

/// Unbounded FIFO that turns push-style delivery into pull-style iteration.
///
/// Producers call [`enqueue`](Self::enqueue) and finally [`finish`](Self::finish);
/// the consumer awaits [`next`](Self::next) until it yields `None`. Items
/// buffered before `finish` are still delivered. Any number of producers may
/// share the queue through an `Arc`.
pub struct AsyncQueue<T> {
    state: Mutex<QueueState<T>>,
    notify: Notify,
}

impl<T> AsyncQueue<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                finished: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Append an item and wake a waiting consumer. Ignored after `finish`.
    pub fn enqueue(&self, item: T) {
        {
            let mut state = match self.state.lock() {
                Ok(s) => s,
                Err(poisoned) => poisoned.into_inner(),
            };
            if state.finished {
                return;
            }
            state.items.push_back(item);
        }
        self.notify.notify_one();
    }

    /// Mark the end of the stream. Wakes every waiter so iteration can end.
    pub fn finish(&self) {
        {
            let mut state = match self.state.lock() {
                Ok(s) => s,
                Err(poisoned) => poisoned.into_inner(),
            };
            state.finished = true;
        }
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    /// Wait for the next item. Returns `None` once finished and drained.
    pub async fn next(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a concurrent enqueue cannot slip between.
            notified.as_mut().enable();
            {
                let mut state = match self.state.lock() {
                    Ok(s) => s,
                    Err(poisoned) => poisoned.into_inner(),
                };
                if let Some(item) = state.items.pop_front() {
                    return Some(item);
                }
                if state.finished {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Take everything currently buffered without waiting.
    pub fn drain(&self) -> Vec<T> {
        match self.state.lock() {
            Ok(mut s) => s.items.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().items.drain(..).collect(),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.state.lock().map(|s| s.finished).unwrap_or(true)
    }

    pub fn len(&self) -> usize {
        self.state.lock().map(|s| s.items.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for AsyncQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
