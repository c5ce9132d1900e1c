use {
    crate::{
        connection::{Mode, Shared},
        Error,
    },
    buslane_wire::Message,
    error_reporter::Report,
    parking_lot::Mutex,
    std::{
        collections::VecDeque,
        sync::{Arc, Weak},
        time::{Duration, Instant},
    },
    tokio::sync::Notify,
};

struct QueueState {
    items: VecDeque<Message>,
    closed: bool,
    dropped: u64,
    overflowing: bool,
}

/// A bounded queue of received signals. Overflow drops the oldest signal.
pub(crate) struct SignalQueue {
    capacity: usize,
    state: Mutex<QueueState>,
    notify: Notify,
}

enum Pop {
    Item(Message),
    Empty,
    Closed,
}

impl SignalQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                closed: false,
                dropped: 0,
                overflowing: false,
            }),
            notify: Notify::new(),
        }
    }

    pub fn push(&self, msg: Message) {
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            if state.items.len() >= self.capacity {
                state.items.pop_front();
                state.dropped += 1;
                if !state.overflowing {
                    state.overflowing = true;
                    log::warn!(
                        "Signal queue is full, dropping the oldest signal ({} dropped so far)",
                        state.dropped,
                    );
                }
            }
            state.items.push_back(msg);
        }
        self.notify.notify_one();
    }

    fn pop(&self) -> Pop {
        let mut state = self.state.lock();
        match state.items.pop_front() {
            Some(msg) => {
                state.overflowing = false;
                Pop::Item(msg)
            }
            None if state.closed => Pop::Closed,
            None => Pop::Empty,
        }
    }

    pub fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    fn dropped(&self) -> u64 {
        self.state.lock().dropped
    }

    fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

/// A stream of signals matching a subscription.
///
/// Signals are decoded lazily. Signals whose body cannot be decoded are logged and
/// skipped. The stream ends when the connection is closed. Dropping the stream
/// removes the subscription.
#[must_use]
pub struct SignalStream<T = Message> {
    shared: Weak<Shared>,
    id: Option<u64>,
    queue: Arc<SignalQueue>,
    decode: fn(Message) -> Result<T, Error>,
}

impl<T> SignalStream<T> {
    pub(crate) fn new(
        shared: Weak<Shared>,
        id: u64,
        queue: Arc<SignalQueue>,
        decode: fn(Message) -> Result<T, Error>,
    ) -> Self {
        Self {
            shared,
            id: Some(id),
            queue,
            decode,
        }
    }

    /// Removes the subscription without telling the bus.
    pub(crate) fn abandon(&mut self) {
        if let Some(id) = self.id.take() {
            if let Some(shared) = self.shared.upgrade() {
                shared.unsubscribe(id, false);
            }
        }
    }

    fn decode(&self, msg: Message) -> Option<T> {
        match (self.decode)(msg) {
            Ok(v) => Some(v),
            Err(e) => {
                log::warn!("Dropping a signal with an unexpected body: {}", Report::new(e));
                None
            }
        }
    }

    /// Waits for the next signal. Returns `None` once the connection has been closed.
    pub async fn next(&mut self) -> Option<T> {
        loop {
            let notified = self.queue.notify.notified();
            match self.queue.pop() {
                Pop::Item(msg) => match self.decode(msg) {
                    Some(v) => return Some(v),
                    None => continue,
                },
                Pop::Closed => return None,
                Pop::Empty => {}
            }
            notified.await;
        }
    }

    /// Returns a queued signal without waiting.
    pub fn try_next(&mut self) -> Option<T> {
        loop {
            match self.queue.pop() {
                Pop::Item(msg) => {
                    if let Some(v) = self.decode(msg) {
                        return Some(v);
                    }
                }
                _ => return None,
            }
        }
    }

    /// Waits for the next signal on a blocking connection.
    ///
    /// Reading from the socket also dispatches replies and method calls. Returns
    /// `Ok(None)` once the connection has been closed and [Error::Timeout] if no signal
    /// arrived in time.
    pub fn next_blocking(&mut self, timeout: Option<Duration>) -> Result<Option<T>, Error> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            match self.queue.pop() {
                Pop::Item(msg) => match self.decode(msg) {
                    Some(v) => return Ok(Some(v)),
                    None => continue,
                },
                Pop::Closed => return Ok(None),
                Pop::Empty => {}
            }
            let Some(shared) = self.shared.upgrade() else {
                return Ok(None);
            };
            shared.require_mode(Mode::Blocking)?;
            if deadline.is_some_and(|d| d <= Instant::now()) {
                return Err(Error::Timeout);
            }
            match shared.process_blocking(deadline) {
                Ok(_) => {}
                Err(Error::Disconnected) => return Ok(None),
                Err(e) => return Err(e),
            }
        }
    }

    /// The number of signals dropped because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.queue.dropped()
    }

    /// Returns whether the stream has ended. Queued signals can still be read.
    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }
}

impl<T> Drop for SignalStream<T> {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            if let Some(shared) = self.shared.upgrade() {
                shared.unsubscribe(id, true);
            }
        }
    }
}
