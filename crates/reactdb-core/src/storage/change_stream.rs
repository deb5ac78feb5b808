use parking_lot::Mutex;
use tokio::sync::mpsc;

struct MulticastState<T> {
    subscribers: Vec<mpsc::UnboundedSender<T>>,
    completed: bool,
}

/// Hot fan-out of items to every current subscriber.
///
/// Each subscriber gets its own unbounded channel, so a slow reader never
/// blocks the writer. `complete` drops every sender: receivers drain what
/// was already queued and then yield `None`.
pub struct Multicast<T> {
    state: Mutex<MulticastState<T>>,
}

impl<T: Clone> Multicast<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MulticastState {
                subscribers: Vec::new(),
                completed: false,
            }),
        }
    }

    /// A receiver for every item published from now on. After `complete`
    /// the receiver is already finished.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock();
        if !state.completed {
            state.subscribers.push(tx);
        }
        rx
    }

    pub fn publish(&self, item: T) {
        let mut state = self.state.lock();
        state.subscribers.retain(|tx| tx.send(item.clone()).is_ok());
    }

    pub fn complete(&self) {
        let mut state = self.state.lock();
        state.completed = true;
        state.subscribers.clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }
}

impl<T: Clone> Default for Multicast<T> {
    fn default() -> Self {
        Self::new()
    }
}
