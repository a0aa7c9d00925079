//! The application side of a group member.
//!
//! All upcalls come from the member's single delivery task, so an
//! application observes deliveries, `block`/`unblock` pairs and view changes
//! in the order the protocol produced them. Callbacks must return quickly;
//! anything slow belongs on the application's own tasks.

use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use gcast_types::{MemberId, View};
use tokio::sync::mpsc;

/// Callbacks a group member makes into the application.
pub trait Application: Send + Sync + 'static {
    /// A message, in per-sender FIFO order. Called once per message.
    fn deliver(&self, sender: MemberId, payload: Bytes);

    /// A flush is starting; stop issuing sends until [`Application::unblock`].
    fn block(&self) {}

    /// The flush barrier was released.
    fn unblock(&self) {}

    /// A new view was installed.
    fn view_changed(&self, _view: &View) {}

    /// Snapshot of the application state for a member that asked for it.
    ///
    /// Called while a flush holds the group, after every message covered by
    /// the flush was delivered. `None` means there is no state to give.
    fn get_state(&self) -> Option<Bytes> {
        None
    }

    /// Replace the application state with one fetched from another member.
    ///
    /// Deliveries that follow continue right after the messages the state
    /// reflects.
    fn set_state(&self, _state: Bytes) {}
}

/// Outcome of [`UpcallReceiver::poll`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Poll {
    /// A message was delivered.
    Delivered {
        /// Original sender.
        sender: MemberId,
        /// Application payload.
        payload: Bytes,
    },
    /// The member was blocked by a flush.
    Blocked,
    /// The flush barrier was released.
    Unblocked,
    /// A new view was installed.
    ViewChanged(View),
    /// State fetched from another member was installed.
    StateReceived(Bytes),
    /// Nothing happened before the deadline.
    TimedOut,
    /// The member shut down and no upcall is left.
    Closed,
}

/// An [`Application`] that turns every upcall into a [`Poll`] value.
///
/// Its state is an opaque byte string: handed out on request and replaced
/// by a transfer.
pub struct ChannelApplication {
    tx: mpsc::UnboundedSender<Poll>,
    state: Mutex<Option<Bytes>>,
}

impl ChannelApplication {
    /// Create the application and the receiver that observes it.
    pub fn new() -> (Self, UpcallReceiver) {
        Self::build(None)
    }

    /// Like [`ChannelApplication::new`], starting with `state`.
    pub fn with_state(state: impl Into<Bytes>) -> (Self, UpcallReceiver) {
        Self::build(Some(state.into()))
    }

    fn build(state: Option<Bytes>) -> (Self, UpcallReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let app = Self {
            tx,
            state: Mutex::new(state),
        };
        (app, UpcallReceiver { rx })
    }

    /// The current application state.
    pub fn state(&self) -> Option<Bytes> {
        self.state.lock().expect("state lock poisoned").clone()
    }

    fn push(&self, upcall: Poll) {
        // The receiver going away only means nobody is watching any more.
        let _ = self.tx.send(upcall);
    }
}

impl Application for ChannelApplication {
    fn deliver(&self, sender: MemberId, payload: Bytes) {
        self.push(Poll::Delivered { sender, payload });
    }

    fn block(&self) {
        self.push(Poll::Blocked);
    }

    fn unblock(&self) {
        self.push(Poll::Unblocked);
    }

    fn view_changed(&self, view: &View) {
        self.push(Poll::ViewChanged(view.clone()));
    }

    fn get_state(&self) -> Option<Bytes> {
        self.state()
    }

    fn set_state(&self, state: Bytes) {
        *self.state.lock().expect("state lock poisoned") = Some(state.clone());
        self.push(Poll::StateReceived(state));
    }
}

/// Receiving end of a [`ChannelApplication`].
pub struct UpcallReceiver {
    rx: mpsc::UnboundedReceiver<Poll>,
}

impl UpcallReceiver {
    /// Wait up to `timeout` for the next upcall.
    pub async fn poll(&mut self, timeout: Duration) -> Poll {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(upcall)) => upcall,
            Ok(None) => Poll::Closed,
            Err(_) => Poll::TimedOut,
        }
    }

    /// Return the next upcall if one is already queued.
    pub fn try_poll(&mut self) -> Option<Poll> {
        self.rx.try_recv().ok()
    }

    /// Collect `count` deliveries, skipping other upcalls, within `timeout`.
    ///
    /// Returns what arrived before the deadline, which may be fewer.
    pub async fn deliveries(&mut self, count: usize, timeout: Duration) -> Vec<(MemberId, Bytes)> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut delivered = Vec::with_capacity(count);
        while delivered.len() < count {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match self.poll(remaining).await {
                Poll::Delivered { sender, payload } => delivered.push((sender, payload)),
                Poll::TimedOut | Poll::Closed => break,
                _ => {}
            }
        }
        delivered
    }

    /// Wait for the next view change within `timeout`, skipping other upcalls.
    pub async fn next_view(&mut self, timeout: Duration) -> Option<View> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match self.poll(remaining).await {
                Poll::ViewChanged(view) => return Some(view),
                Poll::TimedOut | Poll::Closed => return None,
                _ => {}
            }
        }
    }
}
