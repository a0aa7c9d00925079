//! Typed event bus for intra-member notifications.
//!
//! The reliable-delivery window, the flush coordinator and the merge
//! reconciler report what they do through an [`EventBus`]. Observers
//! (tests, the daemon's simulation report, diagnostics) subscribe to the
//! event types they care about without the protocol code knowing about them.
//!
//! Each event type is a distinct struct implementing the [`Event`] marker
//! trait and gets its own `tokio::sync::broadcast` channel, created lazily on
//! first `subscribe()`.
//!
//! ```rust
//! use gcast_types::MemberId;
//! use gcast_types::events::{EventBus, GapDetected};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let bus = EventBus::new();
//! let mut rx = bus.subscribe::<GapDetected>();
//!
//! bus.emit(GapDetected {
//!     sender: MemberId::loopback(7800),
//!     from: 3,
//!     to: 5,
//! });
//!
//! let event = rx.recv().await.unwrap();
//! assert_eq!((event.from, event.to), (3, 5));
//! # });
//! ```

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tracing::warn;

use crate::{MemberId, Seqno, View, ViewId};

/// Marker trait for everything that can travel through the [`EventBus`].
pub trait Event: Any + Send + Sync + Clone + std::fmt::Debug + 'static {}

// ---------------------------------------------------------------------------
// Reliable delivery
// ---------------------------------------------------------------------------

/// A sender's window received a seqno above the next expected one.
#[derive(Clone, Debug)]
pub struct GapDetected {
    /// Sender whose stream has the gap.
    pub sender: MemberId,
    /// First missing seqno.
    pub from: Seqno,
    /// Last missing seqno (inclusive).
    pub to: Seqno,
}
impl Event for GapDetected {}

/// A previously missing message arrived and closed (part of) a gap.
#[derive(Clone, Debug)]
pub struct MissingMessageReceived {
    /// Original sender of the message.
    pub sender: MemberId,
    /// Seqno that filled the gap.
    pub seqno: Seqno,
}
impl Event for MissingMessageReceived {}

/// A retransmission request was sent.
#[derive(Clone, Debug)]
pub struct RetransmitRequested {
    /// Sender whose messages are missing.
    pub sender: MemberId,
    /// Member the request went to.
    pub target: MemberId,
    /// First missing seqno.
    pub from: Seqno,
    /// Last missing seqno (inclusive).
    pub to: Seqno,
    /// Attempt number for this gap, starting at 1.
    pub attempt: u32,
}
impl Event for RetransmitRequested {}

/// A window failed its invariant check and was discarded.
#[derive(Clone, Debug)]
pub struct WindowReset {
    /// Sender whose window was discarded.
    pub sender: MemberId,
    /// The violated invariant.
    pub reason: String,
}
impl Event for WindowReset {}

// ---------------------------------------------------------------------------
// Flush
// ---------------------------------------------------------------------------

/// This member started a flush as initiator.
#[derive(Clone, Debug)]
pub struct FlushStarted {
    /// Initiating member.
    pub initiator: MemberId,
    /// Members covered by the flush.
    pub members: Vec<MemberId>,
    /// Whether the flush covers the whole view.
    pub total: bool,
}
impl Event for FlushStarted {}

/// A flush initiated by this member completed and captured a digest.
#[derive(Clone, Debug)]
pub struct FlushCompleted {
    /// Initiating member.
    pub initiator: MemberId,
    /// Members that acknowledged the drain.
    pub members: Vec<MemberId>,
    /// Number of senders in the captured digest.
    pub digest_entries: usize,
}
impl Event for FlushCompleted {}

/// A flush initiated by this member was rolled back.
#[derive(Clone, Debug)]
pub struct FlushAborted {
    /// Initiating member.
    pub initiator: MemberId,
    /// Why the flush was rolled back.
    pub reason: String,
}
impl Event for FlushAborted {}

// ---------------------------------------------------------------------------
// Views and merges
// ---------------------------------------------------------------------------

/// A new view was installed locally.
#[derive(Clone, Debug)]
pub struct ViewInstalled {
    /// The installed view.
    pub view: View,
}
impl Event for ViewInstalled {}

/// This member led a merge to completion.
#[derive(Clone, Debug)]
pub struct MergeCompleted {
    /// Identifier of the installed merge view.
    pub view_id: ViewId,
    /// Number of subgroups reconciled, including the leader's own.
    pub subgroups: usize,
    /// Coordinators that did not answer and were left out.
    pub excluded: Vec<MemberId>,
}
impl Event for MergeCompleted {}

/// A subgroup digest did not cover exactly the members of its view.
#[derive(Clone, Debug)]
pub struct DigestMismatch {
    /// Coordinator of the subgroup that reported the digest.
    pub coordinator: MemberId,
    /// Members of the subgroup view.
    pub view_members: usize,
    /// Senders in the reported digest.
    pub digest_senders: usize,
}
impl Event for DigestMismatch {}

/// This member installed application state fetched from another member.
#[derive(Clone, Debug)]
pub struct StateTransferred {
    /// Member the state came from.
    pub provider: MemberId,
    /// Size of the state in bytes; 0 when the provider had none.
    pub bytes: usize,
    /// Windows moved forward to the provider's delivery positions.
    pub windows_advanced: usize,
}
impl Event for StateTransferred {}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Per-type broadcast capacity.
const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Type-erased `broadcast::Sender<E>` per event type.
struct EventBusInner {
    channels: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

/// A type-safe event bus. Cheap to clone; emits never block.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<EventBusInner>>,
}

impl EventBus {
    /// Create a new empty event bus.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(EventBusInner {
                channels: HashMap::new(),
            })),
        }
    }

    /// Emit an event to all current subscribers of type `E`.
    ///
    /// Events with no subscriber are dropped.
    pub fn emit<E: Event>(&self, event: E) {
        let inner = self.inner.lock().expect("event bus lock poisoned");
        if let Some(sender) = inner
            .channels
            .get(&TypeId::of::<E>())
            .and_then(|boxed| boxed.downcast_ref::<broadcast::Sender<E>>())
        {
            // An error only means every receiver was dropped.
            let _ = sender.send(event);
        }
    }

    /// Subscribe to events of type `E`.
    pub fn subscribe<E: Event>(&self) -> EventReceiver<E> {
        let mut inner = self.inner.lock().expect("event bus lock poisoned");
        let sender = inner
            .channels
            .entry(TypeId::of::<E>())
            .or_insert_with(|| {
                let (tx, _) = broadcast::channel::<E>(DEFAULT_CHANNEL_CAPACITY);
                Box::new(tx)
            })
            .downcast_ref::<broadcast::Sender<E>>()
            .expect("type mismatch in event bus");

        EventReceiver {
            rx: sender.subscribe(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().expect("event bus lock poisoned");
        f.debug_struct("EventBus")
            .field("channel_count", &inner.channels.len())
            .finish()
    }
}

/// Typed receiver for one event type.
pub struct EventReceiver<E: Event> {
    rx: broadcast::Receiver<E>,
}

impl<E: Event> EventReceiver<E> {
    /// Wait for the next event, or `None` once the bus is dropped.
    ///
    /// Lagged events are skipped with a warning.
    pub async fn recv(&mut self) -> Option<E> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(
                        skipped = n,
                        event_type = std::any::type_name::<E>(),
                        "event receiver lagged"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Return the next buffered event without waiting.
    pub fn try_recv(&mut self) -> Option<E> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}
