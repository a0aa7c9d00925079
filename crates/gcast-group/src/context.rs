//! State shared by every stage and task of one member.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use gcast_net::{GroupMessage, Transport};
use gcast_types::events::EventBus;
use gcast_types::{GroupConfig, MemberId, SendPolicy, View};
use tokio::sync::{Notify, mpsc, oneshot};
use tracing::{debug, trace};

use crate::GroupError;
use crate::view::ViewManager;

/// Control upcalls queued for the delivery task, in protocol order.
#[derive(Debug)]
pub(crate) enum Upcall {
    Block,
    Unblock,
    ViewChanged(Arc<View>),
    GetState(oneshot::Sender<Option<Bytes>>),
    SetState(Bytes),
}

pub(crate) struct Context {
    pub local: MemberId,
    pub config: GroupConfig,
    pub transport: Arc<dyn Transport>,
    pub views: ViewManager,
    pub events: EventBus,
    pub gate: SendGate,
    /// Wakes the delivery task: some window may have ready messages.
    pub ready: Notify,
    /// Signalled by the delivery task after every drain pass.
    pub drained: Notify,
    upcalls: mpsc::UnboundedSender<Upcall>,
}

impl Context {
    pub fn new(
        config: GroupConfig,
        transport: Arc<dyn Transport>,
        views: ViewManager,
        events: EventBus,
        upcalls: mpsc::UnboundedSender<Upcall>,
    ) -> Self {
        Self {
            local: transport.local(),
            config,
            transport,
            views,
            events,
            gate: SendGate::new(),
            ready: Notify::new(),
            drained: Notify::new(),
            upcalls,
        }
    }

    pub fn upcall(&self, upcall: Upcall) {
        if self.upcalls.send(upcall).is_err() {
            trace!(local = %self.local, "delivery task gone, dropping upcall");
        }
        self.ready.notify_one();
    }

    pub fn wake_delivery(&self) {
        self.ready.notify_one();
    }

    /// Send to one member; failures are logged, never fatal to the caller.
    pub async fn send(&self, dest: MemberId, msg: &GroupMessage) -> bool {
        match self.transport.send_to(dest, msg).await {
            Ok(()) => true,
            Err(e) => {
                debug!(local = %self.local, %dest, kind = msg.kind(), %e, "send failed");
                false
            }
        }
    }

    /// Send to several members, logging every failure.
    pub async fn broadcast(&self, dests: &[MemberId], msg: &GroupMessage) {
        for (dest, e) in self.transport.broadcast(dests, msg).await {
            debug!(local = %self.local, %dest, kind = msg.kind(), %e, "broadcast send failed");
        }
    }

    /// Wait until `done()` holds, re-checking after every delivery pass.
    ///
    /// Returns `false` if `timeout` expires first.
    pub async fn wait_delivered(&self, timeout: Duration, done: impl Fn() -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if done() {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return done();
            }
        }
    }
}

struct GateState {
    closed: bool,
    in_flight: usize,
}

/// Barrier in front of the send path, closed while the member is flushed.
///
/// Closing waits for sends already past the gate, so a flush digest taken
/// after [`SendGate::close`] returns covers every message this member sent.
pub(crate) struct SendGate {
    state: Mutex<GateState>,
    changed: Notify,
}

impl SendGate {
    fn new() -> Self {
        Self {
            state: Mutex::new(GateState {
                closed: false,
                in_flight: 0,
            }),
            changed: Notify::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GateState> {
        self.state.lock().expect("send gate lock poisoned")
    }

    /// Pass the gate, waiting or failing while it is closed.
    pub async fn enter(&self, policy: SendPolicy) -> Result<GatePass<'_>, GroupError> {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.lock();
                if !state.closed {
                    state.in_flight += 1;
                    return Ok(GatePass { gate: self });
                }
                if policy == SendPolicy::Reject {
                    return Err(GroupError::Flushed);
                }
            }
            notified.await;
        }
    }

    /// Close the gate and wait for in-flight sends to finish.
    pub async fn close(&self) {
        self.lock().closed = true;
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.lock().in_flight == 0 {
                return;
            }
            notified.await;
        }
    }

    pub fn open(&self) {
        self.lock().closed = false;
        self.changed.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

/// Proof that a send passed the gate; releases its slot on drop.
pub(crate) struct GatePass<'a> {
    gate: &'a SendGate,
}

impl Drop for GatePass<'_> {
    fn drop(&mut self) {
        self.gate.lock().in_flight -= 1;
        self.gate.changed.notify_waiters();
    }
}
