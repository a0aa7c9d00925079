//! A running group member.
//!
//! [`GroupNode`] assembles the stage pipeline around one transport endpoint
//! and runs four tasks: the receive loop feeding inbound messages up the
//! pipeline, the delivery loop handing ready messages and control upcalls to
//! the application, the retransmission requester and the stability gossiper.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use gcast_digest::Digest;
use gcast_net::{Inbound, Transport};
use gcast_types::events::{EventBus, WindowReset};
use gcast_types::{GroupConfig, MemberId, Seqno, View, ViewId};
use gcast_window::WindowCounters;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::GroupError;
use crate::app::Application;
use crate::context::{Context, Upcall};
use crate::flush::{FlushCoordinator, FlushOutcome, FlushState};
use crate::gms::Gms;
use crate::merge::{MergeOutcome, MergeReconciler};
use crate::nak::NakStage;
use crate::stage::{Event, Pipeline, Stage};
use crate::state::{StateOutcome, StateTransfer};
use crate::view::ViewManager;

struct NodeInner {
    ctx: Arc<Context>,
    nak: Arc<NakStage>,
    flush: Arc<FlushCoordinator>,
    gms: Arc<Gms>,
    merge: Arc<MergeReconciler>,
    state: Arc<StateTransfer>,
    pipeline: Pipeline,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Handle to a running group member. Cheap to clone.
#[derive(Clone)]
pub struct GroupNode {
    inner: Arc<NodeInner>,
}

impl GroupNode {
    /// Start a member alone in its own view; use [`GroupNode::join`] to
    /// enter a group.
    pub fn start(
        config: GroupConfig,
        transport: Arc<dyn Transport>,
        inbound: Inbound,
        app: Arc<dyn Application>,
    ) -> Self {
        let local = transport.local();
        let alone = View::new(ViewId::new(local, 1), vec![local]);
        Self::start_in_view(config, transport, inbound, app, alone)
    }

    /// Start a member with `view` already installed, as for a statically
    /// configured group where every member starts from the same view.
    pub fn start_in_view(
        config: GroupConfig,
        transport: Arc<dyn Transport>,
        inbound: Inbound,
        app: Arc<dyn Application>,
        view: View,
    ) -> Self {
        let local = transport.local();
        let (upcall_tx, upcall_rx) = mpsc::unbounded_channel();
        let views = ViewManager::new(local, view);
        let ctx = Arc::new(Context::new(config, transport, views, EventBus::new(), upcall_tx));

        let nak = Arc::new(NakStage::new(ctx.clone()));
        let flush = Arc::new(FlushCoordinator::new(ctx.clone()));
        let gms = Gms::new(ctx.clone(), flush.clone(), nak.clone());
        let merge = Arc::new(MergeReconciler::new(ctx.clone(), gms.clone()));
        let state = Arc::new(StateTransfer::new(ctx.clone(), flush.clone()));
        let pipeline = Pipeline::new(vec![
            nak.clone() as Arc<dyn Stage>,
            flush.clone() as Arc<dyn Stage>,
            gms.clone() as Arc<dyn Stage>,
            merge.clone() as Arc<dyn Stage>,
            state.clone() as Arc<dyn Stage>,
        ]);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tasks = vec![
            tokio::spawn(receive_loop(pipeline.clone(), inbound, shutdown_rx.clone())),
            tokio::spawn(delivery_loop(ctx.clone(), app, upcall_rx, shutdown_rx.clone())),
            tokio::spawn(retransmit_loop(ctx.clone(), nak.clone(), shutdown_rx.clone())),
            tokio::spawn(stability_loop(ctx.clone(), nak.clone(), gms.clone(), shutdown_rx)),
        ];
        info!(%local, view = %ctx.views.current(), stages = ?pipeline.names(), "group member started");

        Self {
            inner: Arc::new(NodeInner {
                ctx,
                nak,
                flush,
                gms,
                merge,
                state,
                pipeline,
                shutdown_tx,
                tasks: Mutex::new(tasks),
            }),
        }
    }

    /// This member's identifier.
    pub fn local(&self) -> MemberId {
        self.inner.ctx.local
    }

    /// The installed view.
    pub fn view(&self) -> Arc<View> {
        self.inner.ctx.views.current()
    }

    /// `(low, high_contiguous, high_received)` of every window.
    pub fn digest(&self) -> Digest {
        self.inner.ctx.views.digest()
    }

    /// Counters of the window for `sender`.
    pub fn window_counters(&self, sender: &MemberId) -> Option<WindowCounters> {
        self.inner.ctx.views.window(sender).map(|w| w.counters())
    }

    /// The typed event bus this member reports protocol events on.
    pub fn events(&self) -> EventBus {
        self.inner.ctx.events.clone()
    }

    /// Whether a flush currently blocks this member's sends.
    pub fn is_blocked(&self) -> bool {
        self.inner.ctx.gate.is_closed()
    }

    /// Multicast `payload` to the view. Returns its seqno.
    ///
    /// While the member is flushed this waits for the barrier to be released
    /// or fails with [`GroupError::Flushed`], depending on the send policy.
    pub async fn multicast(&self, payload: impl Into<Bytes>) -> Result<Seqno, GroupError> {
        if *self.inner.shutdown_tx.borrow() {
            return Err(GroupError::Shutdown);
        }
        match self.inner.pipeline.down(Event::Multicast(payload.into())).await? {
            Some(Event::Sent(seqno)) => Ok(seqno),
            other => {
                warn!(local = %self.local(), ?other, "multicast did not reach the network");
                Err(GroupError::Shutdown)
            }
        }
    }

    /// Join the group coordinated by `coordinator`.
    pub async fn join(&self, coordinator: MemberId) -> Result<Arc<View>, GroupError> {
        self.inner.gms.join(coordinator, self.membership_timeout()).await
    }

    /// Leave the group; afterwards the member is alone in its own view.
    pub async fn leave(&self) -> Result<(), GroupError> {
        self.inner.gms.leave(self.membership_timeout()).await
    }

    fn membership_timeout(&self) -> Duration {
        let config = &self.inner.ctx.config;
        config.flush_timeout + config.view_ack_timeout * 2
    }

    /// Flush `members`, or the whole view, within the configured timeout.
    pub async fn start_flush(&self, members: Option<&[MemberId]>) -> Result<FlushOutcome, GroupError> {
        let timeout = self.inner.ctx.config.flush_timeout;
        self.inner.flush.start_flush(members, timeout).await
    }

    /// Flush `members`, or the whole view, within `timeout`.
    pub async fn start_flush_with_timeout(
        &self,
        members: Option<&[MemberId]>,
        timeout: Duration,
    ) -> Result<FlushOutcome, GroupError> {
        self.inner.flush.start_flush(members, timeout).await
    }

    /// Release flushes started here. Returns how many were released.
    pub async fn stop_flush(&self, members: Option<&[MemberId]>) -> usize {
        self.inner.flush.stop_flush(members).await
    }

    /// State of the most advanced flush started by this member.
    pub fn flush_state(&self) -> FlushState {
        self.inner.flush.state()
    }

    /// Digest captured by the last successful flush started here.
    pub fn last_flush_digest(&self) -> Option<Digest> {
        self.inner.ctx.views.last_flush_digest()
    }

    /// Failure-detector input: `member` is suspected.
    pub async fn on_member_suspected(&self, member: MemberId) {
        if let Err(e) = self.inner.pipeline.up(Event::Suspect(member)).await {
            warn!(local = %self.local(), %member, %e, "suspicion handling failed");
        }
    }

    /// Failure-detector input: `member` crashed.
    pub async fn on_member_crashed(&self, member: MemberId) {
        if let Err(e) = self.inner.pipeline.up(Event::Crashed(member)).await {
            warn!(local = %self.local(), %member, %e, "crash handling failed");
        }
    }

    /// Discovery input: `coordinators` can reach each other.
    pub async fn on_coordinators_detected(&self, coordinators: &[MemberId]) -> Result<MergeOutcome, GroupError> {
        self.inner.merge.on_coordinators_detected(coordinators).await
    }

    /// Fetch the application state from `provider`, or from the oldest
    /// other member, and install it through [`Application::set_state`].
    pub async fn get_state(&self, provider: Option<MemberId>) -> Result<StateOutcome, GroupError> {
        let timeout = self.inner.ctx.config.state_timeout;
        self.inner.state.get_state(provider, timeout).await
    }

    /// Stop every task. Pending sends fail with [`GroupError::Shutdown`].
    pub async fn shutdown(&self) {
        let local = self.local();
        let _ = self.inner.shutdown_tx.send(true);
        self.inner.flush.release_all();

        let tasks = std::mem::take(&mut *self.inner.tasks.lock().expect("task lock poisoned"));
        for task in tasks {
            let abort = task.abort_handle();
            if tokio::time::timeout(Duration::from_secs(1), task).await.is_err() {
                abort.abort();
            }
        }
        info!(%local, "group member stopped");
    }

    #[cfg(test)]
    pub(crate) fn window(&self, sender: &MemberId) -> Option<Arc<crate::view::Window>> {
        self.inner.ctx.views.window(sender)
    }

    /// Gossip stability and verify windows now instead of on the next tick.
    pub async fn run_stability_round(&self) {
        stability_round(&self.inner.ctx, &self.inner.nak, &self.inner.gms).await;
    }
}

async fn receive_loop(pipeline: Pipeline, mut inbound: Inbound, mut shutdown: watch::Receiver<bool>) {
    let local = inbound.local();
    loop {
        tokio::select! {
            envelope = inbound.recv() => match envelope {
                Some(envelope) => {
                    let kind = envelope.message.kind();
                    if let Err(e) = pipeline.up(Event::Receive(envelope)).await {
                        warn!(%local, kind, %e, "inbound message failed");
                    }
                }
                None => {
                    debug!(%local, "inbound stream closed");
                    break;
                }
            },
            _ = shutdown.changed() => break,
        }
    }
}

async fn delivery_loop(
    ctx: Arc<Context>,
    app: Arc<dyn Application>,
    mut upcalls: mpsc::UnboundedReceiver<Upcall>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        // Control upcalls go first: everything delivered before a view
        // change was drained before the change was committed.
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            upcall = upcalls.recv() => match upcall {
                Some(Upcall::Block) => app.block(),
                Some(Upcall::Unblock) => app.unblock(),
                Some(Upcall::ViewChanged(view)) => app.view_changed(&view),
                Some(Upcall::GetState(reply)) => {
                    let _ = reply.send(app.get_state());
                }
                Some(Upcall::SetState(state)) => app.set_state(state),
                None => break,
            },
            _ = ctx.ready.notified() => {
                let mut delivered = 0usize;
                for window in ctx.views.windows() {
                    while let Some((_, payload)) = window.remove_ready() {
                        app.deliver(window.sender(), payload);
                        delivered += 1;
                    }
                }
                if delivered > 0 {
                    debug!(local = %ctx.local, delivered, "delivered messages");
                }
                ctx.drained.notify_waiters();
            }
        }
    }
}

async fn retransmit_loop(ctx: Arc<Context>, nak: Arc<NakStage>, mut shutdown: watch::Receiver<bool>) {
    let first = ctx
        .config
        .retransmit_backoff
        .first()
        .copied()
        .unwrap_or(Duration::from_millis(100));
    let mut ticker = tokio::time::interval((first / 2).max(Duration::from_millis(5)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => nak.request_missing().await,
            _ = shutdown.changed() => break,
        }
    }
}

async fn stability_loop(
    ctx: Arc<Context>,
    nak: Arc<NakStage>,
    gms: Arc<Gms>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(ctx.config.stability_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => stability_round(&ctx, &nak, &gms).await,
            _ = shutdown.changed() => break,
        }
    }
}

async fn stability_round(ctx: &Context, nak: &NakStage, gms: &Gms) {
    nak.gossip_stability().await;

    let corrupted = nak.verify_windows();
    if corrupted.is_empty() {
        return;
    }
    for (sender, e) in corrupted {
        error!(local = %ctx.local, %sender, %e, "window corrupted, discarding it");
        ctx.views.discard_window(&sender);
        ctx.events.emit(WindowReset {
            sender,
            reason: e.to_string(),
        });
    }
    gms.rejoin().await;
}
