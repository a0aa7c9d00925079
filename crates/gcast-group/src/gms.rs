//! Group membership: coordinator-driven view changes.
//!
//! The coordinator (first member of the view) serializes every change. A
//! change flushes the affected members, proposes the new view together with
//! the captured digest, waits for every new member to stage it, commits it
//! and finally releases the flush. Members that crash or are suspected are
//! excluded by the first member of the view still considered alive.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use gcast_digest::Digest;
use gcast_net::{Envelope, GroupMessage};
use gcast_types::events::ViewInstalled;
use gcast_types::{MemberId, View, ViewId};
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::GroupError;
use crate::context::{Context, Upcall};
use crate::flush::{FlushCoordinator, FlushOutcome};
use crate::nak::NakStage;
use crate::stage::{Event, Stage};

/// Attempts of a background view change blocked by a local flush.
const CHANGE_ATTEMPTS: u32 = 10;

/// A membership change requested of the coordinator.
#[derive(Debug, Clone)]
pub(crate) enum Change {
    Join(MemberId),
    Leave(MemberId),
    /// Drop every member marked as crashed or suspected.
    Exclude,
    /// Reinstall the same membership under a new view id.
    Refresh,
    Merge {
        members: Vec<MemberId>,
        subgroups: Vec<View>,
        digest: Digest,
    },
}

struct Plan {
    view: View,
    flush_scope: Vec<MemberId>,
    digest: Option<Digest>,
}

/// The membership stage.
pub struct Gms {
    ctx: Arc<Context>,
    flush: Arc<FlushCoordinator>,
    nak: Arc<NakStage>,
    me: Weak<Gms>,
    changes: tokio::sync::Mutex<()>,
    excluded: Mutex<HashSet<MemberId>>,
    acks: Mutex<HashMap<ViewId, mpsc::UnboundedSender<(MemberId, bool)>>>,
    leave_ack: Mutex<Option<oneshot::Sender<ViewId>>>,
    installed: Notify,
}

impl Gms {
    pub(crate) fn new(ctx: Arc<Context>, flush: Arc<FlushCoordinator>, nak: Arc<NakStage>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            ctx,
            flush,
            nak,
            me: me.clone(),
            changes: tokio::sync::Mutex::new(()),
            excluded: Mutex::new(HashSet::new()),
            acks: Mutex::new(HashMap::new()),
            leave_ack: Mutex::new(None),
            installed: Notify::new(),
        })
    }

    fn spawn_change(&self, change: Change) {
        let Some(gms) = self.me.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            let pause = gms.ctx.config.flush_timeout / 8;
            for attempt in 1..=CHANGE_ATTEMPTS {
                match gms.install_change(change.clone()).await {
                    Ok(_) => return,
                    Err(GroupError::FlushInProgress) if attempt < CHANGE_ATTEMPTS => {
                        debug!(local = %gms.ctx.local, attempt, "flush in progress, retrying view change");
                        tokio::time::sleep(pause).await;
                    }
                    Err(e) => {
                        warn!(local = %gms.ctx.local, %e, "view change failed");
                        return;
                    }
                }
            }
        });
    }

    fn plan(&self, current: &View, change: Change) -> Option<Plan> {
        let excluded = self.excluded.lock().expect("excluded lock poisoned").clone();
        let survivors = |members: &[MemberId]| -> Vec<MemberId> {
            members.iter().filter(|m| !excluded.contains(m)).copied().collect()
        };
        let counter = current.id().counter;
        let id = |counter: u64| ViewId::new(self.ctx.local, counter + 1);

        match change {
            Change::Join(member) => {
                let mut members = survivors(current.members());
                if !members.contains(&member) {
                    members.push(member);
                }
                Some(Plan {
                    view: View::new(id(counter), members.clone()),
                    flush_scope: members,
                    digest: None,
                })
            }
            Change::Leave(member) => {
                let scope = survivors(current.members());
                let members: Vec<MemberId> = scope.iter().filter(|m| **m != member).copied().collect();
                if members.is_empty() {
                    return None;
                }
                Some(Plan {
                    view: View::new(id(counter), members),
                    flush_scope: scope,
                    digest: None,
                })
            }
            Change::Exclude => {
                let members = survivors(current.members());
                if members.len() == current.size() || members.is_empty() {
                    return None;
                }
                Some(Plan {
                    view: View::new(id(counter), members.clone()),
                    flush_scope: members,
                    digest: None,
                })
            }
            Change::Refresh => {
                let members = survivors(current.members());
                Some(Plan {
                    view: View::new(id(counter), members.clone()),
                    flush_scope: members,
                    digest: None,
                })
            }
            Change::Merge {
                members,
                subgroups,
                digest,
            } => {
                let members = survivors(&members);
                let highest = subgroups
                    .iter()
                    .map(|v| v.id().counter)
                    .chain([counter])
                    .max()
                    .unwrap_or(counter);
                Some(Plan {
                    view: View::new_merge(id(highest), members.clone(), subgroups),
                    flush_scope: members,
                    digest: Some(digest),
                })
            }
        }
    }

    /// Run one view change as coordinator. Returns the installed view.
    pub(crate) async fn install_change(&self, change: Change) -> Result<Arc<View>, GroupError> {
        let _serialized = self.changes.lock().await;
        let local = self.ctx.local;
        let current = self.ctx.views.current();
        let Some(plan) = self.plan(&current, change) else {
            return Ok(current);
        };
        let view_id = plan.view.id();
        info!(%local, view = %plan.view, "installing view");

        let outcome = self
            .flush
            .start_flush(Some(plan.flush_scope.as_slice()), self.ctx.config.flush_timeout)
            .await?;
        let mut digest = match outcome {
            FlushOutcome::Flushed { digest, .. } => digest,
            FlushOutcome::AlreadyFlushing => return Err(GroupError::FlushInProgress),
            FlushOutcome::TimedOut => {
                return Err(GroupError::FlushFailed(format!("flush for view {view_id} timed out")));
            }
        };
        if let Some(extra) = &plan.digest {
            digest.merge(extra);
        }
        digest.retain(|m| plan.view.contains(m));

        let installed = self.prepare_and_commit(&plan.view, digest).await;
        self.flush.stop_flush(Some(plan.flush_scope.as_slice())).await;
        installed?;

        if plan.view.contains(&local) {
            self.wait_installed(view_id, self.ctx.config.view_ack_timeout).await;
        }
        Ok(Arc::new(plan.view))
    }

    async fn prepare_and_commit(&self, view: &View, digest: Digest) -> Result<(), GroupError> {
        let view_id = view.id();
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.acks.lock().expect("ack lock poisoned").insert(view_id, tx);

        let prepare = GroupMessage::PrepareView {
            view: view.clone(),
            digest,
        };
        self.ctx.broadcast(view.members(), &prepare).await;

        let deadline = Instant::now() + self.ctx.config.view_ack_timeout;
        let mut pending: HashSet<MemberId> = view.members().iter().copied().collect();
        let mut refused = Vec::new();
        while !pending.is_empty() {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some((from, accepted))) => {
                    if pending.remove(&from) && !accepted {
                        refused.push(from);
                    }
                }
                _ => break,
            }
        }
        self.acks.lock().expect("ack lock poisoned").remove(&view_id);

        if !pending.is_empty() || !refused.is_empty() {
            self.ctx
                .broadcast(view.members(), &GroupMessage::AbortView { view_id })
                .await;
            return Err(GroupError::ViewInstall {
                view_id,
                reason: format!("no ack from {pending:?}, refused by {refused:?}"),
            });
        }

        self.ctx
            .broadcast(view.members(), &GroupMessage::CommitView { view_id })
            .await;
        Ok(())
    }

    async fn wait_installed(&self, view_id: ViewId, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.installed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.ctx.views.current().id() >= view_id {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.ctx.views.current().id() >= view_id;
            }
        }
    }

    /// Bookkeeping after a view became current locally.
    fn on_installed(&self, previous: &View, view: Arc<View>) {
        self.nak.on_view_installed(previous, &view);
        self.excluded
            .lock()
            .expect("excluded lock poisoned")
            .retain(|m| view.contains(m));
        self.ctx.events.emit(ViewInstalled {
            view: (*view).clone(),
        });
        self.ctx.upcall(Upcall::ViewChanged(view));
        self.installed.notify_waiters();
    }

    // -----------------------------------------------------------------------
    // Member-facing operations
    // -----------------------------------------------------------------------

    /// Ask `coordinator` to add this member and wait for the resulting view.
    pub async fn join(&self, coordinator: MemberId, timeout: Duration) -> Result<Arc<View>, GroupError> {
        let local = self.ctx.local;
        if coordinator == local {
            return Ok(self.ctx.views.current());
        }
        info!(%local, %coordinator, "joining");
        let deadline = Instant::now() + timeout;
        if !self.ctx.send(coordinator, &GroupMessage::JoinRequest).await {
            return Err(GroupError::JoinTimeout(coordinator));
        }
        loop {
            let notified = self.installed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let view = self.ctx.views.current();
            if view.contains(&coordinator) {
                return Ok(view);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(GroupError::JoinTimeout(coordinator));
            }
        }
    }

    /// Leave the group and fall back to a view of this member alone.
    pub async fn leave(&self, timeout: Duration) -> Result<(), GroupError> {
        let local = self.ctx.local;
        let view = self.ctx.views.current();
        if view.size() <= 1 {
            return Ok(());
        }
        // The view the others moved on to, so the singleton view never reuses its id.
        let remaining = match view.coordinator() {
            Some(coordinator) if coordinator == local => self.install_change(Change::Leave(local)).await?.id(),
            Some(coordinator) => {
                let (tx, rx) = oneshot::channel();
                *self.leave_ack.lock().expect("leave lock poisoned") = Some(tx);
                self.ctx.send(coordinator, &GroupMessage::LeaveRequest).await;
                match tokio::time::timeout(timeout, rx).await {
                    Ok(Ok(view_id)) => {
                        debug!(%local, %view_id, "leave acknowledged");
                        view_id
                    }
                    _ => return Err(GroupError::LeaveTimeout),
                }
            }
            None => return Ok(()),
        };

        let previous = self.ctx.views.current();
        let counter = previous.id().counter.max(remaining.counter) + 1;
        let alone = View::new(ViewId::new(local, counter), vec![local]);
        let installed = self.ctx.views.install(alone, &Digest::new())?;
        info!(%local, "left the group");
        self.on_installed(&previous, installed);
        Ok(())
    }

    /// Ask for a fresh view after this member discarded a window.
    pub(crate) async fn rejoin(&self) {
        let view = self.ctx.views.current();
        match view.coordinator() {
            Some(coordinator) if coordinator == self.ctx.local => self.spawn_change(Change::Refresh),
            Some(coordinator) => {
                self.ctx.send(coordinator, &GroupMessage::JoinRequest).await;
            }
            None => {}
        }
    }

    /// Mark `member` as gone; the acting coordinator reinstalls the view.
    pub(crate) fn on_member_gone(&self, member: MemberId) {
        let local = self.ctx.local;
        let view = self.ctx.views.current();
        if member == local || !view.contains(&member) {
            return;
        }
        let acting = {
            let mut excluded = self.excluded.lock().expect("excluded lock poisoned");
            excluded.insert(member);
            view.members().iter().find(|m| !excluded.contains(m)).copied()
        };
        debug!(%local, %member, acting = ?acting, "member excluded");
        if acting == Some(local) {
            self.spawn_change(Change::Exclude);
        }
    }

    fn is_coordinator(&self) -> bool {
        self.ctx.views.current().coordinator() == Some(self.ctx.local)
    }

    // -----------------------------------------------------------------------
    // Inbound messages
    // -----------------------------------------------------------------------

    async fn on_prepare(&self, from: MemberId, view: View, digest: Digest) {
        let view_id = view.id();
        let accepted = match self.ctx.views.prepare(view, digest) {
            Ok(()) => true,
            Err(e) => {
                debug!(local = %self.ctx.local, %view_id, %e, "refusing view");
                false
            }
        };
        let ack = GroupMessage::ViewAck { view_id, accepted };
        self.ctx.send(from, &ack).await;
    }

    fn on_commit(&self, view_id: ViewId) {
        let previous = self.ctx.views.current();
        if let Some(view) = self.ctx.views.commit(view_id) {
            self.on_installed(&previous, view);
        }
    }

    fn on_leave_request(&self, from: MemberId) {
        if !self.is_coordinator() {
            debug!(local = %self.ctx.local, %from, "leave request but not coordinator");
            return;
        }
        let Some(gms) = self.me.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            match gms.install_change(Change::Leave(from)).await {
                Ok(view) => {
                    let ack = GroupMessage::LeaveAck { view_id: view.id() };
                    gms.ctx.send(from, &ack).await;
                }
                Err(e) => warn!(local = %gms.ctx.local, %from, %e, "leave failed"),
            }
        });
    }
}

#[async_trait]
impl Stage for Gms {
    fn name(&self) -> &'static str {
        "gms"
    }

    async fn handle_up(&self, event: Event) -> Result<Option<Event>, GroupError> {
        match event {
            Event::Receive(Envelope { from, message }) => match message {
                GroupMessage::JoinRequest => {
                    if self.is_coordinator() {
                        self.spawn_change(Change::Join(from));
                    } else {
                        debug!(local = %self.ctx.local, %from, "join request but not coordinator");
                    }
                    Ok(None)
                }
                GroupMessage::LeaveRequest => {
                    self.on_leave_request(from);
                    Ok(None)
                }
                GroupMessage::LeaveAck { view_id } => {
                    if let Some(tx) = self.leave_ack.lock().expect("leave lock poisoned").take() {
                        let _ = tx.send(view_id);
                    }
                    Ok(None)
                }
                GroupMessage::PrepareView { view, digest } => {
                    self.on_prepare(from, view, digest).await;
                    Ok(None)
                }
                GroupMessage::ViewAck { view_id, accepted } => {
                    if let Some(tx) = self.acks.lock().expect("ack lock poisoned").get(&view_id) {
                        let _ = tx.send((from, accepted));
                    }
                    Ok(None)
                }
                GroupMessage::CommitView { view_id } => {
                    self.on_commit(view_id);
                    Ok(None)
                }
                GroupMessage::AbortView { view_id } => {
                    self.ctx.views.rollback(view_id);
                    Ok(None)
                }
                message => Ok(Some(Event::Receive(Envelope { from, message }))),
            },
            Event::Suspect(member) | Event::Crashed(member) => {
                self.on_member_gone(member);
                Ok(Some(event))
            }
            other => Ok(Some(other)),
        }
    }
}
