//! Flush: a barrier that stops sending in a set of members and drains their
//! windows to one agreed digest.
//!
//! The initiator runs two phases. First every member of the scope blocks its
//! application, closes its send gate and reports a digest of its windows.
//! The initiator reconciles the reports and sends the result back; each
//! member then waits until it has delivered everything up to the reconciled
//! positions (asking for retransmission where it has to) and confirms. The
//! barrier holds until [`FlushCoordinator::stop_flush`].
//!
//! A member is engaged in at most one flush at a time and refuses others.
//! A refused initiator releases whoever accepted and retries after a short
//! random pause, so overlapping flushes serialize while disjoint ones run in
//! parallel.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use gcast_digest::Digest;
use gcast_net::{Envelope, FlushId, GroupMessage};
use gcast_types::events::{FlushAborted, FlushCompleted, FlushStarted};
use gcast_types::{MemberId, Seqno};
use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::GroupError;
use crate::context::{Context, Upcall};
use crate::stage::{Event, Stage};

/// Progress of one flush driven by this member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushState {
    /// Nothing is being flushed.
    Idle,
    /// Block requests are out; digests are being collected.
    FlushRequested,
    /// Members are draining to the reconciled digest.
    FlushInProgress,
    /// Every member drained; the barrier holds until `stop_flush`.
    Flushed,
}

/// Result of [`FlushCoordinator::start_flush`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Every reachable member of the scope drained and is blocked.
    Flushed {
        /// The successful attempt.
        flush_id: FlushId,
        /// Digest captured at the barrier.
        digest: Digest,
        /// Members that acknowledged the drain.
        members: Vec<MemberId>,
    },
    /// A flush started here already covers these members.
    AlreadyFlushing,
    /// The deadline passed; the barrier was rolled back.
    TimedOut,
}

impl FlushOutcome {
    /// Whether the members are flushed once this returns.
    pub fn succeeded(&self) -> bool {
        !matches!(self, Self::TimedOut)
    }

    /// The captured digest of a completed flush.
    pub fn digest(&self) -> Option<&Digest> {
        match self {
            Self::Flushed { digest, .. } => Some(digest),
            _ => None,
        }
    }
}

/// Build the digest every member drains to.
///
/// A sender's own report of its window is authoritative. Senders that did
/// not report, crashed ones included, take the highest contiguous entry any
/// member reports; the rest is folded in with [`Digest::merge`]. Only
/// entries for `senders` are kept.
pub fn reconcile(replies: &[(MemberId, Digest)], senders: &[MemberId]) -> Digest {
    let mut reconciled = Digest::with_capacity(senders.len());
    for (member, digest) in replies {
        if let Some(own) = digest.get(member) {
            reconciled.add_entry(*member, own);
        }
    }

    let mut highest = Digest::new();
    for (_, digest) in replies {
        for (sender, entry) in digest.iter() {
            if reconciled.contains(sender) {
                continue;
            }
            match highest.get(sender) {
                Some(best) if (best.high, best.high_seen) >= (entry.high, entry.high_seen) => {}
                _ => highest.add_entry(*sender, *entry),
            }
        }
    }
    reconciled.merge(&highest);
    reconciled.retain(|sender| senders.contains(sender));
    reconciled
}

enum Reply {
    Digest {
        flush_id: FlushId,
        from: MemberId,
        digest: Digest,
    },
    Reject {
        flush_id: FlushId,
        from: MemberId,
        engaged: FlushId,
    },
    Drained {
        flush_id: FlushId,
        from: MemberId,
        digest: Digest,
    },
    Gone(MemberId),
}

struct ActiveFlush {
    scope: Vec<MemberId>,
    total: bool,
    flush_id: Option<FlushId>,
    state: FlushState,
    replies: mpsc::UnboundedSender<Reply>,
}

impl ActiveFlush {
    fn overlaps(&self, scope: &[MemberId], total: bool) -> bool {
        self.total || total || self.scope.iter().any(|m| scope.contains(m))
    }
}

struct Engagement {
    flush_id: FlushId,
    drain: Option<JoinHandle<()>>,
}

enum Collected {
    Digests(Vec<(MemberId, Digest)>),
    Rejected(MemberId, FlushId),
    TimedOut(Vec<MemberId>),
}

/// Both sides of the flush protocol for one member.
pub struct FlushCoordinator {
    ctx: Arc<Context>,
    slots: AtomicU64,
    attempts: AtomicU64,
    /// Flushes initiated here, keyed by a local slot number.
    active: Mutex<HashMap<u64, ActiveFlush>>,
    /// The flush this member participates in, if any.
    engagement: Arc<Mutex<Option<Engagement>>>,
}

impl FlushCoordinator {
    pub(crate) fn new(ctx: Arc<Context>) -> Self {
        Self {
            ctx,
            slots: AtomicU64::new(0),
            attempts: AtomicU64::new(0),
            active: Mutex::new(HashMap::new()),
            engagement: Arc::new(Mutex::new(None)),
        }
    }

    /// Flush `members`, or the whole view when `None`, within `timeout`.
    ///
    /// The drain covers every sender of the installed view, not only the
    /// flushed members, so messages of a member that crashed still reach
    /// every participant before the barrier holds.
    pub async fn start_flush(
        &self,
        members: Option<&[MemberId]>,
        timeout: Duration,
    ) -> Result<FlushOutcome, GroupError> {
        let local = self.ctx.local;
        let total = members.is_none();
        let mut scope = match members {
            Some(members) => members.to_vec(),
            None => self.ctx.views.current().members().to_vec(),
        };
        scope.sort();
        scope.dedup();
        if scope.is_empty() {
            return Err(GroupError::FlushFailed("empty flush scope".to_string()));
        }
        let mut senders = self.ctx.views.current().members().to_vec();
        senders.extend(scope.iter().copied());
        senders.sort();
        senders.dedup();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let slot = self.slots.fetch_add(1, Ordering::Relaxed);
        {
            let mut active = self.active.lock().expect("flush lock poisoned");
            if active.values().any(|f| f.overlaps(&scope, total)) {
                debug!(%local, "flush already active for these members");
                return Ok(FlushOutcome::AlreadyFlushing);
            }
            active.insert(
                slot,
                ActiveFlush {
                    scope: scope.clone(),
                    total,
                    flush_id: None,
                    state: FlushState::FlushRequested,
                    replies: tx,
                },
            );
        }

        info!(%local, members = scope.len(), total, "starting flush");
        self.ctx.events.emit(FlushStarted {
            initiator: local,
            members: scope.clone(),
            total,
        });

        let deadline = Instant::now() + timeout;
        match self.run(slot, &scope, &senders, total, &mut rx, deadline).await {
            Ok((flush_id, digest, members)) => {
                self.set_state(slot, FlushState::Flushed);
                self.ctx.views.record_flush_digest(digest.clone());
                info!(%local, %flush_id, members = members.len(), digest = %digest, "flush completed");
                self.ctx.events.emit(FlushCompleted {
                    initiator: local,
                    members: members.clone(),
                    digest_entries: digest.len(),
                });
                Ok(FlushOutcome::Flushed {
                    flush_id,
                    digest,
                    members,
                })
            }
            Err(reason) => {
                self.active.lock().expect("flush lock poisoned").remove(&slot);
                warn!(%local, %reason, "flush rolled back");
                self.ctx.events.emit(FlushAborted {
                    initiator: local,
                    reason,
                });
                Ok(FlushOutcome::TimedOut)
            }
        }
    }

    async fn run(
        &self,
        slot: u64,
        scope: &[MemberId],
        senders: &[MemberId],
        total: bool,
        rx: &mut mpsc::UnboundedReceiver<Reply>,
        deadline: Instant,
    ) -> Result<(FlushId, Digest, Vec<MemberId>), String> {
        let local = self.ctx.local;
        let mut attempt = 0u32;
        let replies = loop {
            attempt += 1;
            let flush_id = FlushId::new(local, self.attempts.fetch_add(1, Ordering::Relaxed) + 1);
            self.set_attempt(slot, flush_id);

            let request = GroupMessage::FlushRequest {
                flush_id,
                members: scope.to_vec(),
                total,
            };
            self.ctx.broadcast(scope, &request).await;

            match self.collect_digests(flush_id, scope, rx, deadline).await {
                Collected::Digests(replies) => break (flush_id, replies),
                Collected::Rejected(from, engaged) => {
                    self.release(flush_id, scope).await;
                    if Instant::now() >= deadline {
                        return Err(format!("{from} stayed engaged in flush {engaged}"));
                    }
                    let pause = Duration::from_millis(rand::rng().random_range(5..=25) * u64::from(attempt.min(8)));
                    debug!(%local, %flush_id, %from, %engaged, ?pause, "flush refused, retrying");
                    tokio::time::sleep_until((Instant::now() + pause).min(deadline)).await;
                }
                Collected::TimedOut(missing) => {
                    self.release(flush_id, scope).await;
                    return Err(format!("no flush digest from {missing:?}"));
                }
            }
        };

        let (flush_id, replies) = replies;
        let reconciled = reconcile(&replies, senders);
        let participants: Vec<MemberId> = replies.iter().map(|(m, _)| *m).collect();
        self.set_state(slot, FlushState::FlushInProgress);
        debug!(%local, %flush_id, digest = %reconciled, "flush digests reconciled");

        let msg = GroupMessage::FlushReconcile {
            flush_id,
            digest: reconciled.clone(),
        };
        self.ctx.broadcast(&participants, &msg).await;

        let mut pending: HashSet<MemberId> = participants.iter().copied().collect();
        let mut captured = reconciled;
        let mut drained = Vec::with_capacity(participants.len());
        while !pending.is_empty() {
            let reply = match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(reply)) => reply,
                _ => {
                    self.release(flush_id, scope).await;
                    return Err(format!("drain not confirmed by {pending:?}"));
                }
            };
            match reply {
                Reply::Drained {
                    flush_id: id,
                    from,
                    digest,
                } if id == flush_id => {
                    if pending.remove(&from) {
                        captured.merge(&digest);
                        drained.push(from);
                    }
                }
                Reply::Gone(member) => {
                    if pending.remove(&member) {
                        debug!(%local, %flush_id, %member, "participant gone during drain");
                    }
                }
                _ => {}
            }
        }
        drained.sort();
        Ok((flush_id, captured, drained))
    }

    async fn collect_digests(
        &self,
        flush_id: FlushId,
        scope: &[MemberId],
        rx: &mut mpsc::UnboundedReceiver<Reply>,
        deadline: Instant,
    ) -> Collected {
        let mut pending: HashSet<MemberId> = scope.iter().copied().collect();
        let mut replies = Vec::with_capacity(scope.len());
        while !pending.is_empty() {
            let reply = match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(reply)) => reply,
                _ => return Collected::TimedOut(pending.into_iter().collect()),
            };
            match reply {
                Reply::Digest {
                    flush_id: id,
                    from,
                    digest,
                } if id == flush_id => {
                    if pending.remove(&from) {
                        replies.push((from, digest));
                    }
                }
                Reply::Reject {
                    flush_id: id,
                    from,
                    engaged,
                } if id == flush_id => return Collected::Rejected(from, engaged),
                Reply::Gone(member) => {
                    if pending.remove(&member) {
                        debug!(local = %self.ctx.local, %flush_id, %member, "participant gone before reporting");
                    }
                }
                _ => {}
            }
        }
        Collected::Digests(replies)
    }

    /// Release the barrier of every completed flush started here that
    /// covers `members`, or of all of them when `None`.
    ///
    /// Returns the number of flushes released.
    pub async fn stop_flush(&self, members: Option<&[MemberId]>) -> usize {
        let released: Vec<(FlushId, Vec<MemberId>)> = {
            let mut active = self.active.lock().expect("flush lock poisoned");
            let slots: Vec<u64> = active
                .iter()
                .filter(|(_, f)| f.state == FlushState::Flushed)
                .filter(|(_, f)| members.is_none_or(|ms| f.scope.iter().any(|m| ms.contains(m))))
                .map(|(slot, _)| *slot)
                .collect();
            slots
                .into_iter()
                .filter_map(|slot| active.remove(&slot))
                .filter_map(|f| f.flush_id.map(|id| (id, f.scope)))
                .collect()
        };
        for (flush_id, scope) in &released {
            info!(local = %self.ctx.local, %flush_id, "stopping flush");
            self.release(*flush_id, scope).await;
        }
        released.len()
    }

    /// Flushes started here that have not been stopped.
    pub fn active(&self) -> Vec<(Option<FlushId>, FlushState)> {
        self.active
            .lock()
            .expect("flush lock poisoned")
            .values()
            .map(|f| (f.flush_id, f.state))
            .collect()
    }

    /// State of the most advanced flush started here.
    pub fn state(&self) -> FlushState {
        let rank = |s: &FlushState| match s {
            FlushState::Idle => 0,
            FlushState::FlushRequested => 1,
            FlushState::FlushInProgress => 2,
            FlushState::Flushed => 3,
        };
        self.active()
            .into_iter()
            .map(|(_, s)| s)
            .max_by_key(rank)
            .unwrap_or(FlushState::Idle)
    }

    /// The flush this member is blocked by, if any.
    pub fn engaged_in(&self) -> Option<FlushId> {
        self.engagement
            .lock()
            .expect("engagement lock poisoned")
            .as_ref()
            .map(|e| e.flush_id)
    }

    async fn release(&self, flush_id: FlushId, scope: &[MemberId]) {
        self.ctx.broadcast(scope, &GroupMessage::FlushStop { flush_id }).await;
    }

    fn set_attempt(&self, slot: u64, flush_id: FlushId) {
        if let Some(flush) = self.active.lock().expect("flush lock poisoned").get_mut(&slot) {
            flush.flush_id = Some(flush_id);
            flush.state = FlushState::FlushRequested;
        }
    }

    fn set_state(&self, slot: u64, state: FlushState) {
        if let Some(flush) = self.active.lock().expect("flush lock poisoned").get_mut(&slot) {
            flush.state = state;
        }
    }

    fn route(&self, flush_id: FlushId, reply: Reply) {
        let active = self.active.lock().expect("flush lock poisoned");
        match active.values().find(|f| f.flush_id == Some(flush_id)) {
            Some(flush) => {
                let _ = flush.replies.send(reply);
            }
            None => trace!(local = %self.ctx.local, %flush_id, "reply for unknown flush"),
        }
    }

    // -----------------------------------------------------------------------
    // Participant side
    // -----------------------------------------------------------------------

    async fn on_request(&self, flush_id: FlushId) {
        enum Decision {
            Engage,
            Repeat,
            Refuse(FlushId),
        }
        let decision = {
            let mut engagement = self.engagement.lock().expect("engagement lock poisoned");
            match engagement.as_ref() {
                Some(e) if e.flush_id == flush_id => Decision::Repeat,
                Some(e) => Decision::Refuse(e.flush_id),
                None => {
                    *engagement = Some(Engagement {
                        flush_id,
                        drain: None,
                    });
                    Decision::Engage
                }
            }
        };

        match decision {
            Decision::Refuse(engaged) => {
                debug!(local = %self.ctx.local, %flush_id, %engaged, "refusing flush");
                let msg = GroupMessage::FlushReject { flush_id, engaged };
                self.ctx.send(flush_id.initiator, &msg).await;
                return;
            }
            Decision::Engage => {
                debug!(local = %self.ctx.local, %flush_id, "blocked by flush");
                self.ctx.upcall(Upcall::Block);
                self.ctx.gate.close().await;
            }
            Decision::Repeat => {}
        }

        let msg = GroupMessage::FlushDigest {
            flush_id,
            digest: self.ctx.views.digest(),
        };
        self.ctx.send(flush_id.initiator, &msg).await;
    }

    fn on_reconcile(&self, flush_id: FlushId, digest: Digest) {
        let mut engagement = self.engagement.lock().expect("engagement lock poisoned");
        let Some(current) = engagement.as_mut().filter(|e| e.flush_id == flush_id) else {
            trace!(local = %self.ctx.local, %flush_id, "reconcile for a flush we are not in");
            return;
        };

        let mut targets: Vec<(MemberId, Seqno)> = Vec::with_capacity(digest.len());
        for (sender, entry) in digest.iter() {
            if let Some(window) = self.ctx.views.window(sender) {
                window.extend(entry.high);
                targets.push((*sender, entry.high));
            }
        }

        let ctx = self.ctx.clone();
        let engagement_ref = self.engagement.clone();
        let task = tokio::spawn(async move {
            let drained = ctx
                .wait_delivered(ctx.config.flush_timeout, || {
                    targets
                        .iter()
                        .all(|(sender, high)| ctx.views.window(sender).is_none_or(|w| w.drained_to(*high)))
                })
                .await;
            if !drained {
                warn!(local = %ctx.local, %flush_id, "could not drain to the flush digest");
                return;
            }
            let still_engaged = engagement_ref
                .lock()
                .expect("engagement lock poisoned")
                .as_ref()
                .is_some_and(|e| e.flush_id == flush_id);
            if still_engaged {
                debug!(local = %ctx.local, %flush_id, "drained");
                let msg = GroupMessage::FlushOk {
                    flush_id,
                    digest: ctx.views.digest(),
                };
                ctx.send(flush_id.initiator, &msg).await;
            }
        });
        if let Some(previous) = current.drain.replace(task) {
            previous.abort();
        }
    }

    fn on_stop(&self, flush_id: FlushId) {
        let released = {
            let mut engagement = self.engagement.lock().expect("engagement lock poisoned");
            if engagement.as_ref().is_some_and(|e| e.flush_id == flush_id) {
                engagement.take()
            } else {
                None
            }
        };
        if let Some(engagement) = released {
            self.unblock(engagement, "flush stopped");
        }
    }

    fn on_member_gone(&self, member: MemberId) {
        {
            let active = self.active.lock().expect("flush lock poisoned");
            for flush in active.values().filter(|f| f.scope.contains(&member)) {
                let _ = flush.replies.send(Reply::Gone(member));
            }
        }
        let released = {
            let mut engagement = self.engagement.lock().expect("engagement lock poisoned");
            if engagement.as_ref().is_some_and(|e| e.flush_id.initiator == member) {
                engagement.take()
            } else {
                None
            }
        };
        if let Some(engagement) = released {
            self.unblock(engagement, "flush initiator gone");
        }
    }

    fn unblock(&self, engagement: Engagement, reason: &str) {
        if let Some(drain) = engagement.drain {
            drain.abort();
        }
        self.ctx.gate.open();
        self.ctx.upcall(Upcall::Unblock);
        debug!(local = %self.ctx.local, flush_id = %engagement.flush_id, reason, "unblocked");
    }

    /// Drop any barrier this member holds, as on shutdown.
    pub(crate) fn release_all(&self) {
        let released = self.engagement.lock().expect("engagement lock poisoned").take();
        if let Some(engagement) = released {
            self.unblock(engagement, "released");
        }
        self.ctx.gate.open();
    }
}

#[async_trait]
impl Stage for FlushCoordinator {
    fn name(&self) -> &'static str {
        "flush"
    }

    async fn handle_up(&self, event: Event) -> Result<Option<Event>, GroupError> {
        match event {
            Event::Receive(Envelope { from, message }) => match message {
                GroupMessage::FlushRequest { flush_id, .. } => {
                    self.on_request(flush_id).await;
                    Ok(None)
                }
                GroupMessage::FlushDigest { flush_id, digest } => {
                    self.route(flush_id, Reply::Digest { flush_id, from, digest });
                    Ok(None)
                }
                GroupMessage::FlushReject { flush_id, engaged } => {
                    self.route(flush_id, Reply::Reject { flush_id, from, engaged });
                    Ok(None)
                }
                GroupMessage::FlushReconcile { flush_id, digest } => {
                    self.on_reconcile(flush_id, digest);
                    Ok(None)
                }
                GroupMessage::FlushOk { flush_id, digest } => {
                    self.route(flush_id, Reply::Drained { flush_id, from, digest });
                    Ok(None)
                }
                GroupMessage::FlushStop { flush_id } => {
                    self.on_stop(flush_id);
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
