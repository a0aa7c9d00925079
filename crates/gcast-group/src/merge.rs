//! Merging subgroups after a partition heals.
//!
//! Discovery reports the coordinators that can reach each other again. The
//! lowest of them leads: it collects every other coordinator's view and
//! digest, builds the merge view and the merged digest, and installs them
//! through an ordinary view change over the union of all members.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use gcast_digest::Digest;
use gcast_net::{Envelope, GroupMessage};
use gcast_types::events::{DigestMismatch, MergeCompleted};
use gcast_types::{MemberId, View};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::GroupError;
use crate::context::Context;
use crate::gms::{Change, Gms};
use crate::stage::{Event, Stage};

/// Result of [`MergeReconciler::on_coordinators_detected`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The merge view was installed.
    Merged(Arc<View>),
    /// This member does not coordinate its subgroup.
    NotCoordinator,
    /// Another coordinator has a lower id and leads the merge.
    NotLeader(MemberId),
    /// Every detected coordinator is already in this member's view.
    NothingToMerge,
}

/// A subgroup's answer to a merge request.
#[derive(Debug, Clone)]
pub struct SubgroupState {
    /// Coordinator that answered.
    pub coordinator: MemberId,
    /// Its current view.
    pub view: View,
    /// Its window snapshots.
    pub digest: Digest,
}

/// Build the merge membership: the leader's members first, then every other
/// subgroup's members in subgroup order, without duplicates.
pub fn merge_members(leader: &View, others: &[SubgroupState]) -> Vec<MemberId> {
    let mut members = leader.members().to_vec();
    for state in others {
        for member in state.view.members() {
            if !members.contains(member) {
                members.push(*member);
            }
        }
    }
    members
}

/// The merge stage.
pub struct MergeReconciler {
    ctx: Arc<Context>,
    gms: Arc<Gms>,
    merges: AtomicU64,
    pending: Mutex<HashMap<u64, mpsc::UnboundedSender<SubgroupState>>>,
}

impl MergeReconciler {
    pub(crate) fn new(ctx: Arc<Context>, gms: Arc<Gms>) -> Self {
        Self {
            ctx,
            gms,
            merges: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// React to discovery reporting `coordinators` as mutually reachable.
    pub async fn on_coordinators_detected(&self, coordinators: &[MemberId]) -> Result<MergeOutcome, GroupError> {
        let local = self.ctx.local;
        let view = self.ctx.views.current();
        if view.coordinator() != Some(local) {
            return Ok(MergeOutcome::NotCoordinator);
        }

        let mut others: Vec<MemberId> = coordinators
            .iter()
            .filter(|c| !view.contains(c))
            .copied()
            .collect();
        others.sort();
        others.dedup();
        if others.is_empty() {
            return Ok(MergeOutcome::NothingToMerge);
        }
        if let Some(leader) = others.first()
            && *leader < local
        {
            debug!(%local, %leader, "not merge leader");
            return Ok(MergeOutcome::NotLeader(*leader));
        }

        info!(%local, coordinators = ?others, "leading merge");
        let subgroups = self.collect(&others).await;
        let excluded: Vec<MemberId> = others
            .iter()
            .filter(|c| !subgroups.iter().any(|s| s.coordinator == **c))
            .copied()
            .collect();
        if subgroups.is_empty() {
            return Err(GroupError::MergeFailed(format!(
                "no subgroup coordinator answered out of {}",
                others.len()
            )));
        }
        if !excluded.is_empty() {
            warn!(%local, ?excluded, "coordinators did not answer, merging without them");
        }

        let mut digest = self.ctx.views.digest();
        for state in &subgroups {
            let expected: Digest = state
                .view
                .members()
                .iter()
                .map(|m| (*m, state.digest.get(m).unwrap_or_default()))
                .collect();
            if !state.digest.same_senders(&expected) {
                warn!(
                    %local,
                    coordinator = %state.coordinator,
                    view_members = state.view.size(),
                    digest_senders = state.digest.len(),
                    theirs = state.digest.completeness(),
                    ours = digest.completeness(),
                    "subgroup digest does not match its view"
                );
                self.ctx.events.emit(DigestMismatch {
                    coordinator: state.coordinator,
                    view_members: state.view.size(),
                    digest_senders: state.digest.len(),
                });
                // Keep the widest range known for every sender.
                digest.merge_highest(&state.digest);
            } else {
                digest.merge(&state.digest);
            }
        }

        let members = merge_members(&view, &subgroups);
        let mut views: Vec<View> = Vec::with_capacity(subgroups.len() + 1);
        views.push((*view).clone());
        views.extend(subgroups.iter().map(|s| s.view.clone()));

        let merged = self
            .gms
            .install_change(Change::Merge {
                members,
                subgroups: views,
                digest,
            })
            .await?;

        info!(%local, view = %merged, "merge completed");
        self.ctx.events.emit(MergeCompleted {
            view_id: merged.id(),
            subgroups: subgroups.len() + 1,
            excluded,
        });
        Ok(MergeOutcome::Merged(merged))
    }

    /// Ask every coordinator for its state; answers are ordered by coordinator.
    async fn collect(&self, coordinators: &[MemberId]) -> Vec<SubgroupState> {
        let merge_id = self.merges.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.pending
            .lock()
            .expect("merge lock poisoned")
            .insert(merge_id, tx);

        self.ctx
            .broadcast(coordinators, &GroupMessage::MergeRequest { merge_id })
            .await;

        let deadline = Instant::now() + self.ctx.config.merge_timeout;
        let mut states: Vec<SubgroupState> = Vec::with_capacity(coordinators.len());
        while states.len() < coordinators.len() {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(state)) => {
                    if coordinators.contains(&state.coordinator)
                        && !states.iter().any(|s| s.coordinator == state.coordinator)
                    {
                        states.push(state);
                    }
                }
                _ => break,
            }
        }
        self.pending.lock().expect("merge lock poisoned").remove(&merge_id);
        states.sort_by_key(|s| s.coordinator);
        states
    }
}

#[async_trait]
impl Stage for MergeReconciler {
    fn name(&self) -> &'static str {
        "merge"
    }

    async fn handle_up(&self, event: Event) -> Result<Option<Event>, GroupError> {
        match event {
            Event::Receive(Envelope { from, message }) => match message {
                GroupMessage::MergeRequest { merge_id } => {
                    let view = self.ctx.views.current();
                    if view.coordinator() != Some(self.ctx.local) {
                        debug!(local = %self.ctx.local, %from, "merge request but not coordinator");
                        return Ok(None);
                    }
                    let response = GroupMessage::MergeResponse {
                        merge_id,
                        view: (*view).clone(),
                        digest: self.ctx.views.digest(),
                    };
                    self.ctx.send(from, &response).await;
                    Ok(None)
                }
                GroupMessage::MergeResponse {
                    merge_id,
                    view,
                    digest,
                } => {
                    if let Some(tx) = self.pending.lock().expect("merge lock poisoned").get(&merge_id) {
                        let _ = tx.send(SubgroupState {
                            coordinator: from,
                            view,
                            digest,
                        });
                    }
                    Ok(None)
                }
                message => Ok(Some(Event::Receive(Envelope { from, message }))),
            },
            other => Ok(Some(other)),
        }
    }
}
