//! Reliable FIFO delivery with negative acknowledgements.
//!
//! Every sender numbers its multicasts; receivers buffer them in one
//! [`SeqWindow`](gcast_window::SeqWindow) per sender and ask for missing
//! ranges on a backoff schedule. Delivered messages stay buffered until
//! stability gossip shows every member delivered them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use gcast_digest::Digest;
use gcast_net::{Envelope, GroupMessage};
use gcast_types::events::{GapDetected, MissingMessageReceived, RetransmitRequested};
use gcast_types::{MemberId, Seqno, View, ViewId};
use gcast_window::{Retransmitter, SeqRange, WindowError};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::GroupError;
use crate::context::Context;
use crate::stage::{Event, Stage};

struct Stability {
    view_id: ViewId,
    /// Latest stability report of every member of the current view.
    reports: HashMap<MemberId, Digest>,
    /// Last report of members that left, kept until `departed_retention`.
    departed: HashMap<MemberId, (Digest, Instant)>,
}

/// The reliable-delivery stage, closest to the network.
pub struct NakStage {
    ctx: Arc<Context>,
    last_seqno: Mutex<Seqno>,
    retransmitter: Mutex<Retransmitter>,
    stability: Mutex<Stability>,
}

impl NakStage {
    pub(crate) fn new(ctx: Arc<Context>) -> Self {
        let view_id = ctx.views.current().id();
        let retransmitter = Retransmitter::new(ctx.config.retransmit_backoff.clone());
        Self {
            ctx,
            last_seqno: Mutex::new(0),
            retransmitter: Mutex::new(retransmitter),
            stability: Mutex::new(Stability {
                view_id,
                reports: HashMap::new(),
                departed: HashMap::new(),
            }),
        }
    }

    async fn multicast(&self, payload: Bytes) -> Result<Seqno, GroupError> {
        let _pass = self.ctx.gate.enter(self.ctx.config.send_policy).await?;
        let local = self.ctx.local;
        let view = self.ctx.views.current();
        let own = self
            .ctx
            .views
            .window(&local)
            .ok_or(GroupError::NotMember(local))?;

        let seqno = {
            let mut last = self.last_seqno.lock().expect("seqno lock poisoned");
            let seqno = (*last).max(own.counters().high_received) + 1;
            *last = seqno;
            own.insert(seqno, payload.clone());
            seqno
        };
        self.ctx.wake_delivery();

        let others: Vec<MemberId> = view.members().iter().filter(|m| **m != local).copied().collect();
        let msg = GroupMessage::Data {
            sender: local,
            seqno,
            payload,
            retransmit: false,
        };
        self.ctx.broadcast(&others, &msg).await;
        trace!(%local, seqno, receivers = others.len(), "multicast sent");
        Ok(seqno)
    }

    fn on_data(&self, sender: MemberId, seqno: Seqno, payload: Bytes, retransmit: bool) {
        let Some(window) = self.ctx.views.window(&sender) else {
            trace!(local = %self.ctx.local, %sender, seqno, "no window for sender, dropping");
            return;
        };
        let insertion = window.insert(seqno, payload);
        if let Some(gap) = insertion.gap {
            debug!(local = %self.ctx.local, %sender, missing = %gap, "gap detected");
            self.ctx.events.emit(GapDetected {
                sender,
                from: gap.from,
                to: gap.to,
            });
        }
        if insertion.filled_gap {
            trace!(local = %self.ctx.local, %sender, seqno, retransmit, "missing message received");
            self.ctx
                .events
                .emit(MissingMessageReceived { sender, seqno });
        }
        if insertion.contiguous_advanced {
            self.ctx.wake_delivery();
        }
    }

    async fn serve_retransmission(&self, requester: MemberId, sender: MemberId, ranges: &[SeqRange]) {
        let Some(window) = self.ctx.views.window(&sender) else {
            return;
        };
        let mut served = 0usize;
        for range in ranges {
            for (seqno, payload) in window.get_range(range.from, range.to) {
                let msg = GroupMessage::Data {
                    sender,
                    seqno,
                    payload,
                    retransmit: true,
                };
                if self.ctx.send(requester, &msg).await {
                    served += 1;
                }
            }
        }
        trace!(local = %self.ctx.local, %requester, %sender, served, "served retransmission");
    }

    /// Record a stability report and collect what every member delivered.
    fn on_stability(&self, from: MemberId, view_id: ViewId, digest: Digest) {
        let view = self.ctx.views.current();
        if view.id() != view_id || !view.contains(&from) {
            return;
        }

        // Anything a member has seen exists; make the unseen tail requestable.
        for (sender, entry) in digest.iter() {
            if let Some(window) = self.ctx.views.window(sender)
                && window.extend(entry.high_seen)
            {
                trace!(local = %self.ctx.local, %sender, high = entry.high_seen, "window extended by gossip");
            }
        }

        let mut stability = self.stability.lock().expect("stability lock poisoned");
        if stability.view_id != view_id {
            stability.view_id = view_id;
            stability.reports.clear();
        }
        stability.reports.insert(from, digest);
        if !view.members().iter().all(|m| stability.reports.contains_key(m)) {
            return;
        }

        let retention = self.ctx.config.departed_retention;
        stability.departed.retain(|_, (_, at)| at.elapsed() < retention);

        for window in self.ctx.views.windows() {
            let sender = window.sender();
            let mut stable: Option<Seqno> = None;
            let mut complete = true;
            for report in stability.reports.values() {
                match report.high_seqno_at(&sender) {
                    Some(delivered) => stable = Some(stable.map_or(delivered, |s| s.min(delivered))),
                    None => complete = false,
                }
            }
            for (report, _) in stability.departed.values() {
                if let Some(delivered) = report.high_seqno_at(&sender) {
                    stable = Some(stable.map_or(delivered, |s| s.min(delivered)));
                }
            }
            if complete && let Some(seqno) = stable {
                window.stable(seqno);
            }
        }
    }

    /// Gossip this member's stability digest to the view.
    pub(crate) async fn gossip_stability(&self) {
        let view = self.ctx.views.current();
        let digest = self.ctx.views.stability_digest();
        self.on_stability(self.ctx.local, view.id(), digest.clone());

        let others: Vec<MemberId> = view
            .members()
            .iter()
            .filter(|m| **m != self.ctx.local)
            .copied()
            .collect();
        let msg = GroupMessage::StableGossip {
            view_id: view.id(),
            digest,
        };
        self.ctx.broadcast(&others, &msg).await;
    }

    /// Ask for every missing range whose backoff delay has passed.
    ///
    /// The first attempt goes to the original sender; later attempts go to
    /// every other member, since any of them may still buffer the message.
    pub(crate) async fn request_missing(&self) {
        let local = self.ctx.local;
        let view = self.ctx.views.current();
        let gaps: Vec<(MemberId, Vec<SeqRange>)> = self
            .ctx
            .views
            .windows()
            .iter()
            .filter(|w| w.sender() != local)
            .map(|w| (w.sender(), w.missing_ranges()))
            .collect();
        let requests = self
            .retransmitter
            .lock()
            .expect("retransmitter lock poisoned")
            .due(Instant::now(), gaps);

        for request in requests {
            let targets: Vec<MemberId> = if request.attempt == 1 && view.contains(&request.sender) {
                vec![request.sender]
            } else {
                view.members().iter().filter(|m| **m != local).copied().collect()
            };
            let (from, to) = match (request.ranges.first(), request.ranges.last()) {
                (Some(first), Some(last)) => (first.from, last.to),
                _ => continue,
            };
            debug!(
                %local,
                sender = %request.sender,
                from,
                to,
                attempt = request.attempt,
                targets = targets.len(),
                "requesting retransmission"
            );
            let msg = GroupMessage::XmitRequest {
                sender: request.sender,
                ranges: request.ranges,
            };
            for target in targets {
                self.ctx.events.emit(RetransmitRequested {
                    sender: request.sender,
                    target,
                    from,
                    to,
                    attempt: request.attempt,
                });
                self.ctx.send(target, &msg).await;
            }
        }
    }

    /// Check every window's invariants.
    pub(crate) fn verify_windows(&self) -> Vec<(MemberId, WindowError)> {
        self.ctx
            .views
            .windows()
            .iter()
            .filter_map(|w| w.verify().err().map(|e| (w.sender(), e)))
            .collect()
    }

    /// Carry stability state across a view change.
    pub(crate) fn on_view_installed(&self, previous: &View, view: &View) {
        let delta = view.diff(previous);
        {
            let mut stability = self.stability.lock().expect("stability lock poisoned");
            for member in &delta.left {
                if let Some(report) = stability.reports.remove(member) {
                    stability.departed.insert(*member, (report, Instant::now()));
                }
            }
            for member in &delta.joined {
                stability.departed.remove(member);
            }
            stability.reports.clear();
            stability.view_id = view.id();
        }
        let mut retransmitter = self.retransmitter.lock().expect("retransmitter lock poisoned");
        for member in &delta.left {
            retransmitter.forget(member);
        }
    }
}

#[async_trait]
impl Stage for NakStage {
    fn name(&self) -> &'static str {
        "nak"
    }

    async fn handle_up(&self, event: Event) -> Result<Option<Event>, GroupError> {
        match event {
            Event::Receive(Envelope { from, message }) => match message {
                GroupMessage::Data {
                    sender,
                    seqno,
                    payload,
                    retransmit,
                } => {
                    self.on_data(sender, seqno, payload, retransmit);
                    Ok(None)
                }
                GroupMessage::XmitRequest { sender, ranges } => {
                    self.serve_retransmission(from, sender, &ranges).await;
                    Ok(None)
                }
                GroupMessage::StableGossip { view_id, digest } => {
                    self.on_stability(from, view_id, digest);
                    Ok(None)
                }
                message => Ok(Some(Event::Receive(Envelope { from, message }))),
            },
            Event::Suspect(member) | Event::Crashed(member) => {
                self.retransmitter
                    .lock()
                    .expect("retransmitter lock poisoned")
                    .forget(&member);
                Ok(Some(event))
            }
            other => Ok(Some(other)),
        }
    }

    async fn handle_down(&self, event: Event) -> Result<Option<Event>, GroupError> {
        match event {
            Event::Multicast(payload) => {
                let seqno = self.multicast(payload).await?;
                Ok(Some(Event::Sent(seqno)))
            }
            other => Ok(Some(other)),
        }
    }
}
