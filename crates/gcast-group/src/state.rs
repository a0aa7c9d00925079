//! Application state transfer.
//!
//! A member that needs the group's application state, typically right after
//! joining, flushes the whole view so that every member has delivered the
//! same messages, then asks one provider for its state. The provider answers
//! with the state and the delivery positions it reflects; the requester moves
//! its windows up to those positions and installs the state before the flush
//! is released.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use gcast_digest::Digest;
use gcast_net::{Envelope, GroupMessage};
use gcast_types::MemberId;
use gcast_types::events::StateTransferred;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::GroupError;
use crate::context::{Context, Upcall};
use crate::flush::{FlushCoordinator, FlushOutcome};
use crate::stage::{Event, Stage};

/// Result of [`StateTransfer::get_state`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateOutcome {
    /// The provider's state was installed.
    Transferred {
        /// Member the state came from.
        provider: MemberId,
        /// Size of the installed state.
        bytes: usize,
    },
    /// The provider answered without state; nothing was installed.
    NoState(MemberId),
    /// This member is alone in its view.
    NoProvider,
}

struct Answer {
    from: MemberId,
    digest: Digest,
    state: Option<Bytes>,
}

/// Pick the member to fetch state from: `target` if given, otherwise the
/// oldest member of the view other than `local`.
pub fn choose_provider(members: &[MemberId], local: MemberId, target: Option<MemberId>) -> Option<MemberId> {
    match target {
        Some(target) => Some(target),
        None => members.iter().find(|m| **m != local).copied(),
    }
}

/// Both sides of the state transfer for one member.
pub struct StateTransfer {
    ctx: Arc<Context>,
    flush: Arc<FlushCoordinator>,
    requests: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<Answer>>>,
}

impl StateTransfer {
    pub(crate) fn new(ctx: Arc<Context>, flush: Arc<FlushCoordinator>) -> Self {
        Self {
            ctx,
            flush,
            requests: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch the application state from `target`, or from the oldest other
    /// member when `None`.
    ///
    /// The whole view stays flushed while the state is taken and installed.
    /// `timeout` bounds the wait for the provider's answer.
    pub async fn get_state(&self, target: Option<MemberId>, timeout: Duration) -> Result<StateOutcome, GroupError> {
        let local = self.ctx.local;
        let view = self.ctx.views.current();
        let Some(provider) = choose_provider(view.members(), local, target) else {
            debug!(%local, "no other member to fetch state from");
            return Ok(StateOutcome::NoProvider);
        };
        if provider == local || !view.contains(&provider) {
            return Err(GroupError::StateTransfer(format!(
                "{provider} cannot provide state in view {}",
                view.id()
            )));
        }

        let members = match self.flush.start_flush(None, self.ctx.config.flush_timeout).await? {
            FlushOutcome::Flushed { members, .. } => members,
            FlushOutcome::AlreadyFlushing => return Err(GroupError::FlushInProgress),
            FlushOutcome::TimedOut => {
                return Err(GroupError::StateTransfer("flush before transfer timed out".to_string()));
            }
        };

        let result = self.transfer(provider, timeout).await;
        self.flush.stop_flush(Some(&members)).await;
        result
    }

    async fn transfer(&self, provider: MemberId, timeout: Duration) -> Result<StateOutcome, GroupError> {
        let local = self.ctx.local;
        let request_id = self.requests.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("state lock poisoned")
            .insert(request_id, tx);

        info!(%local, %provider, request_id, "requesting state");
        let sent = self.ctx.send(provider, &GroupMessage::StateRequest { request_id }).await;
        let answer = if sent {
            tokio::time::timeout(timeout, rx).await.ok().and_then(|r| r.ok())
        } else {
            None
        };
        self.pending.lock().expect("state lock poisoned").remove(&request_id);

        let Some(answer) = answer else {
            warn!(%local, %provider, "state provider did not answer");
            return Err(GroupError::StateTransfer(format!("{provider} did not answer")));
        };
        if answer.from != provider {
            return Err(GroupError::StateTransfer(format!(
                "state for {provider} answered by {}",
                answer.from
            )));
        }
        let Some(state) = answer.state else {
            info!(%local, %provider, "provider has no state");
            self.ctx.events.emit(StateTransferred {
                provider,
                bytes: 0,
                windows_advanced: 0,
            });
            return Ok(StateOutcome::NoState(provider));
        };

        let windows_advanced = self.ctx.views.fast_forward(&answer.digest);
        let bytes = state.len();
        self.ctx.upcall(Upcall::SetState(state));
        info!(%local, %provider, bytes, windows_advanced, "state installed");
        self.ctx.events.emit(StateTransferred {
            provider,
            bytes,
            windows_advanced,
        });
        Ok(StateOutcome::Transferred { provider, bytes })
    }

    /// Answer a state request once the application handed out its state.
    fn provide(&self, from: MemberId, request_id: u64) {
        let ctx = self.ctx.clone();
        let (tx, rx) = oneshot::channel();
        ctx.upcall(Upcall::GetState(tx));
        tokio::spawn(async move {
            let state = match tokio::time::timeout(ctx.config.state_timeout, rx).await {
                Ok(Ok(state)) => state,
                _ => {
                    warn!(local = %ctx.local, %from, "application did not hand out its state");
                    return;
                }
            };
            // Positions the application has delivered up to, taken after it
            // produced the state.
            let digest = ctx.views.stability_digest();
            debug!(local = %ctx.local, %from, request_id, "sending state");
            let response = GroupMessage::StateResponse {
                request_id,
                digest,
                state,
            };
            ctx.send(from, &response).await;
        });
    }
}

#[async_trait]
impl Stage for StateTransfer {
    fn name(&self) -> &'static str {
        "state"
    }

    async fn handle_up(&self, event: Event) -> Result<Option<Event>, GroupError> {
        match event {
            Event::Receive(Envelope { from, message }) => match message {
                GroupMessage::StateRequest { request_id } => {
                    self.provide(from, request_id);
                    Ok(None)
                }
                GroupMessage::StateResponse {
                    request_id,
                    digest,
                    state,
                } => {
                    let tx = self.pending.lock().expect("state lock poisoned").remove(&request_id);
                    match tx {
                        Some(tx) => {
                            let _ = tx.send(Answer { from, digest, state });
                        }
                        None => debug!(local = %self.ctx.local, %from, request_id, "late state response"),
                    }
                    Ok(None)
                }
                message => Ok(Some(Event::Receive(Envelope { from, message }))),
            },
            other => Ok(Some(other)),
        }
    }
}
