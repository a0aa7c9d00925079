//! The protocol stack as an ordered pipeline of stages.
//!
//! Inbound traffic and failure-detector notifications travel up from the
//! bottom stage; application sends travel down from the top. A stage either
//! consumes an event (returns `None`) or hands it, possibly transformed, to
//! the next stage.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use gcast_net::Envelope;
use gcast_types::{MemberId, Seqno};
use tracing::trace;

use crate::GroupError;

/// Everything that moves through the pipeline.
#[derive(Debug, Clone)]
pub enum Event {
    /// A message arrived from the network.
    Receive(Envelope),
    /// The application multicasts a payload.
    Multicast(Bytes),
    /// A multicast left the bottom of the stack with this seqno.
    Sent(Seqno),
    /// The failure detector suspects a member.
    Suspect(MemberId),
    /// The failure detector declared a member crashed.
    Crashed(MemberId),
}

impl Event {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Receive(env) => env.message.kind(),
            Self::Multicast(_) => "multicast",
            Self::Sent(_) => "sent",
            Self::Suspect(_) => "suspect",
            Self::Crashed(_) => "crashed",
        }
    }
}

/// One layer of the protocol stack.
#[async_trait]
pub trait Stage: Send + Sync {
    /// Name for logs.
    fn name(&self) -> &'static str;

    /// Handle an event travelling towards the application.
    async fn handle_up(&self, event: Event) -> Result<Option<Event>, GroupError> {
        Ok(Some(event))
    }

    /// Handle an event travelling towards the network.
    async fn handle_down(&self, event: Event) -> Result<Option<Event>, GroupError> {
        Ok(Some(event))
    }
}

/// Stages ordered from the network (first) to the application (last).
#[derive(Clone)]
pub struct Pipeline {
    stages: Vec<Arc<dyn Stage>>,
}

impl Pipeline {
    /// Build a pipeline; `stages[0]` sits closest to the network.
    pub fn new(stages: Vec<Arc<dyn Stage>>) -> Self {
        Self { stages }
    }

    /// Pass `event` up through every stage.
    ///
    /// Returns the event if no stage consumed it.
    pub async fn up(&self, event: Event) -> Result<Option<Event>, GroupError> {
        let mut event = event;
        for stage in &self.stages {
            match stage.handle_up(event).await? {
                Some(next) => event = next,
                None => return Ok(None),
            }
        }
        trace!(kind = event.kind(), "event reached the top of the stack");
        Ok(Some(event))
    }

    /// Pass `event` down through every stage.
    ///
    /// Returns what left the bottom of the stack, if anything.
    pub async fn down(&self, event: Event) -> Result<Option<Event>, GroupError> {
        let mut event = event;
        for stage in self.stages.iter().rev() {
            match stage.handle_down(event).await? {
                Some(next) => event = next,
                None => return Ok(None),
            }
        }
        Ok(Some(event))
    }

    /// Stage names from bottom to top.
    pub fn names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }
}
