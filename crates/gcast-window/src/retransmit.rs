//! Retransmission request scheduling.
//!
//! A gap is not asked for the moment it appears: out-of-order arrival is
//! normal and usually closes by itself. The first request goes out after
//! the first backoff step; each further attempt waits for the next step,
//! and the last step repeats until the gap closes or the sender leaves the
//! view. Progress (the first missing seqno moving up) restarts the schedule.

use std::collections::HashMap;
use std::time::Duration;

use gcast_types::{MemberId, Seqno};
use tokio::time::Instant;
use tracing::trace;

use crate::SeqRange;

/// Fallback delay when the configured schedule is empty.
const DEFAULT_BACKOFF: Duration = Duration::from_millis(100);

fn backoff_delay(backoff: &[Duration], attempt: u32) -> Duration {
    backoff
        .get(attempt as usize)
        .or(backoff.last())
        .copied()
        .unwrap_or(DEFAULT_BACKOFF)
}

/// One retransmission request that is due now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetransmitRequest {
    /// Sender whose messages are missing.
    pub sender: MemberId,
    /// Missing ranges to ask for.
    pub ranges: Vec<SeqRange>,
    /// Attempt number for the current gap, starting at 1.
    pub attempt: u32,
}

#[derive(Debug)]
struct PendingGap {
    first_missing: Seqno,
    attempts: u32,
    next_due: Instant,
}

/// Tracks outstanding gaps per sender and paces requests for them.
#[derive(Debug)]
pub struct Retransmitter {
    backoff: Vec<Duration>,
    pending: HashMap<MemberId, PendingGap>,
}

impl Retransmitter {
    /// Create a retransmitter with the given backoff schedule.
    pub fn new(backoff: Vec<Duration>) -> Self {
        Self {
            backoff,
            pending: HashMap::new(),
        }
    }

    /// Delay before attempt number `attempt + 1`.
    pub fn delay(&self, attempt: u32) -> Duration {
        backoff_delay(&self.backoff, attempt)
    }

    /// Feed the current gaps of every window and collect the requests due at `now`.
    ///
    /// Senders absent from `gaps`, or with no missing range, are forgotten.
    pub fn due<I>(&mut self, now: Instant, gaps: I) -> Vec<RetransmitRequest>
    where
        I: IntoIterator<Item = (MemberId, Vec<SeqRange>)>,
    {
        let mut requests = Vec::new();
        let mut seen = Vec::new();

        for (sender, ranges) in gaps {
            let Some(first) = ranges.first().map(|r| r.from) else {
                continue;
            };
            seen.push(sender);

            let first_delay = backoff_delay(&self.backoff, 0);
            let gap = self.pending.entry(sender).or_insert_with(|| PendingGap {
                first_missing: first,
                attempts: 0,
                next_due: now + first_delay,
            });

            if gap.first_missing != first {
                trace!(%sender, from = gap.first_missing, to = first, "gap progressed, restarting backoff");
                *gap = PendingGap {
                    first_missing: first,
                    attempts: 0,
                    next_due: now + first_delay,
                };
            }

            if now >= gap.next_due {
                gap.attempts += 1;
                gap.next_due = now + backoff_delay(&self.backoff, gap.attempts);
                let attempt = gap.attempts;
                requests.push(RetransmitRequest {
                    sender,
                    ranges,
                    attempt,
                });
            }
        }

        self.pending.retain(|sender, _| seen.contains(sender));
        requests
    }

    /// Forget the gap state of `sender`.
    pub fn forget(&mut self, sender: &MemberId) {
        self.pending.remove(sender);
    }

    /// Number of senders with an outstanding gap.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}
