//! The sliding receive window for one sender.
//!
//! Counters always satisfy `low <= high_delivered <= high_contiguous <= high_received`:
//!
//! ```text
//!   low      delivered   contiguous         received
//!    |            |           |                  |
//!    [ retained   ][ ready    ][ gaps + buffered ]
//! ```
//!
//! Everything in `(low, high_contiguous]` is buffered. Messages above
//! `high_contiguous` are buffered sparsely until the gaps below them close.
//! Delivered messages stay buffered (to answer retransmission requests)
//! until [`SeqWindow::stable`] collects them.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;

use gcast_digest::DigestEntry;
use gcast_types::{MemberId, Seqno};
use serde::{Deserialize, Serialize};

use crate::WindowError;

/// Inclusive range of seqnos.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SeqRange {
    /// First seqno.
    pub from: Seqno,
    /// Last seqno (inclusive).
    pub to: Seqno,
}

impl SeqRange {
    /// Create a range. `from` must not exceed `to`.
    pub fn new(from: Seqno, to: Seqno) -> Self {
        Self { from, to }
    }

    /// Number of seqnos covered.
    pub fn len(&self) -> u64 {
        self.to - self.from + 1
    }

    /// Always false; a range covers at least one seqno.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Iterate over the covered seqnos.
    pub fn iter(&self) -> impl Iterator<Item = Seqno> {
        self.from..=self.to
    }
}

impl fmt::Display for SeqRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.from == self.to {
            write!(f, "{}", self.from)
        } else {
            write!(f, "{}-{}", self.from, self.to)
        }
    }
}

/// Detailed result of [`SeqWindow::insert`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Insertion {
    /// The message was new and is now buffered.
    pub stored: bool,
    /// `high_contiguous` moved.
    pub contiguous_advanced: bool,
    /// `high_received` moved.
    pub received_advanced: bool,
    /// The message opened a new gap below it.
    pub gap: Option<SeqRange>,
    /// The message filled a seqno that was previously reported missing.
    pub filled_gap: bool,
}

impl Insertion {
    /// Whether any counter changed.
    pub fn changed(&self) -> bool {
        self.contiguous_advanced || self.received_advanced
    }
}

/// Point-in-time copy of a window's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowCounters {
    /// Lowest retained seqno.
    pub low: Seqno,
    /// Highest delivered seqno.
    pub high_delivered: Seqno,
    /// Highest seqno with no gap below it.
    pub high_contiguous: Seqno,
    /// Highest seqno received or announced.
    pub high_received: Seqno,
}

struct WindowState<T> {
    low: Seqno,
    high_delivered: Seqno,
    high_contiguous: Seqno,
    high_received: Seqno,
    buffer: BTreeMap<Seqno, T>,
}

impl<T> WindowState<T> {
    fn at(offset: Seqno) -> Self {
        Self {
            low: offset,
            high_delivered: offset,
            high_contiguous: offset,
            high_received: offset,
            buffer: BTreeMap::new(),
        }
    }

    fn counters(&self) -> WindowCounters {
        WindowCounters {
            low: self.low,
            high_delivered: self.high_delivered,
            high_contiguous: self.high_contiguous,
            high_received: self.high_received,
        }
    }
}

/// Reliable-delivery window for the messages of one sender.
///
/// All operations take `&self`; the counters and buffer sit behind one
/// short-lived lock per window, never held across an application callback.
/// There must be a single consumer calling [`SeqWindow::remove_ready`].
pub struct SeqWindow<T> {
    sender: MemberId,
    offset: Seqno,
    state: Mutex<WindowState<T>>,
}

impl<T: Clone> SeqWindow<T> {
    /// Create a window whose counters all start at `offset`.
    ///
    /// The first message accepted is `offset + 1`.
    pub fn new(sender: MemberId, offset: Seqno) -> Self {
        Self {
            sender,
            offset,
            state: Mutex::new(WindowState::at(offset)),
        }
    }

    /// The sender this window belongs to.
    pub fn sender(&self) -> MemberId {
        self.sender
    }

    /// The starting offset.
    pub fn offset(&self) -> Seqno {
        self.offset
    }

    /// Insert a message. Returns whether any counter changed.
    pub fn add(&self, seqno: Seqno, message: T) -> bool {
        self.insert(seqno, message).changed()
    }

    /// Insert a message and report exactly what changed.
    ///
    /// Seqnos at or below `low`, at or below `high_contiguous`, or already
    /// buffered are dropped without effect.
    pub fn insert(&self, seqno: Seqno, message: T) -> Insertion {
        let mut s = self.lock();
        let mut outcome = Insertion::default();

        if seqno <= s.low || seqno <= s.high_contiguous || s.buffer.contains_key(&seqno) {
            return outcome;
        }

        s.buffer.insert(seqno, message);
        outcome.stored = true;

        if seqno > s.high_received {
            if seqno > s.high_received + 1 {
                outcome.gap = Some(SeqRange::new(s.high_received + 1, seqno - 1));
            }
            s.high_received = seqno;
            outcome.received_advanced = true;
        } else {
            outcome.filled_gap = true;
        }

        if seqno == s.high_contiguous + 1 {
            let mut next = seqno;
            while let Some(after) = next.checked_add(1)
                && s.buffer.contains_key(&after)
            {
                next = after;
            }
            s.high_contiguous = next;
            outcome.contiguous_advanced = true;
        }

        outcome
    }

    /// Deliver the next message in order, if one is ready.
    ///
    /// The message stays buffered for retransmission until it is stable.
    pub fn remove_ready(&self) -> Option<(Seqno, T)> {
        let mut s = self.lock();
        if s.high_delivered >= s.high_contiguous {
            return None;
        }
        let next = s.high_delivered + 1;
        let message = s.buffer.get(&next).cloned()?;
        s.high_delivered = next;
        Some((next, message))
    }

    /// Deliver up to `max` ready messages (all of them when `None`).
    pub fn remove_many(&self, max: Option<usize>) -> Vec<(Seqno, T)> {
        let mut s = self.lock();
        let ready = (s.high_contiguous - s.high_delivered) as usize;
        let count = max.map_or(ready, |m| m.min(ready));
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            let next = s.high_delivered + 1;
            match s.buffer.get(&next) {
                Some(message) => {
                    out.push((next, message.clone()));
                    s.high_delivered = next;
                }
                None => break,
            }
        }
        out
    }

    /// Buffered message with `seqno`, delivered or not.
    pub fn get(&self, seqno: Seqno) -> Option<T> {
        self.lock().buffer.get(&seqno).cloned()
    }

    /// Buffered messages within `[from, to]`, in order. Absent seqnos are skipped.
    pub fn get_range(&self, from: Seqno, to: Seqno) -> Vec<(Seqno, T)> {
        if from > to {
            return Vec::new();
        }
        self.lock()
            .buffer
            .range(from..=to)
            .map(|(seqno, message)| (*seqno, message.clone()))
            .collect()
    }

    /// Gaps between `high_contiguous` and `high_received`.
    pub fn missing_ranges(&self) -> Vec<SeqRange> {
        let s = self.lock();
        let mut ranges = Vec::new();
        if s.high_contiguous >= s.high_received {
            return ranges;
        }
        let mut expected = s.high_contiguous + 1;
        for seqno in s.buffer.range(expected..=s.high_received).map(|(k, _)| *k) {
            if seqno > expected {
                ranges.push(SeqRange::new(expected, seqno - 1));
            }
            match seqno.checked_add(1) {
                Some(next) => expected = next,
                None => return ranges,
            }
        }
        if expected <= s.high_received {
            ranges.push(SeqRange::new(expected, s.high_received));
        }
        ranges
    }

    /// Number of missing seqnos.
    pub fn missing_count(&self) -> u64 {
        self.missing_ranges().iter().map(SeqRange::len).sum()
    }

    /// Collect messages everyone has delivered.
    ///
    /// `low` moves to `min(seqno, high_delivered)`; it never moves backward.
    pub fn stable(&self, seqno: Seqno) {
        let mut s = self.lock();
        let new_low = seqno.min(s.high_delivered);
        if new_low <= s.low {
            return;
        }
        s.low = new_low;
        let kept = s.buffer.split_off(&new_low);
        s.buffer = kept;
    }

    /// Count everything up to `seqno` as delivered without delivering it.
    ///
    /// For a member that installed state which already reflects those
    /// messages. Buffered messages at or below `seqno` are dropped and `low`
    /// follows, since this window can no longer serve them. Returns whether
    /// the window moved.
    pub fn fast_forward(&self, seqno: Seqno) -> bool {
        let mut s = self.lock();
        if seqno <= s.high_delivered {
            return false;
        }
        s.high_delivered = seqno;
        s.low = s.low.max(seqno);
        s.buffer = s.buffer.split_off(&seqno);
        s.buffer.remove(&seqno);

        let mut next = s.high_contiguous.max(seqno);
        while let Some(after) = next.checked_add(1)
            && s.buffer.contains_key(&after)
        {
            next = after;
        }
        s.high_contiguous = next;
        s.high_received = s.high_received.max(next);
        true
    }

    /// Raise `high_received` to a seqno announced by a digest.
    ///
    /// Makes the unseen tail visible to [`SeqWindow::missing_ranges`].
    /// Returns whether the window grew.
    pub fn extend(&self, high: Seqno) -> bool {
        let mut s = self.lock();
        if high <= s.high_received {
            return false;
        }
        s.high_received = high;
        true
    }

    /// `(low, high_contiguous, high_received)` for a flush digest.
    pub fn snapshot(&self) -> DigestEntry {
        let s = self.lock();
        DigestEntry::new(s.low, s.high_contiguous, s.high_received)
    }

    /// `(low, high_delivered, high_received)` for stability gossip.
    pub fn stability_entry(&self) -> DigestEntry {
        let s = self.lock();
        DigestEntry::new(s.low, s.high_delivered, s.high_received)
    }

    /// Current counters.
    pub fn counters(&self) -> WindowCounters {
        self.lock().counters()
    }

    /// Whether everything received has been delivered and nothing is missing.
    pub fn is_drained(&self) -> bool {
        let s = self.lock();
        s.high_delivered == s.high_received
    }

    /// Whether delivery reached `target`.
    pub fn drained_to(&self, target: Seqno) -> bool {
        self.lock().high_delivered >= target
    }

    /// Number of buffered messages.
    pub fn len(&self) -> usize {
        self.lock().buffer.len()
    }

    /// Whether nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.lock().buffer.is_empty()
    }

    /// Reinitialize every counter to the offset and drop the buffer.
    pub fn reset(&self) {
        *self.lock() = WindowState::at(self.offset);
    }

    /// Check the window invariants.
    pub fn verify(&self) -> Result<(), WindowError> {
        let s = self.lock();
        if !(s.low <= s.high_delivered
            && s.high_delivered <= s.high_contiguous
            && s.high_contiguous <= s.high_received)
        {
            return Err(WindowError::Counters {
                sender: self.sender,
                low: s.low,
                delivered: s.high_delivered,
                contiguous: s.high_contiguous,
                received: s.high_received,
            });
        }
        if let Some((&first, _)) = s.buffer.first_key_value()
            && first < s.low
        {
            return Err(WindowError::OutOfRange {
                sender: self.sender,
                seqno: first,
            });
        }
        if let Some((&last, _)) = s.buffer.last_key_value()
            && last > s.high_received
        {
            return Err(WindowError::OutOfRange {
                sender: self.sender,
                seqno: last,
            });
        }
        if let Some(seqno) = (s.high_delivered + 1..=s.high_contiguous)
            .find(|seqno| !s.buffer.contains_key(seqno))
        {
            return Err(WindowError::MissingBuffered {
                sender: self.sender,
                seqno,
            });
        }
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, WindowState<T>> {
        self.state.lock().expect("window lock poisoned")
    }

    /// Break the counter ordering so [`SeqWindow::verify`] fails.
    #[cfg(any(test, feature = "testing"))]
    pub fn corrupt_for_test(&self) {
        let mut s = self.lock();
        s.high_delivered = s.high_contiguous + 1;
    }
}

impl<T> fmt::Debug for SeqWindow<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.state.lock().expect("window lock poisoned");
        f.debug_struct("SeqWindow")
            .field("sender", &self.sender)
            .field("low", &s.low)
            .field("high_delivered", &s.high_delivered)
            .field("high_contiguous", &s.high_contiguous)
            .field("high_received", &s.high_received)
            .field("buffered", &s.buffer.len())
            .finish()
    }
}
