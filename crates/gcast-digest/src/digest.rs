//! The digest map and its reconciliation operations.

use std::collections::HashMap;
use std::collections::hash_map;
use std::fmt;

use gcast_types::{MemberId, Seqno};
use serde::{Deserialize, Serialize};

/// Snapshot of one sender's window.
///
/// `low` is the garbage-collection watermark, `high` the highest seqno
/// received without gaps and `high_seen` the highest seqno received at all.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DigestEntry {
    /// Lowest seqno still retained.
    pub low: Seqno,
    /// Highest contiguous seqno.
    pub high: Seqno,
    /// Highest seqno received.
    pub high_seen: Seqno,
}

impl DigestEntry {
    /// Create an entry.
    pub fn new(low: Seqno, high: Seqno, high_seen: Seqno) -> Self {
        Self {
            low,
            high,
            high_seen,
        }
    }
}

impl fmt::Display for DigestEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} : {} ({})]", self.low, self.high, self.high_seen)
    }
}

/// Map from member to its delivery state. At most one entry per member.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Digest {
    senders: HashMap<MemberId, DigestEntry>,
}

impl Digest {
    /// Create an empty digest.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty digest sized for `capacity` senders.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            senders: HashMap::with_capacity(capacity),
        }
    }

    /// Insert or overwrite the entry for `member`.
    pub fn add(&mut self, member: MemberId, low: Seqno, high: Seqno, high_seen: Seqno) {
        self.senders
            .insert(member, DigestEntry::new(low, high, high_seen));
    }

    /// Insert or overwrite with a prepared entry.
    pub fn add_entry(&mut self, member: MemberId, entry: DigestEntry) {
        self.senders.insert(member, entry);
    }

    /// Fold in senders that this digest does not know yet.
    ///
    /// Entries for members present in both digests are left unchanged: the
    /// first digest to report a sender wins.
    pub fn merge(&mut self, other: &Digest) {
        for (member, entry) in &other.senders {
            self.senders.entry(*member).or_insert(*entry);
        }
    }

    /// Fold in `other` keeping the widest range per sender.
    ///
    /// Shared senders get `min(low)`, `max(high)` and `max(high_seen)`.
    pub fn merge_highest(&mut self, other: &Digest) {
        for (member, theirs) in &other.senders {
            match self.senders.entry(*member) {
                hash_map::Entry::Occupied(mut slot) => {
                    let ours = slot.get_mut();
                    ours.low = ours.low.min(theirs.low);
                    ours.high = ours.high.max(theirs.high);
                    ours.high_seen = ours.high_seen.max(theirs.high_seen);
                }
                hash_map::Entry::Vacant(slot) => {
                    slot.insert(*theirs);
                }
            }
        }
    }

    /// Drop every entry and copy all of `other`'s.
    pub fn replace(&mut self, other: &Digest) {
        self.senders.clone_from(&other.senders);
    }

    /// Whether both digests cover exactly the same members.
    pub fn same_senders(&self, other: &Digest) -> bool {
        self.senders.len() == other.senders.len()
            && self.senders.keys().all(|m| other.senders.contains_key(m))
    }

    /// Bump `high` for `member` after the local member multicast a message.
    pub fn increment_high_seqno(&mut self, member: &MemberId) {
        if let Some(entry) = self.senders.get_mut(member) {
            entry.high += 1;
        }
    }

    /// The entry for `member`.
    pub fn get(&self, member: &MemberId) -> Option<DigestEntry> {
        self.senders.get(member).copied()
    }

    /// Whether the digest has an entry for `member`.
    pub fn contains(&self, member: &MemberId) -> bool {
        self.senders.contains_key(member)
    }

    /// Remove the entry for `member`.
    pub fn remove(&mut self, member: &MemberId) -> Option<DigestEntry> {
        self.senders.remove(member)
    }

    /// Keep only the entries whose member satisfies `keep`.
    pub fn retain(&mut self, mut keep: impl FnMut(&MemberId) -> bool) {
        self.senders.retain(|m, _| keep(m));
    }

    /// Zero every counter of `member`'s entry.
    pub fn reset_at(&mut self, member: &MemberId) {
        if let Some(entry) = self.senders.get_mut(member) {
            *entry = DigestEntry::default();
        }
    }

    /// Number of senders.
    pub fn len(&self) -> usize {
        self.senders.len()
    }

    /// Whether the digest has no entries.
    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }

    /// Iterate over `(member, entry)` pairs in arbitrary order.
    pub fn iter(&self) -> impl Iterator<Item = (&MemberId, &DigestEntry)> {
        self.senders.iter()
    }

    /// Members covered, sorted.
    pub fn members(&self) -> Vec<MemberId> {
        let mut members: Vec<MemberId> = self.senders.keys().copied().collect();
        members.sort();
        members
    }

    /// `low` of `member`, if present.
    pub fn low_seqno_at(&self, member: &MemberId) -> Option<Seqno> {
        self.senders.get(member).map(|e| e.low)
    }

    /// `high` of `member`, if present.
    pub fn high_seqno_at(&self, member: &MemberId) -> Option<Seqno> {
        self.senders.get(member).map(|e| e.high)
    }

    /// `high_seen` of `member`, if present.
    pub fn high_seqno_seen_at(&self, member: &MemberId) -> Option<Seqno> {
        self.senders.get(member).map(|e| e.high_seen)
    }

    /// Overwrite `high` of an existing entry.
    pub fn set_high_seqno_at(&mut self, member: &MemberId, high: Seqno) {
        if let Some(entry) = self.senders.get_mut(member) {
            entry.high = high;
        }
    }

    /// Overwrite `high_seen` of an existing entry.
    pub fn set_high_seqno_seen_at(&mut self, member: &MemberId, high_seen: Seqno) {
        if let Some(entry) = self.senders.get_mut(member) {
            entry.high_seen = high_seen;
        }
    }

    /// Total messages seen across all senders, saturating.
    ///
    /// Logged on both sides of a mismatched merge.
    pub fn completeness(&self) -> u64 {
        self.senders
            .values()
            .fold(0u64, |total, e| total.saturating_add(e.high_seen))
    }
}

impl FromIterator<(MemberId, DigestEntry)> for Digest {
    fn from_iter<I: IntoIterator<Item = (MemberId, DigestEntry)>>(iter: I) -> Self {
        Self {
            senders: iter.into_iter().collect(),
        }
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, member) in self.members().iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{member}: {}", self.senders[member])?;
        }
        write!(f, "]")
    }
}
