//! The installed view and the windows that belong to it.
//!
//! A view and its per-sender windows are swapped together under one lock,
//! so the delivery path sees either the old view with its windows or the
//! new view with its windows, never a mix. Installs go through two phases:
//! [`ViewManager::prepare`] stages a view with the digest its windows start
//! from, [`ViewManager::commit`] makes it current.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use bytes::Bytes;
use gcast_digest::{Digest, DigestEntry};
use gcast_types::{MemberId, View, ViewId};
use gcast_window::SeqWindow;
use tracing::{debug, info, warn};

use crate::GroupError;

/// Window type used by the group: one per sender in the view.
pub type Window = SeqWindow<Bytes>;

struct Staged {
    view: View,
    digest: Digest,
}

struct ViewState {
    view: Arc<View>,
    windows: HashMap<MemberId, Arc<Window>>,
    staged: Option<Staged>,
    /// Stability entry of every sender whose window was dropped by a view change.
    retired: HashMap<MemberId, DigestEntry>,
    last_flush: Option<Digest>,
}

/// Owner of the current view of one member.
pub struct ViewManager {
    local: MemberId,
    state: RwLock<ViewState>,
}

impl ViewManager {
    /// Start in `view` with an empty window for each of its members.
    pub fn new(local: MemberId, view: View) -> Self {
        let windows = view
            .members()
            .iter()
            .map(|m| (*m, Arc::new(Window::new(*m, 0))))
            .collect();
        Self {
            local,
            state: RwLock::new(ViewState {
                view: Arc::new(view),
                windows,
                staged: None,
                retired: HashMap::new(),
                last_flush: None,
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, ViewState> {
        self.state.read().expect("view lock poisoned")
    }

    fn write(&self) -> RwLockWriteGuard<'_, ViewState> {
        self.state.write().expect("view lock poisoned")
    }

    /// The member this manager belongs to.
    pub fn local(&self) -> MemberId {
        self.local
    }

    /// The installed view.
    pub fn current(&self) -> Arc<View> {
        self.read().view.clone()
    }

    /// Window of `sender`, if it is in the installed view.
    pub fn window(&self, sender: &MemberId) -> Option<Arc<Window>> {
        self.read().windows.get(sender).cloned()
    }

    /// Every window of the installed view.
    pub fn windows(&self) -> Vec<Arc<Window>> {
        self.read().windows.values().cloned().collect()
    }

    /// `(low, high_contiguous, high_received)` of every window.
    pub fn digest(&self) -> Digest {
        self.read()
            .windows
            .iter()
            .map(|(m, w)| (*m, w.snapshot()))
            .collect()
    }

    /// `(low, high_delivered, high_received)` of every window.
    pub fn stability_digest(&self) -> Digest {
        self.read()
            .windows
            .iter()
            .map(|(m, w)| (*m, w.stability_entry()))
            .collect()
    }

    /// Stage `view`; its windows will start from `digest` on commit.
    ///
    /// A proposal must be newer than both the installed and the staged view.
    pub fn prepare(&self, view: View, digest: Digest) -> Result<(), GroupError> {
        if !view.contains(&self.local) {
            return Err(GroupError::NotMember(self.local));
        }
        let mut state = self.write();
        let newest = match &state.staged {
            Some(staged) => staged.view.id().max(state.view.id()),
            None => state.view.id(),
        };
        if view.id() <= newest {
            return Err(GroupError::StaleView {
                proposed: view.id(),
                current: newest,
            });
        }
        debug!(local = %self.local, view = %view, "view staged");
        state.staged = Some(Staged { view, digest });
        Ok(())
    }

    /// Make the staged view current. `None` if `view_id` is not staged.
    pub fn commit(&self, view_id: ViewId) -> Option<Arc<View>> {
        let mut state = self.write();
        if state.staged.as_ref().map(|s| s.view.id()) != Some(view_id) {
            return None;
        }
        let staged = state.staged.take()?;
        Some(Self::apply(&mut state, self.local, staged.view, &staged.digest))
    }

    /// Drop the staged view if it is `view_id`.
    pub fn rollback(&self, view_id: ViewId) -> bool {
        let mut state = self.write();
        if state.staged.as_ref().map(|s| s.view.id()) == Some(view_id) {
            state.staged = None;
            debug!(local = %self.local, %view_id, "staged view rolled back");
            true
        } else {
            false
        }
    }

    /// Prepare and commit in one step.
    pub fn install(&self, view: View, digest: &Digest) -> Result<Arc<View>, GroupError> {
        if !view.contains(&self.local) {
            return Err(GroupError::NotMember(self.local));
        }
        let mut state = self.write();
        if view.id() <= state.view.id() {
            return Err(GroupError::StaleView {
                proposed: view.id(),
                current: state.view.id(),
            });
        }
        state.staged = None;
        Ok(Self::apply(&mut state, self.local, view, digest))
    }

    /// Remember the digest captured by the last successful flush.
    pub fn record_flush_digest(&self, digest: Digest) {
        self.write().last_flush = Some(digest);
    }

    /// The digest captured by the last successful flush.
    pub fn last_flush_digest(&self) -> Option<Digest> {
        self.read().last_flush.clone()
    }

    /// Reset the window of `sender` and throw it away without retiring its
    /// position.
    ///
    /// Holders of the old window see it empty. The next installed view
    /// creates a new one from the digest, as for a member that was never
    /// seen before.
    pub fn discard_window(&self, sender: &MemberId) -> bool {
        let mut state = self.write();
        state.retired.remove(sender);
        match state.windows.remove(sender) {
            Some(window) => {
                window.reset();
                true
            }
            None => false,
        }
    }

    /// Skip every window past the messages a transferred state reflects.
    ///
    /// `digest` is the provider's digest taken under the same flush. Returns
    /// the number of windows that moved.
    pub fn fast_forward(&self, digest: &Digest) -> usize {
        let state = self.read();
        let mut moved = 0;
        for (member, window) in &state.windows {
            if let Some(e) = digest.get(member)
                && window.fast_forward(e.high)
            {
                moved += 1;
            }
        }
        debug!(local = %self.local, moved, "windows fast-forwarded");
        moved
    }

    /// Stability entry recorded when `sender`'s window was dropped.
    pub fn retired(&self, sender: &MemberId) -> Option<DigestEntry> {
        self.read().retired.get(sender).copied()
    }

    fn apply(state: &mut ViewState, local: MemberId, view: View, digest: &Digest) -> Arc<View> {
        let mut windows = HashMap::with_capacity(view.size());
        for member in view.members() {
            let entry = digest.get(member);
            let window = match state.windows.remove(member) {
                Some(window) => {
                    if let Some(e) = entry {
                        window.extend(e.high);
                    }
                    window
                }
                None => {
                    // Resume a returning sender where we stopped delivering it,
                    // unless it restarted below that position. Nobody keeps
                    // what its subgroup already collected.
                    let offset = match (state.retired.remove(member), entry) {
                        (Some(r), Some(e)) if r.high <= e.high => {
                            if e.low > r.high {
                                warn!(
                                    %local,
                                    sender = %member,
                                    delivered = r.high,
                                    collected = e.low,
                                    "messages collected while apart are skipped"
                                );
                            }
                            r.high.max(e.low)
                        }
                        (_, Some(e)) => e.high,
                        (Some(r), None) => r.high,
                        (None, None) => 0,
                    };
                    let window = Arc::new(Window::new(*member, offset));
                    if let Some(e) = entry {
                        window.extend(e.high);
                    }
                    window
                }
            };
            windows.insert(*member, window);
        }

        for (member, window) in state.windows.drain() {
            state.retired.insert(member, window.stability_entry());
        }
        state.windows = windows;
        state.view = Arc::new(view);
        info!(%local, view = %state.view, "view installed");
        state.view.clone()
    }
}

impl std::fmt::Debug for ViewManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.read();
        f.debug_struct("ViewManager")
            .field("local", &self.local)
            .field("view", &state.view.id())
            .field("windows", &state.windows.len())
            .field("staged", &state.staged.as_ref().map(|s| s.view.id()))
            .finish()
    }
}
