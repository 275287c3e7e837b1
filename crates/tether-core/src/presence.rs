//! Presence set reconciliation.
//!
//! The server maintains the authoritative "who is here" set per topic and
//! synchronizes it to clients as full-state snapshots plus incremental
//! diffs. [`sync_state`] and [`sync_diff`] are pure functions over
//! [`PresenceState`] maps; [`Presence`] binds them to a channel's state
//! and diff events and buffers diffs that race ahead of the first
//! snapshot for a join instance.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use tether_protocol::events::{PRESENCE_DIFF_EVENT, PRESENCE_STATE_EVENT};
use tether_protocol::Payload;

use crate::channel::Channel;

/// One tracked meta entry for a presence key.
///
/// `phx_ref` values are unique within a key's metas list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Meta {
    /// Unique ref of this meta within its key.
    pub phx_ref: String,
    /// Ref this meta replaced, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phx_ref_prev: Option<String>,
    /// Application metadata.
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

impl Meta {
    /// Create a meta carrying only a ref.
    #[must_use]
    pub fn new(phx_ref: impl Into<String>) -> Self {
        Self {
            phx_ref: phx_ref.into(),
            phx_ref_prev: None,
            rest: Map::new(),
        }
    }
}

/// The presences tracked under one key. A key is present iff its metas
/// list is non-empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PresenceEntry {
    /// Metas, one per device/session of the key.
    pub metas: Vec<Meta>,
}

impl PresenceEntry {
    /// Create an entry from metas.
    #[must_use]
    pub fn new(metas: Vec<Meta>) -> Self {
        Self { metas }
    }
}

/// Presence state: key → tracked entry.
pub type PresenceState = BTreeMap<String, PresenceEntry>;

/// An incremental presence update.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PresenceDiff {
    /// Entries whose listed metas joined.
    #[serde(default)]
    pub joins: PresenceState,
    /// Entries whose listed metas left.
    #[serde(default)]
    pub leaves: PresenceState,
}

/// Reconcile `current` against a server snapshot.
///
/// `on_join` fires once per affected key with `(key, entry before, newly
/// joined metas)`; `on_leave` with `(key, entry after removal, left
/// metas)`. Returns the new authoritative state.
pub fn sync_state(
    current: &PresenceState,
    new_state: PresenceState,
    on_join: &mut dyn FnMut(&str, Option<&PresenceEntry>, &PresenceEntry),
    on_leave: &mut dyn FnMut(&str, &PresenceEntry, &PresenceEntry),
) -> PresenceState {
    let state = current.clone();
    let mut joins: PresenceState = BTreeMap::new();
    let mut leaves: PresenceState = BTreeMap::new();

    for (key, presence) in &state {
        if !new_state.contains_key(key) {
            leaves.insert(key.clone(), presence.clone());
        }
    }
    for (key, new_presence) in &new_state {
        match state.get(key) {
            Some(current_presence) => {
                let new_refs: Vec<&str> = new_presence
                    .metas
                    .iter()
                    .map(|meta| meta.phx_ref.as_str())
                    .collect();
                let current_refs: Vec<&str> = current_presence
                    .metas
                    .iter()
                    .map(|meta| meta.phx_ref.as_str())
                    .collect();
                let joined_metas: Vec<Meta> = new_presence
                    .metas
                    .iter()
                    .filter(|meta| !current_refs.contains(&meta.phx_ref.as_str()))
                    .cloned()
                    .collect();
                let left_metas: Vec<Meta> = current_presence
                    .metas
                    .iter()
                    .filter(|meta| !new_refs.contains(&meta.phx_ref.as_str()))
                    .cloned()
                    .collect();
                if !joined_metas.is_empty() {
                    joins.insert(key.clone(), PresenceEntry::new(joined_metas));
                }
                if !left_metas.is_empty() {
                    leaves.insert(key.clone(), PresenceEntry::new(left_metas));
                }
            }
            None => {
                joins.insert(key.clone(), new_presence.clone());
            }
        }
    }

    sync_diff(state, PresenceDiff { joins, leaves }, on_join, on_leave)
}

/// Apply an incremental diff to `state`.
///
/// Joined metas are merged into their key (existing metas stay first);
/// left metas are removed by `phx_ref`, and a key is deleted once its
/// metas list is empty.
pub fn sync_diff(
    mut state: PresenceState,
    diff: PresenceDiff,
    on_join: &mut dyn FnMut(&str, Option<&PresenceEntry>, &PresenceEntry),
    on_leave: &mut dyn FnMut(&str, &PresenceEntry, &PresenceEntry),
) -> PresenceState {
    for (key, new_presence) in diff.joins {
        let current_presence = state.get(&key).cloned();
        let mut merged = new_presence.clone();
        if let Some(current) = &current_presence {
            let joined_refs: Vec<&str> = merged
                .metas
                .iter()
                .map(|meta| meta.phx_ref.as_str())
                .collect();
            let mut metas: Vec<Meta> = current
                .metas
                .iter()
                .filter(|meta| !joined_refs.contains(&meta.phx_ref.as_str()))
                .cloned()
                .collect();
            metas.extend(merged.metas);
            merged.metas = metas;
        }
        state.insert(key.clone(), merged);
        on_join(&key, current_presence.as_ref(), &new_presence);
    }

    for (key, left_presence) in diff.leaves {
        let Some(mut current) = state.get(&key).cloned() else {
            continue;
        };
        let refs_to_remove: Vec<&str> = left_presence
            .metas
            .iter()
            .map(|meta| meta.phx_ref.as_str())
            .collect();
        current
            .metas
            .retain(|meta| !refs_to_remove.contains(&meta.phx_ref.as_str()));
        let now_empty = current.metas.is_empty();
        state.insert(key.clone(), current.clone());
        on_leave(&key, &current, &left_presence);
        if now_empty {
            state.remove(&key);
        }
    }

    state
}

/// Map every key/entry through a chooser function.
pub fn list<T>(
    state: &PresenceState,
    chooser: impl Fn(&str, &PresenceEntry) -> T,
) -> Vec<T> {
    state.iter().map(|(key, entry)| chooser(key, entry)).collect()
}

/// Event names a [`Presence`] subscribes to on its channel.
#[derive(Debug, Clone)]
pub struct PresenceOptions {
    /// Event carrying full snapshots.
    pub state_event: String,
    /// Event carrying incremental diffs.
    pub diff_event: String,
}

impl Default for PresenceOptions {
    fn default() -> Self {
        Self {
            state_event: PRESENCE_STATE_EVENT.to_string(),
            diff_event: PRESENCE_DIFF_EVENT.to_string(),
        }
    }
}

type JoinCallback = Rc<dyn Fn(&str, Option<&PresenceEntry>, &PresenceEntry)>;
type LeaveCallback = Rc<dyn Fn(&str, &PresenceEntry, &PresenceEntry)>;
type SyncCallback = Rc<dyn Fn()>;

struct PresenceInner {
    channel: Channel,
    state: RefCell<PresenceState>,
    pending_diffs: RefCell<Vec<PresenceDiff>>,
    join_ref: RefCell<Option<String>>,
    on_join: RefCell<JoinCallback>,
    on_leave: RefCell<LeaveCallback>,
    on_sync: RefCell<SyncCallback>,
}

/// Presence tracker bound to one channel.
///
/// Diffs received for a join instance before that instance's first full
/// snapshot are buffered and replayed in arrival order once the snapshot
/// lands; a rejoin re-arms the buffer, since the server resends the full
/// state.
pub struct Presence {
    inner: Rc<PresenceInner>,
}

impl Presence {
    /// Track presence on a channel with the default event names.
    #[must_use]
    pub fn new(channel: &Channel) -> Self {
        Self::with_options(channel, PresenceOptions::default())
    }

    /// Track presence on a channel with custom event names.
    #[must_use]
    pub fn with_options(channel: &Channel, options: PresenceOptions) -> Self {
        let inner = Rc::new(PresenceInner {
            channel: channel.clone(),
            state: RefCell::new(PresenceState::new()),
            pending_diffs: RefCell::new(Vec::new()),
            join_ref: RefCell::new(None),
            on_join: RefCell::new(Rc::new(|_, _, _| {})),
            on_leave: RefCell::new(Rc::new(|_, _, _| {})),
            on_sync: RefCell::new(Rc::new(|| {})),
        });

        let weak = Rc::downgrade(&inner);
        channel.on(options.state_event, move |payload, _ref, _join_ref| {
            if let Some(presence) = Presence::upgrade(&weak) {
                presence.handle_state(payload);
            }
        });
        let weak = Rc::downgrade(&inner);
        channel.on(options.diff_event, move |payload, _ref, _join_ref| {
            if let Some(presence) = Presence::upgrade(&weak) {
                presence.handle_diff(payload);
            }
        });

        Presence { inner }
    }

    fn upgrade(weak: &Weak<PresenceInner>) -> Option<Presence> {
        weak.upgrade().map(|inner| Presence { inner })
    }

    /// Set the callback fired for every joined key.
    pub fn on_join(
        &self,
        callback: impl Fn(&str, Option<&PresenceEntry>, &PresenceEntry) + 'static,
    ) {
        *self.inner.on_join.borrow_mut() = Rc::new(callback);
    }

    /// Set the callback fired for every left key.
    pub fn on_leave(&self, callback: impl Fn(&str, &PresenceEntry, &PresenceEntry) + 'static) {
        *self.inner.on_leave.borrow_mut() = Rc::new(callback);
    }

    /// Set the callback fired after each applied snapshot or diff.
    pub fn on_sync(&self, callback: impl Fn() + 'static) {
        *self.inner.on_sync.borrow_mut() = Rc::new(callback);
    }

    /// Snapshot of the tracked state.
    #[must_use]
    pub fn state(&self) -> PresenceState {
        self.inner.state.borrow().clone()
    }

    /// Map every tracked key/entry through a chooser function.
    pub fn list<T>(&self, chooser: impl Fn(&str, &PresenceEntry) -> T) -> Vec<T> {
        list(&self.inner.state.borrow(), chooser)
    }

    /// Whether diffs are currently buffered awaiting the first snapshot
    /// for the channel's current join instance.
    #[must_use]
    pub fn in_pending_sync_state(&self) -> bool {
        let synced_ref = self.inner.join_ref.borrow();
        synced_ref.is_none() || *synced_ref != self.inner.channel.join_ref()
    }

    fn handle_state(&self, payload: &Payload) {
        let Some(new_state) = parse_state(payload) else { return };
        *self.inner.join_ref.borrow_mut() = self.inner.channel.join_ref();

        let on_join = self.inner.on_join.borrow().clone();
        let on_leave = self.inner.on_leave.borrow().clone();
        let current = self.inner.state.borrow().clone();
        let mut state = sync_state(
            &current,
            new_state,
            &mut |key, before, joined| on_join(key, before, joined),
            &mut |key, after, left| on_leave(key, after, left),
        );

        let pending: Vec<PresenceDiff> = self.inner.pending_diffs.borrow_mut().drain(..).collect();
        for diff in pending {
            state = sync_diff(
                state,
                diff,
                &mut |key, before, joined| on_join(key, before, joined),
                &mut |key, after, left| on_leave(key, after, left),
            );
        }

        *self.inner.state.borrow_mut() = state;
        let on_sync = self.inner.on_sync.borrow().clone();
        on_sync();
    }

    fn handle_diff(&self, payload: &Payload) {
        let Some(diff) = parse_diff(payload) else { return };
        if self.in_pending_sync_state() {
            self.inner.pending_diffs.borrow_mut().push(diff);
            return;
        }
        let on_join = self.inner.on_join.borrow().clone();
        let on_leave = self.inner.on_leave.borrow().clone();
        let current = self.inner.state.borrow().clone();
        let state = sync_diff(
            current,
            diff,
            &mut |key, before, joined| on_join(key, before, joined),
            &mut |key, after, left| on_leave(key, after, left),
        );
        *self.inner.state.borrow_mut() = state;
        let on_sync = self.inner.on_sync.borrow().clone();
        on_sync();
    }
}

fn parse_state(payload: &Payload) -> Option<PresenceState> {
    let Payload::Json(value) = payload else {
        warn!("presence snapshot with non-JSON payload dropped");
        return None;
    };
    match serde_json::from_value(value.clone()) {
        Ok(state) => Some(state),
        Err(error) => {
            warn!(%error, "malformed presence snapshot dropped");
            None
        }
    }
}

fn parse_diff(payload: &Payload) -> Option<PresenceDiff> {
    let Payload::Json(value) = payload else {
        warn!("presence diff with non-JSON payload dropped");
        return None;
    };
    match serde_json::from_value(value.clone()) {
        Ok(diff) => Some(diff),
        Err(error) => {
            warn!(%error, "malformed presence diff dropped");
            None
        }
    }
}
