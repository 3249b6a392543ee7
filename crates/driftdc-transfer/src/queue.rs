//! The download queue: items, sources, and per-user scheduling state.
//!
//! Sources inside a user's queue are ordered by the tuple (enabled,
//! is-filelist, priority descending, destination ascending); disabled
//! entries sink to the end. Across users, an idle connection beats a
//! cold one, then the users' top sources are compared with the same
//! tuple.

use crate::WAIT_TIMEOUT;
use crate::item::{DlError, DlItem, Priority, SourceState};
use driftdc_hub::Uid;
use driftdc_tth::Root;
use std::cmp::Reverse;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Instant;

/// Per-user connection/scheduling state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserState {
    /// Not connected.
    Nco,
    /// Dialing, expecting the handshake.
    Exp,
    /// Connected and idle.
    Idl,
    /// Downloading.
    Act,
    /// Waiting out the reconnect delay after a failure.
    Wai,
}

/// Scheduling state for one source user.
#[derive(Debug)]
pub struct DlUser {
    /// The user.
    pub uid: Uid,
    /// Connection state.
    pub state: UserState,
    /// Whether the user is currently online on some hub.
    pub online: bool,
    /// The item being fetched; set exactly when `state == Act`.
    pub active: Option<Root>,
    /// WAI expiry.
    pub wait_until: Option<Instant>,
}

impl DlUser {
    fn new(uid: Uid) -> Self {
        Self {
            uid,
            state: UserState::Nco,
            online: false,
            active: None,
            wait_until: None,
        }
    }
}

/// Ordering key for a source within a user's queue.
type SourceKey = (Reverse<bool>, Reverse<bool>, Reverse<Priority>, PathBuf);

/// The global queue: items keyed by content hash, users keyed by uid.
#[derive(Default)]
pub struct Queue {
    items: HashMap<Root, DlItem>,
    users: HashMap<Uid, DlUser>,
}

impl Queue {
    /// Empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an item; replaces nothing if the hash is already queued.
    pub fn insert(&mut self, item: DlItem) {
        self.items.entry(item.hash).or_insert(item);
    }

    /// Item by hash.
    #[must_use]
    pub fn item(&self, hash: Root) -> Option<&DlItem> {
        self.items.get(&hash)
    }

    /// Mutable item by hash.
    pub fn item_mut(&mut self, hash: Root) -> Option<&mut DlItem> {
        self.items.get_mut(&hash)
    }

    /// All items.
    pub fn items(&self) -> impl Iterator<Item = &DlItem> {
        self.items.values()
    }

    /// User state by uid.
    #[must_use]
    pub fn user(&self, uid: Uid) -> Option<&DlUser> {
        self.users.get(&uid)
    }

    /// Attach a source to an item, creating the user entry on first
    /// sight.
    pub fn add_source(&mut self, hash: Root, uid: Uid) {
        if let Some(item) = self.items.get_mut(&hash) {
            item.sources.entry(uid).or_insert_with(SourceState::default);
            self.users.entry(uid).or_insert_with(|| DlUser::new(uid));
        }
    }

    /// Detach a source. The user entry stays; empty users are pruned by
    /// the scan.
    pub fn remove_source(&mut self, hash: Root, uid: Uid) {
        if let Some(item) = self.items.get_mut(&hash) {
            item.sources.remove(&uid);
        }
    }

    /// Remove an item entirely (completed, fatal, or user removal).
    pub fn remove_item(&mut self, hash: Root) {
        self.items.remove(&hash);
        for user in self.users.values_mut() {
            if user.active == Some(hash) {
                user.active = None;
                if user.state == UserState::Act {
                    user.state = UserState::Idl;
                }
            }
        }
    }

    /// Track a user's online presence.
    pub fn set_online(&mut self, uid: Uid, online: bool) {
        if let Some(user) = self.users.get_mut(&uid) {
            user.online = online;
            if !online && matches!(user.state, UserState::Exp | UserState::Idl | UserState::Act) {
                user.state = UserState::Nco;
                user.active = None;
            }
        }
    }

    fn source_key(&self, uid: Uid, hash: Root) -> Option<SourceKey> {
        let item = self.items.get(&hash)?;
        Some((
            Reverse(item.enabled_for(uid)),
            Reverse(item.islist),
            Reverse(item.priority),
            item.dest.clone(),
        ))
    }

    /// The user's sources in scheduling order.
    #[must_use]
    pub fn sources_for(&self, uid: Uid) -> Vec<Root> {
        let mut hashes: Vec<Root> = self
            .items
            .values()
            .filter(|i| i.sources.contains_key(&uid))
            .map(|i| i.hash)
            .collect();
        hashes.sort_by_key(|&h| self.source_key(uid, h));
        hashes
    }

    /// The user's best schedulable source: enabled and not all-busy.
    #[must_use]
    pub fn top_enabled(&self, uid: Uid) -> Option<Root> {
        self.sources_for(uid)
            .into_iter()
            .find(|&h| {
                self.items
                    .get(&h)
                    .is_some_and(|i| i.enabled_for(uid) && !i.allbusy)
            })
    }

    /// Users eligible for the needs-start scan: online, in NCO or IDL,
    /// with at least one schedulable source. Ordered IDL-first, then by
    /// the top source's tuple.
    #[must_use]
    pub fn candidates(&self) -> Vec<Uid> {
        let mut out: Vec<(bool, SourceKey, Uid)> = self
            .users
            .values()
            .filter(|u| u.online && matches!(u.state, UserState::Nco | UserState::Idl))
            .filter_map(|u| {
                let top = self.top_enabled(u.uid)?;
                let key = self.source_key(u.uid, top)?;
                Some((u.state != UserState::Idl, key, u.uid))
            })
            .collect();
        out.sort();
        out.into_iter().map(|(_, _, uid)| uid).collect()
    }

    /// Count of users actively downloading.
    #[must_use]
    pub fn active_count(&self) -> u32 {
        self.users
            .values()
            .filter(|u| u.state == UserState::Act)
            .count() as u32
    }

    /// NCO → EXP: a dial was issued.
    pub fn mark_dialing(&mut self, uid: Uid) {
        if let Some(u) = self.users.get_mut(&uid) {
            debug_assert_eq!(u.state, UserState::Nco);
            u.state = UserState::Exp;
        }
    }

    /// EXP → IDL: the peer handshake completed.
    pub fn mark_connected(&mut self, uid: Uid) {
        if let Some(u) = self.users.get_mut(&uid) {
            u.state = UserState::Idl;
            u.active = None;
        }
    }

    /// IDL → ACT: a transfer was assigned.
    pub fn mark_active(&mut self, uid: Uid, hash: Root) {
        if let Some(u) = self.users.get_mut(&uid) {
            u.state = UserState::Act;
            u.active = Some(hash);
        }
    }

    /// ACT → IDL: the transfer finished; the connection is reusable.
    pub fn mark_idle(&mut self, uid: Uid) {
        if let Some(u) = self.users.get_mut(&uid) {
            u.state = UserState::Idl;
            u.active = None;
        }
    }

    /// Any state → NCO: a graceful close (transfer finished, nothing
    /// queued). No wait penalty.
    pub fn mark_disconnected(&mut self, uid: Uid) {
        if let Some(u) = self.users.get_mut(&uid) {
            if u.state != UserState::Wai {
                u.state = UserState::Nco;
                u.active = None;
            }
        }
    }

    /// Any state → WAI: a failure; cancel activity and wait.
    pub fn mark_wait(&mut self, uid: Uid, now: Instant) {
        if let Some(u) = self.users.get_mut(&uid) {
            u.state = UserState::Wai;
            u.active = None;
            u.wait_until = Some(now + WAIT_TIMEOUT);
        }
    }

    /// WAI → NCO on timer expiry. Returns whether anything changed.
    pub fn tick_waits(&mut self, now: Instant) -> bool {
        let mut changed = false;
        for u in self.users.values_mut() {
            if u.state == UserState::Wai && u.wait_until.is_some_and(|t| t <= now) {
                u.state = UserState::Nco;
                u.wait_until = None;
                changed = true;
            }
        }
        changed
    }

    /// Record a per-source error: the pairing is demoted, other sources
    /// stay intact.
    pub fn source_error(&mut self, uid: Uid, hash: Root, err: DlError, msg: Option<String>) {
        if let Some(item) = self.items.get_mut(&hash) {
            if let Some(src) = item.sources.get_mut(&uid) {
                src.error = err;
                src.error_msg = msg;
            }
        }
    }

    /// Record a per-item fatal error: the item moves to priority ERR.
    pub fn item_error(&mut self, hash: Root, err: DlError, msg: Option<String>) {
        if let Some(item) = self.items.get_mut(&hash) {
            item.error = err;
            item.error_msg = msg;
            item.priority = Priority::Err;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::filelist_hash;

    fn item(hash_byte: u8, dest: &str) -> DlItem {
        DlItem::new(Root([hash_byte; 24]), 1000, dest.into(), false)
    }

    fn queue_with_user(uid: Uid, hashes: &[(u8, &str)]) -> Queue {
        let mut q = Queue::new();
        for (b, dest) in hashes {
            q.insert(item(*b, dest));
            q.add_source(Root([*b; 24]), uid);
        }
        q.set_online(uid, true);
        q
    }

    #[test]
    fn source_ordering_tuple() {
        let uid = Uid(1);
        let mut q = queue_with_user(uid, &[(1, "/dl/bbb"), (2, "/dl/aaa"), (3, "/dl/ccc")]);
        // Same priority: alphabetical destination.
        assert_eq!(
            q.sources_for(uid),
            vec![Root([2; 24]), Root([1; 24]), Root([3; 24])]
        );

        // Priority outranks destination order.
        q.item_mut(Root([3; 24])).unwrap().priority = Priority::High;
        assert_eq!(q.sources_for(uid)[0], Root([3; 24]));

        // A file list outranks any regular file.
        let fl = filelist_hash(uid);
        let mut li = DlItem::new(fl, 0, "/dl/zzz".into(), true);
        li.size = 0;
        q.insert(li);
        q.add_source(fl, uid);
        assert_eq!(q.sources_for(uid)[0], fl);

        // Disabled entries sink to the end.
        q.item_mut(fl).unwrap().priority = Priority::Off;
        let order = q.sources_for(uid);
        assert_eq!(*order.last().unwrap(), fl);
    }

    #[test]
    fn per_source_error_demotes_only_that_pairing() {
        let alice = Uid(1);
        let bob = Uid(2);
        let mut q = queue_with_user(alice, &[(1, "/dl/a")]);
        q.add_source(Root([1; 24]), bob);
        q.set_online(bob, true);

        q.source_error(alice, Root([1; 24]), DlError::NoFile, None);
        assert!(q.top_enabled(alice).is_none());
        assert_eq!(q.top_enabled(bob), Some(Root([1; 24])));
    }

    #[test]
    fn item_error_moves_to_err_priority() {
        let uid = Uid(1);
        let mut q = queue_with_user(uid, &[(1, "/dl/a")]);
        q.item_error(Root([1; 24]), DlError::IoDest, Some("disk full".into()));
        let item = q.item(Root([1; 24])).unwrap();
        assert_eq!(item.priority, Priority::Err);
        assert_eq!(item.error, DlError::IoDest);
        assert!(q.top_enabled(uid).is_none());
    }

    #[test]
    fn state_machine_transitions() {
        let uid = Uid(1);
        let mut q = queue_with_user(uid, &[(1, "/dl/a")]);
        assert_eq!(q.user(uid).unwrap().state, UserState::Nco);

        q.mark_dialing(uid);
        assert_eq!(q.user(uid).unwrap().state, UserState::Exp);
        q.mark_connected(uid);
        assert_eq!(q.user(uid).unwrap().state, UserState::Idl);
        q.mark_active(uid, Root([1; 24]));
        let u = q.user(uid).unwrap();
        assert_eq!(u.state, UserState::Act);
        assert_eq!(u.active, Some(Root([1; 24])));

        // ACT -> IDL clears the active source.
        q.mark_idle(uid);
        let u = q.user(uid).unwrap();
        assert_eq!(u.state, UserState::Idl);
        assert_eq!(u.active, None);

        // Entering WAI cancels activity; the timer releases to NCO.
        q.mark_active(uid, Root([1; 24]));
        let now = Instant::now();
        q.mark_wait(uid, now);
        let u = q.user(uid).unwrap();
        assert_eq!(u.state, UserState::Wai);
        assert_eq!(u.active, None);
        assert!(!q.tick_waits(now + WAIT_TIMEOUT / 2));
        assert!(q.tick_waits(now + WAIT_TIMEOUT));
        assert_eq!(q.user(uid).unwrap().state, UserState::Nco);
    }

    #[test]
    fn candidates_prefer_idle_connections() {
        let cold = Uid(1);
        let warm = Uid(2);
        let mut q = queue_with_user(cold, &[(1, "/dl/a")]);
        q.insert(item(2, "/dl/b"));
        q.add_source(Root([2; 24]), warm);
        q.set_online(warm, true);
        q.mark_dialing(warm);
        q.mark_connected(warm);

        assert_eq!(q.candidates(), vec![warm, cold]);
    }

    #[test]
    fn offline_users_are_not_candidates() {
        let uid = Uid(1);
        let mut q = queue_with_user(uid, &[(1, "/dl/a")]);
        q.set_online(uid, false);
        assert!(q.candidates().is_empty());
        assert_eq!(q.user(uid).unwrap().state, UserState::Nco);
    }

    #[test]
    fn allbusy_items_are_skipped() {
        let uid = Uid(1);
        let mut q = queue_with_user(uid, &[(1, "/dl/a"), (2, "/dl/b")]);
        q.item_mut(Root([1; 24])).unwrap().allbusy = true;
        // "/dl/a" sorts first but is all-busy, so /dl/b wins.
        assert_eq!(q.top_enabled(uid), Some(Root([2; 24])));
    }

    #[test]
    fn remove_item_releases_active_users() {
        let uid = Uid(1);
        let mut q = queue_with_user(uid, &[(1, "/dl/a")]);
        q.mark_dialing(uid);
        q.mark_connected(uid);
        q.mark_active(uid, Root([1; 24]));
        q.remove_item(Root([1; 24]));
        let u = q.user(uid).unwrap();
        assert_eq!(u.state, UserState::Idl);
        assert_eq!(u.active, None);
    }
}
