//! The needs-start scan and its debounce driver.
//!
//! Any state change that might enable progress (a user came online, a
//! chunk finished, a new item queued, a priority raised) sets a
//! coalesced needs-start flag; a 500 ms debounce collapses bursts into
//! one scan. The scan computes the free download slots and hands out
//! dial and assign actions until the slots or the candidates run out.

use crate::SCAN_DEBOUNCE;
use crate::queue::{Queue, UserState};
use driftdc_hub::Uid;
use driftdc_tth::Root;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::{Notify, mpsc};

/// What the scan decided to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedAction {
    /// Open a peer connection to this user.
    Dial(Uid),
    /// Hand this item to the user's idle connection.
    Assign {
        /// The connection's user.
        uid: Uid,
        /// The item to fetch next.
        hash: Root,
    },
}

/// One scheduling pass.
///
/// While free slots and candidates remain: the top candidate is dialed
/// (NCO → EXP) or assigned its best source (IDL → ACT, consuming a
/// slot). Equal priorities fall to alphabetical destination order; file
/// lists outrank regular files; dials do not consume a download slot
/// until the transfer starts.
#[must_use]
pub fn scan(queue: &mut Queue, download_slots: u32) -> Vec<SchedAction> {
    let mut actions = Vec::new();
    let mut free = download_slots.saturating_sub(queue.active_count());
    loop {
        if free == 0 {
            break;
        }
        let candidates = queue.candidates();
        let Some(&uid) = candidates.first() else {
            break;
        };
        let state = queue.user(uid).map(|u| u.state);
        match state {
            Some(UserState::Nco) => {
                queue.mark_dialing(uid);
                actions.push(SchedAction::Dial(uid));
            }
            Some(UserState::Idl) => {
                let Some(hash) = queue.top_enabled(uid) else {
                    break;
                };
                queue.mark_active(uid, hash);
                actions.push(SchedAction::Assign { uid, hash });
                free -= 1;
            }
            _ => break,
        }
    }
    actions
}

/// The debounced scan driver.
///
/// [`Scheduler::kick`] is cheap and callable from anywhere; the task
/// spawned by [`Scheduler::run`] wakes, sleeps out the debounce, ticks
/// the WAI timers, scans, and emits actions.
pub struct Scheduler {
    notify: Arc<Notify>,
    queue: Arc<Mutex<Queue>>,
}

impl Scheduler {
    /// New scheduler over a shared queue.
    #[must_use]
    pub fn new(queue: Arc<Mutex<Queue>>) -> Self {
        Self::with_notify(queue, Arc::new(Notify::new()))
    }

    /// New scheduler kicked through an existing notify handle.
    #[must_use]
    pub fn with_notify(queue: Arc<Mutex<Queue>>, notify: Arc<Notify>) -> Self {
        Self { notify, queue }
    }

    /// The shared queue handle.
    #[must_use]
    pub fn queue(&self) -> Arc<Mutex<Queue>> {
        Arc::clone(&self.queue)
    }

    /// Set the coalesced needs-start flag.
    pub fn kick(&self) {
        self.notify.notify_one();
    }

    /// A cloneable kicker for other tasks.
    #[must_use]
    pub fn kicker(&self) -> Arc<Notify> {
        Arc::clone(&self.notify)
    }

    /// Run the debounce loop. `slots` is re-read each pass so a config
    /// change takes effect on the next scan.
    pub async fn run(
        self,
        slots: impl Fn() -> u32 + Send + 'static,
        actions: mpsc::UnboundedSender<SchedAction>,
    ) {
        loop {
            self.notify.notified().await;
            tokio::time::sleep(SCAN_DEBOUNCE).await;
            // Consume any kicks that arrived during the debounce window.
            let pass = {
                let mut queue = self
                    .queue
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                queue.tick_waits(Instant::now());
                scan(&mut queue, slots())
            };
            for action in pass {
                if actions.send(action).is_err() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::DlItem;
    use crate::queue::Queue;

    fn hash(b: u8) -> Root {
        Root([b; 24])
    }

    fn ready_user(q: &mut Queue, uid: Uid, item_byte: u8, dest: &str) {
        q.insert(DlItem::new(hash(item_byte), 1000, dest.into(), false));
        q.add_source(hash(item_byte), uid);
        q.set_online(uid, true);
        q.mark_dialing(uid);
        q.mark_connected(uid);
    }

    #[test]
    fn scan_dials_cold_users() {
        let mut q = Queue::new();
        q.insert(DlItem::new(hash(1), 10, "/dl/a".into(), false));
        q.add_source(hash(1), Uid(1));
        q.set_online(Uid(1), true);

        let actions = scan(&mut q, 3);
        assert_eq!(actions, vec![SchedAction::Dial(Uid(1))]);
        assert_eq!(q.user(Uid(1)).unwrap().state, UserState::Exp);
        // A second scan does nothing while the dial is pending.
        assert!(scan(&mut q, 3).is_empty());
    }

    #[test]
    fn scan_assigns_idle_users_and_consumes_slots() {
        let mut q = Queue::new();
        ready_user(&mut q, Uid(1), 1, "/dl/a");
        ready_user(&mut q, Uid(2), 2, "/dl/b");

        let actions = scan(&mut q, 1);
        assert_eq!(
            actions,
            vec![SchedAction::Assign {
                uid: Uid(1),
                hash: hash(1)
            }]
        );
        // Slot exhausted; the second user waits for the next pass.
        assert_eq!(q.user(Uid(2)).unwrap().state, UserState::Idl);
    }

    #[test]
    fn fairness_distinct_users_get_distinct_slots() {
        // With K free slots and K idle users, one pass starts K
        // transfers on K distinct users.
        const K: u64 = 4;
        let mut q = Queue::new();
        for i in 0..K {
            ready_user(&mut q, Uid(i), i as u8 + 1, &format!("/dl/{i}"));
        }
        let actions = scan(&mut q, K as u32);
        let mut uids: Vec<Uid> = actions
            .iter()
            .map(|a| match a {
                SchedAction::Assign { uid, .. } => *uid,
                SchedAction::Dial(uid) => *uid,
            })
            .collect();
        uids.sort();
        uids.dedup();
        assert_eq!(uids.len(), K as usize);
        assert_eq!(q.active_count(), K as u32);
    }

    #[test]
    fn scan_respects_existing_active_transfers() {
        let mut q = Queue::new();
        ready_user(&mut q, Uid(1), 1, "/dl/a");
        ready_user(&mut q, Uid(2), 2, "/dl/b");
        q.mark_active(Uid(1), hash(1));

        // One configured slot, already occupied.
        assert!(scan(&mut q, 1).is_empty());
        let actions = scan(&mut q, 2);
        assert_eq!(actions.len(), 1);
    }

    #[test]
    fn filelists_win_the_next_slot() {
        let mut q = Queue::new();
        ready_user(&mut q, Uid(1), 1, "/dl/zzz");
        let fl = crate::item::filelist_hash(Uid(1));
        q.insert(DlItem::new(fl, 0, "/dl/aaa-list".into(), true));
        q.add_source(fl, Uid(1));

        let actions = scan(&mut q, 1);
        assert_eq!(
            actions,
            vec![SchedAction::Assign {
                uid: Uid(1),
                hash: fl
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn debounce_coalesces_kicks() {
        let queue = Arc::new(Mutex::new(Queue::new()));
        {
            let mut q = queue.lock().unwrap();
            q.insert(DlItem::new(hash(1), 10, "/dl/a".into(), false));
            q.add_source(hash(1), Uid(1));
            q.set_online(Uid(1), true);
        }
        let sched = Scheduler::new(Arc::clone(&queue));
        let kicker = sched.kicker();
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(sched.run(|| 4, tx));
        tokio::task::yield_now().await;

        // Many rapid kicks collapse into one scan.
        for _ in 0..10 {
            kicker.notify_one();
        }
        tokio::time::sleep(SCAN_DEBOUNCE * 2).await;
        let first = rx.recv().await.unwrap();
        assert_eq!(first, SchedAction::Dial(Uid(1)));
        assert!(rx.try_recv().is_err());
    }
}
